//! Session execution core — path resolver, engine adapter, active session
//! registry, and event multiplexer.

pub mod engine;
pub mod events;
pub mod model;
pub mod registry;
pub mod resolver;
pub mod stream;

pub use engine::{CliEngine, Engine, EngineRequest};
pub use events::StreamEvent;
pub use model::Conversation;
pub use registry::{ActiveSessions, Dispatched};
pub use resolver::ProjectResolver;
pub use stream::EventStream;
