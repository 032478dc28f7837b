//! Persistence layer — conversations and queue items behind one async trait.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{Database, QueueItemUpdate};
