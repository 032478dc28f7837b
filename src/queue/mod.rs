//! Deferred message queue — model and background scheduler.

pub mod model;
pub mod scheduler;

pub use model::{QueueItem, QueueStatus};
pub use scheduler::QueueScheduler;
