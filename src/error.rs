//! Error types for Agent Console.

use uuid::Uuid;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Session lifecycle errors, reported synchronously to dispatch callers.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Conversation {0} not found")]
    ConversationNotFound(Uuid),

    #[error("Conversation {0} already has a running execution")]
    AlreadyRunning(Uuid),

    #[error("Stream has already ended")]
    StreamEnded,
}

/// External engine invocation errors. Cancellation is not an error and never
/// appears here.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Failed to spawn engine binary {binary}: {source}")]
    SpawnFailed {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Engine exited unexpectedly: {0}")]
    Exited(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
