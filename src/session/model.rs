//! Conversation model.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A logical chat bound to a working directory.
///
/// One conversation may span several engine sessions — each resume assigns a
/// fresh session id. `session_ids` keeps the full history in assignment
/// order; `current_session_id` points at the latest and is what a new
/// execution resumes from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    /// Working directory the engine runs in.
    pub folder: PathBuf,
    pub current_session_id: Option<String>,
    pub session_ids: Vec<String>,
    /// Permission mode forwarded to the engine, if any.
    pub permission_mode: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// Create a new conversation with no engine session yet.
    pub fn new(folder: impl Into<PathBuf>, permission_mode: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            folder: folder.into(),
            current_session_id: None,
            session_ids: Vec::new(),
            permission_mode,
            created_at: now,
            updated_at: now,
        }
    }
}
