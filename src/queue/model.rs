//! Queue item model — deferred messages awaiting scheduled delivery.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a queued message.
///
/// `Draft` items are invisible to the scheduler until explicitly promoted to
/// `Pending`. Once a status leaves `Draft`, only the scheduler mutates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Draft,
    Pending,
    Running,
    Completed,
    Failed,
}

/// A deferred message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: Uuid,
    /// Target conversation. `None` means create a new conversation in
    /// `new_conversation_folder` when the item fires.
    pub conversation_id: Option<Uuid>,
    pub new_conversation_folder: Option<PathBuf>,
    /// Permission mode for a newly created conversation.
    pub permission_mode: Option<String>,
    pub message: String,
    pub scheduled_at: DateTime<Utc>,
    pub status: QueueStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl QueueItem {
    /// Schedule a message for an existing conversation.
    pub fn scheduled(
        conversation_id: Uuid,
        message: impl Into<String>,
        scheduled_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation_id: Some(conversation_id),
            new_conversation_folder: None,
            permission_mode: None,
            message: message.into(),
            scheduled_at,
            status: QueueStatus::Pending,
            retry_count: 0,
            last_error: None,
            created_at: Utc::now(),
        }
    }

    /// Schedule a message that starts a fresh conversation when it fires.
    pub fn scheduled_new_conversation(
        folder: impl Into<PathBuf>,
        permission_mode: Option<String>,
        message: impl Into<String>,
        scheduled_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation_id: None,
            new_conversation_folder: Some(folder.into()),
            permission_mode,
            message: message.into(),
            scheduled_at,
            status: QueueStatus::Pending,
            retry_count: 0,
            last_error: None,
            created_at: Utc::now(),
        }
    }

    /// Create a draft. Drafts keep their tentative scheduled time but are
    /// ignored by the scheduler until promoted to `Pending`.
    pub fn draft(
        conversation_id: Uuid,
        message: impl Into<String>,
        scheduled_at: DateTime<Utc>,
    ) -> Self {
        Self {
            status: QueueStatus::Draft,
            ..Self::scheduled(conversation_id, message, scheduled_at)
        }
    }
}
