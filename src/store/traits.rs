//! Unified `Database` trait — single async interface for all persistence.
//!
//! The core treats storage as a collaborator: conversations and queue items
//! are the only records it reads or writes, and it assumes read-committed
//! semantics per record, nothing more.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::queue::model::{QueueItem, QueueStatus};
use crate::session::model::Conversation;

/// Field changes the scheduler applies to a queue item. Unset fields are
/// left untouched.
#[derive(Debug, Default, Clone)]
pub struct QueueItemUpdate {
    pub status: Option<QueueStatus>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub retry_count: Option<u32>,
    pub last_error: Option<String>,
}

impl QueueItemUpdate {
    pub fn status(status: QueueStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

/// Backend-agnostic database trait covering conversations and the queue.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Conversations ───────────────────────────────────────────────

    /// Create a conversation bound to a working directory.
    async fn create_conversation(
        &self,
        folder: &Path,
        permission_mode: Option<&str>,
    ) -> Result<Conversation, DatabaseError>;

    /// Get a conversation by id.
    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>, DatabaseError>;

    /// Record a freshly assigned engine session id: appends it to the
    /// history and makes it current.
    async fn append_session_id(&self, id: Uuid, session_id: &str) -> Result<(), DatabaseError>;

    // ── Queue ───────────────────────────────────────────────────────

    /// Insert a new queue item.
    async fn insert_queue_item(&self, item: &QueueItem) -> Result<(), DatabaseError>;

    /// Get a queue item by id.
    async fn get_queue_item(&self, id: Uuid) -> Result<Option<QueueItem>, DatabaseError>;

    /// Pending items whose scheduled time is due, earliest first, at most
    /// `limit`.
    async fn get_due_queue_items(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueItem>, DatabaseError>;

    /// Apply field changes to a queue item.
    async fn update_queue_item(
        &self,
        id: Uuid,
        update: QueueItemUpdate,
    ) -> Result<(), DatabaseError>;

    /// Delete a queue item.
    async fn delete_queue_item(&self, id: Uuid) -> Result<(), DatabaseError>;

    /// Reset orphaned `running` items back to `pending`. Called once at
    /// scheduler start; no execution survives a process restart. Returns
    /// the number of items reset.
    async fn reset_running_queue_items(&self) -> Result<usize, DatabaseError>;
}
