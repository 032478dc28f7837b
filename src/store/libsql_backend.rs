//! libSQL backend — async `Database` trait implementation.
//!
//! Supports local file and in-memory databases; the in-memory variant is
//! what the tests run against.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{params, Connection, Database as LibSqlDatabase};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::queue::model::{QueueItem, QueueStatus};
use crate::session::model::Conversation;
use crate::store::migrations;
use crate::store::traits::{Database, QueueItemUpdate};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 datetime string (our canonical write format).
fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn status_to_str(status: &QueueStatus) -> &'static str {
    match status {
        QueueStatus::Draft => "draft",
        QueueStatus::Pending => "pending",
        QueueStatus::Running => "running",
        QueueStatus::Completed => "completed",
        QueueStatus::Failed => "failed",
    }
}

fn str_to_status(s: &str) -> QueueStatus {
    match s {
        "pending" => QueueStatus::Pending,
        "running" => QueueStatus::Running,
        "completed" => QueueStatus::Completed,
        "failed" => QueueStatus::Failed,
        _ => QueueStatus::Draft,
    }
}

fn parse_uuid(s: &str, entity: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s)
        .map_err(|e| DatabaseError::Serialization(format!("bad {entity} id {s}: {e}")))
}

const CONVERSATION_COLUMNS: &str =
    "id, folder, current_session_id, session_ids, permission_mode, created_at, updated_at";

fn row_to_conversation(row: &libsql::Row) -> Result<Conversation, DatabaseError> {
    let id: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("conversation id: {e}")))?;
    let folder: String = row
        .get(1)
        .map_err(|e| DatabaseError::Query(format!("conversation folder: {e}")))?;
    let current_session_id: Option<String> = row
        .get(2)
        .map_err(|e| DatabaseError::Query(format!("conversation session id: {e}")))?;
    let session_ids_json: String = row
        .get(3)
        .map_err(|e| DatabaseError::Query(format!("conversation session ids: {e}")))?;
    let permission_mode: Option<String> = row
        .get(4)
        .map_err(|e| DatabaseError::Query(format!("conversation permission mode: {e}")))?;
    let created_at: String = row
        .get(5)
        .map_err(|e| DatabaseError::Query(format!("conversation created_at: {e}")))?;
    let updated_at: String = row
        .get(6)
        .map_err(|e| DatabaseError::Query(format!("conversation updated_at: {e}")))?;

    let session_ids: Vec<String> = serde_json::from_str(&session_ids_json)
        .map_err(|e| DatabaseError::Serialization(format!("session_ids: {e}")))?;

    Ok(Conversation {
        id: parse_uuid(&id, "conversation")?,
        folder: PathBuf::from(folder),
        current_session_id,
        session_ids,
        permission_mode,
        created_at: parse_datetime(&created_at),
        updated_at: parse_datetime(&updated_at),
    })
}

const QUEUE_COLUMNS: &str = "id, conversation_id, new_conversation_folder, permission_mode, \
     message, scheduled_at, status, retry_count, last_error, created_at";

fn row_to_queue_item(row: &libsql::Row) -> Result<QueueItem, DatabaseError> {
    let id: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("queue item id: {e}")))?;
    let conversation_id: Option<String> = row
        .get(1)
        .map_err(|e| DatabaseError::Query(format!("queue item conversation: {e}")))?;
    let new_conversation_folder: Option<String> = row
        .get(2)
        .map_err(|e| DatabaseError::Query(format!("queue item folder: {e}")))?;
    let permission_mode: Option<String> = row
        .get(3)
        .map_err(|e| DatabaseError::Query(format!("queue item permission mode: {e}")))?;
    let message: String = row
        .get(4)
        .map_err(|e| DatabaseError::Query(format!("queue item message: {e}")))?;
    let scheduled_at: String = row
        .get(5)
        .map_err(|e| DatabaseError::Query(format!("queue item scheduled_at: {e}")))?;
    let status: String = row
        .get(6)
        .map_err(|e| DatabaseError::Query(format!("queue item status: {e}")))?;
    let retry_count: i64 = row
        .get(7)
        .map_err(|e| DatabaseError::Query(format!("queue item retry count: {e}")))?;
    let last_error: Option<String> = row
        .get(8)
        .map_err(|e| DatabaseError::Query(format!("queue item last error: {e}")))?;
    let created_at: String = row
        .get(9)
        .map_err(|e| DatabaseError::Query(format!("queue item created_at: {e}")))?;

    let conversation_id = conversation_id
        .map(|s| parse_uuid(&s, "queue item conversation"))
        .transpose()?;

    Ok(QueueItem {
        id: parse_uuid(&id, "queue item")?,
        conversation_id,
        new_conversation_folder: new_conversation_folder.map(PathBuf::from),
        permission_mode,
        message,
        scheduled_at: parse_datetime(&scheduled_at),
        status: str_to_status(&status),
        retry_count: retry_count.max(0) as u32,
        last_error,
        created_at: parse_datetime(&created_at),
    })
}

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Conversations ───────────────────────────────────────────────

    async fn create_conversation(
        &self,
        folder: &Path,
        permission_mode: Option<&str>,
    ) -> Result<Conversation, DatabaseError> {
        let conversation = Conversation::new(folder, permission_mode.map(str::to_string));
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO conversations ({CONVERSATION_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
                ),
                params![
                    conversation.id.to_string(),
                    conversation.folder.display().to_string(),
                    conversation.current_session_id.clone(),
                    "[]",
                    conversation.permission_mode.clone(),
                    conversation.created_at.to_rfc3339(),
                    conversation.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_conversation: {e}")))?;

        debug!(conversation_id = %conversation.id, folder = %folder.display(), "Conversation created");
        Ok(conversation)
    }

    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_conversation: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("get_conversation row: {e}")))?
        {
            Some(row) => Ok(Some(row_to_conversation(&row)?)),
            None => Ok(None),
        }
    }

    async fn append_session_id(&self, id: Uuid, session_id: &str) -> Result<(), DatabaseError> {
        let Some(mut conversation) = self.get_conversation(id).await? else {
            return Err(DatabaseError::NotFound {
                entity: "conversation".to_string(),
                id: id.to_string(),
            });
        };

        // A resumed execution re-announces the id it already has.
        if conversation.current_session_id.as_deref() == Some(session_id) {
            return Ok(());
        }

        conversation.session_ids.push(session_id.to_string());
        let session_ids_json = serde_json::to_string(&conversation.session_ids)
            .map_err(|e| DatabaseError::Serialization(format!("session_ids: {e}")))?;

        self.conn()
            .execute(
                "UPDATE conversations \
                 SET current_session_id = ?1, session_ids = ?2, updated_at = ?3 \
                 WHERE id = ?4",
                params![
                    session_id,
                    session_ids_json,
                    Utc::now().to_rfc3339(),
                    id.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("append_session_id: {e}")))?;

        debug!(conversation_id = %id, session_id, "Engine session id recorded");
        Ok(())
    }

    // ── Queue ───────────────────────────────────────────────────────

    async fn insert_queue_item(&self, item: &QueueItem) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO queue_items ({QUEUE_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
                ),
                params![
                    item.id.to_string(),
                    item.conversation_id.map(|id| id.to_string()),
                    item.new_conversation_folder
                        .as_ref()
                        .map(|p| p.display().to_string()),
                    item.permission_mode.clone(),
                    item.message.clone(),
                    item.scheduled_at.to_rfc3339(),
                    status_to_str(&item.status),
                    item.retry_count as i64,
                    item.last_error.clone(),
                    item.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_queue_item: {e}")))?;

        debug!(item_id = %item.id, scheduled_at = %item.scheduled_at, "Queue item inserted");
        Ok(())
    }

    async fn get_queue_item(&self, id: Uuid) -> Result<Option<QueueItem>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {QUEUE_COLUMNS} FROM queue_items WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_queue_item: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("get_queue_item row: {e}")))?
        {
            Some(row) => Ok(Some(row_to_queue_item(&row)?)),
            None => Ok(None),
        }
    }

    async fn get_due_queue_items(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueItem>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {QUEUE_COLUMNS} FROM queue_items \
                     WHERE status = 'pending' AND scheduled_at <= ?1 \
                     ORDER BY scheduled_at ASC LIMIT ?2"
                ),
                params![now.to_rfc3339(), limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_due_queue_items: {e}")))?;

        let mut items = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_queue_item(&row) {
                Ok(item) => items.push(item),
                Err(e) => tracing::warn!("Skipping queue item row: {e}"),
            }
        }
        Ok(items)
    }

    async fn update_queue_item(
        &self,
        id: Uuid,
        update: QueueItemUpdate,
    ) -> Result<(), DatabaseError> {
        let mut sets: Vec<&str> = Vec::new();
        let mut values: Vec<libsql::Value> = Vec::new();

        if let Some(status) = &update.status {
            sets.push("status = ?");
            values.push(status_to_str(status).into());
        }
        if let Some(scheduled_at) = &update.scheduled_at {
            sets.push("scheduled_at = ?");
            values.push(scheduled_at.to_rfc3339().into());
        }
        if let Some(retry_count) = update.retry_count {
            sets.push("retry_count = ?");
            values.push((retry_count as i64).into());
        }
        if let Some(last_error) = &update.last_error {
            sets.push("last_error = ?");
            values.push(last_error.clone().into());
        }
        if sets.is_empty() {
            return Ok(());
        }

        values.push(id.to_string().into());
        self.conn()
            .execute(
                &format!("UPDATE queue_items SET {} WHERE id = ?", sets.join(", ")),
                values,
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_queue_item: {e}")))?;

        Ok(())
    }

    async fn delete_queue_item(&self, id: Uuid) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "DELETE FROM queue_items WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_queue_item: {e}")))?;

        debug!(item_id = %id, "Queue item deleted");
        Ok(())
    }

    async fn reset_running_queue_items(&self) -> Result<usize, DatabaseError> {
        let reset = self
            .conn()
            .execute(
                "UPDATE queue_items SET status = 'pending' WHERE status = 'running'",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("reset_running_queue_items: {e}")))?;

        Ok(reset as usize)
    }
}
