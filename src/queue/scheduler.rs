//! Queue scheduler — delivers due deferred messages through the session
//! machinery, with bounded retry on failure.
//!
//! A single background loop wakes on a fixed interval (and once immediately
//! at start), selects due `pending` items, and processes them strictly
//! sequentially: item N+1 is not dispatched until item N reaches a resolved
//! state. One item's failure never kills the loop; only `stop()` halts it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SchedulerConfig;
use crate::queue::model::{QueueItem, QueueStatus};
use crate::session::events::StreamEvent;
use crate::session::registry::ActiveSessions;
use crate::store::{Database, QueueItemUpdate};

/// Resolved state of one delivery attempt.
enum Outcome {
    Done,
    Error(String),
    /// The stream closed without a terminal event — somebody cancelled the
    /// execution out from under us.
    Cancelled,
}

/// Background scheduler for deferred messages.
pub struct QueueScheduler {
    config: SchedulerConfig,
    store: Arc<dyn Database>,
    sessions: Arc<ActiveSessions>,
    started: AtomicBool,
    shutdown: CancellationToken,
    /// Single-flight guard: a wake that finds the previous cycle still in
    /// flight is a no-op.
    cycle_guard: Mutex<()>,
}

impl QueueScheduler {
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn Database>,
        sessions: Arc<ActiveSessions>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            sessions,
            started: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            cycle_guard: Mutex::new(()),
        })
    }

    /// Start the polling loop. Idempotent: a second call while already
    /// running is a no-op.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            debug!("Queue scheduler already running");
            return;
        }

        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            info!(
                interval_secs = scheduler.config.poll_interval.as_secs(),
                batch_size = scheduler.config.batch_size,
                "Queue scheduler started"
            );

            // Crash recovery: no execution survives a restart, so anything
            // still marked running is an orphan from a previous process.
            match scheduler.store.reset_running_queue_items().await {
                Ok(0) => {}
                Ok(reset) => info!(count = reset, "Reset orphaned running queue items"),
                Err(e) => warn!(error = %e, "Failed to reset orphaned queue items"),
            }

            let mut tick = tokio::time::interval(scheduler.config.poll_interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

            // First tick fires immediately.
            loop {
                tokio::select! {
                    _ = scheduler.shutdown.cancelled() => break,
                    _ = tick.tick() => {}
                }

                let cycle = Arc::clone(&scheduler);
                tokio::spawn(async move {
                    let Ok(_guard) = cycle.cycle_guard.try_lock() else {
                        debug!("Previous cycle still in flight, skipping wake");
                        return;
                    };
                    cycle.run_cycle().await;
                });
            }

            info!("Queue scheduler stopped");
        });
    }

    /// Request the polling loop to halt. Idempotent; an in-flight item
    /// finishes its current step, nothing is forcibly cancelled.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Run one polling cycle: select due items and process them in order.
    ///
    /// The background loop calls this on every wake; callers may also invoke
    /// it directly to drain due work without waiting for the next tick.
    pub async fn run_cycle(&self) {
        let due = match self
            .store
            .get_due_queue_items(self.config.batch_size, Utc::now())
            .await
        {
            Ok(items) => items,
            Err(e) => {
                warn!(error = %e, "Failed to select due queue items");
                return;
            }
        };

        if due.is_empty() {
            debug!("No due queue items");
            return;
        }

        info!(count = due.len(), "Processing due queue items");
        for item in due {
            if self.shutdown.is_cancelled() {
                debug!("Stop requested, leaving remaining items for later");
                break;
            }
            self.process_item(item).await;
        }
    }

    /// Deliver one item and apply the resulting state transition.
    async fn process_item(&self, item: QueueItem) {
        debug!(item_id = %item.id, retry_count = item.retry_count, "Delivering queued message");

        if let Err(e) = self
            .store
            .update_queue_item(item.id, QueueItemUpdate::status(QueueStatus::Running))
            .await
        {
            // Leave it pending; the next cycle retries the pickup.
            warn!(item_id = %item.id, error = %e, "Failed to mark queue item running");
            return;
        }

        match self.deliver(&item).await {
            Outcome::Done => {
                match self.store.delete_queue_item(item.id).await {
                    Ok(()) => info!(item_id = %item.id, "Queued message delivered"),
                    Err(e) => {
                        warn!(item_id = %item.id, error = %e, "Failed to delete completed item")
                    }
                }
            }
            Outcome::Cancelled => {
                // Neither success nor failure. The item stays running for
                // operator inspection; the crash-recovery sweep re-queues it
                // on the next scheduler start.
                warn!(item_id = %item.id, "Execution cancelled while delivering queued message");
            }
            Outcome::Error(message) => self.record_failure(&item, message).await,
        }
    }

    /// Dispatch the item's message and wait for the execution to resolve.
    async fn deliver(&self, item: &QueueItem) -> Outcome {
        let conversation_id = match item.conversation_id {
            Some(id) => id,
            None => {
                let Some(folder) = item.new_conversation_folder.as_deref() else {
                    return Outcome::Error(
                        "queue item has neither a conversation nor a folder".to_string(),
                    );
                };
                match self
                    .store
                    .create_conversation(folder, item.permission_mode.as_deref())
                    .await
                {
                    Ok(conversation) => conversation.id,
                    Err(e) => {
                        return Outcome::Error(format!("failed to create conversation: {e}"));
                    }
                }
            }
        };

        // A dispatch failure (unknown conversation, busy conversation,
        // engine spawn error) counts exactly like a terminal error event.
        let dispatched = match self.sessions.dispatch(conversation_id, &item.message).await {
            Ok(dispatched) => dispatched,
            Err(e) => return Outcome::Error(e.to_string()),
        };

        let mut events = dispatched.events;
        loop {
            match events.recv().await {
                Ok(StreamEvent::Done) => return Outcome::Done,
                Ok(StreamEvent::Error { message }) => return Outcome::Error(message),
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => {
                    debug!(%conversation_id, missed, "Scheduler lagged behind stream");
                }
                Err(RecvError::Closed) => return Outcome::Cancelled,
            }
        }
    }

    /// Retry accounting: reschedule with exponential backoff, or mark the
    /// item failed once the ceiling is reached.
    async fn record_failure(&self, item: &QueueItem, message: String) {
        let retry_count = item.retry_count + 1;

        let update = if retry_count >= self.config.max_retries {
            warn!(
                item_id = %item.id,
                retry_count,
                error = %message,
                "Queue item failed permanently"
            );
            QueueItemUpdate {
                status: Some(QueueStatus::Failed),
                retry_count: Some(retry_count),
                last_error: Some(message),
                ..QueueItemUpdate::default()
            }
        } else {
            let backoff = chrono::Duration::minutes(1i64 << retry_count);
            let next_attempt = Utc::now() + backoff;
            info!(
                item_id = %item.id,
                retry_count,
                next_attempt = %next_attempt,
                error = %message,
                "Queue item failed, rescheduling"
            );
            QueueItemUpdate {
                status: Some(QueueStatus::Pending),
                scheduled_at: Some(next_attempt),
                retry_count: Some(retry_count),
                last_error: Some(message),
            }
        };

        if let Err(e) = self.store.update_queue_item(item.id, update).await {
            warn!(item_id = %item.id, error = %e, "Failed to record queue item failure");
        }
    }
}
