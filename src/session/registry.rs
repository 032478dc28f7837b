//! Active session registry — at most one running execution per conversation.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Error, SessionError};
use crate::session::engine::{Engine, EngineRequest};
use crate::session::events::StreamEvent;
use crate::session::stream::EventStream;
use crate::store::Database;

/// A running execution tracked by the registry.
struct Execution {
    cancel: CancellationToken,
    stream: Arc<EventStream>,
}

/// A successful dispatch: the execution's multiplexer plus a receiver that
/// was subscribed before any event could be published, so the dispatching
/// caller observes the full sequence. Late joiners attach via
/// [`ActiveSessions::lookup`] and subscribe from that point on.
pub struct Dispatched {
    pub stream: Arc<EventStream>,
    pub events: broadcast::Receiver<StreamEvent>,
}

/// In-memory registry of running executions, keyed by conversation id.
///
/// The registry is the single source of truth for "is this conversation
/// busy". Mutating operations (`dispatch`, `cancel`, terminal-event removal)
/// serialize on the table's write lock; `lookup` only takes the read lock.
pub struct ActiveSessions {
    engine: Arc<dyn Engine>,
    store: Arc<dyn Database>,
    executions: Arc<RwLock<HashMap<Uuid, Execution>>>,
}

impl ActiveSessions {
    pub fn new(engine: Arc<dyn Engine>, store: Arc<dyn Database>) -> Arc<Self> {
        Arc::new(Self {
            engine,
            store,
            executions: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Dispatch a prompt against a conversation.
    ///
    /// Policy: a busy conversation is rejected with
    /// [`SessionError::AlreadyRunning`]; callers that want to attach to the
    /// live stream instead use `lookup`. Fails with
    /// [`SessionError::ConversationNotFound`] for an unknown id. Either
    /// failure leaves no execution behind.
    pub async fn dispatch(&self, conversation_id: Uuid, prompt: &str) -> Result<Dispatched, Error> {
        let conversation = self
            .store
            .get_conversation(conversation_id)
            .await?
            .ok_or(SessionError::ConversationNotFound(conversation_id))?;

        let cancel = CancellationToken::new();
        let (stream, events) = EventStream::new();
        let stream = Arc::new(stream);

        // Claim the slot before starting the engine; a start failure
        // releases it below.
        {
            let mut executions = self.executions.write().await;
            if executions.contains_key(&conversation_id) {
                return Err(SessionError::AlreadyRunning(conversation_id).into());
            }
            executions.insert(
                conversation_id,
                Execution {
                    cancel: cancel.clone(),
                    stream: Arc::clone(&stream),
                },
            );
        }

        let request = EngineRequest {
            conversation,
            prompt: prompt.to_string(),
            cancel,
        };
        let mut engine_events = match self.engine.start(request).await {
            Ok(rx) => rx,
            Err(e) => {
                self.executions.write().await.remove(&conversation_id);
                return Err(Error::Engine(e));
            }
        };

        info!(%conversation_id, "Execution started");

        // Forward engine output to subscribers and retire the entry on the
        // terminal event, or on channel close without one (cancellation).
        let table = Arc::clone(&self.executions);
        let forward_stream = Arc::clone(&stream);
        tokio::spawn(async move {
            let mut terminal = false;
            while let Some(event) = engine_events.recv().await {
                let is_terminal = event.is_terminal();
                forward_stream.publish(event).await;
                if is_terminal {
                    terminal = true;
                    break;
                }
            }
            forward_stream.close().await;
            table.write().await.remove(&conversation_id);
            if terminal {
                debug!(%conversation_id, "Execution finished");
            } else {
                debug!(%conversation_id, "Execution ended without terminal event (cancelled)");
            }
        });

        Ok(Dispatched { stream, events })
    }

    /// Find the live stream for a conversation, if one is running.
    ///
    /// `None` is the "no active stream" outcome a reconnecting caller sees —
    /// it is not an error.
    pub async fn lookup(&self, conversation_id: Uuid) -> Option<Arc<EventStream>> {
        self.executions
            .read()
            .await
            .get(&conversation_id)
            .map(|execution| Arc::clone(&execution.stream))
    }

    /// Cancel a running execution and release its slot.
    ///
    /// Returns whether an execution existed; a second call for the same
    /// conversation reports `false`.
    pub async fn cancel(&self, conversation_id: Uuid) -> bool {
        let removed = self.executions.write().await.remove(&conversation_id);
        match removed {
            Some(execution) => {
                execution.cancel.cancel();
                execution.stream.close().await;
                info!(%conversation_id, "Execution cancelled");
                true
            }
            None => false,
        }
    }

    /// Number of running executions.
    pub async fn running_count(&self) -> usize {
        self.executions.read().await.len()
    }
}
