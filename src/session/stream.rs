//! Event multiplexer — fan-out of one execution's events to any number of
//! live subscribers.

use tokio::sync::broadcast;
use tokio::sync::Mutex;

use crate::error::SessionError;
use crate::session::events::StreamEvent;

/// Default broadcast channel capacity.
const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// Single-producer, multiple-consumer broadcaster for one execution.
///
/// Subscribers only see events published after they joined — there is no
/// replay buffer. After the terminal event (or a cancellation, which sends
/// no terminal event) the stream is closed: the sender is dropped so every
/// live receiver observes `RecvError::Closed` once it has drained, and
/// further `subscribe` calls fail with [`SessionError::StreamEnded`].
/// Unsubscribing is dropping the receiver, which is safe at any time.
pub struct EventStream {
    tx: Mutex<Option<broadcast::Sender<StreamEvent>>>,
}

impl EventStream {
    /// Create a stream together with a receiver subscribed from the very
    /// first event.
    pub fn new() -> (Self, broadcast::Receiver<StreamEvent>) {
        let (tx, rx) = broadcast::channel(DEFAULT_BROADCAST_CAPACITY);
        (
            Self {
                tx: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    /// Subscribe to live events from this point on.
    pub async fn subscribe(&self) -> Result<broadcast::Receiver<StreamEvent>, SessionError> {
        match self.tx.lock().await.as_ref() {
            Some(tx) => Ok(tx.subscribe()),
            None => Err(SessionError::StreamEnded),
        }
    }

    /// Publish one event to all current subscribers. Dropped silently after
    /// close, and when nobody is listening.
    pub(crate) async fn publish(&self, event: StreamEvent) {
        if let Some(tx) = self.tx.lock().await.as_ref() {
            let _ = tx.send(event);
        }
    }

    /// Close the stream. Idempotent.
    pub(crate) async fn close(&self) {
        self.tx.lock().await.take();
    }

    /// Whether the stream has ended.
    pub async fn is_closed(&self) -> bool {
        self.tx.lock().await.is_none()
    }
}
