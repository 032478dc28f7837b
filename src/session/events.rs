//! Stream events — the units of incremental output from one execution.

use serde::{Deserialize, Serialize};

/// One unit of incremental output from a running execution.
///
/// Events are delivered to every subscriber in emission order. `Done` and
/// `Error` are terminal: exactly one of them ends a stream, except for a
/// caller-initiated cancellation, which ends the stream without either.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Text {
        content: String,
    },
    Thinking {
        content: String,
    },
    ToolUse {
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        content: String,
    },
    Done,
    Error {
        message: String,
    },
}

impl StreamEvent {
    /// Whether this event ends the execution's lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done | StreamEvent::Error { .. })
    }
}
