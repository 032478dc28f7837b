//! Execution engine adapter — wraps one streaming invocation of the
//! external assistant CLI.
//!
//! The engine is an opaque binary that takes a prompt, emits one JSON object
//! per stdout line (`--output-format stream-json`), and assigns a session id
//! on startup. `CliEngine` translates those lines into [`StreamEvent`]s and
//! records freshly assigned session ids through the persistence trait. A
//! cancellation stops consumption at the next line boundary and kills the
//! child without emitting a terminal event.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_stream::wrappers::LinesStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::session::events::StreamEvent;
use crate::session::model::Conversation;
use crate::session::resolver::ProjectResolver;
use crate::store::Database;

/// Channel capacity between the line reader and the registry's forwarder.
const EVENT_BUFFER: usize = 64;

/// One engine invocation request.
pub struct EngineRequest {
    pub conversation: Conversation,
    pub prompt: String,
    /// Cooperative cancellation signal, checked at every unit boundary.
    pub cancel: CancellationToken,
}

/// An external execution engine.
///
/// Events arrive on the returned channel in emission order. The sender side
/// closes after a terminal event, or without one when `request.cancel` fires
/// first — callers treat a closed channel without a terminal event as a
/// cancellation, not a failure.
#[async_trait]
pub trait Engine: Send + Sync {
    async fn start(
        &self,
        request: EngineRequest,
    ) -> Result<mpsc::Receiver<StreamEvent>, EngineError>;
}

/// Engine implementation that spawns the assistant CLI as a child process.
pub struct CliEngine {
    config: EngineConfig,
    store: Arc<dyn Database>,
    resolver: ProjectResolver,
}

impl CliEngine {
    pub fn new(config: EngineConfig, store: Arc<dyn Database>) -> Self {
        let resolver = ProjectResolver::new(config.projects_root.clone());
        Self {
            config,
            store,
            resolver,
        }
    }
}

#[async_trait]
impl Engine for CliEngine {
    async fn start(
        &self,
        request: EngineRequest,
    ) -> Result<mpsc::Receiver<StreamEvent>, EngineError> {
        let conversation = &request.conversation;

        let mut cmd = Command::new(&self.config.binary);
        cmd.arg("-p")
            .arg(&request.prompt)
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose")
            .current_dir(&conversation.folder)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        if let Some(session_id) = &conversation.current_session_id {
            cmd.arg("--resume").arg(session_id);
        }
        if let Some(mode) = &conversation.permission_mode {
            cmd.arg("--permission-mode").arg(mode);
        }

        let mut child = cmd.spawn().map_err(|e| EngineError::SpawnFailed {
            binary: self.config.binary.clone(),
            source: e,
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Io(std::io::Error::other("stdout not captured")))?;

        debug!(
            conversation_id = %conversation.id,
            binary = %self.config.binary,
            folder = %conversation.folder.display(),
            resume = conversation.current_session_id.as_deref().unwrap_or("-"),
            "Engine process spawned"
        );

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let store = Arc::clone(&self.store);
        let resolver = self.resolver.clone();
        let conversation_id = conversation.id;
        let cancel = request.cancel.clone();
        tokio::spawn(async move {
            consume_output(child, stdout, store, resolver, conversation_id, cancel, tx).await;
        });

        Ok(rx)
    }
}

/// Read the child's stdout line by line until a terminal event, EOF, or
/// cancellation.
async fn consume_output(
    mut child: Child,
    stdout: tokio::process::ChildStdout,
    store: Arc<dyn Database>,
    resolver: ProjectResolver,
    conversation_id: Uuid,
    cancel: CancellationToken,
    tx: mpsc::Sender<StreamEvent>,
) {
    let mut lines = LinesStream::new(BufReader::new(stdout).lines());
    let mut saw_terminal = false;

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(%conversation_id, "Execution cancelled, stopping engine");
                let _ = child.kill().await;
                return;
            }
            next = lines.next() => next,
        };

        match next {
            Some(Ok(line)) => {
                let Some(parsed) = parse_line(&line) else {
                    debug!(%conversation_id, "Skipping unrecognized engine output line");
                    continue;
                };

                if let Some(session_id) = parsed.session_id {
                    if let Err(e) = store.append_session_id(conversation_id, &session_id).await {
                        warn!(%conversation_id, error = %e, "Failed to record engine session id");
                    }
                    match resolver.find_transcript(&session_id) {
                        Some(transcript) => debug!(
                            %conversation_id,
                            %session_id,
                            transcript = %transcript.display(),
                            "Engine session started"
                        ),
                        None => debug!(
                            %conversation_id,
                            %session_id,
                            "Engine session started (transcript not written yet)"
                        ),
                    }
                }

                for event in parsed.events {
                    let terminal = event.is_terminal();
                    let _ = tx.send(event).await;
                    if terminal {
                        saw_terminal = true;
                    }
                }
                if saw_terminal {
                    break;
                }
            }
            Some(Err(e)) => {
                let _ = tx
                    .send(StreamEvent::Error {
                        message: format!("engine output read failed: {e}"),
                    })
                    .await;
                saw_terminal = true;
                break;
            }
            None => break, // EOF
        }
    }

    match child.wait().await {
        Ok(status) if !saw_terminal => {
            // The engine died without a result line.
            let _ = tx
                .send(StreamEvent::Error {
                    message: format!("engine exited without a result ({status})"),
                })
                .await;
        }
        Ok(_) => {}
        Err(e) => {
            warn!(%conversation_id, error = %e, "Failed to reap engine process");
        }
    }
}

/// Everything one engine output line can carry.
#[derive(Debug, Default, PartialEq)]
struct ParsedLine {
    /// Set on the init unit; the first one per invocation is the freshly
    /// assigned session id.
    session_id: Option<String>,
    events: Vec<StreamEvent>,
}

/// Translate one stream-json line into stream events.
///
/// Returns `None` for lines that are not valid JSON objects with a `type`
/// field; unknown types and content blocks are skipped, not errors.
fn parse_line(line: &str) -> Option<ParsedLine> {
    let value: Value = serde_json::from_str(line).ok()?;
    let kind = value.get("type").and_then(Value::as_str)?;

    let mut parsed = ParsedLine::default();
    match kind {
        "system" => {
            if value.get("subtype").and_then(Value::as_str) == Some("init") {
                parsed.session_id = value
                    .get("session_id")
                    .and_then(Value::as_str)
                    .map(str::to_string);
            }
        }
        "assistant" | "user" => {
            let blocks = value
                .pointer("/message/content")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            for block in &blocks {
                match block.get("type").and_then(Value::as_str) {
                    Some("text") => parsed.events.push(StreamEvent::Text {
                        content: text_field(block, "text"),
                    }),
                    Some("thinking") => parsed.events.push(StreamEvent::Thinking {
                        content: text_field(block, "thinking"),
                    }),
                    Some("tool_use") => parsed.events.push(StreamEvent::ToolUse {
                        name: text_field(block, "name"),
                        input: block.get("input").cloned().unwrap_or(Value::Null),
                    }),
                    Some("tool_result") => parsed.events.push(StreamEvent::ToolResult {
                        content: stringify_content(block.get("content")),
                    }),
                    _ => {}
                }
            }
        }
        "result" => {
            let subtype = value
                .get("subtype")
                .and_then(Value::as_str)
                .unwrap_or("success");
            if subtype == "success" {
                parsed.events.push(StreamEvent::Done);
            } else {
                let message = value
                    .get("result")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| subtype.to_string());
                parsed.events.push(StreamEvent::Error { message });
            }
        }
        _ => {}
    }
    Some(parsed)
}

fn text_field(block: &Value, key: &str) -> String {
    block
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Tool results carry either a plain string or structured content blocks;
/// either way subscribers get a string body.
fn stringify_content(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}
