//! Integration tests for the active session registry and event fan-out.
//!
//! Each test wires the registry to a scripted stub engine and an in-memory
//! database, then exercises the real dispatch / lookup / cancel contract.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::time::timeout;
use uuid::Uuid;

use agent_console::error::{EngineError, Error, SessionError};
use agent_console::session::{ActiveSessions, Engine, EngineRequest, StreamEvent};
use agent_console::store::{Database, LibSqlBackend};

/// Maximum time any wait is allowed before we consider the test hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// One scripted step of a stub execution.
#[derive(Clone)]
enum Step {
    Emit(StreamEvent),
    /// Block until the test signals, honoring cancellation.
    Wait(Arc<Notify>),
}

/// Engine stub that plays a fixed script for every dispatch.
struct StubEngine {
    store: Arc<dyn Database>,
    script: Vec<Step>,
}

#[async_trait]
impl Engine for StubEngine {
    async fn start(
        &self,
        request: EngineRequest,
    ) -> Result<mpsc::Receiver<StreamEvent>, EngineError> {
        let (tx, rx) = mpsc::channel(16);
        let script = self.script.clone();
        let store = Arc::clone(&self.store);
        let conversation_id = request.conversation.id;
        let cancel = request.cancel.clone();

        tokio::spawn(async move {
            store
                .append_session_id(conversation_id, "stub-session")
                .await
                .ok();
            for step in script {
                match step {
                    Step::Emit(event) => {
                        let terminal = event.is_terminal();
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            sent = tx.send(event) => {
                                if sent.is_err() {
                                    return;
                                }
                            }
                        }
                        if terminal {
                            return;
                        }
                    }
                    Step::Wait(gate) => {
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = gate.notified() => {}
                        }
                    }
                }
            }
        });

        Ok(rx)
    }
}

/// Engine stub whose start always fails.
struct BrokenEngine;

#[async_trait]
impl Engine for BrokenEngine {
    async fn start(
        &self,
        _request: EngineRequest,
    ) -> Result<mpsc::Receiver<StreamEvent>, EngineError> {
        Err(EngineError::Exited("no binary here".to_string()))
    }
}

/// Build a registry around a scripted stub, with one known conversation.
async fn setup(script: Vec<Step>) -> (Arc<ActiveSessions>, Arc<dyn Database>, Uuid) {
    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let conversation = db
        .create_conversation(Path::new("/tmp/project"), None)
        .await
        .unwrap();
    let engine = Arc::new(StubEngine {
        store: Arc::clone(&db),
        script,
    });
    let sessions = ActiveSessions::new(engine, Arc::clone(&db));
    (sessions, db, conversation.id)
}

/// Drain a receiver until the stream closes.
async fn collect(mut rx: broadcast::Receiver<StreamEvent>) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    loop {
        match rx.recv().await {
            Ok(event) => events.push(event),
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => return events,
        }
    }
}

/// Wait for the registry to retire a finished execution.
async fn wait_until_idle(sessions: &ActiveSessions) {
    for _ in 0..100 {
        if sessions.running_count().await == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("registry never became idle");
}

fn text(content: &str) -> StreamEvent {
    StreamEvent::Text {
        content: content.into(),
    }
}

#[tokio::test]
async fn events_arrive_in_order_with_one_terminal() {
    let (sessions, _db, conversation_id) = setup(vec![
        Step::Emit(text("a")),
        Step::Emit(StreamEvent::ToolUse {
            name: "Bash".into(),
            input: serde_json::json!({"command": "ls"}),
        }),
        Step::Emit(StreamEvent::ToolResult { content: "ok".into() }),
        Step::Emit(StreamEvent::Done),
    ])
    .await;

    let dispatched = sessions.dispatch(conversation_id, "hello").await.unwrap();
    let events = timeout(TEST_TIMEOUT, collect(dispatched.events))
        .await
        .unwrap();

    assert_eq!(events.len(), 4);
    assert_eq!(events[0], text("a"));
    assert_eq!(events[3], StreamEvent::Done);
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);

    wait_until_idle(&sessions).await;
    assert!(sessions.lookup(conversation_id).await.is_none());
}

#[tokio::test]
async fn second_dispatch_while_running_is_rejected() {
    let gate = Arc::new(Notify::new());
    let (sessions, _db, conversation_id) = setup(vec![
        Step::Emit(text("started")),
        Step::Wait(Arc::clone(&gate)),
        Step::Emit(StreamEvent::Done),
    ])
    .await;

    let dispatched = sessions.dispatch(conversation_id, "first").await.unwrap();
    let mut events = dispatched.events;
    timeout(TEST_TIMEOUT, events.recv()).await.unwrap().unwrap();

    let second = sessions.dispatch(conversation_id, "second").await;
    assert!(matches!(
        second,
        Err(Error::Session(SessionError::AlreadyRunning(id))) if id == conversation_id
    ));

    // The first execution is still attachable.
    assert!(sessions.lookup(conversation_id).await.is_some());

    gate.notify_one();
    let rest = timeout(TEST_TIMEOUT, collect(events)).await.unwrap();
    assert_eq!(rest, vec![StreamEvent::Done]);
    wait_until_idle(&sessions).await;
}

#[tokio::test]
async fn concurrent_dispatches_let_exactly_one_win() {
    let gate = Arc::new(Notify::new());
    let (sessions, _db, conversation_id) = setup(vec![
        Step::Wait(Arc::clone(&gate)),
        Step::Emit(StreamEvent::Done),
    ])
    .await;

    let (first, second) = tokio::join!(
        sessions.dispatch(conversation_id, "racer one"),
        sessions.dispatch(conversation_id, "racer two"),
    );

    let results = [first, second];
    let winners = results.iter().filter(|r| r.is_ok()).count();
    let rejected = results
        .iter()
        .filter(|r| matches!(r, Err(Error::Session(SessionError::AlreadyRunning(_)))))
        .count();
    assert_eq!(winners, 1);
    assert_eq!(rejected, 1);

    gate.notify_one();
    wait_until_idle(&sessions).await;
}

#[tokio::test]
async fn unknown_conversation_is_rejected() {
    let (sessions, _db, _conversation_id) = setup(vec![]).await;
    let missing = Uuid::new_v4();

    let result = sessions.dispatch(missing, "hello").await;
    assert!(matches!(
        result,
        Err(Error::Session(SessionError::ConversationNotFound(id))) if id == missing
    ));
}

#[tokio::test]
async fn late_subscriber_sees_only_later_events() {
    let gate = Arc::new(Notify::new());
    let (sessions, _db, conversation_id) = setup(vec![
        Step::Emit(text("early")),
        Step::Wait(Arc::clone(&gate)),
        Step::Emit(text("late")),
        Step::Emit(StreamEvent::Done),
    ])
    .await;

    let dispatched = sessions.dispatch(conversation_id, "hello").await.unwrap();
    let mut events = dispatched.events;
    assert_eq!(
        timeout(TEST_TIMEOUT, events.recv()).await.unwrap().unwrap(),
        text("early")
    );

    // Join mid-stream via lookup, after "early" has already gone by.
    let stream = sessions.lookup(conversation_id).await.unwrap();
    let late_rx = stream.subscribe().await.unwrap();

    gate.notify_one();
    let late_events = timeout(TEST_TIMEOUT, collect(late_rx)).await.unwrap();
    assert_eq!(late_events, vec![text("late"), StreamEvent::Done]);

    let rest = timeout(TEST_TIMEOUT, collect(events)).await.unwrap();
    assert_eq!(rest, vec![text("late"), StreamEvent::Done]);
}

#[tokio::test]
async fn cancel_closes_stream_without_terminal_event() {
    let never = Arc::new(Notify::new());
    let (sessions, _db, conversation_id) = setup(vec![
        Step::Emit(text("working")),
        Step::Wait(Arc::clone(&never)),
        Step::Emit(StreamEvent::Done),
    ])
    .await;

    let dispatched = sessions.dispatch(conversation_id, "hello").await.unwrap();
    let mut events = dispatched.events;
    timeout(TEST_TIMEOUT, events.recv()).await.unwrap().unwrap();

    let stream = Arc::clone(&dispatched.stream);
    assert!(sessions.cancel(conversation_id).await);

    // No terminal event: the stream just ends.
    let rest = timeout(TEST_TIMEOUT, collect(events)).await.unwrap();
    assert!(rest.is_empty());

    // Second cancel reports no active execution.
    assert!(!sessions.cancel(conversation_id).await);
    assert!(sessions.lookup(conversation_id).await.is_none());

    // Reconnecting to the finished stream is "no active stream", not an error.
    assert!(matches!(
        stream.subscribe().await,
        Err(SessionError::StreamEnded)
    ));
}

#[tokio::test]
async fn engine_failure_is_streamed_as_error_event() {
    let (sessions, _db, conversation_id) = setup(vec![Step::Emit(StreamEvent::Error {
        message: "engine exploded".into(),
    })])
    .await;

    let dispatched = sessions.dispatch(conversation_id, "hello").await.unwrap();
    let events = timeout(TEST_TIMEOUT, collect(dispatched.events))
        .await
        .unwrap();

    assert_eq!(
        events,
        vec![StreamEvent::Error {
            message: "engine exploded".into()
        }]
    );
    wait_until_idle(&sessions).await;
}

#[tokio::test]
async fn start_failure_releases_the_slot() {
    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let conversation = db
        .create_conversation(Path::new("/tmp/project"), None)
        .await
        .unwrap();
    let sessions = ActiveSessions::new(Arc::new(BrokenEngine), Arc::clone(&db));

    for _ in 0..2 {
        // Both attempts fail with the engine error, never AlreadyRunning.
        let result = sessions.dispatch(conversation.id, "hello").await;
        assert!(matches!(result, Err(Error::Engine(_))));
    }
    assert_eq!(sessions.running_count().await, 0);
}

#[tokio::test]
async fn dispatch_records_engine_session_id() {
    let (sessions, db, conversation_id) =
        setup(vec![Step::Emit(StreamEvent::Done)]).await;

    let dispatched = sessions.dispatch(conversation_id, "hello").await.unwrap();
    timeout(TEST_TIMEOUT, collect(dispatched.events))
        .await
        .unwrap();

    let conversation = db.get_conversation(conversation_id).await.unwrap().unwrap();
    assert_eq!(conversation.current_session_id.as_deref(), Some("stub-session"));
    assert_eq!(conversation.session_ids, vec!["stub-session"]);
}
