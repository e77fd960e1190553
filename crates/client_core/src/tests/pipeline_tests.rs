use super::*;
use async_trait::async_trait;
use protocol::{
    error::ErrorCode,
    stream::{COMPOSITION_RESPONSE, PROGRESS_RESPONSE, UPDATE_RESPONSE},
};
use serde_json::json;
use tokio::{
    sync::mpsc,
    time::{timeout, Instant},
};

use crate::push::{PushItem, StreamSubscription};

struct Opened {
    request: StreamRequest,
    sender: mpsc::Sender<PushItem>,
    at: Instant,
}

/// Hands out in-memory subscriptions and keeps the sending half of each one
/// so tests can script what the pipeline receives.
#[derive(Clone, Default)]
struct ScriptedConnector {
    opened: Arc<Mutex<Vec<Opened>>>,
}

impl ScriptedConnector {
    async fn open_count(&self) -> usize {
        self.opened.lock().await.len()
    }

    async fn sender(&self, index: usize) -> mpsc::Sender<PushItem> {
        self.opened.lock().await[index].sender.clone()
    }

    async fn opened_at(&self, index: usize) -> Instant {
        self.opened.lock().await[index].at
    }

    async fn request(&self, index: usize) -> StreamRequest {
        self.opened.lock().await[index].request.clone()
    }

    /// Drops the retained sender so the subscription ends like a closed body.
    async fn hang_up(&self, index: usize) {
        let (closed, _) = mpsc::channel(1);
        self.opened.lock().await[index].sender = closed;
    }
}

#[async_trait]
impl PushConnector for ScriptedConnector {
    async fn open(&self, request: &StreamRequest) -> Result<StreamSubscription, ProtocolError> {
        let (sender, receiver) = mpsc::channel(16);
        self.opened.lock().await.push(Opened {
            request: request.clone(),
            sender,
            at: Instant::now(),
        });
        Ok(StreamSubscription::from_receiver(receiver))
    }
}

fn pipeline_with(connector: &ScriptedConnector, options: PipelineOptions) -> StreamPipeline {
    StreamPipeline::new(
        Arc::new(connector.clone()),
        StreamRequest::new("dashboard", json!({ "range": "7d" })),
        options,
    )
}

fn event(label: &str) -> StreamEvent {
    StreamEvent::new(UPDATE_RESPONSE, json!({ "label": label }))
}

fn label_of(event: &StreamEvent) -> &str {
    event.data["label"].as_str().unwrap_or_default()
}

async fn next_update(rx: &mut broadcast::Receiver<PipelineUpdate>) -> PipelineUpdate {
    timeout(Duration::from_secs(30), rx.recv())
        .await
        .expect("update before timeout")
        .expect("update channel open")
}

async fn wait_for_state(rx: &mut broadcast::Receiver<PipelineUpdate>, wanted: ConnectionState) {
    loop {
        if let PipelineUpdate::State(state) = next_update(rx).await {
            if state == wanted {
                return;
            }
        }
    }
}

async fn wait_for_events(rx: &mut broadcast::Receiver<PipelineUpdate>, count: usize) -> Vec<StreamEvent> {
    let mut seen = Vec::new();
    while seen.len() < count {
        if let PipelineUpdate::Event(event) = next_update(rx).await {
            seen.push(event);
        }
    }
    seen
}

#[test]
fn buffer_evicts_oldest_once_full() {
    let mut buffer = EventBuffer::new(2);
    assert!(buffer.push(event("E1")).is_none());
    assert!(buffer.push(event("E2")).is_none());
    let evicted = buffer.push(event("E3")).expect("evicted");

    assert_eq!(label_of(&evicted), "E1");
    let labels: Vec<_> = buffer.snapshot().iter().map(|e| label_of(e).to_string()).collect();
    assert_eq!(labels, vec!["E2", "E3"]);
    assert_eq!(buffer.len(), 2);
}

#[test]
fn zero_capacity_buffer_retains_nothing() {
    let mut buffer = EventBuffer::new(0);
    let returned = buffer.push(event("E1")).expect("handed back");
    assert_eq!(label_of(&returned), "E1");
    assert!(buffer.is_empty());
}

#[test]
fn options_follow_stream_config() {
    let options = PipelineOptions::from_config(&StreamConfig {
        max_events: 5,
        reconnect_delay_ms: 250,
        auto_reconnect: false,
    });
    assert_eq!(options.max_events, 5);
    assert_eq!(options.reconnect_delay, Duration::from_millis(250));
    assert!(!options.auto_reconnect);
    assert!(options.filter.is_none());

    let defaults = PipelineOptions::default();
    assert_eq!(defaults.max_events, 100);
    assert_eq!(defaults.reconnect_delay, Duration::from_millis(3000));
    assert!(defaults.auto_reconnect);
}

#[tokio::test]
async fn pipeline_keeps_last_max_events_in_order() {
    let connector = ScriptedConnector::default();
    let pipeline = pipeline_with(
        &connector,
        PipelineOptions {
            max_events: 2,
            ..PipelineOptions::default()
        },
    );
    let mut rx = pipeline.subscribe();
    assert_eq!(pipeline.state().await, ConnectionState::Idle);

    pipeline.connect().await;
    wait_for_state(&mut rx, ConnectionState::Connected).await;
    let sender = connector.sender(0).await;
    for label in ["E1", "E2", "E3"] {
        sender.send(Ok(event(label))).await.expect("send");
    }
    let delivered = wait_for_events(&mut rx, 3).await;

    let delivered: Vec<_> = delivered.iter().map(label_of).collect();
    assert_eq!(delivered, vec!["E1", "E2", "E3"]);
    let buffered: Vec<_> = pipeline
        .events()
        .await
        .iter()
        .map(|e| label_of(e).to_string())
        .collect();
    assert_eq!(buffered, vec!["E2", "E3"]);
    assert_eq!(connector.request(0).await.route, "dashboard");

    pipeline.disconnect().await;
}

#[tokio::test]
async fn filter_hides_events_from_buffer_and_observers() {
    let connector = ScriptedConnector::default();
    let pipeline = pipeline_with(
        &connector,
        PipelineOptions::default().with_filter(|event| label_of(event) != "noise"),
    );
    let mut rx = pipeline.subscribe();
    pipeline.connect().await;
    wait_for_state(&mut rx, ConnectionState::Connected).await;

    let sender = connector.sender(0).await;
    for label in ["keep-1", "noise", "keep-2"] {
        sender.send(Ok(event(label))).await.expect("send");
    }
    let delivered = wait_for_events(&mut rx, 2).await;

    let delivered: Vec<_> = delivered.iter().map(label_of).collect();
    assert_eq!(delivered, vec!["keep-1", "keep-2"]);
    assert_eq!(pipeline.events().await.len(), 2);

    pipeline.disconnect().await;
}

#[tokio::test]
async fn progress_is_last_write_wins() {
    let connector = ScriptedConnector::default();
    let pipeline = pipeline_with(&connector, PipelineOptions::default());
    let mut rx = pipeline.subscribe();
    pipeline.connect().await;
    wait_for_state(&mut rx, ConnectionState::Connected).await;
    assert!(pipeline.progress().await.is_none());

    let sender = connector.sender(0).await;
    sender
        .send(Ok(StreamEvent::new(
            PROGRESS_RESPONSE,
            json!({ "stage": "planning", "percentage": 10, "message": "planning" }),
        )))
        .await
        .expect("send");
    sender.send(Ok(event("no-progress"))).await.expect("send");
    sender
        .send(Ok(StreamEvent::new(
            UPDATE_RESPONSE,
            json!({ "progress": { "stage": "composing", "percentage": 140, "message": "almost" } }),
        )))
        .await
        .expect("send");
    wait_for_events(&mut rx, 3).await;

    let progress = pipeline.progress().await.expect("progress");
    assert_eq!(progress.stage, "composing");
    assert_eq!(progress.percentage, 100.0);
    assert_eq!(progress.message, "almost");

    pipeline.disconnect().await;
}

#[tokio::test]
async fn latest_envelope_tracks_envelope_events() {
    let connector = ScriptedConnector::default();
    let pipeline = pipeline_with(&connector, PipelineOptions::default());
    let mut rx = pipeline.subscribe();
    pipeline.connect().await;
    wait_for_state(&mut rx, ConnectionState::Connected).await;

    let envelope = json!({
        "request_id": "r9",
        "tenant_id": "t1",
        "user_id": "u1",
        "state": "STREAMING",
        "chunks": [{ "type": "TextBlock", "content": "partial" }],
        "timestamp": "2024-01-07T10:30:00Z"
    });
    let sender = connector.sender(0).await;
    sender
        .send(Ok(StreamEvent::new(COMPOSITION_RESPONSE, envelope)))
        .await
        .expect("send");
    sender.send(Ok(event("plain"))).await.expect("send");
    wait_for_events(&mut rx, 2).await;

    let latest = pipeline.latest_envelope().await.expect("envelope");
    assert_eq!(latest.request_id.as_str(), "r9");
    assert_eq!(latest.chunks.len(), 1);

    pipeline.disconnect().await;
}

#[tokio::test]
async fn parse_errors_are_reported_without_closing() {
    let connector = ScriptedConnector::default();
    let pipeline = pipeline_with(&connector, PipelineOptions::default());
    let mut rx = pipeline.subscribe();
    pipeline.connect().await;
    wait_for_state(&mut rx, ConnectionState::Connected).await;

    let sender = connector.sender(0).await;
    sender
        .send(Err(ProtocolError::new(ErrorCode::StreamParseError, "bad frame")))
        .await
        .expect("send");
    sender.send(Ok(event("after"))).await.expect("send");

    let mut saw_error = false;
    loop {
        match next_update(&mut rx).await {
            PipelineUpdate::Error(err) => {
                assert_eq!(err.code, ErrorCode::StreamParseError);
                saw_error = true;
            }
            PipelineUpdate::Event(event) => {
                assert_eq!(label_of(&event), "after");
                break;
            }
            PipelineUpdate::State(state) => panic!("unexpected state change to {state:?}"),
            PipelineUpdate::Progress(_) => {}
        }
    }
    assert!(saw_error);
    assert_eq!(pipeline.state().await, ConnectionState::Connected);

    pipeline.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn stream_error_closes_and_reconnects_after_delay() {
    let connector = ScriptedConnector::default();
    let pipeline = pipeline_with(&connector, PipelineOptions::default());
    let mut rx = pipeline.subscribe();
    pipeline.connect().await;
    wait_for_state(&mut rx, ConnectionState::Connected).await;

    connector
        .sender(0)
        .await
        .send(Err(ProtocolError::new(ErrorCode::StreamError, "reset by peer")))
        .await
        .expect("send");
    wait_for_state(&mut rx, ConnectionState::Disconnected).await;
    let lost_at = Instant::now();

    wait_for_state(&mut rx, ConnectionState::Connected).await;

    assert_eq!(connector.open_count().await, 2);
    let waited = connector.opened_at(1).await - lost_at;
    assert!(waited >= Duration::from_millis(3000), "reconnected after {waited:?}");
    assert!(waited < Duration::from_millis(3100), "reconnected after {waited:?}");

    pipeline.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn closed_body_reconnects_exactly_once_per_loss() {
    let connector = ScriptedConnector::default();
    let pipeline = pipeline_with(&connector, PipelineOptions::default());
    let mut rx = pipeline.subscribe();
    pipeline.connect().await;
    wait_for_state(&mut rx, ConnectionState::Connected).await;

    connector.hang_up(0).await;
    wait_for_state(&mut rx, ConnectionState::Disconnected).await;
    wait_for_state(&mut rx, ConnectionState::Connected).await;

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(connector.open_count().await, 2);
    assert_eq!(pipeline.state().await, ConnectionState::Connected);

    pipeline.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn disconnect_during_delay_suppresses_reconnect() {
    let connector = ScriptedConnector::default();
    let pipeline = pipeline_with(&connector, PipelineOptions::default());
    let mut rx = pipeline.subscribe();
    pipeline.connect().await;
    wait_for_state(&mut rx, ConnectionState::Connected).await;

    connector.hang_up(0).await;
    wait_for_state(&mut rx, ConnectionState::Disconnected).await;
    pipeline.disconnect().await;

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(connector.open_count().await, 1);
    assert_eq!(pipeline.state().await, ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn disconnect_while_connected_closes_subscription() {
    let connector = ScriptedConnector::default();
    let pipeline = pipeline_with(&connector, PipelineOptions::default());
    let mut rx = pipeline.subscribe();
    pipeline.connect().await;
    wait_for_state(&mut rx, ConnectionState::Connected).await;
    let sender = connector.sender(0).await;

    pipeline.disconnect().await;

    assert!(sender.is_closed());
    assert_eq!(pipeline.state().await, ConnectionState::Disconnected);
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(connector.open_count().await, 1);
}

#[tokio::test(start_paused = true)]
async fn auto_reconnect_can_be_turned_off() {
    let connector = ScriptedConnector::default();
    let pipeline = pipeline_with(
        &connector,
        PipelineOptions {
            auto_reconnect: false,
            ..PipelineOptions::default()
        },
    );
    let mut rx = pipeline.subscribe();
    pipeline.connect().await;
    wait_for_state(&mut rx, ConnectionState::Connected).await;

    connector.hang_up(0).await;
    wait_for_state(&mut rx, ConnectionState::Disconnected).await;
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(connector.open_count().await, 1);
}

#[tokio::test]
async fn second_connect_replaces_live_subscription() {
    let connector = ScriptedConnector::default();
    let pipeline = pipeline_with(&connector, PipelineOptions::default());
    let mut rx = pipeline.subscribe();
    pipeline.connect().await;
    wait_for_state(&mut rx, ConnectionState::Connected).await;
    let first = connector.sender(0).await;

    pipeline.connect().await;
    wait_for_state(&mut rx, ConnectionState::Connected).await;

    assert!(first.is_closed());
    assert_eq!(connector.open_count().await, 2);
    assert!(!connector.sender(1).await.is_closed());

    pipeline.disconnect().await;
}

#[tokio::test]
async fn disconnect_is_idempotent_from_idle() {
    let connector = ScriptedConnector::default();
    let pipeline = pipeline_with(&connector, PipelineOptions::default());
    let mut rx = pipeline.subscribe();

    pipeline.disconnect().await;
    pipeline.disconnect().await;

    assert_eq!(pipeline.state().await, ConnectionState::Disconnected);
    assert_eq!(
        rx.try_recv().expect("one state change"),
        PipelineUpdate::State(ConnectionState::Disconnected)
    );
    assert!(rx.try_recv().is_err());
    assert_eq!(connector.open_count().await, 0);
}

#[tokio::test]
async fn updates_stream_yields_broadcasts() {
    let connector = ScriptedConnector::default();
    let pipeline = pipeline_with(&connector, PipelineOptions::default());
    let mut updates = Box::pin(pipeline.updates());

    pipeline.connect().await;

    let first = timeout(Duration::from_secs(5), updates.next())
        .await
        .expect("update before timeout");
    assert_eq!(first, Some(PipelineUpdate::State(ConnectionState::Connecting)));

    pipeline.disconnect().await;
}

#[tokio::test]
async fn sessions_keep_one_pipeline_per_id() {
    let connector = ScriptedConnector::default();
    let sessions = StreamSessions::new(Arc::new(connector.clone()));
    let session = SessionId::new("s1");

    let first = sessions
        .open(session.clone(), "dashboard", json!({}), PipelineOptions::default())
        .await;
    let mut first_rx = first.subscribe();
    if first.state().await != ConnectionState::Connected {
        wait_for_state(&mut first_rx, ConnectionState::Connected).await;
    }
    let first_sender = connector.sender(0).await;

    let second = sessions
        .open(session.clone(), "dashboard", json!({}), PipelineOptions::default())
        .await;

    assert!(first_sender.is_closed());
    assert_eq!(first.state().await, ConnectionState::Disconnected);
    assert_eq!(sessions.len().await, 1);
    let live = sessions.get(&session).await.expect("live session");
    assert!(Arc::ptr_eq(&live, &second));
    assert_eq!(connector.request(0).await.session_id, Some(session.clone()));

    assert!(sessions.close(&session).await);
    assert!(!sessions.close(&session).await);
    assert!(sessions.is_empty().await);
    assert_eq!(second.state().await, ConnectionState::Disconnected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_opens_leave_one_live_pipeline() {
    let connector = ScriptedConnector::default();
    let sessions = Arc::new(StreamSessions::new(Arc::new(connector.clone())));
    let session = SessionId::new("s1");

    let opens: Vec<_> = (0..8)
        .map(|_| {
            let sessions = Arc::clone(&sessions);
            let session = session.clone();
            tokio::spawn(async move {
                sessions
                    .open(session, "dashboard", json!({}), PipelineOptions::default())
                    .await
            })
        })
        .collect();
    let mut pipelines = Vec::new();
    for open in opens {
        pipelines.push(open.await.expect("open task"));
    }

    let live = sessions.get(&session).await.expect("live session");
    assert_eq!(sessions.len().await, 1);
    for pipeline in &pipelines {
        if !Arc::ptr_eq(pipeline, &live) {
            assert_eq!(pipeline.state().await, ConnectionState::Disconnected);
        }
    }
    assert_eq!(pipelines.iter().filter(|p| Arc::ptr_eq(*p, &live)).count(), 1);

    let mut live_rx = live.subscribe();
    if live.state().await != ConnectionState::Connected {
        wait_for_state(&mut live_rx, ConnectionState::Connected).await;
    }
    let mut open_senders = 0;
    for index in 0..connector.open_count().await {
        if !connector.sender(index).await.is_closed() {
            open_senders += 1;
        }
    }
    assert_eq!(open_senders, 1);

    sessions.close_all().await;
    assert!(sessions.is_empty().await);
    assert_eq!(live.state().await, ConnectionState::Disconnected);
}
