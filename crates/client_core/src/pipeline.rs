use std::{
    collections::{HashMap, VecDeque},
    fmt,
    sync::Arc,
    time::Duration,
};

use futures::{Stream, StreamExt};
use protocol::{
    domain::SessionId,
    envelope::ResponseEnvelope,
    error::ProtocolError,
    stream::{ProgressProjection, StreamEvent},
};
use serde_json::Value;
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
    time::sleep,
};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, warn};

use crate::{
    config::StreamConfig,
    push::{PushConnector, StreamRequest},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineUpdate {
    State(ConnectionState),
    Event(StreamEvent),
    Progress(ProgressProjection),
    Error(ProtocolError),
}

pub type EventFilter = Arc<dyn Fn(&StreamEvent) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct PipelineOptions {
    pub max_events: usize,
    pub reconnect_delay: Duration,
    pub auto_reconnect: bool,
    pub filter: Option<EventFilter>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self::from_config(&StreamConfig::default())
    }
}

impl PipelineOptions {
    pub fn from_config(config: &StreamConfig) -> Self {
        Self {
            max_events: config.max_events,
            reconnect_delay: config.reconnect_delay(),
            auto_reconnect: config.auto_reconnect,
            filter: None,
        }
    }

    pub fn with_filter(mut self, filter: impl Fn(&StreamEvent) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }

    fn accepts(&self, event: &StreamEvent) -> bool {
        self.filter.as_ref().map_or(true, |filter| filter(event))
    }
}

impl fmt::Debug for PipelineOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineOptions")
            .field("max_events", &self.max_events)
            .field("reconnect_delay", &self.reconnect_delay)
            .field("auto_reconnect", &self.auto_reconnect)
            .field("filter", &self.filter.is_some())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct EventBuffer {
    capacity: usize,
    events: VecDeque<StreamEvent>,
}

impl EventBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            events: VecDeque::with_capacity(capacity.min(1024)),
        }
    }

    // Returns the evicted event. A zero-capacity buffer hands `event` back.
    pub fn push(&mut self, event: StreamEvent) -> Option<StreamEvent> {
        if self.capacity == 0 {
            return Some(event);
        }
        let evicted = if self.events.len() >= self.capacity {
            self.events.pop_front()
        } else {
            None
        };
        self.events.push_back(event);
        evicted
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn snapshot(&self) -> Vec<StreamEvent> {
        self.events.iter().cloned().collect()
    }
}

struct PipelineShared {
    state: ConnectionState,
    buffer: EventBuffer,
    progress: Option<ProgressProjection>,
    latest_envelope: Option<ResponseEnvelope>,
    explicitly_disconnected: bool,
}

struct PipelineCore {
    connector: Arc<dyn PushConnector>,
    request: StreamRequest,
    options: PipelineOptions,
    shared: Mutex<PipelineShared>,
    updates: broadcast::Sender<PipelineUpdate>,
}

pub struct StreamPipeline {
    core: Arc<PipelineCore>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl StreamPipeline {
    pub fn new(
        connector: Arc<dyn PushConnector>,
        request: StreamRequest,
        options: PipelineOptions,
    ) -> Self {
        let (updates, _) = broadcast::channel(1024);
        let shared = PipelineShared {
            state: ConnectionState::Idle,
            buffer: EventBuffer::new(options.max_events),
            progress: None,
            latest_envelope: None,
            explicitly_disconnected: false,
        };
        Self {
            core: Arc::new(PipelineCore {
                connector,
                request,
                options,
                shared: Mutex::new(shared),
                updates,
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn request(&self) -> &StreamRequest {
        &self.core.request
    }

    pub async fn connect(&self) {
        let mut worker = self.worker.lock().await;
        if let Some(previous) = worker.take() {
            previous.abort();
            let _ = previous.await;
        }

        self.core.shared.lock().await.explicitly_disconnected = false;
        self.core.set_state(ConnectionState::Connecting).await;

        let core = Arc::clone(&self.core);
        *worker = Some(tokio::spawn(core.run()));
    }

    /// Suppresses auto-reconnect until the next `connect()`. Idempotent.
    pub async fn disconnect(&self) {
        self.core.shared.lock().await.explicitly_disconnected = true;

        let mut worker = self.worker.lock().await;
        if let Some(current) = worker.take() {
            current.abort();
            let _ = current.await;
        }
        drop(worker);

        let route = &self.core.request.route;
        let previous = self.core.set_state(ConnectionState::Disconnected).await;
        if previous != ConnectionState::Disconnected {
            info!(route = %route, "pipeline: disconnected by caller");
        }
    }

    pub async fn state(&self) -> ConnectionState {
        self.core.shared.lock().await.state
    }

    pub async fn events(&self) -> Vec<StreamEvent> {
        self.core.shared.lock().await.buffer.snapshot()
    }

    pub async fn progress(&self) -> Option<ProgressProjection> {
        self.core.shared.lock().await.progress.clone()
    }

    pub async fn latest_envelope(&self) -> Option<ResponseEnvelope> {
        self.core.shared.lock().await.latest_envelope.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineUpdate> {
        self.core.updates.subscribe()
    }

    pub fn updates(&self) -> impl Stream<Item = PipelineUpdate> + Send + 'static {
        BroadcastStream::new(self.subscribe()).filter_map(|update| async move {
            match update {
                Ok(update) => Some(update),
                Err(err) => {
                    warn!("pipeline: observer lagged: {err}");
                    None
                }
            }
        })
    }
}

impl Drop for StreamPipeline {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.get_mut().take() {
            worker.abort();
        }
    }
}

impl PipelineCore {
    async fn run(self: Arc<Self>) {
        let route = self.request.route.clone();
        loop {
            match self.connector.open(&self.request).await {
                Ok(mut subscription) => {
                    self.set_state(ConnectionState::Connected).await;
                    info!(route = %route, "pipeline: connected");
                    while let Some(item) = subscription.next().await {
                        match item {
                            Ok(event) => self.ingest(event).await,
                            Err(err) if err.closes_stream() => {
                                self.report(err);
                                break;
                            }
                            Err(err) => self.report(err),
                        }
                    }
                }
                Err(err) => self.report(err),
            }

            self.set_state(ConnectionState::Disconnected).await;
            if !self.options.auto_reconnect || self.explicitly_disconnected().await {
                break;
            }

            info!(
                route = %route,
                delay_ms = self.options.reconnect_delay.as_millis() as u64,
                "pipeline: connection lost, scheduling reconnect"
            );
            sleep(self.options.reconnect_delay).await;
            if self.explicitly_disconnected().await {
                break;
            }
            self.set_state(ConnectionState::Connecting).await;
        }
    }

    async fn ingest(&self, event: StreamEvent) {
        if !self.options.accepts(&event) {
            debug!(event_type = %event.event_type, "pipeline: event filtered out");
            return;
        }

        let progress = event.progress();
        let envelope = match event.envelope() {
            Some(Ok(envelope)) => Some(envelope),
            _ => None,
        };

        {
            let mut shared = self.shared.lock().await;
            if let Some(evicted) = shared.buffer.push(event.clone()) {
                debug!(event_type = %evicted.event_type, "pipeline: buffer full, evicted oldest event");
            }
            if let Some(progress) = &progress {
                shared.progress = Some(progress.clone());
            }
            if let Some(envelope) = envelope {
                shared.latest_envelope = Some(envelope);
            }
        }

        let _ = self.updates.send(PipelineUpdate::Event(event));
        if let Some(progress) = progress {
            let _ = self.updates.send(PipelineUpdate::Progress(progress));
        }
    }

    fn report(&self, err: ProtocolError) {
        warn!(route = %self.request.route, code = %err.code, "pipeline: {}", err.message);
        let _ = self.updates.send(PipelineUpdate::Error(err));
    }

    async fn explicitly_disconnected(&self) -> bool {
        self.shared.lock().await.explicitly_disconnected
    }

    async fn set_state(&self, state: ConnectionState) -> ConnectionState {
        let previous = {
            let mut shared = self.shared.lock().await;
            std::mem::replace(&mut shared.state, state)
        };
        if previous != state {
            let _ = self.updates.send(PipelineUpdate::State(state));
        }
        previous
    }
}

pub struct StreamSessions {
    connector: Arc<dyn PushConnector>,
    sessions: Mutex<HashMap<SessionId, Arc<StreamPipeline>>>,
}

impl StreamSessions {
    pub fn new(connector: Arc<dyn PushConnector>) -> Self {
        Self {
            connector,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub async fn open(
        &self,
        session_id: SessionId,
        route: impl Into<String>,
        params: Value,
        options: PipelineOptions,
    ) -> Arc<StreamPipeline> {
        let request = StreamRequest::new(route, params).with_session(session_id.clone());
        let pipeline = Arc::new(StreamPipeline::new(
            Arc::clone(&self.connector),
            request,
            options,
        ));

        // Held until the new pipeline is connected so concurrent opens for one
        // session serialize and only the registered pipeline stays live.
        let mut sessions = self.sessions.lock().await;
        if let Some(previous) = sessions.remove(&session_id) {
            info!(session_id = %session_id, "pipeline: replacing live session");
            previous.disconnect().await;
        }
        pipeline.connect().await;
        sessions.insert(session_id, Arc::clone(&pipeline));
        pipeline
    }

    pub async fn get(&self, session_id: &SessionId) -> Option<Arc<StreamPipeline>> {
        self.sessions.lock().await.get(session_id).cloned()
    }

    pub async fn close(&self, session_id: &SessionId) -> bool {
        let mut sessions = self.sessions.lock().await;
        match sessions.remove(session_id) {
            Some(pipeline) => {
                pipeline.disconnect().await;
                true
            }
            None => false,
        }
    }

    pub async fn close_all(&self) {
        let mut sessions = self.sessions.lock().await;
        for (_, pipeline) in sessions.drain() {
            pipeline.disconnect().await;
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }
}

#[cfg(test)]
#[path = "tests/pipeline_tests.rs"]
mod tests;
