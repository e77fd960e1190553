use async_trait::async_trait;
use protocol::{
    domain::{RequestId, SessionId},
    error::{ErrorCode, ProtocolError},
    stream::{StreamEvent, COMPOSITION_RESPONSE},
};
use serde_json::Value;
use tokio::{sync::mpsc, task::JoinHandle};

/// One item read off a push channel. `STREAM_PARSE_ERROR` items leave the
/// channel open; a `STREAM_ERROR` item is always the last one.
pub type PushItem = Result<StreamEvent, ProtocolError>;

#[derive(Debug, Clone, PartialEq)]
pub struct StreamRequest {
    pub route: String,
    pub params: Value,
    pub session_id: Option<SessionId>,
}

impl StreamRequest {
    pub fn new(route: impl Into<String>, params: Value) -> Self {
        Self {
            route: route.into(),
            params,
            session_id: None,
        }
    }

    pub fn with_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }
}

pub struct StreamSubscription {
    receiver: mpsc::Receiver<PushItem>,
    reader: Option<JoinHandle<()>>,
    request_id: Option<RequestId>,
}

impl StreamSubscription {
    pub fn from_receiver(receiver: mpsc::Receiver<PushItem>) -> Self {
        Self {
            receiver,
            reader: None,
            request_id: None,
        }
    }

    pub(crate) fn with_reader(
        receiver: mpsc::Receiver<PushItem>,
        reader: JoinHandle<()>,
        request_id: RequestId,
    ) -> Self {
        Self {
            receiver,
            reader: Some(reader),
            request_id: Some(request_id),
        }
    }

    pub fn request_id(&self) -> Option<&RequestId> {
        self.request_id.as_ref()
    }

    pub async fn next(&mut self) -> Option<PushItem> {
        self.receiver.recv().await
    }

    pub fn close(&mut self) {
        self.receiver.close();
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

impl Drop for StreamSubscription {
    fn drop(&mut self) {
        self.close();
    }
}

#[async_trait]
pub trait PushConnector: Send + Sync {
    async fn open(&self, request: &StreamRequest) -> Result<StreamSubscription, ProtocolError>;
}

// A body that is already a framed event (`{"type": ..., "data": ...}`) is
// taken as is; anything else is wrapped using the SSE event name as its type.
pub fn decode_push_message(
    event_name: Option<&str>,
    data: &str,
    session_id: Option<&SessionId>,
) -> Result<StreamEvent, ProtocolError> {
    let value: Value = serde_json::from_str(data).map_err(|err| {
        ProtocolError::new(
            ErrorCode::StreamParseError,
            format!("invalid stream message: {err}"),
        )
    })?;

    let framed = value.get("type").is_some_and(Value::is_string) && value.get("chunks").is_none();
    let mut event = if framed {
        serde_json::from_value::<StreamEvent>(value).map_err(|err| {
            ProtocolError::new(
                ErrorCode::StreamParseError,
                format!("invalid stream event: {err}"),
            )
        })?
    } else {
        StreamEvent::new(event_name.unwrap_or(COMPOSITION_RESPONSE), value)
    };

    if event.session_id.is_none() {
        event.session_id = session_id.cloned();
    }

    if let Some(Err(err)) = event.envelope() {
        return Err(err.into_protocol_error(ErrorCode::StreamParseError));
    }

    Ok(event)
}
