use std::time::Duration;

use async_trait::async_trait;
use protocol::{
    adjacency::AdjacencyList,
    domain::{Identity, RequestId, SessionId},
    envelope::ResponseEnvelope,
    error::{ErrorCode, ProtocolError},
    request::{form_submission, OrchestratorRequest, FORM_SUBMIT},
    validate,
};
use reqwest::{header, Client, RequestBuilder, Response};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    config::ClientConfig,
    dispatch::Interaction,
    push::{decode_push_message, PushConnector, PushItem, StreamRequest, StreamSubscription},
    sse::{SseDecoder, SseFrame},
};

const TENANT_HEADER: &str = "X-Tenant-ID";
const USER_HEADER: &str = "X-User-ID";
const REQUEST_HEADER: &str = "X-Request-ID";
const STREAM_CHANNEL_CAPACITY: usize = 256;
const ERROR_CHANNEL_CAPACITY: usize = 64;
const ERROR_BODY_PREVIEW: usize = 512;

#[derive(Debug, Error)]
pub enum ClientBuildError {
    #[error("invalid orchestrator url `{url}`: {source}")]
    InvalidUrl {
        url: String,
        source: url::ParseError,
    },
    #[error("failed to build http client: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Clone)]
struct Endpoints {
    orchestrator: Url,
    adjacency: Url,
    stream: Url,
}

impl Endpoints {
    fn from_config(config: &ClientConfig) -> Result<Self, ClientBuildError> {
        let join = |path: &str| {
            let raw = format!("{}{}", config.base_url.trim_end_matches('/'), path);
            Url::parse(&raw).map_err(|source| ClientBuildError::InvalidUrl { url: raw, source })
        };
        Ok(Self {
            orchestrator: join(&config.orchestrator_path)?,
            adjacency: join(&config.adjacency_path)?,
            stream: join(&config.stream_path)?,
        })
    }
}

/// Protocol client for one tenant/user pair. Every failure is returned as a
/// [`ProtocolError`] and also published to [`Self::subscribe_errors`].
pub struct OrchestratorClient {
    http: Client,
    endpoints: Endpoints,
    identity: Identity,
    request_timeout: Duration,
    errors: broadcast::Sender<ProtocolError>,
}

impl OrchestratorClient {
    pub fn new(config: &ClientConfig) -> Result<Self, ClientBuildError> {
        let http = Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()?;
        let (errors, _) = broadcast::channel(ERROR_CHANNEL_CAPACITY);
        Ok(Self {
            http,
            endpoints: Endpoints::from_config(config)?,
            identity: config.identity(),
            request_timeout: config.request_timeout(),
            errors,
        })
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn subscribe_errors(&self) -> broadcast::Receiver<ProtocolError> {
        self.errors.subscribe()
    }

    pub async fn fetch_orchestrator_output(
        &self,
        route: &str,
        params: Value,
    ) -> Result<ResponseEnvelope, ProtocolError> {
        let request = OrchestratorRequest::new(route, params, &self.identity, RequestId::generate());
        self.post_envelope(&self.endpoints.orchestrator, &request, ErrorCode::FetchFailed)
            .await
    }

    pub async fn send_action(
        &self,
        action_id: &str,
        payload: Value,
    ) -> Result<ResponseEnvelope, ProtocolError> {
        let request =
            OrchestratorRequest::user_action(action_id, payload, &self.identity, RequestId::generate());
        self.post_envelope(&self.endpoints.orchestrator, &request, ErrorCode::ActionFailed)
            .await
    }

    pub async fn submit_form(
        &self,
        form_id: &str,
        data: Map<String, Value>,
    ) -> Result<ResponseEnvelope, ProtocolError> {
        self.send_action(FORM_SUBMIT, form_submission(form_id, data))
            .await
    }

    pub async fn dispatch_interaction(
        &self,
        interaction: Interaction,
    ) -> Result<ResponseEnvelope, ProtocolError> {
        match interaction {
            Interaction::Action { action_id, payload } => self.send_action(&action_id, payload).await,
            Interaction::FormSubmit { form_id, data } => self.submit_form(&form_id, data).await,
        }
    }

    pub async fn fetch_adjacency_list(
        &self,
        route: &str,
        params: Value,
    ) -> Result<AdjacencyList, ProtocolError> {
        let request = OrchestratorRequest::new(route, params, &self.identity, RequestId::generate());
        let code = ErrorCode::AdjacencyFailed;
        let body = self.post_json(&self.endpoints.adjacency, &request, code).await?;
        serde_json::from_value(body).map_err(|err| {
            self.fail(
                ProtocolError::new(code, format!("invalid adjacency list: {err}"))
                    .with_request_id(request.request_id.clone()),
            )
        })
    }

    pub async fn stream_orchestrator_output(
        &self,
        route: &str,
        params: Value,
    ) -> Result<StreamSubscription, ProtocolError> {
        self.open_stream(&StreamRequest::new(route, params)).await
    }

    pub async fn open_stream(
        &self,
        request: &StreamRequest,
    ) -> Result<StreamSubscription, ProtocolError> {
        let request_id = RequestId::generate();
        let url = self.stream_url(request, &request_id);
        info!(request_id = %request_id, route = %request.route, "stream: opening push channel");

        let stream_error = |message: String| {
            ProtocolError::new(ErrorCode::StreamError, message).with_request_id(request_id.clone())
        };

        let response = self
            .correlate(self.http.get(url), &request_id)
            .header(header::ACCEPT, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache")
            .send()
            .await
            .map_err(|err| self.fail(stream_error(format!("failed to open stream: {err}"))))?;

        let status = response.status();
        if !status.is_success() {
            return Err(self.fail(
                stream_error(format!("stream endpoint returned HTTP {status}"))
                    .with_details(json!({ "status": status.as_u16() })),
            ));
        }

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let reader = tokio::spawn(read_event_stream(
            response,
            tx,
            self.errors.clone(),
            request.session_id.clone(),
            request_id.clone(),
        ));
        Ok(StreamSubscription::with_reader(rx, reader, request_id))
    }

    fn stream_url(&self, request: &StreamRequest, request_id: &RequestId) -> Url {
        let mut url = self.endpoints.stream.clone();
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("action", &request.route)
                .append_pair("tenant_id", self.identity.tenant_id.as_str())
                .append_pair("user_id", self.identity.user_id.as_str())
                .append_pair("request_id", request_id.as_str());
            if let Some(session_id) = &request.session_id {
                query.append_pair("session_id", session_id.as_str());
            }
            if let Some(params) = request.params.as_object() {
                for (key, value) in params {
                    query.append_pair(key, &query_value(value));
                }
            }
        }
        url
    }

    fn correlate(&self, builder: RequestBuilder, request_id: &RequestId) -> RequestBuilder {
        builder
            .header(TENANT_HEADER, self.identity.tenant_id.as_str())
            .header(USER_HEADER, self.identity.user_id.as_str())
            .header(REQUEST_HEADER, request_id.as_str())
    }

    async fn post_envelope(
        &self,
        url: &Url,
        request: &OrchestratorRequest,
        code: ErrorCode,
    ) -> Result<ResponseEnvelope, ProtocolError> {
        let body = self.post_json(url, request, code).await?;
        let envelope = validate(&body).map_err(|err| {
            self.fail(
                err.into_protocol_error(code)
                    .with_request_id(request.request_id.clone()),
            )
        })?;
        debug!(
            request_id = %request.request_id,
            state = %envelope.state,
            chunks = envelope.chunks.len(),
            "orchestrator: envelope received"
        );
        Ok(envelope)
    }

    async fn post_json(
        &self,
        url: &Url,
        request: &OrchestratorRequest,
        code: ErrorCode,
    ) -> Result<Value, ProtocolError> {
        let request_id = &request.request_id;
        debug!(request_id = %request_id, action = %request.action, "orchestrator: sending request");
        let failure = |message: String| {
            ProtocolError::new(code, message).with_request_id(request_id.clone())
        };

        let response = self
            .correlate(self.http.post(url.clone()), request_id)
            .timeout(self.request_timeout)
            .json(request)
            .send()
            .await
            .map_err(|err| self.fail(failure(describe_send_error(&err, self.request_timeout))))?;

        let response = self.check_status(response, failure).await?;
        response
            .json::<Value>()
            .await
            .map_err(|err| self.fail(failure(format!("failed to decode response body: {err}"))))
    }

    async fn check_status(
        &self,
        response: Response,
        failure: impl Fn(String) -> ProtocolError,
    ) -> Result<Response, ProtocolError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let mut body = response.text().await.unwrap_or_default();
        if body.len() > ERROR_BODY_PREVIEW {
            let mut cut = ERROR_BODY_PREVIEW;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
        }
        Err(self.fail(
            failure(format!("orchestrator returned HTTP {status}"))
                .with_details(json!({ "status": status.as_u16(), "body": body })),
        ))
    }

    fn fail(&self, err: ProtocolError) -> ProtocolError {
        warn!(
            code = %err.code,
            request_id = err.request_id.as_ref().map(|id| id.as_str()).unwrap_or_default(),
            "orchestrator: {}",
            err.message
        );
        let _ = self.errors.send(err.clone());
        err
    }
}

#[async_trait]
impl PushConnector for OrchestratorClient {
    async fn open(&self, request: &StreamRequest) -> Result<StreamSubscription, ProtocolError> {
        self.open_stream(request).await
    }
}

fn describe_send_error(err: &reqwest::Error, timeout: Duration) -> String {
    if err.is_timeout() {
        format!("request timed out after {}ms", timeout.as_millis())
    } else if err.is_connect() {
        format!("failed to connect to orchestrator: {err}")
    } else {
        format!("request failed: {err}")
    }
}

fn query_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

async fn read_event_stream(
    mut response: Response,
    tx: mpsc::Sender<PushItem>,
    errors: broadcast::Sender<ProtocolError>,
    session_id: Option<SessionId>,
    request_id: RequestId,
) {
    let mut decoder = SseDecoder::new();
    loop {
        match response.chunk().await {
            Ok(Some(bytes)) => {
                for decoded in decoder.push(&bytes) {
                    let item = match decoded {
                        Ok(frame) => decode_frame(frame, session_id.as_ref(), &request_id),
                        Err(err) => Err(ProtocolError::new(
                            ErrorCode::StreamParseError,
                            format!("invalid stream message: {err}"),
                        )
                        .with_request_id(request_id.clone())),
                    };
                    if !forward_item(&tx, &errors, item, &request_id).await {
                        return;
                    }
                }
            }
            Ok(None) => {
                if let Some(frame) = decoder.finish() {
                    let item = decode_frame(frame, session_id.as_ref(), &request_id);
                    forward_item(&tx, &errors, item, &request_id).await;
                }
                info!(request_id = %request_id, "stream: closed by server");
                return;
            }
            Err(err) => {
                let error = ProtocolError::new(
                    ErrorCode::StreamError,
                    format!("stream read failed: {err}"),
                )
                .with_request_id(request_id.clone());
                warn!(request_id = %request_id, "stream: {}", error.message);
                let _ = errors.send(error.clone());
                let _ = tx.send(Err(error)).await;
                return;
            }
        }
    }
}

fn decode_frame(
    frame: SseFrame,
    session_id: Option<&SessionId>,
    request_id: &RequestId,
) -> PushItem {
    decode_push_message(frame.event.as_deref(), &frame.data, session_id)
        .map_err(|err| err.with_request_id(request_id.clone()))
}

/// Returns `false` once the subscriber is gone.
async fn forward_item(
    tx: &mpsc::Sender<PushItem>,
    errors: &broadcast::Sender<ProtocolError>,
    item: PushItem,
    request_id: &RequestId,
) -> bool {
    if let Err(err) = &item {
        warn!(request_id = %request_id, "stream: dropping message: {}", err.message);
        let _ = errors.send(err.clone());
    }
    tx.send(item).await.is_ok()
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
