use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::{
    domain::SessionId,
    envelope::ResponseEnvelope,
    error::ValidationError,
    validation::{timestamp_field, validate},
};

pub const SKELETON_RESPONSE: &str = "skeleton_response";
pub const COMPOSITION_RESPONSE: &str = "composition_response";
pub const UPDATE_RESPONSE: &str = "update_response";
pub const PROGRESS_RESPONSE: &str = "progress_response";
pub const ERROR_RESPONSE: &str = "error_response";

/// One inbound push message. `data` stays opaque; the accessors below pull
/// out the descriptors the pipeline cares about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default = "Utc::now", deserialize_with = "deserialize_timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
}

impl StreamEvent {
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            timestamp: Utc::now(),
            session_id: None,
        }
    }

    pub fn with_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    /// The envelope fragment carried by this event, if any: `data.envelope`,
    /// or `data` itself when it looks like an envelope.
    pub fn envelope_value(&self) -> Option<&Value> {
        if let Some(envelope) = self.data.get("envelope").filter(|v| v.is_object()) {
            return Some(envelope);
        }
        self.data
            .as_object()
            .filter(|object| object.contains_key("chunks"))
            .map(|_| &self.data)
    }

    pub fn envelope(&self) -> Option<Result<ResponseEnvelope, ValidationError>> {
        self.envelope_value().map(validate)
    }

    pub fn progress(&self) -> Option<ProgressProjection> {
        if let Some(progress) = self.data.get("progress").filter(|v| v.is_object()) {
            return ProgressProjection::from_value(progress);
        }
        if self.event_type == PROGRESS_RESPONSE {
            return ProgressProjection::from_value(&self.data);
        }
        None
    }

    pub fn error(&self) -> Option<ErrorDescriptor> {
        if let Some(error) = self.data.get("error").filter(|v| v.is_object()) {
            return ErrorDescriptor::from_value(error);
        }
        if self.event_type == ERROR_RESPONSE {
            return ErrorDescriptor::from_value(&self.data);
        }
        None
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressProjection {
    pub stage: String,
    pub percentage: f64,
    pub message: String,
}

impl ProgressProjection {
    pub fn new(stage: impl Into<String>, percentage: f64, message: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            percentage: clamp_percentage(percentage),
            message: message.into(),
        }
    }

    /// Reads `{stage, percentage, message}`. An object with none of the three
    /// keys is not a progress descriptor.
    pub fn from_value(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        if !["stage", "percentage", "message"]
            .iter()
            .any(|key| object.contains_key(*key))
        {
            return None;
        }
        let text = |key: &str| {
            object
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let percentage = object
            .get("percentage")
            .and_then(Value::as_f64)
            .unwrap_or_default();
        Some(Self::new(text("stage"), percentage, text("message")))
    }
}

fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Value::deserialize(deserializer)?;
    timestamp_field(&raw).map_err(serde::de::Error::custom)
}

fn clamp_percentage(percentage: f64) -> f64 {
    if percentage.is_nan() {
        0.0
    } else {
        percentage.clamp(0.0, 100.0)
    }
}

/// Error reported by the orchestrator inside a stream event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorDescriptor {
    fn from_value(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        let message = object.get("message").and_then(Value::as_str)?;
        Some(Self {
            code: object
                .get("code")
                .and_then(Value::as_str)
                .map(str::to_owned),
            message: message.to_string(),
            details: object.get("details").cloned(),
        })
    }
}
