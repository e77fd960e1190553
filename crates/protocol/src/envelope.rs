use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::{
    chunk::UiChunk,
    domain::{RequestId, TenantId, UserId},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnvelopeState {
    Streaming,
    WaitingForConfirmation,
    Completed,
    Error,
}

impl EnvelopeState {
    pub const ALL: [EnvelopeState; 4] = [
        Self::Streaming,
        Self::WaitingForConfirmation,
        Self::Completed,
        Self::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Streaming => "STREAMING",
            Self::WaitingForConfirmation => "WAITING_FOR_CONFIRMATION",
            Self::Completed => "COMPLETED",
            Self::Error => "ERROR",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|state| state.as_str() == raw)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

impl fmt::Display for EnvelopeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One orchestrator reply. Built by [`crate::validation::validate`]; the
/// `Deserialize` impl goes through the same checks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseEnvelope {
    pub request_id: RequestId,
    pub tenant_id: TenantId,
    pub user_id: UserId,
    pub state: EnvelopeState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    pub chunks: Vec<WireChunk>,
    pub timestamp: DateTime<Utc>,
}

impl<'de> Deserialize<'de> for ResponseEnvelope {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Value::deserialize(deserializer)?;
        crate::validation::validate(&raw).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnrecognizedReason {
    MissingType,
    UnknownType,
    Malformed(String),
}

/// A chunk the client could not map onto [`UiChunk`]. Kept as raw JSON so the
/// dispatcher can render a fallback in its place.
#[derive(Debug, Clone, PartialEq)]
pub struct UnrecognizedChunk {
    pub type_name: String,
    pub reason: UnrecognizedReason,
    pub raw: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WireChunk {
    Known(UiChunk),
    Unrecognized(UnrecognizedChunk),
}

impl WireChunk {
    pub fn from_value(raw: Value) -> Self {
        let Some(type_name) = raw.get("type").and_then(Value::as_str).map(str::to_owned) else {
            return Self::Unrecognized(UnrecognizedChunk {
                type_name: String::new(),
                reason: UnrecognizedReason::MissingType,
                raw,
            });
        };

        if !UiChunk::is_known_type(&type_name) {
            return Self::Unrecognized(UnrecognizedChunk {
                type_name,
                reason: UnrecognizedReason::UnknownType,
                raw,
            });
        }

        match serde_json::from_value::<UiChunk>(raw.clone()) {
            Ok(chunk) => Self::Known(chunk),
            Err(err) => Self::Unrecognized(UnrecognizedChunk {
                type_name,
                reason: UnrecognizedReason::Malformed(err.to_string()),
                raw,
            }),
        }
    }

    pub fn type_name(&self) -> &str {
        match self {
            Self::Known(chunk) => chunk.type_name(),
            Self::Unrecognized(chunk) => &chunk.type_name,
        }
    }

    pub fn as_known(&self) -> Option<&UiChunk> {
        match self {
            Self::Known(chunk) => Some(chunk),
            Self::Unrecognized(_) => None,
        }
    }
}

impl From<UiChunk> for WireChunk {
    fn from(chunk: UiChunk) -> Self {
        Self::Known(chunk)
    }
}

impl Serialize for WireChunk {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Self::Known(chunk) => chunk.serialize(serializer),
            Self::Unrecognized(chunk) => chunk.raw.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for WireChunk {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Value::deserialize(deserializer).map(Self::from_value)
    }
}
