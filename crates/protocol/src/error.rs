use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::domain::RequestId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    FetchFailed,
    AdjacencyFailed,
    ActionFailed,
    StreamParseError,
    StreamError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FetchFailed => "FETCH_FAILED",
            Self::AdjacencyFailed => "ADJACENCY_FAILED",
            Self::ActionFailed => "ACTION_FAILED",
            Self::StreamParseError => "STREAM_PARSE_ERROR",
            Self::StreamError => "STREAM_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Uniform failure surfaced by every transport operation.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct ProtocolError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(
        default,
        rename = "requestId",
        skip_serializing_if = "Option::is_none"
    )]
    pub request_id: Option<RequestId>,
}

impl ProtocolError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
            request_id: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_request_id(mut self, request_id: RequestId) -> Self {
        self.request_id = Some(request_id);
        self
    }

    /// Parse errors drop one message; every other stream failure ends the
    /// connection.
    pub fn closes_stream(&self) -> bool {
        self.code == ErrorCode::StreamError
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("response is not an object")]
    NotAnObject,
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("field `chunks` must be an array")]
    ChunksNotSequence,
    #[error("invalid state `{0}`")]
    InvalidState(String),
    #[error("invalid field `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

impl ValidationError {
    pub fn into_protocol_error(self, code: ErrorCode) -> ProtocolError {
        let details = match &self {
            Self::MissingField(field) | Self::InvalidField { field, .. } => {
                serde_json::json!({ "field": field })
            }
            Self::InvalidState(state) => serde_json::json!({ "state": state }),
            Self::NotAnObject | Self::ChunksNotSequence => Value::Null,
        };
        let error = ProtocolError::new(code, format!("invalid response envelope: {self}"));
        if details.is_null() {
            error
        } else {
            error.with_details(details)
        }
    }
}
