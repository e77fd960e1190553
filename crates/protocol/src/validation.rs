use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::{
    envelope::{EnvelopeState, ResponseEnvelope, WireChunk},
    error::ValidationError,
};

pub const REQUIRED_FIELDS: [&str; 6] = [
    "request_id",
    "tenant_id",
    "user_id",
    "state",
    "chunks",
    "timestamp",
];

/// Narrows a decoded response to a [`ResponseEnvelope`].
///
/// Checks run in a fixed order and the first violation wins: object-ness,
/// presence of every required field, `chunks` being an array, `state` being a
/// known value. Chunk elements are not inspected here; unknown or malformed
/// chunks are carried as [`WireChunk::Unrecognized`].
pub fn validate(raw: &Value) -> Result<ResponseEnvelope, ValidationError> {
    let object = raw.as_object().ok_or(ValidationError::NotAnObject)?;

    if let Some(missing) = REQUIRED_FIELDS
        .iter()
        .find(|field| object.get(**field).map_or(true, Value::is_null))
    {
        return Err(ValidationError::MissingField(*missing));
    }

    let chunks = object["chunks"]
        .as_array()
        .ok_or(ValidationError::ChunksNotSequence)?;

    let state = match &object["state"] {
        Value::String(raw_state) => EnvelopeState::parse(raw_state)
            .ok_or_else(|| ValidationError::InvalidState(raw_state.clone()))?,
        other => return Err(ValidationError::InvalidState(other.to_string())),
    };

    Ok(ResponseEnvelope {
        request_id: string_field(object, "request_id")?.into(),
        tenant_id: string_field(object, "tenant_id")?.into(),
        user_id: string_field(object, "user_id")?.into(),
        state,
        explanation: optional_string_field(object, "explanation")?,
        chunks: chunks.iter().cloned().map(WireChunk::from_value).collect(),
        timestamp: timestamp_field(&object["timestamp"])?,
    })
}

fn string_field(object: &Map<String, Value>, field: &'static str) -> Result<String, ValidationError> {
    object[field]
        .as_str()
        .map(str::to_owned)
        .ok_or_else(|| ValidationError::InvalidField {
            field,
            reason: "expected a string".into(),
        })
}

fn optional_string_field(
    object: &Map<String, Value>,
    field: &'static str,
) -> Result<Option<String>, ValidationError> {
    match object.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(text)) => Ok(Some(text.clone())),
        Some(_) => Err(ValidationError::InvalidField {
            field,
            reason: "expected a string".into(),
        }),
    }
}

pub(crate) fn timestamp_field(value: &Value) -> Result<DateTime<Utc>, ValidationError> {
    let invalid = |reason: String| ValidationError::InvalidField {
        field: "timestamp",
        reason,
    };
    match value {
        Value::String(text) => DateTime::parse_from_rfc3339(text)
            .map(|parsed| parsed.with_timezone(&Utc))
            .map_err(|err| invalid(format!("not an RFC 3339 timestamp: {err}"))),
        Value::Number(number) => number
            .as_i64()
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .ok_or_else(|| invalid("epoch milliseconds out of range".into())),
        _ => Err(invalid("expected a string or number".into())),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::chunk::UiChunk;

    fn scenario_envelope() -> Value {
        json!({
            "request_id": "r1",
            "tenant_id": "t1",
            "user_id": "u1",
            "state": "COMPLETED",
            "chunks": [{
                "type": "TextBlock",
                "content": "hi",
                "tone": "neutral",
                "collapsible": false,
                "completed": true
            }],
            "timestamp": "2024-01-07T10:30:00Z"
        })
    }

    #[test]
    fn accepts_well_formed_envelope() {
        let envelope = validate(&scenario_envelope()).expect("valid");

        assert_eq!(envelope.request_id.as_str(), "r1");
        assert_eq!(envelope.state, EnvelopeState::Completed);
        assert_eq!(envelope.chunks.len(), 1);
        assert!(matches!(
            envelope.chunks[0].as_known(),
            Some(UiChunk::TextBlock(_))
        ));
        assert_eq!(envelope.timestamp.to_rfc3339(), "2024-01-07T10:30:00+00:00");
    }

    #[test]
    fn each_missing_field_is_named() {
        for field in REQUIRED_FIELDS {
            let mut raw = scenario_envelope();
            raw.as_object_mut().expect("object").remove(field);
            assert_eq!(validate(&raw), Err(ValidationError::MissingField(field)));
        }
    }

    #[test]
    fn null_counts_as_missing() {
        let mut raw = scenario_envelope();
        raw["user_id"] = Value::Null;
        assert_eq!(validate(&raw), Err(ValidationError::MissingField("user_id")));
    }

    #[test]
    fn first_missing_field_wins() {
        let raw = json!({ "state": "COMPLETED" });
        assert_eq!(
            validate(&raw),
            Err(ValidationError::MissingField("request_id"))
        );
    }

    #[test]
    fn rejects_non_objects() {
        assert_eq!(validate(&json!([1, 2])), Err(ValidationError::NotAnObject));
        assert_eq!(validate(&json!("x")), Err(ValidationError::NotAnObject));
    }

    #[test]
    fn rejects_states_outside_enum() {
        for bad in ["RUNNING", "completed", ""] {
            let mut raw = scenario_envelope();
            raw["state"] = json!(bad);
            assert_eq!(
                validate(&raw),
                Err(ValidationError::InvalidState(bad.to_string()))
            );
        }

        let mut raw = scenario_envelope();
        raw["state"] = json!(3);
        assert!(matches!(validate(&raw), Err(ValidationError::InvalidState(_))));
    }

    #[test]
    fn invalid_state_message_names_value() {
        let mut raw = scenario_envelope();
        raw["state"] = json!("RUNNING");
        let err = validate(&raw).expect_err("invalid state");
        assert!(err.to_string().contains("RUNNING"));
    }

    #[test]
    fn chunks_must_be_a_sequence() {
        let mut raw = scenario_envelope();
        raw["chunks"] = json!({ "type": "TextBlock" });
        assert_eq!(validate(&raw), Err(ValidationError::ChunksNotSequence));
    }

    #[test]
    fn empty_chunks_are_allowed() {
        let mut raw = scenario_envelope();
        raw["chunks"] = json!([]);
        assert!(validate(&raw).expect("valid").chunks.is_empty());
    }

    #[test]
    fn unknown_chunks_do_not_reject_envelope() {
        let mut raw = scenario_envelope();
        raw["chunks"] = json!([{ "type": "Foo" }, 42]);
        let envelope = validate(&raw).expect("valid");
        assert_eq!(envelope.chunks.len(), 2);
        assert_eq!(envelope.chunks[0].type_name(), "Foo");
    }

    #[test]
    fn wrongly_typed_ids_are_invalid_fields() {
        let mut raw = scenario_envelope();
        raw["tenant_id"] = json!(7);
        assert!(matches!(
            validate(&raw),
            Err(ValidationError::InvalidField {
                field: "tenant_id",
                ..
            })
        ));
    }

    #[test]
    fn accepts_epoch_millis_timestamp() {
        let mut raw = scenario_envelope();
        raw["timestamp"] = json!(1_704_623_400_000_i64);
        let envelope = validate(&raw).expect("valid");
        assert_eq!(envelope.timestamp.timestamp(), 1_704_623_400);
    }

    #[test]
    fn rejects_unparseable_timestamp() {
        let mut raw = scenario_envelope();
        raw["timestamp"] = json!("yesterday");
        assert!(matches!(
            validate(&raw),
            Err(ValidationError::InvalidField {
                field: "timestamp",
                ..
            })
        ));
    }

    #[test]
    fn deserialize_impl_runs_validation() {
        let mut raw = scenario_envelope();
        raw["state"] = json!("RUNNING");
        assert!(serde_json::from_value::<ResponseEnvelope>(raw).is_err());
        assert!(serde_json::from_value::<ResponseEnvelope>(scenario_envelope()).is_ok());
    }
}
