use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::domain::{Identity, RequestId, TenantId, UserId};

pub const USER_ACTION: &str = "user_action";
pub const FORM_SUBMIT: &str = "form_submit";

/// Body of every one-shot call to the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorRequest {
    pub action: String,
    pub payload: Value,
    pub tenant_id: TenantId,
    pub user_id: UserId,
    pub request_id: RequestId,
}

impl OrchestratorRequest {
    pub fn new(
        action: impl Into<String>,
        payload: Value,
        identity: &Identity,
        request_id: RequestId,
    ) -> Self {
        Self {
            action: action.into(),
            payload,
            tenant_id: identity.tenant_id.clone(),
            user_id: identity.user_id.clone(),
            request_id,
        }
    }

    pub fn user_action(
        action_id: &str,
        payload: Value,
        identity: &Identity,
        request_id: RequestId,
    ) -> Self {
        Self::new(USER_ACTION, action_payload(action_id, payload), identity, request_id)
    }
}

/// `{actionId, ...payload}`. Non-object payloads other than `null` are kept
/// under `value`.
pub fn action_payload(action_id: &str, payload: Value) -> Value {
    let mut merged = Map::new();
    merged.insert("actionId".into(), Value::String(action_id.to_string()));
    match payload {
        Value::Object(fields) => merged.extend(fields),
        Value::Null => {}
        other => {
            merged.insert("value".into(), other);
        }
    }
    Value::Object(merged)
}

pub fn form_submission(form_id: &str, data: Map<String, Value>) -> Value {
    json!({ "form_id": form_id, "data": data })
}
