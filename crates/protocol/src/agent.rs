//! Data-channel helpers.
//!
//! Agent payloads are opaque to the bridge. Commands carry a `type` and an
//! optional caller-assigned `id`; the agent answers commands with
//! `{"type": "response", "id", "command", "success", "data"?, "error"?}` and
//! emits everything else as typed events.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::Payload;

pub const RESPONSE_TYPE: &str = "response";

pub const GET_STATE: &str = "get_state";
pub const GET_MESSAGES: &str = "get_messages";
pub const NAVIGATE_TREE: &str = "navigate_tree";
pub const PROMPT: &str = "prompt";

/// Reply to an agent command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl AgentResponse {
    /// Interpret `payload` as a response, if its `type` says it is one.
    pub fn from_payload(payload: &Payload) -> Option<Self> {
        if payload_type(payload) != Some(RESPONSE_TYPE) {
            return None;
        }
        serde_json::from_value(Value::Object(payload.clone())).ok()
    }
}

pub fn payload_type(payload: &Payload) -> Option<&str> {
    payload.get("type").and_then(Value::as_str)
}

pub fn payload_id(payload: &Payload) -> Option<&str> {
    payload.get("id").and_then(Value::as_str)
}

pub fn is_response(payload: &Payload) -> bool {
    payload_type(payload) == Some(RESPONSE_TYPE)
}

/// Build a bare `{type, id}` command.
pub fn command(kind: &str, id: &str) -> Payload {
    let mut payload = Payload::new();
    payload.insert("type".into(), Value::String(kind.to_string()));
    payload.insert("id".into(), Value::String(id.to_string()));
    payload
}

pub fn prompt(id: &str, message: &str) -> Payload {
    let mut payload = command(PROMPT, id);
    payload.insert("message".into(), Value::String(message.to_string()));
    payload
}

pub fn navigate_tree(id: &str, entry_id: &str) -> Payload {
    let mut payload = command(NAVIGATE_TREE, id);
    payload.insert("entryId".into(), Value::String(entry_id.to_string()));
    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> Payload {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn recognizes_responses_only_by_type() {
        let response = object(json!({
            "type": "response", "id": "a1", "command": "get_state",
            "success": true, "data": {"model": "x"}
        }));
        let parsed = AgentResponse::from_payload(&response).expect("response");
        assert_eq!(parsed.id.as_deref(), Some("a1"));
        assert!(parsed.success);

        let event = object(json!({"type": "agent_start", "id": "a1"}));
        assert!(AgentResponse::from_payload(&event).is_none());
        assert!(!is_response(&event));
    }

    #[test]
    fn builds_commands_with_ids() {
        let payload = navigate_tree("n1", "entry-7");
        assert_eq!(
            Value::Object(payload),
            json!({"type": "navigate_tree", "id": "n1", "entryId": "entry-7"})
        );
    }
}
