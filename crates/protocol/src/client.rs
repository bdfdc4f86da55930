//! Client → Server control messages

use serde::{Deserialize, Serialize};

/// Control-channel requests sent from client to server.
///
/// Every request may carry a `requestId`; the server echoes it on the reply
/// (or on the `error` that rejects it).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientControl {
    SetCwd {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        cwd: String,
    },
    AcquireControl {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_path: Option<String>,
    },
    ReleaseControl {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_path: Option<String>,
    },
    ListSessions {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    GetSessionTree {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        session_path: String,
        /// Raw filter name; validated server-side so a bad value yields
        /// `invalid_tree_filter` rather than a framing error.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filter: Option<String>,
    },
    NavigateTree {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        entry_id: String,
    },
    /// Any `type` this build does not know about.
    #[serde(other)]
    Unknown,
}

impl ClientControl {
    pub fn request_id(&self) -> Option<&str> {
        match self {
            ClientControl::SetCwd { request_id, .. }
            | ClientControl::AcquireControl { request_id, .. }
            | ClientControl::ReleaseControl { request_id, .. }
            | ClientControl::ListSessions { request_id }
            | ClientControl::GetSessionTree { request_id, .. }
            | ClientControl::NavigateTree { request_id, .. } => request_id.as_deref(),
            ClientControl::Unknown => None,
        }
    }

    /// Attach a correlation id, replacing any existing one.
    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        let id = Some(id.into());
        match &mut self {
            ClientControl::SetCwd { request_id, .. }
            | ClientControl::AcquireControl { request_id, .. }
            | ClientControl::ReleaseControl { request_id, .. }
            | ClientControl::ListSessions { request_id }
            | ClientControl::GetSessionTree { request_id, .. }
            | ClientControl::NavigateTree { request_id, .. } => *request_id = id,
            ClientControl::Unknown => {}
        }
        self
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ClientControl::SetCwd { .. } => "set_cwd",
            ClientControl::AcquireControl { .. } => "acquire_control",
            ClientControl::ReleaseControl { .. } => "release_control",
            ClientControl::ListSessions { .. } => "list_sessions",
            ClientControl::GetSessionTree { .. } => "get_session_tree",
            ClientControl::NavigateTree { .. } => "navigate_tree",
            ClientControl::Unknown => "unknown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_camel_case_fields() {
        let msg: ClientControl = serde_json::from_value(json!({
            "type": "acquire_control",
            "requestId": "r1",
            "cwd": "/repo",
            "sessionPath": "/sessions/a.jsonl"
        }))
        .unwrap();
        assert_eq!(
            msg,
            ClientControl::AcquireControl {
                request_id: Some("r1".into()),
                cwd: Some("/repo".into()),
                session_path: Some("/sessions/a.jsonl".into()),
            }
        );
        assert_eq!(msg.request_id(), Some("r1"));
    }

    #[test]
    fn unknown_types_fall_back_instead_of_failing() {
        let msg: ClientControl =
            serde_json::from_value(json!({"type": "teleport", "where": "mars"})).unwrap();
        assert_eq!(msg, ClientControl::Unknown);
    }

    #[test]
    fn known_type_missing_required_field_is_an_error() {
        let result = serde_json::from_value::<ClientControl>(json!({"type": "set_cwd"}));
        assert!(result.is_err());
    }

    #[test]
    fn with_request_id_sets_correlation() {
        let msg = ClientControl::ListSessions { request_id: None }.with_request_id("abc");
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value, json!({"type": "list_sessions", "requestId": "abc"}));
    }
}
