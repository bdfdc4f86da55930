//! Server → Client control messages

use serde::{Deserialize, Serialize};

use crate::types::*;

/// Control-channel messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerControl {
    /// First message on every connection.
    Hello {
        client_id: String,
        resumed: bool,
        cwd: Option<String>,
    },
    CwdSet {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        cwd: String,
    },
    ControlAcquired {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        cwd: String,
        session_path: Option<String>,
    },
    ControlReleased {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        cwd: Option<String>,
        session_path: Option<String>,
    },
    Sessions {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        groups: Vec<SessionGroup>,
    },
    SessionTree {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        session_path: String,
        root_ids: Vec<String>,
        current_leaf_id: Option<String>,
        entries: Vec<TreeEntry>,
    },
    TreeNavigationResult {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        cancelled: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        editor_text: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        current_leaf_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_path: Option<String>,
    },
    /// Subprocess lifecycle for the connection's directory.
    AgentStatus {
        cwd: String,
        status: AgentStatusKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pid: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<i32>,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        code: ErrorCode,
        message: String,
    },
    #[serde(other)]
    Unknown,
}

impl ServerControl {
    pub fn error(request_id: Option<&str>, code: ErrorCode, message: impl Into<String>) -> Self {
        ServerControl::Error {
            request_id: request_id.map(str::to_string),
            code,
            message: message.into(),
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        match self {
            ServerControl::CwdSet { request_id, .. }
            | ServerControl::ControlAcquired { request_id, .. }
            | ServerControl::ControlReleased { request_id, .. }
            | ServerControl::Sessions { request_id, .. }
            | ServerControl::SessionTree { request_id, .. }
            | ServerControl::TreeNavigationResult { request_id, .. }
            | ServerControl::Error { request_id, .. } => request_id.as_deref(),
            ServerControl::Hello { .. }
            | ServerControl::AgentStatus { .. }
            | ServerControl::Unknown => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ServerControl::Hello { .. } => "hello",
            ServerControl::CwdSet { .. } => "cwd_set",
            ServerControl::ControlAcquired { .. } => "control_acquired",
            ServerControl::ControlReleased { .. } => "control_released",
            ServerControl::Sessions { .. } => "sessions",
            ServerControl::SessionTree { .. } => "session_tree",
            ServerControl::TreeNavigationResult { .. } => "tree_navigation_result",
            ServerControl::AgentStatus { .. } => "agent_status",
            ServerControl::Error { .. } => "error",
            ServerControl::Unknown => "unknown",
        }
    }
}
