//! Core types shared across the protocol

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Stable error codes carried by `error` control payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    MalformedEnvelope,
    InvalidCwd,
    InvalidSessionPath,
    InvalidTreeFilter,
    MissingCwdContext,
    ControlLockDenied,
    ControlLockRequired,
    RpcForwardFailed,
    TreeNavigationFailed,
    UnsupportedControlType,
    InternalError,
    #[serde(other)]
    Unknown,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::MalformedEnvelope => "malformed_envelope",
            ErrorCode::InvalidCwd => "invalid_cwd",
            ErrorCode::InvalidSessionPath => "invalid_session_path",
            ErrorCode::InvalidTreeFilter => "invalid_tree_filter",
            ErrorCode::MissingCwdContext => "missing_cwd_context",
            ErrorCode::ControlLockDenied => "control_lock_denied",
            ErrorCode::ControlLockRequired => "control_lock_required",
            ErrorCode::RpcForwardFailed => "rpc_forward_failed",
            ErrorCode::TreeNavigationFailed => "tree_navigation_failed",
            ErrorCode::UnsupportedControlType => "unsupported_control_type",
            ErrorCode::InternalError => "internal_error",
            ErrorCode::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Subprocess lifecycle reported on the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatusKind {
    Started,
    Exited,
}

/// A persisted session known to the session catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub path: String,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<String>,
    #[serde(default)]
    pub message_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_message: Option<String>,
}

/// Sessions grouped by the working directory they were recorded in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionGroup {
    pub cwd: String,
    pub sessions: Vec<SessionSummary>,
}

/// One node in a session's entry tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeEntry {
    pub entry_id: String,
    pub parent_id: Option<String>,
    pub entry_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    pub preview: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default)]
    pub is_bookmarked: bool,
}

/// Point-in-time view of a session tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionTreeSnapshot {
    pub root_ids: Vec<String>,
    pub current_leaf_id: Option<String>,
    pub entries: Vec<TreeEntry>,
}

/// Which entries of a session tree a client wants to see.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum TreeFilter {
    #[default]
    Default,
    All,
    NoTools,
    UserOnly,
    LabeledOnly,
}

impl TreeFilter {
    pub fn as_str(self) -> &'static str {
        match self {
            TreeFilter::Default => "default",
            TreeFilter::All => "all",
            TreeFilter::NoTools => "no-tools",
            TreeFilter::UserOnly => "user-only",
            TreeFilter::LabeledOnly => "labeled-only",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownTreeFilter(pub String);

impl fmt::Display for UnknownTreeFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unknown tree filter `{}` (expected default, all, no-tools, user-only or labeled-only)",
            self.0
        )
    }
}

impl std::error::Error for UnknownTreeFilter {}

impl FromStr for TreeFilter {
    type Err = UnknownTreeFilter;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "default" => Ok(TreeFilter::Default),
            "all" => Ok(TreeFilter::All),
            "no-tools" => Ok(TreeFilter::NoTools),
            "user-only" => Ok(TreeFilter::UserOnly),
            "labeled-only" => Ok(TreeFilter::LabeledOnly),
            other => Err(UnknownTreeFilter(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tree_filters_parse_their_wire_names() {
        for filter in [
            TreeFilter::Default,
            TreeFilter::All,
            TreeFilter::NoTools,
            TreeFilter::UserOnly,
            TreeFilter::LabeledOnly,
        ] {
            assert_eq!(filter.as_str().parse::<TreeFilter>(), Ok(filter));
        }
        assert!("tools-only".parse::<TreeFilter>().is_err());
    }

    #[test]
    fn unknown_error_codes_decode_to_fallback() {
        let code: ErrorCode = serde_json::from_str(r#""quota_exceeded""#).unwrap();
        assert_eq!(code, ErrorCode::Unknown);
        let code: ErrorCode = serde_json::from_str(r#""control_lock_denied""#).unwrap();
        assert_eq!(code, ErrorCode::ControlLockDenied);
    }
}
