//! Request/response correlation by caller-assigned id.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use agentbridge_protocol::agent::AgentResponse;
use agentbridge_protocol::{ErrorCode, ServerControl};
use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum RequestError {
    #[error("{kind} timed out after {after:?}")]
    Timeout { kind: String, after: Duration },

    #[error("connection is reconnecting")]
    Reconnecting,

    #[error("request cancelled")]
    Cancelled,

    #[error("server rejected request ({}): {message}", code.as_str())]
    Remote { code: ErrorCode, message: String },

    #[error("agent command {command} failed: {message}")]
    Agent { command: String, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// A correlated reply, already split by channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Control(ServerControl),
    Data(AgentResponse),
}

type Completion = oneshot::Sender<Result<Reply, RequestError>>;

struct PendingEntry {
    /// Reply `type` the caller is waiting for (`cwd_set`, `response`, ...).
    expected: &'static str,
    completion: Completion,
}

#[derive(Default)]
pub struct PendingRequests {
    inner: Mutex<HashMap<String, PendingEntry>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PendingEntry>> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register before sending so a fast reply cannot be missed.
    pub fn register(
        &self,
        id: &str,
        expected: &'static str,
    ) -> oneshot::Receiver<Result<Reply, RequestError>> {
        let (completion, rx) = oneshot::channel();
        let previous = self.lock().insert(
            id.to_string(),
            PendingEntry {
                expected,
                completion,
            },
        );
        if let Some(previous) = previous {
            let _ = previous.completion.send(Err(RequestError::Cancelled));
        }
        rx
    }

    /// Complete the request `id` if one is pending. Returns whether the
    /// reply was consumed.
    pub fn resolve(&self, id: &str, reply: Reply) -> bool {
        let Some(entry) = self.lock().remove(id) else {
            return false;
        };
        let result = match reply {
            Reply::Control(ServerControl::Error { code, message, .. }) => {
                Err(RequestError::Remote { code, message })
            }
            Reply::Control(control) if control.kind() != entry.expected => {
                Err(RequestError::Protocol(format!(
                    "expected {} reply, got {}",
                    entry.expected,
                    control.kind()
                )))
            }
            Reply::Data(_) if entry.expected != agentbridge_protocol::agent::RESPONSE_TYPE => {
                Err(RequestError::Protocol(format!(
                    "expected {} reply, got agent response",
                    entry.expected
                )))
            }
            reply => Ok(reply),
        };
        let _ = entry.completion.send(result);
        true
    }

    pub fn remove(&self, id: &str) -> bool {
        self.lock().remove(id).is_some()
    }

    /// Fail every pending request with `error`. Returns how many were failed.
    pub fn fail_all(&self, error: RequestError) -> usize {
        let drained: Vec<PendingEntry> = self.lock().drain().map(|(_, entry)| entry).collect();
        let count = drained.len();
        for entry in drained {
            let _ = entry.completion.send(Err(error.clone()));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cwd_set(id: &str) -> Reply {
        Reply::Control(ServerControl::CwdSet {
            request_id: Some(id.into()),
            cwd: "/repo".into(),
        })
    }

    #[tokio::test]
    async fn resolves_matching_reply() {
        let pending = PendingRequests::new();
        let rx = pending.register("r1", "cwd_set");
        assert!(pending.resolve("r1", cwd_set("r1")));
        assert_eq!(rx.await.unwrap(), Ok(cwd_set("r1")));
        assert!(pending.is_empty());
        assert!(!pending.resolve("r1", cwd_set("r1")));
    }

    #[tokio::test]
    async fn error_reply_becomes_remote_error() {
        let pending = PendingRequests::new();
        let rx = pending.register("r2", "control_acquired");
        pending.resolve(
            "r2",
            Reply::Control(ServerControl::error(
                Some("r2"),
                ErrorCode::ControlLockDenied,
                "held by other",
            )),
        );
        assert_eq!(
            rx.await.unwrap(),
            Err(RequestError::Remote {
                code: ErrorCode::ControlLockDenied,
                message: "held by other".into(),
            })
        );
    }

    #[tokio::test]
    async fn wrong_reply_kind_is_a_protocol_error() {
        let pending = PendingRequests::new();
        let rx = pending.register("r3", "sessions");
        pending.resolve("r3", cwd_set("r3"));
        assert!(matches!(rx.await.unwrap(), Err(RequestError::Protocol(_))));
    }

    #[tokio::test]
    async fn fail_all_completes_every_waiter() {
        let pending = PendingRequests::new();
        let a = pending.register("a", "response");
        let b = pending.register("b", "cwd_set");
        assert_eq!(pending.fail_all(RequestError::Reconnecting), 2);
        assert_eq!(a.await.unwrap(), Err(RequestError::Reconnecting));
        assert_eq!(b.await.unwrap(), Err(RequestError::Reconnecting));
        assert!(pending.is_empty());
    }
}
