//! Exclusive "driving" rights over a directory and, optionally, a session
//! inside it.
//!
//! At most one client owns a directory and at most one client owns a session
//! path at any time. The manager is a plain value owned by the
//! [`ProcessManager`](crate::process_manager::ProcessManager); callers
//! serialize access through it.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use thiserror::Error;

/// A request for control of `directory` (and `session_path`, if given).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRequest {
    pub client_id: String,
    pub directory: String,
    pub session_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockConflict {
    #[error("directory {directory} is controlled by another client")]
    Directory { directory: String, owner: String },

    #[error("session {session_path} is controlled by another client")]
    Session { session_path: String, owner: String },
}

#[derive(Debug, Clone)]
struct SessionLock {
    owner: String,
    directory: String,
}

/// Locks released on behalf of one client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReleasedLocks {
    pub directories: Vec<String>,
    pub sessions: Vec<String>,
}

impl ReleasedLocks {
    pub fn is_empty(&self) -> bool {
        self.directories.is_empty() && self.sessions.is_empty()
    }
}

/// Owners of every held lock, sorted by resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LockSnapshot {
    pub directories: BTreeMap<String, String>,
    pub sessions: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
pub struct ControlLockManager {
    by_directory: HashMap<String, String>,
    by_session: HashMap<String, SessionLock>,
}

impl ControlLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant control, or report which resource is held by someone else.
    ///
    /// Re-acquiring a lock the client already owns succeeds. A client owns at
    /// most one session per directory: taking a new session path drops its
    /// previous session lock in that directory.
    pub fn acquire(&mut self, request: &ControlRequest) -> Result<(), LockConflict> {
        if let Some(owner) = self.by_directory.get(&request.directory) {
            if owner != &request.client_id {
                return Err(LockConflict::Directory {
                    directory: request.directory.clone(),
                    owner: owner.clone(),
                });
            }
        }

        if let Some(session_path) = &request.session_path {
            if let Some(lock) = self.by_session.get(session_path) {
                if lock.owner != request.client_id {
                    return Err(LockConflict::Session {
                        session_path: session_path.clone(),
                        owner: lock.owner.clone(),
                    });
                }
            }
        }

        self.by_directory
            .insert(request.directory.clone(), request.client_id.clone());

        if let Some(session_path) = &request.session_path {
            self.by_session.retain(|path, lock| {
                path == session_path
                    || lock.owner != request.client_id
                    || lock.directory != request.directory
            });
            self.by_session.insert(
                session_path.clone(),
                SessionLock {
                    owner: request.client_id.clone(),
                    directory: request.directory.clone(),
                },
            );
        }

        Ok(())
    }

    pub fn has_control(&self, client_id: &str, directory: &str) -> bool {
        self.by_directory
            .get(directory)
            .is_some_and(|owner| owner == client_id)
    }

    pub fn has_session_control(&self, client_id: &str, session_path: &str) -> bool {
        self.by_session
            .get(session_path)
            .is_some_and(|lock| lock.owner == client_id)
    }

    #[cfg(test)]
    pub fn owner_of(&self, directory: &str) -> Option<&str> {
        self.by_directory.get(directory).map(String::as_str)
    }

    pub fn is_directory_locked(&self, directory: &str) -> bool {
        self.by_directory.contains_key(directory)
    }

    /// Release the client's lock on `directory`.
    ///
    /// With a `session_path`, only that session lock is released and the
    /// directory stays held. Without one, the directory lock and every
    /// session lock the client holds under it are released. Locks owned by
    /// other clients are never touched.
    pub fn release(
        &mut self,
        client_id: &str,
        directory: &str,
        session_path: Option<&str>,
    ) -> ReleasedLocks {
        let mut released = ReleasedLocks::default();

        if let Some(session_path) = session_path {
            if self.has_session_control(client_id, session_path) {
                self.by_session.remove(session_path);
                released.sessions.push(session_path.to_string());
            }
            return released;
        }

        if self.has_control(client_id, directory) {
            self.by_directory.remove(directory);
            released.directories.push(directory.to_string());
        }

        let sessions: Vec<String> = self
            .by_session
            .iter()
            .filter(|(_, lock)| lock.owner == client_id && lock.directory == directory)
            .map(|(path, _)| path.clone())
            .collect();
        for path in sessions {
            self.by_session.remove(&path);
            released.sessions.push(path);
        }

        released
    }

    /// Release everything a client owns (disconnect / grace expiry).
    pub fn release_client(&mut self, client_id: &str) -> ReleasedLocks {
        let mut released = ReleasedLocks::default();

        self.by_directory.retain(|directory, owner| {
            if owner == client_id {
                released.directories.push(directory.clone());
                false
            } else {
                true
            }
        });
        self.by_session.retain(|path, lock| {
            if lock.owner == client_id {
                released.sessions.push(path.clone());
                false
            } else {
                true
            }
        });

        released.directories.sort();
        released.sessions.sort();
        released
    }

    pub fn directory_lock_count(&self) -> usize {
        self.by_directory.len()
    }

    pub fn session_lock_count(&self) -> usize {
        self.by_session.len()
    }

    pub fn snapshot(&self) -> LockSnapshot {
        LockSnapshot {
            directories: self
                .by_directory
                .iter()
                .map(|(dir, owner)| (dir.clone(), owner.clone()))
                .collect(),
            sessions: self
                .by_session
                .iter()
                .map(|(path, lock)| (path.clone(), lock.owner.clone()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(client: &str, dir: &str, session: Option<&str>) -> ControlRequest {
        ControlRequest {
            client_id: client.to_string(),
            directory: dir.to_string(),
            session_path: session.map(str::to_string),
        }
    }

    #[test]
    fn second_client_is_denied_and_first_owner_is_unchanged() {
        let mut locks = ControlLockManager::new();
        locks.acquire(&request("a", "/repo", None)).unwrap();

        let err = locks.acquire(&request("b", "/repo", None)).unwrap_err();
        assert_eq!(
            err,
            LockConflict::Directory {
                directory: "/repo".into(),
                owner: "a".into()
            }
        );
        assert_eq!(locks.owner_of("/repo"), Some("a"));
        assert!(locks.has_control("a", "/repo"));
        assert!(!locks.has_control("b", "/repo"));
    }

    #[test]
    fn reacquire_by_owner_is_idempotent() {
        let mut locks = ControlLockManager::new();
        locks.acquire(&request("a", "/repo", None)).unwrap();
        locks.acquire(&request("a", "/repo", None)).unwrap();
        assert_eq!(locks.directory_lock_count(), 1);
    }

    #[test]
    fn session_conflict_is_reported_separately() {
        let mut locks = ControlLockManager::new();
        locks
            .acquire(&request("a", "/repo-a", Some("/s/one.jsonl")))
            .unwrap();

        let err = locks
            .acquire(&request("b", "/repo-b", Some("/s/one.jsonl")))
            .unwrap_err();
        assert!(matches!(err, LockConflict::Session { owner, .. } if owner == "a"));
        // The failed request must not leave a directory lock behind.
        assert!(!locks.is_directory_locked("/repo-b"));
    }

    #[test]
    fn release_frees_lock_for_next_client() {
        let mut locks = ControlLockManager::new();
        locks.acquire(&request("a", "/repo", None)).unwrap();

        let released = locks.release("a", "/repo", None);
        assert_eq!(released.directories, vec!["/repo".to_string()]);
        locks.acquire(&request("b", "/repo", None)).unwrap();
        assert_eq!(locks.owner_of("/repo"), Some("b"));
    }

    #[test]
    fn release_by_non_owner_is_a_no_op() {
        let mut locks = ControlLockManager::new();
        locks.acquire(&request("a", "/repo", None)).unwrap();
        assert!(locks.release("b", "/repo", None).is_empty());
        assert_eq!(locks.owner_of("/repo"), Some("a"));
    }

    #[test]
    fn releasing_directory_drops_its_sessions() {
        let mut locks = ControlLockManager::new();
        locks
            .acquire(&request("a", "/repo", Some("/s/one.jsonl")))
            .unwrap();

        let released = locks.release("a", "/repo", None);
        assert_eq!(released.sessions, vec!["/s/one.jsonl".to_string()]);
        assert_eq!(locks.session_lock_count(), 0);
    }

    #[test]
    fn releasing_only_a_session_keeps_directory() {
        let mut locks = ControlLockManager::new();
        locks
            .acquire(&request("a", "/repo", Some("/s/one.jsonl")))
            .unwrap();

        locks.release("a", "/repo", Some("/s/one.jsonl"));
        assert!(locks.has_control("a", "/repo"));
        assert!(!locks.has_session_control("a", "/s/one.jsonl"));
    }

    #[test]
    fn switching_sessions_in_a_directory_replaces_the_old_session_lock() {
        let mut locks = ControlLockManager::new();
        locks
            .acquire(&request("a", "/repo", Some("/s/one.jsonl")))
            .unwrap();
        locks
            .acquire(&request("a", "/repo", Some("/s/two.jsonl")))
            .unwrap();

        assert!(!locks.has_session_control("a", "/s/one.jsonl"));
        assert!(locks.has_session_control("a", "/s/two.jsonl"));
        locks
            .acquire(&request("b", "/other", Some("/s/one.jsonl")))
            .unwrap();
    }

    #[test]
    fn release_client_drops_everything_it_owns() {
        let mut locks = ControlLockManager::new();
        locks
            .acquire(&request("a", "/one", Some("/s/a.jsonl")))
            .unwrap();
        locks.acquire(&request("a", "/two", None)).unwrap();
        locks.acquire(&request("b", "/three", None)).unwrap();

        let released = locks.release_client("a");
        assert_eq!(
            released.directories,
            vec!["/one".to_string(), "/two".to_string()]
        );
        assert_eq!(released.sessions, vec!["/s/a.jsonl".to_string()]);

        let snapshot = locks.snapshot();
        assert_eq!(snapshot.directories.len(), 1);
        assert_eq!(snapshot.directories.get("/three").map(String::as_str), Some("b"));
        assert!(snapshot.sessions.is_empty());
    }
}
