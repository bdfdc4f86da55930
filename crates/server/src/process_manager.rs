//! Process manager: one forwarder per working directory.
//!
//! Owns the forwarder registry and the control lock table. Agent output from
//! every forwarder is republished on a single event channel carrying the
//! owning key; fan-out to connections is left to the caller.
//!
//! Responses to RPCs the server issues itself (`request`) are intercepted
//! here and never reach the event channel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use agentbridge_protocol::agent::{payload_id, AgentResponse};
use agentbridge_protocol::{new_id, Payload};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::control_lock::{
    ControlLockManager, ControlRequest, LockConflict, LockSnapshot, ReleasedLocks,
};
use crate::forwarder::{Forwarder, ForwarderConfig, ForwarderError, ForwarderEvent, Lifecycle};
use crate::scheduler::ScheduledTask;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct ProcessManagerConfig {
    /// Forwarders unused for this long (and not locked) are stopped.
    pub idle_ttl: Duration,
    pub sweep_interval: Duration,
}

impl Default for ProcessManagerConfig {
    fn default() -> Self {
        Self {
            idle_ttl: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error(transparent)]
    Forwarder(#[from] ForwarderError),

    #[error("agent did not answer `{command}` within {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("agent exited before answering `{command}`")]
    Dropped { command: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerStatus {
    pub processes: usize,
    /// Forwarders whose agent is currently alive.
    pub running: usize,
    /// Lines queued for agent stdin across all forwarders.
    pub pending_writes: usize,
    pub directory_locks: usize,
    pub session_locks: usize,
}

struct ForwarderEntry {
    forwarder: Forwarder,
    last_used_at: Instant,
}

#[derive(Default)]
struct Inner {
    forwarders: HashMap<String, ForwarderEntry>,
    locks: ControlLockManager,
}

struct PendingRpc {
    key: String,
    reply: oneshot::Sender<AgentResponse>,
}

type PendingRpcs = Arc<Mutex<HashMap<String, PendingRpc>>>;

pub struct ProcessManager {
    config: ProcessManagerConfig,
    forwarder_config: Arc<ForwarderConfig>,
    raw_events: mpsc::Sender<ForwarderEvent>,
    inner: Mutex<Inner>,
    pending: PendingRpcs,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ProcessManager {
    /// Build a manager and the receiver its agent output is published on.
    pub fn new(
        config: ProcessManagerConfig,
        forwarder_config: ForwarderConfig,
    ) -> (Arc<Self>, mpsc::Receiver<ForwarderEvent>) {
        let (raw_tx, raw_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (out_tx, out_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let pending: PendingRpcs = Arc::default();

        tokio::spawn(route_events(raw_rx, out_tx, pending.clone()));

        let manager = Arc::new(Self {
            config,
            forwarder_config: Arc::new(forwarder_config),
            raw_events: raw_tx,
            inner: Mutex::new(Inner::default()),
            pending,
        });
        (manager, out_rx)
    }

    fn touch(&self, key: &str) -> Forwarder {
        let mut inner = lock(&self.inner);
        let now = Instant::now();
        let entry = inner.forwarders.entry(key.to_string()).or_insert_with(|| {
            info!(
                component = "process_manager",
                event = "process_manager.forwarder.created",
                key = %key,
                "Creating forwarder"
            );
            ForwarderEntry {
                forwarder: Forwarder::spawn(
                    key,
                    self.forwarder_config.clone(),
                    self.raw_events.clone(),
                ),
                last_used_at: now,
            }
        });
        entry.last_used_at = now;
        entry.forwarder.clone()
    }

    /// Existing forwarder for `key`, or a new one. The process is started if
    /// it is not already running.
    pub fn get_or_start(&self, key: &str) -> Forwarder {
        let forwarder = self.touch(key);
        forwarder.ensure_started();
        forwarder
    }

    pub async fn send_to(&self, key: &str, payload: Payload) -> Result<(), ManagerError> {
        let forwarder = self.touch(key);
        forwarder.send(payload).await?;
        Ok(())
    }

    /// Send a command and wait for the agent's `response` with the same id.
    ///
    /// An `id` is assigned if the payload has none. The response is consumed
    /// here and not republished.
    pub async fn request(
        &self,
        key: &str,
        mut payload: Payload,
        timeout: Duration,
    ) -> Result<AgentResponse, ManagerError> {
        let id = match payload_id(&payload) {
            Some(id) => id.to_string(),
            None => {
                let id = new_id();
                payload.insert("id".into(), Value::String(id.clone()));
                id
            }
        };
        let command = agentbridge_protocol::agent::payload_type(&payload)
            .unwrap_or("unknown")
            .to_string();

        let (reply, rx) = oneshot::channel();
        lock(&self.pending).insert(
            id.clone(),
            PendingRpc {
                key: key.to_string(),
                reply,
            },
        );

        if let Err(err) = self.send_to(key, payload).await {
            lock(&self.pending).remove(&id);
            return Err(err);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(ManagerError::Dropped { command }),
            Err(_) => {
                lock(&self.pending).remove(&id);
                warn!(
                    component = "process_manager",
                    event = "process_manager.rpc.timeout",
                    key = %key,
                    command = %command,
                    request_id = %id,
                    "Agent RPC timed out"
                );
                Err(ManagerError::Timeout { command, timeout })
            }
        }
    }

    /// Stop every forwarder idle for at least the TTL whose directory is not
    /// lock-held. Returns the evicted keys, sorted.
    pub async fn evict_idle(&self) -> Vec<String> {
        let now = Instant::now();
        let evicted: Vec<(String, Forwarder)> = {
            let mut inner = lock(&self.inner);
            let expired: Vec<String> = inner
                .forwarders
                .iter()
                .filter(|(key, entry)| {
                    now.duration_since(entry.last_used_at) >= self.config.idle_ttl
                        && !inner.locks.is_directory_locked(key)
                })
                .map(|(key, _)| key.clone())
                .collect();
            expired
                .into_iter()
                .filter_map(|key| {
                    inner
                        .forwarders
                        .remove(&key)
                        .map(|entry| (key, entry.forwarder))
                })
                .collect()
        };

        let mut keys = Vec::with_capacity(evicted.len());
        for (key, forwarder) in evicted {
            info!(
                component = "process_manager",
                event = "process_manager.forwarder.evicted",
                key = %key,
                idle_ttl_secs = self.config.idle_ttl.as_secs(),
                "Evicting idle forwarder"
            );
            forwarder.stop().await;
            keys.push(key);
        }
        keys.sort();
        keys
    }

    /// Run `evict_idle` every sweep interval until the manager is dropped or
    /// the returned task is.
    pub fn start_idle_sweep(self: &Arc<Self>) -> ScheduledTask {
        let weak: Weak<Self> = Arc::downgrade(self);
        ScheduledTask::every(self.config.sweep_interval, move || {
            let weak = weak.clone();
            async move {
                let Some(manager) = weak.upgrade() else {
                    return false;
                };
                let evicted = manager.evict_idle().await;
                if !evicted.is_empty() {
                    debug!(
                        component = "process_manager",
                        event = "process_manager.sweep",
                        evicted = evicted.len(),
                        "Idle sweep finished"
                    );
                }
                true
            }
        })
    }

    pub fn acquire_control(&self, request: &ControlRequest) -> Result<(), LockConflict> {
        let result = lock(&self.inner).locks.acquire(request);
        match &result {
            Ok(()) => info!(
                component = "control_lock",
                event = "control_lock.acquired",
                client_id = %request.client_id,
                cwd = %request.directory,
                session_path = ?request.session_path,
                "Control acquired"
            ),
            Err(conflict) => info!(
                component = "control_lock",
                event = "control_lock.denied",
                client_id = %request.client_id,
                cwd = %request.directory,
                reason = %conflict,
                "Control denied"
            ),
        }
        result
    }

    pub fn has_control(&self, client_id: &str, directory: &str) -> bool {
        lock(&self.inner).locks.has_control(client_id, directory)
    }

    pub fn release_control(
        &self,
        client_id: &str,
        directory: &str,
        session_path: Option<&str>,
    ) -> ReleasedLocks {
        let released = lock(&self.inner)
            .locks
            .release(client_id, directory, session_path);
        if !released.is_empty() {
            info!(
                component = "control_lock",
                event = "control_lock.released",
                client_id = %client_id,
                cwd = %directory,
                directories = released.directories.len(),
                sessions = released.sessions.len(),
                "Control released"
            );
        }
        released
    }

    /// Release every lock held by `client_id`.
    pub fn release_client(&self, client_id: &str) -> ReleasedLocks {
        let released = lock(&self.inner).locks.release_client(client_id);
        if !released.is_empty() {
            info!(
                component = "control_lock",
                event = "control_lock.client_released",
                client_id = %client_id,
                directories = ?released.directories,
                sessions = ?released.sessions,
                "Released all locks for client"
            );
        }
        released
    }

    pub fn lock_snapshot(&self) -> LockSnapshot {
        lock(&self.inner).locks.snapshot()
    }

    #[cfg(test)]
    pub fn forwarder_count(&self) -> usize {
        lock(&self.inner).forwarders.len()
    }

    #[cfg(test)]
    pub fn contains(&self, key: &str) -> bool {
        lock(&self.inner).forwarders.contains_key(key)
    }

    pub fn status(&self) -> ManagerStatus {
        let inner = lock(&self.inner);
        let forwarders = inner.forwarders.values().map(|entry| &entry.forwarder);
        ManagerStatus {
            processes: inner.forwarders.len(),
            running: forwarders.clone().filter(|f| f.is_running()).count(),
            pending_writes: forwarders.map(Forwarder::pending_writes).sum(),
            directory_locks: inner.locks.directory_lock_count(),
            session_locks: inner.locks.session_lock_count(),
        }
    }

    /// Stop every forwarder. The manager stays usable; new sends start fresh
    /// forwarders.
    pub async fn shutdown(&self) {
        let forwarders: Vec<Forwarder> = lock(&self.inner)
            .forwarders
            .drain()
            .map(|(_, entry)| entry.forwarder)
            .collect();
        info!(
            component = "process_manager",
            event = "process_manager.shutdown",
            forwarders = forwarders.len(),
            "Stopping all forwarders"
        );
        futures::future::join_all(forwarders.iter().map(Forwarder::stop)).await;
    }
}

/// Intercept responses to server-issued RPCs, republish everything else.
async fn route_events(
    mut raw_rx: mpsc::Receiver<ForwarderEvent>,
    out_tx: mpsc::Sender<ForwarderEvent>,
    pending: PendingRpcs,
) {
    while let Some(event) = raw_rx.recv().await {
        match &event {
            ForwarderEvent::Message { payload, .. } => {
                if let Some(response) = AgentResponse::from_payload(payload) {
                    let waiter = response
                        .id
                        .as_deref()
                        .and_then(|id| lock(&pending).remove(id));
                    if let Some(waiter) = waiter {
                        let _ = waiter.reply.send(response);
                        continue;
                    }
                }
            }
            ForwarderEvent::Lifecycle {
                key,
                lifecycle: Lifecycle::Exited { .. },
            } => {
                // Waiters on an exited agent fail now instead of timing out.
                lock(&pending).retain(|_, rpc| rpc.key != *key);
            }
            ForwarderEvent::Lifecycle { .. } => {}
        }

        if out_tx.send(event).await.is_err() {
            break;
        }
    }
}
