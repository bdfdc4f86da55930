//! Bridge state shared by every connection.
//!
//! A client context outlives its connection: when a socket drops, the context
//! (current directory, held locks) is kept for a grace period so the same
//! `clientId` can resume it. When the grace period expires the context is
//! discarded and all its locks are released.

use std::sync::{Arc, Weak};
use std::time::Duration;

use agentbridge_protocol::new_id;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{mpsc, Notify};
use tracing::info;

use crate::process_manager::ProcessManager;
use crate::scheduler::ScheduledTask;
use crate::session_catalog::SessionCatalog;
use crate::websocket::OutboundMessage;

const MAX_CLIENT_ID_LEN: usize = 128;

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// How long a disconnected client's context survives.
    pub reconnect_grace: Duration,
    pub navigate_timeout: Duration,
    /// Per-connection outbound queue capacity.
    pub outbound_buffer: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            reconnect_grace: Duration::from_secs(30),
            navigate_timeout: Duration::from_secs(30),
            outbound_buffer: 256,
        }
    }
}

struct ClientContext {
    current_directory: Option<String>,
    connection_id: Option<u64>,
    expiry: Option<ScheduledTask>,
}

/// Outbound side of a live socket.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub client_id: String,
    pub outbound: mpsc::Sender<OutboundMessage>,
    /// Notified to make the socket task close the connection.
    pub kick: Arc<Notify>,
}

/// Result of attaching a socket to a client context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attached {
    pub client_id: String,
    pub resumed: bool,
    pub cwd: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BridgeStatus {
    pub clients: usize,
    pub connections: usize,
}

pub struct BridgeState {
    pub manager: Arc<ProcessManager>,
    pub catalog: Arc<dyn SessionCatalog>,
    pub config: BridgeConfig,
    clients: DashMap<String, ClientContext>,
    connections: DashMap<u64, ConnectionHandle>,
}

/// Client-supplied ids are kept only if they are short and printable.
fn accept_client_id(raw: Option<&str>) -> Option<String> {
    let id = raw?.trim();
    let valid = !id.is_empty()
        && id.len() <= MAX_CLIENT_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'));
    valid.then(|| id.to_string())
}

impl BridgeState {
    pub fn new(
        manager: Arc<ProcessManager>,
        catalog: Arc<dyn SessionCatalog>,
        config: BridgeConfig,
    ) -> Self {
        Self {
            manager,
            catalog,
            config,
            clients: DashMap::new(),
            connections: DashMap::new(),
        }
    }

    /// Bind a new connection to a client context.
    ///
    /// A known `requested_id` resumes its context (cancelling expiry) and
    /// supersedes any connection still attached to it. Otherwise a fresh
    /// context is created, keeping the requested id when it is well formed.
    /// The connection receives no fan-out until it is [`register`]ed.
    ///
    /// [`register`]: Self::register
    pub fn attach(&self, requested_id: Option<&str>, connection_id: u64) -> Attached {
        let client_id = accept_client_id(requested_id).unwrap_or_else(new_id);

        let (resumed, cwd, previous) = match self.clients.entry(client_id.clone()) {
            Entry::Occupied(mut occupied) => {
                let context = occupied.get_mut();
                context.expiry = None;
                let previous = context.connection_id.replace(connection_id);
                (true, context.current_directory.clone(), previous)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(ClientContext {
                    current_directory: None,
                    connection_id: Some(connection_id),
                    expiry: None,
                });
                (false, None, None)
            }
        };

        if let Some(previous) = previous.filter(|id| *id != connection_id) {
            if let Some((_, old)) = self.connections.remove(&previous) {
                info!(
                    component = "bridge",
                    event = "bridge.connection.superseded",
                    client_id = %client_id,
                    old_connection_id = previous,
                    connection_id,
                    "Client reconnected, closing previous connection"
                );
                old.kick.notify_one();
            }
        }

        info!(
            component = "bridge",
            event = "bridge.client.attached",
            client_id = %client_id,
            connection_id,
            resumed,
            cwd = ?cwd,
            "Client attached"
        );

        Attached {
            client_id,
            resumed,
            cwd,
        }
    }

    /// Make an attached connection reachable for fan-out and kicks.
    pub fn register(&self, connection_id: u64, handle: ConnectionHandle) {
        self.connections.insert(connection_id, handle);
    }

    /// Detach a closed connection and start the grace timer, unless a newer
    /// connection already took the context over.
    pub fn detach(self: &Arc<Self>, client_id: &str, connection_id: u64) {
        self.connections.remove(&connection_id);

        let Some(mut context) = self.clients.get_mut(client_id) else {
            return;
        };
        if context.connection_id != Some(connection_id) {
            return;
        }
        context.connection_id = None;

        let grace = self.config.reconnect_grace;
        let weak: Weak<Self> = Arc::downgrade(self);
        let expiring = client_id.to_string();
        context.expiry = Some(ScheduledTask::after(grace, move || async move {
            if let Some(state) = weak.upgrade() {
                state.expire(&expiring);
            }
        }));

        info!(
            component = "bridge",
            event = "bridge.client.detached",
            client_id = %client_id,
            connection_id,
            grace_secs = grace.as_secs(),
            "Client detached, holding context for reconnect"
        );
    }

    /// Drop a disconnected client's context and release its locks.
    pub fn expire(&self, client_id: &str) -> bool {
        let Some((_, context)) = self
            .clients
            .remove_if(client_id, |_, context| context.connection_id.is_none())
        else {
            return false;
        };

        let released = self.manager.release_client(client_id);
        info!(
            component = "bridge",
            event = "bridge.client.expired",
            client_id = %client_id,
            cwd = ?context.current_directory,
            released_directories = released.directories.len(),
            released_sessions = released.sessions.len(),
            "Reconnect grace expired, client context dropped"
        );
        true
    }

    pub fn set_directory(&self, client_id: &str, directory: &str) {
        if let Some(mut context) = self.clients.get_mut(client_id) {
            context.current_directory = Some(directory.to_string());
        }
    }

    pub fn current_directory(&self, client_id: &str) -> Option<String> {
        self.clients
            .get(client_id)
            .and_then(|context| context.current_directory.clone())
    }

    /// Live connections whose client's current directory is `directory`.
    pub fn connections_for_directory(&self, directory: &str) -> Vec<(u64, ConnectionHandle)> {
        let connection_ids: Vec<u64> = self
            .clients
            .iter()
            .filter(|context| context.current_directory.as_deref() == Some(directory))
            .filter_map(|context| context.connection_id)
            .collect();

        connection_ids
            .into_iter()
            .filter_map(|id| {
                self.connections
                    .get(&id)
                    .map(|handle| (id, handle.value().clone()))
            })
            .collect()
    }

    /// Ask one connection's socket task to close.
    pub fn kick(&self, connection_id: u64) {
        if let Some(handle) = self.connections.get(&connection_id) {
            handle.kick.notify_one();
        }
    }

    pub fn kick_all(&self) {
        for handle in self.connections.iter() {
            handle.kick.notify_one();
        }
    }

    pub fn status(&self) -> BridgeStatus {
        BridgeStatus {
            clients: self.clients.len(),
            connections: self.connections.len(),
        }
    }
}
