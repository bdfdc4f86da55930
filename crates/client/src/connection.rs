//! One logical session against an agentbridge server.
//!
//! `connect` waits for the transport, reads the server's `hello`, re-takes
//! the directory and control lock unless the server resumed us in the same
//! directory, and resynchronizes full agent state. A background monitor
//! repeats that sequence after every reconnect. Work started for an older
//! connect cycle is discarded through the epoch counter.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use agentbridge_protocol::agent::{self, AgentResponse, RESPONSE_TYPE};
use agentbridge_protocol::{
    new_id, Channel, ClientControl, Envelope, Payload, ServerControl, SessionGroup,
    SessionTreeSnapshot, TreeFilter,
};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::events::{ClientEvent, EventQueue, ResyncSnapshot};
use crate::pending::{PendingRequests, Reply, RequestError};
use crate::transport::{Inbound, Transport, TransportError, TransportState};

const RELEASE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub directory: String,
    pub session_path: Option<String>,
    /// Identity from an earlier run, presented for resumption.
    pub client_id: Option<String>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub event_capacity: usize,
}

impl ConnectOptions {
    pub fn new(directory: impl Into<String>) -> Self {
        Self {
            directory: directory.into(),
            session_path: None,
            client_id: None,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(15),
            event_capacity: 512,
        }
    }
}

/// What the server said in its `hello`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloInfo {
    pub client_id: String,
    pub resumed: bool,
    pub cwd: Option<String>,
}

impl HelloInfo {
    /// Whether the server still has us in `directory`, so the
    /// set-directory and acquire-control round trips can be skipped.
    pub fn resumed_in(&self, directory: &str) -> bool {
        self.resumed && self.cwd.as_deref() == Some(directory)
    }
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("transport did not connect within {0:?}")]
    ConnectTimeout(Duration),

    #[error("no hello from server within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("superseded by a newer connect cycle")]
    Superseded,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Request(#[from] RequestError),
}

/// Reply type the server answers a control request with.
fn expected_reply(message: &ClientControl) -> Option<&'static str> {
    match message {
        ClientControl::SetCwd { .. } => Some("cwd_set"),
        ClientControl::AcquireControl { .. } => Some("control_acquired"),
        ClientControl::ReleaseControl { .. } => Some("control_released"),
        ClientControl::ListSessions { .. } => Some("sessions"),
        ClientControl::GetSessionTree { .. } => Some("session_tree"),
        ClientControl::NavigateTree { .. } => Some("tree_navigation_result"),
        ClientControl::Unknown => None,
    }
}

struct Inner {
    transport: Arc<dyn Transport>,
    options: ConnectOptions,
    pending: PendingRequests,
    events: Arc<EventQueue>,
    hello_tx: watch::Sender<Option<(u64, HelloInfo)>>,
    epoch: AtomicU64,
    resync_lock: tokio::sync::Mutex<()>,
    resyncs: AtomicU64,
    /// Highest transport generation someone has taken on to establish.
    claimed: AtomicU64,
    /// Set while `connect` owns setup; the monitor leaves new generations to it.
    connecting: AtomicBool,
    closed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Inner {
    fn tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn spawn<F>(&self, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks();
        tasks.retain(|task| !task.is_finished());
        tasks.push(tokio::spawn(future));
    }

    /// True for exactly one caller per generation.
    fn claim(&self, generation: u64) -> bool {
        self.claimed.fetch_max(generation, Ordering::SeqCst) < generation
    }

    fn spawn_establish(self: &Arc<Self>, generation: u64, epoch: u64) {
        let inner = self.clone();
        self.spawn(async move {
            if let Err(e) = inner.establish(generation, epoch).await {
                warn!(
                    component = "client",
                    event = "client.reestablish_failed",
                    generation,
                    error = %e,
                    "Could not re-establish after reconnect"
                );
            }
        });
    }

    fn is_current(&self, generation: u64, epoch: u64) -> bool {
        if self.closed.load(Ordering::SeqCst) || self.epoch.load(Ordering::SeqCst) != epoch {
            return false;
        }
        let state = *self.transport.state().borrow();
        state.is_connected() && state.generation == generation
    }

    async fn wait_hello(&self, generation: u64) -> Result<HelloInfo, ConnectionError> {
        let mut hello_rx = self.hello_tx.subscribe();
        let timeout = self.options.connect_timeout;
        let wait = async {
            hello_rx
                .wait_for(|hello| matches!(hello, Some((g, _)) if *g >= generation))
                .await
                .map(|hello| hello.clone())
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(Ok(hello)) => match hello {
                Some((g, info)) if g == generation => Ok(info),
                _ => Err(ConnectionError::Superseded),
            },
            Ok(Err(_)) => Err(ConnectionError::Superseded),
            Err(_) => Err(ConnectionError::HandshakeTimeout(timeout)),
        }
    }

    /// Handshake, conditional re-acquire, then resync.
    async fn establish(
        &self,
        generation: u64,
        epoch: u64,
    ) -> Result<ResyncSnapshot, ConnectionError> {
        let hello = self.wait_hello(generation).await?;
        if !self.is_current(generation, epoch) {
            return Err(ConnectionError::Superseded);
        }
        self.transport.set_client_id(&hello.client_id);

        let directory = self.options.directory.clone();
        if hello.resumed_in(&directory) {
            debug!(
                component = "client",
                event = "client.acquire.skipped",
                client_id = %hello.client_id,
                cwd = %directory,
                "Resumed in the same directory, keeping existing control"
            );
        } else {
            self.request_control(ClientControl::SetCwd {
                request_id: None,
                cwd: directory.clone(),
            })
            .await?;
            self.request_control(ClientControl::AcquireControl {
                request_id: None,
                cwd: Some(directory),
                session_path: self.options.session_path.clone(),
            })
            .await?;
        }

        self.resync(generation, epoch, &hello).await
    }

    async fn resync(
        &self,
        generation: u64,
        epoch: u64,
        hello: &HelloInfo,
    ) -> Result<ResyncSnapshot, ConnectionError> {
        let _serialized = self.resync_lock.lock().await;
        if !self.is_current(generation, epoch) {
            return Err(ConnectionError::Superseded);
        }

        let (state, messages) = tokio::try_join!(
            self.request_data(agent::command(agent::GET_STATE, &new_id())),
            self.request_data(agent::command(agent::GET_MESSAGES, &new_id())),
        )?;

        if !self.is_current(generation, epoch) {
            return Err(ConnectionError::Superseded);
        }
        let snapshot = ResyncSnapshot {
            generation,
            client_id: hello.client_id.clone(),
            resumed: hello.resumed,
            state: state.data,
            messages: messages.data,
        };
        self.resyncs.fetch_add(1, Ordering::SeqCst);
        self.events.push(ClientEvent::Resynced(snapshot.clone()));
        info!(
            component = "client",
            event = "client.resynced",
            generation,
            client_id = %hello.client_id,
            resumed = hello.resumed,
            "Resynchronized agent state"
        );
        Ok(snapshot)
    }

    async fn request(
        &self,
        id: &str,
        expected: &'static str,
        kind: &str,
        text: String,
    ) -> Result<Reply, RequestError> {
        let rx = self.pending.register(id, expected);
        if let Err(e) = self.transport.send(text) {
            self.pending.remove(id);
            return Err(match e {
                TransportError::NotConnected => RequestError::Reconnecting,
                other => RequestError::Transport(other.to_string()),
            });
        }

        let timeout = self.options.request_timeout;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RequestError::Cancelled),
            Err(_) => {
                self.pending.remove(id);
                Err(RequestError::Timeout {
                    kind: kind.to_string(),
                    after: timeout,
                })
            }
        }
    }

    async fn request_control(&self, message: ClientControl) -> Result<ServerControl, RequestError> {
        let Some(expected) = expected_reply(&message) else {
            return Err(RequestError::Protocol(
                "cannot send an unknown control message".into(),
            ));
        };
        let id = new_id();
        let message = message.with_request_id(id.clone());
        let text = Envelope::control(&message)
            .map_err(|e| RequestError::Protocol(e.to_string()))?
            .to_json();

        match self.request(&id, expected, message.kind(), text).await? {
            Reply::Control(reply) => Ok(reply),
            Reply::Data(_) => Err(RequestError::Protocol(format!(
                "agent response to {} control request",
                message.kind()
            ))),
        }
    }

    async fn request_data(&self, mut payload: Payload) -> Result<AgentResponse, RequestError> {
        let id = match agent::payload_id(&payload) {
            Some(id) => id.to_string(),
            None => {
                let id = new_id();
                payload.insert("id".into(), Value::String(id.clone()));
                id
            }
        };
        let command = agent::payload_type(&payload)
            .unwrap_or("command")
            .to_string();
        let text = Envelope::data(payload).to_json();

        match self.request(&id, RESPONSE_TYPE, &command, text).await? {
            Reply::Data(response) if response.success => Ok(response),
            Reply::Data(response) => Err(RequestError::Agent {
                command: response.command.unwrap_or(command),
                message: response
                    .error
                    .unwrap_or_else(|| "command failed".to_string()),
            }),
            Reply::Control(other) => Err(RequestError::Protocol(format!(
                "control {} reply to agent command",
                other.kind()
            ))),
        }
    }

    fn handle_frame(&self, generation: u64, text: &str) {
        let envelope = match Envelope::parse(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(
                    component = "client",
                    event = "client.frame.malformed",
                    error = %e,
                    "Ignoring malformed frame from server"
                );
                return;
            }
        };

        match envelope.channel {
            Channel::Control => match envelope.decode_payload::<ServerControl>() {
                Ok(ServerControl::Hello {
                    client_id,
                    resumed,
                    cwd,
                }) => {
                    debug!(
                        component = "client",
                        event = "client.hello",
                        generation,
                        client_id = %client_id,
                        resumed,
                        "Received hello"
                    );
                    self.hello_tx.send_replace(Some((
                        generation,
                        HelloInfo {
                            client_id,
                            resumed,
                            cwd,
                        },
                    )));
                }
                Ok(message) => {
                    let id = message.request_id().map(str::to_string);
                    if let Some(id) = id {
                        if self.pending.resolve(&id, Reply::Control(message.clone())) {
                            return;
                        }
                    }
                    self.events.push(ClientEvent::Control(message));
                }
                Err(e) => warn!(
                    component = "client",
                    event = "client.control.decode_failed",
                    error = %e,
                    "Ignoring undecodable control message"
                ),
            },
            Channel::Data => {
                if let Some(response) = AgentResponse::from_payload(&envelope.payload) {
                    if let Some(id) = response.id.clone() {
                        if self.pending.resolve(&id, Reply::Data(response)) {
                            return;
                        }
                    }
                }
                self.events.push(ClientEvent::Agent(envelope.payload));
            }
        }
    }

    fn teardown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let cancelled = self.pending.fail_all(RequestError::Cancelled);
        if cancelled > 0 {
            debug!(
                component = "client",
                event = "client.pending.cancelled",
                count = cancelled,
                "Cancelled pending requests"
            );
        }
        for task in self.tasks().drain(..) {
            task.abort();
        }
        self.events.close();
        self.transport.close();
    }
}

/// Wait until the transport is connected on a generation newer than `after`.
async fn wait_connected(
    state_rx: &mut watch::Receiver<TransportState>,
    after: u64,
    timeout: Duration,
) -> Result<TransportState, ConnectionError> {
    let wait = async {
        state_rx
            .wait_for(|s| s.is_connected() && s.generation > after)
            .await
            .map(|state| *state)
    };
    match tokio::time::timeout(timeout, wait).await {
        Ok(Ok(state)) => Ok(state),
        Ok(Err(_)) => Err(TransportError::Closed.into()),
        Err(_) => Err(ConnectionError::ConnectTimeout(timeout)),
    }
}

async fn dispatch(inner: Arc<Inner>, mut inbound: mpsc::Receiver<Inbound>) {
    while let Some(Inbound { generation, text }) = inbound.recv().await {
        inner.handle_frame(generation, &text);
    }
}

async fn monitor(
    inner: Arc<Inner>,
    epoch: u64,
    mut state_rx: watch::Receiver<TransportState>,
    mut last: TransportState,
) {
    while state_rx.changed().await.is_ok() {
        let current = *state_rx.borrow_and_update();
        if inner.epoch.load(Ordering::SeqCst) != epoch {
            break;
        }
        if current == last {
            continue;
        }
        if current.phase != last.phase {
            inner.events.push(ClientEvent::Connection(current.phase));
        }

        if !current.is_connected() || current.generation != last.generation {
            let failed = inner.pending.fail_all(RequestError::Reconnecting);
            if failed > 0 {
                info!(
                    component = "client",
                    event = "client.pending.failed_on_reconnect",
                    count = failed,
                    phase = ?current.phase,
                    "Failed pending requests on connection loss"
                );
            }
        }

        if current.is_connected()
            && current.generation != last.generation
            && !inner.connecting.load(Ordering::SeqCst)
            && inner.claim(current.generation)
        {
            inner.spawn_establish(current.generation, epoch);
        }
        last = current;
    }
}

pub struct ClientConnection {
    inner: Arc<Inner>,
}

impl ClientConnection {
    /// Connect, hand-shake, take control and resync.
    pub async fn connect(
        transport: Arc<dyn Transport>,
        options: ConnectOptions,
    ) -> Result<Self, ConnectionError> {
        let inbound = transport
            .take_inbound()
            .ok_or(TransportError::InboundTaken)?;
        if let Some(client_id) = &options.client_id {
            transport.set_client_id(client_id);
        }

        let (hello_tx, _) = watch::channel(None);
        let epoch = 1;
        let inner = Arc::new(Inner {
            events: Arc::new(EventQueue::new(options.event_capacity)),
            transport,
            options,
            pending: PendingRequests::new(),
            hello_tx,
            epoch: AtomicU64::new(epoch),
            resync_lock: tokio::sync::Mutex::new(()),
            resyncs: AtomicU64::new(0),
            claimed: AtomicU64::new(0),
            connecting: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        });
        let connection = Self {
            inner: inner.clone(),
        };
        inner.spawn(dispatch(inner.clone(), inbound));

        let mut state_rx = inner.transport.state();
        let mut state = wait_connected(&mut state_rx, 0, inner.options.connect_timeout).await?;
        inner.spawn(monitor(inner.clone(), epoch, state_rx.clone(), state));

        // A reconnect during setup supersedes the attempt; follow the
        // transport to its newest generation instead of failing.
        let result = loop {
            if !inner.claim(state.generation) {
                break Err(ConnectionError::Superseded);
            }
            match inner.establish(state.generation, epoch).await {
                Err(
                    ConnectionError::Superseded
                    | ConnectionError::Request(RequestError::Reconnecting),
                ) if !inner.closed.load(Ordering::SeqCst) => {
                    debug!(
                        component = "client",
                        event = "client.connect.retry",
                        generation = state.generation,
                        "Transport reconnected during setup, retrying"
                    );
                    state = wait_connected(
                        &mut state_rx,
                        state.generation,
                        inner.options.connect_timeout,
                    )
                    .await?;
                }
                other => break other,
            }
        };
        inner.connecting.store(false, Ordering::SeqCst);
        result?;

        // Catch a generation that arrived after the last attempt.
        let current = *state_rx.borrow();
        if current.is_connected() && inner.claim(current.generation) {
            inner.spawn_establish(current.generation, epoch);
        }
        Ok(connection)
    }

    pub fn hello(&self) -> Option<HelloInfo> {
        self.inner
            .hello_tx
            .borrow()
            .as_ref()
            .map(|(_, hello)| hello.clone())
    }

    pub fn client_id(&self) -> Option<String> {
        self.hello().map(|hello| hello.client_id)
    }

    pub fn state(&self) -> TransportState {
        *self.inner.transport.state().borrow()
    }

    pub fn events(&self) -> Arc<EventQueue> {
        self.inner.events.clone()
    }

    pub async fn next_event(&self) -> Option<ClientEvent> {
        self.inner.events.next().await
    }

    /// Completed resynchronizations so far.
    pub fn resync_count(&self) -> u64 {
        self.inner.resyncs.load(Ordering::SeqCst)
    }

    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    pub async fn request_control(
        &self,
        message: ClientControl,
    ) -> Result<ServerControl, RequestError> {
        self.inner.request_control(message).await
    }

    pub async fn request_data(&self, payload: Payload) -> Result<AgentResponse, RequestError> {
        self.inner.request_data(payload).await
    }

    pub async fn prompt(&self, message: &str) -> Result<AgentResponse, RequestError> {
        self.request_data(agent::prompt(&new_id(), message)).await
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionGroup>, RequestError> {
        match self
            .request_control(ClientControl::ListSessions { request_id: None })
            .await?
        {
            ServerControl::Sessions { groups, .. } => Ok(groups),
            other => Err(RequestError::Protocol(format!(
                "unexpected {} reply",
                other.kind()
            ))),
        }
    }

    pub async fn session_tree(
        &self,
        session_path: &str,
        filter: Option<TreeFilter>,
    ) -> Result<SessionTreeSnapshot, RequestError> {
        let request = ClientControl::GetSessionTree {
            request_id: None,
            session_path: session_path.to_string(),
            filter: filter.map(|f| f.as_str().to_string()),
        };
        match self.request_control(request).await? {
            ServerControl::SessionTree {
                root_ids,
                current_leaf_id,
                entries,
                ..
            } => Ok(SessionTreeSnapshot {
                root_ids,
                current_leaf_id,
                entries,
            }),
            other => Err(RequestError::Protocol(format!(
                "unexpected {} reply",
                other.kind()
            ))),
        }
    }

    pub async fn navigate_tree(&self, entry_id: &str) -> Result<ServerControl, RequestError> {
        self.request_control(ClientControl::NavigateTree {
            request_id: None,
            entry_id: entry_id.to_string(),
        })
        .await
    }

    /// Release control, cancel pending requests and stop background tasks.
    /// Safe to call more than once.
    pub async fn disconnect(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);

        let release = ClientControl::ReleaseControl {
            request_id: None,
            cwd: Some(self.inner.options.directory.clone()),
            session_path: self.inner.options.session_path.clone(),
        };
        match tokio::time::timeout(RELEASE_TIMEOUT, self.inner.request_control(release)).await {
            Ok(Ok(_)) => debug!(
                component = "client",
                event = "client.release.ok",
                "Released control"
            ),
            Ok(Err(e)) => debug!(
                component = "client",
                event = "client.release.failed",
                error = %e,
                "Release before disconnect failed"
            ),
            Err(_) => debug!(
                component = "client",
                event = "client.release.timeout",
                "Release before disconnect timed out"
            ),
        }

        self.inner.teardown();
        info!(
            component = "client",
            event = "client.disconnected",
            "Disconnected"
        );
    }
}

impl Drop for ClientConnection {
    fn drop(&mut self) {
        self.inner.teardown();
    }
}
