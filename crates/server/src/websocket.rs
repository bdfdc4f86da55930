//! WebSocket handling
//!
//! Every frame is an [`Envelope`]. Control payloads drive the connection's
//! context (directory, control lock, session browsing); data payloads are
//! forwarded verbatim to the directory's agent. Agent output fans out to
//! every connection whose client currently has that directory set.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    middleware,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use agentbridge_protocol::agent::{self, payload_id};
use agentbridge_protocol::{
    new_id, AgentStatusKind, Channel, ClientControl, Envelope, ErrorCode, Payload, ServerControl,
    TreeFilter,
};

use crate::auth::auth_middleware;
use crate::control_lock::ControlRequest;
use crate::forwarder::{ForwarderEvent, Lifecycle};
use crate::session_catalog::apply_filter;
use crate::state::{BridgeState, ConnectionHandle};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Messages that can be sent through the WebSocket
pub enum OutboundMessage {
    /// Control payload, wrapped in an envelope on send
    Control(ServerControl),
    /// Pre-serialized envelope (fan-out serializes once for all receivers)
    Raw(String),
    Pong(Bytes),
}

/// One live socket, as seen by the message handlers.
pub struct Connection {
    pub id: u64,
    pub client_id: String,
    outbound: mpsc::Sender<OutboundMessage>,
}

impl Connection {
    pub fn new(id: u64, client_id: impl Into<String>, outbound: mpsc::Sender<OutboundMessage>) -> Self {
        Self {
            id,
            client_id: client_id.into(),
            outbound,
        }
    }

    async fn reply(&self, message: ServerControl) {
        if self
            .outbound
            .send(OutboundMessage::Control(message))
            .await
            .is_err()
        {
            debug!(
                component = "websocket",
                event = "ws.reply.dropped",
                connection_id = self.id,
                "Connection closed before reply was queued"
            );
        }
    }

    async fn reject(&self, request_id: Option<&str>, code: ErrorCode, message: impl Into<String>) {
        let message = message.into();
        debug!(
            component = "websocket",
            event = "ws.request.rejected",
            connection_id = self.id,
            client_id = %self.client_id,
            code = %code,
            message = %message,
            "Rejected client request"
        );
        self.reply(ServerControl::error(request_id, code, message))
            .await;
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct WsParams {
    #[serde(rename = "clientId")]
    pub client_id: Option<String>,
}

/// `/ws` and `/health`, behind the bearer token when one is configured.
pub fn router(state: Arc<BridgeState>, auth_token: Option<String>) -> Router {
    let mut app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    if let Some(token) = auth_token {
        app = app.layer(middleware::from_fn_with_state(token, auth_middleware));
    }

    app.layer(TraceLayer::new_for_http()).layer(
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
    )
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<Arc<BridgeState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, params.client_id))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: &'static str,
    pub processes: usize,
    pub running: usize,
    pub pending_writes: usize,
    pub directory_locks: usize,
    pub session_locks: usize,
    pub clients: usize,
    pub connections: usize,
}

pub async fn health_handler(State(state): State<Arc<BridgeState>>) -> Json<HealthReport> {
    let manager = state.manager.status();
    let bridge = state.status();
    Json(HealthReport {
        status: "ok",
        processes: manager.processes,
        running: manager.running,
        pending_writes: manager.pending_writes,
        directory_locks: manager.directory_locks,
        session_locks: manager.session_locks,
        clients: bridge.clients,
        connections: bridge.connections,
    })
}

/// Handle a WebSocket connection
async fn handle_socket(socket: WebSocket, state: Arc<BridgeState>, requested_id: Option<String>) {
    let conn_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
    info!(
        component = "websocket",
        event = "ws.connection.opened",
        connection_id = conn_id,
        requested_client_id = ?requested_id,
        "WebSocket connection opened"
    );

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (outbound_tx, mut outbound_rx) =
        mpsc::channel::<OutboundMessage>(state.config.outbound_buffer.max(1));

    let send_task = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            let frame = match msg {
                OutboundMessage::Control(control) => match Envelope::control(&control) {
                    Ok(envelope) => Message::Text(envelope.to_json().into()),
                    Err(e) => {
                        error!(
                            component = "websocket",
                            event = "ws.send.serialize_failed",
                            connection_id = conn_id,
                            error = %e,
                            "Failed to serialize control message"
                        );
                        continue;
                    }
                },
                OutboundMessage::Raw(json) => Message::Text(json.into()),
                OutboundMessage::Pong(data) => Message::Pong(data),
            };

            if ws_tx.send(frame).await.is_err() {
                debug!(
                    component = "websocket",
                    event = "ws.send.disconnected",
                    connection_id = conn_id,
                    "WebSocket send failed, client disconnected"
                );
                break;
            }
        }
    });

    let attached = state.attach(requested_id.as_deref(), conn_id);
    let conn = Connection::new(conn_id, attached.client_id.clone(), outbound_tx.clone());

    // Hello is queued before the connection becomes visible to fan-out.
    conn.reply(ServerControl::Hello {
        client_id: attached.client_id.clone(),
        resumed: attached.resumed,
        cwd: attached.cwd.clone(),
    })
    .await;

    let kick = Arc::new(Notify::new());
    state.register(
        conn_id,
        ConnectionHandle {
            client_id: attached.client_id.clone(),
            outbound: outbound_tx,
            kick: kick.clone(),
        },
    );

    loop {
        let next = tokio::select! {
            _ = kick.notified() => {
                info!(
                    component = "websocket",
                    event = "ws.connection.kicked",
                    connection_id = conn_id,
                    client_id = %conn.client_id,
                    "Closing connection (superseded, slow consumer or shutdown)"
                );
                break;
            }
            next = ws_rx.next() => next,
        };

        let Some(result) = next else {
            break;
        };

        match result {
            Ok(Message::Text(text)) => handle_text(&state, &conn, text.as_str()).await,
            Ok(Message::Binary(_)) => {
                conn.reject(None, ErrorCode::MalformedEnvelope, "binary frames are not supported")
                    .await;
            }
            Ok(Message::Ping(data)) => {
                let _ = conn.outbound.try_send(OutboundMessage::Pong(data));
            }
            Ok(Message::Close(_)) => {
                info!(
                    component = "websocket",
                    event = "ws.connection.close_frame",
                    connection_id = conn_id,
                    "Client sent close frame"
                );
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!(
                    component = "websocket",
                    event = "ws.connection.error",
                    connection_id = conn_id,
                    error = %e,
                    "WebSocket error"
                );
                break;
            }
        }
    }

    state.detach(&conn.client_id, conn_id);
    send_task.abort();
    info!(
        component = "websocket",
        event = "ws.connection.closed",
        connection_id = conn_id,
        client_id = %conn.client_id,
        "WebSocket connection closed"
    );
}

/// Decode one text frame and dispatch it by channel.
pub async fn handle_text(state: &Arc<BridgeState>, conn: &Connection, text: &str) {
    match Envelope::parse(text) {
        Ok(Envelope {
            channel: Channel::Control,
            payload,
        }) => handle_control_message(state, conn, payload).await,
        Ok(Envelope {
            channel: Channel::Data,
            payload,
        }) => handle_data_message(state, conn, payload).await,
        Err(e) => {
            warn!(
                component = "websocket",
                event = "ws.message.parse_failed",
                connection_id = conn.id,
                error = %e,
                payload_bytes = text.len(),
                payload_preview = %truncate_for_log(text, 240),
                "Failed to parse client envelope"
            );
            conn.reject(None, ErrorCode::MalformedEnvelope, e.to_string())
                .await;
        }
    }
}

pub async fn handle_control_message(state: &Arc<BridgeState>, conn: &Connection, payload: Payload) {
    let hinted_request_id = payload
        .get("requestId")
        .and_then(Value::as_str)
        .map(str::to_string);
    let raw_type = payload
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();

    let message: ClientControl = match serde_json::from_value(Value::Object(payload)) {
        Ok(message) => message,
        Err(e) => {
            conn.reject(
                hinted_request_id.as_deref(),
                ErrorCode::MalformedEnvelope,
                format!("invalid control payload: {e}"),
            )
            .await;
            return;
        }
    };

    debug!(
        component = "websocket",
        event = "ws.control.received",
        connection_id = conn.id,
        client_id = %conn.client_id,
        kind = message.kind(),
        "Control message"
    );

    match message {
        ClientControl::SetCwd { request_id, cwd } => {
            match validate_directory(&cwd).await {
                Ok(cwd) => {
                    state.set_directory(&conn.client_id, &cwd);
                    conn.reply(ServerControl::CwdSet { request_id, cwd }).await;
                }
                Err(reason) => {
                    conn.reject(request_id.as_deref(), ErrorCode::InvalidCwd, reason)
                        .await
                }
            }
        }

        ClientControl::AcquireControl {
            request_id,
            cwd,
            session_path,
        } => {
            let rid = request_id.as_deref();
            let directory = match cwd {
                Some(cwd) => match validate_directory(&cwd).await {
                    Ok(cwd) => cwd,
                    Err(reason) => {
                        conn.reject(rid, ErrorCode::InvalidCwd, reason).await;
                        return;
                    }
                },
                None => match state.current_directory(&conn.client_id) {
                    Some(directory) => directory,
                    None => {
                        conn.reject(
                            rid,
                            ErrorCode::MissingCwdContext,
                            "acquire_control needs a cwd; send set_cwd first or include cwd",
                        )
                        .await;
                        return;
                    }
                },
            };
            let session_path = match session_path.as_deref().map(validate_session_path) {
                None => None,
                Some(Ok(path)) => Some(path),
                Some(Err(reason)) => {
                    conn.reject(rid, ErrorCode::InvalidSessionPath, reason).await;
                    return;
                }
            };

            let request = ControlRequest {
                client_id: conn.client_id.clone(),
                directory: directory.clone(),
                session_path: session_path.clone(),
            };
            match state.manager.acquire_control(&request) {
                Ok(()) => {
                    state.set_directory(&conn.client_id, &directory);
                    state.manager.get_or_start(&directory);
                    conn.reply(ServerControl::ControlAcquired {
                        request_id,
                        cwd: directory,
                        session_path,
                    })
                    .await;
                }
                Err(conflict) => {
                    conn.reject(rid, ErrorCode::ControlLockDenied, conflict.to_string())
                        .await
                }
            }
        }

        ClientControl::ReleaseControl {
            request_id,
            cwd,
            session_path,
        } => {
            let directory = cwd
                .map(|cwd| cwd.trim().to_string())
                .or_else(|| state.current_directory(&conn.client_id));
            match (&directory, &session_path) {
                (Some(directory), _) => {
                    state
                        .manager
                        .release_control(&conn.client_id, directory, session_path.as_deref());
                }
                (None, Some(session_path)) => {
                    state
                        .manager
                        .release_control(&conn.client_id, "", Some(session_path));
                }
                (None, None) => {}
            }
            conn.reply(ServerControl::ControlReleased {
                request_id,
                cwd: directory,
                session_path,
            })
            .await;
        }

        ClientControl::ListSessions { request_id } => {
            let catalog = state.catalog.clone();
            match tokio::task::spawn_blocking(move || catalog.list_sessions()).await {
                Ok(Ok(groups)) => {
                    conn.reply(ServerControl::Sessions { request_id, groups })
                        .await
                }
                Ok(Err(e)) => conn.reject(request_id.as_deref(), e.code(), e.to_string()).await,
                Err(e) => {
                    error!(
                        component = "websocket",
                        event = "ws.catalog.join_failed",
                        error = %e,
                        "Session listing task failed"
                    );
                    conn.reject(
                        request_id.as_deref(),
                        ErrorCode::InternalError,
                        "session listing failed",
                    )
                    .await;
                }
            }
        }

        ClientControl::GetSessionTree {
            request_id,
            session_path,
            filter,
        } => {
            let rid = request_id.as_deref();
            let filter = match filter.as_deref().map(str::parse::<TreeFilter>) {
                None => TreeFilter::Default,
                Some(Ok(filter)) => filter,
                Some(Err(e)) => {
                    conn.reject(rid, ErrorCode::InvalidTreeFilter, e.to_string())
                        .await;
                    return;
                }
            };
            let session_path = match validate_session_path(&session_path) {
                Ok(path) => path,
                Err(reason) => {
                    conn.reject(rid, ErrorCode::InvalidSessionPath, reason).await;
                    return;
                }
            };

            let catalog = state.catalog.clone();
            let path = session_path.clone();
            let loaded =
                tokio::task::spawn_blocking(move || catalog.load_tree(Path::new(&path))).await;
            match loaded {
                Ok(Ok(snapshot)) => {
                    let tree = apply_filter(snapshot, filter);
                    conn.reply(ServerControl::SessionTree {
                        request_id,
                        session_path,
                        root_ids: tree.root_ids,
                        current_leaf_id: tree.current_leaf_id,
                        entries: tree.entries,
                    })
                    .await;
                }
                Ok(Err(e)) => conn.reject(rid, e.code(), e.to_string()).await,
                Err(e) => {
                    error!(
                        component = "websocket",
                        event = "ws.catalog.join_failed",
                        error = %e,
                        "Session tree task failed"
                    );
                    conn.reject(rid, ErrorCode::InternalError, "session tree load failed")
                        .await;
                }
            }
        }

        ClientControl::NavigateTree {
            request_id,
            entry_id,
        } => {
            let rid = request_id.as_deref();
            let Some(directory) = state.current_directory(&conn.client_id) else {
                conn.reject(rid, ErrorCode::MissingCwdContext, "navigate_tree needs a cwd")
                    .await;
                return;
            };
            if !state.manager.has_control(&conn.client_id, &directory) {
                conn.reject(
                    rid,
                    ErrorCode::ControlLockRequired,
                    format!("acquire control of {directory} before navigating"),
                )
                .await;
                return;
            }

            // The agent may take a while; keep reading frames meanwhile.
            let state = state.clone();
            let outbound = conn.outbound.clone();
            let connection = Connection::new(conn.id, conn.client_id.clone(), outbound);
            tokio::spawn(async move {
                let reply = match navigate_tree(&state, &directory, &entry_id).await {
                    Ok(outcome) => ServerControl::TreeNavigationResult {
                        request_id,
                        cancelled: outcome.cancelled,
                        editor_text: outcome.editor_text,
                        current_leaf_id: outcome.current_leaf_id,
                        session_path: outcome.session_path,
                    },
                    Err(reason) => ServerControl::error(
                        request_id.as_deref(),
                        ErrorCode::TreeNavigationFailed,
                        reason,
                    ),
                };
                connection.reply(reply).await;
            });
        }

        ClientControl::Unknown => {
            conn.reject(
                hinted_request_id.as_deref(),
                ErrorCode::UnsupportedControlType,
                format!("unsupported control type `{raw_type}`"),
            )
            .await;
        }
    }
}

/// Forward a data payload to the agent of the client's directory.
pub async fn handle_data_message(state: &Arc<BridgeState>, conn: &Connection, payload: Payload) {
    let request_id = payload_id(&payload).map(str::to_string);
    let rid = request_id.as_deref();

    let Some(directory) = state.current_directory(&conn.client_id) else {
        conn.reject(
            rid,
            ErrorCode::MissingCwdContext,
            "set a cwd before sending agent commands",
        )
        .await;
        return;
    };
    if !state.manager.has_control(&conn.client_id, &directory) {
        conn.reject(
            rid,
            ErrorCode::ControlLockRequired,
            format!("acquire control of {directory} before sending agent commands"),
        )
        .await;
        return;
    }

    if let Err(e) = state.manager.send_to(&directory, payload).await {
        warn!(
            component = "websocket",
            event = "ws.data.forward_failed",
            connection_id = conn.id,
            cwd = %directory,
            error = %e,
            "Failed to forward agent command"
        );
        conn.reject(rid, ErrorCode::RpcForwardFailed, e.to_string())
            .await;
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NavigateOutcome {
    #[serde(default)]
    cancelled: bool,
    editor_text: Option<String>,
    current_leaf_id: Option<String>,
    session_path: Option<String>,
}

async fn navigate_tree(
    state: &BridgeState,
    directory: &str,
    entry_id: &str,
) -> Result<NavigateOutcome, String> {
    let command = agent::navigate_tree(&new_id(), entry_id);
    let response = state
        .manager
        .request(directory, command, state.config.navigate_timeout)
        .await
        .map_err(|e| e.to_string())?;

    if !response.success {
        return Err(response
            .error
            .unwrap_or_else(|| "agent rejected navigation".to_string()));
    }
    match response.data {
        Some(data) => serde_json::from_value(data)
            .map_err(|e| format!("unexpected navigate_tree result: {e}")),
        None => Ok(NavigateOutcome::default()),
    }
}

/// Route agent output to connections.
pub fn spawn_event_router(
    state: Arc<BridgeState>,
    mut events: mpsc::Receiver<ForwarderEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let (directory, frame) = match event {
                ForwarderEvent::Message { key, payload } => {
                    (key, Envelope::data(payload).to_json())
                }
                ForwarderEvent::Lifecycle { key, lifecycle } => {
                    let status = agent_status(&key, &lifecycle);
                    match Envelope::control(&status) {
                        Ok(envelope) => (key, envelope.to_json()),
                        Err(e) => {
                            error!(
                                component = "websocket",
                                event = "ws.fanout.serialize_failed",
                                error = %e,
                                "Failed to serialize agent status"
                            );
                            continue;
                        }
                    }
                }
            };
            fan_out(&state, &directory, frame);
        }
        debug!(
            component = "websocket",
            event = "ws.fanout.ended",
            "Agent event stream closed"
        );
    })
}

fn agent_status(directory: &str, lifecycle: &Lifecycle) -> ServerControl {
    match lifecycle {
        Lifecycle::Started { pid } => ServerControl::AgentStatus {
            cwd: directory.to_string(),
            status: AgentStatusKind::Started,
            pid: *pid,
            code: None,
        },
        Lifecycle::Exited { code, .. } => ServerControl::AgentStatus {
            cwd: directory.to_string(),
            status: AgentStatusKind::Exited,
            pid: None,
            code: *code,
        },
    }
}

/// Queue `frame` for every connection in `directory`. A connection whose
/// queue is full is closed; the client's reconnect restores its state.
pub fn fan_out(state: &BridgeState, directory: &str, frame: String) -> usize {
    let mut delivered = 0;
    for (connection_id, handle) in state.connections_for_directory(directory) {
        match handle
            .outbound
            .try_send(OutboundMessage::Raw(frame.clone()))
        {
            Ok(()) => delivered += 1,
            Err(TrySendError::Full(_)) => {
                warn!(
                    component = "websocket",
                    event = "ws.fanout.queue_full",
                    connection_id,
                    client_id = %handle.client_id,
                    cwd = %directory,
                    "Outbound queue full, closing slow connection"
                );
                state.kick(connection_id);
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }
    delivered
}

async fn validate_directory(raw: &str) -> Result<String, String> {
    let cwd = raw.trim();
    if cwd.is_empty() {
        return Err("cwd must not be empty".to_string());
    }
    if !Path::new(cwd).is_absolute() {
        return Err(format!("cwd must be an absolute path: {cwd}"));
    }
    match tokio::fs::metadata(cwd).await {
        Ok(meta) if meta.is_dir() => Ok(cwd.to_string()),
        Ok(_) => Err(format!("cwd is not a directory: {cwd}")),
        Err(e) => Err(format!("cwd is not accessible: {cwd}: {e}")),
    }
}

fn validate_session_path(raw: &str) -> Result<String, String> {
    let path = raw.trim();
    if path.is_empty() {
        return Err("sessionPath must not be empty".to_string());
    }
    if !Path::new(path).is_absolute() {
        return Err(format!("sessionPath must be an absolute path: {path}"));
    }
    Ok(path.to_string())
}

fn truncate_for_log(value: &str, max_chars: usize) -> String {
    let mut chars = value.chars();
    let preview: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{preview}…")
    } else {
        preview
    }
}
