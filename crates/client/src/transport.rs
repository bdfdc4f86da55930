//! WebSocket transport with automatic reconnect.
//!
//! A transport owns the socket and exposes three things to the connection
//! layer: a watch of its [`TransportState`], a bounded queue of inbound text
//! frames tagged with the generation they arrived on, and a non-blocking
//! `send`. Each successful (re)connect bumps the generation.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransportPhase {
    #[default]
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportState {
    pub phase: TransportPhase,
    /// Number of successful connects so far.
    pub generation: u64,
}

impl TransportState {
    pub fn is_connected(&self) -> bool {
        self.phase == TransportPhase::Connected
    }
}

/// One inbound text frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    pub generation: u64,
    pub text: String,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is not connected")]
    NotConnected,

    #[error("transport is closed")]
    Closed,

    #[error("inbound stream already taken")]
    InboundTaken,

    #[error("auth token is not a valid header value")]
    InvalidToken,

    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

pub trait Transport: Send + Sync + 'static {
    fn state(&self) -> watch::Receiver<TransportState>;

    /// The inbound frame queue. Only the first caller gets it.
    fn take_inbound(&self) -> Option<mpsc::Receiver<Inbound>>;

    /// Queue a text frame for the current connection.
    fn send(&self, text: String) -> Result<(), TransportError>;

    /// Identity presented on every subsequent (re)connect.
    fn set_client_id(&self, client_id: &str);

    fn close(&self);
}

#[derive(Debug, Clone)]
pub struct WsOptions {
    pub url: String,
    pub token: Option<String>,
    /// Identity presented on the first connect.
    pub client_id: Option<String>,
    pub inbound_capacity: usize,
    /// How long the inbound queue may stay full before the socket is dropped.
    pub overflow_window: Duration,
    pub ping_interval: Duration,
    pub handshake_timeout: Duration,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
}

impl WsOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: None,
            client_id: None,
            inbound_capacity: 1024,
            overflow_window: Duration::from_secs(2),
            ping_interval: Duration::from_secs(15),
            handshake_timeout: Duration::from_secs(10),
            reconnect_base: Duration::from_millis(500),
            reconnect_max: Duration::from_secs(10),
        }
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    pub fn with_client_id(mut self, client_id: Option<String>) -> Self {
        self.client_id = client_id;
        self
    }
}

/// Delay before reconnect attempt `attempt` (1-based).
pub fn reconnect_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exponent).min(max)
}

/// URL for a connect attempt, carrying the resumable identity if known.
pub fn connect_url(base: &str, client_id: Option<&str>) -> String {
    match client_id {
        None => base.to_string(),
        Some(id) => {
            let separator = if base.contains('?') { '&' } else { '?' };
            format!("{base}{separator}clientId={}", urlencoding::encode(id))
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Resolves once `close` was called or the transport handle is gone.
async fn shutdown_requested(shutdown_rx: &mut watch::Receiver<bool>) {
    let _ = shutdown_rx.wait_for(|closed| *closed).await;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn open(
    options: &WsOptions,
    client_id: &Mutex<Option<String>>,
) -> Result<WsStream, TransportError> {
    let client_id = lock(client_id).clone();
    let url = connect_url(&options.url, client_id.as_deref());
    let mut request = url.into_client_request()?;
    if let Some(token) = &options.token {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| TransportError::InvalidToken)?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }

    let timeout = options.handshake_timeout;
    let (stream, _response) = tokio::time::timeout(timeout, connect_async(request))
        .await
        .map_err(|_| TransportError::HandshakeTimeout(timeout))??;
    Ok(stream)
}

pub struct WsTransport {
    state_tx: Arc<watch::Sender<TransportState>>,
    outbound_tx: mpsc::UnboundedSender<(u64, String)>,
    inbound_rx: Mutex<Option<mpsc::Receiver<Inbound>>>,
    client_id: Arc<Mutex<Option<String>>>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WsTransport {
    /// Start connecting in the background.
    pub fn start(options: WsOptions) -> Arc<Self> {
        let (state_tx, _) = watch::channel(TransportState::default());
        let state_tx = Arc::new(state_tx);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::channel(options.inbound_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let client_id = Arc::new(Mutex::new(options.client_id.clone()));

        let worker = Worker {
            options,
            state_tx: state_tx.clone(),
            outbound_rx,
            inbound_tx,
            client_id: client_id.clone(),
            shutdown_rx,
        };
        let task = tokio::spawn(worker.run());

        Arc::new(Self {
            state_tx,
            outbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            client_id,
            shutdown_tx,
            task: Mutex::new(Some(task)),
        })
    }
}

impl Transport for WsTransport {
    fn state(&self) -> watch::Receiver<TransportState> {
        self.state_tx.subscribe()
    }

    fn take_inbound(&self) -> Option<mpsc::Receiver<Inbound>> {
        lock(&self.inbound_rx).take()
    }

    fn send(&self, text: String) -> Result<(), TransportError> {
        let state = *self.state_tx.borrow();
        if !state.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.outbound_tx
            .send((state.generation, text))
            .map_err(|_| TransportError::Closed)
    }

    fn set_client_id(&self, client_id: &str) {
        *lock(self.client_id.as_ref()) = Some(client_id.to_string());
    }

    fn close(&self) {
        self.shutdown_tx.send_replace(true);
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
    }
}

#[derive(Debug)]
enum SessionEnd {
    Shutdown,
    ClosedByPeer,
    Stale,
    Overflow,
    Error(String),
}

struct Worker {
    options: WsOptions,
    state_tx: Arc<watch::Sender<TransportState>>,
    outbound_rx: mpsc::UnboundedReceiver<(u64, String)>,
    inbound_tx: mpsc::Sender<Inbound>,
    client_id: Arc<Mutex<Option<String>>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Worker {
    fn set_state(&self, phase: TransportPhase, generation: u64) {
        self.state_tx
            .send_replace(TransportState { phase, generation });
    }

    async fn run(mut self) {
        let mut attempt: u32 = 0;
        let mut generation: u64 = 0;

        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }
            let phase = if generation == 0 {
                TransportPhase::Connecting
            } else {
                TransportPhase::Reconnecting
            };
            self.set_state(phase, generation);

            let opened = tokio::select! {
                _ = shutdown_requested(&mut self.shutdown_rx) => break,
                opened = open(&self.options, self.client_id.as_ref()) => opened,
            };
            match opened {
                Ok(stream) => {
                    attempt = 0;
                    generation += 1;
                    self.set_state(TransportPhase::Connected, generation);
                    info!(
                        component = "transport",
                        event = "transport.connected",
                        generation,
                        "WebSocket connected"
                    );
                    let end = self.pump(stream, generation).await;
                    match end {
                        SessionEnd::Shutdown => break,
                        SessionEnd::ClosedByPeer => info!(
                            component = "transport",
                            event = "transport.closed_by_peer",
                            generation,
                            "Server closed the connection"
                        ),
                        other => warn!(
                            component = "transport",
                            event = "transport.session_ended",
                            generation,
                            reason = ?other,
                            "Connection lost"
                        ),
                    }
                }
                Err(e) => {
                    warn!(
                        component = "transport",
                        event = "transport.connect_failed",
                        attempt = attempt + 1,
                        error = %e,
                        "Connect attempt failed"
                    );
                }
            }

            attempt = attempt.saturating_add(1);
            if generation > 0 {
                self.set_state(TransportPhase::Reconnecting, generation);
            }
            let delay = reconnect_delay(
                attempt,
                self.options.reconnect_base,
                self.options.reconnect_max,
            );
            debug!(
                component = "transport",
                event = "transport.reconnect_scheduled",
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Reconnecting after delay"
            );
            tokio::select! {
                _ = shutdown_requested(&mut self.shutdown_rx) => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.set_state(TransportPhase::Disconnected, generation);
        info!(
            component = "transport",
            event = "transport.stopped",
            "Transport stopped"
        );
    }

    async fn pump(&mut self, stream: WsStream, generation: u64) -> SessionEnd {
        let (mut sink, mut source) = stream.split();
        let mut ping = tokio::time::interval(self.options.ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ping.tick().await;
        let mut last_seen = Instant::now();

        let end = loop {
            tokio::select! {
                _ = shutdown_requested(&mut self.shutdown_rx) => break SessionEnd::Shutdown,

                outbound = self.outbound_rx.recv() => {
                    let Some((frame_generation, text)) = outbound else {
                        break SessionEnd::Shutdown;
                    };
                    if frame_generation != generation {
                        debug!(
                            component = "transport",
                            event = "transport.send.stale_dropped",
                            frame_generation,
                            generation,
                            "Dropped frame queued for a previous connection"
                        );
                        continue;
                    }
                    if let Err(e) = sink.send(Message::Text(text.into())).await {
                        break SessionEnd::Error(e.to_string());
                    }
                }

                incoming = source.next() => {
                    let message = match incoming {
                        Some(Ok(message)) => message,
                        Some(Err(e)) => break SessionEnd::Error(e.to_string()),
                        None => break SessionEnd::ClosedByPeer,
                    };
                    last_seen = Instant::now();
                    match message {
                        Message::Text(text) => {
                            let inbound = Inbound { generation, text: text.as_str().to_string() };
                            if let Some(end) = self.deliver(inbound).await {
                                break end;
                            }
                        }
                        Message::Close(_) => break SessionEnd::ClosedByPeer,
                        _ => {}
                    }
                }

                _ = ping.tick() => {
                    if last_seen.elapsed() > self.options.ping_interval * 3 {
                        break SessionEnd::Stale;
                    }
                    if let Err(e) = sink.send(Message::Ping(Default::default())).await {
                        break SessionEnd::Error(e.to_string());
                    }
                }
            }
        };

        let _ = sink.close().await;
        end
    }

    /// Hand a frame to the consumer, waiting at most the overflow window
    /// while the queue is full.
    async fn deliver(&self, inbound: Inbound) -> Option<SessionEnd> {
        let inbound = match self.inbound_tx.try_send(inbound) {
            Ok(()) => return None,
            Err(mpsc::error::TrySendError::Closed(_)) => return Some(SessionEnd::Shutdown),
            Err(mpsc::error::TrySendError::Full(inbound)) => inbound,
        };
        let window = self.options.overflow_window;
        match tokio::time::timeout(window, self.inbound_tx.send(inbound)).await {
            Ok(Ok(())) => None,
            Ok(Err(_)) => Some(SessionEnd::Shutdown),
            Err(_) => {
                warn!(
                    component = "transport",
                    event = "transport.inbound.overflow",
                    window_ms = window.as_millis() as u64,
                    "Inbound queue stayed full, forcing reconnect"
                );
                Some(SessionEnd::Overflow)
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod memory {
    //! In-process transport driven directly by tests.

    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    pub struct MemoryTransport {
        state_tx: watch::Sender<TransportState>,
        inbound_tx: mpsc::Sender<Inbound>,
        inbound_rx: Mutex<Option<mpsc::Receiver<Inbound>>>,
        sent_tx: mpsc::UnboundedSender<String>,
        client_ids: Mutex<Vec<String>>,
        closed: AtomicBool,
    }

    impl MemoryTransport {
        pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
            let (state_tx, _) = watch::channel(TransportState::default());
            let (inbound_tx, inbound_rx) = mpsc::channel(64);
            let (sent_tx, sent_rx) = mpsc::unbounded_channel();
            let transport = Arc::new(Self {
                state_tx,
                inbound_tx,
                inbound_rx: Mutex::new(Some(inbound_rx)),
                sent_tx,
                client_ids: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            });
            (transport, sent_rx)
        }

        /// Simulate a successful (re)connect; returns the new generation.
        pub fn connect(&self) -> u64 {
            let generation = self.state_tx.borrow().generation + 1;
            self.state_tx.send_replace(TransportState {
                phase: TransportPhase::Connected,
                generation,
            });
            generation
        }

        pub fn drop_connection(&self) {
            let generation = self.state_tx.borrow().generation;
            self.state_tx.send_replace(TransportState {
                phase: TransportPhase::Reconnecting,
                generation,
            });
        }

        /// Re-publish the current state without changing it.
        pub fn touch(&self) {
            let state = *self.state_tx.borrow();
            self.state_tx.send_replace(state);
        }

        pub fn generation(&self) -> u64 {
            self.state_tx.borrow().generation
        }

        pub async fn deliver(&self, text: String) {
            let generation = self.generation();
            let _ = self.inbound_tx.send(Inbound { generation, text }).await;
        }

        pub fn client_ids(&self) -> Vec<String> {
            lock(&self.client_ids).clone()
        }

        pub fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    impl Transport for MemoryTransport {
        fn state(&self) -> watch::Receiver<TransportState> {
            self.state_tx.subscribe()
        }

        fn take_inbound(&self) -> Option<mpsc::Receiver<Inbound>> {
            lock(&self.inbound_rx).take()
        }

        fn send(&self, text: String) -> Result<(), TransportError> {
            if !self.state_tx.borrow().is_connected() {
                return Err(TransportError::NotConnected);
            }
            self.sent_tx.send(text).map_err(|_| TransportError::Closed)
        }

        fn set_client_id(&self, client_id: &str) {
            lock(&self.client_ids).push(client_id.to_string());
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
            let generation = self.generation();
            self.state_tx.send_replace(TransportState {
                phase: TransportPhase::Disconnected,
                generation,
            });
        }
    }
}
