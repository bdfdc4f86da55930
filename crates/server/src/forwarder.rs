//! Subprocess forwarder: owns one agent process for one working directory.
//!
//! The forwarder is an actor: a [`Forwarder`] handle sends commands over an
//! mpsc channel to a task that exclusively owns the child process. Agent
//! output is published as [`ForwarderEvent`]s on a channel the owner drains.
//!
//! The agent speaks newline-delimited JSON on stdin/stdout. Lines that are not
//! JSON objects are logged and dropped; stderr is logged and never parsed.

use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agentbridge_protocol::Payload;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::scheduler::ScheduledTask;

/// Program and arguments used to launch an agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl Default for AgentCommand {
    fn default() -> Self {
        Self {
            program: "pi".to_string(),
            args: vec!["--mode".to_string(), "rpc".to_string()],
        }
    }
}

#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    pub command: AgentCommand,
    pub restart_base: Duration,
    pub restart_max: Duration,
    /// How long `stop` waits after closing stdin before killing the child.
    pub stop_grace: Duration,
    /// Queued stdin lines above which a backlog warning is logged.
    pub write_backlog_warn: usize,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            command: AgentCommand::default(),
            restart_base: Duration::from_millis(250),
            restart_max: Duration::from_millis(5000),
            stop_grace: Duration::from_millis(3000),
            write_backlog_warn: 256,
        }
    }
}

#[derive(Debug, Error)]
pub enum ForwarderError {
    #[error("failed to spawn agent in {directory}: {source}")]
    Spawn {
        directory: String,
        #[source]
        source: io::Error,
    },

    #[error("agent process is not running")]
    NotRunning,

    #[error("forwarder has been stopped")]
    Stopped,

    #[error("failed to encode payload: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lifecycle {
    Started { pid: Option<u32> },
    Exited { code: Option<i32>, expected: bool },
}

#[derive(Debug, Clone)]
pub enum ForwarderEvent {
    Message { key: String, payload: Payload },
    Lifecycle { key: String, lifecycle: Lifecycle },
}

/// Delay before restart number `attempt` (1-based): `min(base * 2^(attempt-1), max)`.
pub fn restart_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    base.saturating_mul(1u32 << exponent).min(max)
}

#[derive(Debug, Default)]
struct ForwarderStats {
    running: AtomicBool,
    pid: AtomicU32,
    pending_writes: AtomicUsize,
    restart_attempt: AtomicU32,
}

impl ForwarderStats {
    fn writes_drained(&self, count: usize) {
        let _ = self
            .pending_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                Some(n.saturating_sub(count))
            });
    }
}

enum ForwarderCommand {
    Start,
    Send {
        payload: Payload,
        reply: oneshot::Sender<Result<(), ForwarderError>>,
    },
    Restart,
    Stop {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a forwarder actor (cheap to Clone).
#[derive(Clone)]
pub struct Forwarder {
    key: String,
    command_tx: mpsc::Sender<ForwarderCommand>,
    stats: Arc<ForwarderStats>,
}

impl std::fmt::Debug for Forwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Forwarder")
            .field("key", &self.key)
            .field("running", &self.is_running())
            .field("pid", &self.pid())
            .finish()
    }
}

impl Forwarder {
    /// Spawn the actor for `key`. No process is launched until the first
    /// `ensure_started` or `send`.
    pub fn spawn(
        key: impl Into<String>,
        config: Arc<ForwarderConfig>,
        events: mpsc::Sender<ForwarderEvent>,
    ) -> Self {
        let key = key.into();
        let (command_tx, command_rx) = mpsc::channel(256);
        let stats = Arc::new(ForwarderStats::default());

        let actor = ForwarderActor {
            key: key.clone(),
            config,
            events,
            stats: stats.clone(),
            command_tx: command_tx.downgrade(),
            agent: None,
            wanted: false,
            attempt: 0,
            restart: None,
        };
        tokio::spawn(actor.run(command_rx));

        Self {
            key,
            command_tx,
            stats,
        }
    }

    /// Launch the process if it is not already running (fire-and-forget).
    pub fn ensure_started(&self) {
        if self.command_tx.try_send(ForwarderCommand::Start).is_err() {
            debug!(
                component = "forwarder",
                event = "forwarder.start.skipped",
                key = %self.key,
                "Start request not queued, actor busy or stopped"
            );
        }
    }

    /// Write one payload to the agent, starting it first if needed.
    pub async fn send(&self, payload: Payload) -> Result<(), ForwarderError> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(ForwarderCommand::Send { payload, reply })
            .await
            .map_err(|_| ForwarderError::Stopped)?;
        rx.await.map_err(|_| ForwarderError::Stopped)?
    }

    /// Stop the agent and the actor. Safe to call more than once.
    pub async fn stop(&self) {
        let (reply, rx) = oneshot::channel();
        if self
            .command_tx
            .send(ForwarderCommand::Stop { reply })
            .await
            .is_err()
        {
            return;
        }
        let _ = rx.await;
    }

    pub fn is_running(&self) -> bool {
        self.stats.running.load(Ordering::SeqCst)
    }

    pub fn pid(&self) -> Option<u32> {
        match self.stats.pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// Lines queued for stdin that the writer has not flushed yet.
    pub fn pending_writes(&self) -> usize {
        self.stats.pending_writes.load(Ordering::SeqCst)
    }

    /// Consecutive failed starts/unexpected exits since the last good start.
    #[cfg(test)]
    pub fn restart_attempt(&self) -> u32 {
        self.stats.restart_attempt.load(Ordering::SeqCst)
    }
}

struct RunningAgent {
    child: Child,
    stdin_tx: Option<mpsc::UnboundedSender<String>>,
}

struct ForwarderActor {
    key: String,
    config: Arc<ForwarderConfig>,
    events: mpsc::Sender<ForwarderEvent>,
    stats: Arc<ForwarderStats>,
    command_tx: mpsc::WeakSender<ForwarderCommand>,
    agent: Option<RunningAgent>,
    /// Whether the process should be kept alive (false once stopped).
    wanted: bool,
    attempt: u32,
    restart: Option<ScheduledTask>,
}

enum Step {
    Command(Option<ForwarderCommand>),
    Exited(io::Result<ExitStatus>),
}

async fn wait_for_exit(agent: Option<&mut RunningAgent>) -> io::Result<ExitStatus> {
    match agent {
        Some(agent) => agent.child.wait().await,
        None => std::future::pending().await,
    }
}

impl ForwarderActor {
    async fn run(mut self, mut command_rx: mpsc::Receiver<ForwarderCommand>) {
        loop {
            let step = tokio::select! {
                command = command_rx.recv() => Step::Command(command),
                status = wait_for_exit(self.agent.as_mut()) => Step::Exited(status),
            };

            match step {
                Step::Command(Some(ForwarderCommand::Start)) => {
                    self.wanted = true;
                    let _ = self.start().await;
                }
                Step::Command(Some(ForwarderCommand::Send { payload, reply })) => {
                    let result = self.send(payload).await;
                    let _ = reply.send(result);
                }
                Step::Command(Some(ForwarderCommand::Restart)) => {
                    self.restart = None;
                    if self.wanted && self.agent.is_none() {
                        let _ = self.start().await;
                    }
                }
                Step::Command(Some(ForwarderCommand::Stop { reply })) => {
                    self.stop().await;
                    let _ = reply.send(());
                    break;
                }
                Step::Command(None) => {
                    self.stop().await;
                    break;
                }
                Step::Exited(status) => self.on_exit(status).await,
            }
        }

        debug!(
            component = "forwarder",
            event = "forwarder.actor.ended",
            key = %self.key,
            "Forwarder actor ended"
        );
    }

    async fn start(&mut self) -> Result<(), ForwarderError> {
        if self.agent.is_some() {
            return Ok(());
        }
        self.restart = None;

        let command = &self.config.command;
        info!(
            component = "forwarder",
            event = "forwarder.spawn",
            key = %self.key,
            program = %command.program,
            attempt = self.attempt,
            "Spawning agent process"
        );

        let spawned = Command::new(&command.program)
            .args(&command.args)
            .current_dir(&self.key)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(source) => {
                error!(
                    component = "forwarder",
                    event = "forwarder.spawn_failed",
                    key = %self.key,
                    program = %command.program,
                    error = %source,
                    "Failed to spawn agent process"
                );
                if self.wanted {
                    self.schedule_restart();
                }
                return Err(ForwarderError::Spawn {
                    directory: self.key.clone(),
                    source,
                });
            }
        };

        let pid = child.id();
        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel::<String>();

        if let Some(stdin) = child.stdin.take() {
            tokio::spawn(stdin_writer(
                self.key.clone(),
                stdin,
                stdin_rx,
                self.stats.clone(),
            ));
        }
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(stdout_reader(self.key.clone(), stdout, self.events.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(stderr_logger(self.key.clone(), stderr));
        }

        self.attempt = 0;
        self.stats.restart_attempt.store(0, Ordering::SeqCst);
        self.stats.running.store(true, Ordering::SeqCst);
        self.stats.pid.store(pid.unwrap_or(0), Ordering::SeqCst);
        self.agent = Some(RunningAgent {
            child,
            stdin_tx: Some(stdin_tx),
        });

        self.emit(Lifecycle::Started { pid }).await;
        Ok(())
    }

    async fn send(&mut self, payload: Payload) -> Result<(), ForwarderError> {
        self.wanted = true;
        self.start().await?;

        let line = serde_json::to_string(&payload)?;
        let stdin_tx = self
            .agent
            .as_ref()
            .and_then(|agent| agent.stdin_tx.as_ref())
            .ok_or(ForwarderError::NotRunning)?;

        let backlog = self.stats.pending_writes.fetch_add(1, Ordering::SeqCst) + 1;
        if stdin_tx.send(line).is_err() {
            self.stats.writes_drained(1);
            warn!(
                component = "forwarder",
                event = "forwarder.stdin.closed",
                key = %self.key,
                "Agent stdin closed, payload not delivered"
            );
            return Err(ForwarderError::NotRunning);
        }

        if backlog > self.config.write_backlog_warn {
            warn!(
                component = "forwarder",
                event = "forwarder.stdin.backlog",
                key = %self.key,
                pending_writes = backlog,
                "Agent is not draining stdin"
            );
        }
        Ok(())
    }

    async fn on_exit(&mut self, status: io::Result<ExitStatus>) {
        self.agent = None;
        self.mark_not_running();

        let code = match &status {
            Ok(status) => status.code(),
            Err(e) => {
                warn!(
                    component = "forwarder",
                    event = "forwarder.wait_failed",
                    key = %self.key,
                    error = %e,
                    "Failed to wait on agent process"
                );
                None
            }
        };
        let expected = !self.wanted;

        warn!(
            component = "forwarder",
            event = "forwarder.exited",
            key = %self.key,
            code = ?code,
            expected,
            "Agent process exited"
        );
        self.emit(Lifecycle::Exited { code, expected }).await;

        if self.wanted {
            self.schedule_restart();
        }
    }

    fn schedule_restart(&mut self) {
        self.attempt = self.attempt.saturating_add(1);
        self.stats
            .restart_attempt
            .store(self.attempt, Ordering::SeqCst);
        let delay = restart_delay(
            self.attempt,
            self.config.restart_base,
            self.config.restart_max,
        );

        info!(
            component = "forwarder",
            event = "forwarder.restart_scheduled",
            key = %self.key,
            attempt = self.attempt,
            delay_ms = delay.as_millis() as u64,
            "Scheduling agent restart"
        );

        let command_tx = self.command_tx.clone();
        self.restart = Some(ScheduledTask::after(delay, move || async move {
            if let Some(tx) = command_tx.upgrade() {
                let _ = tx.send(ForwarderCommand::Restart).await;
            }
        }));
    }

    async fn stop(&mut self) {
        self.wanted = false;
        if let Some(pending) = self.restart.take() {
            pending.cancel();
        }

        let Some(mut agent) = self.agent.take() else {
            return;
        };

        info!(
            component = "forwarder",
            event = "forwarder.stopping",
            key = %self.key,
            "Stopping agent process"
        );

        // Dropping the sender lets the writer drain, then closes the pipe.
        agent.stdin_tx = None;

        let status =
            match tokio::time::timeout(self.config.stop_grace, agent.child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    warn!(
                        component = "forwarder",
                        event = "forwarder.stop.force_kill",
                        key = %self.key,
                        grace_ms = self.config.stop_grace.as_millis() as u64,
                        "Agent ignored stdin close, killing"
                    );
                    if let Err(e) = agent.child.kill().await {
                        warn!(
                            component = "forwarder",
                            event = "forwarder.stop.kill_failed",
                            key = %self.key,
                            error = %e,
                            "Failed to kill agent process"
                        );
                    }
                    agent.child.wait().await
                }
            };

        self.mark_not_running();
        let code = status.ok().and_then(|status| status.code());
        self.emit(Lifecycle::Exited {
            code,
            expected: true,
        })
        .await;
    }

    fn mark_not_running(&self) {
        self.stats.running.store(false, Ordering::SeqCst);
        self.stats.pid.store(0, Ordering::SeqCst);
        self.stats.pending_writes.store(0, Ordering::SeqCst);
    }

    async fn emit(&self, lifecycle: Lifecycle) {
        let event = ForwarderEvent::Lifecycle {
            key: self.key.clone(),
            lifecycle,
        };
        if self.events.send(event).await.is_err() {
            debug!(
                component = "forwarder",
                event = "forwarder.events.closed",
                key = %self.key,
                "Event channel closed, lifecycle event dropped"
            );
        }
    }
}

/// Stdin writer task: drains the channel into the child's stdin.
async fn stdin_writer(
    key: String,
    mut stdin: ChildStdin,
    mut rx: mpsc::UnboundedReceiver<String>,
    stats: Arc<ForwarderStats>,
) {
    while let Some(mut line) = rx.recv().await {
        line.push('\n');
        let result = match stdin.write_all(line.as_bytes()).await {
            Ok(()) => stdin.flush().await,
            Err(e) => Err(e),
        };
        stats.writes_drained(1);

        if let Err(e) = result {
            error!(
                component = "forwarder",
                event = "forwarder.stdin.write_error",
                key = %key,
                error = %e,
                "Failed to write to agent stdin"
            );
            break;
        }
    }
    debug!(
        component = "forwarder",
        event = "forwarder.stdin.closed",
        key = %key,
        "Stdin writer task ended"
    );
}

async fn stdout_reader(key: String, stdout: ChildStdout, events: mpsc::Sender<ForwarderEvent>) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let Some(payload) = parse_agent_line(&key, &line) else {
                    continue;
                };
                let event = ForwarderEvent::Message {
                    key: key.clone(),
                    payload,
                };
                if events.send(event).await.is_err() {
                    return;
                }
            }
            Ok(None) => {
                debug!(
                    component = "forwarder",
                    event = "forwarder.stdout.eof",
                    key = %key,
                    "Agent stdout EOF"
                );
                return;
            }
            Err(e) => {
                warn!(
                    component = "forwarder",
                    event = "forwarder.stdout.read_error",
                    key = %key,
                    error = %e,
                    "Error reading agent stdout"
                );
                return;
            }
        }
    }
}

async fn stderr_logger(key: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(
            component = "forwarder",
            event = "forwarder.stderr",
            key = %key,
            line = %line,
            "Agent stderr"
        );
    }
}

/// Parse one stdout line. Blank lines, invalid JSON and non-object JSON are
/// dropped.
fn parse_agent_line(key: &str, line: &str) -> Option<Payload> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str::<Value>(line) {
        Ok(Value::Object(payload)) => Some(payload),
        Ok(_) => {
            warn!(
                component = "forwarder",
                event = "forwarder.stdout.not_object",
                key = %key,
                line_preview = %truncate_for_log(line, 200),
                "Agent emitted JSON that is not an object"
            );
            None
        }
        Err(e) => {
            warn!(
                component = "forwarder",
                event = "forwarder.stdout.parse_error",
                key = %key,
                error = %e,
                line_preview = %truncate_for_log(line, 200),
                "Failed to parse agent stdout line"
            );
            None
        }
    }
}

fn truncate_for_log(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(program: &str, args: &[&str]) -> Arc<ForwarderConfig> {
        Arc::new(ForwarderConfig {
            command: AgentCommand {
                program: program.to_string(),
                args: args.iter().map(|s| s.to_string()).collect(),
            },
            restart_base: Duration::from_millis(20),
            restart_max: Duration::from_millis(200),
            stop_grace: Duration::from_millis(500),
            write_backlog_warn: 16,
        })
    }

    fn object(value: Value) -> Payload {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    async fn next_event(rx: &mut mpsc::Receiver<ForwarderEvent>) -> ForwarderEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for forwarder event")
            .expect("event channel closed")
    }

    async fn next_lifecycle(rx: &mut mpsc::Receiver<ForwarderEvent>) -> Lifecycle {
        loop {
            if let ForwarderEvent::Lifecycle { lifecycle, .. } = next_event(rx).await {
                return lifecycle;
            }
        }
    }

    async fn next_message(rx: &mut mpsc::Receiver<ForwarderEvent>) -> Payload {
        loop {
            if let ForwarderEvent::Message { payload, .. } = next_event(rx).await {
                return payload;
            }
        }
    }

    #[test]
    fn restart_delay_doubles_then_caps() {
        let base = Duration::from_millis(250);
        let max = Duration::from_millis(5000);
        let delays: Vec<u128> = (1..=8)
            .map(|attempt| restart_delay(attempt, base, max).as_millis())
            .collect();
        assert_eq!(delays, vec![250, 500, 1000, 2000, 4000, 5000, 5000, 5000]);
        assert_eq!(restart_delay(u32::MAX, base, max), max);
    }

    #[test]
    fn only_json_objects_survive_line_parsing() {
        assert!(parse_agent_line("k", "").is_none());
        assert!(parse_agent_line("k", "Loading extensions...").is_none());
        assert!(parse_agent_line("k", "[1,2,3]").is_none());
        let payload = parse_agent_line("k", r#"  {"type":"agent_start"}  "#).unwrap();
        assert_eq!(payload.get("type"), Some(&json!("agent_start")));
    }

    #[tokio::test]
    async fn forwards_json_lines_and_drops_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let key = dir.path().to_string_lossy().to_string();
        let (events_tx, mut events_rx) = mpsc::channel(64);
        let forwarder = Forwarder::spawn(
            key.clone(),
            config(
                "sh",
                &["-c", r#"echo 'not json'; echo '{"type":"ready"}'; exec cat"#],
            ),
            events_tx,
        );

        forwarder
            .send(object(json!({"type": "prompt", "id": "p1"})))
            .await
            .expect("send should start the agent");

        assert!(matches!(
            next_lifecycle(&mut events_rx).await,
            Lifecycle::Started { pid: Some(_) }
        ));
        assert_eq!(
            next_message(&mut events_rx).await.get("type"),
            Some(&json!("ready"))
        );
        let echoed = next_message(&mut events_rx).await;
        assert_eq!(echoed.get("id"), Some(&json!("p1")));
        assert!(forwarder.is_running());

        forwarder.stop().await;
    }

    #[tokio::test]
    async fn unexpected_exit_emits_one_event_each_and_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let key = dir.path().to_string_lossy().to_string();
        let (events_tx, mut events_rx) = mpsc::channel(64);
        let forwarder = Forwarder::spawn(key, config("sh", &["-c", "exit 3"]), events_tx);

        forwarder.ensure_started();

        assert!(matches!(
            next_lifecycle(&mut events_rx).await,
            Lifecycle::Started { .. }
        ));
        assert_eq!(
            next_lifecycle(&mut events_rx).await,
            Lifecycle::Exited {
                code: Some(3),
                expected: false
            }
        );
        assert!(matches!(
            next_lifecycle(&mut events_rx).await,
            Lifecycle::Started { .. }
        ));
        assert_eq!(
            next_lifecycle(&mut events_rx).await,
            Lifecycle::Exited {
                code: Some(3),
                expected: false
            }
        );

        forwarder.stop().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_cancels_restart() {
        let dir = tempfile::tempdir().unwrap();
        let key = dir.path().to_string_lossy().to_string();
        let (events_tx, mut events_rx) = mpsc::channel(64);
        let forwarder = Forwarder::spawn(key, config("cat", &[]), events_tx);

        forwarder.ensure_started();
        assert!(matches!(
            next_lifecycle(&mut events_rx).await,
            Lifecycle::Started { .. }
        ));

        forwarder.stop().await;
        assert_eq!(
            next_lifecycle(&mut events_rx).await,
            Lifecycle::Exited {
                code: Some(0),
                expected: true
            }
        );

        forwarder.stop().await;
        assert!(!forwarder.is_running());
        assert!(matches!(
            forwarder.send(object(json!({"type": "prompt"}))).await,
            Err(ForwarderError::Stopped)
        ));

        // No restart is scheduled after an intentional stop.
        let next = tokio::time::timeout(Duration::from_millis(200), events_rx.recv()).await;
        assert!(!matches!(
            next,
            Ok(Some(ForwarderEvent::Lifecycle {
                lifecycle: Lifecycle::Started { .. },
                ..
            }))
        ));
    }

    #[tokio::test]
    async fn stop_kills_agents_that_ignore_stdin_close() {
        let dir = tempfile::tempdir().unwrap();
        let key = dir.path().to_string_lossy().to_string();
        let (events_tx, mut events_rx) = mpsc::channel(64);
        let mut cfg = (*config("sh", &["-c", "exec sleep 30"])).clone();
        cfg.stop_grace = Duration::from_millis(100);
        let forwarder = Forwarder::spawn(key, Arc::new(cfg), events_tx);

        forwarder.ensure_started();
        assert!(matches!(
            next_lifecycle(&mut events_rx).await,
            Lifecycle::Started { .. }
        ));

        let started = std::time::Instant::now();
        forwarder.stop().await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(matches!(
            next_lifecycle(&mut events_rx).await,
            Lifecycle::Exited { expected: true, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn spawn_failures_back_off_exponentially() {
        let dir = tempfile::tempdir().unwrap();
        let key = dir.path().to_string_lossy().to_string();
        let (events_tx, _events_rx) = mpsc::channel(64);
        let mut cfg = (*config("/nonexistent/agentbridge-test-agent", &[])).clone();
        cfg.restart_base = Duration::from_millis(250);
        cfg.restart_max = Duration::from_millis(5000);
        let forwarder = Forwarder::spawn(key, Arc::new(cfg), events_tx);

        let result = forwarder.send(object(json!({"type": "prompt"}))).await;
        assert!(matches!(result, Err(ForwarderError::Spawn { .. })));
        assert_eq!(forwarder.restart_attempt(), 1);

        async fn settle() {
            for _ in 0..10 {
                tokio::task::yield_now().await;
            }
        }

        tokio::time::advance(Duration::from_millis(250)).await;
        settle().await;
        assert_eq!(forwarder.restart_attempt(), 2);

        tokio::time::advance(Duration::from_millis(499)).await;
        settle().await;
        assert_eq!(forwarder.restart_attempt(), 2);

        tokio::time::advance(Duration::from_millis(1)).await;
        settle().await;
        assert_eq!(forwarder.restart_attempt(), 3);

        forwarder.stop().await;
        tokio::time::advance(Duration::from_secs(10)).await;
        settle().await;
        assert_eq!(forwarder.restart_attempt(), 3);
    }
}
