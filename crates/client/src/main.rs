//! agentbridge CLI
//!
//! `agentbridge attach` drives the agent for a directory from the terminal;
//! `agentbridge status` asks a server for its health report.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use agentbridge_client::config::{default_config_path, ClientConfigFile, ClientSettings};
use agentbridge_client::streaming::{ContentKind, StreamUpdate};
use agentbridge_client::transport::WsOptions;
use agentbridge_client::{
    ClientConnection, ClientEvent, ConnectOptions, ResyncSnapshot, StreamReassembler, WsTransport,
};
use agentbridge_protocol::agent::payload_type;
use agentbridge_protocol::{Payload, ServerControl};
use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "agentbridge", version, about = "Drive a remote agent through agentbridge")]
struct Cli {
    /// Client config file (default ~/.agentbridge/client.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Server WebSocket URL
    #[arg(long, env = "AGENTBRIDGE_URL", global = true)]
    url: Option<String>,

    #[arg(long, env = "AGENTBRIDGE_TOKEN", hide_env_values = true, global = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Take control of a directory's agent and chat with it
    Attach(AttachArgs),
    /// Show the server's health report
    Status,
}

#[derive(Debug, Args)]
struct AttachArgs {
    /// Working directory on the server (default: current directory)
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Session file to lock alongside the directory
    #[arg(long)]
    session: Option<String>,

    /// Identity to resume (default: the one saved in the config file)
    #[arg(long)]
    client_id: Option<String>,

    /// Ignore the saved identity and start fresh
    #[arg(long)]
    fresh: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let cli = Cli::parse();

    let config_path = cli.config.clone().or_else(default_config_path);
    let file = match &config_path {
        Some(path) => ClientConfigFile::load(path)?,
        None => ClientConfigFile::default(),
    };

    match cli.command {
        Command::Status => {
            let settings = ClientSettings::resolve(&file, cli.url, cli.token, None);
            status(&settings).await
        }
        Command::Attach(args) => {
            let mut file = file;
            if args.fresh {
                file.client_id = None;
            }
            let settings =
                ClientSettings::resolve(&file, cli.url, cli.token, args.client_id.clone());
            attach(settings, config_path, args).await
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

async fn status(settings: &ClientSettings) -> anyhow::Result<()> {
    let url = settings.health_url();
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(3))
        .build()?;

    println!();
    match client.get(&url).send().await {
        Ok(response) if response.status().is_success() => {
            let report: Value = response.json().await?;
            println!("  Server: OK ({url})");
            if let Value::Object(fields) = report {
                for (key, value) in fields {
                    println!("    {key}: {value}");
                }
            }
        }
        Ok(response) => println!("  Server: HTTP {} ({url})", response.status()),
        Err(e) => println!("  Server: unreachable ({url}): {e}"),
    }
    println!();
    Ok(())
}

async fn attach(
    settings: ClientSettings,
    config_path: Option<PathBuf>,
    args: AttachArgs,
) -> anyhow::Result<()> {
    let cwd = match args.cwd {
        Some(cwd) => cwd,
        None => std::env::current_dir().context("cannot determine current directory")?,
    };
    let directory = cwd.to_string_lossy().to_string();

    let transport = WsTransport::start(
        WsOptions::new(settings.url.clone())
            .with_token(settings.token.clone())
            .with_client_id(settings.client_id.clone()),
    );
    let options = ConnectOptions {
        session_path: args.session,
        client_id: settings.client_id.clone(),
        ..ConnectOptions::new(directory.clone())
    };
    let connection = Arc::new(
        ClientConnection::connect(transport, options)
            .await
            .with_context(|| format!("failed to attach to {directory} via {}", settings.url))?,
    );

    if let (Some(path), Some(client_id)) = (&config_path, connection.client_id()) {
        remember_client_id(path, &client_id);
    }
    eprintln!(
        "attached to {directory} as {}; type a prompt and press enter (Ctrl-C to detach)",
        connection.client_id().unwrap_or_default()
    );

    let events = connection.events();
    let mut printer = Printer::default();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => submit_prompt(&connection, line),
                Ok(None) => stdin_open = false,
                Err(e) => {
                    warn!(
                        component = "cli",
                        event = "cli.stdin.read_failed",
                        error = %e,
                        "Stopped reading stdin"
                    );
                    stdin_open = false;
                }
            },
            event = events.next() => match event {
                Some(event) => printer.render(event),
                None => break,
            },
        }
    }

    connection.disconnect().await;
    eprintln!("detached");
    Ok(())
}

fn remember_client_id(path: &std::path::Path, client_id: &str) {
    let result = ClientConfigFile::load(path).and_then(|mut file| {
        if file.client_id.as_deref() == Some(client_id) {
            return Ok(());
        }
        file.client_id = Some(client_id.to_string());
        file.save(path)
    });
    if let Err(e) = result {
        warn!(
            component = "cli",
            event = "cli.config.save_failed",
            error = %e,
            "Could not remember client id"
        );
    }
}

fn submit_prompt(connection: &Arc<ClientConnection>, line: String) {
    let message = line.trim().to_string();
    if message.is_empty() {
        return;
    }
    let connection = connection.clone();
    tokio::spawn(async move {
        if let Err(e) = connection.prompt(&message).await {
            eprintln!("[prompt failed: {e}]");
        }
    });
}

/// Writes assistant text to stdout as it streams in.
#[derive(Default)]
struct Printer {
    reassembler: StreamReassembler,
}

impl Printer {
    fn render(&mut self, event: ClientEvent) {
        match event {
            ClientEvent::Resynced(snapshot) => self.resynced(&snapshot),
            ClientEvent::Agent(payload) => self.agent_event(&payload),
            ClientEvent::Control(ServerControl::AgentStatus {
                cwd, status, code, ..
            }) => eprintln!("[agent {status:?} in {cwd} code={code:?}]"),
            ClientEvent::Control(ServerControl::Error { code, message, .. }) => {
                eprintln!("[server error {code}: {message}]")
            }
            ClientEvent::Control(_) => {}
            ClientEvent::Connection(phase) => eprintln!("[connection {phase:?}]"),
        }
    }

    fn resynced(&mut self, snapshot: &ResyncSnapshot) {
        self.reassembler.reset();
        let messages = snapshot
            .messages
            .as_ref()
            .and_then(|data| data.get("messages"))
            .and_then(Value::as_array)
            .map_or(0, Vec::len);
        eprintln!(
            "[synced: {messages} messages, {}]",
            if snapshot.resumed { "resumed" } else { "new session" }
        );
    }

    fn agent_event(&mut self, payload: &Payload) {
        if let Some((target, update)) = self.reassembler.apply_payload(payload) {
            if target.content != ContentKind::Text {
                return;
            }
            let mut stdout = std::io::stdout().lock();
            match update {
                StreamUpdate::Started => {}
                StreamUpdate::Appended(delta) => {
                    let _ = write!(stdout, "{delta}");
                }
                StreamUpdate::Completed { replaced } => {
                    if replaced {
                        // The final value supersedes what was streamed.
                        let text = self
                            .reassembler
                            .snapshot(&target.message_key, target.slot)
                            .and_then(|snapshot| snapshot.text)
                            .unwrap_or_default();
                        let _ = write!(stdout, "\n{text}");
                    }
                    let _ = writeln!(stdout);
                }
            }
            let _ = stdout.flush();
            return;
        }

        match payload_type(payload) {
            Some("tool_execution_start") => {
                let tool = payload
                    .get("toolName")
                    .and_then(Value::as_str)
                    .unwrap_or("tool");
                eprintln!("[running {tool}]");
            }
            Some("agent_end") => eprintln!("[done]"),
            _ => {}
        }
    }
}
