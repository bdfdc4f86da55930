//! Command line and the typed configuration derived from it.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};

use crate::forwarder::{AgentCommand, ForwarderConfig};
use crate::paths::DataPaths;
use crate::process_manager::ProcessManagerConfig;
use crate::state::BridgeConfig;

pub const DEFAULT_BIND: &str = "127.0.0.1:4300";

#[derive(Debug, Parser)]
#[command(
    name = "agentbridge-server",
    version,
    about = "Drive per-directory agent processes from remote clients",
    args_conflicts_with_subcommands = true
)]
pub struct Cli {
    /// Data directory for logs, pid file and token
    #[arg(long, env = "AGENTBRIDGE_DATA_DIR", global = true)]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub start: StartArgs,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the bridge (default)
    Start(StartArgs),
    /// Report whether a server is running
    Status {
        #[arg(long, default_value = DEFAULT_BIND)]
        bind: SocketAddr,
    },
    /// Create a random auth token in the data directory
    GenerateToken,
}

#[derive(Debug, Clone, Args)]
pub struct StartArgs {
    #[arg(long, default_value = DEFAULT_BIND)]
    pub bind: SocketAddr,

    /// Bearer token clients must present (falls back to <data-dir>/auth-token)
    #[arg(long, env = "AGENTBRIDGE_AUTH_TOKEN", hide_env_values = true)]
    pub auth_token: Option<String>,

    /// Agent program spawned once per directory
    #[arg(long, default_value = "pi")]
    pub agent_command: String,

    /// Argument passed to the agent (repeatable)
    #[arg(
        long = "agent-arg",
        allow_hyphen_values = true,
        default_values_t = ["--mode".to_string(), "rpc".to_string()]
    )]
    pub agent_args: Vec<String>,

    #[arg(long, default_value_t = 600)]
    pub idle_ttl_secs: u64,

    #[arg(long, default_value_t = 30)]
    pub sweep_interval_secs: u64,

    #[arg(long, default_value_t = 30)]
    pub reconnect_grace_secs: u64,

    #[arg(long, default_value_t = 250)]
    pub restart_base_ms: u64,

    #[arg(long, default_value_t = 5000)]
    pub restart_max_ms: u64,

    #[arg(long, default_value_t = 3000)]
    pub stop_grace_ms: u64,

    #[arg(long, default_value_t = 30)]
    pub navigate_timeout_secs: u64,

    /// Per-connection outbound queue capacity
    #[arg(long, default_value_t = 256)]
    pub outbound_buffer: usize,

    /// Mirror logs to stderr
    #[arg(long)]
    pub log_stderr: bool,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    pub auth_token: Option<String>,
    pub bridge: BridgeConfig,
    pub manager: ProcessManagerConfig,
    pub forwarder: ForwarderConfig,
    pub log_stderr: bool,
}

impl StartArgs {
    pub fn into_config(self, paths: &DataPaths) -> anyhow::Result<ServerConfig> {
        if self.agent_command.trim().is_empty() {
            bail!("--agent-command must not be empty");
        }
        if self.outbound_buffer == 0 {
            bail!("--outbound-buffer must be at least 1");
        }
        if self.restart_base_ms == 0 || self.restart_base_ms > self.restart_max_ms {
            bail!("--restart-base-ms must be non-zero and not exceed --restart-max-ms");
        }
        if self.sweep_interval_secs == 0 {
            bail!("--sweep-interval-secs must be at least 1");
        }

        let auth_token = match self.auth_token {
            Some(token) => Some(token),
            None => read_token_file(paths)?,
        }
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty());
        if auth_token.is_none() && !self.bind.ip().is_loopback() {
            bail!(
                "refusing to listen on {} without an auth token; pass --auth-token \
                 or run `agentbridge-server generate-token`",
                self.bind
            );
        }

        Ok(ServerConfig {
            bind: self.bind,
            auth_token,
            bridge: BridgeConfig {
                reconnect_grace: Duration::from_secs(self.reconnect_grace_secs),
                navigate_timeout: Duration::from_secs(self.navigate_timeout_secs),
                outbound_buffer: self.outbound_buffer,
            },
            manager: ProcessManagerConfig {
                idle_ttl: Duration::from_secs(self.idle_ttl_secs),
                sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            },
            forwarder: ForwarderConfig {
                command: AgentCommand {
                    program: self.agent_command,
                    args: self.agent_args,
                },
                restart_base: Duration::from_millis(self.restart_base_ms),
                restart_max: Duration::from_millis(self.restart_max_ms),
                stop_grace: Duration::from_millis(self.stop_grace_ms),
                write_backlog_warn: ForwarderConfig::default().write_backlog_warn,
            },
            log_stderr: self.log_stderr,
        })
    }
}

fn read_token_file(paths: &DataPaths) -> anyhow::Result<Option<String>> {
    let path = paths.token_file();
    if !path.exists() {
        return Ok(None);
    }
    let token = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    Ok(Some(token))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("agentbridge-server").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn bare_invocation_starts_with_defaults() {
        let cli = parse(&[]);
        assert!(cli.command.is_none());
        let dir = tempfile::tempdir().unwrap();
        let config = cli.start.into_config(&DataPaths::new(dir.path())).unwrap();
        assert_eq!(config.bind, DEFAULT_BIND.parse().unwrap());
        assert_eq!(config.forwarder.command, AgentCommand::default());
        assert_eq!(config.manager.idle_ttl, Duration::from_secs(600));
        assert_eq!(config.bridge.reconnect_grace, Duration::from_secs(30));
        assert_eq!(config.forwarder.restart_base, Duration::from_millis(250));
    }

    #[test]
    fn agent_args_accept_leading_hyphens() {
        let cli = parse(&[
            "start",
            "--agent-command",
            "my-agent",
            "--agent-arg",
            "--json",
            "--agent-arg",
            "-v",
        ]);
        let Some(Command::Start(start)) = cli.command else {
            panic!("expected start");
        };
        assert_eq!(start.agent_command, "my-agent");
        assert_eq!(start.agent_args, vec!["--json".to_string(), "-v".to_string()]);
    }

    #[test]
    fn token_falls_back_to_data_dir_file() {
        let dir = tempfile::tempdir().unwrap();
        let paths = DataPaths::new(dir.path());
        std::fs::write(paths.token_file(), "from-file\n").unwrap();

        let config = parse(&[]).start.into_config(&paths).unwrap();
        assert_eq!(config.auth_token.as_deref(), Some("from-file"));

        let config = parse(&["--auth-token", "explicit"])
            .start
            .into_config(&paths)
            .unwrap();
        assert_eq!(config.auth_token.as_deref(), Some("explicit"));
    }

    #[test]
    fn token_is_required_off_loopback() {
        let dir = tempfile::tempdir().unwrap();
        let paths = DataPaths::new(dir.path());

        let result = parse(&["--bind", "0.0.0.0:4300"]).start.into_config(&paths);
        assert!(result.is_err());

        let config = parse(&["--bind", "0.0.0.0:4300", "--auth-token", "t"])
            .start
            .into_config(&paths)
            .unwrap();
        assert_eq!(config.auth_token.as_deref(), Some("t"));

        let local = parse(&["--bind", "127.0.0.1:4300"]).start.into_config(&paths).unwrap();
        assert!(local.auth_token.is_none());
    }

    #[test]
    fn rejects_inverted_backoff() {
        let dir = tempfile::tempdir().unwrap();
        let result = parse(&["--restart-base-ms", "9000"])
            .start
            .into_config(&DataPaths::new(dir.path()));
        assert!(result.is_err());
    }

    #[test]
    fn status_subcommand_parses_bind() {
        let cli = parse(&["status", "--bind", "127.0.0.1:9999"]);
        assert!(matches!(
            cli.command,
            Some(Command::Status { bind }) if bind.port() == 9999
        ));
    }
}
