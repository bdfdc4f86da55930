//! `agentbridge-server status`: check whether the server is running.
//! `agentbridge-server generate-token`: create a random auth token.

use std::net::SocketAddr;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::time::Duration;

use serde_json::Value;

use crate::paths::DataPaths;
use crate::VERSION;

pub async fn run(paths: &DataPaths, bind: SocketAddr) -> anyhow::Result<()> {
    println!();
    println!("  agentbridge server v{VERSION}");
    println!("  Data dir: {}", paths.root().display());

    let pid_alive = match read_pid(paths) {
        Some(pid) if process_alive(pid) => {
            println!("  PID: {pid} (running)");
            true
        }
        Some(pid) => {
            println!("  PID file: {pid} (stale, process not found)");
            false
        }
        None => {
            println!("  PID file: not found");
            false
        }
    };

    let health_url = format!("http://{bind}/health");
    let health = fetch_health(&health_url).await;
    match &health {
        Some(report) => {
            println!("  Health: OK ({health_url})");
            for key in ["processes", "running", "pendingWrites", "directoryLocks", "sessionLocks", "clients", "connections"] {
                if let Some(value) = report.get(key) {
                    println!("    {key}: {value}");
                }
            }
        }
        None if pid_alive => {
            println!("  Health: unreachable (server may be bound to a different address)")
        }
        None => println!("  Health: unreachable"),
    }

    println!();
    if !pid_alive && health.is_none() {
        println!("  Server is not running.");
        println!("  Start with: agentbridge-server start");
        println!();
    }
    Ok(())
}

pub fn generate_token(paths: &DataPaths) -> anyhow::Result<()> {
    let token = uuid::Uuid::new_v4().simple().to_string();
    let token_path = paths.token_file();

    std::fs::create_dir_all(paths.root())?;
    std::fs::write(&token_path, &token)?;
    #[cfg(unix)]
    std::fs::set_permissions(&token_path, std::fs::Permissions::from_mode(0o600))?;

    println!();
    println!("  Auth token saved to {}", token_path.display());
    println!();
    println!("  Token: {token}");
    println!();
    println!("  The server reads it automatically on start, or pass it explicitly:");
    println!("    agentbridge-server start --auth-token {token}");
    println!();
    Ok(())
}

pub fn write_pid_file(paths: &DataPaths) -> std::io::Result<()> {
    std::fs::write(paths.pid_file(), std::process::id().to_string())
}

pub fn remove_pid_file(paths: &DataPaths) {
    let _ = std::fs::remove_file(paths.pid_file());
}

fn read_pid(paths: &DataPaths) -> Option<u32> {
    std::fs::read_to_string(paths.pid_file())
        .ok()?
        .trim()
        .parse()
        .ok()
        .filter(|pid| *pid > 0)
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    // kill -0 checks if process exists without sending a signal
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    false
}

async fn fetch_health(url: &str) -> Option<Value> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()
        .ok()?;
    let response = client.get(url).send().await.ok()?;
    if !response.status().is_success() {
        return None;
    }
    response.json().await.ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_file_round_trip_detects_current_process() {
        let dir = tempfile::tempdir().unwrap();
        let paths = DataPaths::new(dir.path());
        assert_eq!(read_pid(&paths), None);

        write_pid_file(&paths).unwrap();
        let pid = read_pid(&paths).unwrap();
        assert_eq!(pid, std::process::id());
        #[cfg(unix)]
        assert!(process_alive(pid));

        remove_pid_file(&paths);
        assert_eq!(read_pid(&paths), None);
    }

    #[test]
    fn generated_token_is_private() {
        let dir = tempfile::tempdir().unwrap();
        let paths = DataPaths::new(dir.path().join("data"));
        generate_token(&paths).unwrap();

        let token = std::fs::read_to_string(paths.token_file()).unwrap();
        assert_eq!(token.len(), 32);
        #[cfg(unix)]
        {
            let mode = std::fs::metadata(paths.token_file()).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[tokio::test]
    async fn health_is_none_when_nothing_listens() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        assert!(fetch_health(&format!("http://{addr}/health")).await.is_none());
    }
}
