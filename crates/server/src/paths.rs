//! Locations of the bridge's own files.
//!
//! Resolved once at startup from: CLI `--data-dir` > `AGENTBRIDGE_DATA_DIR`
//! env > `~/.agentbridge`, then passed around by value.

use std::io;
use std::path::{Path, PathBuf};

const DEFAULT_DIR_NAME: &str = ".agentbridge";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPaths {
    root: PathBuf,
}

impl DataPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `explicit` (already merged with the env var by clap) or `~/.agentbridge`.
    pub fn resolve(explicit: Option<&Path>) -> anyhow::Result<Self> {
        let root = match explicit {
            Some(path) => path.to_path_buf(),
            None => dirs::home_dir()
                .ok_or_else(|| anyhow::anyhow!("HOME directory not found; pass --data-dir"))?
                .join(DEFAULT_DIR_NAME),
        };
        Ok(Self::new(root))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.root.join("agentbridge.pid")
    }

    pub fn token_file(&self) -> PathBuf {
        self.root.join("auth-token")
    }

    pub fn ensure_dirs(&self) -> io::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(self.log_dir())?;
        Ok(())
    }
}
