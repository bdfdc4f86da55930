//! `~/.agentbridge/client.toml` plus env/flag overrides.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

pub const DEFAULT_URL: &str = "ws://127.0.0.1:4300/ws";
pub const CONFIG_FILE: &str = "client.toml";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfigFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Last identity the server issued, reused to resume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

impl ClientConfigFile {
    /// Missing file means defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()))
            }
        };
        toml::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let text = toml::to_string_pretty(self)?;
        std::fs::write(path, text).with_context(|| format!("failed to write {}", path.display()))
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".agentbridge").join(CONFIG_FILE))
}

/// Effective settings after layering flags/env over the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub url: String,
    pub token: Option<String>,
    pub client_id: Option<String>,
}

impl ClientSettings {
    pub fn resolve(
        file: &ClientConfigFile,
        url: Option<String>,
        token: Option<String>,
        client_id: Option<String>,
    ) -> Self {
        let non_empty = |value: Option<String>| {
            value
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        Self {
            url: non_empty(url)
                .or_else(|| non_empty(file.url.clone()))
                .unwrap_or_else(|| DEFAULT_URL.to_string()),
            token: non_empty(token).or_else(|| non_empty(file.token.clone())),
            client_id: non_empty(client_id).or_else(|| non_empty(file.client_id.clone())),
        }
    }

    /// `http(s)://host:port/health` for the server behind `url`.
    pub fn health_url(&self) -> String {
        let (scheme, rest) = match self.url.split_once("://") {
            Some(("wss", rest)) => ("https", rest),
            Some((_, rest)) => ("http", rest),
            None => ("http", self.url.as_str()),
        };
        let authority = rest.split(['/', '?']).next().unwrap_or(rest);
        format!("{scheme}://{authority}/health")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let file = ClientConfigFile::load(&dir.path().join("client.toml")).unwrap();
        assert_eq!(file, ClientConfigFile::default());
    }

    #[test]
    fn save_then_load_keeps_client_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("client.toml");
        let file = ClientConfigFile {
            url: Some("ws://box:4300/ws".into()),
            token: None,
            client_id: Some("c-42".into()),
        };
        file.save(&path).unwrap();
        assert_eq!(ClientConfigFile::load(&path).unwrap(), file);
    }

    #[test]
    fn flags_override_file_values() {
        let file = ClientConfigFile {
            url: Some("ws://file/ws".into()),
            token: Some("file-token".into()),
            client_id: Some("file-id".into()),
        };
        let settings = ClientSettings::resolve(
            &file,
            Some("ws://flag/ws".into()),
            Some("  ".into()),
            None,
        );
        assert_eq!(settings.url, "ws://flag/ws");
        assert_eq!(settings.token.as_deref(), Some("file-token"));
        assert_eq!(settings.client_id.as_deref(), Some("file-id"));

        let defaults = ClientSettings::resolve(&ClientConfigFile::default(), None, None, None);
        assert_eq!(defaults.url, DEFAULT_URL);
    }

    #[test]
    fn health_url_follows_scheme_and_authority() {
        let settings = |url: &str| ClientSettings::resolve(&ClientConfigFile::default(), Some(url.into()), None, None);
        assert_eq!(settings("ws://127.0.0.1:4300/ws").health_url(), "http://127.0.0.1:4300/health");
        assert_eq!(settings("wss://bridge.example/ws?x=1").health_url(), "https://bridge.example/health");
    }

    #[test]
    fn rejects_malformed_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.toml");
        std::fs::write(&path, "url = [").unwrap();
        assert!(ClientConfigFile::load(&path).is_err());
    }
}
