//! Configuration loading and persistence.
//!
//! Handles reading and writing the client configuration file. Account
//! credentials live in their own file (see [`crate::credentials`]); this
//! file holds endpoints and the operator's shell allow list.

use std::collections::BTreeMap;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::{fs, path::PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::constants::{CREDENTIALS_FILENAME, DEFAULT_API_URL, DEFAULT_WEBSOCKET_URL};
use crate::credentials::Credentials;
use crate::shell::CommandLine;

/// Configuration for the Pushover Open Client.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Base URL of the REST API.
    pub api_url: String,
    /// URL of the realtime websocket server.
    pub websocket_url: String,
    /// Path of the credentials file.
    pub credentials_file: PathBuf,
    /// Name used when registering a new device (synthesized when unset).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    /// Command words whose messages are passed to the shell verbatim.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub shell_commands: Vec<String>,
    /// Alias word → command line run through the shell.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub shell_aliases: BTreeMap<String, CommandLine>,
}

impl Default for Config {
    fn default() -> Self {
        let credentials_file = Credentials::default_path().unwrap_or_else(|e| {
            log::warn!("{e}, using ./{CREDENTIALS_FILENAME}");
            PathBuf::from(CREDENTIALS_FILENAME)
        });

        Self {
            api_url: DEFAULT_API_URL.to_string(),
            websocket_url: DEFAULT_WEBSOCKET_URL.to_string(),
            credentials_file,
            device_name: None,
            shell_commands: Vec::new(),
            shell_aliases: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Returns the configuration directory path.
    ///
    /// Directory selection priority:
    /// 1. `PUSHOVER_CONFIG_DIR` env var: explicit override
    /// 2. Default: platform config dir (Linux: ~/.config/pushover-open-client)
    pub fn config_dir() -> Result<PathBuf> {
        if let Ok(dir) = std::env::var("PUSHOVER_CONFIG_DIR") {
            return Ok(PathBuf::from(dir));
        }
        Ok(dirs::config_dir()
            .context("Could not determine config directory")?
            .join("pushover-open-client"))
    }

    /// Path of the configuration file.
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Loads configuration from file, with environment variable overrides.
    ///
    /// A missing file yields the defaults; a malformed file is an error.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file()?.unwrap_or_default();
        config.apply_env_overrides();
        Ok(config)
    }

    fn load_from_file() -> Result<Option<Self>> {
        let config_path = Self::config_path()?;
        if !config_path.exists() {
            log::debug!("No config file at {}, using defaults", config_path.display());
            return Ok(None);
        }
        let content = fs::read_to_string(&config_path)?;
        let config = serde_json::from_str(&content)
            .with_context(|| format!("Invalid config file {}", config_path.display()))?;
        Ok(Some(config))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(api_url) = std::env::var("PUSHOVER_API_URL") {
            self.api_url = api_url;
        }

        if let Ok(websocket_url) = std::env::var("PUSHOVER_WEBSOCKET_URL") {
            self.websocket_url = websocket_url;
        }

        if let Ok(credentials_file) = std::env::var("PUSHOVER_CREDENTIALS_FILE") {
            self.credentials_file = PathBuf::from(credentials_file);
        }

        if let Ok(device_name) = std::env::var("PUSHOVER_DEVICE_NAME") {
            self.device_name = Some(device_name).filter(|n| !n.is_empty());
        }
    }

    /// Persists the current configuration to disk.
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path()?;
        if let Some(dir) = config_path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(&config_path, serde_json::to_string_pretty(self)?)?;

        // Set restrictive permissions (owner read/write only)
        #[cfg(unix)]
        fs::set_permissions(&config_path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.api_url, "https://api.pushover.net/1");
        assert_eq!(config.websocket_url, "wss://client.pushover.net/push");
        assert!(config.credentials_file.ends_with(".pushover-open-client-creds.json"));
        assert!(config.shell_commands.is_empty());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: Config = serde_json::from_str(
            r#"{ "shell_aliases": { "wake": "echo hi", "lock": ["loginctl", "lock-session"] } }"#,
        )
        .unwrap();
        assert_eq!(config.api_url, DEFAULT_API_URL);
        assert_eq!(config.shell_aliases.len(), 2);
        assert_eq!(
            config.shell_aliases["lock"].argv(),
            vec!["loginctl", "lock-session"]
        );
    }

    #[test]
    fn test_serialization_skips_empty_shell_tables() {
        let json = serde_json::to_string(&Config::default()).unwrap();
        assert!(!json.contains("shell_commands"));
        assert!(!json.contains("shell_aliases"));
        assert!(!json.contains("device_name"));
    }
}
