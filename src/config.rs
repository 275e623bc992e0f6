use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::kubernetes::default_shell_command;

/// Environment variable overriding the config file location
pub const CONFIG_ENV: &str = "PODTERM_CONFIG";

/// Errors that can occur during config operations
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] serde_json::Error),

    #[error("Config directory not found")]
    ConfigDirNotFound,

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Which cluster to talk to
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubeSettings {
    /// Explicit kubeconfig file; inferred when unset
    #[serde(default)]
    pub kubeconfig: Option<PathBuf>,
    /// Context inside the kubeconfig; current context when unset
    #[serde(default)]
    pub context: Option<String>,
}

/// Application configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Address the HTTP server binds to
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Route of the terminal WebSocket endpoint
    #[serde(default = "default_terminal_path")]
    pub terminal_path: String,
    /// Upper bound on handling the upgrade request
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// Command executed inside the container
    #[serde(default = "default_shell_command")]
    pub shell_command: Vec<String>,
    #[serde(default)]
    pub kube: KubeSettings,
}

fn default_listen_addr() -> String {
    "0.0.0.0:8081".to_string()
}

fn default_terminal_path() -> String {
    "/api/v1/terminal/ws".to_string()
}

fn default_handshake_timeout_ms() -> u64 {
    2000
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            terminal_path: default_terminal_path(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            shell_command: default_shell_command(),
            kube: KubeSettings::default(),
        }
    }
}

impl AppConfig {
    /// Get the configuration directory path
    pub fn config_dir() -> Result<PathBuf, ConfigError> {
        Ok(dirs::config_dir()
            .ok_or(ConfigError::ConfigDirNotFound)?
            .join("podterm"))
    }

    /// Get the configuration file path. `PODTERM_CONFIG` takes precedence.
    pub fn config_path() -> Result<PathBuf, ConfigError> {
        if let Some(path) = std::env::var_os(CONFIG_ENV).filter(|p| !p.is_empty()) {
            return Ok(PathBuf::from(path));
        }
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load configuration from disk
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load configuration from `path`, falling back to defaults if it does not exist
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("Config file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;

        tracing::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Save configuration to disk
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        let contents = serde_json::to_string_pretty(self)?;
        fs::write(path, contents)?;

        tracing::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Check values the server cannot start with
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen_addr
            .parse::<SocketAddr>()
            .map_err(|e| {
                ConfigError::Invalid(format!("listen_addr '{}': {}", self.listen_addr, e))
            })?;
        if !self.terminal_path.starts_with('/') || self.terminal_path == "/healthz" {
            return Err(ConfigError::Invalid(format!(
                "terminal_path '{}' must be an absolute route other than /healthz",
                self.terminal_path
            )));
        }
        if self.handshake_timeout_ms == 0 {
            return Err(ConfigError::Invalid("handshake_timeout_ms must be positive".into()));
        }
        if self.shell_command.is_empty() {
            return Err(ConfigError::Invalid("shell_command must not be empty".into()));
        }
        Ok(())
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}
