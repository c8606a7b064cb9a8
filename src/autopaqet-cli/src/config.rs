//! CLI configuration management
//!
//! Configuration is loaded from the first file that exists:
//! 1. `--config <path>`
//! 2. `./config/autopaqet.json`
//! 3. `~/.autopaqet/config.json`
//!
//! Environment variables (`AUTOPAQET_*`) override file values.

use anyhow::{Context, Result};
use autopaqet_core::supervisor::BINARY_ENV;
use autopaqet_core::{find_tunnel_binary, TunnelOptions};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const SERVER_ENV: &str = "AUTOPAQET_SERVER";
pub const KEY_ENV: &str = "AUTOPAQET_KEY";

pub const DEFAULT_CONFIG_PATH: &str = "config/autopaqet.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Display name of the connection profile
    #[serde(default = "default_profile_name")]
    pub profile_name: String,
    /// Connection profile; network fields are detected when left empty
    #[serde(default)]
    pub profile: TunnelOptions,
    /// Tunnel binary (searched for when unset)
    #[serde(default)]
    pub binary: Option<PathBuf>,
    /// Where scratch tunnel configs are written
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,
    /// SOCKS5 readiness deadline in seconds
    #[serde(default = "default_attempt_timeout")]
    pub attempt_timeout_secs: u64,
    /// Tunnel log lines kept in memory
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,
}

fn default_profile_name() -> String {
    "default".into()
}
fn default_scratch_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".autopaqet"))
        .unwrap_or_else(|| PathBuf::from(".autopaqet"))
}
fn default_attempt_timeout() -> u64 {
    15
}
fn default_log_capacity() -> usize {
    1000
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profile_name: default_profile_name(),
            profile: TunnelOptions::default(),
            binary: None,
            scratch_dir: default_scratch_dir(),
            attempt_timeout_secs: default_attempt_timeout(),
            log_capacity: default_log_capacity(),
        }
    }
}

impl AppConfig {
    /// Load configuration from file and environment
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();

        let config_paths = [
            config_path.map(Path::to_path_buf),
            Some(PathBuf::from(DEFAULT_CONFIG_PATH)),
            dirs::home_dir().map(|h| h.join(".autopaqet/config.json")),
        ];

        for path in config_paths.into_iter().flatten() {
            if path.exists() {
                config = Self::from_file(&path)?;
                tracing::info!(?path, "Loaded config from file");
                break;
            }
        }

        config.apply_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config from {:?}", path))?;
        serde_json::from_str(&content).with_context(|| format!("parsing config from {:?}", path))
    }

    /// Apply `AUTOPAQET_*` overrides from `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(server) = lookup(SERVER_ENV) {
            self.profile.server_addr = server;
        }
        if let Some(key) = lookup(KEY_ENV) {
            self.profile.key = key;
        }
        if let Some(binary) = lookup(BINARY_ENV) {
            self.binary = Some(PathBuf::from(binary));
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.profile.server_addr.is_empty() {
            anyhow::bail!("Server address is required. Set profile.server_addr or {SERVER_ENV}");
        }
        if self.profile.key.is_empty() {
            anyhow::bail!("Tunnel key is required. Set profile.key or {KEY_ENV}");
        }
        Ok(())
    }

    /// Configured binary, or the first one found on this machine
    pub fn resolve_binary(&self) -> Result<PathBuf> {
        match &self.binary {
            Some(path) => Ok(path.clone()),
            None => find_tunnel_binary().context("locating paqet binary"),
        }
    }

    /// Create sample config file
    pub fn create_sample(path: &Path) -> Result<()> {
        let sample = Self {
            profile: TunnelOptions {
                server_addr: "YOUR_SERVER_IP:443".into(),
                key: "YOUR_SHARED_KEY".into(),
                ..Default::default()
            },
            ..Default::default()
        };

        let content = serde_json::to_string_pretty(&sample)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }
}
