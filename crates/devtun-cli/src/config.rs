//! Orchestrator configuration at `~/.devtun/config.toml`.
//!
//! CLI flags always override file values.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub tunnel: TunnelConfig,

    #[serde(default)]
    pub credentials: CredentialsConfig,

    #[serde(default)]
    pub forward: ForwardConfig,
}

/// Where the agent binary lives on the remote side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_agent_path")]
    pub path: String,

    #[serde(default)]
    pub debug: bool,

    /// Agent data directory passed to `update-config`.
    #[serde(default)]
    pub dir: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            path: default_agent_path(),
            debug: false,
            dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    #[serde(default = "default_update_config_interval")]
    pub update_config_interval_secs: u64,

    /// Idle shutdown for the stdio tunnel server. 0 = never.
    #[serde(default)]
    pub exit_after_secs: u64,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            update_config_interval_secs: default_update_config_interval(),
            exit_after_secs: 0,
        }
    }
}

impl TunnelConfig {
    pub fn update_config_interval(&self) -> Duration {
        Duration::from_secs(self.update_config_interval_secs)
    }

    pub fn exit_after(&self) -> Duration {
        Duration::from_secs(self.exit_after_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialsConfig {
    #[serde(default = "default_true")]
    pub inject_git: bool,

    #[serde(default = "default_true")]
    pub inject_docker: bool,

    #[serde(default)]
    pub git_username: Option<String>,

    #[serde(default)]
    pub git_token: Option<String>,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            inject_git: true,
            inject_docker: true,
            git_username: None,
            git_token: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForwardConfig {
    /// Ports that are never forwarded.
    #[serde(default)]
    pub excluded_ports: Vec<String>,
}

fn default_agent_path() -> String {
    "/usr/local/bin/devpod".to_string()
}

fn default_update_config_interval() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

impl Config {
    /// `~/.devtun/config.toml`.
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_default()
            .join(".devtun")
            .join("config.toml")
    }

    /// Load configuration from a TOML file, returning defaults if the file
    /// does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        let path = expand_tilde(path);
        if !path.exists() {
            debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config: {}", path.display()))?;
        debug!(path = %path.display(), "loaded config");
        Ok(config)
    }
}

fn expand_tilde(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir().unwrap_or_default().join(rest),
        Err(_) => path.to_path_buf(),
    }
}
