//! Bridge settings
//!
//! Loads bridge configuration from a TOML file. A missing file yields the
//! defaults; CLI flags may override individual values.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::{ManagerConfig, DEFAULT_IDLE_TTL};

/// Errors that can occur while loading settings
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Failed to read settings file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse settings: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Agent invocation settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentSettings {
    /// Agent binary to spawn per session
    pub command: String,
    /// Arguments putting the agent into RPC mode
    pub args: Vec<String>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            command: "pi".to_string(),
            args: vec!["--mode".to_string(), "rpc".to_string()],
        }
    }
}

/// Root bridge settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Address to bind to
    pub bind: String,
    /// Port to listen on
    pub port: u16,
    /// Idle time-to-live for clientless sessions, in milliseconds
    pub idle_ttl_ms: u64,
    /// Agent invocation
    pub agent: AgentSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 3080,
            idle_ttl_ms: DEFAULT_IDLE_TTL.as_millis() as u64,
            agent: AgentSettings::default(),
        }
    }
}

impl Settings {
    /// Load settings from a TOML file, falling back to defaults when the
    /// file does not exist
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let settings = toml::from_str(&content)?;
        Ok(settings)
    }

    /// Session-manager configuration derived from these settings
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            agent_command: self.agent.command.clone(),
            agent_args: self.agent.args.clone(),
            idle_ttl: Duration::from_millis(self.idle_ttl_ms),
        }
    }
}
