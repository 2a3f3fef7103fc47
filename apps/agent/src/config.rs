//! Agent configuration.
//!
//! A single TOML file. The `[agent]` table configures this binary; every
//! other key is the channel configuration, passed to account resolution as
//! JSON:
//!
//! ```toml
//! [agent]
//! echo_replies = true
//!
//! [accounts.main]
//! cloudUrl = "wss://cloud.example/ws/device"
//! deviceId = "dev-1"
//! deviceSecret = "..."
//! ```
//!
//! Default location:
//! - Linux: `~/.config/cloudlink/agent.toml`
//! - Windows: `%APPDATA%/cloudlink/agent.toml`

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Environment variable overriding the config path.
pub const CONFIG_ENV: &str = "CLOUDLINK_CONFIG";

/// Settings for the binary itself.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct AgentSettings {
    /// Answer every inbound message with its own body.
    #[serde(default)]
    pub echo_replies: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub agent: AgentSettings,
    /// Raw channel configuration.
    pub channel: serde_json::Value,
}

impl Config {
    /// Reads and parses the file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            anyhow::bail!("config file not found: {}", path.display());
        }
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let mut table: toml::Table = toml::from_str(content)?;
        let agent = match table.remove("agent") {
            Some(value) => value.try_into()?,
            None => AgentSettings::default(),
        };
        let channel = serde_json::to_value(table)?;
        Ok(Self { agent, channel })
    }
}

/// CLI argument, then the environment, then the platform default.
pub fn config_path(arg: Option<String>, env: Option<String>) -> PathBuf {
    arg.or(env)
        .filter(|p| !p.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(default_config_path)
}

fn default_config_path() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        PathBuf::from(home)
            .join(".config")
            .join("cloudlink")
            .join("agent.toml")
    }

    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        PathBuf::from(appdata).join("cloudlink").join("agent.toml")
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        PathBuf::from("/tmp/cloudlink/agent.toml")
    }
}
