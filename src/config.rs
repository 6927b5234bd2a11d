//! Configuration management.
//!
//! Settings are layered: command line flag, then `WARREN_*` environment
//! variable (both handled by clap), then the TOML config file, then the
//! built-in default. The file lives at the platform config directory
//! (`~/.config/warren/config.toml` on Linux) unless `--config` says otherwise.

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::client::RetryPolicy;
use crate::error::WarrenError;
use crate::protocol::DEFAULT_UNAVAILABLE_MESSAGE;
use crate::server::PairingPolicy;

pub const DEFAULT_CONTROL_ADDR: &str = "0.0.0.0:9000";
pub const DEFAULT_PUBLIC_ADDR: &str = "0.0.0.0:8000";
pub const DEFAULT_POOL_CAPACITY: usize = 100;
pub const DEFAULT_PAIRING_WAIT_MS: u64 = 2000;

pub const DEFAULT_RELAY_ADDR: &str = "127.0.0.1:9000";
pub const DEFAULT_LOCAL_ADDR: &str = "localhost:8000";
pub const DEFAULT_POOL_SIZE: usize = 25;
pub const DEFAULT_RETRY_INTERVAL_MS: u64 = 3000;
pub const DEFAULT_RETRY_JITTER_MS: u64 = 0;
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

pub const DEFAULT_FORWARD_LISTEN_ADDR: &str = "127.0.0.1:8000";
pub const DEFAULT_FORWARD_TARGET_ADDR: &str = "127.0.0.1:9000";

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub forward: ForwardConfig,
}

/// How the public side claims a tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum PairingMode {
    /// Reply 503 at once when no tunnel is idle
    FailFast,
    /// Wait up to `pairing_wait_ms` for a tunnel to show up
    Wait,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayConfig {
    pub control_addr: Option<String>,
    pub public_addr: Option<String>,
    pub pool_capacity: Option<usize>,
    pub pairing: Option<PairingMode>,
    pub pairing_wait_ms: Option<u64>,
    pub unavailable_message: Option<String>,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub relay_addr: Option<String>,
    pub local_addr: Option<String>,
    pub pool_size: Option<usize>,
    pub retry_interval_ms: Option<u64>,
    pub retry_jitter_ms: Option<u64>,
    /// Unset means retry forever
    pub retry_max_attempts: Option<u32>,
    pub chunk_size: Option<usize>,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardConfig {
    pub listen_addr: Option<String>,
    pub target_addr: Option<String>,
}

impl Config {
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, self.to_toml()?)
            .with_context(|| format!("Failed to write config file: {}", path.display()))
    }

    /// Write [`Config::with_defaults`] to `path`, keeping an existing file
    /// unless `force` is set
    pub fn init_file(path: &Path, force: bool) -> Result<()> {
        if path.exists() && !force {
            anyhow::bail!(
                "Config file already exists at {}. Use --force to overwrite it.",
                path.display()
            );
        }
        Self::with_defaults().save_to(path)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }

    pub fn config_path() -> Result<PathBuf> {
        let proj_dirs =
            ProjectDirs::from("", "", "warren").context("Could not determine config directory")?;

        Ok(proj_dirs.config_dir().join("config.toml"))
    }

    /// A config with every key spelled out at its default
    pub fn with_defaults() -> Self {
        Self {
            relay: RelayConfig {
                control_addr: Some(DEFAULT_CONTROL_ADDR.to_string()),
                public_addr: Some(DEFAULT_PUBLIC_ADDR.to_string()),
                pool_capacity: Some(DEFAULT_POOL_CAPACITY),
                pairing: Some(PairingMode::FailFast),
                pairing_wait_ms: Some(DEFAULT_PAIRING_WAIT_MS),
                unavailable_message: Some(DEFAULT_UNAVAILABLE_MESSAGE.to_string()),
            },
            agent: AgentConfig {
                relay_addr: Some(DEFAULT_RELAY_ADDR.to_string()),
                local_addr: Some(DEFAULT_LOCAL_ADDR.to_string()),
                pool_size: Some(DEFAULT_POOL_SIZE),
                retry_interval_ms: Some(DEFAULT_RETRY_INTERVAL_MS),
                retry_jitter_ms: Some(DEFAULT_RETRY_JITTER_MS),
                retry_max_attempts: None,
                chunk_size: Some(DEFAULT_CHUNK_SIZE),
            },
            forward: ForwardConfig {
                listen_addr: Some(DEFAULT_FORWARD_LISTEN_ADDR.to_string()),
                target_addr: Some(DEFAULT_FORWARD_TARGET_ADDR.to_string()),
            },
        }
    }
}

/// Resolved relay settings
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub control_addr: String,
    pub public_addr: String,
    pub pool_capacity: usize,
    pub pairing: PairingPolicy,
    pub unavailable_message: String,
}

impl RelaySettings {
    /// Resolve `overrides` (flags and env) on top of the file section
    pub fn resolve(overrides: RelayConfig, file: &RelayConfig) -> Result<Self, WarrenError> {
        let file = file.clone();
        let pool_capacity = overrides
            .pool_capacity
            .or(file.pool_capacity)
            .unwrap_or(DEFAULT_POOL_CAPACITY);
        require_positive("relay.pool_capacity", pool_capacity)?;

        let wait = Duration::from_millis(
            overrides
                .pairing_wait_ms
                .or(file.pairing_wait_ms)
                .unwrap_or(DEFAULT_PAIRING_WAIT_MS),
        );
        let pairing = match overrides
            .pairing
            .or(file.pairing)
            .unwrap_or(PairingMode::FailFast)
        {
            PairingMode::FailFast => PairingPolicy::FailFast,
            PairingMode::Wait => PairingPolicy::Wait(wait),
        };

        Ok(Self {
            control_addr: overrides
                .control_addr
                .or(file.control_addr)
                .unwrap_or_else(|| DEFAULT_CONTROL_ADDR.to_string()),
            public_addr: overrides
                .public_addr
                .or(file.public_addr)
                .unwrap_or_else(|| DEFAULT_PUBLIC_ADDR.to_string()),
            pool_capacity,
            pairing,
            unavailable_message: overrides
                .unavailable_message
                .or(file.unavailable_message)
                .unwrap_or_else(|| DEFAULT_UNAVAILABLE_MESSAGE.to_string()),
        })
    }
}

/// Resolved agent settings
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub relay_addr: String,
    pub local_addr: String,
    pub pool_size: usize,
    pub retry: RetryPolicy,
    pub chunk_size: usize,
}

impl AgentSettings {
    pub fn resolve(overrides: AgentConfig, file: &AgentConfig) -> Result<Self, WarrenError> {
        let file = file.clone();
        let pool_size = overrides
            .pool_size
            .or(file.pool_size)
            .unwrap_or(DEFAULT_POOL_SIZE);
        require_positive("agent.pool_size", pool_size)?;

        let chunk_size = overrides
            .chunk_size
            .or(file.chunk_size)
            .unwrap_or(DEFAULT_CHUNK_SIZE);
        require_positive("agent.chunk_size", chunk_size)?;

        let interval = overrides
            .retry_interval_ms
            .or(file.retry_interval_ms)
            .unwrap_or(DEFAULT_RETRY_INTERVAL_MS);
        let jitter = overrides
            .retry_jitter_ms
            .or(file.retry_jitter_ms)
            .unwrap_or(DEFAULT_RETRY_JITTER_MS);

        Ok(Self {
            relay_addr: overrides
                .relay_addr
                .or(file.relay_addr)
                .unwrap_or_else(|| DEFAULT_RELAY_ADDR.to_string()),
            local_addr: overrides
                .local_addr
                .or(file.local_addr)
                .unwrap_or_else(|| DEFAULT_LOCAL_ADDR.to_string()),
            pool_size,
            retry: RetryPolicy::fixed(Duration::from_millis(interval))
                .with_jitter(Duration::from_millis(jitter))
                .with_max_attempts(overrides.retry_max_attempts.or(file.retry_max_attempts)),
            chunk_size,
        })
    }
}

/// Resolved port forwarder settings
#[derive(Debug, Clone)]
pub struct ForwardSettings {
    pub listen_addr: String,
    pub target_addr: String,
}

impl ForwardSettings {
    pub fn resolve(overrides: ForwardConfig, file: &ForwardConfig) -> Self {
        let file = file.clone();
        Self {
            listen_addr: overrides
                .listen_addr
                .or(file.listen_addr)
                .unwrap_or_else(|| DEFAULT_FORWARD_LISTEN_ADDR.to_string()),
            target_addr: overrides
                .target_addr
                .or(file.target_addr)
                .unwrap_or_else(|| DEFAULT_FORWARD_TARGET_ADDR.to_string()),
        }
    }
}

fn require_positive(key: &str, value: usize) -> Result<(), WarrenError> {
    if value == 0 {
        return Err(WarrenError::InvalidConfig(format!(
            "{} must be at least 1",
            key
        )));
    }
    Ok(())
}
