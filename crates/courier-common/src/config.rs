//! ---
//! courier_section: "01-core-functionality"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Shared primitives and utilities for courier components."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSecondsWithFrac};
use tracing::debug;

use crate::logging::LogFormat;

fn default_host() -> String {
    "localhost".to_owned()
}

fn default_user() -> String {
    "guest".to_owned()
}

fn default_password() -> String {
    "guest".to_owned()
}

fn default_vhost() -> String {
    "/".to_owned()
}

fn default_rpc_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_retry() -> u32 {
    4
}

fn default_poll_timeout() -> Duration {
    Duration::from_secs(1)
}

fn default_log_format() -> LogFormat {
    LogFormat::Pretty
}

/// Primary configuration object injected into courier components.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CourierConfig {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub rpc: RpcConfig,
    #[serde(default)]
    pub consumer: ConsumerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Metadata describing where a [`CourierConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedCourierConfig {
    pub config: CourierConfig,
    pub source: PathBuf,
}

impl CourierConfig {
    pub const ENV_CONFIG_PATH: &str = "COURIER_CONFIG";
    pub const ENV_HOST: &str = "COURIER_HOST";
    pub const ENV_VHOST: &str = "COURIER_VHOST";
    pub const ENV_USER: &str = "COURIER_USER";
    pub const ENV_PASSWORD: &str = "COURIER_PASSWORD";
    pub const ENV_DEBUG_MODE: &str = "COURIER_DEBUG_MODE";

    /// Load configuration from disk, respecting the `COURIER_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedCourierConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedCourierConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedCourierConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    /// Parse and validate a TOML configuration file.
    pub fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<CourierConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by the `COURIER_*` environment variables.
    ///
    /// Meant for process entry points only.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides(|key| std::env::var(key).ok())
    }

    /// Apply environment style overrides resolved through `lookup`.
    pub fn with_env_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup(Self::ENV_HOST) {
            self.broker.host = host;
        }
        if let Some(vhost) = lookup(Self::ENV_VHOST) {
            self.broker.vhost = vhost;
        }
        if let Some(user) = lookup(Self::ENV_USER) {
            self.broker.user = user;
        }
        if let Some(password) = lookup(Self::ENV_PASSWORD) {
            self.broker.password = password;
        }
        if let Some(debug_mode) = lookup(Self::ENV_DEBUG_MODE) {
            self.logging.debug = debug_mode.trim().eq_ignore_ascii_case("true");
        }
        self
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.broker.validate()?;
        self.rpc.validate()?;
        Ok(())
    }
}

impl std::str::FromStr for CourierConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: CourierConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Broker connection parameters (host, credentials, virtual host).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default = "default_password")]
    pub password: String,
    #[serde(default = "default_vhost")]
    pub vhost: String,
}

impl BrokerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(anyhow!("broker host must not be empty"));
        }
        if self.vhost.trim().is_empty() {
            return Err(anyhow!("broker vhost must not be empty"));
        }
        Ok(())
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            user: default_user(),
            password: default_password(),
            vhost: default_vhost(),
        }
    }
}

/// Producer side RPC policy.
#[serde_as]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RpcConfig {
    /// Wait for one reply before retrying.
    #[serde(default = "default_rpc_timeout")]
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub timeout: Duration,
    /// Additional send+wait cycles after the first timeout.
    #[serde(default = "default_max_retry")]
    pub max_retry: u32,
}

impl RpcConfig {
    pub fn validate(&self) -> Result<()> {
        if self.timeout.is_zero() {
            return Err(anyhow!("rpc timeout must be greater than zero"));
        }
        Ok(())
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            timeout: default_rpc_timeout(),
            max_retry: default_max_retry(),
        }
    }
}

/// Consumer side polling.
#[serde_as]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Longest a processor step blocks waiting for one delivery.
    #[serde(default = "default_poll_timeout")]
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub poll_timeout: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            poll_timeout: default_poll_timeout(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Raise the default filter from `info` to `debug`.
    #[serde(default)]
    pub debug: bool,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    /// Directory for the rolling log file; stdout only when unset.
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            debug: false,
            format: default_log_format(),
            directory: None,
            file_prefix: None,
        }
    }
}
