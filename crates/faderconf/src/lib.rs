//! Configuration loading for faderwire.
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins):
//! 1. `/etc/faderwire/config.toml` (system)
//! 2. `~/.config/faderwire/config.toml` (user)
//! 3. `./faderwire.toml` (local override, or the `--config` path)
//! 4. Environment variables (`FADERWIRE_*`, plus `RUST_LOG` and
//!    `OTEL_EXPORTER_OTLP_ENDPOINT`)
//!
//! # Example Config
//!
//! ```toml
//! [console]
//! endpoint = "ws://192.168.1.50:8080/ws"
//! name = "foh"
//!
//! [timeouts]
//! request_ms = 3000
//!
//! [reconnect]
//! base_ms = 500
//! max_ms = 30000
//! max_attempts = 20
//!
//! [metering]
//! queue_depth = 1
//!
//! [telemetry]
//! log_level = "faderwire=debug,info"
//! otlp_endpoint = "127.0.0.1:4317"
//! ```

pub mod loader;
pub mod sections;

pub use loader::{discover_config_files_with_override, ConfigSources};
pub use sections::{
    ConsoleConfig, MeteringConfig, ReconnectConfig, TelemetryConfig, TimeoutConfig,
};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid value for {key}: {message}")]
    Invalid { key: String, message: String },
}

/// Complete faderwire configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct FaderConfig {
    #[serde(default)]
    pub console: ConsoleConfig,

    #[serde(default)]
    pub timeouts: TimeoutConfig,

    #[serde(default)]
    pub reconnect: ReconnectConfig,

    #[serde(default)]
    pub metering: MeteringConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl FaderConfig {
    /// Load configuration from all sources.
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load configuration, with `config_path` replacing `./faderwire.toml`.
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load configuration from optional path and return information about sources.
    pub fn load_with_sources_from(
        config_path: Option<&Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let files = loader::discover_config_files_with_override(config_path)?;
        loader::load_layers(&files, |key| std::env::var(key).ok())
    }

    /// Reject values the client can't run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.console.endpoint.is_empty() {
            return Err(ConfigError::Invalid {
                key: "console.endpoint".into(),
                message: "must not be empty".into(),
            });
        }
        if self.metering.queue_depth == 0
            || self.metering.queue_depth > MeteringConfig::MAX_QUEUE_DEPTH
        {
            return Err(ConfigError::Invalid {
                key: "metering.queue_depth".into(),
                message: format!(
                    "{} is outside 1..={}",
                    self.metering.queue_depth,
                    MeteringConfig::MAX_QUEUE_DEPTH
                ),
            });
        }
        if self.reconnect.base_ms == 0 || self.reconnect.base_ms > self.reconnect.max_ms {
            return Err(ConfigError::Invalid {
                key: "reconnect.base_ms".into(),
                message: format!(
                    "{} must be positive and no larger than max_ms ({})",
                    self.reconnect.base_ms, self.reconnect.max_ms
                ),
            });
        }
        if self.timeouts.request_ms == 0 || self.timeouts.replay_ms == 0 {
            return Err(ConfigError::Invalid {
                key: "timeouts".into(),
                message: "deadlines must be positive".into(),
            });
        }
        Ok(())
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> String {
        let mut output = String::from("# faderwire configuration\n\n");
        match toml::to_string_pretty(self) {
            Ok(body) => output.push_str(&body),
            Err(e) => output.push_str(&format!("# failed to render: {}\n", e)),
        }
        output
    }
}
