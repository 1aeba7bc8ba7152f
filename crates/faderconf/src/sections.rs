//! Config sections. Every field has a default so a partial file is valid.

use serde::{Deserialize, Serialize};

/// Which console to talk to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsoleConfig {
    /// WebSocket endpoint of the console control server.
    /// Default: ws://127.0.0.1:8080/ws
    #[serde(default = "ConsoleConfig::default_endpoint")]
    pub endpoint: String,

    /// Name used in logs to tell clients apart.
    /// Default: console
    #[serde(default = "ConsoleConfig::default_name")]
    pub name: String,
}

impl ConsoleConfig {
    fn default_endpoint() -> String {
        "ws://127.0.0.1:8080/ws".to_string()
    }

    fn default_name() -> String {
        "console".to_string()
    }
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            endpoint: Self::default_endpoint(),
            name: Self::default_name(),
        }
    }
}

/// Deadlines, in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Default deadline for GET/SET/SUBSCRIBE/UNSUBSCRIBE.
    /// Default: 5000
    #[serde(default = "TimeoutConfig::default_request_ms")]
    pub request_ms: u64,

    /// Deadline for each subscription replayed after a reconnect.
    /// Default: 5000
    #[serde(default = "TimeoutConfig::default_replay_ms")]
    pub replay_ms: u64,
}

impl TimeoutConfig {
    fn default_request_ms() -> u64 {
        5000
    }

    fn default_replay_ms() -> u64 {
        5000
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request_ms: Self::default_request_ms(),
            replay_ms: Self::default_replay_ms(),
        }
    }
}

/// Reconnect backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// First retry delay.
    /// Default: 500
    #[serde(default = "ReconnectConfig::default_base_ms")]
    pub base_ms: u64,

    /// Ceiling for the exponential delay.
    /// Default: 30000
    #[serde(default = "ReconnectConfig::default_max_ms")]
    pub max_ms: u64,

    /// Randomize each delay within [delay/2, delay].
    /// Default: true
    #[serde(default = "ReconnectConfig::default_jitter")]
    pub jitter: bool,

    /// Give up after this many consecutive failures. Unset retries forever.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
}

impl ReconnectConfig {
    fn default_base_ms() -> u64 {
        500
    }

    fn default_max_ms() -> u64 {
        30_000
    }

    fn default_jitter() -> bool {
        true
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_ms: Self::default_base_ms(),
            max_ms: Self::default_max_ms(),
            jitter: Self::default_jitter(),
            max_attempts: None,
        }
    }
}

/// Metering delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeteringConfig {
    /// Frames buffered per metering consumer before the oldest is dropped (1 or 2).
    /// Default: 2
    #[serde(default = "MeteringConfig::default_queue_depth")]
    pub queue_depth: usize,
}

impl MeteringConfig {
    pub const MAX_QUEUE_DEPTH: usize = 2;

    fn default_queue_depth() -> usize {
        2
    }
}

impl Default for MeteringConfig {
    fn default() -> Self {
        Self {
            queue_depth: Self::default_queue_depth(),
        }
    }
}

/// Telemetry and observability configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level or filter directive (trace, debug, info, warn, error).
    /// Default: info
    #[serde(default = "TelemetryConfig::default_log_level")]
    pub log_level: String,

    /// OTLP gRPC endpoint. Unset means console logging only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub otlp_endpoint: Option<String>,
}

impl TelemetryConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
            otlp_endpoint: None,
        }
    }
}
