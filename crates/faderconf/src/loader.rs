//! Config file discovery, loading, and environment variable overlay.

use crate::sections::{
    ConsoleConfig, MeteringConfig, ReconnectConfig, TelemetryConfig, TimeoutConfig,
};
use crate::{ConfigError, FaderConfig};
use std::path::{Path, PathBuf};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

/// Discover config files, optionally with a CLI override path.
///
/// If `cli_path` is provided it replaces the local override, and must exist.
/// Returns paths in load order (system, user, local/cli).
pub fn discover_config_files_with_override(
    cli_path: Option<&Path>,
) -> Result<Vec<PathBuf>, ConfigError> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/faderwire/config.toml");
    if system.exists() {
        files.push(system);
    }

    // XDG_CONFIG_HOME or ~/.config
    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("faderwire/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = cli_path {
        if !path.exists() {
            return Err(ConfigError::FileRead {
                path: path.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such config file"),
            });
        }
        files.push(path.to_path_buf());
        return Ok(files);
    }

    let local = PathBuf::from("faderwire.toml");
    if local.exists() {
        files.push(local);
    }

    Ok(files)
}

/// Merge `files` in order over the defaults, then apply overrides from `lookup`.
///
/// `lookup` is `std::env::var` in production; tests pass a map.
pub fn load_layers<F>(files: &[PathBuf], lookup: F) -> Result<(FaderConfig, ConfigSources), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut sources = ConfigSources::default();
    let mut config = FaderConfig::default();

    for path in files {
        let file_config = load_from_file(path)?;
        config = merge_configs(config, file_config);
        sources.files.push(path.clone());
    }

    apply_env_overrides(&mut config, &mut sources, lookup)?;
    config.validate()?;

    Ok((config, sources))
}

/// Load config from a TOML file.
pub fn load_from_file(path: &Path) -> Result<FaderConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    parse_toml(&contents, path)
}

fn parse_toml(contents: &str, path: &Path) -> Result<FaderConfig, ConfigError> {
    toml::from_str(contents).map_err(|e: toml::de::Error| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Overlay value wins unless it is still the compiled default.
fn pick<T: PartialEq>(base: T, overlay: T, default: T) -> T {
    if overlay != default {
        overlay
    } else {
        base
    }
}

/// Merge two configs, with `overlay` taking precedence.
pub fn merge_configs(base: FaderConfig, overlay: FaderConfig) -> FaderConfig {
    let console = ConsoleConfig::default();
    let timeouts = TimeoutConfig::default();
    let reconnect = ReconnectConfig::default();
    let metering = MeteringConfig::default();
    let telemetry = TelemetryConfig::default();

    FaderConfig {
        console: ConsoleConfig {
            endpoint: pick(base.console.endpoint, overlay.console.endpoint, console.endpoint),
            name: pick(base.console.name, overlay.console.name, console.name),
        },
        timeouts: TimeoutConfig {
            request_ms: pick(base.timeouts.request_ms, overlay.timeouts.request_ms, timeouts.request_ms),
            replay_ms: pick(base.timeouts.replay_ms, overlay.timeouts.replay_ms, timeouts.replay_ms),
        },
        reconnect: ReconnectConfig {
            base_ms: pick(base.reconnect.base_ms, overlay.reconnect.base_ms, reconnect.base_ms),
            max_ms: pick(base.reconnect.max_ms, overlay.reconnect.max_ms, reconnect.max_ms),
            jitter: pick(base.reconnect.jitter, overlay.reconnect.jitter, reconnect.jitter),
            max_attempts: overlay.reconnect.max_attempts.or(base.reconnect.max_attempts),
        },
        metering: MeteringConfig {
            queue_depth: pick(
                base.metering.queue_depth,
                overlay.metering.queue_depth,
                metering.queue_depth,
            ),
        },
        telemetry: TelemetryConfig {
            log_level: pick(
                base.telemetry.log_level,
                overlay.telemetry.log_level,
                telemetry.log_level,
            ),
            otlp_endpoint: overlay.telemetry.otlp_endpoint.or(base.telemetry.otlp_endpoint),
        },
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        key: key.to_string(),
        message: format!("{:?}: {}", raw, e),
    })
}

/// Apply environment variable overrides to config.
///
/// Unparseable numbers are an error rather than silently ignored.
pub fn apply_env_overrides<F>(
    config: &mut FaderConfig,
    sources: &mut ConfigSources,
    lookup: F,
) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut take = |key: &str| {
        let v = lookup(key);
        if v.is_some() {
            sources.env_overrides.push(key.to_string());
        }
        v
    };

    // Console
    if let Some(v) = take("FADERWIRE_ENDPOINT") {
        config.console.endpoint = v;
    }
    if let Some(v) = take("FADERWIRE_CONSOLE_NAME") {
        config.console.name = v;
    }

    // Timeouts
    if let Some(v) = take("FADERWIRE_REQUEST_TIMEOUT_MS") {
        config.timeouts.request_ms = parse_env("FADERWIRE_REQUEST_TIMEOUT_MS", &v)?;
    }
    if let Some(v) = take("FADERWIRE_REPLAY_TIMEOUT_MS") {
        config.timeouts.replay_ms = parse_env("FADERWIRE_REPLAY_TIMEOUT_MS", &v)?;
    }

    // Reconnect
    if let Some(v) = take("FADERWIRE_RECONNECT_BASE_MS") {
        config.reconnect.base_ms = parse_env("FADERWIRE_RECONNECT_BASE_MS", &v)?;
    }
    if let Some(v) = take("FADERWIRE_RECONNECT_MAX_MS") {
        config.reconnect.max_ms = parse_env("FADERWIRE_RECONNECT_MAX_MS", &v)?;
    }
    if let Some(v) = take("FADERWIRE_RECONNECT_JITTER") {
        config.reconnect.jitter = parse_env("FADERWIRE_RECONNECT_JITTER", &v)?;
    }
    if let Some(v) = take("FADERWIRE_RECONNECT_MAX_ATTEMPTS") {
        config.reconnect.max_attempts = Some(parse_env("FADERWIRE_RECONNECT_MAX_ATTEMPTS", &v)?);
    }

    // Metering
    if let Some(v) = take("FADERWIRE_METER_QUEUE_DEPTH") {
        config.metering.queue_depth = parse_env("FADERWIRE_METER_QUEUE_DEPTH", &v)?;
    }

    // Telemetry
    if let Some(v) = take("FADERWIRE_OTLP_ENDPOINT") {
        config.telemetry.otlp_endpoint = Some(v);
    }
    // Also support standard OTEL env var
    if let Some(v) = take("OTEL_EXPORTER_OTLP_ENDPOINT") {
        config.telemetry.otlp_endpoint = Some(v);
    }
    if let Some(v) = take("FADERWIRE_LOG_LEVEL") {
        config.telemetry.log_level = v;
    }
    // Also support RUST_LOG
    if let Some(v) = take("RUST_LOG") {
        config.telemetry.log_level = v;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_parse_minimal_toml() {
        let toml = r#"
[console]
endpoint = "ws://desk.local/ws"
"#;
        let config = parse_toml(toml, Path::new("test.toml")).unwrap();
        assert_eq!(config.console.endpoint, "ws://desk.local/ws");
        // Other values should be defaults
        assert_eq!(config.console.name, "console");
        assert_eq!(config.timeouts.request_ms, 5000);
    }

    #[test]
    fn test_parse_error_names_file() {
        let err = parse_toml("[console\nendpoint=", Path::new("broken.toml")).unwrap_err();
        assert!(err.to_string().contains("broken.toml"));
    }

    #[test]
    fn test_merge_keeps_base_when_overlay_is_default() {
        let mut base = FaderConfig::default();
        base.console.endpoint = "ws://system/ws".into();
        base.reconnect.max_attempts = Some(3);

        let mut overlay = FaderConfig::default();
        overlay.console.name = "monitor".into();

        let merged = merge_configs(base, overlay);
        assert_eq!(merged.console.endpoint, "ws://system/ws");
        assert_eq!(merged.console.name, "monitor");
        assert_eq!(merged.reconnect.max_attempts, Some(3));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("FADERWIRE_ENDPOINT", "ws://env/ws"),
            ("FADERWIRE_RECONNECT_MAX_ATTEMPTS", "7"),
            ("RUST_LOG", "debug"),
        ]);
        let mut config = FaderConfig::default();
        let mut sources = ConfigSources::default();
        apply_env_overrides(&mut config, &mut sources, |k| {
            env.get(k).map(|v| v.to_string())
        })
        .unwrap();

        assert_eq!(config.console.endpoint, "ws://env/ws");
        assert_eq!(config.reconnect.max_attempts, Some(7));
        assert_eq!(config.telemetry.log_level, "debug");
        assert_eq!(sources.env_overrides.len(), 3);
    }

    #[test]
    fn test_env_rejects_bad_number() {
        let mut config = FaderConfig::default();
        let mut sources = ConfigSources::default();
        let err = apply_env_overrides(&mut config, &mut sources, |k| {
            (k == "FADERWIRE_METER_QUEUE_DEPTH").then(|| "lots".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "FADERWIRE_METER_QUEUE_DEPTH"));
    }

    #[test]
    fn test_no_files_no_env_is_default() {
        let (config, sources) = load_layers(&[], no_env).unwrap();
        assert_eq!(config, FaderConfig::default());
        assert!(sources.files.is_empty());
    }
}
