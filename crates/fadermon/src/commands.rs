//! CLI command implementations

use std::time::Duration;

use anyhow::{bail, Context, Result};
use faderconf::{ConfigSources, FaderConfig};
use faderproto::{MeteringEncoding, MeteringFrame, ParamValue, ValueFormat};
use faderwire::{ConnectionState, ConsoleClient, ParameterValue};
use futures::stream::{self, StreamExt};
use tracing::{info, warn};

/// Validate that an endpoint looks like a WebSocket URL
fn validate_endpoint(endpoint: &str) -> Result<()> {
    if !endpoint.starts_with("ws://") && !endpoint.starts_with("wss://") {
        bail!(
            "Invalid endpoint: '{}'\n\n\
             Console endpoints are WebSocket URLs like:\n  \
             ws://127.0.0.1:8080/ws\n  \
             wss://console.local/ws",
            endpoint
        );
    }
    Ok(())
}

/// Connect and wait for the session to come up.
async fn connect(config: &FaderConfig) -> Result<ConsoleClient> {
    validate_endpoint(&config.console.endpoint)?;
    let client = ConsoleClient::connect(config);
    let deadline = Duration::from_millis(config.timeouts.request_ms);
    client
        .wait_for_state(ConnectionState::Connected, deadline)
        .await
        .with_context(|| format!("Could not connect to {}", config.console.endpoint))?;
    info!("Connected to {}", config.console.endpoint);
    Ok(client)
}

pub fn format_value(value: &ParameterValue) -> String {
    let mut line = format!("{} [{}] = {}", value.path, value.format, value.value);
    if value.stale {
        line.push_str(" (stale)");
    }
    line
}

pub fn format_frame(frame: &MeteringFrame) -> String {
    let samples: Vec<String> = frame
        .channel_samples
        .iter()
        .map(|s| format!("{:7.2}", s))
        .collect();
    format!("#{:<6} {}", frame.sequence, samples.join(" "))
}

/// Print every change under `patterns` until interrupted.
pub async fn watch(config: &FaderConfig, patterns: &[String], format: ValueFormat) -> Result<()> {
    let client = connect(config).await?;

    let mut streams = Vec::new();
    for pattern in patterns {
        let sub = client
            .subscribe(pattern, format)
            .await
            .with_context(|| format!("Failed to subscribe to {}", pattern))?;
        streams.push(
            stream::unfold(sub, |mut sub| async move { sub.recv().await.map(|v| (v, sub)) })
                .boxed(),
        );
    }
    let mut updates = stream::select_all(streams);
    let mut states = client.watch_state();

    loop {
        tokio::select! {
            update = updates.next() => match update {
                Some(value) => println!("{}", format_value(&value)),
                None => break,
            },
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                if state != ConnectionState::Connected {
                    warn!("Connection {}; values are stale until it recovers", state);
                }
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    client.close().await;
    Ok(())
}

/// Fetch one value from the console.
pub async fn get(config: &FaderConfig, path: &str, format: ValueFormat, json: bool) -> Result<()> {
    let client = connect(config).await?;
    let value = client
        .fetch(path, format)
        .await
        .with_context(|| format!("GET {} failed", path))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        println!("{}", format_value(&value));
    }
    client.close().await;
    Ok(())
}

/// Write one value.
pub async fn set(config: &FaderConfig, path: &str, value: &str, normalized: bool) -> Result<()> {
    let client = connect(config).await?;

    let result = if normalized {
        let position: f64 = value
            .parse()
            .with_context(|| format!("'{}' is not a number", value))?;
        client.set_normalized(path, position).await
    } else {
        client.set_plain(path, ParamValue::parse_literal(value)).await
    };
    result.with_context(|| format!("SET {} failed", path))?;

    println!("{} <- {}", path, value);
    client.close().await;
    Ok(())
}

/// Print metering frames from `path`, stopping after `count` frames if given.
pub async fn meter(
    config: &FaderConfig,
    path: &str,
    encoding: MeteringEncoding,
    count: Option<usize>,
) -> Result<()> {
    let client = connect(config).await?;
    let meters = client
        .subscribe_metering(path, encoding)
        .await
        .with_context(|| format!("Failed to subscribe to meters at {}", path))?;

    let mut seen = 0usize;
    loop {
        tokio::select! {
            frame = meters.recv() => match frame {
                Some(frame) => {
                    println!("{}", format_frame(&frame));
                    seen += 1;
                    if count.is_some_and(|n| seen >= n) {
                        break;
                    }
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    info!("{} frames shown, {} superseded", seen, meters.dropped());
    client.unsubscribe_metering(meters).await.ok();
    client.close().await;
    Ok(())
}

/// Show console identity and application state.
pub async fn info(config: &FaderConfig) -> Result<()> {
    let client = connect(config).await?;
    let console = client
        .fetch_console_info()
        .await
        .context("Failed to read console.info")?;
    let state = client
        .fetch_app_state()
        .await
        .context("Failed to read app.state")?;

    let output = serde_json::json!({
        "endpoint": config.console.endpoint,
        "console": console,
        "app": state,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    client.close().await;
    Ok(())
}

/// Print the effective configuration and where it came from.
pub fn show_config(config: &FaderConfig, sources: &ConfigSources) {
    if sources.files.is_empty() {
        println!("# no config files found, using defaults");
    }
    for file in &sources.files {
        println!("# loaded {}", file.display());
    }
    for var in &sources.env_overrides {
        println!("# overridden by {}", var);
    }
    println!("{}", config.to_toml());
}
