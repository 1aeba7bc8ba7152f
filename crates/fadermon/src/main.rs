//! fadermon - watch and poke a mixing console from the shell
//!
//! Subcommands:
//! - `fadermon watch <pattern>...` - Print parameter changes as they happen
//! - `fadermon get <path>` - Read one value
//! - `fadermon set <path> <value>` - Write one value
//! - `fadermon meter <path>` - Print a metering stream
//! - `fadermon info` - Console identity and application state
//! - `fadermon config` - Print the effective configuration

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use faderconf::FaderConfig;
use faderproto::{MeteringEncoding, ValueFormat};

use fadermon::{commands, telemetry};

#[derive(Parser)]
#[command(name = "fadermon")]
#[command(about = "Watch and control a mixing console")]
#[command(version)]
struct Cli {
    /// Config file (replaces ./faderwire.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Console endpoint, overriding configuration (e.g., ws://127.0.0.1:8080/ws)
    #[arg(short, long, global = true)]
    endpoint: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print parameter changes under one or more patterns
    Watch {
        /// Patterns such as ch.*.mix.lvl or ch.0.**
        #[arg(required = true)]
        patterns: Vec<String>,

        /// val (engineering units) or norm (0..1)
        #[arg(short, long, default_value = "val")]
        format: ValueFormat,
    },

    /// Read one parameter
    Get {
        path: String,

        #[arg(short, long, default_value = "val")]
        format: ValueFormat,

        /// Print the full mirrored value as JSON
        #[arg(long)]
        json: bool,
    },

    /// Write one parameter
    Set {
        path: String,

        /// true/false, a number, or text
        value: String,

        /// Treat value as a 0..1 position
        #[arg(short, long)]
        normalized: bool,
    },

    /// Print metering frames
    Meter {
        path: String,

        /// json or binary
        #[arg(long, default_value = "binary")]
        encoding: MeteringEncoding,

        /// Stop after this many frames
        #[arg(short = 'n', long)]
        count: Option<usize>,
    },

    /// Show console identity and application state
    Info,

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (mut config, sources) = FaderConfig::load_with_sources_from(cli.config.as_deref())?;
    if let Some(endpoint) = cli.endpoint {
        config.console.endpoint = endpoint;
    }

    // Keep `config` output clean of log lines
    if !matches!(cli.command, Commands::Config) {
        telemetry::init(&config.telemetry)?;
    }

    match cli.command {
        Commands::Watch { patterns, format } => {
            commands::watch(&config, &patterns, format).await?;
        }
        Commands::Get { path, format, json } => {
            commands::get(&config, &path, format, json).await?;
        }
        Commands::Set {
            path,
            value,
            normalized,
        } => {
            commands::set(&config, &path, &value, normalized).await?;
        }
        Commands::Meter {
            path,
            encoding,
            count,
        } => {
            commands::meter(&config, &path, encoding, count).await?;
        }
        Commands::Info => {
            commands::info(&config).await?;
        }
        Commands::Config => {
            commands::show_config(&config, &sources);
        }
    }

    Ok(())
}
