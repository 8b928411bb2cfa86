//! `flatshm` command-line tool.
//!
//! Drives the three channel kinds with 4K RGB frames so producers and
//! consumers can be started as separate processes, and removes names left
//! behind by processes that did not shut down cleanly.

mod commands;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use flatshm::ChannelConfig;
use std::path::PathBuf;
use tracing::Level;

#[derive(Parser)]
#[command(name = "flatshm")]
#[command(about = "Shared memory frame transport tool", long_about = None)]
#[command(version)]
struct Cli {
    /// Set the logging level
    #[arg(short, long, value_enum, global = true, default_value = "info")]
    log_level: LogLevel,

    /// Path to a JSON channel configuration file
    #[arg(short, long, global = true, env = "FLATSHM_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

/// Channel synchronization scheme.
#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelKind {
    /// Semaphore-guarded segment with background snapshots
    Mutex,
    /// Capacity-1 producer/consumer hand-off
    Handoff,
    /// Sequence-locked segment, never blocks
    Seqlock,
}

#[derive(Subcommand)]
enum Commands {
    /// Write frames into a channel
    Produce {
        /// Channel name
        #[arg(short, long)]
        name: String,
        /// Channel kind
        #[arg(short, long, value_enum, default_value = "mutex")]
        kind: ChannelKind,
        /// Number of frames to write
        #[arg(short, long, default_value_t = 100)]
        frames: u64,
        /// Delay between frames in milliseconds
        #[arg(short, long, default_value_t = 33)]
        interval_ms: u64,
    },

    /// Read frames from a channel
    Consume {
        /// Channel name
        #[arg(short, long)]
        name: String,
        /// Channel kind
        #[arg(short, long, value_enum, default_value = "mutex")]
        kind: ChannelKind,
        /// Number of distinct frames to read
        #[arg(short, long, default_value_t = 100)]
        frames: u64,
    },

    /// Remove the segment and semaphore names of a channel
    Cleanup {
        /// Channel name
        #[arg(short, long)]
        name: String,
        /// Channel kind
        #[arg(short, long, value_enum, default_value = "mutex")]
        kind: ChannelKind,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<ChannelConfig> {
    let Some(path) = path else {
        return Ok(ChannelConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(
                    Level::from(cli.log_level).as_str().to_lowercase(),
                )
            }),
        )
        .with_target(false)
        .init();

    let config = load_config(cli.config.as_ref())?;
    tracing::debug!(?config, "channel configuration");

    match cli.command {
        Commands::Produce {
            name,
            kind,
            frames,
            interval_ms,
        } => commands::produce(&name, kind, frames, interval_ms, &config),
        Commands::Consume { name, kind, frames } => commands::consume(&name, kind, frames, &config),
        Commands::Cleanup { name, kind } => commands::cleanup(&name, kind),
    }
}
