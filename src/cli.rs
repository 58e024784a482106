//! Command-line interface for dfstream
//!
//! Provides argument parsing using clap derive macros.

use crate::defaults;
use crate::transform::TransformBackend;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

/// Real-time streaming noise suppression
#[derive(Parser, Debug)]
#[command(name = "dfstream", version, about = "Real-time streaming noise suppression")]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Path to configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Only print errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Verbose output (-v: lifecycle, -vv: debug, -vvv: trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Denoise a 48 kHz mono 16-bit WAV file through the streaming pipeline
    Denoise(DenoiseArgs),

    /// Print the effective configuration as TOML
    Config {
        /// Print the default config file path instead
        #[arg(long)]
        path: bool,
    },
}

/// Arguments for `dfstream denoise`
#[derive(clap::Args, Debug, Clone)]
pub struct DenoiseArgs {
    /// Input WAV file
    #[arg(value_name = "INPUT")]
    pub input: PathBuf,

    /// Output WAV file for the processed audio
    #[arg(short, long, value_name = "OUTPUT")]
    pub output: PathBuf,

    /// Also record the unprocessed input to this WAV file
    #[arg(long, value_name = "PATH")]
    pub original: Option<PathBuf>,

    /// Attenuation limit in dB (0 disables suppression, 100 is unlimited)
    #[arg(long, value_name = "DB")]
    pub atten_lim: Option<f32>,

    /// Transform backend (rnnoise, passthrough)
    #[arg(long, value_name = "BACKEND", value_parser = parse_backend)]
    pub backend: Option<TransformBackend>,

    /// Bytes per push into the pipeline
    #[arg(long, value_name = "BYTES", default_value_t = defaults::PUSH_CHUNK_BYTES)]
    pub chunk_bytes: usize,

    /// How long to wait for the pipeline to drain (e.g. 500ms, 10s, 1m) [default: 10s]
    #[arg(long, value_name = "DURATION", value_parser = parse_duration)]
    pub drain_timeout: Option<Duration>,
}

impl DenoiseArgs {
    /// Drain timeout, falling back to `defaults::DRAIN_TIMEOUT_SECS`.
    pub fn drain_timeout(&self) -> Duration {
        self.drain_timeout
            .unwrap_or(Duration::from_secs(defaults::DRAIN_TIMEOUT_SECS))
    }
}

fn parse_backend(s: &str) -> Result<TransformBackend, String> {
    s.parse::<TransformBackend>().map_err(|e| e.to_string())
}

/// Parse a duration string.
///
/// Supports any duration format accepted by `humantime`, plus bare numbers
/// (seconds).
fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(s).map_err(|e| e.to_string())
}
