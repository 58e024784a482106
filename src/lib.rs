//! dfstream - Real-time streaming noise suppression
//!
//! Pushes arbitrarily-sized chunks of 48 kHz mono PCM through a fixed-frame
//! transform (RNNoise by default) and fans the processed frames out to
//! listeners, with bounded buffers and a graceful drain on shutdown.

#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::let_underscore_must_use)]

pub mod audio;
#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod defaults;
pub mod error;
pub mod pipeline;
pub mod streaming;
pub mod transform;

#[cfg(feature = "cli")]
pub mod app;

// Core traits (transform → listeners)
pub use pipeline::listener::FrameListener;
pub use transform::FrameTransform;

// Pipeline
pub use pipeline::orchestrator::{PipelineConfig, PipelineState, StreamPipeline};
pub use pipeline::dispatch::{DeliveryPolicy, Dispatcher};
pub use pipeline::stats::PipelineStats;

// Error handling
pub use error::{DfStreamError, Result};

// Config
pub use config::Config;

// Agent framework (for advanced users)
pub use pipeline::agent::Agent;
pub use pipeline::error::{ErrorReporter, StationError};

/// Build version string with optional git commit hash.
///
/// Returns `"0.1.0+abc1234"` when git hash is available, `"0.1.0"` otherwise.
pub fn version_string() -> String {
    let version = env!("CARGO_PKG_VERSION");
    match option_env!("GIT_HASH") {
        Some(hash) if !hash.is_empty() => format!("{}+{}", version, hash),
        _ => version.to_string(),
    }
}
