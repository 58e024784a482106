//! Error types for dfstream.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DfStreamError {
    // Configuration errors
    #[error("Configuration file not found at {path}")]
    ConfigFileNotFound { path: String },

    #[error("Failed to parse configuration: {message}")]
    ConfigParse { message: String },

    #[error("Invalid configuration value for {key}: {message}")]
    ConfigInvalidValue { key: String, message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    // Construction errors
    #[error("Unsupported audio format: expected {expected}, got {actual}")]
    UnsupportedFormat { expected: String, actual: String },

    #[error("Capacity misconfigured: {message}")]
    CapacityMisconfigured { message: String },

    // Transform errors
    #[error("Failed to create frame transform: {message}")]
    TransformCreate { message: String },

    #[error("Frame transform failed: {message}")]
    TransformFailed { message: String },

    // Lifecycle errors
    #[error("Invalid pipeline state: {message}")]
    InvalidState { message: String },

    #[error("Stage '{stage}' failed: {message}")]
    StageFailed { stage: String, message: String },

    // File persistence errors
    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Generic error for cases not covered above
    #[error("{0}")]
    Other(String),
}

// Type alias for convenience
pub type Result<T> = std::result::Result<T, DfStreamError>;
