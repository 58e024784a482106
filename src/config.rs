use crate::audio::format::{AudioFormat, SampleNarrowing};
use crate::defaults;
use crate::error::{DfStreamError, Result};
use crate::pipeline::dispatch::DeliveryPolicy;
use crate::pipeline::idle::IdleStrategy;
use crate::pipeline::orchestrator::PipelineConfig;
use crate::transform::{TransformBackend, TransformConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub audio: AudioConfig,
    pub transform: TransformSection,
    pub pipeline: PipelineSection,
}

/// Input audio format
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
}

/// Frame transform configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransformSection {
    pub backend: TransformBackend,
    pub atten_lim_db: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_path: Option<PathBuf>,
    /// Passthrough backend only
    pub frame_length: usize,
}

/// Buffering, delivery and shutdown
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineSection {
    pub processor_id: String,
    pub ring_capacity: usize,
    pub output_queue_capacity: usize,
    pub shutdown_timeout_ms: u64,
    pub delivery: DeliveryPolicy,
    pub narrowing: SampleNarrowing,
    pub idle: IdleStrategy,
    pub tap_original: bool,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: defaults::SAMPLE_RATE,
            channels: defaults::CHANNELS,
            bits_per_sample: defaults::BITS_PER_SAMPLE,
        }
    }
}

impl Default for TransformSection {
    fn default() -> Self {
        Self {
            backend: TransformBackend::default(),
            atten_lim_db: defaults::ATTEN_LIM_DB,
            model_path: None,
            frame_length: defaults::FRAME_LENGTH,
        }
    }
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            processor_id: defaults::DEFAULT_PROCESSOR_ID.to_string(),
            ring_capacity: defaults::RING_CAPACITY,
            output_queue_capacity: defaults::OUTPUT_QUEUE_CAPACITY,
            shutdown_timeout_ms: defaults::SHUTDOWN_TIMEOUT_MS,
            delivery: DeliveryPolicy::default(),
            narrowing: SampleNarrowing::default(),
            idle: IdleStrategy::default(),
            tap_original: false,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Returns an error if the file is missing or contains invalid TOML.
    /// Missing fields will use default values.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Err(DfStreamError::ConfigFileNotFound {
                path: path.display().to_string(),
            }
            .into());
        }
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from a file or return defaults if file doesn't exist
    ///
    /// Only returns defaults if the file is missing.
    /// Returns errors for invalid TOML.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        match Self::load(path) {
            Ok(config) => Ok(config),
            Err(e) => {
                if matches!(
                    e.downcast_ref::<DfStreamError>(),
                    Some(DfStreamError::ConfigFileNotFound { .. })
                ) {
                    Ok(Self::default())
                } else {
                    Err(e.context(format!("Failed to load config from {}", path.display())))
                }
            }
        }
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - DFSTREAM_BACKEND → transform.backend
    /// - DFSTREAM_ATTEN_LIM → transform.atten_lim_db
    /// - DFSTREAM_MODEL → transform.model_path
    ///
    /// Unparseable values are ignored with a warning.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(backend) = std::env::var("DFSTREAM_BACKEND")
            && !backend.is_empty()
        {
            match backend.parse::<TransformBackend>() {
                Ok(parsed) => self.transform.backend = parsed,
                Err(e) => tracing::warn!("ignoring DFSTREAM_BACKEND: {e}"),
            }
        }

        if let Ok(lim) = std::env::var("DFSTREAM_ATTEN_LIM")
            && !lim.is_empty()
        {
            match lim.trim().parse::<f32>() {
                Ok(parsed) => self.transform.atten_lim_db = parsed,
                Err(e) => tracing::warn!("ignoring DFSTREAM_ATTEN_LIM={lim}: {e}"),
            }
        }

        if let Ok(model) = std::env::var("DFSTREAM_MODEL")
            && !model.is_empty()
        {
            self.transform.model_path = Some(PathBuf::from(model));
        }

        self
    }

    /// Get the default configuration file path
    ///
    /// Returns ~/.config/dfstream/config.toml on Linux
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join("dfstream")
            .join("config.toml")
    }

    /// Check values that serde cannot.
    pub fn validate(&self) -> Result<()> {
        if !self.transform.atten_lim_db.is_finite() {
            return Err(DfStreamError::ConfigInvalidValue {
                key: "transform.atten_lim_db".to_string(),
                message: "must be a finite number".to_string(),
            });
        }
        if self.transform.frame_length == 0 {
            return Err(DfStreamError::ConfigInvalidValue {
                key: "transform.frame_length".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.pipeline.ring_capacity < defaults::MIN_RING_CAPACITY {
            return Err(DfStreamError::ConfigInvalidValue {
                key: "pipeline.ring_capacity".to_string(),
                message: format!("must be at least {}", defaults::MIN_RING_CAPACITY),
            });
        }
        if self.pipeline.output_queue_capacity == 0 {
            return Err(DfStreamError::ConfigInvalidValue {
                key: "pipeline.output_queue_capacity".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.pipeline.processor_id.is_empty() {
            return Err(DfStreamError::ConfigInvalidValue {
                key: "pipeline.processor_id".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        Ok(())
    }

    pub fn audio_format(&self) -> AudioFormat {
        AudioFormat {
            sample_rate: self.audio.sample_rate,
            channels: self.audio.channels,
            bits_per_sample: self.audio.bits_per_sample,
            big_endian: false,
        }
    }

    pub fn transform_config(&self) -> TransformConfig {
        TransformConfig {
            backend: self.transform.backend,
            model_path: self.transform.model_path.clone(),
            atten_lim_db: self.transform.atten_lim_db,
            frame_length: self.transform.frame_length,
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            processor_id: self.pipeline.processor_id.clone(),
            format: self.audio_format(),
            ring_capacity: self.pipeline.ring_capacity,
            output_queue_capacity: self.pipeline.output_queue_capacity,
            shutdown_timeout: Duration::from_millis(self.pipeline.shutdown_timeout_ms),
            delivery: self.pipeline.delivery,
            narrowing: self.pipeline.narrowing,
            idle: self.pipeline.idle,
            tap_original: self.pipeline.tap_original,
        }
    }

    /// Render as TOML (for `dfstream config`).
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| DfStreamError::ConfigParse {
            message: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;
    use tempfile::NamedTempFile;

    // Mutex to serialize tests that modify environment variables
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    // SAFETY: These helpers are only used in tests with ENV_LOCK held,
    // ensuring no concurrent access to environment variables.
    fn set_env(key: &str, value: &str) {
        unsafe { std::env::set_var(key, value) }
    }

    fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) }
    }

    fn clear_dfstream_env() {
        remove_env("DFSTREAM_BACKEND");
        remove_env("DFSTREAM_ATTEN_LIM");
        remove_env("DFSTREAM_MODEL");
    }

    #[test]
    fn test_default_config_has_correct_values() {
        let config = Config::default();

        assert_eq!(config.audio.sample_rate, 48000);
        assert_eq!(config.audio.channels, 1);
        assert_eq!(config.audio.bits_per_sample, 16);

        assert_eq!(config.transform.atten_lim_db, 100.0);
        assert_eq!(config.transform.model_path, None);
        assert_eq!(config.transform.frame_length, 480);

        assert_eq!(config.pipeline.ring_capacity, 8192);
        assert_eq!(config.pipeline.output_queue_capacity, 500);
        assert_eq!(config.pipeline.shutdown_timeout_ms, 500);
        assert_eq!(config.pipeline.delivery, DeliveryPolicy::Offloaded);
        assert_eq!(config.pipeline.narrowing, SampleNarrowing::Saturate);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_toml_file() {
        let toml_content = r#"
            [transform]
            backend = "passthrough"
            atten_lim_db = 12.5
            frame_length = 256

            [pipeline]
            processor_id = "mic"
            ring_capacity = 16384
            output_queue_capacity = 8
            shutdown_timeout_ms = 250
            delivery = "inline"
            narrowing = "wrap"
            idle = { strategy = "backoff", min_micros = 10, max_micros = 1000 }
            tap_original = true
        "#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(toml_content.as_bytes()).unwrap();

        let config = Config::load(temp_file.path()).unwrap();

        assert_eq!(config.transform.backend, TransformBackend::Passthrough);
        assert_eq!(config.transform.atten_lim_db, 12.5);
        assert_eq!(config.transform.frame_length, 256);

        assert_eq!(config.pipeline.processor_id, "mic");
        assert_eq!(config.pipeline.ring_capacity, 16384);
        assert_eq!(config.pipeline.output_queue_capacity, 8);
        assert_eq!(config.pipeline.delivery, DeliveryPolicy::Inline);
        assert_eq!(config.pipeline.narrowing, SampleNarrowing::Wrap);
        assert_eq!(
            config.pipeline.idle,
            IdleStrategy::Backoff {
                min_micros: 10,
                max_micros: 1000
            }
        );
        assert!(config.pipeline.tap_original);

        let pipeline = config.pipeline_config();
        assert_eq!(pipeline.shutdown_timeout, Duration::from_millis(250));
        assert_eq!(pipeline.format, AudioFormat::contract());
    }

    #[test]
    fn test_load_partial_config_uses_defaults() {
        let toml_content = r#"
            [transform]
            atten_lim_db = 6.0
        "#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(toml_content.as_bytes()).unwrap();

        let config = Config::load(temp_file.path()).unwrap();

        assert_eq!(config.transform.atten_lim_db, 6.0);
        assert_eq!(config.audio, AudioConfig::default());
        assert_eq!(config.pipeline, PipelineSection::default());
    }

    #[test]
    fn test_env_override_backend_and_model() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_dfstream_env();

        set_env("DFSTREAM_BACKEND", "passthrough");
        set_env("DFSTREAM_MODEL", "/models/df3.tar.gz");
        let config = Config::default().with_env_overrides();

        assert_eq!(config.transform.backend, TransformBackend::Passthrough);
        assert_eq!(
            config.transform.model_path,
            Some(PathBuf::from("/models/df3.tar.gz"))
        );

        clear_dfstream_env();
    }

    #[test]
    fn test_env_override_atten_lim() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_dfstream_env();

        set_env("DFSTREAM_ATTEN_LIM", "18");
        let config = Config::default().with_env_overrides();
        assert_eq!(config.transform.atten_lim_db, 18.0);

        clear_dfstream_env();
    }

    #[test]
    fn test_env_override_invalid_values_ignored() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_dfstream_env();

        set_env("DFSTREAM_BACKEND", "bogus");
        set_env("DFSTREAM_ATTEN_LIM", "loud");
        set_env("DFSTREAM_MODEL", "");
        let config = Config::default().with_env_overrides();

        assert_eq!(config, Config::default());

        clear_dfstream_env();
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let invalid_toml = r#"
            [pipeline
            delivery = "broken
        "#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(invalid_toml.as_bytes()).unwrap();

        assert!(Config::load(temp_file.path()).is_err());
        assert!(Config::load_or_default(temp_file.path()).is_err());
    }

    #[test]
    fn test_unknown_delivery_is_rejected() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file
            .write_all(b"[pipeline]\ndelivery = \"broadcast\"\n")
            .unwrap();
        assert!(Config::load(temp_file.path()).is_err());
    }

    #[test]
    fn test_default_path_ends_with_dfstream_config() {
        let path = Config::default_path();
        assert!(path.ends_with("dfstream/config.toml"));
    }

    #[test]
    fn test_load_or_default_returns_default_for_missing_file() {
        let missing_path = Path::new("/tmp/nonexistent_dfstream_config_12345.toml");
        let config = Config::load_or_default(missing_path).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_missing_file_reports_path() {
        let missing_path = Path::new("/tmp/nonexistent_dfstream_config_12345.toml");
        let err = Config::load(missing_path).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DfStreamError>(),
            Some(DfStreamError::ConfigFileNotFound { path }) if path.ends_with("12345.toml")
        ));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.pipeline.ring_capacity = 8;
        assert!(matches!(
            config.validate(),
            Err(DfStreamError::ConfigInvalidValue { key, .. }) if key == "pipeline.ring_capacity"
        ));

        let mut config = Config::default();
        config.pipeline.output_queue_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.transform.atten_lim_db = f32::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_output_parses_back() {
        let mut config = Config::default();
        config.transform.model_path = Some(PathBuf::from("/tmp/model"));
        config.pipeline.idle = IdleStrategy::Yield;

        let rendered = config.to_toml_string().unwrap();
        assert!(rendered.contains("[pipeline]"));
        let parsed: Config = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed, config);
    }
}
