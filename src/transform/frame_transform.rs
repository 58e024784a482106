use crate::defaults;
use crate::error::{DfStreamError, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Trait for fixed-frame audio transforms (noise suppression models).
///
/// This trait allows swapping implementations (real model vs mock).
/// Implementations are stateful across calls and are never invoked
/// concurrently: the Processing Stage is the only caller.
pub trait FrameTransform: Send {
    /// Number of samples per frame. Queried once, fixed for the lifetime.
    fn frame_length(&self) -> usize;

    /// Processes one frame.
    ///
    /// # Arguments
    /// * `input` - Exactly `frame_length()` samples in roughly [-1.0, 1.0]
    /// * `output` - Buffer of the same length receiving the processed samples
    ///
    /// # Returns
    /// A model-specific per-frame score (speech probability or local SNR)
    fn process_frame(&mut self, input: &[f32], output: &mut [f32]) -> Result<f32>;

    /// Updates the attenuation limit in dB.
    fn set_atten_lim(&mut self, _lim_db: f32) {}

    /// Pops the next pending log line emitted by the model, if any.
    fn next_log_message(&mut self) -> Option<String> {
        None
    }

    /// Frees model resources. Called exactly once through `TransformHandle`.
    fn release(&mut self) {}

    /// Name for logging/debugging.
    fn name(&self) -> &str {
        "transform"
    }
}

/// Which transform implementation to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransformBackend {
    /// RNNoise via nnnoiseless (built-in weights, 480-sample frames).
    Rnnoise,
    /// Identity transform with a configurable frame length.
    Passthrough,
}

impl Default for TransformBackend {
    fn default() -> Self {
        if cfg!(feature = "rnnoise") {
            TransformBackend::Rnnoise
        } else {
            TransformBackend::Passthrough
        }
    }
}

impl std::str::FromStr for TransformBackend {
    type Err = DfStreamError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rnnoise" => Ok(TransformBackend::Rnnoise),
            "passthrough" => Ok(TransformBackend::Passthrough),
            other => Err(DfStreamError::ConfigInvalidValue {
                key: "transform.backend".to_string(),
                message: format!("unknown backend '{other}' (expected rnnoise or passthrough)"),
            }),
        }
    }
}

/// Configuration for transform creation.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformConfig {
    pub backend: TransformBackend,
    /// Optional model blob; must exist when set.
    pub model_path: Option<PathBuf>,
    pub atten_lim_db: f32,
    /// Frame length for the passthrough backend.
    pub frame_length: usize,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            backend: TransformBackend::default(),
            model_path: None,
            atten_lim_db: defaults::ATTEN_LIM_DB,
            frame_length: defaults::FRAME_LENGTH,
        }
    }
}

/// Creates a transform. Failures are construction errors; the pipeline never starts.
pub fn create_transform(config: &TransformConfig) -> Result<Box<dyn FrameTransform>> {
    if let Some(path) = &config.model_path
        && !path.exists()
    {
        return Err(DfStreamError::TransformCreate {
            message: format!("model file not found: {}", path.display()),
        });
    }

    let mut transform: Box<dyn FrameTransform> = match config.backend {
        TransformBackend::Passthrough => {
            Box::new(PassthroughTransform::new(config.frame_length)?)
        }
        #[cfg(feature = "rnnoise")]
        TransformBackend::Rnnoise => {
            if config.model_path.is_some() {
                return Err(DfStreamError::TransformCreate {
                    message: "the rnnoise backend uses built-in weights; unset transform.model_path"
                        .to_string(),
                });
            }
            Box::new(super::rnnoise::RnnoiseTransform::new(config.atten_lim_db))
        }
        #[cfg(not(feature = "rnnoise"))]
        TransformBackend::Rnnoise => {
            return Err(DfStreamError::TransformCreate {
                message: "the rnnoise backend is not compiled in (enable feature \"rnnoise\")"
                    .to_string(),
            });
        }
    };
    transform.set_atten_lim(config.atten_lim_db);

    tracing::info!(
        backend = transform.name(),
        frame_length = transform.frame_length(),
        atten_lim_db = config.atten_lim_db,
        "frame transform created"
    );
    Ok(transform)
}

/// Owning handle around a transform that releases it exactly once.
///
/// Released explicitly by `release()` or implicitly on drop, whichever comes
/// first. After release every `process` call fails.
pub struct TransformHandle {
    inner: Option<Box<dyn FrameTransform>>,
    frame_length: usize,
    name: String,
}

/// Handle shared between the Processing Stage and the pipeline controller.
pub type SharedTransform = Arc<Mutex<TransformHandle>>;

impl TransformHandle {
    /// Wraps a transform, querying its frame length once.
    pub fn new(transform: Box<dyn FrameTransform>) -> Result<Self> {
        let frame_length = transform.frame_length();
        if frame_length == 0 {
            let mut transform = transform;
            transform.release();
            return Err(DfStreamError::TransformCreate {
                message: "transform reported a frame length of 0".to_string(),
            });
        }
        let name = transform.name().to_string();
        Ok(Self {
            inner: Some(transform),
            frame_length,
            name,
        })
    }

    /// Wraps the handle for sharing.
    pub fn shared(self) -> SharedTransform {
        Arc::new(Mutex::new(self))
    }

    pub fn frame_length(&self) -> usize {
        self.frame_length
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs one frame through the transform.
    pub fn process(&mut self, input: &[f32], output: &mut [f32]) -> Result<f32> {
        if input.len() != self.frame_length || output.len() != self.frame_length {
            return Err(DfStreamError::TransformFailed {
                message: format!(
                    "frame length mismatch: expected {}, got input {} / output {}",
                    self.frame_length,
                    input.len(),
                    output.len()
                ),
            });
        }
        match self.inner.as_mut() {
            Some(transform) => transform.process_frame(input, output),
            None => Err(DfStreamError::TransformFailed {
                message: format!("transform '{}' already released", self.name),
            }),
        }
    }

    /// Pops the next pending model log line.
    pub fn next_log_message(&mut self) -> Option<String> {
        self.inner.as_mut()?.next_log_message()
    }

    /// Releases the transform. Returns true only on the call that released it.
    pub fn release(&mut self) -> bool {
        match self.inner.take() {
            Some(mut transform) => {
                transform.release();
                tracing::debug!(transform = %self.name, "frame transform released");
                true
            }
            None => false,
        }
    }

    pub fn is_released(&self) -> bool {
        self.inner.is_none()
    }
}

impl Drop for TransformHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for TransformHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformHandle")
            .field("name", &self.name)
            .field("frame_length", &self.frame_length)
            .field("released", &self.is_released())
            .finish()
    }
}

/// Identity transform. Useful for dry runs and for exercising the pipeline
/// without a model.
#[derive(Debug, Clone)]
pub struct PassthroughTransform {
    frame_length: usize,
}

impl PassthroughTransform {
    pub fn new(frame_length: usize) -> Result<Self> {
        if frame_length == 0 {
            return Err(DfStreamError::TransformCreate {
                message: "passthrough frame length must be non-zero".to_string(),
            });
        }
        Ok(Self { frame_length })
    }
}

impl FrameTransform for PassthroughTransform {
    fn frame_length(&self) -> usize {
        self.frame_length
    }

    fn process_frame(&mut self, input: &[f32], output: &mut [f32]) -> Result<f32> {
        output.copy_from_slice(input);
        Ok(1.0)
    }

    fn name(&self) -> &str {
        "passthrough"
    }
}

/// Counters observable after a `MockTransform` has been moved into a pipeline.
#[derive(Debug, Clone, Default)]
pub struct MockTransformProbe {
    frames: Arc<AtomicU64>,
    releases: Arc<AtomicUsize>,
    inputs: Arc<Mutex<Vec<Vec<f32>>>>,
}

impl MockTransformProbe {
    /// Frames processed so far.
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::SeqCst)
    }

    /// How many times `release` was called.
    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    /// Copies of every input frame, in call order (only when recording).
    pub fn inputs(&self) -> Vec<Vec<f32>> {
        self.inputs.lock().map(|i| i.clone()).unwrap_or_default()
    }
}

/// Mock transform for testing
#[derive(Debug)]
pub struct MockTransform {
    frame_length: usize,
    gain: f32,
    fail_after: Option<u64>,
    delay: Option<Duration>,
    record_inputs: bool,
    logs: VecDeque<String>,
    probe: MockTransformProbe,
}

impl MockTransform {
    /// Create a new identity mock with the given frame length
    pub fn new(frame_length: usize) -> Self {
        Self {
            frame_length,
            gain: 1.0,
            fail_after: None,
            delay: None,
            record_inputs: false,
            logs: VecDeque::new(),
            probe: MockTransformProbe::default(),
        }
    }

    /// Multiply every sample by `gain`
    pub fn with_gain(mut self, gain: f32) -> Self {
        self.gain = gain;
        self
    }

    /// Fail on every call after `frames` successful ones
    pub fn with_failure_after(mut self, frames: u64) -> Self {
        self.fail_after = Some(frames);
        self
    }

    /// Sleep this long inside every call
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Keep a copy of every input frame
    pub fn with_recorded_inputs(mut self) -> Self {
        self.record_inputs = true;
        self
    }

    /// Queue log lines to be drained through `next_log_message`
    pub fn with_log_messages(mut self, messages: &[&str]) -> Self {
        self.logs.extend(messages.iter().map(|m| m.to_string()));
        self
    }

    /// Shared counters
    pub fn probe(&self) -> MockTransformProbe {
        self.probe.clone()
    }
}

impl FrameTransform for MockTransform {
    fn frame_length(&self) -> usize {
        self.frame_length
    }

    fn process_frame(&mut self, input: &[f32], output: &mut [f32]) -> Result<f32> {
        let processed = self.probe.frames.load(Ordering::SeqCst);
        if self.fail_after.is_some_and(|limit| processed >= limit) {
            return Err(DfStreamError::TransformFailed {
                message: "mock transform failure".to_string(),
            });
        }
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
        if self.record_inputs
            && let Ok(mut inputs) = self.probe.inputs.lock()
        {
            inputs.push(input.to_vec());
        }
        for (out, sample) in output.iter_mut().zip(input) {
            *out = sample * self.gain;
        }
        self.probe.frames.fetch_add(1, Ordering::SeqCst);
        Ok(1.0)
    }

    fn next_log_message(&mut self) -> Option<String> {
        self.logs.pop_front()
    }

    fn release(&mut self) {
        self.probe.releases.fetch_add(1, Ordering::SeqCst);
    }

    fn name(&self) -> &str {
        "mock"
    }
}
