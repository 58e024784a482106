//! Denoise application entry point.
//!
//! Orchestrates the file flow:
//! WAV source → pipeline → WAV writer(s)

use crate::audio::wav::{DualWavWriter, WavFileSource, WavFrameWriter};
use crate::cli::DenoiseArgs;
use crate::config::Config;
use crate::error::Result;
use crate::pipeline::listener::SharedListener;
use crate::pipeline::orchestrator::StreamPipeline;
use crate::pipeline::stats::PipelineStats;
use crate::transform::create_transform;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Outcome of one `dfstream denoise` run.
#[derive(Debug, Clone)]
pub struct DenoiseReport {
    pub stats: PipelineStats,
    /// Duration of the input audio.
    pub input_ms: u64,
    /// Wall-clock processing time.
    pub elapsed: Duration,
    /// Whether the pipeline drained before the timeout.
    pub drained: bool,
    pub denoised_bytes: u64,
    pub original_bytes: Option<u64>,
}

impl DenoiseReport {
    /// Input duration divided by processing time.
    pub fn realtime_factor(&self) -> f64 {
        let elapsed = self.elapsed.as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        self.input_ms as f64 / 1000.0 / elapsed
    }
}

enum Writers {
    Single(Arc<Mutex<WavFrameWriter>>),
    Dual(Arc<Mutex<DualWavWriter>>),
}

impl Writers {
    fn listener(&self) -> SharedListener {
        match self {
            Writers::Single(w) => w.clone(),
            Writers::Dual(w) => w.clone(),
        }
    }

    fn bytes_written(&self) -> (u64, Option<u64>) {
        match self {
            Writers::Single(w) => (lock(w).bytes_written(), None),
            Writers::Dual(w) => {
                let (original, denoised) = lock(w).bytes_written();
                (denoised, Some(original))
            }
        }
    }
}

/// Apply CLI overrides on top of the file/env configuration.
pub fn apply_overrides(mut config: Config, args: &DenoiseArgs) -> Config {
    if let Some(backend) = args.backend {
        config.transform.backend = backend;
    }
    if let Some(atten_lim) = args.atten_lim {
        config.transform.atten_lim_db = atten_lim;
    }
    if args.original.is_some() {
        config.pipeline.tap_original = true;
    }
    config
}

/// Run the denoise command: read WAV → stream through the pipeline → write WAV.
pub fn run_denoise(config: Config, args: &DenoiseArgs) -> Result<DenoiseReport> {
    let config = apply_overrides(config, args);
    config.validate()?;

    let mut source = WavFileSource::open(&args.input)?.with_chunk_bytes(args.chunk_bytes);
    tracing::info!(
        input = %args.input.display(),
        duration_ms = source.duration_ms(),
        bytes = source.total_bytes(),
        "Opened input"
    );

    let writers = match &args.original {
        Some(original) => Writers::Dual(Arc::new(Mutex::new(DualWavWriter::create(
            original,
            &args.output,
        )?))),
        None => Writers::Single(Arc::new(Mutex::new(WavFrameWriter::create(&args.output)?))),
    };

    let transform = create_transform(&config.transform_config())?;
    let mut pipeline_config = config.pipeline_config();
    pipeline_config.format = source.format();

    let pipeline = StreamPipeline::new(pipeline_config, transform, vec![writers.listener()])?;
    let started = Instant::now();
    pipeline.start()?;

    while let Some(chunk) = source.next_chunk() {
        if !pipeline.push(chunk) {
            tracing::warn!("Pipeline stopped accepting input, truncating");
            break;
        }
    }
    pipeline.signal_end_of_input();

    let drain_timeout = args.drain_timeout();
    let drained = pipeline.wait_until_drained(drain_timeout);
    if !drained {
        tracing::warn!(
            timeout_ms = drain_timeout.as_millis() as u64,
            "Pipeline did not drain in time, stopping anyway"
        );
    }
    pipeline.stop()?;
    let elapsed = started.elapsed();

    let (denoised_bytes, original_bytes) = writers.bytes_written();
    Ok(DenoiseReport {
        stats: pipeline.stats(),
        input_ms: source.duration_ms(),
        elapsed,
        drained,
        denoised_bytes,
        original_bytes,
    })
}

/// Render the `dfstream config` output.
pub fn run_config_command(config: &Config, show_path: bool) -> Result<String> {
    if show_path {
        return Ok(Config::default_path().display().to_string());
    }
    config.to_toml_string()
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::TransformBackend;
    use std::path::{Path, PathBuf};

    fn write_input(path: &Path, samples: usize) {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 48000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for i in 0..samples {
            writer.write_sample(((i % 200) as i16 - 100) * 50).unwrap();
        }
        writer.finalize().unwrap();
    }

    fn args(input: PathBuf, output: PathBuf) -> DenoiseArgs {
        DenoiseArgs {
            input,
            output,
            original: None,
            atten_lim: None,
            backend: Some(TransformBackend::Passthrough),
            chunk_bytes: 1000,
            drain_timeout: Some(Duration::from_secs(5)),
        }
    }

    #[test]
    fn test_apply_overrides() {
        let dir = PathBuf::from("/tmp");
        let mut a = args(dir.join("in.wav"), dir.join("out.wav"));
        a.atten_lim = Some(6.0);
        a.original = Some(dir.join("raw.wav"));
        let config = apply_overrides(Config::default(), &a);
        assert_eq!(config.transform.backend, TransformBackend::Passthrough);
        assert_eq!(config.transform.atten_lim_db, 6.0);
        assert!(config.pipeline.tap_original);
    }

    #[test]
    fn test_run_denoise_passthrough_preserves_audio() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.wav");
        let output = dir.path().join("out.wav");
        write_input(&input, 1000);

        let report = run_denoise(Config::default(), &args(input.clone(), output.clone())).unwrap();
        assert!(report.drained);
        // 1000 samples → 2 full frames + 1 padded frame of 480
        assert_eq!(report.stats.frames_processed, 3);
        assert_eq!(report.stats.frames_padded, 1);
        assert_eq!(report.denoised_bytes, 3 * 960);
        assert_eq!(report.original_bytes, None);

        let original: Vec<i16> = hound::WavReader::open(&input)
            .unwrap()
            .samples::<i16>()
            .map(|s| s.unwrap())
            .collect();
        let denoised: Vec<i16> = hound::WavReader::open(&output)
            .unwrap()
            .samples::<i16>()
            .map(|s| s.unwrap())
            .collect();
        assert_eq!(denoised.len(), 1440);
        assert_eq!(&denoised[..1000], &original[..]);
        assert!(denoised[1000..].iter().all(|&s| s == 0));
    }

    #[test]
    fn test_run_denoise_with_original_tap() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.wav");
        let output = dir.path().join("out.wav");
        let raw = dir.path().join("raw.wav");
        write_input(&input, 960);

        let mut a = args(input, output);
        a.original = Some(raw.clone());
        let report = run_denoise(Config::default(), &a).unwrap();
        assert_eq!(report.denoised_bytes, 1920);
        assert_eq!(report.original_bytes, Some(1920));
        assert!(raw.exists());
    }

    #[test]
    fn test_run_denoise_missing_input() {
        let dir = tempfile::tempdir().unwrap();
        let a = args(dir.path().join("missing.wav"), dir.path().join("out.wav"));
        assert!(run_denoise(Config::default(), &a).is_err());
    }

    #[test]
    fn test_run_config_command_renders_toml() {
        let rendered = run_config_command(&Config::default(), false).unwrap();
        assert!(rendered.contains("[pipeline]"));
        assert!(rendered.contains("[transform]"));
    }

    #[test]
    fn test_realtime_factor() {
        let report = DenoiseReport {
            stats: PipelineStats::default(),
            input_ms: 2000,
            elapsed: Duration::from_secs(1),
            drained: true,
            denoised_bytes: 0,
            original_bytes: None,
        };
        assert!((report.realtime_factor() - 2.0).abs() < 1e-9);
    }
}
