//! Pipeline Controller: lifecycle, push path and the drain/stop protocol.

use crate::audio::format::{AudioFormat, SampleNarrowing};
use crate::defaults;
use crate::error::{DfStreamError, Result};
use crate::pipeline::agent::{AgentRunner, AgentSignals, AgentStatus};
use crate::pipeline::dispatch::{DeliveryPolicy, Dispatcher, OutputGroup};
use crate::pipeline::error::{ErrorReporter, LogReporter};
use crate::pipeline::idle::IdleStrategy;
use crate::pipeline::listener::SharedListener;
use crate::pipeline::processing::ProcessingStage;
use crate::pipeline::stats::{PipelineCounters, PipelineStats};
use crate::streaming::accumulator::FrameAccumulator;
use crate::streaming::ring_buffer::{self, RingGauge, RingWriter};
use crate::transform::{FrameTransform, SharedTransform, TransformHandle};
use crossbeam_channel::bounded;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::thread;
use std::time::{Duration, Instant};

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Configuration for the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Registry key with the dispatcher; unique per dispatcher
    pub processor_id: String,
    /// Input format; anything but 48 kHz mono 16-bit LE is rejected
    pub format: AudioFormat,
    /// Bounded Byte Channel capacity in bytes (rounded up to a power of two)
    pub ring_capacity: usize,
    /// Output Queue capacity in frames
    pub output_queue_capacity: usize,
    /// Deadline for each join during `stop`
    pub shutdown_timeout: Duration,
    pub delivery: DeliveryPolicy,
    pub narrowing: SampleNarrowing,
    pub idle: IdleStrategy,
    /// Mirror every push to the listeners' `on_original_frame`
    pub tap_original: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            processor_id: defaults::DEFAULT_PROCESSOR_ID.to_string(),
            format: AudioFormat::contract(),
            ring_capacity: defaults::RING_CAPACITY,
            output_queue_capacity: defaults::OUTPUT_QUEUE_CAPACITY,
            shutdown_timeout: Duration::from_millis(defaults::SHUTDOWN_TIMEOUT_MS),
            delivery: DeliveryPolicy::default(),
            narrowing: SampleNarrowing::default(),
            idle: IdleStrategy::default(),
            tap_original: false,
        }
    }
}

/// Observable lifecycle of a `StreamPipeline`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Created,
    Running,
    /// End of input signalled, buffered data still flowing.
    Draining,
    Stopped,
}

/// Streaming frame pipeline: push bytes in, listeners get processed frames.
///
/// ```text
/// push → Bounded Byte Channel → [Processing Stage: accumulator → transform]
///      → Output Queue → [Dispatch Stage] → listeners
/// ```
///
/// Every method takes `&self`; the controller can be shared between a
/// producer thread and a supervising thread.
pub struct StreamPipeline {
    config: PipelineConfig,
    frame_length: usize,
    end_of_input: Arc<AtomicBool>,
    writer: Mutex<RingWriter>,
    gauge: RingGauge,
    pending: Mutex<Option<ProcessingStage>>,
    processing: Mutex<Option<AgentRunner>>,
    processing_signals: AgentSignals,
    group: Arc<OutputGroup>,
    dispatcher: Arc<Dispatcher>,
    owns_dispatcher: bool,
    transform: SharedTransform,
    counters: Arc<PipelineCounters>,
    error_reporter: Arc<dyn ErrorReporter>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl StreamPipeline {
    /// Creates a pipeline with its own private dispatcher.
    ///
    /// Construction errors (unsupported format, bad capacities, zero frame
    /// length) release the transform before returning.
    pub fn new(
        config: PipelineConfig,
        transform: Box<dyn FrameTransform>,
        listeners: Vec<SharedListener>,
    ) -> Result<Self> {
        Self::build(config, transform, listeners, None)
    }

    /// Creates a pipeline that registers with a shared dispatcher.
    pub fn with_dispatcher(
        config: PipelineConfig,
        transform: Box<dyn FrameTransform>,
        listeners: Vec<SharedListener>,
        dispatcher: Arc<Dispatcher>,
    ) -> Result<Self> {
        Self::build(config, transform, listeners, Some(dispatcher))
    }

    fn build(
        config: PipelineConfig,
        transform: Box<dyn FrameTransform>,
        listeners: Vec<SharedListener>,
        dispatcher: Option<Arc<Dispatcher>>,
    ) -> Result<Self> {
        // Wrapped first so that every error below releases it.
        let handle = TransformHandle::new(transform)?;

        config.format.validate()?;
        if config.processor_id.is_empty() {
            return Err(DfStreamError::ConfigInvalidValue {
                key: "processor_id".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        if config.output_queue_capacity == 0 {
            return Err(DfStreamError::CapacityMisconfigured {
                message: "output queue capacity must be at least 1".to_string(),
            });
        }

        let frame_length = handle.frame_length();
        let frame_bytes = frame_length * defaults::BYTES_PER_SAMPLE;
        let (writer, reader) = ring_buffer::channel(config.ring_capacity)?;
        let accumulator = FrameAccumulator::new(frame_bytes, reader.max_message_len())?;
        let (output_tx, output_rx) = bounded(config.output_queue_capacity);

        let end_of_input = Arc::new(AtomicBool::new(false));
        let processing_signals = AgentSignals::new();
        let counters = Arc::new(PipelineCounters::new());
        let transform_name = handle.name().to_string();
        let transform = handle.shared();
        let gauge = writer.gauge();

        tracing::info!(
            processor = %config.processor_id,
            transform = %transform_name,
            frame_length,
            ring_capacity = writer.capacity(),
            max_message_len = writer.max_message_len(),
            accumulator_capacity = accumulator.capacity(),
            output_queue_capacity = config.output_queue_capacity,
            delivery = ?config.delivery,
            "stream pipeline created"
        );

        let stage = ProcessingStage::new(
            reader,
            accumulator,
            Arc::clone(&transform),
            output_tx,
            Arc::clone(&end_of_input),
            processing_signals.stop_flag(),
            Arc::clone(&counters),
        )
        .with_idle(config.idle)
        .with_narrowing(config.narrowing);

        // Upstream stays non-zero until the Processing Stage has flushed and
        // exited; it drains the channel before it completes.
        let probe_gauge = gauge.clone();
        let probe_signals = processing_signals.clone();
        let upstream = Box::new(move || {
            if probe_signals.is_active() {
                probe_gauge.size().max(1)
            } else {
                0
            }
        });

        let group = Arc::new(OutputGroup::new(
            config.processor_id.clone(),
            listeners,
            output_rx,
            Arc::clone(&end_of_input),
            upstream,
            config.delivery,
            Arc::clone(&counters),
        )?);

        let (dispatcher, owns_dispatcher) = match dispatcher {
            Some(shared) => (shared, false),
            None => (
                Arc::new(
                    Dispatcher::new(config.idle).with_shutdown_timeout(config.shutdown_timeout),
                ),
                true,
            ),
        };

        Ok(Self {
            config,
            frame_length,
            end_of_input,
            writer: Mutex::new(writer),
            gauge,
            pending: Mutex::new(Some(stage)),
            processing: Mutex::new(None),
            processing_signals,
            group,
            dispatcher,
            owns_dispatcher,
            transform,
            counters,
            error_reporter: Arc::new(LogReporter),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }

    /// Sets a custom error reporter for the Processing Stage.
    pub fn with_error_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.error_reporter = reporter;
        self
    }

    /// Launches the Processing Stage and registers with the dispatcher.
    pub fn start(&self) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(DfStreamError::InvalidState {
                message: "pipeline already stopped".to_string(),
            });
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(DfStreamError::InvalidState {
                message: "pipeline already started".to_string(),
            });
        }
        let stage = lock(&self.pending)
            .take()
            .ok_or_else(|| DfStreamError::InvalidState {
                message: "processing stage already consumed".to_string(),
            })?;

        self.end_of_input.store(false, Ordering::SeqCst);
        self.dispatcher.register(Arc::clone(&self.group))?;
        let runner = AgentRunner::spawn(
            stage,
            self.processing_signals.clone(),
            self.config.idle,
            Arc::clone(&self.error_reporter),
        )?;
        *lock(&self.processing) = Some(runner);

        tracing::info!(processor = %self.config.processor_id, "stream pipeline started");
        Ok(())
    }

    /// Feeds raw PCM bytes into the pipeline.
    ///
    /// Splits the input into channel-sized messages and retries while the
    /// channel is full. Returns false when the pipeline is not running, once
    /// end of input has been signalled, if it is signalled mid-write, or if
    /// the Processing Stage has failed; the producer should stop sending.
    pub fn push(&self, bytes: &[u8]) -> bool {
        if !self.started.load(Ordering::SeqCst) || self.stopped.load(Ordering::SeqCst) {
            tracing::debug!(processor = %self.config.processor_id, "push rejected: not running");
            return false;
        }
        if self.end_of_input.load(Ordering::SeqCst) || self.processing_failed() {
            return false;
        }
        if bytes.is_empty() {
            return true;
        }
        if self.config.tap_original {
            self.group.deliver_original(bytes);
        }

        let mut writer = lock(&self.writer);
        let max_message_len = writer.max_message_len();
        let cancelled =
            || self.end_of_input.load(Ordering::SeqCst) || self.processing_failed();
        for chunk in bytes.chunks(max_message_len) {
            if !writer.write_until(chunk, &cancelled, self.config.idle) {
                tracing::debug!(
                    processor = %self.config.processor_id,
                    "push aborted: end of input signalled or processing failed"
                );
                return false;
            }
            PipelineCounters::add(&self.counters.bytes_pushed, chunk.len() as u64);
        }
        !cancelled()
    }

    /// True once the Processing Stage has exited on a fatal error or panic.
    ///
    /// Nothing will drain the channel any more, so end of input is forced on
    /// the first observation.
    fn processing_failed(&self) -> bool {
        if self.processing_signals.status() != AgentStatus::Failed {
            return false;
        }
        if !self.end_of_input.swap(true, Ordering::SeqCst) {
            tracing::warn!(
                processor = %self.config.processor_id,
                "processing stage failed, rejecting further input"
            );
        }
        true
    }

    /// Marks the end of input. Never blocks; the stages drain on their own.
    pub fn signal_end_of_input(&self) {
        if !self.end_of_input.swap(true, Ordering::SeqCst) {
            tracing::info!(processor = %self.config.processor_id, "end of input signalled");
        }
    }

    /// True until everything pushed so far has been processed and delivered.
    ///
    /// After a fatal Processing Stage error, bytes left in the channel can no
    /// longer be drained and are not counted; `buffered_bytes` still reports
    /// them.
    pub fn is_running(&self) -> bool {
        if self.stopped.load(Ordering::SeqCst) {
            return false;
        }
        if !self.end_of_input.load(Ordering::SeqCst) && !self.processing_failed() {
            return true;
        }
        // The Processing Stage completes only after the channel is empty and
        // the final partial frame is flushed, so an active stage also covers
        // bytes still buffered in the channel.
        let processing_busy =
            self.started.load(Ordering::SeqCst) && self.processing_signals.is_active();
        processing_busy || self.group.queued() > 0 || self.group.in_flight() > 0
    }

    /// Approximate bytes waiting in the channel.
    pub fn buffered_bytes(&self) -> usize {
        self.gauge.size()
    }

    pub fn state(&self) -> PipelineState {
        if self.stopped.load(Ordering::SeqCst) {
            PipelineState::Stopped
        } else if !self.started.load(Ordering::SeqCst) {
            PipelineState::Created
        } else if !self.end_of_input.load(Ordering::SeqCst) {
            PipelineState::Running
        } else if self.is_running() {
            PipelineState::Draining
        } else {
            PipelineState::Stopped
        }
    }

    /// Polls `is_running` until it turns false or `timeout` elapses.
    ///
    /// Returns true if the pipeline drained in time.
    pub fn wait_until_drained(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.is_running() {
                return true;
            }
            if Instant::now() >= deadline {
                tracing::warn!(
                    processor = %self.config.processor_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "pipeline did not drain within timeout"
                );
                return false;
            }
            thread::sleep(DRAIN_POLL_INTERVAL);
        }
    }

    /// Stops both stages and releases the transform.
    ///
    /// Sets end of input, joins the Processing Stage with a deadline,
    /// unregisters the output group and releases the transform even if a join
    /// timed out. Idempotent: later calls return `Ok(())`. The first call
    /// returns the Processing Stage's fatal error, if any.
    pub fn stop(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            tracing::debug!(processor = %self.config.processor_id, "pipeline already stopped");
            return Ok(());
        }
        self.end_of_input.store(true, Ordering::SeqCst);
        let timeout = self.config.shutdown_timeout;

        let mut fatal = None;
        if let Some(mut runner) = lock(&self.processing).take() {
            runner.close(timeout);
            fatal = runner.take_fatal_error();
        }
        drop(lock(&self.pending).take());

        self.dispatcher.registry().unregister_group(&self.group);
        self.group.close(timeout);
        if self.owns_dispatcher {
            self.dispatcher.shutdown(timeout);
        }

        self.release_transform(timeout);

        let stats = self.stats();
        tracing::info!(
            processor = %self.config.processor_id,
            bytes_pushed = stats.bytes_pushed,
            frames_processed = stats.frames_processed,
            frames_delivered = stats.frames_delivered,
            frames_dropped = stats.frames_dropped,
            "stream pipeline stopped"
        );

        match fatal {
            Some(error) => Err(DfStreamError::StageFailed {
                stage: "processing".to_string(),
                message: error.message().to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Releases the transform, waiting up to `timeout` for a frame in progress.
    ///
    /// If the detached Processing Stage still holds the lock, the handle is
    /// released when its last owner drops it.
    fn release_transform(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        loop {
            match self.transform.try_lock() {
                Ok(mut handle) => {
                    handle.release();
                    return;
                }
                Err(TryLockError::Poisoned(poisoned)) => {
                    poisoned.into_inner().release();
                    return;
                }
                Err(TryLockError::WouldBlock) => {
                    if Instant::now() >= deadline {
                        tracing::error!(
                            processor = %self.config.processor_id,
                            "transform still busy after timeout, deferring release to its owner"
                        );
                        return;
                    }
                    thread::sleep(DRAIN_POLL_INTERVAL);
                }
            }
        }
    }

    /// Whether the transform handle has been released.
    pub fn is_transform_released(&self) -> bool {
        match self.transform.try_lock() {
            Ok(handle) => handle.is_released(),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().is_released(),
            Err(TryLockError::WouldBlock) => false,
        }
    }

    pub fn stats(&self) -> PipelineStats {
        self.counters.snapshot()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn processor_id(&self) -> &str {
        &self.config.processor_id
    }

    /// Samples per frame, as reported by the transform.
    pub fn frame_length(&self) -> usize {
        self.frame_length
    }

    /// Bytes per frame.
    pub fn frame_bytes(&self) -> usize {
        self.frame_length * defaults::BYTES_PER_SAMPLE
    }

    /// Largest single channel message; larger pushes are split.
    pub fn max_message_len(&self) -> usize {
        lock(&self.writer).max_message_len()
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }
}

impl Drop for StreamPipeline {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::warn!(
                processor = %self.config.processor_id,
                error = %e,
                "pipeline stopped with error on drop"
            );
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
