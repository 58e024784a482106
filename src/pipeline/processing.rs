//! Processing Stage: channel → accumulator → transform → output queue.

use crate::audio::format::{self, SampleNarrowing};
use crate::pipeline::agent::Agent;
use crate::pipeline::error::StationError;
use crate::pipeline::idle::IdleStrategy;
use crate::pipeline::stats::PipelineCounters;
use crate::streaming::accumulator::FrameAccumulator;
use crate::streaming::frame::{ProcessedFrame, WorkUnit};
use crate::streaming::ring_buffer::RingReader;
use crate::transform::SharedTransform;
use crossbeam_channel::{Sender, TrySendError};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Log target for lines emitted by the transform itself.
pub const TRANSFORM_LOG_TARGET: &str = "dfstream::transform";

/// Drives the accumulator and runs the transform once per frame.
///
/// Owns the channel's reading half and the accumulator. The transform handle is
/// shared with the controller only so that it can be released on stop; no
/// other context ever calls it.
pub struct ProcessingStage {
    reader: RingReader,
    accumulator: FrameAccumulator,
    transform: SharedTransform,
    output: Sender<ProcessedFrame>,
    end_of_input: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    idle: IdleStrategy,
    narrowing: SampleNarrowing,
    counters: Arc<PipelineCounters>,
    input: Vec<f32>,
    processed: Vec<f32>,
    sequence: u64,
    flushed: bool,
}

impl ProcessingStage {
    /// Creates the stage.
    ///
    /// # Arguments
    /// * `reader` - Reading half of the channel
    /// * `accumulator` - Sized for the transform's frame and the channel's max message
    /// * `transform` - Shared handle; frame length must match the accumulator
    /// * `output` - Output Queue sender
    /// * `end_of_input` - Pipeline end-of-input flag
    /// * `shutdown` - This stage's own stop flag (output retries give up once set)
    pub fn new(
        reader: RingReader,
        accumulator: FrameAccumulator,
        transform: SharedTransform,
        output: Sender<ProcessedFrame>,
        end_of_input: Arc<AtomicBool>,
        shutdown: Arc<AtomicBool>,
        counters: Arc<PipelineCounters>,
    ) -> Self {
        let samples = accumulator.frame_bytes() / crate::defaults::BYTES_PER_SAMPLE;
        Self {
            reader,
            accumulator,
            transform,
            output,
            end_of_input,
            shutdown,
            idle: IdleStrategy::default(),
            narrowing: SampleNarrowing::default(),
            counters,
            input: vec![0.0; samples],
            processed: vec![0.0; samples],
            sequence: 0,
            flushed: false,
        }
    }

    /// Idle strategy between output-queue retries.
    pub fn with_idle(mut self, idle: IdleStrategy) -> Self {
        self.idle = idle;
        self
    }

    pub fn with_narrowing(mut self, narrowing: SampleNarrowing) -> Self {
        self.narrowing = narrowing;
        self
    }

    /// Runs one frame through the transform and publishes it.
    fn process_frame(&mut self, bytes: Vec<u8>, padded: bool) -> Result<WorkUnit, StationError> {
        format::decode_frame(&bytes, &mut self.input);
        {
            let mut transform = self
                .transform
                .lock()
                .map_err(|_| StationError::Fatal("transform lock poisoned".to_string()))?;
            transform
                .process(&self.input, &mut self.processed)
                .map_err(|e| StationError::Fatal(e.to_string()))?;
            while let Some(line) = transform.next_log_message() {
                tracing::debug!(target: TRANSFORM_LOG_TARGET, "{}", line);
            }
        }

        let frame = ProcessedFrame::new(
            self.sequence,
            format::encode_frame(&self.processed, self.narrowing),
            padded,
        );
        self.sequence += 1;
        PipelineCounters::add(&self.counters.frames_processed, 1);
        if padded {
            PipelineCounters::add(&self.counters.frames_padded, 1);
        }

        self.publish(frame)?;
        Ok(WorkUnit::Produced)
    }

    /// Sends to the Output Queue, retrying while full until shutdown.
    fn publish(&mut self, frame: ProcessedFrame) -> Result<(), StationError> {
        let mut idler = self.idle.idler();
        let mut pending = frame;
        loop {
            match self.output.try_send(pending) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Full(frame)) => {
                    if self.shutdown.load(Ordering::SeqCst) {
                        PipelineCounters::add(&self.counters.frames_dropped, 1);
                        tracing::warn!(
                            sequence = frame.sequence,
                            "output queue full during shutdown, frame dropped"
                        );
                        return Ok(());
                    }
                    pending = frame;
                    idler.idle();
                }
                Err(TrySendError::Disconnected(frame)) => {
                    if self.shutdown.load(Ordering::SeqCst) {
                        PipelineCounters::add(&self.counters.frames_dropped, 1);
                        return Ok(());
                    }
                    return Err(StationError::Fatal(format!(
                        "output queue disconnected at frame {}",
                        frame.sequence
                    )));
                }
            }
        }
    }

    /// Frames produced so far.
    pub fn frames_produced(&self) -> u64 {
        self.sequence
    }
}

impl Agent for ProcessingStage {
    fn name(&self) -> &'static str {
        "processing"
    }

    fn step(&mut self) -> Result<WorkUnit, StationError> {
        if self.flushed {
            return Ok(WorkUnit::None);
        }

        loop {
            if let Some(frame) = self.accumulator.take_frame() {
                return self.process_frame(frame, false);
            }

            if let Some(msg) = self.reader.read_if_available() {
                self.accumulator
                    .push(&msg)
                    .map_err(|e| StationError::Fatal(e.to_string()))?;
                continue;
            }

            // The gauge counts writes in progress, so a zero size after
            // end-of-input means nothing else will arrive.
            if self.end_of_input.load(Ordering::SeqCst) && self.reader.size() == 0 {
                self.flushed = true;
                if let Some(frame) = self.accumulator.take_padded_remainder() {
                    tracing::debug!(
                        sequence = self.sequence,
                        "flushing final partial frame with zero padding"
                    );
                    return self.process_frame(frame, true);
                }
            }
            return Ok(WorkUnit::None);
        }
    }

    fn is_complete(&self) -> bool {
        self.flushed
    }

    fn on_close(&mut self) {
        tracing::debug!(
            frames = self.sequence,
            leftover = self.accumulator.len(),
            "processing stage closed"
        );
    }
}
