//! Pipeline counters and their snapshot.

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters shared by the stages of one pipeline.
#[derive(Debug, Default)]
pub struct PipelineCounters {
    pub(crate) bytes_pushed: AtomicU64,
    pub(crate) frames_processed: AtomicU64,
    pub(crate) frames_padded: AtomicU64,
    pub(crate) frames_dropped: AtomicU64,
    pub(crate) frames_delivered: AtomicU64,
    pub(crate) listener_errors: AtomicU64,
}

impl PipelineCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PipelineStats {
        PipelineStats {
            bytes_pushed: self.bytes_pushed.load(Ordering::Relaxed),
            frames_processed: self.frames_processed.load(Ordering::Relaxed),
            frames_padded: self.frames_padded.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            frames_delivered: self.frames_delivered.load(Ordering::Relaxed),
            listener_errors: self.listener_errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of a pipeline's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Bytes accepted into the channel.
    pub bytes_pushed: u64,
    /// Frames run through the transform.
    pub frames_processed: u64,
    /// Zero-padded final frames (0 or 1 per run).
    pub frames_padded: u64,
    /// Processed frames abandoned under output backpressure during shutdown.
    pub frames_dropped: u64,
    /// Frames handed to every listener of the group.
    pub frames_delivered: u64,
    /// Listener callbacks that returned an error.
    pub listener_errors: u64,
}
