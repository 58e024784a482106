//! Frame types for the streaming pipeline.
//!
//! Defines the data that flows from the Processing Stage to the Dispatch Stage.

use crate::audio::format;
use crate::defaults;
use std::time::Instant;

/// A processed frame on its way to the listeners.
#[derive(Debug, Clone)]
pub struct ProcessedFrame {
    /// Sequence number for ordering frames.
    pub sequence: u64,
    /// Timestamp when the transform produced this frame.
    pub timestamp: Instant,
    /// Little-endian 16-bit PCM bytes, exactly one frame long.
    pub bytes: Vec<u8>,
    /// Whether the input was a zero-padded final partial frame.
    pub padded: bool,
}

impl ProcessedFrame {
    /// Creates a new processed frame.
    pub fn new(sequence: u64, bytes: Vec<u8>, padded: bool) -> Self {
        Self {
            sequence,
            timestamp: Instant::now(),
            bytes,
            padded,
        }
    }

    /// Number of samples in this frame.
    pub fn sample_count(&self) -> usize {
        self.bytes.len() / defaults::BYTES_PER_SAMPLE
    }

    /// Decodes the frame back into samples.
    pub fn samples(&self) -> Vec<i16> {
        format::bytes_to_samples(&self.bytes)
    }

    /// Returns the duration of this frame in milliseconds.
    pub fn duration_ms(&self, sample_rate: u32) -> u32 {
        (self.sample_count() as u32 * 1000) / sample_rate
    }
}

/// Result of one stage step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkUnit {
    /// Nothing to do this iteration; the runner idles.
    None,
    /// At least one unit of work was done; the runner polls again immediately.
    Produced,
}

impl WorkUnit {
    pub fn is_produced(self) -> bool {
        matches!(self, WorkUnit::Produced)
    }
}
