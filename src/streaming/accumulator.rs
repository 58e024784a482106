//! Frame Accumulator: re-chunks arbitrary byte pushes into fixed-size frames.
//!
//! Bytes are appended at the tail and whole frames are taken from the front,
//! oldest first. The remainder is compacted to the front after every take, so
//! the filled region always starts at offset 0.

use crate::error::{DfStreamError, Result};

/// Fixed-capacity byte buffer that yields exactly `frame_bytes`-long frames.
#[derive(Debug)]
pub struct FrameAccumulator {
    buffer: Box<[u8]>,
    filled: usize,
    frame_bytes: usize,
}

impl FrameAccumulator {
    /// Sizes the buffer for one frame plus one maximal channel message,
    /// rounded up to a power of two.
    pub fn new(frame_bytes: usize, max_message_len: usize) -> Result<Self> {
        let capacity = (frame_bytes + max_message_len).next_power_of_two();
        Self::with_capacity(frame_bytes, max_message_len, capacity)
    }

    /// Uses an explicit capacity, rejecting anything that cannot hold a
    /// partial frame plus one maximal message.
    pub fn with_capacity(frame_bytes: usize, max_message_len: usize, capacity: usize) -> Result<Self> {
        if frame_bytes == 0 {
            return Err(DfStreamError::CapacityMisconfigured {
                message: "frame length must be non-zero".to_string(),
            });
        }
        let required = frame_bytes + max_message_len;
        if capacity < required {
            return Err(DfStreamError::CapacityMisconfigured {
                message: format!(
                    "accumulator capacity {} is smaller than one frame ({} bytes) plus one message ({} bytes)",
                    capacity, frame_bytes, max_message_len
                ),
            });
        }
        Ok(Self {
            buffer: vec![0u8; capacity].into_boxed_slice(),
            filled: 0,
            frame_bytes,
        })
    }

    /// Takes the oldest full frame, if one is buffered.
    pub fn take_frame(&mut self) -> Option<Vec<u8>> {
        if self.filled < self.frame_bytes {
            return None;
        }
        let frame = self.buffer[..self.frame_bytes].to_vec();
        self.buffer.copy_within(self.frame_bytes..self.filled, 0);
        self.filled -= self.frame_bytes;
        Some(frame)
    }

    /// Appends bytes at the tail.
    ///
    /// Fails without modifying the buffer when `bytes` does not fit, which only
    /// happens when the accumulator is undersized for the channel.
    pub fn push(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > self.remaining() {
            return Err(DfStreamError::CapacityMisconfigured {
                message: format!(
                    "accumulator overflow: {} bytes buffered, {} incoming, capacity {}",
                    self.filled,
                    bytes.len(),
                    self.capacity()
                ),
            });
        }
        self.buffer[self.filled..self.filled + bytes.len()].copy_from_slice(bytes);
        self.filled += bytes.len();
        Ok(())
    }

    /// Takes whatever partial frame remains, zero-padded to a full frame.
    ///
    /// Returns `None` when the accumulator is empty. Only meaningful once no
    /// full frame is buffered.
    pub fn take_padded_remainder(&mut self) -> Option<Vec<u8>> {
        if self.filled == 0 {
            return None;
        }
        let take = self.filled.min(self.frame_bytes);
        let mut frame = vec![0u8; self.frame_bytes];
        frame[..take].copy_from_slice(&self.buffer[..take]);
        self.buffer.copy_within(take..self.filled, 0);
        self.filled -= take;
        Some(frame)
    }

    /// Whether a full frame is ready.
    pub fn has_frame(&self) -> bool {
        self.filled >= self.frame_bytes
    }

    /// Bytes buffered but not yet framed.
    pub fn len(&self) -> usize {
        self.filled
    }

    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }

    /// Free space at the tail.
    pub fn remaining(&self) -> usize {
        self.buffer.len() - self.filled
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    pub fn frame_bytes(&self) -> usize {
        self.frame_bytes
    }
}
