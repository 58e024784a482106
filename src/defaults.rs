//! Default configuration constants for dfstream.
//!
//! Shared by the file configuration, the runtime pipeline configuration and
//! the CLI so the three never disagree.

/// Sample rate required by the audio format contract, in Hz.
pub const SAMPLE_RATE: u32 = 48000;

/// Channel count required by the audio format contract.
pub const CHANNELS: u16 = 1;

/// Bit depth required by the audio format contract.
pub const BITS_PER_SAMPLE: u16 = 16;

/// Bytes per mono 16-bit sample.
pub const BYTES_PER_SAMPLE: usize = 2;

/// Frame length used by the passthrough backend (10ms at 48kHz).
///
/// Matches the RNNoise frame size so both backends re-chunk identically.
pub const FRAME_LENGTH: usize = 480;

/// Default Bounded Byte Channel capacity in bytes (rounded up to a power of two).
pub const RING_CAPACITY: usize = 8192;

/// Smallest Bounded Byte Channel capacity accepted.
pub const MIN_RING_CAPACITY: usize = 64;

/// Ratio between ring capacity and the largest single message it accepts.
pub const RING_MAX_MESSAGE_DIVISOR: usize = 8;

/// Default Output Queue capacity, in processed frames.
pub const OUTPUT_QUEUE_CAPACITY: usize = 500;

/// How long `stop()` waits for each execution context before moving on.
pub const SHUTDOWN_TIMEOUT_MS: u64 = 500;

/// Default attenuation limit in dB. 100 dB is effectively unlimited.
pub const ATTEN_LIM_DB: f32 = 100.0;

/// Default sleep used by the idle strategy between empty polls, in microseconds.
pub const IDLE_SLEEP_MICROS: u64 = 1000;

/// Default size of byte chunks read from a WAV source and pushed into the pipeline.
pub const PUSH_CHUNK_BYTES: usize = 4096;

/// Default time the CLI waits for the pipeline to drain after end-of-input.
pub const DRAIN_TIMEOUT_SECS: u64 = 10;

/// Processor id used when a pipeline does not name itself.
pub const DEFAULT_PROCESSOR_ID: &str = "default";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_capacity_is_power_of_two() {
        assert!(RING_CAPACITY.is_power_of_two());
        assert!(MIN_RING_CAPACITY.is_power_of_two());
    }

    #[test]
    fn default_max_message_fits_several_frames_per_ring() {
        let max_message = RING_CAPACITY / RING_MAX_MESSAGE_DIVISOR;
        assert_eq!(max_message, 1024);
        assert!(max_message + 4 < RING_CAPACITY);
    }

    #[test]
    fn frame_is_ten_milliseconds() {
        assert_eq!(FRAME_LENGTH as u32 * 1000 / SAMPLE_RATE, 10);
    }
}
