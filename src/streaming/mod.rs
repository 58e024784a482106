//! Streaming primitives: the byte channel, the frame re-chunker and the frame
//! types that flow between stages.
//!
//! ```text
//! push(bytes) ──▶ RingWriter ══ ring ══▶ RingReader ──▶ FrameAccumulator ──▶ frames
//!                 (≤ max msg)                           (exactly N samples)
//! ```

pub mod accumulator;
pub mod frame;
pub mod ring_buffer;

pub use accumulator::FrameAccumulator;
pub use frame::{ProcessedFrame, WorkUnit};
pub use ring_buffer::{RingGauge, RingReader, RingWriter, channel};
