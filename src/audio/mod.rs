//! Audio format contract and WAV file I/O.

pub mod format;
pub mod wav;

pub use format::{AudioFormat, SampleNarrowing};
pub use wav::{DualWavWriter, WavFileSource, WavFrameWriter};
