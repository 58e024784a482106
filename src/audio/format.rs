//! Audio format contract and PCM <-> float sample conversion.
//!
//! The pipeline only accepts 48kHz mono signed 16-bit little-endian PCM. The
//! frame transform works on floats in roughly [-1.0, 1.0], so every frame is
//! widened on the way in and narrowed on the way out.

use crate::defaults;
use crate::error::{DfStreamError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Scale between 16-bit PCM and the float domain.
pub const PCM_SCALE: f32 = 32768.0;

/// Description of a PCM stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    pub big_endian: bool,
}

impl AudioFormat {
    /// The only format the pipeline accepts.
    pub const fn contract() -> Self {
        Self {
            sample_rate: defaults::SAMPLE_RATE,
            channels: defaults::CHANNELS,
            bits_per_sample: defaults::BITS_PER_SAMPLE,
            big_endian: false,
        }
    }

    /// Bytes per sample frame (all channels).
    pub fn frame_size(&self) -> usize {
        self.channels as usize * (self.bits_per_sample as usize / 8)
    }

    /// Rejects anything other than the contract format.
    pub fn validate(&self) -> Result<()> {
        let expected = Self::contract();
        if *self != expected {
            return Err(DfStreamError::UnsupportedFormat {
                expected: expected.to_string(),
                actual: self.to_string(),
            });
        }
        Ok(())
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self::contract()
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} Hz, {} ch, {}-bit {}",
            self.sample_rate,
            self.channels,
            self.bits_per_sample,
            if self.big_endian { "BE" } else { "LE" }
        )
    }
}

/// How float output is narrowed back to 16-bit PCM.
///
/// Both round half away from zero after scaling by 32768. They differ only for
/// samples whose magnitude reaches 1.0 or more.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleNarrowing {
    /// Clamp to [-32768, 32767].
    #[default]
    Saturate,
    /// Two's-complement wrap of the rounded value.
    Wrap,
}

impl SampleNarrowing {
    /// Narrows one float sample.
    pub fn narrow(self, value: f32) -> i16 {
        let scaled = (value * PCM_SCALE).round();
        match self {
            // Float-to-int `as` casts saturate (and map NaN to 0).
            SampleNarrowing::Saturate => scaled as i16,
            SampleNarrowing::Wrap => (scaled as i64) as i16,
        }
    }
}

/// Widens one 16-bit sample into the float domain.
pub fn pcm_to_float(sample: i16) -> f32 {
    sample as f32 / PCM_SCALE
}

/// Decodes little-endian 16-bit PCM bytes into floats.
///
/// `out` must hold `bytes.len() / 2` samples; a trailing odd byte is ignored.
pub fn decode_frame(bytes: &[u8], out: &mut [f32]) {
    for (dst, pair) in out.iter_mut().zip(bytes.chunks_exact(defaults::BYTES_PER_SAMPLE)) {
        *dst = pcm_to_float(i16::from_le_bytes([pair[0], pair[1]]));
    }
}

/// Encodes floats as little-endian 16-bit PCM bytes.
pub fn encode_frame(samples: &[f32], narrowing: SampleNarrowing) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * defaults::BYTES_PER_SAMPLE);
    for &sample in samples {
        bytes.extend_from_slice(&narrowing.narrow(sample).to_le_bytes());
    }
    bytes
}

/// Encodes 16-bit samples as little-endian bytes.
pub fn samples_to_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Decodes little-endian bytes into 16-bit samples; a trailing odd byte is ignored.
pub fn bytes_to_samples(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(defaults::BYTES_PER_SAMPLE)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}
