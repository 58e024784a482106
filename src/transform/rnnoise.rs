//! RNNoise noise suppression via the pure-Rust `nnnoiseless` port.

use super::frame_transform::FrameTransform;
use crate::audio::format::PCM_SCALE;
use crate::error::Result;
use nnnoiseless::DenoiseState;

/// RNNoise transform with built-in weights. 480-sample frames at 48 kHz.
///
/// The model works on floats in the i16 range, so frames are scaled up on the
/// way in and back down on the way out. The attenuation limit is applied by
/// mixing a share of the noisy input back into the denoised signal.
pub struct RnnoiseTransform {
    state: Box<DenoiseState<'static>>,
    atten_lim_db: f32,
    noisy_mix: f32,
    scaled_in: Vec<f32>,
    scaled_out: Vec<f32>,
}

impl RnnoiseTransform {
    pub fn new(atten_lim_db: f32) -> Self {
        let frame = DenoiseState::<'static>::FRAME_SIZE;
        Self {
            state: DenoiseState::new(),
            atten_lim_db,
            noisy_mix: noisy_mix_for(atten_lim_db),
            scaled_in: vec![0.0; frame],
            scaled_out: vec![0.0; frame],
        }
    }

    pub fn atten_lim_db(&self) -> f32 {
        self.atten_lim_db
    }
}

/// Share of the noisy signal kept in the output for a given limit.
///
/// A limit of 100 dB or more is effectively unlimited suppression; 0 dB or
/// less disables it.
pub fn noisy_mix_for(atten_lim_db: f32) -> f32 {
    if atten_lim_db <= 0.0 {
        1.0
    } else {
        10f32.powf(-atten_lim_db / 20.0)
    }
}

impl FrameTransform for RnnoiseTransform {
    fn frame_length(&self) -> usize {
        DenoiseState::<'static>::FRAME_SIZE
    }

    fn process_frame(&mut self, input: &[f32], output: &mut [f32]) -> Result<f32> {
        for (scaled, sample) in self.scaled_in.iter_mut().zip(input) {
            *scaled = sample * PCM_SCALE;
        }
        let speech_prob = self
            .state
            .process_frame(&mut self.scaled_out, &self.scaled_in);

        let keep = 1.0 - self.noisy_mix;
        for ((out, denoised), noisy) in output.iter_mut().zip(&self.scaled_out).zip(input) {
            *out = (denoised / PCM_SCALE) * keep + noisy * self.noisy_mix;
        }
        Ok(speech_prob)
    }

    fn set_atten_lim(&mut self, lim_db: f32) {
        self.atten_lim_db = lim_db;
        self.noisy_mix = noisy_mix_for(lim_db);
    }

    fn name(&self) -> &str {
        "rnnoise"
    }
}
