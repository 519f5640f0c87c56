//! Sample conversion helpers shared by the engines and the stream pipeline.

use serde::Serialize;

/// Samples produced by one engine call, at the engine's native rate.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AudioChunk {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioChunk {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self { samples, sample_rate }
    }

    pub fn empty(sample_rate: u32) -> Self {
        Self::new(Vec::new(), sample_rate)
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Convert f32 [-1.0, 1.0] samples to i16, clamping out-of-range values.
pub fn to_pcm16(samples: &[f32]) -> impl Iterator<Item = i16> + '_ {
    const I16_MAX_F32: f32 = i16::MAX as f32;
    samples.iter().map(|&s| {
        let s = if s.is_nan() { 0.0 } else { s };
        (s.clamp(-1.0, 1.0) * I16_MAX_F32) as i16
    })
}

/// Little-endian 16-bit PCM bytes for `samples`.
pub fn pcm16_le_bytes(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for v in to_pcm16(samples) {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Linear-interpolation resampler. Output length is
/// `round(len * to_rate / from_rate)`.
pub fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || from_rate == 0 || to_rate == 0 || samples.is_empty() {
        return samples.to_vec();
    }
    stretch(samples, to_rate as f64 / from_rate as f64)
}

/// Play `samples` `speed` times faster by rescaling their length.
///
/// This is a plain playback-rate change, so pitch moves with it.
pub fn apply_speed(samples: Vec<f32>, speed: f32) -> Vec<f32> {
    if !speed.is_finite() || speed <= 0.0 || (speed - 1.0).abs() < 1e-3 || samples.is_empty() {
        return samples;
    }
    stretch(&samples, 1.0 / speed as f64)
}

fn stretch(samples: &[f32], ratio: f64) -> Vec<f32> {
    let out_len = (samples.len() as f64 * ratio).round() as usize;
    if out_len == 0 {
        return Vec::new();
    }
    let last = samples.len() - 1;
    let mut out = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let pos = i as f64 / ratio;
        let idx = (pos.floor() as usize).min(last);
        let frac = (pos - idx as f64) as f32;
        let a = samples[idx];
        let b = samples[(idx + 1).min(last)];
        out.push(a + (b - a) * frac.clamp(0.0, 1.0));
    }
    out
}
