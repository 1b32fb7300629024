//! Per-frame speech features.

use parley_common::config::VadConfig;

/// Short-term features of one audio frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameFeatures {
    /// Mean square amplitude.
    pub energy: f32,
    /// Fraction of adjacent sample pairs that change sign.
    pub zcr: f32,
    /// Fraction of samples whose magnitude is below the near-zero amplitude.
    pub near_zero_ratio: f32,
}

impl FrameFeatures {
    pub fn analyze(samples: &[f32], near_zero_amplitude: f32) -> Self {
        if samples.is_empty() {
            return Self {
                energy: 0.0,
                zcr: 0.0,
                near_zero_ratio: 1.0,
            };
        }

        let n = samples.len() as f32;
        let energy = samples.iter().map(|s| s * s).sum::<f32>() / n;
        let crossings = samples
            .windows(2)
            .filter(|w| (w[0] >= 0.0) != (w[1] >= 0.0))
            .count();
        let zcr = if samples.len() > 1 {
            crossings as f32 / (samples.len() - 1) as f32
        } else {
            0.0
        };
        let near_zero = samples
            .iter()
            .filter(|s| s.abs() < near_zero_amplitude)
            .count();

        Self {
            energy,
            zcr,
            near_zero_ratio: near_zero as f32 / n,
        }
    }

    /// Energy above threshold and zero-crossing rate below threshold.
    pub fn is_speech(&self, config: &VadConfig) -> bool {
        self.energy > config.energy_threshold && self.zcr < config.zcr_threshold
    }

    /// The frame is effectively silent hardware: a muted or disconnected microphone.
    pub fn is_mic_off(&self, config: &VadConfig) -> bool {
        self.near_zero_ratio > config.mic_off_ratio
    }
}
