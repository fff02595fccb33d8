//! Automatic gain control for captured microphone frames

/// Level the gain stage steers towards (RMS)
const TARGET_RMS: f32 = 0.1;
/// Below this the frame is treated as silence and the gain is left alone
const NOISE_FLOOR_RMS: f32 = 0.005;
const MIN_GAIN: f32 = 0.5;
const MAX_GAIN: f32 = 8.0;
/// Gain moves this fraction of the way to its target per frame
const SMOOTHING: f32 = 0.1;

/// Slow-moving gain stage: raises quiet voices, tames loud ones
pub struct AutoGain {
    gain: f32,
    enabled: bool,
}

impl AutoGain {
    pub fn new(enabled: bool) -> Self {
        Self { gain: 1.0, enabled }
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }

    /// Apply gain in place, clamping to [-1, 1]
    pub fn process(&mut self, samples: &mut [f32]) {
        if !self.enabled || samples.is_empty() {
            return;
        }

        let rms = super::calculate_rms(samples);
        if rms > NOISE_FLOOR_RMS {
            let wanted = (TARGET_RMS / rms).clamp(MIN_GAIN, MAX_GAIN);
            self.gain += (wanted - self.gain) * SMOOTHING;
        }

        for sample in samples.iter_mut() {
            *sample = (*sample * self.gain).clamp(-1.0, 1.0);
        }
    }
}
