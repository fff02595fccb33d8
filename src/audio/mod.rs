pub mod capture;
pub mod denoise;
pub mod gain;
pub mod pcm;
pub mod playback;

pub use capture::{CaptureError, CaptureOptions, CapturedFrame, MicrophoneCapture};
pub use denoise::AudioDenoiser;
pub use gain::AutoGain;
pub use playback::AudioPlayback;

/// Sample rate the avatar expects for `avatar.speak_audio` payloads
pub const AVATAR_SAMPLE_RATE: u32 = 24000;
/// Agent output rate assumed until the conversation metadata says otherwise
pub const DEFAULT_AGENT_SAMPLE_RATE: u32 = 16000;

/// Rate of the room's audio tracks, both directions
pub const SAMPLE_RATE: u32 = 48000;
/// Mono voice
pub const CHANNELS: u16 = 1;
/// Capture frame length
pub const FRAME_DURATION_MS: u32 = 20;
/// One capture frame at the track rate (960)
pub const SAMPLES_PER_FRAME: usize = (SAMPLE_RATE * FRAME_DURATION_MS / 1000) as usize;

/// Linear resampling for f32 frames moving between the device rate and the track rate
pub fn resample_f32(samples: &[f32], source_rate: u32, target_rate: u32) -> Vec<f32> {
    if source_rate == target_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = source_rate as f64 / target_rate as f64;
    let output_len = (samples.len() as f64 / ratio).round() as usize;
    let last = samples.len() - 1;
    let mut output = Vec::with_capacity(output_len);

    for i in 0..output_len {
        let src_idx = i as f64 * ratio;
        let idx_floor = (src_idx.floor() as usize).min(last);
        let idx_ceil = (idx_floor + 1).min(last);
        let frac = (src_idx - idx_floor as f64) as f32;
        let s1 = samples[idx_floor];
        let s2 = samples[idx_ceil];
        output.push(s1 + (s2 - s1) * frac);
    }

    output
}

/// RMS of a frame, used for speaking detection in logs
pub fn calculate_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resample_f32_to_track_rate() {
        let frame = vec![0.25f32; 480];
        let out = resample_f32(&frame, 24000, SAMPLE_RATE);
        assert_eq!(out.len(), SAMPLES_PER_FRAME);
        assert!(out.iter().all(|s| (*s - 0.25).abs() < 1e-6));
    }

    #[test]
    fn test_rms_silent() {
        assert_eq!(calculate_rms(&[0.0; 960]), 0.0);
        assert!((calculate_rms(&[0.5; 960]) - 0.5).abs() < 1e-6);
    }
}
