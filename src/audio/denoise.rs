//! Noise suppression using nnnoiseless (RNNoise-based)
//! Runs on the capture thread, before frames are handed to the uplink

use nnnoiseless::DenoiseState;

use super::resample_f32;

/// Frame size required by nnnoiseless (480 samples at 48kHz = 10ms)
const DENOISE_FRAME_SIZE: usize = 480;

/// Rate nnnoiseless works at
const DENOISE_SAMPLE_RATE: u32 = 48000;

/// nnnoiseless works on i16-scaled floats
const I16_SCALE: f32 = 32768.0;

pub struct AudioDenoiser {
    state: Box<DenoiseState<'static>>,
    input_buffer: Vec<f32>,
    enabled: bool,
    source_sample_rate: u32,
}

impl AudioDenoiser {
    pub fn new(source_sample_rate: u32, enabled: bool) -> Self {
        Self {
            state: DenoiseState::new(),
            input_buffer: Vec::with_capacity(DENOISE_FRAME_SIZE * 4),
            enabled,
            source_sample_rate,
        }
    }

    /// Denoise a frame at the source rate.
    /// May return fewer samples than given while a 10ms frame is being filled.
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        if !self.enabled {
            return samples.to_vec();
        }

        let samples_48k = resample_f32(samples, self.source_sample_rate, DENOISE_SAMPLE_RATE);
        self.input_buffer.extend_from_slice(&samples_48k);

        let mut output = Vec::with_capacity(self.input_buffer.len());
        let mut input_frame = [0.0f32; DENOISE_FRAME_SIZE];
        let mut output_frame = [0.0f32; DENOISE_FRAME_SIZE];

        while self.input_buffer.len() >= DENOISE_FRAME_SIZE {
            for (dst, src) in input_frame
                .iter_mut()
                .zip(self.input_buffer.drain(..DENOISE_FRAME_SIZE))
            {
                *dst = src * I16_SCALE;
            }

            self.state.process_frame(&mut output_frame, &input_frame);
            output.extend(output_frame.iter().map(|s| (s / I16_SCALE).clamp(-1.0, 1.0)));
        }

        resample_f32(&output, DENOISE_SAMPLE_RATE, self.source_sample_rate)
    }
}
