//! Microphone → agent
//! Frames come off the capture thread, are converted to 16-bit PCM at the announced
//! input rate, and sent as `user_audio_chunk` messages while the agent is connected.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::AgentConnection;
use crate::audio::{pcm, CaptureError, CaptureOptions, CapturedFrame, MicrophoneCapture};

const LOG_EVERY: u64 = 100;

pub struct MicrophoneUplink {
    capture: MicrophoneCapture,
    pump: Option<JoinHandle<()>>,
    input_rate: u32,
}

impl MicrophoneUplink {
    /// Open the microphone, announce its format to the agent and start forwarding
    pub async fn start(agent: Arc<AgentConnection>, options: CaptureOptions) -> Result<Self, CaptureError> {
        let (capture, frames) = tokio::task::spawn_blocking(move || MicrophoneCapture::start(options))
            .await
            .map_err(|_| CaptureError::Thread)??;

        let input_rate = pcm::closest_supported_rate(capture.sample_rate());
        tracing::info!(
            "Microphone '{}' at {} Hz, sending pcm_{}",
            capture.device_name(),
            capture.sample_rate(),
            input_rate
        );
        agent.set_input_format(pcm::input_audio_format(capture.sample_rate()));

        let pump = tokio::spawn(pump_frames(frames, agent, input_rate));
        Ok(Self {
            capture,
            pump: Some(pump),
            input_rate,
        })
    }

    pub fn input_rate(&self) -> u32 {
        self.input_rate
    }

    pub fn set_muted(&self, muted: bool) {
        self.capture.set_muted(muted);
    }

    pub fn is_muted(&self) -> bool {
        self.capture.is_muted()
    }

    pub fn stop(&mut self) {
        self.capture.stop();
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

impl Drop for MicrophoneUplink {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Convert a captured frame to the bytes the agent expects
pub fn frame_to_pcm(frame: &CapturedFrame, input_rate: u32) -> Vec<u8> {
    let bytes = pcm::samples_to_bytes(&pcm::f32_to_i16(&frame.samples));
    pcm::resample_bytes(bytes, frame.sample_rate, input_rate)
}

async fn pump_frames(
    mut frames: mpsc::UnboundedReceiver<CapturedFrame>,
    agent: Arc<AgentConnection>,
    input_rate: u32,
) {
    let mut sent = 0u64;
    while let Some(frame) = frames.recv().await {
        if !agent.is_connected() {
            continue;
        }
        if agent.send_user_audio(&frame_to_pcm(&frame, input_rate)) {
            sent += 1;
            if sent % LOG_EVERY == 0 {
                tracing::debug!("Sent {} microphone chunks to agent", sent);
            }
        }
    }
    tracing::info!("Microphone uplink stopped after {} chunks", sent);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_to_pcm_same_rate() {
        let frame = CapturedFrame {
            samples: vec![0.0, 0.5, -0.5, 1.0],
            sample_rate: 48000,
        };
        let bytes = frame_to_pcm(&frame, 48000);
        assert_eq!(bytes.len(), 8);
        assert_eq!(pcm::bytes_to_samples(&bytes)[0], 0);
    }

    #[test]
    fn test_frame_to_pcm_resamples_unsupported_rate() {
        let frame = CapturedFrame {
            samples: vec![0.1; 1920],
            sample_rate: 96000,
        };
        let bytes = frame_to_pcm(&frame, pcm::closest_supported_rate(96000));
        assert_eq!(bytes.len(), 960 * 2);
    }
}
