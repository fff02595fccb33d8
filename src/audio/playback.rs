//! Local playback of the avatar's audio track
//! Decoded 48kHz frames are queued from async code and drained by the cpal output thread

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::StreamConfig;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use super::{CHANNELS, SAMPLES_PER_FRAME, SAMPLE_RATE};

/// Cap on queued audio (~2s) so a stalled device does not grow memory without bound
const MAX_BUFFERED_SAMPLES: usize = SAMPLE_RATE as usize * 2;

/// Playback to speakers using cpal
pub struct AudioPlayback {
    buffer: Arc<Mutex<VecDeque<f32>>>,
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl AudioPlayback {
    /// Open an output device (None for default) and start draining the queue
    pub fn start(device_name: Option<String>) -> Result<Self, String> {
        let buffer = Arc::new(Mutex::new(VecDeque::with_capacity(SAMPLES_PER_FRAME * 10)));
        let thread_buffer = buffer.clone();
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(), String>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let thread = std::thread::Builder::new()
            .name("avatar-playback".into())
            .spawn(move || match open_output(device_name.as_deref(), thread_buffer) {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    let _ = stop_rx.recv();
                    drop(stream);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| format!("Failed to spawn playback thread: {}", e))?;

        ready_rx
            .recv()
            .map_err(|_| "Playback thread exited".to_string())??;

        Ok(Self {
            buffer,
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        })
    }

    /// Queue samples for playback
    pub fn push_samples(&self, samples: &[f32]) {
        let mut buf = self.buffer.lock();
        buf.extend(samples.iter().copied());
        let excess = buf.len().saturating_sub(MAX_BUFFERED_SAMPLES);
        if excess > 0 {
            buf.drain(..excess);
        }
    }

    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for AudioPlayback {
    fn drop(&mut self) {
        self.stop();
    }
}

fn open_output(
    device_name: Option<&str>,
    buffer: Arc<Mutex<VecDeque<f32>>>,
) -> Result<cpal::Stream, String> {
    let host = cpal::default_host();
    let device = match device_name {
        Some(name) => host
            .output_devices()
            .map_err(|e| format!("Failed to enumerate devices: {}", e))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| format!("Device '{}' not found", name))?,
        None => host
            .default_output_device()
            .ok_or("No output device available")?,
    };

    tracing::info!("Using output device: {}", device.name().unwrap_or_default());

    let config = StreamConfig {
        channels: CHANNELS,
        sample_rate: cpal::SampleRate(SAMPLE_RATE),
        buffer_size: cpal::BufferSize::Default,
    };

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let mut buf = buffer.lock();
                for sample in data.iter_mut() {
                    *sample = buf.pop_front().unwrap_or(0.0);
                }
            },
            |err| tracing::error!("Audio output error: {}", err),
            None,
        )
        .map_err(|e| format!("Failed to build output stream: {}", e))?;

    stream
        .play()
        .map_err(|e| format!("Failed to start stream: {}", e))?;

    Ok(stream)
}
