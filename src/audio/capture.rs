//! Microphone capture
//! The cpal stream lives on its own thread; frames leave it only through a channel

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SizedSample};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use thiserror::Error;
use tokio::sync::mpsc;

use super::{calculate_rms, AudioDenoiser, AutoGain, FRAME_DURATION_MS};

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("No input device available")]
    NoDevice,
    #[error("Device '{0}' not found")]
    DeviceNotFound(String),
    #[error("Failed to enumerate devices: {0}")]
    Devices(String),
    #[error("Failed to get input config: {0}")]
    Config(String),
    #[error("Unsupported sample format: {0}")]
    UnsupportedFormat(String),
    #[error("Audio stream error: {0}")]
    Stream(String),
    #[error("Capture thread exited before the stream started")]
    Thread,
}

/// Processing applied on the capture thread
#[derive(Debug, Clone, Default)]
pub struct CaptureOptions {
    /// Input device by name, `None` for the default device
    pub device_name: Option<String>,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    pub start_muted: bool,
}

/// One ~20ms mono frame at the device rate
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

/// Handle to a running microphone stream.
/// Dropping it stops the stream.
pub struct MicrophoneCapture {
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
    muted: Arc<AtomicBool>,
    sample_rate: u32,
    device_name: String,
}

impl MicrophoneCapture {
    /// Open the device and start streaming frames.
    /// Blocks until the stream is playing (or failed to start).
    pub fn start(
        options: CaptureOptions,
    ) -> Result<(Self, mpsc::UnboundedReceiver<CapturedFrame>), CaptureError> {
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(u32, String), CaptureError>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let muted = Arc::new(AtomicBool::new(options.start_muted));
        let thread_muted = muted.clone();

        let thread = std::thread::Builder::new()
            .name("mic-capture".into())
            .spawn(move || {
                // cpal::Stream n'est pas Send, il reste sur ce thread
                match open_stream(&options, frame_tx, thread_muted) {
                    Ok((stream, rate, name)) => {
                        let _ = ready_tx.send(Ok((rate, name)));
                        let _ = stop_rx.recv();
                        drop(stream);
                        tracing::info!("Audio capture stopped");
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })
            .map_err(|_| CaptureError::Thread)?;

        let (sample_rate, device_name) = ready_rx.recv().map_err(|_| CaptureError::Thread)??;

        Ok((
            Self {
                stop_tx: Some(stop_tx),
                thread: Some(thread),
                muted,
                sample_rate,
                device_name,
            },
            frame_rx,
        ))
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Muted capture keeps producing frames, zeroed
    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::SeqCst);
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.stop_tx.is_some()
    }

    /// Stop capturing. Idempotent.
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for MicrophoneCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

fn find_device(host: &cpal::Host, name: Option<&str>) -> Result<cpal::Device, CaptureError> {
    match name {
        Some(device_name) => {
            let mut devices = host
                .input_devices()
                .map_err(|e| CaptureError::Devices(e.to_string()))?;
            devices
                .find(|d| d.name().map(|n| n == device_name).unwrap_or(false))
                .ok_or_else(|| CaptureError::DeviceNotFound(device_name.to_string()))
        }
        None => host.default_input_device().ok_or(CaptureError::NoDevice),
    }
}

fn open_stream(
    options: &CaptureOptions,
    frame_tx: mpsc::UnboundedSender<CapturedFrame>,
    muted: Arc<AtomicBool>,
) -> Result<(cpal::Stream, u32, String), CaptureError> {
    let host = cpal::default_host();
    let device = find_device(&host, options.device_name.as_deref())?;
    let device_name = device.name().unwrap_or_default();

    // Config par défaut du périphérique, on ne force rien
    let supported = device
        .default_input_config()
        .map_err(|e| CaptureError::Config(e.to_string()))?;

    tracing::info!(
        "Starting audio capture on {}: {} Hz, {} channels, {:?}",
        device_name,
        supported.sample_rate().0,
        supported.channels(),
        supported.sample_format()
    );

    let config = supported.config();
    let pipeline = FramePipeline::new(
        config.sample_rate.0,
        config.channels as usize,
        options,
        frame_tx,
        muted,
    );

    let stream = match supported.sample_format() {
        SampleFormat::F32 => build_stream::<f32>(&device, &config, pipeline, |s| s),
        SampleFormat::I16 => {
            build_stream::<i16>(&device, &config, pipeline, |s| s as f32 / i16::MAX as f32)
        }
        SampleFormat::U16 => build_stream::<u16>(&device, &config, pipeline, |s| {
            (s as f32 / u16::MAX as f32) * 2.0 - 1.0
        }),
        format => return Err(CaptureError::UnsupportedFormat(format!("{:?}", format))),
    }?;

    stream
        .play()
        .map_err(|e| CaptureError::Stream(e.to_string()))?;

    Ok((stream, config.sample_rate.0, device_name))
}

fn build_stream<T: SizedSample>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut pipeline: FramePipeline,
    to_f32: fn(T) -> f32,
) -> Result<cpal::Stream, CaptureError> {
    let mut scratch: Vec<f32> = Vec::new();
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                scratch.clear();
                scratch.extend(data.iter().map(|&s| to_f32(s)));
                pipeline.push(&scratch);
            },
            |err| tracing::error!("Audio capture error: {}", err),
            None,
        )
        .map_err(|e| CaptureError::Stream(e.to_string()))
}

/// Downmix, frame, denoise and gain, all on the audio thread
struct FramePipeline {
    sample_rate: u32,
    channels: usize,
    samples_per_frame: usize,
    buffer: Vec<f32>,
    denoiser: AudioDenoiser,
    agc: AutoGain,
    muted: Arc<AtomicBool>,
    frame_tx: mpsc::UnboundedSender<CapturedFrame>,
    frames_sent: u64,
}

impl FramePipeline {
    fn new(
        sample_rate: u32,
        channels: usize,
        options: &CaptureOptions,
        frame_tx: mpsc::UnboundedSender<CapturedFrame>,
        muted: Arc<AtomicBool>,
    ) -> Self {
        let samples_per_frame = (sample_rate * FRAME_DURATION_MS / 1000) as usize;
        Self {
            sample_rate,
            channels: channels.max(1),
            samples_per_frame,
            buffer: Vec::with_capacity(samples_per_frame * 2),
            denoiser: AudioDenoiser::new(sample_rate, options.noise_suppression),
            agc: AutoGain::new(options.auto_gain_control),
            muted,
            frame_tx,
            frames_sent: 0,
        }
    }

    fn push(&mut self, data: &[f32]) {
        if self.channels > 1 {
            for chunk in data.chunks(self.channels) {
                self.buffer.push(chunk.iter().sum::<f32>() / chunk.len() as f32);
            }
        } else {
            self.buffer.extend_from_slice(data);
        }

        while self.buffer.len() >= self.samples_per_frame {
            let frame: Vec<f32> = self.buffer.drain(..self.samples_per_frame).collect();
            self.emit(frame);
        }
    }

    fn emit(&mut self, frame: Vec<f32>) {
        let mut samples = if self.muted.load(Ordering::SeqCst) {
            vec![0.0; frame.len()]
        } else {
            self.denoiser.process(&frame)
        };
        if samples.is_empty() {
            return;
        }
        self.agc.process(&mut samples);

        self.frames_sent += 1;
        if self.frames_sent % 100 == 0 {
            tracing::trace!(
                "Captured {} frames, rms {:.4}",
                self.frames_sent,
                calculate_rms(&samples)
            );
        }

        // Receiver gone: capture is being torn down
        let _ = self.frame_tx.send(CapturedFrame {
            samples,
            sample_rate: self.sample_rate,
        });
    }
}
