use livekit::id::TrackSid;
use livekit::options::TrackPublishOptions;
use livekit::participant::LocalParticipant;
use livekit::publication::LocalTrackPublication;
use livekit::track::{LocalAudioTrack as RtcLocalAudioTrack, LocalTrack, TrackSource};
use livekit::webrtc::audio_frame::AudioFrame;
use livekit::webrtc::audio_source::native::NativeAudioSource;
use livekit::webrtc::audio_source::{AudioSourceOptions, RtcAudioSource};
use parking_lot::Mutex;
use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{LocalAudioTrack, LocalTrackEvent, MicrophoneOptions, RoomError};
use crate::audio::{
    pcm, resample_f32, CaptureOptions, CapturedFrame, MicrophoneCapture, CHANNELS, SAMPLE_RATE,
};
use crate::events::EventBus;

/// The native source takes 10ms frames
pub const TRACK_FRAME_SAMPLES: usize = (SAMPLE_RATE / 100) as usize;
const SOURCE_QUEUE_MS: u32 = 50;

/// Regroups device frames into 10ms i16 frames at the track rate
#[derive(Default)]
pub struct FrameAssembler {
    pending: Vec<i16>,
}

impl FrameAssembler {
    pub fn push(&mut self, frame: &CapturedFrame) -> Vec<Vec<i16>> {
        let resampled = resample_f32(&frame.samples, frame.sample_rate, SAMPLE_RATE);
        self.pending.extend(pcm::f32_to_i16(&resampled));

        let mut ready = Vec::with_capacity(self.pending.len() / TRACK_FRAME_SAMPLES);
        while self.pending.len() >= TRACK_FRAME_SAMPLES {
            ready.push(self.pending.drain(..TRACK_FRAME_SAMPLES).collect());
        }
        ready
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Microphone published to the LiveKit room.
/// Dropping it stops capture; the publication itself is removed by the room.
pub struct MicrophoneTrack {
    publication: LocalTrackPublication,
    capture: Mutex<Option<MicrophoneCapture>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    muted: AtomicBool,
    events: EventBus<LocalTrackEvent>,
}

impl MicrophoneTrack {
    /// Open the microphone, publish it as the participant's microphone source and start the pump
    pub async fn publish(
        participant: &LocalParticipant,
        options: &MicrophoneOptions,
    ) -> Result<Arc<Self>, RoomError> {
        let capture_options = CaptureOptions {
            device_name: options.device_name.clone(),
            noise_suppression: options.noise_suppression,
            auto_gain_control: options.auto_gain_control,
            start_muted: options.default_muted,
        };

        let (capture, frames) =
            tokio::task::spawn_blocking(move || MicrophoneCapture::start(capture_options))
                .await
                .map_err(|e| RoomError::Microphone(e.to_string()))?
                .map_err(|e| RoomError::Microphone(e.to_string()))?;

        tracing::info!(
            "Microphone '{}' opened at {} Hz",
            capture.device_name(),
            capture.sample_rate()
        );

        // débruitage et gain déjà faits côté capture
        let source = NativeAudioSource::new(
            AudioSourceOptions {
                echo_cancellation: options.echo_cancellation,
                noise_suppression: false,
                auto_gain_control: false,
            },
            SAMPLE_RATE,
            CHANNELS as u32,
            SOURCE_QUEUE_MS,
        );
        let track = RtcLocalAudioTrack::create_audio_track(
            "microphone",
            RtcAudioSource::Native(source.clone()),
        );

        let publication = participant
            .publish_track(
                LocalTrack::Audio(track),
                TrackPublishOptions {
                    source: TrackSource::Microphone,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| RoomError::Publish(e.to_string()))?;
        if options.default_muted {
            publication.mute();
        }

        let pump = tokio::spawn(pump_frames(frames, source));

        Ok(Arc::new(Self {
            publication,
            capture: Mutex::new(Some(capture)),
            pump: Mutex::new(Some(pump)),
            muted: AtomicBool::new(options.default_muted),
            events: EventBus::new(),
        }))
    }

    pub fn track_sid(&self) -> TrackSid {
        self.publication.sid()
    }

    fn set_muted(&self, muted: bool) {
        if self.muted.swap(muted, Ordering::SeqCst) == muted {
            return;
        }
        if let Some(capture) = self.capture.lock().as_ref() {
            capture.set_muted(muted);
        }
        if muted {
            self.publication.mute();
        } else {
            self.publication.unmute();
        }
        self.events.emit(if muted {
            &LocalTrackEvent::Muted
        } else {
            &LocalTrackEvent::Unmuted
        });
    }
}

impl LocalAudioTrack for MicrophoneTrack {
    fn sid(&self) -> String {
        String::from(self.publication.sid())
    }

    fn mute(&self) {
        self.set_muted(true);
    }

    fn unmute(&self) {
        self.set_muted(false);
    }

    fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        if let Some(mut capture) = self.capture.lock().take() {
            capture.stop();
        }
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }

    fn events(&self) -> &EventBus<LocalTrackEvent> {
        &self.events
    }
}

impl Drop for MicrophoneTrack {
    fn drop(&mut self) {
        LocalAudioTrack::stop(self);
    }
}

async fn pump_frames(
    mut frames: mpsc::UnboundedReceiver<CapturedFrame>,
    source: NativeAudioSource,
) {
    let mut assembler = FrameAssembler::default();
    let mut sent: u64 = 0;

    while let Some(frame) = frames.recv().await {
        for samples in assembler.push(&frame) {
            let frame = AudioFrame {
                data: Cow::Owned(samples),
                sample_rate: SAMPLE_RATE,
                num_channels: CHANNELS as u32,
                samples_per_channel: TRACK_FRAME_SAMPLES as u32,
            };
            if let Err(e) = source.capture_frame(&frame).await {
                tracing::debug!("Microphone frame rejected: {}", e);
                continue;
            }
            sent += 1;
            if sent % 1000 == 0 {
                tracing::debug!("Microphone track sent {} frames", sent);
            }
        }
    }

    tracing::info!("Microphone track pump finished after {} frames", sent);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device_frame(samples: usize, sample_rate: u32, value: f32) -> CapturedFrame {
        CapturedFrame {
            samples: vec![value; samples],
            sample_rate,
        }
    }

    #[test]
    fn test_device_frames_regrouped_into_10ms() {
        let mut assembler = FrameAssembler::default();

        // 20ms à 48kHz → deux trames de 10ms
        let ready = assembler.push(&device_frame(960, 48000, 0.5));
        assert_eq!(ready.len(), 2);
        assert!(ready.iter().all(|f| f.len() == TRACK_FRAME_SAMPLES));
        assert!(ready[0].iter().all(|s| *s == 16383));
        assert_eq!(assembler.pending_len(), 0);
    }

    #[test]
    fn test_partial_frames_carried_over() {
        let mut assembler = FrameAssembler::default();

        // 5ms à 16kHz → 240 échantillons à 48kHz, rien de prêt
        assert!(assembler.push(&device_frame(80, 16000, 0.0)).is_empty());
        assert_eq!(assembler.pending_len(), 240);

        let ready = assembler.push(&device_frame(80, 16000, 0.0));
        assert_eq!(ready.len(), 1);
        assert_eq!(assembler.pending_len(), 0);
    }
}
