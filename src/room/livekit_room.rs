//! `MediaRoom` over a LiveKit room.
//! Data messages go through `publish_data` with the topic set and reliable delivery;
//! the avatar's audio track is played locally when playback is enabled.

use async_trait::async_trait;
use futures::StreamExt;
use livekit::participant::{ConnectionQuality, Participant};
use livekit::track::RemoteTrack;
use livekit::webrtc::audio_stream::native::NativeAudioStream;
use livekit::webrtc::audio_track::RtcAudioTrack;
use livekit::{DataPacket, Room, RoomOptions};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::track::MicrophoneTrack;
use super::{
    LocalAudioTrack, MediaRoom, MicrophoneOptions, RawQuality, RoomError, RoomEvent, TrackKind,
};
use crate::audio::{AudioPlayback, CHANNELS, SAMPLE_RATE};
use crate::events::EventBus;

struct RoomInner {
    events: EventBus<RoomEvent>,
    room: RwLock<Option<Arc<Room>>>,
    outbox: Mutex<Option<mpsc::UnboundedSender<(String, Vec<u8>)>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    microphone: Mutex<Option<Arc<MicrophoneTrack>>>,
    playback: Mutex<Option<Arc<AudioPlayback>>>,
    connected: AtomicBool,
}

impl RoomInner {
    fn mark_disconnected(&self, reason: &str) {
        if self.connected.swap(false, Ordering::SeqCst) {
            tracing::info!("Room disconnected: {}", reason);
            self.events.emit(&RoomEvent::Disconnected {
                reason: reason.to_string(),
            });
        }
    }

    fn handle_event(&self, event: livekit::RoomEvent) {
        match event {
            livekit::RoomEvent::TrackSubscribed { track, .. } => {
                let (sid, kind) = remote_track_info(&track);
                tracing::info!("Subscribed to remote {:?} track {}", kind, sid);
                if let RemoteTrack::Audio(audio) = &track {
                    let playback = self.playback.lock().clone();
                    if let Some(playback) = playback {
                        let handle = tokio::spawn(play_remote_audio(audio.rtc_track(), playback));
                        self.tasks.lock().push(handle);
                    }
                }
                self.events.emit(&RoomEvent::TrackSubscribed { sid, kind });
            }
            livekit::RoomEvent::TrackUnsubscribed { track, .. } => {
                let (sid, kind) = remote_track_info(&track);
                self.events.emit(&RoomEvent::TrackUnsubscribed { sid, kind });
            }
            livekit::RoomEvent::DataReceived { payload, topic, .. } => {
                self.events.emit(&RoomEvent::DataReceived {
                    topic,
                    payload: payload.as_ref().clone(),
                });
            }
            livekit::RoomEvent::ConnectionQualityChanged {
                quality,
                participant: Participant::Local(_),
            } => {
                self.events
                    .emit(&RoomEvent::ConnectionQualityChanged(raw_quality(quality)));
            }
            livekit::RoomEvent::Reconnecting => {
                tracing::warn!("Room reconnecting");
                self.events
                    .emit(&RoomEvent::ConnectionQualityChanged(RawQuality::Lost));
            }
            livekit::RoomEvent::Disconnected { reason } => {
                self.mark_disconnected(reason.as_str_name());
            }
            other => tracing::trace!("Dropping room event: {:?}", other),
        }
    }
}

/// LiveKit's per-participant quality to the transport scale
pub fn raw_quality(quality: ConnectionQuality) -> RawQuality {
    match quality {
        ConnectionQuality::Excellent => RawQuality::Excellent,
        ConnectionQuality::Good => RawQuality::Good,
        ConnectionQuality::Poor => RawQuality::Poor,
        ConnectionQuality::Lost => RawQuality::Lost,
    }
}

fn remote_track_info(track: &RemoteTrack) -> (String, TrackKind) {
    match track {
        RemoteTrack::Audio(audio) => (String::from(audio.sid()), TrackKind::Audio),
        RemoteTrack::Video(video) => (String::from(video.sid()), TrackKind::Video),
    }
}

async fn play_remote_audio(track: RtcAudioTrack, playback: Arc<AudioPlayback>) {
    let mut stream = NativeAudioStream::new(track, SAMPLE_RATE as i32, CHANNELS as i32);
    while let Some(frame) = stream.next().await {
        let samples: Vec<f32> = frame.data.iter().map(|s| *s as f32 / 32768.0).collect();
        playback.push_samples(&samples);
    }
    tracing::debug!("Avatar audio stream ended");
}

pub struct LiveKitRoom {
    topics: Vec<String>,
    play_remote_audio: bool,
    inner: Arc<RoomInner>,
}

impl LiveKitRoom {
    /// `topics` are the data topics `send_data` accepts
    pub fn new(topics: Vec<String>, play_remote_audio: bool) -> Self {
        Self {
            topics,
            play_remote_audio,
            inner: Arc::new(RoomInner {
                events: EventBus::new(),
                room: RwLock::new(None),
                outbox: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
                microphone: Mutex::new(None),
                playback: Mutex::new(None),
                connected: AtomicBool::new(false),
            }),
        }
    }

    fn current_room(&self) -> Result<Arc<Room>, RoomError> {
        self.inner.room.read().clone().ok_or(RoomError::NotConnected)
    }

    fn spawn_event_loop(&self, mut events: mpsc::UnboundedReceiver<livekit::RoomEvent>) {
        let inner = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(inner) = inner.upgrade() else { return };
                inner.handle_event(event);
            }
            if let Some(inner) = inner.upgrade() {
                inner.mark_disconnected("event stream closed");
            }
        });
        self.inner.tasks.lock().push(handle);
    }

    fn spawn_outbox(&self, room: Arc<Room>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<(String, Vec<u8>)>();
        let handle = tokio::spawn(async move {
            while let Some((topic, payload)) = rx.recv().await {
                let packet = DataPacket {
                    payload,
                    topic: Some(topic.clone()),
                    reliable: true,
                    ..Default::default()
                };
                if let Err(e) = room.local_participant().publish_data(packet).await {
                    tracing::warn!("Failed to send on '{}': {}", topic, e);
                }
            }
        });
        *self.inner.outbox.lock() = Some(tx);
        self.inner.tasks.lock().push(handle);
    }
}

#[async_trait]
impl MediaRoom for LiveKitRoom {
    async fn connect(&self, url: &str, token: &str) -> Result<(), RoomError> {
        if self.inner.room.read().is_some() {
            return Err(RoomError::AlreadyConnected);
        }

        let (room, events) = Room::connect(url, token, RoomOptions::default())
            .await
            .map_err(|e| RoomError::Connect(e.to_string()))?;
        let room = Arc::new(room);

        if self.play_remote_audio {
            match tokio::task::spawn_blocking(|| AudioPlayback::start(None)).await {
                Ok(Ok(playback)) => *self.inner.playback.lock() = Some(Arc::new(playback)),
                Ok(Err(e)) => tracing::warn!("Avatar audio playback unavailable: {}", e),
                Err(e) => tracing::warn!("Avatar audio playback unavailable: {}", e),
            }
        }

        *self.inner.room.write() = Some(room.clone());
        self.inner.connected.store(true, Ordering::SeqCst);
        self.spawn_outbox(room.clone());
        self.spawn_event_loop(events);

        tracing::info!("Connected to room '{}'", room.name());
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), RoomError> {
        let room = self.inner.room.write().take();
        let Some(room) = room else {
            return Ok(());
        };

        if let Some(mic) = self.inner.microphone.lock().take() {
            mic.stop();
        }
        self.inner.outbox.lock().take();
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        self.inner.playback.lock().take();

        let result = room
            .close()
            .await
            .map_err(|e| RoomError::Connect(format!("Failed to close room: {}", e)));
        self.inner.mark_disconnected("client initiated");
        result
    }

    fn send_data(&self, topic: &str, payload: Vec<u8>) -> Result<(), RoomError> {
        if !self.topics.iter().any(|t| t == topic) {
            return Err(RoomError::UnknownTopic(topic.to_string()));
        }
        let outbox = self.inner.outbox.lock();
        let tx = outbox.as_ref().ok_or(RoomError::NotConnected)?;
        tx.send((topic.to_string(), payload))
            .map_err(|e| RoomError::Send(e.to_string()))
    }

    async fn publish_microphone(
        &self,
        options: MicrophoneOptions,
    ) -> Result<Arc<dyn LocalAudioTrack>, RoomError> {
        let room = self.current_room()?;
        let mic = MicrophoneTrack::publish(&room.local_participant(), &options).await?;

        tracing::info!("Published microphone track {}", mic.sid());
        *self.inner.microphone.lock() = Some(mic.clone());
        Ok(mic)
    }

    async fn unpublish_track(&self, sid: &str) -> Result<(), RoomError> {
        let mic = {
            let mut slot = self.inner.microphone.lock();
            match slot.as_ref() {
                Some(mic) if mic.sid() == sid => slot.take(),
                _ => None,
            }
        };
        let mic = mic.ok_or_else(|| RoomError::TrackNotFound(sid.to_string()))?;
        mic.stop();

        let room = self.current_room()?;
        room.local_participant()
            .unpublish_track(&mic.track_sid())
            .await
            .map_err(|e| RoomError::Publish(e.to_string()))?;
        tracing::info!("Unpublished track {}", sid);
        Ok(())
    }

    fn events(&self) -> &EventBus<RoomEvent> {
        &self.inner.events
    }
}
