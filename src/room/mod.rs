//! Media room transport
//! The avatar backend is reached through an opaque real-time room: remote audio/video
//! tracks, one local microphone track, and reliable ordered data messages tagged by topic.

pub mod livekit_room;
pub mod track;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::events::EventBus;

pub use self::livekit_room::LiveKitRoom;

#[derive(Error, Debug)]
pub enum RoomError {
    #[error("Room is not connected")]
    NotConnected,
    #[error("Room is already connected")]
    AlreadyConnected,
    #[error("Failed to connect: {0}")]
    Connect(String),
    #[error("Unknown data topic '{0}'")]
    UnknownTopic(String),
    #[error("Failed to send data: {0}")]
    Send(String),
    #[error("Failed to publish track: {0}")]
    Publish(String),
    #[error("Track '{0}' not found")]
    TrackNotFound(String),
    #[error("Microphone error: {0}")]
    Microphone(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

/// Quality scale reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawQuality {
    Excellent,
    Good,
    Poor,
    Lost,
    Unknown,
}

#[derive(Debug, Clone)]
pub enum RoomEvent {
    TrackSubscribed { sid: String, kind: TrackKind },
    TrackUnsubscribed { sid: String, kind: TrackKind },
    DataReceived { topic: Option<String>, payload: Vec<u8> },
    ConnectionQualityChanged(RawQuality),
    Disconnected { reason: String },
}

/// Capture constraints for the published microphone
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MicrophoneOptions {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    pub default_muted: bool,
    pub device_name: Option<String>,
}

impl Default for MicrophoneOptions {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
            default_muted: false,
            device_name: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalTrackEvent {
    Muted,
    Unmuted,
}

/// The outbound microphone track
pub trait LocalAudioTrack: Send + Sync {
    fn sid(&self) -> String;
    fn mute(&self);
    fn unmute(&self);
    fn is_muted(&self) -> bool;
    /// Stop capture. The track cannot be restarted.
    fn stop(&self);
    fn events(&self) -> &EventBus<LocalTrackEvent>;
}

#[async_trait]
pub trait MediaRoom: Send + Sync {
    async fn connect(&self, url: &str, token: &str) -> Result<(), RoomError>;

    async fn disconnect(&self) -> Result<(), RoomError>;

    /// Queue a reliable, ordered message on `topic`.
    /// Returns once queued; delivery is not awaited.
    fn send_data(&self, topic: &str, payload: Vec<u8>) -> Result<(), RoomError>;

    async fn publish_microphone(
        &self,
        options: MicrophoneOptions,
    ) -> Result<Arc<dyn LocalAudioTrack>, RoomError>;

    async fn unpublish_track(&self, sid: &str) -> Result<(), RoomError>;

    fn events(&self) -> &EventBus<RoomEvent>;
}
