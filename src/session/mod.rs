//! Avatar session controller
//!
//! Owns the media-room connection for one avatar session and drives it through
//! Inactive → Connecting → Connected → Disconnecting → Disconnected.
//! A controller is single-use: once Disconnected, build a new one.

pub mod api;
pub mod commands;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use thiserror::Error;

use crate::events::{EventBus, Subscription};
use crate::quality::{ConnectionQuality, ConnectionQualityMonitor};
use crate::room::{LocalAudioTrack, MediaRoom, MicrophoneOptions, RoomError, RoomEvent, TrackKind};
use crate::translator::{self, TaskEvent};
use crate::voice_chat::{VoiceChat, VoiceChatConfig, VoiceChatError, VoiceChatHost};

pub use api::{SessionApi, SessionApiClient, SessionApiError, SessionInfo};
pub use commands::{AvatarCommand, COMMAND_TOPIC};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session API error: {0}")]
    Api(#[from] SessionApiError),
    #[error("Room error: {0}")]
    Room(#[from] RoomError),
    #[error("Voice chat error: {0}")]
    VoiceChat(#[from] VoiceChatError),
    #[error("Session was stopped while starting")]
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Inactive,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DisconnectReason {
    UnknownReason,
    ClientInitiated,
    SessionStartFailed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(SessionState),
    ConnectionQualityChanged(ConnectionQuality),
    /// Both remote audio and video tracks are subscribed
    StreamReady,
    /// Translated backend event (talking, transcription, inactivity, push-to-talk)
    Server(TaskEvent),
    Disconnected(DisconnectReason),
}

#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    /// Publish the microphone into the room on start
    pub voice_chat: Option<VoiceChatConfig>,
}

/// The `SessionController` surface the audio relay talks to
pub trait SpeechSink: Send + Sync {
    /// Speak base64 PCM (16-bit mono, 24kHz). Returns false when nothing was sent.
    fn repeat_audio(&self, audio: String) -> bool;
    fn interrupt(&self) -> bool;
}

pub(crate) struct SessionInner {
    room: Arc<dyn MediaRoom>,
    api: Arc<dyn SessionApi>,
    config: SessionConfig,
    state: Mutex<SessionState>,
    room_connected: Mutex<bool>,
    session_info: Mutex<Option<SessionInfo>>,
    quality: Arc<ConnectionQualityMonitor>,
    voice_chat: VoiceChat,
    events: EventBus<SessionEvent>,
    subscriptions: Mutex<Vec<Subscription>>,
    remote_tracks: Mutex<HashMap<TrackKind, String>>,
}

#[derive(Clone)]
pub struct SessionController {
    inner: Arc<SessionInner>,
}

impl SessionController {
    pub fn new(room: Arc<dyn MediaRoom>, api: Arc<dyn SessionApi>, config: SessionConfig) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<SessionInner>| {
            let host: Weak<dyn VoiceChatHost> = weak.clone();
            SessionInner {
                room,
                api,
                config,
                state: Mutex::new(SessionState::Inactive),
                room_connected: Mutex::new(false),
                session_info: Mutex::new(None),
                quality: ConnectionQualityMonitor::new(),
                voice_chat: VoiceChat::new(host),
                events: EventBus::new(),
                subscriptions: Mutex::new(Vec::new()),
                remote_tracks: Mutex::new(HashMap::new()),
            }
        });
        Self { inner }
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.lock()
    }

    pub fn events(&self) -> &EventBus<SessionEvent> {
        &self.inner.events
    }

    pub fn voice_chat(&self) -> &VoiceChat {
        &self.inner.voice_chat
    }

    pub fn connection_quality(&self) -> ConnectionQuality {
        self.inner.quality.quality()
    }

    pub fn session_id(&self) -> Option<String> {
        self.inner.session_info.lock().as_ref().map(|i| i.session_id.clone())
    }

    /// Server-imposed limit in seconds, known once started
    pub fn max_session_duration(&self) -> Option<u64> {
        self.inner
            .session_info
            .lock()
            .as_ref()
            .and_then(|i| i.max_session_duration)
    }

    /// Start the session: API start → room connect → quality → voice chat → Connected.
    /// On failure everything is torn down, the session ends Disconnected and the error is returned.
    pub async fn start(&self) -> Result<(), SessionError> {
        {
            let mut state = self.inner.state.lock();
            if *state != SessionState::Inactive {
                tracing::warn!("Session already started (state {:?})", *state);
                return Ok(());
            }
            *state = SessionState::Connecting;
        }
        self.inner.events.emit(&SessionEvent::StateChanged(SessionState::Connecting));

        match self.inner.connect().await {
            Ok(()) => {
                if !self.inner.transition(SessionState::Connecting, SessionState::Connected) {
                    return Err(SessionError::Aborted);
                }
                self.inner.quality.start(self.inner.room.as_ref());
                tracing::info!("Session connected");
                Ok(())
            }
            Err(e) => {
                tracing::error!("Session start failed: {}", e);
                if self.state() == SessionState::Connecting {
                    self.inner.cleanup();
                    self.inner.post_stop(DisconnectReason::SessionStartFailed);
                }
                Err(e)
            }
        }
    }

    /// Stop the session. The backend session is closed even if the room disconnect fails.
    pub async fn stop(&self) -> Result<(), SessionError> {
        {
            let mut state = self.inner.state.lock();
            if !matches!(*state, SessionState::Connected | SessionState::Connecting) {
                tracing::warn!("Session is not active (state {:?})", *state);
                return Ok(());
            }
            *state = SessionState::Disconnecting;
        }
        self.inner
            .events
            .emit(&SessionEvent::StateChanged(SessionState::Disconnecting));

        self.inner.cleanup();
        if let Err(e) = self.inner.room.disconnect().await {
            tracing::warn!("Room disconnect failed: {}", e);
        }
        let result = self.inner.api.stop_session().await;
        self.inner.post_stop(DisconnectReason::ClientInitiated);

        result.map_err(SessionError::from)
    }

    pub async fn keep_alive(&self) -> Result<(), SessionError> {
        if !self.inner.assert_connected() {
            return Ok(());
        }
        self.inner.api.keep_alive().await?;
        Ok(())
    }

    /// Have the backend's own model answer `text`
    pub fn message(&self, text: &str) -> bool {
        self.inner.send_command(AvatarCommand::SpeakResponse {
            text: text.to_string(),
        })
    }

    /// Speak `text` verbatim
    pub fn repeat(&self, text: &str) -> bool {
        self.inner.send_command(AvatarCommand::SpeakText {
            text: text.to_string(),
        })
    }

    pub fn repeat_audio(&self, audio: String) -> bool {
        self.inner.send_command(AvatarCommand::SpeakAudio { audio })
    }

    pub fn interrupt(&self) -> bool {
        self.inner.send_command(AvatarCommand::Interrupt)
    }

    pub fn start_listening(&self) -> bool {
        self.inner.send_command(AvatarCommand::StartListening)
    }

    pub fn stop_listening(&self) -> bool {
        self.inner.send_command(AvatarCommand::StopListening)
    }
}

impl SpeechSink for SessionController {
    fn repeat_audio(&self, audio: String) -> bool {
        SessionController::repeat_audio(self, audio)
    }

    fn interrupt(&self) -> bool {
        SessionController::interrupt(self)
    }
}

impl SessionInner {
    /// Move `from` → `to`, emitting StateChanged. False if the state had moved on.
    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        {
            let mut state = self.state.lock();
            if *state != from {
                return false;
            }
            *state = to;
        }
        self.events.emit(&SessionEvent::StateChanged(to));
        true
    }

    fn set_state(&self, to: SessionState) {
        {
            let mut state = self.state.lock();
            if *state == to {
                return;
            }
            *state = to;
        }
        self.events.emit(&SessionEvent::StateChanged(to));
    }

    fn still_connecting(&self) -> Result<(), SessionError> {
        if *self.state.lock() == SessionState::Connecting {
            Ok(())
        } else {
            Err(SessionError::Aborted)
        }
    }

    async fn connect(self: &Arc<Self>) -> Result<(), SessionError> {
        let info = self.api.start_session().await?;
        self.still_connecting()?;
        tracing::info!("Session {} started", info.session_id);
        *self.session_info.lock() = Some(info.clone());

        self.track_room_events();
        self.room
            .connect(&info.livekit_url, &info.livekit_client_token)
            .await?;
        self.still_connecting()?;
        *self.room_connected.lock() = true;

        if let Some(voice_chat) = self.config.voice_chat.clone() {
            self.voice_chat.start(voice_chat).await?;
            self.still_connecting()?;
        }
        Ok(())
    }

    fn track_room_events(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let room_sub = self.room.events().subscribe(move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.on_room_event(event);
            }
        });

        let weak = Arc::downgrade(self);
        let quality_sub = self.quality.events().subscribe(move |quality| {
            if let Some(inner) = weak.upgrade() {
                inner
                    .events
                    .emit(&SessionEvent::ConnectionQualityChanged(*quality));
            }
        });

        let mut subs = self.subscriptions.lock();
        subs.push(room_sub);
        subs.push(quality_sub);
    }

    fn on_room_event(&self, event: &RoomEvent) {
        match event {
            RoomEvent::TrackSubscribed { sid, kind } => {
                let ready = {
                    let mut tracks = self.remote_tracks.lock();
                    let was_ready = tracks.len() == 2;
                    tracks.insert(*kind, sid.clone());
                    !was_ready && tracks.len() == 2
                };
                if ready {
                    tracing::info!("Avatar stream ready");
                    self.events.emit(&SessionEvent::StreamReady);
                }
            }
            RoomEvent::TrackUnsubscribed { sid, kind } => {
                let mut tracks = self.remote_tracks.lock();
                if tracks.get(kind) == Some(sid) {
                    tracks.remove(kind);
                }
            }
            RoomEvent::DataReceived { topic, payload } => {
                if let Some(task_event) = translator::translate_data(topic.as_deref(), payload) {
                    self.events.emit(&SessionEvent::Server(task_event));
                }
            }
            RoomEvent::ConnectionQualityChanged(_) => {}
            RoomEvent::Disconnected { reason } => {
                tracing::warn!("Media room disconnected: {}", reason);
                self.cleanup();
                self.post_stop(DisconnectReason::UnknownReason);
            }
        }
    }

    /// Release everything registered on the room
    fn cleanup(&self) {
        self.quality.stop();
        self.voice_chat.stop();
        self.subscriptions.lock().clear();
        self.remote_tracks.lock().clear();
        *self.room_connected.lock() = false;
    }

    fn post_stop(&self, reason: DisconnectReason) {
        if *self.state.lock() == SessionState::Disconnected {
            return;
        }
        self.set_state(SessionState::Disconnected);
        tracing::info!("Session disconnected: {:?}", reason);
        self.events.emit(&SessionEvent::Disconnected(reason));
    }

    fn assert_connected(&self) -> bool {
        let state = *self.state.lock();
        if state != SessionState::Connected {
            tracing::warn!("Session is not connected (state {:?})", state);
            return false;
        }
        true
    }

    fn send_command(&self, command: AvatarCommand) -> bool {
        if !self.assert_connected() {
            return false;
        }
        self.publish_command(&command)
    }

    fn publish_command(&self, command: &AvatarCommand) -> bool {
        let payload = match command.to_payload() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!("Failed to encode {}: {}", command.event_type(), e);
                return false;
            }
        };
        match self.room.send_data(COMMAND_TOPIC, payload) {
            Ok(()) => {
                tracing::debug!("Sent {}", command.event_type());
                true
            }
            Err(e) => {
                tracing::error!("Failed to send {}: {}", command.event_type(), e);
                false
            }
        }
    }
}

#[async_trait]
impl VoiceChatHost for SessionInner {
    fn is_room_connected(&self) -> bool {
        *self.room_connected.lock()
    }

    async fn publish_microphone(
        &self,
        options: MicrophoneOptions,
    ) -> Result<Arc<dyn LocalAudioTrack>, RoomError> {
        self.room.publish_microphone(options).await
    }

    async fn unpublish_track(&self, sid: &str) -> Result<(), RoomError> {
        self.room.unpublish_track(sid).await
    }

    /// Push-to-talk is used while the session is live; the room must be up
    fn send_room_command(&self, command: AvatarCommand) -> bool {
        if !self.is_room_connected() {
            tracing::warn!("Room is not connected, dropping {}", command.event_type());
            return false;
        }
        self.publish_command(&command)
    }

    fn subscribe_server_events(&self, handler: Box<dyn Fn(&TaskEvent) + Send + Sync>) -> Subscription {
        self.events.subscribe(move |event| {
            if let SessionEvent::Server(task_event) = event {
                handler(task_event);
            }
        })
    }
}
