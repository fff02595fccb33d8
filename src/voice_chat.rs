//! Voice chat: the user's microphone published into the session's media room

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::events::{EventBus, Subscription};
use crate::room::{LocalAudioTrack, LocalTrackEvent, MicrophoneOptions, RoomError};
use crate::session::AvatarCommand;
use crate::translator::{ServerEvent, TaskEvent};

/// How long a push-to-talk command waits for the backend's confirmation
pub const PUSH_TO_TALK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum VoiceChatError {
    #[error("Session is not connected")]
    NotConnected,
    #[error("Voice chat is not active")]
    NotActive,
    #[error("Push-to-talk is only available in push-to-talk mode")]
    NotPushToTalkMode,
    #[error("Failed to publish microphone: {0}")]
    Publish(#[from] RoomError),
    #[error("Push-to-talk rejected: {0}")]
    Rejected(String),
    #[error("Push-to-talk confirmation timed out")]
    Timeout,
    #[error("Voice chat stopped while waiting")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VoiceChatState {
    Inactive,
    Starting,
    Active,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VoiceChatMode {
    #[default]
    Default,
    PushToTalk,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceChatConfig {
    pub default_muted: bool,
    pub device_name: Option<String>,
    pub mode: VoiceChatMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceChatEvent {
    StateChanged(VoiceChatState),
    Muted,
    Unmuted,
}

/// What the voice chat needs from the session that owns the room
#[async_trait]
pub trait VoiceChatHost: Send + Sync {
    fn is_room_connected(&self) -> bool;

    async fn publish_microphone(
        &self,
        options: MicrophoneOptions,
    ) -> Result<Arc<dyn LocalAudioTrack>, RoomError>;

    async fn unpublish_track(&self, sid: &str) -> Result<(), RoomError>;

    /// Returns false when the command was not sent
    fn send_room_command(&self, command: AvatarCommand) -> bool;

    fn subscribe_server_events(&self, handler: Box<dyn Fn(&TaskEvent) + Send + Sync>) -> Subscription;
}

/// A confirmation wait in flight. Dropping it cancels the waiter.
struct PendingConfirmation {
    tx: oneshot::Sender<Result<(), String>>,
    _subscription: Subscription,
}

type PendingSlot = Arc<Mutex<Option<PendingConfirmation>>>;

pub struct VoiceChat {
    host: Weak<dyn VoiceChatHost>,
    state: Mutex<VoiceChatState>,
    mode: Mutex<VoiceChatMode>,
    track: Mutex<Option<Arc<dyn LocalAudioTrack>>>,
    track_subscription: Mutex<Option<Subscription>>,
    /// One slot per wait in flight, kept so stop() can cancel them all
    pending: Mutex<Vec<PendingSlot>>,
    events: Arc<EventBus<VoiceChatEvent>>,
}

impl VoiceChat {
    pub fn new(host: Weak<dyn VoiceChatHost>) -> Self {
        Self {
            host,
            state: Mutex::new(VoiceChatState::Inactive),
            mode: Mutex::new(VoiceChatMode::Default),
            track: Mutex::new(None),
            track_subscription: Mutex::new(None),
            pending: Mutex::new(Vec::new()),
            events: Arc::new(EventBus::new()),
        }
    }

    pub fn state(&self) -> VoiceChatState {
        *self.state.lock()
    }

    pub fn mode(&self) -> VoiceChatMode {
        *self.mode.lock()
    }

    /// Derived from the track; false when there is no track
    pub fn is_muted(&self) -> bool {
        self.track
            .lock()
            .as_ref()
            .map(|t| t.is_muted())
            .unwrap_or(false)
    }

    pub fn events(&self) -> &EventBus<VoiceChatEvent> {
        &self.events
    }

    fn set_state(&self, state: VoiceChatState) {
        {
            let mut current = self.state.lock();
            if *current == state {
                return;
            }
            *current = state;
        }
        tracing::info!("Voice chat state: {:?}", state);
        self.events.emit(&VoiceChatEvent::StateChanged(state));
    }

    /// Acquire and publish the microphone
    pub async fn start(&self, config: VoiceChatConfig) -> Result<(), VoiceChatError> {
        let host = self.host.upgrade().ok_or(VoiceChatError::NotConnected)?;
        if !host.is_room_connected() {
            return Err(VoiceChatError::NotConnected);
        }
        if self.state() != VoiceChatState::Inactive {
            tracing::warn!("Voice chat is already started");
            return Ok(());
        }

        self.set_state(VoiceChatState::Starting);
        *self.mode.lock() = config.mode;

        let options = MicrophoneOptions {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
            default_muted: config.default_muted,
            device_name: config.device_name.clone(),
        };

        let track = match host.publish_microphone(options).await {
            Ok(track) => track,
            Err(e) => {
                self.set_state(VoiceChatState::Inactive);
                return Err(e.into());
            }
        };

        // stop() pendant la publication
        if self.state() != VoiceChatState::Starting {
            track.stop();
            let sid = track.sid();
            if let Err(e) = host.unpublish_track(&sid).await {
                tracing::debug!("Unpublish {} failed: {}", sid, e);
            }
            return Err(VoiceChatError::Cancelled);
        }

        if config.default_muted && !track.is_muted() {
            track.mute();
        }

        let events = Arc::downgrade(&self.events);
        let subscription = track.events().subscribe(move |event| {
            if let Some(events) = events.upgrade() {
                events.emit(&match event {
                    LocalTrackEvent::Muted => VoiceChatEvent::Muted,
                    LocalTrackEvent::Unmuted => VoiceChatEvent::Unmuted,
                });
            }
        });

        *self.track_subscription.lock() = Some(subscription);
        *self.track.lock() = Some(track);
        self.set_state(VoiceChatState::Active);
        Ok(())
    }

    /// Stop and unpublish the track. Idempotent.
    pub fn stop(&self) {
        // annule les attentes push-to-talk en cours
        let waits: Vec<PendingSlot> = self.pending.lock().drain(..).collect();
        for slot in waits {
            let cancelled = slot.lock().take();
            drop(cancelled);
        }
        self.track_subscription.lock().take();

        if let Some(track) = self.track.lock().take() {
            track.stop();
            let sid = track.sid();
            if let Some(host) = self.host.upgrade() {
                if host.is_room_connected() {
                    if let Ok(handle) = tokio::runtime::Handle::try_current() {
                        handle.spawn(async move {
                            if let Err(e) = host.unpublish_track(&sid).await {
                                tracing::debug!("Unpublish {} failed: {}", sid, e);
                            }
                        });
                    }
                }
            }
        }

        self.set_state(VoiceChatState::Inactive);
    }

    pub fn mute(&self) {
        if self.state() != VoiceChatState::Active {
            tracing::warn!("Voice chat is not active, cannot mute");
            return;
        }
        if let Some(track) = self.track.lock().as_ref() {
            track.mute();
        }
    }

    pub fn unmute(&self) {
        if self.state() != VoiceChatState::Active {
            tracing::warn!("Voice chat is not active, cannot unmute");
            return;
        }
        if let Some(track) = self.track.lock().as_ref() {
            track.unmute();
        }
    }

    pub async fn start_push_to_talk(&self) -> Result<(), VoiceChatError> {
        self.push_to_talk(
            AvatarCommand::StartPushToTalk,
            |e| matches!(e, ServerEvent::PushToTalkStarted),
            |e| match e {
                ServerEvent::PushToTalkStartFailed { message } => Some(message.clone()),
                _ => None,
            },
        )
        .await
    }

    pub async fn stop_push_to_talk(&self) -> Result<(), VoiceChatError> {
        self.push_to_talk(
            AvatarCommand::StopPushToTalk,
            |e| matches!(e, ServerEvent::PushToTalkStopped),
            |e| match e {
                ServerEvent::PushToTalkStopFailed { message } => Some(message.clone()),
                _ => None,
            },
        )
        .await
    }

    /// Send `command`, then wait for the first success or failure event.
    /// Correlation is by event type only.
    async fn push_to_talk(
        &self,
        command: AvatarCommand,
        is_success: fn(&ServerEvent) -> bool,
        failure: fn(&ServerEvent) -> Option<Option<String>>,
    ) -> Result<(), VoiceChatError> {
        if self.state() != VoiceChatState::Active {
            return Err(VoiceChatError::NotActive);
        }
        if self.mode() != VoiceChatMode::PushToTalk {
            return Err(VoiceChatError::NotPushToTalkMode);
        }
        let host = self.host.upgrade().ok_or(VoiceChatError::NotConnected)?;

        let (tx, rx) = oneshot::channel();
        let slot: PendingSlot = Arc::new(Mutex::new(None));
        let handler_slot = Arc::downgrade(&slot);
        let subscription = host.subscribe_server_events(Box::new(move |task_event| {
            let outcome = if is_success(&task_event.event) {
                Ok(())
            } else if let Some(message) = failure(&task_event.event) {
                Err(message.unwrap_or_else(|| "push-to-talk failed".to_string()))
            } else {
                return;
            };
            let Some(slot) = handler_slot.upgrade() else { return };
            // take() retire aussi l'abonnement : un seul déclenchement
            let pending = slot.lock().take();
            if let Some(pending) = pending {
                let _ = pending.tx.send(outcome);
            }
        }));

        *slot.lock() = Some(PendingConfirmation {
            tx,
            _subscription: subscription,
        });
        {
            let mut waits = self.pending.lock();
            waits.retain(|w| w.lock().is_some());
            waits.push(slot.clone());
        }

        if !host.send_room_command(command) {
            slot.lock().take();
            return Err(VoiceChatError::NotConnected);
        }
        drop(host);

        match tokio::time::timeout(PUSH_TO_TALK_TIMEOUT, rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(message))) => Err(VoiceChatError::Rejected(message)),
            Ok(Err(_)) => Err(VoiceChatError::Cancelled),
            Err(_) => {
                slot.lock().take();
                Err(VoiceChatError::Timeout)
            }
        }
    }
}
