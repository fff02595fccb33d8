#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use avatar_relay::events::EventBus;
use avatar_relay::room::{
    LocalAudioTrack, LocalTrackEvent, MediaRoom, MicrophoneOptions, RoomError, RoomEvent,
};
use avatar_relay::session::api::{SessionApi, SessionApiError, SessionInfo};
use avatar_relay::translator::SERVER_RESPONSE_TOPIC;

/// In-process media room: records what is sent, lets the test emit room events
#[derive(Default)]
pub struct ScriptedRoom {
    pub events: EventBus<RoomEvent>,
    pub sent: Mutex<Vec<(String, Value)>>,
    pub connects: AtomicUsize,
    pub disconnects: AtomicUsize,
    pub published: AtomicUsize,
    pub unpublished: Mutex<Vec<String>>,
    pub fail_publish: AtomicBool,
    pub fail_unpublish: AtomicBool,
    gate: Mutex<Option<Arc<Notify>>>,
    publish_gate: Mutex<Option<Arc<Notify>>>,
}

impl ScriptedRoom {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make `connect` wait until the returned gate is notified
    pub fn hold_connect(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock() = Some(gate.clone());
        gate
    }

    /// Make `publish_microphone` wait, once counted, until the returned gate is notified
    pub fn hold_publish(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.publish_gate.lock() = Some(gate.clone());
        gate
    }

    /// `event_type` of every command sent so far
    pub fn commands(&self) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .filter_map(|(_, v)| v.get("event_type").and_then(Value::as_str).map(str::to_string))
            .collect()
    }

    pub fn server_event(&self, payload: Value) {
        self.events.emit(&RoomEvent::DataReceived {
            topic: Some(SERVER_RESPONSE_TOPIC.to_string()),
            payload: payload.to_string().into_bytes(),
        });
    }
}

#[async_trait]
impl MediaRoom for ScriptedRoom {
    async fn connect(&self, _url: &str, _token: &str) -> Result<(), RoomError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), RoomError> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn send_data(&self, topic: &str, payload: Vec<u8>) -> Result<(), RoomError> {
        let value: Value =
            serde_json::from_slice(&payload).map_err(|e| RoomError::Send(e.to_string()))?;
        self.sent.lock().push((topic.to_string(), value));
        Ok(())
    }

    async fn publish_microphone(
        &self,
        options: MicrophoneOptions,
    ) -> Result<Arc<dyn LocalAudioTrack>, RoomError> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(RoomError::Microphone("permission denied".into()));
        }
        let n = self.published.fetch_add(1, Ordering::SeqCst);
        let gate = self.publish_gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        Ok(Arc::new(ScriptedTrack {
            sid: format!("TR_{}", n),
            muted: AtomicBool::new(options.default_muted),
            events: EventBus::new(),
        }))
    }

    async fn unpublish_track(&self, sid: &str) -> Result<(), RoomError> {
        self.unpublished.lock().push(sid.to_string());
        if self.fail_unpublish.load(Ordering::SeqCst) {
            return Err(RoomError::TrackNotFound(sid.to_string()));
        }
        Ok(())
    }

    fn events(&self) -> &EventBus<RoomEvent> {
        &self.events
    }
}

pub struct ScriptedTrack {
    sid: String,
    muted: AtomicBool,
    events: EventBus<LocalTrackEvent>,
}

impl LocalAudioTrack for ScriptedTrack {
    fn sid(&self) -> String {
        self.sid.clone()
    }

    fn mute(&self) {
        if !self.muted.swap(true, Ordering::SeqCst) {
            self.events.emit(&LocalTrackEvent::Muted);
        }
    }

    fn unmute(&self) {
        if self.muted.swap(false, Ordering::SeqCst) {
            self.events.emit(&LocalTrackEvent::Unmuted);
        }
    }

    fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    fn stop(&self) {}

    fn events(&self) -> &EventBus<LocalTrackEvent> {
        &self.events
    }
}

#[derive(Default)]
pub struct ScriptedApi {
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    pub keep_alives: AtomicUsize,
    pub fail_stop: AtomicBool,
}

#[async_trait]
impl SessionApi for ScriptedApi {
    async fn start_session(&self) -> Result<SessionInfo, SessionApiError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(SessionInfo {
            session_id: "session_1".into(),
            livekit_url: "wss://room.example".into(),
            livekit_client_token: "room-token".into(),
            max_session_duration: Some(600),
        })
    }

    async fn stop_session(&self) -> Result<(), SessionApiError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        if self.fail_stop.load(Ordering::SeqCst) {
            return Err(SessionApiError {
                message: "Session not found".into(),
                code: 4004,
                status: Some(404),
            });
        }
        Ok(())
    }

    async fn keep_alive(&self) -> Result<(), SessionApiError> {
        self.keep_alives.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Yield to other tasks until `condition` holds
pub async fn wait_until<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("condition not reached");
}
