//! Wire message → canonical server event
//!
//! Two wire shapes reach the session:
//! - data-channel messages on the `agent-response` topic: `{"event_type": "user.transcription", "task_id"?, "text"?, ...}`
//! - the older bare form: `{"type": "avatar_talking_message", "task_id"?, "message"?}`
//!
//! Partial text is passed through untouched; merging by `task_id` happens in `chat`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Topic the avatar backend publishes its events on
pub const SERVER_RESPONSE_TOPIC: &str = "agent-response";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerEvent {
    UserStartedTalking,
    UserStoppedTalking,
    AvatarStartedTalking,
    AvatarStoppedTalking,
    UserMessage { message: String },
    UserEndMessage,
    AvatarMessage { message: String },
    AvatarEndMessage,
    InactivityDetected,
    PushToTalkStarted,
    PushToTalkStartFailed { message: Option<String> },
    PushToTalkStopped,
    PushToTalkStopFailed { message: Option<String> },
}

/// A canonical event with its correlation metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub event: ServerEvent,
    pub task_id: Option<String>,
    pub event_id: Option<String>,
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

fn text_of(value: &Value) -> String {
    str_field(value, "text")
        .or_else(|| str_field(value, "message"))
        .unwrap_or_default()
}

/// Topic-qualified data-channel message (`event_type` discriminant)
fn from_event_type(event_type: &str, value: &Value) -> Option<ServerEvent> {
    let event = match event_type {
        "user.speak_started" => ServerEvent::UserStartedTalking,
        "user.speak_ended" => ServerEvent::UserStoppedTalking,
        "avatar.speak_started" => ServerEvent::AvatarStartedTalking,
        "avatar.speak_ended" => ServerEvent::AvatarStoppedTalking,
        "user.transcription" => ServerEvent::UserMessage {
            message: text_of(value),
        },
        "user.transcription_ended" => ServerEvent::UserEndMessage,
        "avatar.transcription" => ServerEvent::AvatarMessage {
            message: text_of(value),
        },
        "avatar.transcription_ended" => ServerEvent::AvatarEndMessage,
        "session.inactivity_detected" => ServerEvent::InactivityDetected,
        "user.push_to_talk_started" => ServerEvent::PushToTalkStarted,
        "user.push_to_talk_start_failed" => ServerEvent::PushToTalkStartFailed {
            message: str_field(value, "message").or_else(|| str_field(value, "error")),
        },
        "user.push_to_talk_stopped" => ServerEvent::PushToTalkStopped,
        "user.push_to_talk_stop_failed" => ServerEvent::PushToTalkStopFailed {
            message: str_field(value, "message").or_else(|| str_field(value, "error")),
        },
        _ => return None,
    };
    Some(event)
}

/// Bare legacy message (`type` discriminant)
fn from_legacy_type(kind: &str, value: &Value) -> Option<ServerEvent> {
    let event = match kind {
        "avatar_start_talking" => ServerEvent::AvatarStartedTalking,
        "avatar_stop_talking" => ServerEvent::AvatarStoppedTalking,
        "avatar_talking_message" => ServerEvent::AvatarMessage {
            message: text_of(value),
        },
        "avatar_end_message" => ServerEvent::AvatarEndMessage,
        "user_start" => ServerEvent::UserStartedTalking,
        "user_stop" => ServerEvent::UserStoppedTalking,
        "user_talking_message" => ServerEvent::UserMessage {
            message: text_of(value),
        },
        "user_end_message" => ServerEvent::UserEndMessage,
        _ => return None,
    };
    Some(event)
}

/// Translate a parsed wire message. `None` for anything unroutable.
pub fn translate(value: &Value) -> Option<TaskEvent> {
    let event = if let Some(event_type) = value.get("event_type").and_then(Value::as_str) {
        from_event_type(event_type, value)
    } else if let Some(kind) = value.get("type").and_then(Value::as_str) {
        from_legacy_type(kind, value)
    } else {
        None
    };

    match event {
        Some(event) => Some(TaskEvent {
            event,
            task_id: str_field(value, "task_id"),
            event_id: str_field(value, "event_id"),
        }),
        None => {
            tracing::debug!("Dropping unroutable server message: {}", value);
            None
        }
    }
}

/// Translate a data-channel payload received on `topic`
pub fn translate_data(topic: Option<&str>, payload: &[u8]) -> Option<TaskEvent> {
    if topic != Some(SERVER_RESPONSE_TOPIC) {
        return None;
    }
    match serde_json::from_slice::<Value>(payload) {
        Ok(value) => translate(&value),
        Err(e) => {
            tracing::warn!("Malformed server message: {}", e);
            None
        }
    }
}
