//! Conversational agent wire messages

use serde_json::{json, Value};

use crate::audio::pcm;

/// Messages the agent sends as JSON text frames
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// `pcm_<rate>` output format, if announced
    Metadata { output_format: Option<String> },
    UserTranscript(String),
    AgentResponse(String),
    AgentResponseCorrection(String),
    AgentResponseEnd,
    /// Base64 PCM inside a JSON `audio` event
    Audio(Vec<u8>),
    Interruption,
    /// Answer with a pong echoing `event_id` after `ping_ms`
    Ping { event_id: Option<Value>, ping_ms: u64 },
    /// Known but deliberately not acted upon
    Ignored(String),
    Unknown(String),
}

fn str_at<'a>(value: &'a Value, path: &[&str]) -> Option<&'a str> {
    path.iter()
        .try_fold(value, |v, key| v.get(*key))
        .and_then(Value::as_str)
}

/// Parse one text frame. Malformed JSON and bad audio payloads are errors; unknown types are not.
pub fn parse_message(text: &str) -> Result<InboundMessage, String> {
    let data: Value = serde_json::from_str(text).map_err(|e| format!("invalid JSON: {}", e))?;
    let kind = data.get("type").and_then(Value::as_str).unwrap_or_default();

    let message = match kind {
        "conversation_initiation_metadata" => InboundMessage::Metadata {
            output_format: str_at(
                &data,
                &["conversation_initiation_metadata_event", "agent_output_audio_format"],
            )
            .map(str::to_string),
        },
        "user_transcript" => InboundMessage::UserTranscript(
            str_at(&data, &["user_transcription_event", "user_transcript"])
                .or_else(|| str_at(&data, &["user_transcript"]))
                .unwrap_or_default()
                .to_string(),
        ),
        "agent_response" => InboundMessage::AgentResponse(
            str_at(&data, &["agent_response_event", "agent_response"])
                .or_else(|| str_at(&data, &["agent_response"]))
                .unwrap_or_default()
                .to_string(),
        ),
        "agent_response_correction" => InboundMessage::AgentResponseCorrection(
            str_at(
                &data,
                &["agent_response_correction_event", "corrected_agent_response"],
            )
            .unwrap_or_default()
            .to_string(),
        ),
        "agent_response_end" => InboundMessage::AgentResponseEnd,
        "audio" => match str_at(&data, &["audio_event", "audio_base_64"]) {
            Some(encoded) => InboundMessage::Audio(
                pcm::decode_base64(encoded).map_err(|e| format!("invalid audio payload: {}", e))?,
            ),
            None => InboundMessage::Ignored(kind.to_string()),
        },
        "interruption" => InboundMessage::Interruption,
        "ping" => {
            let event = data.get("ping_event");
            InboundMessage::Ping {
                event_id: event
                    .and_then(|e| e.get("event_id"))
                    .or_else(|| data.get("event_id"))
                    .cloned(),
                ping_ms: event
                    .and_then(|e| e.get("ping_ms"))
                    .and_then(Value::as_u64)
                    .unwrap_or(0),
            }
        }
        "internal_tentative_agent_response" => InboundMessage::Ignored(kind.to_string()),
        other => InboundMessage::Unknown(other.to_string()),
    };
    Ok(message)
}

/// First message after the socket opens: announces the microphone format
pub fn initiation_message(input_format: &str) -> String {
    json!({
        "type": "conversation_initiation_client_data",
        "conversation_config_override": {
            "agent": {
                "asr": { "user_input_audio_format": input_format }
            }
        }
    })
    .to_string()
}

pub fn pong_message(event_id: Option<&Value>) -> String {
    json!({ "type": "pong", "event_id": event_id.cloned().unwrap_or(Value::Null) }).to_string()
}

pub fn user_audio_message(pcm_bytes: &[u8]) -> String {
    json!({ "user_audio_chunk": pcm::encode_base64(pcm_bytes) }).to_string()
}
