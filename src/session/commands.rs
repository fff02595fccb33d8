use serde::{Deserialize, Serialize};

/// Topic the session publishes commands on
pub const COMMAND_TOPIC: &str = "agent-control";

/// Commands understood by the avatar backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum AvatarCommand {
    /// Let the backend's own LLM answer `text`
    #[serde(rename = "avatar.speak_response")]
    SpeakResponse { text: String },
    /// Speak `text` verbatim
    #[serde(rename = "avatar.speak_text")]
    SpeakText { text: String },
    /// Lip-sync base64 PCM (16-bit mono, 24kHz)
    #[serde(rename = "avatar.speak_audio")]
    SpeakAudio { audio: String },
    #[serde(rename = "avatar.interrupt")]
    Interrupt,
    #[serde(rename = "avatar.start_listening")]
    StartListening,
    #[serde(rename = "avatar.stop_listening")]
    StopListening,
    #[serde(rename = "user.start_push_to_talk")]
    StartPushToTalk,
    #[serde(rename = "user.stop_push_to_talk")]
    StopPushToTalk,
}

impl AvatarCommand {
    pub fn event_type(&self) -> &'static str {
        match self {
            AvatarCommand::SpeakResponse { .. } => "avatar.speak_response",
            AvatarCommand::SpeakText { .. } => "avatar.speak_text",
            AvatarCommand::SpeakAudio { .. } => "avatar.speak_audio",
            AvatarCommand::Interrupt => "avatar.interrupt",
            AvatarCommand::StartListening => "avatar.start_listening",
            AvatarCommand::StopListening => "avatar.stop_listening",
            AvatarCommand::StartPushToTalk => "user.start_push_to_talk",
            AvatarCommand::StopPushToTalk => "user.stop_push_to_talk",
        }
    }

    pub fn to_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}
