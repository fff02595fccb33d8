//! Application configuration
//! Stored as pretty JSON in `<config dir>/avatar-relay/config.json`; secrets can come
//! from the environment instead.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::agent::ReconnectPolicy;
use crate::relay::RelayConfig;
use crate::session::api::{AvatarPersona, TokenRequest, DEFAULT_API_URL};
use crate::voice_chat::VoiceChatConfig;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {0}: {1}")]
    Read(PathBuf, String),
    #[error("Failed to write config {0}: {1}")]
    Write(PathBuf, String),
    #[error("Invalid config: {0}")]
    Parse(String),
    #[error("Missing setting: {0}")]
    Missing(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AvatarSettings {
    pub api_url: String,
    pub api_key: Option<String>,
    /// Pre-minted session token; skips minting when set with `session_id`
    pub session_token: Option<String>,
    pub session_id: Option<String>,
    pub avatar_id: Option<String>,
    /// `CUSTOM` lets an external agent drive the avatar, `FULL` uses the backend's own
    pub mode: String,
    pub voice_id: Option<String>,
    pub context_id: Option<String>,
    pub language: Option<String>,
    /// Also publish the microphone into the avatar room
    pub voice_chat: Option<VoiceChatConfig>,
    pub max_session_minutes: u64,
    pub warning_seconds: u64,
}

impl Default for AvatarSettings {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            api_key: None,
            session_token: None,
            session_id: None,
            avatar_id: None,
            mode: "CUSTOM".to_string(),
            voice_id: None,
            context_id: None,
            language: None,
            voice_chat: None,
            max_session_minutes: 10,
            warning_seconds: 30,
        }
    }
}

impl AvatarSettings {
    pub fn token_request(&self) -> Result<TokenRequest, ConfigError> {
        let avatar_id = self
            .avatar_id
            .clone()
            .filter(|id| !id.is_empty())
            .ok_or(ConfigError::Missing("avatar.avatar_id"))?;
        let persona = AvatarPersona {
            voice_id: self.voice_id.clone(),
            context_id: self.context_id.clone(),
            language: self.language.clone(),
        };
        let has_persona =
            persona.voice_id.is_some() || persona.context_id.is_some() || persona.language.is_some();
        Ok(TokenRequest {
            mode: self.mode.clone(),
            avatar_id,
            avatar_persona: has_persona.then_some(persona),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    pub agent_id: Option<String>,
    pub api_key: Option<String>,
    /// Connect straight to this URL instead of asking for a signed one
    pub url: Option<String>,
    pub reconnect: ReconnectPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioSettings {
    pub input_device: Option<String>,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    /// Play the avatar's audio track locally
    pub play_avatar_audio: bool,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            input_device: None,
            noise_suppression: true,
            auto_gain_control: true,
            play_avatar_audio: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub avatar: AvatarSettings,
    pub agent: AgentSettings,
    pub relay: RelayConfig,
    pub audio: AudioSettings,
}

/// Chemin vers le fichier de config
pub fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("avatar-relay")
        .join("config.json")
}

impl AppConfig {
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(path.to_path_buf(), e.to_string()))?;
        serde_json::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load the config file, writing the defaults on first run
    pub fn load_or_create(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            return Self::load_from(path);
        }
        let config = Self::default();
        config.save_to(path)?;
        tracing::info!("Wrote default config to {}", path.display());
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .map_err(|e| ConfigError::Write(path.to_path_buf(), e.to_string()))?;
        }
        let content =
            serde_json::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))?;
        fs::write(path, content).map_err(|e| ConfigError::Write(path.to_path_buf(), e.to_string()))
    }

    /// Override settings from `LIVEAVATAR_*` / `ELEVENLABS_*` variables
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("LIVEAVATAR_API_KEY") {
            self.avatar.api_key = Some(v);
        }
        if let Some(v) = get("LIVEAVATAR_API_URL") {
            self.avatar.api_url = v;
        }
        if let Some(v) = get("LIVEAVATAR_AVATAR_ID") {
            self.avatar.avatar_id = Some(v);
        }
        if let Some(v) = get("ELEVENLABS_API_KEY") {
            self.agent.api_key = Some(v);
        }
        if let Some(v) = get("ELEVENLABS_AGENT_ID") {
            self.agent.agent_id = Some(v);
        }
    }
}
