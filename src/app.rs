//! Headless relay: avatar session + conversational agent + audio relay

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;

use crate::agent::{
    AgentConnection, AgentError, AgentEvent, ElevenLabsSignedUrl, MicrophoneUplink,
    SignedUrlProvider, StaticUrl,
};
use crate::audio::{CaptureError, CaptureOptions};
use crate::chat::{self, ChatState};
use crate::config::{AppConfig, ConfigError};
use crate::events::Subscription;
use crate::relay::{spawn_relay, RelayInput};
use crate::room::LiveKitRoom;
use crate::session::api::{mint_session_token, SessionApiClient, SessionApiError};
use crate::session::{SessionConfig, SessionController, SessionError, SessionEvent, COMMAND_TOPIC};
use crate::translator::SERVER_RESPONSE_TOPIC;

const STREAM_READY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Session token: {0}")]
    Token(#[from] SessionApiError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("Agent: {0}")]
    Agent(#[from] AgentError),
    #[error("Microphone: {0}")]
    Capture(#[from] CaptureError),
    #[error("Runtime: {0}")]
    Runtime(#[from] std::io::Error),
    #[error("Avatar stream not ready after {0:?}")]
    StreamTimeout(Duration),
}

/// What the relay should hear about an agent event
pub fn relay_input(event: &AgentEvent) -> Option<RelayInput> {
    match event {
        AgentEvent::Audio { pcm, sample_rate } => Some(RelayInput::AudioChunk {
            pcm: pcm.clone(),
            sample_rate: *sample_rate,
        }),
        AgentEvent::AgentResponse(_) => Some(RelayInput::ResponseStarted),
        AgentEvent::AgentResponseEnd => Some(RelayInput::ResponseEnded),
        AgentEvent::Interruption => Some(RelayInput::Interruption),
        AgentEvent::UserTranscript(text) => Some(RelayInput::UserUtterance(text.clone())),
        _ => None,
    }
}

/// Session length: the configured limit, shortened by the server's own limit
pub fn session_limit(configured_minutes: u64, server_seconds: Option<u64>) -> Duration {
    let configured = Duration::from_secs(configured_minutes * 60);
    match server_seconds {
        Some(secs) if secs > 0 => configured.min(Duration::from_secs(secs)),
        _ => configured,
    }
}

fn signed_url_provider(config: &AppConfig) -> Result<Arc<dyn SignedUrlProvider>, ConfigError> {
    if let Some(url) = config.agent.url.clone() {
        return Ok(Arc::new(StaticUrl(url)));
    }
    let api_key = config
        .agent
        .api_key
        .clone()
        .ok_or(ConfigError::Missing("agent.api_key"))?;
    let agent_id = config
        .agent
        .agent_id
        .clone()
        .ok_or(ConfigError::Missing("agent.agent_id"))?;
    Ok(Arc::new(ElevenLabsSignedUrl::new(api_key, agent_id)))
}

async fn session_credentials(config: &AppConfig) -> Result<(String, String), AppError> {
    let avatar = &config.avatar;
    if let (Some(id), Some(token)) = (&avatar.session_id, &avatar.session_token) {
        return Ok((id.clone(), token.clone()));
    }
    let api_key = avatar
        .api_key
        .as_deref()
        .ok_or(ConfigError::Missing("avatar.api_key"))?;
    let request = avatar.token_request()?;
    let token = mint_session_token(&avatar.api_url, api_key, &request).await?;
    Ok((token.session_id, token.session_token))
}

/// Log the conversation as complete turns
fn log_transcript(session: &SessionController) -> Subscription {
    let chat = Mutex::new(ChatState::default());
    session.events().subscribe(move |event| {
        let SessionEvent::Server(task_event) = event else { return };
        let mut chat = chat.lock();
        let before = chat.messages.len();
        *chat = chat::reduce(std::mem::take(&mut *chat), task_event);
        for message in &chat.messages[before..] {
            tracing::info!("[{:?}] {}", message.sender, message.message);
        }
    })
}

/// Microphone → agent → relay until the session ends, the time limit hits, or Ctrl-C
async fn converse(
    config: &AppConfig,
    session: &SessionController,
    agent: &Arc<AgentConnection>,
    session_ended: &Notify,
    agent_failed: &Notify,
) -> Result<(), AppError> {
    let mut uplink = MicrophoneUplink::start(
        agent.clone(),
        CaptureOptions {
            device_name: config.audio.input_device.clone(),
            noise_suppression: config.audio.noise_suppression,
            auto_gain_control: config.audio.auto_gain_control,
            start_muted: false,
        },
    )
    .await?;
    agent.connect().await?;

    let limit = session_limit(config.avatar.max_session_minutes, session.max_session_duration());
    let warning = Duration::from_secs(config.avatar.warning_seconds);
    tracing::info!("Session limited to {}s", limit.as_secs());
    let warn_task = tokio::spawn(async move {
        tokio::time::sleep(limit.saturating_sub(warning)).await;
        tracing::warn!("Session ends in {}s", warning.as_secs().min(limit.as_secs()));
    });

    let outcome = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, shutting down");
            Ok(())
        }
        _ = tokio::time::sleep(limit) => {
            tracing::info!("Session time limit reached");
            Ok(())
        }
        _ = session_ended.notified() => Ok(()),
        _ = agent_failed.notified() => Err(AppError::Agent(
            agent.last_error().unwrap_or(AgentError::NotConnected),
        )),
    };

    warn_task.abort();
    uplink.stop();
    outcome
}

pub async fn run(config: AppConfig) -> Result<(), AppError> {
    let provider = signed_url_provider(&config)?;
    let (session_id, session_token) = session_credentials(&config).await?;

    let api = Arc::new(SessionApiClient::new(
        config.avatar.api_url.clone(),
        session_id,
        session_token,
    ));
    let room = Arc::new(LiveKitRoom::new(
        vec![COMMAND_TOPIC.to_string(), SERVER_RESPONSE_TOPIC.to_string()],
        config.audio.play_avatar_audio,
    ));
    let session = SessionController::new(
        room,
        api,
        SessionConfig {
            voice_chat: config.avatar.voice_chat.clone(),
        },
    );

    let stream_ready = Arc::new(Notify::new());
    let session_ended = Arc::new(Notify::new());
    let _session_sub = {
        let stream_ready = stream_ready.clone();
        let session_ended = session_ended.clone();
        session.events().subscribe(move |event| match event {
            SessionEvent::StateChanged(state) => tracing::debug!("Session state {:?}", state),
            SessionEvent::ConnectionQualityChanged(quality) => {
                tracing::info!("Connection quality: {:?}", quality)
            }
            SessionEvent::StreamReady => stream_ready.notify_one(),
            SessionEvent::Disconnected(reason) => {
                tracing::info!("Session disconnected: {:?}", reason);
                session_ended.notify_one();
            }
            SessionEvent::Server(_) => {}
        })
    };
    let _transcript_sub = log_transcript(&session);

    session.start().await?;
    if tokio::time::timeout(STREAM_READY_TIMEOUT, stream_ready.notified())
        .await
        .is_err()
    {
        let _ = session.stop().await;
        return Err(AppError::StreamTimeout(STREAM_READY_TIMEOUT));
    }
    tracing::info!("Avatar stream ready");

    let agent = AgentConnection::new(provider, config.agent.reconnect.clone());
    let relay = spawn_relay(Arc::new(session.clone()), config.relay.clone());
    let agent_failed = Arc::new(Notify::new());
    let _agent_sub = {
        let relay_tx = relay.sender();
        let agent_failed = agent_failed.clone();
        agent.events().subscribe(move |event| {
            if let Some(input) = relay_input(event) {
                let _ = relay_tx.send(input);
            }
            match event {
                AgentEvent::UserTranscript(text) => tracing::info!("User: {}", text),
                AgentEvent::AgentResponse(text) => tracing::info!("Agent: {}", text),
                AgentEvent::Error { fatal: true, .. } => agent_failed.notify_one(),
                _ => {}
            }
        })
    };

    let result = converse(&config, &session, &agent, &session_ended, &agent_failed).await;

    agent.disconnect().await;
    let stats = relay.shutdown().await;
    tracing::info!(
        "Relayed {} flushes ({} bytes), {} interruptions",
        stats.flushes,
        stats.bytes_sent,
        stats.interruptions
    );
    if let Err(e) = session.stop().await {
        tracing::warn!("Session stop failed: {}", e);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_input_mapping() {
        assert_eq!(
            relay_input(&AgentEvent::Audio { pcm: vec![1, 2], sample_rate: 16000 }),
            Some(RelayInput::AudioChunk { pcm: vec![1, 2], sample_rate: 16000 })
        );
        assert_eq!(
            relay_input(&AgentEvent::AgentResponse("hi".into())),
            Some(RelayInput::ResponseStarted)
        );
        assert_eq!(relay_input(&AgentEvent::AgentResponseEnd), Some(RelayInput::ResponseEnded));
        assert_eq!(relay_input(&AgentEvent::Interruption), Some(RelayInput::Interruption));
        assert_eq!(
            relay_input(&AgentEvent::UserTranscript("stop".into())),
            Some(RelayInput::UserUtterance("stop".into()))
        );
        assert_eq!(relay_input(&AgentEvent::Connected), None);
        assert_eq!(relay_input(&AgentEvent::AgentResponseCorrection("x".into())), None);
    }

    #[test]
    fn test_session_limit() {
        assert_eq!(session_limit(10, None), Duration::from_secs(600));
        assert_eq!(session_limit(10, Some(300)), Duration::from_secs(300));
        assert_eq!(session_limit(10, Some(3600)), Duration::from_secs(600));
        assert_eq!(session_limit(10, Some(0)), Duration::from_secs(600));
    }

    #[test]
    fn test_provider_requires_credentials() {
        let mut config = AppConfig::default();
        assert!(matches!(
            signed_url_provider(&config),
            Err(ConfigError::Missing("agent.api_key"))
        ));
        config.agent.url = Some("ws://localhost:9".into());
        assert!(signed_url_provider(&config).is_ok());
    }
}
