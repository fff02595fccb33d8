pub mod agent;
pub mod app;
pub mod audio;
pub mod chat;
pub mod config;
pub mod events;
pub mod quality;
pub mod relay;
pub mod room;
pub mod session;
pub mod translator;
pub mod voice_chat;

pub use agent::{AgentConnection, AgentEvent};
pub use app::AppError;
pub use config::AppConfig;
pub use relay::{spawn_relay, AudioRelay, RelayConfig, RelayHandle, RelayInput};
pub use session::{SessionController, SessionEvent, SessionState, SpeechSink};
pub use voice_chat::{VoiceChat, VoiceChatState};

/// Entry point of the binary: logging, config, then the relay until it ends
pub fn run() -> Result<(), AppError> {
    tracing_subscriber::fmt::init();

    let path = config::config_path();
    let mut config = AppConfig::load_or_create(&path)?;
    config.apply_env();
    tracing::info!("Config loaded from {}", path.display());

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(app::run(config))
}
