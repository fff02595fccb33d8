//! Conversational agent connection
//!
//! One WebSocket per conversation. A supervisor task owns the socket: it reads agent
//! messages into `AgentEvent`s, writes queued outbound frames, answers pings, and
//! reconnects after abnormal closes according to the `ReconnectPolicy`.
//! `disconnect()` turns reconnection off for good.

pub mod protocol;
pub mod reconnect;
pub mod signed_url;
pub mod uplink;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::audio::{pcm, DEFAULT_AGENT_SAMPLE_RATE};
use crate::events::EventBus;
use protocol::InboundMessage;
use reconnect::{CloseDecision, ABNORMAL_CLOSURE, NORMAL_CLOSURE, NO_STATUS};

pub use reconnect::ReconnectPolicy;
pub use signed_url::{ElevenLabsSignedUrl, SignedUrlProvider, StaticUrl};
pub use uplink::MicrophoneUplink;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    #[error("Failed to get signed URL: {0}")]
    SignedUrl(String),
    #[error("WebSocket connect failed: {0}")]
    Connect(String),
    #[error("Not connected to agent")]
    NotConnected,
    #[error("WebSocket closed: {code} - {reason}")]
    Closed { code: u16, reason: String },
    #[error("Connection lost after {0} reconnect attempts")]
    ReconnectExhausted(u32),
}

#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    Connected,
    /// Conversation metadata received; agent audio is PCM at this rate from now on
    ConversationStarted { output_sample_rate: u32 },
    UserTranscript(String),
    AgentResponse(String),
    AgentResponseCorrection(String),
    AgentResponseEnd,
    Audio { pcm: Vec<u8>, sample_rate: u32 },
    Interruption,
    Reconnecting { attempt: u32, delay: Duration },
    Disconnected { code: u16, reason: String },
    /// `fatal` once reconnection is exhausted
    Error { error: AgentError, fatal: bool },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentConversationState {
    pub is_connected: bool,
    pub is_connecting: bool,
    pub is_speaking: bool,
    pub output_sample_rate: u32,
    pub reconnect_attempts: u32,
    pub last_transcript: Option<String>,
    pub last_response: Option<String>,
}

impl Default for AgentConversationState {
    fn default() -> Self {
        Self {
            is_connected: false,
            is_connecting: false,
            is_speaking: false,
            output_sample_rate: DEFAULT_AGENT_SAMPLE_RATE,
            reconnect_attempts: 0,
            last_transcript: None,
            last_response: None,
        }
    }
}

struct Shared {
    events: EventBus<AgentEvent>,
    state: Mutex<AgentConversationState>,
    outbox: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    should_reconnect: AtomicBool,
    input_format: Mutex<Option<String>>,
    last_error: Mutex<Option<AgentError>>,
}

impl Shared {
    fn send_text(&self, text: String) -> bool {
        match self.outbox.lock().as_ref() {
            Some(tx) => tx.send(Message::Text(text.into())).is_ok(),
            None => false,
        }
    }

    fn report(&self, error: AgentError, fatal: bool) {
        if fatal {
            tracing::error!("Agent connection failed: {}", error);
        } else {
            tracing::warn!("Agent connection error: {}", error);
        }
        *self.last_error.lock() = Some(error.clone());
        self.events.emit(&AgentEvent::Error { error, fatal });
    }

    fn handle_audio(&self, bytes: Vec<u8>) {
        let sample_rate = self.state.lock().output_sample_rate;
        self.events.emit(&AgentEvent::Audio { pcm: bytes, sample_rate });
    }

    fn handle_text(&self, text: &str, outbox: &mpsc::UnboundedSender<Message>) {
        let message = match protocol::parse_message(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("Dropping agent message: {}", e);
                return;
            }
        };

        let event = match message {
            InboundMessage::Metadata { output_format } => {
                let mut state = self.state.lock();
                if let Some(rate) = output_format.as_deref().and_then(pcm::parse_pcm_format) {
                    state.output_sample_rate = rate;
                }
                tracing::info!("Conversation started, agent audio at {} Hz", state.output_sample_rate);
                AgentEvent::ConversationStarted {
                    output_sample_rate: state.output_sample_rate,
                }
            }
            InboundMessage::UserTranscript(transcript) => {
                self.state.lock().last_transcript = Some(transcript.clone());
                AgentEvent::UserTranscript(transcript)
            }
            InboundMessage::AgentResponse(response) => {
                let mut state = self.state.lock();
                state.is_speaking = true;
                state.last_response = Some(response.clone());
                AgentEvent::AgentResponse(response)
            }
            InboundMessage::AgentResponseCorrection(corrected) => {
                if !corrected.is_empty() {
                    self.state.lock().last_response = Some(corrected.clone());
                }
                AgentEvent::AgentResponseCorrection(corrected)
            }
            InboundMessage::AgentResponseEnd => {
                self.state.lock().is_speaking = false;
                AgentEvent::AgentResponseEnd
            }
            InboundMessage::Audio(bytes) => {
                self.handle_audio(bytes);
                return;
            }
            InboundMessage::Interruption => {
                self.state.lock().is_speaking = false;
                AgentEvent::Interruption
            }
            InboundMessage::Ping { event_id, ping_ms } => {
                // ping_ms est le délai demandé avant le pong, pas une latence
                let outbox = outbox.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(ping_ms)).await;
                    let pong = protocol::pong_message(event_id.as_ref());
                    let _ = outbox.send(Message::Text(pong.into()));
                });
                return;
            }
            InboundMessage::Ignored(kind) => {
                tracing::trace!("Ignoring agent message {}", kind);
                return;
            }
            InboundMessage::Unknown(kind) => {
                tracing::debug!("Unknown agent message {}", kind);
                return;
            }
        };
        self.events.emit(&event);
    }
}

pub struct AgentConnection {
    provider: Arc<dyn SignedUrlProvider>,
    policy: ReconnectPolicy,
    shared: Arc<Shared>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl AgentConnection {
    pub fn new(provider: Arc<dyn SignedUrlProvider>, policy: ReconnectPolicy) -> Arc<Self> {
        Arc::new(Self {
            provider,
            policy,
            shared: Arc::new(Shared {
                events: EventBus::new(),
                state: Mutex::new(AgentConversationState::default()),
                outbox: Mutex::new(None),
                should_reconnect: AtomicBool::new(false),
                input_format: Mutex::new(None),
                last_error: Mutex::new(None),
            }),
            shutdown: Mutex::new(None),
            supervisor: Mutex::new(None),
        })
    }

    pub fn events(&self) -> &EventBus<AgentEvent> {
        &self.shared.events
    }

    pub fn state(&self) -> AgentConversationState {
        self.shared.state.lock().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.state.lock().is_connected
    }

    pub fn output_sample_rate(&self) -> u32 {
        self.shared.state.lock().output_sample_rate
    }

    pub fn last_error(&self) -> Option<AgentError> {
        self.shared.last_error.lock().clone()
    }

    /// Microphone format announced on every (re)connect, e.g. `pcm_48000`.
    /// Announced immediately when already connected.
    pub fn set_input_format(&self, format: impl Into<String>) {
        let format = format.into();
        *self.shared.input_format.lock() = Some(format.clone());
        if self.shared.send_text(protocol::initiation_message(&format)) {
            tracing::info!("Agent input format: {}", format);
        }
    }

    /// Base64 a microphone chunk and send it. False when not connected.
    pub fn send_user_audio(&self, pcm_bytes: &[u8]) -> bool {
        self.shared.send_text(protocol::user_audio_message(pcm_bytes))
    }

    /// Open the conversation. Errors from the first attempt are returned;
    /// later drops are handled by the reconnect policy and reported as events.
    pub async fn connect(&self) -> Result<(), AgentError> {
        {
            let mut state = self.shared.state.lock();
            if state.is_connecting || state.is_connected {
                tracing::warn!("Agent already connecting or connected, skipping");
                return Ok(());
            }
            state.is_connecting = true;
        }
        self.shared.should_reconnect.store(true, Ordering::SeqCst);
        self.shared.last_error.lock().take();

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        *self.shutdown.lock() = Some(shutdown_tx);

        let opened = tokio::select! {
            result = open(self.provider.as_ref()) => result,
            _ = shutdown_rx.changed() => {
                self.shared.state.lock().is_connecting = false;
                return Ok(());
            }
        };
        let socket = match opened {
            Ok(socket) => socket,
            Err(e) => {
                tracing::error!("Agent connect failed: {}", e);
                self.shared.state.lock().is_connecting = false;
                self.shared.should_reconnect.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let task = tokio::spawn(supervise(
            socket,
            self.shared.clone(),
            self.provider.clone(),
            self.policy.clone(),
            shutdown_rx,
        ));
        *self.supervisor.lock() = Some(task);
        Ok(())
    }

    /// Close the conversation and disable reconnection
    pub async fn disconnect(&self) {
        self.shared.should_reconnect.store(false, Ordering::SeqCst);
        if let Some(shutdown) = self.shutdown.lock().take() {
            shutdown.send_replace(true);
        }
        let task = self.supervisor.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        let mut state = self.shared.state.lock();
        state.is_connected = false;
        state.is_connecting = false;
        state.is_speaking = false;
    }
}

impl Drop for AgentConnection {
    fn drop(&mut self) {
        self.shared.should_reconnect.store(false, Ordering::SeqCst);
        if let Some(shutdown) = self.shutdown.lock().take() {
            shutdown.send_replace(true);
        }
    }
}

async fn open(provider: &dyn SignedUrlProvider) -> Result<WsStream, AgentError> {
    let url = provider.signed_url().await?;
    let (socket, _) = connect_async(url.as_str())
        .await
        .map_err(|e| AgentError::Connect(e.to_string()))?;
    tracing::info!("Agent WebSocket connected");
    Ok(socket)
}

async fn supervise(
    socket: WsStream,
    shared: Arc<Shared>,
    provider: Arc<dyn SignedUrlProvider>,
    policy: ReconnectPolicy,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut socket = Some(socket);
    let mut attempts = 0u32;
    let mut connect_error = String::new();

    loop {
        let (code, reason) = match socket.take() {
            Some(ws) => {
                attempts = 0;
                let (code, reason) = run_connection(ws, &shared, &mut shutdown).await;
                {
                    let mut state = shared.state.lock();
                    state.is_connected = false;
                    state.is_speaking = false;
                }
                tracing::info!("Agent WebSocket closed: {} {}", code, reason);
                shared.events.emit(&AgentEvent::Disconnected {
                    code,
                    reason: reason.clone(),
                });
                (code, reason)
            }
            None => (ABNORMAL_CLOSURE, std::mem::take(&mut connect_error)),
        };

        let user_initiated = !shared.should_reconnect.load(Ordering::SeqCst) || *shutdown.borrow();
        match policy.decide(code, attempts, user_initiated) {
            CloseDecision::Quiet => break,
            CloseDecision::Report { code } => {
                let reason = if reason.is_empty() { "Unknown reason".to_string() } else { reason };
                shared.report(AgentError::Closed { code, reason }, false);
                break;
            }
            CloseDecision::GiveUp { attempts } => {
                tracing::warn!("Max reconnect attempts reached");
                shared.report(AgentError::ReconnectExhausted(attempts), true);
                break;
            }
            CloseDecision::Retry { attempt, delay } => {
                attempts = attempt;
                {
                    let mut state = shared.state.lock();
                    state.is_connecting = true;
                    state.reconnect_attempts = attempt;
                }
                tracing::warn!(
                    "Abnormal close ({}), reconnecting in {}ms (attempt {}/{})",
                    code,
                    delay.as_millis(),
                    attempt,
                    policy.max_attempts
                );
                shared.events.emit(&AgentEvent::Reconnecting { attempt, delay });

                let reopened = tokio::select! {
                    _ = shutdown.changed() => None,
                    result = async {
                        tokio::time::sleep(delay).await;
                        open(provider.as_ref()).await
                    } => Some(result),
                };
                match reopened {
                    None => break,
                    Some(Ok(ws)) => socket = Some(ws),
                    Some(Err(e)) => {
                        tracing::warn!("Reconnect attempt {} failed: {}", attempt, e);
                        connect_error = e.to_string();
                    }
                }
            }
        }
    }

    let mut state = shared.state.lock();
    state.is_connected = false;
    state.is_connecting = false;
}

/// Pump one socket until it closes. Returns the close code and reason.
async fn run_connection(
    socket: WsStream,
    shared: &Shared,
    shutdown: &mut watch::Receiver<bool>,
) -> (u16, String) {
    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
    *shared.outbox.lock() = Some(out_tx.clone());

    let input_format = shared.input_format.lock().clone();
    if let Some(format) = input_format {
        tracing::info!("Agent input format: {}", format);
        let _ = out_tx.send(Message::Text(protocol::initiation_message(&format).into()));
    }

    {
        let mut state = shared.state.lock();
        state.is_connected = true;
        state.is_connecting = false;
        state.reconnect_attempts = 0;
    }
    shared.events.emit(&AgentEvent::Connected);

    let closed = loop {
        tokio::select! {
            _ = shutdown.changed() => {
                let frame = CloseFrame {
                    code: CloseCode::Normal,
                    reason: Utf8Bytes::from_static("client disconnect"),
                };
                let _ = sink.send(Message::Close(Some(frame))).await;
                break (NORMAL_CLOSURE, "client disconnect".to_string());
            }
            Some(outgoing) = out_rx.recv() => {
                if let Err(e) = sink.send(outgoing).await {
                    break (ABNORMAL_CLOSURE, e.to_string());
                }
            }
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => shared.handle_text(text.as_str(), &out_tx),
                Some(Ok(Message::Binary(data))) => shared.handle_audio(data.to_vec()),
                Some(Ok(Message::Close(frame))) => {
                    break frame
                        .map(|f| (u16::from(f.code), f.reason.to_string()))
                        .unwrap_or((NO_STATUS, String::new()));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break (ABNORMAL_CLOSURE, e.to_string()),
                None => break (ABNORMAL_CLOSURE, "connection dropped".to_string()),
            }
        }
    };

    shared.outbox.lock().take();
    closed
}
