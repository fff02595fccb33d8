//! Audio relay: agent speech → avatar
//!
//! Agent audio arrives as bursty PCM chunks. Chunks are resampled to the avatar rate and
//! buffered; the buffer is flushed as one `repeat_audio` when the agent ends its response
//! or when no chunk has arrived for the gap threshold. User speech or an agent interruption
//! throws the buffer away and interrupts the avatar.
//!
//! `AudioRelay` is the synchronous state machine, driven with explicit timestamps.
//! `spawn_relay` runs it on a task with a gap poll that ticks only while audio is waiting.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::audio::pcm;
use crate::audio::AVATAR_SAMPLE_RATE;
use crate::session::SpeechSink;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Silence after the last chunk that ends a burst
    pub gap_threshold_ms: u64,
    pub poll_interval_ms: u64,
    /// Silence put in front of the first flush after an interruption (0 disables)
    pub leading_silence_ms: u64,
    /// Transcripts shorter than this (after trimming) do not count as the user speaking
    pub min_utterance_chars: usize,
    pub target_sample_rate: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            gap_threshold_ms: 300,
            poll_interval_ms: 50,
            leading_silence_ms: 150,
            min_utterance_chars: 2,
            target_sample_rate: AVATAR_SAMPLE_RATE,
        }
    }
}

impl RelayConfig {
    pub fn gap_threshold(&self) -> Duration {
        Duration::from_millis(self.gap_threshold_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RelayStats {
    pub chunks_received: u64,
    /// Chunks discarded while a local interruption awaited confirmation
    pub chunks_dropped: u64,
    /// Buffered chunks thrown away by interruptions
    pub chunks_discarded: u64,
    pub flushes: u64,
    pub bytes_sent: u64,
    pub send_failures: u64,
    pub interruptions: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    ResponseEnded,
    Gap,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayInput {
    AudioChunk { pcm: Vec<u8>, sample_rate: u32 },
    ResponseStarted,
    ResponseEnded,
    Interruption,
    UserUtterance(String),
}

/// Strip what speech recognition emits for noise: whitespace and periods
pub fn meaningful_utterance(text: &str) -> Option<String> {
    let cleaned = text.trim().replace('.', "");
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned.to_string())
    }
}

pub struct AudioRelay<S: SpeechSink + ?Sized> {
    sink: Arc<S>,
    config: RelayConfig,
    buffer: Vec<Vec<u8>>,
    last_chunk_at: Option<Instant>,
    /// A gap check is pending for the current buffer
    gap_armed: bool,
    /// Local barge-in declared, agent confirmation not yet seen
    interruption_pending: bool,
    /// Next flush gets leading silence
    after_interrupt: bool,
    agent_speaking: bool,
    stats: RelayStats,
}

impl<S: SpeechSink + ?Sized> AudioRelay<S> {
    pub fn new(sink: Arc<S>, config: RelayConfig) -> Self {
        Self {
            sink,
            config,
            buffer: Vec::new(),
            last_chunk_at: None,
            gap_armed: false,
            interruption_pending: false,
            after_interrupt: false,
            agent_speaking: false,
            stats: RelayStats::default(),
        }
    }

    pub fn stats(&self) -> RelayStats {
        self.stats
    }

    pub fn buffered_chunks(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_armed(&self) -> bool {
        self.gap_armed
    }

    pub fn is_interruption_pending(&self) -> bool {
        self.interruption_pending
    }

    pub fn handle(&mut self, input: RelayInput, now: Instant) {
        match input {
            RelayInput::AudioChunk { pcm, sample_rate } => self.on_audio_chunk(pcm, sample_rate, now),
            RelayInput::ResponseStarted => self.on_response_started(),
            RelayInput::ResponseEnded => self.on_response_ended(),
            RelayInput::Interruption => self.on_interruption(),
            RelayInput::UserUtterance(text) => {
                self.on_user_utterance(&text);
            }
        }
    }

    pub fn on_audio_chunk(&mut self, mut chunk: Vec<u8>, source_rate: u32, now: Instant) {
        self.stats.chunks_received += 1;
        if self.interruption_pending {
            self.stats.chunks_dropped += 1;
            tracing::trace!("Dropping stale agent chunk while interruption is pending");
            return;
        }
        // un octet orphelin décalerait tous les échantillons suivants
        chunk.truncate(chunk.len() & !1);
        if chunk.is_empty() {
            return;
        }

        let resampled = pcm::resample_bytes(chunk, source_rate, self.config.target_sample_rate);
        self.buffer.push(resampled);
        self.last_chunk_at = Some(now);
        self.gap_armed = true;
        self.agent_speaking = true;
    }

    /// The agent started a new response: whatever it interrupted is over
    pub fn on_response_started(&mut self) {
        if self.interruption_pending {
            tracing::debug!("Agent responded, lifting interruption block");
            self.interruption_pending = false;
        }
    }

    pub fn on_response_ended(&mut self) {
        self.flush(FlushReason::ResponseEnded);
        self.agent_speaking = false;
    }

    /// The agent confirmed an interruption
    pub fn on_interruption(&mut self) {
        let already_interrupted = self.interruption_pending;
        self.interruption_pending = false;
        if !self.buffer.is_empty() || self.agent_speaking {
            self.after_interrupt = true;
        }
        self.discard();
        if !already_interrupted {
            self.interrupt_avatar();
        }
    }

    /// Local transcript of the user speaking; returns true when it caused a barge-in
    pub fn on_user_utterance(&mut self, text: &str) -> bool {
        let Some(cleaned) = meaningful_utterance(text) else {
            return false;
        };
        if cleaned.chars().count() < self.config.min_utterance_chars {
            tracing::trace!("Ignoring short utterance '{}'", cleaned);
            return false;
        }

        tracing::info!("User speaking, interrupting avatar");
        self.interruption_pending = true;
        if !self.buffer.is_empty() || self.agent_speaking {
            self.after_interrupt = true;
        }
        self.discard();
        self.interrupt_avatar();
        true
    }

    /// Gap check; flushes when the last chunk is at least the threshold old
    pub fn poll(&mut self, now: Instant) -> bool {
        if !self.gap_armed {
            return false;
        }
        match self.last_chunk_at {
            Some(last) if now.saturating_duration_since(last) >= self.config.gap_threshold() => {
                self.flush(FlushReason::Gap)
            }
            _ => false,
        }
    }

    /// Send everything buffered as one payload. False if there was nothing to send.
    pub fn flush(&mut self, reason: FlushReason) -> bool {
        // swap-then-process: later chunks land in a fresh buffer
        let chunks = std::mem::take(&mut self.buffer);
        self.gap_armed = false;
        if chunks.is_empty() {
            return false;
        }

        let count = chunks.len();
        let mut payload = pcm::concat_chunks(chunks);
        if self.after_interrupt {
            self.after_interrupt = false;
            if self.config.leading_silence_ms > 0 {
                let mut padded =
                    pcm::silence(self.config.leading_silence_ms, self.config.target_sample_rate);
                padded.extend_from_slice(&payload);
                payload = padded;
            }
        }

        let bytes = payload.len() as u64;
        let audio = pcm::encode_base64(&payload);
        self.stats.flushes += 1;
        if self.sink.repeat_audio(audio) {
            self.stats.bytes_sent += bytes;
            tracing::debug!("Flushed {} chunks ({} bytes) on {:?}", count, bytes, reason);
        } else {
            // pas de nouvel essai : l'audio est déjà périmé
            self.stats.send_failures += 1;
            tracing::error!("Failed to send {} bytes of agent audio", bytes);
        }
        true
    }

    fn discard(&mut self) {
        self.stats.chunks_discarded += self.buffer.len() as u64;
        self.buffer.clear();
        self.gap_armed = false;
        self.last_chunk_at = None;
        self.agent_speaking = false;
    }

    fn interrupt_avatar(&mut self) {
        self.stats.interruptions += 1;
        if !self.sink.interrupt() {
            tracing::warn!("Interrupt command was not sent");
        }
    }
}

/// Handle to a running relay task
pub struct RelayHandle {
    tx: mpsc::UnboundedSender<RelayInput>,
    task: JoinHandle<RelayStats>,
}

impl RelayHandle {
    /// Queue an input; false once the relay has stopped
    pub fn send(&self, input: RelayInput) -> bool {
        self.tx.send(input).is_ok()
    }

    pub fn sender(&self) -> mpsc::UnboundedSender<RelayInput> {
        self.tx.clone()
    }

    /// Stop the relay, discarding any buffered audio, and return its counters
    pub async fn shutdown(self) -> RelayStats {
        let Self { tx, task } = self;
        drop(tx);
        task.await.unwrap_or_default()
    }
}

/// Run a relay on its own task.
/// The relay stops when every sender is dropped.
pub fn spawn_relay<S>(sink: Arc<S>, config: RelayConfig) -> RelayHandle
where
    S: SpeechSink + ?Sized + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(run_relay(AudioRelay::new(sink, config), rx));
    RelayHandle { tx, task }
}

async fn run_relay<S>(mut relay: AudioRelay<S>, mut rx: mpsc::UnboundedReceiver<RelayInput>) -> RelayStats
where
    S: SpeechSink + ?Sized,
{
    let mut ticker = tokio::time::interval(relay.config.poll_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            input = rx.recv() => {
                let Some(input) = input else { break };
                let was_armed = relay.is_armed();
                relay.handle(input, Instant::now());
                if !was_armed && relay.is_armed() {
                    // premier chunk d'une rafale : le poll repart de maintenant
                    ticker.reset();
                }
            }
            _ = ticker.tick(), if relay.is_armed() => {
                relay.poll(Instant::now());
            }
        }
    }

    let stats = relay.stats();
    tracing::info!(
        "Relay stopped: {} chunks in, {} dropped, {} flushes, {} send failures",
        stats.chunks_received,
        stats.chunks_dropped,
        stats.flushes,
        stats.send_failures
    );
    stats
}
