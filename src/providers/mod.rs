//! Abstract provider interfaces.
//!
//! Each provider exposes a narrow `recv() -> next_event` lazy sequence
//! instead of an emitter/callback surface: the state machine drives these
//! explicitly, there is no implicit global dispatcher. Concrete
//! implementations translate one vendor's wire format into these typed
//! events; the core never sees vendor JSON.

pub mod llm_http;
pub mod stt_ws;
pub mod tts_ws;

use async_trait::async_trait;

use crate::error::ClassifiedError;

/// Shared by the STT and TTS sub-sessions (§4.3/§4.6's sub-session state
/// machine): `idle -> connecting -> connected <-> reconnecting -> connected
/// | error`. `Error` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

/// Constructs a fresh provider connection. Kept separate from the
/// provider trait itself so a sub-session can reconnect without the
/// `Orchestrator` handing it anything beyond "how do I make a new one".
/// `language` is the client-supplied BCP-47 tag from `audio.input.start`,
/// carried through every (re)connect so a dropped socket reopens against
/// the same language the session started with.
#[async_trait]
pub trait SttConnector: Send + Sync {
    async fn connect(&self, language: &str) -> Result<Box<dyn SttProvider>, ClassifiedError>;
}

/// `voice_id` overrides the connector's configured default voice when the
/// client supplied one in `audio.input.start`.
#[async_trait]
pub trait TtsConnector: Send + Sync {
    async fn connect(
        &self,
        language: &str,
        voice_id: Option<&str>,
    ) -> Result<Box<dyn TtsProvider>, ClassifiedError>;
}

#[derive(Debug, Clone)]
pub enum SttEvent {
    Open,
    InterimTranscript { text: String, confidence: f32 },
    FinalTranscript { text: String, confidence: f32 },
    Error(ClassifiedError),
    Close { code: u16, reason: String },
}

#[derive(Debug, Clone)]
pub enum TtsEvent {
    Open,
    Chunk { utterance_id: String, data: Vec<u8> },
    Done { utterance_id: String },
    Error(ClassifiedError),
    Close { code: u16, reason: String },
}

/// One persistent STT connection for a session.
#[async_trait]
pub trait SttProvider: Send {
    /// Forward a chunk of 16 kHz s16le PCM audio already resampled by the caller.
    async fn send_audio(&mut self, bytes: &[u8]) -> Result<(), ClassifiedError>;

    /// Signal end-of-audio (no more `send_audio` calls will follow).
    async fn finalize(&mut self) -> Result<(), ClassifiedError>;

    /// Send the provider's keepalive verb on an otherwise-idle connection.
    async fn keepalive(&mut self) -> Result<(), ClassifiedError>;

    /// Await the next event from the provider. Returns `None` once the
    /// connection is closed and no further events will arrive.
    async fn recv(&mut self) -> Option<SttEvent>;

    async fn close(&mut self);
}

/// A single streaming chat completion: a finite, non-restartable lazy
/// sequence of text tokens.
#[async_trait]
pub trait LlmTokenStream: Send {
    /// Await the next text delta. `None` signals normal completion.
    async fn next_token(&mut self) -> Option<Result<String, ClassifiedError>>;

    /// Close the underlying provider stream (used on cancellation).
    async fn close(&mut self);
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct LlmMessage {
    pub role: &'static str,
    pub content: String,
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn stream_complete(
        &self,
        messages: &[LlmMessage],
    ) -> Result<Box<dyn LlmTokenStream>, ClassifiedError>;
}

/// One persistent TTS connection for a session.
#[async_trait]
pub trait TtsProvider: Send {
    /// Request synthesis of `text`, tagged with `utterance_id`. Events for
    /// this utterance (and any still in flight) arrive via `recv`.
    async fn synthesize(&mut self, utterance_id: &str, text: &str) -> Result<(), ClassifiedError>;

    /// Send the provider's keepalive verb on an otherwise-idle connection.
    async fn keepalive(&mut self) -> Result<(), ClassifiedError>;

    async fn recv(&mut self) -> Option<TtsEvent>;

    async fn close(&mut self);
}
