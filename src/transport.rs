//! Client-facing message kinds and the transport abstraction the
//! orchestration core is parameterized over (§6.1). The core never touches
//! an `axum` WebSocket directly; it only ever sees a `Transport`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    #[serde(rename = "audio.input.start")]
    AudioInputStart {
        sample_rate: u32,
        language: String,
        #[serde(default)]
        voice_id: Option<String>,
    },
    #[serde(rename = "audio.input.end")]
    AudioInputEnd,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "connection.ack")]
    ConnectionAck { session_id: String },
    #[serde(rename = "transcript.interim")]
    TranscriptInterim { text: String, confidence: f32 },
    #[serde(rename = "transcript.final")]
    TranscriptFinal { text: String, confidence: f32 },
    #[serde(rename = "audio.output.start")]
    AudioOutputStart { utterance_id: String },
    #[serde(rename = "audio.output.complete")]
    AudioOutputComplete { utterance_id: String },
    #[serde(rename = "error")]
    Error {
        code: String,
        message: String,
        retryable: bool,
    },
}

/// An inbound frame off the wire: a control message, a raw audio chunk, or
/// end-of-stream. Kept separate from `ClientMessage` because `audio.input.chunk`
/// carries raw bytes rather than JSON (§6.1/§10.4: text frames for control,
/// binary frames for PCM).
#[derive(Debug, Clone)]
pub enum InboundFrame {
    Control(ClientMessage),
    AudioChunk(Vec<u8>),
}

/// An outbound frame: either a `ServerMessage` control record or raw PCM
/// audio tagged with its utterance id (carried out-of-band in the binary
/// frame's own framing, not reflected in `ServerMessage`).
#[derive(Debug, Clone)]
pub enum OutboundFrame {
    Control(ServerMessage),
    AudioChunk { utterance_id: String, data: Vec<u8> },
}

/// Abstracts the client-facing binary transport so the orchestration core
/// (§4) never depends on `axum` or WebSocket framing directly.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, frame: OutboundFrame) -> Result<(), crate::error::ClassifiedError>;
    async fn recv(&mut self) -> Option<InboundFrame>;
}
