//! Real-time voice WebSocket handler — the client-facing transport (§10.4).
//!
//! One WebSocket connection is one session: a client opens `/v1/voice`,
//! sends `audio.input.start` to declare its sample rate, streams binary PCM
//! chunks, then `audio.input.end` per utterance. The handler owns nothing
//! about STT/LLM/TTS itself; it only frames/unframes the wire protocol and
//! hands the connection to the supervisor for the rest of its life.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use futures_util::stream::SplitSink;
use futures_util::stream::SplitStream;
use tracing::{info, warn};

use crate::error::ClassifiedError;
use crate::transport::{ClientMessage, InboundFrame, OutboundFrame, ServerMessage, Transport};

use super::ServerState;

const HANDSHAKE_TIMEOUT_MS: u64 = 5000;

/// Wraps the split axum WebSocket halves behind the orchestration core's
/// `Transport` trait. Outbound audio chunks are framed as
/// `[u16 BE utterance_id_len][utterance_id bytes][pcm bytes]` inside a
/// binary frame; control messages are JSON text frames.
pub struct AxumTransport {
    tx: SplitSink<WebSocket, Message>,
    rx: SplitStream<WebSocket>,
    pending: Option<InboundFrame>,
}

impl AxumTransport {
    fn new(socket: WebSocket) -> Self {
        let (tx, rx) = socket.split();
        Self { tx, rx, pending: None }
    }

    fn decode(msg: Message) -> Option<InboundFrame> {
        match msg {
            Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(client_msg) => Some(InboundFrame::Control(client_msg)),
                Err(e) => {
                    warn!(error = %e, "dropping unparseable control frame");
                    None
                }
            },
            Message::Binary(data) => Some(InboundFrame::AudioChunk(data.to_vec())),
            Message::Close(_) => None,
            _ => None,
        }
    }

    fn encode(frame: OutboundFrame) -> Option<Message> {
        match frame {
            OutboundFrame::Control(msg) => {
                let json = serde_json::to_string(&msg).ok()?;
                Some(Message::Text(json.into()))
            }
            OutboundFrame::AudioChunk { utterance_id, data } => {
                let id_bytes = utterance_id.as_bytes();
                let mut framed = Vec::with_capacity(2 + id_bytes.len() + data.len());
                framed.extend_from_slice(&(id_bytes.len() as u16).to_be_bytes());
                framed.extend_from_slice(id_bytes);
                framed.extend_from_slice(&data);
                Some(Message::Binary(framed.into()))
            }
        }
    }

    /// Blocks until the handshake control message arrives or `timeout_ms`
    /// elapses, keeping it buffered so the first in-loop `recv()` still
    /// observes it (its arrival also counts as session activity).
    async fn await_handshake(&mut self, timeout_ms: u64) -> Option<(u32, String, Option<String>)> {
        let deadline = tokio::time::Duration::from_millis(timeout_ms);
        let frame = tokio::time::timeout(deadline, self.recv_raw()).await.ok().flatten()?;
        let result = match &frame {
            InboundFrame::Control(ClientMessage::AudioInputStart { sample_rate, language, voice_id }) => {
                Some((*sample_rate, language.clone(), voice_id.clone()))
            }
            _ => None,
        };
        self.pending = Some(frame);
        result
    }

    async fn recv_raw(&mut self) -> Option<InboundFrame> {
        loop {
            let msg = self.rx.next().await?.ok()?;
            if let Some(frame) = Self::decode(msg) {
                return Some(frame);
            }
        }
    }
}

#[async_trait]
impl Transport for AxumTransport {
    async fn send(&mut self, frame: OutboundFrame) -> Result<(), ClassifiedError> {
        let Some(msg) = Self::encode(frame) else {
            return Ok(());
        };
        self.tx
            .send(msg)
            .await
            .map_err(|e| ClassifiedError::fatal(format!("websocket send failed: {e}")))
    }

    async fn recv(&mut self) -> Option<InboundFrame> {
        if let Some(frame) = self.pending.take() {
            return Some(frame);
        }
        self.recv_raw().await
    }
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<ServerState>) -> Response {
    ws.on_upgrade(|socket| handle_voice_session(socket, state))
}

async fn handle_voice_session(socket: WebSocket, state: ServerState) {
    let session_id = uuid::Uuid::now_v7().to_string();
    info!(session_id = %session_id, "voice session connected");

    let mut transport = AxumTransport::new(socket);
    let Some((sample_rate, language, voice_id)) =
        transport.await_handshake(HANDSHAKE_TIMEOUT_MS).await
    else {
        warn!(session_id = %session_id, "no audio.input.start within handshake window, closing");
        return;
    };
    info!(session_id = %session_id, sample_rate, language, "session handshake complete");

    if transport
        .send(OutboundFrame::Control(ServerMessage::ConnectionAck {
            session_id: session_id.clone(),
        }))
        .await
        .is_err()
    {
        warn!(session_id = %session_id, "failed to send connection.ack, closing");
        return;
    }

    match state
        .supervisor
        .run_session(session_id.clone(), sample_rate, language, voice_id, &mut transport)
        .await
    {
        Ok(()) => info!(session_id = %session_id, "voice session closed"),
        Err(e) => warn!(session_id = %session_id, error = %e, "voice session ended with error"),
    }
}
