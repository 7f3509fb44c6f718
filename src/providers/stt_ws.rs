//! WebSocket STT provider client.
//!
//! Wire contract: query params `encoding=linear16, sample_rate=16000,
//! channels=1, model, language, smart_format, interim_results,
//! endpointing, punctuate, vad_events`; PCM bytes inbound; `Transcript`
//! events outbound; a `KeepAlive` control frame sent periodically to hold
//! the connection open between audio chunks. Translates the raw socket
//! into [`SttEvent`].

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::{tungstenite::Message, MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::config::SttConfig;
use crate::error::{classify, ClassifiedError, ErrorKind};

use super::{SttEvent, SttProvider};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct WsSttProvider {
    socket: WsStream,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ProviderFrame {
    #[serde(rename = "Open")]
    Open,
    #[serde(rename = "Transcript")]
    Transcript {
        alternatives: Vec<TranscriptAlternative>,
        is_final: bool,
    },
    #[serde(rename = "Metadata")]
    Metadata,
    #[serde(rename = "Error")]
    Error { message: String },
}

#[derive(Debug, Deserialize)]
struct TranscriptAlternative {
    transcript: String,
    #[serde(default)]
    confidence: f32,
}

impl WsSttProvider {
    pub async fn connect(config: &SttConfig, language: &str) -> Result<Self, ClassifiedError> {
        let mut url = Url::parse(&config.ws_url).map_err(|e| classify(&e.to_string(), None))?;
        url.query_pairs_mut()
            .append_pair("encoding", "linear16")
            .append_pair("sample_rate", "16000")
            .append_pair("channels", "1")
            .append_pair("model", &config.model)
            .append_pair("language", language)
            .append_pair("smart_format", "true")
            .append_pair("interim_results", "true")
            .append_pair("endpointing", "300")
            .append_pair("punctuate", "true")
            .append_pair("vad_events", "true");

        let connect = tokio_tungstenite::connect_async(url.as_str());
        let timeout = Duration::from_millis(config.connection_timeout_ms);
        let (socket, _response) = tokio::time::timeout(timeout, connect)
            .await
            .map_err(|_| ClassifiedError {
                kind: ErrorKind::Timeout,
                message: "stt connect timed out".to_string(),
                status_code: None,
            })?
            .map_err(|e| classify(&e.to_string(), None))?;

        Ok(Self { socket })
    }
}

#[async_trait]
impl SttProvider for WsSttProvider {
    async fn send_audio(&mut self, bytes: &[u8]) -> Result<(), ClassifiedError> {
        self.socket
            .send(Message::Binary(bytes.to_vec()))
            .await
            .map_err(|e| classify(&e.to_string(), None))
    }

    async fn finalize(&mut self) -> Result<(), ClassifiedError> {
        // Terminal control verb: tells the provider no more audio is coming,
        // distinct from the recurring keepalive below.
        self.socket
            .send(Message::Text("{\"type\":\"CloseStream\"}".into()))
            .await
            .map_err(|e| classify(&e.to_string(), None))
    }

    async fn keepalive(&mut self) -> Result<(), ClassifiedError> {
        self.socket
            .send(Message::Text("{\"type\":\"KeepAlive\"}".into()))
            .await
            .map_err(|e| classify(&e.to_string(), None))
    }

    async fn recv(&mut self) -> Option<SttEvent> {
        loop {
            let msg = self.socket.next().await?;
            let msg = match msg {
                Ok(m) => m,
                Err(e) => return Some(SttEvent::Error(classify(&e.to_string(), None))),
            };

            match msg {
                Message::Text(text) => {
                    let frame: Result<ProviderFrame, _> = serde_json::from_str(&text);
                    match frame {
                        Ok(ProviderFrame::Open) => return Some(SttEvent::Open),
                        Ok(ProviderFrame::Transcript { alternatives, is_final }) => {
                            let Some(top) = alternatives.into_iter().next() else {
                                continue;
                            };
                            return Some(if is_final {
                                SttEvent::FinalTranscript {
                                    text: top.transcript,
                                    confidence: top.confidence,
                                }
                            } else {
                                SttEvent::InterimTranscript {
                                    text: top.transcript,
                                    confidence: top.confidence,
                                }
                            });
                        }
                        Ok(ProviderFrame::Metadata) => continue,
                        Ok(ProviderFrame::Error { message }) => {
                            return Some(SttEvent::Error(classify(&message, None)))
                        }
                        Err(e) => {
                            return Some(SttEvent::Error(ClassifiedError {
                                kind: ErrorKind::Fatal,
                                message: format!("unparseable stt frame: {e}"),
                                status_code: None,
                            }))
                        }
                    }
                }
                Message::Close(frame) => {
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.to_string()))
                        .unwrap_or((1000, String::new()));
                    return Some(SttEvent::Close { code, reason });
                }
                _ => continue,
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.socket.close(None).await;
    }
}

pub struct WsSttConnector {
    config: SttConfig,
}

impl WsSttConnector {
    pub fn new(config: SttConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl super::SttConnector for WsSttConnector {
    async fn connect(&self, language: &str) -> Result<Box<dyn SttProvider>, ClassifiedError> {
        Ok(Box::new(WsSttProvider::connect(&self.config, language).await?))
    }
}
