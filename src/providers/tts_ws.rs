//! WebSocket TTS provider client.
//!
//! Wire contract: synthesize request carries `modelId, voice{id,
//! mode:"id"}, transcript, language, outputFormat{container:"raw",
//! encoding:"pcm_s16le", sampleRate:16000}`; events `chunk{data,
//! stepTime}`, `done`, `error`, `close`.

use async_trait::async_trait;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::{tungstenite::Message, MaybeTlsStream, WebSocketStream};

use crate::config::TtsConfig;
use crate::error::{classify, ClassifiedError, ErrorKind};

use super::{TtsEvent, TtsProvider};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct WsTtsProvider {
    socket: WsStream,
    model_id: String,
    voice_id: String,
    language: String,
}

#[derive(Serialize)]
struct SynthesizeRequest<'a> {
    #[serde(rename = "modelId")]
    model_id: &'a str,
    voice: Voice<'a>,
    transcript: &'a str,
    language: &'a str,
    #[serde(rename = "outputFormat")]
    output_format: OutputFormat,
    #[serde(rename = "utteranceId")]
    utterance_id: &'a str,
}

#[derive(Serialize)]
struct Voice<'a> {
    id: &'a str,
    mode: &'a str,
}

#[derive(Serialize)]
struct OutputFormat {
    container: &'static str,
    encoding: &'static str,
    #[serde(rename = "sampleRate")]
    sample_rate: u32,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ProviderFrame {
    #[serde(rename = "chunk")]
    Chunk {
        data: String,
        #[serde(rename = "utteranceId", default)]
        utterance_id: String,
    },
    #[serde(rename = "done")]
    Done {
        #[serde(rename = "utteranceId", default)]
        utterance_id: String,
    },
    #[serde(rename = "error")]
    Error { message: String },
}

impl WsTtsProvider {
    pub async fn connect(
        config: &TtsConfig,
        language: &str,
        voice_id: Option<&str>,
    ) -> Result<Self, ClassifiedError> {
        let connect = tokio_tungstenite::connect_async(config.ws_url.as_str());
        let timeout = Duration::from_millis(config.connection_timeout_ms);
        let (socket, _response) = tokio::time::timeout(timeout, connect)
            .await
            .map_err(|_| ClassifiedError {
                kind: ErrorKind::Timeout,
                message: "tts connect timed out".to_string(),
                status_code: None,
            })?
            .map_err(|e| classify(&e.to_string(), None))?;

        Ok(Self {
            socket,
            model_id: config.model.clone(),
            voice_id: voice_id.unwrap_or(&config.voice_id).to_string(),
            language: language.to_string(),
        })
    }
}

#[async_trait]
impl TtsProvider for WsTtsProvider {
    async fn synthesize(&mut self, utterance_id: &str, text: &str) -> Result<(), ClassifiedError> {
        let request = SynthesizeRequest {
            model_id: &self.model_id,
            voice: Voice {
                id: &self.voice_id,
                mode: "id",
            },
            transcript: text,
            language: &self.language,
            output_format: OutputFormat {
                container: "raw",
                encoding: "pcm_s16le",
                sample_rate: 16000,
            },
            utterance_id,
        };
        let body = serde_json::to_string(&request).map_err(|e| ClassifiedError {
            kind: ErrorKind::Fatal,
            message: format!("failed to encode synthesize request: {e}"),
            status_code: None,
        })?;
        self.socket
            .send(Message::Text(body))
            .await
            .map_err(|e| classify(&e.to_string(), None))
    }

    async fn keepalive(&mut self) -> Result<(), ClassifiedError> {
        self.socket
            .send(Message::Text("{\"type\":\"keepAlive\"}".into()))
            .await
            .map_err(|e| classify(&e.to_string(), None))
    }

    async fn recv(&mut self) -> Option<TtsEvent> {
        loop {
            let msg = self.socket.next().await?;
            let msg = match msg {
                Ok(m) => m,
                Err(e) => return Some(TtsEvent::Error(classify(&e.to_string(), None))),
            };

            match msg {
                Message::Text(text) => {
                    let frame: Result<ProviderFrame, _> = serde_json::from_str(&text);
                    match frame {
                        Ok(ProviderFrame::Chunk { data, utterance_id }) => {
                            let bytes = base64::engine::general_purpose::STANDARD
                                .decode(data)
                                .unwrap_or_default();
                            return Some(TtsEvent::Chunk {
                                utterance_id,
                                data: bytes,
                            });
                        }
                        Ok(ProviderFrame::Done { utterance_id }) => {
                            return Some(TtsEvent::Done { utterance_id })
                        }
                        Ok(ProviderFrame::Error { message }) => {
                            return Some(TtsEvent::Error(classify(&message, None)))
                        }
                        Err(e) => {
                            return Some(TtsEvent::Error(ClassifiedError {
                                kind: ErrorKind::Fatal,
                                message: format!("unparseable tts frame: {e}"),
                                status_code: None,
                            }))
                        }
                    }
                }
                Message::Close(frame) => {
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.to_string()))
                        .unwrap_or((1000, String::new()));
                    return Some(TtsEvent::Close { code, reason });
                }
                _ => continue,
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.socket.close(None).await;
    }
}

pub struct WsTtsConnector {
    config: TtsConfig,
}

impl WsTtsConnector {
    pub fn new(config: TtsConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl super::TtsConnector for WsTtsConnector {
    async fn connect(
        &self,
        language: &str,
        voice_id: Option<&str>,
    ) -> Result<Box<dyn TtsProvider>, ClassifiedError> {
        Ok(Box::new(WsTtsProvider::connect(&self.config, language, voice_id).await?))
    }
}
