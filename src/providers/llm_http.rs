//! HTTP streaming LLM provider client.
//!
//! Manual SSE parsing mirrors the reference implementation's
//! `OpenRouterClient::stream_complete`: split the buffer on a blank line,
//! strip the `data: ` prefix, stop on `[DONE]`, and treat each remaining
//! line as a JSON chunk carrying an incremental `delta.content`.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::LlmConfig;
use crate::error::{classify, ClassifiedError, ErrorKind};

use super::{LlmMessage, LlmProvider, LlmTokenStream};

pub struct HttpLlmProvider {
    client: reqwest::Client,
    config: LlmConfig,
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [LlmMessage],
    temperature: f32,
    max_tokens: u32,
    top_p: f32,
    frequency_penalty: f32,
    presence_penalty: f32,
    stream: bool,
}

#[derive(Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: Delta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

impl HttpLlmProvider {
    pub fn new(config: LlmConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }
}

#[async_trait]
impl LlmProvider for HttpLlmProvider {
    async fn stream_complete(
        &self,
        messages: &[LlmMessage],
    ) -> Result<Box<dyn LlmTokenStream>, ClassifiedError> {
        let request = CompletionRequest {
            model: &self.config.model,
            messages,
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            top_p: self.config.top_p,
            frequency_penalty: self.config.frequency_penalty,
            presence_penalty: self.config.presence_penalty,
            stream: true,
        };

        let timeout = Duration::from_millis(self.config.request_timeout_ms);
        let response = self
            .client
            .post(format!("{}/chat/completions", self.config.base_url))
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| classify(&e.to_string(), e.status().map(|s| s.as_u16())))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify(&body, Some(status.as_u16())));
        }

        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(pump_sse(response, tx));

        Ok(Box::new(HttpLlmTokenStream { rx }))
    }
}

async fn pump_sse(response: reqwest::Response, tx: mpsc::Sender<Result<String, ClassifiedError>>) {
    let mut stream = response.bytes_stream();
    let mut buffer = String::new();

    loop {
        let chunk = match stream.next().await {
            Some(Ok(bytes)) => bytes,
            Some(Err(e)) => {
                let _ = tx.send(Err(classify(&e.to_string(), None))).await;
                return;
            }
            None => break,
        };

        buffer.push_str(&String::from_utf8_lossy(&chunk));

        while let Some(pos) = buffer.find("\n\n") {
            let event = buffer[..pos].to_string();
            buffer.drain(..pos + 2);

            for line in event.lines() {
                let Some(data) = line.strip_prefix("data: ") else {
                    continue;
                };
                if data == "[DONE]" {
                    return;
                }
                match serde_json::from_str::<StreamChunk>(data) {
                    Ok(parsed) => {
                        if let Some(choice) = parsed.choices.into_iter().next() {
                            if let Some(content) = choice.delta.content {
                                if !content.is_empty() && tx.send(Ok(content)).await.is_err() {
                                    return;
                                }
                            }
                            if choice.finish_reason.is_some() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        let classified = ClassifiedError {
                            kind: ErrorKind::Fatal,
                            message: format!("unparseable llm sse chunk: {e}"),
                            status_code: None,
                        };
                        let _ = tx.send(Err(classified)).await;
                        return;
                    }
                }
            }
        }
    }
}

struct HttpLlmTokenStream {
    rx: mpsc::Receiver<Result<String, ClassifiedError>>,
}

#[async_trait]
impl LlmTokenStream for HttpLlmTokenStream {
    async fn next_token(&mut self) -> Option<Result<String, ClassifiedError>> {
        self.rx.recv().await
    }

    async fn close(&mut self) {
        self.rx.close();
    }
}
