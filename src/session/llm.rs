//! LLM sub-session: conversation history, per-session FIFO request queue,
//! streaming completions, and 3-tier fallback on provider failure.
//!
//! Structured as the re-architecture notes describe the source's
//! callback-driven completion: a finite, non-restartable lazy sequence of
//! tokens delivered over a channel, produced by a single background task
//! per in-flight request, with only one consumer ever running per session.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::info;

use crate::error::{ClassifiedError, GatewayError};
use crate::providers::{LlmMessage, LlmProvider};

const SYSTEM_PROMPT: &str = "You are a helpful voice assistant. Keep responses concise and natural to speak aloud.";

fn fallback_text(consecutive_failures: u32) -> &'static str {
    match consecutive_failures {
        1 => "I apologize, can you repeat that?",
        2 => "I'm experiencing technical difficulties. Please hold.",
        _ => "I apologize, I'm having connection issues. I'll have someone call you back.",
    }
}

struct QueuedRequest {
    user_text: String,
    tx: mpsc::Sender<Result<String, GatewayError>>,
}

struct Inner {
    history: Vec<LlmMessage>,
    consecutive_failures: u32,
    queue: VecDeque<QueuedRequest>,
    in_flight: bool,
    ending: bool,
}

#[derive(Clone)]
pub struct LlmSession {
    provider: Arc<dyn LlmProvider>,
    inner: Arc<Mutex<Inner>>,
    max_queue_size: usize,
}

impl LlmSession {
    /// Creates the context with the system message. Idempotent by
    /// construction: each `LlmSession` owns exactly one history.
    pub fn new(provider: Arc<dyn LlmProvider>, max_queue_size: usize) -> Self {
        Self {
            provider,
            inner: Arc::new(Mutex::new(Inner {
                history: vec![LlmMessage {
                    role: "system",
                    content: SYSTEM_PROMPT.to_string(),
                }],
                consecutive_failures: 0,
                queue: VecDeque::new(),
                in_flight: false,
                ending: false,
            })),
            max_queue_size,
        }
    }

    pub async fn history(&self) -> Vec<LlmMessage> {
        self.inner.lock().await.history.clone()
    }

    pub async fn consecutive_failures(&self) -> u32 {
        self.inner.lock().await.consecutive_failures
    }

    /// Appends an assistant message that did not come from the provider
    /// (e.g. the "didn't catch that" aside on an empty transcript). Does
    /// not touch `consecutive_failures` or the request queue.
    pub async fn note_assistant_aside(&self, text: String) {
        self.inner.lock().await.history.push(LlmMessage {
            role: "assistant",
            content: text,
        });
    }

    /// Appends a user message, enqueues a request, and returns a receiver
    /// that yields assistant text tokens in order (success) or a single
    /// fallback string (provider failure). Rejects synchronously with
    /// `QueueFull` if the bound would be exceeded; existing queued
    /// requests are unaffected by a rejection.
    pub async fn generate(
        &self,
        user_text: String,
    ) -> Result<mpsc::Receiver<Result<String, GatewayError>>, GatewayError> {
        let (tx, rx) = mpsc::channel(64);
        {
            let mut inner = self.inner.lock().await;
            if inner.ending {
                return Err(GatewayError::ShuttingDown);
            }
            let outstanding = inner.queue.len() + usize::from(inner.in_flight);
            if self.max_queue_size != 0 && outstanding >= self.max_queue_size {
                return Err(GatewayError::QueueFull);
            }
            inner.history.push(LlmMessage {
                role: "user",
                content: user_text.clone(),
            });
            inner.queue.push_back(QueuedRequest { user_text, tx });
        }
        self.maybe_start_next();
        Ok(rx)
    }

    fn maybe_start_next(&self) {
        let this = self.clone();
        tokio::spawn(async move {
            let request = {
                let mut inner = this.inner.lock().await;
                if inner.in_flight || inner.ending {
                    return;
                }
                let Some(request) = inner.queue.pop_front() else {
                    return;
                };
                inner.in_flight = true;
                request
            };

            this.run_request(request).await;

            {
                let mut inner = this.inner.lock().await;
                inner.in_flight = false;
            }
            this.maybe_start_next();
        });
    }

    async fn run_request(&self, request: QueuedRequest) {
        let messages = self.inner.lock().await.history.clone();

        let stream = self.provider.stream_complete(&messages).await;
        let mut stream = match stream {
            Ok(s) => s,
            Err(e) => {
                self.resolve_with_fallback(request, e).await;
                return;
            }
        };

        let mut accumulated = String::new();
        loop {
            match stream.next_token().await {
                Some(Ok(token)) => {
                    accumulated.push_str(&token);
                    if request.tx.send(Ok(token)).await.is_err() {
                        stream.close().await;
                        return;
                    }
                }
                Some(Err(e)) => {
                    self.resolve_with_fallback(request, e).await;
                    return;
                }
                None => break,
            }
        }

        let mut inner = self.inner.lock().await;
        inner.history.push(LlmMessage {
            role: "assistant",
            content: accumulated,
        });
        inner.consecutive_failures = 0;
    }

    async fn resolve_with_fallback(&self, request: QueuedRequest, error: ClassifiedError) {
        let text = {
            let mut inner = self.inner.lock().await;
            inner.consecutive_failures += 1;
            let text = fallback_text(inner.consecutive_failures).to_string();
            inner.history.push(LlmMessage {
                role: "assistant",
                content: text.clone(),
            });
            text
        };
        info!(
            error = %error,
            user_text = %request.user_text,
            "llm request failed, resolving with fallback"
        );
        let _ = request.tx.send(Ok(text)).await;
    }

    /// Rejects all still-queued requests with `ShuttingDown` and clears
    /// the context. The in-flight request (if any) is left to resolve on
    /// its own task; callers that need an immediate fallback should race
    /// this against a short timeout.
    pub async fn end(&self) {
        let mut inner = self.inner.lock().await;
        inner.ending = true;
        while let Some(request) = inner.queue.pop_front() {
            let _ = request.tx.send(Err(GatewayError::ShuttingDown)).await;
        }
    }
}
