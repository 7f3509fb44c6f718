//! TTS sub-session: persistent upstream socket, per-utterance synthesize,
//! reconnection with a bounded pending-text buffer, audio egress resampled
//! back up to the client's rate.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use crate::audio::resample;
use crate::error::ClassifiedError;
use crate::metrics::Metrics;
use crate::providers::{ConnectionState, TtsConnector, TtsEvent, TtsProvider};

const MID_STREAM_DELAYS_MS: [u64; 3] = [0, 100, 500];
const FIRST_OPEN_DELAYS_MS: [u64; 5] = [0, 100, 1000, 3000, 5000];
const MAX_BUFFER_BYTES: usize = 1024 * 1024;
const MAX_TEXT_CHARS: usize = 5000;

#[derive(Debug, Clone)]
pub enum AudioOutEvent {
    Start { utterance_id: String },
    Chunk { utterance_id: String, data: Vec<u8> },
    Complete { utterance_id: String },
}

fn fatal(message: impl Into<String>) -> ClassifiedError {
    ClassifiedError::fatal(message)
}

pub struct TtsSession {
    connector: Arc<dyn TtsConnector>,
    provider: Option<Box<dyn TtsProvider>>,
    state: ConnectionState,
    pending: VecDeque<(String, String)>,
    pending_bytes: usize,
    audio_tx: mpsc::Sender<AudioOutEvent>,
    pub reconnections: u64,
    pub chunks_emitted: u64,
    language: String,
    voice_id: Option<String>,
    metrics: Arc<Metrics>,
}

impl TtsSession {
    pub fn new(
        connector: Arc<dyn TtsConnector>,
        audio_tx: mpsc::Sender<AudioOutEvent>,
        language: String,
        voice_id: Option<String>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            connector,
            provider: None,
            state: ConnectionState::Idle,
            pending: VecDeque::new(),
            pending_bytes: 0,
            audio_tx,
            reconnections: 0,
            chunks_emitted: 0,
            language,
            voice_id,
            metrics,
        }
    }

    /// Sends the provider's keepalive verb if a connection is currently
    /// live. Driven by `tts_worker`'s own ticker, not this struct's caller,
    /// since the worker holds exclusive access to the provider.
    pub async fn send_keepalive(&mut self) {
        if self.state == ConnectionState::Connected {
            if let Some(provider) = self.provider.as_mut() {
                let _ = provider.keepalive().await;
            }
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub async fn create(&mut self) -> Result<(), ClassifiedError> {
        self.state = ConnectionState::Connecting;
        match self.connect_with_retries(&FIRST_OPEN_DELAYS_MS).await {
            Ok(()) => {
                self.state = ConnectionState::Connected;
                Ok(())
            }
            Err(e) => {
                self.state = ConnectionState::Error;
                Err(e)
            }
        }
    }

    async fn connect_with_retries(&mut self, delays: &[u64]) -> Result<(), ClassifiedError> {
        let mut last_err = None;
        for (i, delay) in delays.iter().enumerate() {
            if *delay > 0 {
                tokio::time::sleep(Duration::from_millis(*delay)).await;
            }
            match self.connector.connect(&self.language, self.voice_id.as_deref()).await {
                Ok(provider) => {
                    self.provider = Some(provider);
                    if i > 0 {
                        self.reconnections += 1;
                        self.metrics.record_tts_reconnect();
                    }
                    return Ok(());
                }
                Err(e) => {
                    let retryable = e.retryable();
                    last_err = Some(e);
                    if !retryable {
                        break;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| fatal("tts connect exhausted retries")))
    }

    fn buffer_back(&mut self, utterance_id: String, text: String) {
        self.pending_bytes += text.len();
        self.pending.push_back((utterance_id, text));
        self.enforce_bound();
    }

    fn buffer_front(&mut self, utterance_id: String, text: String) {
        self.pending_bytes += text.len();
        self.pending.push_front((utterance_id, text));
        self.enforce_bound();
    }

    fn enforce_bound(&mut self) {
        while self.pending_bytes > MAX_BUFFER_BYTES {
            if let Some((_, text)) = self.pending.pop_front() {
                self.pending_bytes -= text.len();
                warn!("tts pending-text buffer overflow, dropping oldest utterance");
            } else {
                break;
            }
        }
    }

    /// Validates and queues `text` as a new utterance, then drives it (and
    /// anything already queued ahead of it) through the provider,
    /// reconnecting as needed, until this utterance's `done` is observed.
    pub async fn synthesize(&mut self, text: &str) -> Result<(), ClassifiedError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Ok(());
        }
        let text: String = if trimmed.chars().count() > MAX_TEXT_CHARS {
            warn!("tts text truncated to {MAX_TEXT_CHARS} characters");
            trimmed.chars().take(MAX_TEXT_CHARS).collect()
        } else {
            trimmed.to_string()
        };

        let utterance_id = Uuid::new_v4().to_string();
        let _ = self
            .audio_tx
            .send(AudioOutEvent::Start {
                utterance_id: utterance_id.clone(),
            })
            .await;
        self.buffer_back(utterance_id.clone(), text);
        self.drain_until(&utterance_id).await
    }

    async fn drain_until(&mut self, target_id: &str) -> Result<(), ClassifiedError> {
        loop {
            match self.state {
                ConnectionState::Error => return Err(fatal("tts sub-session permanently failed")),
                ConnectionState::Reconnecting => {
                    match self.connect_with_retries(&MID_STREAM_DELAYS_MS).await {
                        Ok(()) => self.state = ConnectionState::Connected,
                        Err(e) => {
                            self.state = ConnectionState::Error;
                            return Err(e);
                        }
                    }
                }
                ConnectionState::Connected => {
                    let Some((uid, text)) = self.pending.pop_front() else {
                        return Ok(());
                    };
                    self.pending_bytes -= text.len();

                    let send_result = self
                        .provider
                        .as_mut()
                        .expect("connected state implies a live provider")
                        .synthesize(&uid, &text)
                        .await;

                    if let Err(e) = send_result {
                        self.handle_error(e.clone());
                        if !e.retryable() {
                            return Err(e);
                        }
                        self.buffer_front(uid, text);
                        continue;
                    }

                    match self.await_done(&uid).await {
                        Ok(()) => {
                            if uid == target_id {
                                return Ok(());
                            }
                        }
                        Err(e) => {
                            self.handle_error(e.clone());
                            if !e.retryable() {
                                return Err(e);
                            }
                            self.buffer_front(uid, text);
                        }
                    }
                }
                ConnectionState::Idle | ConnectionState::Connecting => {
                    return Err(fatal("tts sub-session not connected"));
                }
            }
        }
    }

    fn handle_error(&mut self, error: ClassifiedError) {
        self.state = if error.retryable() {
            ConnectionState::Reconnecting
        } else {
            ConnectionState::Error
        };
    }

    async fn await_done(&mut self, utterance_id: &str) -> Result<(), ClassifiedError> {
        loop {
            let provider = self
                .provider
                .as_mut()
                .ok_or_else(|| fatal("tts provider handle missing"))?;
            let event = provider.recv().await;
            match event {
                Some(TtsEvent::Open) => continue,
                Some(TtsEvent::Chunk { utterance_id: uid, data }) => {
                    let resampled = resample(&data, 16000, 48000).unwrap_or(data);
                    self.chunks_emitted += 1;
                    let _ = self
                        .audio_tx
                        .send(AudioOutEvent::Chunk {
                            utterance_id: uid,
                            data: resampled,
                        })
                        .await;
                }
                Some(TtsEvent::Done { utterance_id: uid }) => {
                    let _ = self
                        .audio_tx
                        .send(AudioOutEvent::Complete {
                            utterance_id: uid.clone(),
                        })
                        .await;
                    if uid == utterance_id {
                        return Ok(());
                    }
                }
                Some(TtsEvent::Error(e)) => return Err(e),
                Some(TtsEvent::Close { code, reason }) => {
                    return Err(crate::error::classify(&reason, Some(code)))
                }
                None => return Err(fatal("tts connection closed unexpectedly")),
            }
        }
    }

    pub async fn end(&mut self) {
        if let Some(provider) = self.provider.as_mut() {
            provider.close().await;
        }
        self.provider = None;
        self.pending.clear();
        self.pending_bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    // Utterance ids are generated internally by `synthesize`, so the fake
    // provider scripts generically: hand back the same N-chunk + done
    // sequence for whatever id arrives.
    struct GenericScriptedTts {
        chunks_per_utterance: usize,
        queue: Mutex<VecDeque<TtsEvent>>,
    }

    #[async_trait]
    impl TtsProvider for GenericScriptedTts {
        async fn synthesize(&mut self, utterance_id: &str, _text: &str) -> Result<(), ClassifiedError> {
            let mut q = self.queue.lock().await;
            for i in 0..self.chunks_per_utterance {
                q.push_back(TtsEvent::Chunk {
                    utterance_id: utterance_id.to_string(),
                    data: vec![0u8, 0u8, (i as u8), 0u8],
                });
            }
            q.push_back(TtsEvent::Done {
                utterance_id: utterance_id.to_string(),
            });
            Ok(())
        }
        async fn keepalive(&mut self) -> Result<(), ClassifiedError> {
            Ok(())
        }
        async fn recv(&mut self) -> Option<TtsEvent> {
            self.queue.lock().await.pop_front()
        }
        async fn close(&mut self) {}
    }

    struct GenericConnector {
        chunks_per_utterance: usize,
    }

    #[async_trait]
    impl TtsConnector for GenericConnector {
        async fn connect(
            &self,
            _language: &str,
            _voice_id: Option<&str>,
        ) -> Result<Box<dyn TtsProvider>, ClassifiedError> {
            Ok(Box::new(GenericScriptedTts {
                chunks_per_utterance: self.chunks_per_utterance,
                queue: Mutex::new(VecDeque::new()),
            }))
        }
    }

    fn new_session(
        connector: Arc<GenericConnector>,
        audio_tx: mpsc::Sender<AudioOutEvent>,
    ) -> TtsSession {
        TtsSession::new(connector, audio_tx, "en-US".to_string(), None, Arc::new(Metrics::new()))
    }

    #[tokio::test]
    async fn test_empty_text_is_noop() {
        let (tx, mut rx) = mpsc::channel(16);
        let connector = Arc::new(GenericConnector { chunks_per_utterance: 3 });
        let mut session = new_session(connector, tx);
        session.create().await.unwrap();
        session.synthesize("   ").await.unwrap();
        drop(session);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_synthesize_emits_start_chunks_and_complete() {
        let (tx, mut rx) = mpsc::channel(16);
        let connector = Arc::new(GenericConnector { chunks_per_utterance: 3 });
        let mut session = new_session(connector, tx);
        session.create().await.unwrap();
        session.synthesize("hello there").await.unwrap();

        let mut events = Vec::new();
        while let Ok(e) = rx.try_recv() {
            events.push(e);
        }
        assert!(matches!(events[0], AudioOutEvent::Start { .. }));
        let chunk_count = events
            .iter()
            .filter(|e| matches!(e, AudioOutEvent::Chunk { .. }))
            .count();
        assert_eq!(chunk_count, 3);
        assert!(matches!(events.last().unwrap(), AudioOutEvent::Complete { .. }));
    }

    #[tokio::test]
    async fn test_text_over_5000_chars_is_truncated() {
        let (tx, _rx) = mpsc::channel(16);
        let connector = Arc::new(GenericConnector { chunks_per_utterance: 1 });
        let mut session = new_session(connector, tx);
        session.create().await.unwrap();
        let long_text = "a".repeat(6000);
        session.synthesize(&long_text).await.unwrap();
        // a second, short call must still succeed after truncation.
        session.synthesize("ok").await.unwrap();
    }

    struct FlakyConnector {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TtsConnector for FlakyConnector {
        async fn connect(
            &self,
            _language: &str,
            _voice_id: Option<&str>,
        ) -> Result<Box<dyn TtsProvider>, ClassifiedError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call == 0 {
                return Err(ClassifiedError {
                    kind: crate::error::ErrorKind::Timeout,
                    message: "first attempt times out".to_string(),
                    status_code: None,
                });
            }
            Ok(Box::new(GenericScriptedTts {
                chunks_per_utterance: 1,
                queue: Mutex::new(VecDeque::new()),
            }))
        }
    }

    #[tokio::test]
    async fn test_successful_retry_records_reconnect_in_shared_metrics() {
        let connector = Arc::new(FlakyConnector { calls: AtomicUsize::new(0) });
        let (tx, _rx) = mpsc::channel(16);
        let metrics = Arc::new(Metrics::new());
        let mut session = TtsSession::new(connector, tx, "en-US".to_string(), None, metrics.clone());
        session.create().await.unwrap();
        assert_eq!(session.reconnections, 1);
        assert_eq!(metrics.snapshot().tts_reconnections, 1);
    }
}
