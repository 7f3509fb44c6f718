//! STT sub-session: one upstream speech-to-text socket per session.
//! Forwards resampled audio, accumulates transcripts, reconnects
//! transparently within the retry schedule of §4.3.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::error::{ClassifiedError, ErrorKind, GatewayError};
use crate::metrics::Metrics;
use crate::providers::{ConnectionState, SttConnector, SttEvent, SttProvider};

const MID_STREAM_DELAYS_MS: [u64; 3] = [0, 100, 500];
const FIRST_OPEN_DELAYS_MS: [u64; 5] = [0, 100, 1000, 3000, 5000];
const MAX_BUFFER_BYTES: usize = 1024 * 1024;
const FINALIZE_TIMEOUT: Duration = Duration::from_secs(2);

pub struct SttSession {
    connector: Arc<dyn SttConnector>,
    provider: Option<Box<dyn SttProvider>>,
    state: ConnectionState,
    final_transcripts: Vec<String>,
    pending_interim: Option<String>,
    audio_buffer: VecDeque<Vec<u8>>,
    buffered_bytes: usize,
    pub chunks_forwarded: u64,
    pub chunks_dropped: u64,
    pub reconnections: u64,
    language: String,
    metrics: Arc<Metrics>,
    keepalive_interval: Duration,
    next_keepalive: tokio::time::Instant,
}

impl SttSession {
    pub fn new(
        connector: Arc<dyn SttConnector>,
        language: String,
        keepalive_interval_ms: u64,
        metrics: Arc<Metrics>,
    ) -> Self {
        let keepalive_interval = Duration::from_millis(keepalive_interval_ms);
        Self {
            connector,
            provider: None,
            state: ConnectionState::Idle,
            final_transcripts: Vec::new(),
            pending_interim: None,
            audio_buffer: VecDeque::new(),
            buffered_bytes: 0,
            chunks_forwarded: 0,
            chunks_dropped: 0,
            reconnections: 0,
            language,
            metrics,
            keepalive_interval,
            next_keepalive: tokio::time::Instant::now() + keepalive_interval,
        }
    }


    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Opens the connection, retrying per the first-open schedule.
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
            match self.connector.connect(&self.language).await {
                Ok(provider) => {
                    self.provider = Some(provider);
                    if i > 0 {
                        self.reconnections += 1;
                        self.metrics.record_stt_reconnect();
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
        Err(last_err.unwrap_or_else(|| ClassifiedError {
            kind: ErrorKind::Timeout,
            message: "stt connect exhausted retries".to_string(),
            status_code: None,
        }))
    }

    /// Forward 16 kHz PCM audio. Silently ignores empty chunks (counted
    /// as drops). Buffers while reconnecting, writes directly otherwise.
    pub async fn forward_chunk(&mut self, bytes: &[u8]) -> Result<(), ClassifiedError> {
        if bytes.is_empty() {
            self.chunks_dropped += 1;
            return Ok(());
        }

        match self.state {
            ConnectionState::Connected => {
                if let Some(provider) = self.provider.as_mut() {
                    match provider.send_audio(bytes).await {
                        Ok(()) => {
                            self.chunks_forwarded += 1;
                            Ok(())
                        }
                        Err(e) => {
                            self.handle_provider_error(e.clone()).await;
                            if e.retryable() {
                                self.buffer_audio(bytes);
                                Ok(())
                            } else {
                                Err(e)
                            }
                        }
                    }
                } else {
                    Ok(())
                }
            }
            ConnectionState::Reconnecting => {
                self.buffer_audio(bytes);
                Ok(())
            }
            ConnectionState::Error => Err(ClassifiedError {
                kind: ErrorKind::Fatal,
                message: "stt sub-session is in permanent error state".to_string(),
                status_code: None,
            }),
            _ => Ok(()),
        }
    }

    fn buffer_audio(&mut self, bytes: &[u8]) {
        self.audio_buffer.push_back(bytes.to_vec());
        self.buffered_bytes += bytes.len();
        while self.buffered_bytes > MAX_BUFFER_BYTES {
            if let Some(oldest) = self.audio_buffer.pop_front() {
                self.buffered_bytes -= oldest.len();
                warn!("stt reconnection buffer overflow, dropping oldest chunk");
                self.chunks_dropped += 1;
            } else {
                break;
            }
        }
    }

    async fn handle_provider_error(&mut self, error: ClassifiedError) {
        if !error.retryable() {
            self.state = ConnectionState::Error;
            return;
        }
        self.state = ConnectionState::Reconnecting;
        match self.connect_with_retries(&MID_STREAM_DELAYS_MS).await {
            Ok(()) => {
                self.state = ConnectionState::Connected;
                self.flush_buffered_audio().await;
            }
            Err(_) => {
                self.state = ConnectionState::Error;
            }
        }
    }

    async fn flush_buffered_audio(&mut self) {
        while let Some(chunk) = self.audio_buffer.pop_front() {
            self.buffered_bytes -= chunk.len();
            if let Some(provider) = self.provider.as_mut() {
                if provider.send_audio(&chunk).await.is_ok() {
                    self.chunks_forwarded += 1;
                }
            }
        }
    }

    /// Drains any `InterimTranscript`/`FinalTranscript` events currently
    /// available from the provider without blocking indefinitely; used by
    /// `forward_chunk` callers that also poll `recv` from their dispatch
    /// loop. Exposed mainly for `finalize`'s bounded wait.
    ///
    /// Also carries the periodic keepalive: while waiting for the next
    /// event, a deadline timeout fires every `keepalive_interval_ms` and
    /// sends the provider's keepalive verb before resuming the wait, so a
    /// long gap between transcripts doesn't let the upstream socket idle
    /// out.
    pub async fn recv_event(&mut self) -> Option<SttEvent> {
        loop {
            if tokio::time::Instant::now() >= self.next_keepalive {
                self.next_keepalive = tokio::time::Instant::now() + self.keepalive_interval;
                if self.state == ConnectionState::Connected {
                    if let Some(provider) = self.provider.as_mut() {
                        let _ = provider.keepalive().await;
                    }
                }
            }

            let remaining = self
                .next_keepalive
                .saturating_duration_since(tokio::time::Instant::now());
            let provider = self.provider.as_mut()?;
            let event = match tokio::time::timeout(remaining, provider.recv()).await {
                Ok(event) => event?,
                Err(_) => continue,
            };

            match &event {
                SttEvent::InterimTranscript { text, .. } => {
                    self.pending_interim = Some(text.clone());
                }
                SttEvent::FinalTranscript { text, .. } => {
                    self.final_transcripts.push(text.clone());
                    self.pending_interim = None;
                }
                _ => {}
            }
            return Some(event);
        }
    }

    /// Signal end-of-audio; wait up to 2s for interim transcripts to
    /// upgrade to final, then return the accumulated transcript.
    pub async fn finalize(&mut self) -> Result<String, GatewayError> {
        if let Some(provider) = self.provider.as_mut() {
            let _ = provider.finalize().await;
        }

        let deadline = tokio::time::Instant::now() + FINALIZE_TIMEOUT;
        while tokio::time::Instant::now() < deadline {
            let remaining = deadline - tokio::time::Instant::now();
            match tokio::time::timeout(remaining, self.recv_event()).await {
                Ok(Some(SttEvent::FinalTranscript { .. })) => continue,
                Ok(Some(SttEvent::Close { .. })) | Ok(None) => break,
                Ok(Some(_)) => continue,
                Err(_) => break,
            }
        }

        if !self.final_transcripts.is_empty() {
            Ok(self.final_transcripts.join(" "))
        } else if let Some(interim) = &self.pending_interim {
            Ok(interim.clone())
        } else {
            Ok(String::new())
        }
    }

    pub async fn end(&mut self) {
        if let Some(provider) = self.provider.as_mut() {
            provider.close().await;
        }
        self.provider = None;
        self.audio_buffer.clear();
        self.buffered_bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    struct ScriptedStt {
        events: Mutex<VecDeque<SttEvent>>,
    }

    #[async_trait]
    impl SttProvider for ScriptedStt {
        async fn send_audio(&mut self, _bytes: &[u8]) -> Result<(), ClassifiedError> {
            Ok(())
        }
        async fn finalize(&mut self) -> Result<(), ClassifiedError> {
            Ok(())
        }
        async fn keepalive(&mut self) -> Result<(), ClassifiedError> {
            Ok(())
        }
        async fn recv(&mut self) -> Option<SttEvent> {
            self.events.lock().await.pop_front()
        }
        async fn close(&mut self) {}
    }

    struct ScriptedConnector {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SttConnector for ScriptedConnector {
        async fn connect(&self, _language: &str) -> Result<Box<dyn SttProvider>, ClassifiedError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(ScriptedStt {
                events: Mutex::new(VecDeque::new()),
            }))
        }
    }

    fn new_session(connector: Arc<ScriptedConnector>) -> SttSession {
        SttSession::new(connector, "en-US".to_string(), 8000, Arc::new(Metrics::new()))
    }

    #[tokio::test]
    async fn test_finalize_with_zero_transcripts_returns_empty() {
        let connector = Arc::new(ScriptedConnector {
            calls: AtomicUsize::new(0),
        });
        let mut session = new_session(connector);
        session.create().await.unwrap();
        let text = session.finalize().await.unwrap();
        assert_eq!(text, "");
    }

    #[tokio::test]
    async fn test_finalize_joins_finals_with_spaces() {
        let connector = Arc::new(ScriptedConnector {
            calls: AtomicUsize::new(0),
        });
        let mut session = new_session(connector);
        session.create().await.unwrap();
        session.final_transcripts.push("hello".to_string());
        session.final_transcripts.push("world".to_string());
        let text = session.finalize().await.unwrap();
        assert_eq!(text, "hello world");
    }

    #[tokio::test]
    async fn test_finalize_falls_back_to_interim_when_no_finals() {
        let connector = Arc::new(ScriptedConnector {
            calls: AtomicUsize::new(0),
        });
        let mut session = new_session(connector);
        session.create().await.unwrap();
        session.pending_interim = Some("partial".to_string());
        let text = session.finalize().await.unwrap();
        assert_eq!(text, "partial");
    }

    #[tokio::test]
    async fn test_empty_chunk_silently_ignored() {
        let connector = Arc::new(ScriptedConnector {
            calls: AtomicUsize::new(0),
        });
        let mut session = new_session(connector);
        session.create().await.unwrap();
        session.forward_chunk(&[]).await.unwrap();
        assert_eq!(session.chunks_dropped, 1);
        assert_eq!(session.chunks_forwarded, 0);
    }

    #[tokio::test]
    async fn test_buffer_overflow_drops_oldest() {
        let connector = Arc::new(ScriptedConnector {
            calls: AtomicUsize::new(0),
        });
        let mut session = new_session(connector);
        session.state = ConnectionState::Reconnecting;

        let big_chunk = vec![0u8; 600 * 1024];
        session.forward_chunk(&big_chunk).await.unwrap();
        session.forward_chunk(&big_chunk).await.unwrap();
        session.forward_chunk(&big_chunk).await.unwrap();

        assert!(session.buffered_bytes <= MAX_BUFFER_BYTES);
        assert!(session.chunks_dropped > 0);
    }

    struct FlakyConnector {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SttConnector for FlakyConnector {
        async fn connect(&self, _language: &str) -> Result<Box<dyn SttProvider>, ClassifiedError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call == 0 {
                return Err(ClassifiedError {
                    kind: ErrorKind::Timeout,
                    message: "first attempt times out".to_string(),
                    status_code: None,
                });
            }
            Ok(Box::new(ScriptedStt {
                events: Mutex::new(VecDeque::new()),
            }))
        }
    }

    #[tokio::test]
    async fn test_successful_retry_records_reconnect_in_shared_metrics() {
        let connector = Arc::new(FlakyConnector { calls: AtomicUsize::new(0) });
        let metrics = Arc::new(Metrics::new());
        let mut session = SttSession::new(connector, "en-US".to_string(), 8000, metrics.clone());
        session.create().await.unwrap();
        assert_eq!(session.reconnections, 1);
        assert_eq!(metrics.snapshot().stt_reconnections, 1);
    }
}
