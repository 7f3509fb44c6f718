//! The `Session` root entity: owns the state machine and the STT/LLM/TTS
//! sub-sessions, and runs the single per-session dispatch loop that
//! funnels transport and provider events through the state machine
//! (§4.7/§5 — one `tokio` task per session, state mutated only from it).

pub mod llm;
pub mod semantic;
pub mod state_machine;
pub mod stt;
pub mod tts;

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::audio::resample;
use crate::config::GatewayConfig;
use crate::error::ClassifiedError;
use crate::metrics::Metrics;
use crate::providers::{LlmProvider, SttConnector, SttEvent, TtsConnector};
use crate::transport::{ClientMessage, InboundFrame, OutboundFrame, ServerMessage, Transport};

use self::llm::LlmSession;
use self::semantic::SemanticStreamer;
use self::state_machine::{ConversationState, StateMachine};
use self::stt::SttSession;
use self::tts::{AudioOutEvent, TtsSession};

const NO_SPEECH_PROMPT: &str = "Sorry, I didn't catch that. Could you say that again?";

pub struct Session {
    pub id: String,
    created_at: Instant,
    last_activity: Arc<StdMutex<Instant>>,
    state: StateMachine,
    stt: SttSession,
    llm: LlmSession,
    tts_ready_rx: Option<oneshot::Receiver<Result<(), ClassifiedError>>>,
    tts_audio_rx: mpsc::Receiver<AudioOutEvent>,
    tts_text_tx: mpsc::Sender<String>,
    llm_rx: Option<mpsc::Receiver<Result<String, crate::error::GatewayError>>>,
    llm_turn_open: bool,
    pending_tts_utterances: usize,
    semantic: SemanticStreamer,
    client_sample_rate: u32,
    stt_active: bool,
    end_rx: oneshot::Receiver<()>,
    pub metrics: Arc<Metrics>,
}

/// The supervisor's other half of `end_rx`: signalling it causes the
/// session's dispatch loop to run its teardown and exit on its own next
/// `select!` pass, rather than aborting the task outright.
pub struct EndSignal(pub oneshot::Sender<()>);

async fn tts_worker(
    mut tts: TtsSession,
    mut text_rx: mpsc::Receiver<String>,
    ready_tx: oneshot::Sender<Result<(), ClassifiedError>>,
    keepalive_interval_ms: u64,
) {
    let result = tts.create().await;
    let ok = result.is_ok();
    let _ = ready_tx.send(result);
    if !ok {
        return;
    }
    let mut keepalive = tokio::time::interval(Duration::from_millis(keepalive_interval_ms));
    keepalive.tick().await;
    loop {
        tokio::select! {
            maybe_text = text_rx.recv() => {
                match maybe_text {
                    Some(text) => {
                        if let Err(e) = tts.synthesize(&text).await {
                            warn!(error = %e, "tts worker stopping after unrecoverable error");
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = keepalive.tick() => {
                tts.send_keepalive().await;
            }
        }
    }
    tts.end().await;
}

async fn recv_llm_token(
    rx: &mut Option<mpsc::Receiver<Result<String, crate::error::GatewayError>>>,
) -> Option<Result<String, crate::error::GatewayError>> {
    match rx {
        Some(r) => r.recv().await,
        None => std::future::pending().await,
    }
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &GatewayConfig,
        id: String,
        stt_connector: Arc<dyn SttConnector>,
        llm_provider: Arc<dyn LlmProvider>,
        tts_connector: Arc<dyn TtsConnector>,
        client_sample_rate: u32,
        language: String,
        voice_id: Option<String>,
        metrics: Arc<Metrics>,
    ) -> (Self, EndSignal) {
        let (tts_audio_tx, tts_audio_rx) = mpsc::channel(64);
        let (tts_text_tx, tts_text_rx) = mpsc::channel(16);
        let (ready_tx, ready_rx) = oneshot::channel();
        let (end_tx, end_rx) = oneshot::channel();
        let tts_session = TtsSession::new(
            tts_connector,
            tts_audio_tx,
            language.clone(),
            voice_id,
            metrics.clone(),
        );
        tokio::spawn(tts_worker(
            tts_session,
            tts_text_rx,
            ready_tx,
            config.tts.keepalive_interval_ms,
        ));

        let session = Self {
            id,
            created_at: Instant::now(),
            last_activity: Arc::new(StdMutex::new(Instant::now())),
            state: StateMachine::new(),
            stt: SttSession::new(
                stt_connector,
                language,
                config.stt.keepalive_interval_ms,
                metrics.clone(),
            ),
            llm: LlmSession::new(llm_provider, config.llm.max_queue_size),
            tts_ready_rx: Some(ready_rx),
            tts_audio_rx,
            tts_text_tx,
            llm_rx: None,
            llm_turn_open: false,
            pending_tts_utterances: 0,
            semantic: SemanticStreamer::new(
                config.semantic.break_marker.clone(),
                config.semantic.max_buffer_size,
            ),
            client_sample_rate,
            stt_active: true,
            end_rx,
            metrics,
        };
        (session, EndSignal(end_tx))
    }

    pub fn state(&self) -> ConversationState {
        self.state.current()
    }

    pub fn idle_for(&self) -> std::time::Duration {
        self.last_activity.lock().unwrap().elapsed()
    }

    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    /// A shared handle the supervisor can read `idle_for` through without
    /// owning the `Session` itself (which lives on its dispatch task).
    pub fn activity_handle(&self) -> Arc<StdMutex<Instant>> {
        self.last_activity.clone()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Opens the STT and TTS provider connections and transitions
    /// INITIALIZING -> LISTENING. On failure the session must not be
    /// inserted into the supervisor's map.
    pub async fn start(&mut self) -> Result<(), ClassifiedError> {
        let stt_result = self.stt.create().await;
        let tts_result = match self.tts_ready_rx.take() {
            Some(rx) => rx
                .await
                .unwrap_or_else(|_| Err(ClassifiedError::fatal("tts worker dropped before connecting"))),
            None => Ok(()),
        };
        stt_result?;
        tts_result?;
        self.state
            .transition(ConversationState::Listening)
            .map_err(|_| ClassifiedError::fatal("unreachable: initial transition always valid"))?;
        Ok(())
    }

    /// Runs the dispatch loop until the client disconnects or the session
    /// ends. Returns once `state() == ENDED`.
    pub async fn run(&mut self, transport: &mut dyn Transport) {
        loop {
            tokio::select! {
                frame = transport.recv() => {
                    match frame {
                        Some(InboundFrame::AudioChunk(bytes)) => self.handle_audio_chunk(&bytes, transport).await,
                        Some(InboundFrame::Control(ClientMessage::AudioInputEnd)) => {
                            self.handle_end_of_input(transport).await;
                        }
                        Some(InboundFrame::Control(ClientMessage::AudioInputStart { .. })) => {
                            *self.last_activity.lock().unwrap() = Instant::now();
                        }
                        None => {
                            info!(session_id = %self.id, "client transport closed");
                            break;
                        }
                    }
                }
                event = self.stt.recv_event(), if self.stt_active => {
                    if event.is_none() {
                        self.stt_active = false;
                    }
                    self.handle_stt_event(event, transport).await;
                }
                token = recv_llm_token(&mut self.llm_rx), if self.llm_rx.is_some() => {
                    self.handle_llm_token(token, transport).await;
                }
                audio_event = self.tts_audio_rx.recv() => {
                    self.handle_tts_audio_event(audio_event, transport).await;
                }
                _ = &mut self.end_rx => {
                    info!(session_id = %self.id, "session ended by supervisor");
                    self.end().await;
                    break;
                }
            }

            if self.state.current() == ConversationState::Ended {
                break;
            }
        }
    }

    async fn handle_audio_chunk(&mut self, bytes: &[u8], transport: &mut dyn Transport) {
        if self.state.current() != ConversationState::Listening {
            return;
        }
        *self.last_activity.lock().unwrap() = Instant::now();
        match resample(bytes, self.client_sample_rate, 16000) {
            Ok(resampled) => match self.stt.forward_chunk(&resampled).await {
                Ok(()) => {
                    self.metrics.audio_chunks_forwarded.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => self.fail_session(e, transport).await,
            },
            Err(e) => warn!(session_id = %self.id, error = %e, "dropping malformed audio chunk"),
        }
    }

    async fn handle_end_of_input(&mut self, transport: &mut dyn Transport) {
        if self.state.current() != ConversationState::Listening {
            return;
        }
        *self.last_activity.lock().unwrap() = Instant::now();

        let transcript = match self.stt.finalize().await {
            Ok(t) => t,
            Err(e) => {
                self.fail_session(ClassifiedError::fatal(e.to_string()), transport).await;
                return;
            }
        };

        if transcript.trim().is_empty() {
            self.llm.note_assistant_aside(NO_SPEECH_PROMPT.to_string()).await;
            self.pending_tts_utterances += 1;
            if self.tts_text_tx.send(NO_SPEECH_PROMPT.to_string()).await.is_err() {
                self.pending_tts_utterances -= 1;
            }
            return;
        }

        if let Err(e) = self.state.transition(ConversationState::Thinking) {
            warn!(session_id = %self.id, error = %e, "invalid transition attempted");
            return;
        }

        match self.llm.generate(transcript).await {
            Ok(rx) => {
                self.llm_rx = Some(rx);
                self.llm_turn_open = true;
            }
            Err(e) => {
                warn!(session_id = %self.id, error = %e, "llm generate rejected");
                let _ = self.state.transition(ConversationState::Listening);
            }
        }
    }

    async fn handle_stt_event(&mut self, event: Option<SttEvent>, transport: &mut dyn Transport) {
        match event {
            Some(SttEvent::InterimTranscript { text, confidence }) => {
                let _ = transport
                    .send(OutboundFrame::Control(ServerMessage::TranscriptInterim { text, confidence }))
                    .await;
            }
            Some(SttEvent::FinalTranscript { text, confidence }) => {
                self.metrics.transcripts_received.fetch_add(1, Ordering::Relaxed);
                let _ = transport
                    .send(OutboundFrame::Control(ServerMessage::TranscriptFinal { text, confidence }))
                    .await;
            }
            Some(SttEvent::Error(e)) => {
                if !e.retryable() {
                    self.fail_session(e, transport).await;
                }
            }
            Some(SttEvent::Open) | Some(SttEvent::Close { .. }) | None => {}
        }
    }

    async fn handle_llm_token(
        &mut self,
        token: Option<Result<String, crate::error::GatewayError>>,
        transport: &mut dyn Transport,
    ) {
        match token {
            Some(Ok(text)) => {
                let chunks = self.semantic.push_token(&text);
                self.dispatch_chunks(chunks, transport).await;
            }
            Some(Err(e)) => {
                warn!(session_id = %self.id, error = %e, "llm token stream error");
            }
            None => {
                let chunks = self.semantic.finish();
                self.dispatch_chunks(chunks, transport).await;
                self.llm_rx = None;
                let failures = self.llm.consecutive_failures().await;
                self.metrics.record_llm_outcome(failures, failures == 0);
                if self.pending_tts_utterances == 0 {
                    self.finish_llm_turn();
                }
            }
        }
    }

    async fn dispatch_chunks(&mut self, chunks: Vec<String>, _transport: &mut dyn Transport) {
        for chunk in chunks {
            if self.state.current() == ConversationState::Thinking {
                if let Err(e) = self.state.transition(ConversationState::Responding) {
                    warn!(session_id = %self.id, error = %e, "invalid transition attempted");
                }
            }
            self.pending_tts_utterances += 1;
            if self.tts_text_tx.send(chunk).await.is_err() {
                warn!(session_id = %self.id, "tts worker channel closed, dropping chunk");
                self.pending_tts_utterances -= 1;
            }
        }
    }

    fn finish_llm_turn(&mut self) {
        self.llm_turn_open = false;
        if self.state.current() == ConversationState::Responding
            || self.state.current() == ConversationState::Thinking
        {
            let _ = self.state.transition(ConversationState::Listening);
        }
    }

    async fn handle_tts_audio_event(&mut self, event: Option<AudioOutEvent>, transport: &mut dyn Transport) {
        match event {
            Some(AudioOutEvent::Start { utterance_id }) => {
                let _ = transport
                    .send(OutboundFrame::Control(ServerMessage::AudioOutputStart { utterance_id }))
                    .await;
            }
            Some(AudioOutEvent::Chunk { utterance_id, data }) => {
                self.metrics.tts_chunks_emitted.fetch_add(1, Ordering::Relaxed);
                let _ = transport.send(OutboundFrame::AudioChunk { utterance_id, data }).await;
            }
            Some(AudioOutEvent::Complete { utterance_id }) => {
                let _ = transport
                    .send(OutboundFrame::Control(ServerMessage::AudioOutputComplete { utterance_id }))
                    .await;
                self.pending_tts_utterances = self.pending_tts_utterances.saturating_sub(1);
                if self.llm_turn_open && self.llm_rx.is_none() && self.pending_tts_utterances == 0 {
                    self.finish_llm_turn();
                }
            }
            None => {
                warn!(session_id = %self.id, "tts worker channel closed");
            }
        }
    }

    async fn fail_session(&mut self, error: ClassifiedError, transport: &mut dyn Transport) {
        let _ = transport
            .send(OutboundFrame::Control(ServerMessage::Error {
                code: error.kind.to_string(),
                message: error.message.clone(),
                retryable: error.retryable(),
            }))
            .await;
        let _ = self.state.transition(ConversationState::Ended);
    }

    /// Tears down sub-sessions and forces the state machine to ENDED.
    pub async fn end(&mut self) {
        let _ = self.state.transition(ConversationState::Ended);
        self.stt.end().await;
        self.llm.end().await;
    }
}
