//! Session supervisor (§4.8): owns the session map, enforces the
//! per-session idle/max-lifetime bounds and the cluster-wide session cap,
//! and exposes aggregated metrics.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{info, info_span, warn, Instrument};

use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::providers::{LlmProvider, SttConnector, TtsConnector};
use crate::session::{EndSignal, Session};
use crate::transport::Transport;

struct SessionHandle {
    end_signal: Option<EndSignal>,
    activity: Arc<StdMutex<Instant>>,
    created_at: Instant,
}

/// Owns the set of active sessions. Cloneable: all clones share the same
/// underlying map and metrics (`Arc<RwLock<..>>`/`Arc<Metrics>`), matching
/// the reference implementation's shared-registry style.
#[derive(Clone)]
pub struct Supervisor {
    sessions: Arc<RwLock<HashMap<String, SessionHandle>>>,
    config: Arc<GatewayConfig>,
    metrics: Arc<Metrics>,
    shutting_down: Arc<AtomicBool>,
    stt_connector: Arc<dyn SttConnector>,
    llm_provider: Arc<dyn LlmProvider>,
    tts_connector: Arc<dyn TtsConnector>,
}

impl Supervisor {
    pub fn new(
        config: Arc<GatewayConfig>,
        stt_connector: Arc<dyn SttConnector>,
        llm_provider: Arc<dyn LlmProvider>,
        tts_connector: Arc<dyn TtsConnector>,
    ) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            config,
            metrics: Arc::new(Metrics::new()),
            shutting_down: Arc::new(AtomicBool::new(false)),
            stt_connector,
            llm_provider,
            tts_connector,
        }
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Constructs, connects, and registers a new session, then runs its
    /// dispatch loop to completion against `transport`. The registration
    /// is removed once the loop returns, regardless of how it ended. Every
    /// event emitted while the session is live is tagged with its id via
    /// the entered span, so sub-sessions never need to pass it around.
    pub async fn run_session(
        &self,
        id: String,
        client_sample_rate: u32,
        language: String,
        voice_id: Option<String>,
        transport: &mut dyn Transport,
    ) -> Result<(), GatewayError> {
        let span = info_span!("session", session_id = %id);
        self.run_session_inner(id, client_sample_rate, language, voice_id, transport)
            .instrument(span)
            .await
    }

    async fn run_session_inner(
        &self,
        id: String,
        client_sample_rate: u32,
        language: String,
        voice_id: Option<String>,
        transport: &mut dyn Transport,
    ) -> Result<(), GatewayError> {
        if self.shutting_down.load(Ordering::Relaxed) {
            return Err(GatewayError::ShuttingDown);
        }
        {
            let sessions = self.sessions.read().await;
            if sessions.len() >= self.config.supervisor.max_sessions {
                return Err(GatewayError::Capacity);
            }
        }

        let (mut session, end_signal) = Session::new(
            &self.config,
            id.clone(),
            self.stt_connector.clone(),
            self.llm_provider.clone(),
            self.tts_connector.clone(),
            client_sample_rate,
            language,
            voice_id,
            self.metrics.clone(),
        );

        if let Err(e) = session.start().await {
            warn!(error = %e, "session failed to initialize");
            return Err(GatewayError::Provider(e));
        }

        let handle = SessionHandle {
            end_signal: Some(end_signal),
            activity: session.activity_handle(),
            created_at: session.created_at(),
        };
        self.sessions.write().await.insert(id.clone(), handle);
        self.metrics.session_created();
        info!("session started");

        session.run(transport).await;
        session.end().await;

        self.sessions.write().await.remove(&id);
        self.metrics.session_cleaned();
        info!("session ended");
        Ok(())
    }

    pub async fn has(&self, id: &str) -> bool {
        self.sessions.read().await.contains_key(id)
    }

    /// Signals the session to end; its own dispatch loop performs teardown
    /// and removes itself from the map.
    pub async fn end(&self, id: &str) {
        let mut sessions = self.sessions.write().await;
        if let Some(handle) = sessions.get_mut(id) {
            if let Some(EndSignal(tx)) = handle.end_signal.take() {
                let _ = tx.send(());
            }
        }
    }

    /// Runs one cleanup pass: ends any session past its idle or
    /// max-lifetime bound. A session whose handle has already had its
    /// signal taken (end in flight) is skipped, not retried.
    async fn cleanup_pass(&self, idle_timeout: Duration, max_duration: Duration) {
        let expired: Vec<String> = {
            let sessions = self.sessions.read().await;
            sessions
                .iter()
                .filter(|(_, handle)| handle.end_signal.is_some())
                .filter(|(_, handle)| {
                    let idle_for = handle.activity.lock().unwrap().elapsed();
                    idle_for >= idle_timeout || handle.created_at.elapsed() >= max_duration
                })
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in &expired {
            info!(session_id = %id, "cleanup pass evicting session");
            self.end(id).await;
        }
    }

    /// Spawns the periodic cleanup timer (§4.8). Call once after
    /// constructing the supervisor.
    pub fn spawn_cleanup_timer(&self) {
        let this = self.clone();
        let interval = Duration::from_millis(self.config.supervisor.cleanup_interval_ms);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                this.cleanup_pass(
                    Duration::from_millis(this.config.supervisor.session_idle_timeout_ms),
                    Duration::from_millis(this.config.supervisor.session_max_duration_ms),
                )
                .await;
            }
        });
    }

    /// Sets the shutdown flag (rejecting new `create` calls) and ends
    /// every active session, waiting up to `deadline` before returning.
    pub async fn shutdown(&self, deadline: Duration) {
        self.shutting_down.store(true, Ordering::Relaxed);
        let ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        for id in &ids {
            self.end(id).await;
        }

        let waited = tokio::time::timeout(deadline, async {
            while !self.sessions.read().await.is_empty() {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;

        if waited.is_err() {
            warn!("shutdown deadline exceeded with sessions still active, forcing close");
        }
    }
}
