//! Aggregated supervisor-level counters, updated with `std::sync::atomic`
//! rather than a mutex-guarded struct, mirroring the reference
//! implementation's metrics style.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

#[derive(Default)]
pub struct Metrics {
    pub active_sessions: AtomicUsize,
    pub peak_concurrent_sessions: AtomicUsize,
    pub sessions_created: AtomicU64,
    pub sessions_cleaned: AtomicU64,
    pub audio_chunks_forwarded: AtomicU64,
    pub transcripts_received: AtomicU64,
    pub llm_requests_total: AtomicU64,
    pub llm_requests_success: AtomicU64,
    pub llm_requests_failure: AtomicU64,
    pub llm_fallback_tier1: AtomicU64,
    pub llm_fallback_tier2: AtomicU64,
    pub llm_fallback_tier3: AtomicU64,
    pub tts_chunks_emitted: AtomicU64,
    pub stt_reconnections: AtomicU64,
    pub tts_reconnections: AtomicU64,
}

/// Point-in-time, read-only view suitable for serializing out a `/metrics`
/// style snapshot.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct MetricsSnapshot {
    pub active_sessions: usize,
    pub peak_concurrent_sessions: usize,
    pub sessions_created: u64,
    pub sessions_cleaned: u64,
    pub audio_chunks_forwarded: u64,
    pub transcripts_received: u64,
    pub llm_requests_total: u64,
    pub llm_requests_success: u64,
    pub llm_requests_failure: u64,
    pub llm_fallback_tier1: u64,
    pub llm_fallback_tier2: u64,
    pub llm_fallback_tier3: u64,
    pub tts_chunks_emitted: u64,
    pub stt_reconnections: u64,
    pub tts_reconnections: u64,
    /// Rough estimate only: active_sessions * a fixed per-session footprint.
    pub estimated_memory_bytes: u64,
}

const ESTIMATED_BYTES_PER_SESSION: u64 = 64 * 1024;

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_created(&self) {
        self.sessions_created.fetch_add(1, Ordering::Relaxed);
        let active = self.active_sessions.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_concurrent_sessions.fetch_max(active, Ordering::Relaxed);
    }

    pub fn session_cleaned(&self) {
        self.sessions_cleaned.fetch_add(1, Ordering::Relaxed);
        self.active_sessions.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_stt_reconnect(&self) {
        self.stt_reconnections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tts_reconnect(&self) {
        self.tts_reconnections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_llm_outcome(&self, consecutive_failures: u32, succeeded: bool) {
        self.llm_requests_total.fetch_add(1, Ordering::Relaxed);
        if succeeded {
            self.llm_requests_success.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.llm_requests_failure.fetch_add(1, Ordering::Relaxed);
        match consecutive_failures {
            1 => self.llm_fallback_tier1.fetch_add(1, Ordering::Relaxed),
            2 => self.llm_fallback_tier2.fetch_add(1, Ordering::Relaxed),
            _ => self.llm_fallback_tier3.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let active = self.active_sessions.load(Ordering::Relaxed);
        MetricsSnapshot {
            active_sessions: active,
            peak_concurrent_sessions: self.peak_concurrent_sessions.load(Ordering::Relaxed),
            sessions_created: self.sessions_created.load(Ordering::Relaxed),
            sessions_cleaned: self.sessions_cleaned.load(Ordering::Relaxed),
            audio_chunks_forwarded: self.audio_chunks_forwarded.load(Ordering::Relaxed),
            transcripts_received: self.transcripts_received.load(Ordering::Relaxed),
            llm_requests_total: self.llm_requests_total.load(Ordering::Relaxed),
            llm_requests_success: self.llm_requests_success.load(Ordering::Relaxed),
            llm_requests_failure: self.llm_requests_failure.load(Ordering::Relaxed),
            llm_fallback_tier1: self.llm_fallback_tier1.load(Ordering::Relaxed),
            llm_fallback_tier2: self.llm_fallback_tier2.load(Ordering::Relaxed),
            llm_fallback_tier3: self.llm_fallback_tier3.load(Ordering::Relaxed),
            tts_chunks_emitted: self.tts_chunks_emitted.load(Ordering::Relaxed),
            stt_reconnections: self.stt_reconnections.load(Ordering::Relaxed),
            tts_reconnections: self.tts_reconnections.load(Ordering::Relaxed),
            estimated_memory_bytes: active as u64 * ESTIMATED_BYTES_PER_SESSION,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peak_tracks_max_not_current() {
        let m = Metrics::new();
        m.session_created();
        m.session_created();
        m.session_cleaned();
        let snap = m.snapshot();
        assert_eq!(snap.active_sessions, 1);
        assert_eq!(snap.peak_concurrent_sessions, 2);
        assert_eq!(snap.sessions_created, 2);
        assert_eq!(snap.sessions_cleaned, 1);
    }

    #[test]
    fn test_fallback_tier_counters() {
        let m = Metrics::new();
        m.record_llm_outcome(1, false);
        m.record_llm_outcome(2, false);
        m.record_llm_outcome(3, false);
        m.record_llm_outcome(0, true);
        let snap = m.snapshot();
        assert_eq!(snap.llm_fallback_tier1, 1);
        assert_eq!(snap.llm_fallback_tier2, 1);
        assert_eq!(snap.llm_fallback_tier3, 1);
        assert_eq!(snap.llm_requests_success, 1);
        assert_eq!(snap.llm_requests_total, 4);
    }
}
