//! Typed, environment-sourced gateway configuration.
//!
//! Mirrors the recognized-options table: one field per environment
//! variable, `#[serde(default = "fn")]` per field so a partially-specified
//! config file (or none at all) still loads with documented defaults.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SttConfig {
    pub api_key: String,
    #[serde(default = "default_stt_ws_url")]
    pub ws_url: String,
    #[serde(default = "default_stt_model")]
    pub model: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    #[serde(default = "default_keepalive_interval_ms")]
    pub keepalive_interval_ms: u64,
}

fn default_stt_ws_url() -> String {
    "wss://stt.example.invalid/v1/listen".to_string()
}
fn default_stt_model() -> String {
    "gateway-listen-default".to_string()
}
fn default_language() -> String {
    "en-US".to_string()
}
fn default_connection_timeout_ms() -> u64 {
    5000
}
fn default_keepalive_interval_ms() -> u64 {
    8000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub api_key: String,
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default)]
    pub frequency_penalty: f32,
    #[serde(default)]
    pub presence_penalty: f32,
    #[serde(default = "default_llm_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
}

fn default_llm_base_url() -> String {
    "https://llm.example.invalid/v1".to_string()
}
fn default_llm_model() -> String {
    "gateway-default".to_string()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    500
}
fn default_top_p() -> f32 {
    1.0
}
fn default_llm_request_timeout_ms() -> u64 {
    30000
}
fn default_max_queue_size() -> usize {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    pub api_key: String,
    #[serde(default = "default_tts_ws_url")]
    pub ws_url: String,
    #[serde(default = "default_tts_model")]
    pub model: String,
    #[serde(default = "default_voice_id")]
    pub voice_id: String,
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    #[serde(default = "default_tts_keepalive_interval_ms")]
    pub keepalive_interval_ms: u64,
}

fn default_tts_ws_url() -> String {
    "wss://tts.example.invalid/v1/speak".to_string()
}
fn default_tts_model() -> String {
    "gateway-voice-default".to_string()
}
fn default_voice_id() -> String {
    "default".to_string()
}
fn default_tts_keepalive_interval_ms() -> u64 {
    30000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_idle_timeout_ms")]
    pub session_idle_timeout_ms: u64,
    #[serde(default = "default_max_duration_ms")]
    pub session_max_duration_ms: u64,
    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

fn default_idle_timeout_ms() -> u64 {
    1_800_000
}
fn default_max_duration_ms() -> u64 {
    7_200_000
}
fn default_cleanup_interval_ms() -> u64 {
    300_000
}
fn default_max_sessions() -> usize {
    50
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            session_idle_timeout_ms: default_idle_timeout_ms(),
            session_max_duration_ms: default_max_duration_ms(),
            cleanup_interval_ms: default_cleanup_interval_ms(),
            max_sessions: default_max_sessions(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SemanticConfig {
    #[serde(default = "default_max_buffer_size")]
    pub max_buffer_size: usize,
    #[serde(default = "default_break_marker")]
    pub break_marker: String,
}

fn default_max_buffer_size() -> usize {
    400
}
fn default_break_marker() -> String {
    "||BREAK||".to_string()
}

impl Default for SemanticConfig {
    fn default() -> Self {
        Self {
            max_buffer_size: default_max_buffer_size(),
            break_marker: default_break_marker(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub stt: SttConfig,
    pub llm: LlmConfig,
    pub tts: TtsConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub semantic: SemanticConfig,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

fn default_bind_addr() -> String {
    "127.0.0.1:8080".to_string()
}

impl GatewayConfig {
    /// Load from an optional TOML file layered under CLI/env overrides.
    pub fn load(path: Option<&PathBuf>, cli: &Cli) -> anyhow::Result<Self> {
        let mut config = if let Some(path) = path {
            let text = std::fs::read_to_string(path)
                .map_err(|e| anyhow::anyhow!("failed to read config file {path:?}: {e}"))?;
            toml::from_str(&text).map_err(|e| anyhow::anyhow!("invalid config file: {e}"))?
        } else {
            Self {
                stt: SttConfig {
                    api_key: String::new(),
                    ws_url: default_stt_ws_url(),
                    model: default_stt_model(),
                    language: default_language(),
                    connection_timeout_ms: default_connection_timeout_ms(),
                    keepalive_interval_ms: default_keepalive_interval_ms(),
                },
                llm: LlmConfig {
                    api_key: String::new(),
                    base_url: default_llm_base_url(),
                    model: default_llm_model(),
                    temperature: default_temperature(),
                    max_tokens: default_max_tokens(),
                    top_p: default_top_p(),
                    frequency_penalty: 0.0,
                    presence_penalty: 0.0,
                    request_timeout_ms: default_llm_request_timeout_ms(),
                    max_queue_size: default_max_queue_size(),
                },
                tts: TtsConfig {
                    api_key: String::new(),
                    ws_url: default_tts_ws_url(),
                    model: default_tts_model(),
                    voice_id: default_voice_id(),
                    connection_timeout_ms: default_connection_timeout_ms(),
                    keepalive_interval_ms: default_tts_keepalive_interval_ms(),
                },
                supervisor: SupervisorConfig::default(),
                semantic: SemanticConfig::default(),
                bind_addr: default_bind_addr(),
            }
        };

        if let Some(key) = &cli.stt_api_key {
            config.stt.api_key = key.clone();
        }
        if let Some(key) = &cli.llm_api_key {
            config.llm.api_key = key.clone();
        }
        if let Some(key) = &cli.tts_api_key {
            config.tts.api_key = key.clone();
        }
        if let Some(addr) = &cli.bind_addr {
            config.bind_addr = addr.clone();
        }

        if config.stt.api_key.is_empty() {
            anyhow::bail!("missing required credential: stt_api_key");
        }
        if config.llm.api_key.is_empty() {
            anyhow::bail!("missing required credential: llm_api_key");
        }
        if config.tts.api_key.is_empty() {
            anyhow::bail!("missing required credential: tts_api_key");
        }

        Ok(config)
    }
}

/// Command-line surface: a single server entrypoint, no subcommands.
/// Everything credential-shaped is also readable from the environment.
#[derive(Debug, Parser)]
#[command(name = "voicegate", about = "Real-time conversational voice agent gateway")]
pub struct Cli {
    /// Optional TOML config file layered under environment/CLI overrides.
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long, env = "STT_API_KEY")]
    pub stt_api_key: Option<String>,

    #[arg(long, env = "LLM_API_KEY")]
    pub llm_api_key: Option<String>,

    #[arg(long, env = "TTS_API_KEY")]
    pub tts_api_key: Option<String>,

    #[arg(long, env = "BIND_ADDR")]
    pub bind_addr: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_requires_credentials() {
        let cli = Cli {
            config: None,
            stt_api_key: None,
            llm_api_key: None,
            tts_api_key: None,
            bind_addr: None,
        };
        assert!(GatewayConfig::load(None, &cli).is_err());
    }

    #[test]
    fn test_load_with_credentials_applies_defaults() {
        let cli = Cli {
            config: None,
            stt_api_key: Some("s".into()),
            llm_api_key: Some("l".into()),
            tts_api_key: Some("t".into()),
            bind_addr: None,
        };
        let config = GatewayConfig::load(None, &cli).unwrap();
        assert_eq!(config.supervisor.max_sessions, 50);
        assert_eq!(config.semantic.break_marker, "||BREAK||");
        assert_eq!(config.llm.max_queue_size, 10);
        assert_eq!(config.bind_addr, "127.0.0.1:8080");
    }
}
