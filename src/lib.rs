//! Voicegate - Real-Time Conversational Voice Agent Gateway
//!
//! A gateway that bridges a browser/phone client to an STT, LLM, and TTS
//! provider over a single WebSocket connection, running one session per
//! connection with its own conversation state machine.

pub mod audio;
pub mod config;
pub mod error;
pub mod metrics;
pub mod providers;
pub mod server;
pub mod session;
pub mod supervisor;
pub mod transport;

pub use config::{Cli, GatewayConfig};
pub use supervisor::Supervisor;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
