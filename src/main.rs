//! Voicegate - Real-Time Conversational Voice Agent Gateway
//!
//! Bootstraps configuration, provider clients, and the session supervisor,
//! then serves the client-facing WebSocket transport until shutdown.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use voicegate::config::{Cli, GatewayConfig};
use voicegate::providers::{llm_http::HttpLlmProvider, stt_ws::WsSttConnector, tts_ws::WsTtsConnector};
use voicegate::server;
use voicegate::supervisor::Supervisor;

const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("RUST_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let config = GatewayConfig::load(cli.config.as_ref(), &cli)?;
    let bind_addr = config.bind_addr.clone();
    let config = Arc::new(config);

    let stt_connector = Arc::new(WsSttConnector::new(config.stt.clone()));
    let llm_provider = Arc::new(HttpLlmProvider::new(config.llm.clone()));
    let tts_connector = Arc::new(WsTtsConnector::new(config.tts.clone()));

    let supervisor = Supervisor::new(config, stt_connector, llm_provider, tts_connector);
    supervisor.spawn_cleanup_timer();

    let shutdown_supervisor = supervisor.clone();
    server::serve(&bind_addr, supervisor, async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received, draining sessions");
        shutdown_supervisor.shutdown(SHUTDOWN_DEADLINE).await;
    })
    .await
}
