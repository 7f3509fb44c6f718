//! Client-facing web server: a single `axum` WebSocket route plus a health
//! endpoint, grounded on the reference implementation's `server` module
//! (`ServerState`, CORS/trace layers, `axum::serve`).

pub mod voice_ws;

use std::net::SocketAddr;

use axum::routing::get;
use axum::{Json, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::supervisor::Supervisor;

/// Shared server state handed to every route via axum's `State` extractor.
#[derive(Clone)]
pub struct ServerState {
    pub supervisor: Supervisor,
}

async fn health_handler(axum::extract::State(state): axum::extract::State<ServerState>) -> Json<crate::metrics::MetricsSnapshot> {
    Json(state.supervisor.metrics())
}

/// Builds the router: `/v1/voice` for the WebSocket session, `/healthz`
/// for a liveness/metrics snapshot.
pub fn router(supervisor: Supervisor) -> Router {
    let state = ServerState { supervisor };
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/v1/voice", get(voice_ws::ws_handler))
        .route("/healthz", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Binds and serves the router until `shutdown_signal` resolves.
pub async fn serve(
    bind_addr: &str,
    supervisor: Supervisor,
    shutdown_signal: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let addr: SocketAddr = bind_addr.parse()?;
    let app = router(supervisor);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "voicegate listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await?;
    Ok(())
}
