//! HTTP front door
//!
//! Thin axum boundary over the provisioning engine: start a batch, health
//! probe, and the form-structure diagnostics endpoint.

pub mod auth;
pub mod routes;

use std::sync::Arc;
use axum::Router;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::AppState;

/// Build the complete axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    routes::router(state).layer(TraceLayer::new_for_http())
}

/// Start the web server on the given port.
pub async fn start_server(state: Arc<AppState>, port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let app = build_router(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!("Web server listening on http://0.0.0.0:{}", port);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
