//! HTTP route handlers.
//!
//! All business logic is delegated to `crate::provision`; handlers only
//! clamp inputs, acknowledge, and spawn.

use std::sync::Arc;
use std::time::Duration;
use axum::{
    extract::{Extension, Json},
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use tracing::info;

use crate::AppState;
use crate::browser::{self, EngineConfig};
use crate::provision;

/// JSON error response helper
fn err_response(status: StatusCode, msg: &str) -> impl IntoResponse {
    (status, Json(serde_json::json!({ "error": msg })))
}

/// Build the API router.
pub fn router(state: Arc<AppState>) -> Router {
    let protected = Router::new()
        .route("/provision", post(start_batch))
        .route_layer(middleware::from_fn(super::auth::require_provision_key));

    Router::new()
        .route("/health", get(health))
        .route("/inspect", get(inspect_form))
        .merge(protected)
        .layer(Extension(state))
}

/// Clamp a requested batch size to [1, max]; zero or absent means default.
fn clamp_count(requested: Option<usize>, default_size: usize, max: usize) -> usize {
    match requested {
        None | Some(0) => default_size.min(max),
        Some(n) => n.min(max),
    }
}

// ========== Handlers ==========

#[derive(serde::Deserialize, Default)]
struct StartBatchRequest {
    count: Option<usize>,
}

/// Acknowledge immediately; the batch runs on a detached task and reports
/// through the notification channel and the account store.
async fn start_batch(
    Extension(state): Extension<Arc<AppState>>,
    payload: Option<Json<StartBatchRequest>>,
) -> impl IntoResponse {
    let requested = payload.and_then(|Json(req)| req.count);

    let count = {
        let config = state.config.read().await;
        clamp_count(requested, config.default_batch_size, config.max_batch_size)
    };

    info!("Batch of {} accounts requested via web API", count);
    tokio::spawn(provision::run_batch(state, count));

    Json(serde_json::json!({
        "accepted": true,
        "message": format!("Provisioning up to {} accounts", count),
    }))
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "ok": true,
        "service": "MapleList Provisioner",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Dump the sign-up page's form controls for selector maintenance.
async fn inspect_form(Extension(state): Extension<Arc<AppState>>) -> impl IntoResponse {
    let (engine_config, signup_url, nav_timeout) = {
        let config = state.config.read().await;
        (
            EngineConfig {
                // Diagnostics always run headless regardless of batch config
                headless: true,
                chrome_path: config.chrome_path.clone(),
            },
            config.signup_url.clone(),
            Duration::from_secs(config.nav_timeout_secs),
        )
    };

    match browser::inspect_signup_form(&engine_config, &signup_url, nav_timeout).await {
        Ok(report) => Json(report).into_response(),
        Err(e) => err_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_is_clamped_to_the_batch_maximum() {
        assert_eq!(clamp_count(Some(1000), 10, 50), 50);
        assert_eq!(clamp_count(Some(50), 10, 50), 50);
        assert_eq!(clamp_count(Some(3), 10, 50), 3);
        assert_eq!(clamp_count(Some(1), 10, 50), 1);
    }

    #[test]
    fn zero_or_absent_count_uses_the_default() {
        assert_eq!(clamp_count(None, 10, 50), 10);
        assert_eq!(clamp_count(Some(0), 10, 50), 10);
    }
}
