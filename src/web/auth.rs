//! Shared-secret middleware for mutating endpoints.
//!
//! Health and diagnostics stay open; everything else requires the
//! `x-provision-key` header to match the configured key. An empty key
//! disables the check (a startup warning is logged for that case).

use std::sync::Arc;
use axum::{
    extract::{Extension, Request},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use tracing::warn;

use crate::AppState;

pub const AUTH_HEADER: &str = "x-provision-key";

pub async fn require_provision_key(
    Extension(state): Extension<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let expected = state.config.read().await.auth_token.clone();

    if expected.is_empty() {
        // No key configured - open access
        return next.run(request).await;
    }

    let provided = request
        .headers()
        .get(AUTH_HEADER)
        .and_then(|v| v.to_str().ok());

    match provided {
        Some(key) if key == expected => next.run(request).await,
        Some(_) => {
            warn!("[Auth] Invalid {} header", AUTH_HEADER);
            unauthorized()
        }
        None => {
            warn!("[Auth] Missing {} header", AUTH_HEADER);
            unauthorized()
        }
    }
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({ "error": "unauthorized" })),
    )
        .into_response()
}
