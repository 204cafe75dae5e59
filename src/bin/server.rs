//! MapleList Provisioner - service entry point
//!
//! Environment variables:
//! - `PROVISIONER_PORT` - listener port (default: 3000)
//! - `PROVISIONER_AUTH_KEY` - shared secret for mutating endpoints
//! - `PROVISIONER_STORE_URL` - account store base URL
//! - `PROVISIONER_BOT_TOKEN` / `PROVISIONER_CHAT_ID` - Telegram notifications
//! - `PROVISIONER_IMAP_PASSWORD` - mailbox app password

use std::sync::Arc;
use tracing::info;

use maplelist_provisioner as app;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _guard = app::init_logging();

    info!("Starting MapleList Provisioner");

    if let Some(dir) = app::log_dir() {
        info!("Log files saved to: {}", dir.display());
    }

    let port: u16 = std::env::var("PROVISIONER_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(3000);

    let state = Arc::new(app::AppState::new());
    info!("Application state initialized");

    app::web::start_server(state, port)
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;

    Ok(())
}
