//! Progress notifications
//!
//! Fire-and-forget Telegram messages for batch lifecycle events. Delivery
//! failures are swallowed: notifications must never block provisioning.

use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver a message, best-effort. HTML markup is allowed.
    async fn send(&self, text: &str);
}

/// Telegram bot channel. Disabled (every send is a no-op) when either the
/// token or the chat id is missing.
pub struct TelegramNotifier {
    bot_token: String,
    chat_id: String,
    client: reqwest::Client,
}

impl TelegramNotifier {
    pub fn new(bot_token: &str, chat_id: &str) -> Self {
        Self {
            bot_token: bot_token.to_string(),
            chat_id: chat_id.to_string(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
        }
    }

    fn enabled(&self) -> bool {
        !self.bot_token.is_empty() && !self.chat_id.is_empty()
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, text: &str) {
        if !self.enabled() {
            debug!("Telegram not configured, dropping notification");
            return;
        }

        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.bot_token);
        let body = serde_json::json!({
            "chat_id": self.chat_id,
            "text": text,
            "parse_mode": "HTML",
        });

        match self.client.post(&url).json(&body).send().await {
            Ok(resp) if !resp.status().is_success() => {
                warn!("Telegram rejected notification: {}", resp.status());
            }
            Ok(_) => {}
            Err(e) => warn!("Telegram delivery failed: {}", e),
        }
    }
}
