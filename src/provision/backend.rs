//! Chrome-backed provisioning
//!
//! Wires the shared browser engine, per-account sessions, and the IMAP email
//! waiter into the orchestrator's backend seam.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::AppConfig;
use crate::browser::{AccountSession, BrowserEngine, EngineConfig, SessionConfig};
use crate::mail::{EmailWaiter, ImapMailbox, MailboxConfig};
use crate::notify::Notifier;
use crate::store::Account;

use super::machine::{self, AttemptContext, LinkWaiter, ProvisionError, ProvisioningResult};
use super::orchestrator::ProvisionBackend;

pub struct ChromeBackend {
    engine_config: EngineConfig,
    signup_url: String,
    nav_timeout: Duration,
    field_timeout: Duration,
    snapshot_dir: PathBuf,
    waiter: EmailWaiter<ImapMailbox>,
    wait_budget: Duration,
    notifier: Arc<dyn Notifier>,
}

impl ChromeBackend {
    pub fn from_config(config: &AppConfig, notifier: Arc<dyn Notifier>) -> Self {
        let mailbox = ImapMailbox::new(MailboxConfig {
            host: config.imap_host.clone(),
            port: config.imap_port,
            user: config.imap_user.clone(),
            password: config.imap_password.clone(),
            sender_domain: config.mail_sender_domain.clone(),
            recency_secs: config.email_recency_secs,
        });
        let waiter = EmailWaiter::new(
            mailbox,
            &config.site_domain,
            Duration::from_secs(config.email_poll_secs),
        );

        Self {
            engine_config: EngineConfig {
                headless: config.headless,
                chrome_path: config.chrome_path.clone(),
            },
            signup_url: config.signup_url.clone(),
            nav_timeout: Duration::from_secs(config.nav_timeout_secs),
            field_timeout: Duration::from_secs(config.field_timeout_secs),
            snapshot_dir: config.snapshot_path(),
            waiter,
            wait_budget: Duration::from_secs(config.email_wait_secs),
            notifier,
        }
    }
}

#[async_trait]
impl LinkWaiter for ChromeBackend {
    async fn await_link(&self, recipient: &str) -> Result<String, ProvisionError> {
        self.waiter
            .await_confirmation_link(recipient, self.wait_budget)
            .await
            .map_err(Into::into)
    }
}

#[async_trait]
impl ProvisionBackend for ChromeBackend {
    type Engine = BrowserEngine;

    async fn launch(&self) -> Result<BrowserEngine, ProvisionError> {
        BrowserEngine::launch(&self.engine_config)
            .await
            .map_err(Into::into)
    }

    async fn attempt(
        &self,
        engine: &BrowserEngine,
        ctx: &AttemptContext,
        account: &Account,
    ) -> ProvisioningResult {
        let session_config = SessionConfig {
            signup_url: self.signup_url.clone(),
            nav_timeout: self.nav_timeout,
            field_timeout: self.field_timeout,
            snapshot_dir: self.snapshot_dir.clone(),
            position: ctx.position,
        };

        let mut session =
            match AccountSession::create(engine.browser(), session_config, ctx.location).await {
                Ok(session) => session,
                Err(e) => {
                    return ProvisioningResult {
                        account_id: account.id.clone(),
                        success: false,
                        email: account.email.clone(),
                        error: Some(ProvisionError::from(e).to_string()),
                    }
                }
            };

        let result =
            machine::run_attempt(&mut session, self, self.notifier.as_ref(), ctx, account).await;

        // Teardown happens whatever the outcome.
        session.close().await;

        result
    }

    async fn shutdown(&self, engine: BrowserEngine) {
        engine.close().await;
    }
}
