//! Account provisioning state machine
//!
//! Drives one account through registration and confirmation. Every error is
//! caught at this boundary and converted into a failed `ProvisioningResult`;
//! nothing escapes to abort the batch. The caller owns session teardown.

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::browser::BrowserError;
use crate::mail::WaitError;
use crate::notify::Notifier;
use crate::store::Account;

use super::locations::Location;

/// Attempt-level failures. Display strings lead with the taxonomy name
/// because they are persisted into account notes.
#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("NavigationError: {0}")]
    Navigation(String),

    #[error("FieldNotFound: no input matched the {0} field")]
    FieldNotFound(&'static str),

    #[error("VerificationTimeout: no confirmation email within {0}s")]
    VerificationTimeout(u64),

    #[error("LinkNotFound: confirmation email contained no verification link")]
    LinkNotFound,

    #[error("MailSearchError: {0}")]
    MailSearch(String),

    #[error("UnexpectedRedirect: landed on {0}")]
    UnexpectedRedirect(String),

    #[error("browser failure: {0}")]
    Browser(#[from] BrowserError),
}

impl From<WaitError> for ProvisionError {
    fn from(e: WaitError) -> Self {
        match e {
            WaitError::Timeout { waited_secs } => ProvisionError::VerificationTimeout(waited_secs),
            WaitError::LinkNotFound => ProvisionError::LinkNotFound,
            WaitError::Connect(msg) | WaitError::Search(msg) => ProvisionError::MailSearch(msg),
        }
    }
}

/// Pipeline stages for one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionStage {
    Initialized,
    PageLoaded,
    FormFilled,
    Submitted,
    AwaitingVerification,
    LinkReceived,
    LinkVisited,
    Verified,
    Failed,
}

/// Per-attempt context threaded through the machine and into logging and
/// notification calls.
#[derive(Debug, Clone)]
pub struct AttemptContext {
    /// 1-based position within the batch
    pub position: usize,
    pub total: usize,
    pub location: &'static Location,
    pub site_domain: String,
}

/// Outcome of one attempt.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisioningResult {
    pub account_id: String,
    pub success: bool,
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One browser session being driven through the sign-up flow.
///
/// Optional-field lookups are `Option`-shaped inside the implementation:
/// absence of a display-name/location input or a terms checkbox is not an
/// error, and `submit` reports whether a control was actually activated.
#[async_trait]
pub trait SignupSession: Send {
    async fn open_registration(&mut self) -> Result<(), ProvisionError>;

    /// Fill the required email and password fields.
    async fn fill_credentials(&mut self, email: &str, password: &str) -> Result<(), ProvisionError>;

    /// Fill display-name and location fields when they exist.
    async fn fill_profile(&mut self, display_name: &str, city: &str) -> Result<(), ProvisionError>;

    /// Check the terms checkbox when it exists.
    async fn accept_terms(&mut self) -> Result<(), ProvisionError>;

    /// Activate a submit control. `Ok(false)` means none was found.
    async fn submit(&mut self) -> Result<bool, ProvisionError>;

    /// Navigate this session to the confirmation link.
    async fn open_link(&mut self, url: &str) -> Result<(), ProvisionError>;

    async fn current_url(&mut self) -> Result<String, ProvisionError>;

    /// Capture a diagnostic snapshot. Best-effort; never affects the result.
    async fn snapshot(&mut self, label: &str);
}

/// Source of the confirmation link for a recipient address.
#[async_trait]
pub trait LinkWaiter: Send + Sync {
    async fn await_link(&self, recipient: &str) -> Result<String, ProvisionError>;
}

/// Run one provisioning attempt to completion.
pub async fn run_attempt<S, W>(
    session: &mut S,
    waiter: &W,
    notifier: &dyn Notifier,
    ctx: &AttemptContext,
    account: &Account,
) -> ProvisioningResult
where
    S: SignupSession,
    W: LinkWaiter,
{
    info!(
        "[{}/{}] Provisioning {} (location: {})",
        ctx.position, ctx.total, account.email, ctx.location.name
    );

    match drive(session, waiter, notifier, ctx, account).await {
        Ok(()) => {
            info!("[{}/{}] Verified: {}", ctx.position, ctx.total, account.email);
            ProvisioningResult {
                account_id: account.id.clone(),
                success: true,
                email: account.email.clone(),
                error: None,
            }
        }
        Err(e) => {
            let reason = e.to_string();
            error!("[{}/{}] Failed: {} - {}", ctx.position, ctx.total, account.email, reason);
            session.snapshot("error").await;
            ProvisioningResult {
                account_id: account.id.clone(),
                success: false,
                email: account.email.clone(),
                error: Some(reason),
            }
        }
    }
}

fn advance(stage: &mut ProvisionStage, next: ProvisionStage, ctx: &AttemptContext) {
    *stage = next;
    debug!("[{}/{}] stage {:?}", ctx.position, ctx.total, stage);
}

async fn drive<S, W>(
    session: &mut S,
    waiter: &W,
    notifier: &dyn Notifier,
    ctx: &AttemptContext,
    account: &Account,
) -> Result<(), ProvisionError>
where
    S: SignupSession,
    W: LinkWaiter,
{
    let mut stage = ProvisionStage::Initialized;

    session.open_registration().await?;
    advance(&mut stage, ProvisionStage::PageLoaded, ctx);

    session.fill_credentials(&account.email, &account.password).await?;
    session.fill_profile(&account.display_name, ctx.location.name).await?;
    session.accept_terms().await?;
    advance(&mut stage, ProvisionStage::FormFilled, ctx);

    session.snapshot("before-submit").await;

    if !session.submit().await? {
        // Some sign-up variants submit on Enter and ship no visible control;
        // treated as a no-op rather than a hard failure.
        warn!("[{}/{}] No submit control found, continuing", ctx.position, ctx.total);
    }
    advance(&mut stage, ProvisionStage::Submitted, ctx);

    session.snapshot("after-submit").await;

    advance(&mut stage, ProvisionStage::AwaitingVerification, ctx);
    notifier
        .send(&format!(
            "[{}/{}] Waiting for verification email: <code>{}</code>",
            ctx.position, ctx.total, account.email
        ))
        .await;

    let link = waiter.await_link(&account.email).await?;
    advance(&mut stage, ProvisionStage::LinkReceived, ctx);
    debug!("[{}/{}] Verification link: {}", ctx.position, ctx.total, link);

    session.open_link(&link).await?;
    advance(&mut stage, ProvisionStage::LinkVisited, ctx);

    session.snapshot("verified").await;

    let final_url = session.current_url().await?;
    if !address_confirms(&final_url, &ctx.site_domain) {
        return Err(ProvisionError::UnexpectedRedirect(final_url));
    }

    advance(&mut stage, ProvisionStage::Verified, ctx);
    Ok(())
}

/// Success check for the post-confirmation address: it must belong to the
/// target site and carry no error marker.
pub fn address_confirms(address: &str, site_domain: &str) -> bool {
    if address.contains("error") {
        return false;
    }
    let Ok(url) = Url::parse(address) else {
        return false;
    };
    url.host_str()
        .map(|host| host == site_domain || host.ends_with(&format!(".{site_domain}")))
        .unwrap_or(false)
}
