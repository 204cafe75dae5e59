//! Per-account browser session
//!
//! Each provisioning attempt gets a fresh browser context on the shared
//! engine: separate cookies and storage, a fixed device/locale/timezone
//! profile, and the assigned location's coordinates behind a granted
//! geolocation permission. The context is disposed when the attempt ends.

use std::path::{Path, PathBuf};
use std::time::Duration;
use async_trait::async_trait;
use chromiumoxide::{Browser, Element};
use chromiumoxide::cdp::browser_protocol::browser::{
    BrowserContextId, GrantPermissionsParams, PermissionType,
};
use chromiumoxide::cdp::browser_protocol::emulation::{
    SetDeviceMetricsOverrideParams, SetGeolocationOverrideParams, SetLocaleOverrideParams,
    SetTimezoneOverrideParams, SetUserAgentOverrideParams,
};
use chromiumoxide::cdp::browser_protocol::input::{DispatchKeyEventParams, DispatchKeyEventType};
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::cdp::browser_protocol::target::{
    CreateBrowserContextParams, CreateTargetParams, DisposeBrowserContextParams,
};
use chromiumoxide::page::{Page, ScreenshotParams};
use tracing::{debug, info, warn};

use crate::provision::{Location, ProvisionError, SignupSession};

use super::BrowserError;

/// Desktop profile shared by every session; only the geolocation varies.
const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                          (KHTML, like Gecko) Chrome/121.0.0.0 Safari/537.36";
const ACCEPT_LANGUAGE: &str = "en-CA,en;q=0.9";
const TIMEZONE: &str = "America/Toronto";
const LOCALE: &str = "en-CA";
const VIEWPORT: (i64, i64) = (1280, 800);

/// Prioritized selectors per logical form field.
mod selectors {
    pub const EMAIL: &[&str] = &["input[type='email']", "input[name='email']", "#email"];
    pub const PASSWORD: &[&str] = &["input[type='password']", "input[name='password']", "#password"];
    pub const NICKNAME: &[&str] = &["input[name='nickname']", "input[name='displayName']", "#nickname"];
    pub const LOCATION: &[&str] = &["input[name='location']", "input[placeholder*='location' i]", "#location"];
    pub const TERMS: &[&str] = &["input[type='checkbox']"];
    pub const SUBMIT: &[&str] = &["button[type='submit']", "input[type='submit']"];
}

/// Fallback when no submit-typed control exists: activate a button whose
/// role text reads like a sign-up action.
const SUBMIT_BY_TEXT_JS: &str = r#"
    (function() {
        const candidates = Array.from(document.querySelectorAll('button, [role="button"]'));
        const pattern = /sign\s*up|register/i;
        const control = candidates.find(el => pattern.test(el.innerText || el.value || ''));
        if (control) {
            control.click();
            return true;
        }
        return false;
    })()
"#;

/// Per-session options derived from the app config and batch position.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub signup_url: String,
    pub nav_timeout: Duration,
    pub field_timeout: Duration,
    pub snapshot_dir: PathBuf,
    /// 1-based batch position, used in snapshot names
    pub position: usize,
}

/// An isolated browsing context driving one sign-up attempt.
pub struct AccountSession<'a> {
    browser: &'a Browser,
    page: Page,
    context_id: BrowserContextId,
    config: SessionConfig,
}

impl<'a> AccountSession<'a> {
    pub async fn create(
        browser: &'a Browser,
        config: SessionConfig,
        location: &Location,
    ) -> Result<AccountSession<'a>, BrowserError> {
        let context = browser
            .execute(CreateBrowserContextParams::default())
            .await
            .map_err(|e| BrowserError::LaunchFailed(format!("create context: {e}")))?;
        let context_id = context.result.browser_context_id.clone();

        let mut grant = GrantPermissionsParams::new(vec![PermissionType::Geolocation]);
        grant.browser_context_id = Some(context_id.clone());
        browser
            .execute(grant)
            .await
            .map_err(|e| BrowserError::LaunchFailed(format!("grant geolocation: {e}")))?;

        let target = CreateTargetParams::builder()
            .url("about:blank")
            .browser_context_id(context_id.clone())
            .build()
            .map_err(BrowserError::LaunchFailed)?;
        let page = browser
            .new_page(target)
            .await
            .map_err(|e| BrowserError::LaunchFailed(format!("create page: {e}")))?;

        let session = Self { browser, page, context_id, config };
        session.apply_fingerprint(location).await?;

        let _ = std::fs::create_dir_all(&session.config.snapshot_dir);

        info!(
            "Session {} ready (location: {}, {:.4}/{:.4})",
            session.config.position, location.name, location.latitude, location.longitude
        );
        Ok(session)
    }

    /// Fixed device/locale/timezone profile plus the per-account coordinates.
    async fn apply_fingerprint(&self, location: &Location) -> Result<(), BrowserError> {
        let map = |e: chromiumoxide::error::CdpError| BrowserError::LaunchFailed(e.to_string());

        self.page
            .execute(SetDeviceMetricsOverrideParams::new(VIEWPORT.0, VIEWPORT.1, 1.0, false))
            .await
            .map(|_| ())
            .map_err(map)?;

        let mut ua = SetUserAgentOverrideParams::new(USER_AGENT);
        ua.accept_language = Some(ACCEPT_LANGUAGE.to_string());
        ua.platform = Some("Win32".to_string());
        self.page.execute(ua).await.map(|_| ()).map_err(map)?;

        self.page
            .execute(SetTimezoneOverrideParams::new(TIMEZONE))
            .await
            .map(|_| ())
            .map_err(map)?;

        let mut locale = SetLocaleOverrideParams::default();
        locale.locale = Some(LOCALE.to_string());
        self.page.execute(locale).await.map(|_| ()).map_err(map)?;

        let mut geo = SetGeolocationOverrideParams::default();
        geo.latitude = Some(location.latitude);
        geo.longitude = Some(location.longitude);
        geo.accuracy = Some(100.0);
        self.page.execute(geo).await.map(|_| ()).map_err(map)?;

        Ok(())
    }

    /// Navigate and wait for the load to settle, bounded by `timeout`.
    async fn goto_within(&self, url: &str, timeout: Duration) -> Result<(), BrowserError> {
        tokio::time::timeout(timeout, async {
            self.page.goto(url).await?;
            self.page.wait_for_navigation().await?;
            Ok::<_, chromiumoxide::error::CdpError>(())
        })
        .await
        .map_err(|_| BrowserError::Timeout(format!("navigation to {url} timed out")))?
        .map_err(|e| BrowserError::NavigationFailed(e.to_string()))?;
        Ok(())
    }

    /// Try each selector in priority order, polling until `budget` elapses.
    async fn find_first(&self, selectors: &[&str], budget: Duration) -> Option<Element> {
        let deadline = tokio::time::Instant::now() + budget;
        loop {
            for selector in selectors {
                if let Ok(element) = self.page.find_element(*selector).await {
                    return Some(element);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }

    /// Single-pass lookup for optional controls: absence is an answer, not a
    /// condition to wait out.
    async fn find_now(&self, selectors: &[&str]) -> Option<Element> {
        for selector in selectors {
            if let Ok(element) = self.page.find_element(*selector).await {
                return Some(element);
            }
        }
        None
    }

    async fn type_into(&self, element: &Element, text: &str) -> Result<(), BrowserError> {
        element.click().await.ok();
        element
            .type_str(text)
            .await
            .map_err(|e| BrowserError::JavaScriptError(e.to_string()))?;
        Ok(())
    }

    /// Press ArrowDown via raw CDP key events (selects the first autocomplete
    /// suggestion).
    async fn press_arrow_down(&self) -> Result<(), BrowserError> {
        let key_down = DispatchKeyEventParams::builder()
            .r#type(DispatchKeyEventType::RawKeyDown)
            .key("ArrowDown")
            .code("ArrowDown")
            .windows_virtual_key_code(40)
            .native_virtual_key_code(40)
            .build()
            .unwrap();
        self.page
            .execute(key_down)
            .await
            .map_err(|e| BrowserError::JavaScriptError(format!("CDP ArrowDown failed: {e}")))?;

        let key_up = DispatchKeyEventParams::builder()
            .r#type(DispatchKeyEventType::KeyUp)
            .key("ArrowDown")
            .code("ArrowDown")
            .windows_virtual_key_code(40)
            .native_virtual_key_code(40)
            .build()
            .unwrap();
        self.page
            .execute(key_up)
            .await
            .map_err(|e| BrowserError::JavaScriptError(format!("CDP ArrowDown failed: {e}")))?;

        Ok(())
    }

    /// Press Enter with the full key/char/keyUp sequence so form submission
    /// and option selection both trigger.
    async fn press_enter(&self) -> Result<(), BrowserError> {
        let key_down = DispatchKeyEventParams::builder()
            .r#type(DispatchKeyEventType::RawKeyDown)
            .key("Enter")
            .code("Enter")
            .windows_virtual_key_code(13)
            .native_virtual_key_code(13)
            .build()
            .unwrap();
        self.page
            .execute(key_down)
            .await
            .map_err(|e| BrowserError::JavaScriptError(format!("CDP Enter keyDown failed: {e}")))?;

        let char_event = DispatchKeyEventParams::builder()
            .r#type(DispatchKeyEventType::Char)
            .text("\r")
            .build()
            .unwrap();
        self.page
            .execute(char_event)
            .await
            .map_err(|e| BrowserError::JavaScriptError(format!("CDP Enter char failed: {e}")))?;

        let key_up = DispatchKeyEventParams::builder()
            .r#type(DispatchKeyEventType::KeyUp)
            .key("Enter")
            .code("Enter")
            .windows_virtual_key_code(13)
            .native_virtual_key_code(13)
            .build()
            .unwrap();
        self.page
            .execute(key_up)
            .await
            .map_err(|e| BrowserError::JavaScriptError(format!("CDP Enter keyUp failed: {e}")))?;

        Ok(())
    }

    async fn try_snapshot(&self, path: &Path) -> Result<(), BrowserError> {
        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .build();
        self.page
            .save_screenshot(params, path)
            .await
            .map_err(|e| BrowserError::ScreenshotFailed(e.to_string()))?;
        Ok(())
    }

    /// Tear the session down: close the page, dispose the context. Always
    /// called by the backend, success or failure.
    pub async fn close(self) {
        let _ = self.page.clone().close().await;
        let _ = self
            .browser
            .execute(DisposeBrowserContextParams::new(self.context_id.clone()))
            .await;
        debug!("Session {} context disposed", self.config.position);
    }
}

#[async_trait]
impl SignupSession for AccountSession<'_> {
    async fn open_registration(&mut self) -> Result<(), ProvisionError> {
        let url = self.config.signup_url.clone();
        self.goto_within(&url, self.config.nav_timeout)
            .await
            .map_err(|e| ProvisionError::Navigation(e.to_string()))?;
        // Let client-side rendering settle before probing for fields.
        tokio::time::sleep(Duration::from_secs(2)).await;
        Ok(())
    }

    async fn fill_credentials(&mut self, email: &str, password: &str) -> Result<(), ProvisionError> {
        let field = self
            .find_first(selectors::EMAIL, self.config.field_timeout)
            .await
            .ok_or(ProvisionError::FieldNotFound("email"))?;
        self.type_into(&field, email).await?;
        tokio::time::sleep(Duration::from_millis(500)).await;

        let field = self
            .find_first(selectors::PASSWORD, self.config.field_timeout)
            .await
            .ok_or(ProvisionError::FieldNotFound("password"))?;
        self.type_into(&field, password).await?;
        tokio::time::sleep(Duration::from_millis(500)).await;

        Ok(())
    }

    async fn fill_profile(&mut self, display_name: &str, city: &str) -> Result<(), ProvisionError> {
        if !display_name.is_empty() {
            if let Some(field) = self.find_now(selectors::NICKNAME).await {
                self.type_into(&field, display_name).await?;
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }

        if let Some(field) = self.find_now(selectors::LOCATION).await {
            self.type_into(&field, city).await?;
            tokio::time::sleep(Duration::from_secs(1)).await;
            // Accept the first autocomplete suggestion. Best-effort: the
            // dropdown may not render, and the attempt proceeds either way.
            if let Err(e) = self.press_arrow_down().await {
                debug!("Autocomplete ArrowDown failed: {e}");
            }
            if let Err(e) = self.press_enter().await {
                debug!("Autocomplete Enter failed: {e}");
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }

        Ok(())
    }

    async fn accept_terms(&mut self) -> Result<(), ProvisionError> {
        if let Some(checkbox) = self.find_now(selectors::TERMS).await {
            checkbox
                .click()
                .await
                .map_err(|e| BrowserError::JavaScriptError(e.to_string()))?;
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
        Ok(())
    }

    async fn submit(&mut self) -> Result<bool, ProvisionError> {
        if let Some(control) = self.find_now(selectors::SUBMIT).await {
            control
                .click()
                .await
                .map_err(|e| BrowserError::JavaScriptError(e.to_string()))?;
            tokio::time::sleep(Duration::from_secs(3)).await;
            return Ok(true);
        }

        let clicked = self
            .page
            .evaluate(SUBMIT_BY_TEXT_JS)
            .await
            .map_err(|e| BrowserError::JavaScriptError(e.to_string()))?
            .value()
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        if clicked {
            tokio::time::sleep(Duration::from_secs(3)).await;
        }
        Ok(clicked)
    }

    async fn open_link(&mut self, url: &str) -> Result<(), ProvisionError> {
        self.goto_within(url, self.config.nav_timeout)
            .await
            .map_err(|e| ProvisionError::Navigation(e.to_string()))?;
        tokio::time::sleep(Duration::from_secs(3)).await;
        Ok(())
    }

    async fn current_url(&mut self) -> Result<String, ProvisionError> {
        let url = self
            .page
            .url()
            .await
            .map_err(|e| BrowserError::ConnectionLost(e.to_string()))?
            .ok_or_else(|| BrowserError::ConnectionLost("no URL".into()))?;
        Ok(url)
    }

    async fn snapshot(&mut self, label: &str) {
        let path = self
            .config
            .snapshot_dir
            .join(format!("{}-{}.png", label, self.config.position));
        if let Err(e) = self.try_snapshot(&path).await {
            warn!("Snapshot {} not captured: {}", path.display(), e);
        }
    }
}
