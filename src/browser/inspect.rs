//! Registration form diagnostics
//!
//! Dumps every form control on the sign-up page so selector lists can be
//! maintained by hand when the marketplace reshuffles its markup.

use std::time::Duration;
use chromiumoxide::browser::Browser;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{BrowserEngine, BrowserError, EngineConfig};

const COLLECT_CONTROLS_JS: &str = r#"
    Array.from(document.querySelectorAll('input, select, button, textarea')).map(el => ({
        tag: el.tagName,
        type: el.type || '',
        name: el.name || '',
        id: el.id || '',
        placeholder: el.placeholder || '',
        class: el.className || '',
        'data-testid': el.getAttribute('data-testid') || '',
        'aria-label': el.getAttribute('aria-label') || ''
    }))
"#;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormControl {
    pub tag: String,
    #[serde(rename = "type")]
    pub control_type: String,
    pub name: String,
    pub id: String,
    pub placeholder: String,
    pub class: String,
    #[serde(rename = "data-testid")]
    pub test_id: String,
    #[serde(rename = "aria-label")]
    pub aria_label: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FormInspection {
    pub url: String,
    pub controls: Vec<FormControl>,
}

/// Load the registration page in a short-lived engine and report its form
/// structure.
pub async fn inspect_signup_form(
    engine_config: &EngineConfig,
    signup_url: &str,
    nav_timeout: Duration,
) -> Result<FormInspection, BrowserError> {
    let engine = BrowserEngine::launch(engine_config).await?;
    let result = collect(engine.browser(), signup_url, nav_timeout).await;
    engine.close().await;
    result
}

async fn collect(
    browser: &Browser,
    signup_url: &str,
    nav_timeout: Duration,
) -> Result<FormInspection, BrowserError> {
    let page = browser
        .new_page("about:blank")
        .await
        .map_err(|e| BrowserError::LaunchFailed(e.to_string()))?;

    tokio::time::timeout(nav_timeout, async {
        page.goto(signup_url).await?;
        page.wait_for_navigation().await?;
        Ok::<_, chromiumoxide::error::CdpError>(())
    })
    .await
    .map_err(|_| BrowserError::Timeout(format!("navigation to {signup_url} timed out")))?
    .map_err(|e| BrowserError::NavigationFailed(e.to_string()))?;

    // Give client-side rendering time to attach the real form.
    tokio::time::sleep(Duration::from_secs(3)).await;

    let controls: Vec<FormControl> = page
        .evaluate(COLLECT_CONTROLS_JS)
        .await
        .map_err(|e| BrowserError::JavaScriptError(e.to_string()))?
        .into_value()
        .map_err(|e| BrowserError::JavaScriptError(e.to_string()))?;

    let url = page
        .url()
        .await
        .map_err(|e| BrowserError::ConnectionLost(e.to_string()))?
        .unwrap_or_else(|| signup_url.to_string());

    info!("Inspected {} with {} form controls", url, controls.len());
    Ok(FormInspection { url, controls })
}
