//! Browser engine lifecycle
//!
//! One Chrome instance is shared by a whole batch. Sessions are isolated via
//! browser contexts, not separate processes.

use std::path::PathBuf;
use std::time::Duration;
use chromiumoxide::browser::{Browser, BrowserConfig};
use futures::StreamExt;
use tracing::{debug, info, warn};

use super::BrowserError;

/// Engine launch options.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub headless: bool,
    /// Explicit Chrome path; auto-detected when unset
    pub chrome_path: Option<String>,
}

/// Find Chrome/Chromium executable on the system
fn find_chrome() -> Option<PathBuf> {
    let candidates: Vec<PathBuf> = if cfg!(target_os = "windows") {
        let mut paths = vec![
            PathBuf::from(r"C:\Program Files\Google\Chrome\Application\chrome.exe"),
            PathBuf::from(r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe"),
        ];
        if let Ok(local) = std::env::var("LOCALAPPDATA") {
            paths.push(PathBuf::from(format!(r"{}\Google\Chrome\Application\chrome.exe", local)));
        }
        paths
    } else if cfg!(target_os = "macos") {
        vec![
            PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome"),
        ]
    } else {
        vec![
            PathBuf::from("/usr/bin/google-chrome"),
            PathBuf::from("/usr/bin/google-chrome-stable"),
            PathBuf::from("/usr/bin/chromium"),
            PathBuf::from("/usr/bin/chromium-browser"),
        ]
    };

    candidates.into_iter().find(|p| p.exists())
}

/// A running Chrome instance with its CDP event handler.
pub struct BrowserEngine {
    browser: Browser,
    handler_task: tokio::task::JoinHandle<()>,
}

impl BrowserEngine {
    pub async fn launch(config: &EngineConfig) -> Result<Self, BrowserError> {
        if config.chrome_path.is_none() && find_chrome().is_none() {
            return Err(BrowserError::LaunchFailed(
                "Chrome not found. Install Google Chrome or Chromium, or set chromePath.".to_string(),
            ));
        }

        let mut builder = BrowserConfig::builder();

        if !config.headless {
            builder = builder.with_head();
        }

        if let Some(ref path) = config.chrome_path {
            builder = builder.chrome_executable(path);
        } else if let Some(chrome_path) = find_chrome() {
            info!("Auto-detected Chrome at: {}", chrome_path.display());
            builder = builder.chrome_executable(chrome_path);
        }

        builder = builder
            // Required when running as root (Docker / VPS deployments)
            .arg("--no-sandbox")
            .arg("--disable-setuid-sandbox")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-gpu")
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--disable-notifications")
            .window_size(1280, 800);

        let browser_config = builder.build().map_err(BrowserError::LaunchFailed)?;

        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| BrowserError::LaunchFailed(e.to_string()))?;

        // When the handler stream ends, Chrome has disconnected or crashed.
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    debug!("Browser event error: {:?}", event);
                }
            }
            warn!("Chrome disconnected (event handler ended)");
        });

        info!("Browser engine launched (headless: {})", config.headless);

        Ok(Self { browser, handler_task })
    }

    pub fn browser(&self) -> &Browser {
        &self.browser
    }

    /// Close the engine: graceful CDP close, short grace period, then kill so
    /// no Chrome child processes outlive the batch.
    pub async fn close(mut self) {
        let _ = self.browser.close().await;
        tokio::time::sleep(Duration::from_millis(500)).await;
        let _ = self.browser.kill().await;
        self.handler_task.abort();
        info!("Browser engine closed");
    }
}
