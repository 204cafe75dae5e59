//! MapleList Provisioner
//!
//! Headless service that bulk-provisions marketplace accounts: it drives a
//! browser session through the sign-up form, waits for the confirmation
//! email, follows the verification link, and records the outcome.

pub mod browser;
pub mod mail;
pub mod store;
pub mod notify;
pub mod provision;
pub mod web;

use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn, error};

use notify::TelegramNotifier;
use store::HttpAccountStore;

/// Application configuration
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    /// Shared secret for mutating endpoints (empty = auth disabled)
    #[serde(default)]
    pub auth_token: String,

    /// Account store base URL
    pub store_api_url: String,

    /// Telegram notifications (disabled when either field is empty)
    #[serde(default)]
    pub telegram_bot_token: String,
    #[serde(default)]
    pub telegram_chat_id: String,

    /// Mailbox receiving the confirmation emails
    pub imap_host: String,
    #[serde(default = "default_imap_port")]
    pub imap_port: u16,
    pub imap_user: String,
    #[serde(default)]
    pub imap_password: String,

    /// Target marketplace
    pub signup_url: String,
    pub site_domain: String,
    /// Sender domain the confirmation email must come from
    pub mail_sender_domain: String,

    /// Browser configuration
    #[serde(default = "default_headless")]
    pub headless: bool,
    #[serde(default)]
    pub chrome_path: Option<String>,

    /// Email waiter budgets
    #[serde(default = "default_email_wait")]
    pub email_wait_secs: u64,
    #[serde(default = "default_email_poll")]
    pub email_poll_secs: u64,
    /// Only confirmation emails younger than this are accepted
    #[serde(default = "default_email_recency")]
    pub email_recency_secs: u64,

    /// Page and form-field budgets
    #[serde(default = "default_nav_timeout")]
    pub nav_timeout_secs: u64,
    #[serde(default = "default_field_timeout")]
    pub field_timeout_secs: u64,

    /// Inter-account pacing bounds
    #[serde(default = "default_pacing_min")]
    pub pacing_min_ms: u64,
    #[serde(default = "default_pacing_max")]
    pub pacing_max_ms: u64,

    /// Batch sizing at the HTTP boundary
    #[serde(default = "default_batch_size")]
    pub default_batch_size: usize,
    #[serde(default = "default_batch_max")]
    pub max_batch_size: usize,

    /// Snapshot directory override (defaults under the system temp dir)
    #[serde(default)]
    pub snapshot_dir: Option<String>,
}

fn default_imap_port() -> u16 { 993 }
fn default_headless() -> bool { true }
fn default_email_wait() -> u64 { 120 }
fn default_email_poll() -> u64 { 5 }
fn default_email_recency() -> u64 { 300 }
fn default_nav_timeout() -> u64 { 30 }
fn default_field_timeout() -> u64 { 10 }
fn default_pacing_min() -> u64 { 5_000 }
fn default_pacing_max() -> u64 { 15_000 }
fn default_batch_size() -> usize { 10 }
fn default_batch_max() -> usize { 50 }

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            auth_token: String::new(),
            store_api_url: "https://accounts-api.maplelist.ca".to_string(),
            telegram_bot_token: String::new(),
            telegram_chat_id: String::new(),
            imap_host: "imap.gmail.com".to_string(),
            imap_port: default_imap_port(),
            imap_user: String::new(),
            imap_password: String::new(),
            signup_url: "https://www.maplelist.ca/signup".to_string(),
            site_domain: "maplelist.ca".to_string(),
            mail_sender_domain: "maplelist.ca".to_string(),
            headless: default_headless(),
            chrome_path: None,
            email_wait_secs: default_email_wait(),
            email_poll_secs: default_email_poll(),
            email_recency_secs: default_email_recency(),
            nav_timeout_secs: default_nav_timeout(),
            field_timeout_secs: default_field_timeout(),
            pacing_min_ms: default_pacing_min(),
            pacing_max_ms: default_pacing_max(),
            default_batch_size: default_batch_size(),
            max_batch_size: default_batch_max(),
            snapshot_dir: None,
        }
    }
}

/// Get log directory path (shared across modules)
pub fn log_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("maplelist-provisioner").join("logs"))
}

impl AppConfig {
    /// Get config file path
    fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("maplelist-provisioner").join("config.json"))
    }

    /// Load config from file, then apply environment overrides
    pub fn load() -> Self {
        let mut config = Self::load_file();
        config.apply_env();
        config
    }

    fn load_file() -> Self {
        if let Some(path) = Self::config_path() {
            if path.exists() {
                match std::fs::read_to_string(&path) {
                    Ok(content) => match serde_json::from_str(&content) {
                        Ok(config) => {
                            info!("Loaded config from {:?}", path);
                            return config;
                        }
                        Err(e) => {
                            warn!("Failed to parse config file: {}", e);
                        }
                    },
                    Err(e) => {
                        warn!("Failed to read config file: {}", e);
                    }
                }
            }
        }
        Self::default()
    }

    /// Secrets and deploy-specific values come from the environment when set.
    fn apply_env(&mut self) {
        let overrides: [(&str, &mut String); 5] = [
            ("PROVISIONER_AUTH_KEY", &mut self.auth_token),
            ("PROVISIONER_STORE_URL", &mut self.store_api_url),
            ("PROVISIONER_BOT_TOKEN", &mut self.telegram_bot_token),
            ("PROVISIONER_CHAT_ID", &mut self.telegram_chat_id),
            ("PROVISIONER_IMAP_PASSWORD", &mut self.imap_password),
        ];
        for (var, field) in overrides {
            if let Ok(value) = std::env::var(var) {
                if !value.is_empty() {
                    *field = value;
                }
            }
        }
    }

    /// Save config to file
    pub fn save(&self) {
        if let Some(path) = Self::config_path() {
            if let Some(parent) = path.parent() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    error!("Failed to create config directory: {}", e);
                    return;
                }
            }

            match serde_json::to_string_pretty(self) {
                Ok(content) => {
                    if let Err(e) = std::fs::write(&path, content) {
                        error!("Failed to save config: {}", e);
                    } else {
                        info!("Config saved to {:?}", path);
                    }
                }
                Err(e) => {
                    error!("Failed to serialize config: {}", e);
                }
            }
        }
    }

    /// Directory for page snapshots captured during provisioning
    pub fn snapshot_path(&self) -> PathBuf {
        match &self.snapshot_dir {
            Some(dir) => PathBuf::from(dir),
            None => std::env::temp_dir()
                .join("maplelist-provisioner")
                .join("snapshots"),
        }
    }
}

/// Application state shared across the app
pub struct AppState {
    /// Application configuration
    pub config: Arc<RwLock<AppConfig>>,
    /// Account store client
    pub store: Arc<HttpAccountStore>,
    /// Notification channel
    pub notifier: Arc<TelegramNotifier>,
    /// Whether a batch is currently running (single logical worker)
    pub batch_running: Arc<std::sync::atomic::AtomicBool>,
}

impl AppState {
    /// Create new application state with loaded config
    pub fn new() -> Self {
        let config = AppConfig::load();

        let store = Arc::new(HttpAccountStore::new(&config.store_api_url));
        let notifier = Arc::new(TelegramNotifier::new(
            &config.telegram_bot_token,
            &config.telegram_chat_id,
        ));

        if config.auth_token.is_empty() {
            warn!("No auth key configured - mutating endpoints are open (set PROVISIONER_AUTH_KEY)");
        }

        Self {
            config: Arc::new(RwLock::new(config)),
            store,
            notifier,
            batch_running: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

/// Initialize logging (console + daily-rolling file)
pub fn init_logging() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into());

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false);

    if let Some(log_dir) = log_dir() {
        let _ = std::fs::create_dir_all(&log_dir);
        let file_appender = tracing_appender::rolling::daily(&log_dir, "maplelist-provisioner.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_target(true)
            .with_writer(non_blocking);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .with(file_layer)
            .init();

        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .init();

        None
    }
}
