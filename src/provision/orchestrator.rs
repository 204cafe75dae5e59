//! Batch orchestrator
//!
//! Pulls eligible accounts, runs one provisioning attempt per account
//! strictly sequentially on a single browser engine, paces between attempts,
//! and writes each outcome back before moving on. Per-account failures are
//! isolated; only an engine launch failure ends the batch early.

use async_trait::async_trait;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::notify::Notifier;
use crate::store::{Account, AccountPatch, AccountStore};

use super::locations;
use super::machine::{AttemptContext, ProvisionError, ProvisioningResult};

/// Counters accumulated across one batch run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub requested: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Inter-account pacing bounds. The delay is drawn uniformly per gap.
#[derive(Debug, Clone, Copy)]
pub struct PacingConfig {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl PacingConfig {
    fn jitter(&self) -> Duration {
        let mut rng = rand::rngs::StdRng::from_entropy();
        Duration::from_millis(rng.gen_range(self.min_ms..=self.max_ms.max(self.min_ms)))
    }
}

/// Provisioning execution behind the orchestrator: owns the browser engine
/// lifecycle and runs one attempt per account.
#[async_trait]
pub trait ProvisionBackend: Send + Sync {
    type Engine: Send + Sync;

    /// Allocate the engine shared by the whole batch.
    async fn launch(&self) -> Result<Self::Engine, ProvisionError>;

    /// Run one isolated attempt. Must not panic the batch: all attempt-level
    /// errors come back inside the result.
    async fn attempt(
        &self,
        engine: &Self::Engine,
        ctx: &AttemptContext,
        account: &Account,
    ) -> ProvisioningResult;

    /// Release the engine after the last account.
    async fn shutdown(&self, engine: Self::Engine);
}

pub struct Orchestrator<B: ProvisionBackend> {
    backend: B,
    store: Arc<dyn AccountStore>,
    notifier: Arc<dyn Notifier>,
    pacing: PacingConfig,
    site_domain: String,
}

impl<B: ProvisionBackend> Orchestrator<B> {
    pub fn new(
        backend: B,
        store: Arc<dyn AccountStore>,
        notifier: Arc<dyn Notifier>,
        pacing: PacingConfig,
        site_domain: &str,
    ) -> Self {
        Self {
            backend,
            store,
            notifier,
            pacing,
            site_domain: site_domain.to_string(),
        }
    }

    /// Run one batch of up to `count` accounts. Accounts are processed in
    /// store order; no browser resources are allocated when none are eligible.
    pub async fn run_batch(&self, count: usize) -> BatchSummary {
        let batch_id = Uuid::new_v4();
        info!("Starting batch {} (up to {} accounts)", batch_id, count);
        self.notifier
            .send(&format!("Starting provisioner: up to {} accounts", count))
            .await;

        let accounts = match self.store.list_eligible(count).await {
            Ok(accounts) => accounts,
            Err(e) => {
                error!("Failed to list eligible accounts: {}", e);
                Vec::new()
            }
        };

        if accounts.is_empty() {
            warn!("No accounts available with status \"ready\"");
            self.notifier.send("No accounts available with status \"ready\"").await;
            return BatchSummary::default();
        }

        let total = accounts.len();
        info!("Found {} eligible accounts", total);

        let engine = match self.backend.launch().await {
            Ok(engine) => engine,
            Err(e) => {
                error!("Batch {} crashed before the first attempt: {}", batch_id, e);
                self.notifier.send(&format!("Provisioner crashed: {}", e)).await;
                return BatchSummary { requested: total, succeeded: 0, failed: 0 };
            }
        };

        let mut summary = BatchSummary { requested: total, succeeded: 0, failed: 0 };

        for (idx, account) in accounts.iter().enumerate() {
            let ctx = AttemptContext {
                position: idx + 1,
                total,
                location: locations::assign(),
                site_domain: self.site_domain.clone(),
            };

            self.notifier
                .send(&format!("[{}/{}] Creating: <code>{}</code>", ctx.position, total, account.email))
                .await;

            let result = self.backend.attempt(&engine, &ctx, account).await;

            // The store write-back always lands before the next account starts.
            let patch = if result.success {
                AccountPatch::verified(format!("location:{}", ctx.location.name))
            } else {
                AccountPatch::failed(result.error.clone().unwrap_or_else(|| "unknown error".into()))
            };
            if let Err(e) = self.store.patch(&account.id, patch).await {
                warn!("Failed to update account {}: {}", account.id, e);
            }

            if result.success {
                summary.succeeded += 1;
                self.notifier
                    .send(&format!(
                        "[{}/{}] Verified: {} ({})",
                        ctx.position, total, account.email, ctx.location.name
                    ))
                    .await;
            } else {
                summary.failed += 1;
                let reason = result.error.as_deref().unwrap_or("unknown error");
                self.notifier
                    .send(&format!("[{}/{}] Failed: {} - {}", ctx.position, total, account.email, reason))
                    .await;
            }

            if ctx.position < total {
                let delay = self.pacing.jitter();
                debug!("Waiting {:?} before next account", delay);
                tokio::time::sleep(delay).await;
            }
        }

        self.backend.shutdown(engine).await;

        info!(
            "Batch {} complete: {} verified, {} failed",
            batch_id, summary.succeeded, summary.failed
        );
        self.notifier
            .send(&format!(
                "Provisioning done. Verified: {} / Failed: {}",
                summary.succeeded, summary.failed
            ))
            .await;

        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{AccountStatus, StoreError};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockBackend {
        launches: AtomicUsize,
        attempts: AtomicUsize,
        fail_launch: bool,
        fail_position: Option<usize>,
    }

    impl MockBackend {
        fn new() -> Self {
            Self {
                launches: AtomicUsize::new(0),
                attempts: AtomicUsize::new(0),
                fail_launch: false,
                fail_position: None,
            }
        }
    }

    #[async_trait]
    impl ProvisionBackend for MockBackend {
        type Engine = ();

        async fn launch(&self) -> Result<(), ProvisionError> {
            if self.fail_launch {
                return Err(ProvisionError::Navigation("chrome missing".into()));
            }
            self.launches.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn attempt(
            &self,
            _engine: &(),
            ctx: &AttemptContext,
            account: &Account,
        ) -> ProvisioningResult {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let forced_failure = self.fail_position == Some(ctx.position);
            ProvisioningResult {
                account_id: account.id.clone(),
                success: !forced_failure,
                email: account.email.clone(),
                error: forced_failure.then(|| "NavigationError: form never loaded".to_string()),
            }
        }

        async fn shutdown(&self, _engine: ()) {}
    }

    struct MockStore {
        accounts: Vec<Account>,
        fail_list: bool,
        patches: Mutex<Vec<(String, AccountPatch)>>,
    }

    impl MockStore {
        fn with_accounts(n: usize) -> Self {
            let accounts = (1..=n)
                .map(|i| Account {
                    id: format!("acc-{i}"),
                    email: format!("user{i}@x.com"),
                    password: "pw".to_string(),
                    display_name: format!("User {i}"),
                    status: AccountStatus::Ready,
                    notes: None,
                })
                .collect();
            Self {
                accounts,
                fail_list: false,
                patches: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl AccountStore for MockStore {
        async fn list_eligible(&self, limit: usize) -> Result<Vec<Account>, StoreError> {
            if self.fail_list {
                return Err(StoreError::Api(reqwest::StatusCode::BAD_GATEWAY));
            }
            Ok(self.accounts.iter().take(limit).cloned().collect())
        }

        async fn patch(&self, account_id: &str, patch: AccountPatch) -> Result<(), StoreError> {
            self.patches.lock().unwrap().push((account_id.to_string(), patch));
            Ok(())
        }
    }

    struct RecordingNotifier(Mutex<Vec<String>>);

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send(&self, text: &str) {
            self.0.lock().unwrap().push(text.to_string());
        }
    }

    fn orchestrator(
        backend: MockBackend,
        store: Arc<MockStore>,
        notifier: Arc<RecordingNotifier>,
    ) -> Orchestrator<MockBackend> {
        Orchestrator::new(
            backend,
            store,
            notifier,
            PacingConfig { min_ms: 0, max_ms: 0 },
            "maplelist.ca",
        )
    }

    #[tokio::test]
    async fn one_failure_does_not_abort_the_batch() {
        let mut backend = MockBackend::new();
        backend.fail_position = Some(2);
        let store = Arc::new(MockStore::with_accounts(4));
        let notifier = Arc::new(RecordingNotifier(Mutex::new(Vec::new())));
        let orch = orchestrator(backend, store.clone(), notifier.clone());

        let summary = orch.run_batch(10).await;

        assert_eq!(summary, BatchSummary { requested: 4, succeeded: 3, failed: 1 });
        assert_eq!(orch.backend.attempts.load(Ordering::SeqCst), 4);
        assert_eq!(orch.backend.launches.load(Ordering::SeqCst), 1);

        // Every account got its terminal status, in batch order.
        let patches = store.patches.lock().unwrap();
        assert_eq!(patches.len(), 4);
        assert_eq!(patches[0].0, "acc-1");
        assert_eq!(patches[1].1.status, AccountStatus::Failed);
        assert!(patches[1].1.notes.contains("NavigationError"));
        for i in [0usize, 2, 3] {
            assert_eq!(patches[i].1.status, AccountStatus::Verified);
            assert!(patches[i].1.notes.starts_with("location:"));
        }
    }

    #[tokio::test]
    async fn zero_eligible_accounts_allocates_no_engine() {
        let backend = MockBackend::new();
        let store = Arc::new(MockStore::with_accounts(0));
        let notifier = Arc::new(RecordingNotifier(Mutex::new(Vec::new())));
        let orch = orchestrator(backend, store, notifier);

        let summary = orch.run_batch(10).await;

        assert_eq!(summary, BatchSummary::default());
        assert_eq!(orch.backend.launches.load(Ordering::SeqCst), 0);
        assert_eq!(orch.backend.attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn store_listing_failure_is_absorbed() {
        let backend = MockBackend::new();
        let mut store = MockStore::with_accounts(3);
        store.fail_list = true;
        let notifier = Arc::new(RecordingNotifier(Mutex::new(Vec::new())));
        let orch = orchestrator(backend, Arc::new(store), notifier);

        let summary = orch.run_batch(10).await;

        assert_eq!(summary, BatchSummary::default());
        assert_eq!(orch.backend.launches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn engine_launch_failure_ends_the_batch_with_a_notification() {
        let mut backend = MockBackend::new();
        backend.fail_launch = true;
        let store = Arc::new(MockStore::with_accounts(2));
        let notifier = Arc::new(RecordingNotifier(Mutex::new(Vec::new())));
        let orch = orchestrator(backend, store.clone(), notifier.clone());

        let summary = orch.run_batch(10).await;

        assert_eq!(summary, BatchSummary { requested: 2, succeeded: 0, failed: 0 });
        assert_eq!(orch.backend.attempts.load(Ordering::SeqCst), 0);
        assert!(store.patches.lock().unwrap().is_empty());
        let messages = notifier.0.lock().unwrap();
        assert!(messages.iter().any(|m| m.contains("crashed")));
    }

    #[tokio::test]
    async fn batch_honors_the_store_limit() {
        let backend = MockBackend::new();
        let store = Arc::new(MockStore::with_accounts(8));
        let notifier = Arc::new(RecordingNotifier(Mutex::new(Vec::new())));
        let orch = orchestrator(backend, store, notifier);

        let summary = orch.run_batch(3).await;

        assert_eq!(summary, BatchSummary { requested: 3, succeeded: 3, failed: 0 });
        assert_eq!(orch.backend.attempts.load(Ordering::SeqCst), 3);
    }
}
