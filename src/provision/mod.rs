//! Account provisioning engine
//!
//! Waiter, state machine, and orchestrator; `run_batch` is the entry point
//! the HTTP boundary spawns.

mod backend;
pub mod locations;
mod machine;
mod orchestrator;

pub use backend::ChromeBackend;
pub use locations::Location;
pub use machine::{
    address_confirms, run_attempt, AttemptContext, LinkWaiter, ProvisionError, ProvisionStage,
    ProvisioningResult, SignupSession,
};
pub use orchestrator::{BatchSummary, Orchestrator, PacingConfig, ProvisionBackend};

use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::warn;

use crate::AppState;
use crate::notify::Notifier;
use crate::store::AccountStore;

/// Run one batch against the app's configured collaborators.
///
/// Single logical worker: a request arriving while a batch is running was
/// already acknowledged at the HTTP boundary, so it is skipped here with a
/// notification rather than interleaving attempts on the shared mailbox.
pub async fn run_batch(state: Arc<AppState>, count: usize) -> BatchSummary {
    if state
        .batch_running
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        warn!("Batch request skipped: another batch is still running");
        state
            .notifier
            .send("Provisioning batch skipped: another batch is still running")
            .await;
        return BatchSummary::default();
    }

    let config = state.config.read().await.clone();
    let notifier: Arc<dyn Notifier> = state.notifier.clone();
    let store: Arc<dyn AccountStore> = state.store.clone();

    let backend = ChromeBackend::from_config(&config, notifier.clone());
    let orchestrator = Orchestrator::new(
        backend,
        store,
        notifier,
        PacingConfig {
            min_ms: config.pacing_min_ms,
            max_ms: config.pacing_max_ms,
        },
        &config.site_domain,
    );

    let summary = orchestrator.run_batch(count).await;
    state.batch_running.store(false, Ordering::SeqCst);
    summary
}
