//! Periodic reconciliation behind a single-writer lease
//!
//! Every instance runs the ticker, but only the holder of
//! [`RECONCILIATION_LEASE`] reconciles. The lease outlives two intervals so
//! a healthy holder keeps it by renewing on each tick.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Reconciler, ReconciliationReport};
use crate::domain::SYSTEM_SCHEDULER_ACTOR;
use crate::infra::{LeaseStore, Result, ShutdownCoordinator, ShutdownSignal};

pub const RECONCILIATION_LEASE: &str = "reconciliation";

pub struct ReconciliationScheduler {
    reconciler: Arc<Reconciler>,
    leases: Arc<dyn LeaseStore>,
    holder: String,
    interval: Duration,
    latest: RwLock<Option<ReconciliationReport>>,
}

impl ReconciliationScheduler {
    pub fn new(reconciler: Arc<Reconciler>, leases: Arc<dyn LeaseStore>, interval: Duration) -> Self {
        Self {
            reconciler,
            leases,
            holder: format!("booking-ingest-{}", Uuid::new_v4().simple()),
            interval,
            latest: RwLock::new(None),
        }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub async fn latest(&self) -> Option<ReconciliationReport> {
        self.latest.read().await.clone()
    }

    /// Run on demand for `actor`, outside the lease
    pub async fn run_now(&self, actor: &str) -> Result<ReconciliationReport> {
        let report = self.reconciler.run(actor).await?;
        *self.latest.write().await = Some(report.clone());
        Ok(report)
    }

    /// Reconcile if this instance holds (or can take) the lease
    pub async fn tick(&self) -> Result<Option<ReconciliationReport>> {
        let ttl = self.interval.saturating_mul(2);
        if !self
            .leases
            .try_acquire(RECONCILIATION_LEASE, &self.holder, ttl)
            .await?
        {
            debug!(holder = %self.holder, "Reconciliation lease held elsewhere");
            return Ok(None);
        }
        self.run_now(SYSTEM_SCHEDULER_ACTOR).await.map(Some)
    }

    pub async fn start(self: Arc<Self>, shutdown: &ShutdownCoordinator) {
        let scheduler = self.clone();
        let signal = shutdown.signal();
        let handle = tokio::spawn(async move { scheduler.run_loop(signal).await });
        shutdown.track("reconciliation-scheduler", handle).await;
        info!(
            interval_secs = self.interval.as_secs(),
            holder = %self.holder,
            "Reconciliation scheduler started"
        );
    }

    async fn run_loop(&self, signal: ShutdownSignal) {
        loop {
            tokio::select! {
                _ = signal.wait() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
            if let Err(e) = self.tick().await {
                warn!(error = %e, "Scheduled reconciliation failed");
            }
        }

        if let Err(e) = self.leases.release(RECONCILIATION_LEASE, &self.holder).await {
            warn!(error = %e, "Failed to release reconciliation lease");
        }
    }
}
