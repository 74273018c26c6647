//! Cadence scheduler: periodically enqueues analysis jobs for projects whose
//! scan is due, deduplicating against in-flight and freshly completed runs.
//!
//! The dedup here is a courtesy to avoid obvious duplicates; the runner's
//! store-level claim remains the real at-most-one-run guarantee, since
//! manual, webhook, and scheduled triggers race independently.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::errors::StoreError;
use crate::models::{ProjectScanConfig, ScanCadence, TriggerSource};
use crate::service::JobService;
use crate::store::JobStore;

/// Tally of one due-scan sweep.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct SweepSummary {
    pub triggered: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct ScanScheduler {
    store: Arc<dyn JobStore>,
    jobs: Arc<JobService>,
    tick: Duration,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ScanScheduler {
    pub fn new(store: Arc<dyn JobStore>, jobs: Arc<JobService>, tick: Duration) -> Self {
        Self {
            store,
            jobs,
            tick,
            shutdown: Mutex::new(None),
            handle: Mutex::new(None),
        }
    }

    /// Start the periodic sweep task. Idempotent: a second start while
    /// running is a no-op.
    pub async fn start(self: &Arc<Self>) {
        let mut shutdown = self.shutdown.lock().await;
        if shutdown.is_some() {
            return;
        }
        let (tx, mut rx) = watch::channel(false);
        *shutdown = Some(tx);

        let scheduler = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(scheduler.tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        for cadence in [ScanCadence::Daily, ScanCadence::Weekly] {
                            if let Err(e) = scheduler.run_due(cadence).await {
                                error!(cadence = %cadence, error = %e, "due-scan sweep failed");
                            }
                        }
                    }
                    _ = rx.changed() => break,
                }
            }
        });
        *self.handle.lock().await = Some(handle);
        info!(tick_secs = self.tick.as_secs(), "scan scheduler started");
    }

    pub async fn stop(&self) {
        if let Some(tx) = self.shutdown.lock().await.take() {
            let _ = tx.send(true);
        }
        if let Some(handle) = self.handle.lock().await.take() {
            let _ = handle.await;
        }
        info!("scan scheduler stopped");
    }

    /// Enqueue a job for every project of the given cadence that is due.
    /// One project's failure never blocks the rest. Also serves as the
    /// privileged manual trigger entry point.
    pub async fn run_due(&self, cadence: ScanCadence) -> Result<SweepSummary, StoreError> {
        let configs = self.store.scan_configs_by_cadence(cadence).await?;
        let mut summary = SweepSummary::default();
        for config in configs {
            match self.consider(&config, cadence).await {
                Ok(true) => summary.triggered += 1,
                Ok(false) => summary.skipped += 1,
                Err(e) => {
                    warn!(project = %config.project_id, error = %e, "scheduled enqueue failed; continuing");
                    summary.failed += 1;
                }
            }
        }
        info!(
            cadence = %cadence,
            triggered = summary.triggered,
            skipped = summary.skipped,
            failed = summary.failed,
            "due-scan sweep finished"
        );
        Ok(summary)
    }

    async fn consider(
        &self,
        config: &ProjectScanConfig,
        cadence: ScanCadence,
    ) -> Result<bool, anyhow::Error> {
        if self
            .store
            .find_active_job(&config.project_id)
            .await?
            .is_some()
        {
            debug!(project = %config.project_id, "scan already in flight; skipping");
            return Ok(false);
        }

        if let Some(window) = cadence.freshness_window()
            && let Some(last) = self.store.latest_completed_job(&config.project_id).await?
            && let Some(completed_at) = last.completed_at
            && Utc::now() - completed_at < window
        {
            debug!(project = %config.project_id, "recent completed scan inside freshness window; skipping");
            return Ok(false);
        }

        self.jobs
            .start_job(
                &config.project_id,
                Some("latest"),
                TriggerSource::Scheduled,
                None,
                None,
            )
            .await?;
        self.store
            .touch_last_scan(&config.project_id, Utc::now())
            .await?;
        Ok(true)
    }
}
