//! Periodic re-publication of merged events whose emission failed.
//!
//! A completed instance whose publish failed stays `Pending` in the store,
//! and one whose publisher died stays `Publishing` until its claim lease
//! runs out. The sweeper lists both and calls
//! [`FanInBarrier::retry_emission`] for each. That call claims the emission
//! with a compare-and-set before publishing, so a live claim (the completing
//! caller mid-publish, or another sweeper) is skipped rather than raced.

use crate::barrier::{EmissionRetry, FanInBarrier};
use crate::config::SweeperSettings;
use crate::coordinator::Coordinator;
use fanin_core::instance_store::{InstanceStore, InstanceStoreError};
use fanin_core::WorkflowType;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

/// Counts from one sweep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Instances whose merged event was published.
    pub emitted: usize,
    /// Instances whose publish failed again.
    pub failed: usize,
    /// Instances with no registered workflow, a live claim held elsewhere,
    /// or nothing left to do.
    pub skipped: usize,
}

/// Re-publishes pending merged events on an interval.
pub struct EmissionSweeper {
    store: Arc<dyn InstanceStore>,
    barriers: HashMap<WorkflowType, FanInBarrier>,
    settings: SweeperSettings,
}

impl EmissionSweeper {
    /// Create a sweeper over `barriers`.
    #[must_use]
    pub fn new(
        store: Arc<dyn InstanceStore>,
        barriers: impl IntoIterator<Item = FanInBarrier>,
        settings: SweeperSettings,
    ) -> Self {
        let barriers = barriers
            .into_iter()
            .map(|barrier| (barrier.definition().workflow_type().clone(), barrier))
            .collect();
        Self {
            store,
            barriers,
            settings,
        }
    }

    /// Create a sweeper over every barrier registered with `coordinator`.
    #[must_use]
    pub fn for_coordinator(
        coordinator: &Coordinator,
        store: Arc<dyn InstanceStore>,
        settings: SweeperSettings,
    ) -> Self {
        Self::new(store, coordinator.barriers().iter().cloned(), settings)
    }

    /// Retry emission for up to `batch_size` pending instances.
    ///
    /// Individual publish failures are counted, not returned.
    ///
    /// # Errors
    ///
    /// Returns the store error if pending instances cannot be listed.
    pub async fn sweep_once(&self) -> Result<SweepReport, InstanceStoreError> {
        let pending = self
            .store
            .list_pending_emission(self.settings.batch_size)
            .await?;

        let mut report = SweepReport::default();
        for instance in pending {
            let Some(barrier) = self.barriers.get(instance.workflow_type()) else {
                tracing::warn!(
                    key = %instance.key,
                    "Pending emission for unregistered workflow"
                );
                report.skipped += 1;
                continue;
            };

            match barrier.retry_emission(instance.correlation_id()).await {
                Ok(EmissionRetry::Emitted) => report.emitted += 1,
                Ok(EmissionRetry::NothingToDo) => report.skipped += 1,
                Err(err) => {
                    tracing::warn!(key = %instance.key, error = %err, "Emission retry failed");
                    report.failed += 1;
                }
            }
        }

        if report != SweepReport::default() {
            tracing::info!(
                emitted = report.emitted,
                failed = report.failed,
                skipped = report.skipped,
                "Emission sweep finished"
            );
        }
        Ok(report)
    }

    /// Sweep every `interval_secs` until `shutdown` flips to `true`.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.settings.interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    let stop = changed.is_err() || *shutdown.borrow();
                    if stop {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.sweep_once().await {
                        tracing::warn!(error = %err, "Emission sweep could not list pending instances");
                    }
                }
            }
        }
        tracing::info!("Emission sweeper stopped");
    }
}
