//! Periodic queue maintenance.
//!
//! Each pass redelivers jobs whose worker stopped heartbeating, then
//! deletes terminal jobs (and their files) older than the artifact TTL.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::QueueError;
use crate::queue::JobQueue;
use crate::storage::ArtifactStore;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub requeued: usize,
    pub failed: usize,
    pub removed: usize,
}

pub struct Sweeper {
    queue: Arc<JobQueue>,
    store: ArtifactStore,
    ttl: Duration,
    interval: Duration,
}

impl Sweeper {
    pub fn new(queue: Arc<JobQueue>, store: ArtifactStore, ttl: Duration, interval: Duration) -> Self {
        Self {
            queue,
            store,
            ttl,
            interval,
        }
    }

    /// Runs one maintenance pass as of `now`.
    pub fn sweep_once(&self, now: DateTime<Utc>) -> Result<SweepReport, QueueError> {
        let released = self.queue.redeliver_expired(now)?;
        let mut report = SweepReport {
            requeued: released.requeued.len(),
            failed: released.failed.len(),
            removed: 0,
        };

        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::days(1));
        for job in self.queue.expired_terminal(now - ttl)? {
            let removed = self.store.remove_job_files(
                &job.id,
                job.attempt,
                &job.input_path,
                &job.output_dir,
                job.archive_path.as_deref(),
            );
            if let Err(e) = removed {
                // Keep the record so the next pass retries.
                warn!(job_id = %job.id, error = %e, "Failed to remove job files");
                continue;
            }
            if self.queue.remove(&job.id)? {
                debug!(job_id = %job.id, status = %job.status, "Expired job removed");
                report.removed += 1;
            }
        }

        Ok(report)
    }

    /// Runs passes every `interval` until `cancel` fires.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                ttl_secs = self.ttl.as_secs(),
                interval_secs = self.interval.as_secs(),
                "Sweeper started"
            );

            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Sweeper stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        let sweeper = Arc::clone(&self);
                        match tokio::task::spawn_blocking(move || sweeper.sweep_once(Utc::now())).await {
                            Ok(Ok(report)) => {
                                if report != SweepReport::default() {
                                    info!(
                                        requeued = report.requeued,
                                        failed = report.failed,
                                        removed = report.removed,
                                        "Sweep finished"
                                    );
                                } else {
                                    debug!("Sweep found nothing to do");
                                }
                            }
                            Ok(Err(e)) => error!(error = %e, "Sweep failed"),
                            Err(e) => error!(error = %e, "Sweep task panicked"),
                        }
                    }
                }
            }
        })
    }
}
