use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError};
use tracing::{debug, error, info, info_span, warn};

use crate::archive::Archiver;
use crate::error::{GenerationError, QueueError};
use crate::generator::Generator;
use crate::queue::{Delivery, JobQueue, JobStatus};
use crate::sanitize::{redact_path, sanitize_file_name};
use crate::storage::ArtifactStore;

/// What happened to one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed(PathBuf),
    Failed(String),
    /// The attempt crashed and the job went back to the queue.
    Requeued,
    /// The attempt crashed on its last allowed try.
    Exhausted,
    /// Nothing was recorded: a newer delivery took over, or the queue was
    /// unreachable and the lease will run out instead.
    Superseded,
}

/// Drives one delivery from ACTIVE to a terminal state.
pub struct JobRunner {
    queue: Arc<JobQueue>,
    store: ArtifactStore,
    archiver: Archiver,
    generator: Arc<dyn Generator>,
}

impl JobRunner {
    pub fn new(queue: Arc<JobQueue>, store: ArtifactStore, generator: Arc<dyn Generator>) -> Self {
        Self {
            archiver: Archiver::new(store.clone()),
            queue,
            store,
            generator,
        }
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn process(&self, delivery: Delivery) -> JobOutcome {
        let job = &delivery.job;
        let _span = info_span!(
            "job",
            job_id = %job.id,
            attempt = job.attempt,
            worker_id = %delivery.worker_id,
            input = %redact_path(&job.input_path)
        )
        .entered();

        info!("Processing job");

        let output_dir = self.store.attempt_output_dir(&job.output_dir, job.attempt);
        if let Err(e) = self.store.prepare_output_dir(&output_dir) {
            return self.record_failure(&delivery, &format!("failed to prepare output: {}", e));
        }

        let attempt = self.with_heartbeat(&delivery, || self.run_attempt(&delivery, &output_dir));
        self.discard_output(&delivery, &output_dir);

        match attempt {
            Err(panic_message) => {
                error!(panic = %panic_message, "Generation panicked");
                self.record_crash(&delivery, &format!("generator panicked: {}", panic_message))
            }
            Ok(Err(e)) if e.is_crash() => {
                error!(error = %e.message, "Generator crashed");
                self.record_crash(&delivery, &e.message)
            }
            Ok(Err(e)) => self.record_failure(&delivery, &e.message),
            Ok(Ok(archive_path)) => self.record_success(&delivery, archive_path),
        }
    }

    /// Runs the generator and the archiver. A panic anywhere in here is
    /// returned as `Err` with the panic message.
    fn run_attempt(
        &self,
        delivery: &Delivery,
        output_dir: &Path,
    ) -> Result<Result<PathBuf, GenerationError>, String> {
        let job = &delivery.job;

        panic::catch_unwind(AssertUnwindSafe(|| {
            {
                let _step = info_span!("generate").entered();
                self.generator.generate(&job.input_path, output_dir)?;
            }

            let entry_name = sanitize_file_name(&job.original_name);
            self.archiver
                .archive(&job.id, job.attempt, &job.input_path, &entry_name, output_dir)
                .map_err(|e| GenerationError::new(format!("failed to archive output: {}", e)))
        }))
        .map_err(panic_message)
    }

    /// Runs `f` while a scoped thread renews the delivery's lease every third
    /// of the lease timeout.
    fn with_heartbeat<T>(&self, delivery: &Delivery, f: impl FnOnce() -> T) -> T {
        let interval = heartbeat_interval(self.queue.settings().lease_timeout);
        let (stop_tx, stop_rx) = bounded::<()>(0);

        thread::scope(|scope| {
            scope.spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => match self.queue.renew_lease(delivery) {
                        Ok(true) => debug!(job_id = %delivery.job_id(), "Lease renewed"),
                        Ok(false) => {
                            warn!(job_id = %delivery.job_id(), "Lease lost to a newer delivery");
                            break;
                        }
                        Err(e) => warn!(job_id = %delivery.job_id(), error = %e, "Failed to renew lease"),
                    },
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            });

            let result = f();
            drop(stop_tx);
            result
        })
    }

    fn record_failure(&self, delivery: &Delivery, message: &str) -> JobOutcome {
        warn!(error = %message, "Job failed");
        match self.queue.fail(delivery, message) {
            Ok(()) => JobOutcome::Failed(message.to_string()),
            Err(e) => self.acknowledge_error(e),
        }
    }

    /// Records a finished archive, unless a newer delivery owns the job by
    /// now. A superseded attempt removes its own archive again.
    fn record_success(&self, delivery: &Delivery, archive_path: PathBuf) -> JobOutcome {
        let recorded = match self.queue.renew_lease(delivery) {
            Ok(true) => self.queue.complete(delivery, &archive_path),
            Ok(false) => Err(QueueError::StaleDelivery {
                job_id: delivery.job_id().to_string(),
                attempt: delivery.attempt(),
            }),
            Err(e) => Err(e),
        };

        match recorded {
            Ok(()) => {
                info!(archive = %redact_path(&archive_path), "Job completed");
                JobOutcome::Completed(archive_path)
            }
            Err(e) => {
                if let Err(cleanup) = self.store.remove_file(&archive_path) {
                    warn!(error = %cleanup, "Failed to remove unrecorded archive");
                }
                self.acknowledge_error(e)
            }
        }
    }

    fn record_crash(&self, delivery: &Delivery, reason: &str) -> JobOutcome {
        match self.queue.release(delivery, reason) {
            Ok(JobStatus::Failed) => JobOutcome::Exhausted,
            Ok(_) => JobOutcome::Requeued,
            Err(e) => self.acknowledge_error(e),
        }
    }

    fn acknowledge_error(&self, e: QueueError) -> JobOutcome {
        match e {
            QueueError::StaleDelivery { .. } => {
                warn!(error = %e, "Result discarded");
                JobOutcome::Superseded
            }
            other => {
                // The lease will expire and the sweeper redelivers the job.
                error!(error = %other, "Failed to record job result");
                JobOutcome::Superseded
            }
        }
    }

    /// Removes this attempt's output, and the job's output directory once
    /// no attempt is using it.
    fn discard_output(&self, delivery: &Delivery, output_dir: &Path) {
        let cleaned = self
            .store
            .remove_dir(output_dir)
            .and_then(|_| self.store.remove_dir_if_empty(&delivery.job.output_dir));
        if let Err(e) = cleaned {
            warn!(error = %e, "Failed to remove generated output");
        }
    }
}

fn heartbeat_interval(lease_timeout: Duration) -> Duration {
    (lease_timeout / 3).max(Duration::from_millis(10))
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
