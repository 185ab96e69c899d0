//! Durable job queue.
//!
//! The queue is the only coordination point between the request path and
//! the workers. Jobs live in SQLite so they survive a restart; delivery is
//! at-least-once, guarded by leases and attempt fencing.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, Sender};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::db::job_repo::{self, Outcome};
use crate::db::Database;
use crate::error::QueueError;

pub mod job;
pub mod signal;

pub use job::{Delivery, Job, JobStatus};
pub use job_repo::Released;
pub use signal::CompletionSignals;

/// Error stored on a job whose redeliveries ran out.
pub const EXHAUSTED_ERROR: &str = "exceeded maximum attempts";

const WAKE_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// Processing attempts before a crashing job is failed.
    pub max_attempts: u32,
    /// How long a delivery may go without a heartbeat before it is redelivered.
    pub lease_timeout: Duration,
    /// Upper bound on how long waiters go without re-reading the database.
    pub poll_interval: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            lease_timeout: Duration::from_secs(600),
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// Result of waiting on a job.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    /// The job reached a terminal state.
    Terminal(Job),
    /// Still queued or running when the wait ended.
    Pending,
    NotFound,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub queued: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub consumed: u64,
}

/// Handle to the durable queue. Constructed once and shared via `Arc`.
pub struct JobQueue {
    db: Database,
    settings: QueueSettings,
    signals: CompletionSignals,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
    closed: AtomicBool,
}

impl JobQueue {
    pub fn new(db: Database, settings: QueueSettings) -> Self {
        let (wake_tx, wake_rx) = bounded(WAKE_CAPACITY);
        Self {
            db,
            settings,
            signals: CompletionSignals::new(),
            wake_tx,
            wake_rx,
            closed: AtomicBool::new(false),
        }
    }

    /// Opens the queue database at `path`, creating it if needed.
    pub fn open(path: &Path, settings: QueueSettings) -> Result<Self, QueueError> {
        let db = Database::open(path)?;
        Ok(Self::new(db, settings))
    }

    pub fn in_memory(settings: QueueSettings) -> Result<Self, QueueError> {
        let db = Database::open_in_memory()?;
        Ok(Self::new(db, settings))
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    /// Persists a new job in the QUEUED state and wakes one idle worker.
    pub fn enqueue(&self, job: &Job) -> Result<String, QueueError> {
        if self.is_closed() {
            return Err(QueueError::Closed);
        }

        let mut row = job.to_row();
        row.status = JobStatus::Queued.as_str().to_string();
        row.attempt = 0;
        job_repo::insert(&self.db, &row)?;

        debug!(job_id = %job.id, "Job enqueued");
        self.wake();
        Ok(job.id.clone())
    }

    /// Claims the oldest queued job for `worker_id`.
    pub fn dequeue(&self, worker_id: &str) -> Result<Option<Delivery>, QueueError> {
        if self.is_closed() {
            return Ok(None);
        }

        let now = Utc::now();
        let row = job_repo::claim_next(
            &self.db,
            worker_id,
            &job_repo::format_timestamp(now),
            &job_repo::format_timestamp(self.lease_deadline(now)),
        )?;

        match row {
            Some(row) => {
                let job = Job::try_from(row)?;
                debug!(job_id = %job.id, worker_id, attempt = job.attempt, "Job claimed");
                Ok(Some(Delivery {
                    job,
                    worker_id: worker_id.to_string(),
                }))
            }
            None => Ok(None),
        }
    }

    /// Blocks until an enqueue signals new work or `timeout` elapses.
    pub fn wait_for_work(&self, timeout: Duration) -> bool {
        self.wake_rx.recv_timeout(timeout).is_ok()
    }

    pub fn get(&self, job_id: &str) -> Result<Option<Job>, QueueError> {
        job_repo::find_by_id(&self.db, job_id)?
            .map(Job::try_from)
            .transpose()
            .map_err(QueueError::from)
    }

    pub fn status(&self, job_id: &str) -> Result<JobStatus, QueueError> {
        self.get(job_id)?
            .map(|job| job.status)
            .ok_or_else(|| QueueError::NotFound(job_id.to_string()))
    }

    /// Waits up to `timeout` for the job to reach a terminal state.
    ///
    /// Woken by the in-process completion signal; the durable record is
    /// re-read every poll interval so completions made by another process
    /// sharing the database are observed too.
    pub async fn await_completion(
        &self,
        job_id: &str,
        timeout: Duration,
    ) -> Result<Completion, QueueError> {
        let mut rx = self.signals.subscribe(job_id);
        let outcome = self.wait_terminal(job_id, &mut rx, timeout).await;
        drop(rx);
        self.signals.unsubscribe(job_id);
        outcome
    }

    async fn wait_terminal(
        &self,
        job_id: &str,
        rx: &mut tokio::sync::watch::Receiver<Option<JobStatus>>,
        timeout: Duration,
    ) -> Result<Completion, QueueError> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            match self.get(job_id)? {
                None => return Ok(Completion::NotFound),
                Some(job) if job.status.is_terminal() => return Ok(Completion::Terminal(job)),
                Some(_) => {}
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(Completion::Pending);
            }
            let recheck = (now + self.settings.poll_interval).min(deadline);

            let signalled = tokio::select! {
                changed = rx.wait_for(Option::is_some) => changed.is_ok(),
                _ = tokio::time::sleep_until(recheck) => true,
            };
            if !signalled {
                // Channel dropped without a value; fall back to polling.
                tokio::time::sleep_until(recheck).await;
            }
        }
    }

    /// Extends the lease of a running delivery. Returns `false` once the
    /// delivery has been superseded.
    pub fn renew_lease(&self, delivery: &Delivery) -> Result<bool, QueueError> {
        let now = Utc::now();
        let renewed = job_repo::renew_lease(
            &self.db,
            delivery.job_id(),
            delivery.attempt(),
            &job_repo::format_timestamp(self.lease_deadline(now)),
            &job_repo::format_timestamp(now),
        )?;
        Ok(renewed)
    }

    /// Marks a delivery COMPLETED with the archive that now holds its output.
    pub fn complete(&self, delivery: &Delivery, archive_path: &Path) -> Result<(), QueueError> {
        let archive = archive_path.to_string_lossy();
        self.finish(
            delivery,
            Outcome::Completed {
                archive_path: &archive,
            },
            JobStatus::Completed,
        )
    }

    /// Marks a delivery FAILED. Failures recorded here are never retried.
    pub fn fail(&self, delivery: &Delivery, error: &str) -> Result<(), QueueError> {
        self.finish(delivery, Outcome::Failed { error }, JobStatus::Failed)
    }

    fn finish(
        &self,
        delivery: &Delivery,
        outcome: Outcome<'_>,
        status: JobStatus,
    ) -> Result<(), QueueError> {
        let now = job_repo::format_timestamp(Utc::now());
        let finished = job_repo::finish(
            &self.db,
            delivery.job_id(),
            delivery.attempt(),
            outcome,
            &now,
        )?;
        if !finished {
            return Err(QueueError::StaleDelivery {
                job_id: delivery.job_id().to_string(),
                attempt: delivery.attempt(),
            });
        }

        info!(job_id = %delivery.job_id(), attempt = delivery.attempt(), %status, "Job finished");
        self.signals.notify(delivery.job_id(), status);
        Ok(())
    }

    /// Hands a crashed delivery back for another attempt, or fails it when
    /// the attempt ceiling is reached.
    pub fn release(&self, delivery: &Delivery, reason: &str) -> Result<JobStatus, QueueError> {
        let now = job_repo::format_timestamp(Utc::now());
        let released = job_repo::release(
            &self.db,
            delivery.job_id(),
            delivery.attempt(),
            self.settings.max_attempts,
            EXHAUSTED_ERROR,
            &now,
        )?;

        match released.and_then(JobStatus::parse) {
            Some(JobStatus::Failed) => {
                warn!(job_id = %delivery.job_id(), attempt = delivery.attempt(), reason, "Job exhausted its attempts");
                self.signals.notify(delivery.job_id(), JobStatus::Failed);
                Ok(JobStatus::Failed)
            }
            Some(status) => {
                warn!(job_id = %delivery.job_id(), attempt = delivery.attempt(), reason, "Job released for redelivery");
                self.wake();
                Ok(status)
            }
            None => Err(QueueError::StaleDelivery {
                job_id: delivery.job_id().to_string(),
                attempt: delivery.attempt(),
            }),
        }
    }

    /// Redelivers every ACTIVE job whose lease expired before `now`.
    pub fn redeliver_expired(&self, now: DateTime<Utc>) -> Result<Released, QueueError> {
        let cutoff = job_repo::format_timestamp(now);
        self.release_stale(Some(&cutoff), now)
    }

    /// Releases every ACTIVE job left over from a previous process.
    pub fn recover_on_startup(&self) -> Result<Released, QueueError> {
        let released = self.release_stale(None, Utc::now())?;
        if !released.requeued.is_empty() || !released.failed.is_empty() {
            info!(
                requeued = released.requeued.len(),
                failed = released.failed.len(),
                "Recovered interrupted jobs"
            );
        }
        Ok(released)
    }

    fn release_stale(
        &self,
        cutoff: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Released, QueueError> {
        let released = job_repo::release_stale(
            &self.db,
            cutoff,
            self.settings.max_attempts,
            EXHAUSTED_ERROR,
            &job_repo::format_timestamp(now),
        )?;

        for id in &released.failed {
            warn!(job_id = %id, "Job exhausted its attempts");
            self.signals.notify(id, JobStatus::Failed);
        }
        for id in &released.requeued {
            warn!(job_id = %id, "Job lease expired, redelivering");
            self.wake();
        }
        Ok(released)
    }

    /// Claims the artifact of a COMPLETED job. Exactly one caller gets `true`.
    pub fn consume(&self, job_id: &str) -> Result<bool, QueueError> {
        let now = job_repo::format_timestamp(Utc::now());
        Ok(job_repo::consume(&self.db, job_id, &now)?)
    }

    /// Fails a job whose artifact is gone from disk.
    pub fn fail_completed(&self, job_id: &str, error: &str) -> Result<bool, QueueError> {
        let now = job_repo::format_timestamp(Utc::now());
        Ok(job_repo::fail_completed(&self.db, job_id, error, &now)?)
    }

    /// Terminal jobs that reached their terminal state before `cutoff`.
    pub fn expired_terminal(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>, QueueError> {
        let rows = job_repo::terminal_before(&self.db, &job_repo::format_timestamp(cutoff))?;
        rows.into_iter()
            .map(|row| Job::try_from(row).map_err(QueueError::from))
            .collect()
    }

    /// Deletes the job record.
    pub fn remove(&self, job_id: &str) -> Result<bool, QueueError> {
        let removed = job_repo::delete(&self.db, job_id)?;
        self.signals.forget(job_id);
        Ok(removed)
    }

    pub fn counts(&self) -> Result<QueueCounts, QueueError> {
        let count = |status: JobStatus| job_repo::count_by_status(&self.db, status.as_str());
        Ok(QueueCounts {
            queued: count(JobStatus::Queued)?,
            active: count(JobStatus::Active)?,
            completed: count(JobStatus::Completed)?,
            failed: count(JobStatus::Failed)?,
            consumed: count(JobStatus::Consumed)?,
        })
    }

    /// Stops handing out work and checkpoints the database.
    ///
    /// Call after the worker pool has drained.
    pub fn close(&self) -> Result<(), QueueError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.db.close()?;
        info!("Job queue closed");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn wake(&self) {
        // A full channel already guarantees a wake-up.
        let _ = self.wake_tx.try_send(());
    }

    fn lease_deadline(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let lease = chrono::Duration::from_std(self.settings.lease_timeout)
            .unwrap_or_else(|_| chrono::Duration::days(1));
        now + lease
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;

    use super::*;

    fn test_queue(max_attempts: u32) -> JobQueue {
        JobQueue::in_memory(QueueSettings {
            max_attempts,
            lease_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(20),
        })
        .unwrap()
    }

    fn new_job(id: &str) -> Job {
        Job::new(
            id,
            "schema.prisma",
            PathBuf::from(format!("/uploads/{}-schema.prisma", id)),
            PathBuf::from(format!("/output/{}", id)),
        )
    }

    #[test]
    fn test_enqueue_then_dequeue_in_submission_order() {
        let queue = test_queue(3);
        queue.enqueue(&new_job("a")).unwrap();
        queue.enqueue(&new_job("b")).unwrap();

        assert_eq!(queue.status("a").unwrap(), JobStatus::Queued);

        let first = queue.dequeue("w0").unwrap().unwrap();
        let second = queue.dequeue("w0").unwrap().unwrap();
        assert_eq!(first.job_id(), "a");
        assert_eq!(second.job_id(), "b");
        assert_eq!(first.attempt(), 1);
        assert_eq!(queue.status("a").unwrap(), JobStatus::Active);
        assert!(queue.dequeue("w0").unwrap().is_none());
    }

    #[test]
    fn test_status_of_unknown_job() {
        let queue = test_queue(3);
        assert!(matches!(
            queue.status("missing"),
            Err(QueueError::NotFound(id)) if id == "missing"
        ));
    }

    #[test]
    fn test_enqueue_wakes_a_worker() {
        let queue = test_queue(3);
        assert!(!queue.wait_for_work(Duration::from_millis(10)));
        queue.enqueue(&new_job("a")).unwrap();
        assert!(queue.wait_for_work(Duration::from_millis(10)));
    }

    #[test]
    fn test_complete_and_fail_are_fenced() {
        let queue = test_queue(3);
        queue.enqueue(&new_job("a")).unwrap();
        let delivery = queue.dequeue("w0").unwrap().unwrap();

        queue
            .complete(&delivery, Path::new("/archives/a.zip"))
            .unwrap();
        let job = queue.get("a").unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.archive_path, Some(PathBuf::from("/archives/a.zip")));
        assert!(job.terminal_at.is_some());

        let late = queue.fail(&delivery, "too late");
        assert!(matches!(late, Err(QueueError::StaleDelivery { .. })));
        assert_eq!(queue.status("a").unwrap(), JobStatus::Completed);
    }

    #[test]
    fn test_release_redelivers_until_ceiling() {
        let queue = test_queue(2);
        queue.enqueue(&new_job("crashy")).unwrap();

        let first = queue.dequeue("w0").unwrap().unwrap();
        assert_eq!(queue.release(&first, "panic").unwrap(), JobStatus::Queued);

        let second = queue.dequeue("w0").unwrap().unwrap();
        assert_eq!(second.attempt(), 2);
        assert_eq!(queue.release(&second, "panic").unwrap(), JobStatus::Failed);

        let job = queue.get("crashy").unwrap().unwrap();
        assert_eq!(job.error.as_deref(), Some(EXHAUSTED_ERROR));

        // The first delivery is long superseded.
        assert!(matches!(
            queue.release(&first, "again"),
            Err(QueueError::StaleDelivery { .. })
        ));
    }

    #[test]
    fn test_redeliver_expired_leases() {
        let queue = test_queue(3);
        queue.enqueue(&new_job("a")).unwrap();
        let delivery = queue.dequeue("w0").unwrap().unwrap();

        let released = queue.redeliver_expired(Utc::now()).unwrap();
        assert!(released.requeued.is_empty());

        let later = Utc::now() + chrono::Duration::seconds(120);
        let released = queue.redeliver_expired(later).unwrap();
        assert_eq!(released.requeued, vec!["a".to_string()]);

        // The expired worker can no longer acknowledge.
        assert!(!queue.renew_lease(&delivery).unwrap());
        assert!(queue
            .complete(&delivery, Path::new("/archives/a.zip"))
            .is_err());

        let again = queue.dequeue("w1").unwrap().unwrap();
        assert_eq!(again.attempt(), 2);
        assert!(queue.renew_lease(&again).unwrap());
    }

    #[test]
    fn test_recover_on_startup_releases_active_jobs() {
        let queue = test_queue(1);
        queue.enqueue(&new_job("a")).unwrap();
        queue.enqueue(&new_job("b")).unwrap();
        queue.dequeue("w0").unwrap().unwrap();

        let released = queue.recover_on_startup().unwrap();
        assert_eq!(released.failed, vec!["a".to_string()]);
        assert!(released.requeued.is_empty());
        assert_eq!(queue.status("b").unwrap(), JobStatus::Queued);
    }

    #[test]
    fn test_consume_expire_and_remove() {
        let queue = test_queue(3);
        queue.enqueue(&new_job("a")).unwrap();
        let delivery = queue.dequeue("w0").unwrap().unwrap();
        queue
            .complete(&delivery, Path::new("/archives/a.zip"))
            .unwrap();

        assert!(queue.consume("a").unwrap());
        assert!(!queue.consume("a").unwrap());
        assert_eq!(queue.status("a").unwrap(), JobStatus::Consumed);

        let later = Utc::now() + chrono::Duration::seconds(5);
        let expired = queue.expired_terminal(later).unwrap();
        assert_eq!(expired.len(), 1);
        assert!(queue.remove("a").unwrap());
        assert!(queue.get("a").unwrap().is_none());
    }

    #[test]
    fn test_fail_completed_marks_missing_artifact() {
        let queue = test_queue(3);
        queue.enqueue(&new_job("a")).unwrap();
        let delivery = queue.dequeue("w0").unwrap().unwrap();
        queue
            .complete(&delivery, Path::new("/archives/a.zip"))
            .unwrap();

        assert!(queue.fail_completed("a", "artifact missing").unwrap());
        let job = queue.get("a").unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("artifact missing"));
        assert!(job.archive_path.is_none());
    }

    #[test]
    fn test_counts() {
        let queue = test_queue(3);
        queue.enqueue(&new_job("a")).unwrap();
        queue.enqueue(&new_job("b")).unwrap();
        let delivery = queue.dequeue("w0").unwrap().unwrap();
        queue.fail(&delivery, "bad schema").unwrap();

        let counts = queue.counts().unwrap();
        assert_eq!(counts.queued, 1);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.active, 0);
    }

    #[test]
    fn test_closed_queue_rejects_work() {
        let queue = test_queue(3);
        queue.enqueue(&new_job("a")).unwrap();
        queue.close().unwrap();

        assert!(queue.dequeue("w0").unwrap().is_none());
        assert!(matches!(
            queue.enqueue(&new_job("b")),
            Err(QueueError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_await_completion_not_found() {
        let queue = test_queue(3);
        let result = queue
            .await_completion("ghost", Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(result, Completion::NotFound);
    }

    #[tokio::test]
    async fn test_await_completion_times_out_as_pending() {
        let queue = test_queue(3);
        queue.enqueue(&new_job("slow")).unwrap();
        let result = queue
            .await_completion("slow", Duration::from_millis(60))
            .await
            .unwrap();
        assert_eq!(result, Completion::Pending);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_await_completion_wakes_on_finish() {
        let queue = Arc::new(test_queue(3));
        queue.enqueue(&new_job("a")).unwrap();
        let delivery = queue.dequeue("w0").unwrap().unwrap();

        let finisher = Arc::clone(&queue);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            finisher.fail(&delivery, "generator exploded").unwrap();
        });

        let result = queue
            .await_completion("a", Duration::from_secs(5))
            .await
            .unwrap();
        handle.join().unwrap();

        match result {
            Completion::Terminal(job) => {
                assert_eq!(job.status, JobStatus::Failed);
                assert_eq!(job.error.as_deref(), Some("generator exploded"));
            }
            other => panic!("expected terminal job, got {:?}", other),
        }
    }
}
