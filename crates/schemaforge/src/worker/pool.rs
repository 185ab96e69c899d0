use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info};

use crate::error::WorkerError;
use crate::worker::runner::JobRunner;

/// Fixed set of worker threads pulling from the job queue.
///
/// Each worker processes one job at a time. Idle workers block on the
/// queue's wake-up channel and re-poll at least every `poll_interval`.
pub struct WorkerPool {
    workers: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl WorkerPool {
    pub fn start(runner: Arc<JobRunner>, worker_count: usize) -> Result<Self, WorkerError> {
        if worker_count == 0 {
            return Err(WorkerError::SpawnFailed(
                "worker_count must be > 0".to_string(),
            ));
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let poll_interval = runner.queue().settings().poll_interval;
        let instance = std::process::id();

        let mut pool = Self {
            workers: Vec::with_capacity(worker_count),
            shutdown,
        };

        for index in 0..worker_count {
            let worker_id = format!("{}-w{}", instance, index);
            let worker_runner = Arc::clone(&runner);
            let shutdown_flag = Arc::clone(&pool.shutdown);

            let spawned = thread::Builder::new()
                .name(format!("schemaforge-worker-{}", index))
                .spawn(move || run_worker(worker_id, worker_runner, shutdown_flag, poll_interval));

            match spawned {
                Ok(handle) => pool.workers.push(handle),
                Err(e) => {
                    pool.shutdown();
                    pool.wait();
                    return Err(WorkerError::SpawnFailed(e.to_string()));
                }
            }
        }

        info!("Started {} workers", worker_count);
        Ok(pool)
    }

    /// Asks workers to stop after their current job.
    pub fn shutdown(&self) {
        info!("Shutting down worker pool...");
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Joins all workers. Call after [`WorkerPool::shutdown`].
    pub fn wait(self) {
        for (i, worker) in self.workers.into_iter().enumerate() {
            if let Err(e) = worker.join() {
                error!("Worker {} panicked: {:?}", i, e);
            } else {
                debug!("Worker {} finished", i);
            }
        }

        info!("All workers have stopped");
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }
}

fn run_worker(
    worker_id: String,
    runner: Arc<JobRunner>,
    shutdown: Arc<AtomicBool>,
    poll_interval: Duration,
) {
    debug!("Worker {} started", worker_id);
    let queue = Arc::clone(runner.queue());

    loop {
        if shutdown.load(Ordering::Relaxed) {
            debug!("Worker {} received shutdown signal", worker_id);
            break;
        }

        match queue.dequeue(&worker_id) {
            Ok(Some(delivery)) => {
                let outcome = runner.process(delivery);
                debug!("Worker {} finished job: {:?}", worker_id, outcome);
            }
            Ok(None) => {
                if queue.is_closed() {
                    debug!("Worker {} queue closed", worker_id);
                    break;
                }
                queue.wait_for_work(poll_interval);
            }
            Err(e) => {
                error!("Worker {} failed to dequeue: {}", worker_id, e);
                thread::sleep(poll_interval);
            }
        }
    }

    debug!("Worker {} stopped", worker_id);
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::time::Instant;

    use super::*;
    use crate::error::GenerationError;
    use crate::queue::{Job, JobQueue, JobStatus, QueueSettings};
    use crate::storage::ArtifactStore;
    use tempfile::TempDir;

    fn setup(temp: &TempDir) -> (Arc<JobQueue>, ArtifactStore) {
        let store = ArtifactStore::new(
            temp.path().join("uploads"),
            temp.path().join("output"),
            temp.path().join("archives"),
        );
        store.ensure_roots().unwrap();
        let queue = Arc::new(
            JobQueue::in_memory(QueueSettings {
                max_attempts: 3,
                lease_timeout: Duration::from_secs(60),
                poll_interval: Duration::from_millis(20),
            })
            .unwrap(),
        );
        (queue, store)
    }

    fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        done()
    }

    #[test]
    fn test_worker_pool_creation() {
        let temp = TempDir::new().unwrap();
        let (queue, store) = setup(&temp);
        let generator = |_: &Path, _: &Path| -> Result<(), GenerationError> { Ok(()) };
        let runner = Arc::new(JobRunner::new(queue, store, Arc::new(generator)));

        let pool = WorkerPool::start(runner, 2).unwrap();
        assert_eq!(pool.worker_count(), 2);
        assert!(!pool.is_shutdown());

        pool.shutdown();
        assert!(pool.is_shutdown());

        pool.wait();
    }

    #[test]
    fn test_zero_workers_is_rejected() {
        let temp = TempDir::new().unwrap();
        let (queue, store) = setup(&temp);
        let generator = |_: &Path, _: &Path| -> Result<(), GenerationError> { Ok(()) };
        let runner = Arc::new(JobRunner::new(queue, store, Arc::new(generator)));

        assert!(matches!(
            WorkerPool::start(runner, 0),
            Err(WorkerError::SpawnFailed(_))
        ));
    }

    #[test]
    fn test_pool_drains_submitted_jobs() {
        let temp = TempDir::new().unwrap();
        let (queue, store) = setup(&temp);
        let generator = |_: &Path, output: &Path| -> Result<(), GenerationError> {
            std::fs::write(output.join("out.ts"), "export {}")
                .map_err(|e| GenerationError::new(e.to_string()))
        };
        let runner = Arc::new(JobRunner::new(
            Arc::clone(&queue),
            store.clone(),
            Arc::new(generator),
        ));
        let pool = WorkerPool::start(runner, 2).unwrap();

        let ids: Vec<String> = (0..5)
            .map(|_| {
                let input = store.store_upload("schema.prisma", b"model A {}").unwrap();
                let id = Job::new_id();
                let job = Job::new(&id, "schema.prisma", input, store.output_dir_for(&id));
                queue.enqueue(&job).unwrap()
            })
            .collect();

        let all_done = wait_until(Duration::from_secs(10), || {
            ids.iter()
                .all(|id| queue.status(id).unwrap() == JobStatus::Completed)
        });
        assert!(all_done, "jobs did not complete: {:?}", queue.counts().unwrap());

        pool.shutdown();
        pool.wait();

        for id in &ids {
            assert!(store.archive_path_for(id, 1).exists());
        }
    }
}
