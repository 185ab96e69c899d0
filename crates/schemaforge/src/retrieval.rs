//! Single-use artifact retrieval.
//!
//! A COMPLETED job's archive is handed out exactly once: the job flips to
//! CONSUMED before the file is opened, and the file is deleted as soon as
//! the [`ArtifactDownload`] is dropped. The stored schema goes with it; the
//! CONSUMED record stays behind until the sweeper expires it.

use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::RetrievalError;
use crate::queue::{Completion, Job, JobQueue, JobStatus};
use crate::storage::ArtifactStore;

/// Stored when a completed job's archive has vanished from disk.
pub const ARTIFACT_MISSING: &str = "artifact missing";

const UNKNOWN_FAILURE: &str = "generation failed";

#[derive(Debug)]
pub enum Retrieval {
    Ready(ArtifactDownload),
    /// Still queued or running.
    Pending,
    NotFound,
    /// The artifact was already downloaded.
    Consumed,
    /// The job failed; carries the stored error description.
    Failed(String),
}

/// An open archive being handed to one client.
///
/// The file on disk is removed when this value is dropped, whether the
/// transfer finished or was aborted.
#[derive(Debug)]
pub struct ArtifactDownload {
    job_id: String,
    path: PathBuf,
    file: Option<File>,
    len: u64,
}

impl ArtifactDownload {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Name offered to the client, `<job-id>.zip`.
    pub fn filename(&self) -> String {
        format!("{}.zip", self.job_id)
    }

    /// Takes the open file handle, e.g. to hand it to an async runtime.
    /// The artifact is still deleted when `self` is dropped.
    pub fn take_file(&mut self) -> Option<File> {
        self.file.take()
    }
}

impl Read for ArtifactDownload {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self.file.as_mut() {
            Some(file) => file.read(buf),
            None => Ok(0),
        }
    }
}

impl Drop for ArtifactDownload {
    fn drop(&mut self) {
        drop(self.file.take());
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(job_id = %self.job_id, "Artifact deleted after download"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(job_id = %self.job_id, error = %e, "Failed to delete artifact"),
        }
    }
}

pub struct RetrievalService {
    queue: Arc<JobQueue>,
    store: ArtifactStore,
    max_wait: Duration,
}

impl RetrievalService {
    pub fn new(queue: Arc<JobQueue>, store: ArtifactStore, max_wait: Duration) -> Self {
        Self {
            queue,
            store,
            max_wait,
        }
    }

    pub fn max_wait(&self) -> Duration {
        self.max_wait
    }

    /// Resolves a job id to its artifact or outcome.
    ///
    /// Waits up to `wait` (capped at the configured maximum) for an
    /// unfinished job before answering `Pending`.
    pub async fn retrieve(&self, job_id: &str, wait: Duration) -> Result<Retrieval, RetrievalError> {
        let wait = wait.min(self.max_wait);

        let job = match self.queue.await_completion(job_id, wait).await? {
            Completion::NotFound => return Ok(Retrieval::NotFound),
            Completion::Pending => return Ok(Retrieval::Pending),
            Completion::Terminal(job) => job,
        };

        let queue = Arc::clone(&self.queue);
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || claim(&queue, &store, job))
            .await
            .map_err(|e| RetrievalError::Task(e.to_string()))?
    }
}

/// Turns a terminal job into a retrieval result, consuming a COMPLETED one.
pub fn claim(queue: &JobQueue, store: &ArtifactStore, job: Job) -> Result<Retrieval, RetrievalError> {
    match job.status {
        JobStatus::Failed => Ok(Retrieval::Failed(
            job.error.unwrap_or_else(|| UNKNOWN_FAILURE.to_string()),
        )),
        JobStatus::Consumed => Ok(Retrieval::Consumed),
        JobStatus::Queued | JobStatus::Active => Ok(Retrieval::Pending),
        JobStatus::Completed => {
            if !queue.consume(&job.id)? {
                // Lost the race against another download or a sweep.
                return Ok(match queue.get(&job.id)? {
                    None => Retrieval::NotFound,
                    Some(current) if current.status == JobStatus::Failed => Retrieval::Failed(
                        current.error.unwrap_or_else(|| UNKNOWN_FAILURE.to_string()),
                    ),
                    Some(_) => Retrieval::Consumed,
                });
            }
            open_artifact(queue, store, job)
        }
    }
}

fn open_artifact(queue: &JobQueue, store: &ArtifactStore, job: Job) -> Result<Retrieval, RetrievalError> {
    let Some(path) = job.archive_path else {
        queue.fail_completed(&job.id, ARTIFACT_MISSING)?;
        return Ok(Retrieval::Failed(ARTIFACT_MISSING.to_string()));
    };

    let opened = File::open(&path).and_then(|file| {
        let len = file.metadata()?.len();
        Ok((file, len))
    });

    match opened {
        Ok((file, len)) => {
            if let Err(e) = store.remove_file(&job.input_path) {
                warn!(job_id = %job.id, error = %e, "Failed to remove consumed input");
            }
            info!(job_id = %job.id, bytes = len, "Artifact handed out");
            Ok(Retrieval::Ready(ArtifactDownload {
                job_id: job.id,
                path,
                file: Some(file),
                len,
            }))
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {
            warn!(job_id = %job.id, "Completed job has no artifact on disk");
            queue.fail_completed(&job.id, ARTIFACT_MISSING)?;
            Ok(Retrieval::Failed(ARTIFACT_MISSING.to_string()))
        }
        Err(e) => {
            queue.fail_completed(&job.id, &format!("artifact unreadable: {}", e))?;
            Err(RetrievalError::OpenArtifact { path, source: e })
        }
    }
}
