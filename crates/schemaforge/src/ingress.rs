//! Accepts uploaded schemas and turns them into queued jobs.

use std::sync::Arc;

use tracing::{info, warn};

use crate::error::IngressError;
use crate::queue::{Job, JobQueue};
use crate::sanitize::{file_extension, redact_path};
use crate::storage::ArtifactStore;

pub struct Ingress {
    queue: Arc<JobQueue>,
    store: ArtifactStore,
    accepted_extensions: Vec<String>,
}

impl Ingress {
    /// `accepted_extensions` are matched case-insensitively, with or
    /// without a leading dot.
    pub fn new(queue: Arc<JobQueue>, store: ArtifactStore, accepted_extensions: &[String]) -> Self {
        let accepted_extensions = accepted_extensions
            .iter()
            .map(|ext| ext.trim_start_matches('.').to_ascii_lowercase())
            .collect();
        Self {
            queue,
            store,
            accepted_extensions,
        }
    }

    pub fn accepted_extensions(&self) -> &[String] {
        &self.accepted_extensions
    }

    /// Validates and stores one upload, then enqueues a job for it.
    ///
    /// Returns the new job id as soon as the job is durably queued.
    /// Rejected uploads never touch the disk or the queue.
    pub fn submit(&self, filename: Option<&str>, content: &[u8]) -> Result<String, IngressError> {
        let filename = filename
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .ok_or(IngressError::MissingFile)?;

        self.check_extension(filename)?;

        let input_path = self.store.store_upload(filename, content)?;
        let id = Job::new_id();
        let job = Job::new(
            id.clone(),
            filename,
            input_path.clone(),
            self.store.output_dir_for(&id),
        );

        if let Err(e) = self.queue.enqueue(&job) {
            if let Err(cleanup) = self.store.remove_file(&input_path) {
                warn!(error = %cleanup, "Failed to remove upload of rejected job");
            }
            return Err(IngressError::Infrastructure(e));
        }

        info!(job_id = %id, input = %redact_path(&input_path), bytes = content.len(), "Job submitted");
        Ok(id)
    }

    fn check_extension(&self, filename: &str) -> Result<(), IngressError> {
        let accepted = file_extension(filename)
            .is_some_and(|ext| self.accepted_extensions.iter().any(|a| *a == ext));
        if accepted {
            return Ok(());
        }

        Err(IngressError::UnsupportedExtension {
            filename: filename.to_string(),
            accepted: self
                .accepted_extensions
                .iter()
                .map(|ext| format!(".{}", ext))
                .collect::<Vec<_>>()
                .join(", "),
        })
    }
}
