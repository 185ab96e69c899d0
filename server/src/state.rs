use std::sync::Arc;

use schemaforge::{Ingress, JobQueue, RetrievalService, Runtime};

/// Shared application state available to all handlers via `State<AppState>`.
#[derive(Clone)]
pub struct AppState {
    pub ingress: Arc<Ingress>,
    pub retrieval: Arc<RetrievalService>,
    pub queue: Arc<JobQueue>,
    /// Largest accepted upload, in bytes.
    pub max_upload_bytes: usize,
}

impl AppState {
    pub fn from_runtime(runtime: &Runtime) -> Self {
        Self {
            ingress: Arc::clone(runtime.ingress()),
            retrieval: Arc::clone(runtime.retrieval()),
            queue: Arc::clone(runtime.queue()),
            max_upload_bytes: runtime.config().max_upload_bytes,
        }
    }
}
