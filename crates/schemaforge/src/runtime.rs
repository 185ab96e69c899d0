//! Wires the pipeline together for one process.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::{validate_config, Config};
use crate::error::{Result, WorkerError};
use crate::generator::Generator;
use crate::ingress::Ingress;
use crate::queue::JobQueue;
use crate::retrieval::RetrievalService;
use crate::storage::ArtifactStore;
use crate::sweeper::Sweeper;
use crate::worker::{JobRunner, WorkerPool};

/// A running pipeline: queue, workers, sweeper and the request-side
/// services built on them.
pub struct Runtime {
    config: Config,
    queue: Arc<JobQueue>,
    store: ArtifactStore,
    ingress: Arc<Ingress>,
    retrieval: Arc<RetrievalService>,
    pool: WorkerPool,
    sweeper_cancel: CancellationToken,
    sweeper: JoinHandle<()>,
}

impl Runtime {
    /// Opens the queue, recovers jobs interrupted by a previous run and
    /// starts workers plus the sweeper.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(config: Config, generator: Arc<dyn Generator>) -> Result<Self> {
        validate_config(&config)?;

        let store = ArtifactStore::new(config.uploads_dir(), config.output_dir(), config.archive_dir());
        store.ensure_roots()?;

        let queue = Arc::new(JobQueue::open(
            &config.queue_database_path(),
            config.queue_settings(),
        )?);
        queue.recover_on_startup()?;

        let runner = Arc::new(JobRunner::new(Arc::clone(&queue), store.clone(), generator));
        let pool = WorkerPool::start(runner, config.worker_count)?;

        let sweeper = Arc::new(Sweeper::new(
            Arc::clone(&queue),
            store.clone(),
            config.artifact_ttl(),
            config.sweep_interval(),
        ));
        let sweeper_cancel = CancellationToken::new();
        let sweeper = sweeper.spawn(sweeper_cancel.clone());

        let ingress = Arc::new(Ingress::new(
            Arc::clone(&queue),
            store.clone(),
            &config.accepted_extensions,
        ));
        let retrieval = Arc::new(RetrievalService::new(
            Arc::clone(&queue),
            store.clone(),
            config.max_download_wait(),
        ));

        info!(
            workers = config.worker_count,
            data_dir = %config.data_dir().display(),
            "Pipeline started"
        );

        Ok(Self {
            config,
            queue,
            store,
            ingress,
            retrieval,
            pool,
            sweeper_cancel,
            sweeper,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn ingress(&self) -> &Arc<Ingress> {
        &self.ingress
    }

    pub fn retrieval(&self) -> &Arc<RetrievalService> {
        &self.retrieval
    }

    /// Stops the sweeper, lets workers finish their current job and closes
    /// the queue.
    pub async fn shutdown(self) -> Result<()> {
        self.sweeper_cancel.cancel();
        if let Err(e) = self.sweeper.await {
            error!(error = %e, "Sweeper task failed");
        }

        self.pool.shutdown();
        let pool = self.pool;
        tokio::task::spawn_blocking(move || pool.wait())
            .await
            .map_err(|e| WorkerError::Join(e.to_string()))?;

        self.queue.close()?;
        info!("Pipeline stopped");
        Ok(())
    }
}
