//! Asynchronous schema code-generation pipeline.
//!
//! Uploaded schemas are stored and queued durably ([`Ingress`]), picked up
//! by a bounded pool of worker threads ([`WorkerPool`]) that run a
//! [`Generator`] and zip the result ([`Archiver`]), and handed out exactly
//! once by [`RetrievalService`]. A [`Sweeper`] redelivers crashed jobs and
//! garbage-collects expired ones.

pub mod archive;
pub mod config;
pub mod db;
pub mod error;
pub mod generator;
pub mod ingress;
pub mod queue;
pub mod retrieval;
pub mod runtime;
pub mod sanitize;
pub mod storage;
pub mod sweeper;
pub mod worker;

pub use archive::Archiver;
pub use config::{load_config, Config};
pub use error::{
    ArchiveError, ConfigError, GenerationError, GenerationErrorKind, IngressError, QueueError, Result,
    RetrievalError, SchemaforgeError, StorageError, WorkerError,
};
pub use generator::{CommandGenerator, Generator};
pub use ingress::Ingress;
pub use queue::{Completion, Job, JobQueue, JobStatus, QueueCounts, QueueSettings};
pub use retrieval::{ArtifactDownload, Retrieval, RetrievalService};
pub use runtime::Runtime;
pub use storage::ArtifactStore;
pub use sweeper::Sweeper;
pub use worker::{JobOutcome, JobRunner, WorkerPool};
