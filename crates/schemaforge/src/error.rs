use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SchemaforgeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Archive error: {0}")]
    Archive(#[from] ArchiveError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Submission rejected: {0}")]
    Ingress(#[from] IngressError),

    #[error("Retrieval failed: {0}")]
    Retrieval(#[from] RetrievalError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Failed to parse config YAML: {0}")]
    ParseYaml(#[from] serde_yaml::Error),

    #[error("Invalid value for environment variable '{name}': {value}")]
    InvalidEnv { name: String, value: String },

    #[error("Config validation failed: {message}")]
    Validation { message: String },
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Failed to create directory '{path}': {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write file '{path}': {source}")]
    WriteFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to remove '{path}': {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Path '{path}' escapes storage root '{root}'")]
    OutsideRoot { path: PathBuf, root: PathBuf },

    #[error("Could not find a free file name for '{0}'")]
    NameExhausted(String),
}

/// Failure while bundling a generated tree. Never retried.
#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Failed to read '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write archive '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Zip encoding failed: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Failed to walk generated output: {0}")]
    Walk(#[from] walkdir::Error),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// How a generation attempt went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationErrorKind {
    /// The collaborator reported the failure itself. Never retried.
    Reported,
    /// The collaborator died without reporting anything (e.g. killed by a
    /// signal). Treated like a worker crash and redelivered.
    Crashed,
}

/// Failure of a generation collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct GenerationError {
    pub message: String,
    pub kind: GenerationErrorKind,
}

impl GenerationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: GenerationErrorKind::Reported,
        }
    }

    pub fn crashed(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: GenerationErrorKind::Crashed,
        }
    }

    pub fn is_crash(&self) -> bool {
        self.kind == GenerationErrorKind::Crashed
    }
}

/// Queue/broker failures. Surfaced loudly to submitters.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Queue storage unavailable: {0}")]
    Unavailable(#[from] crate::db::DatabaseError),

    #[error("Job '{0}' not found")]
    NotFound(String),

    #[error("Delivery of job '{job_id}' (attempt {attempt}) is no longer current")]
    StaleDelivery { job_id: String, attempt: u32 },

    #[error("Queue is closed")]
    Closed,
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Failed to spawn worker: {0}")]
    SpawnFailed(String),

    #[error("Worker pool failed to stop: {0}")]
    Join(String),
}

#[derive(Error, Debug)]
pub enum IngressError {
    #[error("No file uploaded")]
    MissingFile,

    #[error("Only {accepted} files are allowed, got '{filename}'")]
    UnsupportedExtension { filename: String, accepted: String },

    #[error("Failed to store upload: {0}")]
    Storage(#[from] StorageError),

    #[error("Failed to enqueue job: {0}")]
    Infrastructure(#[from] QueueError),
}

impl IngressError {
    /// Whether the submitter sent something unacceptable, as opposed to a server-side failure.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            IngressError::MissingFile | IngressError::UnsupportedExtension { .. }
        )
    }
}

#[derive(Error, Debug)]
pub enum RetrievalError {
    #[error("Failed to open artifact '{path}': {source}")]
    OpenArtifact {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("Retrieval task failed: {0}")]
    Task(String),
}

pub type Result<T> = std::result::Result<T, SchemaforgeError>;
