use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::generator::DEFAULT_PROGRAM;
use crate::queue::QueueSettings;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Root for everything the service stores. Defaults to the platform
    /// data directory.
    #[serde(default)]
    pub data_directory: Option<PathBuf>,
    #[serde(default)]
    pub uploads_directory: Option<PathBuf>,
    #[serde(default)]
    pub output_directory: Option<PathBuf>,
    #[serde(default)]
    pub archive_directory: Option<PathBuf>,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default = "default_accepted_extensions")]
    pub accepted_extensions: Vec<String>,
    /// How long terminal jobs and their files are kept.
    #[serde(default = "default_artifact_ttl_secs")]
    pub artifact_ttl_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Upper bound on how long a download request may wait for its job.
    #[serde(default = "default_max_download_wait_secs")]
    pub max_download_wait_secs: u64,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
    #[serde(default)]
    pub generator: GeneratorConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueConfig {
    /// SQLite file backing the queue. Defaults to `<data>/queue.db`.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_lease_timeout_secs")]
    pub lease_timeout_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratorConfig {
    #[serde(default = "default_generator_program")]
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

fn default_worker_count() -> usize {
    1
}

fn default_accepted_extensions() -> Vec<String> {
    vec!["prisma".to_string(), "schema".to_string()]
}

fn default_artifact_ttl_secs() -> u64 {
    3600
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_max_download_wait_secs() -> u64 {
    30
}

fn default_max_upload_bytes() -> usize {
    5 * 1024 * 1024
}

fn default_max_attempts() -> u32 {
    3
}

fn default_lease_timeout_secs() -> u64 {
    600
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_generator_program() -> String {
    DEFAULT_PROGRAM.to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_directory: None,
            uploads_directory: None,
            output_directory: None,
            archive_directory: None,
            queue: QueueConfig::default(),
            worker_count: default_worker_count(),
            accepted_extensions: default_accepted_extensions(),
            artifact_ttl_secs: default_artifact_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            max_download_wait_secs: default_max_download_wait_secs(),
            max_upload_bytes: default_max_upload_bytes(),
            generator: GeneratorConfig::default(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            max_attempts: default_max_attempts(),
            lease_timeout_secs: default_lease_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            program: default_generator_program(),
            args: Vec::new(),
        }
    }
}

impl Config {
    /// The effective data directory.
    pub fn data_dir(&self) -> PathBuf {
        self.data_directory
            .clone()
            .or_else(crate::db::default_data_directory)
            .unwrap_or_else(|| PathBuf::from("schemaforge-data"))
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.uploads_directory
            .clone()
            .unwrap_or_else(|| self.data_dir().join("uploads"))
    }

    pub fn output_dir(&self) -> PathBuf {
        self.output_directory
            .clone()
            .unwrap_or_else(|| self.data_dir().join("output"))
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.archive_directory
            .clone()
            .unwrap_or_else(|| self.data_dir().join("archives"))
    }

    pub fn queue_database_path(&self) -> PathBuf {
        self.queue
            .database_path
            .clone()
            .unwrap_or_else(|| self.data_dir().join("queue.db"))
    }

    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            max_attempts: self.queue.max_attempts,
            lease_timeout: Duration::from_secs(self.queue.lease_timeout_secs),
            poll_interval: Duration::from_millis(self.queue.poll_interval_ms),
        }
    }

    pub fn artifact_ttl(&self) -> Duration {
        Duration::from_secs(self.artifact_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn max_download_wait(&self) -> Duration {
        Duration::from_secs(self.max_download_wait_secs)
    }
}
