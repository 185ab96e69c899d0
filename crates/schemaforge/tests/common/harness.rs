//! Test harness for isolated pipeline runs.
//!
//! `TestHarness` owns a temporary data directory and a started
//! [`Runtime`] whose queue database, uploads, outputs and archives all
//! live inside it.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use schemaforge::config::Config;
use schemaforge::{Generator, IngressError, Job, JobStatus, Retrieval, Runtime};

pub struct TestHarness {
    temp: TempDir,
    runtime: Option<Runtime>,
}

impl TestHarness {
    /// Starts a runtime with test-friendly timings.
    pub fn start(generator: Arc<dyn Generator>) -> Self {
        Self::start_with(generator, |_| {})
    }

    /// Like [`TestHarness::start`], letting the caller adjust the config.
    pub fn start_with(generator: Arc<dyn Generator>, customize: impl FnOnce(&mut Config)) -> Self {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let config = Self::config_for(temp.path(), customize);
        let runtime = Runtime::start(config, generator).expect("Failed to start runtime");
        Self {
            temp,
            runtime: Some(runtime),
        }
    }

    /// Starts a runtime on an existing data directory, e.g. to simulate a
    /// restart.
    pub fn restart_in(
        temp: TempDir,
        generator: Arc<dyn Generator>,
        customize: impl FnOnce(&mut Config),
    ) -> Self {
        let config = Self::config_for(temp.path(), customize);
        let runtime = Runtime::start(config, generator).expect("Failed to start runtime");
        Self {
            temp,
            runtime: Some(runtime),
        }
    }

    pub fn config_for(data_dir: &Path, customize: impl FnOnce(&mut Config)) -> Config {
        let mut config = Config {
            data_directory: Some(data_dir.to_path_buf()),
            worker_count: 2,
            max_download_wait_secs: 10,
            ..Config::default()
        };
        config.queue.poll_interval_ms = 25;
        config.queue.lease_timeout_secs = 30;
        customize(&mut config);
        config
    }

    pub fn runtime(&self) -> &Runtime {
        self.runtime.as_ref().expect("runtime already stopped")
    }

    pub fn data_dir(&self) -> &Path {
        self.temp.path()
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.runtime().config().uploads_dir()
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.runtime().config().archive_dir()
    }

    pub fn submit(&self, filename: &str, content: &str) -> Result<String, IngressError> {
        self.runtime()
            .ingress()
            .submit(Some(filename), content.as_bytes())
    }

    pub fn job(&self, id: &str) -> Option<Job> {
        self.runtime().queue().get(id).expect("queue read failed")
    }

    /// Polls until the job is terminal or `timeout` elapses.
    pub async fn wait_terminal(&self, id: &str, timeout: Duration) -> Job {
        let start = Instant::now();
        loop {
            let job = self.job(id).expect("job disappeared");
            if job.status.is_terminal() {
                return job;
            }
            assert!(
                start.elapsed() < timeout,
                "job {} still {} after {:?}",
                id,
                job.status,
                timeout
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub async fn retrieve(&self, id: &str, wait: Duration) -> Retrieval {
        self.runtime()
            .retrieval()
            .retrieve(id, wait)
            .await
            .expect("retrieval failed")
    }

    pub fn count_files(dir: &Path) -> usize {
        std::fs::read_dir(dir)
            .map(|entries| entries.filter_map(Result::ok).count())
            .unwrap_or(0)
    }

    pub fn status(&self, id: &str) -> Option<JobStatus> {
        self.job(id).map(|job| job.status)
    }

    /// Stops the runtime and hands back the data directory.
    pub async fn shutdown(mut self) -> TempDir {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown().await.expect("shutdown failed");
        }
        self.temp
    }
}
