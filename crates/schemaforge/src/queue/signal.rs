//! Per-job completion signals.
//!
//! One `watch` channel per job id that someone is waiting on. Workers
//! publish the terminal status after the durable write, so a waiter that
//! subscribes before reading the record can never miss the transition.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::watch;

use super::job::JobStatus;

#[derive(Default)]
pub struct CompletionSignals {
    channels: Mutex<HashMap<String, watch::Sender<Option<JobStatus>>>>,
}

impl CompletionSignals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to the terminal status of `job_id`.
    pub fn subscribe(&self, job_id: &str) -> watch::Receiver<Option<JobStatus>> {
        let mut channels = self
            .channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        channels
            .entry(job_id.to_string())
            .or_insert_with(|| watch::channel(None).0)
            .subscribe()
    }

    /// Publishes a terminal status and drops the channel. Receivers keep
    /// observing the last value after the sender is gone.
    pub fn notify(&self, job_id: &str, status: JobStatus) {
        let sender = {
            let mut channels = self
                .channels
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            channels.remove(job_id)
        };
        if let Some(sender) = sender {
            sender.send_replace(Some(status));
        }
    }

    /// Drops the channel for `job_id` once no receiver is left.
    pub fn unsubscribe(&self, job_id: &str) {
        let mut channels = self
            .channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if channels
            .get(job_id)
            .is_some_and(|sender| sender.receiver_count() == 0)
        {
            channels.remove(job_id);
        }
    }

    pub fn forget(&self, job_id: &str) {
        let mut channels = self
            .channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        channels.remove(job_id);
    }

    /// Number of jobs currently being waited on.
    pub fn len(&self) -> usize {
        self.channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
