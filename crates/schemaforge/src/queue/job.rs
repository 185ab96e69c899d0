use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::job_repo::{
    self, JobRow, STATUS_ACTIVE, STATUS_COMPLETED, STATUS_CONSUMED, STATUS_FAILED, STATUS_QUEUED,
};
use crate::db::DatabaseError;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Active,
    Completed,
    Failed,
    /// Completed, and the artifact has already been handed out.
    Consumed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => STATUS_QUEUED,
            JobStatus::Active => STATUS_ACTIVE,
            JobStatus::Completed => STATUS_COMPLETED,
            JobStatus::Failed => STATUS_FAILED,
            JobStatus::Consumed => STATUS_CONSUMED,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            STATUS_QUEUED => Some(JobStatus::Queued),
            STATUS_ACTIVE => Some(JobStatus::Active),
            STATUS_COMPLETED => Some(JobStatus::Completed),
            STATUS_FAILED => Some(JobStatus::Failed),
            STATUS_CONSUMED => Some(JobStatus::Consumed),
            _ => None,
        }
    }

    /// Returns true once no worker will touch the job again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Consumed
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One request to turn an uploaded schema into a generated bundle.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: String,
    /// File name the client uploaded; becomes the archive entry name.
    pub original_name: String,
    pub input_path: PathBuf,
    /// Exclusive to this job; nothing else ever writes here.
    pub output_dir: PathBuf,
    pub status: JobStatus,
    pub attempt: u32,
    pub archive_path: Option<PathBuf>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub terminal_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Creates a queued job that has not been attempted yet.
    pub fn new(
        id: impl Into<String>,
        original_name: impl Into<String>,
        input_path: PathBuf,
        output_dir: PathBuf,
    ) -> Self {
        Self {
            id: id.into(),
            original_name: original_name.into(),
            input_path,
            output_dir,
            status: JobStatus::Queued,
            attempt: 0,
            archive_path: None,
            error: None,
            created_at: Utc::now(),
            terminal_at: None,
        }
    }

    /// Generates a fresh job id.
    pub fn new_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    pub(crate) fn to_row(&self) -> JobRow {
        let created_at = job_repo::format_timestamp(self.created_at);
        JobRow {
            id: self.id.clone(),
            original_name: self.original_name.clone(),
            input_path: self.input_path.to_string_lossy().into_owned(),
            output_dir: self.output_dir.to_string_lossy().into_owned(),
            status: self.status.as_str().to_string(),
            attempt: self.attempt,
            archive_path: self
                .archive_path
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
            error: self.error.clone(),
            worker_id: None,
            lease_expires_at: None,
            updated_at: created_at.clone(),
            created_at,
            terminal_at: self.terminal_at.map(job_repo::format_timestamp),
        }
    }
}

fn parse_timestamp(s: &str, id: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DatabaseError::CorruptRow {
            id: id.to_string(),
            reason: format!("bad timestamp '{}': {}", s, e),
        })
}

impl TryFrom<JobRow> for Job {
    type Error = DatabaseError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status = JobStatus::parse(&row.status).ok_or_else(|| DatabaseError::CorruptRow {
            id: row.id.clone(),
            reason: format!("unknown status '{}'", row.status),
        })?;
        let created_at = parse_timestamp(&row.created_at, &row.id)?;
        let terminal_at = row
            .terminal_at
            .as_deref()
            .map(|s| parse_timestamp(s, &row.id))
            .transpose()?;

        Ok(Self {
            id: row.id,
            original_name: row.original_name,
            input_path: PathBuf::from(row.input_path),
            output_dir: PathBuf::from(row.output_dir),
            status,
            attempt: row.attempt,
            archive_path: row.archive_path.map(PathBuf::from),
            error: row.error,
            created_at,
            terminal_at,
        })
    }
}

/// A job handed to one worker. The attempt number fences every
/// acknowledgement against later redeliveries of the same job.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub job: Job,
    pub worker_id: String,
}

impl Delivery {
    pub fn job_id(&self) -> &str {
        &self.job.id
    }

    pub fn attempt(&self) -> u32 {
        self.job.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            JobStatus::Queued,
            JobStatus::Active,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Consumed,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("superseded"), None);
    }

    #[test]
    fn test_terminal_states() {
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Active.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Consumed.is_terminal());
    }

    #[test]
    fn test_job_row_conversion() {
        let job = Job::new(
            "j1",
            "schema.prisma",
            PathBuf::from("/uploads/1-schema.prisma"),
            PathBuf::from("/output/j1"),
        );
        let row = job.to_row();
        assert_eq!(row.status, "queued");
        assert_eq!(row.created_at, row.updated_at);

        let back = Job::try_from(row).unwrap();
        assert_eq!(back.id, "j1");
        assert_eq!(back.output_dir, PathBuf::from("/output/j1"));
        // Stored timestamps carry millisecond precision only.
        assert_eq!(
            back.created_at.timestamp_millis(),
            job.created_at.timestamp_millis()
        );
    }

    #[test]
    fn test_corrupt_status_is_reported() {
        let mut row = Job::new("j2", "a.prisma", PathBuf::new(), PathBuf::new()).to_row();
        row.status = "exploded".to_string();
        let err = Job::try_from(row).unwrap_err();
        assert!(matches!(err, DatabaseError::CorruptRow { .. }));
    }

    #[test]
    fn test_new_ids_are_unique() {
        assert_ne!(Job::new_id(), Job::new_id());
    }
}
