//! Job repository: queue operations over the `jobs` table.
//!
//! Timestamps are stored as RFC3339 strings with millisecond precision in
//! UTC (`2026-01-01T00:00:00.000Z`) so that lexicographic comparison in SQL
//! matches chronological order.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::{Database, DatabaseError};

pub const STATUS_QUEUED: &str = "queued";
pub const STATUS_ACTIVE: &str = "active";
pub const STATUS_COMPLETED: &str = "completed";
pub const STATUS_FAILED: &str = "failed";
pub const STATUS_CONSUMED: &str = "consumed";

/// Formats a timestamp the way every column in `jobs` stores it.
pub fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// A raw job row from the database.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRow {
    pub id: String,
    pub original_name: String,
    pub input_path: String,
    pub output_dir: String,
    pub status: String,
    pub attempt: u32,
    pub archive_path: Option<String>,
    pub error: Option<String>,
    pub worker_id: Option<String>,
    pub lease_expires_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub terminal_at: Option<String>,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            original_name: row.get("original_name")?,
            input_path: row.get("input_path")?,
            output_dir: row.get("output_dir")?,
            status: row.get("status")?,
            attempt: row.get("attempt")?,
            archive_path: row.get("archive_path")?,
            error: row.get("error")?,
            worker_id: row.get("worker_id")?,
            lease_expires_at: row.get("lease_expires_at")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
            terminal_at: row.get("terminal_at")?,
        })
    }
}

/// Terminal outcome written by [`finish`].
#[derive(Debug, Clone, Copy)]
pub enum Outcome<'a> {
    Completed { archive_path: &'a str },
    Failed { error: &'a str },
}

/// Inserts a new job row.
pub fn insert(db: &Database, job: &JobRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO jobs (id, original_name, input_path, output_dir, status, attempt,
             archive_path, error, worker_id, lease_expires_at, created_at, updated_at, terminal_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                job.id,
                job.original_name,
                job.input_path,
                job.output_dir,
                job.status,
                job.attempt,
                job.archive_path,
                job.error,
                job.worker_id,
                job.lease_expires_at,
                job.created_at,
                job.updated_at,
                job.terminal_at,
            ],
        )?;
        Ok(())
    })
}

/// Finds a job by its ID.
pub fn find_by_id(db: &Database, id: &str) -> Result<Option<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT * FROM jobs WHERE id = ?1",
                params![id],
                JobRow::from_row,
            )
            .optional()?;
        Ok(row)
    })
}

/// Atomically claims the oldest queued job for `worker_id`.
///
/// The job becomes active, its attempt counter is incremented and it is
/// leased until `lease_until`. Returns `None` when the queue is empty.
pub fn claim_next(
    db: &Database,
    worker_id: &str,
    now: &str,
    lease_until: &str,
) -> Result<Option<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "UPDATE jobs
                 SET status = ?1, attempt = attempt + 1, worker_id = ?2,
                     lease_expires_at = ?3, updated_at = ?4
                 WHERE seq = (SELECT seq FROM jobs WHERE status = ?5 ORDER BY seq LIMIT 1)
                 RETURNING *",
                params![STATUS_ACTIVE, worker_id, lease_until, now, STATUS_QUEUED],
                JobRow::from_row,
            )
            .optional()?;
        Ok(row)
    })
}

/// Extends the lease of an active delivery. Returns `false` if the delivery
/// is no longer current.
pub fn renew_lease(
    db: &Database,
    id: &str,
    attempt: u32,
    lease_until: &str,
    now: &str,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE jobs SET lease_expires_at = ?3, updated_at = ?4
             WHERE id = ?1 AND attempt = ?2 AND status = ?5",
            params![id, attempt, lease_until, now, STATUS_ACTIVE],
        )?;
        Ok(changed == 1)
    })
}

/// Moves an active delivery to a terminal state. Fenced on the attempt
/// number so that a stale worker cannot overwrite a newer attempt.
pub fn finish(
    db: &Database,
    id: &str,
    attempt: u32,
    outcome: Outcome<'_>,
    now: &str,
) -> Result<bool, DatabaseError> {
    let (status, archive_path, error) = match outcome {
        Outcome::Completed { archive_path } => (STATUS_COMPLETED, Some(archive_path), None),
        Outcome::Failed { error } => (STATUS_FAILED, None, Some(error)),
    };

    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE jobs
             SET status = ?3, archive_path = ?4, error = ?5, worker_id = NULL,
                 lease_expires_at = NULL, updated_at = ?6, terminal_at = ?6
             WHERE id = ?1 AND attempt = ?2 AND status = ?7",
            params![id, attempt, status, archive_path, error, now, STATUS_ACTIVE],
        )?;
        Ok(changed == 1)
    })
}

/// Returns one active delivery to the queue, or fails it when the attempt
/// ceiling has been reached. Returns the resulting status, or `None` if the
/// delivery was not current.
pub fn release(
    db: &Database,
    id: &str,
    attempt: u32,
    max_attempts: u32,
    exhausted_error: &str,
    now: &str,
) -> Result<Option<&'static str>, DatabaseError> {
    db.with_conn(|conn| {
        let failed = conn.execute(
            "UPDATE jobs
             SET status = ?4, error = ?5, worker_id = NULL, lease_expires_at = NULL,
                 updated_at = ?6, terminal_at = ?6
             WHERE id = ?1 AND attempt = ?2 AND status = ?7 AND attempt >= ?3",
            params![
                id,
                attempt,
                max_attempts,
                STATUS_FAILED,
                exhausted_error,
                now,
                STATUS_ACTIVE
            ],
        )?;
        if failed == 1 {
            return Ok(Some(STATUS_FAILED));
        }

        let requeued = conn.execute(
            "UPDATE jobs
             SET status = ?3, worker_id = NULL, lease_expires_at = NULL, updated_at = ?4
             WHERE id = ?1 AND attempt = ?2 AND status = ?5",
            params![id, attempt, STATUS_QUEUED, now, STATUS_ACTIVE],
        )?;
        Ok((requeued == 1).then_some(STATUS_QUEUED))
    })
}

/// Ids affected by [`release_stale`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Released {
    pub requeued: Vec<String>,
    pub failed: Vec<String>,
}

/// Releases every active job whose lease expired before `lease_cutoff`
/// (or every active job when `lease_cutoff` is `None`).
///
/// Jobs that already used `max_attempts` attempts are failed with
/// `exhausted_error`; the rest are queued again.
pub fn release_stale(
    db: &Database,
    lease_cutoff: Option<&str>,
    max_attempts: u32,
    exhausted_error: &str,
    now: &str,
) -> Result<Released, DatabaseError> {
    db.with_conn(|conn| {
        let mut failed_stmt = conn.prepare(
            "UPDATE jobs
             SET status = ?3, error = ?4, worker_id = NULL, lease_expires_at = NULL,
                 updated_at = ?5, terminal_at = ?5
             WHERE status = ?6 AND (?1 IS NULL OR lease_expires_at < ?1) AND attempt >= ?2
             RETURNING id",
        )?;
        let failed = failed_stmt
            .query_map(
                params![
                    lease_cutoff,
                    max_attempts,
                    STATUS_FAILED,
                    exhausted_error,
                    now,
                    STATUS_ACTIVE
                ],
                |r| r.get::<_, String>(0),
            )?
            .collect::<Result<Vec<_>, _>>()?;

        let mut requeue_stmt = conn.prepare(
            "UPDATE jobs
             SET status = ?2, worker_id = NULL, lease_expires_at = NULL, updated_at = ?3
             WHERE status = ?4 AND (?1 IS NULL OR lease_expires_at < ?1)
             RETURNING id",
        )?;
        let requeued = requeue_stmt
            .query_map(
                params![lease_cutoff, STATUS_QUEUED, now, STATUS_ACTIVE],
                |r| r.get::<_, String>(0),
            )?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Released { requeued, failed })
    })
}

/// Marks a completed job as consumed. Returns `true` for exactly one caller.
pub fn consume(db: &Database, id: &str, now: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE jobs SET status = ?2, updated_at = ?3 WHERE id = ?1 AND status = ?4",
            params![id, STATUS_CONSUMED, now, STATUS_COMPLETED],
        )?;
        Ok(changed == 1)
    })
}

/// Fails a completed job whose artifact turned out to be unusable.
pub fn fail_completed(
    db: &Database,
    id: &str,
    error: &str,
    now: &str,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE jobs SET status = ?2, error = ?3, archive_path = NULL, updated_at = ?4
             WHERE id = ?1 AND status IN (?5, ?6)",
            params![
                id,
                STATUS_FAILED,
                error,
                now,
                STATUS_COMPLETED,
                STATUS_CONSUMED
            ],
        )?;
        Ok(changed == 1)
    })
}

/// Returns terminal jobs (completed, failed, consumed) that reached their
/// terminal state before `cutoff`.
pub fn terminal_before(db: &Database, cutoff: &str) -> Result<Vec<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM jobs
             WHERE status IN (?2, ?3, ?4) AND terminal_at IS NOT NULL AND terminal_at < ?1
             ORDER BY seq",
        )?;
        let rows = stmt
            .query_map(
                params![cutoff, STATUS_COMPLETED, STATUS_FAILED, STATUS_CONSUMED],
                JobRow::from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Deletes a job row.
pub fn delete(db: &Database, id: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute("DELETE FROM jobs WHERE id = ?1", params![id])?;
        Ok(changed == 1)
    })
}

/// Counts jobs with the given status.
pub fn count_by_status(db: &Database, status: &str) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE status = ?1",
            params![status],
            |r| r.get(0),
        )?;
        Ok(count)
    })
}
