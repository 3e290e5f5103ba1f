//! SQLite-backed job store.
//!
//! Owns both tables (`jobs` and `dlq`) and every state transition. Each
//! multi-step mutation runs inside a single transaction so concurrent
//! workers only ever observe fully-applied transitions.

use anyhow::Context;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};
use std::path::Path;
use std::time::Duration;
use tracing::instrument;
use uuid::Uuid;

use crate::error::QueueError;
use crate::job::{DlqEntry, Job, JobState, QueueStats};
use crate::{DateTime, Utc};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS jobs (
  id          TEXT PRIMARY KEY,
  command     TEXT NOT NULL,
  state       TEXT NOT NULL DEFAULT 'pending',
  attempts    INTEGER NOT NULL DEFAULT 0,
  max_retries INTEGER NOT NULL,
  next_run_at INTEGER NOT NULL,
  locked_at   INTEGER,
  locked_by   TEXT,
  stdout      TEXT,
  stderr      TEXT,
  last_error  TEXT,
  created_at  INTEGER NOT NULL,
  updated_at  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS dlq (
  id                  TEXT PRIMARY KEY,
  command             TEXT NOT NULL,
  attempts            INTEGER NOT NULL,
  last_error          TEXT,
  moved_at            INTEGER NOT NULL,
  original_created_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_jobs_state_nextrun ON jobs (state, next_run_at);
";

// Helper to convert SQLite INTEGER (Unix timestamp in milliseconds) to DateTime
fn timestamp_to_datetime(ts_ms: i64) -> DateTime {
    use chrono::TimeZone;
    let secs = ts_ms.div_euclid(1000);
    let nanos = (ts_ms.rem_euclid(1000) * 1_000_000) as u32;
    Utc.timestamp_opt(secs, nanos).unwrap()
}

// Helper to convert DateTime to SQLite INTEGER (Unix timestamp in milliseconds)
fn datetime_to_timestamp(dt: DateTime) -> i64 {
    dt.timestamp_millis()
}

#[derive(Debug, Clone, FromRow)]
struct JobRow {
    id: String,
    command: String,
    state: String,
    attempts: i64,
    max_retries: i64,
    next_run_at: i64,
    locked_at: Option<i64>,
    locked_by: Option<String>,
    stdout: Option<String>,
    stderr: Option<String>,
    last_error: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<JobRow> for Job {
    type Error = QueueError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let id = Uuid::parse_str(&row.id)
            .with_context(|| format!("Corrupt job id '{}'", row.id))?;
        let state: JobState = row
            .state
            .parse()
            .map_err(|e: String| QueueError::Database(anyhow::anyhow!(e)))?;

        Ok(Job {
            id,
            command: row.command,
            state,
            attempts: row.attempts as u32,
            max_retries: row.max_retries as u32,
            next_run_at: timestamp_to_datetime(row.next_run_at),
            locked_at: row.locked_at.map(timestamp_to_datetime),
            locked_by: row.locked_by,
            stdout: row.stdout,
            stderr: row.stderr,
            last_error: row.last_error,
            created_at: timestamp_to_datetime(row.created_at),
            updated_at: timestamp_to_datetime(row.updated_at),
        })
    }
}

#[derive(Debug, Clone, FromRow)]
struct DlqRow {
    id: String,
    command: String,
    attempts: i64,
    last_error: Option<String>,
    moved_at: i64,
    original_created_at: Option<i64>,
}

impl TryFrom<DlqRow> for DlqEntry {
    type Error = QueueError;

    fn try_from(row: DlqRow) -> Result<Self, Self::Error> {
        let id = Uuid::parse_str(&row.id)
            .with_context(|| format!("Corrupt dead-letter id '{}'", row.id))?;

        Ok(DlqEntry {
            id,
            command: row.command,
            attempts: row.attempts as u32,
            last_error: row.last_error,
            moved_at: timestamp_to_datetime(row.moved_at),
            original_created_at: row.original_created_at.map(timestamp_to_datetime),
        })
    }
}

/// Durable, transactional store for jobs and dead-letter entries.
///
/// Cloning is cheap; clones share the underlying connection pool.
#[derive(Clone)]
pub struct JobStore {
    pool: SqlitePool,
}

impl JobStore {
    /// Open (or create) the database at `path` and bootstrap the schema.
    ///
    /// The parent directory is created if missing. The pool is capped at
    /// one connection; SQLite serializes writers anyway and a single
    /// writer avoids `SQLITE_BUSY` churn under concurrent loops.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, QueueError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| {
                        format!("Failed to create database directory {}", parent.display())
                    })?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open database at {}", path.display()))?;

        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Open an in-memory database. Useful for tests.
    pub async fn in_memory() -> Result<Self, QueueError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory database")?;

        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Wrap an existing pool. The caller is expected to have run
    /// [`ensure_schema`](Self::ensure_schema) or an equivalent migration.
    pub fn with_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Close the underlying pool. Operations issued afterwards fail with
    /// a database error.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Create both tables and the claim-scan index if they do not exist.
    pub async fn ensure_schema(&self) -> Result<(), QueueError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .context("Failed to create schema")?;
        Ok(())
    }

    /// Submit a command as a new pending job, eligible immediately.
    #[instrument(skip_all, err, fields(max_retries))]
    pub async fn insert(&self, command: &str, max_retries: u32) -> Result<Job, QueueError> {
        let command = command.trim();
        if command.is_empty() {
            return Err(QueueError::EmptyCommand);
        }

        let id = Uuid::now_v7();
        let now = Utc::now();
        let now_ms = datetime_to_timestamp(now);

        sqlx::query(
            "INSERT INTO jobs (id, command, state, attempts, max_retries, next_run_at, created_at, updated_at)
             VALUES (?1, ?2, 'pending', 0, ?3, ?4, ?4, ?4)",
        )
        .bind(id.to_string())
        .bind(command)
        .bind(max_retries as i64)
        .bind(now_ms)
        .execute(&self.pool)
        .await
        .context("Failed to insert job")?;

        tracing::info!(job_id = %id, command, "Enqueued job");

        Ok(Job {
            id,
            command: command.to_string(),
            state: JobState::Pending,
            attempts: 0,
            max_retries,
            next_run_at: now,
            locked_at: None,
            locked_by: None,
            stdout: None,
            stderr: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Read-only snapshot of pending jobs whose scheduled time has
    /// arrived, oldest first. For inspection only; dispatch goes through
    /// [`claim_one_for`](Self::claim_one_for).
    #[instrument(skip_all, err)]
    pub async fn fetch_eligible(&self, limit: u32) -> Result<Vec<Job>, QueueError> {
        let now_ms = datetime_to_timestamp(Utc::now());

        let rows = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM jobs
             WHERE state = 'pending' AND next_run_at <= ?1
             ORDER BY created_at ASC, id ASC
             LIMIT ?2",
        )
        .bind(now_ms)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch eligible jobs")?;

        rows.into_iter().map(Job::try_from).collect()
    }

    /// Atomically lease the oldest eligible pending job to `worker`.
    ///
    /// Returns `None` when the backlog is empty *or* when a concurrent
    /// claimant won the race for the selected row; both are the normal
    /// "nothing to do" signal and the caller's polling loop simply tries
    /// again next cycle. A returned job is guaranteed to be leased by
    /// this worker alone.
    #[instrument(skip_all, err, fields(worker))]
    pub async fn claim_one_for(&self, worker: &str) -> Result<Option<Job>, QueueError> {
        let now_ms = datetime_to_timestamp(Utc::now());

        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to start claim transaction")?;

        let candidate: Option<String> = sqlx::query_scalar(
            "SELECT id FROM jobs
             WHERE state = 'pending' AND next_run_at <= ?1
             ORDER BY created_at ASC, id ASC
             LIMIT 1",
        )
        .bind(now_ms)
        .fetch_optional(&mut *tx)
        .await
        .context("Failed to scan for an eligible job")?;

        let Some(id) = candidate else {
            return Ok(None);
        };

        // The state predicate guards the gap between the scan above and
        // this write: if another claimant got here first, zero rows match.
        let updated = sqlx::query(
            "UPDATE jobs
             SET state = 'processing', locked_at = ?1, locked_by = ?2, updated_at = ?1
             WHERE id = ?3 AND state = 'pending'",
        )
        .bind(now_ms)
        .bind(worker)
        .bind(&id)
        .execute(&mut *tx)
        .await
        .context("Failed to lease job")?;

        if updated.rows_affected() == 0 {
            return Ok(None);
        }

        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = ?1")
            .bind(&id)
            .fetch_one(&mut *tx)
            .await
            .context("Failed to re-read claimed job")?;

        tx.commit().await.context("Failed to commit claim")?;

        Ok(Some(row.try_into()?))
    }

    /// Mark a leased job as completed, storing captured output and
    /// clearing the lease. Returns `false` if the row no longer exists.
    #[instrument(skip_all, err, fields(job_id = %id))]
    pub async fn mark_completed(
        &self,
        id: Uuid,
        stdout: Option<&str>,
        stderr: Option<&str>,
    ) -> Result<bool, QueueError> {
        let now_ms = datetime_to_timestamp(Utc::now());

        let result = sqlx::query(
            "UPDATE jobs
             SET state = 'completed', stdout = ?1, stderr = ?2,
                 locked_at = NULL, locked_by = NULL, updated_at = ?3
             WHERE id = ?4",
        )
        .bind(stdout)
        .bind(stderr)
        .bind(now_ms)
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .context("Failed to mark job as completed")?;

        Ok(result.rows_affected() > 0)
    }

    /// Record a failed attempt and return the job to the backlog:
    /// attempts is incremented, the lease cleared, and `next_run_at`
    /// pushed `delay` into the future, all in one transaction.
    #[instrument(skip_all, err, fields(job_id = %id, delay_secs = delay.as_secs()))]
    pub async fn reschedule_after_failure(
        &self,
        id: Uuid,
        error: &str,
        delay: Duration,
    ) -> Result<Job, QueueError> {
        let now_ms = datetime_to_timestamp(Utc::now());
        let next_run_ms =
            now_ms.saturating_add(i64::try_from(delay.as_millis()).unwrap_or(i64::MAX));

        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to start reschedule transaction")?;

        let result = sqlx::query(
            "UPDATE jobs
             SET state = 'pending', attempts = attempts + 1, last_error = ?1,
                 next_run_at = ?2, locked_at = NULL, locked_by = NULL, updated_at = ?3
             WHERE id = ?4",
        )
        .bind(error)
        .bind(next_run_ms)
        .bind(now_ms)
        .bind(id.to_string())
        .execute(&mut *tx)
        .await
        .context("Failed to reschedule job")?;

        if result.rows_affected() == 0 {
            return Err(QueueError::job_not_found(id));
        }

        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = ?1")
            .bind(id.to_string())
            .fetch_one(&mut *tx)
            .await
            .context("Failed to re-read rescheduled job")?;

        tx.commit().await.context("Failed to commit reschedule")?;

        row.try_into()
    }

    /// Atomically move a job to the dead-letter queue.
    ///
    /// The inserted entry records `attempts + 1`, counting the final
    /// failure that triggered the move; insert and delete commit
    /// together, so the id is never present in both tables. Returns
    /// `false` as a no-op when the job no longer exists, which makes the
    /// call idempotent under caller retry.
    #[instrument(skip_all, err, fields(job_id = %id))]
    pub async fn transfer_to_dlq(&self, id: Uuid, reason: &str) -> Result<bool, QueueError> {
        let now_ms = datetime_to_timestamp(Utc::now());

        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to start dead-letter transaction")?;

        let inserted = sqlx::query(
            "INSERT INTO dlq (id, command, attempts, last_error, moved_at, original_created_at)
             SELECT id, command, attempts + 1, ?2, ?3, created_at
             FROM jobs WHERE id = ?1",
        )
        .bind(id.to_string())
        .bind(reason)
        .bind(now_ms)
        .execute(&mut *tx)
        .await
        .context("Failed to copy job into the dead-letter queue")?;

        if inserted.rows_affected() == 0 {
            return Ok(false);
        }

        sqlx::query("DELETE FROM jobs WHERE id = ?1")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .context("Failed to delete dead-lettered job")?;

        tx.commit()
            .await
            .context("Failed to commit dead-letter transfer")?;

        tracing::warn!(job_id = %id, reason, "Job moved to dead-letter queue");
        Ok(true)
    }

    /// List dead-letter entries, most recently moved first.
    #[instrument(skip_all, err)]
    pub async fn list_dlq(&self, limit: u32) -> Result<Vec<DlqEntry>, QueueError> {
        let rows = sqlx::query_as::<_, DlqRow>(
            "SELECT * FROM dlq ORDER BY moved_at DESC, id DESC LIMIT ?1",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list dead-letter queue")?;

        rows.into_iter().map(DlqEntry::try_from).collect()
    }

    /// Delete every dead-letter entry, returning how many were removed.
    /// Jobs in the live table are untouched.
    #[instrument(skip_all, err)]
    pub async fn purge_dlq(&self) -> Result<u64, QueueError> {
        let result = sqlx::query("DELETE FROM dlq")
            .execute(&self.pool)
            .await
            .context("Failed to purge dead-letter queue")?;

        Ok(result.rows_affected())
    }

    /// Aggregate per-state counts for status reporting.
    #[instrument(skip_all, err)]
    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        let (total, pending, processing, completed): (i64, i64, i64, i64) = sqlx::query_as(
            "SELECT COUNT(*),
                    COUNT(*) FILTER (WHERE state = 'pending'),
                    COUNT(*) FILTER (WHERE state = 'processing'),
                    COUNT(*) FILTER (WHERE state = 'completed')
             FROM jobs",
        )
        .fetch_one(&self.pool)
        .await
        .context("Failed to count jobs")?;

        let dlq: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dlq")
            .fetch_one(&self.pool)
            .await
            .context("Failed to count dead-letter entries")?;

        Ok(QueueStats {
            total: total as u64,
            pending: pending as u64,
            processing: processing as u64,
            completed: completed as u64,
            dlq: dlq as u64,
        })
    }

    /// Return leases older than `older_than` to the backlog.
    ///
    /// A `processing` row whose lease has outlived the timeout is assumed
    /// to belong to a worker that died between claiming and resolving.
    /// The lease is cleared and the state reset without touching
    /// `attempts`, so a reclaimed job keeps its remaining retry budget.
    /// The timeout must exceed the command timeout, or a slow-but-alive
    /// execution could be leased to a second worker.
    #[instrument(skip_all, err, fields(older_than_secs = older_than.as_secs()))]
    pub async fn reclaim_stale(&self, older_than: Duration) -> Result<u64, QueueError> {
        let now = Utc::now();
        let cutoff_ms = datetime_to_timestamp(now) - older_than.as_millis() as i64;

        let result = sqlx::query(
            "UPDATE jobs
             SET state = 'pending', locked_at = NULL, locked_by = NULL, updated_at = ?1
             WHERE state = 'processing' AND locked_at IS NOT NULL AND locked_at <= ?2",
        )
        .bind(datetime_to_timestamp(now))
        .bind(cutoff_ms)
        .execute(&self.pool)
        .await
        .context("Failed to reclaim stale leases")?;

        let reclaimed = result.rows_affected();
        if reclaimed > 0 {
            tracing::warn!(reclaimed, "Returned stale leases to the backlog");
        }
        Ok(reclaimed)
    }
}
