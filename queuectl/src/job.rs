//! Public data model: jobs, dead-letter entries, and queue statistics.

use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::DateTime;

/// Lifecycle state of a job row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Awaiting a worker; eligible once `next_run_at` has passed.
    Pending,
    /// Leased by exactly one worker.
    Processing,
    /// Terminal success. Rows are retained for inspection.
    Completed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobState::Pending),
            "processing" => Ok(JobState::Processing),
            "completed" => Ok(JobState::Completed),
            other => Err(format!("unknown job state '{other}'")),
        }
    }
}

/// One submitted unit of work.
///
/// `attempts` counts executions that have *failed*; a job that succeeds on
/// its first run completes with `attempts == 0`.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: Uuid,
    pub command: String,
    pub state: JobState,
    pub attempts: u32,
    pub max_retries: u32,
    pub next_run_at: DateTime,
    pub locked_at: Option<DateTime>,
    pub locked_by: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime,
    pub updated_at: DateTime,
}

/// Terminal record for a job that exhausted its retry budget.
///
/// The id is the original job id; a job moves into the dead-letter queue,
/// it is never present in both tables.
#[derive(Debug, Clone, Serialize)]
pub struct DlqEntry {
    pub id: Uuid,
    pub command: String,
    /// Final failed-attempt count, equal to the job's retry ceiling.
    pub attempts: u32,
    pub last_error: Option<String>,
    pub moved_at: DateTime,
    pub original_created_at: Option<DateTime>,
}

/// Aggregate counts over both tables, for status reporting.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub total: u64,
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub dlq: u64,
}
