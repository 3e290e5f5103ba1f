use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by queue operations.
///
/// Contention (losing a claim race) and command failures are not errors:
/// the first is the `None` arm of a claim, the second is an
/// [`ExecOutcome`](crate::runner::ExecOutcome) fed to the retry machinery.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum QueueError {
    /// Submission rejected before touching the store.
    #[error("Refusing to enqueue an empty command")]
    EmptyCommand,

    /// The job no longer exists. Usually means another worker resolved it
    /// concurrently; callers treat this as local and non-fatal.
    #[error("Job {job_id} not found")]
    JobNotFound { job_id: Uuid },

    /// Database or other storage fault. No correct progress is possible
    /// without durable state, so this is fatal to the calling process.
    #[error("Database error: {0}")]
    Database(#[from] anyhow::Error),
}

impl QueueError {
    /// Create a job not found error.
    pub fn job_not_found(job_id: Uuid) -> Self {
        Self::JobNotFound { job_id }
    }

    /// Whether this error signals a concurrently-resolved job rather than
    /// a storage fault.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::JobNotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_formats_job_id() {
        let job_id = Uuid::now_v7();
        let error = QueueError::job_not_found(job_id);

        assert!(error.to_string().contains(&job_id.to_string()));
        assert!(error.is_not_found());
    }

    #[test]
    fn database_error_preserves_source() {
        use std::error::Error;

        let error = QueueError::Database(anyhow::anyhow!("disk I/O error"));
        assert!(error.to_string().contains("disk I/O error"));
        assert!(error.source().is_some());
        assert!(!error.is_not_found());
    }
}
