#![doc = include_str!("../README.md")]

pub mod backoff;
pub mod config;
pub mod error;
pub mod job;
pub mod retry;
pub mod runner;
pub mod store;
pub mod worker;

/// An alias for `chrono::DateTime<chrono::Utc>`
pub type DateTime = chrono::DateTime<chrono::Utc>;
pub use chrono::Utc;
pub use tokio_util::sync::CancellationToken;
pub use uuid::Uuid;

/// Re-exports to simplify importing this crate's types.
pub mod prelude {
    pub use super::backoff::BackoffPolicy;
    pub use super::config::QueueConfig;
    pub use super::error::QueueError;
    pub use super::job::{DlqEntry, Job, JobState, QueueStats};
    pub use super::runner::{CommandRunner, ExecOutcome, ShellRunner};
    pub use super::store::JobStore;
    pub use super::worker::WorkerPool;
    pub use super::{CancellationToken, DateTime, Uuid};
}
