//! Error types module
//!
//! Every per-job failure surfaced by a limiter is a [`LimiterError`]. Errors are
//! cloneable because the same failure is delivered both to the job's completion
//! handle and to event subscribers.

use std::sync::Arc;
use std::time::Duration;

use crate::models::JobStatus;

/// Message used when a job is dropped without a more specific reason.
pub const DEFAULT_DROP_MESSAGE: &str = "This job has been dropped by Sluice";

/// Log level for error reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Debug level - for expected outcomes like drops and overflow evictions
    Debug,
    /// Warning level - for recoverable issues like task failures
    Warn,
    /// Error level - for coordination bugs and store failures
    Error,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum LimiterError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Impossible to add a job having a weight of {weight} to a limiter having a maxConcurrent setting of {max_concurrent}")]
    Overweight { weight: u64, max_concurrent: u64 },

    #[error("A job with the same id already exists (id={0})")]
    DuplicateId(String),

    #[error("{0}")]
    Task(Arc<anyhow::Error>),

    #[error("This job timed out after {} ms.", .after.as_millis())]
    Expired { after: Duration },

    #[error("Store error: {0}")]
    Store(String),

    #[error("{0}")]
    Stopped(String),

    #[error("stop() has already been called")]
    AlreadyStopped,

    #[error("{0}")]
    Dropped(String),

    #[error("Invalid job status {found} for job {id}, expected {expected}")]
    InvalidStatus {
        id: String,
        found: String,
        expected: JobStatus,
    },

    #[error("status must be one of {0}")]
    UnknownStatus(String),
}

impl LimiterError {
    /// Wraps a task body failure.
    pub fn task(err: anyhow::Error) -> Self {
        LimiterError::Task(Arc::new(err))
    }

    /// Drop error with the default message.
    pub fn dropped() -> Self {
        LimiterError::Dropped(DEFAULT_DROP_MESSAGE.to_string())
    }

    /// The task body's own error, when this failure came from the task.
    pub fn as_task_error(&self) -> Option<&anyhow::Error> {
        match self {
            LimiterError::Task(err) => Some(err.as_ref()),
            _ => None,
        }
    }

    /// Machine-readable error code (e.g., "OVERWEIGHT")
    pub fn error_code(&self) -> &'static str {
        error_metadata(self).0
    }

    /// Whether scheduling the same work again could succeed.
    pub fn is_recoverable(&self) -> bool {
        error_metadata(self).1
    }

    /// Log level for this error
    pub fn log_level(&self) -> LogLevel {
        error_metadata(self).2
    }
}

/// Static metadata for each variant: (error_code, recoverable, log_level).
fn error_metadata(err: &LimiterError) -> (&'static str, bool, LogLevel) {
    match err {
        LimiterError::Config(_) => ("CONFIG_ERROR", false, LogLevel::Error),
        LimiterError::Overweight { .. } => ("OVERWEIGHT", false, LogLevel::Warn),
        LimiterError::DuplicateId(_) => ("DUPLICATE_ID", false, LogLevel::Warn),
        LimiterError::Task(_) => ("TASK_FAILED", true, LogLevel::Warn),
        LimiterError::Expired { .. } => ("EXPIRED", true, LogLevel::Warn),
        LimiterError::Store(_) => ("STORE_ERROR", true, LogLevel::Error),
        LimiterError::Stopped(_) => ("STOPPED", false, LogLevel::Debug),
        LimiterError::AlreadyStopped => ("ALREADY_STOPPED", false, LogLevel::Debug),
        LimiterError::Dropped(_) => ("DROPPED", true, LogLevel::Debug),
        LimiterError::InvalidStatus { .. } => ("INVALID_STATUS", false, LogLevel::Error),
        LimiterError::UnknownStatus(_) => ("UNKNOWN_STATUS", false, LogLevel::Debug),
    }
}

impl From<anyhow::Error> for LimiterError {
    fn from(err: anyhow::Error) -> Self {
        LimiterError::task(err)
    }
}
