use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;

/// Lifecycle state of a job tracked by a limiter.
///
/// States are strictly ordered; a job only ever moves forward through them
/// (EXECUTING is re-entered in place on retry).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Received,
    Queued,
    Running,
    Executing,
    Done,
}

impl JobStatus {
    /// All states in lifecycle order.
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Received,
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::Executing,
        JobStatus::Done,
    ];

    pub fn index(&self) -> usize {
        *self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            JobStatus::Received => write!(f, "RECEIVED"),
            JobStatus::Queued => write!(f, "QUEUED"),
            JobStatus::Running => write!(f, "RUNNING"),
            JobStatus::Executing => write!(f, "EXECUTING"),
            JobStatus::Done => write!(f, "DONE"),
        }
    }
}

impl FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "RECEIVED" => Ok(JobStatus::Received),
            "QUEUED" => Ok(JobStatus::Queued),
            "RUNNING" => Ok(JobStatus::Running),
            "EXECUTING" => Ok(JobStatus::Executing),
            "DONE" => Ok(JobStatus::Done),
            _ => Err(anyhow::anyhow!("Invalid job status: {}", s)),
        }
    }
}
