//! Job state registry.
//!
//! Tracks the lifecycle state of every job a limiter knows about, together with
//! per-state counts kept in sync on every transition. The DONE state only exists
//! when the limiter retains finished jobs; otherwise advancing past EXECUTING
//! forgets the id.

use serde::Serialize;
use std::collections::HashMap;

use crate::error::LimiterError;
use crate::models::JobStatus;

/// Per-state job counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub received: usize,
    pub queued: usize,
    pub running: usize,
    pub executing: usize,
    pub done: usize,
}

impl StatusCounts {
    /// Jobs that have not reached a terminal state.
    pub fn pending(&self) -> usize {
        self.received + self.queued + self.running + self.executing
    }
}

#[derive(Debug)]
pub struct JobStates {
    jobs: HashMap<String, JobStatus>,
    counts: Vec<usize>,
}

impl JobStates {
    pub fn new(track_done_status: bool) -> Self {
        let tracked = if track_done_status { 5 } else { 4 };
        Self {
            jobs: HashMap::new(),
            counts: vec![0; tracked],
        }
    }

    fn tracks(&self, status: JobStatus) -> bool {
        status.index() < self.counts.len()
    }

    /// Starts tracking `id` in RECEIVED.
    pub fn start(&mut self, id: &str) {
        if let Some(previous) = self.jobs.insert(id.to_string(), JobStatus::Received) {
            self.counts[previous.index()] -= 1;
        }
        self.counts[JobStatus::Received.index()] += 1;
    }

    /// Moves `id` to the next state. Returns the new state, or `None` when the
    /// job left the registry (finished without DONE tracking, or unknown id).
    pub fn next(&mut self, id: &str) -> Option<JobStatus> {
        let current = *self.jobs.get(id)?;
        self.counts[current.index()] -= 1;
        match JobStatus::from_index(current.index() + 1).filter(|s| self.tracks(*s)) {
            Some(next) => {
                self.counts[next.index()] += 1;
                self.jobs.insert(id.to_string(), next);
                Some(next)
            }
            None => {
                self.jobs.remove(id);
                None
            }
        }
    }

    /// Stops tracking `id`. Returns whether it was tracked.
    pub fn remove(&mut self, id: &str) -> bool {
        match self.jobs.remove(id) {
            Some(current) => {
                self.counts[current.index()] -= 1;
                true
            }
            None => false,
        }
    }

    pub fn job_status(&self, id: &str) -> Option<JobStatus> {
        self.jobs.get(id).copied()
    }

    /// Ids currently in `status`, or every tracked id when `status` is `None`.
    pub fn status_jobs(&self, status: Option<JobStatus>) -> Result<Vec<String>, LimiterError> {
        match status {
            Some(status) if !self.tracks(status) => {
                let names = JobStatus::ALL[..self.counts.len()]
                    .iter()
                    .map(|s| s.to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                Err(LimiterError::UnknownStatus(names))
            }
            Some(status) => Ok(self
                .jobs
                .iter()
                .filter(|(_, s)| **s == status)
                .map(|(id, _)| id.clone())
                .collect()),
            None => Ok(self.jobs.keys().cloned().collect()),
        }
    }

    pub fn counts(&self) -> StatusCounts {
        let at = |status: JobStatus| self.counts.get(status.index()).copied().unwrap_or(0);
        StatusCounts {
            received: at(JobStatus::Received),
            queued: at(JobStatus::Queued),
            running: at(JobStatus::Running),
            executing: at(JobStatus::Executing),
            done: at(JobStatus::Done),
        }
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
