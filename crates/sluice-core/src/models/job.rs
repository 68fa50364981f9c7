use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Number of priority bands. Priority 0 is the most urgent.
pub const NUM_PRIORITIES: usize = 10;
pub const DEFAULT_PRIORITY: u8 = 5;
pub const DEFAULT_WEIGHT: u64 = 1;
/// Job id used when the caller does not supply one; a random suffix is appended.
pub const DEFAULT_JOB_ID: &str = "<no-id>";

const INDEX_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Random lowercase alphanumeric token used for job id suffixes and
/// registration indexes.
pub fn random_index() -> String {
    let mut rng = rand::rng();
    (0..9)
        .map(|_| INDEX_ALPHABET[rng.random_range(0..INDEX_ALPHABET.len())] as char)
        .collect()
}

/// Caller-facing job options. Every field is optional; see [`JobOptions::sanitize`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    pub priority: Option<i32>,
    pub weight: Option<u64>,
    pub expiration: Option<Duration>,
    pub id: Option<String>,
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_weight(mut self, weight: u64) -> Self {
        self.weight = Some(weight);
        self
    }

    pub fn with_expiration(mut self, expiration: Duration) -> Self {
        self.expiration = Some(expiration);
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Normalizes the options into a [`JobSpec`].
    ///
    /// Missing priority defaults to [`DEFAULT_PRIORITY`] and out-of-range values
    /// are clamped into `0..NUM_PRIORITIES`. A missing id, or the default id,
    /// gets a random suffix so jobs remain distinguishable.
    pub fn sanitize(self) -> JobSpec {
        let priority = match self.priority {
            Some(p) => p.clamp(0, NUM_PRIORITIES as i32 - 1) as u8,
            None => DEFAULT_PRIORITY,
        };
        let id = match self.id {
            Some(id) if id != DEFAULT_JOB_ID => id,
            _ => format!("{}-{}", DEFAULT_JOB_ID, random_index()),
        };
        JobSpec {
            id,
            priority,
            weight: self.weight.unwrap_or(DEFAULT_WEIGHT),
            expiration: self.expiration,
        }
    }
}

impl From<&JobSpec> for JobOptions {
    fn from(spec: &JobSpec) -> Self {
        JobOptions {
            priority: Some(spec.priority as i32),
            weight: Some(spec.weight),
            expiration: spec.expiration,
            id: Some(spec.id.clone()),
        }
    }
}

/// Sanitized, immutable job attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub id: String,
    pub priority: u8,
    pub weight: u64,
    pub expiration: Option<Duration>,
}

/// Snapshot of a job carried by lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobInfo {
    pub id: String,
    pub priority: u8,
    pub weight: u64,
    pub expiration: Option<Duration>,
    pub retry_count: u32,
}

impl JobInfo {
    pub fn new(spec: &JobSpec, retry_count: u32) -> Self {
        Self {
            id: spec.id.clone(),
            priority: spec.priority,
            weight: spec.weight,
            expiration: spec.expiration,
            retry_count,
        }
    }
}
