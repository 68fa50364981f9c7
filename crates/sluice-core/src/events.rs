//! Limiter notifications.
//!
//! Events fan out over a `tokio::sync::broadcast` channel, so every subscriber
//! sees them in emission order. A subscriber that falls more than
//! [`EVENT_CHANNEL_CAPACITY`] events behind observes `RecvError::Lagged`.
//!
//! Retry decisions cannot travel over a broadcast channel, so they go through a
//! single registered [`FailureHandler`] instead.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;

use crate::error::LimiterError;
use crate::models::JobInfo;

pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub enum LimiterEvent {
    Received(JobInfo),
    Queued {
        job: JobInfo,
        reached_hwm: bool,
        blocked: bool,
    },
    Scheduled(JobInfo),
    Executing(JobInfo),
    Failed {
        job: JobInfo,
        error: LimiterError,
    },
    Retry {
        job: JobInfo,
        message: String,
        delay: Duration,
    },
    Done(JobInfo),
    Dropped {
        job: JobInfo,
        error: LimiterError,
    },
    /// The queue has no waiting jobs left.
    Empty,
    /// Nothing is queued and nothing is running.
    Idle,
    /// The reservoir reached zero.
    Depleted { empty: bool },
    /// The queue went from empty to non-empty.
    LeftZero,
    /// The queue went from non-empty to empty.
    Zero,
    /// Application-level broadcast received through the store.
    Message(String),
    Error(LimiterError),
}

/// Decides whether a failed job is retried. Returning `Some(delay)` retries the
/// job after `delay`; `None` gives up and rejects the job with its error.
pub type FailureHandler = Arc<dyn Fn(&LimiterError, &JobInfo) -> Option<Duration> + Send + Sync>;

#[derive(Clone)]
pub struct Events {
    tx: broadcast::Sender<LimiterEvent>,
    failure_handler: Arc<RwLock<Option<FailureHandler>>>,
}

impl Events {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            tx,
            failure_handler: Arc::new(RwLock::new(None)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LimiterEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: LimiterEvent) {
        // No subscribers is not an error
        let _ = self.tx.send(event);
    }

    pub fn set_failure_handler(&self, handler: FailureHandler) {
        *self
            .failure_handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    /// Emits [`LimiterEvent::Failed`] and asks the failure handler for a retry delay.
    pub fn failed(&self, error: &LimiterError, job: &JobInfo) -> Option<Duration> {
        self.emit(LimiterEvent::Failed {
            job: job.clone(),
            error: error.clone(),
        });
        let handler = self
            .failure_handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        handler.and_then(|handler| handler(error, job))
    }
}

impl Default for Events {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Events {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Events")
            .field("subscribers", &self.tx.receiver_count())
            .finish()
    }
}
