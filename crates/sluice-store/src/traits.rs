//! Admission store abstraction trait
//!
//! This module defines the [`AdmissionStore`] trait every store implements, the
//! outcomes of its two admission decisions, and the signals a store sends back
//! to the limiter that owns it.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use sluice_core::{Datastore, LimiterError, StoreSettings, StoreSettingsUpdate, Strategy};

/// Admission store errors
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Settings key not found for limiter {0}")]
    SettingsKeyNotFound(String),

    #[error("Unknown client {0}")]
    UnknownClient(String),

    #[error("Impossible to add a job having a weight of {weight} to a limiter having a maxConcurrent setting of {max_concurrent}")]
    Overweight { weight: u64, max_concurrent: u64 },

    #[error("Store data was written by version {found}, which is incompatible with version {expected}")]
    IncompatibleVersion { found: String, expected: String },

    #[error("Store backend error: {0}")]
    Backend(String),

    #[error("Store has been disconnected")]
    Disconnected,

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

impl From<StoreError> for LimiterError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Overweight {
                weight,
                max_concurrent,
            } => LimiterError::Overweight {
                weight,
                max_concurrent,
            },
            StoreError::ConfigError(message) => LimiterError::Config(message),
            other => LimiterError::Store(other.to_string()),
        }
    }
}

/// Queue-admission decision returned by [`AdmissionStore::submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitOutcome {
    pub reached_hwm: bool,
    pub blocked: bool,
    pub strategy: Strategy,
}

/// Capacity decision returned by [`AdmissionStore::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterOutcome {
    pub success: bool,
    /// Delay before the job may start, honoring `min_time` spacing.
    pub wait: Duration,
    /// Reservoir left after this registration, when a reservoir is configured.
    pub reservoir: Option<u64>,
}

impl RegisterOutcome {
    pub fn rejected() -> Self {
        Self {
            success: false,
            wait: Duration::ZERO,
            reservoir: None,
        }
    }
}

/// Requests a store makes of its limiter.
#[derive(Debug)]
pub enum StoreSignal {
    /// Capacity may be available: drain up to `capacity` weight (`None` means
    /// unlimited) and report the drained weight on `reply` when present.
    Drain {
        capacity: Option<u64>,
        reply: Option<oneshot::Sender<u64>>,
    },
    /// Another process blocked the shared limiter; drop every queued job.
    DropAllQueued,
    /// Application-level broadcast.
    Message(String),
    /// Background store work failed.
    Error(StoreError),
}

/// Reports how many jobs are waiting in the owning limiter's local queue.
pub type QueuedProbe = Arc<dyn Fn() -> u64 + Send + Sync>;

/// Link from a store back to the limiter that owns it.
#[derive(Clone)]
pub struct StoreContext {
    signals: mpsc::UnboundedSender<StoreSignal>,
    queued: QueuedProbe,
}

impl StoreContext {
    pub fn new(signals: mpsc::UnboundedSender<StoreSignal>, queued: QueuedProbe) -> Self {
        Self { signals, queued }
    }

    /// Context wired to nothing, with an empty local queue. Signals are discarded.
    pub fn detached() -> Self {
        let (signals, _) = mpsc::unbounded_channel();
        Self::new(signals, Arc::new(|| 0))
    }

    pub fn signal(&self, signal: StoreSignal) {
        // The limiter may already be gone
        let _ = self.signals.send(signal);
    }

    pub fn drain(&self, capacity: Option<u64>) {
        self.signal(StoreSignal::Drain {
            capacity,
            reply: None,
        });
    }

    /// Asks for a drain and waits for the drained weight.
    pub async fn drain_and_wait(&self, capacity: Option<u64>) -> u64 {
        let (reply, rx) = oneshot::channel();
        self.signal(StoreSignal::Drain {
            capacity,
            reply: Some(reply),
        });
        rx.await.unwrap_or(0)
    }

    pub fn local_queued(&self) -> u64 {
        (self.queued)()
    }
}

impl std::fmt::Debug for StoreContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreContext")
            .field("closed", &self.signals.is_closed())
            .finish()
    }
}

/// Admission store trait
///
/// Owns every capacity counter of one limiter. The limiter never mutates the
/// counters itself; it asks the store to check and mutate them in one step.
/// Weights are non-negative integers, times are relative to the store's clock.
#[async_trait]
pub trait AdmissionStore: Send + Sync {
    /// Which kind of store this is.
    fn datastore(&self) -> Datastore;

    /// Identifier of this process within the limiter.
    fn client_id(&self) -> &str;

    /// The settings this store last applied.
    fn settings(&self) -> StoreSettings;

    /// Resolves once the store can serve requests.
    async fn ready(&self) -> StoreResult<()>;

    /// Decides whether a job may join a queue that currently holds
    /// `queue_length` jobs.
    async fn submit(&self, queue_length: u64, weight: u64) -> StoreResult<SubmitOutcome>;

    /// Tries to take `weight` units of capacity for the job registered as `index`.
    async fn register(
        &self,
        index: &str,
        weight: u64,
        expiration: Option<Duration>,
    ) -> StoreResult<RegisterOutcome>;

    /// Releases the capacity held by `index`. Returns the running weight left.
    async fn free(&self, index: &str, weight: u64) -> StoreResult<u64>;

    /// Whether `register` would currently succeed and start without waiting.
    async fn check(&self, weight: u64) -> StoreResult<bool>;

    async fn running(&self) -> StoreResult<u64>;

    async fn done(&self) -> StoreResult<u64>;

    /// Jobs queued across every process sharing this limiter.
    async fn queued(&self) -> StoreResult<u64>;

    async fn current_reservoir(&self) -> StoreResult<Option<u64>>;

    /// Adds `amount` (possibly negative) to the reservoir and returns the new value.
    async fn increment_reservoir(&self, amount: i64) -> StoreResult<Option<u64>>;

    async fn update_settings(&self, update: &StoreSettingsUpdate) -> StoreResult<()>;

    /// Whether the limiter has been idle past its group timeout.
    async fn group_check(&self) -> StoreResult<bool>;

    /// Broadcasts `message` to every limiter sharing this store.
    async fn publish(&self, message: &str) -> StoreResult<()>;

    /// Stops background work. Further calls may fail with [`StoreError::Disconnected`].
    async fn disconnect(&self) -> StoreResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overweight_converts_to_limiter_overweight() {
        let err: LimiterError = StoreError::Overweight {
            weight: 3,
            max_concurrent: 1,
        }
        .into();
        assert!(matches!(
            err,
            LimiterError::Overweight {
                weight: 3,
                max_concurrent: 1
            }
        ));
    }

    #[test]
    fn backend_errors_become_store_errors() {
        let err: LimiterError = StoreError::Backend("connection reset".to_string()).into();
        assert_eq!(
            err.to_string(),
            "Store error: Store backend error: connection reset"
        );
        assert_eq!(err.error_code(), "STORE_ERROR");
    }

    #[tokio::test]
    async fn drain_and_wait_gets_the_reply() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let context = StoreContext::new(tx, Arc::new(|| 4));
        assert_eq!(context.local_queued(), 4);

        let responder = tokio::spawn(async move {
            if let Some(StoreSignal::Drain {
                capacity,
                reply: Some(reply),
            }) = rx.recv().await
            {
                let _ = reply.send(capacity.unwrap_or(0) / 2);
            }
        });
        assert_eq!(context.drain_and_wait(Some(6)).await, 3);
        responder.await.unwrap();
    }
}
