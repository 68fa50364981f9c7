//! Atomic backend protocol
//!
//! A distributed limiter keeps its counters in a shared store and mutates them
//! only through the operations of [`AtomicBackend`]. Each operation must run
//! atomically with respect to every other operation on the same limiter id,
//! the way a Redis Lua script does. [`MemoryBackend`] hosts the operations in
//! process so several limiters can share one keyspace without a server.
//!
//! Every operation except `init`, `register_client` and `group_check` fails with
//! [`StoreError::SettingsKeyNotFound`](crate::StoreError::SettingsKeyNotFound)
//! when the limiter's keys are missing, and with
//! [`StoreError::UnknownClient`](crate::StoreError::UnknownClient) when the
//! calling process never registered.

pub mod memory;
pub mod scripts;

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::time::Duration;

use sluice_core::{StoreSettings, StoreSettingsUpdate};

use crate::protocol::ChannelMessage;
use crate::traits::{RegisterOutcome, StoreResult, SubmitOutcome};

pub use memory::MemoryBackend;

/// Version written into shared settings. Data from another major version is rejected.
pub const STORE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// The limiter and process an operation runs for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Scope {
    pub id: String,
    pub client: String,
}

impl Scope {
    pub fn new(id: impl Into<String>, client: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            client: client.into(),
        }
    }
}

/// Arguments of the `init` operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitOptions {
    /// Delete existing keys first.
    pub clear: bool,
    pub version: String,
    /// Limits written when the keys are created. Existing keys keep theirs.
    pub settings: StoreSettings,
    pub client_timeout: Duration,
    /// Keys expire this long after the next eligible admission time.
    pub group_timeout: Option<Duration>,
}

#[async_trait]
pub trait AtomicBackend: Send + Sync {
    /// Idempotent setup. Creates the keys, or migrates keys written by a
    /// compatible version.
    async fn init(&self, scope: &Scope, options: &InitOptions) -> StoreResult<()>;

    /// Announces the process with `queued` jobs waiting locally.
    async fn register_client(&self, scope: &Scope, queued: u64) -> StoreResult<()>;

    /// Refreshes liveness and publishes the current capacity. A no-op when
    /// the limiter's keys do not exist.
    async fn heartbeat(&self, scope: &Scope) -> StoreResult<()>;

    async fn check(&self, scope: &Scope, weight: u64) -> StoreResult<bool>;

    async fn register(
        &self,
        scope: &Scope,
        index: &str,
        weight: u64,
        expiration: Option<Duration>,
    ) -> StoreResult<RegisterOutcome>;

    async fn submit(&self, scope: &Scope, queue_length: u64, weight: u64)
        -> StoreResult<SubmitOutcome>;

    /// Releases `index`. Returns the running weight left.
    async fn free(&self, scope: &Scope, index: &str) -> StoreResult<u64>;

    async fn running(&self, scope: &Scope) -> StoreResult<u64>;

    async fn queued(&self, scope: &Scope) -> StoreResult<u64>;

    async fn done(&self, scope: &Scope) -> StoreResult<u64>;

    async fn update_settings(&self, scope: &Scope, update: &StoreSettingsUpdate)
        -> StoreResult<()>;

    async fn increment_reservoir(&self, scope: &Scope, amount: i64) -> StoreResult<Option<u64>>;

    async fn current_reservoir(&self, scope: &Scope) -> StoreResult<Option<u64>>;

    /// Whether the limiter's keys have expired.
    async fn group_check(&self, scope: &Scope) -> StoreResult<bool>;

    /// Marks `client` as unresponsive so it stops receiving priority capacity.
    async fn blacklist_client(&self, scope: &Scope, client: &str) -> StoreResult<()>;

    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<()>;

    async fn subscribe(&self, channels: &[String])
        -> StoreResult<BoxStream<'static, ChannelMessage>>;

    /// One page of key names matching `pattern`. A returned cursor of 0 ends the scan.
    async fn scan_keys(
        &self,
        pattern: &str,
        cursor: u64,
        count: usize,
    ) -> StoreResult<(u64, Vec<String>)>;

    /// Deletes every key of limiter `id`. Returns the number of keys removed.
    async fn delete_limiter_keys(&self, id: &str) -> StoreResult<u64>;
}
