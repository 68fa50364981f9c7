use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::task::AbortHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use sluice_core::{
    Datastore, LimiterSettings, StoreSettings, StoreSettingsUpdate,
};

use crate::backend::{AtomicBackend, InitOptions, Scope, STORE_VERSION};
use crate::keys;
use crate::protocol::{ChannelMessage, StoreMessage};
use crate::traits::{
    AdmissionStore, RegisterOutcome, StoreContext, StoreError, StoreResult, StoreSignal,
    SubmitOutcome,
};

/// How long a process designated by a `capacity-priority` message has to
/// claim the capacity before it is blacklisted.
pub const CAPACITY_PRIORITY_TIMEOUT: Duration = Duration::from_millis(1000);

struct DistributedShared {
    scope: Scope,
    backend: Arc<dyn AtomicBackend>,
    context: StoreContext,
    init: Mutex<InitOptions>,
    heartbeat_interval: Duration,
    ready: OnceCell<()>,
    shutdown: CancellationToken,
    priority_timers: Mutex<HashMap<u64, AbortHandle>>,
}

impl DistributedShared {
    fn init_options(&self, clear: bool) -> InitOptions {
        let mut options = self
            .init
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        options.clear = clear;
        options
    }

    async fn register_client(&self) -> StoreResult<()> {
        self.backend
            .register_client(&self.scope, self.context.local_queued())
            .await
    }

    async fn connect(self: &Arc<Self>) -> StoreResult<()> {
        let clear = self
            .init
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear;
        self.backend
            .init(&self.scope, &self.init_options(clear))
            .await?;

        let channels = [
            keys::channel(&self.scope.id),
            keys::client_channel(&self.scope.id, &self.scope.client),
        ];
        let messages = self.backend.subscribe(&channels).await?;
        tokio::spawn(listen(
            Arc::downgrade(self),
            messages,
            self.shutdown.clone(),
        ));

        self.register_client().await?;

        tokio::spawn(heartbeat_loop(
            Arc::downgrade(self),
            self.heartbeat_interval,
            self.shutdown.clone(),
        ));

        tracing::info!(
            limiter_id = %self.scope.id,
            client_id = %self.scope.client,
            "Connected to shared limiter"
        );
        Ok(())
    }

    async fn ensure_ready(self: &Arc<Self>) -> StoreResult<()> {
        if self.shutdown.is_cancelled() {
            return Err(StoreError::Disconnected);
        }
        self.ready.get_or_try_init(|| self.connect()).await?;
        Ok(())
    }

    /// Runs `op`, repairing missing keys or an unknown client once.
    async fn run<'a, T, F, Fut>(&'a self, op: F) -> StoreResult<T>
    where
        F: Fn() -> Fut + Send + 'a,
        Fut: Future<Output = StoreResult<T>> + Send + 'a,
        T: Send,
    {
        match op().await {
            Err(StoreError::SettingsKeyNotFound(id)) => {
                tracing::warn!(limiter_id = %id, "Shared keys missing, re-initializing");
                self.backend
                    .init(&self.scope, &self.init_options(false))
                    .await?;
                self.register_client().await?;
                op().await
            }
            Err(StoreError::UnknownClient(client)) => {
                tracing::warn!(
                    limiter_id = %self.scope.id,
                    client_id = %client,
                    "Client unknown to the shared limiter, registering again"
                );
                self.register_client().await?;
                op().await
            }
            other => other,
        }
    }

    fn on_message(self: &Arc<Self>, payload: &str) {
        let message = match payload.parse::<StoreMessage>() {
            Ok(message) => message,
            Err(e) => {
                self.context.signal(StoreSignal::Error(e));
                return;
            }
        };

        match message {
            StoreMessage::Capacity(capacity) => self.context.drain(capacity),
            StoreMessage::CapacityPriority {
                capacity,
                client,
                counter,
            } if client == self.scope.client => {
                let this = Arc::clone(self);
                tokio::spawn(async move {
                    let drained = this.context.drain_and_wait(capacity).await;
                    let remaining = StoreMessage::CapacityPriority {
                        capacity: capacity.map(|c| c.saturating_sub(drained)),
                        client: String::new(),
                        counter,
                    };
                    let channel = keys::channel(&this.scope.id);
                    if let Err(e) = this.backend.publish(&channel, &remaining.to_string()).await {
                        this.context.signal(StoreSignal::Error(e));
                    }
                });
            }
            StoreMessage::CapacityPriority {
                capacity,
                client,
                counter,
            } if client.is_empty() => {
                let timer = self
                    .priority_timers
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&counter);
                if let Some(timer) = timer {
                    timer.abort();
                }
                self.context.drain(capacity);
            }
            StoreMessage::CapacityPriority {
                capacity,
                client,
                counter,
            } => {
                let weak = Arc::downgrade(self);
                let handle = tokio::spawn(async move {
                    sleep(CAPACITY_PRIORITY_TIMEOUT).await;
                    let Some(this) = weak.upgrade() else {
                        return;
                    };
                    this.priority_timers
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .remove(&counter);

                    tracing::warn!(
                        limiter_id = %this.scope.id,
                        silent_client = %client,
                        "Priority client did not claim capacity, blacklisting it"
                    );
                    let shared: &DistributedShared = &this;
                    let silent: &str = &client;
                    match shared
                        .run(move || shared.backend.blacklist_client(&shared.scope, silent))
                        .await
                    {
                        Ok(()) => shared.context.drain(capacity),
                        Err(e) => shared.context.signal(StoreSignal::Error(e)),
                    }
                });
                self.priority_timers
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(counter, handle.abort_handle());
            }
            StoreMessage::Message(payload) => self.context.signal(StoreSignal::Message(payload)),
            StoreMessage::Blocked => self.context.signal(StoreSignal::DropAllQueued),
        }
    }

    fn stop_timers(&self) {
        let timers: Vec<AbortHandle> = self
            .priority_timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, timer)| timer)
            .collect();
        for timer in timers {
            timer.abort();
        }
    }
}

async fn listen(
    shared: Weak<DistributedShared>,
    mut messages: BoxStream<'static, ChannelMessage>,
    shutdown: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = shutdown.cancelled() => break,
            message = messages.next() => match message {
                Some(message) => message,
                None => break,
            },
        };
        let Some(shared) = shared.upgrade() else {
            break;
        };
        shared.on_message(&message.payload);
    }
}

async fn heartbeat_loop(
    shared: Weak<DistributedShared>,
    period: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(shared) = shared.upgrade() else {
            break;
        };

        let mut result = shared.backend.heartbeat(&shared.scope).await;
        if let Err(StoreError::UnknownClient(_)) = result {
            result = match shared.register_client().await {
                Ok(()) => shared.backend.heartbeat(&shared.scope).await,
                Err(e) => Err(e),
            };
        }
        match result {
            // Expired or deleted keys are recreated by the next real operation
            Ok(()) | Err(StoreError::SettingsKeyNotFound(_)) => {}
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    limiter_id = %shared.scope.id,
                    "Heartbeat failed"
                );
                shared.context.signal(StoreSignal::Error(e));
            }
        }
    }
}

/// Admission store whose counters live behind an [`AtomicBackend`].
///
/// Connects lazily: the first operation initializes the shared keys,
/// subscribes to the limiter's channels, registers this process as a client
/// and starts the heartbeat.
pub struct DistributedStore {
    shared: Arc<DistributedShared>,
}

impl DistributedStore {
    pub fn new(
        settings: &LimiterSettings,
        backend: Arc<dyn AtomicBackend>,
        context: StoreContext,
    ) -> Self {
        let init = InitOptions {
            clear: settings.clear_datastore,
            version: STORE_VERSION.to_string(),
            settings: settings.store.clone(),
            client_timeout: settings.client_timeout,
            group_timeout: settings.timeout,
        };
        Self {
            shared: Arc::new(DistributedShared {
                scope: Scope::new(settings.id.clone(), Uuid::new_v4().simple().to_string()),
                backend,
                context,
                init: Mutex::new(init),
                heartbeat_interval: settings.effective_heartbeat_interval(),
                ready: OnceCell::new(),
                shutdown: CancellationToken::new(),
                priority_timers: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn backend(&self) -> &Arc<dyn AtomicBackend> {
        &self.shared.backend
    }

    pub fn scope(&self) -> &Scope {
        &self.shared.scope
    }
}

#[async_trait]
impl AdmissionStore for DistributedStore {
    fn datastore(&self) -> Datastore {
        Datastore::Distributed
    }

    fn client_id(&self) -> &str {
        &self.shared.scope.client
    }

    fn settings(&self) -> StoreSettings {
        self.shared
            .init
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .settings
            .clone()
    }

    async fn ready(&self) -> StoreResult<()> {
        self.shared.ensure_ready().await
    }

    #[tracing::instrument(skip(self), fields(limiter_id = %self.shared.scope.id))]
    async fn submit(&self, queue_length: u64, weight: u64) -> StoreResult<SubmitOutcome> {
        self.shared.ensure_ready().await?;
        let shared: &DistributedShared = &self.shared;
        shared
            .run(move || shared.backend.submit(&shared.scope, queue_length, weight))
            .await
    }

    async fn register(
        &self,
        index: &str,
        weight: u64,
        expiration: Option<Duration>,
    ) -> StoreResult<RegisterOutcome> {
        self.shared.ensure_ready().await?;
        let shared: &DistributedShared = &self.shared;
        shared
            .run(move || {
                shared
                    .backend
                    .register(&shared.scope, index, weight, expiration)
            })
            .await
    }

    async fn free(&self, index: &str, _weight: u64) -> StoreResult<u64> {
        self.shared.ensure_ready().await?;
        let shared: &DistributedShared = &self.shared;
        shared
            .run(move || shared.backend.free(&shared.scope, index))
            .await
    }

    async fn check(&self, weight: u64) -> StoreResult<bool> {
        self.shared.ensure_ready().await?;
        let shared: &DistributedShared = &self.shared;
        shared
            .run(move || shared.backend.check(&shared.scope, weight))
            .await
    }

    async fn running(&self) -> StoreResult<u64> {
        self.shared.ensure_ready().await?;
        let shared: &DistributedShared = &self.shared;
        shared
            .run(move || shared.backend.running(&shared.scope))
            .await
    }

    async fn done(&self) -> StoreResult<u64> {
        self.shared.ensure_ready().await?;
        let shared: &DistributedShared = &self.shared;
        shared.run(move || shared.backend.done(&shared.scope)).await
    }

    async fn queued(&self) -> StoreResult<u64> {
        self.shared.ensure_ready().await?;
        let shared: &DistributedShared = &self.shared;
        shared
            .run(move || shared.backend.queued(&shared.scope))
            .await
    }

    async fn current_reservoir(&self) -> StoreResult<Option<u64>> {
        self.shared.ensure_ready().await?;
        let shared: &DistributedShared = &self.shared;
        shared
            .run(move || shared.backend.current_reservoir(&shared.scope))
            .await
    }

    async fn increment_reservoir(&self, amount: i64) -> StoreResult<Option<u64>> {
        self.shared.ensure_ready().await?;
        let shared: &DistributedShared = &self.shared;
        shared
            .run(move || shared.backend.increment_reservoir(&shared.scope, amount))
            .await
    }

    async fn update_settings(&self, update: &StoreSettingsUpdate) -> StoreResult<()> {
        self.shared.ensure_ready().await?;
        let shared: &DistributedShared = &self.shared;
        shared
            .run(move || shared.backend.update_settings(&shared.scope, update))
            .await?;
        shared
            .init
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .settings
            .apply(update);
        Ok(())
    }

    async fn group_check(&self) -> StoreResult<bool> {
        self.shared.ensure_ready().await?;
        self.shared.backend.group_check(&self.shared.scope).await
    }

    async fn publish(&self, message: &str) -> StoreResult<()> {
        self.shared.ensure_ready().await?;
        let payload = StoreMessage::Message(message.to_string()).to_string();
        self.shared
            .backend
            .publish(&keys::channel(&self.shared.scope.id), &payload)
            .await
    }

    async fn disconnect(&self) -> StoreResult<()> {
        self.shared.shutdown.cancel();
        self.shared.stop_timers();
        tracing::debug!(
            limiter_id = %self.shared.scope.id,
            client_id = %self.shared.scope.client,
            "Disconnected from shared limiter"
        );
        Ok(())
    }
}

impl Drop for DistributedStore {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
        self.shared.stop_timers();
    }
}
