use crate::traits::{
    AdmissionStore, RegisterOutcome, StoreContext, StoreError, StoreResult, StoreSignal,
    SubmitOutcome,
};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use sluice_core::{
    random_index, Datastore, LimiterSettings, StoreSettings, StoreSettingsUpdate, Strategy,
};

/// Counters of a single-process limiter, in milliseconds since the store's origin.
#[derive(Debug)]
struct LocalState {
    settings: StoreSettings,
    next_request: u64,
    last_reservoir_refresh: u64,
    last_reservoir_increase: u64,
    running: u64,
    done: u64,
    unblock_time: Option<u64>,
    heartbeat: Option<AbortHandle>,
    disconnected: bool,
}

impl LocalState {
    fn compute_capacity(&self) -> Option<i64> {
        let running = self.running as i64;
        match (self.settings.max_concurrent, self.settings.reservoir) {
            (Some(max), Some(reservoir)) => Some((max as i64 - running).min(reservoir as i64)),
            (Some(max), None) => Some(max as i64 - running),
            (None, Some(reservoir)) => Some(reservoir as i64),
            (None, None) => None,
        }
    }

    fn drain_capacity(&self) -> Option<u64> {
        self.compute_capacity().map(|c| c.max(0) as u64)
    }

    fn conditions_check(&self, weight: u64) -> bool {
        self.compute_capacity()
            .map_or(true, |capacity| weight as i64 <= capacity)
    }

    fn check(&self, weight: u64, now: u64) -> bool {
        self.conditions_check(weight) && self.next_request <= now
    }

    fn is_blocked(&self, now: u64) -> bool {
        self.unblock_time.is_some_and(|until| until >= now)
    }

    /// Applies due reservoir refreshes and increases. Returns whether the
    /// reservoir changed.
    fn tick(&mut self, now: u64) -> bool {
        let mut changed = false;
        let settings = &self.settings;

        if let (Some(interval), Some(amount)) = (
            settings.reservoir_refresh_interval,
            settings.reservoir_refresh_amount,
        ) {
            if now >= self.last_reservoir_refresh + millis(interval) {
                self.last_reservoir_refresh = now;
                self.settings.reservoir = Some(amount);
                changed = true;
            }
        }

        let settings = &self.settings;
        if let (Some(interval), Some(amount)) = (
            settings.reservoir_increase_interval,
            settings.reservoir_increase_amount,
        ) {
            if now >= self.last_reservoir_increase + millis(interval) {
                self.last_reservoir_increase = now;
                let reservoir = settings.reservoir.unwrap_or(0) as i64;
                let incr = match settings.reservoir_increase_maximum {
                    Some(maximum) => (amount as i64).min(maximum as i64 - reservoir),
                    None => amount as i64,
                };
                if incr > 0 {
                    self.settings.reservoir = Some((reservoir + incr) as u64);
                    changed = true;
                }
            }
        }
        changed
    }
}

#[derive(Debug)]
struct LocalShared {
    id: String,
    origin: Instant,
    state: Mutex<LocalState>,
    context: StoreContext,
    heartbeat_interval: Duration,
    group_timeout: Option<Duration>,
}

impl LocalShared {
    fn lock(&self) -> MutexGuard<'_, LocalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn now(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

/// In-process admission store.
///
/// Every operation yields to the runtime once before touching the counters, so
/// callers interleave fairly even though nothing here performs I/O. A
/// heartbeat task runs only while a reservoir refresh or increase policy is
/// configured.
pub struct LocalStore {
    shared: Arc<LocalShared>,
    client_id: String,
}

impl LocalStore {
    /// Create a new LocalStore. Must be called inside a tokio runtime.
    pub fn new(settings: &LimiterSettings, context: StoreContext) -> Self {
        let origin = Instant::now();
        let state = LocalState {
            settings: settings.store.clone(),
            next_request: 0,
            last_reservoir_refresh: 0,
            last_reservoir_increase: 0,
            running: 0,
            done: 0,
            unblock_time: None,
            heartbeat: None,
            disconnected: false,
        };
        let store = Self {
            shared: Arc::new(LocalShared {
                id: settings.id.clone(),
                origin,
                state: Mutex::new(state),
                context,
                heartbeat_interval: settings.effective_heartbeat_interval(),
                group_timeout: settings.timeout,
            }),
            client_id: random_index(),
        };
        store.start_heartbeat();
        store
    }

    fn start_heartbeat(&self) {
        let mut state = self.shared.lock();
        let wanted = !state.disconnected
            && (state.settings.refresh_active() || state.settings.increase_active());

        if !wanted {
            if let Some(handle) = state.heartbeat.take() {
                handle.abort();
            }
            return;
        }
        if state.heartbeat.is_some() {
            return;
        }

        let period = self.shared.heartbeat_interval;
        let weak = Arc::downgrade(&self.shared);
        let handle = tokio::spawn(heartbeat_loop(weak, period));
        state.heartbeat = Some(handle.abort_handle());

        tracing::debug!(
            limiter_id = %self.shared.id,
            interval_ms = period.as_millis() as u64,
            "Reservoir heartbeat started"
        );
    }

    fn ensure_connected(&self) -> StoreResult<()> {
        if self.shared.lock().disconnected {
            return Err(StoreError::Disconnected);
        }
        Ok(())
    }
}

async fn heartbeat_loop(shared: Weak<LocalShared>, period: Duration) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(shared) = shared.upgrade() else {
            break;
        };
        let now = shared.now();
        let capacity = {
            let mut state = shared.lock();
            state.tick(now).then(|| state.drain_capacity())
        };
        if let Some(capacity) = capacity {
            tracing::debug!(limiter_id = %shared.id, ?capacity, "Reservoir replenished");
            shared.context.drain(capacity);
        }
    }
}

fn millis(duration: Duration) -> u64 {
    duration.as_millis() as u64
}

#[async_trait]
impl AdmissionStore for LocalStore {
    fn datastore(&self) -> Datastore {
        Datastore::Local
    }

    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn settings(&self) -> StoreSettings {
        self.shared.lock().settings.clone()
    }

    async fn ready(&self) -> StoreResult<()> {
        self.ensure_connected()
    }

    async fn submit(&self, queue_length: u64, weight: u64) -> StoreResult<SubmitOutcome> {
        tokio::task::yield_now().await;
        let now = self.shared.now();
        let mut state = self.shared.lock();

        if let Some(max_concurrent) = state.settings.max_concurrent {
            if weight > max_concurrent {
                return Err(StoreError::Overweight {
                    weight,
                    max_concurrent,
                });
            }
        }

        let reached_hwm = state
            .settings
            .high_water
            .is_some_and(|hwm| queue_length == hwm)
            && !state.check(weight, now);
        let strategy = state.settings.strategy;
        let blocked = strategy == Strategy::Block && (reached_hwm || state.is_blocked(now));

        if blocked {
            let penalty = millis(state.settings.computed_penalty());
            let unblock_time = now + penalty;
            state.unblock_time = Some(unblock_time);
            state.next_request = unblock_time + millis(state.settings.min_time);
            tracing::debug!(
                limiter_id = %self.shared.id,
                penalty_ms = penalty,
                "Limiter blocked"
            );
        }

        Ok(SubmitOutcome {
            reached_hwm,
            blocked,
            strategy,
        })
    }

    async fn register(
        &self,
        _index: &str,
        weight: u64,
        _expiration: Option<Duration>,
    ) -> StoreResult<RegisterOutcome> {
        tokio::task::yield_now().await;
        let now = self.shared.now();
        let mut state = self.shared.lock();

        if !state.conditions_check(weight) {
            return Ok(RegisterOutcome::rejected());
        }

        state.running += weight;
        if let Some(reservoir) = state.settings.reservoir.as_mut() {
            *reservoir = reservoir.saturating_sub(weight);
        }
        let wait = state.next_request.saturating_sub(now);
        state.next_request = now + wait + millis(state.settings.min_time);

        Ok(RegisterOutcome {
            success: true,
            wait: Duration::from_millis(wait),
            reservoir: state.settings.reservoir,
        })
    }

    async fn free(&self, _index: &str, weight: u64) -> StoreResult<u64> {
        tokio::task::yield_now().await;
        let (running, capacity) = {
            let mut state = self.shared.lock();
            state.running = state.running.saturating_sub(weight);
            state.done += weight;
            (state.running, state.drain_capacity())
        };
        self.shared.context.drain(capacity);
        Ok(running)
    }

    async fn check(&self, weight: u64) -> StoreResult<bool> {
        tokio::task::yield_now().await;
        let now = self.shared.now();
        Ok(self.shared.lock().check(weight, now))
    }

    async fn running(&self) -> StoreResult<u64> {
        tokio::task::yield_now().await;
        Ok(self.shared.lock().running)
    }

    async fn done(&self) -> StoreResult<u64> {
        tokio::task::yield_now().await;
        Ok(self.shared.lock().done)
    }

    async fn queued(&self) -> StoreResult<u64> {
        tokio::task::yield_now().await;
        Ok(self.shared.context.local_queued())
    }

    async fn current_reservoir(&self) -> StoreResult<Option<u64>> {
        tokio::task::yield_now().await;
        Ok(self.shared.lock().settings.reservoir)
    }

    async fn increment_reservoir(&self, amount: i64) -> StoreResult<Option<u64>> {
        tokio::task::yield_now().await;
        let (reservoir, capacity) = {
            let mut state = self.shared.lock();
            let current = state.settings.reservoir.unwrap_or(0) as i64;
            let mut next = (current + amount).max(0);
            if let Some(maximum) = state.settings.reservoir_increase_maximum {
                next = next.min((maximum as i64).max(current));
            }
            state.settings.reservoir = Some(next as u64);
            (state.settings.reservoir, state.drain_capacity())
        };
        self.shared.context.drain(capacity);
        Ok(reservoir)
    }

    async fn update_settings(&self, update: &StoreSettingsUpdate) -> StoreResult<()> {
        tokio::task::yield_now().await;
        let capacity = {
            let mut state = self.shared.lock();
            state.settings.apply(update);
            state.drain_capacity()
        };
        self.start_heartbeat();
        self.shared.context.drain(capacity);
        Ok(())
    }

    async fn group_check(&self) -> StoreResult<bool> {
        tokio::task::yield_now().await;
        let now = self.shared.now();
        let next_request = self.shared.lock().next_request;
        Ok(self
            .shared
            .group_timeout
            .is_some_and(|timeout| next_request + millis(timeout) < now))
    }

    async fn publish(&self, message: &str) -> StoreResult<()> {
        tokio::task::yield_now().await;
        self.shared
            .context
            .signal(StoreSignal::Message(message.to_string()));
        Ok(())
    }

    async fn disconnect(&self) -> StoreResult<()> {
        tokio::task::yield_now().await;
        let mut state = self.shared.lock();
        state.disconnected = true;
        if let Some(handle) = state.heartbeat.take() {
            handle.abort();
        }
        Ok(())
    }
}

impl Drop for LocalStore {
    fn drop(&mut self) {
        if let Some(handle) = self.shared.lock().heartbeat.take() {
            handle.abort();
        }
    }
}
