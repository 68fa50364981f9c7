//! Keyed limiter groups
//!
//! A [`Group`] hands out one [`Limiter`] per key, created on first use from the
//! group's limiter template with the id `<group id>-<key>`. A background sweep
//! disposes of limiters whose store reports them idle past the group timeout.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::AbortHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use sluice_core::{Datastore, GroupSettings, GroupSettingsUpdate, LimiterError, LimiterSettings};
use sluice_store::{keys, AtomicBackend};

use crate::job::lock;
use crate::limiter::Limiter;

/// Keys requested per page when listing a group's limiters in a shared store.
pub const CLUSTER_SCAN_COUNT: usize = 10_000;

const GROUP_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum GroupEvent {
    /// A limiter was created for `key`.
    Created { key: String, limiter: Limiter },
}

struct GroupEntry {
    limiter: Limiter,
    last_access: Instant,
}

struct GroupInner {
    settings: Mutex<GroupSettings>,
    backend: Option<Arc<dyn AtomicBackend>>,
    limiters: Mutex<HashMap<String, GroupEntry>>,
    events: broadcast::Sender<GroupEvent>,
    sweeper: Mutex<Option<AbortHandle>>,
}

impl Drop for GroupInner {
    fn drop(&mut self) {
        if let Some(sweeper) = lock(&self.sweeper).take() {
            sweeper.abort();
        }
    }
}

async fn sweep_loop(inner: Weak<GroupInner>, period: Duration) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        Group { inner }.sweep().await;
    }
}

#[derive(Clone)]
pub struct Group {
    inner: Arc<GroupInner>,
}

impl std::fmt::Debug for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Group")
            .field("id", &self.id())
            .field("keys", &self.keys())
            .finish()
    }
}

impl Group {
    /// Group of local limiters. Must be called within a Tokio runtime.
    pub fn new(settings: GroupSettings) -> Result<Self, LimiterError> {
        Self::build(settings, None)
    }

    /// Group whose distributed limiters all share `backend`.
    pub fn with_backend(
        settings: GroupSettings,
        backend: Arc<dyn AtomicBackend>,
    ) -> Result<Self, LimiterError> {
        Self::build(settings, Some(backend))
    }

    fn build(
        settings: GroupSettings,
        backend: Option<Arc<dyn AtomicBackend>>,
    ) -> Result<Self, LimiterError> {
        settings
            .validate()
            .map_err(|e| LimiterError::Config(e.to_string()))?;
        if settings.limiter.datastore == Datastore::Distributed && backend.is_none() {
            return Err(LimiterError::Config(
                "distributed group requires a shared backend".to_string(),
            ));
        }

        let (events, _) = broadcast::channel(GROUP_EVENT_CAPACITY);
        let group = Self {
            inner: Arc::new(GroupInner {
                settings: Mutex::new(settings),
                backend,
                limiters: Mutex::new(HashMap::new()),
                events,
                sweeper: Mutex::new(None),
            }),
        };
        group.start_sweep();
        Ok(group)
    }

    pub fn id(&self) -> String {
        lock(&self.inner.settings).id.clone()
    }

    fn limiter_settings(&self, key: &str) -> LimiterSettings {
        let settings = lock(&self.inner.settings);
        let mut limiter = settings.limiter.clone();
        limiter.id = keys::group_limiter_id(&settings.id, key);
        limiter.timeout = settings.timeout;
        limiter
    }

    /// The limiter for `key`, created on first use.
    pub fn key(&self, key: &str) -> Result<Limiter, LimiterError> {
        let mut limiters = lock(&self.inner.limiters);
        if let Some(entry) = limiters.get_mut(key) {
            entry.last_access = Instant::now();
            return Ok(entry.limiter.clone());
        }

        let settings = self.limiter_settings(key);
        let limiter = match (&self.inner.backend, settings.datastore) {
            (Some(backend), Datastore::Distributed) => {
                Limiter::with_backend(settings, Arc::clone(backend))?
            }
            _ => Limiter::new(settings)?,
        };
        limiters.insert(
            key.to_string(),
            GroupEntry {
                limiter: limiter.clone(),
                last_access: Instant::now(),
            },
        );
        drop(limiters);

        tracing::debug!(group_id = %self.id(), key, "Created group limiter");
        let _ = self.inner.events.send(GroupEvent::Created {
            key: key.to_string(),
            limiter: limiter.clone(),
        });
        Ok(limiter)
    }

    /// Disposes of the limiter for `key` and deletes its shared keys. Returns
    /// whether anything existed.
    pub async fn delete_key(&self, key: &str) -> Result<bool, LimiterError> {
        let mut deleted = 0;
        if let Some(backend) = &self.inner.backend {
            let id = keys::group_limiter_id(&self.id(), key);
            deleted = backend.delete_limiter_keys(&id).await?;
        }

        let entry = lock(&self.inner.limiters).remove(key);
        let existed = entry.is_some();
        if let Some(entry) = entry {
            entry.limiter.disconnect().await?;
            tracing::debug!(group_id = %self.id(), key, "Deleted group limiter");
        }
        Ok(existed || deleted > 0)
    }

    /// Keys with a limiter in this process.
    pub fn keys(&self) -> Vec<String> {
        lock(&self.inner.limiters).keys().cloned().collect()
    }

    pub fn limiters(&self) -> Vec<(String, Limiter)> {
        lock(&self.inner.limiters)
            .iter()
            .map(|(key, entry)| (key.clone(), entry.limiter.clone()))
            .collect()
    }

    pub fn last_access(&self, key: &str) -> Option<Instant> {
        lock(&self.inner.limiters)
            .get(key)
            .map(|entry| entry.last_access)
    }

    /// Keys with a limiter in any process sharing the backend.
    pub async fn cluster_keys(&self) -> Result<Vec<String>, LimiterError> {
        let Some(backend) = &self.inner.backend else {
            return Ok(self.keys());
        };
        let group_id = self.id();
        let pattern = keys::group_settings_pattern(&group_id);

        let mut found = Vec::new();
        let mut cursor = 0;
        loop {
            let (next, page) = backend
                .scan_keys(&pattern, cursor, CLUSTER_SCAN_COUNT)
                .await?;
            found.extend(
                page.iter()
                    .filter_map(|name| keys::group_key_from_settings_key(&group_id, name))
                    .map(str::to_string),
            );
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(found)
    }

    /// Changes the template for limiters created from now on.
    pub fn update_settings(&self, update: GroupSettingsUpdate) -> Result<(), LimiterError> {
        {
            let mut settings = lock(&self.inner.settings);
            let mut candidate = settings.clone();
            candidate.limiter.apply(&update.limiter);
            if let Some(timeout) = update.timeout {
                candidate.timeout = timeout;
            }
            candidate
                .validate()
                .map_err(|e| LimiterError::Config(e.to_string()))?;
            *settings = candidate;
        }
        if update.timeout.is_some() {
            self.start_sweep();
        }
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GroupEvent> {
        self.inner.events.subscribe()
    }

    /// Stops the sweep and disconnects every limiter.
    pub async fn disconnect(&self) -> Result<(), LimiterError> {
        if let Some(sweeper) = lock(&self.inner.sweeper).take() {
            sweeper.abort();
        }
        let entries: Vec<GroupEntry> = lock(&self.inner.limiters)
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        for entry in entries {
            entry.limiter.disconnect().await?;
        }
        Ok(())
    }

    fn start_sweep(&self) {
        let timeout = lock(&self.inner.settings).timeout;
        let mut sweeper = lock(&self.inner.sweeper);
        if let Some(previous) = sweeper.take() {
            previous.abort();
        }
        let Some(timeout) = timeout else {
            return;
        };
        let period = (timeout / 2).max(Duration::from_millis(1));
        let handle = tokio::spawn(sweep_loop(Arc::downgrade(&self.inner), period));
        *sweeper = Some(handle.abort_handle());
    }

    /// Deletes every limiter whose store reports it idle. Returns how many went.
    async fn sweep(&self) -> usize {
        let mut removed = 0;
        for (key, limiter) in self.limiters() {
            let idle = match limiter.group_check().await {
                Ok(idle) => idle,
                Err(error) => {
                    limiter.report_error(error);
                    continue;
                }
            };
            if !idle {
                continue;
            }
            match self.delete_key(&key).await {
                Ok(_) => removed += 1,
                Err(error) => limiter.report_error(error),
            }
        }
        if removed > 0 {
            tracing::debug!(group_id = %self.id(), removed, "Swept idle limiters");
        }
        removed
    }
}
