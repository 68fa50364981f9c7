use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;

use sluice_core::StoreSettingsUpdate;

use crate::backend::scripts::Keyspace;
use crate::backend::{AtomicBackend, InitOptions, Scope};
use crate::keys;
use crate::protocol::ChannelMessage;
use crate::traits::{RegisterOutcome, StoreError, StoreResult, SubmitOutcome};

const PUBSUB_CAPACITY: usize = 4096;

/// In-process host of the atomic backend protocol.
///
/// One mutex guards every keyspace, so each script runs atomically. Published
/// messages are delivered after the script's lock is released, in script order.
/// Clone the `Arc` to share one backend between limiters.
pub struct MemoryBackend {
    origin: Instant,
    keyspaces: Mutex<BTreeMap<String, Keyspace>>,
    pubsub: broadcast::Sender<ChannelMessage>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (pubsub, _) = broadcast::channel(PUBSUB_CAPACITY);
        Self {
            origin: Instant::now(),
            keyspaces: Mutex::new(BTreeMap::new()),
            pubsub,
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn now(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Keyspace>> {
        self.keyspaces.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drops keyspaces whose keys have expired.
    fn evict_expired(keyspaces: &mut BTreeMap<String, Keyspace>, now: u64) {
        keyspaces.retain(|_, keyspace| !keyspace.is_expired(now));
    }

    /// Runs `script` against the keyspace of `scope`, then publishes what it queued.
    fn run<T>(
        &self,
        scope: &Scope,
        script: impl FnOnce(&mut Keyspace, u64) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let now = self.now();
        let (result, outbox) = {
            let mut keyspaces = self.lock();
            Self::evict_expired(&mut keyspaces, now);
            let keyspace = keyspaces
                .get_mut(&scope.id)
                .ok_or_else(|| StoreError::SettingsKeyNotFound(scope.id.clone()))?;
            let result = script(keyspace, now);
            (result, keyspace.take_outbox())
        };
        self.deliver(outbox);
        result
    }

    fn deliver(&self, outbox: Vec<ChannelMessage>) {
        for message in outbox {
            // Nobody listening is fine
            let _ = self.pubsub.send(message);
        }
    }

    /// Number of live limiter keyspaces.
    pub fn limiter_count(&self) -> usize {
        let now = self.now();
        let mut keyspaces = self.lock();
        Self::evict_expired(&mut keyspaces, now);
        keyspaces.len()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("limiters", &self.lock().len())
            .field("subscribers", &self.pubsub.receiver_count())
            .finish()
    }
}

#[async_trait]
impl AtomicBackend for MemoryBackend {
    async fn init(&self, scope: &Scope, options: &InitOptions) -> StoreResult<()> {
        let now = self.now();
        let outbox = {
            let mut keyspaces = self.lock();
            Self::evict_expired(&mut keyspaces, now);
            if options.clear {
                keyspaces.remove(&scope.id);
            }
            match keyspaces.get_mut(&scope.id) {
                Some(keyspace) => {
                    keyspace.migrate(options, now)?;
                    keyspace.take_outbox()
                }
                None => {
                    keyspaces.insert(scope.id.clone(), Keyspace::create(&scope.id, options, now));
                    Vec::new()
                }
            }
        };
        self.deliver(outbox);
        Ok(())
    }

    async fn register_client(&self, scope: &Scope, queued: u64) -> StoreResult<()> {
        self.run(scope, |keyspace, now| {
            keyspace.register_client(&scope.client, queued, now);
            Ok(())
        })
    }

    async fn heartbeat(&self, scope: &Scope) -> StoreResult<()> {
        match self.run(scope, |keyspace, now| keyspace.heartbeat(&scope.client, now)) {
            // Nothing to keep alive until the next operation recreates the keys
            Err(StoreError::SettingsKeyNotFound(_)) => Ok(()),
            result => result,
        }
    }

    async fn check(&self, scope: &Scope, weight: u64) -> StoreResult<bool> {
        self.run(scope, |keyspace, now| {
            keyspace.check(&scope.client, weight, now)
        })
    }

    async fn register(
        &self,
        scope: &Scope,
        index: &str,
        weight: u64,
        expiration: Option<Duration>,
    ) -> StoreResult<RegisterOutcome> {
        self.run(scope, |keyspace, now| {
            keyspace.register(&scope.client, index, weight, expiration, now)
        })
    }

    async fn submit(
        &self,
        scope: &Scope,
        queue_length: u64,
        weight: u64,
    ) -> StoreResult<SubmitOutcome> {
        self.run(scope, |keyspace, now| {
            keyspace.submit(&scope.client, queue_length, weight, now)
        })
    }

    async fn free(&self, scope: &Scope, index: &str) -> StoreResult<u64> {
        self.run(scope, |keyspace, now| keyspace.free(&scope.client, index, now))
    }

    async fn running(&self, scope: &Scope) -> StoreResult<u64> {
        self.run(scope, |keyspace, now| keyspace.running(&scope.client, now))
    }

    async fn queued(&self, scope: &Scope) -> StoreResult<u64> {
        self.run(scope, |keyspace, now| keyspace.queued(&scope.client, now))
    }

    async fn done(&self, scope: &Scope) -> StoreResult<u64> {
        self.run(scope, |keyspace, now| keyspace.done(&scope.client, now))
    }

    async fn update_settings(
        &self,
        scope: &Scope,
        update: &StoreSettingsUpdate,
    ) -> StoreResult<()> {
        self.run(scope, |keyspace, now| {
            keyspace.update_settings(&scope.client, update, now)
        })
    }

    async fn increment_reservoir(&self, scope: &Scope, amount: i64) -> StoreResult<Option<u64>> {
        self.run(scope, |keyspace, now| {
            keyspace.increment_reservoir(&scope.client, amount, now)
        })
    }

    async fn current_reservoir(&self, scope: &Scope) -> StoreResult<Option<u64>> {
        self.run(scope, |keyspace, now| {
            keyspace.current_reservoir(&scope.client, now)
        })
    }

    async fn group_check(&self, scope: &Scope) -> StoreResult<bool> {
        let now = self.now();
        let mut keyspaces = self.lock();
        Self::evict_expired(&mut keyspaces, now);
        Ok(!keyspaces.contains_key(&scope.id))
    }

    async fn blacklist_client(&self, scope: &Scope, client: &str) -> StoreResult<()> {
        self.run(scope, |keyspace, now| {
            keyspace.blacklist_client(&scope.client, client, now)
        })
    }

    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<()> {
        self.deliver(vec![ChannelMessage {
            channel: channel.to_string(),
            payload: payload.to_string(),
        }]);
        Ok(())
    }

    async fn subscribe(
        &self,
        channels: &[String],
    ) -> StoreResult<BoxStream<'static, ChannelMessage>> {
        let channels: Arc<HashSet<String>> = Arc::new(channels.iter().cloned().collect());
        let rx = self.pubsub.subscribe();

        let messages = stream::unfold(rx, move |mut rx| {
            let channels = channels.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(message) if channels.contains(&message.channel) => {
                            return Some((message, rx))
                        }
                        Ok(_) => continue,
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "Channel subscriber lagged behind");
                        }
                        Err(RecvError::Closed) => return None,
                    }
                }
            }
        });
        Ok(messages.boxed())
    }

    async fn scan_keys(
        &self,
        pattern: &str,
        cursor: u64,
        count: usize,
    ) -> StoreResult<(u64, Vec<String>)> {
        let now = self.now();
        let names: Vec<String> = {
            let mut keyspaces = self.lock();
            Self::evict_expired(&mut keyspaces, now);
            keyspaces.values().flat_map(Keyspace::key_names).collect()
        };

        let start = cursor as usize;
        let end = start.saturating_add(count.max(1)).min(names.len());
        let page = names
            .get(start..end)
            .unwrap_or_default()
            .iter()
            .filter(|name| keys::glob_match(pattern, name))
            .cloned()
            .collect();
        let next = if end >= names.len() { 0 } else { end as u64 };
        Ok((next, page))
    }

    async fn delete_limiter_keys(&self, id: &str) -> StoreResult<u64> {
        let now = self.now();
        let mut keyspaces = self.lock();
        Self::evict_expired(&mut keyspaces, now);
        Ok(keyspaces
            .remove(id)
            .map(|keyspace| keyspace.key_names().len() as u64)
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::STORE_VERSION;
    use sluice_core::StoreSettings;

    fn init_options(settings: StoreSettings) -> InitOptions {
        InitOptions {
            clear: false,
            version: STORE_VERSION.to_string(),
            settings,
            client_timeout: Duration::from_secs(10),
            group_timeout: None,
        }
    }

    async fn ready(backend: &MemoryBackend, scope: &Scope, settings: StoreSettings) {
        backend.init(scope, &init_options(settings)).await.unwrap();
        backend.register_client(scope, 0).await.unwrap();
    }

    #[tokio::test]
    async fn missing_keys_are_reported() {
        let backend = MemoryBackend::new();
        let scope = Scope::new("api", "c1");
        assert!(matches!(
            backend.running(&scope).await,
            Err(StoreError::SettingsKeyNotFound(id)) if id == "api"
        ));
        assert!(backend.group_check(&scope).await.unwrap());
    }

    #[tokio::test]
    async fn init_keeps_existing_settings() {
        let backend = MemoryBackend::new();
        let scope = Scope::new("api", "c1");
        let first = StoreSettings {
            max_concurrent: Some(2),
            ..StoreSettings::default()
        };
        ready(&backend, &scope, first).await;
        backend
            .init(&scope, &init_options(StoreSettings::default()))
            .await
            .unwrap();
        assert!(backend.register(&scope, "a", 2, None).await.unwrap().success);
        assert!(!backend.register(&scope, "b", 1, None).await.unwrap().success);
    }

    #[tokio::test]
    async fn clear_wipes_the_keyspace() {
        let backend = MemoryBackend::new();
        let scope = Scope::new("api", "c1");
        ready(&backend, &scope, StoreSettings::default()).await;
        backend.register(&scope, "a", 1, None).await.unwrap();

        let mut options = init_options(StoreSettings::default());
        options.clear = true;
        backend.init(&scope, &options).await.unwrap();
        assert!(matches!(
            backend.running(&scope).await,
            Err(StoreError::UnknownClient(_))
        ));
    }

    #[tokio::test]
    async fn subscribers_only_see_their_channels() {
        let backend = MemoryBackend::new();
        let mut messages = backend
            .subscribe(&[keys::channel("api")])
            .await
            .unwrap();
        backend.publish("b_other", "message:x").await.unwrap();
        backend.publish("b_api", "message:y").await.unwrap();
        let received = messages.next().await.unwrap();
        assert_eq!(received.payload, "message:y");
    }

    #[tokio::test]
    async fn scan_pages_through_matching_keys() {
        let backend = MemoryBackend::new();
        for key in ["a", "b", "c"] {
            let scope = Scope::new(keys::group_limiter_id("g", key), "c1");
            ready(&backend, &scope, StoreSettings::default()).await;
        }
        let pattern = keys::group_settings_pattern("g");
        let mut cursor = 0;
        let mut found = Vec::new();
        loop {
            let (next, page) = backend.scan_keys(&pattern, cursor, 2).await.unwrap();
            found.extend(page);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        found.sort();
        assert_eq!(
            found,
            vec!["b_g-a_settings", "b_g-b_settings", "b_g-c_settings"]
        );

        assert!(backend.delete_limiter_keys("g-b").await.unwrap() > 0);
        assert_eq!(backend.limiter_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn keyspaces_expire_with_the_group_timeout() {
        let backend = MemoryBackend::new();
        let scope = Scope::new("api", "c1");
        let mut options = init_options(StoreSettings::default());
        options.group_timeout = Some(Duration::from_millis(500));
        backend.init(&scope, &options).await.unwrap();
        backend.register_client(&scope, 0).await.unwrap();
        assert!(!backend.group_check(&scope).await.unwrap());

        tokio::time::advance(Duration::from_millis(600)).await;
        assert!(backend.group_check(&scope).await.unwrap());
        assert!(matches!(
            backend.running(&scope).await,
            Err(StoreError::SettingsKeyNotFound(_))
        ));
    }

    #[tokio::test]
    async fn heartbeat_without_keys_is_a_no_op() {
        let backend = MemoryBackend::new();
        let scope = Scope::new("never-initialized", "c1");
        backend.heartbeat(&scope).await.unwrap();
        assert_eq!(backend.limiter_count(), 0);
    }
}
