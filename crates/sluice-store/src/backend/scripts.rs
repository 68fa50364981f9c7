//! Atomic scripts over one limiter's shared keyspace.
//!
//! A [`Keyspace`] holds everything stored under a limiter's `b_{id}_*` keys.
//! Each public method is one script: the backend runs it under its lock and
//! then publishes the messages the script queued. Times are milliseconds on
//! the backend's clock.

use std::collections::HashMap;
use std::time::Duration;

use sluice_core::{StoreSettings, StoreSettingsUpdate, Strategy};

use crate::backend::InitOptions;
use crate::keys;
use crate::protocol::{ChannelMessage, StoreMessage};
use crate::traits::{RegisterOutcome, StoreError, StoreResult, SubmitOutcome};

fn millis(duration: Duration) -> u64 {
    duration.as_millis() as u64
}

fn major(version: &str) -> &str {
    version.split('.').next().unwrap_or(version)
}

/// Result of [`Keyspace::process_tick`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    pub capacity: Option<i64>,
    pub running: u64,
    pub reservoir: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct Keyspace {
    id: String,
    version: String,
    settings: StoreSettings,
    client_timeout: u64,
    group_timeout: Option<u64>,
    running: u64,
    done: u64,
    next_request: u64,
    unblock_time: Option<u64>,
    last_reservoir_refresh: u64,
    last_reservoir_increase: u64,
    capacity_priority_counter: u64,
    job_weights: HashMap<String, u64>,
    job_expirations: HashMap<String, u64>,
    job_clients: HashMap<String, String>,
    client_running: HashMap<String, u64>,
    client_num_queued: HashMap<String, u64>,
    client_last_registered: HashMap<String, u64>,
    /// `None` marks a blacklisted client: treated as unseen since forever.
    client_last_seen: HashMap<String, Option<u64>>,
    expires_at: Option<u64>,
    outbox: Vec<ChannelMessage>,
}

impl Keyspace {
    /// `init` on a missing keyspace.
    pub fn create(id: &str, options: &InitOptions, now: u64) -> Self {
        let mut keyspace = Self {
            id: id.to_string(),
            version: options.version.clone(),
            settings: options.settings.clone(),
            client_timeout: millis(options.client_timeout),
            group_timeout: options.group_timeout.map(millis),
            running: 0,
            done: 0,
            next_request: now,
            unblock_time: None,
            last_reservoir_refresh: now,
            last_reservoir_increase: now,
            capacity_priority_counter: 0,
            job_weights: HashMap::new(),
            job_expirations: HashMap::new(),
            job_clients: HashMap::new(),
            client_running: HashMap::new(),
            client_num_queued: HashMap::new(),
            client_last_registered: HashMap::new(),
            client_last_seen: HashMap::new(),
            expires_at: None,
            outbox: Vec::new(),
        };
        keyspace.touch(now);
        keyspace
    }

    /// `init` on an existing keyspace: accept data from the same major
    /// version, recording the new version, then process a tick.
    pub fn migrate(&mut self, options: &InitOptions, now: u64) -> StoreResult<()> {
        if self.version != options.version {
            if major(&self.version) != major(&options.version) {
                return Err(StoreError::IncompatibleVersion {
                    found: self.version.clone(),
                    expected: options.version.clone(),
                });
            }
            tracing::info!(
                limiter_id = %self.id,
                from = %self.version,
                to = %options.version,
                "Migrating shared limiter keys"
            );
            self.version = options.version.clone();
        }
        self.process_tick(now, false);
        self.touch(now);
        Ok(())
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn settings(&self) -> &StoreSettings {
        &self.settings
    }

    /// Names of the keys that currently hold data.
    pub fn key_names(&self) -> Vec<String> {
        let present = [
            true,
            !self.job_weights.is_empty(),
            !self.job_expirations.is_empty(),
            !self.job_clients.is_empty(),
            !self.client_running.is_empty(),
            !self.client_num_queued.is_empty(),
            !self.client_last_registered.is_empty(),
            !self.client_last_seen.is_empty(),
        ];
        keys::KEY_SUFFIXES
            .iter()
            .zip(present)
            .filter(|(_, present)| *present)
            .map(|(suffix, _)| keys::key(&self.id, suffix))
            .collect()
    }

    /// Messages queued by the scripts run so far.
    pub fn take_outbox(&mut self) -> Vec<ChannelMessage> {
        std::mem::take(&mut self.outbox)
    }

    fn publish(&mut self, channel: String, message: StoreMessage) {
        self.outbox.push(ChannelMessage {
            channel,
            payload: message.to_string(),
        });
    }

    /// Keys expire `group_timeout` after `base`.
    fn refresh_expiration(&mut self, base: u64) {
        if let Some(timeout) = self.group_timeout {
            self.expires_at = Some(base + timeout);
        }
    }

    fn touch(&mut self, now: u64) {
        self.refresh_expiration(now);
    }

    fn compute_capacity(&self, running: u64, reservoir: Option<u64>) -> Option<i64> {
        let running = running as i64;
        match (self.settings.max_concurrent, reservoir) {
            (Some(max), Some(reservoir)) => Some((max as i64 - running).min(reservoir as i64)),
            (Some(max), None) => Some(max as i64 - running),
            (None, Some(reservoir)) => Some(reservoir as i64),
            (None, None) => None,
        }
    }

    fn conditions_check(capacity: Option<i64>, weight: u64) -> bool {
        capacity.map_or(true, |capacity| weight as i64 <= capacity)
    }

    fn is_responsive(&self, client: &str, now: u64) -> bool {
        self.client_last_seen
            .get(client)
            .copied()
            .flatten()
            .is_some_and(|seen| seen + self.client_timeout > now)
    }

    /// Releases registered jobs. Returns the total weight released.
    fn release(&mut self, indexes: &[String]) -> u64 {
        let mut total = 0;
        for index in indexes {
            self.job_expirations.remove(index);
            let weight = self.job_weights.remove(index).unwrap_or(0);
            let client = self.job_clients.remove(index);
            if weight == 0 {
                continue;
            }
            total += weight;
            if let Some(running) = client.and_then(|c| self.client_running.get_mut(&c)) {
                *running = running.saturating_sub(weight);
            }
        }
        self.running = self.running.saturating_sub(total);
        self.done += total;
        total
    }

    /// Housekeeping shared by every script: expire jobs, replenish the
    /// reservoir, forget dead clients and announce capacity growth.
    pub fn process_tick(&mut self, now: u64, always_publish: bool) -> Tick {
        self.tick_releasing(now, always_publish, &[])
    }

    /// [`Keyspace::process_tick`] that also releases `finished` jobs, counted
    /// as capacity gained during this tick.
    fn tick_releasing(&mut self, now: u64, always_publish: bool, finished: &[String]) -> Tick {
        let initial_capacity = self.compute_capacity(self.running, self.settings.reservoir);

        if !finished.is_empty() {
            self.release(finished);
        }
        let expired: Vec<String> = self
            .job_expirations
            .iter()
            .filter(|(_, at)| **at < now)
            .map(|(index, _)| index.clone())
            .collect();
        if !expired.is_empty() {
            let released = self.release(&expired);
            tracing::debug!(
                limiter_id = %self.id,
                jobs = expired.len(),
                released,
                "Expired shared jobs"
            );
        }

        if let (Some(interval), Some(amount)) = (
            self.settings.reservoir_refresh_interval,
            self.settings.reservoir_refresh_amount,
        ) {
            if now >= self.last_reservoir_refresh + millis(interval) {
                self.settings.reservoir = Some(amount);
                self.last_reservoir_refresh = now;
            }
        }

        if let (Some(interval), Some(amount)) = (
            self.settings.reservoir_increase_interval,
            self.settings.reservoir_increase_amount,
        ) {
            let interval = millis(interval).max(1);
            if now >= self.last_reservoir_increase + interval {
                let intervals = (now - self.last_reservoir_increase) / interval;
                let current = self.settings.reservoir.unwrap_or(0) as i64;
                let mut incr = (amount * intervals) as i64;
                if let Some(maximum) = self.settings.reservoir_increase_maximum {
                    incr = incr.min(maximum as i64 - current);
                }
                if incr > 0 {
                    self.settings.reservoir = Some((current + incr) as u64);
                }
                self.last_reservoir_increase += intervals * interval;
            }
        }

        let terminated: Vec<String> = self
            .client_last_seen
            .keys()
            .filter(|client| !self.is_responsive(client, now))
            .filter(|client| self.client_running.get(*client).copied().unwrap_or(0) == 0)
            .cloned()
            .collect();
        for client in &terminated {
            self.client_running.remove(client);
            self.client_num_queued.remove(client);
            self.client_last_registered.remove(client);
            self.client_last_seen.remove(client);
        }
        if !terminated.is_empty() {
            tracing::info!(
                limiter_id = %self.id,
                clients = ?terminated,
                "Removed unresponsive clients"
            );
        }

        let final_capacity = self.compute_capacity(self.running, self.settings.reservoir);
        let channel = keys::channel(&self.id);
        let as_field = |capacity: Option<i64>| capacity.map(|c| c.max(0) as u64);

        if always_publish || (initial_capacity.is_some() && final_capacity.is_none()) {
            self.publish(channel, StoreMessage::Capacity(as_field(final_capacity)));
        } else if let (Some(initial), Some(fin)) = (initial_capacity, final_capacity) {
            if fin > initial {
                match self.priority_client(now) {
                    Some(client) => {
                        let counter = self.capacity_priority_counter;
                        self.capacity_priority_counter += 1;
                        self.publish(
                            channel,
                            StoreMessage::CapacityPriority {
                                capacity: as_field(final_capacity),
                                client,
                                counter,
                            },
                        );
                    }
                    None => self.publish(channel, StoreMessage::Capacity(as_field(final_capacity))),
                }
            }
        }

        Tick {
            capacity: final_capacity,
            running: self.running,
            reservoir: self.settings.reservoir,
        }
    }

    /// The responsive client with queued work and the lowest running weight.
    /// Ties go to the client that registered a job least recently.
    fn priority_client(&self, now: u64) -> Option<String> {
        let mut by_running: Vec<(&String, u64)> = self
            .client_running
            .iter()
            .map(|(client, running)| (client, *running))
            .collect();
        by_running.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(b.0)));

        let mut lowest = None;
        let mut candidates = Vec::new();
        for (client, running) in by_running {
            let eligible = lowest.map_or(true, |value| value == running)
                && self.is_responsive(client, now)
                && self.client_num_queued.get(client).copied().unwrap_or(0) > 0;
            if eligible {
                lowest = Some(running);
                candidates.push(client);
            }
        }

        let mut best: Option<(&String, u64)> = None;
        for client in candidates {
            let registered = self.client_last_registered.get(client).copied().unwrap_or(0);
            if best.map_or(true, |(_, earliest)| registered < earliest) {
                best = Some((client, registered));
            }
        }
        best.map(|(client, _)| client.clone())
    }

    pub fn validate_client(&mut self, client: &str, now: u64) -> StoreResult<()> {
        match self.client_last_seen.get_mut(client) {
            Some(seen) => {
                *seen = Some(now);
                Ok(())
            }
            None => Err(StoreError::UnknownClient(client.to_string())),
        }
    }

    pub fn register_client(&mut self, client: &str, queued: u64, now: u64) {
        self.client_running.insert(client.to_string(), 0);
        self.client_num_queued.insert(client.to_string(), queued);
        self.client_last_registered.insert(client.to_string(), 0);
        self.client_last_seen.insert(client.to_string(), Some(now));
    }

    pub fn heartbeat(&mut self, client: &str, now: u64) -> StoreResult<()> {
        self.validate_client(client, now)?;
        self.process_tick(now, true);
        Ok(())
    }

    pub fn check(&mut self, client: &str, weight: u64, now: u64) -> StoreResult<bool> {
        self.validate_client(client, now)?;
        let tick = self.process_tick(now, false);
        Ok(Self::conditions_check(tick.capacity, weight) && self.next_request <= now)
    }

    pub fn register(
        &mut self,
        client: &str,
        index: &str,
        weight: u64,
        expiration: Option<Duration>,
        now: u64,
    ) -> StoreResult<RegisterOutcome> {
        self.validate_client(client, now)?;
        let tick = self.process_tick(now, false);
        if !Self::conditions_check(tick.capacity, weight) {
            return Ok(RegisterOutcome::rejected());
        }

        self.running += weight;
        self.job_weights.insert(index.to_string(), weight);
        if let Some(expiration) = expiration {
            self.job_expirations
                .insert(index.to_string(), now + millis(expiration));
        }
        self.job_clients.insert(index.to_string(), client.to_string());
        *self.client_running.entry(client.to_string()).or_insert(0) += weight;
        if let Some(queued) = self.client_num_queued.get_mut(client) {
            *queued = queued.saturating_sub(1);
        }
        self.client_last_registered.insert(client.to_string(), now);

        let wait = self.next_request.saturating_sub(now);
        self.next_request = now + wait + millis(self.settings.min_time);
        if let Some(reservoir) = self.settings.reservoir.as_mut() {
            *reservoir = reservoir.saturating_sub(weight);
        }
        self.refresh_expiration(self.next_request);

        Ok(RegisterOutcome {
            success: true,
            wait: Duration::from_millis(wait),
            reservoir: self.settings.reservoir,
        })
    }

    pub fn submit(
        &mut self,
        client: &str,
        queue_length: u64,
        weight: u64,
        now: u64,
    ) -> StoreResult<SubmitOutcome> {
        self.validate_client(client, now)?;
        let tick = self.process_tick(now, false);

        if let Some(max_concurrent) = self.settings.max_concurrent {
            if weight > max_concurrent {
                return Err(StoreError::Overweight {
                    weight,
                    max_concurrent,
                });
            }
        }

        let reached_hwm = self
            .settings
            .high_water
            .is_some_and(|hwm| queue_length == hwm)
            && !(Self::conditions_check(tick.capacity, weight) && self.next_request <= now);
        let strategy = self.settings.strategy;
        let blocked = strategy == Strategy::Block
            && (reached_hwm || self.unblock_time.is_some_and(|until| until >= now));

        if blocked {
            let unblock_time = now + millis(self.settings.computed_penalty());
            self.unblock_time = Some(unblock_time);
            self.next_request = unblock_time + millis(self.settings.min_time);
            for queued in self.client_num_queued.values_mut() {
                *queued = 0;
            }
            self.publish(keys::channel(&self.id), StoreMessage::Blocked);
            self.refresh_expiration(self.next_request);
        }

        if !blocked && !reached_hwm {
            *self.client_num_queued.entry(client.to_string()).or_insert(0) += 1;
        }

        Ok(SubmitOutcome {
            reached_hwm,
            blocked,
            strategy,
        })
    }

    pub fn free(&mut self, client: &str, index: &str, now: u64) -> StoreResult<u64> {
        self.validate_client(client, now)?;
        Ok(self
            .tick_releasing(now, false, &[index.to_string()])
            .running)
    }

    pub fn running(&mut self, client: &str, now: u64) -> StoreResult<u64> {
        self.validate_client(client, now)?;
        Ok(self.process_tick(now, false).running)
    }

    pub fn queued(&mut self, client: &str, now: u64) -> StoreResult<u64> {
        self.validate_client(client, now)?;
        Ok(self
            .client_num_queued
            .iter()
            .filter(|(client, _)| self.is_responsive(client, now))
            .map(|(_, queued)| *queued)
            .sum())
    }

    pub fn done(&mut self, client: &str, now: u64) -> StoreResult<u64> {
        self.validate_client(client, now)?;
        self.process_tick(now, false);
        Ok(self.done)
    }

    pub fn current_reservoir(&mut self, client: &str, now: u64) -> StoreResult<Option<u64>> {
        self.validate_client(client, now)?;
        Ok(self.process_tick(now, false).reservoir)
    }

    pub fn increment_reservoir(
        &mut self,
        client: &str,
        amount: i64,
        now: u64,
    ) -> StoreResult<Option<u64>> {
        self.validate_client(client, now)?;
        let current = self.settings.reservoir.unwrap_or(0) as i64;
        let mut next = (current + amount).max(0);
        if let Some(maximum) = self.settings.reservoir_increase_maximum {
            next = next.min((maximum as i64).max(current));
        }
        self.settings.reservoir = Some(next as u64);
        let tick = self.process_tick(now, true);
        self.touch(now);
        Ok(tick.reservoir)
    }

    pub fn update_settings(
        &mut self,
        client: &str,
        update: &StoreSettingsUpdate,
        now: u64,
    ) -> StoreResult<()> {
        self.validate_client(client, now)?;
        self.settings.apply(update);
        self.process_tick(now, true);
        self.touch(now);
        Ok(())
    }

    pub fn blacklist_client(&mut self, client: &str, blacklisted: &str, now: u64) -> StoreResult<()> {
        self.validate_client(client, now)?;
        if let Some(seen) = self.client_last_seen.get_mut(blacklisted) {
            *seen = None;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(settings: StoreSettings) -> InitOptions {
        InitOptions {
            clear: false,
            version: "1.2.0".to_string(),
            settings,
            client_timeout: Duration::from_millis(10_000),
            group_timeout: None,
        }
    }

    fn keyspace(settings: StoreSettings) -> Keyspace {
        let mut keyspace = Keyspace::create("api", &options(settings), 0);
        keyspace.register_client("c1", 0, 0);
        keyspace
    }

    fn payloads(keyspace: &mut Keyspace) -> Vec<String> {
        keyspace
            .take_outbox()
            .into_iter()
            .map(|m| m.payload)
            .collect()
    }

    #[test]
    fn unknown_clients_are_rejected() {
        let mut keyspace = keyspace(StoreSettings::default());
        assert!(matches!(
            keyspace.check("ghost", 1, 5),
            Err(StoreError::UnknownClient(c)) if c == "ghost"
        ));
    }

    #[test]
    fn expired_jobs_release_their_weight() {
        let mut keyspace = keyspace(StoreSettings {
            max_concurrent: Some(2),
            ..StoreSettings::default()
        });
        let outcome = keyspace
            .register("c1", "j1", 2, Some(Duration::from_millis(100)), 10)
            .unwrap();
        assert!(outcome.success);
        assert_eq!(keyspace.running("c1", 50).unwrap(), 2);
        assert_eq!(keyspace.running("c1", 111).unwrap(), 0);
        assert_eq!(keyspace.done("c1", 112).unwrap(), 2);
    }

    #[test]
    fn free_announces_capacity_growth() {
        let mut keyspace = keyspace(StoreSettings {
            max_concurrent: Some(1),
            ..StoreSettings::default()
        });
        keyspace.register("c1", "j1", 1, None, 1).unwrap();
        keyspace.take_outbox();
        assert_eq!(keyspace.free("c1", "j1", 2).unwrap(), 0);
        // c1 has nothing queued, so the capacity goes to everyone
        assert_eq!(payloads(&mut keyspace), vec!["capacity:1"]);
    }

    #[test]
    fn capacity_priority_targets_the_idlest_client_with_work() {
        let mut keyspace = keyspace(StoreSettings {
            max_concurrent: Some(3),
            ..StoreSettings::default()
        });
        keyspace.register_client("c2", 0, 0);
        keyspace.register_client("c3", 0, 0);
        for client in ["c1", "c2", "c3"] {
            keyspace.submit(client, 0, 1, 1).unwrap();
        }
        keyspace.register("c1", "a", 1, None, 2).unwrap();
        keyspace.register("c1", "b", 1, None, 3).unwrap();
        keyspace.register("c3", "c", 1, None, 4).unwrap();
        keyspace.submit("c1", 0, 1, 5).unwrap();
        keyspace.submit("c3", 0, 1, 5).unwrap();
        keyspace.take_outbox();

        keyspace.free("c1", "a", 6).unwrap();
        assert_eq!(
            payloads(&mut keyspace),
            vec!["capacity-priority:1:c2:0"]
        );
    }

    #[test]
    fn block_resets_queued_counts_and_broadcasts() {
        let mut keyspace = keyspace(StoreSettings {
            max_concurrent: Some(1),
            high_water: Some(1),
            strategy: Strategy::Block,
            penalty: Some(Duration::from_millis(500)),
            ..StoreSettings::default()
        });
        keyspace.register("c1", "a", 1, None, 1).unwrap();
        keyspace.submit("c1", 0, 1, 2).unwrap();
        assert_eq!(keyspace.queued("c1", 2).unwrap(), 1);

        let outcome = keyspace.submit("c1", 1, 1, 3).unwrap();
        assert!(outcome.reached_hwm && outcome.blocked);
        assert_eq!(keyspace.queued("c1", 3).unwrap(), 0);
        assert_eq!(payloads(&mut keyspace), vec!["blocked:"]);
        assert!(keyspace.submit("c1", 0, 1, 400).unwrap().blocked);
    }

    #[test]
    fn increase_catches_up_on_missed_intervals() {
        let mut keyspace = keyspace(StoreSettings {
            reservoir: Some(0),
            reservoir_increase_interval: Some(Duration::from_millis(100)),
            reservoir_increase_amount: Some(2),
            reservoir_increase_maximum: Some(7),
            ..StoreSettings::default()
        });
        assert_eq!(keyspace.current_reservoir("c1", 350).unwrap(), Some(6));
        assert_eq!(keyspace.current_reservoir("c1", 1000).unwrap(), Some(7));
    }

    #[test]
    fn silent_clients_are_purged() {
        let mut keyspace = keyspace(StoreSettings::default());
        keyspace.register_client("c2", 3, 0);
        keyspace.heartbeat("c1", 9_000).unwrap();
        keyspace.heartbeat("c1", 10_500).unwrap();
        assert!(matches!(
            keyspace.check("c2", 1, 10_600),
            Err(StoreError::UnknownClient(_))
        ));
    }

    #[test]
    fn blacklisted_clients_lose_priority() {
        let mut keyspace = keyspace(StoreSettings::default());
        keyspace.register_client("c2", 0, 0);
        keyspace.blacklist_client("c1", "c2", 1).unwrap();
        assert!(!keyspace.is_responsive("c2", 1));
        keyspace.validate_client("c2", 2).unwrap();
        assert!(keyspace.is_responsive("c2", 2));
    }

    #[test]
    fn migrate_accepts_same_major_only() {
        let mut keyspace = keyspace(StoreSettings::default());
        let mut newer = options(StoreSettings::default());
        newer.version = "1.9.3".to_string();
        keyspace.migrate(&newer, 1).unwrap();
        assert_eq!(keyspace.version(), "1.9.3");

        newer.version = "2.0.0".to_string();
        assert!(matches!(
            keyspace.migrate(&newer, 2),
            Err(StoreError::IncompatibleVersion { .. })
        ));
    }

    #[test]
    fn keys_expire_after_the_group_timeout() {
        let mut init = options(StoreSettings::default());
        init.group_timeout = Some(Duration::from_millis(1000));
        let mut keyspace = Keyspace::create("api", &init, 0);
        keyspace.register_client("c1", 0, 0);
        keyspace.register("c1", "a", 1, None, 200).unwrap();
        assert!(!keyspace.is_expired(1100));
        assert!(keyspace.is_expired(1200));
    }
}
