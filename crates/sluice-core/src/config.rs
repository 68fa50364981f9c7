//! Configuration module
//!
//! Settings for admission stores, limiters and groups. Every struct has a
//! `Default` matching the documented defaults; [`LimiterSettings::from_env`]
//! builds limiter settings from `SLUICE_*` environment variables (and `.env`).

use serde::{Deserialize, Serialize};
use std::env;
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;
use std::time::Duration;

use crate::models::{Strategy, DEFAULT_JOB_ID};

const DEFAULT_PENALTY_MS: u64 = 5000;
const PENALTY_MIN_TIME_FACTOR: u32 = 15;
const LOCAL_HEARTBEAT_INTERVAL_MS: u64 = 250;
const DISTRIBUTED_HEARTBEAT_INTERVAL_MS: u64 = 5000;
const CLIENT_TIMEOUT_MS: u64 = 10_000;
const GROUP_TIMEOUT_SECS: u64 = 5 * 60;
const DEFAULT_GROUP_ID: &str = "group-key";

/// Where admission accounting lives.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Datastore {
    /// In-process counters.
    #[default]
    Local,
    /// Shared counters behind an atomic backend, enforced across processes.
    Distributed,
}

impl Display for Datastore {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            Datastore::Local => write!(f, "local"),
            Datastore::Distributed => write!(f, "distributed"),
        }
    }
}

impl FromStr for Datastore {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(Datastore::Local),
            "distributed" => Ok(Datastore::Distributed),
            _ => Err(anyhow::anyhow!("Invalid datastore type: {}", s)),
        }
    }
}

/// Limits enforced by an admission store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSettings {
    pub max_concurrent: Option<u64>,
    pub min_time: Duration,
    pub high_water: Option<u64>,
    pub strategy: Strategy,
    pub penalty: Option<Duration>,
    pub reservoir: Option<u64>,
    pub reservoir_refresh_interval: Option<Duration>,
    pub reservoir_refresh_amount: Option<u64>,
    pub reservoir_increase_interval: Option<Duration>,
    pub reservoir_increase_amount: Option<u64>,
    pub reservoir_increase_maximum: Option<u64>,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            max_concurrent: None,
            min_time: Duration::ZERO,
            high_water: None,
            strategy: Strategy::Leak,
            penalty: None,
            reservoir: None,
            reservoir_refresh_interval: None,
            reservoir_refresh_amount: None,
            reservoir_increase_interval: None,
            reservoir_increase_amount: None,
            reservoir_increase_maximum: None,
        }
    }
}

impl StoreSettings {
    /// Penalty applied when a BLOCK limiter blocks: the configured penalty,
    /// else 15 × `min_time`, else 5 s.
    pub fn computed_penalty(&self) -> Duration {
        match self.penalty {
            Some(penalty) => penalty,
            None if self.min_time.is_zero() => Duration::from_millis(DEFAULT_PENALTY_MS),
            None => self.min_time * PENALTY_MIN_TIME_FACTOR,
        }
    }

    pub fn refresh_active(&self) -> bool {
        self.reservoir_refresh_interval.is_some() && self.reservoir_refresh_amount.is_some()
    }

    pub fn increase_active(&self) -> bool {
        self.reservoir_increase_interval.is_some() && self.reservoir_increase_amount.is_some()
    }

    pub fn apply(&mut self, update: &StoreSettingsUpdate) {
        if let Some(v) = update.max_concurrent {
            self.max_concurrent = v;
        }
        if let Some(v) = update.min_time {
            self.min_time = v;
        }
        if let Some(v) = update.high_water {
            self.high_water = v;
        }
        if let Some(v) = update.strategy {
            self.strategy = v;
        }
        if let Some(v) = update.penalty {
            self.penalty = v;
        }
        if let Some(v) = update.reservoir {
            self.reservoir = v;
        }
        if let Some(v) = update.reservoir_refresh_interval {
            self.reservoir_refresh_interval = v;
        }
        if let Some(v) = update.reservoir_refresh_amount {
            self.reservoir_refresh_amount = v;
        }
        if let Some(v) = update.reservoir_increase_interval {
            self.reservoir_increase_interval = v;
        }
        if let Some(v) = update.reservoir_increase_amount {
            self.reservoir_increase_amount = v;
        }
        if let Some(v) = update.reservoir_increase_maximum {
            self.reservoir_increase_maximum = v;
        }
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        for (name, interval) in [
            ("reservoir_refresh_interval", self.reservoir_refresh_interval),
            ("reservoir_increase_interval", self.reservoir_increase_interval),
        ] {
            if interval.is_some_and(|i| i.is_zero()) {
                return Err(anyhow::anyhow!("{} must be greater than zero", name));
            }
        }
        if let (Some(reservoir), Some(maximum)) =
            (self.reservoir, self.reservoir_increase_maximum)
        {
            if self.increase_active() && reservoir > maximum {
                tracing::warn!(
                    reservoir,
                    maximum,
                    "Initial reservoir is above reservoir_increase_maximum"
                );
            }
        }
        Ok(())
    }
}

/// Partial store settings. The outer `Option` means "leave unchanged"; for
/// nullable settings the inner `Option` is the new value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSettingsUpdate {
    pub max_concurrent: Option<Option<u64>>,
    pub min_time: Option<Duration>,
    pub high_water: Option<Option<u64>>,
    pub strategy: Option<Strategy>,
    pub penalty: Option<Option<Duration>>,
    pub reservoir: Option<Option<u64>>,
    pub reservoir_refresh_interval: Option<Option<Duration>>,
    pub reservoir_refresh_amount: Option<Option<u64>>,
    pub reservoir_increase_interval: Option<Option<Duration>>,
    pub reservoir_increase_amount: Option<Option<u64>>,
    pub reservoir_increase_maximum: Option<Option<u64>>,
}

impl StoreSettingsUpdate {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn max_concurrent(mut self, value: Option<u64>) -> Self {
        self.max_concurrent = Some(value);
        self
    }

    pub fn min_time(mut self, value: Duration) -> Self {
        self.min_time = Some(value);
        self
    }

    pub fn high_water(mut self, value: Option<u64>) -> Self {
        self.high_water = Some(value);
        self
    }

    pub fn strategy(mut self, value: Strategy) -> Self {
        self.strategy = Some(value);
        self
    }

    pub fn penalty(mut self, value: Option<Duration>) -> Self {
        self.penalty = Some(value);
        self
    }

    pub fn reservoir(mut self, value: Option<u64>) -> Self {
        self.reservoir = Some(value);
        self
    }

    pub fn reservoir_refresh(mut self, interval: Option<Duration>, amount: Option<u64>) -> Self {
        self.reservoir_refresh_interval = Some(interval);
        self.reservoir_refresh_amount = Some(amount);
        self
    }

    pub fn reservoir_increase(
        mut self,
        interval: Option<Duration>,
        amount: Option<u64>,
        maximum: Option<u64>,
    ) -> Self {
        self.reservoir_increase_interval = Some(interval);
        self.reservoir_increase_amount = Some(amount);
        self.reservoir_increase_maximum = Some(maximum);
        self
    }
}

/// Full limiter configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterSettings {
    pub id: String,
    pub store: StoreSettings,
    pub datastore: Datastore,
    /// Reject a dropped job's completion handle instead of leaving it pending.
    pub reject_on_drop: bool,
    /// Keep finished jobs in the DONE state for inspection.
    pub track_done_status: bool,
    /// Store heartbeat period; `None` uses the datastore's default.
    pub heartbeat_interval: Option<Duration>,
    /// Distributed only: a process unseen for this long is considered gone.
    pub client_timeout: Duration,
    /// Distributed only: wipe the shared keys on startup.
    pub clear_datastore: bool,
    /// Idle horizon, set for limiters managed by a group.
    pub timeout: Option<Duration>,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            id: DEFAULT_JOB_ID.to_string(),
            store: StoreSettings::default(),
            datastore: Datastore::Local,
            reject_on_drop: true,
            track_done_status: false,
            heartbeat_interval: None,
            client_timeout: Duration::from_millis(CLIENT_TIMEOUT_MS),
            clear_datastore: false,
            timeout: None,
        }
    }
}

impl LimiterSettings {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn with_max_concurrent(mut self, max_concurrent: u64) -> Self {
        self.store.max_concurrent = Some(max_concurrent);
        self
    }

    pub fn with_min_time(mut self, min_time: Duration) -> Self {
        self.store.min_time = min_time;
        self
    }

    pub fn with_high_water(mut self, high_water: u64, strategy: Strategy) -> Self {
        self.store.high_water = Some(high_water);
        self.store.strategy = strategy;
        self
    }

    pub fn with_penalty(mut self, penalty: Duration) -> Self {
        self.store.penalty = Some(penalty);
        self
    }

    pub fn with_reservoir(mut self, reservoir: u64) -> Self {
        self.store.reservoir = Some(reservoir);
        self
    }

    pub fn with_reservoir_refresh(mut self, interval: Duration, amount: u64) -> Self {
        self.store.reservoir_refresh_interval = Some(interval);
        self.store.reservoir_refresh_amount = Some(amount);
        self
    }

    pub fn with_reservoir_increase(
        mut self,
        interval: Duration,
        amount: u64,
        maximum: Option<u64>,
    ) -> Self {
        self.store.reservoir_increase_interval = Some(interval);
        self.store.reservoir_increase_amount = Some(amount);
        self.store.reservoir_increase_maximum = maximum;
        self
    }

    pub fn with_datastore(mut self, datastore: Datastore) -> Self {
        self.datastore = datastore;
        self
    }

    pub fn with_track_done_status(mut self, track: bool) -> Self {
        self.track_done_status = track;
        self
    }

    pub fn with_reject_on_drop(mut self, reject: bool) -> Self {
        self.reject_on_drop = reject;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn effective_heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval.unwrap_or(match self.datastore {
            Datastore::Local => Duration::from_millis(LOCAL_HEARTBEAT_INTERVAL_MS),
            Datastore::Distributed => Duration::from_millis(DISTRIBUTED_HEARTBEAT_INTERVAL_MS),
        })
    }

    pub fn apply(&mut self, update: &LimiterSettingsUpdate) {
        self.store.apply(&update.store);
        if let Some(v) = update.reject_on_drop {
            self.reject_on_drop = v;
        }
    }

    pub fn from_env() -> Result<Self, anyhow::Error> {
        dotenvy::dotenv().ok();

        let defaults = Self::default();
        let store = StoreSettings {
            max_concurrent: env_parse("SLUICE_MAX_CONCURRENT")?,
            min_time: env_millis("SLUICE_MIN_TIME_MS")?.unwrap_or(Duration::ZERO),
            high_water: env_parse("SLUICE_HIGH_WATER")?,
            strategy: env_parse("SLUICE_STRATEGY")?.unwrap_or_default(),
            penalty: env_millis("SLUICE_PENALTY_MS")?,
            reservoir: env_parse("SLUICE_RESERVOIR")?,
            reservoir_refresh_interval: env_millis("SLUICE_RESERVOIR_REFRESH_INTERVAL_MS")?,
            reservoir_refresh_amount: env_parse("SLUICE_RESERVOIR_REFRESH_AMOUNT")?,
            reservoir_increase_interval: env_millis("SLUICE_RESERVOIR_INCREASE_INTERVAL_MS")?,
            reservoir_increase_amount: env_parse("SLUICE_RESERVOIR_INCREASE_AMOUNT")?,
            reservoir_increase_maximum: env_parse("SLUICE_RESERVOIR_INCREASE_MAXIMUM")?,
        };

        let settings = Self {
            id: env::var("SLUICE_ID")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or(defaults.id),
            store,
            datastore: env_parse("SLUICE_DATASTORE")?.unwrap_or_default(),
            reject_on_drop: env_parse("SLUICE_REJECT_ON_DROP")?.unwrap_or(defaults.reject_on_drop),
            track_done_status: env_parse("SLUICE_TRACK_DONE_STATUS")?
                .unwrap_or(defaults.track_done_status),
            heartbeat_interval: env_millis("SLUICE_HEARTBEAT_INTERVAL_MS")?,
            client_timeout: env_millis("SLUICE_CLIENT_TIMEOUT_MS")?
                .unwrap_or(defaults.client_timeout),
            clear_datastore: env_parse("SLUICE_CLEAR_DATASTORE")?
                .unwrap_or(defaults.clear_datastore),
            timeout: None,
        };

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.id.is_empty() {
            return Err(anyhow::anyhow!("Limiter id must not be empty"));
        }
        if self.heartbeat_interval.is_some_and(|i| i.is_zero()) {
            return Err(anyhow::anyhow!("heartbeat_interval must be greater than zero"));
        }
        if self.client_timeout.is_zero() {
            return Err(anyhow::anyhow!("client_timeout must be greater than zero"));
        }
        if self.timeout.is_some_and(|t| t.is_zero()) {
            return Err(anyhow::anyhow!("timeout must be greater than zero"));
        }
        self.store.validate()
    }
}

/// Partial limiter settings applied by `Limiter::update_settings`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterSettingsUpdate {
    pub store: StoreSettingsUpdate,
    pub reject_on_drop: Option<bool>,
}

impl LimiterSettingsUpdate {
    pub fn store(store: StoreSettingsUpdate) -> Self {
        Self {
            store,
            ..Self::default()
        }
    }
}

/// Configuration of a keyed group of limiters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSettings {
    pub id: String,
    /// Template for every limiter the group creates.
    pub limiter: LimiterSettings,
    /// Idle horizon after which an untouched limiter is disposed.
    pub timeout: Option<Duration>,
}

impl Default for GroupSettings {
    fn default() -> Self {
        Self {
            id: DEFAULT_GROUP_ID.to_string(),
            limiter: LimiterSettings::default(),
            timeout: Some(Duration::from_secs(GROUP_TIMEOUT_SECS)),
        }
    }
}

impl GroupSettings {
    pub fn new(id: impl Into<String>, limiter: LimiterSettings) -> Self {
        Self {
            id: id.into(),
            limiter,
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.id.is_empty() {
            return Err(anyhow::anyhow!("Group id must not be empty"));
        }
        if self.timeout.is_some_and(|t| t.is_zero()) {
            return Err(anyhow::anyhow!("Group timeout must be greater than zero"));
        }
        self.limiter.validate()
    }
}

/// Partial group settings; limiter changes apply to limiters created afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSettingsUpdate {
    pub limiter: LimiterSettingsUpdate,
    pub timeout: Option<Option<Duration>>,
}

/// Options for `Limiter::stop`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopOptions {
    /// Reject queued and not-yet-executing jobs instead of letting them finish.
    pub drop_waiting_jobs: bool,
    /// Error message for jobs dropped by the stop.
    pub drop_error_message: String,
    /// Error message for jobs scheduled after the stop.
    pub enqueue_error_message: String,
}

impl Default for StopOptions {
    fn default() -> Self {
        Self {
            drop_waiting_jobs: true,
            drop_error_message: "This limiter has been stopped.".to_string(),
            enqueue_error_message: "This limiter has been stopped and cannot accept new jobs."
                .to_string(),
        }
    }
}

impl StopOptions {
    /// Stop that lets already admitted and queued work complete.
    pub fn graceful() -> Self {
        Self {
            drop_waiting_jobs: false,
            ..Self::default()
        }
    }
}

fn env_parse<T>(name: &str) -> Result<Option<T>, anyhow::Error>
where
    T: FromStr,
    T::Err: Display,
{
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("{} has an invalid value {:?}: {}", name, raw, e)),
        _ => Ok(None),
    }
}

fn env_millis(name: &str) -> Result<Option<Duration>, anyhow::Error> {
    Ok(env_parse::<u64>(name)?.map(Duration::from_millis))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn penalty_defaults_follow_min_time() {
        let mut store = StoreSettings::default();
        assert_eq!(store.computed_penalty(), Duration::from_millis(5000));
        store.min_time = Duration::from_millis(100);
        assert_eq!(store.computed_penalty(), Duration::from_millis(1500));
        store.penalty = Some(Duration::from_millis(30));
        assert_eq!(store.computed_penalty(), Duration::from_millis(30));
    }

    #[test]
    fn update_distinguishes_unset_from_cleared() {
        let mut store = StoreSettings {
            max_concurrent: Some(3),
            reservoir: Some(10),
            ..StoreSettings::default()
        };
        store.apply(
            &StoreSettingsUpdate::default()
                .max_concurrent(None)
                .min_time(Duration::from_millis(50)),
        );
        assert_eq!(store.max_concurrent, None);
        assert_eq!(store.reservoir, Some(10));
        assert_eq!(store.min_time, Duration::from_millis(50));
    }

    #[test]
    fn heartbeat_default_depends_on_datastore() {
        let local = LimiterSettings::default();
        assert_eq!(
            local.effective_heartbeat_interval(),
            Duration::from_millis(250)
        );
        let distributed = LimiterSettings::default().with_datastore(Datastore::Distributed);
        assert_eq!(
            distributed.effective_heartbeat_interval(),
            Duration::from_millis(5000)
        );
    }

    #[test]
    fn validate_rejects_zero_intervals() {
        let settings = LimiterSettings::new("api")
            .with_reservoir_refresh(Duration::ZERO, 10);
        assert!(settings.validate().is_err());
        assert!(LimiterSettings::new("").validate().is_err());
        assert!(LimiterSettings::new("api").validate().is_ok());
    }

    #[test]
    fn datastore_parses() {
        assert_eq!("LOCAL".parse::<Datastore>().unwrap(), Datastore::Local);
        assert_eq!(
            "distributed".parse::<Datastore>().unwrap(),
            Datastore::Distributed
        );
        assert_eq!(
            "redis".parse::<Datastore>().unwrap_err().to_string(),
            "Invalid datastore type: redis"
        );
    }
}
