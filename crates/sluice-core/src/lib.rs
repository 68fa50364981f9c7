//! Sluice Core Library
//!
//! Shared building blocks for the Sluice admission engine: job models, the
//! job state registry, priority queues, limiter events, settings and errors.

pub mod config;
pub mod error;
pub mod events;
pub mod models;
pub mod queues;
pub mod states;

// Re-export commonly used types
pub use config::{
    Datastore, GroupSettings, GroupSettingsUpdate, LimiterSettings, LimiterSettingsUpdate,
    StopOptions, StoreSettings, StoreSettingsUpdate,
};
pub use error::{LimiterError, LogLevel, DEFAULT_DROP_MESSAGE};
pub use events::{Events, FailureHandler, LimiterEvent, EVENT_CHANNEL_CAPACITY};
pub use models::{
    random_index, JobInfo, JobOptions, JobSpec, JobStatus, Strategy, DEFAULT_JOB_ID,
    DEFAULT_PRIORITY, DEFAULT_WEIGHT, NUM_PRIORITIES,
};
pub use queues::{Queueable, Queues};
pub use states::{JobStates, StatusCounts};
