//! Sluice Limiter Library
//!
//! Schedules jobs under the limits enforced by an admission store:
//!
//! - [`Limiter`] queues jobs by priority and starts them as the store admits them.
//! - [`Group`] keeps one limiter per key and disposes of idle ones.
//!
//! ```no_run
//! use sluice_limiter::{JobOptions, Limiter, LimiterSettings};
//! use std::time::Duration;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let limiter = Limiter::new(
//!     LimiterSettings::new("api")
//!         .with_max_concurrent(2)
//!         .with_min_time(Duration::from_millis(100)),
//! )?;
//! let handle = limiter
//!     .schedule(JobOptions::new().with_priority(1), || async { Ok(42) })
//!     .await;
//! assert_eq!(handle.await?, 42);
//! # Ok(())
//! # }
//! ```

pub mod group;
pub mod job;
pub mod limiter;

// Re-export commonly used types
pub use group::{Group, GroupEvent, CLUSTER_SCAN_COUNT};
pub use job::{task_fn, JobHandle, TaskFn};
pub use limiter::{Limiter, Wrapped};

pub use sluice_core::{
    Datastore, GroupSettings, GroupSettingsUpdate, JobInfo, JobOptions, JobStatus, LimiterError,
    LimiterEvent, LimiterSettings, LimiterSettingsUpdate, StatusCounts, StopOptions,
    StoreSettingsUpdate, Strategy,
};
pub use sluice_store::{AtomicBackend, MemoryBackend};
