//! Sluice Store Library
//!
//! Admission stores decide when queued jobs may start. Two implementations share
//! the [`AdmissionStore`] trait:
//!
//! - [`LocalStore`] keeps every counter in process memory.
//! - [`DistributedStore`] runs each decision as one atomic script on an
//!   [`AtomicBackend`], so many processes enforce one logical limit.
//!
//! # Shared key format
//!
//! Every distributed limiter owns the keys `b_{id}_settings`, `b_{id}_job_weights`,
//! `b_{id}_job_expirations`, `b_{id}_job_clients`, `b_{id}_client_running`,
//! `b_{id}_client_num_queued`, `b_{id}_client_last_registered` and
//! `b_{id}_client_last_seen`. Key and channel naming is centralized in the
//! `keys` module.

pub mod backend;
pub mod distributed;
pub mod factory;
pub mod keys;
pub mod local;
pub mod protocol;
pub mod traits;

// Re-export commonly used types
pub use backend::{AtomicBackend, InitOptions, MemoryBackend, Scope, STORE_VERSION};
pub use distributed::DistributedStore;
pub use factory::create_store;
pub use local::LocalStore;
pub use protocol::{ChannelMessage, StoreMessage};
pub use traits::{
    AdmissionStore, QueuedProbe, RegisterOutcome, StoreContext, StoreError, StoreResult,
    StoreSignal, SubmitOutcome,
};
