//! Data models shared by stores and limiters.

mod job;
mod status;
mod strategy;

pub use job::*;
pub use status::JobStatus;
pub use strategy::Strategy;
