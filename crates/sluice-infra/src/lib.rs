//! Sluice Infrastructure Library
//!
//! Process-level plumbing shared by the Sluice binaries:
//! - Telemetry initialization (`tracing` subscriber setup)

pub mod telemetry;

pub use telemetry::{init_telemetry, shutdown_telemetry, LogFormat};
