//! Synthetic workloads for exercising Sluice limiters from the command line.

pub mod workload;

pub use workload::{run, Report, Workload};
