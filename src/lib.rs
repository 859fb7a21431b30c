//! Automated NUMA-aware thread pinning driven by performance counters

#[cfg(not(target_os = "linux"))]
compile_error!("autopin relies on Linux perf events, sched_setaffinity and procfs");

pub mod app;
pub mod config;
pub mod control_loop;
pub mod error;
pub mod executor;
pub mod monitor;
pub mod policy;
mod prelude;
pub mod topology;
pub mod watcher;

pub use autopin_shared::{Pid, Tid};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
