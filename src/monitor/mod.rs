//! Performance monitors sample one value per observed thread.
//!
//! A monitor is created from the configuration by name: `PerformanceMonitors` lists the
//! monitor names and `<name>.type` selects the implementation.

use crate::config::{ConfigOpts, ConfigView};
use crate::error::{AutopinError, Reporter};
use crate::prelude::*;
use autopin_shared::Tid;
use itertools::Itertools;
use std::collections::BTreeMap;
use std::str::FromStr;

pub mod counter;
pub mod perf;
pub mod random;

pub use counter::{Counter, CounterMonitor, CounterSource};
pub use perf::PerfCounterSource;
pub use random::RandomMonitor;

pub const MONITORS_KEY: &str = "PerformanceMonitors";

/// How readings of a monitor should be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValueType {
    /// Higher is better
    #[default]
    Max,
    /// Lower is better
    Min,
    Unknown,
}

impl FromStr for ValueType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "max" => Ok(ValueType::Max),
            "min" => Ok(ValueType::Min),
            "unknown" => Ok(ValueType::Unknown),
            _ => Err(format!("unknown value type `{s}`, expected max, min or unknown")),
        }
    }
}

impl std::fmt::Display for ValueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValueType::Max => write!(f, "max"),
            ValueType::Min => write!(f, "min"),
            ValueType::Unknown => write!(f, "unknown"),
        }
    }
}

pub trait PerformanceMonitor {
    /// Configured name, also the prefix of the monitor's options.
    fn name(&self) -> &str;

    /// Implementation name as used in `<name>.type`.
    fn kind(&self) -> &'static str;

    fn value_type(&self) -> ValueType;

    /// Validate and apply `<name>.*` options.
    fn configure(&mut self, config: &ConfigView) -> Result<(), AutopinError>;

    fn config_opts(&self) -> ConfigOpts;

    /// Start counting for `tid`. Starting an already monitored task restarts its count.
    fn start(&mut self, tid: Tid) -> Result<(), AutopinError>;

    /// Current reading for `tid`. Tasks that are not monitored read as zero.
    fn value(&mut self, tid: Tid) -> Result<f64, AutopinError>;

    /// Final reading for `tid`. The task is no longer monitored afterwards, even on error.
    fn stop(&mut self, tid: Tid) -> Result<f64, AutopinError>;

    /// Stop monitoring `tid` without reading it.
    fn clear(&mut self, tid: Tid);

    fn monitored_tasks(&self) -> Vec<Tid>;

    fn start_all(&mut self, tids: &[Tid], reporter: &mut Reporter) {
        for &tid in tids {
            reporter.check(self.start(tid));
        }
    }

    /// Readings of every monitored task. Tasks whose reading fails are reported and left out.
    fn values(&mut self, reporter: &mut Reporter) -> BTreeMap<Tid, f64> {
        self.monitored_tasks()
            .into_iter()
            .filter_map(|tid| reporter.check(self.value(tid)).map(|value| (tid, value)))
            .collect()
    }

    fn clear_all(&mut self) {
        for tid in self.monitored_tasks() {
            self.clear(tid);
        }
    }
}

impl std::fmt::Debug for dyn PerformanceMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name(), self.kind())
    }
}

/// Instantiate an unconfigured monitor of the given type.
pub fn create_monitor(name: &str, kind: &str) -> Result<Box<dyn PerformanceMonitor>, AutopinError> {
    match kind.to_ascii_lowercase().as_str() {
        perf::KIND => Ok(Box::new(CounterMonitor::new(name, PerfCounterSource))),
        random::KIND => Ok(Box::new(RandomMonitor::new(name))),
        _ => Err(AutopinError::bad_config(
            format!("{name}.type"),
            format!("unsupported monitor type `{kind}`"),
        )),
    }
}

/// Build and configure every monitor listed in `PerformanceMonitors`.
pub fn monitors_from_config(
    config: &ConfigView,
) -> Result<Vec<Box<dyn PerformanceMonitor>>, AutopinError> {
    let names = config.list(MONITORS_KEY);
    if let Some(duplicate) = names.iter().duplicates().next() {
        return Err(AutopinError::bad_config(
            MONITORS_KEY,
            format!("monitor `{duplicate}` is listed more than once"),
        ));
    }

    names
        .iter()
        .map(|name| {
            let kind = config.required(&format!("{name}.type"))?;
            let mut monitor = create_monitor(name, kind)?;
            monitor.configure(config)?;
            info!(
                "Monitor {name} ({kind}) configured: {:?}",
                monitor.config_opts()
            );
            Ok(monitor)
        })
        .collect()
}
