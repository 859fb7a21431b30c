//! Placement policies decide which CPU every observed thread runs on.
//!
//! A policy is selected with `ControlStrategy` and reads its own options under
//! `<policy>.*`. Policies never mutate the pinning they are given, they return the next one.

use crate::config::{ConfigOpts, ConfigView};
use crate::error::{AutopinError, TopologyIndexKind};
use crate::monitor::ValueType;
use crate::prelude::*;
use crate::topology::NumaTopology;
use autopin_shared::Tid;
use autopin_shared::artifacts::ScheduleReport;
use autopin_shared::pinning::{PinnedTask, Pinning};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

pub mod autopin1;
pub mod compact;
pub mod history;
pub mod noop;
pub mod scatter;
mod schedule;

pub use autopin1::Autopin1Policy;
pub use compact::CompactPolicy;
pub use history::HistoryPolicy;
pub use noop::NoopPolicy;
pub use scatter::ScatterPolicy;

pub const STRATEGY_KEY: &str = "ControlStrategy";
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(100);

/// Readings of one monitor at a tick.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MonitorReadings {
    pub value_type: ValueType,
    pub values: BTreeMap<Tid, f64>,
}

/// Readings per monitor name.
pub type MonitorSamples = BTreeMap<String, MonitorReadings>;

/// What triggered a decision.
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyEvent {
    TaskCreated(PinnedTask),
    TaskTerminated { tid: Tid },
    Tick { samples: MonitorSamples },
}

pub trait PlacementPolicy {
    fn name(&self) -> &'static str;

    /// Read options and one-time topology data. Called once before any decision.
    fn configure(
        &mut self,
        config: &ConfigView,
        topology: &Arc<NumaTopology>,
    ) -> Result<(), AutopinError>;

    fn config_opts(&self) -> ConfigOpts;

    /// Period of the feedback tick, `None` when the policy only reacts to task events.
    fn interval(&self) -> Option<Duration>;

    /// Compute the next pinning from `current` in response to `event`.
    fn get_pinning(
        &mut self,
        event: &PolicyEvent,
        current: &Pinning,
    ) -> Result<Pinning, AutopinError>;

    /// Measurements of a policy that searches a schedule, saved with the history.
    fn schedule_report(&self) -> Option<ScheduleReport> {
        None
    }
}

/// Parse `<policy>.interval` in milliseconds. Zero disables the tick.
pub(crate) fn parse_interval(config: &ConfigView, policy: &str) -> Result<Duration, AutopinError> {
    Ok(config
        .parse_single::<u64>(&format!("{policy}.interval"))?
        .map_or(DEFAULT_INTERVAL, Duration::from_millis))
}

pub(crate) fn interval_opt(interval: Duration) -> (String, Vec<String>) {
    ("interval".to_string(), vec![interval.as_millis().to_string()])
}

pub(crate) fn tick_interval(interval: Duration) -> Option<Duration> {
    (!interval.is_zero()).then_some(interval)
}

pub(crate) fn not_configured(policy: &str) -> AutopinError {
    AutopinError::InvalidPolicyState {
        policy: policy.to_string(),
        state: PolicyState::Uninitialized.to_string(),
    }
}

/// Instantiate an unconfigured policy by name.
pub fn create_policy(name: &str) -> Result<Box<dyn PlacementPolicy>, AutopinError> {
    match name.to_ascii_lowercase().as_str() {
        scatter::NAME => Ok(Box::new(ScatterPolicy::default())),
        compact::NAME => Ok(Box::new(CompactPolicy::default())),
        autopin1::NAME => Ok(Box::new(Autopin1Policy::default())),
        history::NAME => Ok(Box::new(HistoryPolicy::default())),
        noop::NAME => Ok(Box::new(NoopPolicy::default())),
        _ => Err(AutopinError::bad_config(
            STRATEGY_KEY,
            format!("unsupported control strategy `{name}`"),
        )),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyState {
    Uninitialized,
    Ready,
    Active,
    Stopped,
}

impl std::fmt::Display for PolicyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolicyState::Uninitialized => write!(f, "uninitialized"),
            PolicyState::Ready => write!(f, "ready"),
            PolicyState::Active => write!(f, "active"),
            PolicyState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Runs a policy through its lifecycle (`uninitialized -> ready -> active -> stopped`) and
/// applies the bookkeeping every decision needs.
pub struct PolicyDriver {
    policy: Box<dyn PlacementPolicy>,
    state: PolicyState,
}

impl PolicyDriver {
    pub fn new(policy: Box<dyn PlacementPolicy>) -> Self {
        Self {
            policy,
            state: PolicyState::Uninitialized,
        }
    }

    /// Create and configure the policy named by `ControlStrategy`.
    pub fn from_config(
        config: &ConfigView,
        topology: &Arc<NumaTopology>,
    ) -> Result<Self, AutopinError> {
        let policy = create_policy(config.required(STRATEGY_KEY)?)?;
        let mut driver = Self::new(policy);
        driver.configure(config, topology)?;
        Ok(driver)
    }

    pub fn configure(
        &mut self,
        config: &ConfigView,
        topology: &Arc<NumaTopology>,
    ) -> Result<(), AutopinError> {
        if self.state != PolicyState::Uninitialized {
            return Err(self.invalid_state());
        }
        self.policy.configure(config, topology)?;
        self.state = PolicyState::Ready;
        info!(
            "Control strategy {} configured: {:?}",
            self.policy.name(),
            self.policy.config_opts()
        );
        Ok(())
    }

    pub fn name(&self) -> &'static str {
        self.policy.name()
    }

    pub fn state(&self) -> PolicyState {
        self.state
    }

    pub fn interval(&self) -> Option<Duration> {
        self.policy.interval()
    }

    pub fn config_opts(&self) -> ConfigOpts {
        self.policy.config_opts()
    }

    pub fn schedule_report(&self) -> Option<ScheduleReport> {
        self.policy.schedule_report()
    }

    /// Ask the policy for the next pinning.
    ///
    /// A terminated task never keeps a CPU, whatever the policy returned. The result must cover
    /// the same CPUs as `current` and hold every thread on at most one CPU.
    pub fn decide(
        &mut self,
        event: &PolicyEvent,
        current: &Pinning,
    ) -> Result<Pinning, AutopinError> {
        match self.state {
            PolicyState::Ready | PolicyState::Active => self.state = PolicyState::Active,
            PolicyState::Uninitialized | PolicyState::Stopped => return Err(self.invalid_state()),
        }

        let mut next = self.policy.get_pinning(event, current)?;
        if let PolicyEvent::TaskTerminated { tid } = event {
            if let Some(cpu) = next.release(*tid) {
                debug!("Released CPU {cpu} still held by terminated task {tid}");
            }
        }

        if next.cpu_count() != current.cpu_count() {
            return Err(AutopinError::InvalidTopologyIndex {
                kind: TopologyIndexKind::Cpu,
                index: next.cpu_count(),
                bound: current.cpu_count(),
            });
        }
        if let Some(tid) = next.duplicated_tid() {
            return Err(AutopinError::InvalidPinning {
                policy: self.policy.name().to_string(),
                reason: format!("task {tid} holds more than one CPU"),
            });
        }
        Ok(next)
    }

    pub fn stop(&mut self) {
        self.state = PolicyState::Stopped;
    }

    fn invalid_state(&self) -> AutopinError {
        AutopinError::InvalidPolicyState {
            policy: self.policy.name().to_string(),
            state: self.state.to_string(),
        }
    }
}
