use crate::prelude::*;
use autopin_shared::Tid;
use std::path::PathBuf;

/// Counter operation that failed, used in monitor failure reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorOperation {
    Open,
    Enable,
    Reset,
    Read,
}

impl std::fmt::Display for MonitorOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MonitorOperation::Open => write!(f, "open"),
            MonitorOperation::Enable => write!(f, "enable"),
            MonitorOperation::Reset => write!(f, "reset"),
            MonitorOperation::Read => write!(f, "read"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyIndexKind {
    Cpu,
    Node,
}

impl std::fmt::Display for TopologyIndexKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TopologyIndexKind::Cpu => write!(f, "CPU"),
            TopologyIndexKind::Node => write!(f, "NUMA node"),
        }
    }
}

/// Conditions raised by the pinning components.
///
/// Whether a condition stops the control loop is decided by [`AutopinError::is_fatal`], the
/// components themselves only return it.
#[derive(Debug, thiserror::Error)]
pub enum AutopinError {
    #[error("Bad configuration for `{key}`: {reason}")]
    BadConfiguration { key: String, reason: String },

    #[error("Monitor `{monitor}` failed to {operation} the counter of task {tid}: {source}")]
    MonitorFailure {
        monitor: String,
        tid: Tid,
        operation: MonitorOperation,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid {kind} index {index} (topology has {bound})")]
    InvalidTopologyIndex {
        kind: TopologyIndexKind,
        index: usize,
        bound: usize,
    },

    #[error("Failed to pin task {tid} to CPU {cpu}: {source}")]
    ExecutorFailure {
        tid: Tid,
        cpu: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("NUMA topology unavailable at {}: {source}", .path.display())]
    TopologyUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Policy `{policy}` cannot decide while {state}")]
    InvalidPolicyState { policy: String, state: String },

    #[error("Policy `{policy}` returned an invalid pinning: {reason}")]
    InvalidPinning { policy: String, reason: String },
}

impl AutopinError {
    pub fn bad_config(key: impl Into<String>, reason: impl Into<String>) -> Self {
        AutopinError::BadConfiguration {
            key: key.into(),
            reason: reason.into(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        match self {
            AutopinError::BadConfiguration { .. }
            | AutopinError::InvalidTopologyIndex { .. }
            | AutopinError::InvalidPolicyState { .. }
            | AutopinError::InvalidPinning { .. } => true,
            AutopinError::MonitorFailure { .. }
            | AutopinError::ExecutorFailure { .. }
            | AutopinError::TopologyUnavailable { .. } => false,
        }
    }
}

/// Error-reporting context shared by the control loop and its setup.
///
/// Recoverable conditions are logged as warnings. The first fatal condition is latched so that
/// the loop can stop at its next decision point.
#[derive(Debug, Default)]
pub struct Reporter {
    reported: usize,
    fatal: Option<String>,
}

impl Reporter {
    pub fn report(&mut self, err: &AutopinError) {
        self.reported += 1;
        if err.is_fatal() {
            error!("{err}");
            if self.fatal.is_none() {
                self.fatal = Some(err.to_string());
            }
        } else {
            warn!("{err}");
        }
    }

    /// Report the error of a fallible step and keep going with `None`.
    pub fn check<T>(&mut self, result: Result<T, AutopinError>) -> Option<T> {
        result.map_err(|err| self.report(&err)).ok()
    }

    pub fn reported(&self) -> usize {
        self.reported
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal.is_some()
    }

    pub fn fatal(&self) -> Option<&str> {
        self.fatal.as_deref()
    }
}
