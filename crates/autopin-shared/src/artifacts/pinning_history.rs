use crate::Pid;
use crate::pinning::Pinning;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// One applied pinning together with the monitor readings that led to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PinningHistoryEntry {
    /// Milliseconds since the control loop started
    pub elapsed_ms: u64,
    pub pinning: Pinning,
    /// Mean value per monitor across the sampled threads
    pub values: BTreeMap<String, f64>,
}

/// Measured performance of one CPU sequence of a schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleResult {
    /// CPU of the first pinned thread, then of the second, and so on
    pub cpus: Vec<usize>,
    /// Mean rate of the measuring monitor over the pinned threads
    pub value: f64,
}

/// Outcome of a policy that searches a schedule of CPU sequences.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ScheduleReport {
    pub results: Vec<ScheduleResult>,
    pub best: Option<Vec<usize>>,
}

/// Record of every pinning applied to an observed process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PinningHistory {
    pub root_pid: Pid,
    pub policy: String,
    pub policy_options: Vec<(String, Vec<String>)>,
    pub monitors: Vec<String>,
    pub entries: Vec<PinningHistoryEntry>,
    #[serde(default)]
    pub schedule: Option<ScheduleReport>,
}

impl PinningHistory {
    pub fn new(
        root_pid: Pid,
        policy: impl Into<String>,
        policy_options: Vec<(String, Vec<String>)>,
        monitors: Vec<String>,
    ) -> Self {
        Self {
            root_pid,
            policy: policy.into(),
            policy_options,
            monitors,
            entries: Vec::new(),
            schedule: None,
        }
    }

    pub fn record(&mut self, elapsed: Duration, pinning: &Pinning, values: BTreeMap<String, f64>) {
        self.entries.push(PinningHistoryEntry {
            elapsed_ms: elapsed.as_millis() as u64,
            pinning: pinning.clone(),
            values,
        });
    }

    /// Values of a policy option as it was configured for the recorded run.
    pub fn policy_option(&self, name: &str) -> Option<&[String]> {
        self.policy_options
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, values)| values.as_slice())
    }

    pub fn load_from<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        Ok(rmp_serde::from_read(file)?)
    }
}

impl super::ArtifactExt for PinningHistory {}
