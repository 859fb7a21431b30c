//! Pinning along fixed CPU sequences, shared by the schedule-driven policies.
//!
//! A CPU sequence such as `0:2:4:6` pins the first thread of the observed process to CPU 0, the
//! second to CPU 2 and so on. Threads are numbered in creation order. Thread numbers listed in
//! `skip` are left unpinned and do not consume a CPU of the sequence.

use crate::config::ConfigView;
use crate::error::AutopinError;
use crate::prelude::*;
use crate::topology::NumaTopology;
use autopin_shared::Tid;
use autopin_shared::pinning::{PinnedTask, Pinning};
use itertools::Itertools;
use std::collections::BTreeSet;
use std::time::Duration;

/// Threads in creation order.
#[derive(Debug, Default)]
pub(crate) struct TaskSequence {
    tasks: Vec<PinnedTask>,
    skip: BTreeSet<usize>,
}

impl TaskSequence {
    pub fn new(skip: BTreeSet<usize>) -> Self {
        Self {
            tasks: Vec::new(),
            skip,
        }
    }

    pub fn push(&mut self, task: PinnedTask) {
        if !self.tasks.iter().any(|known| known.tid == task.tid) {
            self.tasks.push(task);
        }
    }

    pub fn remove(&mut self, tid: Tid) {
        self.tasks.retain(|task| task.tid != tid);
    }

    /// Pin the threads along `cpus`. Threads beyond the end of the sequence stay unpinned.
    pub fn pinning(&self, cpus: &[usize], cpu_count: usize) -> Pinning {
        let mut pinning = Pinning::new(cpu_count);
        let eligible = self
            .tasks
            .iter()
            .enumerate()
            .filter(|(index, _)| !self.skip.contains(index))
            .map(|(_, task)| *task);
        for (&cpu, task) in cpus.iter().zip(eligible) {
            if !pinning.assign(cpu, task) {
                warn!("Cannot pin task {} to CPU {cpu}", task.tid);
            }
        }
        pinning
    }
}

pub(crate) fn format_sequence(cpus: &[usize]) -> String {
    cpus.iter().join(":")
}

/// Parse one CPU sequence, every CPU must exist in `topology` and appear once.
pub(crate) fn parse_sequence(
    key: &str,
    raw: &str,
    topology: &NumaTopology,
) -> Result<Vec<usize>, AutopinError> {
    let invalid = |reason: String| AutopinError::bad_config(key, reason);

    let cpus = raw
        .split(':')
        .filter(|part| !part.trim().is_empty())
        .map(|part| part.trim().parse::<usize>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| invalid(format!("`{raw}` is not a valid pinning")))?;
    if cpus.is_empty() {
        return Err(invalid(format!("`{raw}` is not a valid pinning")));
    }
    if let Some(cpu) = cpus.iter().find(|&&cpu| !topology.contains_cpu(cpu)) {
        return Err(invalid(format!("CPU {cpu} of `{raw}` is not available")));
    }
    if let Some(cpu) = cpus.iter().duplicates().next() {
        return Err(invalid(format!("CPU {cpu} appears twice in `{raw}`")));
    }
    Ok(cpus)
}

/// Parse the list of CPU sequences stored under `key`, at least one is required.
pub(crate) fn parse_schedule(
    config: &ConfigView,
    key: &str,
    topology: &NumaTopology,
) -> Result<Vec<Vec<usize>>, AutopinError> {
    let entries = config.list(key);
    if entries.is_empty() {
        return Err(AutopinError::bad_config(key, "no pinning specified"));
    }
    entries
        .iter()
        .map(|raw| parse_sequence(key, raw, topology))
        .collect()
}

/// Parse thread numbers to leave unpinned.
pub(crate) fn parse_skip(key: &str, entries: &[String]) -> Result<BTreeSet<usize>, AutopinError> {
    entries
        .iter()
        .map(|entry| {
            entry.trim().parse::<usize>().map_err(|_| {
                AutopinError::bad_config(key, format!("invalid id for skipped thread: {entry}"))
            })
        })
        .collect()
}

/// Parse a duration option given in whole seconds.
pub(crate) fn parse_seconds(
    config: &ConfigView,
    key: &str,
    default: Duration,
) -> Result<Duration, AutopinError> {
    Ok(config
        .parse_single::<u64>(key)?
        .map_or(default, Duration::from_secs))
}
