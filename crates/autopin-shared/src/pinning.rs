use crate::{Pid, Tid};
use itertools::Itertools;
use serde::{Deserialize, Serialize};

/// A thread occupying a CPU slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PinnedTask {
    pub pid: Pid,
    pub tid: Tid,
}

impl PinnedTask {
    pub fn new(pid: Pid, tid: Tid) -> Self {
        Self { pid, tid }
    }
}

/// Assignment of threads to CPUs, indexed by CPU number. `None` marks a free CPU.
///
/// A pinning is a value: policies receive the current one and return a new one.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Pinning {
    slots: Vec<Option<PinnedTask>>,
}

impl Pinning {
    /// All CPUs free.
    pub fn new(cpu_count: usize) -> Self {
        Self {
            slots: vec![None; cpu_count],
        }
    }

    pub fn cpu_count(&self) -> usize {
        self.slots.len()
    }

    pub fn get(&self, cpu: usize) -> Option<PinnedTask> {
        self.slots.get(cpu).copied().flatten()
    }

    pub fn is_free(&self, cpu: usize) -> bool {
        matches!(self.slots.get(cpu), Some(None))
    }

    pub fn free_cpus(&self) -> impl Iterator<Item = usize> + '_ {
        self.slots
            .iter()
            .positions(|slot| slot.is_none())
    }

    /// CPU currently held by `tid`.
    pub fn cpu_of(&self, tid: Tid) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.is_some_and(|task| task.tid == tid))
    }

    /// CPUs held by any thread of `pid`, ascending.
    pub fn cpus_of_process(&self, pid: Pid) -> Vec<usize> {
        self.slots
            .iter()
            .positions(|slot| slot.is_some_and(|task| task.pid == pid))
            .collect()
    }

    /// Put `task` on a free `cpu`. Returns `false` when the CPU is taken, out of range, or the
    /// thread already holds another CPU.
    pub fn assign(&mut self, cpu: usize, task: PinnedTask) -> bool {
        if !self.is_free(cpu) || self.cpu_of(task.tid).is_some() {
            return false;
        }
        self.slots[cpu] = Some(task);
        true
    }

    /// Free the CPU held by `tid`, returning it.
    pub fn release(&mut self, tid: Tid) -> Option<usize> {
        let cpu = self.cpu_of(tid)?;
        self.slots[cpu] = None;
        Some(cpu)
    }

    /// First thread found on more than one CPU. [`Pinning::assign`] never produces one, a
    /// deserialized pinning might.
    pub fn duplicated_tid(&self) -> Option<Tid> {
        self.assigned().map(|(_, task)| task.tid).duplicates().next()
    }

    pub fn assigned(&self) -> impl Iterator<Item = (usize, PinnedTask)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(cpu, slot)| slot.map(|task| (cpu, task)))
    }

    /// Slots whose occupant differs from `previous` and that now hold a thread, i.e. the
    /// affinity changes needed to go from `previous` to `self`.
    pub fn changes_from(&self, previous: &Pinning) -> Vec<(usize, PinnedTask)> {
        self.assigned()
            .filter(|&(cpu, task)| previous.get(cpu) != Some(task))
            .collect()
    }
}

impl std::fmt::Display for Pinning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let rendered = self
            .slots
            .iter()
            .map(|slot| match slot {
                Some(task) => task.tid.to_string(),
                None => "-".to_string(),
            })
            .join(" ");
        write!(f, "[{rendered}]")
    }
}
