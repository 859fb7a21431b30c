use crate::error::AutopinError;
use crate::prelude::*;
use autopin_shared::Tid;
use nix::sched::{CpuSet, sched_setaffinity};
use nix::unistd::Pid as NixPid;

/// Applies placement decisions to the operating system.
pub trait PinningExecutor {
    /// Restrict `tid` to run on `cpu` only.
    fn pin(&mut self, tid: Tid, cpu: usize) -> Result<(), AutopinError>;
}

/// Pins threads with `sched_setaffinity(2)`.
#[derive(Debug, Default)]
pub struct SchedAffinityExecutor;

impl PinningExecutor for SchedAffinityExecutor {
    fn pin(&mut self, tid: Tid, cpu: usize) -> Result<(), AutopinError> {
        let failure = |errno: nix::Error| AutopinError::ExecutorFailure {
            tid,
            cpu,
            source: errno.into(),
        };

        let mut cpu_set = CpuSet::new();
        cpu_set.set(cpu).map_err(failure)?;
        sched_setaffinity(NixPid::from_raw(tid), &cpu_set).map_err(failure)?;
        trace!("Pinned task {tid} to CPU {cpu}");
        Ok(())
    }
}

/// Logs decisions without touching any affinity.
#[derive(Debug, Default)]
pub struct DryRunExecutor;

impl PinningExecutor for DryRunExecutor {
    fn pin(&mut self, tid: Tid, cpu: usize) -> Result<(), AutopinError> {
        info!("Would pin task {tid} to CPU {cpu}");
        Ok(())
    }
}
