use super::{
    PlacementPolicy, PolicyEvent, interval_opt, not_configured, parse_interval, tick_interval,
};
use crate::config::{ConfigOpts, ConfigView};
use crate::error::AutopinError;
use crate::prelude::*;
use crate::topology::NumaTopology;
use autopin_shared::pinning::{PinnedTask, Pinning};
use std::sync::Arc;
use std::time::Duration;

pub const NAME: &str = "compact";

/// Packs the threads of a process onto neighbouring CPUs.
///
/// A new thread takes the free CPU closest, by index, to a CPU already held by its process.
/// Closer NUMA distance breaks ties, then the lowest index. The first thread of a process takes
/// the first free CPU.
#[derive(Debug)]
pub struct CompactPolicy {
    topology: Option<Arc<NumaTopology>>,
    interval: Duration,
}

impl Default for CompactPolicy {
    fn default() -> Self {
        Self {
            topology: None,
            interval: super::DEFAULT_INTERVAL,
        }
    }
}

impl CompactPolicy {
    fn place(&self, task: PinnedTask, current: &Pinning) -> Result<Pinning, AutopinError> {
        let topology = self.topology.as_ref().ok_or_else(|| not_configured(NAME))?;
        let mut next = current.clone();
        if next.cpu_of(task.tid).is_some() {
            return Ok(next);
        }

        let held = next.cpus_of_process(task.pid);
        let mut best: Option<((usize, u32), usize)> = None;
        for cpu in next.free_cpus().filter(|&cpu| topology.contains_cpu(cpu)) {
            let mut key = (0, 0);
            if let Some(&anchor) = held.iter().min_by_key(|&&h| h.abs_diff(cpu)) {
                let distance =
                    topology.distance(topology.node_of(anchor)?, topology.node_of(cpu)?)?;
                key = (anchor.abs_diff(cpu), distance);
            }
            // Strictly smaller only, so that ties keep the lowest CPU
            if best.is_none_or(|(best_key, _)| key < best_key) {
                best = Some((key, cpu));
            }
        }

        match best {
            Some((_, cpu)) => {
                next.assign(cpu, task);
                debug!("Placing task {} on CPU {cpu}", task.tid);
            }
            None => debug!("No free CPU left for task {}", task.tid),
        }
        Ok(next)
    }
}

impl PlacementPolicy for CompactPolicy {
    fn name(&self) -> &'static str {
        NAME
    }

    fn configure(
        &mut self,
        config: &ConfigView,
        topology: &Arc<NumaTopology>,
    ) -> Result<(), AutopinError> {
        self.interval = parse_interval(config, NAME)?;
        self.topology = Some(Arc::clone(topology));
        Ok(())
    }

    fn config_opts(&self) -> ConfigOpts {
        vec![interval_opt(self.interval)]
    }

    fn interval(&self) -> Option<Duration> {
        tick_interval(self.interval)
    }

    fn get_pinning(
        &mut self,
        event: &PolicyEvent,
        current: &Pinning,
    ) -> Result<Pinning, AutopinError> {
        match event {
            PolicyEvent::TaskCreated(task) => self.place(*task, current),
            PolicyEvent::TaskTerminated { tid } => {
                let mut next = current.clone();
                next.release(*tid);
                Ok(next)
            }
            PolicyEvent::Tick { .. } => Ok(current.clone()),
        }
    }
}
