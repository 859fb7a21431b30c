use super::{
    PlacementPolicy, PolicyEvent, interval_opt, not_configured, parse_interval, tick_interval,
};
use crate::config::{ConfigOpts, ConfigView};
use crate::error::AutopinError;
use crate::prelude::*;
use crate::topology::NumaTopology;
use autopin_shared::Tid;
use autopin_shared::pinning::{PinnedTask, Pinning};
use itertools::Itertools;
use std::sync::Arc;
use std::time::Duration;

pub const NAME: &str = "scatter";

/// Spreads threads across NUMA nodes.
///
/// Every node carries a load counter. A new thread goes to the first free CPU of the least
/// loaded node, ties going to the lowest node index.
#[derive(Debug)]
pub struct ScatterPolicy {
    topology: Option<Arc<NumaTopology>>,
    node_load: Vec<usize>,
    interval: Duration,
}

impl Default for ScatterPolicy {
    fn default() -> Self {
        Self {
            topology: None,
            node_load: Vec::new(),
            interval: super::DEFAULT_INTERVAL,
        }
    }
}

impl ScatterPolicy {
    fn topology(&self) -> Result<Arc<NumaTopology>, AutopinError> {
        self.topology.clone().ok_or_else(|| not_configured(NAME))
    }

    pub fn node_load(&self) -> &[usize] {
        &self.node_load
    }

    fn place(&mut self, task: PinnedTask, current: &Pinning) -> Result<Pinning, AutopinError> {
        let topology = self.topology()?;
        let mut next = current.clone();
        if next.cpu_of(task.tid).is_some() {
            return Ok(next);
        }

        // sorted_by_key is stable, equally loaded nodes keep ascending order
        let nodes = (0..self.node_load.len()).sorted_by_key(|&node| self.node_load[node]);
        for node in nodes {
            for &cpu in topology.cpus_of(node)? {
                if next.assign(cpu, task) {
                    self.node_load[node] += 1;
                    debug!("Placing task {} on CPU {cpu} (node {node})", task.tid);
                    return Ok(next);
                }
            }
        }

        debug!("No free CPU left for task {}", task.tid);
        Ok(next)
    }

    fn release(&mut self, tid: Tid, current: &Pinning) -> Result<Pinning, AutopinError> {
        let topology = self.topology()?;
        let mut next = current.clone();
        if let Some(cpu) = next.release(tid) {
            let node = topology.node_of(cpu)?;
            self.node_load[node] = self.node_load[node].saturating_sub(1);
        }
        Ok(next)
    }
}

impl PlacementPolicy for ScatterPolicy {
    fn name(&self) -> &'static str {
        NAME
    }

    fn configure(
        &mut self,
        config: &ConfigView,
        topology: &Arc<NumaTopology>,
    ) -> Result<(), AutopinError> {
        self.interval = parse_interval(config, NAME)?;
        self.node_load = vec![0; topology.node_count()];
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
            PolicyEvent::TaskTerminated { tid } => self.release(*tid, current),
            PolicyEvent::Tick { .. } => Ok(current.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::MonitorSamples;

    /// Two nodes: CPUs 0-1 on node 0, CPUs 2-3 on node 1.
    fn two_by_two() -> Arc<NumaTopology> {
        Arc::new(
            NumaTopology::from_parts(vec![0, 0, 1, 1], vec![vec![10, 20], vec![20, 10]]).unwrap(),
        )
    }

    fn configured(topology: &Arc<NumaTopology>) -> ScatterPolicy {
        let mut policy = ScatterPolicy::default();
        policy.configure(&ConfigView::default(), topology).unwrap();
        policy
    }

    fn create(policy: &mut ScatterPolicy, pinning: &Pinning, tid: Tid) -> Pinning {
        policy
            .get_pinning(&PolicyEvent::TaskCreated(PinnedTask::new(1, tid)), pinning)
            .unwrap()
    }

    fn terminate(policy: &mut ScatterPolicy, pinning: &Pinning, tid: Tid) -> Pinning {
        policy
            .get_pinning(&PolicyEvent::TaskTerminated { tid }, pinning)
            .unwrap()
    }

    #[test]
    fn test_alternates_between_nodes() {
        let topology = two_by_two();
        let mut policy = configured(&topology);

        let mut pinning = Pinning::new(4);
        for tid in 1..=4 {
            pinning = create(&mut policy, &pinning, tid);
        }

        let nodes = (1..=4)
            .map(|tid| topology.node_of(pinning.cpu_of(tid).unwrap()).unwrap())
            .collect::<Vec<_>>();
        assert_eq!(nodes, vec![0, 1, 0, 1]);
        assert_eq!(pinning.cpu_of(1), Some(0));
        assert_eq!(pinning.cpu_of(2), Some(2));
        assert_eq!(pinning.cpu_of(3), Some(1));
        assert_eq!(pinning.cpu_of(4), Some(3));
        assert_eq!(policy.node_load(), [2, 2]);
    }

    #[test]
    fn test_full_machine_leaves_pinning_unchanged() {
        let topology = two_by_two();
        let mut policy = configured(&topology);

        let mut pinning = Pinning::new(4);
        for tid in 1..=4 {
            pinning = create(&mut policy, &pinning, tid);
        }
        let full = pinning.clone();

        let next = create(&mut policy, &full, 5);
        assert_eq!(next, full);
        assert_eq!(next.cpu_of(5), None);
        assert_eq!(policy.node_load(), [2, 2]);
    }

    #[test]
    fn test_terminate_releases_and_decrements() {
        let topology = two_by_two();
        let mut policy = configured(&topology);

        let mut pinning = Pinning::new(4);
        for tid in 1..=3 {
            pinning = create(&mut policy, &pinning, tid);
        }
        assert_eq!(policy.node_load(), [2, 1]);

        let cpu = pinning.cpu_of(1).unwrap();
        pinning = terminate(&mut policy, &pinning, 1);
        assert!(pinning.is_free(cpu));
        assert_eq!(policy.node_load(), [1, 1]);

        // Node 0 is the lowest index among the least loaded nodes again
        pinning = create(&mut policy, &pinning, 9);
        assert_eq!(pinning.cpu_of(9), Some(cpu));
    }

    #[test]
    fn test_terminate_unpinned_task_is_noop() {
        let topology = two_by_two();
        let mut policy = configured(&topology);
        let pinning = create(&mut policy, &Pinning::new(4), 1);

        let next = terminate(&mut policy, &pinning, 42);
        assert_eq!(next, pinning);
        assert_eq!(policy.node_load(), [1, 0]);
    }

    #[test]
    fn test_created_task_already_pinned_is_noop() {
        let topology = two_by_two();
        let mut policy = configured(&topology);
        let pinning = create(&mut policy, &Pinning::new(4), 1);

        assert_eq!(create(&mut policy, &pinning, 1), pinning);
        assert_eq!(policy.node_load(), [1, 0]);
    }

    #[test]
    fn test_tick_keeps_pinning() {
        let topology = two_by_two();
        let mut policy = configured(&topology);
        let pinning = create(&mut policy, &Pinning::new(4), 1);

        let next = policy
            .get_pinning(
                &PolicyEvent::Tick {
                    samples: MonitorSamples::new(),
                },
                &pinning,
            )
            .unwrap();
        assert_eq!(next, pinning);
    }

    #[test]
    fn test_interval_round_trip() {
        let mut config = ConfigView::default();
        config.set("scatter.interval", ["500"]);
        let mut policy = ScatterPolicy::default();
        policy.configure(&config, &two_by_two()).unwrap();

        assert_eq!(policy.interval(), Some(Duration::from_millis(500)));
        assert_eq!(
            policy.config_opts(),
            vec![("interval".to_string(), vec!["500".to_string()])]
        );
    }

    #[test]
    fn test_default_interval() {
        let policy = configured(&two_by_two());
        assert_eq!(policy.interval(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn test_unconfigured_policy_refuses_to_decide() {
        let mut policy = ScatterPolicy::default();
        let err = policy
            .get_pinning(
                &PolicyEvent::TaskCreated(PinnedTask::new(1, 1)),
                &Pinning::new(4),
            )
            .unwrap_err();
        assert!(err.is_fatal());
    }
}
