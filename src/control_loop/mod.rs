//! The control loop ties the process tree, the monitors, the placement policy and the executor
//! together. Every trigger (a task event or the periodic tick) leads to exactly one decision,
//! and decisions are never run concurrently.

use crate::error::Reporter;
use crate::executor::PinningExecutor;
use crate::monitor::PerformanceMonitor;
use crate::policy::{MonitorReadings, MonitorSamples, PolicyDriver, PolicyEvent};
use crate::prelude::*;
use crate::topology::NumaTopology;
use autopin_shared::artifacts::PinningHistory;
use autopin_shared::pinning::{PinnedTask, Pinning};
use autopin_shared::process_tree::ProcessTree;
use autopin_shared::{Pid, Tid};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};

#[cfg(test)]
mod tests;

/// Capacity of the channel between the task watcher and the loop.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    /// A new process appeared below `parent`. Its main thread counts as created.
    ChildProcess { parent: Pid, child: Pid },
    TaskCreated { pid: Pid, tid: Tid },
    TaskTerminated { tid: Tid },
    Tick,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStatus {
    Running,
    /// The observed process has no threads left or a fatal error was reported
    Finished,
}

pub struct ControlLoop {
    tree: ProcessTree,
    topology: Arc<NumaTopology>,
    policy: PolicyDriver,
    monitors: Vec<Box<dyn PerformanceMonitor>>,
    executor: Box<dyn PinningExecutor>,
    pinning: Pinning,
    reporter: Reporter,
    history: Option<PinningHistory>,
    started_at: Instant,
}

impl ControlLoop {
    pub fn new(
        tree: ProcessTree,
        topology: Arc<NumaTopology>,
        policy: PolicyDriver,
        monitors: Vec<Box<dyn PerformanceMonitor>>,
        executor: Box<dyn PinningExecutor>,
        reporter: Reporter,
    ) -> Self {
        Self {
            pinning: Pinning::new(topology.cpu_count()),
            tree,
            topology,
            policy,
            monitors,
            executor,
            reporter,
            history: None,
            started_at: Instant::now(),
        }
    }

    /// Keep a history of every applied pinning, returned by [`ControlLoop::shutdown`].
    pub fn record_history(&mut self) {
        self.history = Some(PinningHistory::new(
            self.tree.root_pid(),
            self.policy.name(),
            self.policy.config_opts(),
            self.monitors.iter().map(|m| m.name().to_string()).collect(),
        ));
    }

    pub fn pinning(&self) -> &Pinning {
        &self.pinning
    }

    pub fn tree(&self) -> &ProcessTree {
        &self.tree
    }

    pub fn topology(&self) -> &NumaTopology {
        &self.topology
    }

    pub fn reporter(&self) -> &Reporter {
        &self.reporter
    }

    pub fn status(&self) -> LoopStatus {
        if self.reporter.is_fatal() || self.tree.root().tasks().is_empty() {
            LoopStatus::Finished
        } else {
            LoopStatus::Running
        }
    }

    /// Handle the threads already known to the tree when the loop starts.
    pub fn start(&mut self) -> LoopStatus {
        self.started_at = Instant::now();
        let known = self
            .tree
            .processes()
            .into_iter()
            .flat_map(|node| node.tasks().iter().map(|&tid| PinnedTask::new(node.pid(), tid)))
            .collect::<Vec<_>>();
        for task in known {
            self.task_created(task);
        }
        self.status()
    }

    pub fn handle(&mut self, event: ControlEvent) -> LoopStatus {
        match event {
            ControlEvent::ChildProcess { parent, child } => {
                if self.tree.add_child_process(parent, child) {
                    debug!("Process {child} started by {parent}");
                    self.task_created(PinnedTask::new(child, child));
                } else {
                    debug!("Ignoring process {child} of untracked parent {parent}");
                }
            }
            ControlEvent::TaskCreated { pid, tid } => {
                if self.tree.add_process_task(pid, tid) {
                    self.task_created(PinnedTask::new(pid, tid));
                } else {
                    debug!("Ignoring task {tid} of process {pid}");
                }
            }
            ControlEvent::TaskTerminated { tid } => {
                if self.tree.remove_task(tid).is_some() {
                    self.task_terminated(tid);
                }
            }
            ControlEvent::Tick => self.tick(),
        }
        self.status()
    }

    fn task_created(&mut self, task: PinnedTask) {
        debug!("Task {} of process {} created", task.tid, task.pid);
        for monitor in &mut self.monitors {
            self.reporter.check(monitor.start(task.tid));
        }
        self.decide(PolicyEvent::TaskCreated(task));
    }

    fn task_terminated(&mut self, tid: Tid) {
        debug!("Task {tid} terminated");
        for monitor in &mut self.monitors {
            if let Some(value) = self.reporter.check(monitor.stop(tid)) {
                debug!("{}: final value {value} for task {tid}", monitor.name());
            }
        }
        self.decide(PolicyEvent::TaskTerminated { tid });
    }

    fn tick(&mut self) {
        let samples: MonitorSamples = self
            .monitors
            .iter_mut()
            .map(|monitor| {
                let readings = MonitorReadings {
                    value_type: monitor.value_type(),
                    values: monitor.values(&mut self.reporter),
                };
                (monitor.name().to_string(), readings)
            })
            .collect();
        let means = samples
            .iter()
            .filter(|(_, readings)| !readings.values.is_empty())
            .map(|(name, readings)| {
                let values = &readings.values;
                let mean = values.values().sum::<f64>() / values.len() as f64;
                (name.clone(), mean)
            })
            .collect::<BTreeMap<_, _>>();
        trace!("Tick samples: {samples:?}");

        self.decide(PolicyEvent::Tick { samples });
        if let Some(history) = &mut self.history {
            history.record(self.started_at.elapsed(), &self.pinning, means);
        }
    }

    fn decide(&mut self, event: PolicyEvent) {
        match self.policy.decide(&event, &self.pinning) {
            Ok(next) => self.apply(next),
            Err(err) => self.reporter.report(&err),
        }
    }

    /// Hand every changed slot to the executor. A failed pin is reported and the decision is
    /// kept, so that the policy's accounting stays consistent.
    fn apply(&mut self, next: Pinning) {
        if next == self.pinning {
            return;
        }
        for (cpu, task) in next.changes_from(&self.pinning) {
            self.reporter.check(self.executor.pin(task.tid, cpu));
        }
        debug!("Pinning is now {next}");
        self.pinning = next;

        if let Some(history) = &mut self.history {
            history.record(self.started_at.elapsed(), &self.pinning, BTreeMap::new());
        }
    }

    /// Drive the loop until the observed process is gone, the event channel closes, a fatal
    /// error is reported or `shutdown` resolves.
    pub async fn run<F>(&mut self, mut events: mpsc::Receiver<ControlEvent>, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        if self.start() == LoopStatus::Finished {
            return;
        }

        let mut ticker = self.policy.interval().map(|period| {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });
        tokio::pin!(shutdown);

        loop {
            let event = tokio::select! {
                biased;

                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                event = events.recv() => match event {
                    Some(event) => event,
                    None => {
                        debug!("Task events channel closed");
                        break;
                    }
                },
                _ = next_tick(&mut ticker) => ControlEvent::Tick,
            };

            if self.handle(event) == LoopStatus::Finished {
                break;
            }
        }
    }

    /// Stop the policy and release every counter. Returns the recorded history, if any, with
    /// the policy's schedule measurements.
    pub fn shutdown(&mut self) -> Option<PinningHistory> {
        self.policy.stop();
        for monitor in &mut self.monitors {
            monitor.clear_all();
        }
        info!(
            "Control loop stopped, {} conditions reported",
            self.reporter.reported()
        );
        let mut history = self.history.take()?;
        history.schedule = self.policy.schedule_report();
        Some(history)
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}
