//! Discovers the observed process's descendants and threads by polling `/proc`.

use crate::control_loop::ControlEvent;
use crate::prelude::*;
use autopin_shared::{Pid, Tid};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

/// A process of the observed hierarchy at scan time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSnapshot {
    pub pid: Pid,
    pub parent: Option<Pid>,
    pub tasks: BTreeSet<Tid>,
}

/// Events turning `previous` into `next`: new processes first, each followed by its new threads,
/// then the threads that vanished. Both snapshots list parents before their children.
pub fn diff_snapshots(previous: &[ProcessSnapshot], next: &[ProcessSnapshot]) -> Vec<ControlEvent> {
    let known: HashMap<Pid, &ProcessSnapshot> = previous.iter().map(|p| (p.pid, p)).collect();
    let mut events = Vec::new();

    for process in next {
        let before = known.get(&process.pid);
        if before.is_none() {
            if let Some(parent) = process.parent {
                events.push(ControlEvent::ChildProcess {
                    parent,
                    child: process.pid,
                });
            }
        }
        for &tid in &process.tasks {
            if !before.is_some_and(|before| before.tasks.contains(&tid)) {
                events.push(ControlEvent::TaskCreated {
                    pid: process.pid,
                    tid,
                });
            }
        }
    }

    let alive: HashSet<Tid> = next.iter().flat_map(|p| p.tasks.iter().copied()).collect();
    for process in previous {
        for &tid in &process.tasks {
            if !alive.contains(&tid) {
                events.push(ControlEvent::TaskTerminated { tid });
            }
        }
    }
    events
}

/// Threads of a live process, `None` once it exited or became a zombie.
fn live_tasks(pid: Pid) -> Option<BTreeSet<Tid>> {
    let process = procfs::process::Process::new(pid).ok()?;
    let stat = process.stat().ok()?;
    if matches!(stat.state, 'Z' | 'X' | 'x') {
        return None;
    }
    let tasks = process.tasks().ok()?;
    Some(tasks.filter_map(Result::ok).map(|task| task.tid).collect())
}

/// Snapshot of `root` and its descendants in breadth-first order, empty once `root` is gone.
///
/// Descendants are found through their current parent pid. A process whose parent exited is
/// reparented to init or a subreaper, so it and its own children drop out of the snapshot and
/// are reported as terminated.
pub fn scan(root: Pid) -> Result<Vec<ProcessSnapshot>> {
    let Some(root_tasks) = live_tasks(root) else {
        return Ok(Vec::new());
    };

    let mut children_of: BTreeMap<Pid, BTreeSet<Pid>> = BTreeMap::new();
    for process in procfs::process::all_processes().context("Failed to list processes")? {
        // Processes may exit while we iterate
        let Ok(stat) = process.and_then(|p| p.stat()) else {
            continue;
        };
        children_of.entry(stat.ppid).or_default().insert(stat.pid);
    }

    let mut snapshot = vec![ProcessSnapshot {
        pid: root,
        parent: None,
        tasks: root_tasks,
    }];
    let mut queue = VecDeque::from([root]);
    while let Some(parent) = queue.pop_front() {
        for &child in children_of.get(&parent).into_iter().flatten() {
            let Some(tasks) = live_tasks(child) else {
                continue;
            };
            snapshot.push(ProcessSnapshot {
                pid: child,
                parent: Some(parent),
                tasks,
            });
            queue.push_back(child);
        }
    }
    Ok(snapshot)
}

/// Polls the hierarchy of one process and forwards the differences to the control loop.
pub struct TaskWatcher {
    root: Pid,
    poll_interval: Duration,
    known: Vec<ProcessSnapshot>,
}

impl TaskWatcher {
    /// The root's main thread is considered known, the control loop starts out with it.
    pub fn new(root: Pid, poll_interval: Duration) -> Self {
        Self {
            root,
            poll_interval,
            known: vec![ProcessSnapshot {
                pid: root,
                parent: None,
                tasks: BTreeSet::from([root]),
            }],
        }
    }

    /// Poll until the root process exits or the control loop hangs up. Dropping the sender on
    /// return closes the channel.
    pub async fn run(mut self, events: mpsc::Sender<ControlEvent>) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let next = match scan(self.root) {
                Ok(next) => next,
                Err(err) => {
                    warn!("Failed to scan the tasks of process {}: {err:#}", self.root);
                    continue;
                }
            };

            for event in diff_snapshots(&self.known, &next) {
                if events.send(event).await.is_err() {
                    debug!("Control loop is gone, stopping the task watcher");
                    return;
                }
            }

            if next.is_empty() {
                info!("Process {} exited", self.root);
                return;
            }
            self.known = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn process(pid: Pid, parent: Option<Pid>, tasks: &[Tid]) -> ProcessSnapshot {
        ProcessSnapshot {
            pid,
            parent,
            tasks: tasks.iter().copied().collect(),
        }
    }

    #[test]
    fn test_new_process_announced_before_its_tasks() {
        let previous = vec![process(1, None, &[1])];
        let next = vec![process(1, None, &[1, 2]), process(5, Some(1), &[5, 6])];

        assert_eq!(
            diff_snapshots(&previous, &next),
            vec![
                ControlEvent::TaskCreated { pid: 1, tid: 2 },
                ControlEvent::ChildProcess {
                    parent: 1,
                    child: 5
                },
                ControlEvent::TaskCreated { pid: 5, tid: 5 },
                ControlEvent::TaskCreated { pid: 5, tid: 6 },
            ]
        );
    }

    #[test]
    fn test_terminations_come_last() {
        let previous = vec![process(1, None, &[1, 2]), process(5, Some(1), &[5])];
        let next = vec![process(1, None, &[1, 3])];

        assert_eq!(
            diff_snapshots(&previous, &next),
            vec![
                ControlEvent::TaskCreated { pid: 1, tid: 3 },
                ControlEvent::TaskTerminated { tid: 2 },
                ControlEvent::TaskTerminated { tid: 5 },
            ]
        );
    }

    #[test]
    fn test_root_exit_terminates_everything() {
        let previous = vec![process(1, None, &[1, 2])];
        assert_eq!(
            diff_snapshots(&previous, &[]),
            vec![
                ControlEvent::TaskTerminated { tid: 1 },
                ControlEvent::TaskTerminated { tid: 2 },
            ]
        );
    }

    #[test]
    fn test_unchanged_snapshot_is_silent() {
        let snapshot = vec![process(1, None, &[1, 2]), process(5, Some(1), &[5])];
        assert!(diff_snapshots(&snapshot, &snapshot).is_empty());
    }

    #[test]
    fn test_scan_current_process() {
        let pid = std::process::id() as Pid;
        let snapshot = scan(pid).unwrap();

        assert_eq!(snapshot[0].pid, pid);
        assert_eq!(snapshot[0].parent, None);
        assert!(snapshot[0].tasks.contains(&pid));
    }

    #[test]
    fn test_scan_finds_child_process() {
        let mut child = std::process::Command::new("sleep").arg("5").spawn().unwrap();
        let pid = std::process::id() as Pid;
        let snapshot = scan(pid).unwrap();
        child.kill().unwrap();
        child.wait().unwrap();

        let child_pid = child.id() as Pid;
        let found = snapshot.iter().find(|p| p.pid == child_pid).unwrap();
        assert_eq!(found.parent, Some(pid));
        assert!(found.tasks.contains(&child_pid));
    }

    #[test]
    fn test_scan_missing_process_is_empty() {
        assert!(scan(i32::MAX).unwrap().is_empty());
    }
}
