use super::*;
use crate::config::{ConfigOpts, ConfigView};
use crate::error::AutopinError;
use crate::monitor::ValueType;
use crate::policy::{PlacementPolicy, create_policy};
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;
use std::time::Duration;

const ROOT: Pid = 100;

/// Records which tasks are monitored, every task reads as its own tid.
#[derive(Clone, Default)]
struct FakeMonitor {
    monitored: Rc<RefCell<BTreeSet<Tid>>>,
}

impl PerformanceMonitor for FakeMonitor {
    fn name(&self) -> &str {
        "fake"
    }

    fn kind(&self) -> &'static str {
        "fake"
    }

    fn value_type(&self) -> ValueType {
        ValueType::Max
    }

    fn configure(&mut self, _: &ConfigView) -> Result<(), AutopinError> {
        Ok(())
    }

    fn config_opts(&self) -> ConfigOpts {
        Vec::new()
    }

    fn start(&mut self, tid: Tid) -> Result<(), AutopinError> {
        self.monitored.borrow_mut().insert(tid);
        Ok(())
    }

    fn value(&mut self, tid: Tid) -> Result<f64, AutopinError> {
        Ok(if self.monitored.borrow().contains(&tid) {
            tid as f64
        } else {
            0.0
        })
    }

    fn stop(&mut self, tid: Tid) -> Result<f64, AutopinError> {
        let value = self.value(tid)?;
        self.monitored.borrow_mut().remove(&tid);
        Ok(value)
    }

    fn clear(&mut self, tid: Tid) {
        self.monitored.borrow_mut().remove(&tid);
    }

    fn monitored_tasks(&self) -> Vec<Tid> {
        self.monitored.borrow().iter().copied().collect()
    }
}

/// Records every pin and fails for selected tasks.
#[derive(Clone, Default)]
struct FakeExecutor {
    pinned: Rc<RefCell<Vec<(Tid, usize)>>>,
    failing: Rc<RefCell<BTreeSet<Tid>>>,
}

impl PinningExecutor for FakeExecutor {
    fn pin(&mut self, tid: Tid, cpu: usize) -> Result<(), AutopinError> {
        if self.failing.borrow().contains(&tid) {
            return Err(AutopinError::ExecutorFailure {
                tid,
                cpu,
                source: std::io::Error::from_raw_os_error(libc::EPERM),
            });
        }
        self.pinned.borrow_mut().push((tid, cpu));
        Ok(())
    }
}

struct Harness {
    control: ControlLoop,
    monitor: FakeMonitor,
    executor: FakeExecutor,
}

fn harness_with(policy: Box<dyn PlacementPolicy>, config: &ConfigView) -> Harness {
    let topology = Arc::new(
        NumaTopology::from_parts(vec![0, 0, 1, 1], vec![vec![10, 20], vec![20, 10]]).unwrap(),
    );
    let mut driver = PolicyDriver::new(policy);
    driver.configure(config, &topology).unwrap();

    let monitor = FakeMonitor::default();
    let executor = FakeExecutor::default();
    let control = ControlLoop::new(
        ProcessTree::new(ROOT),
        topology,
        driver,
        vec![Box::new(monitor.clone()) as Box<dyn PerformanceMonitor>],
        Box::new(executor.clone()),
        Reporter::default(),
    );
    Harness {
        control,
        monitor,
        executor,
    }
}

fn harness() -> Harness {
    let mut config = ConfigView::default();
    config.set("scatter.interval", ["0"]);
    harness_with(create_policy("scatter").unwrap(), &config)
}

#[test]
fn test_start_places_root_task() {
    let mut h = harness();
    assert_eq!(h.control.start(), LoopStatus::Running);

    assert_eq!(h.control.pinning().cpu_of(ROOT), Some(0));
    assert_eq!(*h.executor.pinned.borrow(), vec![(ROOT, 0)]);
    assert_eq!(h.monitor.monitored_tasks(), vec![ROOT]);
}

#[test]
fn test_created_tasks_are_monitored_and_scattered() {
    let mut h = harness();
    h.control.start();

    h.control.handle(ControlEvent::TaskCreated { pid: ROOT, tid: 101 });
    h.control.handle(ControlEvent::ChildProcess {
        parent: ROOT,
        child: 200,
    });
    h.control.handle(ControlEvent::TaskCreated { pid: 200, tid: 201 });

    assert_eq!(
        *h.executor.pinned.borrow(),
        vec![(ROOT, 0), (101, 2), (200, 1), (201, 3)]
    );
    assert_eq!(h.monitor.monitored_tasks(), vec![ROOT, 101, 200, 201]);
    assert_eq!(h.control.tree().find_task(201).map(|n| n.pid()), Some(200));
}

#[test]
fn test_events_for_untracked_processes_are_ignored() {
    let mut h = harness();
    h.control.start();

    h.control.handle(ControlEvent::TaskCreated { pid: 999, tid: 1000 });
    h.control.handle(ControlEvent::ChildProcess {
        parent: 999,
        child: 1001,
    });
    h.control.handle(ControlEvent::TaskTerminated { tid: 1000 });

    assert_eq!(h.executor.pinned.borrow().len(), 1);
    assert_eq!(h.monitor.monitored_tasks(), vec![ROOT]);
    assert_eq!(h.control.reporter().reported(), 0);
}

#[test]
fn test_duplicate_task_event_is_ignored() {
    let mut h = harness();
    h.control.start();
    h.control.handle(ControlEvent::ChildProcess {
        parent: ROOT,
        child: 200,
    });
    h.control.handle(ControlEvent::TaskCreated { pid: 200, tid: 200 });

    assert_eq!(h.executor.pinned.borrow().len(), 2);
}

#[test]
fn test_terminated_task_frees_cpu_and_monitor() {
    let mut h = harness();
    h.control.start();
    h.control.handle(ControlEvent::TaskCreated { pid: ROOT, tid: 101 });

    let status = h.control.handle(ControlEvent::TaskTerminated { tid: 101 });
    assert_eq!(status, LoopStatus::Running);
    assert_eq!(h.control.pinning().cpu_of(101), None);
    assert_eq!(h.monitor.monitored_tasks(), vec![ROOT]);

    // The freed node is the least loaded one again
    h.control.handle(ControlEvent::TaskCreated { pid: ROOT, tid: 102 });
    assert_eq!(h.control.pinning().cpu_of(102), Some(2));
}

#[test_log::test]
fn test_executor_failure_does_not_stop_the_loop() {
    let mut h = harness();
    h.executor.failing.borrow_mut().insert(101);
    h.control.start();

    let status = h.control.handle(ControlEvent::TaskCreated { pid: ROOT, tid: 101 });
    assert_eq!(status, LoopStatus::Running);
    h.control.handle(ControlEvent::TaskCreated { pid: ROOT, tid: 102 });

    assert_eq!(h.control.reporter().reported(), 1);
    assert!(!h.control.reporter().is_fatal());
    assert_eq!(*h.executor.pinned.borrow(), vec![(ROOT, 0), (102, 1)]);
    // The decision is kept even though the OS refused it
    assert_eq!(h.control.pinning().cpu_of(101), Some(2));
}

#[test]
fn test_loop_finishes_when_root_has_no_tasks() {
    let mut h = harness();
    h.control.start();
    h.control.handle(ControlEvent::TaskCreated { pid: ROOT, tid: 101 });

    assert_eq!(
        h.control.handle(ControlEvent::TaskTerminated { tid: ROOT }),
        LoopStatus::Running
    );
    assert_eq!(
        h.control.handle(ControlEvent::TaskTerminated { tid: 101 }),
        LoopStatus::Finished
    );
}

#[test]
fn test_fatal_report_finishes_the_loop() {
    let mut h = harness();
    h.control.start();
    h.control.shutdown();

    // The policy is stopped, deciding again is a fatal error
    let status = h.control.handle(ControlEvent::TaskCreated { pid: ROOT, tid: 101 });
    assert_eq!(status, LoopStatus::Finished);
    assert!(h.control.reporter().is_fatal());
}

#[test]
fn test_shutdown_releases_all_monitors() {
    let mut h = harness();
    h.control.start();
    h.control.handle(ControlEvent::TaskCreated { pid: ROOT, tid: 101 });

    assert!(h.control.shutdown().is_none());
    assert!(h.monitor.monitored_tasks().is_empty());
}

#[test]
fn test_tick_records_history() {
    let mut h = harness();
    h.control.record_history();
    h.control.start();
    h.control.handle(ControlEvent::TaskCreated { pid: ROOT, tid: 102 });
    h.control.handle(ControlEvent::Tick);

    let history = h.control.shutdown().unwrap();
    assert_eq!(history.root_pid, ROOT);
    assert_eq!(history.policy, "scatter");
    assert_eq!(history.monitors, vec!["fake".to_string()]);
    assert_eq!(history.schedule, None);

    // One entry per applied pinning, then the tick
    assert_eq!(history.entries.len(), 3);
    let tick = history.entries.last().unwrap();
    assert_eq!(tick.values.get("fake"), Some(&101.0));
    assert_eq!(tick.pinning, *h.control.pinning());
}

#[test]
fn test_schedule_search_is_saved_with_history() {
    let mut config = ConfigView::default();
    config.set("PerformanceMonitors", ["fake"]);
    config.set("autopin1.interval", ["1000"]);
    config.set("autopin1.init_time", ["1"]);
    config.set("autopin1.warmup_time", ["1"]);
    config.set("autopin1.measure_time", ["1"]);
    config.set("autopin1.schedule", ["0:1", "3:2"]);
    let mut h = harness_with(create_policy("autopin1").unwrap(), &config);
    h.control.record_history();
    h.control.start();
    assert_eq!(h.control.pinning().cpu_of(ROOT), None);

    h.control.handle(ControlEvent::Tick);
    h.control.handle(ControlEvent::TaskCreated { pid: ROOT, tid: 101 });
    assert_eq!(*h.executor.pinned.borrow(), vec![(ROOT, 0), (101, 1)]);

    h.control.handle(ControlEvent::Tick);
    h.control.handle(ControlEvent::Tick);
    assert_eq!(h.control.pinning().cpu_of(ROOT), Some(3));
    assert_eq!(h.control.pinning().cpu_of(101), Some(2));

    h.control.handle(ControlEvent::Tick);
    h.control.handle(ControlEvent::Tick);
    // Counters never move, the first sequence stays the best
    assert_eq!(h.control.pinning().cpu_of(ROOT), Some(0));
    assert_eq!(h.control.pinning().cpu_of(101), Some(1));

    let schedule = h.control.shutdown().unwrap().schedule.unwrap();
    assert_eq!(schedule.results.len(), 2);
    assert_eq!(schedule.results[1].value, 0.0);
    assert_eq!(schedule.best, Some(vec![0, 1]));
}

#[tokio::test(flavor = "current_thread")]
async fn test_run_until_channel_closes() {
    let mut h = harness();
    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    tx.send(ControlEvent::TaskCreated { pid: ROOT, tid: 101 })
        .await
        .unwrap();
    drop(tx);

    h.control.run(rx, std::future::pending()).await;
    assert_eq!(h.control.pinning().cpu_of(101), Some(2));
    assert_eq!(h.control.status(), LoopStatus::Running);
}

#[tokio::test(flavor = "current_thread")]
async fn test_run_stops_when_root_exits() {
    let mut h = harness();
    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    tx.send(ControlEvent::TaskTerminated { tid: ROOT })
        .await
        .unwrap();
    tx.send(ControlEvent::TaskCreated { pid: ROOT, tid: 101 })
        .await
        .unwrap();

    h.control.run(rx, std::future::pending()).await;
    assert_eq!(h.control.status(), LoopStatus::Finished);
    assert_eq!(h.control.pinning().cpu_of(101), None);
    drop(tx);
}

#[tokio::test(flavor = "current_thread")]
async fn test_run_honours_shutdown() {
    let mut h = harness();
    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    tx.send(ControlEvent::TaskCreated { pid: ROOT, tid: 101 })
        .await
        .unwrap();

    h.control.run(rx, std::future::ready(())).await;
    assert_eq!(h.control.pinning().cpu_of(101), None);
    drop(tx);
}

#[tokio::test(flavor = "current_thread")]
async fn test_run_ticks() {
    let mut config = ConfigView::default();
    config.set("noop.interval", ["1"]);
    let mut h = harness_with(create_policy("noop").unwrap(), &config);
    h.control.record_history();
    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

    let shutdown = tokio::time::sleep(Duration::from_millis(50));
    h.control.run(rx, shutdown).await;

    let history = h.control.shutdown().unwrap();
    assert!(!history.entries.is_empty());
    assert_eq!(history.entries[0].values.get("fake"), Some(&(ROOT as f64)));
    drop(tx);
}
