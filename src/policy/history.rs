use super::schedule::{TaskSequence, format_sequence, parse_sequence, parse_skip};
use super::{PlacementPolicy, PolicyEvent, interval_opt, parse_interval};
use crate::config::{ConfigOpts, ConfigView};
use crate::error::AutopinError;
use crate::prelude::*;
use crate::topology::NumaTopology;
use autopin_shared::artifacts::PinningHistory;
use autopin_shared::pinning::Pinning;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub const NAME: &str = "history";

const FILE_KEY: &str = "history.file";

/// Replays the best pinning found by an earlier `autopin1` run.
///
/// The history saved by that run is read from `history.file`. Its best CPU sequence is applied
/// once the recorded `init_time` has elapsed, skipping the same threads as the recorded run.
#[derive(Debug)]
pub struct HistoryPolicy {
    interval: Duration,
    file: PathBuf,
    init_time: Duration,
    skip: Vec<String>,
    cpus: Vec<usize>,
    tasks: TaskSequence,
    elapsed: Duration,
}

impl Default for HistoryPolicy {
    fn default() -> Self {
        Self {
            interval: super::DEFAULT_INTERVAL,
            file: PathBuf::new(),
            init_time: Duration::ZERO,
            skip: Vec::new(),
            cpus: Vec::new(),
            tasks: TaskSequence::default(),
            elapsed: Duration::ZERO,
        }
    }
}

/// The single value of a recorded option.
fn recorded<'a>(history: &'a PinningHistory, option: &str) -> Option<&'a str> {
    match history.policy_option(option)? {
        [value] => Some(value.as_str()),
        _ => None,
    }
}

impl HistoryPolicy {
    fn started(&self) -> bool {
        self.elapsed >= self.init_time
    }

    fn pinning_for(&self, current: &Pinning) -> Pinning {
        if self.started() {
            self.tasks.pinning(&self.cpus, current.cpu_count())
        } else {
            current.clone()
        }
    }

    fn replay(
        &mut self,
        history: &PinningHistory,
        topology: &NumaTopology,
    ) -> Result<(), AutopinError> {
        let invalid = |reason: String| AutopinError::bad_config(FILE_KEY, reason);

        let best = history
            .schedule
            .as_ref()
            .and_then(|report| report.best.as_ref())
            .ok_or_else(|| invalid(format!("{} holds no best pinning", self.file.display())))?;
        self.cpus = parse_sequence(FILE_KEY, &format_sequence(best), topology)?;

        self.init_time = match recorded(history, "init_time") {
            Some(raw) => Duration::from_secs(
                raw.parse()
                    .map_err(|_| invalid(format!("recorded init_time `{raw}` is invalid")))?,
            ),
            None => Duration::ZERO,
        };

        self.skip = history
            .policy_option("skip")
            .map(<[String]>::to_vec)
            .unwrap_or_default();
        let mut skip = parse_skip(FILE_KEY, &self.skip)?;
        if recorded(history, "openmp_icc") == Some("true") {
            skip.insert(1);
        }
        self.tasks = TaskSequence::new(skip);
        Ok(())
    }
}

impl PlacementPolicy for HistoryPolicy {
    fn name(&self) -> &'static str {
        NAME
    }

    fn configure(
        &mut self,
        config: &ConfigView,
        topology: &Arc<NumaTopology>,
    ) -> Result<(), AutopinError> {
        self.interval = parse_interval(config, NAME)?;
        if self.interval.is_zero() {
            return Err(AutopinError::bad_config(
                format!("{NAME}.interval"),
                "the replay waits for the recorded init_time on the periodic tick",
            ));
        }

        self.file = PathBuf::from(config.required(FILE_KEY)?);
        let history = PinningHistory::load_from(&self.file).map_err(|e| {
            AutopinError::bad_config(
                FILE_KEY,
                format!("cannot read {}: {e:#}", self.file.display()),
            )
        })?;
        self.replay(&history, topology)?;
        info!(
            "Replaying pinning {} from {} after {}s",
            format_sequence(&self.cpus),
            self.file.display(),
            self.init_time.as_secs()
        );
        Ok(())
    }

    fn config_opts(&self) -> ConfigOpts {
        vec![
            interval_opt(self.interval),
            ("file".to_string(), vec![self.file.display().to_string()]),
        ]
    }

    fn interval(&self) -> Option<Duration> {
        Some(self.interval)
    }

    fn get_pinning(
        &mut self,
        event: &PolicyEvent,
        current: &Pinning,
    ) -> Result<Pinning, AutopinError> {
        match event {
            PolicyEvent::TaskCreated(task) => self.tasks.push(*task),
            PolicyEvent::TaskTerminated { tid } => self.tasks.remove(*tid),
            PolicyEvent::Tick { .. } => {
                if self.started() {
                    return Ok(current.clone());
                }
                self.elapsed += self.interval;
                if self.started() {
                    info!("Applying replayed pinning {}", format_sequence(&self.cpus));
                }
            }
        }
        Ok(self.pinning_for(current))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autopin_shared::artifacts::{ArtifactExt, ScheduleReport, ScheduleResult};
    use autopin_shared::pinning::PinnedTask;
    use crate::policy::MonitorSamples;
    use std::path::Path;

    fn recorded_run(options: &[(&str, &str)], best: Option<Vec<usize>>) -> PinningHistory {
        let options = options
            .iter()
            .map(|(key, value)| (key.to_string(), vec![value.to_string()]))
            .collect();
        let mut history = PinningHistory::new(40, "autopin1", options, vec!["cycles".to_string()]);
        history.schedule = Some(ScheduleReport {
            results: best
                .iter()
                .map(|cpus| ScheduleResult {
                    cpus: cpus.clone(),
                    value: 1.0,
                })
                .collect(),
            best,
        });
        history
    }

    fn configured(dir: &Path, history: &PinningHistory) -> Result<HistoryPolicy, AutopinError> {
        history.save_with_pid_to(dir, history.root_pid).unwrap();
        let mut config = ConfigView::default();
        config.set("history.interval", ["1000"]);
        config.set(
            FILE_KEY,
            [dir.join("40.PinningHistory.msgpack").display().to_string()],
        );

        let mut policy = HistoryPolicy::default();
        policy.configure(&config, &Arc::new(NumaTopology::single_node(4)))?;
        Ok(policy)
    }

    fn tick() -> PolicyEvent {
        PolicyEvent::Tick {
            samples: MonitorSamples::new(),
        }
    }

    fn created(tid: i32) -> PolicyEvent {
        PolicyEvent::TaskCreated(PinnedTask::new(40, tid))
    }

    #[test]
    fn test_best_pinning_applied_after_init_time() {
        let dir = tempfile::tempdir().unwrap();
        let history = recorded_run(&[("init_time", "2")], Some(vec![3, 1]));
        let mut policy = configured(dir.path(), &history).unwrap();
        assert_eq!(policy.cpus, vec![3, 1]);

        let mut pinning = Pinning::new(4);
        for event in [created(40), created(41), tick()] {
            pinning = policy.get_pinning(&event, &pinning).unwrap();
        }
        assert_eq!(pinning, Pinning::new(4), "still initialising");

        pinning = policy.get_pinning(&tick(), &pinning).unwrap();
        assert_eq!(pinning.cpu_of(40), Some(3));
        assert_eq!(pinning.cpu_of(41), Some(1));

        pinning = policy.get_pinning(&created(42), &pinning).unwrap();
        assert_eq!(pinning.cpu_of(42), None, "past the end of the sequence");
    }

    #[test]
    fn test_recorded_skip_and_openmp_icc() {
        let dir = tempfile::tempdir().unwrap();
        let history = recorded_run(&[("skip", "0"), ("openmp_icc", "true")], Some(vec![2, 0]));
        let mut policy = configured(dir.path(), &history).unwrap();
        assert_eq!(policy.init_time, Duration::ZERO);

        let mut pinning = Pinning::new(4);
        for tid in 40..44 {
            pinning = policy.get_pinning(&created(tid), &pinning).unwrap();
        }
        let cpus = (40..44).map(|tid| pinning.cpu_of(tid)).collect::<Vec<_>>();
        assert_eq!(cpus, [None, None, Some(2), Some(0)]);
    }

    #[test]
    fn test_history_without_best_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = configured(dir.path(), &recorded_run(&[], None)).unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("holds no best pinning"), "{err}");
    }

    #[test]
    fn test_best_pinning_must_fit_topology() {
        let dir = tempfile::tempdir().unwrap();
        let err = configured(dir.path(), &recorded_run(&[], Some(vec![0, 7]))).unwrap_err();
        assert!(err.to_string().contains("CPU 7"), "{err}");
    }

    #[test]
    fn test_missing_file_is_rejected() {
        let mut config = ConfigView::default();
        config.set(FILE_KEY, ["/nonexistent/40.PinningHistory.msgpack"]);
        let err = HistoryPolicy::default()
            .configure(&config, &Arc::new(NumaTopology::single_node(1)))
            .unwrap_err();
        assert!(err.to_string().contains("cannot read"), "{err}");

        let err = HistoryPolicy::default()
            .configure(&ConfigView::default(), &Arc::new(NumaTopology::single_node(1)))
            .unwrap_err();
        assert!(err.to_string().contains(FILE_KEY));
    }
}
