use super::schedule::{TaskSequence, format_sequence, parse_schedule, parse_seconds, parse_skip};
use super::{
    MonitorReadings, MonitorSamples, PlacementPolicy, PolicyEvent, interval_opt, parse_interval,
};
use crate::config::{ConfigOpts, ConfigView};
use crate::error::AutopinError;
use crate::monitor::{MONITORS_KEY, ValueType};
use crate::prelude::*;
use crate::topology::NumaTopology;
use autopin_shared::Tid;
use autopin_shared::artifacts::{ScheduleReport, ScheduleResult};
use autopin_shared::pinning::Pinning;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

pub const NAME: &str = "autopin1";

const DEFAULT_INIT_TIME: Duration = Duration::from_secs(15);
const DEFAULT_WARMUP_TIME: Duration = Duration::from_secs(15);
const DEFAULT_MEASURE_TIME: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq)]
enum Phase {
    /// Nothing is pinned yet
    Init,
    Warmup,
    /// Readings of the measuring monitor when the measurement started
    Measure { baseline: BTreeMap<Tid, f64> },
    /// The best sequence is applied for the rest of the run
    Done,
}

/// Tries every CPU sequence of `autopin1.schedule` in turn and keeps the best one.
///
/// After `init_time`, each sequence is applied, left to settle for `warmup_time`, then measured
/// for `measure_time` with one monitor (`autopin1.monitor`, the first of `PerformanceMonitors` by
/// default). The result of a sequence is the mean counter rate over the threads alive for the
/// whole measurement, and the monitor's value type tells whether higher or lower is better.
///
/// Phases advance on the periodic tick, so the interval must not be zero.
#[derive(Debug)]
pub struct Autopin1Policy {
    interval: Duration,
    init_time: Duration,
    warmup_time: Duration,
    measure_time: Duration,
    openmp_icc: bool,
    skip: Vec<String>,
    monitor: String,
    schedule: Vec<Vec<usize>>,
    tasks: TaskSequence,
    phase: Phase,
    phase_elapsed: Duration,
    current: usize,
    results: Vec<ScheduleResult>,
    best: Option<usize>,
}

impl Default for Autopin1Policy {
    fn default() -> Self {
        Self {
            interval: super::DEFAULT_INTERVAL,
            init_time: DEFAULT_INIT_TIME,
            warmup_time: DEFAULT_WARMUP_TIME,
            measure_time: DEFAULT_MEASURE_TIME,
            openmp_icc: false,
            skip: Vec::new(),
            monitor: String::new(),
            schedule: Vec::new(),
            tasks: TaskSequence::default(),
            phase: Phase::Init,
            phase_elapsed: Duration::ZERO,
            current: 0,
            results: Vec::new(),
            best: None,
        }
    }
}

fn key(option: &str) -> String {
    format!("{NAME}.{option}")
}

impl Autopin1Policy {
    /// The sequence threads should currently follow, `None` before the first one is applied.
    fn active_sequence(&self) -> Option<&[usize]> {
        match self.phase {
            Phase::Init => None,
            Phase::Warmup | Phase::Measure { .. } => Some(&self.schedule[self.current]),
            Phase::Done => self
                .best
                .map(|best| self.results[best].cpus.as_slice())
                .or_else(|| self.schedule.last().map(Vec::as_slice)),
        }
    }

    fn pinning_for(&self, current: &Pinning) -> Pinning {
        match self.active_sequence() {
            Some(cpus) => self.tasks.pinning(cpus, current.cpu_count()),
            None => current.clone(),
        }
    }

    fn readings<'a>(
        &self,
        samples: &'a MonitorSamples,
    ) -> Result<&'a MonitorReadings, AutopinError> {
        samples.get(&self.monitor).ok_or_else(|| {
            AutopinError::bad_config(
                key("monitor"),
                format!("no readings from monitor `{}`", self.monitor),
            )
        })
    }

    fn start_sequence(&mut self, index: usize) {
        self.current = index;
        self.phase = Phase::Warmup;
        info!(
            "Testing pinning {} of {}: {}",
            index + 1,
            self.schedule.len(),
            format_sequence(&self.schedule[index])
        );
    }

    fn finish_sequence(
        &mut self,
        baseline: &BTreeMap<Tid, f64>,
        samples: &MonitorSamples,
    ) -> Result<(), AutopinError> {
        let readings = self.readings(samples)?;
        if readings.value_type == ValueType::Unknown {
            return Err(AutopinError::bad_config(
                format!("{}.valtype", self.monitor),
                "the measuring monitor must have a max or min value type",
            ));
        }

        let seconds = self.measure_time.as_secs_f64();
        let rates = readings
            .values
            .iter()
            .filter_map(|(tid, &end)| baseline.get(tid).map(|&start| (end - start) / seconds))
            .collect::<Vec<_>>();
        let cpus = self.schedule[self.current].clone();

        if rates.is_empty() {
            warn!(
                "No task ran through the measurement of pinning {}",
                format_sequence(&cpus)
            );
        } else {
            let value = rates.iter().sum::<f64>() / rates.len() as f64;
            info!(
                "Result of pinning {}: {value}",
                format_sequence(&cpus)
            );
            let better = match self.best.map(|best| self.results[best].value) {
                None => true,
                Some(best) if readings.value_type == ValueType::Min => value < best,
                Some(best) => value > best,
            };
            self.results.push(ScheduleResult { cpus, value });
            if better {
                self.best = Some(self.results.len() - 1);
            }
        }

        if self.current + 1 < self.schedule.len() {
            self.start_sequence(self.current + 1);
        } else {
            self.phase = Phase::Done;
            match self.active_sequence() {
                Some(best) => info!("All pinnings tested, applying {}", format_sequence(best)),
                None => warn!("All pinnings tested, none could be measured"),
            }
        }
        Ok(())
    }

    fn tick(
        &mut self,
        samples: &MonitorSamples,
        current: &Pinning,
    ) -> Result<Pinning, AutopinError> {
        let due = match self.phase {
            Phase::Init => self.init_time,
            Phase::Warmup => self.warmup_time,
            Phase::Measure { .. } => self.measure_time,
            Phase::Done => return Ok(current.clone()),
        };
        self.phase_elapsed += self.interval;
        if self.phase_elapsed < due {
            return Ok(current.clone());
        }
        self.phase_elapsed = Duration::ZERO;

        match std::mem::replace(&mut self.phase, Phase::Done) {
            Phase::Init => self.start_sequence(0),
            Phase::Warmup => {
                let baseline = self.readings(samples)?.values.clone();
                debug!("Measuring pinning {}", self.current + 1);
                self.phase = Phase::Measure { baseline };
            }
            Phase::Measure { baseline } => self.finish_sequence(&baseline, samples)?,
            Phase::Done => {}
        }
        Ok(self.pinning_for(current))
    }
}

impl PlacementPolicy for Autopin1Policy {
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
                key("interval"),
                "the pinning schedule advances on the periodic tick, it cannot be disabled",
            ));
        }
        self.schedule = parse_schedule(config, &key("schedule"), topology)?;

        let listed = config.list(MONITORS_KEY);
        self.monitor = match config.single(&key("monitor"))? {
            Some(name) if listed.iter().any(|m| m == name) => name.to_string(),
            Some(name) => {
                return Err(AutopinError::bad_config(
                    key("monitor"),
                    format!("monitor `{name}` is not listed in {MONITORS_KEY}"),
                ));
            }
            None => listed
                .first()
                .cloned()
                .ok_or_else(|| AutopinError::bad_config(MONITORS_KEY, "no performance monitor"))?,
        };

        self.init_time = parse_seconds(config, &key("init_time"), DEFAULT_INIT_TIME)?;
        self.warmup_time = parse_seconds(config, &key("warmup_time"), DEFAULT_WARMUP_TIME)?;
        self.measure_time = parse_seconds(config, &key("measure_time"), DEFAULT_MEASURE_TIME)?;
        if self.measure_time.is_zero() {
            return Err(AutopinError::bad_config(
                key("measure_time"),
                "must be at least one second",
            ));
        }

        self.openmp_icc = config
            .parse_single::<bool>(&key("openmp_icc"))?
            .unwrap_or(false);
        self.skip = config.list(&key("skip")).to_vec();
        let mut skip = parse_skip(&key("skip"), &self.skip)?;
        if self.openmp_icc {
            // The second thread of an icc OpenMP program only manages the others
            skip.insert(1);
        }
        self.tasks = TaskSequence::new(skip);
        Ok(())
    }

    fn config_opts(&self) -> ConfigOpts {
        vec![
            interval_opt(self.interval),
            ("monitor".to_string(), vec![self.monitor.clone()]),
            (
                "schedule".to_string(),
                self.schedule.iter().map(|cpus| format_sequence(cpus)).collect(),
            ),
            (
                "init_time".to_string(),
                vec![self.init_time.as_secs().to_string()],
            ),
            (
                "warmup_time".to_string(),
                vec![self.warmup_time.as_secs().to_string()],
            ),
            (
                "measure_time".to_string(),
                vec![self.measure_time.as_secs().to_string()],
            ),
            ("openmp_icc".to_string(), vec![self.openmp_icc.to_string()]),
            ("skip".to_string(), self.skip.clone()),
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
            PolicyEvent::TaskCreated(task) => {
                self.tasks.push(*task);
                Ok(self.pinning_for(current))
            }
            PolicyEvent::TaskTerminated { tid } => {
                self.tasks.remove(*tid);
                if let Phase::Measure { baseline } = &mut self.phase {
                    baseline.remove(tid);
                }
                Ok(self.pinning_for(current))
            }
            PolicyEvent::Tick { samples } => self.tick(samples, current),
        }
    }

    fn schedule_report(&self) -> Option<ScheduleReport> {
        Some(ScheduleReport {
            results: self.results.clone(),
            best: self.best.map(|best| self.results[best].cpus.clone()),
        })
    }
}
