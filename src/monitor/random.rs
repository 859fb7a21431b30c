use super::{PerformanceMonitor, ValueType};
use crate::config::{ConfigOpts, ConfigView};
use crate::error::AutopinError;
use autopin_shared::Tid;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeSet;

pub const KIND: &str = "random";

/// Produces uniformly distributed readings in `[rand_min, rand_max)` for every monitored task.
///
/// Holds no OS resources, which makes it handy to drive policies without counter access.
pub struct RandomMonitor {
    name: String,
    min: f64,
    max: f64,
    value_type: ValueType,
    tasks: BTreeSet<Tid>,
    rng: StdRng,
}

impl RandomMonitor {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_rng(name, StdRng::from_entropy())
    }

    pub fn with_rng(name: impl Into<String>, rng: StdRng) -> Self {
        Self {
            name: name.into(),
            min: 0.0,
            max: 1.0,
            value_type: ValueType::Max,
            tasks: BTreeSet::new(),
            rng,
        }
    }
}

impl PerformanceMonitor for RandomMonitor {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        KIND
    }

    fn value_type(&self) -> ValueType {
        self.value_type
    }

    fn configure(&mut self, config: &ConfigView) -> Result<(), AutopinError> {
        let min_key = format!("{}.rand_min", self.name);
        let min = config.parse_single::<f64>(&min_key)?.unwrap_or(0.0);
        let max = config
            .parse_single::<f64>(&format!("{}.rand_max", self.name))?
            .unwrap_or(1.0);
        if !(min.is_finite() && max.is_finite() && min < max) {
            return Err(AutopinError::bad_config(
                min_key,
                format!("the range [{min}, {max}) is empty"),
            ));
        }

        self.value_type = config
            .parse_single::<ValueType>(&format!("{}.valtype", self.name))?
            .unwrap_or_default();
        self.min = min;
        self.max = max;
        Ok(())
    }

    fn config_opts(&self) -> ConfigOpts {
        vec![
            ("rand_min".to_string(), vec![self.min.to_string()]),
            ("rand_max".to_string(), vec![self.max.to_string()]),
            ("valtype".to_string(), vec![self.value_type.to_string()]),
        ]
    }

    fn start(&mut self, tid: Tid) -> Result<(), AutopinError> {
        self.tasks.insert(tid);
        Ok(())
    }

    fn value(&mut self, tid: Tid) -> Result<f64, AutopinError> {
        if !self.tasks.contains(&tid) {
            return Ok(0.0);
        }
        Ok(self.rng.gen_range(self.min..self.max))
    }

    fn stop(&mut self, tid: Tid) -> Result<f64, AutopinError> {
        let value = self.value(tid)?;
        self.tasks.remove(&tid);
        Ok(value)
    }

    fn clear(&mut self, tid: Tid) {
        self.tasks.remove(&tid);
    }

    fn monitored_tasks(&self) -> Vec<Tid> {
        self.tasks.iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(yaml: &str) -> Result<RandomMonitor, AutopinError> {
        let mut monitor = RandomMonitor::with_rng("noise", StdRng::seed_from_u64(7));
        monitor.configure(&ConfigView::from_yaml_str(yaml).unwrap())?;
        Ok(monitor)
    }

    #[test]
    fn test_values_stay_in_range() {
        let mut monitor = monitor("noise.rand_min: 10\nnoise.rand_max: 20\n").unwrap();
        monitor.start(1).unwrap();
        for _ in 0..100 {
            let value = monitor.value(1).unwrap();
            assert!((10.0..20.0).contains(&value), "{value} out of range");
        }
        assert_eq!(monitor.value(2).unwrap(), 0.0);
    }

    #[test]
    fn test_rejects_empty_range() {
        assert!(monitor("noise.rand_min: 3\nnoise.rand_max: 3\n").is_err());
        assert!(monitor("noise.rand_max: -1\n").is_err());
    }

    #[test]
    fn test_stop_forgets_task() {
        let mut monitor = monitor("").unwrap();
        monitor.start(4).unwrap();
        assert!(monitor.stop(4).unwrap() < 1.0);
        assert!(monitor.monitored_tasks().is_empty());
    }
}
