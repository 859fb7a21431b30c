use super::{PerformanceMonitor, ValueType};
use crate::config::{ConfigOpts, ConfigView};
use crate::error::{AutopinError, MonitorOperation};
use autopin_shared::Tid;
use autopin_shared::perf_event::PerfEvent;
use std::collections::BTreeMap;
use std::io;

/// An open per-thread counter. Dropping it releases the underlying OS handle.
pub trait Counter {
    fn enable(&mut self) -> io::Result<()>;
    fn reset(&mut self) -> io::Result<()>;
    fn read(&mut self) -> io::Result<u64>;
}

/// Opens counters for a given event and thread.
pub trait CounterSource {
    type Counter: Counter;

    /// Implementation name as used in `<name>.type`.
    fn kind(&self) -> &'static str;

    fn open(&mut self, event: PerfEvent, tid: Tid) -> io::Result<Self::Counter>;
}

/// Monitor reading one hardware event per thread through a [`CounterSource`].
///
/// Options: `<name>.event_type` (exactly one event), `<name>.scale` (factor applied to raw
/// readings, 1.0 by default) and `<name>.valtype` (`max` by default).
pub struct CounterMonitor<S: CounterSource> {
    name: String,
    source: S,
    event: Option<PerfEvent>,
    scale: f64,
    value_type: ValueType,
    counters: BTreeMap<Tid, S::Counter>,
}

impl<S: CounterSource> CounterMonitor<S> {
    pub fn new(name: impl Into<String>, source: S) -> Self {
        Self {
            name: name.into(),
            source,
            event: None,
            scale: 1.0,
            value_type: ValueType::Max,
            counters: BTreeMap::new(),
        }
    }

    fn key(&self, option: &str) -> String {
        format!("{}.{option}", self.name)
    }

    fn scaled(&self, raw: u64) -> f64 {
        raw as f64 * self.scale
    }
}

fn failure(
    monitor: &str,
    tid: Tid,
    operation: MonitorOperation,
    source: io::Error,
) -> AutopinError {
    AutopinError::MonitorFailure {
        monitor: monitor.to_string(),
        tid,
        operation,
        source,
    }
}

impl<S: CounterSource> PerformanceMonitor for CounterMonitor<S> {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        self.source.kind()
    }

    fn value_type(&self) -> ValueType {
        self.value_type
    }

    fn configure(&mut self, config: &ConfigView) -> Result<(), AutopinError> {
        let event_key = self.key("event_type");
        let raw_event = config.required(&event_key)?;
        let event = PerfEvent::from_perf_string(raw_event).ok_or_else(|| {
            AutopinError::bad_config(&event_key, format!("unsupported event `{raw_event}`"))
        })?;

        let scale_key = self.key("scale");
        let scale = config.parse_single::<f64>(&scale_key)?.unwrap_or(1.0);
        if !scale.is_finite() {
            return Err(AutopinError::bad_config(scale_key, "scale must be finite"));
        }

        self.value_type = config
            .parse_single::<ValueType>(&self.key("valtype"))?
            .unwrap_or_default();
        self.event = Some(event);
        self.scale = scale;
        Ok(())
    }

    fn config_opts(&self) -> ConfigOpts {
        let event = self
            .event
            .map(|e| vec![e.to_perf_string().to_string()])
            .unwrap_or_default();
        vec![
            ("event_type".to_string(), event),
            ("scale".to_string(), vec![self.scale.to_string()]),
            ("valtype".to_string(), vec![self.value_type.to_string()]),
        ]
    }

    fn start(&mut self, tid: Tid) -> Result<(), AutopinError> {
        if let Some(counter) = self.counters.get_mut(&tid) {
            counter
                .reset()
                .map_err(|e| failure(&self.name, tid, MonitorOperation::Reset, e))?;
            return counter
                .enable()
                .map_err(|e| failure(&self.name, tid, MonitorOperation::Enable, e));
        }

        let event = self.event.ok_or_else(|| {
            AutopinError::bad_config(self.key("event_type"), "monitor is not configured")
        })?;
        let mut counter = self
            .source
            .open(event, tid)
            .map_err(|e| failure(&self.name, tid, MonitorOperation::Open, e))?;
        counter
            .enable()
            .map_err(|e| failure(&self.name, tid, MonitorOperation::Enable, e))?;
        self.counters.insert(tid, counter);
        Ok(())
    }

    fn value(&mut self, tid: Tid) -> Result<f64, AutopinError> {
        let Some(counter) = self.counters.get_mut(&tid) else {
            return Ok(0.0);
        };
        let raw = counter
            .read()
            .map_err(|e| failure(&self.name, tid, MonitorOperation::Read, e))?;
        Ok(self.scaled(raw))
    }

    fn stop(&mut self, tid: Tid) -> Result<f64, AutopinError> {
        let Some(mut counter) = self.counters.remove(&tid) else {
            return Ok(0.0);
        };
        let raw = counter.read();
        drop(counter);
        raw.map(|raw| self.scaled(raw))
            .map_err(|e| failure(&self.name, tid, MonitorOperation::Read, e))
    }

    fn clear(&mut self, tid: Tid) {
        self.counters.remove(&tid);
    }

    fn monitored_tasks(&self) -> Vec<Tid> {
        self.counters.keys().copied().collect()
    }
}
