use super::{PlacementPolicy, PolicyEvent, interval_opt, parse_interval, tick_interval};
use crate::config::{ConfigOpts, ConfigView};
use crate::error::AutopinError;
use crate::topology::NumaTopology;
use autopin_shared::pinning::Pinning;
use std::sync::Arc;
use std::time::Duration;

pub const NAME: &str = "noop";

/// Observes only: threads are monitored but never pinned.
#[derive(Debug)]
pub struct NoopPolicy {
    interval: Duration,
}

impl Default for NoopPolicy {
    fn default() -> Self {
        Self {
            interval: super::DEFAULT_INTERVAL,
        }
    }
}

impl PlacementPolicy for NoopPolicy {
    fn name(&self) -> &'static str {
        NAME
    }

    fn configure(
        &mut self,
        config: &ConfigView,
        _: &Arc<NumaTopology>,
    ) -> Result<(), AutopinError> {
        self.interval = parse_interval(config, NAME)?;
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
        _: &PolicyEvent,
        current: &Pinning,
    ) -> Result<Pinning, AutopinError> {
        Ok(current.clone())
    }
}
