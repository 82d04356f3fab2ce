//! The window ticker.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval_at, Instant};
use tracing::debug;

use crate::pipeline::shutdown::ComponentShutdownHandle;
use crate::registry::Registry;

/// Drives the shared clock, one granularity step per tick.
///
/// The first tick fires one full period after startup; firing at startup
/// would advance the clock past buckets that never had a chance to fill.
/// Missed ticks are made up in a burst so the clock stays aligned with wall
/// time even if a roll pass stalls.
pub(crate) struct Ticker {
    registry: Arc<Registry>,
    period: Duration,
}

impl Ticker {
    pub fn new(registry: Arc<Registry>, period: Duration) -> Self {
        Self { registry, period }
    }

    pub async fn run(self, mut shutdown: ComponentShutdownHandle) {
        debug!(period_secs = self.period.as_secs(), "Ticker started.");

        let mut ticks = interval_at(Instant::now() + self.period, self.period);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticks.tick() => self.registry.tick(),
            }
        }

        debug!("Ticker stopped.");
    }
}
