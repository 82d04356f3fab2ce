//! Typed pipeline and aggregation configuration.

use chrono::TimeDelta;
use serde::Deserialize;
use tracing::warn;

use crate::data_model::GaugePolicy;
use weir_error::{generic_error, GenericError};

const fn default_granularity_secs() -> u64 {
    30
}

const fn default_cardinality() -> usize {
    10
}

const fn default_worker_count() -> usize {
    6
}

const fn default_queue_capacity() -> usize {
    2000
}

/// Window geometry and value-folding configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct AggregationConfiguration {
    /// Width of a single bucket, in seconds.
    #[serde(default = "default_granularity_secs")]
    granularity_secs: u64,

    /// Number of buckets per window.
    #[serde(default = "default_cardinality")]
    cardinality: usize,

    /// How many buckets sit at or ahead of the synchronization instant.
    ///
    /// Defaults to `cardinality`, which makes windows accept only events at
    /// or after the clock. Lower values shift coverage into the past to
    /// tolerate late arrivals.
    #[serde(default)]
    window_shift: Option<usize>,

    /// Number of consecutive empty ticks after which a window is dropped.
    /// Zero disables idle reaping.
    #[serde(default)]
    window_idle_ticks: u64,

    /// How gauge updates within one bucket are folded.
    #[serde(default)]
    gauge_policy: GaugePolicy,
}

impl Default for AggregationConfiguration {
    fn default() -> Self {
        Self {
            granularity_secs: default_granularity_secs(),
            cardinality: default_cardinality(),
            window_shift: None,
            window_idle_ticks: 0,
            gauge_policy: GaugePolicy::default(),
        }
    }
}

impl AggregationConfiguration {
    /// Validates the configuration and resolves it into concrete settings.
    pub fn resolve(&self) -> Result<AggregationSettings, GenericError> {
        if self.granularity_secs == 0 {
            return Err(generic_error!("granularity_secs must be at least 1"));
        }
        if self.cardinality == 0 {
            return Err(generic_error!("cardinality must be at least 1"));
        }

        let shift = self.window_shift.unwrap_or(self.cardinality);
        if shift == 0 || shift > self.cardinality {
            return Err(generic_error!(
                "window_shift must be between 1 and cardinality ({}), got {}",
                self.cardinality,
                shift
            ));
        }

        if self.window_idle_ticks > 0 && self.window_idle_ticks < self.cardinality as u64 {
            warn!(
                window_idle_ticks = self.window_idle_ticks,
                cardinality = self.cardinality,
                "Idle reaping below cardinality only drops windows once fully drained."
            );
        }

        let granularity_secs = i64::try_from(self.granularity_secs)
            .map_err(|_| generic_error!("granularity_secs is out of range"))?;

        Ok(AggregationSettings {
            granularity: TimeDelta::seconds(granularity_secs),
            cardinality: self.cardinality,
            shift,
            gauge_policy: self.gauge_policy,
            idle_limit: self.window_idle_ticks,
        })
    }
}

/// Resolved aggregation settings, shared by every metric manager.
#[derive(Clone, Copy, Debug)]
pub struct AggregationSettings {
    /// Width of a single bucket.
    pub granularity: TimeDelta,

    /// Number of buckets per window.
    pub cardinality: usize,

    /// Buckets at or ahead of the synchronization instant.
    pub shift: usize,

    /// Gauge folding behavior.
    pub gauge_policy: GaugePolicy,

    /// Idle reaping threshold in ticks, zero when disabled.
    pub idle_limit: u64,
}

/// Worker pool and queue configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct PipelineConfiguration {
    /// Number of concurrent ingestion workers.
    #[serde(default = "default_worker_count")]
    worker_count: usize,

    /// Capacity of the inbound and outbound queues.
    #[serde(default = "default_queue_capacity")]
    queue_capacity: usize,

    /// Whether per-stage timing telemetry is recorded.
    #[serde(default)]
    stage_timing: bool,
}

impl Default for PipelineConfiguration {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            queue_capacity: default_queue_capacity(),
            stage_timing: false,
        }
    }
}

impl PipelineConfiguration {
    /// Number of concurrent ingestion workers.
    pub fn worker_count(&self) -> Result<usize, GenericError> {
        if self.worker_count == 0 {
            return Err(generic_error!("worker_count must be at least 1"));
        }
        Ok(self.worker_count)
    }

    /// Capacity of the inbound and outbound queues.
    pub fn queue_capacity(&self) -> Result<usize, GenericError> {
        if self.queue_capacity == 0 {
            return Err(generic_error!("queue_capacity must be at least 1"));
        }
        Ok(self.queue_capacity)
    }

    /// Whether per-stage timing telemetry is recorded.
    pub fn stage_timing(&self) -> bool {
        self.stage_timing
    }
}
