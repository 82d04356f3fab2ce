//! Window state persistence across restarts.
//!
//! Aggregation state is purely in-memory; a process restart would otherwise
//! drop every partially-filled bucket. Implementations of
//! [`WindowStatePersistence`] give the registry a place to save window
//! snapshots during shutdown and re-adopt them on the next start. The store
//! only re-adopts snapshots whose geometry matches the current configuration,
//! so changing granularity or cardinality simply abandons the old state.

use serde::{Deserialize, Serialize};

use crate::data_model::{LabelSet, MetricKind};
use weir_error::GenericError;

/// Persisted accumulator contents for a single bucket.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccumulatorSnapshot {
    /// Counter state.
    Count(i64),

    /// Gauge state.
    Gauge {
        /// Folded gauge value.
        value: f64,

        /// Whether the bucket ever saw an update.
        touched: bool,
    },

    /// Raw samples for histograms and summaries.
    Observations(Vec<f64>),
}

/// Persisted state of one window.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct WindowSnapshot {
    /// Labels identifying the window's series.
    pub labels: LabelSet,

    /// Epoch milliseconds of the span's lower edge.
    pub start_ms: i64,

    /// One accumulator per bucket, oldest first.
    pub buckets: Vec<AccumulatorSnapshot>,
}

/// Persisted state of every window of one metric.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct MetricState {
    /// Metric name the state belongs to.
    pub metric: String,

    /// Declared kind at the time of the snapshot.
    pub kind: MetricKind,

    /// Granularity the snapshot was taken under, in seconds.
    pub granularity_secs: i64,

    /// Cardinality the snapshot was taken under.
    pub cardinality: usize,

    /// Synchronization instant at the time of the snapshot, epoch
    /// milliseconds.
    pub clock_ms: i64,

    /// All live windows of the metric.
    pub windows: Vec<WindowSnapshot>,
}

/// Storage backend for window snapshots.
pub trait WindowStatePersistence: Send + Sync {
    /// Stores `state`, replacing any previous state for the same metric.
    fn save_window_state(&self, state: &MetricState) -> Result<(), GenericError>;

    /// Loads the previously stored state for `metric`, if any.
    fn load_window_state(&self, metric: &str) -> Result<Option<MetricState>, GenericError>;
}
