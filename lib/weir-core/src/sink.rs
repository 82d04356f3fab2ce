//! Metric sink abstraction.

use snafu::Snafu;

use crate::data_model::MetricKind;

/// Errors that can occur when registering metrics with a sink.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum SinkError {
    /// A metric with the same name but a different shape was already
    /// registered.
    #[snafu(display("metric '{}' already registered with a different shape", name))]
    Conflict {
        /// Name of the conflicting metric.
        name: String,
    },

    /// The registration itself was malformed.
    #[snafu(display("invalid registration for metric '{}': {}", name, reason))]
    InvalidRegistration {
        /// Name of the rejected metric.
        name: String,

        /// Why the registration was rejected.
        reason: String,
    },
}

/// A metric registration, as handed to a sink.
#[derive(Clone, Debug)]
pub struct SinkMetricSpec {
    /// Metric name, unique per sink.
    pub name: String,

    /// Help text for the exposition format.
    pub help: String,

    /// Aggregation kind.
    pub kind: MetricKind,

    /// Label names every series of this metric carries, in order.
    pub label_names: Vec<String>,

    /// Upper bounds for histogram buckets.
    pub buckets: Option<Vec<f64>>,
}

/// A flushed value to apply to a sink series.
#[derive(Clone, Debug, PartialEq)]
pub enum SinkValue {
    /// Add to the series value. Used for counters and gauges.
    Add(f64),

    /// Replay each sample into the series distribution. Used for histograms
    /// and summaries.
    Observe(Vec<f64>),
}

/// Destination for aggregated metric values.
///
/// Registration happens once at startup, before the pipeline starts feeding
/// updates; `update` is called from the ticker with flushed buckets and must
/// tolerate concurrent callers.
pub trait MetricSink: Send + Sync {
    /// Registers a metric so its series can be updated later.
    fn register(&self, spec: SinkMetricSpec) -> Result<(), SinkError>;

    /// Applies a flushed value to the series of `name` identified by
    /// `label_values`.
    ///
    /// Updates for unregistered metrics or with mis-shaped labels are logged
    /// and dropped; export must never stall the aggregation path.
    fn update(&self, name: &str, kind: MetricKind, label_values: &[&str], value: SinkValue);
}

/// A sink that drops everything.
///
/// Used in tests and as the wiring default before a real exporter is
/// attached.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopSink;

impl MetricSink for NoopSink {
    fn register(&self, _spec: SinkMetricSpec) -> Result<(), SinkError> {
        Ok(())
    }

    fn update(&self, _name: &str, _kind: MetricKind, _label_values: &[&str], _value: SinkValue) {}
}
