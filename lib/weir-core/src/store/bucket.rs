//! Fixed-interval accumulation buckets.

use chrono::{DateTime, TimeDelta, Utc};
use tracing::debug;

use crate::data_model::{GaugePolicy, MetricKind, MetricValue};
use crate::persist::AccumulatorSnapshot;
use crate::sink::SinkValue;

/// Kind-specific accumulation state.
///
/// The variant is chosen once when the bucket is built, from the metric's
/// declared kind. Updates then dispatch on a plain enum match instead of
/// consulting the catalog again.
enum Accumulator {
    Count(i64),
    Gauge {
        value: f64,
        policy: GaugePolicy,
        touched: bool,
    },
    Observations(Vec<f64>),
}

/// One granularity-sized interval of aggregation state.
///
/// A bucket covers the half-open interval `[start, end)`.
pub struct Bucket {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    acc: Accumulator,
}

impl Bucket {
    /// Creates an empty bucket for a metric of `kind` covering
    /// `[start, start + width)`.
    pub fn new(kind: MetricKind, policy: GaugePolicy, start: DateTime<Utc>, width: TimeDelta) -> Self {
        let acc = match kind {
            MetricKind::Counter => Accumulator::Count(0),
            MetricKind::Gauge => Accumulator::Gauge {
                value: 0.0,
                policy,
                touched: false,
            },
            MetricKind::Histogram | MetricKind::Summary => Accumulator::Observations(Vec::new()),
        };

        Self {
            start,
            end: start + width,
            acc,
        }
    }

    /// Inclusive lower edge of the bucket interval.
    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    /// Exclusive upper edge of the bucket interval.
    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    /// Whether `t` falls within `[start, end)`.
    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        t >= self.start && t < self.end
    }

    /// Whether the bucket has seen no updates since it was created.
    pub fn is_empty(&self) -> bool {
        match &self.acc {
            Accumulator::Count(n) => *n == 0,
            Accumulator::Gauge { touched, .. } => !touched,
            Accumulator::Observations(samples) => samples.is_empty(),
        }
    }

    /// Folds `value` into the bucket.
    ///
    /// Values are typed at classification time to match the metric kind, so a
    /// shape mismatch here means a defect upstream. Mismatched updates are
    /// dropped rather than corrupting the accumulator.
    pub fn update(&mut self, value: &MetricValue) {
        match (&mut self.acc, value) {
            (Accumulator::Count(n), MetricValue::IntDelta(delta)) => {
                *n = n.saturating_add(*delta);
            }
            (
                Accumulator::Gauge {
                    value: current,
                    policy,
                    touched,
                },
                MetricValue::FloatValue(v),
            ) => {
                match policy {
                    GaugePolicy::Sum => *current += v,
                    GaugePolicy::Last => *current = *v,
                }
                *touched = true;
            }
            (Accumulator::Observations(samples), MetricValue::Observation(v)) => {
                samples.push(*v);
            }
            _ => {
                debug!(?value, "Dropped update with mismatched value shape.");
            }
        }
    }

    /// Consumes the bucket, producing the value to apply to the sink.
    pub fn flush(self) -> SinkValue {
        match self.acc {
            Accumulator::Count(n) => SinkValue::Add(n as f64),
            Accumulator::Gauge { value, .. } => SinkValue::Add(value),
            Accumulator::Observations(samples) => SinkValue::Observe(samples),
        }
    }

    /// Captures the accumulator for persistence.
    pub fn snapshot(&self) -> AccumulatorSnapshot {
        match &self.acc {
            Accumulator::Count(n) => AccumulatorSnapshot::Count(*n),
            Accumulator::Gauge { value, touched, .. } => AccumulatorSnapshot::Gauge {
                value: *value,
                touched: *touched,
            },
            Accumulator::Observations(samples) => AccumulatorSnapshot::Observations(samples.clone()),
        }
    }

    /// Rebuilds a bucket from a persisted accumulator.
    ///
    /// Returns `None` when the snapshot shape does not match `kind`, which
    /// happens when a metric's declared kind changed across restarts.
    pub fn from_snapshot(
        kind: MetricKind,
        policy: GaugePolicy,
        start: DateTime<Utc>,
        width: TimeDelta,
        snapshot: AccumulatorSnapshot,
    ) -> Option<Self> {
        let acc = match (kind, snapshot) {
            (MetricKind::Counter, AccumulatorSnapshot::Count(n)) => Accumulator::Count(n),
            (MetricKind::Gauge, AccumulatorSnapshot::Gauge { value, touched }) => Accumulator::Gauge {
                value,
                policy,
                touched,
            },
            (
                MetricKind::Histogram | MetricKind::Summary,
                AccumulatorSnapshot::Observations(samples),
            ) => Accumulator::Observations(samples),
            _ => return None,
        };

        Some(Self {
            start,
            end: start + width,
            acc,
        })
    }
}
