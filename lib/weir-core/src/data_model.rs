//! Core data model shared between classification, aggregation, and export.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// The aggregation behavior of a metric.
///
/// The kind is declared once in the namespace catalog and fixed for the
/// lifetime of the process. Every window bucket for a metric carries the
/// accumulator matching its kind, so updates never have to re-inspect what
/// sort of metric they are feeding.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Monotonic count of occurrences, updated by integral deltas.
    Counter,

    /// Point-in-time value, folded according to [`GaugePolicy`].
    Gauge,

    /// Distribution of observed samples, exported with fixed buckets.
    Histogram,

    /// Distribution of observed samples, exported as quantiles.
    Summary,
}

impl MetricKind {
    /// Returns the lowercase name of the kind, as used in catalogs and in the
    /// exposition format.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
            Self::Histogram => "histogram",
            Self::Summary => "summary",
        }
    }
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How multiple gauge updates landing in the same bucket are folded.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GaugePolicy {
    /// Sum all updates observed during the bucket interval.
    #[default]
    Sum,

    /// Keep only the most recent update observed during the bucket interval.
    Last,
}

/// A single extracted measurement, typed at classification time.
///
/// Classification coerces the raw JSON number into the variant matching the
/// metric's declared kind, so the aggregation path downstream never deals
/// with untyped values.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum MetricValue {
    /// Increment for a counter.
    IntDelta(i64),

    /// Replacement or additive value for a gauge.
    FloatValue(f64),

    /// A single sample for a histogram or summary.
    Observation(f64),
}

impl MetricValue {
    /// Whether this value is the right shape to feed a metric of `kind`.
    pub fn matches_kind(&self, kind: MetricKind) -> bool {
        match (self, kind) {
            (Self::IntDelta(_), MetricKind::Counter) => true,
            (Self::FloatValue(_), MetricKind::Gauge) => true,
            (Self::Observation(_), MetricKind::Histogram | MetricKind::Summary) => true,
            _ => false,
        }
    }
}

/// The declared shape of a metric, as resolved from the namespace catalog.
#[derive(Clone, Debug, PartialEq)]
pub struct MetricSpec {
    /// Metric name, unique process-wide.
    pub name: String,

    /// Human-readable help text for the exposition format.
    pub help: String,

    /// Aggregation kind.
    pub kind: MetricKind,

    /// Upper bounds for histogram buckets. Only meaningful for
    /// [`MetricKind::Histogram`].
    pub buckets: Option<Vec<f64>>,
}

/// Label names attached to every aggregated series, in exposition order.
pub const LABEL_NAMES: [&str; 5] = ["delay", "service", "group", "namespace", "hostname"];

/// The full label set identifying one aggregation window.
///
/// The fingerprint of a label set keys the window map, so two events carrying
/// the same labels always land in the same window.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Deserialize, Serialize)]
pub struct LabelSet {
    /// Event staleness at update time, floored to whole granularity steps,
    /// rendered in seconds.
    pub delay: String,

    /// Service that produced the event.
    pub service: String,

    /// Classification group that matched the event.
    pub group: String,

    /// Namespace that extracted the event.
    pub namespace: String,

    /// Hostname carried by the source message.
    pub hostname: String,
}

impl LabelSet {
    /// Renders the canonical fingerprint for this label set.
    pub fn fingerprint(&self) -> String {
        format!(
            "delay={},service={},group={},namespace={},hostname={}",
            self.delay, self.service, self.group, self.namespace, self.hostname
        )
    }

    /// Label values in the same order as [`LABEL_NAMES`].
    pub fn values(&self) -> [&str; 5] {
        [
            &self.delay,
            &self.service,
            &self.group,
            &self.namespace,
            &self.hostname,
        ]
    }
}

/// Renders the `delay` label for an event observed at `now`.
///
/// Staleness is floored to whole granularity steps so that the label
/// cardinality stays bounded by the acceptance horizon rather than growing
/// with every distinct millisecond of lag. Events from the future clamp to
/// zero.
pub fn delay_label(now: DateTime<Utc>, event_time: DateTime<Utc>, granularity: TimeDelta) -> String {
    let step = granularity.num_seconds().max(1);
    let lag = (now - event_time).num_seconds().max(0);
    format!("{}", (lag / step) * step)
}

/// A single classified measurement, ready to be applied to a window.
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    /// Classification group whose programs produced the event.
    pub group: String,

    /// Namespace the classification program reported.
    pub namespace: String,

    /// Metric name within the namespace.
    pub metric: String,

    /// Occurrence time of the measurement.
    pub time: DateTime<Utc>,

    /// The typed value to apply.
    pub value: MetricValue,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_orders_labels_canonically() {
        let labels = LabelSet {
            delay: "30".to_string(),
            service: "checkout".to_string(),
            group: "payments".to_string(),
            namespace: "orders".to_string(),
            hostname: "node-1".to_string(),
        };
        assert_eq!(
            labels.fingerprint(),
            "delay=30,service=checkout,group=payments,namespace=orders,hostname=node-1"
        );
    }

    #[test]
    fn delay_label_floors_to_granularity_steps() {
        let granularity = TimeDelta::seconds(30);
        let now = Utc::now();

        let fresh = delay_label(now, now, granularity);
        assert_eq!(fresh, "0");

        let stale = delay_label(now, now - TimeDelta::seconds(75), granularity);
        assert_eq!(stale, "60");

        let future = delay_label(now, now + TimeDelta::seconds(10), granularity);
        assert_eq!(future, "0");
    }

    #[test]
    fn values_match_declared_kinds() {
        assert!(MetricValue::IntDelta(1).matches_kind(MetricKind::Counter));
        assert!(!MetricValue::IntDelta(1).matches_kind(MetricKind::Gauge));
        assert!(MetricValue::FloatValue(0.5).matches_kind(MetricKind::Gauge));
        assert!(MetricValue::Observation(0.5).matches_kind(MetricKind::Histogram));
        assert!(MetricValue::Observation(0.5).matches_kind(MetricKind::Summary));
        assert!(!MetricValue::Observation(0.5).matches_kind(MetricKind::Counter));
    }

    #[test]
    fn kinds_parse_from_catalog_names() {
        let kind: MetricKind = serde_yaml::from_str("histogram").unwrap();
        assert_eq!(kind, MetricKind::Histogram);
        assert_eq!(kind.to_string(), "histogram");
    }
}
