//! Prometheus exposition sink.
//!
//! Collects flushed values into per-series state and renders the Prometheus
//! text exposition format on demand. Rendering happens at scrape time, so
//! updates stay cheap and the payload always reflects the latest flushes.

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::RwLock;

use indexmap::IndexMap;
use tracing::{debug, warn};
use weir_core::data_model::MetricKind;
use weir_core::sink::{MetricSink, SinkError, SinkMetricSpec, SinkValue};

/// Quantiles rendered for summary metrics.
///
/// Hard-coded, but generally represents the quantiles people care about.
const SUMMARY_QUANTILES: &[f64] = &[0.1, 0.25, 0.5, 0.95, 0.99, 0.999];

/// Maximum number of recent observations retained per summary series for
/// quantile estimation. Sum and count keep counting past this limit.
const SUMMARY_RESERVOIR_LIMIT: usize = 4096;

enum SeriesState {
    Counter(f64),
    Gauge(f64),
    Histogram {
        bucket_counts: Vec<u64>,
        sum: f64,
        count: u64,
    },
    Summary {
        recent: VecDeque<f64>,
        sum: f64,
        count: u64,
    },
}

impl SeriesState {
    fn for_kind(kind: MetricKind, bucket_len: usize) -> Self {
        match kind {
            MetricKind::Counter => Self::Counter(0.0),
            MetricKind::Gauge => Self::Gauge(0.0),
            MetricKind::Histogram => Self::Histogram {
                bucket_counts: vec![0; bucket_len],
                sum: 0.0,
                count: 0,
            },
            MetricKind::Summary => Self::Summary {
                recent: VecDeque::new(),
                sum: 0.0,
                count: 0,
            },
        }
    }
}

struct Family {
    spec: SinkMetricSpec,
    series: IndexMap<Vec<String>, SeriesState>,
}

impl Family {
    fn same_shape(&self, other: &SinkMetricSpec) -> bool {
        self.spec.kind == other.kind
            && self.spec.label_names == other.label_names
            && self.spec.buckets == other.buckets
    }
}

/// A [`MetricSink`] that renders registered series as Prometheus exposition
/// text.
///
/// Families render in registration order, series within a family in first
/// update order.
#[derive(Default)]
pub struct PrometheusSink {
    families: RwLock<IndexMap<String, Family>>,
}

impl PrometheusSink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Renders the current state of every registered series as Prometheus
    /// text exposition format.
    pub fn render(&self) -> String {
        let families = self.families.read().unwrap();

        let mut payload = String::new();
        let mut families_written = 0;
        for family in families.values() {
            if family.series.is_empty() {
                continue;
            }

            if families_written > 0 {
                payload.push('\n');
            }
            write_family(&mut payload, family);
            families_written += 1;
        }

        payload
    }
}

impl MetricSink for PrometheusSink {
    fn register(&self, spec: SinkMetricSpec) -> Result<(), SinkError> {
        if spec.kind == MetricKind::Histogram && spec.buckets.is_none() {
            return Err(SinkError::InvalidRegistration {
                name: spec.name,
                reason: "histogram registration requires bucket bounds".to_string(),
            });
        }

        let mut families = self.families.write().unwrap();
        match families.get(&spec.name) {
            // Re-registering the same shape is a no-op.
            Some(existing) if existing.same_shape(&spec) => Ok(()),
            Some(_) => Err(SinkError::Conflict { name: spec.name }),
            None => {
                let name = spec.name.clone();
                families.insert(
                    name,
                    Family {
                        spec,
                        series: IndexMap::new(),
                    },
                );
                Ok(())
            }
        }
    }

    fn update(&self, name: &str, kind: MetricKind, label_values: &[&str], value: SinkValue) {
        let mut families = self.families.write().unwrap();
        let family = match families.get_mut(name) {
            Some(family) => family,
            None => {
                debug!(metric = name, "Update for unregistered metric. Dropping.");
                return;
            }
        };

        if family.spec.kind != kind {
            warn!(
                metric = name,
                expected = family.spec.kind.as_str(),
                got = kind.as_str(),
                "Update kind does not match registration. Dropping."
            );
            return;
        }

        if label_values.len() != family.spec.label_names.len() {
            warn!(
                metric = name,
                expected = family.spec.label_names.len(),
                got = label_values.len(),
                "Update label count does not match registration. Dropping."
            );
            return;
        }

        let bucket_len = family.spec.buckets.as_ref().map_or(0, Vec::len);
        let series = family
            .series
            .entry(label_values.iter().map(|value| value.to_string()).collect())
            .or_insert_with(|| SeriesState::for_kind(kind, bucket_len));

        match (series, value) {
            (SeriesState::Counter(total), SinkValue::Add(delta))
            | (SeriesState::Gauge(total), SinkValue::Add(delta)) => {
                *total += delta;
            }
            (
                SeriesState::Histogram {
                    bucket_counts,
                    sum,
                    count,
                },
                SinkValue::Observe(samples),
            ) => {
                let bounds = family
                    .spec
                    .buckets
                    .as_ref()
                    .expect("histogram registration always carries buckets");
                for sample in samples {
                    for (idx, bound) in bounds.iter().enumerate() {
                        if sample <= *bound {
                            bucket_counts[idx] += 1;
                            break;
                        }
                    }
                    *sum += sample;
                    *count += 1;
                }
            }
            (SeriesState::Summary { recent, sum, count }, SinkValue::Observe(samples)) => {
                for sample in samples {
                    if recent.len() == SUMMARY_RESERVOIR_LIMIT {
                        recent.pop_front();
                    }
                    recent.push_back(sample);
                    *sum += sample;
                    *count += 1;
                }
            }
            _ => {
                warn!(
                    metric = name,
                    "Update value does not match the registered kind. Dropping."
                );
            }
        }
    }
}

fn write_family(payload: &mut String, family: &Family) {
    let name = &family.spec.name;

    writeln!(payload, "# HELP {} {}", name, family.spec.help).unwrap();
    writeln!(payload, "# TYPE {} {}", name, family.spec.kind.as_str()).unwrap();

    let mut labels_buffer = String::new();
    for (label_values, state) in &family.series {
        labels_buffer.clear();
        format_labels(&mut labels_buffer, &family.spec.label_names, label_values);

        match state {
            SeriesState::Counter(value) | SeriesState::Gauge(value) => {
                payload.push_str(name);
                if !labels_buffer.is_empty() {
                    payload.push('{');
                    payload.push_str(&labels_buffer);
                    payload.push('}');
                }
                writeln!(payload, " {}", value).unwrap();
            }
            SeriesState::Histogram {
                bucket_counts,
                sum,
                count,
            } => {
                let bounds = family
                    .spec
                    .buckets
                    .as_ref()
                    .expect("histogram registration always carries buckets");

                // Bucket counts are stored per bound and rendered cumulative.
                let mut cumulative = 0;
                for (bound, bucket_count) in bounds.iter().zip(bucket_counts) {
                    cumulative += bucket_count;
                    write!(payload, "{}_bucket{{{}", name, labels_buffer).unwrap();
                    if !labels_buffer.is_empty() {
                        payload.push(',');
                    }
                    writeln!(payload, "le=\"{}\"}} {}", bound, cumulative).unwrap();
                }

                // The +Inf bucket is just the total count of the histogram.
                write!(payload, "{}_bucket{{{}", name, labels_buffer).unwrap();
                if !labels_buffer.is_empty() {
                    payload.push(',');
                }
                writeln!(payload, "le=\"+Inf\"}} {}", count).unwrap();

                write_sum_and_count(payload, name, &labels_buffer, *sum, *count);
            }
            SeriesState::Summary { recent, sum, count } => {
                let mut sorted = recent.iter().copied().collect::<Vec<_>>();
                sorted.sort_by(|a, b| a.total_cmp(b));

                for quantile in SUMMARY_QUANTILES {
                    let q_value = nearest_rank(&sorted, *quantile);

                    write!(payload, "{}{{{}", name, labels_buffer).unwrap();
                    if !labels_buffer.is_empty() {
                        payload.push(',');
                    }
                    writeln!(payload, "quantile=\"{}\"}} {}", quantile, q_value).unwrap();
                }

                write_sum_and_count(payload, name, &labels_buffer, *sum, *count);
            }
        }
    }
}

fn write_sum_and_count(payload: &mut String, name: &str, labels_buffer: &str, sum: f64, count: u64) {
    write!(payload, "{}_sum", name).unwrap();
    if !labels_buffer.is_empty() {
        payload.push('{');
        payload.push_str(labels_buffer);
        payload.push('}');
    }
    writeln!(payload, " {}", sum).unwrap();

    write!(payload, "{}_count", name).unwrap();
    if !labels_buffer.is_empty() {
        payload.push('{');
        payload.push_str(labels_buffer);
        payload.push('}');
    }
    writeln!(payload, " {}", count).unwrap();
}

fn format_labels(labels_buffer: &mut String, names: &[String], values: &[String]) {
    for (name, value) in names.iter().zip(values) {
        if !labels_buffer.is_empty() {
            labels_buffer.push(',');
        }
        write!(labels_buffer, "{}=\"{}\"", name, value).unwrap();
    }
}

fn nearest_rank(sorted: &[f64], quantile: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }

    let idx = ((sorted.len() - 1) as f64 * quantile).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}
