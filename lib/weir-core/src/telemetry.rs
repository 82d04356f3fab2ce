//! Pipeline self-observation.
//!
//! The pipeline reports on itself through the same sink that carries
//! aggregated series, so one scrape endpoint exposes both. Stage timings are
//! opt-in; when disabled no clocks are read on the hot path.

use std::sync::Arc;
use std::time::Instant;

use crate::data_model::MetricKind;
use crate::sink::{MetricSink, NoopSink, SinkError, SinkMetricSpec, SinkValue};

const MESSAGES_PROCESSED: &str = "weir_messages_processed_total";
const EVENTS_EXTRACTED: &str = "weir_events_extracted_total";
const UPDATES_DISCARDED: &str = "weir_updates_discarded_total";
const NAMESPACES: &str = "weir_namespaces";
const CLASSIFY_SECONDS: &str = "weir_classify_seconds";
const UPDATE_SECONDS: &str = "weir_update_seconds";
const PROCESS_SECONDS: &str = "weir_process_seconds";

struct Inner {
    sink: Arc<dyn MetricSink>,
    stage_timing: bool,
}

/// Handle for recording pipeline telemetry.
///
/// Cheap to clone; workers and the acknowledger each hold one.
#[derive(Clone)]
pub struct PipelineTelemetry {
    inner: Arc<Inner>,
}

impl PipelineTelemetry {
    /// Registers the pipeline's own metrics with `sink` and returns the
    /// recording handle.
    pub fn register(sink: Arc<dyn MetricSink>, stage_timing: bool) -> Result<Self, SinkError> {
        sink.register(counter(MESSAGES_PROCESSED, "Messages consumed and acknowledged.", &[]))?;
        sink.register(counter(
            EVENTS_EXTRACTED,
            "Events extracted by classification, per namespace.",
            &["namespace"],
        ))?;
        sink.register(counter(
            UPDATES_DISCARDED,
            "Updates rejected for falling outside the window span, per namespace.",
            &["namespace"],
        ))?;
        sink.register(SinkMetricSpec {
            name: NAMESPACES.to_string(),
            help: "Number of namespaces loaded from the catalog.".to_string(),
            kind: MetricKind::Gauge,
            label_names: Vec::new(),
            buckets: None,
        })?;
        for (name, help) in [
            (CLASSIFY_SECONDS, "Time spent classifying one message."),
            (UPDATE_SECONDS, "Time spent applying one message's updates."),
            (PROCESS_SECONDS, "Time spent processing one message end to end."),
        ] {
            sink.register(SinkMetricSpec {
                name: name.to_string(),
                help: help.to_string(),
                kind: MetricKind::Summary,
                label_names: Vec::new(),
                buckets: None,
            })?;
        }

        Ok(Self {
            inner: Arc::new(Inner { sink, stage_timing }),
        })
    }

    /// A handle that records nothing. Used in tests.
    pub fn noop() -> Self {
        Self {
            inner: Arc::new(Inner {
                sink: Arc::new(NoopSink),
                stage_timing: false,
            }),
        }
    }

    /// Records one fully processed (consumed and acknowledged) message.
    pub fn mark_processed(&self) {
        self.inner
            .sink
            .update(MESSAGES_PROCESSED, MetricKind::Counter, &[], SinkValue::Add(1.0));
    }

    /// Records `count` events extracted for `namespace`.
    pub fn mark_extracted(&self, namespace: &str, count: usize) {
        if count == 0 {
            return;
        }
        self.inner.sink.update(
            EVENTS_EXTRACTED,
            MetricKind::Counter,
            &[namespace],
            SinkValue::Add(count as f64),
        );
    }

    /// Records one discarded update for `namespace`.
    pub fn mark_discarded(&self, namespace: &str) {
        self.inner.sink.update(
            UPDATES_DISCARDED,
            MetricKind::Counter,
            &[namespace],
            SinkValue::Add(1.0),
        );
    }

    /// Publishes the number of loaded namespaces. Called once at startup.
    pub fn set_namespace_count(&self, count: usize) {
        self.inner
            .sink
            .update(NAMESPACES, MetricKind::Gauge, &[], SinkValue::Add(count as f64));
    }

    /// Starts a stage timer, or returns `None` when stage timing is
    /// disabled.
    pub fn stage_timer(&self) -> Option<Instant> {
        self.inner.stage_timing.then(Instant::now)
    }

    /// Records the classification stage duration.
    pub fn observe_classify(&self, started: Option<Instant>) {
        self.observe(CLASSIFY_SECONDS, started);
    }

    /// Records the window update stage duration.
    pub fn observe_update(&self, started: Option<Instant>) {
        self.observe(UPDATE_SECONDS, started);
    }

    /// Records the end-to-end processing duration.
    pub fn observe_process(&self, started: Option<Instant>) {
        self.observe(PROCESS_SECONDS, started);
    }

    fn observe(&self, name: &'static str, started: Option<Instant>) {
        if let Some(started) = started {
            self.inner.sink.update(
                name,
                MetricKind::Summary,
                &[],
                SinkValue::Observe(vec![started.elapsed().as_secs_f64()]),
            );
        }
    }
}

fn counter(name: &str, help: &str, label_names: &[&str]) -> SinkMetricSpec {
    SinkMetricSpec {
        name: name.to_string(),
        help: help.to_string(),
        kind: MetricKind::Counter,
        label_names: label_names.iter().map(|n| n.to_string()).collect(),
        buckets: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingSink;

    #[test]
    fn registers_all_pipeline_metrics() {
        let sink = Arc::new(RecordingSink::default());
        let _telemetry = PipelineTelemetry::register(Arc::clone(&sink) as Arc<dyn MetricSink>, false)
            .unwrap();

        let names = sink.registered_names();
        for name in [
            MESSAGES_PROCESSED,
            EVENTS_EXTRACTED,
            UPDATES_DISCARDED,
            NAMESPACES,
            CLASSIFY_SECONDS,
            UPDATE_SECONDS,
            PROCESS_SECONDS,
        ] {
            assert!(names.iter().any(|n| n == name), "missing {}", name);
        }
    }

    #[test]
    fn counters_flow_to_the_sink() {
        let sink = Arc::new(RecordingSink::default());
        let telemetry =
            PipelineTelemetry::register(Arc::clone(&sink) as Arc<dyn MetricSink>, false).unwrap();

        telemetry.mark_processed();
        telemetry.mark_extracted("orders", 3);
        telemetry.mark_extracted("orders", 0);
        telemetry.mark_discarded("orders");

        assert_eq!(sink.added(MESSAGES_PROCESSED), vec![1.0]);
        assert_eq!(sink.added(EVENTS_EXTRACTED), vec![3.0]);
        assert_eq!(sink.added(UPDATES_DISCARDED), vec![1.0]);
    }

    #[test]
    fn stage_timers_are_disabled_unless_requested() {
        let sink = Arc::new(RecordingSink::default());
        let off =
            PipelineTelemetry::register(Arc::clone(&sink) as Arc<dyn MetricSink>, false).unwrap();
        assert!(off.stage_timer().is_none());
        off.observe_classify(off.stage_timer());
        assert!(sink.observed(CLASSIFY_SECONDS).is_empty());

        let sink = Arc::new(RecordingSink::default());
        let on =
            PipelineTelemetry::register(Arc::clone(&sink) as Arc<dyn MetricSink>, true).unwrap();
        let started = on.stage_timer();
        assert!(started.is_some());
        on.observe_classify(started);
        assert_eq!(sink.observed(CLASSIFY_SECONDS).len(), 1);
    }
}
