//! Shared helpers for unit tests.

use std::sync::Mutex;

use crate::data_model::{LabelSet, MetricKind};
use crate::sink::{MetricSink, SinkError, SinkMetricSpec, SinkValue};

/// One captured sink update.
#[derive(Clone, Debug)]
pub struct RecordedUpdate {
    pub name: String,
    #[allow(dead_code)]
    pub kind: MetricKind,
    pub label_values: Vec<String>,
    pub value: SinkValue,
}

/// A sink that records everything it is handed, in call order.
#[derive(Default)]
pub struct RecordingSink {
    registered: Mutex<Vec<SinkMetricSpec>>,
    updates: Mutex<Vec<RecordedUpdate>>,
}

impl RecordingSink {
    /// All updates captured so far.
    pub fn updates(&self) -> Vec<RecordedUpdate> {
        self.updates.lock().unwrap().clone()
    }

    /// Scalar additions captured for `name`, in call order.
    pub fn added(&self, name: &str) -> Vec<f64> {
        self.updates()
            .into_iter()
            .filter(|u| u.name == name)
            .filter_map(|u| match u.value {
                SinkValue::Add(v) => Some(v),
                SinkValue::Observe(_) => None,
            })
            .collect()
    }

    /// Samples captured for `name`, flattened in call order.
    pub fn observed(&self, name: &str) -> Vec<f64> {
        self.updates()
            .into_iter()
            .filter(|u| u.name == name)
            .flat_map(|u| match u.value {
                SinkValue::Observe(samples) => samples,
                SinkValue::Add(_) => Vec::new(),
            })
            .collect()
    }

    /// Names of all metrics registered so far.
    pub fn registered_names(&self) -> Vec<String> {
        self.registered.lock().unwrap().iter().map(|s| s.name.clone()).collect()
    }
}

impl MetricSink for RecordingSink {
    fn register(&self, spec: SinkMetricSpec) -> Result<(), SinkError> {
        self.registered.lock().unwrap().push(spec);
        Ok(())
    }

    fn update(&self, name: &str, kind: MetricKind, label_values: &[&str], value: SinkValue) {
        self.updates.lock().unwrap().push(RecordedUpdate {
            name: name.to_string(),
            kind,
            label_values: label_values.iter().map(|v| v.to_string()).collect(),
            value,
        });
    }
}

/// A label set with fixed classification labels and the given hostname.
pub fn labels_for_host(hostname: &str) -> LabelSet {
    LabelSet {
        delay: "0".to_string(),
        service: "svc".to_string(),
        group: "grp".to_string(),
        namespace: "ns".to_string(),
        hostname: hostname.to_string(),
    }
}
