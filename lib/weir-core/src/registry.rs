//! Process-wide aggregation registry.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::debug;

use crate::catalog::Catalog;
use crate::collections::FastHashMap;
use crate::config::AggregationSettings;
use crate::data_model::{delay_label, Event, LabelSet, LABEL_NAMES};
use crate::persist::WindowStatePersistence;
use crate::router::FilterRoot;
use crate::sink::{MetricSink, SinkMetricSpec};
use crate::store::{MetricManager, SharedClock, UpdateOutcome};
use crate::telemetry::PipelineTelemetry;
use weir_error::{ErrorContext as _, GenericError};

/// Owns every aggregation object with process lifetime.
///
/// The registry is built once at startup and shared immutably afterwards;
/// all interior mutability lives inside the metric managers and the clock.
pub struct Registry {
    catalog: Arc<Catalog>,
    filter_root: FilterRoot,
    managers: FastHashMap<String, Arc<MetricManager>>,
    clock: Arc<SharedClock>,
    sink: Arc<dyn MetricSink>,
    telemetry: PipelineTelemetry,
    settings: AggregationSettings,
}

impl Registry {
    /// Builds the registry: resolves the metric table, registers every
    /// metric with the sink, and creates one manager per metric.
    pub fn build(
        catalog: Arc<Catalog>,
        filter_root: FilterRoot,
        sink: Arc<dyn MetricSink>,
        telemetry: PipelineTelemetry,
        settings: AggregationSettings,
        clock: Arc<SharedClock>,
    ) -> Result<Self, GenericError> {
        let metrics = catalog.unified_metrics()?;

        let mut managers = FastHashMap::default();
        for (name, spec) in metrics {
            sink.register(SinkMetricSpec {
                name: spec.name.clone(),
                help: spec.help.clone(),
                kind: spec.kind,
                label_names: LABEL_NAMES.iter().map(|n| n.to_string()).collect(),
                buckets: spec.buckets.clone(),
            })
            .with_error_context(|| format!("Failed to register metric '{}'.", name))?;

            managers.insert(
                name,
                Arc::new(MetricManager::new(spec, settings, Arc::clone(&clock))),
            );
        }

        telemetry.set_namespace_count(catalog.len());

        Ok(Self {
            catalog,
            filter_root,
            managers,
            clock,
            sink,
            telemetry,
            settings,
        })
    }

    /// The resolved aggregation settings.
    pub fn settings(&self) -> AggregationSettings {
        self.settings
    }

    /// The shared aggregation clock.
    pub fn clock(&self) -> &Arc<SharedClock> {
        &self.clock
    }

    /// The loaded namespace catalog.
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// The telemetry handle the registry records through.
    pub fn telemetry(&self) -> PipelineTelemetry {
        self.telemetry.clone()
    }

    /// Looks up the manager for a metric. Mostly useful in tests.
    pub fn manager(&self, metric: &str) -> Option<&Arc<MetricManager>> {
        self.managers.get(metric)
    }

    /// Classifies one decoded message.
    pub fn classify(&self, payload: &Value) -> Vec<Event> {
        self.filter_root.classify(payload)
    }

    /// Applies one classified event to its metric's windows.
    pub fn apply(&self, event: &Event, hostname: &str) {
        let Some(manager) = self.managers.get(&event.metric) else {
            // Classification validates metrics against the catalog, so this
            // only fires if the two ever disagree.
            debug!(metric = %event.metric, "Dropped event for unmanaged metric.");
            return;
        };

        let service = self
            .catalog
            .get(&event.namespace)
            .map(|ns| ns.service.clone())
            .unwrap_or_default();
        let labels = LabelSet {
            delay: delay_label(Utc::now(), event.time, self.settings.granularity),
            service,
            group: event.group.clone(),
            namespace: event.namespace.clone(),
            hostname: hostname.to_string(),
        };

        match manager.update_windows(event.time, labels, &event.value) {
            UpdateOutcome::Accepted => {}
            UpdateOutcome::OutOfHorizon => {
                self.telemetry.mark_discarded(&event.namespace);
                debug!(
                    metric = %event.metric,
                    t = %event.time,
                    "Discarded update outside the window span."
                );
            }
        }
    }

    /// Advances the shared clock one granularity step and rolls every
    /// window, flushing evicted buckets to the sink.
    pub fn tick(&self) {
        let sync = self.clock.advance(self.settings.granularity);
        let mut rolled = 0;
        for manager in self.managers.values() {
            rolled += manager.tick(self.sink.as_ref());
        }
        debug!(%sync, windows = rolled, "Rolled windows.");
    }

    /// Total number of live windows across all metrics.
    pub fn window_count(&self) -> usize {
        self.managers.values().map(|m| m.window_count()).sum()
    }

    /// Persists the window state of every metric. Returns the number of
    /// windows saved.
    pub fn save_state(&self, store: &dyn WindowStatePersistence) -> Result<usize, GenericError> {
        let mut saved = 0;
        for manager in self.managers.values() {
            let state = manager.snapshot_state();
            if state.windows.is_empty() {
                continue;
            }
            saved += state.windows.len();
            store.save_window_state(&state).with_error_context(|| {
                format!(
                    "Failed to persist window state for metric '{}'.",
                    manager.spec().name
                )
            })?;
        }
        Ok(saved)
    }

    /// Re-adopts persisted window state for every metric. Returns the number
    /// of windows restored.
    pub fn restore_state(&self, store: &dyn WindowStatePersistence) -> Result<usize, GenericError> {
        let mut restored = 0;
        for manager in self.managers.values() {
            let state = store.load_window_state(&manager.spec().name).with_error_context(|| {
                format!(
                    "Failed to load window state for metric '{}'.",
                    manager.spec().name
                )
            })?;
            if let Some(state) = state {
                restored += manager.restore_state(state, self.sink.as_ref());
            }
        }
        Ok(restored)
    }
}
