//! Message classification.
//!
//! Classification is a two-stage walk: a single group program maps the raw
//! message to the list of group names it is relevant to, and every namespace
//! program under a matched group then extracts concrete events. All
//! data-plane faults degrade to "fewer events", logged at debug; only
//! compilation problems at build time are fatal.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, warn};

use crate::catalog::Catalog;
use crate::collections::FastHashMap;
use crate::data_model::{Event, MetricKind, MetricValue};
use weir_error::{ErrorContext as _, GenericError};
use weir_expr::{CompiledProgram, Engine, EvalError, Functions};

/// The host functions classification programs are compiled against.
///
/// `event(namespace; time; metrics)` packages an extraction result and
/// `skip(reason)` declares the input not relevant to the calling program.
pub fn classification_functions() -> Functions {
    Functions::default()
        .with_function("event", 3, |_, args| {
            Ok(serde_json::json!({
                "namespace": args[0],
                "time": args[1],
                "metrics": args[2],
            }))
        })
        .with_function("skip", 1, |_, args| {
            let reason = match args[0].as_str() {
                Some(reason) => reason.to_string(),
                None => args[0].to_string(),
            };
            Err(EvalError::skip(reason))
        })
}

struct LeafNode {
    namespace: String,
    program: Box<dyn CompiledProgram>,
}

struct GroupNode {
    leaves: Vec<LeafNode>,
}

/// The compiled classification tree.
pub struct FilterRoot {
    catalog: Arc<Catalog>,
    group_program: Box<dyn CompiledProgram>,
    groups: FastHashMap<String, GroupNode>,
}

impl FilterRoot {
    /// Compiles the group program and every namespace program in the
    /// catalog.
    ///
    /// Any compilation failure is fatal: a program that cannot compile would
    /// otherwise silently drop traffic for its whole namespace.
    pub fn build(
        catalog: Arc<Catalog>,
        engine: &dyn Engine,
        group_source: &str,
    ) -> Result<Self, GenericError> {
        let group_program = engine
            .compile(group_source)
            .error_context("Failed to compile the group program.")?;

        let sources = catalog.read_filter_sources()?;
        let mut groups: FastHashMap<String, GroupNode> = FastHashMap::default();
        for namespace in catalog.namespaces() {
            let source = sources
                .get(&namespace.name)
                .ok_or_else(|| weir_error::generic_error!(
                    "missing filter source for namespace '{}'",
                    namespace.name
                ))?;
            let program = engine.compile(source).with_error_context(|| {
                format!(
                    "Failed to compile the filter program for namespace '{}'.",
                    namespace.name
                )
            })?;

            groups
                .entry(namespace.group.clone())
                .or_insert_with(|| GroupNode { leaves: Vec::new() })
                .leaves
                .push(LeafNode {
                    namespace: namespace.name.clone(),
                    program,
                });
        }

        Ok(Self {
            catalog,
            group_program,
            groups,
        })
    }

    /// Number of distinct groups in the tree.
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Classifies one decoded message, producing every event its matched
    /// namespace programs extract.
    ///
    /// An empty result is the common case and not an error: most messages are
    /// relevant to no group at all.
    pub fn classify(&self, payload: &Value) -> Vec<Event> {
        let group_names = match self.group_program.run(payload) {
            Ok(Some(Value::Array(names))) => names,
            Ok(Some(_)) => {
                debug!("Group program produced a non-list value.");
                return Vec::new();
            }
            Ok(None) => return Vec::new(),
            Err(err) if err.is_skip() => {
                debug!(%err, "Group program skipped message.");
                return Vec::new();
            }
            Err(err) => {
                debug!(%err, "Group program failed.");
                return Vec::new();
            }
        };

        let mut events = Vec::new();
        for name in &group_names {
            let Some(name) = name.as_str() else {
                debug!("Group program produced a non-string group name.");
                continue;
            };
            let Some(group) = self.groups.get(name) else {
                warn!(group = name, "Message matched a group with no namespaces.");
                continue;
            };

            for leaf in &group.leaves {
                match leaf.program.run(payload) {
                    Ok(Some(value)) => self.collect_events(name, leaf, value, &mut events),
                    Ok(None) => {}
                    Err(err) if err.is_skip() => {
                        debug!(namespace = %leaf.namespace, %err, "Message not relevant.");
                    }
                    Err(err) => {
                        debug!(namespace = %leaf.namespace, %err, "Filter program failed.");
                    }
                }
            }
        }

        events
    }

    fn collect_events(&self, group: &str, leaf: &LeafNode, value: Value, out: &mut Vec<Event>) {
        let Value::Object(map) = value else {
            debug!(namespace = %leaf.namespace, "Filter program produced a non-map value.");
            return;
        };

        let Some(namespace_name) = map.get("namespace").and_then(Value::as_str) else {
            debug!(namespace = %leaf.namespace, "Event is missing its namespace.");
            return;
        };
        if namespace_name != leaf.namespace {
            debug!(
                namespace = %leaf.namespace,
                reported = namespace_name,
                "Event reported a foreign namespace."
            );
            return;
        }
        let Some(namespace) = self.catalog.get(namespace_name) else {
            warn!(namespace = namespace_name, "Event reported an unknown namespace.");
            return;
        };

        let time = match map.get("time").and_then(Value::as_str) {
            Some(raw) => match DateTime::parse_from_rfc3339(raw) {
                Ok(t) => t.with_timezone(&Utc),
                Err(err) => {
                    debug!(namespace = %leaf.namespace, %err, "Event carries an unparseable time.");
                    return;
                }
            },
            None => {
                debug!(namespace = %leaf.namespace, "Event is missing its time.");
                return;
            }
        };

        let Some(metrics) = map.get("metrics").and_then(Value::as_object) else {
            debug!(namespace = %leaf.namespace, "Event is missing its metric map.");
            return;
        };

        for (metric_name, raw) in metrics {
            let Some(spec) = namespace.metrics.get(metric_name) else {
                warn!(
                    namespace = %leaf.namespace,
                    metric = %metric_name,
                    "Event carries a metric the namespace does not declare."
                );
                continue;
            };

            let Some(value) = coerce_value(spec.kind, raw) else {
                debug!(
                    namespace = %leaf.namespace,
                    metric = %metric_name,
                    kind = %spec.kind,
                    "Event value does not fit the metric kind."
                );
                continue;
            };

            out.push(Event {
                group: group.to_string(),
                namespace: namespace.name.clone(),
                metric: metric_name.clone(),
                time,
                value,
            });
        }
    }
}

fn coerce_value(kind: MetricKind, raw: &Value) -> Option<MetricValue> {
    match kind {
        MetricKind::Counter => integral(raw).map(MetricValue::IntDelta),
        MetricKind::Gauge => raw.as_f64().map(MetricValue::FloatValue),
        MetricKind::Histogram | MetricKind::Summary => raw.as_f64().map(MetricValue::Observation),
    }
}

fn integral(raw: &Value) -> Option<i64> {
    if let Some(n) = raw.as_i64() {
        return Some(n);
    }
    raw.as_f64()
        .filter(|f| f.fract() == 0.0 && *f >= i64::MIN as f64 && *f <= i64::MAX as f64)
        .map(|f| f as i64)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use weir_expr::Interpreter;

    const GROUPS: &str = r#"
        (if .dmn == "payments" then ["payments"] else [] end)
        + (if .dmn == "infra" then ["infra"] else [] end)
    "#;

    const ORDERS_FILTER: &str = r#"
        if has("cnt") then
            event("orders"; .ts; { requests_total: .cnt })
        else
            skip("no count present")
        end
    "#;

    fn write_catalog(dir: &std::path::Path) {
        std::fs::write(
            dir.join("orders.yaml"),
            "namespace: orders\ngroup: payments\nservice: checkout\nfilter: orders.flt\nmetrics:\n  requests_total:\n    type: counter\n  latency_seconds:\n    type: summary\n",
        )
        .unwrap();
        std::fs::write(dir.join("orders.flt"), ORDERS_FILTER).unwrap();
    }

    fn build_root(dir: &std::path::Path) -> FilterRoot {
        let catalog = Arc::new(Catalog::load_dir(dir).unwrap());
        let engine = Interpreter::new(classification_functions());
        FilterRoot::build(catalog, &engine, GROUPS).unwrap()
    }

    #[test]
    fn matched_messages_produce_typed_events() {
        let dir = tempfile::tempdir().unwrap();
        write_catalog(dir.path());
        let root = build_root(dir.path());

        let events = root.classify(&json!({
            "dmn": "payments",
            "ts": "2024-05-01T12:00:00Z",
            "cnt": 3,
        }));

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].group, "payments");
        assert_eq!(events[0].namespace, "orders");
        assert_eq!(events[0].metric, "requests_total");
        assert_eq!(events[0].value, MetricValue::IntDelta(3));
        assert_eq!(events[0].time.to_rfc3339(), "2024-05-01T12:00:00+00:00");
    }

    #[test]
    fn unmatched_messages_produce_no_events() {
        let dir = tempfile::tempdir().unwrap();
        write_catalog(dir.path());
        let root = build_root(dir.path());

        let events = root.classify(&json!({ "dmn": "logistics", "cnt": 3 }));
        assert!(events.is_empty());
    }

    #[test]
    fn skip_sentinel_is_quietly_dropped() {
        let dir = tempfile::tempdir().unwrap();
        write_catalog(dir.path());
        let root = build_root(dir.path());

        let events = root.classify(&json!({ "dmn": "payments", "ts": "2024-05-01T12:00:00Z" }));
        assert!(events.is_empty());
    }

    #[test]
    fn undeclared_metrics_are_dropped_but_others_kept() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("orders.yaml"),
            "namespace: orders\ngroup: payments\nservice: checkout\nfilter: orders.flt\nmetrics:\n  requests_total:\n    type: counter\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("orders.flt"),
            r#"event("orders"; .ts; { requests_total: 1, bogus_total: 2 })"#,
        )
        .unwrap();
        let root = build_root(dir.path());

        let events = root.classify(&json!({ "dmn": "payments", "ts": "2024-05-01T12:00:00Z" }));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].metric, "requests_total");
    }

    #[test]
    fn mismatched_value_shapes_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        write_catalog(dir.path());
        let root = build_root(dir.path());

        // A fractional count cannot feed a counter.
        let events = root.classify(&json!({
            "dmn": "payments",
            "ts": "2024-05-01T12:00:00Z",
            "cnt": 2.5,
        }));
        assert!(events.is_empty());
    }

    #[test]
    fn unparseable_times_drop_the_event() {
        let dir = tempfile::tempdir().unwrap();
        write_catalog(dir.path());
        let root = build_root(dir.path());

        let events = root.classify(&json!({
            "dmn": "payments",
            "ts": "yesterday",
            "cnt": 1,
        }));
        assert!(events.is_empty());
    }

    #[test]
    fn foreign_namespace_reports_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("orders.yaml"),
            "namespace: orders\ngroup: payments\nservice: checkout\nfilter: orders.flt\nmetrics:\n  requests_total:\n    type: counter\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("orders.flt"),
            r#"event("refunds"; .ts; { requests_total: 1 })"#,
        )
        .unwrap();
        let root = build_root(dir.path());

        let events = root.classify(&json!({ "dmn": "payments", "ts": "2024-05-01T12:00:00Z" }));
        assert!(events.is_empty());
    }

    #[test]
    fn one_message_can_fan_out_to_many_groups() {
        let dir = tempfile::tempdir().unwrap();
        write_catalog(dir.path());
        std::fs::write(
            dir.path().join("nodes.yaml"),
            "namespace: nodes\ngroup: infra\nservice: fleet\nfilter: nodes.flt\nmetrics:\n  node_heartbeats_total:\n    type: counter\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("nodes.flt"),
            r#"event("nodes"; .ts; { node_heartbeats_total: 1 })"#,
        )
        .unwrap();

        let catalog = Arc::new(Catalog::load_dir(dir.path()).unwrap());
        let engine = Interpreter::new(classification_functions());
        let both_groups = r#"["payments"] + ["infra"]"#;
        let root = FilterRoot::build(catalog, &engine, both_groups).unwrap();

        let events = root.classify(&json!({
            "ts": "2024-05-01T12:00:00Z",
            "cnt": 2,
        }));
        let mut namespaces: Vec<_> = events.iter().map(|e| e.namespace.as_str()).collect();
        namespaces.sort_unstable();
        assert_eq!(namespaces, vec!["nodes", "orders"]);
    }

    #[test]
    fn compile_failures_are_fatal_at_build_time() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("orders.yaml"),
            "namespace: orders\ngroup: payments\nservice: checkout\nfilter: orders.flt\nmetrics:\n  requests_total:\n    type: counter\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("orders.flt"), "if .x then").unwrap();

        let catalog = Arc::new(Catalog::load_dir(dir.path()).unwrap());
        let engine = Interpreter::new(classification_functions());
        assert!(FilterRoot::build(catalog, &engine, GROUPS).is_err());
    }
}
