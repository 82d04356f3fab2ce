//! Per-metric window management.

use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::collections::FastHashMap;
use crate::config::AggregationSettings;
use crate::data_model::{LabelSet, MetricSpec, MetricValue};
use crate::persist::MetricState;
use crate::sink::MetricSink;
use crate::store::clock::SharedClock;
use crate::store::window::{UpdateOutcome, Window};

/// Owns every window of a single metric.
///
/// Windows are keyed by label fingerprint and created on demand when the
/// first update for a label set arrives. Lookups take a read lock on the map
/// plus the window's own mutex; creation upgrades to a write lock and
/// re-checks the map so racing first updates converge on one window.
pub struct MetricManager {
    spec: MetricSpec,
    settings: AggregationSettings,
    clock: Arc<SharedClock>,
    windows: RwLock<FastHashMap<String, Mutex<Window>>>,
}

impl MetricManager {
    /// Creates a manager with no live windows.
    pub fn new(spec: MetricSpec, settings: AggregationSettings, clock: Arc<SharedClock>) -> Self {
        Self {
            spec,
            settings,
            clock,
            windows: RwLock::new(FastHashMap::default()),
        }
    }

    /// The metric this manager aggregates.
    pub fn spec(&self) -> &MetricSpec {
        &self.spec
    }

    /// Number of live windows.
    pub fn window_count(&self) -> usize {
        self.windows.read().unwrap().len()
    }

    /// Applies one update to the window identified by `labels`.
    pub fn update_windows(
        &self,
        t: DateTime<Utc>,
        labels: LabelSet,
        value: &MetricValue,
    ) -> UpdateOutcome {
        let fingerprint = labels.fingerprint();

        {
            let windows = self.windows.read().unwrap();
            if let Some(slot) = windows.get(&fingerprint) {
                return slot.lock().unwrap().update(t, value);
            }
        }

        let mut windows = self.windows.write().unwrap();
        let slot = windows.entry(fingerprint).or_insert_with(|| {
            Mutex::new(Window::new(
                self.spec.kind,
                self.settings.gauge_policy,
                self.settings.granularity,
                self.settings.cardinality,
                self.settings.shift,
                self.clock.now(),
                labels,
            ))
        });
        slot.get_mut().unwrap().update(t, value)
    }

    /// Rolls every window once, flushing the evicted buckets to `sink`.
    ///
    /// The shared clock must have been advanced before this is called, so
    /// that appended buckets line up with the new synchronization instant.
    /// Windows that have been idle past the configured threshold are dropped
    /// once fully drained. Returns the number of windows rolled.
    pub fn tick(&self, sink: &dyn MetricSink) -> usize {
        let mut windows = self.windows.write().unwrap();
        let mut rolled = 0;

        windows.retain(|_, slot| {
            let window = slot.get_mut().unwrap();
            let evicted = window.roll();
            sink.update(
                &self.spec.name,
                self.spec.kind,
                &window.labels().values(),
                evicted.flush(),
            );
            rolled += 1;

            self.settings.idle_limit == 0
                || window.idle_ticks() < self.settings.idle_limit
                || !window.is_empty()
        });

        rolled
    }

    /// Total updates discarded across all live windows.
    pub fn discarded(&self) -> u64 {
        let windows = self.windows.read().unwrap();
        windows.values().map(|slot| slot.lock().unwrap().discarded()).sum()
    }

    /// Captures the state of every live window.
    pub fn snapshot_state(&self) -> MetricState {
        let windows = self.windows.read().unwrap();
        MetricState {
            metric: self.spec.name.clone(),
            kind: self.spec.kind,
            granularity_secs: self.settings.granularity.num_seconds(),
            cardinality: self.settings.cardinality,
            clock_ms: self.clock.now().timestamp_millis(),
            windows: windows.values().map(|slot| slot.lock().unwrap().snapshot()).collect(),
        }
    }

    /// Re-adopts persisted window state, flushing anything the process missed
    /// while it was down.
    ///
    /// Snapshots taken under a different geometry are abandoned. Windows that
    /// fell behind the current clock are rolled forward, with non-empty
    /// evictions flushed to `sink`; windows beyond catch-up range are flushed
    /// in full and dropped. Returns the number of windows re-adopted.
    pub fn restore_state(&self, state: MetricState, sink: &dyn MetricSink) -> usize {
        if state.kind != self.spec.kind
            || state.granularity_secs != self.settings.granularity.num_seconds()
            || state.cardinality != self.settings.cardinality
        {
            warn!(
                metric = %self.spec.name,
                "Abandoning persisted window state with mismatched geometry."
            );
            return 0;
        }

        let step = self.settings.granularity.num_milliseconds();
        let target_end = self.clock.now() + self.settings.granularity * (self.settings.shift as i32);
        let mut restored = 0;

        let mut windows = self.windows.write().unwrap();
        for snapshot in state.windows {
            let fingerprint = snapshot.labels.fingerprint();
            let mut window = match Window::from_snapshot(
                self.spec.kind,
                self.settings.gauge_policy,
                self.settings.granularity,
                self.settings.cardinality,
                snapshot,
            ) {
                Some(window) => window,
                None => {
                    warn!(
                        metric = %self.spec.name,
                        "Abandoning persisted window with unusable shape."
                    );
                    continue;
                }
            };

            let behind = (target_end - window.span().1).num_milliseconds() / step;
            if behind < 0 {
                warn!(
                    metric = %self.spec.name,
                    "Abandoning persisted window positioned ahead of the clock."
                );
                continue;
            }

            if behind > self.settings.cardinality as i64 {
                // Everything the snapshot holds predates the current span.
                for _ in 0..self.settings.cardinality {
                    let evicted = window.roll();
                    if !evicted.is_empty() {
                        sink.update(
                            &self.spec.name,
                            self.spec.kind,
                            &window.labels().values(),
                            evicted.flush(),
                        );
                    }
                }
                continue;
            }

            for _ in 0..behind {
                let evicted = window.roll();
                if !evicted.is_empty() {
                    sink.update(
                        &self.spec.name,
                        self.spec.kind,
                        &window.labels().values(),
                        evicted.flush(),
                    );
                }
            }

            match windows.entry(fingerprint) {
                hashbrown::hash_map::Entry::Vacant(entry) => {
                    entry.insert(Mutex::new(window));
                    restored += 1;
                }
                hashbrown::hash_map::Entry::Occupied(_) => {
                    debug!(
                        metric = %self.spec.name,
                        "Skipping persisted window already recreated by live traffic."
                    );
                }
            }
        }

        restored
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use super::*;
    use crate::data_model::{GaugePolicy, MetricKind};
    use crate::testing::{labels_for_host, RecordingSink};

    fn settings(granularity_secs: i64, cardinality: usize) -> AggregationSettings {
        AggregationSettings {
            granularity: TimeDelta::seconds(granularity_secs),
            cardinality,
            shift: cardinality,
            gauge_policy: GaugePolicy::default(),
            idle_limit: 0,
        }
    }

    fn counter_spec() -> MetricSpec {
        MetricSpec {
            name: "requests_total".to_string(),
            help: "Requests processed.".to_string(),
            kind: MetricKind::Counter,
            buckets: None,
        }
    }

    fn epoch(secs: f64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis((secs * 1000.0) as i64).unwrap()
    }

    fn manager_at_epoch(granularity_secs: i64, cardinality: usize) -> MetricManager {
        let clock = Arc::new(SharedClock::new(epoch(0.0)));
        MetricManager::new(counter_spec(), settings(granularity_secs, cardinality), clock)
    }

    #[test]
    fn ticks_flush_buckets_in_order() {
        let clock = Arc::new(SharedClock::new(epoch(0.0)));
        let manager = MetricManager::new(counter_spec(), settings(1, 3), Arc::clone(&clock));
        let sink = RecordingSink::default();

        let labels = labels_for_host("node-1");
        manager.update_windows(epoch(0.5), labels.clone(), &MetricValue::IntDelta(1));
        manager.update_windows(epoch(1.2), labels, &MetricValue::IntDelta(2));

        clock.advance(TimeDelta::seconds(1));
        manager.tick(&sink);
        assert_eq!(sink.added("requests_total"), vec![1.0]);

        clock.advance(TimeDelta::seconds(1));
        manager.tick(&sink);
        assert_eq!(sink.added("requests_total"), vec![1.0, 2.0]);
    }

    #[test]
    fn stale_updates_are_discarded() {
        let manager = manager_at_epoch(1, 5);

        let outcome = manager.update_windows(
            epoch(-10.0),
            labels_for_host("node-1"),
            &MetricValue::IntDelta(5),
        );

        assert_eq!(outcome, UpdateOutcome::OutOfHorizon);
        assert_eq!(manager.discarded(), 1);
        assert_eq!(manager.window_count(), 1);
    }

    #[test]
    fn racing_first_updates_share_one_window() {
        let manager = Arc::new(manager_at_epoch(1, 3));

        std::thread::scope(|scope| {
            for _ in 0..8 {
                let manager = Arc::clone(&manager);
                scope.spawn(move || {
                    for _ in 0..125 {
                        manager.update_windows(
                            epoch(0.5),
                            labels_for_host("node-1"),
                            &MetricValue::IntDelta(1),
                        );
                    }
                });
            }
        });

        assert_eq!(manager.window_count(), 1);

        let sink = RecordingSink::default();
        manager.tick(&sink);
        assert_eq!(sink.added("requests_total"), vec![1000.0]);
    }

    #[test]
    fn idle_windows_are_reaped_once_drained() {
        let clock = Arc::new(SharedClock::new(epoch(0.0)));
        let mut idle_settings = settings(1, 3);
        idle_settings.idle_limit = 2;
        let manager = MetricManager::new(counter_spec(), idle_settings, Arc::clone(&clock));
        let sink = RecordingSink::default();

        manager.update_windows(epoch(2.5), labels_for_host("node-1"), &MetricValue::IntDelta(1));
        assert_eq!(manager.window_count(), 1);

        // Two idle ticks pass the threshold, but the update is still inside
        // the window, so the window must survive until it drains.
        clock.advance(TimeDelta::seconds(1));
        manager.tick(&sink);
        clock.advance(TimeDelta::seconds(1));
        manager.tick(&sink);
        assert_eq!(manager.window_count(), 1);

        clock.advance(TimeDelta::seconds(1));
        manager.tick(&sink);
        assert_eq!(manager.window_count(), 0);
        assert_eq!(sink.added("requests_total"), vec![0.0, 0.0, 1.0]);
    }

    #[test]
    fn restore_rolls_lagging_windows_forward() {
        let clock = Arc::new(SharedClock::new(epoch(0.0)));
        let manager = MetricManager::new(counter_spec(), settings(1, 3), Arc::clone(&clock));
        manager.update_windows(epoch(0.5), labels_for_host("node-1"), &MetricValue::IntDelta(7));
        let state = manager.snapshot_state();

        // Simulates a restart two granularity steps later.
        let later_clock = Arc::new(SharedClock::new(epoch(2.0)));
        let restored_manager =
            MetricManager::new(counter_spec(), settings(1, 3), Arc::clone(&later_clock));
        let sink = RecordingSink::default();

        assert_eq!(restored_manager.restore_state(state, &sink), 1);
        assert_eq!(sink.added("requests_total"), vec![7.0]);
        assert_eq!(restored_manager.window_count(), 1);
    }

    #[test]
    fn restore_abandons_mismatched_geometry() {
        let manager = manager_at_epoch(1, 3);
        manager.update_windows(epoch(0.5), labels_for_host("node-1"), &MetricValue::IntDelta(7));
        let state = manager.snapshot_state();

        let other = manager_at_epoch(2, 3);
        let sink = RecordingSink::default();
        assert_eq!(other.restore_state(state, &sink), 0);
        assert_eq!(other.window_count(), 0);
    }

    #[test]
    fn restore_flushes_windows_beyond_catch_up_range() {
        let clock = Arc::new(SharedClock::new(epoch(0.0)));
        let manager = MetricManager::new(counter_spec(), settings(1, 3), Arc::clone(&clock));
        manager.update_windows(epoch(1.5), labels_for_host("node-1"), &MetricValue::IntDelta(4));
        let state = manager.snapshot_state();

        let later_clock = Arc::new(SharedClock::new(epoch(60.0)));
        let restored_manager =
            MetricManager::new(counter_spec(), settings(1, 3), Arc::clone(&later_clock));
        let sink = RecordingSink::default();

        assert_eq!(restored_manager.restore_state(state, &sink), 0);
        assert_eq!(restored_manager.window_count(), 0);
        assert_eq!(sink.added("requests_total"), vec![4.0]);
    }
}
