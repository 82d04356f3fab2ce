//! Sliding windows of contiguous buckets.

use std::collections::VecDeque;

use chrono::{DateTime, TimeDelta, Utc};

use crate::data_model::{GaugePolicy, LabelSet, MetricKind, MetricValue};
use crate::persist::WindowSnapshot;
use crate::store::bucket::Bucket;

/// Result of applying an update to a window.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UpdateOutcome {
    /// The update landed in a bucket.
    Accepted,

    /// The update's timestamp fell outside the acceptance horizon and was
    /// discarded.
    OutOfHorizon,
}

/// A fixed-cardinality run of contiguous buckets for one label set.
///
/// With granularity `G`, cardinality `C`, and shift `s`, a window whose clock
/// reads `S` spans `[S - (C - s) * G, S + s * G)`. The shift controls how much
/// of the window sits ahead of the clock: `s = C` accepts only events at or
/// after the synchronization instant, while smaller shifts trade future
/// coverage for tolerance of late arrivals. Rolling evicts the oldest bucket
/// and appends a fresh one after the newest, so the span advances exactly one
/// granularity per roll and the invariant holds as long as the clock advanced
/// one step first.
pub struct Window {
    kind: MetricKind,
    policy: GaugePolicy,
    granularity: TimeDelta,
    labels: LabelSet,
    buckets: VecDeque<Bucket>,
    discarded: u64,
    idle_ticks: u64,
}

impl Window {
    /// Creates a window positioned against the synchronization instant
    /// `sync`.
    pub fn new(
        kind: MetricKind,
        policy: GaugePolicy,
        granularity: TimeDelta,
        cardinality: usize,
        shift: usize,
        sync: DateTime<Utc>,
        labels: LabelSet,
    ) -> Self {
        let behind = cardinality.saturating_sub(shift) as i32;
        let base = sync - granularity * behind;
        let buckets = (0..cardinality)
            .map(|i| Bucket::new(kind, policy, base + granularity * (i as i32), granularity))
            .collect();

        Self {
            kind,
            policy,
            granularity,
            labels,
            buckets,
            discarded: 0,
            idle_ticks: 0,
        }
    }

    /// Labels identifying this window's series.
    pub fn labels(&self) -> &LabelSet {
        &self.labels
    }

    /// The half-open interval currently covered, as `(start, end)`.
    pub fn span(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        let first = self.buckets.front().expect("window always holds a bucket");
        let last = self.buckets.back().expect("window always holds a bucket");
        (first.start(), last.end())
    }

    /// Number of updates rejected for falling outside the span.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Number of consecutive rolls since the last accepted update.
    pub fn idle_ticks(&self) -> u64 {
        self.idle_ticks
    }

    /// Whether every bucket in the window is untouched.
    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|b| b.is_empty())
    }

    /// Applies `value` to the bucket covering `t`.
    ///
    /// Updates outside the span are counted and dropped; the caller decides
    /// whether that warrants telemetry.
    pub fn update(&mut self, t: DateTime<Utc>, value: &MetricValue) -> UpdateOutcome {
        match self.bucket_index(t) {
            Some(index) => {
                if let Some(bucket) = self.buckets.get_mut(index) {
                    bucket.update(value);
                }
                self.idle_ticks = 0;
                UpdateOutcome::Accepted
            }
            None => {
                self.discarded += 1;
                UpdateOutcome::OutOfHorizon
            }
        }
    }

    /// Evicts the oldest bucket, appends a fresh one after the newest, and
    /// returns the evicted bucket for flushing.
    pub fn roll(&mut self) -> Bucket {
        let evicted = self
            .buckets
            .pop_front()
            .expect("window always holds a bucket");
        let next_start = self
            .buckets
            .back()
            .map(|b| b.end())
            .unwrap_or_else(|| evicted.end());
        self.buckets
            .push_back(Bucket::new(self.kind, self.policy, next_start, self.granularity));
        self.idle_ticks += 1;
        evicted
    }

    fn bucket_index(&self, t: DateTime<Utc>) -> Option<usize> {
        let (start, end) = self.span();
        if t < start || t >= end {
            return None;
        }

        let step = self.granularity.num_milliseconds();
        let offset = (t - start).num_milliseconds();
        Some((offset / step) as usize)
    }

    /// Captures the window for persistence.
    pub fn snapshot(&self) -> WindowSnapshot {
        WindowSnapshot {
            labels: self.labels.clone(),
            start_ms: self.span().0.timestamp_millis(),
            buckets: self.buckets.iter().map(|b| b.snapshot()).collect(),
        }
    }

    /// Rebuilds a window from a persisted snapshot.
    ///
    /// Returns `None` when the snapshot's geometry or accumulator shapes do
    /// not match the current configuration.
    pub fn from_snapshot(
        kind: MetricKind,
        policy: GaugePolicy,
        granularity: TimeDelta,
        cardinality: usize,
        snapshot: WindowSnapshot,
    ) -> Option<Self> {
        let step = granularity.num_milliseconds();
        if snapshot.buckets.len() != cardinality || snapshot.start_ms.rem_euclid(step) != 0 {
            return None;
        }

        let base = DateTime::from_timestamp_millis(snapshot.start_ms)?;
        let mut buckets = VecDeque::with_capacity(cardinality);
        for (i, acc) in snapshot.buckets.into_iter().enumerate() {
            let start = base + granularity * (i as i32);
            buckets.push_back(Bucket::from_snapshot(kind, policy, start, granularity, acc)?);
        }

        Some(Self {
            kind,
            policy,
            granularity,
            labels: snapshot.labels,
            buckets,
            discarded: 0,
            idle_ticks: 0,
        })
    }
}
