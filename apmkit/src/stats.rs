//! Metric aggregation
//!
//! Closing transactions accumulate their timings into a private workarea and
//! only then merge it into the application engine under one short lock hold.
//! Each harvest swaps the engine contents out as a snapshot; snapshots from
//! failed exports merge back in, bounded by the configured merge limit.

use std::borrow::{Borrow, Cow};
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, SystemTime};

/// Name of an aggregated metric, e.g. `Database/select` or
/// `WebTransaction/checkout`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MetricName(Cow<'static, str>);

impl MetricName {
    /// Create a new const `MetricName`.
    pub const fn from_static(name: &'static str) -> Self {
        MetricName(Cow::Borrowed(name))
    }

    /// Returns a reference to the underlying name
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&'static str> for MetricName {
    fn from(name: &'static str) -> Self {
        MetricName(Cow::Borrowed(name))
    }
}

impl From<String> for MetricName {
    fn from(name: String) -> Self {
        MetricName(Cow::Owned(name))
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for MetricName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Accumulated timing statistics for one metric.
#[derive(Clone, Debug, Default, PartialEq)]
#[non_exhaustive]
pub struct TimeStats {
    /// Number of recorded calls.
    pub call_count: u64,

    /// Summed wall time across calls.
    pub total: Duration,

    /// Summed exclusive time (wall time minus child segment time).
    pub exclusive: Duration,

    /// Shortest recorded call.
    pub min: Duration,

    /// Longest recorded call.
    pub max: Duration,

    /// Sum of squared call times in seconds, for variance downstream.
    pub sum_of_squares: f64,
}

impl TimeStats {
    /// Record one call.
    pub fn record(&mut self, duration: Duration, exclusive: Duration) {
        self.min = if self.call_count == 0 {
            duration
        } else {
            self.min.min(duration)
        };
        self.max = self.max.max(duration);
        self.call_count += 1;
        self.total = self.total.saturating_add(duration);
        self.exclusive = self.exclusive.saturating_add(exclusive);
        let secs = duration.as_secs_f64();
        self.sum_of_squares += secs * secs;
    }

    /// Fold another accumulator into this one.
    pub fn merge(&mut self, other: &TimeStats) {
        if other.call_count == 0 {
            return;
        }
        self.min = if self.call_count == 0 {
            other.min
        } else {
            self.min.min(other.min)
        };
        self.max = self.max.max(other.max);
        self.call_count += other.call_count;
        self.total = self.total.saturating_add(other.total);
        self.exclusive = self.exclusive.saturating_add(other.exclusive);
        self.sum_of_squares += other.sum_of_squares;
    }
}

/// A transaction-private metric table, merged into the shared engine in one
/// lock hold when the transaction is recorded.
pub(crate) type MetricWorkarea = HashMap<MetricName, TimeStats>;

/// The shared per-application aggregation engine.
#[derive(Debug)]
pub(crate) struct StatsEngine {
    metrics: HashMap<MetricName, TimeStats>,
    transaction_count: u64,
    abandoned_count: u64,
    dropped_segment_count: u64,
    dropped_attribute_count: u64,
    merge_count: u32,
    period_start: SystemTime,
}

impl StatsEngine {
    pub(crate) fn new(period_start: SystemTime) -> Self {
        StatsEngine {
            metrics: HashMap::new(),
            transaction_count: 0,
            abandoned_count: 0,
            dropped_segment_count: 0,
            dropped_attribute_count: 0,
            merge_count: 0,
            period_start,
        }
    }

    pub(crate) fn metrics(&self) -> &HashMap<MetricName, TimeStats> {
        &self.metrics
    }

    pub(crate) fn transaction_count(&self) -> u64 {
        self.transaction_count
    }

    pub(crate) fn abandoned_count(&self) -> u64 {
        self.abandoned_count
    }

    pub(crate) fn dropped_segment_count(&self) -> u64 {
        self.dropped_segment_count
    }

    pub(crate) fn dropped_attribute_count(&self) -> u64 {
        self.dropped_attribute_count
    }

    #[cfg(test)]
    pub(crate) fn merge_count(&self) -> u32 {
        self.merge_count
    }

    pub(crate) fn period_start(&self) -> SystemTime {
        self.period_start
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.metrics.is_empty() && self.transaction_count == 0 && self.abandoned_count == 0
    }

    /// Record one call of a named metric straight into the engine.
    pub(crate) fn record_time(
        &mut self,
        name: impl Into<MetricName>,
        duration: Duration,
        exclusive: Duration,
    ) {
        self.metrics
            .entry(name.into())
            .or_default()
            .record(duration, exclusive);
    }

    /// Record a zero-duration occurrence, used for marker metrics such as
    /// `Instance/Reporting`.
    pub(crate) fn increment_counter(&mut self, name: impl Into<MetricName>) {
        self.record_time(name, Duration::ZERO, Duration::ZERO);
    }

    /// Merge one finished transaction's workarea. Called with the engine
    /// lock held; the workarea was assembled without it.
    pub(crate) fn merge_workarea(&mut self, workarea: MetricWorkarea) {
        for (name, stats) in workarea {
            self.metrics.entry(name).or_default().merge(&stats);
        }
        self.transaction_count += 1;
    }

    pub(crate) fn note_abandoned(&mut self, count: u64) {
        self.abandoned_count += count;
    }

    pub(crate) fn note_dropped_segments(&mut self, count: u64) {
        self.dropped_segment_count += count;
    }

    pub(crate) fn note_dropped_attributes(&mut self, count: u64) {
        self.dropped_attribute_count += count;
    }

    /// Swap the accumulated contents out for export, leaving a fresh engine
    /// whose period starts now.
    pub(crate) fn harvest_snapshot(&mut self, now: SystemTime) -> StatsEngine {
        std::mem::replace(self, StatsEngine::new(now))
    }

    /// Merge a failed harvest's snapshot back for the next cycle. Returns
    /// `false` when the snapshot exceeded `max_merges` and was discarded
    /// instead.
    pub(crate) fn merge_back(&mut self, mut snapshot: StatsEngine, max_merges: u32) -> bool {
        snapshot.merge_count += 1;
        if snapshot.merge_count > max_merges {
            return false;
        }
        for (name, stats) in snapshot.metrics {
            self.metrics.entry(name).or_default().merge(&stats);
        }
        self.transaction_count += snapshot.transaction_count;
        self.abandoned_count += snapshot.abandoned_count;
        self.dropped_segment_count += snapshot.dropped_segment_count;
        self.dropped_attribute_count += snapshot.dropped_attribute_count;
        self.merge_count = self.merge_count.max(snapshot.merge_count);
        self.period_start = self.period_start.min(snapshot.period_start);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn record_tracks_extremes_and_totals() {
        let mut stats = TimeStats::default();
        stats.record(secs(2), secs(1));
        stats.record(secs(4), secs(4));
        stats.record(secs(1), secs(1));

        assert_eq!(stats.call_count, 3);
        assert_eq!(stats.total, secs(7));
        assert_eq!(stats.exclusive, secs(6));
        assert_eq!(stats.min, secs(1));
        assert_eq!(stats.max, secs(4));
        assert!((stats.sum_of_squares - 21.0).abs() < 1e-9);
    }

    #[test]
    fn merge_respects_empty_sides() {
        let mut left = TimeStats::default();
        let mut right = TimeStats::default();
        right.record(secs(3), secs(3));

        left.merge(&right);
        assert_eq!(left.min, secs(3));
        assert_eq!(left.call_count, 1);

        // Merging an empty accumulator must not disturb the min.
        left.merge(&TimeStats::default());
        assert_eq!(left.min, secs(3));
        assert_eq!(left.call_count, 1);
    }

    #[test]
    fn workarea_merge_counts_the_transaction() {
        let mut engine = StatsEngine::new(SystemTime::UNIX_EPOCH);
        let mut workarea = MetricWorkarea::new();
        workarea
            .entry("Database/select".into())
            .or_default()
            .record(secs(1), secs(1));
        workarea
            .entry("Database/select".into())
            .or_default()
            .record(secs(3), secs(3));

        engine.merge_workarea(workarea);
        assert_eq!(engine.transaction_count(), 1);
        let stats = &engine.metrics()["Database/select"];
        assert_eq!(stats.call_count, 2);
        assert_eq!(stats.total, secs(4));
    }

    #[test]
    fn snapshot_swaps_in_a_fresh_engine() {
        let start = SystemTime::UNIX_EPOCH;
        let later = start + secs(60);
        let mut engine = StatsEngine::new(start);
        engine.record_time("Function/index", secs(1), secs(1));
        engine.note_dropped_segments(2);

        let snapshot = engine.harvest_snapshot(later);
        assert_eq!(snapshot.period_start(), start);
        assert_eq!(snapshot.metrics().len(), 1);
        assert_eq!(snapshot.dropped_segment_count(), 2);

        assert!(engine.is_empty());
        assert_eq!(engine.period_start(), later);
    }

    #[test]
    fn merge_back_is_bounded() {
        let start = SystemTime::UNIX_EPOCH;
        let mut engine = StatsEngine::new(start);

        let mut snapshot = StatsEngine::new(start);
        snapshot.record_time("Function/index", secs(1), secs(1));
        snapshot.merge_count = 1;

        assert!(engine.merge_back(snapshot, 5));
        assert_eq!(engine.merge_count(), 2);
        assert_eq!(engine.metrics().len(), 1);

        let mut stale = StatsEngine::new(start);
        stale.record_time("Function/index", secs(1), secs(1));
        stale.merge_count = 5;
        assert!(!engine.merge_back(stale, 5));
        // Discarded snapshot contributes nothing.
        assert_eq!(engine.metrics()["Function/index"].call_count, 1);
    }

    #[test]
    fn increment_counter_is_a_zero_duration_call() {
        let mut engine = StatsEngine::new(SystemTime::UNIX_EPOCH);
        engine.increment_counter("Instance/Reporting");
        engine.increment_counter("Instance/Reporting");
        let stats = &engine.metrics()["Instance/Reporting"];
        assert_eq!(stats.call_count, 2);
        assert_eq!(stats.total, Duration::ZERO);
    }
}
