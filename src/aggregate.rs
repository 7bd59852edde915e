//! Time buckets and the per-cycle counter fold.
//!
//! [`StopBucketCounters`] is the unit of merge: field-wise additive, so the
//! same struct serves as a signed delta during a cycle and as the running
//! total in the aggregate store.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A fixed-width aggregation window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Bucket {
    pub start: DateTime<Utc>,
    pub width_minutes: u32,
}

impl Bucket {
    /// The bucket containing `ts`, flooring to the bucket width.
    pub fn containing(ts: DateTime<Utc>, width_minutes: u32) -> Self {
        let width_secs = i64::from(width_minutes) * 60;
        let secs = ts.timestamp();
        let floored = secs - secs.rem_euclid(width_secs);
        Self {
            start: DateTime::from_timestamp(floored, 0).unwrap_or(ts),
            width_minutes,
        }
    }

    /// Stable key segment for ledger entries, e.g. `1700000000/60`.
    pub fn key(&self) -> String {
        format!("{}/{}", self.start.timestamp(), self.width_minutes)
    }
}

/// Per-stop, per-bucket reliability counters. `trip_count` counts distinct
/// trips; `observation_count` counts raw fetch-cycle hits for diagnostics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StopBucketCounters {
    pub trip_count: i64,
    pub on_time_count: i64,
    pub delayed_count: i64,
    pub cancelled_count: i64,
    pub total_delay_seconds: i64,
    pub observation_count: i64,
}

impl StopBucketCounters {
    /// Field-wise addition; associative and commutative, so merging cycle A
    /// then cycle B equals merging their sum.
    pub fn add(&mut self, other: &StopBucketCounters) {
        self.trip_count += other.trip_count;
        self.on_time_count += other.on_time_count;
        self.delayed_count += other.delayed_count;
        self.cancelled_count += other.cancelled_count;
        self.total_delay_seconds += other.total_delay_seconds;
        self.observation_count += other.observation_count;
    }

    pub fn is_zero(&self) -> bool {
        *self == StopBucketCounters::default()
    }
}

/// Accumulates one cycle's deltas and raw observation hits, keyed by
/// `(bucket, stop_id)`. Pure in-memory fold; discarded after merge.
#[derive(Debug, Default)]
pub struct CycleCounters {
    counters: HashMap<(Bucket, String), StopBucketCounters>,
}

impl CycleCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts a raw fetch hit, independent of deduplication.
    pub fn record_observations(&mut self, bucket: Bucket, stop_id: &str, hits: i64) {
        self.counters
            .entry((bucket, stop_id.to_string()))
            .or_default()
            .observation_count += hits;
    }

    /// Folds a ledger delta into the cycle totals.
    pub fn apply(&mut self, bucket: Bucket, stop_id: &str, delta: &StopBucketCounters) {
        if delta.is_zero() {
            return;
        }
        self.counters
            .entry((bucket, stop_id.to_string()))
            .or_default()
            .add(delta);
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn get(&self, bucket: Bucket, stop_id: &str) -> Option<&StopBucketCounters> {
        self.counters.get(&(bucket, stop_id.to_string()))
    }

    /// Drains the fold into a deterministic, merge-ready ordering.
    pub fn into_rows(self) -> Vec<(Bucket, String, StopBucketCounters)> {
        let mut rows: Vec<_> = self
            .counters
            .into_iter()
            .map(|((bucket, stop_id), counters)| (bucket, stop_id, counters))
            .collect();
        rows.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn test_bucket_floors_to_width() {
        // 10:34:17 into an hourly bucket starting 10:00:00
        let bucket = Bucket::containing(ts(3_600 * 100 + 2_057), 60);
        assert_eq!(bucket.start, ts(3_600 * 100));
        assert_eq!(bucket.width_minutes, 60);
    }

    #[test]
    fn test_bucket_start_is_identity() {
        let start = ts(3_600 * 100);
        assert_eq!(Bucket::containing(start, 60).start, start);
    }

    #[test]
    fn test_bucket_key_format() {
        let bucket = Bucket::containing(ts(360_000), 60);
        assert_eq!(bucket.key(), "360000/60");
    }

    #[test]
    fn test_add_is_field_wise() {
        let mut a = StopBucketCounters {
            trip_count: 1,
            on_time_count: 1,
            total_delay_seconds: 30,
            observation_count: 2,
            ..Default::default()
        };
        let b = StopBucketCounters {
            on_time_count: -1,
            delayed_count: 1,
            total_delay_seconds: 370,
            ..Default::default()
        };
        a.add(&b);

        assert_eq!(a.trip_count, 1);
        assert_eq!(a.on_time_count, 0);
        assert_eq!(a.delayed_count, 1);
        assert_eq!(a.total_delay_seconds, 400);
        assert_eq!(a.observation_count, 2);
    }

    #[test]
    fn test_add_associative_and_commutative() {
        let a = StopBucketCounters {
            trip_count: 2,
            on_time_count: 1,
            cancelled_count: 1,
            total_delay_seconds: 45,
            observation_count: 4,
            ..Default::default()
        };
        let b = StopBucketCounters {
            trip_count: 1,
            delayed_count: 1,
            total_delay_seconds: 400,
            observation_count: 1,
            ..Default::default()
        };
        let c = StopBucketCounters {
            on_time_count: -1,
            delayed_count: 1,
            total_delay_seconds: 370,
            ..Default::default()
        };

        let mut ab_c = a;
        ab_c.add(&b);
        ab_c.add(&c);

        let mut bc = b;
        bc.add(&c);
        let mut a_bc = a;
        a_bc.add(&bc);

        let mut ba = b;
        ba.add(&a);
        let mut ba_c = ba;
        ba_c.add(&c);

        assert_eq!(ab_c, a_bc);
        assert_eq!(ab_c, ba_c);
    }

    #[test]
    fn test_cycle_counters_fold() {
        let bucket = Bucket::containing(ts(360_000), 60);
        let mut cycle = CycleCounters::new();

        cycle.record_observations(bucket, "S1", 3);
        cycle.apply(
            bucket,
            "S1",
            &StopBucketCounters {
                trip_count: 1,
                on_time_count: 1,
                total_delay_seconds: 30,
                ..Default::default()
            },
        );
        cycle.apply(
            bucket,
            "S2",
            &StopBucketCounters {
                trip_count: 1,
                cancelled_count: 1,
                ..Default::default()
            },
        );

        assert_eq!(cycle.len(), 2);
        let s1 = cycle.get(bucket, "S1").unwrap();
        assert_eq!(s1.trip_count, 1);
        assert_eq!(s1.on_time_count, 1);
        assert_eq!(s1.observation_count, 3);

        let rows = cycle.into_rows();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].1, "S1");
        assert_eq!(rows[1].1, "S2");
    }

    #[test]
    fn test_zero_delta_creates_no_row() {
        let bucket = Bucket::containing(ts(360_000), 60);
        let mut cycle = CycleCounters::new();
        cycle.apply(bucket, "S1", &StopBucketCounters::default());
        assert!(cycle.is_empty());
    }
}
