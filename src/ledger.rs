//! Trip status ledger: the dedup engine.
//!
//! The feed is re-pulled on a fixed interval and each pull largely repeats
//! trip-stop pairs already seen, so naive counting would multiply-count the
//! same real-world event. The ledger remembers the last committed status per
//! `(bucket, stop, trip)` and emits a signed counter delta only when a trip's
//! status strictly upgrades in severity. Repeats and downgrades emit nothing.
//!
//! Ledger writes are deferred: [`resolve_cycle`] returns them as pending
//! updates and the cycle driver commits them only after the merge lands, so a
//! failed merge leaves the ledger at its pre-cycle state and the next cycle
//! re-emits the same deltas.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::aggregate::{Bucket, CycleCounters, StopBucketCounters};
use crate::classify::{TripStatus, classify};
use crate::config::Thresholds;
use crate::error::LedgerError;
use crate::feed::Observation;

/// Identity of one trip at one stop within one bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LedgerKey {
    pub bucket: Bucket,
    pub stop_id: String,
    pub trip_id: String,
}

impl LedgerKey {
    /// External key format: `{bucket_key}:{stop_id}:{trip_id_hash}`.
    pub fn encode(&self) -> String {
        let mut hasher = DefaultHasher::new();
        self.trip_id.hash(&mut hasher);
        format!(
            "{}:{}:{:016x}",
            self.bucket.key(),
            self.stop_id,
            hasher.finish()
        )
    }
}

/// Last committed status for a ledger key. The delay carries forward as the
/// maximum observed so an upgrade never subtracts from the delay total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordedStatus {
    pub status: TripStatus,
    pub delay_seconds: i32,
}

impl RecordedStatus {
    /// Wire format for the backing store: `status:delay`, e.g. `delayed:400`.
    pub fn encode(&self) -> String {
        format!("{}:{}", self.status.as_str(), self.delay_seconds)
    }

    pub fn parse(s: &str) -> Result<Self, LedgerError> {
        let (status, delay) = s
            .split_once(':')
            .ok_or_else(|| LedgerError::Corrupt(s.to_string()))?;
        let status =
            TripStatus::parse(status).ok_or_else(|| LedgerError::Corrupt(s.to_string()))?;
        let delay_seconds = delay
            .parse()
            .map_err(|_| LedgerError::Corrupt(s.to_string()))?;
        Ok(Self {
            status,
            delay_seconds,
        })
    }
}

/// Keyed TTL store holding the last committed status per (bucket, stop,
/// trip). Injected into the dedup step so tests can swap in doubles; a real
/// deployment may back this with any external key/value store.
pub trait StatusLedger: Send + Sync {
    fn get(&self, key: &LedgerKey) -> Result<Option<RecordedStatus>, LedgerError>;
    fn put(&self, key: &LedgerKey, status: RecordedStatus, ttl: Duration)
    -> Result<(), LedgerError>;

    /// Reclaims expired entries. Backends with native expiry can ignore this.
    fn sweep(&self) {}
}

/// In-process ledger: a mutex-guarded map of encoded keys to encoded status
/// strings with per-entry expiry instants.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("ledger lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StatusLedger for InMemoryLedger {
    fn get(&self, key: &LedgerKey) -> Result<Option<RecordedStatus>, LedgerError> {
        let entries = self.entries.lock().expect("ledger lock poisoned");
        match entries.get(&key.encode()) {
            Some((value, expires_at)) if *expires_at > Instant::now() => {
                RecordedStatus::parse(value).map(Some)
            }
            _ => Ok(None),
        }
    }

    fn put(
        &self,
        key: &LedgerKey,
        status: RecordedStatus,
        ttl: Duration,
    ) -> Result<(), LedgerError> {
        let mut entries = self.entries.lock().expect("ledger lock poisoned");
        entries.insert(key.encode(), (status.encode(), Instant::now() + ttl));
        Ok(())
    }

    fn sweep(&self) {
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("ledger lock poisoned");
        entries.retain(|_, (_, expires_at)| *expires_at > now);
    }
}

/// One cycle's dedup result: the counter fold to merge, the ledger writes to
/// commit after a successful merge, and diagnostics.
#[derive(Debug, Default)]
pub struct CycleOutcome {
    pub counters: CycleCounters,
    pub pending: Vec<(LedgerKey, RecordedStatus)>,
    /// Distinct (bucket, stop, trip) pairs seen this cycle.
    pub resolved_pairs: usize,
    /// Ledger reads that failed and were treated as never-seen.
    pub degraded_reads: usize,
}

/// Worst-of-cycle reduction for one (bucket, stop, trip) pair.
#[derive(Debug, Clone, Copy)]
struct Reduced {
    status: TripStatus,
    delay_seconds: i32,
    hits: i64,
}

/// Reduces a cycle's observations to worst-of-cycle statuses, then resolves
/// each against the ledger into at most one signed delta per pair.
pub fn resolve_cycle<L: StatusLedger>(
    ledger: &L,
    observations: &[Observation],
    thresholds: &Thresholds,
    bucket_minutes: u32,
) -> CycleOutcome {
    let mut reduced: HashMap<LedgerKey, Reduced> = HashMap::new();

    for obs in observations {
        let key = LedgerKey {
            bucket: Bucket::containing(obs.feed_timestamp, bucket_minutes),
            stop_id: obs.stop_id.clone(),
            trip_id: obs.trip_id.clone(),
        };
        let status = classify(
            obs.departure_delay_seconds,
            obs.schedule_relationship.is_cancellation(),
            thresholds,
        );
        let delay = obs.departure_delay_seconds.unwrap_or(0);

        reduced
            .entry(key)
            .and_modify(|r| {
                r.status = r.status.max(status);
                r.delay_seconds = r.delay_seconds.max(delay);
                r.hits += 1;
            })
            .or_insert(Reduced {
                status,
                delay_seconds: delay,
                hits: 1,
            });
    }

    let mut outcome = CycleOutcome {
        resolved_pairs: reduced.len(),
        ..Default::default()
    };

    for (key, new) in reduced {
        outcome
            .counters
            .record_observations(key.bucket, &key.stop_id, new.hits);

        let previous = match ledger.get(&key) {
            Ok(prev) => prev,
            Err(e) => {
                // Treat as never-seen: bounded over-counting beats dropping
                // the cycle's data on the floor.
                warn!(key = %key.encode(), error = %e, "ledger read failed, treating as first sighting");
                outcome.degraded_reads += 1;
                None
            }
        };

        match previous {
            None => {
                let recorded = RecordedStatus {
                    status: new.status,
                    delay_seconds: new.delay_seconds,
                };
                outcome
                    .counters
                    .apply(key.bucket, &key.stop_id, &first_sighting_delta(recorded));
                outcome.pending.push((key, recorded));
            }
            Some(prev) if new.status > prev.status => {
                let recorded = RecordedStatus {
                    status: new.status,
                    delay_seconds: prev.delay_seconds.max(new.delay_seconds),
                };
                outcome
                    .counters
                    .apply(key.bucket, &key.stop_id, &upgrade_delta(prev, recorded));
                outcome.pending.push((key, recorded));
            }
            // Tie or downgrade: the trip already counts at this severity or
            // worse. Nothing to emit, nothing to rewrite.
            Some(_) => {}
        }
    }

    outcome
}

/// Full-weight delta for a pair never seen in this bucket.
fn first_sighting_delta(recorded: RecordedStatus) -> StopBucketCounters {
    let mut delta = StopBucketCounters {
        trip_count: 1,
        total_delay_seconds: i64::from(recorded.delay_seconds),
        ..Default::default()
    };
    bump_status(&mut delta, recorded.status, 1);
    delta
}

/// Move delta for a severity upgrade: the trip leaves its old status bucket
/// and enters the new one; the trip itself is not re-counted.
fn upgrade_delta(prev: RecordedStatus, next: RecordedStatus) -> StopBucketCounters {
    let mut delta = StopBucketCounters {
        total_delay_seconds: i64::from(next.delay_seconds - prev.delay_seconds),
        ..Default::default()
    };
    bump_status(&mut delta, prev.status, -1);
    bump_status(&mut delta, next.status, 1);
    delta
}

fn bump_status(delta: &mut StopBucketCounters, status: TripStatus, by: i64) {
    match status {
        // Unknown has no status column; it only holds the trip count.
        TripStatus::Unknown => {}
        TripStatus::OnTime => delta.on_time_count += by,
        TripStatus::Delayed => delta.delayed_count += by,
        TripStatus::Cancelled => delta.cancelled_count += by,
    }
}
