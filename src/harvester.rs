//! The harvest scheduler: drives periodic cycles, isolates per-cycle
//! failures, and runs retention cleanup on its own cadence.
//!
//! One logical worker loop per instance; at most one cycle executes at a
//! time. An overrunning cycle delays the next tick rather than overlapping
//! it. Every stage failure is absorbed: the scheduler logs it and returns to
//! idle for the next tick.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::{self, Duration, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::config::HarvestConfig;
use crate::error::CycleError;
use crate::feed::FeedSource;
use crate::ledger::{StatusLedger, resolve_cycle};
use crate::store::{AggregateStore, StagedRow};

/// Outcome of one successful cycle, for logging and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct CycleReport {
    pub entity_count: usize,
    pub observations: usize,
    pub skipped: usize,
    pub resolved_pairs: usize,
    pub degraded_reads: usize,
    pub staged_rows: usize,
    pub rows_affected: u64,
    pub ledger_write_failures: usize,
}

pub struct Harvester<F, L, S> {
    source: F,
    ledger: Arc<L>,
    store: Arc<S>,
    config: HarvestConfig,
}

impl<F, L, S> Harvester<F, L, S>
where
    F: FeedSource,
    L: StatusLedger,
    S: AggregateStore,
{
    pub fn new(source: F, ledger: Arc<L>, store: Arc<S>, config: HarvestConfig) -> Self {
        Self {
            source,
            ledger,
            store,
            config,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Runs one full cycle: fetch, classify, dedup, aggregate, merge.
    ///
    /// Ledger updates are committed only after the merge lands; a failed
    /// merge leaves the ledger at its pre-cycle state so the next cycle
    /// re-derives the same deltas instead of under-counting.
    #[tracing::instrument(skip(self))]
    pub async fn run_cycle(&self) -> Result<CycleReport, CycleError> {
        let snapshot = self.source.read().await?;
        if snapshot.skipped > 0 {
            warn!(
                skipped = snapshot.skipped,
                "observations dropped for missing trip or stop ids"
            );
        }

        let outcome = resolve_cycle(
            self.ledger.as_ref(),
            &snapshot.observations,
            &self.config.thresholds(),
            self.config.bucket_minutes,
        );

        let batch: Vec<StagedRow> = outcome
            .counters
            .into_rows()
            .into_iter()
            .map(|(bucket, stop_id, counters)| StagedRow {
                stop_id,
                bucket,
                counters,
            })
            .collect();
        let staged_rows = batch.len();

        let rows_affected = self.store.merge(batch).await?;

        // Merge has landed; now the cycle's statuses become the committed
        // baseline for future cycles.
        let ttl = self.config.ledger_ttl();
        let mut ledger_write_failures = 0;
        for (key, recorded) in &outcome.pending {
            if let Err(e) = self.ledger.put(key, *recorded, ttl) {
                ledger_write_failures += 1;
                warn!(key = %key.encode(), error = %e, "ledger write failed after merge");
            }
        }
        self.ledger.sweep();

        Ok(CycleReport {
            entity_count: snapshot.entity_count,
            observations: snapshot.observations.len(),
            skipped: snapshot.skipped,
            resolved_pairs: outcome.resolved_pairs,
            degraded_reads: outcome.degraded_reads,
            staged_rows,
            rows_affected,
            ledger_write_failures,
        })
    }

    /// Ticks harvest cycles at the configured interval until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = time::interval(Duration::from_secs(self.config.interval_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            interval_secs = self.config.interval_secs,
            bucket_minutes = self.config.bucket_minutes,
            "harvester started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.run_cycle().await {
                        Ok(report) => info!(
                            entities = report.entity_count,
                            observations = report.observations,
                            skipped = report.skipped,
                            pairs = report.resolved_pairs,
                            degraded_reads = report.degraded_reads,
                            staged = report.staged_rows,
                            rows = report.rows_affected,
                            "cycle complete"
                        ),
                        Err(e) => error!(error = %e, "cycle failed, retrying next tick"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("harvester shutting down");
                    break;
                }
            }
        }
    }

    /// Deletes aggregate rows past the retention horizon on an independent
    /// cadence until shutdown.
    pub async fn run_retention(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = time::interval(Duration::from_secs(self.config.retention_interval_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let cutoff = Utc::now() - self.config.retention_horizon();
                    match self.store.prune_older_than(cutoff).await {
                        Ok(removed) => info!(removed, %cutoff, "retention sweep complete"),
                        Err(e) => warn!(error = %e, "retention sweep failed"),
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::Bucket;
    use crate::error::{FetchError, LedgerError, MergeError};
    use crate::feed::{FeedSnapshot, Observation, ScheduleRelationship};
    use crate::ledger::InMemoryLedger;
    use crate::store::{InMemoryStore, RowKey};
    use async_trait::async_trait;
    use chrono::DateTime;
    use std::sync::Mutex;

    fn config() -> HarvestConfig {
        HarvestConfig {
            feed_url: "http://example.org/feed.pb".to_string(),
            interval_secs: 300,
            bucket_minutes: 60,
            delayed_after_seconds: 300,
            on_time_within_seconds: 60,
            retention_days: 90,
            retention_interval_secs: 86_400,
        }
    }

    fn obs(trip: &str, stop: &str, delay: Option<i32>, cancelled: bool) -> Observation {
        Observation {
            trip_id: trip.to_string(),
            route_id: None,
            stop_id: stop.to_string(),
            stop_sequence: 1,
            departure_delay_seconds: delay,
            schedule_relationship: if cancelled {
                ScheduleRelationship::Canceled
            } else {
                ScheduleRelationship::Scheduled
            },
            feed_timestamp: DateTime::from_timestamp(360_600, 0).unwrap(),
        }
    }

    fn row_key(stop: &str) -> RowKey {
        RowKey {
            stop_id: stop.to_string(),
            bucket_start: Bucket::containing(DateTime::from_timestamp(360_600, 0).unwrap(), 60)
                .start,
            bucket_width_minutes: 60,
        }
    }

    /// Serves a scripted sequence of snapshots, one per cycle.
    struct ScriptedFeed {
        cycles: Mutex<Vec<Vec<Observation>>>,
    }

    impl ScriptedFeed {
        fn new(cycles: Vec<Vec<Observation>>) -> Self {
            Self {
                cycles: Mutex::new(cycles),
            }
        }
    }

    #[async_trait]
    impl FeedSource for ScriptedFeed {
        async fn read(&self) -> Result<FeedSnapshot, FetchError> {
            let mut cycles = self.cycles.lock().unwrap();
            if cycles.is_empty() {
                return Err(FetchError::BadUrl("script exhausted".to_string()));
            }
            let observations = cycles.remove(0);
            Ok(FeedSnapshot {
                entity_count: observations.len(),
                observations,
                skipped: 0,
            })
        }
    }

    /// Rejects every merge, leaving the store untouched.
    struct FailingStore;

    #[async_trait]
    impl AggregateStore for FailingStore {
        async fn merge(&self, _batch: Vec<StagedRow>) -> Result<u64, MergeError> {
            Err(MergeError::Transaction("deadlock".to_string()))
        }

        async fn prune_older_than(&self, _cutoff: DateTime<chrono::Utc>) -> Result<u64, MergeError> {
            Err(MergeError::Unavailable("down".to_string()))
        }
    }

    #[tokio::test]
    async fn test_cycle_end_to_end() {
        let feed = ScriptedFeed::new(vec![vec![
            obs("T1", "S1", None, true),
            obs("T2", "S1", Some(10), false),
        ]]);
        let harvester = Harvester::new(
            feed,
            Arc::new(InMemoryLedger::new()),
            Arc::new(InMemoryStore::new()),
            config(),
        );

        let report = harvester.run_cycle().await.unwrap();
        assert_eq!(report.observations, 2);
        assert_eq!(report.resolved_pairs, 2);
        assert_eq!(report.staged_rows, 1);
        assert_eq!(report.rows_affected, 1);
        assert_eq!(report.ledger_write_failures, 0);

        let row = harvester.store().get(&row_key("S1")).await.unwrap();
        assert_eq!(row.counters.trip_count, 2);
        assert_eq!(row.counters.cancelled_count, 1);
        assert_eq!(row.counters.on_time_count, 1);
    }

    #[tokio::test]
    async fn test_repeated_cycles_count_once() {
        let same = vec![obs("T1", "S1", Some(600), false)];
        let feed = ScriptedFeed::new(vec![same.clone(), same.clone(), same]);
        let harvester = Harvester::new(
            feed,
            Arc::new(InMemoryLedger::new()),
            Arc::new(InMemoryStore::new()),
            config(),
        );

        for _ in 0..3 {
            harvester.run_cycle().await.unwrap();
        }

        let row = harvester.store().get(&row_key("S1")).await.unwrap();
        assert_eq!(row.counters.trip_count, 1);
        assert_eq!(row.counters.delayed_count, 1);
        assert_eq!(row.counters.total_delay_seconds, 600);
        // Three polls, three raw hits.
        assert_eq!(row.counters.observation_count, 3);
    }

    #[tokio::test]
    async fn test_status_flip_moves_the_tally() {
        let feed = ScriptedFeed::new(vec![
            vec![obs("T1", "S1", Some(30), false)],
            vec![obs("T1", "S1", Some(400), false)],
            vec![obs("T1", "S1", Some(30), false)],
        ]);
        let harvester = Harvester::new(
            feed,
            Arc::new(InMemoryLedger::new()),
            Arc::new(InMemoryStore::new()),
            config(),
        );

        for _ in 0..3 {
            harvester.run_cycle().await.unwrap();
        }

        let row = harvester.store().get(&row_key("S1")).await.unwrap();
        assert_eq!(row.counters.trip_count, 1);
        assert_eq!(row.counters.on_time_count, 0);
        assert_eq!(row.counters.delayed_count, 1);
        assert_eq!(row.counters.total_delay_seconds, 400);
    }

    #[tokio::test]
    async fn test_fetch_failure_aborts_cycle_cleanly() {
        let feed = ScriptedFeed::new(vec![]);
        let ledger = Arc::new(InMemoryLedger::new());
        let harvester = Harvester::new(
            feed,
            ledger.clone(),
            Arc::new(InMemoryStore::new()),
            config(),
        );

        let err = harvester.run_cycle().await.unwrap_err();
        assert!(matches!(err, CycleError::Fetch(_)));
        assert!(ledger.is_empty());
        assert!(harvester.store().is_empty().await);
    }

    #[tokio::test]
    async fn test_merge_failure_leaves_ledger_unwritten() {
        let observations = vec![obs("T1", "S1", Some(30), false)];
        let ledger = Arc::new(InMemoryLedger::new());

        let failing = Harvester::new(
            ScriptedFeed::new(vec![observations.clone()]),
            ledger.clone(),
            Arc::new(FailingStore),
            config(),
        );
        let err = failing.run_cycle().await.unwrap_err();
        assert!(matches!(err, CycleError::Merge(_)));
        assert!(ledger.is_empty());

        // Next cycle against a healthy store re-emits the full delta, so the
        // failed cycle's contribution is not lost.
        let healthy = Harvester::new(
            ScriptedFeed::new(vec![observations]),
            ledger.clone(),
            Arc::new(InMemoryStore::new()),
            config(),
        );
        healthy.run_cycle().await.unwrap();
        let row = healthy.store().get(&row_key("S1")).await.unwrap();
        assert_eq!(row.counters.trip_count, 1);
        assert_eq!(row.counters.on_time_count, 1);
        assert!(!ledger.is_empty());
    }

    #[tokio::test]
    async fn test_ledger_put_failure_after_merge_is_tolerated() {
        struct ReadOnlyLedger(InMemoryLedger);

        impl StatusLedger for ReadOnlyLedger {
            fn get(
                &self,
                key: &crate::ledger::LedgerKey,
            ) -> Result<Option<crate::ledger::RecordedStatus>, LedgerError> {
                self.0.get(key)
            }

            fn put(
                &self,
                _key: &crate::ledger::LedgerKey,
                _status: crate::ledger::RecordedStatus,
                _ttl: std::time::Duration,
            ) -> Result<(), LedgerError> {
                Err(LedgerError::Unavailable("read only".to_string()))
            }
        }

        let feed = ScriptedFeed::new(vec![vec![obs("T1", "S1", Some(30), false)]]);
        let harvester = Harvester::new(
            feed,
            Arc::new(ReadOnlyLedger(InMemoryLedger::new())),
            Arc::new(InMemoryStore::new()),
            config(),
        );

        let report = harvester.run_cycle().await.unwrap();
        assert_eq!(report.rows_affected, 1);
        assert_eq!(report.ledger_write_failures, 1);
    }

    #[tokio::test]
    async fn test_shutdown_stops_the_loop() {
        let feed = ScriptedFeed::new(vec![]);
        let harvester = Arc::new(Harvester::new(
            feed,
            Arc::new(InMemoryLedger::new()),
            Arc::new(InMemoryStore::new()),
            config(),
        ));

        let (tx, rx) = watch::channel(false);
        let handle = {
            let harvester = harvester.clone();
            tokio::spawn(async move { harvester.run(rx).await })
        };

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop did not stop on shutdown")
            .unwrap();
    }
}
