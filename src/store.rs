//! Durable aggregate store seam and the bulk merge writer contract.
//!
//! A merge is always an additive upsert, never an overwrite: deduplication
//! lives entirely in the ledger step, so the only double-counting risk is
//! applying the same delta twice, which the all-or-nothing merge rules out.

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::debug;

use crate::aggregate::{Bucket, StopBucketCounters};
use crate::error::MergeError;

/// Unique row identity: `(stop_id, bucket_start, bucket_width_minutes)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RowKey {
    pub stop_id: String,
    pub bucket_start: DateTime<Utc>,
    pub bucket_width_minutes: u32,
}

/// One durable row of reliability counters, monotonically non-decreasing
/// across merges within a bucket.
#[derive(Debug, Clone, Serialize)]
pub struct AggregateRow {
    pub stop_id: String,
    pub bucket_start: DateTime<Utc>,
    pub bucket_width_minutes: u32,
    #[serde(flatten)]
    pub counters: StopBucketCounters,
    pub last_updated_at: DateTime<Utc>,
}

impl AggregateRow {
    pub fn key(&self) -> RowKey {
        RowKey {
            stop_id: self.stop_id.clone(),
            bucket_start: self.bucket_start,
            bucket_width_minutes: self.bucket_width_minutes,
        }
    }
}

/// One staged delta row, ready for the set-based merge.
#[derive(Debug, Clone)]
pub struct StagedRow {
    pub stop_id: String,
    pub bucket: Bucket,
    pub counters: StopBucketCounters,
}

impl StagedRow {
    pub fn key(&self) -> RowKey {
        RowKey {
            stop_id: self.stop_id.clone(),
            bucket_start: self.bucket.start,
            bucket_width_minutes: self.bucket.width_minutes,
        }
    }
}

/// The persistence seam. One cycle's whole batch lands in a single
/// all-or-nothing additive merge; a failed merge applies nothing, because
/// resuming a partially committed merge on retry would double count.
#[async_trait]
pub trait AggregateStore: Send + Sync {
    /// Applies the staged batch as one additive upsert. Returns the number
    /// of rows created or updated.
    async fn merge(&self, batch: Vec<StagedRow>) -> Result<u64, MergeError>;

    /// Deletes rows whose bucket start is older than `cutoff`. Returns the
    /// number of rows removed.
    async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, MergeError>;
}

/// In-process store backed by a read/write lock. Readers see each row in its
/// pre-cycle or post-cycle state, never torn: the whole batch is applied
/// under one write guard.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    rows: RwLock<HashMap<RowKey, AggregateRow>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &RowKey) -> Option<AggregateRow> {
        self.rows.read().await.get(key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }

    /// All rows in key order, for reporting consumers and the CLI.
    pub async fn snapshot(&self) -> Vec<AggregateRow> {
        let rows = self.rows.read().await;
        let mut all: Vec<_> = rows.values().cloned().collect();
        all.sort_by(|a, b| a.key().cmp(&b.key()));
        all
    }
}

#[async_trait]
impl AggregateStore for InMemoryStore {
    async fn merge(&self, batch: Vec<StagedRow>) -> Result<u64, MergeError> {
        if batch.is_empty() {
            return Ok(0);
        }

        let now = Utc::now();
        let mut rows = self.rows.write().await;

        let affected = batch.len() as u64;
        for staged in batch {
            match rows.entry(staged.key()) {
                Entry::Occupied(mut occupied) => {
                    let row = occupied.get_mut();
                    row.counters.add(&staged.counters);
                    row.last_updated_at = now;
                }
                Entry::Vacant(vacant) => {
                    vacant.insert(AggregateRow {
                        stop_id: staged.stop_id,
                        bucket_start: staged.bucket.start,
                        bucket_width_minutes: staged.bucket.width_minutes,
                        counters: staged.counters,
                        last_updated_at: now,
                    });
                }
            }
        }

        debug!(rows = affected, "merge applied");
        Ok(affected)
    }

    async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, MergeError> {
        let mut rows = self.rows.write().await;
        let before = rows.len();
        rows.retain(|key, _| key.bucket_start >= cutoff);
        Ok((before - rows.len()) as u64)
    }
}
