//! Feed reading: fetch the envelope, decode it, and flatten trip-update
//! entities into typed [`Observation`]s.
//!
//! All raw wire-field handling happens here. Downstream stages only ever see
//! `Observation`; they never inspect optional protobuf fields.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use prost::Message;
use tracing::debug;

use crate::error::FetchError;
use crate::fetch::{self, HttpClient};
use crate::gtfs_rt::{FeedMessage, trip_descriptor, trip_update};

/// Schedule relationship of one stop-time update, decoded at the boundary.
/// A trip-level `CANCELED` is pushed down onto every stop of that trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleRelationship {
    Scheduled,
    Skipped,
    NoData,
    Canceled,
}

impl ScheduleRelationship {
    /// Skipped stops and cancelled trips both count as a cancellation for
    /// reliability purposes.
    pub fn is_cancellation(self) -> bool {
        matches!(
            self,
            ScheduleRelationship::Skipped | ScheduleRelationship::Canceled
        )
    }
}

/// One stop-level observation from a single fetch. Ephemeral: produced per
/// cycle, reduced by the ledger, never persisted directly.
#[derive(Debug, Clone)]
pub struct Observation {
    pub trip_id: String,
    pub route_id: Option<String>,
    pub stop_id: String,
    pub stop_sequence: u32,
    pub departure_delay_seconds: Option<i32>,
    pub schedule_relationship: ScheduleRelationship,
    pub feed_timestamp: DateTime<Utc>,
}

/// All observations flattened from one fetch, plus diagnostics counters.
#[derive(Debug, Default)]
pub struct FeedSnapshot {
    pub observations: Vec<Observation>,
    pub entity_count: usize,
    /// Entities or stop updates dropped for lacking a trip or stop id.
    pub skipped: usize,
}

/// Decodes a protobuf-encoded GTFS-RT [`FeedMessage`] from raw bytes.
pub fn parse_feed(bytes: &[u8]) -> Result<FeedMessage, FetchError> {
    Ok(FeedMessage::decode(bytes)?)
}

/// Flattens every trip-update entity's stop-time updates into observations.
///
/// Entities without a trip id and stop updates without a stop id are skipped
/// and counted in [`FeedSnapshot::skipped`]. The observation timestamp is the
/// trip update's, falling back to the feed header's, falling back to `now`.
pub fn flatten_feed(feed: &FeedMessage, now: DateTime<Utc>) -> FeedSnapshot {
    let header_time = feed
        .header
        .timestamp
        .and_then(|t| DateTime::from_timestamp(t as i64, 0));

    let mut snapshot = FeedSnapshot {
        entity_count: feed.entity.len(),
        ..Default::default()
    };

    for entity in &feed.entity {
        let Some(tu) = &entity.trip_update else {
            continue;
        };
        if entity.is_deleted() {
            continue;
        }

        let Some(trip_id) = tu.trip.trip_id.clone().filter(|id| !id.is_empty()) else {
            snapshot.skipped += 1;
            continue;
        };

        let trip_cancelled = tu.trip.schedule_relationship()
            == trip_descriptor::ScheduleRelationship::Canceled;
        let timestamp = tu
            .timestamp
            .and_then(|t| DateTime::from_timestamp(t as i64, 0))
            .or(header_time)
            .unwrap_or(now);

        for stu in &tu.stop_time_update {
            let Some(stop_id) = stu.stop_id.clone().filter(|id| !id.is_empty()) else {
                snapshot.skipped += 1;
                continue;
            };

            let relationship = if trip_cancelled {
                ScheduleRelationship::Canceled
            } else {
                match stu.schedule_relationship() {
                    trip_update::stop_time_update::ScheduleRelationship::Scheduled => {
                        ScheduleRelationship::Scheduled
                    }
                    trip_update::stop_time_update::ScheduleRelationship::Skipped => {
                        ScheduleRelationship::Skipped
                    }
                    trip_update::stop_time_update::ScheduleRelationship::NoData => {
                        ScheduleRelationship::NoData
                    }
                    trip_update::stop_time_update::ScheduleRelationship::Canceled => {
                        ScheduleRelationship::Canceled
                    }
                }
            };

            let delay = stu
                .departure
                .as_ref()
                .and_then(|e| e.delay)
                .or_else(|| stu.arrival.as_ref().and_then(|e| e.delay));

            snapshot.observations.push(Observation {
                trip_id: trip_id.clone(),
                route_id: tu.trip.route_id.clone(),
                stop_id,
                stop_sequence: stu.stop_sequence.unwrap_or(0),
                departure_delay_seconds: delay,
                schedule_relationship: relationship,
                feed_timestamp: timestamp,
            });
        }
    }

    snapshot
}

/// Source of per-cycle feed snapshots. Production reads over HTTP via
/// [`FeedReader`]; tests substitute a canned source.
#[async_trait]
pub trait FeedSource: Send + Sync {
    async fn read(&self) -> Result<FeedSnapshot, FetchError>;
}

/// Fetches and flattens the configured feed.
pub struct FeedReader<C> {
    client: C,
    url: String,
}

impl<C: HttpClient> FeedReader<C> {
    pub fn new(client: C, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl<C: HttpClient> FeedSource for FeedReader<C> {
    #[tracing::instrument(skip(self), fields(url = %self.url))]
    async fn read(&self) -> Result<FeedSnapshot, FetchError> {
        let bytes = fetch::fetch_bytes(&self.client, &self.url).await?;
        debug!(bytes = bytes.len(), "feed bytes received");

        let feed = parse_feed(&bytes)?;
        let snapshot = flatten_feed(&feed, Utc::now());
        debug!(
            entities = snapshot.entity_count,
            observations = snapshot.observations.len(),
            skipped = snapshot.skipped,
            "feed flattened"
        );
        Ok(snapshot)
    }
}
