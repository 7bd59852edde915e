//! Operational controls for the harvester.
//!
//! Everything here is a read-only input to the pipeline: the feed URL, the
//! harvest cadence, the classification thresholds, and the retention horizon.

use std::time::Duration as StdDuration;

use chrono::Duration;
use clap::Args;

/// Thresholds used by the status classifier.
#[derive(Debug, Clone, Copy)]
pub struct Thresholds {
    /// A departure later than this many seconds counts as delayed.
    pub delayed_after_seconds: i32,
    /// A departure within this many seconds of schedule counts as on time.
    pub on_time_within_seconds: i32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            delayed_after_seconds: 300,
            on_time_within_seconds: 60,
        }
    }
}

/// Full harvester configuration, parseable straight from the CLI.
#[derive(Debug, Clone, Args)]
pub struct HarvestConfig {
    /// GTFS-RT trip-update feed URL
    #[arg(long, env = "FEED_URL")]
    pub feed_url: String,

    /// Seconds between harvest cycles
    #[arg(long, default_value_t = 300)]
    pub interval_secs: u64,

    /// Aggregation bucket width in minutes
    #[arg(long, default_value_t = 60)]
    pub bucket_minutes: u32,

    /// Delay in seconds beyond which a trip counts as delayed
    #[arg(long, default_value_t = 300)]
    pub delayed_after_seconds: i32,

    /// Delay in seconds within which a trip counts as on time
    #[arg(long, default_value_t = 60)]
    pub on_time_within_seconds: i32,

    /// Days of aggregate history to keep
    #[arg(long, default_value_t = 90)]
    pub retention_days: u32,

    /// Seconds between retention sweeps
    #[arg(long, default_value_t = 86_400)]
    pub retention_interval_secs: u64,
}

impl HarvestConfig {
    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            delayed_after_seconds: self.delayed_after_seconds,
            on_time_within_seconds: self.on_time_within_seconds,
        }
    }

    /// Ledger entries must outlive the bucket they guard; twice the bucket
    /// width lets a bucket close before its entries expire.
    pub fn ledger_ttl(&self) -> StdDuration {
        StdDuration::from_secs(u64::from(self.bucket_minutes) * 120)
    }

    pub fn retention_horizon(&self) -> Duration {
        Duration::days(i64::from(self.retention_days))
    }
}
