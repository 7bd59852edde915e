//! Severity-ranked trip status and the pure classifier that derives it from
//! a single observation's delay and cancellation flag.

use serde::Serialize;

use crate::config::Thresholds;

/// Outcome of one trip at one stop within a bucket. The declaration order
/// defines the severity ranking used by the dedup ledger: a recorded status
/// is only ever replaced by a strictly higher one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TripStatus {
    Unknown,
    OnTime,
    Delayed,
    Cancelled,
}

impl TripStatus {
    pub fn rank(self) -> u8 {
        self as u8
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TripStatus::Unknown => "unknown",
            TripStatus::OnTime => "on_time",
            TripStatus::Delayed => "delayed",
            TripStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "unknown" => Some(TripStatus::Unknown),
            "on_time" => Some(TripStatus::OnTime),
            "delayed" => Some(TripStatus::Delayed),
            "cancelled" => Some(TripStatus::Cancelled),
            _ => None,
        }
    }
}

/// Maps a departure delay and cancellation flag to a status. Total over its
/// domain: a missing delay is treated as zero, and anything that is neither
/// clearly on time nor clearly delayed stays `Unknown`.
pub fn classify(delay_seconds: Option<i32>, cancelled: bool, thresholds: &Thresholds) -> TripStatus {
    if cancelled {
        return TripStatus::Cancelled;
    }

    let delay = delay_seconds.unwrap_or(0);
    if delay > thresholds.delayed_after_seconds {
        TripStatus::Delayed
    } else if delay.abs() < thresholds.on_time_within_seconds {
        TripStatus::OnTime
    } else {
        TripStatus::Unknown
    }
}
