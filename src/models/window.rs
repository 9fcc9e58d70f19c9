// src/models/window.rs

//! Time window types for partitioned collection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Strategy used to split the overall range across workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PartitionStrategy {
    /// Equal-length, non-overlapping, contiguous windows.
    Equal,
    /// Narrower windows for more recent periods, targeting roughly equal
    /// item counts per worker.
    #[default]
    Weighted,
    /// Equal windows widened at internal boundaries so adjacent workers
    /// share a seam; the merger dedups the seam.
    Overlap,
    /// Caller-supplied windows, validated for count only.
    Custom,
}

impl PartitionStrategy {
    /// Label recorded in result metadata.
    pub fn as_str(&self) -> &'static str {
        match self {
            PartitionStrategy::Equal => "equal",
            PartitionStrategy::Weighted => "weighted",
            PartitionStrategy::Overlap => "overlap",
            PartitionStrategy::Custom => "custom",
        }
    }
}

/// A `[start, end)` slice of the collection range assigned to one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub worker_index: usize,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>, worker_index: usize) -> Self {
        Self {
            start,
            end,
            worker_index,
        }
    }

    /// Half-open containment check, used to filter feed items client-side
    /// when the API endpoint has no time filters.
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts < self.end
    }

    /// RFC 3339 start bound for API `since` parameters.
    pub fn since_param(&self) -> String {
        self.start.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
    }

    /// RFC 3339 end bound for API `until` parameters.
    pub fn until_param(&self) -> String {
        self.end.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn contains_is_half_open() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 1, 6, 0, 0, 0).unwrap();
        let window = TimeWindow::new(start, end, 0);

        assert!(window.contains(start));
        assert!(window.contains(end - chrono::Duration::seconds(1)));
        assert!(!window.contains(end));
    }

    #[test]
    fn params_are_rfc3339_z() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let window = TimeWindow::new(start, start + chrono::Duration::days(1), 0);
        assert_eq!(window.since_param(), "2024-01-01T00:00:00Z");
    }
}
