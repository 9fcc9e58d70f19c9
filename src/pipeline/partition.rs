// src/pipeline/partition.rs

//! Work partitioning.
//!
//! Splits the overall collection range into one time window per worker,
//! or a discovered-user list into one contiguous share per worker. All
//! window arithmetic is done in whole milliseconds so the same inputs
//! always produce the same boundaries.

use chrono::{DateTime, Duration, Utc};

use crate::error::{AppError, Result};
use crate::models::{PartitionConfig, PartitionStrategy, TimeWindow};

/// Split `[overall_start, overall_end)` into `workers` windows.
pub fn partition_windows(
    overall_start: DateTime<Utc>,
    overall_end: DateTime<Utc>,
    workers: usize,
    config: &PartitionConfig,
) -> Result<Vec<TimeWindow>> {
    if workers < 1 {
        return Err(AppError::config("worker count must be at least 1"));
    }
    if overall_start >= overall_end {
        return Err(AppError::config(format!(
            "collection range is empty: {overall_start} >= {overall_end}"
        )));
    }

    match config.strategy {
        PartitionStrategy::Equal => Ok(equal_windows(overall_start, overall_end, workers)),
        PartitionStrategy::Weighted => Ok(weighted_windows(overall_start, overall_end, workers)),
        PartitionStrategy::Overlap => Ok(overlap_windows(
            overall_start,
            overall_end,
            workers,
            config.overlap_percent,
        )),
        PartitionStrategy::Custom => custom_windows(config, workers),
    }
}

/// Split `handles` into `workers` contiguous shares in listed order,
/// sized as evenly as the remainder allows (earlier shares take the
/// extra handle). More workers than handles leaves the surplus shares
/// empty.
pub fn partition_users(handles: &[String], workers: usize) -> Result<Vec<Vec<String>>> {
    if workers < 1 {
        return Err(AppError::config("worker count must be at least 1"));
    }
    if handles.is_empty() {
        return Err(AppError::config("no users to partition"));
    }

    let base = handles.len() / workers;
    let extra = handles.len() % workers;
    let mut shares = Vec::with_capacity(workers);
    let mut offset = 0;
    for i in 0..workers {
        let take = base + usize::from(i < extra);
        shares.push(handles[offset..offset + take].to_vec());
        offset += take;
    }
    Ok(shares)
}

/// Chronologically ordered equal-length boundaries; the last boundary is
/// pinned to `end` so rounding never loses the tail.
fn equal_boundaries(start: DateTime<Utc>, end: DateTime<Utc>, workers: usize) -> Vec<DateTime<Utc>> {
    let total_ms = (end - start).num_milliseconds();
    let mut boundaries = Vec::with_capacity(workers + 1);
    for i in 0..=workers {
        if i == workers {
            boundaries.push(end);
        } else {
            let offset = total_ms * i as i64 / workers as i64;
            boundaries.push(start + Duration::milliseconds(offset));
        }
    }
    boundaries
}

fn equal_windows(start: DateTime<Utc>, end: DateTime<Utc>, workers: usize) -> Vec<TimeWindow> {
    let boundaries = equal_boundaries(start, end, workers);
    boundaries
        .windows(2)
        .enumerate()
        .map(|(i, pair)| TimeWindow::new(pair[0], pair[1], i))
        .collect()
}

/// Geometric weighting: data density is assumed higher near the recent
/// end, so the oldest window is the widest and each later window shrinks
/// by the base factor, targeting roughly equal item counts per worker.
fn weighted_windows(start: DateTime<Utc>, end: DateTime<Utc>, workers: usize) -> Vec<TimeWindow> {
    const BASE: f64 = 2.0;

    let weights: Vec<f64> = (0..workers)
        .map(|i| BASE.powi((workers - 1 - i) as i32))
        .collect();
    let total_weight: f64 = weights.iter().sum();
    let total_ms = (end - start).num_milliseconds() as f64;

    let mut windows = Vec::with_capacity(workers);
    let mut cumulative = 0.0;
    let mut window_start = start;
    for (i, weight) in weights.iter().enumerate() {
        cumulative += weight;
        let window_end = if i == workers - 1 {
            end
        } else {
            let offset = (total_ms * cumulative / total_weight).round() as i64;
            start + Duration::milliseconds(offset)
        };
        windows.push(TimeWindow::new(window_start, window_end, i));
        window_start = window_end;
    }
    windows
}

/// Equal windows widened into each internal neighbor by half the overlap
/// fraction of one window length, so adjacent windows share a seam of
/// `overlap_percent% × window_length` centered on the original boundary.
fn overlap_windows(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    workers: usize,
    overlap_percent: u8,
) -> Vec<TimeWindow> {
    let boundaries = equal_boundaries(start, end, workers);
    let window_ms = (end - start).num_milliseconds() / workers as i64;
    let half_overlap = Duration::milliseconds(
        (window_ms as f64 * overlap_percent.min(50) as f64 / 100.0 / 2.0).round() as i64,
    );

    boundaries
        .windows(2)
        .enumerate()
        .map(|(i, pair)| {
            let window_start = if i > 0 { pair[0] - half_overlap } else { pair[0] };
            let window_end = if i < workers - 1 {
                pair[1] + half_overlap
            } else {
                pair[1]
            };
            TimeWindow::new(window_start, window_end, i)
        })
        .collect()
}

/// Caller-supplied windows, passed through verbatim after a count check.
fn custom_windows(config: &PartitionConfig, workers: usize) -> Result<Vec<TimeWindow>> {
    if config.custom_windows.len() != workers {
        return Err(AppError::config(format!(
            "custom strategy needs exactly {} windows, got {}",
            workers,
            config.custom_windows.len()
        )));
    }
    Ok(config
        .custom_windows
        .iter()
        .enumerate()
        .map(|(i, w)| TimeWindow::new(w.start, w.end, i))
        .collect())
}
