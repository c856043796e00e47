//! Utility functions
//!
//! Common helper functions used throughout the project.

use std::time::Duration;

/// Number of hardware threads, falling back to 4 when it cannot be determined.
pub fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Format a duration into (minutes, seconds) tuple
///
/// Useful for printing elapsed time in human-readable format.
#[inline]
pub fn format_duration(dur: Duration) -> (u64, u64) {
    let secs = dur.as_secs();
    (secs / 60, secs % 60)
}

/// Format duration as a human-readable string
#[inline]
pub fn format_duration_verbose(dur: Duration) -> String {
    let secs = dur.as_secs();
    if secs >= 60 {
        format!("{} min {} sec", secs / 60, secs % 60)
    } else {
        format!("{:.1} sec", dur.as_secs_f64())
    }
}

/// Items per second, or 0 for an empty interval.
#[inline]
pub fn rate_per_sec(count: u64, dur: Duration) -> f64 {
    let secs = dur.as_secs_f64();
    if secs > 0.0 { count as f64 / secs } else { 0.0 }
}
