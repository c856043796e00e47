//! Progress reporting for work slicing.
//!
//! Workers do not push progress on every iteration. Each worker owns an
//! [`AdaptiveSampler`] that decides when to push and retunes its own interval from the
//! wall-clock gap between pushes, keeping callback overhead low on fast loops without
//! going quiet on slow ones.

use log::info;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

/// Destination for progress values pushed by pool workers.
pub trait ProgressSink: Send + Sync {
    /// Current progress value.
    fn value(&self) -> i64;

    /// Set the progress value. Called concurrently from several workers.
    fn set_value_thread_safe(&self, value: i64);
}

/// A progress sink that just stores the latest value.
#[derive(Debug, Default)]
pub struct AtomicProgress {
    value: AtomicI64,
}

impl AtomicProgress {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProgressSink for AtomicProgress {
    fn value(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    fn set_value_thread_safe(&self, value: i64) {
        // Pushes from different workers may arrive out of order; keep the maximum.
        self.value.fetch_max(value, Ordering::Relaxed);
    }
}

/// A progress sink that logs whenever the value crosses a multiple of `interval`.
pub struct LoggingProgress {
    message: String,
    interval: i64,
    total: Option<i64>,
    value: AtomicI64,
}

impl LoggingProgress {
    /// Create a sink with a default interval of 10,000.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), interval: 10_000, total: None, value: AtomicI64::new(0) }
    }

    #[must_use]
    pub fn with_interval(mut self, interval: i64) -> Self {
        self.interval = interval.max(1);
        self
    }

    /// Include the expected total in log lines.
    #[must_use]
    pub fn with_total(mut self, total: i64) -> Self {
        self.total = Some(total);
        self
    }
}

impl ProgressSink for LoggingProgress {
    fn value(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    fn set_value_thread_safe(&self, value: i64) {
        let prev = self.value.fetch_max(value, Ordering::Relaxed);
        if value / self.interval > prev / self.interval {
            match self.total {
                Some(total) => info!("{} {}/{}", self.message, value, total),
                None => info!("{} {}", self.message, value),
            }
        }
    }
}

/// Largest sampling interval a worker will use.
pub const MAX_SAMPLE_MODULO: u32 = (i32::MAX / 2) as u32;

/// Gap above which the sampling interval shrinks.
pub const SLOW_PUSH_GAP: Duration = Duration::from_secs(3);

/// Gap below which the sampling interval grows.
pub const FAST_PUSH_GAP: Duration = Duration::from_millis(500);

/// Per-worker rate limiter deciding which iterations push progress.
#[derive(Debug)]
pub struct AdaptiveSampler {
    modulo: u32,
    since_push: u32,
    last_push: Instant,
}

impl AdaptiveSampler {
    #[must_use]
    pub fn new() -> Self {
        Self { modulo: 1, since_push: 0, last_push: Instant::now() }
    }

    /// Current number of iterations between pushes.
    #[must_use]
    pub fn modulo(&self) -> u32 {
        self.modulo
    }

    /// Count one finished iteration; returns true when the caller should push progress.
    pub fn tick(&mut self) -> bool {
        self.since_push += 1;
        if self.since_push < self.modulo {
            return false;
        }
        self.since_push = 0;
        let now = Instant::now();
        self.retune(now.duration_since(self.last_push));
        self.last_push = now;
        true
    }

    /// Adjust the interval from the gap since the previous push.
    pub fn retune(&mut self, gap: Duration) {
        let modulo = u64::from(self.modulo);
        let next = if gap > SLOW_PUSH_GAP {
            modulo * 7 / 10
        } else if gap < FAST_PUSH_GAP {
            (modulo * 13 / 10).max(modulo + 1)
        } else {
            modulo
        };
        self.modulo = next.clamp(1, u64::from(MAX_SAMPLE_MODULO)) as u32;
    }
}

impl Default for AdaptiveSampler {
    fn default() -> Self {
        Self::new()
    }
}
