use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

/// Decides when the disk partition may be merged down.
pub trait OptimizeScheduler: Send + Sync {
    /// Called after each successful flush with the number of flushes
    /// since the last optimize pass and the current segment count.
    fn optimize_due(&self, flushes_since_optimize: u64, segment_count: usize) -> bool;

    /// Record that an optimize pass completed.
    fn mark_optimized(&self);

    /// Wall-clock millis of the last optimize pass; 0 when none ran yet.
    fn last_optimize_time_ms(&self) -> u64;
}

/// Optimize every N flushes, throttled to a minimum interval between
/// passes.
pub struct DefaultOptimizeScheduler {
    every_flushes: u64,
    min_interval: Duration,
    last_instant: Mutex<Option<Instant>>,
    last_wall_ms: AtomicU64,
}

impl DefaultOptimizeScheduler {
    pub fn new() -> Self {
        Self {
            every_flushes: 8,
            min_interval: Duration::from_secs(60),
            last_instant: Mutex::new(None),
            last_wall_ms: AtomicU64::new(0),
        }
    }

    pub fn with_every_flushes(mut self, every_flushes: u64) -> Self {
        self.every_flushes = every_flushes.max(1);
        self
    }

    pub fn with_min_interval(mut self, min_interval: Duration) -> Self {
        self.min_interval = min_interval;
        self
    }
}

impl Default for DefaultOptimizeScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl OptimizeScheduler for DefaultOptimizeScheduler {
    fn optimize_due(&self, flushes_since_optimize: u64, _segment_count: usize) -> bool {
        if flushes_since_optimize < self.every_flushes {
            return false;
        }
        match *self.last_instant.lock() {
            Some(last) => last.elapsed() >= self.min_interval,
            None => true,
        }
    }

    fn mark_optimized(&self) {
        *self.last_instant.lock() = Some(Instant::now());
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        self.last_wall_ms.store(wall, Ordering::Release);
    }

    fn last_optimize_time_ms(&self) -> u64 {
        self.last_wall_ms.load(Ordering::Acquire)
    }
}
