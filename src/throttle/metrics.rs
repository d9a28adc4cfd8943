//! Throttling statistics reported by the write throttles.

use std::sync::atomic::{AtomicU64, Ordering};

/// Sink for page-memory throttling statistics.
///
/// The write throttle reports the wall time each `on_mark_dirty` call spent
/// deciding and parking, whether or not the thread was actually parked.
pub trait PageMemoryMetrics: Send + Sync {
    /// Records one throttling decision that took `millis` milliseconds.
    fn add_throttling_time(&self, millis: u64);
}

/// Discards everything.
#[derive(Default)]
pub struct NoopMetrics;

impl PageMemoryMetrics for NoopMetrics {
    fn add_throttling_time(&self, _millis: u64) {}
}

/// Atomic counters over throttling samples.
#[derive(Default)]
pub struct CounterMetrics {
    /// Sum of recorded throttling time in milliseconds.
    pub throttling_time_ms: AtomicU64,

    /// Number of recorded throttling decisions.
    pub throttled_events: AtomicU64,
}

impl CounterMetrics {
    /// Total recorded throttling time in milliseconds.
    pub fn total_throttling_time_ms(&self) -> u64 {
        self.throttling_time_ms.load(Ordering::Relaxed)
    }

    /// Number of recorded throttling decisions.
    pub fn events(&self) -> u64 {
        self.throttled_events.load(Ordering::Relaxed)
    }
}

impl PageMemoryMetrics for CounterMetrics {
    fn add_throttling_time(&self, millis: u64) {
        self.throttling_time_ms.fetch_add(millis, Ordering::Relaxed);
        self.throttled_events.fetch_add(1, Ordering::Relaxed);
    }
}
