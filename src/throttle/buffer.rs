//! Checkpoint buffer protection.

use crate::primitives::backoff::ExponentialBackoff;

/// First park time. Caps the write rate at roughly 1000 MB/s.
pub const STARTING_THROTTLE_NANOS: u64 = 4_000;

/// Each consecutive park is this many times longer.
pub const BACKOFF_RATIO: f64 = 1.05;

/// Exponentially growing park times for threads that dirty pages while the
/// checkpoint buffer is nearly full.
#[derive(Debug)]
pub struct CheckpointBufferProtectionThrottle {
    backoff: ExponentialBackoff,
}

impl Default for CheckpointBufferProtectionThrottle {
    fn default() -> Self {
        Self::new(STARTING_THROTTLE_NANOS, BACKOFF_RATIO)
    }
}

impl CheckpointBufferProtectionThrottle {
    /// Creates a throttle with a custom backoff.
    pub fn new(starting_nanos: u64, ratio: f64) -> Self {
        Self {
            backoff: ExponentialBackoff::new(starting_nanos, ratio),
        }
    }

    /// Next park time in nanoseconds.
    pub fn compute_protection_park_time(&self) -> u64 {
        self.backoff.next_duration()
    }

    /// Called once the buffer is no longer under pressure. Returns true if throttling had started.
    pub fn reset_backoff_counter(&self) -> bool {
        self.backoff.reset()
    }
}
