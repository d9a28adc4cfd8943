#![forbid(unsafe_code)]
//! Exponentially growing delays for threads that keep hitting the same backpressure.

use std::sync::atomic::{AtomicU32, Ordering};

/// Produces `starting * ratio^n` on the n-th call since the last reset.
///
/// The attempt counter is atomic, so a single instance can be shared by every
/// thread throttled on the same condition.
#[derive(Debug)]
pub struct ExponentialBackoff {
    starting_nanos: u64,
    ratio: f64,
    attempts: AtomicU32,
}

impl ExponentialBackoff {
    /// Creates a backoff starting at `starting_nanos` and growing by `ratio` per call.
    pub fn new(starting_nanos: u64, ratio: f64) -> Self {
        debug_assert!(ratio >= 1.0, "backoff ratio must not shrink delays");
        Self {
            starting_nanos,
            ratio,
            attempts: AtomicU32::new(0),
        }
    }

    /// Returns the current delay in nanoseconds and advances to the next one.
    pub fn next_duration(&self) -> u64 {
        let exponent = self.attempts.fetch_add(1, Ordering::AcqRel);
        let delay = self.starting_nanos as f64 * self.ratio.powi(exponent.min(i32::MAX as u32) as i32);
        if delay >= u64::MAX as f64 {
            u64::MAX
        } else {
            delay as u64
        }
    }

    /// Restores the starting delay. Returns true if any delay was handed out since the last reset.
    pub fn reset(&self) -> bool {
        self.attempts.swap(0, Ordering::AcqRel) != 0
    }

    /// Delay returned by the first call after a reset.
    pub fn starting_nanos(&self) -> u64 {
        self.starting_nanos
    }
}
