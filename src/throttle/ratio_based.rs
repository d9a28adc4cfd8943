//! Target-ratio write throttle.
//!
//! Pages outside the checkpoint are throttled once the dirty page ratio exceeds
//! a threshold that grows from `0.05 * 7/12` to `7/12` as the checkpoint
//! writes its pages, and to `3/4` once every page has been written.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use super::parking::ParkedThreads;
use super::progress::CheckpointProgressProvider;
use super::{
    checkpoint_buffer_overflow, ParkTime, PagesWriteThrottlePolicy, ThrottledPageMemory,
    LOGGING_THRESHOLD,
};
use crate::options::ThrottleOptions;
use crate::primitives::backoff::ExponentialBackoff;
use crate::primitives::measure::monotonic_nanos;

/// Dirty ratio limit while the checkpoint fsyncs already written pages.
pub const FSYNC_STAGE_DIRTY_RATIO: f64 = 3.0 / 4.0;

/// Dirty ratio limit reached at the end of page writing.
pub const MAX_WRITE_STAGE_DIRTY_RATIO: f64 = 7.0 / 12.0;

/// Dirty ratio threshold for a checkpoint that has written `written` of `total` pages.
pub fn dirty_ratio_threshold(written: u64, total: u64) -> f64 {
    if written >= total {
        return FSYNC_STAGE_DIRTY_RATIO;
    }
    let progress = written as f64 / total as f64;
    // Starts at 0.05 so writers are not throttled right after checkpoint start.
    (progress * 0.95 + 0.05) * MAX_WRITE_STAGE_DIRTY_RATIO
}

/// Throttle driven by checkpoint buffer occupancy and the dirty page ratio.
pub struct PagesWriteThrottle {
    memory: Arc<dyn ThrottledPageMemory>,
    progress: Arc<dyn CheckpointProgressProvider>,
    /// Only pages already in the checkpoint are ever throttled.
    throttle_only_pages_in_checkpoint: bool,
    in_checkpoint_backoff: ExponentialBackoff,
    not_in_checkpoint_backoff: ExponentialBackoff,
    /// Threads parked on checkpoint buffer pressure.
    parked: ParkedThreads,
    cp_buffer_fill_threshold: f64,
}

impl PagesWriteThrottle {
    /// Creates a throttle with default options.
    pub fn new(
        memory: Arc<dyn ThrottledPageMemory>,
        progress: Arc<dyn CheckpointProgressProvider>,
        throttle_only_pages_in_checkpoint: bool,
    ) -> Self {
        Self::with_options(
            memory,
            progress,
            throttle_only_pages_in_checkpoint,
            &ThrottleOptions::default(),
        )
    }

    /// Creates a throttle tuned by `options`.
    pub fn with_options(
        memory: Arc<dyn ThrottledPageMemory>,
        progress: Arc<dyn CheckpointProgressProvider>,
        throttle_only_pages_in_checkpoint: bool,
        options: &ThrottleOptions,
    ) -> Self {
        Self {
            memory,
            progress,
            throttle_only_pages_in_checkpoint,
            in_checkpoint_backoff: ExponentialBackoff::new(options.starting_park_nanos, options.backoff_ratio),
            not_in_checkpoint_backoff: ExponentialBackoff::new(
                options.starting_park_nanos,
                options.backoff_ratio,
            ),
            parked: ParkedThreads::new(),
            cp_buffer_fill_threshold: options.cp_buffer_fill_threshold,
        }
    }

    /// True if only in-checkpoint pages are throttled.
    pub fn throttles_only_pages_in_checkpoint(&self) -> bool {
        self.throttle_only_pages_in_checkpoint
    }

    /// Threads parked on checkpoint buffer pressure right now.
    pub fn parked_threads_count(&self) -> usize {
        self.parked.len()
    }

    /// `None` when no checkpoint is writing pages, which disables throttling.
    fn dirty_ratio_exceeded(&self) -> Option<bool> {
        let progress = self.progress.current()?;
        let written = progress.written_pages?;
        let threshold = dirty_ratio_threshold(written, progress.total_pages);
        Some(self.memory.dirty_pages_ratio() > threshold)
    }

    fn park(&self, is_page_in_checkpoint: bool, nanos: u64) {
        if nanos > LOGGING_THRESHOLD.as_nanos() as u64 {
            warn!(
                thread = ?thread::current().name(),
                timeout_ms = nanos / 1_000_000,
                "throttle.park.long"
            );
        }
        if is_page_in_checkpoint {
            self.parked.park(nanos);
        } else {
            thread::sleep(Duration::from_nanos(nanos));
        }
    }
}

impl PagesWriteThrottlePolicy for PagesWriteThrottle {
    fn on_mark_dirty(&self, is_page_in_checkpoint: bool) -> ParkTime {
        let mut throttle = is_page_in_checkpoint && self.should_throttle();
        if !throttle && !self.throttle_only_pages_in_checkpoint {
            match self.dirty_ratio_exceeded() {
                Some(exceeded) => throttle = exceeded,
                None => return ParkTime::NoThrottling,
            }
        }

        let backoff = if is_page_in_checkpoint {
            &self.in_checkpoint_backoff
        } else {
            &self.not_in_checkpoint_backoff
        };
        if !throttle {
            let backoff_was_started = backoff.reset();
            if is_page_in_checkpoint && backoff_was_started {
                self.parked.unpark_all();
            }
            return ParkTime::Nanos(0);
        }

        let start = monotonic_nanos();
        let nanos = backoff.next_duration();
        self.park(is_page_in_checkpoint, nanos);
        self.memory
            .metrics()
            .add_throttling_time(monotonic_nanos().saturating_sub(start) / 1_000_000);
        ParkTime::Nanos(nanos)
    }

    fn on_begin_checkpoint(&self) {}

    fn on_finish_checkpoint(&self) {
        self.in_checkpoint_backoff.reset();
        self.not_in_checkpoint_backoff.reset();
        let woken = self.parked.unpark_all();
        debug!(woken, "throttle.checkpoint.finish");
    }

    fn try_wakeup_throttled_threads(&self) {
        if !self.should_throttle() {
            self.in_checkpoint_backoff.reset();
            self.parked.unpark_all();
        }
    }

    fn should_throttle(&self) -> bool {
        checkpoint_buffer_overflow(self.memory.as_ref(), self.cp_buffer_fill_threshold)
    }
}

impl std::fmt::Debug for PagesWriteThrottle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PagesWriteThrottle")
            .field("throttle_only_pages_in_checkpoint", &self.throttle_only_pages_in_checkpoint)
            .field("parked", &self.parked)
            .finish()
    }
}
