//! Speed-based write throttle.
//!
//! Combines checkpoint buffer protection for pages already in the checkpoint
//! with [`SpeedBasedCleanPagesProtectionThrottle`] for everything else.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::buffer::CheckpointBufferProtectionThrottle;
use super::clean_pages::{calc_delay_time, SpeedBasedCleanPagesProtectionThrottle};
use super::parking::ParkedThreads;
use super::progress::CheckpointProgressProvider;
use super::{
    checkpoint_buffer_overflow, ParkTime, PagesWriteThrottlePolicy, ThrottledPageMemory,
    LOGGING_THRESHOLD,
};
use crate::options::ThrottleOptions;
use crate::primitives::measure::{monotonic_nanos, IntervalBasedMeasurement};

const MARK_SPEED_INTERVAL: Duration = Duration::from_millis(250);
const MARK_SPEED_INTERVALS: usize = 3;

/// Throttle that keeps page marking in step with checkpoint writes.
pub struct PagesWriteSpeedBasedThrottle {
    memory: Arc<dyn ThrottledPageMemory>,
    progress: Arc<dyn CheckpointProgressProvider>,
    parked: ParkedThreads,
    /// Pages marked per second over the last 750-1000 ms, and the average park time.
    speed_mark_and_avg_park_time: Arc<IntervalBasedMeasurement>,
    prev_warn_nanos: AtomicU64,
    cp_buffer: CheckpointBufferProtectionThrottle,
    clean_pages: SpeedBasedCleanPagesProtectionThrottle,
    cp_buffer_fill_threshold: f64,
    warn_threshold: f64,
    warn_min_delay_nanos: u64,
}

impl PagesWriteSpeedBasedThrottle {
    /// Creates a throttle with default options.
    pub fn new(memory: Arc<dyn ThrottledPageMemory>, progress: Arc<dyn CheckpointProgressProvider>) -> Self {
        Self::with_options(memory, progress, &ThrottleOptions::default())
    }

    /// Creates a throttle tuned by `options`.
    pub fn with_options(
        memory: Arc<dyn ThrottledPageMemory>,
        progress: Arc<dyn CheckpointProgressProvider>,
        options: &ThrottleOptions,
    ) -> Self {
        let speed_mark_and_avg_park_time = Arc::new(IntervalBasedMeasurement::new(
            MARK_SPEED_INTERVAL,
            MARK_SPEED_INTERVALS,
        ));
        let clean_pages = SpeedBasedCleanPagesProtectionThrottle::new(
            Arc::clone(&memory),
            Arc::clone(&progress),
            Arc::clone(&speed_mark_and_avg_park_time),
        );
        Self {
            memory,
            progress,
            parked: ParkedThreads::new(),
            speed_mark_and_avg_park_time,
            prev_warn_nanos: AtomicU64::new(0),
            cp_buffer: CheckpointBufferProtectionThrottle::new(
                options.starting_park_nanos,
                options.backoff_ratio,
            ),
            clean_pages,
            cp_buffer_fill_threshold: options.cp_buffer_fill_threshold,
            warn_threshold: options.warn_threshold,
            warn_min_delay_nanos: u64::try_from(options.warn_min_delay().as_nanos()).unwrap_or(u64::MAX),
        }
    }

    fn compute_park_time(&self, is_page_in_checkpoint: bool, now: u64) -> ParkTime {
        if is_page_in_checkpoint && self.should_throttle() {
            return ParkTime::Nanos(self.cp_buffer.compute_protection_park_time());
        }
        if is_page_in_checkpoint {
            self.cp_buffer.reset_backoff_counter();
        }
        self.clean_pages.compute_protection_park_time(now)
    }

    fn do_park(&self, nanos: u64) {
        if nanos > LOGGING_THRESHOLD.as_nanos() as u64 {
            warn!(
                thread = ?std::thread::current().name(),
                timeout_ms = nanos / 1_000_000,
                "throttle.park.long"
            );
        }
        self.parked.park(nanos);
    }

    fn recurrent_log_if_needed(&self) {
        let prev = self.prev_warn_nanos.load(Ordering::Acquire);
        let now = monotonic_nanos();
        if prev != 0 && now.saturating_sub(prev) <= self.warn_min_delay_nanos {
            return;
        }
        let weight = self.throttle_weight();
        if weight <= self.warn_threshold {
            return;
        }
        if self
            .prev_warn_nanos
            .compare_exchange(prev, now.max(1), Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let progress = self.progress.current().unwrap_or_default();
        warn!(
            weight,
            mark_dirty_speed = self.mark_dirty_speed(),
            cp_write_speed = self.cp_write_speed(),
            est_ideal_mark_dirty = self.last_estimated_speed_for_mark_all(),
            curr_dirty = self.curr_dirty_ratio(),
            target_dirty = self.target_dirty_ratio(),
            avg_park_time_ns = self.throttle_park_time(),
            total = progress.total_pages,
            evicted = progress.evicted_pages,
            written = progress.written_or_zero(),
            synced = progress.synced_pages,
            cp_buf_used = self.memory.checkpoint_buffer_pages_count(),
            cp_buf_total = self.memory.checkpoint_buffer_pages_size(),
            "throttle.pressure"
        );
    }

    /// Share of the per-page marking time spent parked, starting at 0.0.
    pub fn throttle_weight(&self) -> f64 {
        let speed = self.mark_dirty_speed();
        if speed == 0 {
            return 0.0;
        }
        let time_for_one_page = calc_delay_time(speed, self.clean_pages.thread_ids_count(), 1.0);
        if time_for_one_page == 0 {
            return 0.0;
        }
        self.throttle_park_time() as f64 / time_for_one_page as f64
    }

    /// Average park time in nanoseconds.
    pub fn throttle_park_time(&self) -> u64 {
        self.speed_mark_and_avg_park_time.average()
    }

    /// Pages marked dirty per second over the last 750-1000 ms.
    pub fn mark_dirty_speed(&self) -> u64 {
        self.speed_mark_and_avg_park_time.speed_ops_per_sec(monotonic_nanos())
    }

    /// Average checkpoint write speed in pages per second.
    pub fn cp_write_speed(&self) -> u64 {
        self.clean_pages.cp_write_speed()
    }

    /// Dirty ratio after which throttling starts.
    pub fn target_dirty_ratio(&self) -> f64 {
        self.clean_pages.target_dirty_ratio()
    }

    /// Dirty ratio seen by the last decision.
    pub fn curr_dirty_ratio(&self) -> f64 {
        self.clean_pages.curr_dirty_ratio()
    }

    /// Last estimate of the speed that dirties every clean page by checkpoint end.
    pub fn last_estimated_speed_for_mark_all(&self) -> u64 {
        self.clean_pages.last_estimated_speed_for_mark_all()
    }

    /// Threads parked right now.
    pub fn parked_threads_count(&self) -> usize {
        self.parked.len()
    }

    /// Clean pages estimator, exposed for diagnostics.
    pub fn clean_pages(&self) -> &SpeedBasedCleanPagesProtectionThrottle {
        &self.clean_pages
    }
}

impl PagesWriteThrottlePolicy for PagesWriteSpeedBasedThrottle {
    fn on_mark_dirty(&self, is_page_in_checkpoint: bool) -> ParkTime {
        let start = monotonic_nanos();
        let park_time = self.compute_park_time(is_page_in_checkpoint, start);
        let ParkTime::Nanos(nanos) = park_time else {
            return park_time;
        };
        if nanos > 0 {
            self.recurrent_log_if_needed();
            self.do_park(nanos);
        }
        let now = monotonic_nanos();
        self.memory
            .metrics()
            .add_throttling_time(now.saturating_sub(start) / 1_000_000);
        self.speed_mark_and_avg_park_time
            .add_measurement_for_average(nanos, now);
        park_time
    }

    fn on_begin_checkpoint(&self) {
        self.clean_pages.reset();
        debug!("throttle.checkpoint.begin");
    }

    fn on_finish_checkpoint(&self) {
        self.cp_buffer.reset_backoff_counter();
        self.clean_pages.close();
        self.speed_mark_and_avg_park_time.finish_interval(monotonic_nanos());
        let woken = self.parked.unpark_all();
        debug!(woken, "throttle.checkpoint.finish");
    }

    fn try_wakeup_throttled_threads(&self) {
        if !self.should_throttle() {
            self.cp_buffer.reset_backoff_counter();
            self.parked.unpark_all();
        }
    }

    fn should_throttle(&self) -> bool {
        checkpoint_buffer_overflow(self.memory.as_ref(), self.cp_buffer_fill_threshold)
    }
}

impl std::fmt::Debug for PagesWriteSpeedBasedThrottle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PagesWriteSpeedBasedThrottle")
            .field("parked", &self.parked)
            .field("clean_pages", &self.clean_pages)
            .finish()
    }
}
