//! Speed-based protection of clean pages.
//!
//! Estimates how fast threads may dirty pages so that clean pages do not run
//! out before the running checkpoint completes. Two limits apply:
//!
//! * once the dirty ratio exceeds a target that grows with checkpoint
//!   progress, marking may not outpace the speed at which the remaining clean
//!   pages would be used up exactly at checkpoint end;
//! * marking may not outpace the checkpoint write speed by more than a small
//!   allowance.
//!
//! The park time is the larger of the two delays.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::Mutex;

use super::progress::{CheckpointProgressProvider, CheckpointProgressSnapshot};
use super::{ParkTime, ThrottledPageMemory};
use crate::primitives::measure::{monotonic_nanos, IntervalBasedMeasurement};

/// Dirty ratio the throttle steers towards at checkpoint end.
pub const MAX_DIRTY_PAGES: f64 = 0.75;

/// Lowest initial dirty ratio used for the target interpolation.
pub const MIN_RATIO_NO_THROTTLE: f64 = 0.03;

/// f64 stored as bits.
#[derive(Debug)]
struct AtomicF64(AtomicU64);

impl AtomicF64 {
    fn new(value: f64) -> Self {
        Self(AtomicU64::new(value.to_bits()))
    }

    fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Acquire))
    }

    fn store(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Release);
    }
}

/// Delay for one page given `base_speed` pages/sec shared by `threads` threads.
///
/// `coefficient` slows down (>1) or speeds up (<1) the result; zero or negative
/// speeds and coefficients yield no delay.
pub fn calc_delay_time(base_speed: u64, threads: usize, coefficient: f64) -> u64 {
    if coefficient <= 0.0 || base_speed == 0 {
        return 0;
    }
    let one_page = 1_000_000_000u128 * threads as u128 / u128::from(base_speed);
    let delay = coefficient * one_page as f64;
    if delay >= u64::MAX as f64 {
        u64::MAX
    } else {
        delay as u64
    }
}

/// Clean pages protection for the speed-based throttle.
pub struct SpeedBasedCleanPagesProtectionThrottle {
    memory: Arc<dyn ThrottledPageMemory>,
    progress: Arc<dyn CheckpointProgressProvider>,
    /// Mark-dirty speed and average park time, shared with the owning throttle.
    speed_mark_and_avg_park_time: Arc<IntervalBasedMeasurement>,
    /// Fully completed pages per second of the current and last checkpoints.
    cp_write_speed: IntervalBasedMeasurement,
    /// Written pages when the checkpoint was first seen writing; 0 before that.
    last_observed_written: AtomicU64,
    init_dirty_ratio_at_cp_begin: AtomicF64,
    curr_dirty_ratio: AtomicF64,
    target_dirty_ratio: AtomicF64,
    speed_for_mark_all: AtomicU64,
    thread_ids: Mutex<HashSet<ThreadId>>,
}

impl SpeedBasedCleanPagesProtectionThrottle {
    /// Creates the estimator. `speed_mark_and_avg_park_time` is counted once per
    /// throttled mark-dirty call.
    pub fn new(
        memory: Arc<dyn ThrottledPageMemory>,
        progress: Arc<dyn CheckpointProgressProvider>,
        speed_mark_and_avg_park_time: Arc<IntervalBasedMeasurement>,
    ) -> Self {
        Self {
            memory,
            progress,
            speed_mark_and_avg_park_time,
            cp_write_speed: IntervalBasedMeasurement::manual(3),
            last_observed_written: AtomicU64::new(0),
            init_dirty_ratio_at_cp_begin: AtomicF64::new(MIN_RATIO_NO_THROTTLE),
            curr_dirty_ratio: AtomicF64::new(0.0),
            target_dirty_ratio: AtomicF64::new(0.0),
            speed_for_mark_all: AtomicU64::new(0),
            thread_ids: Mutex::new(HashSet::new()),
        }
    }

    /// Park time for the calling thread.
    ///
    /// [`ParkTime::NoThrottling`] while no checkpoint is writing pages.
    pub fn compute_protection_park_time(&self, now_nanos: u64) -> ParkTime {
        let Some(progress) = self.progress.current() else {
            return ParkTime::NoThrottling;
        };
        let Some(written) = progress.written_pages else {
            return ParkTime::NoThrottling;
        };
        self.thread_ids.lock().insert(thread::current().id());
        ParkTime::Nanos(self.compute_park_time(&progress, written, now_nanos))
    }

    fn compute_park_time(&self, progress: &CheckpointProgressSnapshot, written: u64, now: u64) -> u64 {
        let done_pages = cp_done_pages_estimation(written, progress.synced_pages);
        let mark_dirty_speed = self.speed_mark_and_avg_park_time.speed_ops_per_sec(now);
        self.speed_mark_and_avg_park_time.increment_counter(now);

        self.cp_write_speed.set_counter(done_pages, now);
        let cp_write_speed = self.cp_write_speed.speed_ops_per_sec(now);
        let threads = self.thread_ids_count();

        let cp_total_pages = progress.total_pages;
        if cp_total_pages == 0 {
            // Checkpoint scope unknown: only keep marking from outpacing writes.
            let throttle_by_cp_speed = cp_write_speed > 0 && mark_dirty_speed > cp_write_speed;
            return if throttle_by_cp_speed {
                calc_delay_time(cp_write_speed, threads, 1.0)
            } else {
                0
            };
        }

        let dirty_pages_ratio = self.memory.dirty_pages_ratio();
        self.curr_dirty_ratio.store(dirty_pages_ratio);
        self.detect_cp_pages_write_start(written, dirty_pages_ratio);

        if dirty_pages_ratio >= MAX_DIRTY_PAGES {
            // Too late to throttle; writers will block on page replacement instead.
            return 0;
        }
        let not_evicted_total = cp_total_pages.saturating_sub(progress.evicted_pages);
        self.get_park_time(
            dirty_pages_ratio,
            done_pages,
            not_evicted_total,
            threads,
            mark_dirty_speed,
            cp_write_speed,
        )
    }

    /// Core estimate.
    ///
    /// * `dirty_pages_ratio`: current dirty ratio.
    /// * `fully_completed_pages`: written and fsynced pages.
    /// * `cp_total_pages`: checkpoint scope minus evicted pages.
    /// * `threads`: threads that dirtied pages during this checkpoint.
    /// * `mark_dirty_speed` / `cp_write_speed`: pages per second.
    ///
    /// Returns nanoseconds to park, 0 for no throttling.
    pub fn get_park_time(
        &self,
        dirty_pages_ratio: f64,
        fully_completed_pages: u64,
        cp_total_pages: u64,
        threads: usize,
        mark_dirty_speed: u64,
        cp_write_speed: u64,
    ) -> u64 {
        let speed_for_mark_all = self.calc_speed_to_mark_all_space_till_end_of_cp(
            dirty_pages_ratio,
            fully_completed_pages,
            cp_write_speed,
            cp_total_pages,
        );
        let target_dirty_ratio = self.calc_target_dirty_ratio(fully_completed_pages, cp_total_pages);
        self.speed_for_mark_all.store(speed_for_mark_all, Ordering::Release);
        self.target_dirty_ratio.store(target_dirty_ratio);

        let low_space_left =
            dirty_pages_ratio > target_dirty_ratio && dirty_pages_ratio + 0.05 > MAX_DIRTY_PAGES;
        let slowdown = if low_space_left { 3.0 } else { 1.0 };
        let mark_all_multiplier = if low_space_left { 0.8 } else { 1.0 };

        let marking_too_fast = speed_for_mark_all > 0
            && mark_dirty_speed as f64 > mark_all_multiplier * speed_for_mark_all as f64;
        let throttle_by_size_and_mark_speed = dirty_pages_ratio > target_dirty_ratio && marking_too_fast;

        // When clean pages are plentiful, marking may run slightly ahead of checkpoint writes.
        let allow_write_faster_than_cp =
            if speed_for_mark_all > 0 && mark_dirty_speed > 0 && speed_for_mark_all > mark_dirty_speed {
                0.1 * speed_for_mark_all as f64 / mark_dirty_speed as f64
            } else if dirty_pages_ratio > target_dirty_ratio {
                0.0
            } else {
                0.1
            };
        let faster_than_cp_write_speed = if low_space_left {
            1.0
        } else {
            1.0 + allow_write_faster_than_cp
        };
        let throttle_by_cp_speed =
            cp_write_speed > 0 && mark_dirty_speed as f64 > faster_than_cp_write_speed * cp_write_speed as f64;

        let delay_by_cp_write = if throttle_by_cp_speed {
            calc_delay_time(cp_write_speed, threads, slowdown)
        } else {
            0
        };
        let delay_by_mark_all_write = if throttle_by_size_and_mark_speed {
            calc_delay_time(speed_for_mark_all, threads, slowdown)
        } else {
            0
        };
        delay_by_cp_write.max(delay_by_mark_all_write)
    }

    /// Pages/sec at which the remaining clean pages (up to [`MAX_DIRTY_PAGES`])
    /// would be dirtied exactly when the checkpoint completes.
    fn calc_speed_to_mark_all_space_till_end_of_cp(
        &self,
        dirty_pages_ratio: f64,
        done_pages: u64,
        avg_cp_write_speed: u64,
        cp_total_pages: u64,
    ) -> u64 {
        if avg_cp_write_speed == 0 || cp_total_pages == 0 || dirty_pages_ratio >= MAX_DIRTY_PAGES {
            return 0;
        }
        let remained_clear = (MAX_DIRTY_PAGES - dirty_pages_ratio) * self.memory.total_pages() as f64;
        let remaining_pages = cp_total_pages.saturating_sub(done_pages);
        if remaining_pages == 0 {
            return u64::MAX;
        }
        let time_remained_secs = remaining_pages as f64 / avg_cp_write_speed as f64;
        let speed = remained_clear / time_remained_secs;
        if speed >= u64::MAX as f64 {
            u64::MAX
        } else {
            speed as u64
        }
    }

    /// Dirty ratio target interpolated from the ratio at write start up to
    /// [`MAX_DIRTY_PAGES`] by checkpoint progress.
    fn calc_target_dirty_ratio(&self, done_pages: u64, cp_total_pages: u64) -> f64 {
        let cp_progress = if cp_total_pages == 0 {
            0.0
        } else {
            done_pages as f64 / cp_total_pages as f64
        };
        let const_start = self.init_dirty_ratio_at_cp_begin.load();
        let throttle_total_weight = 1.0 - const_start;
        (cp_progress * throttle_total_weight + const_start) * MAX_DIRTY_PAGES
    }

    fn detect_cp_pages_write_start(&self, written: u64, dirty_pages_ratio: f64) {
        if written > 0
            && self
                .last_observed_written
                .compare_exchange(0, written, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            let new_min_ratio = dirty_pages_ratio.clamp(MIN_RATIO_NO_THROTTLE, 1.0);
            self.init_dirty_ratio_at_cp_begin.store(new_min_ratio);
        }
    }

    /// Resets per-checkpoint state. Called when a checkpoint begins.
    pub fn reset(&self) {
        self.cp_write_speed.reset_counter(0, monotonic_nanos());
        self.init_dirty_ratio_at_cp_begin.store(MIN_RATIO_NO_THROTTLE);
        self.last_observed_written.store(0, Ordering::Release);
    }

    /// Closes the checkpoint write speed interval and forgets writer threads.
    pub fn close(&self) {
        self.cp_write_speed.finish_interval(monotonic_nanos());
        self.thread_ids.lock().clear();
    }

    /// Threads that dirtied pages during the current checkpoint.
    pub fn thread_ids_count(&self) -> usize {
        self.thread_ids.lock().len()
    }

    /// Average checkpoint write speed, pages per second.
    pub fn cp_write_speed(&self) -> u64 {
        self.cp_write_speed.speed_ops_per_sec(monotonic_nanos())
    }

    /// Last computed speed for marking every clean page by checkpoint end.
    pub fn last_estimated_speed_for_mark_all(&self) -> u64 {
        self.speed_for_mark_all.load(Ordering::Acquire)
    }

    /// Dirty ratio above which throttling starts.
    pub fn target_dirty_ratio(&self) -> f64 {
        self.target_dirty_ratio.load()
    }

    /// Dirty ratio seen by the last computation.
    pub fn curr_dirty_ratio(&self) -> f64 {
        self.curr_dirty_ratio.load()
    }

    /// Dirty ratio captured when the checkpoint started writing pages.
    pub fn init_dirty_ratio(&self) -> f64 {
        self.init_dirty_ratio_at_cp_begin.load()
    }
}

impl std::fmt::Debug for SpeedBasedCleanPagesProtectionThrottle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpeedBasedCleanPagesProtectionThrottle")
            .field("target_dirty_ratio", &self.target_dirty_ratio())
            .field("curr_dirty_ratio", &self.curr_dirty_ratio())
            .field("speed_for_mark_all", &self.last_estimated_speed_for_mark_all())
            .field("threads", &self.thread_ids_count())
            .finish()
    }
}

/// Written and fsynced pages are both needed before a page is truly done.
fn cp_done_pages_estimation(written: u64, synced: u64) -> u64 {
    (written + synced) / 2
}
