//! Write throttling of page-dirtying threads during checkpoints.
//!
//! Every thread about to dirty a page calls
//! [`PagesWriteThrottlePolicy::on_mark_dirty`]. The policy may park the thread
//! to keep the checkpoint buffer from overflowing and to keep the dirty page
//! ratio below its limit until the running checkpoint finishes.

pub mod buffer;
pub mod clean_pages;
pub mod metrics;
pub mod parking;
pub mod progress;
pub mod ratio_based;
pub mod speed_based;

use std::sync::Arc;
use std::time::Duration;

pub use buffer::CheckpointBufferProtectionThrottle;
pub use clean_pages::SpeedBasedCleanPagesProtectionThrottle;
pub use metrics::{CounterMetrics, NoopMetrics, PageMemoryMetrics};
pub use parking::ParkedThreads;
pub use progress::{AtomicCheckpointProgress, CheckpointProgressProvider, CheckpointProgressSnapshot};
pub use ratio_based::PagesWriteThrottle;
pub use speed_based::PagesWriteSpeedBasedThrottle;

use crate::options::{ThrottleOptions, ThrottlingPolicy};

/// Checkpoint buffer occupancy above which in-checkpoint pages are throttled.
pub const CP_BUF_FILL_THRESHOLD: f64 = 2.0 / 3.0;

/// Parks longer than this are logged.
pub const LOGGING_THRESHOLD: Duration = Duration::from_secs(10);

/// Outcome of one throttling decision.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ParkTime {
    /// Throttling does not apply right now; no statistics were recorded.
    NoThrottling,
    /// Park for this many nanoseconds. Zero means "measured, but no park needed".
    Nanos(u64),
}

impl ParkTime {
    /// Park duration, zero for [`ParkTime::NoThrottling`].
    pub fn duration(self) -> Duration {
        match self {
            ParkTime::NoThrottling => Duration::ZERO,
            ParkTime::Nanos(nanos) => Duration::from_nanos(nanos),
        }
    }

    /// True if the caller was, or should be, parked.
    pub fn is_parked(self) -> bool {
        matches!(self, ParkTime::Nanos(nanos) if nanos > 0)
    }
}

/// Page memory as seen by the throttle.
pub trait ThrottledPageMemory: Send + Sync {
    /// Pages currently held in the checkpoint buffer.
    fn checkpoint_buffer_pages_count(&self) -> u64;

    /// Capacity of the checkpoint buffer in pages.
    fn checkpoint_buffer_pages_size(&self) -> u64;

    /// Dirty pages divided by total pages.
    fn dirty_pages_ratio(&self) -> f64;

    /// Total pages in page memory.
    fn total_pages(&self) -> u64;

    /// Sink for throttling time samples.
    fn metrics(&self) -> &dyn PageMemoryMetrics;
}

/// Throttling policy driven by page-dirty and checkpoint events.
pub trait PagesWriteThrottlePolicy: Send + Sync {
    /// Called before the calling thread marks a page dirty. May park the thread.
    fn on_mark_dirty(&self, is_page_in_checkpoint: bool) -> ParkTime;

    /// Called when a checkpoint starts.
    fn on_begin_checkpoint(&self);

    /// Called when a checkpoint finishes. Wakes every parked thread.
    fn on_finish_checkpoint(&self);

    /// Wakes parked threads if the checkpoint buffer is no longer under pressure.
    fn try_wakeup_throttled_threads(&self);

    /// True if the checkpoint buffer is filled over its threshold.
    fn should_throttle(&self) -> bool;
}

/// True if `memory`'s checkpoint buffer holds more than `threshold` of its capacity.
pub fn checkpoint_buffer_overflow(memory: &dyn ThrottledPageMemory, threshold: f64) -> bool {
    let limit = (memory.checkpoint_buffer_pages_size() as f64 * threshold) as u64;
    memory.checkpoint_buffer_pages_count() > limit
}

/// Builds the policy selected by `options`, or `None` if throttling is disabled.
pub fn throttle_policy(
    options: &ThrottleOptions,
    memory: Arc<dyn ThrottledPageMemory>,
    progress: Arc<dyn CheckpointProgressProvider>,
) -> Option<Arc<dyn PagesWriteThrottlePolicy>> {
    match options.policy {
        ThrottlingPolicy::Disabled => None,
        ThrottlingPolicy::TargetRatio => Some(Arc::new(PagesWriteThrottle::with_options(
            memory, progress, false, options,
        ))),
        ThrottlingPolicy::CheckpointBufferOnly => Some(Arc::new(PagesWriteThrottle::with_options(
            memory, progress, true, options,
        ))),
        ThrottlingPolicy::SpeedBased => Some(Arc::new(PagesWriteSpeedBasedThrottle::with_options(
            memory, progress, options,
        ))),
    }
}
