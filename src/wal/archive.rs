//! WAL archive size accounting with a bounded size window.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use crate::types::{Result, WaldenError};
use crate::wal::reservation::SegmentReservationStore;

struct SizeWindow {
    min_wal_archive_size: i64,
    max_wal_archive_size: i64,
    reservations: Arc<SegmentReservationStore>,
}

struct ArchiveState {
    wal_archive_size: i64,
    interrupted: bool,
    /// Segment idx -> size in bytes. `None` for an unlimited archive.
    segment_sizes: Option<BTreeMap<u64, i64>>,
}

/// Tracks the total WAL archive size and enforces its size window.
///
/// When the maximum is configured, per-segment sizes are kept and crossing the
/// maximum force-releases the shortest prefix of oldest segments whose removal
/// brings the archive below the minimum. An unlimited archive only keeps the
/// running total.
pub struct SegmentArchiveSizeStore {
    window: Option<SizeWindow>,
    state: Mutex<ArchiveState>,
    size_changed: Condvar,
}

impl SegmentArchiveSizeStore {
    /// Creates a store. `max_wal_archive_size == None` means the archive is unlimited.
    pub fn new(
        min_wal_archive_size: u64,
        max_wal_archive_size: Option<u64>,
        reservations: Arc<SegmentReservationStore>,
    ) -> Self {
        let window = max_wal_archive_size.map(|max| SizeWindow {
            min_wal_archive_size: clamp_i64(min_wal_archive_size),
            max_wal_archive_size: clamp_i64(max),
            reservations,
        });
        let segment_sizes = window.as_ref().map(|_| BTreeMap::new());
        Self {
            window,
            state: Mutex::new(ArchiveState {
                wal_archive_size: 0,
                interrupted: false,
                segment_sizes,
            }),
            size_changed: Condvar::new(),
        }
    }

    /// Adds `size_change` bytes (possibly negative) for segment `idx`.
    pub fn add_size(&self, idx: u64, size_change: i64) {
        let mut release_idx = None;
        let mut release_cnt = 0usize;
        let grew = size_change > 0;
        {
            let mut state = self.state.lock();
            state.wal_archive_size += size_change;
            let total = state.wal_archive_size;
            if let Some(sizes) = state.segment_sizes.as_mut() {
                let size = sizes.get(&idx).copied().unwrap_or(0) + size_change;
                if size == 0 {
                    sizes.remove(&idx);
                } else {
                    sizes.insert(idx, size);
                }
                if let Some(window) = self.window.as_ref().filter(|_| grew) {
                    if total >= window.max_wal_archive_size {
                        let mut released = 0i64;
                        for (&seg_idx, &seg_size) in sizes.iter() {
                            release_idx = Some(seg_idx);
                            release_cnt += 1;
                            released += seg_size;
                            if total - released < window.min_wal_archive_size {
                                break;
                            }
                        }
                    }
                }
            }
        }
        if grew {
            self.size_changed.notify_all();
        }
        if let (Some(release_idx), Some(window)) = (release_idx, self.window.as_ref()) {
            info!(
                max_wal_archive_size = window.max_wal_archive_size,
                released_segment_cnt = release_cnt,
                last_released_segment_idx = release_idx,
                "wal.archive.force_release"
            );
            window.reservations.force_release(release_idx);
        }
    }

    /// Zeroes the total and forgets every segment size.
    pub fn reset_sizes(&self) {
        let mut state = self.state.lock();
        state.wal_archive_size = 0;
        if let Some(sizes) = state.segment_sizes.as_mut() {
            sizes.clear();
        }
        debug!("wal.archive.reset_sizes");
    }

    /// Blocks until the archive size reaches `max` bytes.
    ///
    /// Returns [`WaldenError::Interrupted`] if [`interrupt`](Self::interrupt)
    /// is called before the size is reached, or was called earlier without a
    /// following [`reset`](Self::reset).
    pub fn await_exceed_max_size(&self, max: i64) -> Result<()> {
        let mut state = self.state.lock();
        while max - state.wal_archive_size > 0 && !state.interrupted {
            self.size_changed.wait(&mut state);
        }
        if state.interrupted {
            return Err(WaldenError::Interrupted(
                "waiting for the wal archive to exceed its maximum size",
            ));
        }
        Ok(())
    }

    /// Wakes every waiter with an interruption.
    pub fn interrupt(&self) {
        self.state.lock().interrupted = true;
        self.size_changed.notify_all();
    }

    /// Clears the interrupted flag so the store can be waited on again.
    pub fn reset(&self) {
        self.state.lock().interrupted = false;
    }

    /// Current archive size in bytes.
    pub fn current_size(&self) -> i64 {
        self.state.lock().wal_archive_size
    }

    /// Size of segment `idx`, or `None` if unknown or the archive is unlimited.
    pub fn segment_size(&self, idx: u64) -> Option<i64> {
        if self.window.is_none() {
            return None;
        }
        let state = self.state.lock();
        state.segment_sizes.as_ref()?.get(&idx).copied()
    }

    /// Tracked segments in ascending index order. Empty for an unlimited archive.
    pub fn segments(&self) -> Vec<(u64, i64)> {
        let state = self.state.lock();
        state
            .segment_sizes
            .as_ref()
            .map(|sizes| sizes.iter().map(|(&idx, &size)| (idx, size)).collect())
            .unwrap_or_default()
    }

    /// True if no maximum archive size is configured.
    pub fn is_unlimited(&self) -> bool {
        self.window.is_none()
    }

    /// Configured minimum archive size, if the archive is bounded.
    pub fn min_wal_archive_size(&self) -> Option<i64> {
        self.window.as_ref().map(|w| w.min_wal_archive_size)
    }

    /// Configured maximum archive size, if the archive is bounded.
    pub fn max_wal_archive_size(&self) -> Option<i64> {
        self.window.as_ref().map(|w| w.max_wal_archive_size)
    }
}

fn clamp_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
