//! Checkpoint progress as seen by the write throttle.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tracing::debug;

/// Counters of the running checkpoint.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct CheckpointProgressSnapshot {
    /// Pages written so far; `None` until the checkpoint starts writing pages.
    pub written_pages: Option<u64>,
    /// Pages written and fsynced.
    pub synced_pages: u64,
    /// Pages evicted from the checkpoint scope before being written.
    pub evicted_pages: u64,
    /// Pages in the checkpoint scope.
    pub total_pages: u64,
}

impl CheckpointProgressSnapshot {
    /// Written pages, treating an unreported counter as zero.
    pub fn written_or_zero(&self) -> u64 {
        self.written_pages.unwrap_or(0)
    }
}

/// Source of checkpoint progress, implemented by the checkpointer.
pub trait CheckpointProgressProvider: Send + Sync {
    /// Progress of the running checkpoint, or `None` if none is running.
    fn current(&self) -> Option<CheckpointProgressSnapshot>;
}

/// Lock-free progress tracker the checkpointer updates while writing pages.
#[derive(Debug, Default)]
pub struct AtomicCheckpointProgress {
    in_progress: AtomicBool,
    writing: AtomicBool,
    written: AtomicU64,
    synced: AtomicU64,
    evicted: AtomicU64,
    total: AtomicU64,
}

impl AtomicCheckpointProgress {
    /// Creates a tracker with no running checkpoint.
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a checkpoint covering `total_pages` pages.
    pub fn begin(&self, total_pages: u64) {
        self.writing.store(false, Ordering::Release);
        self.written.store(0, Ordering::Relaxed);
        self.synced.store(0, Ordering::Relaxed);
        self.evicted.store(0, Ordering::Relaxed);
        self.total.store(total_pages, Ordering::Relaxed);
        self.in_progress.store(true, Ordering::Release);
        debug!(total_pages, "checkpoint.progress.begin");
    }

    /// Marks the start of page writing; the written counter becomes visible.
    pub fn start_pages_write(&self) {
        self.writing.store(true, Ordering::Release);
    }

    /// Adds written pages.
    pub fn on_pages_written(&self, pages: u64) {
        self.written.fetch_add(pages, Ordering::AcqRel);
    }

    /// Adds fsynced pages.
    pub fn on_pages_synced(&self, pages: u64) {
        self.synced.fetch_add(pages, Ordering::AcqRel);
    }

    /// Adds pages evicted from the checkpoint scope.
    pub fn on_pages_evicted(&self, pages: u64) {
        self.evicted.fetch_add(pages, Ordering::AcqRel);
    }

    /// Ends the checkpoint.
    pub fn finish(&self) {
        self.in_progress.store(false, Ordering::Release);
        self.writing.store(false, Ordering::Release);
        debug!(
            written = self.written.load(Ordering::Acquire),
            synced = self.synced.load(Ordering::Acquire),
            "checkpoint.progress.finish"
        );
    }
}

impl CheckpointProgressProvider for AtomicCheckpointProgress {
    fn current(&self) -> Option<CheckpointProgressSnapshot> {
        if !self.in_progress.load(Ordering::Acquire) {
            return None;
        }
        let written_pages = self
            .writing
            .load(Ordering::Acquire)
            .then(|| self.written.load(Ordering::Acquire));
        Some(CheckpointProgressSnapshot {
            written_pages,
            synced_pages: self.synced.load(Ordering::Acquire),
            evicted_pages: self.evicted.load(Ordering::Acquire),
            total_pages: self.total.load(Ordering::Acquire),
        })
    }
}
