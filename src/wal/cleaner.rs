//! Background deletion of archived WAL segments once the archive outgrows its window.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::primitives::concurrency::CancellationToken;
use crate::types::{Result, WaldenError};
use crate::wal::archive::SegmentArchiveSizeStore;
use crate::wal::reservation::SegmentReservationStore;

/// Pause before re-checking when the archive is over its minimum but nothing can be deleted.
pub const DEFAULT_IDLE_BACKOFF: Duration = Duration::from_millis(100);

/// Owner of the archived segment files.
pub trait ArchiveTruncator: Send + Sync {
    /// Segment holding the latest checkpoint. Only segments strictly below it are deletable.
    fn checkpoint_segment(&self) -> Option<u64>;

    /// Removes archived segment `idx` from storage.
    fn delete_segment(&self, idx: u64) -> Result<()>;
}

/// Deletes the oldest unreserved segments below the checkpoint until the archive
/// drops under `min_size`. Returns how many segments were removed.
///
/// Each segment is first put below the reservation floor so no reader can
/// reserve it while the file is being removed. Stops at the first segment that
/// is still protected.
pub fn truncate_archive(
    archive: &SegmentArchiveSizeStore,
    reservations: &SegmentReservationStore,
    truncator: &dyn ArchiveTruncator,
    min_size: i64,
) -> Result<usize> {
    let Some(checkpoint_idx) = truncator.checkpoint_segment() else {
        return Ok(0);
    };
    let mut deleted = 0usize;
    for (idx, size) in archive.segments() {
        if archive.current_size() < min_size || idx >= checkpoint_idx {
            break;
        }
        if !reservations.min_reserve_index(idx) {
            break;
        }
        truncator.delete_segment(idx)?;
        archive.add_size(idx, -size);
        deleted += 1;
    }
    Ok(deleted)
}

/// Archive cleaner thread.
///
/// Sleeps until the archive reaches its minimum size, then truncates it with
/// [`truncate_archive`]. Dropping the cleaner stops and joins the thread.
pub struct SegmentCleaner {
    stop: CancellationToken,
    archive: Arc<SegmentArchiveSizeStore>,
    worker: Option<thread::JoinHandle<()>>,
}

impl SegmentCleaner {
    /// Starts the cleaner. Fails if the archive is unlimited or the thread cannot be spawned.
    pub fn spawn(
        archive: Arc<SegmentArchiveSizeStore>,
        reservations: Arc<SegmentReservationStore>,
        truncator: Arc<dyn ArchiveTruncator>,
    ) -> Result<Self> {
        Self::spawn_with_backoff(archive, reservations, truncator, DEFAULT_IDLE_BACKOFF)
    }

    /// Like [`spawn`](Self::spawn) with a custom idle backoff.
    pub fn spawn_with_backoff(
        archive: Arc<SegmentArchiveSizeStore>,
        reservations: Arc<SegmentReservationStore>,
        truncator: Arc<dyn ArchiveTruncator>,
        idle_backoff: Duration,
    ) -> Result<Self> {
        let min_size = archive
            .min_wal_archive_size()
            .ok_or(WaldenError::Invalid("archive cleaner requires a bounded wal archive"))?;
        let stop = CancellationToken::new();
        let worker = {
            let stop = stop.clone();
            let archive = Arc::clone(&archive);
            thread::Builder::new()
                .name("walden-archive-cleaner".into())
                .spawn(move || {
                    cleaner_loop(&archive, &reservations, truncator.as_ref(), min_size, &stop, idle_backoff)
                })?
        };
        Ok(Self {
            stop,
            archive,
            worker: Some(worker),
        })
    }

    /// Stops the thread and waits for it to exit.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        self.stop.cancel();
        self.archive.interrupt();
        if worker.join().is_err() {
            warn!("wal.cleaner.panicked");
        }
        self.archive.reset();
    }
}

impl Drop for SegmentCleaner {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

impl std::fmt::Debug for SegmentCleaner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentCleaner")
            .field("running", &self.worker.is_some())
            .finish()
    }
}

fn cleaner_loop(
    archive: &SegmentArchiveSizeStore,
    reservations: &SegmentReservationStore,
    truncator: &dyn ArchiveTruncator,
    min_size: i64,
    stop: &CancellationToken,
    idle_backoff: Duration,
) {
    debug!(min_size, "wal.cleaner.start");
    while !stop.is_cancelled() {
        if let Err(err) = archive.await_exceed_max_size(min_size) {
            debug!(error = %err, "wal.cleaner.interrupted");
            break;
        }
        if stop.is_cancelled() {
            break;
        }
        match truncate_archive(archive, reservations, truncator, min_size) {
            Ok(0) => {
                if stop.wait_timeout(idle_backoff) {
                    break;
                }
            }
            Ok(deleted) => {
                debug!(deleted, archive_size = archive.current_size(), "wal.cleaner.truncated");
            }
            Err(err) => {
                warn!(error = %err, "wal.cleaner.delete_failed");
                if stop.wait_timeout(idle_backoff) {
                    break;
                }
            }
        }
    }
    debug!("wal.cleaner.stop");
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingTruncator {
        checkpoint: Mutex<Option<u64>>,
        deleted: Mutex<Vec<u64>>,
    }

    impl ArchiveTruncator for RecordingTruncator {
        fn checkpoint_segment(&self) -> Option<u64> {
            *self.checkpoint.lock()
        }

        fn delete_segment(&self, idx: u64) -> Result<()> {
            self.deleted.lock().push(idx);
            Ok(())
        }
    }

    fn fixture() -> (Arc<SegmentReservationStore>, Arc<SegmentArchiveSizeStore>) {
        let reservations = Arc::new(SegmentReservationStore::new());
        let archive = Arc::new(SegmentArchiveSizeStore::new(
            250,
            Some(10_000),
            Arc::clone(&reservations),
        ));
        (reservations, archive)
    }

    #[test]
    fn truncates_oldest_until_under_min() -> Result<()> {
        let (reservations, archive) = fixture();
        for idx in 0..5 {
            archive.add_size(idx, 100);
        }
        let truncator = RecordingTruncator::default();
        *truncator.checkpoint.lock() = Some(4);
        let deleted = truncate_archive(&archive, &reservations, &truncator, 250)?;
        assert_eq!(deleted, 3);
        assert_eq!(*truncator.deleted.lock(), vec![0, 1, 2]);
        assert_eq!(archive.current_size(), 200);
        assert_eq!(reservations.min_reservable_floor(), Some(2));
        Ok(())
    }

    #[test]
    fn stops_at_reserved_or_checkpoint_segment() -> Result<()> {
        let (reservations, archive) = fixture();
        for idx in 0..5 {
            archive.add_size(idx, 100);
        }
        let truncator = RecordingTruncator::default();
        *truncator.checkpoint.lock() = Some(1);
        assert_eq!(truncate_archive(&archive, &reservations, &truncator, 0)?, 1);

        *truncator.checkpoint.lock() = Some(5);
        assert!(reservations.reserve(2));
        assert_eq!(truncate_archive(&archive, &reservations, &truncator, 0)?, 1);
        assert_eq!(*truncator.deleted.lock(), vec![0, 1]);
        Ok(())
    }

    #[test]
    fn nothing_deleted_without_checkpoint() -> Result<()> {
        let (reservations, archive) = fixture();
        archive.add_size(0, 1_000);
        let truncator = RecordingTruncator::default();
        assert_eq!(truncate_archive(&archive, &reservations, &truncator, 0)?, 0);
        Ok(())
    }

    #[test]
    fn unlimited_archive_has_no_cleaner() {
        let reservations = Arc::new(SegmentReservationStore::new());
        let archive = Arc::new(SegmentArchiveSizeStore::new(0, None, Arc::clone(&reservations)));
        let truncator: Arc<dyn ArchiveTruncator> = Arc::new(RecordingTruncator::default());
        assert!(SegmentCleaner::spawn(archive, reservations, truncator).is_err());
    }
}
