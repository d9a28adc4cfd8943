#![allow(missing_docs)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use walden::types::{Result, WaldenError};
use walden::wal::{ArchiveTruncator, SegmentArchiveSizeStore, SegmentCleaner, SegmentReservationStore};

struct FakeArchive {
    checkpoint: Mutex<Option<u64>>,
    deleted: Mutex<Vec<u64>>,
    fail_on: Mutex<Option<u64>>,
}

impl FakeArchive {
    fn with_checkpoint(checkpoint: u64) -> Self {
        Self {
            checkpoint: Mutex::new(Some(checkpoint)),
            deleted: Mutex::new(Vec::new()),
            fail_on: Mutex::new(None),
        }
    }

    fn deleted(&self) -> Vec<u64> {
        self.deleted.lock().clone()
    }
}

impl ArchiveTruncator for FakeArchive {
    fn checkpoint_segment(&self) -> Option<u64> {
        *self.checkpoint.lock()
    }

    fn delete_segment(&self, idx: u64) -> Result<()> {
        if *self.fail_on.lock() == Some(idx) {
            return Err(WaldenError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "segment file is locked",
            )));
        }
        self.deleted.lock().push(idx);
        Ok(())
    }
}

fn bounded(min: u64, max: u64) -> (Arc<SegmentReservationStore>, Arc<SegmentArchiveSizeStore>) {
    let reservations = Arc::new(SegmentReservationStore::new());
    let archive = Arc::new(SegmentArchiveSizeStore::new(min, Some(max), Arc::clone(&reservations)));
    (reservations, archive)
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}

#[test]
fn waiter_released_when_total_reaches_target() -> Result<()> {
    let (_reservations, archive) = bounded(100, 10_000);
    let waiter = {
        let archive = Arc::clone(&archive);
        thread::spawn(move || archive.await_exceed_max_size(500))
    };

    archive.add_size(0, 200);
    archive.add_size(1, 200);
    thread::sleep(Duration::from_millis(20));
    assert!(!waiter.is_finished(), "400 bytes must not release a 500 byte waiter");

    archive.add_size(2, 100);
    waiter.join().unwrap()?;
    assert_eq!(archive.current_size(), 500);
    Ok(())
}

#[test]
fn interrupt_fails_the_waiter() {
    let (_reservations, archive) = bounded(100, 10_000);
    let waiter = {
        let archive = Arc::clone(&archive);
        thread::spawn(move || archive.await_exceed_max_size(500))
    };
    thread::sleep(Duration::from_millis(20));
    archive.interrupt();

    let err = waiter.join().unwrap().unwrap_err();
    assert!(err.is_interrupted(), "{err}");

    archive.reset();
    archive.add_size(0, 600);
    assert!(archive.await_exceed_max_size(500).is_ok());
}

#[test]
fn cleaner_keeps_archive_under_minimum() -> Result<()> {
    let (reservations, archive) = bounded(250, 100_000);
    let truncator = Arc::new(FakeArchive::with_checkpoint(10));
    let cleaner = SegmentCleaner::spawn_with_backoff(
        Arc::clone(&archive),
        Arc::clone(&reservations),
        Arc::clone(&truncator) as Arc<dyn ArchiveTruncator>,
        Duration::from_millis(5),
    )?;

    for idx in 0..6 {
        archive.add_size(idx, 100);
    }
    assert!(wait_until(|| archive.current_size() < 250), "size {}", archive.current_size());
    let deleted = truncator.deleted();
    assert!(!deleted.is_empty());
    assert!(deleted.windows(2).all(|pair| pair[0] < pair[1]), "{deleted:?}");
    assert!(!reservations.reserve(deleted[deleted.len() - 1]));

    cleaner.shutdown();
    Ok(())
}

#[test]
fn cleaner_never_deletes_reserved_segments() -> Result<()> {
    let (reservations, archive) = bounded(100, 100_000);
    assert!(reservations.reserve(2));
    let truncator = Arc::new(FakeArchive::with_checkpoint(10));
    let cleaner = SegmentCleaner::spawn_with_backoff(
        Arc::clone(&archive),
        Arc::clone(&reservations),
        Arc::clone(&truncator) as Arc<dyn ArchiveTruncator>,
        Duration::from_millis(5),
    )?;
    for idx in 0..5 {
        archive.add_size(idx, 100);
    }
    assert!(wait_until(|| truncator.deleted().len() == 2));
    thread::sleep(Duration::from_millis(30));
    assert_eq!(truncator.deleted(), vec![0, 1]);
    assert_eq!(archive.current_size(), 300);

    reservations.release(2);
    assert!(wait_until(|| archive.current_size() < 100));
    assert_eq!(truncator.deleted(), vec![0, 1, 2, 3, 4]);
    drop(cleaner);
    Ok(())
}

#[test]
fn failed_delete_is_retried() -> Result<()> {
    let (reservations, archive) = bounded(100, 100_000);
    let truncator = Arc::new(FakeArchive::with_checkpoint(10));
    *truncator.fail_on.lock() = Some(0);
    let cleaner = SegmentCleaner::spawn_with_backoff(
        Arc::clone(&archive),
        Arc::clone(&reservations),
        Arc::clone(&truncator) as Arc<dyn ArchiveTruncator>,
        Duration::from_millis(5),
    )?;
    archive.add_size(0, 100);
    archive.add_size(1, 100);
    thread::sleep(Duration::from_millis(30));
    assert!(truncator.deleted().is_empty());

    *truncator.fail_on.lock() = None;
    assert!(wait_until(|| archive.current_size() < 100));
    assert_eq!(truncator.deleted(), vec![0, 1]);
    cleaner.shutdown();
    Ok(())
}

#[test]
fn shutdown_is_prompt_while_waiting() -> Result<()> {
    let (reservations, archive) = bounded(1_000, 100_000);
    let truncator: Arc<dyn ArchiveTruncator> = Arc::new(FakeArchive::with_checkpoint(10));
    let cleaner = SegmentCleaner::spawn(Arc::clone(&archive), reservations, truncator)?;
    thread::sleep(Duration::from_millis(10));
    let start = Instant::now();
    cleaner.shutdown();
    assert!(start.elapsed() < Duration::from_secs(1));
    // The store is usable again after the cleaner is gone.
    archive.add_size(0, 1_000);
    assert!(archive.await_exceed_max_size(1_000).is_ok());
    Ok(())
}
