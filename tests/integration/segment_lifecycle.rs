#![allow(missing_docs)]

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::thread;

use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use tracing_subscriber::EnvFilter;
use walden::options::WalOptions;
use walden::wal::{SegmentAware, SegmentReservationStore};

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("walden=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

fn recording_store() -> (SegmentReservationStore, Arc<Mutex<Vec<Option<u64>>>>) {
    let store = SegmentReservationStore::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    store.add_observer(Arc::new(move |min| sink.lock().push(min)));
    (store, seen)
}

#[test]
fn reserve_twice_release_twice() {
    init_tracing();
    let (store, seen) = recording_store();

    assert!(store.reserve(5));
    assert!(store.reserve(5));
    assert_eq!(store.reservation_count(5), 2);
    assert_eq!(*seen.lock(), vec![Some(5)]);

    store.release(5);
    assert_eq!(store.reservation_count(5), 1);
    assert_eq!(seen.lock().len(), 1);

    store.release(5);
    assert_eq!(store.reservation_count(5), 0);
    assert_eq!(store.min_reserved_index(), None);
    assert_eq!(*seen.lock(), vec![Some(5), None]);

    let third = panic::catch_unwind(AssertUnwindSafe(|| store.release(5)));
    assert!(third.is_err(), "third release must be rejected");
    assert_eq!(seen.lock().len(), 2);
}

#[test]
#[should_panic(expected = "release of unreserved wal segment")]
fn releasing_unreserved_segment_panics() {
    let store = SegmentReservationStore::new();
    store.release(3);
}

#[test]
fn floor_blocks_new_reservations() {
    let store = SegmentReservationStore::new();
    assert!(store.reserve(4));
    assert!(!store.min_reserve_index(4));
    assert!(!store.min_reserve_index(10));
    assert!(store.min_reserve_index(3));
    assert!(!store.reserve(3));
    assert!(!store.reserve(2));
    assert!(store.reserve(4));

    store.release(4);
    store.release(4);
    assert!(store.min_reserve_index(6));
    assert_eq!(store.min_reservable_floor(), Some(6));
    assert!(!store.reserve(6));
    assert!(store.reserve(7));
}

#[test]
fn archive_overflow_revokes_old_readers() {
    init_tracing();
    let options = WalOptions {
        min_wal_archive_size: Some(400),
        max_wal_archive_size: Some(1_000),
        ..WalOptions::default()
    };
    let aware = SegmentAware::new(&options);
    let notified = Arc::new(AtomicUsize::new(0));
    {
        let notified = Arc::clone(&notified);
        aware
            .reservations()
            .add_observer(Arc::new(move |_| {
                notified.fetch_add(1, Ordering::SeqCst);
            }));
    }

    assert!(aware.reservations().reserve(1));
    assert!(aware.reservations().reserve(3));
    for idx in 0..4 {
        aware.archive().add_size(idx, 300);
    }

    // 1200 bytes over a 1000 byte maximum: segments 0..=2 go, leaving 300 < 400.
    assert_eq!(aware.reservations().min_reservable_floor(), Some(2));
    assert_eq!(aware.reservations().min_reserved_index(), Some(3));
    assert!(!aware.reservations().reserve(2));
    assert!(aware.reservations().reserve(3));
    assert_eq!(notified.load(Ordering::SeqCst), 2);
}

#[test]
fn concurrent_reservations_balance_out() {
    let (store, seen) = recording_store();
    let store = Arc::new(store);
    let handles: Vec<_> = (0..8u64)
        .map(|seed| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
                for _ in 0..500 {
                    let idx = rng.gen_range(0..32u64);
                    assert!(store.reserve(idx));
                    assert!(store.reserved(idx));
                    if rng.gen_bool(0.5) {
                        thread::yield_now();
                    }
                    store.release(idx);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(store.min_reserved_index(), None);
    // Notifications are delivered outside the lock, so only their presence is ordered.
    assert!(seen.lock().contains(&None));
}
