//! Segment reservations: protect WAL segments from deletion while readers hold them.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

/// Callback invoked with the new minimum reserved segment, or `None` once nothing is reserved.
pub type SegmentObserver = Arc<dyn Fn(Option<u64>) + Send + Sync>;

#[derive(Default)]
struct ReservationState {
    /// Absolute segment index -> reservation count. Every count is > 0.
    reserved: BTreeMap<u64, u32>,
    /// Reservations at or below this index are refused.
    min_reserve_idx: Option<u64>,
}

impl ReservationState {
    fn min_reserved(&self) -> Option<u64> {
        self.reserved.keys().next().copied()
    }

    fn reserved(&self, abs_idx: u64) -> bool {
        self.reserved.range(..=abs_idx).next().is_some()
    }

    fn reservable(&self, abs_idx: u64) -> bool {
        self.min_reserve_idx.map_or(true, |floor| abs_idx > floor)
    }

    /// Applies `update` and reports the new minimum if it changed.
    fn tracking_min_reserved<F>(&mut self, update: F) -> Option<Option<u64>>
    where
        F: FnOnce(&mut BTreeMap<u64, u32>),
    {
        let old_min = self.min_reserved();
        update(&mut self.reserved);
        let new_min = self.min_reserved();
        (old_min != new_min).then_some(new_min)
    }
}

/// Tracks reservation counts per absolute segment index.
///
/// A segment is protected from deletion while any segment at or below it is
/// reserved. Observers are told about changes to the lowest reserved index;
/// the value is computed under the lock and delivered after it is released.
#[derive(Default)]
pub struct SegmentReservationStore {
    state: Mutex<ReservationState>,
    observers: RwLock<Vec<SegmentObserver>>,
}

impl SegmentReservationStore {
    /// Creates an empty store with no reservation floor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an observer of minimum-reserved-index changes.
    pub fn add_observer(&self, observer: SegmentObserver) {
        self.observers.write().push(observer);
    }

    /// Reserves `abs_idx`. Fails if it is at or below the reservation floor.
    pub fn reserve(&self, abs_idx: u64) -> bool {
        let change = {
            let mut state = self.state.lock();
            if !state.reservable(abs_idx) {
                return false;
            }
            state.tracking_min_reserved(|reserved| *reserved.entry(abs_idx).or_insert(0) += 1)
        };
        self.notify(change);
        true
    }

    /// Releases one reservation of `abs_idx`.
    ///
    /// # Panics
    ///
    /// Panics if `abs_idx` is not currently reserved.
    pub fn release(&self, abs_idx: u64) {
        let change = {
            let mut state = self.state.lock();
            state.tracking_min_reserved(|reserved| {
                let cur = reserved.get(&abs_idx).copied();
                assert!(
                    matches!(cur, Some(count) if count >= 1),
                    "release of unreserved wal segment: cur={cur:?}, abs_idx={abs_idx}"
                );
                match cur {
                    Some(1) => {
                        reserved.remove(&abs_idx);
                    }
                    Some(count) => {
                        reserved.insert(abs_idx, count - 1);
                    }
                    None => {}
                }
            })
        };
        self.notify(change);
    }

    /// Returns true if `abs_idx` is protected, i.e. some reserved index is `<= abs_idx`.
    pub fn reserved(&self, abs_idx: u64) -> bool {
        self.state.lock().reserved(abs_idx)
    }

    /// Raises the reservation floor to `max(floor, abs_idx)`.
    ///
    /// Fails without changing anything if `abs_idx` is currently protected.
    pub fn min_reserve_index(&self, abs_idx: u64) -> bool {
        let mut state = self.state.lock();
        if state.reserved(abs_idx) {
            return false;
        }
        let floor = state.min_reserve_idx.map_or(abs_idx, |floor| floor.max(abs_idx));
        state.min_reserve_idx = Some(floor);
        debug!(abs_idx, floor, "wal.reservation.floor_raised");
        true
    }

    /// Drops every reservation at or below `abs_idx` and raises the floor to it.
    ///
    /// Used when the archive outgrows its configured maximum: old readers lose
    /// their protection so the segments can be deleted.
    pub fn force_release(&self, abs_idx: u64) {
        let change = {
            let mut state = self.state.lock();
            let change = state.tracking_min_reserved(|reserved| {
                let kept = match abs_idx.checked_add(1) {
                    Some(next) => reserved.split_off(&next),
                    None => BTreeMap::new(),
                };
                *reserved = kept;
            });
            let floor = state.min_reserve_idx.map_or(abs_idx, |floor| floor.max(abs_idx));
            state.min_reserve_idx = Some(floor);
            change
        };
        debug!(abs_idx, "wal.reservation.force_release");
        self.notify(change);
    }

    /// Lowest reserved index, or `None` if nothing is reserved.
    pub fn min_reserved_index(&self) -> Option<u64> {
        self.state.lock().min_reserved()
    }

    /// Current reservation floor, or `None` if no floor was set.
    pub fn min_reservable_floor(&self) -> Option<u64> {
        self.state.lock().min_reserve_idx
    }

    /// Number of outstanding reservations of exactly `abs_idx`.
    pub fn reservation_count(&self, abs_idx: u64) -> u32 {
        self.state.lock().reserved.get(&abs_idx).copied().unwrap_or(0)
    }

    fn notify(&self, change: Option<Option<u64>>) {
        let Some(min_reserved) = change else {
            return;
        };
        let observers = self.observers.read().clone();
        for observer in observers {
            observer(min_reserved);
        }
    }
}

impl std::fmt::Debug for SegmentReservationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SegmentReservationStore")
            .field("reserved", &state.reserved)
            .field("min_reserve_idx", &state.min_reserve_idx)
            .finish()
    }
}
