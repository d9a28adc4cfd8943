//! Write-ahead log segment lifecycle and record encoding.
//!
//! Segments are identified by a monotonically increasing absolute index.
//! Readers [`reserve`](reservation::SegmentReservationStore::reserve) a segment
//! before touching it; the archiver reports byte-size deltas to the
//! [`SegmentArchiveSizeStore`], which force-releases old reservations once the
//! archive crosses its configured maximum. The [`SegmentCleaner`] then deletes
//! what is no longer protected.

pub mod archive;
pub mod cleaner;
pub mod codec;
pub mod record;
pub mod reservation;

pub use archive::SegmentArchiveSizeStore;
pub use cleaner::{truncate_archive, ArchiveTruncator, SegmentCleaner};
pub use codec::{RecordDataCodec, SerializerVersion};
pub use record::{RecordType, WalPointer, WalRecord};
pub use reservation::{SegmentObserver, SegmentReservationStore};

use std::sync::Arc;

use crate::options::WalOptions;

/// Reservation and archive-size state for one WAL instance.
///
/// Both stores share the same reservation floor so the archive can force
/// releases through it.
#[derive(Clone)]
pub struct SegmentAware {
    reservations: Arc<SegmentReservationStore>,
    archive: Arc<SegmentArchiveSizeStore>,
}

impl SegmentAware {
    /// Builds the stores from WAL options.
    pub fn new(options: &WalOptions) -> Self {
        let reservations = Arc::new(SegmentReservationStore::new());
        let archive = Arc::new(SegmentArchiveSizeStore::new(
            options.effective_min_wal_archive_size(),
            options.max_wal_archive_size,
            Arc::clone(&reservations),
        ));
        Self {
            reservations,
            archive,
        }
    }

    /// Reservation store.
    pub fn reservations(&self) -> &Arc<SegmentReservationStore> {
        &self.reservations
    }

    /// Archive size store.
    pub fn archive(&self) -> &Arc<SegmentArchiveSizeStore> {
        &self.archive
    }
}

impl std::fmt::Debug for SegmentAware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentAware")
            .field("reservations", &self.reservations)
            .field("archive_size", &self.archive.current_size())
            .field("unlimited", &self.archive.is_unlimited())
            .finish()
    }
}
