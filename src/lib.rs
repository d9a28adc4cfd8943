//! Durability core for a page-based storage engine.
//!
//! Three cooperating pieces live here:
//!
//! * [`wal`]: segment reservation, archive size accounting with forced
//!   release, the archive cleaner and the versioned WAL record codecs.
//! * [`throttle`]: write throttling of page-dirtying threads while a
//!   checkpoint is running.
//! * [`options`]: TOML configuration for both.

#![warn(missing_docs)]

pub mod options;
pub mod primitives;
pub mod throttle;
pub mod types;
pub mod wal;

pub use options::{ConfigError, DurabilityOptions, ThrottleOptions, ThrottlingPolicy, WalOptions};
pub use throttle::{ParkTime, PagesWriteThrottlePolicy, ThrottledPageMemory};
pub use types::{PageId, Result, WaldenError};
pub use wal::{RecordDataCodec, SegmentArchiveSizeStore, SegmentAware, SegmentReservationStore, SerializerVersion};
