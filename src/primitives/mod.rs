//! Low-level building blocks shared by the WAL and throttling layers.
//!
//! Includes bounded byte decoding, cancellation handles, exponential backoff,
//! and rolling speed measurements.

/// Exponential backoff delays.
pub mod backoff;

/// Byte-level decoding helpers.
///
/// Checked big-endian reads used by the record codecs.
pub mod bytes;

/// Concurrency primitives and synchronization.
///
/// Cancellation tokens used for parked threads and daemon shutdown.
pub mod concurrency;

/// Interval-based speed and average measurements.
pub mod measure;
