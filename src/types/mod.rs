#![forbid(unsafe_code)]
//! Shared identifiers and the crate-wide error type.

use std::fmt;

/// Identifier of a page in page memory.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct PageId(pub u64);

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

impl From<u64> for PageId {
    fn from(value: u64) -> Self {
        PageId(value)
    }
}

/// Errors produced by the WAL, codec and throttling layers.
#[derive(thiserror::Error, Debug)]
pub enum WaldenError {
    /// Underlying I/O failure.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// Bytes that cannot be decoded into a valid record.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Argument or capacity violation.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Argument violation with a formatted message.
    #[error("invalid argument: {0}")]
    InvalidOwned(String),
    /// A blocking wait or worker loop was cancelled before its condition held.
    #[error("interrupted: {0}")]
    Interrupted(&'static str),
    /// Operation not allowed by the active protocol version.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
}

impl WaldenError {
    /// Returns true if this error reports a cancelled wait.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, WaldenError::Interrupted(_))
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, WaldenError>;
