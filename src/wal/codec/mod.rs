//! Versioned binary codec for WAL record payloads.
//!
//! All integers are big-endian. [`RecordDataCodec::size`] is exact: the log
//! writer preallocates from it, so every `write_record` produces precisely
//! that many bytes. Version 2 redefines a subset of record types and forwards
//! everything else to version 1.

pub mod tx;
pub mod v1;
pub mod v2;

use bytes::{Buf, BufMut, BytesMut};
use tracing::trace;

use crate::primitives::bytes::CheckedBuf;
use crate::types::{Result, WaldenError};
use crate::wal::record::{RecordType, WalRecord};

/// Serializer protocol version.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Default, serde::Deserialize)]
#[serde(try_from = "u8")]
pub enum SerializerVersion {
    /// Original layout.
    V1,
    /// Current layout.
    #[default]
    V2,
}

impl SerializerVersion {
    /// Numeric version as written to segment headers.
    pub const fn number(self) -> u32 {
        match self {
            SerializerVersion::V1 => 1,
            SerializerVersion::V2 => 2,
        }
    }
}

impl TryFrom<u8> for SerializerVersion {
    type Error = WaldenError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(SerializerVersion::V1),
            2 => Ok(SerializerVersion::V2),
            _ => Err(WaldenError::InvalidOwned(format!(
                "unsupported wal serializer version {value}"
            ))),
        }
    }
}

/// Record payload codec with an explicit version fallback chain.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RecordDataCodec {
    /// Version 1 layout.
    V1,
    /// Version 2 layout; types it does not redefine use [`RecordDataCodec::V1`].
    V2,
}

impl RecordDataCodec {
    /// Codec for a serializer version.
    pub const fn for_version(version: SerializerVersion) -> Self {
        match version {
            SerializerVersion::V1 => RecordDataCodec::V1,
            SerializerVersion::V2 => RecordDataCodec::V2,
        }
    }

    /// Version implemented by this codec.
    pub const fn version(self) -> SerializerVersion {
        match self {
            RecordDataCodec::V1 => SerializerVersion::V1,
            RecordDataCodec::V2 => SerializerVersion::V2,
        }
    }

    /// Exact payload size of `record`.
    ///
    /// Fails if the record cannot be encoded at all, e.g. too many cache
    /// groups for a 2-byte count.
    pub fn size(self, record: &WalRecord) -> Result<usize> {
        match self {
            RecordDataCodec::V1 => v1::size(record),
            RecordDataCodec::V2 => v2::size(record),
        }
    }

    /// Decodes a payload of type `ty` from `src`.
    pub fn read_record<B: Buf + ?Sized>(self, ty: RecordType, src: &mut B) -> Result<WalRecord> {
        match self {
            RecordDataCodec::V1 => v1::read_record(ty, src),
            RecordDataCodec::V2 => v2::read_record(ty, src),
        }
    }

    /// Encodes `record` into `dst`.
    ///
    /// Nothing is written if `dst` has less than [`size`](Self::size) bytes of room.
    pub fn write_record<B: BufMut + ?Sized>(self, record: &WalRecord, dst: &mut B) -> Result<()> {
        let size = self.size(record)?;
        if dst.remaining_mut() < size {
            return Err(WaldenError::Invalid("output buffer smaller than record size"));
        }
        match self {
            RecordDataCodec::V1 => v1::write_record(record, dst),
            RecordDataCodec::V2 => v2::write_record(record, dst),
        }
    }

    /// Encodes `record` into a new buffer of exactly [`size`](Self::size) bytes.
    pub fn encode(self, record: &WalRecord) -> Result<BytesMut> {
        let size = self.size(record)?;
        let mut buf = BytesMut::with_capacity(size);
        self.write_record(record, &mut buf)?;
        debug_assert_eq!(buf.len(), size, "size() disagrees with write_record()");
        trace!(record_type = %record.record_type(), size, "wal.codec.encode");
        Ok(buf)
    }

    /// Decodes a payload that must span all of `bytes`.
    pub fn decode(self, ty: RecordType, mut bytes: &[u8]) -> Result<WalRecord> {
        let record = self.read_record(ty, &mut bytes)?;
        if bytes.has_remaining() {
            return Err(WaldenError::Corruption("trailing bytes after wal record"));
        }
        Ok(record)
    }

    /// Encodes `record` prefixed by its one-byte [`RecordType::id`].
    pub fn encode_framed(self, record: &WalRecord) -> Result<BytesMut> {
        let size = self.size(record)?;
        let mut buf = BytesMut::with_capacity(1 + size);
        buf.put_u8(record.record_type().id());
        self.write_record(record, &mut buf)?;
        Ok(buf)
    }

    /// Reads one type-prefixed record from `src`, advancing past it.
    pub fn read_framed<B: Buf + ?Sized>(self, src: &mut B) -> Result<WalRecord> {
        let ty = RecordType::from_id(src.read_u8()?)?;
        self.read_record(ty, src)
    }
}

impl From<SerializerVersion> for RecordDataCodec {
    fn from(version: SerializerVersion) -> Self {
        Self::for_version(version)
    }
}

/// Converts a collection length to the 2-byte count used by checkpoint layouts.
pub(crate) fn u16_count(len: usize, what: &'static str) -> Result<u16> {
    u16::try_from(len).map_err(|_| WaldenError::Invalid(what))
}

/// Converts a collection length to a 4-byte count.
pub(crate) fn u32_count(len: usize, what: &'static str) -> Result<u32> {
    u32::try_from(len).map_err(|_| WaldenError::Invalid(what))
}
