#![forbid(unsafe_code)]
//! Bounds-checked big-endian decoding over [`bytes::Buf`].
//!
//! `Buf::get_*` panics on underflow; record bytes come from disk, so every read
//! here checks the remaining length first and reports truncation as corruption.

use bytes::Buf;

use crate::types::{Result, WaldenError};

/// Marker written in place of a length prefix for an absent byte array.
pub const NULL_LEN: u32 = u32::MAX;

/// Checked readers for any [`Buf`].
pub trait CheckedBuf: Buf {
    /// Fails with [`WaldenError::Corruption`] unless `n` more bytes are available.
    fn ensure(&self, n: usize) -> Result<()> {
        if self.remaining() < n {
            return Err(WaldenError::Corruption("wal record truncated"));
        }
        Ok(())
    }

    /// Reads one byte.
    fn read_u8(&mut self) -> Result<u8> {
        self.ensure(1)?;
        Ok(self.get_u8())
    }

    /// Reads a byte and interprets any non-zero value as true.
    fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    /// Reads a big-endian u16.
    fn read_u16(&mut self) -> Result<u16> {
        self.ensure(2)?;
        Ok(self.get_u16())
    }

    /// Reads a big-endian u32.
    fn read_u32(&mut self) -> Result<u32> {
        self.ensure(4)?;
        Ok(self.get_u32())
    }

    /// Reads a big-endian i32.
    fn read_i32(&mut self) -> Result<i32> {
        self.ensure(4)?;
        Ok(self.get_i32())
    }

    /// Reads a big-endian u64.
    fn read_u64(&mut self) -> Result<u64> {
        self.ensure(8)?;
        Ok(self.get_u64())
    }

    /// Reads a big-endian i64.
    fn read_i64(&mut self) -> Result<i64> {
        self.ensure(8)?;
        Ok(self.get_i64())
    }

    /// Reads exactly `len` bytes into a new vector.
    fn read_vec(&mut self, len: usize) -> Result<Vec<u8>> {
        self.ensure(len)?;
        let mut out = vec![0u8; len];
        self.copy_to_slice(&mut out);
        Ok(out)
    }

    /// Reads a u32 length prefix followed by that many bytes; [`NULL_LEN`] yields `None`.
    fn read_len_prefixed(&mut self) -> Result<Option<Vec<u8>>> {
        let len = self.read_u32()?;
        if len == NULL_LEN {
            return Ok(None);
        }
        self.read_vec(len as usize).map(Some)
    }
}

impl<B: Buf + ?Sized> CheckedBuf for B {}

/// Encoded size of a length-prefixed optional byte array.
pub fn len_prefixed_size(bytes: Option<&[u8]>) -> usize {
    4 + bytes.map_or(0, <[u8]>::len)
}

/// Writes a u32 length prefix and the bytes, or [`NULL_LEN`] for `None`.
pub fn put_len_prefixed<B: bytes::BufMut + ?Sized>(dst: &mut B, bytes: Option<&[u8]>) -> Result<()> {
    match bytes {
        Some(bytes) => {
            let len = u32::try_from(bytes.len())
                .ok()
                .filter(|len| *len != NULL_LEN)
                .ok_or(WaldenError::Invalid("byte array too long for length prefix"))?;
            dst.put_u32(len);
            dst.put_slice(bytes);
        }
        None => dst.put_u32(NULL_LEN),
    }
    Ok(())
}
