//! Transaction record layout.
//!
//! `state:u8 | near_xid:version | write:version | nodes:u32 { primary:u16 backups:u32 { backup:u16 } } | timestamp:u64`

use std::collections::BTreeMap;

use bytes::{Buf, BufMut};

use super::v1::{put_version, read_version, version_size};
use super::u32_count;
use crate::primitives::bytes::CheckedBuf;
use crate::types::Result;
use crate::wal::record::{TxRecord, TxState};

/// Encoded size of `record`.
pub fn size(record: &TxRecord) -> Result<usize> {
    let mut size = 1 + version_size() * 2 + 4 + 8;
    u32_count(record.participating_nodes.len(), "too many tx participants")?;
    for backups in record.participating_nodes.values() {
        u32_count(backups.len(), "too many tx backup nodes")?;
        size += 2 + 4 + 2 * backups.len();
    }
    Ok(size)
}

/// Writes `record`.
pub fn write<B: BufMut + ?Sized>(record: &TxRecord, dst: &mut B) -> Result<()> {
    dst.put_u8(record.state.id());
    put_version(dst, &record.near_xid_version);
    put_version(dst, &record.write_version);
    dst.put_u32(u32_count(record.participating_nodes.len(), "too many tx participants")?);
    for (&primary, backups) in &record.participating_nodes {
        dst.put_u16(primary);
        dst.put_u32(u32_count(backups.len(), "too many tx backup nodes")?);
        for &backup in backups {
            dst.put_u16(backup);
        }
    }
    dst.put_u64(record.timestamp);
    Ok(())
}

/// Reads a record.
pub fn read<B: Buf + ?Sized>(src: &mut B) -> Result<TxRecord> {
    let state = TxState::from_id(src.read_u8()?)?;
    let near_xid_version = read_version(src)?;
    let write_version = read_version(src)?;
    let participants = src.read_u32()?;
    src.ensure((participants as usize).saturating_mul(2 + 4))?;
    let mut participating_nodes = BTreeMap::new();
    for _ in 0..participants {
        let primary = src.read_u16()?;
        let backup_cnt = src.read_u32()? as usize;
        src.ensure(backup_cnt.saturating_mul(2))?;
        let backups = (0..backup_cnt)
            .map(|_| src.read_u16())
            .collect::<Result<Vec<_>>>()?;
        participating_nodes.insert(primary, backups);
    }
    Ok(TxRecord {
        state,
        near_xid_version,
        write_version,
        participating_nodes,
        timestamp: src.read_u64()?,
    })
}
