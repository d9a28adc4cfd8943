//! Version 1 record layout.
//!
//! Also hosts the data-entry, cache-state and cache-version sub-codecs that
//! version 2 reuses.

use std::collections::BTreeMap;

use bytes::{Buf, BufMut};

use super::{u16_count, u32_count};
use crate::primitives::bytes::{len_prefixed_size, put_len_prefixed, CheckedBuf};
use crate::types::{Result, WaldenError};
use crate::wal::record::{
    CacheOperation, CacheState, CacheVersion, CheckpointId, CheckpointRecord, DataEntry,
    DataRecord, HeaderRecord, MetastoreDataRecord, RecordType, WalPointer, WalRecord,
};

/// Magic number opening every segment header.
pub const HEADER_MAGIC: u64 = 0x5741_4C44_454E_5F31;

/// Payload size of a header record: magic plus version.
pub const HEADER_RECORD_DATA_SIZE: usize = 8 + 4;

/// Fixed part of a data entry: everything except key and value bytes.
const DATA_ENTRY_FIXED_SIZE: usize =
    4 + 4 + 4 + 1 + CacheVersion::ENCODED_LEN * 2 + 4 + 8 + 8;

pub(crate) fn size(record: &WalRecord) -> Result<usize> {
    Ok(match record {
        WalRecord::Header(_) => HEADER_RECORD_DATA_SIZE,
        WalRecord::Checkpoint(rec) => {
            let ptr = if rec.checkpoint_mark.is_some() { 12 } else { 0 };
            18 + cache_states_size(&rec.cache_group_states)? + ptr
        }
        WalRecord::Data(rec) => data_entries_size(&rec.entries)?,
        WalRecord::MemoryRecovery { .. } => 8,
        WalRecord::PartitionDestroy { .. } => 4 + 4,
        WalRecord::MetastoreData(rec) => {
            len_prefixed_size(Some(rec.key.as_bytes())) + len_prefixed_size(rec.value.as_deref())
        }
        WalRecord::SwitchSegment => 0,
        other => return Err(unsupported(other.record_type())),
    })
}

pub(crate) fn read_record<B: Buf + ?Sized>(ty: RecordType, src: &mut B) -> Result<WalRecord> {
    match ty {
        RecordType::Header => {
            if src.read_u64()? != HEADER_MAGIC {
                return Err(WaldenError::Corruption("wal segment header magic mismatch"));
            }
            Ok(WalRecord::Header(HeaderRecord {
                version: src.read_u32()?,
            }))
        }
        RecordType::Checkpoint => {
            let checkpoint_id = read_checkpoint_id(src)?;
            let checkpoint_mark = if src.read_bool()? {
                let index = src.read_u64()?;
                let file_offset = src.read_u32()?;
                Some(WalPointer::new(index, file_offset, 0))
            } else {
                None
            };
            let cache_group_states = read_cache_states(src)?;
            let end = src.read_bool()?;
            Ok(WalRecord::Checkpoint(CheckpointRecord {
                checkpoint_id,
                checkpoint_mark,
                cache_group_states,
                end,
            }))
        }
        RecordType::Data => {
            let entries = read_data_entries(src, None)?;
            Ok(WalRecord::Data(DataRecord {
                entries,
                timestamp: 0,
            }))
        }
        RecordType::MemoryRecovery => Ok(WalRecord::MemoryRecovery {
            timestamp: src.read_u64()?,
        }),
        RecordType::PartitionDestroy => Ok(WalRecord::PartitionDestroy {
            group_id: src.read_i32()?,
            partition_id: src.read_i32()?,
        }),
        RecordType::MetastoreData => {
            let key = src
                .read_len_prefixed()?
                .ok_or(WaldenError::Corruption("metastore record without key"))?;
            let key = String::from_utf8(key)
                .map_err(|_| WaldenError::Corruption("metastore key is not utf-8"))?;
            let value = src.read_len_prefixed()?;
            Ok(WalRecord::MetastoreData(MetastoreDataRecord { key, value }))
        }
        RecordType::SwitchSegment => Ok(WalRecord::SwitchSegment),
        other => Err(unsupported(other)),
    }
}

pub(crate) fn write_record<B: BufMut + ?Sized>(record: &WalRecord, dst: &mut B) -> Result<()> {
    match record {
        WalRecord::Header(rec) => {
            dst.put_u64(HEADER_MAGIC);
            dst.put_u32(rec.version);
        }
        WalRecord::Checkpoint(rec) => {
            put_checkpoint_id(dst, rec.checkpoint_id);
            match rec.checkpoint_mark {
                Some(ptr) => {
                    dst.put_u8(1);
                    dst.put_u64(ptr.index);
                    dst.put_u32(ptr.file_offset);
                }
                None => dst.put_u8(0),
            }
            put_cache_states(dst, &rec.cache_group_states)?;
            dst.put_u8(u8::from(rec.end));
        }
        WalRecord::Data(rec) => {
            dst.put_u32(u32_count(rec.entries.len(), "too many data entries")?);
            for entry in &rec.entries {
                put_data_entry(dst, entry)?;
            }
        }
        WalRecord::MemoryRecovery { timestamp } => dst.put_u64(*timestamp),
        WalRecord::PartitionDestroy {
            group_id,
            partition_id,
        } => {
            dst.put_i32(*group_id);
            dst.put_i32(*partition_id);
        }
        WalRecord::MetastoreData(rec) => {
            put_len_prefixed(dst, Some(rec.key.as_bytes()))?;
            put_len_prefixed(dst, rec.value.as_deref())?;
        }
        WalRecord::SwitchSegment => {}
        other => return Err(unsupported(other.record_type())),
    }
    Ok(())
}

fn unsupported(ty: RecordType) -> WaldenError {
    match ty {
        RecordType::Snapshot => WaldenError::Unsupported("snapshot records require serializer version 2"),
        RecordType::Exchange => WaldenError::Unsupported("exchange records require serializer version 2"),
        RecordType::Tx => WaldenError::Unsupported("tx records require serializer version 2"),
        RecordType::RollbackTx => WaldenError::Unsupported("rollback records require serializer version 2"),
        _ => WaldenError::Unsupported("record type requires serializer version 2"),
    }
}

pub(crate) fn put_checkpoint_id<B: BufMut + ?Sized>(dst: &mut B, id: CheckpointId) {
    dst.put_u64(id.msb);
    dst.put_u64(id.lsb);
}

pub(crate) fn read_checkpoint_id<B: Buf + ?Sized>(src: &mut B) -> Result<CheckpointId> {
    Ok(CheckpointId::new(src.read_u64()?, src.read_u64()?))
}

/// Encoded size of a cache-states block.
pub fn cache_states_size(states: &BTreeMap<i32, CacheState>) -> Result<usize> {
    u16_count(states.len(), "too many cache groups in checkpoint record")?;
    let mut size = 2;
    for state in states.values() {
        u16_count(state.len(), "too many partitions in cache state")?;
        // Group id, partition count, then id + size + counter + state per partition.
        size += 4 + 2 + 19 * state.len();
    }
    Ok(size)
}

/// Writes a cache-states block.
pub fn put_cache_states<B: BufMut + ?Sized>(
    dst: &mut B,
    states: &BTreeMap<i32, CacheState>,
) -> Result<()> {
    dst.put_u16(u16_count(states.len(), "too many cache groups in checkpoint record")?);
    for (&group_id, state) in states {
        dst.put_i32(group_id);
        dst.put_u16(u16_count(state.len(), "too many partitions in cache state")?);
        for part in state.partitions() {
            dst.put_u16(part.partition_id);
            dst.put_u64(part.size);
            dst.put_u64(part.update_counter);
            dst.put_u8(part.state);
        }
    }
    Ok(())
}

/// Reads a cache-states block.
pub fn read_cache_states<B: Buf + ?Sized>(src: &mut B) -> Result<BTreeMap<i32, CacheState>> {
    let caches = src.read_u16()?;
    let mut states = BTreeMap::new();
    for _ in 0..caches {
        let group_id = src.read_i32()?;
        let parts = src.read_u16()?;
        src.ensure(usize::from(parts) * 19)?;
        let mut state = CacheState::with_capacity(usize::from(parts));
        for _ in 0..parts {
            let partition_id = src.read_u16()?;
            let size = src.read_u64()?;
            let update_counter = src.read_u64()?;
            let part_state = src.read_u8()?;
            state.add_partition_state(partition_id, size, update_counter, part_state);
        }
        states.insert(group_id, state);
    }
    Ok(states)
}

/// Encoded size of a cache version.
pub const fn version_size() -> usize {
    CacheVersion::ENCODED_LEN
}

/// Writes a cache version.
pub fn put_version<B: BufMut + ?Sized>(dst: &mut B, version: &CacheVersion) {
    dst.put_u32(version.topology_version);
    dst.put_u32(version.node_order_drid);
    dst.put_u64(version.order);
}

/// Reads a cache version.
pub fn read_version<B: Buf + ?Sized>(src: &mut B) -> Result<CacheVersion> {
    Ok(CacheVersion::new(
        src.read_u32()?,
        src.read_u32()?,
        src.read_u64()?,
    ))
}

/// Encoded size of one data entry.
pub fn data_entry_size(entry: &DataEntry) -> usize {
    DATA_ENTRY_FIXED_SIZE + entry.key.len() + entry.value.as_ref().map_or(0, Vec::len)
}

/// Entry count plus every entry.
pub(crate) fn data_entries_size(entries: &[DataEntry]) -> Result<usize> {
    u32_count(entries.len(), "too many data entries")?;
    Ok(4 + entries.iter().map(data_entry_size).sum::<usize>())
}

/// Writes one data entry.
pub fn put_data_entry<B: BufMut + ?Sized>(dst: &mut B, entry: &DataEntry) -> Result<()> {
    dst.put_i32(entry.cache_id);
    put_len_prefixed(dst, Some(entry.key.as_slice()))?;
    put_len_prefixed(dst, entry.value.as_deref())?;
    dst.put_u8(entry.op.id());
    put_version(dst, &entry.near_xid_version);
    put_version(dst, &entry.write_version);
    dst.put_i32(entry.partition_id);
    dst.put_u64(entry.partition_counter);
    dst.put_u64(entry.expire_time);
    Ok(())
}

/// Reads one data entry.
pub fn read_data_entry<B: Buf + ?Sized>(src: &mut B) -> Result<DataEntry> {
    let cache_id = src.read_i32()?;
    let key = src
        .read_len_prefixed()?
        .ok_or(WaldenError::Corruption("data entry without key"))?;
    let value = src.read_len_prefixed()?;
    let op = CacheOperation::from_id(src.read_u8()?)?;
    let near_xid_version = read_version(src)?;
    let write_version = read_version(src)?;
    Ok(DataEntry {
        cache_id,
        key,
        value,
        op,
        near_xid_version,
        write_version,
        partition_id: src.read_i32()?,
        partition_counter: src.read_u64()?,
        expire_time: src.read_u64()?,
    })
}

/// Reads the entry count, then the optional timestamp, then the entries.
pub(crate) fn read_data_entries<B: Buf + ?Sized>(
    src: &mut B,
    timestamp: Option<&mut u64>,
) -> Result<Vec<DataEntry>> {
    let count = src.read_u32()?;
    if let Some(timestamp) = timestamp {
        *timestamp = src.read_u64()?;
    }
    // Every entry takes at least the fixed part; reject counts the buffer cannot hold.
    src.ensure((count as usize).saturating_mul(DATA_ENTRY_FIXED_SIZE))?;
    (0..count).map(|_| read_data_entry(src)).collect()
}
