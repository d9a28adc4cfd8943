//! Version 2 record layout.
//!
//! Redefines checkpoint, data, snapshot, exchange, tx, rollback and tracking
//! page repair records. Every other type falls through to [`super::v1`].
//! Header records can still be read and sized but no longer written.

use bytes::{Buf, BufMut};

use super::{tx, u32_count, v1};
use crate::primitives::bytes::CheckedBuf;
use crate::types::{PageId, Result, WaldenError};
use crate::wal::record::{
    CheckpointRecord, DataRecord, ExchangeRecord, ExchangeType, RecordType, RollbackRecord,
    SnapshotRecord, TrackingPageRepairDeltaRecord, WalPointer, WalRecord,
};

pub(crate) fn size(record: &WalRecord) -> Result<usize> {
    Ok(match record {
        WalRecord::Header(_) => v1::HEADER_RECORD_DATA_SIZE,
        WalRecord::Checkpoint(rec) => {
            let ptr = if rec.checkpoint_mark.is_some() { 16 } else { 0 };
            18 + v1::cache_states_size(&rec.cache_group_states)? + ptr
        }
        WalRecord::Data(rec) => v1::data_entries_size(&rec.entries)? + 8,
        WalRecord::Snapshot(_) => 8 + 1,
        WalRecord::Exchange(_) => 4 + 2 + 8,
        WalRecord::Tx(rec) => tx::size(rec)?,
        WalRecord::RollbackTx(_) => 4 + 4 + 8 + 8,
        WalRecord::TrackingPageRepairDelta(_) => 4 + 8,
        other => v1::size(other)?,
    })
}

pub(crate) fn read_record<B: Buf + ?Sized>(ty: RecordType, src: &mut B) -> Result<WalRecord> {
    Ok(match ty {
        RecordType::Checkpoint => {
            let checkpoint_id = v1::read_checkpoint_id(src)?;
            let checkpoint_mark = if src.read_bool()? {
                Some(WalPointer::new(src.read_u64()?, src.read_u32()?, src.read_u32()?))
            } else {
                None
            };
            let cache_group_states = v1::read_cache_states(src)?;
            WalRecord::Checkpoint(CheckpointRecord {
                checkpoint_id,
                checkpoint_mark,
                cache_group_states,
                end: src.read_bool()?,
            })
        }
        RecordType::Data => {
            let mut timestamp = 0;
            let entries = v1::read_data_entries(src, Some(&mut timestamp))?;
            WalRecord::Data(DataRecord { entries, timestamp })
        }
        RecordType::Snapshot => WalRecord::Snapshot(SnapshotRecord {
            snapshot_id: src.read_u64()?,
            full: src.read_u8()? == 1,
        }),
        RecordType::Exchange => {
            let exchange_type = ExchangeType::from_ordinal(src.read_i32()?)?;
            let const_id = src.read_u16()?;
            let timestamp = src.read_u64()?;
            WalRecord::Exchange(ExchangeRecord {
                exchange_type,
                const_id,
                timestamp,
            })
        }
        RecordType::Tx => WalRecord::Tx(tx::read(src)?),
        RecordType::RollbackTx => WalRecord::RollbackTx(RollbackRecord {
            group_id: src.read_i32()?,
            partition_id: src.read_i32()?,
            start: src.read_u64()?,
            range: src.read_u64()?,
        }),
        RecordType::TrackingPageRepairDelta => {
            WalRecord::TrackingPageRepairDelta(TrackingPageRepairDeltaRecord {
                group_id: src.read_i32()?,
                page_id: PageId(src.read_u64()?),
            })
        }
        other => v1::read_record(other, src)?,
    })
}

pub(crate) fn write_record<B: BufMut + ?Sized>(record: &WalRecord, dst: &mut B) -> Result<()> {
    match record {
        WalRecord::Header(_) => {
            return Err(WaldenError::Unsupported(
                "writing header records is forbidden since serializer version 2",
            ));
        }
        WalRecord::Checkpoint(rec) => {
            v1::put_checkpoint_id(dst, rec.checkpoint_id);
            match rec.checkpoint_mark {
                Some(ptr) => {
                    dst.put_u8(1);
                    dst.put_u64(ptr.index);
                    dst.put_u32(ptr.file_offset);
                    dst.put_u32(ptr.length);
                }
                None => dst.put_u8(0),
            }
            v1::put_cache_states(dst, &rec.cache_group_states)?;
            dst.put_u8(u8::from(rec.end));
        }
        WalRecord::Data(rec) => {
            dst.put_u32(u32_count(rec.entries.len(), "too many data entries")?);
            dst.put_u64(rec.timestamp);
            for entry in &rec.entries {
                v1::put_data_entry(dst, entry)?;
            }
        }
        WalRecord::Snapshot(rec) => {
            dst.put_u64(rec.snapshot_id);
            dst.put_u8(u8::from(rec.full));
        }
        WalRecord::Exchange(rec) => {
            dst.put_i32(rec.exchange_type.ordinal());
            dst.put_u16(rec.const_id);
            dst.put_u64(rec.timestamp);
        }
        WalRecord::Tx(rec) => tx::write(rec, dst)?,
        WalRecord::RollbackTx(rec) => {
            dst.put_i32(rec.group_id);
            dst.put_i32(rec.partition_id);
            dst.put_u64(rec.start);
            dst.put_u64(rec.range);
        }
        WalRecord::TrackingPageRepairDelta(rec) => {
            dst.put_i32(rec.group_id);
            dst.put_u64(rec.page_id.0);
        }
        other => v1::write_record(other, dst)?,
    }
    Ok(())
}
