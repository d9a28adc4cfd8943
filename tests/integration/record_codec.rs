#![allow(missing_docs)]

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, BytesMut};
use walden::types::{PageId, Result, WaldenError};
use walden::wal::codec::{RecordDataCodec, SerializerVersion};
use walden::wal::record::{
    CacheOperation, CacheState, CacheVersion, CheckpointId, CheckpointRecord, DataEntry, DataRecord,
    ExchangeRecord, ExchangeType, HeaderRecord, RecordType, RollbackRecord, SnapshotRecord,
    TrackingPageRepairDeltaRecord, TxRecord, TxState, WalPointer, WalRecord,
};

fn checkpoint(mark: Option<WalPointer>) -> WalRecord {
    let mut states = BTreeMap::new();
    let mut group = CacheState::with_capacity(2);
    group.add_partition_state(0, 1_024, 77, 1);
    group.add_partition_state(3, 0, 0, 4);
    states.insert(-12, group);
    states.insert(90, CacheState::default());
    WalRecord::Checkpoint(CheckpointRecord {
        checkpoint_id: CheckpointId::new(0x0123_4567_89ab_cdef, 42),
        checkpoint_mark: mark,
        cache_group_states: states,
        end: true,
    })
}

fn data(timestamp: u64) -> WalRecord {
    let entry = DataEntry {
        cache_id: 7,
        key: b"user:42".to_vec(),
        value: Some(b"{\"name\":\"x\"}".to_vec()),
        op: CacheOperation::Update,
        near_xid_version: CacheVersion::new(1, 2, 3),
        write_version: CacheVersion::new(4, 5, 6),
        partition_id: 11,
        partition_counter: 900,
        expire_time: 0,
    };
    let tombstone = DataEntry {
        value: None,
        op: CacheOperation::Delete,
        ..entry.clone()
    };
    WalRecord::Data(DataRecord {
        entries: vec![entry, tombstone],
        timestamp,
    })
}

fn tx() -> WalRecord {
    let mut nodes = BTreeMap::new();
    nodes.insert(1u16, vec![2u16, 3]);
    nodes.insert(4u16, Vec::new());
    WalRecord::Tx(TxRecord {
        state: TxState::Committed,
        near_xid_version: CacheVersion::new(9, 8, 7),
        write_version: CacheVersion::new(6, 5, 4),
        participating_nodes: nodes,
        timestamp: 1_700_000_000_000,
    })
}

#[test]
fn v2_records_survive_a_framed_stream() -> Result<()> {
    let codec = RecordDataCodec::for_version(SerializerVersion::V2);
    let records = vec![
        checkpoint(Some(WalPointer::new(17, 4_096, 256))),
        data(123_456),
        tx(),
        WalRecord::Snapshot(SnapshotRecord {
            snapshot_id: 99,
            full: true,
        }),
        WalRecord::Exchange(ExchangeRecord {
            exchange_type: ExchangeType::Left,
            const_id: 0x0A0B,
            timestamp: 5,
        }),
        WalRecord::RollbackTx(RollbackRecord {
            group_id: 3,
            partition_id: 8,
            start: 100,
            range: 50,
        }),
        WalRecord::TrackingPageRepairDelta(TrackingPageRepairDeltaRecord {
            group_id: 3,
            page_id: PageId(0xFFFF_0000_1234),
        }),
        WalRecord::MemoryRecovery { timestamp: 8 },
        WalRecord::SwitchSegment,
    ];

    let mut stream = BytesMut::new();
    for record in &records {
        stream.put(codec.encode_framed(record)?);
    }
    let mut src = stream.freeze();
    for expected in &records {
        assert_eq!(&codec.read_framed(&mut src)?, expected);
    }
    assert!(!src.has_remaining());
    Ok(())
}

#[test]
fn v1_checkpoint_drops_pointer_length() -> Result<()> {
    let mark = WalPointer::new(17, 4_096, 256);
    let v1 = RecordDataCodec::V1;
    let v2 = RecordDataCodec::V2;
    let record = checkpoint(Some(mark));

    assert_eq!(v2.size(&record)? - v1.size(&record)?, 4);

    let decoded = v1.decode(RecordType::Checkpoint, &v1.encode(&record)?)?;
    let WalRecord::Checkpoint(decoded) = decoded else {
        panic!("checkpoint decoded as {decoded:?}");
    };
    assert_eq!(decoded.checkpoint_mark, Some(WalPointer::new(17, 4_096, 0)));
    Ok(())
}

#[test]
fn v2_adds_data_timestamp() -> Result<()> {
    let record = data(55);
    assert_eq!(
        RecordDataCodec::V2.size(&record)?,
        RecordDataCodec::V1.size(&record)? + 8
    );
    let WalRecord::Data(decoded) = RecordDataCodec::V1.decode(RecordType::Data, &RecordDataCodec::V1.encode(&record)?)?
    else {
        panic!("expected data record");
    };
    assert_eq!(decoded.timestamp, 0);
    assert_eq!(decoded.entries.len(), 2);
    Ok(())
}

#[test]
fn version_specific_rejections() -> Result<()> {
    let header = WalRecord::Header(HeaderRecord { version: 2 });
    let mut buf = BytesMut::new();
    assert!(matches!(
        RecordDataCodec::V2.write_record(&header, &mut buf),
        Err(WaldenError::Unsupported(_))
    ));
    assert!(buf.is_empty());

    // Headers written by the first version are still readable.
    let bytes = RecordDataCodec::V1.encode(&header)?;
    assert_eq!(RecordDataCodec::V2.decode(RecordType::Header, &bytes)?, header);

    assert!(matches!(RecordDataCodec::V1.encode(&tx()), Err(WaldenError::Unsupported(_))));
    Ok(())
}

#[test]
fn damaged_payloads_are_corruption() -> Result<()> {
    let codec = RecordDataCodec::V2;
    let bytes = codec.encode(&data(1))?;
    for cut in [1, bytes.len() / 2, bytes.len() - 1] {
        let err = codec.decode(RecordType::Data, &bytes[..cut]).unwrap_err();
        assert!(matches!(err, WaldenError::Corruption(_)), "cut {cut}: {err}");
    }

    let mut trailing = bytes.to_vec();
    trailing.push(0);
    assert!(matches!(
        codec.decode(RecordType::Data, &trailing),
        Err(WaldenError::Corruption(_))
    ));

    let mut unknown_type = &[0xEEu8][..];
    assert!(matches!(codec.read_framed(&mut unknown_type), Err(WaldenError::Corruption(_))));
    Ok(())
}

#[test]
fn undersized_output_is_rejected_before_writing() -> Result<()> {
    let record = checkpoint(None);
    let size = RecordDataCodec::V2.size(&record)?;
    let mut storage = vec![0u8; size - 1];
    let mut dst = &mut storage[..];
    assert!(matches!(
        RecordDataCodec::V2.write_record(&record, &mut dst),
        Err(WaldenError::Invalid(_))
    ));
    assert!(storage.iter().all(|&b| b == 0));
    Ok(())
}
