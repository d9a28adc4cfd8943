//! WAL record data model.
//!
//! Records are plain values. Their byte layout lives in [`crate::wal::codec`];
//! the discriminant written in front of every record is [`RecordType::id`].

use std::collections::BTreeMap;
use std::fmt;

use crate::types::{PageId, Result, WaldenError};

/// On-disk record discriminant. Ids are stable across serializer versions.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum RecordType {
    /// Transaction state change.
    Tx,
    /// Logical data mutations.
    Data,
    /// Checkpoint marker.
    Checkpoint,
    /// Segment header.
    Header,
    /// Marks a completed memory recovery.
    MemoryRecovery,
    /// Partition destroyed.
    PartitionDestroy,
    /// Switch to the next segment.
    SwitchSegment,
    /// Snapshot marker.
    Snapshot,
    /// Topology exchange marker.
    Exchange,
    /// Rolled back update counter range.
    RollbackTx,
    /// Metastorage key update.
    MetastoreData,
    /// Tracking page repair delta.
    TrackingPageRepairDelta,
}

impl RecordType {
    /// Every known record type.
    pub const ALL: [RecordType; 12] = [
        RecordType::Tx,
        RecordType::Data,
        RecordType::Checkpoint,
        RecordType::Header,
        RecordType::MemoryRecovery,
        RecordType::PartitionDestroy,
        RecordType::SwitchSegment,
        RecordType::Snapshot,
        RecordType::Exchange,
        RecordType::RollbackTx,
        RecordType::MetastoreData,
        RecordType::TrackingPageRepairDelta,
    ];

    /// Stable discriminant byte.
    pub const fn id(self) -> u8 {
        match self {
            RecordType::Tx => 0,
            RecordType::Data => 2,
            RecordType::Checkpoint => 4,
            RecordType::Header => 5,
            RecordType::MemoryRecovery => 9,
            RecordType::PartitionDestroy => 10,
            RecordType::SwitchSegment => 11,
            RecordType::Snapshot => 12,
            RecordType::Exchange => 13,
            RecordType::RollbackTx => 14,
            RecordType::MetastoreData => 15,
            RecordType::TrackingPageRepairDelta => 16,
        }
    }

    /// Maps a discriminant byte back to its type.
    pub fn from_id(id: u8) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|ty| ty.id() == id)
            .ok_or(WaldenError::Corruption("unknown wal record type"))
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Position of a record in the log.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct WalPointer {
    /// Absolute segment index.
    pub index: u64,
    /// Offset of the record inside the segment.
    pub file_offset: u32,
    /// Record length in bytes. Zero when unknown.
    pub length: u32,
}

impl WalPointer {
    /// Creates a pointer.
    pub const fn new(index: u64, file_offset: u32, length: u32) -> Self {
        Self {
            index,
            file_offset,
            length,
        }
    }
}

/// 128-bit checkpoint identifier stored as two big-endian halves.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Default)]
pub struct CheckpointId {
    /// Most significant 64 bits.
    pub msb: u64,
    /// Least significant 64 bits.
    pub lsb: u64,
}

impl CheckpointId {
    /// Builds an id from its two halves.
    pub const fn new(msb: u64, lsb: u64) -> Self {
        Self { msb, lsb }
    }
}

impl fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = (u128::from(self.msb) << 64) | u128::from(self.lsb);
        write!(f, "{value:032x}")
    }
}

/// State of one partition at checkpoint time.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub struct PartitionState {
    /// Partition id.
    pub partition_id: u16,
    /// Number of entries.
    pub size: u64,
    /// Update counter.
    pub update_counter: u64,
    /// Partition lifecycle state byte.
    pub state: u8,
}

/// Partition states of one cache group, kept in insertion order.
#[derive(Clone, Debug, Eq, PartialEq, Default)]
pub struct CacheState {
    partitions: Vec<PartitionState>,
}

impl CacheState {
    /// Empty state with room for `parts` partitions.
    pub fn with_capacity(parts: usize) -> Self {
        Self {
            partitions: Vec::with_capacity(parts),
        }
    }

    /// Appends a partition state.
    pub fn add_partition_state(&mut self, partition_id: u16, size: u64, update_counter: u64, state: u8) {
        self.partitions.push(PartitionState {
            partition_id,
            size,
            update_counter,
            state,
        });
    }

    /// Number of partitions.
    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    /// True if no partition was added.
    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    /// Partition states in insertion order.
    pub fn partitions(&self) -> &[PartitionState] {
        &self.partitions
    }
}

/// Checkpoint marker.
#[derive(Clone, Debug, Eq, PartialEq, Default)]
pub struct CheckpointRecord {
    /// Checkpoint this marker belongs to.
    pub checkpoint_id: CheckpointId,
    /// Log position the checkpoint covers.
    pub checkpoint_mark: Option<WalPointer>,
    /// Cache group id -> partition states.
    pub cache_group_states: BTreeMap<i32, CacheState>,
    /// True for the record written when the checkpoint finished.
    pub end: bool,
}

/// Grid cache version: topology version, node order with data-center id, and order.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Default)]
pub struct CacheVersion {
    /// Topology version the update was made in.
    pub topology_version: u32,
    /// Node order with the data-center id in the top byte.
    pub node_order_drid: u32,
    /// Per-node monotonic order.
    pub order: u64,
}

impl CacheVersion {
    /// Encoded length in bytes.
    pub const ENCODED_LEN: usize = 4 + 4 + 8;

    /// Creates a version.
    pub const fn new(topology_version: u32, node_order_drid: u32, order: u64) -> Self {
        Self {
            topology_version,
            node_order_drid,
            order,
        }
    }
}

/// Cache operation carried by a data entry.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum CacheOperation {
    /// New entry.
    Create,
    /// Value replaced.
    Update,
    /// Entry removed.
    Delete,
    /// Read inside a transaction.
    Read,
    /// Entry processor applied.
    Transform,
    /// Nothing changed.
    Noop,
}

impl CacheOperation {
    /// Encoded byte.
    pub const fn id(self) -> u8 {
        match self {
            CacheOperation::Read => 0,
            CacheOperation::Create => 1,
            CacheOperation::Update => 2,
            CacheOperation::Delete => 3,
            CacheOperation::Transform => 4,
            CacheOperation::Noop => 5,
        }
    }

    /// Decodes an operation byte.
    pub fn from_id(id: u8) -> Result<Self> {
        Ok(match id {
            0 => CacheOperation::Read,
            1 => CacheOperation::Create,
            2 => CacheOperation::Update,
            3 => CacheOperation::Delete,
            4 => CacheOperation::Transform,
            5 => CacheOperation::Noop,
            _ => return Err(WaldenError::Corruption("unknown cache operation")),
        })
    }
}

/// One logical mutation inside a [`DataRecord`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DataEntry {
    /// Cache the entry belongs to.
    pub cache_id: i32,
    /// Serialized key.
    pub key: Vec<u8>,
    /// `None` for removals.
    pub value: Option<Vec<u8>>,
    /// Operation applied to the key.
    pub op: CacheOperation,
    /// Version of the near transaction.
    pub near_xid_version: CacheVersion,
    /// Version the entry was written with.
    pub write_version: CacheVersion,
    /// Partition holding the key.
    pub partition_id: i32,
    /// Partition update counter after this entry.
    pub partition_counter: u64,
    /// Expiry in wall clock millis, 0 for none.
    pub expire_time: u64,
}

/// Batch of data entries.
#[derive(Clone, Debug, Eq, PartialEq, Default)]
pub struct DataRecord {
    /// Mutations in log order.
    pub entries: Vec<DataEntry>,
    /// Wall clock millis. Not persisted by the V1 codec.
    pub timestamp: u64,
}

/// Snapshot marker.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub struct SnapshotRecord {
    /// Snapshot id.
    pub snapshot_id: u64,
    /// False for an incremental snapshot.
    pub full: bool,
}

/// Kind of topology exchange.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ExchangeType {
    /// Node joined.
    Join,
    /// Node left.
    Left,
}

impl ExchangeType {
    /// Encoded ordinal.
    pub const fn ordinal(self) -> i32 {
        match self {
            ExchangeType::Join => 0,
            ExchangeType::Left => 1,
        }
    }

    /// Decodes an ordinal.
    pub fn from_ordinal(ordinal: i32) -> Result<Self> {
        match ordinal {
            0 => Ok(ExchangeType::Join),
            1 => Ok(ExchangeType::Left),
            _ => Err(WaldenError::Corruption("unknown exchange type")),
        }
    }
}

/// Topology exchange marker.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ExchangeRecord {
    /// Join or leave.
    pub exchange_type: ExchangeType,
    /// Consistent id of the node.
    pub const_id: u16,
    /// Wall clock millis.
    pub timestamp: u64,
}

/// Transaction lifecycle state.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum TxState {
    /// Running.
    Active,
    /// Prepare phase started.
    Preparing,
    /// Prepare phase done.
    Prepared,
    /// Will roll back.
    MarkedRollback,
    /// Commit started.
    Committing,
    /// Commit done.
    Committed,
    /// Rollback started.
    RollingBack,
    /// Rollback done.
    RolledBack,
    /// Outcome not known.
    Unknown,
}

impl TxState {
    const ORDER: [TxState; 9] = [
        TxState::Active,
        TxState::Preparing,
        TxState::Prepared,
        TxState::MarkedRollback,
        TxState::Committing,
        TxState::Committed,
        TxState::RollingBack,
        TxState::RolledBack,
        TxState::Unknown,
    ];

    /// Encoded byte.
    pub fn id(self) -> u8 {
        Self::ORDER
            .iter()
            .position(|state| *state == self)
            .map_or(u8::MAX, |pos| pos as u8)
    }

    /// Decodes a state byte.
    pub fn from_id(id: u8) -> Result<Self> {
        Self::ORDER
            .get(usize::from(id))
            .copied()
            .ok_or(WaldenError::Corruption("unknown transaction state"))
    }
}

/// Transaction state change with its participants.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxRecord {
    /// New state.
    pub state: TxState,
    /// Version of the near transaction.
    pub near_xid_version: CacheVersion,
    /// Commit version.
    pub write_version: CacheVersion,
    /// Primary node const id -> backup node const ids.
    pub participating_nodes: BTreeMap<u16, Vec<u16>>,
    /// Wall clock millis.
    pub timestamp: u64,
}

/// Update counter range skipped by a rolled back transaction.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub struct RollbackRecord {
    /// Cache group id.
    pub group_id: i32,
    /// Partition id.
    pub partition_id: i32,
    /// First skipped update counter.
    pub start: u64,
    /// Number of skipped counters.
    pub range: u64,
}

/// Marks a tracking page of a cache group for repair.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub struct TrackingPageRepairDeltaRecord {
    /// Cache group id.
    pub group_id: i32,
    /// Tracking page to repair.
    pub page_id: PageId,
}

/// Segment header.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct HeaderRecord {
    /// Serializer version the segment was written with.
    pub version: u32,
}

/// Metastorage key update. A `None` value removes the key.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MetastoreDataRecord {
    /// Metastorage key.
    pub key: String,
    /// New value.
    pub value: Option<Vec<u8>>,
}

/// A typed WAL record.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum WalRecord {
    /// Segment header.
    Header(HeaderRecord),
    /// Checkpoint marker.
    Checkpoint(CheckpointRecord),
    /// Data mutations.
    Data(DataRecord),
    /// Snapshot marker.
    Snapshot(SnapshotRecord),
    /// Topology exchange marker.
    Exchange(ExchangeRecord),
    /// Transaction state change.
    Tx(TxRecord),
    /// Rolled back counter range.
    RollbackTx(RollbackRecord),
    /// Tracking page repair.
    TrackingPageRepairDelta(TrackingPageRepairDeltaRecord),
    /// Memory recovery finished at `timestamp`.
    MemoryRecovery {
        /// Wall clock millis.
        timestamp: u64,
    },
    /// Partition destroyed.
    PartitionDestroy {
        /// Cache group id.
        group_id: i32,
        /// Partition id.
        partition_id: i32,
    },
    /// Metastorage key update.
    MetastoreData(MetastoreDataRecord),
    /// End of the current segment.
    SwitchSegment,
}

impl WalRecord {
    /// Discriminant of this record.
    pub fn record_type(&self) -> RecordType {
        match self {
            WalRecord::Header(_) => RecordType::Header,
            WalRecord::Checkpoint(_) => RecordType::Checkpoint,
            WalRecord::Data(_) => RecordType::Data,
            WalRecord::Snapshot(_) => RecordType::Snapshot,
            WalRecord::Exchange(_) => RecordType::Exchange,
            WalRecord::Tx(_) => RecordType::Tx,
            WalRecord::RollbackTx(_) => RecordType::RollbackTx,
            WalRecord::TrackingPageRepairDelta(_) => RecordType::TrackingPageRepairDelta,
            WalRecord::MemoryRecovery { .. } => RecordType::MemoryRecovery,
            WalRecord::PartitionDestroy { .. } => RecordType::PartitionDestroy,
            WalRecord::MetastoreData(_) => RecordType::MetastoreData,
            WalRecord::SwitchSegment => RecordType::SwitchSegment,
        }
    }
}
