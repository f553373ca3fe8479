//! Durable operation log.
//!
//! The broker only talks to the [`DurableLog`] trait. [`FileJournal`] keeps
//! records in memory-mapped segments with background group commit;
//! [`MemoryJournal`] keeps them in memory for tests and non-persistent brokers.

pub mod file;
pub mod memory;
pub mod record;

use std::fmt;

use serde::Serialize;

use crate::transaction::TxId;
use crate::Result;

pub use file::FileJournal;
pub use memory::MemoryJournal;
pub use record::JournalRecord;

/// Location of a record in the log. Orders by segment, then offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize)]
pub struct LogPosition {
    pub segment: u64,
    pub offset: u64,
}

impl LogPosition {
    pub fn new(segment: u64, offset: u64) -> Self {
        Self { segment, offset }
    }
}

impl fmt::Display for LogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.segment, self.offset)
    }
}

/// A record returned by [`DurableLog::replay`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub position: LogPosition,
    pub kind: u16,
    pub timestamp_ns: u64,
    pub payload: Vec<u8>,
}

impl LogRecord {
    pub fn decode(&self) -> Result<JournalRecord> {
        JournalRecord::decode(self.kind, &self.payload)
    }
}

/// Invoked once the record at the registered position is durable.
pub type DurableCallback = Box<dyn FnOnce(Result<()>) + Send + 'static>;

pub trait DurableLog: Send + Sync {
    /// Append one record. The record is durable only after a sync covers it.
    fn append(&self, kind: u16, payload: &[u8]) -> Result<LogPosition>;

    /// Read `len` payload bytes of the record at `position`.
    fn read(&self, position: LogPosition, len: usize) -> Result<Vec<u8>>;

    /// Write the commit marker of `tx`. See [`JournalRecord::Commit`] for
    /// `id_shift`.
    fn mark_commit(&self, tx: TxId, id_shift: u64) -> Result<LogPosition> {
        let record = JournalRecord::Commit { tx, id_shift };
        self.append(record.kind(), &record.to_bytes()?)
    }

    fn mark_rollback(&self, tx: TxId) -> Result<LogPosition> {
        let record = JournalRecord::Rollback { tx };
        self.append(record.kind(), &record.to_bytes()?)
    }

    /// All records at or after `from`, in append order.
    fn replay(&self, from: LogPosition) -> Result<Vec<LogRecord>>;

    /// Make every record up to and including `position` durable. Returns
    /// immediately when an earlier sync already covered it.
    fn sync_to(&self, position: LogPosition) -> Result<()>;

    /// Run `callback` once `position` is durable, possibly on another thread.
    fn on_durable(&self, position: LogPosition, callback: DurableCallback);

    /// Replace the whole log with `records` (kind, payload), durably.
    fn compact(&self, records: &[(u16, Vec<u8>)]) -> Result<()>;

    fn segment_count(&self) -> usize;
}
