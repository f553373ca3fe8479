use std::sync::Mutex;

use crate::journal::{DurableCallback, DurableLog, LogPosition, LogRecord};
use crate::{lock, Error, Result};

/// In-memory log. Every append is immediately "durable"; nothing survives
/// the process.
#[derive(Debug, Default)]
pub struct MemoryJournal {
    records: Mutex<Vec<LogRecord>>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|records| records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DurableLog for MemoryJournal {
    fn append(&self, kind: u16, payload: &[u8]) -> Result<LogPosition> {
        let mut records = lock(&self.records, "memory journal lock poisoned")?;
        let position = LogPosition::new(0, records.len() as u64);
        records.push(LogRecord {
            position,
            kind,
            timestamp_ns: 0,
            payload: payload.to_vec(),
        });
        Ok(position)
    }

    fn read(&self, position: LogPosition, len: usize) -> Result<Vec<u8>> {
        let records = lock(&self.records, "memory journal lock poisoned")?;
        let record = records
            .get(position.offset as usize)
            .filter(|_| position.segment == 0)
            .ok_or(Error::Corrupt("no record at position"))?;
        record
            .payload
            .get(..len)
            .map(<[u8]>::to_vec)
            .ok_or(Error::Corrupt("read past end of record"))
    }

    fn replay(&self, from: LogPosition) -> Result<Vec<LogRecord>> {
        let records = lock(&self.records, "memory journal lock poisoned")?;
        Ok(records
            .iter()
            .filter(|record| record.position >= from)
            .cloned()
            .collect())
    }

    fn sync_to(&self, _position: LogPosition) -> Result<()> {
        Ok(())
    }

    fn on_durable(&self, _position: LogPosition, callback: DurableCallback) {
        callback(Ok(()));
    }

    fn compact(&self, compacted: &[(u16, Vec<u8>)]) -> Result<()> {
        let mut records = lock(&self.records, "memory journal lock poisoned")?;
        *records = compacted
            .iter()
            .enumerate()
            .map(|(idx, (kind, payload))| LogRecord {
                position: LogPosition::new(0, idx as u64),
                kind: *kind,
                timestamp_ns: 0,
                payload: payload.clone(),
            })
            .collect();
        Ok(())
    }

    fn segment_count(&self) -> usize {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::JournalRecord;
    use crate::transaction::TxId;

    #[test]
    fn memory_journal_behaves_like_a_log() {
        let journal = MemoryJournal::new();
        let first = journal.append(1, b"one").unwrap();
        journal.mark_rollback(TxId(2)).unwrap();
        assert_eq!(journal.read(first, 2).unwrap(), b"on");
        assert!(journal.read(first, 10).is_err());

        let records = journal.replay(LogPosition::default()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(
            records[1].decode().unwrap(),
            JournalRecord::Rollback { tx: TxId(2) }
        );

        journal.compact(&[(1, b"kept".to_vec())]).unwrap();
        assert_eq!(journal.len(), 1);
    }
}
