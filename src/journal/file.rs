//! Segment-backed journal with group commit.
//!
//! Records go through a single [`SegmentWriter`]. Durability is tracked as a
//! high-water position: every record before `synced` is on disk. `sync_to`
//! and the background flusher both advance it, so concurrent committers
//! share one msync.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::JournalConfig;
use crate::journal::{DurableCallback, DurableLog, LogPosition, LogRecord};
use crate::storage::segment::{read_segment_header, scan_segment};
use crate::storage::{
    discover_segments, open_segment, read_record, repair_segment, SegmentCursor, SegmentKind,
    SegmentWriter,
};
use crate::{lock, Error, Result};

const KIND: SegmentKind = SegmentKind::Journal;

struct DurableState {
    /// Every record positioned before this is durable.
    synced: LogPosition,
    waiters: Vec<(LogPosition, DurableCallback)>,
    shutdown: bool,
}

struct Shared {
    dir: PathBuf,
    segment_size: usize,
    clock: Arc<dyn Clock>,
    writer: Mutex<SegmentWriter>,
    durable: Mutex<DurableState>,
    wake: Condvar,
}

pub struct FileJournal {
    shared: Arc<Shared>,
    flusher: Option<JoinHandle<()>>,
}

fn head(writer: &SegmentWriter) -> LogPosition {
    LogPosition::new(writer.segment_id(), writer.write_offset() as u64)
}

fn sibling(dir: &Path, suffix: &str) -> PathBuf {
    let name = dir
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "journal".to_string());
    dir.with_file_name(format!("{name}.{suffix}"))
}

fn io_error_copy(err: &Error) -> Error {
    Error::Io(std::io::Error::new(std::io::ErrorKind::Other, err.to_string()))
}

/// Finish or undo a compaction interrupted by a crash.
///
/// The swap is: write `<dir>.compact`, rename `<dir>` to `<dir>.old`, rename
/// `<dir>.compact` to `<dir>`, remove `<dir>.old`.
fn settle_compaction(dir: &Path) -> Result<()> {
    let compact = sibling(dir, "compact");
    let old = sibling(dir, "old");
    if dir.exists() {
        if compact.exists() {
            warn!("discarding incomplete journal compaction: {}", compact.display());
            std::fs::remove_dir_all(&compact)?;
        }
        if old.exists() {
            std::fs::remove_dir_all(&old)?;
        }
    } else if old.exists() {
        if compact.exists() {
            info!("completing interrupted journal compaction: {}", dir.display());
            std::fs::rename(&compact, dir)?;
            std::fs::remove_dir_all(&old)?;
        } else {
            warn!("restoring journal from {}", old.display());
            std::fs::rename(&old, dir)?;
        }
    }
    Ok(())
}

impl FileJournal {
    /// Open (or create) the journal in `dir`, repairing any torn tail.
    pub fn open(dir: impl Into<PathBuf>, config: &JournalConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let dir = dir.into();
        settle_compaction(&dir)?;
        std::fs::create_dir_all(&dir)?;

        let segments = discover_segments(&dir, KIND)?;
        let mut next_seq = 0u64;
        let mut records = 0u64;
        let mut tail = None;
        for (idx, &id) in segments.iter().enumerate() {
            let mut mmap = open_segment(&dir, KIND, id)?;
            let header = read_segment_header(&mmap, KIND)?;
            let scan = if header.is_sealed() {
                scan_segment(&mmap)
            } else {
                repair_segment(&mut mmap, KIND)?
            };
            records += scan.records;
            if let Some(seq) = scan.last_seq {
                next_seq = next_seq.max(seq + 1);
            }
            if idx + 1 == segments.len() && !header.is_sealed() {
                tail = Some((id, mmap, scan.end_offset));
            }
        }

        let mut writer = match tail {
            Some((id, mmap, end)) => {
                SegmentWriter::resume(&dir, KIND, config.segment_size_bytes, id, mmap, end, next_seq)
            }
            None => {
                let next_id = segments.last().map_or(0, |&id| id + 1);
                SegmentWriter::new(&dir, KIND, next_id, config.segment_size_bytes)
            }
        };
        writer.set_seq(next_seq);

        info!(
            "journal opened: dir={} segments={} records={}",
            dir.display(),
            segments.len(),
            records
        );

        let synced = head(&writer);
        let shared = Arc::new(Shared {
            dir,
            segment_size: config.segment_size_bytes,
            clock,
            writer: Mutex::new(writer),
            durable: Mutex::new(DurableState {
                synced,
                waiters: Vec::new(),
                shutdown: false,
            }),
            wake: Condvar::new(),
        });

        let flusher = {
            let shared = Arc::clone(&shared);
            let interval = config.flush_interval();
            thread::Builder::new()
                .name("spillway-journal-flush".to_string())
                .spawn(move || flush_loop(shared, interval))?
        };

        Ok(Self {
            shared,
            flusher: Some(flusher),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.shared.dir
    }

    /// Position the next appended record will get.
    pub fn head(&self) -> Result<LogPosition> {
        let writer = lock(&self.shared.writer, "journal writer lock poisoned")?;
        Ok(head(&writer))
    }
}

impl Shared {
    fn is_synced(&self, position: LogPosition) -> Result<bool> {
        let durable = lock(&self.durable, "journal durable lock poisoned")?;
        Ok(position < durable.synced)
    }

    /// Sync the active segment and fire callbacks now covered.
    fn sync(&self) -> Result<()> {
        let ready = {
            let writer = lock(&self.writer, "journal writer lock poisoned")?;
            let synced = head(&writer);
            if let Err(err) = writer.sync() {
                drop(writer);
                self.fail_waiters(&err);
                return Err(err);
            }
            let mut durable = lock(&self.durable, "journal durable lock poisoned")?;
            if synced > durable.synced {
                durable.synced = synced;
            }
            let covered = durable.synced;
            let (ready, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut durable.waiters)
                .into_iter()
                .partition(|(position, _)| *position < covered);
            durable.waiters = pending;
            ready
        };
        for (_, callback) in ready {
            callback(Ok(()));
        }
        Ok(())
    }

    fn fail_waiters(&self, err: &Error) {
        let waiters = match self.durable.lock() {
            Ok(mut durable) => std::mem::take(&mut durable.waiters),
            Err(_) => return,
        };
        for (_, callback) in waiters {
            callback(Err(io_error_copy(err)));
        }
    }
}

fn flush_loop(shared: Arc<Shared>, interval: Duration) {
    loop {
        let has_waiters = {
            let guard = match shared.durable.lock() {
                Ok(guard) => guard,
                Err(_) => return,
            };
            let guard = match shared.wake.wait_timeout(guard, interval) {
                Ok((guard, _)) => guard,
                Err(_) => return,
            };
            if guard.shutdown {
                return;
            }
            !guard.waiters.is_empty()
        };
        if has_waiters {
            if let Err(err) = shared.sync() {
                error!("journal group commit failed: {err}");
            }
        }
    }
}

impl DurableLog for FileJournal {
    fn append(&self, kind: u16, payload: &[u8]) -> Result<LogPosition> {
        let mut writer = lock(&self.shared.writer, "journal writer lock poisoned")?;
        let appended = writer.append(kind, 0, self.shared.clock.now(), payload)?;
        Ok(LogPosition::new(appended.segment_id, appended.offset as u64))
    }

    fn read(&self, position: LogPosition, len: usize) -> Result<Vec<u8>> {
        let writer = lock(&self.shared.writer, "journal writer lock poisoned")?;
        let offset = usize::try_from(position.offset)
            .map_err(|_| Error::Corrupt("journal offset out of range"))?;
        let copy = |buf: &[u8]| -> Result<Vec<u8>> {
            let view = read_record(buf, offset)?.ok_or(Error::Corrupt("no record at position"))?;
            view.payload
                .get(..len)
                .map(<[u8]>::to_vec)
                .ok_or(Error::Corrupt("read past end of record"))
        };
        match (writer.active_segment(), writer.mmap()) {
            (Some(active), Some(mmap)) if active == position.segment => copy(mmap.as_slice()),
            _ => {
                let mmap = open_segment(&self.shared.dir, KIND, position.segment)?;
                copy(mmap.as_slice())
            }
        }
    }

    fn replay(&self, from: LogPosition) -> Result<Vec<LogRecord>> {
        let _writer = lock(&self.shared.writer, "journal writer lock poisoned")?;
        let segments = discover_segments(&self.shared.dir, KIND)?;
        let mut cursor = SegmentCursor::open(&self.shared.dir, KIND, segments);
        let offset = usize::try_from(from.offset)
            .map_err(|_| Error::Corrupt("journal offset out of range"))?;
        cursor.seek(from.segment, offset)?;

        let mut records = Vec::new();
        while let Some(record) = cursor.next_record()? {
            records.push(LogRecord {
                position: LogPosition::new(record.segment_id, record.offset as u64),
                kind: record.kind,
                timestamp_ns: record.timestamp_ns,
                payload: record.payload,
            });
        }
        Ok(records)
    }

    fn sync_to(&self, position: LogPosition) -> Result<()> {
        if self.shared.is_synced(position)? {
            return Ok(());
        }
        self.shared.sync()
    }

    fn on_durable(&self, position: LogPosition, callback: DurableCallback) {
        let callback = match self.shared.durable.lock() {
            Ok(mut durable) => {
                if position < durable.synced {
                    Some(callback)
                } else {
                    durable.waiters.push((position, callback));
                    self.shared.wake.notify_one();
                    None
                }
            }
            Err(_) => {
                callback(Err(Error::Corrupt("journal durable lock poisoned")));
                None
            }
        };
        if let Some(callback) = callback {
            callback(Ok(()));
        }
    }

    fn compact(&self, records: &[(u16, Vec<u8>)]) -> Result<()> {
        let mut writer = lock(&self.shared.writer, "journal writer lock poisoned")?;
        writer.sync()?;

        let dir = &self.shared.dir;
        let compact_dir = sibling(dir, "compact");
        let old_dir = sibling(dir, "old");
        if compact_dir.exists() {
            std::fs::remove_dir_all(&compact_dir)?;
        }
        std::fs::create_dir_all(&compact_dir)?;

        let mut compacted = SegmentWriter::new(&compact_dir, KIND, 0, self.shared.segment_size);
        for (kind, payload) in records {
            compacted.append(*kind, 0, self.shared.clock.now(), payload)?;
        }
        compacted.finish()?;
        let next_segment = compacted.segment_id() + 1;
        let next_seq = compacted.seq();

        let before = discover_segments(dir, KIND)?.len();
        std::fs::rename(dir, &old_dir)?;
        std::fs::rename(&compact_dir, dir)?;
        std::fs::remove_dir_all(&old_dir)?;

        let mut replacement = SegmentWriter::new(dir, KIND, next_segment, self.shared.segment_size);
        replacement.set_seq(next_seq);
        let synced = head(&replacement);
        *writer = replacement;

        let waiters = {
            let mut durable = lock(&self.shared.durable, "journal durable lock poisoned")?;
            durable.synced = synced;
            std::mem::take(&mut durable.waiters)
        };
        drop(writer);
        for (_, callback) in waiters {
            callback(Ok(()));
        }

        info!(
            "journal compacted: records={} segments {} -> {}",
            records.len(),
            before,
            self.segment_count()
        );
        Ok(())
    }

    fn segment_count(&self) -> usize {
        discover_segments(&self.shared.dir, KIND)
            .map(|segments| segments.len())
            .unwrap_or(0)
    }
}

impl Drop for FileJournal {
    fn drop(&mut self) {
        if let Ok(mut durable) = self.shared.durable.lock() {
            durable.shutdown = true;
        }
        self.shared.wake.notify_all();
        if let Some(flusher) = self.flusher.take() {
            let _ = flusher.join();
        }
        if let Err(err) = self.shared.sync() {
            warn!("journal sync on close failed: {err}");
        }
        debug!("journal closed: {}", self.shared.dir.display());
    }
}
