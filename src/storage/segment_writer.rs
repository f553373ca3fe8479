//! Segment writing primitive.
//!
//! Appends framed records to the active segment and rolls to the next one
//! when it fills. Shared by the journal and by address pages.
//!
//! - Writes `RecordHeader` + payload and publishes the commit word last
//! - Rolls (seal + flush) when a record does not fit
//! - Gives a record larger than the configured segment size its own segment,
//!   sized to fit, and seals it immediately
//! - Resumes writing into a recovered segment after a restart

use std::path::PathBuf;

use crate::storage::header::{record_len, RecordHeader, HEADER_SIZE, MAX_PAYLOAD_LEN};
use crate::storage::mmap::MmapFile;
use crate::storage::segment::{
    create_segment, remove_segment, seal_segment, SegmentKind, SEG_DATA_OFFSET,
};
use crate::{Error, Result};

/// Where an appended record landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendedRecord {
    pub segment_id: u64,
    pub offset: usize,
    pub seq: u64,
    /// Bytes the record occupies including header and alignment.
    pub len: usize,
}

pub struct SegmentWriter {
    dir: PathBuf,
    kind: SegmentKind,
    /// Current segment ID
    segment_id: u64,
    /// Configured segment size in bytes
    segment_size: usize,
    /// Current write offset within segment
    write_offset: usize,
    /// Next sequence number
    seq: u64,
    /// Current segment mmap (None until the first append after a roll)
    mmap: Option<MmapFile>,
    segments_sealed: u64,
    has_records: bool,
}

impl SegmentWriter {
    /// Create a writer starting at `segment_id`. The segment is created lazily
    /// on first append.
    pub fn new(dir: impl Into<PathBuf>, kind: SegmentKind, segment_id: u64, segment_size: usize) -> Self {
        Self {
            dir: dir.into(),
            kind,
            segment_id,
            segment_size,
            write_offset: SEG_DATA_OFFSET,
            seq: 0,
            mmap: None,
            segments_sealed: 0,
            has_records: false,
        }
    }

    /// Continue writing into an existing, repaired segment.
    pub fn resume(
        dir: impl Into<PathBuf>,
        kind: SegmentKind,
        segment_size: usize,
        segment_id: u64,
        mmap: MmapFile,
        write_offset: usize,
        next_seq: u64,
    ) -> Self {
        Self {
            dir: dir.into(),
            kind,
            segment_id,
            segment_size,
            write_offset,
            seq: next_seq,
            mmap: Some(mmap),
            segments_sealed: 0,
            has_records: write_offset > SEG_DATA_OFFSET,
        }
    }

    pub fn segment_id(&self) -> u64 {
        self.segment_id
    }

    /// The segment currently mapped for writing, if any.
    pub fn active_segment(&self) -> Option<u64> {
        self.mmap.as_ref().map(|_| self.segment_id)
    }

    pub fn mmap(&self) -> Option<&MmapFile> {
        self.mmap.as_ref()
    }

    pub fn write_offset(&self) -> usize {
        self.write_offset
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn set_seq(&mut self, seq: u64) {
        self.seq = seq;
    }

    pub fn segment_size(&self) -> usize {
        self.segment_size
    }

    pub fn segments_sealed(&self) -> u64 {
        self.segments_sealed
    }

    pub fn has_records(&self) -> bool {
        self.has_records
    }

    pub fn needs_roll(&self, record_len: usize) -> bool {
        self.write_offset + record_len > self.segment_size
    }

    /// True if a record with this payload gets a dedicated segment.
    pub fn is_oversized(&self, payload_len: usize) -> bool {
        record_len(payload_len) > self.segment_size.saturating_sub(SEG_DATA_OFFSET)
    }

    /// Append a record, rolling first if it does not fit.
    pub fn append(&mut self, kind: u16, flags: u16, timestamp_ns: u64, payload: &[u8]) -> Result<AppendedRecord> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(Error::PayloadTooLarge);
        }
        let len = record_len(payload.len());

        if self.is_oversized(payload.len()) {
            return self.append_oversized(kind, flags, timestamp_ns, payload);
        }

        if self.mmap.is_some() && self.needs_roll(len) {
            self.roll()?;
        }
        self.ensure_segment()?;

        let offset = self.write_offset;
        let seq = self.seq;
        let mmap = self
            .mmap
            .as_mut()
            .ok_or(Error::Corrupt("segment mmap missing"))?;
        write_record(mmap, offset, seq, timestamp_ns, kind, flags, payload)?;

        self.seq = self.seq.wrapping_add(1);
        self.write_offset += len;
        self.has_records = true;

        Ok(AppendedRecord {
            segment_id: self.segment_id,
            offset,
            seq,
            len,
        })
    }

    fn append_oversized(&mut self, kind: u16, flags: u16, timestamp_ns: u64, payload: &[u8]) -> Result<AppendedRecord> {
        if self.mmap.is_some() {
            self.roll()?;
        }

        let len = record_len(payload.len());
        let segment_id = self.segment_id;
        let seq = self.seq;
        let mut mmap = create_segment(&self.dir, self.kind, segment_id, SEG_DATA_OFFSET + len)?;
        write_record(&mut mmap, SEG_DATA_OFFSET, seq, timestamp_ns, kind, flags, payload)?;
        seal_segment(&mut mmap, self.kind)?;
        mmap.flush_sync()?;

        self.seq = self.seq.wrapping_add(1);
        self.segment_id += 1;
        self.segments_sealed += 1;
        self.write_offset = SEG_DATA_OFFSET;
        self.has_records = false;

        Ok(AppendedRecord {
            segment_id,
            offset: SEG_DATA_OFFSET,
            seq,
            len,
        })
    }

    /// Seal the current segment (if it has records) and move to the next ID.
    /// An open segment without records is discarded.
    pub fn roll(&mut self) -> Result<()> {
        if let Some(mut mmap) = self.mmap.take() {
            if self.has_records {
                seal_segment(&mut mmap, self.kind)?;
                mmap.flush_sync()?;
                self.segments_sealed += 1;
            } else {
                drop(mmap);
                remove_segment(&self.dir, self.kind, self.segment_id)?;
            }
        }

        self.segment_id += 1;
        self.write_offset = SEG_DATA_OFFSET;
        self.has_records = false;
        Ok(())
    }

    /// Flush written records of the active segment to disk.
    pub fn sync(&self) -> Result<()> {
        if let Some(mmap) = &self.mmap {
            mmap.flush_sync()?;
        }
        Ok(())
    }

    /// Seal the current segment; an empty one is removed.
    pub fn finish(&mut self) -> Result<()> {
        if let Some(mut mmap) = self.mmap.take() {
            if self.has_records {
                seal_segment(&mut mmap, self.kind)?;
                mmap.flush_sync()?;
                self.segments_sealed += 1;
            } else {
                drop(mmap);
                remove_segment(&self.dir, self.kind, self.segment_id)?;
            }
        }
        Ok(())
    }

    fn ensure_segment(&mut self) -> Result<()> {
        if self.mmap.is_some() {
            return Ok(());
        }

        let mmap = create_segment(&self.dir, self.kind, self.segment_id, self.segment_size)?;
        self.write_offset = SEG_DATA_OFFSET;
        self.has_records = false;
        self.mmap = Some(mmap);
        Ok(())
    }
}

fn write_record(
    mmap: &mut MmapFile,
    offset: usize,
    seq: u64,
    timestamp_ns: u64,
    kind: u16,
    flags: u16,
    payload: &[u8],
) -> Result<()> {
    if !payload.is_empty() {
        mmap.range_mut(offset + HEADER_SIZE, payload.len())?
            .copy_from_slice(payload);
    }

    let header = RecordHeader::new_uncommitted(seq, timestamp_ns, kind, flags, RecordHeader::crc32(payload));
    mmap.range_mut(offset, HEADER_SIZE)?
        .copy_from_slice(&header.to_bytes());

    let commit_len = RecordHeader::commit_len_for_payload(payload.len())?;
    let header_ptr = mmap.range_mut(offset, HEADER_SIZE)?.as_mut_ptr();
    RecordHeader::store_commit_len(header_ptr, commit_len);
    Ok(())
}
