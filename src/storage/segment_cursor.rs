//! Sequential reading across segments.
//!
//! - Opens segments lazily, in ID order
//! - Stops a segment at its first uncommitted record and moves on
//! - Skips segments removed underneath it

use std::path::PathBuf;

use crate::storage::mmap::MmapFile;
use crate::storage::segment::{open_segment, read_record, segment_path, SegmentKind, SEG_DATA_OFFSET};
use crate::{Error, Result};

/// A record copied out of a segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorRecord {
    pub segment_id: u64,
    pub offset: usize,
    pub kind: u16,
    pub flags: u16,
    pub seq: u64,
    pub timestamp_ns: u64,
    pub payload: Vec<u8>,
}

pub struct SegmentCursor {
    dir: PathBuf,
    kind: SegmentKind,
    /// Sorted segment IDs to read
    segments: Vec<u64>,
    current_segment_idx: usize,
    current_mmap: Option<MmapFile>,
    offset: usize,
}

impl SegmentCursor {
    pub fn open(dir: impl Into<PathBuf>, kind: SegmentKind, segments: Vec<u64>) -> Self {
        Self {
            dir: dir.into(),
            kind,
            segments,
            current_segment_idx: 0,
            current_mmap: None,
            offset: SEG_DATA_OFFSET,
        }
    }

    pub fn current_segment_id(&self) -> Option<u64> {
        self.segments.get(self.current_segment_idx).copied()
    }

    pub fn current_offset(&self) -> usize {
        self.offset
    }

    /// Read the next committed record, or `None` once all segments are exhausted.
    pub fn next_record(&mut self) -> Result<Option<CursorRecord>> {
        loop {
            if self.current_mmap.is_none() && !self.load_next_segment()? {
                return Ok(None);
            }

            let segment_id = self
                .current_segment_id()
                .ok_or(Error::Corrupt("cursor segment missing"))?;
            let mmap = self
                .current_mmap
                .as_ref()
                .ok_or(Error::Corrupt("cursor mmap missing"))?;

            match read_record(mmap.as_slice(), self.offset)? {
                Some(view) => {
                    self.offset = view.next_offset;
                    return Ok(Some(CursorRecord {
                        segment_id,
                        offset: view.offset,
                        kind: view.header.kind,
                        flags: view.header.flags,
                        seq: view.header.seq,
                        timestamp_ns: view.header.timestamp_ns,
                        payload: view.payload.to_vec(),
                    }));
                }
                None => self.advance_segment(),
            }
        }
    }

    /// Position the cursor at `offset` inside `segment_id`. A segment ID not in
    /// the list positions the cursor at the first later segment.
    pub fn seek(&mut self, segment_id: u64, offset: usize) -> Result<()> {
        let idx = self.segments.partition_point(|&id| id < segment_id);
        self.current_segment_idx = idx;
        self.current_mmap = None;
        if self.current_segment_id() == Some(segment_id) {
            if self.load_next_segment()? && self.current_segment_id() == Some(segment_id) {
                self.offset = offset.max(SEG_DATA_OFFSET);
            }
        } else {
            self.offset = SEG_DATA_OFFSET;
        }
        Ok(())
    }

    fn load_next_segment(&mut self) -> Result<bool> {
        while self.current_segment_idx < self.segments.len() {
            let segment_id = self.segments[self.current_segment_idx];
            if !segment_path(&self.dir, self.kind, segment_id).exists() {
                self.current_segment_idx += 1;
                continue;
            }
            self.current_mmap = Some(open_segment(&self.dir, self.kind, segment_id)?);
            self.offset = SEG_DATA_OFFSET;
            return Ok(true);
        }
        Ok(false)
    }

    fn advance_segment(&mut self) {
        self.current_segment_idx += 1;
        self.current_mmap = None;
        self.offset = SEG_DATA_OFFSET;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::segment::discover_segments;
    use crate::storage::segment_writer::SegmentWriter;
    use tempfile::TempDir;

    #[test]
    fn test_cursor_reads_in_order_across_segments() {
        let dir = TempDir::new().unwrap();
        let mut writer = SegmentWriter::new(dir.path(), SegmentKind::Journal, 0, 4096);
        let payload = vec![1u8; 500];
        for i in 0..20u64 {
            writer.append(i as u16, 0, i, &payload).unwrap();
        }
        writer.sync().unwrap();

        let segments = discover_segments(dir.path(), SegmentKind::Journal).unwrap();
        assert!(segments.len() > 1);

        let mut cursor = SegmentCursor::open(dir.path(), SegmentKind::Journal, segments);
        let mut seen = Vec::new();
        while let Some(record) = cursor.next_record().unwrap() {
            assert_eq!(record.payload.len(), 500);
            seen.push(record.seq);
        }
        assert_eq!(seen, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_cursor_seek() {
        let dir = TempDir::new().unwrap();
        let mut writer = SegmentWriter::new(dir.path(), SegmentKind::Journal, 0, 4096);
        writer.append(1, 0, 0, b"seg0-a").unwrap();
        let second = writer.append(1, 0, 0, b"seg0-b").unwrap();
        writer.roll().unwrap();
        writer.append(2, 0, 0, b"seg1").unwrap();
        writer.sync().unwrap();

        let segments = discover_segments(dir.path(), SegmentKind::Journal).unwrap();
        let mut cursor = SegmentCursor::open(dir.path(), SegmentKind::Journal, segments);

        cursor.seek(0, second.offset).unwrap();
        assert_eq!(cursor.next_record().unwrap().unwrap().payload, b"seg0-b");
        assert_eq!(cursor.next_record().unwrap().unwrap().payload, b"seg1");
        assert!(cursor.next_record().unwrap().is_none());

        cursor.seek(1, SEG_DATA_OFFSET).unwrap();
        let record = cursor.next_record().unwrap().unwrap();
        assert_eq!(record.kind, 2);
        assert_eq!(record.segment_id, 1);
    }

    #[test]
    fn test_cursor_empty_segments_list() {
        let dir = TempDir::new().unwrap();
        let mut cursor = SegmentCursor::open(dir.path(), SegmentKind::Page, vec![]);
        assert!(cursor.next_record().unwrap().is_none());
    }
}
