//! Segment file lifecycle management.
//!
//! Stateless file operations shared by the journal and by address pages:
//!
//! - Segment file naming and discovery per [`SegmentKind`]
//! - Segment creation, header management and sealing
//! - Record framing reads and torn-tail repair after a crash
//!
//! A segment is a 64-byte header followed by records. Segments are normally
//! sized by configuration, but a segment created for a single oversized
//! record is sized to fit that record, so readers never assume a fixed size.

use std::path::{Path, PathBuf};

use log::warn;

use crate::storage::header::{record_len, RecordHeader, HEADER_SIZE, MAX_PAYLOAD_LEN};
use crate::storage::mmap::MmapFile;
use crate::{Error, Result};

/// Size of segment header
pub const SEG_HEADER_SIZE: usize = 64;

/// Offset where data begins (after header)
pub const SEG_DATA_OFFSET: usize = 64;

/// Segment version
pub const SEG_VERSION: u32 = 1;

/// Flag indicating segment is sealed (immutable)
pub const SEG_FLAG_SEALED: u32 = 1;

/// What a segment directory stores. Decides file extension and header magic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentKind {
    Journal,
    Page,
}

impl SegmentKind {
    pub fn extension(self) -> &'static str {
        match self {
            SegmentKind::Journal => "jrn",
            SegmentKind::Page => "page",
        }
    }

    pub fn magic(self) -> u32 {
        match self {
            // 'SPJ0'
            SegmentKind::Journal => 0x53504A30,
            // 'SPP0'
            SegmentKind::Page => 0x53505030,
        }
    }
}

/// Segment header stored at the beginning of each segment file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    pub magic: u32,
    pub version: u32,
    pub flags: u32,
    pub segment_id: u64,
}

impl SegmentHeader {
    pub fn is_sealed(&self) -> bool {
        self.flags & SEG_FLAG_SEALED != 0
    }
}

// ============================================================================
// Segment Naming
// ============================================================================

/// Generate segment filename from ID (e.g., "000000042.page").
pub fn segment_filename(kind: SegmentKind, id: u64) -> String {
    format!("{:09}.{}", id, kind.extension())
}

pub fn segment_path(root: &Path, kind: SegmentKind, id: u64) -> PathBuf {
    root.join(segment_filename(kind, id))
}

/// Returns segment ID if `name` is a segment file of `kind`, None otherwise.
pub fn parse_segment_filename(kind: SegmentKind, name: &str) -> Option<u64> {
    let base = name.strip_suffix(kind.extension())?.strip_suffix('.')?;

    if base.len() < 9 {
        return None;
    }

    if !base.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    base.parse::<u64>().ok()
}

// ============================================================================
// Segment Discovery
// ============================================================================

/// Discover all segment IDs of `kind` in a directory, sorted ascending.
pub fn discover_segments(dir: &Path, kind: SegmentKind) -> Result<Vec<u64>> {
    let mut segments = Vec::new();

    if !dir.exists() {
        return Ok(segments);
    }

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }

        let path = entry.path();
        let file_name = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name,
            None => continue,
        };

        if let Some(id) = parse_segment_filename(kind, file_name) {
            segments.push(id);
        }
    }

    segments.sort_unstable();
    Ok(segments)
}

/// Returns 0 if no segments exist, otherwise max_id + 1.
pub fn next_segment_id(dir: &Path, kind: SegmentKind) -> Result<u64> {
    let segments = discover_segments(dir, kind)?;
    Ok(segments.last().map_or(0, |&id| id.saturating_add(1)))
}

// ============================================================================
// Segment Creation & Opening
// ============================================================================

/// Validate segment size is within acceptable bounds.
pub fn validate_segment_size(segment_size: u64) -> Result<usize> {
    let size = usize::try_from(segment_size)
        .map_err(|_| Error::Unsupported("segment size exceeds addressable range"))?;

    let min_size = SEG_DATA_OFFSET + HEADER_SIZE; // Header + at least one record
    if size < min_size {
        return Err(Error::Unsupported("segment size too small"));
    }

    Ok(size)
}

/// Create a new segment file at its final path, replacing any leftover file.
pub fn create_segment(root: &Path, kind: SegmentKind, id: u64, segment_size: usize) -> Result<MmapFile> {
    let path = segment_path(root, kind, id);
    let mut mmap = MmapFile::create(&path, segment_size)?;
    write_segment_header(&mut mmap, kind, id, 0)?;
    prefault_mmap(&mut mmap);
    Ok(mmap)
}

/// Open an existing segment file and validate its header.
pub fn open_segment(root: &Path, kind: SegmentKind, id: u64) -> Result<MmapFile> {
    let path = segment_path(root, kind, id);
    let mmap = MmapFile::open(&path)?;

    let header = read_segment_header(&mmap, kind)?;
    if header.segment_id != id {
        return Err(Error::Corrupt("segment id mismatch"));
    }

    Ok(mmap)
}

pub fn remove_segment(root: &Path, kind: SegmentKind, id: u64) -> Result<()> {
    match std::fs::remove_file(segment_path(root, kind, id)) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

// ============================================================================
// Segment Header Management
// ============================================================================

pub fn read_segment_header(mmap: &MmapFile, kind: SegmentKind) -> Result<SegmentHeader> {
    if mmap.len() < SEG_DATA_OFFSET {
        return Err(Error::Corrupt("segment too small for header"));
    }

    let buf = mmap.range(0, SEG_HEADER_SIZE)?;
    let mut word = [0u8; 4];
    let mut read_u32 = |offset: usize| {
        word.copy_from_slice(&buf[offset..offset + 4]);
        u32::from_le_bytes(word)
    };
    let magic = read_u32(0);
    let version = read_u32(4);
    let flags = read_u32(8);
    let mut id = [0u8; 8];
    id.copy_from_slice(&buf[16..24]);
    let segment_id = u64::from_le_bytes(id);

    if magic != kind.magic() {
        return Err(Error::Corrupt("segment magic mismatch"));
    }
    if version != SEG_VERSION {
        return Err(Error::UnsupportedVersion(version));
    }

    Ok(SegmentHeader {
        magic,
        version,
        flags,
        segment_id,
    })
}

pub fn write_segment_header(mmap: &mut MmapFile, kind: SegmentKind, segment_id: u64, flags: u32) -> Result<()> {
    if mmap.len() < SEG_HEADER_SIZE {
        return Err(Error::Corrupt("segment too small for header"));
    }

    let mut buf = [0u8; SEG_HEADER_SIZE];
    buf[0..4].copy_from_slice(&kind.magic().to_le_bytes());
    buf[4..8].copy_from_slice(&SEG_VERSION.to_le_bytes());
    buf[8..12].copy_from_slice(&flags.to_le_bytes());
    buf[16..24].copy_from_slice(&segment_id.to_le_bytes());

    mmap.range_mut(0, SEG_HEADER_SIZE)?.copy_from_slice(&buf);
    Ok(())
}

/// Seal a segment by setting the SEALED flag in its header. Idempotent.
pub fn seal_segment(mmap: &mut MmapFile, kind: SegmentKind) -> Result<()> {
    let header = read_segment_header(mmap, kind)?;

    if header.is_sealed() {
        return Ok(());
    }

    write_segment_header(mmap, kind, header.segment_id, header.flags | SEG_FLAG_SEALED)?;
    Ok(())
}

// ============================================================================
// Record Framing
// ============================================================================

/// A committed record borrowed from a segment mapping.
#[derive(Debug, Clone, Copy)]
pub struct RecordView<'a> {
    pub offset: usize,
    pub header: RecordHeader,
    pub payload: &'a [u8],
    pub next_offset: usize,
}

/// Read the committed record at `offset`.
///
/// Returns `None` at the end of the written region (zero commit word or no
/// room for a header). A record that runs past the mapping or fails its
/// checksum is reported as `Error::Corrupt`.
pub fn read_record(buf: &[u8], offset: usize) -> Result<Option<RecordView<'_>>> {
    if offset < SEG_DATA_OFFSET || offset + HEADER_SIZE > buf.len() {
        return Ok(None);
    }

    let commit_len = RecordHeader::load_commit_len(buf[offset..].as_ptr());
    if commit_len == 0 {
        return Ok(None);
    }

    let payload_len = RecordHeader::payload_len_from_commit(commit_len)?;
    if payload_len > MAX_PAYLOAD_LEN {
        return Err(Error::Corrupt("payload length exceeds max"));
    }

    let len = record_len(payload_len);
    if offset + len > buf.len() {
        return Err(Error::Corrupt("record length out of bounds"));
    }

    let header = RecordHeader::from_bytes(&buf[offset..offset + HEADER_SIZE])?;
    let payload = &buf[offset + HEADER_SIZE..offset + HEADER_SIZE + payload_len];
    header.validate_crc(payload)?;

    Ok(Some(RecordView {
        offset,
        header,
        payload,
        next_offset: offset + len,
    }))
}

/// Outcome of scanning a segment's records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentScan {
    /// Offset just past the last intact record.
    pub end_offset: usize,
    pub records: u64,
    pub last_seq: Option<u64>,
    /// True when a partially written record was found (and zeroed by repair).
    pub torn: bool,
}

pub fn scan_segment(mmap: &MmapFile) -> SegmentScan {
    let buf = mmap.as_slice();
    let mut scan = SegmentScan {
        end_offset: SEG_DATA_OFFSET,
        records: 0,
        last_seq: None,
        torn: false,
    };
    loop {
        match read_record(buf, scan.end_offset) {
            Ok(Some(record)) => {
                scan.records += 1;
                scan.last_seq = Some(record.header.seq);
                scan.end_offset = record.next_offset;
            }
            Ok(None) => return scan,
            Err(_) => {
                scan.torn = true;
                return scan;
            }
        }
    }
}

/// Scan a segment and zero everything after the last intact record.
///
/// Bytes past the intact region can hold a record whose commit word reached
/// disk before its payload did; zeroing them lets the writer resume there.
pub fn repair_segment(mmap: &mut MmapFile, kind: SegmentKind) -> Result<SegmentScan> {
    let scan = scan_segment(mmap);
    if scan.torn {
        let header = read_segment_header(mmap, kind)?;
        warn!(
            "repairing torn tail: kind={:?} segment={} offset={}",
            kind, header.segment_id, scan.end_offset
        );
        let len = mmap.len();
        mmap.range_mut(scan.end_offset, len - scan.end_offset)?.fill(0);
        mmap.flush_sync()?;
    }
    Ok(scan)
}

// ============================================================================
// Memory Prefaulting
// ============================================================================

/// Prefault memory by touching every 4KB page past the header page.
pub fn prefault_mmap(mmap: &mut MmapFile) {
    let slice = mmap.as_mut_slice();
    let len = slice.len();
    let page_size = 4096;

    let mut offset = page_size;
    while offset < len {
        slice[offset] = 0;
        offset += page_size;
    }
}
