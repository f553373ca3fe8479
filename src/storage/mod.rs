//! Memory-mapped segment files shared by the journal and by address pages.

pub mod header;
pub mod mmap;
pub mod segment;
pub mod segment_cursor;
pub mod segment_writer;

pub use header::{record_len, RecordHeader, HEADER_SIZE, MAX_PAYLOAD_LEN, RECORD_ALIGN};
pub use mmap::MmapFile;
pub use segment::{
    discover_segments, open_segment, read_record, remove_segment, repair_segment,
    read_segment_header, RecordView, SegmentKind, SegmentScan, SEG_DATA_OFFSET,
};
pub use segment_cursor::{CursorRecord, SegmentCursor};
pub use segment_writer::{AppendedRecord, SegmentWriter};
