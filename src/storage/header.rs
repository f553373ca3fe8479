//! Record header shared by journal segments and page files.
//!
//! ```text
//! 0  commit word   u32   0 while the record is being written, payload len + 1 after
//! 4  kind          u16   journal record kind or page record kind
//! 6  flags         u16
//! 8  seq           u64   per-file record sequence
//! 16 timestamp_ns  u64
//! 24 crc           u32   CRC32 of the payload
//! 28 reserved      u32
//! ```

use std::sync::atomic::{AtomicU32, Ordering};

use crate::{Error, Result};

pub const HEADER_SIZE: usize = 32;
pub const RECORD_ALIGN: usize = 8;
pub const MAX_PAYLOAD_LEN: usize = u32::MAX as usize - 1;

const KIND_OFFSET: usize = 4;
const FLAGS_OFFSET: usize = 6;
const SEQ_OFFSET: usize = 8;
const TIMESTAMP_OFFSET: usize = 16;
pub const CRC_OFFSET: usize = 24;
const RESERVED_OFFSET: usize = 28;

#[repr(C, align(8))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordHeader {
    pub commit_len: u32,
    pub kind: u16,
    pub flags: u16,
    pub seq: u64,
    pub timestamp_ns: u64,
    pub crc: u32,
    pub reserved: u32,
}

/// Bytes a record with `payload_len` bytes of payload occupies in a file.
#[inline]
pub fn record_len(payload_len: usize) -> usize {
    (HEADER_SIZE + payload_len + RECORD_ALIGN - 1) & !(RECORD_ALIGN - 1)
}

fn field<const N: usize>(bytes: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[offset..offset + N]);
    out
}

impl RecordHeader {
    /// Header of a record whose commit word is published separately.
    pub fn new_uncommitted(seq: u64, timestamp_ns: u64, kind: u16, flags: u16, crc: u32) -> Self {
        Self {
            commit_len: 0,
            kind,
            flags,
            seq,
            timestamp_ns,
            crc,
            reserved: 0,
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        let fields: [(usize, &[u8]); 7] = [
            (0, &self.commit_len.to_le_bytes()),
            (KIND_OFFSET, &self.kind.to_le_bytes()),
            (FLAGS_OFFSET, &self.flags.to_le_bytes()),
            (SEQ_OFFSET, &self.seq.to_le_bytes()),
            (TIMESTAMP_OFFSET, &self.timestamp_ns.to_le_bytes()),
            (CRC_OFFSET, &self.crc.to_le_bytes()),
            (RESERVED_OFFSET, &self.reserved.to_le_bytes()),
        ];
        for (offset, bytes) in fields {
            buf[offset..offset + bytes.len()].copy_from_slice(bytes);
        }
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::Corrupt("record header truncated"));
        }
        Ok(Self {
            commit_len: u32::from_le_bytes(field(bytes, 0)),
            kind: u16::from_le_bytes(field(bytes, KIND_OFFSET)),
            flags: u16::from_le_bytes(field(bytes, FLAGS_OFFSET)),
            seq: u64::from_le_bytes(field(bytes, SEQ_OFFSET)),
            timestamp_ns: u64::from_le_bytes(field(bytes, TIMESTAMP_OFFSET)),
            crc: u32::from_le_bytes(field(bytes, CRC_OFFSET)),
            reserved: u32::from_le_bytes(field(bytes, RESERVED_OFFSET)),
        })
    }

    pub fn commit_len_for_payload(payload_len: usize) -> Result<u32> {
        u32::try_from(payload_len)
            .ok()
            .filter(|_| payload_len <= MAX_PAYLOAD_LEN)
            .map(|len| len + 1)
            .ok_or(Error::PayloadTooLarge)
    }

    pub fn payload_len_from_commit(commit_len: u32) -> Result<usize> {
        commit_len
            .checked_sub(1)
            .map(|len| len as usize)
            .ok_or(Error::Corrupt("record not committed"))
    }

    /// Read the commit word with acquire ordering.
    pub fn load_commit_len(ptr: *const u8) -> u32 {
        // SAFETY: the commit word sits at offset 0 of an 8-byte aligned record.
        let word = unsafe { &*(ptr as *const AtomicU32) };
        word.load(Ordering::Acquire)
    }

    /// Publish a record by storing its commit word with release ordering.
    pub fn store_commit_len(ptr: *mut u8, commit_len: u32) {
        // SAFETY: the commit word sits at offset 0 of an 8-byte aligned record.
        let word = unsafe { &*(ptr as *const AtomicU32) };
        word.store(commit_len, Ordering::Release);
    }

    pub fn crc32(payload: &[u8]) -> u32 {
        crc32fast::hash(payload)
    }

    pub fn validate_crc(&self, payload: &[u8]) -> Result<()> {
        if crc32fast::hash(payload) != self.crc {
            return Err(Error::Corrupt("record crc mismatch"));
        }
        Ok(())
    }
}
