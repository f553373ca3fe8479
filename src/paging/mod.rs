//! Address paging.
//!
//! When an address's in-memory backlog crosses its high watermark, newly
//! routed messages are appended to the address's page files instead of being
//! held in memory. Each bound queue reads the pages back through its own
//! cursor, in page order, as it drains. A page file is deleted once every
//! queue with records in it has moved past it and acknowledged them.

pub mod cursor;
pub mod page;
pub mod store;

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::Result;

pub use cursor::{Disposition, QueueCursor};
pub use page::{PageSummary, PageTxState};
pub use store::{Depaged, PagedRecord, PagingSnapshot, PagingStore, StoreGuard};

/// File inside an address's paging directory naming the address.
pub const ADDRESS_FILE: &str = "address";

/// Location of a record in an address's pages. Orders by page, then offset.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct PagePosition {
    pub page: u64,
    pub offset: u32,
}

impl PagePosition {
    pub fn new(page: u64, offset: u32) -> Self {
        Self { page, offset }
    }
}

impl fmt::Display for PagePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.page, self.offset)
    }
}

/// Paging directory of `address` under `root`.
///
/// Address names may hold path separators, so the directory name keeps only
/// portable characters and appends a checksum of the full name.
pub fn address_dir(root: &Path, address: &str) -> PathBuf {
    let safe: String = address
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    root.join(format!("{safe}-{:08x}", crc32fast::hash(address.as_bytes())))
}

/// Every address with a paging directory under `root`, with that directory.
pub fn discover_address_dirs(root: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut found = Vec::new();
    if !root.exists() {
        return Ok(found);
    }
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let path = entry.path();
        match fs::read_to_string(path.join(ADDRESS_FILE)) {
            Ok(address) => found.push((address, path)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
            Err(err) => return Err(err.into()),
        }
    }
    found.sort();
    Ok(found)
}
