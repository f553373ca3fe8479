//! Broker configuration.
//!
//! Every tuning value (watermarks, page size, journal segment size, group
//! commit interval) lives here rather than in constants scattered across the
//! engine. Configurations load from JSON via serde.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::buffer_pool::{DEFAULT_MAX_BUFFERS, DEFAULT_MAX_BUFFER_CAPACITY};
use crate::storage::{HEADER_SIZE, SEG_DATA_OFFSET};
use crate::{Error, Result};

/// Default high watermark: 10 MiB of in-memory bodies per address.
pub const DEFAULT_MAX_SIZE_BYTES: u64 = 10 * 1024 * 1024;
/// Default page rotation size: 1 MiB.
pub const DEFAULT_PAGE_SIZE_BYTES: usize = 1024 * 1024;
/// Default journal segment size: 10 MiB.
pub const DEFAULT_JOURNAL_SEGMENT_SIZE: usize = 10 * 1024 * 1024;
pub const DEFAULT_DEPAGE_BATCH: usize = 100;
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 2;
pub const DEFAULT_COMPACT_MIN_SEGMENTS: usize = 4;

/// What a producer experiences when an address has exhausted its paging disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum FullPolicy {
    /// Reject the send with `CapacityExceeded` immediately.
    FailFast,
    /// Wait for page deletion to free space; `None` waits indefinitely.
    Block { timeout_ms: Option<u64> },
}

impl Default for FullPolicy {
    fn default() -> Self {
        FullPolicy::FailFast
    }
}

impl FullPolicy {
    pub fn timeout(&self) -> Option<Duration> {
        match self {
            FullPolicy::FailFast => Some(Duration::ZERO),
            FullPolicy::Block { timeout_ms } => timeout_ms.map(Duration::from_millis),
        }
    }
}

/// Paging configuration for one address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AddressSettings {
    /// High watermark. Exceeding it moves the address into paging.
    pub max_size_bytes: u64,
    /// Low watermark. Paging may stop only below this backlog.
    /// `None` means 90% of the high watermark.
    pub low_watermark_bytes: Option<u64>,
    /// Rotation size of a page file.
    pub page_size_bytes: usize,
    /// Upper bound on page bytes kept on disk. `None` is unbounded.
    pub max_disk_bytes: Option<u64>,
    pub full_policy: FullPolicy,
    /// References pulled from the page cursor per depage pass.
    pub depage_batch: usize,
}

impl Default for AddressSettings {
    fn default() -> Self {
        Self {
            max_size_bytes: DEFAULT_MAX_SIZE_BYTES,
            low_watermark_bytes: None,
            page_size_bytes: DEFAULT_PAGE_SIZE_BYTES,
            max_disk_bytes: None,
            full_policy: FullPolicy::default(),
            depage_batch: DEFAULT_DEPAGE_BATCH,
        }
    }
}

impl AddressSettings {
    pub fn low_watermark(&self) -> u64 {
        self.low_watermark_bytes
            .unwrap_or(self.max_size_bytes / 10 * 9)
    }

    pub fn validate(&self) -> Result<()> {
        if self.low_watermark() > self.max_size_bytes {
            return Err(Error::Config(format!(
                "low watermark {} exceeds high watermark {}",
                self.low_watermark(),
                self.max_size_bytes
            )));
        }
        if self.page_size_bytes < SEG_DATA_OFFSET + HEADER_SIZE {
            return Err(Error::Config(format!(
                "page size {} is smaller than one record",
                self.page_size_bytes
            )));
        }
        if self.depage_batch == 0 {
            return Err(Error::Config("depage batch must be non-zero".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalConfig {
    pub segment_size_bytes: usize,
    /// Sync the journal before a commit returns.
    pub sync_transactional: bool,
    /// Sync the journal before a non-transactional durable send returns.
    pub sync_non_transactional: bool,
    /// Group commit period of the background flusher.
    pub flush_interval_ms: u64,
    /// Compact at open once the journal spans this many segments. 0 disables.
    pub compact_min_segments: usize,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            segment_size_bytes: DEFAULT_JOURNAL_SEGMENT_SIZE,
            sync_transactional: true,
            sync_non_transactional: true,
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
            compact_min_segments: DEFAULT_COMPACT_MIN_SEGMENTS,
        }
    }
}

impl JournalConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferPoolConfig {
    pub max_buffers: usize,
    pub max_buffer_capacity: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            max_buffers: DEFAULT_MAX_BUFFERS,
            max_buffer_capacity: DEFAULT_MAX_BUFFER_CAPACITY,
        }
    }
}

/// Top-level broker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Root directory holding `journal/` and `paging/`.
    pub data_dir: PathBuf,
    #[serde(default)]
    pub journal: JournalConfig,
    /// Settings for addresses without an explicit entry.
    #[serde(default)]
    pub default_address: AddressSettings,
    #[serde(default)]
    pub addresses: BTreeMap<String, AddressSettings>,
    #[serde(default)]
    pub buffer_pool: BufferPoolConfig,
}

impl BrokerConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            journal: JournalConfig::default(),
            default_address: AddressSettings::default(),
            addresses: BTreeMap::new(),
            buffer_pool: BufferPoolConfig::default(),
        }
    }

    pub fn with_address(mut self, address: impl Into<String>, settings: AddressSettings) -> Self {
        self.addresses.insert(address.into(), settings);
        self
    }

    pub fn address_settings(&self, address: &str) -> &AddressSettings {
        self.addresses.get(address).unwrap_or(&self.default_address)
    }

    pub fn journal_dir(&self) -> PathBuf {
        self.data_dir.join("journal")
    }

    pub fn paging_dir(&self) -> PathBuf {
        self.data_dir.join("paging")
    }

    pub fn validate(&self) -> Result<()> {
        if self.journal.segment_size_bytes < SEG_DATA_OFFSET + HEADER_SIZE {
            return Err(Error::Config(format!(
                "journal segment size {} is smaller than one record",
                self.journal.segment_size_bytes
            )));
        }
        self.default_address.validate()?;
        for (address, settings) in &self.addresses {
            settings
                .validate()
                .map_err(|err| Error::Config(format!("address {address}: {err}")))?;
        }
        Ok(())
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: BrokerConfig =
            serde_json::from_str(json).map_err(|err| Error::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_settings_default() {
        let settings = AddressSettings::default();
        assert_eq!(settings.max_size_bytes, 10 * 1024 * 1024);
        assert_eq!(settings.low_watermark(), 9 * 1024 * 1024);
        assert_eq!(settings.page_size_bytes, 1024 * 1024);
        assert_eq!(settings.full_policy, FullPolicy::FailFast);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_low_watermark_above_high_rejected() {
        let settings = AddressSettings {
            max_size_bytes: 1000,
            low_watermark_bytes: Some(2000),
            ..AddressSettings::default()
        };
        assert!(matches!(settings.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_tiny_page_rejected() {
        let settings = AddressSettings {
            page_size_bytes: 16,
            ..AddressSettings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_config_from_json() {
        let json = r#"{
            "data_dir": "/var/lib/spillway",
            "journal": { "sync_non_transactional": false },
            "addresses": {
                "orders": {
                    "max_size_bytes": 102400,
                    "page_size_bytes": 10240,
                    "full_policy": { "type": "Block", "timeout_ms": 500 }
                }
            }
        }"#;
        let config = BrokerConfig::from_json(json).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/spillway"));
        assert!(!config.journal.sync_non_transactional);
        assert!(config.journal.sync_transactional);

        let orders = config.address_settings("orders");
        assert_eq!(orders.max_size_bytes, 102400);
        assert_eq!(orders.page_size_bytes, 10240);
        assert_eq!(
            orders.full_policy.timeout(),
            Some(Duration::from_millis(500))
        );
        assert_eq!(orders.depage_batch, DEFAULT_DEPAGE_BATCH);

        let other = config.address_settings("other");
        assert_eq!(other, &AddressSettings::default());
    }

    #[test]
    fn test_invalid_json_is_config_error() {
        let err = BrokerConfig::from_json("{ not json").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
