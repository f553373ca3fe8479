use std::sync::Arc;

use crate::message::{MessageId, StoredMessage};
use crate::paging::PagePosition;

/// Where the body of a referenced message lives.
#[derive(Debug, Clone)]
pub enum Location {
    Memory(Arc<StoredMessage>),
    /// Read from the address's pages at delivery time.
    Paged { position: PagePosition, size: u64 },
}

/// One message instance in a queue.
#[derive(Debug, Clone)]
pub struct Reference {
    /// Queue-local order key, also used as the delivery tag.
    pub seq: u64,
    pub message_id: MessageId,
    pub location: Location,
    /// Deliveries that ended in cancellation or rollback.
    pub delivery_count: u32,
}

impl Reference {
    /// Bytes counted against a consumer's byte credit.
    pub fn size(&self) -> u64 {
        match &self.location {
            Location::Memory(stored) => stored.message().memory_size(),
            Location::Paged { size, .. } => *size,
        }
    }

    pub fn page_position(&self) -> Option<PagePosition> {
        match self.location {
            Location::Paged { position, .. } => Some(position),
            Location::Memory(_) => None,
        }
    }

    /// True when the body is held in memory and marked durable.
    pub fn is_durable_in_memory(&self) -> bool {
        matches!(&self.location, Location::Memory(stored) if stored.message().durable)
    }
}
