//! Read-only snapshots for monitoring.

use serde::Serialize;

use crate::buffer_pool::BufferPoolStats;
use crate::paging::PagingSnapshot;
use crate::transaction::InDoubt;
use crate::Result;

#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub id: u64,
    pub name: String,
    pub address: String,
    pub durable: bool,
    /// Pending, delivering and pending-ack references together.
    pub depth: u64,
    /// Waiting for delivery, in memory or still on the address's pages.
    pub pending: u64,
    /// The part of `pending` whose body lives in a page.
    pub paged: u64,
    pub delivering: u64,
    /// Acknowledged inside a transaction that has not committed yet.
    pub pending_ack: u64,
    pub messages_added: u64,
    pub messages_acked: u64,
    pub consumers: usize,
    pub offline: Option<String>,
    pub deliveries: u64,
    /// Deliveries of a message that had been delivered before.
    pub redeliveries: u64,
    pub max_delivery_count: u64,
    /// `(delivery count, deliveries)` pairs of the delivery-count histogram.
    pub delivery_count_buckets: Vec<(u64, u64)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AddressSnapshot {
    pub address: String,
    pub queues: Vec<String>,
    pub paging: PagingSnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct BrokerSnapshot {
    pub addresses: Vec<AddressSnapshot>,
    pub queues: Vec<QueueSnapshot>,
    pub active_transactions: usize,
    pub in_doubt: Vec<InDoubt>,
    pub journal_segments: usize,
    pub buffer_pool: BufferPoolStats,
    pub next_message_id: u64,
}

impl BrokerSnapshot {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|err| crate::Error::Config(format!("snapshot serialization: {err}")))
    }

    pub fn queue(&self, name: &str) -> Option<&QueueSnapshot> {
        self.queues.iter().find(|queue| queue.name == name)
    }

    pub fn address(&self, address: &str) -> Option<&AddressSnapshot> {
        self.addresses.iter().find(|snapshot| snapshot.address == address)
    }
}
