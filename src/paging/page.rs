//! Page record layout and page table entries.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;

use crate::codec::{Decoder, Encoder};
use crate::message::{Message, MessageId};
use crate::queue::QueueId;
use crate::storage::MmapFile;
use crate::transaction::TxId;
use crate::{Error, Result};

/// Record kind of a paged message.
pub const PAGE_RECORD_KIND: u16 = 1;

/// Outcome of a transaction as far as its page records are concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PageTxState {
    Prepared,
    Committed,
    RolledBack,
}

/// Routing prefix of a page record, readable without decoding the message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRecordHeader {
    pub tx: Option<TxId>,
    pub message_id: MessageId,
    pub queues: Vec<QueueId>,
}

impl PageRecordHeader {
    pub fn routes_to(&self, queue: QueueId) -> bool {
        self.queues.contains(&queue)
    }
}

/// Payload: `tx | message id | queue count | queue ids | message`.
pub fn encode_page_record(
    out: &mut Vec<u8>,
    tx: Option<TxId>,
    message: &Message,
    queues: &[QueueId],
) -> Result<()> {
    let mut enc = Encoder::new(out);
    enc.put_u64(tx.map_or(0, |tx| tx.0));
    enc.put_u64(message.id.0);
    let count = u16::try_from(queues.len())
        .map_err(|_| Error::Unsupported("too many queues for one message"))?;
    enc.put_u16(count);
    for queue in queues {
        enc.put_u64(queue.0);
    }
    message.encode(&mut enc)
}

/// Exact payload length of [`encode_page_record`] for this message.
pub fn page_record_len(message: &Message, queue_count: usize) -> usize {
    8 + 8 + 2 + 8 * queue_count + message.encoded_len()
}

fn decode_header(dec: &mut Decoder<'_>) -> Result<PageRecordHeader> {
    let tx = dec.get_u64()?;
    let message_id = MessageId(dec.get_u64()?);
    let count = dec.get_u16()?;
    let queues = dec
        .get_u64_list(count as usize)?
        .into_iter()
        .map(QueueId)
        .collect();
    Ok(PageRecordHeader {
        tx: (tx != 0).then_some(TxId(tx)),
        message_id,
        queues,
    })
}

pub fn decode_page_header(payload: &[u8]) -> Result<PageRecordHeader> {
    decode_header(&mut Decoder::new(payload))
}

pub fn decode_page_record(payload: &[u8]) -> Result<(PageRecordHeader, Message)> {
    let mut dec = Decoder::new(payload);
    let header = decode_header(&mut dec)?;
    let message = Message::decode(&mut dec)?;
    if message.id != header.message_id {
        return Err(Error::Corrupt("page record id mismatch"));
    }
    Ok((header, message))
}

/// One page in an address's page table.
#[derive(Debug, Default)]
pub struct PageEntry {
    /// File size in bytes.
    pub size: u64,
    pub message_count: u64,
    /// Queues with records in this page that have not released it yet.
    pub pending_queues: BTreeSet<QueueId>,
    /// Transactions with records in this page.
    pub txs: BTreeSet<TxId>,
    /// Shared read-only view of a sealed page, mapped on first read.
    pub mapping: Option<Arc<MmapFile>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageSummary {
    pub page: u64,
    pub size: u64,
    pub message_count: u64,
    pub pending_queues: Vec<u64>,
    pub active: bool,
}
