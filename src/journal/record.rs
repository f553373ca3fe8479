//! Journal record bodies.
//!
//! Every record is tagged with its kind in the segment record header; the
//! payload holds the fields below, little-endian. Records written under a
//! transaction carry its id and only take effect once a `Commit` record for
//! that id is replayed.

use crate::codec::{Decoder, Encoder};
use crate::message::{Message, MessageId};
use crate::paging::PagePosition;
use crate::queue::QueueId;
use crate::transaction::{TxId, Xid};
use crate::{Error, Result};

pub const KIND_QUEUE_BINDING: u16 = 1;
pub const KIND_ADD_MESSAGE: u16 = 2;
pub const KIND_ACK: u16 = 3;
pub const KIND_PAGE_ACK: u16 = 4;
pub const KIND_DELIVERY_COUNT: u16 = 5;
pub const KIND_PREPARE: u16 = 6;
pub const KIND_COMMIT: u16 = 7;
pub const KIND_ROLLBACK: u16 = 8;
pub const KIND_ID_CHECKPOINT: u16 = 9;

#[derive(Debug, Clone, PartialEq)]
pub enum JournalRecord {
    QueueBinding {
        queue: QueueId,
        address: String,
        name: String,
    },
    /// A message held in memory, with the durable queues it was routed to.
    AddMessage {
        tx: Option<TxId>,
        queues: Vec<QueueId>,
        message: Message,
    },
    Ack {
        tx: Option<TxId>,
        queue: QueueId,
        message: MessageId,
    },
    PageAck {
        tx: Option<TxId>,
        queue: QueueId,
        position: PagePosition,
    },
    DeliveryCount {
        queue: QueueId,
        message: MessageId,
        count: u32,
    },
    Prepare {
        tx: TxId,
        xid: Option<Xid>,
    },
    /// Direct sends of the transaction take `id + id_shift` as their id
    /// from here on, so ids follow commit order.
    Commit {
        tx: TxId,
        id_shift: u64,
    },
    Rollback {
        tx: TxId,
    },
    /// Id allocator state, written by compaction so ids never go backwards.
    IdCheckpoint {
        next_message: u64,
        next_tx: u64,
        next_queue: u64,
    },
}

fn put_tx(enc: &mut Encoder<'_>, tx: Option<TxId>) {
    enc.put_u64(tx.map_or(0, |tx| tx.0));
}

fn get_tx(dec: &mut Decoder<'_>) -> Result<Option<TxId>> {
    let raw = dec.get_u64()?;
    Ok((raw != 0).then_some(TxId(raw)))
}

impl JournalRecord {
    pub fn kind(&self) -> u16 {
        match self {
            JournalRecord::QueueBinding { .. } => KIND_QUEUE_BINDING,
            JournalRecord::AddMessage { .. } => KIND_ADD_MESSAGE,
            JournalRecord::Ack { .. } => KIND_ACK,
            JournalRecord::PageAck { .. } => KIND_PAGE_ACK,
            JournalRecord::DeliveryCount { .. } => KIND_DELIVERY_COUNT,
            JournalRecord::Prepare { .. } => KIND_PREPARE,
            JournalRecord::Commit { .. } => KIND_COMMIT,
            JournalRecord::Rollback { .. } => KIND_ROLLBACK,
            JournalRecord::IdCheckpoint { .. } => KIND_ID_CHECKPOINT,
        }
    }

    /// Transaction this record belongs to, if any.
    pub fn tx(&self) -> Option<TxId> {
        match self {
            JournalRecord::AddMessage { tx, .. }
            | JournalRecord::Ack { tx, .. }
            | JournalRecord::PageAck { tx, .. } => *tx,
            JournalRecord::Prepare { tx, .. }
            | JournalRecord::Commit { tx, .. }
            | JournalRecord::Rollback { tx } => Some(*tx),
            _ => None,
        }
    }

    pub fn encode(&self, out: &mut Vec<u8>) -> Result<()> {
        let mut enc = Encoder::new(out);
        match self {
            JournalRecord::QueueBinding {
                queue,
                address,
                name,
            } => {
                enc.put_u64(queue.0);
                enc.put_utf(address)?;
                enc.put_utf(name)?;
            }
            JournalRecord::AddMessage {
                tx,
                queues,
                message,
            } => {
                put_tx(&mut enc, *tx);
                let count = u16::try_from(queues.len())
                    .map_err(|_| Error::Unsupported("too many queues for one message"))?;
                enc.put_u16(count);
                for queue in queues {
                    enc.put_u64(queue.0);
                }
                message.encode(&mut enc)?;
            }
            JournalRecord::Ack { tx, queue, message } => {
                put_tx(&mut enc, *tx);
                enc.put_u64(queue.0);
                enc.put_u64(message.0);
            }
            JournalRecord::PageAck {
                tx,
                queue,
                position,
            } => {
                put_tx(&mut enc, *tx);
                enc.put_u64(queue.0);
                enc.put_u64(position.page);
                enc.put_u32(position.offset);
            }
            JournalRecord::DeliveryCount {
                queue,
                message,
                count,
            } => {
                enc.put_u64(queue.0);
                enc.put_u64(message.0);
                enc.put_u32(*count);
            }
            JournalRecord::Prepare { tx, xid } => {
                enc.put_u64(tx.0);
                match xid {
                    Some(xid) => {
                        enc.put_bool(true);
                        xid.encode(&mut enc)?;
                    }
                    None => enc.put_bool(false),
                }
            }
            JournalRecord::Commit { tx, id_shift } => {
                enc.put_u64(tx.0);
                enc.put_u64(*id_shift);
            }
            JournalRecord::Rollback { tx } => enc.put_u64(tx.0),
            JournalRecord::IdCheckpoint {
                next_message,
                next_tx,
                next_queue,
            } => {
                enc.put_u64(*next_message);
                enc.put_u64(*next_tx);
                enc.put_u64(*next_queue);
            }
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.encode(&mut out)?;
        Ok(out)
    }

    pub fn decode(kind: u16, payload: &[u8]) -> Result<Self> {
        let mut dec = Decoder::new(payload);
        let record = match kind {
            KIND_QUEUE_BINDING => JournalRecord::QueueBinding {
                queue: QueueId(dec.get_u64()?),
                address: dec.get_utf()?,
                name: dec.get_utf()?,
            },
            KIND_ADD_MESSAGE => {
                let tx = get_tx(&mut dec)?;
                let count = dec.get_u16()?;
                let queues = dec
                    .get_u64_list(count as usize)?
                    .into_iter()
                    .map(QueueId)
                    .collect();
                JournalRecord::AddMessage {
                    tx,
                    queues,
                    message: Message::decode(&mut dec)?,
                }
            }
            KIND_ACK => JournalRecord::Ack {
                tx: get_tx(&mut dec)?,
                queue: QueueId(dec.get_u64()?),
                message: MessageId(dec.get_u64()?),
            },
            KIND_PAGE_ACK => JournalRecord::PageAck {
                tx: get_tx(&mut dec)?,
                queue: QueueId(dec.get_u64()?),
                position: PagePosition {
                    page: dec.get_u64()?,
                    offset: dec.get_u32()?,
                },
            },
            KIND_DELIVERY_COUNT => JournalRecord::DeliveryCount {
                queue: QueueId(dec.get_u64()?),
                message: MessageId(dec.get_u64()?),
                count: dec.get_u32()?,
            },
            KIND_PREPARE => {
                let tx = TxId(dec.get_u64()?);
                let xid = if dec.get_bool()? {
                    Some(Xid::decode(&mut dec)?)
                } else {
                    None
                };
                JournalRecord::Prepare { tx, xid }
            }
            KIND_COMMIT => JournalRecord::Commit {
                tx: TxId(dec.get_u64()?),
                id_shift: dec.get_u64()?,
            },
            KIND_ROLLBACK => JournalRecord::Rollback {
                tx: TxId(dec.get_u64()?),
            },
            KIND_ID_CHECKPOINT => JournalRecord::IdCheckpoint {
                next_message: dec.get_u64()?,
                next_tx: dec.get_u64()?,
                next_queue: dec.get_u64()?,
            },
            _ => return Err(Error::Corrupt("unknown journal record kind")),
        };
        if dec.remaining() != 0 {
            return Err(Error::Corrupt("trailing bytes in journal record"));
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_message_carries_queues_and_body() {
        let mut message = Message::new("orders", b"body".to_vec());
        message.id = MessageId(11);
        let record = JournalRecord::AddMessage {
            tx: Some(TxId(3)),
            queues: vec![QueueId(1), QueueId(2)],
            message,
        };
        let bytes = record.to_bytes().unwrap();
        let decoded = JournalRecord::decode(record.kind(), &bytes).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(decoded.tx(), Some(TxId(3)));
    }

    #[test]
    fn prepare_with_xid() {
        let record = JournalRecord::Prepare {
            tx: TxId(9),
            xid: Some(Xid::new(1, b"global".to_vec(), b"branch".to_vec())),
        };
        let bytes = record.to_bytes().unwrap();
        assert_eq!(JournalRecord::decode(KIND_PREPARE, &bytes).unwrap(), record);
    }

    #[test]
    fn non_transactional_ack_has_no_tx() {
        let record = JournalRecord::Ack {
            tx: None,
            queue: QueueId(4),
            message: MessageId(5),
        };
        let bytes = record.to_bytes().unwrap();
        assert_eq!(JournalRecord::decode(KIND_ACK, &bytes).unwrap().tx(), None);
    }

    #[test]
    fn unknown_kind_and_trailing_bytes_are_corrupt() {
        assert!(matches!(
            JournalRecord::decode(999, &[]),
            Err(Error::Corrupt(_))
        ));
        let mut bytes = JournalRecord::Commit {
            tx: TxId(1),
            id_shift: 0,
        }
        .to_bytes()
        .unwrap();
        bytes.push(0);
        assert!(matches!(
            JournalRecord::decode(KIND_COMMIT, &bytes),
            Err(Error::Corrupt(_))
        ));
    }

    #[test]
    fn commit_keeps_its_id_shift() {
        let record = JournalRecord::Commit {
            tx: TxId(2),
            id_shift: 40,
        };
        let bytes = record.to_bytes().unwrap();
        assert_eq!(bytes.len(), 16);
        assert_eq!(JournalRecord::decode(KIND_COMMIT, &bytes).unwrap(), record);
    }
}
