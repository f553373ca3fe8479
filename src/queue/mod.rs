//! Queues: ordered references, consumers, acknowledgement and cancellation.
//!
//! A [`Queue`] is the single mutation point for its references. It never
//! touches page files itself; the broker depages into it and reads paged
//! bodies after the queue lock is released.

pub mod consumer;
pub mod reference;
pub mod table;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Instant;

use hdrhistogram::Histogram;
use log::error;
use serde::{Deserialize, Serialize};

use crate::management::QueueSnapshot;
use crate::message::{MessageId, StoredMessage};
use crate::paging::{PagePosition, PagedRecord};
use crate::session::SessionId;
use crate::transaction::TxId;
use crate::{Error, Result};

pub use consumer::Credit;
pub use reference::{Location, Reference};
pub use table::ReferenceTable;

use consumer::ConsumerState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct QueueId(pub u64);

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConsumerId(pub u64);

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A reference handed to a consumer.
#[derive(Debug, Clone)]
pub struct Taken {
    pub tag: u64,
    pub message_id: MessageId,
    pub location: Location,
    /// Including this delivery.
    pub delivery_count: u32,
}

/// Result of polling a queue for a consumer.
#[derive(Debug)]
pub enum Poll {
    Ready(Taken),
    /// The table is running low and the pages hold more for this queue.
    Depage,
    /// Nothing deliverable; wait for the generation to move past this value.
    Wait(u64),
}

/// What an acknowledgement or cancellation released, for journaling and page
/// bookkeeping outside the queue lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Released {
    pub tag: u64,
    pub message_id: MessageId,
    pub page: Option<PagePosition>,
    /// Body is held in memory and durable.
    pub durable: bool,
    pub delivery_count: u32,
}

impl Released {
    fn of(reference: &Reference) -> Self {
        Self {
            tag: reference.seq,
            message_id: reference.message_id,
            page: reference.page_position(),
            durable: reference.is_durable_in_memory(),
            delivery_count: reference.delivery_count,
        }
    }
}

#[derive(Debug)]
struct InFlight {
    reference: Reference,
    /// `None` once the consumer is gone or for references restored at
    /// recovery.
    consumer: Option<ConsumerId>,
    /// Set when acknowledged inside a transaction.
    tx: Option<TxId>,
    /// Size still charged to the consumer's credit.
    charged: Option<u64>,
}

pub struct Queue {
    id: QueueId,
    name: String,
    address: String,
    durable: bool,
    depage_batch: usize,
    state: Mutex<QueueState>,
    changed: Condvar,
}

struct QueueState {
    table: ReferenceTable,
    delivering: BTreeMap<u64, InFlight>,
    consumers: BTreeMap<ConsumerId, ConsumerState>,
    next_seq: u64,
    /// Bumped on every change a waiting receiver may care about.
    generation: u64,
    /// The address's pages hold records for this queue.
    paged_pending: bool,
    offline: Option<String>,
    delivery_counts: Histogram<u64>,
    messages_added: u64,
    messages_acked: u64,
}

impl QueueState {
    fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn bump(&mut self) {
        self.generation = self.generation.wrapping_add(1);
    }

    fn give_back(&mut self, inflight: &mut InFlight) {
        if let (Some(size), Some(consumer)) = (inflight.charged.take(), inflight.consumer) {
            if let Some(state) = self.consumers.get_mut(&consumer) {
                state.give_back(size);
            }
        }
    }

    /// Take in-flight references back and merge them at the head.
    fn cancel(&mut self, tags: &[u64]) -> Vec<Released> {
        let mut returned = Vec::with_capacity(tags.len());
        let mut released = Vec::with_capacity(tags.len());
        for tag in tags {
            let Some(mut inflight) = self.delivering.remove(tag) else {
                continue;
            };
            self.give_back(&mut inflight);
            let mut reference = inflight.reference;
            reference.delivery_count = reference.delivery_count.saturating_add(1);
            released.push(Released::of(&reference));
            returned.push(reference);
        }
        if !returned.is_empty() {
            self.table.reinsert(returned);
            self.bump();
        }
        released
    }
}

impl Queue {
    pub fn new(
        id: QueueId,
        name: impl Into<String>,
        address: impl Into<String>,
        durable: bool,
        depage_batch: usize,
    ) -> Result<Self> {
        let delivery_counts = Histogram::new_with_bounds(1, u64::from(u32::MAX), 2)
            .map_err(|err| Error::Config(format!("delivery histogram: {err}")))?;
        Ok(Self {
            id,
            name: name.into(),
            address: address.into(),
            durable,
            depage_batch,
            state: Mutex::new(QueueState {
                table: ReferenceTable::new(),
                delivering: BTreeMap::new(),
                consumers: BTreeMap::new(),
                next_seq: 0,
                generation: 0,
                paged_pending: false,
                offline: None,
                delivery_counts,
                messages_added: 0,
                messages_acked: 0,
            }),
            changed: Condvar::new(),
        })
    }

    pub fn id(&self) -> QueueId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    fn lock(&self) -> Result<MutexGuard<'_, QueueState>> {
        self.state
            .lock()
            .map_err(|_| Error::Corrupt("queue lock poisoned"))
    }

    fn notify(&self, state: &mut QueueState) {
        state.bump();
        self.changed.notify_all();
    }

    fn unknown_delivery(&self, tag: u64) -> Error {
        Error::UnknownDelivery {
            queue: self.name.clone(),
            tag,
        }
    }

    /// Append in-memory messages at the tail, visible at once.
    pub fn enqueue(&self, messages: &[Arc<StoredMessage>]) -> Result<()> {
        let mut state = self.lock()?;
        for stored in messages {
            let seq = state.next_seq();
            state.table.push_back(Reference {
                seq,
                message_id: stored.message().id,
                location: Location::Memory(Arc::clone(stored)),
                delivery_count: 0,
            });
        }
        state.messages_added += messages.len() as u64;
        self.notify(&mut state);
        Ok(())
    }

    /// Restore a recovered reference at the tail.
    pub fn restore(&self, message_id: MessageId, location: Location, delivery_count: u32) -> Result<()> {
        let mut state = self.lock()?;
        let seq = state.next_seq();
        state.table.push_back(Reference {
            seq,
            message_id,
            location,
            delivery_count,
        });
        state.messages_added += 1;
        Ok(())
    }

    /// Restore a reference acknowledged by a prepared transaction. It stays
    /// out of delivery until that transaction is resolved.
    pub fn restore_pending_ack(
        &self,
        message_id: MessageId,
        location: Location,
        delivery_count: u32,
        tx: TxId,
    ) -> Result<u64> {
        let mut state = self.lock()?;
        let seq = state.next_seq();
        state.delivering.insert(
            seq,
            InFlight {
                reference: Reference {
                    seq,
                    message_id,
                    location,
                    delivery_count,
                },
                consumer: None,
                tx: Some(tx),
                charged: None,
            },
        );
        state.messages_added += 1;
        Ok(seq)
    }

    /// Append depaged records at the tail.
    pub fn add_paged(&self, records: &[PagedRecord], more: bool) -> Result<()> {
        let mut state = self.lock()?;
        for record in records {
            let seq = state.next_seq();
            state.table.push_back(Reference {
                seq,
                message_id: record.message_id,
                location: Location::Paged {
                    position: record.position,
                    size: record.size,
                },
                delivery_count: 0,
            });
        }
        state.messages_added += records.len() as u64;
        state.paged_pending = more;
        self.notify(&mut state);
        Ok(())
    }

    /// The address paged a message for this queue.
    pub fn set_paged_pending(&self) -> Result<()> {
        let mut state = self.lock()?;
        if !state.paged_pending {
            state.paged_pending = true;
        }
        self.notify(&mut state);
        Ok(())
    }

    pub fn add_consumer(&self, id: ConsumerId, session: SessionId, credit: Credit) -> Result<()> {
        let mut state = self.lock()?;
        state.consumers.insert(id, ConsumerState::new(id, session, credit));
        Ok(())
    }

    pub fn set_credit(&self, id: ConsumerId, credit: Credit) -> Result<()> {
        let mut state = self.lock()?;
        let consumer = state
            .consumers
            .get_mut(&id)
            .ok_or(Error::UnknownConsumer(id.0))?;
        consumer.credit = credit;
        self.notify(&mut state);
        Ok(())
    }

    /// Remove a consumer, cancelling what it holds unacknowledged.
    /// References it acknowledged inside a transaction stay pending-ack.
    pub fn remove_consumer(&self, id: ConsumerId) -> Result<Vec<Released>> {
        let mut state = self.lock()?;
        let tags: Vec<u64> = state
            .delivering
            .iter()
            .filter(|(_, inflight)| inflight.consumer == Some(id) && inflight.tx.is_none())
            .map(|(&tag, _)| tag)
            .collect();
        let released = state.cancel(&tags);
        for inflight in state.delivering.values_mut() {
            if inflight.consumer == Some(id) {
                inflight.consumer = None;
                inflight.charged = None;
            }
        }
        state.consumers.remove(&id);
        self.notify(&mut state);
        Ok(released)
    }

    /// Cancel every unacknowledged delivery of `session`'s consumers.
    pub fn cancel_session(&self, session: SessionId) -> Result<Vec<Released>> {
        let mut state = self.lock()?;
        let tags: Vec<u64> = state
            .delivering
            .iter()
            .filter(|(_, inflight)| {
                inflight.tx.is_none()
                    && inflight.consumer.is_some_and(|consumer| {
                        state
                            .consumers
                            .get(&consumer)
                            .is_some_and(|c| c.session == session)
                    })
            })
            .map(|(&tag, _)| tag)
            .collect();
        let released = state.cancel(&tags);
        if !released.is_empty() {
            self.changed.notify_all();
        }
        Ok(released)
    }

    /// True when the broker should depage before delivering.
    pub fn needs_depage(&self) -> Result<bool> {
        let state = self.lock()?;
        Ok(state.offline.is_none()
            && state.paged_pending
            && state.table.len() < self.depage_batch)
    }

    /// Hand the head reference to `consumer` if its credit allows.
    pub fn poll(&self, consumer: ConsumerId) -> Result<Poll> {
        let mut state = self.lock()?;
        if let Some(reason) = &state.offline {
            return Err(Error::QueueOffline {
                queue: self.name.clone(),
                reason: reason.clone(),
            });
        }
        if state.paged_pending && state.table.len() < self.depage_batch {
            return Ok(Poll::Depage);
        }
        let Some(size) = state.table.front().map(Reference::size) else {
            return Ok(Poll::Wait(state.generation));
        };
        let has_credit = state
            .consumers
            .get(&consumer)
            .ok_or(Error::UnknownConsumer(consumer.0))?
            .has_credit(size);
        if !has_credit {
            return Ok(Poll::Wait(state.generation));
        }
        let Some(reference) = state.table.pop_front() else {
            return Ok(Poll::Wait(state.generation));
        };
        if let Some(consumer) = state.consumers.get_mut(&consumer) {
            consumer.take(size);
        }
        let delivery_count = reference.delivery_count.saturating_add(1);
        state
            .delivery_counts
            .saturating_record(u64::from(delivery_count));
        let taken = Taken {
            tag: reference.seq,
            message_id: reference.message_id,
            location: reference.location.clone(),
            delivery_count,
        };
        state.delivering.insert(
            reference.seq,
            InFlight {
                reference,
                consumer: Some(consumer),
                tx: None,
                charged: Some(size),
            },
        );
        Ok(Poll::Ready(taken))
    }

    /// Block until the queue changes past `generation` or `deadline` passes.
    /// Returns false on timeout.
    pub fn wait_for_change(&self, generation: u64, deadline: Option<Instant>) -> Result<bool> {
        let mut state = self.lock()?;
        loop {
            if state.generation != generation {
                return Ok(true);
            }
            state = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(false);
                    }
                    self.changed
                        .wait_timeout(state, deadline - now)
                        .map_err(|_| Error::Corrupt("queue lock poisoned"))?
                        .0
                }
                None => self
                    .changed
                    .wait(state)
                    .map_err(|_| Error::Corrupt("queue lock poisoned"))?,
            };
        }
    }

    /// Wake receivers without changing state, e.g. on shutdown.
    pub fn wake(&self) -> Result<()> {
        let mut state = self.lock()?;
        self.notify(&mut state);
        Ok(())
    }

    /// Acknowledge a delivery. Without a transaction the reference is
    /// removed at once; inside one it stays pending-ack until commit.
    /// Either way the consumer's credit is replenished.
    pub fn acknowledge(&self, tag: u64, tx: Option<TxId>) -> Result<Released> {
        let mut state = self.lock()?;
        let mut inflight = match state.delivering.remove(&tag) {
            Some(inflight) if inflight.tx.is_none() => inflight,
            Some(inflight) => {
                state.delivering.insert(tag, inflight);
                return Err(self.unknown_delivery(tag));
            }
            None => return Err(self.unknown_delivery(tag)),
        };
        state.give_back(&mut inflight);
        let released = Released::of(&inflight.reference);
        match tx {
            Some(tx) => {
                inflight.tx = Some(tx);
                state.delivering.insert(tag, inflight);
            }
            None => state.messages_acked += 1,
        }
        self.notify(&mut state);
        Ok(released)
    }

    /// Remove references acknowledged by a committed transaction.
    pub fn commit_acks(&self, tags: &[u64]) -> Result<Vec<Released>> {
        let mut state = self.lock()?;
        let mut released = Vec::with_capacity(tags.len());
        for tag in tags {
            if let Some(inflight) = state.delivering.remove(tag) {
                released.push(Released::of(&inflight.reference));
                state.messages_acked += 1;
            }
        }
        Ok(released)
    }

    /// Return deliveries to the head of the queue, in original order.
    pub fn cancel(&self, tags: &[u64]) -> Result<Vec<Released>> {
        let mut state = self.lock()?;
        let released = state.cancel(tags);
        if !released.is_empty() {
            self.changed.notify_all();
        }
        Ok(released)
    }

    /// Cancel one delivery held by `consumer` outside a transaction.
    pub fn cancel_delivery(&self, consumer: ConsumerId, tag: u64) -> Result<Released> {
        let mut state = self.lock()?;
        let owned = state
            .delivering
            .get(&tag)
            .is_some_and(|inflight| inflight.consumer == Some(consumer) && inflight.tx.is_none());
        if !owned {
            return Err(self.unknown_delivery(tag));
        }
        let released = state.cancel(&[tag]);
        self.changed.notify_all();
        released
            .into_iter()
            .next()
            .ok_or_else(|| self.unknown_delivery(tag))
    }

    /// The delivery `tag` is held by `consumer`, unacknowledged.
    pub fn owns(&self, consumer: ConsumerId, tag: u64) -> Result<bool> {
        let state = self.lock()?;
        Ok(state
            .delivering
            .get(&tag)
            .is_some_and(|inflight| inflight.consumer == Some(consumer) && inflight.tx.is_none()))
    }

    /// Pending-ack tags held by `tx`.
    pub fn pending_acks(&self, tx: TxId) -> Result<Vec<u64>> {
        let state = self.lock()?;
        Ok(state
            .delivering
            .iter()
            .filter(|(_, inflight)| inflight.tx == Some(tx))
            .map(|(&tag, _)| tag)
            .collect())
    }

    /// Take the queue offline after an unrecoverable ordering failure.
    pub fn set_offline(&self, reason: impl Into<String>) -> Result<()> {
        let reason = reason.into();
        error!("queue {} taken offline: {}", self.name, reason);
        let mut state = self.lock()?;
        state.offline = Some(reason);
        self.notify(&mut state);
        Ok(())
    }

    pub fn offline(&self) -> Result<Option<String>> {
        Ok(self.lock()?.offline.clone())
    }

    /// Memory references in the table and in flight, for journal compaction.
    pub fn live_messages(&self) -> Result<Vec<(MessageId, u32)>> {
        let state = self.lock()?;
        Ok(state
            .table
            .iter()
            .chain(state.delivering.values().map(|inflight| &inflight.reference))
            .filter(|reference| reference.is_durable_in_memory())
            .map(|reference| (reference.message_id, reference.delivery_count))
            .collect())
    }

    pub fn snapshot(&self, paged_unread: u64) -> Result<QueueSnapshot> {
        let state = self.lock()?;
        let pending_ack = state
            .delivering
            .values()
            .filter(|inflight| inflight.tx.is_some())
            .count() as u64;
        let delivering = state.delivering.len() as u64 - pending_ack;
        let pending = state.table.len() as u64 + paged_unread;
        let histogram = &state.delivery_counts;
        Ok(QueueSnapshot {
            id: self.id.0,
            name: self.name.clone(),
            address: self.address.clone(),
            durable: self.durable,
            depth: pending + delivering + pending_ack,
            pending,
            paged: state.table.paged_count() as u64 + paged_unread,
            delivering,
            pending_ack,
            messages_added: state.messages_added,
            messages_acked: state.messages_acked,
            consumers: state.consumers.len(),
            offline: state.offline.clone(),
            deliveries: histogram.len(),
            redeliveries: histogram.count_between(2, histogram.max().max(2)),
            max_delivery_count: histogram.max(),
            delivery_count_buckets: histogram
                .iter_recorded()
                .map(|value| (value.value_iterated_to(), value.count_at_value()))
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU64;
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::message::Message;

    fn stored(id: u64) -> Arc<StoredMessage> {
        let mut message = Message::new("orders", vec![0u8; 16]);
        message.id = MessageId(id);
        Arc::new(StoredMessage::new(message, Arc::new(AtomicU64::new(0))))
    }

    fn queue() -> Queue {
        let queue = Queue::new(QueueId(1), "orders.q", "orders", true, 10).unwrap();
        queue
            .add_consumer(ConsumerId(1), SessionId(1), Credit::unlimited())
            .unwrap();
        queue
    }

    fn take(queue: &Queue) -> Taken {
        match queue.poll(ConsumerId(1)).unwrap() {
            Poll::Ready(taken) => taken,
            other => panic!("expected a delivery, got {other:?}"),
        }
    }

    #[test]
    fn cancel_restores_original_order() {
        let queue = queue();
        queue
            .enqueue(&(1..=5).map(stored).collect::<Vec<_>>())
            .unwrap();
        let first: Vec<Taken> = (0..3).map(|_| take(&queue)).collect();
        queue.enqueue(&[stored(6)]).unwrap();

        let tags: Vec<u64> = first.iter().rev().map(|taken| taken.tag).collect();
        let released = queue.cancel(&tags).unwrap();
        assert_eq!(released.len(), 3);

        let again: Vec<(u64, u32)> = (0..6)
            .map(|_| take(&queue))
            .map(|taken| (taken.message_id.0, taken.delivery_count))
            .collect();
        assert_eq!(again, vec![(1, 2), (2, 2), (3, 2), (4, 1), (5, 1), (6, 1)]);

        let snapshot = queue.snapshot(0).unwrap();
        assert_eq!(snapshot.redeliveries, 3);
        assert_eq!(snapshot.delivering, 6);
    }

    #[test]
    fn transactional_ack_holds_reference_until_commit() {
        let queue = queue();
        queue.enqueue(&[stored(1)]).unwrap();
        let taken = take(&queue);
        queue.acknowledge(taken.tag, Some(TxId(9))).unwrap();
        assert!(queue.acknowledge(taken.tag, None).is_err());
        assert_eq!(queue.pending_acks(TxId(9)).unwrap(), vec![taken.tag]);
        assert_eq!(queue.snapshot(0).unwrap().pending_ack, 1);

        let released = queue.commit_acks(&[taken.tag]).unwrap();
        assert_eq!(released[0].message_id, MessageId(1));
        let snapshot = queue.snapshot(0).unwrap();
        assert_eq!(snapshot.depth, 0);
        assert_eq!(snapshot.messages_acked, 1);
    }

    #[test]
    fn credit_window_blocks_until_ack() {
        let queue = Queue::new(QueueId(1), "q", "a", false, 10).unwrap();
        queue
            .add_consumer(ConsumerId(1), SessionId(1), Credit::messages(1))
            .unwrap();
        queue.enqueue(&[stored(1), stored(2)]).unwrap();
        let first = take(&queue);
        assert!(matches!(queue.poll(ConsumerId(1)).unwrap(), Poll::Wait(_)));
        queue.acknowledge(first.tag, None).unwrap();
        assert_eq!(take(&queue).message_id, MessageId(2));
    }

    #[test]
    fn removing_a_consumer_cancels_its_deliveries() {
        let queue = queue();
        queue.enqueue(&[stored(1), stored(2)]).unwrap();
        let first = take(&queue);
        let second = take(&queue);
        queue.acknowledge(second.tag, Some(TxId(3))).unwrap();

        let released = queue.remove_consumer(ConsumerId(1)).unwrap();
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].tag, first.tag);
        // The transactional ack survives the consumer.
        assert_eq!(queue.pending_acks(TxId(3)).unwrap(), vec![second.tag]);
    }

    #[test]
    fn waiting_receiver_wakes_on_enqueue() {
        let queue = Arc::new(queue());
        let generation = match queue.poll(ConsumerId(1)).unwrap() {
            Poll::Wait(generation) => generation,
            other => panic!("unexpected {other:?}"),
        };
        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                queue.enqueue(&[stored(1)]).unwrap();
            })
        };
        let deadline = Instant::now() + Duration::from_secs(5);
        assert!(queue.wait_for_change(generation, Some(deadline)).unwrap());
        producer.join().unwrap();
        assert_eq!(take(&queue).message_id, MessageId(1));

        let generation = match queue.poll(ConsumerId(1)).unwrap() {
            Poll::Wait(generation) => generation,
            other => panic!("unexpected {other:?}"),
        };
        let deadline = Instant::now() + Duration::from_millis(10);
        assert!(!queue.wait_for_change(generation, Some(deadline)).unwrap());
    }

    #[test]
    fn offline_queue_refuses_delivery() {
        let queue = queue();
        queue.set_offline("cursor out of order").unwrap();
        assert!(matches!(
            queue.poll(ConsumerId(1)),
            Err(Error::QueueOffline { .. })
        ));
    }
}
