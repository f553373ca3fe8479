//! Rebuilding broker state at open.
//!
//! The journal is replayed once. Records outside a transaction apply in log
//! order; records of a transaction apply at its commit marker, are dropped at
//! its rollback marker, and are kept aside as in-doubt when only a prepare
//! marker was found. A commit marker also moves the transaction's in-memory
//! sends to the ids they were given at commit. Each address's pages are then
//! rescanned and every durable queue is refilled in message id order,
//! interleaving references to page records with references to journaled
//! in-memory messages.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use log::{error, info, warn};

use crate::broker::AddressState;
use crate::buffer_pool::BufferPool;
use crate::clock::Clock;
use crate::config::BrokerConfig;
use crate::journal::{DurableLog, JournalRecord, LogPosition};
use crate::message::{Message, MessageId, StoredMessage};
use crate::paging::{
    address_dir, discover_address_dirs, PagePosition, PageTxState, PagedRecord, PagingStore,
};
use crate::queue::{Location, Queue, QueueId, Released};
use crate::transaction::{DirectSend, PreparedWork, TxAck, TxId, Xid};
use crate::{Error, Result};

pub(super) struct Recovered {
    pub addresses: BTreeMap<String, Arc<AddressState>>,
    pub queues: Vec<Arc<Queue>>,
    pub in_doubt: Vec<RecoveredTx>,
    pub next_message: u64,
    pub next_tx: u64,
    pub next_queue: u64,
}

pub(super) struct RecoveredTx {
    pub id: TxId,
    pub xid: Option<Xid>,
    pub acks: Vec<TxAck>,
    pub work: PreparedWork,
}

struct Binding {
    address: String,
    name: String,
}

#[derive(Default)]
struct OpenTx {
    xid: Option<Xid>,
    prepared: bool,
    records: Vec<JournalRecord>,
}

/// State of the journal after replay.
#[derive(Default)]
struct Replay {
    bindings: BTreeMap<QueueId, Binding>,
    /// Bodies of committed in-memory messages.
    messages: BTreeMap<MessageId, Message>,
    /// Unacknowledged committed messages per queue, with delivery counts.
    live: BTreeMap<QueueId, BTreeMap<MessageId, u32>>,
    page_acks: BTreeMap<QueueId, BTreeSet<PagePosition>>,
    committed: BTreeSet<TxId>,
    /// In-memory sends applied at a commit marker. Only these can also have
    /// been paged at commit.
    committed_sends: BTreeSet<MessageId>,
    in_doubt: BTreeMap<TxId, OpenTx>,
    next_message: u64,
    next_tx: u64,
    next_queue: u64,
}

impl Replay {
    fn read(journal: &dyn DurableLog) -> Result<Self> {
        let mut replay = Replay {
            next_message: 1,
            next_tx: 1,
            next_queue: 1,
            ..Replay::default()
        };
        let mut open: BTreeMap<TxId, OpenTx> = BTreeMap::new();
        let mut records = 0usize;
        for logged in journal.replay(LogPosition::default())? {
            let record = logged.decode()?;
            records += 1;
            replay.observe(&record);
            match record {
                JournalRecord::QueueBinding {
                    queue,
                    address,
                    name,
                } => {
                    replay.bindings.insert(queue, Binding { address, name });
                }
                JournalRecord::IdCheckpoint { .. } => {}
                JournalRecord::Prepare { tx, xid } => {
                    let pending = open.entry(tx).or_default();
                    pending.prepared = true;
                    pending.xid = xid;
                }
                JournalRecord::Commit { tx, id_shift } => {
                    replay.committed.insert(tx);
                    if let Some(pending) = open.remove(&tx) {
                        for record in pending.records {
                            replay.apply_committed(record, id_shift);
                        }
                    }
                }
                JournalRecord::Rollback { tx } => {
                    open.remove(&tx);
                }
                record => match record.tx() {
                    Some(tx) => open.entry(tx).or_default().records.push(record),
                    None => replay.apply(record),
                },
            }
        }
        for (tx, pending) in open {
            if pending.prepared {
                replay.in_doubt.insert(tx, pending);
            } else {
                warn!(
                    "discarding {} records of uncommitted transaction {}",
                    pending.records.len(),
                    tx
                );
            }
        }

        let live: BTreeSet<MessageId> = replay
            .live
            .values()
            .flat_map(|messages| messages.keys().copied())
            .collect();
        replay.messages.retain(|id, _| live.contains(id));
        info!(
            "journal replayed: records={} queues={} live_messages={} in_doubt={}",
            records,
            replay.bindings.len(),
            live.len(),
            replay.in_doubt.len()
        );
        Ok(replay)
    }

    /// Keep the id allocators ahead of every id in the log.
    fn observe(&mut self, record: &JournalRecord) {
        if let Some(tx) = record.tx() {
            self.next_tx = self.next_tx.max(tx.0 + 1);
        }
        match record {
            JournalRecord::QueueBinding { queue, .. } => {
                self.next_queue = self.next_queue.max(queue.0 + 1);
            }
            JournalRecord::AddMessage { message, .. } => {
                self.next_message = self.next_message.max(message.id.0 + 1);
            }
            JournalRecord::IdCheckpoint {
                next_message,
                next_tx,
                next_queue,
            } => {
                self.next_message = self.next_message.max(*next_message);
                self.next_tx = self.next_tx.max(*next_tx);
                self.next_queue = self.next_queue.max(*next_queue);
            }
            _ => {}
        }
    }

    /// Apply a record of a transaction at its commit marker.
    fn apply_committed(&mut self, record: JournalRecord, id_shift: u64) {
        match record {
            JournalRecord::AddMessage {
                tx,
                queues,
                mut message,
            } => {
                message.id = MessageId(message.id.0 + id_shift);
                self.committed_sends.insert(message.id);
                self.apply(JournalRecord::AddMessage { tx, queues, message });
            }
            record => self.apply(record),
        }
    }

    fn apply(&mut self, record: JournalRecord) {
        match record {
            JournalRecord::AddMessage {
                queues, message, ..
            } => {
                self.next_message = self.next_message.max(message.id.0 + 1);
                for queue in queues {
                    if self.bindings.contains_key(&queue) {
                        self.live.entry(queue).or_default().insert(message.id, 0);
                    }
                }
                self.messages.insert(message.id, message);
            }
            JournalRecord::Ack { queue, message, .. } => {
                if let Some(live) = self.live.get_mut(&queue) {
                    live.remove(&message);
                }
            }
            JournalRecord::PageAck {
                queue, position, ..
            } => {
                self.page_acks.entry(queue).or_default().insert(position);
            }
            JournalRecord::DeliveryCount {
                queue,
                message,
                count,
            } => {
                if let Some(current) = self
                    .live
                    .get_mut(&queue)
                    .and_then(|live| live.get_mut(&message))
                {
                    *current = count;
                }
            }
            _ => {}
        }
    }
}

/// An in-doubt transaction while its references are being restored.
struct PendingTx {
    recovered: RecoveredTx,
    page_acks: Vec<(QueueId, PagePosition)>,
    /// `(queue, message, delivery count)` of acknowledged in-memory messages.
    acks: Vec<(QueueId, MessageId, u32)>,
    sends: Vec<(Vec<QueueId>, Message)>,
}

/// In-memory bodies shared by every queue they were routed to.
#[derive(Default)]
struct BodyCache {
    stored: BTreeMap<MessageId, Arc<StoredMessage>>,
}

impl BodyCache {
    fn get(
        &mut self,
        messages: &BTreeMap<MessageId, Message>,
        id: MessageId,
        counter: &Arc<AtomicU64>,
    ) -> Result<Arc<StoredMessage>> {
        if let Some(stored) = self.stored.get(&id) {
            return Ok(Arc::clone(stored));
        }
        let message = messages
            .get(&id)
            .cloned()
            .ok_or(Error::Corrupt("journaled message body missing"))?;
        let stored = Arc::new(StoredMessage::new(message, Arc::clone(counter)));
        self.stored.insert(id, Arc::clone(&stored));
        Ok(stored)
    }
}

pub(super) fn recover(
    config: &BrokerConfig,
    journal: &dyn DurableLog,
    clock: &Arc<dyn Clock>,
    buffers: &Arc<BufferPool>,
) -> Result<Recovered> {
    let mut replay = Replay::read(journal)?;
    let paging_dir = config.paging_dir();

    let mut dirs: BTreeMap<String, PathBuf> = discover_address_dirs(&paging_dir)?.into_iter().collect();
    for binding in replay.bindings.values() {
        dirs.entry(binding.address.clone())
            .or_insert_with(|| address_dir(&paging_dir, &binding.address));
    }
    let mut addresses = BTreeMap::new();
    for (name, dir) in dirs {
        let settings = config.address_settings(&name).clone();
        let store = match PagingStore::open(
            name.clone(),
            dir.clone(),
            settings.clone(),
            Arc::clone(clock),
            Arc::clone(buffers),
        ) {
            Ok(store) => store,
            Err(err) => PagingStore::offline(
                name.clone(),
                dir,
                settings,
                Arc::clone(clock),
                Arc::clone(buffers),
                format!("page recovery failed: {err}"),
            ),
        };
        addresses.insert(name.clone(), Arc::new(AddressState::new(name, store)));
    }

    let mut queues = Vec::with_capacity(replay.bindings.len());
    for (&id, binding) in &replay.bindings {
        let address = addresses
            .get(&binding.address)
            .ok_or(Error::Corrupt("queue bound to an unknown address"))?;
        let queue = Arc::new(Queue::new(
            id,
            binding.name.clone(),
            binding.address.clone(),
            true,
            address.store.settings().depage_batch,
        )?);
        address.bind(Arc::clone(&queue))?;
        queues.push(queue);
    }

    let mut pending = take_in_doubt(&mut replay);
    let mut cache = BodyCache::default();
    for address in addresses.values() {
        let bound = address.queues()?;
        if let Err(err) = recover_address(address, &bound, &replay, &mut cache, &mut pending) {
            let reason = format!("recovery failed: {err}");
            error!("address {} {}", address.name, reason);
            address.store.lock()?.set_offline(reason.clone());
            for queue in &bound {
                queue.set_offline(reason.clone())?;
            }
        }
    }
    for pending in &mut pending {
        add_in_doubt_sends(&addresses, &queues, pending)?;
    }

    let mut next_message = replay.next_message;
    for address in addresses.values() {
        if let Some(max) = address.store.lock()?.max_message_id() {
            next_message = next_message.max(max.0 + 1);
        }
    }

    let recovered = Recovered {
        addresses,
        queues,
        in_doubt: pending.into_iter().map(|pending| pending.recovered).collect(),
        next_message,
        next_tx: replay.next_tx,
        next_queue: replay.next_queue,
    };

    let min_segments = config.journal.compact_min_segments;
    if min_segments > 0 && journal.segment_count() >= min_segments {
        compact(journal, &replay, &recovered)?;
    }
    Ok(recovered)
}

fn take_in_doubt(replay: &mut Replay) -> Vec<PendingTx> {
    let mut pending = Vec::with_capacity(replay.in_doubt.len());
    for (&tx, open) in &replay.in_doubt {
        let mut found = PendingTx {
            recovered: RecoveredTx {
                id: tx,
                xid: open.xid.clone(),
                acks: Vec::new(),
                work: PreparedWork {
                    journaled: true,
                    ..PreparedWork::default()
                },
            },
            page_acks: Vec::new(),
            acks: Vec::new(),
            sends: Vec::new(),
        };
        for record in &open.records {
            match record {
                JournalRecord::Ack { queue, message, .. } => {
                    let count = replay
                        .live
                        .get_mut(queue)
                        .and_then(|live| live.remove(message));
                    if let Some(count) = count {
                        found.acks.push((*queue, *message, count));
                    }
                }
                JournalRecord::PageAck {
                    queue, position, ..
                } => found.page_acks.push((*queue, *position)),
                JournalRecord::AddMessage {
                    queues, message, ..
                } => found.sends.push((queues.clone(), message.clone())),
                _ => {}
            }
        }
        warn!(
            "transaction {} is in doubt: {} records wait for resolution",
            tx,
            open.records.len()
        );
        pending.push(found);
    }
    pending
}

/// What recovery puts back into a queue for one message id.
enum Restore {
    Ready(u32),
    /// In-memory message acknowledged by the in-doubt transaction at `tx`.
    Memory { tx: usize, count: u32 },
    /// Page record acknowledged by the in-doubt transaction at `tx`.
    Paged { tx: usize, record: PagedRecord },
}

fn paged_location(record: &PagedRecord) -> Location {
    Location::Paged {
        position: record.position,
        size: record.size,
    }
}

fn recover_address(
    address: &AddressState,
    queues: &[Arc<Queue>],
    replay: &Replay,
    cache: &mut BodyCache,
    pending: &mut [PendingTx],
) -> Result<()> {
    let mut guard = address.store.lock()?;
    for queue in queues {
        guard.register_queue(queue.id(), true)?;
    }
    if let Some(reason) = guard.offline().map(str::to_string) {
        for queue in queues {
            queue.set_offline(format!("address offline: {reason}"))?;
        }
        return Ok(());
    }
    let keep: BTreeSet<QueueId> = queues.iter().map(|queue| queue.id()).collect();
    guard.retain_queues(&keep)?;

    for tx in guard.referenced_txs() {
        if replay.committed.contains(&tx) {
            guard.set_tx_state(tx, PageTxState::Committed);
        } else if let Some(found) = pending.iter_mut().find(|found| found.recovered.id == tx) {
            guard.set_tx_state(tx, PageTxState::Prepared);
            found
                .recovered
                .work
                .paged
                .entry(address.name.clone())
                .or_default()
                .extend(keep.iter().copied());
        }
    }
    for queue in queues {
        if let Some(acked) = replay.page_acks.get(&queue.id()) {
            for &position in acked {
                guard.skip(queue.id(), position);
            }
        }
    }

    let mut restores: BTreeMap<QueueId, BTreeMap<MessageId, Restore>> = BTreeMap::new();
    for (tx, found) in pending.iter().enumerate() {
        for &(queue, position) in &found.page_acks {
            if keep.contains(&queue) {
                let record = guard.take(queue, position)?;
                restores
                    .entry(queue)
                    .or_default()
                    .insert(record.message_id, Restore::Paged { tx, record });
            }
        }
        for &(queue, message, count) in &found.acks {
            if keep.contains(&queue) {
                restores
                    .entry(queue)
                    .or_default()
                    .insert(message, Restore::Memory { tx, count });
            }
        }
    }
    guard.recount_unread()?;

    // A send paged at commit keeps a journal copy until its acknowledgement
    // is logged. The page record wins.
    let committed: BTreeSet<MessageId> = queues
        .iter()
        .filter_map(|queue| replay.live.get(&queue.id()))
        .flat_map(|live| live.keys().copied())
        .filter(|id| replay.committed_sends.contains(id))
        .collect();
    let paged = guard.paged_among(&committed)?;
    if !paged.is_empty() {
        warn!(
            "address {}: {} committed messages found both paged and journaled, reading the pages",
            address.name,
            paged.len()
        );
    }

    let counter = Arc::clone(address.store.memory_counter());
    for queue in queues {
        let mut messages = restores.remove(&queue.id()).unwrap_or_default();
        if let Some(live) = replay.live.get(&queue.id()) {
            messages.extend(
                live.iter()
                    .filter(|(id, _)| !paged.contains(*id))
                    .map(|(&id, &count)| (id, Restore::Ready(count))),
            );
        }
        for (id, restore) in messages {
            for record in guard.depage_until(queue.id(), id)? {
                queue.restore(record.message_id, paged_location(&record), 0)?;
            }
            let (tx, location, released) = match restore {
                Restore::Ready(count) => {
                    let stored = cache.get(&replay.messages, id, &counter)?;
                    queue.restore(id, Location::Memory(stored), count)?;
                    continue;
                }
                Restore::Memory { tx, count } => {
                    let stored = cache.get(&replay.messages, id, &counter)?;
                    let released = Released {
                        tag: 0,
                        message_id: id,
                        page: None,
                        durable: true,
                        delivery_count: count,
                    };
                    (tx, Location::Memory(stored), released)
                }
                Restore::Paged { tx, record } => {
                    let released = Released {
                        tag: 0,
                        message_id: id,
                        page: Some(record.position),
                        durable: false,
                        delivery_count: 0,
                    };
                    (tx, paged_location(&record), released)
                }
            };
            let found = &mut pending[tx];
            let tag = queue.restore_pending_ack(id, location, released.delivery_count, found.recovered.id)?;
            found.recovered.acks.push(TxAck {
                queue: queue.id(),
                consumer: None,
                released: Released { tag, ..released },
            });
        }
        if guard.has_pending(queue.id())? {
            queue.set_paged_pending()?;
        }
    }
    Ok(())
}

/// In-memory sends of an in-doubt transaction, enqueued if it commits.
fn add_in_doubt_sends(
    addresses: &BTreeMap<String, Arc<AddressState>>,
    queues: &[Arc<Queue>],
    pending: &mut PendingTx,
) -> Result<()> {
    for (routed, message) in std::mem::take(&mut pending.sends) {
        if !addresses.contains_key(&message.address) {
            continue;
        }
        let bound: Vec<Arc<Queue>> = queues
            .iter()
            .filter(|queue| routed.contains(&queue.id()))
            .cloned()
            .collect();
        if bound.is_empty() {
            continue;
        }
        pending.recovered.work.direct.push(DirectSend {
            message,
            queues: bound,
            journaled: routed,
        });
    }
    Ok(())
}

/// Rewrite the journal down to what a restart needs.
fn compact(journal: &dyn DurableLog, replay: &Replay, recovered: &Recovered) -> Result<()> {
    let before = journal.segment_count();
    let mut out: Vec<(u16, Vec<u8>)> = Vec::new();
    let mut push = |record: JournalRecord| -> Result<()> {
        out.push((record.kind(), record.to_bytes()?));
        Ok(())
    };

    push(JournalRecord::IdCheckpoint {
        next_message: recovered.next_message,
        next_tx: recovered.next_tx,
        next_queue: recovered.next_queue,
    })?;
    for (&queue, binding) in &replay.bindings {
        push(JournalRecord::QueueBinding {
            queue,
            address: binding.address.clone(),
            name: binding.name.clone(),
        })?;
    }

    let mut page_txs = BTreeSet::new();
    for address in recovered.addresses.values() {
        page_txs.extend(address.store.lock()?.referenced_txs());
    }
    for tx in page_txs.intersection(&replay.committed) {
        push(JournalRecord::Commit {
            tx: *tx,
            id_shift: 0,
        })?;
    }

    let mut live: BTreeMap<MessageId, Vec<(QueueId, u32)>> = BTreeMap::new();
    for queue in &recovered.queues {
        for (message, count) in queue.live_messages()? {
            live.entry(message).or_default().push((queue.id(), count));
        }
    }
    for (id, holders) in &live {
        let Some(message) = replay.messages.get(id) else {
            continue;
        };
        push(JournalRecord::AddMessage {
            tx: None,
            queues: holders.iter().map(|(queue, _)| *queue).collect(),
            message: message.clone(),
        })?;
        for &(queue, count) in holders.iter().filter(|(_, count)| *count > 0) {
            push(JournalRecord::DeliveryCount {
                queue,
                message: *id,
                count,
            })?;
        }
    }

    for (&queue, positions) in &replay.page_acks {
        let Some(address) = replay
            .bindings
            .get(&queue)
            .and_then(|binding| recovered.addresses.get(&binding.address))
        else {
            continue;
        };
        let guard = address.store.lock()?;
        for &position in positions {
            if guard.retains_page(position.page) {
                push(JournalRecord::PageAck {
                    tx: None,
                    queue,
                    position,
                })?;
            }
        }
    }

    for (&tx, open) in &replay.in_doubt {
        for record in &open.records {
            push(record.clone())?;
        }
        push(JournalRecord::Prepare {
            tx,
            xid: open.xid.clone(),
        })?;
    }

    journal.compact(&out)?;
    info!(
        "journal compacted: segments {} -> {}, records={}",
        before,
        journal.segment_count(),
        out.len()
    );
    Ok(())
}
