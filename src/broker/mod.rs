//! Broker: addresses, queues, consumers and transactions behind one handle.
//!
//! Lock order, outermost first: transaction, paging stores (by address
//! name), an address's queue list, a queue, the journal. Broker maps are
//! only held long enough to clone an `Arc` out of them.

mod recovery;

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::buffer_pool::BufferPool;
use crate::clock::{Clock, QuantaClock};
use crate::config::BrokerConfig;
use crate::dispatch::{DispatchHandle, MessageHandler};
use crate::journal::{DurableLog, FileJournal, JournalRecord, LogPosition};
use crate::management::{AddressSnapshot, BrokerSnapshot, QueueSnapshot};
use crate::message::{Message, MessageId, StoredMessage};
use crate::paging::page::page_record_len;
use crate::paging::{address_dir, PagingStore, StoreGuard};
use crate::queue::{ConsumerId, Credit, Location, Poll, Queue, QueueId, Released, Taken};
use crate::session::SessionId;
use crate::transaction::{
    DirectSend, InDoubt, PreparedWork, Transaction, TransactionRegistry, TxAck, TxId, TxState,
    Xid,
};
use crate::{lock, Error, Result};

/// A message handed to a consumer. Settle it with `acknowledge` or `cancel`.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub queue: QueueId,
    pub consumer: ConsumerId,
    pub tag: u64,
    pub message: Arc<Message>,
    /// 1 on first delivery.
    pub delivery_count: u32,
}

impl Delivery {
    pub fn is_redelivery(&self) -> bool {
        self.delivery_count > 1
    }
}

/// One address: its page store and the queues bound to it.
pub(crate) struct AddressState {
    name: String,
    store: PagingStore,
    queues: RwLock<Vec<Arc<Queue>>>,
}

impl AddressState {
    fn new(name: String, store: PagingStore) -> Self {
        Self {
            name,
            store,
            queues: RwLock::new(Vec::new()),
        }
    }

    fn queues(&self) -> Result<Vec<Arc<Queue>>> {
        Ok(read(&self.queues, "address queue list poisoned")?.clone())
    }

    fn bind(&self, queue: Arc<Queue>) -> Result<()> {
        write(&self.queues, "address queue list poisoned")?.push(queue);
        Ok(())
    }
}

#[derive(Clone)]
struct ConsumerBinding {
    queue: Arc<Queue>,
    session: SessionId,
}

#[derive(Default)]
struct QueueMaps {
    by_id: BTreeMap<QueueId, Arc<Queue>>,
    by_name: BTreeMap<String, QueueId>,
}

/// A message routed outside a transaction.
struct Routed {
    id: MessageId,
    /// Journal record to wait on for durability.
    journal: Option<LogPosition>,
}

pub struct Broker {
    config: BrokerConfig,
    clock: Arc<dyn Clock>,
    journal: Arc<dyn DurableLog>,
    buffers: Arc<BufferPool>,
    addresses: RwLock<BTreeMap<String, Arc<AddressState>>>,
    queues: RwLock<QueueMaps>,
    consumers: RwLock<BTreeMap<ConsumerId, ConsumerBinding>>,
    sessions: Mutex<BTreeSet<SessionId>>,
    transactions: TransactionRegistry,
    next_message: AtomicU64,
    next_queue: AtomicU64,
    next_consumer: AtomicU64,
    next_session: AtomicU64,
}

fn read<'a, T>(lock: &'a RwLock<T>, what: &'static str) -> Result<RwLockReadGuard<'a, T>> {
    lock.read().map_err(|_| Error::Corrupt(what))
}

fn write<'a, T>(lock: &'a RwLock<T>, what: &'static str) -> Result<RwLockWriteGuard<'a, T>> {
    lock.write().map_err(|_| Error::Corrupt(what))
}

/// Buffered sends keyed by address name, so stores lock in name order.
fn group_by_address(sends: Vec<Message>) -> BTreeMap<String, Vec<Message>> {
    let mut by_address: BTreeMap<String, Vec<Message>> = BTreeMap::new();
    for message in sends {
        by_address.entry(message.address.clone()).or_default().push(message);
    }
    by_address
}

impl Broker {
    /// Open the broker stored under `config.data_dir`, recovering the journal
    /// and every address's pages.
    pub fn open(config: BrokerConfig) -> Result<Arc<Self>> {
        let clock: Arc<dyn Clock> = Arc::new(QuantaClock::new());
        let journal = FileJournal::open(config.journal_dir(), &config.journal, Arc::clone(&clock))?;
        Self::open_with(config, Arc::new(journal), clock)
    }

    pub fn open_with_journal(config: BrokerConfig, journal: Arc<dyn DurableLog>) -> Result<Arc<Self>> {
        Self::open_with(config, journal, Arc::new(QuantaClock::new()))
    }

    pub fn open_with(
        config: BrokerConfig,
        journal: Arc<dyn DurableLog>,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        fs::create_dir_all(config.paging_dir())?;
        let buffers = Arc::new(BufferPool::from_config(&config.buffer_pool));
        let recovered = recovery::recover(&config, journal.as_ref(), &clock, &buffers)?;

        let mut maps = QueueMaps::default();
        for queue in &recovered.queues {
            maps.by_name.insert(queue.name().to_string(), queue.id());
            maps.by_id.insert(queue.id(), Arc::clone(queue));
        }
        let transactions = TransactionRegistry::new(recovered.next_tx);
        let in_doubt = recovered.in_doubt.len();
        for tx in recovered.in_doubt {
            transactions.insert_recovered(tx.id, tx.xid, tx.acks, tx.work)?;
        }
        info!(
            "broker opened: addresses={} queues={} in_doubt={} next_message={}",
            recovered.addresses.len(),
            maps.by_id.len(),
            in_doubt,
            recovered.next_message
        );

        Ok(Arc::new(Self {
            config,
            clock,
            journal,
            buffers,
            addresses: RwLock::new(recovered.addresses),
            queues: RwLock::new(maps),
            consumers: RwLock::new(BTreeMap::new()),
            sessions: Mutex::new(BTreeSet::new()),
            transactions,
            next_message: AtomicU64::new(recovered.next_message),
            next_queue: AtomicU64::new(recovered.next_queue),
            next_consumer: AtomicU64::new(1),
            next_session: AtomicU64::new(1),
        }))
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn journal(&self) -> &Arc<dyn DurableLog> {
        &self.journal
    }

    fn append_record(&self, record: &JournalRecord) -> Result<LogPosition> {
        let mut buf = self.buffers.checkout();
        record.encode(&mut buf)?;
        self.journal.append(record.kind(), &buf)
    }

    fn allocate_message_id(&self) -> MessageId {
        MessageId(self.next_message.fetch_add(1, Ordering::AcqRel))
    }

    fn find_address(&self, name: &str) -> Result<Option<Arc<AddressState>>> {
        Ok(read(&self.addresses, "address map poisoned")?.get(name).cloned())
    }

    fn address_state(&self, name: &str) -> Result<Arc<AddressState>> {
        self.find_address(name)?
            .ok_or_else(|| Error::UnknownQueue(format!("no queue bound to address {name}")))
    }

    fn address_or_create(&self, name: &str) -> Result<Arc<AddressState>> {
        if let Some(address) = self.find_address(name)? {
            return Ok(address);
        }
        let mut addresses = write(&self.addresses, "address map poisoned")?;
        if let Some(address) = addresses.get(name) {
            return Ok(Arc::clone(address));
        }
        let store = PagingStore::open(
            name,
            address_dir(&self.config.paging_dir(), name),
            self.config.address_settings(name).clone(),
            Arc::clone(&self.clock),
            Arc::clone(&self.buffers),
        )?;
        let address = Arc::new(AddressState::new(name.to_string(), store));
        addresses.insert(name.to_string(), Arc::clone(&address));
        debug!("address {} created", name);
        Ok(address)
    }

    fn queue_by_id(&self, id: QueueId) -> Result<Arc<Queue>> {
        read(&self.queues, "queue map poisoned")?
            .by_id
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::UnknownQueue(id.to_string()))
    }

    pub fn queue(&self, name: &str) -> Result<Arc<Queue>> {
        let maps = read(&self.queues, "queue map poisoned")?;
        maps.by_name
            .get(name)
            .and_then(|id| maps.by_id.get(id))
            .cloned()
            .ok_or_else(|| Error::UnknownQueue(name.to_string()))
    }

    pub fn queue_names(&self) -> Result<Vec<String>> {
        Ok(read(&self.queues, "queue map poisoned")?
            .by_name
            .keys()
            .cloned()
            .collect())
    }

    /// Bind a new queue to `address`. A queue only receives messages routed
    /// after it was created. Durable queues survive a restart.
    pub fn create_queue(&self, address: &str, name: &str, durable: bool) -> Result<QueueId> {
        let address_state = self.address_or_create(address)?;
        let settings = address_state.store.settings();
        let id = QueueId(self.next_queue.fetch_add(1, Ordering::AcqRel));
        let queue = Arc::new(Queue::new(id, name, address, durable, settings.depage_batch)?);
        {
            let mut maps = write(&self.queues, "queue map poisoned")?;
            if maps.by_name.contains_key(name) {
                return Err(Error::DuplicateQueue(name.to_string()));
            }
            maps.by_name.insert(name.to_string(), id);
            maps.by_id.insert(id, Arc::clone(&queue));
        }

        let bound = self.bind_queue(&address_state, &queue);
        if let Err(err) = bound {
            let mut maps = write(&self.queues, "queue map poisoned")?;
            maps.by_name.remove(name);
            maps.by_id.remove(&id);
            return Err(err);
        }
        info!("queue {} ({}) bound to address {}", name, id, address);
        Ok(id)
    }

    fn bind_queue(&self, address: &AddressState, queue: &Arc<Queue>) -> Result<()> {
        if queue.is_durable() {
            let position = self.append_record(&JournalRecord::QueueBinding {
                queue: queue.id(),
                address: address.name.clone(),
                name: queue.name().to_string(),
            })?;
            self.journal.sync_to(position)?;
        }
        let mut guard = address.store.lock()?;
        guard.check_online()?;
        guard.register_queue(queue.id(), false)?;
        address.bind(Arc::clone(queue))
    }

    pub fn open_session(&self) -> Result<SessionId> {
        let id = SessionId(self.next_session.fetch_add(1, Ordering::AcqRel));
        lock(&self.sessions, "session set poisoned")?.insert(id);
        Ok(id)
    }

    fn check_session(&self, session: SessionId) -> Result<()> {
        if lock(&self.sessions, "session set poisoned")?.contains(&session) {
            Ok(())
        } else {
            Err(Error::UnknownSession(session.0))
        }
    }

    /// Roll back the session's open transactions and close its consumers.
    pub fn close_session(&self, session: SessionId) -> Result<()> {
        if !lock(&self.sessions, "session set poisoned")?.remove(&session) {
            return Err(Error::UnknownSession(session.0));
        }
        for tx in self.transactions.of_session(session)? {
            if let Err(err) = self.rollback(tx) {
                warn!("session {} close: rollback of {} failed: {}", session, tx, err);
            }
        }
        let consumers: Vec<ConsumerId> = read(&self.consumers, "consumer map poisoned")?
            .iter()
            .filter(|(_, binding)| binding.session == session)
            .map(|(&id, _)| id)
            .collect();
        for consumer in consumers {
            self.close_consumer(consumer)?;
        }
        debug!("session {} closed", session);
        Ok(())
    }

    pub fn create_consumer(&self, session: SessionId, queue: &str, credit: Credit) -> Result<ConsumerId> {
        self.check_session(session)?;
        let queue = self.queue(queue)?;
        let id = ConsumerId(self.next_consumer.fetch_add(1, Ordering::AcqRel));
        queue.add_consumer(id, session, credit)?;
        write(&self.consumers, "consumer map poisoned")?
            .insert(id, ConsumerBinding { queue, session });
        Ok(id)
    }

    fn consumer(&self, consumer: ConsumerId) -> Result<ConsumerBinding> {
        read(&self.consumers, "consumer map poisoned")?
            .get(&consumer)
            .cloned()
            .ok_or(Error::UnknownConsumer(consumer.0))
    }

    pub fn set_credit(&self, consumer: ConsumerId, credit: Credit) -> Result<()> {
        self.consumer(consumer)?.queue.set_credit(consumer, credit)
    }

    /// Close a consumer. What it holds unacknowledged goes back to the head
    /// of its queue.
    pub fn close_consumer(&self, consumer: ConsumerId) -> Result<()> {
        let binding = write(&self.consumers, "consumer map poisoned")?
            .remove(&consumer)
            .ok_or(Error::UnknownConsumer(consumer.0))?;
        let released = binding.queue.remove_consumer(consumer)?;
        self.journal_delivery_counts(&binding.queue, &released)
    }

    /// Route `message` to every queue bound to its address.
    ///
    /// Inside a transaction the message is buffered until commit and `None`
    /// is returned. Otherwise the message id is returned, or `None` when no
    /// queue is bound. With `sync_non_transactional` set a durable message is
    /// on disk when this returns.
    pub fn route(&self, message: Message, tx: Option<TxId>) -> Result<Option<MessageId>> {
        if let Some(tx) = tx {
            self.route_transactional(message, tx)?;
            return Ok(None);
        }
        let Some(routed) = self.route_now(message)? else {
            return Ok(None);
        };
        if let Some(position) = routed.journal {
            if self.config.journal.sync_non_transactional {
                self.journal.sync_to(position)?;
            }
        }
        Ok(Some(routed.id))
    }

    /// Route outside a transaction without waiting for the journal. The
    /// callback runs once the message is durable, possibly on the journal's
    /// flusher thread.
    pub fn route_async<F>(&self, message: Message, callback: F)
    where
        F: FnOnce(Result<Option<MessageId>>) + Send + 'static,
    {
        match self.route_now(message) {
            Ok(Some(Routed {
                id,
                journal: Some(position),
            })) => self.journal.on_durable(
                position,
                Box::new(move |result: Result<()>| callback(result.map(|()| Some(id)))),
            ),
            Ok(routed) => callback(Ok(routed.map(|routed| routed.id))),
            Err(err) => callback(Err(err)),
        }
    }

    fn route_transactional(&self, message: Message, tx: TxId) -> Result<()> {
        let handle = self.transactions.get(tx)?;
        let mut t = lock(&handle, "transaction lock poisoned")?;
        t.expect(TxState::Active, "send")?;
        let address = match self.address_state(&message.address) {
            Ok(address) => address,
            Err(err) => {
                t.mark_rollback_only(err.to_string());
                return Err(err);
            }
        };
        if let Err(err) = address.store.lock()?.check_online() {
            t.mark_rollback_only(err.to_string());
            return Err(err);
        }
        t.add_send(message);
        Ok(())
    }

    fn route_now(&self, mut message: Message) -> Result<Option<Routed>> {
        let Some(address) = self.find_address(&message.address)? else {
            debug!("no queue bound to address {}, message dropped", message.address);
            return Ok(None);
        };
        message.timestamp_ns = self.clock.now();
        let size = message.memory_size();
        let policy = address.store.settings().full_policy;
        let mut guard = address.store.lock()?;
        loop {
            guard.check_online()?;
            let queues = address.queues()?;
            if queues.is_empty() {
                debug!("no queue bound to address {}, message dropped", address.name);
                return Ok(None);
            }
            let ids: Vec<QueueId> = queues.iter().map(|queue| queue.id()).collect();

            if !guard.should_page(size)? {
                message.id = self.allocate_message_id();
                let durable: Vec<QueueId> = queues
                    .iter()
                    .filter(|queue| queue.is_durable())
                    .map(|queue| queue.id())
                    .collect();
                let journal = if message.durable && !durable.is_empty() {
                    Some(self.append_record(&JournalRecord::AddMessage {
                        tx: None,
                        queues: durable,
                        message: message.clone(),
                    })?)
                } else {
                    None
                };
                let id = message.id;
                let stored = Arc::new(StoredMessage::new(
                    message,
                    Arc::clone(address.store.memory_counter()),
                ));
                for queue in &queues {
                    queue.enqueue(std::slice::from_ref(&stored))?;
                }
                return Ok(Some(Routed { id, journal }));
            }

            let needed = guard.bytes_needed(page_record_len(&message, ids.len()));
            if !guard.has_space(needed) {
                guard = guard.wait_for_space(needed, policy)?;
                continue;
            }
            message.id = self.allocate_message_id();
            let sync = self.config.journal.sync_non_transactional && message.durable;
            guard.append(None, &message, &ids, sync)?;
            for queue in &queues {
                queue.set_paged_pending()?;
            }
            return Ok(Some(Routed {
                id: message.id,
                journal: None,
            }));
        }
    }

    /// Wait up to `timeout` for the next message for `consumer`. Returns
    /// `None` on timeout.
    pub fn deliver(&self, consumer: ConsumerId, timeout: Duration) -> Result<Option<Delivery>> {
        let binding = self.consumer(consumer)?;
        let queue = &binding.queue;
        let deadline = Instant::now() + timeout;
        loop {
            match queue.poll(consumer)? {
                Poll::Ready(taken) => return self.materialize(queue, consumer, taken).map(Some),
                Poll::Depage => self.depage(queue)?,
                Poll::Wait(generation) => {
                    if !queue.wait_for_change(generation, Some(deadline))? {
                        return Ok(None);
                    }
                }
            }
        }
    }

    fn depage(&self, queue: &Queue) -> Result<()> {
        let address = self.address_state(queue.address())?;
        let batch = address.store.settings().depage_batch;
        let mut guard = address.store.lock()?;
        match guard.depage(queue.id(), batch) {
            Ok(depaged) => queue.add_paged(&depaged.records, depaged.more),
            Err(err @ Error::OrderViolation { .. }) => {
                queue.set_offline(err.to_string())?;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    fn materialize(&self, queue: &Queue, consumer: ConsumerId, taken: Taken) -> Result<Delivery> {
        let message = match &taken.location {
            Location::Memory(stored) => Arc::clone(stored.message()),
            Location::Paged { position, .. } => {
                let read = self
                    .address_state(queue.address())
                    .and_then(|address| address.store.read_message(*position));
                match read {
                    Ok(message) => Arc::new(message),
                    Err(err) => {
                        error!(
                            "queue {} failed to read page record {}: {}",
                            queue.name(),
                            position,
                            err
                        );
                        queue.cancel(&[taken.tag])?;
                        return Err(err);
                    }
                }
            }
        };
        Ok(Delivery {
            queue: queue.id(),
            consumer,
            tag: taken.tag,
            message,
            delivery_count: taken.delivery_count,
        })
    }

    /// Acknowledge a delivery. Inside a transaction it is removed when the
    /// transaction commits.
    pub fn acknowledge(&self, consumer: ConsumerId, tag: u64, tx: Option<TxId>) -> Result<()> {
        let queue = self.consumer(consumer)?.queue;
        if !queue.owns(consumer, tag)? {
            return Err(Error::UnknownDelivery {
                queue: queue.name().to_string(),
                tag,
            });
        }
        if let Some(tx) = tx {
            let handle = self.transactions.get(tx)?;
            let mut t = lock(&handle, "transaction lock poisoned")?;
            t.expect(TxState::Active, "acknowledge")?;
            let released = queue.acknowledge(tag, Some(tx))?;
            t.add_ack(TxAck {
                queue: queue.id(),
                consumer: Some(consumer),
                released,
            });
            return Ok(());
        }

        let released = queue.acknowledge(tag, None)?;
        self.journal_ack(&queue, &released, None)?;
        if let Some(position) = released.page {
            let address = self.address_state(queue.address())?;
            address.store.lock()?.ack(queue.id(), position)?;
        }
        Ok(())
    }

    /// Return a delivery to the head of its queue.
    pub fn cancel(&self, consumer: ConsumerId, tag: u64) -> Result<()> {
        let queue = self.consumer(consumer)?.queue;
        let released = queue.cancel_delivery(consumer, tag)?;
        self.journal_delivery_counts(&queue, &[released])
    }

    /// Journal an acknowledgement. Returns true when a record was written.
    fn journal_ack(&self, queue: &Queue, released: &Released, tx: Option<TxId>) -> Result<bool> {
        if !queue.is_durable() {
            return Ok(false);
        }
        let record = match released.page {
            Some(position) => JournalRecord::PageAck {
                tx,
                queue: queue.id(),
                position,
            },
            None if released.durable => JournalRecord::Ack {
                tx,
                queue: queue.id(),
                message: released.message_id,
            },
            None => return Ok(false),
        };
        self.append_record(&record)?;
        Ok(true)
    }

    fn journal_delivery_counts(&self, queue: &Queue, released: &[Released]) -> Result<()> {
        if !queue.is_durable() {
            return Ok(());
        }
        for released in released.iter().filter(|released| released.durable) {
            self.append_record(&JournalRecord::DeliveryCount {
                queue: queue.id(),
                message: released.message_id,
                count: released.delivery_count,
            })?;
        }
        Ok(())
    }

    pub fn begin(&self, session: SessionId) -> Result<TxId> {
        self.check_session(session)?;
        self.transactions.begin(session)
    }

    pub fn begin_xa(&self, session: SessionId, xid: Xid) -> Result<TxId> {
        self.check_session(session)?;
        self.transactions.begin_xa(session, xid)
    }

    pub fn find_xa(&self, xid: &Xid) -> Result<Option<TxId>> {
        self.transactions.find_xa(xid)
    }

    /// Prepared transactions recovered at open and still unresolved.
    pub fn in_doubt(&self) -> Result<Vec<InDoubt>> {
        self.transactions.in_doubt()
    }

    pub fn transaction_state(&self, tx: TxId) -> Result<TxState> {
        let handle = self.transactions.get(tx)?;
        let state = lock(&handle, "transaction lock poisoned")?.state();
        Ok(state)
    }

    /// First phase of a two-phase commit: write every record of the
    /// transaction and a durable prepare marker.
    pub fn prepare(&self, tx: TxId) -> Result<()> {
        let handle = self.transactions.get(tx)?;
        let mut t = lock(&handle, "transaction lock poisoned")?;
        t.expect(TxState::Active, "prepare")?;
        let failure = match t.rollback_only().map(str::to_string) {
            Some(reason) => Some(Error::RollbackOnly { tx: tx.0, reason }),
            None => self.prepare_two_phase(&mut t).err(),
        };
        match failure {
            None => {
                t.set_state(TxState::Prepared);
                debug!("transaction {} prepared", tx);
                Ok(())
            }
            Some(err) => {
                self.abort(&mut t);
                drop(t);
                self.transactions.remove(tx)?;
                Err(err)
            }
        }
    }

    pub fn commit(&self, tx: TxId) -> Result<()> {
        let handle = self.transactions.get(tx)?;
        let result = {
            let mut t = lock(&handle, "transaction lock poisoned")?;
            self.commit_locked(&mut t)
        };
        self.transactions.remove(tx)?;
        result
    }

    pub fn rollback(&self, tx: TxId) -> Result<()> {
        let handle = self.transactions.get(tx)?;
        let result = {
            let mut t = lock(&handle, "transaction lock poisoned")?;
            self.rollback_locked(&mut t)
        };
        self.transactions.remove(tx)?;
        result
    }

    fn commit_locked(&self, t: &mut Transaction) -> Result<()> {
        let published = match t.state() {
            TxState::Active => {
                if let Some(reason) = t.rollback_only().map(str::to_string) {
                    self.rollback_locked(t)?;
                    return Err(Error::RollbackOnly { tx: t.id().0, reason });
                }
                self.commit_one_phase(t)
            }
            TxState::Prepared => self.commit_prepared(t),
            state => {
                return Err(Error::InvalidTransactionState {
                    tx: t.id().0,
                    state,
                    op: "commit",
                })
            }
        };
        if let Err(err) = published {
            self.abort(t);
            return Err(err);
        }
        let acks = t.take_acks();
        t.set_state(TxState::Committed);
        self.commit_acks(acks)?;
        debug!("transaction {} committed", t.id());
        Ok(())
    }

    fn addresses_of<'n>(&self, names: impl IntoIterator<Item = &'n String>) -> Result<Vec<Arc<AddressState>>> {
        names.into_iter().map(|name| self.address_state(name)).collect()
    }

    /// Lock the stores of `addresses`, which are sorted by name.
    fn lock_stores(addresses: &[Arc<AddressState>]) -> Result<Vec<StoreGuard<'_>>> {
        addresses.iter().map(|address| address.store.lock()).collect()
    }

    fn prepare_two_phase(&self, t: &mut Transaction) -> Result<()> {
        let sends = group_by_address(t.take_sends());
        let addresses = self.addresses_of(sends.keys())?;
        let mut work = PreparedWork::default();
        let written = Self::lock_stores(&addresses)
            .and_then(|mut guards| self.write_sends(t.id(), sends, &addresses, &mut guards, &mut work))
            .and_then(|()| self.write_acks(t, true, &mut work));
        t.prepared = Some(work);
        written
    }

    /// Prepare and publish under one hold of the store locks, so nothing
    /// routed to those addresses in between is ordered ahead of this commit.
    fn commit_one_phase(&self, t: &mut Transaction) -> Result<()> {
        let sends = group_by_address(t.take_sends());
        let addresses = self.addresses_of(sends.keys())?;
        let mut guards = Self::lock_stores(&addresses)?;
        let mut work = PreparedWork::default();
        let result = self
            .write_sends(t.id(), sends, &addresses, &mut guards, &mut work)
            .and_then(|()| self.write_acks(t, false, &mut work))
            .and_then(|()| self.publish(t.id(), &work, &addresses, &mut guards));
        if result.is_err() {
            t.prepared = Some(work);
        }
        result
    }

    /// Second phase of a two-phase commit.
    fn commit_prepared(&self, t: &mut Transaction) -> Result<()> {
        let work = t.prepared.take().unwrap_or_default();
        let result = self.addresses_of(&work.addresses()).and_then(|addresses| {
            let mut guards = Self::lock_stores(&addresses)?;
            self.publish(t.id(), &work, &addresses, &mut guards)
        });
        if result.is_err() {
            t.prepared = Some(work);
        }
        result
    }

    /// Write the sends of transaction `tx`: page records and journal records
    /// tagged with its id. Nothing becomes visible.
    fn write_sends(
        &self,
        tx: TxId,
        sends: BTreeMap<String, Vec<Message>>,
        addresses: &[Arc<AddressState>],
        guards: &mut [StoreGuard<'_>],
        work: &mut PreparedWork,
    ) -> Result<()> {
        let sync = self.config.journal.sync_transactional;
        let now = self.clock.now();
        for ((address, guard), messages) in addresses.iter().zip(guards.iter_mut()).zip(sends.into_values()) {
            guard.check_online()?;
            let queues = address.queues()?;
            if queues.is_empty() {
                continue;
            }
            let ids: Vec<QueueId> = queues.iter().map(|queue| queue.id()).collect();
            let total: u64 = messages.iter().map(Message::memory_size).sum();

            if guard.should_page(total)? {
                work.paged
                    .entry(address.name.clone())
                    .or_default()
                    .extend(ids.iter().copied());
                work.journaled = true;
                for mut message in messages {
                    message.id = self.allocate_message_id();
                    message.timestamp_ns = now;
                    guard.append(Some(tx), &message, &ids, sync)?;
                }
                continue;
            }

            let durable: Vec<QueueId> = queues
                .iter()
                .filter(|queue| queue.is_durable())
                .map(|queue| queue.id())
                .collect();
            for mut message in messages {
                message.id = self.allocate_message_id();
                message.timestamp_ns = now;
                let journaled = if message.durable && !durable.is_empty() {
                    self.append_record(&JournalRecord::AddMessage {
                        tx: Some(tx),
                        queues: durable.clone(),
                        message: message.clone(),
                    })?;
                    work.journaled = true;
                    durable.clone()
                } else {
                    Vec::new()
                };
                work.direct.push(DirectSend {
                    message,
                    queues: queues.clone(),
                    journaled,
                });
            }
        }
        Ok(())
    }

    /// Journal the acknowledgements of `t`, then the prepare marker when
    /// `two_phase`.
    fn write_acks(&self, t: &Transaction, two_phase: bool, work: &mut PreparedWork) -> Result<()> {
        let tx = t.id();
        for ack in t.acks() {
            let queue = self.queue_by_id(ack.queue)?;
            if self.journal_ack(&queue, &ack.released, Some(tx))? {
                work.journaled = true;
            }
        }
        if two_phase && work.journaled {
            let position = self.append_record(&JournalRecord::Prepare {
                tx,
                xid: t.xid().cloned(),
            })?;
            self.journal.sync_to(position)?;
        }
        Ok(())
    }

    /// Reserve fresh ids for the direct sends of a committing transaction,
    /// keeping their relative order. Returns what to add to each prepare id.
    fn reserve_commit_ids(&self, sends: &[DirectSend]) -> u64 {
        let ids = sends.iter().map(|send| send.message.id.0);
        let (Some(first), Some(last)) = (ids.clone().min(), ids.max()) else {
            return 0;
        };
        let base = self.next_message.fetch_add(last - first + 1, Ordering::AcqRel);
        base - first
    }

    /// The commit marker, then visibility. `guards` lock the stores of
    /// every address `work` sends to.
    fn publish(
        &self,
        tx: TxId,
        work: &PreparedWork,
        addresses: &[Arc<AddressState>],
        guards: &mut [StoreGuard<'_>],
    ) -> Result<()> {
        let id_shift = self.reserve_commit_ids(&work.direct);
        if work.journaled {
            let position = self.journal.mark_commit(tx, id_shift)?;
            if self.config.journal.sync_transactional {
                self.journal.sync_to(position)?;
            }
        }
        for (address, guard) in addresses.iter().zip(guards.iter_mut()) {
            if let Some(routed) = work.paged.get(&address.name) {
                let ready = guard.resolve_tx(tx, true)?;
                for queue in address.queues()? {
                    if routed.contains(&queue.id()) || ready.contains(&queue.id()) {
                        queue.set_paged_pending()?;
                    }
                }
            }
            let sends: Vec<&DirectSend> = work
                .direct
                .iter()
                .filter(|send| send.message.address == address.name)
                .collect();
            if !sends.is_empty() {
                self.publish_direct(address, guard, &sends, id_shift)?;
            }
        }
        Ok(())
    }

    /// Make one address's direct sends visible under their commit ids. An
    /// address that pages by now, or whose queues still have paged records
    /// to read, gets them as page records behind those.
    fn publish_direct(
        &self,
        address: &AddressState,
        guard: &mut StoreGuard<'_>,
        sends: &[&DirectSend],
        id_shift: u64,
    ) -> Result<()> {
        let total: u64 = sends.iter().map(|send| send.message.memory_size()).sum();
        let behind_pages = sends
            .iter()
            .flat_map(|send| &send.queues)
            .any(|queue| guard.unread(queue.id()) > 0);
        let mut page = behind_pages || guard.should_page(total)?;

        let mut paged: BTreeMap<QueueId, Arc<Queue>> = BTreeMap::new();
        let mut direct: BTreeMap<QueueId, (Arc<Queue>, Vec<Arc<StoredMessage>>)> = BTreeMap::new();
        for send in sends {
            let mut message = send.message.clone();
            message.id = MessageId(message.id.0 + id_shift);
            if page {
                match self.page_committed(guard, &message, send) {
                    Ok(()) => {
                        for queue in &send.queues {
                            paged.insert(queue.id(), Arc::clone(queue));
                        }
                        continue;
                    }
                    Err(err) => {
                        warn!(
                            "address {}: committed message {} kept in memory: {}",
                            address.name, message.id, err
                        );
                        page = false;
                    }
                }
            }
            let stored = Arc::new(StoredMessage::new(
                message,
                Arc::clone(address.store.memory_counter()),
            ));
            for queue in &send.queues {
                direct
                    .entry(queue.id())
                    .or_insert_with(|| (Arc::clone(queue), Vec::new()))
                    .1
                    .push(Arc::clone(&stored));
            }
        }
        for queue in paged.values() {
            queue.set_paged_pending()?;
        }
        for (queue, stored) in direct.values() {
            queue.enqueue(stored)?;
        }
        Ok(())
    }

    /// Append a committed send as a page record. Its journal copy is
    /// acknowledged so a restart reads it from the page only.
    fn page_committed(&self, guard: &mut StoreGuard<'_>, message: &Message, send: &DirectSend) -> Result<()> {
        let queues: Vec<QueueId> = send.queues.iter().map(|queue| queue.id()).collect();
        let sync = self.config.journal.sync_transactional || !send.journaled.is_empty();
        guard.append(None, message, &queues, sync)?;
        for &queue in &send.journaled {
            let acked = self.append_record(&JournalRecord::Ack {
                tx: None,
                queue,
                message: message.id,
            });
            if let Err(err) = acked {
                warn!("journal copy of paged message {} not acknowledged: {}", message.id, err);
            }
        }
        Ok(())
    }

    fn commit_acks(&self, acks: Vec<TxAck>) -> Result<()> {
        let mut by_queue: BTreeMap<QueueId, Vec<u64>> = BTreeMap::new();
        for ack in acks {
            by_queue.entry(ack.queue).or_default().push(ack.released.tag);
        }
        for (id, tags) in by_queue {
            let queue = self.queue_by_id(id)?;
            let pages: Vec<_> = queue
                .commit_acks(&tags)?
                .iter()
                .filter_map(|released| released.page)
                .collect();
            if pages.is_empty() {
                continue;
            }
            let address = self.address_state(queue.address())?;
            let mut guard = address.store.lock()?;
            for position in pages {
                guard.ack(id, position)?;
            }
        }
        Ok(())
    }

    /// Roll back after a failed prepare or commit, keeping the original error.
    fn abort(&self, t: &mut Transaction) {
        if let Err(err) = self.rollback_locked(t) {
            error!("transaction {} rollback after failure: {}", t.id(), err);
        }
    }

    fn rollback_locked(&self, t: &mut Transaction) -> Result<()> {
        let tx = t.id();
        if matches!(t.state(), TxState::Committed | TxState::RolledBack) {
            return Err(Error::InvalidTransactionState {
                tx: tx.0,
                state: t.state(),
                op: "rollback",
            });
        }
        t.take_sends();
        if let Some(work) = t.prepared.take() {
            for name in work.paged.keys() {
                let address = self.address_state(name)?;
                address.store.lock()?.resolve_tx(tx, false)?;
            }
            if work.journaled {
                if let Err(err) = self.journal.mark_rollback(tx) {
                    warn!("transaction {} rollback marker not written: {}", tx, err);
                }
            }
        }

        let mut by_queue: BTreeMap<QueueId, Vec<u64>> = BTreeMap::new();
        for ack in t.take_acks() {
            by_queue.entry(ack.queue).or_default().push(ack.released.tag);
        }
        for (id, tags) in by_queue {
            let queue = self.queue_by_id(id)?;
            let released = queue.cancel(&tags)?;
            self.journal_delivery_counts(&queue, &released)?;
        }

        if !t.is_recovered() {
            let session = t.session();
            let queues: BTreeMap<QueueId, Arc<Queue>> = read(&self.consumers, "consumer map poisoned")?
                .values()
                .filter(|binding| binding.session == session)
                .map(|binding| (binding.queue.id(), Arc::clone(&binding.queue)))
                .collect();
            for queue in queues.values() {
                let released = queue.cancel_session(session)?;
                self.journal_delivery_counts(queue, &released)?;
            }
        }
        t.set_state(TxState::RolledBack);
        debug!("transaction {} rolled back", tx);
        Ok(())
    }

    /// Run `handler` for every delivery of `consumer` on a dedicated thread.
    pub fn attach_handler<H: MessageHandler>(self: &Arc<Self>, consumer: ConsumerId, handler: H) -> Result<DispatchHandle> {
        self.consumer(consumer)?;
        DispatchHandle::spawn(Arc::clone(self), consumer, Arc::new(handler))
    }

    pub fn queue_snapshot(&self, name: &str) -> Result<QueueSnapshot> {
        let queue = self.queue(name)?;
        let unread = match self.find_address(queue.address())? {
            Some(address) => address.store.lock()?.unread(queue.id()),
            None => 0,
        };
        queue.snapshot(unread)
    }

    pub fn address_snapshot(&self, address: &str) -> Result<AddressSnapshot> {
        let state = self.address_state(address)?;
        Ok(AddressSnapshot {
            address: state.name.clone(),
            queues: state
                .queues()?
                .iter()
                .map(|queue| queue.name().to_string())
                .collect(),
            paging: state.store.snapshot()?,
        })
    }

    pub fn snapshot(&self) -> Result<BrokerSnapshot> {
        let names: Vec<String> = read(&self.addresses, "address map poisoned")?
            .keys()
            .cloned()
            .collect();
        let addresses = names
            .iter()
            .map(|name| self.address_snapshot(name))
            .collect::<Result<Vec<_>>>()?;
        let queues = self
            .queue_names()?
            .iter()
            .map(|name| self.queue_snapshot(name))
            .collect::<Result<Vec<_>>>()?;
        Ok(BrokerSnapshot {
            addresses,
            queues,
            active_transactions: self.transactions.len(),
            in_doubt: self.transactions.in_doubt()?,
            journal_segments: self.journal.segment_count(),
            buffer_pool: self.buffers.stats(),
            next_message_id: self.next_message.load(Ordering::Acquire),
        })
    }

    /// Flush every active page and wake blocked receivers.
    pub fn shutdown(&self) -> Result<()> {
        let addresses: Vec<Arc<AddressState>> = read(&self.addresses, "address map poisoned")?
            .values()
            .cloned()
            .collect();
        for address in addresses {
            address.store.lock()?.sync()?;
            for queue in address.queues()? {
                queue.wake()?;
            }
        }
        info!("broker shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::MemoryJournal;
    use tempfile::tempdir;

    fn broker(dir: &std::path::Path) -> Arc<Broker> {
        Broker::open_with_journal(BrokerConfig::new(dir), Arc::new(MemoryJournal::new())).unwrap()
    }

    #[test]
    fn routes_to_every_bound_queue() {
        let dir = tempdir().unwrap();
        let broker = broker(dir.path());
        broker.create_queue("orders", "orders.a", true).unwrap();
        broker.create_queue("orders", "orders.b", false).unwrap();
        assert!(matches!(
            broker.create_queue("orders", "orders.a", true),
            Err(Error::DuplicateQueue(_))
        ));

        let id = broker
            .route(Message::new("orders", b"one".to_vec()), None)
            .unwrap()
            .unwrap();
        assert_eq!(broker.route(Message::new("nowhere", b"x".to_vec()), None).unwrap(), None);

        let session = broker.open_session().unwrap();
        for name in ["orders.a", "orders.b"] {
            let consumer = broker.create_consumer(session, name, Credit::unlimited()).unwrap();
            let delivery = broker
                .deliver(consumer, Duration::from_millis(10))
                .unwrap()
                .unwrap();
            assert_eq!(delivery.message.id, id);
            assert_eq!(delivery.message.body, b"one");
            broker.acknowledge(consumer, delivery.tag, None).unwrap();
        }
        let snapshot = broker.queue_snapshot("orders.a").unwrap();
        assert_eq!(snapshot.depth, 0);
        assert_eq!(snapshot.messages_acked, 1);
    }

    #[test]
    fn messages_are_stamped_by_the_broker_clock() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(crate::clock::ManualClock::new(1_000));
        let broker = Broker::open_with(
            BrokerConfig::new(dir.path()),
            Arc::new(MemoryJournal::new()),
            Arc::clone(&clock) as Arc<dyn Clock>,
        )
        .unwrap();
        broker.create_queue("orders", "orders.q", true).unwrap();
        broker.route(Message::new("orders", b"a".to_vec()), None).unwrap();

        clock.advance(500);
        let session = broker.open_session().unwrap();
        let tx = broker.begin(session).unwrap();
        broker.route(Message::new("orders", b"b".to_vec()), Some(tx)).unwrap();
        clock.advance(500);
        broker.commit(tx).unwrap();

        let consumer = broker.create_consumer(session, "orders.q", Credit::unlimited()).unwrap();
        let stamps: Vec<u64> = (0..2)
            .map(|_| {
                broker
                    .deliver(consumer, Duration::ZERO)
                    .unwrap()
                    .unwrap()
                    .message
                    .timestamp_ns
            })
            .collect();
        assert_eq!(stamps, vec![1_000, 2_000]);
    }

    #[test]
    fn committed_sends_take_ids_in_commit_order() {
        let dir = tempdir().unwrap();
        let broker = broker(dir.path());
        broker.create_queue("orders", "orders.q", true).unwrap();
        let session = broker.open_session().unwrap();
        let tx = broker
            .begin_xa(session, Xid::new(1, b"g".to_vec(), b"b".to_vec()))
            .unwrap();
        broker.route(Message::new("orders", b"xa".to_vec()), Some(tx)).unwrap();
        broker.prepare(tx).unwrap();
        let routed: Vec<MessageId> = (0..3)
            .map(|i| {
                broker
                    .route(Message::new("orders", vec![i]), None)
                    .unwrap()
                    .unwrap()
            })
            .collect();
        broker.commit(tx).unwrap();

        let consumer = broker.create_consumer(session, "orders.q", Credit::unlimited()).unwrap();
        let delivered: Vec<Arc<Message>> = (0..4)
            .map(|_| broker.deliver(consumer, Duration::ZERO).unwrap().unwrap().message)
            .collect();
        let ids: Vec<MessageId> = delivered.iter().map(|message| message.id).collect();
        assert_eq!(&ids[..3], &routed[..]);
        assert_eq!(delivered[3].body, b"xa");
        assert!(ids[3] > routed[2]);
    }

    #[test]
    fn transactional_send_is_invisible_until_commit() {
        let dir = tempdir().unwrap();
        let broker = broker(dir.path());
        broker.create_queue("orders", "orders.q", true).unwrap();
        let session = broker.open_session().unwrap();
        let consumer = broker
            .create_consumer(session, "orders.q", Credit::unlimited())
            .unwrap();

        let tx = broker.begin(session).unwrap();
        broker.route(Message::new("orders", b"a".to_vec()), Some(tx)).unwrap();
        assert!(broker.deliver(consumer, Duration::from_millis(5)).unwrap().is_none());
        broker.commit(tx).unwrap();
        assert!(broker.deliver(consumer, Duration::from_millis(5)).unwrap().is_some());
        assert!(matches!(broker.commit(tx), Err(Error::UnknownTransaction(_))));
    }

    #[test]
    fn send_to_unbound_address_makes_transaction_rollback_only() {
        let dir = tempdir().unwrap();
        let broker = broker(dir.path());
        broker.create_queue("orders", "orders.q", true).unwrap();
        let session = broker.open_session().unwrap();
        let tx = broker.begin(session).unwrap();
        broker.route(Message::new("orders", b"a".to_vec()), Some(tx)).unwrap();
        assert!(broker.route(Message::new("missing", b"b".to_vec()), Some(tx)).is_err());
        assert!(matches!(broker.commit(tx), Err(Error::RollbackOnly { .. })));
        assert_eq!(broker.queue_snapshot("orders.q").unwrap().depth, 0);
    }

    #[test]
    fn closing_a_consumer_returns_its_deliveries() {
        let dir = tempdir().unwrap();
        let broker = broker(dir.path());
        broker.create_queue("orders", "orders.q", true).unwrap();
        for body in [b"a", b"b"] {
            broker.route(Message::new("orders", body.to_vec()), None).unwrap();
        }
        let session = broker.open_session().unwrap();
        let first = broker
            .create_consumer(session, "orders.q", Credit::unlimited())
            .unwrap();
        broker.deliver(first, Duration::ZERO).unwrap().unwrap();
        broker.deliver(first, Duration::ZERO).unwrap().unwrap();
        broker.close_consumer(first).unwrap();

        let second = broker
            .create_consumer(session, "orders.q", Credit::unlimited())
            .unwrap();
        let again = broker.deliver(second, Duration::ZERO).unwrap().unwrap();
        assert_eq!(again.message.body, b"a");
        assert!(again.is_redelivery());
    }
}
