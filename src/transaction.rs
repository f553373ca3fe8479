//! Transactions and the transaction registry.
//!
//! A transaction buffers sends and holds acknowledged references pending
//! until it commits. Nothing it does is visible before commit. Two-phase
//! transactions carry an [`Xid`] and can survive a restart in the prepared
//! state, waiting for an external coordinator to resolve them.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::codec::{Decoder, Encoder};
use crate::message::Message;
use crate::queue::{ConsumerId, Queue, QueueId, Released};
use crate::session::SessionId;
use crate::{lock, Error, Result};

/// Transaction id. Zero is reserved for "no transaction" in records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxId(pub u64);

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Two-phase transaction identifier assigned by the external coordinator.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Xid {
    pub format_id: i32,
    pub global_id: Vec<u8>,
    pub branch: Vec<u8>,
}

impl Xid {
    pub fn new(format_id: i32, global_id: impl Into<Vec<u8>>, branch: impl Into<Vec<u8>>) -> Self {
        Self {
            format_id,
            global_id: global_id.into(),
            branch: branch.into(),
        }
    }

    pub fn encode(&self, enc: &mut Encoder<'_>) -> Result<()> {
        enc.put_i32(self.format_id);
        enc.put_bytes(&self.global_id)?;
        enc.put_bytes(&self.branch)
    }

    pub fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        Ok(Self {
            format_id: dec.get_i32()?,
            global_id: dec.get_bytes()?.to_vec(),
            branch: dec.get_bytes()?.to_vec(),
        })
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.format_id)?;
        for byte in &self.global_id {
            write!(f, "{byte:02x}")?;
        }
        f.write_str(":")?;
        for byte in &self.branch {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxState {
    Active,
    Prepared,
    Committed,
    RolledBack,
}

/// A reference acknowledged inside a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxAck {
    pub queue: QueueId,
    /// `None` for acknowledgements restored at recovery.
    pub consumer: Option<ConsumerId>,
    pub released: Released,
}

/// A send held in memory at prepare. Commit gives it its final id and
/// either enqueues it or, when its address is paging by then, pages it.
pub(crate) struct DirectSend {
    pub message: Message,
    pub queues: Vec<Arc<Queue>>,
    /// Queues listed in its journal record. Empty when it was not journaled.
    pub journaled: Vec<QueueId>,
}

/// Effects written at prepare, applied at commit.
#[derive(Default)]
pub(crate) struct PreparedWork {
    /// Sends in prepare order.
    pub direct: Vec<DirectSend>,
    /// Addresses with page records of this transaction, and the queues
    /// they route to.
    pub paged: BTreeMap<String, BTreeSet<QueueId>>,
    /// A journal record was written, so outcome markers are needed.
    pub journaled: bool,
}

impl PreparedWork {
    /// Every address this work sends to.
    pub fn addresses(&self) -> BTreeSet<String> {
        let mut names: BTreeSet<String> = self.paged.keys().cloned().collect();
        names.extend(self.direct.iter().map(|send| send.message.address.clone()));
        names
    }
}

pub struct Transaction {
    id: TxId,
    session: SessionId,
    xid: Option<Xid>,
    state: TxState,
    sends: Vec<Message>,
    acks: Vec<TxAck>,
    rollback_only: Option<String>,
    pub(crate) prepared: Option<PreparedWork>,
    recovered: bool,
}

impl Transaction {
    fn new(id: TxId, session: SessionId, xid: Option<Xid>) -> Self {
        Self {
            id,
            session,
            xid,
            state: TxState::Active,
            sends: Vec::new(),
            acks: Vec::new(),
            rollback_only: None,
            prepared: None,
            recovered: false,
        }
    }

    pub fn id(&self) -> TxId {
        self.id
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn xid(&self) -> Option<&Xid> {
        self.xid.as_ref()
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: TxState) {
        self.state = state;
    }

    pub fn is_recovered(&self) -> bool {
        self.recovered
    }

    pub fn rollback_only(&self) -> Option<&str> {
        self.rollback_only.as_deref()
    }

    pub(crate) fn mark_rollback_only(&mut self, reason: impl Into<String>) {
        if self.rollback_only.is_none() {
            self.rollback_only = Some(reason.into());
        }
    }

    /// Fail unless the transaction is in `expected`.
    pub(crate) fn expect(&self, expected: TxState, op: &'static str) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(Error::InvalidTransactionState {
                tx: self.id.0,
                state: self.state,
                op,
            })
        }
    }

    pub(crate) fn add_send(&mut self, message: Message) {
        self.sends.push(message);
    }

    pub(crate) fn take_sends(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.sends)
    }

    pub(crate) fn add_ack(&mut self, ack: TxAck) {
        self.acks.push(ack);
    }

    pub fn acks(&self) -> &[TxAck] {
        &self.acks
    }

    pub(crate) fn take_acks(&mut self) -> Vec<TxAck> {
        std::mem::take(&mut self.acks)
    }

    pub fn pending_sends(&self) -> usize {
        self.sends.len()
    }
}

/// Summary of a prepared transaction awaiting resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InDoubt {
    pub tx: TxId,
    pub xid: Option<Xid>,
    pub acks: usize,
}

pub type TxHandle = Arc<Mutex<Transaction>>;

pub struct TransactionRegistry {
    next_id: AtomicU64,
    txs: Mutex<BTreeMap<TxId, TxHandle>>,
}

impl TransactionRegistry {
    pub fn new(next_id: u64) -> Self {
        Self {
            next_id: AtomicU64::new(next_id.max(1)),
            txs: Mutex::new(BTreeMap::new()),
        }
    }

    /// Next id that would be allocated.
    pub fn next_id(&self) -> u64 {
        self.next_id.load(Ordering::Acquire)
    }

    fn allocate(&self) -> TxId {
        TxId(self.next_id.fetch_add(1, Ordering::AcqRel))
    }

    pub fn begin(&self, session: SessionId) -> Result<TxId> {
        let id = self.allocate();
        let tx = Arc::new(Mutex::new(Transaction::new(id, session, None)));
        lock(&self.txs, "transaction registry lock poisoned")?.insert(id, tx);
        Ok(id)
    }

    pub fn begin_xa(&self, session: SessionId, xid: Xid) -> Result<TxId> {
        if self.find_xa(&xid)?.is_some() {
            return Err(Error::Unsupported("xid already in use"));
        }
        let id = self.allocate();
        let tx = Arc::new(Mutex::new(Transaction::new(id, session, Some(xid))));
        lock(&self.txs, "transaction registry lock poisoned")?.insert(id, tx);
        Ok(id)
    }

    /// Register a transaction found prepared in the journal.
    pub(crate) fn insert_recovered(
        &self,
        id: TxId,
        xid: Option<Xid>,
        acks: Vec<TxAck>,
        prepared: PreparedWork,
    ) -> Result<()> {
        let mut tx = Transaction::new(id, SessionId(0), xid);
        tx.state = TxState::Prepared;
        tx.acks = acks;
        tx.prepared = Some(prepared);
        tx.recovered = true;
        lock(&self.txs, "transaction registry lock poisoned")?
            .insert(id, Arc::new(Mutex::new(tx)));
        Ok(())
    }

    pub fn get(&self, id: TxId) -> Result<TxHandle> {
        lock(&self.txs, "transaction registry lock poisoned")?
            .get(&id)
            .cloned()
            .ok_or(Error::UnknownTransaction(id.0))
    }

    pub fn remove(&self, id: TxId) -> Result<()> {
        lock(&self.txs, "transaction registry lock poisoned")?.remove(&id);
        Ok(())
    }

    /// Handles of every registered transaction. Transaction locks are taken
    /// only after the registry lock is released.
    fn handles(&self) -> Result<Vec<(TxId, TxHandle)>> {
        let txs = lock(&self.txs, "transaction registry lock poisoned")?;
        Ok(txs.iter().map(|(id, tx)| (*id, Arc::clone(tx))).collect())
    }

    pub fn find_xa(&self, xid: &Xid) -> Result<Option<TxId>> {
        for (id, tx) in &self.handles()? {
            if lock(tx, "transaction lock poisoned")?.xid.as_ref() == Some(xid) {
                return Ok(Some(*id));
            }
        }
        Ok(None)
    }

    /// Active transactions of `session`.
    pub fn of_session(&self, session: SessionId) -> Result<Vec<TxId>> {
        let mut found = Vec::new();
        for (id, tx) in &self.handles()? {
            let tx = lock(tx, "transaction lock poisoned")?;
            if tx.session == session && !tx.recovered && tx.state == TxState::Active {
                found.push(*id);
            }
        }
        Ok(found)
    }

    /// Prepared transactions recovered from the journal and not yet resolved.
    pub fn in_doubt(&self) -> Result<Vec<InDoubt>> {
        let mut found = Vec::new();
        for (id, tx) in &self.handles()? {
            let tx = lock(tx, "transaction lock poisoned")?;
            if tx.recovered && tx.state == TxState::Prepared {
                found.push(InDoubt {
                    tx: *id,
                    xid: tx.xid.clone(),
                    acks: tx.acks.len(),
                });
            }
        }
        Ok(found)
    }

    pub fn len(&self) -> usize {
        self.txs.lock().map(|txs| txs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_start_at_one_and_xids_are_unique() {
        let registry = TransactionRegistry::new(0);
        let first = registry.begin(SessionId(1)).unwrap();
        assert_eq!(first, TxId(1));

        let xid = Xid::new(7, b"gtrid".to_vec(), b"bq".to_vec());
        let xa = registry.begin_xa(SessionId(1), xid.clone()).unwrap();
        assert_eq!(registry.find_xa(&xid).unwrap(), Some(xa));
        assert!(registry.begin_xa(SessionId(2), xid).is_err());
        assert_eq!(registry.of_session(SessionId(1)).unwrap().len(), 2);
        assert!(registry.in_doubt().unwrap().is_empty());
    }

    #[test]
    fn state_checks_name_the_operation() {
        let registry = TransactionRegistry::new(5);
        let id = registry.begin(SessionId(1)).unwrap();
        let handle = registry.get(id).unwrap();
        let mut tx = handle.lock().unwrap();
        tx.set_state(TxState::Committed);
        let err = tx.expect(TxState::Active, "prepare").unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidTransactionState {
                state: TxState::Committed,
                op: "prepare",
                ..
            }
        ));
        assert!(matches!(
            registry.get(TxId(99)),
            Err(Error::UnknownTransaction(99))
        ));
    }

    #[test]
    fn recovered_prepared_transactions_are_in_doubt() {
        let registry = TransactionRegistry::new(10);
        let xid = Xid::new(1, b"g".to_vec(), b"b".to_vec());
        registry
            .insert_recovered(TxId(4), Some(xid.clone()), Vec::new(), PreparedWork::default())
            .unwrap();
        let in_doubt = registry.in_doubt().unwrap();
        assert_eq!(in_doubt.len(), 1);
        assert_eq!(in_doubt[0].xid.as_ref(), Some(&xid));
        assert_eq!(format!("{xid}"), "1:67:62");
    }
}
