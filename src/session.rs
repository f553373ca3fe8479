//! Session handle for the transport layer.
//!
//! A [`Session`] bundles a broker session id with at most one local
//! transaction. Sends and acknowledgements go through the current
//! transaction when one is open, otherwise they take effect at once.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::broker::{Broker, Delivery};
use crate::message::{Message, MessageId};
use crate::queue::{ConsumerId, Credit};
use crate::transaction::TxId;
use crate::{lock, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub struct Session {
    broker: Arc<Broker>,
    id: SessionId,
    tx: Mutex<Option<TxId>>,
    closed: bool,
}

impl Session {
    pub fn open(broker: &Arc<Broker>) -> Result<Self> {
        let id = broker.open_session()?;
        Ok(Self {
            broker: Arc::clone(broker),
            id,
            tx: Mutex::new(None),
            closed: false,
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    fn current(&self) -> Result<Option<TxId>> {
        Ok(*lock(&self.tx, "session lock poisoned")?)
    }

    /// Open a local transaction; later sends and acks join it until
    /// `commit` or `rollback`. Returns the already open one if any.
    pub fn begin(&self) -> Result<TxId> {
        let mut tx = lock(&self.tx, "session lock poisoned")?;
        if let Some(tx) = *tx {
            return Ok(tx);
        }
        let id = self.broker.begin(self.id)?;
        *tx = Some(id);
        Ok(id)
    }

    pub fn transaction(&self) -> Result<Option<TxId>> {
        self.current()
    }

    pub fn commit(&self) -> Result<()> {
        let tx = lock(&self.tx, "session lock poisoned")?.take();
        match tx {
            Some(tx) => self.broker.commit(tx),
            None => Ok(()),
        }
    }

    pub fn rollback(&self) -> Result<()> {
        let tx = lock(&self.tx, "session lock poisoned")?.take();
        match tx {
            Some(tx) => self.broker.rollback(tx),
            None => Ok(()),
        }
    }

    /// Route `message`. Returns the id it was stored under, or `None` when it
    /// joined a transaction or no queue is bound to its address.
    pub fn send(&self, message: Message) -> Result<Option<MessageId>> {
        let tx = self.current()?;
        self.broker.route(message, tx)
    }

    pub fn create_consumer(&self, queue: &str, credit: Credit) -> Result<ConsumerId> {
        self.broker.create_consumer(self.id, queue, credit)
    }

    pub fn close_consumer(&self, consumer: ConsumerId) -> Result<()> {
        self.broker.close_consumer(consumer)
    }

    pub fn receive(&self, consumer: ConsumerId, timeout: Duration) -> Result<Option<Delivery>> {
        self.broker.deliver(consumer, timeout)
    }

    pub fn ack(&self, delivery: &Delivery) -> Result<()> {
        let tx = self.current()?;
        self.broker.acknowledge(delivery.consumer, delivery.tag, tx)
    }

    /// Return `delivery` to the head of its queue.
    pub fn cancel(&self, delivery: &Delivery) -> Result<()> {
        self.broker.cancel(delivery.consumer, delivery.tag)
    }

    /// Roll back the open transaction and close every consumer of the
    /// session. Unacknowledged deliveries return to their queues.
    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        self.broker.close_session(self.id)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(err) = self.broker.close_session(self.id) {
            warn!("session {} close failed: {}", self.id, err);
        }
    }
}
