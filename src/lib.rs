//! Transactional broker queue engine with ordered disk paging.
//!
//! Messages routed to an address are held in memory per bound queue until the
//! address's backlog crosses its high watermark; from then on they are
//! appended to the address's page files and read back in order. Sends and
//! acknowledgements can be grouped into one-phase or two-phase transactions,
//! and a durable journal lets a restarted broker recover every committed
//! message exactly once.

use std::sync::{Mutex, MutexGuard};

pub mod broker;
pub mod buffer_pool;
pub mod clock;
pub mod codec;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod journal;
pub mod management;
pub mod message;
pub mod paging;
pub mod queue;
pub mod session;
pub mod storage;
pub mod transaction;

pub use broker::{Broker, Delivery};
pub use clock::{Clock, ManualClock, QuantaClock, SystemClock};
pub use config::{AddressSettings, BrokerConfig, FullPolicy, JournalConfig};
pub use dispatch::{AckDecision, MessageHandler};
pub use error::{Error, Result};
pub use journal::{DurableLog, FileJournal, MemoryJournal};
pub use management::{AddressSnapshot, BrokerSnapshot, QueueSnapshot};
pub use message::{Message, MessageId, PropertyValue};
pub use queue::{ConsumerId, Credit, QueueId};
pub use session::{Session, SessionId};
pub use transaction::{TxId, TxState, Xid};

/// Lock `m`, reporting a poisoned lock as corruption of `what`.
pub(crate) fn lock<'a, T>(m: &'a Mutex<T>, what: &'static str) -> Result<MutexGuard<'a, T>> {
    m.lock().map_err(|_| Error::Corrupt(what))
}
