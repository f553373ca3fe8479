use thiserror::Error;

use crate::transaction::TxState;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt data: {0}")]
    Corrupt(&'static str),
    #[error("unsupported version: {0}")]
    UnsupportedVersion(u32),
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    #[error("payload too large")]
    PayloadTooLarge,
    #[error("string too long: {0} bytes")]
    StringTooLong(usize),
    #[error("order violation on queue {queue}: {detail}")]
    OrderViolation { queue: String, detail: String },
    #[error("queue {queue} is offline: {reason}")]
    QueueOffline { queue: String, reason: String },
    #[error("address {address} is offline: {reason}")]
    AddressOffline { address: String, reason: String },
    #[error("address {0} is full")]
    CapacityExceeded(String),
    #[error("unknown queue: {0}")]
    UnknownQueue(String),
    #[error("queue already exists: {0}")]
    DuplicateQueue(String),
    #[error("unknown consumer: {0}")]
    UnknownConsumer(u64),
    #[error("unknown session: {0}")]
    UnknownSession(u64),
    #[error("unknown transaction: {0}")]
    UnknownTransaction(u64),
    #[error("unknown delivery {tag} on queue {queue}")]
    UnknownDelivery { queue: String, tag: u64 },
    #[error("transaction {tx} is {state:?}, cannot {op}")]
    InvalidTransactionState {
        tx: u64,
        state: TxState,
        op: &'static str,
    },
    #[error("transaction {tx} is rollback-only: {reason}")]
    RollbackOnly { tx: u64, reason: String },
    #[error("invalid config: {0}")]
    Config(String),
}

impl Error {
    /// True for failures of the storage layer rather than of the caller's request.
    pub fn is_io(&self) -> bool {
        matches!(self, Error::Io(_) | Error::Corrupt(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
