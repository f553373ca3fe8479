use serde::{Deserialize, Serialize};

use crate::queue::ConsumerId;
use crate::session::SessionId;

/// A consumer's flow-control window: how much it may hold unacknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Credit {
    pub messages: Option<u32>,
    pub bytes: Option<u64>,
}

impl Credit {
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn messages(messages: u32) -> Self {
        Self {
            messages: Some(messages),
            bytes: None,
        }
    }

    pub fn bytes(bytes: u64) -> Self {
        Self {
            messages: None,
            bytes: Some(bytes),
        }
    }

    pub fn with_bytes(mut self, bytes: u64) -> Self {
        self.bytes = Some(bytes);
        self
    }
}

#[derive(Debug)]
pub(crate) struct ConsumerState {
    pub id: ConsumerId,
    pub session: SessionId,
    pub credit: Credit,
    outstanding_messages: u32,
    outstanding_bytes: u64,
    pub delivered: u64,
}

impl ConsumerState {
    pub fn new(id: ConsumerId, session: SessionId, credit: Credit) -> Self {
        Self {
            id,
            session,
            credit,
            outstanding_messages: 0,
            outstanding_bytes: 0,
            delivered: 0,
        }
    }

    /// A message of `size` bytes fits the window. A consumer holding nothing
    /// always gets one message, however large.
    pub fn has_credit(&self, size: u64) -> bool {
        if self.credit.messages.is_some_and(|max| self.outstanding_messages >= max) {
            return false;
        }
        match self.credit.bytes {
            Some(max) if self.outstanding_bytes > 0 => self.outstanding_bytes + size <= max,
            _ => true,
        }
    }

    pub fn take(&mut self, size: u64) {
        self.outstanding_messages += 1;
        self.outstanding_bytes += size;
        self.delivered += 1;
    }

    pub fn give_back(&mut self, size: u64) {
        self.outstanding_messages = self.outstanding_messages.saturating_sub(1);
        self.outstanding_bytes = self.outstanding_bytes.saturating_sub(size);
    }

    pub fn outstanding(&self) -> u32 {
        self.outstanding_messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_window_limits_outstanding() {
        let mut consumer = ConsumerState::new(ConsumerId(1), SessionId(1), Credit::messages(2));
        assert!(consumer.has_credit(10));
        consumer.take(10);
        consumer.take(10);
        assert!(!consumer.has_credit(10));
        consumer.give_back(10);
        assert!(consumer.has_credit(10));
        assert_eq!(consumer.delivered, 2);
    }

    #[test]
    fn byte_window_admits_one_oversized_message() {
        let mut consumer = ConsumerState::new(ConsumerId(1), SessionId(1), Credit::bytes(100));
        assert!(consumer.has_credit(500));
        consumer.take(500);
        assert!(!consumer.has_credit(1));
        consumer.give_back(500);
        consumer.take(60);
        assert!(consumer.has_credit(40));
        assert!(!consumer.has_credit(41));
    }
}
