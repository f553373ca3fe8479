//! Per-queue read position over an address's pages.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::message::MessageId;
use crate::paging::page::{PageRecordHeader, PageTxState};
use crate::paging::PagePosition;
use crate::queue::QueueId;
use crate::transaction::TxId;

/// What a cursor does with the record under it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Deliver,
    /// Not for this queue, already acknowledged, or from a rolled back
    /// transaction.
    Skip,
    /// Belongs to a prepared transaction; delivered once it commits.
    Defer(TxId),
}

#[derive(Debug, Clone)]
pub struct QueueCursor {
    /// Next record to read.
    pub(crate) position: PagePosition,
    /// Records this queue must never deliver again: acknowledged before a
    /// restart, or already handed to the queue during recovery.
    skip: BTreeSet<PagePosition>,
    /// Depaged but not yet acknowledged, per page.
    outstanding: BTreeMap<u64, u32>,
    deferred: BTreeMap<TxId, Vec<PagePosition>>,
    /// Positions of committed transactions the cursor already passed.
    ready: VecDeque<PagePosition>,
    /// Deliverable records not yet handed to the queue.
    unread: u64,
    last_depaged: Option<MessageId>,
}

impl QueueCursor {
    pub fn new(position: PagePosition) -> Self {
        Self {
            position,
            skip: BTreeSet::new(),
            outstanding: BTreeMap::new(),
            deferred: BTreeMap::new(),
            ready: VecDeque::new(),
            unread: 0,
            last_depaged: None,
        }
    }

    pub fn position(&self) -> PagePosition {
        self.position
    }

    pub fn unread(&self) -> u64 {
        self.unread
    }

    pub(crate) fn add_unread(&mut self, count: u64) {
        self.unread += count;
    }

    pub(crate) fn consume_unread(&mut self) {
        self.unread = self.unread.saturating_sub(1);
    }

    pub fn classify(
        &self,
        queue: QueueId,
        position: PagePosition,
        header: &PageRecordHeader,
        tx_state: impl Fn(TxId) -> Option<PageTxState>,
    ) -> Disposition {
        if !header.routes_to(queue) || self.skip.contains(&position) {
            return Disposition::Skip;
        }
        match header.tx {
            None => Disposition::Deliver,
            Some(tx) => match tx_state(tx) {
                Some(PageTxState::Committed) => Disposition::Deliver,
                Some(PageTxState::Prepared) => Disposition::Defer(tx),
                Some(PageTxState::RolledBack) | None => Disposition::Skip,
            },
        }
    }

    /// Record a page-order delivery, returning the previous id when `id`
    /// would break ordering.
    pub(crate) fn check_order(&mut self, id: MessageId) -> Result<(), MessageId> {
        match self.last_depaged {
            Some(last) if id <= last => Err(last),
            _ => {
                self.last_depaged = Some(id);
                Ok(())
            }
        }
    }

    pub(crate) fn skip(&mut self, position: PagePosition) {
        self.skip.insert(position);
    }

    /// Forget a skip entry once the cursor has passed it.
    pub(crate) fn passed(&mut self, position: PagePosition) -> bool {
        self.skip.remove(&position)
    }

    pub(crate) fn depaged(&mut self, position: PagePosition) {
        *self.outstanding.entry(position.page).or_default() += 1;
    }

    pub(crate) fn acked(&mut self, position: PagePosition) {
        if let Some(count) = self.outstanding.get_mut(&position.page) {
            *count -= 1;
            if *count == 0 {
                self.outstanding.remove(&position.page);
            }
        }
    }

    pub(crate) fn defer(&mut self, tx: TxId, position: PagePosition) {
        self.deferred.entry(tx).or_default().push(position);
    }

    /// Settle positions deferred on `tx`. Returns true when positions became
    /// ready for delivery.
    pub(crate) fn resolve(&mut self, tx: TxId, committed: bool) -> bool {
        let Some(positions) = self.deferred.remove(&tx) else {
            return false;
        };
        if committed {
            self.ready.extend(positions);
            true
        } else {
            self.unread = self.unread.saturating_sub(positions.len() as u64);
            false
        }
    }

    pub(crate) fn next_ready(&mut self) -> Option<PagePosition> {
        self.ready.pop_front()
    }

    pub fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    pub fn has_deferred(&self) -> bool {
        !self.deferred.is_empty()
    }

    /// True while this queue still needs records of `page`: the cursor has
    /// not moved past it, or references into it are unacknowledged, ready,
    /// or waiting on a transaction.
    pub fn holds_page(&self, page: u64) -> bool {
        self.position.page <= page
            || self.outstanding.contains_key(&page)
            || self.ready.iter().any(|pos| pos.page == page)
            || self
                .deferred
                .values()
                .flatten()
                .any(|pos| pos.page == page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(tx: Option<TxId>, queues: &[u64]) -> PageRecordHeader {
        PageRecordHeader {
            tx,
            message_id: MessageId(1),
            queues: queues.iter().copied().map(QueueId).collect(),
        }
    }

    fn pos(page: u64, offset: u32) -> PagePosition {
        PagePosition { page, offset }
    }

    #[test]
    fn classify_follows_routing_acks_and_tx_outcome() {
        let mut cursor = QueueCursor::new(pos(0, 64));
        let q = QueueId(1);
        let none = |_: TxId| None;
        let prepared = |_: TxId| Some(PageTxState::Prepared);
        let committed = |_: TxId| Some(PageTxState::Committed);

        assert_eq!(cursor.classify(q, pos(0, 64), &header(None, &[2]), none), Disposition::Skip);
        assert_eq!(cursor.classify(q, pos(0, 64), &header(None, &[1]), none), Disposition::Deliver);
        assert_eq!(
            cursor.classify(q, pos(0, 64), &header(Some(TxId(4)), &[1]), prepared),
            Disposition::Defer(TxId(4))
        );
        assert_eq!(
            cursor.classify(q, pos(0, 64), &header(Some(TxId(4)), &[1]), committed),
            Disposition::Deliver
        );
        // Unknown transactions never committed.
        assert_eq!(
            cursor.classify(q, pos(0, 64), &header(Some(TxId(4)), &[1]), none),
            Disposition::Skip
        );

        cursor.skip(pos(0, 64));
        assert_eq!(cursor.classify(q, pos(0, 64), &header(None, &[1]), none), Disposition::Skip);
    }

    #[test]
    fn order_check_rejects_regressions() {
        let mut cursor = QueueCursor::new(pos(0, 64));
        assert!(cursor.check_order(MessageId(5)).is_ok());
        assert!(cursor.check_order(MessageId(9)).is_ok());
        assert_eq!(cursor.check_order(MessageId(9)), Err(MessageId(9)));
        assert_eq!(cursor.check_order(MessageId(3)), Err(MessageId(9)));
    }

    #[test]
    fn page_is_held_until_acked_and_passed() {
        let mut cursor = QueueCursor::new(pos(0, 64));
        cursor.depaged(pos(0, 64));
        assert!(cursor.holds_page(0));
        cursor.position = pos(1, 64);
        assert!(cursor.holds_page(0));
        cursor.acked(pos(0, 64));
        assert!(!cursor.holds_page(0));
        assert!(cursor.holds_page(1));
    }

    #[test]
    fn deferred_positions_become_ready_on_commit() {
        let mut cursor = QueueCursor::new(pos(2, 64));
        cursor.add_unread(3);
        cursor.defer(TxId(1), pos(1, 64));
        cursor.defer(TxId(1), pos(1, 128));
        cursor.defer(TxId(2), pos(1, 192));
        assert!(cursor.holds_page(1));

        assert!(cursor.resolve(TxId(1), true));
        assert!(!cursor.resolve(TxId(2), false));
        assert_eq!(cursor.unread(), 2);
        assert_eq!(cursor.next_ready(), Some(pos(1, 64)));
        assert_eq!(cursor.next_ready(), Some(pos(1, 128)));
        assert_eq!(cursor.next_ready(), None);
        assert!(!cursor.has_deferred());
    }
}
