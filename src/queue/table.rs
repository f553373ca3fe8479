use std::collections::VecDeque;

use crate::queue::reference::Reference;

/// References waiting for delivery, ordered by `seq`.
///
/// New references carry increasing sequence numbers and go to the tail.
/// Cancelled references are merged back by sequence number, which puts them
/// ahead of everything enqueued after them.
#[derive(Debug, Default)]
pub struct ReferenceTable {
    refs: VecDeque<Reference>,
}

impl ReferenceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_back(&mut self, reference: Reference) {
        debug_assert!(self.refs.back().map_or(true, |last| last.seq < reference.seq));
        self.refs.push_back(reference);
    }

    pub fn front(&self) -> Option<&Reference> {
        self.refs.front()
    }

    pub fn pop_front(&mut self) -> Option<Reference> {
        self.refs.pop_front()
    }

    /// Merge `refs` back into place by sequence number.
    pub fn reinsert(&mut self, mut refs: Vec<Reference>) {
        refs.sort_unstable_by_key(|reference| reference.seq);
        // Cancelled references usually all belong at the head.
        if self.refs.front().map_or(true, |head| {
            refs.last().is_some_and(|last| last.seq < head.seq)
        }) {
            for reference in refs.into_iter().rev() {
                self.refs.push_front(reference);
            }
            return;
        }
        for reference in refs {
            let idx = self.refs.partition_point(|existing| existing.seq < reference.seq);
            self.refs.insert(idx, reference);
        }
    }

    pub fn len(&self) -> usize {
        self.refs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Reference> {
        self.refs.iter()
    }

    pub fn paged_count(&self) -> usize {
        self.refs
            .iter()
            .filter(|reference| reference.page_position().is_some())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageId;
    use crate::paging::PagePosition;
    use crate::queue::reference::Location;

    fn reference(seq: u64) -> Reference {
        Reference {
            seq,
            message_id: MessageId(seq),
            location: Location::Paged {
                position: PagePosition::new(0, 64),
                size: 1,
            },
            delivery_count: 0,
        }
    }

    fn seqs(table: &ReferenceTable) -> Vec<u64> {
        table.iter().map(|reference| reference.seq).collect()
    }

    #[test]
    fn cancelled_refs_return_ahead_of_newer_ones() {
        let mut table = ReferenceTable::new();
        for seq in 0..6 {
            table.push_back(reference(seq));
        }
        let taken: Vec<_> = (0..3).filter_map(|_| table.pop_front()).collect();
        table.push_back(reference(6));

        // Cancelled out of order; they come back in original order.
        let mut cancelled = taken;
        cancelled.reverse();
        table.reinsert(cancelled);
        assert_eq!(seqs(&table), vec![0, 1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn interleaved_reinsert_merges_by_seq() {
        let mut table = ReferenceTable::new();
        for seq in [1, 3, 5] {
            table.push_back(reference(seq));
        }
        table.reinsert(vec![reference(4), reference(0), reference(2)]);
        assert_eq!(seqs(&table), vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(table.paged_count(), 6);
    }

    #[test]
    fn reinsert_into_empty_table() {
        let mut table = ReferenceTable::new();
        table.reinsert(vec![reference(2), reference(1)]);
        assert_eq!(seqs(&table), vec![1, 2]);
        assert_eq!(table.pop_front().map(|r| r.seq), Some(1));
    }
}
