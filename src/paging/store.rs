//! Page store of one address.
//!
//! All state sits behind one mutex. Callers take a [`StoreGuard`] for the
//! duration of a routing decision so that the paging check, id allocation
//! and the page append happen atomically with respect to other producers
//! and to depaging.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Instant;

use log::{debug, error, info, warn};
use serde::Serialize;

use crate::buffer_pool::BufferPool;
use crate::clock::Clock;
use crate::config::{AddressSettings, FullPolicy};
use crate::message::{Message, MessageId};
use crate::paging::cursor::{Disposition, QueueCursor};
use crate::paging::page::{
    decode_page_header, decode_page_record, encode_page_record, page_record_len, PageEntry,
    PageRecordHeader, PageSummary, PageTxState, PAGE_RECORD_KIND,
};
use crate::paging::{PagePosition, ADDRESS_FILE};
use crate::queue::QueueId;
use crate::storage::segment::seal_segment;
use crate::storage::{
    discover_segments, open_segment, read_record, read_segment_header, record_len,
    remove_segment, repair_segment, MmapFile, RecordView, SegmentKind, SegmentWriter,
    SEG_DATA_OFFSET,
};
use crate::transaction::TxId;
use crate::{Error, Result};

/// A paged message handed to a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagedRecord {
    pub position: PagePosition,
    pub message_id: MessageId,
    /// Encoded record size, used for byte credit.
    pub size: u64,
}

#[derive(Debug, Default)]
pub struct Depaged {
    pub records: Vec<PagedRecord>,
    /// More records are readable right now.
    pub more: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CursorSummary {
    pub queue: u64,
    pub position: PagePosition,
    pub unread: u64,
    pub ready: bool,
    pub deferred: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PagingSnapshot {
    pub paging: bool,
    pub blocked: bool,
    pub offline: Option<String>,
    pub memory_bytes: u64,
    pub disk_bytes: u64,
    pub max_disk_bytes: Option<u64>,
    pub pages_created: u64,
    pub pages_deleted: u64,
    pub records_paged: u64,
    pub records_depaged: u64,
    pub pages: Vec<PageSummary>,
    pub cursors: Vec<CursorSummary>,
}

pub struct PagingStore {
    address: String,
    settings: AddressSettings,
    clock: Arc<dyn Clock>,
    buffers: Arc<BufferPool>,
    memory: Arc<AtomicU64>,
    state: Mutex<StoreState>,
    /// Signalled when page deletion frees disk space.
    space: Condvar,
}

struct StoreState {
    dir: PathBuf,
    paging: bool,
    blocked: bool,
    offline: Option<String>,
    writer: SegmentWriter,
    pages: BTreeMap<u64, PageEntry>,
    cursors: BTreeMap<QueueId, QueueCursor>,
    txs: BTreeMap<TxId, PageTxState>,
    disk_bytes: u64,
    max_message_id: Option<MessageId>,
    freed: bool,
    pages_created: u64,
    pages_deleted: u64,
    records_paged: u64,
    records_depaged: u64,
}

impl PagingStore {
    /// Open (or create) the page store at `dir`, recovering existing pages.
    pub fn open(
        address: impl Into<String>,
        dir: impl Into<PathBuf>,
        settings: AddressSettings,
        clock: Arc<dyn Clock>,
        buffers: Arc<BufferPool>,
    ) -> Result<Self> {
        let address = address.into();
        let dir = dir.into();
        settings.validate()?;
        fs::create_dir_all(&dir)?;
        let marker = dir.join(ADDRESS_FILE);
        if !marker.exists() {
            fs::write(&marker, &address)?;
        }

        let state = StoreState::recover(&address, dir, &settings)?;
        if state.paging {
            info!(
                "address {} recovered {} pages ({} bytes), paging",
                address,
                state.pages.len(),
                state.disk_bytes
            );
        }
        Ok(Self {
            address,
            settings,
            clock,
            buffers,
            memory: Arc::new(AtomicU64::new(0)),
            state: Mutex::new(state),
            space: Condvar::new(),
        })
    }

    /// A store for an address whose pages could not be recovered. Every
    /// routing attempt fails with `AddressOffline`; nothing is written.
    pub fn offline(
        address: impl Into<String>,
        dir: impl Into<PathBuf>,
        settings: AddressSettings,
        clock: Arc<dyn Clock>,
        buffers: Arc<BufferPool>,
        reason: impl Into<String>,
    ) -> Self {
        let address = address.into();
        let dir = dir.into();
        let reason = reason.into();
        error!("address {} offline: {}", address, reason);
        let writer = SegmentWriter::new(&dir, SegmentKind::Page, 0, settings.page_size_bytes);
        let mut state = StoreState::empty(dir, writer);
        state.offline = Some(reason);
        Self {
            address,
            settings,
            clock,
            buffers,
            memory: Arc::new(AtomicU64::new(0)),
            state: Mutex::new(state),
            space: Condvar::new(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn settings(&self) -> &AddressSettings {
        &self.settings
    }

    /// Counter charged by every in-memory message of this address.
    pub fn memory_counter(&self) -> &Arc<AtomicU64> {
        &self.memory
    }

    pub fn memory_bytes(&self) -> u64 {
        self.memory.load(Ordering::Acquire)
    }

    pub fn lock(&self) -> Result<StoreGuard<'_>> {
        let state = self
            .state
            .lock()
            .map_err(|_| Error::Corrupt("paging store lock poisoned"))?;
        Ok(StoreGuard { store: self, state })
    }

    /// Decode the message at `position`. Sealed pages are read after the
    /// store lock is released.
    pub fn read_message(&self, position: PagePosition) -> Result<Message> {
        let mut guard = self.lock()?;
        if guard.state.writer.active_segment() == Some(position.page) {
            let payload = guard
                .state
                .with_record(position, |record| Ok(record.payload.to_vec()))?
                .ok_or(Error::Corrupt("no page record at position"))?;
            drop(guard);
            return decode_page_record(&payload).map(|(_, message)| message);
        }
        let mapping = guard
            .state
            .mapping(position.page)?
            .ok_or(Error::Corrupt("page missing"))?;
        drop(guard);
        let record = read_record(mapping.as_slice(), position.offset as usize)?
            .ok_or(Error::Corrupt("no page record at position"))?;
        decode_page_record(record.payload).map(|(_, message)| message)
    }

    pub fn snapshot(&self) -> Result<PagingSnapshot> {
        let guard = self.lock()?;
        let state = &guard.state;
        let active = state.writer.active_segment();
        Ok(PagingSnapshot {
            paging: state.paging,
            blocked: state.blocked,
            offline: state.offline.clone(),
            memory_bytes: self.memory_bytes(),
            disk_bytes: state.disk_bytes,
            max_disk_bytes: self.settings.max_disk_bytes,
            pages_created: state.pages_created,
            pages_deleted: state.pages_deleted,
            records_paged: state.records_paged,
            records_depaged: state.records_depaged,
            pages: state
                .pages
                .iter()
                .map(|(&page, entry)| PageSummary {
                    page,
                    size: entry.size,
                    message_count: entry.message_count,
                    pending_queues: entry.pending_queues.iter().map(|q| q.0).collect(),
                    active: active == Some(page),
                })
                .collect(),
            cursors: state
                .cursors
                .iter()
                .map(|(queue, cursor)| CursorSummary {
                    queue: queue.0,
                    position: cursor.position(),
                    unread: cursor.unread(),
                    ready: cursor.has_ready(),
                    deferred: cursor.has_deferred(),
                })
                .collect(),
        })
    }
}

/// Exclusive access to a [`PagingStore`].
pub struct StoreGuard<'a> {
    store: &'a PagingStore,
    state: MutexGuard<'a, StoreState>,
}

impl<'a> StoreGuard<'a> {
    pub fn address(&self) -> &str {
        &self.store.address
    }

    pub fn is_paging(&self) -> bool {
        self.state.paging
    }

    pub fn offline(&self) -> Option<&str> {
        self.state.offline.as_deref()
    }

    pub fn check_online(&self) -> Result<()> {
        match &self.state.offline {
            Some(reason) => Err(Error::AddressOffline {
                address: self.store.address.clone(),
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    pub fn set_offline(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!("address {} offline: {}", self.store.address, reason);
        self.state.offline = Some(reason);
        self.store.space.notify_all();
    }

    /// Decide whether a message of `size` bytes goes to the pages, entering
    /// or leaving paging mode as the backlog requires.
    pub fn should_page(&mut self, size: u64) -> Result<bool> {
        let memory = self.store.memory_bytes();
        let settings = &self.store.settings;
        if !self.state.paging {
            if memory.saturating_add(size) > settings.max_size_bytes {
                self.state.paging = true;
                info!(
                    "address {} entered paging: memory={} max={}",
                    self.store.address, memory, settings.max_size_bytes
                );
            }
        } else if memory < settings.low_watermark() && self.state.drained()? {
            self.state.paging = false;
            info!(
                "address {} left paging: memory={} pages={}",
                self.store.address,
                memory,
                self.state.pages.len()
            );
        }
        self.notify_if_freed();
        Ok(self.state.paging)
    }

    /// Disk bytes an append of `payload_len` would newly claim.
    pub fn bytes_needed(&self, payload_len: usize) -> u64 {
        let writer = &self.state.writer;
        if writer.is_oversized(payload_len) {
            (SEG_DATA_OFFSET + record_len(payload_len)) as u64
        } else if writer.active_segment().is_none() || writer.needs_roll(record_len(payload_len)) {
            writer.segment_size() as u64
        } else {
            0
        }
    }

    pub fn has_space(&self, needed: u64) -> bool {
        match self.store.settings.max_disk_bytes {
            Some(max) if needed > 0 => self.state.disk_bytes.saturating_add(needed) <= max,
            _ => true,
        }
    }

    /// Wait until `needed` bytes fit under the address's disk limit.
    ///
    /// The lock is released while waiting, so a caller must redo any
    /// decision taken before the wait.
    pub fn wait_for_space(self, needed: u64, policy: FullPolicy) -> Result<Self> {
        let deadline = policy.timeout().map(|timeout| Instant::now() + timeout);
        let mut guard = self;
        loop {
            guard.check_online()?;
            if guard.has_space(needed) {
                guard.state.blocked = false;
                return Ok(guard);
            }
            if !guard.state.blocked {
                info!(
                    "address {} blocked: disk={} needed={}",
                    guard.store.address, guard.state.disk_bytes, needed
                );
            }
            guard.state.blocked = true;
            let StoreGuard { store, state } = guard;
            let state = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::CapacityExceeded(store.address.clone()));
                    }
                    store
                        .space
                        .wait_timeout(state, deadline - now)
                        .map_err(|_| Error::Corrupt("paging store lock poisoned"))?
                        .0
                }
                None => store
                    .space
                    .wait(state)
                    .map_err(|_| Error::Corrupt("paging store lock poisoned"))?,
            };
            guard = StoreGuard { store, state };
        }
    }

    /// Append `message` to the pages for `queues`. Fails with
    /// `CapacityExceeded` when the disk limit would be crossed.
    pub fn append(
        &mut self,
        tx: Option<TxId>,
        message: &Message,
        queues: &[QueueId],
        sync: bool,
    ) -> Result<PagePosition> {
        self.check_online()?;
        let needed = self.bytes_needed(page_record_len(message, queues.len()));
        if !self.has_space(needed) {
            return Err(Error::CapacityExceeded(self.store.address.clone()));
        }

        let mut buf = self.store.buffers.checkout();
        encode_page_record(&mut buf, tx, message, queues)?;
        let timestamp = self.store.clock.now();

        let state = &mut *self.state;
        let prev_active = state.writer.active_segment();
        let appended = state
            .writer
            .append(PAGE_RECORD_KIND, 0, timestamp, &buf)?;
        let position = PagePosition {
            page: appended.segment_id,
            offset: page_offset(appended.offset)?,
        };

        let active = state.writer.active_segment();
        if !state.pages.contains_key(&position.page) {
            let size = match (active, state.writer.mmap()) {
                (Some(page), Some(mmap)) if page == position.page => mmap.len() as u64,
                _ => (SEG_DATA_OFFSET + appended.len) as u64,
            };
            state.disk_bytes += size;
            state.pages_created += 1;
            state.pages.insert(
                position.page,
                PageEntry {
                    size,
                    ..PageEntry::default()
                },
            );
            debug!("address {} opened page {}", self.store.address, position.page);
        }
        if let Some(entry) = state.pages.get_mut(&position.page) {
            entry.message_count += 1;
            entry.pending_queues.extend(queues.iter().copied());
            entry.txs.extend(tx);
        }
        if let Some(tx) = tx {
            state.txs.entry(tx).or_insert(PageTxState::Prepared);
        }
        for queue in queues {
            if let Some(cursor) = state.cursors.get_mut(queue) {
                cursor.add_unread(1);
            }
        }
        state.records_paged += 1;
        state.max_message_id = state.max_message_id.max(Some(message.id));

        if sync && active == Some(position.page) {
            if let Some(mmap) = state.writer.mmap() {
                mmap.flush_range(appended.offset, appended.len)?;
            }
        }
        if let Some(prev) = prev_active {
            if active != Some(prev) {
                state.release_page(prev)?;
            }
        }
        self.notify_if_freed();
        Ok(position)
    }

    /// Flush the active page.
    pub fn sync(&self) -> Result<()> {
        self.state.writer.sync()
    }

    /// Start a cursor for `queue`: at the first retained page when
    /// recovering, otherwise at the head so it only sees later messages.
    pub fn register_queue(&mut self, queue: QueueId, from_start: bool) -> Result<()> {
        let state = &mut *self.state;
        let position = match state.pages.keys().next() {
            Some(&page) if from_start => PagePosition::new(page, SEG_DATA_OFFSET as u32),
            _ => state.head()?,
        };
        state.cursors.entry(queue).or_insert_with(|| QueueCursor::new(position));
        Ok(())
    }

    /// Drop the claim of every queue not in `keep` on every page: queues
    /// that no longer exist never acknowledge their records.
    pub fn retain_queues(&mut self, keep: &BTreeSet<QueueId>) -> Result<()> {
        let state = &mut *self.state;
        state.cursors.retain(|queue, _| keep.contains(queue));
        let mut pages = Vec::new();
        for (&page, entry) in state.pages.iter_mut() {
            let before = entry.pending_queues.len();
            entry.pending_queues.retain(|queue| keep.contains(queue));
            if entry.pending_queues.len() != before {
                pages.push(page);
            }
        }
        for page in pages {
            debug!("address {} page {} lost its unbound queues", self.store.address, page);
            state.maybe_delete(page)?;
        }
        self.notify_if_freed();
        Ok(())
    }

    pub fn has_cursor(&self, queue: QueueId) -> bool {
        self.state.cursors.contains_key(&queue)
    }

    /// Deliverable records of `queue` still on disk.
    pub fn unread(&self, queue: QueueId) -> u64 {
        self.state.cursors.get(&queue).map_or(0, QueueCursor::unread)
    }

    /// Read up to `max` records for `queue`, in page order.
    pub fn depage(&mut self, queue: QueueId, max: usize) -> Result<Depaged> {
        let records = self.state.depage(queue, max, None)?;
        let more = self.state.has_pending(queue)?;
        self.notify_if_freed();
        Ok(Depaged { records, more })
    }

    /// Depage every record of `queue` whose id is below `limit`.
    pub fn depage_until(&mut self, queue: QueueId, limit: MessageId) -> Result<Vec<PagedRecord>> {
        let records = self.state.depage(queue, usize::MAX, Some(limit))?;
        self.notify_if_freed();
        Ok(records)
    }

    /// True when `queue` has records to read now.
    pub fn has_pending(&mut self, queue: QueueId) -> Result<bool> {
        self.state.has_pending(queue)
    }

    /// Release `position` after `queue` acknowledged it.
    pub fn ack(&mut self, queue: QueueId, position: PagePosition) -> Result<()> {
        let state = &mut *self.state;
        if let Some(cursor) = state.cursors.get_mut(&queue) {
            cursor.acked(position);
        }
        state.try_release(queue, position.page)?;
        self.notify_if_freed();
        Ok(())
    }

    /// Never deliver `position` to `queue`: it was acknowledged before a
    /// restart.
    pub fn skip(&mut self, queue: QueueId, position: PagePosition) {
        if let Some(cursor) = self.state.cursors.get_mut(&queue) {
            cursor.skip(position);
        }
    }

    /// Hand `position` to `queue` ahead of its cursor. Used at recovery for
    /// references held by a prepared transaction.
    pub fn take(&mut self, queue: QueueId, position: PagePosition) -> Result<PagedRecord> {
        let state = &mut *self.state;
        let record = state
            .with_record(position, |record| {
                let header = decode_page_header(record.payload)?;
                Ok(PagedRecord {
                    position,
                    message_id: header.message_id,
                    size: record.payload.len() as u64,
                })
            })?
            .ok_or(Error::Corrupt("no page record at position"))?;
        let cursor = state
            .cursors
            .get_mut(&queue)
            .ok_or_else(|| Error::UnknownQueue(queue.to_string()))?;
        cursor.skip(position);
        cursor.depaged(position);
        Ok(record)
    }

    pub fn tx_state(&self, tx: TxId) -> Option<PageTxState> {
        self.state.txs.get(&tx).copied()
    }

    /// Record the outcome of a transaction recovered from the journal.
    pub fn set_tx_state(&mut self, tx: TxId, tx_state: PageTxState) {
        self.state.txs.insert(tx, tx_state);
    }

    /// Settle a transaction with page records here. Returns the queues whose
    /// deferred records just became deliverable.
    pub fn resolve_tx(&mut self, tx: TxId, committed: bool) -> Result<Vec<QueueId>> {
        let state = &mut *self.state;
        let Some(tx_state) = state.txs.get_mut(&tx) else {
            return Ok(Vec::new());
        };
        *tx_state = if committed {
            PageTxState::Committed
        } else {
            PageTxState::RolledBack
        };
        let ready: Vec<QueueId> = state
            .cursors
            .iter_mut()
            .filter_map(|(&queue, cursor)| cursor.resolve(tx, committed).then_some(queue))
            .collect();
        if !committed {
            let pages: Vec<u64> = state
                .pages
                .iter()
                .filter(|(_, entry)| entry.txs.contains(&tx))
                .map(|(&page, _)| page)
                .collect();
            for page in pages {
                state.release_page(page)?;
            }
        }
        self.notify_if_freed();
        Ok(ready)
    }

    /// Count every cursor's deliverable records. Run once recovery has
    /// registered cursors, skips and transaction outcomes.
    pub fn recount_unread(&mut self) -> Result<()> {
        let state = &mut *self.state;
        let pages: Vec<u64> = state.pages.keys().copied().collect();
        let mut counts: BTreeMap<QueueId, u64> = BTreeMap::new();
        for page in pages {
            let mut offset = SEG_DATA_OFFSET;
            loop {
                let position = PagePosition::new(page, offset as u32);
                let Some(record) = state.header_at(position)? else {
                    break;
                };
                for (queue, cursor) in &state.cursors {
                    if position < cursor.position() {
                        continue;
                    }
                    let tx_state = |tx: TxId| state.txs.get(&tx).copied();
                    if cursor.classify(*queue, position, &record.header, tx_state)
                        != Disposition::Skip
                    {
                        *counts.entry(*queue).or_default() += 1;
                    }
                }
                offset = record.next;
            }
        }
        for (queue, count) in counts {
            if let Some(cursor) = state.cursors.get_mut(&queue) {
                cursor.add_unread(count);
            }
        }
        Ok(())
    }

    /// The ids among `candidates` that have a record in a retained page.
    pub fn paged_among(&mut self, candidates: &BTreeSet<MessageId>) -> Result<BTreeSet<MessageId>> {
        let mut found = BTreeSet::new();
        if candidates.is_empty() {
            return Ok(found);
        }
        let state = &mut *self.state;
        let pages: Vec<u64> = state.pages.keys().copied().collect();
        for page in pages {
            let mut offset = SEG_DATA_OFFSET;
            while let Some(record) = state.header_at(PagePosition::new(page, page_offset(offset)?))? {
                if candidates.contains(&record.header.message_id) {
                    found.insert(record.header.message_id);
                }
                offset = record.next;
            }
        }
        Ok(found)
    }

    /// Transactions with records in any retained page.
    pub fn referenced_txs(&self) -> BTreeSet<TxId> {
        self.state
            .pages
            .values()
            .flat_map(|entry| entry.txs.iter().copied())
            .collect()
    }

    pub fn retains_page(&self, page: u64) -> bool {
        self.state.pages.contains_key(&page)
    }

    pub fn page_count(&self) -> usize {
        self.state.pages.len()
    }

    pub fn disk_bytes(&self) -> u64 {
        self.state.disk_bytes
    }

    /// Highest message id found in the pages at open or appended since.
    pub fn max_message_id(&self) -> Option<MessageId> {
        self.state.max_message_id
    }

    fn notify_if_freed(&mut self) {
        if std::mem::take(&mut self.state.freed) {
            self.store.space.notify_all();
        }
    }
}

impl StoreState {
    fn recover(address: &str, dir: PathBuf, settings: &AddressSettings) -> Result<Self> {
        let page_size = settings.page_size_bytes;
        let ids = discover_segments(&dir, SegmentKind::Page)?;
        let mut pages = BTreeMap::new();
        let mut disk_bytes = 0;
        let mut max_message_id = None;
        let mut next_seq = 0;
        let mut writer = None;

        for (idx, &id) in ids.iter().enumerate() {
            let mut mmap = open_segment(&dir, SegmentKind::Page, id)?;
            let header = read_segment_header(&mmap, SegmentKind::Page)?;
            let is_last = idx + 1 == ids.len();
            let scan = if header.is_sealed() {
                None
            } else {
                Some(repair_segment(&mut mmap, SegmentKind::Page)?)
            };

            let mut entry = PageEntry {
                size: mmap.len() as u64,
                ..PageEntry::default()
            };
            let mut offset = SEG_DATA_OFFSET;
            while let Some(record) = read_record(mmap.as_slice(), offset)? {
                let page_header = page_header_of(&record)?;
                entry.message_count += 1;
                entry.pending_queues.extend(page_header.queues.iter().copied());
                entry.txs.extend(page_header.tx);
                max_message_id = max_message_id.max(Some(page_header.message_id));
                next_seq = next_seq.max(record.header.seq + 1);
                offset = record.next_offset;
            }

            if let Some(scan) = scan {
                if is_last && mmap.len() == page_size {
                    disk_bytes += entry.size;
                    pages.insert(id, entry);
                    writer = Some((id, mmap, scan.end_offset));
                    continue;
                }
                if entry.message_count == 0 {
                    drop(mmap);
                    remove_segment(&dir, SegmentKind::Page, id)?;
                    continue;
                }
                seal_segment(&mut mmap, SegmentKind::Page)?;
                mmap.flush_sync()?;
            }
            if entry.message_count == 0 {
                warn!("address {} removing empty page {}", address, id);
                drop(mmap);
                remove_segment(&dir, SegmentKind::Page, id)?;
                continue;
            }
            disk_bytes += entry.size;
            pages.insert(id, entry);
        }

        let writer = match writer {
            Some((id, mmap, end)) => {
                SegmentWriter::resume(&dir, SegmentKind::Page, page_size, id, mmap, end, next_seq)
            }
            None => {
                let next_id = ids.last().map_or(0, |&id| id + 1);
                let mut writer = SegmentWriter::new(&dir, SegmentKind::Page, next_id, page_size);
                writer.set_seq(next_seq);
                writer
            }
        };

        let mut state = Self::empty(dir, writer);
        state.paging = pages.values().any(|entry| entry.message_count > 0);
        state.pages = pages;
        state.disk_bytes = disk_bytes;
        state.max_message_id = max_message_id;
        Ok(state)
    }

    fn empty(dir: PathBuf, writer: SegmentWriter) -> Self {
        Self {
            dir,
            paging: false,
            blocked: false,
            offline: None,
            writer,
            pages: BTreeMap::new(),
            cursors: BTreeMap::new(),
            txs: BTreeMap::new(),
            disk_bytes: 0,
            max_message_id: None,
            freed: false,
            pages_created: 0,
            pages_deleted: 0,
            records_paged: 0,
            records_depaged: 0,
        }
    }

    /// Position the next append lands on, ignoring rolls.
    fn head(&self) -> Result<PagePosition> {
        Ok(PagePosition::new(
            self.writer.segment_id(),
            page_offset(self.writer.write_offset())?,
        ))
    }

    fn mapping(&mut self, page: u64) -> Result<Option<Arc<MmapFile>>> {
        let Some(entry) = self.pages.get_mut(&page) else {
            return Ok(None);
        };
        if let Some(mapping) = &entry.mapping {
            return Ok(Some(Arc::clone(mapping)));
        }
        let mapping = Arc::new(open_segment(&self.dir, SegmentKind::Page, page)?);
        entry.mapping = Some(Arc::clone(&mapping));
        Ok(Some(mapping))
    }

    fn with_record<R>(
        &mut self,
        position: PagePosition,
        f: impl FnOnce(RecordView<'_>) -> Result<R>,
    ) -> Result<Option<R>> {
        let offset = position.offset as usize;
        if self.writer.active_segment() == Some(position.page) {
            let Some(mmap) = self.writer.mmap() else {
                return Ok(None);
            };
            return read_record(mmap.as_slice(), offset)?.map(f).transpose();
        }
        let Some(mapping) = self.mapping(position.page)? else {
            return Ok(None);
        };
        let result = read_record(mapping.as_slice(), offset)?.map(f).transpose();
        result
    }

    fn header_at(&mut self, position: PagePosition) -> Result<Option<RecordAt>> {
        self.with_record(position, |record| {
            Ok(RecordAt {
                header: page_header_of(&record)?,
                next: record.next_offset,
                size: record.payload.len() as u64,
            })
        })
    }

    /// Move `queue`'s cursor to the next record it must deliver, skipping
    /// records it never delivers and deferring prepared ones. Leaves the
    /// cursor on the returned record.
    fn next_candidate(&mut self, queue: QueueId) -> Result<Option<RecordAt>> {
        loop {
            let position = self.cursor(queue)?.position();
            match self.header_at(position)? {
                Some(record) => {
                    let header = &record.header;
                    let txs = &self.txs;
                    let cursor = self
                        .cursors
                        .get_mut(&queue)
                        .ok_or_else(|| Error::UnknownQueue(queue.to_string()))?;
                    let disposition =
                        cursor.classify(queue, position, header, |tx| txs.get(&tx).copied());
                    if disposition == Disposition::Deliver {
                        return Ok(Some(record));
                    }
                    if let Disposition::Defer(tx) = disposition {
                        cursor.defer(tx, position);
                    } else if header.routes_to(queue)
                        && !cursor.passed(position)
                        && header.tx.and_then(|tx| txs.get(&tx).copied())
                            == Some(PageTxState::RolledBack)
                    {
                        cursor.consume_unread();
                    }
                    cursor.position.offset = record.next as u32;
                }
                None => {
                    if self.writer.active_segment() == Some(position.page) {
                        return Ok(None);
                    }
                    let next = match self.pages.range(position.page + 1..).next() {
                        Some((&page, _)) => PagePosition::new(page, SEG_DATA_OFFSET as u32),
                        None => self.head()?,
                    };
                    if next <= position {
                        return Ok(None);
                    }
                    self.cursor(queue)?.position = next;
                    self.try_release(queue, position.page)?;
                }
            }
        }
    }

    fn cursor(&mut self, queue: QueueId) -> Result<&mut QueueCursor> {
        self.cursors
            .get_mut(&queue)
            .ok_or_else(|| Error::UnknownQueue(queue.to_string()))
    }

    fn depage(
        &mut self,
        queue: QueueId,
        max: usize,
        limit: Option<MessageId>,
    ) -> Result<Vec<PagedRecord>> {
        let mut out = Vec::new();
        while out.len() < max {
            if limit.is_none() {
                if let Some(position) = self.cursor(queue)?.next_ready() {
                    let record = self
                        .with_record(position, |record| {
                            let header = page_header_of(&record)?;
                            Ok(PagedRecord {
                                position,
                                message_id: header.message_id,
                                size: record.payload.len() as u64,
                            })
                        })?
                        .ok_or(Error::Corrupt("ready page record missing"))?;
                    let cursor = self.cursor(queue)?;
                    cursor.depaged(position);
                    cursor.consume_unread();
                    self.records_depaged += 1;
                    out.push(record);
                    continue;
                }
            }

            let Some(record) = self.next_candidate(queue)? else {
                break;
            };
            let message_id = record.header.message_id;
            if limit.is_some_and(|limit| message_id >= limit) {
                break;
            }
            let cursor = self.cursor(queue)?;
            let position = cursor.position();
            if let Err(last) = cursor.check_order(message_id) {
                return Err(Error::OrderViolation {
                    queue: queue.to_string(),
                    detail: format!("page record {message_id} at {position} follows {last}"),
                });
            }
            cursor.position.offset = record.next as u32;
            cursor.depaged(position);
            cursor.consume_unread();
            self.records_depaged += 1;
            out.push(PagedRecord {
                position,
                message_id,
                size: record.size,
            });
        }
        Ok(out)
    }

    fn has_pending(&mut self, queue: QueueId) -> Result<bool> {
        if self.cursor(queue)?.has_ready() {
            return Ok(true);
        }
        Ok(self.next_candidate(queue)?.is_some())
    }

    /// Every cursor has consumed everything written so far.
    fn drained(&mut self) -> Result<bool> {
        let queues: Vec<QueueId> = self.cursors.keys().copied().collect();
        for queue in queues {
            if self.has_pending(queue)? || self.cursor(queue)?.has_deferred() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn try_release(&mut self, queue: QueueId, page: u64) -> Result<()> {
        let holds = self
            .cursors
            .get(&queue)
            .is_some_and(|cursor| cursor.holds_page(page));
        if holds {
            return Ok(());
        }
        let released = self
            .pages
            .get_mut(&page)
            .is_some_and(|entry| entry.pending_queues.remove(&queue));
        if released {
            self.maybe_delete(page)?;
        }
        Ok(())
    }

    fn release_page(&mut self, page: u64) -> Result<()> {
        let queues: Vec<QueueId> = match self.pages.get(&page) {
            Some(entry) => entry.pending_queues.iter().copied().collect(),
            None => return Ok(()),
        };
        for queue in queues {
            self.try_release(queue, page)?;
        }
        self.maybe_delete(page)
    }

    fn maybe_delete(&mut self, page: u64) -> Result<()> {
        if self.writer.active_segment() == Some(page) {
            return Ok(());
        }
        if !self
            .pages
            .get(&page)
            .is_some_and(|entry| entry.pending_queues.is_empty())
        {
            return Ok(());
        }
        let Some(entry) = self.pages.remove(&page) else {
            return Ok(());
        };
        drop(entry.mapping);
        remove_segment(&self.dir, SegmentKind::Page, page)?;
        self.disk_bytes = self.disk_bytes.saturating_sub(entry.size);
        self.pages_deleted += 1;
        self.freed = true;
        for tx in entry.txs {
            let still_referenced = self.pages.values().any(|other| other.txs.contains(&tx));
            if !still_referenced && self.txs.get(&tx) != Some(&PageTxState::Prepared) {
                self.txs.remove(&tx);
            }
        }
        debug!(
            "deleted page {} in {}: {} messages, {} bytes",
            page,
            self.dir.display(),
            entry.message_count,
            entry.size
        );
        Ok(())
    }
}

struct RecordAt {
    header: PageRecordHeader,
    next: usize,
    size: u64,
}

fn page_offset(offset: usize) -> Result<u32> {
    u32::try_from(offset).map_err(|_| Error::Unsupported("page offset exceeds u32"))
}

fn page_header_of(record: &RecordView<'_>) -> Result<PageRecordHeader> {
    if record.header.kind != PAGE_RECORD_KIND {
        return Err(Error::Corrupt("unexpected page record kind"));
    }
    decode_page_header(record.payload)
}

/// Paging directory layout helper for tools that open pages read-only.
pub fn page_ids(dir: &Path) -> Result<Vec<u64>> {
    discover_segments(dir, SegmentKind::Page)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;

    fn settings(page_size: usize) -> AddressSettings {
        AddressSettings {
            max_size_bytes: 4096,
            page_size_bytes: page_size,
            ..AddressSettings::default()
        }
    }

    fn open(dir: &Path, settings: AddressSettings) -> PagingStore {
        PagingStore::open(
            "orders",
            dir,
            settings,
            Arc::new(SystemClock),
            Arc::new(BufferPool::new(4, 4096)),
        )
        .unwrap()
    }

    fn message(id: u64, len: usize) -> Message {
        let mut message = Message::new("orders", vec![id as u8; len]);
        message.id = MessageId(id);
        message
    }

    #[test]
    fn depage_returns_records_in_order_for_each_queue() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = open(tmp.path(), settings(1024));
        let (a, b) = (QueueId(1), QueueId(2));
        let mut guard = store.lock().unwrap();
        guard.register_queue(a, false).unwrap();
        guard.register_queue(b, false).unwrap();
        for id in 1..=20 {
            let queues: &[QueueId] = if id % 2 == 0 { &[a, b] } else { &[a] };
            guard.append(None, &message(id, 100), queues, false).unwrap();
        }
        assert!(guard.page_count() > 1);
        assert_eq!(guard.unread(a), 20);
        assert_eq!(guard.unread(b), 10);

        let first = guard.depage(a, 5).unwrap();
        assert!(first.more);
        let ids: Vec<u64> = first.records.iter().map(|r| r.message_id.0).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);

        let rest = guard.depage(b, 100).unwrap();
        assert!(!rest.more);
        let ids: Vec<u64> = rest.records.iter().map(|r| r.message_id.0).collect();
        assert_eq!(ids, (1..=10).map(|i| i * 2).collect::<Vec<_>>());
        drop(guard);

        let body = store.read_message(rest.records[0].position).unwrap();
        assert_eq!(body.id, MessageId(2));
        assert_eq!(body.body, vec![2u8; 100]);
    }

    #[test]
    fn pages_are_deleted_once_every_queue_acked_and_passed() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = open(tmp.path(), settings(1024));
        let q = QueueId(1);
        let mut guard = store.lock().unwrap();
        guard.register_queue(q, false).unwrap();
        for id in 1..=30 {
            guard.append(None, &message(id, 100), &[q], false).unwrap();
        }
        let pages_before = guard.page_count();
        let disk_before = guard.disk_bytes();
        assert!(pages_before > 2);

        let depaged = guard.depage(q, 100).unwrap();
        assert_eq!(depaged.records.len(), 30);
        assert_eq!(guard.page_count(), pages_before);

        for record in &depaged.records {
            guard.ack(q, record.position).unwrap();
        }
        // Only the active page survives.
        assert_eq!(guard.page_count(), 1);
        assert!(guard.disk_bytes() < disk_before);
        assert_eq!(page_ids(tmp.path()).unwrap().len(), 1);
    }

    #[test]
    fn prepared_records_wait_for_commit() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = open(tmp.path(), settings(4096));
        let q = QueueId(1);
        let mut guard = store.lock().unwrap();
        guard.register_queue(q, false).unwrap();
        guard.append(Some(TxId(7)), &message(1, 10), &[q], false).unwrap();
        guard.append(None, &message(2, 10), &[q], false).unwrap();
        guard.append(Some(TxId(8)), &message(3, 10), &[q], false).unwrap();

        let first = guard.depage(q, 10).unwrap();
        assert_eq!(first.records.len(), 1);
        assert_eq!(first.records[0].message_id, MessageId(2));
        assert!(!first.more);

        assert_eq!(guard.resolve_tx(TxId(7), true).unwrap(), vec![q]);
        assert!(guard.resolve_tx(TxId(8), false).unwrap().is_empty());
        let second = guard.depage(q, 10).unwrap();
        let ids: Vec<u64> = second.records.iter().map(|r| r.message_id.0).collect();
        assert_eq!(ids, vec![1]);
        assert_eq!(guard.unread(q), 0);
    }

    #[test]
    fn out_of_order_ids_are_an_order_violation() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = open(tmp.path(), settings(4096));
        let q = QueueId(1);
        let mut guard = store.lock().unwrap();
        guard.register_queue(q, false).unwrap();
        guard.append(None, &message(5, 10), &[q], false).unwrap();
        guard.append(None, &message(4, 10), &[q], false).unwrap();
        let err = guard.depage(q, 10).unwrap_err();
        assert!(matches!(err, Error::OrderViolation { .. }));
    }

    #[test]
    fn full_address_fails_fast_or_times_out() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut limited = settings(1024);
        limited.max_disk_bytes = Some(2048);
        let store = open(tmp.path(), limited);
        let q = QueueId(1);
        let mut guard = store.lock().unwrap();
        guard.register_queue(q, false).unwrap();
        let mut appended = 0;
        let err = loop {
            match guard.append(None, &message(appended + 1, 300), &[q], false) {
                Ok(_) => appended += 1,
                Err(err) => break err,
            }
        };
        assert!(matches!(err, Error::CapacityExceeded(_)));
        assert!(appended >= 2);

        let needed = guard.bytes_needed(page_record_len(&message(1, 300), 1));
        let policy = FullPolicy::Block {
            timeout_ms: Some(20),
        };
        assert!(matches!(
            guard.wait_for_space(needed, policy),
            Err(Error::CapacityExceeded(_))
        ));
    }

    #[test]
    fn reopen_recovers_pages_and_cursor_from_start() {
        let tmp = tempfile::TempDir::new().unwrap();
        let q = QueueId(3);
        {
            let store = open(tmp.path(), settings(1024));
            let mut guard = store.lock().unwrap();
            guard.register_queue(q, false).unwrap();
            for id in 1..=12 {
                guard.append(None, &message(id, 100), &[q], true).unwrap();
            }
        }

        let store = open(tmp.path(), settings(1024));
        let mut guard = store.lock().unwrap();
        assert!(guard.is_paging());
        assert_eq!(guard.max_message_id(), Some(MessageId(12)));
        guard.register_queue(q, true).unwrap();
        guard.skip(q, PagePosition::new(0, SEG_DATA_OFFSET as u32));
        guard.recount_unread().unwrap();
        assert_eq!(guard.unread(q), 11);

        let depaged = guard.depage(q, 100).unwrap();
        let ids: Vec<u64> = depaged.records.iter().map(|r| r.message_id.0).collect();
        assert_eq!(ids, (2..=12).collect::<Vec<_>>());
    }

    #[test]
    fn oversized_message_gets_its_own_page() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = open(tmp.path(), settings(1024));
        let q = QueueId(1);
        let mut guard = store.lock().unwrap();
        guard.register_queue(q, false).unwrap();
        guard.append(None, &message(1, 10), &[q], false).unwrap();
        let big = guard.append(None, &message(2, 5000), &[q], false).unwrap();
        guard.append(None, &message(3, 10), &[q], false).unwrap();
        assert_eq!(guard.page_count(), 3);

        let depaged = guard.depage(q, 10).unwrap();
        assert_eq!(depaged.records.len(), 3);
        assert_eq!(depaged.records[1].position, big);
        drop(guard);
        assert_eq!(store.read_message(big).unwrap().body.len(), 5000);
    }

    #[test]
    fn unbound_queues_release_their_pages() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (kept, gone) = (QueueId(1), QueueId(2));
        {
            let store = open(tmp.path(), settings(1024));
            let mut guard = store.lock().unwrap();
            guard.register_queue(gone, false).unwrap();
            for id in 1..=12 {
                guard.append(None, &message(id, 100), &[gone], false).unwrap();
            }
            guard.append(None, &message(13, 100), &[kept, gone], false).unwrap();
        }

        let store = open(tmp.path(), settings(1024));
        let mut guard = store.lock().unwrap();
        let before = guard.page_count();
        guard.register_queue(kept, true).unwrap();
        guard.retain_queues(&BTreeSet::from([kept])).unwrap();
        assert!(!guard.has_cursor(gone));
        assert!(guard.page_count() < before);

        guard.recount_unread().unwrap();
        let depaged = guard.depage(kept, 10).unwrap();
        let ids: Vec<u64> = depaged.records.iter().map(|r| r.message_id.0).collect();
        assert_eq!(ids, vec![13]);
    }

    #[test]
    fn offline_store_rejects_appends() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = PagingStore::offline(
            "orders",
            tmp.path(),
            settings(1024),
            Arc::new(SystemClock),
            Arc::new(BufferPool::new(4, 4096)),
            "bad page",
        );
        let mut guard = store.lock().unwrap();
        assert_eq!(guard.offline(), Some("bad page"));
        let err = guard
            .append(None, &message(1, 10), &[QueueId(1)], false)
            .unwrap_err();
        assert!(matches!(err, Error::AddressOffline { .. }));
        assert!(page_ids(tmp.path()).unwrap().is_empty());
    }

    #[test]
    fn page_offsets_past_u32_are_rejected() {
        assert_eq!(page_offset(SEG_DATA_OFFSET).unwrap(), SEG_DATA_OFFSET as u32);
        assert_eq!(page_offset(u32::MAX as usize).unwrap(), u32::MAX);
        assert!(matches!(
            page_offset(u32::MAX as usize + 1),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn paged_among_finds_ids_across_pages() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = open(tmp.path(), settings(1024));
        let q = QueueId(1);
        let mut guard = store.lock().unwrap();
        guard.register_queue(q, false).unwrap();
        for id in 1..=12 {
            guard.append(None, &message(id, 100), &[q], false).unwrap();
        }
        assert!(guard.page_count() > 1);

        let candidates: BTreeSet<MessageId> = [2, 11, 40].into_iter().map(MessageId).collect();
        let found = guard.paged_among(&candidates).unwrap();
        assert_eq!(found, [2, 11].into_iter().map(MessageId).collect::<BTreeSet<_>>());
        assert!(guard.paged_among(&BTreeSet::new()).unwrap().is_empty());
    }
}
