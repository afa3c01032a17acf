use crate::container::{temp_mode, ContainerOptions, OpenOutcome};
use crate::error::StoreError;
use crate::heap::{self, HeapOptions, InsertFlags};
use crate::id::{ContainerId, LogInstant, PageId, RecordHandle, TxId};
use crate::lock::{LockMode, Lockable};
use crate::log::LogOp;
use crate::page::DataPageWrite;
use crate::reclaim::ReclaimAction;
use crate::record::{RecordPayload, Row};
use crate::recovery::undo_tx;
use crate::store::StoreInner;
use crate::wal::{record_mutation, LogContext, TxChain};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

struct SavepointEntry {
    name: String,
    /// Last log instant when the savepoint was set; rollback undoes
    /// everything after it.
    instant: Option<LogInstant>,
    /// Locks and deferred actions past this mark belong to the savepoint.
    mark: u64,
}

/// A unit of work. A transaction starts idle, becomes active on its first
/// logged operation, and returns to idle, reusable, after every commit or
/// abort. Dropping an active transaction aborts it.
pub struct Tx<'a> {
    inner: &'a StoreInner,
    chain: TxChain,
    began: AtomicBool,
    seq: AtomicU64,
    savepoints: Vec<SavepointEntry>,
    /// Pages this transaction stopped using; freed by the reclaimer only
    /// after the commit is durable.
    pending_free: Mutex<Vec<(ContainerId, PageId, u64)>>,
    /// Containers with a pending drop, stubbified after commit.
    dropped: Mutex<Vec<(ContainerId, u64)>>,
    /// OR-combined end-of-transaction modes per temporary container.
    temp_actions: Mutex<HashMap<ContainerId, u8>>,
}

impl<'a> Tx<'a> {
    pub(crate) fn new(inner: &'a StoreInner) -> Self {
        Self {
            inner,
            chain: TxChain::new(inner.alloc_txid()),
            began: AtomicBool::new(false),
            seq: AtomicU64::new(1),
            savepoints: Vec::new(),
            pending_free: Mutex::new(Vec::new()),
            dropped: Mutex::new(Vec::new()),
            temp_actions: Mutex::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> u64 {
        self.chain.txid().get()
    }

    pub(crate) fn txid(&self) -> TxId {
        self.chain.txid()
    }

    /// Early release of one lock, for read-committed readers.
    pub(crate) fn unlock_early(&self, target: Lockable) {
        self.inner.locks.unlock_one(self.txid(), target);
    }

    pub(crate) fn ctx(&self) -> LogContext<'_> {
        LogContext::Runtime(&self.inner.wal, &self.chain)
    }

    pub(crate) fn store(&self) -> &'a StoreInner {
        self.inner
    }

    fn is_active(&self) -> bool {
        self.began.load(Ordering::SeqCst)
    }

    pub(crate) fn ensure_began(&self) -> anyhow::Result<()> {
        if !self.began.swap(true, Ordering::SeqCst) {
            let instant = record_mutation(self.ctx(), LogOp::TxBegin)?
                .expect("runtime context always yields an instant");
            self.inner.active.lock().insert(self.txid(), instant);
            log::debug!("transaction {} became active", self.id());
        }
        Ok(())
    }

    fn next_mark(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn lock(&self, target: Lockable, mode: LockMode) -> anyhow::Result<()> {
        self.inner.locks.lock(self.txid(), target, mode, self.next_mark())
    }

    pub(crate) fn note_pending_free(&self, cid: ContainerId, pages: Vec<PageId>) {
        let mark = self.next_mark();
        let mut pending = self.pending_free.lock();
        pending.extend(pages.into_iter().map(|p| (cid, p, mark)));
    }

    /// An independently committable nested transaction on the same store.
    /// It sees the same containers but its commit or abort is its own.
    pub fn begin_nested(&self) -> Tx<'a> {
        Tx::new(self.inner)
    }

    pub fn create_container(&self, opts: ContainerOptions) -> anyhow::Result<ContainerId> {
        self.ensure_began()?;
        self.inner.containers.create(self.ctx(), opts, false)
    }

    pub fn create_temp_container(
        &self,
        opts: ContainerOptions,
        mode: u8,
    ) -> anyhow::Result<ContainerId> {
        self.ensure_began()?;
        let cid = self.inner.containers.create(self.ctx(), opts, true)?;
        *self.temp_actions.lock().entry(cid).or_insert(0) |= mode;
        Ok(cid)
    }

    /// Opens a container. `None` for missing or committed-dropped
    /// containers; a stub handle when this very transaction holds the
    /// pending drop.
    pub fn open_container(&self, cid: ContainerId) -> anyhow::Result<Option<Container<'_, 'a>>> {
        match self.inner.containers.open(self.txid(), cid) {
            OpenOutcome::Gone => Ok(None),
            OpenOutcome::Stub => Ok(Some(Container {
                tx: self,
                cid,
                stub: true,
                temp: false,
                heap_opts: HeapOptions {
                    spare_space: 0,
                    min_record_size: 0,
                },
            })),
            OpenOutcome::Open {
                spare_space,
                min_record_size,
                temp,
                ..
            } => {
                if temp {
                    // Opening with no explicit mode keeps whatever modes
                    // earlier opens accumulated.
                    self.temp_actions.lock().entry(cid).or_insert(0);
                }
                Ok(Some(Container {
                    tx: self,
                    cid,
                    stub: false,
                    temp,
                    heap_opts: HeapOptions {
                        spare_space,
                        min_record_size,
                    },
                }))
            }
        }
    }

    /// Opens a temporary container, OR-ing `mode` into its
    /// end-of-transaction behavior.
    pub fn open_temp_container(
        &self,
        cid: ContainerId,
        mode: u8,
    ) -> anyhow::Result<Option<Container<'_, 'a>>> {
        let handle = self.open_container(cid)?;
        if handle.is_some() {
            *self.temp_actions.lock().entry(cid).or_insert(0) |= mode;
        }
        Ok(handle)
    }

    pub fn drop_container(&self, cid: ContainerId) -> anyhow::Result<()> {
        self.ensure_began()?;
        self.lock(Lockable::Container(cid), LockMode::Exclusive)?;
        self.inner
            .containers
            .drop_container(self.ctx(), self.txid(), cid)?;
        self.dropped.lock().push((cid, self.next_mark()));
        Ok(())
    }

    /// Pushes a named savepoint. Returns its 1-based depth.
    pub fn set_savepoint(&mut self, name: &str) -> anyhow::Result<usize> {
        if self.savepoints.iter().any(|sp| sp.name == name) {
            return Err(StoreError::DuplicateSavepoint(name.to_string()).into());
        }
        self.ensure_began()?;
        record_mutation(
            self.ctx(),
            LogOp::Savepoint {
                name: name.as_bytes(),
            },
        )?;
        let mark = self.next_mark();
        self.savepoints.push(SavepointEntry {
            name: name.to_string(),
            instant: self.chain.last(),
            mark,
        });
        Ok(self.savepoints.len())
    }

    /// Undoes every operation logged after the savepoint and releases the
    /// locks taken since, leaving the savepoint itself set. Calling it
    /// twice with nothing in between is a no-op the second time. Returns
    /// the savepoint's 1-based depth.
    pub fn rollback_to_savepoint(&mut self, name: &str) -> anyhow::Result<usize> {
        let Some(idx) = self.savepoints.iter().position(|sp| sp.name == name) else {
            return Err(StoreError::InvalidSavepoint(name.to_string()).into());
        };
        let instant = self.savepoints[idx].instant;
        let mark = self.savepoints[idx].mark;

        undo_tx(&self.inner.containers, &self.inner.wal, &self.chain, instant)?;
        self.inner.locks.release_after(self.txid(), mark);
        self.pending_free.lock().retain(|(_, _, m)| *m <= mark);
        self.dropped.lock().retain(|(_, m)| *m <= mark);
        self.savepoints.truncate(idx + 1);
        Ok(idx + 1)
    }

    /// Pops the named savepoint and everything above it. Returns the
    /// popped savepoint's 1-based depth.
    pub fn release_savepoint(&mut self, name: &str) -> anyhow::Result<usize> {
        let Some(idx) = self.savepoints.iter().position(|sp| sp.name == name) else {
            return Err(StoreError::InvalidSavepoint(name.to_string()).into());
        };
        self.savepoints.truncate(idx);
        Ok(idx + 1)
    }

    pub fn commit(&mut self) -> anyhow::Result<()> {
        let txid = self.txid();
        if self.is_active() {
            record_mutation(self.ctx(), LogOp::TxCommit)?;
            record_mutation(self.ctx(), LogOp::TxEnd)?;
            self.inner.wal.flush_all()?;

            let mut actions: Vec<ReclaimAction> = Vec::new();
            for (cid, pgid, _) in self.pending_free.lock().drain(..) {
                actions.push(ReclaimAction::FreePage(cid, pgid));
            }
            for (cid, _) in self.dropped.lock().drain(..) {
                self.inner.containers.mark_dead(cid);
                actions.push(ReclaimAction::PurgeContainer(cid));
            }
            if !actions.is_empty() {
                self.inner.reclaim.enqueue(actions);
            }
            log::debug!("transaction {} committed", self.id());
        }

        self.finish_temp(true)?;
        self.inner.locks.unlock_all(txid);
        self.inner.active.lock().remove(&txid);
        self.reset();
        Ok(())
    }

    pub fn abort(&mut self) -> anyhow::Result<()> {
        let txid = self.txid();
        if self.is_active() {
            log::debug!("aborting transaction {}", self.id());
            record_mutation(self.ctx(), LogOp::TxAbort)?;
            undo_tx(&self.inner.containers, &self.inner.wal, &self.chain, None)?;
            record_mutation(self.ctx(), LogOp::TxEnd)?;
            self.inner.wal.flush_all()?;
        }

        self.pending_free.lock().clear();
        self.dropped.lock().clear();
        self.finish_temp(false)?;
        self.inner.locks.unlock_all(txid);
        self.inner.active.lock().remove(&txid);
        self.reset();
        Ok(())
    }

    /// End-of-transaction treatment of temporary containers: at commit the
    /// OR-combined modes apply with drop beating truncate; at abort a
    /// temporary container always truncates back to empty.
    fn finish_temp(&self, commit: bool) -> anyhow::Result<()> {
        let actions: Vec<(ContainerId, u8)> = self.temp_actions.lock().drain().collect();
        for (cid, mode) in actions {
            if commit && mode & temp_mode::DROP_ON_COMMIT != 0 {
                self.inner.containers.mark_dead(cid);
                self.inner
                    .containers
                    .purge_container(LogContext::Unlogged, cid)?;
            } else if (commit && mode & temp_mode::TRUNCATE_ON_COMMIT != 0) || !commit {
                self.inner.containers.truncate_temp(cid)?;
            }
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.chain = TxChain::new(self.inner.alloc_txid());
        self.began = AtomicBool::new(false);
        self.seq = AtomicU64::new(1);
        self.savepoints.clear();
    }
}

impl Drop for Tx<'_> {
    fn drop(&mut self) {
        if self.is_active() {
            if let Err(err) = self.abort() {
                log::error!("cannot abort dangling transaction: {err}");
            }
        }
    }
}

/// Per-transaction handle to one container: row operations plus the
/// page-level surface (slot ops, timestamps, space queries).
pub struct Container<'t, 'a> {
    tx: &'t Tx<'a>,
    cid: ContainerId,
    stub: bool,
    temp: bool,
    heap_opts: HeapOptions,
}

impl<'t, 'a> Container<'t, 'a> {
    pub fn id(&self) -> ContainerId {
        self.cid
    }

    /// A stub stands for a container this transaction already dropped:
    /// only the drop's rollback can bring the data back.
    pub fn is_stub(&self) -> bool {
        self.stub
    }

    fn guard(&self) -> anyhow::Result<()> {
        if self.stub {
            return Err(StoreError::ContainerDropped(self.cid.get()).into());
        }
        Ok(())
    }

    /// Work on a temporary container is never logged; its end-of-transaction
    /// fate is truncation or drop, not undo.
    fn op_ctx(&self) -> LogContext<'_> {
        if self.temp {
            LogContext::Unlogged
        } else {
            self.tx.ctx()
        }
    }

    pub fn insert(&self, row: &Row, flags: InsertFlags) -> anyhow::Result<RecordHandle> {
        self.guard()?;
        self.tx.ensure_began()?;
        let handle = heap::insert_row(
            &self.tx.store().containers,
            self.op_ctx(),
            self.cid,
            &self.heap_opts,
            row,
            flags,
        )?;
        let (pgid, rid) = handle.resolve().unwrap();
        self.tx
            .lock(Lockable::Row(self.cid, pgid, rid.get()), LockMode::Exclusive)?;
        Ok(handle)
    }

    /// Fetches by handle. `Ok(None)` means the record is delete-marked; a
    /// handle that resolves to nothing is an error.
    pub fn fetch(&self, handle: RecordHandle) -> anyhow::Result<Option<Row>> {
        self.guard()?;
        let Some((pgid, rid)) = handle.resolve() else {
            return Err(StoreError::RecordNotFound.into());
        };
        self.tx
            .lock(Lockable::Row(self.cid, pgid, rid.get()), LockMode::Shared)?;
        heap::fetch_row(&self.tx.store().containers, self.cid, handle)
    }

    /// Full or sparse update; the record handle stays valid. Satellite
    /// pages the old version used go to post-commit reclamation.
    pub fn update(
        &self,
        handle: RecordHandle,
        row: &Row,
        column_mask: Option<&[bool]>,
    ) -> anyhow::Result<RecordHandle> {
        self.guard()?;
        self.tx.ensure_began()?;
        let Some((pgid, rid)) = handle.resolve() else {
            return Err(StoreError::RecordNotFound.into());
        };
        self.tx
            .lock(Lockable::Row(self.cid, pgid, rid.get()), LockMode::Exclusive)?;
        let freed = heap::update_row(
            &self.tx.store().containers,
            self.op_ctx(),
            self.cid,
            handle,
            row,
            column_mask,
        )?;
        if !freed.is_empty() {
            self.tx.note_pending_free(self.cid, freed);
        }
        Ok(handle)
    }

    /// Marks (or unmarks) a record deleted. Asking for the state it is
    /// already in fails.
    pub fn delete(&self, handle: RecordHandle, delete: bool) -> anyhow::Result<()> {
        self.guard()?;
        self.tx.ensure_began()?;
        let Some((pgid, rid)) = handle.resolve() else {
            return Err(StoreError::RecordNotFound.into());
        };
        self.tx
            .lock(Lockable::Row(self.cid, pgid, rid.get()), LockMode::Exclusive)?;
        heap::delete_row(
            &self.tx.store().containers,
            self.op_ctx(),
            self.cid,
            handle,
            delete,
        )
    }

    pub fn add_page(&self) -> anyhow::Result<PageId> {
        self.guard()?;
        self.tx.ensure_began()?;
        let page = self
            .tx
            .store()
            .containers
            .alloc_data_page(self.op_ctx(), self.cid)?;
        Ok(page.id())
    }

    /// Physically extends the container file without making the pages
    /// visible.
    pub fn pre_allocate(&self, count: usize) -> anyhow::Result<()> {
        self.guard()?;
        let page_count = self.tx.store().containers.page_count(self.cid)?;
        let from = PageId::new(page_count + 1).unwrap();
        self.tx
            .store()
            .containers
            .pager()
            .preallocate(self.cid, from, count)
    }

    pub fn page_count(&self) -> anyhow::Result<u64> {
        self.guard()?;
        self.tx.store().containers.page_count(self.cid)
    }

    fn latch_data<'p>(&'p self, pgid: PageId) -> anyhow::Result<DataPageWrite<'p>> {
        let page = self.tx.store().pager.write(self.cid, pgid)?;
        page.into_data()
            .ok_or_else(|| StoreError::RecordNotFound.into())
    }

    /// Inserts a single-piece row at an exact slot of an exact page.
    /// Returns `None` when the page lacks space.
    pub fn insert_at(
        &self,
        pgid: PageId,
        slot: usize,
        row: &Row,
        flags: InsertFlags,
    ) -> anyhow::Result<Option<RecordHandle>> {
        self.guard()?;
        self.tx.ensure_began()?;
        let payload = RecordPayload::inline(&row.columns).encode();
        let reserve = (self.heap_opts.min_record_size as usize).saturating_sub(payload.len());
        let mut page = self.latch_data(pgid)?;
        let handle = page.insert(
            self.op_ctx(),
            slot,
            &payload,
            0,
            reserve,
            flags.undo_with_purge,
        )?;
        drop(page);
        if let Some(handle) = handle {
            let (pgid, rid) = handle.resolve().unwrap();
            self.tx
                .lock(Lockable::Row(self.cid, pgid, rid.get()), LockMode::Exclusive)?;
        }
        Ok(handle)
    }

    /// Physically removes `count` records starting at `start_slot`.
    pub fn purge_at(
        &self,
        pgid: PageId,
        start_slot: usize,
        count: usize,
        log_data: bool,
    ) -> anyhow::Result<()> {
        self.guard()?;
        self.tx.ensure_began()?;
        let reuse = self.tx.store().containers.reuse_record_ids(self.cid);
        let mut page = self.latch_data(pgid)?;
        page.purge(self.op_ctx(), start_slot, count, log_data, reuse)
    }

    /// Moves records between two pages of this container, purging the
    /// source; all-or-nothing.
    pub fn copy_and_purge(
        &self,
        src: PageId,
        dest: PageId,
        src_start: usize,
        count: usize,
        dest_slot: usize,
    ) -> anyhow::Result<()> {
        self.guard()?;
        self.tx.ensure_began()?;
        heap::copy_and_purge(
            &self.tx.store().containers,
            self.op_ctx(),
            self.cid,
            src,
            dest,
            src_start,
            count,
            dest_slot,
        )
    }

    pub fn slot_count(&self, pgid: PageId) -> anyhow::Result<usize> {
        self.guard()?;
        let page = self.tx.store().pager.read(self.cid, pgid)?;
        let data = page.into_data().ok_or(StoreError::RecordNotFound)?;
        Ok(data.count())
    }

    /// Records neither delete-marked nor purged.
    pub fn record_count(&self, pgid: PageId) -> anyhow::Result<usize> {
        self.guard()?;
        let page = self.tx.store().pager.read(self.cid, pgid)?;
        let data = page.into_data().ok_or(StoreError::RecordNotFound)?;
        Ok(data.live_count())
    }

    /// Exact predicate: an `insert_at` of this row on this page succeeds
    /// iff this returns true.
    pub fn space_for_insert(&self, pgid: PageId, row: &Row) -> anyhow::Result<bool> {
        self.guard()?;
        let payload_len = RecordPayload::inline(&row.columns).encoded_size();
        let reserve = (self.heap_opts.min_record_size as usize).saturating_sub(payload_len);
        let page = self.tx.store().pager.read(self.cid, pgid)?;
        let data = page.into_data().ok_or(StoreError::RecordNotFound)?;
        Ok(data.space_for_insert(payload_len, reserve))
    }

    /// The page's optimistic timestamp: advanced by every mutation, so two
    /// equal stamps bracket an unmodified page without any lock.
    pub fn current_time_stamp(&self, pgid: PageId) -> anyhow::Result<u64> {
        self.guard()?;
        let page = self.tx.store().pager.read(self.cid, pgid)?;
        let data = page.into_data().ok_or(StoreError::RecordNotFound)?;
        Ok(data.generation())
    }

    pub fn equal_time_stamp(&self, pgid: PageId, stamp: u64) -> anyhow::Result<bool> {
        Ok(self.current_time_stamp(pgid)? == stamp)
    }

    /// Largest single-piece row this container's pages can hold.
    pub fn max_inline_record(&self) -> usize {
        heap::data_page_capacity(self.tx.store().pager.page_size())
    }
}
