use crate::error::StoreError;
use crate::id::{ContainerId, LogInstant, PageId, TxId};
use crate::log::LogOp;
use crate::page::{
    ContainerState, DataPageWrite, OverflowPageWrite, PageKind, PAGE_KIND_DATA,
    PAGE_KIND_OVERFLOW,
};
use crate::pager::{PageWrite, Pager};
use crate::wal::{record_mutation, LogContext};
use anyhow::anyhow;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// The container header lives on page 1 of every container file; data pages
/// start right after it.
pub(crate) const CONTAINER_HEADER_PAGE: u64 = 1;

#[derive(Copy, Clone, Debug)]
pub struct ContainerOptions {
    /// Percent of a page kept free by heap inserts so records can grow.
    pub spare_space: u8,
    /// Bytes reserved with each record so in-place updates can grow.
    pub min_record_size: u32,
    /// Reset record-id allocation when a page empties out.
    pub reuse_record_ids: bool,
}

impl Default for ContainerOptions {
    fn default() -> Self {
        Self {
            spare_space: 20,
            min_record_size: 12,
            reuse_record_ids: false,
        }
    }
}

/// How a temporary container behaves when its transaction ends. Opens
/// OR-combine; drop wins over truncate at commit, and abort always
/// truncates.
pub mod temp_mode {
    pub const TRUNCATE_ON_COMMIT: u8 = 0x1;
    pub const DROP_ON_COMMIT: u8 = 0x2;
}

struct CatalogEntry {
    temp: bool,
    /// Transaction with a pending (uncommitted) drop.
    dropped_by: Option<TxId>,
    /// Committed drop; the container is invisible and awaits
    /// stubbification by the reclaimer.
    dead: bool,
    spare_space: u8,
    min_record_size: u32,
    reuse_record_ids: bool,
}

pub(crate) enum OpenOutcome {
    /// The container is usable.
    Open {
        spare_space: u8,
        min_record_size: u32,
        reuse_record_ids: bool,
        temp: bool,
    },
    /// The opening transaction itself holds a pending drop; a lock-only
    /// stub, no page access.
    Stub,
    /// Missing, or dropped by a committed transaction.
    Gone,
}

pub(crate) struct Containers {
    root: PathBuf,
    pager: Arc<Pager>,
    catalog: RwLock<HashMap<ContainerId, CatalogEntry>>,
    next_cid: AtomicU64,
}

impl Containers {
    /// Scans `seg0/` for container files and loads their header state.
    /// Temporary containers never survive a restart; `tmp/` is wiped.
    pub(crate) fn load_existing(root: &Path, pager: Arc<Pager>) -> anyhow::Result<Self> {
        let seg_dir = root.join("seg0");
        std::fs::create_dir_all(&seg_dir)?;
        let tmp_dir = root.join("tmp");
        if tmp_dir.exists() {
            std::fs::remove_dir_all(&tmp_dir)?;
        }
        std::fs::create_dir_all(&tmp_dir)?;

        let mut found = Vec::new();
        for entry in std::fs::read_dir(&seg_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(id) = name
                .strip_prefix('c')
                .and_then(|rest| rest.strip_suffix(".dat"))
                .and_then(|n| n.parse::<u64>().ok())
            else {
                continue;
            };
            let Some(cid) = ContainerId::new(id) else {
                continue;
            };
            let f = match OpenOptions::new().read(true).write(true).open(entry.path()) {
                Ok(f) => f,
                // Stubbification can race the directory scan.
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            pager.register_container(cid, f, false);
            found.push((id, cid));
        }

        // Torn page writes must be repaired before any page is trusted.
        pager.recover_non_atomic_write()?;

        let mut catalog = HashMap::new();
        let mut max_cid = 0u64;
        for (id, cid) in found {
            let header = pager.read(cid, PageId::new(CONTAINER_HEADER_PAGE).unwrap())?;
            let state = match &header.meta().kind {
                PageKind::ContainerHeader { state } => *state,
                // A create that never flushed its header page; recovery's
                // redo will format it.
                PageKind::None => ContainerState {
                    page_count: 1,
                    freelist: None,
                    dropped: false,
                    spare_space: ContainerOptions::default().spare_space,
                    min_record_size: ContainerOptions::default().min_record_size,
                    reuse_record_ids: false,
                },
                kind => {
                    return Err(anyhow!(
                        "container {id} header page has kind {}",
                        kind.code()
                    ))
                }
            };
            drop(header);

            catalog.insert(
                cid,
                CatalogEntry {
                    temp: false,
                    dropped_by: None,
                    dead: false,
                    spare_space: state.spare_space,
                    min_record_size: state.min_record_size,
                    reuse_record_ids: state.reuse_record_ids,
                },
            );
            max_cid = max_cid.max(id);
        }

        Ok(Self {
            root: root.to_path_buf(),
            pager,
            catalog: RwLock::new(catalog),
            next_cid: AtomicU64::new(max_cid + 1),
        })
    }

    pub(crate) fn pager(&self) -> &Pager {
        &self.pager
    }

    fn container_path(&self, cid: ContainerId, temp: bool) -> PathBuf {
        if temp {
            self.root.join("tmp").join(format!("t{}.dat", cid.get()))
        } else {
            self.root.join("seg0").join(format!("c{}.dat", cid.get()))
        }
    }

    pub(crate) fn header_page(cid: ContainerId) -> PageId {
        let _ = cid;
        PageId::new(CONTAINER_HEADER_PAGE).unwrap()
    }

    /// Creates a container. Rollback of the creating transaction removes it
    /// entirely via the logged create record's compensation.
    pub(crate) fn create(
        &self,
        ctx: LogContext<'_>,
        opts: ContainerOptions,
        temp: bool,
    ) -> anyhow::Result<ContainerId> {
        let page_size = self.pager.page_size();
        let min_record_size = if opts.min_record_size as usize >= page_size {
            // An impossible reservation falls back to the documented
            // default.
            100
        } else {
            opts.min_record_size
        };

        let cid = ContainerId::new(self.next_cid.fetch_add(1, Ordering::SeqCst)).unwrap();
        let path = self.container_path(cid, temp);
        let f = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        self.pager.register_container(cid, f, temp);

        let ctx = if temp { LogContext::Unlogged } else { ctx };
        let instant = record_mutation(
            ctx,
            LogOp::ContainerCreate {
                cid,
                spare_space: opts.spare_space,
                min_record_size,
                reuse_record_ids: opts.reuse_record_ids,
            },
        )?;

        let state = ContainerState {
            page_count: 1,
            freelist: None,
            dropped: false,
            spare_space: opts.spare_space,
            min_record_size,
            reuse_record_ids: opts.reuse_record_ids,
        };
        let header = self.pager.write_fresh(cid, Self::header_page(cid))?;
        header.init_container_header(state, instant);

        self.catalog.write().insert(
            cid,
            CatalogEntry {
                temp,
                dropped_by: None,
                dead: false,
                spare_space: opts.spare_space,
                min_record_size,
                reuse_record_ids: opts.reuse_record_ids,
            },
        );

        log::debug!("created container cid={} temp={temp}", cid.get());
        Ok(cid)
    }

    /// Re-creates a container file during recovery redo.
    pub(crate) fn redo_create(
        &self,
        instant: LogInstant,
        cid: ContainerId,
        spare_space: u8,
        min_record_size: u32,
        reuse_record_ids: bool,
    ) -> anyhow::Result<()> {
        if !self.pager.has_container(cid) {
            let path = self.container_path(cid, false);
            let f = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)?;
            self.pager.register_container(cid, f, false);
        }

        let header = self.pager.write_fresh(cid, Self::header_page(cid))?;
        let apply = header
            .meta()
            .lsn
            .map(|lsn| lsn < instant)
            .unwrap_or(true);
        if apply {
            header.init_container_header(
                ContainerState {
                    page_count: 1,
                    freelist: None,
                    dropped: false,
                    spare_space,
                    min_record_size,
                    reuse_record_ids,
                },
                Some(instant),
            );
        }

        self.catalog.write().insert(
            cid,
            CatalogEntry {
                temp: false,
                dropped_by: None,
                dead: false,
                spare_space,
                min_record_size,
                reuse_record_ids,
            },
        );

        self.next_cid.fetch_max(cid.get() + 1, Ordering::SeqCst);
        Ok(())
    }

    pub(crate) fn open(&self, txid: TxId, cid: ContainerId) -> OpenOutcome {
        let catalog = self.catalog.read();
        let Some(entry) = catalog.get(&cid) else {
            return OpenOutcome::Gone;
        };
        if entry.dead {
            return OpenOutcome::Gone;
        }
        match entry.dropped_by {
            Some(owner) if owner == txid => OpenOutcome::Stub,
            Some(_) => OpenOutcome::Gone,
            None => OpenOutcome::Open {
                spare_space: entry.spare_space,
                min_record_size: entry.min_record_size,
                reuse_record_ids: entry.reuse_record_ids,
                temp: entry.temp,
            },
        }
    }

    /// Marks the container dropped. Physical removal only happens after
    /// commit, through the reclaimer.
    pub(crate) fn drop_container(
        &self,
        ctx: LogContext<'_>,
        txid: TxId,
        cid: ContainerId,
    ) -> anyhow::Result<()> {
        let mut catalog = self.catalog.write();
        let entry = catalog
            .get_mut(&cid)
            .ok_or(StoreError::ContainerNotFound(cid.get()))?;
        if entry.dead || entry.dropped_by.is_some() {
            return Err(StoreError::ContainerDropped(cid.get()).into());
        }
        let temp = entry.temp;
        entry.dropped_by = Some(txid);
        drop(catalog);

        let ctx = if temp { LogContext::Unlogged } else { ctx };
        let instant = record_mutation(ctx, LogOp::ContainerDrop { cid })?;
        self.set_dropped_flag(cid, true, instant)?;
        Ok(())
    }

    /// Compensation of a drop: the container is fully usable again.
    pub(crate) fn undo_drop(&self, ctx: LogContext<'_>, cid: ContainerId) -> anyhow::Result<()> {
        let instant = record_mutation(ctx, LogOp::ContainerUndoDrop { cid })?;

        let mut catalog = self.catalog.write();
        if let Some(entry) = catalog.get_mut(&cid) {
            entry.dropped_by = None;
        }
        drop(catalog);

        if self.pager.has_container(cid) {
            self.set_dropped_flag(cid, false, instant)?;
        }
        Ok(())
    }

    pub(crate) fn redo_set_dropped(
        &self,
        instant: LogInstant,
        cid: ContainerId,
        dropped: bool,
    ) -> anyhow::Result<()> {
        if !self.pager.has_container(cid) {
            return Ok(());
        }
        let header = self.pager.write(cid, Self::header_page(cid))?;
        let apply = header.meta().lsn.map(|lsn| lsn < instant).unwrap_or(true);
        let Some(mut header) = header.into_container_header() else {
            return Ok(());
        };
        if apply {
            let mut state = header.state();
            state.dropped = dropped;
            header.set_state(state, Some(instant));
        }
        Ok(())
    }

    fn set_dropped_flag(
        &self,
        cid: ContainerId,
        dropped: bool,
        instant: Option<LogInstant>,
    ) -> anyhow::Result<()> {
        let header = self.pager.write(cid, Self::header_page(cid))?;
        let Some(mut header) = header.into_container_header() else {
            return Err(anyhow!("container {} has no header page", cid.get()));
        };
        let mut state = header.state();
        state.dropped = dropped;
        header.set_state(state, instant);
        Ok(())
    }

    /// The creating transaction committed a drop (or rolled back a create):
    /// the catalog entry goes invisible immediately, files go later.
    pub(crate) fn mark_dead(&self, cid: ContainerId) {
        if let Some(entry) = self.catalog.write().get_mut(&cid) {
            entry.dead = true;
        }
    }

    /// Stubbification: physically removes the container's storage. Runs in
    /// the reclaimer after the dropping transaction is durably committed,
    /// or as compensation of a rolled-back create.
    pub(crate) fn purge_container(
        &self,
        ctx: LogContext<'_>,
        cid: ContainerId,
    ) -> anyhow::Result<()> {
        record_mutation(ctx, LogOp::ContainerPurge { cid })?;

        let temp = self
            .catalog
            .read()
            .get(&cid)
            .map(|e| e.temp)
            .unwrap_or(false);
        if self.pager.has_container(cid) {
            self.pager.remove_container(cid)?;
        }
        let path = self.container_path(cid, temp);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        self.catalog.write().remove(&cid);
        log::debug!("purged container cid={}", cid.get());
        Ok(())
    }

    /// Truncates a temporary container back to its header page. Unlogged.
    pub(crate) fn truncate_temp(&self, cid: ContainerId) -> anyhow::Result<()> {
        let first_data = PageId::new(CONTAINER_HEADER_PAGE + 1).unwrap();
        self.pager.truncate_container(cid, first_data)?;

        let header = self.pager.write(cid, Self::header_page(cid))?;
        let Some(mut header) = header.into_container_header() else {
            return Err(anyhow!("container {} has no header page", cid.get()));
        };
        let mut state = header.state();
        state.page_count = 1;
        state.freelist = None;
        header.set_state(state, None);
        Ok(())
    }

    pub(crate) fn reuse_record_ids(&self, cid: ContainerId) -> bool {
        self.catalog
            .read()
            .get(&cid)
            .map(|e| e.reuse_record_ids)
            .unwrap_or(false)
    }

    pub(crate) fn is_temp(&self, cid: ContainerId) -> bool {
        self.catalog
            .read()
            .get(&cid)
            .map(|e| e.temp)
            .unwrap_or(false)
    }

    /// Containers whose header says dropped after recovery finished: their
    /// drop committed but stubbification never ran.
    pub(crate) fn committed_dropped(&self) -> anyhow::Result<Vec<ContainerId>> {
        let cids: Vec<ContainerId> = self.catalog.read().keys().copied().collect();
        let mut result = Vec::new();
        for cid in cids {
            let header = self.pager.read(cid, Self::header_page(cid))?;
            if let PageKind::ContainerHeader { state } = &header.meta().kind {
                if state.dropped {
                    result.push(cid);
                }
            }
        }
        Ok(result)
    }

    pub(crate) fn page_count(&self, cid: ContainerId) -> anyhow::Result<u64> {
        let header = self.pager.read(cid, Self::header_page(cid))?;
        match &header.meta().kind {
            PageKind::ContainerHeader { state } => Ok(state.page_count),
            _ => Err(anyhow!("container {} has no header page", cid.get())),
        }
    }

    /// Allocates a page: from the durable free list when possible, by
    /// growing the file otherwise. Returns the latched, still-unformatted
    /// page plus the instant of the allocation record.
    fn alloc_raw(
        &self,
        ctx: LogContext<'_>,
        cid: ContainerId,
        kind_code: u8,
    ) -> anyhow::Result<(PageWrite<'_>, Option<LogInstant>)> {
        let ctx = if self.is_temp(cid) {
            LogContext::Unlogged
        } else {
            ctx
        };

        let header = self.pager.write(cid, Self::header_page(cid))?;
        let Some(mut header) = header.into_container_header() else {
            return Err(anyhow!("container {} has no header page", cid.get()));
        };
        let state = header.state();
        if state.dropped {
            return Err(StoreError::ContainerDropped(cid.get()).into());
        }

        let (pgid, new_freelist, new_page_count) = if let Some(head) = state.freelist {
            let free_page = self.pager.write(cid, head)?;
            let next = free_page.free_next();
            drop(free_page);
            (head, next, state.page_count)
        } else {
            let pgid = PageId::new(state.page_count + 1).unwrap();
            (pgid, None, state.page_count + 1)
        };

        let instant = record_mutation(
            ctx,
            LogOp::PageAlloc {
                cid,
                pgid,
                kind: kind_code,
                old_freelist: state.freelist,
                new_freelist,
                old_page_count: state.page_count,
                new_page_count,
            },
        )?;

        header.set_state(
            ContainerState {
                freelist: new_freelist,
                page_count: new_page_count,
                ..state
            },
            instant,
        );
        drop(header);

        let page = self.pager.write_fresh(cid, pgid)?;
        log::debug!(
            "allocated page cid={} pgid={} kind={kind_code}",
            cid.get(),
            pgid.get()
        );
        Ok((page, instant))
    }

    pub(crate) fn alloc_data_page(
        &self,
        ctx: LogContext<'_>,
        cid: ContainerId,
    ) -> anyhow::Result<DataPageWrite<'_>> {
        let (page, instant) = self.alloc_raw(ctx, cid, PAGE_KIND_DATA)?;
        Ok(page.init_data(instant))
    }

    pub(crate) fn alloc_overflow_page(
        &self,
        ctx: LogContext<'_>,
        cid: ContainerId,
    ) -> anyhow::Result<OverflowPageWrite<'_>> {
        let (page, instant) = self.alloc_raw(ctx, cid, PAGE_KIND_OVERFLOW)?;
        Ok(page.init_overflow(instant))
    }

    /// Replays an allocation record; both the header and the target page
    /// carry their own idempotence check.
    pub(crate) fn redo_alloc(
        &self,
        instant: LogInstant,
        cid: ContainerId,
        pgid: PageId,
        kind_code: u8,
        new_freelist: Option<PageId>,
        new_page_count: u64,
    ) -> anyhow::Result<()> {
        if !self.pager.has_container(cid) {
            return Ok(());
        }

        let header = self.pager.write(cid, Self::header_page(cid))?;
        if let Some(mut header) = header.into_container_header() {
            let apply = header
                .0
                .meta()
                .lsn
                .map(|lsn| lsn < instant)
                .unwrap_or(true);
            if apply {
                let state = header.state();
                header.set_state(
                    ContainerState {
                        freelist: new_freelist,
                        page_count: new_page_count,
                        ..state
                    },
                    Some(instant),
                );
            }
        }

        let page = self.pager.write_fresh(cid, pgid)?;
        let apply = page.meta().lsn.map(|lsn| lsn < instant).unwrap_or(true);
        if apply {
            if kind_code == PAGE_KIND_OVERFLOW {
                page.init_overflow(Some(instant));
            } else {
                page.init_data(Some(instant));
            }
        }
        Ok(())
    }

    /// Frees a page: applied by the reclaimer after the freeing transaction
    /// commits, as compensation of a page allocation, and by recovery redo.
    /// The fields describe the header transition; whether the page joins
    /// the free list or falls off the end of the container follows from
    /// them.
    pub(crate) fn apply_free(
        &self,
        ctx: LogContext<'_>,
        cid: ContainerId,
        pgid: PageId,
        old_freelist: Option<PageId>,
        new_freelist: Option<PageId>,
        old_page_count: u64,
        new_page_count: u64,
    ) -> anyhow::Result<()> {
        if !self.pager.has_container(cid) {
            return Ok(());
        }
        let ctx = if self.is_temp(cid) {
            LogContext::Unlogged
        } else {
            ctx
        };

        let instant = record_mutation(
            ctx,
            LogOp::PageFree {
                cid,
                pgid,
                old_freelist,
                new_freelist,
                old_page_count,
                new_page_count,
            },
        )?;
        let redo_instant = match ctx {
            LogContext::Redo(i) => Some(i),
            _ => None,
        };

        let header = self.pager.write(cid, Self::header_page(cid))?;
        if let Some(mut header) = header.into_container_header() {
            let apply = redo_instant
                .map(|i| header.0.meta().lsn.map(|lsn| lsn < i).unwrap_or(true))
                .unwrap_or(true);
            if apply {
                let state = header.state();
                header.set_state(
                    ContainerState {
                        freelist: new_freelist,
                        page_count: new_page_count,
                        ..state
                    },
                    instant,
                );
            }
        }

        let mut page = self.pager.write_fresh(cid, pgid)?;
        let apply = redo_instant
            .map(|i| page.meta().lsn.map(|lsn| lsn < i).unwrap_or(true))
            .unwrap_or(true);
        if apply {
            if new_page_count < old_page_count {
                // The allocation being compensated grew the file; the page
                // simply ceases to exist.
                page.set_none(instant);
            } else {
                // The page becomes the free-list head; its next pointer is
                // the previous head.
                let chain_next = if new_freelist == Some(pgid) {
                    old_freelist
                } else {
                    new_freelist
                };
                page.set_free(chain_next, instant);
            }
        }

        log::debug!("freed page cid={} pgid={}", cid.get(), pgid.get());
        Ok(())
    }

    /// Post-commit free of a page the committed transaction no longer
    /// needs. Appends it to the durable free list.
    pub(crate) fn free_page(
        &self,
        ctx: LogContext<'_>,
        cid: ContainerId,
        pgid: PageId,
    ) -> anyhow::Result<()> {
        if !self.pager.has_container(cid) {
            // Dropped in the meantime; the whole file is going away.
            return Ok(());
        }
        let header = self.pager.write(cid, Self::header_page(cid))?;
        let Some(header) = header.into_container_header() else {
            return Err(anyhow!("container {} has no header page", cid.get()));
        };
        let state = header.state();
        drop(header);

        self.apply_free(
            ctx,
            cid,
            pgid,
            state.freelist,
            Some(pgid),
            state.page_count,
            state.page_count,
        )
    }
}
