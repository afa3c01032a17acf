use crate::id::{ContainerId, LogInstant, PageId};
use crate::page::{
    decode_page, encode_page, ContainerHeaderPageWrite, ContainerState, DataPageRead,
    DataPageWrite, OverflowPageRead, OverflowPageWrite, PageKind, PageMeta, PAGE_FOOTER_SIZE,
};
use crate::wal::Wal;
use anyhow::anyhow;
use indexmap::IndexSet;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;

pub(crate) const MINIMUM_PAGE_SIZE: usize = 256;
pub(crate) const MAXIMUM_PAGE_SIZE: usize = 0x4000;

type FrameKey = (ContainerId, PageId);

pub(crate) struct ContainerFile {
    pub(crate) f: Mutex<File>,
    pub(crate) temp: bool,
}

/// The shared page cache. Frames hold pages of every open container, keyed
/// by `(container, page number)`; a page is mutated only through the
/// exclusive `PageWrite` latch and stamped with the log instant of the
/// record that covers the change.
pub(crate) struct Pager {
    page_size: usize,
    n: usize,

    double_buff_f: Mutex<File>,
    files: RwLock<HashMap<ContainerId, Arc<ContainerFile>>>,
    wal: RwLock<Option<Arc<Wal>>>,

    internal: RwLock<PagerInternal>,
    flush_internal: RwLock<PagerFlushInternal>,
}

struct PagerInternal {
    allocated: usize,
    metas: *mut RwLock<PageMeta>,
    buffer: *mut u8,
    ref_count: Box<[usize]>,
    page_to_frame: HashMap<FrameKey, usize>,
    free_frames: HashSet<usize>,
    dirty_frames: HashSet<usize>,
    free_and_clean: HashSet<usize>,
}

struct PagerFlushInternal {
    flushing_pages: Box<[u8]>,
    flushing_keys: IndexSet<FrameKey>,
}

unsafe impl Send for PagerInternal {}
unsafe impl Sync for PagerInternal {}

impl Drop for Pager {
    fn drop(&mut self) {
        let internal = self.internal.write();
        unsafe {
            drop(Vec::from_raw_parts(
                internal.buffer,
                self.page_size * self.n,
                self.page_size * self.n,
            ));
            drop(Box::from_raw(std::slice::from_raw_parts_mut(
                internal.metas,
                self.n,
            )));
        }
    }
}

fn dummy_meta() -> PageMeta {
    PageMeta {
        cid: ContainerId::new(1).unwrap(),
        id: PageId::new(1).unwrap(),
        kind: PageKind::None,
        lsn: None,
        is_dirty: false,
    }
}

impl Pager {
    pub(crate) fn new(double_buff_f: File, page_size: usize, n: usize) -> anyhow::Result<Self> {
        Self::check_page_size(page_size)?;
        if n < 10 {
            return Err(anyhow!("number of pages must be at least 10, but got {n}"));
        }
        let Some(buffer_size) = page_size.checked_mul(n) else {
            return Err(anyhow!("page size * n overflows: {page_size} * {n}"));
        };

        let metas = (0..n)
            .map(|_| RwLock::new(dummy_meta()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let flushing_area_n = 16;
        let flushing_pages = vec![0u8; page_size * flushing_area_n].into_boxed_slice();

        Ok(Self {
            page_size,
            n,
            double_buff_f: Mutex::new(double_buff_f),
            files: RwLock::new(HashMap::default()),
            wal: RwLock::new(None),
            internal: RwLock::new(PagerInternal {
                allocated: 0,
                metas: Box::leak(metas).as_mut_ptr(),
                buffer: vec![0u8; buffer_size].leak().as_mut_ptr(),
                ref_count: vec![0; n].into_boxed_slice(),
                page_to_frame: HashMap::default(),
                free_frames: HashSet::default(),
                dirty_frames: HashSet::default(),
                free_and_clean: HashSet::default(),
            }),
            flush_internal: RwLock::new(PagerFlushInternal {
                flushing_pages,
                flushing_keys: IndexSet::default(),
            }),
        })
    }

    fn check_page_size(page_size: usize) -> anyhow::Result<()> {
        if page_size.count_ones() != 1 {
            return Err(anyhow!(
                "page size must be a power of 2, but got {page_size}"
            ));
        }
        if page_size < MINIMUM_PAGE_SIZE {
            return Err(anyhow!(
                "page size must be at least {MINIMUM_PAGE_SIZE} bytes, but got {page_size}"
            ));
        }
        if page_size > MAXIMUM_PAGE_SIZE {
            return Err(anyhow!(
                "page size must be at most {MAXIMUM_PAGE_SIZE} bytes, but got {page_size}"
            ));
        }
        Ok(())
    }

    pub(crate) fn page_size(&self) -> usize {
        self.page_size
    }

    /// The WAL is attached once recovery has built it; from then on a page
    /// is never written to disk before the log that covers it.
    pub(crate) fn attach_wal(&self, wal: Arc<Wal>) {
        *self.wal.write() = Some(wal);
    }

    pub(crate) fn register_container(&self, cid: ContainerId, f: File, temp: bool) {
        self.files
            .write()
            .insert(cid, Arc::new(ContainerFile { f: Mutex::new(f), temp }));
    }

    pub(crate) fn has_container(&self, cid: ContainerId) -> bool {
        self.files.read().contains_key(&cid)
    }

    /// Detaches a container's file, dropping every cached frame of it. The
    /// caller must hold no latch on the container's pages.
    pub(crate) fn remove_container(&self, cid: ContainerId) -> anyhow::Result<()> {
        self.discard_staged(cid)?;

        let mut internal = self.internal.write();
        let keys: Vec<FrameKey> = internal
            .page_to_frame
            .keys()
            .filter(|(c, _)| *c == cid)
            .copied()
            .collect();
        for key in keys {
            let frame_id = internal.page_to_frame.remove(&key).unwrap();
            assert!(
                internal.ref_count[frame_id] == 0,
                "dropping container {cid:?} while one of its pages is latched"
            );
            // SAFETY: metas + frame_id is inside the arena and no other
            // reference exists while the frame's ref count is zero.
            let meta = unsafe { &*internal.metas.add(frame_id) };
            *meta.write() = dummy_meta();
            internal.dirty_frames.remove(&frame_id);
            internal.free_frames.insert(frame_id);
            internal.free_and_clean.insert(frame_id);
        }
        drop(internal);

        self.files.write().remove(&cid);
        Ok(())
    }

    /// Drops cached frames with page number >= `from` and shrinks the file,
    /// used to truncate temporary containers back to their header page.
    pub(crate) fn truncate_container(
        &self,
        cid: ContainerId,
        from: PageId,
    ) -> anyhow::Result<()> {
        self.discard_staged(cid)?;

        let mut internal = self.internal.write();
        let keys: Vec<FrameKey> = internal
            .page_to_frame
            .keys()
            .filter(|(c, p)| *c == cid && p.get() >= from.get())
            .copied()
            .collect();
        for key in keys {
            let frame_id = internal.page_to_frame.remove(&key).unwrap();
            assert!(internal.ref_count[frame_id] == 0);
            let meta = unsafe { &*internal.metas.add(frame_id) };
            *meta.write() = dummy_meta();
            internal.dirty_frames.remove(&frame_id);
            internal.free_frames.insert(frame_id);
            internal.free_and_clean.insert(frame_id);
        }
        drop(internal);

        let files = self.files.read();
        let file = files
            .get(&cid)
            .ok_or_else(|| anyhow!("container {cid:?} has no file"))?;
        let f = file.f.lock();
        f.set_len(((from.get() - 1) * self.page_size as u64) as u64)?;
        f.sync_all()?;
        Ok(())
    }

    /// Replays the double-write area: any complete page image found there
    /// is copied back to its home location, repairing a torn page write.
    pub(crate) fn recover_non_atomic_write(&self) -> anyhow::Result<()> {
        let mut double_buff_f = self.double_buff_f.lock();
        let size = double_buff_f.metadata()?.len() as usize;
        let page_count = size / self.page_size;

        let mut buff = vec![0u8; self.page_size * page_count];
        double_buff_f.seek(SeekFrom::Start(0))?;
        double_buff_f.read_exact(&mut buff)?;
        drop(double_buff_f);

        for i in 0..page_count {
            let buff = &buff[i * self.page_size..(i + 1) * self.page_size];
            let mut meta = dummy_meta();
            let ok = decode_page(self.page_size, &mut meta, buff)?;
            if !ok {
                continue;
            }
            let files = self.files.read();
            // A page of a container that no longer exists is stale.
            let Some(file) = files.get(&meta.cid) else {
                continue;
            };
            let mut f = file.f.lock();
            write_page(&mut f, meta.id, self.page_size, buff)?;
            f.sync_all()?;
        }

        Ok(())
    }

    pub(crate) fn read(&self, cid: ContainerId, pgid: PageId) -> anyhow::Result<PageRead> {
        let internal = self.internal.write();
        let (frame_id, meta, buffer) = self.acquire(internal, cid, pgid, false)?;
        let meta = meta.read();
        // SAFETY: the buffer has one mutable or many shared references,
        // protected by the page meta's lock.
        let buffer = unsafe { std::slice::from_raw_parts(buffer, self.page_size) };
        Ok(PageRead {
            pager: self,
            frame_id,
            meta,
            buffer,
        })
    }

    pub(crate) fn write(&self, cid: ContainerId, pgid: PageId) -> anyhow::Result<PageWrite> {
        let internal = self.internal.write();
        let (frame_id, meta, buffer) = self.acquire(internal, cid, pgid, false)?;
        let meta = meta.write();
        // SAFETY: as in `read`, the meta lock protects the buffer.
        let buffer = unsafe { std::slice::from_raw_parts_mut(buffer, self.page_size) };
        Ok(PageWrite {
            pager: self,
            frame_id,
            meta,
            buffer,
        })
    }

    /// Latches a frame for a page that is not expected to have valid bytes
    /// on disk yet (a fresh allocation, or redo past the current file end).
    pub(crate) fn write_fresh(&self, cid: ContainerId, pgid: PageId) -> anyhow::Result<PageWrite> {
        let internal = self.internal.write();
        let (frame_id, meta, buffer) = self.acquire(internal, cid, pgid, true)?;
        let meta = meta.write();
        // SAFETY: as in `read`.
        let buffer = unsafe { std::slice::from_raw_parts_mut(buffer, self.page_size) };
        Ok(PageWrite {
            pager: self,
            frame_id,
            meta,
            buffer,
        })
    }

    fn acquire(
        &self,
        mut internal: RwLockWriteGuard<PagerInternal>,
        cid: ContainerId,
        pgid: PageId,
        fresh: bool,
    ) -> anyhow::Result<(usize, &RwLock<PageMeta>, *mut u8)> {
        let key = (cid, pgid);

        if let Some(frame_id) = internal.page_to_frame.get(&key).copied() {
            internal.ref_count[frame_id] += 1;
            internal.free_frames.remove(&frame_id);
            internal.free_and_clean.remove(&frame_id);

            // SAFETY: metas + frame_id is inside the arena; only shared
            // references to the RwLock are ever created.
            let meta = unsafe { &*internal.metas.add(frame_id) };
            let buffer = unsafe { internal.buffer.add(frame_id * self.page_size) };
            Ok((frame_id, meta, buffer))
        } else if internal.allocated < self.n {
            let frame_id = internal.allocated;

            let meta = unsafe { &*internal.metas.add(frame_id) };
            // The frame was never handed out, so this lock is uncontended.
            let mut meta_locked = meta.write();
            let buffer_offset = unsafe { internal.buffer.add(frame_id * self.page_size) };
            let buffer =
                unsafe { std::slice::from_raw_parts_mut(buffer_offset, self.page_size) };

            if fresh {
                *meta_locked = PageMeta {
                    cid,
                    id: pgid,
                    kind: PageKind::None,
                    lsn: None,
                    is_dirty: false,
                };
            } else {
                self.load(cid, pgid, &mut meta_locked, buffer)?;
            }

            internal.allocated += 1;
            internal.ref_count[frame_id] += 1;
            internal.page_to_frame.insert(key, frame_id);

            Ok((frame_id, meta, buffer_offset))
        } else {
            let (frame_id, must_write_back) = Self::eviction_candidate(&mut internal)?;

            let meta = unsafe { &*internal.metas.add(frame_id) };
            let old_key = {
                // Only a free frame can be evicted, so this lock is
                // uncontended.
                let m = meta.read();
                (m.cid, m.id)
            };

            let mut meta_locked = meta.write();
            let buffer_offset = unsafe { internal.buffer.add(frame_id * self.page_size) };
            let buffer =
                unsafe { std::slice::from_raw_parts_mut(buffer_offset, self.page_size) };

            if must_write_back {
                encode_page(&meta_locked, buffer);
                let mut flush_internal = self.flush_internal.write();
                self.stage_evicted_page(&mut flush_internal, old_key, buffer)?;
            }

            if fresh {
                *meta_locked = PageMeta {
                    cid,
                    id: pgid,
                    kind: PageKind::None,
                    lsn: None,
                    is_dirty: false,
                };
            } else {
                self.load(cid, pgid, &mut meta_locked, buffer)?;
            }

            internal.page_to_frame.remove(&old_key);
            internal.page_to_frame.insert(key, frame_id);
            assert!(internal.ref_count[frame_id] == 0);
            internal.ref_count[frame_id] += 1;
            internal.free_frames.remove(&frame_id);
            internal.free_and_clean.remove(&frame_id);
            internal.dirty_frames.remove(&frame_id);

            Ok((frame_id, meta, buffer_offset))
        }
    }

    fn eviction_candidate(internal: &mut PagerInternal) -> anyhow::Result<(usize, bool)> {
        if let Some(frame_id) = internal.free_and_clean.iter().next().copied() {
            Ok((frame_id, false))
        } else if let Some(frame_id) = internal.free_frames.iter().next().copied() {
            Ok((frame_id, true))
        } else {
            Err(anyhow!("all pages are pinned"))
        }
    }

    /// Loads a page image from the staging area or the container file. A
    /// missing or checksum-failing image yields an empty (`None`) page.
    fn load(
        &self,
        cid: ContainerId,
        pgid: PageId,
        meta: &mut PageMeta,
        buff: &mut [u8],
    ) -> anyhow::Result<()> {
        meta.cid = cid;
        meta.id = pgid;

        let ok = {
            let flush_internal = self.flush_internal.read();
            if let Some((i, _)) = flush_internal.flushing_keys.get_full(&(cid, pgid)) {
                buff.copy_from_slice(
                    &flush_internal.flushing_pages[i * self.page_size..(i + 1) * self.page_size],
                );
                true
            } else {
                drop(flush_internal);
                let files = self.files.read();
                let file = files
                    .get(&cid)
                    .ok_or_else(|| anyhow!("container {cid:?} has no file"))?
                    .clone();
                drop(files);
                let mut f = file.f.lock();
                read_page(&mut f, pgid, self.page_size, buff)?
            }
        };

        let decoded = ok && decode_page(self.page_size, meta, buff)?;
        if !decoded {
            meta.kind = PageKind::None;
            meta.lsn = None;
            meta.is_dirty = false;
        } else if meta.id != pgid || meta.cid != cid {
            return Err(anyhow!(
                "page {} of container {} is written with wrong identity {}/{}",
                pgid.get(),
                cid.get(),
                meta.id.get(),
                meta.cid.get(),
            ));
        }

        Ok(())
    }

    fn stage_evicted_page(
        &self,
        flush_internal: &mut PagerFlushInternal,
        key: FrameKey,
        buffer: &[u8],
    ) -> anyhow::Result<()> {
        if let Some((i, _)) = flush_internal.flushing_keys.get_full(&key) {
            flush_internal.flushing_pages[i * self.page_size..(i + 1) * self.page_size]
                .copy_from_slice(buffer);
        } else {
            let is_full = flush_internal.flushing_keys.len() * self.page_size
                >= flush_internal.flushing_pages.len();
            if is_full {
                self.write_staged_pages(flush_internal)?;
            }
            let i = flush_internal.flushing_keys.len();
            flush_internal.flushing_keys.insert(key);
            flush_internal.flushing_pages[i * self.page_size..(i + 1) * self.page_size]
                .copy_from_slice(buffer);
        }
        Ok(())
    }

    /// Writes the staged pages: first as one blob to the double-write file,
    /// then each to its home position. A crash between the two leaves a
    /// complete copy in the double-write file for `recover_non_atomic_write`.
    fn write_staged_pages(&self, flush_internal: &mut PagerFlushInternal) -> anyhow::Result<()> {
        if flush_internal.flushing_keys.is_empty() {
            return Ok(());
        }

        // WAL before data.
        if let Some(wal) = self.wal.read().clone() {
            wal.flush_all()?;
        }

        let used = flush_internal.flushing_keys.len() * self.page_size;
        let mut double_buff_f = self.double_buff_f.lock();
        double_buff_f.set_len(0)?;
        double_buff_f.seek(SeekFrom::Start(0))?;
        double_buff_f.write_all(&flush_internal.flushing_pages[..used])?;
        double_buff_f.sync_all()?;
        drop(double_buff_f);

        for (i, (cid, pgid)) in flush_internal.flushing_keys.iter().enumerate() {
            let files = self.files.read();
            let Some(file) = files.get(cid).cloned() else {
                // The container went away while its page sat in staging.
                continue;
            };
            drop(files);
            let mut f = file.f.lock();
            write_page(
                &mut f,
                *pgid,
                self.page_size,
                &flush_internal.flushing_pages[i * self.page_size..(i + 1) * self.page_size],
            )?;
            f.sync_all()?;
        }

        flush_internal.flushing_keys.clear();
        Ok(())
    }

    /// Drops staged pages of one container by flushing everything else out.
    fn discard_staged(&self, cid: ContainerId) -> anyhow::Result<()> {
        let mut flush_internal = self.flush_internal.write();
        if flush_internal.flushing_keys.iter().any(|(c, _)| *c == cid) {
            let keep: Vec<(FrameKey, Vec<u8>)> = flush_internal
                .flushing_keys
                .iter()
                .enumerate()
                .filter(|(_, (c, _))| *c != cid)
                .map(|(i, key)| {
                    (
                        *key,
                        flush_internal.flushing_pages[i * self.page_size..(i + 1) * self.page_size]
                            .to_vec(),
                    )
                })
                .collect();
            flush_internal.flushing_keys.clear();
            for (i, (key, bytes)) in keep.iter().enumerate() {
                flush_internal.flushing_keys.insert(*key);
                flush_internal.flushing_pages[i * self.page_size..(i + 1) * self.page_size]
                    .copy_from_slice(bytes);
            }
        }
        Ok(())
    }

    /// Flushes every dirty frame through the double-write buffer. With the
    /// WAL flushed first this is the whole checkpoint story: once it
    /// returns, log files older than the oldest live transaction are no
    /// longer needed.
    pub(crate) fn checkpoint(&self) -> anyhow::Result<()> {
        if let Some(wal) = self.wal.read().clone() {
            wal.flush_all()?;
        }

        for frame_id in 0..self.n {
            let meta = {
                let internal = self.internal.write();
                if frame_id >= internal.allocated {
                    continue;
                }
                // SAFETY: metas + frame_id is inside the arena.
                unsafe { &*internal.metas.add(frame_id) }
            };

            let mut frame = meta.write();
            if !frame.is_dirty {
                continue;
            }
            let buffer = {
                let internal = self.internal.write();
                let buffer_offset = unsafe { internal.buffer.add(frame_id * self.page_size) };
                // SAFETY: the frame's meta lock is held.
                unsafe { std::slice::from_raw_parts_mut(buffer_offset, self.page_size) }
            };
            encode_page(&frame, buffer);

            let mut flush_internal = self.flush_internal.write();
            self.stage_evicted_page(&mut flush_internal, (frame.cid, frame.id), buffer)?;
            drop(flush_internal);

            let mut internal = self.internal.write();
            internal.dirty_frames.remove(&frame_id);
            if internal.ref_count[frame_id] == 0 && internal.free_frames.contains(&frame_id) {
                internal.free_and_clean.insert(frame_id);
            }
            drop(internal);

            // The meta lock is still held; mark the in-memory copy clean.
            frame.is_dirty = false;
        }

        let mut flush_internal = self.flush_internal.write();
        self.write_staged_pages(&mut flush_internal)?;
        Ok(())
    }

    /// Extends a container file with zeroed, unformatted pages. Purely a
    /// physical optimization; the pages stay invisible until allocated.
    pub(crate) fn preallocate(
        &self,
        cid: ContainerId,
        from: PageId,
        count: usize,
    ) -> anyhow::Result<()> {
        let files = self.files.read();
        let file = files
            .get(&cid)
            .ok_or_else(|| anyhow!("container {cid:?} has no file"))?
            .clone();
        drop(files);

        let mut f = file.f.lock();
        let zeros = vec![0u8; self.page_size * count];
        f.seek(SeekFrom::Start((from.get() - 1) * self.page_size as u64))?;
        f.write_all(&zeros)?;
        f.sync_all()?;
        Ok(())
    }

    pub(crate) fn shutdown(self) -> anyhow::Result<()> {
        self.checkpoint()?;
        Ok(())
    }

    fn release(&self, frame_id: usize, is_dirty: bool) {
        let mut internal = self.internal.write();
        internal.ref_count[frame_id] -= 1;

        let now_free = if internal.ref_count[frame_id] == 0 {
            internal.free_frames.insert(frame_id);
            true
        } else {
            false
        };

        let maybe_clean = if is_dirty {
            internal.dirty_frames.insert(frame_id);
            internal.free_and_clean.remove(&frame_id);
            false
        } else {
            true
        };

        if now_free && maybe_clean && !internal.dirty_frames.contains(&frame_id) {
            internal.free_and_clean.insert(frame_id);
        }
    }
}

fn read_page(f: &mut File, pgid: PageId, page_size: usize, buff: &mut [u8]) -> anyhow::Result<bool> {
    let offset = (pgid.get() - 1) * page_size as u64;
    let file_size = f.metadata()?.len();
    if offset + page_size as u64 > file_size {
        return Ok(false);
    }
    f.seek(SeekFrom::Start(offset))?;
    f.read_exact(buff)?;
    Ok(true)
}

fn write_page(f: &mut File, pgid: PageId, page_size: usize, buff: &[u8]) -> anyhow::Result<()> {
    let offset = (pgid.get() - 1) * page_size as u64;
    f.seek(SeekFrom::Start(offset))?;
    f.write_all(buff)?;
    Ok(())
}

pub(crate) struct PageRead<'a> {
    pager: &'a Pager,
    frame_id: usize,
    meta: RwLockReadGuard<'a, PageMeta>,
    buffer: &'a [u8],
}

impl Drop for PageRead<'_> {
    fn drop(&mut self) {
        self.pager.release(self.frame_id, false);
    }
}

impl<'a> PageRead<'a> {
    pub(crate) fn meta(&self) -> &PageMeta {
        &self.meta
    }

    pub(crate) fn buffer(&self) -> &[u8] {
        self.buffer
    }

    pub(crate) fn id(&self) -> PageId {
        self.meta.id
    }

    pub(crate) fn is_none(&self) -> bool {
        matches!(self.meta.kind, PageKind::None)
    }

    pub(crate) fn into_data(self) -> Option<DataPageRead<'a>> {
        if matches!(self.meta.kind, PageKind::Data { .. }) {
            Some(DataPageRead(self))
        } else {
            None
        }
    }

    pub(crate) fn into_overflow(self) -> Option<OverflowPageRead<'a>> {
        if matches!(self.meta.kind, PageKind::Overflow { .. }) {
            Some(OverflowPageRead(self))
        } else {
            None
        }
    }
}

pub(crate) struct PageWrite<'a> {
    pager: &'a Pager,
    frame_id: usize,
    meta: RwLockWriteGuard<'a, PageMeta>,
    buffer: &'a mut [u8],
}

impl Drop for PageWrite<'_> {
    fn drop(&mut self) {
        self.pager.release(self.frame_id, self.meta.is_dirty);
    }
}

impl<'a> PageWrite<'a> {
    pub(crate) fn meta(&self) -> &PageMeta {
        &self.meta
    }

    pub(crate) fn buffer(&self) -> &[u8] {
        self.buffer
    }

    pub(crate) fn parts_mut(&mut self) -> (&mut PageMeta, &mut [u8]) {
        (&mut self.meta, &mut *self.buffer)
    }

    pub(crate) fn id(&self) -> PageId {
        self.meta.id
    }

    pub(crate) fn page_size(&self) -> usize {
        self.pager.page_size
    }

    pub(crate) fn is_none(&self) -> bool {
        matches!(self.meta.kind, PageKind::None)
    }

    /// Formats this frame as an empty data page. Logging is the caller's
    /// business; `instant` is the covering allocation record.
    pub(crate) fn init_data(mut self, instant: Option<LogInstant>) -> DataPageWrite<'a> {
        let free_ptr = self.pager.page_size - PAGE_FOOTER_SIZE;
        self.meta.kind = PageKind::Data {
            slot_count: 0,
            live_count: 0,
            free_ptr,
            next_record_id: 1,
            generation: 1,
        };
        if instant.is_some() {
            self.meta.lsn = instant;
        }
        self.meta.is_dirty = true;
        DataPageWrite(self)
    }

    pub(crate) fn init_overflow(mut self, instant: Option<LogInstant>) -> OverflowPageWrite<'a> {
        self.meta.kind = PageKind::Overflow {
            next: None,
            size: 0,
        };
        if instant.is_some() {
            self.meta.lsn = instant;
        }
        self.meta.is_dirty = true;
        OverflowPageWrite(self)
    }

    pub(crate) fn init_container_header(
        mut self,
        state: ContainerState,
        instant: Option<LogInstant>,
    ) -> ContainerHeaderPageWrite<'a> {
        self.meta.kind = PageKind::ContainerHeader { state };
        if instant.is_some() {
            self.meta.lsn = instant;
        }
        self.meta.is_dirty = true;
        ContainerHeaderPageWrite(self)
    }

    /// Returns the page to the never-written state, used when compensating
    /// an allocation that had grown the container.
    pub(crate) fn set_none(&mut self, instant: Option<LogInstant>) {
        self.meta.kind = PageKind::None;
        if instant.is_some() {
            self.meta.lsn = instant;
        }
        self.meta.is_dirty = true;
    }

    /// Marks the page free, chaining it into the container free list.
    pub(crate) fn set_free(&mut self, next: Option<PageId>, instant: Option<LogInstant>) {
        self.meta.kind = PageKind::Free { next };
        if instant.is_some() {
            self.meta.lsn = instant;
        }
        self.meta.is_dirty = true;
    }

    pub(crate) fn free_next(&self) -> Option<PageId> {
        let PageKind::Free { next } = self.meta.kind else {
            unreachable!("free_next on a non-free page");
        };
        next
    }

    pub(crate) fn into_data(self) -> Option<DataPageWrite<'a>> {
        if matches!(self.meta.kind, PageKind::Data { .. }) {
            Some(DataPageWrite(self))
        } else {
            None
        }
    }

    pub(crate) fn into_overflow(self) -> Option<OverflowPageWrite<'a>> {
        if matches!(self.meta.kind, PageKind::Overflow { .. }) {
            Some(OverflowPageWrite(self))
        } else {
            None
        }
    }

    pub(crate) fn into_container_header(self) -> Option<ContainerHeaderPageWrite<'a>> {
        if matches!(self.meta.kind, PageKind::ContainerHeader { .. }) {
            Some(ContainerHeaderPageWrite(self))
        } else {
            None
        }
    }
}
