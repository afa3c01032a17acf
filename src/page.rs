use crate::bins::SliceExt;
use crate::error::StoreError;
use crate::id::{
    ContainerId, ContainerIdExt, LogInstant, LogInstantExt, PageId, PageIdExt, RecordHandle,
    RecordId,
};
use crate::log::{LogOp, PurgeEntry};
use crate::pager::{PageRead, PageWrite};
use crate::wal::{record_mutation, LogContext};
use anyhow::anyhow;
use std::ops::Range;

pub(crate) const PAGE_HEADER_SIZE: usize = 56;
const PAGE_HEADER_VERSION_RANGE: Range<usize> = 0..2;
const PAGE_HEADER_KIND_INDEX: usize = 2;
const PAGE_HEADER_NEXT_RECORD_ID_RANGE: Range<usize> = 4..8;
const PAGE_HEADER_LSN_RANGE: Range<usize> = 8..16;
const PAGE_HEADER_PAGE_ID_RANGE: Range<usize> = 16..24;
const PAGE_HEADER_CONTAINER_ID_RANGE: Range<usize> = 24..32;
const PAGE_HEADER_SLOT_COUNT_RANGE: Range<usize> = 32..34;
const PAGE_HEADER_LIVE_COUNT_RANGE: Range<usize> = 34..36;
const PAGE_HEADER_FREE_PTR_RANGE: Range<usize> = 36..38;
const PAGE_HEADER_GENERATION_RANGE: Range<usize> = 38..46;

pub(crate) const PAGE_FOOTER_SIZE: usize = 8;
const PAGE_FOOTER_CHECKSUM_RANGE: Range<usize> = 0..8;

pub(crate) const SLOT_ENTRY_SIZE: usize = 12;
const SLOT_RECORD_ID_RANGE: Range<usize> = 0..4;
const SLOT_OFFSET_RANGE: Range<usize> = 4..6;
const SLOT_LEN_RANGE: Range<usize> = 6..8;
const SLOT_FLAGS_RANGE: Range<usize> = 8..10;
const SLOT_RESERVED_RANGE: Range<usize> = 10..12;

const OVERFLOW_HEADER_NEXT_RANGE: Range<usize> = 0..8;
const OVERFLOW_HEADER_SIZE_RANGE: Range<usize> = 8..10;
pub(crate) const OVERFLOW_PAGE_HEADER_SIZE: usize = 10;

const FREE_HEADER_NEXT_RANGE: Range<usize> = 0..8;

const CONTAINER_HEADER_PAGE_COUNT_RANGE: Range<usize> = 0..8;
const CONTAINER_HEADER_FREELIST_RANGE: Range<usize> = 8..16;
const CONTAINER_HEADER_DROPPED_INDEX: usize = 16;
const CONTAINER_HEADER_SPARE_SPACE_INDEX: usize = 17;
const CONTAINER_HEADER_MIN_RECORD_SIZE_RANGE: Range<usize> = 18..22;
const CONTAINER_HEADER_REUSE_RECORD_IDS_INDEX: usize = 22;

/// Slot flag bits, as stored in the slot directory and in page log records.
pub(crate) const REC_DELETED: u16 = 0x1;
pub(crate) const REC_HAS_CONTINUATION: u16 = 0x2;
pub(crate) const REC_HAS_LONG_COLUMNS: u16 = 0x4;

pub(crate) const PAGE_KIND_NONE: u8 = 0;
pub(crate) const PAGE_KIND_DATA: u8 = 1;
pub(crate) const PAGE_KIND_OVERFLOW: u8 = 2;
pub(crate) const PAGE_KIND_FREE: u8 = 3;
pub(crate) const PAGE_KIND_CONTAINER_HEADER: u8 = 4;

macro_rules! const_assert {
    ($($tt:tt)*) => {
        const _: () = assert!($($tt)*);
    }
}

#[allow(dead_code)]
const fn range_size(range: Range<usize>) -> usize {
    range.end - range.start
}

const_assert!(PAGE_HEADER_VERSION_RANGE.end <= PAGE_HEADER_SIZE);
const_assert!(range_size(PAGE_HEADER_NEXT_RECORD_ID_RANGE) == 4);
const_assert!(range_size(PAGE_HEADER_LSN_RANGE) == 8);
const_assert!(range_size(PAGE_HEADER_PAGE_ID_RANGE) == 8);
const_assert!(range_size(PAGE_HEADER_CONTAINER_ID_RANGE) == 8);
const_assert!(range_size(PAGE_HEADER_SLOT_COUNT_RANGE) == 2);
const_assert!(range_size(PAGE_HEADER_LIVE_COUNT_RANGE) == 2);
const_assert!(range_size(PAGE_HEADER_FREE_PTR_RANGE) == 2);
const_assert!(range_size(PAGE_HEADER_GENERATION_RANGE) == 8);
const_assert!(PAGE_HEADER_GENERATION_RANGE.end <= PAGE_HEADER_SIZE);
const_assert!(range_size(PAGE_FOOTER_CHECKSUM_RANGE) == 8);
const_assert!(SLOT_RESERVED_RANGE.end <= SLOT_ENTRY_SIZE);
const_assert!(range_size(CONTAINER_HEADER_MIN_RECORD_SIZE_RANGE) == 4);

/// The durable per-container state kept on the container header page.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct ContainerState {
    pub(crate) page_count: u64,
    pub(crate) freelist: Option<PageId>,
    pub(crate) dropped: bool,
    pub(crate) spare_space: u8,
    pub(crate) min_record_size: u32,
    pub(crate) reuse_record_ids: bool,
}

/// Parsed header fields of a cached page. The buffer holds the slot
/// directory and record bytes; these fields are authoritative at runtime
/// and are written back into the header region when the frame is flushed.
#[derive(Copy, Clone, Debug)]
pub(crate) enum PageKind {
    None,
    Data {
        slot_count: usize,
        live_count: usize,
        free_ptr: usize,
        next_record_id: u32,
        generation: u64,
    },
    Overflow {
        next: Option<PageId>,
        size: usize,
    },
    Free {
        next: Option<PageId>,
    },
    ContainerHeader {
        state: ContainerState,
    },
}

impl PageKind {
    pub(crate) fn code(&self) -> u8 {
        match self {
            PageKind::None => PAGE_KIND_NONE,
            PageKind::Data { .. } => PAGE_KIND_DATA,
            PageKind::Overflow { .. } => PAGE_KIND_OVERFLOW,
            PageKind::Free { .. } => PAGE_KIND_FREE,
            PageKind::ContainerHeader { .. } => PAGE_KIND_CONTAINER_HEADER,
        }
    }
}

#[derive(Debug)]
pub(crate) struct PageMeta {
    pub(crate) cid: ContainerId,
    pub(crate) id: PageId,
    pub(crate) kind: PageKind,
    pub(crate) lsn: Option<LogInstant>,
    pub(crate) is_dirty: bool,
}

/// Decodes a page image read from disk into `meta`. Returns false when the
/// checksum does not match, which the pager treats as a never-written page.
pub(crate) fn decode_page(
    page_size: usize,
    meta: &mut PageMeta,
    buff: &[u8],
) -> anyhow::Result<bool> {
    assert_eq!(page_size, buff.len());

    let footer = &buff[page_size - PAGE_FOOTER_SIZE..];
    let stored_checksum = footer[PAGE_FOOTER_CHECKSUM_RANGE].read_u64();
    let checksum = crc64::crc64(0x1d0f, &buff[..page_size - PAGE_FOOTER_SIZE]);
    if stored_checksum != checksum {
        return Ok(false);
    }

    let header = &buff[..PAGE_HEADER_SIZE];
    let version = header[PAGE_HEADER_VERSION_RANGE].read_u16();
    if version != 0 {
        return Err(anyhow!("page version {version} is not supported"));
    }

    let Some(page_id) =
        PageId::from_be_bytes(header[PAGE_HEADER_PAGE_ID_RANGE].try_into().unwrap())
    else {
        return Err(anyhow!("found an empty page id when decoding page"));
    };
    let Some(cid) =
        ContainerId::from_be_bytes(header[PAGE_HEADER_CONTAINER_ID_RANGE].try_into().unwrap())
    else {
        return Err(anyhow!("found an empty container id when decoding page"));
    };
    let lsn = LogInstant::from_be_bytes(header[PAGE_HEADER_LSN_RANGE].try_into().unwrap());

    let kind = match header[PAGE_HEADER_KIND_INDEX] {
        PAGE_KIND_NONE => PageKind::None,
        PAGE_KIND_DATA => PageKind::Data {
            slot_count: header[PAGE_HEADER_SLOT_COUNT_RANGE].read_u16() as usize,
            live_count: header[PAGE_HEADER_LIVE_COUNT_RANGE].read_u16() as usize,
            free_ptr: header[PAGE_HEADER_FREE_PTR_RANGE].read_u16() as usize,
            next_record_id: header[PAGE_HEADER_NEXT_RECORD_ID_RANGE].read_u32(),
            generation: header[PAGE_HEADER_GENERATION_RANGE].read_u64(),
        },
        PAGE_KIND_OVERFLOW => {
            let payload = &buff[PAGE_HEADER_SIZE..];
            PageKind::Overflow {
                next: PageId::from_be_bytes(payload[OVERFLOW_HEADER_NEXT_RANGE].try_into().unwrap()),
                size: payload[OVERFLOW_HEADER_SIZE_RANGE].read_u16() as usize,
            }
        }
        PAGE_KIND_FREE => {
            let payload = &buff[PAGE_HEADER_SIZE..];
            PageKind::Free {
                next: PageId::from_be_bytes(payload[FREE_HEADER_NEXT_RANGE].try_into().unwrap()),
            }
        }
        PAGE_KIND_CONTAINER_HEADER => {
            let payload = &buff[PAGE_HEADER_SIZE..];
            PageKind::ContainerHeader {
                state: ContainerState {
                    page_count: payload[CONTAINER_HEADER_PAGE_COUNT_RANGE].read_u64(),
                    freelist: PageId::from_be_bytes(
                        payload[CONTAINER_HEADER_FREELIST_RANGE].try_into().unwrap(),
                    ),
                    dropped: payload[CONTAINER_HEADER_DROPPED_INDEX] != 0,
                    spare_space: payload[CONTAINER_HEADER_SPARE_SPACE_INDEX],
                    min_record_size: payload[CONTAINER_HEADER_MIN_RECORD_SIZE_RANGE].read_u32(),
                    reuse_record_ids: payload[CONTAINER_HEADER_REUSE_RECORD_IDS_INDEX] != 0,
                },
            }
        }
        kind => return Err(anyhow!("page kind {kind} is not recognized")),
    };

    meta.cid = cid;
    meta.id = page_id;
    meta.kind = kind;
    meta.lsn = lsn;
    Ok(true)
}

/// Writes `meta`'s header fields and the footer checksum into the page
/// image before it goes to disk.
pub(crate) fn encode_page(meta: &PageMeta, buff: &mut [u8]) {
    let page_size = buff.len();

    {
        let header = &mut buff[..PAGE_HEADER_SIZE];
        header[PAGE_HEADER_VERSION_RANGE].fill(0);
        header[PAGE_HEADER_KIND_INDEX] = meta.kind.code();
        header[3] = 0;
        header[PAGE_HEADER_LSN_RANGE].copy_from_slice(&meta.lsn.to_be_bytes());
        header[PAGE_HEADER_PAGE_ID_RANGE].copy_from_slice(&meta.id.to_be_bytes());
        header[PAGE_HEADER_CONTAINER_ID_RANGE].copy_from_slice(&meta.cid.to_be_bytes());
    }

    match &meta.kind {
        PageKind::None | PageKind::Free { .. } | PageKind::Overflow { .. } => {
            let header = &mut buff[..PAGE_HEADER_SIZE];
            header[PAGE_HEADER_NEXT_RECORD_ID_RANGE].fill(0);
            header[PAGE_HEADER_SLOT_COUNT_RANGE].fill(0);
            header[PAGE_HEADER_LIVE_COUNT_RANGE].fill(0);
            header[PAGE_HEADER_FREE_PTR_RANGE].fill(0);
            header[PAGE_HEADER_GENERATION_RANGE].fill(0);
        }
        PageKind::Data {
            slot_count,
            live_count,
            free_ptr,
            next_record_id,
            generation,
        } => {
            let header = &mut buff[..PAGE_HEADER_SIZE];
            header[PAGE_HEADER_NEXT_RECORD_ID_RANGE]
                .copy_from_slice(&next_record_id.to_be_bytes());
            header[PAGE_HEADER_SLOT_COUNT_RANGE]
                .copy_from_slice(&(*slot_count as u16).to_be_bytes());
            header[PAGE_HEADER_LIVE_COUNT_RANGE]
                .copy_from_slice(&(*live_count as u16).to_be_bytes());
            header[PAGE_HEADER_FREE_PTR_RANGE].copy_from_slice(&(*free_ptr as u16).to_be_bytes());
            header[PAGE_HEADER_GENERATION_RANGE].copy_from_slice(&generation.to_be_bytes());
        }
        PageKind::ContainerHeader { state } => {
            let payload = &mut buff[PAGE_HEADER_SIZE..];
            payload[CONTAINER_HEADER_PAGE_COUNT_RANGE]
                .copy_from_slice(&state.page_count.to_be_bytes());
            payload[CONTAINER_HEADER_FREELIST_RANGE]
                .copy_from_slice(&state.freelist.to_be_bytes());
            payload[CONTAINER_HEADER_DROPPED_INDEX] = state.dropped as u8;
            payload[CONTAINER_HEADER_SPARE_SPACE_INDEX] = state.spare_space;
            payload[CONTAINER_HEADER_MIN_RECORD_SIZE_RANGE]
                .copy_from_slice(&state.min_record_size.to_be_bytes());
            payload[CONTAINER_HEADER_REUSE_RECORD_IDS_INDEX] = state.reuse_record_ids as u8;
        }
    }

    if let PageKind::Overflow { next, size } = &meta.kind {
        let payload = &mut buff[PAGE_HEADER_SIZE..];
        payload[OVERFLOW_HEADER_NEXT_RANGE].copy_from_slice(&next.to_be_bytes());
        payload[OVERFLOW_HEADER_SIZE_RANGE].copy_from_slice(&(*size as u16).to_be_bytes());
    }
    if let PageKind::Free { next } = &meta.kind {
        let payload = &mut buff[PAGE_HEADER_SIZE..];
        payload[FREE_HEADER_NEXT_RANGE].copy_from_slice(&next.to_be_bytes());
    }

    let checksum = crc64::crc64(0x1d0f, &buff[..page_size - PAGE_FOOTER_SIZE]);
    let footer = &mut buff[page_size - PAGE_FOOTER_SIZE..];
    footer[PAGE_FOOTER_CHECKSUM_RANGE].copy_from_slice(&checksum.to_be_bytes());
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct SlotEntry {
    pub(crate) record_id: u32,
    pub(crate) offset: usize,
    pub(crate) len: usize,
    pub(crate) flags: u16,
    pub(crate) reserved: usize,
}

impl SlotEntry {
    pub(crate) fn is_deleted(&self) -> bool {
        self.flags & REC_DELETED != 0
    }
}

fn slot_range(i: usize) -> Range<usize> {
    let start = PAGE_HEADER_SIZE + i * SLOT_ENTRY_SIZE;
    start..start + SLOT_ENTRY_SIZE
}

fn read_slot(buff: &[u8], i: usize) -> SlotEntry {
    let raw = &buff[slot_range(i)];
    SlotEntry {
        record_id: raw[SLOT_RECORD_ID_RANGE].read_u32(),
        offset: raw[SLOT_OFFSET_RANGE].read_u16() as usize,
        len: raw[SLOT_LEN_RANGE].read_u16() as usize,
        flags: raw[SLOT_FLAGS_RANGE].read_u16(),
        reserved: raw[SLOT_RESERVED_RANGE].read_u16() as usize,
    }
}

fn write_slot(buff: &mut [u8], i: usize, entry: SlotEntry) {
    let raw = &mut buff[slot_range(i)];
    raw[SLOT_RECORD_ID_RANGE].copy_from_slice(&entry.record_id.to_be_bytes());
    raw[SLOT_OFFSET_RANGE].copy_from_slice(&(entry.offset as u16).to_be_bytes());
    raw[SLOT_LEN_RANGE].copy_from_slice(&(entry.len as u16).to_be_bytes());
    raw[SLOT_FLAGS_RANGE].copy_from_slice(&entry.flags.to_be_bytes());
    raw[SLOT_RESERVED_RANGE].copy_from_slice(&(entry.reserved as u16).to_be_bytes());
}

macro_rules! data_page_read_impl {
    () => {
        pub(crate) fn id(&self) -> PageId {
            self.meta().id
        }

        pub(crate) fn container(&self) -> ContainerId {
            self.meta().cid
        }

        fn data_kind(&self) -> (usize, usize, usize, u32, u64) {
            let PageKind::Data {
                slot_count,
                live_count,
                free_ptr,
                next_record_id,
                generation,
            } = self.meta().kind
            else {
                unreachable!("data page wrapper over a non-data page");
            };
            (slot_count, live_count, free_ptr, next_record_id, generation)
        }

        pub(crate) fn count(&self) -> usize {
            self.data_kind().0
        }

        pub(crate) fn live_count(&self) -> usize {
            self.data_kind().1
        }

        pub(crate) fn next_record_id(&self) -> u32 {
            self.data_kind().3
        }

        /// The page's optimistic timestamp; advanced by every mutation.
        pub(crate) fn generation(&self) -> u64 {
            self.data_kind().4
        }

        pub(crate) fn slot(&self, i: usize) -> anyhow::Result<SlotEntry> {
            let count = self.count();
            if i >= count {
                return Err(StoreError::SlotOutOfRange { slot: i, count }.into());
            }
            Ok(read_slot(self.buffer(), i))
        }

        pub(crate) fn payload(&self, i: usize) -> anyhow::Result<&[u8]> {
            let entry = self.slot(i)?;
            Ok(&self.buffer()[entry.offset..entry.offset + entry.len])
        }

        pub(crate) fn find_record(&self, rid: RecordId) -> Option<usize> {
            let count = self.count();
            let buff = self.buffer();
            (0..count).find(|&i| read_slot(buff, i).record_id == rid.get())
        }

        /// Free bytes available for new records and their slot entries.
        pub(crate) fn free_space(&self) -> usize {
            let (slot_count, _, free_ptr, _, _) = self.data_kind();
            free_ptr - (PAGE_HEADER_SIZE + slot_count * SLOT_ENTRY_SIZE)
        }

        /// Exact predicate: an insert of `payload_len` bytes with `reserve`
        /// extra reserved bytes succeeds iff this returns true.
        pub(crate) fn space_for_insert(&self, payload_len: usize, reserve: usize) -> bool {
            self.free_space() >= SLOT_ENTRY_SIZE + payload_len + reserve
        }
    };
}

pub(crate) struct DataPageRead<'a>(pub(crate) PageRead<'a>);

impl<'a> DataPageRead<'a> {
    fn meta(&self) -> &PageMeta {
        self.0.meta()
    }

    fn buffer(&self) -> &[u8] {
        self.0.buffer()
    }

    data_page_read_impl!();
}

pub(crate) struct DataPageWrite<'a>(pub(crate) PageWrite<'a>);

impl<'a> DataPageWrite<'a> {
    fn meta(&self) -> &PageMeta {
        self.0.meta()
    }

    fn buffer(&self) -> &[u8] {
        self.0.buffer()
    }

    data_page_read_impl!();

    fn set_data_kind(&mut self, f: impl FnOnce(&mut usize, &mut usize, &mut usize, &mut u32)) {
        let (meta, _) = self.0.parts_mut();
        let PageKind::Data {
            ref mut slot_count,
            ref mut live_count,
            ref mut free_ptr,
            ref mut next_record_id,
            ref mut generation,
        } = meta.kind
        else {
            unreachable!("data page wrapper over a non-data page");
        };
        f(slot_count, live_count, free_ptr, next_record_id);
        *generation += 1;
        meta.is_dirty = true;
    }

    fn stamp(&mut self, instant: Option<LogInstant>) {
        let (meta, _) = self.0.parts_mut();
        if instant.is_some() {
            meta.lsn = instant;
        }
    }

    /// Inserts a record at `slot` (existing slots shift up). Returns `None`
    /// without mutating anything when the page lacks space.
    pub(crate) fn insert(
        &mut self,
        ctx: LogContext<'_>,
        slot: usize,
        payload: &[u8],
        flags: u16,
        reserve: usize,
        undo_with_purge: bool,
    ) -> anyhow::Result<Option<RecordHandle>> {
        let count = self.count();
        if slot > count {
            return Err(StoreError::SlotOutOfRange { slot, count }.into());
        }
        if !self.space_for_insert(payload.len(), reserve) {
            return Ok(None);
        }

        let record_id = self.next_record_id();
        if record_id == u32::MAX {
            return Err(StoreError::RecordIdOverflow.into());
        }
        self.insert_with_id(ctx, slot, RecordId::new(record_id), payload, flags, reserve, undo_with_purge)
            .map(Some)
    }

    /// Inserts with an explicit record id; used by redo and by purge
    /// rollback, which must restore original ids.
    pub(crate) fn insert_with_id(
        &mut self,
        ctx: LogContext<'_>,
        slot: usize,
        record_id: RecordId,
        payload: &[u8],
        flags: u16,
        reserve: usize,
        undo_with_purge: bool,
    ) -> anyhow::Result<RecordHandle> {
        let count = self.count();
        if slot > count {
            return Err(StoreError::SlotOutOfRange { slot, count }.into());
        }
        if !self.space_for_insert(payload.len(), reserve) {
            return Err(StoreError::NoSpace.into());
        }

        let (cid, pgid) = (self.container(), self.id());
        let instant = record_mutation(
            ctx,
            LogOp::PageInsert {
                cid,
                pgid,
                slot: slot as u16,
                record_id: record_id.get(),
                flags,
                undo_with_purge,
                reserved: reserve as u16,
                payload,
            },
        )?;

        {
            let (_, buff) = self.0.parts_mut();
            // Shift the slot directory up to open the target slot.
            for i in (slot..count).rev() {
                let entry = read_slot(buff, i);
                write_slot(buff, i + 1, entry);
            }
        }

        let (_, _, free_ptr, _, _) = self.data_kind();
        let total = payload.len() + reserve;
        let offset = free_ptr - total;
        {
            let (_, buff) = self.0.parts_mut();
            buff[offset..offset + payload.len()].copy_from_slice(payload);
            write_slot(
                buff,
                slot,
                SlotEntry {
                    record_id: record_id.get(),
                    offset,
                    len: payload.len(),
                    flags,
                    reserved: reserve,
                },
            );
        }

        let deleted = flags & REC_DELETED != 0;
        self.set_data_kind(|slot_count, live_count, free_ptr, next_record_id| {
            *slot_count += 1;
            if !deleted {
                *live_count += 1;
            }
            *free_ptr = offset;
            *next_record_id = (*next_record_id).max(record_id.get() + 1);
        });
        self.stamp(instant);

        Ok(RecordHandle::valid(pgid, record_id))
    }

    /// Replaces a record's payload, growing in place when its reservation
    /// allows and relocating within the page otherwise.
    pub(crate) fn update(
        &mut self,
        ctx: LogContext<'_>,
        slot: usize,
        new_payload: &[u8],
        new_flags: u16,
    ) -> anyhow::Result<()> {
        let entry = self.slot(slot)?;
        let in_place = new_payload.len() <= entry.len + entry.reserved;
        if !in_place {
            // The record is moved: its old bytes are reclaimed first, so the
            // new payload only needs to fit in the remaining free space.
            let available = self.free_space() + entry.len + entry.reserved;
            if new_payload.len() > available {
                return Err(StoreError::NoSpace.into());
            }
        }

        let (cid, pgid) = (self.container(), self.id());
        let old_payload = self.payload(slot)?.to_vec();
        let instant = record_mutation(
            ctx,
            LogOp::PageUpdate {
                cid,
                pgid,
                slot: slot as u16,
                record_id: entry.record_id,
                old_flags: entry.flags,
                new_flags,
                old_payload: &old_payload,
                new_payload,
            },
        )?;

        if in_place {
            let (_, buff) = self.0.parts_mut();
            buff[entry.offset..entry.offset + new_payload.len()].copy_from_slice(new_payload);
            write_slot(
                buff,
                slot,
                SlotEntry {
                    len: new_payload.len(),
                    reserved: entry.len + entry.reserved - new_payload.len(),
                    flags: new_flags,
                    ..entry
                },
            );
        } else {
            self.remove_bytes(entry.offset, entry.len + entry.reserved);
            let (_, _, free_ptr, _, _) = self.data_kind();
            let offset = free_ptr - new_payload.len();
            let (_, buff) = self.0.parts_mut();
            buff[offset..offset + new_payload.len()].copy_from_slice(new_payload);
            write_slot(
                buff,
                slot,
                SlotEntry {
                    record_id: entry.record_id,
                    offset,
                    len: new_payload.len(),
                    flags: new_flags,
                    reserved: 0,
                },
            );
            self.set_data_kind(|_, _, free_ptr, _| *free_ptr = offset);
        }

        let was_deleted = entry.is_deleted();
        let now_deleted = new_flags & REC_DELETED != 0;
        self.set_data_kind(|_, live_count, _, _| {
            if was_deleted && !now_deleted {
                *live_count += 1;
            } else if !was_deleted && now_deleted {
                *live_count -= 1;
            }
        });
        self.stamp(instant);
        Ok(())
    }

    /// Toggles the deleted bit. Asking for the state the record is already
    /// in is a statement-severity error.
    pub(crate) fn set_deleted(
        &mut self,
        ctx: LogContext<'_>,
        slot: usize,
        deleted: bool,
    ) -> anyhow::Result<()> {
        let entry = self.slot(slot)?;
        if entry.is_deleted() == deleted {
            return Err(StoreError::DeleteMismatch.into());
        }

        let (cid, pgid) = (self.container(), self.id());
        let instant = record_mutation(
            ctx,
            LogOp::PageSetDeleted {
                cid,
                pgid,
                slot: slot as u16,
                record_id: entry.record_id,
                deleted,
            },
        )?;

        let new_flags = if deleted {
            entry.flags | REC_DELETED
        } else {
            entry.flags & !REC_DELETED
        };
        {
            let (_, buff) = self.0.parts_mut();
            write_slot(
                buff,
                slot,
                SlotEntry {
                    flags: new_flags,
                    ..entry
                },
            );
        }
        self.set_data_kind(|_, live_count, _, _| {
            if deleted {
                *live_count -= 1;
            } else {
                *live_count += 1;
            }
        });
        self.stamp(instant);
        Ok(())
    }

    /// Physically removes `count` slots starting at `start`, renumbering
    /// the slots above them. With `log_data` false only the row sizes are
    /// logged; rolling such a purge back reinserts placeholders.
    pub(crate) fn purge(
        &mut self,
        ctx: LogContext<'_>,
        start: usize,
        purge_count: usize,
        log_data: bool,
        reuse_record_ids: bool,
    ) -> anyhow::Result<()> {
        let count = self.count();
        if purge_count == 0 || start + purge_count > count {
            return Err(StoreError::SlotOutOfRange {
                slot: start + purge_count,
                count,
            }
            .into());
        }

        let (cid, pgid) = (self.container(), self.id());
        let mut old_payloads = Vec::with_capacity(purge_count);
        for i in start..start + purge_count {
            old_payloads.push((self.slot(i)?, self.payload(i)?.to_vec()));
        }
        let entries = old_payloads
            .iter()
            .map(|(entry, payload)| PurgeEntry {
                record_id: entry.record_id,
                flags: entry.flags,
                encoded_len: payload.len() as u16,
                payload: log_data.then_some(payload.as_slice()),
            })
            .collect();

        let instant = record_mutation(
            ctx,
            LogOp::PagePurge {
                cid,
                pgid,
                start_slot: start as u16,
                log_data,
                entries,
            },
        )?;

        let removed_live = old_payloads
            .iter()
            .filter(|(entry, _)| !entry.is_deleted())
            .count();
        // Offsets shift as bytes are reclaimed, so each slot is re-read
        // rather than trusting the entries captured for the log record.
        for i in (start..start + purge_count).rev() {
            let entry = self.slot(i)?;
            self.remove_bytes(entry.offset, entry.len + entry.reserved);
        }
        {
            let (_, buff) = self.0.parts_mut();
            for i in start + purge_count..count {
                let entry = read_slot(buff, i);
                write_slot(buff, i - purge_count, entry);
            }
        }
        self.set_data_kind(|slot_count, live_count, _, next_record_id| {
            *slot_count -= purge_count;
            *live_count -= removed_live;
            if reuse_record_ids && *slot_count == 0 {
                *next_record_id = 1;
            }
        });
        self.stamp(instant);
        Ok(())
    }

    /// Closes the hole `[offset, offset + size)` in the record area by
    /// sliding everything below it up, keeping record bytes dense.
    fn remove_bytes(&mut self, offset: usize, size: usize) {
        let (_, _, free_ptr, _, _) = self.data_kind();
        let count = self.count();
        {
            let (_, buff) = self.0.parts_mut();
            buff.copy_within(free_ptr..offset, free_ptr + size);
            for i in 0..count {
                let entry = read_slot(buff, i);
                if entry.offset < offset {
                    write_slot(
                        buff,
                        i,
                        SlotEntry {
                            offset: entry.offset + size,
                            ..entry
                        },
                    );
                }
            }
        }
        self.set_data_kind(|_, _, free_ptr, _| *free_ptr += size);
    }
}

pub(crate) struct OverflowPageRead<'a>(pub(crate) PageRead<'a>);

impl<'a> OverflowPageRead<'a> {
    fn overflow_kind(&self) -> (Option<PageId>, usize) {
        let PageKind::Overflow { next, size } = self.0.meta().kind else {
            unreachable!("overflow page wrapper over a non-overflow page");
        };
        (next, size)
    }

    pub(crate) fn next(&self) -> Option<PageId> {
        self.overflow_kind().0
    }

    pub(crate) fn content(&self) -> &[u8] {
        let (_, size) = self.overflow_kind();
        let start = PAGE_HEADER_SIZE + OVERFLOW_PAGE_HEADER_SIZE;
        &self.0.buffer()[start..start + size]
    }
}

pub(crate) struct OverflowPageWrite<'a>(pub(crate) PageWrite<'a>);

impl<'a> OverflowPageWrite<'a> {
    pub(crate) fn id(&self) -> PageId {
        self.0.meta().id
    }

    pub(crate) fn next(&self) -> Option<PageId> {
        let PageKind::Overflow { next, .. } = self.0.meta().kind else {
            unreachable!("overflow page wrapper over a non-overflow page");
        };
        next
    }

    /// Largest content chunk one overflow page holds.
    pub(crate) fn capacity(page_size: usize) -> usize {
        page_size - PAGE_HEADER_SIZE - OVERFLOW_PAGE_HEADER_SIZE - PAGE_FOOTER_SIZE
    }

    pub(crate) fn write(
        &mut self,
        ctx: LogContext<'_>,
        bytes: &[u8],
        next: Option<PageId>,
    ) -> anyhow::Result<()> {
        let (cid, pgid) = (self.0.meta().cid, self.0.meta().id);
        assert!(bytes.len() <= Self::capacity(self.0.page_size()));
        let instant = record_mutation(
            ctx,
            LogOp::OverflowWrite {
                cid,
                pgid,
                next,
                bytes,
            },
        )?;

        let (meta, buff) = self.0.parts_mut();
        let start = PAGE_HEADER_SIZE + OVERFLOW_PAGE_HEADER_SIZE;
        buff[start..start + bytes.len()].copy_from_slice(bytes);
        meta.kind = PageKind::Overflow {
            next,
            size: bytes.len(),
        };
        if instant.is_some() {
            meta.lsn = instant;
        }
        meta.is_dirty = true;
        Ok(())
    }

    pub(crate) fn clear(&mut self, ctx: LogContext<'_>) -> anyhow::Result<()> {
        let (cid, pgid) = (self.0.meta().cid, self.0.meta().id);
        let instant = record_mutation(ctx, LogOp::OverflowClear { cid, pgid })?;
        let (meta, _) = self.0.parts_mut();
        meta.kind = PageKind::Overflow {
            next: None,
            size: 0,
        };
        if instant.is_some() {
            meta.lsn = instant;
        }
        meta.is_dirty = true;
        Ok(())
    }
}

pub(crate) struct ContainerHeaderPageWrite<'a>(pub(crate) PageWrite<'a>);

impl<'a> ContainerHeaderPageWrite<'a> {
    pub(crate) fn state(&self) -> ContainerState {
        let PageKind::ContainerHeader { state } = self.0.meta().kind else {
            unreachable!("container header wrapper over a wrong page kind");
        };
        state
    }

    /// Applies already-logged container state; the caller passes the
    /// instant of the log record that covers this change.
    pub(crate) fn set_state(&mut self, state: ContainerState, instant: Option<LogInstant>) {
        let (meta, _) = self.0.parts_mut();
        meta.kind = PageKind::ContainerHeader { state };
        if instant.is_some() {
            meta.lsn = instant;
        }
        meta.is_dirty = true;
    }
}
