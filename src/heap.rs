use crate::container::Containers;
use crate::error::StoreError;
use crate::id::{ContainerId, PageId, RecordHandle, RecordId};
use crate::page::{
    DataPageWrite, OverflowPageWrite, PAGE_FOOTER_SIZE, PAGE_HEADER_SIZE, REC_HAS_CONTINUATION,
    REC_HAS_LONG_COLUMNS, SLOT_ENTRY_SIZE,
};
use crate::record::{Field, RecordPayload, Row, RECORD_PREFIX_SIZE};
use crate::wal::LogContext;
use anyhow::anyhow;

/// Behavior switches for a heap insert, mirroring the page-op flags.
#[derive(Copy, Clone, Debug, Default)]
pub struct InsertFlags {
    /// Allow rows and columns that do not fit one page to spill onto
    /// overflow pages. Without it an oversized row fails outright.
    pub overflow: bool,
    /// Rolling back this insert physically purges the record instead of
    /// delete-marking it, releasing the space immediately.
    pub undo_with_purge: bool,
}

/// Largest record payload an empty data page can hold.
pub(crate) fn data_page_capacity(page_size: usize) -> usize {
    page_size - PAGE_HEADER_SIZE - PAGE_FOOTER_SIZE - SLOT_ENTRY_SIZE
}

/// Columns larger than this go to an overflow chain once a row stops
/// fitting its page.
fn long_column_threshold(page_size: usize) -> usize {
    data_page_capacity(page_size) / 4
}

const CONTINUATION_FOOTPRINT: usize = 12;

fn inline_size(fields: &[Field]) -> usize {
    RECORD_PREFIX_SIZE + fields.iter().map(Field::encoded_size).sum::<usize>()
}

/// Moves oversized columns onto overflow-page chains until the remaining
/// inline footprint fits `budget` or no convertible column is left.
fn materialize_long_columns(
    containers: &Containers,
    ctx: LogContext<'_>,
    cid: ContainerId,
    fields: &mut [Field],
    budget: usize,
) -> anyhow::Result<bool> {
    let page_size = containers.pager().page_size();
    let threshold = long_column_threshold(page_size);
    let mut any = false;

    loop {
        if inline_size(fields) <= budget {
            return Ok(any);
        }
        let candidate = fields
            .iter()
            .enumerate()
            .filter_map(|(i, f)| match f {
                Field::Inline(bytes) if bytes.len() > threshold => Some((i, bytes.len())),
                _ => None,
            })
            .max_by_key(|(_, len)| *len);
        let Some((idx, _)) = candidate else {
            return Ok(any);
        };

        let Field::Inline(bytes) = std::mem::replace(&mut fields[idx], Field::Long(PageId::new(1).unwrap()))
        else {
            unreachable!();
        };
        let head = write_overflow_chain(containers, ctx, cid, &bytes)?;
        fields[idx] = Field::Long(head);
        any = true;
    }
}

/// Writes a long column's bytes as a chain of overflow pages, last chunk
/// first so each page knows its successor. Returns the head page.
fn write_overflow_chain(
    containers: &Containers,
    ctx: LogContext<'_>,
    cid: ContainerId,
    bytes: &[u8],
) -> anyhow::Result<PageId> {
    let chunk_size = OverflowPageWrite::capacity(containers.pager().page_size());
    let chunks: Vec<&[u8]> = bytes.chunks(chunk_size.max(1)).collect();

    let mut next: Option<PageId> = None;
    for chunk in chunks.iter().rev() {
        let mut page = containers.alloc_overflow_page(ctx, cid)?;
        page.write(ctx, chunk, next)?;
        next = Some(page.id());
    }
    next.ok_or_else(|| anyhow!("long column with no content"))
}

/// Splits fields into a head piece and trailing pieces, each fitting its
/// budget. Every piece keeps room for a continuation pointer; the last one
/// simply does not use it.
fn split_pieces(
    fields: Vec<Field>,
    head_budget: usize,
    piece_budget: usize,
) -> anyhow::Result<(Vec<Field>, Vec<Vec<Field>>)> {
    let mut groups: Vec<Vec<Field>> = vec![Vec::new()];
    let mut current_size = RECORD_PREFIX_SIZE;
    let mut current_budget = head_budget;

    for field in fields {
        let fsize = field.encoded_size();
        let fits = current_size + fsize + CONTINUATION_FOOTPRINT <= current_budget;
        if !fits {
            if RECORD_PREFIX_SIZE + fsize + CONTINUATION_FOOTPRINT > piece_budget {
                // Should have become a long column; nothing can hold it.
                return Err(StoreError::NoSpace.into());
            }
            groups.push(Vec::new());
            current_budget = piece_budget;
            current_size = RECORD_PREFIX_SIZE;
        }
        current_size += fsize;
        groups.last_mut().unwrap().push(field);
    }

    let mut iter = groups.into_iter();
    let head = iter.next().unwrap();
    Ok((head, iter.collect()))
}

/// Inserts the trailing pieces, last first, and returns the continuation
/// pointer for the head piece.
fn insert_tail_pieces(
    containers: &Containers,
    ctx: LogContext<'_>,
    cid: ContainerId,
    pieces: Vec<Vec<Field>>,
    undo_with_purge: bool,
) -> anyhow::Result<Option<(PageId, RecordId)>> {
    let mut continuation: Option<(PageId, RecordId)> = None;
    for fields in pieces.into_iter().rev() {
        let has_long = fields.iter().any(|f| matches!(f, Field::Long(_)));
        let payload = RecordPayload {
            fields,
            continuation,
        }
        .encode();
        let mut flags = 0u16;
        if continuation.is_some() {
            flags |= REC_HAS_CONTINUATION;
        }
        if has_long {
            flags |= REC_HAS_LONG_COLUMNS;
        }

        let mut page = containers.alloc_data_page(ctx, cid)?;
        let slot = page.count();
        let handle = page
            .insert(ctx, slot, &payload, flags, 0, undo_with_purge)?
            .ok_or_else(|| anyhow!("freshly allocated page rejected a sized row piece"))?;
        let (pgid, rid) = handle.resolve().unwrap();
        continuation = Some((pgid, rid));
    }
    Ok(continuation)
}

/// Picks a data page that accepts `needed` more bytes under the container's
/// spare-space policy, allocating a new page when none qualifies.
fn choose_target_page<'p>(
    containers: &'p Containers,
    ctx: LogContext<'_>,
    cid: ContainerId,
    needed: usize,
    spare_space: u8,
) -> anyhow::Result<DataPageWrite<'p>> {
    let pager = containers.pager();
    let page_size = pager.page_size();
    let usable = page_size - PAGE_HEADER_SIZE - PAGE_FOOTER_SIZE;
    let page_count = containers.page_count(cid)?;

    for number in 2..=page_count {
        let Some(pgid) = PageId::new(number) else {
            continue;
        };
        let page = pager.write(cid, pgid)?;
        let Some(data) = page.into_data() else {
            continue;
        };
        if !data.space_for_insert(needed, 0) {
            continue;
        }
        let free_after = data.free_space() - (SLOT_ENTRY_SIZE + needed);
        let spare_ok = free_after * 100 >= usable * spare_space as usize;
        if data.count() == 0 || spare_ok {
            return Ok(data);
        }
    }

    containers.alloc_data_page(ctx, cid)
}

pub(crate) struct HeapOptions {
    pub(crate) spare_space: u8,
    pub(crate) min_record_size: u32,
}

/// Inserts a row, spilling long columns and row pieces onto satellite
/// pages when permitted. The returned handle names the head piece and
/// stays stable for the life of the row.
pub(crate) fn insert_row(
    containers: &Containers,
    ctx: LogContext<'_>,
    cid: ContainerId,
    opts: &HeapOptions,
    row: &Row,
    flags: InsertFlags,
) -> anyhow::Result<RecordHandle> {
    let page_size = containers.pager().page_size();
    let capacity = data_page_capacity(page_size);

    let mut fields: Vec<Field> = row
        .columns
        .iter()
        .map(|c| Field::Inline(c.clone()))
        .collect();

    let single_piece = inline_size(&fields) <= capacity;
    if !single_piece && !flags.overflow {
        return Err(StoreError::NoSpace.into());
    }

    let (head_fields, tail_pieces) = if single_piece {
        (fields, Vec::new())
    } else {
        materialize_long_columns(containers, ctx, cid, &mut fields, capacity)?;
        if inline_size(&fields) <= capacity {
            (fields, Vec::new())
        } else {
            split_pieces(fields, capacity, capacity)?
        }
    };

    let continuation = insert_tail_pieces(containers, ctx, cid, tail_pieces, flags.undo_with_purge)?;
    let has_long = head_fields.iter().any(|f| matches!(f, Field::Long(_)));
    let payload = RecordPayload {
        fields: head_fields,
        continuation,
    }
    .encode();

    let mut rec_flags = 0u16;
    if continuation.is_some() {
        rec_flags |= REC_HAS_CONTINUATION;
    }
    if has_long {
        rec_flags |= REC_HAS_LONG_COLUMNS;
    }

    let reserve = (opts.min_record_size as usize).saturating_sub(payload.len());
    let mut page = choose_target_page(containers, ctx, cid, payload.len() + reserve, opts.spare_space)?;
    let slot = page.count();
    page.insert(ctx, slot, &payload, rec_flags, reserve, flags.undo_with_purge)?
        .ok_or_else(|| anyhow!("target page rejected an insert it was chosen for"))
}

/// Everything a row occupies beyond its head piece. Long-column chains
/// live on dedicated overflow pages and may be freed wholesale once the
/// row stops referencing them; row pieces are ordinary records on shared
/// data pages and must be purged record by record.
#[derive(Default)]
pub(crate) struct Satellites {
    pub(crate) long_pages: Vec<PageId>,
    pub(crate) pieces: Vec<(PageId, RecordId)>,
}

/// Reads one column value, following a long-column chain if needed.
fn resolve_field(
    containers: &Containers,
    cid: ContainerId,
    field: Field,
    satellites: Option<&mut Satellites>,
) -> anyhow::Result<Vec<u8>> {
    match field {
        Field::Inline(bytes) => Ok(bytes),
        Field::Long(mut pgid) => {
            let pager = containers.pager();
            let mut bytes = Vec::new();
            let mut pages = Vec::new();
            loop {
                let page = pager
                    .read(cid, pgid)?
                    .into_overflow()
                    .ok_or_else(|| anyhow!("long column chain reached a non-overflow page"))?;
                bytes.extend_from_slice(page.content());
                pages.push(pgid);
                match page.next() {
                    Some(next) => pgid = next,
                    None => break,
                }
            }
            if let Some(satellites) = satellites {
                satellites.long_pages.extend(pages);
            }
            Ok(bytes)
        }
    }
}

/// Fetches a row by handle. `Ok(None)` means delete-marked; a handle that
/// resolves to nothing (sentinel, purged record, freed page) is an error.
pub(crate) fn fetch_row(
    containers: &Containers,
    cid: ContainerId,
    handle: RecordHandle,
) -> anyhow::Result<Option<Row>> {
    match fetch_row_pieces(containers, cid, handle, None)? {
        Some((row, _)) => Ok(Some(row)),
        None => Ok(None),
    }
}

/// As `fetch_row`, also reporting every satellite page (row-piece pages and
/// long-column chains) when `collect` asks for them.
fn fetch_row_pieces(
    containers: &Containers,
    cid: ContainerId,
    handle: RecordHandle,
    mut collect: Option<&mut Satellites>,
) -> anyhow::Result<Option<(Row, u16)>> {
    let Some((mut pgid, mut rid)) = handle.resolve() else {
        return Err(StoreError::RecordNotFound.into());
    };
    let pager = containers.pager();

    let mut columns = Vec::new();
    let mut head_flags = None;

    loop {
        let page = pager
            .read(cid, pgid)?
            .into_data()
            .ok_or(StoreError::RecordNotFound)?;
        let slot = page.find_record(rid).ok_or(StoreError::RecordNotFound)?;
        let entry = page.slot(slot)?;
        if head_flags.is_none() {
            if entry.is_deleted() {
                return Ok(None);
            }
            head_flags = Some(entry.flags);
        }

        let payload = RecordPayload::decode(page.payload(slot)?)?;
        drop(page);

        for field in payload.fields {
            let satellites = collect.as_mut().map(|v| &mut **v);
            columns.push(resolve_field(containers, cid, field, satellites)?);
        }

        match payload.continuation {
            Some((next_pgid, next_rid)) => {
                if let Some(ref mut satellites) = collect {
                    satellites.pieces.push((next_pgid, next_rid));
                }
                pgid = next_pgid;
                rid = next_rid;
            }
            None => break,
        }
    }

    Ok(Some((Row::new(columns), head_flags.unwrap_or(0))))
}

/// Updates a row in place: the head piece keeps its handle. The old
/// version's row pieces are purged here (they share pages with other
/// records); its long-column pages are returned so the transaction can
/// queue whole-page reclamation for after commit.
pub(crate) fn update_row(
    containers: &Containers,
    ctx: LogContext<'_>,
    cid: ContainerId,
    handle: RecordHandle,
    new_row: &Row,
    column_mask: Option<&[bool]>,
) -> anyhow::Result<Vec<PageId>> {
    let Some((pgid, rid)) = handle.resolve() else {
        return Err(StoreError::RecordNotFound.into());
    };

    let mut old_satellites = Satellites::default();
    let Some((old_row, _)) = fetch_row_pieces(containers, cid, handle, Some(&mut old_satellites))?
    else {
        return Err(StoreError::RecordNotFound.into());
    };

    // Merge for a sparse update; replace wholesale otherwise.
    let merged: Vec<Vec<u8>> = match column_mask {
        Some(mask) => {
            let mut columns = old_row.columns.clone();
            for (i, selected) in mask.iter().enumerate() {
                if *selected {
                    let value = new_row
                        .columns
                        .get(i)
                        .ok_or_else(|| anyhow!("sparse update misses column {i}"))?;
                    if i >= columns.len() {
                        return Err(anyhow!("sparse update targets column {i} beyond the row"));
                    }
                    columns[i] = value.clone();
                }
            }
            columns
        }
        None => new_row.columns.clone(),
    };

    let page_size = containers.pager().page_size();
    let capacity = data_page_capacity(page_size);
    let mut fields: Vec<Field> = merged.iter().map(|c| Field::Inline(c.clone())).collect();

    // The head piece must fit where the record already lives.
    let head_available = {
        let page = containers.pager().write(cid, pgid)?;
        let data = page.into_data().ok_or(StoreError::RecordNotFound)?;
        let slot = data.find_record(rid).ok_or(StoreError::RecordNotFound)?;
        let entry = data.slot(slot)?;
        entry.len + entry.reserved + data.free_space()
    };
    let head_budget = head_available.min(capacity);

    let (head_fields, tail_pieces) = if inline_size(&fields) <= head_budget {
        (fields, Vec::new())
    } else {
        materialize_long_columns(containers, ctx, cid, &mut fields, head_budget)?;
        if inline_size(&fields) <= head_budget {
            (fields, Vec::new())
        } else {
            split_pieces(fields, head_budget, capacity)?
        }
    };

    let continuation =
        insert_tail_pieces(containers, ctx, cid, tail_pieces, false)?;
    let has_long = head_fields.iter().any(|f| matches!(f, Field::Long(_)));
    let payload = RecordPayload {
        fields: head_fields,
        continuation,
    }
    .encode();

    let mut rec_flags = 0u16;
    if continuation.is_some() {
        rec_flags |= REC_HAS_CONTINUATION;
    }
    if has_long {
        rec_flags |= REC_HAS_LONG_COLUMNS;
    }

    let page = containers.pager().write(cid, pgid)?;
    let mut data = page.into_data().ok_or(StoreError::RecordNotFound)?;
    let slot = data.find_record(rid).ok_or(StoreError::RecordNotFound)?;
    data.update(ctx, slot, &payload, rec_flags)?;
    drop(data);

    // The old row pieces are dead records on shared pages: purge them now
    // (undoably) rather than freeing pages other rows may be using.
    let reuse = containers.reuse_record_ids(cid);
    for (piece_pgid, piece_rid) in old_satellites.pieces {
        let page = containers.pager().write(cid, piece_pgid)?;
        let Some(mut piece_page) = page.into_data() else {
            continue;
        };
        if let Some(slot) = piece_page.find_record(piece_rid) {
            piece_page.purge(ctx, slot, 1, true, reuse)?;
        }
    }

    Ok(old_satellites.long_pages)
}

/// Delete-marks (or unmarks) a row's head piece.
pub(crate) fn delete_row(
    containers: &Containers,
    ctx: LogContext<'_>,
    cid: ContainerId,
    handle: RecordHandle,
    delete: bool,
) -> anyhow::Result<()> {
    let Some((pgid, rid)) = handle.resolve() else {
        return Err(StoreError::RecordNotFound.into());
    };
    let page = containers.pager().write(cid, pgid)?;
    let mut data = page.into_data().ok_or(StoreError::RecordNotFound)?;
    let slot = data.find_record(rid).ok_or(StoreError::RecordNotFound)?;
    data.set_deleted(ctx, slot, delete)
}

/// Moves `count` records from one page of a container to another, purging
/// the source. All-or-nothing: every precondition is checked before the
/// first byte moves.
pub(crate) fn copy_and_purge(
    containers: &Containers,
    ctx: LogContext<'_>,
    cid: ContainerId,
    src_pgid: PageId,
    dest_pgid: PageId,
    src_start: usize,
    count: usize,
    dest_slot: usize,
) -> anyhow::Result<()> {
    if count == 0 {
        return Err(StoreError::SlotOutOfRange {
            slot: src_start,
            count: 0,
        }
        .into());
    }
    if src_pgid == dest_pgid {
        return Err(anyhow!("copy_and_purge onto the same page"));
    }
    let pager = containers.pager();
    let reuse = containers.reuse_record_ids(cid);

    let src_page = pager.write(cid, src_pgid)?;
    let mut src = src_page.into_data().ok_or(StoreError::RecordNotFound)?;
    let dest_page = pager.write(cid, dest_pgid)?;
    let mut dest = dest_page.into_data().ok_or(StoreError::RecordNotFound)?;

    if src_start + count > src.count() {
        return Err(StoreError::SlotOutOfRange {
            slot: src_start + count,
            count: src.count(),
        }
        .into());
    }
    if dest_slot > dest.count() {
        return Err(StoreError::SlotOutOfRange {
            slot: dest_slot,
            count: dest.count(),
        }
        .into());
    }

    // Destination record ids must stay representable; detected up front so
    // the operation fails whole instead of copying a prefix of the rows.
    if dest
        .next_record_id()
        .checked_add(count as u32)
        .is_none()
    {
        return Err(StoreError::RecordIdOverflow.into());
    }

    let mut total = 0usize;
    for i in src_start..src_start + count {
        total += src.payload(i)?.len() + SLOT_ENTRY_SIZE;
    }
    if dest.free_space() < total {
        return Err(StoreError::NoSpace.into());
    }

    for i in 0..count {
        let entry = src.slot(src_start + i)?;
        let payload = src.payload(src_start + i)?.to_vec();
        dest.insert(ctx, dest_slot + i, &payload, entry.flags, 0, false)?
            .ok_or_else(|| anyhow!("destination page rejected a checked copy"))?;
    }
    src.purge(ctx, src_start, count, true, reuse)?;
    Ok(())
}
