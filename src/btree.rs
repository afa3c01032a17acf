use crate::container::{ContainerOptions, Containers};
use crate::datum::{compare_rows, Datum, SortOrder};
use crate::error::StoreError;
use crate::heap::data_page_capacity;
use crate::id::{ContainerId, PageId, PageIdExt};
use crate::lock::{LockMode, Lockable};
use crate::page::{DataPageRead, DataPageWrite};
use crate::record::RecordPayload;
use crate::tx::Tx;
use anyhow::anyhow;
use std::cmp::Ordering;

/// A secondary index: a B-tree over `directions.len()` user columns plus a
/// trailing row-location column. The row location participates in the sort
/// order (ascending) and, for non-unique indexes, in the duplicate check;
/// unique indexes check duplicates over the user columns alone.
#[derive(Clone, Debug)]
pub struct IndexDef {
    pub container: ContainerId,
    pub root: PageId,
    pub unique: bool,
    pub directions: Vec<SortOrder>,
}

impl IndexDef {
    /// Columns in an index row, row location included.
    fn key_columns(&self) -> usize {
        self.directions.len() + 1
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BtreeInsert {
    Inserted,
    Duplicate,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ScanOp {
    Ge,
    Gt,
    Le,
    Lt,
}

/// Locking flavor for `fetch_max`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FetchLock {
    TableShared,
    RowSerializable,
    RowReadCommitted,
}

/// Every tree page keeps a control record in slot 0; index rows occupy the
/// slots after it, in key order.
#[derive(Copy, Clone, Debug)]
struct Control {
    leaf: bool,
    left: Option<PageId>,
    right: Option<PageId>,
    /// Branch pages only: the child for keys below the first separator.
    leftmost: Option<PageId>,
}

fn encode_control(control: &Control) -> Vec<u8> {
    let columns = vec![
        vec![control.leaf as u8],
        control.left.to_be_bytes().to_vec(),
        control.right.to_be_bytes().to_vec(),
        control.leftmost.to_be_bytes().to_vec(),
    ];
    RecordPayload::inline(&columns).encode()
}

fn decode_control(payload: &[u8]) -> anyhow::Result<Control> {
    let decoded = RecordPayload::decode(payload)?;
    let columns: Vec<&Vec<u8>> = decoded
        .fields
        .iter()
        .map(|f| match f {
            crate::record::Field::Inline(bytes) => Ok(bytes),
            _ => Err(anyhow!("tree control record has an overflow column")),
        })
        .collect::<anyhow::Result<_>>()?;
    if columns.len() != 4 || columns[0].len() != 1 {
        return Err(anyhow!("malformed tree control record"));
    }
    Ok(Control {
        leaf: columns[0][0] != 0,
        left: PageId::from_be_bytes(columns[1][..].try_into()?),
        right: PageId::from_be_bytes(columns[2][..].try_into()?),
        leftmost: PageId::from_be_bytes(columns[3][..].try_into()?),
    })
}

fn encode_leaf_row(row: &[Datum]) -> Vec<u8> {
    let columns: Vec<Vec<u8>> = row.iter().map(Datum::encode_column).collect();
    RecordPayload::inline(&columns).encode()
}

fn encode_branch_row(key: &[Datum], child: PageId) -> Vec<u8> {
    let mut columns: Vec<Vec<u8>> = key.iter().map(Datum::encode_column).collect();
    columns.push(child.to_be_bytes().to_vec());
    RecordPayload::inline(&columns).encode()
}

fn decode_columns(payload: &[u8]) -> anyhow::Result<Vec<Vec<u8>>> {
    let decoded = RecordPayload::decode(payload)?;
    decoded
        .fields
        .into_iter()
        .map(|f| match f {
            crate::record::Field::Inline(bytes) => Ok(bytes),
            _ => Err(anyhow!("index row has an overflow column")),
        })
        .collect()
}

fn decode_leaf_row(payload: &[u8]) -> anyhow::Result<Vec<Datum>> {
    decode_columns(payload)?
        .iter()
        .map(|c| Datum::decode_column(c))
        .collect()
}

fn decode_branch_row(payload: &[u8]) -> anyhow::Result<(Vec<Datum>, PageId)> {
    let columns = decode_columns(payload)?;
    if columns.len() < 2 {
        return Err(anyhow!("branch row without a child pointer"));
    }
    let (child_col, key_cols) = columns.split_last().unwrap();
    let child = PageId::from_be_bytes(child_col[..].try_into()?)
        .ok_or_else(|| anyhow!("zero child pointer in branch row"))?;
    let key = key_cols
        .iter()
        .map(|c| Datum::decode_column(c))
        .collect::<anyhow::Result<Vec<Datum>>>()?;
    Ok((key, child))
}

pub struct BTree<'t, 'a> {
    tx: &'t Tx<'a>,
    def: IndexDef,
}

impl<'t, 'a> BTree<'t, 'a> {
    /// Creates the index container with its empty root leaf.
    pub fn create(
        tx: &Tx<'_>,
        unique: bool,
        directions: Vec<SortOrder>,
    ) -> anyhow::Result<IndexDef> {
        tx.ensure_began()?;
        let containers = &tx.store().containers;
        let cid = containers.create(
            tx.ctx(),
            ContainerOptions {
                spare_space: 0,
                min_record_size: 1,
                reuse_record_ids: false,
            },
            false,
        )?;

        let mut root = containers.alloc_data_page(tx.ctx(), cid)?;
        let control = encode_control(&Control {
            leaf: true,
            left: None,
            right: None,
            leftmost: None,
        });
        root.insert(tx.ctx(), 0, &control, 0, 0, false)?
            .ok_or_else(|| anyhow!("fresh root page rejected its control record"))?;
        let root_id = root.id();
        drop(root);

        Ok(IndexDef {
            container: cid,
            root: root_id,
            unique,
            directions,
        })
    }

    pub fn open(tx: &'t Tx<'a>, def: &IndexDef) -> Self {
        Self {
            tx,
            def: def.clone(),
        }
    }

    fn containers(&self) -> &'a Containers {
        &self.tx.store().containers
    }

    /// Index entries must leave room for a split to rebalance; anything
    /// larger belongs in the base table with only a reference indexed.
    fn max_entry(&self) -> usize {
        data_page_capacity(self.tx.store().pager.page_size()) / 4
    }

    fn compare(&self, a: &[Datum], b: &[Datum]) -> Ordering {
        // The trailing row location compares ascending (beyond directions).
        compare_rows(a, b, &self.def.directions, self.def.key_columns())
    }

    fn compare_prefix(&self, row: &[Datum], key: &[Datum]) -> Ordering {
        compare_rows(row, key, &self.def.directions, key.len())
    }

    fn row_lock_target(&self, row: &[Datum]) -> anyhow::Result<Lockable> {
        match row.last() {
            Some(Datum::RowLoc(pgid, rid)) => {
                Ok(Lockable::Row(self.def.container, *pgid, rid.get()))
            }
            _ => Err(anyhow!("index row does not end with a row location")),
        }
    }

    /// Should the descent go right of this separator? A full key equal to
    /// the separator lives in the right subtree; a partial key equal on
    /// its prefix may still have matches left of the separator, so the
    /// descent stays left and the leaf sibling chain covers the rest.
    fn descends_right(&self, sep: &[Datum], key: &[Datum]) -> bool {
        match self.compare_prefix(sep, key) {
            Ordering::Less => true,
            Ordering::Equal => key.len() >= self.def.key_columns(),
            Ordering::Greater => false,
        }
    }

    /// Picks the child to descend into for `key`; `None` descends leftmost,
    /// `rightmost` overrides to the high edge.
    fn pick_child(
        &self,
        page: &DataPageRead<'_>,
        key: Option<&[Datum]>,
        rightmost: bool,
    ) -> anyhow::Result<PageId> {
        let control = decode_control(page.payload(0)?)?;
        let mut child = control
            .leftmost
            .ok_or_else(|| anyhow!("branch page without a leftmost child"))?;
        for slot in 1..page.count() {
            let (sep, sep_child) = decode_branch_row(page.payload(slot)?)?;
            match (rightmost, key) {
                (true, _) => child = sep_child,
                (false, Some(key)) => {
                    if self.descends_right(&sep, key) {
                        child = sep_child;
                    } else {
                        break;
                    }
                }
                (false, None) => break,
            }
        }
        Ok(child)
    }

    fn descend_read(
        &self,
        key: Option<&[Datum]>,
        rightmost: bool,
    ) -> anyhow::Result<DataPageRead<'a>> {
        let pager = &self.tx.store().pager;
        let mut pgid = self.def.root;
        loop {
            let page = pager
                .read(self.def.container, pgid)?
                .into_data()
                .ok_or_else(|| anyhow!("index page {pgid:?} is not a data page"))?;
            let control = decode_control(page.payload(0)?)?;
            if control.leaf {
                return Ok(page);
            }
            pgid = self.pick_child(&page, key, rightmost)?;
        }
    }

    /// Write descent; keeps ancestor latches only while the child might
    /// split, mirroring the read path otherwise.
    fn descend_write(
        &self,
        key: &[Datum],
        entry_size: usize,
    ) -> anyhow::Result<(Vec<DataPageWrite<'a>>, DataPageWrite<'a>)> {
        let pager = &self.tx.store().pager;
        let mut hops: Vec<DataPageWrite<'a>> = Vec::new();
        let mut current = pager
            .write(self.def.container, self.def.root)?
            .into_data()
            .ok_or_else(|| anyhow!("index root is not a data page"))?;

        loop {
            let control = decode_control(current.payload(0)?)?;
            if control.leaf {
                return Ok((hops, current));
            }

            let mut child = control
                .leftmost
                .ok_or_else(|| anyhow!("branch page without a leftmost child"))?;
            for slot in 1..current.count() {
                let (sep, sep_child) = decode_branch_row(current.payload(slot)?)?;
                if self.descends_right(&sep, key) {
                    child = sep_child;
                } else {
                    break;
                }
            }

            let next = pager
                .write(self.def.container, child)?
                .into_data()
                .ok_or_else(|| anyhow!("index page {child:?} is not a data page"))?;
            // A child with room for one more entry cannot push a split up;
            // the ancestors can go.
            if next.space_for_insert(entry_size + 16, 0) {
                hops.clear();
            }
            hops.push(current);
            current = next;
        }
    }

    /// Inserts an index row (user columns + row location). A duplicate
    /// leaves the tree untouched.
    pub fn insert(&self, row: &[Datum]) -> anyhow::Result<BtreeInsert> {
        if row.len() != self.def.key_columns() {
            return Err(anyhow!(
                "index row has {} columns, expected {}",
                row.len(),
                self.def.key_columns()
            ));
        }
        self.tx.ensure_began()?;
        self.tx
            .lock(self.row_lock_target(row)?, LockMode::Exclusive)?;

        let payload = encode_leaf_row(row);
        if payload.len() > self.max_entry() {
            return Err(anyhow!("index entry of {} bytes is too large", payload.len()));
        }

        let (mut hops, mut leaf) = self.descend_write(row, payload.len())?;

        let mut slot = leaf.count();
        for s in 1..leaf.count() {
            let existing = decode_leaf_row(leaf.payload(s)?)?;
            let deleted = leaf.slot(s)?.is_deleted();
            if self.def.unique
                && !deleted
                && self.compare_prefix(&existing, &row[..self.def.directions.len()])
                    == Ordering::Equal
            {
                return Ok(BtreeInsert::Duplicate);
            }
            match self.compare(&existing, row) {
                Ordering::Less => continue,
                Ordering::Equal if !deleted => return Ok(BtreeInsert::Duplicate),
                _ => {
                    slot = s;
                    break;
                }
            }
        }

        self.insert_with_split(&mut leaf, &mut hops, slot, &payload)?;
        Ok(BtreeInsert::Inserted)
    }

    /// Inserts at `slot`, splitting this page (and as many ancestors as
    /// needed) when it is full. Every step is an ordinary logged page
    /// operation, so an abort anywhere mid-split compensates cleanly.
    fn insert_with_split(
        &self,
        page: &mut DataPageWrite<'a>,
        hops: &mut Vec<DataPageWrite<'a>>,
        slot: usize,
        payload: &[u8],
    ) -> anyhow::Result<()> {
        let ctx = self.tx.ctx();
        if page.space_for_insert(payload.len(), 0) {
            page.insert(ctx, slot, payload, 0, 0, false)?
                .ok_or_else(|| anyhow!("page rejected an insert it had space for"))?;
            return Ok(());
        }

        let containers = self.containers();
        let pager = &self.tx.store().pager;
        let control = decode_control(page.payload(0)?)?;
        let count = page.count();
        if count < 3 {
            // Fewer than two rows and still no room: the entry cannot be
            // balanced across a split.
            return Err(StoreError::NoSpace.into());
        }
        let mid = 1 + (count - 1) / 2;

        let moved: Vec<(Vec<u8>, u16)> = (mid..count)
            .map(|s| Ok((page.payload(s)?.to_vec(), page.slot(s)?.flags)))
            .collect::<anyhow::Result<_>>()?;
        let pivot_key = if control.leaf {
            let row = decode_leaf_row(&moved[0].0)?;
            row[..self.def.key_columns()].to_vec()
        } else {
            decode_branch_row(&moved[0].0)?.0
        };
        let right_leftmost = if control.leaf {
            None
        } else {
            Some(decode_branch_row(&moved[0].0)?.1)
        };

        let mut right = containers.alloc_data_page(ctx, self.def.container)?;
        let right_id = right.id();
        let right_control = encode_control(&Control {
            leaf: control.leaf,
            left: Some(page.id()),
            right: control.right,
            leftmost: right_leftmost,
        });
        right
            .insert(ctx, 0, &right_control, 0, 0, false)?
            .ok_or_else(|| anyhow!("fresh split page rejected its control record"))?;
        for (i, (bytes, flags)) in moved.iter().enumerate() {
            right
                .insert(ctx, 1 + i, bytes, *flags, 0, false)?
                .ok_or_else(|| anyhow!("split right page rejected a moved row"))?;
        }
        page.purge(ctx, mid, count - mid, true, false)?;

        // Stitch the sibling chain around the new page.
        let new_left_control = encode_control(&Control {
            right: Some(right_id),
            ..control
        });
        page.update(ctx, 0, &new_left_control, 0)?;
        if let Some(old_right) = control.right {
            let far = pager.write(self.def.container, old_right)?;
            let mut far = far
                .into_data()
                .ok_or_else(|| anyhow!("index page {old_right:?} is not a data page"))?;
            let far_control = decode_control(far.payload(0)?)?;
            let far_control = encode_control(&Control {
                left: Some(right_id),
                ..far_control
            });
            far.update(ctx, 0, &far_control, 0)?;
        }

        // Land the new entry on whichever side now owns its slot.
        if slot < mid {
            page.insert(ctx, slot, payload, 0, 0, false)?
                .ok_or(StoreError::NoSpace)?;
        } else {
            right
                .insert(ctx, slot - mid + 1, payload, 0, 0, false)?
                .ok_or(StoreError::NoSpace)?;
        }
        drop(right);

        let branch_payload = encode_branch_row(&pivot_key, right_id);

        if page.id() == self.def.root {
            // The root's id never changes: its remaining rows move into a
            // fresh left child and the root becomes a branch over the two
            // halves.
            let left_control = encode_control(&Control {
                leaf: control.leaf,
                left: None,
                right: Some(right_id),
                leftmost: control.leftmost,
            });
            let mut left = containers.alloc_data_page(ctx, self.def.container)?;
            let left_id = left.id();
            left.insert(ctx, 0, &left_control, 0, 0, false)?
                .ok_or_else(|| anyhow!("fresh root child rejected its control record"))?;
            let keep = page.count();
            for s in 1..keep {
                let bytes = page.payload(s)?.to_vec();
                let flags = page.slot(s)?.flags;
                left.insert(ctx, s, &bytes, flags, 0, false)?
                    .ok_or_else(|| anyhow!("fresh root child rejected a moved row"))?;
            }
            drop(left);
            if keep > 1 {
                page.purge(ctx, 1, keep - 1, true, false)?;
            }

            let far = pager.write(self.def.container, right_id)?;
            let mut far = far
                .into_data()
                .ok_or_else(|| anyhow!("split page vanished during root split"))?;
            let far_control = decode_control(far.payload(0)?)?;
            let far_control = encode_control(&Control {
                left: Some(left_id),
                ..far_control
            });
            far.update(ctx, 0, &far_control, 0)?;
            drop(far);

            let root_control = encode_control(&Control {
                leaf: false,
                left: None,
                right: None,
                leftmost: Some(left_id),
            });
            page.update(ctx, 0, &root_control, 0)?;
            page.insert(ctx, 1, &branch_payload, 0, 0, false)?
                .ok_or(StoreError::NoSpace)?;
            return Ok(());
        }

        let mut parent = hops
            .pop()
            .ok_or_else(|| anyhow!("split propagated past the retained ancestors"))?;
        let mut pslot = parent.count();
        for s in 1..parent.count() {
            let (sep, _) = decode_branch_row(parent.payload(s)?)?;
            if self.compare(&sep, &pivot_key) == Ordering::Greater {
                pslot = s;
                break;
            }
        }
        self.insert_with_split(&mut parent, hops, pslot, &branch_payload)
    }

    /// Delete-marks the exact entry (user columns + row location). Returns
    /// whether a live entry was found.
    pub fn delete(&self, row: &[Datum]) -> anyhow::Result<bool> {
        self.tx.ensure_began()?;
        self.tx
            .lock(self.row_lock_target(row)?, LockMode::Exclusive)?;

        let (_, mut leaf) = self.descend_write(row, 0)?;
        for s in 1..leaf.count() {
            let existing = decode_leaf_row(leaf.payload(s)?)?;
            match self.compare(&existing, row) {
                Ordering::Less => continue,
                Ordering::Equal => {
                    if leaf.slot(s)?.is_deleted() {
                        return Ok(false);
                    }
                    leaf.set_deleted(self.tx.ctx(), s, true)?;
                    return Ok(true);
                }
                Ordering::Greater => break,
            }
        }
        Ok(false)
    }

    /// Opens a range scan. Bounds compare over their own column prefix, so
    /// partial keys work; `update_locks` makes the scan take update locks,
    /// for scans that will delete what they visit.
    pub fn scan(
        &'t self,
        start: Option<(Vec<Datum>, ScanOp)>,
        stop: Option<(Vec<Datum>, ScanOp)>,
        update_locks: bool,
    ) -> BTreeScan<'t, 'a> {
        BTreeScan {
            btree: self,
            start,
            stop,
            update_locks,
            pos: None,
            started: false,
            done: false,
        }
    }

    /// The extreme entry of the index under its composed column order.
    pub fn fetch_max(&self, locking: FetchLock) -> anyhow::Result<Option<Vec<Datum>>> {
        self.tx.ensure_began()?;
        if locking == FetchLock::TableShared {
            self.tx
                .lock(Lockable::Container(self.def.container), LockMode::Shared)?;
        }

        let pager = &self.tx.store().pager;
        'retry: loop {
            let mut page = self.descend_read(None, true)?;
            loop {
                for s in (1..page.count()).rev() {
                    if page.slot(s)?.is_deleted() {
                        continue;
                    }
                    let row = decode_leaf_row(page.payload(s)?)?;
                    if locking == FetchLock::TableShared {
                        return Ok(Some(row));
                    }

                    // Row locking: never block while holding the latch.
                    let generation = page.generation();
                    let pgid = page.id();
                    drop(page);
                    let target = self.row_lock_target(&row)?;
                    self.tx.lock(target, LockMode::Shared)?;

                    let check = pager
                        .read(self.def.container, pgid)?
                        .into_data()
                        .ok_or_else(|| anyhow!("index page {pgid:?} disappeared"))?;
                    if check.generation() != generation {
                        // The tree moved underneath us; look again.
                        if locking == FetchLock::RowReadCommitted {
                            self.tx.unlock_early(target);
                        }
                        continue 'retry;
                    }
                    if locking == FetchLock::RowReadCommitted {
                        self.tx.unlock_early(target);
                    }
                    return Ok(Some(row));
                }

                let control = decode_control(page.payload(0)?)?;
                match control.left {
                    Some(left) => {
                        page = pager
                            .read(self.def.container, left)?
                            .into_data()
                            .ok_or_else(|| anyhow!("index page {left:?} is not a data page"))?;
                    }
                    None => return Ok(None),
                }
            }
        }
    }
}

struct ScanPos {
    pgid: PageId,
    slot: usize,
    key: Vec<Datum>,
    generation: u64,
}

/// A forward range scan in the index's composed order. The cursor holds no
/// latch between calls; it revalidates its position by page generation and
/// repositions by key when the page changed shape underneath it.
pub struct BTreeScan<'t, 'a> {
    btree: &'t BTree<'t, 'a>,
    start: Option<(Vec<Datum>, ScanOp)>,
    stop: Option<(Vec<Datum>, ScanOp)>,
    update_locks: bool,
    pos: Option<ScanPos>,
    started: bool,
    done: bool,
}

impl<'t, 'a> BTreeScan<'t, 'a> {
    fn qualifies(&self, row: &[Datum]) -> bool {
        match &self.stop {
            None => true,
            Some((key, ScanOp::Le)) => {
                self.btree.compare_prefix(row, key) != Ordering::Greater
            }
            Some((key, ScanOp::Lt)) => self.btree.compare_prefix(row, key) == Ordering::Less,
            Some((_, op)) => unreachable!("{op:?} is not a stop bound"),
        }
    }

    fn past_start(&self, row: &[Datum]) -> bool {
        match &self.start {
            None => true,
            Some((key, ScanOp::Ge)) => {
                self.btree.compare_prefix(row, key) != Ordering::Less
            }
            Some((key, ScanOp::Gt)) => self.btree.compare_prefix(row, key) == Ordering::Greater,
            Some((_, op)) => unreachable!("{op:?} is not a start bound"),
        }
    }

    /// First candidate position of the scan.
    fn position_start(&self) -> anyhow::Result<(DataPageRead<'a>, usize)> {
        let key = self.start.as_ref().map(|(k, _)| k.as_slice());
        let page = self.btree.descend_read(key, false)?;
        Ok((page, 1))
    }

    /// Re-finds the first entry strictly after `key`, for positions
    /// invalidated by a concurrent split.
    fn reposition(&self, key: &[Datum]) -> anyhow::Result<(DataPageRead<'a>, usize)> {
        let page = self.btree.descend_read(Some(key), false)?;
        Ok((page, 1))
    }

    /// Next qualifying row, in index order. Entries already returned are
    /// never revisited even when pages split mid-scan, because the cursor
    /// repositions by its last returned key.
    pub fn next(&mut self) -> anyhow::Result<Option<Vec<Datum>>> {
        if self.done {
            return Ok(None);
        }
        self.btree.tx.ensure_began()?;
        let pager = &self.btree.tx.store().pager;
        let cid = self.btree.def.container;

        let (mut page, mut slot) = if !self.started {
            self.started = true;
            self.position_start()?
        } else {
            let pos = self.pos.as_ref().expect("started scan keeps a position");
            let relatch = pager
                .read(cid, pos.pgid)?
                .into_data()
                .ok_or_else(|| anyhow!("scan page {:?} disappeared", pos.pgid))?;
            if relatch.generation() == pos.generation {
                let slot = pos.slot + 1;
                (relatch, slot)
            } else {
                drop(relatch);
                let key = pos.key.clone();
                self.reposition(&key)?
            }
        };

        loop {
            // Exhausted this leaf: follow the sibling chain.
            if slot >= page.count() {
                let control = decode_control(page.payload(0)?)?;
                match control.right {
                    Some(right) => {
                        page = pager
                            .read(cid, right)?
                            .into_data()
                            .ok_or_else(|| anyhow!("index page {right:?} is not a data page"))?;
                        slot = 1;
                        continue;
                    }
                    None => {
                        self.done = true;
                        return Ok(None);
                    }
                }
            }

            let row = decode_leaf_row(page.payload(slot)?)?;
            let deleted = page.slot(slot)?.is_deleted();

            // After repositioning, skip everything at or before the last
            // returned key.
            if let Some(pos) = &self.pos {
                if self.btree.compare(&row, &pos.key) != Ordering::Greater {
                    slot += 1;
                    continue;
                }
            }
            if !self.past_start(&row) {
                slot += 1;
                continue;
            }
            if !self.qualifies(&row) {
                self.done = true;
                return Ok(None);
            }
            if deleted {
                self.pos = Some(ScanPos {
                    pgid: page.id(),
                    slot,
                    key: row,
                    generation: page.generation(),
                });
                slot += 1;
                continue;
            }

            // Lock the row with the latch released, then revalidate.
            let generation = page.generation();
            let pgid = page.id();
            drop(page);

            let mode = if self.update_locks {
                LockMode::Update
            } else {
                LockMode::Shared
            };
            self.btree
                .tx
                .lock(self.btree.row_lock_target(&row)?, mode)?;

            let relatch = pager
                .read(cid, pgid)?
                .into_data()
                .ok_or_else(|| anyhow!("index page {pgid:?} disappeared"))?;
            if relatch.generation() != generation {
                // The page changed while we waited; re-find our place from
                // the last returned key (or the row we were about to
                // return, exclusive of nothing before it).
                drop(relatch);
                let anchor = self
                    .pos
                    .as_ref()
                    .map(|p| p.key.clone())
                    .unwrap_or_else(|| row.clone());
                let (repage, reslot) = self.reposition(&anchor)?;
                page = repage;
                slot = reslot;
                continue;
            }

            self.pos = Some(ScanPos {
                pgid,
                slot,
                key: row.clone(),
                generation,
            });
            return Ok(Some(row));
        }
    }

    /// Delete-marks the entry the scan currently stands on. With update
    /// locks this cannot spuriously miss the row: the position is re-found
    /// by key after any intervening latch release.
    pub fn delete(&mut self) -> anyhow::Result<bool> {
        let Some(pos) = &self.pos else {
            return Err(anyhow!("scan has no current position"));
        };
        self.btree
            .tx
            .lock(self.btree.row_lock_target(&pos.key)?, LockMode::Exclusive)?;

        let pager = &self.btree.tx.store().pager;
        let cid = self.btree.def.container;
        let page = pager
            .write(cid, pos.pgid)?
            .into_data()
            .ok_or_else(|| anyhow!("scan page {:?} disappeared", pos.pgid))?;

        let mut page = page;
        let slot = if page.generation() == pos.generation {
            Some(pos.slot)
        } else {
            // Relocate by key; the row may have moved to another page.
            drop(page);
            let key = pos.key.clone();
            let (_, leaf) = self.btree.descend_write(&key, 0)?;
            page = leaf;
            let mut found = None;
            for s in 1..page.count() {
                let existing = decode_leaf_row(page.payload(s)?)?;
                match self.btree.compare(&existing, &key) {
                    Ordering::Less => continue,
                    Ordering::Equal => {
                        found = Some(s);
                        break;
                    }
                    Ordering::Greater => break,
                }
            }
            found
        };

        let Some(slot) = slot else {
            return Ok(false);
        };
        if page.slot(slot)?.is_deleted() {
            return Ok(false);
        }
        page.set_deleted(self.btree.tx.ctx(), slot, true)?;
        if let Some(pos) = &mut self.pos {
            pos.generation = page.generation();
        }
        Ok(true)
    }

    pub fn is_current_deleted(&self) -> anyhow::Result<bool> {
        let Some(pos) = &self.pos else {
            return Err(anyhow!("scan has no current position"));
        };
        let pager = &self.btree.tx.store().pager;
        let page = pager
            .read(self.btree.def.container, pos.pgid)?
            .into_data()
            .ok_or_else(|| anyhow!("scan page {:?} disappeared", pos.pgid))?;
        if page.generation() == pos.generation {
            return Ok(page.slot(pos.slot)?.is_deleted());
        }
        drop(page);

        let leaf = self.btree.descend_read(Some(&pos.key), false)?;
        for s in 1..leaf.count() {
            let existing = decode_leaf_row(leaf.payload(s)?)?;
            match self.btree.compare(&existing, &pos.key) {
                Ordering::Less => continue,
                Ordering::Equal => return Ok(leaf.slot(s)?.is_deleted()),
                Ordering::Greater => break,
            }
        }
        // Purged entirely counts as deleted.
        Ok(true)
    }

    pub fn does_current_qualify(&self) -> anyhow::Result<bool> {
        let Some(pos) = &self.pos else {
            return Err(anyhow!("scan has no current position"));
        };
        Ok(self.qualifies(&pos.key))
    }
}

const _: () = {
    // Slot 0 of every tree page is its control record.
    assert!(crate::id::FIRST_SLOT == 0);
};
