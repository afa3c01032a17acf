use crate::container::Containers;
use crate::id::{LogInstant, RecordId, TxId};
use crate::log::{LogDecodeResult, LogOp, LogRecord, RecordBuf};
use crate::wal::{
    list_log_files, LogContext, LogFileHeader, TxChain, Wal, FIRST_LOG_OFFSET,
    LOG_FILE_HEADER_SIZE,
};
use anyhow::anyhow;
use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub(crate) struct RecoveryResult {
    pub(crate) wal: Arc<Wal>,
    pub(crate) next_txid: TxId,
}

#[derive(Debug)]
struct TxStatus {
    last: LogInstant,
    committed: bool,
}

/// Restart recovery: replay every retained log file in order (stopping
/// cleanly at a torn or corrupted tail), then roll back the transactions
/// that never committed. Redo is idempotent; undo goes through the same
/// compensation path as a live rollback.
pub(crate) fn recover(log_dir: &Path, containers: &Containers) -> anyhow::Result<RecoveryResult> {
    let files = list_log_files(log_dir)?;
    if files.is_empty() {
        let wal = Arc::new(Wal::create(log_dir)?);
        containers.pager().attach_wal(wal.clone());
        return Ok(RecoveryResult {
            wal,
            next_txid: TxId::new(1).unwrap(),
        });
    }

    log::debug!("recovery started with {} log files", files.len());

    let mut scanner = LogScanner::new(files)?;
    let mut active: HashMap<TxId, TxStatus> = HashMap::new();
    let mut max_txid = 0u64;

    while let Some((instant, buf)) = scanner.next()? {
        let rec = buf.record()?;
        if let Some(txid) = rec.txid {
            max_txid = max_txid.max(txid.get());
            match rec.op {
                LogOp::TxEnd => {
                    active.remove(&txid);
                }
                LogOp::TxCommit => {
                    let status = active.entry(txid).or_insert(TxStatus {
                        last: instant,
                        committed: false,
                    });
                    status.last = instant;
                    status.committed = true;
                }
                _ => {
                    let status = active.entry(txid).or_insert(TxStatus {
                        last: instant,
                        committed: false,
                    });
                    status.last = instant;
                }
            }
        }
        redo(containers, instant, &rec)?;
    }

    let end = scanner.end_boundary();
    log::debug!("forward scan stopped at {end:?}");

    let wal = Arc::new(Wal::open_at(log_dir, end)?);
    containers.pager().attach_wal(wal.clone());

    // Every transaction without a commit record is a loser and is undone in
    // reverse chain order; one that committed but never logged its end just
    // gets the end record now.
    for (txid, status) in active {
        if status.committed {
            log::debug!("finishing committed transaction {txid:?}");
            wal.append(&LogRecord {
                txid: Some(txid),
                prev: Some(status.last),
                undo_next: None,
                op: LogOp::TxEnd,
            })?;
            continue;
        }

        log::debug!("rolling back loser transaction {txid:?}");
        let chain = TxChain::with_last(txid, Some(status.last));
        undo_tx(containers, &wal, &chain, None)?;
        wal.append(&LogRecord {
            txid: Some(txid),
            prev: chain.last(),
            undo_next: None,
            op: LogOp::TxEnd,
        })?;
    }
    wal.flush_all()?;

    let next_txid = TxId::new(max_txid + 1).unwrap();
    log::debug!("recovery finished next_txid={next_txid:?}");
    Ok(RecoveryResult { wal, next_txid })
}

/// Forward reader over the retained log files. Stops, without error, at
/// the first frame that fails any validation: a short tail, a length
/// bracket mismatch, a checksum mismatch, or an instant that does not
/// match its position.
struct LogScanner {
    files: Vec<(u32, PathBuf)>,
    file_index: usize,
    f: Option<File>,
    instant: LogInstant,
    buffer: Vec<u8>,
    start: usize,
    end: usize,
    stopped: bool,
}

impl LogScanner {
    fn new(files: Vec<(u32, PathBuf)>) -> anyhow::Result<Self> {
        assert!(!files.is_empty());
        let first = files[0].0;
        Ok(Self {
            files,
            file_index: 0,
            f: None,
            instant: LogInstant::new(first, FIRST_LOG_OFFSET),
            buffer: vec![0u8; 1 << 16],
            start: 0,
            end: 0,
            stopped: false,
        })
    }

    /// Where the valid log ends; the WAL reopens (and truncates) here.
    fn end_boundary(&self) -> LogInstant {
        self.instant
    }

    fn open_current_file(&mut self) -> anyhow::Result<bool> {
        let (number, path) = &self.files[self.file_index];
        let mut f = File::open(path)?;
        let mut header = vec![0u8; LOG_FILE_HEADER_SIZE];
        if f.read_exact(&mut header).is_err() {
            return Ok(false);
        }
        let Some(header) = LogFileHeader::decode(&header) else {
            log::error!("log file {number} has a corrupt header, stopping scan");
            return Ok(false);
        };
        if header.version != 0 || header.file_number != *number {
            log::error!("log file {number} header does not match, stopping scan");
            return Ok(false);
        }
        self.f = Some(f);
        Ok(true)
    }

    fn next(&mut self) -> anyhow::Result<Option<(LogInstant, RecordBuf)>> {
        if self.stopped {
            return Ok(None);
        }

        loop {
            if self.f.is_none() {
                if !self.open_current_file()? {
                    self.stopped = true;
                    return Ok(None);
                }
            }

            let avail = &self.buffer[self.start..self.end];
            match LogRecord::decode_frame(avail, self.instant) {
                LogDecodeResult::Ok { size, .. } => {
                    let instant = self.instant;
                    let buf = RecordBuf {
                        instant,
                        buff: avail[..size].to_vec(),
                    };
                    self.start += size;
                    self.instant =
                        LogInstant::new(instant.file_number(), instant.offset() + size as u32);
                    return Ok(Some((instant, buf)));
                }
                LogDecodeResult::NeedMoreBytes => {
                    let len = self.end - self.start;
                    self.buffer.copy_within(self.start..self.end, 0);
                    self.start = 0;
                    self.end = len;
                    if self.end == self.buffer.len() {
                        self.buffer.resize(self.buffer.len() * 2, 0);
                    }

                    let n = self.f.as_mut().unwrap().read(&mut self.buffer[self.end..])?;
                    if n > 0 {
                        self.end += n;
                        continue;
                    }

                    if len != 0 {
                        // Partial frame at end of file: torn write.
                        log::warn!(
                            "torn log record at {:?}, recovering up to it",
                            self.instant
                        );
                        self.stopped = true;
                        return Ok(None);
                    }

                    // Clean end of this file; continue into the next one if
                    // it is the direct successor and its header is sound.
                    // The boundary only advances once the next file is
                    // validated, so a bad successor truncates here.
                    let current = self.files[self.file_index].0;
                    if self.file_index + 1 < self.files.len()
                        && self.files[self.file_index + 1].0 == current + 1
                    {
                        self.file_index += 1;
                        self.f = None;
                        if !self.open_current_file()? {
                            self.stopped = true;
                            return Ok(None);
                        }
                        self.instant = LogInstant::new(current + 1, FIRST_LOG_OFFSET);
                        continue;
                    }
                    self.stopped = true;
                    return Ok(None);
                }
                LogDecodeResult::Incomplete => {
                    log::warn!(
                        "malformed log record at {:?}, recovering up to it",
                        self.instant
                    );
                    self.stopped = true;
                    return Ok(None);
                }
                LogDecodeResult::Err(err) => {
                    log::error!(
                        "unreadable log record at {:?} ({err}), recovering up to it",
                        self.instant
                    );
                    self.stopped = true;
                    return Ok(None);
                }
            }
        }
    }
}

/// Applies one record's redo action. Page-level ops check the page's
/// instant so replaying an already-flushed change is a no-op.
fn redo(containers: &Containers, instant: LogInstant, rec: &LogRecord) -> anyhow::Result<()> {
    let pager = containers.pager();
    match &rec.op {
        LogOp::TxBegin
        | LogOp::TxCommit
        | LogOp::TxAbort
        | LogOp::TxEnd
        | LogOp::Savepoint { .. } => Ok(()),

        LogOp::ContainerCreate {
            cid,
            spare_space,
            min_record_size,
            reuse_record_ids,
        } => containers.redo_create(instant, *cid, *spare_space, *min_record_size, *reuse_record_ids),
        LogOp::ContainerDrop { cid } => containers.redo_set_dropped(instant, *cid, true),
        LogOp::ContainerUndoDrop { cid } => containers.redo_set_dropped(instant, *cid, false),
        LogOp::ContainerPurge { cid } => {
            containers.purge_container(LogContext::Redo(instant), *cid)
        }

        LogOp::PageAlloc {
            cid,
            pgid,
            kind,
            new_freelist,
            new_page_count,
            ..
        } => containers.redo_alloc(instant, *cid, *pgid, *kind, *new_freelist, *new_page_count),
        LogOp::PageFree {
            cid,
            pgid,
            old_freelist,
            new_freelist,
            old_page_count,
            new_page_count,
        } => containers.apply_free(
            LogContext::Redo(instant),
            *cid,
            *pgid,
            *old_freelist,
            *new_freelist,
            *old_page_count,
            *new_page_count,
        ),

        LogOp::PageInsert {
            cid,
            pgid,
            slot,
            record_id,
            flags,
            reserved,
            undo_with_purge,
            payload,
        } => {
            if !pager.has_container(*cid) {
                return Ok(());
            }
            let page = pager.write(*cid, *pgid)?;
            if page_already_reflects(page.meta().lsn, instant) {
                return Ok(());
            }
            let Some(mut data) = page.into_data() else {
                return Err(anyhow!("redo failed: page {pgid:?} is not a data page"));
            };
            data.insert_with_id(
                LogContext::Redo(instant),
                *slot as usize,
                RecordId::new(*record_id),
                payload,
                *flags,
                *reserved as usize,
                *undo_with_purge,
            )?;
            Ok(())
        }
        LogOp::PageUpdate {
            cid,
            pgid,
            slot,
            new_flags,
            new_payload,
            ..
        } => {
            if !pager.has_container(*cid) {
                return Ok(());
            }
            let page = pager.write(*cid, *pgid)?;
            if page_already_reflects(page.meta().lsn, instant) {
                return Ok(());
            }
            let Some(mut data) = page.into_data() else {
                return Err(anyhow!("redo failed: page {pgid:?} is not a data page"));
            };
            data.update(LogContext::Redo(instant), *slot as usize, new_payload, *new_flags)
        }
        LogOp::PageSetDeleted {
            cid,
            pgid,
            slot,
            deleted,
            ..
        } => {
            if !pager.has_container(*cid) {
                return Ok(());
            }
            let page = pager.write(*cid, *pgid)?;
            if page_already_reflects(page.meta().lsn, instant) {
                return Ok(());
            }
            let Some(mut data) = page.into_data() else {
                return Err(anyhow!("redo failed: page {pgid:?} is not a data page"));
            };
            data.set_deleted(LogContext::Redo(instant), *slot as usize, *deleted)
        }
        LogOp::PagePurge {
            cid,
            pgid,
            start_slot,
            log_data,
            entries,
        } => {
            if !pager.has_container(*cid) {
                return Ok(());
            }
            let page = pager.write(*cid, *pgid)?;
            if page_already_reflects(page.meta().lsn, instant) {
                return Ok(());
            }
            let Some(mut data) = page.into_data() else {
                return Err(anyhow!("redo failed: page {pgid:?} is not a data page"));
            };
            data.purge(
                LogContext::Redo(instant),
                *start_slot as usize,
                entries.len(),
                *log_data,
                containers.reuse_record_ids(*cid),
            )
        }

        LogOp::OverflowWrite {
            cid,
            pgid,
            next,
            bytes,
        } => {
            if !pager.has_container(*cid) {
                return Ok(());
            }
            let page = pager.write_fresh(*cid, *pgid)?;
            if page_already_reflects(page.meta().lsn, instant) {
                return Ok(());
            }
            let mut overflow = match page.into_overflow() {
                Some(overflow) => overflow,
                None => {
                    // The covering alloc was skipped because the header was
                    // current, but this page itself never made it to disk.
                    let page = pager.write_fresh(*cid, *pgid)?;
                    page.init_overflow(Some(instant))
                }
            };
            overflow.write(LogContext::Redo(instant), bytes, *next)
        }
        LogOp::OverflowClear { cid, pgid } => {
            if !pager.has_container(*cid) {
                return Ok(());
            }
            let page = pager.write(*cid, *pgid)?;
            if page_already_reflects(page.meta().lsn, instant) {
                return Ok(());
            }
            let Some(mut overflow) = page.into_overflow() else {
                return Ok(());
            };
            overflow.clear(LogContext::Redo(instant))
        }
    }
}

fn page_already_reflects(page_lsn: Option<LogInstant>, instant: LogInstant) -> bool {
    page_lsn.map(|lsn| lsn >= instant).unwrap_or(false)
}

/// Rolls back a transaction's chain, newest first, emitting a compensation
/// record for each undone operation. With `stop_at` set, only records
/// logged after that instant are undone (savepoint rollback); compensation
/// records already in the chain are skipped via their `undo_next` pointer,
/// which also makes re-aborting after a crash continue where it left off.
pub(crate) fn undo_tx(
    containers: &Containers,
    wal: &Wal,
    chain: &TxChain,
    stop_at: Option<LogInstant>,
) -> anyhow::Result<()> {
    wal.flush_all()?;
    log::debug!(
        "undo started txid={:?} from={:?} stop_at={stop_at:?}",
        chain.txid(),
        chain.last()
    );

    let mut cursor = chain.last();
    while let Some(instant) = cursor {
        if instant == LogInstant::END_OF_UNDO {
            break;
        }
        if let Some(stop) = stop_at {
            if instant <= stop {
                break;
            }
        }

        let buf = wal.read_record(instant)?;
        let rec = buf.record()?;
        assert_eq!(
            Some(chain.txid()),
            rec.txid,
            "transaction chain reached a record of another transaction"
        );

        if let Some(undo_next) = rec.undo_next {
            cursor = Some(undo_next);
            continue;
        }

        let ctx = LogContext::Undo(wal, chain, rec.prev);
        apply_undo(containers, ctx, &rec.op)?;
        cursor = rec.prev;
    }

    log::debug!("undo finished txid={:?}", chain.txid());
    Ok(())
}

/// Applies the inverse of one logged operation. Slots are re-located by
/// record id because operations later in the chain (now already undone)
/// may have shifted them.
fn apply_undo(
    containers: &Containers,
    ctx: LogContext<'_>,
    op: &LogOp<'_>,
) -> anyhow::Result<()> {
    let pager = containers.pager();
    match op {
        LogOp::TxBegin
        | LogOp::TxCommit
        | LogOp::TxAbort
        | LogOp::TxEnd
        | LogOp::Savepoint { .. } => Ok(()),

        LogOp::ContainerCreate { cid, .. } => containers.purge_container(ctx, *cid),
        LogOp::ContainerDrop { cid } => containers.undo_drop(ctx, *cid),
        LogOp::ContainerUndoDrop { .. } | LogOp::ContainerPurge { .. } => {
            unreachable!("compensation-only container records are never undone")
        }

        LogOp::PageAlloc {
            cid,
            pgid,
            old_freelist,
            new_freelist,
            old_page_count,
            new_page_count,
            ..
        } => containers.apply_free(
            ctx,
            *cid,
            *pgid,
            *new_freelist,
            *old_freelist,
            *new_page_count,
            *old_page_count,
        ),
        LogOp::PageFree { .. } => {
            unreachable!("page frees are compensation or post-commit records, never undone")
        }

        LogOp::PageInsert {
            cid,
            pgid,
            record_id,
            undo_with_purge,
            ..
        } => {
            let page = pager.write(*cid, *pgid)?;
            let Some(mut data) = page.into_data() else {
                return Err(anyhow!("undo failed: page {pgid:?} is not a data page"));
            };
            let Some(slot) = data.find_record(RecordId::new(*record_id)) else {
                return Err(anyhow!(
                    "undo failed: record {record_id} vanished from page {pgid:?}"
                ));
            };
            if *undo_with_purge {
                data.purge(ctx, slot, 1, true, containers.reuse_record_ids(*cid))
            } else {
                data.set_deleted(ctx, slot, true)
            }
        }
        LogOp::PageUpdate {
            cid,
            pgid,
            record_id,
            old_flags,
            old_payload,
            ..
        } => {
            let page = pager.write(*cid, *pgid)?;
            let Some(mut data) = page.into_data() else {
                return Err(anyhow!("undo failed: page {pgid:?} is not a data page"));
            };
            let Some(slot) = data.find_record(RecordId::new(*record_id)) else {
                return Err(anyhow!(
                    "undo failed: record {record_id} vanished from page {pgid:?}"
                ));
            };
            data.update(ctx, slot, old_payload, *old_flags)
        }
        LogOp::PageSetDeleted {
            cid,
            pgid,
            record_id,
            deleted,
            ..
        } => {
            let page = pager.write(*cid, *pgid)?;
            let Some(mut data) = page.into_data() else {
                return Err(anyhow!("undo failed: page {pgid:?} is not a data page"));
            };
            let Some(slot) = data.find_record(RecordId::new(*record_id)) else {
                return Err(anyhow!(
                    "undo failed: record {record_id} vanished from page {pgid:?}"
                ));
            };
            data.set_deleted(ctx, slot, !deleted)
        }
        LogOp::PagePurge {
            cid,
            pgid,
            start_slot,
            entries,
            ..
        } => {
            let page = pager.write(*cid, *pgid)?;
            let Some(mut data) = page.into_data() else {
                return Err(anyhow!("undo failed: page {pgid:?} is not a data page"));
            };
            for (i, entry) in entries.iter().enumerate() {
                // Without logged data the rows come back as zero-filled
                // placeholders of the original encoded size.
                let payload = match entry.payload {
                    Some(bytes) => bytes.to_vec(),
                    None => vec![0u8; entry.encoded_len as usize],
                };
                data.insert_with_id(
                    ctx,
                    *start_slot as usize + i,
                    RecordId::new(entry.record_id),
                    &payload,
                    entry.flags,
                    0,
                    false,
                )?;
            }
            Ok(())
        }

        LogOp::OverflowWrite { cid, pgid, .. } => {
            let page = pager.write(*cid, *pgid)?;
            let Some(mut overflow) = page.into_overflow() else {
                return Err(anyhow!("undo failed: page {pgid:?} is not an overflow page"));
            };
            overflow.clear(ctx)
        }
        LogOp::OverflowClear { .. } => {
            unreachable!("overflow clears are compensation records, never undone")
        }
    }
}
