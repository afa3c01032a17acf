use crate::bins::SliceExt;
use crate::id::{
    ContainerId, ContainerIdExt, LogInstant, LogInstantExt, PageId, PageIdExt, TxId, TxIdExt,
};
use anyhow::anyhow;

/// A log record before framing. `txid` is absent only for records that do
/// not belong to a transaction. `prev` chains the records of one
/// transaction together for undo; `undo_next` is set only on compensation
/// records and points at the next record of the chain still to be undone.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct LogRecord<'a> {
    pub(crate) txid: Option<TxId>,
    pub(crate) prev: Option<LogInstant>,
    pub(crate) undo_next: Option<LogInstant>,
    pub(crate) op: LogOp<'a>,
}

const RECORD_HEADER_SIZE: usize = 8 + 8 + 8 + 1;

// Frame layout:
//   [len u32][instant u64][payload][len u32][crc64 u64]
// The two length words let a reader walk the log in either direction and
// detect a torn tail; the checksum covers the payload so interior bit flips
// in an otherwise well-framed record are still caught. The stored instant
// must match the record's actual position, which rejects stale bytes left
// over from a recycled region of the file.
const FRAME_OVERHEAD: usize = 4 + 8 + 4 + 8;

// A single log record never exceeds a handful of pages; anything larger in
// the length word means we are reading garbage.
const MAX_PAYLOAD_SIZE: usize = 1 << 22;

impl LogRecord<'_> {
    pub(crate) fn size(&self) -> usize {
        RECORD_HEADER_SIZE + self.op.size() + FRAME_OVERHEAD
    }

    pub(crate) fn encode_frame(&self, instant: LogInstant, buff: &mut [u8]) {
        let payload_size = RECORD_HEADER_SIZE + self.op.size();
        assert_eq!(self.size(), buff.len());
        assert!(payload_size <= MAX_PAYLOAD_SIZE);

        buff[0..4].copy_from_slice(&(payload_size as u32).to_be_bytes());
        buff[4..12].copy_from_slice(&instant.to_be_bytes());

        let payload = &mut buff[12..12 + payload_size];
        payload[0..8].copy_from_slice(&self.txid.to_be_bytes());
        payload[8..16].copy_from_slice(&self.prev.to_be_bytes());
        payload[16..24].copy_from_slice(&self.undo_next.to_be_bytes());
        payload[24] = self.op.kind();
        self.op.encode(&mut payload[RECORD_HEADER_SIZE..]);

        let tail = 12 + payload_size;
        buff[tail..tail + 4].copy_from_slice(&(payload_size as u32).to_be_bytes());
        let checksum = crc64::crc64(0x1d0f, &buff[12..12 + payload_size]);
        buff[tail + 4..tail + 12].copy_from_slice(&checksum.to_be_bytes());
    }

    pub(crate) fn decode_frame(buff: &[u8], expect: LogInstant) -> LogDecodeResult<'_> {
        if buff.len() < 12 {
            return LogDecodeResult::NeedMoreBytes;
        }

        let payload_size = buff.read_u32() as usize;
        if payload_size < RECORD_HEADER_SIZE || payload_size > MAX_PAYLOAD_SIZE {
            return LogDecodeResult::Incomplete;
        }
        let total = payload_size + FRAME_OVERHEAD;
        if buff.len() < total {
            return LogDecodeResult::NeedMoreBytes;
        }

        let Some(instant) = LogInstant::from_be_bytes(buff[4..12].try_into().unwrap()) else {
            return LogDecodeResult::Incomplete;
        };
        if instant != expect {
            return LogDecodeResult::Incomplete;
        }

        let tail = 12 + payload_size;
        let trailing_size = buff[tail..].read_u32() as usize;
        if trailing_size != payload_size {
            return LogDecodeResult::Incomplete;
        }
        let stored_checksum = buff[tail + 4..].read_u64();
        let checksum = crc64::crc64(0x1d0f, &buff[12..tail]);
        if stored_checksum != checksum {
            return LogDecodeResult::Incomplete;
        }

        let payload = &buff[12..tail];
        let txid = TxId::from_be_bytes(payload[0..8].try_into().unwrap());
        let prev = LogInstant::from_be_bytes(payload[8..16].try_into().unwrap());
        let undo_next = LogInstant::from_be_bytes(payload[16..24].try_into().unwrap());
        let kind = payload[24];
        let op = match LogOp::decode(kind, &payload[RECORD_HEADER_SIZE..]) {
            Ok(op) => op,
            Err(err) => return LogDecodeResult::Err(err),
        };

        LogDecodeResult::Ok {
            record: LogRecord {
                txid,
                prev,
                undo_next,
                op,
            },
            size: total,
        }
    }
}

pub(crate) enum LogDecodeResult<'a> {
    Ok { record: LogRecord<'a>, size: usize },
    NeedMoreBytes,
    /// A torn or corrupted record: treated as the end of the valid log.
    Incomplete,
    Err(anyhow::Error),
}

/// An owned log record frame, as returned by random-access reads.
pub(crate) struct RecordBuf {
    pub(crate) instant: LogInstant,
    pub(crate) buff: Vec<u8>,
}

impl RecordBuf {
    pub(crate) fn record(&self) -> anyhow::Result<LogRecord<'_>> {
        match LogRecord::decode_frame(&self.buff, self.instant) {
            LogDecodeResult::Ok { record, .. } => Ok(record),
            LogDecodeResult::Err(err) => Err(err),
            _ => Err(anyhow!(
                "log record at {:?} is malformed",
                self.instant
            )),
        }
    }
}

/// One slot's worth of state captured by a purge. `payload` is present only
/// when the purge logged its data; otherwise rollback reinserts a
/// placeholder of `encoded_len` bytes.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct PurgeEntry<'a> {
    pub(crate) record_id: u32,
    pub(crate) flags: u16,
    pub(crate) encoded_len: u16,
    pub(crate) payload: Option<&'a [u8]>,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum LogOp<'a> {
    TxBegin,
    TxCommit,
    TxAbort,
    TxEnd,
    Savepoint {
        name: &'a [u8],
    },

    ContainerCreate {
        cid: ContainerId,
        spare_space: u8,
        min_record_size: u32,
        reuse_record_ids: bool,
    },
    ContainerDrop {
        cid: ContainerId,
    },
    ContainerUndoDrop {
        cid: ContainerId,
    },
    ContainerPurge {
        cid: ContainerId,
    },

    PageAlloc {
        cid: ContainerId,
        pgid: PageId,
        kind: u8,
        old_freelist: Option<PageId>,
        new_freelist: Option<PageId>,
        old_page_count: u64,
        new_page_count: u64,
    },
    PageFree {
        cid: ContainerId,
        pgid: PageId,
        old_freelist: Option<PageId>,
        new_freelist: Option<PageId>,
        old_page_count: u64,
        new_page_count: u64,
    },
    PageInsert {
        cid: ContainerId,
        pgid: PageId,
        slot: u16,
        record_id: u32,
        flags: u16,
        undo_with_purge: bool,
        reserved: u16,
        payload: &'a [u8],
    },
    PageUpdate {
        cid: ContainerId,
        pgid: PageId,
        slot: u16,
        record_id: u32,
        old_flags: u16,
        new_flags: u16,
        old_payload: &'a [u8],
        new_payload: &'a [u8],
    },
    PageSetDeleted {
        cid: ContainerId,
        pgid: PageId,
        slot: u16,
        record_id: u32,
        deleted: bool,
    },
    PagePurge {
        cid: ContainerId,
        pgid: PageId,
        start_slot: u16,
        log_data: bool,
        entries: Vec<PurgeEntry<'a>>,
    },

    OverflowWrite {
        cid: ContainerId,
        pgid: PageId,
        next: Option<PageId>,
        bytes: &'a [u8],
    },
    OverflowClear {
        cid: ContainerId,
        pgid: PageId,
    },
}

const LOG_OP_TX_BEGIN: u8 = 1;
const LOG_OP_TX_COMMIT: u8 = 2;
const LOG_OP_TX_ABORT: u8 = 3;
const LOG_OP_TX_END: u8 = 4;
const LOG_OP_SAVEPOINT: u8 = 5;

const LOG_OP_CONTAINER_CREATE: u8 = 10;
const LOG_OP_CONTAINER_DROP: u8 = 11;
const LOG_OP_CONTAINER_UNDO_DROP: u8 = 12;
const LOG_OP_CONTAINER_PURGE: u8 = 13;

const LOG_OP_PAGE_ALLOC: u8 = 20;
const LOG_OP_PAGE_FREE: u8 = 21;
const LOG_OP_PAGE_INSERT: u8 = 22;
const LOG_OP_PAGE_UPDATE: u8 = 23;
const LOG_OP_PAGE_SET_DELETED: u8 = 24;
const LOG_OP_PAGE_PURGE: u8 = 25;

const LOG_OP_OVERFLOW_WRITE: u8 = 30;
const LOG_OP_OVERFLOW_CLEAR: u8 = 31;

impl<'a> LogOp<'a> {
    fn kind(&self) -> u8 {
        match self {
            LogOp::TxBegin => LOG_OP_TX_BEGIN,
            LogOp::TxCommit => LOG_OP_TX_COMMIT,
            LogOp::TxAbort => LOG_OP_TX_ABORT,
            LogOp::TxEnd => LOG_OP_TX_END,
            LogOp::Savepoint { .. } => LOG_OP_SAVEPOINT,

            LogOp::ContainerCreate { .. } => LOG_OP_CONTAINER_CREATE,
            LogOp::ContainerDrop { .. } => LOG_OP_CONTAINER_DROP,
            LogOp::ContainerUndoDrop { .. } => LOG_OP_CONTAINER_UNDO_DROP,
            LogOp::ContainerPurge { .. } => LOG_OP_CONTAINER_PURGE,

            LogOp::PageAlloc { .. } => LOG_OP_PAGE_ALLOC,
            LogOp::PageFree { .. } => LOG_OP_PAGE_FREE,
            LogOp::PageInsert { .. } => LOG_OP_PAGE_INSERT,
            LogOp::PageUpdate { .. } => LOG_OP_PAGE_UPDATE,
            LogOp::PageSetDeleted { .. } => LOG_OP_PAGE_SET_DELETED,
            LogOp::PagePurge { .. } => LOG_OP_PAGE_PURGE,

            LogOp::OverflowWrite { .. } => LOG_OP_OVERFLOW_WRITE,
            LogOp::OverflowClear { .. } => LOG_OP_OVERFLOW_CLEAR,
        }
    }

    fn size(&self) -> usize {
        match self {
            LogOp::TxBegin | LogOp::TxCommit | LogOp::TxAbort | LogOp::TxEnd => 0,
            LogOp::Savepoint { name } => 2 + name.len(),

            LogOp::ContainerCreate { .. } => 14,
            LogOp::ContainerDrop { .. }
            | LogOp::ContainerUndoDrop { .. }
            | LogOp::ContainerPurge { .. } => 8,

            LogOp::PageAlloc { .. } => 49,
            LogOp::PageFree { .. } => 48,
            LogOp::PageInsert { payload, .. } => 31 + payload.len(),
            LogOp::PageUpdate {
                old_payload,
                new_payload,
                ..
            } => 34 + old_payload.len() + new_payload.len(),
            LogOp::PageSetDeleted { .. } => 23,
            LogOp::PagePurge {
                log_data, entries, ..
            } => {
                let mut size = 21 + entries.len() * 8;
                if *log_data {
                    size += entries
                        .iter()
                        .map(|e| e.encoded_len as usize)
                        .sum::<usize>();
                }
                size
            }

            LogOp::OverflowWrite { bytes, .. } => 28 + bytes.len(),
            LogOp::OverflowClear { .. } => 16,
        }
    }

    fn encode(&self, buff: &mut [u8]) {
        match self {
            LogOp::TxBegin | LogOp::TxCommit | LogOp::TxAbort | LogOp::TxEnd => (),
            LogOp::Savepoint { name } => {
                assert!(name.len() <= u16::MAX as usize);
                buff[0..2].copy_from_slice(&(name.len() as u16).to_be_bytes());
                buff[2..2 + name.len()].copy_from_slice(name);
            }

            LogOp::ContainerCreate {
                cid,
                spare_space,
                min_record_size,
                reuse_record_ids,
            } => {
                buff[0..8].copy_from_slice(&cid.to_be_bytes());
                buff[8] = *spare_space;
                buff[9..13].copy_from_slice(&min_record_size.to_be_bytes());
                buff[13] = *reuse_record_ids as u8;
            }
            LogOp::ContainerDrop { cid }
            | LogOp::ContainerUndoDrop { cid }
            | LogOp::ContainerPurge { cid } => {
                buff[0..8].copy_from_slice(&cid.to_be_bytes());
            }

            LogOp::PageAlloc {
                cid,
                pgid,
                kind,
                old_freelist,
                new_freelist,
                old_page_count,
                new_page_count,
            } => {
                buff[0..8].copy_from_slice(&cid.to_be_bytes());
                buff[8..16].copy_from_slice(&pgid.to_be_bytes());
                buff[16] = *kind;
                buff[17..25].copy_from_slice(&old_freelist.to_be_bytes());
                buff[25..33].copy_from_slice(&new_freelist.to_be_bytes());
                buff[33..41].copy_from_slice(&old_page_count.to_be_bytes());
                buff[41..49].copy_from_slice(&new_page_count.to_be_bytes());
            }
            LogOp::PageFree {
                cid,
                pgid,
                old_freelist,
                new_freelist,
                old_page_count,
                new_page_count,
            } => {
                buff[0..8].copy_from_slice(&cid.to_be_bytes());
                buff[8..16].copy_from_slice(&pgid.to_be_bytes());
                buff[16..24].copy_from_slice(&old_freelist.to_be_bytes());
                buff[24..32].copy_from_slice(&new_freelist.to_be_bytes());
                buff[32..40].copy_from_slice(&old_page_count.to_be_bytes());
                buff[40..48].copy_from_slice(&new_page_count.to_be_bytes());
            }

            LogOp::PageInsert {
                cid,
                pgid,
                slot,
                record_id,
                flags,
                undo_with_purge,
                reserved,
                payload,
            } => {
                assert!(payload.len() <= u32::MAX as usize);
                buff[0..8].copy_from_slice(&cid.to_be_bytes());
                buff[8..16].copy_from_slice(&pgid.to_be_bytes());
                buff[16..18].copy_from_slice(&slot.to_be_bytes());
                buff[18..22].copy_from_slice(&record_id.to_be_bytes());
                buff[22..24].copy_from_slice(&flags.to_be_bytes());
                buff[24] = *undo_with_purge as u8;
                buff[25..27].copy_from_slice(&reserved.to_be_bytes());
                buff[27..31].copy_from_slice(&(payload.len() as u32).to_be_bytes());
                buff[31..31 + payload.len()].copy_from_slice(payload);
            }
            LogOp::PageUpdate {
                cid,
                pgid,
                slot,
                record_id,
                old_flags,
                new_flags,
                old_payload,
                new_payload,
            } => {
                buff[0..8].copy_from_slice(&cid.to_be_bytes());
                buff[8..16].copy_from_slice(&pgid.to_be_bytes());
                buff[16..18].copy_from_slice(&slot.to_be_bytes());
                buff[18..22].copy_from_slice(&record_id.to_be_bytes());
                buff[22..24].copy_from_slice(&old_flags.to_be_bytes());
                buff[24..26].copy_from_slice(&new_flags.to_be_bytes());
                buff[26..30].copy_from_slice(&(old_payload.len() as u32).to_be_bytes());
                buff[30..34].copy_from_slice(&(new_payload.len() as u32).to_be_bytes());
                buff[34..34 + old_payload.len()].copy_from_slice(old_payload);
                let next = 34 + old_payload.len();
                buff[next..next + new_payload.len()].copy_from_slice(new_payload);
            }
            LogOp::PageSetDeleted {
                cid,
                pgid,
                slot,
                record_id,
                deleted,
            } => {
                buff[0..8].copy_from_slice(&cid.to_be_bytes());
                buff[8..16].copy_from_slice(&pgid.to_be_bytes());
                buff[16..18].copy_from_slice(&slot.to_be_bytes());
                buff[18..22].copy_from_slice(&record_id.to_be_bytes());
                buff[22] = *deleted as u8;
            }
            LogOp::PagePurge {
                cid,
                pgid,
                start_slot,
                log_data,
                entries,
            } => {
                assert!(entries.len() <= u16::MAX as usize);
                buff[0..8].copy_from_slice(&cid.to_be_bytes());
                buff[8..16].copy_from_slice(&pgid.to_be_bytes());
                buff[16..18].copy_from_slice(&start_slot.to_be_bytes());
                buff[18] = *log_data as u8;
                buff[19..21].copy_from_slice(&(entries.len() as u16).to_be_bytes());
                let mut next = 21;
                for entry in entries {
                    buff[next..next + 4].copy_from_slice(&entry.record_id.to_be_bytes());
                    buff[next + 4..next + 6].copy_from_slice(&entry.flags.to_be_bytes());
                    buff[next + 6..next + 8].copy_from_slice(&entry.encoded_len.to_be_bytes());
                    next += 8;
                    if *log_data {
                        let payload = entry.payload.expect("purge with log_data carries payload");
                        assert_eq!(payload.len(), entry.encoded_len as usize);
                        buff[next..next + payload.len()].copy_from_slice(payload);
                        next += payload.len();
                    }
                }
            }

            LogOp::OverflowWrite {
                cid,
                pgid,
                next,
                bytes,
            } => {
                buff[0..8].copy_from_slice(&cid.to_be_bytes());
                buff[8..16].copy_from_slice(&pgid.to_be_bytes());
                buff[16..24].copy_from_slice(&next.to_be_bytes());
                buff[24..28].copy_from_slice(&(bytes.len() as u32).to_be_bytes());
                buff[28..28 + bytes.len()].copy_from_slice(bytes);
            }
            LogOp::OverflowClear { cid, pgid } => {
                buff[0..8].copy_from_slice(&cid.to_be_bytes());
                buff[8..16].copy_from_slice(&pgid.to_be_bytes());
            }
        }
    }

    fn decode(kind: u8, buff: &'a [u8]) -> anyhow::Result<Self> {
        match kind {
            LOG_OP_TX_BEGIN => Ok(LogOp::TxBegin),
            LOG_OP_TX_COMMIT => Ok(LogOp::TxCommit),
            LOG_OP_TX_ABORT => Ok(LogOp::TxAbort),
            LOG_OP_TX_END => Ok(LogOp::TxEnd),
            LOG_OP_SAVEPOINT => {
                let len = buff.read_u16() as usize;
                if buff.len() < 2 + len {
                    return Err(anyhow!("savepoint record shorter than its name"));
                }
                Ok(LogOp::Savepoint {
                    name: &buff[2..2 + len],
                })
            }

            LOG_OP_CONTAINER_CREATE => {
                let cid = decode_cid(&buff[0..8])?;
                Ok(LogOp::ContainerCreate {
                    cid,
                    spare_space: buff[8],
                    min_record_size: buff[9..13].read_u32(),
                    reuse_record_ids: buff[13] != 0,
                })
            }
            LOG_OP_CONTAINER_DROP => Ok(LogOp::ContainerDrop {
                cid: decode_cid(&buff[0..8])?,
            }),
            LOG_OP_CONTAINER_UNDO_DROP => Ok(LogOp::ContainerUndoDrop {
                cid: decode_cid(&buff[0..8])?,
            }),
            LOG_OP_CONTAINER_PURGE => Ok(LogOp::ContainerPurge {
                cid: decode_cid(&buff[0..8])?,
            }),

            LOG_OP_PAGE_ALLOC => Ok(LogOp::PageAlloc {
                cid: decode_cid(&buff[0..8])?,
                pgid: decode_pgid(&buff[8..16])?,
                kind: buff[16],
                old_freelist: PageId::from_be_bytes(buff[17..25].try_into().unwrap()),
                new_freelist: PageId::from_be_bytes(buff[25..33].try_into().unwrap()),
                old_page_count: buff[33..41].read_u64(),
                new_page_count: buff[41..49].read_u64(),
            }),
            LOG_OP_PAGE_FREE => Ok(LogOp::PageFree {
                cid: decode_cid(&buff[0..8])?,
                pgid: decode_pgid(&buff[8..16])?,
                old_freelist: PageId::from_be_bytes(buff[16..24].try_into().unwrap()),
                new_freelist: PageId::from_be_bytes(buff[24..32].try_into().unwrap()),
                old_page_count: buff[32..40].read_u64(),
                new_page_count: buff[40..48].read_u64(),
            }),
            LOG_OP_PAGE_INSERT => {
                let len = buff[27..31].read_u32() as usize;
                if buff.len() < 31 + len {
                    return Err(anyhow!("page-insert record shorter than its payload"));
                }
                Ok(LogOp::PageInsert {
                    cid: decode_cid(&buff[0..8])?,
                    pgid: decode_pgid(&buff[8..16])?,
                    slot: buff[16..18].read_u16(),
                    record_id: buff[18..22].read_u32(),
                    flags: buff[22..24].read_u16(),
                    undo_with_purge: buff[24] != 0,
                    reserved: buff[25..27].read_u16(),
                    payload: &buff[31..31 + len],
                })
            }
            LOG_OP_PAGE_UPDATE => {
                let old_len = buff[26..30].read_u32() as usize;
                let new_len = buff[30..34].read_u32() as usize;
                if buff.len() < 34 + old_len + new_len {
                    return Err(anyhow!("page-update record shorter than its payloads"));
                }
                Ok(LogOp::PageUpdate {
                    cid: decode_cid(&buff[0..8])?,
                    pgid: decode_pgid(&buff[8..16])?,
                    slot: buff[16..18].read_u16(),
                    record_id: buff[18..22].read_u32(),
                    old_flags: buff[22..24].read_u16(),
                    new_flags: buff[24..26].read_u16(),
                    old_payload: &buff[34..34 + old_len],
                    new_payload: &buff[34 + old_len..34 + old_len + new_len],
                })
            }
            LOG_OP_PAGE_SET_DELETED => Ok(LogOp::PageSetDeleted {
                cid: decode_cid(&buff[0..8])?,
                pgid: decode_pgid(&buff[8..16])?,
                slot: buff[16..18].read_u16(),
                record_id: buff[18..22].read_u32(),
                deleted: buff[22] != 0,
            }),
            LOG_OP_PAGE_PURGE => {
                let log_data = buff[18] != 0;
                let count = buff[19..21].read_u16() as usize;
                let mut entries = Vec::with_capacity(count);
                let mut next = 21;
                for _ in 0..count {
                    if buff.len() < next + 8 {
                        return Err(anyhow!("purge record shorter than its entries"));
                    }
                    let record_id = buff[next..next + 4].read_u32();
                    let flags = buff[next + 4..next + 6].read_u16();
                    let encoded_len = buff[next + 6..next + 8].read_u16();
                    next += 8;
                    let payload = if log_data {
                        if buff.len() < next + encoded_len as usize {
                            return Err(anyhow!("purge record shorter than a logged row"));
                        }
                        let p = &buff[next..next + encoded_len as usize];
                        next += encoded_len as usize;
                        Some(p)
                    } else {
                        None
                    };
                    entries.push(PurgeEntry {
                        record_id,
                        flags,
                        encoded_len,
                        payload,
                    });
                }
                Ok(LogOp::PagePurge {
                    cid: decode_cid(&buff[0..8])?,
                    pgid: decode_pgid(&buff[8..16])?,
                    start_slot: buff[16..18].read_u16(),
                    log_data,
                    entries,
                })
            }

            LOG_OP_OVERFLOW_WRITE => {
                let len = buff[24..28].read_u32() as usize;
                if buff.len() < 28 + len {
                    return Err(anyhow!("overflow-write record shorter than its payload"));
                }
                Ok(LogOp::OverflowWrite {
                    cid: decode_cid(&buff[0..8])?,
                    pgid: decode_pgid(&buff[8..16])?,
                    next: PageId::from_be_bytes(buff[16..24].try_into().unwrap()),
                    bytes: &buff[28..28 + len],
                })
            }
            LOG_OP_OVERFLOW_CLEAR => Ok(LogOp::OverflowClear {
                cid: decode_cid(&buff[0..8])?,
                pgid: decode_pgid(&buff[8..16])?,
            }),

            _ => Err(anyhow!("invalid log record kind {kind}")),
        }
    }
}

fn decode_cid(buff: &[u8]) -> anyhow::Result<ContainerId> {
    ContainerId::from_be_bytes(buff.try_into().unwrap())
        .ok_or_else(|| anyhow!("zero container id in log record"))
}

fn decode_pgid(buff: &[u8]) -> anyhow::Result<PageId> {
    PageId::from_be_bytes(buff.try_into().unwrap())
        .ok_or_else(|| anyhow!("zero page id in log record"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(op: LogOp) {
        let record = LogRecord {
            txid: TxId::new(7),
            prev: Some(LogInstant::new(1, 64)),
            undo_next: None,
            op,
        };
        let instant = LogInstant::new(1, 128);
        let mut buff = vec![0u8; record.size()];
        record.encode_frame(instant, &mut buff);

        let LogDecodeResult::Ok {
            record: decoded,
            size,
        } = LogRecord::decode_frame(&buff, instant)
        else {
            panic!("decode failed");
        };
        assert_eq!(record, decoded);
        assert_eq!(size, buff.len());
    }

    #[test]
    fn test_roundtrip_all_kinds() {
        let cid = ContainerId::new(3).unwrap();
        let pgid = PageId::new(5).unwrap();

        roundtrip(LogOp::TxBegin);
        roundtrip(LogOp::TxCommit);
        roundtrip(LogOp::Savepoint { name: b"sp1" });
        roundtrip(LogOp::ContainerCreate {
            cid,
            spare_space: 20,
            min_record_size: 100,
            reuse_record_ids: false,
        });
        roundtrip(LogOp::ContainerDrop { cid });
        roundtrip(LogOp::PageAlloc {
            cid,
            pgid,
            kind: 1,
            old_freelist: Some(pgid),
            new_freelist: None,
            old_page_count: 4,
            new_page_count: 4,
        });
        roundtrip(LogOp::PageInsert {
            cid,
            pgid,
            slot: 2,
            record_id: 9,
            flags: 0,
            undo_with_purge: true,
            reserved: 40,
            payload: b"row bytes",
        });
        roundtrip(LogOp::PageUpdate {
            cid,
            pgid,
            slot: 0,
            record_id: 1,
            old_flags: 0,
            new_flags: 2,
            old_payload: b"before",
            new_payload: b"after, but longer",
        });
        roundtrip(LogOp::PagePurge {
            cid,
            pgid,
            start_slot: 1,
            log_data: true,
            entries: vec![
                PurgeEntry {
                    record_id: 4,
                    flags: 0,
                    encoded_len: 3,
                    payload: Some(b"abc"),
                },
                PurgeEntry {
                    record_id: 5,
                    flags: 1,
                    encoded_len: 2,
                    payload: Some(b"de"),
                },
            ],
        });
        roundtrip(LogOp::PagePurge {
            cid,
            pgid,
            start_slot: 0,
            log_data: false,
            entries: vec![PurgeEntry {
                record_id: 4,
                flags: 0,
                encoded_len: 120,
                payload: None,
            }],
        });
        roundtrip(LogOp::OverflowWrite {
            cid,
            pgid,
            next: Some(PageId::new(6).unwrap()),
            bytes: &[0xfe; 100],
        });
    }

    #[test]
    fn test_torn_frame_is_incomplete() {
        let record = LogRecord {
            txid: TxId::new(1),
            prev: None,
            undo_next: None,
            op: LogOp::PageInsert {
                cid: ContainerId::new(1).unwrap(),
                pgid: PageId::new(1).unwrap(),
                slot: 0,
                record_id: 1,
                flags: 0,
                undo_with_purge: false,
                reserved: 0,
                payload: &[7u8; 64],
            },
        };
        let instant = LogInstant::new(1, 32);
        let mut buff = vec![0u8; record.size()];
        record.encode_frame(instant, &mut buff);

        // Any torn suffix long enough to carry the length word must decode
        // as NeedMoreBytes against a longer buffer, never as Ok.
        for cut in 12..buff.len() {
            match LogRecord::decode_frame(&buff[..cut], instant) {
                LogDecodeResult::Ok { .. } => panic!("torn frame decoded at cut {cut}"),
                LogDecodeResult::NeedMoreBytes | LogDecodeResult::Incomplete => (),
                LogDecodeResult::Err(err) => panic!("unexpected error: {err}"),
            }
        }

        // A flipped byte inside the payload fails the checksum even though
        // the framing is intact.
        let mut corrupted = buff.clone();
        corrupted[20] ^= 0x40;
        assert!(matches!(
            LogRecord::decode_frame(&corrupted, instant),
            LogDecodeResult::Incomplete
        ));

        // A stale record read from a recycled position fails the instant
        // check.
        assert!(matches!(
            LogRecord::decode_frame(&buff, LogInstant::new(1, 4096)),
            LogDecodeResult::Incomplete
        ));
    }
}
