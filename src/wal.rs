use crate::bins::SliceExt;
use crate::id::{LogInstant, TxId};
use crate::log::{LogOp, LogRecord, RecordBuf};
use anyhow::{anyhow, Context};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub(crate) const LOG_FILE_HEADER_SIZE: usize = 32;
const LOG_FILE_MAGIC: &[u8] = b"slotwal0";

/// Offset of the first record in every log file.
pub(crate) const FIRST_LOG_OFFSET: u32 = LOG_FILE_HEADER_SIZE as u32;

/// Appends switch to a fresh log file once the current one grows past this.
const LOG_SWITCH_SIZE: u32 = 16 << 20;

const APPEND_BUFFER_SIZE: usize = 1 << 20;

#[derive(Debug)]
pub(crate) struct LogFileHeader {
    pub(crate) version: u16,
    pub(crate) file_number: u32,
}

impl LogFileHeader {
    pub(crate) fn decode(buff: &[u8]) -> Option<Self> {
        if buff.len() < LOG_FILE_HEADER_SIZE || &buff[0..8] != LOG_FILE_MAGIC {
            return None;
        }
        let stored_checksum = buff[24..32].read_u64();
        let checksum = crc64::crc64(0x1d0f, &buff[0..24]);
        if stored_checksum != checksum {
            return None;
        }
        Some(LogFileHeader {
            version: buff[8..10].read_u16(),
            file_number: buff[10..14].read_u32(),
        })
    }

    pub(crate) fn encode(&self, buff: &mut [u8]) {
        assert_eq!(LOG_FILE_HEADER_SIZE, buff.len());
        buff.fill(0);
        buff[0..8].copy_from_slice(LOG_FILE_MAGIC);
        buff[8..10].copy_from_slice(&self.version.to_be_bytes());
        buff[10..14].copy_from_slice(&self.file_number.to_be_bytes());
        let checksum = crc64::crc64(0x1d0f, &buff[0..24]);
        buff[24..32].copy_from_slice(&checksum.to_be_bytes());
    }
}

pub(crate) fn log_file_path(dir: &Path, file_number: u32) -> PathBuf {
    dir.join(format!("log{file_number}.dat"))
}

/// Every `log<n>.dat` in the directory, ordered by file number.
pub(crate) fn list_log_files(dir: &Path) -> anyhow::Result<Vec<(u32, PathBuf)>> {
    let mut files = Vec::new();
    if !dir.exists() {
        return Ok(files);
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(number) = name
            .strip_prefix("log")
            .and_then(|rest| rest.strip_suffix(".dat"))
            .and_then(|n| n.parse::<u32>().ok())
        else {
            continue;
        };
        files.push((number, entry.path()));
    }
    files.sort_by_key(|(n, _)| *n);
    Ok(files)
}

pub(crate) struct Wal {
    dir: PathBuf,
    internal: Mutex<WalInternal>,
}

struct WalInternal {
    f: File,
    file_number: u32,
    buffer: Vec<u8>,
    /// File offset of `buffer[0]`; the buffer always holds whole records.
    buffer_start: u32,
    next: LogInstant,
    first_unflushed: LogInstant,
}

impl Wal {
    /// Creates a brand-new log in `dir` (which must hold no log files yet).
    pub(crate) fn create(dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let f = create_log_file(dir, 1)?;
        let next = LogInstant::new(1, FIRST_LOG_OFFSET);
        Ok(Self {
            dir: dir.to_path_buf(),
            internal: Mutex::new(WalInternal {
                f,
                file_number: 1,
                buffer: Vec::with_capacity(APPEND_BUFFER_SIZE),
                buffer_start: FIRST_LOG_OFFSET,
                next,
                first_unflushed: next,
            }),
        })
    }

    /// Opens the log for appending at `end`, the boundary recovery verified.
    /// Anything after it (a torn tail in `end`'s file, or whole files with
    /// larger numbers) is discarded.
    pub(crate) fn open_at(dir: &Path, end: LogInstant) -> anyhow::Result<Self> {
        for (number, path) in list_log_files(dir)? {
            if number > end.file_number() {
                log::warn!("removing log file {number} past the recovered tail");
                std::fs::remove_file(path)?;
            }
        }

        let path = log_file_path(dir, end.file_number());
        let mut f = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("cannot open log file {path:?}"))?;
        f.set_len(u64::from(end.offset()))?;

        // If the boundary is the file start, its header may itself be the
        // corruption recovery stopped at; rewrite it so appends after it
        // stay readable.
        let mut header = vec![0u8; LOG_FILE_HEADER_SIZE];
        f.seek(SeekFrom::Start(0))?;
        let header_ok = f.read_exact(&mut header).is_ok()
            && LogFileHeader::decode(&header)
                .map(|h| h.file_number == end.file_number())
                .unwrap_or(false);
        if !header_ok {
            let fresh = LogFileHeader {
                version: 0,
                file_number: end.file_number(),
            };
            fresh.encode(&mut header);
            f.set_len(u64::from(end.offset().max(FIRST_LOG_OFFSET)))?;
            f.seek(SeekFrom::Start(0))?;
            f.write_all(&header)?;
        }
        f.sync_all()?;

        Ok(Self {
            dir: dir.to_path_buf(),
            internal: Mutex::new(WalInternal {
                f,
                file_number: end.file_number(),
                buffer: Vec::with_capacity(APPEND_BUFFER_SIZE),
                buffer_start: end.offset(),
                next: end,
                first_unflushed: end,
            }),
        })
    }

    pub(crate) fn append(&self, record: &LogRecord) -> anyhow::Result<LogInstant> {
        let size = record.size();
        let mut internal = self.internal.lock();

        if internal
            .next
            .offset()
            .checked_add(size as u32)
            .map(|end| end > LOG_SWITCH_SIZE)
            .unwrap_or(true)
        {
            Self::switch_locked(&self.dir, &mut internal)?;
        }
        if internal.buffer.len() + size > APPEND_BUFFER_SIZE && !internal.buffer.is_empty() {
            Self::flush_locked(&mut internal)?;
        }

        let instant = internal.next;
        let offset = internal.buffer.len();
        internal.buffer.resize(offset + size, 0);
        record.encode_frame(instant, &mut internal.buffer[offset..offset + size]);
        internal.next = LogInstant::new(instant.file_number(), instant.offset() + size as u32);

        Ok(instant)
    }

    /// Durably persists every appended record.
    pub(crate) fn flush_all(&self) -> anyhow::Result<()> {
        let mut internal = self.internal.lock();
        Self::flush_locked(&mut internal)
    }

    pub(crate) fn first_unflushed(&self) -> LogInstant {
        self.internal.lock().first_unflushed
    }

    pub(crate) fn end_instant(&self) -> LogInstant {
        self.internal.lock().next
    }

    /// Rotates to a new log file. No checkpoint record is written; recovery
    /// scans all retained files in order regardless.
    pub(crate) fn switch_log_file(&self) -> anyhow::Result<()> {
        let mut internal = self.internal.lock();
        Self::switch_locked(&self.dir, &mut internal)
    }

    /// Removes log files strictly older than `file_number`. The caller is
    /// responsible for making sure nothing in them is still needed, i.e.
    /// every page they cover has been flushed and no live transaction's
    /// chain reaches into them.
    pub(crate) fn delete_files_before(&self, file_number: u32) -> anyhow::Result<()> {
        let current = self.internal.lock().file_number;
        for (number, path) in list_log_files(&self.dir)? {
            if number < file_number && number < current {
                log::debug!("removing old log file {number}");
                std::fs::remove_file(path)?;
            }
        }
        Ok(())
    }

    /// Random-access read of one record, used to walk a transaction's chain
    /// backwards. The caller must have flushed the log past `instant`.
    pub(crate) fn read_record(&self, instant: LogInstant) -> anyhow::Result<RecordBuf> {
        {
            let internal = self.internal.lock();
            assert!(
                instant < internal.first_unflushed,
                "reading unflushed log record at {instant:?}"
            );
        }

        // A fresh handle: the appender's cursor and concurrent chain reads
        // must not disturb each other.
        let path = log_file_path(&self.dir, instant.file_number());
        let mut f = OpenOptions::new()
            .read(true)
            .open(&path)
            .with_context(|| format!("cannot open log file {path:?}"))?;

        f.seek(SeekFrom::Start(u64::from(instant.offset())))?;
        let mut prefix = [0u8; 12];
        f.read_exact(&mut prefix)?;
        let payload_size = prefix.read_u32() as usize;

        let mut buff = vec![0u8; payload_size + 24];
        buff[..12].copy_from_slice(&prefix);
        f.read_exact(&mut buff[12..])?;

        Ok(RecordBuf { instant, buff })
    }

    fn flush_locked(internal: &mut WalInternal) -> anyhow::Result<()> {
        if !internal.buffer.is_empty() {
            internal
                .f
                .seek(SeekFrom::Start(u64::from(internal.buffer_start)))?;
            internal.f.write_all(&internal.buffer)?;
            internal.f.sync_all()?;
            internal.buffer_start += internal.buffer.len() as u32;
            internal.buffer.clear();
        }
        internal.first_unflushed = internal.next;
        Ok(())
    }

    fn switch_locked(dir: &Path, internal: &mut WalInternal) -> anyhow::Result<()> {
        Self::flush_locked(internal)?;

        let next_number = internal.file_number + 1;
        log::debug!("switching to log file {next_number}");
        internal.f = create_log_file(dir, next_number)?;
        internal.file_number = next_number;
        internal.buffer_start = FIRST_LOG_OFFSET;
        internal.next = LogInstant::new(next_number, FIRST_LOG_OFFSET);
        internal.first_unflushed = internal.next;
        Ok(())
    }

    pub(crate) fn shutdown(self) -> anyhow::Result<()> {
        let mut internal = self.internal.into_inner();
        Self::flush_locked(&mut internal)?;
        Ok(())
    }
}

fn create_log_file(dir: &Path, file_number: u32) -> anyhow::Result<File> {
    let path = log_file_path(dir, file_number);
    let mut f = OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(&path)
        .with_context(|| format!("cannot create log file {path:?}"))?;
    let header = LogFileHeader {
        version: 0,
        file_number,
    };
    let mut buff = vec![0u8; LOG_FILE_HEADER_SIZE];
    header.encode(&mut buff);
    f.write_all(&buff)?;
    f.sync_all()?;
    Ok(f)
}

/// Tracks one transaction's position in the log: its id and the instant of
/// its latest record, which every subsequent record chains back to.
pub(crate) struct TxChain {
    txid: TxId,
    last: Mutex<Option<LogInstant>>,
}

impl TxChain {
    pub(crate) fn new(txid: TxId) -> Self {
        Self {
            txid,
            last: Mutex::new(None),
        }
    }

    pub(crate) fn with_last(txid: TxId, last: Option<LogInstant>) -> Self {
        Self {
            txid,
            last: Mutex::new(last),
        }
    }

    pub(crate) fn txid(&self) -> TxId {
        self.txid
    }

    pub(crate) fn last(&self) -> Option<LogInstant> {
        *self.last.lock()
    }

    fn set_last(&self, instant: LogInstant) {
        *self.last.lock() = Some(instant);
    }
}

/// Why a mutation is happening, which decides how it is logged: forward
/// operations append a plain record, undo appends a compensation record,
/// redo replays an already-logged instant, and temporary-container work is
/// not logged at all.
#[derive(Copy, Clone)]
pub(crate) enum LogContext<'a> {
    Runtime(&'a Wal, &'a TxChain),
    Undo(&'a Wal, &'a TxChain, Option<LogInstant>),
    Redo(LogInstant),
    Unlogged,
}

/// Logs one mutation and returns the instant to stamp the page with, or
/// `None` when the mutation is unlogged.
pub(crate) fn record_mutation(
    ctx: LogContext<'_>,
    op: LogOp<'_>,
) -> anyhow::Result<Option<LogInstant>> {
    match ctx {
        LogContext::Runtime(wal, chain) => {
            let instant = wal.append(&LogRecord {
                txid: Some(chain.txid()),
                prev: chain.last(),
                undo_next: None,
                op,
            })?;
            chain.set_last(instant);
            Ok(Some(instant))
        }
        LogContext::Undo(wal, chain, undo_next) => {
            let instant = wal.append(&LogRecord {
                txid: Some(chain.txid()),
                prev: chain.last(),
                // A compensation record with nothing left to undo keeps an
                // explicit end-of-chain marker.
                undo_next: Some(undo_next.unwrap_or(LogInstant::END_OF_UNDO)),
                op,
            })?;
            chain.set_last(instant);
            Ok(Some(instant))
        }
        LogContext::Redo(instant) => Ok(Some(instant)),
        LogContext::Unlogged => Ok(None),
    }
}
