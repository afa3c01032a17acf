use crate::bins::SliceExt;
use crate::container::Containers;
use crate::file_lock::FileLock;
use crate::id::{LogInstant, TxId};
use crate::lock::LockTable;
use crate::pager::Pager;
use crate::reclaim::{ReclaimAction, Reclaimer};
use crate::recovery::recover;
use crate::tx::Tx;
use crate::wal::Wal;
use anyhow::anyhow;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub struct Options {
    pub page_size: usize,
    pub cache_pages: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            cache_pages: 1000,
        }
    }
}

impl Options {
    fn validate(&self) -> anyhow::Result<()> {
        if self.cache_pages < 10 {
            return Err(anyhow!("cache must hold at least 10 pages"));
        }
        Ok(())
    }
}

pub(crate) struct StoreInner {
    pub(crate) pager: Arc<Pager>,
    pub(crate) wal: Arc<Wal>,
    pub(crate) containers: Arc<Containers>,
    pub(crate) locks: LockTable,
    pub(crate) next_txid: Arc<AtomicU64>,
    /// First log instant of every transaction currently active; bounds
    /// which log files a checkpoint may retire.
    pub(crate) active: Mutex<HashMap<TxId, LogInstant>>,
    pub(crate) reclaim: Reclaimer,
}

impl StoreInner {
    pub(crate) fn alloc_txid(&self) -> TxId {
        TxId::new(self.next_txid.fetch_add(1, Ordering::SeqCst)).unwrap()
    }
}

/// The raw store: container files under `seg0/`, a write-ahead log under
/// `log/`, a double-write buffer for torn page writes, and a post-commit
/// reclamation daemon. Opening runs restart recovery.
pub struct Store {
    inner: Arc<StoreInner>,
    _dir_lock: File,
}

impl Store {
    pub fn open(path: &Path, options: Options) -> anyhow::Result<Self> {
        options.validate()?;

        if !path.exists() {
            std::fs::create_dir_all(path)?;
        }
        if !path.is_dir() {
            return Err(anyhow!("store path is not a directory"));
        }

        let dir_lock = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join("lock"))?
            .lock()?;

        let mut header_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join("info"))?;
        let header = load_store_header(&mut header_file, options.page_size)?;
        drop(header_file);
        if header.version != 0 {
            return Err(anyhow!("unsupported store version {}", header.version));
        }
        let page_size = header.page_size as usize;

        let double_buff_f = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join("doublewrite.dat"))?;
        let pager = Arc::new(Pager::new(double_buff_f, page_size, options.cache_pages)?);

        let containers = Arc::new(Containers::load_existing(path, pager.clone())?);
        let result = recover(&path.join("log"), &containers)?;
        let next_txid = Arc::new(AtomicU64::new(result.next_txid.get()));

        let reclaim = Reclaimer::start(containers.clone(), result.wal.clone(), next_txid.clone());

        // Drops that committed but were never stubbified (a crash beat the
        // reclaimer to it) are picked up again here.
        for cid in containers.committed_dropped()? {
            log::debug!("re-queueing stubbification of container {}", cid.get());
            containers.mark_dead(cid);
            reclaim.enqueue(vec![ReclaimAction::PurgeContainer(cid)]);
        }

        // Everything replayed is flushed now, so older log files are dead
        // weight.
        pager.checkpoint()?;
        result
            .wal
            .delete_files_before(result.wal.end_instant().file_number())?;

        Ok(Self {
            inner: Arc::new(StoreInner {
                pager,
                wal: result.wal,
                containers,
                locks: LockTable::new(),
                next_txid,
                active: Mutex::new(HashMap::new()),
                reclaim,
            }),
            _dir_lock: dir_lock,
        })
    }

    pub fn begin(&self) -> Tx<'_> {
        Tx::new(&self.inner)
    }

    /// Flushes all dirty pages (WAL first) and retires log files no live
    /// transaction can still need. No checkpoint record is involved;
    /// recovery never depends on one.
    pub fn checkpoint(&self) -> anyhow::Result<()> {
        self.inner.pager.checkpoint()?;
        let bound = {
            let active = self.inner.active.lock();
            active
                .values()
                .min()
                .copied()
                .unwrap_or_else(|| self.inner.wal.end_instant())
        };
        self.inner.wal.delete_files_before(bound.file_number())
    }

    /// Rotates the log to a fresh file, mainly so tests can exercise
    /// recovery across a file boundary.
    pub fn switch_log_file(&self) -> anyhow::Result<()> {
        self.inner.wal.switch_log_file()
    }

    /// Oldest appended-but-unflushed position, for checkpoint bookkeeping.
    pub fn first_unflushed_instant(&self) -> u64 {
        self.inner.wal.first_unflushed().get()
    }

    pub fn shutdown(self) -> anyhow::Result<()> {
        self.inner.reclaim.shutdown();
        self.inner.pager.checkpoint()?;
        self.inner.wal.flush_all()?;
        Ok(())
    }
}

const STORE_HEADER_SIZE: usize = 24;
const DEFAULT_PAGE_SIZE: usize = 0x1000;
const MAGIC_HEADER: &[u8] = b"slotdb00";

struct StoreHeader {
    version: u32,
    page_size: u32,
}

impl StoreHeader {
    fn encode(&self, buff: &mut [u8]) {
        buff[0..8].copy_from_slice(MAGIC_HEADER);
        buff[8..12].copy_from_slice(&self.version.to_be_bytes());
        buff[12..16].copy_from_slice(&self.page_size.to_be_bytes());
        let checksum = crc64::crc64(0x1d0f, &buff[0..16]);
        buff[16..24].copy_from_slice(&checksum.to_be_bytes());
    }

    fn decode(buff: &[u8]) -> Option<Self> {
        let checksum = crc64::crc64(0x1d0f, &buff[0..STORE_HEADER_SIZE - 8]);
        if checksum != buff[STORE_HEADER_SIZE - 8..].read_u64() {
            return None;
        }
        Some(Self {
            version: buff[8..].read_u32(),
            page_size: buff[12..].read_u32(),
        })
    }
}

/// The store header is written twice so a torn write of one copy leaves
/// the other readable.
fn load_store_header(f: &mut File, default_page_size: usize) -> anyhow::Result<StoreHeader> {
    let size = f.metadata()?.len();
    if size < 2 * STORE_HEADER_SIZE as u64 {
        let header = StoreHeader {
            version: 0,
            page_size: default_page_size as u32,
        };
        let mut buff = vec![0; 2 * STORE_HEADER_SIZE];
        header.encode(&mut buff[..STORE_HEADER_SIZE]);
        header.encode(&mut buff[STORE_HEADER_SIZE..]);
        f.seek(SeekFrom::Start(0))?;
        f.write_all(&buff)?;
        f.sync_all()?;
        return Ok(header);
    }

    let mut buff = vec![0; 2 * STORE_HEADER_SIZE];
    f.seek(SeekFrom::Start(0))?;
    f.read_exact(&mut buff)?;

    if buff[..8].cmp(MAGIC_HEADER).is_ne() {
        return Err(anyhow!("the info file is not a store header"));
    }

    StoreHeader::decode(&buff[..STORE_HEADER_SIZE])
        .or_else(|| StoreHeader::decode(&buff[STORE_HEADER_SIZE..]))
        .ok_or_else(|| anyhow!("store is corrupted, both header copies are broken"))
}
