use std::num::NonZeroU64;

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TxId(NonZeroU64);

impl TxId {
    #[inline]
    pub(crate) fn new(id: u64) -> Option<Self> {
        NonZeroU64::new(id).map(Self)
    }

    #[inline]
    pub(crate) fn next(&self) -> Self {
        Self(self.0.checked_add(1).unwrap())
    }

    #[inline]
    pub(crate) fn from_be_bytes(txid: [u8; 8]) -> Option<Self> {
        Self::new(u64::from_be_bytes(txid))
    }

    #[inline]
    pub fn get(self) -> u64 {
        self.0.get()
    }
}

pub(crate) trait TxIdExt {
    fn to_be_bytes(&self) -> [u8; 8];
}

impl TxIdExt for TxId {
    #[inline]
    fn to_be_bytes(&self) -> [u8; 8] {
        self.0.get().to_be_bytes()
    }
}

impl TxIdExt for Option<TxId> {
    #[inline]
    fn to_be_bytes(&self) -> [u8; 8] {
        if let Some(txid) = self {
            txid.to_be_bytes()
        } else {
            0u64.to_be_bytes()
        }
    }
}

/// Position of a log record: a `(file number, file offset)` pair packed into
/// a u64 so that ordinary integer ordering is log order.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LogInstant(NonZeroU64);

impl LogInstant {
    /// Sentinel `undo_next` for a compensation record whose original
    /// operation was the first of its transaction: undo is finished once it
    /// is reached.
    pub(crate) const END_OF_UNDO: LogInstant = match NonZeroU64::new(u64::MAX) {
        Some(v) => LogInstant(v),
        None => unreachable!(),
    };

    #[inline]
    pub(crate) fn new(file_number: u32, offset: u32) -> Self {
        let packed = (u64::from(file_number) << 32) | u64::from(offset);
        Self(NonZeroU64::new(packed).expect("log file 0 offset 0 is reserved"))
    }

    #[inline]
    pub(crate) fn file_number(&self) -> u32 {
        (self.0.get() >> 32) as u32
    }

    #[inline]
    pub(crate) fn offset(&self) -> u32 {
        self.0.get() as u32
    }

    #[inline]
    pub fn get(&self) -> u64 {
        self.0.get()
    }

    #[inline]
    pub(crate) fn from_be_bytes(raw: [u8; 8]) -> Option<Self> {
        NonZeroU64::new(u64::from_be_bytes(raw)).map(Self)
    }
}

pub(crate) trait LogInstantExt {
    fn to_be_bytes(&self) -> [u8; 8];
}

impl LogInstantExt for LogInstant {
    #[inline]
    fn to_be_bytes(&self) -> [u8; 8] {
        self.0.get().to_be_bytes()
    }
}

impl LogInstantExt for Option<LogInstant> {
    #[inline]
    fn to_be_bytes(&self) -> [u8; 8] {
        if let Some(instant) = self {
            instant.to_be_bytes()
        } else {
            0u64.to_be_bytes()
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageId(NonZeroU64);

/// Data pages start here; page 1 of every container file is its header.
pub const FIRST_PAGE_NUMBER: u64 = 2;

impl PageId {
    pub(crate) fn new(id: u64) -> Option<Self> {
        NonZeroU64::new(id).map(Self)
    }

    pub fn get(&self) -> u64 {
        self.0.get()
    }

    pub(crate) fn from_be_bytes(pgid: [u8; 8]) -> Option<Self> {
        Self::new(u64::from_be_bytes(pgid))
    }
}

pub(crate) trait PageIdExt {
    fn to_be_bytes(&self) -> [u8; 8];
}

impl PageIdExt for PageId {
    fn to_be_bytes(&self) -> [u8; 8] {
        self.0.get().to_be_bytes()
    }
}
impl PageIdExt for Option<PageId> {
    fn to_be_bytes(&self) -> [u8; 8] {
        if let Some(pgid) = self {
            pgid.to_be_bytes()
        } else {
            0u64.to_be_bytes()
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContainerId(NonZeroU64);

impl ContainerId {
    pub(crate) fn new(id: u64) -> Option<Self> {
        NonZeroU64::new(id).map(Self)
    }

    pub fn get(&self) -> u64 {
        self.0.get()
    }

    pub(crate) fn from_be_bytes(cid: [u8; 8]) -> Option<Self> {
        Self::new(u64::from_be_bytes(cid))
    }
}

pub(crate) trait ContainerIdExt {
    fn to_be_bytes(&self) -> [u8; 8];
}

impl ContainerIdExt for ContainerId {
    fn to_be_bytes(&self) -> [u8; 8] {
        self.0.get().to_be_bytes()
    }
}
impl ContainerIdExt for Option<ContainerId> {
    fn to_be_bytes(&self) -> [u8; 8] {
        if let Some(cid) = self {
            cid.to_be_bytes()
        } else {
            0u64.to_be_bytes()
        }
    }
}

/// Per-page record id. Handed out by the page header's counter and, unless
/// the container was created with `reuse_record_ids`, never reused on that
/// page even after the record is purged.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordId(u32);

/// Slot numbering starts at 0 on every page.
pub const FIRST_SLOT: usize = 0;

impl RecordId {
    #[inline]
    pub(crate) fn new(id: u32) -> Self {
        Self(id)
    }

    #[inline]
    pub fn get(&self) -> u32 {
        self.0
    }
}

/// A stable reference to a row piece, or one of the named sentinels that can
/// never resolve to a real row. Every record API matches on this first and
/// rejects sentinel access with `StoreError::RecordNotFound`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum RecordHandle {
    Valid { page: PageId, id: RecordId },
    ReservedInsert,
    ReservedScan,
    DeallocProtection,
    PreviousKey,
}

impl RecordHandle {
    #[inline]
    pub(crate) fn valid(page: PageId, id: RecordId) -> Self {
        Self::Valid { page, id }
    }

    #[inline]
    pub fn resolve(&self) -> Option<(PageId, RecordId)> {
        if let Self::Valid { page, id } = self {
            Some((*page, *id))
        } else {
            None
        }
    }
}
