use thiserror::Error;

/// How much state an error invalidates. The transaction layer is the
/// boundary that turns a `Transaction`-severity error into a rollback;
/// `Statement`-severity errors leave the transaction usable.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Statement,
    Transaction,
    System,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record does not fit, even after overflow was considered")]
    NoSpace,

    #[error("record not found")]
    RecordNotFound,

    #[error("slot {slot} is out of range, page has {count} slots")]
    SlotOutOfRange { slot: usize, count: usize },

    #[error("record id allocation would overflow on the destination page")]
    RecordIdOverflow,

    #[error("record is already in the requested delete state")]
    DeleteMismatch,

    #[error("no savepoint named {0:?} in this transaction")]
    InvalidSavepoint(String),

    #[error("savepoint {0:?} already exists in this transaction")]
    DuplicateSavepoint(String),

    #[error("duplicate key in unique index")]
    DuplicateKey,

    #[error("container {0} does not exist or has been dropped")]
    ContainerNotFound(u64),

    #[error("container {0} is marked dropped")]
    ContainerDropped(u64),

    #[error("deadlock detected while waiting for a lock")]
    Deadlock,

    #[error("log is corrupted past the last verified record")]
    LogCorrupt,
}

impl StoreError {
    pub fn severity(&self) -> Severity {
        match self {
            StoreError::NoSpace
            | StoreError::RecordNotFound
            | StoreError::SlotOutOfRange { .. }
            | StoreError::RecordIdOverflow
            | StoreError::DeleteMismatch
            | StoreError::InvalidSavepoint(_)
            | StoreError::DuplicateSavepoint(_)
            | StoreError::DuplicateKey
            | StoreError::ContainerNotFound(_)
            | StoreError::ContainerDropped(_) => Severity::Statement,

            StoreError::Deadlock => Severity::Transaction,

            StoreError::LogCorrupt => Severity::System,
        }
    }
}

/// True when `err` bottoms out in the given store error predicate. Callers
/// use this to route statement-severity failures without unwinding the
/// transaction.
pub fn is_store_error(err: &anyhow::Error, pred: impl Fn(&StoreError) -> bool) -> bool {
    err.downcast_ref::<StoreError>().map(pred).unwrap_or(false)
}
