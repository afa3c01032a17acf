use crate::error::StoreError;
use crate::id::{ContainerId, PageId, TxId};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet};

/// Transactional lock modes. Update locks are taken by scans that intend
/// to delete or update what they read: compatible with already-granted
/// shared locks, but blocking everything that arrives after them.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum LockMode {
    Shared,
    Update,
    Exclusive,
}

impl LockMode {
    fn compatible_with(&self, held: LockMode) -> bool {
        matches!(
            (self, held),
            (LockMode::Shared, LockMode::Shared) | (LockMode::Update, LockMode::Shared)
        )
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) enum Lockable {
    Container(ContainerId),
    Row(ContainerId, PageId, u32),
}

#[derive(Copy, Clone, Debug)]
struct Holder {
    txid: TxId,
    mode: LockMode,
    /// Transaction-local acquisition counter; savepoint rollback releases
    /// every lock with a higher mark.
    mark: u64,
}

struct LockInner {
    locks: HashMap<Lockable, Vec<Holder>>,
    /// Which transactions each blocked transaction is waiting on right now.
    waits: HashMap<TxId, HashSet<TxId>>,
}

/// Two-phase row/container lock table. Locks are held until commit or
/// abort (or a savepoint rollback past their mark). Page latches must
/// never be held while calling into here.
pub(crate) struct LockTable {
    inner: Mutex<LockInner>,
    cond: Condvar,
}

impl LockTable {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(LockInner {
                locks: HashMap::default(),
                waits: HashMap::default(),
            }),
            cond: Condvar::new(),
        }
    }

    /// Acquires `target` in `mode`, blocking until compatible. A wait that
    /// would close a cycle in the waits-for graph fails with
    /// `StoreError::Deadlock` instead of blocking.
    pub(crate) fn lock(
        &self,
        txid: TxId,
        target: Lockable,
        mode: LockMode,
        mark: u64,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        loop {
            let holders = inner.locks.entry(target).or_default();

            if let Some(own) = holders.iter_mut().find(|h| h.txid == txid) {
                if own.mode >= mode {
                    return Ok(());
                }
                // Upgrade: only other holders matter.
                let blockers: HashSet<TxId> = holders
                    .iter()
                    .filter(|h| h.txid != txid && !mode.compatible_with(h.mode))
                    .map(|h| h.txid)
                    .collect();
                if blockers.is_empty() {
                    let own = holders.iter_mut().find(|h| h.txid == txid).unwrap();
                    own.mode = mode;
                    return Ok(());
                }
                if Self::closes_cycle(&inner.waits, txid, &blockers) {
                    return Err(StoreError::Deadlock.into());
                }
                inner.waits.insert(txid, blockers);
                self.cond.wait(&mut inner);
                inner.waits.remove(&txid);
                continue;
            }

            let blockers: HashSet<TxId> = holders
                .iter()
                .filter(|h| !mode.compatible_with(h.mode))
                .map(|h| h.txid)
                .collect();
            if blockers.is_empty() {
                holders.push(Holder { txid, mode, mark });
                return Ok(());
            }

            if Self::closes_cycle(&inner.waits, txid, &blockers) {
                return Err(StoreError::Deadlock.into());
            }
            inner.waits.insert(txid, blockers);
            self.cond.wait(&mut inner);
            inner.waits.remove(&txid);
        }
    }

    /// Would `txid` waiting on `blockers` complete a cycle? Walks the
    /// waits-for graph from each blocker looking for `txid`.
    fn closes_cycle(
        waits: &HashMap<TxId, HashSet<TxId>>,
        txid: TxId,
        blockers: &HashSet<TxId>,
    ) -> bool {
        let mut stack: Vec<TxId> = blockers.iter().copied().collect();
        let mut seen: HashSet<TxId> = HashSet::default();
        while let Some(current) = stack.pop() {
            if current == txid {
                return true;
            }
            if !seen.insert(current) {
                continue;
            }
            if let Some(next) = waits.get(&current) {
                stack.extend(next.iter().copied());
            }
        }
        false
    }

    /// Releases every lock of the transaction, at commit or full abort.
    pub(crate) fn unlock_all(&self, txid: TxId) {
        let mut inner = self.inner.lock();
        inner.locks.retain(|_, holders| {
            holders.retain(|h| h.txid != txid);
            !holders.is_empty()
        });
        self.cond.notify_all();
    }

    /// Releases the locks acquired after a savepoint's mark, leaving the
    /// earlier ones held.
    pub(crate) fn release_after(&self, txid: TxId, mark: u64) {
        let mut inner = self.inner.lock();
        inner.locks.retain(|_, holders| {
            holders.retain(|h| h.txid != txid || h.mark <= mark);
            !holders.is_empty()
        });
        self.cond.notify_all();
    }

    /// Releases one lock early, for read-committed readers that do not
    /// keep their shared locks to commit.
    pub(crate) fn unlock_one(&self, txid: TxId, target: Lockable) {
        let mut inner = self.inner.lock();
        if let Some(holders) = inner.locks.get_mut(&target) {
            holders.retain(|h| h.txid != txid);
            if holders.is_empty() {
                inner.locks.remove(&target);
            }
        }
        self.cond.notify_all();
    }

    /// True when the transaction could acquire the lock right now without
    /// waiting. Used to decide whether a page latch must be released
    /// before blocking.
    pub(crate) fn would_block(&self, txid: TxId, target: Lockable, mode: LockMode) -> bool {
        let inner = self.inner.lock();
        let Some(holders) = inner.locks.get(&target) else {
            return false;
        };
        if let Some(own) = holders.iter().find(|h| h.txid == txid) {
            if own.mode >= mode {
                return false;
            }
            return holders
                .iter()
                .any(|h| h.txid != txid && !mode.compatible_with(h.mode));
        }
        holders.iter().any(|h| !mode.compatible_with(h.mode))
    }

    #[cfg(test)]
    fn waiting_count(&self) -> usize {
        self.inner.lock().waits.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn tx(n: u64) -> TxId {
        TxId::new(n).unwrap()
    }

    fn row(n: u64) -> Lockable {
        Lockable::Row(
            ContainerId::new(1).unwrap(),
            PageId::new(2).unwrap(),
            n as u32,
        )
    }

    #[test]
    fn test_shared_locks_coexist() {
        let table = LockTable::new();
        table.lock(tx(1), row(1), LockMode::Shared, 0).unwrap();
        table.lock(tx(2), row(1), LockMode::Shared, 0).unwrap();
        assert!(table.would_block(tx(3), row(1), LockMode::Exclusive));
        assert!(!table.would_block(tx(3), row(1), LockMode::Shared));
        table.unlock_all(tx(1));
        table.unlock_all(tx(2));
        assert!(!table.would_block(tx(3), row(1), LockMode::Exclusive));
    }

    #[test]
    fn test_release_after_mark() {
        let table = LockTable::new();
        table.lock(tx(1), row(1), LockMode::Exclusive, 1).unwrap();
        table.lock(tx(1), row(2), LockMode::Exclusive, 2).unwrap();
        table.release_after(tx(1), 1);
        assert!(!table.would_block(tx(2), row(2), LockMode::Exclusive));
        assert!(table.would_block(tx(2), row(1), LockMode::Exclusive));
        table.unlock_all(tx(1));
    }

    #[test]
    fn test_deadlock_detected() {
        let table = Arc::new(LockTable::new());
        table.lock(tx(1), row(1), LockMode::Exclusive, 0).unwrap();
        table.lock(tx(2), row(2), LockMode::Exclusive, 0).unwrap();

        let t2 = {
            let table = table.clone();
            std::thread::spawn(move || {
                // Blocks on tx 1 until the deadlock is resolved.
                let result = table.lock(tx(2), row(1), LockMode::Exclusive, 0);
                result.is_ok()
            })
        };

        while table.waiting_count() == 0 {
            std::thread::sleep(Duration::from_millis(1));
        }

        // tx1 -> tx2 would close the cycle tx2 -> tx1.
        let err = table
            .lock(tx(1), row(2), LockMode::Exclusive, 0)
            .expect_err("deadlock should be detected");
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::Deadlock)
        ));

        // The victim rolls back, releasing its locks; tx 2 proceeds.
        table.unlock_all(tx(1));
        assert!(t2.join().unwrap());
    }
}
