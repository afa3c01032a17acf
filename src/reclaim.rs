use crate::container::Containers;
use crate::id::{ContainerId, PageId, TxId};
use crate::log::LogOp;
use crate::wal::{record_mutation, LogContext, TxChain, Wal};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::SyncSender;
use std::sync::Arc;
use std::thread::JoinHandle;

/// Space released by a committed transaction. Applied strictly after the
/// commit is durable, so a crash can never reclaim pages an in-doubt
/// transaction still needs.
#[derive(Debug)]
pub(crate) enum ReclaimAction {
    FreePage(ContainerId, PageId),
    PurgeContainer(ContainerId),
}

/// The post-commit daemon: a bounded queue drained by one background
/// thread. Each batch runs as its own short internal transaction whose
/// records are redo-only, so a crash mid-batch just drops the remaining
/// work (it is rediscovered, for containers, at the next startup).
pub(crate) struct Reclaimer {
    sender: Mutex<Option<SyncSender<Vec<ReclaimAction>>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Reclaimer {
    pub(crate) fn start(
        containers: Arc<Containers>,
        wal: Arc<Wal>,
        next_txid: Arc<AtomicU64>,
    ) -> Self {
        let (sender, receiver) = std::sync::mpsc::sync_channel::<Vec<ReclaimAction>>(256);
        let handle = std::thread::spawn(move || {
            while let Ok(actions) = receiver.recv() {
                let txid = TxId::new(next_txid.fetch_add(1, Ordering::SeqCst)).unwrap();
                if let Err(err) = apply_batch(&containers, &wal, txid, &actions) {
                    log::error!("post-commit reclamation failed: {err}");
                }
            }
        });

        Self {
            sender: Mutex::new(Some(sender)),
            handle: Mutex::new(Some(handle)),
        }
    }

    pub(crate) fn enqueue(&self, actions: Vec<ReclaimAction>) {
        let sender = self.sender.lock();
        if let Some(sender) = sender.as_ref() {
            if sender.send(actions).is_err() {
                log::error!("reclaimer is gone, dropping post-commit work");
            }
        }
    }

    /// Drains the queue and stops the worker.
    pub(crate) fn shutdown(&self) {
        let sender = self.sender.lock().take();
        drop(sender);
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                log::error!("cannot join reclaimer thread");
            }
        }
    }
}

fn apply_batch(
    containers: &Containers,
    wal: &Wal,
    txid: TxId,
    actions: &[ReclaimAction],
) -> anyhow::Result<()> {
    log::debug!("reclaiming {} actions under {txid:?}", actions.len());
    let chain = TxChain::new(txid);
    record_mutation(LogContext::Runtime(wal, &chain), LogOp::TxBegin)?;

    for action in actions {
        // Redo-only records: should this internal transaction lose a race
        // with a crash, recovery skips them during undo instead of trying
        // to resurrect reclaimed space.
        let ctx = LogContext::Undo(wal, &chain, None);
        match action {
            ReclaimAction::FreePage(cid, pgid) => {
                containers.free_page(ctx, *cid, *pgid)?;
            }
            ReclaimAction::PurgeContainer(cid) => {
                containers.purge_container(ctx, *cid)?;
            }
        }
    }

    record_mutation(LogContext::Runtime(wal, &chain), LogOp::TxCommit)?;
    record_mutation(LogContext::Runtime(wal, &chain), LogOp::TxEnd)?;
    wal.flush_all()?;
    Ok(())
}
