use slotdb::{ContainerOptions, InsertFlags, Options, RecordHandle, Row, Store, StoreError};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Once;

static INIT: Once = Once::new();
fn setup() {
    INIT.call_once(|| {
        env_logger::init();
    });
}

fn row(columns: &[&[u8]]) -> Row {
    Row::new(columns.iter().map(|c| c.to_vec()).collect())
}

fn open_store(dir: &Path) -> Store {
    Store::open(dir, Options::default()).unwrap()
}

fn log_file(dir: &Path) -> std::path::PathBuf {
    dir.join("log").join("log1.dat")
}

fn log_len(dir: &Path) -> u64 {
    std::fs::metadata(log_file(dir)).unwrap().len()
}

/// The record is gone: either the insert never replayed, or its rollback
/// left a delete mark.
fn assert_not_visible(container: &slotdb::Container, handle: RecordHandle) {
    match container.fetch(handle) {
        Ok(None) => (),
        Ok(Some(r)) => panic!("rolled-back record is visible: {r:?}"),
        Err(err) => assert!(
            matches!(
                err.downcast_ref::<StoreError>(),
                Some(StoreError::RecordNotFound)
            ),
            "unexpected error: {err}"
        ),
    }
}

#[test]
fn test_recovery_replays_committed_work() {
    setup();
    let dir = tempfile::tempdir().unwrap();

    let (cid, handles) = {
        let store = open_store(dir.path());
        let mut tx = store.begin();
        let cid = tx.create_container(ContainerOptions::default()).unwrap();
        let container = tx.open_container(cid).unwrap().unwrap();
        let mut handles = Vec::new();
        for i in 0..50u32 {
            let r = Row::new(vec![i.to_be_bytes().to_vec(), vec![i as u8; 120]]);
            handles.push(container.insert(&r, InsertFlags::default()).unwrap());
        }
        drop(container);
        tx.commit().unwrap();
        // No shutdown: the page cache dies with the process, the log does
        // not.
        drop(tx);
        drop(store);
        (cid, handles)
    };

    let store = open_store(dir.path());
    let tx = store.begin();
    let container = tx.open_container(cid).unwrap().unwrap();
    for (i, handle) in handles.iter().enumerate() {
        let expect = Row::new(vec![(i as u32).to_be_bytes().to_vec(), vec![i as u8; 120]]);
        assert_eq!(Some(expect), container.fetch(*handle).unwrap());
    }
    drop(container);
    drop(tx);
    store.shutdown().unwrap();
}

#[test]
fn test_recovery_rolls_back_losers() {
    setup();
    let dir = tempfile::tempdir().unwrap();

    let (cid, committed, lost) = {
        let store = open_store(dir.path());
        let mut tx = store.begin();
        let cid = tx.create_container(ContainerOptions::default()).unwrap();
        let container = tx.open_container(cid).unwrap().unwrap();
        let committed = container.insert(&row(&[b"winner"]), InsertFlags::default()).unwrap();
        drop(container);
        tx.commit().unwrap();

        let tx2 = store.begin();
        let container = tx2.open_container(cid).unwrap().unwrap();
        let lost = container.insert(&row(&[b"loser"]), InsertFlags::default()).unwrap();
        drop(container);
        // Force the uncommitted work durably into log and pages, then
        // crash without commit.
        store.checkpoint().unwrap();
        std::mem::forget(tx2);
        drop(tx);
        drop(store);
        (cid, committed, lost)
    };

    let store = open_store(dir.path());
    let tx = store.begin();
    let container = tx.open_container(cid).unwrap().unwrap();
    assert_eq!(Some(row(&[b"winner"])), container.fetch(committed).unwrap());
    assert_not_visible(&container, lost);
    drop(container);
    drop(tx);
    store.shutdown().unwrap();
}

fn build_two_tx_log(dir: &Path) -> (slotdb::ContainerId, RecordHandle, RecordHandle, u64, u64) {
    let store = open_store(dir);
    let mut tx = store.begin();
    let cid = tx.create_container(ContainerOptions::default()).unwrap();
    let container = tx.open_container(cid).unwrap().unwrap();
    let keep = container.insert(&row(&[b"durable"]), InsertFlags::default()).unwrap();
    drop(container);
    tx.commit().unwrap();
    let len_before = log_len(dir);

    drop(tx);
    let mut tx = store.begin();
    let container = tx.open_container(cid).unwrap().unwrap();
    let torn = container.insert(&row(&[b"torn away"]), InsertFlags::default()).unwrap();
    drop(container);
    tx.commit().unwrap();
    let len_after = log_len(dir);
    drop(tx);
    drop(store);
    assert!(len_after > len_before);
    (cid, keep, torn, len_before, len_after)
}

fn truncate_log(dir: &Path, len: u64) {
    let f = std::fs::OpenOptions::new()
        .write(true)
        .open(log_file(dir))
        .unwrap();
    f.set_len(len).unwrap();
    f.sync_all().unwrap();
}

#[test]
fn test_recovery_tolerates_torn_tail() {
    setup();

    // Truncating anywhere before the second transaction's commit record
    // makes it a loser while everything committed before stays intact.
    for cut_forward in [1u64, 10, 40] {
        let dir = tempfile::tempdir().unwrap();
        let (cid, keep, torn, len_before, len_after) = build_two_tx_log(dir.path());

        truncate_log(dir.path(), (len_before + cut_forward).min(len_after - 1));

        let store = open_store(dir.path());
        let tx = store.begin();
        let container = tx.open_container(cid).unwrap().unwrap();
        assert_eq!(
            Some(row(&[b"durable"])),
            container.fetch(keep).unwrap(),
            "cut_forward={cut_forward}"
        );
        assert_not_visible(&container, torn);
        drop(container);
        drop(tx);
        store.shutdown().unwrap();
    }

    // Tearing only the trailing end record leaves the commit intact: the
    // transaction keeps its effects.
    let dir = tempfile::tempdir().unwrap();
    let (cid, keep, torn, _, len_after) = build_two_tx_log(dir.path());
    truncate_log(dir.path(), len_after - 1);

    let store = open_store(dir.path());
    let tx = store.begin();
    let container = tx.open_container(cid).unwrap().unwrap();
    assert_eq!(Some(row(&[b"durable"])), container.fetch(keep).unwrap());
    assert_eq!(Some(row(&[b"torn away"])), container.fetch(torn).unwrap());
    drop(container);
    drop(tx);
    store.shutdown().unwrap();
}

#[test]
fn test_recovery_detects_interior_corruption() {
    setup();
    let dir = tempfile::tempdir().unwrap();

    let (cid, keep, broken, len_before, len_after) = {
        let store = open_store(dir.path());
        let mut tx = store.begin();
        let cid = tx.create_container(ContainerOptions::default()).unwrap();
        let container = tx.open_container(cid).unwrap().unwrap();
        let keep = container.insert(&row(&[b"sound"]), InsertFlags::default()).unwrap();
        drop(container);
        tx.commit().unwrap();
        let len_before = log_len(dir.path());

        drop(tx);
        let mut tx = store.begin();
        let container = tx.open_container(cid).unwrap().unwrap();
        let broken = container
            .insert(&row(&[b"about to be flipped"]), InsertFlags::default())
            .unwrap();
        drop(container);
        tx.commit().unwrap();
        let len_after = log_len(dir.path());
        drop(tx);
        drop(store);
        (cid, keep, broken, len_before, len_after)
    };

    // Flip bytes inside the committed tail: the framing still parses, only
    // the checksum can catch this.
    let mut f = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(log_file(dir.path()))
        .unwrap();
    let target = len_before + (len_after - len_before) / 2;
    f.seek(SeekFrom::Start(target)).unwrap();
    let mut bytes = [0u8; 3];
    f.read_exact(&mut bytes).unwrap();
    for b in &mut bytes {
        *b ^= 0x5a;
    }
    f.seek(SeekFrom::Start(target)).unwrap();
    f.write_all(&bytes).unwrap();
    f.sync_all().unwrap();
    drop(f);

    // Recovery must stop cleanly at the corruption, not misread past it.
    let store = open_store(dir.path());
    let tx = store.begin();
    let container = tx.open_container(cid).unwrap().unwrap();
    assert_eq!(Some(row(&[b"sound"])), container.fetch(keep).unwrap());
    assert_not_visible(&container, broken);
    drop(container);
    drop(tx);
    store.shutdown().unwrap();
}

#[test]
fn test_recovery_across_log_switch() {
    setup();
    let dir = tempfile::tempdir().unwrap();

    let (cid, first, second) = {
        let store = open_store(dir.path());
        let mut tx = store.begin();
        let cid = tx.create_container(ContainerOptions::default()).unwrap();
        let container = tx.open_container(cid).unwrap().unwrap();
        let first = container.insert(&row(&[b"file one"]), InsertFlags::default()).unwrap();
        drop(container);
        tx.commit().unwrap();

        // No checkpoint record is written at the switch; recovery must
        // scan both files regardless.
        store.switch_log_file().unwrap();

        drop(tx);
        let mut tx = store.begin();
        let container = tx.open_container(cid).unwrap().unwrap();
        let second = container.insert(&row(&[b"file two"]), InsertFlags::default()).unwrap();
        drop(container);
        tx.commit().unwrap();
        drop(tx);
        drop(store);
        (cid, first, second)
    };

    assert!(dir.path().join("log").join("log2.dat").exists());

    let store = open_store(dir.path());
    let tx = store.begin();
    let container = tx.open_container(cid).unwrap().unwrap();
    assert_eq!(Some(row(&[b"file one"])), container.fetch(first).unwrap());
    assert_eq!(Some(row(&[b"file two"])), container.fetch(second).unwrap());
    drop(container);
    drop(tx);
    store.shutdown().unwrap();
}

#[test]
fn test_recovery_after_partial_rollback() {
    setup();
    let dir = tempfile::tempdir().unwrap();

    let (cid, before_sp, after_sp, bystander) = {
        let store = open_store(dir.path());
        let mut tx = store.begin();
        let cid = tx.create_container(ContainerOptions::default()).unwrap();
        tx.commit().unwrap();

        drop(tx);
        let mut tx = store.begin();
        let container = tx.open_container(cid).unwrap().unwrap();
        let before_sp = container.insert(&row(&[b"before"]), InsertFlags::default()).unwrap();
        drop(container);
        tx.set_savepoint("sp").unwrap();
        let container = tx.open_container(cid).unwrap().unwrap();
        let after_sp = container.insert(&row(&[b"after"]), InsertFlags::default()).unwrap();
        drop(container);
        // Emits compensation records for the post-savepoint work.
        tx.rollback_to_savepoint("sp").unwrap();

        // Another commit makes those compensations durable.
        let mut tx2 = store.begin();
        let container = tx2.open_container(cid).unwrap().unwrap();
        let bystander = container.insert(&row(&[b"bystander"]), InsertFlags::default()).unwrap();
        drop(container);
        tx2.commit().unwrap();

        // Crash with the savepoint's owner still open: recovery must undo
        // its remaining work exactly once, skipping what the compensation
        // records already undid.
        std::mem::forget(tx);
        drop(tx2);
        drop(store);
        (cid, before_sp, after_sp, bystander)
    };

    let store = open_store(dir.path());
    let tx = store.begin();
    let container = tx.open_container(cid).unwrap().unwrap();
    assert_not_visible(&container, before_sp);
    assert_not_visible(&container, after_sp);
    assert_eq!(Some(row(&[b"bystander"])), container.fetch(bystander).unwrap());
    drop(container);
    drop(tx);
    store.shutdown().unwrap();
}

#[test]
fn test_recovery_of_container_lifecycle() {
    setup();
    let dir = tempfile::tempdir().unwrap();

    // An uncommitted create disappears at recovery.
    let doomed = {
        let store = open_store(dir.path());
        let tx = store.begin();
        let cid = tx.create_container(ContainerOptions::default()).unwrap();
        store.checkpoint().unwrap();
        std::mem::forget(tx);
        drop(store);
        cid
    };

    {
        let store = open_store(dir.path());
        let tx = store.begin();
        assert!(tx.open_container(doomed).unwrap().is_none());
        drop(tx);
        store.shutdown().unwrap();
    }

    // A committed drop stays dropped across a crash, even if the
    // stubbification never got to run.
    let dropped = {
        let store = open_store(dir.path());
        let mut tx = store.begin();
        let cid = tx.create_container(ContainerOptions::default()).unwrap();
        let container = tx.open_container(cid).unwrap().unwrap();
        container.insert(&row(&[b"short lived"]), InsertFlags::default()).unwrap();
        drop(container);
        tx.commit().unwrap();

        drop(tx);
        let mut tx = store.begin();
        tx.drop_container(cid).unwrap();
        tx.commit().unwrap();
        drop(tx);
        store.shutdown().unwrap();
        cid
    };

    let store = open_store(dir.path());
    let tx = store.begin();
    assert!(tx.open_container(dropped).unwrap().is_none());
    drop(tx);
    store.shutdown().unwrap();
}

#[test]
fn test_first_unflushed_tracks_flushes() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path());

    let mark = store.first_unflushed_instant();
    let mut tx = store.begin();
    let cid = tx.create_container(ContainerOptions::default()).unwrap();
    let container = tx.open_container(cid).unwrap().unwrap();
    container.insert(&row(&[b"x"]), InsertFlags::default()).unwrap();
    drop(container);
    // Commit flushes, so the first unflushed position moves forward.
    tx.commit().unwrap();
    assert!(store.first_unflushed_instant() > mark);

    drop(tx);
    store.shutdown().unwrap();
}
