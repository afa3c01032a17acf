use slotdb::{
    temp_mode, ContainerOptions, InsertFlags, Options, RecordHandle, Row, Store, StoreError,
};
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

fn open_store(dir: &std::path::Path) -> Store {
    Store::open(dir, Options::default()).unwrap()
}

#[test]
fn test_insert_fetch_roundtrip() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path());

    let mut tx = store.begin();
    let cid = tx.create_container(ContainerOptions::default()).unwrap();
    let container = tx.open_container(cid).unwrap().unwrap();

    let shapes = vec![
        row(&[]),
        row(&[b"a"]),
        row(&[b"hello", b"world"]),
        row(&[&[0u8; 100], &[1u8; 200], b"tail"]),
        Row::new(vec![vec![7u8; 900], vec![], vec![3u8; 250]]),
    ];

    let mut handles = Vec::new();
    for r in &shapes {
        let handle = container.insert(r, InsertFlags::default()).unwrap();
        handles.push(handle);
    }
    for (r, handle) in shapes.iter().zip(&handles) {
        assert_eq!(Some(r.clone()), container.fetch(*handle).unwrap());
    }
    drop(container);
    tx.commit().unwrap();

    // Still there after commit, in a fresh transaction.
    let tx = store.begin();
    let container = tx.open_container(cid).unwrap().unwrap();
    for (r, handle) in shapes.iter().zip(&handles) {
        assert_eq!(Some(r.clone()), container.fetch(*handle).unwrap());
    }
    drop(container);
    drop(tx);

    store.shutdown().unwrap();
}

#[test]
fn test_rollback_undoes_everything() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path());

    let mut tx = store.begin();
    let cid = tx.create_container(ContainerOptions::default()).unwrap();
    tx.commit().unwrap();

    let mut tx = store.begin();
    let container = tx.open_container(cid).unwrap().unwrap();
    let h1 = container.insert(&row(&[b"gone"]), InsertFlags::default()).unwrap();
    let h2 = container
        .insert(
            &row(&[b"gone too"]),
            InsertFlags {
                undo_with_purge: true,
                ..Default::default()
            },
        )
        .unwrap();
    drop(container);
    tx.abort().unwrap();

    let tx = store.begin();
    let container = tx.open_container(cid).unwrap().unwrap();
    // A plain insert rolls back to a delete-marked record.
    assert_eq!(None, container.fetch(h1).unwrap());
    // An undo-with-purge insert leaves no trace at all.
    let err = container.fetch(h2).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::RecordNotFound)
    ));
    drop(container);
    drop(tx);

    store.shutdown().unwrap();
}

#[test]
fn test_savepoints() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path());

    let mut tx = store.begin();
    let cid = tx.create_container(ContainerOptions::default()).unwrap();
    tx.commit().unwrap();

    let mut tx = store.begin();
    let container = tx.open_container(cid).unwrap().unwrap();
    let h1 = container.insert(&row(&[b"kept"]), InsertFlags::default()).unwrap();
    drop(container);

    assert_eq!(1, tx.set_savepoint("one").unwrap());
    let container = tx.open_container(cid).unwrap().unwrap();
    let h2 = container.insert(&row(&[b"undone"]), InsertFlags::default()).unwrap();
    drop(container);
    assert_eq!(2, tx.set_savepoint("two").unwrap());

    // Duplicate savepoint names are rejected.
    let err = tx.set_savepoint("one").unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::DuplicateSavepoint(_))
    ));

    assert_eq!(1, tx.rollback_to_savepoint("one").unwrap());
    let container = tx.open_container(cid).unwrap().unwrap();
    assert_eq!(Some(row(&[b"kept"])), container.fetch(h1).unwrap());
    assert_eq!(None, container.fetch(h2).unwrap());
    drop(container);

    // Rolling back again with nothing in between changes nothing.
    assert_eq!(1, tx.rollback_to_savepoint("one").unwrap());
    let container = tx.open_container(cid).unwrap().unwrap();
    assert_eq!(Some(row(&[b"kept"])), container.fetch(h1).unwrap());
    drop(container);

    // "two" went away with the rollback past it.
    let err = tx.rollback_to_savepoint("two").unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::InvalidSavepoint(_))
    ));

    assert_eq!(1, tx.release_savepoint("one").unwrap());
    let err = tx.rollback_to_savepoint("one").unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::InvalidSavepoint(_))
    ));

    tx.commit().unwrap();
    let tx = store.begin();
    let container = tx.open_container(cid).unwrap().unwrap();
    assert_eq!(Some(row(&[b"kept"])), container.fetch(h1).unwrap());
    drop(container);
    drop(tx);

    store.shutdown().unwrap();
}

#[test]
fn test_purge_and_reinsert_conserves_space() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path());

    let mut tx = store.begin();
    let cid = tx.create_container(ContainerOptions::default()).unwrap();
    let container = tx.open_container(cid).unwrap().unwrap();

    let pgid = container.add_page().unwrap();
    let sample = row(&[&[9u8; 64]]);
    let k = 10;
    for slot in 0..k {
        container
            .insert_at(pgid, slot, &sample, InsertFlags::default())
            .unwrap()
            .expect("page has space");
    }
    let pages_before = container.page_count().unwrap();
    assert_eq!(k, container.slot_count(pgid).unwrap());

    container.purge_at(pgid, 0, k, true).unwrap();
    assert_eq!(0, container.slot_count(pgid).unwrap());

    for slot in 0..k {
        container
            .insert_at(pgid, slot, &sample, InsertFlags::default())
            .unwrap()
            .expect("purged space is reusable");
    }
    assert_eq!(pages_before, container.page_count().unwrap());

    drop(container);
    tx.commit().unwrap();
    store.shutdown().unwrap();
}

#[test]
fn test_purge_bad_ranges_fail() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path());

    let mut tx = store.begin();
    let cid = tx.create_container(ContainerOptions::default()).unwrap();
    let container = tx.open_container(cid).unwrap().unwrap();
    let pgid = container.add_page().unwrap();
    container
        .insert_at(pgid, 0, &row(&[b"solo"]), InsertFlags::default())
        .unwrap()
        .unwrap();

    assert!(container.purge_at(pgid, 0, 2, true).is_err());
    assert!(container.purge_at(pgid, 0, 0, true).is_err());
    assert!(container.purge_at(pgid, 5, 1, true).is_err());

    drop(container);
    tx.commit().unwrap();
    store.shutdown().unwrap();
}

#[test]
fn test_copy_and_purge() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path());

    let mut tx = store.begin();
    let cid = tx.create_container(ContainerOptions::default()).unwrap();
    let container = tx.open_container(cid).unwrap().unwrap();
    let src = container.add_page().unwrap();
    let dest = container.add_page().unwrap();

    for i in 0..5u8 {
        container
            .insert_at(src, i as usize, &row(&[&[i; 16]]), InsertFlags::default())
            .unwrap()
            .unwrap();
    }

    // Bad ranges fail whole.
    assert!(container.copy_and_purge(src, dest, 0, 0, 0).is_err());
    assert!(container.copy_and_purge(src, dest, 3, 4, 0).is_err());
    assert_eq!(5, container.slot_count(src).unwrap());
    assert_eq!(0, container.slot_count(dest).unwrap());

    container.copy_and_purge(src, dest, 1, 3, 0).unwrap();
    assert_eq!(2, container.slot_count(src).unwrap());
    assert_eq!(3, container.slot_count(dest).unwrap());

    drop(container);
    tx.commit().unwrap();
    store.shutdown().unwrap();
}

#[test]
fn test_space_for_insert_is_exact() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path());

    let mut tx = store.begin();
    let cid = tx.create_container(ContainerOptions::default()).unwrap();
    let container = tx.open_container(cid).unwrap().unwrap();
    let pgid = container.add_page().unwrap();

    let filler = row(&[&[5u8; 200]]);
    let mut slot = 0;
    loop {
        let predicted = container.space_for_insert(pgid, &filler).unwrap();
        let inserted = container
            .insert_at(pgid, slot, &filler, InsertFlags::default())
            .unwrap();
        assert_eq!(predicted, inserted.is_some(), "at slot {slot}");
        if inserted.is_none() {
            break;
        }
        slot += 1;
    }

    drop(container);
    tx.commit().unwrap();
    store.shutdown().unwrap();
}

#[test]
fn test_page_timestamps() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path());

    let mut tx = store.begin();
    let cid = tx.create_container(ContainerOptions::default()).unwrap();
    let container = tx.open_container(cid).unwrap().unwrap();
    let pgid = container.add_page().unwrap();

    let stamp = container.current_time_stamp(pgid).unwrap();
    assert!(container.equal_time_stamp(pgid, stamp).unwrap());

    let handle = container
        .insert_at(pgid, 0, &row(&[b"tick"]), InsertFlags::default())
        .unwrap()
        .unwrap();
    assert!(!container.equal_time_stamp(pgid, stamp).unwrap());

    let stamp = container.current_time_stamp(pgid).unwrap();
    container.delete(handle, true).unwrap();
    assert!(!container.equal_time_stamp(pgid, stamp).unwrap());

    drop(container);
    tx.commit().unwrap();
    store.shutdown().unwrap();
}

#[test]
fn test_delete_state_mismatch_fails() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path());

    let mut tx = store.begin();
    let cid = tx.create_container(ContainerOptions::default()).unwrap();
    let container = tx.open_container(cid).unwrap().unwrap();
    let handle = container.insert(&row(&[b"x"]), InsertFlags::default()).unwrap();

    container.delete(handle, true).unwrap();
    let err = container.delete(handle, true).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::DeleteMismatch)
    ));

    container.delete(handle, false).unwrap();
    let err = container.delete(handle, false).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::DeleteMismatch)
    ));

    drop(container);
    tx.commit().unwrap();
    store.shutdown().unwrap();
}

#[test]
fn test_sentinel_handles_never_resolve() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path());

    let mut tx = store.begin();
    let cid = tx.create_container(ContainerOptions::default()).unwrap();
    let container = tx.open_container(cid).unwrap().unwrap();

    for sentinel in [
        RecordHandle::ReservedInsert,
        RecordHandle::ReservedScan,
        RecordHandle::DeallocProtection,
        RecordHandle::PreviousKey,
    ] {
        let err = container.fetch(sentinel).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::RecordNotFound)
        ));
        assert!(container.delete(sentinel, true).is_err());
        assert!(container.update(sentinel, &row(&[b"v"]), None).is_err());
    }

    drop(container);
    tx.commit().unwrap();
    store.shutdown().unwrap();
}

#[test]
fn test_long_rows_need_overflow() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path());

    let mut tx = store.begin();
    let cid = tx.create_container(ContainerOptions::default()).unwrap();
    let container = tx.open_container(cid).unwrap().unwrap();

    // 60 columns of 1200 bytes: far beyond a 4K page.
    let wide = Row::new((0..60).map(|i| vec![i as u8; 1200]).collect());
    let err = container.insert(&wide, InsertFlags::default()).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::NoSpace)
    ));

    let handle = container
        .insert(
            &wide,
            InsertFlags {
                overflow: true,
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(Some(wide.clone()), container.fetch(handle).unwrap());

    // One enormous column spanning many overflow pages.
    let long_col = Row::new(vec![(0..100_000u32).map(|i| i as u8).collect()]);
    let handle2 = container
        .insert(
            &long_col,
            InsertFlags {
                overflow: true,
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(Some(long_col.clone()), container.fetch(handle2).unwrap());

    drop(container);
    tx.commit().unwrap();

    let tx = store.begin();
    let container = tx.open_container(cid).unwrap().unwrap();
    assert_eq!(Some(wide), container.fetch(handle).unwrap());
    assert_eq!(Some(long_col), container.fetch(handle2).unwrap());
    drop(container);
    drop(tx);

    store.shutdown().unwrap();
}

#[test]
fn test_updates_full_and_sparse() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path());

    let mut tx = store.begin();
    let cid = tx.create_container(ContainerOptions::default()).unwrap();
    let container = tx.open_container(cid).unwrap().unwrap();

    let handle = container
        .insert(&row(&[b"alpha", b"beta", b"gamma"]), InsertFlags::default())
        .unwrap();

    // Full replace, growing one column well past its old size.
    let grown = Row::new(vec![b"alpha".to_vec(), vec![0xaa; 2000], b"gamma".to_vec()]);
    let same = container.update(handle, &grown, None).unwrap();
    assert_eq!(handle, same);
    assert_eq!(Some(grown.clone()), container.fetch(handle).unwrap());

    // Sparse update of the last column only.
    let patch = Row::new(vec![vec![], vec![], b"delta".to_vec()]);
    container
        .update(handle, &patch, Some(&[false, false, true]))
        .unwrap();
    let expect = Row::new(vec![b"alpha".to_vec(), vec![0xaa; 2000], b"delta".to_vec()]);
    assert_eq!(Some(expect.clone()), container.fetch(handle).unwrap());

    drop(container);
    tx.commit().unwrap();

    let tx = store.begin();
    let container = tx.open_container(cid).unwrap().unwrap();
    assert_eq!(Some(expect), container.fetch(handle).unwrap());
    drop(container);
    drop(tx);

    store.shutdown().unwrap();
}

#[test]
fn test_drop_container_lifecycle() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path());

    let mut tx = store.begin();
    let cid = tx.create_container(ContainerOptions::default()).unwrap();
    let container = tx.open_container(cid).unwrap().unwrap();
    let handle = container.insert(&row(&[b"data"]), InsertFlags::default()).unwrap();
    drop(container);
    tx.commit().unwrap();

    // A pending drop shows as a stub to its own transaction and rolls back
    // fully.
    let mut tx = store.begin();
    tx.drop_container(cid).unwrap();
    let stub = tx.open_container(cid).unwrap().unwrap();
    assert!(stub.is_stub());
    assert!(stub.fetch(handle).is_err());
    drop(stub);
    tx.abort().unwrap();

    let tx = store.begin();
    let container = tx.open_container(cid).unwrap().unwrap();
    assert!(!container.is_stub());
    assert_eq!(Some(row(&[b"data"])), container.fetch(handle).unwrap());
    drop(container);
    drop(tx);

    // Rollback via savepoint also restores the container.
    let mut tx = store.begin();
    tx.set_savepoint("before").unwrap();
    tx.drop_container(cid).unwrap();
    tx.rollback_to_savepoint("before").unwrap();
    let container = tx.open_container(cid).unwrap().unwrap();
    assert_eq!(Some(row(&[b"data"])), container.fetch(handle).unwrap());
    drop(container);
    tx.commit().unwrap();

    // A committed drop is final.
    let mut tx = store.begin();
    tx.drop_container(cid).unwrap();
    tx.commit().unwrap();
    let tx = store.begin();
    assert!(tx.open_container(cid).unwrap().is_none());
    drop(tx);

    store.shutdown().unwrap();
}

#[test]
fn test_temp_containers() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path());

    // Truncate-on-commit empties the container but keeps it alive.
    let mut tx = store.begin();
    let cid = tx
        .create_temp_container(ContainerOptions::default(), temp_mode::TRUNCATE_ON_COMMIT)
        .unwrap();
    let container = tx.open_container(cid).unwrap().unwrap();
    container.insert(&row(&[b"scratch"]), InsertFlags::default()).unwrap();
    assert!(container.page_count().unwrap() > 1);
    drop(container);
    tx.commit().unwrap();

    let tx = store.begin();
    let container = tx.open_container(cid).unwrap().unwrap();
    assert_eq!(1, container.page_count().unwrap());
    drop(container);
    drop(tx);

    // Modes OR across opens; drop wins over truncate at commit.
    let mut tx = store.begin();
    let container = tx
        .open_temp_container(cid, temp_mode::DROP_ON_COMMIT)
        .unwrap()
        .unwrap();
    container.insert(&row(&[b"bye"]), InsertFlags::default()).unwrap();
    drop(container);
    tx.commit().unwrap();
    let tx = store.begin();
    assert!(tx.open_container(cid).unwrap().is_none());
    drop(tx);

    // Abort always truncates, whatever the modes said.
    let mut tx = store.begin();
    let cid = tx
        .create_temp_container(ContainerOptions::default(), temp_mode::DROP_ON_COMMIT)
        .unwrap();
    let container = tx.open_container(cid).unwrap().unwrap();
    container.insert(&row(&[b"poof"]), InsertFlags::default()).unwrap();
    drop(container);
    tx.abort().unwrap();
    let tx = store.begin();
    let container = tx.open_container(cid).unwrap().unwrap();
    assert_eq!(1, container.page_count().unwrap());
    drop(container);
    drop(tx);

    store.shutdown().unwrap();
}

#[test]
fn test_nested_transaction_is_independent() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path());

    let mut tx = store.begin();
    let cid = tx.create_container(ContainerOptions::default()).unwrap();
    tx.commit().unwrap();

    let mut outer = store.begin();
    let container = outer.open_container(cid).unwrap().unwrap();
    let h_outer = container.insert(&row(&[b"outer"]), InsertFlags::default()).unwrap();
    drop(container);

    let h_inner = {
        let mut inner = outer.begin_nested();
        let container = inner.open_container(cid).unwrap().unwrap();
        let h = container.insert(&row(&[b"inner"]), InsertFlags::default()).unwrap();
        drop(container);
        inner.commit().unwrap();
        h
    };

    // The nested commit survives the outer abort.
    outer.abort().unwrap();

    let tx = store.begin();
    let container = tx.open_container(cid).unwrap().unwrap();
    assert_eq!(None, container.fetch(h_outer).unwrap());
    assert_eq!(Some(row(&[b"inner"])), container.fetch(h_inner).unwrap());
    drop(container);
    drop(tx);

    store.shutdown().unwrap();
}

#[test]
fn test_commit_from_idle_is_noop() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path());

    let mut tx = store.begin();
    tx.commit().unwrap();
    tx.abort().unwrap();

    // Still usable afterwards.
    let cid = tx.create_container(ContainerOptions::default()).unwrap();
    tx.commit().unwrap();
    let tx2 = store.begin();
    assert!(tx2.open_container(cid).unwrap().is_some());
    drop(tx2);
    drop(tx);

    store.shutdown().unwrap();
}

#[test]
fn test_lock_conflict_blocks_until_commit() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path());

    let mut tx = store.begin();
    let cid = tx.create_container(ContainerOptions::default()).unwrap();
    let container = tx.open_container(cid).unwrap().unwrap();
    let handle = container.insert(&row(&[b"v1"]), InsertFlags::default()).unwrap();
    drop(container);
    tx.commit().unwrap();

    let mut tx1 = store.begin();
    let c1 = tx1.open_container(cid).unwrap().unwrap();
    c1.update(handle, &row(&[b"v2"]), None).unwrap();
    drop(c1);

    std::thread::scope(|s| {
        let worker = s.spawn(|| {
            let mut tx2 = store.begin();
            let c2 = tx2.open_container(cid).unwrap().unwrap();
            // Blocks on tx1's exclusive row lock until it commits.
            let got = c2.fetch(handle).unwrap();
            drop(c2);
            tx2.commit().unwrap();
            got
        });

        std::thread::sleep(std::time::Duration::from_millis(50));
        tx1.commit().unwrap();
        let got = worker.join().unwrap();
        assert_eq!(Some(row(&[b"v2"])), got);
    });

    store.shutdown().unwrap();
}
