use rand::seq::SliceRandom;
use rand::SeedableRng;
use slotdb::{
    BTree, BtreeInsert, ContainerOptions, Datum, FetchLock, InsertFlags, Options, Row, ScanOp,
    SortOrder, Store,
};
use std::sync::Once;

static INIT: Once = Once::new();
fn setup() {
    INIT.call_once(|| {
        env_logger::init();
    });
}

fn open_store(dir: &std::path::Path) -> Store {
    Store::open(dir, Options::default()).unwrap()
}

fn rowloc_of(handle: slotdb::RecordHandle) -> Datum {
    let (pgid, rid) = handle.resolve().unwrap();
    Datum::RowLoc(pgid, rid)
}

#[test]
fn test_scan_order_respects_column_directions() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path());

    let mut tx = store.begin();
    let base_cid = tx.create_container(ContainerOptions::default()).unwrap();
    let base = tx.open_container(base_cid).unwrap().unwrap();

    // Key columns (x desc, y desc) with a payload z fetched through the
    // row location.
    let rows: Vec<(i64, i64, u8)> = vec![
        (1, 1, 11),
        (3, 1, 12),
        (4, 2, 13),
        (4, 4, 14),
        (4, 6, 15),
        (5, 2, 16),
        (5, 4, 17),
        (5, 6, 18),
        (6, 1, 19),
        (7, 1, 20),
        (9, 1, 21),
    ];
    let def = BTree::create(&tx, false, vec![SortOrder::Desc, SortOrder::Desc]).unwrap();
    let btree = BTree::open(&tx, &def);
    for (x, y, z) in &rows {
        let handle = base
            .insert(&Row::new(vec![vec![*z]]), InsertFlags::default())
            .unwrap();
        let inserted = btree
            .insert(&[Datum::Int(*x), Datum::Int(*y), rowloc_of(handle)])
            .unwrap();
        assert_eq!(BtreeInsert::Inserted, inserted);
    }

    let mut scan = btree.scan(None, None, false);
    let mut zs = Vec::new();
    while let Some(key) = scan.next().unwrap() {
        let Datum::RowLoc(pgid, rid) = &key[2] else {
            panic!("missing row location");
        };
        let (pgid, rid) = (*pgid, *rid);
        let base_row = base
            .fetch(slotdb::RecordHandle::Valid { page: pgid, id: rid })
            .unwrap()
            .unwrap();
        zs.push(base_row.columns[0][0]);
    }
    assert_eq!(vec![21, 20, 19, 18, 17, 16, 15, 14, 13, 12, 11], zs);

    // The extreme end of the composed order.
    let max = btree.fetch_max(FetchLock::RowSerializable).unwrap().unwrap();
    assert_eq!(Datum::Int(1), max[0]);
    assert_eq!(Datum::Int(1), max[1]);

    drop(scan);
    drop(btree);
    drop(base);
    tx.commit().unwrap();
    drop(tx);
    store.shutdown().unwrap();
}

#[test]
fn test_unique_index_rejects_duplicates() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path());

    let mut tx = store.begin();
    let base_cid = tx.create_container(ContainerOptions::default()).unwrap();
    let base = tx.open_container(base_cid).unwrap().unwrap();
    let loc_a = rowloc_of(
        base.insert(&Row::new(vec![b"a".to_vec()]), InsertFlags::default())
            .unwrap(),
    );
    let loc_b = rowloc_of(
        base.insert(&Row::new(vec![b"b".to_vec()]), InsertFlags::default())
            .unwrap(),
    );

    let def = BTree::create(&tx, true, vec![SortOrder::Asc]).unwrap();
    let btree = BTree::open(&tx, &def);

    let key = Datum::Bytes(b"the key".to_vec());
    assert_eq!(
        BtreeInsert::Inserted,
        btree.insert(&[key.clone(), loc_a.clone()]).unwrap()
    );
    // Same user key, different row location: still a duplicate for a
    // unique index.
    assert_eq!(
        BtreeInsert::Duplicate,
        btree.insert(&[key.clone(), loc_b.clone()]).unwrap()
    );

    // Deleting the first entry makes room in the same transaction.
    assert!(btree.delete(&[key.clone(), loc_a.clone()]).unwrap());
    assert_eq!(
        BtreeInsert::Inserted,
        btree.insert(&[key.clone(), loc_b.clone()]).unwrap()
    );

    drop(btree);
    drop(base);
    tx.commit().unwrap();
    drop(tx);
    store.shutdown().unwrap();
}

#[test]
fn test_non_unique_allows_same_key_different_rows() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path());

    let mut tx = store.begin();
    let base_cid = tx.create_container(ContainerOptions::default()).unwrap();
    let base = tx.open_container(base_cid).unwrap().unwrap();
    let loc_a = rowloc_of(
        base.insert(&Row::new(vec![b"a".to_vec()]), InsertFlags::default())
            .unwrap(),
    );
    let loc_b = rowloc_of(
        base.insert(&Row::new(vec![b"b".to_vec()]), InsertFlags::default())
            .unwrap(),
    );

    let def = BTree::create(&tx, false, vec![SortOrder::Asc]).unwrap();
    let btree = BTree::open(&tx, &def);

    let key = Datum::Int(7);
    assert_eq!(
        BtreeInsert::Inserted,
        btree.insert(&[key.clone(), loc_a.clone()]).unwrap()
    );
    assert_eq!(
        BtreeInsert::Inserted,
        btree.insert(&[key.clone(), loc_b.clone()]).unwrap()
    );
    // The exact same entry, location included, is a duplicate.
    assert_eq!(
        BtreeInsert::Duplicate,
        btree.insert(&[key.clone(), loc_a.clone()]).unwrap()
    );

    drop(btree);
    drop(base);
    tx.commit().unwrap();
    drop(tx);
    store.shutdown().unwrap();
}

#[test]
fn test_inserts_across_splits_stay_sorted() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path());

    let mut tx = store.begin();
    let base_cid = tx.create_container(ContainerOptions::default()).unwrap();
    let base = tx.open_container(base_cid).unwrap().unwrap();
    let def = BTree::create(&tx, true, vec![SortOrder::Asc]).unwrap();
    let btree = BTree::open(&tx, &def);

    let mut keys: Vec<i64> = (0..800).collect();
    let mut rng = rand::rngs::StdRng::seed_from_u64(42);
    keys.shuffle(&mut rng);

    for k in &keys {
        let handle = base
            .insert(
                &Row::new(vec![k.to_be_bytes().to_vec()]),
                InsertFlags::default(),
            )
            .unwrap();
        assert_eq!(
            BtreeInsert::Inserted,
            btree.insert(&[Datum::Int(*k), rowloc_of(handle)]).unwrap()
        );
    }

    let mut scan = btree.scan(None, None, false);
    let mut seen = Vec::new();
    while let Some(key) = scan.next().unwrap() {
        let Datum::Int(v) = &key[0] else { panic!("non-int key") };
        seen.push(*v);
    }
    assert_eq!((0..800).collect::<Vec<i64>>(), seen);

    let max = btree.fetch_max(FetchLock::TableShared).unwrap().unwrap();
    assert_eq!(Datum::Int(799), max[0]);

    drop(scan);
    drop(btree);
    drop(base);
    tx.commit().unwrap();
    drop(tx);

    // The whole tree survives a restart.
    store.shutdown().unwrap();
    let store = open_store(dir.path());
    let tx = store.begin();
    let btree = BTree::open(&tx, &def);
    let mut scan = btree.scan(None, None, false);
    let mut count = 0;
    while scan.next().unwrap().is_some() {
        count += 1;
    }
    assert_eq!(800, count);
    drop(scan);
    drop(btree);
    drop(tx);
    store.shutdown().unwrap();
}

#[test]
fn test_range_scan_bounds() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path());

    let mut tx = store.begin();
    let base_cid = tx.create_container(ContainerOptions::default()).unwrap();
    let base = tx.open_container(base_cid).unwrap().unwrap();
    let def = BTree::create(&tx, true, vec![SortOrder::Asc]).unwrap();
    let btree = BTree::open(&tx, &def);

    for k in 0..50i64 {
        let handle = base
            .insert(&Row::new(vec![vec![k as u8]]), InsertFlags::default())
            .unwrap();
        btree.insert(&[Datum::Int(k), rowloc_of(handle)]).unwrap();
    }

    let collect = |start: Option<(Vec<Datum>, ScanOp)>, stop: Option<(Vec<Datum>, ScanOp)>| {
        let mut scan = btree.scan(start, stop, false);
        let mut out = Vec::new();
        while let Some(key) = scan.next().unwrap() {
            let Datum::Int(v) = &key[0] else { unreachable!() };
            out.push(*v);
        }
        out
    };

    assert_eq!(
        (10..=20).collect::<Vec<i64>>(),
        collect(
            Some((vec![Datum::Int(10)], ScanOp::Ge)),
            Some((vec![Datum::Int(20)], ScanOp::Le)),
        )
    );
    assert_eq!(
        (11..20).collect::<Vec<i64>>(),
        collect(
            Some((vec![Datum::Int(10)], ScanOp::Gt)),
            Some((vec![Datum::Int(20)], ScanOp::Lt)),
        )
    );
    assert_eq!(
        (45..50).collect::<Vec<i64>>(),
        collect(Some((vec![Datum::Int(45)], ScanOp::Ge)), None)
    );
    assert_eq!(
        (0..5).collect::<Vec<i64>>(),
        collect(None, Some((vec![Datum::Int(4)], ScanOp::Le)))
    );

    drop(collect);
    drop(btree);
    drop(base);
    tx.commit().unwrap();
    drop(tx);
    store.shutdown().unwrap();
}

#[test]
fn test_scan_delete_with_update_locks() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path());

    let mut tx = store.begin();
    let base_cid = tx.create_container(ContainerOptions::default()).unwrap();
    let base = tx.open_container(base_cid).unwrap().unwrap();
    let def = BTree::create(&tx, true, vec![SortOrder::Asc]).unwrap();
    let btree = BTree::open(&tx, &def);

    for k in 0..20i64 {
        let handle = base
            .insert(&Row::new(vec![vec![k as u8]]), InsertFlags::default())
            .unwrap();
        btree.insert(&[Datum::Int(k), rowloc_of(handle)]).unwrap();
    }

    // Delete every even key through an update-lock scan.
    let mut scan = btree.scan(None, None, true);
    while let Some(key) = scan.next().unwrap() {
        let Datum::Int(v) = &key[0] else { unreachable!() };
        let v = *v;
        assert!(scan.does_current_qualify().unwrap());
        if v % 2 == 0 {
            assert!(!scan.is_current_deleted().unwrap());
            assert!(scan.delete().unwrap());
            assert!(scan.is_current_deleted().unwrap());
            // Deleting twice reports the entry already gone.
            assert!(!scan.delete().unwrap());
        }
    }
    drop(scan);

    let mut scan = btree.scan(None, None, false);
    let mut left = Vec::new();
    while let Some(key) = scan.next().unwrap() {
        let Datum::Int(v) = &key[0] else { unreachable!() };
        left.push(*v);
    }
    assert_eq!(vec![1, 3, 5, 7, 9, 11, 13, 15, 17, 19], left);

    drop(scan);
    drop(btree);
    drop(base);
    tx.commit().unwrap();
    drop(tx);
    store.shutdown().unwrap();
}

#[test]
fn test_abort_mid_split_loses_no_rows() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path());

    // Commit a base set small enough to fit one leaf.
    let mut tx = store.begin();
    let base_cid = tx.create_container(ContainerOptions::default()).unwrap();
    let base = tx.open_container(base_cid).unwrap().unwrap();
    let def = BTree::create(&tx, true, vec![SortOrder::Asc]).unwrap();
    let btree = BTree::open(&tx, &def);
    for k in 0..40i64 {
        let handle = base
            .insert(&Row::new(vec![vec![k as u8]]), InsertFlags::default())
            .unwrap();
        btree.insert(&[Datum::Int(k * 10), rowloc_of(handle)]).unwrap();
    }
    drop(btree);
    drop(base);
    tx.commit().unwrap();
    drop(tx);

    // A second transaction forces page splits, then aborts. The splits
    // may physically remain; no committed row may be lost or duplicated.
    let mut tx = store.begin();
    let base = tx.open_container(base_cid).unwrap().unwrap();
    let btree = BTree::open(&tx, &def);
    for k in 0..400i64 {
        let handle = base
            .insert(&Row::new(vec![vec![k as u8]]), InsertFlags::default())
            .unwrap();
        btree.insert(&[Datum::Int(k * 10 + 1), rowloc_of(handle)]).unwrap();
    }
    drop(btree);
    drop(base);
    tx.abort().unwrap();
    drop(tx);

    let tx = store.begin();
    let btree = BTree::open(&tx, &def);
    let mut scan = btree.scan(None, None, false);
    let mut seen = Vec::new();
    while let Some(key) = scan.next().unwrap() {
        let Datum::Int(v) = &key[0] else { unreachable!() };
        seen.push(*v);
    }
    assert_eq!((0..40).map(|k| k * 10).collect::<Vec<i64>>(), seen);

    drop(scan);
    drop(btree);
    drop(tx);
    store.shutdown().unwrap();
}

#[test]
fn test_fetch_max_read_committed() {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path());

    let mut tx = store.begin();
    let base_cid = tx.create_container(ContainerOptions::default()).unwrap();
    let base = tx.open_container(base_cid).unwrap().unwrap();
    let def = BTree::create(&tx, true, vec![SortOrder::Asc]).unwrap();
    let btree = BTree::open(&tx, &def);

    assert_eq!(None, btree.fetch_max(FetchLock::RowReadCommitted).unwrap());

    for k in [3i64, 1, 4, 1 + 10, 5] {
        let handle = base
            .insert(&Row::new(vec![vec![k as u8]]), InsertFlags::default())
            .unwrap();
        btree.insert(&[Datum::Int(k), rowloc_of(handle)]).unwrap();
    }

    let max = btree.fetch_max(FetchLock::RowReadCommitted).unwrap().unwrap();
    assert_eq!(Datum::Int(11), max[0]);

    // A delete exposes the next extreme.
    assert!(btree.delete(&max).unwrap());
    let max = btree.fetch_max(FetchLock::RowSerializable).unwrap().unwrap();
    assert_eq!(Datum::Int(5), max[0]);

    drop(btree);
    drop(base);
    tx.commit().unwrap();
    drop(tx);
    store.shutdown().unwrap();
}
