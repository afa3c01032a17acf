use criterion::{criterion_group, criterion_main, Criterion};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use slotdb::{BTree, ContainerOptions, Datum, InsertFlags, Options, Row, SortOrder, Store};

criterion_group!(benches, heap_insert_benchmark, btree_insert_benchmark);
criterion_main!(benches);

pub fn heap_insert_benchmark(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path(), Options::default()).unwrap();

    let mut tx = store.begin();
    let cid = tx.create_container(ContainerOptions::default()).unwrap();
    let container = tx.open_container(cid).unwrap().unwrap();

    let mut rows = Vec::new();
    for i in 0..10000u32 {
        rows.push(Row::new(vec![
            i.to_be_bytes().to_vec(),
            format!("val{i:05}").into_bytes(),
        ]));
    }
    let mut rng = rand::rngs::StdRng::seed_from_u64(0);

    c.bench_function("heap_insert", |b| {
        b.iter(|| {
            let row = rows.choose(&mut rng).unwrap();
            container.insert(row, InsertFlags::default()).unwrap();
        })
    });

    drop(container);
    tx.commit().unwrap();
    store.shutdown().unwrap();
}

pub fn btree_insert_benchmark(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path(), Options::default()).unwrap();

    let mut tx = store.begin();
    let base_cid = tx.create_container(ContainerOptions::default()).unwrap();
    let base = tx.open_container(base_cid).unwrap().unwrap();
    let def = BTree::create(&tx, false, vec![SortOrder::Asc]).unwrap();
    let btree = BTree::open(&tx, &def);

    let mut rng = rand::rngs::StdRng::seed_from_u64(0);
    let mut keys: Vec<i64> = (0..100000).collect();
    keys.shuffle(&mut rng);
    let mut next = 0usize;

    c.bench_function("btree_insert", |b| {
        b.iter(|| {
            let k = keys[next % keys.len()];
            next += 1;
            let handle = base
                .insert(
                    &Row::new(vec![k.to_be_bytes().to_vec()]),
                    InsertFlags::default(),
                )
                .unwrap();
            let (pgid, rid) = handle.resolve().unwrap();
            btree
                .insert(&[Datum::Int(k), Datum::RowLoc(pgid, rid)])
                .unwrap();
        })
    });

    drop(btree);
    drop(base);
    tx.commit().unwrap();
    store.shutdown().unwrap();
}
