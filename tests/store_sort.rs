//! Store lifecycle: concurrent inserts, background sorting and
//! catalog durability.

use std::cmp::Ordering;
use std::fs;

use nowdb::io::comp::Comp;
use nowdb::sort::Compare;
use nowdb::store::storage::{Storage, StorageConfig};
use nowdb::store::{Store, StoreConfig};
use nowdb::time::SECOND;
use nowdb::types::{is_null_rec, Content, Edge, EDGE_SIZE, PAGE_SIZE};

fn edge(n: u64) -> Edge {
    Edge {
        edge: n + 1,
        origin: n % 13 + 1,
        destin: n % 7 + 1,
        label: 1,
        timestamp: n as i64,
        ..Edge::default()
    }
}

fn small_store_cfg(name: &str, pages: u32) -> StoreConfig {
    StoreConfig {
        alloc_size: pages * PAGE_SIZE as u32,
        spares: 1,
        ..StoreConfig::new(name, Content::Edge)
    }
}

#[test]
fn concurrent_inserts_sort_to_single_reader() {
    let dir = tempfile::tempdir().unwrap();
    // writer capacity is exactly the insert volume: one rotation
    let per_file = 8 * PAGE_SIZE / EDGE_SIZE; // 1024 records
    let store = Store::create(&dir.path().join("s"), &small_store_cfg("s", 8)).unwrap();

    let mut storage = Storage::new(
        "t",
        StorageConfig {
            sorters: 2,
            comp: Comp::Flat,
            ..StorageConfig::default()
        },
    );
    storage.add_store(store.clone()).unwrap();
    storage.start().unwrap();

    let threads = 8;
    let per_thread = per_file / threads;
    crossbeam_utils::thread::scope(|s| {
        for t in 0..threads {
            let store = store.clone();
            s.spawn(move |_| {
                for i in 0..per_thread {
                    let n = (t * per_thread + i) as u64;
                    store.insert(&edge(n).to_bytes()).unwrap();
                }
            });
        }
    })
    .unwrap();
    // the writer is exactly full; the next insert rotates it
    store.insert(&edge(per_file as u64).to_bytes()).unwrap();

    storage.quiesce(30 * SECOND).unwrap();

    let readers = store.get_readers(i64::MIN, i64::MAX).unwrap();
    assert_eq!(readers.len(), 1);
    let reader = &readers[0];
    assert_eq!(reader.nrecs(), per_file);
    assert_eq!(reader.size % reader.recsize, 0);

    // the file is sorted, null records only in padded tail positions
    let cmp = store.cmp();
    let ctx = store.comp_ctx();
    let mut pager = reader.open(&ctx).unwrap();
    let mut prev: Option<Vec<u8>> = None;
    let mut count = 0;
    while let Some(page) = pager.next_page().unwrap() {
        let mut saw_null = false;
        for slot in 0..(PAGE_SIZE / EDGE_SIZE) {
            let rec = &page[slot * EDGE_SIZE..(slot + 1) * EDGE_SIZE];
            if is_null_rec(rec) {
                saw_null = true;
                continue;
            }
            assert!(!saw_null, "real record after a padded slot");
            if let Some(p) = &prev {
                assert_ne!(cmp.compare(p, rec), Ordering::Greater);
            }
            prev = Some(rec.to_vec());
            count += 1;
        }
    }
    assert_eq!(count, per_file);

    storage.stop().unwrap();
}

#[test]
fn unpromoted_sort_output_is_discarded_on_open() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("s");
    let per_file = 2 * PAGE_SIZE / EDGE_SIZE;
    {
        // no storage workers: the rotated file stays in waiting
        let store = Store::create(&path, &small_store_cfg("s", 2)).unwrap();
        for n in 0..(per_file + 1) as u64 {
            store.insert(&edge(n).to_bytes()).unwrap();
        }
        assert!(store.find_waiting(1).unwrap());
        store.close().unwrap();

        // simulate a crash after the sort wrote its output but
        // before the catalog flush: the file exists, the catalog
        // does not know it
        fs::write(path.join("99"), vec![0u8; PAGE_SIZE]).unwrap();
    }

    let store = Store::open(&path, &small_store_cfg("s", 2)).unwrap();
    assert!(store.find_waiting(1).unwrap(), "waiting file lost on reopen");
    assert!(
        store.get_readers(i64::MIN, i64::MAX).unwrap().is_empty(),
        "unpromoted output must not appear as a reader"
    );
    assert!(!path.join("99").exists(), "orphan file must be removed");

    let waiting = store.get_all_waiting().unwrap();
    assert_eq!(waiting.len(), 1);
    assert_eq!(waiting[0].nrecs(), per_file);
}

#[test]
fn catalog_backup_survives_corruption() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("s");
    {
        let store = Store::create(&path, &small_store_cfg("s", 2)).unwrap();
        for n in 0..10 {
            store.insert(&edge(n).to_bytes()).unwrap();
        }
        store.close().unwrap();
        // a second flush rotates the previous catalog into the backup
        store.flush_catalog().unwrap();
    }
    fs::write(path.join("catalog"), b"garbage").unwrap();
    let store = Store::open(&path, &small_store_cfg("s", 2)).unwrap();
    assert_eq!(
        store.get_files(i64::MIN, i64::MAX).unwrap()[0].nrecs(),
        10
    );
}
