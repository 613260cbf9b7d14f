//! Storage: shared sort/sync workers and sizing configuration for a
//! group of stores.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use log::{error, info};

use crate::error::{ErrorKind, Result};
use crate::io::comp::Comp;
use crate::mem::BlockList;
use crate::store::sortwrk::{self, SortHandle, SortJob};
use crate::store::Store;
use crate::task::{rlock, wlock, Queue, Worker, WorkerMsg};
use crate::time::{Time, MILLI, SECOND};
use crate::types::PAGE_SIZE;

const OBJECT: &str = "storage";

/// Sort worker period: the tick that scans for waiting files.
const SORT_PERIOD: Time = 50 * MILLI;

/// Sync worker period: writer fsync and catalog flush.
const SYNC_PERIOD: Time = 200 * MILLI;

/// Waiting files one periodic tick may enqueue per store, bounding
/// how long a single store can monopolize the sorters.
const SCAN_BOUND: usize = 8;

/// Sizing preset for new storages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizePreset {
    /// 1 MiB writers, 8 MiB readers.
    Tiny,
    /// 4 MiB writers, 32 MiB readers.
    Small,
    /// 8 MiB writers, 64 MiB readers.
    Medium,
    /// 16 MiB writers, 128 MiB readers.
    Big,
    /// 32 MiB writers, 256 MiB readers.
    Large,
    /// 64 MiB writers, 512 MiB readers.
    Huge,
}

/// Expected insert pattern; scales the sorter pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertPattern {
    /// Occasional inserts.
    Moderate,
    /// A steady insert stream.
    Constant,
    /// Insert-bound workloads.
    Insane,
}

/// Global sizing and encoding configuration of a storage.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Bytes per writer file.
    pub filesize: u32,
    /// Bytes per reader file.
    pub largesize: u32,
    /// Number of sorter tasks.
    pub sorters: usize,
    /// Whether files are sorted at all.
    pub sort: bool,
    /// Compression of reader files.
    pub comp: Comp,
    /// Encryption marker; 0 means plain.
    pub encp: u8,
}

impl StorageConfig {
    /// A configuration from the sizing presets.
    pub fn preset(size: SizePreset, insert: InsertPattern) -> StorageConfig {
        const MIB: u32 = 1 << 20;
        let (filesize, largesize) = match size {
            SizePreset::Tiny => (MIB, 8 * MIB),
            SizePreset::Small => (4 * MIB, 32 * MIB),
            SizePreset::Medium => (8 * MIB, 64 * MIB),
            SizePreset::Big => (16 * MIB, 128 * MIB),
            SizePreset::Large => (32 * MIB, 256 * MIB),
            SizePreset::Huge => (64 * MIB, 512 * MIB),
        };
        let sorters = match insert {
            InsertPattern::Moderate => 1,
            InsertPattern::Constant => (num_cpus::get() / 2).max(1),
            InsertPattern::Insane => num_cpus::get().max(2),
        };
        StorageConfig {
            filesize,
            largesize,
            sorters,
            sort: true,
            comp: Comp::Zstd,
            encp: 0,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::preset(SizePreset::Medium, InsertPattern::Constant)
    }
}

/// Groups stores that share sort/sync workers and sizing.
pub struct Storage {
    name: String,
    cfg: StorageConfig,
    stores: Arc<RwLock<HashMap<String, Arc<Store>>>>,
    arena: Arc<BlockList>,
    queue: Arc<Queue<WorkerMsg<SortJob>>>,
    sorters: Vec<Worker<SortJob>>,
    syncwrk: Option<Worker<()>>,
    started: bool,
}

impl Storage {
    /// Creates a storage; workers start with `start`.
    pub fn new(name: &str, cfg: StorageConfig) -> Storage {
        Storage {
            name: name.to_owned(),
            cfg,
            stores: Arc::new(RwLock::new(HashMap::new())),
            arena: Arc::new(BlockList::new(PAGE_SIZE)),
            queue: Arc::new(Queue::new(0, None)),
            sorters: Vec::new(),
            syncwrk: None,
            started: false,
        }
    }

    /// The storage configuration.
    pub fn config(&self) -> &StorageConfig {
        &self.cfg
    }

    /// Adds a store; it immediately participates in sorting/syncing.
    pub fn add_store(&self, store: Arc<Store>) -> Result<()> {
        if self.started && self.cfg.sort {
            store.set_sorter(Some(SortHandle::new(self.queue.clone())));
        }
        wlock(&self.stores, OBJECT)?.insert(store.name().to_owned(), store);
        Ok(())
    }

    /// Removes a store from the storage.
    pub fn remove_store(&self, name: &str) -> Result<Option<Arc<Store>>> {
        let store = wlock(&self.stores, OBJECT)?.remove(name);
        if let Some(s) = &store {
            s.set_sorter(None);
        }
        Ok(store)
    }

    /// Looks a store up by name.
    pub fn get_store(&self, name: &str) -> Result<Option<Arc<Store>>> {
        Ok(rlock(&self.stores, OBJECT)?.get(name).cloned())
    }

    /// Starts the sorter pool and the sync worker.
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }
        self.queue.open()?;
        if self.cfg.sort {
            for i in 0..self.cfg.sorters.max(1) {
                // only the first sorter carries the periodic scan
                let period = if i == 0 { SORT_PERIOD } else { -1 };
                let stores = self.stores.clone();
                let arena = self.arena.clone();
                let queue = self.queue.clone();
                let wrk = Worker::with_queue(
                    &format!("{}-sort-{i}", self.name),
                    period,
                    self.queue.clone(),
                    None,
                    move |msg: Option<SortJob>| match msg {
                        Some(job) => {
                            let store = rlock(&stores, OBJECT)?.get(&job.store).cloned();
                            match store {
                                Some(s) => sortwrk::sort_file(&s, job.file, &arena),
                                None => Ok(()), // store dropped in flight
                            }
                        }
                        None => scan_waiting(&stores, &queue),
                    },
                )?;
                self.sorters.push(wrk);
            }
        }
        let stores = self.stores.clone();
        self.syncwrk = Some(Worker::new(
            &format!("{}-sync", self.name),
            SYNC_PERIOD,
            None,
            move |_: Option<()>| sync_stores(&stores),
        )?);

        for store in rlock(&self.stores, OBJECT)?.values() {
            if self.cfg.sort {
                store.set_sorter(Some(SortHandle::new(self.queue.clone())));
            }
        }
        self.started = true;
        info!("storage {} started with {} sorter(s)", self.name, self.sorters.len());
        Ok(())
    }

    /// Stops all workers, flushing catalogs on the way out.
    pub fn stop(&mut self) -> Result<()> {
        if !self.started {
            return Ok(());
        }
        for store in rlock(&self.stores, OBJECT)?.values() {
            store.set_sorter(None);
        }
        // one sentinel per pooled sorter; a worker's own stop may add
        // more, which the final shutdown drains
        for _ in &self.sorters {
            let _ = self.queue.enqueue_prio(WorkerMsg::Stop);
        }
        for mut wrk in self.sorters.drain(..) {
            if let Err(e) = wrk.stop(5 * SECOND) {
                error!("storage {}: stopping sorter: {e}", self.name);
            }
        }
        self.queue.shutdown()?;
        if let Some(mut wrk) = self.syncwrk.take() {
            wrk.stop(5 * SECOND)?;
        }
        for store in rlock(&self.stores, OBJECT)?.values() {
            store.close()?;
        }
        self.started = false;
        Ok(())
    }

    /// Blocks until no store has waiting or claimed files, or `tmo`
    /// expires. Test and shutdown helper.
    pub fn quiesce(&self, tmo: Time) -> Result<()> {
        let deadline = std::time::Instant::now() + std::time::Duration::from_nanos(tmo as u64);
        loop {
            let mut busy = false;
            for store in rlock(&self.stores, OBJECT)?.values() {
                if !store.get_all_waiting()?.is_empty() {
                    busy = true;
                    break;
                }
            }
            if !busy && self.queue.is_empty() {
                return Ok(());
            }
            if std::time::Instant::now() >= deadline {
                return Err(crate::error::Error::new(
                    ErrorKind::Timeout,
                    OBJECT,
                    "stores still sorting",
                ));
            }
            crate::task::sleep(10 * MILLI);
        }
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn scan_waiting(
    stores: &RwLock<HashMap<String, Arc<Store>>>,
    queue: &Queue<WorkerMsg<SortJob>>,
) -> Result<()> {
    let stores: Vec<Arc<Store>> = rlock(stores, OBJECT)?.values().cloned().collect();
    for store in stores {
        for file in store.claim_unsorted(SCAN_BOUND)? {
            queue.enqueue(WorkerMsg::Job(SortJob {
                store: store.name().to_owned(),
                file,
            }))?;
        }
    }
    Ok(())
}

fn sync_stores(stores: &RwLock<HashMap<String, Arc<Store>>>) -> Result<()> {
    let stores: Vec<Arc<Store>> = rlock(stores, OBJECT)?.values().cloned().collect();
    for store in stores {
        store.sync_writer()?;
        if store.catalog_dirty() {
            store.flush_catalog()?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreConfig;
    use crate::time::SECOND;
    use crate::types::{Content, Edge, EDGE_SIZE};

    fn edge(n: u64) -> Edge {
        Edge {
            edge: n + 1,
            origin: n % 7 + 1,
            destin: n % 3 + 1,
            label: 1,
            timestamp: n as i64,
            ..Edge::default()
        }
    }

    #[test]
    fn insert_sort_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = StoreConfig {
            alloc_size: 2 * PAGE_SIZE as u32,
            spares: 1,
            ..StoreConfig::new("s", Content::Edge)
        };
        let store = Store::create(&dir.path().join("s"), &cfg).unwrap();

        let mut storage = Storage::new(
            "stg",
            StorageConfig {
                sorters: 2,
                comp: Comp::Flat,
                ..StorageConfig::default()
            },
        );
        storage.add_store(store.clone()).unwrap();
        storage.start().unwrap();

        let per_file = 2 * PAGE_SIZE / EDGE_SIZE;
        let total = 3 * per_file + 10;
        for n in 0..total as u64 {
            store.insert(&edge(n).to_bytes()).unwrap();
        }
        storage.quiesce(10 * SECOND).unwrap();

        let readers = store.get_readers(i64::MIN, i64::MAX).unwrap();
        assert_eq!(readers.len(), 3);
        let sorted: usize = readers.iter().map(|f| f.nrecs()).sum();
        assert_eq!(sorted, 3 * per_file);

        // records in each reader obey the comparator
        let cmp = store.cmp();
        let ctx = store.comp_ctx();
        for f in &readers {
            let mut pager = f.open(&ctx).unwrap();
            let mut prev: Option<Vec<u8>> = None;
            let mut n = 0;
            while let Some(page) = pager.next_page().unwrap() {
                for slot in 0..f.rpp() {
                    let rec = &page[slot * EDGE_SIZE..(slot + 1) * EDGE_SIZE];
                    if crate::types::is_null_rec(rec) {
                        continue;
                    }
                    if let Some(p) = &prev {
                        assert_ne!(cmp.compare(p, rec), std::cmp::Ordering::Greater);
                    }
                    prev = Some(rec.to_vec());
                    n += 1;
                }
            }
            assert_eq!(n, f.nrecs());
        }
        storage.stop().unwrap();
    }
}
