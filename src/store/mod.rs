//! The record store: append path, file lifecycle and catalog.

pub mod sortwrk;
pub mod storage;

use std::collections::HashSet;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use byteorder::ByteOrder;
use log::{debug, info, warn};

use crate::error::{Error, ErrorKind, Result};
use crate::index::IndexDesc;
use crate::io::catalog::{self, CatEntry};
use crate::io::comp::{Comp, CompCtx, DEFAULT_LEVEL};
use crate::io::file::{self, recover_size, FileRole, FileView, FileWriter};
use crate::sort::{Compare, EdgeCmp, VertexCmp};
use crate::store::sortwrk::SortHandle;
use crate::task::{rlock, wlock};
use crate::time::{self, Time};
use crate::types::{edge_off, Content, FileId, PAGE_SIZE};

const OBJECT: &str = "store";

/// Store construction parameters.
#[derive(Clone)]
pub struct StoreConfig {
    /// Store name; also its directory name under the scope.
    pub name: String,
    /// What the store holds; fixes the record size and comparator.
    pub content: Content,
    /// Bytes allocated per writer file.
    pub alloc_size: u32,
    /// Bytes targeted per reader file (sizing of the sort output).
    pub large_size: u32,
    /// Compression of reader files.
    pub comp: Comp,
    /// Encryption marker carried through the catalog; 0 means plain.
    pub encp: u8,
    /// Spare files to keep pre-allocated.
    pub spares: usize,
}

impl StoreConfig {
    /// A config with conventional sizes for tests and small stores.
    pub fn new(name: &str, content: Content) -> StoreConfig {
        StoreConfig {
            name: name.to_owned(),
            content,
            alloc_size: 128 * PAGE_SIZE as u32,
            large_size: 1024 * PAGE_SIZE as u32,
            comp: Comp::Flat,
            encp: 0,
            spares: 1,
        }
    }
}

/// Metadata of one file owned by the store.
#[derive(Debug, Clone)]
struct FileEntry {
    id: FileId,
    capacity: u32,
    size: u32,
    min_time: Time,
    max_time: Time,
    comp: Comp,
}

impl FileEntry {
    fn fresh(id: FileId, capacity: u32) -> FileEntry {
        FileEntry {
            id,
            capacity,
            size: 0,
            min_time: Time::MAX,
            max_time: Time::MIN,
            comp: Comp::Flat,
        }
    }

    fn to_cat(&self, role: FileRole, encp: u8) -> CatEntry {
        CatEntry {
            id: self.id,
            capacity: self.capacity,
            size: self.size,
            min_time: self.min_time,
            max_time: self.max_time,
            role,
            comp: self.comp,
            encp,
        }
    }

    fn from_cat(e: &CatEntry) -> FileEntry {
        FileEntry {
            id: e.id,
            capacity: e.capacity,
            size: e.size,
            min_time: e.min_time,
            max_time: e.max_time,
            comp: e.comp,
        }
    }
}

struct StoreState {
    writer: FileEntry,
    writer_file: FileWriter,
    spares: Vec<FileEntry>,
    waiting: Vec<FileEntry>,
    readers: Vec<FileEntry>,
    pending: HashSet<FileId>,
    next_id: FileId,
}

/// The ownership root of one record kind: one writer file, spare
/// files, a waiting list of rotated files and sorted reader files,
/// recorded durably in the store catalog.
pub struct Store {
    name: String,
    path: PathBuf,
    content: Content,
    recsize: u32,
    alloc_size: u32,
    large_size: u32,
    comp: Comp,
    encp: u8,
    spares: usize,
    cmp: Arc<dyn Compare>,
    ctx: RwLock<CompCtx>,
    state: RwLock<StoreState>,
    cat_dirty: AtomicBool,
    readonly: AtomicBool,
    sorter: RwLock<Option<SortHandle>>,
    indices: RwLock<Vec<Arc<IndexDesc>>>,
}

impl Store {
    fn file_path(path: &Path, id: FileId) -> PathBuf {
        path.join(id.to_string())
    }

    fn catalog_path(&self) -> PathBuf {
        self.path.join("catalog")
    }

    /// Record bytes a writer file holds when full.
    fn writer_capacity(&self) -> u32 {
        let rpp = PAGE_SIZE / self.recsize as usize;
        let pages = self.alloc_size as usize / PAGE_SIZE;
        (pages * rpp * self.recsize as usize) as u32
    }

    fn comparator(content: Content) -> Arc<dyn Compare> {
        match content {
            Content::Edge => Arc::new(EdgeCmp::asc()),
            Content::Vertex => Arc::new(VertexCmp::asc()),
        }
    }

    /// Creates a new store under `path` and writes its first catalog.
    pub fn create(path: &Path, cfg: &StoreConfig) -> Result<Arc<Store>> {
        fs::create_dir_all(path)
            .map_err(|e| Error::with_io(ErrorKind::Create, OBJECT, "store dir", e))?;
        let recsize = cfg.content.recsize();

        let writer = FileEntry::fresh(1, cfg.alloc_size);
        let writer_file = FileWriter::create(&Self::file_path(path, 1), cfg.alloc_size, recsize)?;
        let mut spares = Vec::new();
        let mut next_id = 2;
        for _ in 0..cfg.spares {
            FileWriter::create(&Self::file_path(path, next_id), cfg.alloc_size, recsize)?;
            spares.push(FileEntry::fresh(next_id, cfg.alloc_size));
            next_id += 1;
        }

        let store = Arc::new(Store {
            name: cfg.name.clone(),
            path: path.to_owned(),
            content: cfg.content,
            recsize,
            alloc_size: cfg.alloc_size,
            large_size: cfg.large_size,
            comp: cfg.comp,
            encp: cfg.encp,
            spares: cfg.spares,
            cmp: Self::comparator(cfg.content),
            ctx: RwLock::new(CompCtx::new(DEFAULT_LEVEL)),
            state: RwLock::new(StoreState {
                writer,
                writer_file,
                spares,
                waiting: Vec::new(),
                readers: Vec::new(),
                pending: HashSet::new(),
                next_id,
            }),
            cat_dirty: AtomicBool::new(true),
            readonly: AtomicBool::new(false),
            sorter: RwLock::new(None),
            indices: RwLock::new(Vec::new()),
        });
        store.flush_catalog()?;
        info!("store {} created at {}", cfg.name, path.display());
        Ok(store)
    }

    /// Opens an existing store, recovering the writer size and
    /// discarding files the catalog does not know.
    pub fn open(path: &Path, cfg: &StoreConfig) -> Result<Arc<Store>> {
        let recsize = cfg.content.recsize();
        let entries = catalog::read(&path.join("catalog"))?;

        let mut writer: Option<FileEntry> = None;
        let mut waiting = Vec::new();
        let mut readers = Vec::new();
        let mut known = HashSet::new();
        let mut next_id = 1;
        let mut writer_role_entry = None;
        for e in &entries {
            known.insert(e.id);
            next_id = next_id.max(e.id + 1);
            match e.role {
                FileRole::Writer => writer_role_entry = Some(FileEntry::from_cat(e)),
                FileRole::Waiting => waiting.push(FileEntry::from_cat(e)),
                FileRole::Reader => readers.push(FileEntry::from_cat(e)),
                FileRole::Spare => {}
            }
        }
        let mut wentry = writer_role_entry
            .ok_or_else(|| Error::new(ErrorKind::Catalog, OBJECT, "catalog has no writer"))?;

        let mut ctx = CompCtx::new(DEFAULT_LEVEL);
        ctx.load_dict(&path.join("cdict"))?;

        // the catalog flushes lazily, so the writer size may be stale;
        // scan forward over non-null records
        let probe = FileView {
            id: wentry.id,
            path: Self::file_path(path, wentry.id),
            size: wentry.size,
            capacity: wentry.capacity,
            recsize,
            comp: Comp::Flat,
            role: FileRole::Writer,
            min_time: wentry.min_time,
            max_time: wentry.max_time,
            tail: None,
        };
        let recovered = recover_size(&probe, &ctx)?;
        if recovered != wentry.size {
            debug!(
                "store {}: writer size recovered {} -> {}",
                cfg.name, wentry.size, recovered
            );
            wentry.size = recovered;
        }
        // recovered records have unknown timestamps; widen the window
        if wentry.size > 0 && wentry.min_time > wentry.max_time {
            wentry.min_time = Time::MIN;
            wentry.max_time = Time::MAX;
        }
        let writer_file =
            FileWriter::open_at(&Self::file_path(path, wentry.id), wentry.size, recsize)?;
        let writer = wentry;

        // remove files the catalog does not own (aborted sort output,
        // former spares); then re-create the spare set
        if let Ok(dir) = fs::read_dir(path) {
            for entry in dir.flatten() {
                let name = entry.file_name();
                if let Some(id) = name.to_str().and_then(|s| s.parse::<FileId>().ok()) {
                    if !known.contains(&id) {
                        warn!("store {}: removing orphan file {id}", cfg.name);
                        let _ = fs::remove_file(entry.path());
                    }
                }
            }
        }
        let mut spares = Vec::new();
        for _ in 0..cfg.spares {
            FileWriter::create(&Self::file_path(path, next_id), cfg.alloc_size, recsize)?;
            spares.push(FileEntry::fresh(next_id, cfg.alloc_size));
            next_id += 1;
        }

        let store = Arc::new(Store {
            name: cfg.name.clone(),
            path: path.to_owned(),
            content: cfg.content,
            recsize,
            alloc_size: cfg.alloc_size,
            large_size: cfg.large_size,
            comp: cfg.comp,
            encp: cfg.encp,
            spares: cfg.spares,
            cmp: Self::comparator(cfg.content),
            ctx: RwLock::new(ctx),
            state: RwLock::new(StoreState {
                writer,
                writer_file,
                spares,
                waiting,
                readers,
                pending: HashSet::new(),
                next_id,
            }),
            cat_dirty: AtomicBool::new(true),
            readonly: AtomicBool::new(false),
            sorter: RwLock::new(None),
            indices: RwLock::new(Vec::new()),
        });
        store.flush_catalog()?;
        Ok(store)
    }

    /// The store name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// What the store holds.
    pub fn content(&self) -> Content {
        self.content
    }

    /// Record size in bytes.
    pub fn recsize(&self) -> u32 {
        self.recsize
    }

    /// Target size of reader files.
    pub fn large_size(&self) -> u32 {
        self.large_size
    }

    /// Compression of reader files.
    pub fn comp(&self) -> Comp {
        self.comp
    }

    /// The store's record comparator.
    pub fn cmp(&self) -> Arc<dyn Compare> {
        self.cmp.clone()
    }

    /// A snapshot of the compression context.
    pub fn comp_ctx(&self) -> CompCtx {
        self.ctx
            .read()
            .map(|c| c.clone())
            .unwrap_or_else(|_| CompCtx::new(DEFAULT_LEVEL))
    }

    /// Trains the compression dictionary from `samples` if none is
    /// loaded yet. Called by the sort worker on an empty store.
    pub fn maybe_train_dict(&self, samples: &[u8]) -> Result<()> {
        if self.comp != Comp::Zstd {
            return Ok(());
        }
        let mut ctx = wlock(&self.ctx, OBJECT)?;
        if ctx.has_dict() {
            return Ok(());
        }
        ctx.train_dict(&self.path.join("cdict"), samples, PAGE_SIZE)
    }

    /// Wires the storage's sort worker; rotations enqueue sort jobs.
    pub fn set_sorter(&self, h: Option<SortHandle>) {
        if let Ok(mut s) = self.sorter.write() {
            *s = h;
        }
    }

    /// Registers an index; the sort worker feeds it from then on.
    pub fn register_index(&self, desc: Arc<IndexDesc>) -> Result<()> {
        wlock(&self.indices, OBJECT)?.push(desc);
        Ok(())
    }

    /// Unregisters a dropped index.
    pub fn unregister_index(&self, name: &str) -> Result<()> {
        wlock(&self.indices, OBJECT)?.retain(|d| d.name != name);
        Ok(())
    }

    /// The registered indices.
    pub fn indices(&self) -> Vec<Arc<IndexDesc>> {
        self.indices
            .read()
            .map(|v| v.clone())
            .unwrap_or_default()
    }

    /// Marks the store read-only after a fatal error.
    pub fn set_readonly(&self) {
        self.readonly.store(true, Ordering::Release);
    }

    fn record_time(&self, rec: &[u8]) -> Time {
        match self.content {
            Content::Edge => {
                byteorder::LittleEndian::read_i64(&rec[edge_off::TIMESTAMP as usize..40])
            }
            // vertex rows carry no timestamp; stamp with the wall clock
            Content::Vertex => time::now(),
        }
    }

    /// Inserts one record. Rotates the writer to the waiting list and
    /// promotes a spare when the writer is full. All under the
    /// store's write lock.
    pub fn insert(&self, rec: &[u8]) -> Result<()> {
        if rec.len() != self.recsize as usize {
            return Err(Error::new(
                ErrorKind::Invalid,
                OBJECT,
                format!("record of {} bytes in store of {}", rec.len(), self.recsize),
            ));
        }
        if self.readonly.load(Ordering::Acquire) {
            return Err(Error::new(ErrorKind::Store, OBJECT, "store is read-only"));
        }
        let ts = self.record_time(rec);
        let mut rotated = None;
        {
            let mut st = wlock(&self.state, OBJECT)?;
            if st.writer.size + self.recsize > self.writer_capacity() {
                rotated = Some(self.rotate(&mut st)?);
            }
            st.writer_file.append(rec)?;
            st.writer.size += self.recsize;
            st.writer.min_time = st.writer.min_time.min(ts);
            st.writer.max_time = st.writer.max_time.max(ts);
        }
        self.cat_dirty.store(true, Ordering::Release);
        if let Some(file) = rotated {
            self.enqueue_sort(file);
        }
        Ok(())
    }

    /// Rotates under the held write lock; returns the rotated file id.
    fn rotate(&self, st: &mut StoreState) -> Result<FileId> {
        st.writer_file.sync()?;
        let full = st.writer.clone();
        let full_id = full.id;
        st.waiting.push(full);

        let next = match st.spares.pop() {
            Some(s) => s,
            None => {
                let id = st.next_id;
                st.next_id += 1;
                FileWriter::create(&Self::file_path(&self.path, id), self.alloc_size, self.recsize)?;
                FileEntry::fresh(id, self.alloc_size)
            }
        };
        st.writer_file = FileWriter::open_at(
            &Self::file_path(&self.path, next.id),
            0,
            self.recsize,
        )?;
        st.writer = next;
        st.pending.insert(full_id);
        debug!("store {}: rotated file {} to waiting", self.name, full_id);
        Ok(full_id)
    }

    fn enqueue_sort(&self, file: FileId) {
        if let Ok(s) = self.sorter.read() {
            if let Some(h) = s.as_ref() {
                if let Err(e) = h.enqueue(&self.name, file) {
                    warn!("store {}: cannot enqueue sort job: {e}", self.name);
                }
            }
        }
    }

    fn view(&self, e: &FileEntry, role: FileRole, tail: Option<Vec<u8>>) -> FileView {
        FileView {
            id: e.id,
            path: Self::file_path(&self.path, e.id),
            size: e.size,
            capacity: e.capacity,
            recsize: self.recsize,
            comp: e.comp,
            role,
            min_time: e.min_time,
            max_time: e.max_time,
            tail,
        }
    }

    /// The union of writer and reader files whose time windows
    /// intersect `[since, until]`. The caller owns the snapshot.
    pub fn get_files(&self, since: Time, until: Time) -> Result<Vec<FileView>> {
        let st = rlock(&self.state, OBJECT)?;
        let mut out = Vec::new();
        for e in &st.readers {
            if in_window(e, since, until) {
                out.push(self.view(e, FileRole::Reader, None));
            }
        }
        if in_window(&st.writer, since, until) {
            let tail = st.writer_file.tail();
            out.push(self.view(&st.writer, FileRole::Writer, tail));
        }
        Ok(out)
    }

    /// Reader files only, windowed like `get_files`.
    pub fn get_readers(&self, since: Time, until: Time) -> Result<Vec<FileView>> {
        let st = rlock(&self.state, OBJECT)?;
        Ok(st
            .readers
            .iter()
            .filter(|e| in_window(e, since, until))
            .map(|e| self.view(e, FileRole::Reader, None))
            .collect())
    }

    /// The current waiting set plus the writer: the unsorted pending
    /// files a merged read must include.
    pub fn get_pending(&self, since: Time, until: Time) -> Result<Vec<FileView>> {
        let st = rlock(&self.state, OBJECT)?;
        let mut out: Vec<FileView> = st
            .waiting
            .iter()
            .filter(|e| in_window(e, since, until))
            .map(|e| self.view(e, FileRole::Waiting, None))
            .collect();
        if in_window(&st.writer, since, until) {
            let tail = st.writer_file.tail();
            out.push(self.view(&st.writer, FileRole::Writer, tail));
        }
        Ok(out)
    }

    /// The current waiting set.
    pub fn get_all_waiting(&self) -> Result<Vec<FileView>> {
        let st = rlock(&self.state, OBJECT)?;
        Ok(st
            .waiting
            .iter()
            .map(|e| self.view(e, FileRole::Waiting, None))
            .collect())
    }

    /// Membership test on the waiting list.
    pub fn find_waiting(&self, file: FileId) -> Result<bool> {
        Ok(rlock(&self.state, OBJECT)?
            .waiting
            .iter()
            .any(|e| e.id == file))
    }

    /// Waiting files not yet claimed by a sort job; claims them.
    pub fn claim_unsorted(&self, limit: usize) -> Result<Vec<FileId>> {
        let mut st = wlock(&self.state, OBJECT)?;
        let mut out = Vec::new();
        let ids: Vec<FileId> = st.waiting.iter().map(|e| e.id).collect();
        for id in ids {
            if out.len() >= limit {
                break;
            }
            if st.pending.insert(id) {
                out.push(id);
            }
        }
        Ok(out)
    }

    /// Releases a sort claim without promoting (job failed).
    pub fn release_claim(&self, file: FileId) {
        if let Ok(mut st) = self.state.write() {
            st.pending.remove(&file);
        }
    }

    /// A snapshot of one waiting file for the sort worker.
    pub fn waiting_view(&self, file: FileId) -> Result<Option<FileView>> {
        let st = rlock(&self.state, OBJECT)?;
        Ok(st
            .waiting
            .iter()
            .find(|e| e.id == file)
            .map(|e| self.view(e, FileRole::Waiting, None)))
    }

    /// Allocates a file id for a new reader file.
    pub fn alloc_file_id(&self) -> Result<FileId> {
        let mut st = wlock(&self.state, OBJECT)?;
        let id = st.next_id;
        st.next_id += 1;
        Ok(id)
    }

    /// Path of a data file of this store.
    pub fn data_path(&self, id: FileId) -> PathBuf {
        Self::file_path(&self.path, id)
    }

    /// Atomically moves `old` from waiting to the reader list as
    /// `new`, flushes the catalog (the serialization point) and
    /// removes the old file from disk.
    pub fn promote(
        &self,
        old: FileId,
        id: FileId,
        capacity: u32,
        size: u32,
        min_time: Time,
        max_time: Time,
    ) -> Result<()> {
        {
            let mut st = wlock(&self.state, OBJECT)?;
            let pos = st.waiting.iter().position(|e| e.id == old).ok_or_else(|| {
                Error::new(ErrorKind::NotFound, OBJECT, format!("waiting file {old}"))
            })?;
            st.waiting.remove(pos);
            st.pending.remove(&old);
            st.readers.push(FileEntry {
                id,
                capacity,
                size,
                min_time,
                max_time,
                comp: self.comp,
            });
        }
        self.flush_catalog()?;
        file::remove(&Self::file_path(&self.path, old))?;
        info!("store {}: file {} sorted into reader {}", self.name, old, id);
        Ok(())
    }

    /// True if the catalog has unsaved changes.
    pub fn catalog_dirty(&self) -> bool {
        self.cat_dirty.load(Ordering::Acquire)
    }

    /// Writes the catalog (atomic rename) and clears the dirty flag.
    pub fn flush_catalog(&self) -> Result<()> {
        let entries = {
            let st = rlock(&self.state, OBJECT)?;
            let mut entries = Vec::with_capacity(1 + st.waiting.len() + st.readers.len());
            entries.push(st.writer.to_cat(FileRole::Writer, self.encp));
            for e in &st.waiting {
                entries.push(e.to_cat(FileRole::Waiting, self.encp));
            }
            for e in &st.readers {
                entries.push(e.to_cat(FileRole::Reader, self.encp));
            }
            entries
        };
        catalog::write(&self.catalog_path(), &entries)?;
        self.cat_dirty.store(false, Ordering::Release);
        Ok(())
    }

    /// Syncs the writer file to disk; the sync worker calls this on
    /// its period.
    pub fn sync_writer(&self) -> Result<()> {
        wlock(&self.state, OBJECT)?.writer_file.sync()
    }

    /// A human-readable dump of the store's file set.
    pub fn show_catalog(&self) -> Result<String> {
        let st = rlock(&self.state, OBJECT)?;
        let mut out = String::new();
        let _ = writeln!(out, "store {} ({:?})", self.name, self.content);
        let w = &st.writer;
        let _ = writeln!(
            out,
            "  writer  {:>6} size {:>10} capacity {:>10}",
            w.id, w.size, w.capacity
        );
        for e in &st.spares {
            let _ = writeln!(out, "  spare   {:>6} capacity {:>10}", e.id, e.capacity);
        }
        for e in &st.waiting {
            let _ = writeln!(out, "  waiting {:>6} size {:>10}", e.id, e.size);
        }
        for e in &st.readers {
            let _ = writeln!(
                out,
                "  reader  {:>6} size {:>10} [{} .. {}]",
                e.id, e.size, e.min_time, e.max_time
            );
        }
        Ok(out)
    }

    /// Flushes the catalog and syncs the writer.
    pub fn close(&self) -> Result<()> {
        self.sync_writer()?;
        self.flush_catalog()
    }

    /// Removes the whole store from disk. The store must not be used
    /// afterwards.
    pub fn drop_store(&self) -> Result<()> {
        fs::remove_dir_all(&self.path)
            .map_err(|e| Error::with_io(ErrorKind::Drop, OBJECT, "store dir", e))
    }
}

fn in_window(e: &FileEntry, since: Time, until: Time) -> bool {
    e.size > 0 && e.min_time <= until && e.max_time >= since
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{is_null_rec, Edge, EDGE_SIZE};

    fn edge(n: u64) -> Edge {
        Edge {
            edge: n + 1,
            origin: n % 3 + 1,
            destin: n % 2 + 1,
            label: 1,
            timestamp: n as i64,
            ..Edge::default()
        }
    }

    fn small_cfg(name: &str) -> StoreConfig {
        StoreConfig {
            alloc_size: 2 * PAGE_SIZE as u32,
            ..StoreConfig::new(name, Content::Edge)
        }
    }

    #[test]
    fn insert_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::create(&dir.path().join("s"), &small_cfg("s")).unwrap();
        for n in 0..10 {
            store.insert(&edge(n).to_bytes()).unwrap();
        }
        let files = store.get_files(Time::MIN, Time::MAX).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].nrecs(), 10);
        assert!(files[0].tail.is_some());
    }

    #[test]
    fn rotation_moves_writer_to_waiting() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::create(&dir.path().join("s"), &small_cfg("s")).unwrap();
        let per_file = 2 * PAGE_SIZE / EDGE_SIZE;
        for n in 0..(per_file + 1) as u64 {
            store.insert(&edge(n).to_bytes()).unwrap();
        }
        assert!(store.find_waiting(1).unwrap());
        let waiting = store.get_all_waiting().unwrap();
        assert_eq!(waiting.len(), 1);
        assert_eq!(waiting[0].nrecs(), per_file);
        // the new writer took the spare and holds one record
        let pending = store.get_pending(Time::MIN, Time::MAX).unwrap();
        assert_eq!(pending.len(), 2);
    }

    #[test]
    fn record_size_invariant() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::create(&dir.path().join("s"), &small_cfg("s")).unwrap();
        for n in 0..300 {
            store.insert(&edge(n).to_bytes()).unwrap();
        }
        for f in store
            .get_pending(Time::MIN, Time::MAX)
            .unwrap()
            .into_iter()
            .chain(store.get_files(Time::MIN, Time::MAX).unwrap())
        {
            assert_eq!(f.size % f.recsize, 0);
        }
        assert!(store.insert(&[0u8; 32]).is_err());
    }

    #[test]
    fn reopen_recovers_writer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s");
        {
            let store = Store::create(&path, &small_cfg("s")).unwrap();
            for n in 0..50 {
                store.insert(&edge(n).to_bytes()).unwrap();
            }
            store.sync_writer().unwrap();
            // no close: the catalog still says size 0
        }
        let store = Store::open(&path, &small_cfg("s")).unwrap();
        let files = store.get_files(Time::MIN, Time::MAX).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].nrecs(), 50);
        // appending continues where the scan ended
        store.insert(&edge(50).to_bytes()).unwrap();
        let files = store.get_files(Time::MIN, Time::MAX).unwrap();
        assert_eq!(files[0].nrecs(), 51);
    }

    #[test]
    fn scan_writer_pages_sees_all_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::create(&dir.path().join("s"), &small_cfg("s")).unwrap();
        let rpp = PAGE_SIZE / EDGE_SIZE;
        let total = rpp + 7;
        for n in 0..total as u64 {
            store.insert(&edge(n).to_bytes()).unwrap();
        }
        let files = store.get_files(Time::MIN, Time::MAX).unwrap();
        let ctx = store.comp_ctx();
        let mut seen = 0;
        for f in &files {
            let mut pager = f.open(&ctx).unwrap();
            while let Some(page) = pager.next_page().unwrap() {
                for slot in 0..rpp {
                    let rec = &page[slot * EDGE_SIZE..(slot + 1) * EDGE_SIZE];
                    if !is_null_rec(rec) {
                        seen += 1;
                    }
                }
            }
        }
        assert_eq!(seen, total);
    }
}
