//! The reader hierarchy: pull-based page sources over store files.
//!
//! Every reader yields logical 8 KiB pages, padded with null records
//! beyond the last real record. `move_next` advances to the next
//! page and fails with `Eof` on exhaustion, idempotently.

pub mod filter;
pub mod vrow;

pub use filter::Filter;
pub use vrow::VRow;

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, ErrorKind, Result};
use crate::index::{IndexDesc, IndexHit, IndexRangeIter, IndexUse, SLOTS_PER_PAGE};
use crate::io::comp::CompCtx;
use crate::io::file::{FilePager, FileView};
use crate::sort::{mem_sort, Compare};
use crate::types::{is_null_rec, FileId, PAGE_SIZE};

const OBJECT: &str = "reader";

fn eof() -> Error {
    Error::new(ErrorKind::Eof, OBJECT, "")
}

/// The common pull contract of all readers.
pub trait Reader {
    /// Advances to the next logical page; `Eof` on exhaustion, and
    /// on every call thereafter.
    fn move_next(&mut self) -> Result<()>;

    /// The current 8 KiB logical page.
    fn page(&self) -> &[u8];

    /// Record size of the pages.
    fn recsize(&self) -> u32;

    /// Whether the stream of records is ordered by the governing
    /// comparator.
    fn ordered(&self) -> bool {
        false
    }
}

/// Iterates a caller-supplied file list, opening each file in turn
/// and yielding all its pages as-is.
pub struct FullScan {
    files: Vec<FileView>,
    ctx: CompCtx,
    cur: usize,
    pager: Option<FilePager>,
    page: Vec<u8>,
    recsize: u32,
    done: bool,
}

impl FullScan {
    /// A fullscan over `files`. The caller keeps ownership of the
    /// snapshot semantics: the list is fixed at construction.
    pub fn new(files: Vec<FileView>, ctx: CompCtx, recsize: u32) -> FullScan {
        FullScan {
            files,
            ctx,
            cur: 0,
            pager: None,
            page: vec![0u8; PAGE_SIZE],
            recsize,
            done: false,
        }
    }
}

impl Reader for FullScan {
    fn move_next(&mut self) -> Result<()> {
        if self.done {
            return Err(eof());
        }
        loop {
            if self.pager.is_none() {
                if self.cur >= self.files.len() {
                    self.done = true;
                    return Err(eof());
                }
                self.pager = Some(self.files[self.cur].open(&self.ctx)?);
            }
            let pager = self.pager.as_mut().ok_or_else(|| {
                Error::new(ErrorKind::Panic, OBJECT, "pager vanished")
            })?;
            match pager.next_page()? {
                Some(page) => {
                    self.page.copy_from_slice(page);
                    return Ok(());
                }
                None => {
                    self.pager = None;
                    self.cur += 1;
                }
            }
        }
    }

    fn page(&self) -> &[u8] {
        &self.page
    }

    fn recsize(&self) -> u32 {
        self.recsize
    }
}

/// Shared machinery of the index-driven readers: resolves hits to
/// masked pages.
struct HitPager {
    files: HashMap<FileId, FileView>,
    pagers: HashMap<FileId, FilePager>,
    ctx: CompCtx,
    recsize: u32,
}

impl HitPager {
    fn new(files: Vec<FileView>, ctx: CompCtx, recsize: u32) -> HitPager {
        HitPager {
            files: files.into_iter().map(|f| (f.id, f)).collect(),
            pagers: HashMap::new(),
            ctx,
            recsize,
        }
    }

    /// Loads the page behind `hit` into `out`, masked to the hit's
    /// slots. Returns false when the hit's file is not in the
    /// snapshot.
    fn load(&mut self, hit: &IndexHit, out: &mut [u8]) -> Result<bool> {
        let file = (hit.page >> 32) as FileId;
        let chunk = hit.page & 0xffff_ffff;
        let Some(view) = self.files.get(&file) else {
            return Ok(false);
        };
        let rpp = PAGE_SIZE / self.recsize as usize;
        let page_no = (chunk as usize * SLOTS_PER_PAGE / rpp) as u32;
        if page_no >= view.pages() {
            return Ok(false);
        }
        if !self.pagers.contains_key(&file) {
            let pager = view.open(&self.ctx)?;
            self.pagers.insert(file, pager);
        }
        let pager = self
            .pagers
            .get_mut(&file)
            .ok_or_else(|| Error::new(ErrorKind::Panic, OBJECT, "pager vanished"))?;
        let page = pager.read_page(page_no)?;
        out.copy_from_slice(page);
        mask_page(out, self.recsize as usize, chunk, &hit.bitmap);
        Ok(true)
    }
}

/// Overwrites every record outside the hit's slot set with the null
/// record.
fn mask_page(page: &mut [u8], recsize: usize, chunk: u64, bitmap: &[u64; 2]) {
    let rpp = PAGE_SIZE / recsize;
    let first = (chunk as usize * SLOTS_PER_PAGE) % rpp;
    for slot in 0..rpp {
        let keep = slot >= first && slot < first + SLOTS_PER_PAGE && {
            let bit = slot - first;
            bitmap[bit >> 6] & (1u64 << (bit & 63)) != 0
        };
        if !keep {
            page[slot * recsize..(slot + 1) * recsize].fill(0);
        }
    }
}

/// Drives an index with a full composite key and yields the masked
/// pages holding records with that key.
pub struct Search {
    hits: Vec<IndexHit>,
    pos: usize,
    pager: HitPager,
    page: Vec<u8>,
    _use: IndexUse,
    done: bool,
}

impl Search {
    /// A search for `key` over the snapshot `files`.
    pub fn new(desc: Arc<IndexDesc>, key: &[u8], files: Vec<FileView>, ctx: CompCtx) -> Result<Search> {
        let idx_use = IndexUse::new(desc.clone())?;
        let hits = desc.idx.search(key)?;
        let recsize = desc.idx.recsize();
        Ok(Search {
            hits,
            pos: 0,
            pager: HitPager::new(files, ctx, recsize),
            page: vec![0u8; PAGE_SIZE],
            _use: idx_use,
            done: false,
        })
    }
}

impl Reader for Search {
    fn move_next(&mut self) -> Result<()> {
        if self.done {
            return Err(eof());
        }
        while self.pos < self.hits.len() {
            let hit = self.hits[self.pos].clone();
            self.pos += 1;
            if self.pager.load(&hit, &mut self.page)? {
                return Ok(());
            }
        }
        self.done = true;
        Err(eof())
    }

    fn page(&self) -> &[u8] {
        &self.page
    }

    fn recsize(&self) -> u32 {
        self.pager.recsize
    }

    fn ordered(&self) -> bool {
        true
    }
}

/// Drives an index over a key range in key order, yielding one
/// masked page per hit (a file-range over reader files).
pub struct FRange {
    iter: IndexRangeIter,
    pager: HitPager,
    page: Vec<u8>,
    _use: IndexUse,
    done: bool,
}

impl FRange {
    /// A range scan over `[lo, hi]` (either side optional) of the
    /// index, restricted to the snapshot `files`.
    pub fn new(
        desc: Arc<IndexDesc>,
        lo: Option<&[u8]>,
        hi: Option<&[u8]>,
        desc_order: bool,
        files: Vec<FileView>,
        ctx: CompCtx,
    ) -> Result<FRange> {
        let idx_use = IndexUse::new(desc.clone())?;
        let iter = desc.idx.range(lo, hi, desc_order)?;
        let recsize = desc.idx.recsize();
        Ok(FRange {
            iter,
            pager: HitPager::new(files, ctx, recsize),
            page: vec![0u8; PAGE_SIZE],
            _use: idx_use,
            done: false,
        })
    }
}

impl Reader for FRange {
    fn move_next(&mut self) -> Result<()> {
        if self.done {
            return Err(eof());
        }
        loop {
            match self.iter.next() {
                None => {
                    self.done = true;
                    return Err(eof());
                }
                Some(hit) => {
                    let hit = hit?;
                    if self.pager.load(&hit, &mut self.page)? {
                        return Ok(());
                    }
                }
            }
        }
    }

    fn page(&self) -> &[u8] {
        &self.page
    }

    fn recsize(&self) -> u32 {
        self.pager.recsize
    }

    fn ordered(&self) -> bool {
        true
    }
}

/// Reads all pages of its input files into one buffer, sorts the
/// records by the governing comparator and yields them re-packed
/// into 8 KiB pages.
///
/// This makes pending (unsorted) files participate in an ordered
/// merge.
pub struct BufIdx {
    buf: Vec<u8>,
    pos: usize,
    page: Vec<u8>,
    recsize: u32,
    done: bool,
}

impl BufIdx {
    /// Buffers and sorts all records of `files`.
    pub fn new(
        files: Vec<FileView>,
        ctx: CompCtx,
        cmp: &dyn Compare,
        recsize: u32,
    ) -> Result<BufIdx> {
        let rs = recsize as usize;
        let total: usize = files.iter().map(|f| f.nrecs() * rs).sum();
        let mut buf = Vec::with_capacity(total);
        for f in &files {
            let mut pager = f.open(&ctx)?;
            while let Some(page) = pager.next_page()? {
                for slot in 0..(PAGE_SIZE / rs) {
                    let rec = &page[slot * rs..(slot + 1) * rs];
                    if !is_null_rec(rec) {
                        buf.extend_from_slice(rec);
                    }
                }
            }
        }
        mem_sort(&mut buf, rs, cmp);
        Ok(BufIdx {
            buf,
            pos: 0,
            page: vec![0u8; PAGE_SIZE],
            recsize,
            done: false,
        })
    }
}

impl Reader for BufIdx {
    fn move_next(&mut self) -> Result<()> {
        if self.done {
            return Err(eof());
        }
        if self.pos >= self.buf.len() {
            self.done = true;
            return Err(eof());
        }
        let rs = self.recsize as usize;
        let payload = (PAGE_SIZE / rs) * rs;
        let n = payload.min(self.buf.len() - self.pos);
        self.page.fill(0);
        self.page[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        Ok(())
    }

    fn page(&self) -> &[u8] {
        &self.page
    }

    fn recsize(&self) -> u32 {
        self.recsize
    }

    fn ordered(&self) -> bool {
        true
    }
}

struct MergeChild {
    reader: Box<dyn Reader>,
    page: Vec<u8>,
    slot: usize,
    eof: bool,
    primed: bool,
}

impl MergeChild {
    /// Positions on the child's next real record; false at its end.
    fn settle(&mut self, recsize: usize) -> Result<bool> {
        let rpp = PAGE_SIZE / recsize;
        loop {
            if self.eof {
                return Ok(false);
            }
            if !self.primed {
                match self.reader.move_next() {
                    Ok(()) => {
                        self.page.copy_from_slice(self.reader.page());
                        self.slot = 0;
                        self.primed = true;
                    }
                    Err(e) if e.kind() == ErrorKind::Eof => {
                        self.eof = true;
                        return Ok(false);
                    }
                    Err(e) => return Err(e),
                }
            }
            while self.slot < rpp {
                let rec = &self.page[self.slot * recsize..(self.slot + 1) * recsize];
                if !is_null_rec(rec) {
                    return Ok(true);
                }
                self.slot += 1;
            }
            self.primed = false;
        }
    }

    fn current(&self, recsize: usize) -> &[u8] {
        &self.page[self.slot * recsize..(self.slot + 1) * recsize]
    }
}

/// Streaming k-way merge over reader children ordered by the
/// governing comparator; yields fully packed pages with null records
/// dropped.
pub struct Merge {
    children: Vec<MergeChild>,
    cmp: Arc<dyn Compare>,
    page: Vec<u8>,
    recsize: u32,
    done: bool,
}

impl Merge {
    /// Merges `children`, which must all yield records ordered by
    /// `cmp` and share one record size.
    pub fn new(children: Vec<Box<dyn Reader>>, cmp: Arc<dyn Compare>, recsize: u32) -> Merge {
        Merge {
            children: children
                .into_iter()
                .map(|reader| MergeChild {
                    reader,
                    page: vec![0u8; PAGE_SIZE],
                    slot: 0,
                    eof: false,
                    primed: false,
                })
                .collect(),
            cmp,
            page: vec![0u8; PAGE_SIZE],
            recsize,
            done: false,
        }
    }
}

impl Reader for Merge {
    fn move_next(&mut self) -> Result<()> {
        if self.done {
            return Err(eof());
        }
        let rs = self.recsize as usize;
        let rpp = PAGE_SIZE / rs;
        self.page.fill(0);
        let mut out = 0usize;
        while out < rpp {
            let mut best: Option<usize> = None;
            for i in 0..self.children.len() {
                if !self.children[i].settle(rs)? {
                    continue;
                }
                best = match best {
                    None => Some(i),
                    Some(b) => {
                        let cur = self.children[i].current(rs);
                        let old = self.children[b].current(rs);
                        // earlier children win ties to keep the merge stable
                        if self.cmp.compare(cur, old) == std::cmp::Ordering::Less {
                            Some(i)
                        } else {
                            Some(b)
                        }
                    }
                };
            }
            let Some(b) = best else { break };
            let child = &mut self.children[b];
            let rec = child.current(rs).to_vec();
            self.page[out * rs..(out + 1) * rs].copy_from_slice(&rec);
            child.slot += 1;
            out += 1;
        }
        if out == 0 {
            self.done = true;
            return Err(eof());
        }
        Ok(())
    }

    fn page(&self) -> &[u8] {
        &self.page
    }

    fn recsize(&self) -> u32 {
        self.recsize
    }

    fn ordered(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::comp::{Comp, CompCtx, DEFAULT_LEVEL};
    use crate::io::file::{FileRole, FileWriter};
    use crate::sort::EdgeCmp;
    use crate::types::{Edge, EDGE_SIZE};
    use std::path::Path;

    fn edge(n: u64) -> Edge {
        Edge {
            edge: n + 1,
            origin: n + 1,
            destin: 1,
            label: 1,
            timestamp: 0,
            ..Edge::default()
        }
    }

    fn write_file(path: &Path, id: u32, recs: &[Edge]) -> FileView {
        let capacity = 16 * PAGE_SIZE as u32;
        let mut w = FileWriter::create(path, capacity, EDGE_SIZE as u32).unwrap();
        for r in recs {
            w.append(&r.to_bytes()).unwrap();
        }
        w.sync().unwrap();
        FileView {
            id,
            path: path.to_owned(),
            size: (recs.len() * EDGE_SIZE) as u32,
            capacity,
            recsize: EDGE_SIZE as u32,
            comp: Comp::Flat,
            role: FileRole::Reader,
            min_time: 0,
            max_time: 0,
            tail: None,
        }
    }

    fn count_records(r: &mut dyn Reader) -> usize {
        let rs = r.recsize() as usize;
        let mut n = 0;
        loop {
            match r.move_next() {
                Ok(()) => {
                    for slot in 0..(PAGE_SIZE / rs) {
                        if !is_null_rec(&r.page()[slot * rs..(slot + 1) * rs]) {
                            n += 1;
                        }
                    }
                }
                Err(e) if e.kind() == ErrorKind::Eof => break,
                Err(e) => panic!("{e}"),
            }
        }
        n
    }

    #[test]
    fn fullscan_reads_everything_and_eof_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let rpp = PAGE_SIZE / EDGE_SIZE;
        let recs: Vec<Edge> = (0..(rpp * 2 + 5) as u64).map(edge).collect();
        let f1 = write_file(&dir.path().join("1"), 1, &recs[..rpp]);
        let f2 = write_file(&dir.path().join("2"), 2, &recs[rpp..]);
        let ctx = CompCtx::new(DEFAULT_LEVEL);
        let mut scan = FullScan::new(vec![f1, f2], ctx, EDGE_SIZE as u32);
        assert_eq!(count_records(&mut scan), recs.len());
        assert_eq!(scan.move_next().unwrap_err().kind(), ErrorKind::Eof);
        assert_eq!(scan.move_next().unwrap_err().kind(), ErrorKind::Eof);
    }

    #[test]
    fn bufidx_orders_pending_records() {
        let dir = tempfile::tempdir().unwrap();
        // records inserted out of order
        let recs: Vec<Edge> = [5u64, 3, 9, 1, 7].iter().map(|&n| edge(n)).collect();
        let f = write_file(&dir.path().join("1"), 1, &recs);
        let ctx = CompCtx::new(DEFAULT_LEVEL);
        let cmp = EdgeCmp::asc();
        let mut r = BufIdx::new(vec![f], ctx, &cmp, EDGE_SIZE as u32).unwrap();
        r.move_next().unwrap();
        let origins: Vec<u64> = (0..5)
            .map(|i| Edge::from_bytes(&r.page()[i * EDGE_SIZE..(i + 1) * EDGE_SIZE]).origin)
            .collect();
        assert_eq!(origins, vec![2, 4, 6, 8, 10]);
        assert_eq!(r.move_next().unwrap_err().kind(), ErrorKind::Eof);
    }

    #[test]
    fn merge_interleaves_sorted_children() {
        let dir = tempfile::tempdir().unwrap();
        let even: Vec<Edge> = (0..10u64).map(|n| edge(n * 2)).collect();
        let odd: Vec<Edge> = (0..10u64).map(|n| edge(n * 2 + 1)).collect();
        let f1 = write_file(&dir.path().join("1"), 1, &even);
        let f2 = write_file(&dir.path().join("2"), 2, &odd);
        let ctx = CompCtx::new(DEFAULT_LEVEL);
        let c1: Box<dyn Reader> =
            Box::new(FullScan::new(vec![f1], ctx.clone(), EDGE_SIZE as u32));
        let c2: Box<dyn Reader> = Box::new(FullScan::new(vec![f2], ctx, EDGE_SIZE as u32));
        let mut m = Merge::new(vec![c1, c2], Arc::new(EdgeCmp::asc()), EDGE_SIZE as u32);
        m.move_next().unwrap();
        let origins: Vec<u64> = (0..20)
            .map(|i| Edge::from_bytes(&m.page()[i * EDGE_SIZE..(i + 1) * EDGE_SIZE]).origin)
            .collect();
        let expect: Vec<u64> = (1..=20).collect();
        assert_eq!(origins, expect);
        assert_eq!(m.move_next().unwrap_err().kind(), ErrorKind::Eof);
    }

    #[test]
    fn mask_page_zeroes_unset_slots() {
        let mut page = vec![0u8; PAGE_SIZE];
        for slot in 0..128 {
            edge(slot as u64).write_to(&mut page[slot * EDGE_SIZE..(slot + 1) * EDGE_SIZE]);
        }
        let bitmap = [(1u64 << 0) | (1 << 5), 1u64 << 3]; // slots 0, 5, 67
        mask_page(&mut page, EDGE_SIZE, 0, &bitmap);
        let mut kept = Vec::new();
        for slot in 0..128 {
            if !is_null_rec(&page[slot * EDGE_SIZE..(slot + 1) * EDGE_SIZE]) {
                kept.push(slot);
            }
        }
        assert_eq!(kept, vec![0, 5, 67]);
    }
}
