//! Comparing, searching and sorting.

use std::cmp::Ordering;
use std::collections::VecDeque;

use byteorder::{ByteOrder, LittleEndian};
use rayon::prelude::*;

use crate::error::{Error, ErrorKind, Result};
use crate::mem::{Block, BlockList};
use crate::types::{edge_off, is_null_rec, vertex_off, EDGE_SIZE};

const OBJECT: &str = "sort";

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrd {
    /// No ordering requested.
    No,
    /// Ascending.
    Asc,
    /// Descending.
    Desc,
}

/// A record comparator. Implementors carry whatever resources the
/// comparison needs (key offsets, record size).
///
/// The all-zero null record compares greater than every real record,
/// so padded remainders sort to the tail.
pub trait Compare: Send + Sync {
    /// Compares two records.
    fn compare(&self, left: &[u8], right: &[u8]) -> Ordering;
}

/// Null-record handling shared by all comparators; `None` means both
/// records are real and field comparison must decide.
#[inline]
fn null_cmp(left: &[u8], right: &[u8]) -> Option<Ordering> {
    match (is_null_rec(left), is_null_rec(right)) {
        (true, true) => Some(Ordering::Equal),
        (true, false) => Some(Ordering::Greater),
        (false, true) => Some(Ordering::Less),
        (false, false) => None,
    }
}

#[inline]
fn u64_at(rec: &[u8], off: u16) -> u64 {
    LittleEndian::read_u64(&rec[off as usize..off as usize + 8])
}

#[inline]
fn i64_at(rec: &[u8], off: u16) -> i64 {
    LittleEndian::read_i64(&rec[off as usize..off as usize + 8])
}

/// The standard edge ordering:
/// `(origin, destin, timestamp, edge, label)` ascending.
pub struct EdgeCmp {
    desc: bool,
}

impl EdgeCmp {
    /// Ascending edge comparator.
    pub fn asc() -> Self {
        EdgeCmp { desc: false }
    }

    /// Descending edge comparator.
    pub fn desc() -> Self {
        EdgeCmp { desc: true }
    }
}

impl Compare for EdgeCmp {
    fn compare(&self, left: &[u8], right: &[u8]) -> Ordering {
        if let Some(o) = null_cmp(left, right) {
            return o;
        }
        let ord = u64_at(left, edge_off::ORIGIN)
            .cmp(&u64_at(right, edge_off::ORIGIN))
            .then_with(|| u64_at(left, edge_off::DESTIN).cmp(&u64_at(right, edge_off::DESTIN)))
            .then_with(|| {
                i64_at(left, edge_off::TIMESTAMP).cmp(&i64_at(right, edge_off::TIMESTAMP))
            })
            .then_with(|| u64_at(left, edge_off::EDGE).cmp(&u64_at(right, edge_off::EDGE)))
            .then_with(|| u64_at(left, edge_off::LABEL).cmp(&u64_at(right, edge_off::LABEL)));
        if self.desc {
            ord.reverse()
        } else {
            ord
        }
    }
}

/// The standard vertex ordering: `(vertex, property)` ascending.
pub struct VertexCmp {
    desc: bool,
}

impl VertexCmp {
    /// Ascending vertex comparator.
    pub fn asc() -> Self {
        VertexCmp { desc: false }
    }

    /// Descending vertex comparator.
    pub fn desc() -> Self {
        VertexCmp { desc: true }
    }
}

impl Compare for VertexCmp {
    fn compare(&self, left: &[u8], right: &[u8]) -> Ordering {
        if let Some(o) = null_cmp(left, right) {
            return o;
        }
        let ord = u64_at(left, vertex_off::VERTEX)
            .cmp(&u64_at(right, vertex_off::VERTEX))
            .then_with(|| {
                u64_at(left, vertex_off::PROPERTY).cmp(&u64_at(right, vertex_off::PROPERTY))
            });
        if self.desc {
            ord.reverse()
        } else {
            ord
        }
    }
}

/// Compares records on a composite key: the concatenation of the
/// fields at the given offsets, most significant first.
pub struct KeyCmp {
    offs: Vec<u16>,
    recsize: u32,
    desc: bool,
}

impl KeyCmp {
    /// Ascending composite-key comparator for records of `recsize`.
    pub fn asc(offs: Vec<u16>, recsize: u32) -> Self {
        KeyCmp {
            offs,
            recsize,
            desc: false,
        }
    }

    /// Descending composite-key comparator.
    pub fn desc(offs: Vec<u16>, recsize: u32) -> Self {
        KeyCmp {
            offs,
            recsize,
            desc: true,
        }
    }
}

impl Compare for KeyCmp {
    fn compare(&self, left: &[u8], right: &[u8]) -> Ordering {
        if let Some(o) = null_cmp(left, right) {
            return o;
        }
        let mut ord = Ordering::Equal;
        for &off in &self.offs {
            ord = if self.recsize == EDGE_SIZE as u32 && off == edge_off::TIMESTAMP {
                i64_at(left, off).cmp(&i64_at(right, off))
            } else {
                u64_at(left, off).cmp(&u64_at(right, off))
            };
            if ord != Ordering::Equal {
                break;
            }
        }
        if self.desc {
            ord.reverse()
        } else {
            ord
        }
    }
}

/// Stable in-memory sort of the records in `buf`; `buf.len()` must be
/// a multiple of `recsize` (the caller cuts the remainder off).
pub fn mem_sort(buf: &mut [u8], recsize: usize, cmp: &dyn Compare) {
    let n = buf.len() / recsize;
    if n < 2 {
        return;
    }
    let snap = buf[..n * recsize].to_vec();
    let mut idx: Vec<usize> = (0..n).collect();
    idx.sort_by(|&a, &b| {
        cmp.compare(
            &snap[a * recsize..(a + 1) * recsize],
            &snap[b * recsize..(b + 1) * recsize],
        )
    });
    for (i, &j) in idx.iter().enumerate() {
        buf[i * recsize..(i + 1) * recsize].copy_from_slice(&snap[j * recsize..(j + 1) * recsize]);
    }
}

/// Sorts a buffer of whole blocks: every block's records are sorted,
/// then the sorted blocks are merged, respecting the per-block
/// remainder of `block_size - floor(block_size/recsize)*recsize`
/// bytes which never holds record data.
///
/// `buf.len()` must be a multiple of `block_size`.
pub fn mem_merge(
    buf: &mut [u8],
    block_size: usize,
    recsize: usize,
    cmp: &dyn Compare,
) -> Result<()> {
    if block_size == 0 || buf.len() % block_size != 0 {
        return Err(Error::new(
            ErrorKind::Invalid,
            OBJECT,
            "size is not a multiple of the block size",
        ));
    }
    let payload = (block_size / recsize) * recsize;

    buf.par_chunks_mut(block_size)
        .for_each(|chunk| mem_sort(&mut chunk[..payload], recsize, cmp));

    let snap = buf.to_vec();
    let nblocks = buf.len() / block_size;
    // one cursor per block, counted in records
    let mut cur = vec![0usize; nblocks];
    let nrecs = payload / recsize;

    let rec_at = |b: usize, r: usize| -> &[u8] {
        let off = b * block_size + r * recsize;
        &snap[off..off + recsize]
    };

    let mut out_block = 0usize;
    let mut out_rec = 0usize;
    loop {
        let mut best: Option<usize> = None;
        for b in 0..nblocks {
            if cur[b] >= nrecs {
                continue;
            }
            match best {
                None => best = Some(b),
                Some(bb) => {
                    // strictly-less keeps equal keys in block order
                    if cmp.compare(rec_at(b, cur[b]), rec_at(bb, cur[bb])) == Ordering::Less {
                        best = Some(b);
                    }
                }
            }
        }
        let Some(b) = best else { break };
        let dst = out_block * block_size + out_rec * recsize;
        buf[dst..dst + recsize].copy_from_slice(rec_at(b, cur[b]));
        cur[b] += 1;
        out_rec += 1;
        if out_rec == nrecs {
            // zero the remainder and step to the next block
            let tail = out_block * block_size + payload;
            buf[tail..(out_block + 1) * block_size].fill(0);
            out_block += 1;
            out_rec = 0;
        }
    }
    Ok(())
}

/// Payload capacity of a block in records.
fn block_recs(block_size: usize, recsize: usize) -> usize {
    block_size / recsize
}

/// External sort of a ring of blocks.
///
/// Each block is sorted in place, then adjacent runs are merged
/// pairwise through arena blocks until a single sorted run remains in
/// `blocks`. Input blocks go back to the arena as their records are
/// consumed.
pub fn block_sort(
    blocks: &mut VecDeque<Block>,
    arena: &BlockList,
    recsize: u32,
    cmp: &dyn Compare,
) -> Result<()> {
    let recsize = recsize as usize;
    if blocks.len() <= 1 {
        if let Some(b) = blocks.front_mut() {
            let payload = (b.sz / recsize) * recsize;
            mem_sort(&mut b.buf[..payload], recsize, cmp);
        }
        return Ok(());
    }

    // phase 1: sort every block in place
    let mut runs: VecDeque<VecDeque<Block>> = VecDeque::new();
    while let Some(mut b) = blocks.pop_front() {
        let payload = (b.sz / recsize) * recsize;
        mem_sort(&mut b.buf[..payload], recsize, cmp);
        let mut run = VecDeque::new();
        run.push_back(b);
        runs.push_back(run);
    }

    // phase 2: merge adjacent runs until one remains
    while runs.len() > 1 {
        let left = runs.pop_front().unwrap();
        let right = runs.pop_front().unwrap();
        let merged = merge_runs(left, right, arena, recsize, cmp)?;
        runs.push_back(merged);
    }
    *blocks = runs.pop_front().unwrap_or_default();
    Ok(())
}

fn merge_runs(
    left: VecDeque<Block>,
    right: VecDeque<Block>,
    arena: &BlockList,
    recsize: usize,
    cmp: &dyn Compare,
) -> Result<VecDeque<Block>> {
    let rpb = block_recs(arena.block_size(), recsize);

    let mut left = Side::new(left, recsize);
    let mut right = Side::new(right, recsize);
    let mut out: VecDeque<Block> = VecDeque::new();
    let mut cur: Option<Block> = None;
    let mut filled = 0usize;

    loop {
        let pick = {
            let l = left.peek(arena)?;
            let r = right.peek(arena)?;
            match (l, r) {
                (None, None) => break,
                (Some(_), None) => 0,
                (None, Some(_)) => 1,
                (Some(lr), Some(rr)) => {
                    // left wins ties: equal keys preserve input order
                    if cmp.compare(rr, lr) == Ordering::Less {
                        1
                    } else {
                        0
                    }
                }
            }
        };

        if cur.is_none() {
            cur = Some(arena.get()?);
            filled = 0;
        }
        let dst = cur.as_mut().unwrap();
        let rec = if pick == 0 {
            left.pop(arena)?
        } else {
            right.pop(arena)?
        }
        .expect("peeked record vanished");
        dst.buf[filled * recsize..(filled + 1) * recsize].copy_from_slice(&rec);
        filled += 1;
        dst.sz = filled * recsize;
        if filled == rpb {
            out.push_back(cur.take().unwrap());
        }
    }
    if let Some(b) = cur.take() {
        if b.sz > 0 {
            out.push_back(b);
        } else {
            arena.release(b)?;
        }
    }
    Ok(out)
}

/// One input run of a pairwise merge; exhausted blocks are returned
/// to the arena as the cursor passes them.
struct Side {
    run: VecDeque<Block>,
    rec: usize,
    recsize: usize,
}

impl Side {
    fn new(run: VecDeque<Block>, recsize: usize) -> Self {
        Side {
            run,
            rec: 0,
            recsize,
        }
    }

    /// The current record, advancing over exhausted blocks.
    fn peek(&mut self, arena: &BlockList) -> Result<Option<&[u8]>> {
        loop {
            let done = match self.run.front() {
                None => return Ok(None),
                Some(b) => self.rec * self.recsize >= b.sz,
            };
            if done {
                let b = self.run.pop_front().unwrap();
                arena.release(b)?;
                self.rec = 0;
            } else {
                break;
            }
        }
        let b = self.run.front().unwrap();
        let off = self.rec * self.recsize;
        Ok(Some(&b.buf[off..off + self.recsize]))
    }

    /// Copies the current record out and advances.
    fn pop(&mut self, arena: &BlockList) -> Result<Option<Vec<u8>>> {
        let rec = match self.peek(arena)? {
            None => return Ok(None),
            Some(r) => r.to_vec(),
        };
        self.rec += 1;
        Ok(Some(rec))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Edge, PAGE_SIZE};
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn edge_with(origin: u64, ts: i64) -> Edge {
        Edge {
            edge: 1,
            origin,
            destin: 1,
            label: 1,
            timestamp: ts,
            ..Edge::default()
        }
    }

    #[test]
    fn edge_cmp_order_and_nulls() {
        let cmp = EdgeCmp::asc();
        let a = edge_with(1, 5).to_bytes();
        let b = edge_with(2, 1).to_bytes();
        let null = [0u8; EDGE_SIZE];
        assert_eq!(cmp.compare(&a, &b), Ordering::Less);
        assert_eq!(cmp.compare(&a, &null), Ordering::Less);
        assert_eq!(cmp.compare(&null, &a), Ordering::Greater);
        assert_eq!(cmp.compare(&null, &null), Ordering::Equal);
        let d = EdgeCmp::desc();
        assert_eq!(d.compare(&a, &b), Ordering::Greater);
        // null stays greatest under descending order too
        assert_eq!(d.compare(&null, &a), Ordering::Greater);
    }

    #[test]
    fn mem_sort_is_stable() {
        // records with equal keys but distinct edge ids keep order
        let mut buf = Vec::new();
        for id in 0..8u64 {
            let mut e = edge_with(1, 1);
            e.edge = 1; // equal on all key fields
            e.weight = id;
            buf.extend_from_slice(&e.to_bytes());
        }
        mem_sort(&mut buf, EDGE_SIZE, &EdgeCmp::asc());
        for (i, rec) in buf.chunks(EDGE_SIZE).enumerate() {
            assert_eq!(Edge::from_bytes(rec).weight, i as u64);
        }
    }

    #[test]
    fn mem_merge_rejects_bad_size() {
        let mut buf = vec![0u8; PAGE_SIZE + 1];
        let err = mem_merge(&mut buf, PAGE_SIZE, EDGE_SIZE, &EdgeCmp::asc()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invalid);
    }

    #[test]
    fn mem_merge_five_blocks() {
        // 5 blocks of 8192, 64-byte records, primary key uniform in [1,100]
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut buf = vec![0u8; 5 * PAGE_SIZE];
        let rpb = PAGE_SIZE / EDGE_SIZE;
        for b in 0..5 {
            for r in 0..rpb {
                let e = edge_with(rng.gen_range(1..=100), 0);
                let off = b * PAGE_SIZE + r * EDGE_SIZE;
                buf[off..off + EDGE_SIZE].copy_from_slice(&e.to_bytes());
            }
        }
        mem_merge(&mut buf, PAGE_SIZE, EDGE_SIZE, &EdgeCmp::asc()).unwrap();

        let cmp = EdgeCmp::asc();
        let mut count = 0;
        let mut prev: Option<Vec<u8>> = None;
        for b in 0..5 {
            for r in 0..rpb {
                let off = b * PAGE_SIZE + r * EDGE_SIZE;
                let rec = &buf[off..off + EDGE_SIZE];
                assert!(!is_null_rec(rec));
                if let Some(p) = &prev {
                    assert_ne!(cmp.compare(p, rec), Ordering::Greater);
                }
                prev = Some(rec.to_vec());
                count += 1;
            }
        }
        assert_eq!(count, 5 * 128);
    }

    #[test]
    fn block_sort_single_run() {
        let arena = BlockList::new(PAGE_SIZE);
        let mut rng = StdRng::seed_from_u64(42);
        let mut blocks = VecDeque::new();
        let rpb = PAGE_SIZE / EDGE_SIZE;
        let total = 4 * rpb;
        for _ in 0..4 {
            arena.give(&mut blocks).unwrap();
            let b = blocks.back_mut().unwrap();
            for r in 0..rpb {
                let e = edge_with(rng.gen_range(1..=50), rng.gen_range(-10..10));
                b.buf[r * EDGE_SIZE..(r + 1) * EDGE_SIZE].copy_from_slice(&e.to_bytes());
            }
            b.sz = PAGE_SIZE;
        }
        block_sort(&mut blocks, &arena, EDGE_SIZE as u32, &EdgeCmp::asc()).unwrap();

        let cmp = EdgeCmp::asc();
        let mut prev: Option<Vec<u8>> = None;
        let mut count = 0;
        for b in &blocks {
            for rec in b.used().chunks(EDGE_SIZE) {
                if let Some(p) = &prev {
                    assert_ne!(cmp.compare(p, rec), Ordering::Greater);
                }
                prev = Some(rec.to_vec());
                count += 1;
            }
        }
        assert_eq!(count, total);

        // arena identity: everything flows back to the free list
        let held = blocks.len();
        arena.free_all(&mut blocks).unwrap();
        assert!(arena.free_len() >= held);
    }
}
