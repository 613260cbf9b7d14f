//! Persistent composite-key indices over record stores.
//!
//! An index maps a composite key (the concatenation of selected
//! record fields) plus a page id to a 128-bit bitmap whose bit `i`
//! says that a record with that key sits at slot `i` of the page.
//! The backing store is a sled tree; keys are encoded big-endian so
//! sled's byte order matches the record comparator.

mod indexer;
mod man;

pub use indexer::Indexer;
pub use man::{IndexDesc, IndexManager};

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind, Result};
use crate::sort::KeyCmp;
use crate::types::{edge_off, size_by_off, PageId, EDGE_SIZE};

const OBJECT: &str = "index";

/// Record slots covered by one index page (the bitmap width).
pub const SLOTS_PER_PAGE: usize = 128;

/// The shape of an index: the ordered record offsets forming the
/// composite key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexKeys {
    /// Record offsets, most significant first.
    pub offs: Vec<u16>,
}

impl IndexKeys {
    /// An index shape over the given offsets.
    pub fn new(offs: Vec<u16>) -> Self {
        IndexKeys { offs }
    }

    /// Encoded key size in bytes for records of `recsize`.
    pub fn key_size(&self, recsize: u32) -> usize {
        self.offs
            .iter()
            .map(|&o| size_by_off(recsize, o) as usize)
            .sum()
    }

    /// Extracts the order-preserving key of `rec` into `out`.
    ///
    /// Fields are written big-endian; the edge timestamp has its sign
    /// bit flipped so signed order survives the byte comparison.
    pub fn grab(&self, rec: &[u8], recsize: u32, out: &mut Vec<u8>) {
        for &off in &self.offs {
            let sz = size_by_off(recsize, off) as usize;
            let o = off as usize;
            if sz == 4 {
                let v = LittleEndian::read_u32(&rec[o..o + 4]);
                let mut be = [0u8; 4];
                BigEndian::write_u32(&mut be, v);
                out.extend_from_slice(&be);
            } else {
                let mut v = LittleEndian::read_u64(&rec[o..o + 8]);
                if recsize == EDGE_SIZE as u32 && off == edge_off::TIMESTAMP {
                    v ^= 1 << 63;
                }
                let mut be = [0u8; 8];
                BigEndian::write_u64(&mut be, v);
                out.extend_from_slice(&be);
            }
        }
    }

    /// Encodes literal key field values (already as raw bits, in key
    /// order) into the order-preserving form.
    pub fn encode_values(&self, values: &[u64], recsize: u32) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.key_size(recsize));
        for (i, &off) in self.offs.iter().enumerate() {
            if i >= values.len() {
                break;
            }
            let sz = size_by_off(recsize, off) as usize;
            if sz == 4 {
                let mut be = [0u8; 4];
                BigEndian::write_u32(&mut be, values[i] as u32);
                out.extend_from_slice(&be);
            } else {
                let mut v = values[i];
                if recsize == EDGE_SIZE as u32 && off == edge_off::TIMESTAMP {
                    v ^= 1 << 63;
                }
                let mut be = [0u8; 8];
                BigEndian::write_u64(&mut be, v);
                out.extend_from_slice(&be);
            }
        }
        out
    }

    /// The record comparator matching this key shape.
    pub fn cmp(&self, recsize: u32) -> KeyCmp {
        KeyCmp::asc(self.offs.clone(), recsize)
    }
}

/// One index search or range hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexHit {
    /// The composite key (order-preserving encoding).
    pub key: Vec<u8>,
    /// The page the key occurs on.
    pub page: PageId,
    /// Slot bitmap within that page.
    pub bitmap: [u64; 2],
}

/// OR-merges 16-byte bitmaps; sled calls this on upsert.
fn or_bitmaps(_key: &[u8], old: Option<&[u8]>, new: &[u8]) -> Option<Vec<u8>> {
    let mut v = [0u8; 16];
    if let Some(o) = old {
        v[..o.len().min(16)].copy_from_slice(&o[..o.len().min(16)]);
    }
    for (dst, src) in v.iter_mut().zip(new.iter()) {
        *dst |= *src;
    }
    Some(v.to_vec())
}

fn encode_bitmap(b: &[u64; 2]) -> [u8; 16] {
    let mut out = [0u8; 16];
    LittleEndian::write_u64(&mut out[0..8], b[0]);
    LittleEndian::write_u64(&mut out[8..16], b[1]);
    out
}

fn decode_bitmap(b: &[u8]) -> [u64; 2] {
    [
        LittleEndian::read_u64(&b[0..8]),
        LittleEndian::read_u64(&b[8..16]),
    ]
}

/// A persistent index over one store.
#[derive(Debug)]
pub struct Index {
    tree: sled::Tree,
    db: sled::Db,
    keys: IndexKeys,
    recsize: u32,
    users: AtomicUsize,
    closed: AtomicBool,
}

/// Shared-mode usage token; while any are alive the index cannot be
/// dropped. Acquired through [`IndexUse::new`] on a descriptor.
pub struct IndexUse {
    desc: Arc<man::IndexDesc>,
}

impl IndexUse {
    /// Announces usage of an index; fails once the index is being
    /// dropped.
    pub fn new(desc: Arc<man::IndexDesc>) -> Result<IndexUse> {
        desc.idx.acquire()?;
        Ok(IndexUse { desc })
    }

    /// The descriptor in use.
    pub fn desc(&self) -> &Arc<man::IndexDesc> {
        &self.desc
    }
}

impl Drop for IndexUse {
    fn drop(&mut self) {
        self.desc.idx.release();
    }
}

impl Index {
    /// Opens (or creates) the index at `path`.
    pub fn open(path: &Path, keys: IndexKeys, recsize: u32) -> Result<Index> {
        let db = sled::open(path).map_err(|e| {
            Error::new(ErrorKind::Index, OBJECT, format!("opening {}: {e}", path.display()))
        })?;
        let tree = db
            .open_tree(b"bitmap")
            .map_err(|e| Error::new(ErrorKind::Index, OBJECT, format!("opening tree: {e}")))?;
        tree.set_merge_operator(or_bitmaps);
        Ok(Index {
            tree,
            db,
            keys,
            recsize,
            users: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        })
    }

    /// The key shape.
    pub fn keys(&self) -> &IndexKeys {
        &self.keys
    }

    /// Record size of the indexed store.
    pub fn recsize(&self) -> u32 {
        self.recsize
    }

    fn acquire(&self) -> Result<()> {
        self.users.fetch_add(1, Ordering::AcqRel);
        if self.closed.load(Ordering::Acquire) {
            self.users.fetch_sub(1, Ordering::AcqRel);
            return Err(Error::new(ErrorKind::NoSuchIndex, OBJECT, "index is dropped"));
        }
        Ok(())
    }

    fn release(&self) {
        self.users.fetch_sub(1, Ordering::AcqRel);
    }

    /// Refuses new users and waits for in-flight ones; the step
    /// before dropping the index files.
    pub fn quiesce(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        while self.users.load(Ordering::Acquire) > 0 {
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        Ok(())
    }

    fn full_key(&self, key: &[u8], page: PageId) -> Vec<u8> {
        let mut k = Vec::with_capacity(key.len() + 8);
        k.extend_from_slice(key);
        let mut be = [0u8; 8];
        BigEndian::write_u64(&mut be, page);
        k.extend_from_slice(&be);
        k
    }

    /// ORs the bit for `slot` into the entry `(key, page)`.
    pub fn insert(&self, key: &[u8], page: PageId, slot: u8) -> Result<()> {
        let mut bitmap = [0u64; 2];
        bitmap[(slot >> 6) as usize] |= 1u64 << (slot & 63);
        self.put_bitmap(key, page, &bitmap)
    }

    /// ORs a whole bitmap into the entry `(key, page)`.
    pub fn put_bitmap(&self, key: &[u8], page: PageId, bitmap: &[u64; 2]) -> Result<()> {
        self.tree
            .merge(self.full_key(key, page), &encode_bitmap(bitmap)[..])
            .map_err(|e| Error::new(ErrorKind::Index, OBJECT, format!("merge: {e}")))?;
        Ok(())
    }

    /// All pages holding records with exactly this composite key.
    pub fn search(&self, key: &[u8]) -> Result<Vec<IndexHit>> {
        let mut lo = key.to_vec();
        lo.extend_from_slice(&[0u8; 8]);
        let mut hi = key.to_vec();
        hi.extend_from_slice(&[0xffu8; 8]);
        let mut hits = Vec::new();
        for kv in self.tree.range(lo..=hi) {
            let (k, v) =
                kv.map_err(|e| Error::new(ErrorKind::Index, OBJECT, format!("search: {e}")))?;
            hits.push(split_hit(&k, &v, key.len()));
        }
        Ok(hits)
    }

    /// Iterates entries with keys in `[lo, hi]` (both optional) in
    /// ascending or descending key order.
    pub fn range(
        &self,
        lo: Option<&[u8]>,
        hi: Option<&[u8]>,
        desc: bool,
    ) -> Result<IndexRangeIter> {
        let keylen = self.keys.key_size(self.recsize);
        let lo_full: Vec<u8> = match lo {
            Some(k) => {
                let mut v = k.to_vec();
                v.resize(keylen, 0);
                v.extend_from_slice(&[0u8; 8]);
                v
            }
            None => Vec::new(),
        };
        let hi_full: Vec<u8> = match hi {
            Some(k) => {
                let mut v = k.to_vec();
                v.resize(keylen, 0xff);
                v.extend_from_slice(&[0xffu8; 8]);
                v
            }
            None => vec![0xffu8; keylen + 8],
        };
        let iter = self.tree.range(lo_full..=hi_full);
        Ok(IndexRangeIter {
            iter,
            keylen,
            desc,
        })
    }

    /// Flushes the index to disk.
    pub fn flush(&self) -> Result<()> {
        self.db
            .flush()
            .map_err(|e| Error::new(ErrorKind::Index, OBJECT, format!("flush: {e}")))?;
        Ok(())
    }
}

fn split_hit(k: &[u8], v: &[u8], keylen: usize) -> IndexHit {
    let page = BigEndian::read_u64(&k[keylen..keylen + 8]);
    IndexHit {
        key: k[..keylen].to_vec(),
        page,
        bitmap: decode_bitmap(v),
    }
}

/// Streaming iterator over an index key range.
pub struct IndexRangeIter {
    iter: sled::Iter,
    keylen: usize,
    desc: bool,
}

impl Iterator for IndexRangeIter {
    type Item = Result<IndexHit>;

    fn next(&mut self) -> Option<Self::Item> {
        let kv = if self.desc {
            self.iter.next_back()
        } else {
            self.iter.next()
        };
        match kv {
            None => None,
            Some(Err(e)) => Some(Err(Error::new(
                ErrorKind::Index,
                OBJECT,
                format!("range: {e}"),
            ))),
            Some(Ok((k, v))) => Some(Ok(split_hit(&k, &v, self.keylen))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Edge;

    fn open_test_index(dir: &Path) -> Index {
        let keys = IndexKeys::new(vec![edge_off::ORIGIN, edge_off::DESTIN]);
        Index::open(&dir.join("idx"), keys, EDGE_SIZE as u32).unwrap()
    }

    #[test]
    fn bitmap_accumulates_slots() {
        let dir = tempfile::tempdir().unwrap();
        let idx = open_test_index(dir.path());
        let e = Edge {
            origin: 7,
            destin: 9,
            ..Edge::default()
        };
        let mut key = Vec::new();
        idx.keys().grab(&e.to_bytes(), EDGE_SIZE as u32, &mut key);

        for slot in [0u8, 5, 17] {
            idx.insert(&key, 3, slot).unwrap();
        }
        let hits = idx.search(&key).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].page, 3);
        let expect = (1u64 << 0) | (1 << 5) | (1 << 17);
        assert_eq!(hits[0].bitmap, [expect, 0]);
    }

    #[test]
    fn range_respects_key_order() {
        let dir = tempfile::tempdir().unwrap();
        let idx = open_test_index(dir.path());
        let mut keys = Vec::new();
        for origin in [3u64, 1, 2] {
            let e = Edge {
                origin,
                destin: 1,
                ..Edge::default()
            };
            let mut key = Vec::new();
            idx.keys().grab(&e.to_bytes(), EDGE_SIZE as u32, &mut key);
            idx.insert(&key, origin, 0).unwrap();
            keys.push((origin, key));
        }
        let hits: Vec<_> = idx
            .range(None, None, false)
            .unwrap()
            .map(|h| h.unwrap().page)
            .collect();
        assert_eq!(hits, vec![1, 2, 3]);
        let hits: Vec<_> = idx
            .range(None, None, true)
            .unwrap()
            .map(|h| h.unwrap().page)
            .collect();
        assert_eq!(hits, vec![3, 2, 1]);
    }

    #[test]
    fn timestamp_sign_flip_orders_negatives_first() {
        let keys = IndexKeys::new(vec![edge_off::TIMESTAMP]);
        let neg = Edge {
            timestamp: -5,
            edge: 1,
            ..Edge::default()
        };
        let pos = Edge {
            timestamp: 5,
            edge: 1,
            ..Edge::default()
        };
        let mut kneg = Vec::new();
        let mut kpos = Vec::new();
        keys.grab(&neg.to_bytes(), EDGE_SIZE as u32, &mut kneg);
        keys.grab(&pos.to_bytes(), EDGE_SIZE as u32, &mut kpos);
        assert!(kneg < kpos);
    }
}
