use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::Result;
use crate::index::{IndexDesc, SLOTS_PER_PAGE};
use crate::types::{is_null_rec, FileId, PageId, PAGE_SIZE};

/// Batches a sorted page's worth of index inserts.
///
/// Every record's composite key is upserted into an in-memory
/// ordered tree with the record's slot bit ORed into the entry; the
/// tree is then flushed into the index in key order, one upsert per
/// unique `(key, page)` pair.
pub struct Indexer {
    desc: Arc<IndexDesc>,
    batch: BTreeMap<(Vec<u8>, PageId), [u64; 2]>,
}

impl Indexer {
    /// An indexer feeding the given index.
    pub fn new(desc: Arc<IndexDesc>) -> Indexer {
        Indexer {
            desc,
            batch: BTreeMap::new(),
        }
    }

    /// Indexes one 8 KiB page of a reader file and flushes the batch.
    ///
    /// Index pages cover `SLOTS_PER_PAGE` records, so a disk page of
    /// small records spans more than one index page id.
    pub fn index_page(&mut self, file: FileId, page_no: u32, page: &[u8]) -> Result<()> {
        let recsize = self.desc.idx.recsize() as usize;
        let rpp = PAGE_SIZE / recsize;
        let mut key = Vec::new();
        for slot in 0..rpp {
            let rec = &page[slot * recsize..(slot + 1) * recsize];
            if is_null_rec(rec) {
                continue;
            }
            key.clear();
            self.desc
                .keys
                .grab(rec, self.desc.idx.recsize(), &mut key);
            let global = page_no as usize * rpp + slot;
            let chunk = (global / SLOTS_PER_PAGE) as u64;
            let bit = global % SLOTS_PER_PAGE;
            let page_id: PageId = ((file as u64) << 32) | chunk;
            let entry = self
                .batch
                .entry((key.clone(), page_id))
                .or_insert([0u64; 2]);
            entry[bit >> 6] |= 1u64 << (bit & 63);
        }
        self.flush()
    }

    /// Flushes the batched unique keys into the index in order.
    fn flush(&mut self) -> Result<()> {
        for ((key, page), bitmap) in std::mem::take(&mut self.batch) {
            self.desc.idx.put_bitmap(&key, page, &bitmap)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{IndexKeys, IndexManager};
    use crate::types::{edge_off, Edge, EDGE_SIZE};

    #[test]
    fn three_records_one_key_set_three_bits() {
        let dir = tempfile::tempdir().unwrap();
        let man = IndexManager::open(dir.path(), &[]).unwrap();
        let desc = man
            .create(
                "idx_od",
                "sales",
                IndexKeys::new(vec![edge_off::ORIGIN, edge_off::DESTIN]),
                EDGE_SIZE as u32,
            )
            .unwrap();

        let mut page = vec![0u8; PAGE_SIZE];
        for slot in 0..(PAGE_SIZE / EDGE_SIZE) {
            let e = if matches!(slot, 0 | 5 | 17) {
                Edge {
                    origin: 7,
                    destin: 9,
                    edge: slot as u64,
                    ..Edge::default()
                }
            } else {
                Edge {
                    origin: 1,
                    destin: slot as u64 + 100,
                    edge: slot as u64,
                    ..Edge::default()
                }
            };
            e.write_to(&mut page[slot * EDGE_SIZE..(slot + 1) * EDGE_SIZE]);
        }

        let mut xer = Indexer::new(desc.clone());
        xer.index_page(4, 0, &page).unwrap();

        let probe = Edge {
            origin: 7,
            destin: 9,
            ..Edge::default()
        };
        let mut key = Vec::new();
        desc.keys.grab(&probe.to_bytes(), EDGE_SIZE as u32, &mut key);
        let hits = desc.idx.search(&key).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].page, 4u64 << 32);
        let expect = (1u64 << 0) | (1 << 5) | (1 << 17);
        assert_eq!(hits[0].bitmap, [expect, 0]);
    }
}
