//! The sort job: waiting file in, sorted reader file out.

use std::collections::VecDeque;
use std::sync::Arc;

use log::debug;

use crate::error::{Error, ErrorKind, Result};
use crate::index::{Indexer, IndexUse};
use crate::io::file::PageWriter;
use crate::mem::BlockList;
use crate::sort::block_sort;
use crate::store::Store;
use crate::task::{Queue, WorkerMsg};
use crate::types::{FileId, PAGE_SIZE};

const OBJECT: &str = "sortwrk";

/// A sort request: one waiting file of one store.
pub struct SortJob {
    /// Name of the store owning the file.
    pub store: String,
    /// The waiting file to sort.
    pub file: FileId,
}

/// Producer handle onto the storage's sort queue; stores enqueue
/// their rotated files through this.
#[derive(Clone)]
pub struct SortHandle {
    queue: Arc<Queue<WorkerMsg<SortJob>>>,
}

impl SortHandle {
    /// Wraps a sorter pool queue.
    pub fn new(queue: Arc<Queue<WorkerMsg<SortJob>>>) -> SortHandle {
        SortHandle { queue }
    }

    /// Enqueues one sort job.
    pub fn enqueue(&self, store: &str, file: FileId) -> Result<()> {
        self.queue.enqueue(WorkerMsg::Job(SortJob {
            store: store.to_owned(),
            file,
        }))
    }
}

/// Sorts one waiting file into a fresh reader file: map, block-merge
/// sort, compressed page-wise write, index population, promotion.
pub fn sort_file(store: &Arc<Store>, file: FileId, arena: &BlockList) -> Result<()> {
    let view = match store.waiting_view(file)? {
        Some(v) => v,
        None => {
            // already promoted by an earlier job
            store.release_claim(file);
            return Ok(());
        }
    };
    match run(store, &view, arena) {
        Ok(()) => {
            debug!(
                "store {}: sorted file {} ({} records)",
                store.name(),
                file,
                view.nrecs()
            );
            Ok(())
        }
        Err(e) => {
            store.release_claim(file);
            if e.is_fatal() {
                store.set_readonly();
            }
            Err(e)
        }
    }
}

fn run(store: &Arc<Store>, view: &crate::io::file::FileView, arena: &BlockList) -> Result<()> {
    let file = view.id;
    let recsize = store.recsize() as usize;
    let payload = view.payload();

    // map the file into arena blocks
    let ctx = store.comp_ctx();
    let mut pager = view.open(&ctx)?;
    let mut blocks: VecDeque<_> = VecDeque::new();
    let mut remaining = view.size as usize;
    let mut raw = Vec::new();
    let needs_dict = store.comp() == crate::io::comp::Comp::Zstd && !ctx.has_dict();
    while let Some(page) = pager.next_page()? {
        let used = remaining.min(payload);
        arena.give(&mut blocks)?;
        let block = blocks.back_mut().ok_or_else(|| {
            Error::new(ErrorKind::Panic, OBJECT, "arena gave no block")
        })?;
        block.buf[..used].copy_from_slice(&page[..used]);
        block.sz = used;
        if needs_dict {
            raw.extend_from_slice(page);
        }
        remaining -= used;
    }

    // first sort on an empty store trains the dictionary
    if needs_dict {
        store.maybe_train_dict(&raw)?;
    }
    let ctx = store.comp_ctx();

    block_sort(&mut blocks, arena, recsize as u32, store.cmp().as_ref())?;

    // write the sorted run into a fresh reader file
    let newid = store.alloc_file_id()?;
    let path = store.data_path(newid);
    let out = write_sorted(store, &blocks, newid, &path, &ctx);
    let (capacity, size) = match out {
        Ok(x) => x,
        Err(e) => {
            let _ = std::fs::remove_file(&path);
            arena.free_all(&mut blocks)?;
            return Err(e);
        }
    };
    arena.free_all(&mut blocks)?;

    store.promote(file, newid, capacity, size, view.min_time, view.max_time)
}

fn write_sorted(
    store: &Arc<Store>,
    blocks: &VecDeque<crate::mem::Block>,
    newid: FileId,
    path: &std::path::Path,
    ctx: &crate::io::comp::CompCtx,
) -> Result<(u32, u32)> {
    let mut writer = PageWriter::create(path, store.comp(), ctx)?;
    let indices = store.indices();
    let mut uses = Vec::with_capacity(indices.len());
    for desc in &indices {
        uses.push(IndexUse::new(desc.clone())?);
    }
    let mut indexers: Vec<Indexer> = indices.iter().map(|d| Indexer::new(d.clone())).collect();

    let mut page = vec![0u8; PAGE_SIZE];
    let mut page_no = 0u32;
    let mut size = 0u32;
    for block in blocks {
        page.fill(0);
        page[..block.sz].copy_from_slice(block.used());
        writer.write_page(&page)?;
        for xer in &mut indexers {
            xer.index_page(newid, page_no, &page)?;
        }
        size += block.sz as u32;
        page_no += 1;
    }
    let capacity = writer.finish()? as u32;
    for desc in &indices {
        desc.idx.flush()?;
    }
    drop(uses);
    Ok((capacity, size))
}
