//! Fixed-size data files with page-aligned blocks: writer and
//! reader roles, memory-mapped or stream-decompressed access.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use crate::error::{Error, ErrorKind, Result};
use crate::io::comp::{Comp, CompCtx, PageCompressor, PageDecompressor};
use crate::time::Time;
use crate::types::{is_null_rec, FileId, PAGE_SIZE};

const OBJECT: &str = "file";

/// Role of a data file within its store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileRole {
    /// The store's current append target.
    Writer,
    /// Pre-allocated and empty, may become a writer on rotation.
    Spare,
    /// Full and unsorted, queued for the sort worker.
    Waiting,
    /// Sorted, possibly compressed, read-optimized.
    Reader,
}

impl FileRole {
    /// The catalog byte for this role.
    pub fn to_u8(self) -> u8 {
        match self {
            FileRole::Writer => 0,
            FileRole::Spare => 1,
            FileRole::Waiting => 2,
            FileRole::Reader => 3,
        }
    }

    /// Decodes a catalog byte.
    pub fn from_u8(b: u8) -> Result<FileRole> {
        match b {
            0 => Ok(FileRole::Writer),
            1 => Ok(FileRole::Spare),
            2 => Ok(FileRole::Waiting),
            3 => Ok(FileRole::Reader),
            _ => Err(Error::new(
                ErrorKind::Version,
                OBJECT,
                format!("unknown file role {b}"),
            )),
        }
    }
}

/// A snapshot of one data file, sufficient to read it without the
/// store. `get_files` hands lists of these to readers; the caller
/// owns the snapshot.
#[derive(Clone)]
pub struct FileView {
    /// File id, unique within the store.
    pub id: FileId,
    /// Path of the file on disk.
    pub path: PathBuf,
    /// Bytes of record data the file holds.
    pub size: u32,
    /// Allocated bytes.
    pub capacity: u32,
    /// Record size in bytes.
    pub recsize: u32,
    /// Page compression.
    pub comp: Comp,
    /// Role at snapshot time.
    pub role: FileRole,
    /// Smallest record timestamp.
    pub min_time: Time,
    /// Largest record timestamp.
    pub max_time: Time,
    /// The writer's partial page at snapshot time, if any.
    pub tail: Option<Vec<u8>>,
}

impl FileView {
    /// Records per page.
    pub fn rpp(&self) -> usize {
        PAGE_SIZE / self.recsize as usize
    }

    /// Record bytes per page; the rest of the page is the remainder.
    pub fn payload(&self) -> usize {
        self.rpp() * self.recsize as usize
    }

    /// Number of records in the file.
    pub fn nrecs(&self) -> usize {
        self.size as usize / self.recsize as usize
    }

    /// Pages persisted on disk (excludes the in-memory tail).
    ///
    /// With a tail snapshot only the full pages are on disk; without
    /// one the last, partially-filled page was flushed zero-padded.
    pub fn disk_pages(&self) -> u32 {
        let payload = self.payload();
        match &self.tail {
            Some(t) => ((self.size as usize - t.len()) / payload) as u32,
            None => self.size.div_ceil(payload as u32) as u32,
        }
    }

    /// Logical pages including the tail.
    pub fn pages(&self) -> u32 {
        self.disk_pages() + self.tail.is_some() as u32
    }

    /// Whether the window `[since, until]` intersects the file's
    /// time range.
    pub fn in_window(&self, since: Time, until: Time) -> bool {
        self.size > 0 && self.min_time <= until && self.max_time >= since
    }

    /// Opens the file for page-wise reading.
    pub fn open(&self, ctx: &CompCtx) -> Result<FilePager> {
        FilePager::new(self, ctx)
    }
}

enum Source {
    Empty,
    Mapped(Mmap),
    Stream {
        file: BufReader<File>,
        decomp: PageDecompressor,
        pos: u32,
    },
}

/// Pulls 8 KiB logical pages out of one data file: memory-mapped for
/// uncompressed files, stream-decompressed for compressed ones.
pub struct FilePager {
    source: Source,
    disk_pages: u32,
    next: u32,
    page: Box<[u8]>,
    tail: Option<Vec<u8>>,
    payload: usize,
}

impl FilePager {
    fn new(view: &FileView, ctx: &CompCtx) -> Result<FilePager> {
        let disk_pages = view.disk_pages();
        let source = if view.size == 0 || (disk_pages == 0 && view.tail.is_none()) {
            Source::Empty
        } else {
            match view.comp {
                Comp::Flat => {
                    let file = File::open(&view.path).map_err(|e| {
                        Error::with_io(ErrorKind::Open, OBJECT, view.path.display().to_string(), e)
                    })?;
                    if disk_pages == 0 {
                        Source::Empty
                    } else {
                        // Safety: files are written page-wise and never
                        // truncated while a snapshot is alive.
                        let map = unsafe { Mmap::map(&file) }.map_err(|e| {
                            Error::with_io(ErrorKind::Map, OBJECT, view.path.display().to_string(), e)
                        })?;
                        Source::Mapped(map)
                    }
                }
                Comp::Zstd => {
                    let file = File::open(&view.path).map_err(|e| {
                        Error::with_io(ErrorKind::Open, OBJECT, view.path.display().to_string(), e)
                    })?;
                    Source::Stream {
                        file: BufReader::new(file),
                        decomp: ctx.decompressor()?,
                        pos: 0,
                    }
                }
            }
        };
        Ok(FilePager {
            source,
            disk_pages,
            next: 0,
            page: vec![0u8; PAGE_SIZE].into_boxed_slice(),
            tail: view.tail.clone(),
            payload: view.payload(),
        })
    }

    /// Logical page count.
    pub fn page_count(&self) -> u32 {
        self.disk_pages + self.tail.is_some() as u32
    }

    /// Yields the next logical page, or `None` at the end.
    pub fn next_page(&mut self) -> Result<Option<&[u8]>> {
        let n = self.next;
        if n >= self.page_count() {
            return Ok(None);
        }
        self.load(n)?;
        self.next = n + 1;
        Ok(Some(&self.page))
    }

    /// Positions on page `n`; for compressed files positioning
    /// backwards restarts the stream from the head.
    pub fn seek_page(&mut self, n: u32) -> Result<()> {
        if n >= self.page_count() {
            return Err(Error::new(ErrorKind::Eof, OBJECT, format!("page {n}")));
        }
        self.next = n;
        Ok(())
    }

    /// Reads page `n` directly.
    pub fn read_page(&mut self, n: u32) -> Result<&[u8]> {
        self.seek_page(n)?;
        self.load(n)?;
        self.next = n + 1;
        Ok(&self.page)
    }

    fn load(&mut self, n: u32) -> Result<()> {
        if n >= self.disk_pages {
            // the in-memory tail page
            let tail = self.tail.as_ref().expect("tail page bounds checked");
            self.page.fill(0);
            self.page[..tail.len()].copy_from_slice(tail);
            return Ok(());
        }
        match &mut self.source {
            Source::Empty => Err(Error::new(ErrorKind::Eof, OBJECT, "empty file")),
            Source::Mapped(map) => {
                let off = n as usize * PAGE_SIZE;
                if off + PAGE_SIZE > map.len() {
                    return Err(Error::new(
                        ErrorKind::BadFilesize,
                        OBJECT,
                        format!("page {n} beyond mapping"),
                    ));
                }
                self.page.copy_from_slice(&map[off..off + PAGE_SIZE]);
                Ok(())
            }
            Source::Stream { file, decomp, pos } => {
                if n < *pos {
                    file.seek(SeekFrom::Start(0))
                        .map_err(|e| Error::with_io(ErrorKind::Seek, OBJECT, "rewind", e))?;
                    *pos = 0;
                }
                let mut frame = Vec::new();
                while *pos <= n {
                    let mut lenbuf = [0u8; 4];
                    file.read_exact(&mut lenbuf)
                        .map_err(|e| Error::with_io(ErrorKind::Read, OBJECT, "frame length", e))?;
                    let len = u32::from_le_bytes(lenbuf) as usize;
                    if *pos == n {
                        frame.resize(len, 0);
                        file.read_exact(&mut frame)
                            .map_err(|e| Error::with_io(ErrorKind::Read, OBJECT, "frame", e))?;
                    } else {
                        file.seek(SeekFrom::Current(len as i64))
                            .map_err(|e| Error::with_io(ErrorKind::Seek, OBJECT, "skip frame", e))?;
                    }
                    *pos += 1;
                }
                decomp.decompress_page(&frame, &mut self.page)
            }
        }
    }

    /// Record bytes per page of this file.
    pub fn payload(&self) -> usize {
        self.payload
    }
}

/// The store's append target: an uncompressed, pre-allocated file
/// written page by page.
pub struct FileWriter {
    file: File,
    page: Vec<u8>,
    page_no: u32,
    page_off: usize,
    payload: usize,
    recsize: usize,
}

impl FileWriter {
    /// Creates and pre-allocates a file of `capacity` bytes.
    pub fn create(path: &Path, capacity: u32, recsize: u32) -> Result<FileWriter> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| Error::with_io(ErrorKind::Create, OBJECT, path.display().to_string(), e))?;
        file.set_len(capacity as u64)
            .map_err(|e| Error::with_io(ErrorKind::Reserve, OBJECT, "preallocating", e))?;
        Ok(FileWriter {
            file,
            page: vec![0u8; PAGE_SIZE],
            page_no: 0,
            page_off: 0,
            payload: (PAGE_SIZE / recsize as usize) * recsize as usize,
            recsize: recsize as usize,
        })
    }

    /// Opens an existing writer file positioned at `size` record
    /// bytes, reloading the partial page from disk.
    pub fn open_at(path: &Path, size: u32, recsize: u32) -> Result<FileWriter> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| Error::with_io(ErrorKind::Open, OBJECT, path.display().to_string(), e))?;
        let payload = (PAGE_SIZE / recsize as usize) * recsize as usize;
        let page_no = (size as usize / payload) as u32;
        let page_off = size as usize % payload;
        let mut page = vec![0u8; PAGE_SIZE];
        if page_off > 0 {
            file.seek(SeekFrom::Start(page_no as u64 * PAGE_SIZE as u64))
                .map_err(|e| Error::with_io(ErrorKind::Seek, OBJECT, "partial page", e))?;
            file.read_exact(&mut page)
                .map_err(|e| Error::with_io(ErrorKind::Read, OBJECT, "partial page", e))?;
            page[page_off..].fill(0);
        }
        Ok(FileWriter {
            file,
            page,
            page_no,
            page_off,
            payload,
            recsize: recsize as usize,
        })
    }

    /// Appends one record; flushes the page to disk when it fills.
    pub fn append(&mut self, rec: &[u8]) -> Result<()> {
        debug_assert_eq!(rec.len(), self.recsize);
        self.page[self.page_off..self.page_off + self.recsize].copy_from_slice(rec);
        self.page_off += self.recsize;
        if self.page_off == self.payload {
            self.write_current()?;
            self.page.fill(0);
            self.page_no += 1;
            self.page_off = 0;
        }
        Ok(())
    }

    fn write_current(&mut self) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(self.page_no as u64 * PAGE_SIZE as u64))
            .map_err(|e| Error::with_io(ErrorKind::Seek, OBJECT, "page position", e))?;
        self.file
            .write_all(&self.page)
            .map_err(|e| Error::with_io(ErrorKind::Write, OBJECT, "page", e))?;
        Ok(())
    }

    /// The partial page, if any records are buffered.
    pub fn tail(&self) -> Option<Vec<u8>> {
        if self.page_off > 0 {
            Some(self.page[..self.page_off].to_vec())
        } else {
            None
        }
    }

    /// Flushes the partial page (zero-padded) and syncs to disk.
    pub fn sync(&mut self) -> Result<()> {
        if self.page_off > 0 {
            self.write_current()?;
        }
        self.file
            .sync_data()
            .map_err(|e| Error::with_io(ErrorKind::Sync, OBJECT, "writer file", e))
    }
}

/// Writes the pages of a freshly sorted reader file sequentially,
/// compressing each page when the store is configured for it.
pub struct PageWriter {
    file: BufWriter<File>,
    comp: Option<PageCompressor>,
    written: u64,
}

impl PageWriter {
    /// Creates the output file.
    pub fn create(path: &Path, comp: Comp, ctx: &CompCtx) -> Result<PageWriter> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(path)
            .map_err(|e| Error::with_io(ErrorKind::Create, OBJECT, path.display().to_string(), e))?;
        Ok(PageWriter {
            file: BufWriter::new(file),
            comp: match comp {
                Comp::Flat => None,
                Comp::Zstd => Some(ctx.compressor()?),
            },
            written: 0,
        })
    }

    /// Appends one 8 KiB page.
    pub fn write_page(&mut self, page: &[u8]) -> Result<()> {
        debug_assert_eq!(page.len(), PAGE_SIZE);
        match &mut self.comp {
            None => {
                self.file
                    .write_all(page)
                    .map_err(|e| Error::with_io(ErrorKind::Write, OBJECT, "page", e))?;
                self.written += PAGE_SIZE as u64;
            }
            Some(c) => {
                let frame = c.compress_page(page)?;
                self.file
                    .write_all(&frame)
                    .map_err(|e| Error::with_io(ErrorKind::Write, OBJECT, "frame", e))?;
                self.written += frame.len() as u64;
            }
        }
        Ok(())
    }

    /// Flushes, syncs and returns the bytes written to disk.
    pub fn finish(mut self) -> Result<u64> {
        self.file
            .flush()
            .map_err(|e| Error::with_io(ErrorKind::Flush, OBJECT, "reader file", e))?;
        self.file
            .get_ref()
            .sync_data()
            .map_err(|e| Error::with_io(ErrorKind::Sync, OBJECT, "reader file", e))?;
        Ok(self.written)
    }
}

/// Recovers the record size of a writer file after a crash: scans
/// pages from the front and counts records up to the first null slot.
pub fn recover_size(view: &FileView, ctx: &CompCtx) -> Result<u32> {
    let mut probe = view.clone();
    probe.tail = None;
    // scan every allocated page; size counts record bytes only
    probe.size = ((probe.capacity as usize / PAGE_SIZE) * probe.payload()) as u32;
    let recsize = view.recsize as usize;
    let rpp = view.rpp();
    let mut pager = probe.open(ctx)?;
    let mut nrecs = 0usize;
    'pages: for n in 0..probe.disk_pages() {
        let page = pager.read_page(n)?;
        for slot in 0..rpp {
            let rec = &page[slot * recsize..(slot + 1) * recsize];
            if is_null_rec(rec) {
                break 'pages;
            }
            nrecs += 1;
        }
    }
    Ok((nrecs * recsize) as u32)
}

/// Removes a data file from disk.
pub fn remove(path: &Path) -> Result<()> {
    fs::remove_file(path)
        .map_err(|e| Error::with_io(ErrorKind::Remove, OBJECT, path.display().to_string(), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::comp::DEFAULT_LEVEL;
    use crate::types::{Edge, EDGE_SIZE};

    fn edge(n: u64) -> Edge {
        Edge {
            edge: n,
            origin: n % 7,
            destin: n % 5,
            label: 1,
            timestamp: n as i64,
            ..Edge::default()
        }
    }

    #[test]
    fn write_and_scan_flat() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("1");
        let ctx = CompCtx::new(DEFAULT_LEVEL);
        let mut w = FileWriter::create(&path, 4 * PAGE_SIZE as u32, EDGE_SIZE as u32).unwrap();
        let rpp = PAGE_SIZE / EDGE_SIZE;
        let total = 2 * rpp + 3; // two full pages plus a tail
        for n in 0..total {
            w.append(&edge(n as u64).to_bytes()).unwrap();
        }
        let view = FileView {
            id: 1,
            path: path.clone(),
            size: (total * EDGE_SIZE) as u32,
            capacity: 4 * PAGE_SIZE as u32,
            recsize: EDGE_SIZE as u32,
            comp: Comp::Flat,
            role: FileRole::Writer,
            min_time: 0,
            max_time: total as i64,
            tail: w.tail(),
        };
        assert_eq!(view.pages(), 3);

        let mut pager = view.open(&ctx).unwrap();
        let mut seen = 0;
        while let Some(page) = pager.next_page().unwrap() {
            for slot in 0..rpp {
                let rec = &page[slot * EDGE_SIZE..(slot + 1) * EDGE_SIZE];
                if is_null_rec(rec) {
                    continue;
                }
                assert_eq!(Edge::from_bytes(rec).edge, seen as u64);
                seen += 1;
            }
        }
        assert_eq!(seen, total);
    }

    #[test]
    fn compressed_pages_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("2");
        let ctx = CompCtx::new(DEFAULT_LEVEL);
        let mut w = PageWriter::create(&path, Comp::Zstd, &ctx).unwrap();
        let rpp = PAGE_SIZE / EDGE_SIZE;
        let mut page = vec![0u8; PAGE_SIZE];
        for p in 0..3u64 {
            for slot in 0..rpp {
                edge(p * rpp as u64 + slot as u64)
                    .write_to(&mut page[slot * EDGE_SIZE..(slot + 1) * EDGE_SIZE]);
            }
            w.write_page(&page).unwrap();
        }
        let on_disk = w.finish().unwrap();
        assert!(on_disk < 3 * PAGE_SIZE as u64);

        let view = FileView {
            id: 2,
            path,
            size: (3 * rpp * EDGE_SIZE) as u32,
            capacity: on_disk as u32,
            recsize: EDGE_SIZE as u32,
            comp: Comp::Zstd,
            role: FileRole::Reader,
            min_time: 0,
            max_time: 1000,
            tail: None,
        };
        let mut pager = view.open(&ctx).unwrap();
        // random access backwards forces a stream restart
        let page2 = pager.read_page(2).unwrap().to_vec();
        let page0 = pager.read_page(0).unwrap().to_vec();
        assert_eq!(Edge::from_bytes(&page0[..EDGE_SIZE]).edge, 0);
        assert_eq!(
            Edge::from_bytes(&page2[..EDGE_SIZE]).edge,
            (2 * rpp) as u64
        );
    }

    #[test]
    fn recover_scans_to_first_null() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("3");
        let ctx = CompCtx::new(DEFAULT_LEVEL);
        let mut w = FileWriter::create(&path, 2 * PAGE_SIZE as u32, EDGE_SIZE as u32).unwrap();
        let rpp = PAGE_SIZE / EDGE_SIZE;
        for n in 0..rpp + 5 {
            w.append(&edge(n as u64 + 1).to_bytes()).unwrap();
        }
        w.sync().unwrap();
        drop(w);

        let view = FileView {
            id: 3,
            path,
            size: 0, // catalog is stale after the crash
            capacity: 2 * PAGE_SIZE as u32,
            recsize: EDGE_SIZE as u32,
            comp: Comp::Flat,
            role: FileRole::Writer,
            min_time: 0,
            max_time: 0,
            tail: None,
        };
        let size = recover_size(&view, &ctx).unwrap();
        assert_eq!(size as usize, (rpp + 5) * EDGE_SIZE);
    }
}
