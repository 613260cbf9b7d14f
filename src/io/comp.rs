//! Per-page zstd compression with optional trained dictionaries.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use zstd::bulk::{Compressor, Decompressor};

use crate::error::{Error, ErrorKind, Result};
use crate::types::PAGE_SIZE;

const OBJECT: &str = "comp";

/// Default zstd compression level for reader files.
pub const DEFAULT_LEVEL: i32 = 3;

/// Maximum size of a trained dictionary on disk.
const DICT_MAX: usize = 112_640;

/// Page compression of a data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comp {
    /// Raw 8 KiB pages.
    Flat,
    /// zstd-compressed pages, each prefixed with a 4-byte LE length.
    Zstd,
}

impl Comp {
    /// The catalog byte for this mode.
    pub fn to_u8(self) -> u8 {
        match self {
            Comp::Flat => 0,
            Comp::Zstd => 1,
        }
    }

    /// Decodes a catalog byte.
    pub fn from_u8(b: u8) -> Result<Comp> {
        match b {
            0 => Ok(Comp::Flat),
            1 => Ok(Comp::Zstd),
            _ => Err(Error::new(
                ErrorKind::Version,
                OBJECT,
                format!("unknown compression {b}"),
            )),
        }
    }
}

/// Compression context of a store: the level and an optional trained
/// dictionary shared by all its files.
#[derive(Clone)]
pub struct CompCtx {
    level: i32,
    dict: Option<Arc<Vec<u8>>>,
}

impl CompCtx {
    /// A context at the given level without a dictionary.
    pub fn new(level: i32) -> Self {
        CompCtx { level, dict: None }
    }

    /// True if a trained dictionary is loaded.
    pub fn has_dict(&self) -> bool {
        self.dict.is_some()
    }

    /// Loads a dictionary from disk if one exists.
    pub fn load_dict(&mut self, path: &Path) -> Result<()> {
        if path.exists() {
            let bytes = fs::read(path)
                .map_err(|e| Error::with_io(ErrorKind::CompDict, OBJECT, "reading dict", e))?;
            self.dict = Some(Arc::new(bytes));
        }
        Ok(())
    }

    /// Trains a dictionary from `samples` (contiguous samples of
    /// `sample_size` bytes each), stores it to `path` and loads it.
    ///
    /// Training is best-effort: on failure the context stays
    /// dictionary-less and compression proceeds without one.
    pub fn train_dict(&mut self, path: &Path, samples: &[u8], sample_size: usize) -> Result<()> {
        if samples.len() < sample_size || sample_size == 0 {
            return Ok(());
        }
        let sizes = vec![sample_size; samples.len() / sample_size];
        let trained = samples.len() - samples.len() % sample_size;
        match zstd::dict::from_continuous(&samples[..trained], &sizes, DICT_MAX) {
            Ok(dict) => {
                fs::write(path, &dict)
                    .map_err(|e| Error::with_io(ErrorKind::Write, OBJECT, "storing dict", e))?;
                self.dict = Some(Arc::new(dict));
                Ok(())
            }
            Err(e) => {
                log::warn!("dictionary training failed, compressing without one: {e}");
                Ok(())
            }
        }
    }

    /// A page compressor bound to this context.
    pub fn compressor(&self) -> Result<PageCompressor> {
        let inner = match &self.dict {
            Some(d) => Compressor::with_dictionary(self.level, d.as_slice()),
            None => Compressor::new(self.level),
        }
        .map_err(|e| Error::with_io(ErrorKind::Comp, OBJECT, "creating compressor", e))?;
        Ok(PageCompressor { inner })
    }

    /// A page decompressor bound to this context.
    pub fn decompressor(&self) -> Result<PageDecompressor> {
        let inner = match &self.dict {
            Some(d) => Decompressor::with_dictionary(d.as_slice()),
            None => Decompressor::new(),
        }
        .map_err(|e| Error::with_io(ErrorKind::Decomp, OBJECT, "creating decompressor", e))?;
        Ok(PageDecompressor { inner })
    }
}

/// Compresses 8 KiB pages into self-delimiting frames.
pub struct PageCompressor {
    inner: Compressor<'static>,
}

impl PageCompressor {
    /// Compresses one page and returns the frame:
    /// 4-byte LE compressed length followed by the payload.
    pub fn compress_page(&mut self, page: &[u8]) -> Result<Vec<u8>> {
        debug_assert_eq!(page.len(), PAGE_SIZE);
        let payload = self
            .inner
            .compress(page)
            .map_err(|e| Error::with_io(ErrorKind::Comp, OBJECT, "compressing page", e))?;
        let mut frame = Vec::with_capacity(payload.len() + 4);
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }
}

/// Decompresses self-delimiting page frames back to 8 KiB pages.
pub struct PageDecompressor {
    inner: Decompressor<'static>,
}

impl PageDecompressor {
    /// Decompresses one frame payload into `page`.
    pub fn decompress_page(&mut self, payload: &[u8], page: &mut [u8]) -> Result<()> {
        let out = self
            .inner
            .decompress(payload, PAGE_SIZE)
            .map_err(|e| Error::with_io(ErrorKind::Decomp, OBJECT, "decompressing page", e))?;
        if out.len() != PAGE_SIZE {
            return Err(Error::new(
                ErrorKind::BadBlock,
                OBJECT,
                format!("decompressed page has {} bytes", out.len()),
            ));
        }
        page[..PAGE_SIZE].copy_from_slice(&out);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_round_trip() {
        let ctx = CompCtx::new(DEFAULT_LEVEL);
        let mut page = vec![0u8; PAGE_SIZE];
        for (i, b) in page.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        let frame = ctx.compressor().unwrap().compress_page(&page).unwrap();
        let len = u32::from_le_bytes(frame[0..4].try_into().unwrap()) as usize;
        assert_eq!(len + 4, frame.len());

        let mut out = vec![0u8; PAGE_SIZE];
        ctx.decompressor()
            .unwrap()
            .decompress_page(&frame[4..], &mut out)
            .unwrap();
        assert_eq!(out, page);
    }

    #[test]
    fn dict_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let dictpath = dir.path().join("cdict");
        let mut ctx = CompCtx::new(DEFAULT_LEVEL);
        // plenty of repetitive samples so training succeeds
        let samples: Vec<u8> = (0..64 * 1024).map(|i| (i % 13) as u8).collect();
        ctx.train_dict(&dictpath, &samples, 1024).unwrap();

        let page = vec![7u8; PAGE_SIZE];
        let frame = ctx.compressor().unwrap().compress_page(&page).unwrap();
        let mut out = vec![0u8; PAGE_SIZE];
        ctx.decompressor()
            .unwrap()
            .decompress_page(&frame[4..], &mut out)
            .unwrap();
        assert_eq!(out, page);

        // a fresh context must be able to load the stored dictionary
        if ctx.has_dict() {
            let mut ctx2 = CompCtx::new(DEFAULT_LEVEL);
            ctx2.load_dict(&dictpath).unwrap();
            assert!(ctx2.has_dict());
        }
    }
}
