//! The text dictionary: strings to 64-bit keys and back,
//! size-segmented into four buckets with LRU fronts.

use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Mutex;

use lru::LruCache;

use crate::error::{Error, ErrorKind, Result};
use crate::task::mlock;
use crate::types::Key;

const OBJECT: &str = "text";

/// Bucket limits: strings are segmented by length.
const BUCKET_MAX: [usize; 4] = [8, 32, 128, 256];

/// Text dictionary tuning.
#[derive(Debug, Clone, Copy)]
pub struct TextConfig {
    /// Entries per LRU front (one per direction).
    pub lru_size: usize,
}

impl Default for TextConfig {
    fn default() -> Self {
        TextConfig { lru_size: 1024 }
    }
}

struct Bucket {
    s2i: sled::Tree,
    i2s: sled::Tree,
}

/// Bidirectional string ↔ key map with monotonic key generation.
///
/// Keys carry their bucket in the top two bits, so the reverse lookup
/// goes straight to the right tree.
pub struct TextDict {
    db: sled::Db,
    buckets: Vec<Bucket>,
    next32: Mutex<u32>,
    str_cache: Mutex<LruCache<String, Key>>,
    key_cache: Mutex<LruCache<Key, String>>,
}

impl TextDict {
    /// Opens (or creates) the dictionary under `path`.
    pub fn open(path: &Path, cfg: TextConfig) -> Result<TextDict> {
        let db = sled::open(path)
            .map_err(|e| Error::new(ErrorKind::Open, OBJECT, format!("{e}")))?;
        let mut buckets = Vec::with_capacity(BUCKET_MAX.len());
        for max in BUCKET_MAX {
            let s2i = db
                .open_tree(format!("s2i{max}"))
                .map_err(|e| Error::new(ErrorKind::Open, OBJECT, format!("{e}")))?;
            let i2s = db
                .open_tree(format!("i2s{max}"))
                .map_err(|e| Error::new(ErrorKind::Open, OBJECT, format!("{e}")))?;
            buckets.push(Bucket { s2i, i2s });
        }
        let next32 = match db
            .get(b"next32")
            .map_err(|e| Error::new(ErrorKind::Read, OBJECT, format!("{e}")))?
        {
            Some(v) if v.len() == 4 => u32::from_le_bytes([v[0], v[1], v[2], v[3]]),
            _ => 1,
        };
        let cap = NonZeroUsize::new(cfg.lru_size.max(1))
            .ok_or_else(|| Error::new(ErrorKind::Invalid, OBJECT, "lru size"))?;
        Ok(TextDict {
            db,
            buckets,
            next32: Mutex::new(next32),
            str_cache: Mutex::new(LruCache::new(cap)),
            key_cache: Mutex::new(LruCache::new(cap)),
        })
    }

    fn bucket_of(s: &str) -> Result<usize> {
        let len = s.len();
        for (i, &max) in BUCKET_MAX.iter().enumerate() {
            if len <= max {
                return Ok(i);
            }
        }
        Err(Error::new(
            ErrorKind::TooBig,
            OBJECT,
            format!("string of {len} bytes"),
        ))
    }

    /// The key for `s`, creating one if the string is new.
    pub fn get_key(&self, s: &str) -> Result<Key> {
        if let Some(&k) = mlock(&self.str_cache, OBJECT)?.get(s) {
            return Ok(k);
        }
        let b = Self::bucket_of(s)?;
        let bucket = &self.buckets[b];
        let key = match bucket
            .s2i
            .get(s.as_bytes())
            .map_err(|e| Error::new(ErrorKind::Read, OBJECT, format!("{e}")))?
        {
            Some(v) => decode_key(&v)?,
            None => {
                let id = self
                    .db
                    .generate_id()
                    .map_err(|e| Error::new(ErrorKind::Write, OBJECT, format!("{e}")))?;
                if id >= 1 << 62 {
                    return Err(Error::new(ErrorKind::Collision, OBJECT, "key space exhausted"));
                }
                let key = ((b as u64) << 62) | id;
                // first writer wins; a racing insert hands us its key
                match bucket
                    .s2i
                    .compare_and_swap(s.as_bytes(), None as Option<&[u8]>, Some(&key.to_le_bytes()[..]))
                    .map_err(|e| Error::new(ErrorKind::Write, OBJECT, format!("{e}")))?
                {
                    Ok(()) => {
                        bucket
                            .i2s
                            .insert(key.to_le_bytes(), s.as_bytes())
                            .map_err(|e| Error::new(ErrorKind::Write, OBJECT, format!("{e}")))?;
                        key
                    }
                    Err(race) => match race.current {
                        Some(v) => decode_key(&v)?,
                        None => return Err(Error::new(ErrorKind::Collision, OBJECT, s)),
                    },
                }
            }
        };
        mlock(&self.str_cache, OBJECT)?.put(s.to_owned(), key);
        mlock(&self.key_cache, OBJECT)?.put(key, s.to_owned());
        Ok(key)
    }

    /// The string behind a key, if the key exists.
    pub fn get_text(&self, key: Key) -> Result<Option<String>> {
        if let Some(s) = mlock(&self.key_cache, OBJECT)?.get(&key) {
            return Ok(Some(s.clone()));
        }
        let b = (key >> 62) as usize;
        if b >= self.buckets.len() {
            return Ok(None);
        }
        let found = self.buckets[b]
            .i2s
            .get(key.to_le_bytes())
            .map_err(|e| Error::new(ErrorKind::Read, OBJECT, format!("{e}")))?;
        match found {
            None => Ok(None),
            Some(v) => {
                let s = String::from_utf8(v.to_vec())
                    .map_err(|_| Error::new(ErrorKind::Invalid, OBJECT, "non-utf8 text"))?;
                mlock(&self.key_cache, OBJECT)?.put(key, s.clone());
                mlock(&self.str_cache, OBJECT)?.put(s.clone(), key);
                Ok(Some(s))
            }
        }
    }

    /// A compact 32-bit key for small contexts (type names and the
    /// like). Monotonic, persisted with the dictionary.
    pub fn get_key32(&self, s: &str) -> Result<u32> {
        let tree = self
            .db
            .open_tree("s2i_32bit")
            .map_err(|e| Error::new(ErrorKind::Open, OBJECT, format!("{e}")))?;
        if let Some(v) = tree
            .get(s.as_bytes())
            .map_err(|e| Error::new(ErrorKind::Read, OBJECT, format!("{e}")))?
        {
            if v.len() == 4 {
                return Ok(u32::from_le_bytes([v[0], v[1], v[2], v[3]]));
            }
        }
        let mut next = mlock(&self.next32, OBJECT)?;
        let id = *next;
        *next = next
            .checked_add(1)
            .ok_or_else(|| Error::new(ErrorKind::Collision, OBJECT, "32-bit key space exhausted"))?;
        self.db
            .insert(b"next32", &next.to_le_bytes())
            .map_err(|e| Error::new(ErrorKind::Write, OBJECT, format!("{e}")))?;
        tree.insert(s.as_bytes(), &id.to_le_bytes())
            .map_err(|e| Error::new(ErrorKind::Write, OBJECT, format!("{e}")))?;
        Ok(id)
    }

    /// Flushes the dictionary to disk.
    pub fn flush(&self) -> Result<()> {
        self.db
            .flush()
            .map_err(|e| Error::new(ErrorKind::Flush, OBJECT, format!("{e}")))?;
        Ok(())
    }
}

fn decode_key(v: &[u8]) -> Result<Key> {
    if v.len() != 8 {
        return Err(Error::new(ErrorKind::Invalid, OBJECT, "malformed key"));
    }
    Ok(u64::from_le_bytes([
        v[0], v[1], v[2], v[3], v[4], v[5], v[6], v[7],
    ]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_all_buckets() {
        let dir = tempfile::tempdir().unwrap();
        let dict = TextDict::open(dir.path(), TextConfig::default()).unwrap();
        let samples = [
            "short".to_owned(),
            "a".repeat(20),
            "b".repeat(100),
            "c".repeat(200),
        ];
        for s in &samples {
            let k = dict.get_key(s).unwrap();
            assert_eq!(dict.get_key(s).unwrap(), k);
            assert_eq!(dict.get_text(k).unwrap().as_deref(), Some(s.as_str()));
        }
    }

    #[test]
    fn too_long_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let dict = TextDict::open(dir.path(), TextConfig::default()).unwrap();
        let long = "x".repeat(257);
        assert_eq!(dict.get_key(&long).unwrap_err().kind(), ErrorKind::TooBig);
    }

    #[test]
    fn keys_are_distinct_and_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_owned();
        let (ka, kb);
        {
            let dict = TextDict::open(&path, TextConfig::default()).unwrap();
            ka = dict.get_key("alpha").unwrap();
            kb = dict.get_key("beta").unwrap();
            assert_ne!(ka, kb);
            dict.flush().unwrap();
        }
        let dict = TextDict::open(&path, TextConfig::default()).unwrap();
        assert_eq!(dict.get_key("alpha").unwrap(), ka);
        assert_eq!(dict.get_text(kb).unwrap().as_deref(), Some("beta"));
    }

    #[test]
    fn small_keys_count_up() {
        let dir = tempfile::tempdir().unwrap();
        let dict = TextDict::open(dir.path(), TextConfig::default()).unwrap();
        let a = dict.get_key32("role_a").unwrap();
        let b = dict.get_key32("role_b").unwrap();
        assert_eq!(dict.get_key32("role_a").unwrap(), a);
        assert_eq!(b, a + 1);
    }
}
