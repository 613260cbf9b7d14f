//! The store catalog: fixed-width entries, CRC, atomic rename.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, ErrorKind, Result};
use crate::io::comp::Comp;
use crate::io::file::FileRole;
use crate::time::Time;
use crate::types::FileId;

const OBJECT: &str = "catalog";

const VERSION: u8 = 1;
const ENTRY_SIZE: usize = 32;

/// One catalog entry: the durable state of one non-spare file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatEntry {
    /// File id.
    pub id: FileId,
    /// Allocated bytes.
    pub capacity: u32,
    /// Bytes of record data.
    pub size: u32,
    /// Smallest record timestamp.
    pub min_time: Time,
    /// Largest record timestamp.
    pub max_time: Time,
    /// Role of the file.
    pub role: FileRole,
    /// Page compression.
    pub comp: Comp,
    /// Encryption marker; 0 means plain.
    pub encp: u8,
}

fn bkp_path(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(".bkp");
    PathBuf::from(s)
}

fn encode(entries: &[CatEntry]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + entries.len() * ENTRY_SIZE + 4);
    buf.push(VERSION);
    for e in entries {
        let mut rec = [0u8; ENTRY_SIZE];
        LittleEndian::write_u32(&mut rec[0..4], e.id);
        LittleEndian::write_u32(&mut rec[4..8], e.capacity);
        LittleEndian::write_u32(&mut rec[8..12], e.size);
        LittleEndian::write_i64(&mut rec[12..20], e.min_time);
        LittleEndian::write_i64(&mut rec[20..28], e.max_time);
        rec[28] = e.role.to_u8();
        rec[29] = e.comp.to_u8();
        rec[30] = e.encp;
        buf.extend_from_slice(&rec);
    }
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&buf);
    let crc = hasher.finalize();
    buf.extend_from_slice(&crc.to_le_bytes());
    buf
}

fn decode(buf: &[u8]) -> Result<Vec<CatEntry>> {
    if buf.len() < 5 {
        return Err(Error::new(ErrorKind::Catalog, OBJECT, "truncated catalog"));
    }
    let (body, crc_bytes) = buf.split_at(buf.len() - 4);
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(body);
    if hasher.finalize() != LittleEndian::read_u32(crc_bytes) {
        return Err(Error::new(ErrorKind::Catalog, OBJECT, "checksum mismatch"));
    }
    if body[0] != VERSION {
        return Err(Error::new(
            ErrorKind::Version,
            OBJECT,
            format!("catalog version {}", body[0]),
        ));
    }
    let body = &body[1..];
    if body.len() % ENTRY_SIZE != 0 {
        return Err(Error::new(ErrorKind::Catalog, OBJECT, "malformed entries"));
    }
    let mut entries = Vec::with_capacity(body.len() / ENTRY_SIZE);
    for rec in body.chunks(ENTRY_SIZE) {
        entries.push(CatEntry {
            id: LittleEndian::read_u32(&rec[0..4]),
            capacity: LittleEndian::read_u32(&rec[4..8]),
            size: LittleEndian::read_u32(&rec[8..12]),
            min_time: LittleEndian::read_i64(&rec[12..20]),
            max_time: LittleEndian::read_i64(&rec[20..28]),
            role: FileRole::from_u8(rec[28])?,
            comp: Comp::from_u8(rec[29])?,
            encp: rec[30],
        });
    }
    Ok(entries)
}

/// Writes the catalog atomically: write-to-temp, fsync, rotate the
/// live catalog to `.bkp`, rename the temp over the live catalog.
pub fn write(path: &Path, entries: &[CatEntry]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    let buf = encode(entries);
    {
        let mut f = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&tmp)
            .map_err(|e| Error::with_io(ErrorKind::Create, OBJECT, "temp catalog", e))?;
        f.write_all(&buf)
            .map_err(|e| Error::with_io(ErrorKind::Write, OBJECT, "temp catalog", e))?;
        f.sync_data()
            .map_err(|e| Error::with_io(ErrorKind::Sync, OBJECT, "temp catalog", e))?;
    }
    if path.exists() {
        fs::rename(path, bkp_path(path))
            .map_err(|e| Error::with_io(ErrorKind::Move, OBJECT, "rotating backup", e))?;
    }
    fs::rename(&tmp, path)
        .map_err(|e| Error::with_io(ErrorKind::Move, OBJECT, "installing catalog", e))?;
    if let Some(dir) = path.parent() {
        if let Ok(d) = File::open(dir) {
            let _ = d.sync_all();
        }
    }
    Ok(())
}

/// Reads the catalog, falling back to the `.bkp` sibling when the
/// live catalog is missing or fails to parse.
pub fn read(path: &Path) -> Result<Vec<CatEntry>> {
    match fs::read(path) {
        Ok(buf) => match decode(&buf) {
            Ok(entries) => return Ok(entries),
            Err(e) => log::warn!("catalog {} unreadable, trying backup: {e}", path.display()),
        },
        Err(e) => log::warn!("catalog {} missing, trying backup: {e}", path.display()),
    }
    let bkp = bkp_path(path);
    let buf = fs::read(&bkp)
        .map_err(|e| Error::with_io(ErrorKind::Catalog, OBJECT, "no catalog and no backup", e))?;
    decode(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: u32, role: FileRole) -> CatEntry {
        CatEntry {
            id,
            capacity: 1 << 20,
            size: 4096,
            min_time: -5,
            max_time: 77,
            role,
            comp: Comp::Zstd,
            encp: 0,
        }
    }

    #[test]
    fn round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog");
        let entries = vec![entry(1, FileRole::Writer), entry(2, FileRole::Reader)];
        write(&path, &entries).unwrap();
        assert_eq!(read(&path).unwrap(), entries);
    }

    #[test]
    fn falls_back_to_backup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog");
        let old = vec![entry(1, FileRole::Waiting)];
        write(&path, &old).unwrap();
        let new = vec![entry(1, FileRole::Reader), entry(9, FileRole::Writer)];
        write(&path, &new).unwrap();

        // corrupt the live catalog; the previous version must win
        fs::write(&path, b"garbage").unwrap();
        assert_eq!(read(&path).unwrap(), old);
    }

    #[test]
    fn rejects_bad_checksum() {
        let mut buf = encode(&[entry(3, FileRole::Spare)]);
        let last = buf.len() - 1;
        buf[last] ^= 0xff;
        assert!(decode(&buf).is_err());
    }
}
