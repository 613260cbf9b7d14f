use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind, Result};
use crate::index::{Index, IndexKeys};
use crate::task::{rlock, wlock};

const OBJECT: &str = "idxman";

/// Durable index metadata.
#[derive(Serialize, Deserialize)]
struct DescMeta {
    name: String,
    ctx: String,
    offs: Vec<u16>,
    recsize: u32,
}

/// An index descriptor: name, owning context, key shape and the open
/// index.
#[derive(Debug)]
pub struct IndexDesc {
    /// Index name, unique per manager.
    pub name: String,
    /// Name of the owning context (store).
    pub ctx: String,
    /// The composite-key shape.
    pub keys: IndexKeys,
    /// The open index.
    pub idx: Index,
}

/// Owns all index descriptors of a scope and their on-disk layout
/// (`<base>/<ctx>/indices/<name>/`).
pub struct IndexManager {
    base: PathBuf,
    descs: RwLock<HashMap<String, Arc<IndexDesc>>>,
}

impl IndexManager {
    fn index_dir(base: &Path, ctx: &str, name: &str) -> PathBuf {
        base.join(ctx).join("indices").join(name)
    }

    /// Opens the manager, loading every index found under the
    /// contexts of `base`.
    pub fn open(base: &Path, contexts: &[String]) -> Result<IndexManager> {
        let mut descs = HashMap::new();
        for ctx in contexts {
            let dir = base.join(ctx).join("indices");
            if !dir.exists() {
                continue;
            }
            let entries = fs::read_dir(&dir)
                .map_err(|e| Error::with_io(ErrorKind::Open, OBJECT, "indices dir", e))?;
            for entry in entries {
                let entry =
                    entry.map_err(|e| Error::with_io(ErrorKind::Read, OBJECT, "indices dir", e))?;
                let meta_path = entry.path().join("desc.json");
                if !meta_path.exists() {
                    continue;
                }
                let raw = fs::read_to_string(&meta_path)
                    .map_err(|e| Error::with_io(ErrorKind::Read, OBJECT, "desc.json", e))?;
                let meta: DescMeta = serde_json::from_str(&raw).map_err(|e| {
                    Error::new(ErrorKind::Catalog, OBJECT, format!("desc.json: {e}"))
                })?;
                let keys = IndexKeys::new(meta.offs.clone());
                let idx = Index::open(&entry.path().join("tree"), keys.clone(), meta.recsize)?;
                descs.insert(
                    meta.name.clone(),
                    Arc::new(IndexDesc {
                        name: meta.name,
                        ctx: meta.ctx,
                        keys,
                        idx,
                    }),
                );
            }
        }
        Ok(IndexManager {
            base: base.to_owned(),
            descs: RwLock::new(descs),
        })
    }

    /// Creates a new index and registers it.
    pub fn create(
        &self,
        name: &str,
        ctx: &str,
        keys: IndexKeys,
        recsize: u32,
    ) -> Result<Arc<IndexDesc>> {
        let mut descs = wlock(&self.descs, OBJECT)?;
        if descs.contains_key(name) {
            return Err(Error::new(ErrorKind::DupName, OBJECT, name));
        }
        let dir = Self::index_dir(&self.base, ctx, name);
        fs::create_dir_all(&dir)
            .map_err(|e| Error::with_io(ErrorKind::Create, OBJECT, "index dir", e))?;
        let meta = DescMeta {
            name: name.to_owned(),
            ctx: ctx.to_owned(),
            offs: keys.offs.clone(),
            recsize,
        };
        let raw = serde_json::to_string_pretty(&meta)
            .map_err(|e| Error::new(ErrorKind::Catalog, OBJECT, format!("desc.json: {e}")))?;
        fs::write(dir.join("desc.json"), raw)
            .map_err(|e| Error::with_io(ErrorKind::Write, OBJECT, "desc.json", e))?;
        let idx = Index::open(&dir.join("tree"), keys.clone(), recsize)?;
        let desc = Arc::new(IndexDesc {
            name: name.to_owned(),
            ctx: ctx.to_owned(),
            keys,
            idx,
        });
        descs.insert(name.to_owned(), desc.clone());
        Ok(desc)
    }

    /// Looks an index up by name.
    pub fn get(&self, name: &str) -> Result<Arc<IndexDesc>> {
        rlock(&self.descs, OBJECT)?
            .get(name)
            .cloned()
            .ok_or_else(|| Error::new(ErrorKind::NoSuchIndex, OBJECT, name))
    }

    /// All indices registered for a context.
    pub fn by_ctx(&self, ctx: &str) -> Result<Vec<Arc<IndexDesc>>> {
        Ok(rlock(&self.descs, OBJECT)?
            .values()
            .filter(|d| d.ctx == ctx)
            .cloned()
            .collect())
    }

    /// Drops an index: unregisters it, waits for in-flight users and
    /// removes its files. No new reader can see the index once this
    /// returns.
    pub fn drop_index(&self, name: &str) -> Result<Arc<IndexDesc>> {
        let desc = {
            let mut descs = wlock(&self.descs, OBJECT)?;
            descs
                .remove(name)
                .ok_or_else(|| Error::new(ErrorKind::NoSuchIndex, OBJECT, name))?
        };
        desc.idx.quiesce()?;
        let dir = Self::index_dir(&self.base, &desc.ctx, name);
        if let Err(e) = fs::remove_dir_all(&dir) {
            log::warn!("removing index dir {}: {e}", dir.display());
        }
        Ok(desc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{edge_off, EDGE_SIZE};

    #[test]
    fn create_get_drop() {
        let dir = tempfile::tempdir().unwrap();
        let man = IndexManager::open(dir.path(), &[]).unwrap();
        let keys = IndexKeys::new(vec![edge_off::ORIGIN]);
        man.create("idx_o", "sales", keys.clone(), EDGE_SIZE as u32)
            .unwrap();
        assert!(man.get("idx_o").is_ok());
        assert_eq!(
            man.create("idx_o", "sales", keys, EDGE_SIZE as u32)
                .unwrap_err()
                .kind(),
            ErrorKind::DupName
        );
        assert_eq!(man.by_ctx("sales").unwrap().len(), 1);

        man.drop_index("idx_o").unwrap();
        assert_eq!(man.get("idx_o").unwrap_err().kind(), ErrorKind::NoSuchIndex);
    }

    #[test]
    fn reopens_persisted_indices() {
        let dir = tempfile::tempdir().unwrap();
        {
            let man = IndexManager::open(dir.path(), &[]).unwrap();
            man.create(
                "idx_od",
                "sales",
                IndexKeys::new(vec![edge_off::ORIGIN, edge_off::DESTIN]),
                EDGE_SIZE as u32,
            )
            .unwrap();
        }
        let man = IndexManager::open(dir.path(), &["sales".to_owned()]).unwrap();
        let desc = man.get("idx_od").unwrap();
        assert_eq!(desc.keys.offs, vec![edge_off::ORIGIN, edge_off::DESTIN]);
    }
}
