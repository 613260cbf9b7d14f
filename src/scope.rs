//! The scope: one database under one base path.
//!
//! A scope owns the storage (with its sort/sync workers), the named
//! edge contexts, the vertex store, the model, the text dictionary
//! and the index manager, and executes parsed statements.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use log::info;
use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind, Result};
use crate::index::{IndexKeys, IndexManager};
use crate::model::Model;
use crate::query::plan::{self, PlanTarget};
use crate::query::Cursor;
use crate::sql::ast::{Ast, Lit};
use crate::sql::parser;
use crate::store::storage::{Storage, StorageConfig};
use crate::store::{Store, StoreConfig};
use crate::task::{mlock, rlock, wlock};
use crate::text::{TextConfig, TextDict};
use crate::time::SECOND;
use crate::types::{
    edge_off_by_name, Content, Edge, Value, ValueType, Vertex, EDGE_SIZE,
};

const OBJECT: &str = "scope";

/// Name of the scope-wide vertex store.
const VERTEX_STORE: &str = "vertex";

/// Scope construction parameters.
#[derive(Clone)]
pub struct ScopeConfig {
    /// Sizing and worker configuration of the storage.
    pub storage: StorageConfig,
    /// Text dictionary tuning.
    pub text: TextConfig,
    /// Spare files per store.
    pub spares: usize,
}

impl Default for ScopeConfig {
    fn default() -> Self {
        ScopeConfig {
            storage: StorageConfig::default(),
            text: TextConfig::default(),
            spares: 1,
        }
    }
}

/// The durable top-level catalog: the named contexts of the scope.
#[derive(Default, Serialize, Deserialize)]
struct ScopeCatalog {
    contexts: Vec<String>,
}

/// The result of one executed statement.
pub enum StmtResult {
    /// The statement succeeded without output.
    Ok,
    /// A query produced a cursor.
    Rows(Cursor),
    /// A DML statement affected this many records.
    Count(u64),
}

/// One database: stores, schema, dictionary and query machinery
/// under a base path.
pub struct Scope {
    path: PathBuf,
    cfg: ScopeConfig,
    storage: Mutex<Storage>,
    contexts: RwLock<HashMap<String, Arc<Store>>>,
    vertex: Arc<Store>,
    model: Model,
    text: Arc<TextDict>,
    indices: IndexManager,
}

impl Scope {
    fn store_cfg(cfg: &ScopeConfig, name: &str, content: Content) -> StoreConfig {
        StoreConfig {
            name: name.to_owned(),
            content,
            alloc_size: cfg.storage.filesize,
            large_size: cfg.storage.largesize,
            comp: cfg.storage.comp,
            encp: cfg.storage.encp,
            spares: cfg.spares,
        }
    }

    /// Creates a scope under `path` and starts its workers.
    pub fn create(path: &Path, cfg: ScopeConfig) -> Result<Scope> {
        fs::create_dir_all(path)
            .map_err(|e| Error::with_io(ErrorKind::Create, OBJECT, "scope dir", e))?;
        let vertex = Store::create(
            &path.join(VERTEX_STORE),
            &Self::store_cfg(&cfg, VERTEX_STORE, Content::Vertex),
        )?;
        let scope = Self::assemble(path, cfg, vertex, HashMap::new())?;
        scope.flush_catalog()?;
        info!("scope created at {}", path.display());
        Ok(scope)
    }

    /// Opens an existing scope and starts its workers.
    pub fn open(path: &Path, cfg: ScopeConfig) -> Result<Scope> {
        let raw = fs::read_to_string(path.join("catalog"))
            .map_err(|e| Error::with_io(ErrorKind::Catalog, OBJECT, "scope catalog", e))?;
        let cat: ScopeCatalog = serde_json::from_str(&raw)
            .map_err(|e| Error::new(ErrorKind::Catalog, OBJECT, format!("{e}")))?;

        let vertex = Store::open(
            &path.join(VERTEX_STORE),
            &Self::store_cfg(&cfg, VERTEX_STORE, Content::Vertex),
        )?;
        let mut contexts = HashMap::new();
        for name in &cat.contexts {
            let store = Store::open(
                &path.join(name),
                &Self::store_cfg(&cfg, name, Content::Edge),
            )?;
            contexts.insert(name.clone(), store);
        }
        Self::assemble(path, cfg, vertex, contexts)
    }

    fn assemble(
        path: &Path,
        cfg: ScopeConfig,
        vertex: Arc<Store>,
        contexts: HashMap<String, Arc<Store>>,
    ) -> Result<Scope> {
        let mut storage = Storage::new("scope", cfg.storage.clone());
        storage.add_store(vertex.clone())?;
        for store in contexts.values() {
            storage.add_store(store.clone())?;
        }
        storage.start()?;

        let model = Model::open(&path.join("model"))?;
        let text = Arc::new(TextDict::open(&path.join("text"), cfg.text)?);

        let mut ctx_names: Vec<String> = contexts.keys().cloned().collect();
        ctx_names.push(VERTEX_STORE.to_owned());
        let indices = IndexManager::open(path, &ctx_names)?;
        for (name, store) in &contexts {
            for desc in indices.by_ctx(name)? {
                store.register_index(desc)?;
            }
        }
        for desc in indices.by_ctx(VERTEX_STORE)? {
            vertex.register_index(desc)?;
        }

        Ok(Scope {
            path: path.to_owned(),
            cfg,
            storage: Mutex::new(storage),
            contexts: RwLock::new(contexts),
            vertex,
            model,
            text,
            indices,
        })
    }

    fn flush_catalog(&self) -> Result<()> {
        let cat = ScopeCatalog {
            contexts: rlock(&self.contexts, OBJECT)?.keys().cloned().collect(),
        };
        let raw = serde_json::to_string_pretty(&cat)
            .map_err(|e| Error::new(ErrorKind::Catalog, OBJECT, format!("{e}")))?;
        let tmp = self.path.join("catalog.tmp");
        fs::write(&tmp, raw)
            .map_err(|e| Error::with_io(ErrorKind::Write, OBJECT, "scope catalog", e))?;
        fs::rename(&tmp, self.path.join("catalog"))
            .map_err(|e| Error::with_io(ErrorKind::Move, OBJECT, "scope catalog", e))?;
        Ok(())
    }

    /// The text dictionary.
    pub fn text(&self) -> Arc<TextDict> {
        self.text.clone()
    }

    /// The model.
    pub fn model(&self) -> &Model {
        &self.model
    }

    /// The scope-wide vertex store.
    pub fn vertex_store(&self) -> Arc<Store> {
        self.vertex.clone()
    }

    /// Looks a context up by name.
    pub fn context(&self, name: &str) -> Result<Arc<Store>> {
        rlock(&self.contexts, OBJECT)?
            .get(name)
            .cloned()
            .ok_or_else(|| Error::new(ErrorKind::NoSuchContext, OBJECT, name))
    }

    /// Creates a new edge context.
    pub fn create_context(&self, name: &str) -> Result<Arc<Store>> {
        {
            let contexts = rlock(&self.contexts, OBJECT)?;
            if contexts.contains_key(name) || name == VERTEX_STORE {
                return Err(Error::new(ErrorKind::DupName, OBJECT, name));
            }
        }
        let store = Store::create(
            &self.path.join(name),
            &Self::store_cfg(&self.cfg, name, Content::Edge),
        )?;
        mlock(&self.storage, OBJECT)?.add_store(store.clone())?;
        wlock(&self.contexts, OBJECT)?.insert(name.to_owned(), store.clone());
        self.flush_catalog()?;
        Ok(store)
    }

    /// Drops a context and its files.
    pub fn drop_context(&self, name: &str) -> Result<()> {
        let store = wlock(&self.contexts, OBJECT)?
            .remove(name)
            .ok_or_else(|| Error::new(ErrorKind::NoSuchContext, OBJECT, name))?;
        mlock(&self.storage, OBJECT)?.remove_store(name)?;
        self.flush_catalog()?;
        store.drop_store()
    }

    /// Blocks until background sorting caught up. Test helper.
    pub fn quiesce(&self) -> Result<()> {
        mlock(&self.storage, OBJECT)?.quiesce(30 * SECOND)
    }

    /// Stops workers and flushes all catalogs.
    pub fn close(&self) -> Result<()> {
        mlock(&self.storage, OBJECT)?.stop()?;
        self.text.flush()?;
        self.flush_catalog()
    }

    /// Parses and executes one statement.
    pub fn run(&self, sql: &str) -> Result<StmtResult> {
        let ast = parser::parse_one(sql)?;
        self.execute(ast)
    }

    /// Executes a parsed statement.
    pub fn execute(&self, ast: Ast) -> Result<StmtResult> {
        match ast {
            Ast::Select(sel) => {
                let target = self.resolve_target(&sel.from)?;
                let plan = plan::from_ast(&sel, target, Some(&self.text))?;
                let cursor = Cursor::open(plan, Some(self.text.clone()))?;
                Ok(StmtResult::Rows(cursor))
            }
            Ast::CreateType { name, props } => {
                self.model.add_vertex_type(&name, props)?;
                Ok(StmtResult::Ok)
            }
            Ast::CreateEdge {
                name,
                origin,
                destin,
                wtype,
            } => {
                self.model.add_edge_type(&name, &origin, &destin, wtype)?;
                self.create_context(&name)?;
                Ok(StmtResult::Ok)
            }
            Ast::CreateIndex { name, on, keys } => {
                self.create_index(&name, &on, &keys)?;
                Ok(StmtResult::Ok)
            }
            Ast::DropIndex { name } => {
                let desc = self.indices.drop_index(&name)?;
                if let Ok(store) = self.context(&desc.ctx) {
                    store.unregister_index(&name)?;
                } else if desc.ctx == VERTEX_STORE {
                    self.vertex.unregister_index(&name)?;
                }
                Ok(StmtResult::Ok)
            }
            Ast::Insert {
                target,
                fields,
                rows,
            } => self.insert(&target, &fields, &rows).map(StmtResult::Count),
        }
    }

    fn resolve_target(&self, name: &str) -> Result<PlanTarget> {
        if let Ok(store) = self.context(name) {
            return Ok(PlanTarget::Edge {
                store,
                etype: self.model.edge_type(name).ok(),
            });
        }
        match self.model.vertex_type(name) {
            Ok(vtype) => Ok(PlanTarget::Vertex {
                store: self.vertex.clone(),
                vtype,
            }),
            Err(_) => Err(Error::new(ErrorKind::NoSuchContext, OBJECT, name)),
        }
    }

    /// Creates an index over a context (or the vertex store) and
    /// registers it there.
    pub fn create_index(&self, name: &str, on: &str, keys: &[String]) -> Result<()> {
        let (store, recsize) = if on == VERTEX_STORE {
            (self.vertex.clone(), self.vertex.recsize())
        } else {
            let store = self.context(on)?;
            let rs = store.recsize();
            (store, rs)
        };
        let offs = keys
            .iter()
            .map(|k| {
                if recsize == EDGE_SIZE as u32 {
                    edge_off_by_name(k)
                } else {
                    crate::types::vertex_off_by_name(k)
                }
            })
            .collect::<Result<Vec<_>>>()?;
        let desc = self
            .indices
            .create(name, on, IndexKeys::new(offs), recsize)?;
        store.register_index(desc)?;
        Ok(())
    }

    fn lit_to_value(&self, lit: &Lit, typ: ValueType) -> Result<Value> {
        Ok(match (lit, typ) {
            (Lit::Str(s), ValueType::Text) => Value::TextKey(self.text.get_key(s)?),
            (Lit::Str(s), ValueType::Time) => Value::Time(crate::time::from_string(s)?),
            (Lit::Str(s), ValueType::Date) => Value::Date(crate::time::from_string(s)?),
            (Lit::UInt(u), ValueType::UInt) => Value::UInt(*u),
            (Lit::UInt(u), ValueType::Int) => Value::Int(*u as i64),
            (Lit::UInt(u), ValueType::Float) => Value::Float(*u as f64),
            (Lit::UInt(u), ValueType::Time) => Value::Time(*u as i64),
            (Lit::UInt(u), ValueType::Date) => Value::Date(*u as i64),
            (Lit::Int(i), ValueType::Int) => Value::Int(*i),
            (Lit::Int(i), ValueType::Time) => Value::Time(*i),
            (Lit::Int(i), ValueType::Float) => Value::Float(*i as f64),
            (Lit::Float(f), ValueType::Float) => Value::Float(*f),
            (Lit::Bool(b), ValueType::Bool) => Value::Bool(*b),
            (l, t) => {
                return Err(Error::new(
                    ErrorKind::Invalid,
                    OBJECT,
                    format!("literal {l:?} does not fit {t:?}"),
                ))
            }
        })
    }

    /// Executes an `INSERT`: edge rows into a context, vertex rows
    /// into the vertex store (one record per property).
    fn insert(&self, target: &str, fields: &[String], rows: &[Vec<Lit>]) -> Result<u64> {
        if let Ok(store) = self.context(target) {
            let etype = self.model.edge_type(target).ok();
            let mut n = 0;
            for lits in rows {
                if lits.len() != fields.len() {
                    return Err(Error::new(ErrorKind::Invalid, OBJECT, "field/value mismatch"));
                }
                let mut e = Edge {
                    edge: etype.as_ref().map(|t| t.id).unwrap_or(0),
                    ..Edge::default()
                };
                for (f, lit) in fields.iter().zip(lits) {
                    match f.to_ascii_lowercase().as_str() {
                        "origin" => e.origin = lit_key(lit)?,
                        "destin" | "destination" => e.destin = lit_key(lit)?,
                        "label" => e.label = lit_key(lit)?,
                        "edge" => e.edge = lit_key(lit)?,
                        "timestamp" | "stamp" => {
                            e.timestamp = match self.lit_to_value(lit, ValueType::Time)? {
                                Value::Time(t) => t,
                                _ => 0,
                            }
                        }
                        "weight" => {
                            let t = etype.as_ref().map(|t| t.wtype[0]).unwrap_or(lit_type(lit));
                            e.write_weight(&self.lit_to_value(lit, t)?);
                        }
                        "weight2" => {
                            let t = etype.as_ref().map(|t| t.wtype[1]).unwrap_or(lit_type(lit));
                            e.write_weight2(&self.lit_to_value(lit, t)?);
                        }
                        other => {
                            return Err(Error::new(
                                ErrorKind::Invalid,
                                OBJECT,
                                format!("unknown edge field '{other}'"),
                            ))
                        }
                    }
                }
                store.insert(&e.to_bytes())?;
                n += 1;
            }
            return Ok(n);
        }

        let vtype = self
            .model
            .vertex_type(target)
            .map_err(|_| Error::new(ErrorKind::NoSuchContext, OBJECT, target))?;
        let vid_pos = fields
            .iter()
            .position(|f| matches!(f.to_ascii_lowercase().as_str(), "vid" | "vertex"))
            .ok_or_else(|| Error::new(ErrorKind::Invalid, OBJECT, "insert needs a vid"))?;
        let mut n = 0;
        for lits in rows {
            if lits.len() != fields.len() {
                return Err(Error::new(ErrorKind::Invalid, OBJECT, "field/value mismatch"));
            }
            let vid = lit_key(&lits[vid_pos])?;
            for (i, (f, lit)) in fields.iter().zip(lits).enumerate() {
                if i == vid_pos {
                    continue;
                }
                let prop = vtype
                    .prop(f)
                    .ok_or_else(|| Error::new(ErrorKind::KeyNotFound, OBJECT, f.as_str()))?;
                let value = self.lit_to_value(lit, prop.vtype)?;
                let v = Vertex {
                    vertex: vid,
                    property: prop.id,
                    value: value.to_bits(),
                    vtype: prop.vtype as u32,
                    role: vtype.id,
                };
                self.vertex.insert(&v.to_bytes())?;
                n += 1;
            }
        }
        Ok(n)
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        if let Ok(mut storage) = self.storage.lock() {
            let _ = storage.stop();
        }
    }
}

fn lit_key(lit: &Lit) -> Result<u64> {
    match lit {
        Lit::UInt(u) => Ok(*u),
        _ => Err(Error::new(
            ErrorKind::Invalid,
            OBJECT,
            format!("expected a key, got {lit:?}"),
        )),
    }
}

fn lit_type(lit: &Lit) -> ValueType {
    match lit {
        Lit::UInt(_) => ValueType::UInt,
        Lit::Int(_) => ValueType::Int,
        Lit::Float(_) => ValueType::Float,
        Lit::Str(_) => ValueType::Text,
        Lit::Bool(_) => ValueType::Bool,
    }
}
