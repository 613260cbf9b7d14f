//! The model: vertex types, their properties and edge types,
//! persisted as the schema of a scope.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind, Result};
use crate::task::{rlock, wlock};
use crate::types::{Key, RoleId, ValueType};

const OBJECT: &str = "model";

/// One property of a vertex type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Prop {
    /// Property id, unique per model.
    pub id: Key,
    /// Property name, unique per vertex type.
    pub name: String,
    /// Value type of the property.
    pub vtype: ValueType,
    /// Whether this property is the primary key.
    pub pk: bool,
}

/// A vertex type (role) with its properties.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VertexType {
    /// Role id.
    pub id: RoleId,
    /// Type name.
    pub name: String,
    /// Declared properties.
    pub props: Vec<Prop>,
}

impl VertexType {
    /// Looks a property up by name.
    pub fn prop(&self, name: &str) -> Option<&Prop> {
        self.props.iter().find(|p| p.name == name)
    }

    /// Looks a property up by id.
    pub fn prop_by_id(&self, id: Key) -> Option<&Prop> {
        self.props.iter().find(|p| p.id == id)
    }
}

/// An edge type between two vertex types.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EdgeType {
    /// Edge id, stored in the `edge` field of its records.
    pub id: Key,
    /// Type name.
    pub name: String,
    /// Role of the origin vertex.
    pub origin: RoleId,
    /// Role of the destination vertex.
    pub destin: RoleId,
    /// Declared types of the two weights.
    pub wtype: [ValueType; 2],
}

#[derive(Default, Serialize, Deserialize)]
struct ModelFile {
    verts: Vec<VertexType>,
    edges: Vec<EdgeType>,
    next_role: RoleId,
    next_id: Key,
}

#[derive(Default)]
struct ModelState {
    verts_by_name: HashMap<String, Arc<VertexType>>,
    verts_by_id: HashMap<RoleId, Arc<VertexType>>,
    edges_by_name: HashMap<String, Arc<EdgeType>>,
    edges_by_id: HashMap<Key, Arc<EdgeType>>,
    next_role: RoleId,
    next_id: Key,
}

/// The persisted schema catalog of a scope.
pub struct Model {
    path: PathBuf,
    state: RwLock<ModelState>,
}

impl Model {
    /// Opens (or initializes) the model under `dir`.
    pub fn open(dir: &Path) -> Result<Model> {
        fs::create_dir_all(dir)
            .map_err(|e| Error::with_io(ErrorKind::Create, OBJECT, "model dir", e))?;
        let path = dir.join("model.json");
        let mut state = ModelState {
            next_role: 1,
            next_id: 1,
            ..ModelState::default()
        };
        if path.exists() {
            let raw = fs::read_to_string(&path)
                .map_err(|e| Error::with_io(ErrorKind::Read, OBJECT, "model.json", e))?;
            let file: ModelFile = serde_json::from_str(&raw)
                .map_err(|e| Error::new(ErrorKind::Catalog, OBJECT, format!("model.json: {e}")))?;
            for v in file.verts {
                let v = Arc::new(v);
                state.verts_by_name.insert(v.name.clone(), v.clone());
                state.verts_by_id.insert(v.id, v);
            }
            for e in file.edges {
                let e = Arc::new(e);
                state.edges_by_name.insert(e.name.clone(), e.clone());
                state.edges_by_id.insert(e.id, e);
            }
            state.next_role = file.next_role.max(1);
            state.next_id = file.next_id.max(1);
        }
        Ok(Model {
            path,
            state: RwLock::new(state),
        })
    }

    fn persist(&self, st: &ModelState) -> Result<()> {
        let file = ModelFile {
            verts: st.verts_by_id.values().map(|v| (**v).clone()).collect(),
            edges: st.edges_by_id.values().map(|e| (**e).clone()).collect(),
            next_role: st.next_role,
            next_id: st.next_id,
        };
        let raw = serde_json::to_string_pretty(&file)
            .map_err(|e| Error::new(ErrorKind::Catalog, OBJECT, format!("{e}")))?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, raw)
            .map_err(|e| Error::with_io(ErrorKind::Write, OBJECT, "model.json", e))?;
        fs::rename(&tmp, &self.path)
            .map_err(|e| Error::with_io(ErrorKind::Move, OBJECT, "model.json", e))?;
        Ok(())
    }

    /// Declares a vertex type; property order fixes property ids.
    pub fn add_vertex_type(
        &self,
        name: &str,
        props: Vec<(String, ValueType, bool)>,
    ) -> Result<Arc<VertexType>> {
        let mut st = wlock(&self.state, OBJECT)?;
        if st.verts_by_name.contains_key(name) {
            return Err(Error::new(ErrorKind::DupName, OBJECT, name));
        }
        let id = st.next_role;
        st.next_role += 1;
        let props = props
            .into_iter()
            .map(|(name, vtype, pk)| {
                let id = st.next_id;
                st.next_id += 1;
                Prop {
                    id,
                    name,
                    vtype,
                    pk,
                }
            })
            .collect();
        let v = Arc::new(VertexType {
            id,
            name: name.to_owned(),
            props,
        });
        st.verts_by_name.insert(v.name.clone(), v.clone());
        st.verts_by_id.insert(v.id, v.clone());
        self.persist(&st)?;
        Ok(v)
    }

    /// Declares an edge type between two known vertex types.
    pub fn add_edge_type(
        &self,
        name: &str,
        origin: &str,
        destin: &str,
        wtype: [ValueType; 2],
    ) -> Result<Arc<EdgeType>> {
        let mut st = wlock(&self.state, OBJECT)?;
        if st.edges_by_name.contains_key(name) {
            return Err(Error::new(ErrorKind::DupName, OBJECT, name));
        }
        let origin = st
            .verts_by_name
            .get(origin)
            .ok_or_else(|| Error::new(ErrorKind::KeyNotFound, OBJECT, origin))?
            .id;
        let destin = st
            .verts_by_name
            .get(destin)
            .ok_or_else(|| Error::new(ErrorKind::KeyNotFound, OBJECT, destin))?
            .id;
        let id = st.next_id;
        st.next_id += 1;
        let e = Arc::new(EdgeType {
            id,
            name: name.to_owned(),
            origin,
            destin,
            wtype,
        });
        st.edges_by_name.insert(e.name.clone(), e.clone());
        st.edges_by_id.insert(e.id, e.clone());
        self.persist(&st)?;
        Ok(e)
    }

    /// Looks a vertex type up by name.
    pub fn vertex_type(&self, name: &str) -> Result<Arc<VertexType>> {
        rlock(&self.state, OBJECT)?
            .verts_by_name
            .get(name)
            .cloned()
            .ok_or_else(|| Error::new(ErrorKind::KeyNotFound, OBJECT, name))
    }

    /// Looks a vertex type up by role id.
    pub fn vertex_type_by_id(&self, id: RoleId) -> Result<Arc<VertexType>> {
        rlock(&self.state, OBJECT)?
            .verts_by_id
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::new(ErrorKind::KeyNotFound, OBJECT, format!("role {id}")))
    }

    /// Looks an edge type up by name.
    pub fn edge_type(&self, name: &str) -> Result<Arc<EdgeType>> {
        rlock(&self.state, OBJECT)?
            .edges_by_name
            .get(name)
            .cloned()
            .ok_or_else(|| Error::new(ErrorKind::KeyNotFound, OBJECT, name))
    }

    /// Looks an edge type up by id.
    pub fn edge_type_by_id(&self, id: Key) -> Result<Arc<EdgeType>> {
        rlock(&self.state, OBJECT)?
            .edges_by_id
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::new(ErrorKind::KeyNotFound, OBJECT, format!("edge {id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declare_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let model = Model::open(dir.path()).unwrap();
            model
                .add_vertex_type(
                    "client",
                    vec![
                        ("id".to_owned(), ValueType::UInt, true),
                        ("name".to_owned(), ValueType::Text, false),
                    ],
                )
                .unwrap();
            model
                .add_vertex_type("product", vec![("id".to_owned(), ValueType::UInt, true)])
                .unwrap();
            model
                .add_edge_type(
                    "buys",
                    "client",
                    "product",
                    [ValueType::UInt, ValueType::Float],
                )
                .unwrap();
        }
        let model = Model::open(dir.path()).unwrap();
        let client = model.vertex_type("client").unwrap();
        assert_eq!(client.props.len(), 2);
        assert!(client.prop("name").is_some());
        let buys = model.edge_type("buys").unwrap();
        assert_eq!(buys.origin, client.id);
        assert_eq!(buys.wtype[1], ValueType::Float);
        assert_eq!(
            model.edge_type_by_id(buys.id).unwrap().name,
            "buys"
        );
    }

    #[test]
    fn duplicate_names_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let model = Model::open(dir.path()).unwrap();
        model.add_vertex_type("v", vec![]).unwrap();
        assert_eq!(
            model.add_vertex_type("v", vec![]).unwrap_err().kind(),
            ErrorKind::DupName
        );
    }
}
