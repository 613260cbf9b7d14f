#![deny(missing_docs)]

//! An analytical graph/time-series store.
//!
//! Immutable fact records (edges with timestamped weights and vertex
//! property rows) are appended at high throughput, sorted in the
//! background into read-optimized, compressed files, and scanned
//! through indexed or full-scan readers driven by a SQL planner.

pub mod error;
pub mod fun;
pub mod index;
pub mod io;
pub mod mem;
pub mod model;
pub mod query;
pub mod reader;
pub mod scope;
pub mod sort;
pub mod sql;
pub mod store;
pub mod task;
pub mod text;
pub mod time;
pub mod types;

pub use error::{Error, ErrorKind, Result};
pub use query::Cursor;
pub use scope::{Scope, ScopeConfig, StmtResult};
pub use store::storage::{Storage, StorageConfig};
pub use store::{Store, StoreConfig};
pub use types::{Content, Edge, Value, ValueType, Vertex};
