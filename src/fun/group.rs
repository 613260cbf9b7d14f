//! Groups: ordered aggregate vectors with one shared lifecycle.

use crate::error::{Error, ErrorKind, Result};
use crate::fun::Fun;
use crate::types::{Content, Value};

const OBJECT: &str = "group";

/// An ordered list of aggregate functions sharing one
/// reset/map/reduce lifecycle.
pub struct Group {
    funs: Vec<Fun>,
    results: Vec<Option<Value>>,
}

impl Group {
    /// A group over the given functions; slot order is function
    /// order.
    pub fn new(funs: Vec<Fun>) -> Group {
        let n = funs.len();
        Group {
            funs,
            results: vec![None; n],
        }
    }

    /// Number of aggregate slots.
    pub fn len(&self) -> usize {
        self.funs.len()
    }

    /// True when the group carries no functions.
    pub fn is_empty(&self) -> bool {
        self.funs.is_empty()
    }

    /// Clears all functions for the next group of records.
    pub fn reset(&mut self) -> Result<()> {
        for f in &mut self.funs {
            f.reset()?;
        }
        self.results.iter_mut().for_each(|r| *r = None);
        Ok(())
    }

    /// Folds one record into every function matching its content
    /// type.
    pub fn map(&mut self, ctype: Content, rec: &[u8]) -> Result<()> {
        for f in &mut self.funs {
            if f.ctype() == ctype {
                f.map(rec)?;
            }
        }
        Ok(())
    }

    /// Finalizes all functions into the result slots.
    pub fn reduce(&mut self) -> Result<()> {
        for (i, f) in self.funs.iter_mut().enumerate() {
            self.results[i] = Some(f.reduce()?);
        }
        Ok(())
    }

    /// The n-th result slot; `reduce` must have run.
    pub fn result(&self, n: usize) -> Result<Value> {
        self.results
            .get(n)
            .and_then(|r| r.clone())
            .ok_or_else(|| Error::new(ErrorKind::Fun, OBJECT, format!("no result in slot {n}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::BlockList;
    use crate::sql::ast::AggFun;
    use crate::types::{edge_off, Edge, ValueType};
    use std::sync::Arc;

    #[test]
    fn map_reduce_result_lifecycle() {
        let flist = Arc::new(BlockList::new(4096));
        let mut group = Group::new(vec![
            Fun::new(
                AggFun::Count,
                Content::Edge,
                0,
                8,
                ValueType::UInt,
                flist.clone(),
            ),
            Fun::new(
                AggFun::Sum,
                Content::Edge,
                edge_off::ORIGIN,
                8,
                ValueType::UInt,
                flist.clone(),
            ),
        ]);
        for origin in [1u64, 2, 3] {
            let e = Edge {
                origin,
                ..Edge::default()
            };
            group.map(Content::Edge, &e.to_bytes()).unwrap();
        }
        group.reduce().unwrap();
        assert_eq!(group.result(0).unwrap(), Value::UInt(3));
        assert_eq!(group.result(1).unwrap(), Value::UInt(6));

        group.reset().unwrap();
        let e = Edge {
            origin: 9,
            ..Edge::default()
        };
        group.map(Content::Edge, &e.to_bytes()).unwrap();
        group.reduce().unwrap();
        assert_eq!(group.result(0).unwrap(), Value::UInt(1));
        assert_eq!(group.result(1).unwrap(), Value::UInt(9));
    }
}
