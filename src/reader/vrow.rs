//! Vertex rows: assembling logical rows from property streams.

use std::collections::{HashMap, VecDeque};

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, ErrorKind, Result};
use crate::reader::filter::Filter;
use crate::types::{Key, RoleId, Value, ValueType, Vertex};

const OBJECT: &str = "vrow";

/// A vertex row under assembly: one 8-byte slot per declared
/// property.
struct Partial {
    bits: Vec<u64>,
    set: Vec<bool>,
    nset: usize,
}

/// Assembles logical vertex rows from a stream of vertex-property
/// records.
///
/// The vrow declares the properties it needs (those referenced by the
/// filter and the projection). Incoming properties are buffered per
/// vertex id; once a vertex holds every declared property its row
/// moves to the ready list. The synthetic row layout is one 8-byte
/// slot per declared property, in declaration order, so a filter
/// compiled against slot offsets evaluates directly on it.
pub struct VRow {
    role: RoleId,
    props: Vec<Key>,
    slots: HashMap<Key, usize>,
    types: Vec<ValueType>,
    filter: Option<Filter>,
    vrtx: HashMap<Key, Partial>,
    arrival: VecDeque<Key>,
    ready: VecDeque<(Key, Vec<u8>)>,
}

impl VRow {
    /// A vrow for `role` over the declared properties (id and type,
    /// in slot order) with an optional filter over slot offsets.
    pub fn new(role: RoleId, props: Vec<(Key, ValueType)>, filter: Option<Filter>) -> VRow {
        let slots = props
            .iter()
            .enumerate()
            .map(|(i, (id, _))| (*id, i))
            .collect();
        VRow {
            role,
            types: props.iter().map(|(_, t)| *t).collect(),
            props: props.into_iter().map(|(id, _)| id).collect(),
            slots,
            filter,
            vrtx: HashMap::new(),
            arrival: VecDeque::new(),
            ready: VecDeque::new(),
        }
    }

    /// The slot offset of a property in the synthetic row.
    pub fn slot_off(&self, prop: Key) -> Option<u16> {
        self.slots.get(&prop).map(|s| (*s * 8) as u16)
    }

    /// Number of declared properties.
    pub fn width(&self) -> usize {
        self.props.len()
    }

    /// Declared type of the property in slot `i`.
    pub fn slot_type(&self, i: usize) -> ValueType {
        self.types[i]
    }

    /// Offers one vertex-property record; returns whether it was
    /// relevant (right role, declared property).
    pub fn add(&mut self, v: &Vertex) -> Result<bool> {
        if v.role != self.role {
            return Ok(false);
        }
        let Some(&slot) = self.slots.get(&v.property) else {
            return Ok(false);
        };
        let np = self.props.len();
        let partial = self.vrtx.entry(v.vertex).or_insert_with(|| {
            Partial {
                bits: vec![0u64; np],
                set: vec![false; np],
                nset: 0,
            }
        });
        if !partial.set[slot] {
            partial.set[slot] = true;
            partial.nset += 1;
            if partial.nset == 1 {
                self.arrival.push_back(v.vertex);
            }
        }
        partial.bits[slot] = v.value;
        if partial.nset == self.props.len() {
            let partial = self
                .vrtx
                .remove(&v.vertex)
                .ok_or_else(|| Error::new(ErrorKind::Panic, OBJECT, "complete row vanished"))?;
            self.arrival.retain(|&k| k != v.vertex);
            self.ready.push_back((v.vertex, row_bytes(&partial.bits)));
        }
        Ok(true)
    }

    /// Flushes all partial rows to the ready list at stream end.
    /// Vertices that collected no properties at all are a no-op by
    /// construction (they are never buffered).
    pub fn force(&mut self) {
        while let Some(vid) = self.arrival.pop_front() {
            if let Some(partial) = self.vrtx.remove(&vid) {
                self.ready.push_back((vid, row_bytes(&partial.bits)));
            }
        }
    }

    /// Pops the next completed row that passes the filter; rows
    /// failing the filter are dropped.
    pub fn eval(&mut self) -> Option<(Key, Vec<u8>)> {
        while let Some((vid, row)) = self.ready.pop_front() {
            match &self.filter {
                Some(f) if !f.eval(&row) => continue,
                _ => return Some((vid, row)),
            }
        }
        None
    }

    /// Pops the next completed row without evaluating the filter.
    pub fn complete(&mut self) -> Option<(Key, Vec<u8>)> {
        self.ready.pop_front()
    }

    /// Reads the typed value of slot `i` from a synthetic row.
    pub fn slot_value(&self, row: &[u8], i: usize) -> Result<Value> {
        let bits = LittleEndian::read_u64(&row[i * 8..(i + 1) * 8]);
        Value::from_bits(self.types[i], bits)
    }
}

fn row_bytes(bits: &[u64]) -> Vec<u8> {
    let mut row = vec![0u8; bits.len() * 8];
    for (i, b) in bits.iter().enumerate() {
        LittleEndian::write_u64(&mut row[i * 8..(i + 1) * 8], *b);
    }
    row
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::ast::CmpOp;

    fn vx(vertex: Key, property: Key, value: u64, role: RoleId) -> Vertex {
        Vertex {
            vertex,
            property,
            value,
            vtype: ValueType::UInt as u32,
            role,
        }
    }

    #[test]
    fn completes_when_all_props_present() {
        let mut vrow = VRow::new(
            1,
            vec![(10, ValueType::UInt), (11, ValueType::UInt)],
            None,
        );
        assert!(vrow.add(&vx(100, 10, 7, 1)).unwrap());
        assert!(vrow.eval().is_none());
        assert!(!vrow.add(&vx(100, 99, 0, 1)).unwrap()); // undeclared
        assert!(!vrow.add(&vx(100, 10, 7, 2)).unwrap()); // wrong role
        assert!(vrow.add(&vx(100, 11, 8, 1)).unwrap());
        let (vid, row) = vrow.eval().unwrap();
        assert_eq!(vid, 100);
        assert_eq!(vrow.slot_value(&row, 0).unwrap(), Value::UInt(7));
        assert_eq!(vrow.slot_value(&row, 1).unwrap(), Value::UInt(8));
    }

    #[test]
    fn filter_drops_failing_rows() {
        let filter = Filter::Cmp {
            op: CmpOp::Gt,
            off: 0,
            size: 8,
            typ: ValueType::UInt,
            val: Value::UInt(5),
        };
        let mut vrow = VRow::new(1, vec![(10, ValueType::UInt)], Some(filter));
        vrow.add(&vx(1, 10, 3, 1)).unwrap();
        vrow.add(&vx(2, 10, 9, 1)).unwrap();
        let (vid, _) = vrow.eval().unwrap();
        assert_eq!(vid, 2);
        assert!(vrow.eval().is_none());
    }

    #[test]
    fn force_flushes_partials_in_arrival_order() {
        let mut vrow = VRow::new(
            1,
            vec![(10, ValueType::UInt), (11, ValueType::UInt)],
            None,
        );
        vrow.add(&vx(5, 10, 1, 1)).unwrap();
        vrow.add(&vx(6, 11, 2, 1)).unwrap();
        assert!(vrow.complete().is_none());
        vrow.force();
        assert_eq!(vrow.complete().unwrap().0, 5);
        assert_eq!(vrow.complete().unwrap().0, 6);
        // forcing again is a no-op
        vrow.force();
        assert!(vrow.complete().is_none());
    }
}
