//! Fundamental types: records, values and their fixed layouts.

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind, Result};
use crate::time::Time;

/// Logical page size: records followed by a zero-padded remainder.
pub const PAGE_SIZE: usize = 8192;

/// Identifies a vertex, edge, property, label or text.
pub type Key = u64;

/// Identifies a vertex type.
pub type RoleId = u32;

/// A data file id, unique within a store.
pub type FileId = u32;

/// Identifies an index page: `(file_id << 32) | chunk`.
pub type PageId = u64;

/// The raw 8-byte slot of a polymorphic value; its meaning is given
/// by a separate type tag.
pub type ValueBits = u64;

/// What a store holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Content {
    /// Vertex property rows (32 bytes).
    Vertex,
    /// Edges (64 bytes).
    Edge,
}

impl Content {
    /// Record size in bytes.
    pub fn recsize(self) -> u32 {
        match self {
            Content::Vertex => VERTEX_SIZE as u32,
            Content::Edge => EDGE_SIZE as u32,
        }
    }
}

/// Type tags for polymorphic values. The discriminants are the wire
/// tags of the row-buffer format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum ValueType {
    /// No value.
    Nothing = 0,
    /// A text key resolving through the text dictionary.
    Text = 1,
    /// A date, stored in time units.
    Date = 2,
    /// A point in time.
    Time = 3,
    /// IEEE 754 double.
    Float = 4,
    /// Signed 64-bit integer.
    Int = 5,
    /// Unsigned 64-bit integer.
    UInt = 6,
    /// Boolean.
    Bool = 9,
}

impl ValueType {
    /// Decodes a stored tag.
    pub fn from_u32(t: u32) -> Result<ValueType> {
        Ok(match t {
            0 => ValueType::Nothing,
            1 => ValueType::Text,
            2 => ValueType::Date,
            3 => ValueType::Time,
            4 => ValueType::Float,
            5 => ValueType::Int,
            6 => ValueType::UInt,
            9 => ValueType::Bool,
            _ => {
                return Err(Error::new(
                    ErrorKind::Invalid,
                    "types",
                    format!("unknown type tag {t}"),
                ))
            }
        })
    }

    /// Parses a type name as it appears in DDL.
    pub fn from_name(s: &str) -> Result<ValueType> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "text" => ValueType::Text,
            "date" => ValueType::Date,
            "time" => ValueType::Time,
            "float" => ValueType::Float,
            "int" | "integer" => ValueType::Int,
            "uint" | "uinteger" => ValueType::UInt,
            "bool" | "boolean" => ValueType::Bool,
            _ => {
                return Err(Error::new(
                    ErrorKind::Invalid,
                    "types",
                    format!("unknown type name '{s}'"),
                ))
            }
        })
    }
}

/// A typed value at the read boundary. On disk it is always the raw
/// 8-byte slot plus a tag.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// A resolved text string.
    Text(String),
    /// A text key not yet resolved through the dictionary.
    TextKey(Key),
    /// A date in time units.
    Date(Time),
    /// A point in time.
    Time(Time),
    /// IEEE 754 double.
    Float(f64),
    /// Signed integer.
    Int(i64),
    /// Unsigned integer.
    UInt(u64),
    /// Boolean.
    Bool(bool),
}

impl Value {
    /// The tag of this value.
    pub fn vtype(&self) -> ValueType {
        match self {
            Value::Text(_) | Value::TextKey(_) => ValueType::Text,
            Value::Date(_) => ValueType::Date,
            Value::Time(_) => ValueType::Time,
            Value::Float(_) => ValueType::Float,
            Value::Int(_) => ValueType::Int,
            Value::UInt(_) => ValueType::UInt,
            Value::Bool(_) => ValueType::Bool,
        }
    }

    /// The raw 8-byte representation stored in records.
    pub fn to_bits(&self) -> ValueBits {
        match self {
            Value::Text(_) => 0,
            Value::TextKey(k) => *k,
            Value::Date(t) | Value::Time(t) => *t as u64,
            Value::Float(f) => f.to_bits(),
            Value::Int(i) => *i as u64,
            Value::UInt(u) => *u,
            Value::Bool(b) => *b as u64,
        }
    }

    /// Reinterprets a raw slot under a tag.
    pub fn from_bits(t: ValueType, bits: ValueBits) -> Result<Value> {
        Ok(match t {
            ValueType::Text => Value::TextKey(bits),
            ValueType::Date => Value::Date(bits as i64),
            ValueType::Time => Value::Time(bits as i64),
            ValueType::Float => Value::Float(f64::from_bits(bits)),
            ValueType::Int => Value::Int(bits as i64),
            ValueType::UInt => Value::UInt(bits),
            ValueType::Bool => Value::Bool(bits != 0),
            ValueType::Nothing => {
                return Err(Error::new(ErrorKind::Invalid, "types", "value of type nothing"))
            }
        })
    }

    /// Compares two values of the same tag; `None` when incomparable.
    pub fn partial_cmp_same(&self, other: &Value) -> Option<std::cmp::Ordering> {
        use Value::*;
        match (self, other) {
            (Text(a), Text(b)) => a.partial_cmp(b),
            (TextKey(a), TextKey(b)) => a.partial_cmp(b),
            (Date(a), Date(b)) | (Time(a), Time(b)) => a.partial_cmp(b),
            (Float(a), Float(b)) => a.partial_cmp(b),
            (Int(a), Int(b)) => a.partial_cmp(b),
            (UInt(a), UInt(b)) => a.partial_cmp(b),
            (Bool(a), Bool(b)) => a.partial_cmp(b),
            _ => None,
        }
    }
}

/// Edge record size in bytes.
pub const EDGE_SIZE: usize = 64;

/// Edge field offsets.
pub mod edge_off {
    /// Edge id.
    pub const EDGE: u16 = 0;
    /// Origin vertex.
    pub const ORIGIN: u16 = 8;
    /// Destination vertex.
    pub const DESTIN: u16 = 16;
    /// Primary label.
    pub const LABEL: u16 = 24;
    /// Timestamp.
    pub const TIMESTAMP: u16 = 32;
    /// First weight.
    pub const WEIGHT: u16 = 40;
    /// Second weight.
    pub const WEIGHT2: u16 = 48;
    /// Type tag of the first weight.
    pub const WTYPE: u16 = 56;
    /// Type tag of the second weight.
    pub const WTYPE2: u16 = 60;
}

/// Vertex property record size in bytes.
pub const VERTEX_SIZE: usize = 32;

/// Vertex property field offsets.
pub mod vertex_off {
    /// Vertex id.
    pub const VERTEX: u16 = 0;
    /// Property id.
    pub const PROPERTY: u16 = 8;
    /// Property value.
    pub const VALUE: u16 = 16;
    /// Type tag of the value.
    pub const VTYPE: u16 = 24;
    /// Vertex type.
    pub const ROLE: u16 = 28;
}

/// A directed, timestamped fact with two polymorphic weights.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Edge {
    /// Id of the edge.
    pub edge: Key,
    /// Id of the left vertex.
    pub origin: Key,
    /// Id of the right vertex.
    pub destin: Key,
    /// Id of the primary label.
    pub label: Key,
    /// Timestamp.
    pub timestamp: Time,
    /// First weight component.
    pub weight: ValueBits,
    /// Second weight component.
    pub weight2: ValueBits,
    /// Types of the weights.
    pub wtype: [u32; 2],
}

impl Edge {
    /// Serializes into a 64-byte record.
    pub fn write_to(&self, buf: &mut [u8]) {
        LittleEndian::write_u64(&mut buf[0..8], self.edge);
        LittleEndian::write_u64(&mut buf[8..16], self.origin);
        LittleEndian::write_u64(&mut buf[16..24], self.destin);
        LittleEndian::write_u64(&mut buf[24..32], self.label);
        LittleEndian::write_i64(&mut buf[32..40], self.timestamp);
        LittleEndian::write_u64(&mut buf[40..48], self.weight);
        LittleEndian::write_u64(&mut buf[48..56], self.weight2);
        LittleEndian::write_u32(&mut buf[56..60], self.wtype[0]);
        LittleEndian::write_u32(&mut buf[60..64], self.wtype[1]);
    }

    /// The 64-byte record.
    pub fn to_bytes(&self) -> [u8; EDGE_SIZE] {
        let mut buf = [0u8; EDGE_SIZE];
        self.write_to(&mut buf);
        buf
    }

    /// Deserializes from a 64-byte record.
    pub fn from_bytes(buf: &[u8]) -> Edge {
        Edge {
            edge: LittleEndian::read_u64(&buf[0..8]),
            origin: LittleEndian::read_u64(&buf[8..16]),
            destin: LittleEndian::read_u64(&buf[16..24]),
            label: LittleEndian::read_u64(&buf[24..32]),
            timestamp: LittleEndian::read_i64(&buf[32..40]),
            weight: LittleEndian::read_u64(&buf[40..48]),
            weight2: LittleEndian::read_u64(&buf[48..56]),
            wtype: [
                LittleEndian::read_u32(&buf[56..60]),
                LittleEndian::read_u32(&buf[60..64]),
            ],
        }
    }

    /// Stores a typed value into the first weight slot.
    pub fn write_weight(&mut self, v: &Value) {
        self.weight = v.to_bits();
        self.wtype[0] = v.vtype() as u32;
    }

    /// Stores a typed value into the second weight slot.
    pub fn write_weight2(&mut self, v: &Value) {
        self.weight2 = v.to_bits();
        self.wtype[1] = v.vtype() as u32;
    }

    /// Reads the first weight under its tag.
    pub fn read_weight(&self) -> Result<Value> {
        Value::from_bits(ValueType::from_u32(self.wtype[0])?, self.weight)
    }

    /// Reads the second weight under its tag.
    pub fn read_weight2(&self) -> Result<Value> {
        Value::from_bits(ValueType::from_u32(self.wtype[1])?, self.weight2)
    }
}

/// One property of one vertex; vertex rows are assembled from these
/// at read time.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vertex {
    /// Id of the vertex.
    pub vertex: Key,
    /// Id of the property.
    pub property: Key,
    /// Property value.
    pub value: ValueBits,
    /// Type of the value.
    pub vtype: u32,
    /// Vertex type identifier.
    pub role: RoleId,
}

impl Vertex {
    /// Serializes into a 32-byte record.
    pub fn write_to(&self, buf: &mut [u8]) {
        LittleEndian::write_u64(&mut buf[0..8], self.vertex);
        LittleEndian::write_u64(&mut buf[8..16], self.property);
        LittleEndian::write_u64(&mut buf[16..24], self.value);
        LittleEndian::write_u32(&mut buf[24..28], self.vtype);
        LittleEndian::write_u32(&mut buf[28..32], self.role);
    }

    /// The 32-byte record.
    pub fn to_bytes(&self) -> [u8; VERTEX_SIZE] {
        let mut buf = [0u8; VERTEX_SIZE];
        self.write_to(&mut buf);
        buf
    }

    /// Deserializes from a 32-byte record.
    pub fn from_bytes(buf: &[u8]) -> Vertex {
        Vertex {
            vertex: LittleEndian::read_u64(&buf[0..8]),
            property: LittleEndian::read_u64(&buf[8..16]),
            value: LittleEndian::read_u64(&buf[16..24]),
            vtype: LittleEndian::read_u32(&buf[24..28]),
            role: LittleEndian::read_u32(&buf[28..32]),
        }
    }
}

/// True if the record is the all-zero null record marking an unused
/// slot. Null records compare greater than all real records.
pub fn is_null_rec(rec: &[u8]) -> bool {
    rec.iter().all(|&b| b == 0)
}

/// Size in bytes of the field at `off` within a record of `recsize`
/// bytes. Type-tag fields are 4 bytes, all others 8.
pub fn size_by_off(recsize: u32, off: u16) -> u16 {
    if recsize == EDGE_SIZE as u32 {
        match off {
            edge_off::WTYPE | edge_off::WTYPE2 => 4,
            _ => 8,
        }
    } else {
        match off {
            vertex_off::VTYPE | vertex_off::ROLE => 4,
            _ => 8,
        }
    }
}

/// Resolves an edge field name to its offset.
pub fn edge_off_by_name(field: &str) -> Result<u16> {
    Ok(match field.to_ascii_lowercase().as_str() {
        "edge" => edge_off::EDGE,
        "origin" => edge_off::ORIGIN,
        "destin" | "destination" => edge_off::DESTIN,
        "label" => edge_off::LABEL,
        "timestamp" | "stamp" => edge_off::TIMESTAMP,
        "weight" => edge_off::WEIGHT,
        "weight2" => edge_off::WEIGHT2,
        _ => {
            return Err(Error::new(
                ErrorKind::Invalid,
                "types",
                format!("unknown edge field '{field}'"),
            ))
        }
    })
}

/// Resolves a vertex field name to its offset.
pub fn vertex_off_by_name(field: &str) -> Result<u16> {
    Ok(match field.to_ascii_lowercase().as_str() {
        "vertex" | "vid" => vertex_off::VERTEX,
        "property" => vertex_off::PROPERTY,
        "value" => vertex_off::VALUE,
        "role" => vertex_off::ROLE,
        _ => {
            return Err(Error::new(
                ErrorKind::Invalid,
                "types",
                format!("unknown vertex field '{field}'"),
            ))
        }
    })
}

/// Reads the raw bits of the field at `(off, size)` of a record.
pub fn field_bits(rec: &[u8], off: u16, size: u16) -> ValueBits {
    let off = off as usize;
    match size {
        4 => LittleEndian::read_u32(&rec[off..off + 4]) as u64,
        _ => LittleEndian::read_u64(&rec[off..off + 8]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edge_round_trip() {
        let mut e = Edge {
            edge: 1,
            origin: 7,
            destin: 9,
            label: 4,
            timestamp: -12345,
            ..Edge::default()
        };
        e.write_weight(&Value::Float(2.5));
        e.write_weight2(&Value::UInt(42));
        let bytes = e.to_bytes();
        let back = Edge::from_bytes(&bytes);
        assert_eq!(e, back);
        assert_eq!(back.read_weight().unwrap(), Value::Float(2.5));
        assert_eq!(back.read_weight2().unwrap(), Value::UInt(42));
    }

    #[test]
    fn vertex_round_trip() {
        let v = Vertex {
            vertex: 11,
            property: 22,
            value: 33,
            vtype: ValueType::UInt as u32,
            role: 5,
        };
        assert_eq!(Vertex::from_bytes(&v.to_bytes()), v);
    }

    #[test]
    fn null_rec() {
        assert!(is_null_rec(&[0u8; EDGE_SIZE]));
        let e = Edge { edge: 1, ..Edge::default() };
        assert!(!is_null_rec(&e.to_bytes()));
    }

    #[test]
    fn offsets_by_name() {
        assert_eq!(edge_off_by_name("origin").unwrap(), 8);
        assert_eq!(edge_off_by_name("destin").unwrap(), 16);
        assert_eq!(vertex_off_by_name("property").unwrap(), 8);
        assert!(edge_off_by_name("nope").is_err());
    }

    #[test]
    fn field_sizes() {
        assert_eq!(size_by_off(64, edge_off::WTYPE), 4);
        assert_eq!(size_by_off(64, edge_off::WEIGHT), 8);
        assert_eq!(size_by_off(32, vertex_off::ROLE), 4);
    }
}
