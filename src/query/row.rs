//! The client row-buffer format.
//!
//! ```text
//! record := field* EOR          EOR = 0x0a
//! field  := type_tag payload
//! ```
//!
//! TEXT payloads are NUL-terminated UTF-8; DATE/TIME/INT/UINT are
//! 8-byte little-endian; FLOAT is an IEEE 754 double; BOOL is one
//! byte.

use std::io::Write;

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, ErrorKind, Result};
use crate::time;
use crate::types::{Value, ValueType};

const OBJECT: &str = "row";

/// End-of-row marker.
pub const EOR: u8 = 0x0a;

/// Longest admissible text payload.
const MAX_TEXT: usize = 4096;

/// Appends one typed value to a row under construction. The row is
/// kept EOR-terminated after every append.
pub fn add_value(row: &mut Vec<u8>, v: &Value) -> Result<()> {
    if row.last() == Some(&EOR) {
        row.pop();
    }
    match v {
        Value::Text(s) => {
            if s.len() > MAX_TEXT {
                return Err(Error::new(ErrorKind::TooBig, OBJECT, "text value"));
            }
            row.push(ValueType::Text as u8);
            row.extend_from_slice(s.as_bytes());
            row.push(0);
        }
        Value::TextKey(k) => {
            // unresolved text keys surface as unsigned numbers
            row.push(ValueType::UInt as u8);
            row.extend_from_slice(&k.to_le_bytes());
        }
        Value::Date(t) => {
            row.push(ValueType::Date as u8);
            row.extend_from_slice(&t.to_le_bytes());
        }
        Value::Time(t) => {
            row.push(ValueType::Time as u8);
            row.extend_from_slice(&t.to_le_bytes());
        }
        Value::Float(f) => {
            row.push(ValueType::Float as u8);
            row.extend_from_slice(&f.to_bits().to_le_bytes());
        }
        Value::Int(i) => {
            row.push(ValueType::Int as u8);
            row.extend_from_slice(&i.to_le_bytes());
        }
        Value::UInt(u) => {
            row.push(ValueType::UInt as u8);
            row.extend_from_slice(&u.to_le_bytes());
        }
        Value::Bool(b) => {
            row.push(ValueType::Bool as u8);
            row.push(*b as u8);
        }
    }
    row.push(EOR);
    Ok(())
}

/// Length of one row in bytes, excluding the EOR marker.
pub fn row_len(row: &[u8]) -> Result<usize> {
    let mut i = 0;
    while i < row.len() {
        if row[i] == EOR {
            return Ok(i);
        }
        i = skip_field(row, i)?;
    }
    Err(Error::new(ErrorKind::NotFound, OBJECT, "row has no EOR"))
}

fn skip_field(buf: &[u8], i: usize) -> Result<usize> {
    let tag = buf[i];
    let typ = ValueType::from_u32(tag as u32)
        .map_err(|_| Error::new(ErrorKind::Invalid, OBJECT, format!("unknown tag {tag}")))?;
    let next = match typ {
        ValueType::Text => match find_end_of_str(buf, i + 1) {
            Some(n) => n,
            None => {
                return Err(Error::new(ErrorKind::Invalid, OBJECT, "unterminated text"))
            }
        },
        ValueType::Bool => i + 2,
        _ => i + 9,
    };
    if next > buf.len() {
        return Err(Error::new(ErrorKind::Invalid, OBJECT, "truncated field"));
    }
    Ok(next)
}

/// Index just past the NUL of the string starting at `idx`, or
/// `None` if unterminated (or longer than the maximum).
pub fn find_end_of_str(buf: &[u8], idx: usize) -> Option<usize> {
    let max = (idx + MAX_TEXT + 1).min(buf.len());
    buf[idx..max].iter().position(|&b| b == 0).map(|p| idx + p + 1)
}

/// Index just past the EOR of the row starting at `idx`, or `None`
/// when the row is incomplete.
pub fn find_eor(buf: &[u8], idx: usize) -> Option<usize> {
    let mut i = idx;
    while i < buf.len() {
        if buf[i] == EOR {
            return Some(i + 1);
        }
        i = skip_field(buf, i).ok()?;
    }
    None
}

/// Index just past the last complete row of the buffer; 0 when no
/// row is complete.
pub fn find_last_row(buf: &[u8]) -> usize {
    let mut last = 0;
    let mut i = 0;
    while i < buf.len() {
        match find_eor(buf, i) {
            Some(n) => {
                last = n;
                i = n;
            }
            None => break,
        }
    }
    last
}

/// Byte index where row number `row` starts.
pub fn extract_row(buf: &[u8], row: usize) -> Result<usize> {
    let mut i = 0;
    for _ in 0..row {
        i = find_eor(buf, i)
            .ok_or_else(|| Error::new(ErrorKind::NotFound, OBJECT, "not enough rows"))?;
    }
    if i >= buf.len() {
        return Err(Error::new(ErrorKind::NotFound, OBJECT, "not enough rows"));
    }
    Ok(i)
}

/// Extracts field number `field` of the row starting at the head of
/// `buf`.
pub fn extract_field(buf: &[u8], field: usize) -> Result<Value> {
    let mut i = 0;
    for _ in 0..field {
        if i >= buf.len() || buf[i] == EOR {
            return Err(Error::new(ErrorKind::NotFound, OBJECT, "not enough fields"));
        }
        i = skip_field(buf, i)?;
    }
    if i >= buf.len() || buf[i] == EOR {
        return Err(Error::new(ErrorKind::NotFound, OBJECT, "not enough fields"));
    }
    read_field(buf, i)
}

fn read_field(buf: &[u8], i: usize) -> Result<Value> {
    let typ = ValueType::from_u32(buf[i] as u32)?;
    let p = i + 1;
    Ok(match typ {
        ValueType::Text => {
            let end = find_end_of_str(buf, p)
                .ok_or_else(|| Error::new(ErrorKind::Invalid, OBJECT, "unterminated text"))?;
            let s = std::str::from_utf8(&buf[p..end - 1])
                .map_err(|_| Error::new(ErrorKind::Invalid, OBJECT, "non-utf8 text"))?;
            Value::Text(s.to_owned())
        }
        ValueType::Date => Value::Date(LittleEndian::read_i64(&buf[p..p + 8])),
        ValueType::Time => Value::Time(LittleEndian::read_i64(&buf[p..p + 8])),
        ValueType::Float => Value::Float(f64::from_bits(LittleEndian::read_u64(&buf[p..p + 8]))),
        ValueType::Int => Value::Int(LittleEndian::read_i64(&buf[p..p + 8])),
        ValueType::UInt => Value::UInt(LittleEndian::read_u64(&buf[p..p + 8])),
        ValueType::Bool => Value::Bool(buf[p] != 0),
        ValueType::Nothing => {
            return Err(Error::new(ErrorKind::Invalid, OBJECT, "field of type nothing"))
        }
    })
}

/// Renders a buffer of rows human-readably: fields separated by
/// `;`, one line per row.
pub fn print(buf: &[u8], out: &mut impl Write) -> Result<()> {
    let mut i = 0;
    let mut first = true;
    while i < buf.len() {
        if buf[i] == EOR {
            writeln!(out).map_err(|e| Error::with_io(ErrorKind::Write, OBJECT, "print", e))?;
            first = true;
            i += 1;
            continue;
        }
        if !first {
            write!(out, ";").map_err(|e| Error::with_io(ErrorKind::Write, OBJECT, "print", e))?;
        }
        let v = read_field(buf, i)?;
        let s = match &v {
            Value::Text(s) => s.clone(),
            Value::TextKey(k) => k.to_string(),
            Value::Date(t) | Value::Time(t) => time::to_string(*t)?,
            Value::Float(f) => format!("{f:.4}"),
            Value::Int(n) => n.to_string(),
            Value::UInt(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
        };
        write!(out, "{s}").map_err(|e| Error::with_io(ErrorKind::Write, OBJECT, "print", e))?;
        i = skip_field(buf, i)?;
        first = false;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_row() -> Vec<u8> {
        let mut row = Vec::new();
        add_value(&mut row, &Value::UInt(42)).unwrap();
        add_value(&mut row, &Value::Text("hello".to_owned())).unwrap();
        add_value(&mut row, &Value::Float(2.5)).unwrap();
        add_value(&mut row, &Value::Bool(true)).unwrap();
        add_value(&mut row, &Value::Int(-7)).unwrap();
        row
    }

    #[test]
    fn add_and_extract_round_trip() {
        let row = sample_row();
        assert_eq!(extract_field(&row, 0).unwrap(), Value::UInt(42));
        assert_eq!(
            extract_field(&row, 1).unwrap(),
            Value::Text("hello".to_owned())
        );
        assert_eq!(extract_field(&row, 2).unwrap(), Value::Float(2.5));
        assert_eq!(extract_field(&row, 3).unwrap(), Value::Bool(true));
        assert_eq!(extract_field(&row, 4).unwrap(), Value::Int(-7));
        assert!(extract_field(&row, 5).is_err());

        // accumulated size: 9 + 7 + 9 + 2 + 9 fields plus the EOR
        assert_eq!(row_len(&row).unwrap(), 36);
        assert_eq!(row.len(), 37);
    }

    #[test]
    fn wire_layout_is_exact() {
        let mut row = Vec::new();
        add_value(&mut row, &Value::UInt(1)).unwrap();
        assert_eq!(row[0], 0x06);
        assert_eq!(&row[1..9], &1u64.to_le_bytes());
        assert_eq!(row[9], 0x0a);

        let mut row = Vec::new();
        add_value(&mut row, &Value::Bool(false)).unwrap();
        assert_eq!(row, vec![0x09, 0x00, 0x0a]);

        let mut row = Vec::new();
        add_value(&mut row, &Value::Text("ab".to_owned())).unwrap();
        assert_eq!(row, vec![0x01, b'a', b'b', 0x00, 0x0a]);
    }

    #[test]
    fn boundary_searches() {
        let mut buf = sample_row();
        let one = buf.len();
        buf.extend_from_slice(&sample_row());
        // a truncated third row
        buf.push(ValueType::UInt as u8);
        buf.extend_from_slice(&[1, 2, 3]);

        assert_eq!(find_eor(&buf, 0), Some(one));
        assert_eq!(find_last_row(&buf), 2 * one);
        assert_eq!(extract_row(&buf, 1).unwrap(), one);
        assert!(extract_row(&buf, 2).is_ok());
        assert!(extract_row(&buf, 5).is_err());
    }

    #[test]
    fn print_renders_rows() {
        let mut buf = Vec::new();
        add_value(&mut buf, &Value::UInt(7)).unwrap();
        add_value(&mut buf, &Value::Text("x".to_owned())).unwrap();
        let mut out = Vec::new();
        print(&buf, &mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "7;x\n");
    }
}
