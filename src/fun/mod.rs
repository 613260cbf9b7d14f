//! Aggregate functions with a reset/map/reduce lifecycle.

pub mod group;

pub use group::Group;

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, ErrorKind, Result};
use crate::mem::{Block, BlockList};
use crate::sql::ast::AggFun;
use crate::types::{field_bits, Content, Value, ValueBits, ValueType};

const OBJECT: &str = "fun";

/// Block size of the buffered-value list.
const FUN_BLOCK: usize = 4096;

/// How a function consumes its input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunShape {
    /// Needs no value (count).
    Zero,
    /// Folds one register (sum, prod, max, min, spread, avg).
    One,
    /// Buffers all values (median, stddev, integral).
    Many,
    /// Counts value frequencies (mode).
    Tree,
}

fn shape_of(fun: AggFun) -> FunShape {
    match fun {
        AggFun::Count => FunShape::Zero,
        AggFun::Sum | AggFun::Prod | AggFun::Max | AggFun::Min | AggFun::Spread | AggFun::Avg => {
            FunShape::One
        }
        AggFun::Median | AggFun::Stddev | AggFun::Integral => FunShape::Many,
        AggFun::Mode => FunShape::Tree,
    }
}

/// Numeric payload under a type tag; the arithmetic dispatch of the
/// fold operations.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Num {
    /// Unsigned (also date/time).
    U(u64),
    /// Signed.
    I(i64),
    /// Float.
    F(f64),
}

impl Num {
    fn from_bits(typ: ValueType, bits: ValueBits) -> Result<Num> {
        Ok(match typ {
            ValueType::UInt | ValueType::Date | ValueType::Time => Num::U(bits),
            ValueType::Int => Num::I(bits as i64),
            ValueType::Float => Num::F(f64::from_bits(bits)),
            other => {
                return Err(Error::new(
                    ErrorKind::NotSupp,
                    OBJECT,
                    format!("aggregate over {other:?}"),
                ))
            }
        })
    }

    fn to_f64(self) -> f64 {
        match self {
            Num::U(u) => u as f64,
            Num::I(i) => i as f64,
            Num::F(f) => f,
        }
    }

    fn add(self, other: Num) -> Num {
        match (self, other) {
            (Num::U(a), Num::U(b)) => Num::U(a.wrapping_add(b)),
            (Num::I(a), Num::I(b)) => Num::I(a.wrapping_add(b)),
            (Num::F(a), Num::F(b)) => Num::F(a + b),
            (a, b) => Num::F(a.to_f64() + b.to_f64()),
        }
    }

    fn mul(self, other: Num) -> Num {
        match (self, other) {
            (Num::U(a), Num::U(b)) => Num::U(a.wrapping_mul(b)),
            (Num::I(a), Num::I(b)) => Num::I(a.wrapping_mul(b)),
            (Num::F(a), Num::F(b)) => Num::F(a * b),
            (a, b) => Num::F(a.to_f64() * b.to_f64()),
        }
    }

    fn sub(self, other: Num) -> Num {
        match (self, other) {
            (Num::U(a), Num::U(b)) => Num::U(a.wrapping_sub(b)),
            (Num::I(a), Num::I(b)) => Num::I(a.wrapping_sub(b)),
            (Num::F(a), Num::F(b)) => Num::F(a - b),
            (a, b) => Num::F(a.to_f64() - b.to_f64()),
        }
    }

    fn lt(self, other: Num) -> bool {
        match (self, other) {
            (Num::U(a), Num::U(b)) => a < b,
            (Num::I(a), Num::I(b)) => a < b,
            (Num::F(a), Num::F(b)) => a < b,
            (a, b) => a.to_f64() < b.to_f64(),
        }
    }

    fn value(self, typ: ValueType) -> Value {
        match self {
            Num::U(u) => match typ {
                ValueType::Date => Value::Date(u as i64),
                ValueType::Time => Value::Time(u as i64),
                _ => Value::UInt(u),
            },
            Num::I(i) => Value::Int(i),
            Num::F(f) => Value::Float(f),
        }
    }
}

/// One aggregate function over one record field.
pub struct Fun {
    fun: AggFun,
    shape: FunShape,
    ctype: Content,
    off: u16,
    size: u16,
    dtype: ValueType,
    count: u64,
    r1: Option<Num>,
    r2: Option<Num>,
    many: VecDeque<Block>,
    many_off: usize,
    flist: Arc<BlockList>,
    tree: BTreeMap<ValueBits, u64>,
}

impl Fun {
    /// A function of kind `fun` over the field at `(off, size)` of
    /// records with content `ctype`, declared as `dtype`.
    pub fn new(
        fun: AggFun,
        ctype: Content,
        off: u16,
        size: u16,
        dtype: ValueType,
        flist: Arc<BlockList>,
    ) -> Fun {
        Fun {
            fun,
            shape: shape_of(fun),
            ctype,
            off,
            size,
            dtype,
            count: 0,
            r1: None,
            r2: None,
            many: VecDeque::new(),
            many_off: 0,
            flist,
            tree: BTreeMap::new(),
        }
    }

    /// Content type this function applies to.
    pub fn ctype(&self) -> Content {
        self.ctype
    }

    /// The output type of the function.
    pub fn otype(&self) -> ValueType {
        match self.fun {
            AggFun::Count => ValueType::UInt,
            AggFun::Avg | AggFun::Stddev | AggFun::Integral => ValueType::Float,
            _ => self.dtype,
        }
    }

    /// Clears all registers and buffers for the next group.
    pub fn reset(&mut self) -> Result<()> {
        self.count = 0;
        self.r1 = None;
        self.r2 = None;
        self.tree.clear();
        self.many_off = 0;
        self.flist.free_all(&mut self.many)
    }

    /// Folds one record into the function.
    pub fn map(&mut self, rec: &[u8]) -> Result<()> {
        self.count += 1;
        match self.shape {
            FunShape::Zero => Ok(()),
            FunShape::One => {
                let v = Num::from_bits(self.dtype, field_bits(rec, self.off, self.size))?;
                match self.fun {
                    AggFun::Sum | AggFun::Avg => {
                        self.r1 = Some(self.r1.map_or(v, |r| r.add(v)));
                    }
                    AggFun::Prod => {
                        self.r1 = Some(self.r1.map_or(v, |r| r.mul(v)));
                    }
                    AggFun::Max => {
                        self.r1 = Some(self.r1.map_or(v, |r| if r.lt(v) { v } else { r }));
                    }
                    AggFun::Min => {
                        self.r1 = Some(self.r1.map_or(v, |r| if v.lt(r) { v } else { r }));
                    }
                    AggFun::Spread => {
                        self.r1 = Some(self.r1.map_or(v, |r| if r.lt(v) { v } else { r }));
                        self.r2 = Some(self.r2.map_or(v, |r| if v.lt(r) { v } else { r }));
                    }
                    _ => {
                        return Err(Error::new(ErrorKind::Fun, OBJECT, "shape mismatch"));
                    }
                }
                Ok(())
            }
            FunShape::Many => self.collect(rec),
            FunShape::Tree => {
                let bits = field_bits(rec, self.off, self.size);
                *self.tree.entry(bits).or_insert(0) += 1;
                Ok(())
            }
        }
    }

    /// Buffers the field value (and the timestamp for integral) into
    /// the block list.
    fn collect(&mut self, rec: &[u8]) -> Result<()> {
        let mut entry = [0u8; 16];
        LittleEndian::write_u64(&mut entry[0..8], field_bits(rec, self.off, self.size));
        // integral weights values by their timestamp distance; only
        // edges carry one
        let width = if self.fun == AggFun::Integral && self.ctype == Content::Edge {
            LittleEndian::write_u64(
                &mut entry[8..16],
                field_bits(rec, crate::types::edge_off::TIMESTAMP, 8),
            );
            16
        } else {
            8
        };
        let need_block = match self.many.back() {
            None => true,
            Some(b) => self.many_off + width > b.buf.len(),
        };
        if need_block {
            self.flist.give(&mut self.many)?;
            self.many_off = 0;
        }
        let block = self
            .many
            .back_mut()
            .ok_or_else(|| Error::new(ErrorKind::Panic, OBJECT, "block list empty"))?;
        block.buf[self.many_off..self.many_off + width].copy_from_slice(&entry[..width]);
        self.many_off += width;
        block.sz = self.many_off;
        Ok(())
    }

    fn buffered(&self) -> Vec<(Num, i64)> {
        let width = if self.fun == AggFun::Integral && self.ctype == Content::Edge {
            16
        } else {
            8
        };
        let mut out = Vec::new();
        for block in &self.many {
            for chunk in block.used().chunks(width) {
                let bits = LittleEndian::read_u64(&chunk[0..8]);
                let ts = if width == 16 {
                    LittleEndian::read_u64(&chunk[8..16]) as i64
                } else {
                    0
                };
                if let Ok(v) = Num::from_bits(self.dtype, bits) {
                    out.push((v, ts));
                }
            }
        }
        out
    }

    /// Finalizes the function into its result value.
    pub fn reduce(&mut self) -> Result<Value> {
        match self.fun {
            AggFun::Count => Ok(Value::UInt(self.count)),
            AggFun::Sum | AggFun::Prod | AggFun::Max | AggFun::Min => self
                .r1
                .map(|r| r.value(self.otype()))
                .ok_or_else(|| Error::new(ErrorKind::Fun, OBJECT, "no input")),
            AggFun::Spread => match (self.r1, self.r2) {
                (Some(max), Some(min)) => Ok(max.sub(min).value(self.otype())),
                _ => Err(Error::new(ErrorKind::Fun, OBJECT, "no input")),
            },
            AggFun::Avg => match self.r1 {
                Some(sum) if self.count > 0 => {
                    Ok(Value::Float(sum.to_f64() / self.count as f64))
                }
                _ => Err(Error::new(ErrorKind::Fun, OBJECT, "no input")),
            },
            AggFun::Median => {
                let mut vals = self.buffered();
                if vals.is_empty() {
                    return Err(Error::new(ErrorKind::Fun, OBJECT, "no input"));
                }
                vals.sort_by(|a, b| {
                    a.0.to_f64()
                        .partial_cmp(&b.0.to_f64())
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
                let n = vals.len();
                let med = if n % 2 == 1 {
                    vals[n / 2].0.to_f64()
                } else {
                    (vals[n / 2 - 1].0.to_f64() + vals[n / 2].0.to_f64()) / 2.0
                };
                Ok(Value::Float(med))
            }
            AggFun::Stddev => {
                let vals = self.buffered();
                if vals.len() < 2 {
                    return Ok(Value::Float(0.0));
                }
                let n = vals.len() as f64;
                let mean = vals.iter().map(|(v, _)| v.to_f64()).sum::<f64>() / n;
                let var = vals
                    .iter()
                    .map(|(v, _)| {
                        let d = v.to_f64() - mean;
                        d * d
                    })
                    .sum::<f64>()
                    / (n - 1.0);
                Ok(Value::Float(var.sqrt()))
            }
            AggFun::Integral => {
                let mut vals = self.buffered();
                if vals.is_empty() {
                    return Ok(Value::Float(0.0));
                }
                vals.sort_by_key(|(_, ts)| *ts);
                // trapezoid rule over the timestamped samples
                let mut acc = 0.0;
                for w in vals.windows(2) {
                    let dt = (w[1].1 - w[0].1) as f64;
                    acc += dt * (w[0].0.to_f64() + w[1].0.to_f64()) / 2.0;
                }
                Ok(Value::Float(acc))
            }
            AggFun::Mode => {
                let best = self
                    .tree
                    .iter()
                    .max_by_key(|(_, &n)| n)
                    .map(|(&bits, _)| bits)
                    .ok_or_else(|| Error::new(ErrorKind::Fun, OBJECT, "no input"))?;
                Value::from_bits(self.dtype, best)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{edge_off, Edge, EDGE_SIZE};

    fn flist() -> Arc<BlockList> {
        Arc::new(BlockList::new(FUN_BLOCK))
    }

    fn weighted(w: f64, ts: i64) -> [u8; EDGE_SIZE] {
        let mut e = Edge {
            origin: 1,
            timestamp: ts,
            ..Edge::default()
        };
        e.write_weight(&Value::Float(w));
        e.to_bytes()
    }

    fn fun(f: AggFun) -> Fun {
        Fun::new(
            f,
            Content::Edge,
            edge_off::WEIGHT,
            8,
            ValueType::Float,
            flist(),
        )
    }

    #[test]
    fn one_pass_functions() {
        let inputs = [3.0, 1.0, 4.0, 1.0, 5.0];
        let mut sum = fun(AggFun::Sum);
        let mut max = fun(AggFun::Max);
        let mut min = fun(AggFun::Min);
        let mut spread = fun(AggFun::Spread);
        let mut avg = fun(AggFun::Avg);
        let mut count = fun(AggFun::Count);
        for &w in &inputs {
            let rec = weighted(w, 0);
            for f in [&mut sum, &mut max, &mut min, &mut spread, &mut avg, &mut count] {
                f.map(&rec).unwrap();
            }
        }
        assert_eq!(sum.reduce().unwrap(), Value::Float(14.0));
        assert_eq!(max.reduce().unwrap(), Value::Float(5.0));
        assert_eq!(min.reduce().unwrap(), Value::Float(1.0));
        assert_eq!(spread.reduce().unwrap(), Value::Float(4.0));
        assert_eq!(avg.reduce().unwrap(), Value::Float(2.8));
        assert_eq!(count.reduce().unwrap(), Value::UInt(5));
    }

    #[test]
    fn buffered_functions() {
        let mut median = fun(AggFun::Median);
        let mut stddev = fun(AggFun::Stddev);
        for w in [9.0, 1.0, 5.0, 3.0, 7.0] {
            let rec = weighted(w, 0);
            median.map(&rec).unwrap();
            stddev.map(&rec).unwrap();
        }
        assert_eq!(median.reduce().unwrap(), Value::Float(5.0));
        let Value::Float(sd) = stddev.reduce().unwrap() else {
            panic!("stddev must be a float")
        };
        assert!((sd - 10.0f64.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn integral_is_time_weighted() {
        let mut int = fun(AggFun::Integral);
        // constant value 2.0 over [0, 10]
        for ts in [0i64, 5, 10] {
            int.map(&weighted(2.0, ts)).unwrap();
        }
        assert_eq!(int.reduce().unwrap(), Value::Float(20.0));
    }

    #[test]
    fn mode_picks_most_frequent() {
        let mut mode = Fun::new(
            AggFun::Mode,
            Content::Edge,
            edge_off::ORIGIN,
            8,
            ValueType::UInt,
            flist(),
        );
        for origin in [1u64, 2, 2, 3, 2, 1] {
            let e = Edge {
                origin,
                ..Edge::default()
            };
            mode.map(&e.to_bytes()).unwrap();
        }
        assert_eq!(mode.reduce().unwrap(), Value::UInt(2));
    }

    #[test]
    fn reset_clears_state() {
        let mut sum = fun(AggFun::Sum);
        sum.map(&weighted(5.0, 0)).unwrap();
        sum.reset().unwrap();
        sum.map(&weighted(2.0, 0)).unwrap();
        assert_eq!(sum.reduce().unwrap(), Value::Float(2.0));
    }

    #[test]
    fn buffered_spills_across_blocks() {
        let mut median = fun(AggFun::Median);
        // more than one 4 KiB block of 8-byte values
        for i in 0..1001 {
            median.map(&weighted(i as f64, 0)).unwrap();
        }
        assert_eq!(median.reduce().unwrap(), Value::Float(500.0));
    }
}
