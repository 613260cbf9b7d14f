//! Record filters: boolean/compare trees over raw records.

use crate::sql::ast::CmpOp;
use crate::types::{field_bits, Value, ValueType};

/// A tree of boolean and compare nodes evaluated against raw
/// records. Evaluation short-circuits.
#[derive(Debug, Clone)]
pub enum Filter {
    /// Always true.
    True,
    /// Always false.
    False,
    /// Passes its kid through.
    Just(Box<Filter>),
    /// Negation.
    Not(Box<Filter>),
    /// Conjunction.
    And(Box<Filter>, Box<Filter>),
    /// Disjunction.
    Or(Box<Filter>, Box<Filter>),
    /// Compares the record field at `off` against a literal.
    Cmp {
        /// Comparison operator.
        op: CmpOp,
        /// Field offset into the record.
        off: u16,
        /// Field size in bytes.
        size: u16,
        /// Declared type of the field.
        typ: ValueType,
        /// The literal to compare with.
        val: Value,
    },
}

impl Filter {
    /// Evaluates the filter against one record.
    pub fn eval(&self, rec: &[u8]) -> bool {
        match self {
            Filter::True => true,
            Filter::False => false,
            Filter::Just(kid) => kid.eval(rec),
            Filter::Not(kid) => !kid.eval(rec),
            Filter::And(l, r) => l.eval(rec) && r.eval(rec),
            Filter::Or(l, r) => l.eval(rec) || r.eval(rec),
            Filter::Cmp {
                op,
                off,
                size,
                typ,
                val,
            } => {
                let bits = field_bits(rec, *off, *size);
                let field = match Value::from_bits(*typ, bits) {
                    Ok(v) => v,
                    Err(_) => return false,
                };
                let ord = match field.partial_cmp_same(val) {
                    Some(o) => o,
                    None => return false,
                };
                match op {
                    CmpOp::Eq => ord.is_eq(),
                    CmpOp::Ne => ord.is_ne(),
                    CmpOp::Lt => ord.is_lt(),
                    CmpOp::Le => ord.is_le(),
                    CmpOp::Gt => ord.is_gt(),
                    CmpOp::Ge => ord.is_ge(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{edge_off, Edge};

    fn rec(origin: u64, ts: i64) -> Vec<u8> {
        Edge {
            origin,
            timestamp: ts,
            ..Edge::default()
        }
        .to_bytes()
        .to_vec()
    }

    fn eq_origin(v: u64) -> Filter {
        Filter::Cmp {
            op: CmpOp::Eq,
            off: edge_off::ORIGIN,
            size: 8,
            typ: ValueType::UInt,
            val: Value::UInt(v),
        }
    }

    #[test]
    fn compare_and_bool_nodes() {
        let f = Filter::And(
            Box::new(eq_origin(7)),
            Box::new(Filter::Cmp {
                op: CmpOp::Ge,
                off: edge_off::TIMESTAMP,
                size: 8,
                typ: ValueType::Time,
                val: Value::Time(10),
            }),
        );
        assert!(f.eval(&rec(7, 15)));
        assert!(!f.eval(&rec(7, 5)));
        assert!(!f.eval(&rec(8, 15)));

        let f = Filter::Or(Box::new(eq_origin(1)), Box::new(eq_origin(2)));
        assert!(f.eval(&rec(2, 0)));
        assert!(!f.eval(&rec(3, 0)));

        assert!(Filter::Not(Box::new(Filter::False)).eval(&rec(0, 0)));
        assert!(Filter::Just(Box::new(Filter::True)).eval(&rec(0, 0)));
    }

    #[test]
    fn negative_timestamps_compare_signed() {
        let f = Filter::Cmp {
            op: CmpOp::Lt,
            off: edge_off::TIMESTAMP,
            size: 8,
            typ: ValueType::Time,
            val: Value::Time(0),
        };
        assert!(f.eval(&rec(1, -5)));
        assert!(!f.eval(&rec(1, 5)));
    }
}
