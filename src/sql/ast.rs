//! The typed statement tree the parser produces.

use crate::sort::SortOrd;
use crate::types::ValueType;

/// A parsed literal.
#[derive(Debug, Clone, PartialEq)]
pub enum Lit {
    /// Unsigned integer.
    UInt(u64),
    /// Signed integer (only produced for negative numbers).
    Int(i64),
    /// Float.
    Float(f64),
    /// Quoted string.
    Str(String),
    /// Boolean.
    Bool(bool),
}

/// Comparison operators of a filter condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    /// Equal.
    Eq,
    /// Not equal.
    Ne,
    /// Less than.
    Lt,
    /// Less or equal.
    Le,
    /// Greater than.
    Gt,
    /// Greater or equal.
    Ge,
}

/// A boolean condition tree over named fields.
#[derive(Debug, Clone, PartialEq)]
pub enum Cond {
    /// Both sides must hold.
    And(Box<Cond>, Box<Cond>),
    /// Either side must hold.
    Or(Box<Cond>, Box<Cond>),
    /// The side must not hold.
    Not(Box<Cond>),
    /// A field compared against a constant.
    Cmp {
        /// Comparison operator.
        op: CmpOp,
        /// Field name (record field or vertex property).
        field: String,
        /// The constant.
        value: Lit,
    },
}

impl Cond {
    /// The constant-equality conjuncts of this condition, in order.
    /// Only a top-level conjunction contributes; anything under `OR`
    /// or `NOT` is opaque to index selection.
    pub fn equality_conjuncts(&self) -> Vec<(&str, &Lit)> {
        let mut out = Vec::new();
        self.collect_eq(&mut out);
        out
    }

    fn collect_eq<'a>(&'a self, out: &mut Vec<(&'a str, &'a Lit)>) {
        match self {
            Cond::And(l, r) => {
                l.collect_eq(out);
                r.collect_eq(out);
            }
            Cond::Cmp {
                op: CmpOp::Eq,
                field,
                value,
            } => out.push((field.as_str(), value)),
            _ => {}
        }
    }

    /// The range conjuncts (`<`, `<=`, `>`, `>=`) of a top-level
    /// conjunction.
    pub fn range_conjuncts(&self) -> Vec<(&str, CmpOp, &Lit)> {
        let mut out = Vec::new();
        self.collect_range(&mut out);
        out
    }

    fn collect_range<'a>(&'a self, out: &mut Vec<(&'a str, CmpOp, &'a Lit)>) {
        match self {
            Cond::And(l, r) => {
                l.collect_range(out);
                r.collect_range(out);
            }
            Cond::Cmp { op, field, value }
                if matches!(op, CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge) =>
            {
                out.push((field.as_str(), *op, value))
            }
            _ => {}
        }
    }
}

/// Aggregate functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggFun {
    /// Row count.
    Count,
    /// Sum.
    Sum,
    /// Product.
    Prod,
    /// Maximum.
    Max,
    /// Minimum.
    Min,
    /// Max minus min.
    Spread,
    /// Average.
    Avg,
    /// Median (buffered).
    Median,
    /// Standard deviation (buffered).
    Stddev,
    /// Time-weighted integral (buffered).
    Integral,
    /// Most frequent value.
    Mode,
}

impl AggFun {
    /// Parses an aggregate function name.
    pub fn from_name(name: &str) -> Option<AggFun> {
        Some(match name.to_ascii_lowercase().as_str() {
            "count" => AggFun::Count,
            "sum" => AggFun::Sum,
            "prod" => AggFun::Prod,
            "max" => AggFun::Max,
            "min" => AggFun::Min,
            "spread" => AggFun::Spread,
            "avg" => AggFun::Avg,
            "median" => AggFun::Median,
            "stddev" => AggFun::Stddev,
            "integral" => AggFun::Integral,
            "mode" => AggFun::Mode,
            _ => return None,
        })
    }
}

/// One projection item.
#[derive(Debug, Clone, PartialEq)]
pub enum ProjExpr {
    /// A plain field.
    Field(String),
    /// An aggregate over a field, or over `*` when `arg` is `None`.
    Agg {
        /// The function.
        fun: AggFun,
        /// Its argument field; `None` for `*`.
        arg: Option<String>,
    },
}

/// A `SELECT` statement.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectStmt {
    /// Projection items, in order.
    pub projection: Vec<ProjExpr>,
    /// The queried context or vertex type.
    pub from: String,
    /// The `WHERE` condition.
    pub filter: Option<Cond>,
    /// `GROUP BY` fields.
    pub group_by: Vec<String>,
    /// `ORDER BY` fields with direction.
    pub order_by: Vec<(String, SortOrd)>,
}

/// A parsed statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Ast {
    /// A query.
    Select(SelectStmt),
    /// `CREATE INDEX <name> ON <ctx> (<fields>)`.
    CreateIndex {
        /// Index name.
        name: String,
        /// Context the index covers.
        on: String,
        /// Key fields, most significant first.
        keys: Vec<String>,
    },
    /// `DROP INDEX <name>`.
    DropIndex {
        /// Index name.
        name: String,
    },
    /// `CREATE TABLE <vertex type> (...)`: declares a vertex type,
    /// or an edge type when the columns name `origin`/`destin` typed
    /// by vertex types.
    CreateType {
        /// Type name.
        name: String,
        /// Properties: name, type, primary key.
        props: Vec<(String, ValueType, bool)>,
    },
    /// The edge-type form of `CREATE TABLE`.
    CreateEdge {
        /// Edge type name.
        name: String,
        /// Origin vertex type name.
        origin: String,
        /// Destination vertex type name.
        destin: String,
        /// Weight types.
        wtype: [ValueType; 2],
    },
    /// `INSERT INTO <target> (<fields>) VALUES (...)`.
    Insert {
        /// Context or vertex type.
        target: String,
        /// Field names.
        fields: Vec<String>,
        /// One or more value rows.
        rows: Vec<Vec<Lit>>,
    },
}
