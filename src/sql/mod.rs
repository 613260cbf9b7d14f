//! The SQL frontend: parsing into the crate's AST.

pub mod ast;
pub mod parser;

pub use ast::{AggFun, Ast, CmpOp, Cond, Lit, ProjExpr, SelectStmt};
pub use parser::{parse, parse_one, StreamParser};
