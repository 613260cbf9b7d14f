//! Statement parsing and length-prefixed streaming frames.

use std::io::Read;

use sqlparser::ast as sp;
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

use crate::error::{Error, ErrorKind, Result};
use crate::sort::SortOrd;
use crate::sql::ast::{AggFun, Ast, CmpOp, Cond, Lit, ProjExpr, SelectStmt};
use crate::types::ValueType;

const OBJECT: &str = "parser";

/// Maximum statement frame in streaming mode.
pub const MAX_FRAME: usize = 8192;

/// Parses a statement string into the crate's AST; several
/// statements may be separated by `;`.
pub fn parse(sql: &str) -> Result<Vec<Ast>> {
    let stmts = Parser::parse_sql(&GenericDialect {}, sql)
        .map_err(|e| Error::new(ErrorKind::Parser, OBJECT, e.to_string()))?;
    stmts.into_iter().map(convert).collect()
}

/// Parses exactly one statement.
pub fn parse_one(sql: &str) -> Result<Ast> {
    let mut stmts = parse(sql)?;
    match stmts.len() {
        1 => Ok(stmts.remove(0)),
        n => Err(Error::new(
            ErrorKind::Parser,
            OBJECT,
            format!("expected one statement, got {n}"),
        )),
    }
}

/// Reads length-prefixed statement frames from a byte stream.
///
/// Each frame is a 4-byte little-endian length followed by that many
/// UTF-8 bytes holding one statement. A clean end of stream yields
/// `None`; a truncated frame is a protocol error, an oversized frame
/// a buffer-size error.
pub struct StreamParser<R: Read> {
    input: R,
    buf: Vec<u8>,
}

impl<R: Read> StreamParser<R> {
    /// Wraps a byte stream.
    pub fn new(input: R) -> StreamParser<R> {
        StreamParser {
            input,
            buf: vec![0u8; MAX_FRAME],
        }
    }

    /// The next statement, or `None` when the stream closed between
    /// frames.
    pub fn next_stmt(&mut self) -> Result<Option<Ast>> {
        let mut hdr = [0u8; 4];
        let mut got = 0;
        while got < 4 {
            let n = self
                .input
                .read(&mut hdr[got..])
                .map_err(|e| Error::with_io(ErrorKind::Read, OBJECT, "frame header", e))?;
            if n == 0 {
                if got == 0 {
                    return Ok(None); // closed between frames
                }
                return Err(Error::new(ErrorKind::Protocol, OBJECT, "truncated header"));
            }
            got += n;
        }
        let len = u32::from_le_bytes(hdr) as usize;
        if len == 0 {
            return Err(Error::new(ErrorKind::Protocol, OBJECT, "empty frame"));
        }
        if len > MAX_FRAME {
            return Err(Error::new(
                ErrorKind::TooBig,
                OBJECT,
                format!("frame of {len} bytes"),
            ));
        }
        self.input
            .read_exact(&mut self.buf[..len])
            .map_err(|e| Error::with_io(ErrorKind::Protocol, OBJECT, "truncated frame", e))?;
        let sql = std::str::from_utf8(&self.buf[..len])
            .map_err(|_| Error::new(ErrorKind::Protocol, OBJECT, "frame is not UTF-8"))?;
        // parser state does not survive a statement: each frame is
        // parsed from a fresh parser
        parse_one(sql).map(Some)
    }
}

fn object_name(name: &sp::ObjectName) -> String {
    name.0
        .last()
        .map(|i| i.value.clone())
        .unwrap_or_default()
}

fn convert(stmt: sp::Statement) -> Result<Ast> {
    match stmt {
        sp::Statement::Query(q) => convert_query(*q),
        sp::Statement::CreateIndex {
            name,
            table_name,
            columns,
            ..
        } => {
            let name = name
                .as_ref()
                .map(object_name)
                .filter(|n| !n.is_empty())
                .ok_or_else(|| Error::new(ErrorKind::Parser, OBJECT, "index needs a name"))?;
            let keys = columns
                .iter()
                .map(|c| ident_of(&c.expr))
                .collect::<Result<Vec<_>>>()?;
            Ok(Ast::CreateIndex {
                name,
                on: object_name(&table_name),
                keys,
            })
        }
        sp::Statement::Drop {
            object_type: sp::ObjectType::Index,
            names,
            ..
        } => {
            let name = names
                .first()
                .map(object_name)
                .ok_or_else(|| Error::new(ErrorKind::Parser, OBJECT, "drop index needs a name"))?;
            Ok(Ast::DropIndex { name })
        }
        sp::Statement::CreateTable { name, columns, .. } => convert_create_table(name, columns),
        sp::Statement::Insert {
            table_name,
            columns,
            source,
            ..
        } => {
            let source = source
                .ok_or_else(|| Error::new(ErrorKind::Parser, OBJECT, "insert needs values"))?;
            let rows = match *source.body {
                sp::SetExpr::Values(values) => values
                    .rows
                    .into_iter()
                    .map(|row| row.iter().map(lit_of).collect::<Result<Vec<_>>>())
                    .collect::<Result<Vec<_>>>()?,
                _ => {
                    return Err(Error::new(
                        ErrorKind::NotSupp,
                        OBJECT,
                        "insert from query",
                    ))
                }
            };
            Ok(Ast::Insert {
                target: object_name(&table_name),
                fields: columns.iter().map(|c| c.value.clone()).collect(),
                rows,
            })
        }
        other => Err(Error::new(
            ErrorKind::NotSupp,
            OBJECT,
            format!("statement: {other}"),
        )),
    }
}

fn convert_create_table(name: sp::ObjectName, columns: Vec<sp::ColumnDef>) -> Result<Ast> {
    let name = object_name(&name);
    // an edge type names its endpoints as columns typed by the
    // vertex types: (origin client, destin product, weight float)
    let is_edge = columns.iter().any(|c| c.name.value.eq_ignore_ascii_case("origin"))
        && columns.iter().any(|c| c.name.value.eq_ignore_ascii_case("destin"));
    if is_edge {
        let mut origin = String::new();
        let mut destin = String::new();
        let mut wtype = [ValueType::UInt, ValueType::UInt];
        for c in &columns {
            let cname = c.name.value.to_ascii_lowercase();
            match cname.as_str() {
                "origin" => origin = type_name(&c.data_type),
                "destin" => destin = type_name(&c.data_type),
                "weight" => wtype[0] = value_type(&c.data_type)?,
                "weight2" => wtype[1] = value_type(&c.data_type)?,
                _ => {
                    return Err(Error::new(
                        ErrorKind::Parser,
                        OBJECT,
                        format!("unexpected edge column '{cname}'"),
                    ))
                }
            }
        }
        return Ok(Ast::CreateEdge {
            name,
            origin,
            destin,
            wtype,
        });
    }
    let mut props = Vec::with_capacity(columns.len());
    for c in &columns {
        let pk = c.options.iter().any(|o| {
            matches!(
                o.option,
                sp::ColumnOption::Unique {
                    is_primary: true,
                    ..
                }
            )
        });
        props.push((c.name.value.clone(), value_type(&c.data_type)?, pk));
    }
    Ok(Ast::CreateType { name, props })
}

fn type_name(dt: &sp::DataType) -> String {
    match dt {
        sp::DataType::Custom(name, _) => object_name(name),
        other => other.to_string(),
    }
}

fn value_type(dt: &sp::DataType) -> Result<ValueType> {
    Ok(match dt {
        sp::DataType::Text | sp::DataType::Varchar(_) | sp::DataType::Char(_) => ValueType::Text,
        sp::DataType::Int(_) | sp::DataType::Integer(_) | sp::DataType::BigInt(_) => {
            ValueType::Int
        }
        sp::DataType::UnsignedInt(_)
        | sp::DataType::UnsignedInteger(_)
        | sp::DataType::UnsignedBigInt(_) => ValueType::UInt,
        sp::DataType::Float(_) | sp::DataType::Real | sp::DataType::Double => ValueType::Float,
        sp::DataType::Boolean => ValueType::Bool,
        sp::DataType::Date => ValueType::Date,
        sp::DataType::Time(..) | sp::DataType::Timestamp(..) => ValueType::Time,
        sp::DataType::Custom(..) => ValueType::from_name(&type_name(dt))?,
        other => {
            return Err(Error::new(
                ErrorKind::NotSupp,
                OBJECT,
                format!("data type {other}"),
            ))
        }
    })
}

fn convert_query(q: sp::Query) -> Result<Ast> {
    let order_by = q
        .order_by
        .iter()
        .map(|o| {
            let field = ident_of(&o.expr)?;
            let ord = match o.asc {
                Some(false) => SortOrd::Desc,
                _ => SortOrd::Asc,
            };
            Ok((field, ord))
        })
        .collect::<Result<Vec<_>>>()?;
    let select = match *q.body {
        sp::SetExpr::Select(s) => *s,
        _ => {
            return Err(Error::new(
                ErrorKind::NotSupp,
                OBJECT,
                "only plain SELECT is supported",
            ))
        }
    };

    let mut projection = Vec::with_capacity(select.projection.len());
    for item in &select.projection {
        match item {
            sp::SelectItem::UnnamedExpr(e) | sp::SelectItem::ExprWithAlias { expr: e, .. } => {
                projection.push(proj_of(e)?)
            }
            sp::SelectItem::Wildcard(_) => projection.push(ProjExpr::Field("*".to_owned())),
            other => {
                return Err(Error::new(
                    ErrorKind::NotSupp,
                    OBJECT,
                    format!("projection {other}"),
                ))
            }
        }
    }

    let from = match select.from.first().map(|t| &t.relation) {
        Some(sp::TableFactor::Table { name, .. }) => object_name(name),
        _ => {
            return Err(Error::new(
                ErrorKind::Parser,
                OBJECT,
                "FROM must name one context",
            ))
        }
    };

    let filter = select.selection.as_ref().map(cond_of).transpose()?;

    let group_by = match &select.group_by {
        sp::GroupByExpr::Expressions(v) => v
            .iter()
            .map(ident_of)
            .collect::<Result<Vec<_>>>()?,
        _ => Vec::new(),
    };

    Ok(Ast::Select(SelectStmt {
        projection,
        from,
        filter,
        group_by,
        order_by,
    }))
}

fn ident_of(e: &sp::Expr) -> Result<String> {
    match e {
        sp::Expr::Identifier(i) => Ok(i.value.clone()),
        sp::Expr::CompoundIdentifier(ids) => Ok(ids
            .last()
            .map(|i| i.value.clone())
            .unwrap_or_default()),
        other => Err(Error::new(
            ErrorKind::Parser,
            OBJECT,
            format!("expected a field, got {other}"),
        )),
    }
}

fn proj_of(e: &sp::Expr) -> Result<ProjExpr> {
    match e {
        sp::Expr::Identifier(_) | sp::Expr::CompoundIdentifier(_) => {
            Ok(ProjExpr::Field(ident_of(e)?))
        }
        sp::Expr::Function(f) => {
            let fname = object_name(&f.name);
            let fun = AggFun::from_name(&fname).ok_or_else(|| {
                Error::new(ErrorKind::NotSupp, OBJECT, format!("function {fname}"))
            })?;
            let arg = match f.args.first() {
                None => None,
                Some(sp::FunctionArg::Unnamed(sp::FunctionArgExpr::Wildcard)) => None,
                Some(sp::FunctionArg::Unnamed(sp::FunctionArgExpr::Expr(e))) => Some(ident_of(e)?),
                Some(other) => {
                    return Err(Error::new(
                        ErrorKind::NotSupp,
                        OBJECT,
                        format!("aggregate argument {other}"),
                    ))
                }
            };
            Ok(ProjExpr::Agg { fun, arg })
        }
        other => Err(Error::new(
            ErrorKind::NotSupp,
            OBJECT,
            format!("projection {other}"),
        )),
    }
}

fn lit_of(e: &sp::Expr) -> Result<Lit> {
    match e {
        sp::Expr::Value(v) => match v {
            sp::Value::Number(s, _) => parse_number(s),
            sp::Value::SingleQuotedString(s) | sp::Value::DoubleQuotedString(s) => {
                Ok(Lit::Str(s.clone()))
            }
            sp::Value::Boolean(b) => Ok(Lit::Bool(*b)),
            other => Err(Error::new(
                ErrorKind::NotSupp,
                OBJECT,
                format!("literal {other}"),
            )),
        },
        sp::Expr::UnaryOp {
            op: sp::UnaryOperator::Minus,
            expr,
        } => match lit_of(expr)? {
            Lit::UInt(u) => Ok(Lit::Int(-(u as i64))),
            Lit::Int(i) => Ok(Lit::Int(-i)),
            Lit::Float(f) => Ok(Lit::Float(-f)),
            other => Err(Error::new(
                ErrorKind::Parser,
                OBJECT,
                format!("cannot negate {other:?}"),
            )),
        },
        sp::Expr::Nested(e) => lit_of(e),
        other => Err(Error::new(
            ErrorKind::Parser,
            OBJECT,
            format!("expected a literal, got {other}"),
        )),
    }
}

fn parse_number(s: &str) -> Result<Lit> {
    if s.contains(['.', 'e', 'E']) {
        s.parse::<f64>()
            .map(Lit::Float)
            .map_err(|e| Error::new(ErrorKind::Parser, OBJECT, format!("{s}: {e}")))
    } else {
        s.parse::<u64>()
            .map(Lit::UInt)
            .map_err(|e| Error::new(ErrorKind::Parser, OBJECT, format!("{s}: {e}")))
    }
}

fn cond_of(e: &sp::Expr) -> Result<Cond> {
    match e {
        sp::Expr::Nested(inner) => cond_of(inner),
        sp::Expr::UnaryOp {
            op: sp::UnaryOperator::Not,
            expr,
        } => Ok(Cond::Not(Box::new(cond_of(expr)?))),
        sp::Expr::BinaryOp { left, op, right } => match op {
            sp::BinaryOperator::And => Ok(Cond::And(
                Box::new(cond_of(left)?),
                Box::new(cond_of(right)?),
            )),
            sp::BinaryOperator::Or => Ok(Cond::Or(
                Box::new(cond_of(left)?),
                Box::new(cond_of(right)?),
            )),
            _ => {
                let cmp = match op {
                    sp::BinaryOperator::Eq => CmpOp::Eq,
                    sp::BinaryOperator::NotEq => CmpOp::Ne,
                    sp::BinaryOperator::Lt => CmpOp::Lt,
                    sp::BinaryOperator::LtEq => CmpOp::Le,
                    sp::BinaryOperator::Gt => CmpOp::Gt,
                    sp::BinaryOperator::GtEq => CmpOp::Ge,
                    other => {
                        return Err(Error::new(
                            ErrorKind::NotSupp,
                            OBJECT,
                            format!("operator {other}"),
                        ))
                    }
                };
                // field op constant, or mirrored
                if let Ok(field) = ident_of(left) {
                    Ok(Cond::Cmp {
                        op: cmp,
                        field,
                        value: lit_of(right)?,
                    })
                } else {
                    let field = ident_of(right)?;
                    Ok(Cond::Cmp {
                        op: mirror(cmp),
                        field,
                        value: lit_of(left)?,
                    })
                }
            }
        },
        other => Err(Error::new(
            ErrorKind::NotSupp,
            OBJECT,
            format!("condition {other}"),
        )),
    }
}

fn mirror(op: CmpOp) -> CmpOp {
    match op {
        CmpOp::Lt => CmpOp::Gt,
        CmpOp::Le => CmpOp::Ge,
        CmpOp::Gt => CmpOp::Lt,
        CmpOp::Ge => CmpOp::Le,
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_star_round_trip() {
        let ast =
            parse_one("select count(*) from sales where origin = 1 and destin = 2").unwrap();
        let Ast::Select(sel) = ast else {
            panic!("expected a select")
        };
        assert_eq!(
            sel.projection,
            vec![ProjExpr::Agg {
                fun: AggFun::Count,
                arg: None
            }]
        );
        assert_eq!(sel.from, "sales");
        let Some(Cond::And(l, r)) = sel.filter else {
            panic!("expected AND")
        };
        assert_eq!(
            *l,
            Cond::Cmp {
                op: CmpOp::Eq,
                field: "origin".to_owned(),
                value: Lit::UInt(1)
            }
        );
        assert_eq!(
            *r,
            Cond::Cmp {
                op: CmpOp::Eq,
                field: "destin".to_owned(),
                value: Lit::UInt(2)
            }
        );
    }

    #[test]
    fn select_fields_group_order() {
        let ast = parse_one(
            "select origin, sum(weight) from sales group by origin order by origin desc",
        )
        .unwrap();
        let Ast::Select(sel) = ast else {
            panic!("expected a select")
        };
        assert_eq!(sel.projection.len(), 2);
        assert_eq!(sel.group_by, vec!["origin".to_owned()]);
        assert_eq!(sel.order_by, vec![("origin".to_owned(), SortOrd::Desc)]);
    }

    #[test]
    fn ddl_statements() {
        let ast = parse_one("create index idx_od on sales (origin, destin)").unwrap();
        assert_eq!(
            ast,
            Ast::CreateIndex {
                name: "idx_od".to_owned(),
                on: "sales".to_owned(),
                keys: vec!["origin".to_owned(), "destin".to_owned()],
            }
        );
        let ast = parse_one("drop index idx_od").unwrap();
        assert_eq!(
            ast,
            Ast::DropIndex {
                name: "idx_od".to_owned()
            }
        );
        let ast = parse_one("create table client (id uint primary key, name text)").unwrap();
        let Ast::CreateType { name, props } = ast else {
            panic!("expected a vertex type")
        };
        assert_eq!(name, "client");
        assert_eq!(
            props,
            vec![
                ("id".to_owned(), ValueType::UInt, true),
                ("name".to_owned(), ValueType::Text, false),
            ]
        );
        let ast = parse_one(
            "create table buys (origin client, destin product, weight float, weight2 uint)",
        )
        .unwrap();
        assert_eq!(
            ast,
            Ast::CreateEdge {
                name: "buys".to_owned(),
                origin: "client".to_owned(),
                destin: "product".to_owned(),
                wtype: [ValueType::Float, ValueType::UInt],
            }
        );
    }

    #[test]
    fn insert_rows() {
        let ast = parse_one(
            "insert into sales (origin, destin, timestamp, weight) values (1, 2, 3, 4.5)",
        )
        .unwrap();
        let Ast::Insert {
            target,
            fields,
            rows,
        } = ast
        else {
            panic!("expected an insert")
        };
        assert_eq!(target, "sales");
        assert_eq!(fields.len(), 4);
        assert_eq!(
            rows,
            vec![vec![
                Lit::UInt(1),
                Lit::UInt(2),
                Lit::UInt(3),
                Lit::Float(4.5)
            ]]
        );
    }

    #[test]
    fn streaming_frames() {
        let mut bytes = Vec::new();
        for sql in ["select origin from sales", "select destin from sales"] {
            bytes.extend_from_slice(&(sql.len() as u32).to_le_bytes());
            bytes.extend_from_slice(sql.as_bytes());
        }
        let mut sp = StreamParser::new(&bytes[..]);
        assert!(matches!(sp.next_stmt().unwrap(), Some(Ast::Select(_))));
        assert!(matches!(sp.next_stmt().unwrap(), Some(Ast::Select(_))));
        assert!(sp.next_stmt().unwrap().is_none());
    }

    #[test]
    fn streaming_frame_errors() {
        // truncated frame
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&100u32.to_le_bytes());
        bytes.extend_from_slice(b"select");
        let mut sp = StreamParser::new(&bytes[..]);
        assert_eq!(sp.next_stmt().unwrap_err().kind(), ErrorKind::Protocol);

        // oversized frame
        let bytes = ((MAX_FRAME + 1) as u32).to_le_bytes();
        let mut sp = StreamParser::new(&bytes[..]);
        assert_eq!(sp.next_stmt().unwrap_err().kind(), ErrorKind::TooBig);
    }

    #[test]
    fn parse_errors_do_not_stick() {
        assert!(parse_one("select from from").is_err());
        // a fresh parse succeeds right after a failure
        assert!(parse_one("select origin from sales").is_ok());
    }
}
