//! Plan construction: from the AST to an ordered list of plan nodes.

use std::sync::Arc;

use crate::error::{Error, ErrorKind, Result};
use crate::index::IndexDesc;
use crate::model::{EdgeType, VertexType};
use crate::reader::filter::Filter;
use crate::sort::SortOrd;
use crate::sql::ast::{AggFun, CmpOp, Cond, Lit, ProjExpr, SelectStmt};
use crate::store::Store;
use crate::text::TextDict;
use crate::time::Time;
use crate::types::{
    edge_off, size_by_off, Content, Key, RoleId, Value, ValueType, EDGE_SIZE,
};

const OBJECT: &str = "plan";

/// Node types in plan order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    /// Result summary.
    Summary,
    /// The reader at the leaves.
    Reader,
    /// Record filtering.
    Filter,
    /// Ordered grouping.
    Grouping,
    /// Aggregate functions.
    Aggregates,
    /// Result ordering.
    Ordering,
    /// Projection to the row format.
    Projection,
}

/// Reader strategies the planner can choose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderType {
    /// Scan all files.
    FullScan,
    /// Exact-key index search.
    Search,
    /// Index-driven file range.
    FRange,
    /// In-memory ordering of all records (bufidx).
    MRange,
    /// Count records without touching pages.
    CountAll,
}

/// A resolved record field.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    /// Display name.
    pub name: String,
    /// Offset into the record (or vrow slot offset).
    pub off: u16,
    /// Field size in bytes.
    pub size: u16,
    /// Declared type; `Nothing` means "read the type tag from the
    /// record" (untyped edge weights).
    pub typ: ValueType,
}

/// One projected column.
#[derive(Debug, Clone, PartialEq)]
pub enum ProjSpec {
    /// A record field or vrow slot.
    Field(FieldSpec),
    /// The assembled vertex id.
    VertexId,
    /// The result of aggregate slot `slot`.
    Agg {
        /// Index into the aggregate list.
        slot: usize,
        /// Display name.
        name: String,
    },
}

/// One aggregate to compute.
#[derive(Debug, Clone, PartialEq)]
pub struct FunSpec {
    /// The function.
    pub fun: AggFun,
    /// Input field; `None` for `count(*)`.
    pub field: Option<FieldSpec>,
}

/// The reader-plan descriptor.
pub struct ReaderPlan {
    /// Chosen strategy.
    pub rtype: ReaderType,
    /// The store to read.
    pub store: Arc<Store>,
    /// Pending (unsorted) files participate through bufidx+merge.
    pub plus: bool,
    /// The index driving search/frange.
    pub index: Option<Arc<IndexDesc>>,
    /// Exact key for `Search` (order-preserving encoding).
    pub key: Option<Vec<u8>>,
    /// Lower range bound for `FRange`.
    pub lo: Option<Vec<u8>>,
    /// Upper range bound for `FRange`.
    pub hi: Option<Vec<u8>>,
    /// Sort fields for `MRange`.
    pub sort_offs: Vec<u16>,
    /// Descending scan direction.
    pub desc: bool,
    /// Time window from timestamp conjuncts.
    pub since: Time,
    /// Time window from timestamp conjuncts.
    pub until: Time,
}

/// Vertex-row assembly parameters.
pub struct VRowPlan {
    /// The vertex type being read.
    pub role: RoleId,
    /// Declared properties in slot order: id, type, name.
    pub props: Vec<(Key, ValueType, String)>,
    /// Filter over the synthetic row (slot offsets).
    pub filter: Option<Filter>,
}

/// The payload of one plan node.
pub enum Load {
    /// Summary: expected column count.
    Summary(usize),
    /// A reader descriptor.
    Reader(ReaderPlan),
    /// A record filter.
    Filter(Filter),
    /// Grouping fields.
    Grouping(Vec<FieldSpec>),
    /// Aggregates.
    Aggregates(Vec<FunSpec>),
    /// Ordering fields.
    Ordering(Vec<(FieldSpec, SortOrd)>),
    /// Projection columns.
    Projection(Vec<ProjSpec>),
}

/// One node of the linear plan.
pub struct PlanNode {
    /// What the node does.
    pub ntype: NodeType,
    /// Reader subtype, where applicable.
    pub stype: Option<ReaderType>,
    /// A generic number (column count, key length).
    pub helper: i64,
    /// Name of the involved object.
    pub name: String,
    /// The payload.
    pub load: Load,
}

/// An executable plan: nodes in execution order (readers first),
/// plus the target description.
pub struct Plan {
    /// The nodes, leaves first.
    pub nodes: Vec<PlanNode>,
    /// What the target store holds.
    pub content: Content,
    /// Vertex-row assembly, for vertex targets.
    pub vrow: Option<VRowPlan>,
}

impl Plan {
    fn node(&self, ntype: NodeType) -> Option<&PlanNode> {
        self.nodes.iter().find(|n| n.ntype == ntype)
    }

    /// The reader node payload.
    pub fn reader(&self) -> Result<&ReaderPlan> {
        match self.node(NodeType::Reader).map(|n| &n.load) {
            Some(Load::Reader(r)) => Ok(r),
            _ => Err(Error::new(ErrorKind::Invalid, OBJECT, "plan has no reader")),
        }
    }

    /// The record filter, if any.
    pub fn filter(&self) -> Option<&Filter> {
        match self.node(NodeType::Filter).map(|n| &n.load) {
            Some(Load::Filter(f)) => Some(f),
            _ => None,
        }
    }

    /// Grouping fields, if any.
    pub fn grouping(&self) -> &[FieldSpec] {
        match self.node(NodeType::Grouping).map(|n| &n.load) {
            Some(Load::Grouping(g)) => g,
            _ => &[],
        }
    }

    /// Aggregates, if any.
    pub fn aggregates(&self) -> &[FunSpec] {
        match self.node(NodeType::Aggregates).map(|n| &n.load) {
            Some(Load::Aggregates(a)) => a,
            _ => &[],
        }
    }

    /// The projection columns.
    pub fn projection(&self) -> Result<&[ProjSpec]> {
        match self.node(NodeType::Projection).map(|n| &n.load) {
            Some(Load::Projection(p)) => Ok(p),
            _ => Err(Error::new(ErrorKind::Invalid, OBJECT, "plan has no projection")),
        }
    }

    /// A human-readable dump of the plan.
    pub fn show(&self) -> String {
        use std::fmt::Write as _;
        let mut out = String::new();
        for n in &self.nodes {
            let _ = write!(out, "{:?}", n.ntype);
            if let Some(st) = n.stype {
                let _ = write!(out, "/{st:?}");
            }
            if !n.name.is_empty() {
                let _ = write!(out, " {}", n.name);
            }
            let _ = writeln!(out, " [{}]", n.helper);
        }
        out
    }
}

/// The resolved query target.
pub enum PlanTarget {
    /// An edge context.
    Edge {
        /// The context's store.
        store: Arc<Store>,
        /// The declared edge type, when the model knows one.
        etype: Option<Arc<EdgeType>>,
    },
    /// A vertex type over the scope's vertex store.
    Vertex {
        /// The vertex store.
        store: Arc<Store>,
        /// The declared vertex type.
        vtype: Arc<VertexType>,
    },
}

/// Builds the plan for a `SELECT` over a resolved target.
pub fn from_ast(
    sel: &SelectStmt,
    target: PlanTarget,
    text: Option<&Arc<TextDict>>,
) -> Result<Plan> {
    match target {
        PlanTarget::Edge { store, etype } => plan_edge(sel, store, etype.as_deref(), text),
        PlanTarget::Vertex { store, vtype } => plan_vertex(sel, store, &vtype, text),
    }
}

fn lit_value(lit: &Lit, typ: ValueType, text: Option<&Arc<TextDict>>) -> Result<Value> {
    Ok(match (lit, typ) {
        (Lit::UInt(u), ValueType::UInt) => Value::UInt(*u),
        (Lit::UInt(u), ValueType::Int) => Value::Int(*u as i64),
        (Lit::UInt(u), ValueType::Float) => Value::Float(*u as f64),
        (Lit::UInt(u), ValueType::Time) => Value::Time(*u as i64),
        (Lit::UInt(u), ValueType::Date) => Value::Date(*u as i64),
        (Lit::Int(i), ValueType::Int) => Value::Int(*i),
        (Lit::Int(i), ValueType::Float) => Value::Float(*i as f64),
        (Lit::Int(i), ValueType::Time) => Value::Time(*i),
        (Lit::Int(i), ValueType::Date) => Value::Date(*i),
        (Lit::Float(f), ValueType::Float) => Value::Float(*f),
        (Lit::Bool(b), ValueType::Bool) => Value::Bool(*b),
        (Lit::Str(s), ValueType::Time | ValueType::Date) => {
            let t = crate::time::from_string(s)?;
            if typ == ValueType::Date {
                Value::Date(t)
            } else {
                Value::Time(t)
            }
        }
        (Lit::Str(s), ValueType::Text) => match text {
            Some(dict) => Value::TextKey(dict.get_key(s)?),
            None => {
                return Err(Error::new(ErrorKind::Invalid, OBJECT, "no text dictionary"))
            }
        },
        // untyped weights take the literal at face value
        (Lit::UInt(u), ValueType::Nothing) => Value::UInt(*u),
        (Lit::Int(i), ValueType::Nothing) => Value::Int(*i),
        (Lit::Float(f), ValueType::Nothing) => Value::Float(*f),
        (l, t) => {
            return Err(Error::new(
                ErrorKind::Invalid,
                OBJECT,
                format!("literal {l:?} does not fit type {t:?}"),
            ))
        }
    })
}

// ---------------------------------------------------------------
// edge planning
// ---------------------------------------------------------------

fn edge_field(name: &str, etype: Option<&EdgeType>) -> Result<FieldSpec> {
    let off = crate::types::edge_off_by_name(name)?;
    let typ = match off {
        edge_off::TIMESTAMP => ValueType::Time,
        edge_off::WEIGHT => etype.map(|e| e.wtype[0]).unwrap_or(ValueType::Nothing),
        edge_off::WEIGHT2 => etype.map(|e| e.wtype[1]).unwrap_or(ValueType::Nothing),
        _ => ValueType::UInt,
    };
    Ok(FieldSpec {
        name: name.to_owned(),
        off,
        size: size_by_off(EDGE_SIZE as u32, off),
        typ,
    })
}

fn edge_filter(
    cond: &Cond,
    etype: Option<&EdgeType>,
    text: Option<&Arc<TextDict>>,
) -> Result<Filter> {
    Ok(match cond {
        Cond::And(l, r) => Filter::And(
            Box::new(edge_filter(l, etype, text)?),
            Box::new(edge_filter(r, etype, text)?),
        ),
        Cond::Or(l, r) => Filter::Or(
            Box::new(edge_filter(l, etype, text)?),
            Box::new(edge_filter(r, etype, text)?),
        ),
        Cond::Not(k) => Filter::Not(Box::new(edge_filter(k, etype, text)?)),
        Cond::Cmp { op, field, value } => {
            let f = edge_field(field, etype)?;
            let val = lit_value(value, f.typ, text)?;
            let typ = if f.typ == ValueType::Nothing {
                val.vtype()
            } else {
                f.typ
            };
            Filter::Cmp {
                op: *op,
                off: f.off,
                size: f.size,
                typ,
                val,
            }
        }
    })
}

/// The window `[since, until]` implied by timestamp conjuncts.
fn time_window(cond: Option<&Cond>) -> (Time, Time) {
    let mut since = Time::MIN;
    let mut until = Time::MAX;
    let Some(cond) = cond else {
        return (since, until);
    };
    for (field, op, lit) in cond.range_conjuncts() {
        if !matches!(field, "timestamp" | "stamp") {
            continue;
        }
        let t = match lit {
            Lit::UInt(u) => *u as i64,
            Lit::Int(i) => *i,
            Lit::Str(s) => match crate::time::from_string(s) {
                Ok(t) => t,
                Err(_) => continue,
            },
            _ => continue,
        };
        match op {
            CmpOp::Ge | CmpOp::Gt => since = since.max(t),
            CmpOp::Le | CmpOp::Lt => until = until.min(t),
            _ => {}
        }
    }
    for (field, lit) in cond.equality_conjuncts() {
        if !matches!(field, "timestamp" | "stamp") {
            continue;
        }
        if let Lit::UInt(u) = lit {
            since = since.max(*u as i64);
            until = until.min(*u as i64);
        }
    }
    (since, until)
}

struct IndexChoice {
    desc: Arc<IndexDesc>,
    prefix: usize,
    values: Vec<u64>,
}

/// Matches the constant-equality prefix of each index against the
/// filter; longest prefix wins.
fn choose_index(
    store: &Store,
    cond: Option<&Cond>,
    etype: Option<&EdgeType>,
    text: Option<&Arc<TextDict>>,
) -> Result<Option<IndexChoice>> {
    let Some(cond) = cond else { return Ok(None) };
    let eqs = cond.equality_conjuncts();
    if eqs.is_empty() {
        return Ok(None);
    }
    // resolve names to offsets with their raw bit patterns
    let mut by_off: Vec<(u16, u64)> = Vec::new();
    for (name, lit) in &eqs {
        let Ok(f) = edge_field(name, etype) else {
            continue;
        };
        let val = lit_value(lit, f.typ, text)?;
        by_off.push((f.off, val.to_bits()));
    }
    let mut best: Option<IndexChoice> = None;
    for desc in store.indices() {
        let mut values = Vec::new();
        for &off in &desc.keys.offs {
            match by_off.iter().find(|(o, _)| *o == off) {
                Some((_, bits)) => values.push(*bits),
                None => break,
            }
        }
        let prefix = values.len();
        if prefix == 0 {
            continue;
        }
        let better = match &best {
            None => true,
            Some(b) => prefix > b.prefix,
        };
        if better {
            best = Some(IndexChoice {
                desc,
                prefix,
                values,
            });
        }
    }
    Ok(best)
}

/// An index whose leading keys match the requested ordering fields.
fn ordering_index(store: &Store, offs: &[u16]) -> Option<Arc<IndexDesc>> {
    if offs.is_empty() {
        return None;
    }
    store
        .indices()
        .into_iter()
        .find(|d| d.keys.offs.len() >= offs.len() && d.keys.offs[..offs.len()] == *offs)
}

fn plan_edge(
    sel: &SelectStmt,
    store: Arc<Store>,
    etype: Option<&EdgeType>,
    text: Option<&Arc<TextDict>>,
) -> Result<Plan> {
    // projection resolution, aggregates split off
    let mut projection = Vec::new();
    let mut aggs: Vec<FunSpec> = Vec::new();
    for item in &sel.projection {
        match item {
            ProjExpr::Field(name) if name == "*" => {
                for f in ["origin", "destin", "timestamp", "weight", "weight2"] {
                    projection.push(ProjSpec::Field(edge_field(f, etype)?));
                }
            }
            ProjExpr::Field(name) => projection.push(ProjSpec::Field(edge_field(name, etype)?)),
            ProjExpr::Agg { fun, arg } => {
                let field = arg.as_deref().map(|a| edge_field(a, etype)).transpose()?;
                projection.push(ProjSpec::Agg {
                    slot: aggs.len(),
                    name: format!("{fun:?}").to_lowercase(),
                });
                aggs.push(FunSpec { fun: *fun, field });
            }
        }
    }

    let grouping = sel
        .group_by
        .iter()
        .map(|g| edge_field(g, etype))
        .collect::<Result<Vec<_>>>()?;
    // every group-by field must be projected or aggregated over
    for g in &grouping {
        if !projection.iter().any(|p| matches!(p, ProjSpec::Field(f) if f.off == g.off)) {
            return Err(Error::new(
                ErrorKind::Invalid,
                OBJECT,
                format!("group field '{}' is not projected", g.name),
            ));
        }
    }
    if !aggs.is_empty() && grouping.is_empty() {
        // plain aggregation: no field projections allowed
        if projection.iter().any(|p| matches!(p, ProjSpec::Field(_))) {
            return Err(Error::new(
                ErrorKind::Invalid,
                OBJECT,
                "fields and aggregates mix only under GROUP BY",
            ));
        }
    }

    let ordering = sel
        .order_by
        .iter()
        .map(|(f, o)| Ok((edge_field(f, etype)?, *o)))
        .collect::<Result<Vec<_>>>()?;

    let filter = sel
        .filter
        .as_ref()
        .map(|c| edge_filter(c, etype, text))
        .transpose()?;
    let (since, until) = time_window(sel.filter.as_ref());

    // reader selection
    let count_all = aggs.len() == 1
        && aggs[0].fun == AggFun::Count
        && sel.filter.is_none()
        && grouping.is_empty()
        && projection.len() == 1;

    let desc_order = matches!(ordering.first(), Some((_, SortOrd::Desc)));
    let order_offs: Vec<u16> = grouping
        .iter()
        .map(|f| f.off)
        .chain(ordering.iter().map(|(f, _)| f.off))
        .collect();

    let reader = if count_all {
        ReaderPlan {
            rtype: ReaderType::CountAll,
            store: store.clone(),
            plus: true,
            index: None,
            key: None,
            lo: None,
            hi: None,
            sort_offs: Vec::new(),
            desc: false,
            since,
            until,
        }
    } else if let Some(choice) = choose_index(&store, sel.filter.as_ref(), etype, text)? {
        let recsize = store.recsize();
        let encoded = choice.desc.keys.encode_values(&choice.values, recsize);
        if choice.prefix == choice.desc.keys.offs.len() {
            ReaderPlan {
                rtype: ReaderType::Search,
                store: store.clone(),
                plus: true,
                index: Some(choice.desc),
                key: Some(encoded),
                lo: None,
                hi: None,
                sort_offs: Vec::new(),
                desc: false,
                since,
                until,
            }
        } else {
            ReaderPlan {
                rtype: ReaderType::FRange,
                store: store.clone(),
                plus: true,
                index: Some(choice.desc),
                key: None,
                lo: Some(encoded.clone()),
                hi: Some(encoded),
                sort_offs: Vec::new(),
                desc: false,
                since,
                until,
            }
        }
    } else if let Some(desc) = ordering_index(&store, &order_offs) {
        ReaderPlan {
            rtype: ReaderType::FRange,
            store: store.clone(),
            plus: true,
            index: Some(desc),
            key: None,
            lo: None,
            hi: None,
            sort_offs: Vec::new(),
            desc: desc_order,
            since,
            until,
        }
    } else if !order_offs.is_empty() {
        ReaderPlan {
            rtype: ReaderType::MRange,
            store: store.clone(),
            plus: true,
            index: None,
            key: None,
            lo: None,
            hi: None,
            sort_offs: order_offs,
            desc: desc_order,
            since,
            until,
        }
    } else {
        ReaderPlan {
            rtype: ReaderType::FullScan,
            store: store.clone(),
            plus: true,
            index: None,
            key: None,
            lo: None,
            hi: None,
            sort_offs: Vec::new(),
            desc: false,
            since,
            until,
        }
    };

    let mut nodes = Vec::new();
    let ncols = projection.len();
    let rtype = reader.rtype;
    nodes.push(PlanNode {
        ntype: NodeType::Reader,
        stype: Some(rtype),
        helper: reader.key.as_ref().map(|k| k.len() as i64).unwrap_or(0),
        name: store.name().to_owned(),
        load: Load::Reader(reader),
    });
    if let Some(f) = filter {
        nodes.push(PlanNode {
            ntype: NodeType::Filter,
            stype: None,
            helper: 0,
            name: String::new(),
            load: Load::Filter(f),
        });
    }
    if !grouping.is_empty() {
        nodes.push(PlanNode {
            ntype: NodeType::Grouping,
            stype: None,
            helper: grouping.len() as i64,
            name: String::new(),
            load: Load::Grouping(grouping),
        });
    }
    if !aggs.is_empty() {
        nodes.push(PlanNode {
            ntype: NodeType::Aggregates,
            stype: None,
            helper: aggs.len() as i64,
            name: String::new(),
            load: Load::Aggregates(aggs),
        });
    }
    if !ordering.is_empty() {
        nodes.push(PlanNode {
            ntype: NodeType::Ordering,
            stype: None,
            helper: ordering.len() as i64,
            name: String::new(),
            load: Load::Ordering(ordering),
        });
    }
    nodes.push(PlanNode {
        ntype: NodeType::Projection,
        stype: None,
        helper: ncols as i64,
        name: String::new(),
        load: Load::Projection(projection),
    });
    nodes.push(PlanNode {
        ntype: NodeType::Summary,
        stype: None,
        helper: ncols as i64,
        name: String::new(),
        load: Load::Summary(ncols),
    });

    Ok(Plan {
        nodes,
        content: Content::Edge,
        vrow: None,
    })
}

// ---------------------------------------------------------------
// vertex planning
// ---------------------------------------------------------------

fn plan_vertex(
    sel: &SelectStmt,
    store: Arc<Store>,
    vtype: &VertexType,
    text: Option<&Arc<TextDict>>,
) -> Result<Plan> {
    if !sel.group_by.is_empty() || !sel.order_by.is_empty() {
        return Err(Error::new(
            ErrorKind::NotSupp,
            OBJECT,
            "grouping and ordering over vertex types",
        ));
    }

    // declared properties in first-reference order
    let mut props: Vec<(Key, ValueType, String)> = Vec::new();

    let mut projection = Vec::new();
    let mut aggs: Vec<FunSpec> = Vec::new();
    for item in &sel.projection {
        match item {
            ProjExpr::Field(name) if name == "*" => {
                projection.push(ProjSpec::VertexId);
                for p in &vtype.props {
                    let slot = declare(&mut props, vtype, &p.name)?.unwrap_or_default();
                    projection.push(ProjSpec::Field(FieldSpec {
                        name: p.name.clone(),
                        off: (slot * 8) as u16,
                        size: 8,
                        typ: p.vtype,
                    }));
                }
            }
            ProjExpr::Field(name) => match declare(&mut props, vtype, name)? {
                None => projection.push(ProjSpec::VertexId),
                Some(slot) => {
                    let (_, typ, pname) = props[slot].clone();
                    projection.push(ProjSpec::Field(FieldSpec {
                        name: pname,
                        off: (slot * 8) as u16,
                        size: 8,
                        typ,
                    }));
                }
            },
            ProjExpr::Agg { fun, arg } => {
                let field = match arg.as_deref() {
                    None => None,
                    Some(a) => match declare(&mut props, vtype, a)? {
                        None => None,
                        Some(slot) => {
                            let (_, typ, pname) = props[slot].clone();
                            Some(FieldSpec {
                                name: pname,
                                off: (slot * 8) as u16,
                                size: 8,
                                typ,
                            })
                        }
                    },
                };
                projection.push(ProjSpec::Agg {
                    slot: aggs.len(),
                    name: format!("{fun:?}").to_lowercase(),
                });
                aggs.push(FunSpec { fun: *fun, field });
            }
        }
    }

    // the filter runs over the synthetic row, so its properties must
    // be declared too
    let filter = sel
        .filter
        .as_ref()
        .map(|c| vertex_filter(c, vtype, &mut props, text))
        .transpose()?;

    if !aggs.is_empty() && projection.iter().any(|p| !matches!(p, ProjSpec::Agg { .. })) {
        return Err(Error::new(
            ErrorKind::Invalid,
            OBJECT,
            "fields and aggregates mix only under GROUP BY",
        ));
    }

    // a query touching no property (count(*), vid only) still needs
    // one declared property for rows to complete: the primary key,
    // or the first declared property
    if props.is_empty() {
        let p = vtype
            .props
            .iter()
            .find(|p| p.pk)
            .or_else(|| vtype.props.first())
            .ok_or_else(|| {
                Error::new(ErrorKind::Invalid, OBJECT, "vertex type has no properties")
            })?;
        props.push((p.id, p.vtype, p.name.clone()));
    }

    let reader = ReaderPlan {
        rtype: ReaderType::FullScan,
        store: store.clone(),
        plus: true,
        index: None,
        key: None,
        lo: None,
        hi: None,
        sort_offs: Vec::new(),
        desc: false,
        since: Time::MIN,
        until: Time::MAX,
    };

    let ncols = projection.len();
    let mut nodes = vec![PlanNode {
        ntype: NodeType::Reader,
        stype: Some(ReaderType::FullScan),
        helper: 0,
        name: store.name().to_owned(),
        load: Load::Reader(reader),
    }];
    if !aggs.is_empty() {
        nodes.push(PlanNode {
            ntype: NodeType::Aggregates,
            stype: None,
            helper: aggs.len() as i64,
            name: String::new(),
            load: Load::Aggregates(aggs),
        });
    }
    nodes.push(PlanNode {
        ntype: NodeType::Projection,
        stype: None,
        helper: ncols as i64,
        name: String::new(),
        load: Load::Projection(projection),
    });
    nodes.push(PlanNode {
        ntype: NodeType::Summary,
        stype: None,
        helper: ncols as i64,
        name: String::new(),
        load: Load::Summary(ncols),
    });

    Ok(Plan {
        nodes,
        content: Content::Vertex,
        vrow: Some(VRowPlan {
            role: vtype.id,
            props,
            filter,
        }),
    })
}

/// Assigns (or finds) the vrow slot of a property; `None` for the
/// vertex id itself.
fn declare(
    props: &mut Vec<(Key, ValueType, String)>,
    vtype: &VertexType,
    name: &str,
) -> Result<Option<usize>> {
    if matches!(name, "vertex" | "vid") {
        return Ok(None);
    }
    let p = vtype
        .prop(name)
        .ok_or_else(|| Error::new(ErrorKind::KeyNotFound, OBJECT, name))?;
    if let Some(i) = props.iter().position(|(id, _, _)| *id == p.id) {
        return Ok(Some(i));
    }
    props.push((p.id, p.vtype, p.name.clone()));
    Ok(Some(props.len() - 1))
}

fn vertex_filter(
    cond: &Cond,
    vtype: &VertexType,
    props: &mut Vec<(Key, ValueType, String)>,
    text: Option<&Arc<TextDict>>,
) -> Result<Filter> {
    Ok(match cond {
        Cond::And(l, r) => Filter::And(
            Box::new(vertex_filter(l, vtype, props, text)?),
            Box::new(vertex_filter(r, vtype, props, text)?),
        ),
        Cond::Or(l, r) => Filter::Or(
            Box::new(vertex_filter(l, vtype, props, text)?),
            Box::new(vertex_filter(r, vtype, props, text)?),
        ),
        Cond::Not(k) => Filter::Not(Box::new(vertex_filter(k, vtype, props, text)?)),
        Cond::Cmp { op, field, value } => {
            let slot = declare(props, vtype, field)?.ok_or_else(|| {
                Error::new(ErrorKind::NotSupp, OBJECT, "filter on the vertex id")
            })?;
            let p = vtype
                .prop(field)
                .ok_or_else(|| Error::new(ErrorKind::KeyNotFound, OBJECT, field.as_str()))?;
            let val = lit_value(value, p.vtype, text)?;
            Filter::Cmp {
                op: *op,
                off: (slot * 8) as u16,
                size: 8,
                typ: p.vtype,
                val,
            }
        }
    })
}
