//! The cursor: executes a plan and emits result rows.

use std::sync::Arc;

use crate::error::{Error, ErrorKind, Result};
use crate::fun::{Fun, Group};
use crate::mem::BlockList;
use crate::query::plan::{FieldSpec, Load, Plan, ProjSpec, ReaderPlan, ReaderType};
use crate::sql::ast::AggFun;
use crate::query::row;
use crate::reader::{BufIdx, FRange, Filter, FullScan, Merge, Reader, Search, VRow};
use crate::sort::{Compare, KeyCmp};
use crate::text::TextDict;
use crate::types::{
    edge_off, field_bits, is_null_rec, Content, Value, ValueType, Vertex, PAGE_SIZE,
};

const OBJECT: &str = "cursor";

/// Block size of aggregate value buffers.
const FUN_BLOCK: usize = 4096;

/// Executes one plan: a reader tree, an optional filter, optional
/// vertex-row assembly, optional aggregation and a projection.
///
/// `fetch` fills a caller buffer with whole rows in the client row
/// format; a row that does not fit is carried into the next fetch.
pub struct Cursor {
    reader: Option<Box<dyn Reader>>,
    countall: Option<u64>,
    filter: Option<Filter>,
    grouping: Vec<FieldSpec>,
    group: Option<Group>,
    aggs: Vec<AggFun>,
    mapped: u64,
    projection: Vec<ProjSpec>,
    vrow: Option<VRow>,
    text: Option<Arc<TextDict>>,
    content: Content,
    recsize: usize,

    page: Vec<u8>,
    slot: usize,
    have_page: bool,
    eof: bool,
    finalized: bool,
    leftover: Vec<u8>,

    cur_key: Option<Vec<u8>>,
    group_rec: Vec<u8>,
}

impl Cursor {
    /// Opens a cursor over a plan.
    pub fn open(plan: Plan, text: Option<Arc<TextDict>>) -> Result<Cursor> {
        let mut plan = plan;
        let rp = plan.reader()?;
        let recsize = rp.store.recsize() as usize;

        let mut countall = None;
        let reader: Option<Box<dyn Reader>> = match rp.rtype {
            ReaderType::CountAll => {
                let mut n: u64 = 0;
                for f in rp.store.get_readers(rp.since, rp.until)? {
                    n += f.nrecs() as u64;
                }
                for f in rp.store.get_pending(rp.since, rp.until)? {
                    n += f.nrecs() as u64;
                }
                countall = Some(n);
                None
            }
            _ => Some(build_reader(rp)?),
        };

        let group = build_group(&plan)?;
        let filter = plan
            .nodes
            .iter()
            .find_map(|n| match &n.load {
                Load::Filter(f) => Some(f.clone()),
                _ => None,
            });
        let grouping = plan.grouping().to_vec();
        let aggs: Vec<AggFun> = plan.aggregates().iter().map(|a| a.fun).collect();
        let projection = plan.projection()?.to_vec();
        let content = plan.content;

        let vrow = plan.vrow.take().map(|vp| {
            VRow::new(
                vp.role,
                vp.props.iter().map(|(id, t, _)| (*id, *t)).collect(),
                vp.filter,
            )
        });

        Ok(Cursor {
            reader,
            countall,
            filter,
            grouping,
            group,
            aggs,
            mapped: 0,
            projection,
            vrow,
            text,
            content,
            recsize,
            page: vec![0u8; PAGE_SIZE],
            slot: 0,
            have_page: false,
            eof: false,
            finalized: false,
            leftover: Vec::new(),
            cur_key: None,
            group_rec: Vec::new(),
        })
    }

    /// Fills `buf` with whole rows.
    ///
    /// Returns the bytes used and the row count. Rows never split
    /// across fetch boundaries; a row that does not fit is truncated
    /// from this fetch and resumed by the next one. Fails with `Eof`
    /// once all rows are consumed and with `TooBig` when the buffer
    /// cannot hold even one row.
    pub fn fetch(&mut self, buf: &mut [u8]) -> Result<(usize, usize)> {
        let mut used = 0usize;
        let mut count = 0usize;

        if !self.leftover.is_empty() {
            if self.leftover.len() > buf.len() {
                return Err(Error::new(ErrorKind::TooBig, OBJECT, "row exceeds buffer"));
            }
            buf[..self.leftover.len()].copy_from_slice(&self.leftover);
            used = self.leftover.len();
            count = 1;
            self.leftover.clear();
        } else if self.eof {
            return Err(Error::new(ErrorKind::Eof, OBJECT, ""));
        }

        while !self.eof {
            let Some(rowbuf) = self.next_row()? else {
                break;
            };
            if used + rowbuf.len() <= buf.len() {
                buf[used..used + rowbuf.len()].copy_from_slice(&rowbuf);
                used += rowbuf.len();
                count += 1;
            } else {
                if used == 0 {
                    return Err(Error::new(ErrorKind::TooBig, OBJECT, "row exceeds buffer"));
                }
                self.leftover = rowbuf;
                break;
            }
        }
        if used == 0 && count == 0 {
            return Err(Error::new(ErrorKind::Eof, OBJECT, ""));
        }
        Ok((used, count))
    }

    /// Produces the next result row, or `None` at stream end.
    fn next_row(&mut self) -> Result<Option<Vec<u8>>> {
        if let Some(n) = self.countall.take() {
            self.eof = true;
            let mut rowbuf = Vec::new();
            row::add_value(&mut rowbuf, &Value::UInt(n))?;
            return Ok(Some(rowbuf));
        }

        loop {
            // completed vertex rows drain first
            if let Some(vrow) = &mut self.vrow {
                if let Some((vid, vr)) = vrow.eval() {
                    match &mut self.group {
                        Some(g) => {
                            g.map(Content::Vertex, &vr)?;
                            self.mapped += 1;
                            continue;
                        }
                        None => return self.project_vertex(vid, &vr).map(Some),
                    }
                }
            }

            let Some(rec) = self.next_record()? else {
                return self.finalize();
            };

            match self.content {
                Content::Vertex => {
                    let v = Vertex::from_bytes(&rec);
                    if let Some(vrow) = &mut self.vrow {
                        vrow.add(&v)?;
                    }
                }
                Content::Edge => {
                    if let Some(f) = &self.filter {
                        if !f.eval(&rec) {
                            continue;
                        }
                    }
                    if let Some(row) = self.consume_edge(&rec)? {
                        return Ok(Some(row));
                    }
                }
            }
        }
    }

    /// Feeds one edge record into grouping/aggregation, or projects
    /// it directly.
    fn consume_edge(&mut self, rec: &[u8]) -> Result<Option<Vec<u8>>> {
        if self.group.is_some() {
            if self.grouping.is_empty() {
                let g = self.group.as_mut().ok_or_else(group_gone)?;
                g.map(Content::Edge, rec)?;
                self.mapped += 1;
                return Ok(None);
            }
            let key = self.group_key(rec);
            let switched = match &self.cur_key {
                Some(k) => *k != key,
                None => false,
            };
            let mut out = None;
            if switched {
                out = Some(self.emit_group()?);
            }
            if self.cur_key.is_none() || switched {
                self.cur_key = Some(key);
                self.group_rec = rec.to_vec();
            }
            let g = self.group.as_mut().ok_or_else(group_gone)?;
            g.map(Content::Edge, rec)?;
            self.mapped += 1;
            return Ok(out);
        }
        self.project_edge(rec).map(Some)
    }

    /// The tail emission at stream end.
    fn finalize(&mut self) -> Result<Option<Vec<u8>>> {
        if self.finalized {
            self.eof = true;
            return Ok(None);
        }
        // flush partial vertex rows, then keep draining
        if let Some(vrow) = &mut self.vrow {
            vrow.force();
            if let Some((vid, vr)) = vrow.eval() {
                match &mut self.group {
                    Some(g) => {
                        g.map(Content::Vertex, &vr)?;
                        self.mapped += 1;
                    }
                    None => return self.project_vertex(vid, &vr).map(Some),
                }
                // fall through to drain the rest on later calls
                return self.finalize_drain();
            }
        }
        self.finalized = true;
        if self.group.is_some() {
            if !self.grouping.is_empty() {
                if self.cur_key.is_some() {
                    let row = self.emit_group()?;
                    self.eof = true;
                    return Ok(Some(row));
                }
            } else {
                self.eof = true;
                if self.mapped == 0 && !self.count_only() {
                    return Ok(None);
                }
                let g = self.group.as_mut().ok_or_else(group_gone)?;
                g.reduce()?;
                return self.project_group_row(None).map(Some);
            }
        }
        self.eof = true;
        Ok(None)
    }

    fn finalize_drain(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            let Some(vrow) = &mut self.vrow else { break };
            let Some((vid, vr)) = vrow.eval() else { break };
            match &mut self.group {
                Some(g) => {
                    g.map(Content::Vertex, &vr)?;
                    self.mapped += 1;
                }
                None => return self.project_vertex(vid, &vr).map(Some),
            }
        }
        self.finalized = true;
        if self.group.is_some() {
            self.eof = true;
            if self.mapped == 0 && !self.count_only() {
                return Ok(None);
            }
            let g = self.group.as_mut().ok_or_else(group_gone)?;
            g.reduce()?;
            return self.project_group_row(None).map(Some);
        }
        self.eof = true;
        Ok(None)
    }

    /// Counting produces a row even over empty input; every other
    /// aggregate has nothing to report then.
    fn count_only(&self) -> bool {
        !self.aggs.is_empty() && self.aggs.iter().all(|f| *f == AggFun::Count)
    }

    /// Reduces the current group and projects its result row.
    fn emit_group(&mut self) -> Result<Vec<u8>> {
        let g = self.group.as_mut().ok_or_else(group_gone)?;
        g.reduce()?;
        let rec = std::mem::take(&mut self.group_rec);
        let rowbuf = self.project_group_row(Some(&rec))?;
        let g = self.group.as_mut().ok_or_else(group_gone)?;
        g.reset()?;
        Ok(rowbuf)
    }

    fn group_key(&self, rec: &[u8]) -> Vec<u8> {
        let mut key = Vec::with_capacity(self.grouping.len() * 8);
        for f in &self.grouping {
            key.extend_from_slice(&field_bits(rec, f.off, f.size).to_le_bytes());
        }
        key
    }

    /// The next non-null record of the reader stream.
    fn next_record(&mut self) -> Result<Option<Vec<u8>>> {
        let Some(reader) = &mut self.reader else {
            return Ok(None);
        };
        let rpp = PAGE_SIZE / self.recsize;
        loop {
            if !self.have_page {
                match reader.move_next() {
                    Ok(()) => {
                        self.page.copy_from_slice(reader.page());
                        self.slot = 0;
                        self.have_page = true;
                    }
                    Err(e) if e.kind() == ErrorKind::Eof => return Ok(None),
                    Err(e) => return Err(e),
                }
            }
            while self.slot < rpp {
                let s = self.slot;
                self.slot += 1;
                let rec = &self.page[s * self.recsize..(s + 1) * self.recsize];
                if !is_null_rec(rec) {
                    return Ok(Some(rec.to_vec()));
                }
            }
            self.have_page = false;
        }
    }

    fn resolve_text(&self, v: Value) -> Result<Value> {
        match (&v, &self.text) {
            (Value::TextKey(k), Some(dict)) => match dict.get_text(*k)? {
                Some(s) => Ok(Value::Text(s)),
                None => Ok(v),
            },
            _ => Ok(v),
        }
    }

    fn field_value(&self, rec: &[u8], f: &FieldSpec) -> Result<Value> {
        let typ = if f.typ == ValueType::Nothing {
            // untyped weights carry their tag in the record
            let tag_off = if f.off == edge_off::WEIGHT {
                edge_off::WTYPE
            } else {
                edge_off::WTYPE2
            };
            ValueType::from_u32(field_bits(rec, tag_off, 4) as u32)?
        } else {
            f.typ
        };
        let v = Value::from_bits(typ, field_bits(rec, f.off, f.size))?;
        self.resolve_text(v)
    }

    fn project_edge(&self, rec: &[u8]) -> Result<Vec<u8>> {
        let mut rowbuf = Vec::new();
        for p in &self.projection {
            match p {
                ProjSpec::Field(f) => row::add_value(&mut rowbuf, &self.field_value(rec, f)?)?,
                ProjSpec::Agg { .. } | ProjSpec::VertexId => {
                    return Err(Error::new(ErrorKind::Invalid, OBJECT, "bad projection"))
                }
            }
        }
        Ok(rowbuf)
    }

    fn project_vertex(&self, vid: u64, vr: &[u8]) -> Result<Vec<u8>> {
        let mut rowbuf = Vec::new();
        for p in &self.projection {
            match p {
                ProjSpec::VertexId => row::add_value(&mut rowbuf, &Value::UInt(vid))?,
                ProjSpec::Field(f) => {
                    let v = Value::from_bits(f.typ, field_bits(vr, f.off, f.size))?;
                    row::add_value(&mut rowbuf, &self.resolve_text(v)?)?;
                }
                ProjSpec::Agg { .. } => {
                    return Err(Error::new(ErrorKind::Invalid, OBJECT, "bad projection"))
                }
            }
        }
        Ok(rowbuf)
    }

    /// Projects a grouped result row: group fields from the
    /// representative record, aggregates from the result slots.
    fn project_group_row(&self, rec: Option<&[u8]>) -> Result<Vec<u8>> {
        let mut rowbuf = Vec::new();
        for p in &self.projection {
            match p {
                ProjSpec::Field(f) => {
                    let rec = rec.ok_or_else(|| {
                        Error::new(ErrorKind::Invalid, OBJECT, "no group record")
                    })?;
                    row::add_value(&mut rowbuf, &self.field_value(rec, f)?)?;
                }
                ProjSpec::Agg { slot, .. } => {
                    let g = self
                        .group
                        .as_ref()
                        .ok_or_else(group_gone)?;
                    row::add_value(&mut rowbuf, &self.resolve_text(g.result(*slot)?)?)?;
                }
                ProjSpec::VertexId => {
                    return Err(Error::new(ErrorKind::Invalid, OBJECT, "bad projection"))
                }
            }
        }
        Ok(rowbuf)
    }
}

fn group_gone() -> Error {
    Error::new(ErrorKind::Panic, OBJECT, "group vanished")
}

/// Wires the reader tree of a plan: the chosen strategy over sorted
/// readers, merged with a bufidx over pending files when those hold
/// records.
fn build_reader(rp: &ReaderPlan) -> Result<Box<dyn Reader>> {
    let store = &rp.store;
    let ctx = store.comp_ctx();
    let recsize = store.recsize();
    let readers = store.get_readers(rp.since, rp.until)?;
    let pending = if rp.plus {
        store.get_pending(rp.since, rp.until)?
    } else {
        Vec::new()
    };

    match rp.rtype {
        ReaderType::FullScan => {
            let mut files = readers;
            files.extend(pending);
            Ok(Box::new(FullScan::new(files, ctx, recsize)))
        }
        ReaderType::MRange => {
            let mut files = readers;
            files.extend(pending);
            let cmp: Arc<dyn Compare> = if rp.desc {
                Arc::new(KeyCmp::desc(rp.sort_offs.clone(), recsize))
            } else {
                Arc::new(KeyCmp::asc(rp.sort_offs.clone(), recsize))
            };
            Ok(Box::new(BufIdx::new(files, ctx, cmp.as_ref(), recsize)?))
        }
        ReaderType::Search | ReaderType::FRange => {
            let desc = rp
                .index
                .clone()
                .ok_or_else(|| Error::new(ErrorKind::Invalid, OBJECT, "reader needs an index"))?;
            let base: Box<dyn Reader> = match rp.rtype {
                ReaderType::Search => {
                    let key = rp.key.as_ref().ok_or_else(|| {
                        Error::new(ErrorKind::Invalid, OBJECT, "search needs a key")
                    })?;
                    Box::new(Search::new(desc.clone(), key, readers, ctx.clone())?)
                }
                _ => Box::new(FRange::new(
                    desc.clone(),
                    rp.lo.as_deref(),
                    rp.hi.as_deref(),
                    rp.desc,
                    readers,
                    ctx.clone(),
                )?),
            };
            if pending.iter().any(|f| f.nrecs() > 0) {
                let cmp: Arc<dyn Compare> = if rp.desc {
                    Arc::new(KeyCmp::desc(desc.keys.offs.clone(), recsize))
                } else {
                    Arc::new(KeyCmp::asc(desc.keys.offs.clone(), recsize))
                };
                let buf: Box<dyn Reader> =
                    Box::new(BufIdx::new(pending, ctx, cmp.as_ref(), recsize)?);
                Ok(Box::new(Merge::new(vec![base, buf], cmp, recsize)))
            } else {
                Ok(base)
            }
        }
        ReaderType::CountAll => Err(Error::new(
            ErrorKind::Invalid,
            OBJECT,
            "countall has no reader",
        )),
    }
}

/// Builds the aggregate group of a plan.
fn build_group(plan: &Plan) -> Result<Option<Group>> {
    let specs = plan.aggregates();
    if specs.is_empty() {
        return Ok(None);
    }
    let flist = Arc::new(BlockList::new(FUN_BLOCK));
    let mut funs = Vec::with_capacity(specs.len());
    for spec in specs {
        let (off, size, dtype) = match &spec.field {
            Some(f) => {
                // untyped weights aggregate as floats
                let t = if f.typ == ValueType::Nothing {
                    ValueType::Float
                } else {
                    f.typ
                };
                (f.off, f.size, t)
            }
            None => (0, 8, ValueType::UInt),
        };
        funs.push(Fun::new(
            spec.fun,
            plan.content,
            off,
            size,
            dtype,
            flist.clone(),
        ));
    }
    Ok(Some(Group::new(funs)))
}
