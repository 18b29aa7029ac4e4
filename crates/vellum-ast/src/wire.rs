//! Binary wire codec for queries.
//!
//! Little-endian tag stream: query type, namespace, then tagged records
//! terminated by [`tag::END`]. Each joined or merged sub-query follows as
//! its own stream prefixed by a join-type byte. Two update-field
//! encodings are accepted on decode (the legacy one without flags and
//! the v2 one carrying an explicit `is_array` bit) while encode always
//! emits v2.

use smallvec::SmallVec;
use vellum_error::{Result, VellumError};
use vellum_types::cjson::{get_varint, put_varint, unzigzag, zigzag};
use vellum_types::{KeyString, Variant, VariantArray};

use crate::{
    AggType, AggregateEntry, BetweenFieldsEntry, CalcTotalMode, CondType, EntryNode, EntryTree,
    JoinEntry, JoinType, JoinedQuery, OpType, Query, QueryEntry, QueryType, SortEntry, StrictMode,
    UpdateEntry, UpdateMode,
};

/// Record tags of the wire stream.
pub mod tag {
    pub const CONDITION: u8 = 0;
    pub const SORT_INDEX: u8 = 1;
    pub const JOIN_ON: u8 = 2;
    pub const AGGREGATION: u8 = 3;
    pub const LIMIT: u8 = 4;
    pub const OFFSET: u8 = 5;
    pub const REQ_TOTAL: u8 = 6;
    pub const SELECT_FILTER: u8 = 7;
    pub const SELECT_FUNCTION: u8 = 8;
    pub const EQUAL_POSITION: u8 = 9;
    pub const EXPLAIN: u8 = 10;
    pub const STRICT_MODE: u8 = 11;
    pub const BETWEEN_FIELDS: u8 = 12;
    pub const ALWAYS_FALSE: u8 = 13;
    pub const OPEN_BRACKET: u8 = 14;
    pub const CLOSE_BRACKET: u8 = 15;
    pub const JOIN_CONDITION: u8 = 16;
    pub const DROP_FIELD: u8 = 17;
    pub const UPDATE_FIELD_V2: u8 = 18;
    pub const UPDATE_FIELD: u8 = 19;
    pub const UPDATE_OBJECT: u8 = 20;
    pub const WITH_RANK: u8 = 21;
    pub const DEBUG_LEVEL: u8 = 22;
    pub const END: u8 = 23;
}

// ---------------------------------------------------------------------------
// Primitive writers / readers
// ---------------------------------------------------------------------------

fn put_string(out: &mut Vec<u8>, s: &str) {
    put_varint(out, s.len() as u64);
    out.extend_from_slice(s.as_bytes());
}

fn get_string(buf: &[u8], pos: &mut usize) -> Result<String> {
    let len = get_varint(buf, pos)? as usize;
    let end = *pos + len;
    let bytes = buf
        .get(*pos..end)
        .ok_or_else(|| VellumError::parse_bin("truncated string"))?;
    *pos = end;
    String::from_utf8(bytes.to_vec()).map_err(|_| VellumError::parse_bin("invalid utf-8"))
}

fn get_u8(buf: &[u8], pos: &mut usize) -> Result<u8> {
    let b = *buf
        .get(*pos)
        .ok_or_else(|| VellumError::parse_bin("unexpected end of query stream"))?;
    *pos += 1;
    Ok(b)
}

fn put_variant(out: &mut Vec<u8>, v: &Variant) {
    match v {
        Variant::Null => out.push(0),
        Variant::Bool(b) => {
            out.push(1);
            out.push(u8::from(*b));
        }
        Variant::Int(i) => {
            out.push(2);
            put_varint(out, zigzag(i64::from(*i)));
        }
        Variant::Int64(i) => {
            out.push(3);
            put_varint(out, zigzag(*i));
        }
        Variant::Double(d) => {
            out.push(4);
            out.extend_from_slice(&d.to_le_bytes());
        }
        Variant::String(s) => {
            out.push(5);
            put_string(out, s);
        }
        Variant::Tuple(items) => {
            out.push(6);
            put_varint(out, items.len() as u64);
            for item in items {
                put_variant(out, item);
            }
        }
    }
}

fn get_variant(buf: &[u8], pos: &mut usize) -> Result<Variant> {
    Ok(match get_u8(buf, pos)? {
        0 => Variant::Null,
        1 => Variant::Bool(get_u8(buf, pos)? != 0),
        2 => {
            let raw = unzigzag(get_varint(buf, pos)?);
            Variant::Int(
                i32::try_from(raw).map_err(|_| VellumError::parse_bin("int out of range"))?,
            )
        }
        3 => Variant::Int64(unzigzag(get_varint(buf, pos)?)),
        4 => {
            let end = *pos + 8;
            let bytes: [u8; 8] = buf
                .get(*pos..end)
                .ok_or_else(|| VellumError::parse_bin("truncated double"))?
                .try_into()
                .expect("length checked");
            *pos = end;
            Variant::Double(f64::from_le_bytes(bytes))
        }
        5 => Variant::String(KeyString::from(get_string(buf, pos)?)),
        6 => {
            let count = get_varint(buf, pos)? as usize;
            let mut items = Vec::with_capacity(count.min(64));
            for _ in 0..count {
                items.push(get_variant(buf, pos)?);
            }
            Variant::Tuple(items)
        }
        kind => return Err(VellumError::parse_bin(format!("bad variant kind {kind}"))),
    })
}

fn put_values(out: &mut Vec<u8>, values: &VariantArray) {
    put_varint(out, values.len() as u64);
    for v in values {
        put_variant(out, v);
    }
}

fn get_values(buf: &[u8], pos: &mut usize) -> Result<VariantArray> {
    let count = get_varint(buf, pos)? as usize;
    let mut out = VariantArray::new();
    for _ in 0..count {
        out.push(get_variant(buf, pos)?);
    }
    Ok(out)
}

const fn op_code(op: OpType) -> u8 {
    match op {
        OpType::And => 0,
        OpType::Or => 1,
        OpType::Not => 2,
    }
}

fn op_from(code: u8) -> Result<OpType> {
    Ok(match code {
        0 => OpType::And,
        1 => OpType::Or,
        2 => OpType::Not,
        _ => return Err(VellumError::parse_bin(format!("bad op code {code}"))),
    })
}

const fn cond_code(cond: CondType) -> u8 {
    match cond {
        CondType::Any => 0,
        CondType::Eq => 1,
        CondType::Lt => 2,
        CondType::Le => 3,
        CondType::Gt => 4,
        CondType::Ge => 5,
        CondType::Range => 6,
        CondType::Set => 7,
        CondType::AllSet => 8,
        CondType::Empty => 9,
        CondType::Like => 10,
        CondType::DWithin => 11,
    }
}

fn cond_from(code: u8) -> Result<CondType> {
    Ok(match code {
        0 => CondType::Any,
        1 => CondType::Eq,
        2 => CondType::Lt,
        3 => CondType::Le,
        4 => CondType::Gt,
        5 => CondType::Ge,
        6 => CondType::Range,
        7 => CondType::Set,
        8 => CondType::AllSet,
        9 => CondType::Empty,
        10 => CondType::Like,
        11 => CondType::DWithin,
        _ => return Err(VellumError::parse_bin(format!("bad condition code {code}"))),
    })
}

// ---------------------------------------------------------------------------
// Serializer
// ---------------------------------------------------------------------------

/// Serialize a query (with its joins and merges) to the wire format.
#[must_use]
pub fn serialize(q: &Query) -> Vec<u8> {
    let mut out = Vec::with_capacity(128);
    serialize_body(q, &mut out);
    for jq in &q.joins {
        out.push(join_type_code(jq.join_type));
        serialize_joined(jq, &mut out);
    }
    for mq in &q.merges {
        out.push(join_type_code(JoinType::Merge));
        serialize_joined(mq, &mut out);
    }
    out
}

const fn join_type_code(jt: JoinType) -> u8 {
    match jt {
        JoinType::LeftJoin => 0,
        JoinType::InnerJoin => 1,
        JoinType::OrInnerJoin => 2,
        JoinType::Merge => 3,
    }
}

fn join_type_from(code: u8) -> Result<JoinType> {
    Ok(match code {
        0 => JoinType::LeftJoin,
        1 => JoinType::InnerJoin,
        2 => JoinType::OrInnerJoin,
        3 => JoinType::Merge,
        _ => return Err(VellumError::parse_bin(format!("bad join type {code}"))),
    })
}

fn serialize_joined(jq: &JoinedQuery, out: &mut Vec<u8>) {
    serialize_body(&jq.query, out);
    // ON entries ride after the body, before the end marker of the
    // enclosing frame; keep them in a fixed position for byte identity
    put_varint(out, jq.on.len() as u64);
    for link in &jq.on {
        out.push(op_code(link.op));
        out.push(cond_code(link.cond));
        put_string(out, &link.left_field);
        put_string(out, &link.right_field);
    }
}

fn serialize_body(q: &Query, out: &mut Vec<u8>) {
    out.push(match q.query_type {
        QueryType::Select => 0,
        QueryType::Update => 1,
        QueryType::Delete => 2,
        QueryType::Truncate => 3,
    });
    put_string(out, &q.namespace);

    serialize_tree(&q.entries, out);

    for se in &q.sort {
        out.push(tag::SORT_INDEX);
        put_string(out, &se.expression);
        out.push(u8::from(se.desc));
        put_values(out, &q.forced_order);
    }
    for agg in &q.aggregations {
        out.push(tag::AGGREGATION);
        out.push(match agg.agg_type {
            AggType::Sum => 0,
            AggType::Avg => 1,
            AggType::Min => 2,
            AggType::Max => 3,
            AggType::Count => 4,
            AggType::CountCached => 5,
            AggType::Facet => 6,
            AggType::Distinct => 7,
        });
        put_varint(out, agg.fields.len() as u64);
        for f in &agg.fields {
            put_string(out, f);
        }
        put_varint(out, agg.sort.len() as u64);
        for se in &agg.sort {
            put_string(out, &se.expression);
            out.push(u8::from(se.desc));
        }
        put_varint(
            out,
            agg.limit.map_or(u64::MAX, |l| l as u64),
        );
        put_varint(out, agg.offset as u64);
    }
    if let Some(limit) = q.limit {
        out.push(tag::LIMIT);
        put_varint(out, limit as u64);
    }
    if q.offset != 0 {
        out.push(tag::OFFSET);
        put_varint(out, q.offset as u64);
    }
    if q.calc_total != CalcTotalMode::None {
        out.push(tag::REQ_TOTAL);
        out.push(match q.calc_total {
            CalcTotalMode::None => 0,
            CalcTotalMode::Accurate => 1,
            CalcTotalMode::Cached => 2,
        });
    }
    for f in &q.select_filter {
        out.push(tag::SELECT_FILTER);
        put_string(out, f);
    }
    for f in &q.select_functions {
        out.push(tag::SELECT_FUNCTION);
        put_string(out, f);
    }
    if q.explain {
        out.push(tag::EXPLAIN);
    }
    if q.with_rank {
        out.push(tag::WITH_RANK);
    }
    if q.strict_mode != StrictMode::None {
        out.push(tag::STRICT_MODE);
        out.push(match q.strict_mode {
            StrictMode::None => 0,
            StrictMode::Names => 1,
            StrictMode::Indexes => 2,
        });
    }
    if q.debug_level != 0 {
        out.push(tag::DEBUG_LEVEL);
        out.push(q.debug_level);
    }
    for ue in &q.updates {
        match ue.mode {
            UpdateMode::Drop => {
                out.push(tag::DROP_FIELD);
                put_string(out, &ue.column);
            }
            UpdateMode::SetJson => {
                out.push(tag::UPDATE_OBJECT);
                put_string(out, &ue.column);
                put_values(out, &ue.values);
            }
            UpdateMode::Set => {
                out.push(tag::UPDATE_FIELD_V2);
                put_string(out, &ue.column);
                let mut flags = 0u8;
                if ue.is_array {
                    flags |= 1;
                }
                if ue.is_expression {
                    flags |= 2;
                }
                out.push(flags);
                put_values(out, &ue.values);
            }
        }
    }
    out.push(tag::END);
}

fn serialize_tree(tree: &EntryTree, out: &mut Vec<u8>) {
    for item in &tree.items {
        match &item.node {
            EntryNode::Condition(qe) => {
                out.push(tag::CONDITION);
                out.push(op_code(item.op));
                put_string(out, &qe.field);
                out.push(cond_code(qe.cond));
                put_values(out, &qe.values);
            }
            EntryNode::BetweenFields(bf) => {
                out.push(tag::BETWEEN_FIELDS);
                out.push(op_code(item.op));
                put_string(out, &bf.first_field);
                out.push(cond_code(bf.cond));
                put_string(out, &bf.second_field);
            }
            EntryNode::AlwaysFalse => {
                out.push(tag::ALWAYS_FALSE);
                out.push(op_code(item.op));
            }
            EntryNode::JoinRef(idx) => {
                out.push(tag::JOIN_CONDITION);
                out.push(op_code(item.op));
                put_varint(out, *idx as u64);
            }
            EntryNode::Bracket(inner) => {
                out.push(tag::OPEN_BRACKET);
                out.push(op_code(item.op));
                serialize_tree(inner, out);
                out.push(tag::CLOSE_BRACKET);
            }
        }
    }
    for group in &tree.equal_positions {
        out.push(tag::EQUAL_POSITION);
        put_varint(out, group.len() as u64);
        for field in group {
            put_string(out, field);
        }
    }
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

/// Decode a wire stream produced by [`serialize`] (or a compatible
/// client).
pub fn parse(bytes: &[u8]) -> Result<Query> {
    let mut pos = 0;
    let mut q = parse_body(bytes, &mut pos)?;
    while pos < bytes.len() {
        let jt = join_type_from(get_u8(bytes, &mut pos)?)?;
        let mut sub = parse_body(bytes, &mut pos)?;
        let on_count = get_varint(bytes, &mut pos)? as usize;
        let mut on = Vec::with_capacity(on_count);
        for _ in 0..on_count {
            let op = op_from(get_u8(bytes, &mut pos)?)?;
            let cond = cond_from(get_u8(bytes, &mut pos)?)?;
            let left_field = get_string(bytes, &mut pos)?;
            let right_field = get_string(bytes, &mut pos)?;
            on.push(JoinEntry {
                left_field,
                cond,
                right_field,
                op,
            });
        }
        if !sub.joins.is_empty() || !sub.merges.is_empty() {
            return Err(VellumError::parse_bin("nested joins are not supported"));
        }
        sub.query_type = QueryType::Select;
        let jq = JoinedQuery {
            query: sub,
            join_type: jt,
            on,
        };
        if jt == JoinType::Merge {
            q.merges.push(jq);
        } else {
            q.joins.push(jq);
        }
    }
    q.validate()?;
    Ok(q)
}

#[allow(clippy::too_many_lines)]
fn parse_body(buf: &[u8], pos: &mut usize) -> Result<Query> {
    let mut q = Query::default();
    q.query_type = match get_u8(buf, pos)? {
        0 => QueryType::Select,
        1 => QueryType::Update,
        2 => QueryType::Delete,
        3 => QueryType::Truncate,
        t => return Err(VellumError::parse_bin(format!("bad query type {t}"))),
    };
    q.namespace = get_string(buf, pos)?;

    // bracket stack: trees being filled, innermost last
    let mut stack: SmallVec<[(OpType, EntryTree); 4]> = SmallVec::new();
    stack.push((OpType::And, EntryTree::default()));

    loop {
        let rec = get_u8(buf, pos)?;
        match rec {
            tag::END => break,
            tag::CONDITION => {
                let op = op_from(get_u8(buf, pos)?)?;
                let field = get_string(buf, pos)?;
                let cond = cond_from(get_u8(buf, pos)?)?;
                let values = get_values(buf, pos)?;
                stack
                    .last_mut()
                    .expect("stack never empty")
                    .1
                    .push(op, EntryNode::Condition(QueryEntry { field, cond, values }));
            }
            tag::BETWEEN_FIELDS => {
                let op = op_from(get_u8(buf, pos)?)?;
                let first_field = get_string(buf, pos)?;
                let cond = cond_from(get_u8(buf, pos)?)?;
                let second_field = get_string(buf, pos)?;
                stack.last_mut().expect("stack never empty").1.push(
                    op,
                    EntryNode::BetweenFields(BetweenFieldsEntry {
                        first_field,
                        cond,
                        second_field,
                    }),
                );
            }
            tag::ALWAYS_FALSE => {
                let op = op_from(get_u8(buf, pos)?)?;
                stack
                    .last_mut()
                    .expect("stack never empty")
                    .1
                    .push(op, EntryNode::AlwaysFalse);
            }
            tag::JOIN_CONDITION => {
                let op = op_from(get_u8(buf, pos)?)?;
                let idx = get_varint(buf, pos)? as usize;
                stack
                    .last_mut()
                    .expect("stack never empty")
                    .1
                    .push(op, EntryNode::JoinRef(idx));
            }
            tag::OPEN_BRACKET => {
                let op = op_from(get_u8(buf, pos)?)?;
                stack.push((op, EntryTree::default()));
            }
            tag::CLOSE_BRACKET => {
                let (op, tree) = stack
                    .pop()
                    .ok_or_else(|| VellumError::parse_bin("unbalanced close bracket"))?;
                if stack.is_empty() {
                    return Err(VellumError::parse_bin("unbalanced close bracket"));
                }
                stack
                    .last_mut()
                    .expect("checked non-empty")
                    .1
                    .push(op, EntryNode::Bracket(tree));
            }
            tag::EQUAL_POSITION => {
                let count = get_varint(buf, pos)? as usize;
                let mut group = Vec::with_capacity(count);
                for _ in 0..count {
                    group.push(get_string(buf, pos)?);
                }
                stack
                    .last_mut()
                    .expect("stack never empty")
                    .1
                    .equal_positions
                    .push(group);
            }
            tag::SORT_INDEX => {
                let expression = get_string(buf, pos)?;
                let desc = get_u8(buf, pos)? != 0;
                let forced = get_values(buf, pos)?;
                if q.sort.is_empty() {
                    q.forced_order = forced;
                }
                q.sort.push(SortEntry { expression, desc });
            }
            tag::AGGREGATION => {
                let agg_type = match get_u8(buf, pos)? {
                    0 => AggType::Sum,
                    1 => AggType::Avg,
                    2 => AggType::Min,
                    3 => AggType::Max,
                    4 => AggType::Count,
                    5 => AggType::CountCached,
                    6 => AggType::Facet,
                    7 => AggType::Distinct,
                    t => {
                        return Err(VellumError::parse_bin(format!("bad aggregation type {t}")))
                    }
                };
                let nfields = get_varint(buf, pos)? as usize;
                let mut fields = Vec::with_capacity(nfields);
                for _ in 0..nfields {
                    fields.push(get_string(buf, pos)?);
                }
                let nsort = get_varint(buf, pos)? as usize;
                let mut sort = Vec::with_capacity(nsort);
                for _ in 0..nsort {
                    let expression = get_string(buf, pos)?;
                    let desc = get_u8(buf, pos)? != 0;
                    sort.push(SortEntry { expression, desc });
                }
                let raw_limit = get_varint(buf, pos)?;
                let limit = if raw_limit == u64::MAX {
                    None
                } else {
                    Some(raw_limit as usize)
                };
                let offset = get_varint(buf, pos)? as usize;
                q.aggregations.push(AggregateEntry {
                    agg_type,
                    fields,
                    sort,
                    limit,
                    offset,
                });
            }
            tag::LIMIT => q.limit = Some(get_varint(buf, pos)? as usize),
            tag::OFFSET => q.offset = get_varint(buf, pos)? as usize,
            tag::REQ_TOTAL => {
                q.calc_total = match get_u8(buf, pos)? {
                    0 => CalcTotalMode::None,
                    1 => CalcTotalMode::Accurate,
                    2 => CalcTotalMode::Cached,
                    t => return Err(VellumError::parse_bin(format!("bad total mode {t}"))),
                };
            }
            tag::SELECT_FILTER => q.select_filter.push(get_string(buf, pos)?),
            tag::SELECT_FUNCTION => q.select_functions.push(get_string(buf, pos)?),
            tag::EXPLAIN => q.explain = true,
            tag::WITH_RANK => q.with_rank = true,
            tag::STRICT_MODE => {
                q.strict_mode = match get_u8(buf, pos)? {
                    0 => StrictMode::None,
                    1 => StrictMode::Names,
                    2 => StrictMode::Indexes,
                    t => return Err(VellumError::parse_bin(format!("bad strict mode {t}"))),
                };
            }
            tag::DEBUG_LEVEL => q.debug_level = get_u8(buf, pos)?,
            tag::DROP_FIELD => q.updates.push(UpdateEntry {
                column: get_string(buf, pos)?,
                values: VariantArray::new(),
                mode: UpdateMode::Drop,
                is_expression: false,
                is_array: false,
            }),
            tag::UPDATE_OBJECT => {
                let column = get_string(buf, pos)?;
                let values = get_values(buf, pos)?;
                q.updates.push(UpdateEntry {
                    column,
                    values,
                    mode: UpdateMode::SetJson,
                    is_expression: false,
                    is_array: false,
                });
            }
            tag::UPDATE_FIELD_V2 => {
                let column = get_string(buf, pos)?;
                let flags = get_u8(buf, pos)?;
                let values = get_values(buf, pos)?;
                q.updates.push(UpdateEntry {
                    column,
                    values,
                    mode: UpdateMode::Set,
                    is_expression: flags & 2 != 0,
                    is_array: flags & 1 != 0,
                });
            }
            tag::UPDATE_FIELD => {
                // legacy encoding: no flags byte, arrays inferred from arity
                let column = get_string(buf, pos)?;
                let values = get_values(buf, pos)?;
                let is_array = values.len() > 1;
                q.updates.push(UpdateEntry {
                    column,
                    values,
                    mode: UpdateMode::Set,
                    is_expression: false,
                    is_array,
                });
            }
            other => {
                return Err(VellumError::parse_bin(format!(
                    "unknown record tag {other} in query stream"
                )))
            }
        }
    }

    if stack.len() != 1 {
        return Err(VellumError::parse_bin("unbalanced open bracket"));
    }
    q.entries = stack.pop().expect("root tree").1;
    Ok(q)
}
