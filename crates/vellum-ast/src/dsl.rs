//! JSON DSL codec.
//!
//! A bijective JSON rendering of [`Query`]: every query survives
//! `to_dsl -> from_dsl` unchanged, and every SQL query survives
//! `SQL -> AST -> DSL -> AST -> SQL`.

use serde_json::{json, Map, Value};
use vellum_error::{Result, VellumError};
use vellum_types::cjson::{json_to_variant, variant_to_json};
use vellum_types::VariantArray;

use crate::{
    AggType, AggregateEntry, BetweenFieldsEntry, CalcTotalMode, CondType, EntryNode, EntryTree,
    JoinEntry, JoinType, JoinedQuery, OpType, Query, QueryEntry, QueryType, SortEntry, StrictMode,
    UpdateEntry, UpdateMode,
};

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Render a query as its DSL JSON value.
#[must_use]
pub fn to_dsl(q: &Query) -> Value {
    let mut root = Map::new();
    root.insert("namespace".into(), json!(q.namespace));
    root.insert(
        "type".into(),
        json!(match q.query_type {
            QueryType::Select => "select",
            QueryType::Update => "update",
            QueryType::Delete => "delete",
            QueryType::Truncate => "truncate",
        }),
    );
    if q.query_type == QueryType::Truncate {
        return Value::Object(root);
    }

    if q.query_type == QueryType::Select {
        root.insert("limit".into(), json!(q.limit.map_or(-1i64, |l| l as i64)));
        root.insert("offset".into(), json!(q.offset));
        root.insert(
            "req_total".into(),
            json!(match q.calc_total {
                CalcTotalMode::None => "disabled",
                CalcTotalMode::Accurate => "enabled",
                CalcTotalMode::Cached => "cached",
            }),
        );
        root.insert("select_with_rank".into(), json!(q.with_rank));
        root.insert(
            "select_filter".into(),
            Value::Array(q.select_filter.iter().map(|s| json!(s)).collect()),
        );
        root.insert(
            "select_functions".into(),
            Value::Array(q.select_functions.iter().map(|s| json!(s)).collect()),
        );
    }
    root.insert("explain".into(), json!(q.explain));
    if q.strict_mode != StrictMode::None {
        root.insert("strict_mode".into(), json!(q.strict_mode.as_str()));
    }
    root.insert("sort".into(), encode_sort(&q.sort, &q.forced_order));
    root.insert("filters".into(), encode_filters(q));

    if q.query_type == QueryType::Select {
        root.insert(
            "merge_queries".into(),
            Value::Array(q.merges.iter().map(|m| to_dsl(&m.query)).collect()),
        );
        root.insert(
            "aggregations".into(),
            Value::Array(q.aggregations.iter().map(encode_aggregation).collect()),
        );
    }

    if q.query_type == QueryType::Update {
        let drops: Vec<Value> = q
            .updates
            .iter()
            .filter(|u| u.mode == UpdateMode::Drop)
            .map(|u| json!(u.column))
            .collect();
        if !drops.is_empty() {
            root.insert("drop_fields".into(), Value::Array(drops));
        }
        let sets: Vec<Value> = q
            .updates
            .iter()
            .filter(|u| u.mode != UpdateMode::Drop)
            .map(encode_update_field)
            .collect();
        if !sets.is_empty() {
            root.insert("update_fields".into(), Value::Array(sets));
        }
    }
    Value::Object(root)
}

/// Render a query as a DSL JSON string.
#[must_use]
pub fn to_dsl_string(q: &Query) -> String {
    to_dsl(q).to_string()
}

fn encode_sort(sort: &[SortEntry], forced: &VariantArray) -> Value {
    Value::Array(
        sort.iter()
            .enumerate()
            .map(|(i, se)| {
                let mut node = Map::new();
                node.insert("field".into(), json!(se.expression));
                node.insert("desc".into(), json!(se.desc));
                if i == 0 && !forced.is_empty() {
                    node.insert(
                        "values".into(),
                        Value::Array(forced.iter().map(variant_to_json).collect()),
                    );
                }
                Value::Object(node)
            })
            .collect(),
    )
}

fn encode_aggregation(agg: &AggregateEntry) -> Value {
    let mut node = Map::new();
    node.insert("type".into(), json!(agg.agg_type.as_str()));
    node.insert(
        "sort".into(),
        encode_sort(&agg.sort, &VariantArray::new()),
    );
    if let Some(limit) = agg.limit {
        node.insert("limit".into(), json!(limit));
    }
    if agg.offset != 0 {
        node.insert("offset".into(), json!(agg.offset));
    }
    node.insert(
        "fields".into(),
        Value::Array(agg.fields.iter().map(|f| json!(f)).collect()),
    );
    Value::Object(node)
}

fn encode_update_field(u: &UpdateEntry) -> Value {
    let kind = if u.mode == UpdateMode::SetJson {
        "object"
    } else if u.is_expression {
        "expression"
    } else {
        "value"
    };
    json!({
        "type": kind,
        "name": u.column,
        "is_array": u.is_array,
        "values": Value::Array(u.values.iter().map(variant_to_json).collect()),
    })
}

fn encode_filters(q: &Query) -> Value {
    let mut filters = Vec::new();
    encode_tree(&q.entries, q, &mut filters);
    // left joins do not occupy a slot in the entry tree; they ride at the
    // end of the filter list
    for jq in &q.joins {
        if jq.join_type == JoinType::LeftJoin {
            let mut node = Map::new();
            node.insert("join_query".into(), encode_join_query(jq));
            filters.push(Value::Object(node));
        }
    }
    encode_equal_positions(&q.entries.equal_positions, &mut filters);
    Value::Array(filters)
}

fn encode_equal_positions(groups: &[Vec<String>], out: &mut Vec<Value>) {
    if groups.is_empty() {
        return;
    }
    let positions: Vec<Value> = groups
        .iter()
        .map(|g| json!({ "positions": g }))
        .collect();
    out.push(json!({ "equal_positions": positions }));
}

fn encode_tree(tree: &EntryTree, q: &Query, out: &mut Vec<Value>) {
    for item in &tree.items {
        let mut node = Map::new();
        node.insert("op".into(), json!(item.op.as_str()));
        match &item.node {
            EntryNode::Condition(qe) => {
                node.insert("cond".into(), json!(qe.cond.as_str()));
                node.insert("field".into(), json!(qe.field));
                match qe.values.len() {
                    0 => {}
                    1 if !matches!(qe.values[0], vellum_types::Variant::Tuple(_)) => {
                        node.insert("value".into(), variant_to_json(&qe.values[0]));
                    }
                    _ => {
                        node.insert(
                            "value".into(),
                            Value::Array(qe.values.iter().map(variant_to_json).collect()),
                        );
                    }
                }
            }
            EntryNode::BetweenFields(bf) => {
                node.insert("cond".into(), json!(bf.cond.as_str()));
                node.insert("first_field".into(), json!(bf.first_field));
                node.insert("second_field".into(), json!(bf.second_field));
            }
            EntryNode::AlwaysFalse => {
                node.insert("always_false".into(), json!(true));
            }
            EntryNode::JoinRef(idx) => {
                if let Some(jq) = q.joins.get(*idx) {
                    node.insert("join_query".into(), encode_join_query(jq));
                }
            }
            EntryNode::Bracket(inner) => {
                let mut children = Vec::new();
                encode_tree(inner, q, &mut children);
                encode_equal_positions(&inner.equal_positions, &mut children);
                node.insert("filters".into(), Value::Array(children));
            }
        }
        out.push(Value::Object(node));
    }
}

fn encode_join_query(jq: &JoinedQuery) -> Value {
    let q = &jq.query;
    let mut node = Map::new();
    node.insert(
        "type".into(),
        json!(match jq.join_type {
            JoinType::InnerJoin => "inner",
            JoinType::LeftJoin => "left",
            JoinType::OrInnerJoin => "orinner",
            JoinType::Merge => "merge",
        }),
    );
    node.insert("namespace".into(), json!(q.namespace));
    node.insert("limit".into(), json!(q.limit.map_or(-1i64, |l| l as i64)));
    node.insert("offset".into(), json!(q.offset));
    node.insert("filters".into(), encode_filters(q));
    node.insert("sort".into(), encode_sort(&q.sort, &q.forced_order));
    node.insert(
        "on".into(),
        Value::Array(
            jq.on
                .iter()
                .map(|link| {
                    json!({
                        "left_field": link.left_field,
                        "right_field": link.right_field,
                        "cond": link.cond.as_str(),
                        "op": link.op.as_str(),
                    })
                })
                .collect(),
        ),
    );
    node.insert(
        "select_filter".into(),
        Value::Array(q.select_filter.iter().map(|s| json!(s)).collect()),
    );
    Value::Object(node)
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Parse a DSL JSON string into a query.
pub fn from_dsl_string(dsl: &str) -> Result<Query> {
    let value: Value = serde_json::from_str(dsl)
        .map_err(|e| VellumError::params(format!("invalid DSL json: {e}")))?;
    from_dsl(&value)
}

/// Parse a DSL JSON value into a query.
pub fn from_dsl(value: &Value) -> Result<Query> {
    let obj = value
        .as_object()
        .ok_or_else(|| VellumError::params("DSL root must be an object"))?;
    let mut q = Query::default();
    q.namespace = str_field(obj, "namespace")?.unwrap_or_default();
    q.query_type = match str_field(obj, "type")?.as_deref() {
        None | Some("select") => QueryType::Select,
        Some("update") => QueryType::Update,
        Some("delete") => QueryType::Delete,
        Some("truncate") => QueryType::Truncate,
        Some(other) => {
            return Err(VellumError::params(format!("unknown query type '{other}'")))
        }
    };
    if let Some(limit) = obj.get("limit").and_then(Value::as_i64) {
        if limit >= 0 {
            q.limit = Some(limit as usize);
        }
    }
    if let Some(offset) = obj.get("offset").and_then(Value::as_u64) {
        q.offset = offset as usize;
    }
    q.calc_total = match obj.get("req_total").and_then(Value::as_str) {
        None | Some("disabled") => CalcTotalMode::None,
        Some("enabled") => CalcTotalMode::Accurate,
        Some("cached") => CalcTotalMode::Cached,
        Some(other) => {
            return Err(VellumError::params(format!("unknown req_total '{other}'")))
        }
    };
    q.explain = obj.get("explain").and_then(Value::as_bool).unwrap_or(false);
    q.with_rank = obj
        .get("select_with_rank")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if let Some(sm) = obj.get("strict_mode").and_then(Value::as_str) {
        q.strict_mode = StrictMode::from_str(sm)?;
    }
    if let Some(filter) = obj.get("select_filter").and_then(Value::as_array) {
        q.select_filter = string_array(filter)?;
    }
    if let Some(funcs) = obj.get("select_functions").and_then(Value::as_array) {
        q.select_functions = string_array(funcs)?;
    }
    if let Some(sort) = obj.get("sort").and_then(Value::as_array) {
        decode_sort(sort, &mut q.sort, &mut q.forced_order)?;
    }
    if let Some(filters) = obj.get("filters").and_then(Value::as_array) {
        let (tree, joins) = decode_filters(filters)?;
        q.entries = tree;
        q.joins = joins;
    }
    if let Some(merges) = obj.get("merge_queries").and_then(Value::as_array) {
        for m in merges {
            q.merges.push(JoinedQuery {
                query: from_dsl(m)?,
                join_type: JoinType::Merge,
                on: vec![],
            });
        }
    }
    if let Some(aggs) = obj.get("aggregations").and_then(Value::as_array) {
        for a in aggs {
            q.aggregations.push(decode_aggregation(a)?);
        }
    }
    if let Some(drops) = obj.get("drop_fields").and_then(Value::as_array) {
        for d in string_array(drops)? {
            q.updates.push(UpdateEntry {
                column: d,
                values: VariantArray::new(),
                mode: UpdateMode::Drop,
                is_expression: false,
                is_array: false,
            });
        }
    }
    if let Some(sets) = obj.get("update_fields").and_then(Value::as_array) {
        for s in sets {
            q.updates.push(decode_update_field(s)?);
        }
    }
    q.validate()?;
    Ok(q)
}

fn str_field(obj: &Map<String, Value>, key: &str) -> Result<Option<String>> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(VellumError::params(format!("'{key}' must be a string"))),
    }
}

fn string_array(values: &[Value]) -> Result<Vec<String>> {
    values
        .iter()
        .map(|v| {
            v.as_str()
                .map(str::to_owned)
                .ok_or_else(|| VellumError::params("expected string array"))
        })
        .collect()
}

fn decode_sort(
    entries: &[Value],
    sort: &mut Vec<SortEntry>,
    forced: &mut VariantArray,
) -> Result<()> {
    for (i, e) in entries.iter().enumerate() {
        let obj = e
            .as_object()
            .ok_or_else(|| VellumError::params("sort entry must be an object"))?;
        let expression = str_field(obj, "field")?
            .ok_or_else(|| VellumError::params("sort entry missing 'field'"))?;
        let desc = obj.get("desc").and_then(Value::as_bool).unwrap_or(false);
        if i == 0 {
            if let Some(values) = obj.get("values").and_then(Value::as_array) {
                *forced = values.iter().map(json_to_variant).collect();
            }
        }
        sort.push(SortEntry { expression, desc });
    }
    Ok(())
}

fn decode_aggregation(value: &Value) -> Result<AggregateEntry> {
    let obj = value
        .as_object()
        .ok_or_else(|| VellumError::params("aggregation must be an object"))?;
    let type_str = str_field(obj, "type")?
        .ok_or_else(|| VellumError::params("aggregation missing 'type'"))?;
    let agg_type = AggType::parse(&type_str)
        .ok_or_else(|| VellumError::params(format!("unknown aggregation '{type_str}'")))?;
    let fields = obj
        .get("fields")
        .and_then(Value::as_array)
        .map(|f| string_array(f))
        .transpose()?
        .unwrap_or_default();
    let mut agg = AggregateEntry::new(agg_type, fields);
    if let Some(sort) = obj.get("sort").and_then(Value::as_array) {
        let mut forced = VariantArray::new();
        decode_sort(sort, &mut agg.sort, &mut forced)?;
        if !forced.is_empty() {
            return Err(VellumError::parse_sql(
                "forced sort order is not available in aggregation sort",
            ));
        }
    }
    if let Some(limit) = obj.get("limit").and_then(Value::as_u64) {
        agg.limit = Some(limit as usize);
    }
    if let Some(offset) = obj.get("offset").and_then(Value::as_u64) {
        agg.offset = offset as usize;
    }
    Ok(agg)
}

fn decode_update_field(value: &Value) -> Result<UpdateEntry> {
    let obj = value
        .as_object()
        .ok_or_else(|| VellumError::params("update field must be an object"))?;
    let column = str_field(obj, "name")?
        .ok_or_else(|| VellumError::params("update field missing 'name'"))?;
    let kind = str_field(obj, "type")?.unwrap_or_else(|| "value".to_owned());
    let is_array = obj
        .get("is_array")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let values = obj
        .get("values")
        .and_then(Value::as_array)
        .map(|vs| vs.iter().map(json_to_variant).collect())
        .unwrap_or_default();
    let (mode, is_expression) = match kind.as_str() {
        "value" => (UpdateMode::Set, false),
        "expression" => (UpdateMode::Set, true),
        "object" => (UpdateMode::SetJson, false),
        other => {
            return Err(VellumError::params(format!(
                "unknown update field type '{other}'"
            )))
        }
    };
    Ok(UpdateEntry {
        column,
        values,
        mode,
        is_expression,
        is_array,
    })
}

fn decode_filters(filters: &[Value]) -> Result<(EntryTree, Vec<JoinedQuery>)> {
    let mut joins = Vec::new();
    let tree = decode_tree(filters, &mut joins)?;
    Ok((tree, joins))
}

fn decode_tree(filters: &[Value], joins: &mut Vec<JoinedQuery>) -> Result<EntryTree> {
    let mut tree = EntryTree::default();
    for f in filters {
        let obj = f
            .as_object()
            .ok_or_else(|| VellumError::params("filter must be an object"))?;
        if let Some(groups) = obj.get("equal_positions").and_then(Value::as_array) {
            for g in groups {
                let positions = g
                    .get("positions")
                    .and_then(Value::as_array)
                    .ok_or_else(|| VellumError::params("equal_positions missing 'positions'"))?;
                tree.equal_positions.push(string_array(positions)?);
            }
            continue;
        }
        let op = match obj.get("op").and_then(Value::as_str) {
            Some(s) => OpType::from_str(s)?,
            None => OpType::And,
        };
        if let Some(join) = obj.get("join_query") {
            let (jq, jt) = decode_join_query(join)?;
            let idx = joins.len();
            joins.push(jq);
            if jt != JoinType::LeftJoin {
                tree.push(op, EntryNode::JoinRef(idx));
            }
            continue;
        }
        if obj
            .get("always_false")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            tree.push(op, EntryNode::AlwaysFalse);
            continue;
        }
        if let Some(children) = obj.get("filters").and_then(Value::as_array) {
            let inner = decode_tree(children, joins)?;
            tree.push(op, EntryNode::Bracket(inner));
            continue;
        }
        let cond = CondType::from_str(
            obj.get("cond")
                .and_then(Value::as_str)
                .ok_or_else(|| VellumError::params("filter missing 'cond'"))?,
        )?;
        if let Some(first) = str_field(obj, "first_field")? {
            let second = str_field(obj, "second_field")?
                .ok_or_else(|| VellumError::params("filter missing 'second_field'"))?;
            tree.push(
                op,
                EntryNode::BetweenFields(BetweenFieldsEntry {
                    first_field: first,
                    cond,
                    second_field: second,
                }),
            );
            continue;
        }
        let field = str_field(obj, "field")?
            .ok_or_else(|| VellumError::params("filter missing 'field'"))?;
        let values: VariantArray = match obj.get("value") {
            None | Some(Value::Null) => VariantArray::new(),
            Some(Value::Array(items)) => items.iter().map(json_to_variant).collect(),
            Some(single) => smallvec::smallvec![json_to_variant(single)],
        };
        tree.push(op, EntryNode::Condition(QueryEntry { field, cond, values }));
    }
    Ok(tree)
}

fn decode_join_query(value: &Value) -> Result<(JoinedQuery, JoinType)> {
    let obj = value
        .as_object()
        .ok_or_else(|| VellumError::params("join_query must be an object"))?;
    let join_type = match obj.get("type").and_then(Value::as_str) {
        Some("inner") => JoinType::InnerJoin,
        Some("left") => JoinType::LeftJoin,
        Some("orinner") => JoinType::OrInnerJoin,
        other => {
            return Err(VellumError::params(format!(
                "unknown join type {other:?}"
            )))
        }
    };
    let mut q = Query::default();
    q.namespace = str_field(obj, "namespace")?
        .ok_or_else(|| VellumError::params("join_query missing 'namespace'"))?;
    if let Some(limit) = obj.get("limit").and_then(Value::as_i64) {
        if limit >= 0 {
            q.limit = Some(limit as usize);
        }
    }
    if let Some(offset) = obj.get("offset").and_then(Value::as_u64) {
        q.offset = offset as usize;
    }
    if let Some(filters) = obj.get("filters").and_then(Value::as_array) {
        let (tree, nested) = decode_filters(filters)?;
        if !nested.is_empty() {
            return Err(VellumError::params("nested joins are not supported"));
        }
        q.entries = tree;
    }
    if let Some(sort) = obj.get("sort").and_then(Value::as_array) {
        decode_sort(sort, &mut q.sort, &mut q.forced_order)?;
    }
    if let Some(filter) = obj.get("select_filter").and_then(Value::as_array) {
        q.select_filter = string_array(filter)?;
    }
    let mut on = Vec::new();
    if let Some(links) = obj.get("on").and_then(Value::as_array) {
        for link in links {
            let lo = link
                .as_object()
                .ok_or_else(|| VellumError::params("join 'on' entry must be an object"))?;
            on.push(JoinEntry {
                left_field: str_field(lo, "left_field")?
                    .ok_or_else(|| VellumError::params("join missing 'left_field'"))?,
                right_field: str_field(lo, "right_field")?
                    .ok_or_else(|| VellumError::params("join missing 'right_field'"))?,
                cond: CondType::from_str(
                    lo.get("cond")
                        .and_then(Value::as_str)
                        .ok_or_else(|| VellumError::params("join missing 'cond'"))?,
                )?,
                op: match lo.get("op").and_then(Value::as_str) {
                    Some(s) => OpType::from_str(s)?,
                    None => OpType::And,
                },
            });
        }
    }
    Ok((
        JoinedQuery {
            query: q,
            join_type,
            on,
        },
        join_type,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;
    use vellum_types::Variant;

    fn round_trip(q: &Query) {
        let dsl = to_dsl_string(q);
        let parsed = from_dsl_string(&dsl).unwrap();
        assert_eq!(&parsed, q, "DSL round trip changed the query:\n{dsl}");
        assert_eq!(to_dsl_string(&parsed), dsl);
    }

    #[test]
    fn select_round_trip() {
        let q = Query::new("books")
            .where_cond("price", CondType::Gt, [Variant::Int64(500)])
            .or_where("genre", CondType::Set, [Variant::from("sf"), Variant::from("fantasy")])
            .sort("price", true)
            .limit(10)
            .offset(3)
            .req_total(CalcTotalMode::Accurate);
        round_trip(&q);
    }

    #[test]
    fn bracket_and_equal_positions_round_trip() {
        let mut inner = EntryTree::default();
        inner.push(
            OpType::And,
            EntryNode::Condition(QueryEntry {
                field: "a".into(),
                cond: CondType::Eq,
                values: smallvec![Variant::Int(1)],
            }),
        );
        inner.push(
            OpType::And,
            EntryNode::Condition(QueryEntry {
                field: "b".into(),
                cond: CondType::Eq,
                values: smallvec![Variant::Int(2)],
            }),
        );
        inner.equal_positions.push(vec!["a".into(), "b".into()]);
        let mut q = Query::new("items");
        q.entries.push(OpType::And, EntryNode::Bracket(inner));
        round_trip(&q);
    }

    #[test]
    fn joins_round_trip() {
        let right = Query::new("authors").where_cond("rating", CondType::Ge, [Variant::Int(4)]);
        let q = Query::new("books").inner_join(
            right,
            vec![JoinEntry {
                left_field: "author_id".into(),
                cond: CondType::Eq,
                right_field: "id".into(),
                op: OpType::And,
            }],
        );
        round_trip(&q);

        let q2 = Query::new("books").left_join(
            Query::new("reviews"),
            vec![JoinEntry {
                left_field: "id".into(),
                cond: CondType::Eq,
                right_field: "book_id".into(),
                op: OpType::And,
            }],
        );
        round_trip(&q2);
    }

    #[test]
    fn update_round_trip() {
        let mut q = Query::new("books").where_cond("id", CondType::Eq, [Variant::Int(7)]);
        q.query_type = QueryType::Update;
        q.updates.push(UpdateEntry {
            column: "price".into(),
            values: smallvec![Variant::Int64(990)],
            mode: UpdateMode::Set,
            is_expression: false,
            is_array: false,
        });
        q.updates.push(UpdateEntry {
            column: "stale".into(),
            values: VariantArray::new(),
            mode: UpdateMode::Drop,
            is_expression: false,
            is_array: false,
        });
        round_trip(&q);
    }

    #[test]
    fn aggregation_round_trip() {
        let mut agg = AggregateEntry::new(AggType::Facet, vec!["genre".into()]);
        agg.sort.push(SortEntry {
            expression: "count".into(),
            desc: true,
        });
        agg.limit = Some(10);
        let q = Query::new("books").aggregate(agg);
        round_trip(&q);
    }

    #[test]
    fn forced_order_round_trip() {
        let mut q = Query::new("books").sort("genre", false);
        q.forced_order = smallvec![Variant::from("sf"), Variant::from("prose")];
        round_trip(&q);
    }

    #[test]
    fn bad_dsl_reports_params() {
        assert!(from_dsl_string("not json").is_err());
        assert!(from_dsl_string("{\"filters\": [{\"op\":\"and\"}]}").is_err());
    }
}
