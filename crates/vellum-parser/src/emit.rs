//! Canonical SQL generation from the query AST.
//!
//! The emitter is the inverse of the parser: `parse(emit(q)) == q` for any
//! query the parser can produce, and `emit(parse(sql))` is `sql` modulo
//! canonical whitespace and keyword case.

use vellum_ast::{
    AggType, CalcTotalMode, EntryNode, EntryTree, JoinType, JoinedQuery, OpType, Query, QueryType,
    SortEntry, UpdateMode,
};
use vellum_types::{Variant, VariantArray};

/// Render a query as canonical SQL.
#[must_use]
pub fn to_sql(q: &Query) -> String {
    let mut out = String::with_capacity(128);
    if q.explain {
        out.push_str("EXPLAIN ");
    }
    match q.query_type {
        QueryType::Select => emit_select(q, &mut out),
        QueryType::Update => emit_update(q, &mut out),
        QueryType::Delete => emit_delete(q, &mut out),
        QueryType::Truncate => {
            out.push_str("TRUNCATE ");
            out.push_str(&q.namespace);
        }
    }
    out
}

fn emit_select(q: &Query, out: &mut String) {
    out.push_str("SELECT ");
    let mut parts: Vec<String> = Vec::new();
    if q.with_rank {
        parts.push("RANK()".to_owned());
    }
    for f in &q.select_filter {
        parts.push(f.clone());
    }
    match q.calc_total {
        CalcTotalMode::Accurate => parts.push("COUNT(*)".to_owned()),
        CalcTotalMode::Cached => parts.push("COUNT_CACHED(*)".to_owned()),
        CalcTotalMode::None => {}
    }
    for agg in &q.aggregations {
        let mut s = format!("{}(", agg.agg_type.as_str().to_uppercase());
        s.push_str(&agg.fields.join(", "));
        if !agg.sort.is_empty() {
            s.push_str(" ORDER BY ");
            s.push_str(&sort_entries(&agg.sort, &VariantArray::new()));
        }
        if let Some(limit) = agg.limit {
            s.push_str(&format!(" LIMIT {limit}"));
        }
        if agg.offset != 0 {
            s.push_str(&format!(" OFFSET {}", agg.offset));
        }
        s.push(')');
        parts.push(s);
    }
    if parts.is_empty() || (q.select_filter.is_empty() && q.calc_total == CalcTotalMode::None) {
        // plain field-less select keeps the star even next to rank() or
        // distinct() entries
        if q.select_filter.is_empty()
            && q.aggregations.iter().all(|a| a.agg_type == AggType::Distinct)
        {
            parts.push("*".to_owned());
        }
    }
    if parts.is_empty() {
        parts.push("*".to_owned());
    }
    out.push_str(&parts.join(", "));

    out.push_str(" FROM ");
    out.push_str(&q.namespace);

    emit_where_and_joins(q, out);

    if !q.sort.is_empty() {
        out.push_str(" ORDER BY ");
        out.push_str(&sort_entries(&q.sort, &q.forced_order));
    }
    if let Some(limit) = q.limit {
        if !(limit == 0 && q.calc_total != CalcTotalMode::None) {
            out.push_str(&format!(" LIMIT {limit}"));
        }
    }
    if q.offset != 0 {
        out.push_str(&format!(" OFFSET {}", q.offset));
    }
    for mq in &q.merges {
        out.push_str(" MERGE(");
        out.push_str(&to_sql(&mq.query));
        out.push(')');
    }
}

fn emit_update(q: &Query, out: &mut String) {
    out.push_str("UPDATE ");
    out.push_str(&q.namespace);
    let drops: Vec<&str> = q
        .updates
        .iter()
        .filter(|u| u.mode == UpdateMode::Drop)
        .map(|u| u.column.as_str())
        .collect();
    if drops.is_empty() {
        out.push_str(" SET ");
        let sets: Vec<String> = q
            .updates
            .iter()
            .map(|u| {
                let mut s = format!("{} = ", u.column);
                if u.is_array {
                    s.push('[');
                    s.push_str(
                        &u.values
                            .iter()
                            .map(|v| update_value(u.mode, u.is_expression, v))
                            .collect::<Vec<_>>()
                            .join(", "),
                    );
                    s.push(']');
                } else if let Some(v) = u.values.first() {
                    s.push_str(&update_value(u.mode, u.is_expression, v));
                } else {
                    s.push_str("null");
                }
                s
            })
            .collect();
        out.push_str(&sets.join(", "));
    } else {
        out.push_str(" DROP ");
        out.push_str(&drops.join(", "));
    }
    emit_where_and_joins(q, out);
}

fn update_value(mode: UpdateMode, is_expression: bool, v: &Variant) -> String {
    match (mode, is_expression) {
        // json objects and expressions are stored as raw text
        (UpdateMode::SetJson, _) | (_, true) => v.to_string(),
        _ => sql_value(v),
    }
}

fn emit_delete(q: &Query, out: &mut String) {
    out.push_str("DELETE FROM ");
    out.push_str(&q.namespace);
    emit_where_and_joins(q, out);
    if !q.sort.is_empty() {
        out.push_str(" ORDER BY ");
        out.push_str(&sort_entries(&q.sort, &q.forced_order));
    }
    if let Some(limit) = q.limit {
        out.push_str(&format!(" LIMIT {limit}"));
    }
    if q.offset != 0 {
        out.push_str(&format!(" OFFSET {}", q.offset));
    }
}

fn emit_where_and_joins(q: &Query, out: &mut String) {
    let mut next_join = 0usize;
    let clause = where_tree(&q.entries, q, &mut next_join);
    if !clause.is_empty() {
        out.push_str(" WHERE ");
        out.push_str(&clause);
    }
    // left joins not referenced from the entry tree trail the clause
    while next_join < q.joins.len() {
        let jq = &q.joins[next_join];
        next_join += 1;
        if jq.join_type == JoinType::LeftJoin {
            out.push(' ');
            out.push_str(&join_clause(jq, &q.namespace));
        }
    }
}

/// Render a filter tree. `next_join` walks `q.joins` in index order so
/// that left joins re-appear textually between the inner joins that
/// surround them, reproducing the parser's encounter order.
fn where_tree(tree: &EntryTree, q: &Query, next_join: &mut usize) -> String {
    let mut out = String::new();
    for item in &tree.items {
        match &item.node {
            EntryNode::JoinRef(idx) => {
                // left joins registered before this one come first
                while *next_join < *idx {
                    let jq = &q.joins[*next_join];
                    *next_join += 1;
                    if jq.join_type == JoinType::LeftJoin {
                        if !out.is_empty() {
                            out.push(' ');
                        }
                        out.push_str(&join_clause(jq, &q.namespace));
                    }
                }
                let Some(jq) = q.joins.get(*idx) else {
                    continue;
                };
                *next_join = idx + 1;
                if !out.is_empty() {
                    out.push_str(if jq.join_type == JoinType::OrInnerJoin {
                        " OR "
                    } else {
                        " AND "
                    });
                }
                out.push_str(&join_clause(jq, &q.namespace));
            }
            node => {
                if !out.is_empty() {
                    out.push_str(match item.op {
                        OpType::And => " AND ",
                        OpType::Or => " OR ",
                        OpType::Not => " AND NOT ",
                    });
                } else if item.op == OpType::Not {
                    out.push_str("NOT ");
                }
                match node {
                    EntryNode::Condition(qe) => out.push_str(&condition(qe)),
                    EntryNode::BetweenFields(bf) => {
                        out.push_str(&format!(
                            "{} {} {}",
                            bf.first_field,
                            cond_symbol(bf.cond),
                            bf.second_field
                        ));
                    }
                    EntryNode::AlwaysFalse => out.push_str("false = true"),
                    EntryNode::Bracket(inner) => {
                        out.push('(');
                        out.push_str(&where_tree(inner, q, next_join));
                        out.push(')');
                    }
                    EntryNode::JoinRef(_) => unreachable!("handled above"),
                }
            }
        }
    }
    for group in &tree.equal_positions {
        out.push_str(" equal_position(");
        out.push_str(&group.join(", "));
        out.push(')');
    }
    out
}

fn join_clause(jq: &JoinedQuery, left_ns: &str) -> String {
    let kw = match jq.join_type {
        JoinType::LeftJoin => "LEFT JOIN",
        JoinType::InnerJoin | JoinType::OrInnerJoin => "INNER JOIN",
        JoinType::Merge => "MERGE",
    };
    let sub = &jq.query;
    let target = if sub.entries.is_empty()
        && sub.sort.is_empty()
        && sub.limit.is_none()
        && sub.offset == 0
        && sub.select_filter.is_empty()
    {
        sub.namespace.clone()
    } else {
        format!("({})", to_sql(sub))
    };
    let mut s = format!("{kw} {target} ON ");
    if jq.on.len() > 1 {
        s.push('(');
    }
    for (i, link) in jq.on.iter().enumerate() {
        if i > 0 {
            s.push_str(match link.op {
                OpType::Or => " OR ",
                _ => " AND ",
            });
        }
        s.push_str(&format!(
            "{left_ns}.{} {} {}.{}",
            link.left_field,
            cond_symbol(link.cond),
            sub.namespace,
            link.right_field
        ));
    }
    if jq.on.len() > 1 {
        s.push(')');
    }
    s
}

fn condition(qe: &vellum_ast::QueryEntry) -> String {
    match qe.cond {
        vellum_ast::CondType::Empty => format!("{} IS NULL", qe.field),
        vellum_ast::CondType::Any => format!("{} IS NOT NULL", qe.field),
        vellum_ast::CondType::DWithin => {
            let point = qe
                .values
                .first()
                .and_then(|v| match v {
                    Variant::Tuple(items) if items.len() == 2 => {
                        Some((items[0].to_string(), items[1].to_string()))
                    }
                    _ => None,
                })
                .unwrap_or_else(|| ("0.0".to_owned(), "0.0".to_owned()));
            let radius = qe.values.get(1).map_or_else(|| "0.0".to_owned(), ToString::to_string);
            format!(
                "ST_DWithin({}, ST_GeomFromText('point ({} {})'), {})",
                qe.field, point.0, point.1, radius
            )
        }
        vellum_ast::CondType::Set | vellum_ast::CondType::AllSet => {
            let kw = if qe.cond == vellum_ast::CondType::Set {
                "IN"
            } else {
                "ALLSET"
            };
            format!(
                "{} {kw} ({})",
                qe.field,
                qe.values.iter().map(sql_value).collect::<Vec<_>>().join(", ")
            )
        }
        vellum_ast::CondType::Range => format!(
            "{} RANGE ({})",
            qe.field,
            qe.values.iter().map(sql_value).collect::<Vec<_>>().join(", ")
        ),
        vellum_ast::CondType::Like => format!(
            "{} LIKE {}",
            qe.field,
            qe.values.first().map_or_else(|| "''".to_owned(), sql_value)
        ),
        _ => {
            // single composite value uses the bracket literal form
            if let Some(Variant::Tuple(items)) = qe.values.first() {
                if qe.values.len() == 1 {
                    return format!(
                        "\"{}\" {} [{}]",
                        qe.field,
                        cond_symbol(qe.cond),
                        items
                            .iter()
                            .map(sql_value)
                            .collect::<Vec<_>>()
                            .join(", ")
                    );
                }
            }
            if qe.values.len() > 1 {
                format!(
                    "{} IN ({})",
                    qe.field,
                    qe.values.iter().map(sql_value).collect::<Vec<_>>().join(", ")
                )
            } else {
                format!(
                    "{} {} {}",
                    qe.field,
                    cond_symbol(qe.cond),
                    qe.values.first().map_or_else(|| "null".to_owned(), sql_value)
                )
            }
        }
    }
}

fn cond_symbol(cond: vellum_ast::CondType) -> &'static str {
    use vellum_ast::CondType;
    match cond {
        CondType::Eq => "=",
        CondType::Gt => ">",
        CondType::Ge => ">=",
        CondType::Lt => "<",
        CondType::Le => "<=",
        CondType::Set => "IN",
        CondType::Range => "RANGE",
        CondType::Like => "LIKE",
        CondType::AllSet => "ALLSET",
        CondType::Any | CondType::Empty | CondType::DWithin => "=",
    }
}

fn sort_entries(entries: &[SortEntry], forced: &VariantArray) -> String {
    let mut parts = Vec::with_capacity(entries.len());
    for (i, se) in entries.iter().enumerate() {
        let mut s = if i == 0 && !forced.is_empty() {
            format!(
                "FIELD({}, {})",
                se.expression,
                forced.iter().map(sql_value).collect::<Vec<_>>().join(", ")
            )
        } else if is_plain_name(&se.expression) {
            se.expression.clone()
        } else {
            quote_string(&se.expression)
        };
        if se.desc {
            s.push_str(" DESC");
        }
        parts.push(s);
    }
    parts.join(", ")
}

fn is_plain_name(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '+')
        && !s.chars().next().is_some_and(|c| c.is_ascii_digit())
}

fn sql_value(v: &Variant) -> String {
    match v {
        Variant::String(s) => quote_string(s),
        Variant::Tuple(items) => format!(
            "{{{}}}",
            items.iter().map(sql_value).collect::<Vec<_>>().join(", ")
        ),
        other => other.to_string(),
    }
}

fn quote_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        if c == '\'' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('\'');
    out
}
