//! Query executor.
//!
//! Runs a validated [`Query`] against a read-locked namespace in phases:
//! preprocess (field resolution, strict checks, join pre-results), build
//! select iterators per filter leaf, pick a driving iterator, walk
//! candidates, then sort, aggregate and finalize.

use std::collections::HashMap;
use std::time::Instant;

use smallvec::smallvec;
use tracing::debug;
use vellum_ast::{
    CalcTotalMode, CondType, EntryNode, EntryTree, JoinType, JoinedQuery, OpType, Query,
    StrictMode,
};
use vellum_error::{Result, VellumError};
use vellum_index::{compare_values, Comparator, FieldSource, IdSet, SelectOpts};
use vellum_types::cjson::extract_json_path;
use vellum_types::{CollateMode, IdType, VariantArray, VxContext};
use xxhash_rust::xxh64::xxh64;

use crate::aggregator::Aggregator;
use crate::item::ItemData;
use crate::namespace::{FieldLookup, NamespaceImpl};
use crate::query_results::{ExplainResult, ItemRef, QueryResults};
use crate::sortexpr::SortExpr;

/// Inner-join pre-results at most this large are rewritten into index
/// conditions on the left namespace (`|pre| <= 100 x max_iterations`,
/// with the namespace size standing in for the plan bound).
const JOIN_INLINE_FACTOR: usize = 100;
/// Hard cap on an inlined pre-result regardless of namespace size.
const JOIN_INLINE_MAX_PRERESULT: usize = 10_000;

/// Namespaces visible to one select: the right side of every join and
/// merge, keyed by name.
pub type JoinedNamespaces<'a> = HashMap<String, &'a NamespaceImpl>;

// ---------------------------------------------------------------------------
// Plan model
// ---------------------------------------------------------------------------

/// One equal-position check: `(source, cond, values)` per referenced
/// field; all must match at the same array position.
struct EqPositionCheck {
    conds: Vec<(FieldSource, CondType, VariantArray, CollateMode)>,
}

enum PlanNode {
    AlwaysFalse,
    /// Materialized ids from an index.
    Ids { ids: IdSet, desc: String },
    /// Comparator walk.
    Cmp { cmp: Comparator, desc: String },
    /// Field-vs-field comparison.
    BetweenFields {
        first: FieldSource,
        cond: CondType,
        second: FieldSource,
        collate: CollateMode,
    },
    /// Non-inlined join, evaluated per row.
    Join { join_idx: usize },
    Bracket {
        items: Vec<(OpType, PlanNode)>,
        eq_checks: Vec<EqPositionCheck>,
    },
}

impl PlanNode {
    fn describe(&self, out: &mut Vec<String>) {
        match self {
            Self::AlwaysFalse => out.push("always-false".to_owned()),
            Self::Ids { ids, desc } => out.push(format!("{desc} ({} ids)", ids.len())),
            Self::Cmp { desc, .. } => out.push(format!("{desc} (comparator)")),
            Self::BetweenFields { cond, .. } => {
                out.push(format!("between-fields {}", cond.as_str()));
            }
            Self::Join { join_idx } => out.push(format!("join #{join_idx}")),
            Self::Bracket { items, .. } => {
                out.push("(".to_owned());
                for (_, item) in items {
                    item.describe(out);
                }
                out.push(")".to_owned());
            }
        }
    }
}

/// Pre-executed right side of one join.
struct JoinPreResult {
    join: JoinedQuery,
    /// Matched right-side row ids.
    ids: Vec<IdType>,
}

/// Ranks produced by a fulltext condition.
type RankMap = HashMap<IdType, u8>;

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Execute a select query.
pub fn execute_select(
    ns: &NamespaceImpl,
    q: &Query,
    joined: &JoinedNamespaces<'_>,
    cx: &VxContext,
) -> Result<QueryResults> {
    cx.check()?;
    q.validate()?;
    let started = Instant::now();

    let mut builder = PlanBuilder {
        ns,
        q,
        joined,
        ranks: RankMap::new(),
        pre_results: Vec::new(),
        inlined: vec![false; q.joins.len()],
    };
    let root = builder.build_tree(&q.entries)?;
    // left joins have no slot in the filter tree but still contribute
    // joined rows to every result item
    for (idx, jq) in q.joins.iter().enumerate() {
        while builder.pre_results.len() < q.joins.len() {
            builder.pre_results.push(None);
        }
        if builder.pre_results[idx].is_none() {
            let right = joined.get(&jq.query.namespace).ok_or_else(|| {
                VellumError::not_found(format!(
                    "joined namespace '{}' is not available",
                    jq.query.namespace
                ))
            })?;
            let ids = builder.join_pre_result(jq, right)?;
            builder.pre_results[idx] = Some(JoinPreResult {
                join: jq.clone(),
                ids,
            });
        }
    }
    let PlanBuilder {
        ranks,
        pre_results,
        inlined,
        ..
    } = builder;
    let prepare_us = started.elapsed().as_micros();

    // -- iterate ------------------------------------------------------------

    let select_started = Instant::now();
    let eval_ctx = EvalCtx {
        ns,
        joined,
        pre_results: &pre_results,
    };

    let mut matched: Vec<IdType> = Vec::new();
    match driving_candidates(&root) {
        Some(candidates) => {
            for id in candidates {
                cx.check()?;
                let Some(item) = ns.items.get(id) else { continue };
                if eval_node(&root, id, item, &eval_ctx)? {
                    matched.push(id);
                }
            }
        }
        None => {
            for (id, item) in ns.items.iter() {
                cx.check()?;
                if eval_node(&root, id, item, &eval_ctx)? {
                    matched.push(id);
                }
            }
        }
    }
    let select_us = select_started.elapsed().as_micros();

    // -- aggregate ----------------------------------------------------------

    let mut aggregators = Vec::with_capacity(q.aggregations.len());
    for entry in &q.aggregations {
        aggregators.push(Aggregator::new(entry.clone())?);
    }
    if !aggregators.is_empty() {
        for &id in &matched {
            let Some(item) = ns.items.get(id) else { continue };
            for agg in &mut aggregators {
                let row: Vec<VariantArray> = agg
                    .fields()
                    .iter()
                    .map(|f| field_values(ns, f, item))
                    .collect();
                agg.aggregate(&row);
            }
        }
    }

    // -- sort ---------------------------------------------------------------

    let sort_started = Instant::now();
    sort_matches(ns, q, &mut matched, &ranks)?;
    let sort_us = sort_started.elapsed().as_micros();

    // -- finalize -----------------------------------------------------------

    let total = matched.len();
    let offset = q.offset.min(matched.len());
    let mut page: Vec<IdType> = matched[offset..].to_vec();
    if let Some(limit) = q.limit {
        page.truncate(limit);
    }

    let mut results = QueryResults {
        namespaces: vec![ns.name().to_owned()],
        ..QueryResults::default()
    };
    for id in page {
        let Some(item) = ns.items.get(id) else { continue };
        let proc = ranks.get(&id).copied().unwrap_or(0);
        let mut doc = project_doc(&item.doc, &q.select_filter);
        if q.with_rank {
            if let serde_json::Value::Object(map) = &mut doc {
                map.insert("rank()".to_owned(), serde_json::json!(proc));
            }
        }
        let joined_rows = collect_joined_rows(ns, id, item, &pre_results, &inlined, joined)?;
        results.items.push(ItemRef {
            id,
            proc,
            ns_id: 0,
            lsn: item.payload.lsn,
            doc,
            joined: joined_rows,
        });
    }
    for agg in aggregators {
        results.aggregations.push(agg.finalize());
    }
    results.total_count = match q.calc_total {
        CalcTotalMode::None => None,
        CalcTotalMode::Accurate => Some(total),
        CalcTotalMode::Cached => Some(cached_total(ns, q, total)),
    };

    if q.explain {
        let mut selectors = Vec::new();
        root.describe(&mut selectors);
        results.explain = Some(ExplainResult {
            total_us: started.elapsed().as_micros(),
            prepare_us,
            select_us,
            sort_us,
            selectors,
            sort_index: q
                .sort
                .first()
                .map(|s| s.expression.clone())
                .unwrap_or_default(),
        });
    }
    debug!(
        namespace = %ns.name(),
        matched = total,
        returned = results.items.len(),
        "select executed"
    );
    Ok(results)
}

// ---------------------------------------------------------------------------
// Plan building
// ---------------------------------------------------------------------------

struct PlanBuilder<'a> {
    ns: &'a NamespaceImpl,
    q: &'a Query,
    joined: &'a JoinedNamespaces<'a>,
    ranks: RankMap,
    pre_results: Vec<Option<JoinPreResult>>,
    inlined: Vec<bool>,
}

impl PlanBuilder<'_> {
    fn build_tree(&mut self, tree: &EntryTree) -> Result<PlanNode> {
        let mut items = Vec::with_capacity(tree.items.len());
        for item in &tree.items {
            let node = match &item.node {
                EntryNode::AlwaysFalse => PlanNode::AlwaysFalse,
                EntryNode::Condition(qe) => self.build_condition(qe)?,
                EntryNode::BetweenFields(bf) => {
                    let first = self.field_source(&bf.first_field)?;
                    let second = self.field_source(&bf.second_field)?;
                    let collate = self.collate_of(&bf.first_field);
                    PlanNode::BetweenFields {
                        first,
                        cond: bf.cond,
                        second,
                        collate,
                    }
                }
                EntryNode::JoinRef(idx) => self.build_join(*idx, item.op)?,
                EntryNode::Bracket(inner) => self.build_tree(inner)?,
            };
            items.push((item.op, node));
        }
        let mut eq_checks = Vec::new();
        for group in &tree.equal_positions {
            eq_checks.push(self.build_eq_check(group, tree)?);
        }
        Ok(PlanNode::Bracket { items, eq_checks })
    }

    fn field_source(&self, name: &str) -> Result<FieldSource> {
        match self.ns.lookup_field(name) {
            FieldLookup::Index(pos) => {
                let index = &self.ns.indexes[pos];
                Ok(match index.fields.iter().next() {
                    Some(vellum_types::FieldRef::Field(idx)) => FieldSource::Field(*idx),
                    Some(vellum_types::FieldRef::JsonPath(path)) => {
                        FieldSource::JsonPath(path.clone())
                    }
                    None => FieldSource::JsonPath(name.to_owned()),
                })
            }
            FieldLookup::Path(path) => {
                self.check_strict(&path)?;
                Ok(FieldSource::JsonPath(path))
            }
        }
    }

    fn collate_of(&self, name: &str) -> CollateMode {
        match self.ns.index_by_name(name) {
            Some(index) => index.def.opts.collate.clone(),
            None => CollateMode::None,
        }
    }

    fn check_strict(&self, path: &str) -> Result<()> {
        match self.q.strict_mode {
            StrictMode::None => Ok(()),
            StrictMode::Indexes => Err(VellumError::query_exec(format!(
                "current query strict mode allows filtering by indexes only, field '{path}' is not indexed"
            ))),
            StrictMode::Names => {
                let first_segment = path.split('.').next().unwrap_or(path);
                if self.ns.tags.name_to_tag(first_segment).is_some() {
                    Ok(())
                } else {
                    Err(VellumError::query_exec(format!(
                        "current query strict mode allows filtering by namespace fields only, '{path}' is not present"
                    )))
                }
            }
        }
    }

    fn build_condition(&mut self, qe: &vellum_ast::QueryEntry) -> Result<PlanNode> {
        match self.ns.lookup_field(&qe.field) {
            FieldLookup::Index(pos) => {
                let index = &self.ns.indexes[pos];
                if index.is_fulltext() {
                    let query = match qe.values.first() {
                        Some(vellum_types::Variant::String(s)) if qe.cond == CondType::Eq => {
                            s.to_string()
                        }
                        _ => {
                            return Err(VellumError::params(format!(
                                "fulltext index '{}' expects a single string query",
                                qe.field
                            )))
                        }
                    };
                    let merged = index.select_fulltext(&query, false)?;
                    let mut ids = Vec::with_capacity(merged.len());
                    for info in merged {
                        self.ranks.insert(info.id, info.proc);
                        ids.push(info.id);
                    }
                    // rank order is re-established by the sort phase;
                    // membership checks want the sorted form
                    return Ok(PlanNode::Ids {
                        ids: IdSet::from_vec(ids),
                        desc: format!("fulltext {}", qe.field),
                    });
                }
                let opts = SelectOpts {
                    items_count: self.ns.items.len(),
                    max_iterations: self.ns.items.len().max(1),
                    ..SelectOpts::default()
                };
                // ORDER BY over this index iterates its pre-built sort
                // projection when the optimizer has produced one
                let sort_id = match self.q.sort.first() {
                    Some(se) if se.expression == qe.field => {
                        match self.ns.lookup_field(&se.expression) {
                            FieldLookup::Index(sort_pos) => self.ns.sort_id_of(sort_pos),
                            FieldLookup::Path(_) => 0,
                        }
                    }
                    _ => 0,
                };
                let results = index.select_key(&qe.values, qe.cond, sort_id, opts)?;
                Ok(merge_select_results(results, &qe.field, qe.cond))
            }
            FieldLookup::Path(path) => {
                self.check_strict(&path)?;
                Ok(PlanNode::Cmp {
                    cmp: Comparator::new(
                        FieldSource::JsonPath(path.clone()),
                        qe.cond,
                        qe.values.clone(),
                        CollateMode::None,
                    ),
                    desc: format!("scan {path}"),
                })
            }
        }
    }

    fn build_eq_check(&self, group: &[String], tree: &EntryTree) -> Result<EqPositionCheck> {
        let mut conds = Vec::with_capacity(group.len());
        for field in group {
            let mut found = None;
            tree.walk_conditions(&mut |qe| {
                if &qe.field == field && found.is_none() {
                    found = Some((qe.cond, qe.values.clone()));
                }
            });
            let Some((cond, values)) = found else {
                return Err(VellumError::params(format!(
                    "equal_position() field '{field}' is not referenced in the bracket"
                )));
            };
            conds.push((
                self.field_source(field)?,
                cond,
                values,
                self.collate_of(field),
            ));
        }
        Ok(EqPositionCheck { conds })
    }

    fn build_join(&mut self, idx: usize, op: OpType) -> Result<PlanNode> {
        let jq = self
            .q
            .joins
            .get(idx)
            .ok_or_else(|| VellumError::logic(format!("join #{idx} is out of range")))?;
        let right = self
            .joined
            .get(&jq.query.namespace)
            .ok_or_else(|| {
                VellumError::not_found(format!(
                    "joined namespace '{}' is not available",
                    jq.query.namespace
                ))
            })?;

        let ids = self.join_pre_result(jq, right)?;

        // inner joins with And+Eq/Set links over a small pre-result turn
        // into plain index conditions on the left namespace
        let can_inline = jq.join_type == JoinType::InnerJoin
            && op == OpType::And
            && !jq.on.is_empty()
            && jq.on.iter().all(|link| {
                link.op == OpType::And && matches!(link.cond, CondType::Eq | CondType::Set)
            })
            && ids.len() <= (JOIN_INLINE_FACTOR * self.ns.items.len().max(1))
                .min(JOIN_INLINE_MAX_PRERESULT)
            && jq.on.iter().all(|link| {
                match self.ns.index_by_name(&link.left_field) {
                    Some(index) => !index.is_fulltext() && !index.def.opts.sparse,
                    None => false,
                }
            });

        if can_inline {
            let mut items = Vec::with_capacity(jq.on.len());
            for link in &jq.on {
                let mut values = VariantArray::new();
                for &rid in &ids {
                    if let Some(item) = right.items.get(rid) {
                        for v in field_values(right, &link.right_field, item) {
                            if !values.contains(&v) {
                                values.push(v);
                            }
                        }
                    }
                }
                let node = self.build_condition(&vellum_ast::QueryEntry {
                    field: link.left_field.clone(),
                    cond: CondType::Set,
                    values,
                })?;
                items.push((OpType::And, node));
            }
            self.inlined[idx] = true;
            self.pre_results[idx] = Some(JoinPreResult {
                join: jq.clone(),
                ids,
            });
            debug!(join = idx, "inner join inlined into index conditions");
            return Ok(PlanNode::Bracket {
                items,
                eq_checks: Vec::new(),
            });
        }

        self.pre_results[idx] = Some(JoinPreResult {
            join: jq.clone(),
            ids,
        });
        Ok(PlanNode::Join { join_idx: idx })
    }

    /// Execute (or fetch from the join cache) the right-side filter of a
    /// join, ignoring its ON conditions.
    fn join_pre_result(&mut self, jq: &JoinedQuery, right: &NamespaceImpl) -> Result<Vec<IdType>> {
        while self.pre_results.len() < self.q.joins.len() {
            self.pre_results.push(None);
        }
        let cache_key = xxh64(&vellum_ast::wire::serialize(&jq.query), 0);
        if let Some(ids) = self.ns.join_cache.lock().get(&cache_key) {
            return Ok(ids.clone());
        }
        let sub_results = execute_select(
            right,
            &jq.query,
            &JoinedNamespaces::new(),
            &VxContext::new(),
        )?;
        let ids: Vec<IdType> = sub_results.items.iter().map(|item| item.id).collect();
        self.ns.join_cache.lock().put(cache_key, ids.clone());
        Ok(ids)
    }
}

/// Fold an index's select answer into one plan node.
fn merge_select_results(
    results: vellum_index::SelectKeyResults,
    field: &str,
    cond: CondType,
) -> PlanNode {
    if results.len() > 1 {
        // AllSet: intersect the per-key sets
        let mut intersection: Option<Vec<IdType>> = None;
        for res in &results {
            let ids: Vec<IdType> = res.merge_id_sets().iter().collect();
            intersection = Some(match intersection {
                None => ids,
                Some(prev) => prev.into_iter().filter(|id| ids.contains(id)).collect(),
            });
        }
        return PlanNode::Ids {
            ids: IdSet::from_vec(intersection.unwrap_or_default()),
            desc: format!("index {field} {}", cond.as_str()),
        };
    }
    match results.into_iter().next() {
        Some(res) if res.is_comparator_only() => {
            let cmp = res.comparators.into_iter().next().expect("comparator present");
            PlanNode::Cmp {
                cmp,
                desc: format!("index {field} {}", cond.as_str()),
            }
        }
        Some(res) => PlanNode::Ids {
            ids: res.merge_id_sets(),
            desc: format!("index {field} {}", cond.as_str()),
        },
        None => PlanNode::AlwaysFalse,
    }
}

// ---------------------------------------------------------------------------
// Iteration
// ---------------------------------------------------------------------------

struct EvalCtx<'a> {
    ns: &'a NamespaceImpl,
    joined: &'a JoinedNamespaces<'a>,
    pre_results: &'a [Option<JoinPreResult>],
}

/// Pick the cheapest driving id list: the smallest And-connected Ids
/// node at the top level, widened by Or id-branches.
fn driving_candidates(root: &PlanNode) -> Option<Vec<IdType>> {
    let PlanNode::Bracket { items, .. } = root else {
        return None;
    };
    let mut best: Option<&IdSet> = None;
    let mut union_all = Vec::new();
    let mut only_or_ids = true;
    for (op, node) in items {
        match node {
            // a negated id set restricts nothing: it only excludes
            PlanNode::Ids { ids, .. } if *op != OpType::Not => {
                if *op == OpType::Or {
                    union_all.extend(ids.iter());
                } else {
                    if best.map_or(true, |b| ids.len() < b.len()) {
                        best = Some(ids);
                    }
                    only_or_ids = false;
                }
            }
            _ => {
                if *op == OpType::Or {
                    // an Or branch that is not a plain id set can match
                    // anything: no driving set
                    return None;
                }
                only_or_ids = false;
            }
        }
    }
    if let Some(best) = best {
        let mut candidates: Vec<IdType> = best.iter().collect();
        // Or id-branches widen the candidate set
        candidates.extend(union_all);
        candidates.sort_unstable();
        candidates.dedup();
        return Some(candidates);
    }
    if only_or_ids && !union_all.is_empty() {
        union_all.sort_unstable();
        union_all.dedup();
        return Some(union_all);
    }
    None
}

fn eval_node(node: &PlanNode, id: IdType, item: &ItemData, ctx: &EvalCtx<'_>) -> Result<bool> {
    Ok(match node {
        PlanNode::AlwaysFalse => false,
        PlanNode::Ids { ids, .. } => ids.contains(id),
        PlanNode::Cmp { cmp, .. } => cmp.matches(&item.payload, Some(&item.doc)),
        PlanNode::BetweenFields {
            first,
            cond,
            second,
            collate,
        } => {
            let lhs = source_values(first, item);
            let rhs = source_values(second, item);
            compare_values(&lhs, *cond, &rhs, collate)
        }
        PlanNode::Join { join_idx } => eval_join(*join_idx, item, ctx)?.is_some(),
        PlanNode::Bracket { items, eq_checks } => {
            let mut result: Option<bool> = None;
            for (op, child) in items {
                let value = eval_node(child, id, item, ctx)?;
                result = Some(match (result, op) {
                    (None, OpType::Not) => !value,
                    (None, _) => value,
                    (Some(acc), OpType::And) => acc && value,
                    (Some(acc), OpType::Or) => acc || value,
                    (Some(acc), OpType::Not) => acc && !value,
                });
            }
            let mut ok = result.unwrap_or(true);
            if ok {
                for check in eq_checks {
                    if !eval_eq_position(check, item) {
                        ok = false;
                        break;
                    }
                }
            }
            ok
        }
    })
}

fn source_values(source: &FieldSource, item: &ItemData) -> VariantArray {
    match source {
        FieldSource::Field(idx) => {
            if *idx < item.payload.num_fields() {
                item.payload.get(*idx).clone()
            } else {
                VariantArray::new()
            }
        }
        FieldSource::JsonPath(path) => extract_json_path(&item.doc, path),
    }
}

/// All referenced array conditions must match at one shared position.
fn eval_eq_position(check: &EqPositionCheck, item: &ItemData) -> bool {
    let rows: Vec<VariantArray> = check
        .conds
        .iter()
        .map(|(source, ..)| source_values(source, item))
        .collect();
    let max_len = rows.iter().map(VariantArray::len).max().unwrap_or(0);
    (0..max_len).any(|pos| {
        check.conds.iter().zip(&rows).all(|((_, cond, values, collate), row)| {
            row.get(pos).is_some_and(|value| {
                compare_values(&smallvec![value.clone()], *cond, values, collate)
            })
        })
    })
}

/// Evaluate one non-inlined join for one left row; returns the matched
/// right-side ids (`None` when the row does not contribute).
fn eval_join(
    join_idx: usize,
    item: &ItemData,
    ctx: &EvalCtx<'_>,
) -> Result<Option<Vec<IdType>>> {
    let Some(pre) = ctx.pre_results.get(join_idx).and_then(Option::as_ref) else {
        return Ok(None);
    };
    let right = ctx
        .joined
        .get(&pre.join.query.namespace)
        .ok_or_else(|| {
            VellumError::not_found(format!(
                "joined namespace '{}' is not available",
                pre.join.query.namespace
            ))
        })?;

    let mut matches = Vec::new();
    for &rid in &pre.ids {
        let Some(right_item) = right.items.get(rid) else {
            continue;
        };
        let mut all = true;
        for link in &pre.join.on {
            // the ON condition is parameterized by the left row's values
            let left_values = field_values(ctx.ns, &link.left_field, item);
            let right_values = field_values(right, &link.right_field, right_item);
            if !compare_values(&right_values, link.cond.invert(), &left_values, &CollateMode::None)
            {
                all = false;
                break;
            }
        }
        if all {
            matches.push(rid);
        }
    }
    match pre.join.join_type {
        JoinType::LeftJoin => Ok(Some(matches)),
        _ => {
            if matches.is_empty() {
                Ok(None)
            } else {
                Ok(Some(matches))
            }
        }
    }
}

/// Values of a named field of one row, reading the payload slot for
/// indexed fields and the document otherwise.
pub(crate) fn field_values(ns: &NamespaceImpl, name: &str, item: &ItemData) -> VariantArray {
    match ns.lookup_field(name) {
        FieldLookup::Index(pos) => {
            let index = &ns.indexes[pos];
            match index.fields.iter().next() {
                Some(vellum_types::FieldRef::Field(idx)) if *idx < item.payload.num_fields() => {
                    item.payload.get(*idx).clone()
                }
                Some(vellum_types::FieldRef::JsonPath(path)) => {
                    extract_json_path(&item.doc, path)
                }
                _ => VariantArray::new(),
            }
        }
        FieldLookup::Path(path) => extract_json_path(&item.doc, &path),
    }
}

// ---------------------------------------------------------------------------
// Sort & finalize helpers
// ---------------------------------------------------------------------------

fn sort_matches(
    ns: &NamespaceImpl,
    q: &Query,
    matched: &mut [IdType],
    ranks: &RankMap,
) -> Result<()> {
    if q.sort.is_empty() {
        if !ranks.is_empty() {
            // rank order, best first; stable for equal ranks
            matched.sort_by(|a, b| {
                let ra = ranks.get(a).copied().unwrap_or(0);
                let rb = ranks.get(b).copied().unwrap_or(0);
                rb.cmp(&ra).then(a.cmp(b))
            });
        }
        return Ok(());
    }

    // compile sort keys per entry
    struct CompiledSort {
        expr: SortExpr,
        field: Option<String>,
        desc: bool,
    }
    let mut compiled = Vec::with_capacity(q.sort.len());
    for entry in &q.sort {
        let expr = SortExpr::parse(&entry.expression)?;
        let field = expr.as_field().map(str::to_owned);
        compiled.push(CompiledSort {
            expr,
            field,
            desc: entry.desc,
        });
    }

    let forced_rank = |id: IdType| -> usize {
        if q.forced_order.is_empty() {
            return 0;
        }
        let Some(first) = compiled.first().and_then(|c| c.field.clone()) else {
            return q.forced_order.len();
        };
        let Some(item) = ns.items.get(id) else {
            return q.forced_order.len();
        };
        let values = field_values(ns, &first, item);
        values
            .first()
            .and_then(|v| q.forced_order.iter().position(|f| f == v))
            .unwrap_or(q.forced_order.len())
    };

    let mut sort_error: Option<VellumError> = None;
    matched.sort_by(|a, b| {
        use std::cmp::Ordering;
        // forced values come first, stable among themselves
        let ord = forced_rank(*a).cmp(&forced_rank(*b));
        if ord != Ordering::Equal {
            return ord;
        }
        for (i, c) in compiled.iter().enumerate() {
            if i == 0 && !q.forced_order.is_empty() {
                // the first entry's natural order applies only outside
                // the forced prefix; both rows here are unforced
            }
            let (Some(ia), Some(ib)) = (ns.items.get(*a), ns.items.get(*b)) else {
                continue;
            };
            let ord = if let Some(field) = &c.field {
                let va = field_values(ns, field, ia);
                let vb = field_values(ns, field, ib);
                va.first().cmp(&vb.first())
            } else {
                let ra = ranks.get(a).copied().unwrap_or(0);
                let rb = ranks.get(b).copied().unwrap_or(0);
                match (c.expr.evaluate(&ia.doc, ra), c.expr.evaluate(&ib.doc, rb)) {
                    (Ok(x), Ok(y)) => x.total_cmp(&y),
                    (Err(e), _) | (_, Err(e)) => {
                        if sort_error.is_none() {
                            sort_error = Some(e);
                        }
                        Ordering::Equal
                    }
                }
            };
            let ord = if c.desc { ord.reverse() } else { ord };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        a.cmp(b)
    });
    match sort_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Apply the select filter: empty means the whole document.
fn project_doc(doc: &serde_json::Value, filter: &[String]) -> serde_json::Value {
    if filter.is_empty() {
        return doc.clone();
    }
    let mut out = serde_json::Map::new();
    for field in filter {
        let values = extract_json_path(doc, field);
        if let Some(first) = values.first() {
            let rendered = if values.len() > 1 {
                serde_json::Value::Array(
                    values.iter().map(vellum_types::cjson::variant_to_json).collect(),
                )
            } else {
                vellum_types::cjson::variant_to_json(first)
            };
            out.insert(field.clone(), rendered);
        }
    }
    serde_json::Value::Object(out)
}

fn collect_joined_rows(
    ns: &NamespaceImpl,
    _id: IdType,
    item: &ItemData,
    pre_results: &[Option<JoinPreResult>],
    inlined: &[bool],
    joined: &JoinedNamespaces<'_>,
) -> Result<Vec<Vec<serde_json::Value>>> {
    let mut out = Vec::new();
    let ctx = EvalCtx {
        ns,
        joined,
        pre_results,
    };
    for (idx, pre) in pre_results.iter().enumerate() {
        let Some(pre) = pre else {
            out.push(Vec::new());
            continue;
        };
        // inlined joins still surface their matched right rows
        let _ = inlined;
        let matches = eval_join(idx, item, &ctx)?.unwrap_or_default();
        let right = joined.get(&pre.join.query.namespace);
        let docs = matches
            .into_iter()
            .filter_map(|rid| {
                right
                    .and_then(|r| r.items.get(rid))
                    .map(|ri| ri.doc.clone())
            })
            .collect();
        out.push(docs);
    }
    Ok(out)
}

/// `COUNT_CACHED(*)`: consult the per-namespace query cache before
/// trusting the freshly computed total.
fn cached_total(ns: &NamespaceImpl, q: &Query, computed: usize) -> usize {
    let mut count_query = q.clone();
    count_query.limit = None;
    count_query.offset = 0;
    count_query.calc_total = CalcTotalMode::None;
    let key = xxh64(&vellum_ast::wire::serialize(&count_query), 0);

    let mut cache = ns.query_cache.lock();
    if let Some(total) = cache.get(&key) {
        return *total;
    }
    cache.put(key, computed);
    computed
}
