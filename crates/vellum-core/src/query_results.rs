//! Executor output.

use serde_json::Value;
use vellum_ast::AggType;
use vellum_types::{IdType, Lsn, Variant};

/// One matched row.
#[derive(Debug, Clone)]
pub struct ItemRef {
    pub id: IdType,
    /// Fulltext rank (0 when the query had no fulltext condition).
    pub proc: u8,
    /// Index into the merged-namespace list (0 = the main namespace).
    pub ns_id: usize,
    pub lsn: Lsn,
    /// Materialized document (select-filter applied).
    pub doc: Value,
    /// Right-hand rows per join, in join declaration order.
    pub joined: Vec<Vec<Value>>,
}

/// One facet bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct FacetResult {
    pub values: Vec<Variant>,
    pub count: usize,
}

/// Output of one aggregation entry.
#[derive(Debug, Clone)]
pub struct AggregationResult {
    pub agg_type: AggType,
    pub fields: Vec<String>,
    /// Sum/Avg/Min/Max/Count value; `None` for an empty input on
    /// min/max.
    pub value: Option<f64>,
    pub facets: Vec<FacetResult>,
    pub distinct: Vec<Variant>,
}

/// Explain output: plan selection and per-phase timings.
#[derive(Debug, Clone, Default)]
pub struct ExplainResult {
    pub total_us: u128,
    pub prepare_us: u128,
    pub select_us: u128,
    pub sort_us: u128,
    /// Human-readable plan entries, one per filter node.
    pub selectors: Vec<String>,
    pub sort_index: String,
}

/// The result set of one query.
#[derive(Debug, Clone, Default)]
pub struct QueryResults {
    pub items: Vec<ItemRef>,
    pub aggregations: Vec<AggregationResult>,
    /// Total matches irrespective of limit/offset, when requested.
    pub total_count: Option<usize>,
    pub explain: Option<ExplainResult>,
    /// Namespaces contributing rows (main + merges).
    pub namespaces: Vec<String>,
}

impl QueryResults {
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter_docs(&self) -> impl Iterator<Item = &Value> + '_ {
        self.items.iter().map(|item| &item.doc)
    }
}
