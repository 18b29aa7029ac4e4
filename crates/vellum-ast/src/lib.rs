//! Query AST for the Vellum engine.
//!
//! The canonical query representation shared by the SQL parser, the JSON
//! DSL and the binary wire format. Each surface round-trips through this
//! tree: `SQL -> Query -> DSL -> Query -> SQL` is the identity modulo
//! canonical whitespace.

pub mod dsl;
pub mod wire;

use smallvec::smallvec;
use vellum_error::{Result, VellumError};
use vellum_types::{Point, Variant, VariantArray};

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Filter condition operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CondType {
    /// Field has any (non-empty) value.
    Any,
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
    /// Closed interval, two values.
    Range,
    /// Membership in a value set.
    Set,
    /// Array field contains every value of the set.
    AllSet,
    /// Field is absent / empty.
    Empty,
    /// SQL LIKE pattern with `%` wildcards.
    Like,
    /// Geo distance: values are `[point, radius]`.
    DWithin,
}

impl CondType {
    /// Mirror a condition when the two sides of a join entry are swapped.
    #[must_use]
    pub fn invert(self) -> Self {
        match self {
            Self::Lt => Self::Gt,
            Self::Le => Self::Ge,
            Self::Gt => Self::Lt,
            Self::Ge => Self::Le,
            other => other,
        }
    }

    /// Name used by both the DSL and error messages.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Any => "any",
            Self::Eq => "eq",
            Self::Lt => "lt",
            Self::Le => "le",
            Self::Gt => "gt",
            Self::Ge => "ge",
            Self::Range => "range",
            Self::Set => "set",
            Self::AllSet => "allset",
            Self::Empty => "empty",
            Self::Like => "like",
            Self::DWithin => "dwithin",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "any" => Self::Any,
            "eq" => Self::Eq,
            "lt" => Self::Lt,
            "le" => Self::Le,
            "gt" => Self::Gt,
            "ge" => Self::Ge,
            "range" => Self::Range,
            "set" => Self::Set,
            "allset" => Self::AllSet,
            "empty" => Self::Empty,
            "like" => Self::Like,
            "dwithin" => Self::DWithin,
            other => return Err(VellumError::params(format!("unknown condition '{other}'"))),
        })
    }
}

/// Logical operator joining filter entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum OpType {
    #[default]
    And,
    Or,
    Not,
}

impl OpType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::And => "and",
            Self::Or => "or",
            Self::Not => "not",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "and" => Self::And,
            "or" => Self::Or,
            "not" => Self::Not,
            other => return Err(VellumError::params(format!("unknown operator '{other}'"))),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JoinType {
    LeftJoin,
    InnerJoin,
    /// Inner join contributing as an OR branch of the filter tree.
    OrInnerJoin,
    Merge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CalcTotalMode {
    #[default]
    None,
    Accurate,
    Cached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StrictMode {
    /// Unknown fields filter through comparators over documents.
    #[default]
    None,
    /// Filter fields must exist as indexes or named json paths.
    Names,
    /// Filter fields must be indexes.
    Indexes,
}

impl StrictMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Names => "names",
            Self::Indexes => "indexes",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "" | "none" => Self::None,
            "names" => Self::Names,
            "indexes" => Self::Indexes,
            other => return Err(VellumError::params(format!("unknown strict mode '{other}'"))),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggType {
    Sum,
    Avg,
    Min,
    Max,
    Count,
    CountCached,
    Facet,
    Distinct,
}

impl AggType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sum => "sum",
            Self::Avg => "avg",
            Self::Min => "min",
            Self::Max => "max",
            Self::Count => "count",
            Self::CountCached => "count_cached",
            Self::Facet => "facet",
            Self::Distinct => "distinct",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "sum" => Self::Sum,
            "avg" => Self::Avg,
            "min" => Self::Min,
            "max" => Self::Max,
            "count" => Self::Count,
            "count_cached" => Self::CountCached,
            "facet" => Self::Facet,
            "distinct" => Self::Distinct,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryType {
    #[default]
    Select,
    Update,
    Delete,
    Truncate,
}

// ---------------------------------------------------------------------------
// Filter tree
// ---------------------------------------------------------------------------

/// Leaf filter: `field cond values`.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryEntry {
    pub field: String,
    pub cond: CondType,
    pub values: VariantArray,
}

/// Field-vs-field comparison: `f1 cond f2`.
#[derive(Debug, Clone, PartialEq)]
pub struct BetweenFieldsEntry {
    pub first_field: String,
    pub cond: CondType,
    pub second_field: String,
}

/// A node of the filter tree.
#[derive(Debug, Clone, PartialEq)]
pub enum EntryNode {
    Condition(QueryEntry),
    BetweenFields(BetweenFieldsEntry),
    /// A bracket folded to a constant false (e.g. empty IN set).
    AlwaysFalse,
    /// Reference into `Query::joins` for inner / or-inner joins.
    JoinRef(usize),
    Bracket(EntryTree),
}

/// An op-tagged node.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryItem {
    pub op: OpType,
    pub node: EntryNode,
}

/// Forest of op-tagged filter nodes plus bracket-scoped equal-position
/// groups.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EntryTree {
    pub items: Vec<EntryItem>,
    /// Each group lists fields whose array conditions must match at the
    /// same element position.
    pub equal_positions: Vec<Vec<String>>,
}

impl EntryTree {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn push(&mut self, op: OpType, node: EntryNode) {
        self.items.push(EntryItem { op, node });
    }

    /// Depth-first iteration over leaf conditions (entering brackets).
    pub fn walk_conditions<'a>(&'a self, f: &mut impl FnMut(&'a QueryEntry)) {
        for item in &self.items {
            match &item.node {
                EntryNode::Condition(qe) => f(qe),
                EntryNode::Bracket(tree) => tree.walk_conditions(f),
                _ => {}
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Sort / aggregate / join / update entries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct SortEntry {
    /// A field name or a sort expression (`price * rank()`).
    pub expression: String,
    pub desc: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateEntry {
    pub agg_type: AggType,
    pub fields: Vec<String>,
    pub sort: Vec<SortEntry>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl AggregateEntry {
    #[must_use]
    pub fn new(agg_type: AggType, fields: Vec<String>) -> Self {
        Self {
            agg_type,
            fields,
            sort: Vec::new(),
            limit: None,
            offset: 0,
        }
    }
}

/// One `ON` link of a join.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinEntry {
    pub left_field: String,
    pub cond: CondType,
    pub right_field: String,
    pub op: OpType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinedQuery {
    pub query: Query,
    pub join_type: JoinType,
    pub on: Vec<JoinEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    /// Replace the field value.
    Set,
    /// Replace an object sub-tree from a JSON literal.
    SetJson,
    /// Remove the JSON path.
    Drop,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateEntry {
    pub column: String,
    pub values: VariantArray,
    pub mode: UpdateMode,
    /// Value is an arithmetic expression over fields.
    pub is_expression: bool,
    /// Value list represents an array literal.
    pub is_array: bool,
}

// ---------------------------------------------------------------------------
// Query
// ---------------------------------------------------------------------------

/// A parsed, surface-independent query.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Query {
    pub namespace: String,
    pub query_type: QueryType,
    pub offset: usize,
    pub limit: Option<usize>,
    pub calc_total: CalcTotalMode,
    pub entries: EntryTree,
    pub aggregations: Vec<AggregateEntry>,
    pub sort: Vec<SortEntry>,
    /// `ORDER BY FIELD(f, v1, v2, ...)` values, first sort entry only.
    pub forced_order: VariantArray,
    pub select_filter: Vec<String>,
    pub select_functions: Vec<String>,
    pub joins: Vec<JoinedQuery>,
    pub merges: Vec<JoinedQuery>,
    pub updates: Vec<UpdateEntry>,
    pub strict_mode: StrictMode,
    pub explain: bool,
    pub with_rank: bool,
    pub debug_level: u8,
}

impl Query {
    #[must_use]
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            ..Self::default()
        }
    }

    // -- builder helpers used by tests and the facade ----------------------

    #[must_use]
    pub fn where_cond(
        mut self,
        field: impl Into<String>,
        cond: CondType,
        values: impl IntoIterator<Item = Variant>,
    ) -> Self {
        self.entries.push(
            OpType::And,
            EntryNode::Condition(QueryEntry {
                field: field.into(),
                cond,
                values: values.into_iter().collect(),
            }),
        );
        self
    }

    #[must_use]
    pub fn or_where(
        mut self,
        field: impl Into<String>,
        cond: CondType,
        values: impl IntoIterator<Item = Variant>,
    ) -> Self {
        self.entries.push(
            OpType::Or,
            EntryNode::Condition(QueryEntry {
                field: field.into(),
                cond,
                values: values.into_iter().collect(),
            }),
        );
        self
    }

    #[must_use]
    pub fn not_where(
        mut self,
        field: impl Into<String>,
        cond: CondType,
        values: impl IntoIterator<Item = Variant>,
    ) -> Self {
        self.entries.push(
            OpType::Not,
            EntryNode::Condition(QueryEntry {
                field: field.into(),
                cond,
                values: values.into_iter().collect(),
            }),
        );
        self
    }

    #[must_use]
    pub fn dwithin(mut self, field: impl Into<String>, point: Point, radius: f64) -> Self {
        self.entries.push(
            OpType::And,
            EntryNode::Condition(QueryEntry {
                field: field.into(),
                cond: CondType::DWithin,
                values: smallvec![point.to_variant(), Variant::Double(radius)],
            }),
        );
        self
    }

    #[must_use]
    pub fn sort(mut self, expression: impl Into<String>, desc: bool) -> Self {
        self.sort.push(SortEntry {
            expression: expression.into(),
            desc,
        });
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    #[must_use]
    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    #[must_use]
    pub fn req_total(mut self, mode: CalcTotalMode) -> Self {
        self.calc_total = mode;
        self
    }

    #[must_use]
    pub fn aggregate(mut self, entry: AggregateEntry) -> Self {
        self.aggregations.push(entry);
        self
    }

    #[must_use]
    pub fn inner_join(
        mut self,
        other: Query,
        on: Vec<JoinEntry>,
    ) -> Self {
        let idx = self.joins.len();
        self.entries.push(OpType::And, EntryNode::JoinRef(idx));
        self.joins.push(JoinedQuery {
            query: other,
            join_type: JoinType::InnerJoin,
            on,
        });
        self
    }

    #[must_use]
    pub fn left_join(mut self, other: Query, on: Vec<JoinEntry>) -> Self {
        self.joins.push(JoinedQuery {
            query: other,
            join_type: JoinType::LeftJoin,
            on,
        });
        self
    }

    /// Whether an aggregation of `agg` may be added given current state.
    #[must_use]
    pub fn can_add_aggregation(&self, agg: AggType) -> bool {
        agg == AggType::Distinct || self.select_filter.is_empty()
    }

    /// Whether a select-filter column may be added given current state.
    #[must_use]
    pub fn can_add_select_filter(&self) -> bool {
        self.aggregations
            .iter()
            .all(|a| a.agg_type == AggType::Distinct)
    }

    /// Structural validation shared by all parse surfaces.
    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() && self.query_type != QueryType::Select {
            return Err(VellumError::params("query namespace is empty"));
        }
        let select_fields_conflict = !self.select_filter.is_empty()
            && self
                .aggregations
                .iter()
                .any(|a| a.agg_type != AggType::Distinct);
        if select_fields_conflict {
            return Err(VellumError::conflict(
                "aggregations are not compatible with explicit select fields",
            ));
        }
        validate_equal_positions(&self.entries)?;
        for jq in self.joins.iter().chain(self.merges.iter()) {
            jq.query.validate()?;
            if jq.join_type != JoinType::Merge && jq.on.is_empty() {
                return Err(VellumError::params(format!(
                    "join with '{}' has no ON conditions",
                    jq.query.namespace
                )));
            }
        }
        Ok(())
    }
}

fn validate_equal_positions(tree: &EntryTree) -> Result<()> {
    for group in &tree.equal_positions {
        if group.len() < 2 {
            return Err(VellumError::logic(
                "equal_position() is supposed to have at least 2 arguments",
            ));
        }
        for field in group {
            let mut found = false;
            for item in &tree.items {
                if let EntryNode::Condition(qe) = &item.node {
                    if &qe.field == field {
                        found = true;
                        break;
                    }
                }
            }
            if !found {
                return Err(VellumError::params(format!(
                    "equal_position() field '{field}' is not referenced in the bracket"
                )));
            }
        }
    }
    for item in &tree.items {
        if let EntryNode::Bracket(inner) = &item.node {
            validate_equal_positions(inner)?;
        }
    }
    Ok(())
}
