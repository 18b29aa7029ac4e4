//! Results an index hands to the executor for one condition.

use vellum_types::IdType;

use crate::comparator::Comparator;
use crate::idset::IdSet;

/// Ids selected for a single key (or key range) of one index.
#[derive(Debug, Clone)]
pub enum SingleKeyResult {
    /// Materialized id list (sorted unless it came from fulltext).
    Ids(IdSet),
    /// Dense row-id range `[begin, end)`: ttl scans, id-range walks.
    Range(IdType, IdType),
}

impl SingleKeyResult {
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Ids(ids) => ids.len(),
            Self::Range(begin, end) => (*end - *begin).unsigned_abs() as usize,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The index's answer for one query condition: zero or more per-key id
/// sets plus comparators for the part it declined to materialize.
#[derive(Debug, Clone, Default)]
pub struct SelectKeyResult {
    pub results: Vec<SingleKeyResult>,
    pub comparators: Vec<Comparator>,
}

impl SelectKeyResult {
    #[must_use]
    pub fn from_comparator(cmp: Comparator) -> Self {
        Self {
            results: Vec::new(),
            comparators: vec![cmp],
        }
    }

    #[must_use]
    pub fn from_ids(ids: IdSet) -> Self {
        Self {
            results: vec![SingleKeyResult::Ids(ids)],
            comparators: Vec::new(),
        }
    }

    /// Upper bound of iteration steps, capped at `limit`.
    #[must_use]
    pub fn max_iterations(&self, limit: usize) -> usize {
        let mut count = 0usize;
        for r in &self.results {
            count = count.saturating_add(r.len());
            if count > limit {
                return limit;
            }
        }
        count
    }

    /// Collapse all per-key sets into one sorted id set (k-way merge).
    #[must_use]
    pub fn merge_id_sets(&self) -> IdSet {
        let mut total = 0usize;
        for r in &self.results {
            total += r.len();
        }
        let mut merged: Vec<IdType> = Vec::with_capacity(total);
        for r in &self.results {
            match r {
                SingleKeyResult::Ids(ids) => merged.extend(ids.iter()),
                SingleKeyResult::Range(begin, end) => merged.extend(*begin..*end),
            }
        }
        IdSet::from_vec(merged)
    }

    /// Whether only comparators remain (no structural id sets).
    #[must_use]
    pub fn is_comparator_only(&self) -> bool {
        self.results.is_empty() && !self.comparators.is_empty()
    }
}

/// One [`SelectKeyResult`] per requested key group. `CondAllSet` produces
/// one entry per key so the executor can intersect them.
pub type SelectKeyResults = Vec<SelectKeyResult>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_iterations_caps_at_limit() {
        let mut res = SelectKeyResult::default();
        res.results.push(SingleKeyResult::Ids(IdSet::from_vec(vec![1, 2, 3])));
        res.results.push(SingleKeyResult::Range(10, 20));
        assert_eq!(res.max_iterations(usize::MAX), 13);
        assert_eq!(res.max_iterations(5), 5);
    }

    #[test]
    fn merge_sorts_and_dedupes() {
        let mut res = SelectKeyResult::default();
        res.results.push(SingleKeyResult::Ids(IdSet::from_vec(vec![5, 1])));
        res.results.push(SingleKeyResult::Ids(IdSet::from_vec(vec![3, 1])));
        res.results.push(SingleKeyResult::Range(2, 4));
        let merged = res.merge_id_sets();
        assert_eq!(merged.as_slice(), &[1, 2, 3, 5]);
    }
}
