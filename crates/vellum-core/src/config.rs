//! Per-namespace configuration. No process-wide knobs: every namespace
//! carries its own copy.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NamespaceConfig {
    /// WAL ring capacity.
    pub wal_size: usize,
    /// Worker threads for index sort-order optimization (0 disables).
    pub optimization_sort_workers: usize,
    /// Idle milliseconds before background optimization kicks in.
    pub optimization_timeout_ms: u64,
    /// Transactions with at least this many steps consider the
    /// copy-on-write commit path.
    pub start_copy_policy_tx_size: usize,
    /// Copy path also requires `items_capacity <= multiplier * steps`.
    pub copy_policy_multiplier: usize,
    /// Transactions at least this large always take the copy path.
    pub tx_size_to_always_copy: usize,
    /// Entries in the per-namespace query cache.
    pub query_cache_size: usize,
    /// Entries in the per-namespace join cache.
    pub join_cache_size: usize,
    /// Rows an update query must touch before it is replicated as one
    /// statement instead of per-row records.
    pub statement_replication_threshold: usize,
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            wal_size: vellum_wal::wal::DEFAULT_WAL_SIZE,
            optimization_sort_workers: 4,
            optimization_timeout_ms: 800,
            start_copy_policy_tx_size: 10_000,
            copy_policy_multiplier: 20,
            tx_size_to_always_copy: 100_000,
            query_cache_size: 512,
            join_cache_size: 256,
            statement_replication_threshold: 5,
        }
    }
}

impl NamespaceConfig {
    /// The copy-on-write commit decision for a transaction of
    /// `steps_count` steps against `items_capacity` current rows.
    #[must_use]
    pub fn wants_copy_commit(&self, steps_count: usize, items_capacity: usize) -> bool {
        (steps_count >= self.start_copy_policy_tx_size
            && items_capacity <= self.copy_policy_multiplier * steps_count)
            || steps_count >= self.tx_size_to_always_copy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_policy_thresholds() {
        let cfg = NamespaceConfig::default();
        assert!(!cfg.wants_copy_commit(100, 1_000));
        assert!(cfg.wants_copy_commit(10_000, 10_000));
        // capacity too large relative to the tx: stay in place
        assert!(!cfg.wants_copy_commit(10_000, 10_000 * 20 + 1));
        // but huge transactions always copy
        assert!(cfg.wants_copy_commit(100_000, usize::MAX));
    }
}
