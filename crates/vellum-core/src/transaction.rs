//! Transactions: buffered steps, replayed atomically at commit.

use serde_json::Value;
use vellum_ast::{Query, QueryType};
use vellum_error::{Result, VellumError};
use vellum_types::{Lsn, VxContext};
use vellum_wal::WalRecordType;

use crate::modify::{execute_delete, execute_update};
use crate::namespace::NamespaceImpl;

/// One buffered step. Nothing is visible until commit.
#[derive(Debug, Clone)]
pub enum TxStep {
    Upsert(Value),
    Delete(Value),
    /// An update or delete query percolated through the transaction.
    Query(Query),
}

/// A single-namespace transaction.
///
/// Steps accumulate in memory; [`crate::Database::commit_transaction`]
/// replays them under the namespace write lock or, past the copy
/// policy thresholds, on a namespace clone that is atomically swapped
/// in.
#[derive(Debug)]
pub struct Transaction {
    namespace: String,
    steps: Vec<TxStep>,
    /// Namespace generation at creation; a copy-on-write commit bumps
    /// the generation and invalidates older transactions.
    pub(crate) generation: u64,
}

impl Transaction {
    #[must_use]
    pub fn new(namespace: impl Into<String>, generation: u64) -> Self {
        Self {
            namespace: namespace.into(),
            steps: Vec::new(),
            generation,
        }
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn upsert(&mut self, doc: Value) {
        self.steps.push(TxStep::Upsert(doc));
    }

    pub fn delete(&mut self, doc: Value) {
        self.steps.push(TxStep::Delete(doc));
    }

    /// Buffer an update or delete query.
    pub fn modify(&mut self, q: Query) -> Result<()> {
        if q.namespace != self.namespace {
            return Err(VellumError::params(format!(
                "transaction on '{}' can not modify '{}'",
                self.namespace, q.namespace
            )));
        }
        if !matches!(q.query_type, QueryType::Update | QueryType::Delete) {
            return Err(VellumError::params(
                "only update and delete queries can join a transaction",
            ));
        }
        self.steps.push(TxStep::Query(q));
        Ok(())
    }

    #[must_use]
    pub fn steps(&self) -> &[TxStep] {
        &self.steps
    }
}

/// Replay buffered steps against a namespace, framed by the
/// `InitTransaction` / `CommitTransaction` WAL records.
pub(crate) fn apply_steps(
    ns: &mut NamespaceImpl,
    steps: &[TxStep],
    cx: &VxContext,
) -> Result<()> {
    let tx_cx = cx.for_transaction();
    ns.wal_append(WalRecordType::InitTransaction, Vec::new(), Lsn::EMPTY);
    for step in steps {
        match step {
            TxStep::Upsert(doc) => {
                ns.upsert_item(doc.clone(), false, Lsn::EMPTY)?;
            }
            TxStep::Delete(doc) => {
                ns.delete_item(doc, false, Lsn::EMPTY)?;
            }
            TxStep::Query(q) => match q.query_type {
                QueryType::Update => {
                    execute_update(ns, q, &tx_cx)?;
                }
                QueryType::Delete => {
                    execute_delete(ns, q, &tx_cx)?;
                }
                _ => unreachable!("filtered in Transaction::modify"),
            },
        }
    }
    ns.wal_append(WalRecordType::CommitTransaction, Vec::new(), Lsn::EMPTY);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn steps_accumulate() {
        let mut tx = Transaction::new("books", 0);
        tx.upsert(json!({"id": 1}));
        tx.delete(json!({"id": 2}));
        assert_eq!(tx.len(), 2);
        assert_eq!(tx.namespace(), "books");
    }

    #[test]
    fn modify_rejects_foreign_namespace_and_selects() {
        let mut tx = Transaction::new("books", 0);
        let mut q = Query::new("other");
        q.query_type = QueryType::Delete;
        assert!(tx.modify(q).is_err());

        let q = Query::new("books"); // select
        assert!(tx.modify(q).is_err());

        let mut q = Query::new("books");
        q.query_type = QueryType::Delete;
        tx.modify(q).unwrap();
        assert_eq!(tx.len(), 1);
    }
}
