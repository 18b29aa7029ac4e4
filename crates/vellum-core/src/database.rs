//! The programmatic engine facade.
//!
//! Owns the namespace registry, per-namespace cloner mutexes, global
//! update observers and the commit paths for transactions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, info};
use vellum_ast::{Query, QueryType};
use vellum_error::{Result, VellumError};
use vellum_index::IndexDef;
use vellum_storage::Storage;
use vellum_types::{IdType, Lsn, VxContext};
use vellum_wal::{ObserverRegistry, UpdatesObserver};

use crate::config::NamespaceConfig;
use crate::modify::{execute_delete, execute_update};
use crate::namespace::{MemStat, NamespaceImpl, PerfStat};
use crate::query_results::QueryResults;
use crate::selecter::{execute_select, JoinedNamespaces};
use crate::transaction::{apply_steps, Transaction};

/// A shared namespace slot. Readers hold the `Arc` for the duration of
/// one operation; a copy-on-write commit swaps the registry entry and
/// marks the old handle invalidated.
pub struct NsHandle {
    pub ns: RwLock<NamespaceImpl>,
    invalidated: AtomicBool,
}

impl NsHandle {
    fn new(ns: NamespaceImpl) -> Arc<Self> {
        Arc::new(Self {
            ns: RwLock::new(ns),
            invalidated: AtomicBool::new(false),
        })
    }

    /// Fails when the namespace was swapped out from under this handle.
    pub fn check_valid(&self) -> Result<()> {
        if self.invalidated.load(Ordering::Acquire) {
            return Err(VellumError::namespace_invalidated(
                "namespace was replaced by a copy-on-write commit; retry the operation",
            ));
        }
        Ok(())
    }
}

struct NsEntry {
    handle: Arc<NsHandle>,
    /// Serializes copy-on-write commits per namespace.
    cloner: Arc<Mutex<()>>,
    generation: u64,
}

/// In-memory document database engine.
#[derive(Default)]
pub struct Database {
    namespaces: RwLock<HashMap<String, NsEntry>>,
    observers: ObserverRegistry,
    config: NamespaceConfig,
    server_id: i16,
}

impl Database {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_config(config: NamespaceConfig, server_id: i16) -> Self {
        Self {
            namespaces: RwLock::new(HashMap::new()),
            observers: ObserverRegistry::new(),
            config,
            server_id,
        }
    }

    // -- namespace lifecycle ------------------------------------------------

    /// Open (create if absent) a namespace, optionally attached to a
    /// byte store that is loaded before the namespace becomes visible.
    pub fn open_namespace(
        &self,
        name: &str,
        storage: Option<Arc<dyn Storage>>,
    ) -> Result<()> {
        let mut namespaces = self.namespaces.write();
        if namespaces.contains_key(name) {
            return Ok(());
        }
        let mut ns = NamespaceImpl::new(name, self.config.clone(), self.server_id);
        ns.observers = self.observers.clone();
        if let Some(storage) = storage {
            ns.attach_storage(storage)?;
        }
        namespaces.insert(
            name.to_owned(),
            NsEntry {
                handle: NsHandle::new(ns),
                cloner: Arc::new(Mutex::new(())),
                generation: 0,
            },
        );
        Ok(())
    }

    /// Flush and detach a namespace, keeping its storage intact.
    pub fn close_namespace(&self, name: &str) -> Result<()> {
        let entry = self
            .namespaces
            .write()
            .remove(name)
            .ok_or_else(|| VellumError::not_found(format!("namespace '{name}' does not exist")))?;
        entry.handle.ns.write().flush_storage()?;
        info!(namespace = name, "namespace closed");
        Ok(())
    }

    /// Drop a namespace and destroy its storage.
    pub fn drop_namespace(&self, name: &str) -> Result<()> {
        let entry = self
            .namespaces
            .write()
            .remove(name)
            .ok_or_else(|| VellumError::not_found(format!("namespace '{name}' does not exist")))?;
        entry.handle.ns.write().destroy_storage()?;
        info!(namespace = name, "namespace dropped");
        Ok(())
    }

    pub fn rename_namespace(&self, from: &str, to: &str) -> Result<()> {
        let mut namespaces = self.namespaces.write();
        if namespaces.contains_key(to) {
            return Err(VellumError::conflict(format!(
                "namespace '{to}' already exists"
            )));
        }
        let entry = namespaces
            .remove(from)
            .ok_or_else(|| VellumError::not_found(format!("namespace '{from}' does not exist")))?;
        entry.handle.ns.write().set_name(to);
        namespaces.insert(to.to_owned(), entry);
        info!(from, to, "namespace renamed");
        Ok(())
    }

    pub fn truncate_namespace(&self, name: &str) -> Result<()> {
        self.write_handle(name)?.ns.write().truncate()
    }

    /// Wipe and repopulate a namespace from a batch of documents.
    pub fn refill(&self, name: &str, docs: Vec<Value>) -> Result<()> {
        let handle = self.write_handle(name)?;
        let mut ns = handle.ns.write();
        ns.truncate()?;
        for doc in docs {
            ns.upsert_item(doc, false, Lsn::EMPTY)?;
        }
        Ok(())
    }

    #[must_use]
    pub fn namespace_names(&self) -> Vec<String> {
        self.namespaces.read().keys().cloned().collect()
    }

    /// The current shared handle of a namespace.
    pub fn handle(&self, name: &str) -> Result<Arc<NsHandle>> {
        self.namespaces
            .read()
            .get(name)
            .map(|entry| entry.handle.clone())
            .ok_or_else(|| VellumError::not_found(format!("namespace '{name}' does not exist")))
    }

    /// Handle for a write path: invalidated handles (a copy-on-write
    /// commit is in flight or just swapped) refuse further writes.
    fn write_handle(&self, name: &str) -> Result<Arc<NsHandle>> {
        let handle = self.handle(name)?;
        handle.check_valid()?;
        Ok(handle)
    }

    // -- index & schema -----------------------------------------------------

    pub fn add_index(&self, ns: &str, def: IndexDef) -> Result<()> {
        self.write_handle(ns)?.ns.write().add_index(def)
    }

    pub fn update_index(&self, ns: &str, def: IndexDef) -> Result<()> {
        self.write_handle(ns)?.ns.write().update_index(def)
    }

    pub fn drop_index(&self, ns: &str, name: &str) -> Result<()> {
        self.write_handle(ns)?.ns.write().drop_index(name)
    }

    pub fn set_schema(&self, ns: &str, schema: Value) -> Result<()> {
        self.write_handle(ns)?.ns.write().set_schema(schema)
    }

    pub fn get_schema(&self, ns: &str) -> Result<Option<Value>> {
        Ok(self.handle(ns)?.ns.read().get_schema().cloned())
    }

    // -- items --------------------------------------------------------------

    pub fn upsert(&self, ns: &str, doc: Value) -> Result<IdType> {
        let handle = self.write_handle(ns)?;
        let started = Instant::now();
        let result = handle.ns.write().upsert_item(doc, false, Lsn::EMPTY);
        handle
            .ns
            .read()
            .perf
            .on_update(started.elapsed().as_micros() as u64);
        result.map(|(id, _)| id)
    }

    pub fn insert(&self, ns: &str, doc: Value) -> Result<IdType> {
        self.write_handle(ns)?.ns.write().insert_item(doc)
    }

    pub fn update(&self, ns: &str, doc: Value) -> Result<IdType> {
        self.write_handle(ns)?.ns.write().update_item(doc)
    }

    pub fn delete(&self, ns: &str, doc: Value) -> Result<Option<IdType>> {
        self.write_handle(ns)?
            .ns
            .write()
            .delete_item(&doc, false, Lsn::EMPTY)
    }

    /// Apply a mutation replicated from a leader.
    pub fn apply_replicated_upsert(&self, ns: &str, doc: Value, origin_lsn: Lsn) -> Result<IdType> {
        let handle = self.write_handle(ns)?;
        let result = handle.ns.write().upsert_item(doc, true, origin_lsn);
        match result {
            Ok((id, _)) => Ok(id),
            Err(err) => {
                handle
                    .ns
                    .write()
                    .repl
                    .set_fatal(ns, &err.to_string());
                Err(err)
            }
        }
    }

    // -- queries ------------------------------------------------------------

    /// Execute an SQL statement (select, update, delete or truncate).
    pub fn query_sql(&self, sql: &str, cx: &VxContext) -> Result<QueryResults> {
        let q = vellum_parser::parse_sql(sql)?;
        match q.query_type {
            QueryType::Select => self.select(&q, cx),
            QueryType::Update => self.update_query(&q, cx),
            QueryType::Delete => self.delete_query(&q, cx),
            QueryType::Truncate => {
                self.truncate_namespace(&q.namespace)?;
                Ok(QueryResults::default())
            }
        }
    }

    /// Execute a select query, resolving joined and merged namespaces.
    pub fn select(&self, q: &Query, cx: &VxContext) -> Result<QueryResults> {
        cx.check()?;
        let started = Instant::now();
        let main = self.handle(&q.namespace)?;

        // lock every participating namespace in name order
        let mut side_names: Vec<String> = q
            .joins
            .iter()
            .map(|j| j.query.namespace.clone())
            .chain(q.merges.iter().map(|m| m.query.namespace.clone()))
            .filter(|name| name != &q.namespace)
            .collect();
        side_names.sort();
        side_names.dedup();
        let side_handles: Vec<(String, Arc<NsHandle>)> = side_names
            .iter()
            .map(|name| Ok((name.clone(), self.handle(name)?)))
            .collect::<Result<_>>()?;

        let main_guard = main.ns.read();
        let side_guards: Vec<(String, parking_lot::RwLockReadGuard<'_, NamespaceImpl>)> =
            side_handles
                .iter()
                .map(|(name, handle)| (name.clone(), handle.ns.read()))
                .collect();
        let mut joined = JoinedNamespaces::new();
        for (name, guard) in &side_guards {
            joined.insert(name.clone(), &**guard);
        }
        joined.insert(q.namespace.clone(), &*main_guard);

        let mut results = if q.merges.is_empty() {
            execute_select(&main_guard, q, &joined, cx)?
        } else {
            // run main and merged queries unbounded, then page the union
            let mut unlimited = q.clone();
            unlimited.limit = None;
            unlimited.offset = 0;
            let mut results = execute_select(&main_guard, &unlimited, &joined, cx)?;
            for (ns_id, mq) in q.merges.iter().enumerate() {
                let sub_ns = joined.get(&mq.query.namespace).ok_or_else(|| {
                    VellumError::not_found(format!(
                        "merged namespace '{}' is not available",
                        mq.query.namespace
                    ))
                })?;
                let mut sub = execute_select(sub_ns, &mq.query, &joined, cx)?;
                results.namespaces.push(mq.query.namespace.clone());
                for mut item in sub.items.drain(..) {
                    item.ns_id = ns_id + 1;
                    results.items.push(item);
                }
            }
            let total = results.items.len();
            let offset = q.offset.min(total);
            results.items.drain(..offset);
            if let Some(limit) = q.limit {
                results.items.truncate(limit);
            }
            if q.calc_total != vellum_ast::CalcTotalMode::None {
                results.total_count = Some(total);
            }
            results
        };

        main_guard
            .perf
            .on_select(started.elapsed().as_micros() as u64);
        results.namespaces[0] = q.namespace.clone();
        Ok(results)
    }

    pub fn update_query(&self, q: &Query, cx: &VxContext) -> Result<QueryResults> {
        let handle = self.write_handle(&q.namespace)?;
        let started = Instant::now();
        let mut ns = handle.ns.write();
        let result = execute_update(&mut ns, q, cx);
        ns.perf.on_update(started.elapsed().as_micros() as u64);
        result
    }

    pub fn delete_query(&self, q: &Query, cx: &VxContext) -> Result<QueryResults> {
        let handle = self.write_handle(&q.namespace)?;
        let started = Instant::now();
        let mut ns = handle.ns.write();
        let result = execute_delete(&mut ns, q, cx);
        ns.perf.on_update(started.elapsed().as_micros() as u64);
        result
    }

    // -- meta ---------------------------------------------------------------

    pub fn get_meta(&self, ns: &str, key: &str) -> Result<Option<String>> {
        self.handle(ns)?.ns.read().get_meta(key)
    }

    pub fn put_meta(&self, ns: &str, key: &str, value: &str) -> Result<()> {
        self.write_handle(ns)?.ns.write().put_meta(key, value)
    }

    pub fn enum_meta(&self, ns: &str) -> Result<Vec<String>> {
        self.handle(ns)?.ns.read().enum_meta()
    }

    // -- transactions -------------------------------------------------------

    pub fn new_transaction(&self, ns: &str) -> Result<Transaction> {
        let namespaces = self.namespaces.read();
        let entry = namespaces
            .get(ns)
            .ok_or_else(|| VellumError::not_found(format!("namespace '{ns}' does not exist")))?;
        entry.handle.check_valid()?;
        Ok(Transaction::new(ns, entry.generation))
    }

    /// Commit: in place under the write lock, or copy-on-write past the
    /// configured thresholds.
    pub fn commit_transaction(&self, tx: Transaction, cx: &VxContext) -> Result<()> {
        cx.check()?;
        let (handle, cloner, generation) = {
            let namespaces = self.namespaces.read();
            let entry = namespaces.get(tx.namespace()).ok_or_else(|| {
                VellumError::not_found(format!(
                    "namespace '{}' does not exist",
                    tx.namespace()
                ))
            })?;
            (entry.handle.clone(), entry.cloner.clone(), entry.generation)
        };
        if generation != tx.generation {
            return Err(VellumError::TxInvalidatedBySubsequentCommit);
        }
        handle.check_valid()?;

        let (steps_count, capacity, wants_copy) = {
            let ns = handle.ns.read();
            let wants = ns
                .config
                .wants_copy_commit(tx.len(), ns.items.capacity());
            (tx.len(), ns.items.capacity(), wants)
        };

        if !wants_copy {
            let mut ns = handle.ns.write();
            handle.check_valid()?;
            apply_steps(&mut ns, tx.steps(), cx)?;
            debug!(
                namespace = tx.namespace(),
                steps = steps_count,
                "transaction committed in place"
            );
            return Ok(());
        }

        // copy-on-write path
        let _cloner_guard = cloner.lock();
        let mut clone = {
            let ns = handle.ns.read();
            // inherit pending storage writes before the fork
            ns.flush_storage()?;
            ns.clone_for_commit()
        };
        // the source refuses new writes while the clone catches up;
        // readers keep the old, consistent state
        handle.invalidated.store(true, Ordering::Release);
        // the clone applies steps without blocking readers of the source
        if let Err(err) = apply_steps(&mut clone, tx.steps(), cx) {
            // free the clone, restore the source untouched
            handle.invalidated.store(false, Ordering::Release);
            return Err(err);
        }
        // pre-warm: rebuild fulltext and sort orders before going live
        clone.optimize_indexes();

        let mut namespaces = self.namespaces.write();
        let Some(entry) = namespaces.get_mut(tx.namespace()) else {
            handle.invalidated.store(false, Ordering::Release);
            return Err(VellumError::not_found(format!(
                "namespace '{}' was dropped",
                tx.namespace()
            )));
        };
        if entry.generation != tx.generation {
            handle.invalidated.store(false, Ordering::Release);
            return Err(VellumError::TxInvalidatedBySubsequentCommit);
        }
        let old = std::mem::replace(
            &mut entry.handle,
            NsHandle::new(clone),
        );
        entry.generation += 1;
        old.invalidated.store(true, Ordering::Release);
        // the old namespace keeps serving readers that captured it; it
        // refuses further writes through its invalidated handle
        debug!(
            namespace = tx.namespace(),
            steps = steps_count,
            capacity,
            "transaction committed via namespace copy"
        );
        Ok(())
    }

    // -- background maintenance --------------------------------------------

    /// One pass of the background routine over every namespace: index
    /// optimization, ttl eviction, strings sweep and storage flush.
    pub fn run_background_tasks(&self) {
        let now_unix = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let handles: Vec<Arc<NsHandle>> = self
            .namespaces
            .read()
            .values()
            .map(|entry| entry.handle.clone())
            .collect();
        for handle in handles {
            let mut ns = handle.ns.write();
            if ns.needs_optimization() {
                ns.optimize_indexes();
            }
            if let Err(err) = ns.evict_expired(now_unix) {
                tracing::warn!(%err, "ttl eviction failed");
            }
            ns.sweep_strings();
            if let Err(err) = ns.flush_storage() {
                tracing::warn!(%err, "storage flush failed");
            }
            ns.persist_repl_state();
        }
    }

    // -- observers & stats --------------------------------------------------

    /// Subscribe to WAL updates of every namespace.
    pub fn subscribe_updates(&self, observer: Arc<dyn UpdatesObserver>) {
        self.observers.subscribe(observer);
    }

    pub fn get_mem_stat(&self, ns: &str) -> Result<MemStat> {
        Ok(self.handle(ns)?.ns.read().mem_stat())
    }

    pub fn get_perf_stat(&self, ns: &str) -> Result<PerfStat> {
        Ok(self.handle(ns)?.ns.read().perf.snapshot())
    }
}
