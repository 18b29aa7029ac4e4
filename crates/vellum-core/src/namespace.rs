//! Namespace: items, indexes, tags, WAL and the write path.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, warn};
use vellum_error::{Result, VellumError};
use vellum_index::{
    composite_key, Index, IndexDef, IndexType, LruCache, SelectOpts, StringsHolder,
};
use vellum_storage::{
    check_storage_header, item_key, load_latest_sys_record, storage_header, write_sys_record,
    Storage, INDEXES_PREFIX, META_PREFIX, REPL_PREFIX, SCHEMA_PREFIX, TAGS_PREFIX,
};
use vellum_types::cjson::{self, convert_values, extract_json_path};
use vellum_types::{
    FieldRef, FieldsSet, IdType, Lsn, PayloadFieldType, PayloadType, SortType, TagsMatcher,
    Variant, VariantArray, MAX_INDEXES,
};
use vellum_wal::{
    ObserverRegistry, ReplicationState, WalRecord, WalRecordType, WalTracker,
};

use crate::config::NamespaceConfig;
use crate::item::{ItemData, ItemsContainer};

/// Versions of the N-buffered system records.
#[derive(Debug, Clone, Copy, Default)]
struct SysRecordVersions {
    tags: u64,
    indexes: u64,
    schema: u64,
    repl: u64,
}

/// Select/update counters backing `get_perf_stat`; atomic so reads can
/// bump them under the shared lock.
#[derive(Debug, Default)]
pub struct PerfCounters {
    selects: std::sync::atomic::AtomicU64,
    selects_us: std::sync::atomic::AtomicU64,
    updates: std::sync::atomic::AtomicU64,
    updates_us: std::sync::atomic::AtomicU64,
}

/// Point-in-time perf snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PerfStat {
    pub selects: u64,
    pub selects_us: u64,
    pub updates: u64,
    pub updates_us: u64,
}

impl PerfCounters {
    pub fn on_select(&self, us: u64) {
        use std::sync::atomic::Ordering;
        self.selects.fetch_add(1, Ordering::Relaxed);
        self.selects_us.fetch_add(us, Ordering::Relaxed);
    }

    pub fn on_update(&self, us: u64) {
        use std::sync::atomic::Ordering;
        self.updates.fetch_add(1, Ordering::Relaxed);
        self.updates_us.fetch_add(us, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> PerfStat {
        use std::sync::atomic::Ordering;
        PerfStat {
            selects: self.selects.load(Ordering::Relaxed),
            selects_us: self.selects_us.load(Ordering::Relaxed),
            updates: self.updates.load(Ordering::Relaxed),
            updates_us: self.updates_us.load(Ordering::Relaxed),
        }
    }

    fn from_snapshot(stat: PerfStat) -> Self {
        use std::sync::atomic::AtomicU64;
        Self {
            selects: AtomicU64::new(stat.selects),
            selects_us: AtomicU64::new(stat.selects_us),
            updates: AtomicU64::new(stat.updates),
            updates_us: AtomicU64::new(stat.updates_us),
        }
    }
}

/// Memory accounting backing `get_mem_stat`.
#[derive(Debug, Clone, Default)]
pub struct MemStat {
    pub name: String,
    pub items_count: usize,
    pub items_size: usize,
    pub indexes_size: usize,
    pub wal_size: usize,
    pub strings_held: usize,
}

/// How a field name used in a query resolves.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldLookup {
    /// A declared index.
    Index(usize),
    /// A raw json path (comparator walk).
    Path(String),
}

pub struct NamespaceImpl {
    name: String,
    pub config: NamespaceConfig,
    pub payload_type: PayloadType,
    pub tags: TagsMatcher,
    pub indexes: Vec<Index>,
    index_names: HashMap<String, usize>,
    pk_index: Option<usize>,
    pub items: ItemsContainer,
    pub wal: WalTracker,
    pub repl: ReplicationState,
    pub schema: Option<Value>,
    storage: Option<Arc<dyn Storage>>,
    pub observers: ObserverRegistry,
    /// `SELECT COUNT(*)` cache keyed by the canonical filter tree.
    pub query_cache: Mutex<LruCache<u64, usize>>,
    /// Join pre-result cache keyed by the serialized right-side query.
    pub join_cache: Mutex<LruCache<u64, Vec<IdType>>>,
    strings_holder: StringsHolder,
    old_holders: VecDeque<StringsHolder>,
    sys_versions: SysRecordVersions,
    pub perf: PerfCounters,
    /// Set once background optimization has built sort orders.
    sort_orders_built: bool,
    last_update: Instant,
    /// Temporary namespaces skip observer notification and storage.
    pub temporary: bool,
}

impl NamespaceImpl {
    #[must_use]
    pub fn new(name: impl Into<String>, config: NamespaceConfig, server_id: i16) -> Self {
        let name = name.into();
        info!(namespace = %name, workers = config.optimization_sort_workers, "namespace created");
        Self {
            payload_type: PayloadType::new(name.clone()),
            tags: TagsMatcher::new(),
            indexes: Vec::new(),
            index_names: HashMap::new(),
            pk_index: None,
            items: ItemsContainer::new(),
            wal: WalTracker::new(config.wal_size, server_id),
            repl: ReplicationState::default(),
            schema: None,
            storage: None,
            observers: ObserverRegistry::new(),
            query_cache: Mutex::new(LruCache::new(config.query_cache_size)),
            join_cache: Mutex::new(LruCache::new(config.join_cache_size)),
            strings_holder: StringsHolder::new(),
            old_holders: VecDeque::new(),
            sys_versions: SysRecordVersions::default(),
            perf: PerfCounters::default(),
            sort_orders_built: false,
            last_update: Instant::now(),
            temporary: false,
            config,
            name,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Copy-on-write clone: shares nothing mutable with the source.
    #[must_use]
    pub fn clone_for_commit(&self) -> Self {
        Self {
            name: self.name.clone(),
            config: self.config.clone(),
            payload_type: self.payload_type.clone(),
            tags: self.tags.clone(),
            indexes: self.indexes.clone(),
            index_names: self.index_names.clone(),
            pk_index: self.pk_index,
            items: self.items.clone(),
            wal: self.wal.clone(),
            repl: self.repl.clone(),
            schema: self.schema.clone(),
            storage: self.storage.clone(),
            observers: self.observers.clone(),
            query_cache: Mutex::new(LruCache::new(self.config.query_cache_size)),
            join_cache: Mutex::new(LruCache::new(self.config.join_cache_size)),
            strings_holder: StringsHolder::new(),
            old_holders: VecDeque::new(),
            sys_versions: self.sys_versions,
            perf: PerfCounters::from_snapshot(self.perf.snapshot()),
            sort_orders_built: false,
            last_update: Instant::now(),
            temporary: self.temporary,
        }
    }

    // -- index management ---------------------------------------------------

    /// Resolve a query field name.
    #[must_use]
    pub fn lookup_field(&self, name: &str) -> FieldLookup {
        match self.index_names.get(name) {
            Some(idx) => FieldLookup::Index(*idx),
            None => FieldLookup::Path(name.to_owned()),
        }
    }

    #[must_use]
    pub fn index_by_name(&self, name: &str) -> Option<&Index> {
        self.index_names.get(name).map(|idx| &self.indexes[*idx])
    }

    #[must_use]
    pub fn pk_index(&self) -> Option<usize> {
        self.pk_index
    }

    /// Sort-order id of an index (position + 1); 0 for unordered ones.
    #[must_use]
    pub fn sort_id_of(&self, index_pos: usize) -> SortType {
        if self.sort_orders_built && self.indexes[index_pos].is_ordered() {
            (index_pos + 1) as SortType
        } else {
            0
        }
    }

    pub fn add_index(&mut self, def: IndexDef) -> Result<()> {
        def.validate()?;
        if let Some(existing) = self.index_by_name(&def.name) {
            if existing.def == def {
                return Ok(());
            }
            return Err(VellumError::conflict(format!(
                "index '{}' already exists with different settings",
                def.name
            )));
        }
        let non_composite = self.indexes.iter().filter(|i| !i.def.is_composite()).count();
        if !def.is_composite() && non_composite >= MAX_INDEXES {
            return Err(VellumError::conflict(format!(
                "too many indexes in namespace '{}' (max {MAX_INDEXES})",
                self.name
            )));
        }
        if def.opts.pk {
            if let Some(pk) = self.pk_index {
                return Err(VellumError::conflict(format!(
                    "PK index already exists: '{}'",
                    self.indexes[pk].def.name
                )));
            }
        }

        let fields = self.build_fields_set(&def)?;
        let adds_payload_field = !def.is_composite() && !def.opts.sparse && !def.index_type.is_fulltext();
        if adds_payload_field {
            let field = self.payload_type.add_field(PayloadFieldType {
                name: def.name.clone(),
                kv_type: def.field_type,
                // geo points are stored as two coordinates per slot
                is_array: def.opts.array || def.index_type == IndexType::Rtree,
                json_paths: def.json_paths.clone(),
            })?;
            // grow existing payloads and backfill the new slot
            let num_fields = self.payload_type.num_fields();
            let ids: Vec<IdType> = self.items.iter().map(|(id, _)| id).collect();
            for id in ids {
                let json_paths = self.payload_type.field(field).json_paths.clone();
                let kv_type = self.payload_type.field(field).kv_type;
                if let Some(item) = self.items.get_mut(id) {
                    item.payload.resize(num_fields);
                    let mut values = VariantArray::new();
                    for path in &json_paths {
                        values.extend(extract_json_path(&item.doc, path));
                    }
                    let values = convert_values(&values, kv_type).unwrap_or_default();
                    item.payload.set(field, values);
                }
            }
        }

        let mut index = Index::new(def.clone(), fields)?;
        // feed existing rows
        let ids: Vec<IdType> = self.items.iter().map(|(id, _)| id).collect();
        for id in ids {
            let Some(item) = self.items.get(id) else { continue };
            let doc = item.doc.clone();
            let payload = item.payload.clone();
            if index.is_fulltext() {
                index.upsert_text(id, fulltext_texts(&index, &doc))?;
            } else {
                let keys = index_keys(&index, &payload, &doc);
                index.upsert(&keys, id)?;
            }
        }

        let pos = self.indexes.len();
        if def.opts.pk {
            self.pk_index = Some(pos);
        }
        self.index_names.insert(def.name.clone(), pos);
        self.indexes.push(index);
        self.sort_orders_built = false;

        let data = serde_json::to_vec(&def).expect("index def serializes");
        self.wal_append(WalRecordType::IndexAdd, data, Lsn::EMPTY);
        self.persist_index_defs();
        self.on_modified();
        debug!(namespace = %self.name, index = %def.name, "index added");
        Ok(())
    }

    pub fn update_index(&mut self, def: IndexDef) -> Result<()> {
        if self.index_by_name(&def.name).is_none() {
            return Err(VellumError::not_found(format!(
                "index '{}' does not exist",
                def.name
            )));
        }
        self.drop_index_inner(&def.name, WalRecordType::IndexUpdate)?;
        self.add_index(def)
    }

    pub fn drop_index(&mut self, name: &str) -> Result<()> {
        self.drop_index_inner(name, WalRecordType::IndexDrop)
    }

    fn drop_index_inner(&mut self, name: &str, wal_kind: WalRecordType) -> Result<()> {
        let Some(&pos) = self.index_names.get(name) else {
            return Err(VellumError::not_found(format!(
                "index '{name}' does not exist"
            )));
        };
        // a composite referencing this index pins it
        for index in &self.indexes {
            if index.def.is_composite() && index.def.components().contains(&name) {
                return Err(VellumError::conflict(format!(
                    "index '{name}' is a component of composite index '{}'",
                    index.def.name
                )));
            }
        }
        let def = self.indexes[pos].def.clone();
        let dropped_field = (!def.is_composite() && !def.opts.sparse && !def.index_type.is_fulltext())
            .then(|| self.payload_type.field_by_name(name))
            .flatten();

        self.indexes.remove(pos);
        self.index_names.remove(name);
        // renumber positions above the removed index
        for idx in self.index_names.values_mut() {
            if *idx > pos {
                *idx -= 1;
            }
        }
        self.pk_index = match self.pk_index {
            Some(p) if p == pos => None,
            Some(p) if p > pos => Some(p - 1),
            other => other,
        };

        if let Some(field) = dropped_field {
            self.payload_type.drop_field(field)?;
            let ids: Vec<IdType> = self.items.iter().map(|(id, _)| id).collect();
            for id in ids {
                if let Some(item) = self.items.get_mut(id) {
                    item.payload.remove_field(field);
                }
            }
            for index in &mut self.indexes {
                index.fields.shift_after_drop(field);
            }
        }

        self.sort_orders_built = false;
        self.wal_append(wal_kind, name.as_bytes().to_vec(), Lsn::EMPTY);
        self.persist_index_defs();
        self.on_modified();
        debug!(namespace = %self.name, index = name, "index dropped");
        Ok(())
    }

    fn build_fields_set(&mut self, def: &IndexDef) -> Result<FieldsSet> {
        if def.is_composite() {
            let mut fields = FieldsSet::new();
            for component in def.components() {
                match self.index_names.get(component) {
                    Some(&idx) => {
                        let cdef = &self.indexes[idx].def;
                        if cdef.opts.array && !def.index_type.is_fulltext() {
                            return Err(VellumError::params(format!(
                                "array index '{component}' can not be a composite component"
                            )));
                        }
                        match self.payload_type.field_by_name(component) {
                            Some(field) => fields.push(FieldRef::Field(field)),
                            None => fields.push(FieldRef::JsonPath(
                                cdef.json_paths.first().cloned().unwrap_or_else(|| {
                                    component.to_owned()
                                }),
                            )),
                        }
                    }
                    // json-path pseudo-field
                    None => fields.push(FieldRef::JsonPath(component.to_owned())),
                }
            }
            return Ok(fields);
        }
        if def.opts.sparse || def.index_type.is_fulltext() {
            let mut fields = FieldsSet::new();
            for path in &def.json_paths {
                fields.push(FieldRef::JsonPath(path.clone()));
            }
            return Ok(fields);
        }
        // regular index: the payload field is allocated by the caller
        Ok(FieldsSet::single(self.payload_type.num_fields()))
    }

    // -- write path ---------------------------------------------------------

    /// Insert or update one document. Returns `(id, existed_before)`.
    pub fn upsert_item(
        &mut self,
        doc: Value,
        from_replication: bool,
        origin_lsn: Lsn,
    ) -> Result<(IdType, bool)> {
        self.repl.check_write(from_replication)?;
        let pk_pos = self
            .pk_index
            .ok_or_else(|| VellumError::params(format!(
                "namespace '{}' has no PK index",
                self.name
            )))?;

        // locate an existing row through the PK index
        let pk_keys = {
            let pk = &self.indexes[pk_pos];
            let payload = self.build_payload(&doc)?;
            index_keys(pk, &payload, &doc)
        };
        if pk_keys.is_empty() {
            return Err(VellumError::params(format!(
                "document has no value for PK index '{}'",
                self.indexes[pk_pos].def.name
            )));
        }
        let existing = self.find_by_pk(&pk_keys)?;
        let id = match existing {
            Some(id) => id,
            None => self.items.alloc(),
        };

        let payload = self.build_payload(&doc)?;
        let cjson = cjson::encode(&doc, &mut self.tags)?;
        let lsn = self.wal_lsn(WalRecordType::ItemUpdate, cjson.clone(), origin_lsn);

        let mut item = ItemData {
            payload,
            doc,
            cjson,
            free: false,
        };
        item.payload.lsn = lsn;
        let payload_hash = item.payload.hash();

        if existing.is_some() {
            let old_hash = self
                .items
                .get(id)
                .map(|old| old.payload.hash())
                .unwrap_or_default();
            self.update_row_keys(id, &item)?;
            self.repl.toggle_item_hash(old_hash);
        } else {
            self.insert_row_keys(id, &item)?;
        }
        self.items.place_at(id, item);

        self.repl.toggle_item_hash(payload_hash);
        self.repl.data_count = self.items.len();
        self.repl.last_lsn = lsn;
        if !from_replication {
            self.repl.last_self_lsn = lsn;
        }

        if let Some(storage) = &self.storage {
            let item = self.items.get(id).expect("just placed");
            let mut blob = Vec::with_capacity(8 + item.cjson.len());
            blob.extend_from_slice(&lsn.into_raw().to_le_bytes());
            blob.extend_from_slice(&item.cjson);
            storage.write(&item_key(id), &blob);
        }
        if self.tags.is_updated() {
            self.persist_tags();
        }
        self.on_modified();
        Ok((id, existing.is_some()))
    }

    /// Insert only: fails with `Conflict` when the PK already exists.
    pub fn insert_item(&mut self, doc: Value) -> Result<IdType> {
        let pk_keys = self.pk_keys_of(&doc)?;
        if self.find_by_pk(&pk_keys)?.is_some() {
            return Err(VellumError::conflict(format!(
                "item with this PK already exists in '{}'",
                self.name
            )));
        }
        Ok(self.upsert_item(doc, false, Lsn::EMPTY)?.0)
    }

    /// Update only: fails with `NotFound` when the PK does not exist.
    pub fn update_item(&mut self, doc: Value) -> Result<IdType> {
        let pk_keys = self.pk_keys_of(&doc)?;
        if self.find_by_pk(&pk_keys)?.is_none() {
            return Err(VellumError::not_found(format!(
                "item with this PK does not exist in '{}'",
                self.name
            )));
        }
        Ok(self.upsert_item(doc, false, Lsn::EMPTY)?.0)
    }

    /// Delete by document PK; absent rows are a silent no-op.
    pub fn delete_item(
        &mut self,
        doc: &Value,
        from_replication: bool,
        origin_lsn: Lsn,
    ) -> Result<Option<IdType>> {
        self.repl.check_write(from_replication)?;
        let pk_keys = self.pk_keys_of(doc)?;
        let Some(id) = self.find_by_pk(&pk_keys)? else {
            return Ok(None);
        };
        self.delete_id(id, origin_lsn)?;
        Ok(Some(id))
    }

    /// Delete one row by id.
    pub fn delete_id(&mut self, id: IdType, origin_lsn: Lsn) -> Result<()> {
        self.delete_id_internal(id, origin_lsn, true)
    }

    /// Delete one row; statement-replicated queries suppress the
    /// per-row WAL record.
    pub(crate) fn delete_id_internal(
        &mut self,
        id: IdType,
        origin_lsn: Lsn,
        emit_wal: bool,
    ) -> Result<()> {
        let Some(item) = self.items.get(id) else {
            return Err(VellumError::not_found(format!(
                "item {id} is not present in '{}'",
                self.name
            )));
        };
        let payload_hash = item.payload.hash();
        let cjson = item.cjson.clone();

        self.delete_row_keys(id)?;
        self.items.free(id);

        if emit_wal {
            let lsn = self.wal_lsn(WalRecordType::ItemDelete, cjson, origin_lsn);
            self.repl.last_lsn = lsn;
        }
        self.repl.toggle_item_hash(payload_hash);
        self.repl.data_count = self.items.len();

        if let Some(storage) = &self.storage {
            storage.remove(&item_key(id));
        }
        self.on_modified();
        Ok(())
    }

    pub fn truncate(&mut self) -> Result<()> {
        self.repl.check_write(false)?;
        let ids: Vec<IdType> = self.items.iter().map(|(id, _)| id).collect();
        for id in ids {
            self.delete_row_keys(id)?;
            if let Some(storage) = &self.storage {
                storage.remove(&item_key(id));
            }
        }
        self.items.clear();
        self.repl.data_hash = 0;
        self.repl.data_count = 0;
        let lsn = self.wal_lsn(WalRecordType::Truncate, Vec::new(), Lsn::EMPTY);
        self.repl.last_lsn = lsn;
        self.on_modified();
        info!(namespace = %self.name, "truncated");
        Ok(())
    }

    fn pk_keys_of(&self, doc: &Value) -> Result<VariantArray> {
        let pk_pos = self
            .pk_index
            .ok_or_else(|| VellumError::params(format!(
                "namespace '{}' has no PK index",
                self.name
            )))?;
        let pk = &self.indexes[pk_pos];
        let mut keys = VariantArray::new();
        for path in &pk.def.json_paths {
            keys.extend(extract_json_path(doc, path));
        }
        if keys.is_empty() {
            return Err(VellumError::params(format!(
                "document has no value for PK index '{}'",
                pk.def.name
            )));
        }
        convert_values(&keys, pk.def.field_type)
    }

    fn find_by_pk(&self, pk_keys: &VariantArray) -> Result<Option<IdType>> {
        let pk_pos = self.pk_index.expect("checked by callers");
        let pk = &self.indexes[pk_pos];
        let mut opts = SelectOpts::new(self.items.len());
        opts.disable_idset_cache = true;
        let results = pk.select_key(pk_keys, vellum_ast::CondType::Eq, 0, opts)?;
        for res in &results {
            for single in &res.results {
                if let vellum_index::SingleKeyResult::Ids(ids) = single {
                    if let Some(id) = ids.iter().next() {
                        return Ok(Some(id));
                    }
                }
            }
        }
        Ok(None)
    }

    /// Build the payload slots of a document.
    pub fn build_payload(&self, doc: &Value) -> Result<vellum_types::PayloadValue> {
        let mut payload = vellum_types::PayloadValue::new(self.payload_type.num_fields());
        for field in 1..self.payload_type.num_fields() {
            let ftype = self.payload_type.field(field);
            let mut values = VariantArray::new();
            for path in &ftype.json_paths {
                values.extend(extract_json_path(doc, path));
            }
            let values = convert_values(&values, ftype.kv_type)?;
            if values.len() > 1 && !ftype.is_array {
                return Err(VellumError::params(format!(
                    "field '{}' is not an array but got {} values",
                    ftype.name,
                    values.len()
                )));
            }
            payload.set(field, values);
        }
        Ok(payload)
    }

    pub(crate) fn insert_row_keys(&mut self, id: IdType, item: &ItemData) -> Result<()> {
        for pos in 0..self.indexes.len() {
            let (keys, texts) = {
                let index = &self.indexes[pos];
                if index.is_fulltext() {
                    (VariantArray::new(), Some(fulltext_texts(index, &item.doc)))
                } else {
                    (index_keys(index, &item.payload, &item.doc), None)
                }
            };
            let index = &mut self.indexes[pos];
            match texts {
                Some(texts) => index.upsert_text(id, texts)?,
                None => index.upsert(&keys, id)?,
            }
        }
        Ok(())
    }

    /// Re-key one row in place. Indexes whose key set did not change
    /// are skipped entirely (the composite rebuild-skip generalized to
    /// every kind via a before/after key comparison).
    fn update_row_keys(&mut self, id: IdType, new_item: &ItemData) -> Result<()> {
        let Some(old) = self.items.get(id) else {
            return self.insert_row_keys(id, new_item);
        };
        let old_doc = old.doc.clone();
        let old_payload = old.payload.clone();
        for pos in 0..self.indexes.len() {
            let (old_keys, new_keys, texts) = {
                let index = &self.indexes[pos];
                if index.is_fulltext() {
                    (
                        VariantArray::new(),
                        VariantArray::new(),
                        Some(fulltext_texts(index, &new_item.doc)),
                    )
                } else {
                    (
                        index_keys(index, &old_payload, &old_doc),
                        index_keys(index, &new_item.payload, &new_item.doc),
                        None,
                    )
                }
            };
            if let Some(texts) = texts {
                self.indexes[pos].upsert_text(id, texts)?;
                continue;
            }
            if old_keys == new_keys {
                continue;
            }
            self.indexes[pos].delete(&old_keys, id, &mut self.strings_holder)?;
            self.indexes[pos].upsert(&new_keys, id)?;
        }
        Ok(())
    }

    pub(crate) fn delete_row_keys(&mut self, id: IdType) -> Result<()> {
        let Some(item) = self.items.get(id) else {
            return Ok(());
        };
        let doc = item.doc.clone();
        let payload = item.payload.clone();
        for pos in 0..self.indexes.len() {
            let index = &mut self.indexes[pos];
            if index.is_fulltext() {
                index.delete(&VariantArray::new(), id, &mut self.strings_holder)?;
            } else {
                let keys = {
                    let index = &self.indexes[pos];
                    index_keys(index, &payload, &doc)
                };
                self.indexes[pos].delete(&keys, id, &mut self.strings_holder)?;
            }
        }
        Ok(())
    }

    pub(crate) fn storage_write_item(&self, id: IdType, blob: &[u8]) {
        if let Some(storage) = &self.storage {
            storage.write(&item_key(id), blob);
        }
    }

    fn wal_lsn(&mut self, kind: WalRecordType, data: Vec<u8>, origin_lsn: Lsn) -> Lsn {
        self.wal_append(kind, data, origin_lsn)
    }

    /// Append to the WAL and notify observers (non-temporary namespaces
    /// with a non-empty observer list only).
    pub fn wal_append(&mut self, kind: WalRecordType, data: Vec<u8>, origin_lsn: Lsn) -> Lsn {
        let lsn = if origin_lsn.is_empty() {
            self.wal.add(kind, data.clone())
        } else {
            self.wal.add_replicated(kind, data.clone(), origin_lsn)
        };
        if !self.temporary && !self.observers.is_empty() {
            let record = WalRecord { kind, data, lsn };
            self.observers.notify(lsn, origin_lsn, &self.name, &record);
        }
        lsn
    }

    /// Every mutation clears the caches and bumps the idle clock.
    pub fn on_modified(&mut self) {
        self.query_cache.lock().clear();
        self.join_cache.lock().clear();
        for index in &self.indexes {
            index.clear_cache();
        }
        self.last_update = Instant::now();
    }

    // -- meta ----------------------------------------------------------------

    pub fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let Some(storage) = &self.storage else {
            return Ok(None);
        };
        let raw = storage.read(format!("{META_PREFIX}{key}").as_bytes())?;
        Ok(raw.map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    pub fn put_meta(&mut self, key: &str, value: &str) -> Result<()> {
        if let Some(storage) = &self.storage {
            storage.write_sync(format!("{META_PREFIX}{key}").as_bytes(), value.as_bytes())?;
        }
        self.wal_append(
            WalRecordType::PutMeta,
            format!("{key}\u{0}{value}").into_bytes(),
            Lsn::EMPTY,
        );
        Ok(())
    }

    pub fn enum_meta(&self) -> Result<Vec<String>> {
        let Some(storage) = &self.storage else {
            return Ok(Vec::new());
        };
        Ok(storage
            .cursor(META_PREFIX.as_bytes())
            .into_iter()
            .map(|(key, _)| String::from_utf8_lossy(&key[META_PREFIX.len()..]).into_owned())
            .collect())
    }

    pub fn set_schema(&mut self, schema: Value) -> Result<()> {
        let data = serde_json::to_vec(&schema).expect("schema serializes");
        self.schema = Some(schema);
        self.wal_append(WalRecordType::SetSchema, data, Lsn::EMPTY);
        self.persist_schema();
        Ok(())
    }

    #[must_use]
    pub fn get_schema(&self) -> Option<&Value> {
        self.schema.as_ref()
    }

    // -- storage -------------------------------------------------------------

    /// Attach a byte store and load namespace contents from it.
    pub fn attach_storage(&mut self, storage: Arc<dyn Storage>) -> Result<()> {
        // indexes record carries the format header
        if let Some((version, data)) = load_latest_sys_record(storage.as_ref(), INDEXES_PREFIX)? {
            check_storage_header(&data)?;
            self.sys_versions.indexes = version + 1;
            let defs: Vec<IndexDef> = serde_json::from_slice(&data[8..])
                .map_err(|e| VellumError::not_valid(format!("bad index defs: {e}")))?;
            for def in defs {
                self.add_index(def)?;
            }
        }
        if let Some((version, data)) = load_latest_sys_record(storage.as_ref(), TAGS_PREFIX)? {
            self.sys_versions.tags = version + 1;
            let names: Vec<String> = serde_json::from_slice(&data)
                .map_err(|e| VellumError::not_valid(format!("bad tags snapshot: {e}")))?;
            let mut tags = TagsMatcher::new();
            for name in &names {
                tags.name_to_tag_mut(name)?;
            }
            self.tags = tags;
            self.tags.clear_updated();
        }
        if let Some((version, data)) = load_latest_sys_record(storage.as_ref(), SCHEMA_PREFIX)? {
            self.sys_versions.schema = version + 1;
            self.schema = serde_json::from_slice(&data).ok();
        }
        if let Some((version, data)) = load_latest_sys_record(storage.as_ref(), REPL_PREFIX)? {
            self.sys_versions.repl = version + 1;
            self.repl = ReplicationState::from_json(&String::from_utf8_lossy(&data))?;
        }

        // items, in id order
        let mut decode_errors = 0usize;
        for (key, blob) in storage.cursor(&[vellum_storage::ITEM_PREFIX]) {
            if key.len() != 5 || blob.len() < 8 {
                decode_errors += 1;
                continue;
            }
            let id = IdType::from_be_bytes(key[1..5].try_into().expect("length checked"));
            let lsn = Lsn::from_raw(i64::from_le_bytes(blob[..8].try_into().expect("checked")));
            match cjson::decode(&blob[8..], &self.tags) {
                Ok(doc) => {
                    let payload = match self.build_payload(&doc) {
                        Ok(p) => p,
                        Err(err) => {
                            warn!(namespace = %self.name, id, %err, "skipping undecodable item");
                            decode_errors += 1;
                            continue;
                        }
                    };
                    let mut item = ItemData {
                        payload,
                        doc,
                        cjson: blob[8..].to_vec(),
                        free: false,
                    };
                    item.payload.lsn = lsn;
                    let hash = item.payload.hash();
                    self.items.place_at(id, item);
                    let item_ref = self.items.get(id).expect("just placed").clone();
                    self.insert_row_keys(id, &item_ref)?;
                    self.repl.toggle_item_hash(hash);
                }
                Err(err) => {
                    warn!(namespace = %self.name, id, %err, "skipping undecodable item");
                    decode_errors += 1;
                }
            }
        }
        if decode_errors > 0 {
            warn!(namespace = %self.name, decode_errors, "items skipped during storage load");
        }
        self.repl.data_count = self.items.len();
        let (min, max) = self.items.lsn_window();
        self.wal.init(min, max);
        self.storage = Some(storage);
        info!(namespace = %self.name, items = self.items.len(), "storage attached");
        Ok(())
    }

    #[must_use]
    pub fn has_storage(&self) -> bool {
        self.storage.is_some()
    }

    pub fn detach_storage(&mut self) {
        self.storage = None;
    }

    pub fn flush_storage(&self) -> Result<()> {
        if let Some(storage) = &self.storage {
            storage.flush()?;
        }
        Ok(())
    }

    pub fn destroy_storage(&mut self) -> Result<()> {
        if let Some(storage) = self.storage.take() {
            storage.destroy()?;
        }
        Ok(())
    }

    fn persist_index_defs(&mut self) {
        let Some(storage) = &self.storage else { return };
        let defs: Vec<&IndexDef> = self.indexes.iter().map(|i| &i.def).collect();
        let mut data = storage_header().to_vec();
        data.extend_from_slice(&serde_json::to_vec(&defs).expect("defs serialize"));
        if let Err(err) =
            write_sys_record(storage.as_ref(), INDEXES_PREFIX, self.sys_versions.indexes, &data)
        {
            warn!(namespace = %self.name, %err, "failed to persist index defs");
        }
        self.sys_versions.indexes += 1;
    }

    fn persist_tags(&mut self) {
        let Some(storage) = &self.storage else { return };
        let names: Vec<&str> = (1..=self.tags.len())
            .filter_map(|tag| self.tags.tag_to_name(tag as u16))
            .collect();
        let data = serde_json::to_vec(&names).expect("tags serialize");
        if let Err(err) =
            write_sys_record(storage.as_ref(), TAGS_PREFIX, self.sys_versions.tags, &data)
        {
            warn!(namespace = %self.name, %err, "failed to persist tags");
        }
        self.sys_versions.tags += 1;
        self.tags.clear_updated();
    }

    fn persist_schema(&mut self) {
        let Some(storage) = &self.storage else { return };
        let Some(schema) = &self.schema else { return };
        let data = serde_json::to_vec(schema).expect("schema serializes");
        if let Err(err) =
            write_sys_record(storage.as_ref(), SCHEMA_PREFIX, self.sys_versions.schema, &data)
        {
            warn!(namespace = %self.name, %err, "failed to persist schema");
        }
        self.sys_versions.schema += 1;
    }

    pub fn persist_repl_state(&mut self) {
        let Some(storage) = &self.storage else { return };
        let data = self.repl.to_json();
        if let Err(err) = write_sys_record(
            storage.as_ref(),
            REPL_PREFIX,
            self.sys_versions.repl,
            data.as_bytes(),
        ) {
            warn!(namespace = %self.name, %err, "failed to persist replication state");
        }
        self.sys_versions.repl += 1;
    }

    // -- background maintenance ---------------------------------------------

    /// Whether background optimization should run: an unbuilt index
    /// (pending fulltext rebuild) forces it, sort orders wait for the
    /// idle period.
    #[must_use]
    pub fn needs_optimization(&self) -> bool {
        if self.indexes.iter().any(|index| !index.is_built()) {
            return true;
        }
        !self.sort_orders_built
            && self.config.optimization_sort_workers > 0
            && self.last_update.elapsed().as_millis() as u64 >= self.config.optimization_timeout_ms
    }

    /// Commit pending index updates (fulltext rebuilds) and build sort
    /// orders for ordered indexes, using up to
    /// `optimization_sort_workers` threads.
    pub fn optimize_indexes(&mut self) {
        for index in &mut self.indexes {
            index.commit();
        }

        let capacity = self.items.capacity();
        let orders: Vec<(usize, Vec<IdType>)> = {
            let targets: Vec<(usize, &Index)> = self
                .indexes
                .iter()
                .enumerate()
                .filter(|(_, index)| index.is_ordered())
                .collect();
            if targets.is_empty() {
                self.sort_orders_built = true;
                return;
            }
            let workers = self
                .config
                .optimization_sort_workers
                .clamp(1, targets.len());
            std::thread::scope(|scope| {
                let mut handles = Vec::with_capacity(workers);
                for chunk in targets.chunks(targets.len().div_ceil(workers)) {
                    handles.push(scope.spawn(move || {
                        chunk
                            .iter()
                            .filter_map(|(pos, index)| {
                                index.ids_in_key_order().map(|ids| (*pos, ids))
                            })
                            .collect::<Vec<_>>()
                    }));
                }
                handles
                    .into_iter()
                    .flat_map(|h| h.join().expect("sort worker"))
                    .collect()
            })
        };

        for (pos, order) in orders {
            let mut id2ord = vec![u32::MAX; capacity];
            for (ord, id) in order.iter().enumerate() {
                if let Some(slot) = id2ord.get_mut(*id as usize) {
                    *slot = ord as u32;
                }
            }
            let sort_id = (pos + 1) as SortType;
            self.indexes[pos].update_sorted_ids(sort_id, &id2ord);
        }
        self.sort_orders_built = true;
        debug!(namespace = %self.name, "index optimization finished");
    }

    /// Evict rows whose ttl index timestamp expired.
    pub fn evict_expired(&mut self, now_unix: i64) -> Result<usize> {
        let mut expired: Vec<IdType> = Vec::new();
        for index in &self.indexes {
            if index.def.index_type != IndexType::Ttl {
                continue;
            }
            let Some(expire_after) = index.def.opts.expire_after else {
                continue;
            };
            expired.extend(index.expired_ids(now_unix - expire_after)?.iter());
        }
        expired.sort_unstable();
        expired.dedup();
        let count = expired.len();
        for id in expired {
            self.delete_id(id, Lsn::EMPTY)?;
        }
        Ok(count)
    }

    /// Rotate the active strings holder and sweep the old ones.
    pub fn sweep_strings(&mut self) -> usize {
        if !self.strings_holder.is_empty() {
            let full = std::mem::take(&mut self.strings_holder);
            self.old_holders.push_back(full);
        }
        let mut reclaimed = 0;
        for holder in &mut self.old_holders {
            reclaimed += holder.sweep();
        }
        self.old_holders.retain(|h| !h.is_empty());
        reclaimed
    }

    // -- stats ---------------------------------------------------------------

    #[must_use]
    pub fn mem_stat(&self) -> MemStat {
        MemStat {
            name: self.name.clone(),
            items_count: self.items.len(),
            items_size: self.items.mem_usage(),
            indexes_size: self.indexes.iter().map(Index::mem_usage).sum(),
            wal_size: self.wal.mem_usage(),
            strings_held: self.strings_holder.len()
                + self.old_holders.iter().map(StringsHolder::len).sum::<usize>(),
        }
    }
}

/// Extract the key values an index stores for one row.
#[must_use]
pub fn index_keys(index: &Index, payload: &vellum_types::PayloadValue, doc: &Value) -> VariantArray {
    use smallvec::smallvec;
    if index.def.is_composite() {
        return smallvec![composite_key(payload, Some(doc), &index.fields)];
    }
    let mut keys = VariantArray::new();
    for field in index.fields.iter() {
        match field {
            FieldRef::Field(idx) => {
                if *idx < payload.num_fields() {
                    keys.extend(payload.get(*idx).iter().cloned());
                }
            }
            FieldRef::JsonPath(path) => keys.extend(extract_json_path(doc, path)),
        }
    }
    keys
}

/// Collect the text of each fulltext field of a row.
#[must_use]
pub fn fulltext_texts(index: &Index, doc: &Value) -> Vec<String> {
    let paths: Vec<String> = if index.def.is_composite() {
        index.def.components().iter().map(|c| (*c).to_owned()).collect()
    } else {
        index.def.json_paths.clone()
    };
    paths
        .iter()
        .map(|path| {
            extract_json_path(doc, path)
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect()
}
