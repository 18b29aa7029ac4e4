//! The polymorphic index family and its select contract.

use std::hash::{Hash, Hasher};

use parking_lot::Mutex;
use tracing::debug;
use vellum_ast::CondType;
use vellum_error::{Result, VellumError};
use vellum_fulltext::{FtConfig, FtMergeInfo, FulltextIndex};
use vellum_types::{FieldRef, FieldsSet, IdType, SortType, Variant, VariantArray};
use xxhash_rust::xxh64::Xxh64;

use crate::comparator::{Comparator, FieldSource};
use crate::def::{IndexDef, IndexType};
use crate::idset::IdSet;
use crate::lru::LruCache;
use crate::map_index::MapIndex;
use crate::rtree::RtreeIndex;
use crate::select_result::{SelectKeyResult, SelectKeyResults, SingleKeyResult};
use crate::strings::StringsHolder;

/// Idset larger than this share of the namespace falls back to a
/// comparator on `Eq`/`Set`.
pub const MAX_SELECTIVITY_PERCENT: usize = 20;
/// `Any` on a distinct query enumerates buckets only below this count.
pub const MAX_IDS_FOR_DISTINCT: usize = 500;
/// Idset cache entries per index.
const IDSET_CACHE_CAPACITY: usize = 256;

/// Options the executor passes into every index select.
#[derive(Debug, Clone, Copy, Default)]
pub struct SelectOpts {
    pub items_count: usize,
    pub max_iterations: usize,
    pub distinct: bool,
    pub disable_idset_cache: bool,
    pub force_comparator: bool,
    pub unbuilt_sort_orders: bool,
    pub in_transaction: bool,
}

impl SelectOpts {
    #[must_use]
    pub fn new(items_count: usize) -> Self {
        Self {
            items_count,
            max_iterations: usize::MAX,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
enum CachedSelect {
    Ids(Vec<IdSet>),
    /// The selector decided a comparator walk wins; replay that choice.
    ScanWin,
}

#[derive(Debug, Clone)]
enum IndexVariant {
    Store,
    Map(MapIndex),
    Rtree(RtreeIndex),
    Fulltext(Box<FulltextIndex>),
}

/// One secondary index of a namespace.
#[derive(Debug)]
pub struct Index {
    pub def: IndexDef,
    /// Value sources: a payload field for regular indexes, several for
    /// composites, json paths for sparse ones.
    pub fields: FieldsSet,
    variant: IndexVariant,
    /// Ids whose key is null or absent (array and sparse kinds).
    empty_ids: IdSet,
    cache: Mutex<LruCache<u64, CachedSelect>>,
}

impl Clone for Index {
    /// Copy-on-write namespace clones share nothing mutable; the idset
    /// cache starts cold on the clone.
    fn clone(&self) -> Self {
        Self {
            def: self.def.clone(),
            fields: self.fields.clone(),
            variant: self.variant.clone(),
            empty_ids: self.empty_ids.clone(),
            cache: Mutex::new(LruCache::new(IDSET_CACHE_CAPACITY)),
        }
    }
}

impl Index {
    pub fn new(def: IndexDef, fields: FieldsSet) -> Result<Self> {
        def.validate()?;
        let variant = match def.index_type {
            IndexType::Store => IndexVariant::Store,
            IndexType::Hash => IndexVariant::Map(MapIndex::new(
                false,
                def.opts.collate.clone(),
                def.opts.pk,
            )),
            IndexType::Tree | IndexType::Ttl => IndexVariant::Map(MapIndex::new(
                true,
                def.opts.collate.clone(),
                def.opts.pk,
            )),
            IndexType::Rtree => IndexVariant::Rtree(RtreeIndex::new()),
            IndexType::FulltextFast | IndexType::FulltextFuzzy => {
                let cfg = match (&def.opts.config, def.index_type) {
                    (Some(json), _) => FtConfig::from_json(json)?,
                    (None, IndexType::FulltextFuzzy) => FtConfig::fuzzy(),
                    (None, _) => FtConfig::default(),
                };
                let field_names: Vec<String> = if def.is_composite() {
                    def.components().iter().map(|c| (*c).to_owned()).collect()
                } else {
                    vec![def.name.clone()]
                };
                IndexVariant::Fulltext(Box::new(FulltextIndex::new(cfg, field_names)))
            }
        };
        Ok(Self {
            def,
            fields,
            variant,
            empty_ids: IdSet::new(),
            cache: Mutex::new(LruCache::new(IDSET_CACHE_CAPACITY)),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.def.name
    }

    #[must_use]
    pub fn is_ordered(&self) -> bool {
        self.def.index_type.is_ordered()
    }

    #[must_use]
    pub fn is_fulltext(&self) -> bool {
        self.def.index_type.is_fulltext()
    }

    /// Whether index buckets keep string memory alive.
    #[must_use]
    pub fn holds_strings(&self) -> bool {
        matches!(self.variant, IndexVariant::Map(_))
            && matches!(self.def.field_type, vellum_types::KvType::String)
    }

    pub fn clear_cache(&self) {
        self.cache.lock().clear();
    }

    // -- write path ---------------------------------------------------------

    /// Insert the key(s) of one row. Empty or null keys land in the
    /// empty-ids bucket; array keys upsert per element.
    pub fn upsert(&mut self, keys: &VariantArray, id: IdType) -> Result<()> {
        self.clear_cache();
        match &mut self.variant {
            IndexVariant::Store => Ok(()),
            IndexVariant::Rtree(rtree) => {
                if keys.is_empty() {
                    self.empty_ids.add(id);
                    Ok(())
                } else {
                    rtree.upsert(keys, id)
                }
            }
            IndexVariant::Map(map) => {
                let live: Vec<&Variant> = keys.iter().filter(|k| !k.is_null()).collect();
                if live.is_empty() {
                    self.empty_ids.add(id);
                    return Ok(());
                }
                for key in live {
                    let converted = convert_key(key, &self.def)?;
                    map.upsert(&converted, id, &self.def.name)?;
                }
                Ok(())
            }
            IndexVariant::Fulltext(_) => Err(VellumError::logic(format!(
                "fulltext index '{}' takes document texts, not keys",
                self.def.name
            ))),
        }
    }

    /// Remove the key(s) of one row; emptied buckets donate their string
    /// keys to `holder`.
    pub fn delete(
        &mut self,
        keys: &VariantArray,
        id: IdType,
        holder: &mut StringsHolder,
    ) -> Result<()> {
        self.clear_cache();
        let lenient = self.def.opts.array || self.def.opts.sparse;
        match &mut self.variant {
            IndexVariant::Store => Ok(()),
            IndexVariant::Rtree(rtree) => {
                self.empty_ids.remove(id);
                rtree.delete(id)
            }
            IndexVariant::Map(map) => {
                let live: Vec<&Variant> = keys.iter().filter(|k| !k.is_null()).collect();
                if live.is_empty() {
                    self.empty_ids.remove(id);
                    return Ok(());
                }
                for key in live {
                    let converted = convert_key(key, &self.def)?;
                    map.delete(&converted, id, !lenient, holder, &self.def.name)?;
                }
                Ok(())
            }
            IndexVariant::Fulltext(ft) => {
                ft.delete_doc(id);
                Ok(())
            }
        }
    }

    /// Buffer the text fields of a row for a fulltext kind.
    pub fn upsert_text(&mut self, id: IdType, fields: Vec<String>) -> Result<()> {
        self.clear_cache();
        match &mut self.variant {
            IndexVariant::Fulltext(ft) => {
                ft.upsert_doc(id, fields);
                Ok(())
            }
            _ => Err(VellumError::logic(format!(
                "index '{}' is not fulltext",
                self.def.name
            ))),
        }
    }

    /// Ingest pending updates (fulltext rebuild).
    pub fn commit(&mut self) {
        if let IndexVariant::Fulltext(ft) = &mut self.variant {
            ft.commit();
        }
    }

    #[must_use]
    pub fn is_built(&self) -> bool {
        match &self.variant {
            IndexVariant::Fulltext(ft) => ft.is_built(),
            _ => true,
        }
    }

    // -- read path ----------------------------------------------------------

    /// Build the post-filter comparator for this index.
    #[must_use]
    pub fn comparator(&self, cond: CondType, values: VariantArray) -> Comparator {
        let source = match self.fields.iter().next() {
            Some(FieldRef::Field(idx)) => FieldSource::Field(*idx),
            Some(FieldRef::JsonPath(path)) => FieldSource::JsonPath(path.clone()),
            None => FieldSource::JsonPath(self.def.name.clone()),
        };
        Comparator::new(source, cond, values, self.def.opts.collate.clone())
    }

    /// Answer one query condition.
    pub fn select_key(
        &self,
        keys: &VariantArray,
        cond: CondType,
        sort_id: SortType,
        opts: SelectOpts,
    ) -> Result<SelectKeyResults> {
        if opts.force_comparator {
            return Ok(vec![SelectKeyResult::from_comparator(
                self.comparator(cond, keys.clone()),
            )]);
        }
        match &self.variant {
            IndexVariant::Store => Ok(vec![SelectKeyResult::from_comparator(
                self.comparator(cond, keys.clone()),
            )]),
            IndexVariant::Rtree(rtree) => match cond {
                CondType::DWithin => Ok(vec![rtree.dwithin(keys)?]),
                _ => Err(VellumError::params(format!(
                    "index '{}' supports only DWithin",
                    self.def.name
                ))),
            },
            IndexVariant::Fulltext(_) => Err(VellumError::query_exec(format!(
                "fulltext index '{}' answers text queries only",
                self.def.name
            ))),
            IndexVariant::Map(map) => self.select_map(map, keys, cond, sort_id, opts),
        }
    }

    fn select_map(
        &self,
        map: &MapIndex,
        keys: &VariantArray,
        cond: CondType,
        sort_id: SortType,
        opts: SelectOpts,
    ) -> Result<SelectKeyResults> {
        match cond {
            CondType::Empty => {
                if !self.def.opts.array && !self.def.opts.sparse {
                    return Err(VellumError::params(
                        "the 'is NULL' condition is supported only by sparse or array indexes",
                    ));
                }
                Ok(vec![SelectKeyResult::from_ids(self.empty_ids.clone())])
            }
            CondType::Any => {
                if opts.distinct && map.keys_count() < MAX_IDS_FOR_DISTINCT {
                    Ok(vec![map.collect_all(sort_id)])
                } else {
                    Ok(vec![SelectKeyResult::from_comparator(
                        self.comparator(cond, keys.clone()),
                    )])
                }
            }
            CondType::Eq | CondType::Set => {
                if keys.is_empty() {
                    if cond == CondType::Eq {
                        return Err(VellumError::params(
                            "condition requires at least 1 argument, but provided 0",
                        ));
                    }
                    // empty IN () matches nothing
                    return Ok(vec![SelectKeyResult::default()]);
                }
                self.select_eq_set(map, keys, cond, sort_id, opts)
            }
            CondType::AllSet => {
                let mut results = SelectKeyResults::new();
                for key in keys {
                    if key.is_null() {
                        continue;
                    }
                    let converted = convert_key(key, &self.def)?;
                    match map.get(&converted) {
                        Some(entry) => {
                            results.push(SelectKeyResult {
                                results: vec![SingleKeyResult::Ids(entry.ids.clone())],
                                comparators: Vec::new(),
                            });
                        }
                        None => {
                            // one absent key empties the whole intersection
                            return Ok(vec![SelectKeyResult::default()]);
                        }
                    }
                }
                if results.is_empty() {
                    results.push(SelectKeyResult::default());
                }
                Ok(results)
            }
            CondType::Ge | CondType::Gt | CondType::Le | CondType::Lt | CondType::Range
            | CondType::Like => {
                if self.is_ordered() {
                    let converted = convert_keys(keys, &self.def)?;
                    Ok(vec![map.collect_ordered(
                        cond,
                        &converted,
                        sort_id,
                        &self.def.name,
                    )?])
                } else {
                    Ok(vec![SelectKeyResult::from_comparator(
                        self.comparator(cond, keys.clone()),
                    )])
                }
            }
            CondType::DWithin => Err(VellumError::params(format!(
                "DWithin requires a geo index, '{}' is not one",
                self.def.name
            ))),
        }
    }

    fn select_eq_set(
        &self,
        map: &MapIndex,
        keys: &VariantArray,
        cond: CondType,
        sort_id: SortType,
        opts: SelectOpts,
    ) -> Result<SelectKeyResults> {
        let converted = convert_keys(keys, &self.def)?;

        let selector = |res: &mut SelectKeyResult| -> bool {
            let (results, ids_count) = map.collect_eq(&converted, sort_id);
            res.results = results;
            if opts.items_count == 0 {
                return false;
            }
            // expensive idsets lose to a comparator walk: too many ids
            // for the surrounding plan, or a too-large share of the ns
            res.results.len() > 1
                && ((ids_count * 2 > opts.max_iterations)
                    || (100 * ids_count / opts.items_count > MAX_SELECTIVITY_PERCENT))
        };

        let use_cache = !opts.distinct && !opts.disable_idset_cache && converted.len() > 1;
        if use_cache {
            let key = cache_key(&converted, cond, sort_id);
            let mut cache = self.cache.lock();
            if let Some(cached) = cache.get(&key) {
                return Ok(match cached {
                    CachedSelect::ScanWin => vec![SelectKeyResult::from_comparator(
                        self.comparator(cond, keys.clone()),
                    )],
                    CachedSelect::Ids(sets) => {
                        let mut res = SelectKeyResult::default();
                        for ids in sets {
                            res.results.push(SingleKeyResult::Ids(ids.clone()));
                        }
                        vec![res]
                    }
                });
            }
            let mut res = SelectKeyResult::default();
            let scan_win = selector(&mut res);
            if scan_win && !opts.distinct {
                cache.put(key, CachedSelect::ScanWin);
                debug!(index = %self.def.name, "idset select fell back to comparator");
                return Ok(vec![SelectKeyResult::from_comparator(
                    self.comparator(cond, keys.clone()),
                )]);
            }
            let sets: Vec<IdSet> = res
                .results
                .iter()
                .filter_map(|r| match r {
                    SingleKeyResult::Ids(ids) => Some(ids.clone()),
                    SingleKeyResult::Range(..) => None,
                })
                .collect();
            cache.put(key, CachedSelect::Ids(sets));
            return Ok(vec![res]);
        }

        let mut res = SelectKeyResult::default();
        let scan_win = selector(&mut res);
        if scan_win && !opts.distinct {
            return Ok(vec![SelectKeyResult::from_comparator(
                self.comparator(cond, keys.clone()),
            )]);
        }
        Ok(vec![res])
    }

    /// Ranked text query for fulltext kinds.
    pub fn select_fulltext(&self, query: &str, need_area: bool) -> Result<Vec<FtMergeInfo>> {
        match &self.variant {
            IndexVariant::Fulltext(ft) => ft.select(query, need_area),
            _ => Err(VellumError::query_exec(format!(
                "index '{}' is not fulltext",
                self.def.name
            ))),
        }
    }

    // -- sort orders --------------------------------------------------------

    /// Ids ordered by this index's keys; `None` for unordered kinds.
    #[must_use]
    pub fn ids_in_key_order(&self) -> Option<Vec<IdType>> {
        match &self.variant {
            IndexVariant::Map(map) if self.is_ordered() => map.ids_in_key_order(),
            _ => None,
        }
    }

    /// Project every bucket into sort-order space `sort_id`.
    pub fn update_sorted_ids(&mut self, sort_id: SortType, id2ord: &[u32]) {
        if let IndexVariant::Map(map) = &mut self.variant {
            map.update_sorted_ids(sort_id, id2ord);
        }
    }

    // -- maintenance --------------------------------------------------------

    /// For ttl kinds: the ids whose stored timestamp is older than
    /// `expire_before` (unix seconds).
    pub fn expired_ids(&self, expire_before: i64) -> Result<IdSet> {
        if self.def.index_type != IndexType::Ttl {
            return Err(VellumError::logic(format!(
                "index '{}' is not a ttl index",
                self.def.name
            )));
        }
        let IndexVariant::Map(map) = &self.variant else {
            return Ok(IdSet::new());
        };
        let res = map.collect_ordered(
            CondType::Lt,
            &[Variant::Int64(expire_before)],
            0,
            &self.def.name,
        )?;
        Ok(res.merge_id_sets())
    }

    #[must_use]
    pub fn mem_usage(&self) -> usize {
        match &self.variant {
            IndexVariant::Store => 0,
            IndexVariant::Map(map) => map.mem_usage(),
            IndexVariant::Rtree(rtree) => rtree.mem_usage(),
            IndexVariant::Fulltext(ft) => ft.mem_usage(),
        }
    }
}

fn convert_key(key: &Variant, def: &IndexDef) -> Result<Variant> {
    match def.field_type {
        vellum_types::KvType::Composite | vellum_types::KvType::Tuple => Ok(key.clone()),
        target => key.convert(target),
    }
}

fn convert_keys(keys: &VariantArray, def: &IndexDef) -> Result<Vec<Variant>> {
    let mut out = Vec::with_capacity(keys.len());
    for key in keys {
        let converted = convert_key(key, def)?;
        if !out.contains(&converted) {
            out.push(converted);
        }
    }
    Ok(out)
}

fn cache_key(keys: &[Variant], cond: CondType, sort_id: SortType) -> u64 {
    let mut hasher = Xxh64::new(0);
    for key in keys {
        key.hash(&mut hasher);
    }
    (cond as u8).hash(&mut hasher);
    sort_id.hash(&mut hasher);
    hasher.finish()
}
