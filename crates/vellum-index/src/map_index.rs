//! Hash and b-tree key maps shared by the scalar and composite index
//! kinds.

use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::ops::Bound;

use vellum_error::{Result, VellumError};
use vellum_types::{CollateMode, IdType, SortType, Variant};

use crate::comparator::like_match;
use crate::idset::IdSet;
use crate::select_result::{SelectKeyResult, SingleKeyResult};
use crate::strings::StringsHolder;

/// Map key with collation-aware ordering, equality and hashing.
#[derive(Debug, Clone)]
pub struct CollateKey {
    pub value: Variant,
    collate: CollateMode,
}

impl CollateKey {
    #[must_use]
    pub fn new(value: Variant, collate: CollateMode) -> Self {
        Self { value, collate }
    }
}

impl PartialEq for CollateKey {
    fn eq(&self, other: &Self) -> bool {
        self.value.collate_cmp(&other.value, &self.collate) == std::cmp::Ordering::Equal
    }
}

impl Eq for CollateKey {}

impl PartialOrd for CollateKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CollateKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.value.collate_cmp(&other.value, &self.collate)
    }
}

impl Hash for CollateKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match (&self.value, &self.collate) {
            // case-folding collations hash the folded text so equal keys
            // land in one bucket
            (Variant::String(s), CollateMode::Ascii) => {
                state.write_u8(2);
                s.to_ascii_lowercase().hash(state);
            }
            (Variant::String(s), CollateMode::Utf8) => {
                state.write_u8(2);
                s.to_lowercase().hash(state);
            }
            _ => self.value.hash(state),
        }
    }
}

/// Ids stored under one key, plus the optional projection into a
/// namespace sort-order space.
#[derive(Debug, Clone, Default)]
pub struct KeyEntry {
    pub ids: IdSet,
    /// Ids reordered by the active sort order; empty when stale.
    pub sorted: Vec<IdType>,
}

#[derive(Debug, Clone)]
enum MapKind {
    Hash(HashMap<CollateKey, KeyEntry>),
    BTree(BTreeMap<CollateKey, KeyEntry>),
}

/// Key-to-idset map backing hash, tree, ttl and composite indexes.
#[derive(Debug, Clone)]
pub struct MapIndex {
    map: MapKind,
    collate: CollateMode,
    is_pk: bool,
    /// Sort-order id the per-key projections were built for (0 = none).
    sorted_by: SortType,
}

impl MapIndex {
    #[must_use]
    pub fn new(ordered: bool, collate: CollateMode, is_pk: bool) -> Self {
        // exotic collations need ordered buckets for correct equality
        let needs_tree = matches!(collate, CollateMode::Numeric | CollateMode::Custom(_));
        let map = if ordered || needs_tree {
            MapKind::BTree(BTreeMap::new())
        } else {
            MapKind::Hash(HashMap::new())
        };
        Self {
            map,
            collate,
            is_pk,
            sorted_by: 0,
        }
    }

    fn key(&self, value: &Variant) -> CollateKey {
        CollateKey::new(value.clone(), self.collate.clone())
    }

    #[must_use]
    pub fn keys_count(&self) -> usize {
        match &self.map {
            MapKind::Hash(m) => m.len(),
            MapKind::BTree(m) => m.len(),
        }
    }

    #[must_use]
    pub fn get(&self, value: &Variant) -> Option<&KeyEntry> {
        let key = self.key(value);
        match &self.map {
            MapKind::Hash(m) => m.get(&key),
            MapKind::BTree(m) => m.get(&key),
        }
    }

    /// Insert `id` under `key`. A PK bucket owned by a different id is a
    /// `Conflict`.
    pub fn upsert(&mut self, value: &Variant, id: IdType, name: &str) -> Result<()> {
        let key = self.key(value);
        let entry = match &mut self.map {
            MapKind::Hash(m) => m.entry(key).or_default(),
            MapKind::BTree(m) => m.entry(key).or_default(),
        };
        if self.is_pk && !entry.ids.is_empty() && !entry.ids.contains(id) {
            return Err(VellumError::conflict(format!(
                "duplicate PK value '{value}' in index '{name}'"
            )));
        }
        entry.ids.add(id);
        entry.sorted.clear();
        self.sorted_by = 0;
        Ok(())
    }

    /// Remove `id` from `key`'s bucket. `strict` (dense scalar path)
    /// makes a missing id a `Logic` error; array and sparse paths pass
    /// `strict = false` and swallow it.
    pub fn delete(
        &mut self,
        value: &Variant,
        id: IdType,
        strict: bool,
        holder: &mut StringsHolder,
        name: &str,
    ) -> Result<()> {
        let key = self.key(value);
        let (removed, now_empty) = {
            let entry = match &mut self.map {
                MapKind::Hash(m) => m.get_mut(&key),
                MapKind::BTree(m) => m.get_mut(&key),
            };
            match entry {
                Some(entry) => {
                    let removed = entry.ids.remove(id);
                    entry.sorted.clear();
                    (removed, entry.ids.is_empty())
                }
                None => (false, false),
            }
        };
        if !removed {
            if strict {
                return Err(VellumError::logic(format!(
                    "id {id} is not present under key '{value}' of index '{name}'"
                )));
            }
            return Ok(());
        }
        self.sorted_by = 0;
        if now_empty {
            let taken = match &mut self.map {
                MapKind::Hash(m) => m.remove_entry(&key),
                MapKind::BTree(m) => m.remove_entry(&key),
            };
            if let Some((key, _)) = taken {
                if let Variant::String(s) = key.value {
                    holder.hold(s);
                }
            }
        }
        Ok(())
    }

    /// Point lookups for `Eq`/`Set`; returns the per-key entries plus
    /// the total id count for the selectivity decision.
    #[must_use]
    pub fn collect_eq(&self, keys: &[Variant], sort_id: SortType) -> (Vec<SingleKeyResult>, usize) {
        let mut results = Vec::with_capacity(keys.len());
        let mut ids_count = 0usize;
        for value in keys {
            if let Some(entry) = self.get(value) {
                ids_count += entry.ids.len();
                results.push(self.entry_result(entry, sort_id));
            }
        }
        (results, ids_count)
    }

    fn entry_result(&self, entry: &KeyEntry, sort_id: SortType) -> SingleKeyResult {
        if sort_id != 0 && sort_id == self.sorted_by && !entry.sorted.is_empty() {
            SingleKeyResult::Ids(IdSet::from_vec_unsorted(entry.sorted.clone()))
        } else {
            SingleKeyResult::Ids(entry.ids.clone())
        }
    }

    /// Range and pattern scans; ordered maps only.
    pub fn collect_ordered(
        &self,
        cond: vellum_ast::CondType,
        keys: &[Variant],
        sort_id: SortType,
        name: &str,
    ) -> Result<SelectKeyResult> {
        use vellum_ast::CondType;
        let MapKind::BTree(map) = &self.map else {
            return Err(VellumError::query_exec(format!(
                "index '{name}' does not support ordered conditions"
            )));
        };
        let mut res = SelectKeyResult::default();
        let entries: Vec<&KeyEntry> = match cond {
            CondType::Ge | CondType::Gt => {
                let Some(from) = keys.first() else {
                    return Err(VellumError::params("condition requires an argument"));
                };
                let bound = if cond == CondType::Ge {
                    Bound::Included(self.key(from))
                } else {
                    Bound::Excluded(self.key(from))
                };
                map.range((bound, Bound::Unbounded)).map(|(_, e)| e).collect()
            }
            CondType::Le | CondType::Lt => {
                let Some(to) = keys.first() else {
                    return Err(VellumError::params("condition requires an argument"));
                };
                let bound = if cond == CondType::Le {
                    Bound::Included(self.key(to))
                } else {
                    Bound::Excluded(self.key(to))
                };
                map.range((Bound::Unbounded, bound)).map(|(_, e)| e).collect()
            }
            CondType::Range => {
                let (Some(from), Some(to)) = (keys.first(), keys.get(1)) else {
                    return Err(VellumError::params("range requires two arguments"));
                };
                let from = self.key(from);
                let to = self.key(to);
                if from > to {
                    return Ok(res);
                }
                map.range((Bound::Included(from), Bound::Included(to)))
                    .map(|(_, e)| e)
                    .collect()
            }
            CondType::Like => {
                let Some(Variant::String(pattern)) = keys.first() else {
                    return Err(VellumError::params("LIKE requires a string argument"));
                };
                map.iter()
                    .filter(|(key, _)| {
                        matches!(&key.value, Variant::String(s) if like_match(s, pattern))
                    })
                    .map(|(_, e)| e)
                    .collect()
            }
            _ => {
                return Err(VellumError::query_exec(format!(
                    "unsupported ordered condition on index '{name}'"
                )))
            }
        };
        for entry in entries {
            res.results.push(self.entry_result(entry, sort_id));
        }
        Ok(res)
    }

    /// All buckets, for `Any` on distinct queries.
    #[must_use]
    pub fn collect_all(&self, sort_id: SortType) -> SelectKeyResult {
        let mut res = SelectKeyResult::default();
        match &self.map {
            MapKind::Hash(m) => {
                for entry in m.values() {
                    res.results.push(self.entry_result(entry, sort_id));
                }
            }
            MapKind::BTree(m) => {
                for entry in m.values() {
                    res.results.push(self.entry_result(entry, sort_id));
                }
            }
        }
        res
    }

    /// Ids in key order; the namespace uses this to build a sort order
    /// for `ORDER BY index`.
    #[must_use]
    pub fn ids_in_key_order(&self) -> Option<Vec<IdType>> {
        let MapKind::BTree(map) = &self.map else {
            return None;
        };
        let mut out = Vec::new();
        for entry in map.values() {
            out.extend(entry.ids.iter());
        }
        Some(out)
    }

    /// Rebuild per-key projections for sort order `sort_id`. `id2ord`
    /// maps a row id to its position in that order.
    pub fn update_sorted_ids(&mut self, sort_id: SortType, id2ord: &[u32]) {
        let project = |entry: &mut KeyEntry| {
            let mut sorted: Vec<IdType> = entry.ids.iter().collect();
            sorted.sort_by_key(|id| id2ord.get(*id as usize).copied().unwrap_or(u32::MAX));
            entry.sorted = sorted;
        };
        match &mut self.map {
            MapKind::Hash(m) => m.values_mut().for_each(project),
            MapKind::BTree(m) => m.values_mut().for_each(project),
        }
        self.sorted_by = sort_id;
    }

    #[must_use]
    pub fn mem_usage(&self) -> usize {
        let entry_size = |e: &KeyEntry| e.ids.len() * 4 + e.sorted.len() * 4 + 32;
        match &self.map {
            MapKind::Hash(m) => m.values().map(entry_size).sum(),
            MapKind::BTree(m) => m.values().map(entry_size).sum(),
        }
    }
}
