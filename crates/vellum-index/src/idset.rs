//! Integer-id containers: the universal currency between indexes and the
//! query executor.

use std::collections::BTreeSet;
use std::sync::Arc;

use vellum_types::IdType;

/// Bucket size past which a key's id list gets a B-tree twin for cheap
/// membership updates.
pub const BTREE_REBUILD_THRESHOLD: usize = 5000;

/// A set of row ids, sorted ascending by default.
///
/// Cloning is cheap (shared backing vector); mutation uses copy-on-write.
/// Buckets that grow past [`BTREE_REBUILD_THRESHOLD`] maintain a B-tree
/// twin so `add`/`remove` stop paying vector shifts.
#[derive(Debug, Clone, Default)]
pub struct IdSet {
    ids: Arc<Vec<IdType>>,
    btree: Option<Arc<BTreeSet<IdType>>>,
    /// Unsorted sets preserve insertion order (fulltext results arrive in
    /// rank order).
    unsorted: bool,
}

impl IdSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// An insertion-ordered set (ranked fulltext output).
    #[must_use]
    pub fn new_unsorted() -> Self {
        Self {
            unsorted: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn from_vec(mut ids: Vec<IdType>) -> Self {
        ids.sort_unstable();
        ids.dedup();
        Self {
            ids: Arc::new(ids),
            btree: None,
            unsorted: false,
        }
    }

    #[must_use]
    pub fn from_vec_unsorted(ids: Vec<IdType>) -> Self {
        Self {
            ids: Arc::new(ids),
            btree: None,
            unsorted: true,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    #[must_use]
    pub fn is_unsorted(&self) -> bool {
        self.unsorted
    }

    #[must_use]
    pub fn as_slice(&self) -> &[IdType] {
        &self.ids
    }

    #[must_use]
    pub fn contains(&self, id: IdType) -> bool {
        if let Some(btree) = &self.btree {
            return btree.contains(&id);
        }
        if self.unsorted {
            self.ids.contains(&id)
        } else {
            self.ids.binary_search(&id).is_ok()
        }
    }

    /// Insert an id; no-op when already present.
    pub fn add(&mut self, id: IdType) {
        if self.unsorted {
            if !self.ids.contains(&id) {
                Arc::make_mut(&mut self.ids).push(id);
            }
            return;
        }
        match self.ids.binary_search(&id) {
            Ok(_) => {}
            Err(pos) => {
                Arc::make_mut(&mut self.ids).insert(pos, id);
                if let Some(btree) = &mut self.btree {
                    Arc::make_mut(btree).insert(id);
                } else if self.ids.len() > BTREE_REBUILD_THRESHOLD {
                    self.btree = Some(Arc::new(self.ids.iter().copied().collect()));
                }
            }
        }
    }

    /// Remove an id; returns whether it was present.
    pub fn remove(&mut self, id: IdType) -> bool {
        if self.unsorted {
            if let Some(pos) = self.ids.iter().position(|&x| x == id) {
                Arc::make_mut(&mut self.ids).remove(pos);
                return true;
            }
            return false;
        }
        match self.ids.binary_search(&id) {
            Ok(pos) => {
                Arc::make_mut(&mut self.ids).remove(pos);
                if let Some(btree) = &mut self.btree {
                    Arc::make_mut(btree).remove(&id);
                }
                true
            }
            Err(_) => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = IdType> + '_ {
        self.ids.iter().copied()
    }
}

impl FromIterator<IdType> for IdSet {
    fn from_iter<T: IntoIterator<Item = IdType>>(iter: T) -> Self {
        Self::from_vec(iter.into_iter().collect())
    }
}
