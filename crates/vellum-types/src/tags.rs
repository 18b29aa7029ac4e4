//! Tag dictionary mapping JSON key names to compact 16-bit ids.

use std::collections::HashMap;

use smallvec::SmallVec;
use vellum_error::{Result, VellumError};

/// A path through a JSON document as a sequence of tag ids.
pub type TagsPath = SmallVec<[u16; 8]>;

/// Tag id `0` is reserved for the "tuple": the CJSON-encoded remainder of
/// a document that no index covers.
pub const TUPLE_TAG: u16 = 0;

/// Bidirectional mapping between JSON key names and tag ids.
///
/// Ids are dense and start at 1. The matcher carries a monotonic version
/// and an `updated` flag so the namespace knows when to persist a new
/// snapshot and when item CJSON must be re-encoded.
#[derive(Debug, Clone, Default)]
pub struct TagsMatcher {
    names: Vec<String>,
    by_name: HashMap<String, u16>,
    version: u32,
    updated: bool,
}

impl TagsMatcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn version(&self) -> u32 {
        self.version
    }

    #[must_use]
    pub fn is_updated(&self) -> bool {
        self.updated
    }

    pub fn clear_updated(&mut self) {
        self.updated = false;
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Look up a name without registering it.
    #[must_use]
    pub fn name_to_tag(&self, name: &str) -> Option<u16> {
        self.by_name.get(name).copied()
    }

    /// Look up or register a name. Fails with `Params` once the 16-bit id
    /// space is exhausted.
    pub fn name_to_tag_mut(&mut self, name: &str) -> Result<u16> {
        if let Some(tag) = self.by_name.get(name) {
            return Ok(*tag);
        }
        let next = self.names.len() + 1;
        let tag = u16::try_from(next)
            .map_err(|_| VellumError::params("tags matcher overflow: too many unique json keys"))?;
        self.names.push(name.to_owned());
        self.by_name.insert(name.to_owned(), tag);
        self.version += 1;
        self.updated = true;
        Ok(tag)
    }

    /// Resolve a tag back to its name. Tag 0 and unknown tags yield `None`.
    #[must_use]
    pub fn tag_to_name(&self, tag: u16) -> Option<&str> {
        if tag == TUPLE_TAG {
            return None;
        }
        self.names.get(usize::from(tag) - 1).map(String::as_str)
    }

    /// Translate a dotted JSON path into tag ids, registering new names.
    pub fn path_to_tags_mut(&mut self, path: &str) -> Result<TagsPath> {
        path.split('.').map(|seg| self.name_to_tag_mut(seg)).collect()
    }

    /// Translate a dotted JSON path; `None` if any segment is unknown.
    #[must_use]
    pub fn path_to_tags(&self, path: &str) -> Option<TagsPath> {
        path.split('.').map(|seg| self.name_to_tag(seg)).collect()
    }

    /// Merge `other` into `self`.
    ///
    /// Succeeds iff every name the two matchers share is bound to the same
    /// tag id; on conflict nothing is modified and `Logic` is returned.
    pub fn try_merge(&mut self, other: &Self) -> Result<()> {
        for (name, tag) in &other.by_name {
            if let Some(existing) = self.by_name.get(name) {
                if existing != tag {
                    return Err(VellumError::logic(format!(
                        "tags matcher conflict on '{name}': {existing} != {tag}"
                    )));
                }
            }
        }
        // other may hold tags past our end; they must be exactly our
        // extension, otherwise numbering would diverge
        for (idx, name) in other.names.iter().enumerate() {
            let tag = u16::try_from(idx + 1).expect("tag fits u16");
            match self.names.get(idx) {
                Some(existing) if existing == name => {}
                Some(existing) => {
                    return Err(VellumError::logic(format!(
                        "tags matcher conflict at id {tag}: '{existing}' != '{name}'"
                    )));
                }
                None => {
                    self.names.push(name.clone());
                    self.by_name.insert(name.clone(), tag);
                    self.version += 1;
                    self.updated = true;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_resolve() {
        let mut tm = TagsMatcher::new();
        let id = tm.name_to_tag_mut("id").unwrap();
        let name = tm.name_to_tag_mut("name").unwrap();
        assert_eq!(id, 1);
        assert_eq!(name, 2);
        assert_eq!(tm.name_to_tag_mut("id").unwrap(), 1);
        assert_eq!(tm.tag_to_name(2), Some("name"));
        assert_eq!(tm.tag_to_name(TUPLE_TAG), None);
    }

    #[test]
    fn version_bumps_only_on_new_names() {
        let mut tm = TagsMatcher::new();
        tm.name_to_tag_mut("a").unwrap();
        let v = tm.version();
        tm.name_to_tag_mut("a").unwrap();
        assert_eq!(tm.version(), v);
        tm.name_to_tag_mut("b").unwrap();
        assert_eq!(tm.version(), v + 1);
    }

    #[test]
    fn dotted_paths() {
        let mut tm = TagsMatcher::new();
        let path = tm.path_to_tags_mut("nested.deep.field").unwrap();
        assert_eq!(path.len(), 3);
        assert_eq!(tm.path_to_tags("nested.deep.field").unwrap(), path);
        assert!(tm.path_to_tags("nested.unknown").is_none());
    }

    #[test]
    fn merge_compatible() {
        let mut a = TagsMatcher::new();
        a.name_to_tag_mut("x").unwrap();
        let mut b = a.clone();
        b.name_to_tag_mut("y").unwrap();

        a.try_merge(&b).unwrap();
        assert_eq!(a.name_to_tag("y"), Some(2));
    }

    #[test]
    fn merge_conflict_fails() {
        let mut a = TagsMatcher::new();
        a.name_to_tag_mut("x").unwrap();
        a.name_to_tag_mut("y").unwrap();

        let mut b = TagsMatcher::new();
        b.name_to_tag_mut("y").unwrap(); // y gets tag 1 here, 2 in a

        assert!(a.try_merge(&b).is_err());
    }
}
