//! Fulltext index facade: pending document texts plus built structures.

use std::collections::HashMap;

use tracing::debug;
use vellum_error::Result;
use vellum_types::IdType;

use crate::config::FtConfig;
use crate::holder::DataHolder;
use crate::select::{select, FtMergeInfo};

/// A fast (or fuzzy-profiled) fulltext index over one or more text
/// fields of a namespace.
///
/// Writes buffer document texts; `commit` rebuilds the search
/// structures from the live set. Reads before the first commit see an
/// empty index.
#[derive(Debug, Default, Clone)]
pub struct FulltextIndex {
    cfg: FtConfig,
    field_names: Vec<String>,
    docs: HashMap<IdType, Vec<String>>,
    holder: DataHolder,
    dirty: bool,
    built: bool,
}

impl FulltextIndex {
    #[must_use]
    pub fn new(cfg: FtConfig, field_names: Vec<String>) -> Self {
        Self {
            cfg,
            field_names,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn config(&self) -> &FtConfig {
        &self.cfg
    }

    pub fn set_config(&mut self, cfg: FtConfig) {
        self.cfg = cfg;
        self.dirty = true;
        self.built = false;
    }

    #[must_use]
    pub fn doc_count(&self) -> usize {
        self.docs.len()
    }

    #[must_use]
    pub fn is_built(&self) -> bool {
        self.built && !self.dirty
    }

    /// Buffer the text fields of one item, replacing previous content.
    pub fn upsert_doc(&mut self, id: IdType, fields: Vec<String>) {
        self.docs.insert(id, fields);
        self.dirty = true;
    }

    pub fn delete_doc(&mut self, id: IdType) {
        if self.docs.remove(&id).is_some() {
            self.dirty = true;
        }
    }

    pub fn clear(&mut self) {
        self.docs.clear();
        self.holder = DataHolder::default();
        self.dirty = false;
        self.built = false;
    }

    /// Rebuild search structures from the buffered documents.
    pub fn commit(&mut self) {
        if !self.dirty && self.built {
            return;
        }
        self.holder = DataHolder::build(&self.docs, &self.cfg, &self.field_names);
        self.dirty = false;
        self.built = true;
        debug!(docs = self.docs.len(), "fulltext index committed");
    }

    /// Run a ranked query; `need_area` retains per-word match byte
    /// ranges for highlighting.
    pub fn select(&self, query: &str, need_area: bool) -> Result<Vec<FtMergeInfo>> {
        if !self.built {
            return Ok(Vec::new());
        }
        select(&self.holder, &self.cfg, query, need_area)
    }

    /// Approximate heap usage for memory stats.
    #[must_use]
    pub fn mem_usage(&self) -> usize {
        let docs: usize = self
            .docs
            .values()
            .map(|fields| fields.iter().map(String::len).sum::<usize>())
            .sum();
        let words: usize = self
            .holder
            .words
            .iter()
            .map(|w| w.word.len() + w.docs.len() * 24)
            .sum();
        docs + words + self.holder.suffix_map.len() * 16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index() -> FulltextIndex {
        FulltextIndex::new(FtConfig::default(), vec!["text".to_owned()])
    }

    #[test]
    fn empty_until_commit() {
        let mut idx = index();
        idx.upsert_doc(1, vec!["hello world".to_owned()]);
        assert!(idx.select("hello", false).unwrap().is_empty());
        idx.commit();
        assert_eq!(idx.select("hello", false).unwrap().len(), 1);
    }

    #[test]
    fn upsert_replaces_content() {
        let mut idx = index();
        idx.upsert_doc(1, vec!["old text".to_owned()]);
        idx.commit();
        idx.upsert_doc(1, vec!["new words".to_owned()]);
        idx.commit();
        assert!(idx.select("old", false).unwrap().is_empty());
        assert_eq!(idx.select("words", false).unwrap().len(), 1);
    }

    #[test]
    fn delete_removes_doc() {
        let mut idx = index();
        idx.upsert_doc(1, vec!["hello".to_owned()]);
        idx.upsert_doc(2, vec!["hello again".to_owned()]);
        idx.commit();
        idx.delete_doc(1);
        idx.commit();
        let res = idx.select("hello", false).unwrap();
        assert_eq!(res.len(), 1);
        assert_eq!(res[0].id, 2);
    }

    #[test]
    fn large_dictionary_returns_few_rows_for_random_term() {
        let mut idx = index();
        for i in 0..12_000 {
            idx.upsert_doc(
                i,
                vec![format!("phrase number {i} with body text segment {}", i % 977)],
            );
        }
        idx.commit();
        let res = idx.select("lskfj", false).unwrap();
        assert!(res.len() <= 20, "got {} rows", res.len());
    }
}
