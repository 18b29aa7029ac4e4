//! Full-text engine configuration.

use serde::{Deserialize, Serialize};

/// Per-field ranking configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FtFieldConfig {
    pub bm25_boost: f64,
    pub bm25_weight: f64,
    pub position_boost: f64,
    pub position_weight: f64,
    pub term_len_boost: f64,
    pub term_len_weight: f64,
}

impl Default for FtFieldConfig {
    fn default() -> Self {
        Self {
            bm25_boost: 1.0,
            bm25_weight: 0.1,
            position_boost: 1.0,
            position_weight: 0.1,
            term_len_boost: 1.0,
            term_len_weight: 0.3,
        }
    }
}

/// Configuration of a fast fulltext index.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FtConfig {
    /// Total allowed typos per query term pair; a single word may carry
    /// at most `max_typos / 2` edits.
    pub max_typos: u32,
    /// Words longer than this do not participate in typo search.
    pub max_typo_len: usize,
    /// Hard cap on merged result count.
    pub merge_limit: usize,
    /// Extra characters treated as word content.
    pub extra_word_symbols: String,
    /// Minimal relevancy (0..1) a merged result must reach.
    pub min_relevancy: f64,
    pub distance_boost: f64,
    pub distance_weight: f64,
    /// Rank multiplier when the matched document consists of exactly the
    /// query's term count.
    pub full_match_boost: f64,
    /// Percent taken off a partial (prefix/suffix) match per length
    /// delta.
    pub partial_match_decrease: u32,
    /// Ratio at which ranks from secondary fields are summed into the
    /// winning field's rank.
    pub sum_ranks_by_fields_ratio: f64,
    pub enable_translit: bool,
    pub enable_kb_layout: bool,
    /// Stemming languages ("en", "ru").
    pub stemmers: Vec<String>,
    /// `word: [synonym, ...]` expansion table.
    pub synonyms: Vec<SynonymEntry>,
    pub stop_words: Vec<String>,
    /// Per-field ranking knobs, positional.
    pub fields: Vec<FtFieldConfig>,
    /// Build worker cap for the word map.
    pub build_workers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SynonymEntry {
    pub tokens: Vec<String>,
    pub alternatives: Vec<String>,
}

impl Default for FtConfig {
    fn default() -> Self {
        Self {
            max_typos: 2,
            max_typo_len: 15,
            merge_limit: 20_000,
            extra_word_symbols: "-/+".to_owned(),
            min_relevancy: 0.05,
            distance_boost: 1.0,
            distance_weight: 0.5,
            full_match_boost: 1.1,
            partial_match_decrease: 15,
            sum_ranks_by_fields_ratio: 0.0,
            enable_translit: true,
            enable_kb_layout: true,
            stemmers: vec!["en".to_owned(), "ru".to_owned()],
            synonyms: Vec::new(),
            stop_words: Vec::new(),
            fields: Vec::new(),
            build_workers: 8,
        }
    }
}

impl FtConfig {
    /// Typo budget for a single word.
    #[must_use]
    pub fn max_typos_in_word(&self) -> u32 {
        self.max_typos / 2
    }

    /// Profile for the fuzzy index kind: typo-heavy, no exact boost.
    #[must_use]
    pub fn fuzzy() -> Self {
        Self {
            max_typos: 4,
            full_match_boost: 1.0,
            min_relevancy: 0.01,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn field(&self, idx: usize) -> FtFieldConfig {
        self.fields.get(idx).cloned().unwrap_or_default()
    }

    /// Parse a JSON config blob, falling back to defaults for absent
    /// keys.
    pub fn from_json(json: &str) -> vellum_error::Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| vellum_error::VellumError::params(format!("bad fulltext config: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = FtConfig::default();
        assert_eq!(cfg.max_typos_in_word(), 1);
        assert_eq!(cfg.merge_limit, 20_000);
        assert!(cfg.enable_translit);
    }

    #[test]
    fn from_json_partial() {
        let cfg = FtConfig::from_json(r#"{"max_typos": 4, "enable_translit": false}"#).unwrap();
        assert_eq!(cfg.max_typos, 4);
        assert_eq!(cfg.max_typos_in_word(), 2);
        assert!(!cfg.enable_translit);
        assert_eq!(cfg.merge_limit, 20_000);
    }

    #[test]
    fn fuzzy_profile() {
        let cfg = FtConfig::fuzzy();
        assert_eq!(cfg.max_typos, 4);
        assert!((cfg.full_match_boost - 1.0).abs() < f64::EPSILON);
    }
}
