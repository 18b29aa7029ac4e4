//! Indexed text structures: vdocs, word map, suffix array and typo maps.

use std::collections::{BTreeMap, HashMap};

use smallvec::SmallVec;
use tracing::debug;
use vellum_types::IdType;

use crate::config::FtConfig;
use crate::tokenizer::tokenize;
use crate::typos::make_typos;

/// Index of a virtual document inside the holder.
pub type VdocId = u32;

/// One occurrence of a word inside a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WordPos {
    pub field: u16,
    /// Word-counter position in the field.
    pub pos: u32,
    /// Byte offset in the source text (match areas).
    pub offset: u32,
    pub len: u32,
}

/// All occurrences of a word inside one vdoc.
#[derive(Debug, Clone, Default)]
pub struct WordDoc {
    pub vdoc: VdocId,
    pub positions: SmallVec<[WordPos; 2]>,
}

impl WordDoc {
    #[must_use]
    pub fn words_in_field(&self, field: u16) -> u32 {
        self.positions.iter().filter(|p| p.field == field).count() as u32
    }

    #[must_use]
    pub fn min_pos_in_field(&self, field: u16) -> Option<u32> {
        self.positions
            .iter()
            .filter(|p| p.field == field)
            .map(|p| p.pos)
            .min()
    }

    pub fn fields(&self) -> impl Iterator<Item = u16> + '_ {
        let mut seen: SmallVec<[u16; 4]> = SmallVec::new();
        self.positions.iter().filter_map(move |p| {
            if seen.contains(&p.field) {
                None
            } else {
                seen.push(p.field);
                Some(p.field)
            }
        })
    }
}

/// A unique word with its posting list, sorted by vdoc.
#[derive(Debug, Clone, Default)]
pub struct WordEntry {
    pub word: String,
    pub docs: Vec<WordDoc>,
}

/// A searchable document: one item, one text per indexed field.
#[derive(Debug, Clone, Default)]
pub struct VdocEntry {
    pub item_id: IdType,
    /// Total word count per field.
    pub words_count: Vec<u32>,
    /// Unique word count across all fields (full-match boost input).
    pub unique_words: u32,
}

/// Built search structures over a snapshot of documents.
#[derive(Debug, Default, Clone)]
pub struct DataHolder {
    pub field_names: Vec<String>,
    pub vdocs: Vec<VdocEntry>,
    pub words: Vec<WordEntry>,
    pub word_ids: HashMap<String, u32>,
    /// Lexicographically sorted view for prefix scans.
    pub words_sorted: BTreeMap<String, u32>,
    /// suffix text -> ids of words ending with it.
    pub suffix_map: HashMap<String, SmallVec<[u32; 1]>>,
    /// One-deletion signatures.
    pub typos_half: HashMap<String, SmallVec<[u32; 2]>>,
    /// Deeper-deletion signatures (only when the budget allows more than
    /// one edit).
    pub typos_max: HashMap<String, SmallVec<[u32; 2]>>,
    /// Mean words per field across vdocs.
    pub avg_words_count: Vec<f64>,
}

impl DataHolder {
    /// Build the holder from raw documents. The word map is assembled by
    /// up to `cfg.build_workers` scoped threads, then merged and frozen.
    #[must_use]
    pub fn build(
        docs: &HashMap<IdType, Vec<String>>,
        cfg: &FtConfig,
        field_names: &[String],
    ) -> Self {
        let mut holder = Self {
            field_names: field_names.to_vec(),
            ..Self::default()
        };
        let num_fields = field_names.len();

        // deterministic vdoc numbering: ascending item id
        let mut item_ids: Vec<IdType> = docs.keys().copied().collect();
        item_ids.sort_unstable();

        for &item_id in &item_ids {
            holder.vdocs.push(VdocEntry {
                item_id,
                words_count: vec![0; num_fields],
                unique_words: 0,
            });
        }

        type LocalMap = HashMap<String, Vec<(VdocId, WordPos)>>;
        let workers = cfg
            .build_workers
            .clamp(1, 8)
            .min(std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get))
            .min(item_ids.len().max(1));
        let chunk = item_ids.len().div_ceil(workers);
        let stop_words = &cfg.stop_words;

        let locals: Vec<(LocalMap, Vec<(VdocId, Vec<u32>)>)> = std::thread::scope(|scope| {
            let mut handles = Vec::with_capacity(workers);
            for (w, ids) in item_ids.chunks(chunk.max(1)).enumerate() {
                let base = (w * chunk.max(1)) as VdocId;
                handles.push(scope.spawn(move || {
                    let mut map: LocalMap = HashMap::new();
                    let mut counts: Vec<(VdocId, Vec<u32>)> = Vec::with_capacity(ids.len());
                    for (i, item_id) in ids.iter().enumerate() {
                        let vdoc = base + i as VdocId;
                        let fields = &docs[item_id];
                        let mut per_field = vec![0u32; num_fields];
                        for (f, text) in fields.iter().enumerate().take(num_fields) {
                            for token in tokenize(text, &cfg.extra_word_symbols) {
                                if stop_words.contains(&token.text) {
                                    continue;
                                }
                                per_field[f] += 1;
                                map.entry(token.text).or_default().push((
                                    vdoc,
                                    WordPos {
                                        field: f as u16,
                                        pos: token.position,
                                        offset: token.offset,
                                        len: token.len,
                                    },
                                ));
                            }
                        }
                        counts.push((vdoc, per_field));
                    }
                    (map, counts)
                }));
            }
            handles.into_iter().map(|h| h.join().expect("ft build worker")).collect()
        });

        // merge worker outputs into one word map
        let mut merged: HashMap<String, Vec<(VdocId, WordPos)>> = HashMap::new();
        for (map, counts) in locals {
            for (word, mut occurrences) in map {
                merged.entry(word).or_default().append(&mut occurrences);
            }
            for (vdoc, per_field) in counts {
                holder.vdocs[vdoc as usize].words_count = per_field;
            }
        }

        // freeze: stable word ids in lexicographic order
        let mut sorted_words: Vec<String> = merged.keys().cloned().collect();
        sorted_words.sort_unstable();
        for word in sorted_words {
            let occurrences = merged.remove(&word).expect("word present");
            let word_id = holder.words.len() as u32;
            let mut docs_map: BTreeMap<VdocId, WordDoc> = BTreeMap::new();
            for (vdoc, pos) in occurrences {
                docs_map
                    .entry(vdoc)
                    .or_insert_with(|| WordDoc {
                        vdoc,
                        positions: SmallVec::new(),
                    })
                    .positions
                    .push(pos);
            }
            let entry = WordEntry {
                word: word.clone(),
                docs: docs_map.into_values().collect(),
            };
            for doc in &entry.docs {
                holder.vdocs[doc.vdoc as usize].unique_words += 1;
            }
            holder.word_ids.insert(word.clone(), word_id);
            holder.words_sorted.insert(word.clone(), word_id);
            holder.words.push(entry);
        }

        holder.build_suffixes();
        holder.build_typos(cfg);
        holder.compute_averages(num_fields);
        debug!(
            vdocs = holder.vdocs.len(),
            words = holder.words.len(),
            suffixes = holder.suffix_map.len(),
            typos = holder.typos_half.len() + holder.typos_max.len(),
            "fulltext holder built"
        );
        holder
    }

    fn build_suffixes(&mut self) {
        for (word_id, entry) in self.words.iter().enumerate() {
            let chars: Vec<char> = entry.word.chars().collect();
            // proper suffixes of length >= 2; the full word is served by
            // the word map itself
            for start in 1..chars.len().saturating_sub(1) {
                let suffix: String = chars[start..].iter().collect();
                self.suffix_map
                    .entry(suffix)
                    .or_default()
                    .push(word_id as u32);
            }
        }
    }

    fn build_typos(&mut self, cfg: &FtConfig) {
        let budget = cfg.max_typos_in_word();
        if budget == 0 {
            return;
        }
        for (word_id, entry) in self.words.iter().enumerate() {
            let id = word_id as u32;
            make_typos(&entry.word, budget, cfg.max_typo_len, &mut |typo, level| {
                let removed = budget - level;
                if removed <= 1 {
                    self.typos_half.entry(typo.to_owned()).or_default().push(id);
                } else {
                    self.typos_max.entry(typo.to_owned()).or_default().push(id);
                }
            });
            // zero-deletion signature: catches insertion-typos on the
            // query side
            if entry.word.chars().count() <= cfg.max_typo_len {
                self.typos_half.entry(entry.word.clone()).or_default().push(id);
            }
        }
    }

    fn compute_averages(&mut self, num_fields: usize) {
        self.avg_words_count = vec![0.0; num_fields];
        if self.vdocs.is_empty() {
            return;
        }
        for vdoc in &self.vdocs {
            for (f, count) in vdoc.words_count.iter().enumerate() {
                self.avg_words_count[f] += f64::from(*count);
            }
        }
        for avg in &mut self.avg_words_count {
            *avg /= self.vdocs.len() as f64;
        }
    }

    #[must_use]
    pub fn word(&self, id: u32) -> &WordEntry {
        &self.words[id as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(texts: &[(&str, &str)]) -> DataHolder {
        let docs: HashMap<IdType, Vec<String>> = texts
            .iter()
            .enumerate()
            .map(|(i, (a, b))| (i as IdType, vec![(*a).to_owned(), (*b).to_owned()]))
            .collect();
        DataHolder::build(
            &docs,
            &FtConfig::default(),
            &["title".to_owned(), "body".to_owned()],
        )
    }

    #[test]
    fn words_and_counts() {
        let holder = build(&[("war and peace", "a novel about war"), ("peace", "")]);
        assert_eq!(holder.vdocs.len(), 2);
        assert_eq!(holder.vdocs[0].words_count, vec![3, 4]);

        let war = holder.word_ids["war"];
        let docs = &holder.word(war).docs;
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].words_in_field(0), 1);
        assert_eq!(docs[0].words_in_field(1), 1);

        let peace = holder.word_ids["peace"];
        assert_eq!(holder.word(peace).docs.len(), 2);
    }

    #[test]
    fn suffixes_exclude_full_word() {
        let holder = build(&[("singing", "")]);
        assert!(holder.suffix_map.contains_key("inging"));
        assert!(holder.suffix_map.contains_key("ng"));
        assert!(!holder.suffix_map.contains_key("singing"));
    }

    #[test]
    fn typo_signatures_present() {
        let holder = build(&[("hello", "")]);
        let id = holder.word_ids["hello"];
        assert!(holder.typos_half.get("hello").is_some_and(|v| v.contains(&id)));
        assert!(holder.typos_half.get("hllo").is_some_and(|v| v.contains(&id)));
        // default budget is one edit: no deep map entries
        assert!(holder.typos_max.is_empty());
    }

    #[test]
    fn averages() {
        let holder = build(&[("a b", ""), ("c d e f", "")]);
        assert!((holder.avg_words_count[0] - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn deterministic_word_ids() {
        let a = build(&[("b a c", "")]);
        assert_eq!(a.word_ids["a"], 0);
        assert_eq!(a.word_ids["b"], 1);
        assert_eq!(a.word_ids["c"], 2);
    }
}
