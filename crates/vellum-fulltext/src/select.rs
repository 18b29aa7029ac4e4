//! Query-time lookup and result merging.
//!
//! For each term: expand variants, collect matching words from the word
//! map (exact / prefix / suffix) and the typo maps, then merge per-vdoc
//! with BM25, positional and proximity ranking.

use std::collections::HashMap;

use tracing::debug;
use vellum_error::Result;

use crate::config::FtConfig;
use crate::dsl::{parse_dsl, FtDslTerm, FtOp};
use crate::holder::{DataHolder, WordPos};
use crate::typos::damerau_levenshtein;
use crate::variants::{prepare_variants, TYPO_PROC, TYPO_STEP_PROC};

/// Byte range of a matched word, for snippets and highlighting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FtArea {
    pub field: u16,
    pub offset: u32,
    pub len: u32,
}

/// One ranked result.
#[derive(Debug, Clone)]
pub struct FtMergeInfo {
    pub id: vellum_types::IdType,
    /// Rank scaled to 0..=255.
    pub proc: u8,
    pub areas: Vec<FtArea>,
}

/// A word matched for one term with the percent its variant carries.
#[derive(Debug, Clone, Copy)]
struct FoundWord {
    word_id: u32,
    proc: u32,
}

struct TermResults {
    term: FtDslTerm,
    found: Vec<FoundWord>,
}

/// Run a fulltext query over a built holder.
pub fn select(
    holder: &DataHolder,
    cfg: &FtConfig,
    query: &str,
    need_area: bool,
) -> Result<Vec<FtMergeInfo>> {
    let terms = parse_dsl(query, &holder.field_names, cfg.max_typos > 0)?;
    let mut raw_results = Vec::with_capacity(terms.len());
    for term in terms {
        let found = lookup_term(holder, cfg, &term);
        raw_results.push(TermResults { term, found });
    }
    Ok(merge_results(holder, cfg, raw_results, need_area))
}

// ---------------------------------------------------------------------------
// Lookup
// ---------------------------------------------------------------------------

fn lookup_term(holder: &DataHolder, cfg: &FtConfig, term: &FtDslTerm) -> Vec<FoundWord> {
    let mut best: HashMap<u32, u32> = HashMap::new();
    let mut add = |word_id: u32, proc: u32| {
        let entry = best.entry(word_id).or_insert(0);
        if proc > *entry {
            *entry = proc;
        }
    };

    let mut variants = prepare_variants(
        &term.pattern,
        term.exact,
        cfg.enable_translit,
        cfg.enable_kb_layout,
        &cfg.stemmers,
    );
    for syn in &cfg.synonyms {
        if syn.tokens.iter().any(|t| t == &term.pattern) {
            for alt in &syn.alternatives {
                variants.push(crate::variants::TermVariant {
                    pattern: alt.clone(),
                    proc: 95,
                });
            }
        }
    }

    for variant in &variants {
        let pattern = &variant.pattern;
        let pattern_len = pattern.chars().count() as u32;

        if let Some(&word_id) = holder.word_ids.get(pattern) {
            add(word_id, variant.proc);
        }
        if term.prefix_match {
            for (word, &word_id) in holder.words_sorted.range(pattern.clone()..) {
                if !word.starts_with(pattern.as_str()) {
                    break;
                }
                let dif = word.chars().count() as u32 - pattern_len;
                if dif > 0 {
                    add(word_id, partial_proc(variant.proc, dif, pattern_len, cfg));
                }
            }
        }
        if term.suffix_match {
            if let Some(word_ids) = holder.suffix_map.get(pattern) {
                for &word_id in word_ids {
                    let dif = holder.word(word_id).word.chars().count() as u32 - pattern_len;
                    add(word_id, partial_proc(variant.proc, dif, pattern_len, cfg));
                }
            }
        }
    }

    if term.typos {
        lookup_typos(holder, cfg, &term.pattern, &mut add);
    }

    let mut found: Vec<FoundWord> = best
        .into_iter()
        .map(|(word_id, proc)| FoundWord { word_id, proc })
        .collect();
    // higher-percent words first so better variants win merge updates
    found.sort_by(|a, b| b.proc.cmp(&a.proc).then(a.word_id.cmp(&b.word_id)));
    debug!(pattern = %term.pattern, words = found.len(), "fulltext term lookup");
    found
}

fn partial_proc(base: u32, dif: u32, pattern_len: u32, cfg: &FtConfig) -> u32 {
    let decrease = cfg.partial_match_decrease * dif / pattern_len.max(3);
    base.saturating_sub(decrease).max(10)
}

fn lookup_typos(
    holder: &DataHolder,
    cfg: &FtConfig,
    pattern: &str,
    add: &mut impl FnMut(u32, u32),
) {
    let budget = cfg.max_typos_in_word();
    if budget == 0 {
        return;
    }
    let mut candidates: Vec<u32> = Vec::new();
    let mut collect = |signature: &str| {
        if let Some(ids) = holder.typos_half.get(signature) {
            candidates.extend(ids.iter().copied());
        }
        if let Some(ids) = holder.typos_max.get(signature) {
            candidates.extend(ids.iter().copied());
        }
    };
    collect(pattern);
    make_typo_signatures(pattern, budget, cfg.max_typo_len, &mut collect);
    candidates.sort_unstable();
    candidates.dedup();

    for word_id in candidates {
        let word = &holder.word(word_id).word;
        let tcount = damerau_levenshtein(pattern, word) as u32;
        if tcount == 0 || tcount > budget {
            continue;
        }
        let word_len = word.chars().count() as u32;
        let proc = TYPO_PROC
            .saturating_sub(tcount * TYPO_STEP_PROC / ((word_len.saturating_sub(tcount)) / 3).max(1));
        add(word_id, proc);
    }
}

fn make_typo_signatures(
    pattern: &str,
    budget: u32,
    max_typo_len: usize,
    collect: &mut impl FnMut(&str),
) {
    crate::typos::make_typos(pattern, budget, max_typo_len, &mut |typo, _| collect(typo));
}

// ---------------------------------------------------------------------------
// Merge
// ---------------------------------------------------------------------------

const EXCLUDED: i64 = i64::MIN;

struct MergeTmp {
    vdoc: u32,
    proc: f64,
    field: u16,
    last_rank: f64,
    last_qpos: u32,
    last_positions: Vec<WordPos>,
    areas: Vec<FtArea>,
}

fn bound(k: f64, weight: f64, boost: f64) -> f64 {
    (1.0 - weight) + k * boost * weight
}

fn pos2rank(pos: u32) -> f64 {
    1.0 / (1.0 + f64::from(pos) / 100.0)
}

fn idf(total_docs: usize, matched: usize) -> f64 {
    if total_docs == 0 {
        return 0.0;
    }
    let raw = ((total_docs as f64) / (matched as f64 + 1.0)).ln()
        / (1.0 + total_docs as f64).ln();
    raw.max(0.0)
}

/// Okapi BM25 with `k1 = 2.0`, `b = 0.75`.
fn bm25_score(term_count_in_field: f64, words_in_field: f64, avg_field_len: f64) -> f64 {
    const K1: f64 = 2.0;
    const B: f64 = 0.75;
    let norm = if avg_field_len > 0.0 {
        words_in_field / avg_field_len
    } else {
        1.0
    };
    term_count_in_field * (K1 + 1.0) / (term_count_in_field + K1 * (1.0 - B + B * norm))
}

#[allow(clippy::too_many_lines)]
fn merge_results(
    holder: &DataHolder,
    cfg: &FtConfig,
    raw_results: Vec<TermResults>,
    need_area: bool,
) -> Vec<FtMergeInfo> {
    let total_docs = holder.vdocs.len();
    if raw_results.is_empty() || total_docs == 0 {
        return Vec::new();
    }

    // 0 = untouched, EXCLUDED, or 1 + offset into `merged`
    let mut statuses: Vec<i64> = vec![0; total_docs];
    let mut merged: Vec<MergeTmp> = Vec::new();
    let mut has_been_and = false;
    let term_count = raw_results.len();

    for raw in &raw_results {
        let term = &raw.term;
        let mut exists = vec![false; total_docs];

        for fw in &raw.found {
            let word = holder.word(fw.word_id);
            let word_idf = idf(total_docs, word.docs.len());

            for doc in &word.docs {
                let vid = doc.vdoc as usize;
                let status = statuses[vid];
                if status == EXCLUDED || (has_been_and && status == 0) {
                    continue;
                }
                if term.op == FtOp::Not {
                    if status > 0 {
                        merged[(status - 1) as usize].proc = 0.0;
                    }
                    statuses[vid] = EXCLUDED;
                    continue;
                }

                // find the best-ranking field of this occurrence
                let mut term_rank = 0.0f64;
                let mut best_field = 0u16;
                let mut other_ranks: Vec<f64> = Vec::new();
                for field in doc.fields() {
                    let fboost = if term.field_boosts.is_empty() {
                        1.0
                    } else {
                        match term.field_boosts.iter().find(|(f, _)| *f == usize::from(field)) {
                            Some((_, boost)) => *boost,
                            None => continue,
                        }
                    };
                    let fld_cfg = cfg.field(usize::from(field));
                    let vdoc = &holder.vdocs[vid];
                    let bm25 = word_idf
                        * bm25_score(
                            f64::from(doc.words_in_field(field)),
                            f64::from(vdoc.words_count[usize::from(field)]),
                            holder.avg_words_count[usize::from(field)],
                        );
                    let norm_bm25 = bound(bm25, fld_cfg.bm25_weight, fld_cfg.bm25_boost);
                    let position_rank = bound(
                        pos2rank(doc.min_pos_in_field(field).unwrap_or(0)),
                        fld_cfg.position_weight,
                        fld_cfg.position_boost,
                    );
                    let term_len_boost =
                        bound(1.0, fld_cfg.term_len_weight, fld_cfg.term_len_boost);
                    let rank = fboost
                        * f64::from(fw.proc)
                        * norm_bm25
                        * term.boost
                        * term_len_boost
                        * position_rank;
                    if rank > term_rank {
                        if term_rank > 0.0 {
                            other_ranks.push(term_rank);
                        }
                        term_rank = rank;
                        best_field = field;
                    } else if rank > 0.0 {
                        other_ranks.push(rank);
                    }
                }
                if term_rank == 0.0 {
                    continue;
                }
                if cfg.sum_ranks_by_fields_ratio > 0.0 {
                    other_ranks.sort_by(|a, b| a.total_cmp(b));
                    let mut k = cfg.sum_ranks_by_fields_ratio;
                    for rank in other_ranks {
                        term_rank += k * rank;
                        k *= cfg.sum_ranks_by_fields_ratio;
                    }
                }

                if status > 0 {
                    // later-term match of an already-merged vdoc
                    let off = (status - 1) as usize;
                    let entry = &mut merged[off];
                    let mut distance = 0u32;
                    let mut norm_dist = 1.0;
                    if entry.last_qpos != term.qpos {
                        distance = min_word_distance(&entry.last_positions, &doc.positions);
                        norm_dist = bound(
                            1.0 / f64::from(distance.max(1)),
                            cfg.distance_weight,
                            cfg.distance_boost,
                        );
                    }
                    let final_rank = norm_dist * term_rank;
                    if distance <= term.distance && (!exists[vid] || final_rank > entry.last_rank)
                    {
                        if exists[vid] {
                            entry.proc -= entry.last_rank;
                        }
                        entry.proc += final_rank;
                        entry.last_rank = final_rank;
                        entry.last_qpos = term.qpos;
                        entry.last_positions = doc.positions.to_vec();
                        if need_area {
                            for p in &doc.positions {
                                entry.areas.push(FtArea {
                                    field: p.field,
                                    offset: p.offset,
                                    len: p.len,
                                });
                            }
                        }
                        exists[vid] = true;
                    }
                } else if !has_been_and && merged.len() < cfg.merge_limit {
                    // first match of this vdoc
                    let mut areas = Vec::new();
                    if need_area {
                        for p in &doc.positions {
                            areas.push(FtArea {
                                field: p.field,
                                offset: p.offset,
                                len: p.len,
                            });
                        }
                    }
                    merged.push(MergeTmp {
                        vdoc: doc.vdoc,
                        proc: term_rank,
                        field: best_field,
                        last_rank: term_rank,
                        last_qpos: term.qpos,
                        last_positions: doc.positions.to_vec(),
                        areas,
                    });
                    statuses[vid] = merged.len() as i64;
                    exists[vid] = true;
                }
            }
        }

        if term.op == FtOp::And {
            has_been_and = true;
            for entry in &mut merged {
                let vid = entry.vdoc as usize;
                if !exists[vid] && statuses[vid] != EXCLUDED {
                    entry.proc = 0.0;
                    statuses[vid] = 0;
                }
            }
        }
    }

    // full-match boost: query term count equals the vdoc's word count
    let mut max_rank = 0.0f64;
    for entry in &mut merged {
        if entry.proc > 0.0
            && holder.vdocs[entry.vdoc as usize].unique_words as usize == term_count
        {
            entry.proc *= cfg.full_match_boost;
        }
        max_rank = max_rank.max(entry.proc);
    }
    if max_rank <= 0.0 {
        return Vec::new();
    }

    let min_proc = cfg.min_relevancy * max_rank;
    let mut out: Vec<FtMergeInfo> = merged
        .into_iter()
        .filter(|e| e.proc > 0.0 && e.proc >= min_proc)
        .map(|e| FtMergeInfo {
            id: holder.vdocs[e.vdoc as usize].item_id,
            proc: ((e.proc * 255.0 / max_rank).round() as u32).clamp(1, 255) as u8,
            areas: e.areas,
        })
        .collect();
    out.sort_by(|a, b| b.proc.cmp(&a.proc).then(a.id.cmp(&b.id)));
    debug!(results = out.len(), "fulltext merge");
    out
}

fn min_word_distance(a: &[WordPos], b: &[WordPos]) -> u32 {
    let mut best = u32::MAX;
    for x in a {
        for y in b {
            if x.field == y.field {
                let d = x.pos.abs_diff(y.pos);
                best = best.min(d);
            }
        }
    }
    if best == u32::MAX {
        100
    } else {
        best.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;
    use vellum_types::IdType;

    fn holder(texts: &[&str]) -> (DataHolder, FtConfig) {
        let cfg = FtConfig::default();
        let docs: StdHashMap<IdType, Vec<String>> = texts
            .iter()
            .enumerate()
            .map(|(i, t)| (i as IdType, vec![(*t).to_owned()]))
            .collect();
        let holder = DataHolder::build(&docs, &cfg, &["text".to_owned()]);
        (holder, cfg)
    }

    #[test]
    fn exact_word_matches() {
        let (holder, cfg) = holder(&["war and peace", "only peace", "nothing here"]);
        let res = select(&holder, &cfg, "peace", false).unwrap();
        let ids: Vec<IdType> = res.iter().map(|r| r.id).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&0) && ids.contains(&1));
    }

    #[test]
    fn typo_matches_single_edit() {
        let (holder, cfg) = holder(&["hello world"]);
        let res = select(&holder, &cfg, "helo", false).unwrap();
        assert_eq!(res.len(), 1);
        assert_eq!(res[0].id, 0);
    }

    #[test]
    fn nonsense_matches_nothing() {
        let (holder, cfg) = holder(&["hello world", "war and peace"]);
        let res = select(&holder, &cfg, "qqqqzz", false).unwrap();
        assert!(res.is_empty());
    }

    #[test]
    fn must_not_excludes() {
        let (holder, cfg) = holder(&["war and peace", "war only"]);
        let res = select(&holder, &cfg, "war -peace", false).unwrap();
        assert_eq!(res.len(), 1);
        assert_eq!(res[0].id, 1);
    }

    #[test]
    fn must_terms_require_presence() {
        // `war` is optional, `peace` is required: the war-only doc drops
        // out, the peace-only doc stays, the doc with both ranks first
        let (holder, cfg) = holder(&["war and peace", "war only", "peace only"]);
        let res = select(&holder, &cfg, "war +peace", false).unwrap();
        let ids: Vec<IdType> = res.iter().map(|r| r.id).collect();
        assert_eq!(ids.len(), 2);
        assert!(!ids.contains(&1));
        assert_eq!(res[0].id, 0, "doc matching both terms ranks first");
    }

    #[test]
    fn prefix_and_suffix_wildcards() {
        let (holder, cfg) = holder(&["singing birds", "single malt"]);
        let res = select(&holder, &cfg, "sing*", false).unwrap();
        assert_eq!(res.len(), 2);

        let res = select(&holder, &cfg, "*ing", false).unwrap();
        assert_eq!(res.len(), 1);
        assert_eq!(res[0].id, 0);
    }

    #[test]
    fn full_match_ranks_higher() {
        // doc 1 is an exact full match for the one-term query; doc 0 has
        // extra words, so the boost pushes doc 1 up
        let (holder, cfg) = holder(&["word with tail", "word"]);
        let res = select(&holder, &cfg, "word", false).unwrap();
        assert_eq!(res.len(), 2);
        assert_eq!(res[0].id, 1);
        assert!(res[0].proc >= res[1].proc);
    }

    #[test]
    fn proximity_boosts_adjacent_terms() {
        let (holder, cfg) = holder(&[
            "quick brown fox",
            "quick something else entirely and then brown",
        ]);
        let res = select(&holder, &cfg, "quick brown", false).unwrap();
        assert_eq!(res.len(), 2);
        assert_eq!(res[0].id, 0, "adjacent words must rank higher");
    }

    #[test]
    fn areas_cover_matched_words() {
        let (holder, cfg) = holder(&["hello world"]);
        let res = select(&holder, &cfg, "world", true).unwrap();
        assert_eq!(res[0].areas.len(), 1);
        assert_eq!(res[0].areas[0].offset, 6);
        assert_eq!(res[0].areas[0].len, 5);
    }

    #[test]
    fn ranks_scale_to_255() {
        let (holder, cfg) = holder(&["alpha beta", "alpha"]);
        let res = select(&holder, &cfg, "alpha", false).unwrap();
        assert_eq!(res[0].proc, 255);
    }
}
