//! Per-term search variants: transliteration, keyboard layout swaps and
//! light stemming.

/// A search variant of a query term with the rank percent it contributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TermVariant {
    pub pattern: String,
    pub proc: u32,
}

/// Base percent for an exact word match.
pub const FULL_MATCH_PROC: u32 = 100;
/// Percent subtracted for a stem-only match.
pub const STEM_PROC_DECREASE: u32 = 15;
/// Base percent for a typo match.
pub const TYPO_PROC: u32 = 85;
/// Per-typo percent step.
pub const TYPO_STEP_PROC: u32 = 15;

const RU_TRANSLIT: &[(&str, &str)] = &[
    ("а", "a"), ("б", "b"), ("в", "v"), ("г", "g"), ("д", "d"), ("е", "e"), ("ё", "e"),
    ("ж", "zh"), ("з", "z"), ("и", "i"), ("й", "j"), ("к", "k"), ("л", "l"), ("м", "m"),
    ("н", "n"), ("о", "o"), ("п", "p"), ("р", "r"), ("с", "s"), ("т", "t"), ("у", "u"),
    ("ф", "f"), ("х", "h"), ("ц", "c"), ("ч", "ch"), ("ш", "sh"), ("щ", "sch"), ("ъ", ""),
    ("ы", "y"), ("ь", ""), ("э", "e"), ("ю", "yu"), ("я", "ya"),
];

const KB_EN: &str = "qwertyuiop[]asdfghjkl;'zxcvbnm,.";
const KB_RU: &str = "йцукенгшщзхъфывапролджэячсмитьбю";

/// Cyrillic-to-latin transliteration.
#[must_use]
pub fn translit(word: &str) -> String {
    let mut out = String::with_capacity(word.len());
    'chars: for ch in word.chars() {
        let lower = ch.to_lowercase().to_string();
        for (ru, en) in RU_TRANSLIT {
            if lower == *ru {
                out.push_str(en);
                continue 'chars;
            }
        }
        out.push(ch);
    }
    out
}

/// Swap between the QWERTY and ЙЦУКЕН layouts: a word typed in the wrong
/// layout maps to what the user meant.
#[must_use]
pub fn kb_layout(word: &str) -> String {
    word.chars()
        .map(|ch| {
            if let Some(pos) = KB_EN.chars().position(|c| c == ch) {
                KB_RU.chars().nth(pos).unwrap_or(ch)
            } else if let Some(pos) = KB_RU.chars().position(|c| c == ch) {
                KB_EN.chars().nth(pos).unwrap_or(ch)
            } else {
                ch
            }
        })
        .collect()
}

/// Strip common inflection endings; intentionally rough, a stem match
/// carries a rank penalty anyway.
#[must_use]
pub fn stem(word: &str, lang: &str) -> String {
    match lang {
        "en" => {
            const SUFFIXES: &[&str] = &["ing", "edly", "ed", "ies", "es", "s", "ly", "er"];
            for suffix in SUFFIXES {
                if let Some(base) = word.strip_suffix(suffix) {
                    if base.chars().count() >= 3 {
                        return base.to_owned();
                    }
                }
            }
            word.to_owned()
        }
        "ru" => {
            const SUFFIXES: &[&str] = &[
                "иями", "ями", "ами", "ого", "его", "ому", "ему", "ыми", "ими", "ая", "яя",
                "ой", "ей", "ов", "ев", "ие", "ые", "ий", "ый", "ах", "ях", "ам", "ям", "ом",
                "ем", "а", "я", "ы", "и", "о", "е", "у", "ю",
            ];
            for suffix in SUFFIXES {
                if let Some(base) = word.strip_suffix(suffix) {
                    if base.chars().count() >= 3 {
                        return base.to_owned();
                    }
                }
            }
            word.to_owned()
        }
        _ => word.to_owned(),
    }
}

/// Expand one term into its lookup variants.
///
/// The original pattern ranks full; translit and layout variants rank
/// full as well (they are spellings, not distortions); stems take the
/// fixed penalty. `exact` terms skip everything but the original.
#[must_use]
pub fn prepare_variants(
    pattern: &str,
    exact: bool,
    enable_translit: bool,
    enable_kb_layout: bool,
    stemmers: &[String],
) -> Vec<TermVariant> {
    let mut out = vec![TermVariant {
        pattern: pattern.to_owned(),
        proc: FULL_MATCH_PROC,
    }];
    if exact {
        return out;
    }
    let mut push_unique = |pattern: String, proc: u32, out: &mut Vec<TermVariant>| {
        if !pattern.is_empty() && !out.iter().any(|v| v.pattern == pattern) {
            out.push(TermVariant { pattern, proc });
        }
    };
    if enable_translit {
        push_unique(translit(pattern), FULL_MATCH_PROC, &mut out);
    }
    if enable_kb_layout {
        push_unique(kb_layout(pattern), FULL_MATCH_PROC, &mut out);
    }
    for lang in stemmers {
        let stemmed = stem(pattern, lang);
        if stemmed != pattern {
            push_unique(stemmed, FULL_MATCH_PROC - STEM_PROC_DECREASE, &mut out);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translit_basic() {
        assert_eq!(translit("привет"), "privet");
        assert_eq!(translit("шум"), "shum");
        assert_eq!(translit("hello"), "hello");
    }

    #[test]
    fn kb_layout_swaps_both_ways() {
        assert_eq!(kb_layout("ghbdtn"), "привет");
        assert_eq!(kb_layout("привет"), "ghbdtn");
    }

    #[test]
    fn stem_en() {
        assert_eq!(stem("searching", "en"), "search");
        assert_eq!(stem("books", "en"), "book");
        assert_eq!(stem("cat", "en"), "cat");
    }

    #[test]
    fn variants_dedupe_and_penalize_stems() {
        let variants = prepare_variants(
            "searching",
            false,
            true,
            true,
            &["en".to_owned()],
        );
        assert_eq!(variants[0].pattern, "searching");
        assert_eq!(variants[0].proc, FULL_MATCH_PROC);
        let stemmed = variants.iter().find(|v| v.pattern == "search").unwrap();
        assert_eq!(stemmed.proc, FULL_MATCH_PROC - STEM_PROC_DECREASE);
    }

    #[test]
    fn exact_terms_have_single_variant() {
        let variants = prepare_variants("word", true, true, true, &["en".to_owned()]);
        assert_eq!(variants.len(), 1);
    }
}
