//! Post-filter comparators.
//!
//! When an index declines a condition (store indexes, low-selectivity
//! idsets, non-indexed json paths) the executor walks candidate rows and
//! asks a [`Comparator`] instead.

use vellum_ast::CondType;
use vellum_types::cjson::extract_json_path;
use vellum_types::{CollateMode, PayloadValue, Point, Variant, VariantArray};

/// Where a comparator reads its left-hand values from.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldSource {
    /// Payload slot of an indexed field.
    Field(usize),
    /// Dotted json path into the document.
    JsonPath(String),
}

/// A compiled row predicate: `source cond values` under a collation.
#[derive(Debug, Clone)]
pub struct Comparator {
    pub source: FieldSource,
    pub cond: CondType,
    pub values: VariantArray,
    pub collate: CollateMode,
}

impl Comparator {
    #[must_use]
    pub fn new(
        source: FieldSource,
        cond: CondType,
        values: VariantArray,
        collate: CollateMode,
    ) -> Self {
        Self {
            source,
            cond,
            values,
            collate,
        }
    }

    /// Pull the left-hand values for a row.
    #[must_use]
    pub fn row_values(
        &self,
        payload: &PayloadValue,
        doc: Option<&serde_json::Value>,
    ) -> VariantArray {
        match &self.source {
            FieldSource::Field(idx) => payload.get(*idx).clone(),
            FieldSource::JsonPath(path) => doc
                .map(|d| extract_json_path(d, path))
                .unwrap_or_default(),
        }
    }

    /// Evaluate the predicate for one row.
    #[must_use]
    pub fn matches(&self, payload: &PayloadValue, doc: Option<&serde_json::Value>) -> bool {
        let row = self.row_values(payload, doc);
        compare_values(&row, self.cond, &self.values, &self.collate)
    }
}

/// Shared condition evaluation over a row's value list.
#[must_use]
pub fn compare_values(
    row: &VariantArray,
    cond: CondType,
    values: &VariantArray,
    collate: &CollateMode,
) -> bool {
    use std::cmp::Ordering;
    let cmp = |a: &Variant, b: &Variant| a.collate_cmp(b, collate);
    match cond {
        CondType::Empty => row.is_empty() || row.iter().all(Variant::is_null),
        CondType::Any => row.iter().any(|v| !v.is_null()),
        CondType::Eq | CondType::Set => row
            .iter()
            .any(|x| values.iter().any(|v| cmp(x, v) == Ordering::Equal)),
        CondType::AllSet => values.iter().all(|v| {
            // null elements of the requested set match any row value
            v.is_null() || row.iter().any(|x| cmp(x, v) == Ordering::Equal)
        }),
        CondType::Lt => values
            .first()
            .is_some_and(|v| row.iter().any(|x| cmp(x, v) == Ordering::Less)),
        CondType::Le => values
            .first()
            .is_some_and(|v| row.iter().any(|x| cmp(x, v) != Ordering::Greater)),
        CondType::Gt => values
            .first()
            .is_some_and(|v| row.iter().any(|x| cmp(x, v) == Ordering::Greater)),
        CondType::Ge => values
            .first()
            .is_some_and(|v| row.iter().any(|x| cmp(x, v) != Ordering::Less)),
        CondType::Range => {
            let (Some(from), Some(to)) = (values.first(), values.get(1)) else {
                return false;
            };
            row.iter()
                .any(|x| cmp(x, from) != Ordering::Less && cmp(x, to) != Ordering::Greater)
        }
        CondType::Like => values.first().is_some_and(|pat| {
            let pattern = pat.to_string();
            row.iter().any(|x| like_match(&x.to_string(), &pattern))
        }),
        CondType::DWithin => {
            let head: VariantArray = values.iter().take(1).cloned().collect();
            let Ok(center) = Point::from_values(&head) else {
                return false;
            };
            let Some(radius) = values.get(1).and_then(|v| match v {
                Variant::Double(d) => Some(*d),
                Variant::Int(i) => Some(f64::from(*i)),
                Variant::Int64(i) => Some(*i as f64),
                _ => None,
            }) else {
                return false;
            };
            Point::from_values(row).is_ok_and(|p| p.distance(center) <= radius)
        }
    }
}

/// SQL LIKE: `%` matches any run, `_` matches one character.
#[must_use]
pub fn like_match(text: &str, pattern: &str) -> bool {
    fn rec(t: &[char], p: &[char]) -> bool {
        match p.first() {
            None => t.is_empty(),
            Some('%') => (0..=t.len()).any(|skip| rec(&t[skip..], &p[1..])),
            Some('_') => !t.is_empty() && rec(&t[1..], &p[1..]),
            Some(c) => t.first() == Some(c) && rec(&t[1..], &p[1..]),
        }
    }
    let t: Vec<char> = text.chars().collect();
    let p: Vec<char> = pattern.chars().collect();
    rec(&t, &p)
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    fn row(values: &[Variant]) -> VariantArray {
        values.iter().cloned().collect()
    }

    #[test]
    fn eq_and_set() {
        let r = row(&[Variant::Int(5)]);
        assert!(compare_values(
            &r,
            CondType::Eq,
            &smallvec![Variant::Int64(5)],
            &CollateMode::None
        ));
        assert!(compare_values(
            &r,
            CondType::Set,
            &smallvec![Variant::Int(1), Variant::Int(5)],
            &CollateMode::None
        ));
        assert!(!compare_values(
            &r,
            CondType::Set,
            &smallvec![Variant::Int(1)],
            &CollateMode::None
        ));
    }

    #[test]
    fn allset_with_null_wildcard() {
        let r = row(&[Variant::Int(1), Variant::Int(2)]);
        assert!(compare_values(
            &r,
            CondType::AllSet,
            &smallvec![Variant::Int(1), Variant::Null],
            &CollateMode::None
        ));
        assert!(!compare_values(
            &r,
            CondType::AllSet,
            &smallvec![Variant::Int(1), Variant::Int(3)],
            &CollateMode::None
        ));
    }

    #[test]
    fn range_and_orderings() {
        let r = row(&[Variant::Int(15)]);
        let range: VariantArray = smallvec![Variant::Int(10), Variant::Int(20)];
        assert!(compare_values(&r, CondType::Range, &range, &CollateMode::None));
        assert!(compare_values(
            &r,
            CondType::Gt,
            &smallvec![Variant::Int(10)],
            &CollateMode::None
        ));
        assert!(!compare_values(
            &r,
            CondType::Lt,
            &smallvec![Variant::Int(10)],
            &CollateMode::None
        ));
    }

    #[test]
    fn empty_and_any() {
        assert!(compare_values(
            &VariantArray::new(),
            CondType::Empty,
            &VariantArray::new(),
            &CollateMode::None
        ));
        assert!(!compare_values(
            &VariantArray::new(),
            CondType::Any,
            &VariantArray::new(),
            &CollateMode::None
        ));
        let r = row(&[Variant::Int(1)]);
        assert!(compare_values(&r, CondType::Any, &VariantArray::new(), &CollateMode::None));
    }

    #[test]
    fn like_patterns() {
        assert!(like_match("war and peace", "war%"));
        assert!(like_match("war and peace", "%peace"));
        assert!(like_match("war and peace", "%and%"));
        assert!(like_match("cat", "c_t"));
        assert!(!like_match("cart", "c_t"));
        assert!(!like_match("dog", "cat%"));
    }

    #[test]
    fn collated_eq() {
        let r = row(&[Variant::from("HELLO")]);
        assert!(compare_values(
            &r,
            CondType::Eq,
            &smallvec![Variant::from("hello")],
            &CollateMode::Ascii
        ));
    }

    #[test]
    fn json_path_comparator() {
        let doc = serde_json::json!({"nested": {"price": 99}});
        let payload = PayloadValue::new(1);
        let cmp = Comparator::new(
            FieldSource::JsonPath("nested.price".into()),
            CondType::Eq,
            smallvec![Variant::Int(99)],
            CollateMode::None,
        );
        assert!(cmp.matches(&payload, Some(&doc)));
        assert!(!cmp.matches(&payload, None));
    }

    #[test]
    fn dwithin_comparator() {
        let r = row(&[Variant::Tuple(vec![
            Variant::Double(3.0),
            Variant::Double(4.0),
        ])]);
        let values: VariantArray = smallvec![
            Point::new(0.0, 0.0).to_variant(),
            Variant::Double(5.5)
        ];
        assert!(compare_values(&r, CondType::DWithin, &values, &CollateMode::None));
        let values: VariantArray = smallvec![
            Point::new(0.0, 0.0).to_variant(),
            Variant::Double(4.0)
        ];
        assert!(!compare_values(&r, CondType::DWithin, &values, &CollateMode::None));
    }
}
