//! Secondary index family for the Vellum engine.
//!
//! Exposes the polymorphic [`Index`] (store, hash, btree, composite,
//! rtree, ttl and the fulltext kinds), the [`IdSet`] currency between
//! indexes and the executor, comparators for post-filtering and the LRU
//! cache shared by namespace-level caches.

pub mod comparator;
pub mod def;
pub mod idset;
pub mod index;
pub mod lru;
pub mod map_index;
pub mod rtree;
pub mod select_result;
pub mod strings;

pub use comparator::{compare_values, like_match, Comparator, FieldSource};
pub use def::{IndexDef, IndexOpts, IndexType};
pub use idset::IdSet;
pub use index::{Index, SelectOpts, MAX_IDS_FOR_DISTINCT, MAX_SELECTIVITY_PERCENT};
pub use lru::LruCache;
pub use select_result::{SelectKeyResult, SelectKeyResults, SingleKeyResult};
pub use strings::StringsHolder;

use vellum_types::cjson::extract_json_path;
use vellum_types::{FieldRef, FieldsSet, PayloadValue, Variant, VariantArray};

/// Assemble the key of a composite index from a row's payload slots and
/// json-path pseudo-fields.
#[must_use]
pub fn composite_key(
    payload: &PayloadValue,
    doc: Option<&serde_json::Value>,
    fields: &FieldsSet,
) -> Variant {
    let mut parts = Vec::with_capacity(fields.len());
    for field in fields.iter() {
        let values: VariantArray = match field {
            FieldRef::Field(idx) => payload.get(*idx).clone(),
            FieldRef::JsonPath(path) => doc
                .map(|d| extract_json_path(d, path))
                .unwrap_or_default(),
        };
        parts.push(values.first().cloned().unwrap_or(Variant::Null));
    }
    Variant::Tuple(parts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    #[test]
    fn composite_key_mixes_fields_and_paths() {
        let mut payload = PayloadValue::new(3);
        payload.set(1, smallvec![Variant::Int64(77_777)]);
        payload.set(2, smallvec![Variant::Int64(88_888)]);
        let doc = serde_json::json!({"nested": {"x": "deep"}});

        let mut fields = FieldsSet::new();
        fields.push(FieldRef::Field(1));
        fields.push(FieldRef::Field(2));
        fields.push(FieldRef::JsonPath("nested.x".into()));

        let key = composite_key(&payload, Some(&doc), &fields);
        assert_eq!(
            key,
            Variant::Tuple(vec![
                Variant::Int64(77_777),
                Variant::Int64(88_888),
                Variant::from("deep"),
            ])
        );
    }

    #[test]
    fn missing_components_become_null() {
        let payload = PayloadValue::new(2);
        let fields = FieldsSet::single(1);
        let key = composite_key(&payload, None, &fields);
        assert_eq!(key, Variant::Tuple(vec![Variant::Null]));
    }
}
