//! Column-struct payload model.
//!
//! A [`PayloadType`] is the ordered list of indexed fields of a namespace;
//! a [`PayloadValue`] is one item's slots for those fields. Field 0 is
//! always the "tuple": the CJSON remainder of the document that no index
//! covers (stored on the item, not in a slot).

use std::cmp::Ordering;
use std::collections::HashMap;

use smallvec::SmallVec;
use vellum_error::{Result, VellumError};
use xxhash_rust::xxh64::Xxh64;

use crate::key_string::CollateMode;
use crate::lsn::Lsn;
use crate::variant::{KvType, Variant, VariantArray};

/// One indexed field of a payload type.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PayloadFieldType {
    pub name: String,
    pub kv_type: KvType,
    pub is_array: bool,
    /// JSON paths feeding this field (usually one; merged indexes carry
    /// several).
    pub json_paths: Vec<String>,
}

/// Ordered list of indexed fields. Field 0 is the tuple placeholder.
#[derive(Debug, Clone, Default)]
pub struct PayloadType {
    name: String,
    fields: Vec<PayloadFieldType>,
    by_name: HashMap<String, usize>,
}

impl PayloadType {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let mut t = Self {
            name: name.into(),
            fields: Vec::new(),
            by_name: HashMap::new(),
        };
        t.fields.push(PayloadFieldType {
            name: "-tuple-".to_owned(),
            kv_type: KvType::String,
            is_array: false,
            json_paths: Vec::new(),
        });
        t
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn num_fields(&self) -> usize {
        self.fields.len()
    }

    #[must_use]
    pub fn field(&self, idx: usize) -> &PayloadFieldType {
        &self.fields[idx]
    }

    #[must_use]
    pub fn field_by_name(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    /// Field whose `json_paths` contains `path`.
    #[must_use]
    pub fn field_by_json_path(&self, path: &str) -> Option<usize> {
        self.fields
            .iter()
            .position(|f| f.json_paths.iter().any(|p| p == path))
    }

    /// Append a field; duplicate names are a `Conflict`.
    pub fn add_field(&mut self, field: PayloadFieldType) -> Result<usize> {
        if self.by_name.contains_key(&field.name) {
            return Err(VellumError::conflict(format!(
                "field '{}' already exists in payload type '{}'",
                field.name, self.name
            )));
        }
        let idx = self.fields.len();
        self.by_name.insert(field.name.clone(), idx);
        self.fields.push(field);
        Ok(idx)
    }

    /// Drop a field by id; later fields are renumbered down by one.
    pub fn drop_field(&mut self, idx: usize) -> Result<()> {
        if idx == 0 || idx >= self.fields.len() {
            return Err(VellumError::logic(format!(
                "can not drop payload field {idx} of '{}'",
                self.name
            )));
        }
        let removed = self.fields.remove(idx);
        self.by_name.remove(&removed.name);
        for (i, f) in self.fields.iter().enumerate().skip(idx) {
            self.by_name.insert(f.name.clone(), i);
        }
        Ok(())
    }
}

/// Reference to a value source: a payload field slot, or a JSON path read
/// straight from the document (sparse indexes, composite pseudo-fields).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldRef {
    Field(usize),
    JsonPath(String),
}

/// Ordered set of field references, as used by composite indexes and
/// `serialize_fields`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldsSet {
    refs: SmallVec<[FieldRef; 4]>,
}

impl FieldsSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn single(idx: usize) -> Self {
        let mut s = Self::new();
        s.push(FieldRef::Field(idx));
        s
    }

    pub fn push(&mut self, fr: FieldRef) {
        self.refs.push(fr);
    }

    #[must_use]
    pub fn contains_field(&self, idx: usize) -> bool {
        self.refs.iter().any(|r| matches!(r, FieldRef::Field(i) if *i == idx))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.refs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldRef> {
        self.refs.iter()
    }

    /// Renumber after a payload field drop: fields above `dropped` shift
    /// down by one.
    pub fn shift_after_drop(&mut self, dropped: usize) {
        for r in &mut self.refs {
            if let FieldRef::Field(i) = r {
                if *i > dropped {
                    *i -= 1;
                }
            }
        }
    }
}

impl FromIterator<FieldRef> for FieldsSet {
    fn from_iter<T: IntoIterator<Item = FieldRef>>(iter: T) -> Self {
        Self {
            refs: iter.into_iter().collect(),
        }
    }
}

/// One item's values for the indexed fields of its namespace.
///
/// Scalar slots hold a single-element array; array fields hold all
/// elements. Slot 0 (the tuple) is always empty here; the document
/// remainder lives as CJSON on the item.
#[derive(Debug, Clone, Default)]
pub struct PayloadValue {
    slots: Vec<VariantArray>,
    pub lsn: Lsn,
}

impl PayloadValue {
    #[must_use]
    pub fn new(num_fields: usize) -> Self {
        Self {
            slots: vec![VariantArray::new(); num_fields],
            lsn: Lsn::EMPTY,
        }
    }

    #[must_use]
    pub fn num_fields(&self) -> usize {
        self.slots.len()
    }

    /// Values of one field slot.
    #[must_use]
    pub fn get(&self, field: usize) -> &VariantArray {
        &self.slots[field]
    }

    /// First value of a slot, `Null` when the slot is empty.
    #[must_use]
    pub fn get_one(&self, field: usize) -> Variant {
        self.slots[field].first().cloned().unwrap_or(Variant::Null)
    }

    pub fn set(&mut self, field: usize, values: VariantArray) {
        self.slots[field] = values;
    }

    /// Grow to match a payload type after `add_field`.
    pub fn resize(&mut self, num_fields: usize) {
        self.slots.resize(num_fields, VariantArray::new());
    }

    /// Shrink after `drop_field`: removes the slot, shifting later ones.
    pub fn remove_field(&mut self, field: usize) {
        if field < self.slots.len() {
            self.slots.remove(field);
        }
    }

    /// Order-independent hash of the indexed content, combined per item
    /// into the namespace `data_hash` by XOR.
    #[must_use]
    pub fn hash(&self) -> u64 {
        let mut h = Xxh64::new(0);
        for (idx, slot) in self.slots.iter().enumerate().skip(1) {
            hash_slot(&mut h, idx as u64, slot);
        }
        h.digest()
    }

    /// Hash of selected fields only (idset cache keys for composites).
    #[must_use]
    pub fn hash_fields(&self, fields: &FieldsSet) -> u64 {
        let mut h = Xxh64::new(0);
        for r in fields.iter() {
            if let FieldRef::Field(idx) = r {
                hash_slot(&mut h, *idx as u64, &self.slots[*idx]);
            }
        }
        h.digest()
    }

    /// Compare selected fields against `other` under a collation.
    #[must_use]
    pub fn compare_fields(
        &self,
        other: &Self,
        fields: &FieldsSet,
        collate: &CollateMode,
    ) -> Ordering {
        for r in fields.iter() {
            if let FieldRef::Field(idx) = r {
                let a = self.get(*idx);
                let b = other.get(*idx);
                for (x, y) in a.iter().zip(b.iter()) {
                    let ord = x.collate_cmp(y, collate);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                let ord = a.len().cmp(&b.len());
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
        Ordering::Equal
    }
}

fn hash_slot(h: &mut Xxh64, idx: u64, slot: &VariantArray) {
    use std::hash::{Hash, Hasher};
    h.write_u64(idx);
    for v in slot {
        v.hash(h);
    }
}
