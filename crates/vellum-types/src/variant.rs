//! The dynamically-typed scalar that flows between payloads, indexes and
//! query values.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use smallvec::SmallVec;
use vellum_error::{Result, VellumError};

use crate::key_string::{CollateMode, KeyString};

/// Value type tag, used by index definitions and payload fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KvType {
    Null,
    Bool,
    Int,
    Int64,
    Double,
    String,
    /// Ordered sequence of variants: array payload slots and composite keys.
    Tuple,
    /// Composite-index key assembled from other fields.
    Composite,
}

/// A dynamically-typed value.
///
/// Total order: null < bool < numbers (cross-type within the numeric
/// family) < strings (byte order; collated comparison goes through
/// [`Variant::collate_cmp`]) < tuples (lexicographic).
#[derive(Clone)]
pub enum Variant {
    Null,
    Bool(bool),
    Int(i32),
    Int64(i64),
    Double(f64),
    String(KeyString),
    Tuple(Vec<Variant>),
}

/// A small vector of variants: array index keys, condition value lists,
/// payload array slots.
pub type VariantArray = SmallVec<[Variant; 2]>;

impl Variant {
    #[must_use]
    pub fn kv_type(&self) -> KvType {
        match self {
            Self::Null => KvType::Null,
            Self::Bool(_) => KvType::Bool,
            Self::Int(_) => KvType::Int,
            Self::Int64(_) => KvType::Int64,
            Self::Double(_) => KvType::Double,
            Self::String(_) => KvType::String,
            Self::Tuple(_) => KvType::Tuple,
        }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Numeric view, if this variant belongs to the numeric family.
    #[must_use]
    fn as_double(&self) -> Option<f64> {
        match self {
            Self::Bool(b) => Some(f64::from(u8::from(*b))),
            Self::Int(v) => Some(f64::from(*v)),
            Self::Int64(v) => Some(*v as f64),
            Self::Double(v) => Some(*v),
            _ => None,
        }
    }

    /// Coerce to `target`, failing with `Params` when the conversion is
    /// not meaningful (e.g. a non-numeric string to int).
    pub fn convert(&self, target: KvType) -> Result<Self> {
        if self.kv_type() == target || matches!(target, KvType::Null) {
            return Ok(self.clone());
        }
        let fail = || {
            VellumError::params(format!(
                "can not convert {:?} to {:?}",
                self.kv_type(),
                target
            ))
        };
        match target {
            KvType::Bool => match self {
                Self::Int(v) => Ok(Self::Bool(*v != 0)),
                Self::Int64(v) => Ok(Self::Bool(*v != 0)),
                Self::Double(v) => Ok(Self::Bool(*v != 0.0)),
                Self::String(s) => match s.as_str() {
                    "true" | "1" => Ok(Self::Bool(true)),
                    "false" | "0" => Ok(Self::Bool(false)),
                    _ => Err(fail()),
                },
                _ => Err(fail()),
            },
            KvType::Int => match self {
                Self::Bool(b) => Ok(Self::Int(i32::from(*b))),
                Self::Int64(v) => i32::try_from(*v).map(Self::Int).map_err(|_| fail()),
                Self::Double(v) => Ok(Self::Int(*v as i32)),
                Self::String(s) => s.parse::<i32>().map(Self::Int).map_err(|_| fail()),
                _ => Err(fail()),
            },
            KvType::Int64 => match self {
                Self::Bool(b) => Ok(Self::Int64(i64::from(*b))),
                Self::Int(v) => Ok(Self::Int64(i64::from(*v))),
                Self::Double(v) => Ok(Self::Int64(*v as i64)),
                Self::String(s) => s.parse::<i64>().map(Self::Int64).map_err(|_| fail()),
                _ => Err(fail()),
            },
            KvType::Double => match self {
                Self::Bool(b) => Ok(Self::Double(f64::from(u8::from(*b)))),
                Self::Int(v) => Ok(Self::Double(f64::from(*v))),
                Self::Int64(v) => Ok(Self::Double(*v as f64)),
                Self::String(s) => s.parse::<f64>().map(Self::Double).map_err(|_| fail()),
                _ => Err(fail()),
            },
            KvType::String => Ok(Self::String(KeyString::new(self.to_string()))),
            KvType::Tuple | KvType::Composite => match self {
                Self::Tuple(_) => Ok(self.clone()),
                _ => Ok(Self::Tuple(vec![self.clone()])),
            },
            KvType::Null => unreachable!(),
        }
    }

    fn type_rank(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Bool(_) | Self::Int(_) | Self::Int64(_) | Self::Double(_) => 1,
            Self::String(_) => 2,
            Self::Tuple(_) => 3,
        }
    }

    /// Total-order comparison with collated string handling.
    #[must_use]
    pub fn collate_cmp(&self, other: &Self, collate: &CollateMode) -> Ordering {
        match (self, other) {
            (Self::String(a), Self::String(b)) => collate.compare(a, b),
            (Self::Tuple(a), Self::Tuple(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    let ord = x.collate_cmp(y, collate);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            _ => match (self.as_double(), other.as_double()) {
                (Some(a), Some(b)) => a.total_cmp(&b),
                _ => self.type_rank().cmp(&other.type_rank()),
            },
        }
    }
}

impl PartialEq for Variant {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Variant {}

impl PartialOrd for Variant {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Variant {
    fn cmp(&self, other: &Self) -> Ordering {
        self.collate_cmp(other, &CollateMode::None)
    }
}

impl Hash for Variant {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Self::Null => state.write_u8(0),
            // the numeric family hashes through the double view so that
            // Int(5), Int64(5) and Double(5.0) land in one bucket
            Self::Bool(_) | Self::Int(_) | Self::Int64(_) | Self::Double(_) => {
                state.write_u8(1);
                let d = self.as_double().unwrap_or(0.0);
                state.write_u64(if d == 0.0 { 0 } else { d.to_bits() });
            }
            Self::String(s) => {
                state.write_u8(2);
                s.as_str().hash(state);
            }
            Self::Tuple(items) => {
                state.write_u8(3);
                for item in items {
                    item.hash(state);
                }
            }
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Int64(v) => write!(f, "{v}"),
            Self::Double(v) => {
                if v.fract() == 0.0 && v.is_finite() {
                    write!(f, "{v:.1}")
                } else {
                    write!(f, "{v}")
                }
            }
            Self::String(s) => f.write_str(s),
            Self::Tuple(items) => {
                f.write_str("{")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("}")
            }
        }
    }
}

impl fmt::Debug for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("Null"),
            Self::Bool(b) => write!(f, "Bool({b})"),
            Self::Int(v) => write!(f, "Int({v})"),
            Self::Int64(v) => write!(f, "Int64({v})"),
            Self::Double(v) => write!(f, "Double({v})"),
            Self::String(s) => write!(f, "String({s:?})"),
            Self::Tuple(items) => f.debug_tuple("Tuple").field(items).finish(),
        }
    }
}

impl From<bool> for Variant {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for Variant {
    fn from(v: i32) -> Self {
        Self::Int(v)
    }
}

impl From<i64> for Variant {
    fn from(v: i64) -> Self {
        Self::Int64(v)
    }
}

impl From<f64> for Variant {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<&str> for Variant {
    fn from(v: &str) -> Self {
        Self::String(KeyString::new(v))
    }
}

impl From<String> for Variant {
    fn from(v: String) -> Self {
        Self::String(KeyString::from(v))
    }
}

impl From<KeyString> for Variant {
    fn from(v: KeyString) -> Self {
        Self::String(v)
    }
}

/// Deduplicate a value list by total order, preserving first occurrence.
#[must_use]
pub fn dedup_values(values: &VariantArray) -> VariantArray {
    let mut out = VariantArray::new();
    for v in values {
        if !out.contains(v) {
            out.push(v.clone());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_family_cross_compare() {
        assert_eq!(Variant::Int(5), Variant::Int64(5));
        assert_eq!(Variant::Int(5), Variant::Double(5.0));
        assert!(Variant::Int(5) < Variant::Double(5.5));
        assert!(Variant::Int64(-1) < Variant::Int(0));
    }

    #[test]
    fn null_sorts_first() {
        assert!(Variant::Null < Variant::Bool(false));
        assert!(Variant::Null < Variant::from("a"));
        assert!(Variant::Int(i32::MIN) > Variant::Null);
    }

    #[test]
    fn tuple_order_is_lexicographic() {
        let a = Variant::Tuple(vec![1.into(), 2.into()]);
        let b = Variant::Tuple(vec![1.into(), 3.into()]);
        let c = Variant::Tuple(vec![1.into()]);
        assert!(a < b);
        assert!(c < a);
    }

    #[test]
    fn hash_consistent_with_eq_across_numeric_types() {
        use std::collections::hash_map::DefaultHasher;
        let h = |v: &Variant| {
            let mut s = DefaultHasher::new();
            v.hash(&mut s);
            s.finish()
        };
        assert_eq!(h(&Variant::Int(7)), h(&Variant::Int64(7)));
        assert_eq!(h(&Variant::Int(7)), h(&Variant::Double(7.0)));
    }

    #[test]
    fn convert_string_to_numbers() {
        let v = Variant::from("42");
        assert_eq!(v.convert(KvType::Int).unwrap(), Variant::Int(42));
        assert_eq!(v.convert(KvType::Int64).unwrap(), Variant::Int64(42));
        assert!(Variant::from("nope").convert(KvType::Int).is_err());
    }

    #[test]
    fn convert_to_string_formats() {
        assert_eq!(
            Variant::Int64(99).convert(KvType::String).unwrap(),
            Variant::from("99")
        );
    }

    #[test]
    fn dedup_preserves_first_occurrence() {
        let values: VariantArray =
            smallvec::smallvec![1.into(), 2.into(), Variant::Int64(1), 3.into()];
        let out = dedup_values(&values);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0], Variant::Int(1));
    }

    #[test]
    fn collated_string_compare() {
        let a = Variant::from("HELLO");
        let b = Variant::from("hello");
        assert_ne!(a, b);
        assert_eq!(a.collate_cmp(&b, &CollateMode::Ascii), Ordering::Equal);
    }
}
