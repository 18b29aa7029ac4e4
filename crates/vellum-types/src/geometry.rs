//! Planar points for geo indexes and `DWithin` conditions.

use vellum_error::{Result, VellumError};

use crate::variant::{Variant, VariantArray};

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    #[must_use]
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    #[must_use]
    pub fn distance(self, other: Self) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }

    /// Encode as the two-element tuple used in condition values.
    #[must_use]
    pub fn to_variant(self) -> Variant {
        Variant::Tuple(vec![Variant::Double(self.x), Variant::Double(self.y)])
    }

    /// Decode from a payload slot or condition value.
    pub fn from_values(values: &VariantArray) -> Result<Self> {
        let scalars: Vec<f64> = match values.as_slice() {
            [Variant::Tuple(items)] => items
                .iter()
                .map(|v| v.convert(crate::variant::KvType::Double))
                .collect::<Result<Vec<_>>>()?
                .iter()
                .map(|v| match v {
                    Variant::Double(d) => *d,
                    _ => 0.0,
                })
                .collect(),
            _ => values
                .iter()
                .map(|v| {
                    v.convert(crate::variant::KvType::Double).map(|c| match c {
                        Variant::Double(d) => d,
                        _ => 0.0,
                    })
                })
                .collect::<Result<Vec<_>>>()?,
        };
        match scalars.as_slice() {
            [x, y] => Ok(Self::new(*x, *y)),
            _ => Err(VellumError::params(
                "geo point requires exactly two coordinates",
            )),
        }
    }
}
