//! Geo point index.
//!
//! Points land in fixed-size grid cells; `DWithin` collects candidate
//! cells covering the search circle and distance-filters the ids. This
//! keeps the r-tree contract (spatial select + upsert/delete) with a
//! flat structure that is cheap to clone for copy-on-write commits.

use std::collections::HashMap;

use vellum_error::{Result, VellumError};
use vellum_types::{IdType, Point, Variant, VariantArray};

use crate::idset::IdSet;
use crate::select_result::SelectKeyResult;

const CELL_SIZE: f64 = 1.0;

#[derive(Debug, Clone, Default)]
pub struct RtreeIndex {
    cells: HashMap<(i64, i64), IdSet>,
    points: HashMap<IdType, Point>,
}

fn cell_of(p: Point) -> (i64, i64) {
    (
        (p.x / CELL_SIZE).floor() as i64,
        (p.y / CELL_SIZE).floor() as i64,
    )
}

impl RtreeIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn upsert(&mut self, values: &VariantArray, id: IdType) -> Result<()> {
        let point = Point::from_values(values)?;
        if let Some(old) = self.points.insert(id, point) {
            self.remove_from_cell(old, id);
        }
        self.cells.entry(cell_of(point)).or_default().add(id);
        Ok(())
    }

    pub fn delete(&mut self, id: IdType) -> Result<()> {
        match self.points.remove(&id) {
            Some(point) => {
                self.remove_from_cell(point, id);
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn remove_from_cell(&mut self, point: Point, id: IdType) {
        let cell = cell_of(point);
        if let Some(ids) = self.cells.get_mut(&cell) {
            ids.remove(id);
            if ids.is_empty() {
                self.cells.remove(&cell);
            }
        }
    }

    /// `DWithin(center, radius)` as one sorted id set.
    pub fn dwithin(&self, values: &VariantArray) -> Result<SelectKeyResult> {
        let head: VariantArray = values.iter().take(1).cloned().collect();
        let center = Point::from_values(&head)?;
        let radius = match values.get(1) {
            Some(Variant::Double(r)) => *r,
            Some(Variant::Int(r)) => f64::from(*r),
            Some(Variant::Int64(r)) => *r as f64,
            _ => return Err(VellumError::params("DWithin requires (point, radius)")),
        };
        if radius < 0.0 {
            return Err(VellumError::params("DWithin radius must be non-negative"));
        }

        let min = cell_of(Point::new(center.x - radius, center.y - radius));
        let max = cell_of(Point::new(center.x + radius, center.y + radius));
        let mut out = Vec::new();
        for cx in min.0..=max.0 {
            for cy in min.1..=max.1 {
                let Some(ids) = self.cells.get(&(cx, cy)) else {
                    continue;
                };
                for id in ids.iter() {
                    if let Some(p) = self.points.get(&id) {
                        if p.distance(center) <= radius {
                            out.push(id);
                        }
                    }
                }
            }
        }
        Ok(SelectKeyResult::from_ids(IdSet::from_vec(out)))
    }

    #[must_use]
    pub fn mem_usage(&self) -> usize {
        self.points.len() * 24 + self.cells.len() * 32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    fn pt(x: f64, y: f64) -> VariantArray {
        smallvec![Point::new(x, y).to_variant()]
    }

    fn query(x: f64, y: f64, r: f64) -> VariantArray {
        smallvec![Point::new(x, y).to_variant(), Variant::Double(r)]
    }

    #[test]
    fn dwithin_filters_by_distance() {
        let mut idx = RtreeIndex::new();
        idx.upsert(&pt(0.0, 0.0), 1).unwrap();
        idx.upsert(&pt(3.0, 4.0), 2).unwrap();
        idx.upsert(&pt(10.0, 10.0), 3).unwrap();

        let res = idx.dwithin(&query(0.0, 0.0, 5.0)).unwrap();
        assert_eq!(res.merge_id_sets().as_slice(), &[1, 2]);

        let res = idx.dwithin(&query(0.0, 0.0, 1.0)).unwrap();
        assert_eq!(res.merge_id_sets().as_slice(), &[1]);
    }

    #[test]
    fn upsert_moves_point() {
        let mut idx = RtreeIndex::new();
        idx.upsert(&pt(0.0, 0.0), 1).unwrap();
        idx.upsert(&pt(50.0, 50.0), 1).unwrap();
        let res = idx.dwithin(&query(0.0, 0.0, 5.0)).unwrap();
        assert!(res.merge_id_sets().is_empty());
        let res = idx.dwithin(&query(50.0, 50.0, 1.0)).unwrap();
        assert_eq!(res.merge_id_sets().as_slice(), &[1]);
    }

    #[test]
    fn delete_is_idempotent() {
        let mut idx = RtreeIndex::new();
        idx.upsert(&pt(1.0, 1.0), 1).unwrap();
        idx.delete(1).unwrap();
        idx.delete(1).unwrap();
        assert!(idx.is_empty());
    }

    #[test]
    fn negative_radius_is_params() {
        let idx = RtreeIndex::new();
        assert!(idx.dwithin(&query(0.0, 0.0, -1.0)).is_err());
    }
}
