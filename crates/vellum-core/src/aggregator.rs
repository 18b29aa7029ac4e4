//! Aggregation over matched rows.

use std::collections::HashMap;

use vellum_ast::{AggType, AggregateEntry};
use vellum_error::{Result, VellumError};
use vellum_types::{KvType, Variant, VariantArray};

use crate::query_results::{AggregationResult, FacetResult};

/// Streaming accumulator for one aggregation entry.
#[derive(Debug)]
pub struct Aggregator {
    entry: AggregateEntry,
    sum: f64,
    count: usize,
    min: Option<f64>,
    max: Option<f64>,
    facets: HashMap<Vec<Variant>, usize>,
    distinct: Vec<Variant>,
}

impl Aggregator {
    pub fn new(entry: AggregateEntry) -> Result<Self> {
        match entry.agg_type {
            AggType::Sum | AggType::Avg | AggType::Min | AggType::Max | AggType::Distinct => {
                if entry.fields.len() != 1 {
                    return Err(VellumError::params(format!(
                        "aggregation {} takes exactly one field",
                        entry.agg_type.as_str()
                    )));
                }
            }
            AggType::Facet => {
                if entry.fields.is_empty() {
                    return Err(VellumError::params("facet requires at least one field"));
                }
            }
            AggType::Count | AggType::CountCached => {}
        }
        Ok(Self {
            entry,
            sum: 0.0,
            count: 0,
            min: None,
            max: None,
            facets: HashMap::new(),
            distinct: Vec::new(),
        })
    }

    #[must_use]
    pub fn fields(&self) -> &[String] {
        &self.entry.fields
    }

    /// Feed one row's values, positionally matching `entry.fields`.
    pub fn aggregate(&mut self, row_values: &[VariantArray]) {
        self.count += 1;
        match self.entry.agg_type {
            AggType::Count | AggType::CountCached => {}
            AggType::Facet => {
                // multi-field facets use the first value of each field;
                // a single array field fans out per element
                if self.entry.fields.len() == 1 {
                    for v in row_values.first().into_iter().flatten() {
                        *self.facets.entry(vec![v.clone()]).or_insert(0) += 1;
                    }
                } else {
                    let key: Vec<Variant> = row_values
                        .iter()
                        .map(|vals| vals.first().cloned().unwrap_or(Variant::Null))
                        .collect();
                    *self.facets.entry(key).or_insert(0) += 1;
                }
            }
            AggType::Distinct => {
                for v in row_values.first().into_iter().flatten() {
                    if !self.distinct.contains(v) {
                        self.distinct.push(v.clone());
                    }
                }
            }
            AggType::Sum | AggType::Avg | AggType::Min | AggType::Max => {
                for v in row_values.first().into_iter().flatten() {
                    let Ok(Variant::Double(x)) = v.convert(KvType::Double) else {
                        continue;
                    };
                    self.sum += x;
                    self.min = Some(self.min.map_or(x, |m| m.min(x)));
                    self.max = Some(self.max.map_or(x, |m| m.max(x)));
                }
            }
        }
    }

    /// Finish: assemble the result, applying facet sort/limit/offset.
    #[must_use]
    pub fn finalize(self) -> AggregationResult {
        let value = match self.entry.agg_type {
            AggType::Sum => Some(self.sum),
            AggType::Avg => {
                if self.count == 0 {
                    Some(0.0)
                } else {
                    Some(self.sum / self.count as f64)
                }
            }
            AggType::Min => self.min,
            AggType::Max => self.max,
            AggType::Count | AggType::CountCached => Some(self.count as f64),
            AggType::Facet | AggType::Distinct => None,
        };

        let mut facets: Vec<FacetResult> = self
            .facets
            .into_iter()
            .map(|(values, count)| FacetResult { values, count })
            .collect();
        if self.entry.agg_type == AggType::Facet {
            // default order: by value; explicit sort entries may order by
            // "count" or by a facet field
            facets.sort_by(|a, b| a.values.cmp(&b.values));
            for sort in self.entry.sort.iter().rev() {
                if sort.expression == "count" {
                    facets.sort_by(|a, b| {
                        let ord = a.count.cmp(&b.count);
                        if sort.desc {
                            ord.reverse()
                        } else {
                            ord
                        }
                    });
                } else if let Some(pos) = self
                    .entry
                    .fields
                    .iter()
                    .position(|f| f == &sort.expression)
                {
                    facets.sort_by(|a, b| {
                        let ord = a.values[pos].cmp(&b.values[pos]);
                        if sort.desc {
                            ord.reverse()
                        } else {
                            ord
                        }
                    });
                }
            }
            if self.entry.offset > 0 {
                facets.drain(..self.entry.offset.min(facets.len()));
            }
            if let Some(limit) = self.entry.limit {
                facets.truncate(limit);
            }
        }

        AggregationResult {
            agg_type: self.entry.agg_type,
            fields: self.entry.fields,
            value,
            facets,
            distinct: self.distinct,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;
    use vellum_ast::SortEntry;

    fn row(v: i64) -> Vec<VariantArray> {
        vec![smallvec![Variant::Int64(v)]]
    }

    #[test]
    fn sum_avg_min_max() {
        let mut agg =
            Aggregator::new(AggregateEntry::new(AggType::Sum, vec!["price".into()])).unwrap();
        for v in [10, 20, 30] {
            agg.aggregate(&row(v));
        }
        assert_eq!(agg.finalize().value, Some(60.0));

        let mut agg =
            Aggregator::new(AggregateEntry::new(AggType::Avg, vec!["price".into()])).unwrap();
        for v in [10, 20] {
            agg.aggregate(&row(v));
        }
        assert_eq!(agg.finalize().value, Some(15.0));

        let mut agg =
            Aggregator::new(AggregateEntry::new(AggType::Min, vec!["price".into()])).unwrap();
        agg.aggregate(&row(7));
        agg.aggregate(&row(3));
        assert_eq!(agg.finalize().value, Some(3.0));
    }

    #[test]
    fn empty_input_identities() {
        let agg =
            Aggregator::new(AggregateEntry::new(AggType::Sum, vec!["price".into()])).unwrap();
        assert_eq!(agg.finalize().value, Some(0.0));

        let agg =
            Aggregator::new(AggregateEntry::new(AggType::Min, vec!["price".into()])).unwrap();
        assert_eq!(agg.finalize().value, None);
    }

    #[test]
    fn facet_with_sort_and_limit() {
        let mut entry = AggregateEntry::new(AggType::Facet, vec!["genre".into()]);
        entry.sort.push(SortEntry {
            expression: "count".into(),
            desc: true,
        });
        entry.limit = Some(2);
        let mut agg = Aggregator::new(entry).unwrap();
        for genre in ["sf", "sf", "sf", "prose", "prose", "poetry"] {
            agg.aggregate(&[smallvec![Variant::from(genre)]]);
        }
        let result = agg.finalize();
        assert_eq!(result.facets.len(), 2);
        assert_eq!(result.facets[0].values[0], Variant::from("sf"));
        assert_eq!(result.facets[0].count, 3);
        assert_eq!(result.facets[1].count, 2);
    }

    #[test]
    fn multi_field_facet() {
        let mut agg = Aggregator::new(AggregateEntry::new(
            AggType::Facet,
            vec!["genre".into(), "year".into()],
        ))
        .unwrap();
        agg.aggregate(&[smallvec![Variant::from("sf")], smallvec![Variant::Int(1969)]]);
        agg.aggregate(&[smallvec![Variant::from("sf")], smallvec![Variant::Int(1969)]]);
        agg.aggregate(&[smallvec![Variant::from("sf")], smallvec![Variant::Int(1984)]]);
        let result = agg.finalize();
        assert_eq!(result.facets.len(), 2);
    }

    #[test]
    fn distinct_dedupes_preserving_order() {
        let mut agg =
            Aggregator::new(AggregateEntry::new(AggType::Distinct, vec!["tag".into()])).unwrap();
        for tag in ["b", "a", "b", "c"] {
            agg.aggregate(&[smallvec![Variant::from(tag)]]);
        }
        let result = agg.finalize();
        assert_eq!(
            result.distinct,
            vec![Variant::from("b"), Variant::from("a"), Variant::from("c")]
        );
    }

    #[test]
    fn array_field_facets_per_element() {
        let mut agg =
            Aggregator::new(AggregateEntry::new(AggType::Facet, vec!["tags".into()])).unwrap();
        agg.aggregate(&[smallvec![Variant::from("x"), Variant::from("y")]]);
        let result = agg.finalize();
        assert_eq!(result.facets.len(), 2);
    }

    #[test]
    fn wrong_arity_is_params() {
        assert!(Aggregator::new(AggregateEntry::new(AggType::Sum, vec![])).is_err());
        assert!(Aggregator::new(AggregateEntry::new(AggType::Facet, vec![])).is_err());
    }
}
