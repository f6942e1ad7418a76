//! Generic filter model consumed by the query translator.
//!
//! A filter combines attribute comparisons, a bounding-box spatial
//! predicate and FID-set predicates with AND/OR/NOT. The translator
//! splits a filter into the backend's three conjunctive channels: an
//! attribute WHERE clause, a spatial-constraint list and an FID
//! constraint.

use crate::core::{Envelope, GeoError, Result, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Like,
}

impl ComparisonOp {
    fn sql(&self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::NotEq => "<>",
            Self::Lt => "<",
            Self::LtEq => "<=",
            Self::Gt => ">",
            Self::GtEq => ">=",
            Self::Like => "LIKE",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Matches every feature.
    Include,
    Compare {
        attribute: String,
        op: ComparisonOp,
        value: Value,
    },
    IsNull {
        attribute: String,
    },
    And(Box<Filter>, Box<Filter>),
    Or(Box<Filter>, Box<Filter>),
    Not(Box<Filter>),
    /// Bounding-box predicate against the schema's geometry column.
    BBox(Envelope),
    /// Row-identifier set predicate.
    FidSet(Vec<u64>),
}

impl Filter {
    pub fn eq(attribute: &str, value: Value) -> Self {
        Self::Compare {
            attribute: attribute.to_string(),
            op: ComparisonOp::Eq,
            value,
        }
    }

    pub fn compare(attribute: &str, op: ComparisonOp, value: Value) -> Self {
        Self::Compare {
            attribute: attribute.to_string(),
            op,
            value,
        }
    }

    pub fn bbox(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self::BBox(Envelope::new(min_x, min_y, max_x, max_y))
    }

    pub fn fids(fids: impl IntoIterator<Item = u64>) -> Self {
        Self::FidSet(fids.into_iter().collect())
    }

    pub fn and(self, other: Filter) -> Self {
        Self::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: Filter) -> Self {
        Self::Or(Box::new(self), Box::new(other))
    }

    pub fn not(self) -> Self {
        Self::Not(Box::new(self))
    }

    /// True when the subtree contains only attribute predicates and can
    /// be rendered as a WHERE clause verbatim.
    fn is_pure_attribute(&self) -> bool {
        match self {
            Self::Compare { .. } | Self::IsNull { .. } => true,
            Self::And(a, b) | Self::Or(a, b) => a.is_pure_attribute() && b.is_pure_attribute(),
            Self::Not(f) => f.is_pure_attribute(),
            Self::Include | Self::BBox(_) | Self::FidSet(_) => false,
        }
    }
}

/// A filter decomposed into the backend's conjunctive channels.
#[derive(Debug, Clone, Default)]
pub struct FilterSplit {
    /// Attribute-only subtree, pushed down as a WHERE clause.
    pub attribute: Option<Filter>,
    /// AND-composed bounding boxes, pushed down as spatial constraints.
    pub spatial: Vec<Envelope>,
    /// Row-identifier constraint, sorted and deduplicated.
    pub fids: Option<Vec<u64>>,
}

/// Split a filter into attribute, spatial and FID parts.
///
/// AND composition across the three channels is fine: every part lands
/// in its own channel and the backend enforces the conjunction. OR or
/// NOT spanning the channel boundary cannot be expressed with a single
/// WHERE clause plus a spatial-constraint list, so it is rejected here,
/// before any backend call.
pub fn split(filter: &Filter) -> Result<FilterSplit> {
    let mut out = FilterSplit::default();
    collect(filter, &mut out)?;
    if let Some(fids) = out.fids.as_mut() {
        fids.sort_unstable();
        fids.dedup();
    }
    Ok(out)
}

fn collect(filter: &Filter, out: &mut FilterSplit) -> Result<()> {
    match filter {
        Filter::Include => Ok(()),
        Filter::Compare { .. } | Filter::IsNull { .. } => {
            push_attribute(out, filter.clone());
            Ok(())
        }
        Filter::BBox(envelope) => {
            out.spatial.push(*envelope);
            Ok(())
        }
        Filter::FidSet(fids) => {
            out.fids = Some(match out.fids.take() {
                // Conjunction of two FID sets matches their intersection.
                Some(existing) => existing
                    .into_iter()
                    .filter(|fid| fids.contains(fid))
                    .collect(),
                None => fids.clone(),
            });
            Ok(())
        }
        Filter::And(a, b) => {
            collect(a, out)?;
            collect(b, out)
        }
        Filter::Or(_, _) | Filter::Not(_) => {
            if filter.is_pure_attribute() {
                push_attribute(out, filter.clone());
                Ok(())
            } else {
                Err(GeoError::UnsupportedQueryShape(
                    "OR/NOT across spatial, FID or attribute boundaries cannot be \
                     pushed down to the backend"
                        .into(),
                ))
            }
        }
    }
}

fn push_attribute(out: &mut FilterSplit, filter: Filter) {
    out.attribute = Some(match out.attribute.take() {
        Some(existing) => existing.and(filter),
        None => filter,
    });
}

/// Render an attribute-only filter as a backend WHERE clause.
///
/// `qualify` maps an attribute name to its backend column reference
/// (`table.column`); for views it resolves against the merged schema.
pub fn encode(filter: &Filter, qualify: &dyn Fn(&str) -> Result<String>) -> Result<String> {
    match filter {
        Filter::Compare {
            attribute,
            op,
            value,
        } => Ok(format!(
            "{} {} {}",
            qualify(attribute)?,
            op.sql(),
            value.sql_literal()?
        )),
        Filter::IsNull { attribute } => Ok(format!("{} IS NULL", qualify(attribute)?)),
        Filter::And(a, b) => Ok(format!(
            "({}) AND ({})",
            encode(a, qualify)?,
            encode(b, qualify)?
        )),
        Filter::Or(a, b) => Ok(format!(
            "({}) OR ({})",
            encode(a, qualify)?,
            encode(b, qualify)?
        )),
        Filter::Not(f) => Ok(format!("NOT ({})", encode(f, qualify)?)),
        Filter::Include | Filter::BBox(_) | Filter::FidSet(_) => Err(GeoError::IllegalState(
            "non-attribute filter reached WHERE-clause encoding".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unqualified(name: &str) -> Result<String> {
        Ok(name.to_string())
    }

    #[test]
    fn test_split_mixed_and_keeps_both_sides() {
        let filter = Filter::eq("name", Value::Text("main st".into()))
            .and(Filter::bbox(0.0, 0.0, 10.0, 10.0));

        let split = split(&filter).unwrap();
        assert!(split.attribute.is_some());
        assert_eq!(split.spatial.len(), 1);
        assert!(split.fids.is_none());
    }

    #[test]
    fn test_split_fid_sets_intersect_under_and() {
        let filter = Filter::fids([1, 2, 3, 3]).and(Filter::fids([2, 3, 4]));
        let split = split(&filter).unwrap();
        assert_eq!(split.fids, Some(vec![2, 3]));
    }

    #[test]
    fn test_split_or_across_boundary_rejected() {
        let filter = Filter::eq("lanes", Value::Int(2)).or(Filter::bbox(0.0, 0.0, 1.0, 1.0));
        assert!(matches!(
            split(&filter),
            Err(GeoError::UnsupportedQueryShape(_))
        ));

        let filter = Filter::fids([1]).or(Filter::eq("lanes", Value::Int(2)));
        assert!(matches!(
            split(&filter),
            Err(GeoError::UnsupportedQueryShape(_))
        ));
    }

    #[test]
    fn test_split_not_over_attributes_allowed() {
        let filter = Filter::eq("lanes", Value::Int(2)).not();
        let split = split(&filter).unwrap();
        assert!(split.attribute.is_some());
    }

    #[test]
    fn test_split_not_over_bbox_rejected() {
        let filter = Filter::bbox(0.0, 0.0, 1.0, 1.0).not();
        assert!(matches!(
            split(&filter),
            Err(GeoError::UnsupportedQueryShape(_))
        ));
    }

    #[test]
    fn test_encode_comparison() {
        let filter = Filter::eq("name", Value::Text("O'Hare".into()));
        assert_eq!(
            encode(&filter, &unqualified).unwrap(),
            "name = 'O''Hare'"
        );
    }

    #[test]
    fn test_encode_nested_boolean() {
        let filter = Filter::compare("lanes", ComparisonOp::GtEq, Value::Int(2))
            .and(Filter::eq("surface", Value::Text("paved".into())).not());
        assert_eq!(
            encode(&filter, &unqualified).unwrap(),
            "(lanes >= 2) AND (NOT (surface = 'paved'))"
        );
    }

    #[test]
    fn test_encode_rejects_spatial() {
        let filter = Filter::bbox(0.0, 0.0, 1.0, 1.0);
        assert!(encode(&filter, &unqualified).is_err());
    }
}
