use std::cmp::Ordering;
use std::ops::Bound;

use chrono::NaiveDate;
use serde_json::Value;

use super::document::{compare_values, get_path, same_type, Document};

/// Query filter understood by every store.
///
/// Field names are dotted paths, so `_id.year` reaches into a view key.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Filter {
    #[default]
    All,
    Eq {
        field: String,
        value: Value,
    },
    Range {
        field: String,
        from: Bound<Value>,
        to: Bound<Value>,
    },
    And(Vec<Filter>),
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Filter {
        Filter::Eq {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn range(field: impl Into<String>, from: Bound<Value>, to: Bound<Value>) -> Filter {
        Filter::Range {
            field: field.into(),
            from,
            to,
        }
    }

    /// Dates in `[from, to)`.
    pub fn date_range(field: impl Into<String>, from: NaiveDate, to: NaiveDate) -> Filter {
        Filter::range(
            field,
            Bound::Included(Value::String(from.to_string())),
            Bound::Excluded(Value::String(to.to_string())),
        )
    }

    pub fn and(self, other: Filter) -> Filter {
        match (self, other) {
            (Filter::All, other) | (other, Filter::All) => other,
            (Filter::And(mut filters), Filter::And(more)) => {
                filters.extend(more);
                Filter::And(filters)
            }
            (Filter::And(mut filters), other) => {
                filters.push(other);
                Filter::And(filters)
            }
            (this, other) => Filter::And(vec![this, other]),
        }
    }

    pub fn matches(&self, document: &Document) -> bool {
        match self {
            Filter::All => true,
            Filter::Eq { field, value } => {
                let actual = get_path(document, field).unwrap_or(&Value::Null);
                same_type(actual, value) && compare_values(actual, value) == Ordering::Equal
            }
            Filter::Range { field, from, to } => {
                let Some(actual) = get_path(document, field) else {
                    return false;
                };
                let above = match from {
                    Bound::Included(v) => same_type(actual, v) && compare_values(actual, v).is_ge(),
                    Bound::Excluded(v) => same_type(actual, v) && compare_values(actual, v).is_gt(),
                    Bound::Unbounded => true,
                };
                let below = match to {
                    Bound::Included(v) => same_type(actual, v) && compare_values(actual, v).is_le(),
                    Bound::Excluded(v) => same_type(actual, v) && compare_values(actual, v).is_lt(),
                    Bound::Unbounded => true,
                };
                above && below
            }
            Filter::And(filters) => filters.iter().all(|f| f.matches(document)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn date_range_is_half_open() {
        let filter = Filter::date_range(
            "Event Date",
            NaiveDate::from_ymd_opt(1994, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(1994, 1, 2).unwrap(),
        );
        assert!(filter.matches(&doc(json!({"Event Date": "1994-01-01"}))));
        assert!(!filter.matches(&doc(json!({"Event Date": "1994-01-02"}))));
        assert!(!filter.matches(&doc(json!({"Event Date": "1993-12-31"}))));
        assert!(!filter.matches(&doc(json!({"Make": "CESSNA"}))));
    }

    #[test]
    fn ranges_do_not_cross_types() {
        let filter = Filter::range("_id.year", Bound::Included(json!(1994)), Bound::Included(json!(1995)));
        assert!(filter.matches(&doc(json!({"_id": {"year": 1995, "month": 3}}))));
        assert!(!filter.matches(&doc(json!({"_id": {"year": "1995"}}))));
        assert!(!filter.matches(&doc(json!({"_id": {"year": 1996}}))));
    }

    #[test]
    fn combines_with_and() {
        let filter = Filter::All
            .and(Filter::eq("Make", "CESSNA"))
            .and(Filter::eq("Country", "United States"));
        assert!(matches!(&filter, Filter::And(parts) if parts.len() == 2));
        assert!(filter.matches(&doc(json!({"Make": "CESSNA", "Country": "United States"}))));
        assert!(!filter.matches(&doc(json!({"Make": "CESSNA", "Country": "Canada"}))));
    }

    #[test]
    fn eq_null_matches_missing_fields() {
        let filter = Filter::eq("Air Carrier", Value::Null);
        assert!(filter.matches(&doc(json!({"Make": "PIPER"}))));
        assert!(!filter.matches(&doc(json!({"Air Carrier": "DELTA"}))));
    }
}
