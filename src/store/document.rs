use std::cmp::Ordering;

use serde_json::{Map, Value};

/// A stored document. `_id` holds its identity.
pub type Document = Map<String, Value>;

pub const ID_FIELD: &str = "_id";

/// Resolves `path` in `document`. A key containing dots is tried verbatim
/// before the path is split into nested lookups.
pub fn get_path<'a>(document: &'a Document, path: &str) -> Option<&'a Value> {
    if let Some(value) = document.get(path) {
        return Some(value);
    }
    let mut segments = path.split('.');
    let mut current = document.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Adds `delta` to the counter at the dotted `path`, creating intermediate
/// objects and a zero counter as needed. Fails when the path runs through a
/// non-object value.
pub fn add_to_path(document: &mut Document, path: &str, delta: u64) -> Result<(), String> {
    let mut segments: Vec<&str> = path.split('.').collect();
    let leaf = segments.pop().unwrap_or(path);

    let mut target = document;
    for segment in segments {
        let next = target
            .entry(segment.to_owned())
            .or_insert_with(|| Value::Object(Map::new()));
        target = match next {
            Value::Object(map) => map,
            _ => return Err(format!("`{segment}` in `{path}` is not an object")),
        };
    }

    let counter = target.entry(leaf.to_owned()).or_insert(Value::from(0u64));
    let current = match counter {
        Value::Null => 0,
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| format!("`{path}` is not a non-negative integer"))?,
        _ => return Err(format!("`{path}` is not a number")),
    };
    *counter = Value::from(current + delta);
    Ok(())
}

/// Stable textual identity for a key: its compact JSON. Strings stay quoted,
/// so `""` and `"null"` never collide with each other or with `null`.
pub fn document_key(key: &Value) -> String {
    key.to_string()
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Number(_) => 1,
        Value::String(_) => 2,
        Value::Object(_) => 3,
        Value::Array(_) => 4,
        Value::Bool(_) => 5,
    }
}

/// Total order over JSON values: null, numbers, strings, objects, arrays,
/// booleans. Objects compare entry by entry in their stored order.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => x
                .as_f64()
                .partial_cmp(&y.as_f64())
                .unwrap_or(Ordering::Equal),
        },
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => x
            .iter()
            .zip(y.iter())
            .map(|(x, y)| compare_values(x, y))
            .find(|o| o.is_ne())
            .unwrap_or_else(|| x.len().cmp(&y.len())),
        (Value::Object(x), Value::Object(y)) => x
            .iter()
            .zip(y.iter())
            .map(|((xk, xv), (yk, yv))| xk.cmp(yk).then_with(|| compare_values(xv, yv)))
            .find(|o| o.is_ne())
            .unwrap_or_else(|| x.len().cmp(&y.len())),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

pub(crate) fn same_type(a: &Value, b: &Value) -> bool {
    type_rank(a) == type_rank(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn resolves_verbatim_and_nested_paths() {
        let d = doc(json!({"Event Date": "1994-01-01", "_id": {"year": 1994}, "a.b": 1}));
        assert_eq!(get_path(&d, "Event Date"), Some(&json!("1994-01-01")));
        assert_eq!(get_path(&d, "_id.year"), Some(&json!(1994)));
        assert_eq!(get_path(&d, "a.b"), Some(&json!(1)));
        assert_eq!(get_path(&d, "_id.month"), None);
    }

    #[test]
    fn adds_to_nested_counters() {
        let mut d = Document::new();
        add_to_path(&mut d, "value.crashes", 1).unwrap();
        add_to_path(&mut d, "value.crashes", 2).unwrap();
        add_to_path(&mut d, "value.fatalities", 0).unwrap();
        assert_eq!(Value::Object(d), json!({"value": {"crashes": 3, "fatalities": 0}}));
    }

    #[test]
    fn refuses_to_increment_through_text() {
        let mut d = doc(json!({"value": "x"}));
        assert!(add_to_path(&mut d, "value.crashes", 1).is_err());
        let mut d = doc(json!({"count": "x"}));
        assert!(add_to_path(&mut d, "count", 1).is_err());
    }

    #[test]
    fn orders_mixed_values() {
        let mut values = vec![
            json!({"year": 1994, "month": 10}),
            json!("CESSNA"),
            json!({"year": 1994, "month": 2}),
            json!(12),
            Value::Null,
            json!({"year": 1993, "month": 11}),
        ];
        values.sort_by(compare_values);
        assert_eq!(
            values,
            vec![
                Value::Null,
                json!(12),
                json!("CESSNA"),
                json!({"year": 1993, "month": 11}),
                json!({"year": 1994, "month": 2}),
                json!({"year": 1994, "month": 10}),
            ]
        );
    }

    #[test]
    fn keys_are_compact_json() {
        assert_eq!(document_key(&json!("abc")), r#""abc""#);
        assert_eq!(document_key(&json!({"year": 1994, "month": 0})), r#"{"year":1994,"month":0}"#);
        assert_eq!(document_key(&Value::Null), "null");
    }

    #[test]
    fn blank_and_null_keys_stay_distinct() {
        let keys = [Value::Null, json!("null"), json!(""), json!(0), json!("0")];
        let encoded: std::collections::HashSet<String> = keys.iter().map(document_key).collect();
        assert_eq!(encoded.len(), keys.len());
        assert!(encoded.iter().all(|key| !key.is_empty()));
    }
}
