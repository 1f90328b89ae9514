//! Document primitives shared by the tracker and the drivers.
//!
//! Documents are plain `serde_json::Value` objects. Field paths use dotted
//! notation (`author.name`), the same way the database addresses nested
//! fields in filters, updates, sorts and index keys.

pub mod filter;
pub mod key;
pub mod update;

pub use filter::Filter;
pub use key::PrimaryKey;
pub use update::{Update, UpdateError, UpdateOperator};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;

/// Sort direction for queries and index keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Ascending,
    Descending,
}

impl SortDirection {
    pub fn as_i32(self) -> i32 {
        match self {
            SortDirection::Ascending => 1,
            SortDirection::Descending => -1,
        }
    }
}

/// Resolve a dotted path inside a document.
pub fn get_path<'a>(document: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = document;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Set a dotted path, creating intermediate objects as needed.
///
/// Fails when an intermediate segment exists but is not an object.
pub fn set_path(document: &mut Value, path: &str, value: Value) -> Result<(), UpdateError> {
    let (parent, leaf) = parent_object(document, path, true)?;
    match parent {
        Some(map) => {
            map.insert(leaf.to_string(), value);
            Ok(())
        }
        None => Err(UpdateError::NotAnObject(path.to_string())),
    }
}

/// Remove a dotted path, returning the previous value if there was one.
pub fn remove_path(document: &mut Value, path: &str) -> Option<Value> {
    match parent_object(document, path, false) {
        Ok((Some(map), leaf)) => map.remove(leaf),
        _ => None,
    }
}

fn parent_object<'a, 'p>(
    document: &'a mut Value,
    path: &'p str,
    create: bool,
) -> Result<(Option<&'a mut Map<String, Value>>, &'p str), UpdateError> {
    let mut segments: Vec<&str> = path.split('.').collect();
    let leaf = segments.pop().unwrap_or(path);
    let mut current = document;
    for segment in segments {
        let map = match current {
            Value::Object(map) => map,
            _ => return Err(UpdateError::NotAnObject(path.to_string())),
        };
        if !map.contains_key(segment) {
            if !create {
                return Ok((None, leaf));
            }
            map.insert(segment.to_string(), Value::Object(Map::new()));
        }
        current = match map.get_mut(segment) {
            Some(next) => next,
            None => return Ok((None, leaf)),
        };
    }
    match current {
        Value::Object(map) => Ok((Some(map), leaf)),
        _ => Err(UpdateError::NotAnObject(path.to_string())),
    }
}

/// Total order over JSON values, following the database's type bracketing:
/// null < numbers < strings < objects < arrays < booleans.
pub fn compare_values(left: &Value, right: &Value) -> Ordering {
    fn rank(value: &Value) -> u8 {
        match value {
            Value::Null => 0,
            Value::Number(_) => 1,
            Value::String(_) => 2,
            Value::Object(_) => 3,
            Value::Array(_) => 4,
            Value::Bool(_) => 5,
        }
    }

    match (left, right) {
        (Value::Number(a), Value::Number(b)) => {
            match (a.as_i64(), b.as_i64()) {
                (Some(x), Some(y)) => x.cmp(&y),
                _ => {
                    let x = a.as_f64().unwrap_or(f64::NAN);
                    let y = b.as_f64().unwrap_or(f64::NAN);
                    x.partial_cmp(&y).unwrap_or(Ordering::Equal)
                }
            }
        }
        (Value::String(a), Value::String(b)) => a.cmp(b),
        (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
        (Value::Array(a), Value::Array(b)) => {
            for (x, y) in a.iter().zip(b.iter()) {
                let ord = compare_values(x, y);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            a.len().cmp(&b.len())
        }
        (Value::Object(a), Value::Object(b)) => {
            for ((ka, va), (kb, vb)) in a.iter().zip(b.iter()) {
                let ord = ka.cmp(kb).then_with(|| compare_values(va, vb));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            a.len().cmp(&b.len())
        }
        _ => rank(left).cmp(&rank(right)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_get_path_nested() {
        let doc = json!({"author": {"name": "ada"}, "tags": ["a", "b"]});
        assert_eq!(get_path(&doc, "author.name"), Some(&json!("ada")));
        assert_eq!(get_path(&doc, "tags.1"), Some(&json!("b")));
        assert_eq!(get_path(&doc, "author.email"), None);
    }

    #[test]
    fn test_set_path_creates_intermediate_objects() {
        let mut doc = json!({"title": "x"});
        set_path(&mut doc, "meta.views", json!(3)).unwrap();
        assert_eq!(doc, json!({"title": "x", "meta": {"views": 3}}));
    }

    #[test]
    fn test_set_path_through_scalar_fails() {
        let mut doc = json!({"title": "x"});
        let err = set_path(&mut doc, "title.inner", json!(1)).unwrap_err();
        assert!(matches!(err, UpdateError::NotAnObject(_)));
    }

    #[test]
    fn test_remove_path() {
        let mut doc = json!({"meta": {"views": 3, "likes": 1}});
        assert_eq!(remove_path(&mut doc, "meta.views"), Some(json!(3)));
        assert_eq!(remove_path(&mut doc, "meta.missing"), None);
        assert_eq!(remove_path(&mut doc, "other.views"), None);
        assert_eq!(doc, json!({"meta": {"likes": 1}}));
    }

    #[test]
    fn test_compare_values_type_brackets() {
        assert_eq!(compare_values(&json!(null), &json!(1)), Ordering::Less);
        assert_eq!(compare_values(&json!(2), &json!(10)), Ordering::Less);
        assert_eq!(compare_values(&json!(1.5), &json!(1)), Ordering::Greater);
        assert_eq!(compare_values(&json!("b"), &json!("a")), Ordering::Greater);
        assert_eq!(compare_values(&json!("z"), &json!(true)), Ordering::Less);
    }
}
