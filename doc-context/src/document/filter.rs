use super::get_path;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Conjunction of equality predicates over dotted field paths.
///
/// Predicates are kept in a `BTreeMap`, so two filters built from the same
/// predicates in a different order render identically. Primary keys rely on
/// that.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Filter {
    predicates: BTreeMap<String, Value>,
}

impl Filter {
    /// Matches every document.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::empty().and_eq(field, value)
    }

    pub fn and_eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.predicates.insert(field.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    pub fn predicates(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.predicates.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// An array field matches when it equals the value or contains it.
    pub fn matches(&self, document: &Value) -> bool {
        self.predicates.iter().all(|(path, expected)| {
            match get_path(document, path) {
                Some(actual) if actual == expected => true,
                Some(Value::Array(items)) => items.iter().any(|item| item == expected),
                Some(_) => false,
                None => expected.is_null(),
            }
        })
    }

    pub fn to_document(&self) -> Value {
        let map: Map<String, Value> = self
            .predicates
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Value::Object(map)
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_document())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_empty_filter_matches_everything() {
        assert!(Filter::empty().matches(&json!({"a": 1})));
        assert!(Filter::empty().matches(&json!({})));
    }

    #[test]
    fn test_equality_on_nested_path() {
        let filter = Filter::eq("author.name", "ada");
        assert!(filter.matches(&json!({"author": {"name": "ada"}})));
        assert!(!filter.matches(&json!({"author": {"name": "bob"}})));
        assert!(!filter.matches(&json!({"title": "x"})));
    }

    #[test]
    fn test_array_membership() {
        let filter = Filter::eq("tags", "rust");
        assert!(filter.matches(&json!({"tags": ["go", "rust"]})));
        assert!(!filter.matches(&json!({"tags": ["go"]})));
    }

    #[test]
    fn test_missing_field_matches_null() {
        let filter = Filter::eq("deleted_at", Value::Null);
        assert!(filter.matches(&json!({"title": "x"})));
    }

    #[test]
    fn test_render_is_order_independent() {
        let a = Filter::eq("tenant", "t1").and_eq("id", 7);
        let b = Filter::eq("id", 7).and_eq("tenant", "t1");
        assert_eq!(a.to_string(), b.to_string());
        assert_eq!(a, b);
    }
}
