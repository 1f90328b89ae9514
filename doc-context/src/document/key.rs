use super::Filter;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Canonical identity of a tracked document, rendered from its primary-key
/// filter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrimaryKey(String);

impl PrimaryKey {
    pub fn from_filter(filter: &Filter) -> Self {
        PrimaryKey(filter.to_document().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&Filter> for PrimaryKey {
    fn from(filter: &Filter) -> Self {
        Self::from_filter(filter)
    }
}

impl fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equal_filters_give_equal_keys() {
        let a = PrimaryKey::from_filter(&Filter::eq("id", 1).and_eq("tenant", "x"));
        let b = PrimaryKey::from_filter(&Filter::eq("tenant", "x").and_eq("id", 1));
        assert_eq!(a, b);
        assert_eq!(a.as_str(), r#"{"id":1,"tenant":"x"}"#);
    }

    #[test]
    fn test_value_types_are_distinguished() {
        let number = PrimaryKey::from_filter(&Filter::eq("id", 1));
        let string = PrimaryKey::from_filter(&Filter::eq("id", "1"));
        assert_ne!(number, string);
    }
}
