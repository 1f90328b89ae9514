use super::{get_path, remove_path, set_path};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum UpdateError {
    #[error("cannot create field in non-object at '{0}'")]
    NotAnObject(String),
    #[error("cannot apply $inc to non-numeric field '{0}'")]
    NotNumeric(String),
    #[error("cannot apply $push to non-array field '{0}'")]
    NotAnArray(String),
}

/// A single update operator applied to one field path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum UpdateOperator {
    Set { path: String, value: Value },
    Inc { path: String, by: Value },
    Unset { path: String },
    Push { path: String, value: Value },
}

impl UpdateOperator {
    fn name(&self) -> &'static str {
        match self {
            UpdateOperator::Set { .. } => "$set",
            UpdateOperator::Inc { .. } => "$inc",
            UpdateOperator::Unset { .. } => "$unset",
            UpdateOperator::Push { .. } => "$push",
        }
    }
}

/// Update expression rendered from a pending mutation.
///
/// Operators are applied in the order they were added.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Update {
    operators: Vec<UpdateOperator>,
}

impl Update {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.operators.push(UpdateOperator::Set {
            path: path.into(),
            value: value.into(),
        });
        self
    }

    pub fn inc(mut self, path: impl Into<String>, by: impl Into<Value>) -> Self {
        self.operators.push(UpdateOperator::Inc {
            path: path.into(),
            by: by.into(),
        });
        self
    }

    pub fn unset(mut self, path: impl Into<String>) -> Self {
        self.operators.push(UpdateOperator::Unset { path: path.into() });
        self
    }

    pub fn push(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.operators.push(UpdateOperator::Push {
            path: path.into(),
            value: value.into(),
        });
        self
    }

    pub fn operators(&self) -> &[UpdateOperator] {
        &self.operators
    }

    pub fn is_empty(&self) -> bool {
        self.operators.is_empty()
    }

    /// Render as a database update document, e.g. `{"$set": {"title": "x"}}`.
    pub fn to_document(&self) -> Value {
        let mut rendered = Map::new();
        for operator in &self.operators {
            let (path, value) = match operator {
                UpdateOperator::Set { path, value } => (path, value.clone()),
                UpdateOperator::Inc { path, by } => (path, by.clone()),
                UpdateOperator::Unset { path } => (path, Value::String(String::new())),
                UpdateOperator::Push { path, value } => (path, value.clone()),
            };
            let section = rendered
                .entry(operator.name())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(fields) = section {
                fields.insert(path.clone(), value);
            }
        }
        Value::Object(rendered)
    }

    /// Apply to a document in place. Returns whether anything changed.
    pub fn apply_to(&self, document: &mut Value) -> Result<bool, UpdateError> {
        let mut modified = false;
        for operator in &self.operators {
            match operator {
                UpdateOperator::Set { path, value } => {
                    if get_path(document, path) != Some(value) {
                        set_path(document, path, value.clone())?;
                        modified = true;
                    }
                }
                UpdateOperator::Inc { path, by } => {
                    let next = match get_path(document, path) {
                        None => by.clone(),
                        Some(current) => add_numbers(current, by)
                            .ok_or_else(|| UpdateError::NotNumeric(path.clone()))?,
                    };
                    set_path(document, path, next)?;
                    modified = true;
                }
                UpdateOperator::Unset { path } => {
                    modified |= remove_path(document, path).is_some();
                }
                UpdateOperator::Push { path, value } => {
                    let mut items = match get_path(document, path) {
                        None => Vec::new(),
                        Some(Value::Array(items)) => items.clone(),
                        Some(_) => return Err(UpdateError::NotAnArray(path.clone())),
                    };
                    items.push(value.clone());
                    set_path(document, path, Value::Array(items))?;
                    modified = true;
                }
            }
        }
        Ok(modified)
    }
}

fn add_numbers(current: &Value, by: &Value) -> Option<Value> {
    // Integers stay integers.
    if let (Some(a), Some(b)) = (current.as_i64(), by.as_i64()) {
        return Some(Value::from(a.checked_add(b)?));
    }
    let sum = current.as_f64()? + by.as_f64()?;
    serde_json::Number::from_f64(sum).map(Value::Number)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_render_groups_by_operator() {
        let update = Update::new()
            .set("title", "t")
            .set("body", "b")
            .inc("views", 1)
            .unset("draft");
        assert_eq!(
            update.to_document(),
            json!({
                "$set": {"title": "t", "body": "b"},
                "$inc": {"views": 1},
                "$unset": {"draft": ""}
            })
        );
    }

    #[test]
    fn test_apply_set_and_inc() {
        let mut doc = json!({"title": "old", "views": 2});
        let changed = Update::new()
            .set("title", "new")
            .inc("views", 3)
            .apply_to(&mut doc)
            .unwrap();
        assert!(changed);
        assert_eq!(doc, json!({"title": "new", "views": 5}));
    }

    #[test]
    fn test_inc_missing_field_starts_from_zero() {
        let mut doc = json!({});
        Update::new().inc("likes", 2.5).apply_to(&mut doc).unwrap();
        assert_eq!(doc, json!({"likes": 2.5}));
    }

    #[test]
    fn test_set_same_value_is_not_a_modification() {
        let mut doc = json!({"title": "same"});
        let changed = Update::new().set("title", "same").apply_to(&mut doc).unwrap();
        assert!(!changed);
    }

    #[test]
    fn test_push_appends_and_rejects_scalars() {
        let mut doc = json!({"tags": ["a"], "title": "x"});
        Update::new().push("tags", "b").apply_to(&mut doc).unwrap();
        assert_eq!(doc["tags"], json!(["a", "b"]));

        let err = Update::new().push("title", "y").apply_to(&mut doc).unwrap_err();
        assert_eq!(err, UpdateError::NotAnArray("title".to_string()));
    }

    #[test]
    fn test_inc_on_string_fails() {
        let mut doc = json!({"title": "x"});
        let err = Update::new().inc("title", 1).apply_to(&mut doc).unwrap_err();
        assert_eq!(err, UpdateError::NotNumeric("title".to_string()));
    }
}
