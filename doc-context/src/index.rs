//! Declared indexes and their reconciliation.
//!
//! Each collection definition carries an ordered list of index declarations.
//! At initialization they are created one at a time, in declaration order.
//! When the database reports that an index with the same keys or name
//! already exists with a different definition, the declaration's conflict
//! policy decides whether to drop the existing index and retry once.

use crate::driver::{DocumentCollection, DriverError, IndexKeys, IndexModel, IndexOptions};
use crate::error::{ContextError, ContextResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What to do when an index declaration collides with an existing index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictResolution {
    /// Surface the conflict.
    #[default]
    None,
    /// Drop the existing index and create the declared one.
    Drop,
}

/// Text index weights.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Weights {
    fields: BTreeMap<String, i32>,
}

impl Weights {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assign(mut self, field: impl Into<String>, weight: i32) -> Self {
        self.fields.insert(field.into(), weight);
        self
    }
}

impl From<Weights> for BTreeMap<String, i32> {
    fn from(weights: Weights) -> Self {
        weights.fields
    }
}

/// One declared index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDefinition {
    model: IndexModel,
    conflict_resolution: ConflictResolution,
}

impl IndexDefinition {
    pub fn new(keys: IndexKeys) -> Self {
        Self {
            model: IndexModel::new(keys, IndexOptions::default()),
            conflict_resolution: ConflictResolution::None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.model.options.name = Some(name.into());
        self
    }

    pub fn unique(mut self) -> Self {
        self.model.options.unique = true;
        self
    }

    pub fn sparse(mut self) -> Self {
        self.model.options.sparse = true;
        self
    }

    pub fn expire_after(mut self, ttl: Duration) -> Self {
        self.model.options.expire_after_seconds = Some(ttl.as_secs());
        self
    }

    pub fn weights(mut self, weights: Weights) -> Self {
        self.model.options.weights = Some(weights.into());
        self
    }

    pub fn default_language(mut self, language: impl Into<String>) -> Self {
        self.model.options.default_language = Some(language.into());
        self
    }

    pub fn on_conflict(mut self, resolution: ConflictResolution) -> Self {
        self.conflict_resolution = resolution;
        self
    }

    pub fn model(&self) -> &IndexModel {
        &self.model
    }

    pub fn name(&self) -> String {
        self.model.name()
    }

    pub fn conflict_resolution(&self) -> ConflictResolution {
        self.conflict_resolution
    }
}

/// Applies a collection's declared indexes.
pub struct IndexReconciler<'a, C: DocumentCollection> {
    collection: &'a C,
}

impl<'a, C: DocumentCollection> IndexReconciler<'a, C> {
    pub fn new(collection: &'a C) -> Self {
        Self { collection }
    }

    /// Create every declared index in order. Returns the resulting index
    /// names. Stops at the first unresolved failure.
    pub async fn apply(&self, definitions: &[IndexDefinition]) -> ContextResult<Vec<String>> {
        let mut names = Vec::with_capacity(definitions.len());
        for definition in definitions {
            names.push(self.apply_one(definition).await?);
        }
        Ok(names)
    }

    async fn apply_one(&self, definition: &IndexDefinition) -> ContextResult<String> {
        let collection = self.collection.name();
        let index = definition.name();

        let err = match self.collection.create_index(definition.model()).await {
            Ok(name) => {
                debug!(collection, index = %name, "index in place");
                return Ok(name);
            }
            Err(err) => err,
        };

        let conflicting = match &err {
            DriverError::Command(command) if command.code.is_index_conflict() => {
                command.conflicting_index_name()
            }
            _ => {
                return Err(ContextError::Index {
                    collection: collection.to_string(),
                    index,
                    source: err,
                })
            }
        };

        let existing = match (definition.conflict_resolution(), conflicting) {
            (ConflictResolution::Drop, Some(existing)) => existing,
            (ConflictResolution::Drop, None) => {
                warn!(collection, index = %index, "conflict payload names no existing index");
                return Err(self.conflict(&index, err));
            }
            (ConflictResolution::None, _) => return Err(self.conflict(&index, err)),
        };

        info!(collection, index = %index, existing = %existing, "dropping conflicting index");
        self.collection
            .drop_index(&existing)
            .await
            .map_err(|source| ContextError::Index {
                collection: collection.to_string(),
                index: index.clone(),
                source,
            })?;

        // A second failure is final.
        self.collection
            .create_index(definition.model())
            .await
            .map_err(|source| {
                if source.code().is_some_and(|code| code.is_index_conflict()) {
                    self.conflict(&index, source)
                } else {
                    ContextError::Index {
                        collection: collection.to_string(),
                        index: index.clone(),
                        source,
                    }
                }
            })
    }

    fn conflict(&self, index: &str, source: DriverError) -> ContextError {
        ContextError::IndexConflict {
            collection: self.collection.name().to_string(),
            index: index.to_string(),
            source,
        }
    }
}
