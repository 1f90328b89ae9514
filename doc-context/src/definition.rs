//! Collection definitions.
//!
//! A definition names a collection, says how to derive a document's
//! primary-key filter and lists the indexes and post-commit listeners that
//! belong to it. Contexts build one tracker per definition name.

use crate::aggregate::Aggregate;
use crate::document::Filter;
use crate::index::IndexDefinition;
use crate::listener::CollectionListener;
use std::fmt;
use std::sync::Arc;

/// Maps an aggregate instance to the filter selecting its stored document.
pub type PrimaryKeySelector<A> = Arc<dyn Fn(&A) -> Filter + Send + Sync>;

pub struct CollectionDefinition<A: Aggregate> {
    name: String,
    primary_key: PrimaryKeySelector<A>,
    indexes: Vec<IndexDefinition>,
    listeners: Vec<Arc<dyn CollectionListener<A>>>,
}

impl<A: Aggregate> CollectionDefinition<A> {
    pub fn new<F>(name: impl Into<String>, primary_key: F) -> Self
    where
        F: Fn(&A) -> Filter + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            primary_key: Arc::new(primary_key),
            indexes: Vec::new(),
            listeners: Vec::new(),
        }
    }

    pub fn has_index(mut self, index: IndexDefinition) -> Self {
        self.indexes.push(index);
        self
    }

    pub fn with_listener<L>(self, listener: L) -> Self
    where
        L: CollectionListener<A> + 'static,
    {
        self.with_shared_listener(Arc::new(listener))
    }

    pub fn with_shared_listener(mut self, listener: Arc<dyn CollectionListener<A>>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn primary_key(&self) -> &PrimaryKeySelector<A> {
        &self.primary_key
    }

    pub fn indexes(&self) -> &[IndexDefinition] {
        &self.indexes
    }

    pub fn listeners(&self) -> &[Arc<dyn CollectionListener<A>>] {
        &self.listeners
    }
}

impl<A: Aggregate> Clone for CollectionDefinition<A> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            primary_key: self.primary_key.clone(),
            indexes: self.indexes.clone(),
            listeners: self.listeners.clone(),
        }
    }
}

impl<A: Aggregate> fmt::Debug for CollectionDefinition<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectionDefinition")
            .field("name", &self.name)
            .field("indexes", &self.indexes)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}
