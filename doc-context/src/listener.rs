//! Post-commit listeners.
//!
//! Listeners are handed to a collection definition up front and are invoked
//! once per collection after a save has durably committed. They see every
//! mutation drained during that save, grouped by the document it came from.

use crate::aggregate::Aggregate;
use crate::document::PrimaryKey;
use crate::error::BoxError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;

/// What a save did to one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeOutcome {
    Inserted,
    Updated,
    Deleted,
}

#[derive(Debug, Clone)]
pub struct DocumentChange<M> {
    pub key: PrimaryKey,
    pub outcome: ChangeOutcome,
    /// Mutations drained from the instance, in queue order. For `Deleted`
    /// documents these produced no write.
    pub mutations: Vec<M>,
}

/// Notification payload for one collection and one committed save.
pub struct ChangesSaved<A: Aggregate> {
    collection: String,
    saved_at: DateTime<Utc>,
    changes: Vec<DocumentChange<A::Mutation>>,
}

impl<A: Aggregate> ChangesSaved<A> {
    pub(crate) fn new(collection: String, changes: Vec<DocumentChange<A::Mutation>>) -> Self {
        Self {
            collection,
            saved_at: Utc::now(),
            changes,
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn saved_at(&self) -> DateTime<Utc> {
        self.saved_at
    }

    pub fn changes(&self) -> &[DocumentChange<A::Mutation>] {
        &self.changes
    }

    /// Every mutation of the save, across documents, in processing order.
    pub fn mutations(&self) -> impl Iterator<Item = &A::Mutation> {
        self.changes.iter().flat_map(|change| change.mutations.iter())
    }

    pub fn mutation_count(&self) -> usize {
        self.changes.iter().map(|change| change.mutations.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

impl<A: Aggregate> fmt::Debug for ChangesSaved<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangesSaved")
            .field("collection", &self.collection)
            .field("saved_at", &self.saved_at)
            .field("changes", &self.changes)
            .finish()
    }
}

/// Observer of committed changes for one collection.
#[async_trait]
pub trait CollectionListener<A: Aggregate>: Send + Sync {
    async fn on_changes_saved(&self, changes: &ChangesSaved<A>) -> Result<(), BoxError>;
}
