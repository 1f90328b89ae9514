//! Translation of tracked state into write operations.
//!
//! A `ChangeSet` is built by walking a collection's tracked table in attach
//! order. It owns the mutations it drained until the save either commits,
//! in which case tracked states advance and listeners are notified, or is
//! abandoned, in which case dropping the change set puts the mutations back
//! and restores every state it touched.

use super::state::{DocumentState, TrackedDocument};
use super::table::TrackedTable;
use crate::aggregate::{Aggregate, DocumentRef, Mutation};
use crate::definition::PrimaryKeySelector;
use crate::document::PrimaryKey;
use crate::driver::WriteOperation;
use crate::error::{ContextError, ContextResult, ListenerFailure};
use crate::listener::{ChangeOutcome, ChangesSaved, CollectionListener, DocumentChange};
use futures::future::{BoxFuture, FutureExt};
use std::sync::Arc;
use tracing::warn;

/// Work a collection tracker contributed to a save, awaiting the outcome of
/// the surrounding transaction. Dropping it without `accept` rolls back.
pub(crate) trait PendingChanges: Send {
    fn collection(&self) -> &str;

    fn write_count(&self) -> usize;

    /// Advance tracked states after commit. The returned future notifies the
    /// collection's listeners and yields their failures.
    fn accept(self: Box<Self>) -> BoxFuture<'static, Vec<ListenerFailure>>;
}

struct ProcessedDocument<A: Aggregate> {
    key: PrimaryKey,
    document: DocumentRef<A>,
    prior_state: DocumentState,
    state: DocumentState,
    mutations: Vec<A::Mutation>,
}

pub(crate) struct ChangeSet<A: Aggregate> {
    collection: String,
    table: Arc<TrackedTable<A>>,
    listeners: Vec<Arc<dyn CollectionListener<A>>>,
    processed: Vec<ProcessedDocument<A>>,
    writes: Vec<WriteOperation>,
    write_count: usize,
    settled: bool,
}

impl<A: Aggregate> ChangeSet<A> {
    pub fn new(
        collection: String,
        table: Arc<TrackedTable<A>>,
        listeners: Vec<Arc<dyn CollectionListener<A>>>,
    ) -> Self {
        Self {
            collection,
            table,
            listeners,
            processed: Vec::new(),
            writes: Vec::new(),
            write_count: 0,
            settled: false,
        }
    }

    /// Drain one tracked document and render its writes.
    pub fn record(
        &mut self,
        key: PrimaryKey,
        tracked: TrackedDocument<A>,
        primary_key: &PrimaryKeySelector<A>,
    ) -> ContextResult<()> {
        let (filter, mut writes, mutations) = {
            let aggregate = tracked.document.read();
            let filter = primary_key(&*aggregate);
            if PrimaryKey::from_filter(&filter) != key {
                return Err(ContextError::InvalidState {
                    collection: self.collection.clone(),
                    key,
                    reason: format!(
                        "primary key changed to {} after the document was attached",
                        filter
                    ),
                });
            }
            // Serialize before draining so a failure leaves the queue intact.
            let writes = match tracked.state {
                DocumentState::Added => {
                    let document = serde_json::to_value(&*aggregate).map_err(|source| {
                        ContextError::Serialization {
                            collection: self.collection.clone(),
                            source,
                        }
                    })?;
                    vec![WriteOperation::InsertOne { document }]
                }
                DocumentState::Deleted => vec![WriteOperation::DeleteOne {
                    filter: filter.clone(),
                }],
                DocumentState::Unchanged | DocumentState::Modified => Vec::new(),
            };
            (filter, writes, aggregate.dequeue_mutations())
        };

        let mut state = tracked.state;
        if state == DocumentState::Unchanged && !mutations.is_empty() {
            self.table.transition(
                &key,
                &tracked.document,
                DocumentState::Unchanged,
                Some(DocumentState::Modified),
            );
            state = DocumentState::Modified;
        }

        if state == DocumentState::Modified {
            writes.extend(mutations.iter().map(|mutation| WriteOperation::UpdateOne {
                filter: filter.clone(),
                update: mutation.to_update(),
            }));
        }
        self.writes.append(&mut writes);

        self.processed.push(ProcessedDocument {
            key,
            document: tracked.document,
            prior_state: tracked.state,
            state,
            mutations,
        });
        Ok(())
    }

    /// Hand the rendered writes to the caller for submission.
    pub fn take_writes(&mut self) -> Vec<WriteOperation> {
        self.write_count = self.writes.len();
        std::mem::take(&mut self.writes)
    }

    fn advance(&mut self) -> ChangesSaved<A> {
        self.settled = true;
        let mut changes = Vec::new();
        for processed in std::mem::take(&mut self.processed) {
            self.table.transition(
                &processed.key,
                &processed.document,
                processed.state,
                processed.state.after_commit(),
            );
            let outcome = match processed.state {
                DocumentState::Added => ChangeOutcome::Inserted,
                DocumentState::Deleted => ChangeOutcome::Deleted,
                DocumentState::Modified | DocumentState::Unchanged => {
                    if processed.mutations.is_empty() {
                        continue;
                    }
                    ChangeOutcome::Updated
                }
            };
            changes.push(DocumentChange {
                key: processed.key,
                outcome,
                mutations: processed.mutations,
            });
        }
        ChangesSaved::new(self.collection.clone(), changes)
    }

    fn rollback(&mut self) {
        for processed in std::mem::take(&mut self.processed).into_iter().rev() {
            processed
                .document
                .read()
                .pending_mutations()
                .requeue(processed.mutations);
            if processed.state != processed.prior_state {
                self.table.transition(
                    &processed.key,
                    &processed.document,
                    processed.state,
                    Some(processed.prior_state),
                );
            }
        }
    }
}

impl<A: Aggregate> PendingChanges for ChangeSet<A> {
    fn collection(&self) -> &str {
        &self.collection
    }

    fn write_count(&self) -> usize {
        self.write_count
    }

    fn accept(mut self: Box<Self>) -> BoxFuture<'static, Vec<ListenerFailure>> {
        let saved = self.advance();
        let listeners = std::mem::take(&mut self.listeners);
        let collection = self.collection.clone();
        async move {
            let mut failures = Vec::new();
            for (position, listener) in listeners.iter().enumerate() {
                if let Err(error) = listener.on_changes_saved(&saved).await {
                    warn!(collection = %collection, listener = position, error = %error, "post-commit listener failed");
                    failures.push(ListenerFailure {
                        collection: collection.clone(),
                        listener: position,
                        error,
                    });
                }
            }
            failures
        }
        .boxed()
    }
}

impl<A: Aggregate> Drop for ChangeSet<A> {
    fn drop(&mut self) {
        if !self.settled {
            self.rollback();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{document_ref, PendingMutations};
    use crate::document::{Filter, Update};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct Item {
        id: u32,
        name: String,
        #[serde(skip)]
        pending: PendingMutations<Renamed>,
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Renamed(String);

    impl Mutation<Item> for Renamed {
        fn apply(&self, item: &mut Item) {
            item.name = self.0.clone();
        }

        fn to_update(&self) -> Update {
            Update::new().set("name", self.0.clone())
        }
    }

    impl Aggregate for Item {
        type Mutation = Renamed;

        fn pending_mutations(&self) -> &PendingMutations<Renamed> {
            &self.pending
        }
    }

    fn selector() -> PrimaryKeySelector<Item> {
        Arc::new(|item: &Item| Filter::eq("id", item.id))
    }

    fn item(id: u32) -> DocumentRef<Item> {
        document_ref(Item {
            id,
            ..Default::default()
        })
    }

    fn key(id: u32) -> PrimaryKey {
        PrimaryKey::from_filter(&Filter::eq("id", id))
    }

    fn change_set(table: &Arc<TrackedTable<Item>>) -> ChangeSet<Item> {
        ChangeSet::new("items".to_string(), table.clone(), Vec::new())
    }

    fn record_all(changes: &mut ChangeSet<Item>, table: &TrackedTable<Item>) {
        for (key, tracked) in table.snapshot() {
            changes.record(key, tracked, &selector()).unwrap();
        }
    }

    #[test]
    fn test_writes_follow_state_and_mutation_order() {
        let table = Arc::new(TrackedTable::new());
        let added = item(1);
        let edited = item(2);
        let deleted = item(3);
        added.write().append(Renamed("new".into()));
        edited.write().append(Renamed("a".into()));
        edited.write().append(Renamed("b".into()));
        deleted.write().append(Renamed("gone".into()));
        table.replace(key(1), added, DocumentState::Added);
        table.replace(key(2), edited.clone(), DocumentState::Unchanged);
        table.replace(key(3), deleted, DocumentState::Deleted);

        let mut changes = change_set(&table);
        record_all(&mut changes, &table);
        let writes = changes.take_writes();

        let kinds: Vec<&str> = writes.iter().map(|w| w.kind()).collect();
        assert_eq!(kinds, vec!["insert", "update", "update", "delete"]);
        assert_eq!(changes.write_count(), 4);
        assert_eq!(table.state_of(&key(2)), Some(DocumentState::Modified));
        assert!(edited.read().pending_mutations().is_empty());
        match &writes[0] {
            WriteOperation::InsertOne { document } => {
                assert_eq!(document, &serde_json::json!({"id": 1, "name": "new"}))
            }
            other => panic!("unexpected write {:?}", other),
        }
    }

    #[test]
    fn test_unchanged_without_mutations_writes_nothing() {
        let table = Arc::new(TrackedTable::new());
        table.replace(key(1), item(1), DocumentState::Unchanged);

        let mut changes = change_set(&table);
        record_all(&mut changes, &table);
        assert!(changes.take_writes().is_empty());
        assert_eq!(table.state_of(&key(1)), Some(DocumentState::Unchanged));
    }

    #[test]
    fn test_drop_restores_states_and_requeues_mutations() {
        let table = Arc::new(TrackedTable::new());
        let edited = item(1);
        edited.write().append(Renamed("a".into()));
        table.replace(key(1), edited.clone(), DocumentState::Unchanged);

        {
            let mut changes = change_set(&table);
            record_all(&mut changes, &table);
            edited.write().append(Renamed("b".into()));
        }

        assert_eq!(table.state_of(&key(1)), Some(DocumentState::Unchanged));
        assert_eq!(
            edited.read().pending_mutations().snapshot(),
            vec![Renamed("a".into()), Renamed("b".into())]
        );
    }

    #[tokio::test]
    async fn test_accept_advances_states() {
        let table = Arc::new(TrackedTable::new());
        let added = item(1);
        let edited = item(2);
        edited.write().append(Renamed("a".into()));
        table.replace(key(1), added, DocumentState::Added);
        table.replace(key(2), edited, DocumentState::Unchanged);
        table.replace(key(3), item(3), DocumentState::Deleted);

        let mut changes = change_set(&table);
        record_all(&mut changes, &table);
        changes.take_writes();
        let failures = Box::new(changes).accept().await;

        assert!(failures.is_empty());
        assert_eq!(table.keys(), vec![key(1), key(2)]);
        assert_eq!(table.state_of(&key(1)), Some(DocumentState::Unchanged));
        assert_eq!(table.state_of(&key(2)), Some(DocumentState::Unchanged));
    }

    #[test]
    fn test_changed_primary_key_is_invalid_state() {
        let table = Arc::new(TrackedTable::new());
        let drifted = item(1);
        drifted.write().append(Renamed("a".into()));
        table.replace(key(1), drifted.clone(), DocumentState::Unchanged);
        drifted.write().id = 9;

        let mut changes = change_set(&table);
        let (key, tracked) = table.snapshot().remove(0);
        let err = changes.record(key, tracked, &selector()).unwrap_err();
        assert!(matches!(err, ContextError::InvalidState { .. }));
        assert_eq!(drifted.read().pending_mutations().len(), 1);
    }
}
