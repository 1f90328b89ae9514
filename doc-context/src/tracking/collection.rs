use super::changes::ChangeSet;
use super::find::TrackedFind;
use super::state::DocumentState;
use super::table::TrackedTable;
use crate::aggregate::{document_ref, Aggregate, DocumentRef};
use crate::config::FindOptions;
use crate::definition::{CollectionDefinition, PrimaryKeySelector};
use crate::document::{Filter, PrimaryKey};
use crate::driver::{BulkWriteOptions, DocumentCollection, DocumentDriver};
use crate::error::{ContextError, ContextResult};
use crate::index::{IndexDefinition, IndexReconciler};
use crate::listener::CollectionListener;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Tracks the documents of one collection and turns their state into writes.
///
/// Handles are cheap to clone; every clone shares the same tracked table.
/// Obtain one from [`DocumentContext::collection`](crate::DocumentContext::collection).
pub struct CollectionTracker<A: Aggregate, D: DocumentDriver> {
    inner: Arc<TrackerInner<A, D>>,
}

struct TrackerInner<A: Aggregate, D: DocumentDriver> {
    name: String,
    collection: D::Collection,
    primary_key: PrimaryKeySelector<A>,
    indexes: Vec<IndexDefinition>,
    listeners: Vec<Arc<dyn CollectionListener<A>>>,
    table: Arc<TrackedTable<A>>,
    find_options: FindOptions,
}

impl<A: Aggregate, D: DocumentDriver> Clone for CollectionTracker<A, D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<A: Aggregate, D: DocumentDriver> fmt::Debug for CollectionTracker<A, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectionTracker")
            .field("name", &self.inner.name)
            .field("tracked", &self.inner.table.len())
            .finish()
    }
}

impl<A: Aggregate, D: DocumentDriver> CollectionTracker<A, D> {
    pub(crate) fn new(
        definition: &CollectionDefinition<A>,
        collection: D::Collection,
        find_options: FindOptions,
    ) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                name: definition.name().to_string(),
                collection,
                primary_key: definition.primary_key().clone(),
                indexes: definition.indexes().to_vec(),
                listeners: definition.listeners().to_vec(),
                table: Arc::new(TrackedTable::new()),
                find_options,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Driver handle of the underlying collection.
    pub fn collection(&self) -> &D::Collection {
        &self.inner.collection
    }

    pub fn key_of(&self, document: &A) -> PrimaryKey {
        PrimaryKey::from_filter(&(self.inner.primary_key)(document))
    }

    fn key_of_ref(&self, document: &DocumentRef<A>) -> PrimaryKey {
        self.key_of(&document.read())
    }

    /// Query handle over documents matching `filter`. Nothing runs until the
    /// handle is executed.
    pub fn find(&self, filter: Filter) -> TrackedFind<A, D> {
        TrackedFind::new(self.clone(), filter, self.inner.find_options.batch_size)
    }

    pub fn find_all(&self) -> TrackedFind<A, D> {
        self.find(Filter::empty())
    }

    /// Track `document` for insertion. A document already tracked under the
    /// same key is replaced.
    ///
    /// Mutations still queued on the replaced instance stay on it: they are
    /// never saved nor reported to listeners.
    pub fn add(&self, document: DocumentRef<A>) {
        let key = self.key_of_ref(&document);
        debug!(collection = %self.inner.name, key = %key, "add");
        let replaced = self
            .inner
            .table
            .replace(key.clone(), document.clone(), DocumentState::Added);
        if let Some(previous) = replaced.filter(|previous| !previous.is_instance(&document)) {
            let queued = previous.document.read().pending_mutations().len();
            if queued > 0 {
                warn!(
                    collection = %self.inner.name,
                    key = %key,
                    queued,
                    "replaced a tracked document with unsaved mutations"
                );
            }
        }
    }

    /// Wrap `document` in a shared handle and track it for insertion.
    pub fn add_new(&self, document: A) -> DocumentRef<A> {
        let document = document_ref(document);
        self.add(document.clone());
        document
    }

    /// Track the document under `document`'s key for deletion.
    ///
    /// Only the key of `document` matters: a fresh instance carrying just the
    /// primary key deletes the stored document, and an instance already
    /// tracked under that key stays the tracked one.
    pub fn remove(&self, document: &DocumentRef<A>) {
        let key = self.key_of_ref(document);
        debug!(collection = %self.inner.name, key = %key, "remove");
        self.inner
            .table
            .mark(key, document.clone(), DocumentState::Deleted);
    }

    /// Track a queried document unless its key is already tracked. Returns
    /// the tracked instance.
    pub(crate) fn attach(&self, document: DocumentRef<A>) -> DocumentRef<A> {
        let key = self.key_of_ref(&document);
        self.inner
            .table
            .get_or_insert(key, document, DocumentState::Unchanged)
    }

    /// Deserialize a stored document, attaching it when `tracking` is set.
    pub(crate) fn materialize(&self, raw: Value, tracking: bool) -> ContextResult<DocumentRef<A>> {
        let aggregate: A =
            serde_json::from_value(raw).map_err(|source| ContextError::Serialization {
                collection: self.inner.name.clone(),
                source,
            })?;
        let document = document_ref(aggregate);
        Ok(if tracking {
            self.attach(document)
        } else {
            document
        })
    }

    /// State of `document` if it is the instance tracked under its key.
    pub fn state_of(&self, document: &DocumentRef<A>) -> Option<DocumentState> {
        let key = self.key_of_ref(document);
        self.inner
            .table
            .get(&key)
            .filter(|tracked| tracked.is_instance(document))
            .map(|tracked| tracked.state)
    }

    pub fn state_of_key(&self, key: &PrimaryKey) -> Option<DocumentState> {
        self.inner.table.state_of(key)
    }

    /// The instance tracked under `key`, if any.
    pub fn tracked(&self, key: &PrimaryKey) -> Option<DocumentRef<A>> {
        self.inner.table.get(key).map(|tracked| tracked.document)
    }

    pub fn tracked_keys(&self) -> Vec<PrimaryKey> {
        self.inner.table.keys()
    }

    pub fn len(&self) -> usize {
        self.inner.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop tracking every document. Queued mutations stay on the instances.
    pub fn clear(&self) {
        self.inner.table.clear();
    }

    /// Reconcile the declared indexes with the live collection.
    pub async fn initialize(&self) -> ContextResult<Vec<String>> {
        IndexReconciler::new(&self.inner.collection)
            .apply(&self.inner.indexes)
            .await
    }

    /// Render every tracked document into writes and submit them as one
    /// ordered batch inside the session's transaction.
    ///
    /// The returned change set must be accepted once the transaction commits.
    /// Dropping it instead restores the tracked table.
    pub(crate) async fn save_changes(&self, session: &D::Session) -> ContextResult<ChangeSet<A>> {
        let inner = &self.inner;
        let mut changes = ChangeSet::new(
            inner.name.clone(),
            inner.table.clone(),
            inner.listeners.clone(),
        );
        for (key, tracked) in inner.table.snapshot() {
            changes.record(key, tracked, &inner.primary_key)?;
        }

        let writes = changes.take_writes();
        if writes.is_empty() {
            debug!(collection = %inner.name, "nothing to write");
            return Ok(changes);
        }

        let count = writes.len();
        let result = inner
            .collection
            .bulk_write(session, writes, BulkWriteOptions::default())
            .await
            .map_err(|source| ContextError::Write {
                collection: inner.name.clone(),
                source,
            })?;
        debug!(
            collection = %inner.name,
            operations = count,
            inserted = result.inserted,
            modified = result.modified,
            deleted = result.deleted,
            "bulk write submitted"
        );
        Ok(changes)
    }
}
