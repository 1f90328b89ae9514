//! In-memory document driver
//!
//! Keeps every collection in process. A transaction applies its writes to
//! a private view of each collection it touches and logs them; commit
//! replays the log against the committed collections, re-checking unique
//! indexes, so transactions committed in between are preserved. Used by the
//! test suite and by embedders that want the tracking layer without a
//! server.

use super::{
    BulkWriteOptions, BulkWriteResult, ClientSession, CommandError, DocumentCollection,
    DocumentCursor, DocumentDriver, DriverError, DriverResult, ErrorCode, FindQuery, IndexKeys,
    IndexModel, IndexSpec, WriteOperation, DEFAULT_BATCH_SIZE,
};
use crate::config::SessionOptions;
use crate::document::{compare_values, get_path, Filter, SortDirection};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
struct CollectionData {
    documents: Vec<Value>,
    indexes: Vec<IndexSpec>,
}

#[derive(Debug, Default)]
struct MemoryStore {
    collections: RwLock<HashMap<String, CollectionData>>,
    fail_next_commit: AtomicBool,
}

/// In-process database.
#[derive(Debug, Clone, Default)]
pub struct MemoryDriver {
    store: Arc<MemoryStore>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed documents of a collection, in insertion order.
    pub fn documents(&self, collection: &str) -> Vec<Value> {
        self.store
            .collections
            .read()
            .get(collection)
            .map(|data| data.documents.clone())
            .unwrap_or_default()
    }

    /// Insert documents directly, bypassing sessions and index checks.
    pub fn seed(&self, collection: &str, documents: impl IntoIterator<Item = Value>) {
        let mut collections = self.store.collections.write();
        let data = collections.entry(collection.to_string()).or_default();
        data.documents.extend(documents);
    }

    /// Make the next transaction commit fail with a server error.
    pub fn fail_next_commit(&self) {
        self.store.fail_next_commit.store(true, AtomicOrdering::SeqCst);
    }
}

#[async_trait]
impl DocumentDriver for MemoryDriver {
    type Session = MemorySession;
    type Collection = MemoryCollection;

    async fn start_session(&self, _options: &SessionOptions) -> DriverResult<MemorySession> {
        let session = MemorySession {
            id: Uuid::new_v4().to_string(),
            store: self.store.clone(),
            transaction: Mutex::new(None),
        };
        debug!(session = %session.id, "started in-memory session");
        Ok(session)
    }

    fn collection(&self, name: &str) -> MemoryCollection {
        MemoryCollection {
            name: name.to_string(),
            store: self.store.clone(),
        }
    }
}

/// Uncommitted writes to one collection.
#[derive(Debug, Default)]
struct PendingCollection {
    /// Committed documents with the transaction's writes applied.
    view: Vec<Value>,
    /// Successfully applied operations, replayed on commit.
    log: Vec<WriteOperation>,
}

/// Keyed by collection name.
type WorkingSet = HashMap<String, PendingCollection>;

#[derive(Debug)]
pub struct MemorySession {
    id: String,
    store: Arc<MemoryStore>,
    transaction: Mutex<Option<WorkingSet>>,
}

fn no_transaction() -> DriverError {
    CommandError::new(ErrorCode::NoSuchTransaction, "no transaction in progress").into()
}

#[async_trait]
impl ClientSession for MemorySession {
    fn id(&self) -> &str {
        &self.id
    }

    fn in_transaction(&self) -> bool {
        self.transaction.lock().is_some()
    }

    async fn start_transaction(&mut self) -> DriverResult<()> {
        let mut transaction = self.transaction.lock();
        if transaction.is_some() {
            return Err(DriverError::Session(format!(
                "transaction already in progress on session {}",
                self.id
            )));
        }
        *transaction = Some(WorkingSet::new());
        Ok(())
    }

    async fn commit_transaction(&mut self) -> DriverResult<()> {
        let working = self.transaction.lock().take().ok_or_else(no_transaction)?;
        if self.store.fail_next_commit.swap(false, AtomicOrdering::SeqCst) {
            return Err(CommandError::new(
                ErrorCode::Other(112),
                "WriteConflict: transaction commit failed",
            )
            .into());
        }
        let mut collections = self.store.collections.write();
        let mut replayed = Vec::with_capacity(working.len());
        for (name, pending) in working {
            let (mut documents, indexes) = collections
                .get(&name)
                .map(|data| (data.documents.clone(), data.indexes.clone()))
                .unwrap_or_default();
            apply_operations(
                &name,
                &mut documents,
                &indexes,
                pending.log,
                BulkWriteOptions::default(),
                &mut Vec::new(),
            )?;
            replayed.push((name, documents));
        }
        for (name, documents) in replayed {
            collections.entry(name).or_default().documents = documents;
        }
        Ok(())
    }

    async fn abort_transaction(&mut self) -> DriverResult<()> {
        self.transaction
            .lock()
            .take()
            .map(|_| ())
            .ok_or_else(no_transaction)
    }
}

#[derive(Debug, Clone)]
pub struct MemoryCollection {
    name: String,
    store: Arc<MemoryStore>,
}

impl MemoryCollection {
    fn indexes(&self) -> Vec<IndexSpec> {
        self.store
            .collections
            .read()
            .get(&self.name)
            .map(|data| data.indexes.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl DocumentCollection for MemoryCollection {
    type Session = MemorySession;
    type Cursor = MemoryCursor;

    fn name(&self) -> &str {
        &self.name
    }

    async fn bulk_write(
        &self,
        session: &MemorySession,
        operations: Vec<WriteOperation>,
        options: BulkWriteOptions,
    ) -> DriverResult<BulkWriteResult> {
        if !Arc::ptr_eq(&session.store, &self.store) {
            return Err(DriverError::Session(format!(
                "session {} belongs to a different client",
                session.id
            )));
        }

        let mut transaction = session.transaction.lock();
        match transaction.as_mut() {
            Some(working) => {
                let indexes = self.indexes();
                let pending = working.entry(self.name.clone()).or_insert_with(|| {
                    PendingCollection {
                        view: self
                            .store
                            .collections
                            .read()
                            .get(&self.name)
                            .map(|data| data.documents.clone())
                            .unwrap_or_default(),
                        log: Vec::new(),
                    }
                });
                apply_operations(
                    &self.name,
                    &mut pending.view,
                    &indexes,
                    operations,
                    options,
                    &mut pending.log,
                )
            }
            None => {
                let mut collections = self.store.collections.write();
                let data = collections.entry(self.name.clone()).or_default();
                let indexes = data.indexes.clone();
                apply_operations(
                    &self.name,
                    &mut data.documents,
                    &indexes,
                    operations,
                    options,
                    &mut Vec::new(),
                )
            }
        }
    }

    async fn find(&self, query: &FindQuery) -> DriverResult<MemoryCursor> {
        let mut matched: Vec<Value> = self
            .store
            .collections
            .read()
            .get(&self.name)
            .map(|data| {
                data.documents
                    .iter()
                    .filter(|doc| query.filter.matches(doc))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        if !query.sort.is_empty() {
            matched.sort_by(|a, b| compare_by_sort(a, b, &query.sort));
        }

        let skip = query.skip.unwrap_or(0) as usize;
        let limit = query.limit.map(|l| l as usize).unwrap_or(usize::MAX);
        let batch_size = match query.batch_size {
            Some(size) if size > 0 => size as usize,
            _ => DEFAULT_BATCH_SIZE as usize,
        };

        let selected: Vec<Value> = matched.into_iter().skip(skip).take(limit).collect();
        let batches = selected
            .chunks(batch_size)
            .map(|chunk| chunk.to_vec())
            .collect();
        Ok(MemoryCursor { batches })
    }

    async fn count(&self, filter: &Filter) -> DriverResult<u64> {
        Ok(self
            .store
            .collections
            .read()
            .get(&self.name)
            .map(|data| data.documents.iter().filter(|doc| filter.matches(doc)).count())
            .unwrap_or(0) as u64)
    }

    async fn create_index(&self, model: &IndexModel) -> DriverResult<String> {
        let name = model.name();
        let mut collections = self.store.collections.write();
        let data = collections.entry(self.name.clone()).or_default();

        if let Some(existing) = data.indexes.iter().find(|index| index.name == name) {
            if existing.keys != model.keys {
                return Err(conflict(
                    ErrorCode::IndexKeySpecsConflict,
                    format!(
                        "An existing index has the same name as the requested index but different keys: name: {}",
                        existing.name
                    ),
                    &existing.name,
                ));
            }
            if existing.options.same_definition(&model.options) {
                return Ok(name);
            }
            return Err(conflict(
                ErrorCode::IndexOptionsConflict,
                format!(
                    "An existing index has the same name as the requested index but different options: name: {}",
                    existing.name
                ),
                &existing.name,
            ));
        }

        if let Some(existing) = data.indexes.iter().find(|index| index.keys == model.keys) {
            return Err(conflict(
                ErrorCode::IndexOptionsConflict,
                format!(
                    "Index already exists with a different name: {}",
                    existing.name
                ),
                &existing.name,
            ));
        }

        let spec = IndexSpec {
            name: name.clone(),
            keys: model.keys.clone(),
            options: model.options.clone(),
        };
        if spec.options.unique {
            for (position, document) in data.documents.iter().enumerate() {
                check_unique(&self.name, &data.documents, &[spec.clone()], document, Some(position))?;
            }
        }
        data.indexes.push(spec);
        debug!(collection = %self.name, index = %name, "created index");
        Ok(name)
    }

    async fn list_indexes(&self) -> DriverResult<Vec<IndexSpec>> {
        Ok(self.indexes())
    }

    async fn drop_index(&self, name: &str) -> DriverResult<()> {
        let mut collections = self.store.collections.write();
        let data = collections.entry(self.name.clone()).or_default();
        let before = data.indexes.len();
        data.indexes.retain(|index| index.name != name);
        if data.indexes.len() == before {
            return Err(CommandError::new(
                ErrorCode::IndexNotFound,
                format!("index not found with name [{}]", name),
            )
            .into());
        }
        debug!(collection = %self.name, index = %name, "dropped index");
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryCursor {
    batches: VecDeque<Vec<Value>>,
}

#[async_trait]
impl DocumentCursor for MemoryCursor {
    async fn next_batch(&mut self) -> DriverResult<Option<Vec<Value>>> {
        Ok(self.batches.pop_front())
    }
}

fn conflict(code: ErrorCode, message: String, existing: &str) -> DriverError {
    CommandError::new(code, message)
        .with_details(json!({ "existingIndex": existing }))
        .into()
}

fn compare_by_sort(a: &Value, b: &Value, sort: &[(String, SortDirection)]) -> Ordering {
    for (path, direction) in sort {
        let left = get_path(a, path).unwrap_or(&Value::Null);
        let right = get_path(b, path).unwrap_or(&Value::Null);
        let ord = match direction {
            SortDirection::Ascending => compare_values(left, right),
            SortDirection::Descending => compare_values(right, left),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

fn apply_operations(
    collection: &str,
    documents: &mut Vec<Value>,
    indexes: &[IndexSpec],
    operations: Vec<WriteOperation>,
    options: BulkWriteOptions,
    applied: &mut Vec<WriteOperation>,
) -> DriverResult<BulkWriteResult> {
    let mut result = BulkWriteResult::default();
    let mut first_error: Option<(usize, DriverError)> = None;

    for (index, operation) in operations.into_iter().enumerate() {
        let logged = operation.clone();
        match apply_one(collection, documents, indexes, operation, &mut result) {
            Ok(()) => applied.push(logged),
            Err(source) => {
                if options.ordered {
                    return Err(DriverError::BulkWrite {
                        index,
                        source: Box::new(source),
                        partial: result,
                    });
                }
                first_error.get_or_insert((index, source));
            }
        }
    }

    match first_error {
        Some((index, source)) => Err(DriverError::BulkWrite {
            index,
            source: Box::new(source),
            partial: result,
        }),
        None => Ok(result),
    }
}

fn apply_one(
    collection: &str,
    documents: &mut Vec<Value>,
    indexes: &[IndexSpec],
    operation: WriteOperation,
    result: &mut BulkWriteResult,
) -> DriverResult<()> {
    match operation {
        WriteOperation::InsertOne { document } => {
            if !document.is_object() {
                return Err(CommandError::new(
                    ErrorCode::Other(2),
                    "inserted document must be an object",
                )
                .into());
            }
            check_unique(collection, documents, indexes, &document, None)?;
            documents.push(document);
            result.inserted += 1;
        }
        WriteOperation::UpdateOne { filter, update } => {
            let Some(position) = documents.iter().position(|doc| filter.matches(doc)) else {
                return Ok(());
            };
            let mut candidate = documents[position].clone();
            let modified = update.apply_to(&mut candidate)?;
            check_unique(collection, documents, indexes, &candidate, Some(position))?;
            documents[position] = candidate;
            result.matched += 1;
            if modified {
                result.modified += 1;
            }
        }
        WriteOperation::DeleteOne { filter } => {
            if let Some(position) = documents.iter().position(|doc| filter.matches(doc)) {
                documents.remove(position);
                result.deleted += 1;
            }
        }
    }
    Ok(())
}

/// Values a document contributes to an index, `None` when a sparse index
/// skips it.
fn index_entry(document: &Value, keys: &IndexKeys, sparse: bool) -> Option<Vec<Value>> {
    let values: Vec<Option<&Value>> = keys
        .fields
        .iter()
        .map(|(path, _)| get_path(document, path))
        .collect();
    if sparse && values.iter().all(Option::is_none) {
        return None;
    }
    Some(
        values
            .into_iter()
            .map(|v| v.cloned().unwrap_or(Value::Null))
            .collect(),
    )
}

fn check_unique(
    collection: &str,
    documents: &[Value],
    indexes: &[IndexSpec],
    candidate: &Value,
    replacing: Option<usize>,
) -> DriverResult<()> {
    for index in indexes.iter().filter(|index| index.options.unique) {
        let Some(entry) = index_entry(candidate, &index.keys, index.options.sparse) else {
            continue;
        };
        let duplicate = documents.iter().enumerate().any(|(position, other)| {
            Some(position) != replacing
                && index_entry(other, &index.keys, index.options.sparse).as_ref() == Some(&entry)
        });
        if duplicate {
            return Err(CommandError::new(
                ErrorCode::DuplicateKey,
                format!(
                    "E11000 duplicate key error collection: {} index: {} dup key: {}",
                    collection,
                    index.name,
                    Value::Array(entry)
                ),
            )
            .into());
        }
    }
    Ok(())
}
