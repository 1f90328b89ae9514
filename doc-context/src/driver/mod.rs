//! Driver boundary.
//!
//! The document database is an external collaborator. These traits describe
//! the small surface the tracking layer needs from it: sessions with
//! transactions, ordered bulk writes, forward-only cursors and index
//! management. `memory` provides an in-process implementation; `mongo`,
//! behind the `mongodb` feature, drives a MongoDB deployment.

pub mod memory;
#[cfg(feature = "mongodb")]
pub mod mongo;

pub use memory::MemoryDriver;
#[cfg(feature = "mongodb")]
pub use mongo::MongoDriver;

use crate::config::SessionOptions;
use crate::document::{Filter, SortDirection, Update, UpdateError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

pub type DriverResult<T> = Result<T, DriverError>;

/// Batch size of a cursor when neither the query nor the options set one.
pub const DEFAULT_BATCH_SIZE: u32 = 101;

/// Server error codes the tracking layer reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    IndexNotFound,
    IndexOptionsConflict,
    IndexKeySpecsConflict,
    NoSuchTransaction,
    DuplicateKey,
    Other(i32),
}

impl ErrorCode {
    pub fn as_i32(self) -> i32 {
        match self {
            ErrorCode::IndexNotFound => 27,
            ErrorCode::IndexOptionsConflict => 85,
            ErrorCode::IndexKeySpecsConflict => 86,
            ErrorCode::NoSuchTransaction => 251,
            ErrorCode::DuplicateKey => 11000,
            ErrorCode::Other(code) => code,
        }
    }

    pub fn from_i32(code: i32) -> Self {
        match code {
            27 => ErrorCode::IndexNotFound,
            85 => ErrorCode::IndexOptionsConflict,
            86 => ErrorCode::IndexKeySpecsConflict,
            251 => ErrorCode::NoSuchTransaction,
            11000 => ErrorCode::DuplicateKey,
            other => ErrorCode::Other(other),
        }
    }

    /// An index with the same keys or name already exists with a different
    /// definition.
    pub fn is_index_conflict(self) -> bool {
        matches!(
            self,
            ErrorCode::IndexOptionsConflict | ErrorCode::IndexKeySpecsConflict
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_i32())
    }
}

/// A failed server command.
#[derive(Debug, Clone, Error)]
#[error("{message} (code {code})")]
pub struct CommandError {
    pub code: ErrorCode,
    pub message: String,
    /// Structured error payload. Index conflicts carry `existingIndex`.
    pub details: Value,
}

impl CommandError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: Value::Null,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    /// Name of the already existing index an index conflict collided with.
    ///
    /// Falls back to the `name: <index>` fragment of the server message when
    /// the payload does not carry it.
    pub fn conflicting_index_name(&self) -> Option<String> {
        if let Some(name) = self.details.get("existingIndex").and_then(Value::as_str) {
            return Some(name.to_string());
        }
        let (_, rest) = self.message.split_once("name: ")?;
        let name = rest
            .split(|c: char| c.is_whitespace() || c == ',')
            .next()
            .map(|n| n.trim_matches('"'))
            .filter(|n| !n.is_empty())?;
        Some(name.to_string())
    }
}

#[derive(Debug, Clone, Error)]
pub enum DriverError {
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("bulk write failed at operation {index}: {source}")]
    BulkWrite {
        index: usize,
        #[source]
        source: Box<DriverError>,
        partial: BulkWriteResult,
    },
    #[error("session error: {0}")]
    Session(String),
    #[error("invalid update: {0}")]
    InvalidUpdate(#[from] UpdateError),
    /// Connection, serialization or other client-side failure.
    #[error("driver error: {0}")]
    Client(String),
}

impl DriverError {
    /// Server error code, looking through bulk-write wrapping.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            DriverError::Command(command) => Some(command.code),
            DriverError::BulkWrite { source, .. } => source.code(),
            _ => None,
        }
    }
}

/// One operation of a bulk write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WriteOperation {
    InsertOne { document: Value },
    UpdateOne { filter: Filter, update: Update },
    DeleteOne { filter: Filter },
}

impl WriteOperation {
    pub fn kind(&self) -> &'static str {
        match self {
            WriteOperation::InsertOne { .. } => "insert",
            WriteOperation::UpdateOne { .. } => "update",
            WriteOperation::DeleteOne { .. } => "delete",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkWriteOptions {
    /// Stop at the first failing operation.
    pub ordered: bool,
}

impl Default for BulkWriteOptions {
    fn default() -> Self {
        Self { ordered: true }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkWriteResult {
    pub inserted: u64,
    pub matched: u64,
    pub modified: u64,
    pub deleted: u64,
}

/// Query shape handed to `DocumentCollection::find`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindQuery {
    pub filter: Filter,
    pub sort: Vec<(String, SortDirection)>,
    pub skip: Option<u64>,
    pub limit: Option<u64>,
    pub batch_size: Option<u32>,
}

impl FindQuery {
    pub fn new(filter: Filter) -> Self {
        Self {
            filter,
            ..Default::default()
        }
    }
}

/// How a single index key is ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexKind {
    Ascending,
    Descending,
    Text,
}

impl IndexKind {
    fn name_suffix(self) -> &'static str {
        match self {
            IndexKind::Ascending => "1",
            IndexKind::Descending => "-1",
            IndexKind::Text => "text",
        }
    }
}

impl From<SortDirection> for IndexKind {
    fn from(direction: SortDirection) -> Self {
        match direction {
            SortDirection::Ascending => IndexKind::Ascending,
            SortDirection::Descending => IndexKind::Descending,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexKeys {
    pub fields: Vec<(String, IndexKind)>,
}

impl IndexKeys {
    pub fn ascending(field: impl Into<String>) -> Self {
        Self::default().then(field, IndexKind::Ascending)
    }

    pub fn descending(field: impl Into<String>) -> Self {
        Self::default().then(field, IndexKind::Descending)
    }

    pub fn text(field: impl Into<String>) -> Self {
        Self::default().then(field, IndexKind::Text)
    }

    /// Append another key, producing a compound index.
    pub fn then(mut self, field: impl Into<String>, kind: IndexKind) -> Self {
        self.fields.push((field.into(), kind));
        self
    }

    /// Database default name: `title_text_body_text`, `created_at_1`.
    pub fn default_name(&self) -> String {
        self.fields
            .iter()
            .map(|(field, kind)| format!("{}_{}", field, kind.name_suffix()))
            .collect::<Vec<_>>()
            .join("_")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub sparse: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire_after_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weights: Option<BTreeMap<String, i32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_language: Option<String>,
}

impl IndexOptions {
    /// Options compared for conflicts, i.e. everything but the name.
    pub fn same_definition(&self, other: &IndexOptions) -> bool {
        self.unique == other.unique
            && self.sparse == other.sparse
            && self.expire_after_seconds == other.expire_after_seconds
            && self.weights == other.weights
            && self.default_language == other.default_language
    }
}

/// Index creation request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexModel {
    pub keys: IndexKeys,
    #[serde(default)]
    pub options: IndexOptions,
}

impl IndexModel {
    pub fn new(keys: IndexKeys, options: IndexOptions) -> Self {
        Self { keys, options }
    }

    pub fn name(&self) -> String {
        self.options
            .name
            .clone()
            .unwrap_or_else(|| self.keys.default_name())
    }
}

/// An index as reported by the database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub name: String,
    pub keys: IndexKeys,
    pub options: IndexOptions,
}

/// Connection to a document database.
#[async_trait]
pub trait DocumentDriver: Send + Sync + 'static {
    type Session: ClientSession;
    type Collection: DocumentCollection<Session = Self::Session>;

    async fn start_session(&self, options: &SessionOptions) -> DriverResult<Self::Session>;

    fn collection(&self, name: &str) -> Self::Collection;
}

/// A logical session able to run one transaction at a time.
#[async_trait]
pub trait ClientSession: Send + Sync + 'static {
    fn id(&self) -> &str;

    fn in_transaction(&self) -> bool;

    /// Uses the transaction defaults the session was started with.
    async fn start_transaction(&mut self) -> DriverResult<()>;

    async fn commit_transaction(&mut self) -> DriverResult<()>;

    async fn abort_transaction(&mut self) -> DriverResult<()>;
}

/// Handle to one collection.
#[async_trait]
pub trait DocumentCollection: Clone + Send + Sync + 'static {
    type Session: ClientSession;
    type Cursor: DocumentCursor;

    fn name(&self) -> &str;

    /// Submit a batch inside the session's transaction, or auto-committed
    /// when the session has none.
    async fn bulk_write(
        &self,
        session: &Self::Session,
        operations: Vec<WriteOperation>,
        options: BulkWriteOptions,
    ) -> DriverResult<BulkWriteResult>;

    /// Reads committed data.
    async fn find(&self, query: &FindQuery) -> DriverResult<Self::Cursor>;

    async fn count(&self, filter: &Filter) -> DriverResult<u64>;

    /// Returns the name of the created (or already present) index.
    async fn create_index(&self, model: &IndexModel) -> DriverResult<String>;

    async fn list_indexes(&self) -> DriverResult<Vec<IndexSpec>>;

    async fn drop_index(&self, name: &str) -> DriverResult<()>;
}

/// Forward-only sequence of document batches.
#[async_trait]
pub trait DocumentCursor: Send + 'static {
    /// `None` once the cursor is exhausted.
    async fn next_batch(&mut self) -> DriverResult<Option<Vec<Value>>>;
}
