//! Error types for the tracking layer.

use crate::document::PrimaryKey;
use crate::driver::DriverError;
use std::fmt;
use thiserror::Error;

pub type ContextResult<T> = Result<T, ContextError>;

/// Error returned by a collection listener.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum ContextError {
    /// An index declaration collided with an existing index and could not be
    /// resolved under its conflict policy.
    #[error("index '{index}' on '{collection}' conflicts with an existing index: {source}")]
    IndexConflict {
        collection: String,
        index: String,
        #[source]
        source: DriverError,
    },

    #[error("failed to apply index '{index}' on '{collection}': {source}")]
    Index {
        collection: String,
        index: String,
        #[source]
        source: DriverError,
    },

    /// A bulk write failed. The batch position is kept in the driver error.
    #[error("write to '{collection}' failed: {source}")]
    Write {
        collection: String,
        #[source]
        source: DriverError,
    },

    #[error("transaction commit failed: {0}")]
    Commit(#[source] DriverError),

    #[error("session error: {0}")]
    Session(#[source] DriverError),

    #[error("query on '{collection}' failed: {source}")]
    Query {
        collection: String,
        #[source]
        source: DriverError,
    },

    /// Tracked bookkeeping no longer matches the instance it describes.
    #[error("invalid tracked state in '{collection}' for {key}: {reason}")]
    InvalidState {
        collection: String,
        key: PrimaryKey,
        reason: String,
    },

    #[error("collection '{name}' is already registered for a different document type")]
    CollectionTypeMismatch { name: String },

    #[error("serialization error in '{collection}': {source}")]
    Serialization {
        collection: String,
        #[source]
        source: serde_json::Error,
    },

    /// Raised only after the transaction committed.
    #[error("{0}")]
    Listeners(ListenerFailures),

    #[error("configuration error: {0}")]
    Config(String),
}

impl ContextError {
    /// The writes were durably committed and only post-commit listeners
    /// failed.
    pub fn is_post_commit(&self) -> bool {
        matches!(self, ContextError::Listeners(_))
    }

    pub fn is_index_conflict(&self) -> bool {
        matches!(self, ContextError::IndexConflict { .. })
    }
}

/// One listener that failed after a commit.
#[derive(Debug)]
pub struct ListenerFailure {
    pub collection: String,
    /// Position of the listener in its collection definition.
    pub listener: usize,
    pub error: BoxError,
}

impl fmt::Display for ListenerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "listener #{} on '{}': {}",
            self.listener, self.collection, self.error
        )
    }
}

/// Every listener failure of one save.
#[derive(Debug, Default)]
pub struct ListenerFailures(pub Vec<ListenerFailure>);

impl ListenerFailures {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ListenerFailure> {
        self.0.iter()
    }
}

impl fmt::Display for ListenerFailures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} post-commit listener(s) failed", self.0.len())?;
        for failure in &self.0 {
            write!(f, "; {}", failure)?;
        }
        Ok(())
    }
}

impl std::error::Error for ListenerFailures {}
