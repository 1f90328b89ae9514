// Document context
// Change tracking and unit of work over a document database

// Documents and the driver boundary
pub mod document;
pub mod driver;

// Aggregates and their collections
pub mod aggregate;
pub mod definition;
pub mod index;
pub mod listener;

// Tracking and the unit of work
pub mod context;
pub mod tracking;

// Infrastructure
pub mod config;
pub mod error;

pub use crate::aggregate::{document_ref, Aggregate, DocumentRef, Mutation, PendingMutations};
pub use crate::config::{ContextOptions, FindOptions, SessionOptions, TransactionOptions};
pub use crate::context::{ContextBuilder, DocumentContext};
pub use crate::definition::CollectionDefinition;
pub use crate::document::{Filter, PrimaryKey, Update};
pub use crate::error::{ContextError, ContextResult, ListenerFailure, ListenerFailures};
pub use crate::index::{ConflictResolution, IndexDefinition, Weights};
pub use crate::listener::{ChangeOutcome, ChangesSaved, CollectionListener, DocumentChange};
pub use crate::tracking::{CollectionTracker, DocumentState, TrackedFind, TrackingCursor};
