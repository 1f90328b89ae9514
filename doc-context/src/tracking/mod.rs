//! Change tracking for one collection.
//!
//! A [`CollectionTracker`] keeps a table of primary key to tracked document
//! in attach order. Queries attach what they read, `add` and `remove` mark
//! documents for insertion and deletion, and a save walks the table to build
//! one ordered batch of writes.

mod changes;
mod collection;
mod cursor;
mod find;
mod state;
mod table;

pub(crate) use changes::PendingChanges;
pub use collection::CollectionTracker;
pub use cursor::TrackingCursor;
pub use find::TrackedFind;
pub use state::{DocumentState, TrackedDocument};
