use super::collection::CollectionTracker;
use crate::aggregate::{Aggregate, DocumentRef};
use crate::driver::{DocumentCollection, DocumentCursor, DocumentDriver};
use crate::error::{ContextError, ContextResult};

type RawCursor<D> = <<D as DocumentDriver>::Collection as DocumentCollection>::Cursor;

/// Wraps a driver cursor and hands out aggregate instances.
///
/// In tracking mode every document is attached to the owning tracker; a key
/// that is already tracked yields the tracked instance instead of the freshly
/// read one. Untracked documents are never registered.
pub struct TrackingCursor<A: Aggregate, D: DocumentDriver> {
    tracker: CollectionTracker<A, D>,
    cursor: RawCursor<D>,
    tracking: bool,
}

impl<A: Aggregate, D: DocumentDriver> TrackingCursor<A, D> {
    pub(crate) fn new(tracker: CollectionTracker<A, D>, cursor: RawCursor<D>, tracking: bool) -> Self {
        Self {
            tracker,
            cursor,
            tracking,
        }
    }

    pub fn is_tracking(&self) -> bool {
        self.tracking
    }

    /// Next batch of documents, `None` once the cursor is exhausted.
    pub async fn next_batch(&mut self) -> ContextResult<Option<Vec<DocumentRef<A>>>> {
        let batch = self
            .cursor
            .next_batch()
            .await
            .map_err(|source| ContextError::Query {
                collection: self.tracker.name().to_string(),
                source,
            })?;
        let Some(batch) = batch else {
            return Ok(None);
        };
        batch
            .into_iter()
            .map(|raw| self.tracker.materialize(raw, self.tracking))
            .collect::<ContextResult<Vec<_>>>()
            .map(Some)
    }

    /// Drain the cursor.
    pub async fn to_list(mut self) -> ContextResult<Vec<DocumentRef<A>>> {
        let mut documents = Vec::new();
        while let Some(batch) = self.next_batch().await? {
            documents.extend(batch);
        }
        Ok(documents)
    }
}
