use super::collection::CollectionTracker;
use super::cursor::TrackingCursor;
use crate::aggregate::{Aggregate, DocumentRef};
use crate::document::{Filter, SortDirection};
use crate::driver::{DocumentCollection, DocumentDriver, FindQuery};
use crate::error::{ContextError, ContextResult};

/// Lazy query over one tracked collection.
///
/// Builder methods only shape the query. Each execution (`cursor`, `to_list`,
/// `first`, `count`) runs it again from the start.
pub struct TrackedFind<A: Aggregate, D: DocumentDriver> {
    tracker: CollectionTracker<A, D>,
    query: FindQuery,
    tracking: bool,
}

impl<A: Aggregate, D: DocumentDriver> Clone for TrackedFind<A, D> {
    fn clone(&self) -> Self {
        Self {
            tracker: self.tracker.clone(),
            query: self.query.clone(),
            tracking: self.tracking,
        }
    }
}

impl<A: Aggregate, D: DocumentDriver> TrackedFind<A, D> {
    pub(crate) fn new(
        tracker: CollectionTracker<A, D>,
        filter: Filter,
        batch_size: Option<u32>,
    ) -> Self {
        Self {
            tracker,
            query: FindQuery {
                batch_size,
                ..FindQuery::new(filter)
            },
            tracking: true,
        }
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.query.limit = Some(limit);
        self
    }

    pub fn skip(mut self, skip: u64) -> Self {
        self.query.skip = Some(skip);
        self
    }

    pub fn sort_by(mut self, field: impl Into<String>) -> Self {
        self.query.sort.push((field.into(), SortDirection::Ascending));
        self
    }

    pub fn sort_by_descending(mut self, field: impl Into<String>) -> Self {
        self.query
            .sort
            .push((field.into(), SortDirection::Descending));
        self
    }

    pub fn batch_size(mut self, batch_size: u32) -> Self {
        self.query.batch_size = Some(batch_size);
        self
    }

    /// Hand out fresh instances and never attach them.
    pub fn no_tracking(mut self) -> Self {
        self.tracking = false;
        self
    }

    pub fn query(&self) -> &FindQuery {
        &self.query
    }

    pub async fn cursor(&self) -> ContextResult<TrackingCursor<A, D>> {
        let cursor = self
            .tracker
            .collection()
            .find(&self.query)
            .await
            .map_err(|source| self.query_error(source))?;
        Ok(TrackingCursor::new(
            self.tracker.clone(),
            cursor,
            self.tracking,
        ))
    }

    pub async fn to_list(&self) -> ContextResult<Vec<DocumentRef<A>>> {
        self.cursor().await?.to_list().await
    }

    pub async fn first(&self) -> ContextResult<Option<DocumentRef<A>>> {
        let mut cursor = self.clone().limit(1).cursor().await?;
        while let Some(batch) = cursor.next_batch().await? {
            if let Some(document) = batch.into_iter().next() {
                return Ok(Some(document));
            }
        }
        Ok(None)
    }

    /// Number of stored documents matching the filter. Ignores skip, limit
    /// and tracked state.
    pub async fn count(&self) -> ContextResult<u64> {
        self.tracker
            .collection()
            .count(&self.query.filter)
            .await
            .map_err(|source| self.query_error(source))
    }

    fn query_error(&self, source: crate::driver::DriverError) -> ContextError {
        ContextError::Query {
            collection: self.tracker.name().to_string(),
            source,
        }
    }
}
