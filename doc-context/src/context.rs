//! Unit-of-work context.
//!
//! A context owns one database session and a registry of collection
//! trackers, one per collection name. `save_changes` runs every tracker
//! inside a single transaction: either all generated writes commit or none
//! do. Tracked states advance and listeners run only after the commit.

use crate::aggregate::Aggregate;
use crate::config::ContextOptions;
use crate::definition::CollectionDefinition;
use crate::driver::{ClientSession, DocumentDriver};
use crate::error::{ContextError, ContextResult, ListenerFailures};
use crate::tracking::{CollectionTracker, PendingChanges};
use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::RwLock;
use std::any::Any;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Type-erased view of a collection tracker, as stored in the registry.
#[async_trait]
pub(crate) trait ChangeTracker<D: DocumentDriver>: Send + Sync {
    fn name(&self) -> &str;

    async fn initialize(&self) -> ContextResult<()>;

    async fn save_changes(&self, session: &D::Session) -> ContextResult<Box<dyn PendingChanges>>;

    fn as_any(&self) -> &dyn Any;
}

#[async_trait]
impl<A: Aggregate, D: DocumentDriver> ChangeTracker<D> for CollectionTracker<A, D> {
    fn name(&self) -> &str {
        CollectionTracker::name(self)
    }

    async fn initialize(&self) -> ContextResult<()> {
        CollectionTracker::initialize(self).await.map(|_| ())
    }

    async fn save_changes(&self, session: &D::Session) -> ContextResult<Box<dyn PendingChanges>> {
        let changes = CollectionTracker::save_changes(self, session).await?;
        Ok(Box::new(changes))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct DocumentContext<D: DocumentDriver> {
    driver: Arc<D>,
    options: ContextOptions,
    session: Mutex<D::Session>,
    trackers: RwLock<IndexMap<String, Arc<dyn ChangeTracker<D>>>>,
}

impl<D: DocumentDriver> DocumentContext<D> {
    /// Start a session on `driver` and return an empty context.
    pub async fn new(driver: D, options: ContextOptions) -> ContextResult<Self> {
        let session = driver
            .start_session(&options.session)
            .await
            .map_err(ContextError::Session)?;
        debug!(database = %options.database, session = session.id(), "context started");
        Ok(Self {
            driver: Arc::new(driver),
            options,
            session: Mutex::new(session),
            trackers: RwLock::new(IndexMap::new()),
        })
    }

    pub fn builder(driver: D) -> ContextBuilder<D> {
        ContextBuilder::new(driver)
    }

    pub fn options(&self) -> &ContextOptions {
        &self.options
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Tracker for `definition`'s collection.
    ///
    /// The first call for a name creates the tracker; later calls return the
    /// same tracker for the lifetime of the context, ignoring the rest of the
    /// definition. Asking for a registered name with another aggregate type
    /// fails.
    pub fn collection<A: Aggregate>(
        &self,
        definition: &CollectionDefinition<A>,
    ) -> ContextResult<CollectionTracker<A, D>> {
        let mut trackers = self.trackers.write();
        let tracker = trackers
            .entry(definition.name().to_string())
            .or_insert_with(|| {
                debug!(collection = definition.name(), "registering collection tracker");
                let tracker: Arc<dyn ChangeTracker<D>> = Arc::new(CollectionTracker::<A, D>::new(
                    definition,
                    self.driver.collection(definition.name()),
                    self.options.find.clone(),
                ));
                tracker
            });
        tracker
            .as_any()
            .downcast_ref::<CollectionTracker<A, D>>()
            .cloned()
            .ok_or_else(|| ContextError::CollectionTypeMismatch {
                name: definition.name().to_string(),
            })
    }

    /// Registered collection names, in registration order.
    pub fn collection_names(&self) -> Vec<String> {
        self.trackers.read().keys().cloned().collect()
    }

    fn registered(&self) -> Vec<Arc<dyn ChangeTracker<D>>> {
        self.trackers.read().values().cloned().collect()
    }

    /// Reconcile the declared indexes of every registered collection. The
    /// first failure stops the run.
    pub async fn initialize(&self) -> ContextResult<()> {
        for tracker in self.registered() {
            tracker.initialize().await?;
            debug!(collection = tracker.name(), "indexes reconciled");
        }
        Ok(())
    }

    /// Persist every tracked change in one transaction.
    ///
    /// Returns the number of write operations committed. On any failure
    /// before the commit the transaction is aborted, tracked states are left
    /// as they were and no listener runs. Listener failures are reported as
    /// [`ContextError::Listeners`] after every listener has been attempted;
    /// the writes are committed by then.
    pub async fn save_changes(&self) -> ContextResult<usize> {
        let mut session = self.session.lock().await;
        if session.in_transaction() {
            warn!(session = session.id(), "aborting transaction left open by an interrupted save");
            abort(&mut *session).await;
        }
        session
            .start_transaction()
            .await
            .map_err(ContextError::Session)?;
        debug!(session = session.id(), "transaction started");

        let mut pending: Vec<Box<dyn PendingChanges>> = Vec::new();
        for tracker in self.registered() {
            match tracker.save_changes(&session).await {
                Ok(changes) => pending.push(changes),
                Err(err) => {
                    warn!(collection = tracker.name(), error = %err, "save failed, aborting transaction");
                    drop(pending);
                    abort(&mut *session).await;
                    return Err(err);
                }
            }
        }

        if let Err(source) = session.commit_transaction().await {
            warn!(session = session.id(), error = %source, "commit failed");
            drop(pending);
            if session.in_transaction() {
                abort(&mut *session).await;
            }
            return Err(ContextError::Commit(source));
        }

        let writes: usize = pending.iter().map(|changes| changes.write_count()).sum();
        info!(collections = pending.len(), writes, "changes committed");

        let notifications: Vec<_> = pending
            .into_iter()
            .map(|changes| {
                debug!(
                    collection = changes.collection(),
                    writes = changes.write_count(),
                    "advancing tracked state"
                );
                changes.accept()
            })
            .collect();
        drop(session);

        let mut failures = Vec::new();
        for notification in notifications {
            failures.extend(notification.await);
        }
        if failures.is_empty() {
            Ok(writes)
        } else {
            Err(ContextError::Listeners(ListenerFailures(failures)))
        }
    }
}

async fn abort<S: ClientSession>(session: &mut S) {
    if let Err(err) = session.abort_transaction().await {
        warn!(session = session.id(), error = %err, "failed to abort transaction");
    }
}

type Registration<D> = Box<dyn FnOnce(&DocumentContext<D>) -> ContextResult<()> + Send>;

/// Builds a context with its collections registered up front.
pub struct ContextBuilder<D: DocumentDriver> {
    driver: D,
    options: ContextOptions,
    registrations: Vec<Registration<D>>,
}

impl<D: DocumentDriver> ContextBuilder<D> {
    fn new(driver: D) -> Self {
        Self {
            driver,
            options: ContextOptions::default(),
            registrations: Vec::new(),
        }
    }

    pub fn options(mut self, options: ContextOptions) -> Self {
        self.options = options;
        self
    }

    pub fn collection<A: Aggregate>(mut self, definition: CollectionDefinition<A>) -> Self {
        self.registrations.push(Box::new(move |context: &DocumentContext<D>| {
            context.collection(&definition).map(|_| ())
        }));
        self
    }

    pub async fn build(self) -> ContextResult<DocumentContext<D>> {
        let context = DocumentContext::new(self.driver, self.options).await?;
        for register in self.registrations {
            register(&context)?;
        }
        Ok(context)
    }
}
