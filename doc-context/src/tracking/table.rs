use super::state::{DocumentState, TrackedDocument};
use crate::aggregate::DocumentRef;
use crate::document::PrimaryKey;
use indexmap::IndexMap;
use parking_lot::RwLock;

/// Primary key → tracked document, in attach order.
///
/// At most one entry per key. Guarded by a lock so concurrent readers and
/// writers never corrupt the bookkeeping.
pub(crate) struct TrackedTable<A> {
    entries: RwLock<IndexMap<PrimaryKey, TrackedDocument<A>>>,
}

impl<A> TrackedTable<A> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(IndexMap::new()),
        }
    }

    /// Track `document` with `state`, replacing any instance already tracked
    /// under `key`. Returns the replaced entry.
    pub fn replace(
        &self,
        key: PrimaryKey,
        document: DocumentRef<A>,
        state: DocumentState,
    ) -> Option<TrackedDocument<A>> {
        self.entries
            .write()
            .insert(key, TrackedDocument::new(document, state))
    }

    /// Overwrite the state of the entry under `key`, tracking `document` only
    /// when the key is not tracked yet.
    pub fn mark(&self, key: PrimaryKey, document: DocumentRef<A>, state: DocumentState) {
        let mut entries = self.entries.write();
        match entries.get_mut(&key) {
            Some(existing) => existing.state = state,
            None => {
                entries.insert(key, TrackedDocument::new(document, state));
            }
        }
    }

    /// Track `document` unless `key` is already tracked. Returns the tracked
    /// instance either way.
    pub fn get_or_insert(
        &self,
        key: PrimaryKey,
        document: DocumentRef<A>,
        state: DocumentState,
    ) -> DocumentRef<A> {
        let mut entries = self.entries.write();
        entries
            .entry(key)
            .or_insert_with(|| TrackedDocument::new(document, state))
            .document
            .clone()
    }

    pub fn snapshot(&self) -> Vec<(PrimaryKey, TrackedDocument<A>)> {
        self.entries
            .read()
            .iter()
            .map(|(key, tracked)| (key.clone(), tracked.clone()))
            .collect()
    }

    pub fn get(&self, key: &PrimaryKey) -> Option<TrackedDocument<A>> {
        self.entries.read().get(key).cloned()
    }

    pub fn state_of(&self, key: &PrimaryKey) -> Option<DocumentState> {
        self.entries.read().get(key).map(|tracked| tracked.state)
    }

    /// Move the entry from `expected` to `next` if it still tracks `document`
    /// in the `expected` state. `None` removes it.
    pub fn transition(
        &self,
        key: &PrimaryKey,
        document: &DocumentRef<A>,
        expected: DocumentState,
        next: Option<DocumentState>,
    ) -> bool {
        let mut entries = self.entries.write();
        let unchanged_since = matches!(
            entries.get(key),
            Some(current) if current.is_instance(document) && current.state == expected
        );
        if !unchanged_since {
            return false;
        }
        match next {
            Some(state) => {
                if let Some(current) = entries.get_mut(key) {
                    current.state = state;
                }
            }
            None => {
                entries.shift_remove(key);
            }
        }
        true
    }

    pub fn keys(&self) -> Vec<PrimaryKey> {
        self.entries.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }
}
