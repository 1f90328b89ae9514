use crate::aggregate::DocumentRef;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Lifecycle state of a tracked document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DocumentState {
    /// Attached for insertion.
    Added,
    /// Loaded or saved, no queued mutations seen at the last save.
    Unchanged,
    /// Had queued mutations at save time.
    Modified,
    /// Attached for deletion. Removed from the table once the delete commits.
    Deleted,
}

impl DocumentState {
    /// State after a committed save.
    ///
    /// `None` means the entry leaves the table.
    pub fn after_commit(self) -> Option<DocumentState> {
        match self {
            DocumentState::Added | DocumentState::Unchanged | DocumentState::Modified => {
                Some(DocumentState::Unchanged)
            }
            DocumentState::Deleted => None,
        }
    }
}

impl fmt::Display for DocumentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DocumentState::Added => "added",
            DocumentState::Unchanged => "unchanged",
            DocumentState::Modified => "modified",
            DocumentState::Deleted => "deleted",
        };
        f.write_str(name)
    }
}

/// An aggregate instance together with its lifecycle state.
pub struct TrackedDocument<A> {
    pub document: DocumentRef<A>,
    pub state: DocumentState,
}

impl<A> TrackedDocument<A> {
    pub fn new(document: DocumentRef<A>, state: DocumentState) -> Self {
        Self { document, state }
    }

    /// Whether `other` is the very instance this entry tracks.
    pub fn is_instance(&self, other: &DocumentRef<A>) -> bool {
        Arc::ptr_eq(&self.document, other)
    }
}

impl<A> Clone for TrackedDocument<A> {
    fn clone(&self) -> Self {
        Self {
            document: self.document.clone(),
            state: self.state,
        }
    }
}

impl<A> fmt::Debug for TrackedDocument<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackedDocument")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
