//! Aggregate roots and their pending mutations.
//!
//! An aggregate applies every domain change to itself immediately and queues
//! a serializable description of it. The queue is drained by the collection
//! tracker at save time and rendered into update operations, one per
//! mutation, in queue order.

use crate::document::Update;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Shared handle to a tracked aggregate instance.
///
/// The tracker and the application hold the same instance; repeated queries
/// for one primary key hand out clones of the same `Arc`.
pub type DocumentRef<A> = Arc<RwLock<A>>;

pub fn document_ref<A>(aggregate: A) -> DocumentRef<A> {
    Arc::new(RwLock::new(aggregate))
}

/// A queued state change of an aggregate.
pub trait Mutation<A>: fmt::Debug + Clone + Send + Sync + 'static {
    /// In-memory effect on the aggregate.
    fn apply(&self, aggregate: &mut A);

    /// Update expression reproducing the effect on the stored document.
    fn to_update(&self) -> Update;
}

/// An entity whose changes are tracked and persisted by a collection
/// tracker.
pub trait Aggregate: Serialize + DeserializeOwned + Send + Sync + 'static {
    type Mutation: Mutation<Self>;

    fn pending_mutations(&self) -> &PendingMutations<Self::Mutation>;

    /// Apply a mutation in memory and queue it for the next save.
    fn append(&mut self, mutation: Self::Mutation)
    where
        Self: Sized,
    {
        mutation.apply(self);
        self.pending_mutations().push(mutation);
    }

    /// Take every queued mutation, leaving the queue empty.
    fn dequeue_mutations(&self) -> Vec<Self::Mutation> {
        self.pending_mutations().drain()
    }
}

/// Append-only mutation queue owned by an aggregate.
///
/// Draining swaps the whole queue for an empty one under the lock, so a
/// concurrent append lands either in the drained batch or in the next one.
/// Excluded from serialization and ignored by equality.
pub struct PendingMutations<M> {
    queue: Mutex<Vec<M>>,
}

impl<M> PendingMutations<M> {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, mutation: M) {
        self.queue.lock().push(mutation);
    }

    pub fn drain(&self) -> Vec<M> {
        std::mem::take(&mut *self.queue.lock())
    }

    /// Put drained mutations back ahead of anything queued since.
    pub fn requeue(&self, mut mutations: Vec<M>) {
        if mutations.is_empty() {
            return;
        }
        let mut queue = self.queue.lock();
        mutations.append(&mut queue);
        *queue = mutations;
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

impl<M: Clone> PendingMutations<M> {
    pub fn snapshot(&self) -> Vec<M> {
        self.queue.lock().clone()
    }
}

impl<M> Default for PendingMutations<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Clone> Clone for PendingMutations<M> {
    fn clone(&self) -> Self {
        Self {
            queue: Mutex::new(self.snapshot()),
        }
    }
}

impl<M: fmt::Debug> fmt::Debug for PendingMutations<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.queue.lock().iter()).finish()
    }
}

impl<M> PartialEq for PendingMutations<M> {
    fn eq(&self, _other: &Self) -> bool {
        true
    }
}

impl<M> Eq for PendingMutations<M> {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::thread;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Counter {
        id: u32,
        value: i64,
        #[serde(skip)]
        pending: PendingMutations<CounterMutation>,
    }

    #[derive(Debug, Clone, PartialEq)]
    enum CounterMutation {
        Added(i64),
    }

    impl Mutation<Counter> for CounterMutation {
        fn apply(&self, counter: &mut Counter) {
            match self {
                CounterMutation::Added(n) => counter.value += n,
            }
        }

        fn to_update(&self) -> Update {
            match self {
                CounterMutation::Added(n) => Update::new().inc("value", *n),
            }
        }
    }

    impl Aggregate for Counter {
        type Mutation = CounterMutation;

        fn pending_mutations(&self) -> &PendingMutations<CounterMutation> {
            &self.pending
        }
    }

    #[test]
    fn test_append_applies_and_queues_one_mutation() {
        let mut counter = Counter::default();
        counter.append(CounterMutation::Added(5));
        assert_eq!(counter.value, 5);
        assert_eq!(counter.pending_mutations().len(), 1);
    }

    #[test]
    fn test_dequeue_empties_queue_in_order() {
        let mut counter = Counter::default();
        counter.append(CounterMutation::Added(1));
        counter.append(CounterMutation::Added(2));
        assert_eq!(
            counter.dequeue_mutations(),
            vec![CounterMutation::Added(1), CounterMutation::Added(2)]
        );
        assert!(counter.pending_mutations().is_empty());
        assert!(counter.dequeue_mutations().is_empty());
    }

    #[test]
    fn test_requeue_goes_ahead_of_newer_mutations() {
        let queue = PendingMutations::new();
        queue.push(1);
        queue.push(2);
        let drained = queue.drain();
        queue.push(3);
        queue.requeue(drained);
        assert_eq!(queue.drain(), vec![1, 2, 3]);
    }

    #[test]
    fn test_pending_is_not_serialized_and_ignored_by_equality() {
        let mut counter = Counter {
            id: 7,
            ..Default::default()
        };
        counter.append(CounterMutation::Added(3));
        let json = serde_json::to_value(&counter).unwrap();
        assert_eq!(json, serde_json::json!({"id": 7, "value": 3}));

        let restored: Counter = serde_json::from_value(json).unwrap();
        assert!(restored.pending_mutations().is_empty());
        assert_eq!(restored, counter);
    }

    #[test]
    fn test_concurrent_append_and_drain_never_loses_or_duplicates() {
        let queue = Arc::new(PendingMutations::new());
        let writer = {
            let queue = queue.clone();
            thread::spawn(move || {
                for i in 0..1000 {
                    queue.push(i);
                }
            })
        };

        let mut seen = Vec::new();
        while seen.len() < 1000 {
            seen.extend(queue.drain());
            thread::yield_now();
        }
        writer.join().unwrap();
        seen.extend(queue.drain());

        assert_eq!(seen, (0..1000).collect::<Vec<_>>());
    }
}
