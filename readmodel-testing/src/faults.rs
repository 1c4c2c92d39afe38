//! Deterministic fault injection for runner tests.

use parking_lot::Mutex;
use readmodel::{async_trait, Consumer, ConsumerError, ConsumerName};
use readmodel_types::{
    BatchSize, EventId, EventLog, LoggedEvent, Operation, StoreError, StoredEvent,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Wraps a consumer and fails whenever one of the configured events is
/// delivered, until the fault is cleared.
///
/// Events before the failing one are still passed to the inner consumer,
/// which is what a real partially applied page looks like.
#[derive(Debug)]
pub struct FailOnEvent<C> {
    inner: C,
    poisoned: Arc<Mutex<HashSet<EventId>>>,
}

/// Switch for the faults of a `FailOnEvent`, usable after the wrapper has
/// been moved into a runner.
#[derive(Debug, Clone)]
pub struct FaultSwitch {
    poisoned: Arc<Mutex<HashSet<EventId>>>,
}

impl FaultSwitch {
    /// Stop failing on every event.
    pub fn clear(&self) {
        self.poisoned.lock().clear();
    }

    /// Fail whenever `event` is delivered.
    pub fn poison(&self, event: EventId) {
        let _ = self.poisoned.lock().insert(event);
    }
}

impl<C> FailOnEvent<C> {
    pub fn new(inner: C, events: impl IntoIterator<Item = EventId>) -> Self {
        Self {
            inner,
            poisoned: Arc::new(Mutex::new(events.into_iter().collect())),
        }
    }

    /// Handle that can clear or add faults later.
    pub fn switch(&self) -> FaultSwitch {
        FaultSwitch {
            poisoned: Arc::clone(&self.poisoned),
        }
    }

    pub fn into_inner(self) -> C {
        self.inner
    }
}

#[async_trait]
impl<E, C> Consumer<E> for FailOnEvent<C>
where
    E: Send + Sync,
    C: Consumer<E>,
{
    fn name(&self) -> &ConsumerName {
        self.inner.name()
    }

    async fn update(&mut self, event: &StoredEvent<E>) -> Result<(), ConsumerError> {
        if self.poisoned.lock().contains(&event.id) {
            return Err(ConsumerError::new(format!("injected failure on event {}", event.id)));
        }
        self.inner.update(event).await
    }
}

/// Event log wrapper whose next `n` reads fail with `StoreFailure`.
#[derive(Debug)]
pub struct FlakyEventLog<L> {
    inner: L,
    remaining_failures: AtomicUsize,
    reads: AtomicUsize,
}

impl<L> FlakyEventLog<L> {
    /// Fail the next `failures` reads.
    pub fn new(inner: L, failures: usize) -> Self {
        Self {
            inner,
            remaining_failures: AtomicUsize::new(failures),
            reads: AtomicUsize::new(0),
        }
    }

    /// Number of `load_since` calls so far, failed ones included.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    fn take_failure(&self) -> bool {
        self.remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

impl<L: EventLog> EventLog for FlakyEventLog<L> {
    async fn load_since<E: LoggedEvent>(
        &self,
        after: EventId,
        limit: BatchSize,
    ) -> Result<Vec<StoredEvent<E>>, StoreError> {
        let _ = self.reads.fetch_add(1, Ordering::SeqCst);
        if self.take_failure() {
            return Err(StoreError::StoreFailure {
                operation: Operation::LoadEvents,
            });
        }
        self.inner.load_since(after, limit).await
    }

    async fn append<E: LoggedEvent>(&self, payloads: Vec<E>) -> Result<Vec<EventId>, StoreError> {
        self.inner.append(payloads).await
    }

    async fn last_event_id<E: LoggedEvent>(&self) -> Result<Option<EventId>, StoreError> {
        self.inner.last_event_id::<E>().await
    }

    async fn count_since<E: LoggedEvent>(&self, after: EventId) -> Result<u64, StoreError> {
        self.inner.count_since::<E>(after).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EventCollector;
    use readmodel_memory::InMemoryStore;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Ping(u8);

    impl LoggedEvent for Ping {
        const STREAM: &'static str = "pings";
    }

    #[tokio::test]
    async fn flaky_log_fails_exactly_n_reads() {
        let store = InMemoryStore::new();
        let _ = store.append(vec![Ping(1)]).await.expect("append");
        let flaky = FlakyEventLog::new(store, 2);

        let first = flaky.load_since::<Ping>(EventId::zero(), BatchSize::new(10)).await;
        let second = flaky.load_since::<Ping>(EventId::zero(), BatchSize::new(10)).await;
        let third = flaky.load_since::<Ping>(EventId::zero(), BatchSize::new(10)).await;

        assert!(first.is_err() && second.is_err());
        assert_eq!(third.expect("recovered").len(), 1);
        assert_eq!(flaky.reads(), 3);
    }

    #[tokio::test]
    async fn fail_on_event_stops_failing_once_cleared() {
        let mut consumer = FailOnEvent::new(EventCollector::<u8>::new("fragile"), [EventId::new(3)]);
        let switch = consumer.switch();
        let event = StoredEvent::new(EventId::new(3), 9u8);

        assert!(consumer.update(&event).await.is_err());
        switch.clear();
        assert!(consumer.update(&event).await.is_ok());
    }
}
