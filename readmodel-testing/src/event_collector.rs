//! Consumer that records what it was given, for assertions.
//!
//! `EventCollector` keeps delivered events in shared storage so a test can
//! hand the collector to a runner (which takes ownership) and still inspect
//! the deliveries afterwards.
//!
//! # Example
//!
//! ```ignore
//! let collector = EventCollector::<MatchFinished>::new("collector");
//! let deliveries = collector.handle();
//! ProjectionRunner::new(collector, &store, &store)
//!     .with_poll_mode(PollMode::Batch)
//!     .run()
//!     .await?;
//!
//! assert_eq!(deliveries.ids(), vec![EventId::new(1), EventId::new(2)]);
//! ```

use parking_lot::Mutex;
use readmodel::{async_trait, Consumer, ConsumerError, ConsumerName};
use readmodel_types::{EventId, StoredEvent};
use std::sync::Arc;

/// Shared view of the events an `EventCollector` received, in delivery
/// order and including redeliveries.
#[derive(Debug)]
pub struct Deliveries<E> {
    events: Arc<Mutex<Vec<StoredEvent<E>>>>,
}

impl<E> Clone for Deliveries<E> {
    fn clone(&self) -> Self {
        Self {
            events: Arc::clone(&self.events),
        }
    }
}

impl<E: Clone> Deliveries<E> {
    pub fn events(&self) -> Vec<StoredEvent<E>> {
        self.events.lock().clone()
    }

    pub fn ids(&self) -> Vec<EventId> {
        self.events.lock().iter().map(|event| event.id).collect()
    }

    pub fn payloads(&self) -> Vec<E> {
        self.events
            .lock()
            .iter()
            .map(|event| event.payload.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

/// A consumer that never fails and records every delivery.
#[derive(Debug)]
pub struct EventCollector<E> {
    name: ConsumerName,
    deliveries: Deliveries<E>,
}

impl<E> EventCollector<E> {
    /// # Panics
    ///
    /// Panics if `name` is not a valid consumer name.
    pub fn new(name: &str) -> Self {
        Self {
            name: ConsumerName::try_new(name).expect("valid consumer name"),
            deliveries: Deliveries {
                events: Arc::new(Mutex::new(Vec::new())),
            },
        }
    }

    /// Handle to the recorded deliveries that outlives the collector.
    pub fn handle(&self) -> Deliveries<E> {
        self.deliveries.clone()
    }
}

#[async_trait]
impl<E> Consumer<E> for EventCollector<E>
where
    E: Clone + Send + Sync,
{
    fn name(&self) -> &ConsumerName {
        &self.name
    }

    async fn update(&mut self, event: &StoredEvent<E>) -> Result<(), ConsumerError> {
        self.deliveries.events.lock().push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_deliveries_in_order() {
        let mut collector = EventCollector::<u32>::new("collector");
        let deliveries = collector.handle();

        collector.update(&StoredEvent::new(EventId::new(1), 10)).await.expect("collects");
        collector.update(&StoredEvent::new(EventId::new(2), 20)).await.expect("collects");

        assert_eq!(deliveries.ids(), vec![EventId::new(1), EventId::new(2)]);
        assert_eq!(deliveries.payloads(), vec![10, 20]);
    }
}
