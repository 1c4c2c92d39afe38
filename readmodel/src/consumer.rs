//! The consumer capability and its tracing decorator.

use crate::errors::ConsumerError;
use async_trait::async_trait;
use readmodel_types::{ConsumerName, StoredEvent};
use std::time::Instant;
use tracing::{debug, info_span, warn, Instrument};

/// A unit of logic that folds events into a projection.
///
/// The runner calls `update` once per event, in ascending id order, and never
/// concurrently for the same consumer. A failed page is re-delivered in full,
/// so `update` must be idempotent under redelivery.
#[async_trait]
pub trait Consumer<E>: Send
where
    E: Send + Sync,
{
    /// Stable name keying this consumer's checkpoint.
    fn name(&self) -> &ConsumerName;

    /// Apply one event to the projection.
    async fn update(&mut self, event: &StoredEvent<E>) -> Result<(), ConsumerError>;
}

#[async_trait]
impl<E> Consumer<E> for Box<dyn Consumer<E>>
where
    E: Send + Sync + 'static,
{
    fn name(&self) -> &ConsumerName {
        (**self).name()
    }

    async fn update(&mut self, event: &StoredEvent<E>) -> Result<(), ConsumerError> {
        (**self).update(event).await
    }
}

/// Runs every `update` of the wrapped consumer inside a `consumer.update`
/// span carrying the consumer name and event id.
#[derive(Debug, Clone)]
pub struct Traced<C> {
    inner: C,
}

impl<C> Traced<C> {
    /// Wrap `inner`.
    pub fn new(inner: C) -> Self {
        Self { inner }
    }

    /// Unwrap the decorated consumer.
    pub fn into_inner(self) -> C {
        self.inner
    }
}

#[async_trait]
impl<E, C> Consumer<E> for Traced<C>
where
    E: Send + Sync,
    C: Consumer<E>,
{
    fn name(&self) -> &ConsumerName {
        self.inner.name()
    }

    async fn update(&mut self, event: &StoredEvent<E>) -> Result<(), ConsumerError> {
        let span = info_span!(
            "consumer.update",
            consumer = %self.inner.name(),
            event_id = %event.id,
        );
        let started = Instant::now();
        let result = self.inner.update(event).instrument(span.clone()).await;
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        span.in_scope(|| match &result {
            Ok(()) => debug!(elapsed_ms, "[consumer.update] event applied"),
            Err(error) => warn!(elapsed_ms, error = %error, "[consumer.update] event failed"),
        });
        result
    }
}

/// Extension methods available on every consumer.
pub trait ConsumerExt<E>: Consumer<E> + Sized
where
    E: Send + Sync,
{
    /// Wrap in the tracing decorator.
    fn traced(self) -> Traced<Self> {
        Traced::new(self)
    }
}

impl<E, C> ConsumerExt<E> for C
where
    E: Send + Sync,
    C: Consumer<E>,
{
}
