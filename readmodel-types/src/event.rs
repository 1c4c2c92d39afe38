//! Event log types and the read contract projections depend on.
//!
//! This module provides:
//! - `EventId`: the totally ordered identifier the log assigns on append
//! - `StoredEvent`: an immutable event as delivered to consumers
//! - `LoggedEvent`: the bound payload types satisfy to live on the log
//! - `BatchSize`: page size for paginated reads
//! - `EventLog`: paginated ascending reads plus bulk append

use crate::store::StoreError;
use nutype::nutype;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::future::Future;

/// Identifier the event log assigns to every appended event.
///
/// Identifiers are unique across the whole log and strictly increasing in
/// append order. `EventId::zero()` is never assigned to an event; it is the
/// checkpoint version of a consumer that has processed nothing yet and
/// displays as `"0"`.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Display,
    Into,
    Serialize,
    Deserialize
))]
pub struct EventId(u64);

impl EventId {
    /// The version of a checkpoint that has not processed any event.
    pub fn zero() -> Self {
        Self::new(0)
    }

    /// Returns true for the "nothing processed yet" marker.
    pub fn is_zero(self) -> bool {
        self.into_inner() == 0
    }
}

/// Batch size domain type for limiting page reads.
///
/// A batch size of zero is valid and will return an empty page.
#[nutype(derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Display))]
pub struct BatchSize(usize);

/// Payload types that can be appended to and read from the event log.
///
/// Each payload type names the log stream it lives on. Upstream producers
/// write one stream per source event type (finished matches, ranking
/// changes, ...), and a consumer reads exactly one stream.
pub trait LoggedEvent: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Name of the stream this payload type is stored on.
    const STREAM: &'static str;
}

/// An immutable event as stored in the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEvent<E> {
    /// Identifier assigned by the log on append.
    pub id: EventId,
    /// Consumer-specific payload.
    pub payload: E,
}

impl<E> StoredEvent<E> {
    /// Creates a stored event.
    pub fn new(id: EventId, payload: E) -> Self {
        Self { id, payload }
    }
}

/// Append-only log of domain events.
///
/// `load_since` must be a stable read: calling it twice with the same
/// checkpoint returns the same prefix (plus whatever has been appended
/// meanwhile), never reordering events already returned. Backends must make
/// appends visible in id order so a reader never observes id `n + 1` before
/// id `n` has committed.
pub trait EventLog: Send + Sync {
    /// Load up to `limit` events with id strictly greater than `after`,
    /// ascending by id.
    ///
    /// An empty result is not an error; it signals the reader is caught up.
    fn load_since<E: LoggedEvent>(
        &self,
        after: EventId,
        limit: BatchSize,
    ) -> impl Future<Output = Result<Vec<StoredEvent<E>>, StoreError>> + Send;

    /// Append payloads in order, returning the ids assigned to them.
    fn append<E: LoggedEvent>(
        &self,
        payloads: Vec<E>,
    ) -> impl Future<Output = Result<Vec<EventId>, StoreError>> + Send;

    /// Id of the newest event on the stream of `E`, if any.
    fn last_event_id<E: LoggedEvent>(
        &self,
    ) -> impl Future<Output = Result<Option<EventId>, StoreError>> + Send;

    /// Number of events on the stream of `E` with id strictly greater than
    /// `after`.
    ///
    /// Ids are shared by every stream, so this is not `head - after` once
    /// streams interleave.
    fn count_since<E: LoggedEvent>(
        &self,
        after: EventId,
    ) -> impl Future<Output = Result<u64, StoreError>> + Send;
}

/// Blanket implementation allowing EventLog to work with references.
impl<T: EventLog> EventLog for &T {
    async fn load_since<E: LoggedEvent>(
        &self,
        after: EventId,
        limit: BatchSize,
    ) -> Result<Vec<StoredEvent<E>>, StoreError> {
        (*self).load_since(after, limit).await
    }

    async fn append<E: LoggedEvent>(&self, payloads: Vec<E>) -> Result<Vec<EventId>, StoreError> {
        (*self).append(payloads).await
    }

    async fn last_event_id<E: LoggedEvent>(&self) -> Result<Option<EventId>, StoreError> {
        (*self).last_event_id::<E>().await
    }

    async fn count_since<E: LoggedEvent>(&self, after: EventId) -> Result<u64, StoreError> {
        (*self).count_since::<E>(after).await
    }
}

impl<T: EventLog> EventLog for std::sync::Arc<T> {
    async fn load_since<E: LoggedEvent>(
        &self,
        after: EventId,
        limit: BatchSize,
    ) -> Result<Vec<StoredEvent<E>>, StoreError> {
        self.as_ref().load_since(after, limit).await
    }

    async fn append<E: LoggedEvent>(&self, payloads: Vec<E>) -> Result<Vec<EventId>, StoreError> {
        self.as_ref().append(payloads).await
    }

    async fn last_event_id<E: LoggedEvent>(&self) -> Result<Option<EventId>, StoreError> {
        self.as_ref().last_event_id::<E>().await
    }

    async fn count_since<E: LoggedEvent>(&self, after: EventId) -> Result<u64, StoreError> {
        self.as_ref().count_since::<E>(after).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_event_id_displays_as_string_zero() {
        assert_eq!(EventId::zero().to_string(), "0");
        assert!(EventId::zero().is_zero());
    }

    #[test]
    fn event_ids_order_numerically() {
        assert!(EventId::new(9) < EventId::new(10));
        assert!(!EventId::new(101).is_zero());
    }

    #[test]
    fn stored_event_serializes_id_alongside_payload() {
        let event = StoredEvent::new(EventId::new(7), "match-finished".to_string());

        let value = serde_json::to_value(&event).expect("serializable");

        assert_eq!(value["id"], 7);
        assert_eq!(value["payload"], "match-finished");
    }
}
