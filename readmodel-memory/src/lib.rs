//! In-memory backend for the readmodel projection engine
//!
//! This crate provides an in-memory implementation of every store trait from
//! `readmodel-types` (event log, checkpoint store, session-aware document
//! store) behind a single cloneable handle. It is intended for tests and
//! development where persistence is not required.
//!
//! Transactions are staged per session and applied under a single write lock
//! on commit, so either every write of a unit of work becomes visible or none
//! does.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use readmodel_types::{
    BatchSize, Checkpoint, CheckpointStore, ConsumerName, DocumentKey, DocumentSession,
    DocumentStore, EventId, EventLog, LoggedEvent, Season, StoreError, StoredDocument,
    StoredEvent, SyncState,
};
use serde_json::Value;
use tracing::{debug, warn};

type CollectionKey = (String, DocumentKey);

#[derive(Debug, Clone)]
struct Record {
    version: u64,
    body: Value,
    // `None` for documents that never went through `insert_unsynced`;
    // those are invisible to checkout.
    was_synced_just_now: Option<bool>,
}

#[derive(Debug, Default)]
struct EventTable {
    last_id: u64,
    streams: HashMap<&'static str, Vec<StoredEvent<Value>>>,
}

#[derive(Debug, Default)]
struct Inner {
    events: RwLock<EventTable>,
    checkpoints: RwLock<BTreeMap<ConsumerName, Checkpoint>>,
    documents: RwLock<HashMap<CollectionKey, Record>>,
}

/// Thread-safe in-memory store for testing.
///
/// Clones share the same underlying state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<Inner>,
}

impl InMemoryStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of documents currently stored in a collection.
    pub fn document_count(&self, collection: &str) -> usize {
        self.inner
            .documents
            .read()
            .keys()
            .filter(|(name, _)| name == collection)
            .count()
    }

    fn session_writes<'s>(
        &self,
        session: Option<&'s mut InMemorySession>,
    ) -> Result<Option<&'s mut Vec<StagedWrite>>, StoreError> {
        match session {
            Some(session) => {
                if !Arc::ptr_eq(&session.inner, &self.inner) {
                    return Err(StoreError::SessionState {
                        detail: "session belongs to a different store".to_string(),
                    });
                }
                Ok(session.staged.as_mut())
            }
            None => Ok(None),
        }
    }
}

#[derive(Debug, Clone)]
enum StagedWrite {
    Upsert {
        collection: String,
        document: StoredDocument,
        reset_flag: bool,
    },
    Replace {
        collection: String,
        document: StoredDocument,
        expected_version: u64,
    },
    Delete {
        collection: String,
        key: DocumentKey,
    },
}

impl StagedWrite {
    fn target(&self) -> (&str, &DocumentKey) {
        match self {
            StagedWrite::Upsert {
                collection,
                document,
                ..
            }
            | StagedWrite::Replace {
                collection,
                document,
                ..
            } => (collection, &document.key),
            StagedWrite::Delete { collection, key } => (collection, key),
        }
    }

    /// Apply this write on top of `current`.
    ///
    /// Returns `Err` if a conditional replace no longer matches.
    fn apply(&self, current: Option<Record>) -> Result<Option<Record>, StoreError> {
        match self {
            StagedWrite::Upsert {
                document,
                reset_flag,
                ..
            } => Ok(Some(Record {
                version: document.version,
                body: document.body.clone(),
                was_synced_just_now: if *reset_flag {
                    Some(false)
                } else {
                    current.and_then(|record| record.was_synced_just_now)
                },
            })),
            StagedWrite::Replace {
                collection,
                document,
                expected_version,
            } => match current {
                Some(record) if record.version == *expected_version => Ok(Some(Record {
                    version: document.version,
                    body: document.body.clone(),
                    was_synced_just_now: record.was_synced_just_now,
                })),
                _ => Err(StoreError::VersionConflict {
                    collection: collection.clone(),
                    key: document.key.to_string(),
                }),
            },
            StagedWrite::Delete { .. } => Ok(None),
        }
    }
}

/// Session over an [`InMemoryStore`].
///
/// Outside a transaction, operations through the session auto-commit. Inside
/// one, writes are staged and become visible on `commit`.
#[derive(Debug)]
pub struct InMemorySession {
    inner: Arc<Inner>,
    staged: Option<Vec<StagedWrite>>,
}

impl InMemorySession {
    /// Number of writes waiting for commit.
    pub fn pending_writes(&self) -> usize {
        self.staged.as_ref().map_or(0, Vec::len)
    }

    /// Current view of a key: committed record overlaid with staged writes.
    fn view(&self, collection: &str, key: &DocumentKey) -> Option<Record> {
        let committed = self
            .inner
            .documents
            .read()
            .get(&(collection.to_string(), key.clone()))
            .cloned();
        let Some(staged) = self.staged.as_ref() else {
            return committed;
        };
        staged
            .iter()
            .filter(|write| write.target() == (collection, key))
            .fold(committed, |current, write| {
                write.apply(current.clone()).unwrap_or(current)
            })
    }
}

impl DocumentSession for InMemorySession {
    async fn begin(&mut self) -> Result<(), StoreError> {
        if self.staged.is_some() {
            return Err(StoreError::SessionState {
                detail: "transaction already in progress".to_string(),
            });
        }
        self.staged = Some(Vec::new());
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let staged = self.staged.take().ok_or_else(|| StoreError::SessionState {
            detail: "commit without a transaction".to_string(),
        })?;

        let mut documents = self.inner.documents.write();
        let mut overlay: HashMap<CollectionKey, Option<Record>> = HashMap::new();
        for write in &staged {
            let (collection, key) = write.target();
            let slot = (collection.to_string(), key.clone());
            let current = match overlay.get(&slot) {
                Some(pending) => pending.clone(),
                None => documents.get(&slot).cloned(),
            };
            let next = write.apply(current).inspect_err(|error| {
                warn!(error = %error, "[memory.commit] conditional write lost, transaction discarded");
            })?;
            let _ = overlay.insert(slot, next);
        }

        let applied = overlay.len();
        for (slot, record) in overlay {
            match record {
                Some(record) => {
                    let _ = documents.insert(slot, record);
                }
                None => {
                    let _ = documents.remove(&slot);
                }
            }
        }
        debug!(
            writes = staged.len(),
            documents = applied,
            "[memory.commit] transaction committed"
        );
        Ok(())
    }

    async fn abort(&mut self) -> Result<(), StoreError> {
        match self.staged.take() {
            Some(staged) => {
                debug!(
                    writes = staged.len(),
                    "[memory.abort] transaction discarded"
                );
                Ok(())
            }
            None => Err(StoreError::SessionState {
                detail: "abort without a transaction".to_string(),
            }),
        }
    }

    fn is_in_transaction(&self) -> bool {
        self.staged.is_some()
    }
}

impl EventLog for InMemoryStore {
    async fn load_since<E: LoggedEvent>(
        &self,
        after: EventId,
        limit: BatchSize,
    ) -> Result<Vec<StoredEvent<E>>, StoreError> {
        let events = self.inner.events.read();
        let Some(stream) = events.streams.get(E::STREAM) else {
            return Ok(Vec::new());
        };

        // Ids are appended in ascending order, so the first id past `after`
        // starts the page.
        let start = stream.partition_point(|event| event.id <= after);
        stream[start..]
            .iter()
            .take(limit.into_inner())
            .map(|event| {
                serde_json::from_value(event.payload.clone())
                    .map(|payload| StoredEvent::new(event.id, payload))
                    .map_err(|error| StoreError::Deserialization {
                        key: format!("{}/{}", E::STREAM, event.id),
                        detail: error.to_string(),
                    })
            })
            .collect()
    }

    async fn append<E: LoggedEvent>(&self, payloads: Vec<E>) -> Result<Vec<EventId>, StoreError> {
        let values = payloads
            .iter()
            .map(|payload| {
                serde_json::to_value(payload).map_err(|error| StoreError::Serialization {
                    key: E::STREAM.to_string(),
                    detail: error.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut events = self.inner.events.write();
        let mut ids = Vec::with_capacity(values.len());
        for value in values {
            events.last_id += 1;
            let id = EventId::new(events.last_id);
            events
                .streams
                .entry(E::STREAM)
                .or_default()
                .push(StoredEvent::new(id, value));
            ids.push(id);
        }
        Ok(ids)
    }

    async fn last_event_id<E: LoggedEvent>(&self) -> Result<Option<EventId>, StoreError> {
        Ok(self
            .inner
            .events
            .read()
            .streams
            .get(E::STREAM)
            .and_then(|stream| stream.last())
            .map(|event| event.id))
    }

    async fn count_since<E: LoggedEvent>(&self, after: EventId) -> Result<u64, StoreError> {
        let events = self.inner.events.read();
        let pending = events.streams.get(E::STREAM).map_or(0, |stream| {
            stream.len() - stream.partition_point(|event| event.id <= after)
        });
        Ok(pending as u64)
    }
}

impl CheckpointStore for InMemoryStore {
    async fn get_last_version(&self, consumer: &ConsumerName) -> Result<Checkpoint, StoreError> {
        Ok(self
            .inner
            .checkpoints
            .read()
            .get(consumer)
            .cloned()
            .unwrap_or_else(|| Checkpoint::initial(consumer.clone())))
    }

    async fn save_last_version(
        &self,
        consumer: &ConsumerName,
        version: EventId,
        season: Season,
        is_stopped: bool,
    ) -> Result<(), StoreError> {
        let mut checkpoints = self.inner.checkpoints.write();
        let checkpoint = checkpoints
            .entry(consumer.clone())
            .or_insert_with(|| Checkpoint::initial(consumer.clone()));
        if version < checkpoint.version {
            return Err(StoreError::CheckpointRegression {
                consumer: consumer.clone(),
                current: checkpoint.version,
                attempted: version,
            });
        }
        checkpoint.version = version;
        checkpoint.season = season;
        checkpoint.is_stopped = is_stopped;
        Ok(())
    }

    async fn save_sync_state(
        &self,
        consumer: &ConsumerName,
        state: SyncState,
    ) -> Result<(), StoreError> {
        self.inner
            .checkpoints
            .write()
            .entry(consumer.clone())
            .or_insert_with(|| Checkpoint::initial(consumer.clone()))
            .sync_state = Some(state);
        Ok(())
    }

    async fn list_checkpoints(&self) -> Result<Vec<Checkpoint>, StoreError> {
        Ok(self.inner.checkpoints.read().values().cloned().collect())
    }
}

impl DocumentStore for InMemoryStore {
    type Session = InMemorySession;

    async fn start_session(&self) -> Result<Self::Session, StoreError> {
        Ok(InMemorySession {
            inner: Arc::clone(&self.inner),
            staged: None,
        })
    }

    async fn get(
        &self,
        session: Option<&mut Self::Session>,
        collection: &str,
        key: &DocumentKey,
    ) -> Result<Option<StoredDocument>, StoreError> {
        let record = match session {
            Some(session) => {
                let _ = self.session_writes(Some(&mut *session))?;
                session.view(collection, key)
            }
            None => self
                .inner
                .documents
                .read()
                .get(&(collection.to_string(), key.clone()))
                .cloned(),
        };
        Ok(record.map(|record| StoredDocument {
            key: key.clone(),
            version: record.version,
            body: record.body,
        }))
    }

    async fn upsert(
        &self,
        session: Option<&mut Self::Session>,
        collection: &str,
        document: StoredDocument,
    ) -> Result<(), StoreError> {
        let write = StagedWrite::Upsert {
            collection: collection.to_string(),
            document,
            reset_flag: false,
        };
        self.write_or_stage(session, write)
    }

    async fn replace_if_version(
        &self,
        session: Option<&mut Self::Session>,
        collection: &str,
        document: StoredDocument,
        expected_version: u64,
    ) -> Result<u64, StoreError> {
        let write = StagedWrite::Replace {
            collection: collection.to_string(),
            document,
            expected_version,
        };
        match self.write_or_stage(session, write) {
            Ok(()) => Ok(1),
            Err(StoreError::VersionConflict { .. }) => Ok(0),
            Err(error) => Err(error),
        }
    }

    async fn delete(
        &self,
        session: Option<&mut Self::Session>,
        collection: &str,
        key: &DocumentKey,
    ) -> Result<bool, StoreError> {
        let existed = self.get(None, collection, key).await?.is_some();
        let staged_existed = match session.as_deref() {
            Some(session) if session.is_in_transaction() => {
                session.view(collection, key).is_some()
            }
            _ => existed,
        };
        let write = StagedWrite::Delete {
            collection: collection.to_string(),
            key: key.clone(),
        };
        self.write_or_stage(session, write)?;
        Ok(staged_existed)
    }

    async fn insert_unsynced(
        &self,
        session: Option<&mut Self::Session>,
        collection: &str,
        document: StoredDocument,
    ) -> Result<(), StoreError> {
        let write = StagedWrite::Upsert {
            collection: collection.to_string(),
            document,
            reset_flag: true,
        };
        self.write_or_stage(session, write)
    }

    async fn checkout_unsynced(&self, collection: &str) -> Result<Vec<StoredDocument>, StoreError> {
        let mut documents = self.inner.documents.write();
        let mut taken: Vec<StoredDocument> = documents
            .iter_mut()
            .filter(|((name, _), record)| {
                name == collection && record.was_synced_just_now == Some(false)
            })
            .map(|((_, key), record)| {
                record.was_synced_just_now = Some(true);
                StoredDocument {
                    key: key.clone(),
                    version: record.version,
                    body: record.body.clone(),
                }
            })
            .collect();
        taken.sort_by(|a, b| a.key.cmp(&b.key));
        debug!(
            collection,
            taken = taken.len(),
            "[memory.checkout] flipped unsynced documents"
        );
        Ok(taken)
    }

    async fn release(&self, collection: &str, keys: &[DocumentKey]) -> Result<u64, StoreError> {
        let mut documents = self.inner.documents.write();
        let mut released = 0;
        for key in keys {
            if let Some(record) = documents.get_mut(&(collection.to_string(), key.clone())) {
                if record.was_synced_just_now == Some(true) {
                    record.was_synced_just_now = Some(false);
                    released += 1;
                }
            }
        }
        Ok(released)
    }
}

impl InMemoryStore {
    /// Stage the write if the session is in a transaction, otherwise apply it
    /// immediately under the document lock.
    fn write_or_stage(
        &self,
        session: Option<&mut InMemorySession>,
        write: StagedWrite,
    ) -> Result<(), StoreError> {
        let in_transaction = session
            .as_deref()
            .is_some_and(InMemorySession::is_in_transaction);
        if in_transaction {
            if let Some(session) = session {
                if let StagedWrite::Replace {
                    expected_version, ..
                } = &write
                {
                    let (collection, key) = write.target();
                    let current = session.view(collection, key);
                    if current.map(|record| record.version) != Some(*expected_version) {
                        return Err(StoreError::VersionConflict {
                            collection: collection.to_string(),
                            key: key.to_string(),
                        });
                    }
                }
                if let Some(staged) = self.session_writes(Some(session))? {
                    staged.push(write);
                }
            }
            return Ok(());
        }

        let _ = self.session_writes(session)?;
        let mut documents = self.inner.documents.write();
        let (collection, key) = write.target();
        let slot = (collection.to_string(), key.clone());
        let current = documents.get(&slot).cloned();
        match write.apply(current)? {
            Some(record) => {
                let _ = documents.insert(slot, record);
            }
            None => {
                let _ = documents.remove(&slot);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(raw: &str) -> DocumentKey {
        DocumentKey::try_new(raw).expect("valid document key")
    }

    fn doc(raw: &str, version: u64, body: Value) -> StoredDocument {
        StoredDocument {
            key: key(raw),
            version,
            body,
        }
    }

    #[tokio::test]
    async fn staged_writes_are_invisible_until_commit() {
        let store = InMemoryStore::new();
        let mut session = store.start_session().await.unwrap();
        session.begin().await.unwrap();

        store
            .upsert(Some(&mut session), "stats", doc("p1", 0, json!({"wins": 1})))
            .await
            .unwrap();

        assert_eq!(session.pending_writes(), 1);
        assert!(store.get(None, "stats", &key("p1")).await.unwrap().is_none());
        assert!(store
            .get(Some(&mut session), "stats", &key("p1"))
            .await
            .unwrap()
            .is_some());

        session.commit().await.unwrap();

        assert!(store.get(None, "stats", &key("p1")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn dropping_a_session_discards_staged_writes() {
        let store = InMemoryStore::new();
        {
            let mut session = store.start_session().await.unwrap();
            session.begin().await.unwrap();
            store
                .upsert(Some(&mut session), "stats", doc("p1", 0, json!({})))
                .await
                .unwrap();
        }

        assert_eq!(store.document_count("stats"), 0);
    }

    #[tokio::test]
    async fn commit_fails_atomically_when_a_conditional_replace_lost() {
        let store = InMemoryStore::new();
        store
            .upsert(None, "stats", doc("p1", 1, json!({"wins": 1})))
            .await
            .unwrap();

        let mut session = store.start_session().await.unwrap();
        session.begin().await.unwrap();
        store
            .upsert(Some(&mut session), "stats", doc("p2", 0, json!({"wins": 9})))
            .await
            .unwrap();
        let matched = store
            .replace_if_version(Some(&mut session), "stats", doc("p1", 2, json!({"wins": 2})), 1)
            .await
            .unwrap();
        assert_eq!(matched, 1);

        // Another writer wins the race before commit.
        store
            .upsert(None, "stats", doc("p1", 5, json!({"wins": 5})))
            .await
            .unwrap();

        let error = session.commit().await.expect_err("conflict at commit");

        assert!(matches!(error, StoreError::VersionConflict { .. }));
        assert!(store.get(None, "stats", &key("p2")).await.unwrap().is_none());
        assert_eq!(
            store.get(None, "stats", &key("p1")).await.unwrap().unwrap().version,
            5
        );
    }

    #[tokio::test]
    async fn session_from_another_store_is_rejected() {
        let store = InMemoryStore::new();
        let other = InMemoryStore::new();
        let mut session = other.start_session().await.unwrap();
        session.begin().await.unwrap();

        let error = store
            .upsert(Some(&mut session), "stats", doc("p1", 0, json!({})))
            .await
            .expect_err("foreign session");

        assert!(matches!(error, StoreError::SessionState { .. }));
    }

    #[tokio::test]
    async fn foreign_session_is_rejected_on_reads_outside_a_transaction() {
        let store = InMemoryStore::new();
        store
            .upsert(None, "stats", doc("p1", 0, json!({})))
            .await
            .unwrap();
        let other = InMemoryStore::new();
        let mut session = other.start_session().await.unwrap();

        let error = store
            .get(Some(&mut session), "stats", &key("p1"))
            .await
            .expect_err("foreign session");

        assert!(matches!(error, StoreError::SessionState { .. }));
    }

    #[tokio::test]
    async fn checkpoint_save_keeps_sync_state() {
        let store = InMemoryStore::new();
        let consumer = ConsumerName::try_new("stats").unwrap();
        store
            .save_sync_state(&consumer, SyncState::new(json!({"page": 3})))
            .await
            .unwrap();

        store
            .save_last_version(&consumer, EventId::new(10), Season::new(2), false)
            .await
            .unwrap();

        let checkpoint = store.get_last_version(&consumer).await.unwrap();
        assert_eq!(checkpoint.version, EventId::new(10));
        assert_eq!(checkpoint.season, Season::new(2));
        assert_eq!(
            checkpoint.sync_state,
            Some(SyncState::new(json!({"page": 3})))
        );
    }
}
