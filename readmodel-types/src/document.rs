//! Projection documents and the session-aware document store contract.
//!
//! Read models are stored as JSON documents grouped in collections and
//! addressed by business key (a player id, a match id, ...), never by event id,
//! so replaying a page upserts the same documents again rather than adding
//! new ones.
//!
//! Every store operation takes an optional session. `None` writes are
//! committed immediately; writes through a session that has begun a
//! transaction become visible only when that session commits.

use crate::store::StoreError;
use crate::validation::no_control_characters;
use nutype::nutype;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::future::Future;

/// Business key of a document within its collection.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255, predicate = no_control_characters),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct DocumentKey(String);

/// A typed read-model document.
pub trait Document: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Collection the document is stored in.
    const COLLECTION: &'static str;

    /// Business key of this document.
    fn key(&self) -> DocumentKey;
}

/// A document carrying a version for optimistic concurrency.
///
/// Documents that have never been versioned report version `0`.
pub trait Versioned: Document {
    /// Current version as last read or written.
    fn version(&self) -> u64;

    /// Overwrite the in-memory version.
    fn set_version(&mut self, version: u64);
}

/// A document as the store sees it: key, version and JSON body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredDocument {
    /// Business key.
    pub key: DocumentKey,
    /// Version used by conditional replaces. Unversioned documents use `0`.
    pub version: u64,
    /// Serialized document.
    pub body: Value,
}

impl StoredDocument {
    /// Serialize a typed document.
    pub fn from_document<D: Document>(document: &D, version: u64) -> Result<Self, StoreError> {
        let key = document.key();
        let body = serde_json::to_value(document).map_err(|error| StoreError::Serialization {
            key: key.to_string(),
            detail: error.to_string(),
        })?;
        Ok(Self { key, version, body })
    }

    /// Deserialize into a typed document.
    pub fn into_document<D: Document>(self) -> Result<D, StoreError> {
        let key = self.key;
        serde_json::from_value(self.body).map_err(|error| StoreError::Deserialization {
            key: key.to_string(),
            detail: error.to_string(),
        })
    }
}

/// A store session that can wrap writes in a multi-document transaction.
///
/// Dropping a session whose transaction has begun but not committed discards
/// every write made through it.
pub trait DocumentSession: Send {
    /// Start a transaction on this session.
    fn begin(&mut self) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Commit the running transaction, making its writes visible atomically.
    fn commit(&mut self) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Abort the running transaction, discarding its writes.
    fn abort(&mut self) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Whether `begin` has been called without a matching commit or abort.
    fn is_in_transaction(&self) -> bool;
}

/// Session-aware store of read-model documents.
pub trait DocumentStore: Send + Sync {
    /// Session type handed out by `start_session`.
    type Session: DocumentSession;

    /// Open a new session. The session starts outside any transaction.
    fn start_session(&self) -> impl Future<Output = Result<Self::Session, StoreError>> + Send;

    /// Read a document by key. Reads through a session see its own
    /// uncommitted writes.
    fn get(
        &self,
        session: Option<&mut Self::Session>,
        collection: &str,
        key: &DocumentKey,
    ) -> impl Future<Output = Result<Option<StoredDocument>, StoreError>> + Send;

    /// Insert or replace a document by key, unconditionally.
    fn upsert(
        &self,
        session: Option<&mut Self::Session>,
        collection: &str,
        document: StoredDocument,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Replace the document only if its stored version equals
    /// `expected_version`. Returns the number of documents matched (0 or 1).
    fn replace_if_version(
        &self,
        session: Option<&mut Self::Session>,
        collection: &str,
        document: StoredDocument,
        expected_version: u64,
    ) -> impl Future<Output = Result<u64, StoreError>> + Send;

    /// Delete a document by key. Returns whether a document was removed.
    fn delete(
        &self,
        session: Option<&mut Self::Session>,
        collection: &str,
        key: &DocumentKey,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Producer write for checkout sources: upsert the document and mark it
    /// as not yet taken.
    fn insert_unsynced(
        &self,
        session: Option<&mut Self::Session>,
        collection: &str,
        document: StoredDocument,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Atomically find every not-yet-taken document in the collection, mark
    /// exactly that set as taken, and return it.
    fn checkout_unsynced(
        &self,
        collection: &str,
    ) -> impl Future<Output = Result<Vec<StoredDocument>, StoreError>> + Send;

    /// Mark the given documents as not yet taken again. Returns how many
    /// documents were flipped back.
    fn release(
        &self,
        collection: &str,
        keys: &[DocumentKey],
    ) -> impl Future<Output = Result<u64, StoreError>> + Send;
}
