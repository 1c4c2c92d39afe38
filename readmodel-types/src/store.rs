use crate::checkpoint::{Checkpoint, ConsumerName, Season, SyncState};
use crate::event::EventId;
use std::future::Future;

/// Identifies the store operation that failed.
///
/// Used by `StoreError::StoreFailure` to provide strongly-typed
/// identification of which operation encountered an infrastructure failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Reading a page of events.
    LoadEvents,
    /// Appending events to the log.
    AppendEvents,
    /// Reading a consumer checkpoint.
    LoadCheckpoint,
    /// Writing a consumer checkpoint.
    SaveCheckpoint,
    /// Writing consumer sync-state.
    SaveSyncState,
    /// Listing every stored checkpoint.
    ListCheckpoints,
    /// Opening a store session.
    StartSession,
    /// Beginning a database transaction.
    BeginTransaction,
    /// Committing a database transaction.
    CommitTransaction,
    /// Aborting a database transaction.
    AbortTransaction,
    /// Reading a document.
    ReadDocument,
    /// Inserting or replacing a document.
    WriteDocument,
    /// Deleting a document.
    DeleteDocument,
    /// Flipping the checkout flag on a batch of documents.
    Checkout,
    /// Flipping the checkout flag back.
    Release,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::LoadEvents => write!(f, "load_events"),
            Operation::AppendEvents => write!(f, "append_events"),
            Operation::LoadCheckpoint => write!(f, "load_checkpoint"),
            Operation::SaveCheckpoint => write!(f, "save_checkpoint"),
            Operation::SaveSyncState => write!(f, "save_sync_state"),
            Operation::ListCheckpoints => write!(f, "list_checkpoints"),
            Operation::StartSession => write!(f, "start_session"),
            Operation::BeginTransaction => write!(f, "begin_transaction"),
            Operation::CommitTransaction => write!(f, "commit_transaction"),
            Operation::AbortTransaction => write!(f, "abort_transaction"),
            Operation::ReadDocument => write!(f, "read_document"),
            Operation::WriteDocument => write!(f, "write_document"),
            Operation::DeleteDocument => write!(f, "delete_document"),
            Operation::Checkout => write!(f, "checkout"),
            Operation::Release => write!(f, "release"),
        }
    }
}

/// Error type returned by every store trait in this crate.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Represents infrastructure failures surfaced by the backing store
    /// (e.g., connection drops). Transient: retry on the next tick.
    #[error("{operation} operation failed")]
    StoreFailure { operation: Operation },

    /// Returned when a payload or document cannot be serialized.
    #[error("failed to serialize {key}: {detail}")]
    Serialization { key: String, detail: String },

    /// Returned when a stored payload or document cannot be deserialized into
    /// the requested type.
    #[error("failed to deserialize {key}: {detail}")]
    Deserialization { key: String, detail: String },

    /// Returned when a checkpoint save would move a consumer backwards.
    #[error("checkpoint for {consumer} cannot move from {current} back to {attempted}")]
    CheckpointRegression {
        consumer: ConsumerName,
        current: EventId,
        attempted: EventId,
    },

    /// Version conflict during optimistic concurrency control, detected when a
    /// transaction commits a conditional replace that another writer beat.
    #[error("version conflict on {collection}/{key}")]
    VersionConflict { collection: String, key: String },

    /// Session used in a way its current transaction state does not allow.
    #[error("invalid session state: {detail}")]
    SessionState { detail: String },
}

/// Persists per-consumer checkpoints.
///
/// Checkpoints are owned by their consumer's runner; no other code path may
/// advance a given consumer's checkpoint.
pub trait CheckpointStore: Send + Sync {
    /// Load the checkpoint for a consumer.
    ///
    /// Returns `Checkpoint::initial` if none has been saved yet.
    fn get_last_version(
        &self,
        consumer: &ConsumerName,
    ) -> impl Future<Output = Result<Checkpoint, StoreError>> + Send;

    /// Upsert version, season and stopped flag for a consumer.
    ///
    /// Must only be called after the batch ending at `version` has been
    /// durably applied. Saving a version lower than the stored one fails
    /// with `StoreError::CheckpointRegression`. Sync-state is left untouched.
    fn save_last_version(
        &self,
        consumer: &ConsumerName,
        version: EventId,
        season: Season,
        is_stopped: bool,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Store consumer-private resumption metadata alongside the checkpoint.
    ///
    /// Version, season and stopped flag are left untouched.
    fn save_sync_state(
        &self,
        consumer: &ConsumerName,
        state: SyncState,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// List every stored checkpoint, ordered by consumer name.
    fn list_checkpoints(&self) -> impl Future<Output = Result<Vec<Checkpoint>, StoreError>> + Send;
}

/// Blanket implementation allowing CheckpointStore to work with references.
impl<T: CheckpointStore> CheckpointStore for &T {
    async fn get_last_version(&self, consumer: &ConsumerName) -> Result<Checkpoint, StoreError> {
        (*self).get_last_version(consumer).await
    }

    async fn save_last_version(
        &self,
        consumer: &ConsumerName,
        version: EventId,
        season: Season,
        is_stopped: bool,
    ) -> Result<(), StoreError> {
        (*self)
            .save_last_version(consumer, version, season, is_stopped)
            .await
    }

    async fn save_sync_state(
        &self,
        consumer: &ConsumerName,
        state: SyncState,
    ) -> Result<(), StoreError> {
        (*self).save_sync_state(consumer, state).await
    }

    async fn list_checkpoints(&self) -> Result<Vec<Checkpoint>, StoreError> {
        (*self).list_checkpoints().await
    }
}

impl<T: CheckpointStore> CheckpointStore for std::sync::Arc<T> {
    async fn get_last_version(&self, consumer: &ConsumerName) -> Result<Checkpoint, StoreError> {
        self.as_ref().get_last_version(consumer).await
    }

    async fn save_last_version(
        &self,
        consumer: &ConsumerName,
        version: EventId,
        season: Season,
        is_stopped: bool,
    ) -> Result<(), StoreError> {
        self.as_ref()
            .save_last_version(consumer, version, season, is_stopped)
            .await
    }

    async fn save_sync_state(
        &self,
        consumer: &ConsumerName,
        state: SyncState,
    ) -> Result<(), StoreError> {
        self.as_ref().save_sync_state(consumer, state).await
    }

    async fn list_checkpoints(&self) -> Result<Vec<Checkpoint>, StoreError> {
        self.as_ref().list_checkpoints().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_failure_names_the_operation() {
        let error = StoreError::StoreFailure {
            operation: Operation::LoadEvents,
        };

        assert_eq!(error.to_string(), "load_events operation failed");
    }

    #[test]
    fn checkpoint_regression_message_reports_both_versions() {
        let error = StoreError::CheckpointRegression {
            consumer: ConsumerName::try_new("stats").expect("valid consumer name"),
            current: EventId::new(105),
            attempted: EventId::new(100),
        };

        assert_eq!(
            error.to_string(),
            "checkpoint for stats cannot move from 105 back to 100"
        );
    }
}
