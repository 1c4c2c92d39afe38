//! Error types for the projection engine.
//!
//! Store-level failures are `readmodel_types::StoreError`; the enums here add
//! the context each engine component knows about (which consumer, which
//! event, which transaction).

use crate::transaction::TransactionId;
use readmodel_types::{ConsumerName, EventId, StoreError};
use thiserror::Error;

/// Boxed error returned by post-commit handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Error raised by a consumer while applying an event.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ConsumerError {
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl ConsumerError {
    /// Error with a message and no source.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Wrap an underlying error, keeping it as the `source`.
    pub fn with_source(
        message: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Message without the source chain.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<StoreError> for ConsumerError {
    fn from(error: StoreError) -> Self {
        Self::with_source("store operation failed", error)
    }
}

impl From<TransactionError> for ConsumerError {
    fn from(error: TransactionError) -> Self {
        Self::with_source("transaction failed", error)
    }
}

impl From<ConcurrencyError> for ConsumerError {
    fn from(error: ConcurrencyError) -> Self {
        Self::with_source("optimistic update failed", error)
    }
}

/// Failure of a single runner iteration.
///
/// None of these advance the checkpoint; the next iteration re-fetches from
/// the same version.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// Reading the checkpoint failed.
    #[error("failed to load checkpoint: {0}")]
    Checkpoint(#[source] StoreError),

    /// Reading the next page failed.
    #[error("failed to fetch events: {0}")]
    Fetch(#[source] StoreError),

    /// The consumer rejected an event; the rest of the page was not applied.
    #[error("consumer {consumer} failed on event {event_id}: {source}")]
    Consumer {
        consumer: ConsumerName,
        event_id: EventId,
        #[source]
        source: ConsumerError,
    },

    /// The page was applied but its checkpoint could not be saved, so the
    /// page will be delivered again.
    #[error("failed to advance checkpoint: {0}")]
    Advance(#[source] StoreError),
}

impl RunnerError {
    /// Id of the event whose application failed, if the failure happened
    /// while applying.
    pub fn event_id(&self) -> Option<EventId> {
        match self {
            RunnerError::Consumer { event_id, .. } => Some(*event_id),
            _ => None,
        }
    }
}

/// Transaction lifecycle failures.
#[derive(Debug, Error)]
pub enum TransactionError {
    /// A transaction is already active on this coordinator.
    #[error("transaction {0} is already active")]
    AlreadyActive(TransactionId),

    /// Commit, abort or completion with no transaction open.
    #[error("no transaction is active")]
    NoActiveTransaction,

    /// The id does not name the coordinator's current transaction.
    #[error("transaction {0} is not the current transaction")]
    UnknownTransaction(TransactionId),

    /// Commit or abort called before `begin_transaction`.
    #[error("transaction {0} has not been started")]
    NotStarted(TransactionId),

    /// Store failure inside the transaction; nothing was committed.
    #[error("transaction store operation failed: {0}")]
    Store(#[from] StoreError),

    /// A success handler failed after the transaction had committed. The
    /// committed writes stand; handlers after `index` did not run.
    #[error("post-commit handler {index} of transaction {transaction} failed: {source}")]
    PostCommitHandler {
        transaction: TransactionId,
        index: usize,
        #[source]
        source: HandlerError,
    },

    /// A handler registered outside a transaction ran immediately and failed.
    #[error("success handler failed: {0}")]
    Handler(#[source] HandlerError),
}

/// Optimistic concurrency failures raised by `update_with_version`.
#[derive(Debug, Error)]
pub enum ConcurrencyError {
    /// Another writer replaced the document first.
    #[error("version conflict on {collection}/{key}: expected version {expected}")]
    Conflict {
        collection: String,
        key: String,
        expected: u64,
    },

    /// Reading or writing the document failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Rejected consumer registration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// Two consumers share a name and would share a checkpoint.
    #[error("consumer {0} is already registered")]
    DuplicateConsumer(ConsumerName),
}
