#![forbid(invalid_value, overflowing_literals, unconditional_recursion, unsafe_code)]
#![deny(
    bad_style,
    deprecated,
    meta_variable_misuse,
    non_ascii_idents,
    rust_2018_idioms,
    trivial_casts,
    trivial_numeric_casts,
    unreachable_code,
    unused_assignments,
    unused_extern_crates,
    unused_imports,
    unused_must_use,
    unused_mut,
    unused_parens,
    unused_variables
)]

//! Checkpointed event-projection engine.
//!
//! `readmodel` keeps many independently evolving read models up to date from
//! an append-only event log. Each consumer owns a checkpoint; a runner polls
//! the log from that checkpoint, applies pages in order and advances the
//! checkpoint only after the whole page has been applied. Delivery is
//! therefore at-least-once and strictly ordered per consumer.
//!
//! Alongside the runner the crate provides:
//!
//! - [`TransactionCoordinator`]: one multi-document transaction at a time,
//!   with success handlers that only run after commit
//! - [`Repository`]: typed document access that follows the ambient
//!   transaction
//! - [`try_update_with_version`] / [`update_with_version`]: optimistic
//!   concurrency on versioned documents
//! - [`FlagCheckout`]: flag-flip hand-off for sources without a monotonic
//!   cursor
//!
//! # Example
//!
//! ```rust,ignore
//! use readmodel::{ConsumerRegistry, ProjectionHost, RunnerConfig};
//!
//! let registry = ConsumerRegistry::new()
//!     .register(HeroStatsConsumer::new(repository.clone()))?
//!     .register(MmrTimelineConsumer::new(repository))?;
//!
//! let mut host = ProjectionHost::new(RunnerConfig::default());
//! host.spawn(registry, store.clone(), store.clone())?;
//! // ...
//! let report = host.shutdown().await;
//! ```

mod checkout;
mod concurrency;
mod config;
mod consumer;
mod errors;
mod host;
mod registry;
mod repository;
mod runner;
mod transaction;

pub use checkout::{CheckedOut, FlagCheckout};
pub use concurrency::{try_update_with_version, update_with_version};
pub use config::RunnerConfig;
pub use consumer::{Consumer, ConsumerExt, Traced};
pub use errors::{
    ConcurrencyError, ConsumerError, HandlerError, RegistryError, RunnerError, TransactionError,
};
pub use host::{ProjectionHost, RunnerExit, ShutdownReport};
pub use registry::ConsumerRegistry;
pub use repository::Repository;
pub use runner::{
    FailureRecord, IterationOutcome, PollMode, ProjectionRunner, RunnerState, RunnerStats,
};
pub use transaction::{SharedSession, TransactionCoordinator, TransactionId, TransactionScope};

pub use readmodel_types::{
    BatchSize, Checkpoint, CheckpointStore, ConsumerName, ConsumerNameError, Document,
    DocumentKey, DocumentKeyError, DocumentSession, DocumentStore, EventId, EventLog, LoggedEvent,
    Operation, Season, StoreError, StoredDocument, StoredEvent, SyncState, Versioned,
};

/// Re-exported so `Consumer` implementations don't need a direct dependency.
pub use async_trait::async_trait;
