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

//! Shared vocabulary types and traits for the readmodel projection engine.
//!
//! This crate holds the types that the engine crate (`readmodel`) and the
//! storage backends (`readmodel-memory`, `readmodel-postgres`) both need to
//! agree on. Keeping them here lets backends implement the store traits
//! without depending on the engine itself.
//!
//! # Overview
//!
//! - Event log: `EventId`, `StoredEvent`, `LoggedEvent`, `BatchSize`, `EventLog`
//! - Checkpoints: `ConsumerName`, `Season`, `SyncState`, `Checkpoint`, `CheckpointStore`
//! - Documents: `DocumentKey`, `Document`, `Versioned`, `StoredDocument`,
//!   `DocumentStore`, `DocumentSession`
//! - Errors: `StoreError`, `Operation`

mod checkpoint;
mod document;
mod event;
mod store;
mod validation;

pub use checkpoint::{Checkpoint, ConsumerName, ConsumerNameError, Season, SyncState};
pub use document::{
    Document, DocumentKey, DocumentKeyError, DocumentSession, DocumentStore, StoredDocument,
    Versioned,
};
pub use event::{BatchSize, EventId, EventLog, LoggedEvent, StoredEvent};
pub use store::{CheckpointStore, Operation, StoreError};
