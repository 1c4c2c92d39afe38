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

//! Testing utilities for the readmodel projection engine.
//!
//! - [`contract`]: behavioural suites any backend can run through the
//!   `event_log_contract_tests!`, `checkpoint_store_contract_tests!` and
//!   `document_store_contract_tests!` macros
//! - [`EventCollector`]: consumer that records deliveries
//! - [`FailOnEvent`] and [`FlakyEventLog`]: deterministic faults for
//!   exercising redelivery and retry paths
//! - [`chaos`]: randomized read and checkpoint failures

pub mod chaos;
pub mod contract;
mod event_collector;
mod faults;

pub use chaos::{ChaosConfig, ChaosStore, ChaosStoreExt, Probability};
pub use event_collector::{Deliveries, EventCollector};
pub use faults::{FailOnEvent, FaultSwitch, FlakyEventLog};
