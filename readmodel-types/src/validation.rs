//! Shared validation predicates for domain types.
//!
//! This module contains validation functions used by nutype-based domain types
//! across the readmodel crates.

/// Validation predicate: reject control characters.
///
/// Consumer names and document keys end up as primary keys in every backend
/// and as structured fields in log lines, so newlines and other control
/// characters are refused at construction.
pub(crate) fn no_control_characters(s: &str) -> bool {
    !s.chars().any(char::is_control)
}
