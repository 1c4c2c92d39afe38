//! Per-consumer checkpoint types.

use crate::event::EventId;
use crate::validation::no_control_characters;
use nutype::nutype;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stable name identifying a consumer and keying its checkpoint.
///
/// Uses nutype for validation ensuring all consumer names are:
/// - Non-empty (trimmed strings with at least 1 character)
/// - Within reasonable length (max 255 characters)
/// - Free of control characters
///
/// Renaming a consumer makes it start over from the beginning of the log.
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
pub struct ConsumerName(String);

/// Logical season counter stored alongside a checkpoint.
///
/// The runner carries the season through unchanged. Nothing in the engine
/// rolls it over; consumers and operators that care about seasons write it
/// explicitly through `CheckpointStore::save_last_version`.
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
pub struct Season(i32);

impl Season {
    /// The season of a checkpoint that has never been saved.
    pub fn initial() -> Self {
        Self::new(0)
    }
}

/// Opaque consumer-private resumption metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncState(Value);

impl SyncState {
    /// Wraps an arbitrary JSON value.
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// Returns the wrapped value.
    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// Unwraps into the JSON value.
    pub fn into_value(self) -> Value {
        self.0
    }
}

/// Durable marker of a consumer's last successfully applied event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Consumer this checkpoint belongs to.
    pub consumer: ConsumerName,
    /// Id of the last event applied, or `EventId::zero()`.
    pub version: EventId,
    /// Logical season counter.
    pub season: Season,
    /// Whether the consumer has been stopped by an operator.
    pub is_stopped: bool,
    /// Consumer-private resumption metadata.
    pub sync_state: Option<SyncState>,
}

impl Checkpoint {
    /// The zero-value checkpoint returned for a consumer with no saved state.
    ///
    /// A consumer starting from this checkpoint reads the log from the
    /// beginning.
    pub fn initial(consumer: ConsumerName) -> Self {
        Self {
            consumer,
            version: EventId::zero(),
            season: Season::initial(),
            is_stopped: false,
            sync_state: None,
        }
    }

    /// Returns true if nothing has been applied yet.
    pub fn is_initial(&self) -> bool {
        self.version.is_zero()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_checkpoint_starts_from_the_beginning() {
        let consumer = ConsumerName::try_new("stats").expect("valid consumer name");

        let checkpoint = Checkpoint::initial(consumer.clone());

        assert_eq!(checkpoint.consumer, consumer);
        assert_eq!(checkpoint.version.to_string(), "0");
        assert_eq!(checkpoint.season, Season::new(0));
        assert!(!checkpoint.is_stopped);
        assert!(checkpoint.sync_state.is_none());
        assert!(checkpoint.is_initial());
    }

    #[test]
    fn consumer_name_is_trimmed() {
        let consumer = ConsumerName::try_new("  hero-stats  ").expect("valid consumer name");

        assert_eq!(consumer.as_ref(), "hero-stats");
    }

    #[test]
    fn consumer_name_rejects_empty_and_control_characters() {
        assert!(ConsumerName::try_new("   ").is_err());
        assert!(ConsumerName::try_new("hero\nstats").is_err());
        assert!(ConsumerName::try_new("x".repeat(256)).is_err());
    }

    #[test]
    fn sync_state_serializes_transparently() {
        let state = SyncState::new(serde_json::json!({"offset": 12}));

        let value = serde_json::to_value(&state).expect("serializable");

        assert_eq!(value, serde_json::json!({"offset": 12}));
    }
}
