use std::future::Future;

use nutype::nutype;
use parking_lot::Mutex;
use rand::{random, rngs::StdRng, Rng, SeedableRng};
use readmodel_types::{
    BatchSize, Checkpoint, CheckpointStore, ConsumerName, EventId, EventLog, LoggedEvent,
    Operation, Season, StoreError, StoredEvent, SyncState,
};

/// Probability value for chaos injection rates.
///
/// Probability represents a value in the range [0.0, 1.0] where 0.0 means
/// never inject failures and 1.0 means always inject failures.
///
/// # Examples
///
/// ```ignore
/// use readmodel_testing::chaos::Probability;
///
/// let sometimes = Probability::try_new(0.5).unwrap();
///
/// // Values outside [0.0, 1.0] are rejected
/// assert!(Probability::try_new(1.5).is_err());
/// ```
#[nutype(
    validate(greater_or_equal = 0.0, less_or_equal = 1.0),
    derive(Debug, Clone, Copy, PartialEq, PartialOrd, Display, Into)
)]
pub struct Probability(f32);

impl Probability {
    fn clamped(value: f32) -> Self {
        match Self::try_new(value.clamp(0.0, 1.0)) {
            Ok(probability) => probability,
            Err(_) => Self::never(),
        }
    }

    fn never() -> Self {
        match Self::try_new(0.0) {
            Ok(probability) => probability,
            Err(_) => unreachable!("0.0 lies within [0.0, 1.0]"),
        }
    }
}

/// Failure rates and seed for a [`ChaosStore`].
#[derive(Debug, Clone)]
pub struct ChaosConfig {
    deterministic_seed: Option<u64>,
    read_failure_probability: Probability,
    checkpoint_failure_probability: Probability,
}

impl ChaosConfig {
    /// Seeded with `0`, so failures repeat run to run.
    pub fn deterministic() -> Self {
        Self {
            deterministic_seed: Some(0),
            ..Self::default()
        }
    }

    /// Chance that an event-log read fails.
    pub fn with_read_failure_probability(mut self, probability: f32) -> Self {
        self.read_failure_probability = Probability::clamped(probability);
        self
    }

    /// Chance that a checkpoint save fails.
    pub fn with_checkpoint_failure_probability(mut self, probability: f32) -> Self {
        self.checkpoint_failure_probability = Probability::clamped(probability);
        self
    }
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            deterministic_seed: None,
            read_failure_probability: Probability::never(),
            checkpoint_failure_probability: Probability::never(),
        }
    }
}

/// Wrap any backend in a [`ChaosStore`].
pub trait ChaosStoreExt: Sized {
    fn with_chaos(self, config: ChaosConfig) -> ChaosStore<Self>;
}

/// Wraps a backend and randomly fails event reads and checkpoint saves.
///
/// Useful for soak-testing runners: whatever the failure pattern, a consumer
/// must end up having seen every event at least once and in order.
pub struct ChaosStore<S> {
    store: S,
    config: ChaosConfig,
    rng: Mutex<StdRng>,
}

impl<S> ChaosStore<S> {
    pub fn new(store: S, config: ChaosConfig) -> Self {
        let rng = match config.deterministic_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::seed_from_u64(random()),
        };

        Self {
            store,
            config,
            rng: Mutex::new(rng),
        }
    }

    /// The wrapped backend, bypassing injected failures.
    pub fn inner(&self) -> &S {
        &self.store
    }

    fn should_inject(&self, probability: Probability) -> bool {
        let prob_f32: f32 = probability.into();

        if prob_f32 <= 0.0 {
            return false;
        }

        if prob_f32 >= 1.0 {
            return true;
        }

        self.rng.lock().random_bool(f64::from(prob_f32))
    }
}

impl<S> EventLog for ChaosStore<S>
where
    S: EventLog,
{
    fn load_since<E: LoggedEvent>(
        &self,
        after: EventId,
        limit: BatchSize,
    ) -> impl Future<Output = Result<Vec<StoredEvent<E>>, StoreError>> + Send {
        let should_fail = self.should_inject(self.config.read_failure_probability);
        let store = &self.store;

        async move {
            if should_fail {
                return Err(StoreError::StoreFailure {
                    operation: Operation::LoadEvents,
                });
            }

            store.load_since::<E>(after, limit).await
        }
    }

    fn append<E: LoggedEvent>(
        &self,
        payloads: Vec<E>,
    ) -> impl Future<Output = Result<Vec<EventId>, StoreError>> + Send {
        self.store.append(payloads)
    }

    fn last_event_id<E: LoggedEvent>(
        &self,
    ) -> impl Future<Output = Result<Option<EventId>, StoreError>> + Send {
        self.store.last_event_id::<E>()
    }

    fn count_since<E: LoggedEvent>(
        &self,
        after: EventId,
    ) -> impl Future<Output = Result<u64, StoreError>> + Send {
        self.store.count_since::<E>(after)
    }
}

impl<S> CheckpointStore for ChaosStore<S>
where
    S: CheckpointStore,
{
    fn get_last_version(
        &self,
        consumer: &ConsumerName,
    ) -> impl Future<Output = Result<Checkpoint, StoreError>> + Send {
        self.store.get_last_version(consumer)
    }

    fn save_last_version(
        &self,
        consumer: &ConsumerName,
        version: EventId,
        season: Season,
        is_stopped: bool,
    ) -> impl Future<Output = Result<(), StoreError>> + Send {
        let should_fail = self.should_inject(self.config.checkpoint_failure_probability);
        let store = &self.store;
        let consumer = consumer.clone();

        async move {
            if should_fail {
                return Err(StoreError::StoreFailure {
                    operation: Operation::SaveCheckpoint,
                });
            }

            store
                .save_last_version(&consumer, version, season, is_stopped)
                .await
        }
    }

    fn save_sync_state(
        &self,
        consumer: &ConsumerName,
        state: SyncState,
    ) -> impl Future<Output = Result<(), StoreError>> + Send {
        self.store.save_sync_state(consumer, state)
    }

    fn list_checkpoints(&self) -> impl Future<Output = Result<Vec<Checkpoint>, StoreError>> + Send {
        self.store.list_checkpoints()
    }
}

impl<S> ChaosStoreExt for S
where
    S: EventLog + CheckpointStore,
{
    fn with_chaos(self, config: ChaosConfig) -> ChaosStore<Self> {
        ChaosStore::new(self, config)
    }
}
