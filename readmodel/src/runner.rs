//! Polling projection runner.
//!
//! One runner drives one consumer over one event stream:
//!
//! ```text
//! Idle -> Fetching -> Applying -> Advancing -> Fetching ...
//!            |                                     ^
//!            +--(empty page / failure)-> Sleeping -+
//! ```
//!
//! The checkpoint is advanced only after every event of a page has been
//! applied. A failure anywhere in the page leaves it untouched, so the next
//! iteration re-delivers the whole page.

use crate::config::RunnerConfig;
use crate::consumer::Consumer;
use crate::errors::RunnerError;
use readmodel_types::{CheckpointStore, ConsumerName, EventId, EventLog, LoggedEvent};
use std::marker::PhantomData;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// How `ProjectionRunner::run` treats empty pages and failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PollMode {
    /// Poll forever: failures are logged and recorded, and the runner sleeps
    /// `poll_interval` after an empty page or a failure.
    #[default]
    Continuous,
    /// Drain until caught up, then return. The first failure is returned.
    Batch,
}

/// Observable runner state, published over a `watch` channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    /// Created, not yet polled.
    Idle,
    /// Reading the checkpoint and the next page.
    Fetching,
    /// Handing events of the page to the consumer.
    Applying,
    /// Saving the checkpoint after a fully applied page.
    Advancing,
    /// Waiting out `poll_interval`.
    Sleeping,
    /// `run` has returned.
    Stopped,
}

/// Most recent failed iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureRecord {
    /// Event being applied when the failure happened, if any.
    pub event_id: Option<EventId>,
    /// Rendered error.
    pub message: String,
}

/// Counters kept by a runner across iterations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunnerStats {
    /// Iterations started, failed ones included.
    pub iterations: u64,
    /// Events of pages whose checkpoint was saved.
    pub events_applied: u64,
    /// Iterations that returned an error.
    pub failures: u64,
    /// Most recent failure, if any.
    pub last_failure: Option<FailureRecord>,
}

/// Result of one successful iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationOutcome {
    /// A page was applied and the checkpoint moved from `from` to `to`.
    Advanced {
        from: EventId,
        to: EventId,
        applied: usize,
    },
    /// No events after the checkpoint.
    CaughtUp,
    /// The checkpoint is flagged as stopped; nothing was applied.
    ConsumerStopped,
}

/// Drives a single consumer from its checkpoint to the head of the log.
pub struct ProjectionRunner<E, C, L, S> {
    consumer: C,
    name: ConsumerName,
    log: L,
    checkpoints: S,
    config: RunnerConfig,
    poll_mode: PollMode,
    cancel: CancellationToken,
    state: watch::Sender<RunnerState>,
    stats: RunnerStats,
    _event: PhantomData<fn() -> E>,
}

impl<E, C, L, S> ProjectionRunner<E, C, L, S>
where
    E: LoggedEvent,
    C: Consumer<E>,
    L: EventLog,
    S: CheckpointStore,
{
    /// Runner with default config in `Continuous` mode.
    pub fn new(consumer: C, log: L, checkpoints: S) -> Self {
        let name = consumer.name().clone();
        let (state, _) = watch::channel(RunnerState::Idle);
        Self {
            consumer,
            name,
            log,
            checkpoints,
            config: RunnerConfig::default(),
            poll_mode: PollMode::default(),
            cancel: CancellationToken::new(),
            state,
            stats: RunnerStats::default(),
            _event: PhantomData,
        }
    }

    /// Replace the page size, poll interval and shutdown timeout.
    pub fn with_config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    /// See [`PollMode`].
    pub fn with_poll_mode(mut self, poll_mode: PollMode) -> Self {
        self.poll_mode = poll_mode;
        self
    }

    /// Stop when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Token that stops this runner when cancelled.
    pub fn stop_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Subscribe to state transitions.
    pub fn state(&self) -> watch::Receiver<RunnerState> {
        self.state.subscribe()
    }

    /// Counters since this runner was created.
    pub fn stats(&self) -> &RunnerStats {
        &self.stats
    }

    /// Name keying the checkpoint.
    pub fn consumer_name(&self) -> &ConsumerName {
        &self.name
    }

    /// The driven consumer.
    pub fn consumer(&self) -> &C {
        &self.consumer
    }

    /// Give the consumer back, e.g. to rerun it on a fresh runner.
    pub fn into_consumer(self) -> C {
        self.consumer
    }

    /// How many events on the consumer's stream lie past its checkpoint.
    pub async fn lag(&self) -> Result<u64, RunnerError> {
        let checkpoint = self
            .checkpoints
            .get_last_version(&self.name)
            .await
            .map_err(RunnerError::Checkpoint)?;
        self.log
            .count_since::<E>(checkpoint.version)
            .await
            .map_err(RunnerError::Fetch)
    }

    /// Run a single iteration: read the checkpoint, fetch one page, apply it
    /// in order and advance the checkpoint to the last applied id.
    #[instrument(name = "runner.iteration", skip(self), fields(consumer = %self.name))]
    pub async fn run_once(&mut self) -> Result<IterationOutcome, RunnerError> {
        self.stats.iterations += 1;
        self.set_state(RunnerState::Fetching);

        let checkpoint = self
            .checkpoints
            .get_last_version(&self.name)
            .await
            .map_err(RunnerError::Checkpoint)?;
        if checkpoint.is_stopped {
            debug!(version = %checkpoint.version, "[runner.fetch] consumer is stopped");
            return Ok(IterationOutcome::ConsumerStopped);
        }

        let page = self
            .log
            .load_since::<E>(checkpoint.version, self.config.page_size)
            .await
            .map_err(RunnerError::Fetch)?;
        let Some(last) = page.last().map(|event| event.id) else {
            debug!(version = %checkpoint.version, "[runner.fetch] caught up");
            return Ok(IterationOutcome::CaughtUp);
        };
        debug!(
            after = %checkpoint.version,
            events = page.len(),
            "[runner.fetch] page loaded"
        );

        self.set_state(RunnerState::Applying);
        for event in &page {
            self.consumer
                .update(event)
                .await
                .map_err(|source| RunnerError::Consumer {
                    consumer: self.name.clone(),
                    event_id: event.id,
                    source,
                })?;
        }

        self.set_state(RunnerState::Advancing);
        self.checkpoints
            .save_last_version(&self.name, last, checkpoint.season, checkpoint.is_stopped)
            .await
            .map_err(RunnerError::Advance)?;
        self.stats.events_applied += page.len() as u64;
        info!(
            from = %checkpoint.version,
            to = %last,
            applied = page.len(),
            "[runner.advance] checkpoint advanced"
        );

        Ok(IterationOutcome::Advanced {
            from: checkpoint.version,
            to: last,
            applied: page.len(),
        })
    }

    /// Run until cancelled (`Continuous`) or caught up (`Batch`).
    ///
    /// Cancellation is observed before every iteration and during the sleep.
    /// An iteration already in flight finishes first, so a page is never left
    /// half-advanced.
    pub async fn run(mut self) -> Result<RunnerStats, RunnerError> {
        info!(consumer = %self.name, mode = ?self.poll_mode, "[runner.start] runner started");

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let outcome = self.run_once().await;
            let sleep = match outcome {
                Ok(IterationOutcome::Advanced { .. }) => false,
                Ok(_) if self.poll_mode == PollMode::Batch => break,
                Ok(_) => true,
                Err(error) => {
                    self.record_failure(&error);
                    if self.poll_mode == PollMode::Batch {
                        self.set_state(RunnerState::Stopped);
                        return Err(error);
                    }
                    true
                }
            };

            if sleep {
                self.set_state(RunnerState::Sleeping);
                tokio::select! {
                    () = self.cancel.cancelled() => break,
                    () = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        }

        self.set_state(RunnerState::Stopped);
        info!(
            consumer = %self.name,
            iterations = self.stats.iterations,
            events_applied = self.stats.events_applied,
            failures = self.stats.failures,
            "[runner.stop] runner stopped"
        );
        Ok(self.stats)
    }

    fn record_failure(&mut self, error: &RunnerError) {
        self.stats.failures += 1;
        self.stats.last_failure = Some(FailureRecord {
            event_id: error.event_id(),
            message: error.to_string(),
        });
        match error {
            RunnerError::Consumer { event_id, .. } => error!(
                consumer = %self.name,
                event_id = %event_id,
                error = %error,
                "[runner.supervisor] consumer failed, checkpoint not advanced"
            ),
            _ => warn!(
                consumer = %self.name,
                error = %error,
                "[runner.supervisor] iteration failed, retrying next tick"
            ),
        }
    }

    fn set_state(&self, state: RunnerState) {
        self.state.send_replace(state);
    }
}

impl<E, C, L, S> std::fmt::Debug for ProjectionRunner<E, C, L, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectionRunner")
            .field("consumer", &self.name)
            .field("config", &self.config)
            .field("poll_mode", &self.poll_mode)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}
