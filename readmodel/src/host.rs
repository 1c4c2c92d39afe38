//! Runs one background runner per registered consumer.

use crate::config::RunnerConfig;
use crate::consumer::Traced;
use crate::errors::{RegistryError, RunnerError};
use crate::registry::ConsumerRegistry;
use crate::runner::{PollMode, ProjectionRunner, RunnerState, RunnerStats};
use readmodel_types::{CheckpointStore, ConsumerName, EventLog, LoggedEvent};
use std::collections::BTreeMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How each runner ended during `ProjectionHost::shutdown`.
#[derive(Debug)]
pub enum RunnerExit {
    /// Finished its in-flight iteration and stopped.
    Stopped(RunnerStats),
    /// The runner returned an error.
    Failed(RunnerError),
    /// The task panicked or was cancelled by the runtime.
    Panicked(String),
    /// Missed the shutdown deadline and was aborted.
    TimedOut,
}

/// Outcome of a host shutdown, per consumer.
#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// How each runner ended, by consumer.
    pub runners: BTreeMap<ConsumerName, RunnerExit>,
}

impl ShutdownReport {
    /// Consumers that had to be aborted.
    pub fn timed_out(&self) -> Vec<&ConsumerName> {
        self.runners
            .iter()
            .filter(|(_, exit)| matches!(exit, RunnerExit::TimedOut))
            .map(|(name, _)| name)
            .collect()
    }

    /// Whether every runner stopped on its own before the deadline.
    pub fn is_clean(&self) -> bool {
        self.runners
            .values()
            .all(|exit| matches!(exit, RunnerExit::Stopped(_)))
    }
}

struct RunnerTask {
    state: watch::Receiver<RunnerState>,
    handle: JoinHandle<Result<RunnerStats, RunnerError>>,
}

/// Owns the background runners of a process.
///
/// Consumer loops share nothing but the stores handed to `spawn`.
pub struct ProjectionHost {
    config: RunnerConfig,
    cancel: CancellationToken,
    tasks: BTreeMap<ConsumerName, RunnerTask>,
}

impl ProjectionHost {
    /// Host with no runners; every runner it spawns uses `config`.
    pub fn new(config: RunnerConfig) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
            tasks: BTreeMap::new(),
        }
    }

    /// Spawn a continuous runner for every consumer in `registry`.
    ///
    /// Each consumer is wrapped in the tracing decorator. Consumer names must
    /// be unique across every registry spawned on this host.
    pub fn spawn<E, L, S>(
        &mut self,
        registry: ConsumerRegistry<E>,
        log: L,
        checkpoints: S,
    ) -> Result<(), RegistryError>
    where
        E: LoggedEvent,
        L: EventLog + Clone + 'static,
        S: CheckpointStore + Clone + 'static,
    {
        if let Some(name) = registry
            .names()
            .into_iter()
            .find(|name| self.tasks.contains_key(name))
        {
            return Err(RegistryError::DuplicateConsumer(name));
        }

        for consumer in registry.into_consumers() {
            let runner = ProjectionRunner::new(Traced::new(consumer), log.clone(), checkpoints.clone())
                .with_config(self.config.clone())
                .with_poll_mode(PollMode::Continuous)
                .with_cancellation(self.cancel.child_token());
            let name = runner.consumer_name().clone();
            let state = runner.state();
            info!(consumer = %name, stream = E::STREAM, "[host.spawn] runner spawned");
            let handle = tokio::spawn(runner.run());
            self.tasks.insert(name, RunnerTask { state, handle });
        }
        Ok(())
    }

    /// Names of the spawned consumers.
    pub fn consumer_names(&self) -> Vec<ConsumerName> {
        self.tasks.keys().cloned().collect()
    }

    /// Current state of every runner.
    pub fn states(&self) -> BTreeMap<ConsumerName, RunnerState> {
        self.tasks
            .iter()
            .map(|(name, task)| (name.clone(), *task.state.borrow()))
            .collect()
    }

    /// State channel of one runner.
    pub fn watch(&self, consumer: &ConsumerName) -> Option<watch::Receiver<RunnerState>> {
        self.tasks.get(consumer).map(|task| task.state.clone())
    }

    /// Signal every runner to stop and wait for in-flight iterations, bounded
    /// by `RunnerConfig::shutdown_timeout`. Runners still busy at the
    /// deadline are aborted.
    pub async fn shutdown(self) -> ShutdownReport {
        self.cancel.cancel();
        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        let mut report = ShutdownReport::default();

        for (name, mut task) in self.tasks {
            let exit = match tokio::time::timeout_at(deadline, &mut task.handle).await {
                Ok(Ok(Ok(stats))) => RunnerExit::Stopped(stats),
                Ok(Ok(Err(error))) => RunnerExit::Failed(error),
                Ok(Err(join_error)) => RunnerExit::Panicked(join_error.to_string()),
                Err(_) => {
                    task.handle.abort();
                    warn!(consumer = %name, "[host.shutdown] runner missed shutdown deadline, aborted");
                    RunnerExit::TimedOut
                }
            };
            report.runners.insert(name, exit);
        }

        info!(
            runners = report.runners.len(),
            clean = report.is_clean(),
            "[host.shutdown] host stopped"
        );
        report
    }
}

impl std::fmt::Debug for ProjectionHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectionHost")
            .field("config", &self.config)
            .field("consumers", &self.tasks.keys().collect::<Vec<_>>())
            .finish()
    }
}
