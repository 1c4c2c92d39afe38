//! Runner scenarios: paging from a checkpoint, redelivery after a failed
//! page, and continuous polling under a host.

use readmodel::{
    BatchSize, CheckpointStore, ConsumerName, ConsumerRegistry, EventId, EventLog,
    IterationOutcome, LoggedEvent, PollMode, ProjectionHost, ProjectionRunner, RunnerConfig,
    RunnerError, RunnerExit, Season,
};
use readmodel_memory::InMemoryStore;
use readmodel_testing::{EventCollector, FailOnEvent, FlakyEventLog};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct MatchFinished {
    match_id: u32,
}

impl LoggedEvent for MatchFinished {
    const STREAM: &'static str = "match_finished";
}

fn consumer(name: &str) -> ConsumerName {
    ConsumerName::try_new(name).expect("valid consumer name")
}

fn ids(range: std::ops::RangeInclusive<u64>) -> Vec<EventId> {
    range.map(EventId::new).collect()
}

/// Log holding ids 1..=105 with the "stats" consumer checkpointed at 100.
async fn store_with_stats_at_100() -> InMemoryStore {
    let store = InMemoryStore::new();
    store
        .append((1..=105).map(|match_id| MatchFinished { match_id }).collect())
        .await
        .expect("append");
    store
        .save_last_version(&consumer("stats"), EventId::new(100), Season::initial(), false)
        .await
        .expect("seed checkpoint");
    store
}

async fn version_of(store: &InMemoryStore, name: &str) -> EventId {
    store
        .get_last_version(&consumer(name))
        .await
        .expect("checkpoint")
        .version
}

#[tokio::test]
async fn runner_applies_backlog_and_advances_to_last_event() {
    // Given consumer "stats" at 100 and events 101-105 in the log
    let store = store_with_stats_at_100().await;
    let collector = EventCollector::<MatchFinished>::new("stats");
    let deliveries = collector.handle();
    let mut runner = ProjectionRunner::new(collector, &store, &store);

    // When the runner iterates
    let outcome = runner.run_once().await.expect("iteration succeeds");

    // Then all five events are applied in order and the checkpoint is 105
    assert_eq!(
        outcome,
        IterationOutcome::Advanced {
            from: EventId::new(100),
            to: EventId::new(105),
            applied: 5,
        }
    );
    assert_eq!(deliveries.ids(), ids(101..=105));
    assert_eq!(version_of(&store, "stats").await, EventId::new(105));

    // And the next tick finds nothing
    assert_eq!(
        runner.run_once().await.expect("iteration succeeds"),
        IterationOutcome::CaughtUp
    );
}

#[tokio::test]
async fn failed_event_leaves_checkpoint_and_page_is_redelivered_in_full() {
    // Given applying event 103 throws
    let store = store_with_stats_at_100().await;
    let collector = EventCollector::<MatchFinished>::new("stats");
    let deliveries = collector.handle();
    let consumer = FailOnEvent::new(collector, [EventId::new(103)]);
    let fault = consumer.switch();
    let mut runner = ProjectionRunner::new(consumer, &store, &store);

    // When the runner iterates
    let error = runner.run_once().await.expect_err("event 103 fails");

    // Then the failure names the event and the checkpoint stays at 100
    assert!(matches!(
        error,
        RunnerError::Consumer { event_id, .. } if event_id == EventId::new(103)
    ));
    assert_eq!(version_of(&store, "stats").await, EventId::new(100));
    assert_eq!(deliveries.ids(), ids(101..=102));

    // And once the fault clears the next tick re-fetches 101-105 in full
    fault.clear();
    runner.run_once().await.expect("iteration succeeds");

    let mut expected = ids(101..=102);
    expected.extend(ids(101..=105));
    assert_eq!(deliveries.ids(), expected);
    assert_eq!(version_of(&store, "stats").await, EventId::new(105));
}

#[tokio::test]
async fn batch_mode_drains_every_page_then_returns() {
    let store = InMemoryStore::new();
    store
        .append((1..=25).map(|match_id| MatchFinished { match_id }).collect())
        .await
        .expect("append");
    let collector = EventCollector::<MatchFinished>::new("drain");
    let deliveries = collector.handle();

    let stats = ProjectionRunner::new(collector, &store, &store)
        .with_config(RunnerConfig::default().with_page_size(BatchSize::new(10)))
        .with_poll_mode(PollMode::Batch)
        .run()
        .await
        .expect("drains");

    assert_eq!(stats.events_applied, 25);
    assert_eq!(stats.iterations, 4);
    assert_eq!(deliveries.ids(), ids(1..=25));
}

#[tokio::test]
async fn batch_mode_returns_first_transient_failure() {
    let store = InMemoryStore::new();
    store
        .append(vec![MatchFinished { match_id: 1 }])
        .await
        .expect("append");
    let flaky = FlakyEventLog::new(store.clone(), 1);

    let result = ProjectionRunner::new(EventCollector::<MatchFinished>::new("batch"), &flaky, &store)
        .with_poll_mode(PollMode::Batch)
        .run()
        .await;

    assert!(matches!(result, Err(RunnerError::Fetch(_))));
    assert_eq!(version_of(&store, "batch").await, EventId::zero());
}

#[tokio::test]
async fn continuous_mode_recovers_from_transient_read_failures() {
    // Given the first two reads fail
    let store = InMemoryStore::new();
    store
        .append((1..=3).map(|match_id| MatchFinished { match_id }).collect())
        .await
        .expect("append");
    let flaky = Arc::new(FlakyEventLog::new(store.clone(), 2));
    let collector = EventCollector::<MatchFinished>::new("resilient");
    let deliveries = collector.handle();
    let runner = ProjectionRunner::new(collector, Arc::clone(&flaky), store.clone())
        .with_config(RunnerConfig::default().with_poll_interval(Duration::from_millis(5)));
    let stop = runner.stop_handle();
    let task = tokio::spawn(runner.run());

    // When the runner keeps polling
    tokio::time::timeout(Duration::from_secs(5), async {
        while version_of(&store, "resilient").await != EventId::new(3) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("consumer catches up");
    stop.cancel();
    let stats = task.await.expect("task completes").expect("continuous runs return stats");

    // Then both failures were recorded and every event applied once
    assert_eq!(stats.failures, 2);
    assert_eq!(deliveries.ids(), ids(1..=3));
    assert!(flaky.reads() >= 3);
}

#[tokio::test]
async fn stopped_consumer_makes_no_progress_until_resumed() {
    let store = store_with_stats_at_100().await;
    store
        .save_last_version(&consumer("stats"), EventId::new(100), Season::initial(), true)
        .await
        .expect("stop");
    let collector = EventCollector::<MatchFinished>::new("stats");
    let deliveries = collector.handle();

    let stats = ProjectionRunner::new(collector, &store, &store)
        .with_poll_mode(PollMode::Batch)
        .run()
        .await
        .expect("stopped consumer is caught up");

    assert_eq!(stats.events_applied, 0);
    assert!(deliveries.is_empty());
    assert_eq!(version_of(&store, "stats").await, EventId::new(100));
}

#[tokio::test]
async fn host_runs_consumers_independently_and_shuts_down_cleanly() {
    // Given two consumers, one of which is stuck on event 2
    let store = InMemoryStore::new();
    store
        .append((1..=4).map(|match_id| MatchFinished { match_id }).collect())
        .await
        .expect("append");
    let healthy = EventCollector::<MatchFinished>::new("healthy");
    let stuck = FailOnEvent::new(EventCollector::<MatchFinished>::new("stuck"), [EventId::new(2)]);
    let registry = ConsumerRegistry::new()
        .register(healthy)
        .and_then(|registry| registry.register(stuck))
        .expect("distinct names");

    let mut host = ProjectionHost::new(
        RunnerConfig::default()
            .with_poll_interval(Duration::from_millis(5))
            .with_shutdown_timeout(Duration::from_secs(2)),
    );
    host.spawn(registry, store.clone(), store.clone()).expect("spawn");

    // When the healthy consumer catches up
    tokio::time::timeout(Duration::from_secs(5), async {
        while version_of(&store, "healthy").await != EventId::new(4) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("healthy consumer catches up");

    // Then the stuck one has not moved and shutdown stops both
    assert_eq!(version_of(&store, "stuck").await, EventId::zero());
    let report = host.shutdown().await;
    assert!(report.is_clean());
    assert!(matches!(
        report.runners.get(&consumer("stuck")),
        Some(RunnerExit::Stopped(stats)) if stats.failures >= 1
    ));
}

#[tokio::test]
async fn host_rejects_consumer_names_already_running() {
    let store = InMemoryStore::new();
    let mut host = ProjectionHost::new(RunnerConfig::default());
    let first = ConsumerRegistry::new()
        .register(EventCollector::<MatchFinished>::new("stats"))
        .expect("registry");
    let second = ConsumerRegistry::new()
        .register(EventCollector::<MatchFinished>::new("stats"))
        .expect("registry");

    host.spawn(first, store.clone(), store.clone()).expect("first spawn");
    let result = host.spawn(second, store.clone(), store.clone());

    assert!(result.is_err());
    assert_eq!(host.consumer_names(), vec![consumer("stats")]);
    let _ = host.shutdown().await;
}
