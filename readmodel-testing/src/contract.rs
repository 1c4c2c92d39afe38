//! Backend-agnostic behavioural suites for the store traits.
//!
//! Every `test_*` function takes an async factory producing a fresh handle
//! to the backend under test. Scenarios use their own streams, collections,
//! consumer names and document keys, so suites can run in parallel against
//! one shared database.
//!
//! The `*_contract_tests!` macros expand to one `#[tokio::test]` per
//! scenario. Extra attributes (such as `#[ignore]`) given before `suite`
//! are applied to every generated test.

use readmodel_types::{
    BatchSize, Checkpoint, CheckpointStore, ConsumerName, DocumentKey, DocumentSession,
    DocumentStore, EventId, EventLog, LoggedEvent, Season, StoreError, StoredDocument, SyncState,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use uuid::Uuid;

/// Failed scenario with a description of what went wrong.
#[derive(Debug)]
pub struct ContractTestFailure {
    scenario: &'static str,
    detail: String,
}

impl ContractTestFailure {
    fn new(scenario: &'static str, detail: impl Into<String>) -> Self {
        Self {
            scenario,
            detail: detail.into(),
        }
    }

    fn store_error(scenario: &'static str, operation: &'static str, error: StoreError) -> Self {
        Self::new(
            scenario,
            format!("{operation} operation returned unexpected error: {error}"),
        )
    }

    fn assertion(scenario: &'static str, detail: impl Into<String>) -> Self {
        Self::new(scenario, detail)
    }
}

impl fmt::Display for ContractTestFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.scenario, self.detail)
    }
}

impl std::error::Error for ContractTestFailure {}

pub type ContractTestResult = Result<(), ContractTestFailure>;

macro_rules! contract_event {
    ($name:ident, $stream:literal) => {
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        struct $name {
            seq: u32,
        }

        impl LoggedEvent for $name {
            const STREAM: &'static str = $stream;
        }
    };
}

contract_event!(PagingEvent, "contract.paging");
contract_event!(CaughtUpEvent, "contract.caught_up");
contract_event!(StableReadEvent, "contract.stable_read");
contract_event!(IsolationLeftEvent, "contract.isolation_left");
contract_event!(IsolationRightEvent, "contract.isolation_right");
contract_event!(HeadEvent, "contract.head");
contract_event!(CountLeftEvent, "contract.count_left");
contract_event!(CountRightEvent, "contract.count_right");

fn check(scenario: &'static str, condition: bool, detail: impl FnOnce() -> String) -> ContractTestResult {
    if condition {
        Ok(())
    } else {
        Err(ContractTestFailure::assertion(scenario, detail()))
    }
}

fn step<T>(
    scenario: &'static str,
    operation: &'static str,
    result: Result<T, StoreError>,
) -> Result<T, ContractTestFailure> {
    result.map_err(|error| ContractTestFailure::store_error(scenario, operation, error))
}

fn contract_consumer(scenario: &'static str) -> Result<ConsumerName, ContractTestFailure> {
    // Unique per run for parallel execution against a shared database
    let raw = format!("contract::{scenario}::{}", Uuid::now_v7());
    ConsumerName::try_new(raw.clone()).map_err(|error| {
        ContractTestFailure::assertion(scenario, format!("unable to build consumer name `{raw}`: {error}"))
    })
}

fn contract_key(scenario: &'static str, label: &str) -> Result<DocumentKey, ContractTestFailure> {
    let raw = format!("{label}-{}", Uuid::now_v7());
    DocumentKey::try_new(raw.clone()).map_err(|error| {
        ContractTestFailure::assertion(scenario, format!("unable to build document key `{raw}`: {error}"))
    })
}

fn contract_document(key: &DocumentKey, version: u64, value: u32) -> StoredDocument {
    StoredDocument {
        key: key.clone(),
        version,
        body: serde_json::json!({ "key": key.as_ref(), "value": value }),
    }
}

async fn head<S: EventLog, E: LoggedEvent>(
    scenario: &'static str,
    store: &S,
) -> Result<EventId, ContractTestFailure> {
    Ok(step(scenario, "last_event_id", store.last_event_id::<E>().await)?.unwrap_or_else(EventId::zero))
}

// ---------------------------------------------------------------------------
// Event log
// ---------------------------------------------------------------------------

pub async fn test_pages_are_ascending_and_bounded<F, Fut, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
    S: EventLog,
{
    const SCENARIO: &str = "pages_are_ascending_and_bounded";

    let store = make_store().await;
    let after = head::<_, PagingEvent>(SCENARIO, &store).await?;
    let ids = step(
        SCENARIO,
        "append",
        store
            .append((0..5).map(|seq| PagingEvent { seq }).collect())
            .await,
    )?;
    check(SCENARIO, ids.windows(2).all(|w| w[0] < w[1]), || {
        format!("append must assign increasing ids, got {ids:?}")
    })?;

    let first = step(
        SCENARIO,
        "load_since",
        store.load_since::<PagingEvent>(after, BatchSize::new(3)).await,
    )?;
    let first_ids: Vec<EventId> = first.iter().map(|event| event.id).collect();
    check(SCENARIO, first_ids == ids[..3], || {
        format!("first page should be {:?}, got {first_ids:?}", &ids[..3])
    })?;
    let seqs: Vec<u32> = first.iter().map(|event| event.payload.seq).collect();
    check(SCENARIO, seqs == [0, 1, 2], || {
        format!("payloads should come back in append order, got {seqs:?}")
    })?;

    let second = step(
        SCENARIO,
        "load_since",
        store
            .load_since::<PagingEvent>(ids[2], BatchSize::new(10))
            .await,
    )?;
    let second_ids: Vec<EventId> = second.iter().map(|event| event.id).collect();
    check(SCENARIO, second_ids == ids[3..], || {
        format!("second page should be {:?}, got {second_ids:?}", &ids[3..])
    })
}

pub async fn test_caught_up_reader_gets_empty_page<F, Fut, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
    S: EventLog,
{
    const SCENARIO: &str = "caught_up_reader_gets_empty_page";

    let store = make_store().await;
    let ids = step(
        SCENARIO,
        "append",
        store.append(vec![CaughtUpEvent { seq: 1 }]).await,
    )?;
    let last = *ids
        .last()
        .ok_or_else(|| ContractTestFailure::assertion(SCENARIO, "append returned no ids"))?;

    let page = step(
        SCENARIO,
        "load_since",
        store
            .load_since::<CaughtUpEvent>(last, BatchSize::new(10))
            .await,
    )?;
    check(SCENARIO, page.is_empty(), || {
        format!("expected an empty page after the head, got {} events", page.len())
    })?;

    let zero = step(
        SCENARIO,
        "load_since",
        store
            .load_since::<CaughtUpEvent>(EventId::zero(), BatchSize::new(0))
            .await,
    )?;
    check(SCENARIO, zero.is_empty(), || {
        format!("batch size zero must return an empty page, got {} events", zero.len())
    })
}

pub async fn test_reads_are_stable_across_appends<F, Fut, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
    S: EventLog,
{
    const SCENARIO: &str = "reads_are_stable_across_appends";

    let store = make_store().await;
    let after = head::<_, StableReadEvent>(SCENARIO, &store).await?;
    let _ = step(
        SCENARIO,
        "append",
        store
            .append(vec![StableReadEvent { seq: 1 }, StableReadEvent { seq: 2 }])
            .await,
    )?;
    let before: Vec<EventId> = step(
        SCENARIO,
        "load_since",
        store
            .load_since::<StableReadEvent>(after, BatchSize::new(100))
            .await,
    )?
    .iter()
    .map(|event| event.id)
    .collect();

    let _ = step(
        SCENARIO,
        "append",
        store.append(vec![StableReadEvent { seq: 3 }]).await,
    )?;
    let again: Vec<EventId> = step(
        SCENARIO,
        "load_since",
        store
            .load_since::<StableReadEvent>(after, BatchSize::new(100))
            .await,
    )?
    .iter()
    .map(|event| event.id)
    .collect();

    check(SCENARIO, again.starts_with(&before) && again.len() == before.len() + 1, || {
        format!("re-read {again:?} must extend the earlier read {before:?}")
    })
}

pub async fn test_streams_are_isolated<F, Fut, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
    S: EventLog,
{
    const SCENARIO: &str = "streams_are_isolated";

    let store = make_store().await;
    let after = head::<_, IsolationLeftEvent>(SCENARIO, &store).await?;
    let left = step(
        SCENARIO,
        "append",
        store.append(vec![IsolationLeftEvent { seq: 1 }]).await,
    )?;
    let _ = step(
        SCENARIO,
        "append",
        store.append(vec![IsolationRightEvent { seq: 2 }]).await,
    )?;

    let page: Vec<EventId> = step(
        SCENARIO,
        "load_since",
        store
            .load_since::<IsolationLeftEvent>(after, BatchSize::new(100))
            .await,
    )?
    .iter()
    .map(|event| event.id)
    .collect();
    check(SCENARIO, page == left, || {
        format!("left stream should only contain {left:?}, got {page:?}")
    })
}

pub async fn test_count_since_ignores_other_streams<F, Fut, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
    S: EventLog,
{
    const SCENARIO: &str = "count_since_ignores_other_streams";

    let store = make_store().await;
    let after = head::<_, CountLeftEvent>(SCENARIO, &store).await?;
    let mut left = Vec::new();
    for seq in 0..3 {
        left.extend(step(
            SCENARIO,
            "append",
            store.append(vec![CountLeftEvent { seq }]).await,
        )?);
        let _ = step(
            SCENARIO,
            "append",
            store.append(vec![CountRightEvent { seq }]).await,
        )?;
    }

    let pending = step(
        SCENARIO,
        "count_since",
        store.count_since::<CountLeftEvent>(after).await,
    )?;
    check(SCENARIO, pending == 3, || {
        format!("expected 3 left events after {after}, counted {pending}")
    })?;

    let after_first = left[0];
    let pending = step(
        SCENARIO,
        "count_since",
        store.count_since::<CountLeftEvent>(after_first).await,
    )?;
    check(SCENARIO, pending == 2, || {
        format!("expected 2 left events after {after_first}, counted {pending}")
    })
}

pub async fn test_last_event_id_tracks_head<F, Fut, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
    S: EventLog,
{
    const SCENARIO: &str = "last_event_id_tracks_head";

    let store = make_store().await;
    let ids = step(
        SCENARIO,
        "append",
        store
            .append(vec![HeadEvent { seq: 1 }, HeadEvent { seq: 2 }])
            .await,
    )?;
    let reported = step(SCENARIO, "last_event_id", store.last_event_id::<HeadEvent>().await)?;

    check(SCENARIO, reported == ids.last().copied(), || {
        format!("last_event_id should be {:?}, got {reported:?}", ids.last())
    })
}

// ---------------------------------------------------------------------------
// Checkpoint store
// ---------------------------------------------------------------------------

pub async fn test_unknown_consumer_gets_initial_checkpoint<F, Fut, S>(
    make_store: F,
) -> ContractTestResult
where
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
    S: CheckpointStore,
{
    const SCENARIO: &str = "unknown_consumer_gets_initial_checkpoint";

    let store = make_store().await;
    let consumer = contract_consumer(SCENARIO)?;

    let checkpoint = step(SCENARIO, "get_last_version", store.get_last_version(&consumer).await)?;

    check(SCENARIO, checkpoint == Checkpoint::initial(consumer), || {
        format!("expected the zero-value checkpoint, got {checkpoint:?}")
    })
}

pub async fn test_checkpoint_round_trips<F, Fut, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
    S: CheckpointStore,
{
    const SCENARIO: &str = "checkpoint_round_trips";

    let store = make_store().await;
    let consumer = contract_consumer(SCENARIO)?;
    step(
        SCENARIO,
        "save_last_version",
        store
            .save_last_version(&consumer, EventId::new(105), Season::new(3), true)
            .await,
    )?;

    let checkpoint = step(SCENARIO, "get_last_version", store.get_last_version(&consumer).await)?;

    check(
        SCENARIO,
        checkpoint.version == EventId::new(105)
            && checkpoint.season == Season::new(3)
            && checkpoint.is_stopped,
        || format!("saved fields were not read back, got {checkpoint:?}"),
    )
}

pub async fn test_checkpoint_never_regresses<F, Fut, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
    S: CheckpointStore,
{
    const SCENARIO: &str = "checkpoint_never_regresses";

    let store = make_store().await;
    let consumer = contract_consumer(SCENARIO)?;
    step(
        SCENARIO,
        "save_last_version",
        store
            .save_last_version(&consumer, EventId::new(105), Season::initial(), false)
            .await,
    )?;

    match store
        .save_last_version(&consumer, EventId::new(100), Season::initial(), false)
        .await
    {
        Err(StoreError::CheckpointRegression { .. }) => {}
        Err(error) => return Err(ContractTestFailure::store_error(SCENARIO, "save_last_version", error)),
        Ok(()) => {
            return Err(ContractTestFailure::assertion(
                SCENARIO,
                "moving a checkpoint backwards must be rejected",
            ))
        }
    }

    // Re-saving the same version (e.g. to flip is_stopped) is allowed
    step(
        SCENARIO,
        "save_last_version",
        store
            .save_last_version(&consumer, EventId::new(105), Season::initial(), true)
            .await,
    )?;
    let checkpoint = step(SCENARIO, "get_last_version", store.get_last_version(&consumer).await)?;
    check(
        SCENARIO,
        checkpoint.version == EventId::new(105) && checkpoint.is_stopped,
        || format!("expected version 105 and stopped, got {checkpoint:?}"),
    )
}

pub async fn test_sync_state_is_kept_separately<F, Fut, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
    S: CheckpointStore,
{
    const SCENARIO: &str = "sync_state_is_kept_separately";

    let store = make_store().await;
    let consumer = contract_consumer(SCENARIO)?;
    let state = SyncState::new(serde_json::json!({ "last_match": "m-17" }));

    step(
        SCENARIO,
        "save_sync_state",
        store.save_sync_state(&consumer, state.clone()).await,
    )?;
    let before = step(SCENARIO, "get_last_version", store.get_last_version(&consumer).await)?;
    check(SCENARIO, before.version.is_zero(), || {
        format!("saving sync-state must not move the version, got {before:?}")
    })?;

    step(
        SCENARIO,
        "save_last_version",
        store
            .save_last_version(&consumer, EventId::new(12), Season::initial(), false)
            .await,
    )?;
    let after = step(SCENARIO, "get_last_version", store.get_last_version(&consumer).await)?;
    check(SCENARIO, after.sync_state == Some(state), || {
        format!("saving the version must keep sync-state, got {after:?}")
    })
}

pub async fn test_list_checkpoints_includes_saved<F, Fut, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
    S: CheckpointStore,
{
    const SCENARIO: &str = "list_checkpoints_includes_saved";

    let store = make_store().await;
    let first = contract_consumer(SCENARIO)?;
    let second = contract_consumer(SCENARIO)?;
    for (consumer, version) in [(&first, 3), (&second, 7)] {
        step(
            SCENARIO,
            "save_last_version",
            store
                .save_last_version(consumer, EventId::new(version), Season::initial(), false)
                .await,
        )?;
    }

    let listed = step(SCENARIO, "list_checkpoints", store.list_checkpoints().await)?;
    let ours: Vec<(ConsumerName, EventId)> = listed
        .iter()
        .filter(|checkpoint| checkpoint.consumer == first || checkpoint.consumer == second)
        .map(|checkpoint| (checkpoint.consumer.clone(), checkpoint.version))
        .collect();
    check(
        SCENARIO,
        ours == vec![(first.clone(), EventId::new(3)), (second.clone(), EventId::new(7))],
        || format!("expected both checkpoints ordered by name, got {ours:?}"),
    )?;
    check(SCENARIO, listed.windows(2).all(|w| w[0].consumer < w[1].consumer), || {
        "list_checkpoints must be ordered by consumer name".to_string()
    })
}

// ---------------------------------------------------------------------------
// Document store
// ---------------------------------------------------------------------------

pub async fn test_auto_commit_writes<F, Fut, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
    S: DocumentStore,
{
    const SCENARIO: &str = "auto_commit_writes";
    const COLLECTION: &str = "contract_auto_commit";

    let store = make_store().await;
    let key = contract_key(SCENARIO, "doc")?;

    step(
        SCENARIO,
        "upsert",
        store.upsert(None, COLLECTION, contract_document(&key, 0, 1)).await,
    )?;
    step(
        SCENARIO,
        "upsert",
        store.upsert(None, COLLECTION, contract_document(&key, 0, 2)).await,
    )?;
    let loaded = step(SCENARIO, "get", store.get(None, COLLECTION, &key).await)?;
    check(SCENARIO, loaded == Some(contract_document(&key, 0, 2)), || {
        format!("upsert by key should replace the document, got {loaded:?}")
    })?;

    let removed = step(SCENARIO, "delete", store.delete(None, COLLECTION, &key).await)?;
    let removed_again = step(SCENARIO, "delete", store.delete(None, COLLECTION, &key).await)?;
    check(SCENARIO, removed && !removed_again, || {
        format!("delete should report removal once, got {removed} then {removed_again}")
    })
}

pub async fn test_committed_transaction_is_visible<F, Fut, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
    S: DocumentStore,
{
    const SCENARIO: &str = "committed_transaction_is_visible";
    const COLLECTION: &str = "contract_commit";

    let store = make_store().await;
    let first = contract_key(SCENARIO, "first")?;
    let second = contract_key(SCENARIO, "second")?;
    let mut session = step(SCENARIO, "start_session", store.start_session().await)?;
    step(SCENARIO, "begin", session.begin().await)?;

    for key in [&first, &second] {
        step(
            SCENARIO,
            "upsert",
            store
                .upsert(Some(&mut session), COLLECTION, contract_document(key, 0, 1))
                .await,
        )?;
    }
    let own = step(SCENARIO, "get", store.get(Some(&mut session), COLLECTION, &first).await)?;
    check(SCENARIO, own.is_some(), || {
        "a session must read its own uncommitted writes".to_string()
    })?;
    let outside = step(SCENARIO, "get", store.get(None, COLLECTION, &first).await)?;
    check(SCENARIO, outside.is_none(), || {
        "uncommitted writes must be invisible outside the session".to_string()
    })?;

    step(SCENARIO, "commit", session.commit().await)?;

    for key in [&first, &second] {
        let loaded = step(SCENARIO, "get", store.get(None, COLLECTION, key).await)?;
        check(SCENARIO, loaded.is_some(), || {
            format!("{key} should be visible after commit")
        })?;
    }
    Ok(())
}

pub async fn test_aborted_transaction_is_discarded<F, Fut, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
    S: DocumentStore,
{
    const SCENARIO: &str = "aborted_transaction_is_discarded";
    const COLLECTION: &str = "contract_abort";

    let store = make_store().await;
    let aborted = contract_key(SCENARIO, "aborted")?;
    let dropped = contract_key(SCENARIO, "dropped")?;

    let mut session = step(SCENARIO, "start_session", store.start_session().await)?;
    step(SCENARIO, "begin", session.begin().await)?;
    step(
        SCENARIO,
        "upsert",
        store
            .upsert(Some(&mut session), COLLECTION, contract_document(&aborted, 0, 1))
            .await,
    )?;
    step(SCENARIO, "abort", session.abort().await)?;

    {
        let mut session = step(SCENARIO, "start_session", store.start_session().await)?;
        step(SCENARIO, "begin", session.begin().await)?;
        step(
            SCENARIO,
            "upsert",
            store
                .upsert(Some(&mut session), COLLECTION, contract_document(&dropped, 0, 1))
                .await,
        )?;
    }

    for key in [&aborted, &dropped] {
        let loaded = step(SCENARIO, "get", store.get(None, COLLECTION, key).await)?;
        check(SCENARIO, loaded.is_none(), || {
            format!("{key} must not be visible after abort or drop")
        })?;
    }
    Ok(())
}

pub async fn test_conditional_replace_matches_version<F, Fut, S>(
    make_store: F,
) -> ContractTestResult
where
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
    S: DocumentStore,
{
    const SCENARIO: &str = "conditional_replace_matches_version";
    const COLLECTION: &str = "contract_replace";

    let store = make_store().await;
    let key = contract_key(SCENARIO, "ladder")?;
    step(
        SCENARIO,
        "upsert",
        store.upsert(None, COLLECTION, contract_document(&key, 1, 1)).await,
    )?;

    let matched = step(
        SCENARIO,
        "replace_if_version",
        store
            .replace_if_version(None, COLLECTION, contract_document(&key, 2, 2), 1)
            .await,
    )?;
    let stale = step(
        SCENARIO,
        "replace_if_version",
        store
            .replace_if_version(None, COLLECTION, contract_document(&key, 2, 3), 1)
            .await,
    )?;
    check(SCENARIO, matched == 1 && stale == 0, || {
        format!("expected 1 then 0 matches, got {matched} then {stale}")
    })?;

    let loaded = step(SCENARIO, "get", store.get(None, COLLECTION, &key).await)?;
    check(SCENARIO, loaded == Some(contract_document(&key, 2, 2)), || {
        format!("the losing replace must not be applied, got {loaded:?}")
    })
}

pub async fn test_checkout_flips_each_document_once<F, Fut, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
    S: DocumentStore,
{
    const SCENARIO: &str = "checkout_flips_each_document_once";
    const COLLECTION: &str = "contract_checkout";

    let store = make_store().await;
    let first = contract_key(SCENARIO, "first")?;
    let second = contract_key(SCENARIO, "second")?;
    for key in [&first, &second] {
        step(
            SCENARIO,
            "insert_unsynced",
            store
                .insert_unsynced(None, COLLECTION, contract_document(key, 0, 1))
                .await,
        )?;
    }

    let taken: BTreeSet<DocumentKey> = step(
        SCENARIO,
        "checkout_unsynced",
        store.checkout_unsynced(COLLECTION).await,
    )?
    .into_iter()
    .map(|document| document.key)
    .collect();
    check(SCENARIO, taken.contains(&first) && taken.contains(&second), || {
        format!("checkout should return both published documents, got {taken:?}")
    })?;

    let again = step(
        SCENARIO,
        "checkout_unsynced",
        store.checkout_unsynced(COLLECTION).await,
    )?;
    check(
        SCENARIO,
        again.iter().all(|document| document.key != first && document.key != second),
        || "a second checkout must not return documents already taken".to_string(),
    )?;

    let released = step(
        SCENARIO,
        "release",
        store.release(COLLECTION, &[first.clone()]).await,
    )?;
    let returned: Vec<DocumentKey> = step(
        SCENARIO,
        "checkout_unsynced",
        store.checkout_unsynced(COLLECTION).await,
    )?
    .into_iter()
    .map(|document| document.key)
    .collect();
    check(SCENARIO, released == 1 && returned.contains(&first), || {
        format!("released document should be checked out again, released={released} got {returned:?}")
    })
}

pub async fn test_concurrent_checkouts_partition_documents<F, Fut, S>(
    make_store: F,
) -> ContractTestResult
where
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
    S: DocumentStore,
{
    const SCENARIO: &str = "concurrent_checkouts_partition_documents";
    const COLLECTION: &str = "contract_checkout_race";

    let store = make_store().await;
    let mut published = BTreeSet::new();
    for index in 0..20 {
        let key = contract_key(SCENARIO, &format!("doc{index}"))?;
        step(
            SCENARIO,
            "insert_unsynced",
            store
                .insert_unsynced(None, COLLECTION, contract_document(&key, 0, index))
                .await,
        )?;
        let _ = published.insert(key);
    }

    let (left, right) = tokio::join!(
        store.checkout_unsynced(COLLECTION),
        store.checkout_unsynced(COLLECTION)
    );
    let left: BTreeSet<DocumentKey> = step(SCENARIO, "checkout_unsynced", left)?
        .into_iter()
        .map(|document| document.key)
        .collect();
    let right: BTreeSet<DocumentKey> = step(SCENARIO, "checkout_unsynced", right)?
        .into_iter()
        .map(|document| document.key)
        .collect();

    check(SCENARIO, left.is_disjoint(&right), || {
        format!("documents handed out twice: {:?}", left.intersection(&right).collect::<Vec<_>>())
    })?;
    let union: BTreeSet<DocumentKey> = left.union(&right).cloned().collect();
    check(SCENARIO, published.is_subset(&union), || {
        format!(
            "every published document should be taken exactly once, missing {:?}",
            published.difference(&union).collect::<Vec<_>>()
        )
    })
}

#[macro_export]
macro_rules! event_log_contract_tests {
    ($(#[$attr:meta])* suite = $suite:ident, make_store = $make_store:expr $(,)?) => {
        #[allow(non_snake_case)]
        mod $suite {
            use super::*;
            use $crate::contract::{
                test_caught_up_reader_gets_empty_page, test_count_since_ignores_other_streams,
                test_last_event_id_tracks_head,
                test_pages_are_ascending_and_bounded, test_reads_are_stable_across_appends,
                test_streams_are_isolated,
            };

            $(#[$attr])*
            #[tokio::test(flavor = "multi_thread")]
            async fn pages_are_ascending_and_bounded_contract() {
                test_pages_are_ascending_and_bounded($make_store)
                    .await
                    .expect("event log contract failed");
            }

            $(#[$attr])*
            #[tokio::test(flavor = "multi_thread")]
            async fn caught_up_reader_gets_empty_page_contract() {
                test_caught_up_reader_gets_empty_page($make_store)
                    .await
                    .expect("event log contract failed");
            }

            $(#[$attr])*
            #[tokio::test(flavor = "multi_thread")]
            async fn reads_are_stable_across_appends_contract() {
                test_reads_are_stable_across_appends($make_store)
                    .await
                    .expect("event log contract failed");
            }

            $(#[$attr])*
            #[tokio::test(flavor = "multi_thread")]
            async fn streams_are_isolated_contract() {
                test_streams_are_isolated($make_store)
                    .await
                    .expect("event log contract failed");
            }

            $(#[$attr])*
            #[tokio::test(flavor = "multi_thread")]
            async fn count_since_ignores_other_streams_contract() {
                test_count_since_ignores_other_streams($make_store)
                    .await
                    .expect("event log contract failed");
            }

            $(#[$attr])*
            #[tokio::test(flavor = "multi_thread")]
            async fn last_event_id_tracks_head_contract() {
                test_last_event_id_tracks_head($make_store)
                    .await
                    .expect("event log contract failed");
            }
        }
    };
}

pub use event_log_contract_tests;

#[macro_export]
macro_rules! checkpoint_store_contract_tests {
    ($(#[$attr:meta])* suite = $suite:ident, make_store = $make_store:expr $(,)?) => {
        #[allow(non_snake_case)]
        mod $suite {
            use super::*;
            use $crate::contract::{
                test_checkpoint_never_regresses, test_checkpoint_round_trips,
                test_list_checkpoints_includes_saved, test_sync_state_is_kept_separately,
                test_unknown_consumer_gets_initial_checkpoint,
            };

            $(#[$attr])*
            #[tokio::test(flavor = "multi_thread")]
            async fn unknown_consumer_gets_initial_checkpoint_contract() {
                test_unknown_consumer_gets_initial_checkpoint($make_store)
                    .await
                    .expect("checkpoint store contract failed");
            }

            $(#[$attr])*
            #[tokio::test(flavor = "multi_thread")]
            async fn checkpoint_round_trips_contract() {
                test_checkpoint_round_trips($make_store)
                    .await
                    .expect("checkpoint store contract failed");
            }

            $(#[$attr])*
            #[tokio::test(flavor = "multi_thread")]
            async fn checkpoint_never_regresses_contract() {
                test_checkpoint_never_regresses($make_store)
                    .await
                    .expect("checkpoint store contract failed");
            }

            $(#[$attr])*
            #[tokio::test(flavor = "multi_thread")]
            async fn sync_state_is_kept_separately_contract() {
                test_sync_state_is_kept_separately($make_store)
                    .await
                    .expect("checkpoint store contract failed");
            }

            $(#[$attr])*
            #[tokio::test(flavor = "multi_thread")]
            async fn list_checkpoints_includes_saved_contract() {
                test_list_checkpoints_includes_saved($make_store)
                    .await
                    .expect("checkpoint store contract failed");
            }
        }
    };
}

pub use checkpoint_store_contract_tests;

#[macro_export]
macro_rules! document_store_contract_tests {
    ($(#[$attr:meta])* suite = $suite:ident, make_store = $make_store:expr $(,)?) => {
        #[allow(non_snake_case)]
        mod $suite {
            use super::*;
            use $crate::contract::{
                test_aborted_transaction_is_discarded, test_auto_commit_writes,
                test_checkout_flips_each_document_once, test_committed_transaction_is_visible,
                test_concurrent_checkouts_partition_documents,
                test_conditional_replace_matches_version,
            };

            $(#[$attr])*
            #[tokio::test(flavor = "multi_thread")]
            async fn auto_commit_writes_contract() {
                test_auto_commit_writes($make_store)
                    .await
                    .expect("document store contract failed");
            }

            $(#[$attr])*
            #[tokio::test(flavor = "multi_thread")]
            async fn committed_transaction_is_visible_contract() {
                test_committed_transaction_is_visible($make_store)
                    .await
                    .expect("document store contract failed");
            }

            $(#[$attr])*
            #[tokio::test(flavor = "multi_thread")]
            async fn aborted_transaction_is_discarded_contract() {
                test_aborted_transaction_is_discarded($make_store)
                    .await
                    .expect("document store contract failed");
            }

            $(#[$attr])*
            #[tokio::test(flavor = "multi_thread")]
            async fn conditional_replace_matches_version_contract() {
                test_conditional_replace_matches_version($make_store)
                    .await
                    .expect("document store contract failed");
            }

            $(#[$attr])*
            #[tokio::test(flavor = "multi_thread")]
            async fn checkout_flips_each_document_once_contract() {
                test_checkout_flips_each_document_once($make_store)
                    .await
                    .expect("document store contract failed");
            }

            $(#[$attr])*
            #[tokio::test(flavor = "multi_thread")]
            async fn concurrent_checkouts_partition_documents_contract() {
                test_concurrent_checkouts_partition_documents($make_store)
                    .await
                    .expect("document store contract failed");
            }
        }
    };
}

pub use document_store_contract_tests;
