//! Postgres-specific behavior beyond the shared backend contract.

mod common;

use readmodel_types::{
    BatchSize, DocumentKey, DocumentSession, DocumentStore, EventLog, LoggedEvent, StoredDocument,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ParallelAppend {
    writer: u32,
    seq: u32,
}

impl LoggedEvent for ParallelAppend {
    const STREAM: &'static str = "postgres.parallel_append";
}

fn unique_key(label: &str) -> DocumentKey {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock after epoch")
        .as_nanos();
    DocumentKey::try_new(format!("{label}-{nanos}")).expect("valid document key")
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires Docker"]
async fn migrations_can_run_twice() {
    let store = common::make_store().await;

    store.migrate().await.expect("second migration run is a no-op");
    store.ping().await.expect("store still answers");
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires Docker"]
async fn concurrent_appends_are_read_back_in_strict_id_order() {
    let store = common::make_store().await;
    let head = store
        .last_event_id::<ParallelAppend>()
        .await
        .expect("head")
        .unwrap_or_else(readmodel_types::EventId::zero);

    let writers = (0..4u32).map(|writer| {
        let store = store.clone();
        tokio::spawn(async move {
            for seq in 0..25 {
                let _ = store
                    .append(vec![ParallelAppend { writer, seq }])
                    .await
                    .expect("append");
            }
        })
    });
    for writer in writers.collect::<Vec<_>>() {
        writer.await.expect("writer completes");
    }

    let page = store
        .load_since::<ParallelAppend>(head, BatchSize::new(1000))
        .await
        .expect("page");

    assert_eq!(page.len(), 100);
    assert!(page.windows(2).all(|pair| pair[0].id < pair[1].id));
    for writer in 0..4 {
        let seqs: Vec<u32> = page
            .iter()
            .filter(|event| event.payload.writer == writer)
            .map(|event| event.payload.seq)
            .collect();
        assert_eq!(seqs, (0..25).collect::<Vec<_>>());
    }
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires Docker"]
async fn dropping_an_open_session_rolls_back() {
    let store = common::make_store().await;
    let key = unique_key("dropped");

    {
        let mut session = store.start_session().await.expect("session");
        session.begin().await.expect("begin");
        store
            .upsert(
                Some(&mut session),
                "postgres_sessions",
                StoredDocument {
                    key: key.clone(),
                    version: 0,
                    body: json!({ "state": "pending" }),
                },
            )
            .await
            .expect("write inside transaction");
    }

    let stored = store
        .get(None, "postgres_sessions", &key)
        .await
        .expect("read");
    assert!(stored.is_none());
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires Docker"]
async fn session_sees_its_own_uncommitted_writes() {
    let store = common::make_store().await;
    let key = unique_key("own-writes");
    let document = StoredDocument {
        key: key.clone(),
        version: 1,
        body: json!({ "wins": 3 }),
    };

    let mut session = store.start_session().await.expect("session");
    session.begin().await.expect("begin");
    store
        .upsert(Some(&mut session), "postgres_sessions", document.clone())
        .await
        .expect("write");

    let inside = store
        .get(Some(&mut session), "postgres_sessions", &key)
        .await
        .expect("read inside");
    let outside = store
        .get(None, "postgres_sessions", &key)
        .await
        .expect("read outside");
    assert_eq!(inside, Some(document.clone()));
    assert!(outside.is_none());

    session.commit().await.expect("commit");
    let committed = store
        .get(None, "postgres_sessions", &key)
        .await
        .expect("read after commit");
    assert_eq!(committed, Some(document));
}
