//! Flag checkout scenarios: published documents are taken once and concurrent
//! callers never share a document.

use readmodel::{Document, DocumentKey, FlagCheckout, Repository, TransactionCoordinator};
use readmodel_memory::InMemoryStore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct MatchupNotification {
    match_id: String,
    winner: String,
}

impl Document for MatchupNotification {
    const COLLECTION: &'static str = "matchup_notifications";

    fn key(&self) -> DocumentKey {
        DocumentKey::try_new(self.match_id.clone()).expect("valid document key")
    }
}

fn notification(match_id: &str, winner: &str) -> MatchupNotification {
    MatchupNotification {
        match_id: match_id.to_string(),
        winner: winner.to_string(),
    }
}

fn flag_checkout(store: &InMemoryStore) -> FlagCheckout<InMemoryStore> {
    FlagCheckout::new(Repository::new(Arc::new(TransactionCoordinator::new(
        store.clone(),
    ))))
}

#[tokio::test]
async fn checkout_returns_flagged_documents_once() {
    // Given two published documents
    let store = InMemoryStore::new();
    let checkout = flag_checkout(&store);
    checkout
        .publish(&notification("m-1", "grubby"))
        .await
        .expect("publish");
    checkout
        .publish(&notification("m-2", "moon"))
        .await
        .expect("publish");

    // When a checkout runs
    let first = checkout
        .checkout::<MatchupNotification>()
        .await
        .expect("checkout");

    // Then both are returned and a second checkout finds nothing
    assert_eq!(
        first.documents(),
        &[notification("m-1", "grubby"), notification("m-2", "moon")]
    );
    let second = checkout
        .checkout::<MatchupNotification>()
        .await
        .expect("checkout");
    assert!(second.is_empty());
}

#[tokio::test]
async fn concurrent_checkouts_never_share_a_document() {
    let store = InMemoryStore::new();
    let producer = flag_checkout(&store);
    for index in 0..50 {
        producer
            .publish(&notification(&format!("m-{index:02}"), "happy"))
            .await
            .expect("publish");
    }

    let left = flag_checkout(&store);
    let right = flag_checkout(&store);
    let (a, b) = tokio::join!(
        left.checkout::<MatchupNotification>(),
        right.checkout::<MatchupNotification>()
    );
    let a: BTreeSet<DocumentKey> = a.expect("checkout").keys().iter().cloned().collect();
    let b: BTreeSet<DocumentKey> = b.expect("checkout").keys().iter().cloned().collect();

    assert!(a.is_disjoint(&b));
    assert_eq!(a.len() + b.len(), 50);
}

#[tokio::test]
async fn documents_published_after_a_checkout_wait_for_the_next_one() {
    let store = InMemoryStore::new();
    let checkout = flag_checkout(&store);
    checkout
        .publish(&notification("m-1", "lyn"))
        .await
        .expect("publish");
    let first = checkout
        .checkout::<MatchupNotification>()
        .await
        .expect("checkout")
        .into_documents();

    checkout
        .publish(&notification("m-2", "sky"))
        .await
        .expect("publish");
    let second = checkout
        .checkout::<MatchupNotification>()
        .await
        .expect("checkout")
        .into_documents();

    assert_eq!(first, vec![notification("m-1", "lyn")]);
    assert_eq!(second, vec![notification("m-2", "sky")]);
}
