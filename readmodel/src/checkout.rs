//! Flag-based checkout for sources without a trustworthy cursor.
//!
//! Producers publish documents with the checkout flag unset. A checkout
//! atomically flips the flag on every unset document of a collection and
//! returns exactly that set, so no document is handed to two callers by the
//! same flip.
//!
//! A checked-out batch stays taken until `CheckedOut::release` is called.
//! There is no lease: a caller that crashes between checkout and release
//! leaves its batch taken.

use crate::repository::Repository;
use readmodel_types::{Document, DocumentKey, DocumentStore, StoreError, StoredDocument};
use tracing::{info, instrument, warn};

/// Publishes and takes flagged documents through a repository.
pub struct FlagCheckout<D: DocumentStore> {
    repository: Repository<D>,
}

impl<D: DocumentStore> FlagCheckout<D> {
    /// Checkout over `repository`'s store.
    pub fn new(repository: Repository<D>) -> Self {
        Self { repository }
    }

    /// Producer side: write `document` as not yet taken.
    ///
    /// Follows the ambient transaction like any repository write.
    pub async fn publish<T: Document>(&self, document: &T) -> Result<(), StoreError> {
        let stored = StoredDocument::from_document(document, 0)?;
        self.repository.insert_unsynced::<T>(stored).await
    }

    /// Take every document of `T`'s collection that has not been taken yet.
    ///
    /// If a taken document fails to decode, the whole batch is released
    /// before the error is returned.
    #[instrument(name = "checkout.take", skip(self), fields(collection = T::COLLECTION))]
    pub async fn checkout<T: Document>(&self) -> Result<CheckedOut<'_, D, T>, StoreError> {
        let taken = self
            .repository
            .store()
            .checkout_unsynced(T::COLLECTION)
            .await?;
        let keys: Vec<DocumentKey> = taken.iter().map(|stored| stored.key.clone()).collect();

        let decoded: Result<Vec<T>, StoreError> =
            taken.into_iter().map(StoredDocument::into_document).collect();
        let documents = match decoded {
            Ok(documents) => documents,
            Err(error) => {
                warn!(error = %error, taken = keys.len(), "[checkout.take] undecodable batch, releasing");
                self.repository.store().release(T::COLLECTION, &keys).await?;
                return Err(error);
            }
        };

        info!(taken = documents.len(), "[checkout.take] batch checked out");
        Ok(CheckedOut {
            checkout: self,
            keys,
            documents,
        })
    }
}

impl<D: DocumentStore> std::fmt::Debug for FlagCheckout<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlagCheckout").finish_non_exhaustive()
    }
}

/// A batch returned by `FlagCheckout::checkout`, ordered by key.
pub struct CheckedOut<'a, D: DocumentStore, T> {
    checkout: &'a FlagCheckout<D>,
    keys: Vec<DocumentKey>,
    documents: Vec<T>,
}

impl<D: DocumentStore, T: Document> CheckedOut<'_, D, T> {
    /// The decoded documents of the batch.
    pub fn documents(&self) -> &[T] {
        &self.documents
    }

    /// Keys of every document in the batch.
    pub fn keys(&self) -> &[DocumentKey] {
        &self.keys
    }

    /// Number of documents taken.
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    /// True when nothing was waiting.
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Keep the batch taken and hand over the documents.
    pub fn into_documents(self) -> Vec<T> {
        self.documents
    }

    /// Return the batch to the pool so a later checkout picks it up again.
    /// Returns how many documents were released.
    pub async fn release(self) -> Result<u64, StoreError> {
        let released = self
            .checkout
            .repository
            .store()
            .release(T::COLLECTION, &self.keys)
            .await?;
        info!(collection = T::COLLECTION, released, "[checkout.release] batch released");
        Ok(released)
    }
}

impl<D: DocumentStore, T: std::fmt::Debug> std::fmt::Debug for CheckedOut<'_, D, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckedOut")
            .field("keys", &self.keys)
            .field("documents", &self.documents)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::TransactionCoordinator;
    use readmodel_memory::InMemoryStore;
    use serde::{Deserialize, Serialize};
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct RankingChange {
        battle_tag: String,
        rank: u32,
    }

    impl Document for RankingChange {
        const COLLECTION: &'static str = "ranking_changes";

        fn key(&self) -> DocumentKey {
            DocumentKey::try_new(self.battle_tag.clone()).expect("valid document key")
        }
    }

    fn change(tag: &str, rank: u32) -> RankingChange {
        RankingChange {
            battle_tag: tag.to_string(),
            rank,
        }
    }

    fn checkout(store: &InMemoryStore) -> FlagCheckout<InMemoryStore> {
        FlagCheckout::new(Repository::new(Arc::new(TransactionCoordinator::new(
            store.clone(),
        ))))
    }

    #[tokio::test]
    async fn released_batch_is_checked_out_again() {
        let store = InMemoryStore::new();
        let checkout = checkout(&store);
        checkout.publish(&change("a#1", 3)).await.expect("publish");

        let first = checkout.checkout::<RankingChange>().await.expect("checkout");
        assert_eq!(first.release().await.expect("release"), 1);

        let again = checkout.checkout::<RankingChange>().await.expect("checkout");
        assert_eq!(again.into_documents(), vec![change("a#1", 3)]);
    }

    #[tokio::test]
    async fn republishing_a_taken_document_makes_it_available() {
        let store = InMemoryStore::new();
        let checkout = checkout(&store);
        checkout.publish(&change("a#1", 3)).await.expect("publish");
        let _ = checkout
            .checkout::<RankingChange>()
            .await
            .expect("checkout")
            .into_documents();

        checkout.publish(&change("a#1", 2)).await.expect("republish");

        let batch = checkout.checkout::<RankingChange>().await.expect("checkout");
        assert_eq!(batch.documents(), &[change("a#1", 2)]);
    }

    #[tokio::test]
    async fn plain_upserts_are_not_checkout_candidates() {
        let store = InMemoryStore::new();
        let checkout = checkout(&store);
        let repository = Repository::new(Arc::new(TransactionCoordinator::new(store.clone())));
        repository.upsert(&change("b#2", 1)).await.expect("upsert");

        let batch = checkout.checkout::<RankingChange>().await.expect("checkout");

        assert!(batch.is_empty());
    }
}
