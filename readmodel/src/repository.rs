//! Typed document access that follows the ambient transaction.
//!
//! Every call checks the coordinator for a started transaction and, if there
//! is one, routes the operation through its session. Handler code never has
//! to branch on whether it runs inside a transaction.

use crate::transaction::TransactionCoordinator;
use readmodel_types::{
    Document, DocumentKey, DocumentStore, StoreError, StoredDocument, Versioned,
};
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;
use tracing::instrument;

/// Typed documents over a coordinator's store; clones share the coordinator.
pub struct Repository<D: DocumentStore> {
    coordinator: Arc<TransactionCoordinator<D>>,
}

impl<D: DocumentStore> Clone for Repository<D> {
    fn clone(&self) -> Self {
        Self {
            coordinator: Arc::clone(&self.coordinator),
        }
    }
}

impl<D: DocumentStore> Repository<D> {
    /// Repository following `coordinator`'s transactions.
    pub fn new(coordinator: Arc<TransactionCoordinator<D>>) -> Self {
        Self { coordinator }
    }

    /// The coordinator whose session this repository follows.
    pub fn coordinator(&self) -> &Arc<TransactionCoordinator<D>> {
        &self.coordinator
    }

    pub(crate) fn store(&self) -> &D {
        self.coordinator.store()
    }

    async fn ambient_session(&self) -> Option<OwnedMutexGuard<D::Session>> {
        match self.coordinator.current_session() {
            Some(session) => Some(session.lock_owned().await),
            None => None,
        }
    }

    /// Load a document by key.
    #[instrument(name = "repository.load", skip(self), fields(collection = T::COLLECTION))]
    pub async fn load<T: Document>(&self, key: &DocumentKey) -> Result<Option<T>, StoreError> {
        self.load_stored::<T>(key)
            .await?
            .map(StoredDocument::into_document)
            .transpose()
    }

    /// Load a versioned document, setting its in-memory version from the
    /// stored one.
    pub async fn load_versioned<T: Versioned>(
        &self,
        key: &DocumentKey,
    ) -> Result<Option<T>, StoreError> {
        let Some(stored) = self.load_stored::<T>(key).await? else {
            return Ok(None);
        };
        let version = stored.version;
        let mut document: T = stored.into_document()?;
        document.set_version(version);
        Ok(Some(document))
    }

    /// Insert or replace a document by key.
    #[instrument(name = "repository.upsert", skip_all, fields(collection = T::COLLECTION))]
    pub async fn upsert<T: Document>(&self, document: &T) -> Result<(), StoreError> {
        let stored = StoredDocument::from_document(document, 0)?;
        self.upsert_stored::<T>(stored).await
    }

    /// Insert or replace a versioned document, storing its current version.
    pub async fn upsert_versioned<T: Versioned>(&self, document: &T) -> Result<(), StoreError> {
        let stored = StoredDocument::from_document(document, document.version())?;
        self.upsert_stored::<T>(stored).await
    }

    #[instrument(name = "repository.delete", skip(self), fields(collection = T::COLLECTION))]
    /// Delete by key. Returns whether a document existed.
    pub async fn delete<T: Document>(&self, key: &DocumentKey) -> Result<bool, StoreError> {
        let mut session = self.ambient_session().await;
        self.store()
            .delete(session.as_deref_mut(), T::COLLECTION, key)
            .await
    }

    pub(crate) async fn load_stored<T: Document>(
        &self,
        key: &DocumentKey,
    ) -> Result<Option<StoredDocument>, StoreError> {
        let mut session = self.ambient_session().await;
        self.store()
            .get(session.as_deref_mut(), T::COLLECTION, key)
            .await
    }

    async fn upsert_stored<T: Document>(&self, stored: StoredDocument) -> Result<(), StoreError> {
        let mut session = self.ambient_session().await;
        self.store()
            .upsert(session.as_deref_mut(), T::COLLECTION, stored)
            .await
    }

    pub(crate) async fn replace_if_version<T: Document>(
        &self,
        stored: StoredDocument,
        expected_version: u64,
    ) -> Result<u64, StoreError> {
        let mut session = self.ambient_session().await;
        self.store()
            .replace_if_version(session.as_deref_mut(), T::COLLECTION, stored, expected_version)
            .await
    }

    pub(crate) async fn insert_unsynced<T: Document>(
        &self,
        stored: StoredDocument,
    ) -> Result<(), StoreError> {
        let mut session = self.ambient_session().await;
        self.store()
            .insert_unsynced(session.as_deref_mut(), T::COLLECTION, stored)
            .await
    }
}

impl<D: DocumentStore> std::fmt::Debug for Repository<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("in_transaction", &self.coordinator.is_transaction_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use readmodel_memory::InMemoryStore;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct HeroStats {
        hero: String,
        picks: u32,
    }

    impl Document for HeroStats {
        const COLLECTION: &'static str = "hero_stats";

        fn key(&self) -> DocumentKey {
            DocumentKey::try_new(self.hero.clone()).expect("valid document key")
        }
    }

    fn hero(name: &str, picks: u32) -> HeroStats {
        HeroStats {
            hero: name.to_string(),
            picks,
        }
    }

    #[tokio::test]
    async fn writes_outside_transaction_are_visible_immediately() {
        let store = InMemoryStore::new();
        let repository = Repository::new(Arc::new(TransactionCoordinator::new(store.clone())));

        repository.upsert(&hero("archmage", 3)).await.expect("upsert");

        let loaded: Option<HeroStats> = repository
            .load(&DocumentKey::try_new("archmage").expect("valid document key"))
            .await
            .expect("load");
        assert_eq!(loaded, Some(hero("archmage", 3)));
    }

    #[tokio::test]
    async fn writes_inside_transaction_follow_the_session() {
        let store = InMemoryStore::new();
        let coordinator = Arc::new(TransactionCoordinator::new(store.clone()));
        let repository = Repository::new(Arc::clone(&coordinator));
        let key = DocumentKey::try_new("blademaster").expect("valid document key");

        let scope = coordinator.scope().await.expect("scope");
        repository.upsert(&hero("blademaster", 1)).await.expect("staged");
        let own_view: Option<HeroStats> = repository.load(&key).await.expect("load");
        assert_eq!(own_view, Some(hero("blademaster", 1)));
        assert_eq!(store.document_count(HeroStats::COLLECTION), 0);

        scope.dispose().await.expect("abort");

        let after: Option<HeroStats> = repository.load(&key).await.expect("load");
        assert_eq!(after, None);
    }

    #[tokio::test]
    async fn delete_reports_whether_document_existed() {
        let repository = Repository::new(Arc::new(TransactionCoordinator::new(InMemoryStore::new())));
        let key = DocumentKey::try_new("farseer").expect("valid document key");
        repository.upsert(&hero("farseer", 2)).await.expect("upsert");

        assert!(repository.delete::<HeroStats>(&key).await.expect("delete"));
        assert!(!repository.delete::<HeroStats>(&key).await.expect("delete"));
    }
}
