//! Transaction coordinator with deferred post-commit callbacks.
//!
//! A coordinator owns at most one transaction at a time. The lifecycle is:
//!
//! 1. `initialize_transaction` opens a store session and returns an id
//! 2. `begin_transaction` starts the transaction on that session
//! 3. repositories pick the session up through `current_session`
//! 4. `complete` marks the intent to commit
//! 5. `dispose` commits if completed, aborts otherwise
//!
//! Success handlers registered while the transaction is active run in FIFO
//! order after a successful commit and are discarded on abort.
//!
//! `TransactionScope` wraps steps 1, 2, 4 and 5 so that every exit path
//! resolves the transaction exactly once.

use crate::errors::{HandlerError, TransactionError};
use futures::future::{BoxFuture, FutureExt};
use nutype::nutype;
use parking_lot::Mutex;
use readmodel_types::{DocumentSession, DocumentStore};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Identifier generated for every transaction.
#[nutype(derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display))]
pub struct TransactionId(Uuid);

impl TransactionId {
    fn generate() -> Self {
        Self::new(Uuid::now_v7())
    }
}

/// Session handle shared between the coordinator and repositories.
pub type SharedSession<S> = Arc<tokio::sync::Mutex<S>>;

type SuccessHandler = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), HandlerError>> + Send>;

struct ActiveTransaction<S> {
    id: TransactionId,
    session: SharedSession<S>,
    started: bool,
    completed: bool,
    on_success: Vec<SuccessHandler>,
}

/// Coordinates one transaction at a time over a document store.
pub struct TransactionCoordinator<D: DocumentStore> {
    store: D,
    current: Mutex<Option<ActiveTransaction<D::Session>>>,
}

impl<D: DocumentStore> TransactionCoordinator<D> {
    /// Coordinator with no transaction open.
    pub fn new(store: D) -> Self {
        Self {
            store,
            current: Mutex::new(None),
        }
    }

    /// The underlying document store.
    pub fn store(&self) -> &D {
        &self.store
    }

    /// Open a session for a new transaction.
    ///
    /// Fails with `AlreadyActive` while another transaction exists.
    #[instrument(name = "transaction.initialize", skip(self))]
    pub async fn initialize_transaction(&self) -> Result<TransactionId, TransactionError> {
        self.ensure_idle()?;
        let session = self.store.start_session().await?;

        let mut current = self.current.lock();
        if let Some(active) = current.as_ref() {
            return Err(TransactionError::AlreadyActive(active.id));
        }
        let id = TransactionId::generate();
        *current = Some(ActiveTransaction {
            id,
            session: Arc::new(tokio::sync::Mutex::new(session)),
            started: false,
            completed: false,
            on_success: Vec::new(),
        });
        debug!(transaction = %id, "[transaction.initialize] session opened");
        Ok(id)
    }

    /// Start the transaction on its session.
    #[instrument(name = "transaction.begin", skip(self), fields(transaction = %id))]
    pub async fn begin_transaction(&self, id: TransactionId) -> Result<(), TransactionError> {
        let session = {
            let current = self.current.lock();
            let active = Self::matching(&current, id)?;
            if active.started {
                return Err(TransactionError::AlreadyActive(id));
            }
            Arc::clone(&active.session)
        };

        session.lock().await.begin().await?;

        let mut current = self.current.lock();
        match current.as_mut() {
            Some(active) if active.id == id => {
                active.started = true;
                debug!("[transaction.begin] transaction started");
                Ok(())
            }
            _ => Err(TransactionError::UnknownTransaction(id)),
        }
    }

    /// Mark the transaction for commit on dispose.
    pub fn complete(&self, id: TransactionId) -> Result<(), TransactionError> {
        let mut current = self.current.lock();
        let active = Self::matching_mut(&mut current, id)?;
        if !active.started {
            return Err(TransactionError::NotStarted(id));
        }
        active.completed = true;
        Ok(())
    }

    /// Commit the transaction, then run its success handlers in order.
    ///
    /// The transaction is resolved whether or not the commit succeeds. A
    /// handler failure is reported as `PostCommitHandler`; the commit stands
    /// and the remaining handlers are skipped.
    pub async fn commit_transaction(&self, id: TransactionId) -> Result<(), TransactionError> {
        let active = self.take_started(id)?;
        Self::commit_active(active).await
    }

    /// Abort the transaction, discarding its writes and success handlers.
    pub async fn abort_transaction(&self, id: TransactionId) -> Result<(), TransactionError> {
        let active = self.take_started(id)?;
        Self::abort_active(active).await
    }

    /// Queue `handler` to run after the active transaction commits.
    ///
    /// With no active transaction, the handler runs right away when
    /// `execute_immediately_if_no_transaction` is set and is rejected with
    /// `NoActiveTransaction` otherwise.
    pub async fn register_on_success<F, Fut>(
        &self,
        handler: F,
        execute_immediately_if_no_transaction: bool,
    ) -> Result<(), TransactionError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let handler: SuccessHandler = Box::new(move || handler().boxed());
        let immediate = {
            let mut current = self.current.lock();
            match current.as_mut() {
                Some(active) if active.started => {
                    active.on_success.push(handler);
                    None
                }
                _ => Some(handler),
            }
        };

        match immediate {
            None => Ok(()),
            Some(handler) if execute_immediately_if_no_transaction => {
                handler().await.map_err(TransactionError::Handler)
            }
            Some(_) => Err(TransactionError::NoActiveTransaction),
        }
    }

    /// Session of the started transaction, if any.
    pub fn current_session(&self) -> Option<SharedSession<D::Session>> {
        self.current
            .lock()
            .as_ref()
            .filter(|active| active.started)
            .map(|active| Arc::clone(&active.session))
    }

    /// True between `begin_transaction` and commit or abort.
    pub fn is_transaction_active(&self) -> bool {
        self.current
            .lock()
            .as_ref()
            .is_some_and(|active| active.started)
    }

    /// Resolve any outstanding transaction: commit if completed, abort if
    /// started, drop the session otherwise. A no-op when there is none.
    pub async fn dispose(&self) -> Result<(), TransactionError> {
        let outstanding = self.current.lock().take();
        let Some(active) = outstanding else {
            return Ok(());
        };
        Self::resolve(active).await
    }

    /// Initialize and begin a transaction wrapped in a scope guard.
    pub async fn scope(&self) -> Result<TransactionScope<'_, D>, TransactionError> {
        let id = self.initialize_transaction().await?;
        let scope = TransactionScope {
            coordinator: self,
            id,
            resolved: false,
        };
        self.begin_transaction(id).await?;
        Ok(scope)
    }

    /// Run `work` inside a transaction that commits if it returns `Ok` and
    /// aborts if it returns `Err`.
    pub async fn run_in_transaction<T, E, F, Fut>(&self, work: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<TransactionError>,
    {
        let mut scope = self.scope().await?;
        match work().await {
            Ok(value) => {
                scope.complete()?;
                scope.dispose().await?;
                Ok(value)
            }
            Err(error) => {
                if let Err(abort_error) = scope.dispose().await {
                    warn!(error = %abort_error, "[transaction.run] abort after failure also failed");
                }
                Err(error)
            }
        }
    }

    fn ensure_idle(&self) -> Result<(), TransactionError> {
        match self.current.lock().as_ref() {
            Some(active) => Err(TransactionError::AlreadyActive(active.id)),
            None => Ok(()),
        }
    }

    fn matching(
        current: &Option<ActiveTransaction<D::Session>>,
        id: TransactionId,
    ) -> Result<&ActiveTransaction<D::Session>, TransactionError> {
        match current {
            Some(active) if active.id == id => Ok(active),
            Some(_) => Err(TransactionError::UnknownTransaction(id)),
            None => Err(TransactionError::NoActiveTransaction),
        }
    }

    fn matching_mut(
        current: &mut Option<ActiveTransaction<D::Session>>,
        id: TransactionId,
    ) -> Result<&mut ActiveTransaction<D::Session>, TransactionError> {
        match current {
            Some(active) if active.id == id => Ok(active),
            Some(_) => Err(TransactionError::UnknownTransaction(id)),
            None => Err(TransactionError::NoActiveTransaction),
        }
    }

    /// Detach the started transaction `id` from the coordinator.
    fn take_started(
        &self,
        id: TransactionId,
    ) -> Result<ActiveTransaction<D::Session>, TransactionError> {
        let mut current = self.current.lock();
        let active = Self::matching(&current, id)?;
        if !active.started {
            return Err(TransactionError::NotStarted(id));
        }
        current.take().ok_or(TransactionError::NoActiveTransaction)
    }

    /// Detach transaction `id` whatever its state.
    fn take(&self, id: TransactionId) -> Option<ActiveTransaction<D::Session>> {
        let mut current = self.current.lock();
        match current.as_ref() {
            Some(active) if active.id == id => current.take(),
            _ => None,
        }
    }

    async fn resolve(active: ActiveTransaction<D::Session>) -> Result<(), TransactionError> {
        match (active.started, active.completed) {
            (true, true) => Self::commit_active(active).await,
            (true, false) => Self::abort_active(active).await,
            (false, _) => {
                debug!(transaction = %active.id, "[transaction.dispose] never started, session dropped");
                Ok(())
            }
        }
    }

    async fn commit_active(active: ActiveTransaction<D::Session>) -> Result<(), TransactionError> {
        let ActiveTransaction {
            id,
            session,
            on_success,
            ..
        } = active;

        if let Err(error) = session.lock().await.commit().await {
            warn!(transaction = %id, error = %error, "[transaction.commit] commit failed, nothing applied");
            return Err(error.into());
        }
        info!(
            transaction = %id,
            handlers = on_success.len(),
            "[transaction.commit] transaction committed"
        );

        for (index, handler) in on_success.into_iter().enumerate() {
            if let Err(source) = handler().await {
                error!(
                    transaction = %id,
                    index,
                    error = %source,
                    "[transaction.commit] post-commit handler failed"
                );
                return Err(TransactionError::PostCommitHandler {
                    transaction: id,
                    index,
                    source,
                });
            }
        }
        Ok(())
    }

    async fn abort_active(active: ActiveTransaction<D::Session>) -> Result<(), TransactionError> {
        let discarded = active.on_success.len();
        active.session.lock().await.abort().await?;
        info!(
            transaction = %active.id,
            discarded_handlers = discarded,
            "[transaction.abort] transaction aborted"
        );
        Ok(())
    }
}

impl<D: DocumentStore + std::fmt::Debug> std::fmt::Debug for TransactionCoordinator<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let current = self.current.lock();
        f.debug_struct("TransactionCoordinator")
            .field("store", &self.store)
            .field("transaction", &current.as_ref().map(|active| active.id))
            .finish()
    }
}

/// Guard over a started transaction.
///
/// `dispose` commits when `complete` was called and aborts otherwise.
/// Dropping an unresolved scope discards the transaction by dropping its
/// session, which rolls back every write made through it.
#[must_use = "a dropped scope aborts its transaction"]
pub struct TransactionScope<'a, D: DocumentStore> {
    coordinator: &'a TransactionCoordinator<D>,
    id: TransactionId,
    resolved: bool,
}

impl<'a, D: DocumentStore> TransactionScope<'a, D> {
    /// Id of the transaction this scope resolves.
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Mark the transaction for commit.
    pub fn complete(&mut self) -> Result<(), TransactionError> {
        self.coordinator.complete(self.id)
    }

    /// Commit or abort, depending on whether `complete` was called.
    pub async fn dispose(mut self) -> Result<(), TransactionError> {
        self.resolved = true;
        match self.coordinator.take(self.id) {
            Some(active) => TransactionCoordinator::<D>::resolve(active).await,
            None => Ok(()),
        }
    }
}

impl<D: DocumentStore> Drop for TransactionScope<'_, D> {
    fn drop(&mut self) {
        if self.resolved {
            return;
        }
        if self.coordinator.take(self.id).is_some() {
            warn!(transaction = %self.id, "[transaction.scope] scope dropped unresolved, transaction discarded");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use readmodel_memory::InMemoryStore;
    use readmodel_types::{DocumentKey, StoredDocument};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn document(key: &str) -> StoredDocument {
        StoredDocument {
            key: DocumentKey::try_new(key).expect("valid document key"),
            version: 0,
            body: serde_json::json!({"key": key}),
        }
    }

    async fn write_through_session(coordinator: &TransactionCoordinator<InMemoryStore>, key: &str) {
        let session = coordinator.current_session().expect("active session");
        let mut session = session.lock().await;
        coordinator
            .store()
            .upsert(Some(&mut *session), "docs", document(key))
            .await
            .expect("staged write");
    }

    #[tokio::test]
    async fn second_initialize_while_active_fails() {
        let coordinator = TransactionCoordinator::new(InMemoryStore::new());
        let id = coordinator.initialize_transaction().await.expect("first");

        let error = coordinator
            .initialize_transaction()
            .await
            .expect_err("second must fail");

        assert!(matches!(error, TransactionError::AlreadyActive(active) if active == id));
    }

    #[tokio::test]
    async fn double_begin_fails_with_state_error() {
        let coordinator = TransactionCoordinator::new(InMemoryStore::new());
        let id = coordinator.initialize_transaction().await.expect("initialize");
        coordinator.begin_transaction(id).await.expect("begin");

        let error = coordinator.begin_transaction(id).await.expect_err("double begin");

        assert!(matches!(error, TransactionError::AlreadyActive(_)));
    }

    #[tokio::test]
    async fn commit_without_transaction_is_rejected() {
        let coordinator = TransactionCoordinator::new(InMemoryStore::new());
        let stray = TransactionId::generate();

        let error = coordinator.commit_transaction(stray).await.expect_err("nothing active");

        assert!(matches!(error, TransactionError::NoActiveTransaction));
    }

    #[tokio::test]
    async fn commit_before_begin_is_rejected() {
        let coordinator = TransactionCoordinator::new(InMemoryStore::new());
        let id = coordinator.initialize_transaction().await.expect("initialize");

        let error = coordinator.commit_transaction(id).await.expect_err("not started");

        assert!(matches!(error, TransactionError::NotStarted(_)));
        assert!(!coordinator.is_transaction_active());
    }

    #[tokio::test]
    async fn dispose_without_transaction_is_noop() {
        let coordinator = TransactionCoordinator::new(InMemoryStore::new());

        coordinator.dispose().await.expect("no-op");

        assert!(!coordinator.is_transaction_active());
    }

    #[tokio::test]
    async fn dispose_commits_completed_transaction() {
        let store = InMemoryStore::new();
        let coordinator = TransactionCoordinator::new(store.clone());
        let id = coordinator.initialize_transaction().await.expect("initialize");
        coordinator.begin_transaction(id).await.expect("begin");
        write_through_session(&coordinator, "a").await;
        coordinator.complete(id).expect("complete");

        coordinator.dispose().await.expect("commit");

        assert_eq!(store.document_count("docs"), 1);
    }

    #[tokio::test]
    async fn dispose_without_complete_aborts() {
        let store = InMemoryStore::new();
        let coordinator = TransactionCoordinator::new(store.clone());
        let id = coordinator.initialize_transaction().await.expect("initialize");
        coordinator.begin_transaction(id).await.expect("begin");
        write_through_session(&coordinator, "a").await;

        coordinator.dispose().await.expect("abort");

        assert_eq!(store.document_count("docs"), 0);
        assert!(coordinator.initialize_transaction().await.is_ok());
    }

    #[tokio::test]
    async fn handler_without_transaction_runs_immediately_when_allowed() {
        let coordinator = TransactionCoordinator::new(InMemoryStore::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        coordinator
            .register_on_success(
                move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
                true,
            )
            .await
            .expect("runs immediately");

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn handler_without_transaction_is_rejected_when_not_allowed() {
        let coordinator = TransactionCoordinator::new(InMemoryStore::new());

        let error = coordinator
            .register_on_success(|| async { Ok(()) }, false)
            .await
            .expect_err("rejected");

        assert!(matches!(error, TransactionError::NoActiveTransaction));
    }

    #[tokio::test]
    async fn failing_handler_is_reported_after_commit() {
        let store = InMemoryStore::new();
        let coordinator = TransactionCoordinator::new(store.clone());
        let mut scope = coordinator.scope().await.expect("scope");
        write_through_session(&coordinator, "a").await;
        coordinator
            .register_on_success(|| async { Err::<(), HandlerError>("webhook down".into()) }, false)
            .await
            .expect("queued");
        scope.complete().expect("complete");

        let error = scope.dispose().await.expect_err("handler fails");

        assert!(matches!(error, TransactionError::PostCommitHandler { index: 0, .. }));
        assert_eq!(store.document_count("docs"), 1);
    }

    #[tokio::test]
    async fn dropped_scope_discards_transaction() {
        let store = InMemoryStore::new();
        let coordinator = TransactionCoordinator::new(store.clone());
        {
            let _scope = coordinator.scope().await.expect("scope");
            write_through_session(&coordinator, "a").await;
        }

        assert!(!coordinator.is_transaction_active());
        assert_eq!(store.document_count("docs"), 0);
    }

    #[tokio::test]
    async fn run_in_transaction_aborts_on_error() {
        let store = InMemoryStore::new();
        let coordinator = TransactionCoordinator::new(store.clone());

        let result: Result<(), TransactionError> = coordinator
            .run_in_transaction(|| async {
                write_through_session(&coordinator, "a").await;
                Err(TransactionError::NoActiveTransaction)
            })
            .await;

        assert!(result.is_err());
        assert_eq!(store.document_count("docs"), 0);
        assert!(!coordinator.is_transaction_active());
    }
}
