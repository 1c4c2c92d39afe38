//! PostgreSQL backend for the readmodel projection engine.
//!
//! `PostgresStore` implements every store trait from `readmodel-types` over
//! one connection pool: the event log, per-consumer checkpoints and the
//! session-aware document store (see `PostgresSession`).
//!
//! Run `PostgresStore::migrate` once before use to create the schema.

use std::time::Duration;

use nutype::nutype;
use readmodel_types::{
    BatchSize, Checkpoint, CheckpointStore, ConsumerName, EventId, EventLog, LoggedEvent,
    Operation, Season, StoreError, StoredEvent, SyncState,
};
use serde_json::Value;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{query, Pool, Postgres, Row};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

mod documents;

pub use documents::PostgresSession;

/// Advisory lock taken by every append so ids become visible in the order
/// they were assigned.
const APPEND_LOCK_ID: i64 = 0x7265_6164_6d6f_6465;

/// Errors raised while setting up a `PostgresStore`.
#[derive(Debug, Error)]
pub enum PostgresError {
    /// The pool could not connect.
    #[error("failed to create postgres connection pool")]
    ConnectionFailed(#[source] sqlx::Error),

    /// A migration failed to apply.
    #[error("failed to apply readmodel migrations")]
    MigrationFailed(#[source] sqlx::migrate::MigrateError),

    /// The health check query failed.
    #[error("postgres ping failed")]
    PingFailed(#[source] sqlx::Error),
}

/// Maximum number of database connections in the pool.
///
/// Must be at least 1, enforced by using NonZeroU32 as the underlying type.
///
/// # Examples
///
/// ```ignore
/// use readmodel_postgres::MaxConnections;
/// use std::num::NonZeroU32;
///
/// let small_pool = MaxConnections::new(NonZeroU32::new(5).expect("5 is non-zero"));
/// ```
#[nutype(derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRef, Into))]
pub struct MaxConnections(std::num::NonZeroU32);

/// Configuration for the `PostgresStore` connection pool.
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    /// Maximum number of connections in the pool (default: 10)
    pub max_connections: MaxConnections,
    /// Timeout for acquiring a connection from the pool (default: 30 seconds)
    pub acquire_timeout: Duration,
    /// Idle timeout for connections in the pool (default: 10 minutes)
    pub idle_timeout: Duration,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        const DEFAULT_MAX_CONNECTIONS: std::num::NonZeroU32 = match std::num::NonZeroU32::new(10) {
            Some(v) => v,
            None => unreachable!(),
        };

        Self {
            max_connections: MaxConnections::new(DEFAULT_MAX_CONNECTIONS),
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600), // 10 minutes
        }
    }
}

/// Event log, checkpoint store and document store over a Postgres pool.
///
/// Clones share the pool.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: Pool<Postgres>,
}

impl PostgresStore {
    /// Connect with the default configuration.
    pub async fn new<S: Into<String>>(connection_string: S) -> Result<Self, PostgresError> {
        Self::with_config(connection_string, PostgresConfig::default()).await
    }

    /// Connect with a custom pool configuration.
    pub async fn with_config<S: Into<String>>(
        connection_string: S,
        config: PostgresConfig,
    ) -> Result<Self, PostgresError> {
        let connection_string = connection_string.into();
        let max_connections: std::num::NonZeroU32 = config.max_connections.into();
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.get())
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(config.idle_timeout)
            .connect(&connection_string)
            .await
            .map_err(PostgresError::ConnectionFailed)?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool, for callers that share one across components.
    pub fn from_pool(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }

    /// Round-trip a trivial query.
    pub async fn ping(&self) -> Result<(), PostgresError> {
        let _ = query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(PostgresError::PingFailed)?;
        Ok(())
    }

    /// Create or upgrade the readmodel tables. Safe to run repeatedly.
    pub async fn migrate(&self) -> Result<(), PostgresError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(PostgresError::MigrationFailed)?;
        info!("[postgres.migrate] schema up to date");
        Ok(())
    }
}

impl EventLog for PostgresStore {
    #[instrument(name = "postgres.load_since", skip(self), fields(stream = E::STREAM))]
    async fn load_since<E: LoggedEvent>(
        &self,
        after: EventId,
        limit: BatchSize,
    ) -> Result<Vec<StoredEvent<E>>, StoreError> {
        let limit = i64::try_from(limit.into_inner()).unwrap_or(i64::MAX);
        if limit == 0 {
            return Ok(Vec::new());
        }

        let rows = query(
            "SELECT id, payload FROM readmodel_events
             WHERE stream = $1 AND id > $2
             ORDER BY id
             LIMIT $3",
        )
        .bind(E::STREAM)
        .bind(to_bigint(after.into_inner(), Operation::LoadEvents)?)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|error| map_sqlx_error(error, Operation::LoadEvents))?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let id = event_id(&row, "id", Operation::LoadEvents)?;
            let payload: Json<Value> = row
                .try_get("payload")
                .map_err(|error| map_sqlx_error(error, Operation::LoadEvents))?;
            let payload = serde_json::from_value(payload.0).map_err(|error| {
                StoreError::Deserialization {
                    key: format!("{}/{id}", E::STREAM),
                    detail: error.to_string(),
                }
            })?;
            events.push(StoredEvent::new(id, payload));
        }

        debug!(after = %after, events = events.len(), "[postgres.load_since] page loaded");
        Ok(events)
    }

    #[instrument(name = "postgres.append", skip(self, payloads), fields(stream = E::STREAM))]
    async fn append<E: LoggedEvent>(&self, payloads: Vec<E>) -> Result<Vec<EventId>, StoreError> {
        if payloads.is_empty() {
            return Ok(Vec::new());
        }

        let bodies = payloads
            .iter()
            .map(|payload| {
                serde_json::to_value(payload).map_err(|error| StoreError::Serialization {
                    key: E::STREAM.to_string(),
                    detail: error.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| map_sqlx_error(error, Operation::BeginTransaction))?;

        // Held until commit: a concurrent append cannot commit a lower id
        // after a reader has already seen a higher one.
        let _ = query("SELECT pg_advisory_xact_lock($1)")
            .bind(APPEND_LOCK_ID)
            .execute(&mut *tx)
            .await
            .map_err(|error| map_sqlx_error(error, Operation::AppendEvents))?;

        let mut ids = Vec::with_capacity(bodies.len());
        for body in bodies {
            let row = query("INSERT INTO readmodel_events (stream, payload) VALUES ($1, $2) RETURNING id")
                .bind(E::STREAM)
                .bind(Json(body))
                .fetch_one(&mut *tx)
                .await
                .map_err(|error| map_sqlx_error(error, Operation::AppendEvents))?;
            ids.push(event_id(&row, "id", Operation::AppendEvents)?);
        }

        tx.commit()
            .await
            .map_err(|error| map_sqlx_error(error, Operation::CommitTransaction))?;

        info!(events = ids.len(), "[postgres.append] events appended");
        Ok(ids)
    }

    async fn last_event_id<E: LoggedEvent>(&self) -> Result<Option<EventId>, StoreError> {
        let row = query("SELECT MAX(id) AS head FROM readmodel_events WHERE stream = $1")
            .bind(E::STREAM)
            .fetch_one(&self.pool)
            .await
            .map_err(|error| map_sqlx_error(error, Operation::LoadEvents))?;
        let head: Option<i64> = row
            .try_get("head")
            .map_err(|error| map_sqlx_error(error, Operation::LoadEvents))?;
        head.map(|head| from_bigint(head, Operation::LoadEvents).map(EventId::new))
            .transpose()
    }

    async fn count_since<E: LoggedEvent>(&self, after: EventId) -> Result<u64, StoreError> {
        let row = query(
            "SELECT COUNT(*) AS pending FROM readmodel_events WHERE stream = $1 AND id > $2",
        )
        .bind(E::STREAM)
        .bind(to_bigint(after.into_inner(), Operation::LoadEvents)?)
        .fetch_one(&self.pool)
        .await
        .map_err(|error| map_sqlx_error(error, Operation::LoadEvents))?;
        let pending: i64 = row
            .try_get("pending")
            .map_err(|error| map_sqlx_error(error, Operation::LoadEvents))?;
        from_bigint(pending, Operation::LoadEvents)
    }
}

impl CheckpointStore for PostgresStore {
    async fn get_last_version(&self, consumer: &ConsumerName) -> Result<Checkpoint, StoreError> {
        let row = query(
            "SELECT consumer, version, season, is_stopped, sync_state
             FROM readmodel_checkpoints WHERE consumer = $1",
        )
        .bind(consumer.as_ref())
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| map_sqlx_error(error, Operation::LoadCheckpoint))?;

        match row {
            Some(row) => checkpoint_from_row(&row, Operation::LoadCheckpoint),
            None => Ok(Checkpoint::initial(consumer.clone())),
        }
    }

    #[instrument(name = "postgres.save_checkpoint", skip(self), fields(consumer = %consumer))]
    async fn save_last_version(
        &self,
        consumer: &ConsumerName,
        version: EventId,
        season: Season,
        is_stopped: bool,
    ) -> Result<(), StoreError> {
        let attempted = to_bigint(version.into_inner(), Operation::SaveCheckpoint)?;

        // The conditional update refuses to move backwards in one statement,
        // so two writers racing on the same consumer cannot regress it.
        let saved = query(
            "INSERT INTO readmodel_checkpoints (consumer, version, season, is_stopped)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (consumer) DO UPDATE
                SET version = EXCLUDED.version,
                    season = EXCLUDED.season,
                    is_stopped = EXCLUDED.is_stopped,
                    updated_at = now()
                WHERE readmodel_checkpoints.version <= EXCLUDED.version
             RETURNING version",
        )
        .bind(consumer.as_ref())
        .bind(attempted)
        .bind(season.into_inner())
        .bind(is_stopped)
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| map_sqlx_error(error, Operation::SaveCheckpoint))?;

        if saved.is_some() {
            return Ok(());
        }

        let current = self.get_last_version(consumer).await?.version;
        warn!(
            current = %current,
            attempted = %version,
            "[postgres.save_checkpoint] checkpoint regression rejected"
        );
        Err(StoreError::CheckpointRegression {
            consumer: consumer.clone(),
            current,
            attempted: version,
        })
    }

    async fn save_sync_state(
        &self,
        consumer: &ConsumerName,
        state: SyncState,
    ) -> Result<(), StoreError> {
        let _ = query(
            "INSERT INTO readmodel_checkpoints (consumer, sync_state)
             VALUES ($1, $2)
             ON CONFLICT (consumer) DO UPDATE
                SET sync_state = EXCLUDED.sync_state,
                    updated_at = now()",
        )
        .bind(consumer.as_ref())
        .bind(Json(state.into_value()))
        .execute(&self.pool)
        .await
        .map_err(|error| map_sqlx_error(error, Operation::SaveSyncState))?;
        Ok(())
    }

    async fn list_checkpoints(&self) -> Result<Vec<Checkpoint>, StoreError> {
        let rows = query(
            "SELECT consumer, version, season, is_stopped, sync_state
             FROM readmodel_checkpoints ORDER BY consumer COLLATE \"C\"",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|error| map_sqlx_error(error, Operation::ListCheckpoints))?;

        rows.iter()
            .map(|row| checkpoint_from_row(row, Operation::ListCheckpoints))
            .collect()
    }
}

fn checkpoint_from_row(row: &PgRow, operation: Operation) -> Result<Checkpoint, StoreError> {
    let raw: String = row
        .try_get("consumer")
        .map_err(|error| map_sqlx_error(error, operation))?;
    let consumer = ConsumerName::try_new(raw.clone()).map_err(|error| {
        StoreError::Deserialization {
            key: raw,
            detail: error.to_string(),
        }
    })?;
    let season: i32 = row
        .try_get("season")
        .map_err(|error| map_sqlx_error(error, operation))?;
    let is_stopped: bool = row
        .try_get("is_stopped")
        .map_err(|error| map_sqlx_error(error, operation))?;
    let sync_state: Option<Json<Value>> = row
        .try_get("sync_state")
        .map_err(|error| map_sqlx_error(error, operation))?;

    Ok(Checkpoint {
        consumer,
        version: event_id(row, "version", operation)?,
        season: Season::new(season),
        is_stopped,
        sync_state: sync_state.map(|state| SyncState::new(state.0)),
    })
}

fn event_id(row: &PgRow, column: &str, operation: Operation) -> Result<EventId, StoreError> {
    let raw: i64 = row
        .try_get(column)
        .map_err(|error| map_sqlx_error(error, operation))?;
    from_bigint(raw, operation).map(EventId::new)
}

pub(crate) fn to_bigint(value: u64, operation: Operation) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| {
        error!(value, operation = %operation, "[postgres.range] value does not fit in BIGINT");
        StoreError::StoreFailure { operation }
    })
}

pub(crate) fn from_bigint(value: i64, operation: Operation) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| {
        error!(value, operation = %operation, "[postgres.range] negative BIGINT in unsigned column");
        StoreError::StoreFailure { operation }
    })
}

pub(crate) fn map_sqlx_error(error: sqlx::Error, operation: Operation) -> StoreError {
    if let sqlx::Error::Database(db_error) = &error {
        let code = db_error.code();
        // 40001: serialization failure, 40P01: deadlock detected
        if matches!(code.as_deref(), Some("40001" | "40P01")) {
            warn!(
                error = %db_error,
                operation = %operation,
                "[postgres.transient] transaction lost a race, retry on the next tick"
            );
            return StoreError::StoreFailure { operation };
        }
    }

    error!(
        error = %error,
        operation = %operation,
        "[postgres.database_error] database operation failed"
    );
    StoreError::StoreFailure { operation }
}
