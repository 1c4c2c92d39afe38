//! Document store over `readmodel_documents`.

use readmodel_types::{
    DocumentKey, DocumentSession, DocumentStore, Operation, StoreError, StoredDocument,
};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{query, Pool, Postgres, Row, Transaction};
use tracing::{debug, info, instrument};

use crate::{from_bigint, map_sqlx_error, to_bigint, PostgresStore};

/// Session over a `PostgresStore`.
///
/// `begin` opens a database transaction; every operation passed this
/// session then runs inside it. Dropping the session with the transaction
/// still open rolls it back.
#[derive(Debug)]
pub struct PostgresSession {
    pool: Pool<Postgres>,
    tx: Option<Transaction<'static, Postgres>>,
}

impl PostgresSession {
    fn transaction(&mut self) -> Option<&mut Transaction<'static, Postgres>> {
        self.tx.as_mut()
    }
}

impl DocumentSession for PostgresSession {
    async fn begin(&mut self) -> Result<(), StoreError> {
        if self.tx.is_some() {
            return Err(StoreError::SessionState {
                detail: "transaction already in progress".to_string(),
            });
        }
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|error| map_sqlx_error(error, Operation::BeginTransaction))?;
        self.tx = Some(tx);
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let tx = self.tx.take().ok_or_else(|| StoreError::SessionState {
            detail: "commit without a transaction".to_string(),
        })?;
        tx.commit()
            .await
            .map_err(|error| map_sqlx_error(error, Operation::CommitTransaction))?;
        debug!("[postgres.commit] transaction committed");
        Ok(())
    }

    async fn abort(&mut self) -> Result<(), StoreError> {
        let tx = self.tx.take().ok_or_else(|| StoreError::SessionState {
            detail: "abort without a transaction".to_string(),
        })?;
        tx.rollback()
            .await
            .map_err(|error| map_sqlx_error(error, Operation::AbortTransaction))?;
        debug!("[postgres.abort] transaction rolled back");
        Ok(())
    }

    fn is_in_transaction(&self) -> bool {
        self.tx.is_some()
    }
}

/// Run `$body` against the session's open transaction, or the pool when
/// there is none.
macro_rules! on_session {
    ($pool:expr, $session:expr, |$executor:ident| $body:expr) => {
        match $session.and_then(PostgresSession::transaction) {
            Some(tx) => {
                let $executor = &mut **tx;
                $body
            }
            None => {
                let $executor = $pool;
                $body
            }
        }
    };
}

impl DocumentStore for PostgresStore {
    type Session = PostgresSession;

    async fn start_session(&self) -> Result<Self::Session, StoreError> {
        Ok(PostgresSession {
            pool: self.pool().clone(),
            tx: None,
        })
    }

    async fn get(
        &self,
        session: Option<&mut Self::Session>,
        collection: &str,
        key: &DocumentKey,
    ) -> Result<Option<StoredDocument>, StoreError> {
        let statement = "SELECT key, version, body FROM readmodel_documents
                         WHERE collection = $1 AND key = $2";
        let row = on_session!(self.pool(), session, |executor| {
            query(statement)
                .bind(collection)
                .bind(key.as_ref())
                .fetch_optional(executor)
                .await
        })
        .map_err(|error| map_sqlx_error(error, Operation::ReadDocument))?;

        row.map(|row| document_from_row(&row, Operation::ReadDocument))
            .transpose()
    }

    async fn upsert(
        &self,
        session: Option<&mut Self::Session>,
        collection: &str,
        document: StoredDocument,
    ) -> Result<(), StoreError> {
        // The checkout flag is left as it was.
        let statement = "INSERT INTO readmodel_documents (collection, key, version, body)
                         VALUES ($1, $2, $3, $4)
                         ON CONFLICT (collection, key) DO UPDATE
                            SET version = EXCLUDED.version,
                                body = EXCLUDED.body,
                                updated_at = now()";
        let version = to_bigint(document.version, Operation::WriteDocument)?;
        let _ = on_session!(self.pool(), session, |executor| {
            query(statement)
                .bind(collection)
                .bind(document.key.as_ref())
                .bind(version)
                .bind(Json(&document.body))
                .execute(executor)
                .await
        })
        .map_err(|error| map_sqlx_error(error, Operation::WriteDocument))?;
        Ok(())
    }

    async fn replace_if_version(
        &self,
        session: Option<&mut Self::Session>,
        collection: &str,
        document: StoredDocument,
        expected_version: u64,
    ) -> Result<u64, StoreError> {
        let statement = "UPDATE readmodel_documents
                         SET version = $3, body = $4, updated_at = now()
                         WHERE collection = $1 AND key = $2 AND version = $5";
        let version = to_bigint(document.version, Operation::WriteDocument)?;
        let expected = to_bigint(expected_version, Operation::WriteDocument)?;
        let result = on_session!(self.pool(), session, |executor| {
            query(statement)
                .bind(collection)
                .bind(document.key.as_ref())
                .bind(version)
                .bind(Json(&document.body))
                .bind(expected)
                .execute(executor)
                .await
        })
        .map_err(|error| map_sqlx_error(error, Operation::WriteDocument))?;
        Ok(result.rows_affected())
    }

    async fn delete(
        &self,
        session: Option<&mut Self::Session>,
        collection: &str,
        key: &DocumentKey,
    ) -> Result<bool, StoreError> {
        let statement = "DELETE FROM readmodel_documents WHERE collection = $1 AND key = $2";
        let result = on_session!(self.pool(), session, |executor| {
            query(statement)
                .bind(collection)
                .bind(key.as_ref())
                .execute(executor)
                .await
        })
        .map_err(|error| map_sqlx_error(error, Operation::DeleteDocument))?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_unsynced(
        &self,
        session: Option<&mut Self::Session>,
        collection: &str,
        document: StoredDocument,
    ) -> Result<(), StoreError> {
        let statement = "INSERT INTO readmodel_documents (collection, key, version, body, was_synced_just_now)
                         VALUES ($1, $2, $3, $4, FALSE)
                         ON CONFLICT (collection, key) DO UPDATE
                            SET version = EXCLUDED.version,
                                body = EXCLUDED.body,
                                was_synced_just_now = FALSE,
                                updated_at = now()";
        let version = to_bigint(document.version, Operation::WriteDocument)?;
        let _ = on_session!(self.pool(), session, |executor| {
            query(statement)
                .bind(collection)
                .bind(document.key.as_ref())
                .bind(version)
                .bind(Json(&document.body))
                .execute(executor)
                .await
        })
        .map_err(|error| map_sqlx_error(error, Operation::WriteDocument))?;
        Ok(())
    }

    #[instrument(name = "postgres.checkout", skip(self))]
    async fn checkout_unsynced(&self, collection: &str) -> Result<Vec<StoredDocument>, StoreError> {
        // SKIP LOCKED lets concurrent checkouts split the waiting set instead
        // of blocking on each other; each row is flipped by exactly one of them.
        let rows = query(
            "UPDATE readmodel_documents AS doc
             SET was_synced_just_now = TRUE, updated_at = now()
             FROM (
                SELECT collection, key FROM readmodel_documents
                WHERE collection = $1 AND was_synced_just_now = FALSE
                FOR UPDATE SKIP LOCKED
             ) AS waiting
             WHERE doc.collection = waiting.collection AND doc.key = waiting.key
             RETURNING doc.key, doc.version, doc.body",
        )
        .bind(collection)
        .fetch_all(self.pool())
        .await
        .map_err(|error| map_sqlx_error(error, Operation::Checkout))?;

        let mut taken = rows
            .iter()
            .map(|row| document_from_row(row, Operation::Checkout))
            .collect::<Result<Vec<_>, _>>()?;
        taken.sort_by(|a, b| a.key.cmp(&b.key));
        info!(taken = taken.len(), "[postgres.checkout] flipped unsynced documents");
        Ok(taken)
    }

    async fn release(&self, collection: &str, keys: &[DocumentKey]) -> Result<u64, StoreError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let keys: Vec<String> = keys.iter().map(ToString::to_string).collect();
        let result = query(
            "UPDATE readmodel_documents
             SET was_synced_just_now = FALSE, updated_at = now()
             WHERE collection = $1 AND key = ANY($2) AND was_synced_just_now = TRUE",
        )
        .bind(collection)
        .bind(keys)
        .execute(self.pool())
        .await
        .map_err(|error| map_sqlx_error(error, Operation::Release))?;
        Ok(result.rows_affected())
    }
}

fn document_from_row(row: &PgRow, operation: Operation) -> Result<StoredDocument, StoreError> {
    let raw: String = row
        .try_get("key")
        .map_err(|error| map_sqlx_error(error, operation))?;
    let key = DocumentKey::try_new(raw.clone()).map_err(|error| StoreError::Deserialization {
        key: raw,
        detail: error.to_string(),
    })?;
    let version: i64 = row
        .try_get("version")
        .map_err(|error| map_sqlx_error(error, operation))?;
    let body: Json<Value> = row
        .try_get("body")
        .map_err(|error| map_sqlx_error(error, operation))?;
    Ok(StoredDocument {
        key,
        version: from_bigint(version, operation)?,
        body: body.0,
    })
}
