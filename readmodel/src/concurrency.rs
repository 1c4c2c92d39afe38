//! Optimistic concurrency over versioned documents.
//!
//! Both helpers bump the entity's version, then replace the stored document
//! only if its version still equals the original. When another writer got
//! there first the in-memory version is rolled back.
//!
//! Inside a transaction the store may only detect the conflict at commit;
//! that surfaces as `StoreError::VersionConflict` from the commit.

use crate::errors::ConcurrencyError;
use crate::repository::Repository;
use readmodel_types::{DocumentStore, StoreError, StoredDocument, Versioned};
use tracing::{debug, warn};

/// Conditionally replace `entity`, returning `false` on a version conflict.
pub async fn try_update_with_version<D, T>(
    repository: &Repository<D>,
    entity: &mut T,
) -> Result<bool, StoreError>
where
    D: DocumentStore,
    T: Versioned,
{
    let original = entity.version();
    entity.set_version(original + 1);

    let result = match StoredDocument::from_document(&*entity, original + 1) {
        Ok(stored) => repository.replace_if_version::<T>(stored, original).await,
        Err(error) => Err(error),
    };

    match result {
        Ok(0) => {
            entity.set_version(original);
            warn!(
                collection = T::COLLECTION,
                key = %entity.key(),
                expected = original,
                "[occ.update] version conflict, update rejected"
            );
            Ok(false)
        }
        Ok(_) => {
            debug!(
                collection = T::COLLECTION,
                key = %entity.key(),
                version = original + 1,
                "[occ.update] document updated"
            );
            Ok(true)
        }
        Err(error) => {
            entity.set_version(original);
            Err(error)
        }
    }
}

/// Like `try_update_with_version`, raising `ConcurrencyError::Conflict`
/// instead of returning `false`.
pub async fn update_with_version<D, T>(
    repository: &Repository<D>,
    entity: &mut T,
) -> Result<(), ConcurrencyError>
where
    D: DocumentStore,
    T: Versioned,
{
    let expected = entity.version();
    if try_update_with_version(repository, entity).await? {
        Ok(())
    } else {
        Err(ConcurrencyError::Conflict {
            collection: T::COLLECTION.to_string(),
            key: entity.key().to_string(),
            expected,
        })
    }
}
