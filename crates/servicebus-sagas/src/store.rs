//! Saga persistence.
//!
//! The store treats saga state as an opaque string keyed by the composite
//! identity `saga_type:value`. Updates are guarded by a revision number so
//! two passes racing on the same saga cannot silently overwrite each other.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use servicebus_core::error::DomainError;
use servicebus_core::identity::Identity;
use tokio::sync::RwLock;
use tracing::warn;

use crate::identity::{SagaId, SagaStatus};

/// A serialized saga instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSaga {
    /// Saga identity.
    pub id: SagaId,
    /// Lifecycle status.
    pub status: SagaStatus,
    /// Layout version of `payload`.
    pub schema_version: u32,
    /// Serialized saga state.
    pub payload: String,
    /// Start time.
    pub created_at: DateTime<Utc>,
    /// Expiration time.
    pub expire_at: DateTime<Utc>,
    /// When the saga reached a terminal status.
    pub closed_at: Option<DateTime<Utc>>,
    /// Why it did.
    pub closing_reason: Option<String>,
    /// Revision the instance was loaded at; bumped by every update.
    pub revision: u64,
}

impl StoredSaga {
    /// Whether `now` is past the expiration time.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expire_at
    }
}

/// One write in a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SagaChange {
    /// A new saga.
    Insert(StoredSaga),
    /// An existing saga; its `revision` must match the stored one.
    Update(StoredSaga),
}

impl SagaChange {
    fn saga(&self) -> &StoredSaga {
        match self {
            Self::Insert(saga) | Self::Update(saga) => saga,
        }
    }
}

/// Keyed persistence for serialized sagas.
#[async_trait]
pub trait SagaStore: Send + Sync {
    /// Stores a new saga.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::DuplicateSaga` if the identity is taken.
    async fn save(&self, saga: StoredSaga) -> Result<(), DomainError>;

    /// Replaces an existing saga, checking its revision.
    ///
    /// # Errors
    ///
    /// - `DomainError::SagaNotFound` if the saga does not exist.
    /// - `DomainError::ConcurrentModification` if the revision is stale.
    async fn update(&self, saga: StoredSaga) -> Result<(), DomainError>;

    /// Loads a saga.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage is unavailable.
    async fn load(&self, id: &SagaId) -> Result<Option<StoredSaga>, DomainError>;

    /// Removes a saga.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::SagaNotFound` if the saga does not exist.
    async fn remove(&self, id: &SagaId) -> Result<(), DomainError>;

    /// Applies every change of one pass, in order.
    ///
    /// The default applies the changes one by one; engines with transactions
    /// should override it so a commit lands completely or not at all.
    ///
    /// # Errors
    ///
    /// Returns the first failing change's error.
    async fn commit(&self, changes: Vec<SagaChange>) -> Result<(), DomainError> {
        for change in changes {
            match change {
                SagaChange::Insert(saga) => self.save(saga).await?,
                SagaChange::Update(saga) => self.update(saga).await?,
            }
        }
        Ok(())
    }
}

/// In-process saga store.
#[derive(Debug, Default)]
pub struct InMemorySagaStore {
    sagas: RwLock<HashMap<String, StoredSaga>>,
}

impl InMemorySagaStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of sagas held.
    pub async fn saga_count(&self) -> usize {
        self.sagas.read().await.len()
    }
}

fn check(sagas: &HashMap<String, StoredSaga>, change: &SagaChange) -> Result<(), DomainError> {
    let key = change.saga().id.composite_key();
    match (change, sagas.get(&key)) {
        (SagaChange::Insert(_), Some(_)) => Err(DomainError::DuplicateSaga(key)),
        (SagaChange::Update(_), None) => Err(DomainError::SagaNotFound(key)),
        (SagaChange::Update(saga), Some(current)) if current.revision != saga.revision => {
            warn!(saga = %key, expected = saga.revision, actual = current.revision, "Saga revision conflict");
            Err(DomainError::ConcurrentModification {
                id: key,
                expected: Some(saga.revision),
                actual: Some(current.revision),
            })
        }
        _ => Ok(()),
    }
}

fn apply(sagas: &mut HashMap<String, StoredSaga>, change: SagaChange) {
    let saga = match change {
        SagaChange::Insert(saga) => saga,
        SagaChange::Update(mut saga) => {
            saga.revision += 1;
            saga
        }
    };
    sagas.insert(saga.id.composite_key(), saga);
}

#[async_trait]
impl SagaStore for InMemorySagaStore {
    async fn save(&self, saga: StoredSaga) -> Result<(), DomainError> {
        self.commit(vec![SagaChange::Insert(saga)]).await
    }

    async fn update(&self, saga: StoredSaga) -> Result<(), DomainError> {
        self.commit(vec![SagaChange::Update(saga)]).await
    }

    async fn load(&self, id: &SagaId) -> Result<Option<StoredSaga>, DomainError> {
        Ok(self.sagas.read().await.get(&id.composite_key()).cloned())
    }

    async fn remove(&self, id: &SagaId) -> Result<(), DomainError> {
        let key = id.composite_key();
        match self.sagas.write().await.remove(&key) {
            Some(_) => Ok(()),
            None => Err(DomainError::SagaNotFound(key)),
        }
    }

    async fn commit(&self, changes: Vec<SagaChange>) -> Result<(), DomainError> {
        let mut sagas = self.sagas.write().await;
        // Validate against a scratch copy first so a failing change leaves
        // the store untouched.
        let mut scratch = sagas.clone();
        for change in &changes {
            check(&scratch, change)?;
            apply(&mut scratch, change.clone());
        }
        *sagas = scratch;
        Ok(())
    }
}
