//! Storage abstraction layer for delivery.
//!
//! The dispatcher worker and the credential resolver talk to storage through
//! these traits. Production wraps `cdc_webhook_core::storage::Storage`; tests
//! use the in-memory implementations in [`mock`].

use std::{future::Future, pin::Pin, sync::Arc};

use cdc_webhook_core::{
    error::Result,
    storage::Storage,
    CredentialRecord, DeliveryOutcome, EventQueueRecord, QueueRecordId, QueueStatus, TriggerKey,
};
use chrono::{DateTime, Utc};

/// Boxed future returned by storage trait methods.
pub type StorageFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Event queue operations used by producers and the dispatcher.
pub trait QueueStorage: Send + Sync + 'static {
    /// Inserts a fresh PENDING record.
    fn enqueue(&self, record: EventQueueRecord) -> StorageFuture<'_, QueueRecordId>;

    /// Claims up to `limit` records due at `now`, moving them to
    /// IN_PROGRESS, ordered by `next_attempt` ascending.
    fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> StorageFuture<'_, Vec<EventQueueRecord>>;

    /// Applies one attempt's outcome to an IN_PROGRESS record and returns
    /// the updated record.
    fn record_outcome(
        &self,
        id: QueueRecordId,
        outcome: DeliveryOutcome,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, EventQueueRecord>;

    /// Returns IN_PROGRESS records untouched since `stale_before` to PENDING.
    fn reclaim_stale(&self, now: DateTime<Utc>, stale_before: DateTime<Utc>) -> StorageFuture<'_, u64>;

    /// Looks up one record.
    fn find(&self, id: QueueRecordId) -> StorageFuture<'_, Option<EventQueueRecord>>;

    /// Counts records in a status.
    fn count_by_status(&self, status: QueueStatus) -> StorageFuture<'_, u64>;
}

/// Protected credential store operations.
pub trait CredentialStorage: Send + Sync + 'static {
    /// Looks up the credentials of a PRIVATE binding.
    fn find_credentials(&self, key: TriggerKey) -> StorageFuture<'_, Option<CredentialRecord>>;

    /// Creates or overwrites credentials.
    fn upsert_credentials(&self, record: CredentialRecord) -> StorageFuture<'_, ()>;

    /// Deletes credentials, returning whether any existed.
    fn delete_credentials(&self, key: TriggerKey) -> StorageFuture<'_, bool>;
}

/// PostgreSQL-backed queue storage.
pub struct PostgresQueueStorage {
    storage: Arc<Storage>,
}

impl PostgresQueueStorage {
    /// Creates a new PostgreSQL queue adapter.
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

impl QueueStorage for PostgresQueueStorage {
    fn enqueue(&self, record: EventQueueRecord) -> StorageFuture<'_, QueueRecordId> {
        Box::pin(async move { self.storage.event_queue.enqueue(&record).await })
    }

    fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> StorageFuture<'_, Vec<EventQueueRecord>> {
        Box::pin(async move { self.storage.event_queue.claim_due(now, limit).await })
    }

    fn record_outcome(
        &self,
        id: QueueRecordId,
        outcome: DeliveryOutcome,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, EventQueueRecord> {
        Box::pin(async move { self.storage.event_queue.record_outcome(id, &outcome, now).await })
    }

    fn reclaim_stale(&self, now: DateTime<Utc>, stale_before: DateTime<Utc>) -> StorageFuture<'_, u64> {
        Box::pin(async move { self.storage.event_queue.reclaim_stale(now, stale_before).await })
    }

    fn find(&self, id: QueueRecordId) -> StorageFuture<'_, Option<EventQueueRecord>> {
        Box::pin(async move { self.storage.event_queue.find_by_id(id).await })
    }

    fn count_by_status(&self, status: QueueStatus) -> StorageFuture<'_, u64> {
        Box::pin(async move {
            let count = self.storage.event_queue.count_by_status(status).await?;
            Ok(u64::try_from(count).unwrap_or_default())
        })
    }
}

/// PostgreSQL-backed credential storage.
pub struct PostgresCredentialStorage {
    storage: Arc<Storage>,
}

impl PostgresCredentialStorage {
    /// Creates a new PostgreSQL credential adapter.
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

impl CredentialStorage for PostgresCredentialStorage {
    fn find_credentials(&self, key: TriggerKey) -> StorageFuture<'_, Option<CredentialRecord>> {
        Box::pin(async move { self.storage.credentials.find(&key).await })
    }

    fn upsert_credentials(&self, record: CredentialRecord) -> StorageFuture<'_, ()> {
        Box::pin(async move { self.storage.credentials.upsert(&record).await })
    }

    fn delete_credentials(&self, key: TriggerKey) -> StorageFuture<'_, bool> {
        Box::pin(async move { self.storage.credentials.delete(&key).await })
    }
}

pub mod mock {
    //! In-memory storage for testing delivery without a database.
    //!
    //! Queue records go through the same `EventQueueRecord` state machine
    //! as the PostgreSQL repository, so invariant violations surface here
    //! too.

    use std::{collections::HashMap, sync::Arc};

    use cdc_webhook_core::{
        error::CoreError, CredentialRecord, DeliveryOutcome, EventQueueRecord, QueueRecordId, QueueStatus,
        TriggerKey,
    };
    use chrono::{DateTime, Utc};
    use tokio::sync::RwLock;

    use super::{CredentialStorage, QueueStorage, StorageFuture};

    /// In-memory event queue.
    #[derive(Clone, Default)]
    pub struct MockQueueStorage {
        records: Arc<RwLock<HashMap<QueueRecordId, EventQueueRecord>>>,
        claim_error: Arc<RwLock<Option<String>>>,
    }

    impl MockQueueStorage {
        /// Creates an empty queue.
        pub fn new() -> Self {
            Self::default()
        }

        /// Makes the next claim fail with a database error.
        pub async fn inject_claim_error(&self, error: impl Into<String>) {
            *self.claim_error.write().await = Some(error.into());
        }

        /// Every stored record, oldest first.
        pub async fn records(&self) -> Vec<EventQueueRecord> {
            let mut records: Vec<_> = self.records.read().await.values().cloned().collect();
            records.sort_by_key(|record| record.created_at);
            records
        }

        /// Stores a record as-is, bypassing enqueue validation.
        pub async fn insert_raw(&self, record: EventQueueRecord) {
            self.records.write().await.insert(record.id, record);
        }
    }

    impl QueueStorage for MockQueueStorage {
        fn enqueue(&self, record: EventQueueRecord) -> StorageFuture<'_, QueueRecordId> {
            Box::pin(async move {
                if record.status != QueueStatus::Pending || record.attempt_count != 0 {
                    return Err(CoreError::invalid_input(
                        "only fresh PENDING records can be enqueued",
                    ));
                }
                let mut records = self.records.write().await;
                if records.contains_key(&record.id) {
                    return Err(CoreError::ConstraintViolation(format!(
                        "queue record {} already exists",
                        record.id
                    )));
                }
                let id = record.id;
                records.insert(id, record);
                Ok(id)
            })
        }

        fn claim_due(
            &self,
            now: DateTime<Utc>,
            limit: usize,
        ) -> StorageFuture<'_, Vec<EventQueueRecord>> {
            Box::pin(async move {
                if let Some(error) = self.claim_error.write().await.take() {
                    return Err(CoreError::Database(error));
                }

                let mut records = self.records.write().await;
                let mut due: Vec<&mut EventQueueRecord> =
                    records.values_mut().filter(|record| record.is_due(now)).collect();
                due.sort_by_key(|record| (record.next_attempt, record.created_at));

                let mut claimed = Vec::new();
                for record in due.into_iter().take(limit) {
                    record.claim(now)?;
                    claimed.push(record.clone());
                }
                Ok(claimed)
            })
        }

        fn record_outcome(
            &self,
            id: QueueRecordId,
            outcome: DeliveryOutcome,
            now: DateTime<Utc>,
        ) -> StorageFuture<'_, EventQueueRecord> {
            Box::pin(async move {
                let mut records = self.records.write().await;
                let record = records
                    .get_mut(&id)
                    .ok_or_else(|| CoreError::not_found(format!("queue record {id}")))?;
                record.apply_outcome(&outcome, now)?;
                Ok(record.clone())
            })
        }

        fn reclaim_stale(
            &self,
            now: DateTime<Utc>,
            stale_before: DateTime<Utc>,
        ) -> StorageFuture<'_, u64> {
            Box::pin(async move {
                let mut reclaimed = 0;
                for record in self.records.write().await.values_mut() {
                    if record.status == QueueStatus::InProgress && record.updated_at < stale_before {
                        record.reclaim(now)?;
                        reclaimed += 1;
                    }
                }
                Ok(reclaimed)
            })
        }

        fn find(&self, id: QueueRecordId) -> StorageFuture<'_, Option<EventQueueRecord>> {
            Box::pin(async move { Ok(self.records.read().await.get(&id).cloned()) })
        }

        fn count_by_status(&self, status: QueueStatus) -> StorageFuture<'_, u64> {
            Box::pin(async move {
                let count =
                    self.records.read().await.values().filter(|r| r.status == status).count();
                Ok(count as u64)
            })
        }
    }

    /// In-memory credential store.
    #[derive(Clone, Default)]
    pub struct MockCredentialStorage {
        records: Arc<RwLock<HashMap<TriggerKey, CredentialRecord>>>,
    }

    impl MockCredentialStorage {
        /// Creates an empty store.
        pub fn new() -> Self {
            Self::default()
        }

        /// Number of stored credential records.
        pub async fn len(&self) -> usize {
            self.records.read().await.len()
        }

        /// Whether the store is empty.
        pub async fn is_empty(&self) -> bool {
            self.records.read().await.is_empty()
        }
    }

    impl CredentialStorage for MockCredentialStorage {
        fn find_credentials(&self, key: TriggerKey) -> StorageFuture<'_, Option<CredentialRecord>> {
            Box::pin(async move { Ok(self.records.read().await.get(&key).cloned()) })
        }

        fn upsert_credentials(&self, record: CredentialRecord) -> StorageFuture<'_, ()> {
            Box::pin(async move {
                self.records.write().await.insert(record.key.clone(), record);
                Ok(())
            })
        }

        fn delete_credentials(&self, key: TriggerKey) -> StorageFuture<'_, bool> {
            Box::pin(async move { Ok(self.records.write().await.remove(&key).is_some()) })
        }
    }
}
