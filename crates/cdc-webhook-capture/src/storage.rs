//! Binding persistence behind a trait.
//!
//! Saving or removing a PRIVATE binding touches the credential store too;
//! the PostgreSQL adapter does both in one transaction.

use std::sync::Arc;

use cdc_webhook_core::{
    storage::Storage, CredentialRecord, TableIdentity, TriggerBinding, TriggerKey,
};
use cdc_webhook_delivery::storage::StorageFuture;

/// Persistence of trigger bindings and their credentials.
pub trait BindingStorage: Send + Sync + 'static {
    /// Creates or replaces a binding, writing `credentials` alongside it.
    fn save_binding(
        &self,
        binding: TriggerBinding,
        credentials: Option<CredentialRecord>,
    ) -> StorageFuture<'_, ()>;

    /// Deletes a binding and any credentials it owns. Returns whether the
    /// binding existed.
    fn remove_binding(&self, key: TriggerKey) -> StorageFuture<'_, bool>;

    /// Every binding, ordered by table then trigger name.
    fn list_bindings(&self) -> StorageFuture<'_, Vec<TriggerBinding>>;

    /// Bindings attached to one table, ordered by trigger name.
    fn bindings_for_table(&self, table: TableIdentity) -> StorageFuture<'_, Vec<TriggerBinding>>;
}

/// PostgreSQL-backed binding storage.
pub struct PostgresBindingStorage {
    storage: Arc<Storage>,
}

impl PostgresBindingStorage {
    /// Creates a new PostgreSQL binding adapter.
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

impl BindingStorage for PostgresBindingStorage {
    fn save_binding(
        &self,
        binding: TriggerBinding,
        credentials: Option<CredentialRecord>,
    ) -> StorageFuture<'_, ()> {
        Box::pin(async move {
            let mut tx = self.storage.pool().begin().await?;
            self.storage.bindings.upsert_in_tx(&mut tx, &binding).await?;
            match &credentials {
                Some(record) => self.storage.credentials.upsert_in_tx(&mut tx, record).await?,
                None => {
                    self.storage.credentials.delete_in_tx(&mut tx, &binding.key).await?;
                },
            }
            tx.commit().await?;
            Ok(())
        })
    }

    fn remove_binding(&self, key: TriggerKey) -> StorageFuture<'_, bool> {
        Box::pin(async move {
            let mut tx = self.storage.pool().begin().await?;
            let existed = self.storage.bindings.delete_in_tx(&mut tx, &key).await?;
            self.storage.credentials.delete_in_tx(&mut tx, &key).await?;
            tx.commit().await?;
            Ok(existed)
        })
    }

    fn list_bindings(&self) -> StorageFuture<'_, Vec<TriggerBinding>> {
        Box::pin(async move { self.storage.bindings.list_all().await })
    }

    fn bindings_for_table(&self, table: TableIdentity) -> StorageFuture<'_, Vec<TriggerBinding>> {
        Box::pin(async move { self.storage.bindings.list_for_table(&table).await })
    }
}

pub mod mock {
    //! In-memory binding storage sharing a credential store with delivery.

    use std::{collections::BTreeMap, sync::Arc};

    use cdc_webhook_core::{CredentialRecord, TableIdentity, TriggerBinding, TriggerKey};
    use cdc_webhook_delivery::storage::{mock::MockCredentialStorage, CredentialStorage, StorageFuture};
    use tokio::sync::RwLock;

    use super::BindingStorage;

    type BindingKey = (String, String, String);

    /// In-memory bindings, ordered by table then trigger name.
    #[derive(Clone, Default)]
    pub struct MockBindingStorage {
        bindings: Arc<RwLock<BTreeMap<BindingKey, TriggerBinding>>>,
        credentials: MockCredentialStorage,
    }

    impl MockBindingStorage {
        /// Creates an empty store writing credentials to `credentials`.
        pub fn new(credentials: MockCredentialStorage) -> Self {
            Self { bindings: Arc::default(), credentials }
        }

        /// Credential store PRIVATE bindings write to.
        pub fn credentials(&self) -> &MockCredentialStorage {
            &self.credentials
        }
    }

    fn binding_key(key: &TriggerKey) -> BindingKey {
        (key.table.schema.clone(), key.table.name.clone(), key.trigger_name.clone())
    }

    impl BindingStorage for MockBindingStorage {
        fn save_binding(
            &self,
            binding: TriggerBinding,
            credentials: Option<CredentialRecord>,
        ) -> StorageFuture<'_, ()> {
            Box::pin(async move {
                let key = binding.key.clone();
                match credentials {
                    Some(record) => self.credentials.upsert_credentials(record).await?,
                    None => {
                        self.credentials.delete_credentials(key.clone()).await?;
                    },
                }
                self.bindings.write().await.insert(binding_key(&key), binding);
                Ok(())
            })
        }

        fn remove_binding(&self, key: TriggerKey) -> StorageFuture<'_, bool> {
            Box::pin(async move {
                self.credentials.delete_credentials(key.clone()).await?;
                Ok(self.bindings.write().await.remove(&binding_key(&key)).is_some())
            })
        }

        fn list_bindings(&self) -> StorageFuture<'_, Vec<TriggerBinding>> {
            Box::pin(async move { Ok(self.bindings.read().await.values().cloned().collect()) })
        }

        fn bindings_for_table(
            &self,
            table: TableIdentity,
        ) -> StorageFuture<'_, Vec<TriggerBinding>> {
            Box::pin(async move {
                Ok(self
                    .bindings
                    .read()
                    .await
                    .values()
                    .filter(|binding| binding.key.table == table)
                    .cloned()
                    .collect())
            })
        }
    }
}
