//! Declarative binding registry.
//!
//! Replaces per-table generated trigger code: configuring a trigger stores a
//! validated [`TriggerBinding`] row that the capture routine reads on every
//! row change.

use std::sync::Arc;

use cdc_webhook_core::{Clock, TableIdentity, TriggerBinding, TriggerKey};
use tracing::info;

use crate::{
    config::{BindingsFile, TriggerConfig},
    error::Result,
    storage::BindingStorage,
};

/// Configures, removes and lists trigger bindings.
#[derive(Clone)]
pub struct BindingRegistry {
    storage: Arc<dyn BindingStorage>,
    clock: Arc<dyn Clock>,
}

impl BindingRegistry {
    /// Creates a registry over `storage`.
    pub fn new(storage: Arc<dyn BindingStorage>, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock }
    }

    /// Validates and stores a trigger configuration, replacing any binding
    /// with the same key.
    ///
    /// PRIVATE configurations write their URL and headers to the credential
    /// store instead of the binding.
    ///
    /// # Errors
    ///
    /// Returns `CaptureError::Configuration` without touching storage if the
    /// configuration is invalid, or `CaptureError::Storage` if saving fails.
    pub async fn configure(&self, config: &TriggerConfig) -> Result<TriggerBinding> {
        let binding = config.validate()?;
        let credentials = config.credentials(self.clock.now_utc());

        self.storage.save_binding(binding.clone(), credentials).await?;

        info!(
            trigger = %binding.key,
            operations = ?binding.operations,
            timing = %binding.timing,
            security = %binding.security(),
            dispatch = %binding.dispatch,
            headers = ?config.headers,
            "trigger binding configured"
        );
        Ok(binding)
    }

    /// Validates every trigger in `file`, then stores them all.
    ///
    /// # Errors
    ///
    /// Returns `CaptureError::Configuration` before storing anything if any
    /// trigger is invalid.
    pub async fn apply_file(&self, file: &BindingsFile) -> Result<usize> {
        file.validate()?;
        for config in &file.triggers {
            self.configure(config).await?;
        }
        Ok(file.triggers.len())
    }

    /// Deletes a binding and its credentials. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// Returns `CaptureError::Storage` if the delete fails.
    pub async fn remove(&self, key: &TriggerKey) -> Result<bool> {
        let existed = self.storage.remove_binding(key.clone()).await?;
        if existed {
            info!(trigger = %key, "trigger binding removed");
        }
        Ok(existed)
    }

    /// Every binding.
    ///
    /// # Errors
    ///
    /// Returns `CaptureError::Storage` if the query fails.
    pub async fn list(&self) -> Result<Vec<TriggerBinding>> {
        Ok(self.storage.list_bindings().await?)
    }

    /// Bindings on one table.
    ///
    /// # Errors
    ///
    /// Returns `CaptureError::Storage` if the query fails.
    pub async fn bindings_for(&self, table: &TableIdentity) -> Result<Vec<TriggerBinding>> {
        Ok(self.storage.bindings_for_table(table.clone()).await?)
    }
}

#[cfg(test)]
mod tests {
    use cdc_webhook_core::{SecurityMode, TargetSource, TestClock, WebhookHeaders};
    use cdc_webhook_delivery::storage::{mock::MockCredentialStorage, CredentialStorage};

    use super::*;
    use crate::{error::CaptureError, storage::mock::MockBindingStorage};

    fn registry() -> (BindingRegistry, MockBindingStorage) {
        let storage = MockBindingStorage::new(MockCredentialStorage::new());
        let registry = BindingRegistry::new(Arc::new(storage.clone()), Arc::new(TestClock::new()));
        (registry, storage)
    }

    fn private_config(url: &str, token: &str) -> TriggerConfig {
        TriggerConfig {
            security: "PRIVATE".to_string(),
            headers: [("Authorization", token)].into_iter().collect::<WebhookHeaders>(),
            ..TriggerConfig::new("payments_private", "payments", &["INSERT"], url)
        }
    }

    #[tokio::test]
    async fn reconfiguring_private_binding_keeps_one_credential_record() {
        let (registry, storage) = registry();

        registry.configure(&private_config("https://old.example/hook", "old")).await.unwrap();
        let binding =
            registry.configure(&private_config("https://new.example/hook", "new")).await.unwrap();

        assert_eq!(binding.security(), SecurityMode::Private);
        assert_eq!(storage.credentials().len().await, 1);

        let stored = storage.credentials().find_credentials(binding.key.clone()).await.unwrap().unwrap();
        assert_eq!(stored.url, "https://new.example/hook");
        assert_eq!(stored.headers.get("Authorization"), Some("new"));
        assert_eq!(registry.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn switching_to_none_drops_stored_credentials() {
        let (registry, storage) = registry();
        registry.configure(&private_config("https://sink.example/hook", "token")).await.unwrap();

        let public = TriggerConfig::new("payments_private", "payments", &["INSERT"], "https://sink.example/hook");
        let binding = registry.configure(&public).await.unwrap();

        assert!(matches!(binding.source, TargetSource::Inline { .. }));
        assert!(storage.credentials().is_empty().await);
    }

    #[tokio::test]
    async fn invalid_configuration_stores_nothing() {
        let (registry, storage) = registry();
        let config = TriggerConfig {
            dispatch: "ASYNC".to_string(),
            cancel_on_failure: true,
            ..private_config("https://sink.example/hook", "token")
        };

        let err = registry.configure(&config).await.unwrap_err();

        assert!(matches!(err, CaptureError::Configuration { .. }));
        assert!(registry.list().await.unwrap().is_empty());
        assert!(storage.credentials().is_empty().await);
    }

    #[tokio::test]
    async fn invalid_file_entry_stores_nothing() {
        let (registry, _) = registry();
        let file = BindingsFile {
            triggers: vec![
                TriggerConfig::new("ok", "employees", &["INSERT"], "https://sink.example/hook"),
                TriggerConfig { retry_interval: 0, ..TriggerConfig::new("bad", "employees", &["INSERT"], "https://sink.example/hook") },
            ],
        };

        assert!(registry.apply_file(&file).await.is_err());
        assert!(registry.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn remove_deletes_binding_and_credentials() {
        let (registry, storage) = registry();
        let binding =
            registry.configure(&private_config("https://sink.example/hook", "token")).await.unwrap();

        assert!(registry.remove(&binding.key).await.unwrap());
        assert!(!registry.remove(&binding.key).await.unwrap());
        assert!(storage.credentials().is_empty().await);
    }

    #[tokio::test]
    async fn bindings_are_scoped_to_their_table() {
        let (registry, _) = registry();
        registry
            .configure(&TriggerConfig::new("a", "employees", &["INSERT"], "https://sink.example/a"))
            .await
            .unwrap();
        registry
            .configure(&TriggerConfig::new("b", "payments", &["INSERT"], "https://sink.example/b"))
            .await
            .unwrap();

        let employees = registry.bindings_for(&TableIdentity::new("public", "employees")).await.unwrap();
        assert_eq!(employees.len(), 1);
        assert_eq!(employees[0].key.trigger_name, "a");
    }
}
