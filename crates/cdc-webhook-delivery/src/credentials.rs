//! Credential resolution: turning a binding's target source into a
//! concrete [`WebhookTarget`] at delivery time.
//!
//! Inline sources carry their URL and headers with them. Stored sources are
//! looked up on every call, never cached, so that reconfigured credentials
//! take effect with the very next delivery.

use std::{future::Future, pin::Pin, sync::Arc};

use cdc_webhook_core::{TargetSource, TriggerKey, WebhookHeaders, WebhookTarget};
use tracing::debug;

use crate::{
    error::{DeliveryError, Result},
    storage::CredentialStorage,
};

/// Boxed future returned by [`CredentialProvider::resolve`].
pub type ResolveFuture<'a> = Pin<Box<dyn Future<Output = Result<(String, WebhookHeaders)>> + Send + 'a>>;

/// Source of a URL and headers for one binding.
pub trait CredentialProvider: Send + Sync {
    /// Produces the URL and headers to deliver `key`'s events with.
    fn resolve<'a>(&'a self, key: &'a TriggerKey) -> ResolveFuture<'a>;
}

/// URL and headers supplied at configuration time.
#[derive(Debug, Clone)]
pub struct InlineCredentials {
    url: String,
    headers: WebhookHeaders,
}

impl InlineCredentials {
    /// Wraps inline credentials.
    pub fn new(url: impl Into<String>, headers: WebhookHeaders) -> Self {
        Self { url: url.into(), headers }
    }
}

impl CredentialProvider for InlineCredentials {
    fn resolve<'a>(&'a self, _key: &'a TriggerKey) -> ResolveFuture<'a> {
        Box::pin(async move { Ok((self.url.clone(), self.headers.clone())) })
    }
}

/// URL and headers read from the protected credential store.
#[derive(Clone)]
pub struct StoredCredentials {
    storage: Arc<dyn CredentialStorage>,
}

impl StoredCredentials {
    /// Reads credentials from `storage`.
    pub fn new(storage: Arc<dyn CredentialStorage>) -> Self {
        Self { storage }
    }
}

impl CredentialProvider for StoredCredentials {
    fn resolve<'a>(&'a self, key: &'a TriggerKey) -> ResolveFuture<'a> {
        Box::pin(async move {
            let record = self
                .storage
                .find_credentials(key.clone())
                .await?
                .ok_or_else(|| DeliveryError::CredentialsNotFound { trigger: key.clone() })?;

            debug!(trigger = %key, headers = ?record.headers, "resolved stored credentials");
            Ok((record.url, record.headers))
        })
    }
}

/// Picks the provider matching a target source and resolves it.
#[derive(Clone)]
pub struct CredentialResolver {
    stored: StoredCredentials,
}

impl CredentialResolver {
    /// Creates a resolver backed by `storage` for PRIVATE bindings.
    pub fn new(storage: Arc<dyn CredentialStorage>) -> Self {
        Self { stored: StoredCredentials::new(storage) }
    }

    /// Resolves the delivery target for one delivery.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::CredentialsNotFound` if a stored source has no
    /// record, or `DeliveryError::Storage` if the lookup fails.
    pub async fn resolve(
        &self,
        key: &TriggerKey,
        source: &TargetSource,
        timeout_seconds: u32,
    ) -> Result<WebhookTarget> {
        let (url, headers) = match source {
            TargetSource::Inline { url, headers } => {
                InlineCredentials::new(url.clone(), headers.clone()).resolve(key).await?
            },
            TargetSource::Stored => self.stored.resolve(key).await?,
        };

        Ok(WebhookTarget::new(url, headers, timeout_seconds))
    }
}
