//! API-key provider: a static key that never expires and never refreshes.

use common::{Credential, CredentialKind, ProviderDescriptor, Secret};
use tracing::debug;

use crate::{AuthError, Provider, ProviderFuture, RefreshOutcome, Result};

/// Serves the same API key for every call.
pub struct ApiKeyProvider {
    key: Secret<String>,
    prefix: String,
}

impl ApiKeyProvider {
    /// Wrap `key`, rejecting it unless it is non-empty and starts with
    /// `prefix`.
    pub fn new(key: Secret<String>, prefix: impl Into<String>) -> Result<Self> {
        let prefix = prefix.into();
        if let Some(reason) = malformed_reason(&key, &prefix) {
            return Err(AuthError::CredentialFormatInvalid {
                kind: CredentialKind::ApiKey,
                reason,
            });
        }
        Ok(Self { key, prefix })
    }

    /// Build from a resolved credential. OAuth material is refused.
    pub fn from_credential(credential: Credential, prefix: impl Into<String>) -> Result<Self> {
        match credential {
            Credential::ApiKey { value } => Self::new(value, prefix),
            Credential::OAuthToken { .. } => Err(AuthError::CredentialFormatInvalid {
                kind: CredentialKind::ApiKey,
                reason: "resolved credential is an OAuth token pair".into(),
            }),
        }
    }
}

fn malformed_reason(key: &Secret<String>, prefix: &str) -> Option<String> {
    let value = key.expose();
    if value.trim().is_empty() {
        Some("key is empty".into())
    } else if !value.starts_with(prefix) {
        Some(format!("key does not start with {prefix:?}"))
    } else {
        None
    }
}

impl Provider for ApiKeyProvider {
    fn descriptor(&self) -> ProviderDescriptor {
        ProviderDescriptor::for_kind(CredentialKind::ApiKey)
    }

    fn get_credential(&self) -> ProviderFuture<'_, Result<Credential>> {
        let credential = Credential::ApiKey {
            value: self.key.clone(),
        };
        Box::pin(async move { Ok(credential) })
    }

    fn is_valid(&self) -> bool {
        malformed_reason(&self.key, &self.prefix).is_none()
    }

    fn refresh(&self) -> ProviderFuture<'_, RefreshOutcome> {
        // Nothing to exchange; the caller may retry with the same key.
        debug!("api key provider has nothing to refresh");
        Box::pin(async { RefreshOutcome::NotRequired })
    }
}
