//! Wiring from `Config` to a ready `CredentialGateway`.
//!
//! Resolution happens once. The resolved kind decides which provider is
//! built, and that provider stays active for the gateway's lifetime. OAuth
//! providers with auto-refresh get a background refresh task on the
//! configured interval.

use std::sync::Arc;
use std::time::Duration;

use anthropic_auth::{
    CredentialStore, Error as StoreError, RetryPolicy, SourceKind, StoredMaterial, TokenRefresher,
};
use anthropic_oauth::{OAuthProvider, OAuthSettings, REFRESH_THRESHOLD, spawn_refresh_task};
use common::Credential;
use provider::{ApiKeyProvider, Provider};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{AuthConfig, Config, UpstreamConfig};
use crate::error::{GatewayError, Result};
use crate::gateway::CredentialGateway;
use crate::transport::HttpTransport;

/// The provider built for the resolved credential.
#[derive(Clone)]
pub enum ActiveProvider {
    ApiKey(Arc<ApiKeyProvider>),
    OAuth(Arc<OAuthProvider>),
}

impl ActiveProvider {
    pub fn as_dyn(&self) -> Arc<dyn Provider> {
        match self {
            ActiveProvider::ApiKey(p) => p.clone(),
            ActiveProvider::OAuth(p) => p.clone(),
        }
    }

    /// Start background refresh for OAuth providers. API keys never expire,
    /// so there is nothing to spawn for them.
    pub fn spawn_background_refresh(&self, interval: Duration) -> Option<JoinHandle<()>> {
        match self {
            ActiveProvider::OAuth(p) => Some(spawn_refresh_task(
                p.clone(),
                interval,
                p.settings().refresh_threshold,
            )),
            ActiveProvider::ApiKey(_) => None,
        }
    }
}

/// Everything a caller needs after startup.
pub struct Bootstrapped {
    pub gateway: CredentialGateway,
    pub active: ActiveProvider,
    /// Source the credential was resolved from.
    pub source: SourceKind,
    pub store: Arc<CredentialStore>,
    /// Client for the configured upstream.
    pub transport: HttpTransport,
    /// Background refresh loop, when one was started. Dropping the handle
    /// leaves the loop running; abort it to stop refreshing.
    pub refresh_task: Option<JoinHandle<()>>,
}

/// Standard credential store for `config`: overrides, environment, keychain
/// and the configured file, with the configured write-back target.
pub fn credential_store(config: &AuthConfig, overrides: StoredMaterial) -> CredentialStore {
    CredentialStore::standard(overrides, config.credentials_path())
        .with_storage(config.storage)
        .with_file_fallback(config.allow_file_fallback)
}

/// Resolve a credential from `store` and build the matching gateway.
pub async fn connect(config: &Config, store: Arc<CredentialStore>) -> Result<Bootstrapped> {
    let resolved = match store.resolve(config.auth.mode).await {
        Ok(resolved) => resolved,
        Err(StoreError::NotFound) => {
            warn!(mode = ?config.auth.mode, "no credential found in any source");
            return Err(GatewayError::NoCredential);
        }
        Err(e) => return Err(GatewayError::Setup(e.to_string())),
    };

    let kind = resolved.credential.kind();
    let active = build_provider(config, resolved.credential, store.clone())?;
    info!(kind = %kind, source = %resolved.source, "credential provider ready");

    let transport = transport(&config.upstream)?;
    let gateway = CredentialGateway::new(active.as_dyn())
        .with_policy(config.context.policy)
        .with_max_auth_retries(config.auth.max_auth_retries);

    let refresh_task = match config.auth.refresh_interval() {
        Some(interval) if config.auth.auto_refresh => active.spawn_background_refresh(interval),
        _ => None,
    };

    Ok(Bootstrapped {
        gateway,
        active,
        source: resolved.source,
        store,
        transport,
        refresh_task,
    })
}

fn build_provider(
    config: &Config,
    credential: Credential,
    store: Arc<CredentialStore>,
) -> Result<ActiveProvider> {
    match credential {
        Credential::ApiKey { .. } => {
            let provider = ApiKeyProvider::from_credential(credential, &config.auth.api_key_prefix)?;
            Ok(ActiveProvider::ApiKey(Arc::new(provider)))
        }
        Credential::OAuthToken { .. } => {
            let refresher =
                TokenRefresher::with_timeout(config.auth.refresh_endpoint(), config.upstream.timeout())
                    .map_err(|e| GatewayError::Setup(e.to_string()))?
                    .with_policy(
                        RetryPolicy::default().with_max_attempts(config.auth.max_refresh_attempts),
                    );
            let settings = OAuthSettings {
                auto_refresh: config.auth.auto_refresh,
                refresh_threshold: REFRESH_THRESHOLD,
            };
            let provider = OAuthProvider::new(credential, refresher, store, settings)?;
            Ok(ActiveProvider::OAuth(Arc::new(provider)))
        }
    }
}

/// HTTP transport for the configured upstream.
pub fn transport(config: &UpstreamConfig) -> Result<HttpTransport> {
    let client = reqwest::Client::builder()
        .timeout(config.timeout())
        .build()
        .map_err(|e| GatewayError::Setup(format!("failed to build HTTP client: {e}")))?;
    Ok(HttpTransport::new(client, config.url.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anthropic_auth::{AuthMode, FileSource, MemorySource};
    use chrono::Utc;
    use common::CredentialKind;
    use provider::AuthError;

    use crate::context::ContextPolicy;

    fn file_store(dir: &tempfile::TempDir) -> Arc<CredentialStore> {
        let file = FileSource::new(dir.path().join("credentials.json"));
        Arc::new(
            CredentialStore::new(vec![Arc::new(file)])
                .with_storage(anthropic_auth::StoragePreference::File),
        )
    }

    #[tokio::test]
    async fn api_key_resolves_to_api_key_provider() {
        let dir = tempfile::tempdir().unwrap();
        let store = file_store(&dir);
        store.persist(&Credential::api_key("sk-ant-live")).await.unwrap();

        let mut config = Config::default();
        config.context.policy = ContextPolicy::Block;
        config.auth.max_auth_retries = 2;

        let ready = connect(&config, store).await.unwrap();
        assert!(matches!(ready.active, ActiveProvider::ApiKey(_)));
        assert_eq!(ready.source, SourceKind::File);
        assert_eq!(ready.gateway.status().kind, CredentialKind::ApiKey);
        assert_eq!(ready.gateway.status().limit, 1_000_000);
        assert_eq!(ready.gateway.policy(), ContextPolicy::Block);
        assert_eq!(ready.gateway.max_auth_retries(), 2);
        assert!(ready.active.spawn_background_refresh(Duration::from_secs(60)).is_none());
        assert!(ready.refresh_task.is_none());
    }

    async fn oauth_store(dir: &tempfile::TempDir) -> Arc<CredentialStore> {
        let store = file_store(dir);
        store
            .persist(&Credential::oauth(
                "at",
                "rt",
                Utc::now() + chrono::Duration::hours(2),
            ))
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn oauth_auto_refresh_starts_background_task() {
        let dir = tempfile::tempdir().unwrap();
        let ready = connect(&Config::default(), oauth_store(&dir).await)
            .await
            .unwrap();

        let task = ready.refresh_task.expect("refresh task started");
        assert!(!task.is_finished());
        task.abort();
    }

    #[tokio::test]
    async fn zero_interval_or_manual_refresh_skips_background_task() {
        let dir = tempfile::tempdir().unwrap();
        let store = oauth_store(&dir).await;

        let mut config = Config::default();
        config.auth.refresh_interval_secs = 0;
        let ready = connect(&config, store.clone()).await.unwrap();
        assert!(ready.refresh_task.is_none());

        let mut config = Config::default();
        config.auth.auto_refresh = false;
        let ready = connect(&config, store).await.unwrap();
        assert!(ready.refresh_task.is_none());
    }

    #[tokio::test]
    async fn transport_targets_configured_upstream() {
        let dir = tempfile::tempdir().unwrap();
        let store = file_store(&dir);
        store.persist(&Credential::api_key("sk-ant-live")).await.unwrap();

        let mut config = Config::default();
        config.upstream.url = "http://127.0.0.1:9/proxy/".into();
        let ready = connect(&config, store).await.unwrap();
        assert_eq!(ready.transport.base_url(), "http://127.0.0.1:9/proxy");
    }

    #[tokio::test]
    async fn oauth_pair_resolves_to_oauth_provider() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.auth.auto_refresh = false;

        let ready = connect(&config, oauth_store(&dir).await).await.unwrap();
        let ActiveProvider::OAuth(provider) = &ready.active else {
            panic!("expected OAuth provider");
        };
        assert!(!provider.settings().auto_refresh);
        assert_eq!(ready.gateway.status().limit, 200_000);
        assert!(ready.gateway.status().valid);
    }

    #[tokio::test]
    async fn empty_store_is_no_credential() {
        let store = Arc::new(CredentialStore::new(vec![Arc::new(MemorySource::new(
            SourceKind::SecureStore,
        ))]));
        let err = connect(&Config::default(), store).await.err().unwrap();
        assert_eq!(err, GatewayError::NoCredential);
    }

    #[tokio::test]
    async fn mode_restricts_kind() {
        let dir = tempfile::tempdir().unwrap();
        let store = file_store(&dir);
        store.persist(&Credential::api_key("sk-ant-live")).await.unwrap();

        let mut config = Config::default();
        config.auth.mode = AuthMode::OAuth;
        let err = connect(&config, store).await.err().unwrap();
        assert_eq!(err, GatewayError::NoCredential);
    }

    #[tokio::test]
    async fn malformed_api_key_is_a_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = file_store(&dir);
        store.persist(&Credential::api_key("sk-other-1")).await.unwrap();

        let err = connect(&Config::default(), store).await.err().unwrap();
        assert!(matches!(
            err,
            GatewayError::Auth(AuthError::CredentialFormatInvalid {
                kind: CredentialKind::ApiKey,
                ..
            })
        ));
    }

    #[test]
    fn transport_builds_from_config() {
        assert!(transport(&UpstreamConfig::default()).is_ok());
    }
}
