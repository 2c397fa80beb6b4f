//! OAuth provider with single-flight refresh
//!
//! The current token lives in an `ArcSwap`, so validity checks and credential
//! reads never take a lock. Only the refresh future writes it, and only one
//! refresh future exists at a time: callers that arrive while an exchange is
//! running get a clone of the same `Shared` future. The slot keeps a weak
//! handle, so when every waiter drops the exchange is dropped with them and
//! the next caller starts a fresh one. Once the endpoint has answered, the
//! persist and install steps run on their own task: the old refresh value
//! may already be revoked, so the new pair must land in storage and memory
//! even if nobody is left waiting.

use std::sync::Arc;
use std::time::Duration;

use anthropic_auth::{CredentialStore, RefreshFailure, TokenPair, TokenRefresher};
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use common::{Credential, CredentialKind, ProviderDescriptor, Secret};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared, WeakShared};
use parking_lot::Mutex;
use provider::{AuthError, Provider, ProviderFuture, RefreshOutcome, Result};
use tracing::{debug, info, warn};

/// Refresh when the token expires within this window.
pub const REFRESH_THRESHOLD: Duration = Duration::from_secs(5 * 60);

type RefreshFuture = Shared<BoxFuture<'static, RefreshOutcome>>;

/// Behaviour switches for the OAuth provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthSettings {
    /// Refresh inside `get_credential()` when the token is near expiry.
    pub auto_refresh: bool,
    pub refresh_threshold: Duration,
}

impl Default for OAuthSettings {
    fn default() -> Self {
        Self {
            auto_refresh: true,
            refresh_threshold: REFRESH_THRESHOLD,
        }
    }
}

/// Immutable token snapshot. Replaced wholesale on refresh.
struct TokenState {
    access: Secret<String>,
    refresh: Secret<String>,
    expires_at: DateTime<Utc>,
}

impl TokenState {
    fn credential(&self) -> Credential {
        Credential::OAuthToken {
            access: self.access.clone(),
            refresh: self.refresh.clone(),
            expires_at: self.expires_at,
        }
    }

    /// Build the successor state. The refresh value is replaced only when
    /// the endpoint rotated it. A lifetime past the representable range
    /// saturates instead of overflowing.
    fn rotate(&self, pair: TokenPair, now: DateTime<Utc>) -> TokenState {
        let expires_at = chrono::Duration::from_std(pair.expires_in)
            .ok()
            .and_then(|lifetime| now.checked_add_signed(lifetime))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        TokenState {
            access: pair.access,
            refresh: pair.refresh.unwrap_or_else(|| self.refresh.clone()),
            expires_at,
        }
    }

    fn expires_within(&self, window: Duration, now: DateTime<Utc>) -> bool {
        let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::zero());
        self.expires_at - now <= window
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

struct Inner {
    current: ArcSwap<TokenState>,
    refresher: TokenRefresher,
    store: Arc<CredentialStore>,
    in_flight: Mutex<Option<WeakShared<BoxFuture<'static, RefreshOutcome>>>>,
    /// Held from snapshot load until install, across an abandoned refresh.
    install_lock: Arc<tokio::sync::Mutex<()>>,
}

impl Inner {
    /// One refresh exchange, persist, then install.
    async fn run_refresh(self: Arc<Self>) -> RefreshOutcome {
        // Waits out an install left running by an abandoned refresh, so the
        // snapshot below carries the latest refresh value
        let guard = self.install_lock.clone().lock_owned().await;
        let snapshot = self.current.load_full();
        let exchange = self.refresher.refresh(&snapshot.refresh).await;
        let outcome = match exchange {
            Ok(pair) => {
                let inner = self.clone();
                let install = tokio::spawn(async move {
                    let outcome = inner.install(&snapshot, pair).await;
                    drop(guard);
                    outcome
                });
                install.await.unwrap_or_else(|e| {
                    warn!(error = %e, "token install task failed");
                    RefreshOutcome::Unavailable { attempts: 1 }
                })
            }
            Err(RefreshFailure::Rejected { status }) => {
                warn!(status, "refresh token rejected, re-authentication required");
                RefreshOutcome::Rejected
            }
            Err(RefreshFailure::Unavailable(state)) => {
                warn!(attempts = state.attempts, "token refresh unavailable");
                RefreshOutcome::Unavailable {
                    attempts: state.attempts,
                }
            }
        };

        self.in_flight.lock().take();
        metrics::counter!("credential_refresh_total", "outcome" => outcome.label()).increment(1);
        outcome
    }

    /// Persist the successor state, then make it current.
    async fn install(&self, snapshot: &TokenState, pair: TokenPair) -> RefreshOutcome {
        let rotated = pair.refresh.is_some();
        let next = snapshot.rotate(pair, Utc::now());
        match self.store.persist(&next.credential()).await {
            Ok(source) => {
                info!(
                    source = %source,
                    rotated,
                    expires_at = %next.expires_at,
                    "installed refreshed oauth token"
                );
                self.current.store(Arc::new(next));
                RefreshOutcome::Refreshed
            }
            Err(e) => {
                // The in-memory credential stays as it was
                warn!(error = %e, "refreshed token could not be persisted, discarding it");
                RefreshOutcome::Unavailable { attempts: 1 }
            }
        }
    }
}

/// Provider for an OAuth access/refresh token pair.
pub struct OAuthProvider {
    inner: Arc<Inner>,
    settings: OAuthSettings,
}

impl OAuthProvider {
    /// Wrap an OAuth credential. API keys and pairs with an empty access or
    /// refresh value are rejected.
    pub fn new(
        credential: Credential,
        refresher: TokenRefresher,
        store: Arc<CredentialStore>,
        settings: OAuthSettings,
    ) -> Result<Self> {
        let state = match credential {
            Credential::OAuthToken {
                access,
                refresh,
                expires_at,
            } => {
                if access.is_empty() || refresh.is_empty() {
                    return Err(AuthError::CredentialFormatInvalid {
                        kind: CredentialKind::OAuth,
                        reason: "access and refresh values must both be present".into(),
                    });
                }
                TokenState {
                    access,
                    refresh,
                    expires_at,
                }
            }
            Credential::ApiKey { .. } => {
                return Err(AuthError::CredentialFormatInvalid {
                    kind: CredentialKind::OAuth,
                    reason: "resolved credential is an API key".into(),
                });
            }
        };

        Ok(Self {
            inner: Arc::new(Inner {
                current: ArcSwap::from_pointee(state),
                refresher,
                store,
                in_flight: Mutex::new(None),
                install_lock: Arc::new(tokio::sync::Mutex::new(())),
            }),
            settings,
        })
    }

    pub fn settings(&self) -> &OAuthSettings {
        &self.settings
    }

    /// Whether the current token expires within `window`.
    pub fn expires_within(&self, window: Duration) -> bool {
        self.inner.current.load().expires_within(window, Utc::now())
    }

    /// Refresh unless the token already outlives `window`.
    pub(crate) fn refresh_within(&self, window: Duration) -> RefreshFuture {
        self.join_or_start(Some(window))
    }

    /// Join the in-flight refresh or start one.
    ///
    /// With `unless_fresh`, no exchange starts when the current token no
    /// longer expires within that window: a refresh that finished between
    /// the caller's expiry check and this point already did the work.
    fn join_or_start(&self, unless_fresh: Option<Duration>) -> RefreshFuture {
        let mut slot = self.inner.in_flight.lock();
        if let Some(existing) = slot.as_ref().and_then(WeakShared::upgrade) {
            debug!("joining in-flight token refresh");
            return existing;
        }
        if let Some(window) = unless_fresh
            && !self.inner.current.load().expires_within(window, Utc::now())
        {
            debug!("token already refreshed by another caller");
            return futures::future::ready(RefreshOutcome::NotRequired)
                .boxed()
                .shared();
        }
        let fut = self.inner.clone().run_refresh().boxed().shared();
        *slot = fut.downgrade();
        fut
    }
}

impl Provider for OAuthProvider {
    fn descriptor(&self) -> ProviderDescriptor {
        ProviderDescriptor::for_kind(CredentialKind::OAuth)
    }

    fn get_credential(&self) -> ProviderFuture<'_, Result<Credential>> {
        Box::pin(async move {
            let now = Utc::now();
            let snapshot = self.inner.current.load_full();
            if !snapshot.expires_within(self.settings.refresh_threshold, now) {
                return Ok(snapshot.credential());
            }

            if !self.settings.auto_refresh {
                if snapshot.is_expired(now) {
                    return Err(AuthError::TokenExpiredNoRefresh);
                }
                return Ok(snapshot.credential());
            }

            debug!(
                expires_in_secs = (snapshot.expires_at - now).num_seconds(),
                "token near expiry, refreshing before use"
            );
            match self
                .join_or_start(Some(self.settings.refresh_threshold))
                .await
            {
                RefreshOutcome::Refreshed | RefreshOutcome::NotRequired => {
                    Ok(self.inner.current.load().credential())
                }
                RefreshOutcome::Rejected => Err(AuthError::RefreshRejected),
                RefreshOutcome::Unavailable { attempts } => {
                    let current = self.inner.current.load_full();
                    if current.is_expired(Utc::now()) {
                        Err(AuthError::RefreshUnavailable { attempts })
                    } else {
                        warn!(
                            attempts,
                            expires_in_secs = (current.expires_at - Utc::now()).num_seconds(),
                            "refresh unavailable, using current token until it expires"
                        );
                        Ok(current.credential())
                    }
                }
            }
        })
    }

    fn is_valid(&self) -> bool {
        let state = self.inner.current.load();
        !state.access.is_empty() && !state.is_expired(Utc::now())
    }

    fn refresh(&self) -> ProviderFuture<'_, RefreshOutcome> {
        Box::pin(self.join_or_start(None))
    }

    fn expires_at(&self) -> Option<DateTime<Utc>> {
        Some(self.inner.current.load().expires_at)
    }
}
