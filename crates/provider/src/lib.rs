//! Credential provider abstraction
//!
//! Defines the `Provider` trait that decouples request execution from the
//! authentication strategy. `ApiKeyProvider` holds a static key; the OAuth
//! provider (in `anthropic-oauth`) implements the same trait with token
//! refresh. Callers hold an `Arc<dyn Provider>` chosen once at startup and
//! never need to know which kind is active.

pub mod api_key;
pub mod error;

pub use api_key::ApiKeyProvider;
pub use error::{AuthError, Result};

use chrono::{DateTime, Utc};
use common::{Credential, CredentialKind, ProviderDescriptor};
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by provider operations.
pub type ProviderFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Result of a refresh request. Refresh never fails with an error; the
/// outcome says what happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// A new credential was obtained, persisted and installed.
    Refreshed,
    /// Nothing to refresh (API keys). Counts as success.
    NotRequired,
    /// The token endpoint refused the refresh token. Re-authentication needed.
    Rejected,
    /// Transient failure; the attempt budget was spent.
    Unavailable { attempts: u32 },
}

impl RefreshOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RefreshOutcome::Refreshed | RefreshOutcome::NotRequired)
    }

    /// Label used in logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            RefreshOutcome::Refreshed => "refreshed",
            RefreshOutcome::NotRequired => "not_required",
            RefreshOutcome::Rejected => "rejected",
            RefreshOutcome::Unavailable { .. } => "unavailable",
        }
    }

    /// Error a caller should surface when this outcome ends a request.
    pub fn into_error(self) -> Option<AuthError> {
        match self {
            RefreshOutcome::Refreshed | RefreshOutcome::NotRequired => None,
            RefreshOutcome::Rejected => Some(AuthError::RefreshRejected),
            RefreshOutcome::Unavailable { attempts } => {
                Some(AuthError::RefreshUnavailable { attempts })
            }
        }
    }
}

/// Snapshot of a provider for status reporting. Carries metadata only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderStatus {
    pub kind: CredentialKind,
    pub limit: u64,
    pub valid: bool,
    /// Seconds until expiry (negative once expired). `None` for API keys.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in_secs: Option<i64>,
}

/// Source of valid credentials for outbound calls.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility (`Arc<dyn Provider>`).
pub trait Provider: Send + Sync {
    /// Kind and request-size limit. Fixed for the provider's lifetime.
    fn descriptor(&self) -> ProviderDescriptor;

    /// Return a credential suitable for an immediate call, refreshing first
    /// when the provider decides it is needed.
    fn get_credential(&self) -> ProviderFuture<'_, Result<Credential>>;

    /// Whether the current credential is usable right now. No I/O.
    fn is_valid(&self) -> bool;

    /// Obtain a new credential. Concurrent calls may share one exchange.
    fn refresh(&self) -> ProviderFuture<'_, RefreshOutcome>;

    fn kind(&self) -> CredentialKind {
        self.descriptor().kind
    }

    /// Approximate token limit for a single request with this credential.
    fn limit(&self) -> u64 {
        self.descriptor().limit
    }

    /// Expiry of the current credential, `None` when it never expires.
    fn expires_at(&self) -> Option<DateTime<Utc>> {
        None
    }

    fn status(&self) -> ProviderStatus {
        let descriptor = self.descriptor();
        ProviderStatus {
            kind: descriptor.kind,
            limit: descriptor.limit,
            valid: self.is_valid(),
            expires_in_secs: self
                .expires_at()
                .map(|at| (at - Utc::now()).num_seconds()),
        }
    }
}
