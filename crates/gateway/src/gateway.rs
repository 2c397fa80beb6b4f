//! Credential gateway: the single entry point callers use to make
//! authenticated calls.
//!
//! Per call:
//! 1. Estimate request size against the active credential's limit
//! 2. Fetch a credential from the provider
//! 3. Run the caller's request with that credential
//! 4. On a 401, refresh and retry up to the configured ceiling
//!
//! The active provider is fixed for the gateway's lifetime. There is no
//! fallback to another credential kind when authentication fails.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use provider::{AuthError, Provider, ProviderStatus};
use tracing::{debug, info, warn};

use crate::context::{self, ContextPolicy, SizeVerdict};
use crate::error::{GatewayError, Result};
use crate::metrics;
use crate::transport::{AuthHeader, CallFailure};

/// Default number of calls made before a repeated 401 becomes terminal.
pub const DEFAULT_MAX_AUTH_RETRIES: u32 = 3;

/// Upper bound accepted for the auth retry ceiling.
pub const MAX_AUTH_RETRIES_LIMIT: u32 = 10;

/// Result of a request-size check that did not block the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeCheck {
    pub estimated: u64,
    pub limit: u64,
    pub verdict: SizeVerdict,
    /// A near-limit or over-limit warning was logged.
    pub warned: bool,
}

/// Structured result of a call that reached the caller's request function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome<T> {
    Completed(T),
    /// A non-auth failure. Retrying these is the caller's decision.
    Failed(CallFailure),
}

impl<T> CallOutcome<T> {
    pub fn completed(self) -> Option<T> {
        match self {
            CallOutcome::Completed(value) => Some(value),
            CallOutcome::Failed(_) => None,
        }
    }
}

/// Owns the active provider and applies size policy and 401 recovery.
pub struct CredentialGateway {
    provider: Arc<dyn Provider>,
    policy: ContextPolicy,
    max_auth_retries: u32,
}

impl CredentialGateway {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self {
            provider,
            policy: ContextPolicy::default(),
            max_auth_retries: DEFAULT_MAX_AUTH_RETRIES,
        }
    }

    pub fn with_policy(mut self, policy: ContextPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set the 401 retry ceiling, clamped to `1..=10`.
    pub fn with_max_auth_retries(mut self, max_auth_retries: u32) -> Self {
        self.max_auth_retries = max_auth_retries.clamp(1, MAX_AUTH_RETRIES_LIMIT);
        self
    }

    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    pub fn policy(&self) -> ContextPolicy {
        self.policy
    }

    pub fn max_auth_retries(&self) -> u32 {
        self.max_auth_retries
    }

    /// Kind, limit, validity and expiry distance of the active credential.
    pub fn status(&self) -> ProviderStatus {
        self.provider.status()
    }

    /// Estimate `parts` against the active limit and apply the size policy.
    ///
    /// Runs before any credential fetch or network call. Only `Block` turns
    /// an over-limit estimate into an error.
    pub fn check_request_size<S: AsRef<str>>(&self, parts: &[S]) -> Result<SizeCheck> {
        let descriptor = self.provider.descriptor();
        let estimated = context::estimate(parts);
        let verdict = context::classify(estimated, descriptor.limit);
        let mut check = SizeCheck {
            estimated,
            limit: descriptor.limit,
            verdict,
            warned: false,
        };

        if self.policy == ContextPolicy::Ignore {
            return Ok(check);
        }
        metrics::record_context_check(verdict);

        match (verdict, self.policy) {
            (SizeVerdict::Exceeds, ContextPolicy::Block) => {
                warn!(
                    estimated,
                    limit = descriptor.limit,
                    kind = %descriptor.kind,
                    "request exceeds context limit, blocking"
                );
                Err(GatewayError::RequestSizeExceeded {
                    estimated,
                    limit: descriptor.limit,
                    kind: descriptor.kind,
                })
            }
            (SizeVerdict::NearLimit | SizeVerdict::Exceeds, _) => {
                warn!(
                    estimated,
                    limit = descriptor.limit,
                    kind = %descriptor.kind,
                    percent = estimated.saturating_mul(100) / descriptor.limit.max(1),
                    verdict = verdict.label(),
                    "request is close to or over the context limit"
                );
                check.warned = true;
                Ok(check)
            }
            (SizeVerdict::Within, _) => Ok(check),
        }
    }

    /// Run `call` with a valid credential, recovering from 401s by refreshing.
    ///
    /// `parts` is the request text used for the size check. `call` receives
    /// the credential as an `AuthHeader` and is invoked at most
    /// `max_auth_retries` times.
    pub async fn execute<S, T, F, Fut>(&self, parts: &[S], call: F) -> Result<CallOutcome<T>>
    where
        S: AsRef<str>,
        F: FnMut(AuthHeader) -> Fut,
        Fut: Future<Output = std::result::Result<T, CallFailure>>,
    {
        self.check_request_size(parts)?;
        self.call_with_auth(call).await
    }

    /// `execute` bounded by a caller deadline. On expiry every in-flight
    /// future is dropped, which aborts any outstanding HTTP request.
    pub async fn execute_with_deadline<S, T, F, Fut>(
        &self,
        deadline: Duration,
        parts: &[S],
        call: F,
    ) -> Result<CallOutcome<T>>
    where
        S: AsRef<str>,
        F: FnMut(AuthHeader) -> Fut,
        Fut: Future<Output = std::result::Result<T, CallFailure>>,
    {
        match tokio::time::timeout(deadline, self.execute(parts, call)).await {
            Ok(result) => result,
            Err(_) => {
                info!(deadline_ms = deadline.as_millis() as u64, "call cancelled at deadline");
                Err(GatewayError::Cancelled)
            }
        }
    }

    async fn call_with_auth<T, F, Fut>(&self, mut call: F) -> Result<CallOutcome<T>>
    where
        F: FnMut(AuthHeader) -> Fut,
        Fut: Future<Output = std::result::Result<T, CallFailure>>,
    {
        let kind = self.provider.kind();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let credential = self.provider.get_credential().await?;
            let auth = AuthHeader::try_from_credential(&credential)?;

            let failure = match call(auth).await {
                Ok(value) => return Ok(CallOutcome::Completed(value)),
                Err(failure) => failure,
            };
            metrics::record_call_failure(&failure);

            if failure != CallFailure::Unauthorized {
                debug!(attempt, kind = %kind, failure = failure.label(), "call failed");
                return Ok(CallOutcome::Failed(failure));
            }

            if attempt >= self.max_auth_retries {
                warn!(attempts = attempt, kind = %kind, "credentials rejected, retry ceiling reached");
                return Err(AuthError::Unauthorized { attempts: attempt }.into());
            }

            let outcome = self.provider.refresh().await;
            if let Some(err) = outcome.into_error() {
                warn!(
                    attempt,
                    kind = %kind,
                    outcome = outcome.label(),
                    "refresh after 401 failed"
                );
                return Err(err.into());
            }
            debug!(attempt, kind = %kind, outcome = outcome.label(), "retrying after 401");
        }
    }
}
