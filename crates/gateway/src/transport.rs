//! Outbound inference transport
//!
//! Credentials travel with each call as an `AuthHeader`; nothing is read
//! from or written to process-wide state. Exactly one header form is sent:
//! `x-api-key` for API keys, `Authorization: Bearer` for OAuth tokens.

use std::time::Duration;

use common::{Credential, CredentialKind, Secret};
use provider::AuthError;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use tracing::{debug, warn};

/// Beta flags required when authenticating with an OAuth token. Merged with
/// any caller-provided flags (deduplicated).
const REQUIRED_OAUTH_BETA_FLAGS: &[&str] = &["oauth-2025-04-20"];

/// Anthropic API version header value.
pub const ANTHROPIC_VERSION: &str = "2023-06-01";

const X_API_KEY: HeaderName = HeaderName::from_static("x-api-key");
const ANTHROPIC_BETA: HeaderName = HeaderName::from_static("anthropic-beta");
const ANTHROPIC_VERSION_HEADER: HeaderName = HeaderName::from_static("anthropic-version");

/// Authentication material for one outbound call.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthHeader {
    ApiKey(Secret<String>),
    Bearer(Secret<String>),
}

impl AuthHeader {
    pub fn from_credential(credential: &Credential) -> Self {
        match credential {
            Credential::ApiKey { value } => AuthHeader::ApiKey(value.clone()),
            Credential::OAuthToken { access, .. } => AuthHeader::Bearer(access.clone()),
        }
    }

    /// Like `from_credential`, but refuses values that cannot be sent as a
    /// header.
    pub fn try_from_credential(credential: &Credential) -> Result<Self, AuthError> {
        let header = Self::from_credential(credential);
        header.apply(&mut HeaderMap::new())?;
        Ok(header)
    }

    pub fn kind(&self) -> CredentialKind {
        match self {
            AuthHeader::ApiKey(_) => CredentialKind::ApiKey,
            AuthHeader::Bearer(_) => CredentialKind::OAuth,
        }
    }

    /// Write this credential into `headers`, removing the other form.
    ///
    /// OAuth calls also get the required `anthropic-beta` flags. Both kinds
    /// get `anthropic-version` unless the caller already set one.
    pub fn apply(&self, headers: &mut HeaderMap) -> Result<(), AuthError> {
        headers.remove(AUTHORIZATION);
        headers.remove(X_API_KEY);

        match self {
            AuthHeader::ApiKey(key) => {
                headers.insert(X_API_KEY, sensitive_value(key.expose(), self.kind())?);
            }
            AuthHeader::Bearer(token) => {
                let bearer = format!("Bearer {}", token.expose());
                headers.insert(AUTHORIZATION, sensitive_value(&bearer, self.kind())?);
                merge_beta_headers(headers);
            }
        }

        if !headers.contains_key(ANTHROPIC_VERSION_HEADER) {
            headers.insert(
                ANTHROPIC_VERSION_HEADER,
                HeaderValue::from_static(ANTHROPIC_VERSION),
            );
        }
        Ok(())
    }
}

fn sensitive_value(value: &str, kind: CredentialKind) -> Result<HeaderValue, AuthError> {
    let mut header = HeaderValue::from_str(value).map_err(|_| AuthError::CredentialFormatInvalid {
        kind,
        reason: "value contains characters not allowed in an HTTP header".into(),
    })?;
    header.set_sensitive(true);
    Ok(header)
}

/// Merge required anthropic-beta flags with any caller-provided flags.
///
/// Reads the existing `anthropic-beta` header, splits by comma, combines with
/// the required set, deduplicates, and writes back as a single comma-separated
/// header value.
fn merge_beta_headers(headers: &mut HeaderMap) {
    let mut flags: Vec<String> = REQUIRED_OAUTH_BETA_FLAGS
        .iter()
        .map(|s| s.to_string())
        .collect();

    if let Some(existing) = headers.get(&ANTHROPIC_BETA)
        && let Ok(existing_str) = existing.to_str()
    {
        for flag in existing_str.split(',') {
            let trimmed = flag.trim().to_string();
            if !trimmed.is_empty() && !flags.contains(&trimmed) {
                flags.push(trimmed);
            }
        }
    }

    match HeaderValue::from_str(&flags.join(",")) {
        Ok(v) => {
            headers.insert(ANTHROPIC_BETA, v);
        }
        Err(e) => {
            warn!(error = %e, "failed to construct merged anthropic-beta header");
        }
    }
}

/// Why an outbound call failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallFailure {
    /// 401: the credential was refused.
    Unauthorized,
    RateLimited { retry_after: Option<Duration> },
    Server { status: u16 },
    Client { status: u16 },
    Network(String),
    /// The request could not be built locally.
    InvalidRequest(String),
    InvalidResponse(String),
}

impl CallFailure {
    /// Classify a non-success upstream status.
    pub fn from_status(status: u16, retry_after: Option<Duration>) -> Self {
        match status {
            401 => CallFailure::Unauthorized,
            429 => CallFailure::RateLimited { retry_after },
            408 | 500..=599 => CallFailure::Server { status },
            _ => CallFailure::Client { status },
        }
    }

    /// Label used in logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            CallFailure::Unauthorized => "unauthorized",
            CallFailure::RateLimited { .. } => "rate_limited",
            CallFailure::Server { .. } => "server",
            CallFailure::Client { .. } => "client",
            CallFailure::Network(_) => "network",
            CallFailure::InvalidRequest(_) => "invalid_request",
            CallFailure::InvalidResponse(_) => "invalid_response",
        }
    }
}

/// Minimal Messages API client that authenticates per call.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// POST `body` to `/v1/messages` with `auth` and `extra` headers.
    pub async fn send_messages(
        &self,
        body: &serde_json::Value,
        auth: AuthHeader,
        extra: &HeaderMap,
    ) -> Result<serde_json::Value, CallFailure> {
        let mut headers = extra.clone();
        auth.apply(&mut headers)
            .map_err(|e| CallFailure::InvalidRequest(e.to_string()))?;

        let url = format!("{}/v1/messages", self.base_url);
        let response = self
            .client
            .post(&url)
            .headers(headers)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                let kind = if e.is_timeout() { "timeout" } else { "connection" };
                CallFailure::Network(format!("{kind}: {e}"))
            })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            debug!(status = status.as_u16(), "upstream returned non-success status");
            return Err(CallFailure::from_status(status.as_u16(), retry_after));
        }

        response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| CallFailure::InvalidResponse(format!("invalid upstream body: {e}")))
    }
}
