//! OAuth token refresh exchange
//!
//! POSTs a form to the token endpoint and turns the response into a
//! `TokenPair`. The endpoint URL and every request/response field name are
//! configurable because the exchange is community-observed rather than a
//! published contract.
//!
//! Failures are classified so the retry loop can tell a revoked refresh
//! token (give up immediately) from a transient condition (back off and try
//! again within the attempt budget).

use std::fmt;
use std::time::Duration;

use common::Secret;
use rand::RngExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::constants::{ANTHROPIC_CLIENT_ID, TOKEN_ENDPOINT};
use crate::error::{Error, Result};

/// Lifetime assumed when the response omits the expiry field.
pub const DEFAULT_EXPIRES_IN: Duration = Duration::from_secs(3600);

/// Longest lifetime accepted from a response; larger values are capped.
pub const MAX_EXPIRES_IN: Duration = Duration::from_secs(365 * 24 * 3600);

/// Form parameter and response field names used by the refresh exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshFields {
    pub grant_type_param: String,
    pub grant_type_value: String,
    pub refresh_token_param: String,
    pub client_id_param: String,
    pub access_token_field: String,
    pub refresh_token_field: String,
    pub expires_in_field: String,
}

impl Default for RefreshFields {
    fn default() -> Self {
        Self {
            grant_type_param: "grant_type".into(),
            grant_type_value: "refresh_token".into(),
            refresh_token_param: "refresh_token".into(),
            client_id_param: "client_id".into(),
            access_token_field: "access_token".into(),
            refresh_token_field: "refresh_token".into(),
            expires_in_field: "expires_in".into(),
        }
    }
}

/// Where and how to run the refresh exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshEndpoint {
    pub url: String,
    pub client_id: String,
    pub fields: RefreshFields,
}

impl Default for RefreshEndpoint {
    fn default() -> Self {
        Self {
            url: TOKEN_ENDPOINT.into(),
            client_id: ANTHROPIC_CLIENT_ID.into(),
            fields: RefreshFields::default(),
        }
    }
}

/// Result of a successful exchange.
///
/// `refresh` is `None` when the endpoint did not rotate the refresh token.
/// `expires_in` is a delta from the response time.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenPair {
    pub access: Secret<String>,
    pub refresh: Option<Secret<String>>,
    pub expires_in: Duration,
}

/// Why one exchange attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureClass {
    /// The endpoint refused the refresh token (400/401/403 and other 4xx).
    Unauthorized { status: u16 },
    /// 429. `retry_after` comes from the `Retry-After` header when present.
    RateLimited { retry_after: Option<Duration> },
    /// 5xx or 408.
    Server { status: u16 },
    /// Connection, TLS or timeout failure before a status was received.
    Network,
    /// 2xx with a body that does not carry a usable access token.
    InvalidResponse,
}

impl FailureClass {
    /// Classify a non-success HTTP status.
    pub fn from_status(status: u16, retry_after: Option<Duration>) -> Self {
        match status {
            429 => FailureClass::RateLimited { retry_after },
            408 => FailureClass::Server { status },
            400..=499 => FailureClass::Unauthorized { status },
            _ => FailureClass::Server { status },
        }
    }

    pub fn is_transient(&self) -> bool {
        !matches!(self, FailureClass::Unauthorized { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            FailureClass::Unauthorized { .. } => "unauthorized",
            FailureClass::RateLimited { .. } => "rate_limited",
            FailureClass::Server { .. } => "server",
            FailureClass::Network => "network",
            FailureClass::InvalidResponse => "invalid_response",
        }
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureClass::Unauthorized { status } | FailureClass::Server { status } => {
                write!(f, "{} ({status})", self.label())
            }
            _ => f.write_str(self.label()),
        }
    }
}

/// Attempt bookkeeping for one refresh call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshAttempts {
    pub attempts: u32,
    pub last_failure: Option<FailureClass>,
}

/// Terminal result of a failed refresh call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RefreshFailure {
    #[error("refresh token rejected by token endpoint ({status})")]
    Rejected { status: u16 },

    #[error("token endpoint unavailable after {} attempts (last: {})", .0.attempts, last_failure_label(.0))]
    Unavailable(RefreshAttempts),
}

fn last_failure_label(attempts: &RefreshAttempts) -> String {
    attempts
        .last_failure
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_else(|| "none".into())
}

/// Retry budget and backoff shape for the refresh loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub rate_limit_fallback: Duration,
    pub max_rate_limit_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
            rate_limit_fallback: Duration::from_secs(2),
            max_rate_limit_wait: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Wait before the next attempt after `attempt` (1-based) failed.
    ///
    /// Rate limits honour `Retry-After` up to `max_rate_limit_wait`. Other
    /// transient failures back off exponentially with jitter in
    /// `[delay/2, delay]`.
    pub fn delay(&self, failure: &FailureClass, attempt: u32) -> Duration {
        if let FailureClass::RateLimited { retry_after } = failure {
            return retry_after
                .unwrap_or(self.rate_limit_fallback)
                .min(self.max_rate_limit_wait);
        }
        let exp = attempt.saturating_sub(1).min(16);
        let full = self
            .base_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff);
        let full_ms = full.as_millis() as u64;
        if full_ms < 2 {
            return full;
        }
        Duration::from_millis(rand::rng().random_range(full_ms / 2..=full_ms))
    }
}

/// Runs the refresh exchange with retries.
#[derive(Debug, Clone)]
pub struct TokenRefresher {
    client: reqwest::Client,
    endpoint: RefreshEndpoint,
    policy: RetryPolicy,
}

impl TokenRefresher {
    pub fn new(client: reqwest::Client, endpoint: RefreshEndpoint) -> Self {
        Self {
            client,
            endpoint,
            policy: RetryPolicy::default(),
        }
    }

    /// Build a refresher with its own HTTP client and request timeout.
    pub fn with_timeout(endpoint: RefreshEndpoint, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Http(format!("building token client: {e}")))?;
        Ok(Self::new(client, endpoint))
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn endpoint(&self) -> &RefreshEndpoint {
        &self.endpoint
    }

    /// Exchange `refresh_token` for a new token pair.
    ///
    /// Unauthorized-class failures end the call after one attempt. Transient
    /// failures are retried until `max_attempts` is spent.
    pub async fn refresh(
        &self,
        refresh_token: &Secret<String>,
    ) -> std::result::Result<TokenPair, RefreshFailure> {
        let mut state = RefreshAttempts::default();
        loop {
            state.attempts += 1;
            let failure = match self.exchange(refresh_token).await {
                Ok(pair) => {
                    info!(
                        attempts = state.attempts,
                        rotated = pair.refresh.is_some(),
                        expires_in_secs = pair.expires_in.as_secs(),
                        "token refresh succeeded"
                    );
                    return Ok(pair);
                }
                Err(failure) => failure,
            };

            if let FailureClass::Unauthorized { status } = failure {
                warn!(status, attempts = state.attempts, "refresh token rejected");
                return Err(RefreshFailure::Rejected { status });
            }

            let delay = self.policy.delay(&failure, state.attempts);
            state.last_failure = Some(failure);
            if state.attempts >= self.policy.max_attempts {
                warn!(
                    attempts = state.attempts,
                    last_failure = %last_failure_label(&state),
                    "token refresh attempts exhausted"
                );
                return Err(RefreshFailure::Unavailable(state));
            }

            debug!(
                attempt = state.attempts,
                failure = %last_failure_label(&state),
                delay_ms = delay.as_millis() as u64,
                "token refresh failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// One POST to the token endpoint.
    async fn exchange(
        &self,
        refresh_token: &Secret<String>,
    ) -> std::result::Result<TokenPair, FailureClass> {
        let fields = &self.endpoint.fields;
        let form = [
            (fields.grant_type_param.as_str(), fields.grant_type_value.as_str()),
            (fields.refresh_token_param.as_str(), refresh_token.expose().as_str()),
            (fields.client_id_param.as_str(), self.endpoint.client_id.as_str()),
        ];

        let response = self
            .client
            .post(&self.endpoint.url)
            .form(&form)
            .send()
            .await
            .map_err(|e| {
                debug!(error = %e, "token endpoint request failed");
                FailureClass::Network
            })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(FailureClass::from_status(status.as_u16(), retry_after));
        }

        let body: serde_json::Value = response.json().await.map_err(|e| {
            debug!(error = %e, "token endpoint returned non-JSON body");
            FailureClass::InvalidResponse
        })?;
        parse_token_response(&body, fields).ok_or(FailureClass::InvalidResponse)
    }
}

/// Extract a `TokenPair` from a response body using configured field names.
///
/// A missing or empty refresh field means no rotation. `expires_in` may be a
/// number or a numeric string and is capped at `MAX_EXPIRES_IN`.
pub fn parse_token_response(body: &serde_json::Value, fields: &RefreshFields) -> Option<TokenPair> {
    let access = body
        .get(&fields.access_token_field)?
        .as_str()
        .filter(|s| !s.is_empty())?;
    let refresh = body
        .get(&fields.refresh_token_field)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| Secret::new(s.to_string()));
    let expires_in = match body.get(&fields.expires_in_field) {
        None | Some(serde_json::Value::Null) => DEFAULT_EXPIRES_IN,
        Some(serde_json::Value::String(s)) => Duration::from_secs(s.trim().parse().ok()?),
        Some(v) => Duration::from_secs(v.as_u64()?),
    };
    if expires_in > MAX_EXPIRES_IN {
        warn!(
            expires_in_secs = expires_in.as_secs(),
            "token lifetime out of range, capping it"
        );
    }
    let expires_in = expires_in.min(MAX_EXPIRES_IN);
    Some(TokenPair {
        access: Secret::new(access.to_string()),
        refresh,
        expires_in,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::Form;
    use axum::http::StatusCode;
    use axum::response::{IntoResponse, Response};
    use tokio::net::TcpListener;

    /// Start a mock token endpoint. `respond` gets the zero-based call index
    /// and the submitted form.
    async fn start_token_server<F>(respond: F) -> (String, Arc<AtomicUsize>)
    where
        F: Fn(usize, &HashMap<String, String>) -> Response + Send + Sync + 'static,
    {
        let respond = Arc::new(respond);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        tokio::spawn(async move {
            let app = axum::Router::new().route(
                "/token",
                axum::routing::post(move |Form(form): Form<HashMap<String, String>>| {
                    let counter = counter.clone();
                    let respond = respond.clone();
                    async move {
                        let n = counter.fetch_add(1, Ordering::SeqCst);
                        respond(n, &form)
                    }
                }),
            );
            axum::serve(listener, app).await.unwrap();
        });

        (format!("http://{addr}/token"), calls)
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            rate_limit_fallback: Duration::from_millis(1),
            max_rate_limit_wait: Duration::from_millis(20),
            ..RetryPolicy::default()
        }
    }

    fn refresher(url: String) -> TokenRefresher {
        let endpoint = RefreshEndpoint {
            url,
            ..RefreshEndpoint::default()
        };
        TokenRefresher::new(reqwest::Client::new(), endpoint).with_policy(fast_policy())
    }

    fn ok_json(body: serde_json::Value) -> Response {
        axum::Json(body).into_response()
    }

    #[tokio::test]
    async fn refresh_sends_default_form_and_reads_rotated_pair() {
        let (url, calls) = start_token_server(|_, form| {
            assert_eq!(form.get("grant_type").map(String::as_str), Some("refresh_token"));
            assert_eq!(form.get("refresh_token").map(String::as_str), Some("rt_old"));
            assert_eq!(form.get("client_id").map(String::as_str), Some(ANTHROPIC_CLIENT_ID));
            ok_json(serde_json::json!({
                "access_token": "at_new",
                "refresh_token": "rt_new",
                "expires_in": 7200,
            }))
        })
        .await;

        let pair = refresher(url)
            .refresh(&Secret::new("rt_old".into()))
            .await
            .unwrap();
        assert_eq!(pair.access.expose(), "at_new");
        assert_eq!(pair.refresh.as_ref().map(|s| s.expose().as_str()), Some("rt_new"));
        assert_eq!(pair.expires_in, Duration::from_secs(7200));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unauthorized_gives_up_after_one_call() {
        let (url, calls) = start_token_server(|_, _| {
            (StatusCode::UNAUTHORIZED, r#"{"error":"invalid_grant"}"#).into_response()
        })
        .await;

        let err = refresher(url)
            .refresh(&Secret::new("rt_revoked".into()))
            .await
            .unwrap_err();
        assert_eq!(err, RefreshFailure::Rejected { status: 401 });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn bad_request_is_rejected_not_retried() {
        let (url, calls) = start_token_server(|_, _| {
            StatusCode::BAD_REQUEST.into_response()
        })
        .await;

        let err = refresher(url)
            .refresh(&Secret::new("rt".into()))
            .await
            .unwrap_err();
        assert_eq!(err, RefreshFailure::Rejected { status: 400 });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rate_limit_then_success_takes_two_attempts() {
        let (url, calls) = start_token_server(|n, _| {
            if n == 0 {
                (StatusCode::TOO_MANY_REQUESTS, [("retry-after", "2")]).into_response()
            } else {
                ok_json(serde_json::json!({"access_token": "at_2", "expires_in": 3600}))
            }
        })
        .await;

        let pair = refresher(url)
            .refresh(&Secret::new("rt".into()))
            .await
            .unwrap();
        assert_eq!(pair.access.expose(), "at_2");
        assert!(pair.refresh.is_none(), "refresh value was not rotated");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn server_errors_exhaust_attempt_budget() {
        let (url, calls) = start_token_server(|_, _| {
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        })
        .await;

        let err = refresher(url)
            .refresh(&Secret::new("rt".into()))
            .await
            .unwrap_err();
        match err {
            RefreshFailure::Unavailable(state) => {
                assert_eq!(state.attempts, 3);
                assert_eq!(state.last_failure, Some(FailureClass::Server { status: 503 }));
            }
            other => panic!("expected Unavailable, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn malformed_success_body_is_transient() {
        let (url, calls) = start_token_server(|n, _| {
            if n == 0 {
                ok_json(serde_json::json!({"unexpected": true}))
            } else {
                ok_json(serde_json::json!({"access_token": "at_ok"}))
            }
        })
        .await;

        let pair = refresher(url)
            .refresh(&Secret::new("rt".into()))
            .await
            .unwrap();
        assert_eq!(pair.expires_in, DEFAULT_EXPIRES_IN);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn network_failure_is_unavailable() {
        // Bind then drop a listener so the port refuses connections
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let refresher = refresher(format!("http://{addr}/token"))
            .with_policy(fast_policy().with_max_attempts(2));
        let err = refresher.refresh(&Secret::new("rt".into())).await.unwrap_err();
        assert_eq!(
            err,
            RefreshFailure::Unavailable(RefreshAttempts {
                attempts: 2,
                last_failure: Some(FailureClass::Network),
            })
        );
    }

    #[tokio::test]
    async fn custom_field_names_are_used() {
        let (url, _calls) = start_token_server(|_, form| {
            if form.get("token").map(String::as_str) != Some("rt_custom")
                || form.get("app").map(String::as_str) != Some("my-client")
            {
                return StatusCode::BAD_REQUEST.into_response();
            }
            ok_json(serde_json::json!({
                "bearer": "at_custom",
                "ttl": "120",
            }))
        })
        .await;

        let endpoint = RefreshEndpoint {
            url,
            client_id: "my-client".into(),
            fields: RefreshFields {
                refresh_token_param: "token".into(),
                client_id_param: "app".into(),
                access_token_field: "bearer".into(),
                expires_in_field: "ttl".into(),
                ..RefreshFields::default()
            },
        };
        let pair = TokenRefresher::new(reqwest::Client::new(), endpoint)
            .with_policy(fast_policy())
            .refresh(&Secret::new("rt_custom".into()))
            .await
            .unwrap();
        assert_eq!(pair.access.expose(), "at_custom");
        assert_eq!(pair.expires_in, Duration::from_secs(120));
    }

    #[test]
    fn status_classification() {
        assert_eq!(
            FailureClass::from_status(403, None),
            FailureClass::Unauthorized { status: 403 }
        );
        assert_eq!(
            FailureClass::from_status(408, None),
            FailureClass::Server { status: 408 }
        );
        assert_eq!(
            FailureClass::from_status(502, None),
            FailureClass::Server { status: 502 }
        );
        assert!(FailureClass::from_status(429, None).is_transient());
        assert!(!FailureClass::from_status(401, None).is_transient());
    }

    #[test]
    fn rate_limit_delay_honours_retry_after_with_cap() {
        let policy = RetryPolicy::default();
        let limited = |secs| FailureClass::RateLimited {
            retry_after: Some(Duration::from_secs(secs)),
        };
        assert_eq!(policy.delay(&limited(2), 1), Duration::from_secs(2));
        assert_eq!(policy.delay(&limited(600), 1), Duration::from_secs(60));
        assert_eq!(
            policy.delay(&FailureClass::RateLimited { retry_after: None }, 1),
            Duration::from_secs(2)
        );
    }

    #[test]
    fn backoff_grows_and_stays_capped() {
        let policy = RetryPolicy::default();
        let first = policy.delay(&FailureClass::Network, 1);
        assert!(first >= Duration::from_millis(250) && first <= Duration::from_millis(500));
        let third = policy.delay(&FailureClass::Network, 3);
        assert!(third >= Duration::from_millis(1000) && third <= Duration::from_millis(2000));
        let late = policy.delay(&FailureClass::Server { status: 500 }, 30);
        assert!(late <= Duration::from_secs(8));
    }

    #[test]
    fn parse_rejects_missing_access_token() {
        let fields = RefreshFields::default();
        assert!(parse_token_response(&serde_json::json!({"refresh_token": "rt"}), &fields).is_none());
        assert!(
            parse_token_response(
                &serde_json::json!({"access_token": "at", "expires_in": "soon"}),
                &fields
            )
            .is_none()
        );
    }

    #[test]
    fn parse_caps_out_of_range_lifetime() {
        let fields = RefreshFields::default();
        for expires_in in [
            serde_json::json!(u64::MAX),
            serde_json::json!("1000000000000000"),
        ] {
            let body = serde_json::json!({"access_token": "at", "expires_in": expires_in});
            let pair = parse_token_response(&body, &fields).unwrap();
            assert_eq!(pair.expires_in, MAX_EXPIRES_IN);
        }

        let body = serde_json::json!({"access_token": "at", "expires_in": 7200});
        let pair = parse_token_response(&body, &fields).unwrap();
        assert_eq!(pair.expires_in, Duration::from_secs(7200));
    }

    #[test]
    fn refresh_fields_deserialize_partially() {
        let fields: RefreshFields = toml::from_str(r#"access_token_field = "token""#).unwrap();
        assert_eq!(fields.access_token_field, "token");
        assert_eq!(fields.expires_in_field, "expires_in");
    }

    #[test]
    fn endpoint_defaults() {
        let endpoint = RefreshEndpoint::default();
        assert_eq!(endpoint.url, "https://console.anthropic.com/v1/oauth/token");
        assert_eq!(endpoint.client_id, "9d1c250a-e61b-44d9-88ed-5944d1962f5e");
    }
}
