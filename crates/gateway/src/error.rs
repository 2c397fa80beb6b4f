//! Gateway error types

use common::CredentialKind;
use provider::AuthError;
use thiserror::Error;

/// Errors that end a gateway call before a structured result exists.
///
/// Non-auth upstream failures are not errors here; they come back as
/// `CallOutcome::Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("{}", size_exceeded_message(.estimated, .limit, .kind))]
    RequestSizeExceeded {
        estimated: u64,
        limit: u64,
        kind: CredentialKind,
    },

    #[error("call cancelled: caller deadline elapsed")]
    Cancelled,

    #[error("no usable credential found in any source")]
    NoCredential,

    #[error("gateway setup failed: {0}")]
    Setup(String),
}

fn size_exceeded_message(estimated: &u64, limit: &u64, kind: &CredentialKind) -> String {
    let other = kind.other();
    let mut message = format!(
        "request of ~{estimated} tokens exceeds the {limit}-token limit for {kind} credentials"
    );
    if other.context_limit() > *limit {
        message.push_str(&format!(
            "; {other} credentials allow up to {}",
            other.context_limit()
        ));
    }
    message
}

impl GatewayError {
    /// Short operator hint for this failure.
    pub fn remediation(&self) -> &'static str {
        match self {
            GatewayError::Auth(e) => e.remediation(),
            GatewayError::RequestSizeExceeded { kind, .. } => match kind {
                CredentialKind::OAuth => "reduce the request or switch to an API key",
                CredentialKind::ApiKey => "reduce the request",
            },
            GatewayError::Cancelled => "retry later",
            GatewayError::NoCredential => "re-authenticate",
            GatewayError::Setup(_) => "check configuration",
        }
    }
}

/// Result alias for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
