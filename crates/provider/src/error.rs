//! Authentication failure family

use common::CredentialKind;

/// Errors surfaced when a credential cannot be supplied or is refused.
///
/// Messages carry metadata only (kind, attempt counts), never credential
/// values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("access token expired and automatic refresh is disabled")]
    TokenExpiredNoRefresh,

    #[error("refresh token was rejected by the token endpoint")]
    RefreshRejected,

    #[error("token endpoint unavailable after {attempts} attempts")]
    RefreshUnavailable { attempts: u32 },

    #[error("{kind} credential is malformed: {reason}")]
    CredentialFormatInvalid {
        kind: CredentialKind,
        reason: String,
    },

    #[error("upstream rejected credentials after {attempts} attempts")]
    Unauthorized { attempts: u32 },
}

impl AuthError {
    /// Whether retrying later can succeed without user action.
    pub fn is_transient(&self) -> bool {
        matches!(self, AuthError::RefreshUnavailable { .. })
    }

    /// Short operator hint for this failure.
    pub fn remediation(&self) -> &'static str {
        if self.is_transient() {
            "retry later"
        } else {
            "re-authenticate"
        }
    }
}

/// Result alias for provider operations.
pub type Result<T> = std::result::Result<T, AuthError>;
