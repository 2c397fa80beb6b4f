//! Error types for credential storage and the refresh exchange

use crate::sources::SourceKind;

/// Errors from credential storage and token endpoint operations.
///
/// Messages carry source names and statuses only, never credential values.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("no complete credential material found in any source")]
    NotFound,

    #[error("{source_kind} storage failed: {reason}")]
    Storage {
        source_kind: SourceKind,
        reason: String,
    },

    #[error("{0} source is read-only")]
    ReadOnly(SourceKind),

    #[error("credential parse error: {0}")]
    CredentialParse(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl Error {
    pub(crate) fn storage(source_kind: SourceKind, reason: impl Into<String>) -> Self {
        Error::Storage {
            source_kind,
            reason: reason.into(),
        }
    }
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, Error>;
