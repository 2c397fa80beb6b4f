//! Credential data model
//!
//! A `Credential` is either a long-lived API key or an OAuth access/refresh
//! pair with an absolute UTC expiry. The kind is a closed enum so every call
//! site handles both variants exhaustively.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Secret;

/// Request-size limit (approximate tokens) when authenticating with an API key.
pub const API_KEY_CONTEXT_LIMIT: u64 = 1_000_000;

/// Request-size limit (approximate tokens) when authenticating with OAuth.
pub const OAUTH_CONTEXT_LIMIT: u64 = 200_000;

/// Which kind of credential a provider holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialKind {
    ApiKey,
    #[serde(rename = "oauth")]
    OAuth,
}

impl CredentialKind {
    /// Label used in logs, metrics and config.
    pub fn label(&self) -> &'static str {
        match self {
            CredentialKind::ApiKey => "api_key",
            CredentialKind::OAuth => "oauth",
        }
    }

    /// Request-size limit for this kind.
    pub fn context_limit(&self) -> u64 {
        match self {
            CredentialKind::ApiKey => API_KEY_CONTEXT_LIMIT,
            CredentialKind::OAuth => OAUTH_CONTEXT_LIMIT,
        }
    }

    /// The other kind. Used to tell callers which credential raises the limit.
    pub fn other(&self) -> CredentialKind {
        match self {
            CredentialKind::ApiKey => CredentialKind::OAuth,
            CredentialKind::OAuth => CredentialKind::ApiKey,
        }
    }
}

impl fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for CredentialKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "api_key" => Ok(CredentialKind::ApiKey),
            "oauth" => Ok(CredentialKind::OAuth),
            other => Err(crate::Error::Config(format!(
                "unknown credential kind {other:?}, expected \"api_key\" or \"oauth\""
            ))),
        }
    }
}

/// Kind and request-size limit of a provider. Immutable after construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderDescriptor {
    pub kind: CredentialKind,
    pub limit: u64,
}

impl ProviderDescriptor {
    pub fn for_kind(kind: CredentialKind) -> Self {
        Self {
            kind,
            limit: kind.context_limit(),
        }
    }
}

/// Credential material supplied to the inference API.
#[derive(Debug, Clone, PartialEq)]
pub enum Credential {
    ApiKey {
        value: Secret<String>,
    },
    OAuthToken {
        access: Secret<String>,
        refresh: Secret<String>,
        expires_at: DateTime<Utc>,
    },
}

impl Credential {
    pub fn api_key(value: impl Into<String>) -> Self {
        Credential::ApiKey {
            value: Secret::new(value.into()),
        }
    }

    pub fn oauth(
        access: impl Into<String>,
        refresh: impl Into<String>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Credential::OAuthToken {
            access: Secret::new(access.into()),
            refresh: Secret::new(refresh.into()),
            expires_at,
        }
    }

    pub fn kind(&self) -> CredentialKind {
        match self {
            Credential::ApiKey { .. } => CredentialKind::ApiKey,
            Credential::OAuthToken { .. } => CredentialKind::OAuth,
        }
    }

    /// Expiry of an OAuth token. API keys never expire.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Credential::ApiKey { .. } => None,
            Credential::OAuthToken { expires_at, .. } => Some(*expires_at),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn kind_limits_are_fixed() {
        assert_eq!(CredentialKind::ApiKey.context_limit(), 1_000_000);
        assert_eq!(CredentialKind::OAuth.context_limit(), 200_000);
        assert_eq!(
            ProviderDescriptor::for_kind(CredentialKind::OAuth).limit,
            200_000
        );
    }

    #[test]
    fn kind_parses_only_known_labels() {
        assert_eq!(
            "api_key".parse::<CredentialKind>().unwrap(),
            CredentialKind::ApiKey
        );
        assert_eq!(
            "oauth".parse::<CredentialKind>().unwrap(),
            CredentialKind::OAuth
        );
        assert!("OAuth2".parse::<CredentialKind>().is_err());
    }

    #[test]
    fn kind_deserializes_from_config_labels() {
        #[derive(Deserialize)]
        struct Wrapper {
            kind: CredentialKind,
        }
        let w: Wrapper = toml::from_str(r#"kind = "oauth""#).unwrap();
        assert_eq!(w.kind, CredentialKind::OAuth);
        let w: Wrapper = toml::from_str(r#"kind = "api_key""#).unwrap();
        assert_eq!(w.kind, CredentialKind::ApiKey);
    }

    #[test]
    fn debug_output_never_contains_values() {
        let cred = Credential::oauth("at_secret", "rt_secret", Utc::now());
        let debug = format!("{cred:?}");
        assert!(!debug.contains("at_secret"));
        assert!(!debug.contains("rt_secret"));
        assert!(debug.contains("OAuthToken"));
    }

    #[test]
    fn expires_at_only_for_oauth() {
        let at = Utc::now() + Duration::hours(1);
        assert_eq!(Credential::oauth("a", "r", at).expires_at(), Some(at));
        assert_eq!(Credential::api_key("sk-ant-x").expires_at(), None);
        assert_eq!(
            CredentialKind::ApiKey.other(),
            CredentialKind::OAuth,
            "other() flips the kind"
        );
    }
}
