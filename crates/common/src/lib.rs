//! Common types shared by the credential crates
//!
//! Holds the credential data model (`Credential`, `CredentialKind`,
//! `ProviderDescriptor`), the `Secret` redaction wrapper, and the
//! configuration error type used by every crate that parses config.

mod credential;
mod error;
mod secret;

pub use credential::{
    API_KEY_CONTEXT_LIMIT, Credential, CredentialKind, OAUTH_CONTEXT_LIMIT, ProviderDescriptor,
};
pub use error::{Error, Result};
pub use secret::Secret;
