//! Anthropic credential storage and token refresh
//!
//! Owns the durable side of the credential lifecycle: reading credential
//! material from prioritized sources, writing refreshed material back, and
//! running the OAuth refresh exchange. Live credentials and refresh
//! coordination belong to the provider crates built on top of this one.
//!
//! Source precedence, highest first:
//! 1. Explicit override (command line or caller supplied)
//! 2. Environment snapshot
//! 3. OS secure storage (`keychain` feature)
//! 4. Local credential file

pub mod constants;
pub mod credentials;
pub mod error;
pub mod sources;
pub mod token;

pub use constants::*;
pub use credentials::{
    AuthMode, CredentialStore, EraseOutcome, Resolved, StoragePreference,
    default_credentials_path,
};
pub use error::{Error, Result};
pub use sources::{CredentialSource, EnvSource, FileSource, MemorySource, SourceKind, StoredMaterial};
pub use token::{
    FailureClass, RefreshAttempts, RefreshEndpoint, RefreshFailure, RefreshFields, RetryPolicy,
    TokenPair, TokenRefresher,
};

#[cfg(feature = "keychain")]
pub use sources::KeychainSource;
