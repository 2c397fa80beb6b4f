//! OAuth credential provider
//!
//! Holds an OAuth access/refresh pair and keeps it valid:
//! - `get_credential()` refreshes when the token is within five minutes of
//!   expiry
//! - concurrent refreshes collapse into one token endpoint exchange
//! - refreshed pairs are persisted through the credential store before they
//!   replace the in-memory credential
//! - `spawn_refresh_task()` refreshes proactively in the background through
//!   the same single-flight path

pub mod provider;
pub mod refresh;

pub use crate::provider::{OAuthProvider, OAuthSettings, REFRESH_THRESHOLD};
pub use crate::refresh::spawn_refresh_task;
