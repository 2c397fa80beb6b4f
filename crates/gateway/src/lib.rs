//! Credential gateway
//!
//! Caller-facing surface of the credential system:
//! - `CredentialGateway` runs calls with a valid credential and recovers
//!   from 401s through the active provider's refresh path
//! - `context` estimates request size against the active kind's limit
//! - `transport` attaches the credential to outbound Messages API calls
//! - `config` and `bootstrap` turn a TOML file into a ready gateway

pub mod bootstrap;
pub mod config;
pub mod context;
pub mod error;
pub mod gateway;
pub mod metrics;
pub mod transport;

pub use bootstrap::{ActiveProvider, Bootstrapped, connect, credential_store};
pub use config::{AuthConfig, Config, ContextConfig, UpstreamConfig};
pub use context::{ContextPolicy, SizeVerdict};
pub use error::{GatewayError, Result};
pub use gateway::{CallOutcome, CredentialGateway, SizeCheck};
pub use transport::{AuthHeader, CallFailure, HttpTransport};
