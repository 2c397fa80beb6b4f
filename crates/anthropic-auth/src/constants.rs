//! Anthropic OAuth and credential storage constants
//!
//! Public OAuth client configuration matching the Claude CLI. These values
//! are not secrets; they identify the public client application. The
//! refresh exchange shape is community-observed rather than formally
//! documented, so every value here is only a default that config can override.

/// Anthropic's public OAuth client ID (same as Claude CLI)
pub const ANTHROPIC_CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";

/// Token endpoint for token refresh
pub const TOKEN_ENDPOINT: &str = "https://console.anthropic.com/v1/oauth/token";

/// Accepted prefix for Anthropic API keys
pub const API_KEY_PREFIX: &str = "sk-ant-";

/// Keychain service name under which credential material is stored
pub const KEYCHAIN_SERVICE: &str = "anthropic-credentials";

/// Keychain account (entry) name for the active credential set
pub const KEYCHAIN_ACCOUNT: &str = "default";

/// Environment variables read by the environment source
pub const ENV_API_KEY: &str = "ANTHROPIC_API_KEY";
pub const ENV_OAUTH_ACCESS_TOKEN: &str = "ANTHROPIC_OAUTH_ACCESS_TOKEN";
pub const ENV_OAUTH_REFRESH_TOKEN: &str = "ANTHROPIC_OAUTH_REFRESH_TOKEN";
pub const ENV_OAUTH_EXPIRES_AT: &str = "ANTHROPIC_OAUTH_EXPIRES_AT";

/// Default credential file name inside the config directory
pub const CREDENTIALS_FILE_NAME: &str = "credentials.json";
