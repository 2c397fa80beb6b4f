//! Configuration types and loading
//!
//! Config precedence: CLI arg > `CREDCTL_CONFIG` env var > `credctl.toml`.
//! Every field has a default, so a missing file yields a working config.
//! Credential values themselves never live in this file; they come from the
//! credential sources.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anthropic_auth::{
    ANTHROPIC_CLIENT_ID, API_KEY_PREFIX, AuthMode, RefreshEndpoint, RefreshFields,
    StoragePreference, TOKEN_ENDPOINT, default_credentials_path,
};
use serde::Deserialize;

use crate::context::ContextPolicy;
use crate::gateway::{DEFAULT_MAX_AUTH_RETRIES, MAX_AUTH_RETRIES_LIMIT};

/// Environment variable naming the config file.
pub const CONFIG_PATH_ENV: &str = "CREDCTL_CONFIG";

/// Config file used when neither the CLI nor the environment names one.
pub const DEFAULT_CONFIG_FILE: &str = "credctl.toml";

/// Root configuration
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub auth: AuthConfig,
    pub context: ContextConfig,
    pub upstream: UpstreamConfig,
}

/// Credential selection, storage and refresh settings
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub mode: AuthMode,
    pub storage: StoragePreference,
    /// Persist to the credentials file when the secure store is unavailable.
    pub allow_file_fallback: bool,
    /// Defaults to `<config dir>/anthropic-credentials/credentials.json`.
    pub credentials_file: Option<PathBuf>,
    pub auto_refresh: bool,
    pub max_refresh_attempts: u32,
    pub max_auth_retries: u32,
    pub token_endpoint: String,
    pub client_id: String,
    pub api_key_prefix: String,
    /// Background refresh interval. 0 disables the background task.
    pub refresh_interval_secs: u64,
    pub fields: RefreshFields,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            mode: AuthMode::default(),
            storage: StoragePreference::default(),
            allow_file_fallback: false,
            credentials_file: None,
            auto_refresh: true,
            max_refresh_attempts: 3,
            max_auth_retries: DEFAULT_MAX_AUTH_RETRIES,
            token_endpoint: TOKEN_ENDPOINT.into(),
            client_id: ANTHROPIC_CLIENT_ID.into(),
            api_key_prefix: API_KEY_PREFIX.into(),
            refresh_interval_secs: 60,
            fields: RefreshFields::default(),
        }
    }
}

/// Request-size policy
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub policy: ContextPolicy,
}

/// Inference API settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub url: String,
    pub timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: "https://api.anthropic.com".into(),
            timeout_secs: 60,
        }
    }
}

impl UpstreamConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl AuthConfig {
    /// Token endpoint settings for the refresh exchange.
    pub fn refresh_endpoint(&self) -> RefreshEndpoint {
        RefreshEndpoint {
            url: self.token_endpoint.clone(),
            client_id: self.client_id.clone(),
            fields: self.fields.clone(),
        }
    }

    /// Credentials file path, falling back to the per-user default.
    pub fn credentials_path(&self) -> PathBuf {
        self.credentials_file
            .clone()
            .unwrap_or_else(default_credentials_path)
    }

    /// `None` when background refresh is disabled.
    pub fn refresh_interval(&self) -> Option<Duration> {
        (self.refresh_interval_secs > 0).then(|| Duration::from_secs(self.refresh_interval_secs))
    }
}

impl Config {
    /// Load configuration from a TOML file. A missing file yields defaults.
    pub fn load(path: &Path) -> common::Result<Self> {
        let config = match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Config::default(),
            Err(e) => return Err(e.into()),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        check_range("max_refresh_attempts", self.auth.max_refresh_attempts)?;
        check_range("max_auth_retries", self.auth.max_auth_retries)?;

        for (name, url) in [
            ("upstream.url", &self.upstream.url),
            ("auth.token_endpoint", &self.auth.token_endpoint),
        ] {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(common::Error::Config(format!(
                    "{name} must start with http:// or https://, got: {url}"
                )));
            }
        }

        if self.upstream.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }

        if self.auth.client_id.trim().is_empty() {
            return Err(common::Error::Config("client_id must not be empty".into()));
        }

        Ok(())
    }

    /// Resolve config file path from CLI arg or `CREDCTL_CONFIG`.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var(CONFIG_PATH_ENV) {
            return PathBuf::from(p);
        }
        PathBuf::from(DEFAULT_CONFIG_FILE)
    }
}

fn check_range(name: &str, value: u32) -> common::Result<()> {
    if !(1..=MAX_AUTH_RETRIES_LIMIT).contains(&value) {
        return Err(common::Error::Config(format!(
            "{name} must be between 1 and {MAX_AUTH_RETRIES_LIMIT}, got: {value}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Serializes tests that mutate environment variables.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// SAFETY: Callers must hold ENV_MUTEX to prevent concurrent env mutation.
    unsafe fn set_env(key: &str, val: &str) {
        unsafe { std::env::set_var(key, val) };
    }

    unsafe fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) };
    }

    fn write_config(dir: &tempfile::TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("credctl.toml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = Config::load(Path::new("/nonexistent/path/credctl.toml")).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.auth.mode, AuthMode::Auto);
        assert_eq!(config.auth.storage, StoragePreference::Keychain);
        assert!(config.auth.auto_refresh);
        assert_eq!(config.auth.max_auth_retries, 3);
        assert_eq!(config.context.policy, ContextPolicy::Warn);
        assert_eq!(config.auth.refresh_endpoint(), RefreshEndpoint::default());
    }

    #[test]
    fn full_config_round_trips_into_types() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[auth]
mode = "oauth"
storage = "file"
allow_file_fallback = true
credentials_file = "/tmp/creds.json"
auto_refresh = false
max_refresh_attempts = 5
max_auth_retries = 2
token_endpoint = "https://auth.example.com/token"
client_id = "client-123"
api_key_prefix = "sk-test-"
refresh_interval_secs = 0

[auth.fields]
access_token_field = "token"
expires_in_field = "ttl"

[context]
policy = "block"

[upstream]
url = "http://localhost:9000"
timeout_secs = 5
"#,
        );

        let config = Config::load(&path).unwrap();
        assert_eq!(config.auth.mode, AuthMode::OAuth);
        assert_eq!(config.auth.storage, StoragePreference::File);
        assert!(config.auth.allow_file_fallback);
        assert_eq!(config.auth.credentials_path(), PathBuf::from("/tmp/creds.json"));
        assert!(!config.auth.auto_refresh);
        assert_eq!(config.auth.max_refresh_attempts, 5);
        assert_eq!(config.auth.max_auth_retries, 2);
        assert_eq!(config.auth.api_key_prefix, "sk-test-");
        assert_eq!(config.auth.refresh_interval(), None);
        assert_eq!(config.context.policy, ContextPolicy::Block);
        assert_eq!(config.upstream.timeout(), Duration::from_secs(5));

        let endpoint = config.auth.refresh_endpoint();
        assert_eq!(endpoint.url, "https://auth.example.com/token");
        assert_eq!(endpoint.client_id, "client-123");
        assert_eq!(endpoint.fields.access_token_field, "token");
        assert_eq!(endpoint.fields.expires_in_field, "ttl");
        // Unset field names keep their defaults
        assert_eq!(endpoint.fields.grant_type_param, "grant_type");
    }

    #[test]
    fn invalid_toml_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "not valid {{{{ toml");
        assert!(matches!(Config::load(&path), Err(common::Error::Toml(_))));
    }

    #[test]
    fn unknown_mode_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "[auth]\nmode = \"password\"\n");
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn retry_bounds_enforced() {
        let dir = tempfile::tempdir().unwrap();
        for body in [
            "[auth]\nmax_auth_retries = 0\n",
            "[auth]\nmax_auth_retries = 11\n",
            "[auth]\nmax_refresh_attempts = 0\n",
            "[auth]\nmax_refresh_attempts = 42\n",
        ] {
            let path = write_config(&dir, body);
            let err = Config::load(&path).unwrap_err();
            assert!(
                err.to_string().contains("must be between 1 and 10"),
                "unexpected error for {body:?}: {err}"
            );
        }

        let path = write_config(&dir, "[auth]\nmax_auth_retries = 10\nmax_refresh_attempts = 1\n");
        assert!(Config::load(&path).is_ok());
    }

    #[test]
    fn invalid_urls_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "[upstream]\nurl = \"api.anthropic.com\"\n");
        let err = Config::load(&path).unwrap_err().to_string();
        assert!(err.contains("upstream.url must start with http"), "got: {err}");

        let path = write_config(&dir, "[auth]\ntoken_endpoint = \"ftp://x\"\n");
        let err = Config::load(&path).unwrap_err().to_string();
        assert!(err.contains("auth.token_endpoint"), "got: {err}");
    }

    #[test]
    fn zero_timeout_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "[upstream]\ntimeout_secs = 0\n");
        assert!(Config::load(&path).is_err(), "timeout_secs = 0 must be rejected");
    }

    #[test]
    fn default_credentials_path_used_when_unset() {
        let config = AuthConfig::default();
        assert_eq!(config.credentials_path(), default_credentials_path());
        assert_eq!(config.refresh_interval(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn resolve_path_cli_overrides_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env(CONFIG_PATH_ENV, "/env/should-lose.toml") };
        assert_eq!(
            Config::resolve_path(Some("/cli/wins.toml")),
            PathBuf::from("/cli/wins.toml"),
            "CLI arg must take precedence over CREDCTL_CONFIG"
        );
        assert_eq!(Config::resolve_path(None), PathBuf::from("/env/should-lose.toml"));
        unsafe { remove_env(CONFIG_PATH_ENV) };
    }

    #[test]
    fn resolve_path_default() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env(CONFIG_PATH_ENV) };
        assert_eq!(Config::resolve_path(None), PathBuf::from("credctl.toml"));
    }
}
