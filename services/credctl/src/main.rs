//! credctl: operator CLI for the credential store
//!
//! - `status` shows the active credential kind, limit and expiry
//! - `login` stores an API key or an OAuth token pair
//! - `logout` erases credential material from every source
//! - `refresh` runs one OAuth refresh through the provider
//! - `check-size` estimates a request body against the active limit

use std::path::PathBuf;
use std::sync::Arc;

use anthropic_auth::{EraseOutcome, StoredMaterial};
use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};
use common::{Credential, Secret};
use credential_gateway::{Config, GatewayError, bootstrap, context};
use provider::{ApiKeyProvider, Provider as _};
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "credctl", version, about = "Manage inference API credentials")]
struct Cli {
    /// Config file (defaults to $CREDCTL_CONFIG, then ./credctl.toml)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Use this API key instead of stored credentials
    #[arg(long, global = true, env = "CREDCTL_API_KEY", hide_env_values = true)]
    with_api_key: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show the active credential
    Status,
    /// Store a credential in the configured storage
    Login(LoginArgs),
    /// Erase credential material from every source
    Logout,
    /// Refresh the stored OAuth token now
    Refresh,
    /// Estimate a Messages API request body against the active limit
    CheckSize {
        /// JSON request body
        #[arg(long)]
        file: PathBuf,
    },
}

#[derive(Debug, clap::Args)]
struct LoginArgs {
    #[arg(long, conflicts_with_all = ["access", "refresh", "expires_in"])]
    api_key: Option<String>,

    #[arg(long, requires_all = ["refresh", "expires_in"])]
    access: Option<String>,

    #[arg(long, requires = "access")]
    refresh: Option<String>,

    /// Seconds until the access token expires
    #[arg(long, requires = "access")]
    expires_in: Option<i64>,
}

impl LoginArgs {
    fn credential(&self, api_key_prefix: &str) -> Result<Credential> {
        match (&self.api_key, &self.access, &self.refresh, self.expires_in) {
            (Some(key), None, None, None) => {
                // Validate before anything reaches storage
                ApiKeyProvider::new(Secret::new(key.clone()), api_key_prefix)?;
                Ok(Credential::api_key(key.clone()))
            }
            (None, Some(access), Some(refresh), Some(expires_in)) => {
                if access.trim().is_empty() || refresh.trim().is_empty() {
                    bail!("access and refresh values must not be empty");
                }
                if expires_in <= 0 {
                    bail!("--expires-in must be positive");
                }
                Ok(Credential::oauth(
                    access.clone(),
                    refresh.clone(),
                    Utc::now() + chrono::Duration::seconds(expires_in),
                ))
            }
            _ => bail!("pass either --api-key or --access, --refresh and --expires-in"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // JSON logs on stderr, LOG_LEVEL / RUST_LOG filter, stdout stays for output
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr),
        )
        .init();

    let cli = Cli::parse();

    let config_path = Config::resolve_path(cli.config.as_deref());
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    info!(path = %config_path.display(), mode = ?config.auth.mode, "configuration loaded");

    let overrides = StoredMaterial {
        api_key: cli.with_api_key.clone(),
        ..StoredMaterial::default()
    };
    let store = Arc::new(bootstrap::credential_store(&config.auth, overrides));

    match cli.command {
        Command::Status => {
            let ready = connect(&config, store).await?;
            let status = ready.gateway.status();
            let report = serde_json::json!({
                "kind": status.kind,
                "source": ready.source,
                "context_limit": status.limit,
                "valid": status.valid,
                "expires_in_secs": status.expires_in_secs,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Login(args) => {
            let credential = args.credential(&config.auth.api_key_prefix)?;
            let source = store
                .persist(&credential)
                .await
                .context("failed to store credential")?;
            println!("stored {} credential in {source}", credential.kind());
        }
        Command::Logout => match store.erase().await {
            EraseOutcome::Complete => println!("credentials erased"),
            EraseOutcome::Partial { failed } => {
                let names: Vec<&str> = failed.iter().map(|k| k.label()).collect();
                bail!(
                    "credentials may remain in: {} (erase them manually)",
                    names.join(", ")
                );
            }
        },
        Command::Refresh => {
            let ready = connect(&config, store).await?;
            let outcome = ready.active.as_dyn().refresh().await;
            if let Some(err) = outcome.into_error() {
                bail!("refresh failed: {err} ({})", err.remediation());
            }
            println!("refresh: {}", outcome.label());
        }
        Command::CheckSize { file } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let body: serde_json::Value = serde_json::from_str(&raw)
                .with_context(|| format!("{} is not valid JSON", file.display()))?;
            let ready = connect(&config, store).await?;
            let check = ready
                .gateway
                .check_request_size(&context::text_parts(&body))
                .map_err(with_remediation)?;
            println!(
                "estimated {} of {} tokens: {}",
                check.estimated,
                check.limit,
                check.verdict.label()
            );
        }
    }

    Ok(())
}

async fn connect(
    config: &Config,
    store: Arc<anthropic_auth::CredentialStore>,
) -> Result<bootstrap::Bootstrapped> {
    bootstrap::connect(config, store)
        .await
        .map_err(with_remediation)
}

fn with_remediation(err: GatewayError) -> anyhow::Error {
    anyhow::anyhow!("{err} ({})", err.remediation())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use common::CredentialKind;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    fn login(args: &[&str]) -> std::result::Result<Cli, clap::Error> {
        let mut argv = vec!["credctl", "login"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv)
    }

    fn login_args(cli: Cli) -> LoginArgs {
        match cli.command {
            Command::Login(args) => args,
            other => panic!("expected login, got {other:?}"),
        }
    }

    #[test]
    fn login_api_key() {
        let args = login_args(login(&["--api-key", "sk-ant-abc"]).unwrap());
        let credential = args.credential("sk-ant-").unwrap();
        assert_eq!(credential.kind(), CredentialKind::ApiKey);
    }

    #[test]
    fn login_rejects_bad_prefix() {
        let args = login_args(login(&["--api-key", "nope"]).unwrap());
        assert!(args.credential("sk-ant-").is_err());
    }

    #[test]
    fn login_oauth_pair() {
        let args = login_args(
            login(&["--access", "at", "--refresh", "rt", "--expires-in", "3600"]).unwrap(),
        );
        let credential = args.credential("sk-ant-").unwrap();
        assert_eq!(credential.kind(), CredentialKind::OAuth);
        let expires_at = credential.expires_at().unwrap();
        assert!(expires_at > Utc::now() + chrono::Duration::minutes(59));
    }

    #[test]
    fn login_requires_complete_pair() {
        assert!(login(&["--access", "at"]).is_err());
        assert!(login(&["--api-key", "sk-ant-x", "--access", "at"]).is_err());

        let args = login_args(login(&[]).unwrap());
        assert!(args.credential("sk-ant-").is_err());
    }

    #[test]
    fn login_rejects_non_positive_expiry() {
        let args = login_args(
            login(&["--access", "at", "--refresh", "rt", "--expires-in", "0"]).unwrap(),
        );
        assert!(args.credential("sk-ant-").is_err());
    }

    #[test]
    fn global_flags_parse_after_subcommand() {
        let cli = Cli::try_parse_from(["credctl", "status", "--config", "/tmp/c.toml"]).unwrap();
        assert_eq!(cli.config.as_deref(), Some("/tmp/c.toml"));
        assert!(matches!(cli.command, Command::Status));
    }

    #[test]
    fn remediation_is_attached() {
        let err = with_remediation(GatewayError::NoCredential);
        assert_eq!(
            err.to_string(),
            "no usable credential found in any source (re-authenticate)"
        );
    }
}
