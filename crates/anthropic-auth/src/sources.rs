//! Backing sources for credential material
//!
//! Each source holds at most one `StoredMaterial` record and can answer
//! present/absent, store a full record, or clear it. Sources are consulted
//! in `SourceKind` order: explicit override, environment, secure store, file.
//!
//! Uses `Pin<Box<dyn Future>>` return types so the store can hold
//! `Arc<dyn CredentialSource>`.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use common::Credential;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants::{
    ENV_API_KEY, ENV_OAUTH_ACCESS_TOKEN, ENV_OAUTH_EXPIRES_AT, ENV_OAUTH_REFRESH_TOKEN,
};
use crate::error::{Error, Result};

/// Where credential material lives. Declaration order is lookup precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Override,
    Environment,
    SecureStore,
    File,
}

impl SourceKind {
    pub fn label(&self) -> &'static str {
        match self {
            SourceKind::Override => "override",
            SourceKind::Environment => "environment",
            SourceKind::SecureStore => "secure_store",
            SourceKind::File => "file",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Durable representation of credential material.
///
/// Every field is optional because sources may hold partial material; only
/// complete material converts into a `Credential`. `expires_at` is RFC 3339
/// UTC (unix milliseconds are also accepted on read).
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMaterial {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
}

impl fmt::Debug for StoredMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredMaterial")
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("access_token", &self.access_token.as_ref().map(|_| "[REDACTED]"))
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl StoredMaterial {
    pub fn from_credential(credential: &Credential) -> Self {
        match credential {
            Credential::ApiKey { value } => Self {
                api_key: Some(value.expose().clone()),
                ..Self::default()
            },
            Credential::OAuthToken {
                access,
                refresh,
                expires_at,
            } => Self {
                access_token: Some(access.expose().clone()),
                refresh_token: Some(refresh.expose().clone()),
                expires_at: Some(expires_at.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
                ..Self::default()
            },
        }
    }

    /// Complete OAuth material: access, refresh and a parseable expiry.
    pub fn oauth(&self) -> Option<Credential> {
        let access = non_empty(&self.access_token)?;
        let refresh = non_empty(&self.refresh_token)?;
        let expires_at = parse_expiry(self.expires_at.as_deref()?)?;
        Some(Credential::oauth(access, refresh, expires_at))
    }

    /// Complete API key material: a non-empty key.
    pub fn api_key(&self) -> Option<Credential> {
        non_empty(&self.api_key).map(Credential::api_key)
    }

    pub fn is_empty(&self) -> bool {
        self.api_key.is_none()
            && self.access_token.is_none()
            && self.refresh_token.is_none()
            && self.expires_at.is_none()
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_ref().filter(|v| !v.trim().is_empty()).cloned()
}

/// Parse an expiry given as RFC 3339 or unix milliseconds.
pub fn parse_expiry(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    raw.parse::<i64>()
        .ok()
        .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
}

/// Boxed future returned by source operations.
pub type SourceFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// A backing store for credential material.
pub trait CredentialSource: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Read the stored record, `None` when the source holds nothing.
    fn read(&self) -> SourceFuture<'_, Option<StoredMaterial>>;

    /// Replace the stored record.
    fn write<'a>(&'a self, material: &'a StoredMaterial) -> SourceFuture<'a, ()>;

    /// Remove the stored record. Clearing an empty source succeeds.
    fn clear(&self) -> SourceFuture<'_, ()>;
}

/// In-process source. Backs the explicit override channel.
pub struct MemorySource {
    kind: SourceKind,
    state: Mutex<Option<StoredMaterial>>,
}

impl MemorySource {
    pub fn new(kind: SourceKind) -> Self {
        Self {
            kind,
            state: Mutex::new(None),
        }
    }

    /// Explicit override populated from the command line or caller.
    pub fn override_with(material: StoredMaterial) -> Self {
        Self {
            kind: SourceKind::Override,
            state: Mutex::new((!material.is_empty()).then_some(material)),
        }
    }
}

impl CredentialSource for MemorySource {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    fn read(&self) -> SourceFuture<'_, Option<StoredMaterial>> {
        let material = self.state.lock().clone();
        Box::pin(async move { Ok(material) })
    }

    fn write<'a>(&'a self, material: &'a StoredMaterial) -> SourceFuture<'a, ()> {
        *self.state.lock() = Some(material.clone());
        Box::pin(async { Ok(()) })
    }

    fn clear(&self) -> SourceFuture<'_, ()> {
        self.state.lock().take();
        Box::pin(async { Ok(()) })
    }
}

/// Snapshot of the process environment taken at construction.
///
/// The process environment itself is never written; `clear` drops the
/// snapshot so erased material is not resolved again by this process.
pub struct EnvSource {
    vars: Mutex<HashMap<String, String>>,
}

const ENV_KEYS: [&str; 4] = [
    ENV_API_KEY,
    ENV_OAUTH_ACCESS_TOKEN,
    ENV_OAUTH_REFRESH_TOKEN,
    ENV_OAUTH_EXPIRES_AT,
];

impl EnvSource {
    pub fn from_env() -> Self {
        Self::from_vars(
            ENV_KEYS
                .iter()
                .filter_map(|key| std::env::var(key).ok().map(|v| (key.to_string(), v))),
        )
    }

    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .filter(|(k, _)| ENV_KEYS.contains(&k.as_str()))
            .collect();
        Self {
            vars: Mutex::new(vars),
        }
    }
}

impl CredentialSource for EnvSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Environment
    }

    fn read(&self) -> SourceFuture<'_, Option<StoredMaterial>> {
        let vars = self.vars.lock();
        let material = StoredMaterial {
            api_key: vars.get(ENV_API_KEY).cloned(),
            access_token: vars.get(ENV_OAUTH_ACCESS_TOKEN).cloned(),
            refresh_token: vars.get(ENV_OAUTH_REFRESH_TOKEN).cloned(),
            expires_at: vars.get(ENV_OAUTH_EXPIRES_AT).cloned(),
        };
        drop(vars);
        Box::pin(async move { Ok((!material.is_empty()).then_some(material)) })
    }

    fn write<'a>(&'a self, _material: &'a StoredMaterial) -> SourceFuture<'a, ()> {
        Box::pin(async { Err(Error::ReadOnly(SourceKind::Environment)) })
    }

    fn clear(&self) -> SourceFuture<'_, ()> {
        self.vars.lock().clear();
        Box::pin(async { Ok(()) })
    }
}

/// OS secure storage (macOS Keychain, Windows Credential Manager, Linux
/// kernel keyring). One entry holds the JSON-encoded material.
///
/// On Linux the kernel keyring is session-scoped: entries do not survive a
/// reboot. Hosts that need a token to persist across reboots should use
/// `storage = "file"`.
#[cfg(feature = "keychain")]
pub struct KeychainSource {
    service: String,
    account: String,
}

#[cfg(feature = "keychain")]
impl KeychainSource {
    pub fn new(service: impl Into<String>, account: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            account: account.into(),
        }
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(keyring::Entry) -> std::result::Result<T, keyring::Error> + Send + 'static,
    {
        let service = self.service.clone();
        let account = self.account.clone();
        tokio::task::spawn_blocking(move || {
            let entry = keyring::Entry::new(&service, &account)?;
            op(entry)
        })
        .await
        .map_err(|e| Error::storage(SourceKind::SecureStore, format!("keychain task failed: {e}")))?
        .map_err(|e| Error::storage(SourceKind::SecureStore, e.to_string()))
    }
}

#[cfg(feature = "keychain")]
impl CredentialSource for KeychainSource {
    fn kind(&self) -> SourceKind {
        SourceKind::SecureStore
    }

    fn read(&self) -> SourceFuture<'_, Option<StoredMaterial>> {
        Box::pin(async move {
            let stored = self
                .blocking(|entry| match entry.get_password() {
                    Ok(json) => Ok(Some(json)),
                    Err(keyring::Error::NoEntry) => Ok(None),
                    Err(e) => Err(e),
                })
                .await?;
            stored
                .map(|json| {
                    serde_json::from_str(&json).map_err(|e| {
                        Error::CredentialParse(format!("parsing keychain entry: {e}"))
                    })
                })
                .transpose()
        })
    }

    fn write<'a>(&'a self, material: &'a StoredMaterial) -> SourceFuture<'a, ()> {
        Box::pin(async move {
            let json = serde_json::to_string(material)
                .map_err(|e| Error::CredentialParse(format!("serializing credentials: {e}")))?;
            self.blocking(move |entry| entry.set_password(&json)).await
        })
    }

    fn clear(&self) -> SourceFuture<'_, ()> {
        Box::pin(async move {
            self.blocking(|entry| match entry.delete_credential() {
                Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
                Err(e) => Err(e),
            })
            .await
        })
    }
}

/// Local JSON file fallback.
///
/// All writes use atomic temp-file + rename to prevent corruption on crash.
/// A tokio Mutex serializes concurrent writes.
pub struct FileSource {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileSource {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CredentialSource for FileSource {
    fn kind(&self) -> SourceKind {
        SourceKind::File
    }

    fn read(&self) -> SourceFuture<'_, Option<StoredMaterial>> {
        Box::pin(async move {
            let contents = match tokio::fs::read_to_string(&self.path).await {
                Ok(c) => c,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(Error::Io(format!("reading credential file: {e}"))),
            };
            let material: StoredMaterial = serde_json::from_str(&contents)
                .map_err(|e| Error::CredentialParse(format!("parsing credential file: {e}")))?;
            Ok((!material.is_empty()).then_some(material))
        })
    }

    fn write<'a>(&'a self, material: &'a StoredMaterial) -> SourceFuture<'a, ()> {
        Box::pin(async move {
            let _guard = self.write_lock.lock().await;
            write_atomic(&self.path, material).await
        })
    }

    fn clear(&self) -> SourceFuture<'_, ()> {
        Box::pin(async move {
            let _guard = self.write_lock.lock().await;
            match tokio::fs::remove_file(&self.path).await {
                Ok(()) => {
                    debug!(path = %self.path.display(), "removed credential file");
                    Ok(())
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(Error::Io(format!("removing credential file: {e}"))),
            }
        })
    }
}

/// Write credential material to a file atomically.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target. Sets file permissions to 0600 (owner read/write only) since
/// the file contains tokens.
async fn write_atomic(path: &Path, data: &StoredMaterial) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::CredentialParse(format!("serializing credentials: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("credential path has no parent directory".into()))?;
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| Error::Io(format!("creating credential directory: {e}")))?;

    let tmp_path = dir.join(format!(".credentials.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp credential file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting credential file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp credential file: {e}")))?;

    debug!(path = %path.display(), "persisted credential file");
    Ok(())
}
