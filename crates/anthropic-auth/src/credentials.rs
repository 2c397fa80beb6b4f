//! Credential store: resolution, persistence and erasure across sources
//!
//! The store owns the durable representation of credentials only. Live
//! credentials belong to the providers. Lookup walks sources in precedence
//! order and stops at the first one holding complete material; partial
//! material is skipped and never merged with another source.

use std::path::PathBuf;
use std::sync::Arc;

use common::{Credential, CredentialKind};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::constants::{CREDENTIALS_FILE_NAME, KEYCHAIN_ACCOUNT, KEYCHAIN_SERVICE};
use crate::error::{Error, Result};
use crate::sources::{CredentialSource, EnvSource, FileSource, MemorySource, SourceKind, StoredMaterial};

/// Which credential kind the caller wants resolved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    /// OAuth when a source holds a complete token pair, otherwise an API key.
    #[default]
    Auto,
    ApiKey,
    #[serde(rename = "oauth")]
    OAuth,
}

impl AuthMode {
    /// Pick the credential this mode accepts from one source's material.
    fn select(&self, material: &StoredMaterial) -> Option<Credential> {
        match self {
            AuthMode::Auto => material.oauth().or_else(|| material.api_key()),
            AuthMode::ApiKey => material.api_key(),
            AuthMode::OAuth => material.oauth(),
        }
    }
}

/// Where write-back goes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoragePreference {
    #[default]
    Keychain,
    File,
}

impl StoragePreference {
    fn source_kind(&self) -> SourceKind {
        match self {
            StoragePreference::Keychain => SourceKind::SecureStore,
            StoragePreference::File => SourceKind::File,
        }
    }
}

/// A resolved credential and the source it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    pub credential: Credential,
    pub source: SourceKind,
}

/// Result of clearing every source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EraseOutcome {
    Complete,
    Partial { failed: Vec<SourceKind> },
}

impl EraseOutcome {
    pub fn is_complete(&self) -> bool {
        matches!(self, EraseOutcome::Complete)
    }
}

/// Ordered set of credential sources with a write-back target.
pub struct CredentialStore {
    sources: Vec<Arc<dyn CredentialSource>>,
    write_target: SourceKind,
    allow_file_fallback: bool,
}

impl CredentialStore {
    /// Build a store over the given sources. Sources are sorted into
    /// precedence order regardless of the order passed in.
    pub fn new(mut sources: Vec<Arc<dyn CredentialSource>>) -> Self {
        sources.sort_by_key(|s| s.kind());
        Self {
            sources,
            write_target: SourceKind::SecureStore,
            allow_file_fallback: false,
        }
    }

    /// Standard source set: optional override, environment snapshot, OS
    /// keychain (when built with the `keychain` feature) and the file.
    pub fn standard(overrides: StoredMaterial, credentials_file: PathBuf) -> Self {
        let mut sources: Vec<Arc<dyn CredentialSource>> = Vec::new();
        if !overrides.is_empty() {
            sources.push(Arc::new(MemorySource::override_with(overrides)));
        }
        sources.push(Arc::new(EnvSource::from_env()));
        #[cfg(feature = "keychain")]
        sources.push(Arc::new(crate::sources::KeychainSource::new(
            KEYCHAIN_SERVICE,
            KEYCHAIN_ACCOUNT,
        )));
        #[cfg(not(feature = "keychain"))]
        debug!(
            service = KEYCHAIN_SERVICE,
            account = KEYCHAIN_ACCOUNT,
            "built without keychain support, secure store disabled"
        );
        sources.push(Arc::new(FileSource::new(credentials_file)));
        Self::new(sources)
    }

    pub fn with_storage(mut self, preference: StoragePreference) -> Self {
        self.write_target = preference.source_kind();
        self
    }

    /// Permit `persist` to fall back to the file source when the preferred
    /// target fails. Off by default.
    pub fn with_file_fallback(mut self, allow: bool) -> Self {
        self.allow_file_fallback = allow;
        self
    }

    /// Source kinds in lookup order.
    pub fn source_kinds(&self) -> Vec<SourceKind> {
        self.sources.iter().map(|s| s.kind()).collect()
    }

    /// Resolve the highest-precedence complete credential for `mode`.
    pub async fn resolve(&self, mode: AuthMode) -> Result<Resolved> {
        for source in &self.sources {
            let kind = source.kind();
            let material = match source.read().await {
                Ok(Some(m)) => m,
                Ok(None) => {
                    debug!(source = %kind, "no credential material");
                    continue;
                }
                Err(e) => {
                    warn!(source = %kind, error = %e, "credential source unreadable, skipping");
                    continue;
                }
            };
            match mode.select(&material) {
                Some(credential) => {
                    info!(source = %kind, kind = %credential.kind(), "resolved credential");
                    return Ok(Resolved {
                        credential,
                        source: kind,
                    });
                }
                None => {
                    debug!(source = %kind, ?mode, "incomplete credential material, skipping");
                }
            }
        }
        Err(Error::NotFound)
    }

    /// Resolve a credential of a specific kind.
    pub async fn resolve_kind(&self, kind: CredentialKind) -> Result<Resolved> {
        let mode = match kind {
            CredentialKind::ApiKey => AuthMode::ApiKey,
            CredentialKind::OAuth => AuthMode::OAuth,
        };
        self.resolve(mode).await
    }

    /// Write the full credential to the write-back source.
    ///
    /// Returns the source actually written. Falls back to the file only when
    /// `allow_file_fallback` is set.
    pub async fn persist(&self, credential: &Credential) -> Result<SourceKind> {
        let material = StoredMaterial::from_credential(credential);
        match self.write_to(self.write_target, &material).await {
            Ok(()) => {
                info!(source = %self.write_target, kind = %credential.kind(), "persisted credential");
                Ok(self.write_target)
            }
            Err(e) if self.allow_file_fallback && self.write_target != SourceKind::File => {
                warn!(
                    source = %self.write_target,
                    error = %e,
                    "preferred credential storage failed, falling back to file"
                );
                self.write_to(SourceKind::File, &material).await?;
                info!(source = %SourceKind::File, kind = %credential.kind(), "persisted credential");
                Ok(SourceKind::File)
            }
            Err(e) => {
                warn!(source = %self.write_target, error = %e, "failed to persist credential");
                Err(e)
            }
        }
    }

    async fn write_to(&self, kind: SourceKind, material: &StoredMaterial) -> Result<()> {
        let source = self
            .sources
            .iter()
            .find(|s| s.kind() == kind)
            .ok_or_else(|| Error::storage(kind, "source not configured"))?;
        source
            .write(material)
            .await
            .map_err(|e| match e {
                Error::Storage { .. } | Error::ReadOnly(_) => e,
                other => Error::storage(kind, other.to_string()),
            })
    }

    /// Clear every source, regardless of where the active credential came
    /// from. Failures are collected; every source is always attempted.
    pub async fn erase(&self) -> EraseOutcome {
        let mut failed = Vec::new();
        for source in &self.sources {
            let kind = source.kind();
            match source.clear().await {
                Ok(()) => info!(source = %kind, "erased credential material"),
                Err(e) => {
                    warn!(source = %kind, error = %e, "failed to erase credential material");
                    failed.push(kind);
                }
            }
        }
        if failed.is_empty() {
            EraseOutcome::Complete
        } else {
            EraseOutcome::Partial { failed }
        }
    }
}

/// Default location of the fallback credential file.
pub fn default_credentials_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(KEYCHAIN_SERVICE)
        .join(CREDENTIALS_FILE_NAME)
}
