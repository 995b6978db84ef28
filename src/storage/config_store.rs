//! Versioned, immutable tenant configuration storage.
//!
//! Each saved configuration becomes `<base>/<tenant_id>/v<N>.json`. Versions
//! are allocated under an exclusive lock on `<base>/<tenant_id>/.lock`.
//! A version is written to a temporary file and hard-linked into place, so
//! an existing version is never overwritten and a failed write never leaves
//! a partial one behind.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;

use crate::core::config_graph::{ConfigError, ConfigGraphService};
use crate::domain::TenantConfiguration;

/// A persisted configuration version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredConfiguration {
    pub tenant_id: String,

    /// 1-based, allocated in save order
    pub version: u32,

    pub created_at: DateTime<Utc>,

    /// `sha256:<hex>` of the serialized configuration
    pub checksum: String,

    pub configuration: TenantConfiguration,
}

#[derive(Debug, Error)]
pub enum ConfigStoreError {
    #[error(transparent)]
    Invalid(#[from] ConfigError),

    #[error("invalid tenant id '{0}'")]
    InvalidTenantId(String),

    #[error("no configuration stored for tenant '{0}'")]
    NoConfiguration(String),

    #[error("tenant '{tenant_id}' has no version {version}")]
    VersionNotFound { tenant_id: String, version: u32 },

    #[error("checksum mismatch for tenant '{tenant_id}' version {version}")]
    ChecksumMismatch { tenant_id: String, version: u32 },

    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

/// File-backed configuration store
pub struct ConfigStore {
    base_dir: PathBuf,
    graphs: ConfigGraphService,
}

impl ConfigStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            graphs: ConfigGraphService::new(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn tenant_dir(&self, tenant_id: &str) -> Result<PathBuf, ConfigStoreError> {
        let valid = !tenant_id.is_empty()
            && !tenant_id.starts_with('.')
            && tenant_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid {
            return Err(ConfigStoreError::InvalidTenantId(tenant_id.to_string()));
        }
        Ok(self.base_dir.join(tenant_id))
    }

    fn version_path(dir: &Path, version: u32) -> PathBuf {
        dir.join(format!("v{}.json", version))
    }

    /// Validate and persist a raw configuration document as a new version
    pub fn save(&self, raw: &Value) -> Result<StoredConfiguration, ConfigStoreError> {
        let configuration = self.graphs.load(raw)?;
        self.graphs.build_graph(&configuration)?;

        let dir = self.tenant_dir(&configuration.tenant_id)?;
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create directory: {}", dir.display()))?;

        let lock_path = dir.join(".lock");
        let lock = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&lock_path)
            .with_context(|| format!("Failed to open lock file: {}", lock_path.display()))?;
        lock.lock_exclusive()
            .context("Failed to acquire configuration lock")?;

        let version = Self::versions_in(&dir)?.last().copied().unwrap_or(0) + 1;
        let stored = StoredConfiguration {
            tenant_id: configuration.tenant_id.clone(),
            version,
            created_at: Utc::now(),
            checksum: checksum(&configuration)?,
            configuration,
        };

        let path = Self::version_path(&dir, version);
        let json = serde_json::to_string_pretty(&stored)
            .context("Failed to serialize configuration")?;
        let tmp = path.with_extension("json.tmp");
        // The version only becomes visible once fully written
        let written = write_synced(&tmp, json.as_bytes()).and_then(|()| {
            fs::hard_link(&tmp, &path)
                .with_context(|| format!("Refusing to overwrite {}", path.display()))
        });
        let _ = fs::remove_file(&tmp);
        written?;

        // Lock is released when `lock` is dropped
        info!(
            tenant_id = %stored.tenant_id,
            version = stored.version,
            "Configuration saved"
        );
        Ok(stored)
    }

    /// Load one version, verifying its checksum
    pub fn load_version(
        &self,
        tenant_id: &str,
        version: u32,
    ) -> Result<StoredConfiguration, ConfigStoreError> {
        let path = Self::version_path(&self.tenant_dir(tenant_id)?, version);
        if !path.exists() {
            return Err(ConfigStoreError::VersionNotFound {
                tenant_id: tenant_id.to_string(),
                version,
            });
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let stored: StoredConfiguration = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;

        if checksum(&stored.configuration)? != stored.checksum {
            return Err(ConfigStoreError::ChecksumMismatch {
                tenant_id: tenant_id.to_string(),
                version,
            });
        }
        Ok(stored)
    }

    /// Most recently created version
    pub fn load_latest(&self, tenant_id: &str) -> Result<StoredConfiguration, ConfigStoreError> {
        let latest = self
            .list_versions(tenant_id)?
            .last()
            .copied()
            .ok_or_else(|| ConfigStoreError::NoConfiguration(tenant_id.to_string()))?;
        self.load_version(tenant_id, latest)
    }

    /// Stored versions in ascending order
    pub fn list_versions(&self, tenant_id: &str) -> Result<Vec<u32>, ConfigStoreError> {
        Ok(Self::versions_in(&self.tenant_dir(tenant_id)?)?)
    }

    fn versions_in(dir: &Path) -> anyhow::Result<Vec<u32>> {
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut versions = Vec::new();
        for entry in fs::read_dir(dir)? {
            let name = entry?.file_name();
            let version = name
                .to_str()
                .and_then(|n| n.strip_prefix('v'))
                .and_then(|n| n.strip_suffix(".json"))
                .and_then(|n| n.parse::<u32>().ok());
            if let Some(version) = version {
                versions.push(version);
            }
        }
        versions.sort_unstable();
        Ok(versions)
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    file.write_all(bytes)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    file.sync_all().context("Failed to sync configuration")?;
    Ok(())
}

fn checksum(configuration: &TenantConfiguration) -> anyhow::Result<String> {
    let bytes = serde_json::to_vec(configuration).context("Failed to serialize configuration")?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}
