//! Read-only view of mirrored releases.
//!
//! Only verified state is exposed: pending versions are hidden, and version
//! details carry synced platforms only. Nothing here triggers a sync.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use tfmirror_schema::{
    Arch, MirrorConfig, MirrorVersion, Os, Platform, PlatformError, Sha256Digest, SyncStatus,
    VersionPlatform, version::parse_semver,
};

use crate::storage::{ArtifactStore, StorageError};
use crate::store::{DbError, StoreHandle};
use crate::telemetry::MirrorMetrics;

/// Lifetime of issued download URLs.
pub const DOWNLOAD_URL_TTL: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Error)]
pub enum QueryError {
    /// Caller input is not a semantic version.
    #[error("invalid version {0:?}: expected a semantic version")]
    InvalidVersion(String),

    /// Caller input names an unsupported os or arch.
    #[error(transparent)]
    InvalidPlatform(#[from] PlatformError),

    #[error("mirror {0:?} not found")]
    MirrorNotFound(String),

    #[error("{0} not found")]
    NotFound(String),

    /// Known, but not verified and stored yet.
    #[error("{0} is not yet available")]
    NotYetAvailable(String),

    #[error("state store error: {0}")]
    Db(#[from] DbError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Version as exposed to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionSummary {
    pub version: String,
    pub is_latest: bool,
    pub is_deprecated: bool,
    pub release_date: Option<DateTime<Utc>>,
    pub sync_status: SyncStatus,
    pub synced_at: Option<DateTime<Utc>>,
}

impl From<&MirrorVersion> for VersionSummary {
    fn from(v: &MirrorVersion) -> Self {
        Self {
            version: v.version.clone(),
            is_latest: v.is_latest,
            is_deprecated: v.is_deprecated,
            release_date: v.release_date,
            sync_status: v.sync_status,
            synced_at: v.synced_at,
        }
    }
}

/// A synced build of a version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlatformSummary {
    pub os: Os,
    pub arch: Arch,
    pub filename: String,
    pub sha256: Option<Sha256Digest>,
    pub gpg_verified: bool,
}

impl From<&VersionPlatform> for PlatformSummary {
    fn from(p: &VersionPlatform) -> Self {
        Self {
            os: p.os,
            arch: p.arch,
            filename: p.filename.clone(),
            sha256: p.sha256.clone(),
            gpg_verified: p.gpg_verified,
        }
    }
}

/// A version with its synced platforms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionDetail {
    #[serde(flatten)]
    pub version: VersionSummary,
    pub platforms: Vec<PlatformSummary>,
}

/// Where to fetch one build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadInfo {
    pub os: Os,
    pub arch: Arch,
    pub version: String,
    pub filename: String,
    pub sha256: Sha256Digest,
    pub download_url: String,
}

/// Query service over the persisted mirror state.
#[derive(Debug, Clone)]
pub struct MirrorQueryService {
    store: StoreHandle,
    storage: Arc<dyn ArtifactStore>,
    metrics: Arc<MirrorMetrics>,
}

impl MirrorQueryService {
    pub fn new(store: StoreHandle, storage: Arc<dyn ArtifactStore>, metrics: Arc<MirrorMetrics>) -> Self {
        Self {
            store,
            storage,
            metrics,
        }
    }

    /// Versions with at least one attempt, newest first.
    pub async fn list_versions(&self, mirror: &str) -> Result<Vec<VersionSummary>, QueryError> {
        let config = self.mirror(mirror).await?;
        let versions = self
            .store
            .call(move |db| db.list_versions(config.id, false))
            .await?;
        Ok(versions.iter().map(VersionSummary::from).collect())
    }

    /// The version flagged `is_latest`.
    pub async fn get_latest(&self, mirror: &str) -> Result<VersionDetail, QueryError> {
        let config = self.mirror(mirror).await?;
        let config_id = config.id;
        let version = self
            .store
            .call(move |db| db.latest_version(config_id))
            .await?
            .ok_or_else(|| QueryError::NotFound(format!("latest version of {mirror}")))?;
        self.detail(version).await
    }

    /// One version and its synced platforms.
    pub async fn get_version(&self, mirror: &str, version: &str) -> Result<VersionDetail, QueryError> {
        let version = canonical_version(version)?;
        let config = self.mirror(mirror).await?;
        let row = self
            .find_version(&config, &version)
            .await?
            .filter(|v| v.sync_status != SyncStatus::Pending)
            .ok_or_else(|| QueryError::NotFound(format!("version {version}")))?;
        self.detail(row).await
    }

    /// Issue a time-limited URL for one build.
    ///
    /// Inputs are validated before any lookup. A build that is known but not
    /// yet stored yields [`QueryError::NotYetAvailable`].
    pub async fn resolve_download(
        &self,
        mirror: &str,
        version: &str,
        os: &str,
        arch: &str,
    ) -> Result<DownloadInfo, QueryError> {
        let version = canonical_version(version)?;
        let platform = Platform::parse(os, arch)?;
        let config = self.mirror(mirror).await?;

        let row = self
            .find_version(&config, &version)
            .await?
            .ok_or_else(|| QueryError::NotFound(format!("version {version}")))?;
        let version_id = row.id;
        let build = self
            .store
            .call(move |db| db.get_platform(version_id, platform))
            .await?
            .ok_or_else(|| QueryError::NotFound(format!("{version} for {platform}")))?;

        let label = format!("{version} for {platform}");
        let (Some(key), Some(sha256)) = (build.storage_key.as_deref(), build.sha256.clone()) else {
            return Err(QueryError::NotYetAvailable(label));
        };
        if build.sync_status != SyncStatus::Synced {
            return Err(QueryError::NotYetAvailable(label));
        }

        let download_url = self.storage.get_url(key, DOWNLOAD_URL_TTL).await?;
        self.metrics
            .binary_download(&version, platform.os.as_str(), platform.arch.as_str());
        tracing::debug!(mirror, version, %platform, "issued download url");

        Ok(DownloadInfo {
            os: platform.os,
            arch: platform.arch,
            version,
            filename: build.filename,
            sha256,
            download_url,
        })
    }

    async fn mirror(&self, name: &str) -> Result<MirrorConfig, QueryError> {
        let lookup = name.to_string();
        self.store
            .call(move |db| db.get_config_by_name(&lookup))
            .await?
            .filter(|c| c.enabled)
            .ok_or_else(|| QueryError::MirrorNotFound(name.to_string()))
    }

    async fn find_version(
        &self,
        config: &MirrorConfig,
        version: &str,
    ) -> Result<Option<MirrorVersion>, QueryError> {
        let config_id = config.id;
        let version = version.to_string();
        Ok(self
            .store
            .call(move |db| db.get_version(config_id, &version))
            .await?)
    }

    async fn detail(&self, version: MirrorVersion) -> Result<VersionDetail, QueryError> {
        let version_id = version.id;
        let platforms = self
            .store
            .call(move |db| db.list_platforms(version_id, true))
            .await?;
        Ok(VersionDetail {
            version: VersionSummary::from(&version),
            platforms: platforms.iter().map(PlatformSummary::from).collect(),
        })
    }
}

/// Validate a client-supplied version and drop an optional leading `v`.
fn canonical_version(input: &str) -> Result<String, QueryError> {
    let trimmed = input.trim();
    if parse_semver(trimmed).is_none() {
        return Err(QueryError::InvalidVersion(input.to_string()));
    }
    Ok(trimmed
        .strip_prefix('v')
        .unwrap_or(trimmed)
        .to_string())
}
