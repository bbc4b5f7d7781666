//! Persisted records: mirror configuration, versions, platforms, sync history.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::hash::Sha256Digest;
use crate::platform::{Arch, Os, Platform, PlatformFilter};

/// Status of a version or platform row.
///
/// `Pending` rows have never been attempted (or are being retried), `Synced`
/// rows are verified and stored, `Error` rows carry a reason in `sync_error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Not yet attempted.
    #[default]
    Pending,
    /// Verified and stored.
    Synced,
    /// Last attempt failed.
    Error,
}

impl SyncStatus {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Synced => "synced",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "synced" => Ok(Self::Synced),
            "error" => Ok(Self::Error),
            _ => Err(format!("unknown sync status: {s}")),
        }
    }
}

/// Outcome of a whole sync run, stored on the config and in history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Run in progress.
    Running,
    /// Run finished; individual platforms may still have failed.
    Success,
    /// Run aborted before platform work (config, index or store failure).
    Failed,
}

impl RunStatus {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("unknown run status: {s}")),
        }
    }
}

/// What started a sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggeredBy {
    /// Periodic scheduler tick.
    Scheduler,
    /// Explicit operator request.
    Manual,
}

impl TriggeredBy {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduler => "scheduler",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for TriggeredBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TriggeredBy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduler" => Ok(Self::Scheduler),
            "manual" => Ok(Self::Manual),
            _ => Err(format!("unknown trigger: {s}")),
        }
    }
}

/// Operator-supplied description of one mirrored product line.
///
/// The sync engine only reads this; the summary fields at the bottom are
/// written by the scheduler after every run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorConfig {
    /// Row identifier.
    pub id: Uuid,
    /// Unique mirror name, used in URLs.
    pub name: String,
    /// Product identifier on the upstream (`terraform`, `tofu`).
    pub product: String,
    /// Upstream base URL, without trailing slash.
    pub upstream_url: String,
    /// Disabled mirrors are neither synced nor served.
    pub enabled: bool,
    /// Platforms to keep; empty keeps all supported platforms.
    pub platform_filter: PlatformFilter,
    /// Version selection pattern (see [`crate::VersionFilter`]).
    pub version_filter: Option<String>,
    /// Require a valid detached signature over each checksum manifest.
    pub gpg_verify: bool,
    /// Drop pre-release and build-metadata versions.
    pub stable_only: bool,
    /// Hours between scheduled runs.
    pub sync_interval_hours: u32,
    /// Base64 public key used to check manifest signatures.
    pub trusted_key: Option<String>,
    /// Suffix appended to the manifest URL to locate its signature.
    pub signature_suffix: String,
    /// When the last run finished.
    pub last_sync_at: Option<DateTime<Utc>>,
    /// Outcome of the last run.
    pub last_sync_status: Option<RunStatus>,
    /// Error of the last run, if it failed.
    pub last_sync_error: Option<String>,
}

impl MirrorConfig {
    /// Base URL without a trailing slash.
    pub fn upstream_base(&self) -> &str {
        self.upstream_url.trim_end_matches('/')
    }
}

/// A release version known to a mirror.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorVersion {
    /// Row identifier.
    pub id: Uuid,
    /// Owning mirror.
    pub config_id: Uuid,
    /// Version string as published upstream.
    pub version: String,
    /// The single highest stable, non-deprecated synced version.
    pub is_latest: bool,
    /// Marked deprecated upstream.
    pub is_deprecated: bool,
    /// Upstream publication time, when known.
    pub release_date: Option<DateTime<Utc>>,
    /// Aggregate status of the version's platforms.
    pub sync_status: SyncStatus,
    /// Reason for `Error`.
    pub sync_error: Option<String>,
    /// When the version first reached `Synced`.
    pub synced_at: Option<DateTime<Utc>>,
}

/// One downloadable build of a version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionPlatform {
    /// Row identifier.
    pub id: Uuid,
    /// Owning version.
    pub version_id: Uuid,
    /// Target OS.
    pub os: Os,
    /// Target architecture.
    pub arch: Arch,
    /// Where the build is downloaded from.
    pub upstream_url: String,
    /// Archive file name, as listed in the checksum manifest.
    pub filename: String,
    /// Checksum of the stored object when synced, else the last expected
    /// value from the manifest (unset when the manifest never listed it).
    pub sha256: Option<Sha256Digest>,
    /// Object key in the artifact store. Set iff `sync_status` is `Synced`.
    pub storage_key: Option<String>,
    /// Backend that holds `storage_key`.
    pub storage_backend: Option<String>,
    /// The stored bytes hashed to the manifest value.
    pub sha256_verified: bool,
    /// The manifest carried a valid signature when this build was stored.
    pub gpg_verified: bool,
    /// Platform status.
    pub sync_status: SyncStatus,
    /// Reason for `Error`.
    pub sync_error: Option<String>,
    /// When the build was stored.
    pub synced_at: Option<DateTime<Utc>>,
}

impl VersionPlatform {
    /// The `os/arch` pair.
    pub fn platform(&self) -> Platform {
        Platform {
            os: self.os,
            arch: self.arch,
        }
    }
}

/// Extra detail recorded with a history row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncDetails {
    /// Versions listed by the upstream index.
    pub versions_found: usize,
    /// Versions left after `stable_only` and the version filter.
    pub versions_retained: usize,
    /// Platforms that ended the run in `Error`.
    pub platforms_failed: usize,
    /// Per-version error messages, capped.
    pub errors: Vec<String>,
}

/// One sync run of one mirror.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncHistory {
    /// Row identifier.
    pub id: Uuid,
    /// Mirror that was synced.
    pub config_id: Uuid,
    /// What started the run.
    pub triggered_by: TriggeredBy,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// End time, unset while running.
    pub completed_at: Option<DateTime<Utc>>,
    /// Outcome.
    pub status: RunStatus,
    /// Versions that have at least one synced platform after the run.
    pub versions_synced: u32,
    /// Platforms stored during the run.
    pub platforms_synced: u32,
    /// Versions whose platforms all failed.
    pub versions_failed: u32,
    /// Run-level error.
    pub error_message: Option<String>,
    /// Counters and per-version errors.
    pub details: Option<SyncDetails>,
}
