//! Sync orchestrator
//!
//! One run reconciles a mirror config against its upstream:
//!
//! 1. list the upstream index and keep versions that pass `stable_only` and
//!    the version filter;
//! 2. per version, fetch the checksum manifest once and, when the config asks
//!    for it, check the detached signature before anything is downloaded;
//! 3. per platform, claim the row, download into a temp file while hashing,
//!    compare against the manifest, upload, and only then mark it synced;
//! 4. roll platform results up into version status, move `is_latest`, and
//!    record the run in the history table and metrics.
//!
//! A failing platform is recorded on its own row and never stops siblings or
//! other versions. Only config-level problems end a run with `Err`.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::{StreamExt, stream};
use thiserror::Error;
use tokio::io::AsyncSeekExt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use tfmirror_schema::{
    MirrorConfig, MirrorVersion, Platform, PlatformFilter, RunStatus, Sha256Digest, SyncDetails,
    SyncHistory, SyncStatus, TriggeredBy, VersionFilter, VersionPlatform, is_stable,
    select_latest,
};

use crate::checksum::verify_equals;
use crate::releases::{ChecksumManifest, HttpClients, ReleaseError, ReleaseIndexClient, ReleaseVersion};
use crate::signature::{SignatureError, SignatureVerifier, verifier_from_key};
use crate::storage::{ArtifactStore, artifact_key};
use crate::store::{Claim, DbError, StoreHandle};
use crate::telemetry::MirrorMetrics;

/// Cap on per-run error messages kept in history details.
pub const MAX_RECORDED_ERRORS: usize = 50;

/// Run-level sync failures.
///
/// Platform failures are not errors here; they are recorded on the rows.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("mirror config {0} not found")]
    UnknownConfig(Uuid),

    #[error("release index unavailable: {0}")]
    Index(#[source] ReleaseError),

    #[error("gpg_verify is enabled but no trusted key is configured")]
    MissingTrustedKey,

    #[error("trusted key is unusable: {0}")]
    TrustedKey(#[source] SignatureError),

    #[error("state store error: {0}")]
    Db(#[from] DbError),

    #[error("sync cancelled")]
    Cancelled,
}

impl From<ReleaseError> for SyncError {
    fn from(e: ReleaseError) -> Self {
        match e {
            ReleaseError::Cancelled => Self::Cancelled,
            other => Self::Index(other),
        }
    }
}

/// Tuning knobs for the orchestrator.
#[derive(Debug, Clone, Copy)]
pub struct SyncOptions {
    /// Concurrent platform transfers within a version.
    pub workers: usize,
    /// Claims older than this are considered abandoned.
    pub claim_stale_after: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            workers: 4,
            claim_stale_after: Duration::from_secs(3600),
        }
    }
}

/// Summary of one run, returned to the caller and mirrored into history.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub mirror: String,
    /// The config was disabled and nothing was done.
    pub skipped_disabled: bool,
    pub versions_found: usize,
    pub versions_retained: usize,
    /// Retained versions with at least one synced platform after the run.
    pub versions_synced: u32,
    /// Retained versions whose platforms all failed.
    pub versions_failed: u32,
    /// Platforms stored during this run.
    pub platforms_synced: u32,
    /// Platforms that ended this run in `error`.
    pub platforms_failed: u32,
    /// Platforms already synced with a matching checksum.
    pub platforms_unchanged: u32,
    /// Version carrying `is_latest` after the run.
    pub latest: Option<String>,
    pub errors: Vec<String>,
}

impl SyncReport {
    fn push_error(&mut self, message: String) {
        if self.errors.len() < MAX_RECORDED_ERRORS {
            self.errors.push(message);
        }
    }
}

/// Drives sync runs for any mirror config in the state store.
#[derive(Clone)]
pub struct SyncOrchestrator {
    store: StoreHandle,
    storage: Arc<dyn ArtifactStore>,
    http: HttpClients,
    metrics: Arc<MirrorMetrics>,
    options: SyncOptions,
}

impl fmt::Debug for SyncOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncOrchestrator")
            .field("storage", &self.storage.backend_name())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// A build selected for a version, before it has a row.
#[derive(Debug, Clone)]
struct SelectedBuild {
    platform: Platform,
    filename: String,
    url: String,
}

struct PlatformJob {
    row: VersionPlatform,
    expected: Option<Sha256Digest>,
}

enum PlatformOutcome {
    Synced,
    Failed { platform: Platform, reason: String },
    /// Another worker holds the claim.
    Busy,
    /// Another worker stored the same build first.
    Unchanged,
    Cancelled,
}

enum TransferError {
    Failed(String),
    Cancelled,
}

struct StoredObject {
    key: String,
    sha256: Sha256Digest,
}

#[derive(Default)]
struct VersionOutcome {
    synced: u32,
    failed: u32,
    unchanged: u32,
    errors: Vec<String>,
}

impl SyncOrchestrator {
    pub fn new(
        store: StoreHandle,
        storage: Arc<dyn ArtifactStore>,
        http: HttpClients,
        metrics: Arc<MirrorMetrics>,
        options: SyncOptions,
    ) -> Self {
        Self {
            store,
            storage,
            http,
            metrics,
            options,
        }
    }

    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    pub fn metrics(&self) -> &Arc<MirrorMetrics> {
        &self.metrics
    }

    /// Run one sync of `config_id`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError`] for config-level failures: unknown config, an
    /// unreachable index, an unusable trusted key, a state store failure or
    /// cancellation. These are also written to the config summary and the
    /// history row.
    pub async fn run_sync(
        &self,
        config_id: Uuid,
        triggered_by: TriggeredBy,
        cancel: &CancellationToken,
    ) -> Result<SyncReport, SyncError> {
        let config = self
            .store
            .call(move |db| db.get_config(config_id))
            .await?
            .ok_or(SyncError::UnknownConfig(config_id))?;

        if !config.enabled {
            tracing::info!(mirror = %config.name, "mirror disabled, skipping sync");
            return Ok(SyncReport {
                mirror: config.name,
                skipped_disabled: true,
                ..SyncReport::default()
            });
        }

        let started = Instant::now();
        let mut history = SyncHistory {
            id: Uuid::new_v4(),
            config_id,
            triggered_by,
            started_at: Utc::now(),
            completed_at: None,
            status: RunStatus::Running,
            versions_synced: 0,
            platforms_synced: 0,
            versions_failed: 0,
            error_message: None,
            details: None,
        };
        let row = history.clone();
        self.store.call(move |db| db.insert_history(&row)).await?;
        tracing::info!(mirror = %config.name, %triggered_by, "sync started");

        let mut report = SyncReport {
            mirror: config.name.clone(),
            ..SyncReport::default()
        };
        let result = self.sync_config(&config, cancel, &mut report).await;

        let completed_at = Utc::now();
        let (status, error) = match &result {
            Ok(()) => (RunStatus::Success, None),
            Err(e) => (RunStatus::Failed, Some(e.to_string())),
        };
        history.completed_at = Some(completed_at);
        history.status = status;
        history.error_message = error.clone();
        history.versions_synced = report.versions_synced;
        history.versions_failed = report.versions_failed;
        history.platforms_synced = report.platforms_synced;
        history.details = Some(SyncDetails {
            versions_found: report.versions_found,
            versions_retained: report.versions_retained,
            platforms_failed: report.platforms_failed as usize,
            errors: report.errors.clone(),
        });

        self.metrics
            .observe_sync_duration(&config.name, started.elapsed().as_secs_f64());
        if result.is_err() || report.platforms_failed > 0 {
            self.metrics.sync_error(&config.name);
        }

        let recorded = self
            .store
            .call(move |db| {
                db.complete_history(&history)?;
                db.set_config_sync_status(config_id, status, error.as_deref(), completed_at)
            })
            .await;

        match result {
            Ok(()) => {
                recorded?;
                tracing::info!(
                    mirror = %config.name,
                    versions = report.versions_retained,
                    synced = report.platforms_synced,
                    failed = report.platforms_failed,
                    unchanged = report.platforms_unchanged,
                    latest = report.latest.as_deref().unwrap_or("-"),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "sync finished"
                );
                Ok(report)
            }
            Err(e) => {
                if let Err(db_err) = recorded {
                    tracing::error!(mirror = %config.name, error = %db_err, "failed to record sync outcome");
                }
                tracing::warn!(mirror = %config.name, error = %e, "sync failed");
                Err(e)
            }
        }
    }

    /// Record a run that died before it could complete its own bookkeeping.
    pub async fn record_abandoned_run(&self, config_id: Uuid, reason: String) -> Result<(), SyncError> {
        let at = Utc::now();
        let config = self
            .store
            .call(move |db| {
                let config = db.get_config(config_id)?;
                if config.is_some() {
                    db.fail_running_history(config_id, &reason, at)?;
                    db.set_config_sync_status(config_id, RunStatus::Failed, Some(&reason), at)?;
                }
                Ok(config)
            })
            .await?
            .ok_or(SyncError::UnknownConfig(config_id))?;
        self.metrics.sync_error(&config.name);
        Ok(())
    }

    async fn sync_config(
        &self,
        config: &MirrorConfig,
        cancel: &CancellationToken,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        let verifier = verifier_for(config)?;
        let client = ReleaseIndexClient::new(self.http.clone(), config)?;

        let upstream = client.list_versions(cancel).await?;
        report.versions_found = upstream.len();

        let candidates: Vec<ReleaseVersion> = upstream
            .into_iter()
            .filter(|v| !config.stable_only || is_stable(&v.version))
            .collect();
        let retained = VersionFilter::parse(config.version_filter.as_deref())
            .apply(candidates, |v| v.version.as_str());
        report.versions_retained = retained.len();
        tracing::debug!(
            mirror = %config.name,
            found = report.versions_found,
            retained = retained.len(),
            "filtered upstream versions"
        );

        let config_id = config.id;
        let keys: Vec<(String, Option<DateTime<Utc>>)> = retained
            .iter()
            .map(|v| (v.version.clone(), v.release_date))
            .collect();
        let rows = self
            .store
            .call(move |db| {
                keys.iter()
                    .map(|(version, date)| db.upsert_version(config_id, version, *date))
                    .collect::<Result<Vec<_>, _>>()
            })
            .await?;

        for (release, row) in retained.iter().zip(&rows) {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            let outcome = self
                .sync_version(&client, verifier.as_deref(), config, release, row, cancel)
                .await?;
            report.platforms_synced += outcome.synced;
            report.platforms_failed += outcome.failed;
            report.platforms_unchanged += outcome.unchanged;
            for message in outcome.errors {
                report.push_error(format!("{}: {message}", release.version));
            }
        }

        let names: HashSet<String> = retained.into_iter().map(|v| v.version).collect();
        let versions = self
            .store
            .call(move |db| db.list_versions(config_id, true))
            .await?;
        let kept: Vec<&MirrorVersion> = versions
            .iter()
            .filter(|v| names.contains(&v.version))
            .collect();
        report.versions_synced = count_status(&kept, SyncStatus::Synced);
        report.versions_failed = count_status(&kept, SyncStatus::Error);

        let latest = select_latest(
            kept.iter()
                .copied()
                .filter(|v| v.sync_status == SyncStatus::Synced),
        );
        report.latest = latest.map(|v| v.version.clone());
        let latest_id = latest.map(|v| v.id);
        self.store
            .call(move |db| db.set_latest_version(config_id, latest_id))
            .await?;
        Ok(())
    }

    async fn sync_version(
        &self,
        client: &ReleaseIndexClient,
        verifier: Option<&dyn SignatureVerifier>,
        config: &MirrorConfig,
        release: &ReleaseVersion,
        row: &MirrorVersion,
        cancel: &CancellationToken,
    ) -> Result<VersionOutcome, SyncError> {
        let builds = select_builds(release, &config.platform_filter);
        if builds.is_empty() {
            tracing::debug!(version = %release.version, "no builds pass the platform filter");
            return Ok(VersionOutcome::default());
        }
        let version_id = row.id;

        let manifest = match client.fetch_checksum_manifest(release, cancel).await {
            Ok(manifest) => manifest,
            Err(ReleaseError::Cancelled) => return Err(SyncError::Cancelled),
            Err(e) => {
                let reason = format!("checksum manifest unavailable: {e}");
                return self
                    .fail_version(version_id, &builds, None, reason, false)
                    .await;
            }
        };

        let mut gpg_verified = false;
        if let Some(verifier) = verifier {
            let signature = match client.fetch_manifest_signature(release, cancel).await {
                Ok(sig) => sig,
                Err(ReleaseError::Cancelled) => return Err(SyncError::Cancelled),
                Err(e) => {
                    let reason = format!("manifest signature unavailable: {e}");
                    return self
                        .fail_version(version_id, &builds, Some(&manifest), reason, false)
                        .await;
                }
            };
            if let Err(e) = verifier.verify(&manifest.raw, &signature) {
                let reason = format!("manifest signature invalid: {e}");
                return self
                    .fail_version(version_id, &builds, Some(&manifest), reason, true)
                    .await;
            }
            gpg_verified = true;
        }

        let platforms = self
            .upsert_platforms(version_id, &builds, Some(&manifest))
            .await?;
        if gpg_verified {
            let updated = self
                .store
                .call(move |db| db.backfill_gpg_verified(version_id))
                .await?;
            if updated > 0 {
                tracing::debug!(version = %release.version, updated, "marked stored builds as signature-verified");
            }
        }

        let mut outcome = VersionOutcome::default();
        let mut jobs = Vec::new();
        for row in platforms {
            let expected = manifest.get(&row.filename).cloned();
            let current = match &expected {
                Some(digest) => self.is_current(&row, digest).await,
                None if row.sync_status == SyncStatus::Synced => {
                    tracing::warn!(
                        version = %release.version,
                        file = %row.filename,
                        "manifest no longer lists a stored build, keeping stored copy"
                    );
                    true
                }
                None => false,
            };
            if current {
                outcome.unchanged += 1;
            } else {
                jobs.push(PlatformJob { row, expected });
            }
        }

        let results: Vec<PlatformOutcome> = stream::iter(jobs)
            .map(|job| self.sync_platform(client, &release.version, job, gpg_verified, cancel))
            .buffer_unordered(self.options.workers.max(1))
            .collect()
            .await;

        let mut cancelled = false;
        for result in results {
            match result {
                PlatformOutcome::Synced => outcome.synced += 1,
                PlatformOutcome::Failed { platform, reason } => {
                    outcome.failed += 1;
                    outcome.errors.push(format!("{platform}: {reason}"));
                }
                PlatformOutcome::Unchanged => outcome.unchanged += 1,
                PlatformOutcome::Busy => {}
                PlatformOutcome::Cancelled => cancelled = true,
            }
        }

        self.settle_version(version_id, outcome.errors.first().cloned())
            .await?;
        if cancelled {
            return Err(SyncError::Cancelled);
        }
        Ok(outcome)
    }

    /// Whether a row can be left alone: synced, same checksum, object present.
    async fn is_current(&self, row: &VersionPlatform, expected: &Sha256Digest) -> bool {
        if row.sync_status != SyncStatus::Synced {
            return false;
        }
        if !row
            .sha256
            .as_ref()
            .is_some_and(|stored| stored.matches(expected.as_str()))
        {
            tracing::info!(file = %row.filename, "upstream checksum changed, re-syncing");
            return false;
        }
        let Some(key) = row.storage_key.as_deref() else {
            return false;
        };
        match self.storage.exists(key).await {
            Ok(true) => true,
            Ok(false) => {
                tracing::warn!(key, "stored object is missing, re-syncing");
                false
            }
            Err(e) => {
                tracing::warn!(key, error = %e, "storage presence check failed, keeping synced state");
                true
            }
        }
    }

    async fn sync_platform(
        &self,
        client: &ReleaseIndexClient,
        version: &str,
        job: PlatformJob,
        gpg_verified: bool,
        cancel: &CancellationToken,
    ) -> PlatformOutcome {
        let platform = job.row.platform();
        let id = job.row.id;
        let token = Uuid::new_v4();
        let now = Utc::now().timestamp();
        let stale_before = now.saturating_sub(
            i64::try_from(self.options.claim_stale_after.as_secs()).unwrap_or(i64::MAX),
        );

        let expected = job.expected.clone();
        match self
            .store
            .call(move |db| db.claim_platform(id, token, now, stale_before, expected.as_ref()))
            .await
        {
            Ok(Claim::Acquired) => {}
            Ok(Claim::Held) => {
                tracing::debug!(version, %platform, "platform is claimed by another worker");
                return PlatformOutcome::Busy;
            }
            Ok(Claim::Current) => {
                tracing::debug!(version, %platform, "platform already synced by another worker");
                return PlatformOutcome::Unchanged;
            }
            Err(e) => {
                return PlatformOutcome::Failed {
                    platform,
                    reason: format!("claim failed: {e}"),
                };
            }
        }

        let result = match &job.expected {
            None => Err(TransferError::Failed(format!(
                "no checksum for {} in manifest",
                job.row.filename
            ))),
            Some(expected) => self.transfer(client, version, &job.row, expected, cancel).await,
        };

        match result {
            Ok(stored) => {
                let backend = self.storage.backend_name();
                let recorded = self
                    .store
                    .call(move |db| {
                        db.mark_platform_synced(
                            id,
                            token,
                            &stored.key,
                            backend,
                            &stored.sha256,
                            gpg_verified,
                        )
                    })
                    .await;
                match recorded {
                    Ok(true) => {
                        tracing::info!(version, %platform, "platform synced");
                        PlatformOutcome::Synced
                    }
                    Ok(false) => {
                        tracing::warn!(version, %platform, "claim expired before the result was recorded");
                        PlatformOutcome::Busy
                    }
                    Err(e) => {
                        self.release_claim(id, token).await;
                        PlatformOutcome::Failed {
                            platform,
                            reason: format!("recording sync failed: {e}"),
                        }
                    }
                }
            }
            Err(TransferError::Cancelled) => {
                self.release_claim(id, token).await;
                PlatformOutcome::Cancelled
            }
            Err(TransferError::Failed(reason)) => {
                tracing::warn!(version, %platform, reason = %reason, "platform sync failed");
                let message = reason.clone();
                if let Err(e) = self
                    .store
                    .call(move |db| db.mark_platform_error(id, token, &message))
                    .await
                {
                    tracing::error!(version, %platform, error = %e, "failed to record platform error");
                }
                PlatformOutcome::Failed { platform, reason }
            }
        }
    }

    /// Download, verify, upload, verify again.
    async fn transfer(
        &self,
        client: &ReleaseIndexClient,
        version: &str,
        row: &VersionPlatform,
        expected: &Sha256Digest,
        cancel: &CancellationToken,
    ) -> Result<StoredObject, TransferError> {
        let scratch = tempfile::tempfile()
            .map_err(|e| TransferError::Failed(format!("temp file: {e}")))?;
        let mut file = tokio::fs::File::from_std(scratch);

        let (downloaded, size) = client
            .download_to(&row.upstream_url, &mut file, cancel)
            .await
            .map_err(|e| match e {
                ReleaseError::Cancelled => TransferError::Cancelled,
                other => TransferError::Failed(format!("download failed: {other}")),
            })?;
        verify_equals(expected, &downloaded).map_err(|e| TransferError::Failed(e.to_string()))?;

        file.rewind()
            .await
            .map_err(|e| TransferError::Failed(format!("temp file: {e}")))?;
        let key = artifact_key(version, row.platform(), &row.filename);
        let uploaded = self
            .storage
            .upload(&key, &mut file, size)
            .await
            .map_err(|e| TransferError::Failed(format!("storage upload failed: {e}")))?;

        if let Err(e) = verify_equals(expected, &uploaded.checksum) {
            if let Err(del) = self.storage.delete(&key).await {
                tracing::warn!(key, error = %del, "failed to remove mismatched object");
            }
            return Err(TransferError::Failed(format!("stored object {e}")));
        }
        Ok(StoredObject {
            key,
            sha256: uploaded.checksum,
        })
    }

    async fn release_claim(&self, id: Uuid, token: Uuid) {
        if let Err(e) = self
            .store
            .call(move |db| db.release_claim(id, token))
            .await
        {
            tracing::warn!(error = %e, "failed to release platform claim");
        }
    }

    async fn upsert_platforms(
        &self,
        version_id: Uuid,
        builds: &[SelectedBuild],
        manifest: Option<&ChecksumManifest>,
    ) -> Result<Vec<VersionPlatform>, SyncError> {
        let entries: Vec<(SelectedBuild, Option<Sha256Digest>)> = builds
            .iter()
            .map(|b| (b.clone(), manifest.and_then(|m| m.get(&b.filename)).cloned()))
            .collect();
        Ok(self
            .store
            .call(move |db| {
                entries
                    .iter()
                    .map(|(b, expected)| {
                        db.upsert_platform(version_id, b.platform, &b.url, &b.filename, expected.as_ref())
                    })
                    .collect::<Result<Vec<_>, _>>()
            })
            .await?)
    }

    /// Fail every platform of a version without downloading anything.
    ///
    /// With `include_synced`, stored objects of revoked rows are deleted.
    async fn fail_version(
        &self,
        version_id: Uuid,
        builds: &[SelectedBuild],
        manifest: Option<&ChecksumManifest>,
        reason: String,
        include_synced: bool,
    ) -> Result<VersionOutcome, SyncError> {
        self.upsert_platforms(version_id, builds, manifest).await?;
        let message = reason.clone();
        let failed = self
            .store
            .call(move |db| db.fail_version_platforms(version_id, &message, include_synced))
            .await?;
        tracing::warn!(%version_id, failed = failed.failed, reason = %reason, "version not synced");
        for key in &failed.revoked_keys {
            match self.storage.delete(key).await {
                Ok(()) => tracing::info!(%version_id, key, "deleted revoked object"),
                Err(e) => {
                    tracing::warn!(%version_id, key, error = %e, "failed to delete revoked object, left orphaned");
                }
            }
        }
        self.settle_version(version_id, Some(reason.clone())).await?;
        Ok(VersionOutcome {
            failed: u32::try_from(failed.failed).unwrap_or(u32::MAX),
            errors: vec![reason],
            ..VersionOutcome::default()
        })
    }

    /// Derive the version status from its platforms.
    ///
    /// Any synced platform makes the version synced; otherwise any failed
    /// platform makes it an error. A version with neither stays pending.
    async fn settle_version(&self, version_id: Uuid, error: Option<String>) -> Result<(), SyncError> {
        self.store
            .call(move |db| {
                let counts = db.platform_counts(version_id)?;
                if counts.synced > 0 {
                    db.set_version_status(version_id, SyncStatus::Synced, None)
                } else if counts.error > 0 {
                    let reason = error.as_deref().unwrap_or("all platforms failed");
                    db.set_version_status(version_id, SyncStatus::Error, Some(reason))
                } else {
                    Ok(())
                }
            })
            .await?;
        Ok(())
    }
}

fn verifier_for(config: &MirrorConfig) -> Result<Option<Box<dyn SignatureVerifier>>, SyncError> {
    if !config.gpg_verify {
        return Ok(None);
    }
    let key = config
        .trusted_key
        .as_deref()
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .ok_or(SyncError::MissingTrustedKey)?;
    verifier_from_key(key).map(Some).map_err(SyncError::TrustedKey)
}

/// Supported, filter-passing builds of a release, one per platform.
fn select_builds(release: &ReleaseVersion, filter: &PlatformFilter) -> Vec<SelectedBuild> {
    let mut seen = HashSet::new();
    release
        .builds
        .iter()
        .filter_map(|b| match Platform::parse(&b.os, &b.arch) {
            Ok(platform) => Some((platform, b)),
            Err(e) => {
                tracing::trace!(version = %release.version, error = %e, "skipping unsupported build");
                None
            }
        })
        .filter(|(platform, _)| filter.allows(*platform) && seen.insert(*platform))
        .map(|(platform, b)| SelectedBuild {
            platform,
            filename: b.filename.clone(),
            url: b.url.clone(),
        })
        .collect()
}

fn count_status(versions: &[&MirrorVersion], status: SyncStatus) -> u32 {
    let n = versions.iter().filter(|v| v.sync_status == status).count();
    u32::try_from(n).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::releases::ReleaseBuild;

    fn build(os: &str, arch: &str) -> ReleaseBuild {
        ReleaseBuild {
            os: os.into(),
            arch: arch.into(),
            filename: format!("terraform_1.9.0_{os}_{arch}.zip"),
            url: format!("https://up.example.com/terraform_1.9.0_{os}_{arch}.zip"),
        }
    }

    fn release(builds: Vec<ReleaseBuild>) -> ReleaseVersion {
        ReleaseVersion {
            version: "1.9.0".into(),
            shasums_url: Some("https://up.example.com/terraform_1.9.0_SHA256SUMS".into()),
            signature_url: Some("https://up.example.com/terraform_1.9.0_SHA256SUMS.sig".into()),
            release_date: None,
            builds,
        }
    }

    #[test]
    fn test_select_builds_skips_unsupported_and_duplicates() {
        let rel = release(vec![
            build("linux", "amd64"),
            build("plan9", "amd64"),
            build("linux", "riscv64"),
            build("Linux", "AMD64"),
            build("darwin", "arm64"),
        ]);
        let selected = select_builds(&rel, &PlatformFilter::default());
        let platforms: Vec<String> = selected.iter().map(|b| b.platform.to_string()).collect();
        assert_eq!(platforms, vec!["linux/amd64", "darwin/arm64"]);
        assert_eq!(selected[0].filename, "terraform_1.9.0_linux_amd64.zip");
    }

    #[test]
    fn test_select_builds_applies_platform_filter() {
        let rel = release(vec![build("linux", "amd64"), build("darwin", "arm64")]);
        let filter = PlatformFilter::parse(["darwin/arm64"]).unwrap();
        let selected = select_builds(&rel, &filter);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].platform.to_string(), "darwin/arm64");
    }

    #[test]
    fn test_cancelled_release_error_maps_to_cancelled() {
        assert!(matches!(
            SyncError::from(ReleaseError::Cancelled),
            SyncError::Cancelled
        ));
        let err = SyncError::from(ReleaseError::TooLarge {
            what: "index",
            limit: 1,
        });
        assert!(err.to_string().starts_with("release index unavailable"));
    }

    #[test]
    fn test_gpg_verify_requires_a_key() {
        let mut config = MirrorConfig {
            id: Uuid::nil(),
            name: "tf".into(),
            product: "terraform".into(),
            upstream_url: "https://up.example.com".into(),
            enabled: true,
            platform_filter: PlatformFilter::default(),
            version_filter: None,
            gpg_verify: true,
            stable_only: true,
            sync_interval_hours: 24,
            trusted_key: None,
            signature_suffix: ".sig".into(),
            last_sync_at: None,
            last_sync_status: None,
            last_sync_error: None,
        };
        assert!(matches!(verifier_for(&config), Err(SyncError::MissingTrustedKey)));

        config.trusted_key = Some("not base64!".into());
        assert!(matches!(verifier_for(&config), Err(SyncError::TrustedKey(_))));

        config.gpg_verify = false;
        assert!(verifier_for(&config).unwrap().is_none());
    }
}
