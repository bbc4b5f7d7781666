//! SQLite state database
//!
//! Holds mirror configs, the versions and platforms each mirror knows about,
//! and the history of sync runs.

use std::fmt::Display;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use tfmirror_schema::{
    MirrorConfig, MirrorVersion, Platform, PlatformFilter, RunStatus, Sha256Digest, SyncDetails,
    SyncHistory, SyncStatus, VersionPlatform,
};

#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON column error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("database actor stopped")]
    ActorDied,
}

/// Row counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: u32,
    pub synced: u32,
    pub error: u32,
}

/// Platforms failed in bulk, with the objects that stopped being referenced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailedPlatforms {
    pub failed: usize,
    /// Storage keys of previously synced rows that were revoked.
    pub revoked_keys: Vec<String>,
}

/// Result of trying to claim a platform row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// The caller now owns the row.
    Acquired,
    /// Another worker holds a live claim.
    Held,
    /// The row is already synced with the expected checksum.
    Current,
}

impl StatusCounts {
    pub fn total(&self) -> u32 {
        self.pending + self.synced + self.error
    }
}

/// State database for mirrors
pub struct StateDb {
    conn: Connection,
}

impl std::fmt::Debug for StateDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateDb").finish_non_exhaustive()
    }
}

const CONFIG_COLUMNS: &str = "id, name, product, upstream_url, enabled, platform_filter, \
     version_filter, gpg_verify, stable_only, sync_interval_hours, trusted_key, \
     signature_suffix, last_sync_at, last_sync_status, last_sync_error";

const VERSION_COLUMNS: &str = "id, config_id, version, is_latest, is_deprecated, release_date, \
     sync_status, sync_error, synced_at";

const PLATFORM_COLUMNS: &str = "id, version_id, os, arch, upstream_url, filename, sha256, \
     storage_key, storage_backend, sha256_verified, gpg_verified, sync_status, sync_error, synced_at";

const HISTORY_COLUMNS: &str = "id, config_id, triggered_by, started_at, completed_at, status, \
     versions_synced, platforms_synced, versions_failed, error_message, details";

impl StateDb {
    /// Open or create the state database at `path`.
    pub fn open_at(path: &Path) -> Result<Self, DbError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        let db = Self { conn };
        db.init_schema()?;
        Ok(db)
    }

    /// In-memory database (for testing)
    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let db = Self { conn };
        db.init_schema()?;
        Ok(db)
    }

    /// Initialize database schema
    fn init_schema(&self) -> Result<(), DbError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS terraform_mirror_configs (
                id BLOB PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                product TEXT NOT NULL,
                upstream_url TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                platform_filter TEXT NOT NULL DEFAULT '[]',
                version_filter TEXT,
                gpg_verify INTEGER NOT NULL DEFAULT 0,
                stable_only INTEGER NOT NULL DEFAULT 0,
                sync_interval_hours INTEGER NOT NULL DEFAULT 24,
                trusted_key TEXT,
                signature_suffix TEXT NOT NULL DEFAULT '.sig',
                last_sync_at TEXT,
                last_sync_status TEXT,
                last_sync_error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS terraform_versions (
                id BLOB PRIMARY KEY,
                config_id BLOB NOT NULL REFERENCES terraform_mirror_configs(id) ON DELETE CASCADE,
                version TEXT NOT NULL,
                is_latest INTEGER NOT NULL DEFAULT 0,
                is_deprecated INTEGER NOT NULL DEFAULT 0,
                release_date TEXT,
                sync_status TEXT NOT NULL DEFAULT 'pending',
                sync_error TEXT,
                synced_at TEXT,
                created_at TEXT NOT NULL,
                UNIQUE (config_id, version)
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_versions_one_latest
                ON terraform_versions(config_id) WHERE is_latest = 1;

            CREATE TABLE IF NOT EXISTS terraform_version_platforms (
                id BLOB PRIMARY KEY,
                version_id BLOB NOT NULL REFERENCES terraform_versions(id) ON DELETE CASCADE,
                os TEXT NOT NULL,
                arch TEXT NOT NULL,
                upstream_url TEXT NOT NULL,
                filename TEXT NOT NULL,
                sha256 TEXT,
                storage_key TEXT,
                storage_backend TEXT,
                sha256_verified INTEGER NOT NULL DEFAULT 0,
                gpg_verified INTEGER NOT NULL DEFAULT 0,
                sync_status TEXT NOT NULL DEFAULT 'pending',
                sync_error TEXT,
                synced_at TEXT,
                claim_token BLOB,
                claimed_at INTEGER,
                UNIQUE (version_id, os, arch),
                CHECK ((sync_status = 'synced') = (storage_key IS NOT NULL))
            );

            CREATE INDEX IF NOT EXISTS idx_platforms_version
                ON terraform_version_platforms(version_id);

            CREATE TABLE IF NOT EXISTS terraform_sync_history (
                id BLOB PRIMARY KEY,
                config_id BLOB NOT NULL REFERENCES terraform_mirror_configs(id) ON DELETE CASCADE,
                triggered_by TEXT NOT NULL,
                started_at TEXT NOT NULL,
                completed_at TEXT,
                status TEXT NOT NULL,
                versions_synced INTEGER NOT NULL DEFAULT 0,
                platforms_synced INTEGER NOT NULL DEFAULT 0,
                versions_failed INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                details TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_history_config
                ON terraform_sync_history(config_id, started_at);
            ",
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Mirror configs
    // ------------------------------------------------------------------

    /// Insert or update a config by name. Sync summary fields are preserved.
    pub fn upsert_config(&self, cfg: &MirrorConfig) -> Result<MirrorConfig, DbError> {
        let now = Utc::now();
        let filter = serde_json::to_string(&cfg.platform_filter.to_strings())?;
        self.conn.execute(
            "INSERT INTO terraform_mirror_configs (
                 id, name, product, upstream_url, enabled, platform_filter, version_filter,
                 gpg_verify, stable_only, sync_interval_hours, trusted_key, signature_suffix,
                 created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13)
             ON CONFLICT(name) DO UPDATE SET
                 product = excluded.product,
                 upstream_url = excluded.upstream_url,
                 enabled = excluded.enabled,
                 platform_filter = excluded.platform_filter,
                 version_filter = excluded.version_filter,
                 gpg_verify = excluded.gpg_verify,
                 stable_only = excluded.stable_only,
                 sync_interval_hours = excluded.sync_interval_hours,
                 trusted_key = excluded.trusted_key,
                 signature_suffix = excluded.signature_suffix,
                 updated_at = excluded.updated_at",
            params![
                cfg.id,
                cfg.name,
                cfg.product,
                cfg.upstream_url,
                cfg.enabled,
                filter,
                cfg.version_filter,
                cfg.gpg_verify,
                cfg.stable_only,
                cfg.sync_interval_hours,
                cfg.trusted_key,
                cfg.signature_suffix,
                now,
            ],
        )?;
        self.get_config_by_name(&cfg.name)?
            .ok_or_else(|| DbError::NotFound(cfg.name.clone()))
    }

    pub fn get_config(&self, id: Uuid) -> Result<Option<MirrorConfig>, DbError> {
        let sql = format!("SELECT {CONFIG_COLUMNS} FROM terraform_mirror_configs WHERE id = ?1");
        Ok(self.conn.query_row(&sql, params![id], config_from_row).optional()?)
    }

    pub fn get_config_by_name(&self, name: &str) -> Result<Option<MirrorConfig>, DbError> {
        let sql = format!("SELECT {CONFIG_COLUMNS} FROM terraform_mirror_configs WHERE name = ?1");
        Ok(self.conn.query_row(&sql, params![name], config_from_row).optional()?)
    }

    pub fn list_configs(&self) -> Result<Vec<MirrorConfig>, DbError> {
        let sql = format!("SELECT {CONFIG_COLUMNS} FROM terraform_mirror_configs ORDER BY name");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], config_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Enabled configs whose interval has elapsed, never-synced first.
    pub fn configs_due(&self, now: DateTime<Utc>) -> Result<Vec<MirrorConfig>, DbError> {
        let mut due: Vec<MirrorConfig> = self
            .list_configs()?
            .into_iter()
            .filter(|c| c.enabled)
            .filter(|c| match c.last_sync_at {
                None => true,
                Some(at) => at + Duration::hours(i64::from(c.sync_interval_hours)) <= now,
            })
            .collect();
        due.sort_by_key(|c| c.last_sync_at);
        Ok(due)
    }

    /// Record the outcome of a run on the config row.
    pub fn set_config_sync_status(
        &self,
        id: Uuid,
        status: RunStatus,
        error: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<(), DbError> {
        let updated = self.conn.execute(
            "UPDATE terraform_mirror_configs
             SET last_sync_status = ?2, last_sync_error = ?3, last_sync_at = ?4, updated_at = ?4
             WHERE id = ?1",
            params![id, status.as_str(), error, at],
        )?;
        if updated == 0 {
            return Err(DbError::NotFound(id.to_string()));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Versions
    // ------------------------------------------------------------------

    /// Create the version row if missing. Existing rows keep their status.
    pub fn upsert_version(
        &self,
        config_id: Uuid,
        version: &str,
        release_date: Option<DateTime<Utc>>,
    ) -> Result<MirrorVersion, DbError> {
        self.conn.execute(
            "INSERT INTO terraform_versions (id, config_id, version, release_date, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(config_id, version) DO UPDATE SET
                 release_date = COALESCE(excluded.release_date, release_date)",
            params![Uuid::new_v4(), config_id, version, release_date, Utc::now()],
        )?;
        self.get_version(config_id, version)?
            .ok_or_else(|| DbError::NotFound(version.to_string()))
    }

    pub fn get_version(
        &self,
        config_id: Uuid,
        version: &str,
    ) -> Result<Option<MirrorVersion>, DbError> {
        let sql = format!(
            "SELECT {VERSION_COLUMNS} FROM terraform_versions WHERE config_id = ?1 AND version = ?2"
        );
        Ok(self
            .conn
            .query_row(&sql, params![config_id, version], version_from_row)
            .optional()?)
    }

    /// Versions of a config; `include_pending = false` hides never-attempted rows.
    pub fn list_versions(
        &self,
        config_id: Uuid,
        include_pending: bool,
    ) -> Result<Vec<MirrorVersion>, DbError> {
        let sql = format!(
            "SELECT {VERSION_COLUMNS} FROM terraform_versions
             WHERE config_id = ?1 AND (?2 OR sync_status != 'pending')"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![config_id, include_pending], version_from_row)?;
        let mut versions = rows.collect::<Result<Vec<_>, _>>()?;
        versions.sort_by(|a, b| tfmirror_schema::version::compare_versions(&b.version, &a.version));
        Ok(versions)
    }

    pub fn latest_version(&self, config_id: Uuid) -> Result<Option<MirrorVersion>, DbError> {
        let sql = format!(
            "SELECT {VERSION_COLUMNS} FROM terraform_versions WHERE config_id = ?1 AND is_latest = 1"
        );
        Ok(self
            .conn
            .query_row(&sql, params![config_id], version_from_row)
            .optional()?)
    }

    /// Set a version's aggregate status. `synced_at` is stamped on the first
    /// transition to `Synced` and kept afterwards.
    pub fn set_version_status(
        &self,
        id: Uuid,
        status: SyncStatus,
        error: Option<&str>,
    ) -> Result<(), DbError> {
        self.conn.execute(
            "UPDATE terraform_versions
             SET sync_status = ?2,
                 sync_error = ?3,
                 synced_at = CASE WHEN ?2 = 'synced' THEN COALESCE(synced_at, ?4) ELSE synced_at END
             WHERE id = ?1",
            params![id, status.as_str(), error, Utc::now()],
        )?;
        Ok(())
    }

    /// Move the `is_latest` flag atomically.
    pub fn set_latest_version(
        &mut self,
        config_id: Uuid,
        version_id: Option<Uuid>,
    ) -> Result<(), DbError> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "UPDATE terraform_versions SET is_latest = 0 WHERE config_id = ?1 AND is_latest = 1",
            params![config_id],
        )?;
        if let Some(id) = version_id {
            tx.execute(
                "UPDATE terraform_versions SET is_latest = 1 WHERE id = ?1 AND config_id = ?2",
                params![id, config_id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Platforms
    // ------------------------------------------------------------------

    /// Create or refresh a platform row.
    ///
    /// The expected checksum is only overwritten while the row is not synced;
    /// a synced row keeps the digest of the bytes actually stored.
    pub fn upsert_platform(
        &self,
        version_id: Uuid,
        platform: Platform,
        upstream_url: &str,
        filename: &str,
        expected: Option<&Sha256Digest>,
    ) -> Result<VersionPlatform, DbError> {
        self.conn.execute(
            "INSERT INTO terraform_version_platforms
                 (id, version_id, os, arch, upstream_url, filename, sha256)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(version_id, os, arch) DO UPDATE SET
                 upstream_url = excluded.upstream_url,
                 filename = excluded.filename,
                 sha256 = CASE WHEN sync_status = 'synced' THEN sha256 ELSE excluded.sha256 END",
            params![
                Uuid::new_v4(),
                version_id,
                platform.os.as_str(),
                platform.arch.as_str(),
                upstream_url,
                filename,
                expected.map(Sha256Digest::as_str),
            ],
        )?;
        self.get_platform(version_id, platform)?
            .ok_or_else(|| DbError::NotFound(format!("{version_id} {platform}")))
    }

    pub fn get_platform(
        &self,
        version_id: Uuid,
        platform: Platform,
    ) -> Result<Option<VersionPlatform>, DbError> {
        let sql = format!(
            "SELECT {PLATFORM_COLUMNS} FROM terraform_version_platforms
             WHERE version_id = ?1 AND os = ?2 AND arch = ?3"
        );
        Ok(self
            .conn
            .query_row(
                &sql,
                params![version_id, platform.os.as_str(), platform.arch.as_str()],
                platform_from_row,
            )
            .optional()?)
    }

    /// Platforms of a version; `synced_only` restricts to servable rows.
    pub fn list_platforms(
        &self,
        version_id: Uuid,
        synced_only: bool,
    ) -> Result<Vec<VersionPlatform>, DbError> {
        let sql = format!(
            "SELECT {PLATFORM_COLUMNS} FROM terraform_version_platforms
             WHERE version_id = ?1 AND (NOT ?2 OR sync_status = 'synced')
             ORDER BY os, arch"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![version_id, synced_only], platform_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Claim a platform for one worker.
    ///
    /// Succeeds when the row is unclaimed or its claim is older than
    /// `stale_before` (unix seconds), unless the row is already synced with
    /// `expected`. That happens when another worker finished the same build
    /// between the caller's read and its claim.
    pub fn claim_platform(
        &self,
        id: Uuid,
        token: Uuid,
        now: i64,
        stale_before: i64,
        expected: Option<&Sha256Digest>,
    ) -> Result<Claim, DbError> {
        let expected = expected.map(Sha256Digest::as_str);
        let updated = self.conn.execute(
            "UPDATE terraform_version_platforms
             SET claim_token = ?2, claimed_at = ?3
             WHERE id = ?1 AND (claim_token IS NULL OR claimed_at < ?4)
               AND NOT (?5 IS NOT NULL AND sync_status = 'synced'
                        AND sha256 IS NOT NULL AND lower(sha256) = ?5)",
            params![id, token, now, stale_before, expected],
        )?;
        if updated == 1 {
            return Ok(Claim::Acquired);
        }
        let current: bool = self
            .conn
            .query_row(
                "SELECT ?2 IS NOT NULL AND sync_status = 'synced'
                        AND sha256 IS NOT NULL AND lower(sha256) = ?2
                 FROM terraform_version_platforms WHERE id = ?1",
                params![id, expected],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(false);
        Ok(if current { Claim::Current } else { Claim::Held })
    }

    pub fn release_claim(&self, id: Uuid, token: Uuid) -> Result<(), DbError> {
        self.conn.execute(
            "UPDATE terraform_version_platforms SET claim_token = NULL, claimed_at = NULL
             WHERE id = ?1 AND claim_token = ?2",
            params![id, token],
        )?;
        Ok(())
    }

    /// Record a verified, stored build and drop the claim.
    ///
    /// Returns false if the claim was lost to another worker.
    #[allow(clippy::too_many_arguments)]
    pub fn mark_platform_synced(
        &self,
        id: Uuid,
        token: Uuid,
        storage_key: &str,
        storage_backend: &str,
        sha256: &Sha256Digest,
        gpg_verified: bool,
    ) -> Result<bool, DbError> {
        let updated = self.conn.execute(
            "UPDATE terraform_version_platforms
             SET sync_status = 'synced', sync_error = NULL, synced_at = ?7,
                 storage_key = ?3, storage_backend = ?4, sha256 = ?5,
                 sha256_verified = 1, gpg_verified = ?6,
                 claim_token = NULL, claimed_at = NULL
             WHERE id = ?1 AND claim_token = ?2",
            params![
                id,
                token,
                storage_key,
                storage_backend,
                sha256.as_str(),
                gpg_verified,
                Utc::now()
            ],
        )?;
        Ok(updated == 1)
    }

    /// Record a failed attempt and drop the claim. Clears any stored object
    /// reference so the row is never served.
    pub fn mark_platform_error(&self, id: Uuid, token: Uuid, error: &str) -> Result<bool, DbError> {
        let updated = self.conn.execute(
            "UPDATE terraform_version_platforms
             SET sync_status = 'error', sync_error = ?3,
                 storage_key = NULL, storage_backend = NULL,
                 sha256_verified = 0, gpg_verified = 0,
                 claim_token = NULL, claimed_at = NULL
             WHERE id = ?1 AND claim_token = ?2",
            params![id, token, error],
        )?;
        Ok(updated == 1)
    }

    /// Mark unclaimed platforms of a version as failed without attempting them.
    ///
    /// With `include_synced = false`, already-synced rows are left alone.
    pub fn fail_version_platforms(
        &mut self,
        version_id: Uuid,
        error: &str,
        include_synced: bool,
    ) -> Result<FailedPlatforms, DbError> {
        let tx = self.conn.transaction()?;
        let revoked_keys = if include_synced {
            let mut stmt = tx.prepare(
                "SELECT storage_key FROM terraform_version_platforms
                 WHERE version_id = ?1 AND claim_token IS NULL
                   AND sync_status = 'synced' AND storage_key IS NOT NULL",
            )?;
            let keys = stmt.query_map(params![version_id], |row| row.get::<_, String>(0))?;
            keys.collect::<Result<Vec<_>, _>>()?
        } else {
            Vec::new()
        };
        let failed = tx.execute(
            "UPDATE terraform_version_platforms
             SET sync_status = 'error', sync_error = ?2,
                 storage_key = NULL, storage_backend = NULL,
                 sha256_verified = 0, gpg_verified = 0
             WHERE version_id = ?1 AND claim_token IS NULL
               AND (?3 OR sync_status != 'synced')",
            params![version_id, error, include_synced],
        )?;
        tx.commit()?;
        Ok(FailedPlatforms {
            failed,
            revoked_keys,
        })
    }

    /// Set `gpg_verified` on synced platforms stored before the signature checked out.
    pub fn backfill_gpg_verified(&self, version_id: Uuid) -> Result<usize, DbError> {
        Ok(self.conn.execute(
            "UPDATE terraform_version_platforms SET gpg_verified = 1
             WHERE version_id = ?1 AND sync_status = 'synced' AND gpg_verified = 0",
            params![version_id],
        )?)
    }

    pub fn platform_counts(&self, version_id: Uuid) -> Result<StatusCounts, DbError> {
        self.counts(
            "SELECT sync_status, COUNT(*) FROM terraform_version_platforms
             WHERE version_id = ?1 GROUP BY sync_status",
            version_id,
        )
    }

    pub fn version_counts(&self, config_id: Uuid) -> Result<StatusCounts, DbError> {
        self.counts(
            "SELECT sync_status, COUNT(*) FROM terraform_versions
             WHERE config_id = ?1 GROUP BY sync_status",
            config_id,
        )
    }

    fn counts(&self, sql: &str, id: Uuid) -> Result<StatusCounts, DbError> {
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = stmt.query(params![id])?;
        let mut counts = StatusCounts::default();
        while let Some(row) = rows.next()? {
            let status: SyncStatus = parse_col(row, 0)?;
            let n: u32 = row.get(1)?;
            match status {
                SyncStatus::Pending => counts.pending = n,
                SyncStatus::Synced => counts.synced = n,
                SyncStatus::Error => counts.error = n,
            }
        }
        Ok(counts)
    }

    // ------------------------------------------------------------------
    // Sync history
    // ------------------------------------------------------------------

    pub fn insert_history(&self, h: &SyncHistory) -> Result<(), DbError> {
        let details = h.details.as_ref().map(serde_json::to_string).transpose()?;
        self.conn.execute(
            "INSERT INTO terraform_sync_history
                 (id, config_id, triggered_by, started_at, completed_at, status,
                  versions_synced, platforms_synced, versions_failed, error_message, details)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                h.id,
                h.config_id,
                h.triggered_by.as_str(),
                h.started_at,
                h.completed_at,
                h.status.as_str(),
                h.versions_synced,
                h.platforms_synced,
                h.versions_failed,
                h.error_message,
                details,
            ],
        )?;
        Ok(())
    }

    /// Close a history row.
    pub fn complete_history(&self, h: &SyncHistory) -> Result<(), DbError> {
        let details = h.details.as_ref().map(serde_json::to_string).transpose()?;
        let updated = self.conn.execute(
            "UPDATE terraform_sync_history
             SET completed_at = ?2, status = ?3, versions_synced = ?4, platforms_synced = ?5,
                 versions_failed = ?6, error_message = ?7, details = ?8
             WHERE id = ?1",
            params![
                h.id,
                h.completed_at,
                h.status.as_str(),
                h.versions_synced,
                h.platforms_synced,
                h.versions_failed,
                h.error_message,
                details,
            ],
        )?;
        if updated == 0 {
            return Err(DbError::NotFound(h.id.to_string()));
        }
        Ok(())
    }

    /// Close every `running` history row of a config as failed.
    ///
    /// Used when a run dies without completing its own row.
    pub fn fail_running_history(
        &self,
        config_id: Uuid,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<usize, DbError> {
        Ok(self.conn.execute(
            "UPDATE terraform_sync_history
             SET status = 'failed', error_message = ?2, completed_at = ?3
             WHERE config_id = ?1 AND status = 'running'",
            params![config_id, error, at],
        )?)
    }

    /// Most recent runs first.
    pub fn list_history(&self, config_id: Uuid, limit: u32) -> Result<Vec<SyncHistory>, DbError> {
        let sql = format!(
            "SELECT {HISTORY_COLUMNS} FROM terraform_sync_history
             WHERE config_id = ?1 ORDER BY started_at DESC LIMIT ?2"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![config_id, limit], history_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }
}

// ----------------------------------------------------------------------
// Row mapping
// ----------------------------------------------------------------------

fn parse_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e: T::Err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.to_string().into()))
}

fn parse_opt_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        s.parse()
            .map_err(|e: T::Err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.to_string().into()))
    })
    .transpose()
}

fn json_col<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        serde_json::from_str(&s)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

fn config_from_row(row: &Row<'_>) -> rusqlite::Result<MirrorConfig> {
    let filter: Vec<String> = json_col(row, 5)?.unwrap_or_default();
    let platform_filter = PlatformFilter::parse(&filter)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?;
    Ok(MirrorConfig {
        id: row.get(0)?,
        name: row.get(1)?,
        product: row.get(2)?,
        upstream_url: row.get(3)?,
        enabled: row.get(4)?,
        platform_filter,
        version_filter: row.get(6)?,
        gpg_verify: row.get(7)?,
        stable_only: row.get(8)?,
        sync_interval_hours: row.get(9)?,
        trusted_key: row.get(10)?,
        signature_suffix: row.get(11)?,
        last_sync_at: row.get(12)?,
        last_sync_status: parse_opt_col(row, 13)?,
        last_sync_error: row.get(14)?,
    })
}

fn version_from_row(row: &Row<'_>) -> rusqlite::Result<MirrorVersion> {
    Ok(MirrorVersion {
        id: row.get(0)?,
        config_id: row.get(1)?,
        version: row.get(2)?,
        is_latest: row.get(3)?,
        is_deprecated: row.get(4)?,
        release_date: row.get(5)?,
        sync_status: parse_col(row, 6)?,
        sync_error: row.get(7)?,
        synced_at: row.get(8)?,
    })
}

fn platform_from_row(row: &Row<'_>) -> rusqlite::Result<VersionPlatform> {
    Ok(VersionPlatform {
        id: row.get(0)?,
        version_id: row.get(1)?,
        os: parse_col(row, 2)?,
        arch: parse_col(row, 3)?,
        upstream_url: row.get(4)?,
        filename: row.get(5)?,
        sha256: parse_opt_col(row, 6)?,
        storage_key: row.get(7)?,
        storage_backend: row.get(8)?,
        sha256_verified: row.get(9)?,
        gpg_verified: row.get(10)?,
        sync_status: parse_col(row, 11)?,
        sync_error: row.get(12)?,
        synced_at: row.get(13)?,
    })
}

fn history_from_row(row: &Row<'_>) -> rusqlite::Result<SyncHistory> {
    Ok(SyncHistory {
        id: row.get(0)?,
        config_id: row.get(1)?,
        triggered_by: parse_col(row, 2)?,
        started_at: row.get(3)?,
        completed_at: row.get(4)?,
        status: parse_col(row, 5)?,
        versions_synced: row.get(6)?,
        platforms_synced: row.get(7)?,
        versions_failed: row.get(8)?,
        error_message: row.get(9)?,
        details: json_col::<SyncDetails>(row, 10)?,
    })
}
