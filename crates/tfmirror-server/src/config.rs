//! Server configuration file.
//!
//! ```toml
//! [server]
//! bind = "0.0.0.0:8080"
//! public_base_url = "https://mirror.example.com"
//!
//! [database]
//! path = "/var/lib/tfmirror/state.db"
//!
//! [storage]
//! backend = "local"
//! root = "/var/lib/tfmirror/objects"
//!
//! [[mirrors]]
//! name = "terraform"
//! platforms = ["linux/amd64", "darwin/arm64"]
//! version_filter = "latest:5"
//! ```
//!
//! Secrets can be kept out of the file with `TFMIRROR_S3_ACCESS_KEY`,
//! `TFMIRROR_S3_SECRET_KEY`, `TFMIRROR_SIGNING_KEY` and `GITHUB_TOKEN`.
//!
//! A mirror whose `upstream_url` is a github.com repository, e.g.
//! `https://github.com/opentofu/opentofu`, syncs from that repository's
//! release assets instead of a release index.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

use tfmirror_core::releases::GitHubRepo;
use tfmirror_core::releases::github::{GITHUB_API_URL, is_github_url};
use tfmirror_core::signature::verifier_from_key;
use tfmirror_core::{GitHubOptions, HttpOptions, SchedulerOptions, StorageConfig, SyncOptions};
use tfmirror_schema::{MirrorConfig, PlatformFilter};

/// Default config file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "tfmirror.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub database: DatabaseSection,
    pub storage: StorageConfig,
    #[serde(default)]
    pub sync: SyncSection,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default)]
    pub mirrors: Vec<MirrorSection>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
    /// Externally visible URL of this server; used for local signed links.
    #[serde(default)]
    pub public_base_url: Option<String>,
    /// Mount the unauthenticated `/admin` routes.
    #[serde(default)]
    pub admin_api: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            public_base_url: None,
            admin_api: false,
        }
    }
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseSection {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("tfmirror.db")
}

/// Engine tuning. Durations are in seconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SyncSection {
    pub workers: usize,
    pub tick_secs: u64,
    pub trigger_capacity: usize,
    pub claim_stale_after_secs: u64,
    pub metadata_timeout_secs: u64,
    pub download_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// API root for github.com upstreams.
    pub github_api_url: String,
    /// Raises the unauthenticated rate limit; prefer `GITHUB_TOKEN`.
    pub github_token: Option<String>,
}

impl Default for SyncSection {
    fn default() -> Self {
        let sync = SyncOptions::default();
        let http = HttpOptions::default();
        let scheduler = SchedulerOptions::default();
        Self {
            workers: sync.workers,
            tick_secs: scheduler.tick.as_secs(),
            trigger_capacity: scheduler.trigger_capacity,
            claim_stale_after_secs: sync.claim_stale_after.as_secs(),
            metadata_timeout_secs: http.metadata_timeout.as_secs(),
            download_timeout_secs: http.download_timeout.as_secs(),
            connect_timeout_secs: http.connect_timeout.as_secs(),
            github_api_url: GITHUB_API_URL.to_string(),
            github_token: None,
        }
    }
}

impl SyncSection {
    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            workers: self.workers,
            claim_stale_after: Duration::from_secs(self.claim_stale_after_secs),
        }
    }

    pub fn http_options(&self) -> HttpOptions {
        HttpOptions {
            metadata_timeout: Duration::from_secs(self.metadata_timeout_secs),
            download_timeout: Duration::from_secs(self.download_timeout_secs),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
        }
    }

    pub fn github_options(&self) -> GitHubOptions {
        GitHubOptions {
            api_url: self.github_api_url.trim_end_matches('/').to_string(),
            token: self.github_token.clone(),
        }
    }

    pub fn scheduler_options(&self) -> SchedulerOptions {
        SchedulerOptions {
            tick: Duration::from_secs(self.tick_secs),
            trigger_capacity: self.trigger_capacity,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LoggingSection {
    /// Filter directive used when `RUST_LOG`/`TFMIRROR_LOG` are unset.
    pub level: String,
    pub json: bool,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// One `[[mirrors]]` entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MirrorSection {
    pub name: String,
    #[serde(default = "default_product")]
    pub product: String,
    #[serde(default = "default_upstream")]
    pub upstream_url: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// `os/arch` entries; empty keeps every supported platform.
    #[serde(default)]
    pub platforms: Vec<String>,
    #[serde(default)]
    pub version_filter: Option<String>,
    #[serde(default)]
    pub gpg_verify: bool,
    #[serde(default = "default_true")]
    pub stable_only: bool,
    #[serde(default = "default_interval")]
    pub sync_interval_hours: u32,
    #[serde(default)]
    pub trusted_key: Option<String>,
    #[serde(default = "default_signature_suffix")]
    pub signature_suffix: String,
}

fn default_product() -> String {
    "terraform".to_string()
}

fn default_upstream() -> String {
    "https://releases.hashicorp.com".to_string()
}

fn default_true() -> bool {
    true
}

fn default_interval() -> u32 {
    24
}

fn default_signature_suffix() -> String {
    ".sig".to_string()
}

impl MirrorSection {
    /// Row form of this entry. The id is a placeholder; upserts match by name.
    pub fn to_mirror_config(&self) -> Result<MirrorConfig, ConfigError> {
        let platform_filter = PlatformFilter::parse(&self.platforms)
            .map_err(|e| ConfigError::Invalid(format!("mirror {:?}: {e}", self.name)))?;
        Ok(MirrorConfig {
            id: Uuid::new_v4(),
            name: self.name.clone(),
            product: self.product.clone(),
            upstream_url: self.upstream_url.trim_end_matches('/').to_string(),
            enabled: self.enabled,
            platform_filter,
            version_filter: self.version_filter.clone(),
            gpg_verify: self.gpg_verify,
            stable_only: self.stable_only,
            sync_interval_hours: self.sync_interval_hours,
            trusted_key: self.trusted_key.clone(),
            signature_suffix: self.signature_suffix.clone(),
            last_sync_at: None,
            last_sync_status: None,
            last_sync_error: None,
        })
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| ConfigError::Invalid(format!("mirror {:?}: {msg}", self.name));

        let name_ok = !self.name.is_empty()
            && self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !name_ok {
            return Err(invalid("name must be non-empty and URL-safe".into()));
        }
        if self.product.trim().is_empty() {
            return Err(invalid("product must not be empty".into()));
        }
        let url = reqwest::Url::parse(&self.upstream_url)
            .map_err(|e| invalid(format!("upstream_url: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            return Err(invalid("upstream_url must be an http(s) URL".into()));
        }
        if is_github_url(&self.upstream_url) {
            GitHubRepo::parse(&self.upstream_url, &self.product, &self.signature_suffix)
                .map_err(|e| invalid(e.to_string()))?;
        }
        if self.sync_interval_hours == 0 {
            return Err(invalid("sync_interval_hours must be positive".into()));
        }
        PlatformFilter::parse(&self.platforms).map_err(|e| invalid(e.to_string()))?;
        if self.gpg_verify {
            let key = self
                .trusted_key
                .as_deref()
                .ok_or_else(|| invalid("gpg_verify requires trusted_key".into()))?;
            verifier_from_key(key).map_err(|e| invalid(e.to_string()))?;
        }
        Ok(())
    }
}

impl Config {
    /// Read, apply environment overrides, and validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::parse(&text)?;
        config.apply_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse without overrides or validation.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Fill secrets from the environment. Variables win over file values.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        if let Some(token) = lookup("GITHUB_TOKEN") {
            self.sync.github_token = Some(token);
        }
        match &mut self.storage {
            StorageConfig::Local {
                public_base_url,
                signing_key,
                ..
            } => {
                if let Some(key) = lookup("TFMIRROR_SIGNING_KEY") {
                    *signing_key = Some(key);
                }
                if public_base_url.is_none() {
                    public_base_url.clone_from(&self.server.public_base_url);
                }
            }
            StorageConfig::S3 {
                access_key,
                secret_key,
                ..
            } => {
                if let Some(key) = lookup("TFMIRROR_S3_ACCESS_KEY") {
                    *access_key = Some(key);
                }
                if let Some(key) = lookup("TFMIRROR_S3_SECRET_KEY") {
                    *secret_key = Some(key);
                }
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for mirror in &self.mirrors {
            if !seen.insert(mirror.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate mirror name {:?}",
                    mirror.name
                )));
            }
            mirror.validate()?;
        }

        if self.sync.workers == 0 {
            return Err(ConfigError::Invalid("sync.workers must be positive".into()));
        }
        if self.sync.tick_secs == 0 {
            return Err(ConfigError::Invalid("sync.tick_secs must be positive".into()));
        }
        if self.sync.trigger_capacity == 0 {
            return Err(ConfigError::Invalid(
                "sync.trigger_capacity must be positive".into(),
            ));
        }
        let api = reqwest::Url::parse(&self.sync.github_api_url)
            .map_err(|e| ConfigError::Invalid(format!("sync.github_api_url: {e}")))?;
        if !matches!(api.scheme(), "http" | "https") {
            return Err(ConfigError::Invalid(
                "sync.github_api_url must be an http(s) URL".into(),
            ));
        }

        if let StorageConfig::Local { signing_key, .. } = &self.storage {
            if signing_key.as_deref().is_none_or(|k| k.trim().is_empty()) {
                return Err(ConfigError::Invalid(
                    "local storage requires signing_key (or TFMIRROR_SIGNING_KEY)".into(),
                ));
            }
        }
        Ok(())
    }

    /// Rows to upsert at startup.
    pub fn mirror_configs(&self) -> Result<Vec<MirrorConfig>, ConfigError> {
        self.mirrors
            .iter()
            .map(MirrorSection::to_mirror_config)
            .collect()
    }
}
