//! Upstream release clients.
//!
//! Two upstream layouts are supported. The `releases.hashicorp.com` index:
//!
//! ```text
//! {base}/{product}/index.json
//! {base}/{product}/{version}/{product}_{version}_SHA256SUMS
//! {base}/{product}/{version}/{product}_{version}_SHA256SUMS{signature_suffix}
//! ```
//!
//! and GitHub Releases (see [`github`]), picked when the upstream URL is a
//! github.com URL. The index is several megabytes for long-lived products, so
//! it is decoded entry by entry straight off the response body.

pub mod github;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::io::Read;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt};
use reqwest::{Client, Response};
use serde::Deserialize;
use serde::de::{DeserializeSeed, IgnoredAny, MapAccess, Visitor};
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::io::{StreamReader, SyncIoBridge};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use tfmirror_schema::{MirrorConfig, Sha256Digest};

use crate::USER_AGENT;
use crate::checksum::StreamHasher;

pub use github::{GitHubOptions, GitHubRepo};

/// Largest checksum manifest accepted.
pub const MAX_MANIFEST_BYTES: usize = 1024 * 1024;
/// Largest signature file accepted.
pub const MAX_SIGNATURE_BYTES: usize = 64 * 1024;

/// Errors talking to the upstream.
#[derive(Debug, Error)]
pub enum ReleaseError {
    /// Transport failure or non-success status.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    /// The index body is not a JSON object.
    #[error("index decode error: {0}")]
    Decode(#[from] serde_json::Error),
    /// A capped body exceeded its limit.
    #[error("{what} exceeds {limit} bytes")]
    TooLarge {
        /// Which document.
        what: &'static str,
        /// Cap in bytes.
        limit: usize,
    },
    /// Local write failure while streaming a download.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,
    /// The blocking decoder task died.
    #[error("index decoder failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    /// The upstream URL cannot be used.
    #[error("invalid upstream: {0}")]
    InvalidUpstream(String),
    /// The release does not publish a required file.
    #[error("no {what} published for {version}")]
    MissingAsset {
        /// Which file.
        what: &'static str,
        /// Release version.
        version: String,
    },
}

/// Timeouts for the two HTTP clients.
#[derive(Debug, Clone, Copy)]
pub struct HttpOptions {
    /// Index, manifest and signature requests.
    pub metadata_timeout: Duration,
    /// Binary downloads.
    pub download_timeout: Duration,
    /// TCP connect timeout for both.
    pub connect_timeout: Duration,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            metadata_timeout: Duration::from_secs(30),
            download_timeout: Duration::from_secs(600),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Shared HTTP clients: a short-deadline one for metadata, a long one for binaries.
#[derive(Debug, Clone)]
pub struct HttpClients {
    metadata: Client,
    download: Client,
    github: GitHubOptions,
}

impl HttpClients {
    /// Build both clients.
    ///
    /// # Errors
    ///
    /// Returns [`ReleaseError::Http`] if the TLS backend cannot initialise.
    pub fn new(options: &HttpOptions) -> Result<Self, ReleaseError> {
        let metadata = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(options.connect_timeout)
            .timeout(options.metadata_timeout)
            .build()?;
        let download = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(options.connect_timeout)
            .timeout(options.download_timeout)
            .build()?;
        Ok(Self {
            metadata,
            download,
            github: GitHubOptions::default(),
        })
    }

    /// Use a different GitHub API root or token.
    pub fn with_github(mut self, github: GitHubOptions) -> Self {
        self.github = github;
        self
    }
}

/// One downloadable build listed by the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseBuild {
    /// Operating system as published (not yet validated).
    pub os: String,
    /// Architecture as published (not yet validated).
    pub arch: String,
    /// Archive file name.
    pub filename: String,
    /// Absolute download URL.
    pub url: String,
}

/// One version listed by the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseVersion {
    /// Version string.
    pub version: String,
    /// Absolute URL of the checksum manifest, if the release publishes one.
    pub shasums_url: Option<String>,
    /// Absolute URL of the detached manifest signature, if known.
    pub signature_url: Option<String>,
    /// Upstream publication time, when the index carries one.
    pub release_date: Option<DateTime<Utc>>,
    /// Builds offered for this version.
    pub builds: Vec<ReleaseBuild>,
}

/// Parsed `SHA256SUMS` file.
#[derive(Clone)]
pub struct ChecksumManifest {
    /// Digest per file name.
    pub entries: HashMap<String, Sha256Digest>,
    /// The exact bytes received, for signature checks.
    pub raw: Bytes,
}

impl fmt::Debug for ChecksumManifest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChecksumManifest")
            .field("entries", &self.entries.len())
            .field("raw_len", &self.raw.len())
            .finish()
    }
}

impl ChecksumManifest {
    /// Parse `<hex>  <filename>` lines. Lines without exactly two fields or
    /// with a malformed digest are skipped.
    pub fn parse(raw: Bytes) -> Self {
        let text = String::from_utf8_lossy(&raw);
        let mut entries = HashMap::new();
        for line in text.lines() {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() != 2 {
                continue;
            }
            let Ok(digest) = Sha256Digest::new(parts[0]) else {
                debug!(line, "skipping manifest line with malformed digest");
                continue;
            };
            // Binary-mode entries are written "*filename"
            let filename = parts[1].trim_start_matches('*').to_string();
            entries.insert(filename, digest);
        }
        Self { entries, raw }
    }

    /// Expected digest for a file.
    pub fn get(&self, filename: &str) -> Option<&Sha256Digest> {
        self.entries.get(filename)
    }
}

/// Where a mirror's releases are listed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Upstream {
    /// A `releases.hashicorp.com`-style `index.json`.
    Index {
        /// Base URL without trailing slash.
        base: String,
        /// Product path segment.
        product: String,
        /// Appended to the manifest URL to find its signature.
        signature_suffix: String,
    },
    /// Release assets of a GitHub repository.
    GitHub(GitHubRepo),
}

impl Upstream {
    /// Pick the layout from the mirror's upstream URL.
    ///
    /// # Errors
    ///
    /// [`ReleaseError::InvalidUpstream`] for a GitHub URL without owner/repo.
    pub fn from_config(config: &MirrorConfig) -> Result<Self, ReleaseError> {
        if github::is_github_url(&config.upstream_url) {
            return GitHubRepo::parse(
                &config.upstream_url,
                &config.product,
                &config.signature_suffix,
            )
            .map(Self::GitHub);
        }
        Ok(Self::Index {
            base: config.upstream_base().to_string(),
            product: config.product.clone(),
            signature_suffix: config.signature_suffix.clone(),
        })
    }
}

/// Client for one mirror's upstream.
#[derive(Debug, Clone)]
pub struct ReleaseIndexClient {
    http: HttpClients,
    upstream: Upstream,
}

impl ReleaseIndexClient {
    /// Bind the shared clients to a mirror's upstream.
    ///
    /// # Errors
    ///
    /// See [`Upstream::from_config`].
    pub fn new(http: HttpClients, config: &MirrorConfig) -> Result<Self, ReleaseError> {
        Ok(Self {
            http,
            upstream: Upstream::from_config(config)?,
        })
    }

    /// The upstream layout in use.
    pub fn upstream(&self) -> &Upstream {
        &self.upstream
    }

    /// List every version the upstream offers.
    ///
    /// Entries that fail to decode are skipped and logged; only a body that is
    /// not a JSON object (or array, for GitHub) at all is an error.
    ///
    /// # Errors
    ///
    /// Transport errors, an undecodable body, or cancellation.
    pub async fn list_versions(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<ReleaseVersion>, ReleaseError> {
        match &self.upstream {
            Upstream::Index {
                base,
                product,
                signature_suffix,
            } => {
                self.list_index(base, product, signature_suffix, cancel)
                    .await
            }
            Upstream::GitHub(repo) => github::list_releases(&self.http, repo, cancel).await,
        }
    }

    async fn list_index(
        &self,
        base: &str,
        product: &str,
        signature_suffix: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<ReleaseVersion>, ReleaseError> {
        let url = format!("{base}/{product}/index.json");
        let resp = cancellable(cancel, self.http.metadata.get(&url).send())
            .await??
            .error_for_status()?;

        let stream = resp.bytes_stream().map_err(std::io::Error::other);
        let reader = SyncIoBridge::new(StreamReader::new(Box::pin(stream)));
        let decode = tokio::task::spawn_blocking(move || {
            decode_index(std::io::BufReader::new(reader))
        });
        let (entries, skipped) = cancellable(cancel, decode).await???;

        if skipped > 0 {
            warn!(url, skipped, "skipped malformed release index entries");
        }

        Ok(entries
            .into_iter()
            .filter_map(|(key, entry)| normalize(base, product, signature_suffix, key, entry))
            .collect())
    }

    /// Fetch and parse a version's checksum manifest.
    ///
    /// # Errors
    ///
    /// Transport errors, a body over [`MAX_MANIFEST_BYTES`], or cancellation.
    pub async fn fetch_checksum_manifest(
        &self,
        version: &ReleaseVersion,
        cancel: &CancellationToken,
    ) -> Result<ChecksumManifest, ReleaseError> {
        let url = version
            .shasums_url
            .as_deref()
            .ok_or_else(|| ReleaseError::MissingAsset {
                what: "checksum manifest",
                version: version.version.clone(),
            })?;
        let resp = cancellable(cancel, self.http.metadata.get(url).send())
            .await??
            .error_for_status()?;
        let raw = cancellable(cancel, read_capped(resp, MAX_MANIFEST_BYTES, "checksum manifest"))
            .await??;
        Ok(ChecksumManifest::parse(raw))
    }

    /// Fetch a version's detached manifest signature.
    ///
    /// # Errors
    ///
    /// Transport errors, a body over [`MAX_SIGNATURE_BYTES`], or cancellation.
    pub async fn fetch_manifest_signature(
        &self,
        version: &ReleaseVersion,
        cancel: &CancellationToken,
    ) -> Result<Bytes, ReleaseError> {
        let url = version
            .signature_url
            .as_deref()
            .ok_or_else(|| ReleaseError::MissingAsset {
                what: "manifest signature",
                version: version.version.clone(),
            })?;
        let resp = cancellable(cancel, self.http.metadata.get(url).send())
            .await??
            .error_for_status()?;
        cancellable(cancel, read_capped(resp, MAX_SIGNATURE_BYTES, "signature")).await?
    }

    /// Stream a binary into `writer`, hashing exactly what is written.
    ///
    /// # Errors
    ///
    /// Transport or write errors, or cancellation. The writer may hold a
    /// partial body on error.
    pub async fn download_to<W>(
        &self,
        url: &str,
        writer: &mut W,
        cancel: &CancellationToken,
    ) -> Result<(Sha256Digest, u64), ReleaseError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let resp = cancellable(cancel, self.http.download.get(url).send())
            .await??
            .error_for_status()?;

        let mut stream = resp.bytes_stream();
        let mut hasher = StreamHasher::new();
        loop {
            let chunk = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(ReleaseError::Cancelled),
                next = stream.next() => next,
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk?;
            writer.write_all(&chunk).await?;
            hasher.update(&chunk);
        }
        writer.flush().await?;
        Ok(hasher.finish())
    }
}

fn normalize(
    base: &str,
    product: &str,
    signature_suffix: &str,
    key: String,
    entry: RawEntry,
) -> Option<ReleaseVersion> {
    let version = if entry.version.trim().is_empty() {
        key
    } else {
        entry.version
    };
    if version.trim().is_empty() {
        return None;
    }

    let shasums = if entry.shasums.is_empty() {
        format!("{product}_{version}_SHA256SUMS")
    } else {
        entry.shasums
    };

    let builds = entry
        .builds
        .into_iter()
        .filter(|b| !b.os.is_empty() && !b.arch.is_empty() && !b.filename.is_empty())
        .map(|b| {
            let url = if b.url.is_empty() {
                version_file_url(base, product, &version, &b.filename)
            } else {
                absolute(base, product, &version, b.url)
            };
            ReleaseBuild {
                os: b.os,
                arch: b.arch,
                filename: b.filename,
                url,
            }
        })
        .collect();

    let release_date = entry
        .timestamp_created
        .as_deref()
        .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
        .map(|ts| ts.with_timezone(&Utc));

    let shasums_url = absolute(base, product, &version, shasums);
    Some(ReleaseVersion {
        signature_url: Some(format!("{shasums_url}{signature_suffix}")),
        shasums_url: Some(shasums_url),
        version,
        release_date,
        builds,
    })
}

fn absolute(base: &str, product: &str, version: &str, path: String) -> String {
    if path.contains("://") {
        path
    } else {
        version_file_url(base, product, version, path.trim_start_matches('/'))
    }
}

fn version_file_url(base: &str, product: &str, version: &str, file: &str) -> String {
    format!("{base}/{product}/{version}/{file}")
}

async fn cancellable<F, T>(cancel: &CancellationToken, fut: F) -> Result<T, ReleaseError>
where
    F: Future<Output = T>,
{
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(ReleaseError::Cancelled),
        out = fut => Ok(out),
    }
}

async fn read_capped(
    mut resp: Response,
    limit: usize,
    what: &'static str,
) -> Result<Bytes, ReleaseError> {
    if resp.content_length().is_some_and(|len| len > limit as u64) {
        return Err(ReleaseError::TooLarge { what, limit });
    }
    let mut buf = BytesMut::new();
    while let Some(chunk) = resp.chunk().await? {
        if buf.len() + chunk.len() > limit {
            return Err(ReleaseError::TooLarge { what, limit });
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}

// ---------------------------------------------------------------------------
// Incremental index decoding
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawEntry {
    #[serde(default)]
    version: String,
    #[serde(default)]
    shasums: String,
    #[serde(default)]
    builds: Vec<RawBuild>,
    #[serde(default)]
    timestamp_created: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawBuild {
    #[serde(default)]
    os: String,
    #[serde(default)]
    arch: String,
    #[serde(default)]
    filename: String,
    #[serde(default)]
    url: String,
}

type DecodedIndex = (Vec<(String, RawEntry)>, usize);

/// Decode `{"versions": {...}}` one entry at a time.
fn decode_index<R: Read>(reader: R) -> Result<DecodedIndex, serde_json::Error> {
    let mut de = serde_json::Deserializer::from_reader(reader);
    let decoded = serde::Deserializer::deserialize_map(&mut de, IndexVisitor)?;
    de.end()?;
    Ok(decoded)
}

struct IndexVisitor;

impl<'de> Visitor<'de> for IndexVisitor {
    type Value = DecodedIndex;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a release index object")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
        let mut decoded = (Vec::new(), 0);
        while let Some(key) = map.next_key::<String>()? {
            if key == "versions" {
                decoded = map.next_value_seed(VersionsSeed)?;
            } else {
                map.next_value::<IgnoredAny>()?;
            }
        }
        Ok(decoded)
    }
}

struct VersionsSeed;

impl<'de> DeserializeSeed<'de> for VersionsSeed {
    type Value = DecodedIndex;

    fn deserialize<D: serde::Deserializer<'de>>(self, de: D) -> Result<Self::Value, D::Error> {
        de.deserialize_map(self)
    }
}

impl<'de> Visitor<'de> for VersionsSeed {
    type Value = DecodedIndex;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a map of versions")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
        let mut entries = Vec::new();
        let mut skipped = 0usize;
        while let Some(key) = map.next_key::<String>()? {
            let value: serde_json::Value = map.next_value()?;
            match serde_json::from_value::<RawEntry>(value) {
                Ok(entry) => entries.push((key, entry)),
                Err(e) => {
                    debug!(version = %key, error = %e, "malformed index entry");
                    skipped += 1;
                }
            }
        }
        Ok((entries, skipped))
    }
}
