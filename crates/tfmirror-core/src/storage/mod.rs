//! Artifact storage.
//!
//! The sync engine talks to [`ArtifactStore`] only. Concrete backends form a
//! closed set ([`StorageBackend`]) built from configuration by
//! [`StorageBackend::from_config`]; there is no global registry.

mod local;
mod s3;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
use tokio::io::AsyncRead;

use tfmirror_schema::{Platform, STORAGE_PREFIX, Sha256Digest};

pub use local::LocalStore;
pub use s3::S3Store;

/// Storage failures.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Filesystem error from the local backend.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Error from the object-storage backend.
    #[error("object storage error: {0}")]
    Object(#[from] opendal::Error),
    /// No object at the path.
    #[error("object not found: {0}")]
    NotFound(String),
    /// The path escapes the store or is empty.
    #[error("invalid storage path: {0}")]
    InvalidPath(String),
    /// Backend configuration is unusable.
    #[error("storage configuration error: {0}")]
    Config(String),
}

/// Result of a completed upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadResult {
    /// Key the object was stored under.
    pub path: String,
    /// Bytes written.
    pub size: u64,
    /// SHA-256 of the bytes written.
    pub checksum: Sha256Digest,
}

/// Object metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    /// Object key.
    pub path: String,
    /// Size in bytes.
    pub size: u64,
    /// SHA-256, when the backend can provide it cheaply.
    pub checksum: Option<Sha256Digest>,
    /// Last modification time, when known.
    pub last_modified: Option<DateTime<Utc>>,
}

/// Readable object body.
pub type ObjectReader = Box<dyn AsyncRead + Send + Unpin>;

/// Backend-agnostic artifact storage.
#[async_trait]
pub trait ArtifactStore: Send + Sync + std::fmt::Debug {
    /// Short backend identifier recorded on stored platforms.
    fn backend_name(&self) -> &'static str;

    /// Store `size` bytes from `reader` under `path`.
    ///
    /// The upload is complete and durable when this returns `Ok`; the
    /// returned checksum covers exactly the bytes written.
    async fn upload(
        &self,
        path: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        size: u64,
    ) -> Result<UploadResult, StorageError>;

    /// Open an object for reading.
    async fn download(&self, path: &str) -> Result<ObjectReader, StorageError>;

    /// Remove an object. Removing a missing object is not an error.
    async fn delete(&self, path: &str) -> Result<(), StorageError>;

    /// Whether an object exists.
    async fn exists(&self, path: &str) -> Result<bool, StorageError>;

    /// Metadata of an existing object.
    async fn get_metadata(&self, path: &str) -> Result<FileMetadata, StorageError>;

    /// Time-limited URL granting read access to an object.
    async fn get_url(&self, path: &str, ttl: Duration) -> Result<String, StorageError>;
}

/// Storage section of the configuration file.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Files under a local directory, served by this process.
    Local {
        /// Root directory.
        root: PathBuf,
        /// Public base URL of this server, used in signed links.
        #[serde(default)]
        public_base_url: Option<String>,
        /// HMAC key for signed links.
        #[serde(default)]
        signing_key: Option<String>,
    },
    /// An S3-compatible bucket.
    S3 {
        /// Bucket name.
        bucket: String,
        /// Endpoint URL for non-AWS providers.
        #[serde(default)]
        endpoint: Option<String>,
        /// Region (`auto` for R2).
        #[serde(default = "default_region")]
        region: String,
        /// Access key id.
        #[serde(default)]
        access_key: Option<String>,
        /// Secret access key.
        #[serde(default)]
        secret_key: Option<String>,
        /// Key prefix inside the bucket.
        #[serde(default)]
        root: Option<String>,
    },
}

fn default_region() -> String {
    "auto".to_string()
}

/// The closed set of storage backends.
#[derive(Debug)]
pub enum StorageBackend {
    /// Local filesystem.
    Local(LocalStore),
    /// S3-compatible object storage.
    S3(S3Store),
}

impl StorageBackend {
    /// Build the backend selected by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Config`] when required settings are missing.
    pub fn from_config(config: &StorageConfig) -> Result<Self, StorageError> {
        match config {
            StorageConfig::Local {
                root,
                public_base_url,
                signing_key,
            } => {
                let base = public_base_url
                    .as_deref()
                    .unwrap_or("http://127.0.0.1:8080");
                let key = signing_key.as_deref().ok_or_else(|| {
                    StorageError::Config("local storage requires a signing_key".into())
                })?;
                Ok(Self::Local(LocalStore::new(root.clone(), base, key.as_bytes())?))
            }
            StorageConfig::S3 {
                bucket,
                endpoint,
                region,
                access_key,
                secret_key,
                root,
            } => Ok(Self::S3(S3Store::new(
                bucket,
                endpoint.as_deref(),
                region,
                access_key.as_deref(),
                secret_key.as_deref(),
                root.as_deref(),
            )?)),
        }
    }

    /// The local store, when that is the active backend.
    pub fn as_local(&self) -> Option<&LocalStore> {
        match self {
            Self::Local(store) => Some(store),
            Self::S3(_) => None,
        }
    }
}

#[async_trait]
impl ArtifactStore for StorageBackend {
    fn backend_name(&self) -> &'static str {
        match self {
            Self::Local(s) => s.backend_name(),
            Self::S3(s) => s.backend_name(),
        }
    }

    async fn upload(
        &self,
        path: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        size: u64,
    ) -> Result<UploadResult, StorageError> {
        match self {
            Self::Local(s) => s.upload(path, reader, size).await,
            Self::S3(s) => s.upload(path, reader, size).await,
        }
    }

    async fn download(&self, path: &str) -> Result<ObjectReader, StorageError> {
        match self {
            Self::Local(s) => s.download(path).await,
            Self::S3(s) => s.download(path).await,
        }
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        match self {
            Self::Local(s) => s.delete(path).await,
            Self::S3(s) => s.delete(path).await,
        }
    }

    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        match self {
            Self::Local(s) => s.exists(path).await,
            Self::S3(s) => s.exists(path).await,
        }
    }

    async fn get_metadata(&self, path: &str) -> Result<FileMetadata, StorageError> {
        match self {
            Self::Local(s) => s.get_metadata(path).await,
            Self::S3(s) => s.get_metadata(path).await,
        }
    }

    async fn get_url(&self, path: &str, ttl: Duration) -> Result<String, StorageError> {
        match self {
            Self::Local(s) => s.get_url(path, ttl).await,
            Self::S3(s) => s.get_url(path, ttl).await,
        }
    }
}

/// Object key for a mirrored build.
pub fn artifact_key(version: &str, platform: Platform, filename: &str) -> String {
    format!(
        "{STORAGE_PREFIX}/{version}/{}/{}/{filename}",
        platform.os, platform.arch
    )
}

/// Reject keys that are empty, absolute, or contain `.`/`..` segments.
///
/// # Errors
///
/// Returns [`StorageError::InvalidPath`].
pub fn validate_key(path: &str) -> Result<(), StorageError> {
    let invalid = path.is_empty()
        || path.starts_with('/')
        || path.contains('\\')
        || path
            .split('/')
            .any(|seg| seg.is_empty() || seg == "." || seg == "..");
    if invalid {
        Err(StorageError::InvalidPath(path.to_string()))
    } else {
        Ok(())
    }
}
