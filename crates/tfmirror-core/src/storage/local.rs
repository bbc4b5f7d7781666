//! Local filesystem backend with HMAC-signed download links.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio::fs;
use tokio::io::AsyncRead;

use super::{
    ArtifactStore, FileMetadata, ObjectReader, StorageError, UploadResult, validate_key,
};
use crate::checksum::{compute_sha256, copy_with_sha256};

type HmacSha256 = Hmac<Sha256>;

/// Stores objects as files under a root directory.
///
/// Signed URLs point at this server's `/files/{key}` route and carry
/// `expires` (unix seconds) and `signature` (hex HMAC-SHA256 over
/// `"{key}\n{expires}"`).
pub struct LocalStore {
    root: PathBuf,
    public_base_url: String,
    signing_key: Vec<u8>,
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore")
            .field("root", &self.root)
            .field("public_base_url", &self.public_base_url)
            .finish_non_exhaustive()
    }
}

impl LocalStore {
    /// Create the store, making `root` if needed.
    ///
    /// # Errors
    ///
    /// Fails if the directory cannot be created or the key is empty.
    pub fn new(root: PathBuf, public_base_url: &str, signing_key: &[u8]) -> Result<Self, StorageError> {
        if signing_key.is_empty() {
            return Err(StorageError::Config("signing key must not be empty".into()));
        }
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
            signing_key: signing_key.to_vec(),
        })
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, key: &str) -> Result<PathBuf, StorageError> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    fn sign(&self, key: &str, expires: i64) -> Result<String, StorageError> {
        Ok(hex::encode(self.mac(key, expires)?.finalize().into_bytes()))
    }

    fn mac(&self, key: &str, expires: i64) -> Result<HmacSha256, StorageError> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.signing_key)
            .map_err(|e| StorageError::Config(format!("invalid signing key: {e}")))?;
        mac.update(key.as_bytes());
        mac.update(b"\n");
        mac.update(expires.to_string().as_bytes());
        Ok(mac)
    }

    /// Check a signed link produced by [`ArtifactStore::get_url`].
    pub fn verify_signed(&self, key: &str, expires: i64, signature: &str, now: DateTime<Utc>) -> bool {
        if now.timestamp() > expires {
            return false;
        }
        let (Ok(sig), Ok(mac)) = (hex::decode(signature), self.mac(key, expires)) else {
            return false;
        };
        mac.verify_slice(&sig).is_ok()
    }
}

#[async_trait]
impl ArtifactStore for LocalStore {
    fn backend_name(&self) -> &'static str {
        "local"
    }

    async fn upload(
        &self,
        path: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        size: u64,
    ) -> Result<UploadResult, StorageError> {
        let dest = self.resolve(path)?;
        let parent = dest
            .parent()
            .ok_or_else(|| StorageError::InvalidPath(path.to_string()))?;
        fs::create_dir_all(parent).await?;

        // Write beside the target and rename so readers never see a partial file.
        let partial = parent.join(format!(".partial-{}", uuid::Uuid::new_v4()));
        let result = async {
            let mut file = fs::File::create(&partial).await?;
            let (checksum, written) = copy_with_sha256(&mut *reader, &mut file).await?;
            file.sync_all().await?;
            if written != size {
                return Err(StorageError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("expected {size} bytes, got {written}"),
                )));
            }
            fs::rename(&partial, &dest).await?;
            Ok(UploadResult {
                path: path.to_string(),
                size: written,
                checksum,
            })
        }
        .await;

        if result.is_err() {
            let _ = fs::remove_file(&partial).await;
        }
        result
    }

    async fn download(&self, path: &str) -> Result<ObjectReader, StorageError> {
        let file = match fs::File::open(self.resolve(path)?).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(path.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Box::new(file))
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        match fs::remove_file(self.resolve(path)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        Ok(fs::try_exists(self.resolve(path)?).await?)
    }

    async fn get_metadata(&self, path: &str) -> Result<FileMetadata, StorageError> {
        let full = self.resolve(path)?;
        let meta = match fs::metadata(&full).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(path.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let mut file = fs::File::open(&full).await?;
        let (checksum, _) = compute_sha256(&mut file).await?;
        Ok(FileMetadata {
            path: path.to_string(),
            size: meta.len(),
            checksum: Some(checksum),
            last_modified: meta.modified().ok().map(DateTime::<Utc>::from),
        })
    }

    async fn get_url(&self, path: &str, ttl: Duration) -> Result<String, StorageError> {
        validate_key(path)?;
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| StorageError::Config(format!("ttl out of range: {e}")))?;
        let expires = (Utc::now() + ttl).timestamp();
        let signature = self.sign(path, expires)?;
        Ok(format!(
            "{}/files/{path}?expires={expires}&signature={signature}",
            self.public_base_url
        ))
    }
}
