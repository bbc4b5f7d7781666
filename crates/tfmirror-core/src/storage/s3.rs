//! S3-compatible backend (AWS, R2, MinIO) via opendal.

use std::time::Duration;

use async_trait::async_trait;
use opendal::{ErrorKind, Operator, services::S3};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::{
    ArtifactStore, FileMetadata, ObjectReader, StorageError, UploadResult, validate_key,
};
use crate::checksum::StreamHasher;

const PART_SIZE: usize = 8 * 1024 * 1024;

/// Objects in an S3 bucket; signed URLs are native presigned GETs.
#[derive(Debug, Clone)]
pub struct S3Store {
    op: Operator,
}

impl S3Store {
    /// Build an operator for the bucket.
    ///
    /// Credentials fall back to the usual AWS environment when not given.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Object`] if opendal rejects the configuration.
    pub fn new(
        bucket: &str,
        endpoint: Option<&str>,
        region: &str,
        access_key: Option<&str>,
        secret_key: Option<&str>,
        root: Option<&str>,
    ) -> Result<Self, StorageError> {
        if bucket.is_empty() {
            return Err(StorageError::Config("s3 bucket must not be empty".into()));
        }
        let mut builder = S3::default();
        builder.bucket(bucket);
        builder.region(region);
        if let Some(endpoint) = endpoint {
            builder.endpoint(endpoint);
        }
        if let Some(key) = access_key {
            builder.access_key_id(key);
        }
        if let Some(secret) = secret_key {
            builder.secret_access_key(secret);
        }
        if let Some(root) = root {
            builder.root(root);
        }
        Ok(Self {
            op: Operator::new(builder)?.finish(),
        })
    }

    /// Wrap an existing operator.
    pub fn from_operator(op: Operator) -> Self {
        Self { op }
    }
}

#[async_trait]
impl ArtifactStore for S3Store {
    fn backend_name(&self) -> &'static str {
        "s3"
    }

    async fn upload(
        &self,
        path: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        size: u64,
    ) -> Result<UploadResult, StorageError> {
        validate_key(path)?;
        let mut writer = self.op.writer(path).await?;
        let mut hasher = StreamHasher::new();
        let mut buf = vec![0u8; PART_SIZE];

        loop {
            let mut filled = 0;
            while filled < buf.len() {
                let n = reader.read(&mut buf[filled..]).await?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            if filled == 0 {
                break;
            }
            hasher.update(&buf[..filled]);
            if let Err(e) = writer.write(buf[..filled].to_vec()).await {
                let _ = writer.abort().await;
                return Err(e.into());
            }
        }

        if hasher.len() != size {
            let _ = writer.abort().await;
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("expected {size} bytes, got {}", hasher.len()),
            )));
        }
        writer.close().await?;

        let (checksum, written) = hasher.finish();
        Ok(UploadResult {
            path: path.to_string(),
            size: written,
            checksum,
        })
    }

    /// Streams the object body.
    async fn download(&self, path: &str) -> Result<ObjectReader, StorageError> {
        validate_key(path)?;
        match self.op.reader(path).await {
            Ok(reader) => Ok(Box::new(reader)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StorageError::NotFound(path.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        validate_key(path)?;
        Ok(self.op.delete(path).await?)
    }

    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        validate_key(path)?;
        Ok(self.op.is_exist(path).await?)
    }

    async fn get_metadata(&self, path: &str) -> Result<FileMetadata, StorageError> {
        validate_key(path)?;
        let meta = match self.op.stat(path).await {
            Ok(m) => m,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StorageError::NotFound(path.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(FileMetadata {
            path: path.to_string(),
            size: meta.content_length(),
            checksum: None,
            last_modified: meta.last_modified(),
        })
    }

    async fn get_url(&self, path: &str, ttl: Duration) -> Result<String, StorageError> {
        validate_key(path)?;
        let req = self.op.presign_read(path, ttl).await?;
        Ok(req.uri().to_string())
    }
}
