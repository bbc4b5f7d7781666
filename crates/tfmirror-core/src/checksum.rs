//! SHA-256 over byte streams.
//!
//! Every digest the mirror trusts is computed while the bytes flow to their
//! destination, never from a second read of the source.

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use tfmirror_schema::Sha256Digest;

const BUF_SIZE: usize = 64 * 1024;

/// A computed digest that differs from the expected one.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("checksum mismatch: got {actual} want {expected}")]
pub struct ChecksumMismatch {
    /// Digest from the manifest.
    pub expected: Sha256Digest,
    /// Digest of the bytes actually seen.
    pub actual: Sha256Digest,
}

/// Incremental hasher that also counts bytes.
#[derive(Debug, Default, Clone)]
pub struct StreamHasher {
    hasher: Sha256,
    len: u64,
}

impl StreamHasher {
    /// Start a new digest.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next chunk.
    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.len += chunk.len() as u64;
    }

    /// Bytes seen so far.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// True before any byte was fed.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Finish and return the digest with the total length.
    pub fn finish(self) -> (Sha256Digest, u64) {
        let out: [u8; 32] = self.hasher.finalize().into();
        (Sha256Digest::from_bytes(&out), self.len)
    }
}

/// Hash an in-memory buffer.
pub fn sha256_bytes(data: &[u8]) -> Sha256Digest {
    let out: [u8; 32] = Sha256::digest(data).into();
    Sha256Digest::from_bytes(&out)
}

/// Consume `reader` to the end, discarding the bytes.
///
/// # Errors
///
/// Propagates read errors.
pub async fn compute_sha256<R>(reader: &mut R) -> std::io::Result<(Sha256Digest, u64)>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut hasher = StreamHasher::new();
    let mut buffer = vec![0u8; BUF_SIZE];
    loop {
        let count = reader.read(&mut buffer).await?;
        if count == 0 {
            break;
        }
        hasher.update(&buffer[..count]);
    }
    Ok(hasher.finish())
}

/// Copy `reader` into `writer`, hashing exactly the bytes written.
///
/// The writer is flushed before the digest is returned.
///
/// # Errors
///
/// Propagates read and write errors.
pub async fn copy_with_sha256<R, W>(
    reader: &mut R,
    writer: &mut W,
) -> std::io::Result<(Sha256Digest, u64)>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut hasher = StreamHasher::new();
    let mut buffer = vec![0u8; BUF_SIZE];
    loop {
        let count = reader.read(&mut buffer).await?;
        if count == 0 {
            break;
        }
        writer.write_all(&buffer[..count]).await?;
        hasher.update(&buffer[..count]);
    }
    writer.flush().await?;
    Ok(hasher.finish())
}

/// Compare an expected digest against a computed one.
///
/// # Errors
///
/// Returns [`ChecksumMismatch`] carrying both values when they differ.
pub fn verify_equals(
    expected: &Sha256Digest,
    actual: &Sha256Digest,
) -> Result<(), ChecksumMismatch> {
    if expected.matches(actual.as_str()) {
        Ok(())
    } else {
        Err(ChecksumMismatch {
            expected: expected.clone(),
            actual: actual.clone(),
        })
    }
}
