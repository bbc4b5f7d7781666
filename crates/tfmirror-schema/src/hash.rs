use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// Error returned when a string is not a well-formed SHA-256 digest.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DigestError {
    /// Wrong number of hex characters.
    #[error("invalid SHA256 digest: expected 64 hex characters, got {len} in '{input}'")]
    Length {
        /// Number of characters after prefix stripping.
        len: usize,
        /// Original input.
        input: String,
    },
    /// Contains characters outside `[0-9a-fA-F]`.
    #[error("invalid SHA256 digest: contains non-hex characters in '{0}'")]
    NonHex(String),
}

/// A validated SHA256 digest (64 lowercase hex characters).
///
/// Manifest entries, computed stream digests and stored checksums all pass
/// through this type, so equality is always case-insensitive on the original
/// input.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Sha256Digest(String);

impl Sha256Digest {
    /// Create a new `Sha256Digest`, validating the input.
    ///
    /// Accepts strings with or without a `sha256:` prefix.
    ///
    /// # Errors
    ///
    /// Returns an error if the hex portion is not exactly 64 ASCII hex characters.
    pub fn new(s: impl Into<String>) -> Result<Self, DigestError> {
        let s = s.into();
        let hex = s.strip_prefix("sha256:").unwrap_or(&s).trim();

        if hex.len() != 64 {
            return Err(DigestError::Length {
                len: hex.len(),
                input: s.clone(),
            });
        }

        if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(DigestError::NonHex(s.clone()));
        }

        Ok(Self(hex.to_ascii_lowercase()))
    }

    /// Build a digest from the raw 32-byte output of a hasher.
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self(hex::encode(bytes))
    }

    /// Compare against an arbitrary hex string, ignoring case.
    ///
    /// Malformed input never matches.
    pub fn matches(&self, other: &str) -> bool {
        let other = other.strip_prefix("sha256:").unwrap_or(other).trim();
        self.0.eq_ignore_ascii_case(other)
    }

    /// Get the digest as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for Sha256Digest {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::new(s).map_err(serde::de::Error::custom)
    }
}

impl std::str::FromStr for Sha256Digest {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl std::fmt::Display for Sha256Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Sha256Digest {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
