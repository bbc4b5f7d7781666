//! Supported operating systems and CPU architectures.
//!
//! Upstream release indexes list builds for many targets; the mirror only
//! tracks (and only answers queries for) the combinations below.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Rejected `os`, `arch` or `os/arch` input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlatformError {
    /// Operating system outside the supported set.
    #[error("unsupported os: {0}")]
    Os(String),
    /// Architecture outside the supported set.
    #[error("unsupported arch: {0}")]
    Arch(String),
    /// Filter entry not of the form `os/arch`.
    #[error("invalid platform '{0}': expected os/arch")]
    Format(String),
}

/// Target operating system of a release build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Os {
    /// macOS
    Darwin,
    /// FreeBSD
    Freebsd,
    /// Linux
    Linux,
    /// OpenBSD
    Openbsd,
    /// Solaris / illumos
    Solaris,
    /// Windows
    Windows,
}

impl Os {
    /// Every supported operating system.
    pub const ALL: [Os; 6] = [
        Os::Darwin,
        Os::Freebsd,
        Os::Linux,
        Os::Openbsd,
        Os::Solaris,
        Os::Windows,
    ];

    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Darwin => "darwin",
            Self::Freebsd => "freebsd",
            Self::Linux => "linux",
            Self::Openbsd => "openbsd",
            Self::Solaris => "solaris",
            Self::Windows => "windows",
        }
    }
}

impl fmt::Display for Os {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Os {
    type Err = PlatformError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "darwin" => Ok(Self::Darwin),
            "freebsd" => Ok(Self::Freebsd),
            "linux" => Ok(Self::Linux),
            "openbsd" => Ok(Self::Openbsd),
            "solaris" => Ok(Self::Solaris),
            "windows" => Ok(Self::Windows),
            _ => Err(PlatformError::Os(s.to_string())),
        }
    }
}

/// Target CPU architecture of a release build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Arch {
    /// 32-bit x86
    #[serde(rename = "386")]
    I386,
    /// 64-bit x86
    #[serde(rename = "amd64")]
    Amd64,
    /// 32-bit ARM
    #[serde(rename = "arm")]
    Arm,
    /// 64-bit ARM
    #[serde(rename = "arm64")]
    Arm64,
}

impl Arch {
    /// Every supported architecture.
    pub const ALL: [Arch; 4] = [Arch::I386, Arch::Amd64, Arch::Arm, Arch::Arm64];

    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::I386 => "386",
            Self::Amd64 => "amd64",
            Self::Arm => "arm",
            Self::Arm64 => "arm64",
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Arch {
    type Err = PlatformError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "386" => Ok(Self::I386),
            "amd64" => Ok(Self::Amd64),
            "arm" => Ok(Self::Arm),
            "arm64" => Ok(Self::Arm64),
            _ => Err(PlatformError::Arch(s.to_string())),
        }
    }
}

/// An `os/arch` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Platform {
    /// Operating system.
    pub os: Os,
    /// Architecture.
    pub arch: Arch,
}

impl Platform {
    /// Validate a separate `os` and `arch` pair.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError`] naming the first unsupported component.
    pub fn parse(os: &str, arch: &str) -> Result<Self, PlatformError> {
        Ok(Self {
            os: os.parse()?,
            arch: arch.parse()?,
        })
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.arch)
    }
}

impl FromStr for Platform {
    type Err = PlatformError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (os, arch) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| PlatformError::Format(s.to_string()))?;
        if arch.contains('/') {
            return Err(PlatformError::Format(s.to_string()));
        }
        Self::parse(os, arch)
    }
}

/// Set of platforms a mirror keeps. An empty filter keeps everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlatformFilter(BTreeSet<Platform>);

impl PlatformFilter {
    /// Parse `os/arch` entries (case-insensitive). Blank entries are ignored.
    ///
    /// # Errors
    ///
    /// Returns the first entry that is malformed or unsupported.
    pub fn parse<I, S>(entries: I) -> Result<Self, PlatformError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = BTreeSet::new();
        for entry in entries {
            let entry = entry.as_ref().trim();
            if entry.is_empty() {
                continue;
            }
            set.insert(entry.parse()?);
        }
        Ok(Self(set))
    }

    /// Whether a platform passes this filter.
    pub fn allows(&self, platform: Platform) -> bool {
        self.0.is_empty() || self.0.contains(&platform)
    }

    /// True when no restriction is configured.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Entries as `os/arch` strings, sorted.
    pub fn to_strings(&self) -> Vec<String> {
        self.0.iter().map(ToString::to_string).collect()
    }
}
