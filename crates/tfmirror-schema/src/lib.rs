//! Shared data model for the release mirror.
#![allow(missing_docs)]
#![allow(clippy::missing_errors_doc)]
//!
//! Everything in this crate is pure data and policy: the persisted records,
//! the supported platform set, SHA-256 digests, and the rules that decide which
//! upstream versions a mirror keeps and which one is "latest". No I/O happens
//! here; `tfmirror-core` owns the network, storage and database.

pub mod hash;
pub mod model;
pub mod platform;
pub mod version;

// Re-exports
pub use hash::*;
pub use model::*;
pub use platform::*;
pub use version::{VersionFilter, is_stable, select_latest};

/// Storage prefix under which mirrored binaries are written.
pub const STORAGE_PREFIX: &str = "terraform-binaries";
