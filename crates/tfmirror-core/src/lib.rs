//! tfmirror core - release mirroring engine
#![allow(missing_docs)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_panics_doc)]
//!
//! Mirrors Terraform/OpenTofu release binaries from an upstream release index
//! into registry-controlled storage, verifying every artifact before it can be
//! served.
//!
//! # Architecture
//!
//! - **Streaming index client** (`releases`): the upstream `index.json` is
//!   decoded entry by entry, so memory stays proportional to one release.
//!   GitHub repositories are listed through the Releases API instead.
//! - **Fail-closed verification** (`checksum`, `signature`): a build is only
//!   stored when its bytes hash to the manifest value, and, when configured,
//!   the manifest itself carries a valid detached signature.
//! - **Closed storage set** (`storage`): local disk with HMAC-signed links, or
//!   S3-compatible buckets with presigned links.
//! - **Actor pattern** (`store`): SQLite access is serialized through
//!   `StoreHandle`.
//! - **Orchestrator and scheduler** (`sync`, `scheduler`): per-platform state
//!   machine with independent failure isolation, driven periodically or on
//!   demand.
//! - **Read side** (`query`): only verified artifacts are ever exposed.

pub mod checksum;
pub mod query;
pub mod releases;
pub mod scheduler;
pub mod signature;
pub mod storage;
pub mod store;
pub mod sync;
pub mod telemetry;

pub use query::{DOWNLOAD_URL_TTL, DownloadInfo, MirrorQueryService, QueryError, VersionDetail};
pub use releases::{GitHubOptions, HttpClients, HttpOptions, ReleaseIndexClient};
pub use scheduler::{Scheduler, SchedulerHandle, SchedulerOptions, TriggerError};
pub use storage::{ArtifactStore, StorageBackend, StorageConfig, StorageError};
pub use store::{DbError, StateDb, StoreHandle};
pub use sync::{SyncError, SyncOptions, SyncOrchestrator, SyncReport};
pub use telemetry::{MetricsError, MirrorMetrics};

/// User agent sent to upstream release servers.
pub const USER_AGENT: &str = concat!("tfmirror/", env!("CARGO_PKG_VERSION"));
