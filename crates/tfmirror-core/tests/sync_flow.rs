//! End-to-end sync runs: mock upstream, real orchestrator, local store, SQLite.
#![allow(missing_docs)]
#![allow(clippy::float_cmp)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use ed25519_dalek::{Signer, SigningKey};
use mockito::{Matcher, Mock, Server, ServerGuard};
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use tfmirror_core::storage::{FileMetadata, LocalStore, ObjectReader, UploadResult};
use tfmirror_core::{
    ArtifactStore, GitHubOptions, HttpClients, HttpOptions, MirrorMetrics, MirrorQueryService, QueryError,
    Scheduler, SchedulerOptions, StateDb, StorageError, StoreHandle, SyncError, SyncOptions,
    SyncOrchestrator,
};
use tfmirror_schema::{
    MirrorConfig, Platform, PlatformFilter, RunStatus, SyncStatus, TriggeredBy, VersionPlatform,
};

const PRODUCT: &str = "terraform";

fn zip_name(version: &str, os: &str, arch: &str) -> String {
    format!("{PRODUCT}_{version}_{os}_{arch}.zip")
}

fn sums_name(version: &str) -> String {
    format!("{PRODUCT}_{version}_SHA256SUMS")
}

fn body_for(version: &str, os: &str, arch: &str) -> Vec<u8> {
    format!("binary {version} {os} {arch}").into_bytes()
}

/// Mock release server laid out like releases.hashicorp.com.
struct Upstream {
    server: ServerGuard,
    mocks: HashMap<String, Mock>,
}

impl Upstream {
    async fn new() -> Self {
        Self {
            server: Server::new_async().await,
            mocks: HashMap::new(),
        }
    }

    fn url(&self) -> String {
        self.server.url()
    }

    /// Serve `body` at `path`, replacing any earlier mock for it.
    async fn serve(&mut self, path: &str, status: usize, body: &[u8]) {
        if let Some(old) = self.mocks.remove(path) {
            old.remove_async().await;
        }
        let mock = self
            .server
            .mock("GET", path)
            .with_status(status)
            .with_body(body)
            .create_async()
            .await;
        self.mocks.insert(path.to_string(), mock);
    }

    async fn index(&mut self, releases: &[(&str, &[(&str, &str)])]) {
        let versions: serde_json::Map<String, serde_json::Value> = releases
            .iter()
            .map(|(version, builds)| {
                let builds: Vec<_> = builds
                    .iter()
                    .map(|(os, arch)| {
                        serde_json::json!({
                            "name": PRODUCT,
                            "version": version,
                            "os": os,
                            "arch": arch,
                            "filename": zip_name(version, os, arch),
                        })
                    })
                    .collect();
                let entry = serde_json::json!({
                    "name": PRODUCT,
                    "version": version,
                    "shasums": sums_name(version),
                    "builds": builds,
                });
                ((*version).to_string(), entry)
            })
            .collect();
        let index = serde_json::json!({ "name": PRODUCT, "versions": versions });
        self.serve(
            &format!("/{PRODUCT}/index.json"),
            200,
            index.to_string().as_bytes(),
        )
        .await;
    }

    /// Publish a version's binaries and a manifest that matches them.
    async fn release(&mut self, version: &str, builds: &[(&str, &str)]) -> Vec<u8> {
        let mut manifest = String::new();
        for (os, arch) in builds {
            let body = body_for(version, os, arch);
            manifest.push_str(&format!(
                "{}  {}\n",
                hex::encode(Sha256::digest(&body)),
                zip_name(version, os, arch)
            ));
            self.serve(
                &format!("/{PRODUCT}/{version}/{}", zip_name(version, os, arch)),
                200,
                &body,
            )
            .await;
        }
        self.serve(
            &format!("/{PRODUCT}/{version}/{}", sums_name(version)),
            200,
            manifest.as_bytes(),
        )
        .await;
        manifest.into_bytes()
    }

    async fn sign(&mut self, version: &str, manifest: &[u8], key: &SigningKey) {
        let signature = STANDARD.encode(key.sign(manifest).to_bytes());
        self.serve(
            &format!("/{PRODUCT}/{version}/{}.sig", sums_name(version)),
            200,
            signature.as_bytes(),
        )
        .await;
    }
}

struct Harness {
    dir: TempDir,
    upstream: Upstream,
    store: StoreHandle,
    storage: Arc<dyn ArtifactStore>,
    metrics: Arc<MirrorMetrics>,
    orchestrator: SyncOrchestrator,
    query: MirrorQueryService,
}

impl Harness {
    async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let storage: Arc<dyn ArtifactStore> = Arc::new(
            LocalStore::new(dir.path().join("objects"), "https://mirror.example.com", b"k").unwrap(),
        );
        Self::with_storage(dir, storage).await
    }

    async fn with_storage(dir: TempDir, storage: Arc<dyn ArtifactStore>) -> Self {
        let upstream = Upstream::new().await;
        let store = StoreHandle::open(&dir.path().join("state.db")).unwrap();
        let metrics = MirrorMetrics::shared().unwrap();
        let http = HttpClients::new(&HttpOptions {
            metadata_timeout: Duration::from_secs(5),
            download_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(2),
        })
        .unwrap()
        .with_github(GitHubOptions {
            api_url: upstream.url(),
            token: None,
        });
        let orchestrator = SyncOrchestrator::new(
            store.clone(),
            Arc::clone(&storage),
            http,
            Arc::clone(&metrics),
            SyncOptions::default(),
        );
        let query = MirrorQueryService::new(store.clone(), Arc::clone(&storage), Arc::clone(&metrics));
        Self {
            dir,
            upstream,
            store,
            storage,
            metrics,
            orchestrator,
            query,
        }
    }

    fn config(&self) -> MirrorConfig {
        MirrorConfig {
            id: Uuid::new_v4(),
            name: PRODUCT.into(),
            product: PRODUCT.into(),
            upstream_url: self.upstream.url(),
            enabled: true,
            platform_filter: PlatformFilter::default(),
            version_filter: None,
            gpg_verify: false,
            stable_only: true,
            sync_interval_hours: 24,
            trusted_key: None,
            signature_suffix: ".sig".into(),
            last_sync_at: None,
            last_sync_status: None,
            last_sync_error: None,
        }
    }

    async fn install(&self, config: MirrorConfig) -> Uuid {
        self.store
            .call(move |db| db.upsert_config(&config))
            .await
            .unwrap()
            .id
    }

    async fn sync(&self, config_id: Uuid) -> Result<tfmirror_core::SyncReport, SyncError> {
        self.orchestrator
            .run_sync(config_id, TriggeredBy::Manual, &CancellationToken::new())
            .await
    }

    async fn platform(&self, config_id: Uuid, version: &str, os: &str, arch: &str) -> VersionPlatform {
        let version = version.to_string();
        let platform = Platform::parse(os, arch).unwrap();
        self.store
            .call(move |db| {
                let v = db.get_version(config_id, &version)?.unwrap();
                Ok(db.get_platform(v.id, platform)?.unwrap())
            })
            .await
            .unwrap()
    }

    async fn config_row(&self, config_id: Uuid) -> MirrorConfig {
        self.store
            .call(move |db| db.get_config(config_id))
            .await
            .unwrap()
            .unwrap()
    }
}

const BOTH: &[(&str, &str)] = &[("linux", "amd64"), ("darwin", "arm64")];

/// Local storage that counts uploads.
#[derive(Debug)]
struct CountingStore {
    inner: LocalStore,
    uploads: AtomicUsize,
}

#[async_trait]
impl ArtifactStore for CountingStore {
    fn backend_name(&self) -> &'static str {
        self.inner.backend_name()
    }

    async fn upload(
        &self,
        path: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        size: u64,
    ) -> Result<UploadResult, StorageError> {
        self.uploads.fetch_add(1, Ordering::SeqCst);
        self.inner.upload(path, reader, size).await
    }

    async fn download(&self, path: &str) -> Result<ObjectReader, StorageError> {
        self.inner.download(path).await
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        self.inner.delete(path).await
    }

    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        self.inner.exists(path).await
    }

    async fn get_metadata(&self, path: &str) -> Result<FileMetadata, StorageError> {
        self.inner.get_metadata(path).await
    }

    async fn get_url(&self, path: &str, ttl: Duration) -> Result<String, StorageError> {
        self.inner.get_url(path, ttl).await
    }
}

#[tokio::test]
async fn test_sync_stores_verified_builds_and_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let counting = Arc::new(CountingStore {
        inner: LocalStore::new(dir.path().join("objects"), "https://mirror.example.com", b"k").unwrap(),
        uploads: AtomicUsize::new(0),
    });
    let mut h = Harness::with_storage(dir, Arc::clone(&counting) as Arc<dyn ArtifactStore>).await;
    h.upstream.index(&[("1.9.0", BOTH)]).await;
    h.upstream.release("1.9.0", BOTH).await;
    let id = h.install(h.config()).await;

    let first = h.sync(id).await.unwrap();
    assert_eq!(first.platforms_synced, 2);
    assert_eq!(first.platforms_failed, 0);
    assert_eq!(first.latest.as_deref(), Some("1.9.0"));
    assert_eq!(counting.uploads.load(Ordering::SeqCst), 2);

    let linux = h.platform(id, "1.9.0", "linux", "amd64").await;
    assert_eq!(linux.sync_status, SyncStatus::Synced);
    assert!(linux.sha256_verified);
    assert!(!linux.gpg_verified);
    assert_eq!(linux.storage_backend.as_deref(), Some("local"));
    let key = linux.storage_key.clone().unwrap();
    assert_eq!(key, "terraform-binaries/1.9.0/linux/amd64/terraform_1.9.0_linux_amd64.zip");

    let meta = h.storage.get_metadata(&key).await.unwrap();
    assert_eq!(meta.checksum, linux.sha256);

    let second = h.sync(id).await.unwrap();
    assert_eq!(second.platforms_synced, 0);
    assert_eq!(second.platforms_unchanged, 2);
    assert_eq!(counting.uploads.load(Ordering::SeqCst), 2);
    let again = h.platform(id, "1.9.0", "linux", "amd64").await;
    assert_eq!(again.synced_at, linux.synced_at);

    let history = h.store.call(move |db| db.list_history(id, 10)).await.unwrap();
    assert_eq!(history.len(), 2);
    assert!(history.iter().all(|r| r.status == RunStatus::Success));
    assert_eq!(h.config_row(id).await.last_sync_status, Some(RunStatus::Success));
}

#[tokio::test]
async fn test_checksum_mismatch_is_never_stored() {
    let mut h = Harness::new().await;
    h.upstream.index(&[("1.9.0", BOTH)]).await;
    h.upstream.release("1.9.0", BOTH).await;
    h.upstream
        .serve(
            &format!("/{PRODUCT}/1.9.0/{}", zip_name("1.9.0", "linux", "amd64")),
            200,
            b"tampered bytes",
        )
        .await;
    let id = h.install(h.config()).await;

    let report = h.sync(id).await.unwrap();
    assert_eq!(report.platforms_failed, 1);
    assert_eq!(report.platforms_synced, 1);

    let linux = h.platform(id, "1.9.0", "linux", "amd64").await;
    assert_eq!(linux.sync_status, SyncStatus::Error);
    assert!(linux.storage_key.is_none());
    assert!(linux.sync_error.unwrap().contains("checksum mismatch"));
    assert!(
        !h.storage
            .exists("terraform-binaries/1.9.0/linux/amd64/terraform_1.9.0_linux_amd64.zip")
            .await
            .unwrap()
    );

    assert!(matches!(
        h.query.resolve_download(PRODUCT, "1.9.0", "linux", "amd64").await,
        Err(QueryError::NotYetAvailable(_))
    ));
    assert!(h.metrics.encode_text().unwrap().contains("tfmirror_sync_errors_total{mirror=\"terraform\"} 1"));
}

#[tokio::test]
async fn test_stable_only_and_latest_selection() {
    let mut h = Harness::new().await;
    let linux: &[(&str, &str)] = &[("linux", "amd64")];
    h.upstream
        .index(&[("1.9.0", linux), ("1.9.1", linux), ("1.10.0-beta1", linux)])
        .await;
    for v in ["1.9.0", "1.9.1", "1.10.0-beta1"] {
        h.upstream.release(v, linux).await;
    }
    let id = h.install(h.config()).await;

    let report = h.sync(id).await.unwrap();
    assert_eq!(report.versions_found, 3);
    assert_eq!(report.versions_retained, 2);
    assert_eq!(report.latest.as_deref(), Some("1.9.1"));

    let versions = h.query.list_versions(PRODUCT).await.unwrap();
    let names: Vec<_> = versions.iter().map(|v| v.version.as_str()).collect();
    assert_eq!(names, vec!["1.9.1", "1.9.0"]);
    let latest = h.query.get_latest(PRODUCT).await.unwrap();
    assert_eq!(latest.version.version, "1.9.1");
}

#[tokio::test]
async fn test_version_filter_limits_retained_versions() {
    let mut h = Harness::new().await;
    let linux: &[(&str, &str)] = &[("linux", "amd64")];
    h.upstream
        .index(&[("1.8.5", linux), ("1.9.0", linux), ("1.9.1", linux)])
        .await;
    for v in ["1.8.5", "1.9.0", "1.9.1"] {
        h.upstream.release(v, linux).await;
    }
    let mut config = h.config();
    config.version_filter = Some("latest:1".into());
    let id = h.install(config).await;

    let report = h.sync(id).await.unwrap();
    assert_eq!(report.versions_retained, 1);
    assert_eq!(report.platforms_synced, 1);
    let versions = h.query.list_versions(PRODUCT).await.unwrap();
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].version, "1.9.1");
}

#[tokio::test]
async fn test_platform_failure_is_isolated() {
    let mut h = Harness::new().await;
    h.upstream.index(&[("1.9.0", BOTH)]).await;
    h.upstream.release("1.9.0", BOTH).await;
    h.upstream
        .serve(
            &format!("/{PRODUCT}/1.9.0/{}", zip_name("1.9.0", "linux", "amd64")),
            500,
            b"boom",
        )
        .await;
    let id = h.install(h.config()).await;

    let report = h.sync(id).await.unwrap();
    assert_eq!(report.platforms_synced, 1);
    assert_eq!(report.platforms_failed, 1);
    assert_eq!(report.versions_synced, 1);
    assert!(report.errors.iter().any(|e| e.contains("linux/amd64")));

    let linux = h.platform(id, "1.9.0", "linux", "amd64").await;
    assert_eq!(linux.sync_status, SyncStatus::Error);
    assert!(linux.sync_error.unwrap().contains("download failed"));
    let darwin = h.platform(id, "1.9.0", "darwin", "arm64").await;
    assert_eq!(darwin.sync_status, SyncStatus::Synced);

    let info = h
        .query
        .resolve_download(PRODUCT, "1.9.0", "darwin", "arm64")
        .await
        .unwrap();
    assert_eq!(info.filename, zip_name("1.9.0", "darwin", "arm64"));
    assert!(matches!(
        h.query.resolve_download(PRODUCT, "1.9.0", "linux", "amd64").await,
        Err(QueryError::NotYetAvailable(_))
    ));

    // The next run retries only the failed platform.
    h.upstream
        .serve(
            &format!("/{PRODUCT}/1.9.0/{}", zip_name("1.9.0", "linux", "amd64")),
            200,
            &body_for("1.9.0", "linux", "amd64"),
        )
        .await;
    let retry = h.sync(id).await.unwrap();
    assert_eq!(retry.platforms_synced, 1);
    assert_eq!(retry.platforms_unchanged, 1);
    assert_eq!(h.platform(id, "1.9.0", "linux", "amd64").await.sync_status, SyncStatus::Synced);
}

fn manifest_for(version: &str, builds: &[(&str, &str)]) -> String {
    builds
        .iter()
        .map(|(os, arch)| {
            format!(
                "{}  {}\n",
                hex::encode(Sha256::digest(body_for(version, os, arch))),
                zip_name(version, os, arch)
            )
        })
        .collect()
}

#[tokio::test]
async fn test_missing_manifest_entry_fails_closed() {
    let mut h = Harness::new().await;
    h.upstream.index(&[("1.9.0", BOTH)]).await;
    h.upstream.release("1.9.0", BOTH).await;
    h.upstream
        .serve(
            &format!("/{PRODUCT}/1.9.0/{}", sums_name("1.9.0")),
            200,
            manifest_for("1.9.0", &[("darwin", "arm64")]).as_bytes(),
        )
        .await;
    let id = h.install(h.config()).await;

    h.sync(id).await.unwrap();
    let linux = h.platform(id, "1.9.0", "linux", "amd64").await;
    assert_eq!(linux.sync_status, SyncStatus::Error);
    assert!(linux.sync_error.unwrap().contains("no checksum"));
}

#[tokio::test]
async fn test_signature_gate() {
    let mut h = Harness::new().await;
    let signer = SigningKey::from_bytes(&[9u8; 32]);
    let impostor = SigningKey::from_bytes(&[3u8; 32]);
    h.upstream.index(&[("1.9.0", BOTH), ("1.9.1", BOTH)]).await;
    let good = h.upstream.release("1.9.0", BOTH).await;
    h.upstream.sign("1.9.0", &good, &signer).await;
    let tampered = h.upstream.release("1.9.1", BOTH).await;
    h.upstream.sign("1.9.1", &tampered, &impostor).await;

    let mut config = h.config();
    config.gpg_verify = true;
    config.trusted_key = Some(STANDARD.encode(signer.verifying_key().to_bytes()));
    let id = h.install(config).await;

    let report = h.sync(id).await.unwrap();
    assert_eq!(report.platforms_synced, 2);
    assert_eq!(report.latest.as_deref(), Some("1.9.0"));

    for (os, arch) in BOTH {
        let ok = h.platform(id, "1.9.0", os, arch).await;
        assert_eq!(ok.sync_status, SyncStatus::Synced);
        assert!(ok.gpg_verified);

        let bad = h.platform(id, "1.9.1", os, arch).await;
        assert_eq!(bad.sync_status, SyncStatus::Error);
        assert!(bad.storage_key.is_none());
        assert!(bad.sync_error.unwrap().contains("signature"));
    }
    assert!(
        !h.storage
            .exists("terraform-binaries/1.9.1/linux/amd64/terraform_1.9.1_linux_amd64.zip")
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn test_invalid_signature_revokes_synced_platforms() {
    let mut h = Harness::new().await;
    let signer = SigningKey::from_bytes(&[9u8; 32]);
    h.upstream.index(&[("1.9.0", BOTH)]).await;
    let manifest = h.upstream.release("1.9.0", BOTH).await;
    h.upstream.sign("1.9.0", &manifest, &signer).await;

    let mut config = h.config();
    config.gpg_verify = true;
    config.trusted_key = Some(STANDARD.encode(signer.verifying_key().to_bytes()));
    let id = h.install(config).await;
    h.sync(id).await.unwrap();
    let stored: Vec<String> = {
        let mut keys = Vec::new();
        for (os, arch) in BOTH {
            keys.push(h.platform(id, "1.9.0", os, arch).await.storage_key.unwrap());
        }
        keys
    };
    for key in &stored {
        assert!(h.storage.exists(key).await.unwrap());
    }

    h.upstream
        .serve(
            &format!("/{PRODUCT}/1.9.0/{}.sig", sums_name("1.9.0")),
            200,
            STANDARD.encode([0u8; 64]).as_bytes(),
        )
        .await;
    let report = h.sync(id).await.unwrap();
    assert_eq!(report.platforms_failed, 2);
    assert_eq!(report.versions_failed, 1);
    assert!(report.latest.is_none());

    let linux = h.platform(id, "1.9.0", "linux", "amd64").await;
    assert_eq!(linux.sync_status, SyncStatus::Error);
    assert!(linux.sync_error.unwrap().contains("manifest signature invalid"));
    assert!(matches!(
        h.query.get_latest(PRODUCT).await,
        Err(QueryError::NotFound(_))
    ));
    for key in &stored {
        assert!(!h.storage.exists(key).await.unwrap(), "{key} should be deleted");
    }
}

const OPENPGP_KEY: &str = include_str!("fixtures/openpgp/subkey_key.asc");
const OPENPGP_MANIFEST: &[u8] = include_bytes!("fixtures/openpgp/terraform_1.9.0_SHA256SUMS");
const OPENPGP_SIGNATURE: &[u8] = include_bytes!("fixtures/openpgp/terraform_1.9.0_SHA256SUMS.sig");

#[tokio::test]
async fn test_openpgp_signed_manifest_is_verified() {
    let mut h = Harness::new().await;
    h.upstream.index(&[("1.9.0", BOTH), ("1.9.1", BOTH)]).await;
    let manifest = h.upstream.release("1.9.0", BOTH).await;
    assert_eq!(manifest, OPENPGP_MANIFEST);
    h.upstream
        .serve(
            &format!("/{PRODUCT}/1.9.0/{}.sig", sums_name("1.9.0")),
            200,
            OPENPGP_SIGNATURE,
        )
        .await;
    // A signature made over another manifest does not carry over.
    h.upstream.release("1.9.1", BOTH).await;
    h.upstream
        .serve(
            &format!("/{PRODUCT}/1.9.1/{}.sig", sums_name("1.9.1")),
            200,
            OPENPGP_SIGNATURE,
        )
        .await;

    let mut config = h.config();
    config.gpg_verify = true;
    config.trusted_key = Some(OPENPGP_KEY.to_string());
    let id = h.install(config).await;

    let report = h.sync(id).await.unwrap();
    assert_eq!(report.platforms_synced, 2);
    assert_eq!(report.latest.as_deref(), Some("1.9.0"));
    for (os, arch) in BOTH {
        let ok = h.platform(id, "1.9.0", os, arch).await;
        assert_eq!(ok.sync_status, SyncStatus::Synced);
        assert!(ok.gpg_verified);

        let bad = h.platform(id, "1.9.1", os, arch).await;
        assert_eq!(bad.sync_status, SyncStatus::Error);
        assert!(bad.sync_error.unwrap().contains("manifest signature invalid"));
    }
}

/// Publish a GitHub release of OpenTofu-style `tofu_*` assets, signed with `key`.
async fn github_release(upstream: &mut Upstream, version: &str, key: &SigningKey) -> Mock {
    let base = upstream.url();
    let download = format!("/opentofu/opentofu/releases/download/v{version}");
    let mut assets = Vec::new();
    let mut manifest = String::new();
    for (os, arch) in BOTH {
        let name = format!("tofu_{version}_{os}_{arch}.zip");
        let body = body_for(version, os, arch);
        manifest.push_str(&format!("{}  {name}\n", hex::encode(Sha256::digest(&body))));
        upstream.serve(&format!("{download}/{name}"), 200, &body).await;
        assets.push(name);
    }
    // Other products' archives in the same release are ignored.
    let foreign = format!("terraform_{version}_linux_amd64.zip");
    upstream
        .serve(&format!("{download}/{foreign}"), 200, b"not tofu")
        .await;
    assets.push(foreign);

    let sums = format!("tofu_{version}_SHA256SUMS");
    upstream
        .serve(&format!("{download}/{sums}"), 200, manifest.as_bytes())
        .await;
    let signature = STANDARD.encode(key.sign(manifest.as_bytes()).to_bytes());
    upstream
        .serve(&format!("{download}/{sums}.sig"), 200, signature.as_bytes())
        .await;
    assets.push(sums.clone());
    assets.push(format!("{sums}.sig"));

    let assets: Vec<_> = assets
        .iter()
        .map(|name| {
            serde_json::json!({
                "name": name,
                "browser_download_url": format!("{base}{download}/{name}"),
            })
        })
        .collect();
    let releases = serde_json::json!([
        {"tag_name": format!("v{version}"), "draft": false, "published_at": "2024-12-10T09:00:00Z", "assets": assets},
        {"tag_name": "v9.9.9", "draft": true, "assets": []},
    ]);
    upstream
        .server
        .mock("GET", "/repos/opentofu/opentofu/releases")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(releases.to_string())
        .create_async()
        .await
}

#[tokio::test]
async fn test_github_release_assets_are_mirrored() {
    let mut h = Harness::new().await;
    let signer = SigningKey::from_bytes(&[9u8; 32]);
    let releases = github_release(&mut h.upstream, "1.9.0", &signer).await;

    let mut config = h.config();
    config.name = "tofu".into();
    config.product = "opentofu".into();
    config.upstream_url = "https://github.com/opentofu/opentofu".into();
    config.gpg_verify = true;
    config.trusted_key = Some(STANDARD.encode(signer.verifying_key().to_bytes()));
    let id = h.install(config).await;

    let report = h.sync(id).await.unwrap();
    releases.assert_async().await;
    assert_eq!(report.versions_found, 1);
    assert_eq!(report.platforms_synced, 2);
    assert_eq!(report.platforms_failed, 0);
    assert_eq!(report.latest.as_deref(), Some("1.9.0"));

    for (os, arch) in BOTH {
        let row = h.platform(id, "1.9.0", os, arch).await;
        assert_eq!(row.sync_status, SyncStatus::Synced);
        assert!(row.gpg_verified);
        assert_eq!(row.filename, format!("tofu_1.9.0_{os}_{arch}.zip"));
        assert_eq!(
            row.sha256.unwrap().as_str(),
            hex::encode(Sha256::digest(body_for("1.9.0", os, arch)))
        );
    }
    let detail = h.query.get_version("tofu", "1.9.0").await.unwrap();
    assert_eq!(detail.platforms.len(), 2);
}

#[tokio::test]
async fn test_upstream_checksum_change_triggers_resync() {
    let mut h = Harness::new().await;
    let linux: &[(&str, &str)] = &[("linux", "amd64")];
    h.upstream.index(&[("1.9.0", linux)]).await;
    h.upstream.release("1.9.0", linux).await;
    let id = h.install(h.config()).await;
    h.sync(id).await.unwrap();
    let before = h.platform(id, "1.9.0", "linux", "amd64").await;

    let rebuilt = b"rebuilt binary".to_vec();
    let zip = zip_name("1.9.0", "linux", "amd64");
    h.upstream
        .serve(&format!("/{PRODUCT}/1.9.0/{zip}"), 200, &rebuilt)
        .await;
    h.upstream
        .serve(
            &format!("/{PRODUCT}/1.9.0/{}", sums_name("1.9.0")),
            200,
            format!("{}  {zip}\n", hex::encode(Sha256::digest(&rebuilt))).as_bytes(),
        )
        .await;

    let report = h.sync(id).await.unwrap();
    assert_eq!(report.platforms_synced, 1);
    let after = h.platform(id, "1.9.0", "linux", "amd64").await;
    assert_ne!(after.sha256, before.sha256);
    assert_eq!(
        after.sha256.unwrap().as_str(),
        hex::encode(Sha256::digest(&rebuilt))
    );
}

#[tokio::test]
async fn test_vanished_object_is_resynced() {
    let mut h = Harness::new().await;
    let linux: &[(&str, &str)] = &[("linux", "amd64")];
    h.upstream.index(&[("1.9.0", linux)]).await;
    h.upstream.release("1.9.0", linux).await;
    let id = h.install(h.config()).await;
    h.sync(id).await.unwrap();

    let key = h
        .platform(id, "1.9.0", "linux", "amd64")
        .await
        .storage_key
        .unwrap();
    h.storage.delete(&key).await.unwrap();

    let report = h.sync(id).await.unwrap();
    assert_eq!(report.platforms_synced, 1);
    assert!(h.storage.exists(&key).await.unwrap());
}

#[tokio::test]
async fn test_platform_filter_and_unsupported_builds() {
    let mut h = Harness::new().await;
    let builds: &[(&str, &str)] = &[("linux", "amd64"), ("darwin", "arm64"), ("plan9", "amd64")];
    h.upstream.index(&[("1.9.0", builds)]).await;
    h.upstream.release("1.9.0", builds).await;
    let mut config = h.config();
    config.platform_filter = PlatformFilter::parse(["Darwin/ARM64"]).unwrap();
    let id = h.install(config).await;

    let report = h.sync(id).await.unwrap();
    assert_eq!(report.platforms_synced, 1);
    let detail = h.query.get_version(PRODUCT, "1.9.0").await.unwrap();
    assert_eq!(detail.platforms.len(), 1);
    assert_eq!(detail.platforms[0].filename, zip_name("1.9.0", "darwin", "arm64"));
}

#[tokio::test]
async fn test_disabled_config_is_a_no_op() {
    let mut h = Harness::new().await;
    h.upstream.index(&[("1.9.0", BOTH)]).await;
    let mut config = h.config();
    config.enabled = false;
    let id = h.install(config).await;

    let report = h.sync(id).await.unwrap();
    assert!(report.skipped_disabled);
    let history = h.store.call(move |db| db.list_history(id, 10)).await.unwrap();
    assert!(history.is_empty());
}

#[tokio::test]
async fn test_unreachable_index_fails_the_run() {
    let mut h = Harness::new().await;
    h.upstream
        .serve(&format!("/{PRODUCT}/index.json"), 503, b"unavailable")
        .await;
    let id = h.install(h.config()).await;

    let err = h.sync(id).await.unwrap_err();
    assert!(matches!(err, SyncError::Index(_)));

    let config = h.config_row(id).await;
    assert_eq!(config.last_sync_status, Some(RunStatus::Failed));
    assert!(config.last_sync_error.unwrap().contains("release index unavailable"));
    let history = h.store.call(move |db| db.list_history(id, 1)).await.unwrap();
    assert_eq!(history[0].status, RunStatus::Failed);
}

#[tokio::test]
async fn test_unknown_config() {
    let h = Harness::new().await;
    assert!(matches!(
        h.sync(Uuid::new_v4()).await,
        Err(SyncError::UnknownConfig(_))
    ));
}

#[tokio::test]
async fn test_cancelled_run_leaves_nothing_synced() {
    let mut h = Harness::new().await;
    h.upstream.index(&[("1.9.0", BOTH)]).await;
    h.upstream.release("1.9.0", BOTH).await;
    let id = h.install(h.config()).await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = h
        .orchestrator
        .run_sync(id, TriggeredBy::Manual, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Cancelled));
    assert!(h.query.list_versions(PRODUCT).await.unwrap().is_empty());
}

/// A backend whose writes panic, to exercise the scheduler's task boundary.
#[derive(Debug)]
struct PanickingStore;

#[async_trait]
impl ArtifactStore for PanickingStore {
    fn backend_name(&self) -> &'static str {
        "panicking"
    }

    async fn upload(
        &self,
        _path: &str,
        _reader: &mut (dyn AsyncRead + Send + Unpin),
        _size: u64,
    ) -> Result<UploadResult, StorageError> {
        panic!("storage exploded");
    }

    async fn download(&self, path: &str) -> Result<ObjectReader, StorageError> {
        Err(StorageError::NotFound(path.to_string()))
    }

    async fn delete(&self, _path: &str) -> Result<(), StorageError> {
        Ok(())
    }

    async fn exists(&self, _path: &str) -> Result<bool, StorageError> {
        Ok(false)
    }

    async fn get_metadata(&self, path: &str) -> Result<FileMetadata, StorageError> {
        Err(StorageError::NotFound(path.to_string()))
    }

    async fn get_url(&self, path: &str, _ttl: Duration) -> Result<String, StorageError> {
        Err(StorageError::NotFound(path.to_string()))
    }
}

#[tokio::test]
async fn test_scheduler_records_panicked_run() {
    let dir = tempfile::tempdir().unwrap();
    let mut h = Harness::with_storage(dir, Arc::new(PanickingStore)).await;
    let linux: &[(&str, &str)] = &[("linux", "amd64")];
    h.upstream.index(&[("1.9.0", linux)]).await;
    h.upstream.release("1.9.0", linux).await;
    let id = h.install(h.config()).await;

    let (scheduler, handle) = Scheduler::new(
        h.orchestrator.clone(),
        SchedulerOptions {
            tick: Duration::from_secs(3600),
            trigger_capacity: 4,
        },
    );
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(scheduler.run(shutdown.clone()));
    handle.trigger(id).unwrap();

    let mut status = None;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let config = h.config_row(id).await;
        if config.last_sync_status == Some(RunStatus::Failed) {
            status = config.last_sync_error;
            break;
        }
    }
    shutdown.cancel();
    task.await.unwrap();

    let error = status.expect("panicked run should be recorded");
    assert!(error.contains("sync panicked: storage exploded"));
    let history = h.store.call(move |db| db.list_history(id, 5)).await.unwrap();
    assert!(history.iter().all(|r| r.status != RunStatus::Running));
    assert!(h.dir.path().exists());
}

#[tokio::test]
async fn test_state_survives_reopen() {
    let mut h = Harness::new().await;
    let linux: &[(&str, &str)] = &[("linux", "amd64")];
    h.upstream.index(&[("1.9.0", linux)]).await;
    h.upstream.release("1.9.0", linux).await;
    let id = h.install(h.config()).await;
    h.sync(id).await.unwrap();
    h.store.shutdown();

    let db = StateDb::open_at(&h.dir.path().join("state.db")).unwrap();
    let version = db.get_version(id, "1.9.0").unwrap().unwrap();
    assert_eq!(version.sync_status, SyncStatus::Synced);
    assert!(version.is_latest);
}
