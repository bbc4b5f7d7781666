//! Shared engine wiring for `serve` and `sync`.

use std::fmt;
use std::sync::Arc;

use anyhow::{Context as _, Result};

use tfmirror_core::{
    ArtifactStore, HttpClients, MirrorMetrics, StorageBackend, StoreHandle, SyncOrchestrator,
};
use tfmirror_schema::MirrorConfig;

use crate::config::Config;

/// State store, storage backend, metrics and orchestrator built from one config.
#[derive(Clone)]
pub struct Engine {
    pub store: StoreHandle,
    pub storage: Arc<StorageBackend>,
    pub metrics: Arc<MirrorMetrics>,
    pub orchestrator: SyncOrchestrator,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("storage", &self.storage.backend_name())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Open everything and register the configured mirrors.
    pub async fn open(config: &Config) -> Result<Self> {
        let store = open_store(config)?;
        let storage = Arc::new(
            StorageBackend::from_config(&config.storage)
                .context("Failed to initialise artifact storage")?,
        );
        let metrics = MirrorMetrics::shared().context("Failed to register metrics")?;
        let http = HttpClients::new(&config.sync.http_options())
            .context("Failed to build HTTP clients")?
            .with_github(config.sync.github_options());

        let artifacts: Arc<dyn ArtifactStore> = storage.clone();
        let orchestrator = SyncOrchestrator::new(
            store.clone(),
            artifacts,
            http,
            Arc::clone(&metrics),
            config.sync.sync_options(),
        );

        let engine = Self {
            store,
            storage,
            metrics,
            orchestrator,
        };
        engine.register_mirrors(config).await?;
        Ok(engine)
    }

    /// Upsert every `[[mirrors]]` entry by name. Sync summaries are kept.
    pub async fn register_mirrors(&self, config: &Config) -> Result<Vec<MirrorConfig>> {
        let wanted = config.mirror_configs()?;
        let registered = self
            .store
            .call(move |db| {
                wanted
                    .iter()
                    .map(|cfg| db.upsert_config(cfg))
                    .collect::<Result<Vec<_>, _>>()
            })
            .await
            .context("Failed to register mirrors")?;
        for mirror in &registered {
            tracing::info!(
                mirror = %mirror.name,
                product = %mirror.product,
                enabled = mirror.enabled,
                gpg_verify = mirror.gpg_verify,
                "mirror registered"
            );
        }
        Ok(registered)
    }
}

/// Open the state database without touching storage.
pub fn open_store(config: &Config) -> Result<StoreHandle> {
    StoreHandle::open(&config.database.path).with_context(|| {
        format!(
            "Failed to open state database at {}",
            config.database.path.display()
        )
    })
}
