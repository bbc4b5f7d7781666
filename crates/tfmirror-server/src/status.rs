//! Mirror status snapshots for `tfmirror status` and the admin API.

use serde::Serialize;

use tfmirror_core::StoreHandle;
use tfmirror_core::store::{DbError, StatusCounts};
use tfmirror_schema::{MirrorConfig, SyncHistory};

/// Config summary, version counts and recent runs of one mirror.
#[derive(Debug, Clone, Serialize)]
pub struct MirrorStatus {
    pub config: MirrorConfig,
    pub versions: StatusCounts,
    pub latest: Option<String>,
    pub recent_runs: Vec<SyncHistory>,
}

/// Snapshot one mirror by name. `None` when no such mirror exists.
pub async fn mirror_status(
    store: &StoreHandle,
    name: &str,
    history: u32,
) -> Result<Option<MirrorStatus>, DbError> {
    let name = name.to_string();
    store
        .call(move |db| {
            let Some(config) = db.get_config_by_name(&name)? else {
                return Ok(None);
            };
            let versions = db.version_counts(config.id)?;
            let latest = db.latest_version(config.id)?.map(|v| v.version);
            let recent_runs = db.list_history(config.id, history)?;
            Ok(Some(MirrorStatus {
                config,
                versions,
                latest,
                recent_runs,
            }))
        })
        .await
}

/// Snapshot every mirror, ordered by name.
pub async fn all_mirror_status(store: &StoreHandle, history: u32) -> Result<Vec<MirrorStatus>, DbError> {
    store
        .call(move |db| {
            let mut out = Vec::new();
            for config in db.list_configs()? {
                let versions = db.version_counts(config.id)?;
                let latest = db.latest_version(config.id)?.map(|v| v.version);
                let recent_runs = db.list_history(config.id, history)?;
                out.push(MirrorStatus {
                    config,
                    versions,
                    latest,
                    recent_runs,
                });
            }
            out.sort_by(|a, b| a.config.name.cmp(&b.config.name));
            Ok(out)
        })
        .await
}
