//! HTTP read API.
//!
//! | route | cache |
//! |-------|-------|
//! | `GET /terraform/binaries/{mirror}/versions` | 300 s |
//! | `GET /terraform/binaries/{mirror}/versions/latest` | 60 s |
//! | `GET /terraform/binaries/{mirror}/versions/{version}` | 300 s |
//! | `GET /terraform/binaries/{mirror}/versions/{version}/{os}/{arch}` | none |
//! | `GET /files/{*key}` (signed local links) | none |
//! | `GET /metrics`, `GET /health` | none |
//!
//! [`admin_router`] adds unauthenticated operator routes and is only mounted
//! when `server.admin_api` is enabled:
//! `GET /admin/mirrors`, `GET /admin/mirrors/{mirror}`,
//! `POST /admin/mirrors/{mirror}/sync`.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;

use tfmirror_core::query::VersionSummary;
use tfmirror_core::{
    ArtifactStore, DownloadInfo, MirrorMetrics, MirrorQueryService, QueryError, SchedulerHandle,
    StorageBackend, StoreHandle, TriggerError,
};

use crate::error::ApiError;
use crate::status::{MirrorStatus, all_mirror_status, mirror_status};

const LIST_MAX_AGE: u32 = 300;
const LATEST_MAX_AGE: u32 = 60;
const VERSION_MAX_AGE: u32 = 300;

/// Shared handler state.
#[derive(Debug, Clone)]
pub struct AppState {
    pub query: MirrorQueryService,
    pub storage: Arc<StorageBackend>,
    pub store: StoreHandle,
    pub metrics: Arc<MirrorMetrics>,
    /// Present while a scheduler is running in this process.
    pub trigger: Option<SchedulerHandle>,
}

impl AppState {
    pub fn new(store: StoreHandle, storage: Arc<StorageBackend>, metrics: Arc<MirrorMetrics>) -> Self {
        let artifacts: Arc<dyn ArtifactStore> = storage.clone();
        Self {
            query: MirrorQueryService::new(store.clone(), artifacts, Arc::clone(&metrics)),
            storage,
            store,
            metrics,
            trigger: None,
        }
    }

    pub fn with_trigger(mut self, trigger: SchedulerHandle) -> Self {
        self.trigger = Some(trigger);
        self
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/terraform/binaries/{mirror}/versions", get(list_versions))
        .route("/terraform/binaries/{mirror}/versions/latest", get(latest_version))
        .route("/terraform/binaries/{mirror}/versions/{version}", get(get_version))
        .route(
            "/terraform/binaries/{mirror}/versions/{version}/{os}/{arch}",
            get(download),
        )
        .route("/files/{*key}", get(serve_file))
        .route("/metrics", get(metrics))
        .route("/health", get(health))
        .with_state(state)
}

pub fn admin_router(state: AppState) -> Router {
    Router::new()
        .route("/admin/mirrors", get(admin_list))
        .route("/admin/mirrors/{mirror}", get(admin_status))
        .route("/admin/mirrors/{mirror}/sync", post(admin_trigger))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct VersionList {
    versions: Vec<VersionSummary>,
    total_count: usize,
}

fn cached(max_age: u32, body: impl IntoResponse) -> Response {
    (
        [(header::CACHE_CONTROL, format!("public, max-age={max_age}"))],
        body,
    )
        .into_response()
}

async fn list_versions(
    State(state): State<AppState>,
    Path(mirror): Path<String>,
) -> Result<Response, ApiError> {
    let versions = state.query.list_versions(&mirror).await?;
    let total_count = versions.len();
    Ok(cached(
        LIST_MAX_AGE,
        Json(VersionList {
            versions,
            total_count,
        }),
    ))
}

async fn latest_version(
    State(state): State<AppState>,
    Path(mirror): Path<String>,
) -> Result<Response, ApiError> {
    let detail = state.query.get_latest(&mirror).await?;
    Ok(cached(LATEST_MAX_AGE, Json(detail)))
}

async fn get_version(
    State(state): State<AppState>,
    Path((mirror, version)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let detail = state.query.get_version(&mirror, &version).await?;
    Ok(cached(VERSION_MAX_AGE, Json(detail)))
}

async fn download(
    State(state): State<AppState>,
    Path((mirror, version, os, arch)): Path<(String, String, String, String)>,
) -> Result<Json<DownloadInfo>, ApiError> {
    let info = state
        .query
        .resolve_download(&mirror, &version, &os, &arch)
        .await?;
    tracing::info!(
        mirror = %mirror,
        version = %info.version,
        os = %info.os,
        arch = %info.arch,
        "issued download url"
    );
    Ok(Json(info))
}

#[derive(Debug, Deserialize)]
struct SignedLink {
    expires: i64,
    signature: String,
}

async fn serve_file(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(link): Query<SignedLink>,
) -> Result<Response, ApiError> {
    let Some(local) = state.storage.as_local() else {
        return Err(ApiError::NotFound("file".into()));
    };
    if !local.verify_signed(&key, link.expires, &link.signature, Utc::now()) {
        tracing::debug!(key = %key, "rejected signed link");
        return Err(ApiError::Forbidden);
    }

    let reader = state.storage.download(&key).await?;
    let filename = key.rsplit('/').next().unwrap_or(key.as_str());
    let disposition = format!("attachment; filename=\"{filename}\"");
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        [(header::CONTENT_DISPOSITION, disposition)],
        Body::from_stream(ReaderStream::new(reader)),
    )
        .into_response())
}

async fn metrics(State(state): State<AppState>) -> Result<Response, ApiError> {
    let text = state
        .metrics
        .encode_text()
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        text,
    )
        .into_response())
}

async fn health(State(state): State<AppState>) -> Response {
    match state.store.call(|db| db.list_configs()).await {
        Ok(configs) => Json(serde_json::json!({
            "status": "ok",
            "mirrors": configs.len(),
        }))
        .into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({ "status": "unavailable" })),
            )
                .into_response()
        }
    }
}

const ADMIN_HISTORY: u32 = 10;

async fn admin_list(State(state): State<AppState>) -> Result<Json<Vec<MirrorStatus>>, ApiError> {
    let all = all_mirror_status(&state.store, ADMIN_HISTORY)
        .await
        .map_err(QueryError::from)?;
    Ok(Json(all))
}

async fn admin_status(
    State(state): State<AppState>,
    Path(mirror): Path<String>,
) -> Result<Json<MirrorStatus>, ApiError> {
    mirror_status(&state.store, &mirror, ADMIN_HISTORY)
        .await
        .map_err(QueryError::from)?
        .map(Json)
        .ok_or(ApiError::Query(QueryError::MirrorNotFound(mirror)))
}

async fn admin_trigger(
    State(state): State<AppState>,
    Path(mirror): Path<String>,
) -> Result<Response, ApiError> {
    let name = mirror.clone();
    let config = state
        .store
        .call(move |db| db.get_config_by_name(&name))
        .await
        .map_err(QueryError::from)?
        .ok_or_else(|| QueryError::MirrorNotFound(mirror.clone()))?;

    let Some(trigger) = &state.trigger else {
        return Err(ApiError::Unavailable(TriggerError::Stopped.to_string()));
    };
    trigger
        .trigger(config.id)
        .map_err(|e| ApiError::Unavailable(e.to_string()))?;
    tracing::info!(mirror = %config.name, "manual sync queued");
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "message": "sync queued",
            "mirror": config.name,
            "id": config.id,
        })),
    )
        .into_response())
}
