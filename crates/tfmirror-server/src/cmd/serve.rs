//! `tfmirror serve`

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use tfmirror_core::{ArtifactStore, Scheduler};

use crate::api::{self, AppState};
use crate::config::Config;
use crate::context::Engine;

pub async fn serve(config: &Config) -> Result<()> {
    let engine = Engine::open(config).await?;
    let shutdown = CancellationToken::new();

    let (scheduler, trigger) =
        Scheduler::new(engine.orchestrator.clone(), config.sync.scheduler_options());
    let scheduler_task = tokio::spawn(scheduler.run(shutdown.clone()));

    let state = AppState::new(
        engine.store.clone(),
        engine.storage.clone(),
        engine.metrics.clone(),
    )
    .with_trigger(trigger);
    let mut app = api::router(state.clone());
    if config.server.admin_api {
        tracing::warn!("admin API enabled without authentication; keep it on a trusted network");
        app = app.merge(api::admin_router(state));
    }

    let listener = TcpListener::bind(config.server.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind))?;
    tracing::info!(
        addr = %config.server.bind,
        storage = engine.storage.backend_name(),
        version = env!("CARGO_PKG_VERSION"),
        "tfmirror listening"
    );

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                () = super::shutdown_signal() => {}
                () = signal.cancelled() => {}
            }
        })
        .await
        .context("HTTP server failed")?;

    shutdown.cancel();
    if let Err(e) = scheduler_task.await {
        tracing::error!(error = %e, "scheduler task failed");
    }
    engine.store.shutdown();
    tracing::info!("tfmirror stopped");
    Ok(())
}
