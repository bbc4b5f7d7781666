//! `tfmirror sync <mirror>`

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use tfmirror_core::SyncReport;
use tfmirror_schema::TriggeredBy;

use crate::config::Config;
use crate::context::Engine;

/// Run one sync in the foreground.
///
/// Platform failures are reported but do not fail the command; only
/// config-level failures do.
pub async fn sync(config: &Config, mirror: &str) -> Result<()> {
    let engine = Engine::open(config).await?;
    let name = mirror.to_string();
    let row = engine
        .store
        .call(move |db| db.get_config_by_name(&name))
        .await?
        .with_context(|| format!("Mirror '{mirror}' is not configured"))?;

    let cancel = CancellationToken::new();
    super::cancel_on_signal(cancel.clone());

    let result = engine
        .orchestrator
        .run_sync(row.id, TriggeredBy::Manual, &cancel)
        .await;
    engine.store.shutdown();

    let report = result.with_context(|| format!("Sync of '{mirror}' failed"))?;
    print_report(&report);
    Ok(())
}

fn print_report(report: &SyncReport) {
    if report.skipped_disabled {
        println!("{}: disabled, nothing to do", report.mirror);
        return;
    }

    println!("{}", report.mirror);
    println!(
        "  versions   {} found, {} retained, {} synced, {} failed",
        report.versions_found, report.versions_retained, report.versions_synced, report.versions_failed
    );
    println!(
        "  platforms  {} stored, {} unchanged, {} failed",
        report.platforms_synced, report.platforms_unchanged, report.platforms_failed
    );
    println!("  latest     {}", report.latest.as_deref().unwrap_or("-"));
    if !report.errors.is_empty() {
        println!("  errors:");
        for error in &report.errors {
            println!("    {error}");
        }
    }
}
