//! `tfmirror status [<mirror>]`

use anyhow::{Context, Result, bail};

use crate::config::Config;
use crate::context::open_store;
use crate::status::{MirrorStatus, all_mirror_status, mirror_status};

pub async fn status(config: &Config, mirror: Option<&str>, history: u32, json: bool) -> Result<()> {
    let store = open_store(config)?;
    let result = match mirror {
        Some(name) => mirror_status(&store, name, history)
            .await
            .map(|s| s.into_iter().collect::<Vec<_>>()),
        None => all_mirror_status(&store, history).await,
    };
    store.shutdown();
    let statuses = result.context("Failed to read mirror state")?;

    if let Some(name) = mirror {
        if statuses.is_empty() {
            bail!("Mirror '{name}' not found (has `tfmirror serve` or `tfmirror sync` run with it configured?)");
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&statuses)?);
        return Ok(());
    }
    if statuses.is_empty() {
        println!("No mirrors registered.");
        return Ok(());
    }
    for (i, status) in statuses.iter().enumerate() {
        if i > 0 {
            println!();
        }
        render(status);
    }
    Ok(())
}

fn render(status: &MirrorStatus) {
    let label_width = 12;
    let cfg = &status.config;
    let state = if cfg.enabled { "enabled" } else { "disabled" };
    println!("{} ({}, {state})", cfg.name, cfg.product);
    println!("  {:<label_width$} {}", "upstream", cfg.upstream_url);
    println!(
        "  {:<label_width$} {} synced, {} error, {} pending",
        "versions", status.versions.synced, status.versions.error, status.versions.pending
    );
    println!(
        "  {:<label_width$} {}",
        "latest",
        status.latest.as_deref().unwrap_or("-")
    );
    let last = match (&cfg.last_sync_at, &cfg.last_sync_status) {
        (Some(at), Some(s)) => format!("{s} at {}", at.format("%Y-%m-%d %H:%M:%S UTC")),
        _ => "never".to_string(),
    };
    println!("  {:<label_width$} {last}", "last sync");
    if let Some(err) = &cfg.last_sync_error {
        println!("  {:<label_width$} {err}", "last error");
    }

    if status.recent_runs.is_empty() {
        return;
    }
    println!("  recent runs:");
    for run in &status.recent_runs {
        let duration = run.completed_at.map_or_else(
            || "running".to_string(),
            |end| format!("{}s", (end - run.started_at).num_seconds()),
        );
        println!(
            "    {}  {:<9} {:<7} {:>5}  {} versions, {} platforms, {} failed",
            run.started_at.format("%Y-%m-%d %H:%M"),
            run.triggered_by.as_str(),
            run.status.as_str(),
            duration,
            run.versions_synced,
            run.platforms_synced,
            run.versions_failed,
        );
        if let Some(err) = &run.error_message {
            println!("      {err}");
        }
    }
}
