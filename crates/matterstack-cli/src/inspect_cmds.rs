//! Read-only inspection commands: status, explain, monitor, and
//! evidence export.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};

use matterstack_core::config::wiring::format_wiring_explain_line;
use matterstack_core::config::RunConfig;
use matterstack_core::evidence::export_evidence;
use matterstack_db::models::TaskStatus;

use crate::run_cmds::require_run;

pub async fn cmd_status(workspaces_root: &Path, run_id: &str) -> Result<()> {
    let handle = require_run(workspaces_root, run_id)?;
    let store = handle.open_store().await?;

    let run = store
        .get_run(run_id)
        .await?
        .with_context(|| format!("run {run_id} has no status row"))?;

    println!("Run: {} ({})", run.run_id, run.workspace_slug);
    println!("Status: {}", run.status);
    if let Some(reason) = &run.status_reason {
        println!("Reason: {reason}");
    }
    println!("Updated: {}", run.updated_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!();

    let tasks = store.get_tasks(run_id).await?;
    let statuses = store.get_task_statuses(run_id).await?;

    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for status in statuses.values() {
        *counts.entry(status.to_string()).or_default() += 1;
    }
    let summary: Vec<String> = counts
        .iter()
        .map(|(status, count)| format!("{status}={count}"))
        .collect();
    println!("Progress: {} tasks ({})", tasks.len(), summary.join(" "));
    println!();

    println!("Tasks:");
    for task in &tasks {
        let status = statuses
            .get(&task.task_id)
            .copied()
            .unwrap_or(TaskStatus::Pending);
        let status_icon = match status {
            TaskStatus::Pending => ".",
            TaskStatus::Running => "*",
            TaskStatus::WaitingExternal => "~",
            TaskStatus::Completed => "+",
            TaskStatus::Failed => "!",
            TaskStatus::Cancelled => "x",
            TaskStatus::Skipped => "-",
        };
        let attempt_count = store.list_attempts(&task.task_id).await?.len();
        println!(
            "  [{status_icon}] {} ({status}, {attempt_count} attempt(s))",
            task.task_id
        );
    }

    Ok(())
}

pub async fn cmd_explain(workspaces_root: &Path, run_id: &str) -> Result<()> {
    let handle = require_run(workspaces_root, run_id)?;
    let store = handle.open_store().await?;

    let run = store
        .get_run(run_id)
        .await?
        .with_context(|| format!("run {run_id} has no status row"))?;

    println!("Run: {}", run.run_id);
    println!("Workspace: {}", run.workspace_slug);
    println!("Root: {}", handle.root_path.display());
    println!("Status: {}", run.status);
    println!("Created: {}", run.created_at.format("%Y-%m-%d %H:%M:%S UTC"));

    let config = RunConfig::load(&handle.root_path);
    println!(
        "Execution: mode={:?}, max_hpc_jobs_per_run={}",
        config.execution_mode, config.max_hpc_jobs_per_run
    );

    println!("{}", format_wiring_explain_line(&handle.root_path));

    let active = store.get_active_attempts(run_id).await?;
    println!("Active attempts: {}", active.len());
    for attempt in &active {
        println!(
            "  {} (task {}, {}, operator {})",
            attempt.attempt_id,
            attempt.task_id,
            attempt.status,
            attempt
                .operator_key
                .as_deref()
                .or(attempt.operator_type.as_deref())
                .unwrap_or("none"),
        );
    }

    Ok(())
}

pub async fn cmd_monitor(workspaces_root: &Path, run_id: &str) -> Result<()> {
    let handle = require_run(workspaces_root, run_id)?;
    let store = handle.open_store().await?;

    loop {
        let status = store
            .get_run_status(run_id)
            .await?
            .with_context(|| format!("run {run_id} has no status row"))?;

        let statuses = store.get_task_statuses(run_id).await?;
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for task_status in statuses.values() {
            *counts.entry(task_status.to_string()).or_default() += 1;
        }
        let summary: Vec<String> = counts
            .iter()
            .map(|(s, count)| format!("{s}={count}"))
            .collect();

        println!(
            "[{}] {run_id}: {status} ({})",
            chrono::Utc::now().format("%H:%M:%S"),
            summary.join(" ")
        );

        if status.is_terminal() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
    }
}

pub async fn cmd_export_evidence(workspaces_root: &Path, run_id: &str) -> Result<()> {
    let handle = require_run(workspaces_root, run_id)?;
    let store = handle.open_store().await?;

    let bundle_path = export_evidence(&handle, &store).await?;
    println!("Evidence exported:");
    println!("  {}", bundle_path.display());
    println!("  {}", handle.evidence_dir().join("report.md").display());
    Ok(())
}
