//! Task-level commands: rerun, attempt history, attempt cancellation,
//! and orphan cleanup.

use std::collections::{HashSet, VecDeque};
use std::io::Write;
use std::path::Path;

use anyhow::{bail, Context, Result};

use matterstack_core::engine::{format_timeout, parse_timeout};
use matterstack_db::models::TaskStatus;
use matterstack_db::store::AttemptUpdate;
use matterstack_db::workflow::Task;
use matterstack_db::{StateStore, StoreError};

use crate::run_cmds::require_run;

fn confirm_or_bail(force: bool, prompt: &str) -> Result<()> {
    if force {
        return Ok(());
    }
    print!("{prompt} [y/N] ");
    std::io::stdout().flush().ok();

    let mut answer = String::new();
    std::io::stdin()
        .read_line(&mut answer)
        .context("failed to read confirmation")?;
    if !answer.trim().eq_ignore_ascii_case("y") {
        bail!("aborted");
    }
    Ok(())
}

/// Transitive dependents of a task within a run (for `rerun --recursive`).
fn collect_dependents(tasks: &[Task], root: &str) -> HashSet<String> {
    let mut dependents = HashSet::new();
    let mut queue = VecDeque::from([root.to_string()]);

    while let Some(current) = queue.pop_front() {
        for task in tasks {
            if task.dependencies.contains(&current) && dependents.insert(task.task_id.clone()) {
                queue.push_back(task.task_id.clone());
            }
        }
    }
    dependents
}

pub async fn cmd_rerun(
    workspaces_root: &Path,
    run_id: &str,
    task_id: &str,
    recursive: bool,
    force: bool,
) -> Result<()> {
    let handle = require_run(workspaces_root, run_id)?;
    let store = handle.open_store().await?;

    let tasks = store.get_tasks(run_id).await?;
    if !tasks.iter().any(|t| t.task_id == task_id) {
        bail!("task {task_id} not found in run {run_id}");
    }

    let mut targets: HashSet<String> = HashSet::from([task_id.to_string()]);
    if recursive {
        targets.extend(collect_dependents(&tasks, task_id));
    }

    let mut sorted: Vec<&str> = targets.iter().map(String::as_str).collect();
    sorted.sort_unstable();

    if !force {
        println!("About to RERUN (reset to PENDING) these tasks in run {run_id}:");
        for target in &sorted {
            println!("  - {target}");
        }
        confirm_or_bail(false, "\nProceed?")?;
    }

    let _lock = StateStore::lock(&handle.root_path)?;

    for target in &sorted {
        // An active attempt must be cancelled first; that needs --force.
        if let Some(attempt) = store.get_current_attempt(target).await? {
            if attempt.status.is_active() {
                if !force {
                    bail!(
                        "task {target} has an active attempt {} in status {}; \
                         use --force to cancel and rerun",
                        attempt.attempt_id,
                        attempt.status
                    );
                }
                store
                    .update_attempt(
                        &attempt.attempt_id,
                        AttemptUpdate {
                            status: Some(matterstack_db::models::AttemptStatus::Cancelled),
                            status_reason: Some(
                                "User forced rerun via CLI (backend cancellation skipped)"
                                    .to_string(),
                            ),
                            ..Default::default()
                        },
                    )
                    .await?;
            }
        }

        // Legacy zombie prevention, then reset for the next tick.
        store.cancel_external_runs(target).await?;
        store.update_task_status(target, TaskStatus::Pending).await?;
    }

    println!(
        "Rerun queued for {} task(s). Next step/loop will create new attempt(s).",
        sorted.len()
    );
    Ok(())
}

pub async fn cmd_attempts(workspaces_root: &Path, run_id: &str, task_id: &str) -> Result<()> {
    let handle = require_run(workspaces_root, run_id)?;
    let store = handle.open_store().await?;

    let tasks = store.get_tasks(run_id).await?;
    if !tasks.iter().any(|t| t.task_id == task_id) {
        bail!("task {task_id} not found in run {run_id}");
    }

    let attempts = store.list_attempts(task_id).await?;

    // Stable 7-column TSV; columns are part of the CLI contract.
    println!(
        "attempt_id\tattempt_index\tstatus\toperator_type\texternal_id\tartifact_path\tconfig_hash"
    );
    for attempt in &attempts {
        let config_hash = attempt
            .operator_data
            .0
            .config_hash
            .as_deref()
            .unwrap_or("");
        println!(
            "{}\t{}\t{}\t{}\t{}\t{}\t{}",
            attempt.attempt_id,
            attempt.attempt_index,
            attempt.status,
            attempt.operator_type.as_deref().unwrap_or(""),
            attempt.external_id.as_deref().unwrap_or(""),
            attempt.relative_path.as_deref().unwrap_or(""),
            config_hash,
        );
    }
    Ok(())
}

pub async fn cmd_cancel_attempt(
    workspaces_root: &Path,
    run_id: &str,
    attempt_id: &str,
    force: bool,
) -> Result<()> {
    let handle = require_run(workspaces_root, run_id)?;
    let store = handle.open_store().await?;

    let attempt = store
        .get_attempt(attempt_id)
        .await?
        .with_context(|| format!("attempt {attempt_id} not found"))?;

    if attempt.run_id != run_id {
        bail!(
            "attempt {attempt_id} belongs to run {}, not {run_id}",
            attempt.run_id
        );
    }

    if !force {
        println!(
            "About to CANCEL attempt {attempt_id} (task {}) in run {run_id}.",
            attempt.task_id
        );
        confirm_or_bail(false, "Proceed?")?;
    }

    let _lock = StateStore::lock(&handle.root_path)?;

    // DB-side cancellation only; backend cancellation is best-effort and
    // not available from this local-only path.
    match store
        .update_attempt(
            attempt_id,
            AttemptUpdate {
                status: Some(matterstack_db::models::AttemptStatus::Cancelled),
                status_reason: Some(
                    "User cancelled attempt via CLI (backend cancellation skipped)".to_string(),
                ),
                ..Default::default()
            },
        )
        .await
    {
        Ok(()) => {}
        Err(StoreError::TerminalAttempt { status, .. }) => {
            bail!("attempt {attempt_id} is already terminal ({status})");
        }
        Err(e) => return Err(e.into()),
    }

    store
        .update_task_status(&attempt.task_id, TaskStatus::Cancelled)
        .await?;
    store.cancel_external_runs(&attempt.task_id).await?;

    println!("Attempt {attempt_id} cancelled.");
    Ok(())
}

fn format_age(created_at: chrono::DateTime<chrono::Utc>) -> String {
    let delta = chrono::Utc::now().signed_duration_since(created_at);
    let total_minutes = delta.num_minutes().max(0);
    let (hours, minutes) = (total_minutes / 60, total_minutes % 60);
    if hours > 0 {
        format!("{hours}h {minutes}m")
    } else {
        format!("{minutes}m")
    }
}

pub async fn cmd_cleanup_orphans(
    workspaces_root: &Path,
    run_id: &str,
    confirm: bool,
    timeout: &str,
) -> Result<()> {
    let timeout_duration = parse_timeout(timeout)
        .map_err(|e| anyhow::anyhow!("{e}\nValid formats: 1h, 30m, 3600s, 3600"))?;

    let handle = require_run(workspaces_root, run_id)?;
    let store = handle.open_store().await?;

    let orphans = store
        .find_orphaned_attempts(run_id, timeout_duration)
        .await?;

    if orphans.is_empty() {
        println!("No orphaned attempts found in run {run_id}.");
        return Ok(());
    }

    println!("Found {} orphaned attempt(s):", orphans.len());
    for orphan in &orphans {
        println!("  - {} (task: {})", orphan.attempt_id, orphan.task_id);
        println!("      Created: {} UTC", orphan.created_at);
        println!("      Age: {}", format_age(orphan.created_at));
        println!("      Reason: No external_id, CREATED > {timeout}");
    }

    if !confirm {
        println!("\nRun with --confirm to mark these as FAILED_INIT.");
        return Ok(());
    }

    let _lock = StateStore::lock(&handle.root_path)?;

    let attempt_ids: Vec<String> = orphans.iter().map(|o| o.attempt_id.clone()).collect();
    let reason = format!("Stuck in CREATED > {}", format_timeout(timeout_duration));
    let count = store
        .mark_attempts_failed_init(&attempt_ids, &reason)
        .await?;

    // Keep the affected tasks consistent with their now-terminal attempts.
    for orphan in &orphans {
        store
            .update_task_status(&orphan.task_id, TaskStatus::Failed)
            .await?;
    }

    println!("\nMarked {count} attempt(s) as FAILED_INIT.");
    Ok(())
}
