//! The step loop: advance one run by exactly one tick.
//!
//! Phase order: gate on run status, poll active attempts (healing task
//! statuses from attempt statuses), poll legacy external runs, find ready
//! tasks, enforce concurrency caps, dispatch, and -- when the workflow
//! has fully settled -- run the campaign's analyze/replan cycle.
//!
//! The tick holds the run's file lock for its whole duration and is safe
//! to re-run after a crash: polling re-reads every active attempt and
//! operators tolerate previously-submitted work.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use matterstack_db::models::{
    task_status_from_attempt, AttemptStatus, RunStatus, TaskAttempt, TaskStatus,
};
use matterstack_db::store::AttemptUpdate;
use matterstack_db::{StateStore, StoreError};

use crate::campaign::Campaign;
use crate::config::RunConfig;
use crate::engine::analyze::execute_analyze_phase;
use crate::engine::dispatch::{
    determine_route, submit_external_task_stub, submit_local_simulation, submit_task_to_operator,
    OperatorRoute,
};
use crate::engine::format_timeout;
use crate::error::EngineError;
use crate::hooks::{AttemptContext, LifecycleHook};
use crate::operator::keys::resolve_operator_key_for_attempt;
use crate::operator::registry::OperatorRegistry;
use crate::operator::{AttemptHandle, Operator};
use crate::run::RunHandle;

/// Tunables for one tick.
#[derive(Debug, Clone)]
pub struct StepOptions {
    /// Age after which a CREATED attempt with no external id is declared
    /// an orphan and moved to FAILED_INIT.
    pub stuck_timeout: Duration,
}

impl Default for StepOptions {
    fn default() -> Self {
        Self {
            stuck_timeout: Duration::from_secs(3600),
        }
    }
}

fn attempt_context(run_id: &str, attempt: &TaskAttempt) -> AttemptContext {
    AttemptContext {
        run_id: run_id.to_string(),
        task_id: attempt.task_id.clone(),
        attempt_id: attempt.attempt_id.clone(),
        operator_key: resolve_operator_key_for_attempt(attempt).map(|r| r.operator_key),
        attempt_index: attempt.attempt_index,
    }
}

/// Find the operator responsible for an attempt: the canonical key first,
/// then the raw legacy type. Stub attempts resolve to nothing.
fn operator_for_attempt(
    registry: &OperatorRegistry,
    attempt: &TaskAttempt,
) -> Option<Arc<dyn Operator>> {
    if let Some(resolved) = resolve_operator_key_for_attempt(attempt) {
        if let Some(operator) = registry.get(&resolved.operator_key) {
            return Some(Arc::clone(operator));
        }
    }
    match attempt.operator_type.as_deref() {
        Some("stub") | Some("") | None => None,
        Some(operator_type) => registry
            .resolve_for_dispatch(operator_type)
            .map(|(_, op)| op),
    }
}

/// Poll one active attempt: orphan detection, operator poll, collect on
/// terminal, persist, heal the task status, fire hooks. Poll failures
/// are logged and left for the next tick.
async fn poll_attempt(
    run: &RunHandle,
    store: &StateStore,
    registry: &OperatorRegistry,
    hooks: &dyn LifecycleHook,
    options: &StepOptions,
    attempt: &TaskAttempt,
) -> Result<(), StoreError> {
    // Orphan path: created long ago, never submitted.
    if attempt.status == AttemptStatus::Created && attempt.external_id.is_none() {
        let age = Utc::now().signed_duration_since(attempt.created_at);
        if age.num_seconds() >= 0 && age.num_seconds() as u64 > options.stuck_timeout.as_secs() {
            let reason = format!(
                "Stuck in CREATED > {}",
                format_timeout(options.stuck_timeout)
            );
            tracing::warn!(
                attempt_id = %attempt.attempt_id,
                task_id = %attempt.task_id,
                %reason,
                "failing orphaned attempt"
            );
            store
                .update_attempt(
                    &attempt.attempt_id,
                    AttemptUpdate {
                        status: Some(AttemptStatus::FailedInit),
                        status_reason: Some(reason.clone()),
                        ..Default::default()
                    },
                )
                .await?;
            store
                .update_task_status(&attempt.task_id, TaskStatus::Failed)
                .await?;
            hooks.on_fail(&attempt_context(&run.run_id, attempt), &reason);
            return Ok(());
        }
    }

    let Some(operator) = operator_for_attempt(registry, attempt) else {
        // Stub or unroutable attempt: no polling, but keep the task
        // status consistent with the attempt.
        store
            .update_task_status(&attempt.task_id, task_status_from_attempt(attempt.status))
            .await?;
        return Ok(());
    };

    let handle = AttemptHandle::from_attempt(attempt);
    let old_status = handle.status;

    let mut updated = match operator.poll(run, handle).await {
        Ok(updated) => updated,
        Err(e) => {
            tracing::error!(
                attempt_id = %attempt.attempt_id,
                task_id = %attempt.task_id,
                error = %format!("{e:#}"),
                "poll failed; will retry next tick"
            );
            return Ok(());
        }
    };

    if updated.status != old_status {
        tracing::info!(
            attempt_id = %attempt.attempt_id,
            task_id = %attempt.task_id,
            from = %old_status,
            to = %updated.status,
            "attempt transitioned"
        );
    }

    // Collect results on terminal outcomes; logs matter on failure too.
    if matches!(
        updated.status,
        AttemptStatus::Completed | AttemptStatus::Failed
    ) {
        match operator.collect(run, &updated).await {
            Ok(output) => {
                if !output.files.is_empty() {
                    let files = output
                        .files
                        .iter()
                        .map(|(name, path)| (name.clone(), path.display().to_string()))
                        .collect();
                    updated.operator_data.output_files = Some(files);
                }
                if !output.data.is_empty() {
                    updated.operator_data.output_data = Some(output.data);
                }
            }
            Err(e) => {
                tracing::error!(
                    attempt_id = %attempt.attempt_id,
                    task_id = %attempt.task_id,
                    error = %format!("{e:#}"),
                    "failed to collect results"
                );
            }
        }
    }

    // Persist the attempt (always, for healing + operator_data updates).
    store
        .update_attempt(
            &attempt.attempt_id,
            AttemptUpdate {
                status: Some(updated.status),
                operator_type: (!updated.operator_type.is_empty())
                    .then(|| updated.operator_type.clone()),
                external_id: updated.external_id.clone(),
                operator_data: Some(updated.operator_data.clone()),
                relative_path: updated
                    .relative_path
                    .as_ref()
                    .map(|p| p.display().to_string()),
                ..Default::default()
            },
        )
        .await?;

    // Heal the task status from the attempt status.
    store
        .update_task_status(&attempt.task_id, task_status_from_attempt(updated.status))
        .await?;

    if old_status.is_active() {
        match updated.status {
            AttemptStatus::Completed => {
                hooks.on_complete(&attempt_context(&run.run_id, attempt), true);
            }
            AttemptStatus::Failed => {
                let reason = updated
                    .operator_data
                    .reason
                    .clone()
                    .unwrap_or_else(|| "attempt failed".to_string());
                hooks.on_fail(&attempt_context(&run.run_id, attempt), &reason);
            }
            _ => {}
        }
    }

    Ok(())
}

/// Execute one tick of the run lifecycle. Returns the run's status after
/// the tick.
pub async fn step_run(
    run: &RunHandle,
    campaign: &dyn Campaign,
    registry: &OperatorRegistry,
    hooks: &dyn LifecycleHook,
    options: &StepOptions,
) -> Result<RunStatus, EngineError> {
    let store = run.open_store().await?;
    let _lock = StateStore::lock(&run.root_path)?;

    // Phase 1: gate on run status.
    let mut run_status =
        store
            .get_run_status(&run.run_id)
            .await?
            .ok_or_else(|| EngineError::NotFound {
                what: "run",
                id: run.run_id.clone(),
            })?;

    if run_status == RunStatus::Pending {
        tracing::info!(run_id = %run.run_id, "run started");
        store
            .set_run_status(&run.run_id, RunStatus::Running, None)
            .await?;
        run_status = RunStatus::Running;
    }

    if run_status.is_terminal() {
        tracing::info!(run_id = %run.run_id, status = %run_status, "run is terminal, skipping");
        return Ok(run_status);
    }

    if run_status == RunStatus::Paused {
        tracing::info!(run_id = %run.run_id, "run is paused, skipping tick");
        return Ok(RunStatus::Paused);
    }

    // Phase 2: poll active attempts.
    let attempt_task_ids = store.get_attempt_task_ids(&run.run_id).await?;
    let active_attempts = store.get_active_attempts(&run.run_id).await?;
    for attempt in &active_attempts {
        poll_attempt(run, &store, registry, hooks, options, attempt).await?;
    }

    // Phase 3: poll legacy external runs, only for tasks with no
    // attempts. Rows are historical; the task status is healed but the
    // rows themselves are treated as a read-only migration.
    let legacy_runs = store.get_active_external_runs(&run.run_id).await?;
    for legacy in &legacy_runs {
        if attempt_task_ids.contains(&legacy.task_id) {
            continue;
        }
        let operator = legacy
            .operator_type
            .as_deref()
            .and_then(|t| registry.resolve_for_dispatch(t))
            .map(|(_, op)| op);

        let status = match operator {
            Some(operator) => {
                let handle = AttemptHandle {
                    task_id: legacy.task_id.clone(),
                    attempt_id: format!("legacy:{}", legacy.task_id),
                    operator_type: legacy.operator_type.clone().unwrap_or_default(),
                    external_id: legacy.external_id.clone(),
                    status: legacy.status,
                    operator_data: legacy.operator_data.0.clone(),
                    relative_path: legacy.relative_path.clone().map(Into::into),
                };
                match operator.poll(run, handle).await {
                    Ok(updated) => updated.status,
                    Err(e) => {
                        tracing::error!(
                            task_id = %legacy.task_id,
                            error = %format!("{e:#}"),
                            "legacy external run poll failed"
                        );
                        legacy.status
                    }
                }
            }
            None => legacy.status,
        };

        store
            .update_task_status(&legacy.task_id, task_status_from_attempt(status))
            .await?;
    }

    // Phase 4: find ready tasks.
    let tasks = store.get_tasks(&run.run_id).await?;
    let status_map = store.get_task_statuses(&run.run_id).await?;
    let active_attempts = store.get_active_attempts(&run.run_id).await?;
    let active_attempt_tasks: HashSet<&str> = active_attempts
        .iter()
        .map(|a| a.task_id.as_str())
        .collect();

    let mut tasks_to_run = Vec::new();
    let mut has_active_tasks = false;
    let mut has_failed_tasks = false;
    let (mut completed, mut failed, mut active) = (0usize, 0usize, 0usize);

    for task in &tasks {
        let status = status_map
            .get(&task.task_id)
            .copied()
            .unwrap_or(TaskStatus::Pending);

        match status {
            TaskStatus::Completed | TaskStatus::Skipped => completed += 1,
            TaskStatus::Failed | TaskStatus::Cancelled => {
                failed += 1;
                if !task.allow_failure {
                    has_failed_tasks = true;
                }
            }
            TaskStatus::Running | TaskStatus::WaitingExternal => {
                active += 1;
                has_active_tasks = true;
            }
            TaskStatus::Pending => {
                // An active attempt parks the task even while its status
                // still reads PENDING.
                if active_attempt_tasks.contains(task.task_id.as_str()) {
                    active += 1;
                    has_active_tasks = true;
                    continue;
                }

                let mut deps_met = true;
                let mut blocked = false;
                for dep in &task.dependencies {
                    match status_map.get(dep) {
                        // Missing from the run: treated as externally
                        // satisfied (cross-workflow chaining).
                        None => {}
                        Some(TaskStatus::Completed) => {}
                        Some(s) if s.is_terminal() => {
                            if !task.allow_dependency_failure {
                                blocked = true;
                            }
                        }
                        Some(_) => deps_met = false,
                    }
                }

                if blocked {
                    tracing::info!(
                        task_id = %task.task_id,
                        "dependencies terminally failed, skipping task"
                    );
                    store
                        .update_task_status(&task.task_id, TaskStatus::Skipped)
                        .await?;
                    completed += 1;
                } else if deps_met {
                    tasks_to_run.push(task.clone());
                } else {
                    has_active_tasks = true;
                }
            }
        }
    }

    tracing::info!(
        run_id = %run.run_id,
        total = tasks.len(),
        ready = tasks_to_run.len(),
        completed,
        failed,
        active,
        "tick summary"
    );

    // Phase 5: concurrency caps.
    let config = RunConfig::load(&run.root_path);
    let mut active_execution_count = active_attempts
        .iter()
        .filter(|a| a.status.occupies_slot())
        .count();
    for legacy in &legacy_runs {
        if !attempt_task_ids.contains(&legacy.task_id) && legacy.status.occupies_slot() {
            active_execution_count += 1;
        }
    }
    let mut slots = (config.max_hpc_jobs_per_run as usize).saturating_sub(active_execution_count);

    tracing::info!(
        run_id = %run.run_id,
        active = active_execution_count,
        limit = config.max_hpc_jobs_per_run,
        slots,
        "concurrency check"
    );

    // Phase 6: dispatch ready tasks while slots remain.
    for task in &tasks_to_run {
        match determine_route(task, &config) {
            OperatorRoute::Simulation => {
                submit_local_simulation(task, &store).await?;
            }
            OperatorRoute::Stub => {
                if slots == 0 {
                    tracing::info!(
                        task_id = %task.task_id,
                        "concurrency limit reached, postponing task"
                    );
                    continue;
                }
                submit_external_task_stub(run, task, &store).await?;
                has_active_tasks = true;
                slots -= 1;
            }
            OperatorRoute::Operator(requested) => {
                if slots == 0 {
                    tracing::info!(
                        task_id = %task.task_id,
                        "concurrency limit reached, postponing task"
                    );
                    continue;
                }
                slots -= 1;
                if submit_task_to_operator(run, task, &requested, &store, registry, hooks).await? {
                    has_active_tasks = true;
                }
            }
        }
    }

    // Phase 7: analyze-and-replan once everything has settled.
    if !has_active_tasks && tasks_to_run.is_empty() {
        if has_failed_tasks {
            tracing::error!(run_id = %run.run_id, "workflow has failed tasks, stopping");
            store
                .set_run_status(&run.run_id, RunStatus::Failed, Some("Workflow tasks failed"))
                .await?;
            return Ok(RunStatus::Failed);
        }

        // Statuses may have moved during this tick (skip healing); use a
        // fresh map for the results.
        let status_map = store.get_task_statuses(&run.run_id).await?;
        let next_workflow =
            execute_analyze_phase(run, campaign, &tasks, &status_map, &store).await?;

        match next_workflow {
            Some(workflow) => {
                tracing::info!(
                    run_id = %run.run_id,
                    tasks = workflow.len(),
                    "campaign generated new workflow"
                );
                store.add_workflow(&workflow, &run.run_id).await?;
                return Ok(RunStatus::Running);
            }
            None => {
                tracing::info!(run_id = %run.run_id, "campaign has no further work, run completed");
                store
                    .set_run_status(&run.run_id, RunStatus::Completed, None)
                    .await?;
                return Ok(RunStatus::Completed);
            }
        }
    }

    Ok(RunStatus::Running)
}

/// Step a run until it reaches a terminal status.
///
/// Waits 5 s when paused, 1 s on lock contention, and `poll_interval`
/// between ordinary ticks.
pub async fn run_until_completion(
    run: &RunHandle,
    campaign: &dyn Campaign,
    registry: &OperatorRegistry,
    hooks: &dyn LifecycleHook,
    options: &StepOptions,
    poll_interval: Duration,
) -> Result<RunStatus, EngineError> {
    tracing::info!(run_id = %run.run_id, "starting local execution loop");

    loop {
        match step_run(run, campaign, registry, hooks, options).await {
            Ok(status) if status.is_terminal() => {
                tracing::info!(run_id = %run.run_id, %status, "run finished");
                return Ok(status);
            }
            Ok(RunStatus::Paused) => {
                tracing::info!(run_id = %run.run_id, "run is paused, waiting");
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            Ok(_) => {
                tokio::time::sleep(poll_interval).await;
            }
            Err(EngineError::LockBusy { path }) => {
                tracing::warn!(
                    run_id = %run.run_id,
                    lock = %path.display(),
                    "run is locked by another process, retrying"
                );
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            Err(e) => return Err(e),
        }
    }
}
