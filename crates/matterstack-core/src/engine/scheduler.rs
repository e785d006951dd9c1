//! Multi-run scheduler: fairly advance every active run in one process.
//!
//! Each sweep discovers active runs on disk, shuffles them (randomized
//! round-robin prevents starvation), and steps each one. Runs locked by
//! another process are skipped silently; other errors are logged and the
//! sweep continues.

use std::path::Path;
use std::time::Duration;

use rand::seq::SliceRandom;

use matterstack_db::models::RunStatus;

use crate::campaign::CampaignRegistry;
use crate::config::wiring::{resolve_operator_wiring, WiringOptions, WiringSource};
use crate::config::operators::load_operators_config;
use crate::engine::step::{step_run, StepOptions};
use crate::error::EngineError;
use crate::hooks::LifecycleHook;
use crate::operator::registry::OperatorRegistry;
use crate::run::{list_active_runs, RunHandle};

/// Resolve a discovered run's wiring and campaign, then step it once.
///
/// Used by the scheduler, where no CLI wiring flags apply: the run's own
/// snapshot (or workspace/env defaults) decide the operator set.
pub async fn step_discovered_run(
    run: &RunHandle,
    workspaces_root: &Path,
    campaigns: &CampaignRegistry,
    hooks: &dyn LifecycleHook,
    options: &StepOptions,
) -> Result<RunStatus, EngineError> {
    let campaign =
        campaigns
            .get(&run.workspace_slug)
            .ok_or_else(|| EngineError::NotFound {
                what: "campaign for workspace",
                id: run.workspace_slug.clone(),
            })?;

    let wiring = resolve_operator_wiring(
        run,
        &WiringOptions {
            workspace_base: Some(workspaces_root.to_path_buf()),
            ..WiringOptions::default()
        },
    )?;

    let registry = match (wiring.source, &wiring.snapshot_path) {
        (WiringSource::None, _) | (_, None) => OperatorRegistry::new(),
        (_, Some(snapshot)) => {
            let config = load_operators_config(snapshot)?;
            OperatorRegistry::from_config(run, &config)?
        }
    };

    step_run(run, campaign.as_ref(), &registry, hooks, options).await
}

/// One shuffled pass over all active runs. Returns how many runs were
/// actually stepped (lock-busy runs do not count).
pub async fn scheduler_sweep(
    workspaces_root: &Path,
    campaigns: &CampaignRegistry,
    hooks: &dyn LifecycleHook,
    options: &StepOptions,
) -> usize {
    let mut runs = list_active_runs(workspaces_root).await;
    runs.shuffle(&mut rand::rng());

    let mut stepped = 0;
    for run in &runs {
        match step_discovered_run(run, workspaces_root, campaigns, hooks, options).await {
            Ok(status) => {
                stepped += 1;
                tracing::debug!(run_id = %run.run_id, %status, "stepped run");
            }
            Err(EngineError::LockBusy { .. }) => {
                // Another scheduler process owns this run right now.
                tracing::debug!(run_id = %run.run_id, "run locked elsewhere, skipping");
            }
            Err(e) => {
                tracing::error!(run_id = %run.run_id, error = %e, "failed to step run");
            }
        }
    }
    stepped
}

/// Run the scheduler until no active runs remain (or forever when
/// `exit_when_idle` is false): discover, shuffle, step, sleep, repeat.
pub async fn scheduler_loop(
    workspaces_root: &Path,
    campaigns: &CampaignRegistry,
    hooks: &dyn LifecycleHook,
    options: &StepOptions,
    exit_when_idle: bool,
) {
    loop {
        let runs = list_active_runs(workspaces_root).await;
        if runs.is_empty() {
            if exit_when_idle {
                tracing::info!("no active runs remain, scheduler exiting");
                return;
            }
            tokio::time::sleep(Duration::from_secs(5)).await;
            continue;
        }

        scheduler_sweep(workspaces_root, campaigns, hooks, options).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}
