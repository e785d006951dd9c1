//! Run initialization and resumption.

use std::path::Path;

use matterstack_db::ids;
use matterstack_db::models::RunStatus;
use matterstack_db::StateStore;

use crate::campaign::Campaign;
use crate::error::EngineError;
use crate::run::RunHandle;

/// Initialize a new run: create the directory tree and state database,
/// record the run as PENDING, and store the campaign's initial workflow.
pub async fn initialize_run(
    workspaces_root: &Path,
    workspace_slug: &str,
    campaign: &dyn Campaign,
    run_id: Option<&str>,
) -> Result<RunHandle, EngineError> {
    let run_id = match run_id {
        Some(id) => id.to_string(),
        None => ids::generate_run_id(),
    };

    let handle = RunHandle::under(workspaces_root, workspace_slug, &run_id);
    tracing::info!(
        run_id = %handle.run_id,
        root = %handle.root_path.display(),
        "initializing run"
    );

    std::fs::create_dir_all(&handle.root_path)
        .map_err(|e| EngineError::io(&handle.root_path, e))?;

    let store = handle.open_store().await?;
    let _lock = StateStore::lock(&handle.root_path)?;

    store
        .create_run(
            &handle.run_id,
            &handle.workspace_slug,
            &handle.root_path.display().to_string(),
            RunStatus::Pending,
        )
        .await?;

    // First plan() sees no state.
    let workflow = campaign.plan(None).map_err(EngineError::Campaign)?;
    match workflow {
        Some(workflow) => {
            let count = workflow.len();
            store.add_workflow(&workflow, &handle.run_id).await?;
            tracing::info!(run_id = %handle.run_id, tasks = count, "initialized run");
        }
        None => {
            tracing::info!(run_id = %handle.run_id, "initialized run with no initial workflow");
        }
    }

    Ok(handle)
}

/// Initialize a new run or resume an existing one.
///
/// With an explicit `resume_run_id`, resumes it when present on disk and
/// creates it otherwise. Without one, picks the latest run in the
/// workspace: resumed when active (PENDING/RUNNING/PAUSED), replaced by a
/// fresh run when terminal unless `resume_always` is set.
pub async fn initialize_or_resume_run(
    workspaces_root: &Path,
    workspace_slug: &str,
    campaign: &dyn Campaign,
    resume_run_id: Option<&str>,
    resume_always: bool,
) -> Result<RunHandle, EngineError> {
    let runs_dir = workspaces_root.join(workspace_slug).join("runs");

    if let Some(run_id) = resume_run_id {
        let target = runs_dir.join(run_id);
        if target.is_dir() {
            tracing::info!(run_id, "resuming explicit run");
            return Ok(RunHandle::new(workspace_slug, run_id, target));
        }
        tracing::info!(run_id, "run not found, creating it with this id");
        return initialize_run(workspaces_root, workspace_slug, campaign, Some(run_id)).await;
    }

    // Auto-resume: run ids sort chronologically, so the lexicographically
    // largest directory is the latest run.
    let mut run_dirs: Vec<_> = match std::fs::read_dir(&runs_dir) {
        Ok(entries) => entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect(),
        Err(_) => Vec::new(),
    };

    if run_dirs.is_empty() {
        tracing::info!("no existing runs found, starting new run");
        return initialize_run(workspaces_root, workspace_slug, campaign, None).await;
    }

    run_dirs.sort();
    let latest = run_dirs.pop().unwrap_or_default();
    let latest_id = latest
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_string();

    let status = match StateStore::open(&latest.join("state.sqlite")).await {
        Ok(store) => store.get_run_status(&latest_id).await.unwrap_or(None),
        Err(e) => {
            tracing::warn!(run_id = %latest_id, error = %e, "failed to inspect latest run");
            None
        }
    };

    match status {
        Some(status) if status.is_active() => {
            tracing::info!(run_id = %latest_id, %status, "resuming active run");
            Ok(RunHandle::new(workspace_slug, latest_id, latest))
        }
        Some(status) if resume_always => {
            tracing::info!(run_id = %latest_id, %status, "resuming terminal run (resume_always)");
            Ok(RunHandle::new(workspace_slug, latest_id, latest))
        }
        Some(status) => {
            tracing::info!(run_id = %latest_id, %status, "latest run is terminal, starting new run");
            initialize_run(workspaces_root, workspace_slug, campaign, None).await
        }
        None => {
            tracing::warn!(run_id = %latest_id, "could not determine status, starting new run");
            initialize_run(workspaces_root, workspace_slug, campaign, None).await
        }
    }
}
