//! Run-level commands: init, step, loop, and status mutations
//! (pause/resume/cancel/revive).

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use matterstack_core::campaign::Campaign;
use matterstack_core::config::operators::load_operators_config;
use matterstack_core::config::wiring::{resolve_operator_wiring, WiringOptions, WiringSource};
use matterstack_core::engine::{
    initialize_run, run_until_completion, scheduler_loop, step_run, StepOptions,
};
use matterstack_core::hooks::LoggingHook;
use matterstack_core::operator::registry::OperatorRegistry;
use matterstack_core::run::{find_run, RunHandle};
use matterstack_db::models::RunStatus;
use matterstack_db::StateStore;

use crate::campaigns::builtin_campaigns;

/// Wiring-related CLI flags shared by `step` and `loop`.
#[derive(Debug, Clone, Default)]
pub struct WiringFlags {
    pub operators_config: Option<PathBuf>,
    pub force_wiring_override: bool,
    pub profile: Option<String>,
    pub hpc_config: Option<PathBuf>,
}

impl WiringFlags {
    fn to_options(&self, workspaces_root: &Path) -> WiringOptions {
        WiringOptions {
            cli_operators_config: self.operators_config.clone(),
            force_override: self.force_wiring_override,
            workspace_base: Some(workspaces_root.to_path_buf()),
            legacy_hpc_config: self.hpc_config.clone(),
            legacy_profile: self.profile.clone(),
        }
    }
}

/// Locate a run or fail with a user-facing error.
pub fn require_run(workspaces_root: &Path, run_id: &str) -> Result<RunHandle> {
    find_run(workspaces_root, run_id).with_context(|| format!("run {run_id} not found"))
}

/// Look up the campaign registered for a run's workspace.
pub fn require_campaign(slug: &str) -> Result<std::sync::Arc<dyn Campaign>> {
    builtin_campaigns()
        .get(slug)
        .with_context(|| format!("no campaign registered for workspace {slug:?}"))
}

/// Resolve wiring and build the operator registry for a run.
pub fn build_registry(
    run: &RunHandle,
    workspaces_root: &Path,
    flags: &WiringFlags,
) -> Result<OperatorRegistry> {
    let wiring = resolve_operator_wiring(run, &flags.to_options(workspaces_root))?;

    for warning in &wiring.warnings {
        tracing::warn!(run_id = %run.run_id, warning, "wiring resolution warning");
    }

    match (wiring.source, wiring.snapshot_path) {
        (WiringSource::None, _) | (_, None) => Ok(OperatorRegistry::new()),
        (source, Some(snapshot)) => {
            tracing::info!(
                run_id = %run.run_id,
                %source,
                sha256 = wiring.sha256.as_deref().unwrap_or("unknown"),
                "operator wiring resolved"
            );
            let config = load_operators_config(&snapshot)?;
            Ok(OperatorRegistry::from_config(run, &config)?)
        }
    }
}

/// Copy a `--config` file into the run root as `config.json`.
fn apply_run_config(run: &RunHandle, config: Option<&Path>) -> Result<()> {
    if let Some(source) = config {
        std::fs::copy(source, run.config_path())
            .with_context(|| format!("failed to copy run config from {}", source.display()))?;
    }
    Ok(())
}

pub async fn cmd_init(
    workspaces_root: &Path,
    slug: &str,
    operators_config: Option<&Path>,
    run_id: Option<&str>,
) -> Result<()> {
    let campaign = require_campaign(slug)?;
    let handle = initialize_run(workspaces_root, slug, campaign.as_ref(), run_id).await?;

    // Bind wiring immediately so the run carries its snapshot from the
    // start.
    let wiring = resolve_operator_wiring(
        &handle,
        &WiringOptions {
            cli_operators_config: operators_config.map(Path::to_path_buf),
            workspace_base: Some(workspaces_root.to_path_buf()),
            ..Default::default()
        },
    )?;

    println!("Initialized run {}", handle.run_id);
    println!("  root: {}", handle.root_path.display());
    match wiring.source {
        WiringSource::None => println!("  wiring: none (simulation default)"),
        source => println!(
            "  wiring: {source} (sha256 {})",
            wiring.sha256.as_deref().unwrap_or("unknown")
        ),
    }
    println!();
    println!("Next: `matterstack step {}` to advance it.", handle.run_id);
    Ok(())
}

pub async fn cmd_step(
    workspaces_root: &Path,
    run_id: &str,
    flags: WiringFlags,
    config: Option<&Path>,
) -> Result<()> {
    let handle = require_run(workspaces_root, run_id)?;
    apply_run_config(&handle, config)?;

    let campaign = require_campaign(&handle.workspace_slug)?;
    let registry = build_registry(&handle, workspaces_root, &flags)?;
    let hooks = LoggingHook;

    let status = step_run(
        &handle,
        campaign.as_ref(),
        &registry,
        &hooks,
        &StepOptions::default(),
    )
    .await?;

    println!("Run {run_id}: {status}");
    Ok(())
}

pub async fn cmd_loop(
    workspaces_root: &Path,
    run_id: Option<&str>,
    flags: WiringFlags,
    config: Option<&Path>,
) -> Result<()> {
    let hooks = LoggingHook;
    let options = StepOptions::default();

    match run_id {
        Some(run_id) => {
            let handle = require_run(workspaces_root, run_id)?;
            apply_run_config(&handle, config)?;

            let campaign = require_campaign(&handle.workspace_slug)?;
            let registry = build_registry(&handle, workspaces_root, &flags)?;

            let status = run_until_completion(
                &handle,
                campaign.as_ref(),
                &registry,
                &hooks,
                &options,
                std::time::Duration::from_secs(1),
            )
            .await?;
            println!("Run {run_id}: {status}");
            Ok(())
        }
        None => {
            // Multi-run scheduler over every active run on disk.
            let campaigns = builtin_campaigns();
            scheduler_loop(workspaces_root, &campaigns, &hooks, &options, false).await;
            Ok(())
        }
    }
}

/// Mutate a run's status under its lock, validating the transition.
async fn set_status(
    workspaces_root: &Path,
    run_id: &str,
    target: RunStatus,
    reason: &str,
    allowed_from: impl Fn(RunStatus) -> bool,
) -> Result<()> {
    let handle = require_run(workspaces_root, run_id)?;
    let store = handle.open_store().await?;
    let _lock = StateStore::lock(&handle.root_path)?;

    let current = store
        .get_run_status(run_id)
        .await?
        .with_context(|| format!("run {run_id} has no status row"))?;

    if !allowed_from(current) {
        bail!("cannot move run {run_id} from {current} to {target}");
    }

    store.set_run_status(run_id, target, Some(reason)).await?;
    println!("Run {run_id}: {current} -> {target}");
    Ok(())
}

pub async fn cmd_pause(workspaces_root: &Path, run_id: &str) -> Result<()> {
    set_status(
        workspaces_root,
        run_id,
        RunStatus::Paused,
        "Paused by user",
        |s| matches!(s, RunStatus::Pending | RunStatus::Running),
    )
    .await
}

pub async fn cmd_resume(workspaces_root: &Path, run_id: &str) -> Result<()> {
    set_status(
        workspaces_root,
        run_id,
        RunStatus::Running,
        "Resumed by user",
        |s| s == RunStatus::Paused,
    )
    .await
}

pub async fn cmd_cancel(workspaces_root: &Path, run_id: &str) -> Result<()> {
    set_status(
        workspaces_root,
        run_id,
        RunStatus::Cancelled,
        "Cancelled by user",
        |s| !s.is_terminal(),
    )
    .await
}

pub async fn cmd_revive(workspaces_root: &Path, run_id: &str) -> Result<()> {
    set_status(
        workspaces_root,
        run_id,
        RunStatus::Pending,
        "Revived by user",
        RunStatus::is_terminal,
    )
    .await
}
