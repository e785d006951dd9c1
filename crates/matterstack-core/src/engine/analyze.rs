//! ANALYZE phase: aggregate results, call the campaign, replan.

use std::collections::BTreeMap;

use matterstack_db::models::TaskStatus;
use matterstack_db::workflow::{Task, Workflow};
use matterstack_db::StateStore;

use crate::campaign::{Campaign, CampaignState, RunResults, TaskResultEntry};
use crate::error::EngineError;
use crate::run::RunHandle;

/// Build the results map handed to `campaign.analyze`: every task's
/// status plus whatever its current attempt collected.
pub async fn build_task_results(
    tasks: &[Task],
    status_map: &BTreeMap<String, TaskStatus>,
    store: &StateStore,
) -> Result<RunResults, EngineError> {
    let mut results = RunResults::new();

    for task in tasks {
        let status = status_map
            .get(&task.task_id)
            .copied()
            .unwrap_or(TaskStatus::Pending);

        let mut entry = TaskResultEntry {
            status,
            files: None,
            data: None,
        };

        if let Some(attempt) = store.get_current_attempt(&task.task_id).await? {
            let data = &attempt.operator_data.0;
            entry.files = data.output_files.clone();
            entry.data = data.output_data.clone();
        }

        results.insert(task.task_id.clone(), entry);
    }

    Ok(results)
}

/// Load campaign state from `<run_root>/campaign_state.json`, tolerating
/// absence and malformed content.
pub fn load_campaign_state(handle: &RunHandle) -> Option<CampaignState> {
    let path = handle.campaign_state_path();
    let text = std::fs::read_to_string(&path).ok()?;
    match serde_json::from_str(&text) {
        Ok(state) => Some(state),
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "failed to load campaign state");
            None
        }
    }
}

/// Persist campaign state for the next analyze/plan cycle.
pub fn persist_campaign_state(
    handle: &RunHandle,
    state: &CampaignState,
) -> Result<(), EngineError> {
    let path = handle.campaign_state_path();
    let text = serde_json::to_string(state)
        .map_err(|e| EngineError::Config(format!("failed to serialize campaign state: {e}")))?;
    std::fs::write(&path, text).map_err(|e| EngineError::io(&path, e))
}

/// Run the analyze/replan cycle: build results, call `analyze`, persist
/// the new state, call `plan`. Campaign errors abort the tick.
pub async fn execute_analyze_phase(
    handle: &RunHandle,
    campaign: &dyn Campaign,
    tasks: &[Task],
    status_map: &BTreeMap<String, TaskStatus>,
    store: &StateStore,
) -> Result<Option<Workflow>, EngineError> {
    tracing::info!(run_id = %handle.run_id, "current workflow completed, analyzing");

    let results = build_task_results(tasks, status_map, store).await?;
    let current_state = load_campaign_state(handle);

    let new_state = campaign
        .analyze(current_state, &results)
        .map_err(EngineError::Campaign)?;

    if let Some(state) = &new_state {
        persist_campaign_state(handle, state)?;
    }

    let next_workflow = campaign
        .plan(new_state.as_ref())
        .map_err(EngineError::Campaign)?;

    Ok(next_workflow)
}
