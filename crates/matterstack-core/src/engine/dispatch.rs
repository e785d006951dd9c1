//! EXECUTE phase: operator routing and task submission.

use matterstack_db::models::{task_status_from_attempt, AttemptStatus, OperatorData, TaskStatus};
use matterstack_db::store::{AttemptUpdate, NewAttempt};
use matterstack_db::workflow::{Task, TaskKind};
use matterstack_db::{StateStore, StoreError};

use crate::config::{ExecutionMode, RunConfig};
use crate::hooks::{AttemptContext, LifecycleHook};
use crate::operator::keys::{
    is_canonical_operator_key, legacy_operator_type_to_key, normalize_operator_key,
};
use crate::operator::registry::OperatorRegistry;
use crate::run::RunHandle;

/// Environment variable a task may set to force its operator.
pub const ENV_TASK_OPERATOR: &str = "MATTERSTACK_OPERATOR";

/// Where the engine sends a ready task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatorRoute {
    /// Dispatch through the named operator (raw routing string).
    Operator(String),
    /// External/gate task with no explicit operator: record a stub
    /// attempt in WAITING_EXTERNAL, no real dispatch.
    Stub,
    /// Local-testing shortcut: mark COMPLETED without an attempt.
    Simulation,
}

/// Resolve routing for a task.
///
/// Priority: `task.operator_key`, the task's `MATTERSTACK_OPERATOR` env
/// entry, the task variant (gate -> Human, external -> stub), then the
/// run config default (HPC / Local / Simulation).
pub fn determine_route(task: &Task, config: &RunConfig) -> OperatorRoute {
    if let Some(key) = &task.operator_key {
        if !key.trim().is_empty() {
            return OperatorRoute::Operator(key.clone());
        }
    }

    if let Some(explicit) = task.env.get(ENV_TASK_OPERATOR) {
        if !explicit.trim().is_empty() {
            if explicit.eq_ignore_ascii_case("simulation") {
                return OperatorRoute::Simulation;
            }
            return OperatorRoute::Operator(explicit.clone());
        }
    }

    match &task.kind {
        TaskKind::Gate { .. } => OperatorRoute::Operator("Human".to_string()),
        TaskKind::External { .. } => OperatorRoute::Stub,
        TaskKind::Compute => match config.execution_mode {
            ExecutionMode::Hpc => OperatorRoute::Operator("HPC".to_string()),
            ExecutionMode::Local => OperatorRoute::Operator("Local".to_string()),
            ExecutionMode::Simulation => OperatorRoute::Simulation,
        },
    }
}

/// Canonicalize a routing string: canonical keys normalize through,
/// legacy names ("HPC") map to `kind.default`.
pub fn resolve_operator_key_for_dispatch(requested: &str) -> Option<String> {
    let lowered = requested.trim().to_ascii_lowercase();
    if lowered.is_empty() {
        return None;
    }
    if is_canonical_operator_key(&lowered) {
        return normalize_operator_key(&lowered).ok();
    }
    legacy_operator_type_to_key(Some(requested))
}

/// Submit one task to its operator: create the attempt, prepare, submit,
/// and heal the task status. Operator failures are attributed to the
/// attempt (FAILED_INIT) and the task (FAILED) and do not abort the tick;
/// store failures propagate.
///
/// Returns `true` when the task ended up with a live submission.
pub async fn submit_task_to_operator(
    run: &RunHandle,
    task: &Task,
    requested_operator: &str,
    store: &StateStore,
    registry: &OperatorRegistry,
    hooks: &dyn LifecycleHook,
) -> Result<bool, StoreError> {
    let canonical_key = resolve_operator_key_for_dispatch(requested_operator);

    let Some((dispatch_key, operator)) = registry.resolve_for_dispatch(requested_operator) else {
        tracing::error!(
            task_id = %task.task_id,
            requested = requested_operator,
            resolved = canonical_key.as_deref().unwrap_or(""),
            registry = ?registry.keys().collect::<Vec<_>>(),
            "unknown operator requested"
        );
        store
            .update_task_status(&task.task_id, TaskStatus::Failed)
            .await?;
        return Ok(false);
    };

    tracing::info!(
        task_id = %task.task_id,
        operator = %dispatch_key,
        requested = requested_operator,
        "dispatching to operator"
    );

    let attempt_id = store
        .create_attempt(NewAttempt {
            run_id: &run.run_id,
            task_id: &task.task_id,
            operator_type: Some(requested_operator),
            operator_key: canonical_key.as_deref(),
            status: AttemptStatus::Created,
            operator_data: OperatorData::default(),
            relative_path: None,
        })
        .await?;

    let attempt_index = store
        .get_current_attempt(&task.task_id)
        .await?
        .map(|a| a.attempt_index)
        .unwrap_or(1);

    let context = AttemptContext {
        run_id: run.run_id.clone(),
        task_id: task.task_id.clone(),
        attempt_id: attempt_id.clone(),
        operator_key: canonical_key.clone(),
        attempt_index,
    };
    hooks.on_create(&context);

    // prepare + submit; any error here is a dispatch failure attributed
    // to this attempt.
    let dispatch_result = async {
        let handle = operator.prepare(run, task, &attempt_id).await?;
        store
            .update_attempt(
                &attempt_id,
                AttemptUpdate {
                    status: Some(handle.status),
                    operator_type: Some(handle.operator_type.clone()),
                    operator_data: Some(handle.operator_data.clone()),
                    relative_path: handle
                        .relative_path
                        .as_ref()
                        .map(|p| p.display().to_string()),
                    ..Default::default()
                },
            )
            .await
            .map_err(anyhow::Error::from)?;

        let handle = operator.submit(run, task, handle).await?;
        store
            .update_attempt(
                &attempt_id,
                AttemptUpdate {
                    status: Some(handle.status),
                    operator_type: Some(handle.operator_type.clone()),
                    external_id: handle.external_id.clone(),
                    operator_data: Some(handle.operator_data.clone()),
                    relative_path: handle
                        .relative_path
                        .as_ref()
                        .map(|p| p.display().to_string()),
                    ..Default::default()
                },
            )
            .await
            .map_err(anyhow::Error::from)?;

        Ok::<_, anyhow::Error>(handle)
    }
    .await;

    match dispatch_result {
        Ok(handle) => {
            hooks.on_submit(&context, handle.external_id.as_deref());
            store
                .update_task_status(&task.task_id, task_status_from_attempt(handle.status))
                .await?;
            Ok(true)
        }
        Err(e) => {
            // Store-layer failures must abort the tick cleanly; operator
            // failures become FAILED_INIT.
            if let Some(store_err) = e.downcast_ref::<StoreError>() {
                if matches!(store_err, StoreError::Db(_)) {
                    return Err(e.downcast::<StoreError>().unwrap_or_else(|e| {
                        StoreError::Conflict(format!("dispatch store error: {e}"))
                    }));
                }
            }

            let message = format!("{e:#}");
            tracing::error!(
                task_id = %task.task_id,
                operator = %dispatch_key,
                error = %message,
                "dispatch failed"
            );

            if let Err(update_err) = store
                .update_attempt(
                    &attempt_id,
                    AttemptUpdate {
                        status: Some(AttemptStatus::FailedInit),
                        status_reason: Some(message.clone()),
                        operator_data: Some(OperatorData {
                            error: Some(message.clone()),
                            ..OperatorData::default()
                        }),
                        ..Default::default()
                    },
                )
                .await
            {
                tracing::warn!(
                    attempt_id = %attempt_id,
                    error = %update_err,
                    "failed to record dispatch failure on attempt"
                );
            }

            hooks.on_fail(&context, &message);
            store
                .update_task_status(&task.task_id, TaskStatus::Failed)
                .await?;
            Ok(false)
        }
    }
}

/// Record a stub attempt for an external/gate task with no operator:
/// WAITING_EXTERNAL for provenance, no real dispatch.
pub async fn submit_external_task_stub(
    run: &RunHandle,
    task: &Task,
    store: &StateStore,
) -> Result<(), StoreError> {
    store
        .create_attempt(NewAttempt {
            run_id: &run.run_id,
            task_id: &task.task_id,
            operator_type: Some("stub"),
            operator_key: None,
            status: AttemptStatus::WaitingExternal,
            operator_data: OperatorData::default(),
            relative_path: None,
        })
        .await?;
    store
        .update_task_status(&task.task_id, TaskStatus::WaitingExternal)
        .await?;
    Ok(())
}

/// Simulation-mode shortcut: mark the task COMPLETED, no attempt record.
pub async fn submit_local_simulation(task: &Task, store: &StateStore) -> Result<(), StoreError> {
    tracing::info!(task_id = %task.task_id, "simulating local execution");
    store
        .update_task_status(&task.task_id, TaskStatus::Completed)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(mode: ExecutionMode) -> RunConfig {
        RunConfig {
            max_hpc_jobs_per_run: 10,
            execution_mode: mode,
        }
    }

    #[test]
    fn task_operator_key_wins() {
        let mut task = Task::with_id("t", "ubuntu", "true");
        task.operator_key = Some("hpc.cluster_a".to_string());
        task.env
            .insert(ENV_TASK_OPERATOR.to_string(), "Local".to_string());

        assert_eq!(
            determine_route(&task, &config(ExecutionMode::Simulation)),
            OperatorRoute::Operator("hpc.cluster_a".to_string())
        );
    }

    #[test]
    fn env_override_beats_task_kind() {
        let mut task = Task::with_id("t", "ubuntu", "true");
        task.kind = TaskKind::Gate { instructions: None };
        task.env
            .insert(ENV_TASK_OPERATOR.to_string(), "experiment.default".to_string());

        assert_eq!(
            determine_route(&task, &config(ExecutionMode::Simulation)),
            OperatorRoute::Operator("experiment.default".to_string())
        );
    }

    #[test]
    fn env_simulation_forces_simulation() {
        let mut task = Task::with_id("t", "ubuntu", "true");
        task.env
            .insert(ENV_TASK_OPERATOR.to_string(), "Simulation".to_string());

        assert_eq!(
            determine_route(&task, &config(ExecutionMode::Hpc)),
            OperatorRoute::Simulation
        );
    }

    #[test]
    fn gate_defaults_to_human() {
        let mut task = Task::with_id("t", "ubuntu", "true");
        task.kind = TaskKind::Gate { instructions: None };
        assert_eq!(
            determine_route(&task, &config(ExecutionMode::Hpc)),
            OperatorRoute::Operator("Human".to_string())
        );
    }

    #[test]
    fn external_defaults_to_stub() {
        let mut task = Task::with_id("t", "ubuntu", "true");
        task.kind = TaskKind::External {
            request_path: "request.json".to_string(),
            response_path: "response.json".to_string(),
            request_data: Default::default(),
            poll_interval_secs: 5,
        };
        assert_eq!(
            determine_route(&task, &config(ExecutionMode::Hpc)),
            OperatorRoute::Stub
        );
    }

    #[test]
    fn compute_follows_execution_mode() {
        let task = Task::with_id("t", "ubuntu", "true");
        assert_eq!(
            determine_route(&task, &config(ExecutionMode::Hpc)),
            OperatorRoute::Operator("HPC".to_string())
        );
        assert_eq!(
            determine_route(&task, &config(ExecutionMode::Local)),
            OperatorRoute::Operator("Local".to_string())
        );
        assert_eq!(
            determine_route(&task, &config(ExecutionMode::Simulation)),
            OperatorRoute::Simulation
        );
    }

    #[test]
    fn dispatch_key_resolution() {
        assert_eq!(
            resolve_operator_key_for_dispatch("HPC").as_deref(),
            Some("hpc.default")
        );
        assert_eq!(
            resolve_operator_key_for_dispatch("hpc.cluster_a").as_deref(),
            Some("hpc.cluster_a")
        );
        assert_eq!(resolve_operator_key_for_dispatch("Robot"), None);
        assert_eq!(resolve_operator_key_for_dispatch("  "), None);
    }
}
