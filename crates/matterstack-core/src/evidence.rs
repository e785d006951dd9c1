//! On-demand evidence export.
//!
//! Writes `evidence/bundle.json` (machine-readable run summary: run row,
//! tasks, attempt history, wiring provenance) and a short
//! `evidence/report.md` companion. Detailed report rendering lives with
//! downstream tooling; this is the stable bundle it consumes.

use std::path::PathBuf;

use matterstack_db::StateStore;

use crate::config::wiring::load_wiring_provenance;
use crate::error::EngineError;
use crate::run::RunHandle;

/// Export the evidence bundle for a run. Returns the bundle path.
pub async fn export_evidence(
    run: &RunHandle,
    store: &StateStore,
) -> Result<PathBuf, EngineError> {
    let run_row = store
        .get_run(&run.run_id)
        .await?
        .ok_or_else(|| EngineError::NotFound {
            what: "run",
            id: run.run_id.clone(),
        })?;

    let tasks = store.get_tasks(&run.run_id).await?;
    let status_map = store.get_task_statuses(&run.run_id).await?;

    let mut task_entries = Vec::with_capacity(tasks.len());
    for task in &tasks {
        let attempts = store.list_attempts(&task.task_id).await?;
        task_entries.push(serde_json::json!({
            "task_id": task.task_id,
            "status": status_map.get(&task.task_id),
            "dependencies": task.dependencies,
            "allow_failure": task.allow_failure,
            "attempts": attempts
                .iter()
                .map(|a| serde_json::json!({
                    "attempt_id": a.attempt_id,
                    "attempt_index": a.attempt_index,
                    "status": a.status,
                    "operator_type": a.operator_type,
                    "operator_key": a.operator_key,
                    "external_id": a.external_id,
                    "status_reason": a.status_reason,
                    "relative_path": a.relative_path,
                    "operator_data": a.operator_data.0,
                    "created_at": a.created_at,
                    "updated_at": a.updated_at,
                }))
                .collect::<Vec<_>>(),
        }));
    }

    let wiring = load_wiring_provenance(&run.root_path);
    let bundle = serde_json::json!({
        "schema_version": 1,
        "run": {
            "run_id": run_row.run_id,
            "workspace_slug": run_row.workspace_slug,
            "status": run_row.status,
            "status_reason": run_row.status_reason,
            "created_at": run_row.created_at,
            "updated_at": run_row.updated_at,
        },
        "operator_wiring": wiring.as_ref().map(|w| serde_json::json!({
            "source": w.source,
            "sha256": w.sha256,
            "snapshot_relpath": w.snapshot_relpath,
        })),
        "tasks": task_entries,
    });

    let evidence_dir = run.evidence_dir();
    std::fs::create_dir_all(&evidence_dir).map_err(|e| EngineError::io(&evidence_dir, e))?;

    let bundle_path = evidence_dir.join("bundle.json");
    let text = serde_json::to_string_pretty(&bundle)
        .map_err(|e| EngineError::Config(format!("failed to serialize evidence bundle: {e}")))?;
    std::fs::write(&bundle_path, text + "\n").map_err(|e| EngineError::io(&bundle_path, e))?;

    let report_path = evidence_dir.join("report.md");
    let mut report = format!(
        "# Run {}\n\nStatus: {}\nWorkspace: {}\n\n## Tasks\n\n",
        run_row.run_id, run_row.status, run_row.workspace_slug
    );
    for task in &tasks {
        let status = status_map
            .get(&task.task_id)
            .map(|s| s.to_string())
            .unwrap_or_else(|| "UNKNOWN".to_string());
        report.push_str(&format!("- `{}`: {}\n", task.task_id, status));
    }
    std::fs::write(&report_path, report).map_err(|e| EngineError::io(&report_path, e))?;

    Ok(bundle_path)
}
