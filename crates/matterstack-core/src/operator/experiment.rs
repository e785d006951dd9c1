//! Wet-lab experiment operator.
//!
//! The engine's half of a filesystem handshake with lab equipment (or the
//! software driving it): `prepare` writes `experiment_request.json`, the
//! instrument side performs the work and writes `experiment_result.json`
//! with the same status convention as gate responses.

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;

use matterstack_db::models::AttemptStatus;
use matterstack_db::workflow::{Task, TaskKind};

use crate::operator::human::{read_response, response_outcome};
use crate::operator::manifest::prepare_attempt_dir;
use crate::operator::{AttemptHandle, CollectedOutput, Operator};
use crate::run::RunHandle;

pub const REQUEST_FILE: &str = "experiment_request.json";
pub const RESULT_FILE: &str = "experiment_result.json";

/// Operator for experiment handoffs.
#[derive(Debug, Default)]
pub struct ExperimentOperator;

impl ExperimentOperator {
    pub fn new() -> Self {
        Self
    }

    fn request_for(task: &Task) -> serde_json::Value {
        match &task.kind {
            TaskKind::External { request_data, .. } if !request_data.is_empty() => {
                serde_json::json!({
                    "task_id": task.task_id,
                    "request": request_data,
                })
            }
            _ => serde_json::json!({
                "task_id": task.task_id,
                "command": task.command,
            }),
        }
    }
}

#[async_trait]
impl Operator for ExperimentOperator {
    fn name(&self) -> &str {
        "Experiment"
    }

    async fn prepare(
        &self,
        run: &RunHandle,
        task: &Task,
        attempt_id: &str,
    ) -> Result<AttemptHandle> {
        let (attempt_dir, relative_path, config_hash) =
            prepare_attempt_dir(run, task, attempt_id)?;

        let request = Self::request_for(task);
        std::fs::write(
            attempt_dir.join(REQUEST_FILE),
            serde_json::to_string_pretty(&request)? + "\n",
        )
        .context("failed to write experiment request")?;

        let operator_data = matterstack_db::models::OperatorData {
            config_hash: Some(config_hash),
            ..Default::default()
        };

        Ok(AttemptHandle {
            task_id: task.task_id.clone(),
            attempt_id: attempt_id.to_string(),
            operator_type: self.name().to_string(),
            external_id: None,
            status: AttemptStatus::Created,
            operator_data,
            relative_path: Some(relative_path),
        })
    }

    async fn submit(
        &self,
        _run: &RunHandle,
        task: &Task,
        mut handle: AttemptHandle,
    ) -> Result<AttemptHandle> {
        if handle.status.occupies_slot() {
            return Ok(handle);
        }
        handle.external_id = Some(format!("experiment:{}", task.task_id));
        handle.status = AttemptStatus::WaitingExternal;
        Ok(handle)
    }

    async fn poll(&self, run: &RunHandle, mut handle: AttemptHandle) -> Result<AttemptHandle> {
        let Some(workdir) = handle.work_dir(run) else {
            return Ok(handle);
        };

        match read_response(&workdir.join(RESULT_FILE))? {
            None => Ok(handle),
            Some(result) => {
                let (status, reason) = response_outcome(&result);
                tracing::info!(
                    attempt_id = %handle.attempt_id,
                    status = %status,
                    "experiment result received"
                );
                handle.status = status;
                if let Some(reason) = reason {
                    handle.operator_data.reason = Some(reason);
                }
                Ok(handle)
            }
        }
    }

    async fn collect(&self, run: &RunHandle, handle: &AttemptHandle) -> Result<CollectedOutput> {
        let workdir = handle
            .work_dir(run)
            .context("attempt handle has no working directory")?;
        let result_path = workdir.join(RESULT_FILE);

        let Some(result) = read_response(&result_path)? else {
            bail!("collect failed: {} is missing", result_path.display());
        };

        let mut files = BTreeMap::new();
        files.insert(RESULT_FILE.to_string(), result_path);

        let mut data = BTreeMap::new();
        if let Some(obj) = result.as_object() {
            for (key, value) in obj {
                data.insert(key.clone(), value.clone());
            }
        }

        Ok(CollectedOutput { files, data })
    }

    async fn cancel(&self, _run: &RunHandle, _handle: &AttemptHandle) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn experiment_handshake_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let run = RunHandle::new("s", "run1", dir.path().join("run1"));
        std::fs::create_dir_all(&run.root_path).expect("run root");

        let mut task = Task::with_id("deposit_film", "none", "run deposition");
        task.kind = TaskKind::External {
            request_path: "request.json".to_string(),
            response_path: "response.json".to_string(),
            request_data: [(
                "temperature_c".to_string(),
                serde_json::json!(450),
            )]
            .into_iter()
            .collect(),
            poll_interval_secs: 5,
        };

        let operator = ExperimentOperator::new();
        let handle = operator.prepare(&run, &task, "a1").await.expect("prepare");
        let handle = operator.submit(&run, &task, handle).await.expect("submit");
        assert_eq!(handle.status, AttemptStatus::WaitingExternal);

        let workdir = handle.work_dir(&run).expect("workdir");
        let request: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(workdir.join(REQUEST_FILE)).expect("request exists"),
        )
        .expect("request parses");
        assert_eq!(request["request"]["temperature_c"], 450);

        // Instrument side reports success with a measurement.
        std::fs::write(
            workdir.join(RESULT_FILE),
            r#"{"status": "success", "thickness_nm": 92.5}"#,
        )
        .expect("write result");

        let handle = operator.poll(&run, handle).await.expect("poll");
        assert_eq!(handle.status, AttemptStatus::Completed);

        let output = operator.collect(&run, &handle).await.expect("collect");
        assert_eq!(output.data["thickness_nm"], 92.5);
    }
}
