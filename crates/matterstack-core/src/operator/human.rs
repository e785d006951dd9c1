//! Human gate operator.
//!
//! Dispatching writes `instructions.md` into the attempt directory and
//! parks the attempt in WAITING_EXTERNAL. A reviewer completes the gate
//! by writing `response.json` next to it:
//!
//! ```json
//! {"status": "success"}
//! {"status": "failed", "reason": "coating delaminated"}
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;

use matterstack_db::models::AttemptStatus;
use matterstack_db::workflow::{Task, TaskKind};

use crate::operator::manifest::prepare_attempt_dir;
use crate::operator::{AttemptHandle, CollectedOutput, Operator};
use crate::run::RunHandle;

pub const RESPONSE_FILE: &str = "response.json";

/// Parse a gate/experiment response document into an attempt outcome.
///
/// Missing `status` defaults to success, matching the original wrapper
/// convention.
pub(crate) fn response_outcome(value: &serde_json::Value) -> (AttemptStatus, Option<String>) {
    let status = value
        .get("status")
        .and_then(|s| s.as_str())
        .unwrap_or("success")
        .to_ascii_lowercase();

    if status == "failed" {
        let reason = value
            .get("reason")
            .and_then(|r| r.as_str())
            .unwrap_or("external collaborator reported failure")
            .to_string();
        (AttemptStatus::Failed, Some(reason))
    } else {
        (AttemptStatus::Completed, None)
    }
}

pub(crate) fn read_response(path: &Path) -> Result<Option<serde_json::Value>> {
    if !path.is_file() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&text)
        .with_context(|| format!("{} contains invalid JSON", path.display()))?;
    Ok(Some(value))
}

/// Operator for human-gated tasks.
#[derive(Debug, Default)]
pub struct HumanOperator;

impl HumanOperator {
    pub fn new() -> Self {
        Self
    }

    fn instructions_for(task: &Task) -> String {
        let body = match &task.kind {
            TaskKind::Gate {
                instructions: Some(text),
            } => text.clone(),
            _ => format!("Review and complete: {}", task.command),
        };

        format!(
            "# Gate: {}\n\n{}\n\nWhen done, write `{}` in this directory:\n\n\
             ```json\n{{\"status\": \"success\"}}\n```\n\n\
             or, to reject:\n\n```json\n{{\"status\": \"failed\", \"reason\": \"...\"}}\n```\n",
            task.task_id, body, RESPONSE_FILE
        )
    }
}

#[async_trait]
impl Operator for HumanOperator {
    fn name(&self) -> &str {
        "Human"
    }

    async fn prepare(
        &self,
        run: &RunHandle,
        task: &Task,
        attempt_id: &str,
    ) -> Result<AttemptHandle> {
        let (attempt_dir, relative_path, config_hash) =
            prepare_attempt_dir(run, task, attempt_id)?;

        std::fs::write(
            attempt_dir.join("instructions.md"),
            Self::instructions_for(task),
        )
        .context("failed to write instructions.md")?;

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
        handle.external_id = Some(format!("gate:{}", task.task_id));
        handle.status = AttemptStatus::WaitingExternal;
        Ok(handle)
    }

    async fn poll(&self, run: &RunHandle, mut handle: AttemptHandle) -> Result<AttemptHandle> {
        let Some(workdir) = handle.work_dir(run) else {
            return Ok(handle);
        };

        match read_response(&workdir.join(RESPONSE_FILE))? {
            None => Ok(handle),
            Some(response) => {
                let (status, reason) = response_outcome(&response);
                tracing::info!(
                    attempt_id = %handle.attempt_id,
                    status = %status,
                    "gate response received"
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
        let response_path = workdir.join(RESPONSE_FILE);

        let Some(response) = read_response(&response_path)? else {
            bail!(
                "collect failed: {} is missing",
                response_path.display()
            );
        };

        let mut files = BTreeMap::new();
        files.insert(RESPONSE_FILE.to_string(), response_path);

        let mut data = BTreeMap::new();
        if let Some(obj) = response.as_object() {
            for (key, value) in obj {
                data.insert(key.clone(), value.clone());
            }
        }

        Ok(CollectedOutput { files, data })
    }

    async fn cancel(&self, _run: &RunHandle, _handle: &AttemptHandle) -> Result<()> {
        // Nothing to signal; the reviewer simply stops.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate_task(id: &str) -> Task {
        let mut task = Task::with_id(id, "none", "inspect sample");
        task.kind = TaskKind::Gate {
            instructions: Some("Check the thin film under the microscope.".to_string()),
        };
        task
    }

    #[tokio::test]
    async fn gate_waits_until_response_appears() {
        let dir = tempfile::tempdir().expect("tempdir");
        let run = RunHandle::new("s", "run1", dir.path().join("run1"));
        std::fs::create_dir_all(&run.root_path).expect("run root");
        let task = gate_task("gate_1");
        let operator = HumanOperator::new();

        let handle = operator.prepare(&run, &task, "a1").await.expect("prepare");
        let handle = operator
            .submit(&run, &task, handle)
            .await
            .expect("submit");
        assert_eq!(handle.status, AttemptStatus::WaitingExternal);

        let workdir = handle.work_dir(&run).expect("workdir");
        assert!(workdir.join("instructions.md").is_file());

        // No response yet -> still waiting.
        let handle = operator.poll(&run, handle).await.expect("poll");
        assert_eq!(handle.status, AttemptStatus::WaitingExternal);

        // Approve.
        std::fs::write(workdir.join(RESPONSE_FILE), r#"{"status": "success"}"#)
            .expect("write response");
        let handle = operator.poll(&run, handle).await.expect("poll");
        assert_eq!(handle.status, AttemptStatus::Completed);

        let output = operator.collect(&run, &handle).await.expect("collect");
        assert!(output.files.contains_key(RESPONSE_FILE));
        assert_eq!(output.data["status"], "success");
    }

    #[tokio::test]
    async fn rejected_gate_fails_with_reason() {
        let dir = tempfile::tempdir().expect("tempdir");
        let run = RunHandle::new("s", "run1", dir.path().join("run1"));
        std::fs::create_dir_all(&run.root_path).expect("run root");
        let task = gate_task("gate_1");
        let operator = HumanOperator::new();

        let handle = operator.prepare(&run, &task, "a1").await.expect("prepare");
        let handle = operator
            .submit(&run, &task, handle)
            .await
            .expect("submit");
        let workdir = handle.work_dir(&run).expect("workdir");

        std::fs::write(
            workdir.join(RESPONSE_FILE),
            r#"{"status": "failed", "reason": "coating delaminated"}"#,
        )
        .expect("write response");

        let handle = operator.poll(&run, handle).await.expect("poll");
        assert_eq!(handle.status, AttemptStatus::Failed);
        assert_eq!(
            handle.operator_data.reason.as_deref(),
            Some("coating delaminated")
        );
    }

    #[tokio::test]
    async fn malformed_response_is_a_poll_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let run = RunHandle::new("s", "run1", dir.path().join("run1"));
        std::fs::create_dir_all(&run.root_path).expect("run root");
        let task = gate_task("gate_1");
        let operator = HumanOperator::new();

        let handle = operator.prepare(&run, &task, "a1").await.expect("prepare");
        let handle = operator
            .submit(&run, &task, handle)
            .await
            .expect("submit");
        let workdir = handle.work_dir(&run).expect("workdir");

        std::fs::write(workdir.join(RESPONSE_FILE), "not json").expect("write");
        let err = operator.poll(&run, handle).await.unwrap_err();
        assert!(err.to_string().contains("invalid JSON"), "{err}");
    }
}
