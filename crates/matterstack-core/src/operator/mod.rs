//! The operator contract.
//!
//! Every external executor -- batch cluster client, local subprocess
//! runner, human gate, lab-equipment interface -- is driven through one
//! capability set: `prepare`, `submit`, `poll`, `collect`, `cancel`. The
//! engine persists only [`AttemptHandle`] snapshots and never learns what
//! a backend actually is.

pub mod experiment;
pub mod human;
pub mod keys;
pub mod local;
pub mod manifest;
pub mod registry;

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;

use matterstack_db::models::{AttemptStatus, OperatorData, TaskAttempt};
use matterstack_db::workflow::Task;

use crate::run::RunHandle;

/// In-memory view of one attempt as it moves through an operator.
///
/// Operators return updated handles; the engine persists them. Operators
/// never mutate store rows directly.
#[derive(Debug, Clone)]
pub struct AttemptHandle {
    pub task_id: String,
    pub attempt_id: String,
    pub operator_type: String,
    /// Backend-assigned job identifier; `None` until submitted.
    pub external_id: Option<String>,
    pub status: AttemptStatus,
    pub operator_data: OperatorData,
    /// Evidence directory relative to the run root.
    pub relative_path: Option<PathBuf>,
}

impl AttemptHandle {
    /// Rehydrate a handle from a persisted attempt row.
    pub fn from_attempt(attempt: &TaskAttempt) -> Self {
        Self {
            task_id: attempt.task_id.clone(),
            attempt_id: attempt.attempt_id.clone(),
            operator_type: attempt.operator_type.clone().unwrap_or_default(),
            external_id: attempt.external_id.clone(),
            status: attempt.status,
            operator_data: attempt.operator_data.0.clone(),
            relative_path: attempt.relative_path.clone().map(PathBuf::from),
        }
    }

    /// Absolute evidence directory for this attempt, when known.
    pub fn work_dir(&self, run: &RunHandle) -> Option<PathBuf> {
        self.relative_path
            .as_ref()
            .map(|rel| run.root_path.join(rel))
    }
}

/// Output extracted from an attempt's working directory after it reaches
/// a terminal status.
#[derive(Debug, Clone, Default)]
pub struct CollectedOutput {
    /// Artifact name -> path on the local filesystem.
    pub files: BTreeMap<String, PathBuf>,
    /// Structured result data.
    pub data: BTreeMap<String, serde_json::Value>,
}

/// The abstract executor contract.
///
/// Object-safe so registries can hold `Arc<dyn Operator>`. The engine
/// calls these in a fixed order per attempt: `prepare` once, `submit`
/// once (idempotent on re-entry), `poll` until terminal, then `collect`.
#[async_trait]
pub trait Operator: Send + Sync {
    /// Operator display name recorded as the attempt's `operator_type`.
    fn name(&self) -> &str;

    /// Create the attempt's evidence directory and manifests; returns a
    /// handle in `Created`. Must not dispatch any work yet.
    async fn prepare(
        &self,
        run: &RunHandle,
        task: &Task,
        attempt_id: &str,
    ) -> Result<AttemptHandle>;

    /// Dispatch the work. Returns the handle with `external_id` set and
    /// status advanced. Must be idempotent for already-submitted handles.
    ///
    /// Always called in the same tick as `prepare` (an attempt that
    /// crashes between the two stays `Created` and ages into the orphan
    /// path), so the full task is available here.
    async fn submit(
        &self,
        run: &RunHandle,
        task: &Task,
        handle: AttemptHandle,
    ) -> Result<AttemptHandle>;

    /// Refresh status from the backend. Must tolerate previously-submitted
    /// work after a crash.
    async fn poll(&self, run: &RunHandle, handle: AttemptHandle) -> Result<AttemptHandle>;

    /// Extract outputs after COMPLETED or FAILED.
    async fn collect(&self, run: &RunHandle, handle: &AttemptHandle) -> Result<CollectedOutput>;

    /// Best-effort cancellation; may be a no-op.
    async fn cancel(&self, run: &RunHandle, handle: &AttemptHandle) -> Result<()>;
}

// Compile-time assertion: Operator must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn Operator) {}
};

#[cfg(test)]
mod tests {
    use super::*;
    use matterstack_db::models::task_status_from_attempt;
    use matterstack_db::models::TaskStatus;

    struct NoopOperator;

    #[async_trait]
    impl Operator for NoopOperator {
        fn name(&self) -> &str {
            "noop"
        }

        async fn prepare(
            &self,
            _run: &RunHandle,
            task: &Task,
            attempt_id: &str,
        ) -> Result<AttemptHandle> {
            Ok(AttemptHandle {
                task_id: task.task_id.clone(),
                attempt_id: attempt_id.to_string(),
                operator_type: "noop".to_string(),
                external_id: None,
                status: AttemptStatus::Created,
                operator_data: OperatorData::default(),
                relative_path: None,
            })
        }

        async fn submit(
            &self,
            _run: &RunHandle,
            _task: &Task,
            handle: AttemptHandle,
        ) -> Result<AttemptHandle> {
            Ok(handle)
        }

        async fn poll(&self, _run: &RunHandle, handle: AttemptHandle) -> Result<AttemptHandle> {
            Ok(handle)
        }

        async fn collect(
            &self,
            _run: &RunHandle,
            _handle: &AttemptHandle,
        ) -> Result<CollectedOutput> {
            Ok(CollectedOutput::default())
        }

        async fn cancel(&self, _run: &RunHandle, _handle: &AttemptHandle) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn operator_is_object_safe() {
        let operator: Box<dyn Operator> = Box::new(NoopOperator);
        assert_eq!(operator.name(), "noop");
    }

    #[tokio::test]
    async fn noop_prepare_returns_created() {
        let run = RunHandle::new("s", "r", "/tmp/r");
        let task = Task::with_id("t", "ubuntu", "true");
        let operator = NoopOperator;

        let handle = operator.prepare(&run, &task, "a1").await.expect("prepare");
        assert_eq!(handle.status, AttemptStatus::Created);
        assert_eq!(task_status_from_attempt(handle.status), TaskStatus::Pending);
    }
}
