//! Shared test scaffolding for matterstack integration tests.
//!
//! Provides temp workspace roots with seeded runs, scripted campaigns,
//! and scripted operators so engine tests can drive the step loop
//! without real backends.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;

use matterstack_core::campaign::{Campaign, CampaignState, RunResults};
use matterstack_core::operator::{AttemptHandle, CollectedOutput, Operator};
use matterstack_core::run::RunHandle;
use matterstack_db::models::{AttemptStatus, OperatorData, RunStatus};
use matterstack_db::workflow::{Task, Workflow};
use matterstack_db::StateStore;

/// A temp workspaces root holding runs for the duration of a test.
pub struct TestWorkspace {
    _dir: tempfile::TempDir,
    pub root: PathBuf,
}

impl TestWorkspace {
    pub fn new() -> Self {
        let dir = tempfile::TempDir::new().expect("failed to create temp workspaces root");
        let root = dir.path().to_path_buf();
        Self { _dir: dir, root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create a run directory with a PENDING run row and the given tasks
    /// as its first workflow. Returns the handle and an open store.
    pub async fn seed_run(
        &self,
        slug: &str,
        run_id: &str,
        tasks: Vec<Task>,
    ) -> (RunHandle, StateStore) {
        let handle = RunHandle::under(&self.root, slug, run_id);
        std::fs::create_dir_all(&handle.root_path).expect("failed to create run root");

        let store = StateStore::open(&handle.db_path())
            .await
            .expect("failed to open store");
        store
            .create_run(
                run_id,
                slug,
                &handle.root_path.display().to_string(),
                RunStatus::Pending,
            )
            .await
            .expect("failed to create run row");

        if !tasks.is_empty() {
            let mut workflow = Workflow::new();
            for task in tasks {
                workflow.add_task(task).expect("duplicate task in seed");
            }
            store
                .add_workflow(&workflow, run_id)
                .await
                .expect("failed to insert workflow");
        }

        (handle, store)
    }

    /// Write a `config.json` for a run.
    pub fn write_run_config(&self, handle: &RunHandle, json: &str) {
        std::fs::write(handle.config_path(), json).expect("failed to write config.json");
    }
}

impl Default for TestWorkspace {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Scripted campaign
// ---------------------------------------------------------------------------

/// Campaign that hands out a fixed queue of workflows, one per
/// analyze/plan cycle, then reports done.
pub struct ScriptedCampaign {
    plans: Mutex<VecDeque<Workflow>>,
    pub analyze_calls: Mutex<usize>,
}

impl ScriptedCampaign {
    pub fn new(plans: Vec<Workflow>) -> Self {
        Self {
            plans: Mutex::new(plans.into()),
            analyze_calls: Mutex::new(0),
        }
    }

    /// A campaign whose plan() is already exhausted (tasks were seeded
    /// directly into the store).
    pub fn exhausted() -> Self {
        Self::new(Vec::new())
    }

    pub fn analyze_count(&self) -> usize {
        *self.analyze_calls.lock().expect("lock poisoned")
    }
}

impl Campaign for ScriptedCampaign {
    fn plan(&self, _state: Option<&CampaignState>) -> Result<Option<Workflow>> {
        Ok(self.plans.lock().expect("lock poisoned").pop_front())
    }

    fn analyze(
        &self,
        state: Option<CampaignState>,
        results: &RunResults,
    ) -> Result<Option<CampaignState>> {
        *self.analyze_calls.lock().expect("lock poisoned") += 1;
        let cycles = state
            .as_ref()
            .and_then(|s| s.get("cycles"))
            .and_then(|c| c.as_u64())
            .unwrap_or(0);
        Ok(Some(serde_json::json!({
            "cycles": cycles + 1,
            "task_count": results.len(),
        })))
    }
}

/// Campaign whose analyze always fails, for campaign-exception tests.
pub struct ExplodingCampaign;

impl Campaign for ExplodingCampaign {
    fn plan(&self, _state: Option<&CampaignState>) -> Result<Option<Workflow>> {
        Ok(None)
    }

    fn analyze(
        &self,
        _state: Option<CampaignState>,
        _results: &RunResults,
    ) -> Result<Option<CampaignState>> {
        anyhow::bail!("analyze exploded")
    }
}

// ---------------------------------------------------------------------------
// Scripted operator
// ---------------------------------------------------------------------------

/// Operator whose poll results are scripted per task.
///
/// `submit` assigns `mock-job-<task>` and reports SUBMITTED; each `poll`
/// pops the next scripted status for the task (staying put when the
/// script is empty). Collect returns a fixed data payload.
pub struct ScriptedOperator {
    name: String,
    scripts: Mutex<HashMap<String, VecDeque<AttemptStatus>>>,
    pub submitted: Mutex<Vec<String>>,
    pub prepare_error: Option<String>,
    pub submit_error: Option<String>,
}

impl ScriptedOperator {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scripts: Mutex::new(HashMap::new()),
            submitted: Mutex::new(Vec::new()),
            prepare_error: None,
            submit_error: None,
        }
    }

    /// Operator that fails during prepare, for dispatch-failure tests.
    pub fn failing_prepare(name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            prepare_error: Some(error.into()),
            ..Self::new(name)
        }
    }

    /// Operator that fails during submit.
    pub fn failing_submit(name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            submit_error: Some(error.into()),
            ..Self::new(name)
        }
    }

    /// Script the poll statuses for a task, in order.
    pub fn script(&self, task_id: &str, statuses: Vec<AttemptStatus>) {
        self.scripts
            .lock()
            .expect("lock poisoned")
            .insert(task_id.to_string(), statuses.into());
    }

    pub fn submitted_tasks(&self) -> Vec<String> {
        self.submitted.lock().expect("lock poisoned").clone()
    }
}

#[async_trait]
impl Operator for ScriptedOperator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn prepare(
        &self,
        run: &RunHandle,
        task: &Task,
        attempt_id: &str,
    ) -> Result<AttemptHandle> {
        if let Some(error) = &self.prepare_error {
            anyhow::bail!("{error}");
        }

        let attempt_dir = run.attempt_dir(&task.task_id, attempt_id);
        std::fs::create_dir_all(&attempt_dir)?;
        let relative_path = attempt_dir
            .strip_prefix(&run.root_path)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| attempt_dir.clone());

        let mut operator_data = OperatorData::default();
        operator_data.config_hash = Some(format!("mockhash-{}", task.task_id));

        Ok(AttemptHandle {
            task_id: task.task_id.clone(),
            attempt_id: attempt_id.to_string(),
            operator_type: self.name.clone(),
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
        if let Some(error) = &self.submit_error {
            anyhow::bail!("{error}");
        }
        if handle.status.occupies_slot() {
            return Ok(handle);
        }
        handle.external_id = Some(format!("mock-job-{}", task.task_id));
        handle.status = AttemptStatus::Submitted;
        self.submitted
            .lock()
            .expect("lock poisoned")
            .push(task.task_id.clone());
        Ok(handle)
    }

    async fn poll(&self, _run: &RunHandle, mut handle: AttemptHandle) -> Result<AttemptHandle> {
        let mut scripts = self.scripts.lock().expect("lock poisoned");
        if let Some(script) = scripts.get_mut(&handle.task_id) {
            if let Some(next) = script.pop_front() {
                handle.status = next;
            }
        }
        Ok(handle)
    }

    async fn collect(&self, _run: &RunHandle, handle: &AttemptHandle) -> Result<CollectedOutput> {
        let mut output = CollectedOutput::default();
        output.data.insert(
            "mock".to_string(),
            serde_json::json!({ "task_id": handle.task_id }),
        );
        Ok(output)
    }

    async fn cancel(&self, _run: &RunHandle, _handle: &AttemptHandle) -> Result<()> {
        Ok(())
    }
}

/// Shorthand compute task for tests.
pub fn compute_task(id: &str, command: &str) -> Task {
    Task::with_id(id, "ubuntu:22.04", command)
}

/// Backdate an attempt's `created_at` by the given number of hours, to
/// simulate rows left behind by a long-dead process.
pub async fn backdate_attempt(store: &StateStore, attempt_id: &str, hours: i64) {
    sqlx::query("UPDATE task_attempts SET created_at = ? WHERE attempt_id = ?")
        .bind(chrono::Utc::now() - chrono::Duration::hours(hours))
        .bind(attempt_id)
        .execute(store.pool())
        .await
        .expect("failed to backdate attempt");
}

/// Assert the universal store invariants that must hold after any tick:
/// task status mirrors the current attempt, attempt indices are gapless
/// from 1, and at most one attempt per task is active.
pub async fn assert_store_invariants(store: &StateStore, run_id: &str) {
    let tasks = store.get_tasks(run_id).await.expect("get_tasks");
    for task in &tasks {
        let attempts = store
            .list_attempts(&task.task_id)
            .await
            .expect("list_attempts");
        if attempts.is_empty() {
            continue;
        }

        let indices: Vec<i64> = attempts.iter().map(|a| a.attempt_index).collect();
        let expected: Vec<i64> = (1..=attempts.len() as i64).collect();
        assert_eq!(
            indices, expected,
            "attempt indices for {} must be gapless",
            task.task_id
        );

        let active = attempts.iter().filter(|a| a.status.is_active()).count();
        assert!(
            active <= 1,
            "task {} has {active} active attempts",
            task.task_id
        );

        let current = attempts.last().expect("non-empty");
        let task_status = store
            .get_task_status(&task.task_id)
            .await
            .expect("get_task_status")
            .expect("status present");
        assert_eq!(
            task_status,
            matterstack_db::models::task_status_from_attempt(current.status),
            "task {} status must mirror its current attempt",
            task.task_id
        );
    }
}
