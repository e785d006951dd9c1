//! The per-run state store.
//!
//! One embedded SQLite database per run, at `<run_root>/state.sqlite`.
//! Tables: `runs`, `tasks`, `task_attempts`, `external_runs` (legacy,
//! read-compatibility only). The schema is applied idempotently on open.
//!
//! Mutations are only legal while holding the run's [`crate::RunLock`];
//! the store itself does not re-check this, callers are expected to hold
//! the lock for the duration of a tick.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::types::Json;
use sqlx::SqlitePool;
use thiserror::Error;

use crate::models::{
    AttemptStatus, LegacyExternalRun, OperatorData, Run, RunStatus, TaskAttempt, TaskStatus,
};
use crate::workflow::{Task, Workflow};
use crate::{ids, lock::RunLock};

/// Errors surfaced by the state store and the run lock.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("could not acquire run lock at {path} (held by another process)")]
    LockBusy { path: PathBuf },

    #[error("{what} {id} not found")]
    NotFound { what: &'static str, id: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("attempt {attempt_id} is terminal ({status}) and cannot be mutated")]
    TerminalAttempt {
        attempt_id: String,
        status: AttemptStatus,
    },

    #[error("task {task_id} already has an active attempt {attempt_id}")]
    ActiveAttemptExists {
        task_id: String,
        attempt_id: String,
    },

    #[error("io error at {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Db(#[from] sqlx::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

/// Parameters for creating a new attempt row.
#[derive(Debug, Clone)]
pub struct NewAttempt<'a> {
    pub run_id: &'a str,
    pub task_id: &'a str,
    pub operator_type: Option<&'a str>,
    pub operator_key: Option<&'a str>,
    pub status: AttemptStatus,
    pub operator_data: OperatorData,
    pub relative_path: Option<&'a str>,
}

impl<'a> NewAttempt<'a> {
    /// A fresh attempt in `Created` with empty operator data.
    pub fn created(run_id: &'a str, task_id: &'a str) -> Self {
        Self {
            run_id,
            task_id,
            operator_type: None,
            operator_key: None,
            status: AttemptStatus::Created,
            operator_data: OperatorData::default(),
            relative_path: None,
        }
    }
}

/// Partial update for an attempt row. `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct AttemptUpdate {
    pub status: Option<AttemptStatus>,
    pub operator_type: Option<String>,
    pub operator_key: Option<String>,
    pub external_id: Option<String>,
    pub operator_data: Option<OperatorData>,
    pub relative_path: Option<String>,
    pub status_reason: Option<String>,
}

const SCHEMA: &str = "\
CREATE TABLE IF NOT EXISTS runs (
    run_id         TEXT PRIMARY KEY,
    workspace_slug TEXT NOT NULL,
    root_path      TEXT NOT NULL,
    status         TEXT NOT NULL,
    status_reason  TEXT,
    created_at     TEXT NOT NULL,
    updated_at     TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS tasks (
    task_id    TEXT PRIMARY KEY,
    run_id     TEXT NOT NULL REFERENCES runs(run_id),
    status     TEXT NOT NULL DEFAULT 'PENDING',
    definition TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_tasks_run ON tasks(run_id);
CREATE TABLE IF NOT EXISTS task_attempts (
    attempt_id    TEXT PRIMARY KEY,
    run_id        TEXT NOT NULL REFERENCES runs(run_id),
    task_id       TEXT NOT NULL REFERENCES tasks(task_id),
    attempt_index INTEGER NOT NULL,
    operator_type TEXT,
    operator_key  TEXT,
    external_id   TEXT,
    status        TEXT NOT NULL,
    status_reason TEXT,
    operator_data TEXT NOT NULL DEFAULT '{}',
    relative_path TEXT,
    created_at    TEXT NOT NULL,
    updated_at    TEXT NOT NULL,
    UNIQUE(task_id, attempt_index)
);
CREATE INDEX IF NOT EXISTS idx_attempts_run ON task_attempts(run_id);
CREATE INDEX IF NOT EXISTS idx_attempts_task ON task_attempts(task_id);
CREATE TABLE IF NOT EXISTS external_runs (
    task_id       TEXT PRIMARY KEY,
    run_id        TEXT NOT NULL,
    operator_type TEXT,
    external_id   TEXT,
    status        TEXT NOT NULL,
    operator_data TEXT NOT NULL DEFAULT '{}',
    relative_path TEXT
);
";

const ACTIVE_ATTEMPT_STATUSES: &str = "('CREATED', 'SUBMITTED', 'RUNNING', 'WAITING_EXTERNAL')";

/// Durable, transactional persistence for one run.
pub struct StateStore {
    pool: SqlitePool,
}

impl StateStore {
    /// Open (creating if necessary) the state database at `db_path` and
    /// apply the schema.
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        // A single connection serializes statements; cross-process writers
        // are excluded by the run lock, not by SQLite.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        sqlx::raw_sql(SCHEMA).execute(&pool).await?;

        Ok(Self { pool })
    }

    /// Acquire the run's advisory file lock.
    pub fn lock(run_root: &Path) -> Result<RunLock, StoreError> {
        RunLock::acquire(run_root)
    }

    /// Raw pool access, for diagnostics and test fixtures.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // -----------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------

    /// Insert the run row. Fails with a conflict if the run already exists.
    pub async fn create_run(
        &self,
        run_id: &str,
        workspace_slug: &str,
        root_path: &str,
        status: RunStatus,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT OR IGNORE INTO runs \
             (run_id, workspace_slug, root_path, status, status_reason, created_at, updated_at) \
             VALUES (?, ?, ?, ?, NULL, ?, ?)",
        )
        .bind(run_id)
        .bind(workspace_slug)
        .bind(root_path)
        .bind(status)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!(
                "run {run_id} already exists"
            )));
        }
        Ok(())
    }

    pub async fn get_run(&self, run_id: &str) -> Result<Option<Run>, StoreError> {
        let run = sqlx::query_as::<_, Run>("SELECT * FROM runs WHERE run_id = ?")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(run)
    }

    pub async fn get_run_status(&self, run_id: &str) -> Result<Option<RunStatus>, StoreError> {
        let status: Option<RunStatus> =
            sqlx::query_scalar("SELECT status FROM runs WHERE run_id = ?")
                .bind(run_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(status)
    }

    pub async fn set_run_status(
        &self,
        run_id: &str,
        status: RunStatus,
        reason: Option<&str>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE runs SET status = ?, status_reason = ?, updated_at = ? WHERE run_id = ?",
        )
        .bind(status)
        .bind(reason)
        .bind(Utc::now())
        .bind(run_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                what: "run",
                id: run_id.to_string(),
            });
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Tasks
    // -----------------------------------------------------------------

    /// Insert all tasks of a workflow in one transaction.
    ///
    /// A task_id that already exists in the run is a conflict and rolls
    /// back the whole insert.
    pub async fn add_workflow(
        &self,
        workflow: &Workflow,
        run_id: &str,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        for task in workflow.tasks() {
            let exists: Option<i64> =
                sqlx::query_scalar("SELECT 1 FROM tasks WHERE task_id = ?")
                    .bind(&task.task_id)
                    .fetch_optional(&mut *tx)
                    .await?;
            if exists.is_some() {
                return Err(StoreError::Conflict(format!(
                    "task {} already exists in run {run_id}",
                    task.task_id
                )));
            }

            let definition = serde_json::to_string(task)?;
            sqlx::query(
                "INSERT INTO tasks (task_id, run_id, status, definition, created_at, updated_at) \
                 VALUES (?, ?, 'PENDING', ?, ?, ?)",
            )
            .bind(&task.task_id)
            .bind(run_id)
            .bind(definition)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Deserialize all tasks of a run, in insertion order.
    pub async fn get_tasks(&self, run_id: &str) -> Result<Vec<Task>, StoreError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT definition FROM tasks WHERE run_id = ? ORDER BY rowid ASC",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        let mut tasks = Vec::with_capacity(rows.len());
        for (definition,) in rows {
            tasks.push(serde_json::from_str(&definition)?);
        }
        Ok(tasks)
    }

    pub async fn get_task_status(
        &self,
        task_id: &str,
    ) -> Result<Option<TaskStatus>, StoreError> {
        let status: Option<TaskStatus> =
            sqlx::query_scalar("SELECT status FROM tasks WHERE task_id = ?")
                .bind(task_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(status)
    }

    /// All task statuses of a run in one query (task_id -> status).
    pub async fn get_task_statuses(
        &self,
        run_id: &str,
    ) -> Result<BTreeMap<String, TaskStatus>, StoreError> {
        let rows: Vec<(String, TaskStatus)> =
            sqlx::query_as("SELECT task_id, status FROM tasks WHERE run_id = ?")
                .bind(run_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().collect())
    }

    pub async fn update_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
    ) -> Result<(), StoreError> {
        let result =
            sqlx::query("UPDATE tasks SET status = ?, updated_at = ? WHERE task_id = ?")
                .bind(status)
                .bind(Utc::now())
                .bind(task_id)
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                what: "task",
                id: task_id.to_string(),
            });
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Attempts
    // -----------------------------------------------------------------

    /// Create a new attempt row, atomically allocating the next
    /// `attempt_index` for the task. Returns the new attempt id.
    ///
    /// Rejects creation while an active attempt exists for the task.
    pub async fn create_attempt(&self, new: NewAttempt<'_>) -> Result<String, StoreError> {
        let mut tx = self.pool.begin().await?;

        let task_exists: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM tasks WHERE task_id = ? AND run_id = ?")
                .bind(new.task_id)
                .bind(new.run_id)
                .fetch_optional(&mut *tx)
                .await?;
        if task_exists.is_none() {
            return Err(StoreError::NotFound {
                what: "task",
                id: new.task_id.to_string(),
            });
        }

        let active: Option<String> = sqlx::query_scalar(&format!(
            "SELECT attempt_id FROM task_attempts \
             WHERE task_id = ? AND status IN {ACTIVE_ATTEMPT_STATUSES} LIMIT 1"
        ))
        .bind(new.task_id)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(attempt_id) = active {
            return Err(StoreError::ActiveAttemptExists {
                task_id: new.task_id.to_string(),
                attempt_id,
            });
        }

        let next_index: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(attempt_index), 0) + 1 FROM task_attempts WHERE task_id = ?",
        )
        .bind(new.task_id)
        .fetch_one(&mut *tx)
        .await?;

        let attempt_id = ids::generate_attempt_id();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO task_attempts \
             (attempt_id, run_id, task_id, attempt_index, operator_type, operator_key, \
              external_id, status, status_reason, operator_data, relative_path, \
              created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, NULL, ?, NULL, ?, ?, ?, ?)",
        )
        .bind(&attempt_id)
        .bind(new.run_id)
        .bind(new.task_id)
        .bind(next_index)
        .bind(new.operator_type)
        .bind(new.operator_key)
        .bind(new.status)
        .bind(Json(&new.operator_data))
        .bind(new.relative_path)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(attempt_id)
    }

    /// Apply a partial update. Refused once the attempt is terminal.
    pub async fn update_attempt(
        &self,
        attempt_id: &str,
        update: AttemptUpdate,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let current: Option<AttemptStatus> =
            sqlx::query_scalar("SELECT status FROM task_attempts WHERE attempt_id = ?")
                .bind(attempt_id)
                .fetch_optional(&mut *tx)
                .await?;

        let current = current.ok_or_else(|| StoreError::NotFound {
            what: "attempt",
            id: attempt_id.to_string(),
        })?;

        if current.is_terminal() {
            return Err(StoreError::TerminalAttempt {
                attempt_id: attempt_id.to_string(),
                status: current,
            });
        }

        let operator_data = match &update.operator_data {
            Some(data) => Some(serde_json::to_string(data)?),
            None => None,
        };

        sqlx::query(
            "UPDATE task_attempts SET \
             status = COALESCE(?, status), \
             operator_type = COALESCE(?, operator_type), \
             operator_key = COALESCE(?, operator_key), \
             external_id = COALESCE(?, external_id), \
             operator_data = COALESCE(?, operator_data), \
             relative_path = COALESCE(?, relative_path), \
             status_reason = COALESCE(?, status_reason), \
             updated_at = ? \
             WHERE attempt_id = ?",
        )
        .bind(update.status)
        .bind(update.operator_type)
        .bind(update.operator_key)
        .bind(update.external_id)
        .bind(operator_data)
        .bind(update.relative_path)
        .bind(update.status_reason)
        .bind(Utc::now())
        .bind(attempt_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn get_attempt(
        &self,
        attempt_id: &str,
    ) -> Result<Option<TaskAttempt>, StoreError> {
        let attempt = sqlx::query_as::<_, TaskAttempt>(
            "SELECT * FROM task_attempts WHERE attempt_id = ?",
        )
        .bind(attempt_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(attempt)
    }

    /// The most recent attempt for a task (highest `attempt_index`).
    pub async fn get_current_attempt(
        &self,
        task_id: &str,
    ) -> Result<Option<TaskAttempt>, StoreError> {
        let attempt = sqlx::query_as::<_, TaskAttempt>(
            "SELECT * FROM task_attempts WHERE task_id = ? \
             ORDER BY attempt_index DESC LIMIT 1",
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(attempt)
    }

    /// All attempts for a task in ascending `attempt_index` order.
    pub async fn list_attempts(&self, task_id: &str) -> Result<Vec<TaskAttempt>, StoreError> {
        let attempts = sqlx::query_as::<_, TaskAttempt>(
            "SELECT * FROM task_attempts WHERE task_id = ? ORDER BY attempt_index ASC",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(attempts)
    }

    /// Attempts in an active status, oldest first.
    pub async fn get_active_attempts(
        &self,
        run_id: &str,
    ) -> Result<Vec<TaskAttempt>, StoreError> {
        let attempts = sqlx::query_as::<_, TaskAttempt>(&format!(
            "SELECT * FROM task_attempts \
             WHERE run_id = ? AND status IN {ACTIVE_ATTEMPT_STATUSES} \
             ORDER BY created_at ASC"
        ))
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(attempts)
    }

    /// Set of task_ids that have at least one attempt.
    pub async fn get_attempt_task_ids(
        &self,
        run_id: &str,
    ) -> Result<HashSet<String>, StoreError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT DISTINCT task_id FROM task_attempts WHERE run_id = ?")
                .bind(run_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Active attempt counts per operator key, for per-operator caps.
    /// Attempts without a key are grouped under the empty string.
    pub async fn count_active_attempts_by_operator(
        &self,
        run_id: &str,
    ) -> Result<BTreeMap<String, i64>, StoreError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(&format!(
            "SELECT COALESCE(operator_key, ''), COUNT(*) FROM task_attempts \
             WHERE run_id = ? AND status IN {ACTIVE_ATTEMPT_STATUSES} \
             GROUP BY COALESCE(operator_key, '')"
        ))
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }

    /// Attempts stuck in `Created` with no `external_id` for longer than
    /// the timeout.
    pub async fn find_orphaned_attempts(
        &self,
        run_id: &str,
        timeout: Duration,
    ) -> Result<Vec<TaskAttempt>, StoreError> {
        let cutoff: DateTime<Utc> = Utc::now()
            - chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::zero());

        let attempts = sqlx::query_as::<_, TaskAttempt>(
            "SELECT * FROM task_attempts \
             WHERE run_id = ? AND status = 'CREATED' AND external_id IS NULL \
               AND created_at <= ? \
             ORDER BY created_at ASC",
        )
        .bind(run_id)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(attempts)
    }

    /// Bulk-transition orphans to `FailedInit` with the given reason.
    /// Only rows still in `Created` are touched; returns how many were.
    pub async fn mark_attempts_failed_init(
        &self,
        attempt_ids: &[String],
        reason: &str,
    ) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut updated = 0;

        for attempt_id in attempt_ids {
            let result = sqlx::query(
                "UPDATE task_attempts \
                 SET status = 'FAILED_INIT', status_reason = ?, updated_at = ? \
                 WHERE attempt_id = ? AND status = 'CREATED'",
            )
            .bind(reason)
            .bind(Utc::now())
            .bind(attempt_id)
            .execute(&mut *tx)
            .await?;
            updated += result.rows_affected();
        }

        tx.commit().await?;
        Ok(updated)
    }

    // -----------------------------------------------------------------
    // Legacy external runs (v1 back-compat)
    // -----------------------------------------------------------------

    /// Active legacy rows. The engine only consults these for tasks that
    /// have no attempts.
    pub async fn get_active_external_runs(
        &self,
        run_id: &str,
    ) -> Result<Vec<LegacyExternalRun>, StoreError> {
        let rows = sqlx::query_as::<_, LegacyExternalRun>(&format!(
            "SELECT * FROM external_runs \
             WHERE run_id = ? AND status IN {ACTIVE_ATTEMPT_STATUSES}"
        ))
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Mark any legacy rows for a task as cancelled (zombie prevention
    /// during rerun). A no-op when no legacy rows exist.
    pub async fn cancel_external_runs(&self, task_id: &str) -> Result<(), StoreError> {
        sqlx::query(&format!(
            "UPDATE external_runs SET status = 'CANCELLED' \
             WHERE task_id = ? AND status IN {ACTIVE_ATTEMPT_STATUSES}"
        ))
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
