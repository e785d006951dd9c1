//! Integration tests for the per-run state store: run/task/attempt CRUD,
//! attempt-index allocation, terminal immutability, and orphan detection.

use std::path::Path;
use std::time::Duration;

use matterstack_db::models::{AttemptStatus, OperatorData, RunStatus, TaskStatus};
use matterstack_db::store::{AttemptUpdate, NewAttempt, StateStore, StoreError};
use matterstack_db::workflow::{Task, Workflow};

async fn open_store(root: &Path) -> StateStore {
    StateStore::open(&root.join("state.sqlite"))
        .await
        .expect("store should open")
}

async fn seed_run(store: &StateStore, run_id: &str, task_ids: &[&str]) {
    store
        .create_run(run_id, "testspace", "/tmp/run", RunStatus::Pending)
        .await
        .expect("create run");

    let mut wf = Workflow::new();
    for id in task_ids {
        wf.add_task(Task::with_id(*id, "ubuntu:22.04", "true"))
            .expect("add task");
    }
    store.add_workflow(&wf, run_id).await.expect("add workflow");
}

#[tokio::test]
async fn run_lifecycle_roundtrip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(dir.path()).await;

    store
        .create_run("run1", "coatings", "/w/coatings/runs/run1", RunStatus::Pending)
        .await
        .expect("create run");

    assert_eq!(
        store.get_run_status("run1").await.expect("status"),
        Some(RunStatus::Pending)
    );

    store
        .set_run_status("run1", RunStatus::Failed, Some("workflow tasks failed"))
        .await
        .expect("set status");

    let run = store
        .get_run("run1")
        .await
        .expect("get run")
        .expect("run exists");
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.status_reason.as_deref(), Some("workflow tasks failed"));

    // Unknown run id is None / NotFound.
    assert!(store.get_run_status("nope").await.expect("query").is_none());
    let err = store
        .set_run_status("nope", RunStatus::Running, None)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotFound { .. }));
}

#[tokio::test]
async fn duplicate_run_is_conflict() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(dir.path()).await;

    store
        .create_run("run1", "s", "/r", RunStatus::Pending)
        .await
        .expect("create");
    let err = store
        .create_run("run1", "s", "/r", RunStatus::Pending)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Conflict(_)));
}

#[tokio::test]
async fn workflow_roundtrip_preserves_task_semantics() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(dir.path()).await;
    store
        .create_run("run1", "s", "/r", RunStatus::Pending)
        .await
        .expect("create");

    let mut task = Task::with_id("equilibrate_1", "lammps:stable", "lmp -in in.melt");
    task.cores = Some(8);
    task.env
        .insert("OMP_NUM_THREADS".to_string(), "8".to_string());
    task.dependencies.insert("prior_task".to_string());
    task.allow_failure = true;

    let mut wf = Workflow::new();
    wf.add_task(task.clone()).expect("add");
    store.add_workflow(&wf, "run1").await.expect("insert");

    let tasks = store.get_tasks("run1").await.expect("get tasks");
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0], task);
    // None hints stay None through the round trip.
    assert_eq!(tasks[0].memory_gb, None);
    assert_eq!(tasks[0].time_limit_minutes, None);

    assert_eq!(
        store.get_task_status("equilibrate_1").await.expect("status"),
        Some(TaskStatus::Pending)
    );
}

#[tokio::test]
async fn duplicate_task_id_rolls_back_whole_workflow() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(dir.path()).await;
    seed_run(&store, "run1", &["a"]).await;

    let mut wf = Workflow::new();
    wf.add_task(Task::with_id("b", "ubuntu", "true")).unwrap();
    wf.add_task(Task::with_id("a", "ubuntu", "true")).unwrap();

    let err = store.add_workflow(&wf, "run1").await.unwrap_err();
    assert!(matches!(err, StoreError::Conflict(_)));

    // "b" must not have been inserted (transactional rollback).
    let tasks = store.get_tasks("run1").await.expect("get tasks");
    let ids: Vec<&str> = tasks.iter().map(|t| t.task_id.as_str()).collect();
    assert_eq!(ids, vec!["a"]);
}

#[tokio::test]
async fn attempt_indices_increase_without_gaps() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(dir.path()).await;
    seed_run(&store, "run1", &["t1"]).await;

    for expected_index in 1..=3_i64 {
        let attempt_id = store
            .create_attempt(NewAttempt::created("run1", "t1"))
            .await
            .expect("create attempt");

        let attempt = store
            .get_attempt(&attempt_id)
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(attempt.attempt_index, expected_index);

        // Terminate it so the next attempt is legal.
        store
            .update_attempt(
                &attempt_id,
                AttemptUpdate {
                    status: Some(AttemptStatus::Failed),
                    ..Default::default()
                },
            )
            .await
            .expect("terminate");
    }

    let attempts = store.list_attempts("t1").await.expect("list");
    let indices: Vec<i64> = attempts.iter().map(|a| a.attempt_index).collect();
    assert_eq!(indices, vec![1, 2, 3]);

    let current = store
        .get_current_attempt("t1")
        .await
        .expect("current")
        .expect("exists");
    assert_eq!(current.attempt_id, attempts.last().unwrap().attempt_id);
}

#[tokio::test]
async fn second_active_attempt_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(dir.path()).await;
    seed_run(&store, "run1", &["t1"]).await;

    let first = store
        .create_attempt(NewAttempt::created("run1", "t1"))
        .await
        .expect("first attempt");

    let err = store
        .create_attempt(NewAttempt::created("run1", "t1"))
        .await
        .unwrap_err();
    match err {
        StoreError::ActiveAttemptExists { attempt_id, .. } => assert_eq!(attempt_id, first),
        other => panic!("expected ActiveAttemptExists, got {other:?}"),
    }
}

#[tokio::test]
async fn attempt_for_unknown_task_is_not_found() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(dir.path()).await;
    seed_run(&store, "run1", &["t1"]).await;

    let err = store
        .create_attempt(NewAttempt::created("run1", "ghost"))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotFound { what: "task", .. }));
}

#[tokio::test]
async fn terminal_attempts_are_immutable() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(dir.path()).await;
    seed_run(&store, "run1", &["t1"]).await;

    let attempt_id = store
        .create_attempt(NewAttempt::created("run1", "t1"))
        .await
        .expect("create");

    store
        .update_attempt(
            &attempt_id,
            AttemptUpdate {
                status: Some(AttemptStatus::Completed),
                ..Default::default()
            },
        )
        .await
        .expect("complete");

    let err = store
        .update_attempt(
            &attempt_id,
            AttemptUpdate {
                status: Some(AttemptStatus::Running),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::TerminalAttempt { .. }));

    // Row content is unchanged.
    let attempt = store
        .get_attempt(&attempt_id)
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(attempt.status, AttemptStatus::Completed);
}

#[tokio::test]
async fn partial_update_merges_fields() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(dir.path()).await;
    seed_run(&store, "run1", &["t1"]).await;

    let attempt_id = store
        .create_attempt(NewAttempt {
            operator_type: Some("HPC"),
            operator_key: Some("hpc.default"),
            ..NewAttempt::created("run1", "t1")
        })
        .await
        .expect("create");

    let mut data = OperatorData::default();
    data.config_hash = Some("deadbeef".to_string());

    store
        .update_attempt(
            &attempt_id,
            AttemptUpdate {
                status: Some(AttemptStatus::Submitted),
                external_id: Some("job-42".to_string()),
                operator_data: Some(data),
                ..Default::default()
            },
        )
        .await
        .expect("update");

    let attempt = store
        .get_attempt(&attempt_id)
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(attempt.status, AttemptStatus::Submitted);
    assert_eq!(attempt.external_id.as_deref(), Some("job-42"));
    // Untouched fields survive the partial update.
    assert_eq!(attempt.operator_type.as_deref(), Some("HPC"));
    assert_eq!(attempt.operator_key.as_deref(), Some("hpc.default"));
    assert_eq!(
        attempt.operator_data.0.config_hash.as_deref(),
        Some("deadbeef")
    );
}

#[tokio::test]
async fn active_attempt_queries() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(dir.path()).await;
    seed_run(&store, "run1", &["t1", "t2", "t3"]).await;

    let a1 = store
        .create_attempt(NewAttempt {
            operator_key: Some("hpc.default"),
            status: AttemptStatus::Submitted,
            ..NewAttempt::created("run1", "t1")
        })
        .await
        .expect("a1");
    let _a2 = store
        .create_attempt(NewAttempt {
            operator_key: Some("hpc.default"),
            status: AttemptStatus::Running,
            ..NewAttempt::created("run1", "t2")
        })
        .await
        .expect("a2");
    let a3 = store
        .create_attempt(NewAttempt {
            operator_key: Some("local.default"),
            ..NewAttempt::created("run1", "t3")
        })
        .await
        .expect("a3");

    // Terminate a3 -> two active remain.
    store
        .update_attempt(
            &a3,
            AttemptUpdate {
                status: Some(AttemptStatus::Cancelled),
                ..Default::default()
            },
        )
        .await
        .expect("cancel");

    let active = store.get_active_attempts("run1").await.expect("active");
    assert_eq!(active.len(), 2);
    assert!(active.iter().any(|a| a.attempt_id == a1));

    let task_ids = store.get_attempt_task_ids("run1").await.expect("ids");
    assert_eq!(task_ids.len(), 3);

    let by_operator = store
        .count_active_attempts_by_operator("run1")
        .await
        .expect("counts");
    assert_eq!(by_operator.get("hpc.default"), Some(&2));
    assert_eq!(by_operator.get("local.default"), None);
}

#[tokio::test]
async fn orphan_detection_and_cleanup() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(dir.path()).await;
    seed_run(&store, "run1", &["t1", "t2"]).await;

    let stuck = store
        .create_attempt(NewAttempt::created("run1", "t1"))
        .await
        .expect("stuck attempt");
    let submitted = store
        .create_attempt(NewAttempt {
            status: AttemptStatus::Submitted,
            ..NewAttempt::created("run1", "t2")
        })
        .await
        .expect("submitted attempt");
    store
        .update_attempt(
            &submitted,
            AttemptUpdate {
                external_id: Some("job-7".to_string()),
                ..Default::default()
            },
        )
        .await
        .expect("assign external id");

    // Nothing is an orphan against a 1h timeout yet.
    let none = store
        .find_orphaned_attempts("run1", Duration::from_secs(3600))
        .await
        .expect("query");
    assert!(none.is_empty());

    // Backdate the stuck attempt by two hours.
    sqlx::query("UPDATE task_attempts SET created_at = ? WHERE attempt_id = ?")
        .bind(chrono::Utc::now() - chrono::Duration::hours(2))
        .bind(&stuck)
        .execute(store.pool())
        .await
        .expect("backdate");

    let orphans = store
        .find_orphaned_attempts("run1", Duration::from_secs(3600))
        .await
        .expect("query");
    assert_eq!(orphans.len(), 1);
    assert_eq!(orphans[0].attempt_id, stuck);

    let updated = store
        .mark_attempts_failed_init(&[stuck.clone()], "Stuck in CREATED > 1h")
        .await
        .expect("mark");
    assert_eq!(updated, 1);

    let attempt = store
        .get_attempt(&stuck)
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(attempt.status, AttemptStatus::FailedInit);
    assert!(attempt
        .status_reason
        .as_deref()
        .unwrap_or("")
        .contains("Stuck in CREATED"));

    // No longer counts as active.
    let active = store.get_active_attempts("run1").await.expect("active");
    assert!(active.iter().all(|a| a.attempt_id != stuck));
}

#[tokio::test]
async fn legacy_external_runs_are_readable_and_cancellable() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(dir.path()).await;
    seed_run(&store, "run1", &["t1"]).await;

    // Simulate a historical database row written by the v1 engine.
    sqlx::query(
        "INSERT INTO external_runs (task_id, run_id, operator_type, external_id, status, operator_data) \
         VALUES ('t1', 'run1', 'HPC', 'job-1', 'SUBMITTED', '{}')",
    )
    .execute(store.pool())
    .await
    .expect("seed legacy row");

    let active = store
        .get_active_external_runs("run1")
        .await
        .expect("legacy query");
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].task_id, "t1");

    store
        .cancel_external_runs("t1")
        .await
        .expect("cancel legacy");
    let active = store
        .get_active_external_runs("run1")
        .await
        .expect("legacy query");
    assert!(active.is_empty());
}
