//! Multi-run scheduler tests: discovery, fair sweeps, lock contention,
//! and concurrent schedulers sharing one workspaces root.

use std::sync::Arc;

use matterstack_core::campaign::CampaignRegistry;
use matterstack_core::engine::scheduler::{scheduler_sweep, step_discovered_run};
use matterstack_core::engine::StepOptions;
use matterstack_core::hooks::NoopHook;
use matterstack_core::run::list_active_runs;
use matterstack_db::models::RunStatus;
use matterstack_db::workflow::Workflow;
use matterstack_db::StateStore;
use matterstack_test_utils::{compute_task, ScriptedCampaign, TestWorkspace};

fn simulation_workflow(task_id: &str) -> Workflow {
    let mut task = compute_task(task_id, "true");
    task.env.insert(
        "MATTERSTACK_OPERATOR".to_string(),
        "Simulation".to_string(),
    );
    let mut workflow = Workflow::new();
    workflow.add_task(task).expect("add task");
    workflow
}

fn campaigns_for(slugs: &[&str]) -> CampaignRegistry {
    let mut registry = CampaignRegistry::new();
    for slug in slugs {
        registry.register(*slug, Arc::new(ScriptedCampaign::exhausted()));
    }
    registry
}

#[tokio::test]
async fn discovery_finds_only_active_runs() {
    let workspace = TestWorkspace::new();
    let (_h1, _s1) = workspace
        .seed_run("alpha", "run_a", vec![compute_task("t", "true")])
        .await;
    let (_h2, s2) = workspace.seed_run("beta", "run_b", vec![]).await;

    s2.set_run_status("run_b", RunStatus::Completed, None)
        .await
        .expect("complete run_b");

    let active = list_active_runs(workspace.root()).await;
    let ids: Vec<&str> = active.iter().map(|h| h.run_id.as_str()).collect();
    assert_eq!(ids, vec!["run_a"]);
}

#[tokio::test]
async fn sweep_advances_every_active_run() {
    let workspace = TestWorkspace::new();

    // Two simulation runs: each completes its task on sweep 1 and the
    // whole run on sweep 2.
    for (slug, run_id) in [("alpha", "run_a"), ("beta", "run_b")] {
        let (handle, store) = workspace.seed_run(slug, run_id, vec![]).await;
        let workflow = simulation_workflow(&format!("task_{run_id}"));
        store
            .add_workflow(&workflow, run_id)
            .await
            .expect("insert workflow");
        let _ = handle;
    }

    let campaigns = campaigns_for(&["alpha", "beta"]);
    let options = StepOptions::default();

    let stepped = scheduler_sweep(workspace.root(), &campaigns, &NoopHook, &options).await;
    assert_eq!(stepped, 2);

    let stepped = scheduler_sweep(workspace.root(), &campaigns, &NoopHook, &options).await;
    assert_eq!(stepped, 2);

    // Both runs are now terminal and drop out of discovery.
    let active = list_active_runs(workspace.root()).await;
    assert!(active.is_empty(), "runs still active: {active:?}");

    for (slug, run_id) in [("alpha", "run_a"), ("beta", "run_b")] {
        let handle = matterstack_core::run::RunHandle::under(workspace.root(), slug, run_id);
        let store = StateStore::open(&handle.db_path()).await.expect("open");
        assert_eq!(
            store.get_run_status(run_id).await.expect("status"),
            Some(RunStatus::Completed)
        );
    }
}

#[tokio::test]
async fn locked_run_is_skipped_silently() {
    let workspace = TestWorkspace::new();
    let (held, _store) = workspace.seed_run("alpha", "run_a", vec![]).await;
    let (_free, free_store) = workspace.seed_run("beta", "run_b", vec![]).await;

    // Another "process" holds run_a's lock.
    let _lock = StateStore::lock(&held.root_path).expect("hold lock");

    let campaigns = campaigns_for(&["alpha", "beta"]);
    let options = StepOptions::default();

    let stepped = scheduler_sweep(workspace.root(), &campaigns, &NoopHook, &options).await;
    assert_eq!(stepped, 1, "only the unlocked run steps");

    // run_b progressed (empty plan -> COMPLETED); run_a untouched.
    assert_eq!(
        free_store.get_run_status("run_b").await.expect("status"),
        Some(RunStatus::Completed)
    );
    let held_store = StateStore::open(&held.db_path()).await.expect("open");
    assert_eq!(
        held_store.get_run_status("run_a").await.expect("status"),
        Some(RunStatus::Pending)
    );
}

#[tokio::test]
async fn unknown_campaign_slug_is_an_error_not_a_hang() {
    let workspace = TestWorkspace::new();
    let (handle, _store) = workspace.seed_run("mystery", "run_x", vec![]).await;

    let campaigns = campaigns_for(&["alpha"]);
    let err = step_discovered_run(
        &handle,
        workspace.root(),
        &campaigns,
        &NoopHook,
        &StepOptions::default(),
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("mystery"), "{err}");
}

#[tokio::test]
async fn concurrent_sweeps_advance_both_runs_without_interference() {
    let workspace = TestWorkspace::new();

    for (slug, run_id) in [("alpha", "run_a"), ("beta", "run_b")] {
        let (_, store) = workspace.seed_run(slug, run_id, vec![]).await;
        let workflow = simulation_workflow(&format!("task_{run_id}"));
        store
            .add_workflow(&workflow, run_id)
            .await
            .expect("insert workflow");
    }

    let campaigns = Arc::new(campaigns_for(&["alpha", "beta"]));
    let root = workspace.root().to_path_buf();

    // Two schedulers sweeping the same root concurrently; file locks
    // arbitrate. Lock-busy skips are silent, so sweeps never error.
    let mut handles = Vec::new();
    for _ in 0..2 {
        let campaigns = Arc::clone(&campaigns);
        let root = root.clone();
        handles.push(tokio::spawn(async move {
            for _ in 0..6 {
                scheduler_sweep(&root, &campaigns, &NoopHook, &StepOptions::default()).await;
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        }));
    }
    for handle in handles {
        handle.await.expect("sweeper finished");
    }

    for (slug, run_id) in [("alpha", "run_a"), ("beta", "run_b")] {
        let handle = matterstack_core::run::RunHandle::under(&root, slug, run_id);
        let store = StateStore::open(&handle.db_path()).await.expect("open");
        assert_eq!(
            store.get_run_status(run_id).await.expect("status"),
            Some(RunStatus::Completed),
            "{run_id} should have completed"
        );

        // No cross-contamination: every task in this run's store belongs
        // to this run.
        let tasks = store.get_tasks(run_id).await.expect("tasks");
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].task_id, format!("task_{run_id}"));
    }
}
