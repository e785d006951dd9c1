//! Run handles and run discovery.
//!
//! A [`RunHandle`] anchors a run's filesystem layout:
//!
//! ```text
//! <workspaces>/<slug>/runs/<run_id>/
//!   state.sqlite                 authoritative DB
//!   state.sqlite.lock            OS file lock
//!   config.json                  run execution config
//!   campaign_state.json          opaque campaign state
//!   operators_snapshot/          wiring snapshot + provenance
//!   tasks/<task>/attempts/<id>/  per-attempt evidence
//!   evidence/                    exported bundle
//! ```

use std::path::{Path, PathBuf};

use matterstack_db::models::RunStatus;
use matterstack_db::StateStore;

use crate::error::EngineError;

/// Identifies one run and anchors its filesystem layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunHandle {
    pub workspace_slug: String,
    pub run_id: String,
    pub root_path: PathBuf,
}

impl RunHandle {
    pub fn new(
        workspace_slug: impl Into<String>,
        run_id: impl Into<String>,
        root_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            workspace_slug: workspace_slug.into(),
            run_id: run_id.into(),
            root_path: root_path.into(),
        }
    }

    /// Handle for a run under `<workspaces_root>/<slug>/runs/<run_id>`.
    pub fn under(workspaces_root: &Path, slug: &str, run_id: &str) -> Self {
        Self::new(
            slug,
            run_id,
            workspaces_root.join(slug).join("runs").join(run_id),
        )
    }

    pub fn db_path(&self) -> PathBuf {
        self.root_path.join("state.sqlite")
    }

    pub fn config_path(&self) -> PathBuf {
        self.root_path.join("config.json")
    }

    pub fn campaign_state_path(&self) -> PathBuf {
        self.root_path.join("campaign_state.json")
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        self.root_path.join("operators_snapshot")
    }

    pub fn evidence_dir(&self) -> PathBuf {
        self.root_path.join("evidence")
    }

    /// Evidence directory for one attempt; owned by exactly that attempt.
    pub fn attempt_dir(&self, task_id: &str, attempt_id: &str) -> PathBuf {
        self.root_path
            .join("tasks")
            .join(task_id)
            .join("attempts")
            .join(attempt_id)
    }

    pub async fn open_store(&self) -> Result<StateStore, EngineError> {
        Ok(StateStore::open(&self.db_path()).await?)
    }
}

/// Locate a run by id anywhere under the workspaces root.
///
/// Workspace slugs may be nested (`team/project`), so this walks the tree
/// looking for `<slug...>/runs/<run_id>/state.sqlite`.
pub fn find_run(workspaces_root: &Path, run_id: &str) -> Option<RunHandle> {
    let mut found = None;
    visit_run_dirs(workspaces_root, workspaces_root, &mut |slug, dir| {
        if found.is_none() && dir.file_name().is_some_and(|n| n == run_id) {
            found = Some(RunHandle::new(slug, run_id, dir));
        }
    });
    found
}

/// Scan for runs whose status is active (PENDING, RUNNING, PAUSED).
pub async fn list_active_runs(workspaces_root: &Path) -> Vec<RunHandle> {
    let mut candidates = Vec::new();
    visit_run_dirs(workspaces_root, workspaces_root, &mut |slug, dir| {
        let run_id = match dir.file_name().and_then(|n| n.to_str()) {
            Some(name) => name.to_string(),
            None => return,
        };
        candidates.push(RunHandle::new(slug, run_id, dir));
    });

    let mut active = Vec::new();
    for handle in candidates {
        match run_status_of(&handle).await {
            Ok(Some(status)) if status.is_active() => active.push(handle),
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(
                    run_id = %handle.run_id,
                    error = %e,
                    "failed to inspect run, skipping"
                );
            }
        }
    }
    active
}

async fn run_status_of(handle: &RunHandle) -> Result<Option<RunStatus>, EngineError> {
    let store = handle.open_store().await?;
    Ok(store.get_run_status(&handle.run_id).await?)
}

/// Walk `<root>/**/runs/*` and call `f(slug, run_dir)` for every run
/// directory containing a state database. Depth is bounded to keep the
/// scan cheap on deep trees.
fn visit_run_dirs(root: &Path, current: &Path, f: &mut impl FnMut(String, PathBuf)) {
    const MAX_SLUG_DEPTH: usize = 4;

    fn depth_of(root: &Path, dir: &Path) -> usize {
        dir.strip_prefix(root).map(|p| p.components().count()).unwrap_or(0)
    }

    let Ok(entries) = std::fs::read_dir(current) else {
        return;
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }

        if path.file_name().is_some_and(|n| n == "runs") {
            let slug = match path
                .parent()
                .and_then(|p| p.strip_prefix(root).ok())
                .and_then(|p| p.to_str())
            {
                Some(s) if !s.is_empty() => s.replace('\\', "/"),
                _ => continue,
            };

            let Ok(run_entries) = std::fs::read_dir(&path) else {
                continue;
            };
            for run_entry in run_entries.flatten() {
                let run_dir = run_entry.path();
                if run_dir.is_dir() && run_dir.join("state.sqlite").is_file() {
                    f(slug.clone(), run_dir);
                }
            }
        } else if depth_of(root, &path) < MAX_SLUG_DEPTH {
            visit_run_dirs(root, &path, f);
        }
    }
}
