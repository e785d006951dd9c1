//! The declarative task model: a [`Task`] is one unit of work, a
//! [`Workflow`] is the DAG of tasks a campaign hands to the engine in one
//! `plan()` call. Tasks persist; the workflow envelope does not.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::ids;

/// A file staged into an attempt's working directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileSource {
    /// Inline content written literally to the destination.
    Content(String),
    /// Copied from a local source path at dispatch time.
    LocalPath(PathBuf),
}

/// Include/exclude globs applied when collecting attempt artifacts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DownloadPatterns {
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

/// Task variant. Determines default operator routing: gate tasks go to a
/// human operator, external tasks wait on an out-of-band collaborator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskKind {
    #[default]
    Compute,
    Gate {
        /// Rendered into the attempt's instructions.md for the reviewer.
        #[serde(default)]
        instructions: Option<String>,
    },
    External {
        #[serde(default = "default_request_path")]
        request_path: String,
        #[serde(default = "default_response_path")]
        response_path: String,
        #[serde(default)]
        request_data: BTreeMap<String, serde_json::Value>,
        #[serde(default = "default_poll_interval")]
        poll_interval_secs: u64,
    },
}

fn default_request_path() -> String {
    "request.json".to_string()
}

fn default_response_path() -> String {
    "response.json".to_string()
}

fn default_poll_interval() -> u64 {
    5
}

/// A declarative unit of work.
///
/// Dependencies reference other tasks by id. A dependency missing from the
/// run is treated as externally satisfied, which permits chaining across
/// workflows from earlier plan() cycles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    /// Container image hint; the local backend ignores it.
    pub image: String,
    pub command: String,
    #[serde(default)]
    pub files: BTreeMap<String, FileSource>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub dependencies: BTreeSet<String>,

    // Resource hints; None defers to the backend default.
    #[serde(default)]
    pub cores: Option<u32>,
    #[serde(default)]
    pub memory_gb: Option<u32>,
    #[serde(default)]
    pub gpus: Option<u32>,
    #[serde(default)]
    pub time_limit_minutes: Option<u32>,

    // Execution behavior.
    #[serde(default)]
    pub allow_dependency_failure: bool,
    #[serde(default)]
    pub allow_failure: bool,

    /// Preferred canonical routing key, e.g. "hpc.cluster_a".
    #[serde(default)]
    pub operator_key: Option<String>,
    #[serde(default)]
    pub download_patterns: Option<DownloadPatterns>,

    #[serde(default)]
    pub kind: TaskKind,
}

impl Task {
    /// Create a compute task with a generated chronological id.
    pub fn new(image: impl Into<String>, command: impl Into<String>) -> Self {
        Self::with_id(ids::generate_task_id(""), image, command)
    }

    /// Create a compute task with an explicit id.
    pub fn with_id(
        task_id: impl Into<String>,
        image: impl Into<String>,
        command: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            image: image.into(),
            command: command.into(),
            files: BTreeMap::new(),
            env: BTreeMap::new(),
            dependencies: BTreeSet::new(),
            cores: None,
            memory_gb: None,
            gpus: None,
            time_limit_minutes: None,
            allow_dependency_failure: false,
            allow_failure: false,
            operator_key: None,
            download_patterns: None,
            kind: TaskKind::Compute,
        }
    }
}

/// Error building or ordering a workflow.
#[derive(Debug, Clone)]
pub enum WorkflowError {
    DuplicateTask(String),
    Cycle(String),
}

impl fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateTask(id) => write!(f, "task with id {id:?} already exists"),
            Self::Cycle(id) => write!(f, "dependency cycle through task {id:?}"),
        }
    }
}

impl std::error::Error for WorkflowError {}

/// A DAG of tasks added to a run in one plan() call.
///
/// Insertion order is preserved; it is the iteration order the step loop
/// dispatches in.
#[derive(Debug, Clone, Default)]
pub struct Workflow {
    tasks: Vec<Task>,
    seen: HashSet<String>,
}

impl Workflow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a task. Dependencies on tasks outside this workflow are allowed
    /// (they may live in a previous workflow of the same run).
    pub fn add_task(&mut self, task: Task) -> Result<(), WorkflowError> {
        if self.seen.contains(&task.task_id) {
            return Err(WorkflowError::DuplicateTask(task.task_id));
        }
        for dep in &task.dependencies {
            if !self.seen.contains(dep) {
                tracing::debug!(
                    task_id = %task.task_id,
                    dep = %dep,
                    "dependency not in this workflow, assuming external"
                );
            }
        }
        self.seen.insert(task.task_id.clone());
        self.tasks.push(task);
        Ok(())
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Return tasks in topological order. Dependencies not present in this
    /// workflow are skipped; a cycle is an error.
    pub fn topo_sorted(&self) -> Result<Vec<&Task>, WorkflowError> {
        let by_id: HashMap<&str, &Task> =
            self.tasks.iter().map(|t| (t.task_id.as_str(), t)).collect();

        let mut visited: HashSet<&str> = HashSet::new();
        let mut in_progress: HashSet<&str> = HashSet::new();
        let mut sorted: Vec<&Task> = Vec::with_capacity(self.tasks.len());

        fn visit<'a>(
            id: &'a str,
            by_id: &HashMap<&'a str, &'a Task>,
            visited: &mut HashSet<&'a str>,
            in_progress: &mut HashSet<&'a str>,
            sorted: &mut Vec<&'a Task>,
        ) -> Result<(), WorkflowError> {
            if visited.contains(id) {
                return Ok(());
            }
            if !in_progress.insert(id) {
                return Err(WorkflowError::Cycle(id.to_string()));
            }
            let task = by_id[id];
            for dep in &task.dependencies {
                if by_id.contains_key(dep.as_str()) {
                    visit(dep, by_id, visited, in_progress, sorted)?;
                }
            }
            in_progress.remove(id);
            visited.insert(id);
            sorted.push(task);
            Ok(())
        }

        for task in &self.tasks {
            visit(
                &task.task_id,
                &by_id,
                &mut visited,
                &mut in_progress,
                &mut sorted,
            )?;
        }

        Ok(sorted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, deps: &[&str]) -> Task {
        let mut t = Task::with_id(id, "ubuntu:22.04", "true");
        t.dependencies = deps.iter().map(|d| d.to_string()).collect();
        t
    }

    #[test]
    fn duplicate_task_rejected() {
        let mut wf = Workflow::new();
        wf.add_task(task("a", &[])).expect("first insert");
        let err = wf.add_task(task("a", &[])).unwrap_err();
        assert!(matches!(err, WorkflowError::DuplicateTask(_)));
    }

    #[test]
    fn missing_dependency_is_allowed() {
        let mut wf = Workflow::new();
        wf.add_task(task("b", &["from_previous_workflow"]))
            .expect("external deps allowed");
        assert_eq!(wf.len(), 1);
    }

    #[test]
    fn topo_sort_respects_dependencies() {
        let mut wf = Workflow::new();
        wf.add_task(task("c", &["b"])).unwrap();
        wf.add_task(task("a", &[])).unwrap();
        wf.add_task(task("b", &["a"])).unwrap();

        let order: Vec<&str> = wf
            .topo_sorted()
            .expect("acyclic")
            .iter()
            .map(|t| t.task_id.as_str())
            .collect();

        let pos = |id: &str| order.iter().position(|t| *t == id).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("b") < pos("c"));
    }

    #[test]
    fn topo_sort_detects_cycle() {
        let mut wf = Workflow::new();
        wf.add_task(task("a", &["b"])).unwrap();
        wf.add_task(task("b", &["a"])).unwrap();
        assert!(matches!(
            wf.topo_sorted().unwrap_err(),
            WorkflowError::Cycle(_)
        ));
    }

    #[test]
    fn task_roundtrips_through_json_preserving_none_hints() {
        let mut t = Task::with_id("t1", "ubuntu:22.04", "echo hi");
        t.cores = Some(4);
        t.files.insert(
            "input.txt".to_string(),
            FileSource::Content("hello".to_string()),
        );
        t.kind = TaskKind::Gate {
            instructions: Some("check the coating".to_string()),
        };

        let json = serde_json::to_string(&t).expect("serialize");
        let back: Task = serde_json::from_str(&json).expect("deserialize");

        assert_eq!(back, t);
        assert_eq!(back.cores, Some(4));
        assert_eq!(back.memory_gb, None);
        assert_eq!(back.gpus, None);
    }

    #[test]
    fn external_task_defaults() {
        let json =
            r#"{"task_id":"x","image":"ubuntu","command":"true","kind":{"type":"external"}}"#;
        let t: Task = serde_json::from_str(json).expect("deserialize");
        match &t.kind {
            TaskKind::External {
                request_path,
                response_path,
                poll_interval_secs,
                ..
            } => {
                assert_eq!(request_path, "request.json");
                assert_eq!(response_path, "response.json");
                assert_eq!(*poll_interval_secs, 5);
            }
            other => panic!("expected external, got {other:?}"),
        }
    }
}
