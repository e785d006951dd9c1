//! Compute operator and the local subprocess backend.
//!
//! [`ComputeOperator`] is the generic bridge between the operator contract
//! and a [`ComputeBackend`]. [`LocalBackend`] executes tasks as detached
//! subprocesses inside the attempt's evidence directory, capturing
//! `stdout.log`, `stderr.log`, and an `exit_code` file.
//!
//! Recovery model: the `exit_code` file is the authoritative terminal
//! signal and survives engine restarts; while it is absent, a PID
//! liveness probe distinguishes running work from a process that died
//! without reporting.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;

use matterstack_db::models::AttemptStatus;
use matterstack_db::workflow::{DownloadPatterns, FileSource, Task};

use crate::operator::manifest::prepare_attempt_dir;
use crate::operator::{AttemptHandle, CollectedOutput, Operator};
use crate::run::RunHandle;

/// Terminal and in-flight job states reported by a compute backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Running,
    CompletedOk,
    CompletedError,
    Cancelled,
    /// The backend lost track of the job (e.g. the process died without
    /// reporting an exit code).
    Lost,
}

/// Status snapshot for a backend job.
#[derive(Debug, Clone)]
pub struct JobStatus {
    pub state: JobState,
    pub exit_code: Option<i32>,
    pub reason: Option<String>,
}

/// Backend contract used by [`ComputeOperator`]: submit a staged task,
/// poll it, cancel it. Implementations own the mechanics (subprocess,
/// batch scheduler, ...); the operator owns evidence layout and status
/// mapping.
#[async_trait]
pub trait ComputeBackend: Send + Sync {
    /// Stage the task into `workdir` and start it. Returns the backend's
    /// job identifier.
    async fn submit(&self, task: &Task, workdir: &Path) -> Result<String>;

    /// Report current status. Must tolerate jobs submitted by an earlier
    /// process.
    async fn poll(&self, external_id: &str, workdir: &Path) -> Result<JobStatus>;

    /// Best-effort cancellation.
    async fn cancel(&self, external_id: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Local backend
// ---------------------------------------------------------------------------

/// Executes tasks as local subprocesses. `dry_run` stages nothing and
/// reports instant success, for wiring verification.
#[derive(Debug, Clone, Default)]
pub struct LocalBackend {
    pub dry_run: bool,
}

impl LocalBackend {
    pub fn new(dry_run: bool) -> Self {
        Self { dry_run }
    }

    fn stage_files(task: &Task, workdir: &Path) -> Result<()> {
        for (dest, source) in &task.files {
            let dest_path = workdir.join(dest);
            if let Some(parent) = dest_path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }

            match source {
                FileSource::Content(content) => {
                    std::fs::write(&dest_path, content)
                        .with_context(|| format!("failed to write {}", dest_path.display()))?;
                }
                FileSource::LocalPath(src) => {
                    if !src.exists() {
                        bail!("input file not found: {}", src.display());
                    }
                    std::fs::copy(src, &dest_path).with_context(|| {
                        format!(
                            "failed to copy {} to {}",
                            src.display(),
                            dest_path.display()
                        )
                    })?;
                }
            }
        }
        Ok(())
    }

    #[cfg(unix)]
    fn pid_alive(pid: i32) -> bool {
        // Signal 0 probes existence without delivering anything.
        unsafe { libc::kill(pid, 0) == 0 }
    }

    #[cfg(not(unix))]
    fn pid_alive(_pid: i32) -> bool {
        // No cheap probe available; rely on the exit_code file.
        true
    }
}

#[async_trait]
impl ComputeBackend for LocalBackend {
    async fn submit(&self, task: &Task, workdir: &Path) -> Result<String> {
        if self.dry_run {
            tracing::info!(task_id = %task.task_id, "[dry-run] {}", task.command);
            std::fs::write(workdir.join("exit_code"), "0\n")
                .context("failed to write dry-run exit_code")?;
            return Ok("dry-run".to_string());
        }

        Self::stage_files(task, workdir)?;

        let stdout = std::fs::File::create(workdir.join("stdout.log"))
            .context("failed to create stdout.log")?;
        let stderr = std::fs::File::create(workdir.join("stderr.log"))
            .context("failed to create stderr.log")?;

        // Subshell so the exit code is captured even when the command
        // fails; the file write is the durable completion signal.
        let exit_code_path = workdir.join("exit_code");
        let wrapped = format!("({}); echo $? > {}", task.command, exit_code_path.display());

        let mut command = tokio::process::Command::new("bash");
        command
            .arg("-c")
            .arg(&wrapped)
            .current_dir(workdir)
            .envs(&task.env)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::from(stdout))
            .stderr(std::process::Stdio::from(stderr));

        let child = command
            .spawn()
            .with_context(|| format!("failed to spawn task {}", task.task_id))?;

        let pid = child
            .id()
            .context("spawned process has no pid (already reaped)")?;

        tracing::info!(task_id = %task.task_id, pid, workdir = %workdir.display(), "started local process");

        // The child is intentionally dropped without waiting; completion
        // is observed through the exit_code file on later polls.
        Ok(pid.to_string())
    }

    async fn poll(&self, external_id: &str, workdir: &Path) -> Result<JobStatus> {
        let exit_code_path = workdir.join("exit_code");
        if exit_code_path.is_file() {
            let text = std::fs::read_to_string(&exit_code_path)
                .with_context(|| format!("failed to read {}", exit_code_path.display()))?;
            let exit_code: i32 = text
                .trim()
                .parse()
                .with_context(|| format!("malformed exit_code file: {text:?}"))?;
            let state = if exit_code == 0 {
                JobState::CompletedOk
            } else {
                JobState::CompletedError
            };
            return Ok(JobStatus {
                state,
                exit_code: Some(exit_code),
                reason: (exit_code != 0).then(|| format!("command exited with {exit_code}")),
            });
        }

        let pid: i32 = match external_id.parse() {
            Ok(pid) => pid,
            // Dry-run ids and foreign ids have no process to probe.
            Err(_) => {
                return Ok(JobStatus {
                    state: JobState::Running,
                    exit_code: None,
                    reason: None,
                })
            }
        };

        if Self::pid_alive(pid) {
            Ok(JobStatus {
                state: JobState::Running,
                exit_code: None,
                reason: None,
            })
        } else {
            Ok(JobStatus {
                state: JobState::Lost,
                exit_code: None,
                reason: Some(format!(
                    "process {pid} exited without writing exit_code"
                )),
            })
        }
    }

    async fn cancel(&self, external_id: &str) -> Result<()> {
        #[cfg(unix)]
        if let Ok(pid) = external_id.parse::<i32>() {
            unsafe {
                libc::kill(pid, libc::SIGTERM);
            }
        }
        let _ = external_id;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Compute operator
// ---------------------------------------------------------------------------

/// Generic operator that routes tasks to a [`ComputeBackend`].
pub struct ComputeOperator {
    backend: Arc<dyn ComputeBackend>,
    operator_name: String,
}

impl ComputeOperator {
    pub fn new(backend: Arc<dyn ComputeBackend>, operator_name: impl Into<String>) -> Self {
        Self {
            backend,
            operator_name: operator_name.into(),
        }
    }

    /// A compute operator over the local subprocess backend.
    pub fn local(operator_name: impl Into<String>, dry_run: bool) -> Self {
        Self::new(Arc::new(LocalBackend::new(dry_run)), operator_name)
    }

    fn map_state(state: JobState) -> AttemptStatus {
        match state {
            JobState::Queued => AttemptStatus::Submitted,
            JobState::Running => AttemptStatus::Running,
            JobState::CompletedOk => AttemptStatus::Completed,
            JobState::CompletedError | JobState::Lost => AttemptStatus::Failed,
            JobState::Cancelled => AttemptStatus::Cancelled,
        }
    }
}

#[async_trait]
impl Operator for ComputeOperator {
    fn name(&self) -> &str {
        &self.operator_name
    }

    async fn prepare(
        &self,
        run: &RunHandle,
        task: &Task,
        attempt_id: &str,
    ) -> Result<AttemptHandle> {
        let (_, relative_path, config_hash) = prepare_attempt_dir(run, task, attempt_id)?;

        let operator_data = matterstack_db::models::OperatorData {
            config_hash: Some(config_hash),
            ..Default::default()
        };

        tracing::info!(
            task_id = %task.task_id,
            attempt_id,
            path = %relative_path.display(),
            "prepared compute attempt"
        );

        Ok(AttemptHandle {
            task_id: task.task_id.clone(),
            attempt_id: attempt_id.to_string(),
            operator_type: self.operator_name.clone(),
            external_id: None,
            status: AttemptStatus::Created,
            operator_data,
            relative_path: Some(relative_path),
        })
    }

    async fn submit(
        &self,
        run: &RunHandle,
        task: &Task,
        mut handle: AttemptHandle,
    ) -> Result<AttemptHandle> {
        // Idempotent for handles that already made it past submission.
        if handle.status.occupies_slot() {
            tracing::warn!(
                attempt_id = %handle.attempt_id,
                status = %handle.status,
                "submit called on already-submitted handle"
            );
            return Ok(handle);
        }

        let workdir = handle
            .work_dir(run)
            .context("attempt handle has no working directory (prepare not run?)")?;

        let external_id = self.backend.submit(task, &workdir).await?;

        handle.external_id = Some(external_id);
        handle.status = AttemptStatus::Submitted;
        Ok(handle)
    }

    async fn poll(&self, run: &RunHandle, mut handle: AttemptHandle) -> Result<AttemptHandle> {
        let Some(external_id) = handle.external_id.clone() else {
            // Not submitted yet; nothing to ask the backend.
            return Ok(handle);
        };
        let workdir = handle
            .work_dir(run)
            .context("attempt handle has no working directory")?;

        let status = self.backend.poll(&external_id, &workdir).await?;
        let new_status = Self::map_state(status.state);

        if new_status != handle.status {
            tracing::info!(
                attempt_id = %handle.attempt_id,
                from = %handle.status,
                to = %new_status,
                "attempt status changed"
            );
            handle.status = new_status;
        }
        if let Some(reason) = status.reason {
            handle.operator_data.reason = Some(reason);
        }
        if let Some(exit_code) = status.exit_code {
            handle
                .operator_data
                .extra
                .insert("exit_code".to_string(), serde_json::json!(exit_code));
        }

        Ok(handle)
    }

    async fn collect(&self, run: &RunHandle, handle: &AttemptHandle) -> Result<CollectedOutput> {
        let workdir = handle
            .work_dir(run)
            .context("attempt handle has no working directory")?;
        if !workdir.is_dir() {
            bail!(
                "collect failed: attempt directory {} is missing",
                workdir.display()
            );
        }

        let patterns = read_download_patterns(&workdir);
        let files = gather_output_files(&workdir, patterns.as_ref())?;

        let mut data = BTreeMap::new();
        if let Some(external_id) = &handle.external_id {
            data.insert("job_id".to_string(), serde_json::json!(external_id));
        }
        if let Ok(text) = std::fs::read_to_string(workdir.join("exit_code")) {
            if let Ok(exit_code) = text.trim().parse::<i32>() {
                data.insert("exit_code".to_string(), serde_json::json!(exit_code));
            }
        }

        Ok(CollectedOutput { files, data })
    }

    async fn cancel(&self, _run: &RunHandle, handle: &AttemptHandle) -> Result<()> {
        if let Some(external_id) = &handle.external_id {
            self.backend.cancel(external_id).await?;
        }
        Ok(())
    }
}

/// Read the task's download patterns back from the attempt manifest, so
/// collect works from a handle alone after a process restart.
fn read_download_patterns(workdir: &Path) -> Option<DownloadPatterns> {
    let text = std::fs::read_to_string(workdir.join("manifest.json")).ok()?;
    let value: serde_json::Value = serde_json::from_str(&text).ok()?;
    serde_json::from_value(value.get("download_patterns")?.clone()).ok()
}

/// Collect output files from the attempt directory, honoring download
/// patterns. Evidence scaffolding (manifest, config snapshot) is skipped.
fn gather_output_files(
    workdir: &Path,
    patterns: Option<&DownloadPatterns>,
) -> Result<BTreeMap<String, PathBuf>> {
    let mut files = BTreeMap::new();
    let mut stack = vec![workdir.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let entries = std::fs::read_dir(&dir)
            .with_context(|| format!("failed to read {}", dir.display()))?;
        for entry in entries.flatten() {
            let path = entry.path();
            let rel = path
                .strip_prefix(workdir)
                .unwrap_or(&path)
                .to_string_lossy()
                .replace('\\', "/");

            if rel == "manifest.json" || rel.starts_with("config_snapshot") {
                continue;
            }

            if path.is_dir() {
                stack.push(path);
                continue;
            }

            if let Some(patterns) = patterns {
                if !patterns.include.is_empty()
                    && !patterns.include.iter().any(|p| wildcard_match(p, &rel))
                {
                    continue;
                }
                if patterns.exclude.iter().any(|p| wildcard_match(p, &rel)) {
                    continue;
                }
            }

            files.insert(rel, path);
        }
    }

    Ok(files)
}

/// Shell-style wildcard match: `*` matches any run of characters, `?`
/// matches one.
pub fn wildcard_match(pattern: &str, text: &str) -> bool {
    fn inner(p: &[u8], t: &[u8]) -> bool {
        match (p.first(), t.first()) {
            (None, None) => true,
            (Some(b'*'), _) => inner(&p[1..], t) || (!t.is_empty() && inner(p, &t[1..])),
            (Some(b'?'), Some(_)) => inner(&p[1..], &t[1..]),
            (Some(pc), Some(tc)) if pc == tc => inner(&p[1..], &t[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), text.as_bytes())
}
