//! Attempt evidence scaffolding shared by all operators.
//!
//! `prepare` writes two artifacts into the attempt directory:
//!
//! - `manifest.json` -- a lean, reference-only serialization of the task
//!   (schema v2). File entries are reference objects, never embedded
//!   contents; inline content gets a sha256 because the bytes are already
//!   in memory, path sources get only a size from stat.
//! - `config_snapshot/` -- the exact inputs that shaped this attempt
//!   (task manifest, run config, campaign state), hashed byte-exactly
//!   into `operator_data.config_hash`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

use matterstack_db::workflow::{FileSource, Task};

use crate::run::RunHandle;

pub const TASK_MANIFEST_SCHEMA_VERSION: u32 = 2;

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Convert a `Task.files` entry into its reference-only representation.
fn file_ref(dest: &str, source: &FileSource) -> serde_json::Value {
    match source {
        FileSource::Content(content) => {
            let data = content.as_bytes();
            serde_json::json!({
                "path": dest,
                "bytes": data.len(),
                "sha256": sha256_hex(data),
                "source": "inline",
            })
        }
        FileSource::LocalPath(path) => {
            // Size only; hashing an arbitrary local file here would not be
            // cheap and the manifest is best-effort.
            let mut entry = serde_json::json!({
                "path": dest,
                "source": "local_path",
            });
            if let Ok(meta) = std::fs::metadata(path) {
                entry["bytes"] = serde_json::json!(meta.len());
            }
            entry
        }
    }
}

/// Serialize a task to its persistence manifest (schema v2).
pub fn task_manifest_value(task: &Task) -> Result<serde_json::Value> {
    let mut payload = serde_json::to_value(task).context("failed to serialize task")?;
    payload["schema_version"] = serde_json::json!(TASK_MANIFEST_SCHEMA_VERSION);

    let refs: serde_json::Map<String, serde_json::Value> = task
        .files
        .iter()
        .map(|(dest, source)| (dest.clone(), file_ref(dest, source)))
        .collect();
    payload["files"] = serde_json::Value::Object(refs);

    Ok(payload)
}

/// Write `manifest.json` for a task.
pub fn write_task_manifest(path: &Path, task: &Task) -> Result<()> {
    let payload = task_manifest_value(task)?;
    let text = serde_json::to_string_pretty(&payload)?;
    std::fs::write(path, text + "\n")
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

/// Create the attempt evidence directory, write the manifest and the
/// config snapshot, and return `(attempt_dir, relative_path, config_hash)`.
///
/// The config hash is a sha256 over the snapshot files' raw bytes in a
/// fixed order -- byte-exact, never canonicalized.
pub fn prepare_attempt_dir(
    run: &RunHandle,
    task: &Task,
    attempt_id: &str,
) -> Result<(PathBuf, PathBuf, String)> {
    let attempt_dir = run.attempt_dir(&task.task_id, attempt_id);
    std::fs::create_dir_all(&attempt_dir)
        .with_context(|| format!("failed to create {}", attempt_dir.display()))?;

    write_task_manifest(&attempt_dir.join("manifest.json"), task)?;

    let snapshot_dir = attempt_dir.join("config_snapshot");
    std::fs::create_dir_all(&snapshot_dir)
        .with_context(|| format!("failed to create {}", snapshot_dir.display()))?;

    let manifest_bytes = {
        let payload = task_manifest_value(task)?;
        serde_json::to_string_pretty(&payload)? + "\n"
    };
    let run_config_bytes = std::fs::read(run.config_path()).unwrap_or_else(|_| b"{}".to_vec());
    let campaign_state_bytes =
        std::fs::read(run.campaign_state_path()).unwrap_or_else(|_| b"null".to_vec());

    // Fixed hashing order; each file's name and bytes feed the digest so
    // renames change the hash too.
    let entries: [(&str, &[u8]); 3] = [
        ("task_manifest.json", manifest_bytes.as_bytes()),
        ("run_config.json", &run_config_bytes),
        ("campaign_state.json", &campaign_state_bytes),
    ];

    let mut hasher = Sha256::new();
    for (name, bytes) in entries {
        std::fs::write(snapshot_dir.join(name), bytes)
            .with_context(|| format!("failed to write config snapshot entry {name}"))?;
        hasher.update(name.as_bytes());
        hasher.update([0u8]);
        hasher.update(bytes);
    }
    let config_hash = hex::encode(hasher.finalize());

    let relative_path = attempt_dir
        .strip_prefix(&run.root_path)
        .map(Path::to_path_buf)
        .unwrap_or_else(|_| attempt_dir.clone());

    Ok((attempt_dir, relative_path, config_hash))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_in(dir: &Path) -> RunHandle {
        RunHandle::new("s", "run1", dir.join("run1"))
    }

    #[test]
    fn manifest_embeds_references_not_contents() {
        let mut task = Task::with_id("t1", "ubuntu", "true");
        task.files.insert(
            "input.txt".to_string(),
            FileSource::Content("secret payload".to_string()),
        );

        let manifest = task_manifest_value(&task).expect("manifest");
        assert_eq!(manifest["schema_version"], 2);

        let entry = &manifest["files"]["input.txt"];
        assert_eq!(entry["source"], "inline");
        assert_eq!(entry["bytes"], 14);
        assert!(entry["sha256"].is_string());
        // The manifest must never carry the content itself.
        assert!(!manifest.to_string().contains("secret payload"));
    }

    #[test]
    fn prepare_creates_evidence_layout_and_stable_hash() {
        let dir = tempfile::tempdir().expect("tempdir");
        let run = run_in(dir.path());
        std::fs::create_dir_all(&run.root_path).expect("run root");
        let task = Task::with_id("t1", "ubuntu", "echo hi");

        let (attempt_dir, relative, hash1) =
            prepare_attempt_dir(&run, &task, "a1").expect("prepare");

        assert!(attempt_dir.join("manifest.json").is_file());
        assert!(attempt_dir.join("config_snapshot/task_manifest.json").is_file());
        assert_eq!(relative, PathBuf::from("tasks/t1/attempts/a1"));

        // Same inputs -> same hash for a second attempt.
        let (_, _, hash2) = prepare_attempt_dir(&run, &task, "a2").expect("prepare again");
        assert_eq!(hash1, hash2);

        // Changing run config changes the hash.
        std::fs::write(run.config_path(), r#"{"max_hpc_jobs_per_run": 3}"#).expect("config");
        let (_, _, hash3) = prepare_attempt_dir(&run, &task, "a3").expect("prepare third");
        assert_ne!(hash1, hash3);
    }
}
