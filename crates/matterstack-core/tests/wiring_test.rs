//! Integration tests for operator-wiring resolution: precedence,
//! override safety, provenance, and history semantics.

use std::path::Path;

use matterstack_core::config::wiring::{
    format_wiring_explain_line, load_wiring_provenance, resolve_operator_wiring, WiringOptions,
    WiringSource,
};
use matterstack_core::error::EngineError;
use matterstack_core::run::RunHandle;
use sha2::{Digest, Sha256};

const WIRING_A: &str = "operators:\n  local.default:\n    kind: local\n";
const WIRING_B: &str =
    "operators:\n  local.default:\n    kind: local\n  human.default:\n    kind: human\n";

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn run_in(dir: &Path) -> RunHandle {
    let root = dir.join("space/runs/run1");
    std::fs::create_dir_all(&root).expect("run root");
    RunHandle::new("space", "run1", root)
}

fn history_lines(handle: &RunHandle) -> Vec<serde_json::Value> {
    let path = handle.snapshot_dir().join("history.jsonl");
    if !path.is_file() {
        return Vec::new();
    }
    std::fs::read_to_string(path)
        .expect("read history")
        .lines()
        .map(|l| serde_json::from_str(l).expect("history line parses"))
        .collect()
}

#[tokio::test]
async fn cli_override_persists_snapshot_with_provenance() {
    let dir = tempfile::tempdir().expect("tempdir");
    let handle = run_in(dir.path());

    let cli_path = dir.path().join("operators.yaml");
    std::fs::write(&cli_path, WIRING_A).expect("write wiring");

    let resolved = resolve_operator_wiring(
        &handle,
        &WiringOptions {
            cli_operators_config: Some(cli_path),
            ..Default::default()
        },
    )
    .expect("resolves");

    assert_eq!(resolved.source, WiringSource::CliOverride);
    assert_eq!(
        resolved.sha256.as_deref(),
        Some(sha256_hex(WIRING_A.as_bytes()).as_str())
    );

    // Snapshot bytes are verbatim.
    let snapshot = std::fs::read_to_string(resolved.snapshot_path.expect("snapshot path"))
        .expect("snapshot readable");
    assert_eq!(snapshot, WIRING_A);

    // Metadata matches the snapshot bytes on disk.
    let prov = load_wiring_provenance(&handle.root_path).expect("provenance");
    assert_eq!(prov.source, "CLI_OVERRIDE");
    assert_eq!(prov.sha256.as_deref(), resolved.sha256.as_deref());
    assert_eq!(
        prov.snapshot_relpath.as_deref(),
        Some("operators_snapshot/operators.yaml")
    );

    let history = history_lines(&handle);
    assert_eq!(history.len(), 1);
    assert_eq!(history[0]["event"], "WIRING_PERSISTED");
}

#[tokio::test]
async fn run_snapshot_beats_workspace_default() {
    let dir = tempfile::tempdir().expect("tempdir");
    let handle = run_in(dir.path());

    // Workspace default exists...
    std::fs::write(dir.path().join("space/operators.yaml"), WIRING_B).expect("workspace wiring");

    // ...but the run already has a persisted snapshot.
    std::fs::create_dir_all(handle.snapshot_dir()).expect("snapshot dir");
    std::fs::write(handle.snapshot_dir().join("operators.yaml"), WIRING_A)
        .expect("persisted snapshot");

    let resolved = resolve_operator_wiring(
        &handle,
        &WiringOptions {
            workspace_base: Some(dir.path().to_path_buf()),
            ..Default::default()
        },
    )
    .expect("resolves");

    assert_eq!(resolved.source, WiringSource::RunPersisted);
    assert_eq!(
        resolved.sha256.as_deref(),
        Some(sha256_hex(WIRING_A.as_bytes()).as_str())
    );
}

#[tokio::test]
async fn workspace_default_is_used_when_no_snapshot() {
    let dir = tempfile::tempdir().expect("tempdir");
    let handle = run_in(dir.path());
    std::fs::write(dir.path().join("space/operators.yaml"), WIRING_B).expect("workspace wiring");

    let resolved = resolve_operator_wiring(
        &handle,
        &WiringOptions {
            workspace_base: Some(dir.path().to_path_buf()),
            ..Default::default()
        },
    )
    .expect("resolves");

    assert_eq!(resolved.source, WiringSource::WorkspaceDefault);
    let snapshot =
        std::fs::read_to_string(handle.snapshot_dir().join("operators.yaml")).expect("snapshot");
    assert_eq!(snapshot, WIRING_B);
}

#[tokio::test]
async fn override_with_different_bytes_is_refused() {
    let dir = tempfile::tempdir().expect("tempdir");
    let handle = run_in(dir.path());

    // Persist wiring A first.
    let path_a = dir.path().join("a.yaml");
    std::fs::write(&path_a, WIRING_A).expect("write a");
    resolve_operator_wiring(
        &handle,
        &WiringOptions {
            cli_operators_config: Some(path_a),
            ..Default::default()
        },
    )
    .expect("first resolve");

    // Now try wiring B without force.
    let path_b = dir.path().join("b.yaml");
    std::fs::write(&path_b, WIRING_B).expect("write b");
    let err = resolve_operator_wiring(
        &handle,
        &WiringOptions {
            cli_operators_config: Some(path_b.clone()),
            ..Default::default()
        },
    )
    .unwrap_err();

    let sha_a = sha256_hex(WIRING_A.as_bytes());
    let sha_b = sha256_hex(WIRING_B.as_bytes());
    match &err {
        EngineError::WiringOverrideRefused {
            existing_sha256,
            attempted_sha256,
            ..
        } => {
            assert_eq!(existing_sha256, &sha_a);
            assert_eq!(attempted_sha256, &sha_b);
        }
        other => panic!("expected WiringOverrideRefused, got {other:?}"),
    }

    // Snapshot is untouched.
    let snapshot =
        std::fs::read_to_string(handle.snapshot_dir().join("operators.yaml")).expect("snapshot");
    assert_eq!(snapshot, WIRING_A);

    // Exactly one refusal event, recording the attempted digest.
    let history = history_lines(&handle);
    let refusals: Vec<_> = history
        .iter()
        .filter(|l| l["event"] == "WIRING_OVERRIDE_REFUSED")
        .collect();
    assert_eq!(refusals.len(), 1);
    assert_eq!(refusals[0]["details"]["attempted_sha256"], sha_b.as_str());
    assert_eq!(refusals[0]["sha256"], sha_a.as_str());
}

#[tokio::test]
async fn forced_override_replaces_snapshot_and_logs() {
    let dir = tempfile::tempdir().expect("tempdir");
    let handle = run_in(dir.path());

    let path_a = dir.path().join("a.yaml");
    std::fs::write(&path_a, WIRING_A).expect("write a");
    resolve_operator_wiring(
        &handle,
        &WiringOptions {
            cli_operators_config: Some(path_a),
            ..Default::default()
        },
    )
    .expect("first resolve");

    let path_b = dir.path().join("b.yaml");
    std::fs::write(&path_b, WIRING_B).expect("write b");
    let resolved = resolve_operator_wiring(
        &handle,
        &WiringOptions {
            cli_operators_config: Some(path_b),
            force_override: true,
            ..Default::default()
        },
    )
    .expect("forced override");

    assert_eq!(
        resolved.sha256.as_deref(),
        Some(sha256_hex(WIRING_B.as_bytes()).as_str())
    );
    let snapshot =
        std::fs::read_to_string(handle.snapshot_dir().join("operators.yaml")).expect("snapshot");
    assert_eq!(snapshot, WIRING_B);

    // History is append-only: persistence, then the forced override.
    let history = history_lines(&handle);
    assert_eq!(history.len(), 2);
    assert_eq!(history[0]["event"], "WIRING_PERSISTED");
    assert_eq!(history[1]["event"], "WIRING_OVERRIDE_FORCED");
    assert_eq!(
        history[1]["details"]["prior_sha256"],
        sha256_hex(WIRING_A.as_bytes()).as_str()
    );
}

#[tokio::test]
async fn missing_metadata_is_reconstructed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let handle = run_in(dir.path());

    // A snapshot from an older run, with no metadata or history.
    std::fs::create_dir_all(handle.snapshot_dir()).expect("snapshot dir");
    std::fs::write(handle.snapshot_dir().join("operators.yaml"), WIRING_A).expect("snapshot");

    let resolved =
        resolve_operator_wiring(&handle, &WiringOptions::default()).expect("resolves");
    assert_eq!(resolved.source, WiringSource::RunPersisted);

    let prov = load_wiring_provenance(&handle.root_path).expect("metadata reconstructed");
    assert_eq!(prov.source, "RUN_PERSISTED");
    assert_eq!(
        prov.sha256.as_deref(),
        Some(sha256_hex(WIRING_A.as_bytes()).as_str())
    );

    let history = history_lines(&handle);
    assert_eq!(history.len(), 1);
    assert_eq!(history[0]["event"], "WIRING_PERSISTED");
}

#[tokio::test]
async fn legacy_profile_generates_minimal_snapshot() {
    let dir = tempfile::tempdir().expect("tempdir");
    let handle = run_in(dir.path());

    let resolved = resolve_operator_wiring(
        &handle,
        &WiringOptions {
            legacy_profile: Some("curc_default".to_string()),
            ..Default::default()
        },
    )
    .expect("resolves");

    assert_eq!(resolved.source, WiringSource::LegacyProfile);

    // The generated snapshot parses as a valid wiring config with the
    // four default instances.
    let snapshot_path = handle.snapshot_dir().join("operators.yaml");
    let config = matterstack_core::config::operators::load_operators_config(&snapshot_path)
        .expect("generated snapshot is valid");
    let keys: Vec<&str> = config.operators.keys().map(String::as_str).collect();
    assert_eq!(
        keys,
        vec![
            "experiment.default",
            "hpc.default",
            "human.default",
            "local.default"
        ]
    );
}

#[tokio::test]
async fn combining_legacy_inputs_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let handle = run_in(dir.path());
    let hpc_yaml = dir.path().join("cluster.yaml");
    std::fs::write(&hpc_yaml, "partition: amilan\n").expect("write");

    let err = resolve_operator_wiring(
        &handle,
        &WiringOptions {
            legacy_profile: Some("p".to_string()),
            legacy_hpc_config: Some(hpc_yaml),
            ..Default::default()
        },
    )
    .unwrap_err();
    assert!(matches!(err, EngineError::Config(_)));
}

#[tokio::test]
async fn nothing_resolves_to_none() {
    let dir = tempfile::tempdir().expect("tempdir");
    let handle = run_in(dir.path());

    let resolved =
        resolve_operator_wiring(&handle, &WiringOptions::default()).expect("resolves");
    assert_eq!(resolved.source, WiringSource::None);
    assert!(!resolved.is_persisted);
    assert!(resolved.snapshot_path.is_none());

    assert_eq!(
        format_wiring_explain_line(&handle.root_path),
        "Operator wiring: none/unknown"
    );
}

#[tokio::test]
async fn explain_line_reports_provenance() {
    let dir = tempfile::tempdir().expect("tempdir");
    let handle = run_in(dir.path());

    let cli_path = dir.path().join("operators.yaml");
    std::fs::write(&cli_path, WIRING_A).expect("write wiring");
    resolve_operator_wiring(
        &handle,
        &WiringOptions {
            cli_operators_config: Some(cli_path),
            ..Default::default()
        },
    )
    .expect("resolves");

    let line = format_wiring_explain_line(&handle.root_path);
    assert!(line.starts_with("Operator wiring: source=CLI_OVERRIDE, sha256="));
    assert!(line.ends_with("snapshot=operators_snapshot/operators.yaml"));
}
