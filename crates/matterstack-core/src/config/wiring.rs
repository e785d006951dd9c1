//! Operator-wiring resolution.
//!
//! Binds a run to a specific, content-hashed snapshot of operator
//! definitions and refuses silent substitution. The snapshot lives at
//! `<run_root>/operators_snapshot/`:
//!
//! - `operators.yaml` -- verbatim bytes of the effective wiring.
//! - `metadata.json`  -- provenance (source, resolved path, sha256).
//! - `history.jsonl`  -- append-only event log.
//!
//! Resolution precedence (highest first): CLI explicit path, existing run
//! snapshot, workspace default, `MATTERSTACK_OPERATORS_CONFIG`, legacy
//! profile/HPC-config fallback (which generates a minimal snapshot).

use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::EngineError;
use crate::run::RunHandle;

pub const ENV_OPERATORS_CONFIG: &str = "MATTERSTACK_OPERATORS_CONFIG";

const SNAPSHOT_DIR: &str = "operators_snapshot";
const SNAPSHOT_YAML: &str = "operators.yaml";
const METADATA_JSON: &str = "metadata.json";
const HISTORY_JSONL: &str = "history.jsonl";

/// Where the effective wiring came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WiringSource {
    CliOverride,
    RunPersisted,
    WorkspaceDefault,
    EnvVar,
    LegacyProfile,
    LegacyHpcConfig,
    None,
}

impl fmt::Display for WiringSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::CliOverride => "CLI_OVERRIDE",
            Self::RunPersisted => "RUN_PERSISTED",
            Self::WorkspaceDefault => "WORKSPACE_DEFAULT",
            Self::EnvVar => "ENV_VAR",
            Self::LegacyProfile => "LEGACY_PROFILE",
            Self::LegacyHpcConfig => "LEGACY_HPC_CONFIG",
            Self::None => "NONE",
        };
        f.write_str(s)
    }
}

/// Result of resolving operator wiring for a run.
#[derive(Debug, Clone)]
pub struct ResolvedWiring {
    pub source: WiringSource,
    /// Origin path that produced the snapshot (CLI/workspace/env), or the
    /// snapshot itself for RUN_PERSISTED resolutions.
    pub resolved_path: Option<PathBuf>,
    pub sha256: Option<String>,
    /// Authoritative path used to build the operator registry.
    pub snapshot_path: Option<PathBuf>,
    pub is_persisted: bool,
    pub warnings: Vec<String>,
}

/// Inputs to wiring resolution, mostly CLI flags.
#[derive(Debug, Clone, Default)]
pub struct WiringOptions {
    pub cli_operators_config: Option<PathBuf>,
    pub force_override: bool,
    /// Workspaces root for the workspace-default lookup.
    pub workspace_base: Option<PathBuf>,
    pub legacy_hpc_config: Option<PathBuf>,
    pub legacy_profile: Option<String>,
}

/// Lightweight provenance view from `metadata.json`, for diagnostics.
/// Missing or malformed files yield `None`, never an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WiringProvenance {
    pub source: String,
    pub sha256: Option<String>,
    pub snapshot_relpath: Option<String>,
    pub resolved_path: Option<String>,
    pub created_at_utc: Option<String>,
}

pub fn load_wiring_provenance(run_root: &Path) -> Option<WiringProvenance> {
    let meta_path = run_root.join(SNAPSHOT_DIR).join(METADATA_JSON);
    let text = std::fs::read_to_string(meta_path).ok()?;
    let payload: serde_json::Value = serde_json::from_str(&text).ok()?;

    let effective = payload.get("effective")?.as_object()?;
    let source = effective.get("source")?.as_str()?.to_string();

    let get_str = |map: &serde_json::Map<String, serde_json::Value>, key: &str| {
        map.get(key)
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    };

    Some(WiringProvenance {
        source,
        sha256: get_str(effective, "sha256"),
        snapshot_relpath: get_str(effective, "snapshot_relpath"),
        resolved_path: get_str(effective, "resolved_path"),
        created_at_utc: payload
            .get("created_at_utc")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
    })
}

/// One stable, human-readable line for `matterstack explain`.
pub fn format_wiring_explain_line(run_root: &Path) -> String {
    match load_wiring_provenance(run_root) {
        Some(prov) => match (&prov.sha256, &prov.snapshot_relpath) {
            (Some(sha), Some(relpath)) => format!(
                "Operator wiring: source={}, sha256={sha}, snapshot={relpath}",
                prov.source
            ),
            _ => "Operator wiring: none/unknown".to_string(),
        },
        None => "Operator wiring: none/unknown".to_string(),
    }
}

fn utc_now_iso() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

struct SnapshotPaths {
    dir: PathBuf,
    yaml: PathBuf,
    metadata: PathBuf,
    history: PathBuf,
}

fn snapshot_paths(run_root: &Path) -> SnapshotPaths {
    let dir = run_root.join(SNAPSHOT_DIR);
    SnapshotPaths {
        yaml: dir.join(SNAPSHOT_YAML),
        metadata: dir.join(METADATA_JSON),
        history: dir.join(HISTORY_JSONL),
        dir,
    }
}

fn append_history(
    paths: &SnapshotPaths,
    event: &str,
    source: WiringSource,
    sha256: Option<&str>,
    resolved_path: Option<&str>,
    details: serde_json::Value,
) -> Result<(), EngineError> {
    std::fs::create_dir_all(&paths.dir).map_err(|e| EngineError::io(&paths.dir, e))?;

    // serde_json maps sort keys, so every line is stably ordered.
    let line = serde_json::json!({
        "at_utc": utc_now_iso(),
        "event": event,
        "source": source.to_string(),
        "sha256": sha256,
        "resolved_path": resolved_path,
        "snapshot_relpath": format!("{SNAPSHOT_DIR}/{SNAPSHOT_YAML}"),
        "details": details,
    });

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&paths.history)
        .map_err(|e| EngineError::io(&paths.history, e))?;
    writeln!(file, "{line}").map_err(|e| EngineError::io(&paths.history, e))?;
    Ok(())
}

struct MetadataContext<'a> {
    run_handle: &'a RunHandle,
    options: &'a WiringOptions,
}

fn write_metadata(
    paths: &SnapshotPaths,
    ctx: &MetadataContext<'_>,
    source: WiringSource,
    resolved_path: Option<&str>,
    sha256: Option<&str>,
) -> Result<(), EngineError> {
    // Keep the original created_at when re-writing existing metadata.
    let created_at = std::fs::read_to_string(&paths.metadata)
        .ok()
        .and_then(|text| serde_json::from_str::<serde_json::Value>(&text).ok())
        .and_then(|v| {
            v.get("created_at_utc")
                .and_then(|c| c.as_str())
                .map(|s| s.to_string())
        })
        .unwrap_or_else(utc_now_iso);

    let payload = serde_json::json!({
        "schema_version": 1,
        "created_at_utc": created_at,
        "updated_at_utc": utc_now_iso(),
        "effective": {
            "source": source.to_string(),
            "resolved_path": resolved_path,
            "sha256": sha256,
            "snapshot_relpath": format!("{SNAPSHOT_DIR}/{SNAPSHOT_YAML}"),
        },
        "provenance": {
            "workspace_slug": ctx.run_handle.workspace_slug,
            "env_var_name": ENV_OPERATORS_CONFIG,
            "cli": {
                "operators_config": ctx.options.cli_operators_config
                    .as_ref()
                    .map(|p| p.display().to_string()),
                "force_wiring_override": ctx.options.force_override,
            },
            "legacy": {
                "profile": ctx.options.legacy_profile,
                "hpc_config": ctx.options.legacy_hpc_config
                    .as_ref()
                    .map(|p| p.display().to_string()),
            },
        },
        "history_relpath": format!("{SNAPSHOT_DIR}/{HISTORY_JSONL}"),
    });

    std::fs::create_dir_all(&paths.dir).map_err(|e| EngineError::io(&paths.dir, e))?;
    let text = serde_json::to_string_pretty(&payload)
        .map_err(|e| EngineError::Config(format!("failed to serialize wiring metadata: {e}")))?;
    std::fs::write(&paths.metadata, text + "\n")
        .map_err(|e| EngineError::io(&paths.metadata, e))?;
    Ok(())
}

fn existing_snapshot_sha256(paths: &SnapshotPaths) -> Option<String> {
    let bytes = std::fs::read(&paths.yaml).ok()?;
    Some(sha256_hex(&bytes))
}

/// Persist `snapshot_bytes` into the run snapshot (idempotent), enforcing
/// override safety. Returns the effective sha256.
#[allow(clippy::too_many_arguments)]
fn persist_snapshot_bytes(
    paths: &SnapshotPaths,
    ctx: &MetadataContext<'_>,
    source: WiringSource,
    resolved_path: Option<&str>,
    snapshot_bytes: &[u8],
    allow_override: bool,
) -> Result<String, EngineError> {
    std::fs::create_dir_all(&paths.dir).map_err(|e| EngineError::io(&paths.dir, e))?;

    let desired_sha = sha256_hex(snapshot_bytes);
    let existing_sha = existing_snapshot_sha256(paths);

    if let Some(existing) = existing_sha.as_deref() {
        if existing != desired_sha {
            if !allow_override {
                append_history(
                    paths,
                    "WIRING_OVERRIDE_REFUSED",
                    WiringSource::CliOverride,
                    Some(existing),
                    resolved_path,
                    serde_json::json!({
                        "attempted_sha256": desired_sha,
                        "note": "Override refused; rerun with --force-wiring-override",
                    }),
                )?;
                return Err(EngineError::WiringOverrideRefused {
                    run_root: ctx.run_handle.root_path.clone(),
                    existing_sha256: existing.to_string(),
                    attempted_sha256: desired_sha,
                });
            }

            // Forced override: overwrite snapshot + update metadata.
            std::fs::write(&paths.yaml, snapshot_bytes)
                .map_err(|e| EngineError::io(&paths.yaml, e))?;
            write_metadata(paths, ctx, source, resolved_path, Some(&desired_sha))?;
            append_history(
                paths,
                "WIRING_OVERRIDE_FORCED",
                source,
                Some(&desired_sha),
                resolved_path,
                serde_json::json!({ "prior_sha256": existing }),
            )?;
            return Ok(desired_sha);
        }

        // Bytes already match; reconstruct metadata/history if missing
        // (older or partially-written runs).
        if !paths.metadata.is_file() {
            let snap_path = paths.yaml.display().to_string();
            write_metadata(
                paths,
                ctx,
                WiringSource::RunPersisted,
                Some(&snap_path),
                Some(&desired_sha),
            )?;
            append_history(
                paths,
                "WIRING_PERSISTED",
                WiringSource::RunPersisted,
                Some(&desired_sha),
                Some(&snap_path),
                serde_json::json!({
                    "note": "Reconstructed metadata/history for existing snapshot",
                }),
            )?;
        }
        return Ok(desired_sha);
    }

    // No existing snapshot: initial persistence.
    std::fs::write(&paths.yaml, snapshot_bytes).map_err(|e| EngineError::io(&paths.yaml, e))?;
    write_metadata(paths, ctx, source, resolved_path, Some(&desired_sha))?;
    append_history(
        paths,
        "WIRING_PERSISTED",
        source,
        Some(&desired_sha),
        resolved_path,
        serde_json::json!({ "note": "Initial persistence" }),
    )?;
    Ok(desired_sha)
}

/// Generate a minimal operators.yaml from legacy CLI inputs.
fn generate_legacy_snapshot(
    options: &WiringOptions,
) -> Result<(WiringSource, String, Vec<u8>), EngineError> {
    let (source, resolved, hpc_backend) = if let Some(path) = &options.legacy_hpc_config {
        (
            WiringSource::LegacyHpcConfig,
            path.display().to_string(),
            serde_json::json!({ "type": "hpc_yaml", "path": path.display().to_string() }),
        )
    } else if let Some(profile) = &options.legacy_profile {
        (
            WiringSource::LegacyProfile,
            profile.clone(),
            serde_json::json!({ "type": "profile", "name": profile }),
        )
    } else {
        return Err(EngineError::Config(
            "legacy snapshot generation requested without legacy inputs".to_string(),
        ));
    };

    let doc = serde_json::json!({
        "operators": {
            "human.default": { "kind": "human" },
            "experiment.default": { "kind": "experiment" },
            "local.default": { "kind": "local", "backend": { "type": "local" } },
            "hpc.default": { "kind": "hpc", "backend": hpc_backend },
        }
    });

    // serde_json maps sort keys, so the generated YAML is stable for
    // hashing/provenance.
    let text = serde_yaml::to_string(&doc)
        .map_err(|e| EngineError::Config(format!("failed to render legacy snapshot: {e}")))?;
    Ok((source, resolved, text.into_bytes()))
}

fn require_file(path: &Path, what: &str) -> Result<(), EngineError> {
    if !path.is_file() {
        return Err(EngineError::Config(format!(
            "{what} file not found: {}",
            path.display()
        )));
    }
    Ok(())
}

/// Resolve operator wiring by precedence and ensure a run-local snapshot
/// exists. See the module docs for the precedence order and override
/// safety rules.
pub fn resolve_operator_wiring(
    run_handle: &RunHandle,
    options: &WiringOptions,
) -> Result<ResolvedWiring, EngineError> {
    let paths = snapshot_paths(&run_handle.root_path);
    let ctx = MetadataContext {
        run_handle,
        options,
    };
    let mut warnings = Vec::new();

    // 1) CLI override: highest precedence.
    if let Some(cli_path) = &options.cli_operators_config {
        require_file(cli_path, "CLI --operators-config")?;
        let bytes = std::fs::read(cli_path).map_err(|e| EngineError::io(cli_path, e))?;
        let resolved = cli_path
            .canonicalize()
            .unwrap_or_else(|_| cli_path.clone());
        let sha = persist_snapshot_bytes(
            &paths,
            &ctx,
            WiringSource::CliOverride,
            Some(&resolved.display().to_string()),
            &bytes,
            options.force_override,
        )?;
        return Ok(ResolvedWiring {
            source: WiringSource::CliOverride,
            resolved_path: Some(resolved),
            sha256: Some(sha),
            snapshot_path: Some(paths.yaml),
            is_persisted: true,
            warnings,
        });
    }

    // 2) Existing run snapshot.
    if paths.yaml.is_file() {
        let sha = existing_snapshot_sha256(&paths);
        if sha.is_none() {
            warnings.push(
                "failed to compute sha256 for existing run snapshot; treating as unknown"
                    .to_string(),
            );
        }
        if !paths.metadata.is_file() {
            let snap_path = paths.yaml.display().to_string();
            write_metadata(
                &paths,
                &ctx,
                WiringSource::RunPersisted,
                Some(&snap_path),
                sha.as_deref(),
            )?;
            append_history(
                &paths,
                "WIRING_PERSISTED",
                WiringSource::RunPersisted,
                sha.as_deref(),
                Some(&snap_path),
                serde_json::json!({
                    "note": "Reconstructed metadata/history for existing snapshot",
                }),
            )?;
        }
        return Ok(ResolvedWiring {
            source: WiringSource::RunPersisted,
            resolved_path: Some(paths.yaml.clone()),
            sha256: sha,
            snapshot_path: Some(paths.yaml),
            is_persisted: true,
            warnings,
        });
    }

    // 3) Workspace default.
    if let Some(base) = &options.workspace_base {
        let workspace_default = base
            .join(&run_handle.workspace_slug)
            .join("operators.yaml");
        if workspace_default.is_file() {
            let bytes = std::fs::read(&workspace_default)
                .map_err(|e| EngineError::io(&workspace_default, e))?;
            let resolved = workspace_default
                .canonicalize()
                .unwrap_or(workspace_default);
            let sha = persist_snapshot_bytes(
                &paths,
                &ctx,
                WiringSource::WorkspaceDefault,
                Some(&resolved.display().to_string()),
                &bytes,
                false,
            )?;
            return Ok(ResolvedWiring {
                source: WiringSource::WorkspaceDefault,
                resolved_path: Some(resolved),
                sha256: Some(sha),
                snapshot_path: Some(paths.yaml),
                is_persisted: true,
                warnings,
            });
        }
    }

    // 4) Env var.
    if let Ok(env_path_raw) = std::env::var(ENV_OPERATORS_CONFIG) {
        if !env_path_raw.trim().is_empty() {
            let env_path = PathBuf::from(env_path_raw);
            require_file(&env_path, &format!("env var {ENV_OPERATORS_CONFIG}"))?;
            let bytes = std::fs::read(&env_path).map_err(|e| EngineError::io(&env_path, e))?;
            let resolved = env_path.canonicalize().unwrap_or(env_path);
            let sha = persist_snapshot_bytes(
                &paths,
                &ctx,
                WiringSource::EnvVar,
                Some(&resolved.display().to_string()),
                &bytes,
                false,
            )?;
            return Ok(ResolvedWiring {
                source: WiringSource::EnvVar,
                resolved_path: Some(resolved),
                sha256: Some(sha),
                snapshot_path: Some(paths.yaml),
                is_persisted: true,
                warnings,
            });
        }
    }

    // 5) Legacy fallback -> generated snapshot.
    if options.legacy_hpc_config.is_some() || options.legacy_profile.is_some() {
        if options.legacy_hpc_config.is_some() && options.legacy_profile.is_some() {
            return Err(EngineError::Config(
                "cannot combine legacy --hpc-config and --profile; choose one".to_string(),
            ));
        }
        if let Some(path) = &options.legacy_hpc_config {
            require_file(path, "legacy --hpc-config")?;
        }

        let (source, resolved, bytes) = generate_legacy_snapshot(options)?;
        let sha = persist_snapshot_bytes(&paths, &ctx, source, Some(&resolved), &bytes, false)?;
        return Ok(ResolvedWiring {
            source,
            resolved_path: Some(PathBuf::from(resolved)),
            sha256: Some(sha),
            snapshot_path: Some(paths.yaml),
            is_persisted: true,
            warnings,
        });
    }

    // Nothing resolved.
    Ok(ResolvedWiring {
        source: WiringSource::None,
        resolved_path: None,
        sha256: None,
        snapshot_path: None,
        is_persisted: false,
        warnings,
    })
}
