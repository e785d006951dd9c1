//! `operators.yaml` parsing and validation.
//!
//! The file shape:
//!
//! ```yaml
//! operators:
//!   hpc.default:
//!     kind: hpc
//!     backend:
//!       type: slurm
//!       workspace_root: /scratch/...
//!       ssh: {host: ..., user: ..., key_path: ...}
//!       slurm: {...}
//!   human.default:
//!     kind: human
//! ```
//!
//! Keys must be canonical (`kind.name`), the declared `kind` must match
//! the key's prefix, compute kinds default to a local backend, and
//! non-compute kinds must not declare one. Unknown fields are rejected.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::operator::keys::{normalize_operator_key, split_operator_key};

/// Operator kind; the prefix of the canonical key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperatorKind {
    Hpc,
    Local,
    Human,
    Experiment,
}

impl OperatorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hpc => "hpc",
            Self::Local => "local",
            Self::Human => "human",
            Self::Experiment => "experiment",
        }
    }

    pub fn is_compute(self) -> bool {
        matches!(self, Self::Hpc | Self::Local)
    }
}

/// SSH connection settings for remote backends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SshConfig {
    pub host: String,
    pub user: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default)]
    pub key_path: Option<String>,
}

fn default_ssh_port() -> u16 {
    22
}

/// Inline config for the local subprocess backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LocalBackendConfig {
    /// Defaults to the run root so evidence stays under the run.
    #[serde(default)]
    pub workspace_root: Option<String>,
    #[serde(default)]
    pub dry_run: bool,
}

/// Inline config for a Slurm-over-SSH backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SlurmBackendConfig {
    pub workspace_root: String,
    pub ssh: SshConfig,
    #[serde(default)]
    pub slurm: BTreeMap<String, serde_json::Value>,
}

/// Backend referencing a named execution profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfileBackendConfig {
    pub name: String,
}

/// Backend referencing a legacy HPC YAML file (migration path).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HpcYamlBackendConfig {
    pub path: String,
}

/// Compute backend configuration, discriminated on `type`.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendConfig {
    Local(LocalBackendConfig),
    Slurm(SlurmBackendConfig),
    Profile(ProfileBackendConfig),
    HpcYaml(HpcYamlBackendConfig),
}

impl BackendConfig {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Local(_) => "local",
            Self::Slurm(_) => "slurm",
            Self::Profile(_) => "profile",
            Self::HpcYaml(_) => "hpc_yaml",
        }
    }

    /// Parse a raw YAML mapping with a `type` discriminator, enforcing
    /// per-type unknown-field rejection.
    fn from_yaml(value: serde_yaml::Value, context: &str) -> Result<Self, EngineError> {
        let serde_yaml::Value::Mapping(mut map) = value else {
            return Err(EngineError::Config(format!(
                "{context}: backend must be a mapping"
            )));
        };

        let type_key = serde_yaml::Value::String("type".to_string());
        let backend_type = match map.remove(&type_key) {
            Some(serde_yaml::Value::String(s)) => s,
            Some(_) => {
                return Err(EngineError::Config(format!(
                    "{context}: backend.type must be a string"
                )))
            }
            None => {
                return Err(EngineError::Config(format!(
                    "{context}: backend is missing required field 'type'"
                )))
            }
        };

        let rest = serde_yaml::Value::Mapping(map);
        let invalid = |e: serde_yaml::Error| {
            EngineError::Config(format!("{context}: invalid backend config: {e}"))
        };

        match backend_type.as_str() {
            "local" => Ok(Self::Local(serde_yaml::from_value(rest).map_err(invalid)?)),
            "slurm" => Ok(Self::Slurm(serde_yaml::from_value(rest).map_err(invalid)?)),
            "profile" => Ok(Self::Profile(
                serde_yaml::from_value(rest).map_err(invalid)?,
            )),
            "hpc_yaml" => Ok(Self::HpcYaml(
                serde_yaml::from_value(rest).map_err(invalid)?,
            )),
            other => Err(EngineError::Config(format!(
                "{context}: unknown backend type {other:?} \
                 (expected local, slurm, profile, or hpc_yaml)"
            ))),
        }
    }
}

/// Validated config for one operator instance.
#[derive(Debug, Clone, PartialEq)]
pub struct OperatorInstanceConfig {
    pub kind: OperatorKind,
    /// Present exactly for compute kinds; defaults to a local backend.
    pub backend: Option<BackendConfig>,
    pub slug: Option<String>,
    pub operator_name: Option<String>,
}

/// Raw per-instance shape before semantic validation.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawInstance {
    kind: OperatorKind,
    #[serde(default)]
    backend: Option<serde_yaml::Value>,
    #[serde(default)]
    slug: Option<String>,
    #[serde(default)]
    operator_name: Option<String>,
    /// Reserved for experiment API settings; accepted and preserved only
    /// in shape, unused by the current operators.
    #[serde(default)]
    #[allow(dead_code)]
    api: Option<BTreeMap<String, serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawFile {
    operators: BTreeMap<String, serde_yaml::Value>,
}

/// Parsed and validated `operators.yaml`.
#[derive(Debug, Clone)]
pub struct OperatorsConfig {
    /// Canonical operator key -> validated instance config.
    pub operators: BTreeMap<String, OperatorInstanceConfig>,
    /// The file that produced this config (for error messages).
    pub path: PathBuf,
}

/// Parse `operators.yaml` content.
pub fn parse_operators_config_str(
    text: &str,
    path: &Path,
) -> Result<OperatorsConfig, EngineError> {
    let raw: RawFile = serde_yaml::from_str(text).map_err(|e| {
        EngineError::Config(format!("{}: failed to parse operators.yaml: {e}", path.display()))
    })?;

    let mut operators = BTreeMap::new();

    for (raw_key, raw_value) in raw.operators {
        let display = path.display();

        if raw_key != raw_key.trim() {
            return Err(EngineError::Config(format!(
                "{display}: operator key has leading/trailing whitespace: {raw_key:?}"
            )));
        }
        if raw_key.to_ascii_lowercase() != raw_key {
            return Err(EngineError::Config(format!(
                "{display}: operator key must be lowercase canonical form: {raw_key:?}"
            )));
        }

        let key = normalize_operator_key(&raw_key).map_err(|e| {
            EngineError::Config(format!("{display}: invalid operator key {raw_key:?}: {e}"))
        })?;
        let (key_kind, _name) = split_operator_key(&key)?;

        let instance: RawInstance = serde_yaml::from_value(raw_value).map_err(|e| {
            EngineError::Config(format!(
                "{display}: invalid config for operators.{key}: {e}"
            ))
        })?;

        if instance.kind.as_str() != key_kind {
            return Err(EngineError::Config(format!(
                "{display}: operators.{key}: key kind {key_kind:?} does not match config kind {:?}",
                instance.kind.as_str()
            )));
        }

        let backend = match instance.backend {
            Some(value) => Some(BackendConfig::from_yaml(
                value,
                &format!("{display}: operators.{key}"),
            )?),
            None => None,
        };

        let backend = if instance.kind.is_compute() {
            if let Some(BackendConfig::HpcYaml(_)) = &backend {
                if instance.kind != OperatorKind::Hpc {
                    return Err(EngineError::Config(format!(
                        "{display}: operators.{key}: backend.type='hpc_yaml' is only valid for kind='hpc'"
                    )));
                }
            }
            Some(backend.unwrap_or(BackendConfig::Local(LocalBackendConfig::default())))
        } else {
            if backend.is_some() {
                return Err(EngineError::Config(format!(
                    "{display}: operators.{key}: kind {:?} must not define 'backend'",
                    instance.kind.as_str()
                )));
            }
            None
        };

        operators.insert(
            key,
            OperatorInstanceConfig {
                kind: instance.kind,
                backend,
                slug: instance.slug,
                operator_name: instance.operator_name,
            },
        );
    }

    Ok(OperatorsConfig {
        operators,
        path: path.to_path_buf(),
    })
}

/// Load and validate `operators.yaml` from disk.
pub fn load_operators_config(path: &Path) -> Result<OperatorsConfig, EngineError> {
    if !path.is_file() {
        return Err(EngineError::Config(format!(
            "{}: file not found",
            path.display()
        )));
    }
    let text =
        std::fs::read_to_string(path).map_err(|e| EngineError::io(path.to_path_buf(), e))?;
    parse_operators_config_str(&text, path)
}
