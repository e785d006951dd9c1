//! Run- and operator-level configuration.

pub mod operators;
pub mod wiring;

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Default execution mode when `config.json` is absent: a local-testing
/// shortcut that marks compute tasks COMPLETED without creating attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionMode {
    #[default]
    Simulation,
    Local,
    #[serde(rename = "HPC")]
    Hpc,
}

/// Per-run execution config, read from `<run_root>/config.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub max_hpc_jobs_per_run: u32,
    pub execution_mode: ExecutionMode,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_hpc_jobs_per_run: 10,
            execution_mode: ExecutionMode::Simulation,
        }
    }
}

impl RunConfig {
    /// Load the run config, tolerating a missing or malformed file (both
    /// fall back to defaults with a warning, matching the engine's
    /// keep-ticking posture).
    pub fn load(run_root: &Path) -> Self {
        let path = run_root.join("config.json");
        if !path.is_file() {
            return Self::default();
        }

        match std::fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!(
                        config = %path.display(),
                        error = %e,
                        "failed to parse config.json, using defaults"
                    );
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!(
                    config = %path.display(),
                    error = %e,
                    "failed to read config.json, using defaults"
                );
                Self::default()
            }
        }
    }

    /// Write the config to `<run_root>/config.json`.
    pub fn save(&self, run_root: &Path) -> std::io::Result<()> {
        let path = run_root.join("config.json");
        let text = serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string());
        std::fs::write(path, text + "\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_missing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = RunConfig::load(dir.path());
        assert_eq!(config.max_hpc_jobs_per_run, 10);
        assert_eq!(config.execution_mode, ExecutionMode::Simulation);
    }

    #[test]
    fn partial_config_fills_in_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("config.json"),
            r#"{"max_hpc_jobs_per_run": 2}"#,
        )
        .expect("write");

        let config = RunConfig::load(dir.path());
        assert_eq!(config.max_hpc_jobs_per_run, 2);
        assert_eq!(config.execution_mode, ExecutionMode::Simulation);
    }

    #[test]
    fn malformed_config_falls_back() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("config.json"), "not json").expect("write");
        let config = RunConfig::load(dir.path());
        assert_eq!(config.max_hpc_jobs_per_run, 10);
    }

    #[test]
    fn execution_mode_uses_wire_names() {
        let config: RunConfig =
            serde_json::from_str(r#"{"execution_mode": "HPC"}"#).expect("parse");
        assert_eq!(config.execution_mode, ExecutionMode::Hpc);

        let config: RunConfig =
            serde_json::from_str(r#"{"execution_mode": "Local"}"#).expect("parse");
        assert_eq!(config.execution_mode, ExecutionMode::Local);
    }
}
