//! Engine-level error taxonomy.
//!
//! Store-layer errors pass through; lock contention keeps its own variant
//! so the multi-run scheduler can skip a busy run without string matching.

use std::path::PathBuf;

use thiserror::Error;

use matterstack_db::StoreError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("could not acquire run lock at {path}")]
    LockBusy { path: PathBuf },

    #[error("{what} {id} not found")]
    NotFound { what: &'static str, id: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(
        "refusing to override persisted operator wiring for this run \
         (existing sha256 {existing_sha256}, attempted {attempted_sha256}); \
         re-run with --force-wiring-override to replace the run snapshot"
    )]
    WiringOverrideRefused {
        run_root: PathBuf,
        existing_sha256: String,
        attempted_sha256: String,
    },

    #[error("campaign error: {0}")]
    Campaign(#[source] anyhow::Error),

    #[error(transparent)]
    Store(StoreError),

    #[error("io error at {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::LockBusy { path } => Self::LockBusy { path },
            other => Self::Store(other),
        }
    }
}

impl EngineError {
    /// Helper for io errors with path context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_busy_converts_from_store() {
        let err: EngineError = StoreError::LockBusy {
            path: PathBuf::from("/r/state.sqlite.lock"),
        }
        .into();
        assert!(matches!(err, EngineError::LockBusy { .. }));
    }

    #[test]
    fn other_store_errors_pass_through() {
        let err: EngineError = StoreError::Conflict("dup".to_string()).into();
        assert!(matches!(err, EngineError::Store(StoreError::Conflict(_))));
    }
}
