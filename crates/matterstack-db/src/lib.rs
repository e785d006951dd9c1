//! Per-run state persistence for matterstack.
//!
//! Each run owns a single embedded SQLite database at
//! `<run_root>/state.sqlite` holding the run row, its tasks, and the
//! append-only attempt history. Cross-process coordination uses an OS-level
//! advisory file lock on `<run_root>/state.sqlite.lock` -- never an
//! in-process mutex, so independent scheduler processes compose correctly.

pub mod ids;
pub mod lock;
pub mod models;
pub mod store;
pub mod workflow;

pub use lock::RunLock;
pub use store::{StateStore, StoreError};
