//! The campaign contract: user-supplied plan/analyze logic.
//!
//! A campaign drives a run forward through repeated cycles: the engine
//! calls `plan` to get the next workflow, executes it, then hands the
//! aggregated results to `analyze` which returns the updated campaign
//! state. `plan` returning `None` completes the run.
//!
//! Campaigns are registered at build time in a [`CampaignRegistry`] keyed
//! by workspace slug; state is opaque JSON persisted by the engine at
//! `<run_root>/campaign_state.json` between calls.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use matterstack_db::models::TaskStatus;
use matterstack_db::workflow::Workflow;

/// Opaque campaign state. The engine round-trips it; only the campaign
/// interprets it.
pub type CampaignState = serde_json::Value;

/// Per-task outcome handed to `analyze`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResultEntry {
    pub status: TaskStatus,
    /// Collected output files (name -> path), when the attempt produced any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files: Option<BTreeMap<String, String>>,
    /// Collected structured output.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<BTreeMap<String, serde_json::Value>>,
}

/// task_id -> outcome, for every task in the run.
pub type RunResults = BTreeMap<String, TaskResultEntry>;

/// User-supplied campaign logic.
///
/// Errors from either method abort the tick and propagate to the caller;
/// the run's persisted status is left unchanged.
pub trait Campaign: Send + Sync {
    /// Produce the next workflow for the given state, or `None` when the
    /// campaign has no further work.
    fn plan(&self, state: Option<&CampaignState>) -> Result<Option<Workflow>>;

    /// Digest results and return the next campaign state.
    fn analyze(
        &self,
        state: Option<CampaignState>,
        results: &RunResults,
    ) -> Result<Option<CampaignState>>;
}

/// Build-time campaign table keyed by workspace slug.
#[derive(Default)]
pub struct CampaignRegistry {
    campaigns: BTreeMap<String, Arc<dyn Campaign>>,
}

impl CampaignRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, slug: impl Into<String>, campaign: Arc<dyn Campaign>) {
        self.campaigns.insert(slug.into(), campaign);
    }

    pub fn get(&self, slug: &str) -> Option<Arc<dyn Campaign>> {
        self.campaigns.get(slug).cloned()
    }

    pub fn slugs(&self) -> impl Iterator<Item = &str> {
        self.campaigns.keys().map(String::as_str)
    }
}
