//! Built-in campaign table.
//!
//! Campaigns are compiled into the binary and registered here by
//! workspace slug. Downstream deployments add their own entries to this
//! table (or wrap the engine crate with their own binary).

use std::sync::Arc;

use anyhow::Result;

use matterstack_core::campaign::{Campaign, CampaignRegistry, CampaignState, RunResults};
use matterstack_db::models::TaskStatus;
use matterstack_db::workflow::{Task, Workflow};

/// Build the registry of campaigns this binary knows about.
pub fn builtin_campaigns() -> CampaignRegistry {
    let mut registry = CampaignRegistry::new();
    registry.register("demo", Arc::new(ScreeningDemoCampaign::new(3)));
    registry.register("self_test", Arc::new(ScreeningDemoCampaign::new(2)));
    registry
}

/// Demo screening campaign: one batch of candidate evaluations, then an
/// analysis pass that records which candidates finished.
///
/// Tasks run in simulation mode by default, so the demo completes on any
/// machine with no wiring configured.
pub struct ScreeningDemoCampaign {
    candidates: usize,
}

impl ScreeningDemoCampaign {
    pub fn new(candidates: usize) -> Self {
        Self { candidates }
    }
}

impl Campaign for ScreeningDemoCampaign {
    fn plan(&self, state: Option<&CampaignState>) -> Result<Option<Workflow>> {
        // One screening batch per run: a prior state means we are done.
        if state.is_some() {
            return Ok(None);
        }

        let mut workflow = Workflow::new();
        for index in 0..self.candidates {
            let mut task = Task::with_id(
                format!("screen_candidate_{index}"),
                "ubuntu:22.04",
                format!("echo evaluating candidate {index}"),
            );
            task.env.insert(
                "MATTERSTACK_OPERATOR".to_string(),
                "Simulation".to_string(),
            );
            workflow.add_task(task)?;
        }
        Ok(Some(workflow))
    }

    fn analyze(
        &self,
        _state: Option<CampaignState>,
        results: &RunResults,
    ) -> Result<Option<CampaignState>> {
        let completed: Vec<&str> = results
            .iter()
            .filter(|(_, entry)| entry.status == TaskStatus::Completed)
            .map(|(task_id, _)| task_id.as_str())
            .collect();

        Ok(Some(serde_json::json!({
            "screened": results.len(),
            "completed": completed,
        })))
    }
}
