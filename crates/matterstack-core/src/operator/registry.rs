//! Operator registry: canonical key -> operator instance.
//!
//! Built per run from the wiring snapshot. Dispatch lookups accept both
//! canonical keys and legacy routing strings ("HPC", "Human", ...).

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::operators::{BackendConfig, OperatorKind, OperatorsConfig};
use crate::error::EngineError;
use crate::operator::experiment::ExperimentOperator;
use crate::operator::human::HumanOperator;
use crate::operator::keys::legacy_operator_type_to_key;
use crate::operator::local::ComputeOperator;
use crate::operator::Operator;
use crate::run::RunHandle;

/// The operator set bound to one run.
#[derive(Default)]
pub struct OperatorRegistry {
    operators: BTreeMap<String, Arc<dyn Operator>>,
}

impl OperatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the four default instances over local execution,
    /// used when no wiring is configured but an operator is requested.
    pub fn local_defaults() -> Self {
        let mut registry = Self::new();
        registry.insert("human.default", Arc::new(HumanOperator::new()));
        registry.insert("experiment.default", Arc::new(ExperimentOperator::new()));
        registry.insert(
            "local.default",
            Arc::new(ComputeOperator::local("Local", false)),
        );
        registry.insert("hpc.default", Arc::new(ComputeOperator::local("HPC", false)));
        registry
    }

    /// Build operator instances from a validated wiring config.
    ///
    /// Backend types that need infrastructure this build does not carry
    /// (slurm/profile/hpc_yaml remotes) are skipped with a warning; a task
    /// routed to such a key fails at dispatch rather than bricking the
    /// whole run.
    pub fn from_config(
        _run: &RunHandle,
        config: &OperatorsConfig,
    ) -> Result<Self, EngineError> {
        let mut registry = Self::new();

        for (key, instance) in &config.operators {
            let display_name = instance.operator_name.clone().unwrap_or_else(|| {
                match instance.kind {
                    OperatorKind::Hpc => "HPC".to_string(),
                    OperatorKind::Local => "Local".to_string(),
                    OperatorKind::Human => "Human".to_string(),
                    OperatorKind::Experiment => "Experiment".to_string(),
                }
            });

            let operator: Arc<dyn Operator> = match instance.kind {
                OperatorKind::Human => Arc::new(HumanOperator::new()),
                OperatorKind::Experiment => Arc::new(ExperimentOperator::new()),
                OperatorKind::Hpc | OperatorKind::Local => match &instance.backend {
                    Some(BackendConfig::Local(local)) => {
                        Arc::new(ComputeOperator::local(display_name, local.dry_run))
                    }
                    Some(other) => {
                        tracing::warn!(
                            operator_key = %key,
                            backend = other.type_name(),
                            "backend type is not available in this build, skipping operator"
                        );
                        continue;
                    }
                    // Config validation guarantees compute kinds carry a
                    // backend.
                    None => {
                        return Err(EngineError::Config(format!(
                            "operators.{key}: compute operator missing backend"
                        )))
                    }
                },
            };

            registry.insert(key, operator);
        }

        Ok(registry)
    }

    pub fn insert(&mut self, key: impl Into<String>, operator: Arc<dyn Operator>) {
        self.operators.insert(key.into(), operator);
    }

    pub fn get(&self, key: &str) -> Option<&Arc<dyn Operator>> {
        self.operators.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.operators.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.operators.is_empty()
    }

    /// Resolve a requested routing string to a registered operator.
    ///
    /// Tries the canonical form first, then the raw string for registries
    /// keyed by legacy names. Returns the key that matched.
    pub fn resolve_for_dispatch(
        &self,
        requested: &str,
    ) -> Option<(String, Arc<dyn Operator>)> {
        let mut candidates: Vec<String> = Vec::with_capacity(2);
        if let Some(canonical) = legacy_operator_type_to_key(Some(requested)) {
            candidates.push(canonical);
        }
        candidates.push(requested.trim().to_string());

        for candidate in candidates {
            if let Some(operator) = self.operators.get(&candidate) {
                return Some((candidate, Arc::clone(operator)));
            }
        }
        None
    }
}
