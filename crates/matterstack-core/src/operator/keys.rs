//! Canonical operator keys.
//!
//! An operator instance is addressed by `kind.name`: kind starts with a
//! lowercase letter followed by `[a-z0-9_]`, name starts with `[a-z0-9]`
//! followed by `[a-z0-9_.-]`. `..` is rejected to keep hierarchical names
//! unambiguous. Legacy routing strings ("HPC", "Human", ...) map onto
//! `<kind>.default`.

use matterstack_db::models::TaskAttempt;

use crate::error::EngineError;

/// Legacy operator_type -> canonical key mapping.
const LEGACY_OPERATOR_TYPES: &[(&str, &str)] = &[
    ("hpc", "hpc.default"),
    ("local", "local.default"),
    ("human", "human.default"),
    ("experiment", "experiment.default"),
];

/// Check whether `value` is a canonical operator key.
pub fn is_canonical_operator_key(value: &str) -> bool {
    if value.contains("..") {
        return false;
    }

    let Some((kind, name)) = value.split_once('.') else {
        return false;
    };

    let kind_ok = kind
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_lowercase())
        && kind
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');

    let name_ok = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '.' | '-'));

    kind_ok && name_ok
}

/// Normalize and validate a canonical operator key: trims, lowercases,
/// rejects internal whitespace and `..`.
pub fn normalize_operator_key(value: &str) -> Result<String, EngineError> {
    let raw = value.trim().to_ascii_lowercase();

    if raw.is_empty() {
        return Err(EngineError::Config("operator_key is empty".to_string()));
    }
    if raw.chars().any(char::is_whitespace) {
        return Err(EngineError::Config(format!(
            "operator_key must not contain whitespace: {value:?}"
        )));
    }
    if raw.contains("..") {
        return Err(EngineError::Config(format!(
            "operator_key must not contain '..': {value:?}"
        )));
    }
    if !is_canonical_operator_key(&raw) {
        return Err(EngineError::Config(format!(
            "operator_key must match kind.name with allowed characters; got {value:?}"
        )));
    }

    Ok(raw)
}

/// Split a canonical key into `(kind, name)` at the first dot.
pub fn split_operator_key(key: &str) -> Result<(String, String), EngineError> {
    let normalized = normalize_operator_key(key)?;
    let (kind, name) = normalized
        .split_once('.')
        .ok_or_else(|| EngineError::Config(format!("operator_key missing kind or name: {key:?}")))?;
    Ok((kind.to_string(), name.to_string()))
}

/// Convert a legacy operator_type to a canonical key. Already-canonical
/// strings normalize through unchanged.
pub fn legacy_operator_type_to_key(operator_type: Option<&str>) -> Option<String> {
    let raw = operator_type?.trim();
    if raw.is_empty() {
        return None;
    }

    let lowered = raw.to_ascii_lowercase();
    if is_canonical_operator_key(&lowered) {
        return normalize_operator_key(&lowered).ok();
    }

    LEGACY_OPERATOR_TYPES
        .iter()
        .find(|(legacy, _)| *legacy == lowered)
        .map(|(_, key)| key.to_string())
}

/// Where a resolved attempt key came from, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedOperatorKey {
    pub operator_key: String,
    pub source: &'static str,
}

/// Resolve the canonical operator key for an attempt.
///
/// Precedence: the `operator_key` column, then an `operator_key` recorded
/// in `operator_data` (transitional rows), then the legacy
/// `operator_type` mapping. Invalid values are treated as absent.
pub fn resolve_operator_key_for_attempt(attempt: &TaskAttempt) -> Option<ResolvedOperatorKey> {
    if let Some(key) = attempt.operator_key.as_deref() {
        if let Ok(normalized) = normalize_operator_key(key) {
            return Some(ResolvedOperatorKey {
                operator_key: normalized,
                source: "attempt.operator_key",
            });
        }
    }

    if let Some(serde_json::Value::String(key)) = attempt.operator_data.0.extra.get("operator_key")
    {
        if let Ok(normalized) = normalize_operator_key(key) {
            return Some(ResolvedOperatorKey {
                operator_key: normalized,
                source: "attempt.operator_data.operator_key",
            });
        }
    }

    legacy_operator_type_to_key(attempt.operator_type.as_deref()).map(|key| ResolvedOperatorKey {
        operator_key: key,
        source: "attempt.operator_type",
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_keys_accepted() {
        for key in [
            "hpc.default",
            "local.dev",
            "human.gate_1",
            "experiment.lab-a",
            "hpc.cluster_a.dev",
        ] {
            assert!(is_canonical_operator_key(key), "{key} should be canonical");
        }
    }

    #[test]
    fn invalid_keys_rejected() {
        for key in [
            "",
            "hpc",
            "HPC.default",
            "hpc..default",
            ".default",
            "hpc.",
            "1hpc.default",
            "hpc.-bad",
            "hpc .default",
        ] {
            assert!(!is_canonical_operator_key(key), "{key:?} should be invalid");
        }
    }

    #[test]
    fn normalize_lowercases_and_trims() {
        assert_eq!(
            normalize_operator_key("  HPC.Default  ").expect("valid"),
            "hpc.default"
        );
    }

    #[test]
    fn normalize_rejects_inner_whitespace() {
        assert!(normalize_operator_key("hpc. default").is_err());
    }

    #[test]
    fn split_returns_kind_and_name() {
        let (kind, name) = split_operator_key("hpc.cluster_a.dev").expect("valid");
        assert_eq!(kind, "hpc");
        assert_eq!(name, "cluster_a.dev");
    }

    #[test]
    fn legacy_types_map_to_default_instances() {
        assert_eq!(
            legacy_operator_type_to_key(Some("HPC")).as_deref(),
            Some("hpc.default")
        );
        assert_eq!(
            legacy_operator_type_to_key(Some("Human")).as_deref(),
            Some("human.default")
        );
        assert_eq!(legacy_operator_type_to_key(Some("Robot")), None);
        assert_eq!(legacy_operator_type_to_key(None), None);
    }

    #[test]
    fn already_canonical_passes_through_legacy_mapping() {
        assert_eq!(
            legacy_operator_type_to_key(Some("hpc.cluster_a")).as_deref(),
            Some("hpc.cluster_a")
        );
    }
}
