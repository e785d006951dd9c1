//! Chronologically sortable identifier generation.
//!
//! All IDs use the format `[hint_]YYYYMMDD_HHMMSS_<hex8>`: sortable by
//! prefix, human-readable, and unique via an 8-hex-char random suffix
//! (4.3 billion combinations per second).

use chrono::Utc;
use uuid::Uuid;

/// Generate a chronologically sortable ID, optionally prefixed.
pub fn generate_chronological_id(prefix: &str) -> String {
    let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
    let suffix = &Uuid::new_v4().simple().to_string()[..8];

    if prefix.is_empty() {
        format!("{timestamp}_{suffix}")
    } else {
        format!("{prefix}_{timestamp}_{suffix}")
    }
}

/// Generate a run ID, e.g. `20231225_143052_a1b2c3d4`.
pub fn generate_run_id() -> String {
    generate_chronological_id("")
}

/// Generate an attempt ID.
pub fn generate_attempt_id() -> String {
    generate_chronological_id("")
}

/// Generate a task ID, optionally prefixed with a sanitized human-readable
/// hint, e.g. `equilibrate_20231225_143053_abcd1234`.
///
/// The hint is lowercased, non-alphanumeric runs collapse to single
/// underscores, and the result is truncated to 20 characters.
pub fn generate_task_id(hint: &str) -> String {
    let sanitized = sanitize_hint(hint);
    generate_chronological_id(&sanitized)
}

fn sanitize_hint(hint: &str) -> String {
    let mut out = String::with_capacity(hint.len().min(20));
    let mut last_was_underscore = true; // suppress leading underscores

    for c in hint.chars().map(|c| c.to_ascii_lowercase()) {
        if out.len() >= 20 {
            break;
        }
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            out.push(c);
            last_was_underscore = false;
        } else if !last_was_underscore {
            out.push('_');
            last_was_underscore = true;
        }
    }

    out.trim_end_matches('_').to_string()
}
