//! The run lifecycle engine: initialization, the step loop, dispatch,
//! analyze/replan, and the multi-run scheduler.

pub mod analyze;
pub mod dispatch;
pub mod init;
pub mod scheduler;
pub mod step;

pub use init::{initialize_or_resume_run, initialize_run};
pub use scheduler::{scheduler_loop, scheduler_sweep, step_discovered_run};
pub use step::{run_until_completion, step_run, StepOptions};

use std::time::Duration;

use crate::error::EngineError;

/// Parse a timeout argument: `1h`, `30m`, `3600s`, or bare seconds.
pub fn parse_timeout(text: &str) -> Result<Duration, EngineError> {
    let trimmed = text.trim().to_ascii_lowercase();
    let invalid = || EngineError::Config(format!("invalid timeout format: {text:?}"));

    if trimmed.is_empty() {
        return Err(invalid());
    }

    let (digits, unit) = match trimmed.chars().last() {
        Some(c @ ('h' | 'm' | 's')) => (&trimmed[..trimmed.len() - 1], c),
        Some(c) if c.is_ascii_digit() => (trimmed.as_str(), 's'),
        _ => return Err(invalid()),
    };

    let value: u64 = digits.parse().map_err(|_| invalid())?;
    let seconds = match unit {
        'h' => value * 3600,
        'm' => value * 60,
        _ => value,
    };
    Ok(Duration::from_secs(seconds))
}

/// Render a duration in the same compact form `parse_timeout` accepts.
pub fn format_timeout(duration: Duration) -> String {
    let seconds = duration.as_secs();
    if seconds > 0 && seconds % 3600 == 0 {
        format!("{}h", seconds / 3600)
    } else if seconds > 0 && seconds % 60 == 0 {
        format!("{}m", seconds / 60)
    } else {
        format!("{seconds}s")
    }
}
