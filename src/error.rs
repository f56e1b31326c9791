//! Error taxonomy for the scheduler core.
//!
//! Node-local failures (`WorkingDirNotExist`, `ExecutionError`, ...) never tear
//! the scheduler down; they are recorded on the node and folded into final
//! classification. Only [`SchedulerError::CycleDetected`] and
//! [`SchedulerError::StepNotFound`] short-circuit, since those happen during
//! graph construction, before any step has run.

use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the scheduler core.
#[derive(Debug, Error, Clone)]
pub enum SchedulerError {
    #[error("cycle detected at step '{step}'")]
    CycleDetected { step: String },

    #[error("step '{dependent}' depends on unknown step '{dependency}'")]
    StepNotFound { dependent: String, dependency: String },

    #[error("working directory does not exist: {0}")]
    WorkingDirNotExist(PathBuf),

    #[error("condition not met: {0}")]
    ConditionNotMet(String),

    #[error("upstream step '{0}' failed")]
    UpstreamFailed(String),

    #[error("upstream step '{0}' was skipped")]
    UpstreamSkipped(String),

    #[error("upstream step '{0}' was canceled")]
    UpstreamCanceled(String),

    #[error("execution failed: {0}")]
    ExecutionError(String),

    #[error("captured output of {size} bytes exceeds max_output_size of {limit} bytes")]
    OutputSizeExceeded { size: usize, limit: usize },

    #[error("step panicked: {0}")]
    PanicRecovered(String),

    #[error("teardown failed: {0}")]
    TeardownError(String),

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("variable evaluation failed: {0}")]
    Eval(#[from] crate::env::EvalError),

    #[error("executor error: {0}")]
    Executor(#[from] crate::executor::ExecutorError),
}

impl SchedulerError {
    /// True for errors the precondition gate treats as an expected "not met"
    /// outcome rather than a recorded failure (§4.7, step 4).
    pub fn is_condition_not_met(&self) -> bool {
        matches!(self, SchedulerError::ConditionNotMet(_))
    }

    /// Best-effort extraction of a process exit code from an execution error,
    /// per §4.7.1. Returns `-1` for signal termination, `1` as the default
    /// when nothing more specific can be recovered.
    pub fn exit_code_hint(&self) -> i32 {
        match self {
            SchedulerError::Executor(crate::executor::ExecutorError::ExitStatus(code)) => *code,
            SchedulerError::Executor(crate::executor::ExecutorError::Signaled(_)) => -1,
            SchedulerError::ExecutionError(msg) => parse_exit_code_from_message(msg),
            _ => 1,
        }
    }
}

/// Parses `"exit status <N>"` substrings out of a free-form error message,
/// last occurrence wins. Falls back to signal detection, then to `1`.
fn parse_exit_code_from_message(msg: &str) -> i32 {
    if let Some(code) = last_exit_status(msg) {
        return code;
    }
    if msg.contains("signal:") {
        return -1;
    }
    1
}

fn last_exit_status(msg: &str) -> Option<i32> {
    const MARKER: &str = "exit status ";
    let mut best = None;
    let mut rest = msg;
    while let Some(pos) = rest.find(MARKER) {
        let after = &rest[pos + MARKER.len()..];
        let digits: String = after
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
            .collect();
        let int_part: String = digits.chars().take_while(|c| *c != '.').collect();
        if let Ok(n) = int_part.parse::<i32>() {
            best = Some(n);
        }
        rest = &after[digits.len().min(after.len())..];
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_last_exit_status() {
        let msg = "retrying: exit status 2, then exit status 17";
        assert_eq!(parse_exit_code_from_message(msg), 17);
    }

    #[test]
    fn treats_fractional_exit_status_as_integer_part() {
        assert_eq!(parse_exit_code_from_message("exit status 3.0"), 3);
    }

    #[test]
    fn detects_signal_termination() {
        assert_eq!(parse_exit_code_from_message("signal: killed"), -1);
    }

    #[test]
    fn defaults_to_one() {
        assert_eq!(parse_exit_code_from_message("boom"), 1);
    }
}
