//! The step definition: the input data model the scheduler core consumes.
//!
//! `Step` is produced by a loader (this crate ships [`crate::dag`] as a demo
//! loader) and is treated as immutable by the core, except for the fields
//! the node is explicitly allowed to rewrite during setup (`dir`/`stdout`/
//! `stderr` after variable evaluation, and `output_variables` once the step
//! has produced captured output).

use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;

/// A single unit of work in the DAG.
#[derive(Debug, Clone, Deserialize)]
pub struct Step {
    /// Unique name within the graph.
    pub name: String,

    /// Command to execute. May be empty, in which case the default shell is
    /// invoked (§4.3).
    #[serde(default)]
    pub command: String,

    /// Ordered argument list, evaluated independently of `command`.
    #[serde(default)]
    pub args: Vec<String>,

    /// Preferred shell; falls back to `$SHELL`, then `/bin/sh`.
    #[serde(default)]
    pub shell: Option<String>,

    /// Working directory. Relative `stdout`/`stderr` paths resolve against
    /// this. Empty means "inherit the scheduler process's cwd".
    #[serde(default)]
    pub dir: Option<String>,

    /// Names of upstream steps this one depends on.
    #[serde(default)]
    pub depends: Vec<String>,

    /// Preconditions evaluated before the step is admitted to `Running`.
    #[serde(default)]
    pub preconditions: Vec<Condition>,

    #[serde(default)]
    pub retry_policy: RetryPolicy,

    #[serde(default)]
    pub repeat_policy: RepeatPolicy,

    #[serde(default)]
    pub continue_on: ContinueOn,

    /// Signal to send on `signal()` with `allow_override = true`, instead of
    /// the caller-supplied default.
    #[serde(default)]
    pub signal_on_stop: Option<String>,

    /// Optional redirect target for captured stdout, resolved against `dir`
    /// when relative.
    #[serde(default)]
    pub stdout: Option<String>,

    /// Optional redirect target for captured stderr.
    #[serde(default)]
    pub stderr: Option<String>,

    /// Name of a variable to bind to this step's captured stdout.
    #[serde(default)]
    pub output: Option<String>,

    /// Inline script body. When set, evaluated and materialized to a
    /// temporary file whose path becomes the final argument (§4.3).
    #[serde(default)]
    pub script: Option<String>,
}

impl Default for Step {
    fn default() -> Self {
        Step {
            name: String::new(),
            command: String::new(),
            args: Vec::new(),
            shell: None,
            dir: None,
            depends: Vec::new(),
            preconditions: Vec::new(),
            retry_policy: RetryPolicy::default(),
            repeat_policy: RepeatPolicy::default(),
            continue_on: ContinueOn::default(),
            signal_on_stop: None,
            stdout: None,
            stderr: None,
            output: None,
            script: None,
        }
    }
}

/// Retry policy: re-running the *same* failed iteration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub limit: u32,
    #[serde(with = "humantime_secs")]
    pub interval: Duration,
    /// If present, retry only when the last exit code is in this set. If
    /// absent, retry on any non-zero exit code.
    pub exit_codes: Option<HashSet<i32>>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            limit: 0,
            interval: Duration::from_secs(0),
            exit_codes: None,
        }
    }
}

/// Repeat policy: running additional iterations of an already-completed step.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RepeatPolicy {
    pub repeat: bool,
    #[serde(with = "humantime_secs")]
    pub interval: Duration,
    /// Maximum number of repetitions. `0` means unlimited (resolved open
    /// question, see DESIGN.md).
    pub limit: u32,
    pub condition: Option<Condition>,
    pub exit_code: Option<HashSet<i32>>,
}

impl Default for RepeatPolicy {
    fn default() -> Self {
        Self {
            repeat: false,
            interval: Duration::from_secs(0),
            limit: 0,
            condition: None,
            exit_code: None,
        }
    }
}

/// Policy allowing downstream work to proceed despite this step's non-success
/// terminal state.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ContinueOn {
    pub failure: bool,
    pub skipped: bool,
    pub exit_code: HashSet<i32>,
    /// Literal substrings, or regex patterns prefixed `re:`, matched against
    /// the step's log.
    pub output: Vec<String>,
    /// If true, a continued-on failure is reclassified as `Success` for
    /// downstream readiness purposes.
    pub mark_success: bool,
}

/// A precondition or repeat-condition probe.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Condition {
    /// A string to evaluate — a variable reference, a backticked command, or
    /// empty.
    pub condition: String,
    /// A raw shell command alternative to `condition`.
    pub command: String,
    /// Expected value; `re:`-prefixed for regex matching.
    pub expected: String,
}

impl Condition {
    pub fn is_empty(&self) -> bool {
        self.condition.is_empty() && self.command.is_empty()
    }
}

mod humantime_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn condition_is_empty_when_both_fields_blank() {
        let c = Condition::default();
        assert!(c.is_empty());
        let c = Condition {
            command: "true".into(),
            ..Default::default()
        };
        assert!(!c.is_empty());
    }

    #[test]
    fn step_default_has_no_dependencies() {
        let s = Step::default();
        assert!(s.depends.is_empty());
        assert_eq!(s.retry_policy.limit, 0);
    }
}
