//! Per-step state machine (§4.2 / §4.3): admission bookkeeping, command
//! evaluation, execution, and the retry/repeat decisions the scheduler loop
//! drives. A [`Node`] is the unit the scheduler spawns a task around; its
//! [`NodeState`] is only ever touched through its own lock, and never across
//! an `.await`.

use crate::env::Env;
use crate::error::SchedulerError;
use crate::executor::{Executor, ShellExecutor};
use crate::output::{build_log_path, OutputCoordinator};
use crate::step::Step;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    None,
    Running,
    Success,
    Error,
    Canceled,
    Skipped,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Status::Success | Status::Error | Status::Canceled | Status::Skipped
        )
    }
}

/// Everything observable about a step's progress through its lifecycle.
#[derive(Debug, Clone)]
pub struct NodeState {
    pub status: Status,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub retried_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub done_count: u32,
    pub error: Option<SchedulerError>,
    pub exit_code: i32,
    pub log_path: Option<PathBuf>,
    pub output_variables: HashMap<String, String>,
    /// Cached result of the first `continue_on.output` log scan (§4.4).
    pub continue_on_output_cache: Option<bool>,
}

impl Default for NodeState {
    fn default() -> Self {
        Self {
            status: Status::None,
            started_at: None,
            finished_at: None,
            retried_at: None,
            retry_count: 0,
            done_count: 0,
            error: None,
            exit_code: 0,
            log_path: None,
            output_variables: HashMap::new(),
            continue_on_output_cache: None,
        }
    }
}

/// A single DAG step plus its runtime state. Cheap to reference (`Arc<Node>`
/// is how the graph stores it); never clone the interior state directly.
pub struct Node {
    pub step: Step,
    state: Mutex<NodeState>,
    output: Mutex<Option<OutputCoordinator>>,
    /// The live executor handle, published the moment it is spawned (before
    /// `run` is awaited to completion) so `signal` can reach a running
    /// process without waiting for it to finish.
    executor: Mutex<Option<Arc<dyn Executor>>>,
    script_path: Mutex<Option<PathBuf>>,
    resolved_dir: Mutex<Option<PathBuf>>,
    max_output_size: Mutex<usize>,
    cancel: Mutex<CancellationToken>,
}

impl Node {
    pub fn new(step: Step) -> Self {
        Self {
            step,
            state: Mutex::new(NodeState::default()),
            output: Mutex::new(None),
            executor: Mutex::new(None),
            script_path: Mutex::new(None),
            resolved_dir: Mutex::new(None),
            max_output_size: Mutex::new(0),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.step.name
    }

    pub fn status(&self) -> Status {
        self.state.lock().unwrap().status
    }

    pub fn snapshot(&self) -> NodeState {
        self.state.lock().unwrap().clone()
    }

    pub fn is_started(&self) -> bool {
        !matches!(self.status(), Status::None)
    }

    pub fn is_finished(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn exit_code(&self) -> i32 {
        self.state.lock().unwrap().exit_code
    }

    pub fn set_exit_code(&self, code: i32) {
        self.state.lock().unwrap().exit_code = code;
    }

    pub fn set_status(&self, status: Status) {
        let mut st = self.state.lock().unwrap();
        if st.started_at.is_none() && matches!(status, Status::Running) {
            st.started_at = Some(Utc::now());
        }
        if status.is_terminal() {
            st.finished_at = Some(Utc::now());
        }
        st.status = status;
    }

    pub fn record_error(&self, err: SchedulerError) {
        self.state.lock().unwrap().error = Some(err);
    }

    pub fn clear_error(&self) {
        self.state.lock().unwrap().error = None;
    }

    pub fn error(&self) -> Option<SchedulerError> {
        self.state.lock().unwrap().error.clone()
    }

    pub fn record_retry(&self) {
        let mut st = self.state.lock().unwrap();
        st.retry_count += 1;
        st.retried_at = Some(Utc::now());
    }

    pub fn retry_count(&self) -> u32 {
        self.state.lock().unwrap().retry_count
    }

    pub fn record_done(&self) {
        self.state.lock().unwrap().done_count += 1;
    }

    pub fn done_count(&self) -> u32 {
        self.state.lock().unwrap().done_count
    }

    pub fn store_output_variable(&self, name: String, value: String) {
        self.state.lock().unwrap().output_variables.insert(name, value);
    }

    pub fn output_variables(&self) -> HashMap<String, String> {
        self.state.lock().unwrap().output_variables.clone()
    }

    pub fn log_path(&self) -> Option<PathBuf> {
        self.state.lock().unwrap().log_path.clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.lock().unwrap().clone()
    }

    /// Cancels the node's in-flight I/O and, if it is `Running`, transitions
    /// it to `Canceled` (§4.2 `cancel`).
    pub fn cancel(&self) {
        if matches!(self.status(), Status::Running) {
            self.set_status(Status::Canceled);
        }
        self.cancel.lock().unwrap().cancel();
    }

    /// Resets this node to its initial state ahead of a retry-graph run
    /// (§4.1 "Retry graph construction"). A fresh, uncancelled token is
    /// installed so the node can run again.
    pub fn reset_for_retry(&self) {
        *self.state.lock().unwrap() = NodeState::default();
        *self.output.lock().unwrap() = None;
        *self.executor.lock().unwrap() = None;
        *self.script_path.lock().unwrap() = None;
        *self.resolved_dir.lock().unwrap() = None;
        *self.cancel.lock().unwrap() = CancellationToken::new();
    }

    /// Sends `signal` (or the step's own `signal_on_stop` override) to the
    /// running child and transitions to `Canceled` (§4.2 `signal`).
    pub async fn signal(&self, default_signal: &str, allow_override: bool) -> Result<(), SchedulerError> {
        if !matches!(self.status(), Status::Running) {
            return Ok(());
        }
        let effective = if allow_override {
            self.step
                .signal_on_stop
                .clone()
                .unwrap_or_else(|| default_signal.to_string())
        } else {
            default_signal.to_string()
        };
        let executor = self.executor.lock().unwrap().clone();
        if let Some(executor) = executor {
            executor.kill(&effective).await?;
        }
        self.set_status(Status::Canceled);
        Ok(())
    }

    /// Opens/creates the node's log and redirect files, resolves its working
    /// directory, and materializes an inline script to a temp file.
    pub async fn setup(
        &self,
        log_dir: &Path,
        run_id: &str,
        env: &Env,
        mask_values: &[String],
        max_output_size: usize,
    ) -> Result<(), SchedulerError> {
        let dir = match &self.step.dir {
            Some(d) if !d.is_empty() => {
                let evaluated = env.eval_string(d).await?;
                let path = PathBuf::from(evaluated);
                if !path.is_dir() {
                    return Err(SchedulerError::WorkingDirNotExist(path));
                }
                Some(path)
            }
            _ => None,
        };

        let stdout_redirect = self.resolve_redirect(&self.step.stdout, env, dir.as_deref()).await?;
        let stderr_redirect = self.resolve_redirect(&self.step.stderr, env, dir.as_deref()).await?;

        tokio::fs::create_dir_all(log_dir)
            .await
            .map_err(|e| SchedulerError::ExecutionError(format!("creating log dir: {e}")))?;
        let log_path = build_log_path(log_dir, &self.step.name, run_id);

        let coordinator = OutputCoordinator::setup(
            log_path.clone(),
            stdout_redirect,
            stderr_redirect,
            self.step.output.is_some(),
            mask_values.to_vec(),
            max_output_size,
        )
        .await
        .map_err(|e| SchedulerError::ExecutionError(format!("opening output files: {e}")))?;

        if let Some(script) = &self.step.script {
            let contents = env.eval_string(script).await?;
            let target_dir = dir.clone().unwrap_or_else(std::env::temp_dir);
            let file_name = format!("dagtmp_script-{}", uuid::Uuid::new_v4());
            let path = target_dir.join(file_name);
            tokio::fs::write(&path, contents)
                .await
                .map_err(|e| SchedulerError::ExecutionError(format!("writing script file: {e}")))?;
            *self.script_path.lock().unwrap() = Some(path);
        }

        self.state.lock().unwrap().log_path = Some(log_path);
        *self.resolved_dir.lock().unwrap() = dir;
        *self.max_output_size.lock().unwrap() = max_output_size;
        *self.output.lock().unwrap() = Some(coordinator);
        Ok(())
    }

    async fn resolve_redirect(
        &self,
        configured: &Option<String>,
        env: &Env,
        dir: Option<&Path>,
    ) -> Result<Option<PathBuf>, SchedulerError> {
        let Some(raw) = configured else { return Ok(None) };
        let evaluated = env.eval_string(raw).await?;
        let path = PathBuf::from(evaluated);
        Ok(Some(match dir {
            Some(dir) if path.is_relative() => dir.join(path),
            _ => path,
        }))
    }

    /// Resolves the command form (§4.3) and runs it to completion, capturing
    /// output and binding `Step::output` if configured.
    pub async fn execute(&self, env: &Env, cancel: CancellationToken) -> Result<(), SchedulerError> {
        let (program, mut args) = resolve_command(&self.step, env).await?;
        if let Some(script) = self.script_path.lock().unwrap().clone() {
            args.push(script.to_string_lossy().into_owned());
        }

        let mut env_vars: HashMap<String, String> = env.variables().clone();
        if let Some(log_path) = self.log_path() {
            let log_path = log_path.to_string_lossy().into_owned();
            env_vars.insert("LOG_PATH".to_string(), log_path.clone());
            env_vars.insert("STEP_LOG_PATH".to_string(), log_path);
        }

        let dir = self.resolved_dir.lock().unwrap().clone();
        let executor = ShellExecutor::new(program, args).with_dir(dir).with_env(env_vars);

        let coordinator = self.output.lock().unwrap().clone();
        if let Some(coordinator) = &coordinator {
            executor.set_stdout(coordinator.stdout_sink());
            executor.set_stderr(coordinator.stderr_sink());
        }

        // Published before `run` is awaited so `signal` can reach the live
        // process while it's still in flight.
        let executor: Arc<dyn Executor> = Arc::new(executor);
        *self.executor.lock().unwrap() = Some(executor.clone());

        let result = executor.run(cancel).await;
        self.set_exit_code(executor.exit_code().unwrap_or(1));

        result.map_err(SchedulerError::from)?;

        if let Some(name) = &self.step.output {
            if let Some(coordinator) = &coordinator {
                let limit = *self.max_output_size.lock().unwrap();
                if let Some(value) = coordinator.captured_output(limit).await? {
                    self.store_output_variable(name.clone(), value);
                }
            }
        }
        Ok(())
    }

    /// The downstream-readiness question for a finished node (§4.4).
    pub async fn should_continue(&self) -> bool {
        match self.status() {
            Status::Success => true,
            Status::Error => {
                if self.step.continue_on.failure {
                    return true;
                }
                if self.step.continue_on.exit_code.contains(&self.exit_code()) {
                    return true;
                }
                if !self.step.continue_on.output.is_empty() {
                    return self.log_output_matches().await;
                }
                false
            }
            Status::Skipped => self.step.continue_on.skipped,
            Status::Canceled | Status::None | Status::Running => false,
        }
    }

    pub async fn should_mark_success(&self) -> bool {
        self.step.continue_on.mark_success && self.should_continue().await
    }

    async fn log_output_matches(&self) -> bool {
        if let Some(cached) = self.state.lock().unwrap().continue_on_output_cache {
            return cached;
        }
        let matched = self
            .log_contains_pattern(&self.step.continue_on.output)
            .await
            .unwrap_or(false);
        self.state.lock().unwrap().continue_on_output_cache = Some(matched);
        matched
    }

    /// Scans the node's log for any of `patterns` (literal, or `re:`-prefixed
    /// regex), line by line, using a 64 KiB read buffer and a 1 MiB cap per
    /// line (an over-long line is matched against up to that cap, never
    /// buffered further). Returns `false` at EOF with no match.
    pub async fn log_contains_pattern(&self, patterns: &[String]) -> Result<bool, SchedulerError> {
        const BUF_CAPACITY: usize = 64 * 1024;
        const MAX_LINE: usize = 1024 * 1024;
        use tokio::io::AsyncBufReadExt;

        let Some(path) = self.log_path() else {
            return Ok(false);
        };
        let file = match tokio::fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(SchedulerError::ExecutionError(format!("reading log: {e}"))),
        };
        let mut reader = tokio::io::BufReader::with_capacity(BUF_CAPACITY, file);
        let mut line = Vec::new();
        let mut overflowing = false;
        loop {
            let available = reader
                .fill_buf()
                .await
                .map_err(|e| SchedulerError::ExecutionError(format!("reading log: {e}")))?;
            if available.is_empty() {
                if line.is_empty() {
                    return Ok(false);
                }
                if scan_line(&line, patterns)? {
                    return Ok(true);
                }
                return Ok(false);
            }

            match available.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    if !overflowing && line.len() < MAX_LINE {
                        line.extend_from_slice(&available[..pos.min(MAX_LINE - line.len())]);
                    }
                    reader.consume(pos + 1);
                    if scan_line(&line, patterns)? {
                        return Ok(true);
                    }
                    line.clear();
                    overflowing = false;
                }
                None => {
                    let n = available.len();
                    if !overflowing && line.len() < MAX_LINE {
                        let take = n.min(MAX_LINE - line.len());
                        line.extend_from_slice(&available[..take]);
                        if line.len() >= MAX_LINE {
                            overflowing = true;
                        }
                    } else {
                        overflowing = true;
                    }
                    reader.consume(n);
                }
            }
        }
    }

    /// Idempotent: flushes/closes output resources and removes the
    /// materialized script file. Safe to call more than once.
    pub async fn teardown(&self) -> Result<(), SchedulerError> {
        let coordinator = self.output.lock().unwrap().clone();
        if let Some(coordinator) = coordinator {
            coordinator.teardown().await?;
        }
        let script = self.script_path.lock().unwrap().take();
        if let Some(path) = script {
            let _ = tokio::fs::remove_file(path).await;
        }
        Ok(())
    }
}

/// Matches one already-read log line (capped at 1 MiB) against `patterns`.
fn scan_line(line: &[u8], patterns: &[String]) -> Result<bool, SchedulerError> {
    let text = String::from_utf8_lossy(line);
    for pattern in patterns {
        if let Some(re_src) = pattern.strip_prefix("re:") {
            let re = regex::Regex::new(re_src)
                .map_err(|e| SchedulerError::ExecutionError(format!("invalid pattern '{re_src}': {e}")))?;
            if re.is_match(&text) {
                return Ok(true);
            }
        } else if text.contains(pattern.as_str()) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Resolves the command/args form for a step (§4.3), evaluating every
/// argument against `env` but never invoking a shell to parse them — only
/// the bare `command`-as-a-single-string form is shell-split, and that split
/// is whitespace/quote-aware, not a full shell grammar.
async fn resolve_command(step: &Step, env: &Env) -> Result<(String, Vec<String>), SchedulerError> {
    if !step.args.is_empty() {
        let program = env.eval_string(&step.command).await?;
        let mut args = Vec::with_capacity(step.args.len());
        for arg in &step.args {
            args.push(env.eval_string(arg).await?);
        }
        return Ok((program, args));
    }

    if !step.command.is_empty() {
        let evaluated = env.eval_string(&step.command).await?;
        let mut parts = shell_split(&evaluated);
        if parts.is_empty() {
            return Ok((evaluated, Vec::new()));
        }
        let program = parts.remove(0);
        return Ok((program, parts));
    }

    let shell = crate::env::resolve_shell(step.shell.as_deref()).unwrap_or_else(|| "/bin/sh".to_string());
    Ok((shell, Vec::new()))
}

/// A minimal whitespace tokenizer that honors single and double quotes.
/// Deliberately not a full shell grammar (§1): no globbing, no pipes, no
/// variable expansion (that already happened in `env.eval_string`).
fn shell_split(input: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_single = false;
    let mut in_double = false;
    let mut has_content = false;

    for c in input.chars() {
        match c {
            '\'' if !in_double => {
                in_single = !in_single;
                has_content = true;
            }
            '"' if !in_single => {
                in_double = !in_double;
                has_content = true;
            }
            c if c.is_whitespace() && !in_single && !in_double => {
                if has_content {
                    parts.push(std::mem::take(&mut current));
                    has_content = false;
                }
            }
            c => {
                current.push(c);
                has_content = true;
            }
        }
    }
    if has_content {
        parts.push(current);
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::{Condition, ContinueOn, Step};
    use std::collections::HashSet;

    fn step(name: &str) -> Step {
        Step {
            name: name.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn shell_split_honors_quotes() {
        let parts = shell_split(r#"echo "hello world" 'second arg'"#);
        assert_eq!(parts, vec!["echo", "hello world", "second arg"]);
    }

    #[test]
    fn new_node_starts_in_none_state() {
        let node = Node::new(step("a"));
        assert_eq!(node.status(), Status::None);
        assert!(!node.is_started());
    }

    #[tokio::test]
    async fn should_continue_success_is_always_true() {
        let node = Node::new(step("a"));
        node.set_status(Status::Success);
        assert!(node.should_continue().await);
    }

    #[tokio::test]
    async fn should_continue_error_respects_continue_on_exit_code() {
        let mut s = step("a");
        s.continue_on = ContinueOn {
            exit_code: HashSet::from([1]),
            ..Default::default()
        };
        let node = Node::new(s);
        node.set_status(Status::Error);
        node.set_exit_code(1);
        assert!(node.should_continue().await);
    }

    #[tokio::test]
    async fn should_continue_error_without_policy_is_false() {
        let node = Node::new(step("a"));
        node.set_status(Status::Error);
        assert!(!node.should_continue().await);
    }

    #[tokio::test]
    async fn should_mark_success_requires_continue_and_flag() {
        let mut s = step("a");
        s.continue_on = ContinueOn {
            failure: true,
            mark_success: true,
            ..Default::default()
        };
        let node = Node::new(s);
        node.set_status(Status::Error);
        assert!(node.should_mark_success().await);
    }

    #[tokio::test]
    async fn reset_for_retry_clears_state() {
        let node = Node::new(step("a"));
        node.set_status(Status::Error);
        node.record_error(SchedulerError::ExecutionError("boom".into()));
        node.reset_for_retry();
        assert_eq!(node.status(), Status::None);
        assert!(node.error().is_none());
    }

    #[test]
    fn precondition_is_empty_default() {
        assert!(Condition::default().is_empty());
    }

    #[tokio::test]
    async fn log_contains_pattern_matches_literal_and_regex() {
        let dir = tempfile::tempdir().unwrap();
        let node = Node::new(step("a"));
        node.setup(dir.path(), "deadbeefdeadbeef", &Env::new(), &[], 0)
            .await
            .unwrap();
        let log_path = node.log_path().unwrap();
        tokio::fs::write(&log_path, b"line one\nBUILD FAILED with code 17\nline three\n")
            .await
            .unwrap();

        assert!(node
            .log_contains_pattern(&["FAILED".to_string()])
            .await
            .unwrap());
        assert!(node
            .log_contains_pattern(&["re:code \\d+".to_string()])
            .await
            .unwrap());
        assert!(!node
            .log_contains_pattern(&["NOT_PRESENT".to_string()])
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn log_contains_pattern_returns_false_when_log_missing() {
        let node = Node::new(step("a"));
        assert!(!node
            .log_contains_pattern(&["anything".to_string()])
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn log_contains_pattern_matches_after_an_oversized_line() {
        let dir = tempfile::tempdir().unwrap();
        let node = Node::new(step("a"));
        node.setup(dir.path(), "deadbeefdeadbeef", &Env::new(), &[], 0)
            .await
            .unwrap();
        let log_path = node.log_path().unwrap();
        let huge_line = "x".repeat(2 * 1024 * 1024);
        let contents = format!("{huge_line}\nneedle\n");
        tokio::fs::write(&log_path, contents.as_bytes()).await.unwrap();

        assert!(node
            .log_contains_pattern(&["needle".to_string()])
            .await
            .unwrap());
    }
}
