//! The scheduler loop (§4.7): readiness scanning, bounded admission, the
//! per-node retry/repeat lifecycle, final classification, and lifecycle
//! handler dispatch.

use crate::env::Env;
use crate::error::SchedulerError;
use crate::graph::ExecutionGraph;
use crate::node::{Node, Status};
use crate::step::{RetryPolicy, Step};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Semaphore;
use tokio::time::Instant;

/// A progress-channel event: a reference to the node whose state just
/// changed. Observers read it through `Node`'s accessor methods.
pub type NodeHandle = Arc<Node>;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub log_dir: PathBuf,
    pub max_active_steps: usize,
    pub timeout: Duration,
    pub delay: Duration,
    pub pause: Duration,
    pub dry: bool,
    pub on_exit: Option<Step>,
    pub on_success: Option<Step>,
    pub on_failure: Option<Step>,
    pub on_cancel: Option<Step>,
    pub dag_run_id: String,
    pub max_output_size: usize,
    pub mask_values: Vec<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            log_dir: std::env::temp_dir(),
            max_active_steps: 0,
            timeout: Duration::ZERO,
            delay: Duration::ZERO,
            pause: Duration::from_millis(100),
            dry: false,
            on_exit: None,
            on_success: None,
            on_failure: None,
            on_cancel: None,
            dag_run_id: uuid::Uuid::new_v4().to_string(),
            max_output_size: 0,
            mask_values: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Success,
    PartialSuccess,
    Error,
    Canceled,
}

#[derive(Debug, Clone, Default)]
pub struct Metrics {
    pub total_nodes: usize,
    pub completed_nodes: usize,
    pub failed_nodes: usize,
    pub skipped_nodes: usize,
    pub canceled_nodes: usize,
    pub total_execution_time: Duration,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub status: RunStatus,
    pub metrics: Metrics,
    pub last_error: Option<SchedulerError>,
}

/// Drives one `ExecutionGraph` to completion. Stateless apart from its
/// cancellation flag, so a single instance can be reused across retried runs
/// of the same graph (after `ExecutionGraph::reset_for_retry`).
pub struct Scheduler {
    config: SchedulerConfig,
    canceled: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            canceled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Sets the canceled flag and cancels every node (§5 "Cancellation
    /// semantics"). Running nodes transition to `Canceled`; `None` nodes are
    /// propagated as `Canceled` the next time readiness is checked.
    pub fn cancel(&self, graph: &ExecutionGraph) {
        self.canceled.store(true, Ordering::Relaxed);
        for node in graph.nodes() {
            node.cancel();
        }
    }

    /// Forwards `sig` to every running, non-repeating node's process. A
    /// repeating node is allowed to finish its current iteration. When
    /// `wait` is true, blocks (polling at `config.pause`) until the graph is
    /// no longer `Running` (§5 "`Signal(graph, sig, done, allowOverride)`").
    pub async fn signal(&self, graph: &ExecutionGraph, sig: &str, allow_override: bool, wait: bool) {
        self.canceled.store(true, Ordering::Relaxed);
        for node in graph.nodes() {
            if matches!(node.status(), Status::Running) && !node.step.repeat_policy.repeat {
                let _ = node.signal(sig, allow_override).await;
            }
        }
        if wait {
            while graph.nodes().any(|n| matches!(n.status(), Status::Running)) {
                tokio::time::sleep(self.config.pause).await;
            }
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Relaxed)
    }

    /// Runs the graph to completion: scans for ready `None` nodes, admits
    /// them under `max_active_steps`, and spawns one task per admitted node.
    /// Returns once every node has reached a terminal state and handlers
    /// have run.
    pub async fn schedule(
        &self,
        graph: Arc<ExecutionGraph>,
        progress_tx: Option<UnboundedSender<NodeHandle>>,
    ) -> Result<RunReport, SchedulerError> {
        graph.mark_started();
        let run_started = Instant::now();

        let permits = if self.config.max_active_steps == 0 {
            Semaphore::MAX_PERMITS
        } else {
            self.config.max_active_steps
        };
        let semaphore = Arc::new(Semaphore::new(permits));
        let deadline = (!self.config.timeout.is_zero()).then(|| run_started + self.config.timeout);
        let last_error: Arc<Mutex<Option<SchedulerError>>> = Arc::new(Mutex::new(None));
        let deadline_hit = Arc::new(AtomicBool::new(false));
        let config = Arc::new(self.config.clone());

        let mut handles: Vec<(NodeHandle, tokio::task::JoinHandle<()>)> = Vec::new();

        loop {
            if let Some(d) = deadline {
                if Instant::now() >= d && !deadline_hit.swap(true, Ordering::Relaxed) {
                    tracing::warn!(timeout = ?self.config.timeout, "overall deadline exceeded, cancelling in-flight nodes");
                    for node in graph.nodes() {
                        node.cancel();
                    }
                }
            }

            for node in graph.nodes() {
                if !matches!(node.status(), Status::None) {
                    continue;
                }
                if !is_ready(&graph, node, &self.canceled, &deadline_hit).await {
                    continue;
                }
                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(p) => p,
                    Err(_) => break,
                };

                node.set_status(Status::Running);
                tracing::debug!(step = node.name(), "admitted to running");
                emit(&progress_tx, node);

                let task_graph = graph.clone();
                let task_node = node.clone();
                let task_config = config.clone();
                let task_progress = progress_tx.clone();
                let task_last_error = last_error.clone();
                let task_canceled = self.canceled.clone();
                let task_deadline_hit = deadline_hit.clone();

                let handle = tokio::spawn(async move {
                    let _permit = permit;
                    run_node_lifecycle(
                        task_graph,
                        task_node.clone(),
                        task_config,
                        task_progress.clone(),
                        task_canceled,
                        deadline,
                        task_deadline_hit,
                    )
                    .await;
                    if let Some(err) = task_node.error() {
                        *task_last_error.lock().unwrap() = Some(err);
                    }
                });
                handles.push((node.clone(), handle));

                if !self.config.delay.is_zero() {
                    tokio::time::sleep(self.config.delay).await;
                }
            }

            if graph.is_finished() {
                break;
            }
            if (self.canceled.load(Ordering::Relaxed) || deadline_hit.load(Ordering::Relaxed))
                && !graph.nodes().any(|n| matches!(n.status(), Status::Running))
            {
                break;
            }
            tokio::time::sleep(self.config.pause).await;
        }

        for (node, handle) in handles {
            if let Err(join_err) = handle.await {
                if join_err.is_panic() {
                    let msg = join_err.to_string();
                    tracing::error!(step = node.name(), panic = %msg, "step task panicked");
                    node.set_status(Status::Error);
                    node.record_error(SchedulerError::PanicRecovered(msg.clone()));
                    *last_error.lock().unwrap() = Some(SchedulerError::PanicRecovered(msg));
                }
            }
        }

        graph.mark_finished();

        let status = classify(&graph, &self.canceled, &deadline_hit).await;
        tracing::info!(?status, "run finished");
        dispatch_handlers(&graph, &self.config, status, &progress_tx).await;

        let mut metrics = compute_metrics(&graph);
        metrics.total_execution_time = run_started.elapsed();

        Ok(RunReport {
            status,
            metrics,
            last_error: last_error.lock().unwrap().clone(),
        })
    }
}

fn emit(tx: &Option<UnboundedSender<NodeHandle>>, node: &NodeHandle) {
    if let Some(tx) = tx {
        let _ = tx.send(node.clone());
    }
}

/// §4.4 `is_ready`: walks `node`'s direct upstream dependencies. May itself
/// transition `node` to `Canceled`/`Skipped` when an upstream's outcome
/// doesn't permit continuation. Also resolves `node` straight to `Canceled`
/// once the run has been canceled or its overall deadline has passed, so a
/// `None` node stranded behind a not-yet-scanned predecessor still reaches a
/// terminal state instead of being left pending forever.
async fn is_ready(
    graph: &ExecutionGraph,
    node: &NodeHandle,
    canceled: &AtomicBool,
    deadline_hit: &AtomicBool,
) -> bool {
    if deadline_hit.load(Ordering::Relaxed) {
        node.record_error(SchedulerError::DeadlineExceeded);
        node.set_status(Status::Canceled);
        return false;
    }
    if canceled.load(Ordering::Relaxed) {
        node.set_status(Status::Canceled);
        return false;
    }
    for upstream in graph.predecessors(node) {
        match upstream.status() {
            Status::Success => continue,
            Status::Error => {
                if upstream.should_continue().await {
                    continue;
                }
                node.record_error(SchedulerError::UpstreamFailed(upstream.name().to_string()));
                node.set_status(Status::Canceled);
                return false;
            }
            Status::Skipped => {
                if upstream.should_continue().await {
                    continue;
                }
                node.record_error(SchedulerError::UpstreamSkipped(upstream.name().to_string()));
                node.set_status(Status::Skipped);
                return false;
            }
            Status::Canceled => {
                node.record_error(SchedulerError::UpstreamCanceled(upstream.name().to_string()));
                node.set_status(Status::Canceled);
                return false;
            }
            Status::None | Status::Running => return false,
        }
    }
    true
}

/// §4.7 "Per-node task", steps 3-9. Panic recovery (step 2) is handled by the
/// caller observing `JoinHandle::await` for a panicking join error.
#[tracing::instrument(skip_all, fields(step = node.name()))]
async fn run_node_lifecycle(
    graph: Arc<ExecutionGraph>,
    node: NodeHandle,
    config: Arc<SchedulerConfig>,
    progress_tx: Option<UnboundedSender<NodeHandle>>,
    canceled: Arc<AtomicBool>,
    deadline: Option<Instant>,
    deadline_hit: Arc<AtomicBool>,
) {
    let env = graph.scope_for(&node, false);

    if let Err(err) = crate::condition::evaluate_all(&node.step.preconditions, &env).await {
        if !err.is_condition_not_met() {
            node.record_error(err);
        }
        node.set_status(Status::Skipped);
        emit(&progress_tx, &node);
        return;
    }

    if !config.dry {
        if let Err(err) = node
            .setup(&config.log_dir, &config.dag_run_id, &env, &config.mask_values, config.max_output_size)
            .await
        {
            node.set_status(Status::Error);
            node.record_error(err);
        }
    }

    while !matches!(node.status(), Status::Error) {
        if !config.dry {
            let cancel_token = node.cancel_token();
            if let Err(err) = node.execute(&env, cancel_token).await {
                if matches!(node.status(), Status::Success | Status::Canceled) {
                    // the executor already finalized a terminal state (e.g. via cancellation)
                } else if deadline.map(|d| Instant::now() >= d).unwrap_or(false) {
                    node.set_status(Status::Canceled);
                    node.record_error(SchedulerError::DeadlineExceeded);
                    deadline_hit.store(true, Ordering::Relaxed);
                    break;
                } else if canceled.load(Ordering::Relaxed) {
                    node.record_error(err);
                    break;
                } else if node.retry_count() < node.step.retry_policy.limit && should_retry(&err, &node.step.retry_policy) {
                    tracing::debug!(step = node.name(), retry_count = node.retry_count() + 1, "retrying after failure");
                    node.record_error(err);
                    tokio::time::sleep(node.step.retry_policy.interval).await;
                    node.record_retry();
                    node.set_status(Status::Running);
                    continue;
                } else {
                    node.set_status(Status::Error);
                    node.record_error(err);
                    if node.should_mark_success().await {
                        tracing::debug!(step = node.name(), "continued-on failure reclassified as success");
                        node.set_status(Status::Success);
                    }
                }
            }
        }

        if !matches!(node.status(), Status::Canceled) {
            node.record_done();
        }

        if !config.dry && !canceled.load(Ordering::Relaxed) && should_repeat(&node, &env).await {
            tracing::debug!(step = node.name(), done_count = node.done_count(), "repeating step");
            node.clear_error();
            node.set_status(Status::Running);
            emit(&progress_tx, &node);
            tokio::time::sleep(node.step.repeat_policy.interval).await;
            continue;
        }

        if node.error().is_some() {
            emit(&progress_tx, &node);
        }
        break;
    }

    if matches!(node.status(), Status::Running) {
        node.set_status(Status::Success);
    }

    if let Err(err) = node.teardown().await {
        node.set_status(Status::Error);
        node.record_error(err);
    }

    tracing::info!(step = node.name(), status = ?node.status(), exit_code = node.exit_code(), "step finished");
    emit(&progress_tx, &node);
}

/// §4.7.1 retry decision.
fn should_retry(err: &SchedulerError, policy: &RetryPolicy) -> bool {
    let code = err.exit_code_hint();
    match &policy.exit_codes {
        Some(set) if !set.is_empty() => set.contains(&code),
        _ => code != 0,
    }
}

/// §4.7.2 repeat decision.
async fn should_repeat(node: &NodeHandle, env: &Env) -> bool {
    let policy = &node.step.repeat_policy;
    if policy.limit > 0 && node.done_count() >= policy.limit {
        return false;
    }

    if let Some(condition) = &policy.condition {
        let mut scope = env.clone();
        scope.extend(node.output_variables());
        let met = crate::condition::evaluate(condition, &scope).await.is_ok();
        return if !condition.condition.is_empty() {
            // value-based probe: keep repeating while the expectation is unmet
            !met
        } else {
            // command-based probe: keep repeating while it exits 0
            met
        };
    }

    if let Some(codes) = &policy.exit_code {
        if !codes.is_empty() {
            return codes.contains(&node.exit_code());
        }
    }

    if policy.repeat {
        return node.error().is_none() || node.step.continue_on.failure;
    }

    false
}

/// §4.7 final classification.
async fn classify(graph: &ExecutionGraph, canceled: &AtomicBool, deadline_hit: &AtomicBool) -> RunStatus {
    let nodes: Vec<&Arc<Node>> = graph.nodes().collect();
    let all_success_or_skipped = nodes
        .iter()
        .all(|n| matches!(n.status(), Status::Success | Status::Skipped));

    if canceled.load(Ordering::Relaxed) && !all_success_or_skipped {
        return RunStatus::Canceled;
    }
    if deadline_hit.load(Ordering::Relaxed) {
        return RunStatus::Error;
    }

    let failed: Vec<&&Arc<Node>> = nodes.iter().filter(|n| matches!(n.status(), Status::Error)).collect();
    if failed.is_empty() {
        return RunStatus::Success;
    }

    let mut all_continued = true;
    for n in &failed {
        if !n.should_continue().await {
            all_continued = false;
            break;
        }
    }
    if all_continued && nodes.iter().any(|n| matches!(n.status(), Status::Success)) {
        return RunStatus::PartialSuccess;
    }
    RunStatus::Error
}

async fn dispatch_handlers(
    graph: &ExecutionGraph,
    config: &SchedulerConfig,
    status: RunStatus,
    progress_tx: &Option<UnboundedSender<NodeHandle>>,
) {
    let primary = match status {
        RunStatus::Success | RunStatus::PartialSuccess => config.on_success.as_ref(),
        RunStatus::Error => config.on_failure.as_ref(),
        RunStatus::Canceled => config.on_cancel.as_ref(),
    };
    if let Some(step) = primary {
        run_handler(graph, step, config, progress_tx).await;
    }
    if let Some(step) = &config.on_exit {
        run_handler(graph, step, config, progress_tx).await;
    }
}

/// Runs a lifecycle handler step with the same setup/execute/teardown
/// discipline as a regular node, but without retry/repeat, and with a
/// variable scope drawn from every node in the graph (§4.7 "Handler
/// dispatch").
async fn run_handler(
    graph: &ExecutionGraph,
    step: &Step,
    config: &SchedulerConfig,
    progress_tx: &Option<UnboundedSender<NodeHandle>>,
) {
    let node: NodeHandle = Arc::new(Node::new(step.clone()));
    let env = graph.scope_for(&node, true);

    if crate::condition::evaluate_all(&node.step.preconditions, &env).await.is_err() {
        node.set_status(Status::Skipped);
        emit(progress_tx, &node);
        return;
    }

    if !config.dry {
        if let Err(err) = node
            .setup(&config.log_dir, &config.dag_run_id, &env, &config.mask_values, config.max_output_size)
            .await
        {
            node.set_status(Status::Error);
            node.record_error(err);
        }

        if !matches!(node.status(), Status::Error) {
            node.set_status(Status::Running);
            match node.execute(&env, node.cancel_token()).await {
                Ok(()) => node.set_status(Status::Success),
                Err(err) => {
                    node.set_status(Status::Error);
                    node.record_error(err);
                }
            }
        }

        let _ = node.teardown().await;
    } else {
        node.set_status(Status::Success);
    }

    emit(progress_tx, &node);
}

fn compute_metrics(graph: &ExecutionGraph) -> Metrics {
    let mut metrics = Metrics {
        total_nodes: graph.len(),
        ..Default::default()
    };
    for node in graph.nodes() {
        match node.status() {
            Status::Success => metrics.completed_nodes += 1,
            Status::Error => metrics.failed_nodes += 1,
            Status::Skipped => metrics.skipped_nodes += 1,
            Status::Canceled => metrics.canceled_nodes += 1,
            Status::None | Status::Running => {}
        }
    }
    metrics
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::ContinueOn;
    use std::collections::HashSet;
    use tempfile::tempdir;

    fn step(name: &str, command: &str, depends: &[&str]) -> Step {
        Step {
            name: name.to_string(),
            command: command.to_string(),
            depends: depends.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn test_config(dir: &std::path::Path) -> SchedulerConfig {
        SchedulerConfig {
            log_dir: dir.to_path_buf(),
            ..Default::default()
        }
    }

    #[test]
    fn should_retry_without_exit_codes_retries_any_nonzero() {
        let err = SchedulerError::ExecutionError("exit status 3".into());
        assert!(should_retry(&err, &RetryPolicy::default()));
    }

    #[test]
    fn should_retry_honors_explicit_exit_code_set() {
        let err = SchedulerError::ExecutionError("exit status 7".into());
        let policy = RetryPolicy {
            exit_codes: Some(HashSet::from([7])),
            ..Default::default()
        };
        assert!(should_retry(&err, &policy));
        let err2 = SchedulerError::ExecutionError("exit status 9".into());
        assert!(!should_retry(&err2, &policy));
    }

    #[tokio::test]
    async fn linear_success_reaches_terminal_success() {
        let dir = tempdir().unwrap();
        let graph = Arc::new(
            ExecutionGraph::build(vec![
                step("a", "true", &[]),
                step("b", "true", &["a"]),
                step("c", "true", &["b"]),
            ])
            .unwrap(),
        );
        let scheduler = Scheduler::new(SchedulerConfig {
            max_active_steps: 1,
            ..test_config(dir.path())
        });
        let report = scheduler.schedule(graph.clone(), None).await.unwrap();
        assert_eq!(report.status, RunStatus::Success);
        assert_eq!(graph.node_by_name("a").unwrap().status(), Status::Success);
        assert_eq!(graph.node_by_name("b").unwrap().status(), Status::Success);
        assert_eq!(graph.node_by_name("c").unwrap().status(), Status::Success);
    }

    #[tokio::test]
    async fn downstream_cancellation_on_failure() {
        let dir = tempdir().unwrap();
        let graph = Arc::new(
            ExecutionGraph::build(vec![
                step("a", "true", &[]),
                step("b", "false", &["a"]),
                step("c", "true", &["b"]),
            ])
            .unwrap(),
        );
        let scheduler = Scheduler::new(test_config(dir.path()));
        let report = scheduler.schedule(graph.clone(), None).await.unwrap();
        assert_eq!(report.status, RunStatus::Error);
        assert_eq!(graph.node_by_name("a").unwrap().status(), Status::Success);
        assert_eq!(graph.node_by_name("b").unwrap().status(), Status::Error);
        assert_eq!(graph.node_by_name("c").unwrap().status(), Status::Canceled);
    }

    #[tokio::test]
    async fn continue_on_with_mark_success() {
        let dir = tempdir().unwrap();
        let mut a = step("a", "false", &[]);
        a.continue_on = ContinueOn {
            exit_code: HashSet::from([1]),
            mark_success: true,
            ..Default::default()
        };
        let graph = Arc::new(ExecutionGraph::build(vec![a, step("b", "true", &["a"])]).unwrap());
        let scheduler = Scheduler::new(test_config(dir.path()));
        let report = scheduler.schedule(graph.clone(), None).await.unwrap();
        assert_eq!(report.status, RunStatus::Success);
        assert_eq!(graph.node_by_name("a").unwrap().status(), Status::Success);
        assert_eq!(graph.node_by_name("a").unwrap().exit_code(), 1);
        assert_eq!(graph.node_by_name("b").unwrap().status(), Status::Success);
    }

    #[tokio::test]
    async fn plain_repeat_runs_until_its_limit() {
        let dir = tempdir().unwrap();
        let mut a = step("a", "true", &[]);
        a.repeat_policy = crate::step::RepeatPolicy {
            repeat: true,
            limit: 3,
            ..Default::default()
        };
        let graph = Arc::new(ExecutionGraph::build(vec![a]).unwrap());
        let scheduler = Scheduler::new(test_config(dir.path()));
        let report = scheduler.schedule(graph.clone(), None).await.unwrap();
        assert_eq!(report.status, RunStatus::Success);
        let node = graph.node_by_name("a").unwrap();
        assert_eq!(node.status(), Status::Success);
        assert_eq!(node.done_count(), 3);
    }

    #[tokio::test]
    async fn timeout_cancels_downstream_none_nodes() {
        let dir = tempdir().unwrap();
        let graph = Arc::new(
            ExecutionGraph::build(vec![
                step("a", "sleep 1", &[]),
                step("b", "true", &["a"]),
                step("c", "true", &["b"]),
            ])
            .unwrap(),
        );
        let scheduler = Scheduler::new(SchedulerConfig {
            timeout: std::time::Duration::from_millis(50),
            pause: std::time::Duration::from_millis(10),
            ..test_config(dir.path())
        });
        let report = scheduler.schedule(graph.clone(), None).await.unwrap();
        assert_eq!(report.status, RunStatus::Error);
        assert_eq!(graph.node_by_name("b").unwrap().status(), Status::Canceled);
        assert_eq!(graph.node_by_name("c").unwrap().status(), Status::Canceled);
    }

    #[tokio::test]
    async fn partial_success_when_every_failure_continues() {
        let dir = tempdir().unwrap();
        let mut a = step("a", "false", &[]);
        a.continue_on = ContinueOn {
            failure: true,
            ..Default::default()
        };
        let b = step("b", "true", &[]);
        let graph = Arc::new(ExecutionGraph::build(vec![a, b]).unwrap());
        let scheduler = Scheduler::new(test_config(dir.path()));
        let report = scheduler.schedule(graph, None).await.unwrap();
        assert_eq!(report.status, RunStatus::PartialSuccess);
    }
}
