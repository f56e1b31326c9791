//! The execution graph (§4.1): step topology, cycle detection, and the
//! variable-scope lookups the scheduler needs while a run is in flight.

use crate::env::Env;
use crate::error::SchedulerError;
use crate::node::{Node, Status};
use crate::step::Step;
use chrono::{DateTime, Utc};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

/// Owns every node for the lifetime of a run. Adjacency is write-once at
/// construction; the scheduler only ever mutates node state through the
/// nodes themselves.
pub struct ExecutionGraph {
    graph: DiGraph<Arc<Node>, ()>,
    index_by_name: HashMap<String, NodeIndex>,
    started_at: Mutex<Option<DateTime<Utc>>>,
    finished_at: Mutex<Option<DateTime<Utc>>>,
}

impl ExecutionGraph {
    /// Builds the graph from a step list: every step becomes a node, and for
    /// each `dep` in `step.depends` an edge `dep -> step` is added. Fails
    /// with `StepNotFound` for an unresolvable dependency name, or
    /// `CycleDetected` if the resulting graph isn't acyclic.
    pub fn build(steps: Vec<Step>) -> Result<Self, SchedulerError> {
        let mut graph = DiGraph::new();
        let mut index_by_name = HashMap::with_capacity(steps.len());

        for step in &steps {
            let idx = graph.add_node(Arc::new(Node::new(step.clone())));
            index_by_name.insert(step.name.clone(), idx);
        }

        for step in &steps {
            let v = index_by_name[&step.name];
            for dep in &step.depends {
                let u = index_by_name.get(dep).ok_or_else(|| SchedulerError::StepNotFound {
                    dependent: step.name.clone(),
                    dependency: dep.clone(),
                })?;
                graph.add_edge(*u, v, ());
            }
        }

        if let Err(cycle) = toposort(&graph, None) {
            let name = graph[cycle.node_id()].name().to_string();
            return Err(SchedulerError::CycleDetected { step: name });
        }

        Ok(Self {
            graph,
            index_by_name,
            started_at: Mutex::new(None),
            finished_at: Mutex::new(None),
        })
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Arc<Node>> {
        self.graph.node_weights()
    }

    pub fn node_by_name(&self, name: &str) -> Option<&Arc<Node>> {
        self.index_by_name.get(name).map(|idx| &self.graph[*idx])
    }

    fn index_of(&self, node: &Arc<Node>) -> NodeIndex {
        self.index_by_name[node.name()]
    }

    /// Direct upstream dependencies of `node`.
    pub fn predecessors(&self, node: &Arc<Node>) -> Vec<&Arc<Node>> {
        self.graph
            .neighbors_directed(self.index_of(node), Direction::Incoming)
            .map(|idx| &self.graph[idx])
            .collect()
    }

    /// Direct downstream dependents of `node`.
    pub fn successors(&self, node: &Arc<Node>) -> Vec<&Arc<Node>> {
        self.graph
            .neighbors_directed(self.index_of(node), Direction::Outgoing)
            .map(|idx| &self.graph[idx])
            .collect()
    }

    pub fn is_started(&self) -> bool {
        self.started_at.lock().unwrap().is_some()
    }

    pub fn is_finished(&self) -> bool {
        self.nodes().all(|n| n.is_finished())
    }

    pub fn mark_started(&self) {
        let mut at = self.started_at.lock().unwrap();
        if at.is_none() {
            *at = Some(Utc::now());
        }
    }

    pub fn mark_finished(&self) {
        let mut at = self.finished_at.lock().unwrap();
        if at.is_none() {
            *at = Some(Utc::now());
        }
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        *self.started_at.lock().unwrap()
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        *self.finished_at.lock().unwrap()
    }

    /// True when every upstream dependency of `node` is in a terminal state.
    pub fn upstream_finished(&self, node: &Arc<Node>) -> bool {
        self.predecessors(node).iter().all(|u| u.is_finished())
    }

    /// Resets every `Error`/`Canceled` node, and every node transitively
    /// downstream of one, back to `None` (§4.1 "Retry graph construction").
    /// `Success`/`Skipped` nodes with no failed ancestor are left untouched.
    pub fn reset_for_retry(&self) {
        let mut needs_retry: HashSet<NodeIndex> = HashSet::new();
        let roots: Vec<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|idx| {
                self.graph
                    .neighbors_directed(*idx, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .collect();

        let mut queue: VecDeque<NodeIndex> = roots.into();
        let mut visited: HashSet<NodeIndex> = HashSet::new();

        while let Some(idx) = queue.pop_front() {
            if !visited.insert(idx) {
                continue;
            }
            let node = &self.graph[idx];
            let failed = matches!(node.status(), Status::Error | Status::Canceled);
            if failed || needs_retry.contains(&idx) {
                node.reset_for_retry();
                needs_retry.insert(idx);
                for succ in self.graph.neighbors_directed(idx, Direction::Outgoing) {
                    needs_retry.insert(succ);
                }
            }
            for succ in self.graph.neighbors_directed(idx, Direction::Outgoing) {
                queue.push_back(succ);
            }
        }

        *self.started_at.lock().unwrap() = None;
        *self.finished_at.lock().unwrap() = None;
    }

    /// Builds the variable scope visible to `node`: every `output_variables`
    /// entry from every transitive upstream predecessor, loaded under each
    /// predecessor's own lock. When `all_nodes` is true (handler steps),
    /// every node in the graph contributes regardless of adjacency.
    pub fn scope_for(&self, node: &Arc<Node>, all_nodes: bool) -> Env {
        let mut env = Env::new();
        if all_nodes {
            for other in self.nodes() {
                env.extend(other.output_variables());
            }
            return env;
        }

        let start = self.index_of(node);
        let mut seen: HashSet<NodeIndex> = HashSet::new();
        let mut stack = vec![start];
        while let Some(idx) = stack.pop() {
            for pred in self.graph.neighbors_directed(idx, Direction::Incoming) {
                if seen.insert(pred) {
                    env.extend(self.graph[pred].output_variables());
                    stack.push(pred);
                }
            }
        }
        env
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::Step;

    fn step(name: &str, depends: &[&str]) -> Step {
        Step {
            name: name.to_string(),
            depends: depends.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn builds_linear_chain() {
        let graph = ExecutionGraph::build(vec![
            step("a", &[]),
            step("b", &["a"]),
            step("c", &["b"]),
        ])
        .unwrap();
        assert_eq!(graph.len(), 3);
        let b = graph.node_by_name("b").unwrap();
        assert_eq!(graph.predecessors(b).len(), 1);
        assert_eq!(graph.predecessors(b)[0].name(), "a");
    }

    #[test]
    fn detects_cycles() {
        let err = ExecutionGraph::build(vec![step("a", &["b"]), step("b", &["a"])]).unwrap_err();
        assert!(matches!(err, SchedulerError::CycleDetected { .. }));
    }

    #[test]
    fn rejects_unknown_dependency() {
        let err = ExecutionGraph::build(vec![step("a", &["missing"])]).unwrap_err();
        assert!(matches!(err, SchedulerError::StepNotFound { .. }));
    }

    #[test]
    fn reset_for_retry_clears_failed_descendants_only() {
        let graph = ExecutionGraph::build(vec![
            step("a", &[]),
            step("b", &["a"]),
            step("c", &["b"]),
        ])
        .unwrap();
        graph.node_by_name("a").unwrap().set_status(Status::Success);
        graph.node_by_name("b").unwrap().set_status(Status::Error);
        graph.node_by_name("c").unwrap().set_status(Status::Canceled);

        graph.reset_for_retry();

        assert_eq!(graph.node_by_name("a").unwrap().status(), Status::Success);
        assert_eq!(graph.node_by_name("b").unwrap().status(), Status::None);
        assert_eq!(graph.node_by_name("c").unwrap().status(), Status::None);
    }

    #[test]
    fn scope_for_collects_transitive_output_variables() {
        let graph = ExecutionGraph::build(vec![
            step("a", &[]),
            step("b", &["a"]),
            step("c", &["b"]),
        ])
        .unwrap();
        graph
            .node_by_name("a")
            .unwrap()
            .store_output_variable("GREETING".into(), "hi".into());

        let c = graph.node_by_name("c").unwrap();
        let env = graph.scope_for(c, false);
        assert_eq!(env.load("GREETING"), Some("hi"));
    }
}
