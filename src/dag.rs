//! Demo-only YAML step loader (§10.4), generalized from the original
//! flow-loading module this crate grew out of. The scheduler core never
//! imports this: it depends only on [`crate::step::Step`].

use crate::graph::ExecutionGraph;
use crate::step::Step;
use serde::Deserialize;
use std::path::Path;

/// The top-level YAML document: a name plus an unordered list of steps.
#[derive(Debug, Clone, Deserialize)]
pub struct Dag {
    pub name: String,
    #[serde(default)]
    pub steps: Vec<Step>,
}

/// Reads `path`, parses it as a [`Dag`], and builds the corresponding
/// [`ExecutionGraph`]. Fails on malformed YAML, an unresolvable dependency
/// name, or a cycle.
pub async fn load_from_yaml(path: &Path) -> anyhow::Result<(Dag, ExecutionGraph)> {
    let contents = tokio::fs::read_to_string(path).await?;
    let dag: Dag = serde_yaml::from_str(&contents)?;
    let graph = ExecutionGraph::build(dag.steps.clone())?;
    Ok((dag, graph))
}
