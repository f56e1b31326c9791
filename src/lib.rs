//! dagrunner: a concurrent scheduler for directed acyclic graphs of shell
//! steps. Drives a validated DAG to completion with bounded concurrency,
//! retry/repeat policies, output capture, and partial-success
//! classification. See `SPEC_FULL.md` for the full component design.

pub mod condition;
pub mod dag;
pub mod env;
pub mod error;
pub mod executor;
pub mod graph;
pub mod node;
pub mod output;
pub mod scheduler;
pub mod step;
