//! Workflow engine: a directed graph of named phases over a shared run state.
//!
//! A workflow is a [`WorkflowGraph`] of [`Phase`]s connected by [`Edge`]s.
//! Edges are unconditional or guarded by a pure function of the state that
//! picks a route label. Two strategies execute the same graph:
//!
//! - [`GraphStrategy`] walks the table one transition at a time and caps
//!   repeated visits to a node.
//! - [`SequentialStrategy`] compiles the table into a topological step list
//!   once and iterates it, evaluating the same routing inline.
//!
//! Both share the phase runner, so a phase failure is always recorded the
//! same way: appended to the state's error list, logged as a failed entry,
//! and the run carries on along the graph.

pub mod edge;
pub mod engine;
pub mod graph;
pub mod phase;
pub mod state;

pub use edge::{Edge, Guard, Target};
pub use engine::{build_engine, GraphStrategy, SequentialStrategy, WorkflowEngine};
pub use graph::{GraphBuilder, Route, WorkflowGraph};
pub use phase::{FnPhase, Phase, PhaseReport, PhaseResult};
pub use state::{LogEntry, RunLog, WorkflowState};
