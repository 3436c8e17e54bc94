use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::future::BoxFuture;
use tracing::{debug, error, info, warn};

use harvest_core::config::EngineKind;
use harvest_core::error::Result;
use harvest_core::event::{EventBus, WorkflowEvent};

use super::edge::Target;
use super::graph::WorkflowGraph;
use super::phase::Phase;
use super::state::WorkflowState;

/// Executes a workflow graph over a run state.
pub trait WorkflowEngine<S>: Send + Sync {
    fn kind(&self) -> EngineKind;

    /// Run the graph from its entry node and hand back the final state.
    ///
    /// Phase failures are recorded in the state. An `Err` means the graph
    /// itself is broken (unknown node, unmapped route).
    fn run(&self, state: S) -> BoxFuture<'_, Result<S>>;
}

/// Build the strategy selected by `kind` over a shared graph.
pub fn build_engine<S: WorkflowState>(
    kind: EngineKind,
    graph: Arc<WorkflowGraph<S>>,
    events: Arc<EventBus>,
    max_node_visits: usize,
) -> Result<Box<dyn WorkflowEngine<S>>> {
    Ok(match kind {
        EngineKind::Graph => {
            Box::new(GraphStrategy::new(graph, events).with_max_node_visits(max_node_visits))
        }
        EngineKind::Sequential => Box::new(SequentialStrategy::new(graph, events)?),
    })
}

/// Run one phase and record its outcome in the state.
async fn run_phase<S: WorkflowState>(phase: &dyn Phase<S>, state: &mut S, events: &EventBus) {
    let name = phase.name().to_string();
    let run_id = state.run_log().run_id.clone();
    state.run_log_mut().current_phase = name.clone();

    info!(run_id = %run_id, phase = %name, "Executing phase");
    events.publish(WorkflowEvent::PhaseStarted {
        run_id: run_id.clone(),
        phase: name.clone(),
    });

    let start = Instant::now();
    let outcome = phase.run(state).await;
    let elapsed_ms = start.elapsed().as_millis() as u64;

    match outcome {
        Ok(report) => {
            state
                .run_log_mut()
                .record(&name, true, report.quality_score);
            debug!(
                phase = %name,
                quality = report.quality_score,
                elapsed_ms,
                "Phase complete"
            );
            events.publish(WorkflowEvent::PhaseCompleted {
                run_id,
                phase: name,
                success: true,
                quality_score: report.quality_score,
                elapsed_ms,
            });
        }
        Err(e) => {
            warn!(phase = %name, error = %e, "Phase failed, continuing");
            let log = state.run_log_mut();
            log.errors.push(e.to_string());
            log.record(&name, false, 0.0);
            events.publish(WorkflowEvent::PhaseFailed {
                run_id,
                phase: name,
                error: e.to_string(),
            });
        }
    }
}

/// Resolve the next hop after `from` and announce it.
fn advance<S: WorkflowState>(
    graph: &WorkflowGraph<S>,
    from: &str,
    state: &S,
    events: &EventBus,
) -> Result<Option<String>> {
    let route = graph.route(from, state)?;
    let next = route.target.as_node().map(str::to_string);
    if let Some(label) = route.label {
        debug!(from = %from, route = label, to = ?next, "Route taken");
        events.publish(WorkflowEvent::RouteTaken {
            run_id: state.run_log().run_id.clone(),
            from: from.to_string(),
            route: label.to_string(),
            to: next.clone(),
        });
    }
    if route.target == Target::End {
        debug!(node = %from, "Reached END");
    }
    Ok(next)
}

fn announce_start<S: WorkflowState>(
    graph: &WorkflowGraph<S>,
    kind: EngineKind,
    state: &S,
    events: &EventBus,
) {
    let run_id = state.run_log().run_id.clone();
    info!(run_id = %run_id, workflow = %graph.name(), engine = kind.as_str(), "Workflow started");
    events.publish(WorkflowEvent::RunStarted {
        run_id,
        workflow: graph.name().to_string(),
        engine: kind.as_str().to_string(),
        timestamp: Utc::now(),
    });
}

fn announce_finish<S: WorkflowState>(state: &S, start: Instant, events: &EventBus) {
    let log = state.run_log();
    let elapsed_ms = start.elapsed().as_millis() as u64;
    info!(
        run_id = %log.run_id,
        phases = log.execution_log.len(),
        errors = log.errors.len(),
        elapsed_ms,
        "Workflow finished"
    );
    events.publish(WorkflowEvent::RunFinished {
        run_id: log.run_id.clone(),
        success: log.errors.is_empty(),
        errors: log.errors.len(),
        elapsed_ms,
    });
}

/// Walks the node/edge table one transition at a time.
///
/// Cycles are allowed; a node that has already run `max_node_visits` times
/// stops the walk.
pub struct GraphStrategy<S> {
    graph: Arc<WorkflowGraph<S>>,
    events: Arc<EventBus>,
    max_node_visits: usize,
}

impl<S: WorkflowState> GraphStrategy<S> {
    pub fn new(graph: Arc<WorkflowGraph<S>>, events: Arc<EventBus>) -> Self {
        Self {
            graph,
            events,
            max_node_visits: 5,
        }
    }

    pub fn with_max_node_visits(mut self, visits: usize) -> Self {
        self.max_node_visits = visits.max(1);
        self
    }

    async fn walk(&self, mut state: S) -> Result<S> {
        let start = Instant::now();
        announce_start(&self.graph, EngineKind::Graph, &state, &self.events);

        let mut visits: HashMap<String, usize> = HashMap::new();
        let mut current = Some(self.graph.entry().to_string());

        while let Some(node_id) = current.take() {
            let count = visits.entry(node_id.clone()).or_insert(0);
            if *count >= self.max_node_visits {
                warn!(
                    node_id = %node_id,
                    max_visits = self.max_node_visits,
                    "Node visit limit reached, terminating graph"
                );
                break;
            }
            *count += 1;

            let phase = match self.graph.node(&node_id) {
                Ok(phase) => phase.clone(),
                Err(e) => {
                    error!(node_id = %node_id, "Node not found in graph");
                    return Err(e);
                }
            };
            run_phase(phase.as_ref(), &mut state, &self.events).await;
            current = advance(&self.graph, &node_id, &state, &self.events)?;
        }

        announce_finish(&state, start, &self.events);
        Ok(state)
    }
}

impl<S: WorkflowState> WorkflowEngine<S> for GraphStrategy<S> {
    fn kind(&self) -> EngineKind {
        EngineKind::Graph
    }

    fn run(&self, state: S) -> BoxFuture<'_, Result<S>> {
        Box::pin(self.walk(state))
    }
}

/// Iterates a topological step list compiled once from the graph.
///
/// A step only runs when routing from the previous step selected it, so the
/// outcome matches [`GraphStrategy`] on every acyclic graph.
pub struct SequentialStrategy<S> {
    graph: Arc<WorkflowGraph<S>>,
    events: Arc<EventBus>,
    steps: Vec<String>,
}

impl<S: WorkflowState> SequentialStrategy<S> {
    /// Compile the graph. Fails on cyclic graphs.
    pub fn new(graph: Arc<WorkflowGraph<S>>, events: Arc<EventBus>) -> Result<Self> {
        let steps = graph.topological_order()?;
        debug!(workflow = %graph.name(), steps = ?steps, "Compiled sequential plan");
        Ok(Self {
            graph,
            events,
            steps,
        })
    }

    pub fn steps(&self) -> &[String] {
        &self.steps
    }

    async fn iterate(&self, mut state: S) -> Result<S> {
        let start = Instant::now();
        announce_start(&self.graph, EngineKind::Sequential, &state, &self.events);

        let mut next = Some(self.graph.entry().to_string());
        for step in &self.steps {
            match next.as_deref() {
                None => break,
                Some(wanted) if wanted != step => continue,
                Some(_) => {}
            }
            let phase = self.graph.node(step)?.clone();
            run_phase(phase.as_ref(), &mut state, &self.events).await;
            next = advance(&self.graph, step, &state, &self.events)?;
        }

        announce_finish(&state, start, &self.events);
        Ok(state)
    }
}

impl<S: WorkflowState> WorkflowEngine<S> for SequentialStrategy<S> {
    fn kind(&self) -> EngineKind {
        EngineKind::Sequential
    }

    fn run(&self, state: S) -> BoxFuture<'_, Result<S>> {
        Box::pin(self.iterate(state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::edge::Edge;
    use crate::workflow::phase::{FnPhase, PhaseReport, PhaseResult};
    use crate::workflow::state::RunLog;
    use harvest_core::error::PhaseError;

    #[derive(Debug, Default)]
    struct Counter {
        log: RunLog,
        value: u32,
        trace: Vec<String>,
    }

    impl WorkflowState for Counter {
        fn run_log(&self) -> &RunLog {
            &self.log
        }
        fn run_log_mut(&mut self) -> &mut RunLog {
            &mut self.log
        }
    }

    type Step = fn(&mut Counter) -> PhaseResult;

    fn step(name: &str, f: Step) -> FnPhase<Step> {
        FnPhase::new(name, f)
    }

    fn bump(c: &mut Counter) -> PhaseResult {
        c.value += 1;
        c.trace.push("bump".into());
        Ok(PhaseReport::new(0.9))
    }

    fn double(c: &mut Counter) -> PhaseResult {
        c.value *= 2;
        c.trace.push("double".into());
        Ok(PhaseReport::default())
    }

    fn explode(c: &mut Counter) -> PhaseResult {
        c.trace.push("explode".into());
        Err(PhaseError::new("explode", "kaboom"))
    }

    fn big_enough(c: &Counter) -> &'static str {
        if c.value >= 4 {
            "done"
        } else {
            "again"
        }
    }

    fn odd_or_even(c: &Counter) -> &'static str {
        if c.value % 2 == 0 {
            "even"
        } else {
            "odd"
        }
    }

    fn branching_graph() -> Arc<WorkflowGraph<Counter>> {
        Arc::new(
            WorkflowGraph::builder("branching")
                .node(step("bump", bump))
                .node(step("explode", explode))
                .node(step("double", double))
                .edge(Edge::always("bump", Target::node("explode")))
                .edge(Edge::conditional(
                    "explode",
                    odd_or_even,
                    [("odd", Target::node("double")), ("even", Target::End)],
                ))
                .entry("bump")
                .build()
                .unwrap(),
        )
    }

    fn cyclic_graph() -> Arc<WorkflowGraph<Counter>> {
        Arc::new(
            WorkflowGraph::builder("cyclic")
                .node(step("bump", bump))
                .edge(Edge::conditional(
                    "bump",
                    big_enough,
                    [("again", Target::node("bump")), ("done", Target::End)],
                ))
                .entry("bump")
                .build()
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn strategies_agree_on_branching_graph() {
        let events = Arc::new(EventBus::default());
        let graph = branching_graph();
        let by_graph = GraphStrategy::new(graph.clone(), events.clone())
            .run(Counter::default())
            .await
            .unwrap();
        let by_steps = SequentialStrategy::new(graph, events)
            .unwrap()
            .run(Counter::default())
            .await
            .unwrap();

        assert_eq!(by_graph.trace, vec!["bump", "explode", "double"]);
        assert_eq!(by_graph.trace, by_steps.trace);
        assert_eq!(by_graph.value, 2);
        assert_eq!(by_graph.value, by_steps.value);
        assert_eq!(by_graph.log.errors, vec!["explode error: kaboom"]);
        assert_eq!(by_graph.log.errors, by_steps.log.errors);
        assert_eq!(by_graph.log.phases(), by_steps.log.phases());
        let flags: Vec<bool> = by_graph.log.execution_log.iter().map(|e| e.success).collect();
        assert_eq!(flags, vec![true, false, true]);
    }

    #[tokio::test]
    async fn graph_strategy_follows_cycles() {
        let events = Arc::new(EventBus::default());
        let state = GraphStrategy::new(cyclic_graph(), events)
            .run(Counter::default())
            .await
            .unwrap();
        assert_eq!(state.value, 4);
        assert_eq!(state.log.execution_log.len(), 4);
    }

    #[tokio::test]
    async fn graph_strategy_caps_node_visits() {
        let events = Arc::new(EventBus::default());
        let start = Counter {
            value: 0,
            ..Default::default()
        };
        let state = GraphStrategy::new(cyclic_graph(), events)
            .with_max_node_visits(2)
            .run(start)
            .await
            .unwrap();
        assert_eq!(state.value, 2);
    }

    #[test]
    fn sequential_strategy_rejects_cycles() {
        let events = Arc::new(EventBus::default());
        assert!(SequentialStrategy::new(cyclic_graph(), events).is_err());
        let events = Arc::new(EventBus::default());
        assert!(build_engine(EngineKind::Sequential, cyclic_graph(), events, 5).is_err());
    }

    #[tokio::test]
    async fn events_are_published_in_order() {
        let events = Arc::new(EventBus::default());
        let mut rx = events.subscribe();
        let engine = build_engine(EngineKind::Graph, branching_graph(), events.clone(), 5).unwrap();
        assert_eq!(engine.kind(), EngineKind::Graph);
        engine.run(Counter::default()).await.unwrap();

        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            let json = serde_json::to_value(&event).unwrap();
            names.push(json["event"].as_str().unwrap().to_string());
        }
        assert_eq!(names.first().map(String::as_str), Some("run_started"));
        assert_eq!(names.last().map(String::as_str), Some("run_finished"));
        assert!(names.contains(&"phase_failed".to_string()));
        assert!(names.contains(&"route_taken".to_string()));
    }
}
