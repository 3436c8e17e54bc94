use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use tracing::{info, warn};

use harvest_core::config::EngineKind;
use harvest_core::error::{PhaseError, Result};
use harvest_core::event::EventBus;
use harvest_core::traits::{CrawlSource, ItemParser, Notifier, PatternRetriever, Storage};
use harvest_core::types::{Item, RawItem};

use crate::workflow::{
    build_engine, Edge, FnPhase, Phase, PhaseReport, PhaseResult, RunLog, Target, WorkflowEngine,
    WorkflowGraph, WorkflowState,
};

/// Accumulated phase errors above which the run is abandoned.
pub const MAX_ERRORS: usize = 10;

/// The external collaborators a run talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub source: Arc<dyn CrawlSource>,
    pub parser: Arc<dyn ItemParser>,
    pub storage: Arc<dyn Storage>,
    pub notifier: Arc<dyn Notifier>,
    pub retriever: Option<Arc<dyn PatternRetriever>>,
}

impl Collaborators {
    pub fn new(
        source: Arc<dyn CrawlSource>,
        parser: Arc<dyn ItemParser>,
        storage: Arc<dyn Storage>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            source,
            parser,
            storage,
            notifier,
            retriever: None,
        }
    }

    pub fn with_retriever(mut self, retriever: Arc<dyn PatternRetriever>) -> Self {
        self.retriever = Some(retriever);
        self
    }
}

/// Run-state of the primary crawl pipeline. Each slot stays `None` until
/// its phase has run.
#[derive(Debug, Clone)]
pub struct PipelineState {
    pub log: RunLog,
    pub url: String,
    pub raw_items: Option<Vec<RawItem>>,
    pub parsed_items: Option<Vec<Item>>,
    pub new_items: Option<Vec<Item>>,
    pub notified: Option<usize>,
}

impl PipelineState {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            log: RunLog::default(),
            url: url.into(),
            raw_items: None,
            parsed_items: None,
            new_items: None,
            notified: None,
        }
    }
}

impl WorkflowState for PipelineState {
    fn run_log(&self) -> &RunLog {
        &self.log
    }

    fn run_log_mut(&mut self) -> &mut RunLog {
        &mut self.log
    }
}

// -- Guards --

/// `"end"` once too many errors piled up or the crawl came back empty.
pub fn should_continue(state: &PipelineState) -> &'static str {
    let no_items = state.raw_items.as_ref().map_or(true, Vec::is_empty);
    if state.log.errors.len() > MAX_ERRORS || no_items {
        "end"
    } else {
        "continue"
    }
}

/// `"notify"` iff the store phase inserted anything.
pub fn should_notify(state: &PipelineState) -> &'static str {
    match &state.new_items {
        Some(items) if !items.is_empty() => "notify",
        _ => "end",
    }
}

// -- Phases --

fn init(state: &mut PipelineState) -> PhaseResult {
    if state.url.trim().is_empty() {
        return Err(PhaseError::new("init", "no target url"));
    }
    Ok(PhaseReport::default())
}

struct CrawlPhase {
    source: Arc<dyn CrawlSource>,
}

impl Phase<PipelineState> for CrawlPhase {
    fn name(&self) -> &str {
        "crawl"
    }

    fn run<'a>(&'a self, state: &'a mut PipelineState) -> BoxFuture<'a, PhaseResult> {
        Box::pin(async move {
            match self.source.crawl(&state.url).await {
                Ok(items) => {
                    info!(url = %state.url, count = items.len(), "Crawled items");
                    let quality = if items.is_empty() { 0.0 } else { 1.0 };
                    state.raw_items = Some(items);
                    Ok(PhaseReport::new(quality))
                }
                Err(e) => {
                    state.raw_items = Some(vec![]);
                    Err(PhaseError::from_error("crawl", &e))
                }
            }
        })
    }
}

struct ParsePhase {
    parser: Arc<dyn ItemParser>,
}

impl Phase<PipelineState> for ParsePhase {
    fn name(&self) -> &str {
        "parse"
    }

    fn run<'a>(&'a self, state: &'a mut PipelineState) -> BoxFuture<'a, PhaseResult> {
        Box::pin(async move {
            let raw = state.raw_items.clone().unwrap_or_default();
            let total = raw.len();
            let mut parsed = Vec::with_capacity(total);
            for item in raw {
                let url = item.url.clone();
                match self.parser.parse(item).await {
                    Ok(Some(item)) => parsed.push(item),
                    Ok(None) => {}
                    Err(e) => {
                        warn!(url = %url, error = %e, "Skipping unparseable item");
                        state
                            .log
                            .errors
                            .push(PhaseError::from_error("parse", &e).to_string());
                    }
                }
            }
            let quality = if total == 0 {
                1.0
            } else {
                parsed.len() as f64 / total as f64
            };
            state.parsed_items = Some(parsed);
            Ok(PhaseReport::new(quality))
        })
    }
}

struct StorePhase {
    storage: Arc<dyn Storage>,
}

impl Phase<PipelineState> for StorePhase {
    fn name(&self) -> &str {
        "store"
    }

    fn run<'a>(&'a self, state: &'a mut PipelineState) -> BoxFuture<'a, PhaseResult> {
        Box::pin(async move {
            let parsed = state.parsed_items.clone().unwrap_or_default();
            let total = parsed.len();
            match self.storage.batch_check_and_store(parsed).await {
                Ok(fresh) => {
                    info!(stored = total, new = fresh.len(), "Stored items");
                    state.new_items = Some(fresh);
                    Ok(PhaseReport::default())
                }
                Err(e) => {
                    state.new_items = Some(vec![]);
                    Err(PhaseError::from_error("store", &e))
                }
            }
        })
    }
}

struct NotifyPhase {
    notifier: Arc<dyn Notifier>,
}

impl Phase<PipelineState> for NotifyPhase {
    fn name(&self) -> &str {
        "notify"
    }

    fn run<'a>(&'a self, state: &'a mut PipelineState) -> BoxFuture<'a, PhaseResult> {
        Box::pin(async move {
            let items = state.new_items.clone().unwrap_or_default();
            let count = items.len();
            self.notifier
                .send(items)
                .await
                .map_err(|e| PhaseError::from_error("notify", &e))?;
            state.notified = Some(count);
            Ok(PhaseReport::default())
        })
    }
}

/// `init -> crawl -> (parse | END) -> parse -> store -> (notify | END)`.
pub fn primary_graph(collab: &Collaborators) -> Result<WorkflowGraph<PipelineState>> {
    let init: fn(&mut PipelineState) -> PhaseResult = init;
    WorkflowGraph::builder("primary")
        .node(FnPhase::new("init", init))
        .node(CrawlPhase {
            source: collab.source.clone(),
        })
        .node(ParsePhase {
            parser: collab.parser.clone(),
        })
        .node(StorePhase {
            storage: collab.storage.clone(),
        })
        .node(NotifyPhase {
            notifier: collab.notifier.clone(),
        })
        .edge(Edge::always("init", Target::node("crawl")))
        .edge(Edge::conditional(
            "crawl",
            should_continue,
            [("continue", Target::node("parse")), ("end", Target::End)],
        ))
        .edge(Edge::always("parse", Target::node("store")))
        .edge(Edge::conditional(
            "store",
            should_notify,
            [("notify", Target::node("notify")), ("end", Target::End)],
        ))
        .entry("init")
        .build()
}

/// Summary of one primary pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineOutcome {
    pub run_id: String,
    pub url: String,
    pub success: bool,
    pub items_processed: usize,
    pub items_new: usize,
    pub errors: Vec<String>,
    pub engine: String,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}

/// The crawl → parse → store → notify pipeline.
pub struct Pipeline {
    engine: Box<dyn WorkflowEngine<PipelineState>>,
}

impl Pipeline {
    pub fn new(
        collab: &Collaborators,
        kind: EngineKind,
        events: Arc<EventBus>,
        max_node_visits: usize,
    ) -> Result<Self> {
        let graph = Arc::new(primary_graph(collab)?);
        Ok(Self {
            engine: build_engine(kind, graph, events, max_node_visits)?,
        })
    }

    /// Run the pipeline and return the final state.
    pub async fn run_state(&self, url: &str) -> Result<PipelineState> {
        self.engine.run(PipelineState::new(url)).await
    }

    pub async fn run(&self, url: &str) -> Result<PipelineOutcome> {
        let start = Instant::now();
        let state = self.run_state(url).await?;
        Ok(PipelineOutcome {
            run_id: state.log.run_id.clone(),
            url: state.url.clone(),
            success: state.log.succeeded(),
            items_processed: state.parsed_items.as_ref().map_or(0, Vec::len),
            items_new: state.new_items.as_ref().map_or(0, Vec::len),
            errors: state.log.errors.clone(),
            engine: self.engine.kind().as_str().to_string(),
            started_at: state.log.started_at,
            elapsed_ms: start.elapsed().as_millis() as u64,
        })
    }
}
