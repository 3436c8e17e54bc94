//! The multi-worker workflow: explore, optionally optimize, crawl, analyze
//! and validate one target with the worker pool.

use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use harvest_core::config::{EngineKind, TargetConfig};
use harvest_core::error::{PhaseError, Result};
use harvest_core::event::EventBus;
use harvest_core::types::{kinds, CrawlPattern, Item, Params, Task, TaskResult};

use crate::pipeline::Collaborators;
use crate::workers::{
    AnalysisReport, AnalysisSummary, ExplorationReport, OptimizationReport, ValidationReport,
    ValidationSchema, WorkerPool,
};
use crate::workflow::{
    build_engine, Edge, FnPhase, LogEntry, Phase, PhaseReport, PhaseResult, RunLog, Target,
    WorkflowEngine, WorkflowGraph, WorkflowState,
};

/// Exploration confidence below which the pattern is optimized before crawling.
pub const OPTIMIZE_BELOW: f64 = 0.8;
/// Quality reported when no analysis ran.
pub const DEFAULT_QUALITY: f64 = 0.8;

/// Inputs of one multi-worker run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunParams {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default = "default_depth")]
    pub depth: u32,
    #[serde(default = "default_true")]
    pub enable_optimization: bool,
    #[serde(default = "default_true")]
    pub enable_rag: bool,
    #[serde(default = "default_min_quality")]
    pub min_quality: f64,
}

fn default_depth() -> u32 {
    2
}
fn default_true() -> bool {
    true
}
fn default_min_quality() -> f64 {
    0.7
}

impl RunParams {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            keywords: vec![],
            depth: default_depth(),
            enable_optimization: true,
            enable_rag: true,
            min_quality: default_min_quality(),
        }
    }

    /// Read the params of a `coordinate_workflow` task.
    pub fn from_task(task: &Task) -> Result<Self> {
        Ok(serde_json::from_value(Value::Object(task.params.clone()))?)
    }

    pub fn to_params(&self) -> Params {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Params::new(),
        }
    }
}

impl From<&TargetConfig> for RunParams {
    fn from(target: &TargetConfig) -> Self {
        Self {
            url: target.url.clone(),
            keywords: target.keywords.clone(),
            depth: target.depth,
            enable_optimization: target.enable_optimization,
            enable_rag: target.enable_rag,
            min_quality: target.min_quality,
        }
    }
}

/// What the crawl phase produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlReport {
    pub items: Vec<Item>,
    pub pattern_used: CrawlPattern,
    pub new_items: usize,
    pub duplicates: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_error: Option<String>,
}

/// Run-state of the multi-worker workflow. Each slot stays `None` until its
/// phase has produced a result.
#[derive(Debug, Clone, Serialize)]
pub struct RunState {
    pub log: RunLog,
    pub params: RunParams,
    pub exploration: Option<ExplorationReport>,
    pub optimization: Option<OptimizationReport>,
    pub crawl: Option<CrawlReport>,
    pub analysis: Option<AnalysisReport>,
    pub validation: Option<ValidationReport>,
}

impl RunState {
    pub fn new(params: RunParams) -> Self {
        Self {
            log: RunLog::default(),
            params,
            exploration: None,
            optimization: None,
            crawl: None,
            analysis: None,
            validation: None,
        }
    }
}

impl WorkflowState for RunState {
    fn run_log(&self) -> &RunLog {
        &self.log
    }

    fn run_log_mut(&mut self) -> &mut RunLog {
        &mut self.log
    }
}

// -- Guards --

pub fn should_optimize(state: &RunState) -> &'static str {
    if !state.params.enable_optimization {
        return "skip";
    }
    let confidence = state.exploration.as_ref().map_or(0.0, |e| e.confidence);
    if confidence < OPTIMIZE_BELOW {
        "optimize"
    } else {
        "skip"
    }
}

pub fn should_validate(state: &RunState) -> &'static str {
    let kept = state.analysis.as_ref().map_or(0, |a| a.summary.kept_items);
    if kept > 0 {
        "validate"
    } else {
        "skip"
    }
}

// -- Phases --

fn init(state: &mut RunState) -> PhaseResult {
    if state.params.url.trim().is_empty() {
        return Err(PhaseError::new("init", "no target url"));
    }
    Ok(PhaseReport::default())
}

fn subtask(state: &RunState, suffix: &str, kind: &str, params: Value) -> Task {
    let params = match params {
        Value::Object(map) => map,
        _ => Params::new(),
    };
    Task::new(kind, params).with_id(format!("{}_{}", state.log.run_id, suffix))
}

/// Turn a worker result into a typed report, or the phase error it stands for.
fn read_report<T: serde::de::DeserializeOwned>(
    phase: &str,
    result: &TaskResult,
) -> std::result::Result<T, PhaseError> {
    if !result.success {
        let error = result.error.as_deref().unwrap_or("worker failed");
        return Err(PhaseError::new(phase, error));
    }
    result
        .data_as()
        .map_err(|e| PhaseError::from_error(phase, &e))
}

struct ExplorePhase {
    pool: Arc<WorkerPool>,
}

impl Phase<RunState> for ExplorePhase {
    fn name(&self) -> &str {
        "explore"
    }

    fn run<'a>(&'a self, state: &'a mut RunState) -> BoxFuture<'a, PhaseResult> {
        Box::pin(async move {
            let task = subtask(
                state,
                "explore",
                kinds::EXPLORE,
                json!({"url": state.params.url, "depth": state.params.depth}),
            );
            let result = self.pool.dispatch(task).await;
            let report: ExplorationReport = read_report("explore", &result)?;
            state.exploration = Some(report);
            Ok(PhaseReport::new(result.quality_score))
        })
    }
}

struct OptimizePhase {
    pool: Arc<WorkerPool>,
}

impl Phase<RunState> for OptimizePhase {
    fn name(&self) -> &str {
        "optimize"
    }

    fn run<'a>(&'a self, state: &'a mut RunState) -> BoxFuture<'a, PhaseResult> {
        Box::pin(async move {
            let current = state
                .exploration
                .as_ref()
                .map(|e| e.pattern_suggestion.clone())
                .unwrap_or_default();
            let task = subtask(
                state,
                "optimize",
                kinds::OPTIMIZE,
                json!({
                    "url": state.params.url,
                    "current_pattern": current,
                    "performance_data": {"success_rate": 0.7, "avg_time": 2.0},
                    "enable_ab_test": false,
                    "enable_rag": state.params.enable_rag,
                }),
            );
            let result = self.pool.dispatch(task).await;
            let report: OptimizationReport = read_report("optimize", &result)?;
            state.optimization = Some(report);
            Ok(PhaseReport::new(result.quality_score))
        })
    }
}

struct CrawlPhase {
    collab: Collaborators,
}

impl CrawlPhase {
    fn pattern(state: &RunState) -> CrawlPattern {
        if let Some(opt) = &state.optimization {
            return opt.optimized_pattern.clone();
        }
        state
            .exploration
            .as_ref()
            .map(|e| e.pattern_suggestion.clone())
            .unwrap_or_default()
    }
}

impl Phase<RunState> for CrawlPhase {
    fn name(&self) -> &str {
        "crawl"
    }

    fn run<'a>(&'a self, state: &'a mut RunState) -> BoxFuture<'a, PhaseResult> {
        Box::pin(async move {
            let pattern_used = Self::pattern(state);
            let raw = match self.collab.source.crawl(&state.params.url).await {
                Ok(raw) => raw,
                Err(e) => {
                    state.crawl = Some(CrawlReport {
                        items: vec![],
                        pattern_used,
                        new_items: 0,
                        duplicates: 0,
                        storage_error: None,
                    });
                    return Err(PhaseError::from_error("crawl", &e));
                }
            };

            let mut items = Vec::with_capacity(raw.len());
            for item in raw {
                let url = item.url.clone();
                match self.collab.parser.parse(item).await {
                    Ok(Some(item)) => items.push(item),
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

            let (new_items, storage_error) =
                match self.collab.storage.batch_check_and_store(items.clone()).await {
                    Ok(fresh) => (fresh.len(), None),
                    Err(e) => {
                        warn!(error = %e, "Failed to store crawled items");
                        (0, Some(e.to_string()))
                    }
                };
            let duplicates = if storage_error.is_some() {
                0
            } else {
                items.len().saturating_sub(new_items)
            };
            info!(
                url = %state.params.url,
                items = items.len(),
                new = new_items,
                duplicates,
                "Crawl complete"
            );

            let quality = if items.is_empty() { 0.0 } else { 1.0 };
            state.crawl = Some(CrawlReport {
                items,
                pattern_used,
                new_items,
                duplicates,
                storage_error,
            });
            Ok(PhaseReport::new(quality))
        })
    }
}

struct AnalyzePhase {
    pool: Arc<WorkerPool>,
}

impl Phase<RunState> for AnalyzePhase {
    fn name(&self) -> &str {
        "analyze"
    }

    fn run<'a>(&'a self, state: &'a mut RunState) -> BoxFuture<'a, PhaseResult> {
        Box::pin(async move {
            let items = state
                .crawl
                .as_ref()
                .map(|c| c.items.clone())
                .unwrap_or_default();
            let task = subtask(
                state,
                "analyze",
                kinds::ANALYZE,
                json!({
                    "items": items,
                    "keywords": state.params.keywords,
                    "min_quality": state.params.min_quality,
                }),
            );
            let result = self.pool.dispatch(task).await;
            let report: AnalysisReport = read_report("analyze", &result)?;
            state.analysis = Some(report);
            Ok(PhaseReport::new(result.quality_score))
        })
    }
}

struct ValidatePhase {
    pool: Arc<WorkerPool>,
}

impl Phase<RunState> for ValidatePhase {
    fn name(&self) -> &str {
        "validate"
    }

    fn run<'a>(&'a self, state: &'a mut RunState) -> BoxFuture<'a, PhaseResult> {
        Box::pin(async move {
            let kept = state
                .analysis
                .as_ref()
                .map(|a| a.kept_items.clone())
                .unwrap_or_default();
            let task = subtask(
                state,
                "validate",
                kinds::VALIDATE,
                json!({"items": kept, "schema": ValidationSchema::default()}),
            );
            let result = self.pool.dispatch(task).await;
            let report: ValidationReport = read_report("validate", &result)?;
            state.validation = Some(report);
            Ok(PhaseReport::new(result.quality_score))
        })
    }
}

/// `init -> explore -> (optimize | crawl)`, `optimize -> crawl -> analyze -> (validate | END)`.
pub fn multi_graph(
    pool: Arc<WorkerPool>,
    collab: &Collaborators,
) -> Result<WorkflowGraph<RunState>> {
    WorkflowGraph::builder("multi_worker")
        .node(FnPhase::new("init", init))
        .node(ExplorePhase { pool: pool.clone() })
        .node(OptimizePhase { pool: pool.clone() })
        .node(CrawlPhase {
            collab: collab.clone(),
        })
        .node(AnalyzePhase { pool: pool.clone() })
        .node(ValidatePhase { pool })
        .edge(Edge::always("init", Target::node("explore")))
        .edge(Edge::conditional(
            "explore",
            should_optimize,
            [
                ("optimize", Target::node("optimize")),
                ("skip", Target::node("crawl")),
            ],
        ))
        .edge(Edge::always("optimize", Target::node("crawl")))
        .edge(Edge::always("crawl", Target::node("analyze")))
        .edge(Edge::conditional(
            "analyze",
            should_validate,
            [("validate", Target::node("validate")), ("skip", Target::End)],
        ))
        .entry("init")
        .build()
}

/// The integrated outcome of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalResult {
    pub items: Vec<Item>,
    pub total_items: usize,
    pub new_items: usize,
    pub pattern_used: Option<CrawlPattern>,
    pub statistics: Option<AnalysisSummary>,
    pub quality_score: f64,
    pub workflow_log: Vec<LogEntry>,
}

/// Validated items win, crawled items are the fallback.
pub fn integrate_results(state: &RunState) -> FinalResult {
    let validated = state
        .validation
        .as_ref()
        .map(|v| v.valid_items.clone())
        .unwrap_or_default();
    let items = if validated.is_empty() {
        state
            .crawl
            .as_ref()
            .map(|c| c.items.clone())
            .unwrap_or_default()
    } else {
        validated
    };
    let statistics = state.analysis.as_ref().map(|a| a.summary.clone());

    FinalResult {
        total_items: items.len(),
        new_items: statistics.as_ref().map_or(items.len(), |s| s.kept_items),
        pattern_used: state
            .exploration
            .as_ref()
            .map(|e| e.pattern_suggestion.clone()),
        quality_score: statistics
            .as_ref()
            .map_or(DEFAULT_QUALITY, |s| s.avg_quality),
        statistics,
        workflow_log: state.log.execution_log.clone(),
        items,
    }
}

/// Outcome of one multi-worker run.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowReport {
    pub run_id: String,
    pub success: bool,
    pub final_result: FinalResult,
    pub state: RunState,
    pub engine: String,
    pub execution_ms: u64,
    pub phases_executed: usize,
    pub errors: Vec<String>,
}

/// Runs the multi-worker graph with a chosen strategy.
pub struct MultiWorkerWorkflow {
    engine: Box<dyn WorkflowEngine<RunState>>,
    pool: Arc<WorkerPool>,
}

impl MultiWorkerWorkflow {
    pub fn new(
        pool: Arc<WorkerPool>,
        collab: &Collaborators,
        kind: EngineKind,
        events: Arc<EventBus>,
        max_node_visits: usize,
    ) -> Result<Self> {
        let graph = Arc::new(multi_graph(pool.clone(), collab)?);
        Ok(Self {
            engine: build_engine(kind, graph, events, max_node_visits)?,
            pool,
        })
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn kind(&self) -> EngineKind {
        self.engine.kind()
    }

    pub async fn run(&self, params: RunParams) -> Result<WorkflowReport> {
        let start = Instant::now();
        info!(url = %params.url, engine = self.kind().as_str(), "Starting multi-worker workflow");
        let state = self.engine.run(RunState::new(params)).await?;
        let final_result = integrate_results(&state);
        Ok(WorkflowReport {
            run_id: state.log.run_id.clone(),
            success: state.log.succeeded(),
            engine: self.kind().as_str().to_string(),
            execution_ms: start.elapsed().as_millis() as u64,
            phases_executed: state.log.execution_log.len(),
            errors: state.log.errors.clone(),
            final_result,
            state,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harvest_core::config::WorkersConfig;
    use harvest_core::traits::CrawlSource;
    use harvest_test_utils::{
        news_items, FailingCrawlSource, MemoryStorage, PassthroughParser, RecordingNotifier,
        StaticCrawlSource, StaticPatternRetriever,
    };

    fn collab(source: Arc<dyn CrawlSource>) -> Collaborators {
        Collaborators::new(
            source,
            Arc::new(PassthroughParser),
            Arc::new(MemoryStorage::with_seen(["https://news.test/articles/0"])),
            Arc::new(RecordingNotifier::new()),
        )
        .with_retriever(Arc::new(StaticPatternRetriever::with_tuned_pattern()))
    }

    fn workflow(collab: &Collaborators, kind: EngineKind) -> MultiWorkerWorkflow {
        let pool = Arc::new(WorkerPool::standard(collab, &WorkersConfig::default()));
        MultiWorkerWorkflow::new(pool, collab, kind, Arc::new(EventBus::default()), 5).unwrap()
    }

    fn exploration(confidence: f64) -> ExplorationReport {
        let mut report = crate::workers::explorer::explore("https://news.test", 2, &[], None);
        report.confidence = confidence;
        report
    }

    fn params() -> RunParams {
        RunParams {
            keywords: vec!["chips".into()],
            ..RunParams::new("https://news.test")
        }
    }

    #[test]
    fn optimize_guard_follows_confidence() {
        let mut state = RunState::new(params());
        assert_eq!(should_optimize(&state), "optimize");
        state.exploration = Some(exploration(0.5));
        assert_eq!(should_optimize(&state), "optimize");
        state.exploration = Some(exploration(0.9));
        assert_eq!(should_optimize(&state), "skip");
        state.exploration = Some(exploration(0.5));
        state.params.enable_optimization = false;
        assert_eq!(should_optimize(&state), "skip");
    }

    #[test]
    fn validate_guard_follows_kept_items() {
        let mut state = RunState::new(params());
        assert_eq!(should_validate(&state), "skip");
        state.analysis = Some(crate::workers::analyst::analyze(vec![], &[], 0.7));
        assert_eq!(should_validate(&state), "skip");
        state.analysis = Some(crate::workers::analyst::analyze(
            harvest_test_utils::parsed_news_items(1),
            &[],
            0.5,
        ));
        assert_eq!(should_validate(&state), "validate");
    }

    #[tokio::test]
    async fn confident_exploration_skips_optimizer() {
        // 12 items: clarity 1.0, content, pagination, no anti-scraping => confidence 1.0
        let c = collab(Arc::new(StaticCrawlSource::new(news_items(12))));
        let report = workflow(&c, EngineKind::Graph).run(params()).await.unwrap();

        assert!(report.success, "errors: {:?}", report.errors);
        assert_eq!(
            report.state.log.phases(),
            vec!["init", "explore", "crawl", "analyze", "validate"]
        );
        assert!(report.state.optimization.is_none());
        let crawl = report.state.crawl.as_ref().unwrap();
        assert_eq!(crawl.items.len(), 12);
        assert_eq!(crawl.new_items, 11);
        assert_eq!(crawl.duplicates, 1);
        assert_eq!(crawl.pattern_used.crawler, "static");
        assert_eq!(report.final_result.total_items, 12);
        assert_eq!(report.phases_executed, 5);
    }

    #[tokio::test]
    async fn weak_exploration_runs_optimizer_before_crawl() {
        // untitled items: clarity 0.7 and no pagination => confidence 0.7
        let items: Vec<_> = news_items(3)
            .into_iter()
            .map(|mut i| {
                i.title.clear();
                i
            })
            .collect();
        let c = collab(Arc::new(StaticCrawlSource::new(items)));
        let report = workflow(&c, EngineKind::Graph).run(params()).await.unwrap();

        let phases = report.state.log.phases();
        assert_eq!(&phases[..4], &["init", "explore", "optimize", "crawl"]);
        let optimized = report.state.optimization.as_ref().unwrap();
        assert_eq!(optimized.optimized_pattern.concurrency, Some(2));
        assert_eq!(
            report.state.crawl.as_ref().unwrap().pattern_used,
            optimized.optimized_pattern
        );
    }

    #[tokio::test]
    async fn crawl_failure_is_recorded_and_run_continues() {
        let c = collab(Arc::new(FailingCrawlSource::new("connection reset")));
        let report = workflow(&c, EngineKind::Graph).run(params()).await.unwrap();

        assert!(!report.success);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].starts_with("crawl error"));
        assert_eq!(
            report.state.log.phases(),
            vec!["init", "explore", "optimize", "crawl", "analyze"]
        );
        assert!(report.state.validation.is_none());
        assert_eq!(report.final_result.total_items, 0);
        assert_eq!(report.final_result.quality_score, 0.0);
    }

    #[tokio::test]
    async fn parse_failures_fail_the_run() {
        let mut items = news_items(12);
        items.push(harvest_test_utils::raw_item(
            "!malformed",
            "https://news.test/bad",
            "",
        ));
        let c = collab(Arc::new(StaticCrawlSource::new(items)));
        let report = workflow(&c, EngineKind::Graph).run(params()).await.unwrap();

        assert!(!report.success);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].starts_with("parse error"));
        assert_eq!(report.state.crawl.as_ref().map(|c| c.items.len()), Some(12));
    }

    #[tokio::test]
    async fn integrate_prefers_validated_items() {
        let c = collab(Arc::new(StaticCrawlSource::new(news_items(4))));
        let report = workflow(&c, EngineKind::Sequential).run(params()).await.unwrap();
        let validated = report.state.validation.as_ref().unwrap();
        assert_eq!(report.final_result.items, validated.valid_items);
        assert_eq!(report.final_result.new_items, 4);
        let stats = report.final_result.statistics.as_ref().unwrap();
        assert_eq!(report.final_result.quality_score, stats.avg_quality);
        assert_eq!(report.final_result.workflow_log.len(), report.phases_executed);
    }

    #[test]
    fn integrate_defaults_without_analysis() {
        let state = RunState::new(params());
        let result = integrate_results(&state);
        assert_eq!(result.quality_score, DEFAULT_QUALITY);
        assert!(result.items.is_empty());
        assert!(result.pattern_used.is_none());
    }

    #[tokio::test]
    async fn strategies_agree() {
        let run = |kind| async move {
            let c = collab(Arc::new(StaticCrawlSource::new(news_items(5))));
            workflow(&c, kind).run(params()).await.unwrap()
        };
        let a = run(EngineKind::Graph).await;
        let b = run(EngineKind::Sequential).await;

        assert_eq!(a.state.log.phases(), b.state.log.phases());
        assert_eq!(a.errors, b.errors);
        let scores = |r: &WorkflowReport| {
            r.state
                .log
                .execution_log
                .iter()
                .map(|e| (e.success, e.quality_score))
                .collect::<Vec<_>>()
        };
        assert_eq!(scores(&a), scores(&b));
        assert_eq!(a.state.crawl, b.state.crawl);
        assert_eq!(
            a.state.analysis.as_ref().map(|r| &r.summary),
            b.state.analysis.as_ref().map(|r| &r.summary)
        );
        assert_eq!(a.final_result.items, b.final_result.items);
        assert_eq!(a.final_result.quality_score, b.final_result.quality_score);
    }

    #[test]
    fn params_from_task_use_defaults() {
        let mut p = Params::new();
        p.insert("url".into(), json!("https://news.test"));
        let task = Task::new(kinds::COORDINATE, p);
        let params = RunParams::from_task(&task).unwrap();
        assert_eq!(params, RunParams::new("https://news.test"));
        let again = Task::new(kinds::COORDINATE, params.to_params());
        assert_eq!(RunParams::from_task(&again).unwrap(), params);
    }
}
