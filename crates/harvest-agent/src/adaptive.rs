//! Adaptive re-planning around the multi-worker workflow.
//!
//! [`AdaptiveController`] re-runs the workflow with adjusted parameters until
//! the final quality clears the threshold or the iteration budget runs out.
//! [`CachedController`] memoizes successful outcomes per target URL.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use indexmap::IndexMap;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use harvest_core::config::AdaptiveConfig;
use harvest_core::error::Result;

use crate::multi::{FinalResult, MultiWorkerWorkflow, RunParams, WorkflowReport};
use crate::workflow::LogEntry;

/// Something that can execute one multi-worker run.
pub trait WorkflowRunner: Send + Sync {
    fn run_workflow(&self, params: RunParams) -> BoxFuture<'_, Result<WorkflowReport>>;
}

impl WorkflowRunner for MultiWorkerWorkflow {
    fn run_workflow(&self, params: RunParams) -> BoxFuture<'_, Result<WorkflowReport>> {
        Box::pin(self.run(params))
    }
}

/// One pass of the adaptive loop.
#[derive(Debug, Clone, Serialize)]
pub struct Iteration {
    pub iteration: u32,
    pub params: RunParams,
    pub success: bool,
    pub quality_score: f64,
    pub execution_log: Vec<LogEntry>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdaptiveReport {
    pub success: bool,
    pub final_result: Option<FinalResult>,
    pub iterations: u32,
    pub execution_history: Vec<Iteration>,
    pub adaptations_made: bool,
    pub from_cache: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct AdaptiveController {
    runner: Arc<dyn WorkflowRunner>,
    max_iterations: u32,
    quality_threshold: f64,
    phase_quality_floor: f64,
}

impl AdaptiveController {
    pub fn new(runner: Arc<dyn WorkflowRunner>, config: &AdaptiveConfig) -> Self {
        Self {
            runner,
            max_iterations: config.max_iterations.max(1),
            quality_threshold: config.quality_threshold,
            phase_quality_floor: config.phase_quality_floor,
        }
    }

    pub async fn run(&self, params: RunParams) -> AdaptiveReport {
        let mut params = params;
        let mut history = Vec::new();
        let mut iteration = 0;
        let mut success = false;
        let mut final_result = None;
        let mut error = None;

        while iteration < self.max_iterations {
            iteration += 1;
            info!(iteration, max = self.max_iterations, url = %params.url, "Adaptive iteration");

            let report = match self.runner.run_workflow(params.clone()).await {
                Ok(report) => report,
                Err(e) => {
                    warn!(iteration, error = %e, "Workflow failed outright");
                    error = Some(e.to_string());
                    break;
                }
            };

            let quality = report.final_result.quality_score;
            history.push(Iteration {
                iteration,
                params: params.clone(),
                success: report.success,
                quality_score: quality,
                execution_log: report.state.log.execution_log.clone(),
                errors: report.errors.clone(),
            });
            success = report.success;

            if !report.success {
                warn!(iteration, errors = ?report.errors, "Workflow run unsuccessful");
                error = report.errors.first().cloned();
                final_result = Some(report.final_result);
                break;
            }
            if quality >= self.quality_threshold {
                info!(iteration, quality, "Quality threshold met");
                final_result = Some(report.final_result);
                break;
            }

            warn!(
                iteration,
                quality,
                threshold = self.quality_threshold,
                "Quality below threshold, adapting"
            );
            params = self.adapt(&report, params);
            final_result = Some(report.final_result);
        }

        AdaptiveReport {
            success,
            final_result,
            iterations: iteration,
            execution_history: history,
            adaptations_made: iteration > 1,
            from_cache: false,
            error,
        }
    }

    /// Parameters for the next iteration, derived from the weak phases of `report`.
    pub fn adapt(&self, report: &WorkflowReport, mut params: RunParams) -> RunParams {
        let weak: Vec<&str> = report
            .state
            .log
            .execution_log
            .iter()
            .filter(|e| e.quality_score < self.phase_quality_floor)
            .map(|e| e.phase.as_str())
            .collect();
        debug!(phases = ?weak, "Phases below quality floor");

        if weak.contains(&"explore") {
            params.depth += 1;
            info!(depth = params.depth, "Increased exploration depth");
        }
        if weak.contains(&"analyze") {
            params.min_quality = (params.min_quality - 0.1).max(0.0);
            info!(min_quality = params.min_quality, "Lowered analysis threshold");
        }
        if weak.contains(&"validate") {
            params.enable_optimization = true;
            info!("Enabled pattern optimization");
        }
        if report.final_result.quality_score < self.phase_quality_floor {
            params.enable_rag = true;
            info!("Enabled pattern retrieval");
        }
        params
    }
}

struct CacheEntry {
    report: AdaptiveReport,
    stored_at: Instant,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub capacity: usize,
    pub ttl_secs: u64,
    pub hits: u64,
    pub misses: u64,
    pub cached_urls: Vec<String>,
}

#[derive(Default)]
struct Cache {
    entries: IndexMap<String, CacheEntry>,
    hits: u64,
    misses: u64,
}

/// Adaptive controller with a bounded LRU + TTL cache keyed by target URL.
///
/// Only successful reports are cached.
pub struct CachedController {
    inner: AdaptiveController,
    cache: Mutex<Cache>,
    capacity: usize,
    ttl: Duration,
}

impl CachedController {
    pub fn new(runner: Arc<dyn WorkflowRunner>, config: &AdaptiveConfig) -> Self {
        Self {
            inner: AdaptiveController::new(runner, config),
            cache: Mutex::new(Cache::default()),
            capacity: config.cache_capacity.max(1),
            ttl: Duration::from_secs(config.cache_ttl_secs),
        }
    }

    pub async fn run(&self, params: RunParams) -> AdaptiveReport {
        let key = params.url.clone();
        if let Some(report) = self.lookup(&key).await {
            info!(url = %key, "Using cached result");
            return report;
        }

        let report = self.inner.run(params).await;
        if report.success && !key.is_empty() {
            let mut cache = self.cache.lock().await;
            cache.entries.shift_remove(&key);
            cache.entries.insert(
                key.clone(),
                CacheEntry {
                    report: report.clone(),
                    stored_at: Instant::now(),
                },
            );
            while cache.entries.len() > self.capacity {
                if let Some((evicted, _)) = cache.entries.shift_remove_index(0) {
                    debug!(url = %evicted, "Evicted cached result");
                }
            }
            debug!(url = %key, size = cache.entries.len(), "Cached result");
        }
        report
    }

    async fn lookup(&self, key: &str) -> Option<AdaptiveReport> {
        let mut cache = self.cache.lock().await;
        let fresh = cache
            .entries
            .get(key)
            .map(|entry| entry.stored_at.elapsed() <= self.ttl);
        let Some(fresh) = fresh else {
            cache.misses += 1;
            return None;
        };
        // Re-inserting moves the entry to the most recently used end.
        let entry = cache.entries.shift_remove(key)?;
        if !fresh {
            debug!(url = %key, "Cached result expired");
            cache.misses += 1;
            return None;
        }
        let mut report = entry.report.clone();
        report.from_cache = true;
        cache.entries.insert(key.to_string(), entry);
        cache.hits += 1;
        Some(report)
    }

    pub async fn clear(&self) {
        self.cache.lock().await.entries.clear();
        info!("Result cache cleared");
    }

    pub async fn stats(&self) -> CacheStats {
        let cache = self.cache.lock().await;
        CacheStats {
            size: cache.entries.len(),
            capacity: self.capacity,
            ttl_secs: self.ttl.as_secs(),
            hits: cache.hits,
            misses: cache.misses,
            cached_urls: cache.entries.keys().cloned().collect(),
        }
    }
}
