use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use harvest_core::error::Result;
use harvest_core::traits::PatternRetriever;
use harvest_core::types::{Capability, CrawlPattern, Task, TaskResult, WorkerConfig};

use crate::worker::Worker;

const SIMILAR_PATTERNS: usize = 5;
const CONTROL_SCORE: f64 = 0.75;
const TREATMENT_SCORE: f64 = 0.82;
const SIGNIFICANCE: f64 = 0.05;
const ASSUMED_IMPROVEMENT: f64 = 0.05;

/// Observed crawl performance for the pattern under optimization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceData {
    #[serde(default = "default_success_rate")]
    pub success_rate: f64,
    #[serde(default = "default_avg_time")]
    pub avg_time: f64,
    #[serde(default = "default_error_rate")]
    pub error_rate: f64,
}

fn default_success_rate() -> f64 {
    0.5
}
fn default_avg_time() -> f64 {
    2.0
}
fn default_error_rate() -> f64 {
    0.1
}

impl Default for PerformanceData {
    fn default() -> Self {
        Self {
            success_rate: default_success_rate(),
            avg_time: default_avg_time(),
            error_rate: default_error_rate(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BottleneckKind {
    LowSuccessRate,
    SlowPerformance,
    HighErrorRate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bottleneck {
    pub kind: BottleneckKind,
    pub severity: Severity,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceAnalysis {
    pub performance: PerformanceData,
    pub bottlenecks: Vec<Bottleneck>,
    pub overall_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbTestResult {
    pub control_score: f64,
    pub treatment_score: f64,
    pub improvement: f64,
    pub significant: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationReport {
    pub url: String,
    pub optimized_pattern: CrawlPattern,
    pub improvement: f64,
    /// `optimized_pattern` clamped to safe operating ranges.
    pub tuned_pattern: CrawlPattern,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ab_test: Option<AbTestResult>,
    pub analysis: PerformanceAnalysis,
    pub similar_patterns: usize,
}

/// Improves a crawl pattern from performance data and retrieved patterns.
pub struct Optimizer {
    config: WorkerConfig,
    retriever: Option<Arc<dyn PatternRetriever>>,
}

impl Optimizer {
    pub fn new(retriever: Option<Arc<dyn PatternRetriever>>) -> Self {
        Self {
            config: WorkerConfig::new("optimizer", "optimizer")
                .with_capability(Capability::Optimize)
                .with_timeout(45),
            retriever,
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.config.timeout_secs = secs;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.config.max_retries = retries;
        self
    }

    async fn similar_patterns(&self, url: &str) -> Vec<CrawlPattern> {
        let Some(retriever) = &self.retriever else {
            return vec![];
        };
        match retriever.suggest_patterns(url, SIMILAR_PATTERNS).await {
            Ok(suggestions) => suggestions.into_iter().map(|s| s.pattern).collect(),
            Err(e) => {
                warn!(url = %url, error = %e, "Pattern retrieval failed");
                vec![]
            }
        }
    }
}

impl Worker for Optimizer {
    fn config(&self) -> &WorkerConfig {
        &self.config
    }

    fn execute(&self, task: Task) -> BoxFuture<'_, Result<TaskResult>> {
        Box::pin(async move {
            let url: String = task.param_or("url", String::new())?;
            let current: CrawlPattern = task.param_or("current_pattern", CrawlPattern::default())?;
            let performance: PerformanceData =
                task.param_or("performance_data", PerformanceData::default())?;
            let enable_ab_test: bool = task.param_or("enable_ab_test", false)?;
            let enable_rag: bool = task.param_or("enable_rag", true)?;

            let similar = if enable_rag {
                self.similar_patterns(&url).await
            } else {
                vec![]
            };
            let report = optimize(&url, current, performance, &similar, enable_ab_test);
            info!(
                url = %url,
                bottlenecks = report.analysis.bottlenecks.len(),
                improvement = report.improvement,
                "Optimization complete"
            );
            let quality = if report.improvement > 0.0 { 0.9 } else { 0.7 };
            TaskResult::from_report(&report, quality)
        })
    }
}

pub fn analyze_performance(performance: PerformanceData) -> PerformanceAnalysis {
    let mut bottlenecks = vec![];
    if performance.success_rate < 0.7 {
        bottlenecks.push(Bottleneck {
            kind: BottleneckKind::LowSuccessRate,
            severity: Severity::High,
            value: performance.success_rate,
        });
    }
    if performance.avg_time > 3.0 {
        bottlenecks.push(Bottleneck {
            kind: BottleneckKind::SlowPerformance,
            severity: Severity::Medium,
            value: performance.avg_time,
        });
    }
    if performance.error_rate > 0.15 {
        bottlenecks.push(Bottleneck {
            kind: BottleneckKind::HighErrorRate,
            severity: Severity::High,
            value: performance.error_rate,
        });
    }
    PerformanceAnalysis {
        overall_score: (performance.success_rate - performance.error_rate) / 2.0,
        performance,
        bottlenecks,
    }
}

/// Produce the optimization report. `similar` is ranked best first.
pub fn optimize(
    url: &str,
    current: CrawlPattern,
    performance: PerformanceData,
    similar: &[CrawlPattern],
    enable_ab_test: bool,
) -> OptimizationReport {
    let analysis = analyze_performance(performance);

    let mut proposed = current.clone();
    for bottleneck in &analysis.bottlenecks {
        match bottleneck.kind {
            BottleneckKind::LowSuccessRate => {
                proposed.retry_count += 2;
                proposed.delay *= 1.5;
            }
            BottleneckKind::SlowPerformance => {
                if analysis.performance.success_rate > 0.8 {
                    proposed.delay = (proposed.delay * 0.7).max(0.5);
                }
            }
            BottleneckKind::HighErrorRate => {
                proposed.timeout_secs = Some(proposed.timeout_secs.unwrap_or(30.0) * 1.5);
                proposed.delay *= 2.0;
            }
        }
    }
    if let Some(best) = similar.first() {
        proposed.fill_missing_from(best);
    }

    let ab_test = enable_ab_test.then(|| {
        let improvement = (TREATMENT_SCORE - CONTROL_SCORE) / CONTROL_SCORE;
        AbTestResult {
            control_score: CONTROL_SCORE,
            treatment_score: TREATMENT_SCORE,
            improvement,
            significant: improvement > SIGNIFICANCE,
        }
    });

    let (optimized_pattern, improvement) = match &ab_test {
        Some(ab) if ab.significant && ab.treatment_score > ab.control_score => {
            (proposed, ab.improvement)
        }
        Some(ab) if ab.significant => (current, 0.0),
        _ => (proposed, ASSUMED_IMPROVEMENT),
    };

    OptimizationReport {
        url: url.to_string(),
        tuned_pattern: tune(&optimized_pattern),
        optimized_pattern,
        improvement,
        ab_test,
        analysis,
        similar_patterns: similar.len(),
    }
}

/// Clamp pattern parameters to their operating ranges.
pub fn tune(pattern: &CrawlPattern) -> CrawlPattern {
    let mut tuned = pattern.clone();
    tuned.delay = tuned.delay.clamp(0.5, 5.0);
    tuned.timeout_secs = Some(tuned.timeout_secs.unwrap_or(30.0).clamp(10.0, 60.0));
    tuned.retry_count = tuned.retry_count.clamp(1, 5);
    tuned.concurrency = Some(tuned.concurrency.unwrap_or(3).clamp(1, 5));
    tuned
}
