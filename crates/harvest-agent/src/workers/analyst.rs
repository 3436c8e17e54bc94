use std::collections::{BTreeMap, HashSet};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::info;

use harvest_core::error::Result;
use harvest_core::types::{Capability, Item, Task, TaskResult, WorkerConfig};

use crate::worker::Worker;

const SPAM_MARKERS: &[&str] = &["advertisement", "click here", "buy now", "免费", "点击", "广告"];

const CATEGORIES: &[(&str, &[&str])] = &[
    ("technology", &["ai", "tech", "软件", "技术"]),
    ("business", &["business", "经济", "财经"]),
    ("science", &["science", "科学", "研究"]),
];

/// Per-item scoring breakdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemAnalysis {
    pub url: String,
    pub keyword_score: f64,
    pub quality: f64,
    pub is_duplicate: bool,
    pub is_spam: bool,
    pub category: String,
    pub overall: f64,
    pub keep: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisSummary {
    pub total_items: usize,
    pub kept_items: usize,
    pub filtered_items: usize,
    pub avg_quality: f64,
    pub categories: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub analyses: Vec<ItemAnalysis>,
    pub kept_items: Vec<Item>,
    pub summary: AnalysisSummary,
}

/// Scores crawled items for relevance and quality and filters the batch.
pub struct Analyst {
    config: WorkerConfig,
}

impl Default for Analyst {
    fn default() -> Self {
        Self::new()
    }
}

impl Analyst {
    pub fn new() -> Self {
        Self {
            config: WorkerConfig::new("analyst", "analyst")
                .with_capability(Capability::Analyze)
                .with_timeout(60),
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
}

impl Worker for Analyst {
    fn config(&self) -> &WorkerConfig {
        &self.config
    }

    fn execute(&self, task: Task) -> BoxFuture<'_, Result<TaskResult>> {
        Box::pin(async move {
            let items: Vec<Item> = task.param_or("items", vec![])?;
            let keywords: Vec<String> = task.param_or("keywords", vec![])?;
            let min_quality: f64 = task.param_or("min_quality", 0.7)?;

            let report = analyze(items, &keywords, min_quality);
            info!(
                total = report.summary.total_items,
                kept = report.summary.kept_items,
                avg_quality = report.summary.avg_quality,
                "Analysis complete"
            );
            let quality = if report.summary.total_items == 0 {
                1.0
            } else {
                report.summary.avg_quality
            };
            TaskResult::from_report(&report, quality)
        })
    }
}

/// Score and filter a batch. Duplicates are detected within the batch by url.
pub fn analyze(items: Vec<Item>, keywords: &[String], min_quality: f64) -> AnalysisReport {
    let keywords: Vec<String> = keywords.iter().map(|k| k.to_lowercase()).collect();
    let mut seen = HashSet::new();
    let mut analyses = Vec::with_capacity(items.len());
    let mut kept_items = Vec::new();
    let mut categories: BTreeMap<String, usize> = BTreeMap::new();

    for item in items {
        let is_duplicate = !seen.insert(item.url.clone());
        let keyword_score = keyword_score(&item, &keywords);
        let quality = content_quality(&item);
        let is_spam = is_spam(&item.title);
        let category = categorize(&item).to_string();

        let mut overall = keyword_score * 0.3 + quality * 0.4;
        if !is_duplicate {
            overall += 0.2;
        }
        if !is_spam {
            overall += 0.1;
        }
        let keep = overall >= min_quality && !is_duplicate && !is_spam;

        if keep {
            *categories.entry(category.clone()).or_insert(0) += 1;
            kept_items.push(item.clone());
        }
        analyses.push(ItemAnalysis {
            url: item.url,
            keyword_score,
            quality,
            is_duplicate,
            is_spam,
            category,
            overall,
            keep,
        });
    }

    let total = analyses.len();
    let avg_quality = if total == 0 {
        0.0
    } else {
        analyses.iter().map(|a| a.overall).sum::<f64>() / total as f64
    };

    AnalysisReport {
        summary: AnalysisSummary {
            total_items: total,
            kept_items: kept_items.len(),
            filtered_items: total - kept_items.len(),
            avg_quality,
            categories,
        },
        analyses,
        kept_items,
    }
}

fn keyword_score(item: &Item, keywords: &[String]) -> f64 {
    if keywords.is_empty() {
        return 0.5;
    }
    let text = format!("{} {}", item.title, item.content).to_lowercase();
    let matches = keywords.iter().filter(|k| text.contains(k.as_str())).count();
    matches as f64 / keywords.len() as f64
}

fn content_quality(item: &Item) -> f64 {
    let mut score = 0.5;
    if item.title.chars().count() > 10 {
        score += 0.2;
    }
    if item.url.starts_with("http") {
        score += 0.1;
    }
    if item.content.chars().count() > 50 {
        score += 0.2;
    }
    score
}

fn is_spam(title: &str) -> bool {
    let title = title.to_lowercase();
    SPAM_MARKERS.iter().any(|m| title.contains(m))
}

fn categorize(item: &Item) -> &'static str {
    let text = format!("{} {}", item.title, item.content).to_lowercase();
    CATEGORIES
        .iter()
        .find(|(_, words)| words.iter().any(|w| text.contains(w)))
        .map_or("general", |(name, _)| *name)
}
