use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use harvest_core::error::Result;
use harvest_core::traits::CrawlSource;
use harvest_core::types::{Capability, CrawlPattern, RawItem, Task, TaskResult, WorkerConfig};

use crate::worker::Worker;

const LINK_SAMPLE: usize = 20;

/// Shape of the listing the crawl returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructureAnalysis {
    pub item_count: usize,
    pub has_titles: bool,
    pub has_links: bool,
    pub has_content: bool,
    pub clarity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pagination {
    pub has_pagination: bool,
    pub max_pages: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AntiScraping {
    pub measures: Vec<String>,
    pub recommended_delay: f64,
}

impl AntiScraping {
    pub fn detected(&self) -> bool {
        !self.measures.is_empty()
    }
}

/// What the explorer learned about a site.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExplorationReport {
    pub url: String,
    pub depth: u32,
    pub structure: StructureAnalysis,
    pub requires_js: bool,
    pub links_sample: Vec<String>,
    pub pagination: Pagination,
    pub anti_scraping: AntiScraping,
    pub pattern_suggestion: CrawlPattern,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crawl_error: Option<String>,
}

/// Probes a target through the crawl source and proposes a crawl pattern.
pub struct Explorer {
    config: WorkerConfig,
    source: Arc<dyn CrawlSource>,
}

impl Explorer {
    pub fn new(source: Arc<dyn CrawlSource>) -> Self {
        Self {
            config: WorkerConfig::new("explorer", "explorer")
                .with_capability(Capability::Explore)
                .with_timeout(30),
            source,
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

impl Worker for Explorer {
    fn config(&self) -> &WorkerConfig {
        &self.config
    }

    fn execute(&self, task: Task) -> BoxFuture<'_, Result<TaskResult>> {
        Box::pin(async move {
            let url: String = task.require("url")?;
            let depth: u32 = task.param_or("depth", 1)?;
            info!(url = %url, depth, "Exploring target");

            let (items, crawl_error) = match self.source.crawl(&url).await {
                Ok(items) => (items, None),
                Err(e) => {
                    warn!(url = %url, error = %e, "Exploration crawl failed");
                    (vec![], Some(e.to_string()))
                }
            };

            let report = explore(&url, depth, &items, crawl_error);
            info!(
                url = %url,
                items = report.structure.item_count,
                confidence = report.confidence,
                "Exploration complete"
            );
            TaskResult::from_report(&report, report.confidence)
        })
    }
}

/// Derive the exploration report from a crawl outcome.
pub fn explore(
    url: &str,
    depth: u32,
    items: &[RawItem],
    crawl_error: Option<String>,
) -> ExplorationReport {
    let structure = analyze_structure(items);
    let requires_js = crawl_error.is_some() || items.is_empty();
    let links: Vec<String> = items
        .iter()
        .filter(|i| !i.url.is_empty())
        .map(|i| i.url.clone())
        .collect();
    let pagination = discover_pagination(items.len(), &links);
    let anti_scraping = detect_anti_scraping(crawl_error.as_deref());

    let pattern_suggestion = CrawlPattern {
        crawler: if requires_js { "dynamic" } else { "static" }.to_string(),
        target_url: url.to_string(),
        list_container: if structure.item_count > 0 {
            "detected_by_crawler"
        } else {
            "unknown"
        }
        .to_string(),
        item_selector: if structure.has_titles { "article" } else { "unknown" }.to_string(),
        title_selector: "h1, h2, h3".to_string(),
        link_selector: "a[href]".to_string(),
        delay: anti_scraping.recommended_delay.max(1.5),
        retry_count: 3,
        max_pages: pagination.max_pages,
        ..CrawlPattern::default()
    };

    let confidence = confidence(&structure, &pagination, &anti_scraping);

    ExplorationReport {
        url: url.to_string(),
        depth,
        structure,
        requires_js,
        links_sample: links.into_iter().take(LINK_SAMPLE).collect(),
        pagination,
        anti_scraping,
        pattern_suggestion,
        confidence,
        crawl_error,
    }
}

fn analyze_structure(items: &[RawItem]) -> StructureAnalysis {
    let has_titles = items.iter().any(|i| !i.title.is_empty());
    let has_links = items.iter().any(|i| !i.url.is_empty());
    let has_content = items.iter().any(|i| !i.content.is_empty());

    let mut clarity = 0.0;
    if !items.is_empty() {
        clarity = 0.5;
        if has_titles {
            clarity += 0.3;
        }
        if has_links {
            clarity += 0.2;
        }
    }

    StructureAnalysis {
        item_count: items.len(),
        has_titles,
        has_links,
        has_content,
        clarity,
    }
}

fn discover_pagination(count: usize, links: &[String]) -> Pagination {
    let next_link = links.iter().any(|l| l.to_lowercase().contains("next"));
    Pagination {
        has_pagination: count > 10 || next_link,
        max_pages: if count > 10 { 10 } else { 1 },
    }
}

fn detect_anti_scraping(error: Option<&str>) -> AntiScraping {
    let error = error.map(str::to_lowercase).unwrap_or_default();
    if error.contains("403") || error.contains("forbidden") {
        AntiScraping {
            measures: vec!["user_agent_check".into()],
            recommended_delay: 2.0,
        }
    } else if error.contains("timeout") || error.contains("timed out") {
        AntiScraping {
            measures: vec!["rate_limiting".into()],
            recommended_delay: 3.0,
        }
    } else {
        AntiScraping {
            measures: vec![],
            recommended_delay: 1.0,
        }
    }
}

fn confidence(structure: &StructureAnalysis, pagination: &Pagination, anti: &AntiScraping) -> f64 {
    let mut score: f64 = 0.5;
    if structure.clarity > 0.8 {
        score += 0.2;
    }
    if structure.has_content {
        score += 0.1;
    }
    if pagination.has_pagination {
        score += 0.1;
    }
    if !anti.detected() {
        score += 0.1;
    }
    score.min(1.0)
}
