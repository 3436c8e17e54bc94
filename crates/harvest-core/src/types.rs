use std::collections::BTreeSet;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{HarvestError, Result};

/// Type-erased parameter / data bag carried by tasks and results.
pub type Params = serde_json::Map<String, serde_json::Value>;

/// Well-known task kinds, one per worker capability.
pub mod kinds {
    pub const EXPLORE: &str = "explore_website";
    pub const ANALYZE: &str = "analyze_content";
    pub const OPTIMIZE: &str = "optimize_pattern";
    pub const VALIDATE: &str = "validate_data";
    pub const COORDINATE: &str = "coordinate_workflow";
}

/// What a worker is able to do. Routing is by capability tag, not by type.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Explore,
    Analyze,
    Optimize,
    Validate,
    Coordinate,
}

impl Capability {
    /// Capability required to execute a task of the given kind.
    pub fn for_kind(kind: &str) -> Option<Self> {
        match kind {
            kinds::EXPLORE => Some(Self::Explore),
            kinds::ANALYZE => Some(Self::Analyze),
            kinds::OPTIMIZE => Some(Self::Optimize),
            kinds::VALIDATE => Some(Self::Validate),
            kinds::COORDINATE => Some(Self::Coordinate),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Explore => "explore",
            Self::Analyze => "analyze",
            Self::Optimize => "optimize",
            Self::Validate => "validate",
            Self::Coordinate => "coordinate",
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work handed to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub kind: String,
    #[serde(default)]
    pub params: Params,
    #[serde(default = "default_priority")]
    pub priority: u8,
    /// Deadline in seconds. Falls back to the worker's configured timeout.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub metadata: Params,
}

fn default_priority() -> u8 {
    5
}

impl Task {
    pub fn new(kind: impl Into<String>, params: Params) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind: kind.into(),
            params,
            priority: default_priority(),
            timeout_secs: None,
            depends_on: vec![],
            metadata: Params::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn depends_on(mut self, ids: Vec<String>) -> Self {
        self.depends_on = ids;
        self
    }

    /// Read an optional typed parameter. A present but malformed value is an error.
    pub fn param<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        match self.params.get(name) {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value.clone()).map(Some).map_err(|e| {
                HarvestError::InvalidParam {
                    name: name.to_string(),
                    message: e.to_string(),
                }
            }),
        }
    }

    /// Read a typed parameter, falling back to `default` when absent.
    pub fn param_or<T: DeserializeOwned>(&self, name: &str, default: T) -> Result<T> {
        Ok(self.param(name)?.unwrap_or(default))
    }

    /// Read a mandatory typed parameter.
    pub fn require<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        self.param(name)?
            .ok_or_else(|| HarvestError::MissingParam(name.to_string()))
    }
}

/// Outcome of a task. Always produced, even when the work failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub worker_id: String,
    pub success: bool,
    #[serde(default)]
    pub data: Params,
    #[serde(default)]
    pub error: Option<String>,
    /// Wall-clock execution time in milliseconds.
    #[serde(default)]
    pub execution_ms: u64,
    #[serde(default = "default_quality")]
    pub quality_score: f64,
    #[serde(default)]
    pub metadata: Params,
}

fn default_quality() -> f64 {
    1.0
}

impl TaskResult {
    pub fn success(data: Params, quality_score: f64) -> Self {
        Self {
            task_id: String::new(),
            worker_id: String::new(),
            success: true,
            data,
            error: None,
            execution_ms: 0,
            quality_score: quality_score.clamp(0.0, 1.0),
            metadata: Params::new(),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            task_id: String::new(),
            worker_id: String::new(),
            success: false,
            data: Params::new(),
            error: Some(error.into()),
            execution_ms: 0,
            quality_score: 0.0,
            metadata: Params::new(),
        }
    }

    /// Build a successful result from any serializable report.
    pub fn from_report<T: Serialize>(report: &T, quality_score: f64) -> Result<Self> {
        match serde_json::to_value(report)? {
            serde_json::Value::Object(data) => Ok(Self::success(data, quality_score)),
            other => {
                let mut data = Params::new();
                data.insert("value".into(), other);
                Ok(Self::success(data, quality_score))
            }
        }
    }

    /// Deserialize the data bag into a typed report.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(serde_json::Value::Object(
            self.data.clone(),
        ))?)
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Static description of a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub id: String,
    pub role: String,
    pub capabilities: BTreeSet<Capability>,
    #[serde(default = "default_worker_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_worker_timeout() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

impl WorkerConfig {
    pub fn new(id: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: role.into(),
            capabilities: BTreeSet::new(),
            timeout_secs: default_worker_timeout(),
            max_retries: default_max_retries(),
        }
    }

    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capabilities.insert(capability);
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn can_handle(&self, kind: &str) -> bool {
        Capability::for_kind(kind).is_some_and(|c| self.capabilities.contains(&c))
    }
}

/// Worker lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Idle,
    Busy,
    Offline,
}

/// Per-worker performance counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerMetrics {
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub avg_execution_ms: f64,
    pub success_rate: f64,
}

impl Default for WorkerMetrics {
    fn default() -> Self {
        Self {
            tasks_completed: 0,
            tasks_failed: 0,
            avg_execution_ms: 0.0,
            success_rate: 1.0,
        }
    }
}

impl WorkerMetrics {
    pub fn total(&self) -> u64 {
        self.tasks_completed + self.tasks_failed
    }

    /// Fold one finished task into the counters.
    pub fn record(&mut self, success: bool, execution_ms: u64) {
        if success {
            self.tasks_completed += 1;
        } else {
            self.tasks_failed += 1;
        }
        let n = self.total() as f64;
        self.success_rate = self.tasks_completed as f64 / n;
        self.avg_execution_ms += (execution_ms as f64 - self.avg_execution_ms) / n;
    }
}

/// An item as delivered by a crawl source, before parsing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawItem {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub kind: String,
}

/// A structured item produced by the parser.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Item {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pub_date: Option<String>,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub kind: String,
    #[serde(flatten)]
    pub extra: Params,
}

impl From<RawItem> for Item {
    fn from(raw: RawItem) -> Self {
        Self {
            title: raw.title,
            url: raw.url,
            content: raw.content,
            pub_date: raw.timestamp,
            source: raw.source,
            kind: raw.kind,
            extra: Params::new(),
        }
    }
}

/// A crawl strategy for one site: which crawler, which selectors, how politely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlPattern {
    #[serde(default = "default_crawler")]
    pub crawler: String,
    #[serde(default)]
    pub target_url: String,
    #[serde(default)]
    pub list_container: String,
    #[serde(default)]
    pub item_selector: String,
    #[serde(default)]
    pub title_selector: String,
    #[serde(default)]
    pub link_selector: String,
    #[serde(default = "default_delay")]
    pub delay: f64,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<u32>,
    #[serde(flatten)]
    pub extra: Params,
}

fn default_crawler() -> String {
    "static".to_string()
}
fn default_delay() -> f64 {
    1.5
}
fn default_retry_count() -> u32 {
    3
}
fn default_max_pages() -> u32 {
    10
}

impl Default for CrawlPattern {
    fn default() -> Self {
        Self {
            crawler: default_crawler(),
            target_url: String::new(),
            list_container: String::new(),
            item_selector: String::new(),
            title_selector: String::new(),
            link_selector: String::new(),
            delay: default_delay(),
            retry_count: default_retry_count(),
            max_pages: default_max_pages(),
            timeout_secs: None,
            concurrency: None,
            extra: Params::new(),
        }
    }
}

impl CrawlPattern {
    /// Fill fields this pattern leaves unset from `other`. Set fields win.
    pub fn fill_missing_from(&mut self, other: &CrawlPattern) {
        if self.timeout_secs.is_none() {
            self.timeout_secs = other.timeout_secs;
        }
        if self.concurrency.is_none() {
            self.concurrency = other.concurrency;
        }
        for (key, value) in &other.extra {
            self.extra
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
    }
}

/// A ranked pattern returned by the pattern retriever.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternSuggestion {
    pub pattern: CrawlPattern,
    pub similarity: f64,
    pub success_rate: f64,
}
