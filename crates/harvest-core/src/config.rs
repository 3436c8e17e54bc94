use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{HarvestError, Result};

/// Top-level harvest configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub target: TargetConfig,
    #[serde(default)]
    pub workflow: WorkflowConfig,
    #[serde(default)]
    pub adaptive: AdaptiveConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
    /// JSONL run journal. Disabled when the section is absent.
    #[serde(default)]
    pub journal: Option<JournalConfig>,
}

/// What to crawl and how the multi-worker run should treat it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
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
    /// Minimum overall score for the analyst to keep an item.
    #[serde(default = "default_min_quality")]
    pub min_quality: f64,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            keywords: vec![],
            depth: default_depth(),
            enable_optimization: true,
            enable_rag: true,
            min_quality: default_min_quality(),
        }
    }
}

fn default_depth() -> u32 { 2 }
fn default_true() -> bool { true }
fn default_min_quality() -> f64 { 0.7 }

/// Which execution strategy walks the workflow graph.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// Walk the node/edge table one transition at a time.
    #[default]
    Graph,
    /// Compile the table into an ordered step list and iterate it.
    Sequential,
}

impl EngineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Graph => "graph",
            Self::Sequential => "sequential",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    #[serde(default)]
    pub engine: EngineKind,
    /// Visits allowed per node before the graph strategy stops a cycle.
    #[serde(default = "default_max_node_visits")]
    pub max_node_visits: usize,
    /// Event bus buffer size.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            engine: EngineKind::default(),
            max_node_visits: default_max_node_visits(),
            event_capacity: default_event_capacity(),
        }
    }
}

fn default_max_node_visits() -> usize { 5 }
fn default_event_capacity() -> usize { 256 }

/// Adaptive re-planning loop and its result cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveConfig {
    /// Wrap multi-worker runs in the adaptive loop (default: false).
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Final quality at or above which a run is accepted.
    #[serde(default = "default_quality_threshold")]
    pub quality_threshold: f64,
    /// Phases scoring below this are adapted for the next iteration.
    #[serde(default = "default_phase_quality_floor")]
    pub phase_quality_floor: f64,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_iterations: default_max_iterations(),
            quality_threshold: default_quality_threshold(),
            phase_quality_floor: default_phase_quality_floor(),
            cache_capacity: default_cache_capacity(),
            cache_ttl_secs: default_cache_ttl(),
        }
    }
}

fn default_max_iterations() -> u32 { 3 }
fn default_quality_threshold() -> f64 { 0.8 }
fn default_phase_quality_floor() -> f64 { 0.7 }
fn default_cache_capacity() -> usize { 64 }
fn default_cache_ttl() -> u64 { 3600 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default = "default_receive_timeout_ms")]
    pub receive_timeout_ms: u64,
    /// Number of delivered messages kept for inspection.
    #[serde(default = "default_message_log_capacity")]
    pub message_log_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            receive_timeout_ms: default_receive_timeout_ms(),
            message_log_capacity: default_message_log_capacity(),
        }
    }
}

fn default_receive_timeout_ms() -> u64 { 1000 }
fn default_message_log_capacity() -> usize { 1000 }

/// Per-worker deadlines and bookkeeping limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkersConfig {
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    #[serde(default = "default_explorer_timeout")]
    pub explorer_timeout_secs: u64,
    #[serde(default = "default_analyst_timeout")]
    pub analyst_timeout_secs: u64,
    #[serde(default = "default_optimizer_timeout")]
    pub optimizer_timeout_secs: u64,
    #[serde(default = "default_validator_timeout")]
    pub validator_timeout_secs: u64,
    #[serde(default = "default_supervisor_timeout")]
    pub supervisor_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            history_capacity: default_history_capacity(),
            explorer_timeout_secs: default_explorer_timeout(),
            analyst_timeout_secs: default_analyst_timeout(),
            optimizer_timeout_secs: default_optimizer_timeout(),
            validator_timeout_secs: default_validator_timeout(),
            supervisor_timeout_secs: default_supervisor_timeout(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_history_capacity() -> usize { 100 }
fn default_explorer_timeout() -> u64 { 30 }
fn default_analyst_timeout() -> u64 { 60 }
fn default_optimizer_timeout() -> u64 { 45 }
fn default_validator_timeout() -> u64 { 30 }
fn default_supervisor_timeout() -> u64 { 600 }
fn default_max_retries() -> u32 { 3 }

/// JSONL run journal configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalConfig {
    /// Enable the journal (default: true when section is present).
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Directory for journal files. Default: ./runs
    #[serde(default)]
    pub dir: Option<String>,
}

impl JournalConfig {
    pub fn resolved_dir(&self) -> PathBuf {
        match &self.dir {
            Some(dir) => expand_home(dir),
            None => PathBuf::from("runs"),
        }
    }
}

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| HarvestError::ConfigNotFound(path.display().to_string()))?;

        Self::parse(&content)
    }

    /// Parse config text, expanding `${ENV_VAR}` references first.
    pub fn parse(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let config: Self =
            toml::from_str(&expanded).map_err(|e| HarvestError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.adaptive.max_iterations == 0 {
            return Err(HarvestError::Config(
                "adaptive.max_iterations must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.adaptive.quality_threshold) {
            return Err(HarvestError::Config(
                "adaptive.quality_threshold must be within [0, 1]".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.target.min_quality) {
            return Err(HarvestError::Config(
                "target.min_quality must be within [0, 1]".into(),
            ));
        }
        if self.workflow.max_node_visits == 0 {
            return Err(HarvestError::Config(
                "workflow.max_node_visits must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Keep original if env var not set
                Err(_) => {
                    warn!(var = %var_name, "Config references unset environment variable");
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}
