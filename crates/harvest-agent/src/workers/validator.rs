use std::collections::BTreeMap;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use harvest_core::error::Result;
use harvest_core::types::{Capability, Item, Params, Task, TaskResult, WorkerConfig};

use crate::worker::Worker;

/// Minimum combined score for an item to pass.
pub const VALID_THRESHOLD: f64 = 0.8;

const PLACEHOLDER_TITLES: &[&str] = &["null", "undefined", "n/a"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Url,
    Datetime,
    Int,
    #[serde(other)]
    Any,
}

impl FieldType {
    fn accepts(self, value: &Value) -> bool {
        match self {
            Self::String | Self::Datetime => value.is_string(),
            Self::Url => value.as_str().is_some_and(is_http_url),
            Self::Int => value.is_i64() || value.is_u64(),
            Self::Any => true,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Url => "url",
            Self::Datetime => "datetime",
            Self::Int => "int",
            Self::Any => "any",
        }
    }
}

/// Field requirements items are checked against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationSchema {
    #[serde(default = "default_schema_name")]
    pub name: String,
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub recommended: Vec<String>,
    #[serde(default)]
    pub types: BTreeMap<String, FieldType>,
}

fn default_schema_name() -> String {
    "default".to_string()
}

impl Default for ValidationSchema {
    fn default() -> Self {
        Self {
            name: "default_news_schema".into(),
            required: vec!["title".into(), "url".into()],
            recommended: vec!["content".into(), "pub_date".into()],
            types: BTreeMap::from([
                ("title".to_string(), FieldType::String),
                ("url".to_string(), FieldType::Url),
                ("content".to_string(), FieldType::String),
                ("pub_date".to_string(), FieldType::Datetime),
            ]),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub format: f64,
    pub consistency: f64,
    pub completeness: f64,
    pub accuracy: f64,
}

impl ScoreBreakdown {
    pub fn combined(&self) -> f64 {
        self.format * 0.2 + self.consistency * 0.3 + self.completeness * 0.3 + self.accuracy * 0.2
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemValidation {
    pub item: Item,
    pub valid: bool,
    pub score: f64,
    /// Only populated for invalid items.
    pub issues: Vec<String>,
    pub breakdown: ScoreBreakdown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationSummary {
    pub total_items: usize,
    pub valid_count: usize,
    pub invalid_count: usize,
    pub validation_rate: f64,
    pub avg_score: f64,
    pub common_issues: BTreeMap<String, usize>,
    pub schema_used: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub results: Vec<ItemValidation>,
    pub valid_items: Vec<Item>,
    pub issues: Vec<String>,
    pub summary: ValidationSummary,
}

/// Checks items against a schema plus fixed consistency and accuracy rules.
pub struct Validator {
    config: WorkerConfig,
}

impl Default for Validator {
    fn default() -> Self {
        Self::new()
    }
}

impl Validator {
    pub fn new() -> Self {
        Self {
            config: WorkerConfig::new("validator", "validator")
                .with_capability(Capability::Validate)
                .with_timeout(30),
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

impl Worker for Validator {
    fn config(&self) -> &WorkerConfig {
        &self.config
    }

    fn execute(&self, task: Task) -> BoxFuture<'_, Result<TaskResult>> {
        Box::pin(async move {
            let items: Vec<Item> = task.param_or("items", vec![])?;
            let schema: ValidationSchema = task.param_or("schema", ValidationSchema::default())?;

            let report = validate(items, &schema)?;
            info!(
                valid = report.summary.valid_count,
                total = report.summary.total_items,
                "Validation complete"
            );
            TaskResult::from_report(&report, report.summary.validation_rate)
        })
    }
}

pub fn validate(items: Vec<Item>, schema: &ValidationSchema) -> Result<ValidationReport> {
    let mut results = Vec::with_capacity(items.len());
    for item in items {
        results.push(validate_item(item, schema)?);
    }

    let total = results.len();
    let valid_count = results.iter().filter(|r| r.valid).count();
    let mut common_issues: BTreeMap<String, usize> = BTreeMap::new();
    let mut issues = vec![];
    for issue in results.iter().flat_map(|r| r.issues.iter()) {
        let kind = issue.split(':').next().unwrap_or(issue);
        *common_issues.entry(kind.to_string()).or_insert(0) += 1;
        issues.push(issue.clone());
    }

    let (validation_rate, avg_score) = if total == 0 {
        (1.0, 1.0)
    } else {
        (
            valid_count as f64 / total as f64,
            results.iter().map(|r| r.score).sum::<f64>() / total as f64,
        )
    };

    Ok(ValidationReport {
        valid_items: results
            .iter()
            .filter(|r| r.valid)
            .map(|r| r.item.clone())
            .collect(),
        issues,
        summary: ValidationSummary {
            total_items: total,
            valid_count,
            invalid_count: total - valid_count,
            validation_rate,
            avg_score,
            common_issues,
            schema_used: schema.name.clone(),
        },
        results,
    })
}

fn validate_item(item: Item, schema: &ValidationSchema) -> Result<ItemValidation> {
    let fields = match serde_json::to_value(&item)? {
        Value::Object(map) => map,
        _ => Params::new(),
    };
    let mut issues = vec![];

    let format = check_format(&fields, schema, &mut issues);
    let consistency = check_consistency(&item, &mut issues);
    let completeness = check_completeness(&fields, schema, &mut issues);
    let accuracy = check_accuracy(&item, &mut issues);

    let breakdown = ScoreBreakdown {
        format,
        consistency,
        completeness,
        accuracy,
    };
    let score = breakdown.combined();
    let valid = score >= VALID_THRESHOLD;
    if valid {
        issues.clear();
    }

    Ok(ItemValidation {
        item,
        valid,
        score,
        issues,
        breakdown,
    })
}

fn is_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// Absent, null, or an empty/zero value.
fn is_blank(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(Value::Bool(b)) => !b,
        Some(Value::Number(n)) => n.as_f64() == Some(0.0),
        Some(Value::Array(a)) => a.is_empty(),
        Some(Value::Object(o)) => o.is_empty(),
    }
}

fn check_format(fields: &Params, schema: &ValidationSchema, issues: &mut Vec<String>) -> f64 {
    let mut score: f64 = 1.0;
    for field in &schema.required {
        if is_blank(fields.get(field)) {
            issues.push(format!("Missing required field: {field}"));
            score -= 0.3;
        }
    }
    for (field, expected) in &schema.types {
        let value = fields.get(field);
        if let Some(v) = value {
            if !is_blank(value) && !expected.accepts(v) {
                issues.push(format!(
                    "Invalid type for {field}: expected {}",
                    expected.as_str()
                ));
                score -= 0.1;
            }
        }
    }
    score.max(0.0)
}

fn check_consistency(item: &Item, issues: &mut Vec<String>) -> f64 {
    let mut score: f64 = 1.0;
    if !item.url.is_empty() && !is_http_url(&item.url) {
        issues.push(format!("Invalid URL format: {}", item.url));
        score -= 0.3;
    }
    let title_len = item.title.chars().count();
    if title_len > 0 && title_len < 5 && item.content.chars().count() > 100 {
        issues.push("Title too short compared to content".into());
        score -= 0.1;
    }
    score.max(0.0)
}

fn check_completeness(fields: &Params, schema: &ValidationSchema, issues: &mut Vec<String>) -> f64 {
    let mut score: f64 = 1.0;
    for field in &schema.required {
        if is_blank(fields.get(field)) {
            issues.push(format!("Incomplete: {field}"));
            score -= 0.2;
        }
    }
    for field in &schema.recommended {
        if is_blank(fields.get(field)) {
            score -= 0.05;
        }
    }
    score.max(0.0)
}

fn check_accuracy(item: &Item, issues: &mut Vec<String>) -> f64 {
    let mut score: f64 = 1.0;
    if item.url.contains("example.com") {
        issues.push(format!("URL contains placeholder: {}", item.url));
        score -= 0.2;
    }
    let title = item.title.to_lowercase();
    if title.is_empty() || PLACEHOLDER_TITLES.contains(&title.as_str()) {
        issues.push("Title is empty or placeholder".into());
        score -= 0.3;
    }
    let content_len = item.content.chars().count();
    if content_len > 0 && content_len < 20 {
        issues.push("Content too short".into());
        score -= 0.1;
    }
    score.max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::WorkerHost;
    use harvest_core::types::kinds;
    use harvest_test_utils::parsed_news_items;
    use serde_json::json;

    fn item(title: &str, url: &str, content: &str) -> Item {
        Item {
            title: title.into(),
            url: url.into(),
            content: content.into(),
            ..Item::default()
        }
    }

    #[test]
    fn well_formed_items_pass() {
        let report = validate(parsed_news_items(3), &ValidationSchema::default()).unwrap();
        assert_eq!(report.summary.valid_count, 3);
        assert_eq!(report.summary.validation_rate, 1.0);
        assert!((report.summary.avg_score - 1.0).abs() < 1e-9);
        assert!(report.issues.is_empty());
        assert_eq!(report.summary.schema_used, "default_news_schema");
    }

    #[test]
    fn broken_item_fails_with_issues() {
        let bad = item("", "ftp://files", "short");
        let report = validate(vec![bad], &ValidationSchema::default()).unwrap();
        let r = &report.results[0];
        assert!(!r.valid);
        assert!((r.breakdown.format - 0.6).abs() < 1e-9);
        assert!((r.breakdown.consistency - 0.7).abs() < 1e-9);
        assert!((r.breakdown.completeness - 0.75).abs() < 1e-9);
        assert!((r.breakdown.accuracy - 0.6).abs() < 1e-9);
        assert!((r.score - 0.675).abs() < 1e-9);
        assert!(r.issues.contains(&"Missing required field: title".to_string()));
        assert_eq!(report.summary.common_issues.get("Missing required field"), Some(&1));
        assert_eq!(report.summary.common_issues.get("Invalid URL format"), Some(&1));
        assert!(report.valid_items.is_empty());
        assert_eq!(report.summary.validation_rate, 0.0);
    }

    #[test]
    fn placeholder_url_lowers_accuracy_but_passes() {
        let mut it = parsed_news_items(1).remove(0);
        it.url = "https://example.com/story".into();
        let report = validate(vec![it], &ValidationSchema::default()).unwrap();
        let r = &report.results[0];
        assert!((r.breakdown.accuracy - 0.8).abs() < 1e-9);
        assert!(r.valid);
        assert!(r.issues.is_empty());
    }

    #[test]
    fn short_title_with_long_content_is_inconsistent() {
        let long = "x".repeat(120);
        let mut issues = vec![];
        let score = check_consistency(&item("Hey", "https://news.test/a", &long), &mut issues);
        assert!((score - 0.9).abs() < 1e-9);
        assert_eq!(issues, vec!["Title too short compared to content"]);
    }

    #[test]
    fn placeholder_title_detected() {
        let mut issues = vec![];
        let score = check_accuracy(&item("N/A", "https://news.test/a", ""), &mut issues);
        assert!((score - 0.7).abs() < 1e-9);
    }

    #[test]
    fn schema_from_json_accepts_unknown_types() {
        let schema: ValidationSchema = serde_json::from_value(json!({
            "required": ["title"],
            "types": {"title": "string", "views": "float"}
        }))
        .unwrap();
        assert_eq!(schema.name, "default");
        assert_eq!(schema.types["views"], FieldType::Any);
    }

    #[test]
    fn empty_batch_is_fully_valid() {
        let report = validate(vec![], &ValidationSchema::default()).unwrap();
        assert_eq!(report.summary.validation_rate, 1.0);
        assert_eq!(report.summary.total_items, 0);
    }

    #[tokio::test]
    async fn worker_reports_rate_as_quality() {
        let host = WorkerHost::new(Validator::new());
        let mut items = parsed_news_items(1);
        items.push(item("", "", ""));
        let mut params = Params::new();
        params.insert("items".into(), serde_json::to_value(items).unwrap());
        let result = host.receive(Task::new(kinds::VALIDATE, params)).await;
        assert!(result.success);
        assert_eq!(result.quality_score, 0.5);
        let report: ValidationReport = result.data_as().unwrap();
        assert_eq!(report.valid_items.len(), 1);
    }
}
