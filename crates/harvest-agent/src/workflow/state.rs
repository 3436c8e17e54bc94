use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One line of the execution log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub phase: String,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub quality_score: f64,
}

/// Bookkeeping every run state carries: the execution log, accumulated
/// phase errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunLog {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub current_phase: String,
    pub execution_log: Vec<LogEntry>,
    pub errors: Vec<String>,
}

impl Default for RunLog {
    fn default() -> Self {
        Self::new(Uuid::new_v4().to_string())
    }
}

impl RunLog {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            started_at: Utc::now(),
            current_phase: "init".to_string(),
            execution_log: vec![],
            errors: vec![],
        }
    }

    pub fn record(&mut self, phase: &str, success: bool, quality_score: f64) {
        self.execution_log.push(LogEntry {
            phase: phase.to_string(),
            timestamp: Utc::now(),
            success,
            quality_score,
        });
    }

    /// Names of the phases that ran, in order.
    pub fn phases(&self) -> Vec<&str> {
        self.execution_log.iter().map(|e| e.phase.as_str()).collect()
    }

    pub fn succeeded(&self) -> bool {
        self.errors.is_empty()
    }
}

/// A run state the engine can drive.
pub trait WorkflowState: Send + 'static {
    fn run_log(&self) -> &RunLog;
    fn run_log_mut(&mut self) -> &mut RunLog;
}
