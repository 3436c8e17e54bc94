use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarvestError {
    // Worker errors
    #[error("Task kind '{kind}' not supported by worker {worker}")]
    UnsupportedTask { worker: String, kind: String },

    #[error("Task {task_id} timed out after {timeout_secs}s")]
    TaskTimeout { task_id: String, timeout_secs: u64 },

    #[error("Worker {0} is offline")]
    WorkerOffline(String),

    #[error("Missing task parameter: {0}")]
    MissingParam(String),

    #[error("Invalid task parameter {name}: {message}")]
    InvalidParam { name: String, message: String },

    // Collaborator errors
    #[error("Crawl failed: {0}")]
    Crawl(String),

    #[error("Parse failed: {0}")]
    Parse(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Notification failed: {0}")]
    Notify(String),

    #[error("Pattern retrieval failed: {0}")]
    Retrieval(String),

    // Workflow errors
    #[error("Invalid workflow graph: {0}")]
    InvalidGraph(String),

    #[error("Phase '{0}' not found in graph")]
    PhaseNotFound(String),

    #[error("Guard after '{phase}' returned unmapped route '{route}'")]
    UnmappedRoute { phase: String, route: String },

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, HarvestError>;

/// A failure inside one workflow phase.
///
/// Phases return this instead of aborting the run; the engine records it in
/// the run-state's `errors` list and carries on along the graph.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{phase} error: {message}")]
pub struct PhaseError {
    pub phase: String,
    pub message: String,
}

impl PhaseError {
    pub fn new(phase: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            phase: phase.into(),
            message: message.into(),
        }
    }

    /// Wrap a core error raised while running `phase`.
    pub fn from_error(phase: impl Into<String>, err: &HarvestError) -> Self {
        Self::new(phase, err.to_string())
    }
}
