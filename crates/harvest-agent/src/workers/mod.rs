//! The specialist workers and the pool the multi-worker workflow dispatches to.

pub mod analyst;
pub mod explorer;
pub mod optimizer;
pub mod supervisor;
pub mod validator;

use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use harvest_core::config::WorkersConfig;
use harvest_core::error::HarvestError;
use harvest_core::types::{Task, TaskResult, WorkerStatus};

use crate::bus::MessageBus;
use crate::pipeline::Collaborators;
use crate::worker::WorkerHost;

pub use analyst::{AnalysisReport, AnalysisSummary, Analyst};
pub use explorer::{ExplorationReport, Explorer};
pub use optimizer::{OptimizationReport, Optimizer, PerformanceData};
pub use supervisor::{Supervisor, SupervisorReport};
pub use validator::{ValidationReport, ValidationSchema, Validator};

/// Performance snapshot of one pooled worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPerformance {
    pub id: String,
    pub success_rate: f64,
    pub avg_execution_ms: f64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub status: WorkerStatus,
}

/// Hosted workers keyed by id, in insertion order.
#[derive(Default)]
pub struct WorkerPool {
    hosts: IndexMap<String, Arc<WorkerHost>>,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Explorer, analyst, optimizer and validator wired to `collab`.
    pub fn standard(collab: &Collaborators, config: &WorkersConfig) -> Self {
        let capacity = config.history_capacity;
        let retries = config.max_retries;
        let mut pool = Self::new();
        pool.insert(
            WorkerHost::new(
                Explorer::new(collab.source.clone())
                    .with_timeout(config.explorer_timeout_secs)
                    .with_max_retries(retries),
            )
            .with_history_capacity(capacity),
        );
        pool.insert(
            WorkerHost::new(
                Analyst::new()
                    .with_timeout(config.analyst_timeout_secs)
                    .with_max_retries(retries),
            )
            .with_history_capacity(capacity),
        );
        pool.insert(
            WorkerHost::new(
                Optimizer::new(collab.retriever.clone())
                    .with_timeout(config.optimizer_timeout_secs)
                    .with_max_retries(retries),
            )
            .with_history_capacity(capacity),
        );
        pool.insert(
            WorkerHost::new(
                Validator::new()
                    .with_timeout(config.validator_timeout_secs)
                    .with_max_retries(retries),
            )
            .with_history_capacity(capacity),
        );
        pool
    }

    /// Add a worker. A worker with the same id is replaced.
    pub fn insert(&mut self, host: WorkerHost) {
        self.hosts.insert(host.id().to_string(), Arc::new(host));
    }

    pub fn get(&self, id: &str) -> Option<&Arc<WorkerHost>> {
        self.hosts.get(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.hosts.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// Route a task to the first worker whose capabilities cover its kind.
    pub async fn dispatch(&self, task: Task) -> TaskResult {
        match self.hosts.values().find(|h| h.config().can_handle(&task.kind)) {
            Some(host) => host.receive(task).await,
            None => {
                warn!(kind = %task.kind, "No worker can handle task");
                let mut result = TaskResult::failure(
                    HarvestError::UnsupportedTask {
                        worker: "pool".into(),
                        kind: task.kind.clone(),
                    }
                    .to_string(),
                );
                result.task_id = task.id;
                result
            }
        }
    }

    pub async fn performance(&self) -> Vec<WorkerPerformance> {
        let mut out = Vec::with_capacity(self.hosts.len());
        for (id, host) in &self.hosts {
            let m = host.metrics().await;
            out.push(WorkerPerformance {
                id: id.clone(),
                success_rate: m.success_rate,
                avg_execution_ms: m.avg_execution_ms,
                tasks_completed: m.tasks_completed,
                tasks_failed: m.tasks_failed,
                status: host.status(),
            });
        }
        out
    }

    /// Give every worker a mailbox on `bus`.
    pub async fn register_all(&self, bus: &MessageBus) {
        for id in self.hosts.keys() {
            bus.register(id).await;
        }
    }

    pub fn shutdown_all(&self) {
        for host in self.hosts.values() {
            host.shutdown();
        }
        info!(workers = self.hosts.len(), "Worker pool shut down");
    }
}
