use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use harvest_core::error::{HarvestError, Result};
use harvest_core::types::{kinds, Capability, Params, Task, TaskResult, WorkerConfig};

use super::{WorkerPerformance, WorkerPool};
use crate::bus::MessageBus;
use crate::multi::{FinalResult, MultiWorkerWorkflow, RunParams, WorkflowReport};
use crate::worker::Worker;

/// Condensed view of the workflow run behind a supervisor result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub run_id: String,
    pub success: bool,
    pub engine: String,
    pub phases: Vec<String>,
    pub errors: Vec<String>,
    pub execution_ms: u64,
}

impl From<&WorkflowReport> for WorkflowSummary {
    fn from(report: &WorkflowReport) -> Self {
        Self {
            run_id: report.run_id.clone(),
            success: report.success,
            engine: report.engine.clone(),
            phases: report
                .state
                .log
                .phases()
                .into_iter()
                .map(String::from)
                .collect(),
            errors: report.errors.clone(),
            execution_ms: report.execution_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorReport {
    pub final_result: FinalResult,
    pub workflow: WorkflowSummary,
    pub agent_performance: Vec<WorkerPerformance>,
    pub subtasks: Vec<String>,
}

/// Coordinates a full multi-worker run for one `coordinate_workflow` task.
///
/// Hosting status is owned by whatever [`WorkerHost`](crate::worker::WorkerHost)
/// wraps the supervisor; [`Supervisor::shutdown`] only stops the pool and the bus.
pub struct Supervisor {
    config: WorkerConfig,
    workflow: Arc<MultiWorkerWorkflow>,
    bus: Arc<MessageBus>,
}

impl Supervisor {
    pub fn new(workflow: Arc<MultiWorkerWorkflow>, bus: Arc<MessageBus>) -> Self {
        Self {
            config: WorkerConfig::new("supervisor", "supervisor")
                .with_capability(Capability::Coordinate)
                .with_timeout(600),
            workflow,
            bus,
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.config.timeout_secs = secs;
        self
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        self.workflow.pool()
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    /// Up-front subtasks for a goal. Later phases are planned by the workflow.
    pub fn decompose(task: &Task) -> Vec<Task> {
        let mut params = Params::new();
        params.insert(
            "url".into(),
            task.params.get("url").cloned().unwrap_or_default(),
        );
        params.insert(
            "depth".into(),
            task.params.get("depth").cloned().unwrap_or(json!(2)),
        );
        vec![Task::new(kinds::EXPLORE, params)
            .with_id(format!("{}_explore", task.id))
            .with_priority(10)]
    }

    /// Give the supervisor and every pooled worker a mailbox.
    pub async fn register_all(&self) {
        self.bus.register(&self.config.id).await;
        self.pool().register_all(&self.bus).await;
    }

    pub async fn shutdown(&self) {
        info!("Shutting down supervisor and workers");
        self.pool().shutdown_all();
        self.bus.cleanup().await;
    }
}

impl Worker for Supervisor {
    fn config(&self) -> &WorkerConfig {
        &self.config
    }

    fn execute(&self, task: Task) -> BoxFuture<'_, Result<TaskResult>> {
        Box::pin(async move {
            let params = RunParams::from_task(&task)?;
            if params.url.trim().is_empty() {
                return Err(HarvestError::MissingParam("url".into()));
            }
            let subtasks = Self::decompose(&task);
            info!(url = %params.url, subtasks = subtasks.len(), "Coordinating workflow");

            let report = self.workflow.run(params).await?;
            let agent_performance = self.pool().performance().await;
            info!(
                run_id = %report.run_id,
                items = report.final_result.total_items,
                execution_ms = report.execution_ms,
                "Supervisor finished workflow"
            );

            let quality = report.final_result.quality_score;
            let out = SupervisorReport {
                workflow: WorkflowSummary::from(&report),
                final_result: report.final_result,
                agent_performance,
                subtasks: subtasks.into_iter().map(|t| t.id).collect(),
            };
            Ok(TaskResult::from_report(&out, quality)?
                .with_metadata("workflow", json!("supervisor_coordinated"))
                .with_metadata("workers_used", json!(self.pool().len())))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use harvest_core::config::{EngineKind, WorkersConfig};
    use harvest_core::event::EventBus;
    use harvest_core::types::WorkerStatus;
    use harvest_test_utils::{
        news_items, MemoryStorage, PassthroughParser, RecordingNotifier, StaticCrawlSource,
    };
    use tokio_util::sync::CancellationToken;

    use crate::pipeline::Collaborators;
    use crate::worker::{request, WorkerHost};

    fn supervisor() -> Arc<Supervisor> {
        let collab = Collaborators::new(
            Arc::new(StaticCrawlSource::new(news_items(12))),
            Arc::new(PassthroughParser),
            Arc::new(MemoryStorage::new()),
            Arc::new(RecordingNotifier::new()),
        );
        let pool = Arc::new(WorkerPool::standard(&collab, &WorkersConfig::default()));
        let workflow = MultiWorkerWorkflow::new(
            pool,
            &collab,
            EngineKind::Graph,
            Arc::new(EventBus::default()),
            5,
        )
        .unwrap();
        Arc::new(Supervisor::new(Arc::new(workflow), Arc::new(MessageBus::new())))
    }

    fn coordinate(url: &str) -> Task {
        let mut params = Params::new();
        params.insert("url".into(), json!(url));
        params.insert("keywords".into(), json!(["chips"]));
        Task::new(kinds::COORDINATE, params).with_id("goal")
    }

    #[test]
    fn decompose_plans_exploration_first() {
        let subtasks = Supervisor::decompose(&coordinate("https://news.test"));
        assert_eq!(subtasks.len(), 1);
        let explore = &subtasks[0];
        assert_eq!(explore.id, "goal_explore");
        assert_eq!(explore.kind, kinds::EXPLORE);
        assert_eq!(explore.priority, 10);
        assert_eq!(explore.params["depth"], 2);
        assert_eq!(explore.params["url"], "https://news.test");
    }

    #[tokio::test]
    async fn coordinates_a_full_run() {
        let sup = supervisor();
        let host = WorkerHost::new(sup.clone());
        let result = host.receive(coordinate("https://news.test")).await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.worker_id, "supervisor");
        assert_eq!(result.metadata["workers_used"], 4);

        let report: SupervisorReport = result.data_as().unwrap();
        assert!(report.workflow.success);
        assert_eq!(report.final_result.total_items, 12);
        assert_eq!(report.subtasks, vec!["goal_explore"]);
        assert_eq!(report.agent_performance.len(), 4);
        let explorer = &report.agent_performance[0];
        assert_eq!(explorer.id, "explorer");
        assert_eq!(explorer.tasks_completed, 1);
        assert_eq!(result.quality_score, report.final_result.quality_score);
    }

    #[tokio::test]
    async fn missing_url_fails() {
        let host = WorkerHost::new(supervisor());
        let result = host.receive(Task::new(kinds::COORDINATE, Params::new())).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("url"));
    }

    #[tokio::test]
    async fn delegation_over_the_bus() {
        let sup = supervisor();
        let bus = sup.bus().clone();
        bus.register("cli").await;
        let cancel = CancellationToken::new();
        let served = tokio::spawn(
            Arc::new(WorkerHost::new(sup.clone())).serve(bus.clone(), cancel.clone()),
        );
        while !bus.is_registered("supervisor").await {
            tokio::task::yield_now().await;
        }

        let task = coordinate("https://news.test");
        let result = request(&bus, "cli", "supervisor", &task, Duration::from_secs(10))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.task_id, "goal");

        cancel.cancel();
        served.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_stops_pool_and_bus() {
        let sup = supervisor();
        sup.register_all().await;
        assert_eq!(
            sup.bus().workers().await,
            vec!["supervisor", "explorer", "analyst", "optimizer", "validator"]
        );

        sup.shutdown().await;
        assert!(sup.bus().workers().await.is_empty());
        assert!(sup
            .pool()
            .performance()
            .await
            .iter()
            .all(|p| p.status == WorkerStatus::Offline));
    }
}
