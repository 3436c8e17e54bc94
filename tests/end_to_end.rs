use std::sync::Arc;

use harvest_agent::{
    CachedController, Collaborators, MultiWorkerWorkflow, Pipeline, RunParams, WorkerPool,
};
use harvest_core::config::{AdaptiveConfig, EngineKind, WorkersConfig};
use harvest_core::event::{EventBus, WorkflowEvent};
use harvest_test_utils::{
    news_items, MemoryStorage, PassthroughParser, RecordingNotifier, StaticCrawlSource,
};

fn collab(items: usize) -> (Collaborators, Arc<RecordingNotifier>) {
    let notifier = Arc::new(RecordingNotifier::new());
    let collab = Collaborators::new(
        Arc::new(StaticCrawlSource::new(news_items(items))),
        Arc::new(PassthroughParser),
        Arc::new(MemoryStorage::new()),
        notifier.clone(),
    );
    (collab, notifier)
}

#[tokio::test]
async fn test_second_pipeline_run_finds_nothing_new() {
    let (collab, notifier) = collab(4);
    let pipeline =
        Pipeline::new(&collab, EngineKind::Graph, Arc::new(EventBus::default()), 5).unwrap();

    let first = pipeline.run("https://news.test").await.unwrap();
    assert!(first.success);
    assert_eq!(first.items_new, 4);

    let second = pipeline.run("https://news.test").await.unwrap();
    assert!(second.success);
    assert_eq!(second.items_processed, 4);
    assert_eq!(second.items_new, 0);
    assert_eq!(notifier.batches().await.len(), 1);
}

#[tokio::test]
async fn test_multi_worker_run_publishes_lifecycle_events() {
    let (collab, _) = collab(12);
    let events = Arc::new(EventBus::default());
    let mut rx = events.subscribe();
    let pool = Arc::new(WorkerPool::standard(&collab, &WorkersConfig::default()));
    let workflow =
        MultiWorkerWorkflow::new(pool, &collab, EngineKind::Sequential, events.clone(), 5)
            .unwrap();

    let report = workflow.run(RunParams::new("https://news.test")).await.unwrap();
    assert!(report.success);

    let mut seen = vec![];
    while let Ok(event) = rx.try_recv() {
        seen.push(event);
    }
    assert!(matches!(seen.first(), Some(WorkflowEvent::RunStarted { .. })));
    assert!(matches!(seen.last(), Some(WorkflowEvent::RunFinished { success: true, .. })));
    assert!(seen.iter().all(|e| e.run_id() == report.run_id));
}

#[tokio::test]
async fn test_adaptive_run_is_cached_per_target() {
    let (collab, _) = collab(12);
    let pool = Arc::new(WorkerPool::standard(&collab, &WorkersConfig::default()));
    let workflow = Arc::new(
        MultiWorkerWorkflow::new(pool, &collab, EngineKind::Graph, Arc::new(EventBus::default()), 5)
            .unwrap(),
    );
    let controller = CachedController::new(workflow, &AdaptiveConfig::default());

    let mut params = RunParams::new("https://news.test");
    params.keywords = vec!["chips".into()];
    let first = controller.run(params.clone()).await;
    assert!(first.success);
    assert_eq!(first.iterations, 1);
    assert!(!first.from_cache);

    let second = controller.run(params).await;
    assert!(second.from_cache);
    assert_eq!(controller.stats().await.hits, 1);
}
