use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use harvest_core::error::{HarvestError, Result};
use harvest_core::message::{Message, MessageType};
use harvest_core::types::{Capability, Task, TaskResult, WorkerConfig, WorkerMetrics, WorkerStatus};

use crate::bus::MessageBus;

/// A capability-tagged executor of tasks.
///
/// Implementors only supply `execute`. Status, metrics, deadlines and
/// history are handled by [`WorkerHost`].
pub trait Worker: Send + Sync + 'static {
    fn config(&self) -> &WorkerConfig;

    /// Perform the work. An `Err` is turned into a failed `TaskResult`.
    fn execute(&self, task: Task) -> BoxFuture<'_, Result<TaskResult>>;
}

impl<W: Worker> Worker for Arc<W> {
    fn config(&self) -> &WorkerConfig {
        (**self).config()
    }

    fn execute(&self, task: Task) -> BoxFuture<'_, Result<TaskResult>> {
        (**self).execute(task)
    }
}

const STATUS_IDLE: u8 = 0;
const STATUS_BUSY: u8 = 1;
const STATUS_OFFLINE: u8 = 2;

fn decode_status(raw: u8) -> WorkerStatus {
    match raw {
        STATUS_BUSY => WorkerStatus::Busy,
        STATUS_OFFLINE => WorkerStatus::Offline,
        _ => WorkerStatus::Idle,
    }
}

/// Returns the status to idle when dropped, unless the worker went offline meanwhile.
struct BusyGuard<'a>(&'a AtomicU8);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        let _ = self.0.compare_exchange(
            STATUS_BUSY,
            STATUS_IDLE,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

#[derive(Default)]
struct Ledger {
    metrics: WorkerMetrics,
    history: VecDeque<TaskResult>,
}

/// Snapshot of a worker for status queries.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerReport {
    pub id: String,
    pub role: String,
    pub status: WorkerStatus,
    pub capabilities: Vec<Capability>,
    pub metrics: WorkerMetrics,
    /// Pending messages in the worker's mailbox, when a bus was given.
    pub queue_size: Option<usize>,
}

/// Runs a [`Worker`] with single-flight execution, enforced deadlines and bookkeeping.
pub struct WorkerHost {
    worker: Box<dyn Worker>,
    flight: Mutex<()>,
    status: AtomicU8,
    ledger: Mutex<Ledger>,
    history_capacity: usize,
}

impl WorkerHost {
    pub fn new(worker: impl Worker) -> Self {
        Self {
            worker: Box::new(worker),
            flight: Mutex::new(()),
            status: AtomicU8::new(STATUS_IDLE),
            ledger: Mutex::new(Ledger::default()),
            history_capacity: 100,
        }
    }

    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity.max(1);
        self
    }

    pub fn id(&self) -> &str {
        &self.worker.config().id
    }

    pub fn config(&self) -> &WorkerConfig {
        self.worker.config()
    }

    pub fn status(&self) -> WorkerStatus {
        decode_status(self.status.load(Ordering::Acquire))
    }

    /// Execute a task. Never fails: every problem becomes `success = false`.
    ///
    /// Concurrent calls on the same host are served one at a time.
    pub async fn receive(&self, task: Task) -> TaskResult {
        let _flight = self.flight.lock().await;
        let config = self.worker.config();
        let start = Instant::now();
        let task_id = task.id.clone();

        let mut result = if self
            .status
            .compare_exchange(
                STATUS_IDLE,
                STATUS_BUSY,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            TaskResult::failure(HarvestError::WorkerOffline(config.id.clone()).to_string())
        } else {
            let _busy = BusyGuard(&self.status);
            self.run_guarded(task).await
        };

        result.task_id = task_id;
        result.worker_id = config.id.clone();
        result.execution_ms = start.elapsed().as_millis() as u64;

        debug!(
            worker = %config.id,
            task_id = %result.task_id,
            success = result.success,
            elapsed_ms = result.execution_ms,
            "Task finished"
        );

        let mut ledger = self.ledger.lock().await;
        ledger.metrics.record(result.success, result.execution_ms);
        if ledger.history.len() >= self.history_capacity {
            ledger.history.pop_front();
        }
        ledger.history.push_back(result.clone());

        result
    }

    async fn run_guarded(&self, task: Task) -> TaskResult {
        let config = self.worker.config();
        if !config.can_handle(&task.kind) {
            warn!(worker = %config.id, kind = %task.kind, "Unsupported task kind");
            return TaskResult::failure(
                HarvestError::UnsupportedTask {
                    worker: config.id.clone(),
                    kind: task.kind,
                }
                .to_string(),
            );
        }

        let timeout_secs = task.timeout_secs.unwrap_or(config.timeout_secs);
        let task_id = task.id.clone();
        info!(worker = %config.id, task_id = %task_id, kind = %task.kind, "Executing task");

        match tokio::time::timeout(
            Duration::from_secs(timeout_secs),
            self.worker.execute(task),
        )
        .await
        {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                warn!(worker = %config.id, task_id = %task_id, error = %e, "Task failed");
                TaskResult::failure(e.to_string())
            }
            Err(_) => {
                warn!(worker = %config.id, task_id = %task_id, timeout_secs, "Task timed out");
                TaskResult::failure(
                    HarvestError::TaskTimeout {
                        task_id,
                        timeout_secs,
                    }
                    .to_string(),
                )
            }
        }
    }

    pub async fn metrics(&self) -> WorkerMetrics {
        self.ledger.lock().await.metrics.clone()
    }

    /// The most recent `limit` results, oldest first.
    pub async fn history(&self, limit: usize) -> Vec<TaskResult> {
        let ledger = self.ledger.lock().await;
        let skip = ledger.history.len().saturating_sub(limit);
        ledger.history.iter().skip(skip).cloned().collect()
    }

    pub async fn status_report(&self, bus: Option<&MessageBus>) -> WorkerReport {
        let config = self.worker.config();
        let queue_size = match bus {
            Some(bus) => bus.queue_size(&config.id).await,
            None => None,
        };
        WorkerReport {
            id: config.id.clone(),
            role: config.role.clone(),
            status: self.status(),
            capabilities: config.capabilities.iter().copied().collect(),
            metrics: self.metrics().await,
            queue_size,
        }
    }

    /// Take the worker offline. Later `receive` calls fail.
    pub fn shutdown(&self) {
        self.status.store(STATUS_OFFLINE, Ordering::Release);
        info!(worker = %self.id(), "Worker shut down");
    }

    /// Serve task messages from this worker's mailbox until cancelled.
    ///
    /// Replies with a result message when the sender asked for one.
    pub async fn serve(self: Arc<Self>, bus: Arc<MessageBus>, cancel: CancellationToken) {
        let id = self.id().to_string();
        bus.register(&id).await;
        info!(worker = %id, "Serving mailbox");

        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => break,
                msg = bus.receive(&id, bus.receive_timeout()) => msg,
            };
            let Some(message) = message else {
                if !bus.is_registered(&id).await {
                    debug!(worker = %id, "Mailbox removed, stopping");
                    break;
                }
                continue;
            };

            let Some(task) = message.to_task() else {
                debug!(worker = %id, message_type = ?message.message_type, "Ignoring non-task message");
                continue;
            };

            let result = self.receive(task).await;
            if message.requires_response {
                let reply = Message::result(&id, &message.sender, &message.id, &result);
                if !bus.send(reply).await {
                    warn!(worker = %id, to = %message.sender, "Could not deliver result");
                }
            }
        }

        debug!(worker = %id, "Stopped serving mailbox");
    }
}

/// Delegate a task over the bus and wait for its result.
///
/// `sender` must be registered. Unrelated messages that arrive while waiting
/// are put back at the front of the sender's mailbox in arrival order.
/// Returns `None` when the task could not be sent or no reply arrived in time.
pub async fn request(
    bus: &MessageBus,
    sender: &str,
    receiver: &str,
    task: &Task,
    wait: Duration,
) -> Option<TaskResult> {
    let message = Message::task(sender, receiver, task).requiring_response();
    if !bus.send(message).await {
        return None;
    }

    let deadline = Instant::now() + wait;
    let mut deferred = Vec::new();
    let mut reply = None;

    while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
        let Some(message) = bus.receive(sender, remaining).await else {
            break;
        };
        let matches = message.message_type == MessageType::Result
            && message.parent_message_id.as_deref() == Some(task.id.as_str());
        if matches {
            reply = message.to_result();
            break;
        }
        deferred.push(message);
    }

    let deferred_count = deferred.len();
    let requeued = bus.requeue_front(sender, deferred).await;
    if requeued < deferred_count {
        warn!(
            worker = %sender,
            dropped = deferred_count - requeued,
            "Lost deferred messages while awaiting reply"
        );
    }
    reply
}

#[cfg(test)]
mod tests {
    use super::*;
    use harvest_core::types::{kinds, Params};
    use std::sync::atomic::AtomicUsize;

    struct EchoWorker {
        config: WorkerConfig,
        delay: Duration,
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl EchoWorker {
        fn new(delay: Duration) -> Self {
            Self {
                config: WorkerConfig::new("echo", "tester")
                    .with_capability(Capability::Explore)
                    .with_timeout(5),
                delay,
                active: Arc::new(AtomicUsize::new(0)),
                peak: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl Worker for EchoWorker {
        fn config(&self) -> &WorkerConfig {
            &self.config
        }

        fn execute(&self, task: Task) -> BoxFuture<'_, Result<TaskResult>> {
            Box::pin(async move {
                let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(self.delay).await;
                self.active.fetch_sub(1, Ordering::SeqCst);

                if task.params.contains_key("fail") {
                    return Err(HarvestError::Crawl("boom".into()));
                }
                Ok(TaskResult::success(task.params, 0.8))
            })
        }
    }

    fn explore_task() -> Task {
        Task::new(kinds::EXPLORE, Params::new())
    }

    #[tokio::test]
    async fn result_is_stamped_on_success_and_failure() {
        let host = WorkerHost::new(EchoWorker::new(Duration::ZERO));

        let task = explore_task();
        let ok = host.receive(task.clone()).await;
        assert!(ok.success);
        assert_eq!(ok.task_id, task.id);
        assert_eq!(ok.worker_id, "echo");

        let mut params = Params::new();
        params.insert("fail".into(), true.into());
        let task = Task::new(kinds::EXPLORE, params);
        let failed = host.receive(task.clone()).await;
        assert!(!failed.success);
        assert_eq!(failed.task_id, task.id);
        assert_eq!(failed.worker_id, "echo");
        assert!(failed.error.unwrap().contains("boom"));
        assert_eq!(host.status(), WorkerStatus::Idle);
    }

    #[tokio::test]
    async fn unknown_kind_is_rejected() {
        let host = WorkerHost::new(EchoWorker::new(Duration::ZERO));
        let task = Task::new("mine_bitcoin", Params::new());
        let result = host.receive(task.clone()).await;
        assert!(!result.success);
        assert_eq!(result.task_id, task.id);
        assert!(result.error.unwrap().contains("not supported"));
    }

    #[tokio::test]
    async fn metrics_track_every_call() {
        let host = WorkerHost::new(EchoWorker::new(Duration::ZERO));
        let mut fail = Params::new();
        fail.insert("fail".into(), true.into());

        host.receive(explore_task()).await;
        host.receive(Task::new(kinds::EXPLORE, fail)).await;
        host.receive(Task::new(kinds::ANALYZE, Params::new())).await;
        host.receive(explore_task()).await;

        let m = host.metrics().await;
        assert_eq!(m.tasks_completed + m.tasks_failed, 4);
        assert_eq!(m.tasks_completed, 2);
        assert!((m.success_rate - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn timeout_is_enforced() {
        let host = WorkerHost::new(EchoWorker::new(Duration::from_secs(5)));
        let task = explore_task().with_timeout(0);
        let result = host.receive(task.clone()).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("timed out"));
        assert_eq!(host.status(), WorkerStatus::Idle);
        assert_eq!(host.metrics().await.tasks_failed, 1);
    }

    #[tokio::test]
    async fn concurrent_receives_are_serialized() {
        let worker = EchoWorker::new(Duration::from_millis(20));
        let peak = worker.peak.clone();
        let host = Arc::new(WorkerHost::new(worker));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let host = host.clone();
            handles.push(tokio::spawn(async move { host.receive(explore_task()).await }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().success);
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_makes_worker_offline() {
        let host = WorkerHost::new(EchoWorker::new(Duration::ZERO));
        host.shutdown();
        assert_eq!(host.status(), WorkerStatus::Offline);
        let task = explore_task();
        let result = host.receive(task.clone()).await;
        assert!(!result.success);
        assert_eq!(result.task_id, task.id);
        assert!(result.error.unwrap().contains("offline"));
        assert_eq!(host.status(), WorkerStatus::Offline);
    }

    #[tokio::test]
    async fn history_is_bounded() {
        let host = WorkerHost::new(EchoWorker::new(Duration::ZERO)).with_history_capacity(3);
        let mut last = String::new();
        for _ in 0..5 {
            let task = explore_task();
            last = task.id.clone();
            host.receive(task).await;
        }
        assert_eq!(host.history(10).await.len(), 3);
        let recent = host.history(1).await;
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].task_id, last);
    }

    #[tokio::test]
    async fn delegation_round_trip_over_bus() {
        let bus = Arc::new(MessageBus::new());
        bus.register("supervisor").await;
        let host = Arc::new(WorkerHost::new(EchoWorker::new(Duration::ZERO)));
        bus.register(host.id()).await;

        let cancel = CancellationToken::new();
        let server = tokio::spawn(host.clone().serve(bus.clone(), cancel.clone()));

        let mut params = Params::new();
        params.insert("url".into(), "https://news.test".into());
        let task = Task::new(kinds::EXPLORE, params);
        let result = request(&bus, "supervisor", "echo", &task, Duration::from_secs(2))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.task_id, task.id);
        assert_eq!(result.data["url"], "https://news.test");

        let report = host.status_report(Some(&bus)).await;
        assert_eq!(report.metrics.tasks_completed, 1);
        assert_eq!(report.queue_size, Some(0));

        cancel.cancel();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn unrelated_messages_keep_their_order_while_awaiting_reply() {
        let bus = Arc::new(MessageBus::new());
        bus.register("supervisor").await;
        bus.register("echo").await;

        let note = || Message::new("peer", "supervisor", MessageType::Event, Params::new());
        let (first, second, late) = (note(), note(), note());
        assert!(bus.send(first.clone()).await);
        assert!(bus.send(second.clone()).await);

        let responder = {
            let bus = bus.clone();
            let late = late.clone();
            tokio::spawn(async move {
                let message = bus.receive("echo", Duration::from_secs(2)).await.unwrap();
                let task = message.to_task().unwrap();
                let mut result = TaskResult::success(Params::new(), 1.0);
                result.task_id = task.id.clone();
                result.worker_id = "echo".into();
                let reply = Message::result("echo", "supervisor", &message.id, &result);
                assert!(bus.send(reply).await);
                assert!(bus.send(late).await);
            })
        };

        let task = explore_task();
        let result = request(&bus, "supervisor", "echo", &task, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(result.task_id, task.id);
        responder.await.unwrap();

        let mut order = vec![];
        while let Some(message) = bus.receive("supervisor", Duration::from_millis(50)).await {
            order.push(message.id);
        }
        assert_eq!(order, vec![first.id, second.id, late.id]);
    }
}
