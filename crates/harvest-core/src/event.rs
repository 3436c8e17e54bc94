use chrono::{DateTime, Utc};
use serde::Serialize;

/// Lifecycle event emitted while a workflow runs.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkflowEvent {
    RunStarted {
        run_id: String,
        workflow: String,
        engine: String,
        timestamp: DateTime<Utc>,
    },
    PhaseStarted {
        run_id: String,
        phase: String,
    },
    PhaseCompleted {
        run_id: String,
        phase: String,
        success: bool,
        quality_score: f64,
        elapsed_ms: u64,
    },
    PhaseFailed {
        run_id: String,
        phase: String,
        error: String,
    },
    RouteTaken {
        run_id: String,
        from: String,
        route: String,
        to: Option<String>,
    },
    RunFinished {
        run_id: String,
        success: bool,
        errors: usize,
        elapsed_ms: u64,
    },
}

impl WorkflowEvent {
    pub fn run_id(&self) -> &str {
        match self {
            Self::RunStarted { run_id, .. }
            | Self::PhaseStarted { run_id, .. }
            | Self::PhaseCompleted { run_id, .. }
            | Self::PhaseFailed { run_id, .. }
            | Self::RouteTaken { run_id, .. }
            | Self::RunFinished { run_id, .. } => run_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::RunFinished { .. })
    }
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<WorkflowEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: WorkflowEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<WorkflowEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.publish(WorkflowEvent::PhaseStarted {
            run_id: "r1".into(),
            phase: "crawl".into(),
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.run_id(), "r1");
        assert!(!event.is_terminal());
    }

    #[test]
    fn publish_without_subscribers_is_silent() {
        let bus = EventBus::new(4);
        bus.publish(WorkflowEvent::RunFinished {
            run_id: "r1".into(),
            success: true,
            errors: 0,
            elapsed_ms: 3,
        });
    }

    #[test]
    fn events_serialize_with_tag() {
        let event = WorkflowEvent::RouteTaken {
            run_id: "r1".into(),
            from: "store".into(),
            route: "notify".into(),
            to: Some("notify".into()),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "route_taken");
        assert_eq!(json["route"], "notify");
    }
}
