use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{Params, Task, TaskResult};

/// Receiver value marking a message addressed to every worker.
pub const BROADCAST: &str = "broadcast";

/// Kind of an inter-worker message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Task,
    Result,
    Query,
    Response,
    Event,
    Error,
    Status,
    Negotiate,
}

/// Envelope exchanged over the message bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub sender: String,
    pub receiver: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(default)]
    pub payload: Params,
    #[serde(default = "default_priority")]
    pub priority: u8,
    /// Time-to-live in seconds.
    #[serde(default = "default_ttl")]
    pub ttl_secs: u64,
    #[serde(default)]
    pub requires_response: bool,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub parent_message_id: Option<String>,
    #[serde(default)]
    pub metadata: Params,
}

fn default_priority() -> u8 {
    5
}

fn default_ttl() -> u64 {
    3600
}

impl Message {
    pub fn new(
        sender: impl Into<String>,
        receiver: impl Into<String>,
        message_type: MessageType,
        payload: Params,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sender: sender.into(),
            receiver: receiver.into(),
            timestamp: Utc::now(),
            message_type,
            payload,
            priority: default_priority(),
            ttl_secs: default_ttl(),
            requires_response: false,
            conversation_id: None,
            parent_message_id: None,
            metadata: Params::new(),
        }
    }

    /// A task delegation. The message id is the task id so replies can be matched.
    pub fn task(sender: impl Into<String>, receiver: impl Into<String>, task: &Task) -> Self {
        let mut payload = Params::new();
        payload.insert("task_type".into(), task.kind.clone().into());
        payload.insert(
            "params".into(),
            serde_json::Value::Object(task.params.clone()),
        );
        let mut msg = Self::new(sender, receiver, MessageType::Task, payload);
        msg.id = task.id.clone();
        msg.priority = task.priority;
        msg
    }

    /// A reply carrying a task result back to the delegating worker.
    pub fn result(
        sender: impl Into<String>,
        receiver: impl Into<String>,
        original_task_id: &str,
        result: &TaskResult,
    ) -> Self {
        let mut payload = Params::new();
        payload.insert("original_task_id".into(), original_task_id.into());
        payload.insert(
            "result".into(),
            serde_json::to_value(result).unwrap_or(serde_json::Value::Null),
        );
        payload.insert("success".into(), result.success.into());
        let mut msg = Self::new(sender, receiver, MessageType::Result, payload);
        msg.parent_message_id = Some(original_task_id.to_string());
        msg
    }

    pub fn with_ttl(mut self, ttl_secs: u64) -> Self {
        self.ttl_secs = ttl_secs;
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn requiring_response(mut self) -> Self {
        self.requires_response = true;
        self
    }

    pub fn in_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    /// True once more than `ttl_secs` have elapsed since `timestamp`.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.timestamp);
        age > chrono::Duration::seconds(self.ttl_secs as i64)
    }

    pub fn is_broadcast(&self) -> bool {
        self.receiver == BROADCAST
    }

    /// Copy of this message addressed to a different receiver.
    ///
    /// Keeps id, timestamp, type, payload, priority and ttl.
    pub fn retarget(&self, receiver: impl Into<String>) -> Self {
        let mut copy = self.clone();
        copy.receiver = receiver.into();
        copy
    }

    /// Rebuild the task a `Task` message carries.
    pub fn to_task(&self) -> Option<Task> {
        if self.message_type != MessageType::Task {
            return None;
        }
        let kind = self
            .payload
            .get("task_type")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        let params = self
            .payload
            .get("params")
            .and_then(|v| v.as_object())
            .cloned()
            .unwrap_or_default();
        Some(Task::new(kind, params).with_id(self.id.clone()))
    }

    /// Extract the result a `Result` message carries.
    pub fn to_result(&self) -> Option<TaskResult> {
        if self.message_type != MessageType::Result {
            return None;
        }
        self.payload
            .get("result")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}
