use crate::{ErrorInfo, Status, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Events emitted while a submission runs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ExecutionEvent {
    FlowRunStarted {
        run_id: String,
        flow_id: String,
        parent_run_id: Option<String>,
        index: Option<usize>,
        variant_id: String,
        timestamp: DateTime<Utc>,
    },
    FlowRunCompleted {
        run_id: String,
        status: Status,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    NodeRunStarted {
        run_id: String,
        node: String,
        flow_run_id: String,
        timestamp: DateTime<Utc>,
    },
    NodeRunCompleted {
        run_id: String,
        node: String,
        cached: bool,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    NodeRunBypassed {
        run_id: String,
        node: String,
        timestamp: DateTime<Utc>,
    },
    NodeRunFailed {
        run_id: String,
        node: String,
        error: ErrorInfo,
        timestamp: DateTime<Utc>,
    },
    RequestRejected {
        flow_run_id: String,
        error: ErrorInfo,
        timestamp: DateTime<Utc>,
    },
    ToolEvent {
        run_id: String,
        node: String,
        event: ToolEvent,
        timestamp: DateTime<Utc>,
    },
}

/// Events a tool reports while it runs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum ToolEvent {
    Info { message: String },
    Warning { message: String },
    Progress { percent: f64, message: Option<String> },
    Data { name: String, value: Value },
}

/// Event emitter handed to tools for real-time updates
#[derive(Clone)]
pub struct EventEmitter {
    run_id: String,
    node: String,
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventEmitter {
    pub fn new(
        run_id: impl Into<String>,
        node: impl Into<String>,
        sender: broadcast::Sender<ExecutionEvent>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            node: node.into(),
            sender,
        }
    }

    /// An emitter whose events go nowhere. Used for direct tool calls.
    pub fn detached(node: impl Into<String>) -> Self {
        let (sender, _) = broadcast::channel(1);
        Self::new(String::new(), node, sender)
    }

    pub fn emit(&self, event: ToolEvent) {
        let _ = self.sender.send(ExecutionEvent::ToolEvent {
            run_id: self.run_id.clone(),
            node: self.node.clone(),
            event,
            timestamp: Utc::now(),
        });
    }

    pub fn info(&self, message: impl Into<String>) {
        self.emit(ToolEvent::Info {
            message: message.into(),
        });
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.emit(ToolEvent::Warning {
            message: message.into(),
        });
    }

    pub fn progress(&self, percent: f64, message: Option<String>) {
        self.emit(ToolEvent::Progress { percent, message });
    }

    /// Stream a partial value (e.g. LLM tokens)
    pub fn data(&self, name: impl Into<String>, value: Value) {
        self.emit(ToolEvent::Data {
            name: name.into(),
            value,
        });
    }
}

/// Process-wide event bus
pub struct EventBus {
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: ExecutionEvent) {
        let _ = self.sender.send(event);
    }

    pub fn create_emitter(&self, run_id: &str, node: &str) -> EventEmitter {
        EventEmitter::new(run_id, node, self.sender.clone())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emitter_events_reach_subscribers() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let emitter = bus.create_emitter("run_1", "fetch");
        emitter.info("working");

        match rx.recv().await.unwrap() {
            ExecutionEvent::ToolEvent {
                run_id,
                node,
                event: ToolEvent::Info { message },
                ..
            } => {
                assert_eq!(run_id, "run_1");
                assert_eq!(node, "fetch");
                assert_eq!(message, "working");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
