use crate::{GraphId, NodeExecutionState, NodeId, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

pub type RunId = Uuid;

/// Callback receiving every node state transition of a run, in emission order.
pub type StateObserver = Arc<dyn Fn(&NodeId, &NodeExecutionState) + Send + Sync>;

/// Events emitted during a run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ExecutionEvent {
    RunStarted {
        run_id: RunId,
        graph_id: GraphId,
        node_count: usize,
        timestamp: DateTime<Utc>,
    },
    RunCompleted {
        run_id: RunId,
        cancelled: bool,
        succeeded: usize,
        failed: usize,
        skipped: usize,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    NodeStateChanged {
        run_id: RunId,
        node_id: NodeId,
        state: NodeExecutionState,
        timestamp: DateTime<Utc>,
    },
    NodeEvent {
        run_id: RunId,
        node_id: NodeId,
        event: NodeEvent,
        timestamp: DateTime<Utc>,
    },
}

impl ExecutionEvent {
    pub fn run_id(&self) -> RunId {
        match self {
            ExecutionEvent::RunStarted { run_id, .. }
            | ExecutionEvent::RunCompleted { run_id, .. }
            | ExecutionEvent::NodeStateChanged { run_id, .. }
            | ExecutionEvent::NodeEvent { run_id, .. } => *run_id,
        }
    }
}

/// Events specific to node execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum NodeEvent {
    Info { message: String },
    Warning { message: String },
    /// The node registered with the pending-input registry.
    AwaitingInput { prompt: Option<String> },
    /// Data pushed by a background session.
    Data { port: String, value: Value },
}

/// Event emitter bound to one node of one run
#[derive(Clone)]
pub struct EventEmitter {
    run_id: RunId,
    node_id: NodeId,
    sender: broadcast::Sender<ExecutionEvent>,
    observer: Option<StateObserver>,
}

impl EventEmitter {
    pub fn new(
        run_id: RunId,
        node_id: NodeId,
        sender: broadcast::Sender<ExecutionEvent>,
        observer: Option<StateObserver>,
    ) -> Self {
        Self {
            run_id,
            node_id,
            sender,
            observer,
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Publish a lifecycle transition to the observer and the bus.
    pub fn state(&self, state: NodeExecutionState) {
        if let Some(observer) = &self.observer {
            observer(&self.node_id, &state);
        }
        let _ = self.sender.send(ExecutionEvent::NodeStateChanged {
            run_id: self.run_id,
            node_id: self.node_id.clone(),
            state,
            timestamp: Utc::now(),
        });
    }

    /// Streamed partial output; replaces the previous partial downstream.
    pub fn partial(&self, value: Value) {
        self.state(NodeExecutionState::Running {
            partial: Some(value),
        });
    }

    /// Emit a node-specific event
    pub fn emit(&self, event: NodeEvent) {
        let _ = self.sender.send(ExecutionEvent::NodeEvent {
            run_id: self.run_id,
            node_id: self.node_id.clone(),
            event,
            timestamp: Utc::now(),
        });
    }

    pub fn info(&self, message: impl Into<String>) {
        self.emit(NodeEvent::Info {
            message: message.into(),
        });
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.emit(NodeEvent::Warning {
            message: message.into(),
        });
    }

    pub fn awaiting_input(&self, prompt: Option<String>) {
        self.emit(NodeEvent::AwaitingInput { prompt });
    }

    pub fn data(&self, port: impl Into<String>, value: Value) {
        self.emit(NodeEvent::Data {
            port: port.into(),
            value,
        });
    }
}

/// Process-wide event bus
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: ExecutionEvent) {
        let _ = self.sender.send(event);
    }

    pub fn create_emitter(
        &self,
        run_id: RunId,
        node_id: NodeId,
        observer: Option<StateObserver>,
    ) -> EventEmitter {
        EventEmitter::new(run_id, node_id, self.sender.clone(), observer)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
