use crate::{
    CancelSignal, EventEmitter, NodeError, NodeId, PendingInputRegistry, SessionTracker, Value,
    DEFAULT_OUTPUT_PORT,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Core trait that all executable nodes implement
#[async_trait]
pub trait Node: Send + Sync {
    /// Type identifier (e.g. "text.generate", "code.transform")
    fn node_type(&self) -> &str;

    /// Execute the node with resolved inputs
    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError>;

    /// Optional: validate inline data before the node runs
    fn validate_data(&self, _data: &HashMap<String, Value>) -> Result<(), NodeError> {
        Ok(())
    }
}

/// Execution context passed to each node
#[derive(Clone)]
pub struct NodeContext {
    pub node_id: NodeId,

    pub node_type: String,

    /// Values resolved from upstream outputs and inline fallbacks, by port
    pub inputs: HashMap<String, Value>,

    /// The node's own inline data
    pub data: HashMap<String, Value>,

    pub events: EventEmitter,

    /// User cancellation composed with this node's deadline
    pub cancellation: CancelSignal,

    pub pending_inputs: PendingInputRegistry,

    pub sessions: SessionTracker,
}

impl NodeContext {
    /// Standalone context with a fresh registry and session tracker.
    pub fn new(
        node_id: impl Into<NodeId>,
        node_type: impl Into<String>,
        events: EventEmitter,
        cancellation: CancelSignal,
    ) -> Self {
        let sessions = SessionTracker::new(cancellation.user_token());
        Self {
            node_id: node_id.into(),
            node_type: node_type.into(),
            inputs: HashMap::new(),
            data: HashMap::new(),
            events,
            cancellation,
            pending_inputs: PendingInputRegistry::new(),
            sessions,
        }
    }

    pub fn with_input(mut self, port: impl Into<String>, value: impl Into<Value>) -> Self {
        self.inputs.insert(port.into(), value.into());
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Get required input or return error
    pub fn require_input(&self, name: &str) -> Result<&Value, NodeError> {
        self.inputs
            .get(name)
            .filter(|v| !v.is_null())
            .ok_or_else(|| NodeError::MissingInput(name.to_string()))
    }

    /// Required input rendered as text; empty text counts as missing.
    pub fn require_text(&self, name: &str) -> Result<String, NodeError> {
        let text = self.require_input(name)?.to_text();
        if text.trim().is_empty() {
            return Err(NodeError::MissingInput(name.to_string()));
        }
        Ok(text)
    }

    pub fn optional_text(&self, name: &str) -> Option<String> {
        self.inputs
            .get(name)
            .filter(|v| !v.is_null())
            .map(Value::to_text)
            .filter(|s| !s.trim().is_empty())
    }

    /// Inline string setting
    pub fn data_str(&self, name: &str) -> Option<&str> {
        self.data.get(name).and_then(|v| v.as_str())
    }

    pub fn require_data_str(&self, name: &str) -> Result<&str, NodeError> {
        self.data_str(name)
            .ok_or_else(|| NodeError::Configuration(format!("Missing setting: {}", name)))
    }

    pub fn get_data_or(&self, name: &str, default: Value) -> Value {
        self.data.get(name).cloned().unwrap_or(default)
    }
}

/// Output from node execution
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeOutput {
    /// Output port values
    pub outputs: HashMap<String, Value>,

    pub metadata: NodeMetadata,
}

impl NodeOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Output carrying one value on the default port.
    pub fn single(value: impl Into<Value>) -> Self {
        Self::new().with_output(DEFAULT_OUTPUT_PORT, value)
    }

    pub fn with_output(mut self, port: impl Into<String>, value: impl Into<Value>) -> Self {
        self.outputs.insert(port.into(), value.into());
        self
    }

    pub fn port(&self, port: &str) -> Option<&Value> {
        self.outputs.get(port)
    }

    /// Value on the default port, or the whole port map when there is none.
    pub fn primary(&self) -> Value {
        match self.outputs.get(DEFAULT_OUTPUT_PORT) {
            Some(value) => value.clone(),
            None if self.outputs.is_empty() => Value::Null,
            None => Value::Object(self.outputs.clone()),
        }
    }
}

/// Metadata about node execution
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeMetadata {
    pub execution_time_ms: u64,
    pub custom: HashMap<String, Value>,
}
