use crate::{ErrorKind, NodeError, Value};
use serde::{Deserialize, Serialize};

/// Lifecycle of one node within a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum NodeExecutionState {
    Pending,
    Running {
        /// Partial output while a handler streams.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        partial: Option<Value>,
    },
    Success {
        output: Value,
    },
    Error {
        kind: ErrorKind,
        message: String,
    },
    Skipped {
        reason: SkipReason,
    },
}

/// Why a node never ran. Only a run cancellation leaves nodes unrun;
/// a failed upstream turns its dependents into errors instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Cancelled,
}

/// Status tag without payload, for UI badges and counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Success,
    Error,
    Skipped,
}

impl NodeExecutionState {
    pub fn running() -> Self {
        NodeExecutionState::Running { partial: None }
    }

    pub fn from_error(error: &NodeError) -> Self {
        NodeExecutionState::Error {
            kind: error.kind(),
            message: error.to_string(),
        }
    }

    pub fn status(&self) -> NodeStatus {
        match self {
            NodeExecutionState::Pending => NodeStatus::Pending,
            NodeExecutionState::Running { .. } => NodeStatus::Running,
            NodeExecutionState::Success { .. } => NodeStatus::Success,
            NodeExecutionState::Error { .. } => NodeStatus::Error,
            NodeExecutionState::Skipped { .. } => NodeStatus::Skipped,
        }
    }

    /// Success, error or skipped.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            NodeExecutionState::Success { .. }
                | NodeExecutionState::Error { .. }
                | NodeExecutionState::Skipped { .. }
        )
    }

    pub fn output(&self) -> Option<&Value> {
        match self {
            NodeExecutionState::Success { output } => Some(output),
            NodeExecutionState::Running { partial } => partial.as_ref(),
            _ => None,
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            NodeExecutionState::Error { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}
