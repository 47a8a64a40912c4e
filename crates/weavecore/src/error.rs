use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Node error: {0}")]
    Node(#[from] NodeError),

    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum NodeError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Missing required input: {0}")]
    MissingInput(String),

    #[error("Upstream node '{node}' produced no value for '{port}'")]
    UpstreamFailed { node: String, port: String },

    #[error("Invalid input type for '{field}': expected {expected}, got {actual}")]
    InvalidInputType {
        field: String,
        expected: String,
        actual: String,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Remote failure ({reason}): {message}")]
    Remote {
        reason: FailureReason,
        message: String,
    },

    #[error("Timed out after {millis}ms")]
    Timeout { millis: u64 },

    #[error("Cancelled")]
    Cancelled,

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),
}

impl NodeError {
    /// Coarse classification surfaced in node error states.
    pub fn kind(&self) -> ErrorKind {
        match self {
            NodeError::Validation(_)
            | NodeError::MissingInput(_)
            | NodeError::UpstreamFailed { .. }
            | NodeError::InvalidInputType { .. }
            | NodeError::Configuration(_) => ErrorKind::Validation,
            NodeError::Network(_) => ErrorKind::Network,
            NodeError::Remote { reason, .. } => match reason {
                FailureReason::Timeout => ErrorKind::Timeout,
                FailureReason::Cancelled => ErrorKind::Cancelled,
                FailureReason::Network => ErrorKind::Network,
                _ => ErrorKind::Remote,
            },
            NodeError::Timeout { .. } => ErrorKind::Timeout,
            NodeError::Cancelled => ErrorKind::Cancelled,
            NodeError::ExecutionFailed(_) => ErrorKind::Execution,
        }
    }

    pub fn is_cancellation(&self) -> bool {
        self.kind() == ErrorKind::Cancelled
    }
}

/// Machine-readable error class attached to failed nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Network,
    Remote,
    Timeout,
    Cancelled,
    Execution,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Network => "network",
            ErrorKind::Remote => "remote",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Execution => "execution",
        };
        f.write_str(s)
    }
}

/// Failure reason reported by the AI backend for a non-success response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Timeout,
    Cancelled,
    Network,
    RateLimited,
    Unauthorized,
    InvalidRequest,
    Remote,
}

impl FailureReason {
    /// Parse the wire form, falling back to `Remote` for unknown reasons.
    pub fn parse(s: &str) -> Self {
        match s {
            "timeout" => FailureReason::Timeout,
            "cancelled" | "canceled" | "aborted" => FailureReason::Cancelled,
            "network" => FailureReason::Network,
            "rate_limited" => FailureReason::RateLimited,
            "unauthorized" => FailureReason::Unauthorized,
            "invalid_request" => FailureReason::InvalidRequest,
            _ => FailureReason::Remote,
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureReason::Timeout => "timeout",
            FailureReason::Cancelled => "cancelled",
            FailureReason::Network => "network",
            FailureReason::RateLimited => "rate_limited",
            FailureReason::Unauthorized => "unauthorized",
            FailureReason::InvalidRequest => "invalid_request",
            FailureReason::Remote => "remote",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    #[error("Graph not found: {0}")]
    NotFound(String),

    #[error("Invalid graph: {0}")]
    Invalid(String),

    #[error("Cyclic dependency detected")]
    CyclicDependency,

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Duplicate node id: {0}")]
    DuplicateNode(String),

    #[error("Unknown node type: {0}")]
    UnknownNodeType(String),

    #[error("Invalid connection: {0}")]
    InvalidConnection(String),
}
