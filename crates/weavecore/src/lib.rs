//! Core abstractions for the weave engine
//!
//! Graph model, values, the node contract, lifecycle states, and the two
//! run-scoped coordination primitives (cancellation signals and the
//! pending-input registry). No scheduling happens here.

pub mod cancel;
mod error;
mod events;
mod graph;
mod node;
pub mod pending;
mod session;
mod state;
mod value;

pub use cancel::{CancelReason, CancelSignal, OperationClass, TimeoutPolicy};
pub use error::{ErrorKind, FailureReason, FlowError, GraphError, NodeError};
pub use events::{
    EventBus, EventEmitter, ExecutionEvent, NodeEvent, RunId, StateObserver,
};
pub use graph::{
    Edge, EdgeId, Graph, GraphId, GraphSnapshot, GraphStore, IdGenerator, NodeId, NodeSpec,
    DEFAULT_INPUT_PORT, DEFAULT_OUTPUT_PORT,
};
pub use node::{Node, NodeContext, NodeMetadata, NodeOutput};
pub use pending::{PendingInput, PendingInputError, PendingInputRegistry};
pub use session::SessionTracker;
pub use state::{NodeExecutionState, NodeStatus, SkipReason};
pub use value::{BinaryPayload, DataKind, Value};

pub use tokio_util::sync::CancellationToken;

/// Result type for flow operations
pub type Result<T> = std::result::Result<T, FlowError>;
