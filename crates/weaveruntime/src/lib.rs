//! Graph execution runtime
//!
//! The scheduler that walks a graph, the node registry, per-node dispatch
//! under cancellation and deadlines, the AI backend contract, the snippet
//! sandbox, and the projector that folds run events into UI state.

mod backend;
mod dispatch;
mod executor;
mod projector;
mod registry;
mod runtime;
pub mod sandbox;
mod topology;

pub use backend::{
    collect_response, AiBackend, BackendError, BackendRequest, BackendResponse, ChunkStream,
    Operation, StreamChunk,
};
pub use dispatch::NodeDispatcher;
pub use executor::{FlowExecutor, FlowResult, PreparedFlow, RunOptions};
pub use projector::{ExecutionProjector, NodeView, OutputLogEntry};
pub use registry::{NodeFactory, NodeMetadata, NodeRegistry, PortDefinition};
pub use runtime::{FlowRuntime, RunHandle, RuntimeConfig};
pub use sandbox::{CodeEvaluator, CodeFilter, ProcessSandbox, SandboxConfig, SandboxError};
pub use topology::FlowGraph;
