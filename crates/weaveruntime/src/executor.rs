use crate::dispatch::NodeDispatcher;
use crate::registry::NodeMetadata;
use crate::topology::FlowGraph;
use chrono::Utc;
use futures::future::{join_all, BoxFuture, FutureExt};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;
use weavecore::{
    CancellationToken, EventBus, EventEmitter, ExecutionEvent, FlowError, Graph, GraphError,
    NodeContext, NodeError, NodeExecutionState, NodeId, NodeOutput, NodeSpec, NodeStatus,
    PendingInputRegistry, RunId, SessionTracker, SkipReason, StateObserver, Value,
    DEFAULT_INPUT_PORT, DEFAULT_OUTPUT_PORT,
};

/// Per-run collaborators supplied by the caller
pub struct RunOptions {
    pub run_id: RunId,
    /// Fed to root nodes on their default input port
    pub initial_input: Option<Value>,
    pub observer: Option<StateObserver>,
    pub cancel: CancellationToken,
    pub pending_inputs: PendingInputRegistry,
    pub sessions: SessionTracker,
}

impl RunOptions {
    pub fn new() -> Self {
        let cancel = CancellationToken::new();
        let sessions = SessionTracker::new(&cancel);
        Self {
            run_id: Uuid::new_v4(),
            initial_input: None,
            observer: None,
            cancel,
            pending_inputs: PendingInputRegistry::new(),
            sessions,
        }
    }

    pub fn with_input(mut self, value: impl Into<Value>) -> Self {
        self.initial_input = Some(value.into());
        self
    }

    pub fn with_observer(mut self, observer: StateObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Use `token` as the run's user cancellation; sessions follow it.
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.sessions = SessionTracker::new(&token);
        self.cancel = token;
        self
    }

    pub fn with_pending_inputs(mut self, registry: PendingInputRegistry) -> Self {
        self.pending_inputs = registry;
        self
    }

}

impl Default for RunOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of one run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowResult {
    pub run_id: RunId,
    /// Values of terminal nodes that succeeded
    pub outputs: HashMap<NodeId, Value>,
    /// Terminal nodes in completion order
    pub output_order: Vec<NodeId>,
    pub states: HashMap<NodeId, NodeExecutionState>,
    pub cancelled: bool,
    pub duration_ms: u64,
}

impl FlowResult {
    pub fn output(&self, node_id: &str) -> Option<&Value> {
        self.outputs.get(node_id)
    }

    /// Output of the first terminal node to finish.
    pub fn first_output(&self) -> Option<&Value> {
        self.output_order.first().and_then(|id| self.outputs.get(id))
    }

    pub fn state(&self, node_id: &str) -> Option<&NodeExecutionState> {
        self.states.get(node_id)
    }

    pub fn count(&self, status: NodeStatus) -> usize {
        self.states.values().filter(|s| s.status() == status).count()
    }

    pub fn is_success(&self) -> bool {
        !self.cancelled && self.states.values().all(|s| s.status() == NodeStatus::Success)
    }
}

/// A graph that passed validation, with handler metadata resolved.
pub struct PreparedFlow {
    graph: Arc<Graph>,
    topology: FlowGraph,
    metadata: HashMap<NodeId, NodeMetadata>,
    specs: HashMap<NodeId, usize>,
}

impl PreparedFlow {
    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    pub fn topology(&self) -> &FlowGraph {
        &self.topology
    }

    pub fn metadata(&self, node_id: &str) -> Option<&NodeMetadata> {
        self.metadata.get(node_id)
    }
}

/// Walks a graph from its roots, running every node exactly once.
///
/// A node starts as soon as its last incoming edge settles; siblings run
/// concurrently and a failing branch never stops its siblings.
pub struct FlowExecutor {
    dispatcher: Arc<NodeDispatcher>,
    event_bus: EventBus,
}

impl FlowExecutor {
    pub fn new(dispatcher: Arc<NodeDispatcher>, event_bus: EventBus) -> Self {
        Self {
            dispatcher,
            event_bus,
        }
    }

    pub fn dispatcher(&self) -> &Arc<NodeDispatcher> {
        &self.dispatcher
    }

    /// Validate structure and resolve every node's handler metadata.
    pub fn prepare(&self, graph: Arc<Graph>) -> Result<PreparedFlow, GraphError> {
        let topology = FlowGraph::build(&graph)?;

        let mut metadata = HashMap::new();
        let mut specs = HashMap::new();
        for (position, node) in graph.nodes.iter().enumerate() {
            metadata.insert(node.id.clone(), self.dispatcher.metadata(&node.node_type)?);
            specs.insert(node.id.clone(), position);
        }

        Ok(PreparedFlow {
            graph,
            topology,
            metadata,
            specs,
        })
    }

    /// Execute a graph and return results
    pub async fn execute_flow(
        &self,
        graph: Arc<Graph>,
        options: RunOptions,
    ) -> Result<FlowResult, FlowError> {
        let prepared = self.prepare(graph)?;
        Ok(self.run_prepared(prepared, options).await)
    }

    pub async fn run_prepared(&self, prepared: PreparedFlow, options: RunOptions) -> FlowResult {
        let started = Instant::now();
        let run_id = options.run_id;
        let node_count = prepared.graph.nodes.len();

        self.event_bus.emit(ExecutionEvent::RunStarted {
            run_id,
            graph_id: prepared.graph.id,
            node_count,
            timestamp: Utc::now(),
        });
        tracing::info!(%run_id, "Starting run of graph {} ({} nodes)", prepared.graph.id, node_count);

        let remaining = prepared
            .graph
            .nodes
            .iter()
            .map(|n| {
                let degree = prepared.topology.in_degree(&n.id);
                (n.id.clone(), AtomicUsize::new(degree))
            })
            .collect();

        let state = Arc::new(RunState {
            run_id,
            graph: prepared.graph,
            topology: prepared.topology,
            metadata: prepared.metadata,
            specs: prepared.specs,
            dispatcher: self.dispatcher.clone(),
            event_bus: self.event_bus.clone(),
            observer: options.observer,
            initial_input: options.initial_input,
            cancel: options.cancel,
            pending_inputs: options.pending_inputs,
            sessions: options.sessions,
            remaining,
            context: RwLock::new(HashMap::new()),
            states: Mutex::new(HashMap::new()),
            terminal: Mutex::new(Vec::new()),
        });

        for node in &state.graph.nodes {
            state.record(&node.id, NodeExecutionState::Pending);
        }

        let roots: Vec<_> = state
            .topology
            .roots()
            .iter()
            .map(|id| tokio::spawn(visit(state.clone(), id.clone())))
            .collect();

        let walk = join_all(roots);
        tokio::pin!(walk);
        let branches = tokio::select! {
            branches = &mut walk => branches,
            _ = state.cancel.cancelled() => {
                let released = state.pending_inputs.clear();
                state.sessions.shutdown();
                tracing::info!(%run_id, released, "Run cancelled");
                walk.await
            }
        };
        for branch in branches {
            if let Err(e) = branch {
                tracing::error!(%run_id, "Branch task failed: {}", e);
            }
        }

        let states = state.states.lock().clone();
        let terminal = std::mem::take(&mut *state.terminal.lock());
        let output_order: Vec<NodeId> = terminal.iter().map(|(id, _)| id.clone()).collect();
        let outputs: HashMap<NodeId, Value> = terminal.into_iter().collect();

        let result = FlowResult {
            run_id,
            outputs,
            output_order,
            states,
            cancelled: state.cancel.is_cancelled(),
            duration_ms: started.elapsed().as_millis() as u64,
        };

        self.event_bus.emit(ExecutionEvent::RunCompleted {
            run_id,
            cancelled: result.cancelled,
            succeeded: result.count(NodeStatus::Success),
            failed: result.count(NodeStatus::Error),
            skipped: result.count(NodeStatus::Skipped),
            duration_ms: result.duration_ms,
            timestamp: Utc::now(),
        });
        tracing::info!(
            %run_id,
            "Run finished in {}ms ({} succeeded, {} failed)",
            result.duration_ms,
            result.count(NodeStatus::Success),
            result.count(NodeStatus::Error)
        );

        result
    }
}

struct RunState {
    run_id: RunId,
    graph: Arc<Graph>,
    topology: FlowGraph,
    metadata: HashMap<NodeId, NodeMetadata>,
    specs: HashMap<NodeId, usize>,
    dispatcher: Arc<NodeDispatcher>,
    event_bus: EventBus,
    observer: Option<StateObserver>,
    initial_input: Option<Value>,
    cancel: CancellationToken,
    pending_inputs: PendingInputRegistry,
    sessions: SessionTracker,
    /// Incoming edges not yet settled, per node
    remaining: HashMap<NodeId, AtomicUsize>,
    /// Outputs of nodes that succeeded
    context: RwLock<HashMap<NodeId, NodeOutput>>,
    states: Mutex<HashMap<NodeId, NodeExecutionState>>,
    terminal: Mutex<Vec<(NodeId, Value)>>,
}

/// Settle `node_id`, then start every child whose last input just arrived.
fn visit(state: Arc<RunState>, node_id: NodeId) -> BoxFuture<'static, ()> {
    async move {
        state.settle(&node_id).await;

        let ready: Vec<NodeId> = state
            .topology
            .outgoing(&node_id)
            .iter()
            .map(|&i| &state.graph.edges[i].target)
            .filter(|target| state.arrive(target))
            .cloned()
            .collect();

        let children: Vec<_> = ready
            .into_iter()
            .map(|child| tokio::spawn(visit(state.clone(), child)))
            .collect();

        for child in join_all(children).await {
            if let Err(e) = child {
                tracing::error!(run_id = %state.run_id, "Branch below {} failed: {}", node_id, e);
            }
        }
    }
    .boxed()
}

impl RunState {
    fn spec(&self, node_id: &str) -> Option<&NodeSpec> {
        self.specs.get(node_id).and_then(|&i| self.graph.nodes.get(i))
    }

    fn emitter(&self, node_id: &str) -> EventEmitter {
        self.event_bus
            .create_emitter(self.run_id, node_id.to_string(), self.observer.clone())
    }

    fn record(&self, node_id: &str, state: NodeExecutionState) {
        self.states.lock().insert(node_id.to_string(), state.clone());
        self.emitter(node_id).state(state);
    }

    /// Count down one settled incoming edge; true for the final arrival.
    fn arrive(&self, node_id: &str) -> bool {
        self.remaining
            .get(node_id)
            .map_or(false, |count| count.fetch_sub(1, Ordering::AcqRel) == 1)
    }

    async fn settle(&self, node_id: &str) {
        let (Some(spec), Some(meta)) = (self.spec(node_id), self.metadata.get(node_id)) else {
            return;
        };

        if let Some((source, port)) = self.failed_required_upstream(node_id, meta) {
            if self.cancel.is_cancelled() {
                tracing::debug!(run_id = %self.run_id, "Skipping {}: run cancelled", node_id);
                self.record(
                    node_id,
                    NodeExecutionState::Skipped {
                        reason: SkipReason::Cancelled,
                    },
                );
            } else {
                let error = NodeError::UpstreamFailed { node: source, port };
                tracing::warn!(run_id = %self.run_id, "Node {} not run: {}", node_id, error);
                self.record(node_id, NodeExecutionState::from_error(&error));
            }
            return;
        }

        self.record(node_id, NodeExecutionState::running());

        // The deadline starts once the node holds its slot, not while queued.
        let _permit = match self
            .dispatcher
            .acquire(meta.operation_class, &self.cancel)
            .await
        {
            Ok(permit) => permit,
            Err(e) => {
                tracing::info!(run_id = %self.run_id, "Node {} cancelled while queued", node_id);
                self.record(node_id, NodeExecutionState::from_error(&e));
                return;
            }
        };
        let signal = self
            .dispatcher
            .signal_for(meta.operation_class, &self.cancel);
        let result = match signal
            .check()
            .and_then(|_| self.resolve_inputs(node_id, spec, meta))
        {
            Ok(inputs) => {
                let ctx = NodeContext {
                    node_id: node_id.to_string(),
                    node_type: spec.node_type.clone(),
                    inputs,
                    data: spec.data.clone(),
                    events: self.emitter(node_id),
                    cancellation: signal,
                    pending_inputs: self.pending_inputs.clone(),
                    sessions: self.sessions.clone(),
                };
                self.dispatcher.dispatch(spec, ctx).await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(output) => {
                let value = output.primary();
                if meta.terminal {
                    self.terminal.lock().push((node_id.to_string(), value.clone()));
                }
                self.context.write().insert(node_id.to_string(), output);
                tracing::debug!(run_id = %self.run_id, "Node {} succeeded", node_id);
                self.record(node_id, NodeExecutionState::Success { output: value });
            }
            Err(e) => {
                if e.is_cancellation() {
                    tracing::info!(run_id = %self.run_id, "Node {} cancelled", node_id);
                } else {
                    tracing::warn!(run_id = %self.run_id, "Node {} failed: {}", node_id, e);
                }
                self.record(node_id, NodeExecutionState::from_error(&e));
            }
        }
    }

    /// First required, connected port with no successful upstream, as
    /// `(source, port)`.
    fn failed_required_upstream(
        &self,
        node_id: &str,
        meta: &NodeMetadata,
    ) -> Option<(NodeId, String)> {
        let context = self.context.read();
        let mut unsatisfied: Vec<(&str, &str)> = Vec::new();
        let mut satisfied = HashSet::new();

        for &i in self.topology.incoming(node_id) {
            let edge = &self.graph.edges[i];
            let port = edge.target_port();
            if !meta.is_required(port) {
                continue;
            }
            if context.contains_key(&edge.source) {
                satisfied.insert(port);
            } else {
                unsatisfied.push((edge.source.as_str(), port));
            }
        }

        unsatisfied
            .into_iter()
            .find(|(_, port)| !satisfied.contains(port))
            .map(|(source, port)| (source.to_string(), port.to_string()))
    }

    fn resolve_inputs(
        &self,
        node_id: &str,
        spec: &NodeSpec,
        meta: &NodeMetadata,
    ) -> Result<HashMap<String, Value>, NodeError> {
        let mut collected: HashMap<String, Vec<Value>> = HashMap::new();
        {
            let context = self.context.read();
            for &i in self.topology.incoming(node_id) {
                let edge = &self.graph.edges[i];
                let value = context
                    .get(&edge.source)
                    .and_then(|output| read_port(output, edge.source_port()));
                if let Some(value) = value {
                    collected
                        .entry(edge.target_port().to_string())
                        .or_default()
                        .push(value);
                }
            }
        }

        // Several edges into one port arrive as an array in edge order.
        let mut inputs: HashMap<String, Value> = collected
            .into_iter()
            .map(|(port, mut values)| {
                let value = match values.len() {
                    1 => values.remove(0),
                    _ => Value::Array(values),
                };
                (port, value)
            })
            .collect();

        for port in &meta.inputs {
            if !inputs.contains_key(&port.name) {
                if let Some(value) = spec.data.get(&port.name) {
                    inputs.insert(port.name.clone(), value.clone());
                }
            }
        }

        if self.topology.in_degree(node_id) == 0 && !inputs.contains_key(DEFAULT_INPUT_PORT) {
            if let Some(initial) = &self.initial_input {
                inputs.insert(DEFAULT_INPUT_PORT.to_string(), initial.clone());
            }
        }

        for port in meta.inputs.iter().filter(|p| p.required) {
            if inputs.get(&port.name).map_or(true, Value::is_null) {
                return Err(NodeError::MissingInput(port.name.clone()));
            }
        }

        Ok(inputs)
    }
}

fn read_port(output: &NodeOutput, port: &str) -> Option<Value> {
    output
        .port(port)
        .cloned()
        .or_else(|| (port == DEFAULT_OUTPUT_PORT).then(|| output.primary()))
}
