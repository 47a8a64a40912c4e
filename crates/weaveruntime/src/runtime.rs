use crate::dispatch::NodeDispatcher;
use crate::executor::{FlowExecutor, FlowResult, RunOptions};
use crate::projector::ExecutionProjector;
use crate::registry::NodeRegistry;
use crate::sandbox::SandboxConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use weavecore::{
    CancellationToken, EventBus, ExecutionEvent, FlowError, Graph, GraphError, GraphId,
    GraphSnapshot, GraphStore, NodeExecutionState, NodeId, PendingInputRegistry, RunId,
    SessionTracker, StateObserver, TimeoutPolicy, Value,
};

/// Main runtime for executing graphs
pub struct FlowRuntime {
    registry: Arc<NodeRegistry>,
    executor: Arc<FlowExecutor>,
    event_bus: EventBus,
    config: RuntimeConfig,
    graphs: Arc<RwLock<HashMap<GraphId, GraphStore>>>,
    runs: Arc<RwLock<HashMap<RunId, RunHandle>>>,
    run_seq: AtomicU64,
}

impl FlowRuntime {
    /// Create a new runtime with default settings and no node types
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        Self::with_registry(Arc::new(NodeRegistry::new()), config)
    }

    /// Create a new runtime with a pre-configured registry
    pub fn with_registry(registry: Arc<NodeRegistry>, config: RuntimeConfig) -> Self {
        let event_bus = EventBus::new(config.event_buffer_size);
        let dispatcher = Arc::new(NodeDispatcher::new(
            registry.clone(),
            config.timeouts.clone(),
            config.max_parallel_nodes,
        ));
        let executor = Arc::new(FlowExecutor::new(dispatcher, event_bus.clone()));

        Self {
            registry,
            executor,
            event_bus,
            config,
            graphs: Arc::new(RwLock::new(HashMap::new())),
            runs: Arc::new(RwLock::new(HashMap::new())),
            run_seq: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn executor(&self) -> &Arc<FlowExecutor> {
        &self.executor
    }

    /// Store a graph for editing and later runs
    pub async fn register_graph(&self, graph: Graph) -> GraphStore {
        let id = graph.id;
        let store = GraphStore::new(graph);
        self.graphs.write().await.insert(id, store.clone());
        store
    }

    pub async fn graph(&self, id: GraphId) -> Option<GraphStore> {
        self.graphs.read().await.get(&id).cloned()
    }

    pub async fn list_graphs(&self) -> Vec<GraphSnapshot> {
        self.graphs
            .read()
            .await
            .values()
            .map(GraphStore::snapshot)
            .collect()
    }

    pub async fn remove_graph(&self, id: GraphId) -> bool {
        self.graphs.write().await.remove(&id).is_some()
    }

    /// Execute a graph directly and wait for the result
    pub async fn execute(
        &self,
        graph: &Graph,
        initial_input: Option<Value>,
    ) -> Result<FlowResult, FlowError> {
        let mut options = RunOptions::new();
        options.initial_input = initial_input;
        self.executor
            .execute_flow(Arc::new(graph.clone()), options)
            .await
    }

    /// Start a run of a stored graph's current snapshot in the background
    pub async fn run_graph(
        &self,
        graph_id: GraphId,
        initial_input: Option<Value>,
    ) -> Result<RunHandle, FlowError> {
        let store = self
            .graph(graph_id)
            .await
            .ok_or_else(|| GraphError::NotFound(graph_id.to_string()))?;
        self.start_run(store.snapshot(), initial_input).await
    }

    /// Validate and start a run in the background.
    ///
    /// The run reads `snapshot` only; later edits to the store do not
    /// affect it.
    pub async fn start_run(
        &self,
        snapshot: GraphSnapshot,
        initial_input: Option<Value>,
    ) -> Result<RunHandle, FlowError> {
        let prepared = self.executor.prepare(snapshot.graph.clone())?;

        let projector = Arc::new(parking_lot::Mutex::new(self.projector_for(&snapshot.graph)));
        let observer: StateObserver = {
            let projector = projector.clone();
            Arc::new(move |node_id: &NodeId, state: &NodeExecutionState| {
                projector.lock().apply(node_id, state)
            })
        };

        let mut options = RunOptions::new().with_observer(observer);
        options.initial_input = initial_input;

        let (done_tx, done_rx) = watch::channel(None);
        let handle = RunHandle {
            run_id: options.run_id,
            seq: self.run_seq.fetch_add(1, Ordering::Relaxed),
            graph_id: snapshot.graph.id,
            graph_version: snapshot.version,
            cancel: options.cancel.clone(),
            pending_inputs: options.pending_inputs.clone(),
            sessions: options.sessions.clone(),
            projector,
            result: done_rx,
        };
        {
            let mut runs = self.runs.write().await;
            evict_finished(&mut runs, self.config.max_retained_runs);
            runs.insert(handle.run_id, handle.clone());
        }

        let executor = self.executor.clone();
        tokio::spawn(async move {
            let result = executor.run_prepared(prepared, options).await;
            let _ = done_tx.send(Some(Arc::new(result)));
        });

        Ok(handle)
    }

    pub async fn run(&self, run_id: RunId) -> Option<RunHandle> {
        self.runs.read().await.get(&run_id).cloned()
    }

    /// Known runs, oldest first.
    pub async fn list_runs(&self) -> Vec<RunHandle> {
        let mut runs: Vec<_> = self.runs.read().await.values().cloned().collect();
        runs.sort_by_key(|r| r.seq);
        runs
    }

    /// Forget a finished run; false if unknown or still running.
    pub async fn remove_run(&self, run_id: RunId) -> bool {
        let mut runs = self.runs.write().await;
        match runs.get(&run_id) {
            Some(handle) if handle.is_finished() => runs.remove(&run_id).is_some(),
            _ => false,
        }
    }

    /// Projector logging terminal and preview nodes of `graph`.
    pub fn projector_for(&self, graph: &Graph) -> ExecutionProjector {
        ExecutionProjector::for_graph(
            graph,
            |node_type| {
                self.registry
                    .get_metadata(node_type)
                    .map_or(false, |m| m.terminal)
            },
            self.config.output_log_capacity,
        )
    }

    /// Subscribe to execution events
    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<ExecutionEvent> {
        self.event_bus.subscribe()
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }
}

/// Drop the oldest finished runs until at most `keep` remain. Runs still in
/// flight are never dropped.
fn evict_finished(runs: &mut HashMap<RunId, RunHandle>, keep: usize) {
    let mut finished: Vec<(u64, RunId)> = runs
        .values()
        .filter(|r| r.is_finished())
        .map(|r| (r.seq, r.run_id))
        .collect();
    if finished.len() <= keep {
        return;
    }
    finished.sort_unstable();
    let excess = finished.len() - keep;
    for (_, run_id) in finished.into_iter().take(excess) {
        runs.remove(&run_id);
        tracing::debug!(%run_id, "Evicted finished run");
    }
}

impl Default for FlowRuntime {
    fn default() -> Self {
        Self::new()
    }
}

/// Control surface for a background run
#[derive(Clone)]
pub struct RunHandle {
    run_id: RunId,
    /// Start order within the runtime
    seq: u64,
    graph_id: GraphId,
    graph_version: u64,
    cancel: CancellationToken,
    pending_inputs: PendingInputRegistry,
    sessions: SessionTracker,
    projector: Arc<parking_lot::Mutex<ExecutionProjector>>,
    result: watch::Receiver<Option<Arc<FlowResult>>>,
}

impl RunHandle {
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn graph_id(&self) -> GraphId {
        self.graph_id
    }

    /// Version of the graph snapshot this run executes.
    pub fn graph_version(&self) -> u64 {
        self.graph_version
    }

    /// Stop the run: trips the token, releases waiters, closes sessions.
    pub fn cancel(&self) {
        self.cancel.cancel();
        self.pending_inputs.clear();
        self.sessions.shutdown();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Deliver data to a node waiting for input; false if it isn't waiting.
    pub fn provide_input(&self, node_id: &str, value: Value) -> bool {
        self.pending_inputs.resolve_input(node_id, value)
    }

    pub fn waiting_nodes(&self) -> Vec<NodeId> {
        self.pending_inputs.waiting_nodes()
    }

    pub fn pending_inputs(&self) -> &PendingInputRegistry {
        &self.pending_inputs
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.active()
    }

    /// Snapshot of the run's projected views and output log.
    pub fn projector(&self) -> ExecutionProjector {
        self.projector.lock().clone()
    }

    pub fn result(&self) -> Option<Arc<FlowResult>> {
        self.result.borrow().clone()
    }

    pub fn is_finished(&self) -> bool {
        self.result.borrow().is_some()
    }

    /// Wait for the run to finish.
    pub async fn wait(&self) -> Option<Arc<FlowResult>> {
        let mut rx = self.result.clone();
        loop {
            let current = rx.borrow_and_update().clone();
            if current.is_some() {
                return current;
            }
            if rx.changed().await.is_err() {
                return rx.borrow().clone();
            }
        }
    }
}

/// Configuration for the runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Handlers allowed to run at once; interactive nodes are exempt
    pub max_parallel_nodes: usize,
    pub event_buffer_size: usize,
    /// Entries kept in a run's output log
    pub output_log_capacity: usize,
    /// Finished runs kept for inspection; older ones are evicted when a new
    /// run starts
    pub max_retained_runs: usize,
    pub timeouts: TimeoutPolicy,
    pub sandbox: SandboxConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_parallel_nodes: 16,
            event_buffer_size: 1000,
            output_log_capacity: 200,
            max_retained_runs: 100,
            timeouts: TimeoutPolicy::default(),
            sandbox: SandboxConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Load from a JSON file; missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, FlowError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}
