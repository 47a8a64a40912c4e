use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use tokio::sync::broadcast;
use weavecore::{
    ErrorKind, ExecutionEvent, Graph, NodeExecutionState, NodeId, NodeStatus, RunId, Value,
};

/// What a UI shows for one node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeView {
    pub status: NodeStatus,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
}

impl Default for NodeView {
    fn default() -> Self {
        Self {
            status: NodeStatus::Pending,
            output: None,
            error: None,
            error_kind: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputLogEntry {
    pub node_id: NodeId,
    pub output: Value,
    /// Still receiving partial updates
    pub streaming: bool,
    pub updated_at: DateTime<Utc>,
}

/// Folds state transitions into per-node views and a bounded output log.
///
/// Only nodes marked as logged (terminal or preview) reach the log, one
/// entry per node; partial updates replace that entry in place.
#[derive(Debug, Clone)]
pub struct ExecutionProjector {
    views: HashMap<NodeId, NodeView>,
    logged: HashSet<NodeId>,
    log: VecDeque<OutputLogEntry>,
    capacity: usize,
}

impl ExecutionProjector {
    pub fn new(logged: impl IntoIterator<Item = NodeId>, capacity: usize) -> Self {
        Self {
            views: HashMap::new(),
            logged: logged.into_iter().collect(),
            log: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Log preview nodes and nodes whose type satisfies `is_terminal`.
    pub fn for_graph<F>(graph: &Graph, is_terminal: F, capacity: usize) -> Self
    where
        F: Fn(&str) -> bool,
    {
        let logged = graph
            .nodes
            .iter()
            .filter(|n| n.preview || is_terminal(&n.node_type))
            .map(|n| n.id.clone());
        Self::new(logged, capacity)
    }

    /// Apply one transition.
    pub fn apply(&mut self, node_id: &str, state: &NodeExecutionState) {
        let view = self.views.entry(node_id.to_string()).or_default();

        // A late pending/running event never overrides a settled node.
        let settled = matches!(
            view.status,
            NodeStatus::Success | NodeStatus::Error | NodeStatus::Skipped
        );
        if settled && !state.is_settled() {
            return;
        }

        match state {
            NodeExecutionState::Pending => *view = NodeView::default(),
            NodeExecutionState::Running { partial } => {
                view.status = NodeStatus::Running;
                view.error = None;
                view.error_kind = None;
                if let Some(partial) = partial {
                    view.output = Some(partial.clone());
                    self.upsert_log(node_id, partial.clone(), true);
                }
            }
            NodeExecutionState::Success { output } => {
                view.status = NodeStatus::Success;
                view.output = Some(output.clone());
                view.error = None;
                view.error_kind = None;
                self.upsert_log(node_id, output.clone(), false);
            }
            NodeExecutionState::Error { kind, message } => {
                view.status = NodeStatus::Error;
                view.error = Some(message.clone());
                view.error_kind = Some(*kind);
                self.end_stream(node_id);
            }
            NodeExecutionState::Skipped { .. } => {
                view.status = NodeStatus::Skipped;
                self.end_stream(node_id);
            }
        }
    }

    /// Apply a bus event; only state changes matter here.
    pub fn apply_event(&mut self, event: &ExecutionEvent) {
        if let ExecutionEvent::NodeStateChanged { node_id, state, .. } = event {
            self.apply(node_id, state);
        }
    }

    /// Consume bus events for `run_id` until it completes or the bus closes.
    pub async fn follow(
        &mut self,
        receiver: &mut broadcast::Receiver<ExecutionEvent>,
        run_id: RunId,
    ) {
        loop {
            match receiver.recv().await {
                Ok(event) if event.run_id() != run_id => continue,
                Ok(ExecutionEvent::RunCompleted { .. }) => break,
                Ok(event) => self.apply_event(&event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(%run_id, "Projector lagged; {} events dropped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    /// A node that settles without output keeps its last partial, no longer
    /// marked as streaming.
    fn end_stream(&mut self, node_id: &str) {
        if let Some(entry) = self
            .log
            .iter_mut()
            .find(|e| e.node_id == node_id && e.streaming)
        {
            entry.streaming = false;
            entry.updated_at = Utc::now();
        }
    }

    fn upsert_log(&mut self, node_id: &str, output: Value, streaming: bool) {
        if !self.logged.contains(node_id) {
            return;
        }
        let updated_at = Utc::now();
        if let Some(entry) = self.log.iter_mut().find(|e| e.node_id == node_id) {
            entry.output = output;
            entry.streaming = streaming;
            entry.updated_at = updated_at;
            return;
        }
        self.log.push_back(OutputLogEntry {
            node_id: node_id.to_string(),
            output,
            streaming,
            updated_at,
        });
        while self.log.len() > self.capacity {
            self.log.pop_front();
        }
    }

    pub fn view(&self, node_id: &str) -> Option<&NodeView> {
        self.views.get(node_id)
    }

    pub fn views(&self) -> &HashMap<NodeId, NodeView> {
        &self.views
    }

    /// Output log, oldest first.
    pub fn log(&self) -> impl Iterator<Item = &OutputLogEntry> {
        self.log.iter()
    }

    pub fn log_len(&self) -> usize {
        self.log.len()
    }

    /// Forget all views and log entries, e.g. before a re-run.
    pub fn reset(&mut self) {
        self.views.clear();
        self.log.clear();
    }
}
