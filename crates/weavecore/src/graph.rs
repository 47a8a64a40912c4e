use crate::{DataKind, Value};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

pub type GraphId = Uuid;
pub type NodeId = String;
pub type EdgeId = String;

/// Default output port read by edges without a source handle.
pub const DEFAULT_OUTPUT_PORT: &str = "output";
/// Default input port fed by edges without a target handle.
pub const DEFAULT_INPUT_PORT: &str = "input";

/// Node/edge snapshot as supplied by the graph editor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Graph {
    #[serde(default = "Uuid::new_v4")]
    pub id: GraphId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl Graph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: None,
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }

    pub fn add_node(&mut self, node: NodeSpec) -> NodeId {
        let id = node.id.clone();
        self.nodes.push(node);
        id
    }

    pub fn connect(&mut self, edge: Edge) -> EdgeId {
        let id = edge.id.clone();
        self.edges.push(edge);
        id
    }

    /// Connect default ports, taking a fresh edge id from `ids`.
    pub fn link(&mut self, ids: &IdGenerator, source: &str, target: &str) -> EdgeId {
        self.connect(Edge::new(ids.next_edge_id(), source, target))
    }
}

/// Node in a graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: NodeId,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Inline, type-specific data; doubles as fallback for unconnected ports.
    #[serde(default)]
    pub data: HashMap<String, Value>,
    /// Show this node's output in the output log even if it is not terminal.
    #[serde(default)]
    pub preview: bool,
}

impl NodeSpec {
    pub fn new(id: impl Into<NodeId>, node_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            name: None,
            data: HashMap::new(),
            preview: false,
        }
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_preview(mut self) -> Self {
        self.preview = true;
        self
    }
}

/// Directed, optionally ported data dependency
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub id: EdgeId,
    pub source: NodeId,
    #[serde(default)]
    pub source_handle: Option<String>,
    pub target: NodeId,
    #[serde(default)]
    pub target_handle: Option<String>,
    #[serde(default)]
    pub kind: DataKind,
}

impl Edge {
    pub fn new(id: impl Into<EdgeId>, source: impl Into<NodeId>, target: impl Into<NodeId>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            source_handle: None,
            target: target.into(),
            target_handle: None,
            kind: DataKind::Any,
        }
    }

    pub fn from_port(mut self, port: impl Into<String>) -> Self {
        self.source_handle = Some(port.into());
        self
    }

    pub fn to_port(mut self, port: impl Into<String>) -> Self {
        self.target_handle = Some(port.into());
        self
    }

    pub fn with_kind(mut self, kind: DataKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn source_port(&self) -> &str {
        self.source_handle.as_deref().unwrap_or(DEFAULT_OUTPUT_PORT)
    }

    pub fn target_port(&self) -> &str {
        self.target_handle.as_deref().unwrap_or(DEFAULT_INPUT_PORT)
    }
}

/// Fresh node and edge ids for one editing session.
///
/// Owned by whoever creates nodes; pass it explicitly rather than sharing a
/// global counter.
#[derive(Debug, Default)]
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Continue numbering after ids already present in `graph`.
    pub fn continuing(graph: &Graph) -> Self {
        let highest = graph
            .nodes
            .iter()
            .map(|n| n.id.as_str())
            .chain(graph.edges.iter().map(|e| e.id.as_str()))
            .filter_map(|id| id.rsplit('-').next()?.parse::<u64>().ok())
            .max()
            .map_or(0, |n| n + 1);
        Self {
            next: AtomicU64::new(highest),
        }
    }

    pub fn next_id(&self, prefix: &str) -> String {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", prefix, n)
    }

    pub fn next_node_id(&self, node_type: &str) -> NodeId {
        let prefix = node_type.replace('.', "_");
        self.next_id(&prefix)
    }

    pub fn next_edge_id(&self) -> EdgeId {
        self.next_id("edge")
    }

    /// A node spec of `node_type` with a fresh id.
    pub fn node(&self, node_type: &str) -> NodeSpec {
        NodeSpec::new(self.next_node_id(node_type), node_type)
    }
}

/// Point-in-time copy of a [`GraphStore`].
#[derive(Debug, Clone)]
pub struct GraphSnapshot {
    pub version: u64,
    pub graph: Arc<Graph>,
}

/// Shared graph mutated by editors while runs read consistent snapshots.
#[derive(Debug, Clone)]
pub struct GraphStore {
    inner: Arc<RwLock<StoreInner>>,
}

#[derive(Debug)]
struct StoreInner {
    version: u64,
    graph: Arc<Graph>,
}

impl GraphStore {
    pub fn new(graph: Graph) -> Self {
        Self {
            inner: Arc::new(RwLock::new(StoreInner {
                version: 0,
                graph: Arc::new(graph),
            })),
        }
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        let inner = self.inner.read();
        GraphSnapshot {
            version: inner.version,
            graph: inner.graph.clone(),
        }
    }

    pub fn version(&self) -> u64 {
        self.inner.read().version
    }

    /// Apply a mutation; readers holding earlier snapshots are unaffected.
    pub fn update<F>(&self, mutate: F) -> u64
    where
        F: FnOnce(&mut Graph),
    {
        let mut inner = self.inner.write();
        let mut graph = (*inner.graph).clone();
        mutate(&mut graph);
        inner.graph = Arc::new(graph);
        inner.version += 1;
        inner.version
    }

    pub fn replace(&self, graph: Graph) -> u64 {
        self.update(move |g| *g = graph)
    }
}
