use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;
use weavecore::{Edge, Graph, GraphError, NodeId};

/// Validated adjacency for one graph snapshot.
///
/// Edges are kept as indexes into `Graph::edges` so input resolution can
/// honour the editor's edge order.
#[derive(Debug, Clone)]
pub struct FlowGraph {
    order: Vec<NodeId>,
    incoming: HashMap<NodeId, Vec<usize>>,
    outgoing: HashMap<NodeId, Vec<usize>>,
    roots: Vec<NodeId>,
}

impl FlowGraph {
    /// Build the dependency graph, rejecting duplicates, dangling edges and cycles.
    pub fn build(graph: &Graph) -> Result<Self, GraphError> {
        let mut dag: DiGraph<NodeId, usize> = DiGraph::new();
        let mut node_to_index: HashMap<NodeId, NodeIndex> = HashMap::new();

        for node in &graph.nodes {
            if node_to_index.contains_key(&node.id) {
                return Err(GraphError::DuplicateNode(node.id.clone()));
            }
            let idx = dag.add_node(node.id.clone());
            node_to_index.insert(node.id.clone(), idx);
        }

        let mut incoming: HashMap<NodeId, Vec<usize>> = HashMap::new();
        let mut outgoing: HashMap<NodeId, Vec<usize>> = HashMap::new();

        for (position, edge) in graph.edges.iter().enumerate() {
            let from = Self::endpoint(&node_to_index, edge, &edge.source)?;
            let to = Self::endpoint(&node_to_index, edge, &edge.target)?;
            dag.add_edge(from, to, position);
            outgoing.entry(edge.source.clone()).or_default().push(position);
            incoming.entry(edge.target.clone()).or_default().push(position);
        }

        let sorted = toposort(&dag, None).map_err(|_| GraphError::CyclicDependency)?;
        let order: Vec<NodeId> = sorted.into_iter().map(|idx| dag[idx].clone()).collect();

        let roots = graph
            .nodes
            .iter()
            .filter(|n| !incoming.contains_key(&n.id))
            .map(|n| n.id.clone())
            .collect();

        Ok(Self {
            order,
            incoming,
            outgoing,
            roots,
        })
    }

    fn endpoint(
        node_to_index: &HashMap<NodeId, NodeIndex>,
        edge: &Edge,
        node_id: &str,
    ) -> Result<NodeIndex, GraphError> {
        node_to_index.get(node_id).copied().ok_or_else(|| {
            GraphError::InvalidConnection(format!(
                "edge {} references unknown node {}",
                edge.id, node_id
            ))
        })
    }

    /// Nodes in a valid execution order.
    pub fn order(&self) -> &[NodeId] {
        &self.order
    }

    /// Nodes with no incoming edges, in graph order.
    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    /// Indexes of edges ending at `node_id`.
    pub fn incoming(&self, node_id: &str) -> &[usize] {
        self.incoming.get(node_id).map_or(&[], Vec::as_slice)
    }

    /// Indexes of edges leaving `node_id`.
    pub fn outgoing(&self, node_id: &str) -> &[usize] {
        self.outgoing.get(node_id).map_or(&[], Vec::as_slice)
    }

    pub fn in_degree(&self, node_id: &str) -> usize {
        self.incoming(node_id).len()
    }
}
