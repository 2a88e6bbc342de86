use crate::error::{EngineError, EngineResult};
use crate::types::{Edge, EventKind, GatewayKind, Node, NodeKind};
use petgraph::algo::has_path_connecting;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone)]
pub struct ValidationError {
    pub rule: String,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.rule, self.message)
    }
}

fn violation(rule: &str, message: String) -> ValidationError {
    ValidationError {
        rule: rule.to_string(),
        message,
    }
}

/// Check structural invariants of a graph. Returns every violation found.
pub fn validate_graph(nodes: &[Node], edges: &[Edge]) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let mut by_id: HashMap<&str, &Node> = HashMap::new();

    // G1: node ids are unique
    for node in nodes {
        if by_id.insert(node.id.as_str(), node).is_some() {
            errors.push(violation("G1", format!("Duplicate node id: {}", node.id)));
        }
    }

    // G2: edge ids are unique
    let mut edge_ids = HashSet::new();
    for edge in edges {
        if !edge_ids.insert(edge.id.as_str()) {
            errors.push(violation("G2", format!("Duplicate edge id: {}", edge.id)));
        }
    }

    // G3: edge endpoints exist
    for edge in edges {
        for (end, id) in [("source", &edge.source), ("target", &edge.target)] {
            if !by_id.contains_key(id.as_str()) {
                errors.push(violation(
                    "G3",
                    format!("Edge {}: {} '{}' is not a node", edge.id, end, id),
                ));
            }
        }
    }

    // G4: owning sub-process references a SubProcess node
    for node in nodes {
        if let Some(owner) = &node.owner_sub_process {
            let valid = by_id
                .get(owner.as_str())
                .is_some_and(|n| matches!(n.kind, NodeKind::SubProcessEntry));
            if !valid {
                errors.push(violation(
                    "G4",
                    format!("Node {}: sub-process '{}' not found", node.id, owner),
                ));
            }
        }
    }

    // G5: event-based gateways lead only to catch events or receive tasks
    for node in nodes {
        if node.gateway_kind() != Some(GatewayKind::EventBased) {
            continue;
        }
        let arms: Vec<&Edge> = edges.iter().filter(|e| e.source == node.id).collect();
        if arms.is_empty() {
            errors.push(violation(
                "G5",
                format!("EventBasedGateway {} has no outgoing edges", node.id),
            ));
        }
        for arm in arms {
            if let Some(target) = by_id.get(arm.target.as_str()) {
                if !target.can_arm_race() {
                    errors.push(violation(
                        "G5",
                        format!(
                            "EventBasedGateway {}: target '{}' is not a timer, message or signal catch event",
                            node.id, target.id
                        ),
                    ));
                }
            }
        }
    }

    errors
}

/// Canonical form hashed into the graph fingerprint.
#[derive(Serialize)]
struct Canonical<'a> {
    id: &'a str,
    nodes: &'a [Node],
    edges: &'a [Edge],
}

/// A validated, immutable process definition.
#[derive(Debug, Clone)]
pub struct ProcessGraph {
    id: String,
    name: Option<String>,
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
    edges: Vec<Edge>,
    outgoing: HashMap<String, Vec<usize>>,
    incoming: HashMap<String, Vec<usize>>,
    topology: DiGraph<(), ()>,
    fingerprint: [u8; 32],
}

impl ProcessGraph {
    pub fn new(
        id: impl Into<String>,
        name: Option<String>,
        nodes: Vec<Node>,
        edges: Vec<Edge>,
    ) -> EngineResult<Self> {
        let id = id.into();
        let errors = validate_graph(&nodes, &edges);
        if !errors.is_empty() {
            let joined: Vec<String> = errors.iter().map(ToString::to_string).collect();
            return Err(EngineError::InvalidGraph(format!(
                "{}: {}",
                id,
                joined.join("; ")
            )));
        }

        let index: HashMap<String, usize> = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.clone(), i))
            .collect();

        let mut topology = DiGraph::with_capacity(nodes.len(), edges.len());
        for _ in &nodes {
            topology.add_node(());
        }

        let mut outgoing: HashMap<String, Vec<usize>> = HashMap::new();
        let mut incoming: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, edge) in edges.iter().enumerate() {
            outgoing.entry(edge.source.clone()).or_default().push(i);
            incoming.entry(edge.target.clone()).or_default().push(i);
            topology.add_edge(
                NodeIndex::new(index[&edge.source]),
                NodeIndex::new(index[&edge.target]),
                (),
            );
        }

        let fingerprint = {
            let canonical = serde_json::to_vec(&Canonical {
                id: &id,
                nodes: &nodes,
                edges: &edges,
            })
            .map_err(|e| EngineError::InvalidGraph(format!("{id}: {e}")))?;
            let mut hasher = Sha256::new();
            hasher.update(&canonical);
            hasher.finalize().into()
        };

        let graph = Self {
            id,
            name,
            nodes,
            index,
            edges,
            outgoing,
            incoming,
            topology,
            fingerprint,
        };
        graph.warn_ambiguous_defaults();
        Ok(graph)
    }

    fn warn_ambiguous_defaults(&self) {
        for node in &self.nodes {
            if !matches!(
                node.gateway_kind(),
                Some(GatewayKind::Exclusive | GatewayKind::Inclusive)
            ) {
                continue;
            }
            let unconditioned = self
                .outgoing(&node.id)
                .iter()
                .filter(|e| !e.is_conditioned())
                .count();
            if unconditioned > 1 {
                tracing::warn!(
                    definition_id = %self.id,
                    gateway_id = %node.id,
                    unconditioned,
                    "gateway has several unconditioned edges; the first is the default"
                );
            }
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn fingerprint(&self) -> [u8; 32] {
        self.fingerprint
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    pub(crate) fn require(&self, id: &str) -> EngineResult<&Node> {
        self.node(id).ok_or_else(|| {
            EngineError::InvalidGraph(format!("{}: node '{}' not found", self.id, id))
        })
    }

    /// Outgoing edges in declaration order.
    pub fn outgoing(&self, id: &str) -> Vec<&Edge> {
        self.edges_at(&self.outgoing, id)
    }

    /// Incoming edges in declaration order.
    pub fn incoming(&self, id: &str) -> Vec<&Edge> {
        self.edges_at(&self.incoming, id)
    }

    fn edges_at(&self, map: &HashMap<String, Vec<usize>>, id: &str) -> Vec<&Edge> {
        map.get(id)
            .map(|ix| ix.iter().map(|&i| &self.edges[i]).collect())
            .unwrap_or_default()
    }

    /// Node where a new instance places its first token.
    ///
    /// The first top-level start event wins. Otherwise the first top-level node
    /// without incoming edges is used: a task as is, anything else through its
    /// first outgoing edge. The last resort is the first task.
    pub fn start_node(&self) -> Option<&Node> {
        let top_level = || self.nodes.iter().filter(|n| n.owner_sub_process.is_none());

        if let Some(start) = top_level().find(|n| n.event_kind() == Some(EventKind::Start)) {
            return Some(start);
        }

        if let Some(root) = top_level().find(|n| !self.incoming.contains_key(&n.id)) {
            if root.is_task() {
                return Some(root);
            }
            if let Some(first) = self.outgoing(&root.id).first() {
                return self.node(&first.target);
            }
        }

        self.nodes.iter().find(|n| n.is_task())
    }

    /// Start event nested inside the given sub-process, if any.
    pub fn sub_process_start(&self, entry_id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| {
            n.owner_sub_process.as_deref() == Some(entry_id)
                && n.event_kind() == Some(EventKind::Start)
        })
    }

    /// Whether some path leads from `from` to `to` (a node reaches itself).
    pub fn can_reach(&self, from: &str, to: &str) -> bool {
        match (self.index.get(from), self.index.get(to)) {
            (Some(&a), Some(&b)) => has_path_connecting(
                &self.topology,
                NodeIndex::new(a),
                NodeIndex::new(b),
                None,
            ),
            _ => false,
        }
    }

    /// Parallel and inclusive gateways with more than one incoming edge synchronize.
    pub fn is_join(&self, node: &Node) -> bool {
        matches!(
            node.gateway_kind(),
            Some(GatewayKind::Parallel | GatewayKind::Inclusive)
        ) && self.incoming.get(&node.id).is_some_and(|ix| ix.len() > 1)
    }

    /// Whether `node_id` lies inside the sub-process `entry_id`, at any depth.
    pub fn is_inside(&self, node_id: &str, entry_id: &str) -> bool {
        let mut current = self.node(node_id).and_then(|n| n.owner_sub_process.as_deref());
        let mut depth = 0;
        while let Some(owner) = current {
            if owner == entry_id {
                return true;
            }
            depth += 1;
            if depth > self.nodes.len() {
                return false;
            }
            current = self.node(owner).and_then(|n| n.owner_sub_process.as_deref());
        }
        false
    }
}
