//! Validated workflow graphs and per-session graph state

use crate::definition::{Edge, Node, NodeKind, WorkflowDefinition};
use crate::error::{Result, WorkflowError};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Position of one session within one agent's workflow.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphState {
    pub current_node_id: String,
    /// Visited node ids in order, including the current node.
    pub history: Vec<String>,
}

/// An immutable, validated workflow. Shared read-only across sessions.
#[derive(Debug)]
pub struct Workflow {
    agent_id: String,
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
    outgoing: HashMap<String, Vec<Edge>>,
    entry: usize,
    edge_count: usize,
}

impl Workflow {
    /// Validate a definition. Fails on the first structural problem found.
    pub fn load(def: WorkflowDefinition) -> Result<Self> {
        if def.agent_id.trim().is_empty() {
            return Err(WorkflowError::invalid("agent_id is empty"));
        }
        if def.nodes.is_empty() {
            return Err(WorkflowError::invalid(format!(
                "workflow for {} has no nodes",
                def.agent_id
            )));
        }

        let mut index = HashMap::with_capacity(def.nodes.len());
        for (i, node) in def.nodes.iter().enumerate() {
            if index.insert(node.id.clone(), i).is_some() {
                return Err(WorkflowError::invalid(format!("duplicate node id: {}", node.id)));
            }
        }

        let mut outgoing: HashMap<String, Vec<Edge>> = HashMap::new();
        let mut has_incoming: HashSet<&str> = HashSet::new();
        for edge in &def.edges {
            for end in [&edge.from, &edge.to] {
                if !index.contains_key(end) {
                    return Err(WorkflowError::invalid(format!(
                        "edge {} -> {} references unknown node {}",
                        edge.from, edge.to, end
                    )));
                }
            }
            has_incoming.insert(edge.to.as_str());
            outgoing.entry(edge.from.clone()).or_default().push(edge.clone());
        }

        let roots: Vec<usize> = def
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| !has_incoming.contains(n.id.as_str()))
            .map(|(i, _)| i)
            .collect();
        let entry = match roots.as_slice() {
            [only] => *only,
            [] => return Err(WorkflowError::invalid("no entry node (every node has an incoming edge)")),
            many => {
                let ids: Vec<&str> = many.iter().map(|i| def.nodes[*i].id.as_str()).collect();
                return Err(WorkflowError::invalid(format!(
                    "multiple entry nodes: {}",
                    ids.join(", ")
                )));
            }
        };

        for node in &def.nodes {
            let edges = outgoing.get(&node.id).map(Vec::as_slice).unwrap_or(&[]);
            if edges.iter().filter(|e| e.default).count() > 1 {
                return Err(WorkflowError::invalid(format!(
                    "node {} declares more than one default edge",
                    node.id
                )));
            }
            match node.kind {
                NodeKind::Decision if edges.is_empty() => {
                    return Err(WorkflowError::invalid(format!(
                        "decision node {} has no outgoing edges",
                        node.id
                    )));
                }
                NodeKind::Terminal if !edges.is_empty() => {
                    return Err(WorkflowError::invalid(format!(
                        "terminal node {} has outgoing edges",
                        node.id
                    )));
                }
                _ => {}
            }
        }

        let edge_count = def.edges.len();
        Ok(Self {
            agent_id: def.agent_id,
            nodes: def.nodes,
            index,
            outgoing,
            entry,
            edge_count,
        })
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn entry(&self) -> &Node {
        &self.nodes[self.entry]
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.index.get(id).map(|i| &self.nodes[*i])
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn edge_count(&self) -> usize {
        self.edge_count
    }

    pub fn start(&self) -> GraphState {
        let entry = self.entry().id.clone();
        GraphState {
            current_node_id: entry.clone(),
            history: vec![entry],
        }
    }

    /// Move to `target` if a declared edge leads there from the current node.
    pub fn transition(&self, state: &GraphState, target: &str) -> Result<GraphState> {
        let allowed = self
            .outgoing_edges(&state.current_node_id)
            .iter()
            .any(|e| e.to == target);
        if !allowed {
            return Err(WorkflowError::InvalidTransition {
                from: state.current_node_id.clone(),
                to: target.to_string(),
            });
        }
        let mut next = state.clone();
        next.current_node_id = target.to_string();
        next.history.push(target.to_string());
        Ok(next)
    }

    pub fn next_nodes(&self, state: &GraphState) -> Vec<&Node> {
        let mut seen = HashSet::new();
        self.outgoing_edges(&state.current_node_id)
            .iter()
            .filter(|e| seen.insert(e.to.as_str()))
            .filter_map(|e| self.node(&e.to))
            .collect()
    }

    pub fn is_decision_node(&self, state: &GraphState) -> bool {
        self.kind_of(state) == Some(NodeKind::Decision)
    }

    pub fn is_terminal(&self, state: &GraphState) -> bool {
        self.kind_of(state) == Some(NodeKind::Terminal)
    }

    pub fn outgoing_edges(&self, node_id: &str) -> &[Edge] {
        self.outgoing.get(node_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn default_edge(&self, node_id: &str) -> Option<&Edge> {
        self.outgoing_edges(node_id).iter().find(|e| e.default)
    }

    fn kind_of(&self, state: &GraphState) -> Option<NodeKind> {
        self.node(&state.current_node_id).map(|n| n.kind)
    }
}
