//! Records for live graph replacement: deltas, probation verdicts and audit entries.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, WaypointError};
use crate::graph::{EdgeSpec, GraphSpec, NodeSpec};

/// Per-node configuration change carried by a delta.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfigUpdate {
    pub node_id: String,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub max_node_visits: Option<u32>,
    #[serde(default)]
    pub pause_for_hitl: Option<bool>,
}

/// A proposed structural mutation. Never applied to the live graph directly;
/// `apply_to` only builds a candidate that must pass probation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphDelta {
    #[serde(default)]
    pub add_nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub remove_nodes: Vec<String>,
    #[serde(default)]
    pub add_edges: Vec<EdgeSpec>,
    #[serde(default)]
    pub remove_edges: Vec<String>,
    #[serde(default)]
    pub config_updates: Vec<NodeConfigUpdate>,
    #[serde(default)]
    pub entry_node: Option<String>,
    #[serde(default)]
    pub terminal_nodes: Option<Vec<String>>,
}

impl GraphDelta {
    pub fn is_empty(&self) -> bool {
        self.add_nodes.is_empty()
            && self.remove_nodes.is_empty()
            && self.add_edges.is_empty()
            && self.remove_edges.is_empty()
            && self.config_updates.is_empty()
            && self.entry_node.is_none()
            && self.terminal_nodes.is_none()
    }

    /// Build a candidate graph with the next version number.
    ///
    /// Edges incident to removed nodes are dropped with them. Referencing an
    /// unknown node or edge id is an error; structural validity of the result
    /// is left to probation.
    pub fn apply_to(&self, base: &GraphSpec) -> Result<GraphSpec> {
        let mut graph = base.clone();

        let removed: HashSet<&str> = self.remove_nodes.iter().map(String::as_str).collect();
        for id in &removed {
            if graph.get_node(id).is_none() {
                return Err(WaypointError::InvalidDelta(format!("unknown node '{}'", id)));
            }
        }
        graph.nodes.retain(|n| !removed.contains(n.id.as_str()));
        graph
            .edges
            .retain(|e| !removed.contains(e.source.as_str()) && !removed.contains(e.target.as_str()));
        graph.terminal_nodes.retain(|t| !removed.contains(t.as_str()));

        for edge_id in &self.remove_edges {
            let before = graph.edges.len();
            graph.edges.retain(|e| &e.id != edge_id);
            if graph.edges.len() == before && !base.edges.iter().any(|e| &e.id == edge_id) {
                return Err(WaypointError::InvalidDelta(format!("unknown edge '{}'", edge_id)));
            }
        }

        graph.nodes.extend(self.add_nodes.iter().cloned());
        graph.edges.extend(self.add_edges.iter().cloned());

        let updates: HashMap<&str, &NodeConfigUpdate> = self
            .config_updates
            .iter()
            .map(|u| (u.node_id.as_str(), u))
            .collect();
        for (id, update) in &updates {
            let node = graph
                .nodes
                .iter_mut()
                .find(|n| n.id == *id)
                .ok_or_else(|| WaypointError::InvalidDelta(format!("unknown node '{}'", id)))?;
            if let Some(r) = update.max_retries {
                node.max_retries = r;
            }
            if let Some(v) = update.max_node_visits {
                node.max_node_visits = v;
            }
            if let Some(h) = update.pause_for_hitl {
                node.pause_for_hitl = h;
            }
        }

        if let Some(entry) = &self.entry_node {
            graph.entry_node = entry.clone();
        }
        if let Some(terminals) = &self.terminal_nodes {
            graph.terminal_nodes = terminals.clone();
        }

        graph.version = base.version + 1;
        Ok(graph)
    }
}

/// Verdict of a probation run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationResult {
    pub passed: bool,
    #[serde(default)]
    pub violations: Vec<String>,
    #[serde(default)]
    pub metrics: HashMap<String, f64>,
}

impl ValidationResult {
    pub fn from_violations(violations: Vec<String>, metrics: HashMap<String, f64>) -> Self {
        Self {
            passed: violations.is_empty(),
            violations,
            metrics,
        }
    }

    pub fn rejected(violation: impl Into<String>) -> Self {
        Self::from_violations(vec![violation.into()], HashMap::new())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvolutionDecision {
    Applied,
    Rejected,
}

/// The single audit record written for every `update_graph` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub correlation_id: String,
    pub snapshot_id: String,
    pub decision: EvolutionDecision,
    #[serde(default)]
    pub violations: Vec<String>,
    pub graph_id: String,
    pub from_version: u32,
    pub candidate_version: u32,
    #[serde(default)]
    pub metrics: HashMap<String, f64>,
    pub timestamp: DateTime<Utc>,
}
