//! Declarative workflow graph: nodes, edges and their structural invariants.
//!
//! A `GraphSpec` is immutable data. The executor walks it, the evolution guard
//! replaces it as a whole unit, and nothing mutates it in place.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::condition::Condition;
use crate::error::{Result, WaypointError};

/// A unit of work in the graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Unique within a graph.
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Dispatch tag for the node registry (e.g. "llm_generate", "tool_use").
    pub node_type: String,
    #[serde(default)]
    pub input_keys: Vec<String>,
    #[serde(default)]
    pub output_keys: Vec<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Cumulative visits allowed across the run (loop guard).
    #[serde(default = "default_max_node_visits")]
    pub max_node_visits: u32,
    #[serde(default)]
    pub pause_for_hitl: bool,
    #[serde(default)]
    pub output_schema: Option<serde_json::Value>,
}

fn default_max_retries() -> u32 {
    3
}

fn default_max_node_visits() -> u32 {
    1
}

impl NodeSpec {
    pub fn new(id: impl Into<String>, node_type: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            description: String::new(),
            node_type: node_type.into(),
            input_keys: vec![],
            output_keys: vec![],
            max_retries: default_max_retries(),
            max_node_visits: default_max_node_visits(),
            pause_for_hitl: false,
            output_schema: None,
        }
    }

    pub fn with_inputs(mut self, keys: &[&str]) -> Self {
        self.input_keys = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn with_outputs(mut self, keys: &[&str]) -> Self {
        self.output_keys = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_max_visits(mut self, visits: u32) -> Self {
        self.max_node_visits = visits;
        self
    }

    pub fn with_hitl(mut self) -> Self {
        self.pause_for_hitl = true;
        self
    }

    pub fn with_output_schema(mut self, schema: serde_json::Value) -> Self {
        self.output_schema = Some(schema);
        self
    }
}

/// When an edge may be traversed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeCondition {
    /// Holds after any successful node.
    #[default]
    Always,
    OnSuccess,
    /// Only considered once the source node has exhausted its retries.
    OnFailure,
    /// Holds when `condition_expr` evaluates truthy.
    Conditional,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeSpec {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub condition: EdgeCondition,
    #[serde(default)]
    pub condition_expr: Option<String>,
}

impl EdgeSpec {
    fn build(source: &str, target: &str, condition: EdgeCondition, expr: Option<String>) -> Self {
        Self {
            id: format!("{}->{}", source, target),
            source: source.to_string(),
            target: target.to_string(),
            condition,
            condition_expr: expr,
        }
    }

    pub fn always(source: &str, target: &str) -> Self {
        Self::build(source, target, EdgeCondition::Always, None)
    }

    pub fn on_success(source: &str, target: &str) -> Self {
        Self::build(source, target, EdgeCondition::OnSuccess, None)
    }

    pub fn on_failure(source: &str, target: &str) -> Self {
        Self::build(source, target, EdgeCondition::OnFailure, None)
    }

    pub fn conditional(source: &str, target: &str, expr: impl Into<String>) -> Self {
        Self::build(source, target, EdgeCondition::Conditional, Some(expr.into()))
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

/// The complete workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphSpec {
    pub id: String,
    pub goal_id: String,
    #[serde(default = "default_version")]
    pub version: u32,
    pub entry_node: String,
    #[serde(default)]
    pub terminal_nodes: Vec<String>,
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub edges: Vec<EdgeSpec>,
    /// Overrides the executor's step cap for this graph.
    #[serde(default)]
    pub max_steps: Option<usize>,
}

fn default_version() -> u32 {
    1
}

impl GraphSpec {
    pub fn new(id: impl Into<String>, goal_id: impl Into<String>, entry: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            goal_id: goal_id.into(),
            version: default_version(),
            entry_node: entry.into(),
            terminal_nodes: vec![],
            nodes: vec![],
            edges: vec![],
            max_steps: None,
        }
    }

    pub fn node(mut self, node: NodeSpec) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn edge(mut self, edge: EdgeSpec) -> Self {
        self.edges.push(edge);
        self
    }

    pub fn terminal(mut self, node_id: &str) -> Self {
        self.terminal_nodes.push(node_id.to_string());
        self
    }

    pub fn get_node(&self, id: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Outgoing edges of `node_id` in declaration order.
    pub fn outgoing(&self, node_id: &str) -> impl Iterator<Item = &EdgeSpec> {
        let node_id = node_id.to_string();
        self.edges.iter().filter(move |e| e.source == node_id)
    }

    pub fn is_terminal(&self, node_id: &str) -> bool {
        self.terminal_nodes.iter().any(|t| t == node_id)
    }

    /// Every structural violation, in a stable order. Empty means valid.
    pub fn validate(&self) -> Vec<String> {
        let mut violations = Vec::new();
        let mut ids = HashSet::new();

        for node in &self.nodes {
            if !ids.insert(node.id.as_str()) {
                violations.push(format!("duplicate node id '{}'", node.id));
            }
            if node.max_node_visits == 0 {
                violations.push(format!("node '{}' has max_node_visits = 0", node.id));
            }
        }

        if !ids.contains(self.entry_node.as_str()) {
            violations.push(format!("entry node '{}' is not declared", self.entry_node));
        }

        for terminal in &self.terminal_nodes {
            if !ids.contains(terminal.as_str()) {
                violations.push(format!("terminal node '{}' is not declared", terminal));
            }
        }

        for edge in &self.edges {
            if !ids.contains(edge.source.as_str()) {
                violations.push(format!(
                    "edge '{}' source '{}' is not declared",
                    edge.id, edge.source
                ));
            }
            if !ids.contains(edge.target.as_str()) {
                violations.push(format!(
                    "edge '{}' target '{}' is not declared",
                    edge.id, edge.target
                ));
            }
            if edge.condition == EdgeCondition::Conditional {
                match edge.condition_expr.as_deref() {
                    None | Some("") => violations.push(format!(
                        "conditional edge '{}' has no condition_expr",
                        edge.id
                    )),
                    Some(expr) => {
                        if let Err(e) = Condition::parse(expr) {
                            violations.push(format!("edge '{}': {}", edge.id, e));
                        }
                    }
                }
            }
        }

        violations
    }

    pub fn ensure_valid(&self) -> Result<()> {
        let violations = self.validate();
        if violations.is_empty() {
            Ok(())
        } else {
            Err(WaypointError::GraphStructure(violations.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear() -> GraphSpec {
        GraphSpec::new("g", "goal", "a")
            .node(NodeSpec::new("a", "step"))
            .node(NodeSpec::new("b", "step"))
            .edge(EdgeSpec::on_success("a", "b"))
            .terminal("b")
    }

    #[test]
    fn valid_graph_has_no_violations() {
        assert!(linear().validate().is_empty());
        assert!(linear().ensure_valid().is_ok());
    }

    #[test]
    fn missing_entry_node() {
        let mut g = linear();
        g.entry_node = "nope".into();
        let v = g.validate();
        assert_eq!(v.len(), 1);
        assert!(v[0].contains("entry node 'nope'"));
    }

    #[test]
    fn dangling_edges_are_reported() {
        let g = linear().edge(EdgeSpec::always("b", "ghost")).edge(EdgeSpec::always("phantom", "a"));
        let v = g.validate();
        assert_eq!(v.len(), 2);
        assert!(v.iter().any(|m| m.contains("target 'ghost'")));
        assert!(v.iter().any(|m| m.contains("source 'phantom'")));
        assert!(matches!(
            g.ensure_valid(),
            Err(WaypointError::GraphStructure(_))
        ));
    }

    #[test]
    fn duplicate_ids_and_zero_visits() {
        let g = linear().node(NodeSpec::new("a", "step").with_max_visits(0));
        let v = g.validate();
        assert!(v.iter().any(|m| m.contains("duplicate node id 'a'")));
        assert!(v.iter().any(|m| m.contains("max_node_visits = 0")));
    }

    #[test]
    fn conditional_edges_must_parse() {
        let g = linear()
            .edge(EdgeSpec::conditional("b", "a", "score >"))
            .edge(EdgeSpec {
                condition_expr: None,
                ..EdgeSpec::conditional("a", "a", "x").with_id("empty")
            });
        let v = g.validate();
        assert!(v.iter().any(|m| m.contains("invalid condition")));
        assert!(v.iter().any(|m| m.contains("'empty' has no condition_expr")));
    }

    #[test]
    fn outgoing_preserves_declaration_order() {
        let g = linear()
            .edge(EdgeSpec::conditional("a", "b", "x == 1").with_id("second"))
            .edge(EdgeSpec::on_failure("a", "b").with_id("third"));
        let ids: Vec<_> = g.outgoing("a").map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["a->b", "second", "third"]);
    }

    #[test]
    fn deserializes_with_defaults() {
        let g: GraphSpec = serde_json::from_str(
            r#"{"id":"g","goal_id":"x","entry_node":"a",
                "nodes":[{"id":"a","node_type":"llm"}],
                "edges":[{"id":"e","source":"a","target":"a","condition":"on_failure"}]}"#,
        )
        .unwrap();
        let a = g.get_node("a").unwrap();
        assert_eq!(a.max_retries, 3);
        assert_eq!(a.max_node_visits, 1);
        assert!(!a.pause_for_hitl);
        assert_eq!(g.version, 1);
        assert_eq!(g.edges[0].condition, EdgeCondition::OnFailure);
    }
}
