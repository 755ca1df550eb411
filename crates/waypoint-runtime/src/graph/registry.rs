use std::collections::HashMap;
use std::sync::Arc;

use waypoint_core::error::{Result, WaypointError};
use waypoint_core::graph::{GraphSpec, NodeSpec};

use super::node::NodeExecutor;

/// Maps nodes to their executors. A registration for a specific node id
/// takes precedence over one for its `node_type`.
#[derive(Default)]
pub struct NodeRegistry {
    by_id: HashMap<String, Arc<dyn NodeExecutor>>,
    by_type: HashMap<String, Arc<dyn NodeExecutor>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executor for every node of `node_type`.
    pub fn register_type(&mut self, node_type: impl Into<String>, executor: impl NodeExecutor) {
        self.by_type.insert(node_type.into(), Arc::new(executor));
    }

    /// Register an executor for one node id.
    pub fn register_node(&mut self, node_id: impl Into<String>, executor: impl NodeExecutor) {
        self.by_id.insert(node_id.into(), Arc::new(executor));
    }

    pub fn register_type_arc(&mut self, node_type: impl Into<String>, executor: Arc<dyn NodeExecutor>) {
        self.by_type.insert(node_type.into(), executor);
    }

    pub fn register_node_arc(&mut self, node_id: impl Into<String>, executor: Arc<dyn NodeExecutor>) {
        self.by_id.insert(node_id.into(), executor);
    }

    pub fn get(&self, node: &NodeSpec) -> Option<Arc<dyn NodeExecutor>> {
        self.by_id
            .get(&node.id)
            .or_else(|| self.by_type.get(&node.node_type))
            .cloned()
    }

    pub fn resolve(&self, node: &NodeSpec) -> Result<Arc<dyn NodeExecutor>> {
        self.get(node).ok_or_else(|| {
            WaypointError::GraphStructure(format!(
                "no executor registered for node '{}' (type '{}')",
                node.id, node.node_type
            ))
        })
    }

    /// Nodes of `graph` with no executor.
    pub fn missing(&self, graph: &GraphSpec) -> Vec<String> {
        graph
            .nodes
            .iter()
            .filter(|n| self.get(n).is_none())
            .map(|n| format!("no executor registered for node '{}' (type '{}')", n.id, n.node_type))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use futures::future::BoxFuture;

    use super::*;
    use crate::graph::node::{NodeContext, NodeResult};

    struct Tagged(&'static str);

    impl NodeExecutor for Tagged {
        fn execute<'a>(&'a self, _ctx: &'a mut NodeContext) -> BoxFuture<'a, Result<NodeResult>> {
            Box::pin(async move { Ok(NodeResult::with_result(serde_json::json!(self.0))) })
        }
    }

    #[test]
    fn node_id_beats_type() {
        let mut registry = NodeRegistry::new();
        registry.register_type("llm", Tagged("type"));
        registry.register_node("special", Tagged("id"));

        assert!(registry.get(&NodeSpec::new("plain", "llm")).is_some());
        assert!(registry.get(&NodeSpec::new("special", "tool")).is_some());
        assert!(registry.get(&NodeSpec::new("other", "tool")).is_none());
        assert!(matches!(
            registry.resolve(&NodeSpec::new("other", "tool")),
            Err(WaypointError::GraphStructure(_))
        ));
    }

    #[test]
    fn missing_lists_unbound_nodes() {
        let mut registry = NodeRegistry::new();
        registry.register_type("llm", Tagged("x"));
        let graph = GraphSpec::new("g", "goal", "a")
            .node(NodeSpec::new("a", "llm"))
            .node(NodeSpec::new("b", "human"));
        let missing = registry.missing(&graph);
        assert_eq!(missing.len(), 1);
        assert!(missing[0].contains("'b'"));
    }
}
