use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::debug;

use waypoint_core::error::Result;
use waypoint_core::event::EventBus;
use waypoint_core::evolution::ValidationResult;
use waypoint_core::goal::Goal;
use waypoint_core::graph::GraphSpec;
use waypoint_store::InMemoryRunStorage;

use crate::graph::{ExecutionStatus, GraphExecutor, NodeRegistry, RunRequest};
use crate::ledger::RunLedger;

/// Bounded trial of a candidate graph.
///
/// An `Err` is treated by the guard as a rejection carrying the error text.
pub trait ProbationRunner: Send + Sync + 'static {
    fn probation_run<'a>(
        &'a self,
        baseline: &'a GraphSpec,
        candidate: &'a GraphSpec,
        steps: usize,
    ) -> BoxFuture<'a, Result<ValidationResult>>;
}

/// Runs the candidate once through a throwaway executor.
///
/// The trial ledger, storage and event bus are private to each call, so
/// probation never shows up in the live ledger.
pub struct ExecutorProbation {
    registry: Arc<NodeRegistry>,
    goal: Goal,
    input: HashMap<String, Value>,
}

impl ExecutorProbation {
    pub fn new(registry: Arc<NodeRegistry>, goal: Goal) -> Self {
        Self {
            registry,
            goal,
            input: HashMap::new(),
        }
    }

    /// Synthetic input handed to the trial run.
    pub fn with_input(mut self, input: HashMap<String, Value>) -> Self {
        self.input = input;
        self
    }

    fn structural_violations(&self, candidate: &GraphSpec) -> Vec<String> {
        let mut violations = candidate.validate();
        violations.extend(self.registry.missing(candidate));
        violations
    }
}

impl ProbationRunner for ExecutorProbation {
    fn probation_run<'a>(
        &'a self,
        baseline: &'a GraphSpec,
        candidate: &'a GraphSpec,
        steps: usize,
    ) -> BoxFuture<'a, Result<ValidationResult>> {
        Box::pin(async move {
            let mut metrics = HashMap::new();
            metrics.insert("baseline_version".to_string(), baseline.version as f64);

            let violations = self.structural_violations(candidate);
            if !violations.is_empty() {
                return Ok(ValidationResult::from_violations(violations, metrics));
            }

            let events = Arc::new(EventBus::new());
            let ledger = Arc::new(RunLedger::new(Arc::new(InMemoryRunStorage::new())));
            let executor = GraphExecutor::new(self.registry.clone(), ledger, events)
                .with_max_steps(steps);

            let started = Instant::now();
            let request = RunRequest::new(self.input.clone()).with_description("probation");
            let result = executor.execute(candidate, &self.goal, request).await?;

            metrics.insert("steps".to_string(), result.steps as f64);
            metrics.insert("nodes_executed".to_string(), result.path.len() as f64);
            metrics.insert(
                "latency_ms".to_string(),
                started.elapsed().as_millis() as f64,
            );
            if let Some(eval) = &result.evaluation {
                metrics.insert("goal_score".to_string(), eval.overall_score);
            }

            let mut violations = Vec::new();
            match &result.status {
                // A HITL checkpoint is as far as an unattended trial can go.
                ExecutionStatus::Completed | ExecutionStatus::Paused { .. } => {}
                ExecutionStatus::Failed { node_id, error } => {
                    violations.push(format!("probation run failed at '{}': {}", node_id, error));
                }
            }
            debug!(graph_id = %candidate.id, version = candidate.version, steps = result.steps, violations = violations.len(), "Probation finished");
            Ok(ValidationResult::from_violations(violations, metrics))
        })
    }
}
