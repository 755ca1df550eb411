use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, error, info, warn};

use waypoint_core::condition::{build_context, evaluate_condition};
use waypoint_core::config::ExecutorConfig;
use waypoint_core::error::{Result, WaypointError};
use waypoint_core::event::{EventBus, RuntimeEvent};
use waypoint_core::goal::{Goal, GoalEvaluation};
use waypoint_core::graph::{EdgeCondition, EdgeSpec, GraphSpec, NodeSpec};
use waypoint_core::traits::PauseChannel;
use waypoint_core::types::{
    DecisionOption, Outcome, ProblemSeverity, ResumePhase, ResumeState, RunId, RunStatus,
    SessionId,
};
use waypoint_core::wait::WaitKey;

use super::memory::SharedMemory;
use super::node::{NodeContext, NodeResult, Redelivery, WaitCheckpoint};
use super::output::OutputValidator;
use super::registry::NodeRegistry;
use crate::context::ExecutionContext;
use crate::ledger::RunLedger;
use crate::wait::DurableWaitRuntime;

/// Memory key under which a HITL approval payload is stored on resume.
pub const APPROVAL_KEY: &str = "approval";

/// Input for a new run.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub input: HashMap<String, Value>,
    pub session_id: SessionId,
    pub description: String,
    /// Caller's call-depth context; `None` for a top-level run.
    pub context: Option<ExecutionContext>,
}

impl RunRequest {
    pub fn new(input: HashMap<String, Value>) -> Self {
        Self {
            input,
            ..Default::default()
        }
    }

    pub fn with_session(mut self, session_id: SessionId) -> Self {
        self.session_id = session_id;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_context(mut self, context: ExecutionContext) -> Self {
        self.context = Some(context);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionStatus {
    Completed,
    Failed { node_id: String, error: String },
    Paused { paused_at: String },
}

/// User-visible result of `execute` / `resume`.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub run_id: RunId,
    pub status: ExecutionStatus,
    /// Committed memory at the point the run stopped.
    pub output: HashMap<String, Value>,
    /// Node ids in entry order.
    pub path: Vec<String>,
    pub steps: usize,
    pub latency_ms: u64,
    pub evaluation: Option<GoalEvaluation>,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Completed
    }

    pub fn is_paused(&self) -> bool {
        matches!(self.status, ExecutionStatus::Paused { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, ExecutionStatus::Failed { .. })
    }

    pub fn paused_at(&self) -> Option<&str> {
        match &self.status {
            ExecutionStatus::Paused { paused_at } => Some(paused_at),
            _ => None,
        }
    }
}

/// Mutable traversal state of one run.
struct Traversal {
    run_id: RunId,
    session_id: SessionId,
    memory: SharedMemory,
    visit_counts: HashMap<String, u32>,
    steps: usize,
    path: Vec<String>,
    started: Instant,
    exec: ExecutionContext,
}

enum Step {
    /// About to enter a node (pause check, limits, visit accounting).
    Enter(String),
    /// Node admitted; run its attempts. A re-entry after a lost wait carries
    /// the signal the interrupted attempt was suspended on.
    Run {
        node_id: String,
        visit: u32,
        redelivery: Option<Redelivery>,
    },
    /// Node finished; choose the next edge.
    Route {
        node_id: String,
        output: HashMap<String, Value>,
        outcome: std::result::Result<(), String>,
    },
}

enum NodeRun {
    Succeeded(HashMap<String, Value>),
    Exhausted(String),
    Fatal(WaypointError),
}

/// Drives node-by-node traversal of a graph for one run at a time per call.
///
/// Independent runs can be driven concurrently through one executor; all
/// per-run state lives in the call.
pub struct GraphExecutor {
    registry: Arc<NodeRegistry>,
    ledger: Arc<RunLedger>,
    events: Arc<EventBus>,
    pause: Option<Arc<dyn PauseChannel>>,
    waits: Option<Arc<DurableWaitRuntime>>,
    max_steps: usize,
    max_call_depth: u32,
    retry_backoff: Duration,
}

impl GraphExecutor {
    pub fn new(registry: Arc<NodeRegistry>, ledger: Arc<RunLedger>, events: Arc<EventBus>) -> Self {
        let defaults = ExecutorConfig::default();
        Self {
            registry,
            ledger,
            events,
            pause: None,
            waits: None,
            max_steps: defaults.max_steps,
            max_call_depth: crate::context::DEFAULT_MAX_CALL_DEPTH,
            retry_backoff: Duration::from_millis(defaults.retry_backoff_ms),
        }
    }

    pub fn with_config(mut self, config: &ExecutorConfig) -> Self {
        self.max_steps = config.max_steps;
        self.retry_backoff = Duration::from_millis(config.retry_backoff_ms);
        self
    }

    pub fn with_pause_channel(mut self, pause: Arc<dyn PauseChannel>) -> Self {
        self.pause = Some(pause);
        self
    }

    pub fn with_wait_runtime(mut self, waits: Arc<DurableWaitRuntime>) -> Self {
        self.waits = Some(waits);
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_max_call_depth(mut self, depth: u32) -> Self {
        self.max_call_depth = depth;
        self
    }

    pub fn ledger(&self) -> &Arc<RunLedger> {
        &self.ledger
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Structural violations plus nodes without an executor.
    pub fn check(&self, graph: &GraphSpec) -> Vec<String> {
        let mut violations = graph.validate();
        violations.extend(self.registry.missing(graph));
        violations
    }

    fn ensure_runnable(&self, graph: &GraphSpec) -> Result<()> {
        let violations = self.check(graph);
        if violations.is_empty() {
            Ok(())
        } else {
            Err(WaypointError::GraphStructure(violations.join("; ")))
        }
    }

    /// A graph may tighten the executor's step cap but never raise it.
    fn step_limit(&self, graph: &GraphSpec) -> usize {
        graph
            .max_steps
            .map_or(self.max_steps, |limit| limit.min(self.max_steps))
    }

    /// Start a new run of `graph` for `goal`.
    ///
    /// Structural defects and call-depth overflow are returned as `Err`
    /// before any run is created. Once the run exists, every outcome
    /// (including failures) is reported in the `ExecutionResult`.
    pub async fn execute(
        &self,
        graph: &GraphSpec,
        goal: &Goal,
        request: RunRequest,
    ) -> Result<ExecutionResult> {
        let exec = request
            .context
            .unwrap_or_else(|| ExecutionContext::with_max_depth(self.max_call_depth))
            .child()?;
        self.ensure_runnable(graph)?;

        let run_id = self
            .ledger
            .start_run(&goal.id, &request.description, request.input.clone())
            .await?;

        info!(run_id = %run_id, graph_id = %graph.id, version = graph.version, depth = exec.depth(), "Graph run started");
        self.events.publish(RuntimeEvent::RunStarted {
            run_id: run_id.clone(),
            goal_id: goal.id.clone(),
            graph_id: graph.id.clone(),
        });

        let traversal = Traversal {
            run_id,
            session_id: request.session_id,
            memory: SharedMemory::from_map(request.input),
            visit_counts: HashMap::new(),
            steps: 0,
            path: Vec::new(),
            started: Instant::now(),
            exec,
        };
        self.drive(graph, goal, traversal, Step::Enter(graph.entry_node.clone()))
            .await
    }

    /// Continue a paused run from its checkpoint.
    ///
    /// A run paused before a node re-enters that node. A run paused by a
    /// HITL node stores `payload` under `approval` and proceeds to edge
    /// selection with the node's original output. A run whose node was
    /// suspended on a durable wait when its process went away re-enters that
    /// node, and the node's repeated `wait` returns `payload` (`None` means
    /// the wait timed out).
    pub async fn resume(
        &self,
        graph: &GraphSpec,
        goal: &Goal,
        run_id: &RunId,
        payload: Option<Value>,
    ) -> Result<ExecutionResult> {
        let fallback = ExecutionContext::with_max_depth(self.max_call_depth).child()?;
        self.ensure_runnable(graph)?;
        self.ensure_not_waiting(run_id).await?;

        let run = self.ledger.resume_run(run_id).await?;
        let state = match run.resume_state {
            Some(state) => state,
            None => {
                let error = "paused run has no resume checkpoint".to_string();
                let node_id = run.paused_at.clone().unwrap_or_default();
                return self
                    .fail_without_traversal(run_id, &node_id, error, run.input_data)
                    .await;
            }
        };

        if let Some(waits) = &self.waits {
            // A direct resume retires the approval wait so a late signal is a no-op.
            if let Err(e) = waits.cancel_run(run_id) {
                warn!(run_id = %run_id, error = %e, "Failed to retire outstanding waits");
            }
        }

        info!(run_id = %run_id, node_id = %state.node_id, phase = ?state.phase, depth = state.call_depth, "Run resumed");
        self.events.publish(RuntimeEvent::RunResumed {
            run_id: run_id.clone(),
            node_id: state.node_id.clone(),
        });

        let exec = if state.call_depth > 0 {
            ExecutionContext::at_depth(state.call_depth, state.max_call_depth)
        } else {
            fallback
        };
        let mut traversal = Traversal {
            run_id: run_id.clone(),
            session_id: state.session_id,
            memory: SharedMemory::from_map(state.memory),
            visit_counts: state.visit_counts,
            steps: state.steps,
            path: state.path,
            started: Instant::now(),
            exec,
        };

        let step = match state.phase {
            ResumePhase::BeforeNode => Step::Enter(state.node_id),
            ResumePhase::AfterOutput => {
                if let Some(payload) = payload {
                    traversal.memory.set(APPROVAL_KEY, payload);
                }
                Step::Route {
                    node_id: state.node_id,
                    output: state.last_output,
                    outcome: Ok(()),
                }
            }
            ResumePhase::AwaitingSignal => {
                if let Some(decision_id) = &state.decision_id {
                    let outcome = Outcome::failure("attempt interrupted while suspended on a wait");
                    if let Err(e) = self.ledger.record_outcome(run_id, decision_id, outcome).await {
                        warn!(run_id = %run_id, decision_id = %decision_id, error = %e, "Failed to close interrupted attempt");
                    }
                }
                let visit = traversal
                    .visit_counts
                    .get(&state.node_id)
                    .copied()
                    .unwrap_or(1);
                Step::Run {
                    node_id: state.node_id,
                    visit,
                    redelivery: state.wait_key.map(|key| Redelivery { key, payload }),
                }
            }
        };
        self.drive(graph, goal, traversal, step).await
    }

    /// Refuse to take over a run whose node is still suspended on a wait
    /// that has not been delivered.
    async fn ensure_not_waiting(&self, run_id: &RunId) -> Result<()> {
        let Some(waits) = &self.waits else {
            return Ok(());
        };
        let Some(run) = self.ledger.get_run(run_id).await? else {
            return Ok(());
        };
        let awaiting = run
            .resume_state
            .as_ref()
            .is_some_and(|s| s.phase == ResumePhase::AwaitingSignal);
        if run.status == RunStatus::Running
            && awaiting
            && (waits.has_waiter(run_id)? || !waits.pending_for_run(run_id)?.is_empty())
        {
            return Err(WaypointError::NotPaused {
                run_id: run_id.to_string(),
                status: "waiting on a signal".into(),
            });
        }
        Ok(())
    }

    async fn drive(
        &self,
        graph: &GraphSpec,
        goal: &Goal,
        mut t: Traversal,
        mut step: Step,
    ) -> Result<ExecutionResult> {
        let max_steps = self.step_limit(graph);

        loop {
            step = match step {
                Step::Enter(node_id) => {
                    if self.pause_requested(&t)? {
                        return self
                            .pause(t, ResumePhase::BeforeNode, node_id, HashMap::new())
                            .await;
                    }

                    if t.steps >= max_steps {
                        let error = format!("step limit of {} exceeded", max_steps);
                        return self.fail(t, &node_id, error).await;
                    }

                    let Some(node) = graph.get_node(&node_id) else {
                        let error = format!("node '{}' is not declared", node_id);
                        return self.fail(t, &node_id, error).await;
                    };

                    let visit = {
                        let count = t.visit_counts.entry(node_id.clone()).or_insert(0);
                        *count += 1;
                        *count
                    };
                    if visit > node.max_node_visits {
                        let error = format!(
                            "node '{}' exceeded max_node_visits ({})",
                            node_id, node.max_node_visits
                        );
                        return self.fail(t, &node_id, error).await;
                    }

                    t.steps += 1;
                    t.path.push(node_id.clone());
                    Step::Run {
                        node_id,
                        visit,
                        redelivery: None,
                    }
                }

                Step::Run {
                    node_id,
                    visit,
                    redelivery,
                } => {
                    let Some(node) = graph.get_node(&node_id) else {
                        let error = format!("node '{}' is not declared", node_id);
                        return self.fail(t, &node_id, error).await;
                    };
                    self.ledger.set_node(&t.run_id, &node_id)?;

                    match self.run_node(graph, node, visit, redelivery, &mut t).await? {
                        NodeRun::Succeeded(output) => {
                            if node.pause_for_hitl {
                                let paused = self
                                    .pause(t, ResumePhase::AfterOutput, node_id.clone(), output)
                                    .await?;
                                // Only once the paused checkpoint is durable.
                                self.await_approval(&paused.run_id, &node_id);
                                return Ok(paused);
                            }
                            Step::Route {
                                node_id,
                                output,
                                outcome: Ok(()),
                            }
                        }
                        NodeRun::Exhausted(error) => Step::Route {
                            node_id,
                            output: HashMap::new(),
                            outcome: Err(error),
                        },
                        NodeRun::Fatal(e) => {
                            return self.fail(t, &node_id, e.to_string()).await;
                        }
                    }
                }

                Step::Route {
                    node_id,
                    output,
                    outcome: Ok(()),
                } => {
                    if graph.is_terminal(&node_id) {
                        return self.complete(goal, t, &output).await;
                    }
                    let context = build_context(t.memory.data(), &output);
                    let next = graph.outgoing(&node_id).find(|edge| match edge.condition {
                        EdgeCondition::Always | EdgeCondition::OnSuccess => true,
                        EdgeCondition::OnFailure => false,
                        EdgeCondition::Conditional => edge
                            .condition_expr
                            .as_deref()
                            .map(|expr| evaluate_condition(expr, &context))
                            .unwrap_or(false),
                    });
                    match next {
                        Some(edge) => self.traverse(&t, edge),
                        None => {
                            let error = WaypointError::structure(format!(
                                "no outgoing edge of '{}' matched",
                                node_id
                            ))
                            .to_string();
                            return self.fail(t, &node_id, error).await;
                        }
                    }
                }

                Step::Route {
                    node_id,
                    outcome: Err(error),
                    ..
                } => {
                    let fallback = graph
                        .outgoing(&node_id)
                        .find(|e| e.condition == EdgeCondition::OnFailure);
                    match fallback {
                        Some(edge) => {
                            self.ledger
                                .report_problem(
                                    &t.run_id,
                                    ProblemSeverity::Warning,
                                    &format!("node '{}' failed, routed via '{}': {}", node_id, edge.id, error),
                                    Some(&node_id),
                                    None,
                                )
                                .await?;
                            self.traverse(&t, edge)
                        }
                        None => return self.fail(t, &node_id, error).await,
                    }
                }
            };
        }
    }

    fn traverse(&self, t: &Traversal, edge: &EdgeSpec) -> Step {
        debug!(run_id = %t.run_id, edge_id = %edge.id, from = %edge.source, to = %edge.target, "Edge traversed");
        self.events.publish(RuntimeEvent::EdgeTraversed {
            run_id: t.run_id.clone(),
            edge_id: edge.id.clone(),
            source: edge.source.clone(),
            target: edge.target.clone(),
        });
        Step::Enter(edge.target.clone())
    }

    fn pause_requested(&self, t: &Traversal) -> Result<bool> {
        match &self.pause {
            Some(pause) => pause.take_pause(&t.session_id),
            None => Ok(false),
        }
    }

    fn await_approval(&self, run_id: &RunId, node_id: &str) {
        if let Some(waits) = &self.waits {
            if let Err(e) = waits.register(&WaitKey::approval(run_id, node_id), None) {
                warn!(run_id = %run_id, node_id, error = %e, "Failed to register approval wait");
            }
        }
    }

    /// One visit: attempts until success or retries are exhausted.
    async fn run_node(
        &self,
        graph: &GraphSpec,
        node: &NodeSpec,
        visit: u32,
        mut redelivery: Option<Redelivery>,
        t: &mut Traversal,
    ) -> Result<NodeRun> {
        let executor = match self.registry.resolve(node) {
            Ok(e) => e,
            Err(e) => return Ok(NodeRun::Fatal(e)),
        };
        let validator = node.output_schema.as_ref().map(OutputValidator::from_schema);
        let max_attempts = node.max_retries.max(1);
        let options: Vec<DecisionOption> = graph
            .outgoing(&node.id)
            .map(|e| DecisionOption::new(e.target.clone(), format!("{:?} via {}", e.condition, e.id)))
            .collect();

        let mut attempt = 0;
        loop {
            attempt += 1;
            self.events.publish(RuntimeEvent::NodeStart {
                run_id: t.run_id.clone(),
                node_id: node.id.clone(),
                attempt,
                visit,
            });
            debug!(run_id = %t.run_id, node_id = %node.id, attempt, visit, "Executing node");

            let decision_id = self
                .ledger
                .decide(
                    &t.run_id,
                    "execute node",
                    options.clone(),
                    &node.id,
                    &format!("attempt {}/{} of visit {}", attempt, max_attempts, visit),
                )
                .await?;

            let mut ctx = NodeContext::new(
                t.run_id.clone(),
                t.session_id.clone(),
                node.clone(),
                t.memory.select(&node.input_keys),
                t.memory.begin_attempt(),
                attempt,
                visit,
                t.exec,
            )
            .with_wait_runtime(self.waits.clone())
            .with_checkpoint(self.waits.as_ref().map(|_| WaitCheckpoint {
                ledger: self.ledger.clone(),
                state: ResumeState {
                    decision_id: Some(decision_id.clone()),
                    ..snapshot(t, ResumePhase::AwaitingSignal, &node.id)
                },
            }))
            .with_redelivery(redelivery.take());

            let started = Instant::now();
            let result = executor.execute(&mut ctx).await;
            let latency_ms = started.elapsed().as_millis() as u64;

            let result = match result {
                Ok(r) if r.success => match validator.as_ref().map(|v| v.validate(&r.output)) {
                    Some(issues) if !issues.is_empty() => NodeResult {
                        success: false,
                        error: Some(format!("output schema: {}", issues.join("; "))),
                        ..r
                    },
                    _ => r,
                },
                Ok(r) => r,
                Err(e) if e.is_fatal() => {
                    error!(run_id = %t.run_id, node_id = %node.id, error = %e, "Fatal node error");
                    self.ledger
                        .record_outcome(&t.run_id, &decision_id, Outcome::failure(e.to_string()).with_metrics(0, latency_ms))
                        .await?;
                    self.events.publish(RuntimeEvent::NodeError {
                        run_id: t.run_id.clone(),
                        node_id: node.id.clone(),
                        attempt,
                        error: e.to_string(),
                        will_retry: false,
                    });
                    return Ok(NodeRun::Fatal(e));
                }
                Err(e) => NodeResult::failure(e.to_string()),
            };

            if result.success {
                let summary = format!("node '{}' succeeded on attempt {}", node.id, attempt);
                let recorded = serde_json::to_value(&result.output).unwrap_or(Value::Null);
                self.ledger
                    .record_outcome(
                        &t.run_id,
                        &decision_id,
                        Outcome::success(recorded, summary).with_metrics(result.tokens_used, latency_ms),
                    )
                    .await?;
                t.memory.commit(ctx.memory, &result.output, &node.output_keys);
                self.events.publish(RuntimeEvent::NodeComplete {
                    run_id: t.run_id.clone(),
                    node_id: node.id.clone(),
                    attempt,
                    latency_ms,
                    tokens_used: result.tokens_used,
                });
                return Ok(NodeRun::Succeeded(result.output));
            }

            // The attempt's memory overlay is dropped here, uncommitted.
            let error = result
                .error
                .unwrap_or_else(|| format!("node '{}' reported failure", node.id));
            self.ledger
                .record_outcome(
                    &t.run_id,
                    &decision_id,
                    Outcome::failure(error.clone()).with_metrics(result.tokens_used, latency_ms),
                )
                .await?;

            let will_retry = attempt < max_attempts;
            self.events.publish(RuntimeEvent::NodeError {
                run_id: t.run_id.clone(),
                node_id: node.id.clone(),
                attempt,
                error: error.clone(),
                will_retry,
            });
            warn!(run_id = %t.run_id, node_id = %node.id, attempt, max_attempts, error = %error, "Node attempt failed");

            if !will_retry {
                return Ok(NodeRun::Exhausted(error));
            }
            if !self.retry_backoff.is_zero() {
                tokio::time::sleep(self.retry_backoff).await;
            }
        }
    }

    async fn pause(
        &self,
        t: Traversal,
        phase: ResumePhase,
        node_id: String,
        last_output: HashMap<String, Value>,
    ) -> Result<ExecutionResult> {
        let state = ResumeState {
            last_output,
            ..snapshot(&t, phase, &node_id)
        };
        self.ledger.pause_run(&t.run_id, &node_id, state).await?;
        self.events.publish(RuntimeEvent::RunPaused {
            run_id: t.run_id.clone(),
            paused_at: node_id.clone(),
        });

        Ok(ExecutionResult {
            run_id: t.run_id,
            status: ExecutionStatus::Paused { paused_at: node_id },
            output: t.memory.into_inner(),
            path: t.path,
            steps: t.steps,
            latency_ms: t.started.elapsed().as_millis() as u64,
            evaluation: None,
        })
    }

    async fn complete(
        &self,
        goal: &Goal,
        t: Traversal,
        final_output: &HashMap<String, Value>,
    ) -> Result<ExecutionResult> {
        let evaluation = goal.evaluate(&render_output(final_output));
        self.ledger.set_evaluation(&t.run_id, evaluation.clone()).await?;
        self.ledger
            .end_run(&t.run_id, true, t.memory.data().clone())
            .await?;
        self.retire_waits(&t.run_id);

        let latency_ms = t.started.elapsed().as_millis() as u64;
        info!(run_id = %t.run_id, steps = t.steps, latency_ms, score = evaluation.overall_score, "Run completed");
        self.events.publish(RuntimeEvent::RunCompleted {
            run_id: t.run_id.clone(),
            steps: t.steps,
            latency_ms,
        });

        Ok(ExecutionResult {
            run_id: t.run_id,
            status: ExecutionStatus::Completed,
            output: t.memory.into_inner(),
            path: t.path,
            steps: t.steps,
            latency_ms,
            evaluation: Some(evaluation),
        })
    }

    async fn fail(
        &self,
        t: Traversal,
        node_id: &str,
        error: String,
    ) -> Result<ExecutionResult> {
        self.ledger
            .report_problem(&t.run_id, ProblemSeverity::Critical, &error, Some(node_id), None)
            .await?;
        self.ledger
            .end_run(&t.run_id, false, t.memory.data().clone())
            .await?;
        self.retire_waits(&t.run_id);

        error!(run_id = %t.run_id, node_id, error = %error, "Run failed");
        self.events.publish(RuntimeEvent::RunFailed {
            run_id: t.run_id.clone(),
            node_id: Some(node_id.to_string()),
            error: error.clone(),
        });

        Ok(ExecutionResult {
            run_id: t.run_id,
            status: ExecutionStatus::Failed {
                node_id: node_id.to_string(),
                error,
            },
            output: t.memory.into_inner(),
            path: t.path,
            steps: t.steps,
            latency_ms: t.started.elapsed().as_millis() as u64,
            evaluation: None,
        })
    }

    async fn fail_without_traversal(
        &self,
        run_id: &RunId,
        node_id: &str,
        error: String,
        memory: HashMap<String, Value>,
    ) -> Result<ExecutionResult> {
        let t = Traversal {
            run_id: run_id.clone(),
            session_id: SessionId::new(),
            memory: SharedMemory::from_map(memory),
            visit_counts: HashMap::new(),
            steps: 0,
            path: Vec::new(),
            started: Instant::now(),
            exec: ExecutionContext::root(),
        };
        self.fail(t, node_id, error).await
    }

    fn retire_waits(&self, run_id: &RunId) {
        if let Some(waits) = &self.waits {
            if let Err(e) = waits.cancel_run(run_id) {
                warn!(run_id = %run_id, error = %e, "Failed to retire outstanding waits");
            }
        }
    }
}

/// Checkpoint of the traversal as it stands, re-entering `node_id`.
fn snapshot(t: &Traversal, phase: ResumePhase, node_id: &str) -> ResumeState {
    ResumeState {
        phase,
        node_id: node_id.to_string(),
        session_id: t.session_id.clone(),
        memory: t.memory.data().clone(),
        visit_counts: t.visit_counts.clone(),
        steps: t.steps,
        path: t.path.clone(),
        call_depth: t.exec.depth(),
        max_call_depth: t.exec.max_depth(),
        ..Default::default()
    }
}

/// Text the goal's deterministic criteria are checked against: the node's
/// `result` string when present, otherwise the output as JSON.
fn render_output(output: &HashMap<String, Value>) -> String {
    match output.get("result") {
        Some(Value::String(s)) => s.clone(),
        _ => serde_json::to_string(output).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use futures::future::BoxFuture;
    use serde_json::json;
    use waypoint_core::event::EventType;
    use waypoint_core::goal::SuccessCriterion;
    use waypoint_store::{InMemoryPauseFlags, InMemoryRunStorage, InMemoryWaitStore};

    use super::*;
    use crate::graph::node::NodeExecutor;

    /// Fails its first `fail_first` attempts of every visit. Each attempt
    /// writes `scratch` and reports whether an earlier attempt's write leaked.
    struct Flaky {
        fail_first: u32,
    }

    impl NodeExecutor for Flaky {
        fn execute<'a>(&'a self, ctx: &'a mut NodeContext) -> BoxFuture<'a, Result<NodeResult>> {
            Box::pin(async move {
                let leaked = ctx.memory.contains("scratch");
                ctx.memory.set("scratch", json!(ctx.attempt));
                if ctx.attempt <= self.fail_first {
                    return Ok(NodeResult::failure(format!("attempt {} failed", ctx.attempt)));
                }
                let mut output = HashMap::new();
                output.insert("result".to_string(), json!(format!("{} done", ctx.node.id)));
                output.insert("leaked".to_string(), json!(leaked));
                Ok(NodeResult::success(output).with_tokens(10))
            })
        }
    }

    struct Fatal;

    impl NodeExecutor for Fatal {
        fn execute<'a>(&'a self, _ctx: &'a mut NodeContext) -> BoxFuture<'a, Result<NodeResult>> {
            Box::pin(async move { Err(WaypointError::structure("sub-graph is malformed")) })
        }
    }

    /// Reports the call depth it ran at.
    struct Depth;

    impl NodeExecutor for Depth {
        fn execute<'a>(&'a self, ctx: &'a mut NodeContext) -> BoxFuture<'a, Result<NodeResult>> {
            Box::pin(async move {
                let mut output = HashMap::new();
                output.insert("depth".to_string(), json!(ctx.exec.depth()));
                Ok(NodeResult::success(output))
            })
        }
    }

    /// Suspends on a `reply` signal and echoes it.
    struct AwaitReply;

    impl NodeExecutor for AwaitReply {
        fn execute<'a>(&'a self, ctx: &'a mut NodeContext) -> BoxFuture<'a, Result<NodeResult>> {
            Box::pin(async move {
                let reply = ctx.wait("reply", None).await?;
                let mut output = HashMap::new();
                output.insert("result".to_string(), reply);
                Ok(NodeResult::success(output))
            })
        }
    }

    fn harness(registry: NodeRegistry) -> GraphExecutor {
        let events = Arc::new(EventBus::new());
        let ledger = Arc::new(
            RunLedger::new(Arc::new(InMemoryRunStorage::new())).with_events(events.clone()),
        );
        GraphExecutor::new(Arc::new(registry), ledger, events)
    }

    fn flaky_registry(fail_first: u32) -> NodeRegistry {
        let mut registry = NodeRegistry::new();
        registry.register_type("task", Flaky { fail_first: 0 });
        registry.register_node("b", Flaky { fail_first });
        registry
    }

    fn linear(b_retries: u32) -> GraphSpec {
        GraphSpec::new("linear", "g", "a")
            .node(NodeSpec::new("a", "task"))
            .node(NodeSpec::new("b", "task").with_max_retries(b_retries))
            .node(NodeSpec::new("c", "task"))
            .edge(EdgeSpec::on_success("a", "b"))
            .edge(EdgeSpec::on_success("b", "c"))
            .terminal("c")
    }

    fn goal() -> Goal {
        Goal::new("g", "finish").with_criterion(SuccessCriterion::contains("done", "done", 1.0))
    }

    #[tokio::test]
    async fn retry_then_success_completes() {
        let executor = harness(flaky_registry(1));
        let result = executor
            .execute(&linear(2), &goal(), RunRequest::default())
            .await
            .unwrap();

        assert!(result.is_success());
        assert_eq!(result.path, vec!["a", "b", "c"]);
        assert_eq!(result.steps, 3);
        assert!(result.evaluation.as_ref().unwrap().passed);

        let run = executor.ledger().get_run(&result.run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.decisions.len(), 4);
        assert_eq!(run.metrics.failed_decisions, 1);
        assert_eq!(run.metrics.successful_decisions, 3);
        assert_eq!(run.metrics.nodes_executed, vec!["a", "b", "c"]);
        assert!(run.decisions.iter().all(|d| d.outcome.is_some()));
    }

    #[tokio::test]
    async fn failed_attempt_writes_are_discarded() {
        let executor = harness(flaky_registry(1));
        let graph = GraphSpec::new("one", "g", "b")
            .node(NodeSpec::new("b", "task").with_max_retries(2))
            .terminal("b");
        let result = executor.execute(&graph, &goal(), RunRequest::default()).await.unwrap();

        assert!(result.is_success());
        assert_eq!(result.output.get("leaked"), Some(&json!(false)));
        assert_eq!(result.output.get("scratch"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn exhausted_retries_fail_the_run() {
        let executor = harness(flaky_registry(5));
        let result = executor
            .execute(&linear(2), &goal(), RunRequest::default())
            .await
            .unwrap();

        assert_eq!(
            result.status,
            ExecutionStatus::Failed {
                node_id: "b".into(),
                error: "attempt 2 failed".into()
            }
        );
        let run = executor.ledger().get_run(&result.run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run
            .problems
            .iter()
            .any(|p| p.severity == ProblemSeverity::Critical));
    }

    #[tokio::test]
    async fn exhausted_retries_route_via_on_failure() {
        let executor = harness(flaky_registry(5));
        let graph = GraphSpec::new("fallback", "g", "b")
            .node(NodeSpec::new("b", "task"))
            .node(NodeSpec::new("c", "task"))
            .node(NodeSpec::new("recover", "task"))
            .edge(EdgeSpec::on_success("b", "c"))
            .edge(EdgeSpec::on_failure("b", "recover"))
            .terminal("c")
            .terminal("recover");
        let result = executor.execute(&graph, &goal(), RunRequest::default()).await.unwrap();

        assert!(result.is_success());
        assert_eq!(result.path, vec!["b", "recover"]);
    }

    #[tokio::test]
    async fn visit_limit_stops_a_cycle() {
        let executor = harness(flaky_registry(0));
        let graph = GraphSpec::new("cycle", "g", "a")
            .node(NodeSpec::new("a", "task").with_max_visits(2))
            .node(NodeSpec::new("b", "task"))
            .node(NodeSpec::new("c", "task"))
            .edge(EdgeSpec::on_success("a", "b"))
            .edge(EdgeSpec::conditional("b", "a", "again == true"))
            .edge(EdgeSpec::always("b", "c"))
            .terminal("c");
        let mut input = HashMap::new();
        input.insert("again".to_string(), json!(true));
        let result = executor
            .execute(&graph, &goal(), RunRequest::new(input))
            .await
            .unwrap();

        assert!(result.is_failed());
        assert_eq!(result.path, vec!["a", "b", "a", "b"]);
        match result.status {
            ExecutionStatus::Failed { node_id, error } => {
                assert_eq!(node_id, "a");
                assert!(error.contains("max_node_visits"));
            }
            other => panic!("unexpected status {:?}", other),
        }
    }

    #[tokio::test]
    async fn step_limit_is_enforced() {
        let executor = harness(flaky_registry(0)).with_max_steps(1);
        let result = executor
            .execute(&linear(1), &goal(), RunRequest::default())
            .await
            .unwrap();
        assert!(result.is_failed());
        assert_eq!(result.steps, 1);
    }

    #[tokio::test]
    async fn graph_cannot_raise_the_executor_step_cap() {
        let executor = harness(flaky_registry(0)).with_max_steps(1);
        let mut graph = linear(1);
        graph.max_steps = Some(1000);
        let result = executor.execute(&graph, &goal(), RunRequest::default()).await.unwrap();

        assert_eq!(
            result.status,
            ExecutionStatus::Failed {
                node_id: "b".into(),
                error: "step limit of 1 exceeded".into()
            }
        );
        assert_eq!(result.steps, 1);
    }

    #[tokio::test]
    async fn graph_can_lower_the_executor_step_cap() {
        let executor = harness(flaky_registry(0));
        let mut graph = linear(1);
        graph.max_steps = Some(2);
        let result = executor.execute(&graph, &goal(), RunRequest::default()).await.unwrap();
        assert!(result.is_failed());
        assert_eq!(result.path, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn fatal_node_error_ends_the_run_without_retry() {
        let mut registry = flaky_registry(0);
        registry.register_node("b", Fatal);
        let executor = harness(registry);
        let result = executor
            .execute(&linear(3), &goal(), RunRequest::default())
            .await
            .unwrap();

        assert!(result.is_failed());
        let run = executor.ledger().get_run(&result.run_id).await.unwrap().unwrap();
        assert_eq!(run.decisions.iter().filter(|d| d.node_id == "b").count(), 1);
    }

    #[tokio::test]
    async fn invalid_graph_is_rejected_before_a_run_exists() {
        let executor = harness(NodeRegistry::new());
        let err = executor
            .execute(&linear(1), &goal(), RunRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, WaypointError::GraphStructure(_)));
        assert!(executor.ledger().active_runs().is_empty());
    }

    #[tokio::test]
    async fn call_depth_overflow_is_rejected() {
        let executor = harness(flaky_registry(0)).with_max_call_depth(2);
        let deep = ExecutionContext::with_max_depth(2).child().unwrap().child().unwrap();
        let err = executor
            .execute(&linear(1), &goal(), RunRequest::default().with_context(deep))
            .await
            .unwrap_err();
        assert!(matches!(err, WaypointError::RecursionLimit { depth: 3, limit: 2 }));
    }

    #[tokio::test]
    async fn pause_flag_halts_before_the_next_node() {
        let pause = Arc::new(InMemoryPauseFlags::new());
        let session = SessionId::new();
        pause.request_pause(&session).unwrap();

        let executor = harness(flaky_registry(0)).with_pause_channel(pause.clone());
        let request = RunRequest::default().with_session(session.clone());
        let paused = executor.execute(&linear(1), &goal(), request).await.unwrap();

        assert_eq!(paused.paused_at(), Some("a"));
        assert!(paused.path.is_empty());
        assert!(!pause.is_pause_requested(&session).unwrap());

        let resumed = executor
            .resume(&linear(1), &goal(), &paused.run_id, None)
            .await
            .unwrap();
        assert!(resumed.is_success());
        assert_eq!(resumed.path, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn hitl_node_pauses_after_output_and_resumes_with_approval() {
        let executor = harness(flaky_registry(0));
        let graph = GraphSpec::new("review", "g", "a")
            .node(NodeSpec::new("a", "task").with_hitl())
            .node(NodeSpec::new("b", "task"))
            .node(NodeSpec::new("c", "task"))
            .edge(EdgeSpec::conditional("a", "b", "approval.ok == true"))
            .edge(EdgeSpec::always("a", "c"))
            .terminal("b")
            .terminal("c");

        let paused = executor.execute(&graph, &goal(), RunRequest::default()).await.unwrap();
        assert_eq!(paused.paused_at(), Some("a"));
        assert_eq!(paused.path, vec!["a"]);
        let run = executor.ledger().get_run(&paused.run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Paused);
        assert_eq!(
            run.resume_state.as_ref().map(|s| s.phase),
            Some(ResumePhase::AfterOutput)
        );

        let resumed = executor
            .resume(&graph, &goal(), &paused.run_id, Some(json!({"ok": true})))
            .await
            .unwrap();
        assert!(resumed.is_success());
        assert_eq!(resumed.path, vec!["a", "b"]);
        assert_eq!(resumed.output.get(APPROVAL_KEY), Some(&json!({"ok": true})));

        let again = executor.resume(&graph, &goal(), &paused.run_id, None).await;
        assert!(matches!(again, Err(WaypointError::NotPaused { .. })));
    }

    #[tokio::test]
    async fn resume_keeps_the_paused_call_depth() {
        let pause = Arc::new(InMemoryPauseFlags::new());
        let session = SessionId::new();
        pause.request_pause(&session).unwrap();

        let mut registry = NodeRegistry::new();
        registry.register_type("task", Depth);
        let executor = harness(registry).with_pause_channel(pause);
        let graph = GraphSpec::new("depth", "g", "a")
            .node(NodeSpec::new("a", "task"))
            .terminal("a");

        let caller = ExecutionContext::with_max_depth(5).child().unwrap().child().unwrap();
        let request = RunRequest::default().with_session(session).with_context(caller);
        let paused = executor.execute(&graph, &goal(), request).await.unwrap();
        assert_eq!(paused.paused_at(), Some("a"));
        let run = executor.ledger().get_run(&paused.run_id).await.unwrap().unwrap();
        let state = run.resume_state.unwrap();
        assert_eq!((state.call_depth, state.max_call_depth), (3, 5));

        let resumed = executor.resume(&graph, &goal(), &paused.run_id, None).await.unwrap();
        assert!(resumed.is_success());
        assert_eq!(resumed.output.get("depth"), Some(&json!(3)));
    }

    #[tokio::test]
    async fn in_node_wait_is_checkpointed_until_delivered() {
        let events = Arc::new(EventBus::new());
        let ledger = Arc::new(
            RunLedger::new(Arc::new(InMemoryRunStorage::new())).with_events(events.clone()),
        );
        let waits = Arc::new(
            DurableWaitRuntime::new(Arc::new(InMemoryWaitStore::new())).with_events(events.clone()),
        );
        let mut registry = NodeRegistry::new();
        registry.register_type("wait", AwaitReply);
        let executor = Arc::new(
            GraphExecutor::new(Arc::new(registry), ledger.clone(), events.clone())
                .with_wait_runtime(waits.clone()),
        );
        let graph = GraphSpec::new("waiting", "g", "w")
            .node(NodeSpec::new("w", "wait"))
            .terminal("w");

        let (_, mut registered) = events.subscribe_channel(&[EventType::WaitRegistered]);
        let task = {
            let executor = executor.clone();
            let graph = graph.clone();
            tokio::spawn(async move { executor.execute(&graph, &goal(), RunRequest::default()).await })
        };
        let run_id = match registered.recv().await {
            Some(RuntimeEvent::WaitRegistered { run_id, .. }) => run_id,
            other => panic!("expected a registered wait, got {:?}", other),
        };

        let run = ledger.get_run(&run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Running);
        let state = run.resume_state.unwrap();
        assert_eq!(state.phase, ResumePhase::AwaitingSignal);
        assert_eq!(state.wait_key.as_deref(), Some("reply"));

        let early = executor.resume(&graph, &goal(), &run_id, None).await;
        assert!(matches!(early, Err(WaypointError::NotPaused { .. })));

        waits
            .signal(&WaitKey::new(&run_id, "reply"), json!("done"))
            .unwrap();
        let resumptions = waits.tick(chrono::Utc::now()).unwrap();
        assert!(resumptions.iter().all(|r| r.delivered));

        let result = task.await.unwrap().unwrap();
        assert!(result.is_success());
        assert_eq!(result.output.get("result"), Some(&json!("done")));
        let run = ledger.get_run(&run_id).await.unwrap().unwrap();
        assert!(run.resume_state.is_none());
    }
}
