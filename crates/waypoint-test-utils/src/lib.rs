//! Shared mocks and fixtures for Waypoint tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::{json, Value};

use waypoint_core::error::{Result, WaypointError};
use waypoint_core::event::EventBus;
use waypoint_core::evolution::AuditEntry;
use waypoint_core::goal::{Goal, SuccessCriterion};
use waypoint_core::graph::{EdgeSpec, GraphSpec, NodeSpec};
use waypoint_core::traits::{RunStorage, RuntimeLogStore, WaitStore};
use waypoint_core::types::{Run, RunId, RunStatus};
use waypoint_runtime::graph::{NodeContext, NodeExecutor, NodeRegistry, NodeResult};
use waypoint_runtime::{DurableWaitRuntime, GraphExecutor, RunLedger};
use waypoint_store::{InMemoryRunStorage, InMemoryWaitStore};

// ── Node executors ───────────────────────────────────────────────

/// One scripted attempt outcome.
#[derive(Debug, Clone)]
pub enum Step {
    Succeed(Value),
    Fail(String),
    /// Write `key = value` into attempt memory, then fail.
    WriteThenFail(String, Value),
}

/// Replays a script of outcomes, one per attempt, then keeps succeeding with
/// the node id as `result`. Records every attempt it sees.
#[derive(Default)]
pub struct ScriptedNode {
    script: Mutex<VecDeque<Step>>,
    calls: AtomicU32,
    seen: Mutex<Vec<Seen>>,
}

/// What a node observed on one attempt.
#[derive(Debug, Clone)]
pub struct Seen {
    pub node_id: String,
    pub attempt: u32,
    pub visit: u32,
    pub input: HashMap<String, Value>,
    /// Keys visible in attempt memory at entry.
    pub memory_keys: Vec<String>,
}

impl ScriptedNode {
    pub fn new(script: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            ..Default::default()
        })
    }

    pub fn succeeding() -> Arc<Self> {
        Self::new(vec![])
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }
}

impl NodeExecutor for ScriptedNode {
    fn execute<'a>(&'a self, ctx: &'a mut NodeContext) -> BoxFuture<'a, Result<NodeResult>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut memory_keys: Vec<String> = ctx.memory.keys().cloned().collect();
            memory_keys.sort();
            self.seen.lock().unwrap().push(Seen {
                node_id: ctx.node.id.clone(),
                attempt: ctx.attempt,
                visit: ctx.visit,
                input: ctx.input.clone(),
                memory_keys,
            });

            let step = self.script.lock().unwrap().pop_front();
            match step {
                Some(Step::Succeed(v)) => Ok(NodeResult::with_result(v)),
                Some(Step::Fail(e)) => Ok(NodeResult::failure(e)),
                Some(Step::WriteThenFail(k, v)) => {
                    ctx.memory.set(k, v);
                    Ok(NodeResult::failure("scripted failure after write"))
                }
                None => Ok(NodeResult::with_result(json!(ctx.node.id))),
            }
        })
    }
}

type NodeFn = dyn Fn(&mut NodeContext) -> Result<NodeResult> + Send + Sync;

/// Synchronous closure as a node.
pub struct FnNode(Box<NodeFn>);

impl FnNode {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&mut NodeContext) -> Result<NodeResult> + Send + Sync + 'static,
    {
        Self(Box::new(f))
    }
}

impl NodeExecutor for FnNode {
    fn execute<'a>(&'a self, ctx: &'a mut NodeContext) -> BoxFuture<'a, Result<NodeResult>> {
        Box::pin(async move { (self.0)(ctx) })
    }
}

/// Suspends on `key` through the wait runtime and returns the payload as
/// `result`.
pub struct WaitingNode {
    pub key: String,
    pub deadline: Option<DateTime<Utc>>,
}

impl NodeExecutor for WaitingNode {
    fn execute<'a>(&'a self, ctx: &'a mut NodeContext) -> BoxFuture<'a, Result<NodeResult>> {
        Box::pin(async move {
            let payload = ctx.wait(&self.key, self.deadline).await?;
            Ok(NodeResult::with_result(payload))
        })
    }
}

// ── Storage mocks ────────────────────────────────────────────────

/// In-memory storage whose saves fail while `fail` is set.
#[derive(Default)]
pub struct FailingStorage {
    inner: InMemoryRunStorage,
    fail: AtomicBool,
    attempts: AtomicU32,
}

impl FailingStorage {
    pub fn new(failing: bool) -> Arc<Self> {
        let s = Self::default();
        s.fail.store(failing, Ordering::SeqCst);
        Arc::new(s)
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail.store(failing, Ordering::SeqCst);
    }

    pub fn save_attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl RunStorage for FailingStorage {
    fn save_run(&self, run: &Run) -> BoxFuture<'_, Result<()>> {
        let run = run.clone();
        Box::pin(async move {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(WaypointError::Persistence("disk unavailable".into()));
            }
            self.inner.save_run(&run).await
        })
    }

    fn load_run(&self, run_id: &RunId) -> BoxFuture<'_, Result<Option<Run>>> {
        self.inner.load_run(run_id)
    }

    fn delete_run(&self, run_id: &RunId) -> BoxFuture<'_, Result<bool>> {
        self.inner.delete_run(run_id)
    }

    fn list_all_runs(&self) -> BoxFuture<'_, Result<Vec<RunId>>> {
        self.inner.list_all_runs()
    }

    fn runs_by_goal(&self, goal_id: &str) -> BoxFuture<'_, Result<Vec<RunId>>> {
        self.inner.runs_by_goal(goal_id)
    }

    fn runs_by_status(&self, status: RunStatus) -> BoxFuture<'_, Result<Vec<RunId>>> {
        self.inner.runs_by_status(status)
    }

    fn runs_by_node(&self, node_id: &str) -> BoxFuture<'_, Result<Vec<RunId>>> {
        self.inner.runs_by_node(node_id)
    }
}

/// In-memory storage that stalls every save of a `Paused` run, widening
/// the window between a pause taking effect and reaching storage.
pub struct SlowPauseStorage {
    inner: InMemoryRunStorage,
    delay: Duration,
}

impl SlowPauseStorage {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: InMemoryRunStorage::new(),
            delay,
        })
    }
}

impl RunStorage for SlowPauseStorage {
    fn save_run(&self, run: &Run) -> BoxFuture<'_, Result<()>> {
        let run = run.clone();
        Box::pin(async move {
            if run.status == RunStatus::Paused {
                tokio::time::sleep(self.delay).await;
            }
            self.inner.save_run(&run).await
        })
    }

    fn load_run(&self, run_id: &RunId) -> BoxFuture<'_, Result<Option<Run>>> {
        self.inner.load_run(run_id)
    }

    fn delete_run(&self, run_id: &RunId) -> BoxFuture<'_, Result<bool>> {
        self.inner.delete_run(run_id)
    }

    fn list_all_runs(&self) -> BoxFuture<'_, Result<Vec<RunId>>> {
        self.inner.list_all_runs()
    }

    fn runs_by_goal(&self, goal_id: &str) -> BoxFuture<'_, Result<Vec<RunId>>> {
        self.inner.runs_by_goal(goal_id)
    }

    fn runs_by_status(&self, status: RunStatus) -> BoxFuture<'_, Result<Vec<RunId>>> {
        self.inner.runs_by_status(status)
    }

    fn runs_by_node(&self, node_id: &str) -> BoxFuture<'_, Result<Vec<RunId>>> {
        self.inner.runs_by_node(node_id)
    }
}

/// Audit sink that keeps entries in memory.
#[derive(Default)]
pub struct RecordingLogStore {
    entries: Mutex<Vec<AuditEntry>>,
    fail: AtomicBool,
}

impl RecordingLogStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        let s = Self::default();
        s.fail.store(true, Ordering::SeqCst);
        Arc::new(s)
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().unwrap().clone()
    }
}

impl RuntimeLogStore for RecordingLogStore {
    fn write(&self, entry: &AuditEntry) -> BoxFuture<'_, Result<()>> {
        let entry = entry.clone();
        Box::pin(async move {
            if self.fail.load(Ordering::SeqCst) {
                return Err(WaypointError::Persistence("log sink offline".into()));
            }
            self.entries.lock().unwrap().push(entry);
            Ok(())
        })
    }
}

// ── Fixtures ─────────────────────────────────────────────────────

/// `a -> b -> c`, all of type `step`, `c` terminal.
pub fn linear_graph() -> GraphSpec {
    GraphSpec::new("linear", "goal-1", "a")
        .node(NodeSpec::new("a", "step"))
        .node(NodeSpec::new("b", "step"))
        .node(NodeSpec::new("c", "step"))
        .edge(EdgeSpec::on_success("a", "b"))
        .edge(EdgeSpec::on_success("b", "c"))
        .terminal("c")
}

/// `draft` (HITL) routes to `publish` when approved, otherwise to `revise`.
pub fn review_graph() -> GraphSpec {
    GraphSpec::new("review", "goal-1", "draft")
        .node(NodeSpec::new("draft", "step").with_hitl())
        .node(NodeSpec::new("publish", "step"))
        .node(NodeSpec::new("revise", "step"))
        .edge(EdgeSpec::conditional("draft", "publish", "approval.approved == true"))
        .edge(EdgeSpec::always("draft", "revise"))
        .terminal("publish")
        .terminal("revise")
}

pub fn simple_goal() -> Goal {
    Goal::new("goal-1", "Finish the workflow")
        .with_criterion(SuccessCriterion::contains("mentions-c", "c", 1.0))
}

/// Executor plus the collaborators tests usually inspect.
pub struct Harness {
    pub events: Arc<EventBus>,
    pub storage: Arc<dyn RunStorage>,
    pub ledger: Arc<RunLedger>,
    pub waits: Arc<DurableWaitRuntime>,
    pub executor: Arc<GraphExecutor>,
}

impl Harness {
    pub fn new(registry: NodeRegistry) -> Self {
        Self::with_storage(registry, Arc::new(InMemoryRunStorage::new()))
    }

    pub fn with_storage(registry: NodeRegistry, storage: Arc<dyn RunStorage>) -> Self {
        Self::with_stores(registry, storage, Arc::new(InMemoryWaitStore::new()))
    }

    /// Harness over caller-owned stores, e.g. reopened after a restart.
    pub fn with_stores(
        registry: NodeRegistry,
        storage: Arc<dyn RunStorage>,
        wait_store: Arc<dyn WaitStore>,
    ) -> Self {
        let events = Arc::new(EventBus::new());
        let ledger = Arc::new(RunLedger::new(storage.clone()).with_events(events.clone()));
        let waits = Arc::new(DurableWaitRuntime::new(wait_store).with_events(events.clone()));
        let executor = Arc::new(
            GraphExecutor::new(Arc::new(registry), ledger.clone(), events.clone())
                .with_wait_runtime(waits.clone()),
        );
        Self {
            events,
            storage,
            ledger,
            waits,
            executor,
        }
    }
}

/// Registry with one executor for every node type `step`.
pub fn step_registry(node: Arc<dyn NodeExecutor>) -> NodeRegistry {
    let mut registry = NodeRegistry::new();
    registry.register_type_arc("step", node);
    registry
}
