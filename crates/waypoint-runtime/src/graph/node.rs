use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::Value;

use waypoint_core::error::{Result, WaypointError};
use waypoint_core::graph::NodeSpec;
use waypoint_core::types::{ResumeState, RunId, SessionId};
use waypoint_core::wait::WaitKey;

use super::memory::AttemptMemory;
use crate::context::ExecutionContext;
use crate::ledger::RunLedger;
use crate::wait::DurableWaitRuntime;

/// What a node execution produced.
#[derive(Debug, Clone, Default)]
pub struct NodeResult {
    pub success: bool,
    pub output: HashMap<String, Value>,
    pub error: Option<String>,
    pub tokens_used: u64,
}

impl NodeResult {
    pub fn success(output: HashMap<String, Value>) -> Self {
        Self {
            success: true,
            output,
            ..Default::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    /// Success with a single `result` entry.
    pub fn with_result(value: Value) -> Self {
        let mut output = HashMap::new();
        output.insert("result".to_string(), value);
        Self::success(output)
    }

    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens_used = tokens;
        self
    }
}

/// A signal (or timeout) delivered after the attempt that waited for it was
/// lost, handed to the re-entered node.
#[derive(Debug, Clone)]
pub struct Redelivery {
    pub key: String,
    /// `None` when the wait's deadline elapsed.
    pub payload: Option<Value>,
}

/// Checkpoint written before a node suspends on a durable wait.
pub(crate) struct WaitCheckpoint {
    pub(crate) ledger: Arc<RunLedger>,
    pub(crate) state: ResumeState,
}

/// Everything a node sees during one attempt.
pub struct NodeContext {
    pub run_id: RunId,
    pub session_id: SessionId,
    pub node: NodeSpec,
    /// Committed values of the node's `input_keys`.
    pub input: HashMap<String, Value>,
    /// Attempt-scoped memory; writes are kept only if the attempt succeeds.
    pub memory: AttemptMemory,
    /// 1-based attempt within the current visit.
    pub attempt: u32,
    /// 1-based cumulative visit count.
    pub visit: u32,
    pub exec: ExecutionContext,
    waits: Option<Arc<DurableWaitRuntime>>,
    checkpoint: Option<WaitCheckpoint>,
    redelivery: Option<Redelivery>,
}

impl NodeContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        run_id: RunId,
        session_id: SessionId,
        node: NodeSpec,
        input: HashMap<String, Value>,
        memory: AttemptMemory,
        attempt: u32,
        visit: u32,
        exec: ExecutionContext,
    ) -> Self {
        Self {
            run_id,
            session_id,
            node,
            input,
            memory,
            attempt,
            visit,
            exec,
            waits: None,
            checkpoint: None,
            redelivery: None,
        }
    }

    pub fn with_wait_runtime(mut self, waits: Option<Arc<DurableWaitRuntime>>) -> Self {
        self.waits = waits;
        self
    }

    pub(crate) fn with_checkpoint(mut self, checkpoint: Option<WaitCheckpoint>) -> Self {
        self.checkpoint = checkpoint;
        self
    }

    pub fn with_redelivery(mut self, redelivery: Option<Redelivery>) -> Self {
        self.redelivery = redelivery;
        self
    }

    /// Suspend this node until `key` is signalled for the current run.
    ///
    /// A deadline that elapses first (as observed by the wait runtime's tick)
    /// returns `Timeout`, which the executor treats as a failed attempt.
    /// While suspended the run carries an `AwaitingSignal` checkpoint, so a
    /// signal that arrives after this process is gone re-enters the node and
    /// the repeated `wait` on the same key returns it immediately.
    pub async fn wait(&mut self, key: &str, deadline: Option<DateTime<Utc>>) -> Result<Value> {
        let wait_key = WaitKey::new(&self.run_id, key);
        if self.redelivery.as_ref().is_some_and(|r| r.key == key) {
            if let Some(delivered) = self.redelivery.take() {
                return delivered.payload.ok_or(WaypointError::Timeout {
                    wait_key: wait_key.to_string(),
                });
            }
        }

        let waits = self
            .waits
            .clone()
            .ok_or_else(|| WaypointError::Wait("no wait runtime configured".into()))?;
        if let Some(checkpoint) = &self.checkpoint {
            let mut state = checkpoint.state.clone();
            state.wait_key = Some(key.to_string());
            checkpoint.ledger.checkpoint(&self.run_id, state).await?;
        }

        let result = waits.wait_for_signal(&wait_key, deadline).await;

        if let Some(checkpoint) = &self.checkpoint {
            checkpoint.ledger.clear_checkpoint(&self.run_id).await?;
        }
        result
    }
}

/// A node implementation. The executor dispatches to it opaquely by
/// node id or `node_type` through the `NodeRegistry`.
///
/// Returning `Err` counts as a failed attempt, except for fatal errors
/// (`RecursionLimit`, `GraphStructure`), which end the run immediately.
pub trait NodeExecutor: Send + Sync + 'static {
    fn execute<'a>(&'a self, ctx: &'a mut NodeContext) -> BoxFuture<'a, Result<NodeResult>>;
}
