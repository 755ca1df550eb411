//! Drives many runs of one workflow concurrently, each on its own tokio task.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use waypoint_core::error::Result;
use waypoint_core::goal::Goal;
use waypoint_core::types::RunId;
use waypoint_core::wait::{ResumeReason, Resumption, SignalOutcome, WaitKey};

use crate::evolution::EvolutionGuard;
use crate::graph::{ExecutionResult, GraphExecutor, RunRequest};
use crate::wait::DurableWaitRuntime;

/// Ties the live graph (behind its Evolution Guard) to an executor and a
/// wait runtime.
///
/// Each run captures the graph that was live when it started or resumed,
/// so an applied evolution only affects later runs and resumptions.
pub struct WorkflowRuntime {
    guard: Arc<EvolutionGuard>,
    goal: Arc<Goal>,
    executor: Arc<GraphExecutor>,
    waits: Arc<DurableWaitRuntime>,
}

impl WorkflowRuntime {
    /// `executor` should be wired to the same `waits` so HITL pauses
    /// register their approval waits.
    pub fn new(
        guard: Arc<EvolutionGuard>,
        goal: Goal,
        executor: Arc<GraphExecutor>,
        waits: Arc<DurableWaitRuntime>,
    ) -> Self {
        Self {
            guard,
            goal: Arc::new(goal),
            executor,
            waits,
        }
    }

    pub fn guard(&self) -> &Arc<EvolutionGuard> {
        &self.guard
    }

    pub fn executor(&self) -> &Arc<GraphExecutor> {
        &self.executor
    }

    pub fn waits(&self) -> &Arc<DurableWaitRuntime> {
        &self.waits
    }

    /// Run to completion (or pause) on the current task.
    pub async fn run(&self, request: RunRequest) -> Result<ExecutionResult> {
        let graph = self.guard.current();
        self.executor.execute(&graph, &self.goal, request).await
    }

    /// Spawn a run on its own task.
    pub fn start(&self, request: RunRequest) -> JoinHandle<Result<ExecutionResult>> {
        let graph = self.guard.current();
        let goal = self.goal.clone();
        let executor = self.executor.clone();
        tokio::spawn(async move { executor.execute(&graph, &goal, request).await })
    }

    pub async fn resume(&self, run_id: &RunId, payload: Option<Value>) -> Result<ExecutionResult> {
        let graph = self.guard.current();
        self.executor.resume(&graph, &self.goal, run_id, payload).await
    }

    pub fn signal(&self, run_id: &RunId, key: &str, payload: Value) -> Result<SignalOutcome> {
        self.waits.signal(&WaitKey::new(run_id, key), payload)
    }

    /// Signal the approval wait of a run paused at HITL node `node_id`.
    pub fn approve(&self, run_id: &RunId, node_id: &str, payload: Value) -> Result<SignalOutcome> {
        self.waits.signal(&WaitKey::approval(run_id, node_id), payload)
    }

    /// Tick the wait runtime once and resume every run whose resumption had
    /// no in-process waiter. Resumes run concurrently.
    pub async fn pump(&self) -> Result<Vec<(RunId, Result<ExecutionResult>)>> {
        let resumptions = self.waits.tick(Utc::now())?;
        let handles: Vec<_> = resumptions
            .into_iter()
            .filter(|r| !r.delivered)
            .map(|r| {
                let run_id = r.run_id().clone();
                (run_id, self.spawn_resume(r))
            })
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for (run_id, handle) in handles {
            let result = match handle.await {
                Ok(r) => r,
                Err(e) => Err(waypoint_core::error::WaypointError::node(
                    run_id.to_string(),
                    format!("resume task panicked: {}", e),
                )),
            };
            if let Err(e) = &result {
                warn!(run_id = %run_id, error = %e, "Resumption failed");
            }
            results.push((run_id, result));
        }
        Ok(results)
    }

    fn spawn_resume(&self, resumption: Resumption) -> JoinHandle<Result<ExecutionResult>> {
        let graph = self.guard.current();
        let goal = self.goal.clone();
        let executor = self.executor.clone();
        tokio::spawn(async move {
            let run_id = resumption.run_id().clone();
            let payload = match resumption.reason {
                ResumeReason::Signalled(payload) => Some(payload),
                ResumeReason::TimedOut => None,
            };
            executor.resume(&graph, &goal, &run_id, payload).await
        })
    }

    /// Background driver: ticks the wait runtime every `interval` and resumes
    /// paused runs as their signals arrive, until cancelled.
    pub fn spawn_background(&self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Resumption>();
        let ticker = tokio::spawn(self.waits.clone().run_ticker(interval, cancel.clone(), Some(tx)));

        let guard = self.guard.clone();
        let goal = self.goal.clone();
        let executor = self.executor.clone();
        tokio::spawn(async move {
            info!(interval_ms = interval.as_millis() as u64, "Workflow runtime background driver started");
            // The ticker owns the sender; the receiver closes once it stops.
            while let Some(resumption) = rx.recv().await {
                let graph = guard.current();
                let goal = goal.clone();
                let executor = executor.clone();
                tokio::spawn(async move {
                    let run_id = resumption.run_id().clone();
                    let payload = match resumption.reason {
                        ResumeReason::Signalled(payload) => Some(payload),
                        ResumeReason::TimedOut => None,
                    };
                    match executor.resume(&graph, &goal, &run_id, payload).await {
                        Ok(result) => {
                            info!(run_id = %run_id, status = ?result.status, "Background resume finished")
                        }
                        Err(e) => warn!(run_id = %run_id, error = %e, "Background resume failed"),
                    }
                });
            }
            ticker.await.ok();
        })
    }
}
