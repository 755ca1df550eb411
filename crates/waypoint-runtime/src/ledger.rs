//! Run Ledger: the append-only record of each run's decisions and outcomes.
//!
//! Runs are addressed by explicit `RunId`, so any number of runs can be
//! recorded concurrently. Every mutation is persisted through the
//! `RunStorage` collaborator. A failed save never drops the run: it stays
//! resident and queryable with a failed-save marker until
//! `retry_failed_saves()` gets it to storage.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use waypoint_core::error::{Result, WaypointError};
use waypoint_core::event::{EventBus, RuntimeEvent};
use waypoint_core::goal::GoalEvaluation;
use waypoint_core::traits::RunStorage;
use waypoint_core::types::{
    Decision, DecisionOption, Outcome, Problem, ProblemSeverity, ResumePhase, ResumeState, Run,
    RunId, RunStatus,
};

/// Save sequencing for one run. `issued` counts snapshots taken; the async
/// mutex holds the newest revision written to storage.
#[derive(Default)]
struct SaveOrder {
    issued: u64,
    saved: Arc<AsyncMutex<u64>>,
}

struct SaveTicket {
    revision: u64,
    saved: Arc<AsyncMutex<u64>>,
}

#[derive(Default)]
struct LedgerState {
    runs: HashMap<RunId, Run>,
    current_node: HashMap<RunId, String>,
    failed_saves: HashSet<RunId>,
    save_order: HashMap<RunId, SaveOrder>,
}

impl LedgerState {
    /// Must be taken under the same lock hold as the snapshot it orders.
    fn ticket(&mut self, run_id: &RunId) -> SaveTicket {
        let order = self.save_order.entry(run_id.clone()).or_default();
        order.issued += 1;
        SaveTicket {
            revision: order.issued,
            saved: order.saved.clone(),
        }
    }
}

pub struct RunLedger {
    storage: Arc<dyn RunStorage>,
    events: Option<Arc<EventBus>>,
    state: Mutex<LedgerState>,
}

impl RunLedger {
    pub fn new(storage: Arc<dyn RunStorage>) -> Self {
        Self {
            storage,
            events: None,
            state: Mutex::new(LedgerState::default()),
        }
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn storage(&self) -> &Arc<dyn RunStorage> {
        &self.storage
    }

    fn lock(&self) -> Result<MutexGuard<'_, LedgerState>> {
        self.state
            .lock()
            .map_err(|e| WaypointError::Persistence(format!("ledger lock poisoned: {}", e)))
    }

    fn publish(&self, event: RuntimeEvent) {
        if let Some(bus) = &self.events {
            bus.publish(event);
        }
    }

    /// Apply `f` to a resident run and persist the result. Nothing is
    /// persisted when `f` fails.
    async fn mutate<T>(
        &self,
        run_id: &RunId,
        f: impl FnOnce(&mut Run, &mut LedgerState) -> Result<T>,
    ) -> Result<T> {
        let (value, snapshot, ticket) = {
            let mut state = self.lock()?;
            let mut run = state
                .runs
                .remove(run_id)
                .ok_or_else(|| WaypointError::NoActiveRun(run_id.to_string()))?;
            let outcome = f(&mut run, &mut *state);
            let snapshot = run.clone();
            state.runs.insert(run_id.clone(), run);
            let value = outcome?;
            (value, snapshot, state.ticket(run_id))
        };
        self.persist(snapshot, ticket).await;
        Ok(value)
    }

    /// Write a snapshot unless a newer one of the same run already landed.
    /// Saves of one run are serialized, so storage only ever moves forward.
    async fn persist(&self, run: Run, ticket: SaveTicket) {
        let mut saved = ticket.saved.lock().await;
        if *saved >= ticket.revision {
            debug!(run_id = %run.id, revision = ticket.revision, stored = *saved, "Stale run snapshot skipped");
        } else {
            match self.storage.save_run(&run).await {
                Ok(()) => {
                    *saved = ticket.revision;
                    if let Ok(mut state) = self.lock() {
                        state.failed_saves.remove(&run.id);
                        let resident_finished = state
                            .runs
                            .get(&run.id)
                            .map_or(false, |r| r.status.is_finished());
                        if run.status.is_finished() && resident_finished {
                            state.runs.remove(&run.id);
                            state.current_node.remove(&run.id);
                            debug!(run_id = %run.id, "Finished run evicted from ledger");
                        }
                    }
                }
                Err(e) => {
                    warn!(run_id = %run.id, error = %e, "Run save failed, keeping run resident");
                    if let Ok(mut state) = self.lock() {
                        state.failed_saves.insert(run.id.clone());
                    }
                    self.publish(RuntimeEvent::PersistenceFailed {
                        run_id: run.id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }
        drop(saved);
        self.release(&run.id, &ticket.saved);
    }

    /// Drop the save sequencing of an evicted run once no save is in flight.
    fn release(&self, run_id: &RunId, saved: &Arc<AsyncMutex<u64>>) {
        if let Ok(mut state) = self.lock() {
            let idle = !state.runs.contains_key(run_id)
                && state.save_order.get(run_id).map_or(false, |o| {
                    Arc::ptr_eq(&o.saved, saved) && Arc::strong_count(saved) == 2
                });
            if idle {
                state.save_order.remove(run_id);
            }
        }
    }

    pub async fn start_run(
        &self,
        goal_id: &str,
        description: &str,
        input: HashMap<String, serde_json::Value>,
    ) -> Result<RunId> {
        let run = Run::new(goal_id, description, input);
        let run_id = run.id.clone();
        let ticket = {
            let mut state = self.lock()?;
            state.runs.insert(run_id.clone(), run.clone());
            state.ticket(&run_id)
        };
        info!(run_id = %run_id, goal_id, "Run started");
        self.persist(run, ticket).await;
        Ok(run_id)
    }

    /// Set the node that subsequent `decide` calls are attributed to.
    pub fn set_node(&self, run_id: &RunId, node_id: &str) -> Result<()> {
        let mut state = self.lock()?;
        match state.runs.get(run_id) {
            Some(run) if run.status == RunStatus::Running => {}
            _ => return Err(WaypointError::NoActiveRun(run_id.to_string())),
        }
        state
            .current_node
            .insert(run_id.clone(), node_id.to_string());
        Ok(())
    }

    /// Record a decision at the current node. Fails unless the run is active.
    pub async fn decide(
        &self,
        run_id: &RunId,
        intent: &str,
        options: Vec<DecisionOption>,
        chosen: &str,
        reasoning: &str,
    ) -> Result<String> {
        let decision = self
            .mutate(run_id, |run, state| {
                if run.status != RunStatus::Running {
                    return Err(WaypointError::NoActiveRun(run_id.to_string()));
                }
                let decision = Decision {
                    id: uuid::Uuid::new_v4().to_string(),
                    node_id: state.current_node.get(run_id).cloned().unwrap_or_default(),
                    intent: intent.to_string(),
                    options,
                    chosen: chosen.to_string(),
                    reasoning: reasoning.to_string(),
                    timestamp: Utc::now(),
                    outcome: None,
                };
                run.metrics.total_decisions += 1;
                run.decisions.push(decision.clone());
                Ok(decision)
            })
            .await?;

        self.publish(RuntimeEvent::DecisionRecorded {
            run_id: run_id.clone(),
            decision_id: decision.id.clone(),
            node_id: decision.node_id.clone(),
            chosen: decision.chosen.clone(),
        });
        Ok(decision.id)
    }

    /// Attach the outcome of a decision. A second call for the same decision
    /// is rejected with `OutcomeAlreadyRecorded` and changes nothing.
    pub async fn record_outcome(
        &self,
        run_id: &RunId,
        decision_id: &str,
        outcome: Outcome,
    ) -> Result<()> {
        self.mutate(run_id, |run, _| {
            let decision = run
                .decisions
                .iter_mut()
                .find(|d| d.id == decision_id)
                .ok_or_else(|| WaypointError::DecisionNotFound(decision_id.to_string()))?;
            if decision.outcome.is_some() {
                return Err(WaypointError::OutcomeAlreadyRecorded(decision_id.to_string()));
            }

            let node_id = decision.node_id.clone();
            let metrics = &mut run.metrics;
            metrics.total_tokens += outcome.tokens_used;
            if outcome.success {
                metrics.successful_decisions += 1;
                if !node_id.is_empty() {
                    metrics.nodes_executed.push(node_id);
                }
            } else {
                metrics.failed_decisions += 1;
            }
            decision.outcome = Some(outcome);
            Ok(())
        })
        .await
    }

    pub async fn report_problem(
        &self,
        run_id: &RunId,
        severity: ProblemSeverity,
        description: &str,
        node_id: Option<&str>,
        decision_id: Option<&str>,
    ) -> Result<String> {
        let problem = Problem {
            id: uuid::Uuid::new_v4().to_string(),
            severity,
            description: description.to_string(),
            node_id: node_id.map(String::from),
            decision_id: decision_id.map(String::from),
            timestamp: Utc::now(),
        };
        let problem_id = problem.id.clone();
        self.mutate(run_id, |run, _| {
            run.problems.push(problem);
            Ok(())
        })
        .await?;

        warn!(run_id = %run_id, problem_id = %problem_id, severity = ?severity, "{}", description);
        self.publish(RuntimeEvent::ProblemReported {
            run_id: run_id.clone(),
            problem_id: problem_id.clone(),
            description: description.to_string(),
        });
        Ok(problem_id)
    }

    pub async fn set_evaluation(&self, run_id: &RunId, evaluation: GoalEvaluation) -> Result<()> {
        self.mutate(run_id, |run, _| {
            run.evaluation = Some(evaluation);
            Ok(())
        })
        .await
    }

    pub async fn pause_run(
        &self,
        run_id: &RunId,
        paused_at: &str,
        resume_state: ResumeState,
    ) -> Result<()> {
        self.mutate(run_id, |run, _| {
            if run.status != RunStatus::Running {
                return Err(WaypointError::NoActiveRun(run_id.to_string()));
            }
            run.status = RunStatus::Paused;
            run.paused_at = Some(paused_at.to_string());
            run.resume_state = Some(resume_state);
            Ok(())
        })
        .await?;
        info!(run_id = %run_id, paused_at, "Run paused");
        Ok(())
    }

    /// Store an executor checkpoint on a running run without pausing it.
    pub async fn checkpoint(&self, run_id: &RunId, resume_state: ResumeState) -> Result<()> {
        self.mutate(run_id, |run, _| {
            if run.status != RunStatus::Running {
                return Err(WaypointError::NoActiveRun(run_id.to_string()));
            }
            run.resume_state = Some(resume_state);
            Ok(())
        })
        .await
    }

    pub async fn clear_checkpoint(&self, run_id: &RunId) -> Result<()> {
        self.mutate(run_id, |run, _| {
            run.resume_state = None;
            Ok(())
        })
        .await
    }

    /// Take over a paused run (or one suspended on a durable wait) and hand
    /// back its checkpoint. The run is `Running` afterwards.
    ///
    /// Loads the run from storage if this process has never seen it, so a
    /// run suspended by an earlier process can be resumed.
    pub async fn resume_run(&self, run_id: &RunId) -> Result<Run> {
        let resident = self.lock()?.runs.contains_key(run_id);
        if !resident {
            let run = self
                .storage
                .load_run(run_id)
                .await?
                .ok_or_else(|| WaypointError::RunNotFound(run_id.to_string()))?;
            self.lock()?.runs.entry(run_id.clone()).or_insert(run);
        }

        let resumed = self
            .mutate(run_id, |run, _| {
                let awaiting_signal = run.status == RunStatus::Running
                    && run
                        .resume_state
                        .as_ref()
                        .map_or(false, |s| s.phase == ResumePhase::AwaitingSignal);
                if run.status != RunStatus::Paused && !awaiting_signal {
                    return Err(WaypointError::NotPaused {
                        run_id: run_id.to_string(),
                        status: run.status.to_string(),
                    });
                }
                let snapshot = run.clone();
                run.status = RunStatus::Running;
                run.paused_at = None;
                run.resume_state = None;
                Ok(snapshot)
            })
            .await;

        if let Err(WaypointError::NotPaused { .. }) = &resumed {
            // Do not keep a finished run resident just because someone tried
            // to resume it.
            let mut state = self.lock()?;
            let finished_and_saved = state
                .runs
                .get(run_id)
                .map(|r| r.status.is_finished())
                .unwrap_or(false)
                && !state.failed_saves.contains(run_id);
            if finished_and_saved {
                state.runs.remove(run_id);
            }
        }
        resumed
    }

    /// Close a run. Returns the final record.
    pub async fn end_run(
        &self,
        run_id: &RunId,
        success: bool,
        output: HashMap<String, serde_json::Value>,
    ) -> Result<Run> {
        let run = self
            .mutate(run_id, |run, _| {
                if run.status.is_finished() {
                    return Err(WaypointError::NoActiveRun(run_id.to_string()));
                }
                run.status = if success {
                    RunStatus::Completed
                } else {
                    RunStatus::Failed
                };
                run.completed_at = Some(Utc::now());
                run.output_data = output;
                run.paused_at = None;
                run.resume_state = None;
                Ok(run.clone())
            })
            .await?;
        info!(run_id = %run_id, status = %run.status, decisions = run.decisions.len(), "Run ended");
        Ok(run)
    }

    /// The in-memory copy if resident, otherwise whatever storage has.
    pub async fn get_run(&self, run_id: &RunId) -> Result<Option<Run>> {
        let resident = self.lock()?.runs.get(run_id).cloned();
        if let Some(run) = resident {
            return Ok(Some(run));
        }
        self.storage.load_run(run_id).await
    }

    pub fn is_save_failed(&self, run_id: &RunId) -> bool {
        self.lock()
            .map(|s| s.failed_saves.contains(run_id))
            .unwrap_or(false)
    }

    pub fn failed_saves(&self) -> Vec<RunId> {
        self.lock()
            .map(|s| s.failed_saves.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn active_runs(&self) -> Vec<RunId> {
        self.lock()
            .map(|s| {
                s.runs
                    .values()
                    .filter(|r| !r.status.is_finished())
                    .map(|r| r.id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Re-save every run with a failed-save marker. Returns how many made it.
    pub async fn retry_failed_saves(&self) -> Result<usize> {
        let pending: Vec<(Run, SaveTicket)> = {
            let mut state = self.lock()?;
            let runs: Vec<Run> = state
                .failed_saves
                .iter()
                .filter_map(|id| state.runs.get(id).cloned())
                .collect();
            runs.into_iter()
                .map(|run| {
                    let ticket = state.ticket(&run.id);
                    (run, ticket)
                })
                .collect()
        };

        let mut recovered = 0;
        for (run, ticket) in pending {
            let run_id = run.id.clone();
            self.persist(run, ticket).await;
            if !self.is_save_failed(&run_id) {
                recovered += 1;
            }
        }
        if recovered > 0 {
            info!(recovered, "Recovered failed run saves");
        }
        Ok(recovered)
    }
}
