//! Evolution Guard: gated replacement of the live graph.
//!
//! Every `update_graph` call walks snapshot, probation and approval, then
//! either swaps the live pointer to the candidate or rolls back to the
//! snapshot. Each call leaves exactly one audit entry.

pub mod probation;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use tracing::{info, warn};

use waypoint_core::error::{Result, WaypointError};
use waypoint_core::event::{EventBus, RuntimeEvent};
use waypoint_core::evolution::{AuditEntry, EvolutionDecision, GraphDelta, ValidationResult};
use waypoint_core::graph::GraphSpec;
use waypoint_core::traits::RuntimeLogStore;

pub use probation::{ExecutorProbation, ProbationRunner};

const DEFAULT_PROBATION_STEPS: usize = 50;

pub struct EvolutionGuard {
    live: RwLock<Arc<GraphSpec>>,
    snapshots: Mutex<HashMap<String, Arc<GraphSpec>>>,
    /// Serializes `update_graph` calls.
    update_lock: tokio::sync::Mutex<()>,
    probation: Arc<dyn ProbationRunner>,
    probation_steps: usize,
    audit: Mutex<Vec<AuditEntry>>,
    log_store: Option<Arc<dyn RuntimeLogStore>>,
    events: Option<Arc<EventBus>>,
}

impl EvolutionGuard {
    pub fn new(graph: GraphSpec, probation: Arc<dyn ProbationRunner>) -> Self {
        Self {
            live: RwLock::new(Arc::new(graph)),
            snapshots: Mutex::new(HashMap::new()),
            update_lock: tokio::sync::Mutex::new(()),
            probation,
            probation_steps: DEFAULT_PROBATION_STEPS,
            audit: Mutex::new(Vec::new()),
            log_store: None,
            events: None,
        }
    }

    pub fn with_probation_steps(mut self, steps: usize) -> Self {
        self.probation_steps = steps;
        self
    }

    pub fn with_log_store(mut self, store: Arc<dyn RuntimeLogStore>) -> Self {
        self.log_store = Some(store);
        self
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// The live graph. Callers keep the returned `Arc` for the whole run, so
    /// a swap never changes a graph mid-traversal.
    pub fn current(&self) -> Arc<GraphSpec> {
        match self.live.read() {
            Ok(g) => g.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_live(&self, graph: Arc<GraphSpec>) {
        match self.live.write() {
            Ok(mut g) => *g = graph,
            Err(poisoned) => *poisoned.into_inner() = graph,
        }
    }

    fn snapshots(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Arc<GraphSpec>>>> {
        self.snapshots
            .lock()
            .map_err(|e| WaypointError::Persistence(format!("snapshot table poisoned: {}", e)))
    }

    /// Record the live graph. A reference copy; graphs are immutable.
    pub fn snapshot(&self) -> Result<String> {
        let id = format!("snap_{}", uuid::Uuid::new_v4());
        let graph = self.current();
        self.snapshots()?.insert(id.clone(), graph);
        Ok(id)
    }

    fn snapshot_graph(&self, snapshot_id: &str) -> Result<Arc<GraphSpec>> {
        self.snapshots()?
            .get(snapshot_id)
            .cloned()
            .ok_or_else(|| WaypointError::SnapshotNotFound(snapshot_id.to_string()))
    }

    /// Trial-run `candidate` against the snapshot it would replace.
    pub async fn probation_run(
        &self,
        snapshot_id: &str,
        candidate: &GraphSpec,
        steps: usize,
    ) -> Result<ValidationResult> {
        let baseline = self.snapshot_graph(snapshot_id)?;
        if candidate.id != baseline.id {
            return Ok(ValidationResult::rejected(format!(
                "candidate graph '{}' does not replace '{}'",
                candidate.id, baseline.id
            )));
        }
        self.probation
            .probation_run(&baseline, candidate, steps)
            .await
    }

    pub fn approve(result: &ValidationResult) -> bool {
        result.passed
    }

    /// Restore the live graph to a snapshot.
    pub fn rollback(&self, snapshot_id: &str) -> Result<()> {
        let graph = self.snapshot_graph(snapshot_id)?;
        self.set_live(graph);
        Ok(())
    }

    /// Gate `candidate` and apply it only if probation passes.
    ///
    /// Returns the audit entry recorded for this call. Errors raised by
    /// probation become a rejection rather than an `Err`.
    pub async fn update_graph(
        &self,
        candidate: GraphSpec,
        correlation_id: &str,
    ) -> Result<AuditEntry> {
        let _serial = self.update_lock.lock().await;

        let snapshot_id = self.snapshot()?;
        let from_version = self.current().version;

        let result = match self
            .probation_run(&snapshot_id, &candidate, self.probation_steps)
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!(correlation_id, error = %e, "Probation errored");
                ValidationResult::rejected(e.to_string())
            }
        };

        let graph_id = candidate.id.clone();
        let candidate_version = candidate.version;
        let decision = if Self::approve(&result) {
            self.set_live(Arc::new(candidate));
            EvolutionDecision::Applied
        } else {
            self.rollback(&snapshot_id)?;
            EvolutionDecision::Rejected
        };
        self.snapshots()?.remove(&snapshot_id);

        let entry = AuditEntry {
            correlation_id: correlation_id.to_string(),
            snapshot_id: snapshot_id.clone(),
            decision,
            violations: result.violations.clone(),
            graph_id: graph_id.clone(),
            from_version,
            candidate_version,
            metrics: result.metrics,
            timestamp: Utc::now(),
        };
        self.record(&entry).await;

        match decision {
            EvolutionDecision::Applied => {
                info!(correlation_id, graph_id = %graph_id, version = candidate_version, "Graph evolution applied");
                self.publish(RuntimeEvent::GraphEvolutionApplied {
                    correlation_id: correlation_id.to_string(),
                    snapshot_id,
                    graph_id,
                    version: candidate_version,
                });
            }
            EvolutionDecision::Rejected => {
                warn!(correlation_id, graph_id = %graph_id, violations = ?entry.violations, "Graph evolution rejected");
                self.publish(RuntimeEvent::GraphEvolutionRejected {
                    correlation_id: correlation_id.to_string(),
                    snapshot_id,
                    graph_id,
                    violations: entry.violations.clone(),
                });
            }
        }
        Ok(entry)
    }

    /// Build a candidate from `delta` against the live graph and gate it.
    /// A delta that does not apply is returned as `InvalidDelta` without an
    /// audit entry, since no update was attempted.
    pub async fn propose(&self, delta: &GraphDelta, correlation_id: &str) -> Result<AuditEntry> {
        let candidate = delta.apply_to(&self.current())?;
        self.update_graph(candidate, correlation_id).await
    }

    pub fn audit_log(&self) -> Vec<AuditEntry> {
        match self.audit.lock() {
            Ok(log) => log.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    async fn record(&self, entry: &AuditEntry) {
        match self.audit.lock() {
            Ok(mut log) => log.push(entry.clone()),
            Err(poisoned) => poisoned.into_inner().push(entry.clone()),
        }
        if let Some(store) = &self.log_store {
            if let Err(e) = store.write(entry).await {
                warn!(correlation_id = %entry.correlation_id, error = %e, "Failed to persist audit entry");
            }
        }
    }

    fn publish(&self, event: RuntimeEvent) {
        if let Some(bus) = &self.events {
            bus.publish(event);
        }
    }
}
