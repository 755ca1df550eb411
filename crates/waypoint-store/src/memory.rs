use std::collections::BTreeMap;
use std::sync::Mutex;

use futures::future::BoxFuture;

use waypoint_core::error::{Result, WaypointError};
use waypoint_core::traits::RunStorage;
use waypoint_core::types::{Run, RunId, RunStatus};

/// Process-local run storage. Used by tests and probation runs, where
/// nothing may leak into durable state.
#[derive(Default)]
pub struct InMemoryRunStorage {
    runs: Mutex<BTreeMap<RunId, Run>>,
}

impl InMemoryRunStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.runs.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn select(&self, pred: impl Fn(&Run) -> bool) -> Result<Vec<RunId>> {
        let runs = self
            .runs
            .lock()
            .map_err(|e| WaypointError::Persistence(e.to_string()))?;
        Ok(runs
            .values()
            .filter(|r| pred(r))
            .map(|r| r.id.clone())
            .collect())
    }
}

impl RunStorage for InMemoryRunStorage {
    fn save_run(&self, run: &Run) -> BoxFuture<'_, Result<()>> {
        let run = run.clone();
        Box::pin(async move {
            self.runs
                .lock()
                .map_err(|e| WaypointError::Persistence(e.to_string()))?
                .insert(run.id.clone(), run);
            Ok(())
        })
    }

    fn load_run(&self, run_id: &RunId) -> BoxFuture<'_, Result<Option<Run>>> {
        let run_id = run_id.clone();
        Box::pin(async move {
            let runs = self
                .runs
                .lock()
                .map_err(|e| WaypointError::Persistence(e.to_string()))?;
            Ok(runs.get(&run_id).cloned())
        })
    }

    fn delete_run(&self, run_id: &RunId) -> BoxFuture<'_, Result<bool>> {
        let run_id = run_id.clone();
        Box::pin(async move {
            let mut runs = self
                .runs
                .lock()
                .map_err(|e| WaypointError::Persistence(e.to_string()))?;
            Ok(runs.remove(&run_id).is_some())
        })
    }

    fn list_all_runs(&self) -> BoxFuture<'_, Result<Vec<RunId>>> {
        Box::pin(async move { self.select(|_| true) })
    }

    fn runs_by_goal(&self, goal_id: &str) -> BoxFuture<'_, Result<Vec<RunId>>> {
        let goal_id = goal_id.to_string();
        Box::pin(async move { self.select(|r| r.goal_id == goal_id) })
    }

    fn runs_by_status(&self, status: RunStatus) -> BoxFuture<'_, Result<Vec<RunId>>> {
        Box::pin(async move { self.select(|r| r.status == status) })
    }

    fn runs_by_node(&self, node_id: &str) -> BoxFuture<'_, Result<Vec<RunId>>> {
        let node_id = node_id.to_string();
        Box::pin(async move { self.select(|r| r.decisions.iter().any(|d| d.node_id == node_id)) })
    }
}
