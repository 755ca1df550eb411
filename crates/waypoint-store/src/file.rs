//! File-backed run storage.
//!
//! ```text
//! <base>/
//! ├── runs/<run_id>.json
//! └── indexes/
//!     ├── by_goal/<goal_id>.json
//!     ├── by_status/<status>.json
//!     └── by_node/<node_id>.json
//! ```
//!
//! Every file is replaced atomically. Index files are JSON arrays of run ids;
//! their read-modify-write cycles run under one async mutex so concurrent
//! savers never lose an entry.

use std::path::{Path, PathBuf};

use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tracing::debug;

use waypoint_core::error::{Result, WaypointError};
use waypoint_core::traits::RunStorage;
use waypoint_core::types::{Run, RunId, RunStatus};

use crate::atomic::{read_optional, write_atomic};

#[derive(Debug, Clone, Copy)]
enum IndexKind {
    Goal,
    Status,
    Node,
}

impl IndexKind {
    fn dir(&self) -> &'static str {
        match self {
            Self::Goal => "by_goal",
            Self::Status => "by_status",
            Self::Node => "by_node",
        }
    }
}

pub struct FileRunStorage {
    base: PathBuf,
    index_lock: Mutex<()>,
}

impl FileRunStorage {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            index_lock: Mutex::new(()),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base
    }

    fn run_path(&self, run_id: &RunId) -> PathBuf {
        self.base
            .join("runs")
            .join(format!("{}.json", file_key(run_id.as_str())))
    }

    fn index_path(&self, kind: IndexKind, key: &str) -> PathBuf {
        self.base
            .join("indexes")
            .join(kind.dir())
            .join(format!("{}.json", file_key(key)))
    }

    async fn read_run(&self, run_id: &RunId) -> Result<Option<Run>> {
        match read_optional(&self.run_path(run_id)).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn read_index(&self, kind: IndexKind, key: &str) -> Result<Vec<RunId>> {
        match read_optional(&self.index_path(kind, key)).await? {
            Some(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                WaypointError::Persistence(format!("corrupt index {}/{}: {}", kind.dir(), key, e))
            }),
            None => Ok(vec![]),
        }
    }

    async fn write_index(&self, kind: IndexKind, key: &str, ids: &[RunId]) -> Result<()> {
        let data = serde_json::to_vec(ids)?;
        write_atomic(&self.index_path(kind, key), &data).await
    }

    /// Callers must hold `index_lock`.
    async fn index_add(&self, kind: IndexKind, key: &str, run_id: &RunId) -> Result<()> {
        let mut ids = self.read_index(kind, key).await?;
        if ids.contains(run_id) {
            return Ok(());
        }
        ids.push(run_id.clone());
        self.write_index(kind, key, &ids).await
    }

    /// Callers must hold `index_lock`.
    async fn index_remove(&self, kind: IndexKind, key: &str, run_id: &RunId) -> Result<()> {
        let mut ids = self.read_index(kind, key).await?;
        let before = ids.len();
        ids.retain(|id| id != run_id);
        if ids.len() == before {
            return Ok(());
        }
        self.write_index(kind, key, &ids).await
    }
}

impl RunStorage for FileRunStorage {
    fn save_run(&self, run: &Run) -> BoxFuture<'_, Result<()>> {
        let run = run.clone();
        Box::pin(async move {
            let _guard = self.index_lock.lock().await;
            let previous = self.read_run(&run.id).await?;

            let data = serde_json::to_vec_pretty(&run)?;
            write_atomic(&self.run_path(&run.id), &data).await?;

            self.index_add(IndexKind::Goal, &run.goal_id, &run.id).await?;

            if let Some(prev) = &previous {
                if prev.status != run.status {
                    self.index_remove(IndexKind::Status, prev.status.as_str(), &run.id)
                        .await?;
                }
                if prev.goal_id != run.goal_id {
                    self.index_remove(IndexKind::Goal, &prev.goal_id, &run.id).await?;
                }
            }
            self.index_add(IndexKind::Status, run.status.as_str(), &run.id)
                .await?;

            for node_id in run.nodes_touched() {
                self.index_add(IndexKind::Node, &node_id, &run.id).await?;
            }

            debug!(run_id = %run.id, status = %run.status, "Run saved");
            Ok(())
        })
    }

    fn load_run(&self, run_id: &RunId) -> BoxFuture<'_, Result<Option<Run>>> {
        let run_id = run_id.clone();
        Box::pin(async move { self.read_run(&run_id).await })
    }

    fn delete_run(&self, run_id: &RunId) -> BoxFuture<'_, Result<bool>> {
        let run_id = run_id.clone();
        Box::pin(async move {
            let _guard = self.index_lock.lock().await;
            let Some(run) = self.read_run(&run_id).await? else {
                return Ok(false);
            };

            self.index_remove(IndexKind::Goal, &run.goal_id, &run_id).await?;
            self.index_remove(IndexKind::Status, run.status.as_str(), &run_id)
                .await?;
            for node_id in run.nodes_touched() {
                self.index_remove(IndexKind::Node, &node_id, &run_id).await?;
            }

            match tokio::fs::remove_file(self.run_path(&run_id)).await {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
                Err(e) => Err(WaypointError::Persistence(format!("delete {}: {}", run_id, e))),
            }
        })
    }

    fn list_all_runs(&self) -> BoxFuture<'_, Result<Vec<RunId>>> {
        Box::pin(async move {
            let dir = self.base.join("runs");
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
                Err(e) => return Err(e.into()),
            };

            let mut ids = Vec::new();
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with('.') {
                    continue;
                }
                if let Some(stem) = name.strip_suffix(".json") {
                    ids.push(RunId::from_string(stem));
                }
            }
            ids.sort();
            Ok(ids)
        })
    }

    fn runs_by_goal(&self, goal_id: &str) -> BoxFuture<'_, Result<Vec<RunId>>> {
        let goal_id = goal_id.to_string();
        Box::pin(async move { self.read_index(IndexKind::Goal, &goal_id).await })
    }

    fn runs_by_status(&self, status: RunStatus) -> BoxFuture<'_, Result<Vec<RunId>>> {
        Box::pin(async move { self.read_index(IndexKind::Status, status.as_str()).await })
    }

    fn runs_by_node(&self, node_id: &str) -> BoxFuture<'_, Result<Vec<RunId>>> {
        let node_id = node_id.to_string();
        Box::pin(async move { self.read_index(IndexKind::Node, &node_id).await })
    }
}

/// Map an id to a safe file stem.
fn file_key(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect::<String>()
        .trim_start_matches('.')
        .to_string()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use chrono::Utc;
    use waypoint_core::types::{Decision, ProblemSeverity};

    use super::*;

    fn run(goal: &str) -> Run {
        Run::new(goal, "test", HashMap::new())
    }

    fn decided(mut run: Run, node: &str) -> Run {
        run.decisions.push(Decision {
            id: uuid::Uuid::new_v4().to_string(),
            node_id: node.into(),
            intent: "execute node".into(),
            options: vec![],
            chosen: node.into(),
            reasoning: String::new(),
            timestamp: Utc::now(),
            outcome: None,
        });
        run
    }

    #[tokio::test]
    async fn save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileRunStorage::new(dir.path());
        let r = decided(run("g1"), "a");

        storage.save_run(&r).await.unwrap();
        let loaded = storage.load_run(&r.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, r.id);
        assert_eq!(loaded.decisions.len(), 1);
        assert_eq!(storage.list_all_runs().await.unwrap(), vec![r.id.clone()]);
    }

    #[tokio::test]
    async fn absent_run_is_none_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileRunStorage::new(dir.path());
        let id = RunId::new();
        assert!(storage.load_run(&id).await.unwrap().is_none());
        assert!(!storage.delete_run(&id).await.unwrap());
        assert!(storage.list_all_runs().await.unwrap().is_empty());
        assert!(storage.runs_by_goal("nope").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn status_index_moves_run() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileRunStorage::new(dir.path());
        let mut r = run("g1");
        storage.save_run(&r).await.unwrap();
        assert_eq!(
            storage.runs_by_status(RunStatus::Running).await.unwrap(),
            vec![r.id.clone()]
        );

        r.status = RunStatus::Completed;
        storage.save_run(&r).await.unwrap();
        assert!(storage.runs_by_status(RunStatus::Running).await.unwrap().is_empty());
        assert_eq!(
            storage.runs_by_status(RunStatus::Completed).await.unwrap(),
            vec![r.id.clone()]
        );
    }

    #[tokio::test]
    async fn node_and_goal_indexes() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileRunStorage::new(dir.path());
        let r1 = decided(decided(run("g1"), "a"), "b");
        let r2 = decided(run("g2"), "b");
        storage.save_run(&r1).await.unwrap();
        storage.save_run(&r2).await.unwrap();

        assert_eq!(storage.runs_by_node("a").await.unwrap(), vec![r1.id.clone()]);
        assert_eq!(storage.runs_by_node("b").await.unwrap().len(), 2);
        assert_eq!(storage.runs_by_goal("g2").await.unwrap(), vec![r2.id.clone()]);

        assert!(storage.delete_run(&r1.id).await.unwrap());
        assert_eq!(storage.runs_by_node("b").await.unwrap(), vec![r2.id.clone()]);
        assert!(storage.runs_by_goal("g1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn problems_survive_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileRunStorage::new(dir.path());
        let mut r = run("g");
        r.problems.push(waypoint_core::types::Problem {
            id: "p1".into(),
            severity: ProblemSeverity::Critical,
            description: "boom".into(),
            node_id: Some("a".into()),
            decision_id: None,
            timestamp: Utc::now(),
        });
        storage.save_run(&r).await.unwrap();
        let loaded = storage.load_run(&r.id).await.unwrap().unwrap();
        assert_eq!(loaded.problems[0].severity, ProblemSeverity::Critical);
    }

    #[test]
    fn file_keys_are_sanitized() {
        assert_eq!(file_key("goal/with spaces"), "goal_with_spaces");
        assert_eq!(file_key("../etc"), "_etc");
    }
}
