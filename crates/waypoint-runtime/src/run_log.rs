use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use waypoint_core::config::AppConfig;
use waypoint_core::event::{EventBus, RuntimeEvent};
use waypoint_core::types::RunId;

/// JSONL event journal.
///
/// Subscribes to the EventBus and appends one JSON object per line to
/// `{log_dir}/{run_id}.jsonl`. Lines are flushed as they are written, so a
/// crash loses at most the event in flight. A file stays open only while its
/// run is executing.
pub struct EventJournal {
    log_dir: PathBuf,
    level: u8,
}

#[derive(Serialize)]
struct JournalEntry<'a> {
    timestamp: String,
    run_id: &'a str,
    event_type: &'a str,
    detail: &'a serde_json::Value,
}

impl EventJournal {
    /// `level` controls verbosity: 1 = run lifecycle, 2 = + node lifecycle,
    /// 3 = + decisions, edges and waits.
    pub fn new(log_dir: impl Into<PathBuf>, level: u8) -> Self {
        Self {
            log_dir: log_dir.into(),
            level,
        }
    }

    /// `None` when logging is disabled.
    pub fn from_config(config: &AppConfig) -> Option<Self> {
        let log = config.log.clone().unwrap_or_default();
        if !log.enabled {
            return None;
        }
        Some(Self::new(config.log_dir(), log.level))
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    pub fn path_for(&self, run_id: &RunId) -> PathBuf {
        self.log_dir.join(format!("{}.jsonl", run_id))
    }

    /// Minimum level at which an event is journaled. Events without a run
    /// (graph evolution) are not journaled; they have their own audit log.
    fn event_level(event: &RuntimeEvent) -> Option<u8> {
        match event {
            RuntimeEvent::RunStarted { .. }
            | RuntimeEvent::RunCompleted { .. }
            | RuntimeEvent::RunFailed { .. }
            | RuntimeEvent::RunPaused { .. }
            | RuntimeEvent::RunResumed { .. }
            | RuntimeEvent::ProblemReported { .. }
            | RuntimeEvent::PersistenceFailed { .. } => Some(1),
            RuntimeEvent::NodeStart { .. }
            | RuntimeEvent::NodeComplete { .. }
            | RuntimeEvent::NodeError { .. } => Some(2),
            RuntimeEvent::DecisionRecorded { .. }
            | RuntimeEvent::EdgeTraversed { .. }
            | RuntimeEvent::WaitRegistered { .. }
            | RuntimeEvent::WaitResumed { .. } => Some(3),
            RuntimeEvent::GraphEvolutionApplied { .. }
            | RuntimeEvent::GraphEvolutionRejected { .. } => None,
        }
    }

    fn accepts(&self, event: &RuntimeEvent) -> bool {
        Self::event_level(event).is_some_and(|l| l <= self.level)
    }

    /// Subscribe now and journal on a background task until cancelled.
    ///
    /// Events already queued when cancellation arrives are still written.
    pub fn start(self, event_bus: Arc<EventBus>, cancel: CancellationToken) -> JoinHandle<()> {
        let (sub, rx) = event_bus.subscribe_channel(&[]);
        tokio::spawn(async move {
            self.run(rx, cancel).await;
            event_bus.unsubscribe(sub);
        })
    }

    async fn run(self, mut rx: mpsc::UnboundedReceiver<RuntimeEvent>, cancel: CancellationToken) {
        if let Err(e) = tokio::fs::create_dir_all(&self.log_dir).await {
            error!(error = %e, "Failed to create journal directory");
            return;
        }
        info!(dir = %self.log_dir.display(), level = self.level, "EventJournal started");

        let mut writers: HashMap<RunId, BufWriter<File>> = HashMap::new();
        loop {
            tokio::select! {
                biased;
                event = rx.recv() => {
                    let Some(event) = event else {
                        debug!("EventBus closed, EventJournal stopping");
                        break;
                    };
                    self.write_event(&mut writers, &event).await;
                }
                _ = cancel.cancelled() => {
                    debug!("EventJournal cancelled");
                    break;
                }
            }
        }

        for (_, mut writer) in writers {
            writer.flush().await.ok();
        }
        debug!("EventJournal finished");
    }

    async fn write_event(&self, writers: &mut HashMap<RunId, BufWriter<File>>, event: &RuntimeEvent) {
        if !self.accepts(event) {
            return;
        }
        let Some(run_id) = event.run_id().cloned() else {
            return;
        };

        let detail = match serde_json::to_value(event) {
            Ok(v) => v,
            Err(e) => {
                error!(error = %e, "Failed to serialize event");
                return;
            }
        };
        let event_type = detail.get("type").and_then(|t| t.as_str()).unwrap_or("unknown");
        let entry = JournalEntry {
            timestamp: Utc::now().to_rfc3339(),
            run_id: run_id.as_str(),
            event_type,
            detail: &detail,
        };
        let Ok(json) = serde_json::to_string(&entry) else {
            return;
        };

        if !writers.contains_key(&run_id) {
            let path = self.path_for(&run_id);
            match tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
            {
                Ok(f) => {
                    writers.insert(run_id.clone(), BufWriter::new(f));
                }
                Err(e) => {
                    error!(error = %e, path = %path.display(), "Failed to open journal file");
                    return;
                }
            }
        }

        if let Some(writer) = writers.get_mut(&run_id) {
            let line = format!("{}\n", json);
            if let Err(e) = writer.write_all(line.as_bytes()).await {
                error!(run_id = %run_id, error = %e, "Failed to write journal entry");
            } else if let Err(e) = writer.flush().await {
                error!(run_id = %run_id, error = %e, "Failed to flush journal");
            }
        }

        // Finished and paused runs release their file. A resumed run reopens
        // it in append mode.
        if matches!(
            event,
            RuntimeEvent::RunCompleted { .. }
                | RuntimeEvent::RunFailed { .. }
                | RuntimeEvent::RunPaused { .. }
        ) {
            writers.remove(&run_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(path: &Path) -> Vec<serde_json::Value> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    fn lifecycle(run_id: &RunId) -> Vec<RuntimeEvent> {
        vec![
            RuntimeEvent::RunStarted {
                run_id: run_id.clone(),
                goal_id: "g".into(),
                graph_id: "graph".into(),
            },
            RuntimeEvent::NodeStart {
                run_id: run_id.clone(),
                node_id: "a".into(),
                attempt: 1,
                visit: 1,
            },
            RuntimeEvent::EdgeTraversed {
                run_id: run_id.clone(),
                edge_id: "a->b".into(),
                source: "a".into(),
                target: "b".into(),
            },
            RuntimeEvent::RunCompleted {
                run_id: run_id.clone(),
                steps: 2,
                latency_ms: 3,
            },
        ]
    }

    #[tokio::test]
    async fn level_two_skips_edges() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(EventBus::new());
        let cancel = CancellationToken::new();
        let journal = EventJournal::new(dir.path(), 2);
        let run_id = RunId::new();
        let path = journal.path_for(&run_id);
        let handle = journal.start(bus.clone(), cancel.clone());

        for event in lifecycle(&run_id) {
            bus.publish(event);
        }
        bus.publish(RuntimeEvent::GraphEvolutionRejected {
            correlation_id: "c".into(),
            snapshot_id: "s".into(),
            graph_id: "graph".into(),
            violations: vec![],
        });
        cancel.cancel();
        handle.await.unwrap();

        let types: Vec<String> = lines(&path)
            .iter()
            .map(|l| l["event_type"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(types, vec!["run_started", "node_start", "run_completed"]);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn level_one_is_lifecycle_only() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(EventBus::new());
        let cancel = CancellationToken::new();
        let journal = EventJournal::new(dir.path(), 1);
        let run_id = RunId::new();
        let path = journal.path_for(&run_id);
        let handle = journal.start(bus.clone(), cancel.clone());

        for event in lifecycle(&run_id) {
            bus.publish(event);
        }
        cancel.cancel();
        handle.await.unwrap();

        let entries = lines(&path);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["run_id"], run_id.as_str());
        assert_eq!(entries[1]["detail"]["steps"], 2);
    }

    #[tokio::test]
    async fn paused_run_releases_its_file_and_appends_on_resume() {
        let dir = tempfile::tempdir().unwrap();
        let journal = EventJournal::new(dir.path(), 1);
        let run_id = RunId::new();
        let mut writers = HashMap::new();

        let started = RuntimeEvent::RunStarted {
            run_id: run_id.clone(),
            goal_id: "g".into(),
            graph_id: "graph".into(),
        };
        journal.write_event(&mut writers, &started).await;
        assert_eq!(writers.len(), 1);

        let paused = RuntimeEvent::RunPaused {
            run_id: run_id.clone(),
            paused_at: "a".into(),
        };
        journal.write_event(&mut writers, &paused).await;
        assert!(writers.is_empty());

        let resumed = RuntimeEvent::RunResumed {
            run_id: run_id.clone(),
            node_id: "a".into(),
        };
        journal.write_event(&mut writers, &resumed).await;
        let completed = lifecycle(&run_id).pop().unwrap();
        journal.write_event(&mut writers, &completed).await;
        assert!(writers.is_empty());

        let types: Vec<String> = lines(&journal.path_for(&run_id))
            .iter()
            .map(|l| l["event_type"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(
            types,
            vec!["run_started", "run_paused", "run_resumed", "run_completed"]
        );
    }

    #[test]
    fn disabled_config_yields_no_journal() {
        let mut config = AppConfig::default();
        config.log = Some(waypoint_core::config::LogConfig {
            enabled: false,
            ..Default::default()
        });
        assert!(EventJournal::from_config(&config).is_none());
    }
}
