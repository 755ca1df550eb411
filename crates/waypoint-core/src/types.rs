use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::goal::GoalEvaluation;

/// Unique run identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(format!("run_{}", Uuid::new_v4().simple()))
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Session identifier. Pause flags are scoped to a session.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Paused,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Paused => "paused",
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "paused" => Ok(Self::Paused),
            other => Err(format!("unknown run status: {}", other)),
        }
    }
}

/// One option considered at a decision point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionOption {
    pub id: String,
    pub description: String,
}

impl DecisionOption {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
        }
    }
}

/// The result of acting on a decision.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Outcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default)]
    pub latency_ms: u64,
}

impl Outcome {
    pub fn success(result: serde_json::Value, summary: impl Into<String>) -> Self {
        Self {
            success: true,
            result: Some(result),
            summary: summary.into(),
            ..Default::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            success: false,
            summary: format!("failed: {}", error),
            error: Some(error),
            ..Default::default()
        }
    }

    pub fn with_metrics(mut self, tokens_used: u64, latency_ms: u64) -> Self {
        self.tokens_used = tokens_used;
        self.latency_ms = latency_ms;
        self
    }
}

/// A recorded decision at a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub id: String,
    pub node_id: String,
    pub intent: String,
    #[serde(default)]
    pub options: Vec<DecisionOption>,
    pub chosen: String,
    #[serde(default)]
    pub reasoning: String,
    pub timestamp: DateTime<Utc>,
    /// Attached at most once by the ledger.
    #[serde(default)]
    pub outcome: Option<Outcome>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProblemSeverity {
    Warning,
    Critical,
}

/// A problem surfaced during a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Problem {
    pub id: String,
    pub severity: ProblemSeverity,
    pub description: String,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub decision_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Aggregate counters maintained by the ledger.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunMetrics {
    pub total_decisions: usize,
    pub successful_decisions: usize,
    pub failed_decisions: usize,
    pub total_tokens: u64,
    #[serde(default)]
    pub nodes_executed: Vec<String>,
}

/// Where a paused run picks up again.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumePhase {
    /// Halted by the pause flag before the node started.
    #[default]
    BeforeNode,
    /// Halted by a HITL node after it produced output.
    AfterOutput,
    /// A node is suspended on a durable wait. The run stays `Running`; the
    /// checkpoint lets another process re-enter the node with the delivered
    /// signal if this one goes away.
    AwaitingSignal,
}

/// Executor checkpoint stored with a paused (or signal-waiting) run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResumeState {
    pub phase: ResumePhase,
    pub node_id: String,
    /// Session whose pause flag the resumed run keeps polling.
    #[serde(default)]
    pub session_id: SessionId,
    #[serde(default)]
    pub memory: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub visit_counts: HashMap<String, u32>,
    #[serde(default)]
    pub steps: usize,
    #[serde(default)]
    pub path: Vec<String>,
    #[serde(default)]
    pub last_output: HashMap<String, serde_json::Value>,
    /// Call depth of the executor entry that paused; 0 when unknown.
    #[serde(default)]
    pub call_depth: u32,
    #[serde(default)]
    pub max_call_depth: u32,
    /// Wait key the node was suspended on (`AwaitingSignal` only).
    #[serde(default)]
    pub wait_key: Option<String>,
    /// Decision of the suspended attempt, closed as interrupted on re-entry.
    #[serde(default)]
    pub decision_id: Option<String>,
}

/// One end-to-end execution of a graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub goal_id: String,
    #[serde(default)]
    pub description: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub input_data: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub output_data: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub decisions: Vec<Decision>,
    #[serde(default)]
    pub problems: Vec<Problem>,
    #[serde(default)]
    pub metrics: RunMetrics,
    #[serde(default)]
    pub paused_at: Option<String>,
    #[serde(default)]
    pub resume_state: Option<ResumeState>,
    #[serde(default)]
    pub evaluation: Option<GoalEvaluation>,
}

impl Run {
    pub fn new(
        goal_id: impl Into<String>,
        description: impl Into<String>,
        input_data: HashMap<String, serde_json::Value>,
    ) -> Self {
        Self {
            id: RunId::new(),
            goal_id: goal_id.into(),
            description: description.into(),
            status: RunStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            input_data,
            output_data: HashMap::new(),
            decisions: vec![],
            problems: vec![],
            metrics: RunMetrics::default(),
            paused_at: None,
            resume_state: None,
            evaluation: None,
        }
    }

    pub fn decision(&self, decision_id: &str) -> Option<&Decision> {
        self.decisions.iter().find(|d| d.id == decision_id)
    }

    /// Distinct node ids in first-visit order.
    pub fn nodes_touched(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for d in &self.decisions {
            if !seen.contains(&d.node_id) {
                seen.push(d.node_id.clone());
            }
        }
        seen
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.completed_at
            .map(|end| (end - self.started_at).num_milliseconds())
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            run_id: self.id.clone(),
            goal_id: self.goal_id.clone(),
            status: self.status,
            started_at: self.started_at,
            completed_at: self.completed_at,
            decision_count: self.decisions.len(),
            problem_count: self.problems.len(),
            paused_at: self.paused_at.clone(),
        }
    }
}

/// Compact view of a run for listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub goal_id: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub decision_count: usize,
    pub problem_count: usize,
    pub paused_at: Option<String>,
}
