//! Records shared by the durable wait runtime and its stores.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::RunId;

/// Correlation key for a suspended run. Scoped by run, so two runs can use
/// the same key string without colliding.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct WaitKey {
    pub run_id: RunId,
    pub key: String,
}

impl WaitKey {
    pub fn new(run_id: &RunId, key: impl Into<String>) -> Self {
        Self {
            run_id: run_id.clone(),
            key: key.into(),
        }
    }

    /// Key under which a HITL node awaits approval.
    pub fn approval(run_id: &RunId, node_id: &str) -> Self {
        Self::new(run_id, format!("approval:{}", node_id))
    }
}

impl std::fmt::Display for WaitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.run_id, self.key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitStatus {
    /// Waiting for a signal or deadline.
    Pending,
    /// Matched by a signal, awaiting delivery by `tick`.
    Ready,
    /// Deadline elapsed, awaiting delivery by `tick`.
    Expired,
    /// Delivered exactly once. Terminal.
    Consumed,
}

impl WaitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Expired => "expired",
            Self::Consumed => "consumed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "ready" => Some(Self::Ready),
            "expired" => Some(Self::Expired),
            "consumed" => Some(Self::Consumed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitRequest {
    pub id: String,
    pub wait_key: WaitKey,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    pub status: WaitStatus,
    /// Monotonic registration order; FIFO matching uses it.
    pub seq: u64,
    pub created_at: DateTime<Utc>,
    /// The envelope that satisfied this request, once matched.
    #[serde(default)]
    pub signal: Option<SignalEnvelope>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalEnvelope {
    pub wait_key: WaitKey,
    pub payload: serde_json::Value,
    /// Arrival order across all signals.
    pub seq: u64,
    pub received_at: DateTime<Utc>,
    #[serde(default)]
    pub matched_request: Option<String>,
}

/// What a `signal` call did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalOutcome {
    /// The oldest pending request for the key was scheduled for resumption.
    Scheduled { request_id: String },
    /// No outstanding request; the envelope was recorded and has no effect.
    NoWaiter,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ResumeReason {
    Signalled(serde_json::Value),
    TimedOut,
}

/// A delivered wait, produced once per request by `tick`.
#[derive(Debug, Clone)]
pub struct Resumption {
    pub request: WaitRequest,
    pub reason: ResumeReason,
    /// Whether an in-process waiter received it. Undelivered resumptions
    /// belong to runs that must be resumed through the executor.
    pub delivered: bool,
}

impl Resumption {
    pub fn run_id(&self) -> &RunId {
        &self.request.wait_key.run_id
    }

    pub fn payload(&self) -> Option<&serde_json::Value> {
        match &self.reason {
            ResumeReason::Signalled(p) => Some(p),
            ResumeReason::TimedOut => None,
        }
    }
}
