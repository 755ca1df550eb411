use chrono::{DateTime, Utc};
use futures::future::BoxFuture;

use crate::error::Result;
use crate::evolution::AuditEntry;
use crate::types::{Run, RunId, RunStatus, SessionId};
use crate::wait::{SignalEnvelope, SignalOutcome, WaitKey, WaitRequest};

/// Run persistence backend.
///
/// Lookups of absent runs return `Ok(None)` / empty lists rather than errors.
/// Implementations must survive a crash mid-write without corrupting data.
pub trait RunStorage: Send + Sync + 'static {
    fn save_run(&self, run: &Run) -> BoxFuture<'_, Result<()>>;

    fn load_run(&self, run_id: &RunId) -> BoxFuture<'_, Result<Option<Run>>>;

    /// Returns false if the run did not exist.
    fn delete_run(&self, run_id: &RunId) -> BoxFuture<'_, Result<bool>>;

    fn list_all_runs(&self) -> BoxFuture<'_, Result<Vec<RunId>>>;

    fn runs_by_goal(&self, goal_id: &str) -> BoxFuture<'_, Result<Vec<RunId>>>;

    fn runs_by_status(&self, status: RunStatus) -> BoxFuture<'_, Result<Vec<RunId>>>;

    fn runs_by_node(&self, node_id: &str) -> BoxFuture<'_, Result<Vec<RunId>>>;
}

/// Durable store behind the wait runtime.
///
/// Every method is atomic with respect to the others: a request moves
/// Pending -> Ready|Expired -> Consumed exactly once, whatever the
/// interleaving of `signal`, `expire_due` and `drain_ready` callers.
pub trait WaitStore: Send + Sync + 'static {
    /// Persist a new pending request, assigning its id and FIFO sequence.
    fn insert_wait(
        &self,
        wait_key: &WaitKey,
        deadline: Option<DateTime<Utc>>,
    ) -> Result<WaitRequest>;

    /// Record an envelope and match it to the oldest pending request for the key.
    fn signal(&self, wait_key: &WaitKey, payload: serde_json::Value) -> Result<SignalOutcome>;

    /// Mark pending requests whose deadline is at or before `now` as expired.
    fn expire_due(&self, now: DateTime<Utc>) -> Result<usize>;

    /// Consume every ready or expired request, returning them in FIFO order.
    /// A returned request carries its envelope if it was signalled.
    fn drain_ready(&self) -> Result<Vec<WaitRequest>>;

    fn get(&self, request_id: &str) -> Result<Option<WaitRequest>>;

    fn pending_for_run(&self, run_id: &RunId) -> Result<Vec<WaitRequest>>;

    /// Consume all outstanding requests of a finished run.
    fn cancel_run(&self, run_id: &RunId) -> Result<usize>;

    fn signals(&self, wait_key: &WaitKey) -> Result<Vec<SignalEnvelope>>;
}

/// Durable, session-scoped pause flag polled before each node.
pub trait PauseChannel: Send + Sync + 'static {
    fn request_pause(&self, session: &SessionId) -> Result<()>;

    /// Check and clear the flag in one step.
    fn take_pause(&self, session: &SessionId) -> Result<bool>;

    fn is_pause_requested(&self, session: &SessionId) -> Result<bool>;
}

/// Append sink for evolution audit entries, independent of run storage.
pub trait RuntimeLogStore: Send + Sync + 'static {
    fn write(&self, entry: &AuditEntry) -> BoxFuture<'_, Result<()>>;
}
