use thiserror::Error;

#[derive(Debug, Error)]
pub enum WaypointError {
    // Graph errors
    #[error("Graph structure error: {0}")]
    GraphStructure(String),

    #[error("Node execution failed: {node_id}: {message}")]
    NodeExecution { node_id: String, message: String },

    #[error("Call depth {depth} exceeds limit {limit}")]
    RecursionLimit { depth: u32, limit: u32 },

    // Ledger errors
    #[error("No active run: {0}")]
    NoActiveRun(String),

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Decision not found: {0}")]
    DecisionNotFound(String),

    #[error("Outcome already recorded for decision {0}")]
    OutcomeAlreadyRecorded(String),

    #[error("Run {run_id} is not paused (status: {status})")]
    NotPaused { run_id: String, status: String },

    // Storage errors
    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Database error: {0}")]
    Database(String),

    // Wait errors
    #[error("Wait timed out: {wait_key}")]
    Timeout { wait_key: String },

    #[error("Wait runtime error: {0}")]
    Wait(String),

    // Evolution errors
    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("Invalid graph delta: {0}")]
    InvalidDelta(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl WaypointError {
    /// Errors that must end a run immediately instead of being retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::GraphStructure(_) | Self::RecursionLimit { .. }
        )
    }

    pub fn structure(msg: impl Into<String>) -> Self {
        Self::GraphStructure(msg.into())
    }

    pub fn node(node_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::NodeExecution {
            node_id: node_id.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, WaypointError>;
